//! Participant seed derivation and persistence.
//!
//! The seed is written once, before run 1, into the participant directory and
//! read back for run 2 and after a crash restart.

use crate::error::{DesignError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SEED_FILE: &str = "seed.txt";

/// Identity-like mapping from participant id to seed: the id's integer value.
pub fn derive_seed(participant_id: &str) -> Result<u64> {
    participant_id
        .trim()
        .parse::<u64>()
        .map_err(|_| DesignError::InvalidParticipant(participant_id.to_string()))
}

pub fn seed_path(dir: &Path) -> PathBuf {
    dir.join(SEED_FILE)
}

/// Write `seed` to the canonical seed file under `dir`. Re-persisting the same
/// seed is a no-op; a different seed is refused.
pub fn persist(seed: u64, dir: &Path) -> Result<PathBuf> {
    let path = seed_path(dir);
    if path.exists() {
        let existing = recover(dir)?;
        if existing != seed {
            return Err(DesignError::SeedConflict {
                path,
                existing,
                requested: seed,
            });
        }
        debug!(path = %path.display(), seed, "seed already persisted");
        return Ok(path);
    }
    fs::create_dir_all(dir)?;
    let tmp = path.with_file_name(format!(".{}.tmp.{}", SEED_FILE, std::process::id()));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(format!("{}\n", seed).as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    info!(path = %path.display(), seed, "seed persisted");
    Ok(path)
}

pub fn recover(dir: &Path) -> Result<u64> {
    let path = seed_path(dir);
    if !path.exists() {
        return Err(DesignError::MissingSeed { path });
    }
    let raw = fs::read_to_string(&path)?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| DesignError::InvalidSeedFile {
            path: path.clone(),
            reason: e.to_string(),
        })
}
