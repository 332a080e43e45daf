//! Error taxonomy for design generation.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    /// Stimulus catalog does not fit the structure table. Fatal before any allocation.
    #[error("catalog mismatch: {0}")]
    CatalogMismatch(String),

    /// A rejection-sampling loop ran out of attempts.
    #[error("infeasible design: {component} found no valid allocation after {attempts} attempts")]
    InfeasibleDesign {
        component: &'static str,
        attempts: usize,
    },

    #[error("missing seed file {path}: run 1 must be executed first")]
    MissingSeed { path: PathBuf },

    #[error("invalid participant id '{0}': expected a non-negative integer")]
    InvalidParticipant(String),

    #[error("invalid seed file {path}: {reason}")]
    InvalidSeedFile { path: PathBuf, reason: String },

    #[error("seed file {path} already holds seed {existing}, refusing to overwrite with {requested}")]
    SeedConflict {
        path: PathBuf,
        existing: u64,
        requested: u64,
    },

    #[error("invalid design: {0}")]
    InvalidDesign(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DesignError {
    /// Stable machine-readable code for operator tooling.
    pub fn code(&self) -> &'static str {
        match self {
            DesignError::CatalogMismatch(_) => "catalog_mismatch",
            DesignError::InfeasibleDesign { .. } => "infeasible_design",
            DesignError::MissingSeed { .. } => "missing_seed",
            DesignError::InvalidParticipant(_) => "invalid_participant",
            DesignError::InvalidSeedFile { .. } => "invalid_seed_file",
            DesignError::SeedConflict { .. } => "seed_conflict",
            DesignError::InvalidDesign(_) => "invalid_design",
            DesignError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DesignError>;
