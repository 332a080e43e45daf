//! Auditory cue per sequence.

use crate::error::{DesignError, Result};
use crate::rng::SessionRng;
use crate::types::Label;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;

/// Shuffle `tones` and hand one to each label in label order. An empty tone
/// list means the session has no cues and draws nothing.
pub fn assign_tones(labels: &[Label], tones: &[String], rng: &mut SessionRng) -> Result<BTreeMap<Label, String>> {
    if tones.is_empty() {
        return Ok(BTreeMap::new());
    }
    if tones.len() < labels.len() {
        return Err(DesignError::InvalidDesign(format!(
            "{} tones for {} sequences",
            tones.len(),
            labels.len()
        )));
    }
    let mut sorted = labels.to_vec();
    sorted.sort();
    let mut shuffled = tones.to_vec();
    shuffled.shuffle(rng);
    Ok(sorted.into_iter().zip(shuffled).collect())
}
