//! Image/text balancing.
//!
//! Both balancers deal from closed-form split catalogs: a list of
//! `(img, txt)` counts per block whose totals are equal by construction. The
//! RNG only decides which block gets which split and the order inside it, so
//! there is nothing to reject.

use crate::error::{DesignError, Result};
use crate::rng::SessionRng;
use crate::types::Modality;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// `(img, txt)` counts.
pub type Split = (usize, usize);

/// Split catalog for `n_blocks` blocks of `per_block` slots each. Even blocks
/// split down the middle; odd blocks lean image in half of the blocks and
/// text in the other half.
pub fn balanced_splits(n_blocks: usize, per_block: usize) -> Result<Vec<Split>> {
    let half = per_block / 2;
    if per_block % 2 == 0 {
        return Ok(vec![(half, half); n_blocks]);
    }
    if n_blocks % 2 != 0 {
        return Err(DesignError::InvalidDesign(format!(
            "{} blocks of {} slots cannot balance image and text",
            n_blocks, per_block
        )));
    }
    let mut splits = vec![(half + 1, half); n_blocks / 2];
    splits.extend(vec![(half, half + 1); n_blocks / 2]);
    Ok(splits)
}

/// Spread `img` image slots over `n_trials` trials of `per_trial` slots, as
/// evenly as possible, earlier trials taking the remainder.
pub fn trial_splits(img: usize, n_trials: usize, per_trial: usize) -> Result<Vec<Split>> {
    if n_trials == 0 || img > n_trials * per_trial {
        return Err(DesignError::InvalidDesign(format!(
            "{} image slots do not fit {} trials of {}",
            img, n_trials, per_trial
        )));
    }
    let base = img / n_trials;
    let extra = img % n_trials;
    Ok((0..n_trials)
        .map(|t| {
            let k = base + usize::from(t < extra);
            (k, per_trial - k)
        })
        .collect())
}

fn expand(split: Split, rng: &mut SessionRng) -> Vec<Modality> {
    let mut slots = vec![Modality::Image; split.0];
    slots.extend(vec![Modality::Text; split.1]);
    slots.shuffle(rng);
    slots
}

/// Count `(img, txt)` over any modality iterator.
pub fn count<'a>(modalities: impl IntoIterator<Item = &'a Modality>) -> Split {
    modalities.into_iter().fold((0, 0), |(i, t), m| match m {
        Modality::Image => (i + 1, t),
        Modality::Text => (i, t + 1),
    })
}

/// Presentation modalities of a trial's stimulus stream: alternating, starting
/// with `opening`.
pub fn stream_modalities(opening: Modality, len: usize) -> Vec<Modality> {
    (0..len)
        .map(|i| if i % 2 == 0 { opening } else { opening.other() })
        .collect()
}

/// Modalities of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityPlan {
    /// Block -> trial -> modality of the first stimulus.
    pub opening: Vec<Vec<Modality>>,
    /// Block -> trial -> question -> modality.
    pub questions: Vec<Vec<Vec<Modality>>>,
}

impl ModalityPlan {
    /// Shape and aggregate balance. Totals with an odd slot count may differ
    /// by one.
    pub fn check(&self, n_blocks: usize, n_trials: usize, questions_per_trial: usize) -> Result<()> {
        let shape_ok = self.opening.len() == n_blocks
            && self.questions.len() == n_blocks
            && self.opening.iter().all(|b| b.len() == n_trials)
            && self
                .questions
                .iter()
                .all(|b| b.len() == n_trials && b.iter().all(|t| t.len() == questions_per_trial));
        if !shape_ok {
            return Err(DesignError::InvalidDesign(format!(
                "modality plan does not match {} blocks x {} trials x {} questions",
                n_blocks, n_trials, questions_per_trial
            )));
        }
        let opening = count(self.opening.iter().flatten());
        if opening.0.abs_diff(opening.1) > 1 {
            return Err(DesignError::InvalidDesign(format!(
                "opening modalities unbalanced: {} img vs {} txt",
                opening.0, opening.1
            )));
        }
        let questions = count(self.questions.iter().flatten().flatten());
        if questions.0.abs_diff(questions.1) > 1 {
            return Err(DesignError::InvalidDesign(format!(
                "question modalities unbalanced: {} img vs {} txt",
                questions.0, questions.1
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ModalityAllocator {
    pub n_blocks: usize,
    pub n_trials: usize,
    pub questions_per_trial: usize,
}

impl ModalityAllocator {
    /// Opening modality for every trial of every block.
    pub fn opening(&self, rng: &mut SessionRng) -> Result<Vec<Vec<Modality>>> {
        let mut splits = balanced_splits(self.n_blocks, self.n_trials)?;
        splits.shuffle(rng);
        Ok(splits.into_iter().map(|s| expand(s, rng)).collect())
    }

    /// Question modalities: a per-block split of all the block's questions,
    /// spread over its trials in shuffled order.
    pub fn questions(&self, rng: &mut SessionRng) -> Result<Vec<Vec<Vec<Modality>>>> {
        let mut splits = balanced_splits(self.n_blocks, self.n_trials * self.questions_per_trial)?;
        splits.shuffle(rng);
        let mut blocks = Vec::with_capacity(self.n_blocks);
        for (img, _) in splits {
            let mut per_trial = trial_splits(img, self.n_trials, self.questions_per_trial)?;
            per_trial.shuffle(rng);
            blocks.push(per_trial.into_iter().map(|s| expand(s, rng)).collect());
        }
        Ok(blocks)
    }

    pub fn allocate(&self, rng: &mut SessionRng) -> Result<ModalityPlan> {
        let opening = self.opening(rng)?;
        let questions = self.questions(rng)?;
        let plan = ModalityPlan { opening, questions };
        plan.check(self.n_blocks, self.n_trials, self.questions_per_trial)?;
        debug!(opening = ?plan.opening, "modalities allocated");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::session_rng;

    fn allocator() -> ModalityAllocator {
        ModalityAllocator {
            n_blocks: 4,
            n_trials: 3,
            questions_per_trial: 3,
        }
    }

    #[test]
    fn split_catalogs_match_the_fixed_layouts() {
        assert_eq!(balanced_splits(4, 3).expect("opening"), vec![(2, 1), (2, 1), (1, 2), (1, 2)]);
        assert_eq!(balanced_splits(4, 9).expect("questions"), vec![(5, 4), (5, 4), (4, 5), (4, 5)]);
        assert_eq!(trial_splits(5, 3, 3).expect("more img"), vec![(2, 1), (2, 1), (1, 2)]);
        assert_eq!(trial_splits(4, 3, 3).expect("more txt"), vec![(2, 1), (1, 2), (1, 2)]);
        assert!(balanced_splits(3, 3).is_err());
    }

    #[test]
    fn run_totals_are_exactly_balanced() {
        for seed in 0..100 {
            let plan = allocator().allocate(&mut session_rng(seed)).expect("allocate");
            assert_eq!(count(plan.opening.iter().flatten()), (6, 6));
            assert_eq!(count(plan.questions.iter().flatten().flatten()), (18, 18));
            for block in &plan.questions {
                let (img, txt) = count(block.iter().flatten());
                assert!((img, txt) == (5, 4) || (img, txt) == (4, 5));
            }
        }
    }

    #[test]
    fn stream_alternates_from_opening() {
        use Modality::{Image, Text};
        assert_eq!(stream_modalities(Text, 6), vec![Text, Image, Text, Image, Text, Image]);
        assert_eq!(stream_modalities(Image, 3), vec![Image, Text, Image]);
    }

    #[test]
    fn check_rejects_unbalanced_plan() {
        let mut plan = allocator().allocate(&mut session_rng(4)).expect("allocate");
        for block in plan.opening.iter_mut() {
            for m in block.iter_mut() {
                *m = Modality::Image;
            }
        }
        let err = plan.check(4, 3, 3).expect_err("all image");
        assert!(err.to_string().contains("opening modalities unbalanced"), "{}", err);
    }
}
