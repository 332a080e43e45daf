//! Order questions asked after each trial.
//!
//! A question shows the item at the cue position of a sequence and asks for
//! the item at the target position.

use crate::error::{DesignError, Result};
use crate::rng::SessionRng;
use crate::trial::TrialPlan;
use crate::types::{Label, Modality, SEQUENCE_LEN};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const CUE_POSITION: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub label: Label,
    pub cue: usize,
    pub target: usize,
    pub modality: Modality,
}

/// Tracks targets already asked per label within one run.
#[derive(Debug, Default)]
pub struct QuestionPlanner {
    used: BTreeMap<Label, BTreeSet<usize>>,
}

impl QuestionPlanner {
    /// Cue and target for `label`. Targets avoid earlier ones for the same
    /// label until every position has been asked.
    pub fn draw_two(&mut self, label: Label, rng: &mut SessionRng) -> (usize, usize) {
        let used = self.used.entry(label).or_default();
        let mut candidates: Vec<usize> = (1..SEQUENCE_LEN).filter(|p| !used.contains(p)).collect();
        if candidates.is_empty() {
            candidates = (1..SEQUENCE_LEN).collect();
        }
        let target = candidates[rng.gen_range(0..candidates.len())];
        used.insert(target);
        (CUE_POSITION, target)
    }

    /// One question per label per trial, in first-pass order.
    pub fn plan_block(
        &mut self,
        trials: &TrialPlan,
        modalities: &[Vec<Modality>],
        rng: &mut SessionRng,
    ) -> Result<Vec<Vec<Question>>> {
        if modalities.len() != trials.len() {
            return Err(DesignError::InvalidDesign(format!(
                "{} trials but {} question modality lists",
                trials.len(),
                modalities.len()
            )));
        }
        let mut block = Vec::with_capacity(trials.len());
        for (t, trial_modalities) in modalities.iter().enumerate() {
            let order = trials.first_pass(t).unwrap_or_default();
            if order.len() != trial_modalities.len() {
                return Err(DesignError::InvalidDesign(format!(
                    "trial {} asks {} questions with {} modalities",
                    t + 1,
                    order.len(),
                    trial_modalities.len()
                )));
            }
            let questions = order
                .iter()
                .zip(trial_modalities)
                .map(|(&label, &modality)| {
                    let (cue, target) = self.draw_two(label, rng);
                    Question {
                        label,
                        cue,
                        target,
                        modality,
                    }
                })
                .collect();
            block.push(questions);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::session_rng;
    use crate::trial::order;

    #[test]
    fn targets_cycle_through_every_position_before_repeating() {
        let label = Label::new('A').expect("label");
        let mut planner = QuestionPlanner::default();
        let mut rng = session_rng(8);
        let mut first_five: Vec<usize> = (0..5).map(|_| planner.draw_two(label, &mut rng).1).collect();
        first_five.sort_unstable();
        assert_eq!(first_five, vec![1, 2, 3, 4, 5]);
        let (cue, sixth) = planner.draw_two(label, &mut rng);
        assert_eq!(cue, CUE_POSITION);
        assert!((1..SEQUENCE_LEN).contains(&sixth));
    }

    #[test]
    fn block_questions_follow_first_pass_order() {
        let block: Vec<Label> = "CAE".chars().map(|c| Label::new(c).expect("label")).collect();
        let trials = order(&block, 3).expect("trials");
        let modalities = vec![vec![Modality::Image, Modality::Text, Modality::Text]; 3];
        let mut planner = QuestionPlanner::default();
        let questions = planner
            .plan_block(&trials, &modalities, &mut session_rng(1))
            .expect("questions");
        assert_eq!(questions.len(), 3);
        for (t, trial) in questions.iter().enumerate() {
            let asked: Vec<Label> = trial.iter().map(|q| q.label).collect();
            assert_eq!(Some(asked.as_slice()), trials.first_pass(t));
            assert_eq!(trial[0].modality, Modality::Image);
        }
    }

    #[test]
    fn mismatched_modalities_are_rejected() {
        let block: Vec<Label> = "ABC".chars().map(|c| Label::new(c).expect("label")).collect();
        let trials = order(&block, 3).expect("trials");
        let mut planner = QuestionPlanner::default();
        assert!(planner
            .plan_block(&trials, &[vec![Modality::Image]], &mut session_rng(1))
            .is_err());
    }
}
