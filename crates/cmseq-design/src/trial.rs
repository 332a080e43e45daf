//! Trial orders within a block.

use crate::error::{DesignError, Result};
use crate::types::Label;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Presentation orders of one block, trial 1 first. Each entry is the
/// first-pass order followed by the same order again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialPlan {
    trials: Vec<Vec<Label>>,
}

impl TrialPlan {
    pub fn new(trials: Vec<Vec<Label>>, block_labels: &[Label]) -> Result<Self> {
        check_trial_invariants(&trials, block_labels)?;
        Ok(Self { trials })
    }

    pub fn trials(&self) -> &[Vec<Label>] {
        &self.trials
    }

    /// Trial by 1-based index.
    pub fn trial(&self, index: usize) -> Option<&[Label]> {
        index
            .checked_sub(1)
            .and_then(|i| self.trials.get(i))
            .map(|t| t.as_slice())
    }

    /// First pass of trial `i` (0-based).
    pub fn first_pass(&self, i: usize) -> Option<&[Label]> {
        self.trials.get(i).map(|t| &t[..t.len() / 2])
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }
}

pub fn check_trial_invariants(trials: &[Vec<Label>], block_labels: &[Label]) -> Result<()> {
    let expected: BTreeSet<Label> = block_labels.iter().copied().collect();
    let k = block_labels.len();
    let mut history: Vec<BTreeSet<Label>> = vec![BTreeSet::new(); k];
    for (t, trial) in trials.iter().enumerate() {
        if trial.len() != 2 * k {
            return Err(DesignError::InvalidDesign(format!(
                "trial {} has {} entries, expected {}",
                t + 1,
                trial.len(),
                2 * k
            )));
        }
        let (first, second) = trial.split_at(k);
        if first != second {
            return Err(DesignError::InvalidDesign(format!(
                "trial {} second pass differs from the first: {:?}",
                t + 1,
                trial
            )));
        }
        if first.iter().copied().collect::<BTreeSet<_>>() != expected {
            return Err(DesignError::InvalidDesign(format!(
                "trial {} order {:?} is not a permutation of the block labels",
                t + 1,
                first
            )));
        }
        for (pos, label) in first.iter().enumerate() {
            if !history[pos].insert(*label) {
                return Err(DesignError::InvalidDesign(format!(
                    "label {} sits at position {} in more than one trial",
                    label, pos
                )));
            }
        }
    }
    Ok(())
}

/// Greedy scan over the permutations of `block_labels`: keep a permutation
/// when none of its labels already occupied the same position in a kept one.
pub fn order(block_labels: &[Label], n_trials: usize) -> Result<TrialPlan> {
    let k = block_labels.len();
    let mut history: Vec<BTreeSet<Label>> = vec![BTreeSet::new(); k];
    let mut selected: Vec<Vec<Label>> = Vec::with_capacity(n_trials);
    let mut scanned = 0usize;
    for perm in block_labels.iter().copied().permutations(k) {
        if selected.len() == n_trials {
            break;
        }
        scanned += 1;
        let free = perm
            .iter()
            .enumerate()
            .all(|(pos, label)| !history[pos].contains(label));
        if !free {
            continue;
        }
        for (pos, label) in perm.iter().enumerate() {
            history[pos].insert(*label);
        }
        selected.push(perm);
    }
    if selected.len() < n_trials {
        return Err(DesignError::InfeasibleDesign {
            component: "TrialOrderAllocator",
            attempts: scanned,
        });
    }
    debug!(?block_labels, scanned, "trial orders selected");
    let trials = selected
        .into_iter()
        .map(|perm| perm.iter().chain(perm.iter()).copied().collect())
        .collect();
    TrialPlan::new(trials, block_labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(s: &str) -> Vec<Label> {
        s.chars().map(|c| Label::new(c).expect("label")).collect()
    }

    #[test]
    fn greedy_scan_yields_latin_square() {
        let plan = order(&labels("ABC"), 3).expect("order");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.trial(1), Some(labels("ABCABC").as_slice()));
        assert_eq!(plan.trial(2), Some(labels("BCABCA").as_slice()));
        assert_eq!(plan.trial(3), Some(labels("CABCAB").as_slice()));
    }

    #[test]
    fn scan_starts_from_block_order() {
        let plan = order(&labels("FAD"), 3).expect("order");
        assert_eq!(plan.first_pass(0), Some(labels("FAD").as_slice()));
        check_trial_invariants(plan.trials(), &labels("FAD")).expect("invariants");
    }

    #[test]
    fn too_many_trials_is_infeasible() {
        let err = order(&labels("ABC"), 4).expect_err("only 3 positions");
        assert!(matches!(
            err,
            DesignError::InfeasibleDesign { component: "TrialOrderAllocator", .. }
        ));
    }

    #[test]
    fn invariants_reject_positional_repeat() {
        let block = labels("ABC");
        let trials = vec![labels("ABCABC"), labels("ACBACB")];
        let err = check_trial_invariants(&trials, &block).expect_err("A twice at position 0");
        assert!(err.to_string().contains("position 0"), "{}", err);
    }

    #[test]
    fn invariants_reject_mismatched_second_pass() {
        let block = labels("ABC");
        let trials = vec![labels("ABCCBA")];
        assert!(TrialPlan::new(trials, &block).is_err());
    }
}
