//! Reward-eligible labels and bonus payout.

use crate::error::{DesignError, Result};
use crate::rng::stream_rng;
use crate::types::Label;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Payout per point scored on a reward-eligible sequence.
pub const DEFAULT_REWARD_VALUE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardPlan {
    pub reward: Vec<Label>,
    pub no_reward: Vec<Label>,
}

impl RewardPlan {
    pub fn new(mut reward: Vec<Label>, mut no_reward: Vec<Label>, run_labels: &[Label]) -> Result<Self> {
        reward.sort();
        no_reward.sort();
        let plan = Self { reward, no_reward };
        plan.check(run_labels)?;
        Ok(plan)
    }

    /// Equal halves, disjoint, together covering the run.
    pub fn check(&self, run_labels: &[Label]) -> Result<()> {
        let reward: BTreeSet<Label> = self.reward.iter().copied().collect();
        let no_reward: BTreeSet<Label> = self.no_reward.iter().copied().collect();
        let run: BTreeSet<Label> = run_labels.iter().copied().collect();
        if reward.len() != self.reward.len() || no_reward.len() != self.no_reward.len() {
            return Err(DesignError::InvalidDesign("reward plan repeats a label".to_string()));
        }
        if reward.len() != no_reward.len() {
            return Err(DesignError::InvalidDesign(format!(
                "reward sets differ in size: {} vs {}",
                reward.len(),
                no_reward.len()
            )));
        }
        if !reward.is_disjoint(&no_reward) {
            return Err(DesignError::InvalidDesign(
                "a label is both rewarded and not rewarded".to_string(),
            ));
        }
        let union: BTreeSet<Label> = reward.union(&no_reward).copied().collect();
        if union != run {
            return Err(DesignError::InvalidDesign(format!(
                "reward plan covers {:?}, run holds {:?}",
                union, run
            )));
        }
        Ok(())
    }

    pub fn is_rewarded(&self, label: Label) -> bool {
        self.reward.contains(&label)
    }

    pub fn contains(&self, label: Label) -> bool {
        self.reward.contains(&label) || self.no_reward.contains(&label)
    }
}

/// Pick `n` reward-eligible labels for run `run` (1-based).
///
/// Draws come from a dedicated stream keyed by the run, so calling this again
/// anywhere in the session returns the same partition and never disturbs the
/// main session stream.
pub fn select(run_labels: &[Label], seed: u64, run: usize, n: usize) -> Result<RewardPlan> {
    if n * 2 != run_labels.len() {
        return Err(DesignError::InvalidDesign(format!(
            "cannot split {} labels into two halves of {}",
            run_labels.len(),
            n
        )));
    }
    let mut labels = run_labels.to_vec();
    labels.sort();
    let mut rng = stream_rng(seed, run as u64);
    labels.shuffle(&mut rng);
    let no_reward = labels.split_off(n);
    let plan = RewardPlan::new(labels, no_reward, run_labels)?;
    debug!(run, reward = ?plan.reward, "reward labels selected");
    Ok(plan)
}

/// Points on reward-eligible labels times `reward_value`.
pub fn bonus_payout(plan: &RewardPlan, scores: &BTreeMap<Label, u32>, reward_value: f64) -> Result<f64> {
    let mut total = 0.0;
    for (label, points) in scores {
        if !plan.contains(*label) {
            return Err(DesignError::InvalidDesign(format!(
                "score reported for label {} outside the run",
                label
            )));
        }
        if plan.is_rewarded(*label) {
            total += f64::from(*points) * reward_value;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(s: &str) -> Vec<Label> {
        s.chars().map(|c| Label::new(c).expect("label")).collect()
    }

    #[test]
    fn select_partitions_run_in_halves() {
        let run = labels("BDFHJL");
        for seed in 0..50 {
            let plan = select(&run, seed, 1, 3).expect("select");
            assert_eq!(plan.reward.len(), 3);
            assert_eq!(plan.no_reward.len(), 3);
            plan.check(&run).expect("partition");
        }
    }

    #[test]
    fn select_is_stable_and_order_independent() {
        let a = select(&labels("ABCDEF"), 99, 2, 3).expect("a");
        let b = select(&labels("FEDCBA"), 99, 2, 3).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn select_rejects_uneven_halves() {
        assert!(select(&labels("ABCDE"), 1, 1, 2).is_err());
    }

    #[test]
    fn payout_counts_only_rewarded_labels() {
        let run = labels("ABCDEF");
        let plan = RewardPlan::new(labels("ACE"), labels("BDF"), &run).expect("plan");
        let scores: BTreeMap<Label, u32> = labels("ABCF").into_iter().zip([3, 5, 2, 4]).collect();
        let payout = bonus_payout(&plan, &scores, DEFAULT_REWARD_VALUE).expect("payout");
        assert!((payout - 2.5).abs() < 1e-9);
    }

    #[test]
    fn payout_rejects_foreign_labels() {
        let run = labels("ABCDEF");
        let plan = RewardPlan::new(labels("ACE"), labels("BDF"), &run).expect("plan");
        let scores: BTreeMap<Label, u32> = labels("Z").into_iter().zip([1]).collect();
        assert!(matches!(
            bonus_payout(&plan, &scores, 0.5),
            Err(DesignError::InvalidDesign(_))
        ));
    }

    #[test]
    fn constructor_rejects_overlap() {
        let run = labels("ABCD");
        assert!(RewardPlan::new(labels("AB"), labels("BC"), &run).is_err());
    }
}
