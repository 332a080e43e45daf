//! Split the session's labels across the two runs and allocate each run's
//! blocks.

use crate::block::{BlockAllocator, BlockPlan, LabelPair};
use crate::error::{DesignError, Result};
use crate::rng::SessionRng;
use crate::types::Label;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

pub const N_RUNS: usize = 2;

/// How labels map onto runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSplit {
    /// Each run gets its own half of the labels.
    Disjoint,
    /// Every run sees every label; the runs differ in how labels pair up.
    Shared,
}

impl RunSplit {
    /// `run_size` labels fit in one run. Twice that many labels split
    /// disjointly, exactly that many are shared.
    pub fn for_labels(n_labels: usize, run_size: usize) -> Result<Self> {
        if run_size > 0 && n_labels == run_size * N_RUNS {
            Ok(RunSplit::Disjoint)
        } else if run_size > 0 && n_labels == run_size {
            Ok(RunSplit::Shared)
        } else {
            Err(DesignError::InvalidDesign(format!(
                "{} labels do not fit runs of {} labels (need {} or {})",
                n_labels,
                run_size,
                run_size,
                run_size * N_RUNS
            )))
        }
    }
}

/// Shuffle, then deal labels round-robin into `n_runs` runs.
pub fn distribute_sequences_run(labels: &[Label], n_runs: usize, rng: &mut SessionRng) -> Vec<Vec<Label>> {
    let mut shuffled = labels.to_vec();
    shuffled.shuffle(rng);
    let mut runs = vec![Vec::new(); n_runs];
    for (i, label) in shuffled.into_iter().enumerate() {
        runs[i % n_runs].push(label);
    }
    runs
}

/// One run's labels and blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBlocks {
    pub labels: Vec<Label>,
    pub blocks: BlockPlan,
}

/// Labels kept apart across runs: no standalone label and no repeated pair
/// may occur in two runs.
pub fn check_cross_run(runs: &[RunBlocks]) -> Result<()> {
    let mut standalone: BTreeSet<Label> = BTreeSet::new();
    let mut pairs: BTreeSet<LabelPair> = BTreeSet::new();
    for (i, run) in runs.iter().enumerate() {
        for label in run.blocks.standalone_labels() {
            if !standalone.insert(label) {
                return Err(DesignError::InvalidDesign(format!(
                    "label {} is standalone in run {} and an earlier run",
                    label,
                    i + 1
                )));
            }
        }
        for pair in run.blocks.repeated_pairs() {
            if !pairs.insert(pair) {
                return Err(DesignError::InvalidDesign(format!(
                    "pair {}{} repeats in run {} and an earlier run",
                    pair.0,
                    pair.1,
                    i + 1
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RunAllocator {
    pub blocks: BlockAllocator,
    /// Repeated pairs each run must contain.
    pub target_repeated_pairs: usize,
    pub max_attempts: usize,
}

impl Default for RunAllocator {
    fn default() -> Self {
        Self {
            blocks: BlockAllocator::default(),
            target_repeated_pairs: 2,
            max_attempts: 10_000,
        }
    }
}

impl RunAllocator {
    pub fn run_size(&self) -> usize {
        self.blocks.n_blocks * self.blocks.block_size / 2
    }

    pub fn allocate(&self, labels: &[Label], rng: &mut SessionRng) -> Result<Vec<RunBlocks>> {
        let split = RunSplit::for_labels(labels.len(), self.run_size())?;
        for attempt in 1..=self.max_attempts {
            let run_labels = match split {
                RunSplit::Disjoint => distribute_sequences_run(labels, N_RUNS, rng),
                RunSplit::Shared => vec![labels.to_vec(); N_RUNS],
            };
            let mut runs = Vec::with_capacity(N_RUNS);
            for labels in run_labels {
                let blocks = self.gen_one_run(&labels, rng)?;
                runs.push(RunBlocks { labels, blocks });
            }
            match check_cross_run(&runs) {
                Ok(()) => {
                    debug!(attempt, ?split, "runs allocated");
                    return Ok(runs);
                }
                Err(err) => debug!(attempt, %err, "run split rejected"),
            }
        }
        Err(DesignError::InfeasibleDesign {
            component: "RunAllocator",
            attempts: self.max_attempts,
        })
    }

    /// Re-draw blocks until the run holds exactly the target number of
    /// repeated pairs.
    pub fn gen_one_run(&self, labels: &[Label], rng: &mut SessionRng) -> Result<BlockPlan> {
        for attempt in 1..=self.max_attempts {
            let plan = self.blocks.allocate(labels, rng)?;
            let repeated = plan.repeated_pairs().len();
            if repeated == self.target_repeated_pairs {
                debug!(attempt, "run blocks accepted");
                return Ok(plan);
            }
        }
        Err(DesignError::InfeasibleDesign {
            component: "RunAllocator",
            attempts: self.max_attempts,
        })
    }
}
