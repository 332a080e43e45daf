//! The resolved experiment plan.
//!
//! [`ExperimentPlan::generate`] is the only place the allocators are called in
//! sequence. The draw order on the session RNG is fixed:
//!
//! 1. sequence instantiation
//! 2. run split and block allocation for both runs
//! 3. per run: trial orders (no draws), opening modalities, question
//!    modalities, question targets
//! 4. cue tones
//!
//! Reward partitions use their own per-run streams.

use crate::block::{check_block_invariants, BlockAllocator, BlockPlan, LabelPair};
use crate::catalog::Catalog;
use crate::cue::assign_tones;
use crate::error::{DesignError, Result};
use crate::instantiate::instantiate;
use crate::modality::{stream_modalities, ModalityAllocator, ModalityPlan};
use crate::question::{Question, QuestionPlanner, CUE_POSITION};
use crate::reward::{select, RewardPlan};
use crate::rng::session_rng;
use crate::run::{check_cross_run, RunAllocator, RunBlocks, RunSplit, N_RUNS};
use crate::structures::CanonicalStructure;
use crate::trial::{check_trial_invariants, order, TrialPlan};
use crate::types::{Label, Modality, SequenceSet, SEQUENCE_LEN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

pub const PLAN_SCHEMA_VERSION: &str = "cmseq_plan_v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignParams {
    pub n_blocks: usize,
    pub block_size: usize,
    pub n_trials: usize,
    pub target_repeated_pairs: usize,
    pub reward_per_run: usize,
    /// Budget for every rejection loop.
    pub max_attempts: usize,
    pub tones: Vec<String>,
}

impl Default for DesignParams {
    fn default() -> Self {
        Self {
            n_blocks: 4,
            block_size: 3,
            n_trials: 3,
            target_repeated_pairs: 2,
            reward_per_run: 3,
            max_attempts: 10_000,
            tones: Vec::new(),
        }
    }
}

impl DesignParams {
    pub fn run_size(&self) -> usize {
        self.n_blocks * self.block_size / 2
    }

    pub fn validate(&self, n_labels: usize) -> Result<()> {
        let fail = |msg: String| Err(DesignError::InvalidDesign(msg));
        if self.n_blocks == 0 || self.n_blocks % 2 != 0 {
            return fail(format!("n_blocks must be even and positive, got {}", self.n_blocks));
        }
        if self.block_size == 0 {
            return fail("block_size must be positive".to_string());
        }
        if self.n_trials == 0 || self.n_trials > self.block_size {
            return fail(format!(
                "n_trials must be between 1 and block_size ({}), got {}",
                self.block_size, self.n_trials
            ));
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be positive".to_string());
        }
        RunSplit::for_labels(n_labels, self.run_size())?;
        if self.reward_per_run * 2 != self.run_size() {
            return fail(format!(
                "reward_per_run must be half of the {} labels in a run, got {}",
                self.run_size(),
                self.reward_per_run
            ));
        }
        if !self.tones.is_empty() && self.tones.len() < n_labels {
            return fail(format!("{} tones for {} sequences", self.tones.len(), n_labels));
        }
        Ok(())
    }

    fn run_allocator(&self) -> RunAllocator {
        RunAllocator {
            blocks: BlockAllocator {
                n_blocks: self.n_blocks,
                block_size: self.block_size,
                max_attempts: self.max_attempts,
            },
            target_repeated_pairs: self.target_repeated_pairs,
            max_attempts: self.max_attempts,
        }
    }

    fn modality_allocator(&self) -> ModalityAllocator {
        ModalityAllocator {
            n_blocks: self.n_blocks,
            n_trials: self.n_trials,
            questions_per_trial: self.block_size,
        }
    }
}

/// Everything one run needs, block 1 / trial 1 first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    /// 1-based.
    pub index: usize,
    pub labels: Vec<Label>,
    pub blocks: BlockPlan,
    /// One per block.
    pub trials: Vec<TrialPlan>,
    pub modalities: ModalityPlan,
    /// Block -> trial -> question.
    pub questions: Vec<Vec<Vec<Question>>>,
    pub rewards: RewardPlan,
}

impl RunPlan {
    pub fn repeated_pairs(&self) -> BTreeSet<LabelPair> {
        self.blocks.repeated_pairs()
    }

    /// Modalities of every presentation in trial `t` of block `b` (both 0-based).
    pub fn stream(&self, b: usize, t: usize) -> Option<Vec<Modality>> {
        let opening = *self.modalities.opening.get(b)?.get(t)?;
        let len = self.trials.get(b)?.trials().get(t)?.len();
        Some(stream_modalities(opening, len))
    }

    fn check(&self, params: &DesignParams, seed: u64) -> Result<()> {
        check_block_invariants(self.blocks.blocks(), &self.labels)?;
        if self.blocks.len() != params.n_blocks
            || self.blocks.blocks().iter().any(|b| b.len() != params.block_size)
        {
            return Err(DesignError::InvalidDesign(format!(
                "run {} blocks do not match {} x {}",
                self.index, params.n_blocks, params.block_size
            )));
        }
        if self.repeated_pairs().len() != params.target_repeated_pairs {
            return Err(DesignError::InvalidDesign(format!(
                "run {} has {} repeated pairs, expected {}",
                self.index,
                self.repeated_pairs().len(),
                params.target_repeated_pairs
            )));
        }
        if self.trials.len() != params.n_blocks {
            return Err(DesignError::InvalidDesign(format!(
                "run {} has trial orders for {} blocks",
                self.index,
                self.trials.len()
            )));
        }
        for (block, trials) in self.blocks.blocks().iter().zip(&self.trials) {
            if trials.len() != params.n_trials {
                return Err(DesignError::InvalidDesign(format!(
                    "run {} block {:?} has {} trials",
                    self.index,
                    block,
                    trials.len()
                )));
            }
            check_trial_invariants(trials.trials(), block)?;
        }
        self.modalities
            .check(params.n_blocks, params.n_trials, params.block_size)?;
        self.check_questions()?;
        self.rewards.check(&self.labels)?;
        let expected = select(&self.labels, seed, self.index, params.reward_per_run)?;
        if expected != self.rewards {
            return Err(DesignError::InvalidDesign(format!(
                "run {} reward labels do not match the seed",
                self.index
            )));
        }
        Ok(())
    }

    fn check_questions(&self) -> Result<()> {
        if self.questions.len() != self.trials.len() {
            return Err(DesignError::InvalidDesign(format!(
                "run {} has questions for {} blocks",
                self.index,
                self.questions.len()
            )));
        }
        for (b, (block_questions, trials)) in self.questions.iter().zip(&self.trials).enumerate() {
            for (t, trial_questions) in block_questions.iter().enumerate() {
                let asked: Vec<Label> = trial_questions.iter().map(|q| q.label).collect();
                let planned_modalities = self.modalities.questions.get(b).and_then(|m| m.get(t));
                let modalities: Vec<Modality> = trial_questions.iter().map(|q| q.modality).collect();
                let positions_ok = trial_questions
                    .iter()
                    .all(|q| q.cue == CUE_POSITION && (1..SEQUENCE_LEN).contains(&q.target));
                if block_questions.len() != trials.len()
                    || trials.first_pass(t) != Some(asked.as_slice())
                    || planned_modalities != Some(&modalities)
                    || !positions_ok
                {
                    return Err(DesignError::InvalidDesign(format!(
                        "run {} block {} trial {} questions do not match the plan",
                        self.index,
                        b + 1,
                        t + 1
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    pub schema_version: String,
    pub seed: u64,
    pub params: DesignParams,
    pub split: RunSplit,
    pub sequences: SequenceSet,
    pub runs: Vec<RunPlan>,
    /// Empty when the session has no cue tones.
    pub tones: BTreeMap<Label, String>,
}

impl ExperimentPlan {
    pub fn generate(
        seed: u64,
        structures: &[CanonicalStructure],
        catalog: &Catalog,
        params: &DesignParams,
    ) -> Result<Self> {
        params.validate(structures.len())?;
        let mut rng = session_rng(seed);

        let sequences = instantiate(structures, catalog, &mut rng)?;
        let labels = sequences.labels();
        let split = RunSplit::for_labels(labels.len(), params.run_size())?;
        let run_blocks = params.run_allocator().allocate(&labels, &mut rng)?;

        let modality_allocator = params.modality_allocator();
        let mut runs = Vec::with_capacity(N_RUNS);
        for (i, RunBlocks { labels: run_labels, blocks }) in run_blocks.into_iter().enumerate() {
            let index = i + 1;
            let trials = blocks
                .blocks()
                .iter()
                .map(|block| order(block, params.n_trials))
                .collect::<Result<Vec<_>>>()?;
            let modalities = modality_allocator.allocate(&mut rng)?;
            let mut planner = QuestionPlanner::default();
            let mut questions = Vec::with_capacity(trials.len());
            for (block_trials, block_modalities) in trials.iter().zip(&modalities.questions) {
                questions.push(planner.plan_block(block_trials, block_modalities, &mut rng)?);
            }
            let rewards = select(&run_labels, seed, index, params.reward_per_run)?;
            runs.push(RunPlan {
                index,
                labels: run_labels,
                blocks,
                trials,
                modalities,
                questions,
                rewards,
            });
        }

        let tones = assign_tones(&labels, &params.tones, &mut rng)?;
        let plan = ExperimentPlan {
            schema_version: PLAN_SCHEMA_VERSION.to_string(),
            seed,
            params: params.clone(),
            split,
            sequences,
            runs,
            tones,
        };
        plan.validate()?;
        info!(seed, ?split, sequences = labels.len(), "experiment plan generated");
        Ok(plan)
    }

    pub fn run(&self, index: usize) -> Option<&RunPlan> {
        self.runs.iter().find(|r| r.index == index)
    }

    /// Re-check every invariant. Used before persisting and after loading.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != PLAN_SCHEMA_VERSION {
            return Err(DesignError::InvalidDesign(format!(
                "unsupported plan schema '{}'",
                self.schema_version
            )));
        }
        let labels = self.sequences.labels();
        self.params.validate(labels.len())?;
        let split = RunSplit::for_labels(labels.len(), self.params.run_size())?;
        if split != self.split || self.runs.len() != N_RUNS {
            return Err(DesignError::InvalidDesign(format!(
                "plan split {:?} over {} runs does not fit {} sequences",
                self.split,
                self.runs.len(),
                labels.len()
            )));
        }
        self.check_sequences()?;

        let known: BTreeSet<Label> = labels.iter().copied().collect();
        let mut run_blocks = Vec::with_capacity(self.runs.len());
        for (i, run) in self.runs.iter().enumerate() {
            if run.index != i + 1 {
                return Err(DesignError::InvalidDesign(format!(
                    "run at position {} is numbered {}",
                    i + 1,
                    run.index
                )));
            }
            if let Some(label) = run.labels.iter().find(|l| !known.contains(l)) {
                return Err(DesignError::InvalidDesign(format!(
                    "run {} uses unknown label {}",
                    run.index, label
                )));
            }
            run.check(&self.params, self.seed)?;
            run_blocks.push(RunBlocks {
                labels: run.labels.clone(),
                blocks: run.blocks.clone(),
            });
        }
        let covered: BTreeSet<Label> = self.runs.iter().flat_map(|r| r.labels.iter().copied()).collect();
        if covered != known {
            return Err(DesignError::InvalidDesign(
                "runs do not cover every sequence".to_string(),
            ));
        }
        if split == RunSplit::Disjoint {
            let total: usize = self.runs.iter().map(|r| r.labels.len()).sum();
            if total != known.len() {
                return Err(DesignError::InvalidDesign(
                    "disjoint runs share a label".to_string(),
                ));
            }
        }
        check_cross_run(&run_blocks)?;

        if !self.tones.is_empty() && self.tones.keys().copied().collect::<BTreeSet<_>>() != known {
            return Err(DesignError::InvalidDesign(
                "cue tones do not match the sequence labels".to_string(),
            ));
        }
        Ok(())
    }

    fn check_sequences(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (label, items) in self.sequences.iter() {
            if items.len() != SEQUENCE_LEN {
                return Err(DesignError::InvalidDesign(format!(
                    "sequence {} has {} items",
                    label,
                    items.len()
                )));
            }
            for item in items {
                if !seen.insert(item.as_str()) {
                    return Err(DesignError::InvalidDesign(format!(
                        "item '{}' is used more than once",
                        item
                    )));
                }
            }
        }
        Ok(())
    }
}
