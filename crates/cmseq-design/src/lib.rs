//! Counterbalanced design engine for the sequence-memory experiment.
//!
//! Everything here is pure computation over an explicit [`rng::SessionRng`],
//! apart from seed persistence and catalog scanning. The presentation layer
//! consumes the resulting [`plan::ExperimentPlan`] read-only.

pub mod block;
pub mod catalog;
pub mod cue;
pub mod error;
pub mod instantiate;
pub mod modality;
pub mod plan;
pub mod question;
pub mod reward;
pub mod rng;
pub mod run;
pub mod seed;
pub mod structures;
pub mod trial;
pub mod types;

pub use catalog::Catalog;
pub use error::{DesignError, Result};
pub use plan::{DesignParams, ExperimentPlan, RunPlan};
pub use reward::{bonus_payout, RewardPlan, DEFAULT_REWARD_VALUE};
pub use structures::{CanonicalStructure, StructureTable};
pub use types::{Label, Modality, SequenceSet};
