//! Partition one run's labels into blocks.
//!
//! Every label of a run is shown in exactly two blocks. The first half of the
//! blocks covers every label once, so a participant has seen the whole set
//! before any sequence comes back.

use crate::error::{DesignError, Result};
use crate::rng::{sample_distinct, SessionRng};
use crate::types::Label;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Unordered pair of labels sharing a block, smaller label first.
pub type LabelPair = (Label, Label);

/// Blocks of one run, block 1 first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockPlan {
    blocks: Vec<Vec<Label>>,
}

impl BlockPlan {
    /// Checked constructor: rejects any layout that breaks the block invariants
    /// for `run_labels`.
    pub fn new(blocks: Vec<Vec<Label>>, run_labels: &[Label]) -> Result<Self> {
        check_block_invariants(&blocks, run_labels)?;
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[Vec<Label>] {
        &self.blocks
    }

    /// Block by 1-based index.
    pub fn block(&self, index: usize) -> Option<&[Label]> {
        index
            .checked_sub(1)
            .and_then(|i| self.blocks.get(i))
            .map(|b| b.as_slice())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn labels(&self) -> BTreeSet<Label> {
        self.blocks.iter().flatten().copied().collect()
    }

    /// All within-block pairs, one entry per occurrence.
    pub fn pairs(&self) -> Vec<LabelPair> {
        self.blocks
            .iter()
            .flat_map(|block| {
                block
                    .iter()
                    .copied()
                    .tuple_combinations()
                    .map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
            })
            .collect()
    }

    /// Pairs that share a block more than once.
    pub fn repeated_pairs(&self) -> BTreeSet<LabelPair> {
        let mut counts: BTreeMap<LabelPair, usize> = BTreeMap::new();
        for pair in self.pairs() {
            *counts.entry(pair).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .filter(|(_, c)| *c > 1)
            .map(|(pair, _)| pair)
            .collect()
    }

    /// Labels that belong to no repeated pair.
    pub fn standalone_labels(&self) -> BTreeSet<Label> {
        let repeated: BTreeSet<Label> = self
            .repeated_pairs()
            .into_iter()
            .flat_map(|(a, b)| [a, b])
            .collect();
        self.labels().difference(&repeated).copied().collect()
    }
}

pub fn check_block_invariants(blocks: &[Vec<Label>], run_labels: &[Label]) -> Result<()> {
    let expected: BTreeSet<Label> = run_labels.iter().copied().collect();
    if blocks.is_empty() || blocks.len() % 2 != 0 {
        return Err(DesignError::InvalidDesign(format!(
            "a run needs an even, non-zero number of blocks, got {}",
            blocks.len()
        )));
    }
    let mut occurrences: BTreeMap<Label, usize> = BTreeMap::new();
    for (i, block) in blocks.iter().enumerate() {
        let distinct: BTreeSet<Label> = block.iter().copied().collect();
        if distinct.len() != block.len() {
            return Err(DesignError::InvalidDesign(format!(
                "block {} repeats a label: {:?}",
                i + 1,
                block
            )));
        }
        for label in block {
            if !expected.contains(label) {
                return Err(DesignError::InvalidDesign(format!(
                    "block {} holds label {} outside the run",
                    i + 1,
                    label
                )));
            }
            *occurrences.entry(*label).or_insert(0) += 1;
        }
    }
    for label in &expected {
        let n = occurrences.get(label).copied().unwrap_or(0);
        if n != 2 {
            return Err(DesignError::InvalidDesign(format!(
                "label {} appears in {} blocks, expected 2",
                label, n
            )));
        }
    }
    let first_half: Vec<Label> = blocks[..blocks.len() / 2].iter().flatten().copied().collect();
    let covered: BTreeSet<Label> = first_half.iter().copied().collect();
    if covered != expected || first_half.len() != expected.len() {
        return Err(DesignError::InvalidDesign(format!(
            "first {} blocks must cover every label exactly once, got {:?}",
            blocks.len() / 2,
            first_half
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BlockAllocator {
    pub n_blocks: usize,
    pub block_size: usize,
    pub max_attempts: usize,
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self {
            n_blocks: 4,
            block_size: 3,
            max_attempts: 10_000,
        }
    }
}

fn distinct_sorted(pool: &[Label]) -> Vec<Label> {
    pool.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

fn remove_one_each(pool: &mut Vec<Label>, picked: &[Label]) {
    for label in picked {
        if let Some(pos) = pool.iter().position(|l| l == label) {
            pool.remove(pos);
        }
    }
}

fn has_duplicates(pool: &[Label]) -> bool {
    distinct_sorted(pool).len() != pool.len()
}

impl BlockAllocator {
    /// Draw blocks from the doubled label pool until the first half of the
    /// blocks covers every label once.
    pub fn allocate(&self, labels: &[Label], rng: &mut SessionRng) -> Result<BlockPlan> {
        if labels.len() * 2 != self.n_blocks * self.block_size {
            return Err(DesignError::InvalidDesign(format!(
                "{} labels cannot fill {} blocks of {} with each label twice",
                labels.len(),
                self.n_blocks,
                self.block_size
            )));
        }
        if has_duplicates(labels) {
            return Err(DesignError::InvalidDesign(format!(
                "run labels must be distinct: {:?}",
                labels
            )));
        }
        for attempt in 1..=self.max_attempts {
            let Some(blocks) = self.draw_blocks(labels, rng) else {
                continue;
            };
            if check_block_invariants(&blocks, labels).is_ok() {
                debug!(attempt, ?blocks, "blocks allocated");
                return Ok(BlockPlan { blocks });
            }
        }
        Err(DesignError::InfeasibleDesign {
            component: "BlockAllocator",
            attempts: self.max_attempts,
        })
    }

    /// One pass over the pool. `None` when the pass dead-ends.
    fn draw_blocks(&self, labels: &[Label], rng: &mut SessionRng) -> Option<Vec<Vec<Label>>> {
        let mut pool: Vec<Label> = labels.iter().chain(labels.iter()).copied().collect();
        let mut blocks = Vec::with_capacity(self.n_blocks);
        for b in 0..self.n_blocks {
            let picked = if b + 2 == self.n_blocks {
                // The last block takes whatever is left, so the remainder
                // after this one must not hold a label twice.
                self.sample_leaving_distinct(&pool, rng)?
            } else {
                let distinct = distinct_sorted(&pool);
                if distinct.len() < self.block_size {
                    return None;
                }
                sample_distinct(&distinct, self.block_size, rng)
            };
            remove_one_each(&mut pool, &picked);
            blocks.push(picked);
        }
        Some(blocks)
    }

    fn sample_leaving_distinct(&self, pool: &[Label], rng: &mut SessionRng) -> Option<Vec<Label>> {
        let distinct = distinct_sorted(pool);
        if distinct.len() < self.block_size {
            return None;
        }
        for _ in 0..self.max_attempts {
            let picked = sample_distinct(&distinct, self.block_size, rng);
            let mut rest = pool.to_vec();
            remove_one_each(&mut rest, &picked);
            if !has_duplicates(&rest) {
                return Some(picked);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::session_rng;

    fn labels(s: &str) -> Vec<Label> {
        s.chars().map(|c| Label::new(c).expect("label")).collect()
    }

    #[test]
    fn allocation_satisfies_block_invariants() {
        let run = labels("ABCDEF");
        let allocator = BlockAllocator::default();
        for seed in 0..200 {
            let mut rng = session_rng(seed);
            let plan = allocator.allocate(&run, &mut rng).expect("allocation");
            assert_eq!(plan.len(), 4);
            check_block_invariants(plan.blocks(), &run).expect("invariants");

            let first: BTreeSet<Label> = plan.blocks()[..2].iter().flatten().copied().collect();
            let second: Vec<Label> = plan.blocks()[2..].iter().flatten().copied().collect();
            assert_eq!(first, run.iter().copied().collect());
            let mut second_sorted = second.clone();
            second_sorted.sort();
            assert_eq!(second_sorted, run, "blocks 3+4 hold each label once more");
        }
    }

    #[test]
    fn allocation_is_reproducible() {
        let run = labels("GHIJKL");
        let allocator = BlockAllocator::default();
        let a = allocator.allocate(&run, &mut session_rng(77)).expect("a");
        let b = allocator.allocate(&run, &mut session_rng(77)).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_label_count_is_rejected() {
        let allocator = BlockAllocator::default();
        let err = allocator
            .allocate(&labels("ABC"), &mut session_rng(1))
            .expect_err("3 labels cannot fill 4 blocks of 3");
        assert!(matches!(err, DesignError::InvalidDesign(_)));
    }

    #[test]
    fn exhausted_budget_is_infeasible_design() {
        let allocator = BlockAllocator {
            max_attempts: 0,
            ..BlockAllocator::default()
        };
        let err = allocator
            .allocate(&labels("ABCDEF"), &mut session_rng(1))
            .expect_err("no attempts allowed");
        assert!(matches!(
            err,
            DesignError::InfeasibleDesign { component: "BlockAllocator", .. }
        ));
    }

    #[test]
    fn checked_constructor_rejects_broken_layouts() {
        let run = labels("ABCDEF");
        let ok = vec![labels("ABC"), labels("DEF"), labels("ABD"), labels("CEF")];
        let plan = BlockPlan::new(ok, &run).expect("valid layout");
        assert_eq!(plan.block(1), Some(labels("ABC").as_slice()));
        assert_eq!(plan.block(0), None);

        let dup_in_block = vec![labels("AAC"), labels("DEF"), labels("BBD"), labels("CEF")];
        assert!(BlockPlan::new(dup_in_block, &run).is_err());

        let no_cover = vec![labels("ABC"), labels("ADE"), labels("BCF"), labels("DEF")];
        let err = BlockPlan::new(no_cover, &run).expect_err("A twice in first half");
        assert!(err.to_string().contains("cover"), "{}", err);
    }

    #[test]
    fn repeated_pairs_and_standalone_labels() {
        let run = labels("ABCDEF");
        let plan = BlockPlan::new(
            vec![labels("ABC"), labels("DEF"), labels("ABD"), labels("CEF")],
            &run,
        )
        .expect("layout");
        let repeated = plan.repeated_pairs();
        let a = Label::new('A').expect("A");
        let b = Label::new('B').expect("B");
        let e = Label::new('E').expect("E");
        let f = Label::new('F').expect("F");
        assert_eq!(repeated, [(a, b), (e, f)].into_iter().collect());
        assert_eq!(plan.standalone_labels(), labels("CD").into_iter().collect());
    }
}
