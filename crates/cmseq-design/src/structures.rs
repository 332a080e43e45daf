//! Canonical sequence structures.
//!
//! A structure is a permutation of the six category indices. The tables below
//! were produced once by [`synthesize`] and ship as constants; sessions never
//! recompute them.

use crate::error::{DesignError, Result};
use crate::rng::SessionRng;
use crate::types::{Label, SEQUENCE_LEN};
use itertools::Itertools;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// A length-2 transition may occur at most `TRANSITION_CAP - 1` times across a table.
pub const TRANSITION_CAP: usize = 4;

pub const STRUCTURES_SIX: [(char, [usize; SEQUENCE_LEN]); 6] = [
    ('A', [1, 4, 2, 5, 0, 3]),
    ('B', [4, 5, 1, 3, 2, 0]),
    ('C', [5, 3, 4, 0, 1, 2]),
    ('D', [0, 2, 3, 1, 5, 4]),
    ('E', [3, 0, 5, 2, 4, 1]),
    ('F', [2, 1, 0, 4, 3, 5]),
];

pub const STRUCTURES_TWELVE: [(char, [usize; SEQUENCE_LEN]); 12] = [
    ('A', [1, 0, 5, 3, 2, 4]),
    ('B', [0, 2, 1, 4, 3, 5]),
    ('C', [1, 3, 0, 2, 4, 5]),
    ('D', [5, 1, 4, 0, 2, 3]),
    ('E', [4, 3, 2, 5, 1, 0]),
    ('F', [2, 0, 3, 1, 5, 4]),
    ('G', [3, 4, 0, 5, 1, 2]),
    ('H', [4, 2, 1, 0, 3, 5]),
    ('I', [2, 1, 3, 4, 5, 0]),
    ('J', [5, 4, 2, 3, 0, 1]),
    ('K', [3, 5, 2, 4, 0, 1]),
    ('L', [5, 0, 4, 3, 1, 2]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalStructure {
    pub label: Label,
    pub order: [usize; SEQUENCE_LEN],
}

/// Which shipped table a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureTable {
    Six,
    Twelve,
}

impl StructureTable {
    pub fn structures(self) -> Vec<CanonicalStructure> {
        let raw: &[(char, [usize; SEQUENCE_LEN])] = match self {
            StructureTable::Six => &STRUCTURES_SIX,
            StructureTable::Twelve => &STRUCTURES_TWELVE,
        };
        raw.iter()
            .map(|(c, order)| CanonicalStructure {
                label: Label::from_table(*c),
                order: *order,
            })
            .collect()
    }
}

fn windows3(order: &[usize]) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
    order.iter().copied().tuple_windows()
}

fn windows2(order: &[usize]) -> impl Iterator<Item = (usize, usize)> + '_ {
    order.iter().copied().tuple_windows()
}

fn is_permutation(order: &[usize]) -> bool {
    let mut seen = [false; SEQUENCE_LEN];
    order.len() == SEQUENCE_LEN
        && order.iter().all(|&c| {
            if c >= SEQUENCE_LEN || seen[c] {
                false
            } else {
                seen[c] = true;
                true
            }
        })
}

/// Check the table-level constraints: permutations, distinct labels, unique
/// length-3 windows, and bounded length-2 recurrence.
pub fn validate_structures(structures: &[CanonicalStructure]) -> Result<()> {
    if structures.is_empty() {
        return Err(DesignError::InvalidDesign("structure table is empty".to_string()));
    }
    let mut labels = HashSet::new();
    let mut triples = HashSet::new();
    let mut pairs: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    for s in structures {
        if !labels.insert(s.label) {
            return Err(DesignError::InvalidDesign(format!(
                "duplicate structure label {}",
                s.label
            )));
        }
        if !is_permutation(&s.order) {
            return Err(DesignError::InvalidDesign(format!(
                "structure {} is not a permutation of 0..{}: {:?}",
                s.label, SEQUENCE_LEN, s.order
            )));
        }
        for w in windows3(&s.order) {
            if !triples.insert(w) {
                return Err(DesignError::InvalidDesign(format!(
                    "structure {} repeats transition {:?}",
                    s.label, w
                )));
            }
        }
        for w in windows2(&s.order) {
            *pairs.entry(w).or_insert(0) += 1;
        }
    }
    if let Some((pair, count)) = pairs.iter().find(|(_, count)| **count >= TRANSITION_CAP) {
        return Err(DesignError::InvalidDesign(format!(
            "transition {:?} recurs {} times (cap {})",
            pair, count, TRANSITION_CAP
        )));
    }
    Ok(())
}

/// Sum of positional Hamming distances over all unordered pairs.
pub fn pairwise_distance(orders: &[[usize; SEQUENCE_LEN]]) -> usize {
    orders
        .iter()
        .tuple_combinations()
        .map(|(a, b)| a.iter().zip(b.iter()).filter(|(x, y)| x != y).count())
        .sum()
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub count: usize,
    /// Outer random restarts.
    pub iterations: usize,
    /// Draws allowed per structure before the candidate set is abandoned.
    pub attempts_per_structure: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            count: 12,
            iterations: 100_000,
            attempts_per_structure: 1000,
        }
    }
}

fn draw_candidate_set(
    count: usize,
    attempts_per_structure: usize,
    rng: &mut SessionRng,
) -> Option<Vec<[usize; SEQUENCE_LEN]>> {
    let mut used_triples = HashSet::new();
    let mut pair_counts: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut accepted = Vec::with_capacity(count);
    for _ in 0..count {
        let mut found = None;
        for _ in 0..attempts_per_structure {
            let mut order = [0, 1, 2, 3, 4, 5];
            order.shuffle(rng);
            let triples_free = windows3(&order).all(|w| !used_triples.contains(&w));
            let pairs_ok = windows2(&order)
                .all(|w| pair_counts.get(&w).copied().unwrap_or(0) + 1 < TRANSITION_CAP);
            if triples_free && pairs_ok {
                found = Some(order);
                break;
            }
        }
        let order = found?;
        used_triples.extend(windows3(&order));
        for w in windows2(&order) {
            *pair_counts.entry(w).or_insert(0) += 1;
        }
        accepted.push(order);
    }
    Some(accepted)
}

/// Random-restart search for a structure table. Keeps the candidate set with
/// the largest [`pairwise_distance`].
pub fn synthesize(config: &SynthesisConfig, rng: &mut SessionRng) -> Result<Vec<CanonicalStructure>> {
    let labels = Label::first(config.count)?;
    if config.count == 0 || config.iterations == 0 {
        return Err(DesignError::InvalidDesign(
            "synthesis needs a positive count and iteration budget".to_string(),
        ));
    }
    let ceiling = config.count * (config.count - 1) / 2 * SEQUENCE_LEN;
    let mut best: Option<(usize, Vec<[usize; SEQUENCE_LEN]>)> = None;
    let mut completed = 0usize;
    for iteration in 0..config.iterations {
        let Some(candidate) = draw_candidate_set(config.count, config.attempts_per_structure, rng)
        else {
            continue;
        };
        completed += 1;
        let score = pairwise_distance(&candidate);
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            debug!(iteration, score, "new best structure table");
            best = Some((score, candidate));
            if score == ceiling {
                break;
            }
        }
    }
    let (score, orders) = best.ok_or(DesignError::InfeasibleDesign {
        component: "StructureSynthesizer",
        attempts: config.iterations,
    })?;
    info!(count = config.count, score, completed, "structure synthesis finished");
    Ok(labels
        .into_iter()
        .zip(orders)
        .map(|(label, order)| CanonicalStructure { label, order })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::session_rng;

    #[test]
    fn shipped_tables_satisfy_constraints() {
        validate_structures(&StructureTable::Six.structures()).expect("six-table");
        validate_structures(&StructureTable::Twelve.structures()).expect("twelve-table");
        assert_eq!(StructureTable::Twelve.structures().len(), 12);
    }

    #[test]
    fn six_table_places_every_category_once_per_position() {
        let table = StructureTable::Six.structures();
        for pos in 0..SEQUENCE_LEN {
            let mut column: Vec<usize> = table.iter().map(|s| s.order[pos]).collect();
            column.sort_unstable();
            assert_eq!(column, vec![0, 1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn validate_rejects_repeated_triple() {
        let a = Label::new('A').expect("label");
        let b = Label::new('B').expect("label");
        let table = vec![
            CanonicalStructure { label: a, order: [0, 1, 2, 3, 4, 5] },
            CanonicalStructure { label: b, order: [5, 4, 0, 1, 2, 3] },
        ];
        let err = validate_structures(&table).expect_err("0,1,2 appears twice");
        assert!(err.to_string().contains("repeats transition"), "{}", err);
    }

    #[test]
    fn validate_rejects_non_permutation() {
        let a = Label::new('A').expect("label");
        let table = vec![CanonicalStructure { label: a, order: [0, 0, 2, 3, 4, 5] }];
        assert!(validate_structures(&table).is_err());
    }

    #[test]
    fn pairwise_distance_counts_mismatched_positions() {
        let orders = [[0, 1, 2, 3, 4, 5], [0, 1, 2, 3, 5, 4], [1, 0, 2, 3, 4, 5]];
        // 2 + 2 + 4
        assert_eq!(pairwise_distance(&orders), 8);
    }

    #[test]
    fn synthesize_produces_valid_table() {
        let mut rng = session_rng(11);
        let config = SynthesisConfig {
            count: 6,
            iterations: 200,
            attempts_per_structure: 1000,
        };
        let table = synthesize(&config, &mut rng).expect("synthesis");
        assert_eq!(table.len(), 6);
        validate_structures(&table).expect("synthesized table is valid");
    }

    #[test]
    fn synthesize_fails_loudly_when_budget_is_hopeless() {
        let mut rng = session_rng(11);
        // 26 permutations need 130 length-2 transitions; only 30 exist, each allowed 3 times.
        let config = SynthesisConfig {
            count: 26,
            iterations: 3,
            attempts_per_structure: 1,
        };
        let err = synthesize(&config, &mut rng).expect_err("cannot complete");
        assert!(matches!(
            err,
            DesignError::InfeasibleDesign { component: "StructureSynthesizer", .. }
        ));
    }
}
