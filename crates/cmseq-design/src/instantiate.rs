//! Map canonical structures to concrete item sequences.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::rng::SessionRng;
use crate::structures::{validate_structures, CanonicalStructure};
use crate::types::{ItemId, SequenceSet};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use tracing::debug;

/// Shuffle each category pool once, then give structure `i` the `i`-th item
/// of every category, visiting categories in the structure's order.
///
/// Since every sequence reads a different pool index, no item is used twice
/// in a session.
pub fn instantiate(
    structures: &[CanonicalStructure],
    catalog: &Catalog,
    rng: &mut SessionRng,
) -> Result<SequenceSet> {
    validate_structures(structures)?;
    catalog.validate(structures.len())?;

    let mut pools: Vec<Vec<ItemId>> = catalog.pools().map(|p| p.to_vec()).collect();
    for pool in pools.iter_mut() {
        pool.shuffle(rng);
    }

    let mut sequences = BTreeMap::new();
    for (i, structure) in structures.iter().enumerate() {
        let items: Vec<ItemId> = structure
            .order
            .iter()
            .map(|&category| pools[category][i].clone())
            .collect();
        debug!(label = %structure.label, ?items, "sequence instantiated");
        sequences.insert(structure.label, items);
    }
    Ok(SequenceSet::from_map(sequences))
}
