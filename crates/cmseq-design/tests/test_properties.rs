//! Property-based tests over arbitrary participant seeds.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use cmseq_design::block::{check_block_invariants, BlockAllocator};
use cmseq_design::instantiate::instantiate;
use cmseq_design::modality::count;
use cmseq_design::reward::select;
use cmseq_design::rng::session_rng;
use cmseq_design::run::RunAllocator;
use cmseq_design::trial::order;
use cmseq_design::{Catalog, DesignParams, ExperimentPlan, Label, StructureTable};

fn catalog(per_category: usize) -> Catalog {
    let map: BTreeMap<String, Vec<String>> = (0..6)
        .map(|c| {
            let items = (0..per_category).map(|i| format!("item{}_{}", c, i)).collect();
            (format!("category{}", c), items)
        })
        .collect();
    Catalog::new(map)
}

fn table_strategy() -> impl Strategy<Value = StructureTable> {
    prop_oneof![Just(StructureTable::Six), Just(StructureTable::Twelve)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // 1. Instantiation never reuses an item
    #[test]
    fn instantiation_uses_each_item_once(seed in any::<u64>(), table in table_strategy()) {
        let structures = table.structures();
        let set = instantiate(&structures, &catalog(12), &mut session_rng(seed)).unwrap();
        prop_assert_eq!(set.len(), structures.len());
        let mut seen = BTreeSet::new();
        for (_, items) in set.iter() {
            prop_assert_eq!(items.len(), 6);
            for item in items {
                prop_assert!(seen.insert(item.clone()), "item {} reused", item);
            }
        }
    }

    // 2. Block invariants hold for every seed
    #[test]
    fn blocks_cover_first_half_exactly(seed in any::<u64>()) {
        let labels = Label::first(6).unwrap();
        let plan = BlockAllocator::default().allocate(&labels, &mut session_rng(seed)).unwrap();
        prop_assert!(check_block_invariants(plan.blocks(), &labels).is_ok());
    }

    // 3. Runs carry exactly two repeated pairs and never share one
    #[test]
    fn runs_have_two_disjoint_repeated_pairs(seed in any::<u64>(), n in prop_oneof![Just(6usize), Just(12usize)]) {
        let labels = Label::first(n).unwrap();
        let runs = RunAllocator::default().allocate(&labels, &mut session_rng(seed)).unwrap();
        let a = runs[0].blocks.repeated_pairs();
        let b = runs[1].blocks.repeated_pairs();
        prop_assert_eq!(a.len(), 2);
        prop_assert_eq!(b.len(), 2);
        prop_assert!(a.is_disjoint(&b));
    }

    // 4. Trial orders never repeat a label at a position
    #[test]
    fn trial_positions_unique(seed in any::<u64>()) {
        let labels = Label::first(6).unwrap();
        let blocks = BlockAllocator::default().allocate(&labels, &mut session_rng(seed)).unwrap();
        for block in blocks.blocks() {
            let trials = order(block, 3).unwrap();
            for pos in 0..3 {
                let column: BTreeSet<Label> = (0..3).map(|t| trials.first_pass(t).unwrap()[pos]).collect();
                prop_assert_eq!(column.len(), 3);
            }
        }
    }

    // 5. Reward halves partition the run and are stable
    #[test]
    fn reward_partition_is_stable(seed in any::<u64>(), run in 1usize..=2) {
        let labels = Label::first(6).unwrap();
        let first = select(&labels, seed, run, 3).unwrap();
        let again = select(&labels, seed, run, 3).unwrap();
        prop_assert_eq!(&first, &again);
        let union: BTreeSet<Label> = first.reward.iter().chain(&first.no_reward).copied().collect();
        prop_assert_eq!(union.len(), 6);
    }

    // 6. Whole plans are valid, balanced and reproducible
    #[test]
    fn plans_validate_and_reproduce(seed in any::<u64>(), table in table_strategy()) {
        let structures = table.structures();
        let params = DesignParams::default();
        let plan = ExperimentPlan::generate(seed, &structures, &catalog(12), &params).unwrap();
        prop_assert!(plan.validate().is_ok());
        for run in &plan.runs {
            prop_assert_eq!(count(run.modalities.opening.iter().flatten()), (6, 6));
            prop_assert_eq!(count(run.modalities.questions.iter().flatten().flatten()), (18, 18));
        }
        let again = ExperimentPlan::generate(seed, &structures, &catalog(12), &params).unwrap();
        prop_assert_eq!(plan, again);
    }
}
