//! Differential tests of the trees against `BTreeMap`.

use crossbeam_ebr::pin;
use nbbst_benchmark::ds_impl::{
    ChromaticTree, EFRBBatchTree, PnbBatchTree, RangeMap, TreeParams, VcasBatchTree,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Insert(i32, i32),
    Remove(i32),
    Get(i32),
    Scan(i32, i32),
    Successors(i32, usize),
    FindEven(i32, i32),
    Sum(i32, i32),
}

fn key() -> impl Strategy<Value = i32> {
    0..200i32
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            4 => (key(), any::<i32>()).prop_map(|(k, v)| Op::Insert(k, v)),
            3 => key().prop_map(Op::Remove),
            2 => key().prop_map(Op::Get),
            1 => (key(), 0..60i32).prop_map(|(lo, len)| Op::Scan(lo, lo + len)),
            1 => (key(), 0..20usize).prop_map(|(k, n)| Op::Successors(k, n)),
            1 => (key(), 0..60i32).prop_map(|(lo, len)| Op::FindEven(lo, lo + len)),
            1 => (key(), -10..60i32).prop_map(|(lo, len)| Op::Sum(lo, lo + len)),
        ],
        0..=max_ops,
    )
}

fn tree_params() -> impl Strategy<Value = TreeParams> {
    (2..8usize, 0..4usize).prop_map(|(b, d)| {
        TreeParams::default()
            .batching_degree(b)
            .allowed_violations(d)
    })
}

fn check_against_model<M: RangeMap<i32, i32>>(
    params: TreeParams,
    ops: &[Op],
) -> Result<(), TestCaseError> {
    let map = M::with_params(params).unwrap();
    let mut model = BTreeMap::new();
    let guard = &pin();

    for op in ops {
        match *op {
            Op::Insert(k, v) => {
                let expected = model.get(&k).copied();
                prop_assert_eq!(map.put_if_absent(k, v, guard).copied(), expected);
                model.entry(k).or_insert(v);
            }
            Op::Remove(k) => {
                prop_assert_eq!(map.remove(&k, guard).copied(), model.remove(&k));
            }
            Op::Get(k) => {
                prop_assert_eq!(map.get(&k, guard).copied(), model.get(&k).copied());
                prop_assert_eq!(map.contains_key(&k, guard), model.contains_key(&k));
            }
            Op::Scan(lo, hi) => {
                let got: Vec<i32> = map.range_scan(&lo, &hi, guard).into_iter().copied().collect();
                let expected: Vec<i32> = model.range(lo..=hi).map(|(_, v)| *v).collect();
                prop_assert_eq!(got, expected);
            }
            Op::Successors(k, n) => {
                let got: Vec<(i32, i32)> = map
                    .successors(&k, n, guard)
                    .into_iter()
                    .map(|(k, v)| (*k, *v))
                    .collect();
                let expected: Vec<(i32, i32)> =
                    model.range(k..).take(n).map(|(k, v)| (*k, *v)).collect();
                prop_assert_eq!(got, expected);
            }
            Op::FindEven(lo, hi) => {
                let got = map
                    .find_if(&lo, &hi, |_, v| v % 2 == 0, guard)
                    .map(|(k, v)| (*k, *v));
                let expected = model
                    .range(lo..=hi)
                    .find(|(_, v)| *v % 2 == 0)
                    .map(|(k, v)| (*k, *v));
                prop_assert_eq!(got, expected);
            }
            Op::Sum(lo, hi) => {
                let expected: i64 = if lo > hi {
                    0
                } else {
                    model.range(lo..=hi).map(|(k, _)| *k as i64).sum()
                };
                prop_assert_eq!(map.range_sum(&lo, &hi, guard), expected);
            }
        }
    }

    let stats = map.validate(guard).unwrap();
    prop_assert_eq!(stats.keys, model.len());
    prop_assert_eq!(map.size(guard), model.len());
    prop_assert_eq!(map.key_sum(guard), model.keys().map(|k| *k as i64).sum::<i64>());

    let keys: Vec<i32> = (0..200).collect();
    let found: Vec<Option<i32>> = map
        .multi_search(&keys, guard)
        .into_iter()
        .map(|v| v.copied())
        .collect();
    let expected: Vec<Option<i32>> = keys.iter().map(|k| model.get(k).copied()).collect();
    prop_assert_eq!(found, expected);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn efrb_batch_tree_matches_btreemap(params in tree_params(), ops in operations(300)) {
        check_against_model::<EFRBBatchTree<i32, i32>>(params, &ops)?;
    }

    #[test]
    fn vcas_batch_tree_matches_btreemap(params in tree_params(), ops in operations(300)) {
        check_against_model::<VcasBatchTree<i32, i32>>(params, &ops)?;
    }

    #[test]
    fn pnb_batch_tree_matches_btreemap(params in tree_params(), ops in operations(300)) {
        check_against_model::<PnbBatchTree<i32, i32>>(params, &ops)?;
    }

    #[test]
    fn chromatic_tree_matches_btreemap(params in tree_params(), ops in operations(300)) {
        check_against_model::<ChromaticTree<i32, i32>>(params, &ops)?;
    }

    /// Path weights stay equal whatever the slack, and with no slack every
    /// violation is repaired before the update returns.
    #[test]
    fn chromatic_tree_stays_balanced(
        b in 2..6usize,
        d in 0..3usize,
        keys in prop::collection::vec(key(), 0..400),
    ) {
        let params = TreeParams::default().batching_degree(b).allowed_violations(d);
        let tree = ChromaticTree::<i32, i32>::with_params(params).unwrap();
        let guard = &pin();
        for (i, k) in keys.iter().enumerate() {
            if i % 3 == 2 {
                tree.remove(k, guard);
            } else {
                tree.put_if_absent(*k, *k, guard);
            }
        }
        let balance = tree.check_balance(guard).unwrap();
        if d == 0 {
            prop_assert_eq!(balance.violations, 0);
        }
    }

    #[test]
    fn rejects_batches_below_two(b in 0..2usize) {
        let params = TreeParams::default().batching_degree(b);
        prop_assert!(EFRBBatchTree::<i32, i32>::with_params(params).is_err());
        prop_assert!(VcasBatchTree::<i32, i32>::with_params(params).is_err());
        prop_assert!(PnbBatchTree::<i32, i32>::with_params(params).is_err());
        prop_assert!(ChromaticTree::<i32, i32>::with_params(params).is_err());
    }
}
