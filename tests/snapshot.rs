//! Range operations of the versioned trees observe a single instant of the tree.

use crossbeam_ebr::pin;
use crossbeam_utils::thread;
use nbbst_benchmark::ds_impl::{PnbBatchTree, RangeMap, TreeParams, VcasBatchTree};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const TOKENS: i32 = 128;
const OFFSET: i32 = 1000;

/// Every token lives under `t` or `t + OFFSET`. Writers move a token by
/// inserting its new key before removing the old one, so at any instant each
/// token is stored once or twice.
fn move_tokens<M: RangeMap<i32, i32>>(tree: &M, writer: i32, writers: i32, rounds: usize) {
    for round in 0..rounds {
        for token in (writer..TOKENS).step_by(writers as usize) {
            let guard = &pin();
            let (from, to) = if round % 2 == 0 {
                (token, token + OFFSET)
            } else {
                (token + OFFSET, token)
            };
            assert!(tree.insert(to, token, guard));
            assert_eq!(tree.remove(&from, guard), Some(&token));
        }
    }
}

fn assert_consistent<'a>(values: impl IntoIterator<Item = &'a i32>) {
    let mut seen = vec![0u8; TOKENS as usize];
    for v in values {
        seen[*v as usize] += 1;
    }
    for (token, count) in seen.iter().enumerate() {
        assert!(
            *count == 1 || *count == 2,
            "token {} seen {} times",
            token,
            count
        );
    }
}

fn concurrent_moves<M: RangeMap<i32, i32> + Sync>() {
    const WRITERS: i32 = 4;
    let params = TreeParams::default().batching_degree(8);
    let tree = &M::with_params(params).unwrap();
    for token in 0..TOKENS {
        tree.insert(token, token, &pin());
    }
    let done = &AtomicBool::new(false);
    let keys: &Vec<i32> = &(0..TOKENS).chain(OFFSET..OFFSET + TOKENS).collect();

    thread::scope(|s| {
        for w in 0..WRITERS {
            s.spawn(move |_| move_tokens(tree, w, WRITERS, 200));
        }
        s.spawn(move |_| {
            while !done.load(Ordering::Acquire) {
                let guard = &pin();
                assert_consistent(tree.range_scan(&0, &(OFFSET + TOKENS), guard));
            }
        });
        s.spawn(move |_| {
            while !done.load(Ordering::Acquire) {
                let guard = &pin();
                let entries = tree.successors(&0, 2 * TOKENS as usize, guard);
                assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
                assert_consistent(entries.into_iter().map(|(_, v)| v));
            }
        });
        s.spawn(move |_| {
            while !done.load(Ordering::Acquire) {
                let guard = &pin();
                assert_consistent(tree.multi_search(keys, guard).into_iter().flatten());
            }
        });
        s.spawn(move |_| {
            std::thread::sleep(Duration::from_millis(500));
            done.store(true, Ordering::Release);
        });
    })
    .unwrap();

    let guard = &pin();
    assert_eq!(tree.size(guard), TOKENS as usize);
    tree.validate(guard).unwrap();
}

#[test]
fn vcas_batch_tree_moves_preserve_token_count() {
    concurrent_moves::<VcasBatchTree<i32, i32>>();
}

#[test]
fn pnb_batch_tree_moves_preserve_token_count() {
    concurrent_moves::<PnbBatchTree<i32, i32>>();
}
