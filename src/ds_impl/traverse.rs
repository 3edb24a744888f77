//! Read-only walks shared by every tree: range operations over leaf batches
//! and quiescent diagnostics.
//!
//! A tree exposes itself through [`TreeView`], which decides how a child is
//! read (the live pointer, or the version visible at a snapshot). None of the
//! walks here retry: over the live tree they are not linearizable, over a
//! snapshot view they are.

use super::concurrent_map::KeySum;
use super::key::Key;
use super::leaf::Leaf;
use crate::error::{Error, Result};

pub enum NodeView<'g, K, V, N> {
    Leaf(&'g Leaf<K, V>),
    Internal { key: &'g Key<K>, left: N, right: N },
}

pub trait TreeView<'g, K: 'g, V: 'g> {
    type Node: Copy;

    /// The outermost sentinel.
    fn root(&self) -> Self::Node;

    /// Reads a node. `None` means the child is missing at this view.
    fn view(&self, node: Self::Node) -> Option<NodeView<'g, K, V, Self::Node>>;
}

/// Quiescent shape statistics, measured below the two sentinels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub keys: usize,
    pub leaves: usize,
    pub internals: usize,
    /// Sum over stored keys of the depth of the leaf that holds them.
    pub sum_of_depths: usize,
    pub height: usize,
}

impl TreeStats {
    pub fn nodes(&self) -> usize {
        self.leaves + self.internals
    }
}

/// The root of the real tree, hanging off the left spine of the sentinels.
fn real_root<'g, K: 'g, V: 'g, T: TreeView<'g, K, V>>(tree: &T) -> Option<T::Node> {
    let mut node = tree.root();
    for _ in 0..2 {
        match tree.view(node)? {
            NodeView::Internal { left, .. } => node = left,
            NodeView::Leaf(_) => return None,
        }
    }
    Some(node)
}

pub fn get<'g, K, V, T>(tree: &T, key: &K) -> Option<&'g V>
where
    K: Ord + 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
{
    let mut node = tree.root();
    loop {
        match tree.view(node)? {
            NodeView::Leaf(leaf) => return leaf.get(key),
            NodeView::Internal {
                key: sep,
                left,
                right,
            } => node = if sep.goes_left(key) { left } else { right },
        }
    }
}

/// Visits entries with keys in `[lo, hi]` in ascending order until `f`
/// returns `false`. A missing bound leaves that side unconstrained.
///
/// Subtrees entirely outside the range are never entered, and once a subtree
/// is known to lie inside a bound, that bound is no longer compared against.
pub fn walk_range<'g, K, V, T, F>(tree: &T, lo: Option<&K>, hi: Option<&K>, mut f: F)
where
    K: Ord + 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
    F: FnMut(&'g K, &'g V) -> bool,
{
    let mut stack = vec![(tree.root(), lo.is_some(), hi.is_some())];
    while let Some((node, left_open, right_open)) = stack.pop() {
        match tree.view(node) {
            None => continue,
            Some(NodeView::Leaf(leaf)) => {
                let start = match lo {
                    Some(lo) if left_open => leaf.lower_bound(lo),
                    _ => 0,
                };
                let end = match hi {
                    Some(hi) if right_open => leaf.upper_bound(hi),
                    _ => leaf.len(),
                };
                for i in start..end.max(start) {
                    let (k, v) = leaf.entry(i);
                    if !f(k, v) {
                        return;
                    }
                }
            }
            Some(NodeView::Internal { key, left, right }) => {
                let lo_right = matches!(lo, Some(lo) if left_open && !key.goes_left(lo));
                let hi_left = matches!(hi, Some(hi) if right_open && key.goes_left(hi));
                if lo_right {
                    stack.push((right, left_open, right_open));
                } else if hi_left {
                    stack.push((left, left_open, right_open));
                } else {
                    stack.push((right, false, right_open));
                    stack.push((left, left_open, false));
                }
            }
        }
    }
}

pub fn range_scan<'g, K, V, T>(tree: &T, lo: &K, hi: &K) -> Vec<&'g V>
where
    K: Ord + 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
{
    let mut result = Vec::new();
    if lo > hi {
        return result;
    }
    walk_range(tree, Some(lo), Some(hi), |_, v| {
        result.push(v);
        true
    });
    result
}

pub fn successors<'g, K, V, T>(tree: &T, key: &K, count: usize) -> Vec<(&'g K, &'g V)>
where
    K: Ord + 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
{
    let mut result = Vec::with_capacity(count);
    if count == 0 {
        return result;
    }
    walk_range(tree, Some(key), None, |k, v| {
        result.push((k, v));
        result.len() < count
    });
    result
}

pub fn find_if<'g, K, V, T, P>(tree: &T, lo: &K, hi: &K, mut pred: P) -> Option<(&'g K, &'g V)>
where
    K: Ord + 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
    P: FnMut(&K, &V) -> bool,
{
    let mut found = None;
    if lo > hi {
        return found;
    }
    walk_range(tree, Some(lo), Some(hi), |k, v| {
        if pred(k, v) {
            found = Some((k, v));
            false
        } else {
            true
        }
    });
    found
}

/// Sum of the keys in `[lo, hi]`, folded like [`key_sum`].
pub fn range_sum<'g, K, V, T>(tree: &T, lo: &K, hi: &K) -> i64
where
    K: KeySum + Ord + 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
{
    let mut sum = 0i64;
    if lo > hi {
        return sum;
    }
    walk_range(tree, Some(lo), Some(hi), |k, _| {
        sum = sum.wrapping_add(k.key_sum());
        true
    });
    sum
}

fn for_each_leaf<'g, K, V, T, F>(tree: &T, mut f: F)
where
    K: 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
    F: FnMut(Option<&'g Leaf<K, V>>, usize),
{
    let Some(start) = real_root(tree) else {
        return;
    };
    let mut stack = vec![(start, 0)];
    while let Some((node, depth)) = stack.pop() {
        match tree.view(node) {
            None => continue,
            Some(NodeView::Leaf(leaf)) => f(Some(leaf), depth),
            Some(NodeView::Internal { left, right, .. }) => {
                f(None, depth);
                stack.push((right, depth + 1));
                stack.push((left, depth + 1));
            }
        }
    }
}

pub fn stats<'g, K, V, T>(tree: &T) -> TreeStats
where
    K: 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
{
    let mut stats = TreeStats::default();
    for_each_leaf(tree, |leaf, depth| {
        stats.height = stats.height.max(depth);
        match leaf {
            Some(leaf) => {
                stats.leaves += 1;
                stats.keys += leaf.len();
                stats.sum_of_depths += leaf.len() * depth;
            }
            None => stats.internals += 1,
        }
    });
    stats
}

pub fn key_sum<'g, K, V, T>(tree: &T) -> i64
where
    K: KeySum + 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
{
    let mut sum = 0i64;
    for_each_leaf(tree, |leaf, _| {
        if let Some(leaf) = leaf {
            sum = leaf
                .keys()
                .iter()
                .fold(sum, |acc, k| acc.wrapping_add(k.key_sum()));
        }
    });
    sum
}

/// Checks the search-tree shape: every internal node has two children,
/// leaves are sorted, hold at most `batching_degree` entries and only keys
/// routed to them, and nothing hangs to the right of a sentinel.
pub fn validate<'g, K, V, T>(tree: &T, batching_degree: usize) -> Result<TreeStats>
where
    K: Ord + std::fmt::Debug + 'g,
    V: 'g,
    T: TreeView<'g, K, V>,
{
    let mut stack: Vec<(T::Node, Option<&'g K>, Option<&'g K>, bool)> =
        vec![(tree.root(), None, None, false)];
    while let Some((node, lo, hi, must_be_empty)) = stack.pop() {
        match tree.view(node) {
            None => return Err(Error::Invariant("internal node with a missing child".into())),
            Some(NodeView::Leaf(leaf)) => {
                if must_be_empty && !leaf.is_empty() {
                    return Err(Error::Invariant(format!(
                        "keys {:?} to the right of a sentinel",
                        leaf.keys()
                    )));
                }
                if leaf.len() > batching_degree {
                    return Err(Error::Invariant(format!(
                        "leaf of {} entries exceeds batching degree {}",
                        leaf.len(),
                        batching_degree
                    )));
                }
                if leaf.keys().windows(2).any(|w| w[0] >= w[1]) {
                    return Err(Error::Invariant(format!(
                        "unsorted leaf {:?}",
                        leaf.keys()
                    )));
                }
                let out_of_range = leaf.keys().iter().any(|k| {
                    lo.map_or(false, |lo| k < lo) || hi.map_or(false, |hi| k >= hi)
                });
                if out_of_range {
                    return Err(Error::Invariant(format!(
                        "leaf {:?} outside its routing range [{:?}, {:?})",
                        leaf.keys(),
                        lo,
                        hi
                    )));
                }
            }
            Some(NodeView::Internal { key, left, right }) => match key {
                Key::Inf => {
                    stack.push((right, lo, hi, true));
                    stack.push((left, lo, hi, must_be_empty));
                }
                Key::Fin(k) => {
                    let left_hi = match hi {
                        Some(hi) if hi < k => Some(hi),
                        _ => Some(k),
                    };
                    let right_lo = match lo {
                        Some(lo) if lo > k => Some(lo),
                        _ => Some(k),
                    };
                    stack.push((right, right_lo, hi, must_be_empty));
                    stack.push((left, lo, left_hi, must_be_empty));
                }
            },
        }
    }
    Ok(stats(tree))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A plain owned tree to exercise the walks without any concurrency.
    enum Plain {
        Leaf(Leaf<i32, i32>),
        Internal(Key<i32>, Box<Plain>, Box<Plain>),
    }

    struct PlainView<'a>(&'a Plain);

    impl<'a> TreeView<'a, i32, i32> for PlainView<'a> {
        type Node = &'a Plain;

        fn root(&self) -> &'a Plain {
            self.0
        }

        fn view(&self, node: &'a Plain) -> Option<NodeView<'a, i32, i32, &'a Plain>> {
            Some(match node {
                Plain::Leaf(l) => NodeView::Leaf(l),
                Plain::Internal(key, left, right) => NodeView::Internal {
                    key,
                    left: &**left,
                    right: &**right,
                },
            })
        }
    }

    fn leaf(keys: &[i32]) -> Box<Plain> {
        Box::new(Plain::Leaf(
            keys.iter()
                .fold(Leaf::empty(), |l, &k| l.with_inserted(k, k)),
        ))
    }

    fn sentinels(real: Box<Plain>) -> Plain {
        Plain::Internal(
            Key::Inf,
            Box::new(Plain::Internal(Key::Inf, real, leaf(&[]))),
            leaf(&[]),
        )
    }

    fn sample() -> Plain {
        // (10: [1 5] (20: [10 15] [20 25 30]))
        sentinels(Box::new(Plain::Internal(
            Key::Fin(10),
            leaf(&[1, 5]),
            Box::new(Plain::Internal(
                Key::Fin(20),
                leaf(&[10, 15]),
                leaf(&[20, 25, 30]),
            )),
        )))
    }

    #[test]
    fn scans_are_inclusive_and_ordered() {
        let tree = sample();
        let view = PlainView(&tree);
        let all: Vec<i32> = range_scan(&view, &0, &100).into_iter().copied().collect();
        assert_eq!(all, vec![1, 5, 10, 15, 20, 25, 30]);
        let mid: Vec<i32> = range_scan(&view, &5, &20).into_iter().copied().collect();
        assert_eq!(mid, vec![5, 10, 15, 20]);
        assert!(range_scan(&view, &16, &19).is_empty());
        assert_eq!(get(&view, &25), Some(&25));
        assert_eq!(get(&view, &26), None);
    }

    #[test]
    fn successors_and_find_if() {
        let tree = sample();
        let view = PlainView(&tree);
        let succ: Vec<i32> = successors(&view, &6, 3).into_iter().map(|(k, _)| *k).collect();
        assert_eq!(succ, vec![10, 15, 20]);
        assert_eq!(successors(&view, &31, 3).len(), 0);
        assert_eq!(
            find_if(&view, &2, &30, |k, _| k % 5 == 0 && *k > 12).map(|(k, _)| *k),
            Some(15)
        );
        assert_eq!(find_if(&view, &2, &30, |k, _| *k > 100), None);
    }

    #[test]
    fn inverted_ranges_are_empty() {
        let tree = sample();
        let view = PlainView(&tree);
        assert!(range_scan(&view, &20, &10).is_empty());
        assert_eq!(find_if(&view, &30, &1, |_, _| true), None);
        assert_eq!(range_sum(&view, &30, &1), 0);
        assert_eq!(range_scan(&view, &15, &15), vec![&15]);
    }

    #[test]
    fn range_sum_folds_keys_in_bounds() {
        let tree = sample();
        let view = PlainView(&tree);
        assert_eq!(range_sum(&view, &0, &100), key_sum(&view));
        assert_eq!(range_sum(&view, &5, &20), 5 + 10 + 15 + 20);
        assert_eq!(range_sum(&view, &16, &19), 0);
    }

    #[test]
    fn stats_and_validation() {
        let tree = sample();
        let view = PlainView(&tree);
        let stats = validate(&view, 4).unwrap();
        assert_eq!(stats.keys, 7);
        assert_eq!(stats.leaves, 3);
        assert_eq!(stats.internals, 2);
        assert_eq!(stats.sum_of_depths, 2 + 2 * 2 + 3 * 2);
        assert_eq!(stats.height, 2);
        assert_eq!(key_sum(&view), 106);
        assert!(validate(&view, 2).is_err());
    }

    #[test]
    fn validation_catches_misrouted_keys() {
        let tree = sentinels(Box::new(Plain::Internal(
            Key::Fin(10),
            leaf(&[1, 12]),
            leaf(&[20]),
        )));
        assert!(matches!(
            validate(&PlainView(&tree), 16),
            Err(Error::Invariant(_))
        ));
    }
}
