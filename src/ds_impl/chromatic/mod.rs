//! Non-blocking chromatic tree with batched leaves (CT-64).
//!
//! A relaxed red-black tree: every node has a weight, and every root-to-leaf
//! path has the same weight sum. Updates may leave violations behind (red-red
//! pairs or overweight nodes); an update that passes at least `d` of them on
//! its search path fixes everything on the path before it returns. With
//! `d == 0` every update fixes the violation it created.
//!
//! All changes go through the LLX/SCX operations in [`scx`].

mod rebalance;
mod scx;

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_ebr::{unprotected, Atomic, Guard, Owned, Shared};
use log::{debug, trace};

use self::scx::{execute, weak_llx, Builder, Linked, Operation};
use super::concurrent_map::{ConcurrentMap, KeySum, RangeMap};
use super::key::Key;
use super::leaf::Leaf;
use super::params::TreeParams;
use super::traverse::{self, NodeView, TreeStats, TreeView};
use crate::error::{Error, Result};

pub struct Node<K, V> {
    weight: usize,
    body: Body<K, V>,
}

pub enum Body<K, V> {
    Internal(Internal<K, V>),
    Leaf(Leaf<K, V>),
}

pub struct Internal<K, V> {
    key: Key<K>,
    left: Atomic<Node<K, V>>,
    right: Atomic<Node<K, V>>,
    marked: AtomicBool,
    op: Atomic<Operation<K, V>>,
}

impl<K, V> Node<K, V> {
    fn internal<'g>(
        key: Key<K>,
        weight: usize,
        left: Shared<'g, Self>,
        right: Shared<'g, Self>,
    ) -> Self {
        Self {
            weight,
            body: Body::Internal(Internal {
                key,
                left: Atomic::from(left),
                right: Atomic::from(right),
                marked: AtomicBool::new(false),
                op: Atomic::null(),
            }),
        }
    }

    fn leaf(leaf: Leaf<K, V>, weight: usize) -> Self {
        Self {
            weight,
            body: Body::Leaf(leaf),
        }
    }

    #[inline]
    fn as_internal(&self) -> Option<&Internal<K, V>> {
        match &self.body {
            Body::Internal(internal) => Some(internal),
            Body::Leaf(_) => None,
        }
    }
}

impl<K: Ord, V> Internal<K, V> {
    #[inline]
    fn child<'g>(&self, key: &K, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        if self.key.goes_left(key) {
            self.left.load(Ordering::Acquire, guard)
        } else {
            self.right.load(Ordering::Acquire, guard)
        }
    }
}

impl<K, V> Internal<K, V> {
    #[inline]
    fn has_child(&self, node: Shared<'_, Node<K, V>>, guard: &Guard) -> bool {
        node == self.left.load(Ordering::Acquire, guard)
            || node == self.right.load(Ordering::Acquire, guard)
    }
}

#[inline]
fn weight<K, V>(node: Shared<'_, Node<K, V>>) -> usize {
    unsafe { node.deref() }.weight
}

struct Cursor<'g, K, V> {
    gp: Shared<'g, Node<K, V>>,
    p: Shared<'g, Node<K, V>>,
    l: Shared<'g, Node<K, V>>,
    leaf: &'g Leaf<K, V>,
    /// Violations passed on the way down.
    violations: usize,
}

/// Shape summary returned by [`ChromaticTree::check_balance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    /// Weight sum shared by every path from the root to a leaf.
    pub path_weight: usize,
    pub violations: usize,
}

pub struct ChromaticTree<K, V> {
    root: Atomic<Node<K, V>>,
    batching_degree: usize,
    allowed_violations: usize,
}

impl<K, V> Drop for ChromaticTree<K, V> {
    fn drop(&mut self) {
        unsafe {
            let mut ops = Vec::new();
            let mut stack = vec![self.root.load(Ordering::Relaxed, unprotected())];
            while let Some(node) = stack.pop() {
                if let Body::Internal(internal) = &node.deref().body {
                    stack.push(internal.left.load(Ordering::Relaxed, unprotected()));
                    stack.push(internal.right.load(Ordering::Relaxed, unprotected()));
                    let op = internal.op.load(Ordering::Relaxed, unprotected());
                    if !op.is_null() {
                        ops.push(op);
                    }
                }
                drop(node.into_owned());
            }
            // An aborted operation may still sit in several nodes.
            ops.sort_by_key(|op| op.as_raw());
            ops.dedup();
            for op in ops {
                drop(op.into_owned());
            }
        }
    }
}

impl<K, V> Default for ChromaticTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ChromaticTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::build(TreeParams::default())
    }

    pub fn with_params(params: TreeParams) -> Result<Self> {
        Ok(Self::build(params.validate()?))
    }

    fn build(params: TreeParams) -> Self {
        debug!(
            "chromatic tree: batching degree {}, allowed violations {}",
            params.batching_degree, params.allowed_violations
        );
        let guard = unsafe { unprotected() };
        let empty = || Owned::new(Node::leaf(Leaf::empty(), 1)).into_shared(guard);
        let inner = Owned::new(Node::internal(Key::Inf, 1, empty(), empty())).into_shared(guard);
        Self {
            root: Atomic::new(Node::internal(Key::Inf, 1, inner, empty())),
            batching_degree: params.batching_degree,
            allowed_violations: params.allowed_violations,
        }
    }

    /// The lower of the two sentinels. Its left child is the top of the tree.
    fn inner<'g>(&self, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        let root = self.root.load(Ordering::Acquire, guard);
        match unsafe { root.deref() }.as_internal() {
            Some(root) => root.left.load(Ordering::Acquire, guard),
            None => unreachable!("the root sentinel is internal"),
        }
    }

    fn top<'g>(&self, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        match unsafe { self.inner(guard).deref() }.as_internal() {
            Some(inner) => inner.left.load(Ordering::Acquire, guard),
            None => unreachable!("the inner sentinel is internal"),
        }
    }

    /// Sentinels and the top of the tree keep weight one.
    fn is_sentinel(&self, node: Shared<'_, Node<K, V>>, guard: &Guard) -> bool {
        node == self.top(guard)
            || matches!(
                &unsafe { node.deref() }.body,
                Body::Internal(internal) if internal.key.is_inf()
            )
    }

    fn search<'g>(&self, key: &K, guard: &'g Guard) -> Cursor<'g, K, V> {
        let mut gp = self.root.load(Ordering::Acquire, guard);
        let mut p = self.inner(guard);
        let mut l = self.top(guard);
        let mut violations = 0;
        loop {
            let node = unsafe { l.deref() };
            match &node.body {
                Body::Leaf(leaf) => {
                    return Cursor {
                        gp,
                        p,
                        l,
                        leaf,
                        violations,
                    }
                }
                Body::Internal(internal) => {
                    if self.allowed_violations > 0
                        && (node.weight > 1 || (node.weight == 0 && weight(p) == 0))
                    {
                        violations += 1;
                    }
                    gp = p;
                    p = l;
                    l = internal.child(key, guard);
                }
            }
        }
    }

    fn view<'g>(&'g self, guard: &'g Guard) -> LiveView<'g, K, V> {
        LiveView {
            root: self.root.load(Ordering::Acquire, guard),
            guard,
        }
    }

    pub fn get<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        traverse::get(&self.view(guard), key)
    }

    pub fn put_if_absent<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        loop {
            let cursor = self.search(&key, guard);
            if let Some(value) = cursor.leaf.get(&key) {
                return Some(value);
            }

            let split = cursor.leaf.len() >= self.batching_degree;
            let op = if split {
                self.create_insert_op(cursor.p, cursor.l, &key, &value, guard)
            } else {
                self.create_replace_op(
                    cursor.p,
                    cursor.l,
                    |leaf| leaf.with_inserted(key.clone(), value.clone()),
                    guard,
                )
            };
            let Some(op) = op else { continue };
            if !execute(op, guard) {
                continue;
            }

            if split {
                let fix = if self.allowed_violations == 0 {
                    weight(cursor.p) == 0 && weight(cursor.l) == 1
                } else {
                    cursor.violations >= self.allowed_violations
                };
                if fix {
                    self.fix_to_key(&key, guard);
                }
            }
            return None;
        }
    }

    pub fn remove<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        loop {
            let cursor = self.search(key, guard);
            let value = cursor.leaf.get(key)?;

            let collapse = cursor.leaf.len() == 1 && !self.is_sentinel(cursor.l, guard);
            let op = if collapse {
                self.create_delete_op(cursor.gp, cursor.p, cursor.l, guard)
            } else {
                self.create_replace_op(cursor.p, cursor.l, |leaf| leaf.with_removed(key), guard)
            };
            let Some(op) = op else { continue };
            if !execute(op, guard) {
                continue;
            }

            if collapse {
                let fix = if self.allowed_violations == 0 {
                    weight(cursor.p) > 0
                        && weight(cursor.l) > 0
                        && !self.is_sentinel(cursor.p, guard)
                } else {
                    cursor.violations >= self.allowed_violations
                };
                if fix {
                    self.fix_to_key(key, guard);
                }
            }
            return Some(value);
        }
    }

    /// Replaces leaf `l` under `p` with a rebuilt leaf of the same weight.
    fn create_replace_op<'g, F>(
        &'g self,
        p: Shared<'g, Node<K, V>>,
        l: Shared<'g, Node<K, V>>,
        rebuild: F,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Operation<K, V>>>
    where
        F: FnOnce(&Leaf<K, V>) -> Leaf<K, V>,
    {
        let p = weak_llx(p, guard)?;
        if !unsafe { p.node.deref() }.as_internal()?.has_child(l, guard) {
            return None;
        }
        let l_ref = unsafe { l.deref() };
        let Body::Leaf(leaf) = &l_ref.body else {
            return None;
        };
        let mut b = Builder::new(guard);
        let subtree = b.alloc(Node::leaf(rebuild(leaf), l_ref.weight));
        b.finish(&[p, weak_llx(l, guard)?], subtree, None)
    }

    /// Splits the full leaf `l` under `p` around `key`.
    fn create_insert_op<'g>(
        &'g self,
        p: Shared<'g, Node<K, V>>,
        l: Shared<'g, Node<K, V>>,
        key: &K,
        value: &V,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Operation<K, V>>> {
        let p = weak_llx(p, guard)?;
        if !unsafe { p.node.deref() }.as_internal()?.has_child(l, guard) {
            return None;
        }
        let l_ref = unsafe { l.deref() };
        let Body::Leaf(leaf) = &l_ref.body else {
            return None;
        };
        let weight = if self.is_sentinel(l, guard) {
            1
        } else {
            l_ref.weight - 1
        };
        let (left, right) = leaf.split_inserted(key.clone(), value.clone());
        let sep = Key::Fin(right.keys()[0].clone());

        let mut b = Builder::new(guard);
        let left = b.alloc(Node::leaf(left, 1));
        let right = b.alloc(Node::leaf(right, 1));
        let subtree = b.internal(sep, weight, left, right);
        b.finish(&[p, weak_llx(l, guard)?], subtree, None)
    }

    /// Removes the single-key leaf `l` together with its parent `p`; the
    /// sibling moves up with their combined weight.
    fn create_delete_op<'g>(
        &'g self,
        gp: Shared<'g, Node<K, V>>,
        p: Shared<'g, Node<K, V>>,
        l: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Operation<K, V>>> {
        let gp: Linked<'g, K, V> = weak_llx(gp, guard)?;
        let p: Linked<'g, K, V> = weak_llx(p, guard)?;
        if !unsafe { gp.node.deref() }.as_internal()?.has_child(p.node, guard) {
            return None;
        }
        let p_ref = unsafe { p.node.deref() }.as_internal()?;
        let p_left = p_ref.left.load(Ordering::Acquire, guard);
        let p_right = p_ref.right.load(Ordering::Acquire, guard);
        let sibling = if p_left == l {
            p_right
        } else if p_right == l {
            p_left
        } else {
            return None;
        };
        let s = weak_llx(sibling, guard)?;

        let weight = if self.is_sentinel(p.node, guard) {
            1
        } else {
            weight(p.node) + weight(sibling)
        };
        let mut b = Builder::new(guard);
        let subtree = b.copy(sibling, weight);
        b.finish(&[gp, p, s], subtree, Some(l))
    }

    /// Fixes every violation on the search path of `key`, top-down.
    pub fn fix_to_key(&self, key: &K, guard: &Guard) {
        loop {
            let mut ggp = self.root.load(Ordering::Acquire, guard);
            let mut gp = ggp;
            let mut p = self.inner(guard);
            let mut n = self.top(guard);
            loop {
                let node = unsafe { n.deref() };
                let Body::Internal(internal) = &node.body else {
                    break;
                };
                if node.weight > 1 || (node.weight == 0 && weight(p) == 0) {
                    break;
                }
                ggp = gp;
                gp = p;
                p = n;
                n = internal.child(key, guard);
            }

            if weight(n) == 1 {
                return;
            }
            if let Some(op) = self.create_balancing_op(ggp, gp, p, n, guard) {
                if execute(op, guard) {
                    trace!("rebalanced a violation of weight {}", weight(n));
                }
            }
        }
    }

    /// Checks that every path carries the same weight and counts violations.
    /// Only meaningful while no update is running.
    pub fn check_balance(&self, guard: &Guard) -> Result<Balance> {
        let mut path_weight = None;
        let mut violations = 0;
        let mut stack = vec![(self.top(guard), 1, 0)];
        while let Some((node, parent_weight, above)) = stack.pop() {
            let node = unsafe { node.deref() };
            let sum = above + node.weight;
            if node.weight > 1 || (node.weight == 0 && parent_weight == 0) {
                violations += 1;
            }
            match &node.body {
                Body::Internal(internal) => {
                    stack.push((internal.left.load(Ordering::Acquire, guard), node.weight, sum));
                    stack.push((internal.right.load(Ordering::Acquire, guard), node.weight, sum));
                }
                Body::Leaf(_) => match path_weight {
                    None => path_weight = Some(sum),
                    Some(expected) if expected != sum => {
                        return Err(Error::Invariant(format!(
                            "leaf path weight {} differs from {}",
                            sum, expected
                        )));
                    }
                    Some(_) => {}
                },
            }
        }
        Ok(Balance {
            path_weight: path_weight.unwrap_or(0),
            violations,
        })
    }
}

struct LiveView<'g, K, V> {
    root: Shared<'g, Node<K, V>>,
    guard: &'g Guard,
}

impl<'g, K: 'g, V: 'g> TreeView<'g, K, V> for LiveView<'g, K, V> {
    type Node = Shared<'g, Node<K, V>>;

    fn root(&self) -> Self::Node {
        self.root
    }

    fn view(&self, node: Self::Node) -> Option<NodeView<'g, K, V, Self::Node>> {
        Some(match &unsafe { node.as_ref() }?.body {
            Body::Leaf(leaf) => NodeView::Leaf(leaf),
            Body::Internal(internal) => NodeView::Internal {
                key: &internal.key,
                left: internal.left.load(Ordering::Acquire, self.guard),
                right: internal.right.load(Ordering::Acquire, self.guard),
            },
        })
    }
}

impl<K, V> ConcurrentMap<K, V> for ChromaticTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn new() -> Self {
        ChromaticTree::new()
    }

    fn with_params(params: TreeParams) -> Result<Self> {
        ChromaticTree::with_params(params)
    }

    #[inline]
    fn get<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        self.get(key, guard)
    }

    #[inline]
    fn put_if_absent<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.put_if_absent(key, value, guard)
    }

    #[inline]
    fn remove<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        self.remove(key, guard)
    }
}

impl<K, V> RangeMap<K, V> for ChromaticTree<K, V>
where
    K: Ord + Clone + std::fmt::Debug,
    V: Clone,
{
    fn range_scan<'g>(&'g self, lo: &K, hi: &K, guard: &'g Guard) -> Vec<&'g V> {
        traverse::range_scan(&self.view(guard), lo, hi)
    }

    fn successors<'g>(&'g self, key: &K, count: usize, guard: &'g Guard) -> Vec<(&'g K, &'g V)> {
        traverse::successors(&self.view(guard), key, count)
    }

    fn multi_search<'g>(&'g self, keys: &[K], guard: &'g Guard) -> Vec<Option<&'g V>> {
        keys.iter().map(|key| self.get(key, guard)).collect()
    }

    fn find_if<'g, P>(&'g self, lo: &K, hi: &K, pred: P, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        P: FnMut(&K, &V) -> bool,
    {
        traverse::find_if(&self.view(guard), lo, hi, pred)
    }

    fn range_sum(&self, lo: &K, hi: &K, guard: &Guard) -> i64
    where
        K: KeySum,
    {
        traverse::range_sum(&self.view(guard), lo, hi)
    }

    fn stats(&self, guard: &Guard) -> TreeStats {
        traverse::stats(&self.view(guard))
    }

    fn key_sum(&self, guard: &Guard) -> i64
    where
        K: KeySum,
    {
        traverse::key_sum(&self.view(guard))
    }

    fn validate(&self, guard: &Guard) -> Result<TreeStats> {
        let stats = traverse::validate(&self.view(guard), self.batching_degree)?;
        self.check_balance(guard).map_err(|e| {
            debug!("chromatic tree failed validation: {}", e);
            e
        })?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::ChromaticTree;
    use crate::ds_impl::concurrent_map::{self, ConcurrentMap, RangeMap};
    use crate::ds_impl::params::TreeParams;
    use crossbeam_ebr::pin;
    use crossbeam_utils::thread;
    use rand::prelude::*;

    #[test]
    fn smoke_chromatic_tree() {
        concurrent_map::tests::smoke::<ChromaticTree<i32, String>>();
    }

    #[test]
    fn single_key_chromatic_tree() {
        concurrent_map::tests::single_key::<ChromaticTree<i32, i32>>();
    }

    #[test]
    fn range_scenario_chromatic_tree() {
        concurrent_map::tests::range_scenario::<ChromaticTree<i32, i32>>();
    }

    #[test]
    fn model_chromatic_tree() {
        concurrent_map::tests::against_model::<ChromaticTree<i32, i32>>();
    }

    #[test]
    fn contended_chromatic_tree() {
        concurrent_map::tests::contended_key_sum::<ChromaticTree<i32, i32>>();
        concurrent_map::tests::no_lost_inserts::<ChromaticTree<i32, i32>>();
    }

    #[test]
    fn sorted_inserts_stay_shallow() {
        let tree = ChromaticTree::with_params(TreeParams::default().batching_degree(4)).unwrap();
        let guard = &pin();
        for key in 0..20_000 {
            assert!(tree.insert(key, key, guard));
        }
        let stats = tree.validate(guard).unwrap();
        assert_eq!(stats.keys, 20_000);
        // An unbalanced tree would be thousands of levels deep here.
        assert!(stats.height <= 64, "height {}", stats.height);
    }

    #[test]
    fn no_slack_leaves_no_violations() {
        let params = TreeParams::default()
            .batching_degree(2)
            .allowed_violations(0);
        let tree = ChromaticTree::with_params(params).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let guard = &pin();
        for _ in 0..20_000 {
            let key = rng.gen_range(0..3_000);
            if rng.gen_bool(0.6) {
                tree.insert(key, key, guard);
            } else {
                tree.remove(&key, guard);
            }
        }
        let balance = tree.check_balance(guard).unwrap();
        assert_eq!(balance.violations, 0);
        tree.validate(guard).unwrap();

        for key in 0..3_000 {
            tree.remove(&key, guard);
        }
        assert_eq!(tree.size(guard), 0);
        assert_eq!(tree.check_balance(guard).unwrap().violations, 0);
    }

    #[test]
    fn concurrent_updates_keep_path_weights() {
        let params = TreeParams::default()
            .batching_degree(2)
            .allowed_violations(0);
        let tree = &ChromaticTree::with_params(params).unwrap();
        thread::scope(|s| {
            for t in 0..8u64 {
                s.spawn(move |_| {
                    let mut rng = StdRng::seed_from_u64(t);
                    for _ in 0..5_000 {
                        let key = rng.gen_range(0..1_000);
                        let guard = &pin();
                        if rng.gen_bool(0.5) {
                            tree.insert(key, key, guard);
                        } else {
                            tree.remove(&key, guard);
                        }
                    }
                });
            }
        })
        .unwrap();
        let guard = &pin();
        tree.validate(guard).unwrap();
    }
}
