//! Non-blocking batched binary search tree (BST-64).
//!
//! Ellen et al.'s external BST where every leaf holds a sorted batch of up to
//! `B` entries. An update flags the node(s) it depends on with an `Update`
//! record, and any thread that runs into a flagged node finishes that update
//! before retrying its own.

use std::sync::atomic::Ordering;

use crossbeam_ebr::{unprotected, Atomic, Guard, Owned, Shared};
use log::debug;

use super::concurrent_map::{ConcurrentMap, KeySum, RangeMap};
use super::key::Key;
use super::leaf::Leaf;
use super::params::TreeParams;
use super::traverse::{self, NodeView, TreeStats, TreeView};
use crate::error::Result;

bitflags! {
    struct UpdateTag: usize {
        const CLEAN = 0usize;
        const DFLAG = 1usize;
        const IFLAG = 2usize;
        const MARK = 3usize;
    }
}

pub enum Node<K, V> {
    Internal(Internal<K, V>),
    Leaf(Leaf<K, V>),
}

pub struct Internal<K, V> {
    key: Key<K>,
    // tag on low bits: {Clean, DFlag, IFlag, Mark}
    update: Atomic<Update<K, V>>,
    left: Atomic<Node<K, V>>,
    right: Atomic<Node<K, V>>,
}

pub enum Update<K, V> {
    Insert {
        p: Atomic<Node<K, V>>,
        l: Atomic<Node<K, V>>,
        new_node: Atomic<Node<K, V>>,
    },
    Delete {
        gp: Atomic<Node<K, V>>,
        p: Atomic<Node<K, V>>,
        l: Atomic<Node<K, V>>,
        pupdate: Atomic<Update<K, V>>,
        key: K,
    },
}

impl<K, V> Internal<K, V> {
    fn new<'g>(key: Key<K>, left: Shared<'g, Node<K, V>>, right: Shared<'g, Node<K, V>>) -> Self {
        Self {
            key,
            update: Atomic::null(),
            left: Atomic::from(left),
            right: Atomic::from(right),
        }
    }
}

impl<K, V> Node<K, V> {
    fn internal(key: Key<K>, left: Self, right: Self) -> Self {
        Node::Internal(Internal {
            key,
            update: Atomic::null(),
            left: Atomic::new(left),
            right: Atomic::new(right),
        })
    }

    #[inline]
    fn as_internal(&self) -> &Internal<K, V> {
        match self {
            Node::Internal(internal) => internal,
            Node::Leaf(_) => unreachable!("expected an internal node"),
        }
    }

    #[inline]
    fn as_leaf(&self) -> &Leaf<K, V> {
        match self {
            Node::Leaf(leaf) => leaf,
            Node::Internal(_) => unreachable!("expected a leaf"),
        }
    }
}

/// Frees a node that was never published, together with the leaves it was
/// built with. Children listed in `shared` belong to the tree and are kept.
unsafe fn free_unpublished<K, V>(node: Shared<'_, Node<K, V>>, shared: &[Shared<'_, Node<K, V>>]) {
    let node = node.into_owned().into_box();
    if let Node::Internal(internal) = *node {
        for child in [internal.left, internal.right] {
            let child = child.load(Ordering::Relaxed, unprotected());
            if !shared.contains(&child) {
                drop(child.into_owned());
            }
        }
    }
}

struct Cursor<'g, K, V> {
    gp: Shared<'g, Node<K, V>>,
    p: Shared<'g, Node<K, V>>,
    l: Shared<'g, Node<K, V>>,
    pupdate: Shared<'g, Update<K, V>>,
    gpupdate: Shared<'g, Update<K, V>>,
}

impl<'g, K, V> Cursor<'g, K, V>
where
    K: Ord,
{
    fn new(root: Shared<'g, Node<K, V>>) -> Self {
        Self {
            gp: Shared::null(),
            p: Shared::null(),
            l: root,
            pupdate: Shared::null(),
            gpupdate: Shared::null(),
        }
    }

    /// Descends to the leaf whose batch would hold `key`.
    ///
    /// Afterwards `l` is a leaf, `p` its parent, and `gp` the grandparent.
    /// The sentinels guarantee all three exist.
    #[inline]
    fn search(&mut self, key: &K, guard: &'g Guard) {
        while let Node::Internal(internal) = unsafe { self.l.deref() } {
            self.gp = self.p;
            self.p = self.l;
            self.l = if internal.key.goes_left(key) {
                internal.left.load(Ordering::Acquire, guard)
            } else {
                internal.right.load(Ordering::Acquire, guard)
            };
        }
    }

    /// Reads `p`'s update and confirms `l` is still its child, so the update
    /// value was current while `l` hung below `p`.
    fn validate_parent(&mut self, guard: &'g Guard) -> bool {
        let p = unsafe { self.p.deref() }.as_internal();
        self.pupdate = p.update.load(Ordering::Acquire, guard);
        self.l == p.left.load(Ordering::Acquire, guard)
            || self.l == p.right.load(Ordering::Acquire, guard)
    }

    fn validate_grandparent(&mut self, guard: &'g Guard) -> bool {
        let gp = unsafe { self.gp.deref() }.as_internal();
        self.gpupdate = gp.update.load(Ordering::Acquire, guard);
        if self.p != gp.left.load(Ordering::Acquire, guard)
            && self.p != gp.right.load(Ordering::Acquire, guard)
        {
            return false;
        }
        self.validate_parent(guard)
    }

    #[inline]
    fn leaf(&self) -> &'g Leaf<K, V> {
        unsafe { self.l.deref() }.as_leaf()
    }
}

pub struct EFRBBatchTree<K, V> {
    root: Atomic<Node<K, V>>,
    batching_degree: usize,
}


impl<K, V> Drop for EFRBBatchTree<K, V> {
    fn drop(&mut self) {
        unsafe {
            let mut stack = vec![self.root.load(Ordering::Relaxed, unprotected())];
            while let Some(node) = stack.pop() {
                if node.is_null() {
                    continue;
                }
                if let Node::Internal(internal) = node.deref() {
                    stack.push(internal.left.load(Ordering::Relaxed, unprotected()));
                    stack.push(internal.right.load(Ordering::Relaxed, unprotected()));
                    let update = internal.update.load(Ordering::Relaxed, unprotected());
                    if !update.is_null() {
                        drop(update.with_tag(0).into_owned());
                    }
                }
                drop(node.into_owned());
            }
        }
    }
}

impl<K, V> Default for EFRBBatchTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> EFRBBatchTree<K, V>
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
            "EFRB batch tree: batching degree {}",
            params.batching_degree
        );
        Self {
            root: Atomic::new(Node::internal(
                Key::Inf,
                Node::internal(Key::Inf, Node::Leaf(Leaf::empty()), Node::Leaf(Leaf::empty())),
                Node::Leaf(Leaf::empty()),
            )),
            batching_degree: params.batching_degree,
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
            let mut cursor = Cursor::new(self.root.load(Ordering::Acquire, guard));
            cursor.search(&key, guard);
            if !cursor.validate_parent(guard) {
                continue;
            }

            let l_leaf = cursor.leaf();
            if let Some(value) = l_leaf.get(&key) {
                return Some(value);
            }
            if cursor.pupdate.tag() != UpdateTag::CLEAN.bits() {
                self.help(cursor.pupdate, guard);
                continue;
            }

            let new_node = if l_leaf.len() < self.batching_degree {
                Node::Leaf(l_leaf.with_inserted(key.clone(), value.clone()))
            } else {
                let (left, right) = l_leaf.split_inserted(key.clone(), value.clone());
                Node::internal(
                    Key::Fin(right.keys()[0].clone()),
                    Node::Leaf(left),
                    Node::Leaf(right),
                )
            };
            let new_node = Owned::new(new_node).into_shared(unsafe { unprotected() });

            let op = Owned::new(Update::Insert {
                p: Atomic::from(cursor.p),
                l: Atomic::from(cursor.l),
                new_node: Atomic::from(new_node),
            })
            .into_shared(unsafe { unprotected() })
            .with_tag(UpdateTag::IFLAG.bits());

            let p = unsafe { cursor.p.deref() }.as_internal();
            match p.update.compare_exchange(
                cursor.pupdate,
                op,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            ) {
                Ok(_) => {
                    if !cursor.pupdate.is_null() {
                        unsafe { guard.defer_destroy(cursor.pupdate) };
                    }
                    self.help_insert(op, guard);
                    return None;
                }
                Err(e) => {
                    unsafe {
                        drop(op.with_tag(0).into_owned());
                        free_unpublished(new_node, &[]);
                    }
                    self.help(e.current, guard);
                }
            }
        }
    }

    /// Removes `key`. The returned value lives in the retired leaf and stays
    /// readable for as long as `guard` is pinned.
    pub fn remove<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        loop {
            let mut cursor = Cursor::new(self.root.load(Ordering::Acquire, guard));
            cursor.search(key, guard);
            if !cursor.validate_grandparent(guard) {
                continue;
            }

            let value = cursor.leaf().get(key)?;
            if cursor.gpupdate.tag() != UpdateTag::CLEAN.bits() {
                self.help(cursor.gpupdate, guard);
            } else if cursor.pupdate.tag() != UpdateTag::CLEAN.bits() {
                self.help(cursor.pupdate, guard);
            } else {
                let op = Owned::new(Update::Delete {
                    gp: Atomic::from(cursor.gp),
                    p: Atomic::from(cursor.p),
                    l: Atomic::from(cursor.l),
                    pupdate: Atomic::from(cursor.pupdate),
                    key: key.clone(),
                })
                .into_shared(unsafe { unprotected() })
                .with_tag(UpdateTag::DFLAG.bits());

                let gp = unsafe { cursor.gp.deref() }.as_internal();
                match gp.update.compare_exchange(
                    cursor.gpupdate,
                    op,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(_) => {
                        if !cursor.gpupdate.is_null() {
                            unsafe { guard.defer_destroy(cursor.gpupdate) };
                        }
                        if self.help_delete(op, guard) {
                            return Some(value);
                        }
                    }
                    Err(e) => {
                        unsafe { drop(op.with_tag(0).into_owned()) };
                        self.help(e.current, guard);
                    }
                }
            }
        }
    }

    fn help<'g>(&'g self, update: Shared<'g, Update<K, V>>, guard: &'g Guard) {
        match UpdateTag::from_bits_truncate(update.tag()) {
            UpdateTag::IFLAG => self.help_insert(update, guard),
            UpdateTag::MARK => self.help_marked(update, guard),
            UpdateTag::DFLAG => {
                let _ = self.help_delete(update, guard);
            }
            _ => {}
        }
    }

    fn help_insert<'g>(&'g self, op: Shared<'g, Update<K, V>>, guard: &'g Guard) {
        let Update::Insert { p, l, new_node } = (unsafe { op.deref() }) else {
            panic!("op is not pointing to an insert record")
        };
        let p = p.load(Ordering::Acquire, guard);
        let l = l.load(Ordering::Acquire, guard);
        let new_node = new_node.load(Ordering::Acquire, guard);

        let replaced = self.cas_child(p, l, new_node, guard);
        let _ = unsafe { p.deref() }.as_internal().update.compare_exchange(
            op.with_tag(UpdateTag::IFLAG.bits()),
            op.with_tag(UpdateTag::CLEAN.bits()),
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        );
        // Helpers only reach `l` through the flag, which is gone by now.
        if replaced {
            unsafe { guard.defer_destroy(l) };
        }
    }

    fn help_delete<'g>(&'g self, op: Shared<'g, Update<K, V>>, guard: &'g Guard) -> bool {
        let Update::Delete { gp, p, pupdate, .. } = (unsafe { op.deref() }) else {
            panic!("op is not pointing to a delete record")
        };
        let p_ref = unsafe { p.load(Ordering::Acquire, guard).deref() }.as_internal();
        let pupdate = pupdate.load(Ordering::Acquire, guard);
        let marked = op.with_tag(UpdateTag::MARK.bits());

        match p_ref.update.compare_exchange(
            pupdate,
            marked,
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            Ok(_) => {
                if !pupdate.is_null() {
                    unsafe { guard.defer_destroy(pupdate) };
                }
                self.help_marked(marked, guard);
                true
            }
            Err(e) if e.current == marked => {
                self.help_marked(marked, guard);
                true
            }
            Err(e) => {
                self.help(e.current, guard);
                let gp = unsafe { gp.load(Ordering::Acquire, guard).deref() }.as_internal();
                let _ = gp.update.compare_exchange(
                    op.with_tag(UpdateTag::DFLAG.bits()),
                    op.with_tag(UpdateTag::CLEAN.bits()),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                );
                false
            }
        }
    }

    fn help_marked<'g>(&'g self, op: Shared<'g, Update<K, V>>, guard: &'g Guard) {
        let Update::Delete { gp, p, l, key, .. } = (unsafe { op.deref() }) else {
            panic!("op is not pointing to a delete record")
        };
        let gp = gp.load(Ordering::Acquire, guard);
        let p = p.load(Ordering::Acquire, guard);
        let l = l.load(Ordering::Acquire, guard);

        // `p` is marked, so its children are frozen and every helper builds
        // the same replacement.
        let p_ref = unsafe { p.deref() }.as_internal();
        let l_leaf = unsafe { l.deref() }.as_leaf();
        let p_left = p_ref.left.load(Ordering::Acquire, guard);
        let p_right = p_ref.right.load(Ordering::Acquire, guard);

        let (replacement, sibling) = if l_leaf.len() == 1 && !p_ref.key.is_inf() {
            (if p_right == l { p_left } else { p_right }, None)
        } else {
            let shrunk = Owned::new(Node::Leaf(l_leaf.with_removed(key)))
                .into_shared(unsafe { unprotected() });
            let (left, right, sibling) = if p_left == l {
                (shrunk, p_right, p_right)
            } else {
                (p_left, shrunk, p_left)
            };
            let internal = Node::Internal(Internal::new(p_ref.key.clone(), left, right));
            (
                Owned::new(internal).into_shared(unsafe { unprotected() }),
                Some(sibling),
            )
        };

        let replaced = self.cas_child(gp, p, replacement, guard);
        let _ = unsafe { gp.deref() }.as_internal().update.compare_exchange(
            op.with_tag(UpdateTag::DFLAG.bits()),
            op.with_tag(UpdateTag::CLEAN.bits()),
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        );
        if replaced {
            unsafe {
                guard.defer_destroy(p);
                guard.defer_destroy(l);
            }
        } else if let Some(sibling) = sibling {
            unsafe { free_unpublished(replacement, &[sibling]) };
        }
    }

    /// Swings whichever child pointer of `parent` holds `old` over to `new`.
    #[inline]
    fn cas_child<'g>(
        &'g self,
        parent: Shared<'g, Node<K, V>>,
        old: Shared<'g, Node<K, V>>,
        new: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> bool {
        let parent = unsafe { parent.deref() }.as_internal();
        let slot = if parent.left.load(Ordering::Acquire, guard) == old {
            &parent.left
        } else {
            &parent.right
        };
        slot.compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst, guard)
            .is_ok()
    }
}

/// The tree as currently linked. Walks over it are not linearizable.
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
        Some(match unsafe { node.as_ref() }? {
            Node::Leaf(leaf) => NodeView::Leaf(leaf),
            Node::Internal(internal) => NodeView::Internal {
                key: &internal.key,
                left: internal.left.load(Ordering::Acquire, self.guard),
                right: internal.right.load(Ordering::Acquire, self.guard),
            },
        })
    }
}

impl<K, V> ConcurrentMap<K, V> for EFRBBatchTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn new() -> Self {
        EFRBBatchTree::new()
    }

    fn with_params(params: TreeParams) -> Result<Self> {
        EFRBBatchTree::with_params(params)
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

impl<K, V> RangeMap<K, V> for EFRBBatchTree<K, V>
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
        traverse::validate(&self.view(guard), self.batching_degree).map_err(|e| {
            debug!("EFRB batch tree failed validation: {}", e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::EFRBBatchTree;
    use crate::ds_impl::concurrent_map::{self, ConcurrentMap, RangeMap};
    use crate::ds_impl::params::TreeParams;
    use crossbeam_ebr::pin;

    #[test]
    fn smoke_efrb_batch_tree() {
        concurrent_map::tests::smoke::<EFRBBatchTree<i32, String>>();
    }

    #[test]
    fn single_key_efrb_batch_tree() {
        concurrent_map::tests::single_key::<EFRBBatchTree<i32, i32>>();
    }

    #[test]
    fn range_scenario_efrb_batch_tree() {
        concurrent_map::tests::range_scenario::<EFRBBatchTree<i32, i32>>();
    }

    #[test]
    fn model_efrb_batch_tree() {
        concurrent_map::tests::against_model::<EFRBBatchTree<i32, i32>>();
    }

    #[test]
    fn contended_efrb_batch_tree() {
        concurrent_map::tests::contended_key_sum::<EFRBBatchTree<i32, i32>>();
        concurrent_map::tests::no_lost_inserts::<EFRBBatchTree<i32, i32>>();
    }

    #[test]
    fn splits_and_collapses_small_batches() {
        let tree =
            EFRBBatchTree::with_params(TreeParams::default().batching_degree(2)).unwrap();
        let guard = &pin();
        for key in 0..64 {
            assert!(tree.insert(key, key * 2, guard));
        }
        let stats = tree.validate(guard).unwrap();
        assert_eq!(stats.keys, 64);
        assert!(stats.leaves >= 32);

        for key in (0..64).step_by(2) {
            assert_eq!(tree.remove(&key, guard), Some(&(key * 2)));
        }
        let stats = tree.validate(guard).unwrap();
        assert_eq!(stats.keys, 32);
        assert_eq!(tree.get(&7, guard), Some(&14));
        assert_eq!(tree.get(&8, guard), None);

        for key in (1..64).step_by(2) {
            assert_eq!(tree.remove(&key, guard), Some(&(key * 2)));
        }
        let stats = tree.validate(guard).unwrap();
        assert_eq!(stats.keys, 0);
        assert_eq!(stats.internals, 0);
    }

    #[test]
    fn rejects_bad_batching_degree() {
        assert!(EFRBBatchTree::<i32, i32>::with_params(TreeParams::default().batching_degree(0))
            .is_err());
    }
}
