//! Batched non-blocking BST with constant-time snapshots (VCAS BST-64).
//!
//! The update protocol is the flag/mark protocol of the plain batched tree.
//! On top of it, every child slot keeps a version list: a node installed in a
//! slot links (`nextv`) to the node it replaced and is stamped with the
//! camera's time. A range query takes a snapshot and reads every slot as of
//! that time, so range queries are linearizable.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_ebr::{unprotected, Atomic, Guard, Owned, Shared};
use log::debug;

use super::camera::Camera;
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
        const FLAG = 4usize;
    }
}

/// Timestamp of a node nobody has stamped yet.
const TBD: u64 = u64::MAX;
/// `nextv` tag of a node that has not been installed anywhere yet.
const UNSET: usize = 1;

pub struct Node<K, V> {
    ts: AtomicU64,
    nextv: Atomic<Node<K, V>>,
    body: Body<K, V>,
}

pub enum Body<K, V> {
    Internal(Internal<K, V>),
    Leaf(Leaf<K, V>),
}

pub struct Internal<K, V> {
    key: Key<K>,
    // tag on low bits: {Clean, DFlag, IFlag, Mark, Flag}
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

impl<K, V> Node<K, V> {
    fn new(body: Body<K, V>) -> Self {
        Self {
            ts: AtomicU64::new(TBD),
            nextv: Atomic::from(Shared::null().with_tag(UNSET)),
            body,
        }
    }

    fn leaf(leaf: Leaf<K, V>) -> Self {
        Self::new(Body::Leaf(leaf))
    }

    /// An internal node over `left` and `right`. Children that were never
    /// installed anywhere become the first version of their slots.
    fn internal<'g>(
        key: Key<K>,
        left: Shared<'g, Self>,
        right: Shared<'g, Self>,
        camera: &Camera,
        guard: &'g Guard,
    ) -> Self {
        for child in [left, right] {
            unsafe { child.deref() }.init(camera, guard);
        }
        Self::new(Body::Internal(Internal {
            key,
            update: Atomic::null(),
            left: Atomic::from(left),
            right: Atomic::from(right),
        }))
    }

    fn init(&self, camera: &Camera, guard: &Guard) {
        let unset = Shared::null().with_tag(UNSET);
        if self.nextv.load(Ordering::SeqCst, guard) == unset {
            self.init_ts(camera);
            let _ = self.nextv.compare_exchange(
                unset,
                Shared::null(),
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            );
        }
    }

    #[inline]
    fn init_ts(&self, camera: &Camera) {
        if self.ts.load(Ordering::SeqCst) == TBD {
            let _ = self.ts.compare_exchange(
                TBD,
                camera.read(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    #[inline]
    fn ts(&self) -> u64 {
        self.ts.load(Ordering::SeqCst)
    }

    #[inline]
    fn as_internal(&self) -> &Internal<K, V> {
        match &self.body {
            Body::Internal(internal) => internal,
            Body::Leaf(_) => unreachable!("expected an internal node"),
        }
    }

    #[inline]
    fn as_leaf(&self) -> &Leaf<K, V> {
        match &self.body {
            Body::Leaf(leaf) => leaf,
            Body::Internal(_) => unreachable!("expected a leaf"),
        }
    }
}

impl<K: Clone, V: Clone> Node<K, V> {
    /// A fresh version of this node with the same contents.
    fn copy<'g>(&self, camera: &Camera, guard: &'g Guard) -> Self {
        match &self.body {
            Body::Leaf(leaf) => Self::leaf(leaf.clone()),
            Body::Internal(internal) => Self::internal(
                internal.key.clone(),
                internal.head(true, camera, guard),
                internal.head(false, camera, guard),
                camera,
                guard,
            ),
        }
    }
}

impl<K, V> Internal<K, V> {
    #[inline]
    fn slot(&self, left: bool) -> &Atomic<Node<K, V>> {
        if left {
            &self.left
        } else {
            &self.right
        }
    }

    /// The latest version in a child slot, stamped if it was not yet.
    #[inline]
    fn head<'g>(&self, left: bool, camera: &Camera, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        let head = self.slot(left).load(Ordering::Acquire, guard);
        if let Some(node) = unsafe { head.as_ref() } {
            node.init_ts(camera);
        }
        head
    }

    /// The version of a child slot visible to a snapshot taken at `ts`.
    fn child_at<'g>(
        &self,
        left: bool,
        ts: u64,
        camera: &Camera,
        guard: &'g Guard,
    ) -> Shared<'g, Node<K, V>> {
        let mut node = self.head(left, camera, guard);
        while let Some(n) = unsafe { node.as_ref() } {
            if n.ts() <= ts {
                break;
            }
            node = n.nextv.load(Ordering::Acquire, guard).with_tag(0);
        }
        node
    }

    #[inline]
    fn has_child(&self, node: Shared<'_, Node<K, V>>, camera: &Camera, guard: &Guard) -> bool {
        node == self.head(true, camera, guard) || node == self.head(false, camera, guard)
    }

    /// Installs `new` as the next version of whichever slot holds `old`.
    ///
    /// `new` must not have been installed before. On success it is stamped
    /// before returning, which is what lets the caller retire `old`.
    fn cas_child<'g>(
        &self,
        old: Shared<'g, Node<K, V>>,
        new: Shared<'g, Node<K, V>>,
        camera: &Camera,
        guard: &'g Guard,
    ) -> bool {
        let mut left = true;
        let mut head = self.head(true, camera, guard);
        if head != old {
            left = false;
            head = self.head(false, camera, guard);
            if head != old {
                return false;
            }
        }
        let new_ref = unsafe { new.deref() };
        let _ = new_ref.nextv.compare_exchange(
            Shared::null().with_tag(UNSET),
            old,
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        );
        if self
            .slot(left)
            .compare_exchange(head, new, Ordering::SeqCst, Ordering::SeqCst, guard)
            .is_err()
        {
            return false;
        }
        new_ref.init_ts(camera);
        let head_ref = unsafe { head.deref() };
        if new_ref.ts() == head_ref.ts() {
            // Both versions are visible to exactly the same snapshots.
            new_ref
                .nextv
                .store(head_ref.nextv.load(Ordering::Acquire, guard), Ordering::Release);
        }
        true
    }
}

/// Frees a replacement that lost its installation race. Only the nodes not
/// listed in `shared` were allocated for it.
unsafe fn free_unpublished<K, V>(node: Shared<'_, Node<K, V>>, shared: &[Shared<'_, Node<K, V>>]) {
    let node = node.into_owned().into_box();
    if let Body::Internal(internal) = node.body {
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

    #[inline]
    fn search(&mut self, key: &K, camera: &Camera, guard: &'g Guard) {
        while let Body::Internal(internal) = &unsafe { self.l.deref() }.body {
            self.gp = self.p;
            self.p = self.l;
            self.l = internal.head(internal.key.goes_left(key), camera, guard);
        }
    }

    fn validate_parent(&mut self, camera: &Camera, guard: &'g Guard) -> bool {
        let p = unsafe { self.p.deref() }.as_internal();
        self.pupdate = p.update.load(Ordering::Acquire, guard);
        p.has_child(self.l, camera, guard)
    }

    fn validate_grandparent(&mut self, camera: &Camera, guard: &'g Guard) -> bool {
        let gp = unsafe { self.gp.deref() }.as_internal();
        self.gpupdate = gp.update.load(Ordering::Acquire, guard);
        gp.has_child(self.p, camera, guard) && self.validate_parent(camera, guard)
    }

    #[inline]
    fn leaf(&self) -> &'g Leaf<K, V> {
        unsafe { self.l.deref() }.as_leaf()
    }
}

pub struct VcasBatchTree<K, V> {
    root: Atomic<Node<K, V>>,
    camera: Camera,
    batching_degree: usize,
}

impl<K, V> Drop for VcasBatchTree<K, V> {
    fn drop(&mut self) {
        // Only the latest versions are freed here. Older ones were retired
        // when they were replaced.
        unsafe {
            let mut stack = vec![self.root.load(Ordering::Relaxed, unprotected())];
            while let Some(node) = stack.pop() {
                if node.is_null() {
                    continue;
                }
                if let Body::Internal(internal) = &node.deref().body {
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

impl<K, V> Default for VcasBatchTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> VcasBatchTree<K, V>
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
            "VCAS batch tree: batching degree {}",
            params.batching_degree
        );
        let camera = Camera::new();
        let guard = unsafe { unprotected() };
        let empty = || Owned::new(Node::leaf(Leaf::empty())).into_shared(guard);
        let inner = Owned::new(Node::internal(Key::Inf, empty(), empty(), &camera, guard))
            .into_shared(guard);
        let root = Node::internal(Key::Inf, inner, empty(), &camera, guard);
        Self {
            root: Atomic::new(root),
            camera,
            batching_degree: params.batching_degree,
        }
    }

    fn view<'g>(&'g self, guard: &'g Guard) -> LiveView<'g, K, V> {
        LiveView {
            root: self.root.load(Ordering::Acquire, guard),
            camera: &self.camera,
            guard,
        }
    }

    /// Fixes a snapshot. `guard` must stay pinned for as long as the view is
    /// read, which the borrow enforces.
    fn snapshot<'g>(&'g self, guard: &'g Guard) -> SnapshotView<'g, K, V> {
        SnapshotView {
            root: self.root.load(Ordering::Acquire, guard),
            ts: self.camera.take_snapshot(),
            camera: &self.camera,
            guard,
        }
    }

    pub fn get<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        traverse::get(&self.view(guard), key)
    }

    pub fn put_if_absent<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        let camera = &self.camera;
        loop {
            let mut cursor = Cursor::new(self.root.load(Ordering::Acquire, guard));
            cursor.search(&key, camera, guard);
            if !cursor.validate_parent(camera, guard) {
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
                Node::leaf(l_leaf.with_inserted(key.clone(), value.clone()))
            } else {
                let (left, right) = l_leaf.split_inserted(key.clone(), value.clone());
                let sep = Key::Fin(right.keys()[0].clone());
                let left = Owned::new(Node::leaf(left)).into_shared(guard);
                let right = Owned::new(Node::leaf(right)).into_shared(guard);
                Node::internal(sep, left, right, camera, guard)
            };
            let new_node = Owned::new(new_node).into_shared(guard);

            let op = Owned::new(Update::Insert {
                p: Atomic::from(cursor.p),
                l: Atomic::from(cursor.l),
                new_node: Atomic::from(new_node),
            })
            .into_shared(guard)
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

    pub fn remove<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        let camera = &self.camera;
        loop {
            let mut cursor = Cursor::new(self.root.load(Ordering::Acquire, guard));
            cursor.search(key, camera, guard);
            if !cursor.validate_grandparent(camera, guard) {
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
                .into_shared(guard)
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
            UpdateTag::FLAG => self.help_flagged(update, guard),
            _ => {}
        }
    }

    /// Clears `tag` from `node`'s update field if it still holds `op`.
    fn unflag<'g>(
        &self,
        node: Shared<'g, Node<K, V>>,
        op: Shared<'g, Update<K, V>>,
        tag: UpdateTag,
        guard: &'g Guard,
    ) {
        let _ = unsafe { node.deref() }.as_internal().update.compare_exchange(
            op.with_tag(tag.bits()),
            op.with_tag(UpdateTag::CLEAN.bits()),
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        );
    }

    fn help_insert<'g>(&'g self, op: Shared<'g, Update<K, V>>, guard: &'g Guard) {
        let Update::Insert { p, l, new_node } = (unsafe { op.deref() }) else {
            panic!("op is not pointing to an insert record")
        };
        let p = p.load(Ordering::Acquire, guard);
        let l = l.load(Ordering::Acquire, guard);
        let new_node = new_node.load(Ordering::Acquire, guard);

        let replaced = unsafe { p.deref() }
            .as_internal()
            .cas_child(l, new_node, &self.camera, guard);
        self.unflag(p, op, UpdateTag::IFLAG, guard);
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
                self.unflag(gp.load(Ordering::Acquire, guard), op, UpdateTag::DFLAG, guard);
                false
            }
        }
    }

    fn help_marked<'g>(&'g self, op: Shared<'g, Update<K, V>>, guard: &'g Guard) {
        let Update::Delete { gp, p, l, key, .. } = (unsafe { op.deref() }) else {
            panic!("op is not pointing to a delete record")
        };
        let camera = &self.camera;
        let gp = gp.load(Ordering::Acquire, guard);
        let p = p.load(Ordering::Acquire, guard);
        let l = l.load(Ordering::Acquire, guard);
        let p_ref = unsafe { p.deref() }.as_internal();
        let l_leaf = unsafe { l.deref() }.as_leaf();
        let p_left = p_ref.head(true, camera, guard);
        let p_right = p_ref.head(false, camera, guard);

        if l_leaf.len() > 1 || p_ref.key.is_inf() {
            let shrunk = Owned::new(Node::leaf(l_leaf.with_removed(key))).into_shared(guard);
            let (left, right, sibling) = if p_left == l {
                (shrunk, p_right, p_right)
            } else {
                (p_left, shrunk, p_left)
            };
            let replacement = Owned::new(Node::internal(
                p_ref.key.clone(),
                left,
                right,
                camera,
                guard,
            ))
            .into_shared(guard);

            let replaced = unsafe { gp.deref() }
                .as_internal()
                .cas_child(p, replacement, camera, guard);
            self.unflag(gp, op, UpdateTag::DFLAG, guard);
            unsafe {
                if replaced {
                    guard.defer_destroy(p);
                    guard.defer_destroy(l);
                } else {
                    free_unpublished(replacement, &[sibling]);
                }
            }
            return;
        }

        // The leaf empties: `p` and `l` go away and the sibling moves up as a
        // fresh copy, since the sibling's own version cannot be installed
        // twice. An internal sibling is flagged first so its children stay
        // put while they are copied.
        let other = if p_right == l { p_left } else { p_right };
        let Body::Internal(other_ref) = &unsafe { other.deref() }.body else {
            self.help_flagged_with(op, other, guard);
            return;
        };
        let flagged = op.with_tag(UpdateTag::FLAG.bits());
        loop {
            let other_update = other_ref.update.load(Ordering::Acquire, guard);
            if other_update == flagged {
                break;
            }
            if other_update.tag() != UpdateTag::CLEAN.bits() {
                self.help(other_update, guard);
                continue;
            }
            if other_ref
                .update
                .compare_exchange(
                    other_update,
                    flagged,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                )
                .is_ok()
            {
                if !other_update.is_null() {
                    unsafe { guard.defer_destroy(other_update) };
                }
                break;
            }
        }
        self.help_flagged_with(op, other, guard);
    }

    fn help_flagged<'g>(&'g self, op: Shared<'g, Update<K, V>>, guard: &'g Guard) {
        let Update::Delete { p, l, .. } = (unsafe { op.deref() }) else {
            panic!("op is not pointing to a delete record")
        };
        let l = l.load(Ordering::Acquire, guard);
        let p_ref = unsafe { p.load(Ordering::Acquire, guard).deref() }.as_internal();
        let other = if p_ref.head(false, &self.camera, guard) == l {
            p_ref.head(true, &self.camera, guard)
        } else {
            p_ref.head(false, &self.camera, guard)
        };
        self.help_flagged_with(op, other, guard);
    }

    fn help_flagged_with<'g>(
        &'g self,
        op: Shared<'g, Update<K, V>>,
        other: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) {
        let Update::Delete { gp, p, l, .. } = (unsafe { op.deref() }) else {
            panic!("op is not pointing to a delete record")
        };
        let gp = gp.load(Ordering::Acquire, guard);
        let p = p.load(Ordering::Acquire, guard);
        let l = l.load(Ordering::Acquire, guard);

        let copy = Owned::new(unsafe { other.deref() }.copy(&self.camera, guard)).into_shared(guard);
        let replaced = unsafe { gp.deref() }
            .as_internal()
            .cas_child(p, copy, &self.camera, guard);
        self.unflag(gp, op, UpdateTag::DFLAG, guard);
        unsafe {
            if replaced {
                guard.defer_destroy(p);
                guard.defer_destroy(l);
                guard.defer_destroy(other);
            } else {
                drop(copy.into_owned());
            }
        }
    }
}

/// The latest versions. Point lookups are linearizable over it, walks are
/// not.
struct LiveView<'g, K, V> {
    root: Shared<'g, Node<K, V>>,
    camera: &'g Camera,
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
                left: internal.head(true, self.camera, self.guard),
                right: internal.head(false, self.camera, self.guard),
            },
        })
    }
}

/// The tree as of a camera snapshot.
struct SnapshotView<'g, K, V> {
    root: Shared<'g, Node<K, V>>,
    ts: u64,
    camera: &'g Camera,
    guard: &'g Guard,
}

impl<'g, K: 'g, V: 'g> TreeView<'g, K, V> for SnapshotView<'g, K, V> {
    type Node = Shared<'g, Node<K, V>>;

    fn root(&self) -> Self::Node {
        self.root
    }

    fn view(&self, node: Self::Node) -> Option<NodeView<'g, K, V, Self::Node>> {
        Some(match &unsafe { node.as_ref() }?.body {
            Body::Leaf(leaf) => NodeView::Leaf(leaf),
            Body::Internal(internal) => NodeView::Internal {
                key: &internal.key,
                left: internal.child_at(true, self.ts, self.camera, self.guard),
                right: internal.child_at(false, self.ts, self.camera, self.guard),
            },
        })
    }
}

impl<K, V> ConcurrentMap<K, V> for VcasBatchTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn new() -> Self {
        VcasBatchTree::new()
    }

    fn with_params(params: TreeParams) -> Result<Self> {
        VcasBatchTree::with_params(params)
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

impl<K, V> RangeMap<K, V> for VcasBatchTree<K, V>
where
    K: Ord + Clone + std::fmt::Debug,
    V: Clone,
{
    fn range_scan<'g>(&'g self, lo: &K, hi: &K, guard: &'g Guard) -> Vec<&'g V> {
        traverse::range_scan(&self.snapshot(guard), lo, hi)
    }

    fn successors<'g>(&'g self, key: &K, count: usize, guard: &'g Guard) -> Vec<(&'g K, &'g V)> {
        traverse::successors(&self.snapshot(guard), key, count)
    }

    fn multi_search<'g>(&'g self, keys: &[K], guard: &'g Guard) -> Vec<Option<&'g V>> {
        let snapshot = self.snapshot(guard);
        keys.iter().map(|key| traverse::get(&snapshot, key)).collect()
    }

    fn find_if<'g, P>(&'g self, lo: &K, hi: &K, pred: P, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        P: FnMut(&K, &V) -> bool,
    {
        traverse::find_if(&self.snapshot(guard), lo, hi, pred)
    }

    fn range_sum(&self, lo: &K, hi: &K, guard: &Guard) -> i64
    where
        K: KeySum,
    {
        traverse::range_sum(&self.snapshot(guard), lo, hi)
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
            debug!("VCAS batch tree failed validation: {}", e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::VcasBatchTree;
    use crate::ds_impl::concurrent_map::{self, ConcurrentMap, RangeMap};
    use crate::ds_impl::params::TreeParams;
    use crossbeam_ebr::pin;
    use crossbeam_utils::thread;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn smoke_vcas_batch_tree() {
        concurrent_map::tests::smoke::<VcasBatchTree<i32, String>>();
    }

    #[test]
    fn single_key_vcas_batch_tree() {
        concurrent_map::tests::single_key::<VcasBatchTree<i32, i32>>();
    }

    #[test]
    fn range_scenario_vcas_batch_tree() {
        concurrent_map::tests::range_scenario::<VcasBatchTree<i32, i32>>();
    }

    #[test]
    fn model_vcas_batch_tree() {
        concurrent_map::tests::against_model::<VcasBatchTree<i32, i32>>();
    }

    #[test]
    fn contended_vcas_batch_tree() {
        concurrent_map::tests::contended_key_sum::<VcasBatchTree<i32, i32>>();
        concurrent_map::tests::no_lost_inserts::<VcasBatchTree<i32, i32>>();
    }

    #[test]
    fn snapshot_ignores_later_updates() {
        let tree = VcasBatchTree::with_params(TreeParams::default().batching_degree(4)).unwrap();
        let guard = &pin();
        for key in 0..100 {
            tree.insert(key, key, guard);
        }
        let snapshot = tree.snapshot(guard);
        for key in 0..100 {
            if key % 3 == 0 {
                tree.remove(&key, guard);
            }
        }
        for key in 100..150 {
            tree.insert(key, key, guard);
        }

        let old: Vec<i32> = crate::ds_impl::traverse::range_scan(&snapshot, &0, &200)
            .into_iter()
            .copied()
            .collect();
        assert_eq!(old, (0..100).collect::<Vec<_>>());

        let now = tree.range_scan(&0, &200, guard);
        assert_eq!(now.len(), 100 - 34 + 50);
        tree.validate(guard).unwrap();
    }

    /// Writers move a token between keys `k` and `k + 1000` by inserting the
    /// new copy before removing the old one, so a consistent scan always sees
    /// every token at least once and never sees a token more than twice.
    #[test]
    fn scans_are_atomic_snapshots() {
        const TOKENS: i32 = 64;
        let tree = &VcasBatchTree::with_params(TreeParams::default().batching_degree(4)).unwrap();
        for key in 0..TOKENS {
            tree.insert(key, key, &pin());
        }
        let done = &AtomicBool::new(false);

        thread::scope(|s| {
            for w in 0..4 {
                s.spawn(move |_| {
                    for round in 0..300 {
                        for token in (w..TOKENS).step_by(4) {
                            let guard = &pin();
                            let (from, to) = if round % 2 == 0 {
                                (token, token + 1000)
                            } else {
                                (token + 1000, token)
                            };
                            assert!(tree.insert(to, token, guard));
                            assert_eq!(tree.remove(&from, guard), Some(&token));
                        }
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(move |_| {
                    while !done.load(Ordering::Acquire) {
                        let guard = &pin();
                        let mut seen = vec![0u8; TOKENS as usize];
                        for v in tree.range_scan(&0, &(TOKENS + 1000), guard) {
                            seen[*v as usize] += 1;
                        }
                        assert!(seen.iter().all(|&c| c == 1 || c == 2));
                    }
                });
            }
            s.spawn(move |_| {
                std::thread::sleep(std::time::Duration::from_millis(300));
                done.store(true, Ordering::Release);
            });
        })
        .unwrap();

        let guard = &pin();
        assert_eq!(tree.size(guard), TOKENS as usize);
        tree.validate(guard).unwrap();
    }
}
