//! Persistent non-blocking batched binary search tree (PNB-BST).
//!
//! Apart from their `info` field and the child pointers of internal nodes,
//! nodes never change. An update builds new nodes stamped with the camera
//! time it started at, and every new node keeps a `prev` link to the node it
//! replaces. An update may only commit if the camera still shows its start
//! time when it is first helped (the handshake). A range query advances the
//! camera and then reads every child as of its snapshot, skipping newer
//! versions along `prev`, so it sees exactly the updates stamped up to it.
//!
//! An update is described by an [`Info`] record. The record flags the node
//! whose child pointer changes, marks the nodes it removes, and then swings
//! that child pointer. Threads that run into an unfinished record help it.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_ebr::{unprotected, Atomic, Guard, Owned, Shared};
use log::debug;

use super::camera::Camera;
use super::concurrent_map::{ConcurrentMap, KeySum, RangeMap};
use super::key::Key;
use super::leaf::Leaf;
use super::params::TreeParams;
use super::traverse::{self, NodeView, TreeStats, TreeView};
use crate::error::{Error, Result};

/// Flagged, waiting for the handshake.
const PENDING: u8 = 0;
/// Past the handshake, marking the nodes to remove.
const TRY: u8 = 1;
const COMMITTED: u8 = 2;
const ABORTED: u8 = 3;

pub struct Node<K, V> {
    /// Camera time of the update that built this node.
    seq: u64,
    /// The node this one replaced.
    prev: Atomic<Node<K, V>>,
    /// Last record that flagged or marked this node. Null if none did.
    info: Atomic<Info<K, V>>,
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
}

/// Update record.
///
/// Records are reference counted: one count for the creating thread, one for
/// every node whose `info` field points at the record, and one for every
/// unfinished record that expects to find it in some node. A record goes to
/// the epoch collector when its count drops to zero, so its address is never
/// reused while some record still compares against it.
pub struct Info<K, V> {
    state: AtomicU8,
    refs: AtomicUsize,
    /// Camera time the update started at.
    seq: u64,
    /// The flagged node, then the nodes to remove. `nodes[1]` is the child of
    /// `nodes[0]` that `new_node` replaces.
    nodes: Vec<Atomic<Node<K, V>>>,
    /// `info` of each node in `nodes` when it was validated.
    expected: Vec<Atomic<Info<K, V>>>,
    new_node: Atomic<Node<K, V>>,
    /// Nodes built for this update.
    fresh: Vec<Atomic<Node<K, V>>>,
}

impl<K, V> Info<K, V> {
    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    #[inline]
    fn in_progress(&self) -> bool {
        matches!(self.state(), PENDING | TRY)
    }

    /// Whether `node`, holding this record, must stay out of other updates.
    fn freezes(&self, node: Shared<'_, Node<K, V>>, guard: &Guard) -> bool {
        match self.state() {
            PENDING | TRY => true,
            COMMITTED => self.nodes[1..]
                .iter()
                .any(|marked| marked.load(Ordering::Relaxed, guard) == node),
            _ => false,
        }
    }

    fn try_acquire(&self) -> bool {
        let mut refs = self.refs.load(Ordering::SeqCst);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(current) => refs = current,
            }
        }
    }
}

/// Drops one reference to `info`, retiring it when it was the last one.
///
/// # Safety
///
/// The caller must own the reference it drops.
unsafe fn release<K, V>(info: Shared<'_, Info<K, V>>, guard: &Guard) {
    if info.deref().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        guard.defer_destroy(info);
    }
}

/// Hands back the references a finished record held on the records it
/// expected. An aborted record also retires the nodes built for it.
fn complete<K, V>(info: Shared<'_, Info<K, V>>, state: u8, guard: &Guard) {
    let op = unsafe { info.deref() };
    for expected in &op.expected {
        let expected = expected.load(Ordering::Relaxed, guard);
        if !expected.is_null() {
            unsafe { release(expected, guard) };
        }
    }
    if state == ABORTED {
        for node in &op.fresh {
            unsafe { guard.defer_destroy(node.load(Ordering::Relaxed, guard)) };
        }
    }
}

/// Frees a record that was never published, together with its fresh nodes.
unsafe fn discard<K, V>(info: Shared<'_, Info<K, V>>, guard: &Guard) {
    let info = info.into_owned().into_box();
    for expected in &info.expected {
        let expected = expected.load(Ordering::Relaxed, guard);
        if !expected.is_null() {
            release(expected, guard);
        }
    }
    for node in &info.fresh {
        drop(node.load(Ordering::Relaxed, guard).into_owned());
    }
}

impl<K, V> Node<K, V> {
    fn leaf(leaf: Leaf<K, V>, prev: Shared<'_, Self>, seq: u64) -> Self {
        Self {
            seq,
            prev: Atomic::from(prev),
            info: Atomic::null(),
            body: Body::Leaf(leaf),
        }
    }

    fn internal<'g>(
        key: Key<K>,
        left: Shared<'g, Self>,
        right: Shared<'g, Self>,
        prev: Shared<'g, Self>,
        seq: u64,
    ) -> Self {
        Self {
            seq,
            prev: Atomic::from(prev),
            info: Atomic::null(),
            body: Body::Internal(Internal {
                key,
                left: Atomic::from(left),
                right: Atomic::from(right),
            }),
        }
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

impl<K, V> Internal<K, V> {
    #[inline]
    fn slot(&self, left: bool) -> &Atomic<Node<K, V>> {
        if left {
            &self.left
        } else {
            &self.right
        }
    }

    /// The newest version in a child slot that was built no later than `seq`.
    fn child_at<'g>(&self, left: bool, seq: u64, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        let mut node = self.slot(left).load(Ordering::Acquire, guard);
        while let Some(n) = unsafe { node.as_ref() } {
            if n.seq <= seq {
                break;
            }
            node = n.prev.load(Ordering::Acquire, guard);
        }
        node
    }
}

/// A node together with the record read from its `info` field.
struct Linked<'g, K, V> {
    node: Shared<'g, Node<K, V>>,
    info: Shared<'g, Info<K, V>>,
}

impl<'g, K, V> Clone for Linked<'g, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, K, V> Copy for Linked<'g, K, V> {}

impl<'g, K, V> Linked<'g, K, V> {
    fn read(node: Shared<'g, Node<K, V>>, guard: &'g Guard) -> Self {
        Self {
            node,
            info: unsafe { node.deref() }.info.load(Ordering::SeqCst, guard),
        }
    }
}

/// Allocates the nodes of one update, stamped with its start time. Nodes
/// that never make it into a record are freed on drop.
struct Builder<'g, K, V> {
    seq: u64,
    fresh: Vec<Shared<'g, Node<K, V>>>,
    guard: &'g Guard,
}

impl<'g, K, V> Drop for Builder<'g, K, V> {
    fn drop(&mut self) {
        for node in self.fresh.drain(..) {
            unsafe { drop(node.into_owned()) };
        }
    }
}

impl<'g, K, V> Builder<'g, K, V> {
    fn new(seq: u64, guard: &'g Guard) -> Self {
        Self {
            seq,
            fresh: Vec::new(),
            guard,
        }
    }

    fn alloc(&mut self, node: Node<K, V>) -> Shared<'g, Node<K, V>> {
        let node = Owned::new(node).into_shared(self.guard);
        self.fresh.push(node);
        node
    }

    fn leaf(&mut self, leaf: Leaf<K, V>, prev: Shared<'g, Node<K, V>>) -> Shared<'g, Node<K, V>> {
        let seq = self.seq;
        self.alloc(Node::leaf(leaf, prev, seq))
    }

    fn internal(
        &mut self,
        key: Key<K>,
        left: Shared<'g, Node<K, V>>,
        right: Shared<'g, Node<K, V>>,
        prev: Shared<'g, Node<K, V>>,
    ) -> Shared<'g, Node<K, V>> {
        let seq = self.seq;
        self.alloc(Node::internal(key, left, right, prev, seq))
    }

    /// Packs the record that flags `nodes[0]` and removes the rest. Fails if
    /// one of the records read from them has been reclaimed meanwhile.
    fn finish(
        mut self,
        nodes: &[Linked<'g, K, V>],
        new_node: Shared<'g, Node<K, V>>,
    ) -> Option<Shared<'g, Info<K, V>>> {
        let guard = self.guard;
        let mut acquired = Vec::with_capacity(nodes.len());
        for link in nodes {
            if let Some(info) = unsafe { link.info.as_ref() } {
                if !info.try_acquire() {
                    for info in acquired {
                        unsafe { release(info, guard) };
                    }
                    return None;
                }
                acquired.push(link.info);
            }
        }

        let info = Info {
            state: AtomicU8::new(PENDING),
            // The creator's count and the flag's.
            refs: AtomicUsize::new(2),
            seq: self.seq,
            nodes: nodes.iter().map(|link| Atomic::from(link.node)).collect(),
            expected: nodes.iter().map(|link| Atomic::from(link.info)).collect(),
            new_node: Atomic::from(new_node),
            fresh: self.fresh.drain(..).map(Atomic::from).collect(),
        };
        Some(Owned::new(info).into_shared(guard))
    }
}

struct Cursor<'g, K, V> {
    /// Camera time the search read the tree at.
    seq: u64,
    gp: Linked<'g, K, V>,
    p: Linked<'g, K, V>,
    l: Shared<'g, Node<K, V>>,
}

impl<'g, K, V> Cursor<'g, K, V> {
    #[inline]
    fn parent(&self) -> &'g Internal<K, V> {
        unsafe { self.p.node.deref() }.as_internal()
    }

    #[inline]
    fn leaf(&self) -> &'g Leaf<K, V> {
        unsafe { self.l.deref() }.as_leaf()
    }
}

pub struct PnbBatchTree<K, V> {
    root: Atomic<Node<K, V>>,
    camera: Camera,
    batching_degree: usize,
}

impl<K, V> Drop for PnbBatchTree<K, V> {
    fn drop(&mut self) {
        // Replaced versions were retired when they were replaced. What is
        // left is the current tree and the records its nodes point at.
        unsafe {
            let guard = unprotected();
            let mut infos = Vec::new();
            let mut stack = vec![self.root.load(Ordering::Relaxed, guard)];
            while let Some(node) = stack.pop() {
                if node.is_null() {
                    continue;
                }
                let node_ref = node.deref();
                if let Body::Internal(internal) = &node_ref.body {
                    stack.push(internal.left.load(Ordering::Relaxed, guard));
                    stack.push(internal.right.load(Ordering::Relaxed, guard));
                }
                let info = node_ref.info.load(Ordering::Relaxed, guard);
                if !info.is_null() {
                    infos.push(info);
                }
                drop(node.into_owned());
            }
            // An aborted record may still sit in several nodes.
            infos.sort_by_key(|info| info.as_raw());
            infos.dedup();
            for info in infos {
                drop(info.into_owned());
            }
        }
    }
}

impl<K, V> Default for PnbBatchTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PnbBatchTree<K, V> {
    /// Runs `info` to the end. Returns whether it committed.
    fn help<'g>(&self, info: Shared<'g, Info<K, V>>, guard: &'g Guard) -> bool {
        let op = unsafe { info.deref() };
        if op.state() == PENDING {
            let next = if self.camera.read() == op.seq {
                TRY
            } else {
                ABORTED
            };
            if op
                .state
                .compare_exchange(PENDING, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
                && next == ABORTED
            {
                complete(info, ABORTED, guard);
            }
        }
        if op.state() != TRY {
            return op.state() == COMMITTED;
        }

        for (node, expected) in op.nodes.iter().zip(&op.expected).skip(1) {
            let node = node.load(Ordering::Relaxed, guard);
            let expected = expected.load(Ordering::Relaxed, guard);
            if !op.try_acquire() {
                // Every reference is gone, so the record has finished.
                return op.state() == COMMITTED;
            }
            match unsafe { node.deref() }.info.compare_exchange(
                expected,
                info,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            ) {
                Ok(_) => {
                    if !expected.is_null() {
                        unsafe { release(expected, guard) };
                    }
                }
                Err(e) => {
                    unsafe { release(info, guard) };
                    if e.current != info {
                        if op
                            .state
                            .compare_exchange(TRY, ABORTED, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            complete(info, ABORTED, guard);
                        }
                        return op.state() == COMMITTED;
                    }
                }
            }
        }

        let parent = unsafe { op.nodes[0].load(Ordering::Relaxed, guard).deref() }.as_internal();
        let old = op.nodes[1].load(Ordering::Relaxed, guard);
        let new_node = op.new_node.load(Ordering::Relaxed, guard);
        let slot = if parent.left.load(Ordering::SeqCst, guard) == old {
            &parent.left
        } else {
            &parent.right
        };
        if slot
            .compare_exchange(old, new_node, Ordering::SeqCst, Ordering::SeqCst, guard)
            .is_ok()
        {
            for node in &op.nodes[1..] {
                unsafe {
                    release(info, guard);
                    guard.defer_destroy(node.load(Ordering::Relaxed, guard));
                }
            }
        }
        if op
            .state
            .compare_exchange(TRY, COMMITTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            complete(info, COMMITTED, guard);
        }
        op.state() == COMMITTED
    }

    /// Checks that `child` hangs on the `left` side of `parent` and that no
    /// record holds `parent`. A record in progress is helped first.
    fn validate_link<'g>(
        &self,
        parent: Shared<'g, Node<K, V>>,
        child: Shared<'g, Node<K, V>>,
        left: bool,
        guard: &'g Guard,
    ) -> Option<Linked<'g, K, V>> {
        let link = Linked::read(parent, guard);
        if let Some(info) = unsafe { link.info.as_ref() } {
            if info.in_progress() {
                self.help(link.info, guard);
                return None;
            }
            if info.freezes(parent, guard) {
                return None;
            }
        }
        let internal = unsafe { parent.deref() }.as_internal();
        (internal.slot(left).load(Ordering::SeqCst, guard) == child).then_some(link)
    }
}

impl<K, V> PnbBatchTree<K, V>
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
        debug!("PNB batch tree: batching degree {}", params.batching_degree);
        let guard = unsafe { unprotected() };
        let empty = || Owned::new(Node::leaf(Leaf::empty(), Shared::null(), 0)).into_shared(guard);
        let inner = Owned::new(Node::internal(Key::Inf, empty(), empty(), Shared::null(), 0))
            .into_shared(guard);
        Self {
            root: Atomic::new(Node::internal(Key::Inf, inner, empty(), Shared::null(), 0)),
            camera: Camera::new(),
            batching_degree: params.batching_degree,
        }
    }

    fn view<'g>(&'g self, guard: &'g Guard) -> LiveView<'g, K, V> {
        LiveView {
            root: self.root.load(Ordering::Acquire, guard),
            guard,
        }
    }

    /// Advances the camera and reads the tree as of the time before.
    fn snapshot<'g>(&'g self, guard: &'g Guard) -> SnapshotView<'g, K, V> {
        SnapshotView {
            tree: self,
            root: self.root.load(Ordering::Acquire, guard),
            seq: self.camera.take_snapshot(),
            guard,
        }
    }

    /// Finds the leaf for `key` as of the current camera time, with its
    /// parent and grandparent validated.
    fn locate<'g>(&'g self, key: &K, guard: &'g Guard) -> Cursor<'g, K, V> {
        loop {
            let seq = self.camera.read();
            let mut gp = Shared::null();
            let mut p = Shared::null();
            let mut l = self.root.load(Ordering::Acquire, guard);
            while let Some(node) = unsafe { l.as_ref() } {
                let Body::Internal(internal) = &node.body else {
                    break;
                };
                gp = p;
                p = l;
                l = internal.child_at(internal.key.goes_left(key), seq, guard);
            }
            if l.is_null() || gp.is_null() {
                continue;
            }
            if let Some((gp, p)) = self.validate_leaf(gp, p, l, key, guard) {
                return Cursor { seq, gp, p, l };
            }
        }
    }

    fn validate_leaf<'g>(
        &'g self,
        gp: Shared<'g, Node<K, V>>,
        p: Shared<'g, Node<K, V>>,
        l: Shared<'g, Node<K, V>>,
        key: &K,
        guard: &'g Guard,
    ) -> Option<(Linked<'g, K, V>, Linked<'g, K, V>)> {
        let p_key = &unsafe { p.deref() }.as_internal().key;
        let gp_key = &unsafe { gp.deref() }.as_internal().key;
        let p_link = self.validate_link(p, l, p_key.goes_left(key), guard)?;
        let gp_link = self.validate_link(gp, p, gp_key.goes_left(key), guard)?;
        let unchanged = Linked::read(p, guard).info == p_link.info
            && Linked::read(gp, guard).info == gp_link.info;
        unchanged.then_some((gp_link, p_link))
    }

    pub fn get<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        self.locate(key, guard).leaf().get(key)
    }

    pub fn put_if_absent<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        loop {
            let cursor = self.locate(&key, guard);
            let leaf = cursor.leaf();
            if let Some(value) = leaf.get(&key) {
                return Some(value);
            }
            if self.camera.read() != cursor.seq {
                continue;
            }

            let mut b = Builder::new(cursor.seq, guard);
            let new_node = if leaf.len() < self.batching_degree {
                b.leaf(leaf.with_inserted(key.clone(), value.clone()), cursor.l)
            } else {
                let (left, right) = leaf.split_inserted(key.clone(), value.clone());
                let sep = Key::Fin(right.keys()[0].clone());
                let left = b.leaf(left, Shared::null());
                let right = b.leaf(right, Shared::null());
                b.internal(sep, left, right, cursor.l)
            };
            let l = Linked::read(cursor.l, guard);
            if self.execute(&[cursor.p, l], new_node, b, guard) {
                return None;
            }
        }
    }

    /// Removes `key`. The returned value lives in the retired leaf and stays
    /// readable for as long as `guard` is pinned.
    pub fn remove<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V> {
        loop {
            let cursor = self.locate(key, guard);
            let leaf = cursor.leaf();
            let value = leaf.get(key)?;
            let parent = cursor.parent();
            let l = Linked::read(cursor.l, guard);

            if leaf.len() > 1 || parent.key.is_inf() {
                let mut b = Builder::new(cursor.seq, guard);
                let shrunk = b.leaf(leaf.with_removed(key), cursor.l);
                if self.execute(&[cursor.p, l], shrunk, b, guard) {
                    return Some(value);
                }
                continue;
            }

            // The leaf empties: its parent goes too, and a copy of the
            // sibling takes the parent's place.
            let sibling_left = !parent.key.goes_left(key);
            let sibling = parent.child_at(sibling_left, cursor.seq, guard);
            if sibling.is_null()
                || self
                    .validate_link(cursor.p.node, sibling, sibling_left, guard)
                    .is_none()
                || self.camera.read() != cursor.seq
            {
                continue;
            }

            let mut b = Builder::new(cursor.seq, guard);
            let (copy, s) = match &unsafe { sibling.deref() }.body {
                Body::Leaf(sibling_leaf) => (
                    b.leaf(sibling_leaf.clone(), cursor.p.node),
                    Linked::read(sibling, guard),
                ),
                Body::Internal(internal) => {
                    let left = internal.left.load(Ordering::Acquire, guard);
                    let right = internal.right.load(Ordering::Acquire, guard);
                    let Some(s) = self.validate_link(sibling, left, true, guard) else {
                        continue;
                    };
                    if self.validate_link(sibling, right, false, guard).is_none() {
                        continue;
                    }
                    (
                        b.internal(internal.key.clone(), left, right, cursor.p.node),
                        s,
                    )
                }
            };
            if self.execute(&[cursor.gp, cursor.p, l, s], copy, b, guard) {
                return Some(value);
            }
        }
    }

    /// Flags `nodes[0]` with a record that replaces `nodes[1]` by `new_node`
    /// and removes the remaining nodes, then runs it. Returns whether the
    /// record committed.
    fn execute<'g>(
        &'g self,
        nodes: &[Linked<'g, K, V>],
        new_node: Shared<'g, Node<K, V>>,
        builder: Builder<'g, K, V>,
        guard: &'g Guard,
    ) -> bool {
        for link in nodes {
            if let Some(info) = unsafe { link.info.as_ref() } {
                if info.freezes(link.node, guard) {
                    if info.in_progress() {
                        self.help(link.info, guard);
                    }
                    return false;
                }
            }
        }
        if self.camera.read() != builder.seq {
            return false;
        }
        let Some(info) = builder.finish(nodes, new_node) else {
            return false;
        };

        let flagged = unsafe { nodes[0].node.deref() };
        match flagged.info.compare_exchange(
            nodes[0].info,
            info,
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            Ok(_) => {
                if !nodes[0].info.is_null() {
                    unsafe { release(nodes[0].info, guard) };
                }
                let committed = self.help(info, guard);
                unsafe { release(info, guard) };
                committed
            }
            Err(_) => {
                unsafe { discard(info, guard) };
                false
            }
        }
    }

    /// Largest build time among the current nodes.
    fn newest_seq(&self, guard: &Guard) -> u64 {
        let mut newest = 0;
        let mut stack = vec![self.root.load(Ordering::Acquire, guard)];
        while let Some(node) = stack.pop() {
            let Some(node) = (unsafe { node.as_ref() }) else {
                continue;
            };
            newest = newest.max(node.seq);
            if let Body::Internal(internal) = &node.body {
                stack.push(internal.left.load(Ordering::Acquire, guard));
                stack.push(internal.right.load(Ordering::Acquire, guard));
            }
        }
        newest
    }
}

/// The current versions. Walks over it are not linearizable.
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

/// The tree as of a camera snapshot.
struct SnapshotView<'g, K, V> {
    tree: &'g PnbBatchTree<K, V>,
    root: Shared<'g, Node<K, V>>,
    seq: u64,
    guard: &'g Guard,
}

impl<'g, K: 'g, V: 'g> TreeView<'g, K, V> for SnapshotView<'g, K, V> {
    type Node = Shared<'g, Node<K, V>>;

    fn root(&self) -> Self::Node {
        self.root
    }

    fn view(&self, node: Self::Node) -> Option<NodeView<'g, K, V, Self::Node>> {
        let node_ref = unsafe { node.as_ref() }?;
        Some(match &node_ref.body {
            Body::Leaf(leaf) => NodeView::Leaf(leaf),
            Body::Internal(internal) => {
                // An update that passed its handshake before the snapshot may
                // still have to swing one of these children.
                let info = node_ref.info.load(Ordering::SeqCst, self.guard);
                if unsafe { info.as_ref() }.map_or(false, |info| info.in_progress()) {
                    self.tree.help(info, self.guard);
                }
                NodeView::Internal {
                    key: &internal.key,
                    left: internal.child_at(true, self.seq, self.guard),
                    right: internal.child_at(false, self.seq, self.guard),
                }
            }
        })
    }
}

impl<K, V> ConcurrentMap<K, V> for PnbBatchTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn new() -> Self {
        PnbBatchTree::new()
    }

    fn with_params(params: TreeParams) -> Result<Self> {
        PnbBatchTree::with_params(params)
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

impl<K, V> RangeMap<K, V> for PnbBatchTree<K, V>
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
        let now = self.camera.read();
        traverse::validate(&self.view(guard), self.batching_degree)
            .and_then(|stats| match self.newest_seq(guard) {
                newest if newest > now => Err(Error::Invariant(format!(
                    "node built at {} is ahead of the camera at {}",
                    newest, now
                ))),
                _ => Ok(stats),
            })
            .map_err(|e| {
                debug!("PNB batch tree failed validation: {}", e);
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::PnbBatchTree;
    use crate::ds_impl::concurrent_map::{self, ConcurrentMap, RangeMap};
    use crate::ds_impl::params::TreeParams;
    use crate::ds_impl::traverse;
    use crossbeam_ebr::pin;

    #[test]
    fn smoke_pnb_batch_tree() {
        concurrent_map::tests::smoke::<PnbBatchTree<i32, String>>();
    }

    #[test]
    fn single_key_pnb_batch_tree() {
        concurrent_map::tests::single_key::<PnbBatchTree<i32, i32>>();
    }

    #[test]
    fn range_scenario_pnb_batch_tree() {
        concurrent_map::tests::range_scenario::<PnbBatchTree<i32, i32>>();
    }

    #[test]
    fn model_pnb_batch_tree() {
        concurrent_map::tests::against_model::<PnbBatchTree<i32, i32>>();
    }

    #[test]
    fn contended_pnb_batch_tree() {
        concurrent_map::tests::contended_key_sum::<PnbBatchTree<i32, i32>>();
        concurrent_map::tests::no_lost_inserts::<PnbBatchTree<i32, i32>>();
    }

    #[test]
    fn updates_are_stamped_with_the_camera() {
        let tree = PnbBatchTree::with_params(TreeParams::default().batching_degree(2)).unwrap();
        let guard = &pin();
        assert!(tree.insert(1, 1, guard));
        assert_eq!(tree.newest_seq(guard), 0);

        tree.camera.take_snapshot();
        tree.camera.take_snapshot();
        assert!(tree.insert(2, 2, guard));
        assert!(tree.insert(3, 3, guard));
        assert_eq!(tree.newest_seq(guard), 2);
        tree.validate(guard).unwrap();
    }

    #[test]
    fn snapshot_ignores_later_updates() {
        let tree = PnbBatchTree::with_params(TreeParams::default().batching_degree(4)).unwrap();
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

        let old: Vec<i32> = traverse::range_scan(&snapshot, &0, &200)
            .into_iter()
            .copied()
            .collect();
        assert_eq!(old, (0..100).collect::<Vec<_>>());
        assert_eq!(traverse::get(&snapshot, &120), None);
        assert_eq!(traverse::get(&snapshot, &3), Some(&3));

        let now = tree.range_scan(&0, &200, guard);
        assert_eq!(now.len(), 100 - 34 + 50);
        assert_eq!(tree.range_sum(&100, &149, guard), (100..150).sum::<i64>());
        tree.validate(guard).unwrap();
    }

    #[test]
    fn collapses_down_to_an_empty_tree() {
        let tree = PnbBatchTree::with_params(TreeParams::default().batching_degree(2)).unwrap();
        let guard = &pin();
        for key in 0..64 {
            assert!(tree.insert(key, key * 2, guard));
        }
        let stats = tree.validate(guard).unwrap();
        assert_eq!(stats.keys, 64);
        assert!(stats.leaves >= 32);

        for key in (0..64).rev() {
            assert_eq!(tree.remove(&key, guard), Some(&(key * 2)));
        }
        let stats = tree.validate(guard).unwrap();
        assert_eq!(stats.keys, 0);
        assert_eq!(stats.internals, 0);
        assert!(tree.insert(5, 5, guard));
        assert_eq!(tree.get(&5, guard), Some(&5));
    }
}
