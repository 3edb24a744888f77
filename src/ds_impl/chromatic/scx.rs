//! Lock-free multi-node updates (LLX/SCX) for the chromatic tree.
//!
//! An [`Operation`] freezes a set of nodes by installing itself in their `op`
//! fields, marks every frozen node except the first, and finally swings one
//! child pointer of the first node to a freshly built subtree. Any thread
//! that runs into an operation in progress finishes it.
//!
//! Operation records are reference counted: one count for the creating
//! thread, one for every node whose `op` field points at the record, and one
//! for every unfinished operation that expects to find the record in some
//! node. The record is handed to the epoch collector when the count drops
//! to zero, so a record can never be recycled while an operation still
//! compares against its address.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crossbeam_ebr::{Atomic, Guard, Owned, Shared};

use super::{Body, Node};
use crate::ds_impl::key::Key;

const IN_PROGRESS: u8 = 0;
const ABORTED: u8 = 1;
const COMMITTED: u8 = 2;

pub struct Operation<K, V> {
    state: AtomicU8,
    all_frozen: AtomicBool,
    refs: AtomicUsize,
    nodes: Vec<Atomic<Node<K, V>>>,
    /// `op` of each node when it was read; null for never-frozen nodes and leaves.
    expected: Vec<Atomic<Operation<K, V>>>,
    subtree: Atomic<Node<K, V>>,
    removed: Vec<Atomic<Node<K, V>>>,
    fresh: Vec<Atomic<Node<K, V>>>,
}

impl<K, V> Operation<K, V> {
    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
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

/// Drops one reference to `op`, retiring it when it was the last one.
///
/// # Safety
///
/// The caller must own the reference it drops.
pub unsafe fn release<K, V>(op: Shared<'_, Operation<K, V>>, guard: &Guard) {
    if op.deref().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        guard.defer_destroy(op);
    }
}

/// A node together with the operation found in it by a weak LLX.
pub struct Linked<'g, K, V> {
    pub node: Shared<'g, Node<K, V>>,
    pub op: Shared<'g, Operation<K, V>>,
}

impl<'g, K, V> Clone for Linked<'g, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, K, V> Copy for Linked<'g, K, V> {}

/// Reads `node`'s operation and returns it if the node is not frozen for an
/// operation in progress. A frozen node is helped and `None` is returned.
/// Leaves are never frozen.
pub fn weak_llx<'g, K, V>(node: Shared<'g, Node<K, V>>, guard: &'g Guard) -> Option<Linked<'g, K, V>> {
    let internal = match &unsafe { node.deref() }.body {
        Body::Leaf(_) => {
            return Some(Linked {
                node,
                op: Shared::null(),
            })
        }
        Body::Internal(internal) => internal,
    };
    let op = internal.op.load(Ordering::SeqCst, guard);
    let Some(op_ref) = (unsafe { op.as_ref() }) else {
        return Some(Linked { node, op });
    };
    let state = op_ref.state();
    if state == ABORTED || (state == COMMITTED && !internal.marked.load(Ordering::SeqCst)) {
        return Some(Linked { node, op });
    }
    if state == IN_PROGRESS {
        help_scx(op, 1, guard);
    } else {
        let current = internal.op.load(Ordering::SeqCst, guard);
        if let Some(current_ref) = unsafe { current.as_ref() } {
            if current_ref.state() == IN_PROGRESS {
                help_scx(current, 1, guard);
            }
        }
    }
    None
}

fn complete<K, V>(op: Shared<'_, Operation<K, V>>, state: u8, guard: &Guard) {
    let op_ref = unsafe { op.deref() };
    if op_ref
        .state
        .compare_exchange(IN_PROGRESS, state, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    for expected in &op_ref.expected {
        let expected = expected.load(Ordering::Relaxed, guard);
        if !expected.is_null() {
            unsafe { release(expected, guard) };
        }
    }
    if state == ABORTED {
        for node in &op_ref.fresh {
            unsafe { guard.defer_destroy(node.load(Ordering::Relaxed, guard)) };
        }
    }
}

/// Runs `op` from its `start`th node. Returns false iff the operation was
/// aborted because some node changed since it was read.
pub fn help_scx<'g, K, V>(op: Shared<'g, Operation<K, V>>, start: usize, guard: &'g Guard) -> bool {
    let op_ref = unsafe { op.deref() };
    if op_ref.state() != IN_PROGRESS {
        return true;
    }

    for i in start..op_ref.nodes.len() {
        let node = op_ref.nodes[i].load(Ordering::Relaxed, guard);
        let Body::Internal(internal) = &unsafe { node.deref() }.body else {
            continue;
        };
        if !op_ref.try_acquire() {
            // Every reference is gone, so the operation has finished.
            return true;
        }
        let expected = op_ref.expected[i].load(Ordering::Relaxed, guard);
        match internal
            .op
            .compare_exchange(expected, op, Ordering::SeqCst, Ordering::SeqCst, guard)
        {
            Ok(_) => {
                if !expected.is_null() {
                    unsafe { release(expected, guard) };
                }
            }
            Err(e) => {
                unsafe { release(op, guard) };
                if e.current != op {
                    if op_ref.all_frozen.load(Ordering::SeqCst) {
                        return true;
                    }
                    complete(op, ABORTED, guard);
                    return false;
                }
            }
        }
    }
    op_ref.all_frozen.store(true, Ordering::SeqCst);

    for node in &op_ref.nodes[1..] {
        let node = node.load(Ordering::Relaxed, guard);
        if let Body::Internal(internal) = &unsafe { node.deref() }.body {
            internal.marked.store(true, Ordering::SeqCst);
        }
    }

    let parent = op_ref.nodes[0].load(Ordering::Relaxed, guard);
    let Body::Internal(parent) = &unsafe { parent.deref() }.body else {
        unreachable!("the first frozen node is the parent of the replaced subtree")
    };
    let old = op_ref.nodes[1].load(Ordering::Relaxed, guard);
    let subtree = op_ref.subtree.load(Ordering::Relaxed, guard);
    let slot = if parent.left.load(Ordering::SeqCst, guard) == old {
        &parent.left
    } else {
        &parent.right
    };
    let replaced = slot
        .compare_exchange(old, subtree, Ordering::SeqCst, Ordering::SeqCst, guard)
        .is_ok();
    complete(op, COMMITTED, guard);
    if replaced {
        for node in &op_ref.removed {
            let node = node.load(Ordering::Relaxed, guard);
            unsafe {
                if let Body::Internal(_) = &node.deref().body {
                    release(op, guard);
                }
                guard.defer_destroy(node);
            }
        }
    }
    true
}

/// Runs a freshly built operation and drops the creator's reference.
pub fn execute<'g, K, V>(op: Shared<'g, Operation<K, V>>, guard: &'g Guard) -> bool {
    let done = help_scx(op, 0, guard);
    unsafe { release(op, guard) };
    done
}

/// Allocates the nodes of a replacement subtree. Nodes that never make it
/// into a published operation are freed on drop.
pub struct Builder<'g, K, V> {
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
    pub fn new(guard: &'g Guard) -> Self {
        Self {
            fresh: Vec::new(),
            guard,
        }
    }

    pub fn alloc(&mut self, node: Node<K, V>) -> Shared<'g, Node<K, V>> {
        let node = Owned::new(node).into_shared(self.guard);
        self.fresh.push(node);
        node
    }

    pub fn internal(
        &mut self,
        key: Key<K>,
        weight: usize,
        left: Shared<'g, Node<K, V>>,
        right: Shared<'g, Node<K, V>>,
    ) -> Shared<'g, Node<K, V>> {
        self.alloc(Node::internal(key, weight, left, right))
    }

    /// Packs the operation that replaces `linked[1..]` (and `also_removed`)
    /// below `linked[0]` with `subtree`. Fails if one of the operations read
    /// by LLX has been reclaimed meanwhile.
    pub fn finish(
        mut self,
        linked: &[Linked<'g, K, V>],
        subtree: Shared<'g, Node<K, V>>,
        also_removed: Option<Shared<'g, Node<K, V>>>,
    ) -> Option<Shared<'g, Operation<K, V>>> {
        let guard = self.guard;
        let mut acquired = Vec::with_capacity(linked.len());
        for link in linked {
            if let Some(op) = unsafe { link.op.as_ref() } {
                if !op.try_acquire() {
                    for op in acquired {
                        unsafe { release(op, guard) };
                    }
                    return None;
                }
                acquired.push(link.op);
            }
        }

        let op = Operation {
            state: AtomicU8::new(IN_PROGRESS),
            all_frozen: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
            nodes: linked.iter().map(|link| Atomic::from(link.node)).collect(),
            expected: linked.iter().map(|link| Atomic::from(link.op)).collect(),
            subtree: Atomic::from(subtree),
            removed: linked[1..]
                .iter()
                .map(|link| link.node)
                .chain(also_removed)
                .map(Atomic::from)
                .collect(),
            fresh: self.fresh.drain(..).map(Atomic::from).collect(),
        };
        Some(Owned::new(op).into_shared(guard))
    }
}

impl<'g, K: Clone, V: Clone> Builder<'g, K, V> {
    /// A new node with `node`'s contents and the given weight.
    pub fn copy(&mut self, node: Shared<'g, Node<K, V>>, weight: usize) -> Shared<'g, Node<K, V>> {
        let copy = match &unsafe { node.deref() }.body {
            Body::Leaf(leaf) => Node::leaf(leaf.clone(), weight),
            Body::Internal(internal) => Node::internal(
                internal.key.clone(),
                weight,
                internal.left.load(Ordering::Acquire, self.guard),
                internal.right.load(Ordering::Acquire, self.guard),
            ),
        };
        self.alloc(copy)
    }
}
