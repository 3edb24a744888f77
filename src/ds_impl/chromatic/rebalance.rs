//! Rebalancing steps of the chromatic tree.
//!
//! A violation is either an overweight node (weight above one) or a red-red
//! pair (a zero-weight node under a zero-weight parent). Each step replaces a
//! small window of nodes around the violation with a rebuilt window that
//! keeps every root-to-leaf weight sum and either removes the violation or
//! moves it towards the root. Names follow the usual chromatic tree
//! transformations: BLK, RB1, RB2, PUSH and W1 to W7, each with a mirror.

use std::sync::atomic::Ordering;

use crossbeam_ebr::{Guard, Shared};

use super::scx::{weak_llx, Builder, Linked, Operation};
use super::{ChromaticTree, Internal, Node};
use crate::ds_impl::key::Key;

#[inline]
fn weight<K, V>(node: Shared<'_, Node<K, V>>) -> usize {
    unsafe { node.deref() }.weight
}

#[inline]
fn internal<'g, K, V>(node: Shared<'g, Node<K, V>>) -> Option<&'g Internal<K, V>> {
    unsafe { node.deref() }.as_internal()
}

#[inline]
fn key<K: Clone, V>(node: Shared<'_, Node<K, V>>) -> Option<Key<K>> {
    internal(node).map(|n| n.key.clone())
}

#[inline]
fn left<'g, K, V>(node: Shared<'g, Node<K, V>>, guard: &'g Guard) -> Option<Shared<'g, Node<K, V>>> {
    internal(node).map(|n| n.left.load(Ordering::Acquire, guard))
}

#[inline]
fn right<'g, K, V>(node: Shared<'g, Node<K, V>>, guard: &'g Guard) -> Option<Shared<'g, Node<K, V>>> {
    internal(node).map(|n| n.right.load(Ordering::Acquire, guard))
}

/// The nodes around a violation at `fxxx`, read top-down with LLX.
struct Window<'g, K, V> {
    f: Linked<'g, K, V>,
    fx: Linked<'g, K, V>,
    fxx: Linked<'g, K, V>,
    fxl: Shared<'g, Node<K, V>>,
    fxr: Shared<'g, Node<K, V>>,
    fxxl: Shared<'g, Node<K, V>>,
    fxxr: Shared<'g, Node<K, V>>,
    fxx_left: bool,
}

type Op<'g, K, V> = Option<Shared<'g, Operation<K, V>>>;

impl<K, V> ChromaticTree<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    /// Builds the step that fixes the violation at `fxxx`, whose parent,
    /// grandparent and great-grandparent are `fxx`, `fx` and `f`. Returns
    /// `None` if the window changed while it was read.
    pub(super) fn create_balancing_op<'g>(
        &'g self,
        f: Shared<'g, Node<K, V>>,
        fx: Shared<'g, Node<K, V>>,
        fxx: Shared<'g, Node<K, V>>,
        fxxx: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) -> Op<'g, K, V> {
        let f = weak_llx(f, guard)?;
        if !internal(f.node)?.has_child(fx, guard) {
            return None;
        }

        let fx = weak_llx(fx, guard)?;
        let fxl = left(fx.node, guard)?;
        let fxr = right(fx.node, guard)?;
        let fxx_left = fxx == fxl;
        if !fxx_left && fxx != fxr {
            return None;
        }

        let fxx = weak_llx(fxx, guard)?;
        let fxxl = left(fxx.node, guard)?;
        let fxxr = right(fxx.node, guard)?;
        let fxxx_left = fxxx == fxxl;
        if !fxxx_left && fxxx != fxxr {
            return None;
        }

        let w = Window {
            f,
            fx,
            fxx,
            fxl,
            fxr,
            fxxl,
            fxxr,
            fxx_left,
        };

        if weight(fxxx) > 1 {
            return if fxxx_left {
                let fxxl = weak_llx(fxxl, guard)?;
                self.overweight_left(&w, fxxl, guard)
            } else {
                let fxxr = weak_llx(fxxr, guard)?;
                self.overweight_right(&w, fxxr, guard)
            };
        }

        // red-red
        if fxx_left {
            if weight(fxr) == 0 {
                let fxr = weak_llx(fxr, guard)?;
                self.blk([f, fx, w.fxx, fxr], guard)
            } else if fxxx_left {
                self.rb1([f, fx, w.fxx], guard)
            } else {
                let fxxr = weak_llx(fxxr, guard)?;
                self.rb2([f, fx, w.fxx, fxxr], guard)
            }
        } else if weight(fxl) == 0 {
            let fxl = weak_llx(fxl, guard)?;
            self.blk([f, fx, fxl, w.fxx], guard)
        } else if !fxxx_left {
            self.rb1_sym([f, fx, w.fxx], guard)
        } else {
            let fxxl = weak_llx(fxxl, guard)?;
            self.rb2_sym([f, fx, w.fxx, fxxl], guard)
        }
    }

    fn overweight_left<'g>(
        &'g self,
        w: &Window<'g, K, V>,
        fxxl: Linked<'g, K, V>,
        guard: &'g Guard,
    ) -> Op<'g, K, V> {
        let Window { f, fx, fxx, .. } = *w;
        match weight(w.fxxr) {
            0 if weight(fxx.node) == 0 => {
                if w.fxx_left {
                    if weight(w.fxr) == 0 {
                        let fxr = weak_llx(w.fxr, guard)?;
                        self.blk([f, fx, fxx, fxr], guard)
                    } else {
                        let fxxr = weak_llx(w.fxxr, guard)?;
                        self.rb2([f, fx, fxx, fxxr], guard)
                    }
                } else if weight(w.fxl) == 0 {
                    let fxl = weak_llx(w.fxl, guard)?;
                    self.blk([f, fx, fxl, fxx], guard)
                } else {
                    self.rb1_sym([f, fx, fxx], guard)
                }
            }
            0 => {
                let fxxr = weak_llx(w.fxxr, guard)?;
                let fxxrl = weak_llx(left(fxxr.node, guard)?, guard)?;
                match weight(fxxrl.node) {
                    0 => self.rb2_sym([fx, fxx, fxxr, fxxrl], guard),
                    1 => {
                        let fxxrlr = right(fxxrl.node, guard)?;
                        if weight(fxxrlr) == 0 {
                            let fxxrlr = weak_llx(fxxrlr, guard)?;
                            self.w4([fx, fxx, fxxl, fxxr, fxxrl, fxxrlr], guard)
                        } else {
                            let fxxrll = left(fxxrl.node, guard)?;
                            if weight(fxxrll) == 0 {
                                let fxxrll = weak_llx(fxxrll, guard)?;
                                self.w3([fx, fxx, fxxl, fxxr, fxxrl, fxxrll], guard)
                            } else {
                                self.w2([fx, fxx, fxxl, fxxr, fxxrl], guard)
                            }
                        }
                    }
                    _ => self.w1([fx, fxx, fxxl, fxxr, fxxrl], guard),
                }
            }
            1 => {
                let fxxr = weak_llx(w.fxxr, guard)?;
                let fxxrl = left(fxxr.node, guard)?;
                let fxxrr = right(fxxr.node, guard)?;
                if weight(fxxrr) == 0 {
                    let fxxrr = weak_llx(fxxrr, guard)?;
                    self.w5([fx, fxx, fxxl, fxxr, fxxrr], guard)
                } else if weight(fxxrl) == 0 {
                    let fxxrl = weak_llx(fxxrl, guard)?;
                    self.w6([fx, fxx, fxxl, fxxr, fxxrl], guard)
                } else {
                    self.push([fx, fxx, fxxl, fxxr], guard)
                }
            }
            _ => {
                let fxxr = weak_llx(w.fxxr, guard)?;
                self.w7([fx, fxx, fxxl, fxxr], guard)
            }
        }
    }

    fn overweight_right<'g>(
        &'g self,
        w: &Window<'g, K, V>,
        fxxr: Linked<'g, K, V>,
        guard: &'g Guard,
    ) -> Op<'g, K, V> {
        let Window { f, fx, fxx, .. } = *w;
        match weight(w.fxxl) {
            0 if weight(fxx.node) == 0 => {
                if !w.fxx_left {
                    if weight(w.fxl) == 0 {
                        let fxl = weak_llx(w.fxl, guard)?;
                        self.blk([f, fx, fxl, fxx], guard)
                    } else {
                        let fxxl = weak_llx(w.fxxl, guard)?;
                        self.rb2_sym([f, fx, fxx, fxxl], guard)
                    }
                } else if weight(w.fxr) == 0 {
                    let fxr = weak_llx(w.fxr, guard)?;
                    self.blk([f, fx, fxx, fxr], guard)
                } else {
                    self.rb1([f, fx, fxx], guard)
                }
            }
            0 => {
                let fxxl = weak_llx(w.fxxl, guard)?;
                let fxxlr = weak_llx(right(fxxl.node, guard)?, guard)?;
                match weight(fxxlr.node) {
                    0 => self.rb2([fx, fxx, fxxl, fxxlr], guard),
                    1 => {
                        let fxxlrl = left(fxxlr.node, guard)?;
                        if weight(fxxlrl) == 0 {
                            let fxxlrl = weak_llx(fxxlrl, guard)?;
                            self.w4_sym([fx, fxx, fxxl, fxxr, fxxlr, fxxlrl], guard)
                        } else {
                            let fxxlrr = right(fxxlr.node, guard)?;
                            if weight(fxxlrr) == 0 {
                                let fxxlrr = weak_llx(fxxlrr, guard)?;
                                self.w3_sym([fx, fxx, fxxl, fxxr, fxxlr, fxxlrr], guard)
                            } else {
                                self.w2_sym([fx, fxx, fxxl, fxxr, fxxlr], guard)
                            }
                        }
                    }
                    _ => self.w1_sym([fx, fxx, fxxl, fxxr, fxxlr], guard),
                }
            }
            1 => {
                let fxxl = weak_llx(w.fxxl, guard)?;
                let fxxlr = right(fxxl.node, guard)?;
                let fxxll = left(fxxl.node, guard)?;
                if weight(fxxll) == 0 {
                    let fxxll = weak_llx(fxxll, guard)?;
                    self.w5_sym([fx, fxx, fxxl, fxxr, fxxll], guard)
                } else if weight(fxxlr) == 0 {
                    let fxxlr = weak_llx(fxxlr, guard)?;
                    self.w6_sym([fx, fxx, fxxl, fxxr, fxxlr], guard)
                } else {
                    self.push_sym([fx, fxx, fxxl, fxxr], guard)
                }
            }
            _ => {
                let fxxl = weak_llx(w.fxxl, guard)?;
                self.w7([fx, fxx, fxxl, fxxr], guard)
            }
        }
    }

    /// Weight for a rebuilt node that takes the place of `node`, which stays
    /// at one if `node` is the top of the tree.
    fn top_weight(&self, node: Shared<'_, Node<K, V>>, weight: usize, guard: &Guard) -> usize {
        if self.is_sentinel(node, guard) {
            1
        } else {
            weight
        }
    }

    fn blk<'g>(&'g self, n: [Linked<'g, K, V>; 4], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xl = b.copy(n[2].node, 1);
        let xr = b.copy(n[3].node, 1);
        let w = self.top_weight(n[1].node, weight(n[1].node).saturating_sub(1), guard);
        let x = b.internal(key(n[1].node)?, w, xl, xr);
        b.finish(&n, x, None)
    }

    fn rb1<'g>(&'g self, n: [Linked<'g, K, V>; 3], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xr = b.internal(
            key(n[1].node)?,
            0,
            right(n[2].node, guard)?,
            right(n[1].node, guard)?,
        );
        let x = b.internal(key(n[2].node)?, weight(n[1].node), left(n[2].node, guard)?, xr);
        b.finish(&n, x, None)
    }

    fn rb1_sym<'g>(&'g self, n: [Linked<'g, K, V>; 3], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xl = b.internal(
            key(n[1].node)?,
            0,
            left(n[1].node, guard)?,
            left(n[2].node, guard)?,
        );
        let x = b.internal(key(n[2].node)?, weight(n[1].node), xl, right(n[2].node, guard)?);
        b.finish(&n, x, None)
    }

    fn rb2<'g>(&'g self, n: [Linked<'g, K, V>; 4], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xl = b.internal(
            key(n[2].node)?,
            0,
            left(n[2].node, guard)?,
            left(n[3].node, guard)?,
        );
        let xr = b.internal(
            key(n[1].node)?,
            0,
            right(n[3].node, guard)?,
            right(n[1].node, guard)?,
        );
        let x = b.internal(key(n[3].node)?, weight(n[1].node), xl, xr);
        b.finish(&n, x, None)
    }

    fn rb2_sym<'g>(&'g self, n: [Linked<'g, K, V>; 4], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xl = b.internal(
            key(n[1].node)?,
            0,
            left(n[1].node, guard)?,
            left(n[3].node, guard)?,
        );
        let xr = b.internal(
            key(n[2].node)?,
            0,
            right(n[3].node, guard)?,
            right(n[2].node, guard)?,
        );
        let x = b.internal(key(n[3].node)?, weight(n[1].node), xl, xr);
        b.finish(&n, x, None)
    }

    fn push<'g>(&'g self, n: [Linked<'g, K, V>; 4], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxl = b.copy(n[2].node, weight(n[2].node) - 1);
        let xxr = b.copy(n[3].node, 0);
        let w = self.top_weight(n[1].node, weight(n[1].node) + 1, guard);
        let xx = b.internal(key(n[1].node)?, w, xxl, xxr);
        b.finish(&n, xx, None)
    }

    fn push_sym<'g>(&'g self, n: [Linked<'g, K, V>; 4], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxl = b.copy(n[2].node, 0);
        let xxr = b.copy(n[3].node, weight(n[3].node) - 1);
        let w = self.top_weight(n[1].node, weight(n[1].node) + 1, guard);
        let xx = b.internal(key(n[1].node)?, w, xxl, xxr);
        b.finish(&n, xx, None)
    }

    fn w1<'g>(&'g self, n: [Linked<'g, K, V>; 5], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxll = b.copy(n[2].node, weight(n[2].node) - 1);
        let xxlr = b.copy(n[4].node, weight(n[4].node) - 1);
        let xxl = b.internal(key(n[1].node)?, 1, xxll, xxlr);
        let xx = b.internal(key(n[3].node)?, weight(n[1].node), xxl, right(n[3].node, guard)?);
        b.finish(&n, xx, None)
    }

    fn w1_sym<'g>(&'g self, n: [Linked<'g, K, V>; 5], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxrl = b.copy(n[4].node, weight(n[4].node) - 1);
        let xxrr = b.copy(n[3].node, weight(n[3].node) - 1);
        let xxr = b.internal(key(n[1].node)?, 1, xxrl, xxrr);
        let xx = b.internal(key(n[2].node)?, weight(n[1].node), left(n[2].node, guard)?, xxr);
        b.finish(&n, xx, None)
    }

    fn w2<'g>(&'g self, n: [Linked<'g, K, V>; 5], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxll = b.copy(n[2].node, weight(n[2].node) - 1);
        let xxlr = b.copy(n[4].node, 0);
        let xxl = b.internal(key(n[1].node)?, 1, xxll, xxlr);
        let xx = b.internal(key(n[3].node)?, weight(n[1].node), xxl, right(n[3].node, guard)?);
        b.finish(&n, xx, None)
    }

    fn w2_sym<'g>(&'g self, n: [Linked<'g, K, V>; 5], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxrl = b.copy(n[4].node, 0);
        let xxrr = b.copy(n[3].node, weight(n[3].node) - 1);
        let xxr = b.internal(key(n[1].node)?, 1, xxrl, xxrr);
        let xx = b.internal(key(n[2].node)?, weight(n[1].node), left(n[2].node, guard)?, xxr);
        b.finish(&n, xx, None)
    }

    fn w3<'g>(&'g self, n: [Linked<'g, K, V>; 6], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxlll = b.copy(n[2].node, weight(n[2].node) - 1);
        let xxll = b.internal(key(n[1].node)?, 1, xxlll, left(n[5].node, guard)?);
        let xxlr = b.internal(
            key(n[4].node)?,
            1,
            right(n[5].node, guard)?,
            right(n[4].node, guard)?,
        );
        let xxl = b.internal(key(n[5].node)?, 0, xxll, xxlr);
        let xx = b.internal(key(n[3].node)?, weight(n[1].node), xxl, right(n[3].node, guard)?);
        b.finish(&n, xx, None)
    }

    fn w3_sym<'g>(&'g self, n: [Linked<'g, K, V>; 6], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxrl = b.internal(
            key(n[4].node)?,
            1,
            left(n[4].node, guard)?,
            left(n[5].node, guard)?,
        );
        let xxrrr = b.copy(n[3].node, weight(n[3].node) - 1);
        let xxrr = b.internal(key(n[1].node)?, 1, right(n[5].node, guard)?, xxrrr);
        let xxr = b.internal(key(n[5].node)?, 0, xxrl, xxrr);
        let xx = b.internal(key(n[2].node)?, weight(n[1].node), left(n[2].node, guard)?, xxr);
        b.finish(&n, xx, None)
    }

    fn w4<'g>(&'g self, n: [Linked<'g, K, V>; 6], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxll = b.copy(n[2].node, weight(n[2].node) - 1);
        let xxl = b.internal(key(n[1].node)?, 1, xxll, left(n[4].node, guard)?);
        let xxrl = b.copy(n[5].node, 1);
        let xxr = b.internal(key(n[3].node)?, 0, xxrl, right(n[3].node, guard)?);
        let xx = b.internal(key(n[4].node)?, weight(n[1].node), xxl, xxr);
        b.finish(&n, xx, None)
    }

    fn w4_sym<'g>(&'g self, n: [Linked<'g, K, V>; 6], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxlr = b.copy(n[5].node, 1);
        let xxl = b.internal(key(n[2].node)?, 0, left(n[2].node, guard)?, xxlr);
        let xxrr = b.copy(n[3].node, weight(n[3].node) - 1);
        let xxr = b.internal(key(n[1].node)?, 1, right(n[4].node, guard)?, xxrr);
        let xx = b.internal(key(n[4].node)?, weight(n[1].node), xxl, xxr);
        b.finish(&n, xx, None)
    }

    fn w5<'g>(&'g self, n: [Linked<'g, K, V>; 5], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxll = b.copy(n[2].node, weight(n[2].node) - 1);
        let xxl = b.internal(key(n[1].node)?, 1, xxll, left(n[3].node, guard)?);
        let xxr = b.copy(n[4].node, 1);
        let xx = b.internal(key(n[3].node)?, weight(n[1].node), xxl, xxr);
        b.finish(&n, xx, None)
    }

    fn w5_sym<'g>(&'g self, n: [Linked<'g, K, V>; 5], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxl = b.copy(n[4].node, 1);
        let xxrr = b.copy(n[3].node, weight(n[3].node) - 1);
        let xxr = b.internal(key(n[1].node)?, 1, right(n[2].node, guard)?, xxrr);
        let xx = b.internal(key(n[2].node)?, weight(n[1].node), xxl, xxr);
        b.finish(&n, xx, None)
    }

    fn w6<'g>(&'g self, n: [Linked<'g, K, V>; 5], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxll = b.copy(n[2].node, weight(n[2].node) - 1);
        let xxl = b.internal(key(n[1].node)?, 1, xxll, left(n[4].node, guard)?);
        let xxr = b.internal(
            key(n[3].node)?,
            1,
            right(n[4].node, guard)?,
            right(n[3].node, guard)?,
        );
        let xx = b.internal(key(n[4].node)?, weight(n[1].node), xxl, xxr);
        b.finish(&n, xx, None)
    }

    fn w6_sym<'g>(&'g self, n: [Linked<'g, K, V>; 5], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxl = b.internal(
            key(n[2].node)?,
            1,
            left(n[2].node, guard)?,
            left(n[4].node, guard)?,
        );
        let xxrr = b.copy(n[3].node, weight(n[3].node) - 1);
        let xxr = b.internal(key(n[1].node)?, 1, right(n[4].node, guard)?, xxrr);
        let xx = b.internal(key(n[4].node)?, weight(n[1].node), xxl, xxr);
        b.finish(&n, xx, None)
    }

    /// W7 is its own mirror image.
    fn w7<'g>(&'g self, n: [Linked<'g, K, V>; 4], guard: &'g Guard) -> Op<'g, K, V> {
        let mut b = Builder::new(guard);
        let xxl = b.copy(n[2].node, weight(n[2].node) - 1);
        let xxr = b.copy(n[3].node, weight(n[3].node) - 1);
        let w = self.top_weight(n[1].node, weight(n[1].node) + 1, guard);
        let xx = b.internal(key(n[1].node)?, w, xxl, xxr);
        b.finish(&n, xx, None)
    }
}
