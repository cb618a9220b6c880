//! The coremap: reverse map from physical frames to their owners.
//!
//! One global structure tracks, for every physical frame, which
//! `(address space, virtual page)` currently occupies it, plus an LRU
//! ordering used to pick eviction victims. The invariant the rest of the
//! VM layer leans on: a frame appears for at most one `(space, page)` pair,
//! and a page-table entry is valid iff the coremap points back at it.
//!
//! Structure mutations happen under brief interrupt-disabled sections; the
//! eviction I/O itself (writing the victim to its owner's swap file) runs
//! outside them, because disk I/O blocks. A concurrent allocation during
//! that window simply picks a different victim — the frame being stolen is
//! already out of the free map and the LRU list.

use std::collections::VecDeque;
use std::sync::Arc;

use mirage::spinlock::SpinLock;
use mirage::{trace, NUM_PHYS_PAGES};

use crate::util::Bitmap;

use super::AddressSpace;

struct CoremapInner {
    frames: Bitmap,
    /// Frames in use, least recently touched first.
    order: VecDeque<usize>,
    owners: Vec<Option<(Arc<AddressSpace>, usize)>>,
}

/// The global frame allocator.
pub struct Coremap {
    inner: SpinLock<CoremapInner>,
}

impl Coremap {
    /// A coremap with every frame free.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(CoremapInner {
                frames: Bitmap::new(NUM_PHYS_PAGES),
                order: VecDeque::new(),
                owners: (0..NUM_PHYS_PAGES).map(|_| None).collect(),
            }),
        }
    }

    /// Allocate a frame for `(space, virtual_page)`, evicting the
    /// least-recently-used frame if none is free. The caller installs the
    /// returned frame in its page table.
    pub fn find(&self, space: &Arc<AddressSpace>, virtual_page: usize) -> usize {
        let frame = loop {
            let mut g = self.inner.lock();
            if let Some(frame) = g.frames.find() {
                g.unlock();
                break frame;
            }
            let Some(victim) = g.order.pop_front() else {
                g.unlock();
                panic!("no frames and no eviction victims");
            };
            let (owner, page) = g.owners[victim].take().expect("victim frame unowned");
            g.unlock();
            trace!(
                'a',
                "evicting frame {} (space {}, page {})",
                victim,
                owner.space_id(),
                page
            );
            // The eviction I/O runs unlocked; the frame is off both the
            // free map and the LRU list, so nobody else can claim it.
            owner.swap_page(page);
            break victim;
        };
        let mut g = self.inner.lock();
        g.frames.mark(frame);
        g.owners[frame] = Some((space.clone(), virtual_page));
        g.order.push_back(frame);
        g.unlock();
        frame
    }

    /// Refresh `frame`'s recency. Called on every fault-time access.
    pub fn touch(&self, frame: usize) {
        let mut g = self.inner.lock();
        if let Some(at) = g.order.iter().position(|f| *f == frame) {
            g.order.remove(at);
            g.order.push_back(frame);
        }
        g.unlock();
    }

    /// Release `frame` (its page was freed or its space destroyed).
    pub fn clear(&self, frame: usize) {
        let mut g = self.inner.lock();
        if !g.frames.test(frame) {
            g.unlock();
            return;
        }
        g.frames.clear(frame);
        g.owners[frame] = None;
        if let Some(at) = g.order.iter().position(|f| *f == frame) {
            g.order.remove(at);
        }
        g.unlock();
    }

    /// The owner recorded for `frame`, for invariant checks.
    pub fn owner(&self, frame: usize) -> Option<(Arc<AddressSpace>, usize)> {
        let g = self.inner.lock();
        let owner = g.owners[frame].clone();
        g.unlock();
        owner
    }

    /// Free frames remaining.
    pub fn count_clear(&self) -> usize {
        let g = self.inner.lock();
        let n = g.frames.count_clear();
        g.unlock();
        n
    }
}

impl Default for Coremap {
    fn default() -> Self {
        Self::new()
    }
}
