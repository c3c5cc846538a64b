// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Allocator policies backing address-map clusters
//! PUBLIC API: ClusterAllocator, Block, HeapAllocator, BudgetAllocator, SharedAllocator
//! INVARIANTS: Every block handed out by a policy comes back through `free` with the
//!             same byte count; policies never inspect block contents

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

/// Owned, zero-initialised byte block used as cluster storage.
pub struct Block {
    bytes: Box<[u8]>,
}

impl Block {
    /// Allocates a zeroed block from the global heap, returning `None` on exhaustion
    /// instead of aborting.
    pub fn try_zeroed(len: usize) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).ok()?;
        bytes.resize(len, 0);
        Some(Self { bytes: bytes.into_boxed_slice() })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl From<Box<[u8]>> for Block {
    fn from(bytes: Box<[u8]>) -> Self {
        Self { bytes }
    }
}

impl From<Block> for Box<[u8]> {
    fn from(block: Block) -> Self {
        block.bytes
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block").field("len", &self.bytes.len()).finish()
    }
}

/// Source of cluster memory.
///
/// `Context` is caller-owned state handed to every call, typically the owning
/// address space so that cluster memory can be charged to it.
pub trait ClusterAllocator {
    type Context;

    /// Returns a block of at least `bytes` bytes, or `None` when memory is exhausted.
    fn alloc(&mut self, bytes: usize, ctx: &mut Self::Context) -> Option<Block>;

    /// Takes back a block previously returned by `alloc(bytes, ..)`.
    fn free(&mut self, block: Block, bytes: usize, ctx: &mut Self::Context);
}

/// Global-heap policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl ClusterAllocator for HeapAllocator {
    type Context = ();

    fn alloc(&mut self, bytes: usize, _ctx: &mut ()) -> Option<Block> {
        Block::try_zeroed(bytes)
    }

    fn free(&mut self, block: Block, _bytes: usize, _ctx: &mut ()) {
        drop(block);
    }
}

/// Heap policy capped at a fixed number of outstanding bytes.
#[derive(Debug, Clone)]
pub struct BudgetAllocator {
    limit: usize,
    used: usize,
    peak: usize,
}

impl BudgetAllocator {
    pub const fn new(limit: usize) -> Self {
        Self { limit, used: 0, peak: 0 }
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.used
    }

    /// High-water mark of [`BudgetAllocator::used`].
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Adjusts the cap. Outstanding blocks are unaffected.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }
}

impl ClusterAllocator for BudgetAllocator {
    type Context = ();

    fn alloc(&mut self, bytes: usize, _ctx: &mut ()) -> Option<Block> {
        let next = self.used.checked_add(bytes)?;
        if next > self.limit {
            return None;
        }
        let block = Block::try_zeroed(bytes)?;
        self.used = next;
        self.peak = self.peak.max(next);
        Some(block)
    }

    fn free(&mut self, block: Block, bytes: usize, _ctx: &mut ()) {
        debug_assert!(bytes <= self.used, "budget underflow");
        self.used = self.used.saturating_sub(bytes);
        drop(block);
    }
}

/// One policy shared by several maps.
///
/// Each map owns a clone; calls are serialised through a spin lock so the inner
/// policy sees one caller at a time regardless of which map is mutating.
pub struct SharedAllocator<A> {
    inner: Arc<Mutex<A>>,
}

impl<A> SharedAllocator<A> {
    pub fn new(policy: A) -> Self {
        Self { inner: Arc::new(Mutex::new(policy)) }
    }

    /// Runs `f` with the shared policy locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<A> Clone for SharedAllocator<A> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<A: ClusterAllocator> ClusterAllocator for SharedAllocator<A> {
    type Context = A::Context;

    fn alloc(&mut self, bytes: usize, ctx: &mut A::Context) -> Option<Block> {
        self.inner.lock().alloc(bytes, ctx)
    }

    fn free(&mut self, block: Block, bytes: usize, ctx: &mut A::Context) {
        self.inner.lock().free(block, bytes, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_blocks_are_zeroed() {
        let block = HeapAllocator.alloc(64, &mut ()).expect("heap block");
        assert_eq!(block.len(), 64);
        assert!(block.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn budget_refuses_past_limit_and_recovers_on_free() {
        let mut budget = BudgetAllocator::new(100);
        let a = budget.alloc(60, &mut ()).expect("fits");
        assert!(budget.alloc(60, &mut ()).is_none());
        assert_eq!(budget.used(), 60);
        budget.free(a, 60, &mut ());
        assert_eq!(budget.used(), 0);
        let b = budget.alloc(60, &mut ()).expect("fits after free");
        assert_eq!(budget.peak(), 60);
        budget.free(b, 60, &mut ());
    }

    #[test]
    fn shared_policy_sees_all_clones() {
        let shared = SharedAllocator::new(BudgetAllocator::new(1024));
        let mut first = shared.clone();
        let mut second = shared.clone();
        let a = first.alloc(100, &mut ()).expect("first");
        let b = second.alloc(200, &mut ()).expect("second");
        assert_eq!(shared.with(|p| p.used()), 300);
        first.free(b, 200, &mut ());
        second.free(a, 100, &mut ());
        assert_eq!(shared.with(|p| p.used()), 0);
    }
}
