// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Software address translation bookkeeping for targets without a page-table walker
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module; integration, stress and property tests under tests/
//! PUBLIC API: AddressMap, Record, MapConfig, ClusterAllocator, VirtAddrMap, FileOffsetMap
//! DEPENDS_ON: alloc, log, thiserror, spin
//! INVARIANTS: Mapped regions are disjoint, power-of-two sized and naturally aligned;
//!             memory use follows the number of regions, not their size
//!
//! NOMMU address spaces, MPU/PMP fault handlers and mmap file-offset tracking use
//! [`AddressMap`] to answer "what backs this address, with which attribute?".
//! Callers serialise access with their own address-space lock.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

mod cluster;
mod config;
mod error;
mod key;
mod map;
mod policy;
mod table;

pub use cluster::{MAX_SIZE_WIDTH, MIN_SIZE_WIDTH, ORDER_BITS};
pub use config::{MapConfig, DEFAULT_LOAD_PERCENT, MAX_LOAD_PERCENT, MIN_LOAD_PERCENT};
pub use error::{ContractViolation, IntegrityError, MapError};
pub use key::AddrKey;
pub use map::{AddressMap, MapStats, Record};
pub use policy::{Block, BudgetAllocator, ClusterAllocator, HeapAllocator, SharedAllocator};

/// Granule of the stock instantiations.
pub const PAGE_SIZE: u64 = 4096;

/// Virtual-address map keyed by native pointer-width addresses.
pub type VirtAddrMap<A = HeapAllocator> = AddressMap<usize, usize, A, { PAGE_SIZE }, 8, 256>;

/// File-offset map for memory-mapped files; offsets may exceed the pointer width.
pub type FileOffsetMap<A = HeapAllocator> = AddressMap<u64, usize, A, { PAGE_SIZE }, 8, 256>;
