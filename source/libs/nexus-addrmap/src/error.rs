// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types: recoverable map failures, fatal contract violations and
//! integrity-check findings.

use thiserror::Error;

/// Recoverable failure reported by [`AddressMap::map`](crate::AddressMap::map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// The allocator policy (or growth of the cluster index) could not supply memory.
    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },
}

/// Caller programming error. Never returned from mutating operations; those
/// log the violation and panic with its message instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("region size is zero")]
    ZeroSize,
    #[error("region size {size:#x} is not a power of two")]
    SizeNotPowerOfTwo { size: u64 },
    #[error("region size {size:#x} is smaller than the {granule:#x} granule")]
    SizeBelowGranule { size: u64, granule: u64 },
    #[error("region size {size:#x} exceeds the largest size class {max:#x}")]
    SizeTooLarge { size: u64, max: u64 },
    #[error("address {addr:#x} is not aligned to region size {size:#x}")]
    Misaligned { addr: u64, size: u64 },
    #[error("attribute {attr} out of range (max {max})")]
    AttrOutOfRange { attr: u8, max: u8 },
    #[error("region at {addr:#x} overlaps mapping at {existing:#x} of size {existing_size:#x}")]
    Overlap { addr: u64, existing: u64, existing_size: u64 },
    #[error("no mapping at {addr:#x} of size {size:#x}")]
    NotMapped { addr: u64, size: u64 },
    #[error("mapping at {addr:#x} has size {mapped:#x}, not {requested:#x}")]
    SizeMismatch { addr: u64, mapped: u64, requested: u64 },
    #[error("granule {granule:#x} is not a power of two below the {key_bits}-bit key width")]
    InvalidGranule { granule: u64, key_bits: u32 },
    #[error("size width {width} outside {min}..={max}")]
    InvalidSizeWidth { width: u32, min: u32, max: u32 },
    #[error("cluster of {bytes} bytes cannot hold one {slot}-byte slot")]
    InvalidClusterBytes { bytes: usize, slot: usize },
    #[error("max load {percent}% outside {min}..={max}%")]
    InvalidMaxLoad { percent: u8, min: u8, max: u8 },
    #[error("allocator returned a {got}-byte block for a {want}-byte request")]
    ShortBlock { got: usize, want: usize },
}

/// Inconsistency found by [`AddressMap::verify`](crate::AddressMap::verify).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("cluster (order {order}, window {window:#x}) counts {tracked} entries but holds {found}")]
    LiveCount { order: u8, window: u64, tracked: u32, found: u32 },
    #[error("cluster (order {order}, window {window:#x}) is empty but still allocated")]
    EmptyCluster { order: u8, window: u64 },
    #[error("slot {slot} of cluster (order {order}, window {window:#x}) encodes order {encoded}")]
    DescriptorOrder { order: u8, window: u64, slot: usize, encoded: u8 },
    #[error("order bookkeeping for order {order} says {tracked} clusters, found {found}")]
    OrderCount { order: u8, tracked: u32, found: u32 },
    #[error("map tracks {tracked} entries but clusters hold {found}")]
    EntryCount { tracked: usize, found: usize },
}

/// Logs `violation` and aborts the current operation.
#[cold]
#[track_caller]
pub(crate) fn violated(violation: ContractViolation) -> ! {
    log::error!(target: "addrmap", "contract violation: {}", violation);
    panic!("addrmap: {}", violation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_render_hex_addresses() {
        let v = ContractViolation::Misaligned { addr: 0x1000, size: 0x2000 };
        assert_eq!(
            alloc::format!("{}", v),
            "address 0x1000 is not aligned to region size 0x2000"
        );
        let e = MapError::OutOfMemory { bytes: 160 };
        assert_eq!(alloc::format!("{}", e), "out of memory allocating 160 bytes");
    }

    #[test]
    #[should_panic(expected = "addrmap: region size is zero")]
    fn violated_panics_with_message() {
        violated(ContractViolation::ZeroSize);
    }
}
