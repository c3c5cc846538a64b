// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cluster geometry and slot encoding.
//!
//! A cluster holds `1 << slot_shift` consecutive, naturally aligned positions of a
//! single size order. Slot `i` of the cluster keyed `(order, window)` describes the
//! region starting at `((window << slot_shift) | i) << (granule_shift + order)`.
//! Each slot is `phys` (little endian) followed by a packed descriptor: the low
//! [`ORDER_BITS`] bits hold the order, the rest hold the attribute. An all-ones
//! attribute field marks the slot vacant.

use core::ops::Range;

use crate::error::ContractViolation;
use crate::key::AddrKey;
use crate::policy::Block;

/// Descriptor bits reserved for the size order.
pub const ORDER_BITS: u32 = 5;
const ORDER_MASK: u16 = (1 << ORDER_BITS) - 1;
/// Narrowest descriptor: the order field plus a one-bit attribute.
pub const MIN_SIZE_WIDTH: u32 = ORDER_BITS + 1;
/// Widest descriptor; descriptors are stored in at most two bytes.
pub const MAX_SIZE_WIDTH: u32 = u16::BITS;

static_assertions::const_assert!(MIN_SIZE_WIDTH <= 8);
static_assertions::const_assert!(ORDER_MASK as u32 + 1 <= u64::BITS);

/// Derived layout of one map instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub granule: u64,
    pub granule_shift: u32,
    pub size_width: u32,
    pub cluster_bytes: usize,
    pub key_bits: u32,
    pub phys_bytes: usize,
    pub desc_bytes: usize,
    pub slot_bytes: usize,
    pub slot_shift: u32,
    pub block_bytes: usize,
    pub attr_bits: u32,
    pub max_order: u32,
}

impl Geometry {
    pub const fn new(
        granule: u64,
        size_width: u32,
        cluster_bytes: usize,
        key_bits: u32,
        phys_bytes: usize,
    ) -> Self {
        let granule_shift = granule.trailing_zeros();
        let desc_bytes = if size_width <= 8 { 1 } else { 2 };
        let slot_bytes = phys_bytes + desc_bytes;
        let slots = cluster_bytes / slot_bytes;
        let slot_shift = if slots == 0 { 0 } else { usize::BITS - 1 - slots.leading_zeros() };
        let by_key = key_bits.saturating_sub(1).saturating_sub(granule_shift);
        let max_order = if by_key < ORDER_MASK as u32 { by_key } else { ORDER_MASK as u32 };
        Self {
            granule,
            granule_shift,
            size_width,
            cluster_bytes,
            key_bits,
            phys_bytes,
            desc_bytes,
            slot_bytes,
            slot_shift,
            block_bytes: (1usize << slot_shift) * slot_bytes,
            attr_bits: size_width.saturating_sub(ORDER_BITS),
            max_order,
        }
    }

    /// Rejects parameter combinations the encoding cannot represent.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        if !self.granule.is_power_of_two() || self.granule_shift >= self.key_bits {
            return Err(ContractViolation::InvalidGranule {
                granule: self.granule,
                key_bits: self.key_bits,
            });
        }
        if !(MIN_SIZE_WIDTH..=MAX_SIZE_WIDTH).contains(&self.size_width) {
            return Err(ContractViolation::InvalidSizeWidth {
                width: self.size_width,
                min: MIN_SIZE_WIDTH,
                max: MAX_SIZE_WIDTH,
            });
        }
        if self.cluster_bytes < self.slot_bytes {
            return Err(ContractViolation::InvalidClusterBytes {
                bytes: self.cluster_bytes,
                slot: self.slot_bytes,
            });
        }
        Ok(())
    }

    pub fn slots(&self) -> usize {
        1 << self.slot_shift
    }

    fn vacant_attr(&self) -> u16 {
        ((1u32 << self.attr_bits) - 1) as u16
    }

    /// Largest storable attribute; the next value up is the vacancy marker.
    pub fn max_attr(&self) -> u8 {
        let max = self.vacant_attr().saturating_sub(1);
        if max > u8::MAX as u16 {
            u8::MAX
        } else {
            max as u8
        }
    }

    /// Largest region size, in bytes, the order field can describe.
    pub fn max_size(&self) -> u64 {
        1u64 << (self.granule_shift + self.max_order)
    }

    /// Address bits covered by one slot of `order`.
    pub fn span_shift(&self, order: u32) -> u32 {
        self.granule_shift + order
    }

    /// Locates the cluster and slot that would hold a region of `order` containing `addr`.
    pub fn locate(&self, addr: u64, order: u32) -> (ClusterKey, usize) {
        let position = addr >> self.span_shift(order);
        let key = ClusterKey { order: order as u8, window: position >> self.slot_shift };
        (key, (position & (self.slots() as u64 - 1)) as usize)
    }

    fn encode(&self, order: u8, attr: u8) -> u16 {
        u16::from(order) | (u16::from(attr) << ORDER_BITS)
    }

    fn decode(&self, desc: u16) -> Option<(u8, u8)> {
        let attr = desc >> ORDER_BITS;
        if attr == self.vacant_attr() {
            return None;
        }
        Some(((desc & ORDER_MASK) as u8, attr as u8))
    }
}

/// Top-level index key of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ClusterKey {
    pub order: u8,
    pub window: u64,
}

impl ClusterKey {
    /// Fibonacci hash; callers take the high bits.
    pub fn hash(&self) -> u64 {
        (self.window.rotate_left(ORDER_BITS) ^ u64::from(self.order))
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }
}

/// Decoded slot contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot<P> {
    pub phys: P,
    pub order: u8,
    pub attr: u8,
}

/// One allocated storage node.
pub(crate) struct Cluster {
    key: ClusterKey,
    live: u32,
    block: Block,
}

impl Cluster {
    /// Wraps a freshly allocated block, marking every slot vacant.
    pub fn new(key: ClusterKey, mut block: Block, geo: &Geometry) -> Self {
        let vacant = geo.encode(0, 0) | (geo.vacant_attr() << ORDER_BITS);
        let bytes = block.as_mut_slice();
        for slot in 0..geo.slots() {
            let range = Self::slot_range(geo, slot);
            bytes[range.clone()].fill(0);
            write_desc(geo, &mut bytes[range.start + geo.phys_bytes..range.end], vacant);
        }
        Self { key, live: 0, block }
    }

    pub fn key(&self) -> ClusterKey {
        self.key
    }

    pub fn live(&self) -> u32 {
        self.live
    }

    fn slot_range(geo: &Geometry, slot: usize) -> Range<usize> {
        let start = slot * geo.slot_bytes;
        start..start + geo.slot_bytes
    }

    pub fn get<P: AddrKey>(&self, geo: &Geometry, slot: usize) -> Option<Slot<P>> {
        let raw = &self.block.as_slice()[Self::slot_range(geo, slot)];
        let (order, attr) = geo.decode(read_desc(geo, &raw[geo.phys_bytes..]))?;
        Some(Slot { phys: P::read_le(raw), order, attr })
    }

    pub fn put<P: AddrKey>(&mut self, geo: &Geometry, slot: usize, phys: P, attr: u8) {
        let desc = geo.encode(self.key.order, attr);
        let raw = &mut self.block.as_mut_slice()[Self::slot_range(geo, slot)];
        debug_assert!(geo.decode(read_desc(geo, &raw[geo.phys_bytes..])).is_none());
        phys.write_le(raw);
        write_desc(geo, &mut raw[geo.phys_bytes..], desc);
        self.live += 1;
    }

    /// Vacates `slot`; returns whether it was occupied.
    pub fn take(&mut self, geo: &Geometry, slot: usize) -> bool {
        let raw = &mut self.block.as_mut_slice()[Self::slot_range(geo, slot)];
        if geo.decode(read_desc(geo, &raw[geo.phys_bytes..])).is_none() {
            return false;
        }
        write_desc(geo, &mut raw[geo.phys_bytes..], geo.vacant_attr() << ORDER_BITS);
        self.live -= 1;
        true
    }

    /// Base address of `slot`.
    pub fn base(&self, geo: &Geometry, slot: usize) -> u64 {
        let position = (self.key.window << geo.slot_shift) | slot as u64;
        position << geo.span_shift(u32::from(self.key.order))
    }

    /// Indices of occupied slots, ascending.
    pub fn occupied<P: AddrKey>(
        &self,
        geo: Geometry,
    ) -> impl Iterator<Item = (usize, Slot<P>)> + '_ {
        (0..geo.slots()).filter_map(move |slot| self.get::<P>(&geo, slot).map(|s| (slot, s)))
    }

    pub fn into_block(self) -> Block {
        self.block
    }
}

fn read_desc(geo: &Geometry, raw: &[u8]) -> u16 {
    if geo.desc_bytes == 1 {
        u16::from(raw[0])
    } else {
        u16::from_le_bytes([raw[0], raw[1]])
    }
}

fn write_desc(geo: &Geometry, raw: &mut [u8], desc: u16) {
    if geo.desc_bytes == 1 {
        raw[0] = desc as u8;
    } else {
        raw[..2].copy_from_slice(&desc.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEO: Geometry = Geometry::new(0x1000, 8, 256, 32, 4);

    fn cluster(order: u8, window: u64) -> Cluster {
        let block = Block::try_zeroed(GEO.block_bytes).expect("block");
        Cluster::new(ClusterKey { order, window }, block, &GEO)
    }

    #[test]
    fn default_geometry() {
        assert_eq!(GEO.validate(), Ok(()));
        assert_eq!(GEO.granule_shift, 12);
        assert_eq!(GEO.slot_bytes, 5);
        assert_eq!(GEO.slots(), 32);
        assert_eq!(GEO.block_bytes, 160);
        assert_eq!(GEO.max_attr(), 6);
        assert_eq!(GEO.max_order, 19);
        assert_eq!(GEO.max_size(), 0x8000_0000);
    }

    #[test]
    fn wide_descriptor_caps_attr_at_u8() {
        let geo = Geometry::new(0x1000, 16, 256, 64, 8);
        assert_eq!(geo.validate(), Ok(()));
        assert_eq!(geo.desc_bytes, 2);
        assert_eq!(geo.max_attr(), u8::MAX);
        assert_eq!(geo.max_order, 31);
    }

    #[test]
    fn attrless_descriptor_has_no_storable_attr() {
        let geo = Geometry::new(0x1000, ORDER_BITS, 256, 32, 4);
        assert!(geo.validate().is_err());
        assert_eq!(geo.max_attr(), 0);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(matches!(
            Geometry::new(3000, 8, 256, 32, 4).validate(),
            Err(ContractViolation::InvalidGranule { .. })
        ));
        assert!(matches!(
            Geometry::new(0x1000, 5, 256, 32, 4).validate(),
            Err(ContractViolation::InvalidSizeWidth { .. })
        ));
        assert!(matches!(
            Geometry::new(0x1000, 8, 4, 32, 4).validate(),
            Err(ContractViolation::InvalidClusterBytes { .. })
        ));
    }

    #[test]
    fn locate_splits_position_into_window_and_slot() {
        let (key, slot) = GEO.locate(0x0012_3456, 0);
        assert_eq!(key, ClusterKey { order: 0, window: 0x123 >> 5 });
        assert_eq!(slot, 0x123 & 31);
        let (key, slot) = GEO.locate(u32::MAX as u64, 19);
        assert_eq!(key, ClusterKey { order: 19, window: 0 });
        assert_eq!(slot, 1);
    }

    #[test]
    fn fresh_cluster_is_vacant() {
        let c = cluster(0, 0);
        assert_eq!(c.live(), 0);
        assert_eq!(c.occupied::<u32>(GEO).count(), 0);
    }

    #[test]
    fn put_get_take() {
        let mut c = cluster(3, 7);
        c.put(&GEO, 4, 0u32, 0);
        c.put(&GEO, 5, 0xdead_b000u32, 6);
        assert_eq!(c.live(), 2);
        assert_eq!(c.get::<u32>(&GEO, 4), Some(Slot { phys: 0, order: 3, attr: 0 }));
        assert_eq!(c.get::<u32>(&GEO, 5), Some(Slot { phys: 0xdead_b000, order: 3, attr: 6 }));
        assert_eq!(c.get::<u32>(&GEO, 6), None);
        assert_eq!(c.base(&GEO, 5), ((7 << 5) | 5) << 15);
        assert!(c.take(&GEO, 4));
        assert!(!c.take(&GEO, 4));
        assert_eq!(c.live(), 1);
        let occupied: alloc::vec::Vec<usize> = c.occupied::<u32>(GEO).map(|(s, _)| s).collect();
        assert_eq!(occupied, [5]);
    }
}
