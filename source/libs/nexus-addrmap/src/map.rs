// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sparse disjoint address-range map for NOMMU/MPU/PMP address bookkeeping
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressMap{map,unmap,find,size,empty,clear}, Record, MapStats
//! DEPENDS_ON: cluster::{Cluster, Geometry}, table::ClusterTable, policy::ClusterAllocator
//! INVARIANTS: Regions are power-of-two sized, naturally aligned and pairwise disjoint;
//!             cluster count tracks entry count, never region size; unmap is exact-match
//!
//! A region of order `k` (`size == granule << k`) containing `a` must start at `a`
//! rounded down to its size, so a lookup probes one cluster per order in use.

use core::fmt;
use core::marker::PhantomData;

use crate::cluster::{Cluster, ClusterKey, Geometry, Slot, ORDER_BITS};
use crate::config::MapConfig;
use crate::error::{violated, ContractViolation, IntegrityError, MapError};
use crate::key::AddrKey;
use crate::policy::{ClusterAllocator, HeapAllocator};
use crate::table::ClusterTable;

const ORDERS: usize = 1 << ORDER_BITS;

/// Mapping returned by [`AddressMap::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<K, P> {
    /// Physical base of the whole region, not of the queried address.
    pub phys: P,
    pub size: K,
    pub attr: u8,
}

impl<K: AddrKey, P: AddrKey> Record<K, P> {
    /// Start of the region containing `addr`.
    pub fn base(&self, addr: K) -> Option<K> {
        K::try_from_u64(addr.to_u64() & !(self.size.to_u64() - 1))
    }

    /// Physical address backing `addr`, which must lie inside this region.
    ///
    /// Returns `None` if the result does not fit in `P`.
    pub fn translate(&self, addr: K) -> Option<P> {
        let offset = addr.to_u64() & (self.size.to_u64() - 1);
        P::try_from_u64(self.phys.to_u64().checked_add(offset)?)
    }
}

/// Occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    pub clusters: usize,
    pub entries: usize,
    /// Slots in the top-level cluster index.
    pub index_slots: usize,
    /// Bytes currently held from the allocator policy.
    pub cluster_bytes: usize,
}

/// Disjoint `[addr, addr + size)` -> `(phys, attr)` map.
///
/// * `GRANULE`: smallest region size and alignment, a power of two.
/// * `SIZE_WIDTH`: bits of the per-entry descriptor; 5 hold the size order, the rest
///   the attribute (all-ones is reserved).
/// * `CLUSTER_BYTES`: target size of one allocator block.
///
/// The map is not synchronised; callers hold their address-space lock around it.
pub struct AddressMap<
    K: AddrKey,
    P: AddrKey,
    A: ClusterAllocator = HeapAllocator,
    const GRANULE: u64 = 4096,
    const SIZE_WIDTH: u32 = 8,
    const CLUSTER_BYTES: usize = 256,
> {
    table: ClusterTable,
    /// Bit `k` set while at least one cluster of order `k` exists.
    orders: u64,
    order_clusters: [u32; ORDERS],
    entries: usize,
    alloc: A,
    ctx: A::Context,
    _keys: PhantomData<fn() -> (K, P)>,
}

impl<K, P, A, const GRANULE: u64, const SIZE_WIDTH: u32, const CLUSTER_BYTES: usize>
    AddressMap<K, P, A, GRANULE, SIZE_WIDTH, CLUSTER_BYTES>
where
    K: AddrKey,
    P: AddrKey,
    A: ClusterAllocator + Default,
    A::Context: Default,
{
    /// Creates an empty map with the default configuration.
    pub fn new() -> Self {
        Self::with_config(MapConfig::default())
    }

    /// # Panics
    ///
    /// On an invalid `config` or an unrepresentable parameter set.
    pub fn with_config(config: MapConfig) -> Self {
        Self::new_in(A::default(), A::Context::default(), config)
    }
}

impl<K, P, A, const GRANULE: u64, const SIZE_WIDTH: u32, const CLUSTER_BYTES: usize> Default
    for AddressMap<K, P, A, GRANULE, SIZE_WIDTH, CLUSTER_BYTES>
where
    K: AddrKey,
    P: AddrKey,
    A: ClusterAllocator + Default,
    A::Context: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P, A, const GRANULE: u64, const SIZE_WIDTH: u32, const CLUSTER_BYTES: usize>
    AddressMap<K, P, A, GRANULE, SIZE_WIDTH, CLUSTER_BYTES>
where
    K: AddrKey,
    P: AddrKey,
    A: ClusterAllocator,
{
    const GEO: Geometry = Geometry::new(GRANULE, SIZE_WIDTH, CLUSTER_BYTES, K::BITS, P::BYTES);

    /// Creates an empty map drawing clusters from `alloc`, charging them to `ctx`.
    ///
    /// No memory is allocated until the first [`AddressMap::map`].
    ///
    /// # Panics
    ///
    /// On an invalid `config` or an unrepresentable parameter set.
    pub fn new_in(alloc: A, ctx: A::Context, config: MapConfig) -> Self {
        if let Err(violation) = Self::GEO.validate() {
            violated(violation);
        }
        if let Err(violation) = config.validate() {
            violated(violation);
        }
        Self {
            table: ClusterTable::new(config.initial_capacity, config.max_load_percent),
            orders: 0,
            order_clusters: [0; ORDERS],
            entries: 0,
            alloc,
            ctx,
            _keys: PhantomData,
        }
    }

    /// Largest attribute value [`AddressMap::map`] accepts.
    ///
    /// # Panics
    ///
    /// On an unrepresentable parameter set.
    pub fn max_attr() -> u8 {
        if let Err(violation) = Self::GEO.validate() {
            violated(violation);
        }
        Self::GEO.max_attr()
    }

    /// Largest region size [`AddressMap::map`] accepts.
    pub fn max_size() -> u64 {
        Self::GEO.max_size()
    }

    /// Checks the [`AddressMap::map`] preconditions that do not depend on map contents.
    pub fn check_region(addr: K, size: K, attr: u8) -> Result<(), ContractViolation> {
        Self::GEO.validate()?;
        Self::order_of(addr, size)?;
        let max = Self::GEO.max_attr();
        if attr > max {
            return Err(ContractViolation::AttrOutOfRange { attr, max });
        }
        Ok(())
    }

    fn order_of(addr: K, size: K) -> Result<u32, ContractViolation> {
        let geo = Self::GEO;
        let (addr, size) = (addr.to_u64(), size.to_u64());
        if size == 0 {
            return Err(ContractViolation::ZeroSize);
        }
        if !size.is_power_of_two() {
            return Err(ContractViolation::SizeNotPowerOfTwo { size });
        }
        if size < geo.granule {
            return Err(ContractViolation::SizeBelowGranule { size, granule: geo.granule });
        }
        if size > geo.max_size() {
            return Err(ContractViolation::SizeTooLarge { size, max: geo.max_size() });
        }
        if addr & (size - 1) != 0 {
            return Err(ContractViolation::Misaligned { addr, size });
        }
        Ok(size.trailing_zeros() - geo.granule_shift)
    }

    /// Maps `[addr, addr + size)` to `phys` with `attr`.
    ///
    /// # Errors
    ///
    /// [`MapError::OutOfMemory`] if a new cluster or index growth could not be
    /// allocated. The map is unchanged in that case.
    ///
    /// # Panics
    ///
    /// If the region fails [`AddressMap::check_region`], or if `addr` is already
    /// covered by a mapping.
    pub fn map(&mut self, addr: K, phys: P, size: K, attr: u8) -> Result<(), MapError> {
        if let Err(violation) = Self::check_region(addr, size, attr) {
            violated(violation);
        }
        let order = size.to_u64().trailing_zeros() - Self::GEO.granule_shift;
        if let Some((existing, slot)) = self.lookup(addr.to_u64()) {
            violated(ContractViolation::Overlap {
                addr: addr.to_u64(),
                existing,
                existing_size: Self::size_bytes(slot.order),
            });
        }

        let geo = Self::GEO;
        let (key, index) = geo.locate(addr.to_u64(), order);
        if let Some(cluster) = self.table.get_mut(&key) {
            cluster.put(&geo, index, phys, attr);
        } else {
            self.grow(key)?.put(&geo, index, phys, attr);
        }
        self.entries += 1;
        Ok(())
    }

    /// Allocates and indexes an empty cluster for `key`.
    fn grow(&mut self, key: ClusterKey) -> Result<&mut Cluster, MapError> {
        let geo = Self::GEO;
        if let Err(err) = self.table.reserve_one() {
            log::warn!(target: "addrmap", "index growth failed: {}", err);
            return Err(err);
        }
        let bytes = geo.block_bytes;
        let Some(block) = self.alloc.alloc(bytes, &mut self.ctx) else {
            log::warn!(
                target: "addrmap",
                "cluster alloc failed: order={} window={:#x}",
                key.order,
                key.window
            );
            return Err(MapError::OutOfMemory { bytes });
        };
        if block.len() < bytes {
            violated(ContractViolation::ShortBlock { got: block.len(), want: bytes });
        }
        log::trace!(target: "addrmap", "cluster alloc: order={} window={:#x}", key.order, key.window);
        self.note_cluster(key.order, true);
        Ok(self.table.insert(Cluster::new(key, block, &geo)))
    }

    /// Removes the mapping created by `map(addr, _, size, _)`.
    ///
    /// # Panics
    ///
    /// If `size` is invalid, no mapping starts at `addr`, or the mapping at `addr`
    /// has a different size.
    pub fn unmap(&mut self, addr: K, size: K) {
        let order = match Self::order_of(addr, size) {
            Ok(order) => order,
            Err(violation) => violated(violation),
        };
        let geo = Self::GEO;
        let (key, index) = geo.locate(addr.to_u64(), order);
        let taken = self
            .table
            .get_mut(&key)
            .map(|cluster| (cluster.take(&geo, index), cluster.live()));
        let emptied = match taken {
            Some((true, live)) => live == 0,
            _ => violated(self.unmap_miss(addr.to_u64(), size.to_u64())),
        };
        self.entries -= 1;
        if emptied {
            self.release(&key);
        }
    }

    fn unmap_miss(&self, addr: u64, size: u64) -> ContractViolation {
        match self.lookup(addr) {
            Some((base, slot)) if base == addr => ContractViolation::SizeMismatch {
                addr,
                mapped: Self::size_bytes(slot.order),
                requested: size,
            },
            _ => ContractViolation::NotMapped { addr, size },
        }
    }

    fn release(&mut self, key: &ClusterKey) {
        if let Some(cluster) = self.table.remove(key) {
            log::trace!(target: "addrmap", "cluster free: order={} window={:#x}", key.order, key.window);
            self.alloc.free(cluster.into_block(), Self::GEO.block_bytes, &mut self.ctx);
            self.note_cluster(key.order, false);
        }
    }

    fn note_cluster(&mut self, order: u8, added: bool) {
        let count = &mut self.order_clusters[usize::from(order)];
        if added {
            *count += 1;
        } else {
            *count -= 1;
        }
        if *count == 0 {
            self.orders &= !(1u64 << order);
        } else {
            self.orders |= 1u64 << order;
        }
    }

    fn size_bytes(order: u8) -> u64 {
        1u64 << Self::GEO.span_shift(u32::from(order))
    }

    /// Base address and slot of the mapping covering `addr`.
    fn lookup(&self, addr: u64) -> Option<(u64, Slot<P>)> {
        let geo = Self::GEO;
        let mut orders = self.orders;
        while orders != 0 {
            let order = orders.trailing_zeros();
            orders &= orders - 1;
            let (key, index) = geo.locate(addr, order);
            if let Some(slot) = self.table.get(&key).and_then(|c| c.get::<P>(&geo, index)) {
                let base = addr & !((1u64 << geo.span_shift(order)) - 1);
                return Some((base, slot));
            }
        }
        None
    }

    /// Returns the mapping containing `addr`.
    pub fn find(&self, addr: K) -> Option<Record<K, P>> {
        let (_, slot) = self.lookup(addr.to_u64())?;
        Some(Record {
            phys: slot.phys,
            size: K::try_from_u64(Self::size_bytes(slot.order))?,
            attr: slot.attr,
        })
    }

    /// Number of clusters currently allocated.
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// True when nothing is mapped.
    pub fn empty(&self) -> bool {
        self.entries == 0
    }

    /// Number of mapped regions.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Unmaps everything and returns every cluster to the allocator.
    pub fn clear(&mut self) {
        let clusters = self.table.len();
        let entries = self.entries;
        let bytes = Self::GEO.block_bytes;
        for cluster in self.table.take_all().into_iter().flatten() {
            self.alloc.free(cluster.into_block(), bytes, &mut self.ctx);
        }
        self.orders = 0;
        self.order_clusters = [0; ORDERS];
        self.entries = 0;
        if clusters != 0 {
            log::debug!(target: "addrmap", "cleared {} entries in {} clusters", entries, clusters);
        }
    }

    /// Every `(addr, record)` pair, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (K, Record<K, P>)> + '_ {
        let geo = Self::GEO;
        self.table.iter().flat_map(move |cluster| {
            cluster.occupied::<P>(geo).filter_map(move |(index, slot)| {
                let addr = K::try_from_u64(cluster.base(&geo, index))?;
                let size = K::try_from_u64(Self::size_bytes(slot.order))?;
                Some((addr, Record { phys: slot.phys, size, attr: slot.attr }))
            })
        })
    }

    pub fn stats(&self) -> MapStats {
        MapStats {
            clusters: self.table.len(),
            entries: self.entries,
            index_slots: self.table.capacity(),
            cluster_bytes: self.table.len() * Self::GEO.block_bytes,
        }
    }

    /// Cross-checks cluster contents against the map's bookkeeping.
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let geo = Self::GEO;
        let mut per_order = [0u32; ORDERS];
        let mut found_entries = 0usize;
        for cluster in self.table.iter() {
            let ClusterKey { order, window } = cluster.key();
            let mut found = 0u32;
            for (index, slot) in cluster.occupied::<P>(geo) {
                if slot.order != order {
                    return Err(IntegrityError::DescriptorOrder {
                        order,
                        window,
                        slot: index,
                        encoded: slot.order,
                    });
                }
                found += 1;
            }
            if found != cluster.live() {
                return Err(IntegrityError::LiveCount { order, window, tracked: cluster.live(), found });
            }
            if found == 0 {
                return Err(IntegrityError::EmptyCluster { order, window });
            }
            per_order[usize::from(order)] += 1;
            found_entries += found as usize;
        }
        for (order, (&found, &tracked)) in per_order.iter().zip(&self.order_clusters).enumerate() {
            let flagged = self.orders & (1u64 << order) != 0;
            if found != tracked || flagged != (found != 0) {
                return Err(IntegrityError::OrderCount { order: order as u8, tracked, found });
            }
        }
        if found_entries != self.entries {
            return Err(IntegrityError::EntryCount { tracked: self.entries, found: found_entries });
        }
        Ok(())
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Context handed to the allocator on every call.
    pub fn context(&self) -> &A::Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut A::Context {
        &mut self.ctx
    }
}

impl<K, P, A, const GRANULE: u64, const SIZE_WIDTH: u32, const CLUSTER_BYTES: usize> Drop
    for AddressMap<K, P, A, GRANULE, SIZE_WIDTH, CLUSTER_BYTES>
where
    K: AddrKey,
    P: AddrKey,
    A: ClusterAllocator,
{
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K, P, A, const GRANULE: u64, const SIZE_WIDTH: u32, const CLUSTER_BYTES: usize> fmt::Debug
    for AddressMap<K, P, A, GRANULE, SIZE_WIDTH, CLUSTER_BYTES>
where
    K: AddrKey,
    P: AddrKey,
    A: ClusterAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressMap")
            .field("granule", &GRANULE)
            .field("entries", &self.entries)
            .field("clusters", &self.table.len())
            .field("orders", &format_args!("{:#x}", self.orders))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::BudgetAllocator;

    type Map = AddressMap<u32, u32, HeapAllocator, 0x1000, 8, 256>;
    type Tight = AddressMap<u32, u32, BudgetAllocator, 0x1000, 8, 256>;

    #[test]
    fn new_map_is_empty_and_unallocated() {
        let map = Map::new();
        assert!(map.empty());
        assert_eq!(map.size(), 0);
        assert_eq!(map.stats().index_slots, 0);
        assert_eq!(map.find(0), None);
        assert_eq!(map.find(u32::MAX), None);
    }

    #[test]
    fn one_cluster_per_order_window() {
        let mut map = Map::new();
        map.map(0x0000, 1, 0x1000, 0).unwrap();
        map.map(0x1000, 2, 0x1000, 0).unwrap();
        assert_eq!(map.size(), 1);
        map.map(0x4000, 3, 0x4000, 0).unwrap();
        assert_eq!(map.size(), 2);
        map.map(0x0100_0000, 4, 0x1000, 0).unwrap();
        assert_eq!(map.size(), 3);
        assert_eq!(map.entries(), 4);
        assert_eq!(map.verify(), Ok(()));
    }

    #[test]
    fn unmap_frees_emptied_cluster() {
        let mut map = Map::new();
        map.map(0x2000, 7, 0x2000, 1).unwrap();
        map.map(0x8000, 8, 0x2000, 1).unwrap();
        map.unmap(0x2000, 0x2000);
        assert_eq!(map.size(), 1);
        map.unmap(0x8000, 0x2000);
        assert_eq!(map.size(), 0);
        assert!(map.empty());
        assert_eq!(map.verify(), Ok(()));
    }

    #[test]
    fn record_translate_adds_offset() {
        let mut map = Map::new();
        map.map(0x0001_0000, 0x8000_0000, 0x1_0000, 2).unwrap();
        let rec = map.find(0x0001_2345).expect("mapped");
        assert_eq!(rec.base(0x0001_2345), Some(0x0001_0000));
        assert_eq!(rec.translate(0x0001_2345), Some(0x8000_2345));
    }

    #[test]
    fn translate_reports_overflowing_phys() {
        let rec: Record<u32, u32> = Record { phys: 0xffff_f000, size: 0x2000, attr: 0 };
        assert_eq!(rec.translate(0x1000), None);
    }

    #[test]
    fn iter_reports_every_entry() {
        let mut map = Map::new();
        map.map(0, 10, 0x1000, 0).unwrap();
        map.map(0x10_0000, 11, 0x10_0000, 3).unwrap();
        map.map(0xffff_f000, 12, 0x1000, 6).unwrap();
        let mut all: alloc::vec::Vec<_> = map.iter().collect();
        all.sort_by_key(|(addr, _)| *addr);
        assert_eq!(
            all,
            [
                (0, Record { phys: 10, size: 0x1000, attr: 0 }),
                (0x10_0000, Record { phys: 11, size: 0x10_0000, attr: 3 }),
                (0xffff_f000, Record { phys: 12, size: 0x1000, attr: 6 }),
            ]
        );
    }

    #[test]
    fn failed_allocation_leaves_map_unchanged() {
        let mut map = Tight::new_in(BudgetAllocator::new(160), (), MapConfig::default());
        map.map(0, 0, 0x1000, 0).unwrap();
        assert_eq!(map.allocator().used(), 160);
        assert_eq!(
            map.map(0x1000_0000, 0, 0x1000, 0),
            Err(MapError::OutOfMemory { bytes: 160 })
        );
        assert_eq!(map.entries(), 1);
        assert_eq!(map.find(0x1000_0000), None);
        // Same cluster: no allocation needed.
        map.map(0x1000, 0, 0x1000, 0).unwrap();
        assert_eq!(map.verify(), Ok(()));
    }

    #[test]
    fn unreachable_initial_capacity_reports_out_of_memory() {
        let mut map = Map::with_config(MapConfig::default().with_initial_capacity(usize::MAX));
        assert!(matches!(map.map(0, 0, 0x1000, 0), Err(MapError::OutOfMemory { .. })));
        assert!(map.empty());
        assert_eq!(map.size(), 0);
        assert_eq!(map.find(0), None);
    }

    #[test]
    fn clear_returns_blocks() {
        let mut map = Tight::new_in(BudgetAllocator::new(1 << 20), (), MapConfig::default());
        for i in 0..64u32 {
            map.map(i << 24, i, 0x1000, 0).unwrap();
        }
        assert_eq!(map.allocator().used(), 64 * 160);
        map.clear();
        assert_eq!(map.allocator().used(), 0);
        assert_eq!(map.stats(), MapStats::default());
        map.clear();
        assert!(map.empty());
    }

    #[test]
    #[should_panic(expected = "max load 5% outside 10..=95%")]
    fn rejects_bad_max_load() {
        let _ = Map::with_config(MapConfig::default().with_max_load(5));
    }

    #[test]
    #[should_panic(expected = "size width 4 outside 6..=16")]
    fn rejects_bad_size_width() {
        let _ = AddressMap::<u32, u32, HeapAllocator, 0x1000, 4, 256>::new();
    }

    #[test]
    #[should_panic(expected = "granule 0x3000 is not a power of two")]
    fn rejects_bad_granule() {
        let _ = AddressMap::<u32, u32, HeapAllocator, 0x3000, 8, 256>::new();
    }

    #[test]
    #[should_panic(expected = "size width 5 outside 6..=16")]
    fn max_attr_rejects_attrless_descriptor() {
        let _ = AddressMap::<u32, u32, HeapAllocator, 0x1000, 5, 256>::max_attr();
    }

    #[test]
    fn check_region_rejects_attrless_descriptor() {
        assert_eq!(
            AddressMap::<u32, u32, HeapAllocator, 0x1000, 5, 256>::check_region(0x1000, 0x1000, 0),
            Err(ContractViolation::InvalidSizeWidth { width: 5, min: 6, max: 16 })
        );
    }

    #[test]
    fn debug_output_is_compact() {
        let mut map = Map::new();
        map.map(0, 0, 0x2000, 0).unwrap();
        let text = alloc::format!("{:?}", map);
        assert_eq!(text, "AddressMap { granule: 4096, entries: 1, clusters: 1, orders: 0x2 }");
    }
}
