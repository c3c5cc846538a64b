// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Open-addressed cluster index: linear probing, backward-shift deletion, growth
//! by doubling once the fill level would exceed the configured load.

use alloc::vec::Vec;

use crate::cluster::{Cluster, ClusterKey};
use crate::error::MapError;

/// Smallest non-zero slot count; keeps the hash shift below 64.
const MIN_SLOTS: usize = 8;
/// Largest power of two a slot count can reach.
const MAX_SLOTS: usize = 1 << (usize::BITS - 1);

pub(crate) struct ClusterTable {
    slots: Vec<Option<Cluster>>,
    len: usize,
    max_load_percent: u8,
    initial_slots: usize,
}

impl ClusterTable {
    /// Creates an unallocated table. `expected` clusters fit before the first growth.
    pub fn new(expected: usize, max_load_percent: u8) -> Self {
        let wanted = expected.saturating_mul(100) / usize::from(max_load_percent) + 1;
        let initial_slots = wanted.max(MIN_SLOTS).checked_next_power_of_two().unwrap_or(MAX_SLOTS);
        Self { slots: Vec::new(), len: 0, max_load_percent, initial_slots }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn home(&self, key: &ClusterKey) -> usize {
        let bits = self.slots.len().trailing_zeros();
        (key.hash() >> (u64::BITS - bits)) as usize
    }

    fn position(&self, key: &ClusterKey) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut index = self.home(key);
        loop {
            match &self.slots[index] {
                None => return None,
                Some(cluster) if cluster.key() == *key => return Some(index),
                Some(_) => index = (index + 1) & mask,
            }
        }
    }

    pub fn get(&self, key: &ClusterKey) -> Option<&Cluster> {
        let index = self.position(key)?;
        self.slots[index].as_ref()
    }

    pub fn get_mut(&mut self, key: &ClusterKey) -> Option<&mut Cluster> {
        let index = self.position(key)?;
        self.slots[index].as_mut()
    }

    fn over_load(&self, len: usize, slots: usize) -> bool {
        len.saturating_mul(100) > slots.saturating_mul(usize::from(self.max_load_percent))
    }

    /// Makes room so that the next [`ClusterTable::insert`] cannot fail.
    pub fn reserve_one(&mut self) -> Result<(), MapError> {
        let target = self.len + 1;
        if !self.slots.is_empty() && !self.over_load(target, self.slots.len()) {
            return Ok(());
        }
        let mut slots = if self.slots.is_empty() { self.initial_slots } else { self.slots.len() * 2 };
        while self.over_load(target, slots) {
            slots *= 2;
        }
        self.rehash(slots)
    }

    fn rehash(&mut self, count: usize) -> Result<(), MapError> {
        let mut fresh: Vec<Option<Cluster>> = Vec::new();
        fresh.try_reserve_exact(count).map_err(|_| MapError::OutOfMemory {
            bytes: count.saturating_mul(core::mem::size_of::<Option<Cluster>>()),
        })?;
        fresh.resize_with(count, || None);
        let old = core::mem::replace(&mut self.slots, fresh);
        log::trace!(target: "addrmap", "index resized {} -> {} slots", old.len(), count);
        for cluster in old.into_iter().flatten() {
            self.place(cluster);
        }
        Ok(())
    }

    fn place(&mut self, cluster: Cluster) {
        let mask = self.slots.len() - 1;
        let mut index = self.home(&cluster.key());
        while self.slots[index].is_some() {
            index = (index + 1) & mask;
        }
        self.slots[index] = Some(cluster);
    }

    /// Inserts a cluster whose key is absent. Call [`ClusterTable::reserve_one`] first.
    pub fn insert(&mut self, cluster: Cluster) -> &mut Cluster {
        debug_assert!(self.position(&cluster.key()).is_none());
        debug_assert!(!self.slots.is_empty() && !self.over_load(self.len + 1, self.slots.len()));
        let mask = self.slots.len() - 1;
        let mut index = self.home(&cluster.key());
        while self.slots[index].is_some() {
            index = (index + 1) & mask;
        }
        self.len += 1;
        self.slots[index].insert(cluster)
    }

    pub fn remove(&mut self, key: &ClusterKey) -> Option<Cluster> {
        let mut hole = self.position(key)?;
        let removed = self.slots[hole].take();
        self.len -= 1;
        let mask = self.slots.len() - 1;
        let mut next = (hole + 1) & mask;
        while let Some(cluster) = &self.slots[next] {
            let home = self.home(&cluster.key());
            // Entries whose home lies cyclically in (hole, next] stay put.
            let stays = if hole <= next {
                hole < home && home <= next
            } else {
                hole < home || home <= next
            };
            if !stays {
                self.slots[hole] = self.slots[next].take();
                hole = next;
            }
            next = (next + 1) & mask;
        }
        if self.len == 0 {
            self.slots = Vec::new();
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cluster> + '_ {
        self.slots.iter().flatten()
    }

    /// Empties the table and releases its storage.
    pub fn take_all(&mut self) -> Vec<Option<Cluster>> {
        self.len = 0;
        core::mem::take(&mut self.slots)
    }
}
