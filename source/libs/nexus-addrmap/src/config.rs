// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime tuning for [`AddressMap`](crate::AddressMap).

use crate::error::ContractViolation;

/// Smallest accepted index load factor, in percent.
pub const MIN_LOAD_PERCENT: u8 = 10;
/// Largest accepted index load factor, in percent.
pub const MAX_LOAD_PERCENT: u8 = 95;
/// Load factor used by [`MapConfig::default`].
pub const DEFAULT_LOAD_PERCENT: u8 = 75;

/// Construction-time parameters that are not part of the map's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MapConfig {
    /// Expected number of clusters; sizes the index on first insert.
    pub initial_capacity: usize,
    /// Fill level of the cluster index that triggers growth.
    pub max_load_percent: u8,
}

impl MapConfig {
    pub const fn new(initial_capacity: usize, max_load_percent: u8) -> Self {
        Self { initial_capacity, max_load_percent }
    }

    pub const fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    pub const fn with_max_load(mut self, max_load_percent: u8) -> Self {
        self.max_load_percent = max_load_percent;
        self
    }

    /// Checks the parameters without constructing a map.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        if !(MIN_LOAD_PERCENT..=MAX_LOAD_PERCENT).contains(&self.max_load_percent) {
            return Err(ContractViolation::InvalidMaxLoad {
                percent: self.max_load_percent,
                min: MIN_LOAD_PERCENT,
                max: MAX_LOAD_PERCENT,
            });
        }
        Ok(())
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self::new(0, DEFAULT_LOAD_PERCENT)
    }
}
