//! Conntrack statistics mappers.
//!
//! Per-CPU statistics replies carry the CPU number in the netfilter
//! sub-header's resource id, not in an attribute.

use crate::netlink::attr::{Attribute, get};
use crate::netlink::error::Result;

// Per-CPU flow statistics (CTA_STATS_*)
pub const CTA_STATS_SEARCHED: u16 = 1;
pub const CTA_STATS_FOUND: u16 = 2;
pub const CTA_STATS_NEW: u16 = 3;
pub const CTA_STATS_INVALID: u16 = 4;
pub const CTA_STATS_IGNORE: u16 = 5;
pub const CTA_STATS_DELETE: u16 = 6;
pub const CTA_STATS_DELETE_LIST: u16 = 7;
pub const CTA_STATS_INSERT: u16 = 8;
pub const CTA_STATS_INSERT_FAILED: u16 = 9;
pub const CTA_STATS_DROP: u16 = 10;
pub const CTA_STATS_EARLY_DROP: u16 = 11;
pub const CTA_STATS_ERROR: u16 = 12;
pub const CTA_STATS_SEARCH_RESTART: u16 = 13;

// Global statistics (CTA_STATS_GLOBAL_*)
pub const CTA_STATS_GLOBAL_ENTRIES: u16 = 1;
pub const CTA_STATS_GLOBAL_MAX_ENTRIES: u16 = 2;

// Per-CPU expectation statistics (CTA_STATS_EXP_*)
pub const CTA_STATS_EXP_NEW: u16 = 1;
pub const CTA_STATS_EXP_CREATE: u16 = 2;
pub const CTA_STATS_EXP_DELETE: u16 = 3;

/// Per-CPU flow tracking statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stats {
    /// CPU these counters belong to.
    pub cpu_id: u16,
    pub searched: u32,
    pub found: u32,
    pub new: u32,
    pub invalid: u32,
    pub ignore: u32,
    pub delete: u32,
    pub delete_list: u32,
    pub insert: u32,
    pub insert_failed: u32,
    pub drop: u32,
    pub early_drop: u32,
    pub error: u32,
    pub search_restart: u32,
}

impl Stats {
    /// Decode one CPU's counters. The CPU number comes from the reply's
    /// netfilter resource id.
    pub fn unmarshal(cpu_id: u16, attrs: &[Attribute]) -> Result<Stats> {
        let mut stats = Stats {
            cpu_id,
            ..Default::default()
        };

        for attr in attrs {
            let value = get::u32_be(&attr.data)?;
            match attr.attr_type {
                CTA_STATS_SEARCHED => stats.searched = value,
                CTA_STATS_FOUND => stats.found = value,
                CTA_STATS_NEW => stats.new = value,
                CTA_STATS_INVALID => stats.invalid = value,
                CTA_STATS_IGNORE => stats.ignore = value,
                CTA_STATS_DELETE => stats.delete = value,
                CTA_STATS_DELETE_LIST => stats.delete_list = value,
                CTA_STATS_INSERT => stats.insert = value,
                CTA_STATS_INSERT_FAILED => stats.insert_failed = value,
                CTA_STATS_DROP => stats.drop = value,
                CTA_STATS_EARLY_DROP => stats.early_drop = value,
                CTA_STATS_ERROR => stats.error = value,
                CTA_STATS_SEARCH_RESTART => stats.search_restart = value,
                _ => {}
            }
        }

        Ok(stats)
    }
}

/// Per-CPU expectation statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatsExpect {
    /// CPU these counters belong to.
    pub cpu_id: u16,
    pub new: u32,
    pub create: u32,
    pub delete: u32,
}

impl StatsExpect {
    /// Decode one CPU's expectation counters.
    pub fn unmarshal(cpu_id: u16, attrs: &[Attribute]) -> Result<StatsExpect> {
        let mut stats = StatsExpect {
            cpu_id,
            ..Default::default()
        };

        for attr in attrs {
            let value = get::u32_be(&attr.data)?;
            match attr.attr_type {
                CTA_STATS_EXP_NEW => stats.new = value,
                CTA_STATS_EXP_CREATE => stats.create = value,
                CTA_STATS_EXP_DELETE => stats.delete = value,
                _ => {}
            }
        }

        Ok(stats)
    }
}

/// Extract the table entry count from a global statistics reply.
pub fn unmarshal_count(attrs: &[Attribute]) -> Result<u32> {
    for attr in attrs {
        if attr.attr_type == CTA_STATS_GLOBAL_ENTRIES {
            return Ok(get::u32_be(&attr.data)?);
        }
    }
    Ok(0)
}
