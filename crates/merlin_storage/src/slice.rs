//! Query slices: the per-partition window of a read.

use serde::{Deserialize, Serialize};

use crate::keys::ClusteringKey;

/// One end of a clustering window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringBound {
    pub key: ClusteringKey,
    pub inclusive: bool,
}

/// The clustering window and per-partition options of a read command.
///
/// Bounds are stored in natural (non-reversed) clustering order. For a
/// forward read the lower bound advances as rows are delivered; for a
/// reversed read the upper bound advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySlice {
    pub reversed: bool,
    pub per_partition_row_limit: u64,
    pub allow_short_read: bool,
    pub lower: Option<ClusteringBound>,
    pub upper: Option<ClusteringBound>,
}

impl QuerySlice {
    /// The unrestricted forward slice.
    pub fn full() -> QuerySlice {
        QuerySlice {
            reversed: false,
            per_partition_row_limit: u64::MAX,
            allow_short_read: true,
            lower: None,
            upper: None,
        }
    }

    pub fn reversed(mut self) -> QuerySlice {
        self.reversed = true;
        self
    }

    pub fn contains(&self, key: &ClusteringKey) -> bool {
        let above = match &self.lower {
            None => true,
            Some(b) if b.inclusive => *key >= b.key,
            Some(b) => *key > b.key,
        };
        let below = match &self.upper {
            None => true,
            Some(b) if b.inclusive => *key <= b.key,
            Some(b) => *key < b.key,
        };
        above && below
    }

    /// Whether a saved reader built for `self` can serve a request for
    /// `other`: equal except for the bound that paging advances.
    pub fn compatible_with(&self, other: &QuerySlice) -> bool {
        if self.reversed != other.reversed
            || self.per_partition_row_limit != other.per_partition_row_limit
            || self.allow_short_read != other.allow_short_read
        {
            return false;
        }
        if self.reversed {
            self.lower == other.lower
        } else {
            self.upper == other.upper
        }
    }
}
