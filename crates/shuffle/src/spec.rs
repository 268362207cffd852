//! Shuffle specifications: how one stage's output must be organized for the
//! next stage to consume it correctly.

use serde::{Deserialize, Serialize};

use crate::key::ClusterBy;

/// Discriminant for [`ShuffleSpec`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShuffleKind {
    Mix,
    GlobalSortMaxCount,
    GlobalSortTargetSize,
}

/// Immutable descriptor of how a stage's output is partitioned and sorted.
///
/// - [`ShuffleSpec::Mix`]: a single unsorted partition. Used when there is no
///   sortable clustering key, or when one unsorted stream suffices.
/// - [`ShuffleSpec::GlobalSortMaxCount`]: output globally sorted by the
///   clustering key and split into exactly `partitions` partitions, fixed up
///   front.
/// - [`ShuffleSpec::GlobalSortTargetSize`]: globally sorted; the partition
///   count is derived at runtime from observed key statistics divided by
///   `target_rows`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShuffleSpec {
    Mix,
    GlobalSortMaxCount {
        cluster_by: ClusterBy,
        partitions: u32,
        aggregate: bool,
        /// Rows beyond this limit may be discarded during shuffling. Purely an
        /// optimization; correctness never depends on the hint being honored.
        limit_hint: Option<u64>,
    },
    GlobalSortTargetSize {
        cluster_by: ClusterBy,
        target_rows: u64,
        aggregate: bool,
    },
}

impl ShuffleSpec {
    pub fn kind(&self) -> ShuffleKind {
        match self {
            ShuffleSpec::Mix => ShuffleKind::Mix,
            ShuffleSpec::GlobalSortMaxCount { .. } => ShuffleKind::GlobalSortMaxCount,
            ShuffleSpec::GlobalSortTargetSize { .. } => ShuffleKind::GlobalSortTargetSize,
        }
    }

    /// Clustering key this shuffle sorts/partitions by, if any.
    pub fn cluster_by(&self) -> Option<&ClusterBy> {
        match self {
            ShuffleSpec::Mix => None,
            ShuffleSpec::GlobalSortMaxCount { cluster_by, .. }
            | ShuffleSpec::GlobalSortTargetSize { cluster_by, .. } => Some(cluster_by),
        }
    }

    /// Whether the producing stage performs an associative/commutative
    /// combine, permitting approximate boundary values.
    pub fn is_aggregate(&self) -> bool {
        match self {
            ShuffleSpec::Mix => false,
            ShuffleSpec::GlobalSortMaxCount { aggregate, .. }
            | ShuffleSpec::GlobalSortTargetSize { aggregate, .. } => *aggregate,
        }
    }

    pub fn limit_hint(&self) -> Option<u64> {
        match self {
            ShuffleSpec::GlobalSortMaxCount { limit_hint, .. } => *limit_hint,
            _ => None,
        }
    }

    /// Whether finalizing this shuffle requires merged worker statistics.
    ///
    /// Only target-size global sorts defer their partition count to runtime.
    pub fn needs_statistics(&self) -> bool {
        matches!(self, ShuffleSpec::GlobalSortTargetSize { .. })
    }

    /// Output partition count, when it is known without statistics.
    pub fn partition_count_if_known(&self) -> Option<u32> {
        match self {
            ShuffleSpec::Mix => Some(1),
            ShuffleSpec::GlobalSortMaxCount { partitions, .. } => Some(*partitions),
            ShuffleSpec::GlobalSortTargetSize { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyColumn;

    fn sort_key() -> ClusterBy {
        ClusterBy::new(vec![KeyColumn::ascending("a")], 0)
    }

    #[test]
    fn mix_spec_has_one_known_partition_and_no_key() {
        let spec = ShuffleSpec::Mix;
        assert_eq!(spec.kind(), ShuffleKind::Mix);
        assert_eq!(spec.partition_count_if_known(), Some(1));
        assert!(spec.cluster_by().is_none());
        assert!(!spec.needs_statistics());
        assert!(spec.limit_hint().is_none());
    }

    #[test]
    fn target_size_spec_defers_partition_count_to_statistics() {
        let spec = ShuffleSpec::GlobalSortTargetSize {
            cluster_by: sort_key(),
            target_rows: 1000,
            aggregate: true,
        };
        assert!(spec.needs_statistics());
        assert_eq!(spec.partition_count_if_known(), None);
        assert!(spec.is_aggregate());
    }

    #[test]
    fn limit_hint_only_applies_to_max_count_sorts() {
        let spec = ShuffleSpec::GlobalSortMaxCount {
            cluster_by: sort_key(),
            partitions: 4,
            aggregate: false,
            limit_hint: Some(100),
        };
        assert_eq!(spec.limit_hint(), Some(100));
        assert_eq!(spec.partition_count_if_known(), Some(4));
    }

    #[test]
    fn specs_round_trip_through_serde_json() {
        let spec = ShuffleSpec::GlobalSortTargetSize {
            cluster_by: sort_key(),
            target_rows: 42,
            aggregate: false,
        };
        let json = serde_json::to_string(&spec).expect("encode");
        let back: ShuffleSpec = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, spec);
    }
}
