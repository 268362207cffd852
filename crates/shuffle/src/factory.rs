//! Pure factories that decide, per DAG edge, how a stage's output shuffle
//! must be organized. Stateless; invoked once per edge during planning.

use serde::{Deserialize, Serialize};

use crate::key::ClusterBy;
use crate::spec::ShuffleSpec;

/// Selection policy for a stage's output [`ShuffleSpec`].
///
/// A factory is resolved against the stage's clustering key and aggregate
/// flag via [`ShuffleSpecFactory::build`]. Factories never fail: a key that
/// cannot support the requested organization degrades to [`ShuffleSpec::Mix`]
/// where that is meaningful, and is a caller contract otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShuffleSpecFactory {
    /// One output partition, sorted when a sortable key exists, mixed when
    /// there is nothing to sort by.
    SinglePartition {
        /// Optional row limit the shuffle may exploit to discard excess rows.
        limit_hint: Option<u64>,
    },
    /// Globally sorted output split into a fixed number of partitions.
    ///
    /// Callers must check key sortability before selecting this factory; an
    /// empty key makes no sense here.
    GlobalSortMaxCount { partitions: u32 },
    /// Globally sorted output whose partition count is derived at runtime
    /// from observed data volume divided by `target_rows`.
    GlobalSortTargetSize { target_rows: u64 },
}

impl ShuffleSpecFactory {
    /// Factory that produces a single output partition, which may or may not
    /// be sorted.
    pub fn single_partition() -> Self {
        ShuffleSpecFactory::SinglePartition { limit_hint: None }
    }

    /// Like [`ShuffleSpecFactory::single_partition`], carrying a limit hint
    /// that the shuffle may (but need not) apply while shuffling.
    pub fn single_partition_with_limit(limit_hint: u64) -> Self {
        ShuffleSpecFactory::SinglePartition {
            limit_hint: Some(limit_hint),
        }
    }

    /// Factory that produces a fixed number of globally sorted partitions.
    pub fn global_sort_with_max_partition_count(partitions: u32) -> Self {
        ShuffleSpecFactory::GlobalSortMaxCount { partitions }
    }

    /// Factory that produces globally sorted partitions of a target size.
    ///
    /// Resolves to [`ShuffleSpec::Mix`] if the clustering key is empty.
    pub fn global_sort_with_target_size(target_rows: u64) -> Self {
        ShuffleSpecFactory::GlobalSortTargetSize { target_rows }
    }

    /// Resolve this factory against a stage's clustering key and aggregate flag.
    pub fn build(&self, cluster_by: &ClusterBy, aggregate: bool) -> ShuffleSpec {
        match *self {
            ShuffleSpecFactory::SinglePartition { limit_hint } => {
                if cluster_by.sortable() && !cluster_by.is_empty() {
                    ShuffleSpec::GlobalSortMaxCount {
                        cluster_by: cluster_by.clone(),
                        partitions: 1,
                        aggregate,
                        limit_hint,
                    }
                } else {
                    ShuffleSpec::Mix
                }
            }
            ShuffleSpecFactory::GlobalSortMaxCount { partitions } => {
                ShuffleSpec::GlobalSortMaxCount {
                    cluster_by: cluster_by.clone(),
                    partitions,
                    aggregate,
                    limit_hint: None,
                }
            }
            ShuffleSpecFactory::GlobalSortTargetSize { target_rows } => {
                if cluster_by.is_empty() {
                    // Nothing to partition or sort by; funnel everything into
                    // a single mixed partition.
                    ShuffleSpec::Mix
                } else {
                    ShuffleSpec::GlobalSortTargetSize {
                        cluster_by: cluster_by.clone(),
                        target_rows,
                        aggregate,
                    }
                }
            }
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
    fn single_partition_on_empty_key_yields_mix() {
        let spec = ShuffleSpecFactory::single_partition().build(&ClusterBy::empty(), false);
        assert_eq!(spec, ShuffleSpec::Mix);
    }

    #[test]
    fn single_partition_on_sortable_key_yields_one_sorted_partition() {
        let spec = ShuffleSpecFactory::single_partition_with_limit(10).build(&sort_key(), true);
        match spec {
            ShuffleSpec::GlobalSortMaxCount {
                partitions,
                aggregate,
                limit_hint,
                ..
            } => {
                assert_eq!(partitions, 1);
                assert!(aggregate);
                assert_eq!(limit_hint, Some(10));
            }
            other => panic!("expected GlobalSortMaxCount, got {other:?}"),
        }
    }

    #[test]
    fn single_partition_on_bucket_only_key_yields_mix() {
        let bucket_only = ClusterBy::new(vec![KeyColumn::ascending("k")], 1);
        let spec = ShuffleSpecFactory::single_partition().build(&bucket_only, false);
        assert_eq!(spec, ShuffleSpec::Mix);
    }

    #[test]
    fn target_size_on_empty_key_yields_mix_regardless_of_target() {
        for target in [1_u64, 1000, u64::MAX] {
            let spec = ShuffleSpecFactory::global_sort_with_target_size(target)
                .build(&ClusterBy::empty(), false);
            assert_eq!(spec, ShuffleSpec::Mix);
        }
    }

    #[test]
    fn target_size_on_sortable_key_defers_partition_count() {
        let spec =
            ShuffleSpecFactory::global_sort_with_target_size(1000).build(&sort_key(), false);
        assert!(spec.needs_statistics());
        assert_eq!(spec.partition_count_if_known(), None);
    }

    #[test]
    fn max_count_factory_always_builds_max_count_spec() {
        let spec =
            ShuffleSpecFactory::global_sort_with_max_partition_count(8).build(&sort_key(), false);
        assert_eq!(spec.partition_count_if_known(), Some(8));
        assert!(spec.limit_hint().is_none());
    }
}
