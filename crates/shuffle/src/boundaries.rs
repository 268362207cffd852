//! Partition-boundary computation for target-size global sorts.
//!
//! Given the merged worker sketches for a stage, choose cut points so each
//! resulting partition's estimated weight is close to the configured target.

use quarry_common::{QuarryError, Result};
use serde::{Deserialize, Serialize};

use crate::key::{ClusterBy, KeyRow};
use crate::sketch::PartitionStatsSketch;

/// Finalized boundaries for a target-size global-sort shuffle.
///
/// `cuts[i]` is the first key row of partition `i + 1`; partition 0 starts at
/// the beginning of the key space. The partition count is therefore
/// `cuts.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionBoundaries {
    cuts: Vec<KeyRow>,
}

impl PartitionBoundaries {
    pub fn cuts(&self) -> &[KeyRow] {
        &self.cuts
    }

    pub fn partition_count(&self) -> u32 {
        self.cuts.len() as u32 + 1
    }
}

/// Compute boundary cut points from a merged sketch.
///
/// Samples are walked in clustering-key order, accumulating weight; a cut is
/// emitted only when adding the next sample would strictly exceed the target,
/// so an exactly-full partition keeps absorbing. Equal-fit candidates thus
/// resolve toward fewer partitions. Deterministic for identical input, which
/// retried partitions rely on.
pub fn compute_partition_boundaries(
    cluster_by: &ClusterBy,
    sketch: &PartitionStatsSketch,
    target_weight: u64,
) -> Result<PartitionBoundaries> {
    if cluster_by.is_empty() {
        return Err(QuarryError::Internal(
            "cannot compute boundaries for an empty clustering key".to_string(),
        ));
    }
    let target = target_weight.max(1);

    let mut samples = sketch.samples().to_vec();
    samples.sort_by(|(a, _), (b, _)| cluster_by.compare(a, b).then_with(|| a.cmp(b)));

    let mut cuts = Vec::new();
    let mut running = 0_u64;
    for (key, weight) in samples {
        if running > 0 && running.saturating_add(weight) > target {
            cuts.push(key);
            running = 0;
        }
        running = running.saturating_add(weight);
    }

    Ok(PartitionBoundaries { cuts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyColumn, KeyValue};

    fn key() -> ClusterBy {
        ClusterBy::new(vec![KeyColumn::ascending("col_a")], 0)
    }

    fn row(v: i64) -> KeyRow {
        KeyRow::new(vec![KeyValue::Int(v)])
    }

    fn uniform_sketch(range: std::ops::RangeInclusive<i64>, weight: u64) -> PartitionStatsSketch {
        let mut s = PartitionStatsSketch::new(1 << 24);
        for v in range {
            s.add(row(v), weight).expect("add");
        }
        s
    }

    #[test]
    fn empty_sketch_yields_single_partition() {
        let sketch = PartitionStatsSketch::new(1 << 20);
        let b = compute_partition_boundaries(&key(), &sketch, 1000).expect("boundaries");
        assert_eq!(b.partition_count(), 1);
        assert!(b.cuts().is_empty());
    }

    #[test]
    fn uniform_distribution_cuts_near_target_weight() {
        // Three worker ranges merged: [1,100], [101,250], [251,400], 10 rows
        // per key. Total weight 4000, target 1000 => exactly 4 partitions.
        let mut merged = uniform_sketch(1..=100, 10);
        merged.merge(&uniform_sketch(101..=250, 10)).expect("m1");
        merged.merge(&uniform_sketch(251..=400, 10)).expect("m2");

        let b = compute_partition_boundaries(&key(), &merged, 1000).expect("boundaries");
        assert_eq!(b.partition_count(), 4);
        assert_eq!(
            b.cuts().to_vec(),
            vec![row(101), row(201), row(301)],
        );
    }

    #[test]
    fn exact_fit_prefers_fewer_partitions() {
        // Two samples of exactly the target each still split, but a sample
        // landing exactly on the target boundary is absorbed, not cut.
        let mut s = PartitionStatsSketch::new(1 << 20);
        s.add(row(1), 500).expect("add");
        s.add(row(2), 500).expect("add");
        s.add(row(3), 1).expect("add");
        let b = compute_partition_boundaries(&key(), &s, 1000).expect("boundaries");
        // 500 + 500 == 1000 fits one partition; the trailing 1 overflows.
        assert_eq!(b.partition_count(), 2);
        assert_eq!(b.cuts().to_vec(), vec![row(3)]);
    }

    #[test]
    fn recomputing_from_same_sketch_is_deterministic() {
        let sketch = uniform_sketch(1..=57, 13);
        let a = compute_partition_boundaries(&key(), &sketch, 100).expect("a");
        let b = compute_partition_boundaries(&key(), &sketch, 100).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn descending_key_cuts_in_descending_order() {
        let desc = ClusterBy::new(vec![KeyColumn::descending("col_a")], 0);
        let sketch = uniform_sketch(1..=4, 10);
        let b = compute_partition_boundaries(&desc, &sketch, 10).expect("boundaries");
        assert_eq!(b.partition_count(), 4);
        assert_eq!(b.cuts().to_vec(), vec![row(3), row(2), row(1)]);
    }

    #[test]
    fn empty_clustering_key_is_rejected() {
        let sketch = PartitionStatsSketch::new(1 << 20);
        let err = compute_partition_boundaries(&ClusterBy::empty(), &sketch, 10)
            .expect_err("must reject");
        assert!(matches!(err, QuarryError::Internal(_)));
    }
}
