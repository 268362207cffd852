//! Bounded-memory summary of the clustering-key distribution observed by one
//! worker, and the merge discipline the controller applies across workers.

use quarry_common::{QuarryError, Result};
use serde::{Deserialize, Serialize};

use crate::key::KeyRow;

/// Weighted sample of observed clustering-key rows, bounded by a byte budget.
///
/// Workers accumulate one sketch per stage while reading; the controller
/// merges all worker sketches before computing partition boundaries. Equal
/// key rows are coalesced by summing weights, so merge is associative and
/// commutative. Exceeding the byte budget is an error, never a silent
/// accuracy downgrade: wrong cardinality assumptions must fail the stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionStatsSketch {
    max_retained_bytes: usize,
    retained_bytes: usize,
    total_weight: u64,
    /// Kept sorted by key row; coalesced on insert.
    samples: Vec<(KeyRow, u64)>,
}

// Per-sample bookkeeping overhead beyond the key payload itself.
const SAMPLE_OVERHEAD_BYTES: usize = 8;

impl PartitionStatsSketch {
    pub fn new(max_retained_bytes: usize) -> Self {
        Self {
            max_retained_bytes,
            retained_bytes: 0,
            total_weight: 0,
            samples: Vec::new(),
        }
    }

    pub fn max_retained_bytes(&self) -> usize {
        self.max_retained_bytes
    }

    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    /// Total observed row weight across all samples.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Retained `(key, weight)` samples in key order.
    pub fn samples(&self) -> &[(KeyRow, u64)] {
        &self.samples
    }

    /// Record `weight` observed rows at (or near) `key`.
    pub fn add(&mut self, key: KeyRow, weight: u64) -> Result<()> {
        match self.samples.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(idx) => {
                self.samples[idx].1 = self.samples[idx].1.saturating_add(weight);
            }
            Err(idx) => {
                self.retained_bytes += key.estimated_bytes() + SAMPLE_OVERHEAD_BYTES;
                self.samples.insert(idx, (key, weight));
            }
        }
        self.total_weight = self.total_weight.saturating_add(weight);
        self.check_budget()
    }

    /// Merge another sketch into this one.
    ///
    /// Commutative and associative; duplicate-key samples coalesce. The byte
    /// budget of `self` applies to the merged result.
    pub fn merge(&mut self, other: &PartitionStatsSketch) -> Result<()> {
        for (key, weight) in &other.samples {
            match self.samples.binary_search_by(|(k, _)| k.cmp(key)) {
                Ok(idx) => {
                    self.samples[idx].1 = self.samples[idx].1.saturating_add(*weight);
                }
                Err(idx) => {
                    self.retained_bytes += key.estimated_bytes() + SAMPLE_OVERHEAD_BYTES;
                    self.samples.insert(idx, (key.clone(), *weight));
                }
            }
            self.total_weight = self.total_weight.saturating_add(*weight);
        }
        self.check_budget()
    }

    fn check_budget(&self) -> Result<()> {
        if self.retained_bytes > self.max_retained_bytes {
            return Err(QuarryError::SketchBudgetExceeded(format!(
                "retained {} bytes exceeds budget of {} bytes",
                self.retained_bytes, self.max_retained_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyValue;

    fn row(v: i64) -> KeyRow {
        KeyRow::new(vec![KeyValue::Int(v)])
    }

    #[test]
    fn add_coalesces_equal_keys() {
        let mut s = PartitionStatsSketch::new(1 << 20);
        s.add(row(1), 5).expect("add");
        s.add(row(1), 7).expect("add dup");
        s.add(row(2), 3).expect("add other");
        assert_eq!(s.sample_count(), 2);
        assert_eq!(s.total_weight(), 15);
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = PartitionStatsSketch::new(1 << 20);
        let mut b = PartitionStatsSketch::new(1 << 20);
        for v in [3_i64, 1, 2] {
            a.add(row(v), v as u64).expect("add a");
        }
        for v in [2_i64, 4] {
            b.add(row(v), 10).expect("add b");
        }

        let mut ab = a.clone();
        ab.merge(&b).expect("merge ab");
        let mut ba = b.clone();
        ba.merge(&a).expect("merge ba");

        assert_eq!(ab.samples(), ba.samples());
        assert_eq!(ab.total_weight(), ba.total_weight());
    }

    #[test]
    fn exceeding_budget_is_an_error_not_a_downgrade() {
        let mut s = PartitionStatsSketch::new(64);
        let mut hit_budget = false;
        for v in 0..100 {
            if s.add(row(v), 1).is_err() {
                hit_budget = true;
                break;
            }
        }
        assert!(hit_budget);
        // Samples added so far are still retained and accounted.
        assert!(s.retained_bytes() > s.max_retained_bytes());
    }

    #[test]
    fn merge_respects_destination_budget() {
        let mut small = PartitionStatsSketch::new(80);
        let mut big = PartitionStatsSketch::new(1 << 20);
        for v in 0..50 {
            big.add(row(v), 1).expect("add big");
        }
        let err = small.merge(&big).expect_err("must exceed");
        assert!(matches!(
            err,
            quarry_common::QuarryError::SketchBudgetExceeded(_)
        ));
    }
}
