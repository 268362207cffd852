//! Per-stage mutable state owned exclusively by the kernel.

use quarry_common::{PartitionId, WorkerId};
use quarry_shuffle::{PartitionBoundaries, PartitionStatsSketch, ShuffleSpec};
use serde::{Deserialize, Serialize};

/// Stage lifecycle states tracked by the kernel.
///
/// Transitions only move forward along
/// `New -> Reading -> (PostReading) -> ResultsReady -> Finished`, except for
/// the explicit failure/retry back-edge to `Reading` under fault tolerance.
/// `PostReading` is entered only by statistics-dependent shuffles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagePhase {
    /// Stage exists but has not been launched.
    New,
    /// Workers are scanning input, accumulating output and (for global sorts)
    /// partition-statistics sketches.
    Reading,
    /// All partitions read; the kernel is finalizing partition boundaries
    /// from aggregated sketches.
    PostReading,
    /// Output partitions are addressable by downstream stages.
    ResultsReady,
    /// All downstream consumers have consumed the output.
    Finished,
    /// Stage failed and cannot be retried.
    Failed,
    /// Query was canceled before the stage reached a terminal state.
    Canceled,
}

impl StagePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StagePhase::Finished | StagePhase::Failed | StagePhase::Canceled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Reading -> Reading` is the per-partition retry re-entry;
    /// `PostReading -> Reading` covers a partition failing while boundaries
    /// are being finalized.
    pub fn can_transition_to(self, next: StagePhase) -> bool {
        match self {
            StagePhase::New => matches!(
                next,
                StagePhase::Reading | StagePhase::Failed | StagePhase::Canceled
            ),
            StagePhase::Reading => matches!(
                next,
                StagePhase::Reading
                    | StagePhase::PostReading
                    | StagePhase::ResultsReady
                    | StagePhase::Failed
                    | StagePhase::Canceled
            ),
            StagePhase::PostReading => matches!(
                next,
                StagePhase::Reading
                    | StagePhase::ResultsReady
                    | StagePhase::Failed
                    | StagePhase::Canceled
            ),
            StagePhase::ResultsReady => matches!(
                next,
                StagePhase::Finished | StagePhase::Failed | StagePhase::Canceled
            ),
            StagePhase::Finished | StagePhase::Failed | StagePhase::Canceled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StagePhase::New => "new",
            StagePhase::Reading => "reading",
            StagePhase::PostReading => "post_reading",
            StagePhase::ResultsReady => "results_ready",
            StagePhase::Finished => "finished",
            StagePhase::Failed => "failed",
            StagePhase::Canceled => "canceled",
        }
    }
}

/// Mutable per-stage runtime state. Created at kernel initialization and
/// mutated only by the kernel in response to worker reports.
#[derive(Debug, Clone)]
pub(crate) struct StageTracker {
    pub(crate) phase: StagePhase,
    /// Resolved output shuffle spec for this stage.
    pub(crate) shuffle_spec: ShuffleSpec,
    /// Finalized boundaries for target-size global sorts.
    pub(crate) boundaries: Option<PartitionBoundaries>,
    /// Worker currently assigned to each input partition.
    pub(crate) assigned: Vec<Option<WorkerId>>,
    /// Retry count per input partition.
    pub(crate) retries: Vec<u32>,
    /// Completion flag per input partition.
    pub(crate) done: Vec<bool>,
    /// Statistics received per input partition (duplicate-report dedupe).
    pub(crate) sketch_reported: Vec<bool>,
    /// Merged partition-statistics sketch, bounded by the config budget.
    pub(crate) sketch: PartitionStatsSketch,
    /// Unix millis of the last observed progress for this stage.
    pub(crate) last_progress_ms: u64,
    /// Failure reason, once the stage has failed.
    pub(crate) failure: Option<String>,
}

impl StageTracker {
    pub(crate) fn new(
        shuffle_spec: ShuffleSpec,
        partitions: u32,
        sketch_budget_bytes: usize,
        now_ms: u64,
    ) -> Self {
        let n = partitions.max(1) as usize;
        Self {
            phase: StagePhase::New,
            shuffle_spec,
            boundaries: None,
            assigned: vec![None; n],
            retries: vec![0; n],
            done: vec![false; n],
            sketch_reported: vec![false; n],
            sketch: PartitionStatsSketch::new(sketch_budget_bytes),
            last_progress_ms: now_ms,
            failure: None,
        }
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.done.len()
    }

    pub(crate) fn all_done(&self) -> bool {
        self.done.iter().all(|d| *d)
    }

    pub(crate) fn done_partitions(&self) -> Vec<PartitionId> {
        self.done
            .iter()
            .enumerate()
            .filter(|(_, d)| **d)
            .map(|(i, _)| PartitionId(i as u32))
            .collect()
    }

    pub(crate) fn all_sketches_reported(&self) -> bool {
        self.sketch_reported.iter().all(|r| *r)
    }

    /// Whether this stage's output spec is safe to hand to a consumer.
    pub(crate) fn spec_finalized(&self) -> bool {
        !self.shuffle_spec.needs_statistics() || self.boundaries.is_some()
    }

    /// Output partition count, once knowable.
    pub(crate) fn output_partition_count(&self) -> Option<u32> {
        self.shuffle_spec
            .partition_count_if_known()
            .or_else(|| self.boundaries.as_ref().map(|b| b.partition_count()))
    }

    pub(crate) fn total_retries(&self) -> u32 {
        self.retries.iter().sum()
    }

    pub(crate) fn release_assignments(&mut self) {
        for slot in &mut self.assigned {
            *slot = None;
        }
    }

    /// Drop in-flight statistics, e.g. on cancellation.
    pub(crate) fn discard_sketch(&mut self) {
        let budget = self.sketch.max_retained_bytes();
        self.sketch = PartitionStatsSketch::new(budget);
        for flag in &mut self.sketch_reported {
            *flag = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_move_forward() {
        use StagePhase::*;
        assert!(New.can_transition_to(Reading));
        assert!(Reading.can_transition_to(PostReading));
        assert!(Reading.can_transition_to(ResultsReady));
        assert!(PostReading.can_transition_to(ResultsReady));
        assert!(ResultsReady.can_transition_to(Finished));

        assert!(!Reading.can_transition_to(New));
        assert!(!ResultsReady.can_transition_to(Reading));
        assert!(!PostReading.can_transition_to(New));
        assert!(!Finished.can_transition_to(Reading));
        assert!(!Failed.can_transition_to(Reading));
        assert!(!Canceled.can_transition_to(Reading));
    }

    #[test]
    fn retry_back_edge_reenters_reading() {
        use StagePhase::*;
        assert!(Reading.can_transition_to(Reading));
        assert!(PostReading.can_transition_to(Reading));
    }

    #[test]
    fn tracker_reports_completion_and_spec_finalization() {
        let mut t = StageTracker::new(ShuffleSpec::Mix, 2, 1024, 0);
        assert!(!t.all_done());
        assert!(t.spec_finalized());
        assert_eq!(t.output_partition_count(), Some(1));
        t.done[0] = true;
        t.done[1] = true;
        assert!(t.all_done());
        assert_eq!(t.done_partitions().len(), 2);
    }
}
