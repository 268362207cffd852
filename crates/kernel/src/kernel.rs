//! Controller query kernel: the authoritative state machine for one query.
//!
//! Responsibilities:
//! - own per-stage phase, worker assignment, and retry state;
//! - resolve each stage's shuffle spec and gate consumers on finalization;
//! - merge worker statistics sketches and finalize global-sort boundaries;
//! - recover from worker failure per-partition when fault tolerance and
//!   durable storage allow it, and fail the query otherwise.
//!
//! The kernel is a single-writer state machine: all mutations are applied by
//! whoever owns it (see `service` for the channel-driven wrapper). Workers
//! and the transport never touch this state directly; they report
//! observations through the `report_*` entry points.
//!
//! Failure semantics:
//! - construction-time errors return immediately and build no kernel;
//! - runtime failures surface as stage/query status transitions observable
//!   through [`ControllerQueryKernel::status`], never as a kernel crash.

use std::time::{SystemTime, UNIX_EPOCH};

use quarry_common::metrics::global_metrics;
use quarry_common::{PartitionId, QuarryError, QueryId, Result, StageId, WorkerId};
use quarry_shuffle::{
    compute_partition_boundaries, PartitionBoundaries, PartitionStatsSketch, ShuffleSpec,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::KernelConfig;
use crate::dag::StageDag;
use crate::tracker::{StagePhase, StageTracker};
use crate::work_order::WorkOrder;

/// Query lifecycle states tracked by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    /// At least one stage is not yet finished.
    Running,
    /// Every stage finished.
    Succeeded,
    /// A stage failed and could not recover.
    Failed,
    /// Query was canceled by the orchestrating caller.
    Canceled,
}

/// Worker-side progress granularity reported through the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    /// The worker started reading its partition.
    Started,
    /// The partition's output is complete and addressable.
    OutputComplete,
}

/// Public per-stage snapshot returned by [`ControllerQueryKernel::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage_id: StageId,
    pub phase: StagePhase,
    /// Total partition retries scheduled for this stage.
    pub retries: u32,
    /// Output partitions currently readable downstream.
    pub readable_partitions: u32,
    /// Output partition count, once knowable.
    pub output_partitions: Option<u32>,
}

/// Public query status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStatus {
    pub query_id: QueryId,
    pub state: QueryState,
    /// Human-readable failure reason; distinguishes configuration rejection,
    /// sketch-budget data skew, and retry-budget exhaustion.
    pub failure_reason: Option<String>,
    pub stages: Vec<StageSnapshot>,
}

/// The stateful orchestrator for one query's stage DAG.
#[derive(Debug)]
pub struct ControllerQueryKernel {
    query_id: QueryId,
    dag: StageDag,
    config: KernelConfig,
    trackers: Vec<StageTracker>,
    next_worker: u32,
    state: QueryState,
    failure_reason: Option<String>,
}

impl ControllerQueryKernel {
    /// Initialize the kernel from a validated DAG and config.
    ///
    /// Each stage's shuffle spec is resolved here, at once, since the
    /// factories are pure; only statistics-dependent specs stay unfinalized.
    pub fn new(query_id: QueryId, dag: StageDag, config: KernelConfig) -> Result<Self> {
        let now = now_ms()?;
        let trackers = dag
            .stages()
            .iter()
            .map(|stage| {
                let spec = stage.shuffle.build(&stage.cluster_by, stage.aggregate);
                StageTracker::new(
                    spec,
                    stage.max_worker_count,
                    config.max_retained_partition_sketch_bytes(),
                    now,
                )
            })
            .collect::<Vec<_>>();
        info!(
            query_id = %query_id,
            stages = dag.len(),
            pipeline = config.pipeline(),
            fault_tolerant = config.fault_tolerant(),
            operator = "KernelInit",
            "query kernel initialized"
        );
        Ok(Self {
            query_id,
            dag,
            config,
            trackers,
            next_worker: 0,
            state: QueryState::Running,
            failure_reason: None,
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn query_state(&self) -> QueryState {
        self.state
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.state != QueryState::Running
    }

    pub fn stage_phase(&self, stage: StageId) -> Result<StagePhase> {
        Ok(self.tracker(stage)?.phase)
    }

    /// Milliseconds since the stage last made observable progress. Timeout
    /// policy belongs to the orchestrating caller.
    pub fn time_since_progress(&self, stage: StageId, now_ms: u64) -> Result<u64> {
        Ok(now_ms.saturating_sub(self.tracker(stage)?.last_progress_ms))
    }

    /// Stages eligible to start right now: every producer has readable,
    /// finalized output, and the concurrent-stage budget has room. Under
    /// pipelining a producer that is still reading qualifies once it has at
    /// least one readable partition.
    pub fn runnable_stages(&self) -> Vec<StageId> {
        if self.state != QueryState::Running {
            return Vec::new();
        }
        let mut active = self.active_stage_count();
        let mut runnable = Vec::new();
        for &stage in self.dag.topological_order() {
            if active >= self.config.max_concurrent_stages() {
                break;
            }
            if self.trackers[stage.index()].phase != StagePhase::New {
                continue;
            }
            if self.inputs_satisfied(stage) {
                runnable.push(stage);
                active += 1;
            }
        }
        runnable
    }

    /// Launch one stage: assign a worker per partition and emit work orders
    /// for the transport. `New -> Reading`.
    pub fn start_stage(&mut self, stage: StageId) -> Result<Vec<WorkOrder>> {
        if self.state != QueryState::Running {
            return Err(QuarryError::Internal(format!(
                "cannot start stage {stage}: query is not running"
            )));
        }
        if self.tracker(stage)?.phase != StagePhase::New {
            return Err(QuarryError::Internal(format!(
                "stage {stage} already started"
            )));
        }
        if self.active_stage_count() >= self.config.max_concurrent_stages() {
            return Err(QuarryError::NotReady(format!(
                "stage {stage} queued: concurrent stage limit of {} reached",
                self.config.max_concurrent_stages()
            )));
        }
        for &input in self.dag.inputs(stage) {
            if !self.trackers[input.index()].spec_finalized() {
                // Contract violation: the caller must never launch a consumer
                // against an unfinalized shuffle spec.
                return Err(QuarryError::ShuffleNotFinalized(format!(
                    "producer stage {input} of stage {stage} has no finalized shuffle spec"
                )));
            }
            if !self.input_readable(input) {
                return Err(QuarryError::Internal(format!(
                    "producer stage {input} of stage {stage} has no readable output"
                )));
            }
        }

        let now = now_ms()?;
        let partitions = self.tracker(stage)?.partition_count();
        let workers: Vec<WorkerId> = (0..partitions).map(|_| self.next_worker_id()).collect();
        let inputs = self.dag.inputs(stage).to_vec();
        let spec = self.tracker(stage)?.shuffle_spec.clone();

        let orders = workers
            .iter()
            .enumerate()
            .map(|(p, worker)| WorkOrder {
                query_id: self.query_id,
                stage_id: stage,
                partition_id: PartitionId(p as u32),
                worker_id: *worker,
                attempt: 0,
                shuffle_spec: spec.clone(),
                input_stages: inputs.clone(),
                worker_context: self.config.worker_context().clone(),
            })
            .collect::<Vec<_>>();

        let tracker = self.tracker_mut(stage)?;
        for (p, worker) in workers.iter().enumerate() {
            tracker.assigned[p] = Some(*worker);
        }
        tracker.last_progress_ms = now;
        self.apply_phase(stage, StagePhase::Reading)?;
        info!(
            query_id = %self.query_id,
            stage_id = stage.0,
            partitions,
            operator = "KernelLaunch",
            "stage launched"
        );
        Ok(orders)
    }

    /// Worker progress report. `Started` only refreshes the progress clock;
    /// `OutputComplete` marks the partition's output readable.
    pub fn report_partition_phase(
        &mut self,
        stage: StageId,
        partition: PartitionId,
        phase: WorkerPhase,
    ) -> Result<()> {
        match phase {
            WorkerPhase::Started => {
                let now = now_ms()?;
                let tracker = self.tracker_mut(stage)?;
                if !tracker.phase.is_terminal() {
                    tracker.last_progress_ms = now;
                }
                Ok(())
            }
            WorkerPhase::OutputComplete => self.report_partition_done(stage, partition),
        }
    }

    /// Merge one worker's statistics sketch into the stage's sketch.
    ///
    /// Idempotent for duplicate delivery: a partition's sketch is merged at
    /// most once. A budget overflow fails the stage fatally regardless of
    /// fault tolerance; it signals data skew the boundaries cannot survive.
    pub fn report_partition_statistics(
        &mut self,
        stage: StageId,
        partition: PartitionId,
        sketch: &PartitionStatsSketch,
    ) -> Result<()> {
        let now = now_ms()?;
        let tracker = self.tracker_mut(stage)?;
        if tracker.phase.is_terminal() {
            return Ok(());
        }
        if tracker.phase == StagePhase::New {
            // Reject before any mutation: recording the report would swallow
            // the genuine one arriving after launch.
            return Err(QuarryError::Internal(format!(
                "statistics report for unstarted stage {stage}"
            )));
        }
        if !tracker.shuffle_spec.needs_statistics() {
            warn!(
                stage_id = stage.0,
                operator = "KernelStats",
                "ignoring statistics for a shuffle that does not use them"
            );
            return Ok(());
        }
        let idx = partition.index();
        if idx >= tracker.sketch_reported.len() {
            return Err(QuarryError::Internal(format!(
                "unknown partition {partition} for stage {stage}"
            )));
        }
        if tracker.sketch_reported[idx] {
            debug!(
                stage_id = stage.0,
                partition_id = partition.0,
                operator = "KernelStats",
                "duplicate statistics report ignored"
            );
            return Ok(());
        }
        tracker.sketch_reported[idx] = true;
        tracker.last_progress_ms = now;
        if let Err(e) = tracker.sketch.merge(sketch) {
            let reason = format!("data skew exceeded sketch budget on stage {stage}: {e}");
            self.fail_stage(stage, reason, "sketch_budget")?;
            return Ok(());
        }
        let retained = self.tracker(stage)?.sketch.retained_bytes() as u64;
        global_metrics().set_sketch_retained_bytes(
            &self.query_id.to_string(),
            stage.0,
            retained,
        );
        self.maybe_finalize_boundaries(stage)
    }

    /// Mark one partition's output complete. Idempotent. When the last
    /// partition completes, the stage moves to `PostReading` (statistics
    /// shuffles) or straight to `ResultsReady`.
    pub fn report_partition_done(&mut self, stage: StageId, partition: PartitionId) -> Result<()> {
        let now = now_ms()?;
        let tracker = self.tracker_mut(stage)?;
        if tracker.phase.is_terminal() || tracker.phase == StagePhase::ResultsReady {
            return Ok(());
        }
        if tracker.phase == StagePhase::New {
            // Reject before any mutation: recording the report would swallow
            // the genuine one arriving after launch.
            return Err(QuarryError::Internal(format!(
                "completion report for unstarted stage {stage}"
            )));
        }
        let idx = partition.index();
        if idx >= tracker.done.len() {
            return Err(QuarryError::Internal(format!(
                "unknown partition {partition} for stage {stage}"
            )));
        }
        if tracker.done[idx] {
            return Ok(());
        }
        tracker.done[idx] = true;
        tracker.last_progress_ms = now;

        if self.tracker(stage)?.all_done() {
            if self.tracker(stage)?.shuffle_spec.needs_statistics() {
                self.apply_phase(stage, StagePhase::PostReading)?;
                self.maybe_finalize_boundaries(stage)?;
            } else {
                self.apply_phase(stage, StagePhase::ResultsReady)?;
                self.on_results_ready(stage)?;
            }
        } else if self.config.pipeline() {
            let readable = self.tracker(stage)?.done_partitions().len() as u32;
            global_metrics().set_readable_partitions(
                &self.query_id.to_string(),
                stage.0,
                readable,
            );
        }
        Ok(())
    }

    /// Worker failure for one partition.
    ///
    /// With fault tolerance and durable storage, just that partition is
    /// rescheduled on a replacement worker and the replacement work order is
    /// returned; already-durable sibling output is reused. Otherwise, or once
    /// the retry budget is exhausted, the query fails.
    pub fn report_partition_failed(
        &mut self,
        stage: StageId,
        partition: PartitionId,
        cause: &str,
    ) -> Result<Option<WorkOrder>> {
        let tracker = self.tracker(stage)?;
        if tracker.phase.is_terminal() {
            return Ok(None);
        }
        let idx = partition.index();
        if idx >= tracker.done.len() {
            return Err(QuarryError::Internal(format!(
                "unknown partition {partition} for stage {stage}"
            )));
        }

        let retryable = self.config.fault_tolerant()
            && self.config.durable_storage()
            && tracker.retries[idx] < self.config.max_partition_retries();
        if !retryable {
            let failure = if self.config.fault_tolerant() {
                QuarryError::WorkerFailure(format!(
                    "retry budget exceeded on stage {stage} partition {partition}: {cause}"
                ))
            } else {
                QuarryError::WorkerFailure(format!(
                    "stage {stage} partition {partition}: {cause}"
                ))
            };
            self.fail_stage(stage, failure.to_string(), "worker_failure")?;
            return Ok(None);
        }

        let now = now_ms()?;
        let replacement = self.next_worker_id();
        let inputs = self.dag.inputs(stage).to_vec();
        let tracker = self.tracker_mut(stage)?;
        tracker.retries[idx] += 1;
        tracker.done[idx] = false;
        tracker.assigned[idx] = Some(replacement);
        tracker.last_progress_ms = now;
        let attempt = tracker.retries[idx];
        let spec = tracker.shuffle_spec.clone();
        // Retry re-enters Reading, including from the PostReading back-edge.
        self.apply_phase(stage, StagePhase::Reading)?;
        global_metrics().inc_partition_retries(&self.query_id.to_string(), stage.0);
        warn!(
            query_id = %self.query_id,
            stage_id = stage.0,
            partition_id = partition.0,
            attempt,
            cause,
            operator = "KernelRetry",
            "partition rescheduled on replacement worker"
        );
        Ok(Some(WorkOrder {
            query_id: self.query_id,
            stage_id: stage,
            partition_id: partition,
            worker_id: replacement,
            attempt,
            shuffle_spec: spec,
            input_stages: inputs,
            worker_context: self.config.worker_context().clone(),
        }))
    }

    /// The stage's output shuffle spec, once safe for consumers.
    pub fn get_finalized_shuffle_spec(&self, stage: StageId) -> Result<&ShuffleSpec> {
        let tracker = self.tracker(stage)?;
        if !tracker.spec_finalized() {
            return Err(QuarryError::NotReady(format!(
                "shuffle spec for stage {stage} awaits partition statistics"
            )));
        }
        Ok(&tracker.shuffle_spec)
    }

    /// Finalized global-sort boundaries for a target-size shuffle.
    pub fn partition_boundaries(&self, stage: StageId) -> Result<&PartitionBoundaries> {
        self.tracker(stage)?.boundaries.as_ref().ok_or_else(|| {
            QuarryError::NotReady(format!(
                "partition boundaries for stage {stage} are not finalized"
            ))
        })
    }

    /// Output partitions a downstream consumer may read right now.
    pub fn readable_partitions(&self, stage: StageId) -> Result<Vec<PartitionId>> {
        let tracker = self.tracker(stage)?;
        match tracker.phase {
            StagePhase::ResultsReady | StagePhase::Finished => {
                let count = tracker.output_partition_count().unwrap_or(0);
                Ok((0..count).map(PartitionId).collect())
            }
            StagePhase::Reading | StagePhase::PostReading
                if self.config.pipeline() && tracker.spec_finalized() =>
            {
                Ok(tracker.done_partitions())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Cancel the query: every non-terminal stage becomes `Canceled`, worker
    /// assignments are released, and in-flight sketches are discarded.
    pub fn cancel(&mut self) -> Result<()> {
        if self.state != QueryState::Running {
            return Ok(());
        }
        self.state = QueryState::Canceled;
        for idx in 0..self.trackers.len() {
            if !self.trackers[idx].phase.is_terminal() {
                self.apply_phase(StageId(idx as u32), StagePhase::Canceled)?;
                let tracker = &mut self.trackers[idx];
                tracker.release_assignments();
                tracker.discard_sketch();
            }
        }
        info!(
            query_id = %self.query_id,
            operator = "KernelCancel",
            "query canceled"
        );
        Ok(())
    }

    /// Public status snapshot for polling callers.
    pub fn status(&self) -> KernelStatus {
        let stages = self
            .trackers
            .iter()
            .enumerate()
            .map(|(idx, tracker)| {
                let stage_id = StageId(idx as u32);
                let readable = match tracker.phase {
                    StagePhase::ResultsReady | StagePhase::Finished => {
                        tracker.output_partition_count().unwrap_or(0)
                    }
                    _ if self.config.pipeline() && tracker.spec_finalized() => {
                        tracker.done_partitions().len() as u32
                    }
                    _ => 0,
                };
                StageSnapshot {
                    stage_id,
                    phase: tracker.phase,
                    retries: tracker.total_retries(),
                    readable_partitions: readable,
                    output_partitions: tracker.output_partition_count(),
                }
            })
            .collect();
        KernelStatus {
            query_id: self.query_id,
            state: self.state,
            failure_reason: self.failure_reason.clone(),
            stages,
        }
    }

    fn tracker(&self, stage: StageId) -> Result<&StageTracker> {
        self.trackers
            .get(stage.index())
            .ok_or_else(|| QuarryError::Internal(format!("unknown stage id {stage}")))
    }

    fn tracker_mut(&mut self, stage: StageId) -> Result<&mut StageTracker> {
        self.trackers
            .get_mut(stage.index())
            .ok_or_else(|| QuarryError::Internal(format!("unknown stage id {stage}")))
    }

    fn active_stage_count(&self) -> usize {
        self.trackers
            .iter()
            .filter(|t| matches!(t.phase, StagePhase::Reading | StagePhase::PostReading))
            .count()
    }

    fn inputs_satisfied(&self, stage: StageId) -> bool {
        self.dag.inputs(stage).iter().all(|&input| {
            self.trackers[input.index()].spec_finalized() && self.input_readable(input)
        })
    }

    fn input_readable(&self, input: StageId) -> bool {
        let tracker = &self.trackers[input.index()];
        match tracker.phase {
            StagePhase::ResultsReady | StagePhase::Finished => true,
            StagePhase::Reading | StagePhase::PostReading => {
                self.config.pipeline()
                    && tracker.spec_finalized()
                    && tracker.done.iter().any(|d| *d)
            }
            _ => false,
        }
    }

    fn next_worker_id(&mut self) -> WorkerId {
        let id = match self.config.worker_ids() {
            Some(ids) if !ids.is_empty() => ids[self.next_worker as usize % ids.len()],
            _ => WorkerId(self.next_worker),
        };
        self.next_worker = self.next_worker.wrapping_add(1);
        id
    }

    /// Finalize target-size boundaries once every partition has both
    /// completed and delivered its sketch. Recomputing from the same merged
    /// sketch yields identical boundaries; a second call is a no-op.
    fn maybe_finalize_boundaries(&mut self, stage: StageId) -> Result<()> {
        let tracker = self.tracker(stage)?;
        if tracker.boundaries.is_some()
            || !tracker.shuffle_spec.needs_statistics()
            || !tracker.all_done()
            || !tracker.all_sketches_reported()
        {
            return Ok(());
        }
        let (cluster_by, target_rows) = match &tracker.shuffle_spec {
            ShuffleSpec::GlobalSortTargetSize {
                cluster_by,
                target_rows,
                ..
            } => (cluster_by.clone(), *target_rows),
            _ => return Ok(()),
        };
        let boundaries = compute_partition_boundaries(&cluster_by, &tracker.sketch, target_rows)?;
        let partitions = boundaries.partition_count();
        self.tracker_mut(stage)?.boundaries = Some(boundaries);
        info!(
            query_id = %self.query_id,
            stage_id = stage.0,
            partitions,
            operator = "KernelFinalize",
            "partition boundaries finalized"
        );
        self.apply_phase(stage, StagePhase::ResultsReady)?;
        self.on_results_ready(stage)
    }

    fn on_results_ready(&mut self, stage: StageId) -> Result<()> {
        let query_id = self.query_id.to_string();
        let tracker = self.tracker_mut(stage)?;
        tracker.release_assignments();
        let readable = tracker.output_partition_count().unwrap_or(0);
        global_metrics().set_readable_partitions(&query_id, stage.0, readable);
        self.sweep_finished()
    }

    /// Move `ResultsReady` stages whose consumers have all consumed their
    /// output to `Finished`; succeed the query once every stage finished.
    fn sweep_finished(&mut self) -> Result<()> {
        loop {
            let mut finish = Vec::new();
            for idx in 0..self.trackers.len() {
                if self.trackers[idx].phase != StagePhase::ResultsReady {
                    continue;
                }
                let stage = StageId(idx as u32);
                let consumed = self.dag.outputs(stage).iter().all(|c| {
                    matches!(
                        self.trackers[c.index()].phase,
                        StagePhase::ResultsReady | StagePhase::Finished
                    )
                });
                if consumed {
                    finish.push(stage);
                }
            }
            if finish.is_empty() {
                break;
            }
            for stage in finish {
                self.apply_phase(stage, StagePhase::Finished)?;
            }
        }
        if self
            .trackers
            .iter()
            .all(|t| t.phase == StagePhase::Finished)
        {
            self.state = QueryState::Succeeded;
            info!(
                query_id = %self.query_id,
                operator = "KernelFinish",
                "query succeeded"
            );
        }
        Ok(())
    }

    fn fail_stage(&mut self, stage: StageId, reason: String, metric_reason: &str) -> Result<()> {
        error!(
            query_id = %self.query_id,
            stage_id = stage.0,
            reason = %reason,
            operator = "KernelFail",
            "stage failed"
        );
        self.apply_phase(stage, StagePhase::Failed)?;
        let tracker = self.tracker_mut(stage)?;
        tracker.failure = Some(reason.clone());
        tracker.release_assignments();
        self.state = QueryState::Failed;
        self.failure_reason = Some(reason);
        global_metrics().inc_queries_failed(&self.query_id.to_string(), metric_reason);
        // Sibling stages cannot complete a failed query; release them.
        for idx in 0..self.trackers.len() {
            if !self.trackers[idx].phase.is_terminal() {
                self.apply_phase(StageId(idx as u32), StagePhase::Canceled)?;
                self.trackers[idx].release_assignments();
            }
        }
        Ok(())
    }

    fn apply_phase(&mut self, stage: StageId, next: StagePhase) -> Result<()> {
        let current = self.tracker(stage)?.phase;
        if !current.can_transition_to(next) {
            return Err(QuarryError::Internal(format!(
                "illegal phase transition {} -> {} for stage {stage}",
                current.as_str(),
                next.as_str()
            )));
        }
        self.tracker_mut(stage)?.phase = next;
        global_metrics().inc_stage_phase_transition(
            &self.query_id.to_string(),
            stage.0,
            next.as_str(),
        );
        debug!(
            query_id = %self.query_id,
            stage_id = stage.0,
            phase = next.as_str(),
            operator = "KernelPhase",
            "stage phase applied"
        );
        Ok(())
    }
}

fn now_ms() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| QuarryError::Internal(format!("system clock before epoch: {e}")))?
        .as_millis() as u64)
}
