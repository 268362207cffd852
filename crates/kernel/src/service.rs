//! Channel-driven wrapper enforcing the kernel's single-writer discipline.
//!
//! The kernel itself is plain mutable state with no interior locking. This
//! module owns one kernel inside one tokio task; every caller interacts
//! through a cloneable [`KernelHandle`] that sends commands over an mpsc
//! channel and awaits the reply on a oneshot. Commands are applied strictly
//! in arrival order, so observers can never see a torn state.

use quarry_common::{PartitionId, QuarryError, QueryId, Result, StageId};
use quarry_shuffle::{PartitionBoundaries, PartitionStatsSketch, ShuffleSpec};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::KernelConfig;
use crate::dag::StageDag;
use crate::kernel::{ControllerQueryKernel, KernelStatus, WorkerPhase};
use crate::work_order::WorkOrder;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

enum KernelCommand {
    StartRunnable {
        reply: oneshot::Sender<Result<Vec<WorkOrder>>>,
    },
    ReportStatistics {
        stage: StageId,
        partition: PartitionId,
        sketch: Box<PartitionStatsSketch>,
        reply: oneshot::Sender<Result<()>>,
    },
    ReportPhase {
        stage: StageId,
        partition: PartitionId,
        phase: WorkerPhase,
        reply: oneshot::Sender<Result<()>>,
    },
    ReportFailure {
        stage: StageId,
        partition: PartitionId,
        cause: String,
        reply: oneshot::Sender<Result<Option<WorkOrder>>>,
    },
    FinalizedSpec {
        stage: StageId,
        reply: oneshot::Sender<Result<ShuffleSpec>>,
    },
    Boundaries {
        stage: StageId,
        reply: oneshot::Sender<Result<PartitionBoundaries>>,
    },
    ReadablePartitions {
        stage: StageId,
        reply: oneshot::Sender<Result<Vec<PartitionId>>>,
    },
    Status {
        reply: oneshot::Sender<KernelStatus>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Owns a [`ControllerQueryKernel`] on a dedicated task and serializes all
/// access to it.
pub struct KernelService;

impl KernelService {
    /// Build the kernel and spawn its command loop. Construction errors are
    /// returned here, before any task exists.
    pub fn spawn(query_id: QueryId, dag: StageDag, config: KernelConfig) -> Result<KernelHandle> {
        let kernel = ControllerQueryKernel::new(query_id, dag, config)?;
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(run_loop(kernel, rx));
        Ok(KernelHandle { tx })
    }
}

async fn run_loop(
    mut kernel: ControllerQueryKernel,
    mut rx: mpsc::Receiver<KernelCommand>,
) {
    let query_id = kernel.query_id();
    info!(
        query_id = %query_id,
        operator = "KernelService",
        "kernel service started"
    );
    while let Some(command) = rx.recv().await {
        match command {
            KernelCommand::StartRunnable { reply } => {
                let result = start_runnable(&mut kernel);
                let _ = reply.send(result);
            }
            KernelCommand::ReportStatistics {
                stage,
                partition,
                sketch,
                reply,
            } => {
                let _ = reply.send(kernel.report_partition_statistics(stage, partition, &sketch));
            }
            KernelCommand::ReportPhase {
                stage,
                partition,
                phase,
                reply,
            } => {
                let _ = reply.send(kernel.report_partition_phase(stage, partition, phase));
            }
            KernelCommand::ReportFailure {
                stage,
                partition,
                cause,
                reply,
            } => {
                let _ = reply.send(kernel.report_partition_failed(stage, partition, &cause));
            }
            KernelCommand::FinalizedSpec { stage, reply } => {
                let _ = reply.send(kernel.get_finalized_shuffle_spec(stage).cloned());
            }
            KernelCommand::Boundaries { stage, reply } => {
                let _ = reply.send(kernel.partition_boundaries(stage).cloned());
            }
            KernelCommand::ReadablePartitions { stage, reply } => {
                let _ = reply.send(kernel.readable_partitions(stage));
            }
            KernelCommand::Status { reply } => {
                let _ = reply.send(kernel.status());
            }
            KernelCommand::Cancel { reply } => {
                let _ = reply.send(kernel.cancel());
            }
        }
    }
    debug!(
        query_id = %query_id,
        operator = "KernelService",
        "kernel service stopped"
    );
}

/// Launch every currently-runnable stage and collect their work orders.
fn start_runnable(kernel: &mut ControllerQueryKernel) -> Result<Vec<WorkOrder>> {
    let mut orders = Vec::new();
    for stage in kernel.runnable_stages() {
        orders.extend(kernel.start_stage(stage)?);
    }
    Ok(orders)
}

/// Cloneable async client for one kernel's command loop.
#[derive(Clone)]
pub struct KernelHandle {
    tx: mpsc::Sender<KernelCommand>,
}

impl KernelHandle {
    /// Launch all runnable stages; returns the work orders to dispatch.
    pub async fn start_runnable_stages(&self) -> Result<Vec<WorkOrder>> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::StartRunnable { reply }).await?;
        recv(rx).await?
    }

    pub async fn report_partition_statistics(
        &self,
        stage: StageId,
        partition: PartitionId,
        sketch: PartitionStatsSketch,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::ReportStatistics {
            stage,
            partition,
            sketch: Box::new(sketch),
            reply,
        })
        .await?;
        recv(rx).await?
    }

    pub async fn report_partition_phase(
        &self,
        stage: StageId,
        partition: PartitionId,
        phase: WorkerPhase,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::ReportPhase {
            stage,
            partition,
            phase,
            reply,
        })
        .await?;
        recv(rx).await?
    }

    pub async fn report_partition_failed(
        &self,
        stage: StageId,
        partition: PartitionId,
        cause: impl Into<String>,
    ) -> Result<Option<WorkOrder>> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::ReportFailure {
            stage,
            partition,
            cause: cause.into(),
            reply,
        })
        .await?;
        recv(rx).await?
    }

    pub async fn get_finalized_shuffle_spec(&self, stage: StageId) -> Result<ShuffleSpec> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::FinalizedSpec { stage, reply }).await?;
        recv(rx).await?
    }

    pub async fn partition_boundaries(&self, stage: StageId) -> Result<PartitionBoundaries> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::Boundaries { stage, reply }).await?;
        recv(rx).await?
    }

    pub async fn readable_partitions(&self, stage: StageId) -> Result<Vec<PartitionId>> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::ReadablePartitions { stage, reply })
            .await?;
        recv(rx).await?
    }

    pub async fn status(&self) -> Result<KernelStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::Status { reply }).await?;
        recv(rx).await
    }

    pub async fn cancel(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(KernelCommand::Cancel { reply }).await?;
        recv(rx).await?
    }

    async fn send(&self, command: KernelCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| QuarryError::Internal("kernel service stopped".to_string()))
    }
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.await
        .map_err(|_| QuarryError::Internal("kernel service dropped reply".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::StageDefinition;
    use crate::kernel::QueryState;
    use crate::tracker::StagePhase;
    use quarry_shuffle::{ClusterBy, ShuffleSpecFactory};

    fn mix_stage(id: u32) -> StageDefinition {
        StageDefinition::new(
            StageId(id),
            ClusterBy::empty(),
            false,
            ShuffleSpecFactory::single_partition(),
            1,
        )
    }

    fn linear_dag() -> StageDag {
        StageDag::builder()
            .stage(mix_stage(0))
            .stage(mix_stage(1))
            .edge(StageId(0), StageId(1))
            .build()
            .expect("dag")
    }

    #[tokio::test]
    async fn drives_a_two_stage_query_to_success() {
        let config = KernelConfig::builder().build().expect("config");
        let handle = KernelService::spawn(QueryId(21), linear_dag(), config).expect("spawn");

        let orders = handle.start_runnable_stages().await.expect("start root");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].stage_id, StageId(0));
        assert_eq!(
            handle
                .get_finalized_shuffle_spec(StageId(0))
                .await
                .expect("spec"),
            ShuffleSpec::Mix
        );

        handle
            .report_partition_phase(StageId(0), PartitionId(0), WorkerPhase::OutputComplete)
            .await
            .expect("root done");
        assert_eq!(
            handle
                .readable_partitions(StageId(0))
                .await
                .expect("readable"),
            vec![PartitionId(0)]
        );

        let orders = handle.start_runnable_stages().await.expect("start consumer");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].stage_id, StageId(1));
        handle
            .report_partition_phase(StageId(1), PartitionId(0), WorkerPhase::OutputComplete)
            .await
            .expect("consumer done");

        let status = handle.status().await.expect("status");
        assert_eq!(status.state, QueryState::Succeeded);
        assert!(status
            .stages
            .iter()
            .all(|s| s.phase == StagePhase::Finished));
    }

    #[tokio::test]
    async fn cancel_is_observable_through_the_handle() {
        let config = KernelConfig::builder().build().expect("config");
        let handle = KernelService::spawn(QueryId(22), linear_dag(), config).expect("spawn");
        handle.start_runnable_stages().await.expect("start");
        handle.cancel().await.expect("cancel");

        let status = handle.status().await.expect("status");
        assert_eq!(status.state, QueryState::Canceled);
        assert!(handle
            .start_runnable_stages()
            .await
            .expect("no-op")
            .is_empty());
    }

    #[tokio::test]
    async fn handle_clones_share_one_kernel() {
        let config = KernelConfig::builder().build().expect("config");
        let handle = KernelService::spawn(QueryId(23), linear_dag(), config).expect("spawn");
        let observer = handle.clone();

        handle.start_runnable_stages().await.expect("start");
        let status = observer.status().await.expect("status");
        assert_eq!(status.stages[0].phase, StagePhase::Reading);
    }
}
