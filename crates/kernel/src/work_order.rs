//! Work orders: the serializable unit the kernel hands to the worker
//! dispatch transport.

use std::collections::BTreeMap;

use quarry_common::{PartitionId, QueryId, StageId, WorkerId};
use quarry_shuffle::ShuffleSpec;
use serde::{Deserialize, Serialize};

/// One partition's worth of work for one worker.
///
/// Carries the stage's output shuffle spec (finalized, or partial for
/// statistics-dependent shuffles still being read) and the opaque worker
/// context from the kernel config, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub query_id: QueryId,
    pub stage_id: StageId,
    pub partition_id: PartitionId,
    /// Worker assigned to execute this order.
    pub worker_id: WorkerId,
    /// Attempt number; 0 for the first launch, incremented per retry.
    pub attempt: u32,
    /// Output shuffle spec for the stage producing this partition.
    pub shuffle_spec: ShuffleSpec,
    /// Producer stages whose output this partition reads.
    pub input_stages: Vec<StageId>,
    /// Opaque context map from the kernel config.
    pub worker_context: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_orders_round_trip_through_serde_json() {
        let mut ctx = BTreeMap::new();
        ctx.insert("tier".to_string(), "cold".to_string());
        let order = WorkOrder {
            query_id: QueryId(9),
            stage_id: StageId(1),
            partition_id: PartitionId(2),
            worker_id: WorkerId(3),
            attempt: 1,
            shuffle_spec: ShuffleSpec::Mix,
            input_stages: vec![StageId(0)],
            worker_context: ctx,
        };
        let json = serde_json::to_string(&order).expect("encode");
        let back: WorkOrder = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, order);
    }
}
