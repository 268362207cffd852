//! Stage DAG: the immutable graph of stages the kernel orchestrates.
//!
//! Stage ids are dense integers assigned at build time, so per-stage state
//! lives in plain vectors and edges are adjacency lists of ids, keeping the
//! whole graph trivially serializable for debugging snapshots.

use quarry_common::{QuarryError, Result, StageId};
use quarry_shuffle::{ClusterBy, ShuffleSpecFactory};
use serde::{Deserialize, Serialize};

/// One node of the stage DAG. Immutable once the DAG is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: StageId,
    /// Clustering key for this stage's output; may be empty.
    pub cluster_by: ClusterBy,
    /// True when the stage performs an associative/commutative combine,
    /// permitting coarser partitioning.
    pub aggregate: bool,
    /// Output shuffle selection policy for this stage.
    pub shuffle: ShuffleSpecFactory,
    /// Parallel worker slots reading this stage's input.
    pub max_worker_count: u32,
}

impl StageDefinition {
    pub fn new(
        id: StageId,
        cluster_by: ClusterBy,
        aggregate: bool,
        shuffle: ShuffleSpecFactory,
        max_worker_count: u32,
    ) -> Self {
        Self {
            id,
            cluster_by,
            aggregate,
            shuffle,
            max_worker_count,
        }
    }
}

/// Validated, acyclic stage graph with dense ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDag {
    stages: Vec<StageDefinition>,
    /// Producers each stage depends on, indexed by stage id.
    inputs: Vec<Vec<StageId>>,
    /// Consumers of each stage's output, indexed by stage id.
    outputs: Vec<Vec<StageId>>,
    /// Dependency order; producers precede consumers, ties by id.
    topological_order: Vec<StageId>,
}

impl StageDag {
    pub fn builder() -> StageDagBuilder {
        StageDagBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, id: StageId) -> Result<&StageDefinition> {
        self.stages
            .get(id.index())
            .ok_or_else(|| QuarryError::Internal(format!("unknown stage id {id}")))
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn inputs(&self, id: StageId) -> &[StageId] {
        &self.inputs[id.index()]
    }

    pub fn outputs(&self, id: StageId) -> &[StageId] {
        &self.outputs[id.index()]
    }

    pub fn topological_order(&self) -> &[StageId] {
        &self.topological_order
    }

    /// JSON snapshot of the graph for debugging.
    pub fn snapshot_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| QuarryError::Internal(format!("encode dag snapshot failed: {e}")))
    }
}

/// Builder that accumulates stages and edges, validating on `build`.
#[derive(Debug, Default)]
pub struct StageDagBuilder {
    stages: Vec<StageDefinition>,
    edges: Vec<(StageId, StageId)>,
}

impl StageDagBuilder {
    pub fn stage(mut self, definition: StageDefinition) -> Self {
        self.stages.push(definition);
        self
    }

    /// Declare that `consumer` depends on `producer`'s output.
    pub fn edge(mut self, producer: StageId, consumer: StageId) -> Self {
        self.edges.push((producer, consumer));
        self
    }

    /// Validate ids, edges, and acyclicity; produce the immutable DAG.
    pub fn build(self) -> Result<StageDag> {
        let n = self.stages.len();
        if n == 0 {
            return Err(QuarryError::InvalidDag("dag has no stages".to_string()));
        }

        let mut seen = vec![false; n];
        for def in &self.stages {
            let idx = def.id.index();
            if idx >= n {
                return Err(QuarryError::InvalidDag(format!(
                    "stage id {} is not dense for {} stages",
                    def.id, n
                )));
            }
            if seen[idx] {
                return Err(QuarryError::InvalidDag(format!(
                    "duplicate stage id {}",
                    def.id
                )));
            }
            seen[idx] = true;
        }

        let mut stages = self.stages;
        stages.sort_by_key(|s| s.id);

        let mut inputs: Vec<Vec<StageId>> = vec![Vec::new(); n];
        let mut outputs: Vec<Vec<StageId>> = vec![Vec::new(); n];
        for (producer, consumer) in &self.edges {
            if producer.index() >= n || consumer.index() >= n {
                return Err(QuarryError::InvalidDag(format!(
                    "edge {producer} -> {consumer} references an unknown stage"
                )));
            }
            if producer == consumer {
                return Err(QuarryError::InvalidDag(format!(
                    "stage {producer} cannot depend on itself"
                )));
            }
            if !inputs[consumer.index()].contains(producer) {
                inputs[consumer.index()].push(*producer);
                outputs[producer.index()].push(*consumer);
            }
        }

        let topological_order = toposort(n, &inputs, &outputs)?;

        Ok(StageDag {
            stages,
            inputs,
            outputs,
            topological_order,
        })
    }
}

/// Kahn's algorithm; deterministic via smallest-id-first tie-breaking.
fn toposort(n: usize, inputs: &[Vec<StageId>], outputs: &[Vec<StageId>]) -> Result<Vec<StageId>> {
    let mut indegree: Vec<usize> = inputs.iter().map(Vec::len).collect();
    let mut ready: Vec<StageId> = (0..n as u32)
        .map(StageId)
        .filter(|id| indegree[id.index()] == 0)
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(pos) = ready
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(pos, _)| pos)
    {
        let id = ready.swap_remove(pos);
        order.push(id);
        for consumer in &outputs[id.index()] {
            indegree[consumer.index()] -= 1;
            if indegree[consumer.index()] == 0 {
                ready.push(*consumer);
            }
        }
    }

    if order.len() != n {
        return Err(QuarryError::InvalidDag(
            "dag contains a cycle".to_string(),
        ));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_shuffle::ShuffleSpecFactory;

    fn stage(id: u32) -> StageDefinition {
        StageDefinition::new(
            StageId(id),
            ClusterBy::empty(),
            false,
            ShuffleSpecFactory::single_partition(),
            1,
        )
    }

    #[test]
    fn builds_linear_dag_in_dependency_order() {
        let dag = StageDag::builder()
            .stage(stage(0))
            .stage(stage(1))
            .stage(stage(2))
            .edge(StageId(0), StageId(1))
            .edge(StageId(1), StageId(2))
            .build()
            .expect("dag");
        assert_eq!(dag.len(), 3);
        assert_eq!(dag.topological_order(), &[StageId(0), StageId(1), StageId(2)]);
        assert_eq!(dag.inputs(StageId(2)), &[StageId(1)]);
        assert_eq!(dag.outputs(StageId(0)), &[StageId(1)]);
    }

    #[test]
    fn diamond_dag_orders_producers_first() {
        let dag = StageDag::builder()
            .stage(stage(0))
            .stage(stage(1))
            .stage(stage(2))
            .stage(stage(3))
            .edge(StageId(0), StageId(1))
            .edge(StageId(0), StageId(2))
            .edge(StageId(1), StageId(3))
            .edge(StageId(2), StageId(3))
            .build()
            .expect("dag");
        assert_eq!(
            dag.topological_order(),
            &[StageId(0), StageId(1), StageId(2), StageId(3)]
        );
    }

    #[test]
    fn rejects_cycles() {
        let err = StageDag::builder()
            .stage(stage(0))
            .stage(stage(1))
            .edge(StageId(0), StageId(1))
            .edge(StageId(1), StageId(0))
            .build()
            .expect_err("cycle");
        assert!(matches!(err, QuarryError::InvalidDag(_)));
    }

    #[test]
    fn rejects_dangling_edges() {
        let err = StageDag::builder()
            .stage(stage(0))
            .edge(StageId(0), StageId(5))
            .build()
            .expect_err("dangling");
        assert!(matches!(err, QuarryError::InvalidDag(_)));
    }

    #[test]
    fn rejects_duplicate_and_non_dense_ids() {
        let err = StageDag::builder()
            .stage(stage(0))
            .stage(stage(0))
            .build()
            .expect_err("duplicate");
        assert!(matches!(err, QuarryError::InvalidDag(_)));

        let err = StageDag::builder()
            .stage(stage(0))
            .stage(stage(7))
            .build()
            .expect_err("non-dense");
        assert!(matches!(err, QuarryError::InvalidDag(_)));
    }

    #[test]
    fn rejects_self_edges_and_empty_dags() {
        let err = StageDag::builder()
            .stage(stage(0))
            .edge(StageId(0), StageId(0))
            .build()
            .expect_err("self edge");
        assert!(matches!(err, QuarryError::InvalidDag(_)));

        let err = StageDag::builder().build().expect_err("empty");
        assert!(matches!(err, QuarryError::InvalidDag(_)));
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let dag = StageDag::builder()
            .stage(stage(0))
            .stage(stage(1))
            .edge(StageId(0), StageId(1))
            .build()
            .expect("dag");
        let json = dag.snapshot_json().expect("json");
        assert!(json.contains("topological_order"));
        let back: StageDag = serde_json::from_str(&json).expect("decode");
        assert_eq!(back.len(), dag.len());
    }
}
