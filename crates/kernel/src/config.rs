//! Kernel configuration: an immutable, validated bundle of execution-mode
//! flags consumed once at kernel construction.

use std::collections::BTreeMap;

use quarry_common::{QuarryError, Result, WorkerId};
use serde::{Deserialize, Serialize};

/// Where the final stage's output goes. Descriptor only; the kernel never
/// touches the destination itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// Results are returned inline through the controller's task report.
    TaskReport,
    /// Results are written to the durable intermediate store.
    DurableStorage,
    /// Results are inserted into a named table.
    Table { name: String },
}

/// Validated configuration for the controller query kernel.
///
/// Constructed only through [`KernelConfig::builder`]; the mode-consistency
/// invariants are checked once there and never re-checked at use time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    max_retained_partition_sketch_bytes: usize,
    max_concurrent_stages: usize,
    pipeline: bool,
    durable_storage: bool,
    fault_tolerant: bool,
    max_partition_retries: u32,
    destination: Destination,
    controller_id: Option<String>,
    worker_ids: Option<Vec<WorkerId>>,
    worker_context: BTreeMap<String, String>,
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    /// Byte budget for each stage's merged partition-statistics sketch.
    pub fn max_retained_partition_sketch_bytes(&self) -> usize {
        self.max_retained_partition_sketch_bytes
    }

    /// Maximum number of stages that may run concurrently.
    pub fn max_concurrent_stages(&self) -> usize {
        self.max_concurrent_stages
    }

    /// Whether consumers may start against still-running producers.
    pub fn pipeline(&self) -> bool {
        self.pipeline
    }

    /// Whether stage output is persisted to the durable intermediate store.
    pub fn durable_storage(&self) -> bool {
        self.durable_storage
    }

    /// Whether individual partition failures are retried instead of failing
    /// the whole query.
    pub fn fault_tolerant(&self) -> bool {
        self.fault_tolerant
    }

    /// Times one partition may be retried before the query is failed.
    pub fn max_partition_retries(&self) -> u32 {
        self.max_partition_retries
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn controller_id(&self) -> Option<&str> {
        self.controller_id.as_deref()
    }

    /// Fixed worker pool, when one was configured. The kernel synthesizes
    /// worker ids otherwise.
    pub fn worker_ids(&self) -> Option<&[WorkerId]> {
        self.worker_ids.as_deref()
    }

    /// Opaque context map forwarded verbatim in every work order.
    pub fn worker_context(&self) -> &BTreeMap<String, String> {
        &self.worker_context
    }
}

/// Fallible builder for [`KernelConfig`]; all invariant checks happen in
/// [`KernelConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct KernelConfigBuilder {
    max_retained_partition_sketch_bytes: usize,
    max_concurrent_stages: usize,
    pipeline: bool,
    durable_storage: bool,
    fault_tolerant: bool,
    max_partition_retries: u32,
    destination: Destination,
    controller_id: Option<String>,
    worker_ids: Option<Vec<WorkerId>>,
    worker_context: BTreeMap<String, String>,
}

impl Default for KernelConfigBuilder {
    fn default() -> Self {
        Self {
            max_retained_partition_sketch_bytes: 32 * 1024 * 1024,
            max_concurrent_stages: 1,
            pipeline: false,
            durable_storage: false,
            fault_tolerant: false,
            max_partition_retries: 3,
            destination: Destination::TaskReport,
            controller_id: None,
            worker_ids: None,
            worker_context: BTreeMap::new(),
        }
    }
}

impl KernelConfigBuilder {
    pub fn max_retained_partition_sketch_bytes(mut self, bytes: usize) -> Self {
        self.max_retained_partition_sketch_bytes = bytes;
        self
    }

    pub fn max_concurrent_stages(mut self, stages: usize) -> Self {
        self.max_concurrent_stages = stages;
        self
    }

    pub fn pipeline(mut self, pipeline: bool) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn durable_storage(mut self, durable_storage: bool) -> Self {
        self.durable_storage = durable_storage;
        self
    }

    pub fn fault_tolerant(mut self, fault_tolerant: bool) -> Self {
        self.fault_tolerant = fault_tolerant;
        self
    }

    pub fn max_partition_retries(mut self, retries: u32) -> Self {
        self.max_partition_retries = retries;
        self
    }

    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn controller_id(mut self, id: impl Into<String>) -> Self {
        self.controller_id = Some(id.into());
        self
    }

    pub fn worker_ids(mut self, ids: Vec<WorkerId>) -> Self {
        self.worker_ids = Some(ids);
        self
    }

    pub fn worker_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.worker_context = context;
        self
    }

    /// Validate mode consistency and produce the immutable config.
    pub fn build(self) -> Result<KernelConfig> {
        if self.max_retained_partition_sketch_bytes == 0 {
            return Err(QuarryError::InvalidConfig(
                "max_retained_partition_sketch_bytes must be positive".to_string(),
            ));
        }
        if self.max_concurrent_stages == 0 {
            return Err(QuarryError::InvalidConfig(
                "max_concurrent_stages must be positive".to_string(),
            ));
        }
        if self.pipeline && self.max_concurrent_stages < 2 {
            return Err(QuarryError::InvalidConfig(
                "max_concurrent_stages must be >= 2 when pipelining".to_string(),
            ));
        }
        if self.pipeline && self.fault_tolerant {
            return Err(QuarryError::InvalidConfig(
                "cannot pipeline with fault tolerance".to_string(),
            ));
        }
        if self.pipeline && self.durable_storage {
            return Err(QuarryError::InvalidConfig(
                "cannot pipeline with durable storage".to_string(),
            ));
        }
        if self.fault_tolerant && !self.durable_storage {
            return Err(QuarryError::InvalidConfig(
                "cannot have fault tolerance without durable storage".to_string(),
            ));
        }

        Ok(KernelConfig {
            max_retained_partition_sketch_bytes: self.max_retained_partition_sketch_bytes,
            max_concurrent_stages: self.max_concurrent_stages,
            pipeline: self.pipeline,
            durable_storage: self.durable_storage,
            fault_tolerant: self.fault_tolerant,
            max_partition_retries: self.max_partition_retries,
            destination: self.destination,
            controller_id: self.controller_id,
            worker_ids: self.worker_ids,
            worker_context: self.worker_context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_invalid(builder: KernelConfigBuilder) {
        match builder.build() {
            Err(QuarryError::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn default_builder_is_valid() {
        let config = KernelConfig::builder().build().expect("valid");
        assert_eq!(config.max_concurrent_stages(), 1);
        assert!(!config.pipeline());
        assert_eq!(config.destination(), &Destination::TaskReport);
    }

    #[test]
    fn rejects_zero_sketch_budget() {
        expect_invalid(KernelConfig::builder().max_retained_partition_sketch_bytes(0));
    }

    #[test]
    fn rejects_zero_concurrent_stages() {
        expect_invalid(KernelConfig::builder().max_concurrent_stages(0));
    }

    #[test]
    fn rejects_pipelining_without_stage_overlap() {
        expect_invalid(
            KernelConfig::builder()
                .pipeline(true)
                .max_concurrent_stages(1),
        );
    }

    #[test]
    fn rejects_pipelining_with_fault_tolerance() {
        expect_invalid(
            KernelConfig::builder()
                .pipeline(true)
                .max_concurrent_stages(2)
                .fault_tolerant(true)
                .durable_storage(true),
        );
    }

    #[test]
    fn rejects_pipelining_with_durable_storage() {
        expect_invalid(
            KernelConfig::builder()
                .pipeline(true)
                .max_concurrent_stages(2)
                .durable_storage(true),
        );
    }

    #[test]
    fn rejects_fault_tolerance_without_durable_storage() {
        expect_invalid(KernelConfig::builder().fault_tolerant(true));
    }

    #[test]
    fn accepts_fault_tolerance_with_durable_storage() {
        let config = KernelConfig::builder()
            .fault_tolerant(true)
            .durable_storage(true)
            .build()
            .expect("valid");
        assert!(config.fault_tolerant());
        assert!(config.durable_storage());
        assert!(!config.pipeline());
    }

    #[test]
    fn accepts_pipelining_with_overlap_and_no_durability() {
        let config = KernelConfig::builder()
            .pipeline(true)
            .max_concurrent_stages(2)
            .build()
            .expect("valid");
        assert!(config.pipeline());
    }

    #[test]
    fn carries_worker_context_and_pool() {
        let mut ctx = BTreeMap::new();
        ctx.insert("tier".to_string(), "hot".to_string());
        let config = KernelConfig::builder()
            .worker_context(ctx.clone())
            .worker_ids(vec![quarry_common::WorkerId(7)])
            .controller_id("ctl-1")
            .build()
            .expect("valid");
        assert_eq!(config.worker_context(), &ctx);
        assert_eq!(config.worker_ids(), Some(&[quarry_common::WorkerId(7)][..]));
        assert_eq!(config.controller_id(), Some("ctl-1"));
    }
}
