//! Controller-side query kernel for Quarry's multi-stage execution engine.
//!
//! Architecture role:
//! - validates execution-mode configuration ([`config`])
//! - models the immutable stage DAG ([`dag`])
//! - drives per-stage lifecycle, shuffle finalization, and failure recovery
//!   through a single-writer state machine ([`kernel`], [`tracker`])
//! - serializes concurrent access behind a channel-driven service
//!   ([`service`])
//!
//! The kernel plans and reacts; it never moves data. Workers execute the
//! [`work_order::WorkOrder`]s it emits and feed observations back through
//! the `report_*` operations.

pub mod config;
pub mod dag;
pub mod kernel;
pub mod service;
pub mod tracker;
pub mod work_order;

pub use config::{Destination, KernelConfig, KernelConfigBuilder};
pub use dag::{StageDag, StageDagBuilder, StageDefinition};
pub use kernel::{ControllerQueryKernel, KernelStatus, QueryState, StageSnapshot, WorkerPhase};
pub use service::{KernelHandle, KernelService};
pub use tracker::StagePhase;
pub use work_order::WorkOrder;
