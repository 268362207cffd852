//! Shuffle-specification subsystem for the Quarry controller kernel.
//!
//! Architecture role:
//! - models clustering keys and their ordering ([`key`])
//! - defines the closed [`ShuffleSpec`] family and its pure factories
//!   ([`spec`], [`factory`])
//! - accumulates bounded-memory partition statistics and turns them into
//!   global-sort partition boundaries ([`sketch`], [`boundaries`])
//!
//! Everything here is pure data and decision logic; the actual worker-to-
//! worker data exchange lives outside the controller.

pub mod boundaries;
pub mod factory;
pub mod key;
pub mod sketch;
pub mod spec;

pub use boundaries::{compute_partition_boundaries, PartitionBoundaries};
pub use factory::ShuffleSpecFactory;
pub use key::{ClusterBy, KeyColumn, KeyRow, KeyValue, SortDirection};
pub use sketch::PartitionStatsSketch;
pub use spec::{ShuffleKind, ShuffleSpec};
