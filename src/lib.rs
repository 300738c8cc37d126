//! MCPS: a receive-side multi-core packet scheduler.
//!
//! Packets arrive with a precomputed flow hash and a cluster hint. The [`Scheduler`] keeps each
//! flow on one worker, balances flows across little/mid/big worker clusters, migrates flows between
//! workers without reordering them, and survives workers going offline and coming back.

pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod runtime;
pub mod scheduler;
pub mod threading;

// Re-export for easier testing
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use cluster::{Cluster, ClusterTable, Topology, WorkerId, WorkerMask};
pub use config::SchedulerConfig;
pub use error::{ConfigError, SchedulerError};
pub use packet::Packet;
pub use scheduler::{EnqueueOutcome, RoutingDecision, Scheduler, WorkerStats};
