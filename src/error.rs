//! Control-plane error types.
//!
//! The packet hot path never returns these: capacity, topology and hotplug-race conditions are
//! recovered locally and surface only through counters. Errors here come from configuration and
//! from lifecycle/control calls that name a worker the scheduler does not have.

use crate::cluster::WorkerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("invalid value `{value}` for parameter `{name}`")]
    InvalidValue { name: String, value: String },
    #[error("mask {mask} names workers outside the topology ({workers} workers)")]
    MaskOutOfRange { mask: String, workers: usize },
    #[error("topology must contain between 1 and {max} workers, got {got}")]
    WorkerCount { got: usize, max: usize },
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
    #[error("flow {0:#x} is not registered")]
    UnknownFlow(u64),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
