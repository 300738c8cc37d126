//! Scheduler configuration.
//!
//! [`SchedulerConfig`] is the startup description (topology, affinity layers, queue and flow
//! limits, balancing thresholds, runtime knobs); it can be loaded from JSON. The subset that may
//! change while the scheduler runs is mirrored into [`Tunables`], a bag of atomics read on the hot
//! path and written through the named-parameter surface ([`Parameter`]).

use crate::cluster::{Cluster, ClusterTable, WorkerMask, MAX_WORKERS};
use crate::error::ConfigError;
use crate::scheduler::affinity::AffinityLayer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Worker layout: the cluster of each worker, indexed by worker id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub clusters: Vec<Cluster>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            clusters: vec![
                Cluster::Little,
                Cluster::Little,
                Cluster::Little,
                Cluster::Little,
                Cluster::Big,
                Cluster::Big,
            ],
        }
    }
}

/// Initial membership masks of the three affinity layers.
///
/// A missing static layer defaults to the physical cluster membership; the dynamic and new-flow
/// layers default to empty (inactive).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AffinityLayersConfig {
    #[serde(default)]
    pub static_masks: Option<ClusterTable<WorkerMask>>,
    #[serde(default)]
    pub dynamic_masks: Option<ClusterTable<WorkerMask>>,
    #[serde(default)]
    pub newflow_masks: Option<ClusterTable<WorkerMask>>,
}

/// Per-worker receive queue knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Inbound queue ceiling; packets beyond it are dropped and counted.
    pub capacity: usize,
    /// Packets a poller may deliver per invocation.
    pub poll_quota: usize,
    /// Coalesce consecutive same-flow packets before delivery.
    pub gro_enabled: bool,
    /// Largest coalesced batch.
    pub gro_max_segments: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            poll_quota: 64,
            gro_enabled: false,
            gro_max_segments: 8,
        }
    }
}

/// Flow registry sizing and lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Upper bound on live flow records; inserts past it fail and the packet is dropped.
    pub max_flows: usize,
    /// Number of hash buckets (rounded up to a power of two).
    pub buckets: usize,
    pub idle_timeout_ms: u64,
    /// Minimum spacing between two throttled sweeps.
    pub sweep_interval_ms: u64,
    /// Minimum spacing between two rate samples of one flow.
    pub rate_sample_interval_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_flows: 65_536,
            buckets: 1024,
            idle_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
            rate_sample_interval_ms: 500,
        }
    }
}

/// Heavy/light flow thresholds used by the rebalancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Rate at which a flow starts being monitored.
    pub monitor_threshold_pps: u64,
    /// Monitored flows above this rate are moved to the big cluster.
    pub heavy_flow_pps: u64,
    /// Monitored flows on big workers below this rate are moved back.
    pub light_flow_pps: u64,
    /// Pending migrations processed per migration-poller pass.
    pub migration_budget: usize,
    /// Migrations the rebalancer may request per pass.
    pub rebalance_budget: usize,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            monitor_threshold_pps: 1_000,
            heavy_flow_pps: 5_000,
            light_flow_pps: 500,
            migration_budget: 32,
            rebalance_budget: 64,
        }
    }
}

/// Threaded driver knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pin worker `n` to core `core_offset + n`.
    pub pin_threads: bool,
    pub core_offset: usize,
    /// Cadence of the sweep/rebalance housekeeping thread.
    pub housekeeping_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pin_threads: false,
            core_offset: 0,
            housekeeping_interval_ms: 100,
        }
    }
}

/// Top-level configuration used at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub affinity: AffinityLayersConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub flows: FlowConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl SchedulerConfig {
    pub fn from_json_str(text: &str) -> Result<SchedulerConfig, ConfigError> {
        let config: SchedulerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<SchedulerConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check the topology size and that every configured mask stays inside it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let workers = self.topology.clusters.len();
        if workers == 0 || workers > MAX_WORKERS {
            return Err(ConfigError::WorkerCount {
                got: workers,
                max: MAX_WORKERS,
            });
        }
        let valid = WorkerMask::first(workers);
        let layers = [
            &self.affinity.static_masks,
            &self.affinity.dynamic_masks,
            &self.affinity.newflow_masks,
        ];
        for table in layers.into_iter().flatten() {
            for (_, mask) in table.iter() {
                if mask.and(valid) != *mask {
                    return Err(ConfigError::MaskOutOfRange {
                        mask: mask.to_string(),
                        workers,
                    });
                }
            }
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: "queue.capacity".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Runtime-settable parameters addressed by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    Mask(AffinityLayer, Cluster),
    QueueCapacity,
    PollQuota,
    GroEnabled,
    GroMaxSegments,
    IdleTimeoutMs,
    SweepIntervalMs,
    RateSampleIntervalMs,
    MonitorThresholdPps,
    HeavyFlowPps,
    LightFlowPps,
    MigrationBudget,
    RebalanceBudget,
}

impl Parameter {
    /// Every parameter name accepted by [`Parameter::parse`].
    pub fn names() -> Vec<String> {
        let mut names = Vec::new();
        for layer in AffinityLayer::ALL {
            for cluster in Cluster::ALL {
                names.push(format!("{}.{}", layer.param_prefix(), cluster));
            }
        }
        names.extend(
            [
                "queue_capacity",
                "poll_quota",
                "gro_enabled",
                "gro_max_segments",
                "idle_timeout_ms",
                "sweep_interval_ms",
                "rate_sample_interval_ms",
                "monitor_threshold_pps",
                "heavy_flow_pps",
                "light_flow_pps",
                "migration_budget",
                "rebalance_budget",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        names
    }

    pub fn parse(name: &str) -> Result<Parameter, ConfigError> {
        if let Some((prefix, cluster)) = name.split_once('.') {
            let layer = AffinityLayer::ALL
                .into_iter()
                .find(|layer| layer.param_prefix() == prefix);
            if let (Some(layer), Some(cluster)) = (layer, Cluster::from_label(cluster)) {
                return Ok(Parameter::Mask(layer, cluster));
            }
            return Err(ConfigError::UnknownParameter(name.to_string()));
        }
        let parameter = match name {
            "queue_capacity" => Parameter::QueueCapacity,
            "poll_quota" => Parameter::PollQuota,
            "gro_enabled" => Parameter::GroEnabled,
            "gro_max_segments" => Parameter::GroMaxSegments,
            "idle_timeout_ms" => Parameter::IdleTimeoutMs,
            "sweep_interval_ms" => Parameter::SweepIntervalMs,
            "rate_sample_interval_ms" => Parameter::RateSampleIntervalMs,
            "monitor_threshold_pps" => Parameter::MonitorThresholdPps,
            "heavy_flow_pps" => Parameter::HeavyFlowPps,
            "light_flow_pps" => Parameter::LightFlowPps,
            "migration_budget" => Parameter::MigrationBudget,
            "rebalance_budget" => Parameter::RebalanceBudget,
            _ => return Err(ConfigError::UnknownParameter(name.to_string())),
        };
        Ok(parameter)
    }
}

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Live knobs shared by every component; relaxed atomics, read per packet.
#[derive(Debug)]
pub struct Tunables {
    queue_capacity: AtomicUsize,
    poll_quota: AtomicUsize,
    gro_enabled: AtomicBool,
    gro_max_segments: AtomicUsize,
    idle_timeout_ns: AtomicU64,
    sweep_interval_ns: AtomicU64,
    rate_sample_interval_ns: AtomicU64,
    monitor_threshold_pps: AtomicU64,
    heavy_flow_pps: AtomicU64,
    light_flow_pps: AtomicU64,
    migration_budget: AtomicUsize,
    rebalance_budget: AtomicUsize,
}

impl Tunables {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            queue_capacity: AtomicUsize::new(config.queue.capacity.max(1)),
            poll_quota: AtomicUsize::new(config.queue.poll_quota.max(1)),
            gro_enabled: AtomicBool::new(config.queue.gro_enabled),
            gro_max_segments: AtomicUsize::new(config.queue.gro_max_segments.max(1)),
            idle_timeout_ns: AtomicU64::new(
                config.flows.idle_timeout_ms.saturating_mul(NANOS_PER_MILLI),
            ),
            sweep_interval_ns: AtomicU64::new(
                config.flows.sweep_interval_ms.saturating_mul(NANOS_PER_MILLI),
            ),
            rate_sample_interval_ns: AtomicU64::new(
                config.flows.rate_sample_interval_ms.max(1).saturating_mul(NANOS_PER_MILLI),
            ),
            monitor_threshold_pps: AtomicU64::new(config.balance.monitor_threshold_pps),
            heavy_flow_pps: AtomicU64::new(config.balance.heavy_flow_pps),
            light_flow_pps: AtomicU64::new(config.balance.light_flow_pps),
            migration_budget: AtomicUsize::new(config.balance.migration_budget.max(1)),
            rebalance_budget: AtomicUsize::new(config.balance.rebalance_budget),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.load(Ordering::Relaxed)
    }

    pub fn poll_quota(&self) -> usize {
        self.poll_quota.load(Ordering::Relaxed)
    }

    pub fn gro_enabled(&self) -> bool {
        self.gro_enabled.load(Ordering::Relaxed)
    }

    pub fn gro_max_segments(&self) -> usize {
        self.gro_max_segments.load(Ordering::Relaxed)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_nanos(self.idle_timeout_ns.load(Ordering::Relaxed))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_nanos(self.sweep_interval_ns.load(Ordering::Relaxed))
    }

    pub fn rate_sample_interval_ns(&self) -> u64 {
        self.rate_sample_interval_ns.load(Ordering::Relaxed)
    }

    pub fn monitor_threshold_pps(&self) -> u64 {
        self.monitor_threshold_pps.load(Ordering::Relaxed)
    }

    pub fn heavy_flow_pps(&self) -> u64 {
        self.heavy_flow_pps.load(Ordering::Relaxed)
    }

    pub fn light_flow_pps(&self) -> u64 {
        self.light_flow_pps.load(Ordering::Relaxed)
    }

    pub fn migration_budget(&self) -> usize {
        self.migration_budget.load(Ordering::Relaxed)
    }

    pub fn rebalance_budget(&self) -> usize {
        self.rebalance_budget.load(Ordering::Relaxed)
    }

    /// Apply a scalar parameter. Mask parameters belong to the affinity selector.
    pub fn set(&self, parameter: Parameter, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        let number = || value.trim().parse::<u64>().map_err(|_| invalid());
        match parameter {
            Parameter::Mask(..) => return Err(ConfigError::UnknownParameter(name.to_string())),
            Parameter::QueueCapacity => {
                let n = number()?;
                if n == 0 {
                    return Err(invalid());
                }
                self.queue_capacity.store(n as usize, Ordering::Relaxed);
            }
            Parameter::PollQuota => {
                let n = number()?;
                if n == 0 {
                    return Err(invalid());
                }
                self.poll_quota.store(n as usize, Ordering::Relaxed);
            }
            Parameter::GroEnabled => {
                let enabled = match value.trim() {
                    "1" | "true" | "on" => true,
                    "0" | "false" | "off" => false,
                    _ => return Err(invalid()),
                };
                self.gro_enabled.store(enabled, Ordering::Relaxed);
            }
            Parameter::GroMaxSegments => {
                let n = number()?;
                if n == 0 {
                    return Err(invalid());
                }
                self.gro_max_segments.store(n as usize, Ordering::Relaxed);
            }
            Parameter::IdleTimeoutMs => self
                .idle_timeout_ns
                .store(number()?.saturating_mul(NANOS_PER_MILLI), Ordering::Relaxed),
            Parameter::SweepIntervalMs => self
                .sweep_interval_ns
                .store(number()?.saturating_mul(NANOS_PER_MILLI), Ordering::Relaxed),
            Parameter::RateSampleIntervalMs => self.rate_sample_interval_ns.store(
                number()?.max(1).saturating_mul(NANOS_PER_MILLI),
                Ordering::Relaxed,
            ),
            Parameter::MonitorThresholdPps => {
                self.monitor_threshold_pps.store(number()?, Ordering::Relaxed)
            }
            Parameter::HeavyFlowPps => self.heavy_flow_pps.store(number()?, Ordering::Relaxed),
            Parameter::LightFlowPps => self.light_flow_pps.store(number()?, Ordering::Relaxed),
            Parameter::MigrationBudget => {
                let n = number()?;
                if n == 0 {
                    return Err(invalid());
                }
                self.migration_budget.store(n as usize, Ordering::Relaxed);
            }
            // Zero turns rebalancing off.
            Parameter::RebalanceBudget => {
                self.rebalance_budget.store(number()? as usize, Ordering::Relaxed)
            }
        }
        Ok(())
    }

    /// Render a scalar parameter the way [`Tunables::set`] accepts it.
    pub fn get(&self, parameter: Parameter) -> Option<String> {
        let ms = |ns: u64| (ns / NANOS_PER_MILLI).to_string();
        let value = match parameter {
            Parameter::Mask(..) => return None,
            Parameter::QueueCapacity => self.queue_capacity().to_string(),
            Parameter::PollQuota => self.poll_quota().to_string(),
            Parameter::GroEnabled => self.gro_enabled().to_string(),
            Parameter::GroMaxSegments => self.gro_max_segments().to_string(),
            Parameter::IdleTimeoutMs => ms(self.idle_timeout_ns.load(Ordering::Relaxed)),
            Parameter::SweepIntervalMs => ms(self.sweep_interval_ns.load(Ordering::Relaxed)),
            Parameter::RateSampleIntervalMs => ms(self.rate_sample_interval_ns()),
            Parameter::MonitorThresholdPps => self.monitor_threshold_pps().to_string(),
            Parameter::HeavyFlowPps => self.heavy_flow_pps().to_string(),
            Parameter::LightFlowPps => self.light_flow_pps().to_string(),
            Parameter::MigrationBudget => self.migration_budget().to_string(),
            Parameter::RebalanceBudget => self.rebalance_budget().to_string(),
        };
        Some(value)
    }
}
