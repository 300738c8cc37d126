//! Affinity selector: which worker should own a flow.
//!
//! Three layered membership configurations are kept, each partitioned by cluster:
//! - **static**: the baseline placement (defaults to physical cluster membership);
//! - **dynamic**: an override that, when any cluster mask is non-empty, replaces static;
//! - **new-flow**: an optional hint restricting where *new* flows are placed.
//!
//! The whole [`AffinityConfig`] is immutable once published. Writers clone, modify and swap it in
//! through `arc-swap` while holding a writer mutex; readers load the current pointer without
//! blocking and can never observe a half-applied update. Retired configurations are freed when the
//! last reader drops its `Arc`.

use crate::cluster::{Cluster, ClusterTable, Topology, WorkerId, WorkerMask};
use crate::config::AffinityLayersConfig;
use crate::error::ConfigError;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Named configuration layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityLayer {
    Static,
    Dynamic,
    NewFlow,
}

impl AffinityLayer {
    pub const ALL: [AffinityLayer; 3] = [
        AffinityLayer::Static,
        AffinityLayer::Dynamic,
        AffinityLayer::NewFlow,
    ];

    /// Prefix of the mask parameters of this layer (`<prefix>.<cluster>`).
    pub const fn param_prefix(self) -> &'static str {
        match self {
            AffinityLayer::Static => "static_mask",
            AffinityLayer::Dynamic => "dynamic_mask",
            AffinityLayer::NewFlow => "newflow_mask",
        }
    }
}

/// Published membership configuration ("arps meta").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityConfig {
    pub static_masks: ClusterTable<WorkerMask>,
    pub dynamic_masks: ClusterTable<WorkerMask>,
    pub newflow_masks: ClusterTable<WorkerMask>,
    /// Bumped on every publish.
    pub generation: u64,
}

fn layer_in_use(table: &ClusterTable<WorkerMask>) -> bool {
    table.iter().any(|(_, mask)| !mask.is_empty())
}

fn union(table: &ClusterTable<WorkerMask>) -> WorkerMask {
    table
        .iter()
        .fold(WorkerMask::EMPTY, |acc, (_, mask)| acc.or(*mask))
}

impl AffinityConfig {
    pub fn layer(&self, layer: AffinityLayer) -> &ClusterTable<WorkerMask> {
        match layer {
            AffinityLayer::Static => &self.static_masks,
            AffinityLayer::Dynamic => &self.dynamic_masks,
            AffinityLayer::NewFlow => &self.newflow_masks,
        }
    }

    fn layer_mut(&mut self, layer: AffinityLayer) -> &mut ClusterTable<WorkerMask> {
        match layer {
            AffinityLayer::Static => &mut self.static_masks,
            AffinityLayer::Dynamic => &mut self.dynamic_masks,
            AffinityLayer::NewFlow => &mut self.newflow_masks,
        }
    }

    /// Layer governing existing flows: dynamic when in use, static otherwise.
    pub fn active(&self) -> &ClusterTable<WorkerMask> {
        if layer_in_use(&self.dynamic_masks) {
            &self.dynamic_masks
        } else {
            &self.static_masks
        }
    }

    /// Layer governing placement of new flows.
    pub fn for_new_flows(&self) -> &ClusterTable<WorkerMask> {
        if layer_in_use(&self.newflow_masks) {
            &self.newflow_masks
        } else {
            self.active()
        }
    }
}

/// Outcome of a placement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// Existing flow stays where it is.
    Keep(WorkerId),
    /// Existing flow's worker left the active membership (or went offline); move it here.
    Repick(WorkerId),
    /// New flow placed here.
    New(WorkerId),
    /// No eligible online worker: process on the current core.
    Local,
}

/// Caller-facing worker selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Worker(WorkerId),
    /// Sentinel: use the current core.
    Local,
}

/// Finalizer of splitmix64, so that small or sequential hashes still spread out.
#[inline]
fn mix(hash: u64) -> u64 {
    let mut z = hash.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Map a hash onto `[0, n)` by multiply-high instead of modulo.
#[inline]
pub fn reciprocal_scale(hash: u64, n: u64) -> u64 {
    debug_assert!(n > 0);
    (((mix(hash) as u128) * (n as u128)) >> 64) as u64
}

/// Deterministic, uniform pick from `mask`.
pub fn pick_from(mask: WorkerMask, hash: u64) -> Option<WorkerId> {
    let count = mask.count();
    if count == 0 {
        return None;
    }
    mask.nth(reciprocal_scale(hash, count as u64) as usize)
}

pub struct AffinitySelector {
    topology: Arc<Topology>,
    current: ArcSwap<AffinityConfig>,
    writer: Mutex<()>,
}

impl AffinitySelector {
    pub fn new(topology: Arc<Topology>, layers: &AffinityLayersConfig) -> Self {
        let static_masks = layers
            .static_masks
            .clone()
            .unwrap_or_else(|| ClusterTable::from_fn(|cluster| topology.members(cluster)));
        let config = AffinityConfig {
            static_masks,
            dynamic_masks: layers.dynamic_masks.clone().unwrap_or_default(),
            newflow_masks: layers.newflow_masks.clone().unwrap_or_default(),
            generation: 0,
        };
        Self {
            topology,
            current: ArcSwap::from_pointee(config),
            writer: Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Current published configuration.
    pub fn config(&self) -> Arc<AffinityConfig> {
        self.current.load_full()
    }

    pub fn mask(&self, layer: AffinityLayer, cluster: Cluster) -> WorkerMask {
        self.current.load().layer(layer)[cluster]
    }

    /// Replace one cluster mask of one layer and publish the new configuration.
    pub fn update(
        &self,
        layer: AffinityLayer,
        cluster: Cluster,
        mask: WorkerMask,
    ) -> Result<u64, ConfigError> {
        self.check_mask(mask)?;
        let _writer = self.writer.lock();
        let mut next = AffinityConfig::clone(&self.current.load());
        next.layer_mut(layer)[cluster] = mask;
        next.generation += 1;
        let generation = next.generation;
        self.current.store(Arc::new(next));
        Ok(generation)
    }

    /// Publish a complete configuration.
    pub fn replace(&self, mut config: AffinityConfig) -> Result<u64, ConfigError> {
        for layer in AffinityLayer::ALL {
            for (_, mask) in config.layer(layer).iter() {
                self.check_mask(*mask)?;
            }
        }
        let _writer = self.writer.lock();
        config.generation = self.current.load().generation + 1;
        let generation = config.generation;
        self.current.store(Arc::new(config));
        Ok(generation)
    }

    fn check_mask(&self, mask: WorkerMask) -> Result<(), ConfigError> {
        let valid = self.topology.all();
        if mask.and(valid) != mask {
            return Err(ConfigError::MaskOutOfRange {
                mask: mask.to_string(),
                workers: self.topology.worker_count(),
            });
        }
        Ok(())
    }

    /// Whether `worker` may keep serving flows under the active layer.
    ///
    /// Membership is checked against the mask of the worker's own cluster; if the active layer
    /// leaves that cluster unconfigured, the union of all its clusters applies.
    pub fn is_permitted(&self, worker: WorkerId) -> bool {
        if !self.topology.is_online(worker) {
            return false;
        }
        let config = self.current.load();
        let active = config.active();
        let own = active[self.topology.cluster_of(worker)];
        let membership = if own.is_empty() { union(active) } else { own };
        membership.contains(worker)
    }

    /// Pick for a new flow of `hint`, falling back to every cluster of the layer.
    pub fn pick_new(&self, hash: u64, hint: Cluster) -> Option<WorkerId> {
        let config = self.current.load();
        let table = config.for_new_flows();
        let online = self.topology.online();
        pick_from(table[hint].and(online), hash)
            .or_else(|| pick_from(union(table).and(online), hash))
    }

    /// Pick among online members of `cluster` in the active layer, with no fallback.
    pub fn pick_in_cluster(&self, cluster: Cluster, hash: u64) -> Option<WorkerId> {
        let config = self.current.load();
        pick_from(config.active()[cluster].and(self.topology.online()), hash)
    }

    /// Re-pick for an existing flow whose worker is no longer permitted.
    fn repick(&self, hash: u64, current: WorkerId) -> Option<WorkerId> {
        let config = self.current.load();
        let active = config.active();
        let online = self.topology.online().without(current);
        let cluster = self.topology.cluster_of(current);
        pick_from(active[cluster].and(online), hash)
            .or_else(|| pick_from(union(active).and(online), hash))
    }

    /// Placement decision for `hash`; `current` is the existing flow's worker, if any.
    pub fn choose(&self, hash: u64, hint: Cluster, current: Option<WorkerId>) -> Choice {
        match current {
            Some(worker) if self.is_permitted(worker) => Choice::Keep(worker),
            Some(worker) => match self.repick(hash, worker) {
                Some(target) => Choice::Repick(target),
                None => Choice::Local,
            },
            None => match self.pick_new(hash, hint) {
                Some(worker) => Choice::New(worker),
                None => Choice::Local,
            },
        }
    }
}
