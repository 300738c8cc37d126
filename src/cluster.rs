//! Cluster, worker and membership-mask definitions shared by every scheduler component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a worker (one logical core running one receive poller).
pub type WorkerId = usize;

/// Upper bound on workers; membership masks are 64-bit.
pub const MAX_WORKERS: usize = 64;

/// Caller id for classification running outside any worker thread; its wakes count as remote.
pub const EXTERNAL_CALLER: WorkerId = WorkerId::MAX;

/// Performance classes ordered from most efficient to most powerful.
///
/// The ordering is stable so components can use integer indexes instead of branching on labels.
/// Adding a class only requires appending it to [`Cluster::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cluster {
    Little,
    Mid,
    Big,
}

impl Cluster {
    /// Ordered list of all clusters (little → big).
    pub const ALL: [Cluster; 3] = [Cluster::Little, Cluster::Mid, Cluster::Big];

    /// Stable index for cluster based arrays.
    pub const fn index(self) -> usize {
        match self {
            Cluster::Little => 0,
            Cluster::Mid => 1,
            Cluster::Big => 2,
        }
    }

    /// Whether migrations out of / into this cluster count as "big" transitions.
    ///
    /// Mid cores are accounted with the little side when classifying transitions.
    pub const fn is_big(self) -> bool {
        matches!(self, Cluster::Big)
    }

    /// Parse the lowercase label used by the configuration surface.
    pub fn from_label(label: &str) -> Option<Cluster> {
        match label {
            "little" => Some(Cluster::Little),
            "mid" => Some(Cluster::Mid),
            "big" => Some(Cluster::Big),
            _ => None,
        }
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Cluster::Little => "little",
            Cluster::Mid => "mid",
            Cluster::Big => "big",
        };
        write!(f, "{label}")
    }
}

/// Helper structure wrapping a value per [`Cluster`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTable<T> {
    values: Vec<T>,
}

impl<T> ClusterTable<T> {
    /// Build a table by executing a closure for each cluster in [`Cluster::ALL`] order.
    pub fn from_fn(mut f: impl FnMut(Cluster) -> T) -> Self {
        let mut values = Vec::with_capacity(Cluster::ALL.len());
        for cluster in Cluster::ALL {
            values.push(f(cluster));
        }
        ClusterTable { values }
    }

    pub fn get(&self, cluster: Cluster) -> &T {
        &self.values[cluster.index()]
    }

    pub fn get_mut(&mut self, cluster: Cluster) -> &mut T {
        &mut self.values[cluster.index()]
    }

    /// Iterate `(cluster, value)` pairs in [`Cluster::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (Cluster, &T)> {
        Cluster::ALL.iter().copied().zip(self.values.iter())
    }
}

impl<T: Default> Default for ClusterTable<T> {
    fn default() -> Self {
        Self::from_fn(|_| T::default())
    }
}

impl<T> Index<Cluster> for ClusterTable<T> {
    type Output = T;

    fn index(&self, index: Cluster) -> &Self::Output {
        self.get(index)
    }
}

impl<T> IndexMut<Cluster> for ClusterTable<T> {
    fn index_mut(&mut self, index: Cluster) -> &mut Self::Output {
        self.get_mut(index)
    }
}

/// Set of workers encoded as a 64-bit mask (bit `n` = worker `n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerMask(pub u64);

impl WorkerMask {
    pub const EMPTY: WorkerMask = WorkerMask(0);

    /// Mask with workers `0..count` set.
    pub fn first(count: usize) -> WorkerMask {
        if count >= MAX_WORKERS {
            WorkerMask(u64::MAX)
        } else {
            WorkerMask((1u64 << count) - 1)
        }
    }

    pub fn from_workers(workers: &[WorkerId]) -> WorkerMask {
        workers
            .iter()
            .filter(|&&w| w < MAX_WORKERS)
            .fold(WorkerMask::EMPTY, |mask, &w| mask.with(w))
    }

    pub const fn contains(self, worker: WorkerId) -> bool {
        worker < MAX_WORKERS && self.0 & (1u64 << worker) != 0
    }

    pub const fn with(self, worker: WorkerId) -> WorkerMask {
        WorkerMask(self.0 | (1u64 << worker))
    }

    pub const fn without(self, worker: WorkerId) -> WorkerMask {
        WorkerMask(self.0 & !(1u64 << worker))
    }

    pub const fn and(self, other: WorkerMask) -> WorkerMask {
        WorkerMask(self.0 & other.0)
    }

    pub const fn or(self, other: WorkerMask) -> WorkerMask {
        WorkerMask(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// The `n`-th set worker in ascending order.
    pub fn nth(self, mut n: usize) -> Option<WorkerId> {
        let mut bits = self.0;
        while bits != 0 {
            let worker = bits.trailing_zeros() as usize;
            if n == 0 {
                return Some(worker);
            }
            n -= 1;
            bits &= bits - 1;
        }
        None
    }

    pub fn iter(self) -> impl Iterator<Item = WorkerId> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let worker = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(worker)
        })
    }

    /// Parse `0x`-prefixed hex or plain decimal, as accepted by the configuration surface.
    pub fn parse(text: &str) -> Option<WorkerMask> {
        let text = text.trim();
        let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok()?,
            None => text.parse::<u64>().ok()?,
        };
        Some(WorkerMask(value))
    }
}

impl fmt::Display for WorkerMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Static worker → cluster layout plus the live online mask.
#[derive(Debug)]
pub struct Topology {
    clusters: Vec<Cluster>,
    members: ClusterTable<WorkerMask>,
    online: AtomicU64,
}

impl Topology {
    /// Build a topology from the cluster of each worker; every worker starts online.
    pub fn new(clusters: Vec<Cluster>) -> Topology {
        debug_assert!(clusters.len() <= MAX_WORKERS);
        let members = ClusterTable::from_fn(|cluster| {
            clusters
                .iter()
                .enumerate()
                .filter(|(_, c)| **c == cluster)
                .fold(WorkerMask::EMPTY, |mask, (worker, _)| mask.with(worker))
        });
        let online = WorkerMask::first(clusters.len()).0;
        Topology {
            clusters,
            members,
            online: AtomicU64::new(online),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        worker < self.clusters.len()
    }

    pub fn cluster_of(&self, worker: WorkerId) -> Cluster {
        self.clusters.get(worker).copied().unwrap_or(Cluster::Little)
    }

    /// Workers physically belonging to `cluster`.
    pub fn members(&self, cluster: Cluster) -> WorkerMask {
        self.members[cluster]
    }

    pub fn all(&self) -> WorkerMask {
        WorkerMask::first(self.clusters.len())
    }

    pub fn online(&self) -> WorkerMask {
        WorkerMask(self.online.load(Ordering::Acquire))
    }

    pub fn is_online(&self, worker: WorkerId) -> bool {
        self.online().contains(worker)
    }

    pub(crate) fn set_online(&self, worker: WorkerId, online: bool) {
        if online {
            self.online.fetch_or(1u64 << worker, Ordering::AcqRel);
        } else {
            self.online.fetch_and(!(1u64 << worker), Ordering::AcqRel);
        }
    }
}
