//! Flow registry: concurrent flow-hash → [`FlowRecord`] index.
//!
//! Buckets are singly linked lists published through `crossbeam-epoch` atomics. Readers walk a
//! bucket under an epoch guard without taking any lock; writers (insert, remove, sweep) serialize
//! per bucket on a small mutex and unlink nodes with deferred destruction, so a node is only freed
//! once every reader that could still see it has unpinned. The record itself sits behind an
//! [`Arc`], which lets callers keep a [`FlowRef`] beyond the guard.

use crate::cluster::{Cluster, WorkerId};
use crate::packet::Packet;
use crate::scheduler::debug_ring::TransitionClass;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Shared handle to a registered flow.
pub type FlowRef = Arc<FlowRecord>;

/// Migration hand-off state guarded by the flow's transit lock.
///
/// While `migrating` is set, newly classified packets of the flow are parked in `buffer` instead of
/// being enqueued; the migration poller moves them to the target worker right before flipping the
/// assignment.
#[derive(Debug, Default)]
pub(crate) struct FlowTransit {
    pub(crate) migrating: bool,
    pub(crate) target: Option<WorkerId>,
    pub(crate) buffer: VecDeque<Packet>,
}

/// Per-flow state ("eye").
#[derive(Debug)]
pub struct FlowRecord {
    hash: u64,
    cluster_hint: Cluster,
    worker: AtomicUsize,
    packets: AtomicU64,
    last_seen_ns: AtomicU64,
    sample_ns: AtomicU64,
    sample_packets: AtomicU64,
    rate_pps: AtomicU64,
    monitored: AtomicBool,
    destination: OnceLock<SocketAddr>,
    gro_batches: AtomicU64,
    gro_segments: AtomicU64,
    migrations: AtomicU64,
    transitions: [AtomicU64; 4],
    pub(crate) transit: Mutex<FlowTransit>,
}

impl FlowRecord {
    pub fn new(hash: u64, worker: WorkerId, cluster_hint: Cluster, now_ns: u64) -> FlowRecord {
        FlowRecord {
            hash,
            cluster_hint,
            worker: AtomicUsize::new(worker),
            packets: AtomicU64::new(0),
            last_seen_ns: AtomicU64::new(now_ns),
            sample_ns: AtomicU64::new(now_ns),
            sample_packets: AtomicU64::new(0),
            rate_pps: AtomicU64::new(0),
            monitored: AtomicBool::new(false),
            destination: OnceLock::new(),
            gro_batches: AtomicU64::new(0),
            gro_segments: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            transitions: Default::default(),
            transit: Mutex::new(FlowTransit::default()),
        }
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn cluster_hint(&self) -> Cluster {
        self.cluster_hint
    }

    /// Authoritative worker. Only the migration flip and hotplug re-homing change it.
    pub fn worker(&self) -> WorkerId {
        self.worker.load(Ordering::Acquire)
    }

    pub(crate) fn set_worker(&self, worker: WorkerId) {
        self.worker.store(worker, Ordering::Release);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn last_seen_ns(&self) -> u64 {
        self.last_seen_ns.load(Ordering::Relaxed)
    }

    /// Smoothed packets-per-second estimate.
    pub fn rate_pps(&self) -> u64 {
        self.rate_pps.load(Ordering::Relaxed)
    }

    pub fn is_monitored(&self) -> bool {
        self.monitored.load(Ordering::Relaxed)
    }

    pub fn set_monitored(&self, monitored: bool) {
        self.monitored.store(monitored, Ordering::Relaxed);
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination.get().copied()
    }

    pub fn is_migrating(&self) -> bool {
        self.transit.lock().migrating
    }

    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }

    pub fn transitions(&self, class: TransitionClass) -> u64 {
        self.transitions[class.index()].load(Ordering::Relaxed)
    }

    /// Account one packet and refresh the rate estimate.
    ///
    /// A sample is taken at most once per `sample_interval_ns`; the estimate is an EWMA weighting
    /// the previous value 7/8. Only the caller that wins the sample timestamp CAS updates it.
    pub fn observe_packet(&self, packet: &Packet, now_ns: u64, sample_interval_ns: u64) -> u64 {
        if let Some(destination) = packet.destination {
            let _ = self.destination.set(destination);
        }
        let count = self.packets.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_seen_ns.fetch_max(now_ns, Ordering::Relaxed);

        let sampled_at = self.sample_ns.load(Ordering::Relaxed);
        let elapsed = now_ns.saturating_sub(sampled_at);
        if elapsed < sample_interval_ns.max(1) {
            return self.rate_pps();
        }
        if self
            .sample_ns
            .compare_exchange(sampled_at, now_ns, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return self.rate_pps();
        }
        let previous = self.sample_packets.swap(count, Ordering::AcqRel);
        let delta = count.saturating_sub(previous);
        let instant_pps = ((delta as u128 * 1_000_000_000) / elapsed as u128) as u64;
        let _ = self
            .rate_pps
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                if prev == 0 {
                    Some(instant_pps)
                } else {
                    Some((prev * 7 + instant_pps) / 8)
                }
            });
        self.rate_pps()
    }

    pub(crate) fn record_gro_batch(&self, segments: usize) {
        self.gro_batches.fetch_add(1, Ordering::Relaxed);
        self.gro_segments
            .fetch_add(segments as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_migration(&self, class: TransitionClass) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
        self.transitions[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            hash: self.hash,
            worker: self.worker(),
            cluster_hint: self.cluster_hint,
            packets: self.packets(),
            rate_pps: self.rate_pps(),
            monitored: self.is_monitored(),
            migrating: self.is_migrating(),
            destination: self.destination().map(|d| d.to_string()),
            gro_batches: self.gro_batches.load(Ordering::Relaxed),
            gro_segments: self.gro_segments.load(Ordering::Relaxed),
            migrations: self.migrations(),
            last_seen_ns: self.last_seen_ns(),
        }
    }
}

/// Read-only per-flow view exposed through the observability surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub hash: u64,
    pub worker: WorkerId,
    pub cluster_hint: Cluster,
    pub packets: u64,
    pub rate_pps: u64,
    pub monitored: bool,
    pub migrating: bool,
    pub destination: Option<String>,
    pub gro_batches: u64,
    pub gro_segments: u64,
    pub migrations: u64,
    pub last_seen_ns: u64,
}

/// Insert refused because the table reached its configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

struct Node {
    flow: FlowRef,
    next: Atomic<Node>,
}

struct Bucket {
    head: Atomic<Node>,
    writer: Mutex<()>,
}

pub struct FlowTable {
    buckets: Box<[Bucket]>,
    mask: usize,
    len: AtomicUsize,
    max_flows: usize,
    last_sweep_ns: AtomicU64,
}

impl FlowTable {
    pub fn new(buckets: usize, max_flows: usize) -> Self {
        let count = buckets.max(1).next_power_of_two();
        let buckets = (0..count)
            .map(|_| Bucket {
                head: Atomic::null(),
                writer: Mutex::new(()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            mask: count - 1,
            len: AtomicUsize::new(0),
            max_flows,
            last_sweep_ns: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket(&self, hash: u64) -> &Bucket {
        // Fold the high bits in; hashes from the receive path are not guaranteed to be mixed.
        let mixed = (hash ^ (hash >> 29)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.buckets[((mixed >> 32) as usize) & self.mask]
    }

    fn find<'g>(bucket: &Bucket, hash: u64, guard: &'g Guard) -> Option<&'g Node> {
        let mut current = bucket.head.load(Ordering::Acquire, guard);
        // SAFETY: nodes reachable from a bucket are only destroyed through `defer_destroy`,
        // which waits for every guard pinned before the unlink, including `guard`.
        while let Some(node) = unsafe { current.as_ref() } {
            if node.flow.hash == hash {
                return Some(node);
            }
            current = node.next.load(Ordering::Acquire, guard);
        }
        None
    }

    pub fn lookup(&self, hash: u64) -> Option<FlowRef> {
        let guard = epoch::pin();
        Self::find(self.bucket(hash), hash, &guard).map(|node| node.flow.clone())
    }

    /// Publish `candidate` unless a flow with the same hash already exists.
    ///
    /// Returns the registered flow and whether `candidate` won. A losing candidate is dropped.
    pub fn insert_if_absent(&self, candidate: FlowRecord) -> Result<(FlowRef, bool), TableFull> {
        let hash = candidate.hash;
        let bucket = self.bucket(hash);
        let _writer = bucket.writer.lock();
        let guard = epoch::pin();
        if let Some(node) = Self::find(bucket, hash, &guard) {
            return Ok((node.flow.clone(), false));
        }
        if self.len.load(Ordering::Relaxed) >= self.max_flows {
            return Err(TableFull);
        }
        let flow = Arc::new(candidate);
        let node = Owned::new(Node {
            flow: flow.clone(),
            next: Atomic::null(),
        });
        let head = bucket.head.load(Ordering::Acquire, &guard);
        node.next.store(head, Ordering::Relaxed);
        bucket.head.store(node, Ordering::Release);
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok((flow, true))
    }

    /// Unlink `flow` and hand its node to the epoch collector. Returns `false` if it was not found.
    pub fn remove(&self, flow: &FlowRef) -> bool {
        let bucket = self.bucket(flow.hash);
        let _writer = bucket.writer.lock();
        let guard = epoch::pin();
        let removed =
            Self::unlink_where(bucket, &guard, |candidate| Arc::ptr_eq(candidate, flow), &mut |_| {});
        if removed > 0 {
            self.len.fetch_sub(removed, Ordering::Relaxed);
        }
        removed > 0
    }

    /// Remove every node matching `predicate` from one bucket; caller holds the writer lock.
    fn unlink_where(
        bucket: &Bucket,
        guard: &Guard,
        mut predicate: impl FnMut(&FlowRef) -> bool,
        on_removed: &mut impl FnMut(FlowRef),
    ) -> usize {
        let mut removed = 0;
        let mut link = &bucket.head;
        loop {
            let current: Shared<'_, Node> = link.load(Ordering::Acquire, guard);
            // SAFETY: see `find`; the writer lock also excludes concurrent unlinks.
            let node = match unsafe { current.as_ref() } {
                Some(node) => node,
                None => break,
            };
            if predicate(&node.flow) {
                let next = node.next.load(Ordering::Acquire, guard);
                link.store(next, Ordering::Release);
                on_removed(node.flow.clone());
                // SAFETY: `current` is no longer reachable from the bucket; readers still holding
                // it are pinned and keep it alive until they unpin.
                unsafe { guard.defer_destroy(current) };
                removed += 1;
            } else {
                link = &node.next;
            }
        }
        removed
    }

    /// Throttled idle sweep. Returns `None` when the previous sweep is more recent than `interval_ns`.
    pub fn sweep(&self, now_ns: u64, interval_ns: u64, idle_ns: u64) -> Option<Vec<FlowRef>> {
        let last = self.last_sweep_ns.load(Ordering::Relaxed);
        if last != 0 && now_ns.saturating_sub(last) < interval_ns {
            return None;
        }
        if self
            .last_sweep_ns
            .compare_exchange(last, now_ns.max(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        Some(self.sweep_now(now_ns, idle_ns))
    }

    /// Remove flows idle for at least `idle_ns`, one bucket lock at a time.
    ///
    /// Flows with a migration in flight are skipped; their pending buffer still has to be flushed.
    pub fn sweep_now(&self, now_ns: u64, idle_ns: u64) -> Vec<FlowRef> {
        let mut removed = Vec::new();
        for bucket in self.buckets.iter() {
            let _writer = bucket.writer.lock();
            let guard = epoch::pin();
            let count = Self::unlink_where(
                bucket,
                &guard,
                |flow| {
                    now_ns.saturating_sub(flow.last_seen_ns()) >= idle_ns && !flow.is_migrating()
                },
                &mut |flow| removed.push(flow),
            );
            if count > 0 {
                self.len.fetch_sub(count, Ordering::Relaxed);
            }
        }
        removed
    }

    /// Visit every registered flow under a single epoch guard.
    pub fn for_each(&self, mut f: impl FnMut(&FlowRef)) {
        let guard = epoch::pin();
        for bucket in self.buckets.iter() {
            let mut current = bucket.head.load(Ordering::Acquire, &guard);
            // SAFETY: see `find`.
            while let Some(node) = unsafe { current.as_ref() } {
                f(&node.flow);
                current = node.next.load(Ordering::Acquire, &guard);
            }
        }
    }

    pub fn flows(&self) -> Vec<FlowRef> {
        let mut flows = Vec::with_capacity(self.len());
        self.for_each(|flow| flows.push(flow.clone()));
        flows
    }
}

impl Drop for FlowTable {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no reader or writer can reach the buckets any more.
        unsafe {
            let guard = epoch::unprotected();
            for bucket in self.buckets.iter() {
                let mut current = bucket.head.load(Ordering::Relaxed, guard);
                while !current.is_null() {
                    let next = current.deref().next.load(Ordering::Relaxed, guard);
                    drop(current.into_owned());
                    current = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn record(hash: u64, worker: WorkerId, now: u64) -> FlowRecord {
        FlowRecord::new(hash, worker, Cluster::Little, now)
    }

    #[test]
    fn insert_then_lookup_returns_same_record() {
        let table = FlowTable::new(8, 16);
        let (flow, inserted) = table.insert_if_absent(record(42, 3, 0)).unwrap();
        assert!(inserted);
        let found = table.lookup(42).unwrap();
        assert!(Arc::ptr_eq(&flow, &found));
        assert_eq!(found.worker(), 3);
        assert!(table.lookup(43).is_none());
    }

    #[test]
    fn losing_candidate_is_discarded() {
        let table = FlowTable::new(8, 16);
        table.insert_if_absent(record(7, 1, 0)).unwrap();
        let (flow, inserted) = table.insert_if_absent(record(7, 5, 0)).unwrap();
        assert!(!inserted);
        assert_eq!(flow.worker(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insert_fails_when_full() {
        let table = FlowTable::new(4, 2);
        table.insert_if_absent(record(1, 0, 0)).unwrap();
        table.insert_if_absent(record(2, 0, 0)).unwrap();
        assert_eq!(table.insert_if_absent(record(3, 0, 0)).unwrap_err(), TableFull);
        // existing flows are still served at capacity
        assert!(table.insert_if_absent(record(2, 0, 0)).is_ok());
    }

    #[test]
    fn removed_flow_stays_valid_for_holders() {
        let table = FlowTable::new(1, 16);
        for hash in 0..4 {
            table.insert_if_absent(record(hash, 0, 0)).unwrap();
        }
        let held = table.lookup(2).unwrap();
        assert!(table.remove(&held));
        assert!(!table.remove(&held));
        assert!(table.lookup(2).is_none());
        assert_eq!(held.hash(), 2);
        assert_eq!(table.len(), 3);
        assert!(table.lookup(0).is_some() && table.lookup(3).is_some());
    }

    #[test]
    fn sweep_removes_only_idle_flows_and_is_idempotent() {
        let table = FlowTable::new(4, 16);
        table.insert_if_absent(record(1, 0, 0)).unwrap();
        table.insert_if_absent(record(2, 0, 900)).unwrap();
        let removed = table.sweep_now(1_000, 500);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].hash(), 1);
        assert!(table.sweep_now(1_000, 500).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_is_throttled() {
        let table = FlowTable::new(4, 16);
        assert!(table.sweep(1_000, 5_000, 10).is_some());
        assert!(table.sweep(2_000, 5_000, 10).is_none());
        assert!(table.sweep(6_000, 5_000, 10).is_some());
    }

    #[test]
    fn migrating_flows_survive_sweep() {
        let table = FlowTable::new(4, 16);
        let (flow, _) = table.insert_if_absent(record(9, 0, 0)).unwrap();
        flow.transit.lock().migrating = true;
        assert!(table.sweep_now(10_000, 1).is_empty());
    }

    #[test]
    fn rate_estimate_respects_sampling_interval() {
        let flow = record(1, 0, 0);
        let packet = Packet::new(1, Cluster::Little, &[0]);
        for i in 0..100u64 {
            flow.observe_packet(&packet, i * 1_000_000, 500_000_000);
        }
        assert_eq!(flow.rate_pps(), 0);
        // 101 packets over 500 ms
        let rate = flow.observe_packet(&packet, 500_000_000, 500_000_000);
        assert_eq!(rate, 202);
        assert_eq!(flow.packets(), 101);
    }

    #[test]
    fn concurrent_inserts_agree_on_one_winner() {
        let table = Arc::new(FlowTable::new(16, 1024));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..64u64)
                        .map(|hash| table.insert_if_absent(record(hash, worker, 0)).unwrap().0)
                        .map(|flow| flow.worker())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<WorkerId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(table.len(), 64);
        for hash in 0..64usize {
            let winner = table.lookup(hash as u64).unwrap().worker();
            assert!(results.iter().all(|r| r[hash] == winner));
        }
    }
}
