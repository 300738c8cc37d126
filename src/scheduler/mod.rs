//! Multi-core packet scheduler.
//!
//! [`Scheduler`] wires the flow registry, the affinity selector, the per-worker receive queues,
//! the migration engine and hotplug staging together:
//!
//! ```text
//! packet ──► flow_table ──► affinity ──► worker ──► rx_queue ──► poll ──► PacketSink
//!                 │                          │
//!                 │ migrating                │ offline
//!                 ▼                          ▼
//!          pending buffer              hotplug staging / redirect
//! ```
//!
//! Lock order, outermost first: hotplug mutex, flow transit, staging, pending list, process queue,
//! inbound queue. No path acquires a lock to the left of one it already holds.

pub mod affinity;
pub mod debug_ring;
pub mod flow_table;
pub(crate) mod gro;
pub mod hotplug;
pub mod migration;
pub mod rx_queue;

pub use affinity::{AffinityConfig, AffinityLayer, Choice, Selection};
pub use debug_ring::{FlowEvent, FlowEventKind, TransitionClass};
pub use flow_table::{FlowRef, FlowSnapshot};
pub use hotplug::StagingControl;
pub use migration::{MigrationOutcome, TransitionCounts};
pub use rx_queue::{Delivery, PacketSink, PollState, QueueCounters, WakeKind, WakeSink};

use crate::clock::Clock;
use crate::cluster::{Cluster, Topology, WorkerId, WorkerMask};
use crate::config::{Parameter, SchedulerConfig, Tunables};
use crate::error::{ConfigError, SchedulerError};
use crate::metrics::SchedulerSnapshot;
use crate::packet::Packet;
use affinity::AffinitySelector;
use debug_ring::DebugRing;
use flow_table::{FlowRecord, FlowTable};
use hotplug::StagingQueue;
use migration::MigrationQueue;
use parking_lot::Mutex;
use rx_queue::{PushOne, WorkerQueue};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the classifier sent a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// No eligible online worker: the caller processes the packet itself.
    ProcessLocally,
    /// Queued (or parked/staged) for this worker.
    Enqueued(WorkerId),
    Dropped,
}

/// Result of pushing a packet towards a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// The worker was offline and the packet followed its redirect to this worker.
    Redirected(WorkerId),
    Dropped,
    /// Held in the offline worker's staging queue.
    Staged,
}

/// Per-worker observability record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker: WorkerId,
    pub cluster: Cluster,
    pub online: bool,
    pub poll_state: PollState,
    #[serde(flatten)]
    pub counters: QueueCounters,
    pub staged: usize,
    pub staging: StagingControl,
    pub pending_migrations: usize,
}

pub struct Scheduler {
    topology: Arc<Topology>,
    selector: AffinitySelector,
    flows: FlowTable,
    queues: Box<[WorkerQueue]>,
    staging: Box<[StagingQueue]>,
    pending: Box<[MigrationQueue]>,
    tunables: Tunables,
    ring: DebugRing,
    transitions: [AtomicU64; 4],
    local_fallbacks: AtomicU64,
    /// Serializes offline/online/shutdown transitions.
    hotplug: Mutex<()>,
    sink: Arc<dyn PacketSink>,
    waker: Arc<dyn WakeSink>,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        sink: Arc<dyn PacketSink>,
        waker: Arc<dyn WakeSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let topology = Arc::new(Topology::new(config.topology.clusters.clone()));
        let workers = topology.worker_count();
        let selector = AffinitySelector::new(topology.clone(), &config.affinity);
        let queues = (0..workers).map(WorkerQueue::new).collect::<Vec<_>>();
        let staging = (0..workers).map(|_| StagingQueue::new()).collect::<Vec<_>>();
        let pending = (0..workers)
            .map(|_| MigrationQueue::default())
            .collect::<Vec<_>>();

        info!(
            workers,
            big = topology.members(Cluster::Big).count(),
            max_flows = config.flows.max_flows,
            queue_capacity = config.queue.capacity,
            "scheduler initialized"
        );

        Ok(Self {
            topology,
            selector,
            flows: FlowTable::new(config.flows.buckets, config.flows.max_flows),
            queues: queues.into_boxed_slice(),
            staging: staging.into_boxed_slice(),
            pending: pending.into_boxed_slice(),
            tunables: Tunables::from_config(config),
            ring: DebugRing::default(),
            transitions: Default::default(),
            local_fallbacks: AtomicU64::new(0),
            hotplug: Mutex::new(()),
            sink,
            waker,
            clock,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn worker_count(&self) -> usize {
        self.topology.worker_count()
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    fn check_worker(&self, worker: WorkerId) -> Result<(), SchedulerError> {
        if self.topology.contains(worker) {
            Ok(())
        } else {
            Err(SchedulerError::UnknownWorker(worker))
        }
    }

    fn wake_receive(&self, worker: WorkerId, from: WorkerId) {
        let kind = if from == worker {
            WakeKind::Local
        } else {
            WakeKind::Remote
        };
        self.queues[worker].record_wake(kind);
        self.waker.wake(worker, kind);
    }

    // ---------------------------------------------------------------------
    // Classification
    // ---------------------------------------------------------------------

    /// Worker that should own `hash`, creating nothing.
    ///
    /// An existing flow outside the active membership gets an implicit migration towards the
    /// returned worker; until it completes, packets keep following the flow's current assignment.
    pub fn select_worker(&self, hash: u64, cluster_hint: Cluster) -> Selection {
        match self.flows.lookup(hash) {
            Some(flow) => match self.enforce_membership(&flow) {
                Choice::Keep(worker) | Choice::Repick(worker) | Choice::New(worker) => {
                    Selection::Worker(worker)
                }
                Choice::Local => Selection::Local,
            },
            None => match self.selector.pick_new(hash, cluster_hint) {
                Some(worker) => Selection::Worker(worker),
                None => Selection::Local,
            },
        }
    }

    fn enforce_membership(&self, flow: &FlowRef) -> Choice {
        let choice = self
            .selector
            .choose(flow.hash(), flow.cluster_hint(), Some(flow.worker()));
        if let Choice::Repick(target) = choice {
            if self.submit_migration(flow, target) == MigrationOutcome::Requested {
                debug!(hash = flow.hash(), target, "flow outside membership, re-picked");
            }
        }
        choice
    }

    /// Classify `packet` and push it to the worker owning its flow.
    ///
    /// `from` is the worker the caller runs on; it decides between a local and a remote wake.
    /// While the flow is migrating the packet is parked with the flow, and the returned worker is
    /// the migration target that will own it once the migration completes.
    pub fn classify_and_route(&self, packet: Packet, from: WorkerId) -> RoutingDecision {
        let now = self.clock.now_ns();
        let hash = packet.flow_hash;

        let flow = match self.flows.lookup(hash) {
            Some(flow) => {
                self.enforce_membership(&flow);
                flow
            }
            None => {
                let Some(worker) = self.selector.pick_new(hash, packet.cluster_hint) else {
                    self.local_fallbacks.fetch_add(1, Ordering::Relaxed);
                    return RoutingDecision::ProcessLocally;
                };
                let candidate = FlowRecord::new(hash, worker, packet.cluster_hint, now);
                match self.flows.insert_if_absent(candidate) {
                    Ok((flow, inserted)) => {
                        if inserted {
                            self.ring
                                .record(now, hash, worker, FlowEventKind::Created);
                        }
                        flow
                    }
                    Err(_) => {
                        self.queues[worker].record_refused();
                        self.ring.record(now, hash, worker, FlowEventKind::Dropped);
                        return RoutingDecision::Dropped;
                    }
                }
            }
        };

        let rate = flow.observe_packet(&packet, now, self.tunables.rate_sample_interval_ns());
        if !flow.is_monitored() && rate > self.tunables.monitor_threshold_pps() {
            flow.set_monitored(true);
            debug!(hash, rate, "flow monitored");
        }

        // The transit lock makes "read assignment, push" atomic against a migration decision.
        let mut transit = flow.transit.lock();
        if transit.migrating {
            let source = flow.worker();
            if transit.buffer.len() >= self.tunables.queue_capacity() {
                self.queues[source].record_refused();
                return RoutingDecision::Dropped;
            }
            transit.buffer.push_back(packet);
            return RoutingDecision::Enqueued(transit.target.unwrap_or(source));
        }
        let worker = flow.worker();
        match self.enqueue(worker, packet, from) {
            EnqueueOutcome::Accepted | EnqueueOutcome::Staged => RoutingDecision::Enqueued(worker),
            EnqueueOutcome::Redirected(next) => RoutingDecision::Enqueued(next),
            EnqueueOutcome::Dropped => RoutingDecision::Dropped,
        }
    }

    /// Push `packet` to `worker`, staging or following the redirect when it is offline.
    pub fn enqueue(&self, worker: WorkerId, packet: Packet, from: WorkerId) -> EnqueueOutcome {
        if !self.topology.contains(worker) {
            warn!(worker, "enqueue for unknown worker");
            return EnqueueOutcome::Dropped;
        }
        self.enqueue_hops(worker, worker, packet, from, 0)
    }

    fn enqueue_hops(
        &self,
        worker: WorkerId,
        origin: WorkerId,
        packet: Packet,
        from: WorkerId,
        hops: usize,
    ) -> EnqueueOutcome {
        match self.queues[worker].push_one(packet, self.tunables.queue_capacity()) {
            PushOne::Accepted { armed } => {
                if armed {
                    self.wake_receive(worker, from);
                }
                if worker == origin {
                    EnqueueOutcome::Accepted
                } else {
                    EnqueueOutcome::Redirected(worker)
                }
            }
            PushOne::Dropped => EnqueueOutcome::Dropped,
            PushOne::Offline(packet) => self.stage(worker, origin, packet, from, hops),
        }
    }

    // ---------------------------------------------------------------------
    // Polling
    // ---------------------------------------------------------------------

    /// Run the receive poller of `worker` for at most `quota` packets. Returns packets delivered.
    pub fn poll(&self, worker: WorkerId, quota: usize) -> usize {
        let Some(queue) = self.queues.get(worker) else {
            return 0;
        };
        let max_segments = if self.tunables.gro_enabled() {
            self.tunables.gro_max_segments()
        } else {
            1
        };
        let outcome = queue.poll(quota, max_segments, |delivery| {
            if max_segments > 1 {
                if let Some(flow) = self.flows.lookup(delivery.flow_hash) {
                    flow.record_gro_batch(delivery.segments());
                }
            }
            self.sink.deliver(worker, delivery);
        });
        if outcome.rearmed {
            self.wake_receive(worker, worker);
        }
        if outcome.migration_ready {
            self.waker.wake(worker, WakeKind::Migration);
        }
        outcome.delivered
    }

    /// Poll `worker` until its queues are empty (or it went offline). Returns packets delivered.
    pub fn drain(&self, worker: WorkerId) -> usize {
        let quota = self.tunables.poll_quota();
        let mut total = 0;
        loop {
            let delivered = self.poll(worker, quota);
            total += delivered;
            if delivered < quota {
                return total;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Housekeeping
    // ---------------------------------------------------------------------

    /// Throttled idle sweep. Returns the number of flows removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ns();
        let interval = self.tunables.sweep_interval().as_nanos() as u64;
        let idle = self.tunables.idle_timeout().as_nanos() as u64;
        match self.flows.sweep(now, interval, idle) {
            Some(removed) => self.log_removed(removed, now),
            None => 0,
        }
    }

    /// Idle sweep ignoring the throttle.
    pub fn sweep_now(&self) -> usize {
        let now = self.clock.now_ns();
        let idle = self.tunables.idle_timeout().as_nanos() as u64;
        let removed = self.flows.sweep_now(now, idle);
        self.log_removed(removed, now)
    }

    fn log_removed(&self, removed: Vec<FlowRef>, now: u64) -> usize {
        for flow in &removed {
            self.ring
                .record(now, flow.hash(), flow.worker(), FlowEventKind::Removed);
            debug!(
                hash = flow.hash(),
                worker = flow.worker(),
                packets = flow.packets(),
                "idle flow removed"
            );
        }
        removed.len()
    }

    /// Discard everything still queued, staged or parked. Returns the number of packets discarded.
    pub fn shutdown(&self) -> u64 {
        let _hotplug = self.hotplug.lock();
        let mut discarded = 0;
        for queue in self.queues.iter() {
            let held = queue.take_all().len() as u64;
            queue.record_ignored(held);
            discarded += held;
        }
        for (worker, staging) in self.staging.iter().enumerate() {
            let staged = staging.take().len() as u64;
            self.queues[worker].record_discarded_arrivals(staged);
            discarded += staged;
        }
        for (worker, pending) in self.pending.iter().enumerate() {
            for entry in pending.take_all(&self.queues[worker]) {
                let mut transit = entry.flow.transit.lock();
                let parked = transit.buffer.len() as u64;
                transit.buffer.clear();
                transit.migrating = false;
                transit.target = None;
                self.queues[entry.flow.worker()].record_discarded_arrivals(parked);
                discarded += parked;
            }
        }
        info!(discarded, "scheduler drained for shutdown");
        discarded
    }

    // ---------------------------------------------------------------------
    // Configuration surface
    // ---------------------------------------------------------------------

    /// Set a named runtime parameter (`dynamic_mask.big`, `queue_capacity`, ...).
    pub fn set_param(&self, name: &str, value: &str) -> Result<(), SchedulerError> {
        match Parameter::parse(name)? {
            Parameter::Mask(layer, cluster) => {
                let mask = WorkerMask::parse(value).ok_or_else(|| ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })?;
                let generation = self.selector.update(layer, cluster, mask)?;
                info!(parameter = name, %mask, generation, "affinity mask updated");
            }
            parameter => {
                self.tunables.set(parameter, name, value)?;
                info!(parameter = name, value, "parameter updated");
            }
        }
        Ok(())
    }

    pub fn get_param(&self, name: &str) -> Result<String, SchedulerError> {
        let value = match Parameter::parse(name)? {
            Parameter::Mask(layer, cluster) => self.selector.mask(layer, cluster).to_string(),
            parameter => self
                .tunables
                .get(parameter)
                .ok_or_else(|| ConfigError::UnknownParameter(name.to_string()))?,
        };
        Ok(value)
    }

    /// Publish a whole affinity configuration at once.
    pub fn replace_affinity(&self, config: AffinityConfig) -> Result<u64, SchedulerError> {
        let generation = self.selector.replace(config)?;
        info!(generation, "affinity configuration replaced");
        Ok(generation)
    }

    pub fn affinity(&self) -> Arc<AffinityConfig> {
        self.selector.config()
    }

    // ---------------------------------------------------------------------
    // Observability
    // ---------------------------------------------------------------------

    pub fn worker_stats(&self, worker: WorkerId) -> Result<WorkerStats, SchedulerError> {
        self.check_worker(worker)?;
        let queue = &self.queues[worker];
        Ok(WorkerStats {
            worker,
            cluster: self.topology.cluster_of(worker),
            online: self.topology.is_online(worker),
            poll_state: queue.state(),
            counters: queue.counters(),
            staged: self.staging[worker].len(),
            staging: self.staging[worker].control(),
            pending_migrations: self.pending[worker].len(),
        })
    }

    pub fn flow_snapshot(&self, hash: u64) -> Option<FlowSnapshot> {
        self.flows.lookup(hash).map(|flow| flow.snapshot())
    }

    pub fn flows(&self) -> Vec<FlowSnapshot> {
        self.flows
            .flows()
            .iter()
            .map(|flow| flow.snapshot())
            .collect()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.ring.snapshot()
    }

    pub fn transition_counts(&self) -> TransitionCounts {
        TransitionCounts::from_fn(|class| self.transitions[class.index()].load(Ordering::Relaxed))
    }

    /// Packets the classifier told callers to process themselves.
    pub fn local_fallbacks(&self) -> u64 {
        self.local_fallbacks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let workers = (0..self.worker_count())
            .filter_map(|worker| self.worker_stats(worker).ok())
            .collect::<Vec<_>>();
        let mut monitored_flows = 0;
        let mut migrating_flows = 0;
        self.flows.for_each(|flow| {
            if flow.is_monitored() {
                monitored_flows += 1;
            }
            if flow.is_migrating() {
                migrating_flows += 1;
            }
        });
        SchedulerSnapshot {
            timestamp_ns: self.clock.now_ns(),
            pending_migrations: workers.iter().map(|w| w.pending_migrations).sum(),
            workers,
            flow_count: self.flows.len(),
            monitored_flows,
            migrating_flows,
            local_fallbacks: self.local_fallbacks(),
            transitions: self.transition_counts(),
            affinity: AffinityConfig::clone(&self.selector.config()),
            events_recorded: self.ring.recorded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        delivered: Mutex<Vec<(WorkerId, u64, u64)>>,
    }

    impl PacketSink for Collect {
        fn deliver(&self, worker: WorkerId, delivery: Delivery) {
            let mut delivered = self.delivered.lock();
            for packet in delivery.packets {
                delivered.push((worker, packet.flow_hash, packet.id));
            }
        }
    }

    #[derive(Default)]
    struct Wakes(Mutex<Vec<(WorkerId, WakeKind)>>);

    impl WakeSink for Wakes {
        fn wake(&self, worker: WorkerId, kind: WakeKind) {
            self.0.lock().push((worker, kind));
        }
    }

    fn build(config: SchedulerConfig) -> (Scheduler, Arc<Collect>, Arc<Wakes>, Arc<ManualClock>) {
        let sink = Arc::new(Collect::default());
        let wakes = Arc::new(Wakes::default());
        let clock = Arc::new(ManualClock::new(1));
        let scheduler =
            Scheduler::new(&config, sink.clone(), wakes.clone(), clock.clone()).unwrap();
        (scheduler, sink, wakes, clock)
    }

    fn packet(hash: u64, hint: Cluster) -> Packet {
        Packet::new(hash, hint, &[0u8; 64])
    }

    #[test]
    fn packets_of_a_flow_stick_to_one_worker() {
        let (scheduler, _, _, _) = build(SchedulerConfig::default());
        let first = scheduler.classify_and_route(packet(99, Cluster::Little), 0);
        let RoutingDecision::Enqueued(worker) = first else {
            panic!("unexpected {first:?}");
        };
        assert!(worker < 4);
        for _ in 0..20 {
            assert_eq!(
                scheduler.classify_and_route(packet(99, Cluster::Little), 0),
                RoutingDecision::Enqueued(worker)
            );
        }
        assert_eq!(scheduler.worker_stats(worker).unwrap().counters.enqueued, 21);
        assert_eq!(scheduler.flow_snapshot(99).unwrap().packets, 21);
    }

    #[test]
    fn wakes_are_local_or_remote_by_caller() {
        let (scheduler, _, wakes, _) = build(SchedulerConfig::default());
        let RoutingDecision::Enqueued(worker) =
            scheduler.classify_and_route(packet(5, Cluster::Big), 4)
        else {
            panic!("not enqueued");
        };
        let expected = if worker == 4 {
            WakeKind::Local
        } else {
            WakeKind::Remote
        };
        assert_eq!(wakes.0.lock().as_slice(), &[(worker, expected)]);
    }

    #[test]
    fn poll_delivers_in_order_and_updates_counters() {
        let (scheduler, sink, _, _) = build(SchedulerConfig::default());
        for _ in 0..10 {
            scheduler.classify_and_route(packet(7, Cluster::Big), 0);
        }
        let worker = scheduler.flow_snapshot(7).unwrap().worker;
        assert_eq!(scheduler.poll(worker, 4), 4);
        assert_eq!(scheduler.drain(worker), 6);
        let ids: Vec<u64> = sink.delivered.lock().iter().map(|d| d.2).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        let stats = scheduler.worker_stats(worker).unwrap();
        assert_eq!(stats.counters.processed, 10);
        assert_eq!(stats.counters.queued, 0);
        assert_eq!(stats.poll_state, PollState::Idle);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let mut config = SchedulerConfig::default();
        config.queue.capacity = 3;
        let (scheduler, _, _, _) = build(config);
        let decisions: Vec<_> = (0..5)
            .map(|_| scheduler.classify_and_route(packet(1, Cluster::Little), 0))
            .collect();
        assert_eq!(
            decisions
                .iter()
                .filter(|d| **d == RoutingDecision::Dropped)
                .count(),
            2
        );
        let worker = scheduler.flow_snapshot(1).unwrap().worker;
        let counters = scheduler.worker_stats(worker).unwrap().counters;
        assert_eq!((counters.enqueued, counters.dropped, counters.queued), (5, 2, 3));
    }

    #[test]
    fn no_online_worker_means_local_processing() {
        let mut config = SchedulerConfig::default();
        config.topology.clusters = vec![Cluster::Little];
        let (scheduler, sink, _, _) = build(config);
        scheduler.worker_offline(0).unwrap();
        assert_eq!(
            scheduler.classify_and_route(packet(3, Cluster::Little), 0),
            RoutingDecision::ProcessLocally
        );
        assert_eq!(scheduler.select_worker(3, Cluster::Little), Selection::Local);
        assert_eq!(scheduler.local_fallbacks(), 1);
        assert!(sink.delivered.lock().is_empty());
        assert_eq!(scheduler.flow_count(), 0);
    }

    #[test]
    fn full_flow_table_drops_new_flows_only() {
        let mut config = SchedulerConfig::default();
        config.flows.max_flows = 1;
        let (scheduler, _, _, _) = build(config);
        assert!(matches!(
            scheduler.classify_and_route(packet(1, Cluster::Little), 0),
            RoutingDecision::Enqueued(_)
        ));
        assert_eq!(
            scheduler.classify_and_route(packet(2, Cluster::Little), 0),
            RoutingDecision::Dropped
        );
        assert!(matches!(
            scheduler.classify_and_route(packet(1, Cluster::Little), 0),
            RoutingDecision::Enqueued(_)
        ));
        assert!(scheduler
            .events()
            .iter()
            .any(|e| e.flow_hash == 2 && e.kind == FlowEventKind::Dropped));
    }

    #[test]
    fn idle_sweep_removes_flows_and_logs_events() {
        let (scheduler, _, _, clock) = build(SchedulerConfig::default());
        scheduler.classify_and_route(packet(11, Cluster::Little), 0);
        scheduler.set_param("idle_timeout_ms", "100").unwrap();
        clock.advance(Duration::from_millis(150));
        assert_eq!(scheduler.sweep_now(), 1);
        assert_eq!(scheduler.sweep_now(), 0);
        assert!(scheduler.flow_snapshot(11).is_none());
        let kinds: Vec<_> = scheduler.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![FlowEventKind::Created, FlowEventKind::Removed]);
    }

    #[test]
    fn heavy_flows_become_monitored() {
        let (scheduler, _, _, clock) = build(SchedulerConfig::default());
        scheduler.set_param("monitor_threshold_pps", "100").unwrap();
        for _ in 0..200 {
            scheduler.classify_and_route(packet(21, Cluster::Little), 0);
            clock.advance(Duration::from_millis(1));
        }
        scheduler.drain(scheduler.flow_snapshot(21).unwrap().worker);
        for _ in 0..400 {
            scheduler.classify_and_route(packet(21, Cluster::Little), 0);
            clock.advance(Duration::from_millis(1));
        }
        let flow = scheduler.flow_snapshot(21).unwrap();
        assert!(flow.rate_pps > 100, "rate {}", flow.rate_pps);
        assert!(flow.monitored);
    }

    #[test]
    fn gro_batches_are_counted_on_the_flow() {
        let mut config = SchedulerConfig::default();
        config.queue.gro_enabled = true;
        config.queue.gro_max_segments = 4;
        let (scheduler, sink, _, _) = build(config);
        for _ in 0..8 {
            scheduler.classify_and_route(packet(31, Cluster::Big), 0);
        }
        let worker = scheduler.flow_snapshot(31).unwrap().worker;
        scheduler.drain(worker);
        let flow = scheduler.flow_snapshot(31).unwrap();
        assert_eq!((flow.gro_batches, flow.gro_segments), (2, 8));
        assert_eq!(sink.delivered.lock().len(), 8);
    }

    #[test]
    fn parameters_round_trip_through_the_facade() {
        let (scheduler, _, _, _) = build(SchedulerConfig::default());
        scheduler.set_param("dynamic_mask.big", "0x20").unwrap();
        assert_eq!(scheduler.get_param("dynamic_mask.big").unwrap(), "0x20");
        assert_eq!(scheduler.get_param("static_mask.little").unwrap(), "0xf");
        assert!(matches!(
            scheduler.set_param("dynamic_mask.big", "0x100"),
            Err(SchedulerError::Config(ConfigError::MaskOutOfRange { .. }))
        ));
        assert!(matches!(
            scheduler.set_param("bogus", "1"),
            Err(SchedulerError::Config(ConfigError::UnknownParameter(_)))
        ));
        scheduler.set_param("queue_capacity", "12").unwrap();
        assert_eq!(scheduler.get_param("queue_capacity").unwrap(), "12");
    }

    #[test]
    fn shutdown_discards_and_accounts_everything() {
        let (scheduler, _, _, _) = build(SchedulerConfig::default());
        for hash in 0..20 {
            scheduler.classify_and_route(packet(hash, Cluster::Little), 0);
        }
        assert_eq!(scheduler.shutdown(), 20);
        for worker in 0..scheduler.worker_count() {
            let c = scheduler.worker_stats(worker).unwrap().counters;
            assert_eq!(c.enqueued, c.processed + c.dropped + c.ignored + c.transferred + c.queued);
            assert_eq!(c.queued, 0);
        }
    }

    #[test]
    fn unknown_workers_are_reported() {
        let (scheduler, _, _, _) = build(SchedulerConfig::default());
        assert!(matches!(
            scheduler.worker_stats(17),
            Err(SchedulerError::UnknownWorker(17))
        ));
        assert_eq!(scheduler.poll(17, 8), 0);
        assert_eq!(
            scheduler.enqueue(17, packet(1, Cluster::Big), 0),
            EnqueueOutcome::Dropped
        );
    }
}
