//! Order-preserving flow migration.
//!
//! A migration is decided at one instant and completed later:
//!
//! 1. **Decision** (`submit_migration`): under the flow's transit lock the flow is marked
//!    `migrating` and the source queue's tail position is captured as the threshold. Every packet
//!    of the flow accepted before that instant sits below the threshold.
//! 2. **Parking**: while `migrating` is set, the classifier appends new packets to the flow's
//!    pending buffer instead of any receive queue. Lookups still report the source worker.
//! 3. **Completion** (`poll_migrations`): once the source's head position reaches the threshold,
//!    every pre-decision packet has been delivered. The buffer moves to the target's inbound queue,
//!    the assignment flips and `migrating` clears, all under the transit lock, so the next packet
//!    classified lands behind the buffered ones.
//!
//! The rebalancer (`rebalance`) feeds this engine with heavy/light flow moves.

use super::Scheduler;
use crate::cluster::{Cluster, WorkerId};
use crate::packet::Packet;
use crate::scheduler::debug_ring::{FlowEventKind, TransitionClass};
use crate::scheduler::flow_table::FlowRef;
use crate::scheduler::rx_queue::{WakeKind, WorkerQueue};
use crate::error::SchedulerError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Requested,
    /// The flow already runs on the target.
    Noop,
    /// Another migration of the flow is in flight.
    AlreadyPending,
    /// The target is offline.
    Rejected,
}

/// Completed migrations per cluster-transition class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionCounts {
    pub little_to_little: u64,
    pub little_to_big: u64,
    pub big_to_little: u64,
    pub big_to_big: u64,
}

impl TransitionCounts {
    pub fn from_fn(mut f: impl FnMut(TransitionClass) -> u64) -> Self {
        Self {
            little_to_little: f(TransitionClass::LittleToLittle),
            little_to_big: f(TransitionClass::LittleToBig),
            big_to_little: f(TransitionClass::BigToLittle),
            big_to_big: f(TransitionClass::BigToBig),
        }
    }

    pub fn get(&self, class: TransitionClass) -> u64 {
        match class {
            TransitionClass::LittleToLittle => self.little_to_little,
            TransitionClass::LittleToBig => self.little_to_big,
            TransitionClass::BigToLittle => self.big_to_little,
            TransitionClass::BigToBig => self.big_to_big,
        }
    }

    pub fn total(&self) -> u64 {
        TransitionClass::ALL.iter().map(|class| self.get(*class)).sum()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PendingMigration {
    pub(crate) flow: FlowRef,
    pub(crate) source: WorkerId,
    pub(crate) target: WorkerId,
    /// Source head position that must be reached before the flip.
    pub(crate) threshold: u64,
    pub(crate) requested_ns: u64,
}

/// Pending migrations whose source is one worker.
#[derive(Debug, Default)]
pub(crate) struct MigrationQueue {
    entries: Mutex<Vec<PendingMigration>>,
}

impl MigrationQueue {
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn push(&self, entry: PendingMigration, source: &WorkerQueue) {
        let mut entries = self.entries.lock();
        source.lower_watermark(entry.threshold);
        entries.push(entry);
    }

    /// Remove up to `budget` entries whose threshold is reached, oldest first.
    ///
    /// Returns them with a flag telling whether more ready entries were left behind.
    pub(crate) fn take_ready(
        &self,
        source: &WorkerQueue,
        budget: usize,
    ) -> (Vec<PendingMigration>, bool) {
        let mut entries = self.entries.lock();
        let head = source.head_position();
        let mut ready = Vec::new();
        let mut more = false;
        entries.retain(|entry| {
            if entry.threshold > head {
                return true;
            }
            if ready.len() < budget {
                ready.push(entry.clone());
                false
            } else {
                more = true;
                true
            }
        });
        let watermark = entries
            .iter()
            .map(|entry| entry.threshold)
            .min()
            .unwrap_or(u64::MAX);
        source.set_watermark(watermark);
        (ready, more)
    }

    pub(crate) fn take_all(&self, source: &WorkerQueue) -> Vec<PendingMigration> {
        let mut entries = self.entries.lock();
        source.set_watermark(u64::MAX);
        std::mem::take(&mut *entries)
    }

    /// Point entries targeting `from` at `to`; returns the affected flows.
    pub(crate) fn retarget(&self, from: WorkerId, to: WorkerId) -> Vec<FlowRef> {
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .filter(|entry| entry.target == from)
            .map(|entry| {
                entry.target = to;
                entry.flow.clone()
            })
            .collect()
    }
}

impl Scheduler {
    /// Ask for the flow `hash` to move to `target`.
    pub fn request_migration(
        &self,
        hash: u64,
        target: WorkerId,
    ) -> Result<MigrationOutcome, SchedulerError> {
        self.check_worker(target)?;
        let flow = self
            .flows
            .lookup(hash)
            .ok_or(SchedulerError::UnknownFlow(hash))?;
        Ok(self.submit_migration(&flow, target))
    }

    pub(crate) fn submit_migration(&self, flow: &FlowRef, target: WorkerId) -> MigrationOutcome {
        if !self.topology.is_online(target) {
            debug!(hash = flow.hash(), target, "migration to offline worker rejected");
            return MigrationOutcome::Rejected;
        }
        let mut transit = flow.transit.lock();
        if transit.migrating {
            return MigrationOutcome::AlreadyPending;
        }
        let source = flow.worker();
        if source == target {
            debug!(hash = flow.hash(), worker = target, "flow already on target");
            return MigrationOutcome::Noop;
        }
        let threshold = self.queues[source].decision_point();
        transit.migrating = true;
        transit.target = Some(target);
        self.pending[source].push(
            PendingMigration {
                flow: flow.clone(),
                source,
                target,
                threshold,
                requested_ns: self.clock.now_ns(),
            },
            &self.queues[source],
        );
        drop(transit);

        debug!(hash = flow.hash(), source, target, threshold, "migration requested");
        self.waker.wake(source, WakeKind::Migration);
        MigrationOutcome::Requested
    }

    /// Complete up to `budget` migrations whose source is `worker`. Returns the number completed.
    pub fn poll_migrations(&self, worker: WorkerId, budget: usize) -> usize {
        let Some(queue) = self.queues.get(worker) else {
            return 0;
        };
        let (ready, more) = self.pending[worker].take_ready(queue, budget.max(1));
        let completed = ready.len();
        for entry in ready {
            self.complete_migration(entry);
        }
        if more {
            self.waker.wake(worker, WakeKind::Migration);
        }
        completed
    }

    fn complete_migration(&self, entry: PendingMigration) {
        let now = self.clock.now_ns();
        let flow = &entry.flow;
        let mut transit = flow.transit.lock();
        let target = transit.target.take().unwrap_or(entry.target);
        let buffered: Vec<Packet> = transit.buffer.drain(..).collect();
        let parked = buffered.len();
        let from = flow.worker();
        self.transfer(target, buffered, entry.source, 0);
        flow.set_worker(target);
        transit.migrating = false;
        drop(transit);

        if from == target {
            return;
        }
        let class = TransitionClass::between(
            self.topology.cluster_of(from),
            self.topology.cluster_of(target),
        );
        flow.record_migration(class);
        self.transitions[class.index()].fetch_add(1, Ordering::Relaxed);
        self.ring.record(
            now,
            flow.hash(),
            target,
            FlowEventKind::Migrated {
                from,
                to: target,
                class,
            },
        );
        debug!(
            hash = flow.hash(),
            from,
            to = target,
            parked,
            waited_ns = now.saturating_sub(entry.requested_ns),
            "migration completed"
        );
    }

    /// One bounded pass moving monitored flows between clusters by rate.
    ///
    /// Heavy flows on non-big workers go to the big cluster; light flows on big workers whose hint
    /// is not big go back to their hint cluster. Returns the number of migrations requested.
    pub fn rebalance(&self) -> usize {
        let budget = self.tunables.rebalance_budget();
        if budget == 0 {
            return 0;
        }
        let heavy = self.tunables.heavy_flow_pps();
        let light = self.tunables.light_flow_pps();
        let mut candidates: Vec<(FlowRef, Cluster)> = Vec::new();
        self.flows.for_each(|flow| {
            if candidates.len() >= budget || !flow.is_monitored() {
                return;
            }
            let rate = flow.rate_pps();
            let on_big = self.topology.cluster_of(flow.worker()).is_big();
            if rate > heavy && !on_big {
                candidates.push((flow.clone(), Cluster::Big));
            } else if rate < light && on_big && !flow.cluster_hint().is_big() {
                candidates.push((flow.clone(), flow.cluster_hint()));
            }
        });

        let mut requested = 0;
        for (flow, cluster) in candidates {
            let Some(target) = self.selector.pick_in_cluster(cluster, flow.hash()) else {
                continue;
            };
            if self.submit_migration(&flow, target) == MigrationOutcome::Requested {
                if !cluster.is_big() {
                    flow.set_monitored(false);
                }
                requested += 1;
            }
        }
        if requested > 0 {
            info!(requested, heavy_pps = heavy, light_pps = light, "rebalance pass");
        }
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SchedulerConfig;
    use crate::scheduler::rx_queue::{Delivery, PacketSink, WakeSink};
    use crate::scheduler::RoutingDecision;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Order(Mutex<Vec<(WorkerId, u64)>>);

    impl PacketSink for Order {
        fn deliver(&self, worker: WorkerId, delivery: Delivery) {
            let mut order = self.0.lock();
            order.extend(delivery.packets.iter().map(|p| (worker, p.id)));
        }
    }

    struct NoWake;

    impl WakeSink for NoWake {
        fn wake(&self, _: WorkerId, _: WakeKind) {}
    }

    fn build() -> (Scheduler, Arc<Order>, Arc<ManualClock>) {
        let sink = Arc::new(Order::default());
        let clock = Arc::new(ManualClock::new(1));
        let scheduler = Scheduler::new(
            &SchedulerConfig::default(),
            sink.clone(),
            Arc::new(NoWake),
            clock.clone(),
        )
        .unwrap();
        (scheduler, sink, clock)
    }

    fn send(scheduler: &Scheduler, hash: u64, hint: Cluster) -> u64 {
        let packet = Packet::new(hash, hint, &[0u8; 32]);
        let id = packet.id;
        assert!(matches!(
            scheduler.classify_and_route(packet, 0),
            RoutingDecision::Enqueued(_)
        ));
        id
    }

    #[test]
    fn noop_and_duplicate_requests() {
        let (scheduler, _, _) = build();
        send(&scheduler, 8, Cluster::Little);
        let worker = scheduler.flow_snapshot(8).unwrap().worker;
        assert_eq!(
            scheduler.request_migration(8, worker).unwrap(),
            MigrationOutcome::Noop
        );
        assert_eq!(
            scheduler.request_migration(8, 5).unwrap(),
            MigrationOutcome::Requested
        );
        assert_eq!(
            scheduler.request_migration(8, 4).unwrap(),
            MigrationOutcome::AlreadyPending
        );
        assert!(matches!(
            scheduler.request_migration(9, 4),
            Err(SchedulerError::UnknownFlow(9))
        ));
        assert!(matches!(
            scheduler.request_migration(8, 40),
            Err(SchedulerError::UnknownWorker(40))
        ));
    }

    #[test]
    fn flip_waits_for_the_source_to_drain() {
        let (scheduler, sink, _) = build();
        let mut sent = vec![send(&scheduler, 3, Cluster::Little)];
        let source = scheduler.flow_snapshot(3).unwrap().worker;
        for _ in 0..4 {
            sent.push(send(&scheduler, 3, Cluster::Little));
        }
        scheduler.request_migration(3, 4).unwrap();
        for _ in 0..3 {
            sent.push(send(&scheduler, 3, Cluster::Little));
        }
        // not drained yet: nothing completes and lookups still report the source
        assert_eq!(scheduler.poll_migrations(source, 8), 0);
        assert_eq!(scheduler.flow_snapshot(3).unwrap().worker, source);
        assert!(scheduler.flow_snapshot(3).unwrap().migrating);

        scheduler.poll(source, 2);
        assert_eq!(scheduler.poll_migrations(source, 8), 0);
        scheduler.drain(source);
        assert_eq!(scheduler.poll_migrations(source, 8), 1);
        assert_eq!(scheduler.flow_snapshot(3).unwrap().worker, 4);

        sent.push(send(&scheduler, 3, Cluster::Little));
        scheduler.drain(4);
        let delivered: Vec<u64> = sink.0.lock().iter().map(|(_, id)| *id).collect();
        assert_eq!(delivered, sent);
        assert_eq!(scheduler.transition_counts().little_to_big, 1);
        assert_eq!(scheduler.worker_stats(4).unwrap().counters.enqueued, 4);
    }

    #[test]
    fn offline_targets_are_rejected() {
        let (scheduler, _, _) = build();
        send(&scheduler, 12, Cluster::Little);
        scheduler.worker_offline(5).unwrap();
        assert_eq!(
            scheduler.request_migration(12, 5).unwrap(),
            MigrationOutcome::Rejected
        );
    }

    #[test]
    fn budget_limits_completions_per_pass() {
        let (scheduler, _, _) = build();
        scheduler.set_param("static_mask.little", "0x1").unwrap();
        for hash in 100..103 {
            send(&scheduler, hash, Cluster::Little);
        }
        scheduler.drain(0);
        for hash in 100..103 {
            scheduler.request_migration(hash, 1).unwrap();
        }
        assert_eq!(scheduler.poll_migrations(0, 2), 2);
        assert_eq!(scheduler.poll_migrations(0, 2), 1);
        assert_eq!(scheduler.transition_counts().little_to_little, 3);
    }

    #[test]
    fn rebalance_moves_heavy_flows_to_big_and_light_ones_back() {
        let (scheduler, _, clock) = build();
        scheduler.set_param("monitor_threshold_pps", "10").unwrap();
        scheduler.set_param("heavy_flow_pps", "500").unwrap();
        scheduler.set_param("rate_sample_interval_ms", "100").unwrap();
        for _ in 0..300 {
            send(&scheduler, 77, Cluster::Little);
            clock.advance(Duration::from_micros(500));
        }
        let source = scheduler.flow_snapshot(77).unwrap().worker;
        assert!(scheduler.flow_snapshot(77).unwrap().rate_pps > 500);
        assert_eq!(scheduler.rebalance(), 1);
        scheduler.drain(source);
        scheduler.poll_migrations(source, 8);
        let target = scheduler.flow_snapshot(77).unwrap().worker;
        assert!(scheduler.topology().cluster_of(target).is_big());

        // traffic slows to a trickle
        scheduler.set_param("light_flow_pps", "400").unwrap();
        for _ in 0..20 {
            clock.advance(Duration::from_millis(200));
            send(&scheduler, 77, Cluster::Little);
        }
        assert!(scheduler.flow_snapshot(77).unwrap().rate_pps < 400);
        assert_eq!(scheduler.rebalance(), 1);
        scheduler.drain(target);
        scheduler.poll_migrations(target, 8);
        let back = scheduler.flow_snapshot(77).unwrap().worker;
        assert_eq!(scheduler.topology().cluster_of(back), Cluster::Little);
        let counts = scheduler.transition_counts();
        assert_eq!((counts.little_to_big, counts.big_to_little), (1, 1));
    }
}
