//! Worker hotplug: taking a worker offline and back online without losing or reordering packets.
//!
//! Every worker has a staging queue with a control value. While a worker is offline, packets that
//! still target it land in staging (`Accepting`) until a replacement is chosen; afterwards the
//! control is `RedirectTo(replacement)` and they follow the redirect. Staged packets are flushed to
//! the replacement right after the packets the worker was still holding, and before the redirect is
//! published, so arrival order survives the hand-over. A worker that left while nothing else was
//! online keeps `Accepting` until some worker comes back; that worker then adopts its staging.

use super::{EnqueueOutcome, Scheduler};
use crate::cluster::{Cluster, WorkerId, WorkerMask};
use crate::error::SchedulerError;
use crate::packet::Packet;
use crate::scheduler::affinity;
use crate::scheduler::debug_ring::FlowEventKind;
use crate::scheduler::gro;
use crate::scheduler::rx_queue::WakeKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Redirects followed before a packet is parked in staging instead.
pub const MAX_REDIRECT_HOPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "worker", rename_all = "snake_case")]
pub enum StagingControl {
    Accepting,
    RedirectTo(WorkerId),
}

#[derive(Debug)]
struct StagingInner {
    control: StagingControl,
    packets: VecDeque<Packet>,
}

#[derive(Debug)]
pub(crate) struct StagingQueue {
    inner: Mutex<StagingInner>,
}

impl StagingQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StagingInner {
                control: StagingControl::Accepting,
                packets: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn control(&self) -> StagingControl {
        self.inner.lock().control
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub(crate) fn take(&self) -> Vec<Packet> {
        self.inner.lock().packets.drain(..).collect()
    }
}

impl Scheduler {
    /// Where a packet refused by offline `worker` should go next, if anywhere.
    fn next_hop(&self, worker: WorkerId, control: StagingControl) -> Option<WorkerId> {
        match control {
            StagingControl::RedirectTo(next) => Some(next),
            // Came back online between the refused push and taking the staging lock.
            StagingControl::Accepting if !self.queues[worker].is_offline() => Some(worker),
            StagingControl::Accepting => None,
        }
    }

    pub(crate) fn stage(
        &self,
        worker: WorkerId,
        origin: WorkerId,
        packet: Packet,
        from: WorkerId,
        hops: usize,
    ) -> EnqueueOutcome {
        let mut staging = self.staging[worker].inner.lock();
        match self.next_hop(worker, staging.control) {
            Some(next) if hops < MAX_REDIRECT_HOPS => {
                drop(staging);
                self.enqueue_hops(next, origin, packet, from, hops + 1)
            }
            _ => {
                staging.packets.push_back(packet);
                EnqueueOutcome::Staged
            }
        }
    }

    /// Move already-accepted packets to `worker`, bypassing the capacity ceiling.
    pub(crate) fn transfer(
        &self,
        worker: WorkerId,
        packets: Vec<Packet>,
        from: WorkerId,
        hops: usize,
    ) {
        let packets = match self.queues[worker].push_all(packets) {
            Ok(armed) => {
                if armed {
                    self.wake_receive(worker, from);
                }
                return;
            }
            Err(packets) => packets,
        };
        let mut staging = self.staging[worker].inner.lock();
        match self.next_hop(worker, staging.control) {
            Some(next) if hops < MAX_REDIRECT_HOPS => {
                drop(staging);
                self.transfer(next, packets, from, hops + 1);
            }
            _ => staging.packets.extend(packets),
        }
    }

    /// Least-loaded online big worker, then least-loaded online worker of any cluster.
    fn choose_replacement(&self, leaving: WorkerId) -> Option<WorkerId> {
        let online = self.topology.online().without(leaving);
        let big = self.topology.members(Cluster::Big).and(online);
        let candidates = if big.is_empty() { online } else { big };
        let least = candidates
            .iter()
            .map(|worker| self.queues[worker].queued())
            .min()?;
        let tied = candidates
            .iter()
            .filter(|&worker| self.queues[worker].queued() == least)
            .fold(WorkerMask::EMPTY, |mask, worker| mask.with(worker));
        affinity::pick_from(tied, leaving as u64)
    }

    /// Take `worker` offline. Returns `false` if it already was.
    pub fn worker_offline(&self, worker: WorkerId) -> Result<bool, SchedulerError> {
        self.check_worker(worker)?;
        let _hotplug = self.hotplug.lock();
        if !self.topology.is_online(worker) {
            return Ok(false);
        }
        self.topology.set_online(worker, false);
        let queue = &self.queues[worker];
        let holding = queue.take_offline();
        let held = holding.len() as u64;

        let Some(replacement) = self.choose_replacement(worker) else {
            queue.record_ignored(held);
            let mut holding: VecDeque<Packet> = holding.into();
            while let Some(delivery) = gro::take_batch(&mut holding, 1) {
                self.sink.deliver(worker, delivery);
            }
            // The source is fully retired; its migrations can complete right away.
            let completed = self.poll_migrations(worker, usize::MAX);
            warn!(
                worker,
                ignored = held,
                completed,
                "worker offline with no replacement, held packets processed locally"
            );
            return Ok(true);
        };

        queue.record_transferred(held);
        self.transfer(replacement, holding, worker, 0);
        let (staged, rehomed, moved) = self.hand_over(worker, replacement);
        info!(
            worker,
            replacement,
            transferred = held,
            staged,
            rehomed,
            migrations = moved,
            "worker offline"
        );
        Ok(true)
    }

    /// Flush `from`'s staging into `to` and publish the redirect, then move its flows and
    /// migrations over. Returns (staged, rehomed, migrations moved).
    fn hand_over(&self, from: WorkerId, to: WorkerId) -> (usize, usize, usize) {
        let staged = {
            let mut staging = self.staging[from].inner.lock();
            let staged: Vec<Packet> = staging.packets.drain(..).collect();
            let count = staged.len();
            match self.queues[to].push_all(staged) {
                Ok(true) => self.wake_receive(to, from),
                Ok(false) => {}
                Err(rest) => staging.packets.extend(rest),
            }
            staging.control = StagingControl::RedirectTo(to);
            count
        };

        let rehomed = self.rehome_flows(from, to);
        let moved = self.retarget_migrations(from, to);
        if moved > 0 {
            self.waker.wake(to, WakeKind::Migration);
        }
        (staged, rehomed, moved)
    }

    fn rehome_flows(&self, from: WorkerId, to: WorkerId) -> usize {
        let now = self.clock.now_ns();
        let mut rehomed = 0;
        self.flows.for_each(|flow| {
            if flow.worker() != from {
                return;
            }
            let _transit = flow.transit.lock();
            if flow.worker() == from {
                flow.set_worker(to);
                self.ring
                    .record(now, flow.hash(), to, FlowEventKind::Redirected { from, to });
                rehomed += 1;
            }
        });
        rehomed
    }

    /// Re-point pending migrations that involve the departing worker.
    fn retarget_migrations(&self, from: WorkerId, to: WorkerId) -> usize {
        let entries = self.pending[from].take_all(&self.queues[from]);
        let moved = entries.len();
        if moved > 0 {
            // The departing worker's backlog now sits in `to`, below this position.
            let threshold = self.queues[to].decision_point();
            for mut entry in entries {
                entry.source = to;
                entry.threshold = threshold;
                self.pending[to].push(entry, &self.queues[to]);
            }
        }
        for pending in self.pending.iter() {
            for flow in pending.retarget(from, to) {
                let mut transit = flow.transit.lock();
                if transit.migrating {
                    transit.target = Some(to);
                }
                debug!(hash = flow.hash(), from, to, "migration retargeted");
            }
        }
        moved
    }

    /// Bring `worker` back. Returns `false` if it already was online.
    pub fn worker_online(&self, worker: WorkerId) -> Result<bool, SchedulerError> {
        self.check_worker(worker)?;
        let _hotplug = self.hotplug.lock();
        if self.topology.is_online(worker) {
            return Ok(false);
        }
        let flushed = {
            let mut staging = self.staging[worker].inner.lock();
            let staged: Vec<Packet> = staging.packets.drain(..).collect();
            let count = staged.len();
            if self.queues[worker].bring_online(staged) {
                self.wake_receive(worker, worker);
            }
            staging.control = StagingControl::Accepting;
            count
        };
        self.topology.set_online(worker, true);
        info!(worker, flushed, "worker online");

        // Workers that left while nothing else was online never got a replacement.
        for orphan in 0..self.queues.len() {
            if orphan == worker
                || self.topology.is_online(orphan)
                || self.staging[orphan].control() != StagingControl::Accepting
            {
                continue;
            }
            let (staged, rehomed, moved) = self.hand_over(orphan, worker);
            info!(
                worker = orphan,
                replacement = worker,
                staged,
                rehomed,
                migrations = moved,
                "offline worker adopted"
            );
        }
        Ok(true)
    }
}
