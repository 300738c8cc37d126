//! Per-worker receive queue and its cooperative poller.
//!
//! Each worker owns two queues:
//! - **inbound**: the producer side. Classification pushes here under a short mutex.
//! - **process**: the consumer side. The poller swaps inbound into it in O(1) and delivers from it
//!   without touching the producer lock.
//!
//! Two positions track progress through the queue. `tail` counts packets ever accepted into
//! inbound; `head` counts packets that left the queue for good (delivered, transferred to another
//! worker, or discarded). `head` advances only *after* delivery, so `head >= n` means the first `n`
//! accepted packets are out of the worker's hands. The migration engine uses this as its barrier.
//!
//! Lock order: `process` before `inbound`. Nothing holds `inbound` while taking another lock.

use crate::cluster::WorkerId;
use crate::packet::Packet;
use crate::scheduler::gro;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

/// One (possibly coalesced) batch handed downstream: consecutive packets of a single flow.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub flow_hash: u64,
    pub packets: Vec<Packet>,
}

impl Delivery {
    pub fn segments(&self) -> usize {
        self.packets.len()
    }
}

/// Downstream consumer of delivered packets (the protocol stack, in a real deployment).
///
/// `deliver` runs on the polling thread while the worker's process queue is held: it must not call
/// back into [`poll`](crate::scheduler::Scheduler::poll) or hotplug operations for the same worker.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, worker: WorkerId, delivery: Delivery);
}

/// Why a worker is being woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeKind {
    /// Receive poller armed from the worker's own thread.
    Local,
    /// Receive poller armed from another worker; queued for delivery on the target.
    Remote,
    /// Migration poller has entries that may be ready.
    Migration,
}

/// Signal path from the scheduler to whatever executes the pollers.
pub trait WakeSink: Send + Sync {
    fn wake(&self, worker: WorkerId, kind: WakeKind);
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle = 0,
    Scheduled = 1,
    Polling = 2,
}

impl PollState {
    fn from_u8(value: u8) -> PollState {
        match value {
            1 => PollState::Scheduled,
            2 => PollState::Polling,
            _ => PollState::Idle,
        }
    }
}

/// Result of pushing one packet.
#[derive(Debug)]
pub(crate) enum PushOne {
    /// `armed` is set when this push moved the poller `Idle -> Scheduled`; the caller must wake it.
    Accepted { armed: bool },
    Dropped,
    /// The worker is offline; the packet is handed back for staging.
    Offline(Packet),
}

/// What one poll pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub delivered: usize,
    /// Quota ran out with work left; the poller is `Scheduled` again and needs a wake.
    pub rearmed: bool,
    /// `head` crossed the smallest pending migration threshold of this worker.
    pub migration_ready: bool,
}

struct Inbound {
    packets: VecDeque<Packet>,
    offline: bool,
}

pub struct WorkerQueue {
    id: WorkerId,
    inbound: Mutex<Inbound>,
    process: Mutex<VecDeque<Packet>>,
    state: AtomicU8,
    offline: AtomicBool,
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    /// Smallest threshold among this worker's pending migrations (`u64::MAX` when none).
    migration_watermark: AtomicU64,
    enqueued: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    ignored: AtomicU64,
    transferred: AtomicU64,
    local_wakes: AtomicU64,
    remote_wakes: AtomicU64,
}

/// Counter view of one worker queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub processed: u64,
    pub dropped: u64,
    pub ignored: u64,
    pub transferred: u64,
    pub queued: u64,
    pub local_wakes: u64,
    pub remote_wakes: u64,
}

impl WorkerQueue {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            inbound: Mutex::new(Inbound {
                packets: VecDeque::new(),
                offline: false,
            }),
            process: Mutex::new(VecDeque::new()),
            state: AtomicU8::new(PollState::Idle as u8),
            offline: AtomicBool::new(false),
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            migration_watermark: AtomicU64::new(u64::MAX),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            local_wakes: AtomicU64::new(0),
            remote_wakes: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> PollState {
        PollState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Packets ever accepted into inbound.
    pub fn tail_position(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Packets that left the queue for good.
    pub fn head_position(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Tail read under the producer lock, so no push is half-accounted.
    pub(crate) fn decision_point(&self) -> u64 {
        let _inbound = self.inbound.lock();
        self.tail.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> u64 {
        self.tail_position().saturating_sub(self.head_position())
    }

    /// Arm the poller; only valid while the inbound lock is held.
    fn arm(&self) -> bool {
        self.state
            .compare_exchange(
                PollState::Idle as u8,
                PollState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn push_one(&self, packet: Packet, capacity: usize) -> PushOne {
        let mut inbound = self.inbound.lock();
        if inbound.offline {
            return PushOne::Offline(packet);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if inbound.packets.len() >= capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return PushOne::Dropped;
        }
        let was_empty = inbound.packets.is_empty();
        inbound.packets.push_back(packet);
        self.tail.fetch_add(1, Ordering::Release);
        let armed = was_empty && self.arm();
        PushOne::Accepted { armed }
    }

    /// Push a batch that was already accepted elsewhere, ignoring the capacity ceiling.
    ///
    /// Returns whether the poller was armed, or hands the batch back if the worker is offline.
    pub(crate) fn push_all(&self, packets: Vec<Packet>) -> Result<bool, Vec<Packet>> {
        if packets.is_empty() {
            return Ok(false);
        }
        let mut inbound = self.inbound.lock();
        if inbound.offline {
            return Err(packets);
        }
        let count = packets.len() as u64;
        let was_empty = inbound.packets.is_empty();
        inbound.packets.extend(packets);
        self.enqueued.fetch_add(count, Ordering::Relaxed);
        self.tail.fetch_add(count, Ordering::Release);
        Ok(was_empty && self.arm())
    }

    /// Account a packet refused before it reached the queue (full flow table, full pending buffer).
    pub(crate) fn record_refused(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Account packets that arrived for this worker and were discarded without being queued.
    pub(crate) fn record_discarded_arrivals(&self, count: u64) {
        self.enqueued.fetch_add(count, Ordering::Relaxed);
        self.ignored.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_wake(&self, kind: WakeKind) {
        match kind {
            WakeKind::Local => self.local_wakes.fetch_add(1, Ordering::Relaxed),
            WakeKind::Remote => self.remote_wakes.fetch_add(1, Ordering::Relaxed),
            WakeKind::Migration => 0,
        };
    }

    pub(crate) fn lower_watermark(&self, threshold: u64) {
        self.migration_watermark
            .fetch_min(threshold, Ordering::AcqRel);
    }

    pub(crate) fn set_watermark(&self, threshold: u64) {
        self.migration_watermark.store(threshold, Ordering::Release);
    }

    fn retire(&self, count: u64) -> bool {
        let head = self.head.fetch_add(count, Ordering::AcqRel) + count;
        head >= self.migration_watermark.load(Ordering::Acquire)
    }

    /// Run one poll pass delivering at most `quota` packets.
    ///
    /// `deliver` receives batches of consecutive same-flow packets of at most `max_segments`
    /// (`1` disables coalescing). Offline is a cancellation point: whatever is still queued stays
    /// for the hotplug drain.
    pub(crate) fn poll(
        &self,
        quota: usize,
        max_segments: usize,
        mut deliver: impl FnMut(Delivery),
    ) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        let mut process = self.process.lock();
        if self
            .state
            .compare_exchange(
                PollState::Scheduled as u8,
                PollState::Polling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return outcome;
        }

        loop {
            if self.is_offline() {
                self.state.store(PollState::Idle as u8, Ordering::Release);
                return outcome;
            }
            if process.is_empty() {
                let mut inbound = self.inbound.lock();
                if inbound.packets.is_empty() {
                    // Going idle under the producer lock: a concurrent push either landed before
                    // this check or will see `Idle` and arm.
                    self.state.store(PollState::Idle as u8, Ordering::Release);
                    return outcome;
                }
                mem::swap(&mut *process, &mut inbound.packets);
                continue;
            }
            if outcome.delivered >= quota {
                self.state
                    .store(PollState::Scheduled as u8, Ordering::Release);
                outcome.rearmed = true;
                return outcome;
            }

            let limit = max_segments.max(1).min(quota - outcome.delivered);
            let Some(delivery) = gro::take_batch(&mut process, limit) else {
                continue;
            };
            let count = delivery.segments();
            deliver(delivery);
            self.processed.fetch_add(count as u64, Ordering::Relaxed);
            outcome.delivered += count;
            if self.retire(count as u64) {
                outcome.migration_ready = true;
            }
        }
    }

    /// Mark the worker offline and take everything it still holds, in arrival order.
    ///
    /// Waits for an in-flight poll by taking the process queue. The packets are retired from this
    /// queue but not yet counted; the caller decides between `transferred` and `ignored`.
    pub(crate) fn take_offline(&self) -> Vec<Packet> {
        {
            let mut inbound = self.inbound.lock();
            inbound.offline = true;
            self.offline.store(true, Ordering::Release);
        }
        let mut process = self.process.lock();
        let mut inbound = self.inbound.lock();
        let mut holding: Vec<Packet> = process.drain(..).collect();
        holding.extend(inbound.packets.drain(..));
        self.state.store(PollState::Idle as u8, Ordering::Release);
        holding
    }

    /// Drain everything without changing the offline flag (shutdown).
    pub(crate) fn take_all(&self) -> Vec<Packet> {
        let mut process = self.process.lock();
        let mut inbound = self.inbound.lock();
        let mut holding: Vec<Packet> = process.drain(..).collect();
        holding.extend(inbound.packets.drain(..));
        self.state.store(PollState::Idle as u8, Ordering::Release);
        holding
    }

    pub(crate) fn record_transferred(&self, count: u64) -> bool {
        self.transferred.fetch_add(count, Ordering::Relaxed);
        self.retire(count)
    }

    pub(crate) fn record_ignored(&self, count: u64) -> bool {
        self.ignored.fetch_add(count, Ordering::Relaxed);
        self.retire(count)
    }

    /// Clear the offline flag, queueing `staged` ahead of anything pushed afterwards.
    pub(crate) fn bring_online(&self, staged: Vec<Packet>) -> bool {
        let mut inbound = self.inbound.lock();
        inbound.offline = false;
        self.offline.store(false, Ordering::Release);
        if staged.is_empty() {
            return false;
        }
        let count = staged.len() as u64;
        let was_empty = inbound.packets.is_empty();
        inbound.packets.extend(staged);
        self.enqueued.fetch_add(count, Ordering::Relaxed);
        self.tail.fetch_add(count, Ordering::Release);
        was_empty && self.arm()
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            transferred: self.transferred.load(Ordering::Relaxed),
            queued: self.queued(),
            local_wakes: self.local_wakes.load(Ordering::Relaxed),
            remote_wakes: self.remote_wakes.load(Ordering::Relaxed),
        }
    }
}
