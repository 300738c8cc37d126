//! Fixed-size circular log of flow lifecycle events.
//!
//! Writers overwrite the oldest entry once the ring is full; readers take an ordered copy.
//! The ring is diagnostics only: nothing in the scheduler reads it back to make decisions.

use crate::cluster::{Cluster, WorkerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default number of retained events.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// Cluster-transition class of a completed migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionClass {
    LittleToLittle,
    LittleToBig,
    BigToLittle,
    BigToBig,
}

impl TransitionClass {
    pub const ALL: [TransitionClass; 4] = [
        TransitionClass::LittleToLittle,
        TransitionClass::LittleToBig,
        TransitionClass::BigToLittle,
        TransitionClass::BigToBig,
    ];

    /// Classify a move between clusters; mid counts as little.
    pub fn between(from: Cluster, to: Cluster) -> TransitionClass {
        match (from.is_big(), to.is_big()) {
            (false, false) => TransitionClass::LittleToLittle,
            (false, true) => TransitionClass::LittleToBig,
            (true, false) => TransitionClass::BigToLittle,
            (true, true) => TransitionClass::BigToBig,
        }
    }

    pub const fn index(self) -> usize {
        match self {
            TransitionClass::LittleToLittle => 0,
            TransitionClass::LittleToBig => 1,
            TransitionClass::BigToLittle => 2,
            TransitionClass::BigToBig => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEventKind {
    Created,
    Migrated {
        from: WorkerId,
        to: WorkerId,
        class: TransitionClass,
    },
    Removed,
    Dropped,
    Redirected {
        from: WorkerId,
        to: WorkerId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Monotonic sequence number across the ring's lifetime.
    pub seq: u64,
    pub at_ns: u64,
    pub flow_hash: u64,
    pub worker: WorkerId,
    pub kind: FlowEventKind,
}

struct RingInner {
    slots: Vec<Option<FlowEvent>>,
    next_seq: u64,
}

pub struct DebugRing {
    inner: Mutex<RingInner>,
}

impl DebugRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(RingInner {
                slots: vec![None; capacity],
                next_seq: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn record(&self, at_ns: u64, flow_hash: u64, worker: WorkerId, kind: FlowEventKind) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        let slot = (seq % inner.slots.len() as u64) as usize;
        inner.slots[slot] = Some(FlowEvent {
            seq,
            at_ns,
            flow_hash,
            worker,
            kind,
        });
        inner.next_seq = seq + 1;
    }

    /// Total events ever recorded, including overwritten ones.
    pub fn recorded(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Retained events, oldest first.
    pub fn snapshot(&self) -> Vec<FlowEvent> {
        let inner = self.inner.lock();
        let len = inner.slots.len() as u64;
        let start = inner.next_seq.saturating_sub(len);
        (start..inner.next_seq)
            .filter_map(|seq| inner.slots[(seq % len) as usize])
            .collect()
    }
}

impl Default for DebugRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_latest_events_in_order() {
        let ring = DebugRing::new(3);
        for hash in 0..5u64 {
            ring.record(hash * 10, hash, 0, FlowEventKind::Created);
        }
        let events = ring.snapshot();
        assert_eq!(ring.recorded(), 5);
        assert_eq!(
            events.iter().map(|e| e.flow_hash).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(events[0].seq, 2);
    }

    #[test]
    fn partially_filled_ring_returns_only_written_slots() {
        let ring = DebugRing::new(8);
        ring.record(1, 7, 2, FlowEventKind::Dropped);
        let events = ring.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FlowEventKind::Dropped);
    }

    #[test]
    fn transitions_treat_mid_as_little() {
        assert_eq!(
            TransitionClass::between(Cluster::Mid, Cluster::Big),
            TransitionClass::LittleToBig
        );
        assert_eq!(
            TransitionClass::between(Cluster::Big, Cluster::Little),
            TransitionClass::BigToLittle
        );
    }
}
