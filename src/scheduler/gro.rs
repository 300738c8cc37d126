//! Receive aggregation: coalesce consecutive packets of one flow into a single delivery.
//!
//! Only runs of the *same* flow at the head of the process queue are merged, so per-flow order and
//! the interleaving between flows are both preserved.

use crate::packet::Packet;
use crate::scheduler::rx_queue::Delivery;
use std::collections::VecDeque;

/// Pop the next batch: the head packet plus up to `max_segments - 1` followers of the same flow.
pub(crate) fn take_batch(queue: &mut VecDeque<Packet>, max_segments: usize) -> Option<Delivery> {
    let first = queue.pop_front()?;
    let flow_hash = first.flow_hash;
    let mut packets = Vec::with_capacity(max_segments.clamp(1, 64));
    packets.push(first);
    while packets.len() < max_segments {
        match queue.front() {
            Some(next) if next.flow_hash == flow_hash => {
                if let Some(next) = queue.pop_front() {
                    packets.push(next);
                }
            }
            _ => break,
        }
    }
    Some(Delivery { flow_hash, packets })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;

    fn queue(hashes: &[u64]) -> VecDeque<Packet> {
        hashes
            .iter()
            .map(|&h| Packet::new(h, Cluster::Big, &[1]))
            .collect()
    }

    #[test]
    fn batch_stops_at_flow_boundary() {
        let mut q = queue(&[1, 1, 2, 1]);
        let batch = take_batch(&mut q, 8).unwrap();
        assert_eq!((batch.flow_hash, batch.segments()), (1, 2));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn batch_respects_segment_limit() {
        let mut q = queue(&[5; 10]);
        let batch = take_batch(&mut q, 4).unwrap();
        assert_eq!(batch.segments(), 4);
        let ids: Vec<u64> = batch.packets.iter().map(|p| p.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn single_segment_disables_coalescing() {
        let mut q = queue(&[3, 3]);
        assert_eq!(take_batch(&mut q, 1).unwrap().segments(), 1);
        assert!(take_batch(&mut VecDeque::new(), 4).is_none());
    }
}
