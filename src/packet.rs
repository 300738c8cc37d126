//! Packet handle as handed to the scheduler by the receive path.

use crate::cluster::Cluster;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static PACKET_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Maximum payload size carried by a handle (standard Ethernet MTU).
pub const MAX_PACKET_SIZE: usize = 1500;

/// Already-parsed packet travelling through the scheduler.
///
/// The receive path computes the flow hash and the cluster hint before classification; MCPS only
/// decides which worker processes the packet. Payload bytes are shared, so cloning a handle does
/// not copy data.
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub flow_hash: u64,
    pub cluster_hint: Cluster,
    /// Destination address/port, captured into the flow record for diagnostics.
    pub destination: Option<SocketAddr>,
    payload: Arc<[u8]>,
    pub timestamp: Instant,
}

impl Packet {
    pub fn new(flow_hash: u64, cluster_hint: Cluster, payload: &[u8]) -> Packet {
        let len = payload.len().min(MAX_PACKET_SIZE);
        Packet {
            id: PACKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            flow_hash,
            cluster_hint,
            destination: None,
            payload: Arc::from(&payload[..len]),
            timestamp: Instant::now(),
        }
    }

    /// Attach the destination tuple recorded on the flow's first packet.
    pub fn with_destination(mut self, destination: SocketAddr) -> Packet {
        self.destination = Some(destination);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_are_unique_and_payload_is_capped() {
        let big = vec![7u8; MAX_PACKET_SIZE + 100];
        let a = Packet::new(42, Cluster::Little, &big);
        let b = Packet::new(42, Cluster::Little, &[1, 2, 3]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.len(), MAX_PACKET_SIZE);
        assert_eq!(b.payload(), &[1, 2, 3]);
    }

    #[test]
    fn destination_is_optional() {
        let p = Packet::new(1, Cluster::Big, &[]);
        assert!(p.destination.is_none());
        let p = p.with_destination("10.0.0.1:443".parse().unwrap());
        assert_eq!(p.destination.map(|d| d.port()), Some(443));
        assert!(p.is_empty());
    }
}
