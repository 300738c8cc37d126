//! Metrics snapshots and their TCP publisher.
//!
//! A [`SchedulerSnapshot`] is a consistent-enough, serializable view of the scheduler: per-worker
//! counters, flow population, migration totals and the published affinity configuration. The
//! [`MetricsServer`] samples one at a fixed interval on a tokio task, serializes it to JSON and
//! broadcasts the line to every connected TCP client.

use crate::scheduler::{AffinityConfig, QueueCounters, Scheduler, TransitionCounts, WorkerStats};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub timestamp_ns: u64,
    pub workers: Vec<WorkerStats>,
    pub flow_count: usize,
    pub monitored_flows: usize,
    pub migrating_flows: usize,
    pub pending_migrations: usize,
    pub local_fallbacks: u64,
    pub transitions: TransitionCounts,
    pub affinity: AffinityConfig,
    pub events_recorded: u64,
}

impl SchedulerSnapshot {
    /// Counters summed over all workers.
    pub fn totals(&self) -> QueueCounters {
        self.workers
            .iter()
            .fold(QueueCounters::default(), |mut acc, worker| {
                let c = &worker.counters;
                acc.enqueued += c.enqueued;
                acc.processed += c.processed;
                acc.dropped += c.dropped;
                acc.ignored += c.ignored;
                acc.transferred += c.transferred;
                acc.queued += c.queued;
                acc.local_wakes += c.local_wakes;
                acc.remote_wakes += c.remote_wakes;
                acc
            })
    }
}

/// Streams newline-delimited JSON snapshots to TCP subscribers.
pub struct MetricsServer {
    scheduler: Arc<Scheduler>,
    running: Arc<AtomicBool>,
    interval: Duration,
}

impl MetricsServer {
    pub fn new(scheduler: Arc<Scheduler>, running: Arc<AtomicBool>, interval: Duration) -> Self {
        Self {
            scheduler,
            running,
            interval,
        }
    }

    /// Bind `bind_addr` and spawn the publisher and acceptor tasks on the current tokio runtime.
    ///
    /// Returns the bound address (useful with port `0`). Both tasks stop once `running` clears.
    pub async fn start(&self, bind_addr: &str) -> Result<SocketAddr, Box<dyn Error>> {
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let (tx, _) = broadcast::channel::<String>(100);
        let metrics_tx = tx.clone();
        let scheduler = self.scheduler.clone();
        let running_publisher = self.running.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            while running_publisher.load(Ordering::Relaxed) {
                ticker.tick().await;
                let snapshot = scheduler.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => {
                        // No subscribers is not an error.
                        let _ = metrics_tx.send(format!("{json}\n"));
                    }
                    Err(e) => warn!(error = %e, "failed to serialize metrics snapshot"),
                }
            }
        });

        let running_accept = self.running.clone();
        let check = self.interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            while running_accept.load(Ordering::Relaxed) {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!(%addr, "metrics subscriber connected");
                                let mut rx = tx.subscribe();
                                tokio::spawn(async move {
                                    let mut stream = stream;
                                    loop {
                                        match rx.recv().await {
                                            Ok(json) => {
                                                if stream.write_all(json.as_bytes()).await.is_err() {
                                                    break;
                                                }
                                            }
                                            // Slow reader: skip what it missed.
                                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                            Err(broadcast::error::RecvError::Closed) => break,
                                        }
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "metrics accept failed"),
                        }
                    }
                    _ = tokio::time::sleep(check) => {}
                }
            }
        });

        Ok(local_addr)
    }
}
