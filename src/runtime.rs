//! Thread-per-worker driver for the cooperative pollers.
//!
//! Each worker thread blocks on its own crossbeam channel and runs the receive poller or the
//! migration poller when the scheduler signals it. A housekeeping thread runs the idle sweep and
//! the rebalancer on a fixed cadence.

use crate::cluster::WorkerId;
use crate::config::RuntimeConfig;
use crate::scheduler::{Scheduler, WakeKind, WakeSink};
use crate::threading;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on how long a worker sleeps before re-checking the running flag.
const IDLE_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Receive,
    Migrate,
    Shutdown,
}

/// [`WakeSink`] that turns wakes into channel messages, one channel per worker.
pub struct ChannelWaker {
    senders: Vec<Sender<WorkerSignal>>,
}

impl ChannelWaker {
    /// Create the waker and the receiving ends, indexed by worker id.
    pub fn new(workers: usize) -> (Arc<ChannelWaker>, Vec<Receiver<WorkerSignal>>) {
        let (senders, receivers): (Vec<Sender<WorkerSignal>>, Vec<Receiver<WorkerSignal>>) =
            (0..workers).map(|_| unbounded()).unzip();
        (Arc::new(ChannelWaker { senders }), receivers)
    }

    fn send(&self, worker: WorkerId, signal: WorkerSignal) {
        if let Some(tx) = self.senders.get(worker) {
            // Receiver gone means the worker thread already exited.
            let _ = tx.send(signal);
        }
    }
}

impl WakeSink for ChannelWaker {
    fn wake(&self, worker: WorkerId, kind: WakeKind) {
        let signal = match kind {
            WakeKind::Local | WakeKind::Remote => WorkerSignal::Receive,
            WakeKind::Migration => WorkerSignal::Migrate,
        };
        self.send(worker, signal);
    }
}

pub struct Runtime {
    scheduler: Arc<Scheduler>,
    waker: Arc<ChannelWaker>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Spawn one thread per worker plus the housekeeping thread.
    ///
    /// `receivers` must come from the same [`ChannelWaker::new`] call as the waker the scheduler
    /// was built with.
    pub fn start(
        scheduler: Arc<Scheduler>,
        waker: Arc<ChannelWaker>,
        receivers: Vec<Receiver<WorkerSignal>>,
        config: &RuntimeConfig,
        running: Arc<AtomicBool>,
    ) -> io::Result<Runtime> {
        let mut handles = Vec::with_capacity(receivers.len() + 1);
        for (worker, rx) in receivers.into_iter().enumerate() {
            let scheduler = scheduler.clone();
            let running = running.clone();
            let pin = config
                .pin_threads
                .then(|| threading::core_for_worker(worker, config.core_offset));
            let handle = thread::Builder::new()
                .name(format!("mcps-worker-{worker}"))
                .spawn(move || {
                    if let Some(core) = pin {
                        if !threading::pin_current_thread(core) {
                            warn!(worker, core, "failed to pin worker thread");
                        }
                    }
                    run_worker(worker, &scheduler, &rx, &running);
                })?;
            handles.push(handle);
        }

        let housekeeping = Duration::from_millis(config.housekeeping_interval_ms.max(1));
        let scheduler_hk = scheduler.clone();
        let running_hk = running.clone();
        handles.push(
            thread::Builder::new()
                .name("mcps-housekeeping".to_string())
                .spawn(move || housekeeping_loop(&scheduler_hk, housekeeping, &running_hk))?,
        );

        info!(
            workers = scheduler.worker_count(),
            pinned = config.pin_threads,
            "runtime started"
        );
        Ok(Runtime {
            scheduler,
            waker,
            running,
            handles,
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Stop every thread, then discard whatever is still queued. Returns the discarded count.
    pub fn shutdown(self) -> u64 {
        self.running.store(false, Ordering::Release);
        for worker in 0..self.scheduler.worker_count() {
            self.waker.send(worker, WorkerSignal::Shutdown);
        }
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("runtime thread panicked");
            }
        }
        self.scheduler.shutdown()
    }
}

fn run_worker(
    worker: WorkerId,
    scheduler: &Scheduler,
    rx: &Receiver<WorkerSignal>,
    running: &AtomicBool,
) {
    debug!(worker, "worker thread started");
    loop {
        match rx.recv_timeout(IDLE_TICK) {
            Ok(WorkerSignal::Receive) => {
                scheduler.poll(worker, scheduler.tunables().poll_quota());
            }
            Ok(WorkerSignal::Migrate) => {
                scheduler.poll_migrations(worker, scheduler.tunables().migration_budget());
            }
            Ok(WorkerSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
    debug!(worker, "worker thread stopped");
}

fn housekeeping_loop(scheduler: &Scheduler, interval: Duration, running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        thread::sleep(interval);
        let removed = scheduler.sweep();
        let requested = scheduler.rebalance();
        if removed > 0 || requested > 0 {
            debug!(removed, requested, "housekeeping pass");
        }
    }
}
