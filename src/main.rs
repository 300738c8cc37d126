// Demo binary - runs the scheduler on worker threads under synthetic traffic
//
// The binary loads a configuration (JSON file or defaults), spawns the worker runtime, starts the
// metrics TCP server on a Tokio runtime, feeds synthetic flows from a traffic thread and keeps
// running until Ctrl+C is received.

use mcps::cluster::{Cluster, WorkerId, EXTERNAL_CALLER};
use mcps::metrics::MetricsServer;
use mcps::runtime::{ChannelWaker, Runtime};
use mcps::scheduler::{Delivery, PacketSink};
use mcps::{MonotonicClock, Packet, Scheduler, SchedulerConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// JSON configuration file; defaults are used when absent
    config: Option<String>,
    /// IP address and port for the metrics TCP server (default: "127.0.0.1:9999")
    metrics_bind: String,
    /// Number of synthetic flows
    flows: u64,
    /// Aggregate synthetic packet rate
    rate_pps: u64,
    /// Take a big worker offline and back every few seconds
    hotplug_demo: bool,
}

/// Normalize a metrics bind address to include a port if missing.
fn normalize_metrics_bind(value: &str) -> String {
    if value.contains(':') {
        value.to_string()
    } else {
        format!("{value}:9999")
    }
}

/// Parse command-line arguments into `CliOptions`.
///
/// Accepts both `--key=value` and `--key value`:
/// - `--config <path>`
/// - `--metrics-bind <addr>`
/// - `--flows <n>`
/// - `--rate <pps>`
/// - `--hotplug-demo`
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions {
        config: None,
        metrics_bind: String::from("127.0.0.1:9999"),
        flows: 256,
        rate_pps: 50_000,
        hotplug_demo: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let (key, inline) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        };
        if key == "--hotplug-demo" {
            options.hotplug_demo = true;
            continue;
        }
        let Some(value) = inline.or_else(|| args.next()) else {
            break;
        };
        match key.as_str() {
            "--config" => options.config = Some(value),
            "--metrics-bind" | "--metrics-host" => {
                options.metrics_bind = normalize_metrics_bind(&value)
            }
            "--flows" => options.flows = value.parse().unwrap_or(options.flows).max(1),
            "--rate" => options.rate_pps = value.parse().unwrap_or(options.rate_pps).max(1),
            _ => {}
        }
    }
    options
}

/// Downstream stand-in: counts what each worker delivered.
struct CountingSink {
    delivered: Vec<AtomicU64>,
}

impl PacketSink for CountingSink {
    fn deliver(&self, worker: WorkerId, delivery: Delivery) {
        if let Some(counter) = self.delivered.get(worker) {
            counter.fetch_add(delivery.segments() as u64, Ordering::Relaxed);
        }
    }
}

/// Generate traffic for `flows` flows at roughly `rate_pps`; the first few flows are heavy.
fn traffic_loop(scheduler: &Scheduler, flows: u64, rate_pps: u64, running: &AtomicBool) {
    const BURST: u64 = 64;
    let pause = Duration::from_nanos(1_000_000_000 * BURST / rate_pps);
    let heavy = (flows / 16).max(1);
    let mut tick: u64 = 0;
    while running.load(Ordering::Relaxed) {
        let started = Instant::now();
        for _ in 0..BURST {
            tick = tick.wrapping_add(1);
            // Half of the traffic goes to the heavy flows.
            let flow = if tick % 2 == 0 {
                tick / 2 % heavy
            } else {
                tick.wrapping_mul(0x9E37_79B9) % flows
            };
            let hint = if flow % 4 == 0 {
                Cluster::Big
            } else {
                Cluster::Little
            };
            let destination = SocketAddr::from((
                Ipv4Addr::new(10, 0, (flow >> 8) as u8, flow as u8),
                8000 + (flow % 1000) as u16,
            ));
            let hash = flow.wrapping_mul(0xD6E8_FEB8_6659_FD93) ^ 0x5bd1_e995;
            let packet = Packet::new(hash, hint, &[0u8; 256]).with_destination(destination);
            scheduler.classify_and_route(packet, EXTERNAL_CALLER);
        }
        if let Some(rest) = pause.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let options = parse_cli_options();
    let config = match &options.config {
        Some(path) => SchedulerConfig::from_json_file(path)?,
        None => SchedulerConfig::default(),
    };
    let workers = config.topology.clusters.len();

    let (waker, receivers) = ChannelWaker::new(workers);
    let sink = Arc::new(CountingSink {
        delivered: (0..workers).map(|_| AtomicU64::new(0)).collect(),
    });
    let scheduler = Arc::new(Scheduler::new(
        &config,
        sink.clone(),
        waker.clone(),
        Arc::new(MonotonicClock::new()),
    )?);

    let running = Arc::new(AtomicBool::new(true));
    let runtime = Runtime::start(
        scheduler.clone(),
        waker,
        receivers,
        &config.runtime,
        running.clone(),
    )?;

    // Metrics server lives on its own Tokio runtime for the whole process
    let rt = tokio::runtime::Runtime::new()?;
    let server = MetricsServer::new(scheduler.clone(), running.clone(), Duration::from_secs(1));
    let metrics_addr = rt.block_on(server.start(&options.metrics_bind))?;
    info!(%metrics_addr, "metrics server listening");

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        shutdown_flag_clone.store(true, Ordering::Relaxed);
    })?;

    let traffic_scheduler = scheduler.clone();
    let traffic_running = running.clone();
    let (flows, rate_pps) = (options.flows, options.rate_pps);
    let traffic = thread::Builder::new()
        .name("mcps-traffic".to_string())
        .spawn(move || traffic_loop(&traffic_scheduler, flows, rate_pps, &traffic_running))?;

    let big = scheduler.topology().members(Cluster::Big).iter().last();
    let mut last_report = Instant::now();
    let mut unplugged = false;
    while !shutdown_flag.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() < Duration::from_secs(5) {
            continue;
        }
        last_report = Instant::now();
        if let (true, Some(worker)) = (options.hotplug_demo, big) {
            if unplugged {
                scheduler.worker_online(worker)?;
            } else {
                scheduler.worker_offline(worker)?;
            }
            unplugged = !unplugged;
        }
        let snapshot = scheduler.snapshot();
        let totals = snapshot.totals();
        let delivered: Vec<u64> = sink
            .delivered
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        info!(
            flows = snapshot.flow_count,
            monitored = snapshot.monitored_flows,
            enqueued = totals.enqueued,
            processed = totals.processed,
            dropped = totals.dropped,
            migrations = snapshot.transitions.total(),
            ?delivered,
            "status"
        );
    }

    info!("shutting down");
    running.store(false, Ordering::Relaxed);
    let _ = traffic.join();
    let discarded = runtime.shutdown();
    info!(discarded, "scheduler stopped");
    drop(rt);
    Ok(())
}
