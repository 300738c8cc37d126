use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use mcps::cluster::{Cluster, WorkerId, WorkerMask};
use mcps::scheduler::affinity::{pick_from, reciprocal_scale};
use mcps::scheduler::{Delivery, PacketSink, WakeKind, WakeSink};
use mcps::{MonotonicClock, Packet, Scheduler, SchedulerConfig};

struct Discard;

impl PacketSink for Discard {
    fn deliver(&self, _: WorkerId, delivery: Delivery) {
        black_box(delivery);
    }
}

impl WakeSink for Discard {
    fn wake(&self, _: WorkerId, _: WakeKind) {}
}

fn scheduler(config: &SchedulerConfig) -> Scheduler {
    Scheduler::new(
        config,
        Arc::new(Discard),
        Arc::new(Discard),
        Arc::new(MonotonicClock::new()),
    )
    .unwrap()
}

fn bench_selector(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector");
    let mask = WorkerMask(0b1011_0110);

    group.bench_function("reciprocal_scale", |b| {
        let mut hash = 0u64;
        b.iter(|| {
            hash = hash.wrapping_add(0x9E37_79B9_7F4A_7C15);
            black_box(reciprocal_scale(black_box(hash), 6))
        });
    });

    group.bench_function("pick_from", |b| {
        let mut hash = 0u64;
        b.iter(|| {
            hash = hash.wrapping_add(1);
            black_box(pick_from(black_box(mask), hash))
        });
    });

    group.bench_function("select_worker_known_flow", |b| {
        let scheduler = scheduler(&SchedulerConfig::default());
        scheduler.classify_and_route(Packet::new(42, Cluster::Little, &[0u8; 64]), 0);
        b.iter(|| black_box(scheduler.select_worker(black_box(42), Cluster::Little)));
    });
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify_and_route");
    let packet = Packet::new(0, Cluster::Little, &[0u8; 256]);

    for flows in [1u64, 64, 4096] {
        group.bench_with_input(BenchmarkId::new("route_then_poll", flows), &flows, |b, &flows| {
            let mut config = SchedulerConfig::default();
            config.queue.capacity = 1 << 20;
            let scheduler = scheduler(&config);
            let mut i = 0u64;
            b.iter(|| {
                i = i.wrapping_add(1);
                let mut p = packet.clone();
                p.flow_hash = i % flows;
                black_box(scheduler.classify_and_route(p, 0));
                if i % 256 == 0 {
                    for worker in 0..scheduler.worker_count() {
                        scheduler.drain(worker);
                    }
                }
            });
        });
    }
}

fn bench_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("poll");

    for gro in [false, true] {
        group.bench_with_input(BenchmarkId::new("enqueue_64_drain", gro), &gro, |b, &gro| {
            let mut config = SchedulerConfig::default();
            config.queue.gro_enabled = gro;
            let scheduler = scheduler(&config);
            scheduler.classify_and_route(Packet::new(7, Cluster::Big, &[0u8; 64]), 0);
            let worker = scheduler.flow_snapshot(7).map(|f| f.worker).unwrap_or(0);
            scheduler.drain(worker);
            b.iter(|| {
                for _ in 0..64 {
                    scheduler.enqueue(worker, Packet::new(7, Cluster::Big, &[0u8; 64]), worker);
                }
                black_box(scheduler.drain(worker))
            });
        });
    }
}

criterion_group!(benches, bench_selector, bench_classify, bench_poll);
criterion_main!(benches);
