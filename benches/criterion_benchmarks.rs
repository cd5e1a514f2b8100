use std::time::{Duration, Instant};

use ccache::bio::{BackgroundJobPool, JobServices};
use ccache::config::{BioConfig, MasterConfig, ZoomConfig};
use ccache::http;
use ccache::safe_queue;
use ccache::zoom::{DefaultResizer, ZoomService};
use ccache::{Coordinator, Key, SlaveCache};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const KEYS: usize = 1000;

/// A slave whose `KEYS` entries are all filled (with the canned 404).
fn filled_slave() -> (tempfile::TempDir, BackgroundJobPool, Coordinator, SlaveCache, Vec<Key>) {
    let dir = tempfile::tempdir().unwrap();
    let zoom = ZoomService::new(
        &ZoomConfig::default(),
        dir.path(),
        dir.path(),
        Box::new(DefaultResizer),
    )
    .unwrap();
    let (pool, results) =
        BackgroundJobPool::start(&BioConfig { threads: 2 }, JobServices::new(dir.path(), zoom))
            .unwrap();
    let mut coordinator = Coordinator::new(&MasterConfig::default(), pool.submitter(), results);
    let mut slave = coordinator.register_slave(None);

    let keys: Vec<Key> = (0..KEYS)
        .map(|i| Key::from(format!("/static/bench-{i}.jpg")))
        .collect();
    for key in &keys {
        slave.find(key);
    }
    let deadline = Instant::now() + Duration::from_secs(30);
    while keys.iter().any(|k| slave.peek(k.as_bytes()).unwrap().is_pending()) {
        assert!(Instant::now() < deadline);
        coordinator.run_once();
        slave.process_inbox();
    }
    (dir, pool, coordinator, slave, keys)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Slave Cache");

    {
        let (_dir, _pool, _coordinator, mut slave, keys) = filled_slave();
        group.bench_function("find hit", |b| {
            let mut i = 0;
            b.iter(|| {
                let entry = slave.find(black_box(&keys[i % KEYS]));
                i += 1;
                black_box(entry.value().is_some())
            });
        });

        group.bench_function("fetch hit", |b| {
            let mut i = 0;
            b.iter(|| {
                let reply = slave.fetch(black_box(keys[i % KEYS].as_bytes()));
                i += 1;
                black_box(reply)
            });
        });
    }

    group.finish();

    let mut group = c.benchmark_group("Safe Queue");

    group.bench_function("push pop", |b| {
        let (mut tx, mut rx) = safe_queue::channel::<u64>();
        b.iter(|| {
            tx.push(black_box(1));
            black_box(rx.pop())
        });
    });

    group.bench_function("push 64 drain", |b| {
        let (mut tx, mut rx) = safe_queue::channel::<u64>();
        b.iter(|| {
            for i in 0..64 {
                tx.push(i);
            }
            black_box(rx.drain().count())
        });
    });

    group.finish();

    let mut group = c.benchmark_group("HTTP");

    group.bench_function("parse request", |b| {
        let req = b"GET /zoom/cat.jpg?w=100&h=100 HTTP/1.1\r\nHost: bench\r\nAccept: */*\r\n\r\n";
        b.iter(|| black_box(http::parse_request(black_box(req))));
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
