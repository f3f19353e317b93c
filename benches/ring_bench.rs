use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use magnon::{Pool, PoolConfig, Queue, Ring};
use std::thread;

fn bench_pool() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let name = format!("/magnon_bench_ring_{}", std::process::id());
        Pool::unlink_named(&name);
        let pool = Pool::acquire_with(PoolConfig::named(&name).with_size(8 << 20)).unwrap();
        pool.unlink();
    });
}

fn benchmark_single_threaded_throughput(c: &mut Criterion) {
    bench_pool();
    let mut group = c.benchmark_group("Ring_SingleThreaded");

    for capacity in [64u32, 512, 4096].iter() {
        group.throughput(Throughput::Elements(*capacity as u64));
        group.bench_with_input(
            BenchmarkId::new("fill_drain_u64", capacity),
            capacity,
            |b, &capacity| {
                let ring: Ring<u64> = Ring::create(capacity).unwrap();

                b.iter(|| {
                    for i in 0..capacity as u64 {
                        assert!(ring.enqueue(i));
                    }
                    for _ in 0..capacity {
                        ring.dequeue().unwrap();
                    }
                });

                ring.free();
            },
        );
    }

    group.finish();
}

fn benchmark_mpsc_contention(c: &mut Criterion) {
    bench_pool();
    let mut group = c.benchmark_group("Ring_MPSC");
    group.sample_size(10);

    for producers in [1usize, 2, 4].iter() {
        let items_per_producer = 10_000u64;
        group.throughput(Throughput::Elements(items_per_producer * *producers as u64));
        group.bench_with_input(
            BenchmarkId::new("drain_while_producing", producers),
            producers,
            |b, &producers| {
                b.iter(|| {
                    let ring: Ring<u64> = Ring::create(1024).unwrap();
                    let offset = ring.offset();

                    let handles: Vec<_> = (0..producers)
                        .map(|_| {
                            thread::spawn(move || {
                                let handle: Ring<u64> = Ring::open(offset).unwrap();
                                for i in 0..items_per_producer {
                                    while !handle.enqueue(i) {
                                        thread::yield_now();
                                    }
                                }
                            })
                        })
                        .collect();

                    let expected = items_per_producer * producers as u64;
                    let mut received = 0;
                    while received < expected {
                        if ring.dequeue().is_some() {
                            received += 1;
                        } else {
                            thread::yield_now();
                        }
                    }

                    for h in handles {
                        h.join().unwrap();
                    }
                    ring.free();
                });
            },
        );
    }

    group.finish();
}

fn benchmark_queue_broadcast(c: &mut Criterion) {
    bench_pool();
    let mut group = c.benchmark_group("Queue_Broadcast");

    for consumers in [1usize, 2, 4].iter() {
        group.throughput(Throughput::Elements(*consumers as u64));
        group.bench_with_input(
            BenchmarkId::new("enqueue_dequeue", consumers),
            consumers,
            |b, &consumers| {
                let first = Queue::<u64>::create(true, 512).unwrap();
                let rest: Vec<_> = (1..consumers)
                    .map(|_| Queue::<u64>::load(true, first.offset()).unwrap())
                    .collect();
                let mut producer = Queue::<u64>::load(false, first.offset()).unwrap();

                b.iter(|| {
                    assert!(producer.enqueue(7));
                    first.dequeue().unwrap();
                    for consumer in &rest {
                        consumer.dequeue().unwrap();
                    }
                });

                drop(producer);
                drop(rest);
                first.free();
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_single_threaded_throughput,
    benchmark_mpsc_contention,
    benchmark_queue_broadcast
);
criterion_main!(benches);
