//! End-to-end fan-out scenarios: single producer, many producers, and
//! many producers with many consumers, all checked by summing symmetric
//! integer ranges to zero.

use std::sync::Once;
use std::thread;

use magnon::{Pool, PoolConfig, Queue};

/// The range every producer streams; symmetric, so any complete delivery
/// sums to zero.
const RANGE: std::ops::RangeInclusive<i64> = -3000..=3000;
const RANGE_LEN: usize = 6001;

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let name = format!("/magnon_fanout_{}", std::process::id());
        Pool::unlink_named(&name);
        let pool = Pool::acquire_with(PoolConfig::named(&name).with_size(4 << 20)).unwrap();
        pool.unlink();
    });
}

fn spawn_producer(offset: i32) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut handle = Queue::<i64>::load(false, offset).unwrap();
        for v in RANGE {
            while !handle.enqueue(v) {
                thread::yield_now();
            }
        }
    })
}

#[test]
fn test_spsc_sum_is_zero() {
    setup();
    let base = Queue::<i64>::create(false, 64).unwrap();
    let consumer = Queue::<i64>::load(true, base.offset()).unwrap();

    let producer = spawn_producer(base.offset());

    let mut sum = 0i64;
    for _ in 0..RANGE_LEN {
        sum += consumer.dequeue_blocking();
    }
    producer.join().unwrap();

    assert_eq!(sum, 0);
    assert_eq!(consumer.dequeue(), None);
}

#[test]
fn test_mpsc_sum_is_zero() {
    setup();
    let base = Queue::<i64>::create(false, 64).unwrap();
    let consumer = Queue::<i64>::load(true, base.offset()).unwrap();

    let producers: Vec<_> = (0..50).map(|_| spawn_producer(base.offset())).collect();

    let mut sum = 0i64;
    for _ in 0..50 * RANGE_LEN {
        sum += consumer.dequeue_blocking();
    }
    for p in producers {
        p.join().unwrap();
    }

    assert_eq!(sum, 0);
    assert_eq!(consumer.dequeue(), None);
}

#[test]
fn test_mpmc_every_consumer_sums_to_zero() {
    setup();
    let base = Queue::<i64>::create(false, 64).unwrap();
    let offset = base.offset();

    // Both consumers exist before any producer starts, so each must see
    // every message exactly once.
    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let handle = Queue::<i64>::load(true, offset).unwrap();
            thread::spawn(move || {
                let mut sum = 0i64;
                for _ in 0..50 * RANGE_LEN {
                    sum += handle.dequeue_blocking();
                }
                (sum, handle.dequeue())
            })
        })
        .collect();

    let producers: Vec<_> = (0..50).map(|_| spawn_producer(offset)).collect();
    for p in producers {
        p.join().unwrap();
    }

    for c in consumers {
        let (sum, leftover) = c.join().unwrap();
        assert_eq!(sum, 0);
        assert_eq!(leftover, None);
    }
}

#[test]
fn test_blocking_broadcast_delivers_everything() {
    setup();
    let base = Queue::<i64>::create(false, 8).unwrap();
    let offset = base.offset();
    let consumer = Queue::<i64>::load(true, offset).unwrap();

    // A deliberately tiny ring forces the producer through the blocking
    // path over and over.
    let producer = thread::spawn(move || {
        let mut handle = Queue::<i64>::load(false, offset).unwrap();
        for v in -500..=500i64 {
            assert!(handle.enqueue_blocking(v));
        }
    });

    let mut sum = 0i64;
    for _ in 0..1001 {
        sum += consumer.dequeue_blocking();
    }
    producer.join().unwrap();
    assert_eq!(sum, 0);
}

#[test]
fn test_single_producer_order_is_preserved() {
    setup();
    let base = Queue::<i64>::create(false, 64).unwrap();
    let consumer = Queue::<i64>::load(true, base.offset()).unwrap();

    let producer = spawn_producer(base.offset());

    let mut expected = *RANGE.start();
    for _ in 0..RANGE_LEN {
        assert_eq!(consumer.dequeue_blocking(), expected);
        expected += 1;
    }
    producer.join().unwrap();
}
