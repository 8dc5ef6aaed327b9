//! Integration tests for typed queues over private and named segments.

mod support;

use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use slabring::{
    Attachment, ErrorKind, Full, MemoryBackend, Mpmc, Mpsc, Queue, QueueConfig, Spsc,
};
use support::{SegmentName, init_tracing};

/// Requested capacity rounds up; the slot after the last one is refused.
#[test]
fn test_capacity_rounds_up_to_power_of_two() {
    init_tracing();
    let queue: Queue<u64, Mpmc> = Queue::new(100).unwrap();
    assert_eq!(queue.capacity(), 128);

    for i in 0..128 {
        queue.try_push(i).unwrap();
    }
    assert!(queue.is_full());
    assert_eq!(queue.try_push(128), Err(Full(128)));

    assert_eq!(queue.try_pop(), Some(0));
    queue.try_push(128).unwrap();
    assert_eq!(queue.pending(), 128);
}

/// Single-slot queues hold exactly one element and never overwrite it.
#[test]
fn test_single_slot_queues_refuse_second_push() {
    let spsc: Queue<u64, Spsc> = Queue::new(1).unwrap();
    let mut producer = spsc.producer().unwrap();
    let mut consumer = spsc.consumer().unwrap();
    producer.try_push(10).unwrap();
    assert_eq!(producer.try_push(20), Err(Full(20)));
    assert_eq!(consumer.try_pop(), Some(10));
    assert_eq!(consumer.try_pop(), None);

    let mpsc: Queue<u64, Mpsc> = Queue::new(1).unwrap();
    let mut consumer = mpsc.consumer().unwrap();
    mpsc.try_push(10).unwrap();
    assert_eq!(mpsc.try_push(20), Err(Full(20)));
    assert_eq!(consumer.try_pop(), Some(10));
    mpsc.try_push(30).unwrap();
    assert_eq!(consumer.try_pop(), Some(30));
    assert_eq!(consumer.try_pop(), None);
}

/// MPMC needs two slots to tell a published slot from a recycled one, so a
/// request for one slot gets two.
#[test]
fn test_mpmc_single_slot_request_gets_two() {
    let queue: Queue<u64, Mpmc> = Queue::new(1).unwrap();
    assert_eq!(queue.capacity(), 2);

    queue.try_push(10).unwrap();
    queue.try_push(20).unwrap();
    assert_eq!(queue.try_push(30), Err(Full(30)));
    assert_eq!(queue.try_pop(), Some(10));
    assert_eq!(queue.try_pop(), Some(20));
    assert_eq!(queue.try_pop(), None);

    // Several laps through both slots.
    for i in 0..10 {
        queue.try_push(i).unwrap();
        assert_eq!(queue.try_pop(), Some(i));
    }
}

#[test]
fn test_zero_capacity_rejected() {
    let err = Queue::<u64, Spsc>::new(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_spsc_fifo_across_threads() {
    init_tracing();
    const N: u64 = 100_000;
    let queue: Queue<u64, Spsc> = Queue::new(64).unwrap();

    thread::scope(|s| {
        let queue = &queue;
        s.spawn(move || {
            let mut producer = queue.producer().unwrap();
            for i in 0..N {
                producer.push(i);
            }
        });

        let mut consumer = queue.consumer().unwrap();
        for expected in 0..N {
            assert_eq!(consumer.pop(), expected);
        }
    });

    assert!(queue.is_empty());
}

/// Single roles can be held by one handle at a time.
#[test]
fn test_spsc_roles_are_exclusive() {
    let queue: Queue<u32, Spsc> = Queue::new(8).unwrap();

    let producer = queue.producer().unwrap();
    let err = queue.producer().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceInUse);

    let consumer = queue.consumer().unwrap();
    assert_eq!(queue.consumer().unwrap_err().kind(), ErrorKind::ResourceInUse);

    drop(producer);
    drop(consumer);
    assert!(queue.producer().is_ok());
    assert!(queue.consumer().is_ok());
}

/// Reactor pattern: several producers feed one consumer. Every message
/// arrives once and each producer's messages stay in order.
#[test]
fn test_mpsc_preserves_per_producer_order() {
    init_tracing();
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 20_000;
    let queue: Queue<(u32, u32), Mpsc> = Queue::new(256).unwrap();

    // Clones of a multi-producer handle are independent producers.
    let producer = queue.producer().unwrap();
    let mut consumer = queue.consumer().unwrap();
    assert_eq!(queue.consumer().unwrap_err().kind(), ErrorKind::ResourceInUse);

    thread::scope(|s| {
        for id in 0..PRODUCERS {
            let mut producer = producer.clone();
            s.spawn(move || {
                for seq in 0..PER_PRODUCER {
                    producer.push((id as u32, seq as u32));
                }
            });
        }

        let mut next = [0u32; PRODUCERS as usize];
        for _ in 0..PRODUCERS * PER_PRODUCER {
            let (id, seq) = consumer.pop();
            assert_eq!(seq, next[id as usize], "producer {id} out of order");
            next[id as usize] += 1;
        }
        assert!(next.iter().all(|&n| n as u64 == PER_PRODUCER));
    });

    assert_eq!(consumer.try_pop(), None);
}

#[test]
fn test_mpmc_delivers_each_value_once() {
    init_tracing();
    const PRODUCERS: u64 = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u64 = 10_000;
    const TOTAL: u64 = PRODUCERS * PER_PRODUCER;
    let queue: Queue<u64, Mpmc> = Queue::new(128).unwrap();
    let start = Barrier::new((PRODUCERS as usize) + CONSUMERS);

    let seen = thread::scope(|s| {
        for id in 0..PRODUCERS {
            let (queue, start) = (&queue, &start);
            s.spawn(move || {
                start.wait();
                for i in 0..PER_PRODUCER {
                    queue.push(id * PER_PRODUCER + i);
                }
            });
        }

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let (queue, start) = (&queue, &start);
                s.spawn(move || {
                    start.wait();
                    let mut got = Vec::new();
                    for _ in 0..TOTAL / CONSUMERS as u64 {
                        got.push(queue.pop());
                    }
                    got
                })
            })
            .collect();

        consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(seen.len() as u64, TOTAL);
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len() as u64, TOTAL, "a value was delivered twice");
    assert!(unique.iter().all(|&v| v < TOTAL));
    assert!(queue.is_empty());
}

/// Blocking calls park on backoff until the other side makes progress.
#[test]
fn test_blocking_push_waits_for_space() {
    let queue: Queue<u32, Spsc> = Queue::with_config(QueueConfig {
        spin_limit: 4,
        ..QueueConfig::new(2)
    })
    .unwrap();

    thread::scope(|s| {
        let queue = &queue;
        let mut producer = queue.producer().unwrap();
        producer.push(1);
        producer.push(2);
        assert!(queue.is_full());

        s.spawn(move || {
            // Queue is full; this only returns once the consumer pops.
            producer.push(3);
        });

        let mut consumer = queue.consumer().unwrap();
        assert_eq!(consumer.pop(), 1);
        assert_eq!(consumer.pop(), 2);
        assert_eq!(consumer.pop(), 3);
    });
}

#[test]
fn test_status_reports_cursors() {
    let queue: Queue<u16, Mpmc> = Queue::new(4).unwrap();
    queue.try_push(1).unwrap();
    queue.try_push(2).unwrap();
    queue.try_pop().unwrap();

    let status = queue.status();
    assert_eq!(status.capacity, 4);
    assert_eq!(status.len, 1);
    assert_eq!(status.head.wrapping_sub(status.tail), 1);
    assert_eq!(queue.available(), 3);
}

/// Two mappings of one named queue see each other's pushes.
#[test]
fn test_named_queue_is_shared() {
    init_tracing();
    let name = SegmentName::new("queue-shared");

    let first: Queue<u64, Spsc> = Queue::named(name.as_str(), 16).unwrap();
    let second: Queue<u64, Spsc> = Queue::named(name.as_str(), 16).unwrap();
    assert_eq!(first.backend().attachment(), Attachment::Created);
    assert_eq!(second.backend().attachment(), Attachment::Attached);
    assert_eq!(second.capacity(), 16);

    let mut producer = first.producer().unwrap();
    let mut consumer = second.consumer().unwrap();
    for i in 0..40 {
        producer.push(i);
        assert_eq!(consumer.pop(), i);
    }
    assert_eq!(consumer.try_pop(), None);
}

#[test]
fn test_named_queue_rejects_other_capacity() {
    let name = SegmentName::new("queue-capacity");
    let _queue: Queue<u64, Mpsc> = Queue::named(name.as_str(), 64).unwrap();

    let err = Queue::<u64, Mpsc>::named(name.as_str(), 128).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    // 40 rounds to 64, which matches.
    assert!(Queue::<u64, Mpsc>::named(name.as_str(), 40).is_ok());
}

#[test]
fn test_named_queue_rejects_other_element_type() {
    let name = SegmentName::new("queue-type");
    let _queue: Queue<u64, Mpmc> = Queue::named(name.as_str(), 32).unwrap();

    let err = Queue::<u32, Mpmc>::named(name.as_str(), 32).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_named_queue_rejects_other_policy() {
    let name = SegmentName::new("queue-policy");
    let _queue: Queue<u64, Mpsc> = Queue::named(name.as_str(), 32).unwrap();

    // Same byte size as Mpsc; only the recorded policy differs.
    let err = Queue::<u64, Mpmc>::named(name.as_str(), 32).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let err = Queue::<u64, Spsc>::named(name.as_str(), 32).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

/// A segment that is unlinked before anyone publishes it is abandoned; the
/// waiting attacher reopens the name and lays out a fresh queue.
#[test]
fn test_attacher_reopens_unpublished_segment() {
    init_tracing();
    let name = SegmentName::new("queue-orphan");

    // Exactly the size of a 16-slot u64 SPSC queue (64-byte segment header,
    // 192-byte ring header, 128 bytes of slots), but never published.
    let orphan = MemoryBackend::named(name.as_str(), 384).unwrap();
    assert_eq!(orphan.attachment(), Attachment::Created);

    let queue = thread::scope(|s| {
        let attacher = s.spawn(|| Queue::<u64, Spsc>::named(name.as_str(), 16));
        thread::sleep(Duration::from_millis(50));
        MemoryBackend::unlink(name.as_str()).unwrap();
        attacher.join().unwrap()
    })
    .unwrap();
    drop(orphan);

    assert_eq!(queue.backend().attachment(), Attachment::Created);
    assert_eq!(queue.capacity(), 16);
    queue.producer().unwrap().try_push(5).unwrap();
    assert_eq!(queue.consumer().unwrap().try_pop(), Some(5));
}
