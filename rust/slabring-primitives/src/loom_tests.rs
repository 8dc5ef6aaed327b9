#![cfg(all(test, loom))]

use crate::region::HeapRegion;
use crate::ring::{MpmcRingRaw, MpscRingRaw, Ring, SpscRingRaw};
use crate::segment::{SegmentHeader, SegmentHeaderInit, SegmentKind};
use crate::slab::Pool;
use crate::sync::{AtomicU32, Ordering, thread};
use crate::Backoff;
use loom::sync::Arc;

#[test]
fn spsc_ring_concurrent() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let ring: Ring<SpscRingRaw<u64>> = unsafe { Ring::init(region_owner.region(), 0, 2) };
        let ring = Arc::new(ring);

        let producer = thread::spawn({
            let ring = ring.clone();
            let owner = region_owner.clone();
            move || {
                let _keep = owner;
                for i in 0..3u64 {
                    while ring.try_push(i).is_err() {
                        thread::yield_now();
                    }
                }
            }
        });

        let mut received = Vec::new();
        while received.len() < 3 {
            match ring.try_pop() {
                Some(v) => received.push(v),
                None => thread::yield_now(),
            }
        }

        producer.join().unwrap();
        assert_eq!(received, vec![0, 1, 2]);
    });
}

#[test]
fn mpsc_two_producers() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let ring: Ring<MpscRingRaw<u32>> = unsafe { Ring::init(region_owner.region(), 0, 2) };
        let ring = Arc::new(ring);

        let spawn = |value: u32| {
            let ring = ring.clone();
            let owner = region_owner.clone();
            thread::spawn(move || {
                let _keep = owner;
                while ring.try_push(value).is_err() {
                    thread::yield_now();
                }
            })
        };
        let t1 = spawn(1);
        let t2 = spawn(2);

        let mut received = Vec::new();
        while received.len() < 2 {
            match ring.try_pop() {
                Some(v) => received.push(v),
                None => thread::yield_now(),
            }
        }

        t1.join().unwrap();
        t2.join().unwrap();
        received.sort_unstable();
        assert_eq!(received, vec![1, 2]);
    });
}

#[test]
fn mpmc_each_value_once() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let ring: Ring<MpmcRingRaw<u32>> = unsafe { Ring::init(region_owner.region(), 0, 2) };
        let ring = Arc::new(ring);

        let producer = thread::spawn({
            let ring = ring.clone();
            let owner = region_owner.clone();
            move || {
                let _keep = owner;
                for v in [10, 20] {
                    while ring.try_push(v).is_err() {
                        thread::yield_now();
                    }
                }
            }
        });

        let consumer = thread::spawn({
            let ring = ring.clone();
            let owner = region_owner.clone();
            move || {
                let _keep = owner;
                ring.try_pop()
            }
        });

        producer.join().unwrap();
        let other = consumer.join().unwrap();

        let mut seen: Vec<u32> = other.into_iter().collect();
        while let Some(v) = ring.try_pop() {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![10, 20]);
    });
}

#[test]
fn pool_no_double_alloc() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let pool = unsafe { Pool::init(region_owner.region(), 0, 16, 2) };
        let pool = Arc::new(pool);
        let counter = Arc::new(AtomicU32::new(0));

        let run = |pool: Arc<Pool>, counter: Arc<AtomicU32>, owner: Arc<HeapRegion>| {
            let _keep = owner;
            for _ in 0..2 {
                if pool.inner().try_alloc().is_some() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        let t1 = thread::spawn({
            let pool = pool.clone();
            let counter = counter.clone();
            let owner = region_owner.clone();
            move || run(pool, counter, owner)
        });

        let t2 = thread::spawn({
            let pool = pool.clone();
            let counter = counter.clone();
            let owner = region_owner.clone();
            move || run(pool, counter, owner)
        });

        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(pool.inner().try_alloc().is_none());
    });
}

#[test]
fn pool_alloc_free_race() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let pool = Arc::new(unsafe { Pool::init(region_owner.region(), 0, 16, 2) });

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let pool = pool.clone();
                let owner = region_owner.clone();
                thread::spawn(move || {
                    let _keep = owner;
                    if let Some(index) = pool.inner().try_alloc() {
                        pool.inner().free(index);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.free_count_approx(), 2);
    });
}

#[test]
fn segment_publish_is_visible() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let region = region_owner.region();
        let init = SegmentHeaderInit {
            kind: SegmentKind::Arena,
            total_size: 128,
            params: [1, 2, 3, 4],
        };

        unsafe { region.get_mut::<SegmentHeader>(0) }.init(init);

        let creator = thread::spawn({
            let owner = region_owner.clone();
            move || {
                unsafe { owner.region().get::<SegmentHeader>(0) }.publish();
            }
        });

        let header = unsafe { region.get::<SegmentHeader>(0) };
        let mut backoff = Backoff::with_spin_limit(0);
        header.wait_ready(&mut backoff);
        assert_eq!(header.validate(&init), Ok(()));

        creator.join().unwrap();
    });
}
