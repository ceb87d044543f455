//! End-to-end store behaviour on a single-process loopback cluster.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use distore::data::NodeType;
use distore::workload::decimal_key;
use distore::{ComputeNode, PAGE_SIZE, SEGMENT_SIZE};

fn store() -> Arc<ComputeNode> {
    ComputeNode::loopback(1, SEGMENT_SIZE + PAGE_SIZE)
}

#[test]
fn quick_put_to_remote_transition() {
    let node = store();
    let mut client = node.register_thread().unwrap();

    for i in 1..=11u64 {
        assert!(client.put(&decimal_key(i), &decimal_key(i)).unwrap());
    }
    // the eleventh insert flushed both local nodes to remote memory
    assert!(node.search_layer().head().forward(0).is_some());

    for i in 1..=11u64 {
        assert_eq!(
            client.get(&decimal_key(i)).unwrap(),
            Some(decimal_key(i)),
            "key {i} lost across the transition"
        );
    }
}

#[test]
fn morph_ten_to_twelve() {
    let node = store();
    let mut client = node.register_thread().unwrap();

    // transition leaves a type-10 record holding only key 100 under
    // anchor 100
    for i in 100..=111u64 {
        client.put(&decimal_key(i), &decimal_key(i)).unwrap();
    }
    let (_, t) = node.search_layer().search(&decimal_key(100)).unwrap();
    assert_eq!(t, NodeType::Type10);

    // ten more keys below the anchor land in that record; the eleventh
    // pair overflows it and the record morphs
    for i in 1..=10u64 {
        client.put(&decimal_key(i), &decimal_key(i)).unwrap();
    }

    let (ptr, t) = node.search_layer().search(&decimal_key(100)).unwrap();
    assert_eq!(t, NodeType::Type12);
    let rec = client.fetch_record(ptr).unwrap();
    assert!(rec.verify());
    assert_eq!(rec.node_type(), NodeType::Type12);
    assert_eq!(rec.next(), 11);
    for i in (1..=10u64).chain([100]) {
        assert_eq!(client.get(&decimal_key(i)).unwrap(), Some(decimal_key(i)));
    }
}

#[test]
fn concurrent_inserts_across_eight_threads() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 1000;

    let node = store();
    let barrier = Barrier::new(THREADS as usize);

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let node = node.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                let mut client = node.register_thread().unwrap();
                barrier.wait();
                for i in 0..PER_THREAD {
                    let k = decimal_key(t * PER_THREAD + i);
                    assert!(client.put(&k, &k).unwrap());
                }
            });
        }
    });

    node.quiesce_calibration();
    let mut client = node.register_thread().unwrap();

    // every key retrievable
    for n in 0..THREADS * PER_THREAD {
        assert_eq!(
            client.get(&decimal_key(n)).unwrap(),
            Some(decimal_key(n)),
            "key {n} missing after concurrent load"
        );
    }

    // and the data layer covers each exactly once
    let mut total = 0usize;
    let mut cursor = node.search_layer().head().forward(0);
    while let Some(snode) = cursor {
        let rec = client.fetch_record(snode.data_node()).unwrap();
        assert!(rec.verify());
        total += rec.next();
        cursor = snode.forward(0);
    }
    assert_eq!(total, (THREADS * PER_THREAD) as usize);
}

#[test]
fn updates_are_visible_after_contention() {
    const THREADS: u64 = 4;
    const KEYS: u64 = 400;

    let node = store();
    let mut loader = node.register_thread().unwrap();
    for i in 0..KEYS {
        loader.put(&decimal_key(i), &decimal_key(i)).unwrap();
    }

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let node = node.clone();
            scope.spawn(move || {
                let mut client = node.register_thread().unwrap();
                // disjoint key ranges, so final values are deterministic
                for i in (t * KEYS / THREADS)..((t + 1) * KEYS / THREADS) {
                    assert!(client
                        .update(&decimal_key(i), &decimal_key(i + 10_000))
                        .unwrap());
                }
            });
        }
    });

    for i in 0..KEYS {
        assert_eq!(
            loader.get(&decimal_key(i)).unwrap(),
            Some(decimal_key(i + 10_000))
        );
    }
}

#[test]
fn scan_tolerates_concurrent_splits() {
    const PRESENT: u64 = 1000;

    let node = store();
    let mut loader = node.register_thread().unwrap();
    for i in 0..PRESENT {
        loader.put(&decimal_key(i * 2), &decimal_key(i * 2)).unwrap();
    }

    let done = AtomicBool::new(false);
    let barrier = Barrier::new(2);
    std::thread::scope(|scope| {
        let writer_node = node.clone();
        let writer_done = &done;
        let writer_barrier = &barrier;
        scope.spawn(move || {
            let mut writer = writer_node.register_thread().unwrap();
            writer_barrier.wait();
            for i in 0..PRESENT {
                let k = decimal_key(i * 2 + 1);
                writer.put(&k, &k).unwrap();
            }
            writer_done.store(true, Ordering::Release);
        });

        let mut scanner = node.register_thread().unwrap();
        barrier.wait();
        loop {
            let finished = done.load(Ordering::Acquire);
            let got = scanner.scan(&decimal_key(0), 8000).unwrap();
            let seen: HashSet<[u8; 16]> = got.into_iter().collect();
            for i in 0..PRESENT {
                assert!(
                    seen.contains(&decimal_key(i * 2)),
                    "scan lost pre-existing key {} during the insert storm",
                    i * 2
                );
            }
            if finished {
                break;
            }
        }
    });
}
