use std::{sync::Arc, thread, time::Duration};

use pretty_assertions::assert_eq;
use temp_dir::TempDir;

use super::{
    assert_ids, consume, feed, non_reliable_options, nv_registry, record_of_size,
    reliable_options, started_queue,
};
use crate::{
    qdisk::RESERVED,
    queue::{DiskQueue, PathOptions},
};

const MIB: u64 = 1024 * 1024;

#[test]
fn reliable_small_run() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&reliable_options(dir.path(), MIB, 0), &registry);

    feed(&queue, &registry, 0, 10, 100);
    assert_eq!(queue.len(), 10);

    let popped = consume(&queue, 10);
    assert_ids(&popped, 0..10);
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.backlog_len(), 10);

    queue.ack_backlog(10);
    assert_eq!(queue.backlog_len(), 0);
    assert_eq!(queue.heads(), (RESERVED, RESERVED, RESERVED));
}

#[test]
fn pops_follow_push_order_across_interleaving() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&reliable_options(dir.path(), MIB, 0), &registry);

    feed(&queue, &registry, 0, 3, 64);
    let first = consume(&queue, 2);
    feed(&queue, &registry, 3, 3, 64);
    let rest = consume(&queue, 4);

    assert_ids(&first, 0..2);
    assert_ids(&rest, 2..6);
    queue.ack_backlog(6);
}

#[test]
fn acks_commute() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();

    let split = started_queue(
        &reliable_options(&dir.path().join("split"), MIB, 0),
        &registry,
    );
    let joint = started_queue(
        &reliable_options(&dir.path().join("joint"), MIB, 0),
        &registry,
    );

    for queue in [&split, &joint] {
        feed(queue, &registry, 0, 6, 100);
        consume(queue, 6);
    }

    split.ack_backlog(2);
    split.ack_backlog(3);
    joint.ack_backlog(5);

    assert_eq!(split.backlog_len(), joint.backlog_len());
    assert_eq!(split.heads(), joint.heads());

    // The remaining backlog entry is the same record on both queues.
    split.rewind_backlog_all();
    joint.rewind_backlog_all();
    assert_eq!(consume(&split, 1)[0].rcpt_id, consume(&joint, 1)[0].rcpt_id);
}

#[test]
fn ack_is_capped_at_the_backlog() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&reliable_options(dir.path(), MIB, 0), &registry);

    feed(&queue, &registry, 0, 3, 100);
    consume(&queue, 3);
    queue.ack_backlog(100);
    assert_eq!(queue.backlog_len(), 0);
    assert_eq!(queue.heads(), (RESERVED, RESERVED, RESERVED));
}

#[test]
fn stored_and_dropped_counters_track_operations() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&non_reliable_options(dir.path(), MIB, 64, 100), &registry);

    feed(&queue, &registry, 0, 10, 100);
    assert_eq!(queue.stored_messages(), 10);
    assert_eq!(queue.dropped_messages(), 0);

    consume(&queue, 4);
    assert_eq!(queue.stored_messages(), 6);
}

#[test]
fn push_wakes_a_waiting_consumer() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = Arc::new(started_queue(
        &non_reliable_options(dir.path(), MIB, 64, 100),
        &registry,
    ));

    assert!(!queue.wait_for_records(Duration::from_millis(10)));

    let producer = {
        let queue = Arc::clone(&queue);
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            queue.push_tail(record_of_size(&registry, 1, 32), PathOptions::default());
        })
    };

    assert!(queue.wait_for_records(Duration::from_secs(5)));
    producer.join().unwrap();
    assert_eq!(queue.len(), 1);
}

#[test]
fn concurrent_producers_keep_per_producer_order() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = Arc::new(started_queue(
        &non_reliable_options(dir.path(), MIB, 64, 10_000),
        &registry,
    ));
    queue.set_use_backlog(false);

    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 100;

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let record = record_of_size(&registry, p * 1000 + i, 64);
                    assert!(queue.push_tail(record, PathOptions::default()));
                }
            })
        })
        .collect();

    let mut popped = Vec::new();
    while popped.len() < (PRODUCERS * PER_PRODUCER) as usize {
        match queue.pop_head() {
            Some((record, _)) => popped.push(record.rcpt_id),
            None => {
                queue.wait_for_records(Duration::from_millis(10));
            }
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for p in 0..PRODUCERS {
        let ids: Vec<u64> = popped
            .iter()
            .copied()
            .filter(|id| id / 1000 == p)
            .collect();
        let expected: Vec<u64> = (0..PER_PRODUCER).map(|i| p * 1000 + i).collect();
        assert_eq!(ids, expected, "producer {} records out of order", p);
    }
}

#[test]
fn throttle_value_is_kept_for_the_worker() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue: DiskQueue = started_queue(&reliable_options(dir.path(), MIB, 0), &registry);
    assert_eq!(queue.throttle(), 0);
    queue.set_throttle(200);
    assert_eq!(queue.throttle(), 200);
}
