use pretty_assertions::assert_eq;
use temp_dir::TempDir;

use super::{
    assert_ids, consume, feed, feed_counting, non_reliable_options, nv_registry, record_of_size,
    started_queue,
};
use crate::{
    qdisk::RESERVED,
    queue::{PathOptions, Variant},
};

const MIB: u64 = 1024 * 1024;

#[test]
fn fast_path_skips_the_disk() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&non_reliable_options(dir.path(), MIB, 64, 1000), &registry);

    feed(&queue, &registry, 0, 32, 100);
    assert_eq!(queue.heads(), (RESERVED, RESERVED, RESERVED));

    let popped = consume(&queue, 32);
    assert_ids(&popped, 0..32);
    assert_eq!(queue.heads(), (RESERVED, RESERVED, RESERVED));
    queue.ack_backlog(32);
}

#[test]
fn overflow_fills_tier_by_tier_and_then_drops() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&non_reliable_options(dir.path(), MIB, 64, 1000), &registry);

    // Consumer stopped: push far more than every tier can hold.
    let stored = feed_counting(&queue, &registry, 0, 2000, 2048);
    let dropped = queue.dropped_messages();
    assert_eq!(stored + dropped, 2000);
    assert_eq!(queue.len(), stored);
    assert!(dropped > 0, "the final pushes must overflow every tier");

    {
        let inner = queue.inner();
        let Variant::NonReliable(q) = &inner.variant else {
            panic!("non-reliable queue expected");
        };
        assert_eq!(q.qout.len(), 64);
        assert_eq!(q.qoverflow.len(), 1000);
        assert_eq!(q.qdisk.length(), stored - 64 - 1000);
        // The file itself refused the next record.
        assert!(!q.qdisk.is_space_avail(2048 + 110));
    }

    // Resuming the consumer drains every stored record in push order.
    let popped = consume(&queue, stored);
    assert_ids(&popped, 0..stored);
    assert_eq!(queue.len(), 0);
    assert!(queue.pop_head().is_none());
    queue.ack_backlog(stored);
}

#[test]
fn qout_refills_to_half_capacity_after_a_pop() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&non_reliable_options(dir.path(), MIB, 64, 1000), &registry);

    // Fill qout, then force the rest onto disk.
    feed(&queue, &registry, 0, 200, 100);
    {
        let inner = queue.inner();
        let Variant::NonReliable(q) = &inner.variant else {
            panic!("non-reliable queue expected");
        };
        assert_eq!(q.qout.len(), 64);
        assert_eq!(q.qdisk.length(), 136);
    }

    // Drain qout; the next pops trigger a refill of at most half of qout.
    consume(&queue, 65);
    {
        let inner = queue.inner();
        let Variant::NonReliable(q) = &inner.variant else {
            panic!("non-reliable queue expected");
        };
        assert!(q.qout.len() <= 32, "qout refilled past half: {}", q.qout.len());
        assert!(!q.qout.is_empty());
    }
    queue.ack_backlog(65);
}

#[test]
fn push_head_goes_out_first() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&non_reliable_options(dir.path(), MIB, 64, 1000), &registry);

    feed(&queue, &registry, 0, 3, 100);
    let urgent = record_of_size(&registry, 99, 100);
    assert!(queue.push_head(urgent, PathOptions::default()));

    let popped = consume(&queue, 4);
    assert_ids(&popped, [99, 0, 1, 2].into_iter());
    queue.ack_backlog(4);
}

#[test]
fn overflow_drains_into_freed_disk_space() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&non_reliable_options(dir.path(), MIB, 64, 500), &registry);

    let stored = feed_counting(&queue, &registry, 0, 1200, 2048);
    let overflow_before = {
        let inner = queue.inner();
        let Variant::NonReliable(q) = &inner.variant else {
            panic!("non-reliable queue expected");
        };
        assert!(!q.qoverflow.is_empty());
        q.qoverflow.len()
    };

    // Popping frees disk space; the background movement walks the
    // overflow towards the file.
    consume(&queue, 100);
    {
        let inner = queue.inner();
        let Variant::NonReliable(q) = &inner.variant else {
            panic!("non-reliable queue expected");
        };
        assert!(
            q.qoverflow.len() < overflow_before,
            "overflow did not shrink: {} -> {}",
            overflow_before,
            q.qoverflow.len()
        );
    }

    let rest = consume(&queue, stored - 100);
    assert_ids(&rest, 100..stored);
    queue.ack_backlog(stored);
}
