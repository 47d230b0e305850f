use std::{path::Path, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    config::DiskQueueOptions,
    payload::NvRegistry,
    queue::{DiskQueue, PathOptions},
    record::LogRecord,
};

mod basic;
mod corruption;
mod non_reliable;

pub(crate) fn nv_registry() -> Arc<Mutex<NvRegistry>> {
    Arc::new(Mutex::new(NvRegistry::new()))
}

pub(crate) fn reliable_options(dir: &Path, capacity: u64, mem_buf_size: u64) -> DiskQueueOptions {
    let mut options = DiskQueueOptions::new(capacity, dir);
    options.reliable = true;
    options.mem_buf_size = mem_buf_size;
    options
}

pub(crate) fn non_reliable_options(
    dir: &Path,
    capacity: u64,
    qout_size: usize,
    mem_buf_length: usize,
) -> DiskQueueOptions {
    let mut options = DiskQueueOptions::new(capacity, dir);
    options.qout_size = qout_size;
    options.mem_buf_length = mem_buf_length;
    options
}

/// A queue attached to a fresh file, with backlog tracking on, the way
/// the destination worker runs it.
pub(crate) fn started_queue(
    options: &DiskQueueOptions,
    registry: &Arc<Mutex<NvRegistry>>,
) -> DiskQueue {
    let queue = DiskQueue::new(options, Arc::clone(registry), Some("test-dest"));
    queue.load_queue(None).expect("fresh queue file");
    queue.set_use_backlog(true);
    queue
}

/// A record whose MESSAGE value is `body` bytes long.
pub(crate) fn record_of_size(
    registry: &Arc<Mutex<NvRegistry>>,
    rcpt_id: u64,
    body: usize,
) -> Arc<LogRecord> {
    let mut record = LogRecord::new();
    record.rcpt_id = rcpt_id;
    record.pri = 134;
    record
        .payload
        .set_direct(&mut registry.lock(), "MESSAGE", Bytes::from(vec![b'x'; body]));
    Arc::new(record)
}

/// Pushes `count` records with receipt ids `start..start + count`,
/// asserting that none are dropped.
pub(crate) fn feed(
    queue: &DiskQueue,
    registry: &Arc<Mutex<NvRegistry>>,
    start: u64,
    count: u64,
    body: usize,
) {
    for i in 0..count {
        let record = record_of_size(registry, start + i, body);
        assert!(
            queue.push_tail(record, PathOptions { ack_needed: true }),
            "push {} unexpectedly dropped",
            start + i
        );
    }
}

/// Pushes `count` records, allowing drops; returns how many were stored.
pub(crate) fn feed_counting(
    queue: &DiskQueue,
    registry: &Arc<Mutex<NvRegistry>>,
    start: u64,
    count: u64,
    body: usize,
) -> u64 {
    let mut stored = 0;
    for i in 0..count {
        let record = record_of_size(registry, start + i, body);
        if queue.push_tail(record, PathOptions { ack_needed: true }) {
            stored += 1;
        }
    }
    stored
}

/// Pops exactly `count` records, asserting availability.
pub(crate) fn consume(queue: &DiskQueue, count: u64) -> Vec<Arc<LogRecord>> {
    (0..count)
        .map(|i| {
            queue
                .pop_head()
                .unwrap_or_else(|| panic!("pop {} returned nothing", i))
                .0
        })
        .collect()
}

pub(crate) fn assert_ids(records: &[Arc<LogRecord>], expected: impl Iterator<Item = u64>) {
    let ids: Vec<u64> = records.iter().map(|r| r.rcpt_id).collect();
    let expected: Vec<u64> = expected.collect();
    assert_eq!(ids, expected);
}
