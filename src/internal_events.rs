//! Structured events emitted by the queue.
//!
//! Each event pairs a log line with the matching metrics update, so that
//! operators get both views from one call site.

use std::path::Path;

use metrics::counter;

pub struct QueueCreated<'a> {
    pub id: &'a str,
    pub capacity: u64,
    pub reliable: bool,
}

impl QueueCreated<'_> {
    pub fn emit(self) {
        debug!(
            queue_id = %self.id,
            capacity = self.capacity,
            reliable = self.reliable,
            "Disk queue created."
        );
        counter!("disk_queue_created_total", "queue_id" => self.id.to_string()).increment(1);
    }
}

pub struct QueueRecordsReceived<'a> {
    pub id: &'a str,
    pub count: u64,
}

impl QueueRecordsReceived<'_> {
    pub fn emit(self) {
        counter!("disk_queue_received_records_total", "queue_id" => self.id.to_string())
            .increment(self.count);
    }
}

pub struct QueueRecordsSent<'a> {
    pub id: &'a str,
    pub count: u64,
}

impl QueueRecordsSent<'_> {
    pub fn emit(self) {
        counter!("disk_queue_sent_records_total", "queue_id" => self.id.to_string())
            .increment(self.count);
    }
}

/// A record could not be stored in any tier and was dropped.
pub struct QueueRecordsDropped<'a> {
    pub id: &'a str,
    pub queue_len: u64,
    pub capacity: u64,
    pub reason: &'static str,
}

impl QueueRecordsDropped<'_> {
    pub fn emit(self) {
        debug!(
            queue_id = %self.id,
            queue_len = self.queue_len,
            capacity = self.capacity,
            reason = self.reason,
            "Destination queue full, dropping record."
        );
        counter!(
            "disk_queue_dropped_records_total",
            "queue_id" => self.id.to_string(),
            "reason" => self.reason,
        )
        .increment(1);
    }
}

pub struct QueueBacklogRewound<'a> {
    pub id: &'a str,
    pub count: u64,
}

impl QueueBacklogRewound<'_> {
    pub fn emit(self) {
        debug!(queue_id = %self.id, count = self.count, "Rewound backlog records.");
        counter!("disk_queue_rewound_records_total", "queue_id" => self.id.to_string())
            .increment(self.count);
    }
}

/// The queue file failed validation and is being renamed aside.
pub struct QueueCorrupted<'a> {
    pub id: &'a str,
    pub path: &'a Path,
}

impl QueueCorrupted<'_> {
    pub fn emit(self) {
        error!(
            queue_id = %self.id,
            path = %self.path.display(),
            "Corrupt disk-queue file, renaming it aside and starting fresh."
        );
        counter!("disk_queue_corruptions_total", "queue_id" => self.id.to_string()).increment(1);
    }
}
