//! Reliable variant: every record is durable on disk before the producer
//! is acknowledged.
//!
//! Pushes always go to the file.  When the remaining free space falls
//! under the configured memory reservation, the pushed record is
//! additionally kept resident in `qreliable`, tagged with its file
//! position; the producer's acknowledgement is withheld so flow control
//! keeps the producer throttled while the file is nearly full.  Pops
//! consume memory and disk in lock-step when the resident head matches
//! the read head, and deserialize from disk otherwise.

use std::{collections::VecDeque, path::Path, sync::Arc};

use parking_lot::Mutex;
use snafu::ResultExt;

use crate::{
    config::DiskQueueOptions,
    payload::NvRegistry,
    qdisk::{QDisk, QDiskSettings},
    record::LogRecord,
};

use super::{
    read_record, restart_corrupted, write_record, DiskSnafu, PathOptions, QueueError,
};

/// A resident record together with its on-disk position.
#[derive(Debug, Clone)]
pub(crate) struct DiskEntry {
    pub(crate) pos: u64,
    pub(crate) record: Arc<LogRecord>,
    pub(crate) options: PathOptions,
}

pub struct ReliableQueue {
    pub(crate) qdisk: QDisk,
    /// Records whose disk copy exists but which crossed the memory
    /// reservation threshold, oldest first.
    pub(crate) qreliable: VecDeque<DiskEntry>,
    /// Popped resident records awaiting ack, in pop order.
    pub(crate) qbacklog: VecDeque<DiskEntry>,
    registry: Arc<Mutex<NvRegistry>>,
    id: String,
}

impl ReliableQueue {
    pub(crate) fn new(
        options: &DiskQueueOptions,
        registry: Arc<Mutex<NvRegistry>>,
        id: String,
    ) -> Self {
        ReliableQueue {
            qdisk: QDisk::new(QDiskSettings {
                capacity: options.disk_buf_size,
                reliable: true,
                read_only: options.read_only,
                mem_buf_size: options.mem_buf_size,
                dir: options.dir.clone(),
            }),
            qreliable: VecDeque::new(),
            qbacklog: VecDeque::new(),
            registry,
            id,
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.qdisk.length()
    }

    pub(crate) fn push_tail(&mut self, record: Arc<LogRecord>, options: PathOptions) -> bool {
        let last_wpos = self.qdisk.write_head();
        match write_record(&mut self.qdisk, &record) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(error) => {
                error!(%error, "Failed to write record to reliable queue file.");
                return false;
            }
        }

        if self.qdisk.free_space() < self.qdisk.mem_buf_size() {
            // Crossed the reservation threshold: the record stays resident
            // and its producer ack is withheld until the backlog drains.
            self.qreliable.push_back(DiskEntry {
                pos: last_wpos,
                record,
                options,
            });
        }
        true
    }

    pub(crate) fn pop_head(&mut self, use_backlog: bool) -> Option<(Arc<LogRecord>, PathOptions)> {
        let mut popped = None;

        if let Some(front) = self.qreliable.front() {
            if front.pos == self.qdisk.read_head() {
                let entry = self.qreliable.pop_front().expect("front checked above");
                // Advance the disk pointers past the copy held in memory.
                match self.qdisk.pop_head() {
                    Ok(_) => {}
                    Err(error) => {
                        error!(%error, "Failed to skip the on-disk copy of a resident record.");
                        restart_corrupted(&mut self.qdisk, &self.id);
                        return Some((entry.record, entry.options));
                    }
                }
                if use_backlog {
                    self.qbacklog.push_back(DiskEntry {
                        pos: entry.pos,
                        record: Arc::clone(&entry.record),
                        options: entry.options,
                    });
                }
                popped = Some((entry.record, entry.options));
            }
        }

        if popped.is_none() {
            match read_record(&mut self.qdisk, &self.registry) {
                Ok(Some(record)) => {
                    popped = Some((record, PathOptions { ack_needed: false }));
                }
                Ok(None) => {}
                Err(error) => {
                    error!(%error, "Error reading from disk-queue file.");
                    restart_corrupted(&mut self.qdisk, &self.id);
                    return None;
                }
            }
        }

        if popped.is_some() {
            if use_backlog {
                self.qdisk.inc_backlog();
            } else {
                let read_head = self.qdisk.read_head();
                self.qdisk.set_backlog_head(read_head);
            }
        }
        popped
    }

    pub(crate) fn ack_backlog(&mut self, count: u64) {
        for _ in 0..count {
            if self.qdisk.backlog_head() == self.qdisk.read_head() {
                break;
            }
            if let Some(front) = self.qbacklog.front() {
                if front.pos == self.qdisk.backlog_head() {
                    self.qbacklog.pop_front();
                }
            }
            let backlog_head = self.qdisk.backlog_head();
            match self.qdisk.skip_record(backlog_head) {
                Ok(next) => self.qdisk.set_backlog_head(next),
                Err(error) => {
                    error!(%error, "Failed to walk the backlog while acking.");
                    restart_corrupted(&mut self.qdisk, &self.id);
                    return;
                }
            }
            self.qdisk.dec_backlog();
        }
        if let Err(error) = self.qdisk.reset_file_if_possible() {
            error!(%error, "Failed to compact the queue file.");
        }
    }

    pub(crate) fn rewind_backlog(&mut self, count: u64) -> u64 {
        let count = count.min(self.qdisk.backlog_count());
        if count == 0 {
            return 0;
        }
        let stay = self.qdisk.backlog_count() - count;

        let mut new_read_head = self.qdisk.backlog_head();
        for _ in 0..stay {
            match self.qdisk.skip_record(new_read_head) {
                Ok(next) => new_read_head = next,
                Err(error) => {
                    error!(%error, "Failed to walk the backlog while rewinding.");
                    restart_corrupted(&mut self.qdisk, &self.id);
                    return 0;
                }
            }
        }

        // Resident backlog entries at or after the new read head return to
        // the front of the resident queue, oldest first.
        if let Some(idx) = self.qbacklog.iter().position(|e| e.pos == new_read_head) {
            let moved: Vec<DiskEntry> = self.qbacklog.drain(idx..).collect();
            for entry in moved.into_iter().rev() {
                self.qreliable.push_front(entry);
            }
        }

        self.qdisk.set_backlog_count(stay);
        self.qdisk.set_read_head(new_read_head);
        let length = self.qdisk.length();
        self.qdisk.set_length(length + count);
        count
    }

    /// Persists the header and closes the file.  The resident copies are
    /// not saved, their disk copies are the source of truth.
    pub(crate) fn save_queue(&mut self) -> Result<bool, QueueError> {
        self.qdisk.save_state(None).context(DiskSnafu)?;
        self.qdisk.stop().context(DiskSnafu)?;
        Ok(true)
    }

    pub(crate) fn load_queue(&mut self, path: Option<&Path>) -> Result<(), QueueError> {
        debug_assert!(!self.qdisk.started(), "load on a started queue");
        self.qreliable.clear();
        self.qdisk.start(path).context(DiskSnafu)?;
        Ok(())
    }
}
