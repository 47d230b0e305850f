//! Non-reliable variant: a three-tier pipeline consumed in FIFO order.
//!
//! `qout` is the in-memory fast path the consumer drains first; the disk
//! file catches up when `qout` is occupied; `qoverflow` stages records
//! while the disk has no room.  After every successful pop the tiers are
//! rebalanced: `qout` is refilled up to half its capacity to smooth
//! consumer jitter, and the overflow drains towards disk (or straight
//! into `qout` while the disk is empty).  A record that fits nowhere is
//! dropped.

use std::{collections::VecDeque, path::Path, sync::Arc};

use parking_lot::Mutex;
use snafu::ResultExt;

use crate::{
    codec,
    config::DiskQueueOptions,
    payload::NvRegistry,
    qdisk::{QDisk, QDiskSettings, SidecarEntry},
    record::LogRecord,
};

use super::{
    read_record, restart_corrupted, write_record, CodecSnafu, DiskSnafu, PathOptions, QueueError,
};

/// Headroom probed for before moving an overflow record to disk.
const OVERFLOW_MOVE_HEADROOM: u64 = 4096;

#[derive(Debug, Clone)]
pub(crate) struct MemEntry {
    pub(crate) record: Arc<LogRecord>,
    pub(crate) options: PathOptions,
}

pub struct NonReliableQueue {
    pub(crate) qdisk: QDisk,
    /// Consumer fast path, bounded by `qout_size`.
    pub(crate) qout: VecDeque<MemEntry>,
    /// Popped-but-unacked records, in pop order.
    pub(crate) qbacklog: VecDeque<MemEntry>,
    /// Producer staging area while the disk is full, bounded by
    /// `mem_buf_length`.
    pub(crate) qoverflow: VecDeque<MemEntry>,
    qout_size: usize,
    qoverflow_size: usize,
    registry: Arc<Mutex<NvRegistry>>,
    id: String,
}

impl NonReliableQueue {
    pub(crate) fn new(
        options: &DiskQueueOptions,
        registry: Arc<Mutex<NvRegistry>>,
        id: String,
    ) -> Self {
        NonReliableQueue {
            qdisk: QDisk::new(QDiskSettings {
                capacity: options.disk_buf_size,
                reliable: false,
                read_only: options.read_only,
                mem_buf_size: 0,
                dir: options.dir.clone(),
            }),
            qout: VecDeque::new(),
            qbacklog: VecDeque::new(),
            qoverflow: VecDeque::new(),
            qout_size: options.qout_size,
            qoverflow_size: options.mem_buf_length,
            registry,
            id,
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.qout.len() as u64 + self.qdisk.length() + self.qoverflow.len() as u64
    }

    pub(crate) fn push_tail(&mut self, record: Arc<LogRecord>, options: PathOptions) -> bool {
        if self.qout.len() < self.qout_size && self.qdisk.length() == 0 {
            // Fast path, no disk copy.  Entries pushed here never carry
            // flow control, that only happens through a backlog rewind.
            self.qout.push_back(MemEntry {
                record,
                options: PathOptions { ack_needed: false },
            });
            return true;
        }

        if self.qoverflow.is_empty() {
            match write_record(&mut self.qdisk, &record) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(error) => {
                    error!(%error, "Failed to write record to queue file.");
                }
            }
        }

        if self.qoverflow.len() < self.qoverflow_size {
            self.qoverflow.push_back(MemEntry { record, options });
            return true;
        }
        false
    }

    pub(crate) fn push_head(&mut self, record: Arc<LogRecord>, options: PathOptions) {
        self.qout.push_front(MemEntry { record, options });
    }

    pub(crate) fn pop_head(&mut self, use_backlog: bool) -> Option<(Arc<LogRecord>, PathOptions)> {
        let mut popped = self.qout.pop_front().map(|e| (e.record, e.options));

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

        if popped.is_none() && self.qdisk.is_read_only() {
            popped = self.qoverflow.pop_front().map(|e| (e.record, e.options));
        }

        if let Some((record, options)) = &popped {
            if use_backlog {
                self.qbacklog.push_back(MemEntry {
                    record: Arc::clone(record),
                    options: *options,
                });
            }
            self.move_records();
        }
        popped
    }

    pub(crate) fn ack_backlog(&mut self, count: u64) {
        for _ in 0..count {
            if self.qbacklog.pop_front().is_none() {
                return;
            }
        }
    }

    pub(crate) fn rewind_backlog(&mut self, count: u64) -> u64 {
        let count = usize::try_from(count.min(self.qbacklog.len() as u64)).expect("capped");
        if count == 0 {
            return 0;
        }
        let idx = self.qbacklog.len() - count;
        let moved: Vec<MemEntry> = self.qbacklog.drain(idx..).collect();
        for entry in moved.into_iter().rev() {
            self.qout.push_front(entry);
        }
        count as u64
    }

    /// Rebalances the tiers after a pop.
    fn move_records(&mut self) {
        if self.qdisk.is_read_only() {
            return;
        }
        if self.qout.is_empty() && self.qout_size > 0 {
            // Refill only up to half of qout at a time.
            while let Some((record, _)) = self.next_buffered() {
                self.qout.push_back(MemEntry {
                    record,
                    options: PathOptions { ack_needed: false },
                });
                if self.qout.len() >= self.qout_size / 2 {
                    break;
                }
            }
        }
        self.drain_overflow();
    }

    /// Next record from disk, or from the overflow once the disk is empty.
    fn next_buffered(&mut self) -> Option<(Arc<LogRecord>, PathOptions)> {
        if self.qdisk.length() > 0 {
            return match read_record(&mut self.qdisk, &self.registry) {
                Ok(Some(record)) => Some((record, PathOptions { ack_needed: false })),
                Ok(None) => None,
                Err(error) => {
                    error!(%error, "Error reading from disk-queue file.");
                    restart_corrupted(&mut self.qdisk, &self.id);
                    None
                }
            };
        }
        self.qoverflow.pop_front().map(|e| (e.record, e.options))
    }

    /// Moves as much of the overflow as possible towards the consumer.
    fn drain_overflow(&mut self) {
        while self.has_movable_record() {
            let entry = self.qoverflow.pop_front().expect("checked non-empty");
            if self.qdisk.length() == 0 && self.qout.len() < self.qout_size {
                self.qout.push_back(MemEntry {
                    record: entry.record,
                    options: PathOptions { ack_needed: false },
                });
            } else {
                match write_record(&mut self.qdisk, &entry.record) {
                    Ok(true) => {}
                    Ok(false) => {
                        // The headroom probe can undershoot a large record;
                        // put it back and stop at the first failing write.
                        self.qoverflow.push_front(entry);
                        break;
                    }
                    Err(error) => {
                        error!(%error, "Failed to move overflow record to queue file.");
                        self.qoverflow.push_front(entry);
                        break;
                    }
                }
            }
        }
    }

    fn has_movable_record(&self) -> bool {
        !self.qoverflow.is_empty()
            && ((self.qout.len() < self.qout_size && self.qdisk.length() == 0)
                || self.qdisk.is_space_avail(OVERFLOW_MOVE_HEADROOM))
    }

    /// Persists the header and all three sidecar queues, then closes the
    /// file.  The sidecars are drained into the file, so the in-memory
    /// tiers are empty afterwards.
    pub(crate) fn save_queue(&mut self) -> Result<bool, QueueError> {
        let qout = encode_entries(&self.qout);
        let qbacklog = encode_entries(&self.qbacklog);
        let qoverflow = encode_entries(&self.qoverflow);
        self.qdisk
            .save_state(Some([&qout, &qbacklog, &qoverflow]))
            .context(DiskSnafu)?;
        self.qdisk.stop().context(DiskSnafu)?;
        self.qout.clear();
        self.qbacklog.clear();
        self.qoverflow.clear();
        Ok(true)
    }

    pub(crate) fn load_queue(&mut self, path: Option<&Path>) -> Result<(), QueueError> {
        debug_assert!(!self.qdisk.started(), "load on a started queue");
        if let Some(restored) = self.qdisk.start(path).context(DiskSnafu)? {
            if let Err(error) = self.restore_sidecars(restored) {
                self.qdisk.abandon();
                self.qout.clear();
                self.qbacklog.clear();
                self.qoverflow.clear();
                return Err(error);
            }
        }
        Ok(())
    }

    fn restore_sidecars(
        &mut self,
        restored: [Vec<SidecarEntry>; 3],
    ) -> Result<(), QueueError> {
        let [qout, qbacklog, qoverflow] = restored;
        self.qout = decode_entries(qout, &self.registry)?;
        self.qbacklog = decode_entries(qbacklog, &self.registry)?;
        self.qoverflow = decode_entries(qoverflow, &self.registry)?;
        Ok(())
    }
}

fn encode_entries(entries: &VecDeque<MemEntry>) -> Vec<SidecarEntry> {
    entries
        .iter()
        .map(|entry| SidecarEntry {
            payload: codec::serialize_to_bytes(&entry.record),
            ack_needed: entry.options.ack_needed,
        })
        .collect()
}

fn decode_entries(
    entries: Vec<SidecarEntry>,
    registry: &Mutex<NvRegistry>,
) -> Result<VecDeque<MemEntry>, QueueError> {
    entries
        .into_iter()
        .map(|entry| {
            let mut buf = entry.payload;
            let record = codec::deserialize(&mut buf, &mut registry.lock()).context(CodecSnafu)?;
            Ok(MemEntry {
                record: Arc::new(record),
                options: PathOptions {
                    ack_needed: entry.ack_needed,
                },
            })
        })
        .collect()
}
