//! Disk-backed queue facade.
//!
//! [`DiskQueue`] provides the uniform push/pop/ack/rewind contract over
//! the two concrete variants.  Every operation acquires the per-queue
//! mutex for the duration of its logical work, including the file I/O it
//! needs; producers are any number of threads, the consumer is the single
//! destination worker.  A condvar notifies the worker of new records, the
//! signal is raised while the lock is still held and received after it is
//! dropped.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use snafu::{ResultExt, Snafu};

use crate::{
    codec::{self, CodecError},
    config::DiskQueueOptions,
    internal_events::{
        QueueBacklogRewound, QueueCorrupted, QueueCreated, QueueRecordsDropped,
        QueueRecordsReceived, QueueRecordsSent,
    },
    payload::NvRegistry,
    qdisk::{QDisk, QDiskError},
    record::LogRecord,
};

mod non_reliable;
mod reliable;

#[cfg(test)]
mod tests;

pub use self::{non_reliable::NonReliableQueue, reliable::ReliableQueue};

/// Flow-control state a producer attaches to a record in flight.
///
/// `ack_needed` records whether the producer still waits for a delivery
/// acknowledgement; the flag travels with the record through the sidecar
/// queues and comes back out of `pop_head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathOptions {
    pub ack_needed: bool,
}

/// Error raised while saving or loading queue state.
#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("queue file error: {}", source))]
    Disk { source: QDiskError },

    #[snafu(display("stored record could not be decoded: {}", source))]
    Codec { source: CodecError },
}

pub(crate) struct Inner {
    pub(crate) variant: Variant,
    pub(crate) use_backlog: bool,
}

pub(crate) enum Variant {
    Reliable(ReliableQueue),
    NonReliable(NonReliableQueue),
}

impl Variant {
    pub(crate) fn qdisk(&self) -> &QDisk {
        match self {
            Variant::Reliable(q) => &q.qdisk,
            Variant::NonReliable(q) => &q.qdisk,
        }
    }

    fn len(&self) -> u64 {
        match self {
            Variant::Reliable(q) => q.len(),
            Variant::NonReliable(q) => q.len(),
        }
    }

    fn push_tail(&mut self, record: Arc<LogRecord>, options: PathOptions) -> bool {
        match self {
            Variant::Reliable(q) => q.push_tail(record, options),
            Variant::NonReliable(q) => q.push_tail(record, options),
        }
    }

    fn push_head(&mut self, record: Arc<LogRecord>, options: PathOptions) -> bool {
        match self {
            // The reliable variant has no front-insert path; rewinding the
            // backlog is how records return to it.
            Variant::Reliable(_) => false,
            Variant::NonReliable(q) => {
                q.push_head(record, options);
                true
            }
        }
    }

    fn pop_head(&mut self, use_backlog: bool) -> Option<(Arc<LogRecord>, PathOptions)> {
        match self {
            Variant::Reliable(q) => q.pop_head(use_backlog),
            Variant::NonReliable(q) => q.pop_head(use_backlog),
        }
    }

    fn ack_backlog(&mut self, count: u64) {
        match self {
            Variant::Reliable(q) => q.ack_backlog(count),
            Variant::NonReliable(q) => q.ack_backlog(count),
        }
    }

    fn rewind_backlog(&mut self, count: u64) -> u64 {
        match self {
            Variant::Reliable(q) => q.rewind_backlog(count),
            Variant::NonReliable(q) => q.rewind_backlog(count),
        }
    }

    fn backlog_len(&self) -> u64 {
        match self {
            Variant::Reliable(q) => q.qdisk.backlog_count(),
            Variant::NonReliable(q) => q.qbacklog.len() as u64,
        }
    }

    fn save_queue(&mut self) -> Result<bool, QueueError> {
        match self {
            Variant::Reliable(q) => q.save_queue(),
            Variant::NonReliable(q) => q.save_queue(),
        }
    }

    fn load_queue(&mut self, path: Option<&Path>) -> Result<(), QueueError> {
        match self {
            Variant::Reliable(q) => q.load_queue(path),
            Variant::NonReliable(q) => q.load_queue(path),
        }
    }
}

/// A disk-backed FIFO between producer threads and one consumer worker.
pub struct DiskQueue {
    inner: Mutex<Inner>,
    notify: Condvar,
    reliable: bool,
    persist_name: Option<String>,
    id: String,
    stored: AtomicU64,
    dropped: AtomicU64,
    throttle: AtomicU32,
}

impl DiskQueue {
    /// Creates a queue of the variant selected by `options.reliable`.
    /// The queue file is not opened until [`DiskQueue::load_queue`].
    pub fn new(
        options: &DiskQueueOptions,
        registry: Arc<Mutex<NvRegistry>>,
        persist_name: Option<&str>,
    ) -> Self {
        let id = persist_name.unwrap_or("diskbuffer").to_owned();
        let variant = if options.reliable {
            Variant::Reliable(ReliableQueue::new(options, registry, id.clone()))
        } else {
            Variant::NonReliable(NonReliableQueue::new(options, registry, id.clone()))
        };
        QueueCreated {
            id: &id,
            capacity: options.disk_buf_size,
            reliable: options.reliable,
        }
        .emit();
        DiskQueue {
            inner: Mutex::new(Inner {
                variant,
                use_backlog: false,
            }),
            notify: Condvar::new(),
            reliable: options.reliable,
            persist_name: persist_name.map(str::to_owned),
            id,
            stored: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            throttle: AtomicU32::new(0),
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn persist_name(&self) -> Option<&str> {
        self.persist_name.as_deref()
    }

    /// Path of the backing file, once one has been opened.
    pub fn filename(&self) -> Option<PathBuf> {
        self.inner.lock().variant.qdisk().path().map(Path::to_path_buf)
    }

    /// Enables backlog tracking.  The consumer worker turns this on before
    /// it starts popping, so that failed deliveries can be rewound.
    pub fn set_use_backlog(&self, use_backlog: bool) {
        self.inner.lock().use_backlog = use_backlog;
    }

    /// Rate limit, in records per second, for the consumer worker.
    /// Zero means unlimited.  The queue stores the value; enforcing it is
    /// the worker's job.
    pub fn set_throttle(&self, per_sec: u32) {
        self.throttle.store(per_sec, Ordering::Relaxed);
    }

    pub fn throttle(&self) -> u32 {
        self.throttle.load(Ordering::Relaxed)
    }

    /// Number of records currently stored and not yet popped.
    pub fn len(&self) -> u64 {
        self.inner.lock().variant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped because no tier could hold them.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records currently accounted as stored, including rewound ones.
    pub fn stored_messages(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    /// Appends a record.  Never blocks: when no tier can hold the record
    /// it is dropped, the drop is counted, and `false` is returned.  A
    /// successful push wakes the consumer.
    pub fn push_tail(&self, record: Arc<LogRecord>, options: PathOptions) -> bool {
        let mut inner = self.inner.lock();
        if inner.variant.push_tail(record, options) {
            self.stored.fetch_add(1, Ordering::Relaxed);
            QueueRecordsReceived { id: &self.id, count: 1 }.emit();
            self.notify.notify_one();
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            QueueRecordsDropped {
                id: &self.id,
                queue_len: inner.variant.len(),
                capacity: inner.variant.qdisk().capacity(),
                reason: "full",
            }
            .emit();
            false
        }
    }

    /// Re-inserts a record at the front, ahead of everything queued.
    /// Used after a consumer-side refusal that should not reorder the
    /// stream.  Only the non-reliable variant supports it.
    pub fn push_head(&self, record: Arc<LogRecord>, options: PathOptions) -> bool {
        let mut inner = self.inner.lock();
        if inner.variant.push_head(record, options) {
            self.stored.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Pops the next record in FIFO order, or `None` when the queue is
    /// empty.  With backlog tracking enabled the record stays reachable
    /// for [`DiskQueue::ack_backlog`] / [`DiskQueue::rewind_backlog`].
    pub fn pop_head(&self) -> Option<(Arc<LogRecord>, PathOptions)> {
        let mut inner = self.inner.lock();
        let use_backlog = inner.use_backlog;
        let popped = inner.variant.pop_head(use_backlog);
        if popped.is_some() {
            self.stored.fetch_sub(1, Ordering::Relaxed);
            QueueRecordsSent { id: &self.id, count: 1 }.emit();
        }
        popped
    }

    /// Releases the `count` oldest backlog records.  Capped at the current
    /// backlog size.
    pub fn ack_backlog(&self, count: u64) {
        self.inner.lock().variant.ack_backlog(count);
    }

    /// Moves the `count` newest backlog records back into the consumable
    /// region, preserving their order.  Capped at the current backlog
    /// size.
    pub fn rewind_backlog(&self, count: u64) {
        let mut inner = self.inner.lock();
        let rewound = inner.variant.rewind_backlog(count);
        if rewound > 0 {
            self.stored.fetch_add(rewound, Ordering::Relaxed);
            QueueBacklogRewound {
                id: &self.id,
                count: rewound,
            }
            .emit();
        }
    }

    /// Rewinds the entire backlog.
    pub fn rewind_backlog_all(&self) {
        let count = self.inner.lock().variant.backlog_len();
        self.rewind_backlog(count);
    }

    /// Persists all queue state and closes the file.  Returns whether
    /// anything was persisted, which is `false` when the file was never
    /// opened.
    ///
    /// # Errors
    ///
    /// Propagates save failures; the queue stays usable for another
    /// attempt.
    pub fn save_queue(&self) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        if !inner.variant.qdisk().started() {
            return Ok(false);
        }
        inner.variant.save_queue()
    }

    /// Opens the queue file at `path`, or creates a fresh one when `path`
    /// is `None`, restoring any persisted state.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or fails validation; the
    /// caller decides whether to fall back to a fresh file.
    pub fn load_queue(&self, path: Option<&Path>) -> Result<(), QueueError> {
        self.inner.lock().variant.load_queue(path)
    }

    /// Blocks the consumer until a record is available or `timeout`
    /// elapses.  Returns whether the queue is non-empty.
    pub fn wait_for_records(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.variant.len() > 0 {
            return true;
        }
        let _ = self.notify.wait_for(&mut inner, timeout);
        inner.variant.len() > 0
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> parking_lot::MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    #[cfg(test)]
    pub(crate) fn heads(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock();
        let qdisk = inner.variant.qdisk();
        (qdisk.write_head(), qdisk.read_head(), qdisk.backlog_head())
    }

    #[cfg(test)]
    pub(crate) fn backlog_len(&self) -> u64 {
        self.inner.lock().variant.backlog_len()
    }
}

/// Serializes `record` and appends it to the queue file.  A cheap probe
/// for minimal headroom runs before serialization.
pub(crate) fn write_record(qdisk: &mut QDisk, record: &LogRecord) -> Result<bool, QDiskError> {
    if !qdisk.started() || !qdisk.is_space_avail(64) {
        return Ok(false);
    }
    let bytes = codec::serialize_to_bytes(record);
    qdisk.push_tail(&bytes)
}

/// Pops the next record from the queue file and decodes it.
pub(crate) fn read_record(
    qdisk: &mut QDisk,
    registry: &Mutex<NvRegistry>,
) -> Result<Option<Arc<LogRecord>>, QueueError> {
    if !qdisk.started() {
        return Ok(None);
    }
    match qdisk.pop_head().context(DiskSnafu)? {
        None => Ok(None),
        Some(mut bytes) => {
            let record =
                codec::deserialize(&mut bytes, &mut registry.lock()).context(CodecSnafu)?;
            Ok(Some(Arc::new(record)))
        }
    }
}

/// Closes a queue file that failed validation mid-operation, renames it
/// aside with a `.corrupted` suffix and starts a fresh file under the
/// original path.  At most the record in flight is lost.
pub(crate) fn restart_corrupted(qdisk: &mut QDisk, id: &str) {
    let Some(path) = qdisk.path().map(Path::to_path_buf) else {
        return;
    };
    QueueCorrupted { id, path: &path }.emit();
    qdisk.abandon();

    let mut renamed = path.clone().into_os_string();
    renamed.push(".corrupted");
    if let Err(error) = fs::rename(&path, PathBuf::from(renamed)) {
        error!(%error, path = %path.display(), "Failed to rename corrupt queue file.");
    }
    if let Err(error) = qdisk.start(Some(&path)) {
        error!(%error, path = %path.display(), "Failed to restart queue file after corruption.");
    }
}
