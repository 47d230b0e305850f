//! Record-level push/pop on a fixed-size circular queue file.
//!
//! The file starts with a reserved header prefix (see [`header`]) followed
//! by a circular data region.  Each record is framed as a little-endian
//! `u32` length prefix plus that many bytes of codec output.  Records are
//! never split across the wrap point: a record that starts near the region
//! end is written contiguously, temporarily extending the file past the
//! nominal region, and the write pointer then wraps back to the start of
//! the region.  The file therefore never grows by more than one record
//! beyond its configured capacity.
//!
//! Three pointers drive consumption: `write_head` (next write),
//! `read_head` (next pop) and `backlog_head` (oldest popped-but-unacked
//! record).  The queue layer advances `backlog_head` through acks and
//! moves `read_head` backwards through rewinds; in non-reliable mode a pop
//! immediately marks the slot consumed by pinning `backlog_head` to
//! `read_head`.

use std::{
    cmp,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fslock::LockFile;
use memmap2::MmapOptions;
use snafu::{ResultExt, Snafu};

mod header;

pub use self::header::{Header, SidecarSlot, RESERVED};

/// Geometry and behavior settings for one queue file.
#[derive(Debug, Clone)]
pub struct QDiskSettings {
    /// Data-region capacity in bytes.
    pub capacity: u64,
    /// Reliable mode keeps the backlog pointers under caller control;
    /// non-reliable mode consumes a slot as soon as it is popped.
    pub reliable: bool,
    pub read_only: bool,
    /// Reliable variant only: free-space threshold below which pushed
    /// records are also kept resident in memory.
    pub mem_buf_size: u64,
    /// Directory new queue files are created in.
    pub dir: PathBuf,
}

/// One record parked in a persisted sidecar queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarEntry {
    pub payload: Bytes,
    pub ack_needed: bool,
}

/// Restored sidecar queues, in qout / qbacklog / qoverflow order.
pub type RestoredSidecars = [Vec<SidecarEntry>; 3];

/// Error raised by queue file operations.
#[derive(Debug, Snafu)]
pub enum QDiskError {
    /// An I/O operation on the queue file failed.
    #[snafu(display("queue file I/O error: {}", source))]
    Io { source: io::Error },

    /// Another process holds the advisory lock for this queue file.
    #[snafu(display("queue file {:?} is locked by another process", path))]
    Locked { path: PathBuf },

    /// The file failed validation, either at load time or when a frame
    /// turned out to be inconsistent during a pop.  The queue layer
    /// responds by renaming the file aside and starting a fresh one.
    #[snafu(display("corrupt queue file: {}", reason))]
    Corrupt { reason: String },
}

struct Active {
    file: File,
    #[allow(dead_code)]
    lock: LockFile,
    prefix: memmap2::MmapMut,
    hdr: Header,
    path: PathBuf,
    /// Physical length of the file, tracked to validate frame reads.
    file_len: u64,
    reliable: bool,
    read_only: bool,
}

/// A started-or-idle queue file.
pub struct QDisk {
    settings: QDiskSettings,
    state: Option<Active>,
    last_path: Option<PathBuf>,
}

impl QDisk {
    pub fn new(settings: QDiskSettings) -> Self {
        QDisk {
            settings,
            state: None,
            last_path: None,
        }
    }

    pub fn started(&self) -> bool {
        self.state.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    pub fn capacity(&self) -> u64 {
        self.state
            .as_ref()
            .map_or(self.settings.capacity, |a| a.hdr.size)
    }

    pub fn mem_buf_size(&self) -> u64 {
        self.settings.mem_buf_size
    }

    pub fn path(&self) -> Option<&Path> {
        self.state
            .as_ref()
            .map(|a| a.path.as_path())
            .or(self.last_path.as_deref())
    }

    pub fn length(&self) -> u64 {
        self.state.as_ref().map_or(0, |a| a.hdr.length)
    }

    pub fn write_head(&self) -> u64 {
        self.state.as_ref().map_or(RESERVED, |a| a.hdr.write_head)
    }

    pub fn read_head(&self) -> u64 {
        self.state.as_ref().map_or(RESERVED, |a| a.hdr.read_head)
    }

    pub fn backlog_head(&self) -> u64 {
        self.state.as_ref().map_or(RESERVED, |a| a.hdr.backlog_head)
    }

    pub fn backlog_count(&self) -> u64 {
        self.state.as_ref().map_or(0, |a| a.hdr.backlog_count)
    }

    pub fn set_length(&mut self, value: u64) {
        if let Some(a) = &mut self.state {
            a.hdr.length = value;
        }
    }

    pub fn set_read_head(&mut self, value: u64) {
        if let Some(a) = &mut self.state {
            a.hdr.read_head = value;
        }
    }

    pub fn set_backlog_head(&mut self, value: u64) {
        if let Some(a) = &mut self.state {
            a.hdr.backlog_head = value;
        }
    }

    pub fn set_backlog_count(&mut self, value: u64) {
        if let Some(a) = &mut self.state {
            a.hdr.backlog_count = value;
        }
    }

    pub fn inc_backlog(&mut self) {
        if let Some(a) = &mut self.state {
            a.hdr.backlog_count += 1;
        }
    }

    pub fn dec_backlog(&mut self) {
        if let Some(a) = &mut self.state {
            a.hdr.backlog_count = a.hdr.backlog_count.saturating_sub(1);
        }
    }

    /// Free bytes between the write head and the backlog head.
    pub fn free_space(&self) -> u64 {
        self.state.as_ref().map_or(0, Active::free_space)
    }

    /// Whether a record of `need` bytes (plus its length prefix) fits.
    pub fn is_space_avail(&self, need: u64) -> bool {
        self.state
            .as_ref()
            .is_some_and(|a| a.free_space() >= need + 4)
    }

    /// Appends one framed record at the write head.
    ///
    /// Returns `Ok(false)` without writing when the file is read-only,
    /// not started, or out of space.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures; a short write leaves the header pointers
    /// untouched so the partial frame is never observed.
    pub fn push_tail(&mut self, record: &[u8]) -> Result<bool, QDiskError> {
        if self.settings.read_only {
            return Ok(false);
        }
        match &mut self.state {
            Some(a) => a.push_tail(record),
            None => Ok(false),
        }
    }

    /// Pops the record at the read head, advancing it.  Does not touch the
    /// backlog pointers in reliable mode; the caller acks or rewinds.
    ///
    /// # Errors
    ///
    /// Fails with [`QDiskError::Corrupt`] when the frame at the read head
    /// is inconsistent, and with [`QDiskError::Io`] on read failures.
    pub fn pop_head(&mut self) -> Result<Option<Bytes>, QDiskError> {
        match &mut self.state {
            Some(a) => a.pop_head(),
            None => Ok(None),
        }
    }

    /// Returns the position of the record following the one at `pos`.
    ///
    /// # Errors
    ///
    /// Fails with [`QDiskError::Corrupt`] when `pos` does not hold a valid
    /// frame.
    pub fn skip_record(&mut self, pos: u64) -> Result<u64, QDiskError> {
        match &mut self.state {
            Some(a) => {
                let len = a.read_len_prefix(pos)?;
                Ok(a.wrap(pos + 4 + len))
            }
            None => Ok(pos),
        }
    }

    /// Rewinds every pointer to the start of the region and truncates the
    /// file once nothing unread or unacked remains.
    pub fn reset_file_if_possible(&mut self) -> Result<(), QDiskError> {
        if self.settings.read_only {
            return Ok(());
        }
        if let Some(a) = &mut self.state {
            if a.hdr.length == 0 && a.hdr.backlog_count == 0 {
                a.hdr.write_head = RESERVED;
                a.hdr.read_head = RESERVED;
                a.hdr.backlog_head = RESERVED;
                a.file.set_len(RESERVED).context(IoSnafu)?;
                a.file_len = RESERVED;
            }
        }
        Ok(())
    }

    /// Persists the header, and optionally the sidecar queues, then
    /// fsyncs.  Sidecar blobs are appended past the data content and
    /// referenced from descriptors inside the reserved prefix.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures from the blob writes, the header flush and
    /// the fsync.
    pub fn save_state(
        &mut self,
        sidecars: Option<[&[SidecarEntry]; 3]>,
    ) -> Result<(), QDiskError> {
        match &mut self.state {
            Some(a) => a.save_state(sidecars),
            None => Ok(()),
        }
    }

    /// Opens or creates the queue file and validates its header.
    ///
    /// With `path` of `None` a new file is created in the configured
    /// directory.  Returns restored sidecar queues when the header carried
    /// descriptors for them.
    ///
    /// # Errors
    ///
    /// Fails with [`QDiskError::Locked`] when another process holds the
    /// file, [`QDiskError::Corrupt`] when validation fails, and
    /// [`QDiskError::Io`] otherwise.
    pub fn start(&mut self, path: Option<&Path>) -> Result<Option<RestoredSidecars>, QDiskError> {
        debug_assert!(self.state.is_none(), "qdisk started twice");

        let path = match path {
            Some(p) => p.to_path_buf(),
            None => self.new_file_path()?,
        };

        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");
        let lock_path = PathBuf::from(lock_name);
        let mut lock = LockFile::open(&lock_path).context(IoSnafu)?;
        if !lock.try_lock().context(IoSnafu)? {
            return Err(QDiskError::Locked { path });
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .context(IoSnafu)?;
        let mut file_len = file.metadata().context(IoSnafu)?.len();
        let fresh = file_len < RESERVED;
        if fresh {
            file.set_len(RESERVED).context(IoSnafu)?;
            file_len = RESERVED;
        }

        // The mapping covers only the reserved prefix and lives as long as
        // the advisory lock, so nothing else mutates these bytes.
        let mut prefix = unsafe { MmapOptions::new().len(RESERVED as usize).map_mut(&file) }
            .context(IoSnafu)?;

        let reliable = self.settings.reliable;
        let mut restored = None;
        let hdr = if fresh {
            let hdr = Header::new(self.settings.capacity);
            hdr.encode(&mut prefix, reliable);
            prefix.flush().context(IoSnafu)?;
            file.sync_all().context(IoSnafu)?;
            debug!(path = %path.display(), capacity = hdr.size, "Created queue file.");
            hdr
        } else {
            let mut hdr = Header::decode(&prefix, reliable).map_err(|e| QDiskError::Corrupt {
                reason: e.to_string(),
            })?;
            if hdr.size != self.settings.capacity {
                debug!(
                    path = %path.display(),
                    file_capacity = hdr.size,
                    configured_capacity = self.settings.capacity,
                    "Existing queue file keeps its own capacity."
                );
            }
            if hdr.sidecars.iter().any(|s| !s.is_empty()) {
                restored = Some(read_sidecars(&mut file, file_len, &hdr)?);
                hdr.sidecars = [SidecarSlot::default(); 3];
            }
            hdr.encode(&mut prefix, reliable);
            prefix.flush().context(IoSnafu)?;
            debug!(
                path = %path.display(),
                length = hdr.length,
                backlog = hdr.backlog_count,
                "Loaded queue file."
            );
            hdr
        };

        self.last_path = Some(path.clone());
        self.state = Some(Active {
            file,
            lock,
            prefix,
            hdr,
            path,
            file_len,
            reliable: self.settings.reliable,
            read_only: self.settings.read_only,
        });
        Ok(restored)
    }

    /// Persists the header and closes the file.
    ///
    /// # Errors
    ///
    /// Propagates flush and fsync failures; the file is closed either way.
    pub fn stop(&mut self) -> Result<(), QDiskError> {
        if let Some(mut a) = self.state.take() {
            a.hdr.encode(&mut a.prefix, a.reliable);
            a.prefix.flush().context(IoSnafu)?;
            a.file.sync_all().context(IoSnafu)?;
        }
        Ok(())
    }

    /// Closes the file without persisting anything.  Used when the file is
    /// about to be renamed aside as corrupt.
    pub fn abandon(&mut self) {
        self.state = None;
    }

    fn new_file_path(&self) -> Result<PathBuf, QDiskError> {
        fs::create_dir_all(&self.settings.dir).context(IoSnafu)?;
        let ext = if self.settings.reliable { "rqf" } else { "qf" };
        for serial in 0..100_000u32 {
            let candidate = self.settings.dir.join(format!("diskbuf-{:05}.{}", serial, ext));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            "no unused queue file name available",
        ))
        .context(IoSnafu)
    }
}

impl Drop for QDisk {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(error) = self.stop() {
                error!(%error, "Failed to persist queue file header on close.");
            }
        }
    }
}

impl Active {
    fn region_end(&self) -> u64 {
        self.hdr.region_end()
    }

    fn wrap(&self, pos: u64) -> u64 {
        if pos >= self.region_end() {
            RESERVED
        } else {
            pos
        }
    }

    fn free_space(&self) -> u64 {
        let h = &self.hdr;
        if h.length == 0 && h.backlog_count == 0 {
            // Pointer equality cannot distinguish empty from full, the
            // record counters can.
            return h.size;
        }
        match h.write_head.cmp(&h.backlog_head) {
            cmp::Ordering::Greater => {
                (self.region_end() - h.write_head) + (h.backlog_head - RESERVED)
            }
            cmp::Ordering::Less => h.backlog_head - h.write_head,
            // The write head caught the backlog head, the region is full.
            cmp::Ordering::Equal => 0,
        }
    }

    fn push_tail(&mut self, record: &[u8]) -> Result<bool, QDiskError> {
        if self.read_only {
            return Ok(false);
        }
        let need = record.len() as u64;
        if self.free_space() < need + 4 {
            return Ok(false);
        }

        let mut frame = BytesMut::with_capacity(record.len() + 4);
        frame.put_u32_le(record.len() as u32);
        frame.put_slice(record);

        let pos = self.hdr.write_head;
        self.file.seek(SeekFrom::Start(pos)).context(IoSnafu)?;
        self.file.write_all(&frame).context(IoSnafu)?;

        let end = pos + 4 + need;
        self.hdr.write_head = self.wrap(end);
        self.hdr.length += 1;
        self.file_len = self.file_len.max(end);
        Ok(true)
    }

    fn pop_head(&mut self) -> Result<Option<Bytes>, QDiskError> {
        if self.hdr.length == 0 {
            return Ok(None);
        }
        let pos = self.hdr.read_head;
        let len = self.read_len_prefix(pos)?;
        let mut data = vec![0u8; len as usize];
        self.file.read_exact(&mut data).context(IoSnafu)?;

        self.hdr.read_head = self.wrap(pos + 4 + len);
        self.hdr.length -= 1;
        if !self.reliable {
            // A non-reliable pop consumes the slot immediately.
            self.hdr.backlog_head = self.hdr.read_head;
            self.hdr.backlog_count = 0;
        }
        Ok(Some(Bytes::from(data)))
    }

    /// Reads and validates the length prefix at `pos`, leaving the file
    /// cursor right after it.
    fn read_len_prefix(&mut self, pos: u64) -> Result<u64, QDiskError> {
        self.file.seek(SeekFrom::Start(pos)).context(IoSnafu)?;
        let mut raw = [0u8; 4];
        self.file.read_exact(&mut raw).context(IoSnafu)?;
        let len = u64::from(u32::from_le_bytes(raw));
        if len == 0 {
            return Err(QDiskError::Corrupt {
                reason: format!("zero-length record frame at {}", pos),
            });
        }
        if len > self.hdr.size {
            return Err(QDiskError::Corrupt {
                reason: format!("record frame of {} bytes exceeds the data region", len),
            });
        }
        if pos + 4 + len > self.file_len {
            return Err(QDiskError::Corrupt {
                reason: format!("record frame at {} overruns the file", pos),
            });
        }
        Ok(len)
    }

    fn save_state(&mut self, sidecars: Option<[&[SidecarEntry]; 3]>) -> Result<(), QDiskError> {
        match sidecars {
            Some(queues) => {
                let mut offset = self.file_len;
                for (slot, queue) in self.hdr.sidecars.iter_mut().zip(queues) {
                    let blob = encode_sidecar(queue);
                    self.file.seek(SeekFrom::Start(offset)).context(IoSnafu)?;
                    self.file.write_all(&blob).context(IoSnafu)?;
                    *slot = SidecarSlot {
                        count: queue.len() as u32,
                        offset,
                        len: blob.len() as u64,
                    };
                    offset += blob.len() as u64;
                }
                self.file_len = offset;
            }
            None => {
                self.hdr.sidecars = [SidecarSlot::default(); 3];
            }
        }
        self.hdr.encode(&mut self.prefix, self.reliable);
        self.prefix.flush().context(IoSnafu)?;
        self.file.sync_all().context(IoSnafu)?;
        Ok(())
    }
}

fn encode_sidecar(entries: &[SidecarEntry]) -> BytesMut {
    let mut blob = BytesMut::new();
    for entry in entries {
        blob.put_u32_le(entry.payload.len() as u32);
        blob.put_slice(&entry.payload);
        blob.put_u8(u8::from(entry.ack_needed));
    }
    blob
}

fn read_sidecars(
    file: &mut File,
    file_len: u64,
    hdr: &Header,
) -> Result<RestoredSidecars, QDiskError> {
    let mut restored: RestoredSidecars = Default::default();
    for (slot, queue) in hdr.sidecars.iter().zip(restored.iter_mut()) {
        if slot.is_empty() {
            continue;
        }
        if slot.offset + slot.len > file_len {
            return Err(QDiskError::Corrupt {
                reason: "sidecar blob overruns the file".to_owned(),
            });
        }
        let mut raw = vec![0u8; slot.len as usize];
        file.seek(SeekFrom::Start(slot.offset)).context(IoSnafu)?;
        file.read_exact(&mut raw).context(IoSnafu)?;

        let mut buf = Bytes::from(raw);
        for _ in 0..slot.count {
            if buf.remaining() < 4 {
                return Err(QDiskError::Corrupt {
                    reason: "sidecar blob is truncated".to_owned(),
                });
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len + 1 {
                return Err(QDiskError::Corrupt {
                    reason: "sidecar record is truncated".to_owned(),
                });
            }
            let payload = buf.copy_to_bytes(len);
            let ack_needed = buf.get_u8() != 0;
            queue.push(SidecarEntry {
                payload,
                ack_needed,
            });
        }
        if buf.has_remaining() {
            return Err(QDiskError::Corrupt {
                reason: "sidecar blob has trailing bytes".to_owned(),
            });
        }
    }
    Ok(restored)
}
