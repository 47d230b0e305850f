//! The structured log record that flows through the queue.
//!
//! A record is immutable once enqueued.  Producers hand the queue an
//! `Arc<LogRecord>`; the queue's in-memory sidecars hold additional `Arc`
//! clones, and the value is freed when the last handle drops.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::payload::{NvHandle, Payload};

/// Flag bits carried in [`LogRecord::flags`].
///
/// The low 16 bits are runtime state: they describe which parts of the
/// record the current process owns and are never persisted.  Serialization
/// masks them off, and deserialization re-asserts all of them, since a
/// freshly loaded record owns everything it carries.
pub mod flags {
    /// Mask covering every runtime-state bit.
    pub const STATE_MASK: u32 = 0x0000_ffff;

    pub const OWNS_TAGS: u32 = 0x0000_0001;
    pub const OWNS_SDATA: u32 = 0x0000_0002;
    pub const OWNS_PAYLOAD: u32 = 0x0000_0004;

    /// The record body is known to be valid UTF-8.
    pub const UTF8: u32 = 0x0001_0000;
    /// The record was generated internally rather than received.
    pub const INTERNAL: u32 = 0x0002_0000;
    /// Periodic mark record.
    pub const MARK: u32 = 0x0004_0000;
    /// The record originated on the local host.
    pub const LOCAL: u32 = 0x0008_0000;
}

/// Index into [`LogRecord::timestamps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// When the event happened according to the sender.
    Origin = 0,
    /// When this process received the record.
    Received = 1,
    /// When this process finished parsing the record.
    Processed = 2,
}

/// A wall-clock instant with its originating zone offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub sec: i64,
    pub usec: u32,
    /// Offset from UTC, in seconds, of the zone the timestamp was taken in.
    pub zone_offset: i32,
}

/// Source address of a record, when one is known.
///
/// Unix socket peers carry no persistent identity, so only the family
/// survives serialization for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
    Inet(Ipv4Addr, u16),
    Inet6(Ipv6Addr, u16),
    Unix,
}

/// Address family tags used on the wire.  Fixed values, independent of
/// whatever the local platform uses for `AF_*`.
pub mod family {
    pub const NONE: u16 = 0;
    pub const UNIX: u16 = 1;
    pub const INET: u16 = 2;
    pub const INET6: u16 = 10;
}

impl SockAddr {
    pub fn family(&self) -> u16 {
        match self {
            SockAddr::Inet(..) => family::INET,
            SockAddr::Inet6(..) => family::INET6,
            SockAddr::Unix => family::UNIX,
        }
    }
}

/// A parsed log message together with its receipt metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Monotonic receipt identifier assigned on ingest.
    pub rcpt_id: u64,
    /// Syslog priority/facility value.
    pub pri: u16,
    /// See [`flags`].
    pub flags: u32,
    /// Identifier of the originating host.
    pub host_id: u32,
    pub saddr: Option<SockAddr>,
    /// Indexed by [`Stamp`].
    pub timestamps: [Timestamp; 3],
    tags: Vec<String>,
    pub initial_parse: bool,
    pub num_matches: u8,
    /// Structured-data elements, as handles into [`Self::payload`].
    pub sdata: Vec<NvHandle>,
    /// Capacity hint carried alongside `sdata` across serialization.
    pub alloc_sdata: u8,
    pub payload: Payload,
}

impl LogRecord {
    pub fn new() -> Self {
        LogRecord {
            rcpt_id: 0,
            pri: 0,
            flags: flags::STATE_MASK,
            host_id: 0,
            saddr: None,
            timestamps: [Timestamp::default(); 3],
            tags: Vec::new(),
            initial_parse: false,
            num_matches: 0,
            sdata: Vec::new(),
            alloc_sdata: 0,
            payload: Payload::new(),
        }
    }

    pub fn timestamp(&self, stamp: Stamp) -> &Timestamp {
        &self.timestamps[stamp as usize]
    }

    pub fn timestamp_mut(&mut self, stamp: Stamp) -> &mut Timestamp {
        &mut self.timestamps[stamp as usize]
    }

    /// Adds a tag, keeping the tag set ordered and free of duplicates.
    pub fn set_tag(&mut self, name: &str) {
        if !self.has_tag(name) {
            self.tags.push(name.to_owned());
            self.flags |= flags::OWNS_TAGS;
        }
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t == name)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    /// Restores the tag set from serialized form, preserving order.
    pub(crate) fn restore_tags(&mut self, tags: Vec<String>) {
        self.tags = tags;
        self.flags |= flags::OWNS_TAGS;
    }
}

impl Default for LogRecord {
    fn default() -> Self {
        Self::new()
    }
}
