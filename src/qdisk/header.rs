//! On-disk layout of the reserved prefix.
//!
//! The first [`RESERVED`] bytes of a queue file hold the header: magic,
//! version, the data-region geometry and the four queue pointers, all
//! little-endian.  The non-reliable variant additionally records a
//! descriptor per persisted sidecar queue; the descriptors point at
//! serialized blobs appended past the data content, since the prefix
//! itself cannot hold an arbitrary number of records.

use snafu::Snafu;

/// Size of the reserved prefix preceding the data region.
pub const RESERVED: u64 = 4096;

const MAGIC_NON_RELIABLE: [u8; 4] = *b"SLQF";
const MAGIC_RELIABLE: [u8; 4] = *b"SLRQ";
const VERSION: u32 = 1;

const fn magic(reliable: bool) -> [u8; 4] {
    if reliable {
        MAGIC_RELIABLE
    } else {
        MAGIC_NON_RELIABLE
    }
}

/// Fixed fields: magic + version + six u64 pointers/counters.
const FIXED_LEN: usize = 4 + 4 + 6 * 8;
/// One descriptor: record count + blob offset + blob length.
const SIDECAR_DESC_LEN: usize = 4 + 8 + 8;

#[derive(Debug, Snafu)]
pub enum HeaderError {
    #[snafu(display("bad queue file magic"))]
    BadMagic,

    #[snafu(display("queue file belongs to the other reliability variant"))]
    WrongVariant,

    #[snafu(display("unsupported queue file version {}", found))]
    BadVersion { found: u32 },

    #[snafu(display("queue pointer out of range: {}", what))]
    PointerOutOfRange { what: &'static str },
}

/// Descriptor of one persisted sidecar queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SidecarSlot {
    pub count: u32,
    pub offset: u64,
    pub len: u64,
}

impl SidecarSlot {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// In-memory copy of the queue file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Data-region capacity in bytes.  The region spans
    /// `[RESERVED, RESERVED + size)`.
    pub size: u64,
    pub write_head: u64,
    pub read_head: u64,
    pub backlog_head: u64,
    /// Unread record count.
    pub length: u64,
    /// Popped-but-unacked record count.
    pub backlog_count: u64,
    /// qout, qbacklog, qoverflow in that order.
    pub sidecars: [SidecarSlot; 3],
}

impl Header {
    pub fn new(size: u64) -> Self {
        Header {
            size,
            write_head: RESERVED,
            read_head: RESERVED,
            backlog_head: RESERVED,
            length: 0,
            backlog_count: 0,
            sidecars: [SidecarSlot::default(); 3],
        }
    }

    /// End of the data region, exclusive; pointers wrap back to
    /// [`RESERVED`] here.
    pub fn region_end(&self) -> u64 {
        RESERVED + self.size
    }

    /// Writes the header into the start of `prefix`.
    ///
    /// `prefix` must be the reserved prefix, i.e. at least
    /// [`RESERVED`] bytes.  The two reliability variants use distinct
    /// magics, so one can never adopt the other's file.
    pub fn encode(&self, prefix: &mut [u8], reliable: bool) {
        let mut pos = 0;
        prefix[pos..pos + 4].copy_from_slice(&magic(reliable));
        pos += 4;
        prefix[pos..pos + 4].copy_from_slice(&VERSION.to_le_bytes());
        pos += 4;
        for value in [
            self.size,
            self.write_head,
            self.read_head,
            self.backlog_head,
            self.length,
            self.backlog_count,
        ] {
            prefix[pos..pos + 8].copy_from_slice(&value.to_le_bytes());
            pos += 8;
        }
        for slot in &self.sidecars {
            prefix[pos..pos + 4].copy_from_slice(&slot.count.to_le_bytes());
            pos += 4;
            prefix[pos..pos + 8].copy_from_slice(&slot.offset.to_le_bytes());
            pos += 8;
            prefix[pos..pos + 8].copy_from_slice(&slot.len.to_le_bytes());
            pos += 8;
        }
        // Anything after the descriptors stays zeroed.
        prefix[pos..RESERVED as usize].fill(0);
    }

    /// Parses and validates a header from the reserved prefix.
    ///
    /// # Errors
    ///
    /// Fails when the magic or version does not match, when the file was
    /// written by the other reliability variant, or when any pointer lies
    /// outside the data region the header itself declares.
    pub fn decode(prefix: &[u8], reliable: bool) -> Result<Header, HeaderError> {
        debug_assert!(prefix.len() >= FIXED_LEN + 3 * SIDECAR_DESC_LEN);
        if prefix[..4] == magic(!reliable) {
            return Err(HeaderError::WrongVariant);
        }
        if prefix[..4] != magic(reliable) {
            return Err(HeaderError::BadMagic);
        }
        let version = u32::from_le_bytes(prefix[4..8].try_into().expect("fixed slice"));
        if version != VERSION {
            return Err(HeaderError::BadVersion { found: version });
        }

        let mut pos = 8;
        let mut next_u64 = || {
            let value = u64::from_le_bytes(prefix[pos..pos + 8].try_into().expect("fixed slice"));
            pos += 8;
            value
        };
        let size = next_u64();
        let write_head = next_u64();
        let read_head = next_u64();
        let backlog_head = next_u64();
        let length = next_u64();
        let backlog_count = next_u64();

        let mut sidecars = [SidecarSlot::default(); 3];
        for slot in &mut sidecars {
            slot.count = u32::from_le_bytes(prefix[pos..pos + 4].try_into().expect("fixed slice"));
            pos += 4;
            slot.offset =
                u64::from_le_bytes(prefix[pos..pos + 8].try_into().expect("fixed slice"));
            pos += 8;
            slot.len = u64::from_le_bytes(prefix[pos..pos + 8].try_into().expect("fixed slice"));
            pos += 8;
        }

        let header = Header {
            size,
            write_head,
            read_head,
            backlog_head,
            length,
            backlog_count,
            sidecars,
        };

        let in_region = |p: u64| p >= RESERVED && p <= header.region_end();
        if !in_region(header.write_head) {
            return Err(HeaderError::PointerOutOfRange { what: "write_head" });
        }
        if !in_region(header.read_head) {
            return Err(HeaderError::PointerOutOfRange { what: "read_head" });
        }
        if !in_region(header.backlog_head) {
            return Err(HeaderError::PointerOutOfRange { what: "backlog_head" });
        }
        Ok(header)
    }
}
