//! Wire codec for [`LogRecord`].
//!
//! The layout is fixed and versioned: a one-byte format version, the
//! receipt metadata, the source address, the three timestamps, the tag
//! set, the structured-data handles, and finally the name-value payload
//! in its own framed inner format.  Integers are written in network
//! order.  Serialization is total; deserialization validates every length
//! before reading and re-interns payload names against the caller's
//! registry, remapping structured-data handles accordingly.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::{ensure, Snafu};

use crate::{
    payload::{NvHandle, NvRegistry, NvValue, Payload, PayloadEntry},
    record::{family, flags, LogRecord, SockAddr, Timestamp},
};

/// Version byte every serialized record starts with.
pub const FORMAT_VERSION: u8 = 1;

/// Magic prefix of the serialized name-value payload.
const PAYLOAD_MAGIC: [u8; 4] = *b"NVPL";

const ENTRY_DIRECT: u8 = 0;
const ENTRY_INDIRECT: u8 = 1;

/// Error produced while decoding a serialized record.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// The input ended before the record was complete.
    #[snafu(display("serialized record is truncated"))]
    Truncated,

    /// The record was written by an unsupported format version.
    #[snafu(display("unsupported record format version {}", found))]
    VersionMismatch { found: u8 },

    /// The source address carries a family this codec does not know.
    #[snafu(display("unknown address family {}", family))]
    BadFamily { family: u16 },

    /// The name-value payload is internally inconsistent.
    #[snafu(display("invalid name-value payload: {}", reason))]
    BadPayload { reason: String },
}

fn bad_payload<T>(reason: impl Into<String>) -> Result<T, CodecError> {
    Err(CodecError::BadPayload {
        reason: reason.into(),
    })
}

/// Serializes `record` into `buf`.
///
/// Runtime-state flag bits are masked off; everything else is written
/// verbatim.  The payload keeps the handles the record was built with, so
/// that handle references inside the record stay resolvable after a
/// reload against a different registry.
pub fn serialize<B: BufMut>(record: &LogRecord, buf: &mut B) {
    buf.put_u8(FORMAT_VERSION);
    buf.put_u64(record.rcpt_id);
    buf.put_u32(record.flags & !flags::STATE_MASK);
    buf.put_u16(record.pri);

    match &record.saddr {
        None => buf.put_u16(family::NONE),
        Some(addr) => {
            buf.put_u16(addr.family());
            match addr {
                SockAddr::Inet(ip, port) => {
                    buf.put_slice(&ip.octets());
                    buf.put_u16(*port);
                }
                SockAddr::Inet6(ip, port) => {
                    buf.put_slice(&ip.octets());
                    buf.put_u16(*port);
                }
                SockAddr::Unix => {}
            }
        }
    }

    for stamp in &record.timestamps {
        buf.put_u64(stamp.sec as u64);
        buf.put_u32(stamp.usec);
        buf.put_u32(stamp.zone_offset as u32);
    }
    buf.put_u32(record.host_id);

    for tag in record.tags() {
        buf.put_u32(tag.len() as u32);
        buf.put_slice(tag.as_bytes());
    }
    buf.put_u32(0);

    buf.put_u8(u8::from(record.initial_parse));
    buf.put_u8(record.num_matches);

    buf.put_u8(record.sdata.len() as u8);
    buf.put_u8(record.alloc_sdata.max(record.sdata.len() as u8));
    for handle in &record.sdata {
        buf.put_u32(handle.raw());
    }

    serialize_payload(&record.payload, buf);
}

/// Serializes `record` into a freshly allocated buffer.
pub fn serialize_to_bytes(record: &LogRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    serialize(record, &mut buf);
    buf.freeze()
}

/// Decodes one record from `buf`.
///
/// Payload names are re-interned through `registry`; structured-data
/// handles and indirect references are remapped to the resulting handles.
///
/// # Errors
///
/// Returns [`CodecError::Truncated`] on short input,
/// [`CodecError::VersionMismatch`] when the leading version byte is not
/// [`FORMAT_VERSION`], [`CodecError::BadFamily`] on an unknown address
/// family and [`CodecError::BadPayload`] when the payload framing is
/// inconsistent or a handle reference cannot be resolved.
pub fn deserialize<B: Buf>(buf: &mut B, registry: &mut NvRegistry) -> Result<LogRecord, CodecError> {
    let version = get_u8(buf)?;
    ensure!(version == FORMAT_VERSION, VersionMismatchSnafu { found: version });

    let mut record = LogRecord::new();
    record.rcpt_id = get_u64(buf)?;
    record.flags = get_u32(buf)? | flags::STATE_MASK;
    record.pri = get_u16(buf)?;

    let fam = get_u16(buf)?;
    record.saddr = match fam {
        family::NONE => None,
        family::UNIX => Some(SockAddr::Unix),
        family::INET => {
            let mut octets = [0u8; 4];
            get_exact(buf, &mut octets)?;
            let port = get_u16(buf)?;
            Some(SockAddr::Inet(octets.into(), port))
        }
        family::INET6 => {
            let mut octets = [0u8; 16];
            get_exact(buf, &mut octets)?;
            let port = get_u16(buf)?;
            Some(SockAddr::Inet6(octets.into(), port))
        }
        family => return Err(CodecError::BadFamily { family }),
    };

    for stamp in &mut record.timestamps {
        *stamp = Timestamp {
            sec: get_u64(buf)? as i64,
            usec: get_u32(buf)?,
            zone_offset: get_u32(buf)? as i32,
        };
    }
    record.host_id = get_u32(buf)?;

    let mut tags = Vec::new();
    loop {
        let len = get_u32(buf)? as usize;
        if len == 0 {
            break;
        }
        tags.push(get_string(buf, len)?);
    }
    record.restore_tags(tags);

    record.initial_parse = get_u8(buf)? != 0;
    record.num_matches = get_u8(buf)?;

    let num_sdata = get_u8(buf)?;
    let alloc_sdata = get_u8(buf)?;
    if alloc_sdata < num_sdata {
        return bad_payload("structured-data allocation smaller than its element count");
    }
    record.alloc_sdata = alloc_sdata;
    let mut raw_sdata = Vec::with_capacity(usize::from(num_sdata));
    for _ in 0..num_sdata {
        raw_sdata.push(get_u32(buf)?);
    }

    let (payload, handle_map) = deserialize_payload(buf, registry)?;
    record.payload = payload;

    record.sdata = raw_sdata
        .into_iter()
        .map(|raw| {
            handle_map.get(&raw).copied().ok_or_else(|| CodecError::BadPayload {
                reason: format!("structured-data handle {} has no payload entry", raw),
            })
        })
        .collect::<Result<_, _>>()?;

    Ok(record)
}

fn serialize_payload<B: BufMut>(payload: &Payload, buf: &mut B) {
    buf.put_slice(&PAYLOAD_MAGIC);
    buf.put_u32(payload.len() as u32);
    for entry in payload.iter() {
        match &entry.value {
            NvValue::Direct(value) => {
                buf.put_u8(ENTRY_DIRECT);
                buf.put_u32(entry.handle.raw());
                put_string(buf, &entry.name);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
            NvValue::Indirect {
                ref_handle,
                offset,
                len,
                kind,
            } => {
                buf.put_u8(ENTRY_INDIRECT);
                buf.put_u32(entry.handle.raw());
                put_string(buf, &entry.name);
                buf.put_u32(ref_handle.raw());
                buf.put_u32(*offset);
                buf.put_u32(*len);
                buf.put_u8(*kind);
            }
        }
    }
}

/// Reads the payload, interning names as it goes.  Returns the rebuilt
/// payload and the serialized-handle to live-handle map the caller needs
/// to remap structured-data references.
fn deserialize_payload<B: Buf>(
    buf: &mut B,
    registry: &mut NvRegistry,
) -> Result<(Payload, HashMap<u32, NvHandle>), CodecError> {
    let mut magic = [0u8; 4];
    get_exact(buf, &mut magic)?;
    if magic != PAYLOAD_MAGIC {
        return bad_payload("bad payload magic");
    }

    let count = get_u32(buf)? as usize;
    let mut handle_map = HashMap::with_capacity(count.min(64));
    let mut entries = Vec::with_capacity(count.min(64));

    for _ in 0..count {
        let kind = get_u8(buf)?;
        let raw_handle = get_u32(buf)?;
        if raw_handle == 0 {
            return bad_payload("zero payload handle");
        }
        let name_len = get_u32(buf)? as usize;
        let name = get_string(buf, name_len)?;
        let handle = registry.intern(&name);
        handle_map.insert(raw_handle, handle);

        let value = match kind {
            ENTRY_DIRECT => {
                let value_len = get_u32(buf)? as usize;
                NvValue::Direct(get_bytes(buf, value_len)?)
            }
            ENTRY_INDIRECT => NvValue::Indirect {
                // The referenced handle is remapped below, once every
                // entry's name has been seen.
                ref_handle: NvHandle::from_raw(get_u32(buf)?).ok_or_else(|| {
                    CodecError::BadPayload {
                        reason: "zero indirect reference".to_owned(),
                    }
                })?,
                offset: get_u32(buf)?,
                len: get_u32(buf)?,
                kind: get_u8(buf)?,
            },
            other => return bad_payload(format!("unknown payload entry kind {}", other)),
        };
        entries.push(PayloadEntry {
            handle,
            name,
            value,
        });
    }

    let mut payload = Payload::new();
    for mut entry in entries {
        if let NvValue::Indirect { ref_handle, .. } = &mut entry.value {
            *ref_handle = handle_map
                .get(&ref_handle.raw())
                .copied()
                .ok_or_else(|| CodecError::BadPayload {
                    reason: format!(
                        "indirect entry references missing handle {}",
                        ref_handle.raw()
                    ),
                })?;
        }
        payload.push_unchecked(entry);
    }

    Ok((payload, handle_map))
}

fn put_string<B: BufMut>(buf: &mut B, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_u8<B: Buf>(buf: &mut B) -> Result<u8, CodecError> {
    ensure!(buf.remaining() >= 1, TruncatedSnafu);
    Ok(buf.get_u8())
}

fn get_u16<B: Buf>(buf: &mut B) -> Result<u16, CodecError> {
    ensure!(buf.remaining() >= 2, TruncatedSnafu);
    Ok(buf.get_u16())
}

fn get_u32<B: Buf>(buf: &mut B) -> Result<u32, CodecError> {
    ensure!(buf.remaining() >= 4, TruncatedSnafu);
    Ok(buf.get_u32())
}

fn get_u64<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    ensure!(buf.remaining() >= 8, TruncatedSnafu);
    Ok(buf.get_u64())
}

fn get_exact<B: Buf>(buf: &mut B, out: &mut [u8]) -> Result<(), CodecError> {
    ensure!(buf.remaining() >= out.len(), TruncatedSnafu);
    buf.copy_to_slice(out);
    Ok(())
}

fn get_bytes<B: Buf>(buf: &mut B, len: usize) -> Result<Bytes, CodecError> {
    ensure!(buf.remaining() >= len, TruncatedSnafu);
    Ok(buf.copy_to_bytes(len))
}

fn get_string<B: Buf>(buf: &mut B, len: usize) -> Result<String, CodecError> {
    let bytes = get_bytes(buf, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BadPayload {
        reason: "name is not valid utf-8".to_owned(),
    })
}
