//! Name-value payload attached to a log record.
//!
//! Names are interned through an [`NvRegistry`] into small integer handles.
//! The registry is owned by the embedding configuration and passed
//! explicitly wherever handles need to be resolved; handles are only
//! meaningful relative to the registry that produced them, which is why
//! deserialization re-interns every name and remaps handles.
//!
//! A value is either a byte string stored directly, or an indirect entry
//! describing a byte range of another entry's value.  Indirect entries are
//! how structured-data parameters reference slices of the raw message
//! without copying.

use std::collections::HashMap;

use bytes::Bytes;

/// Interned name handle.  Zero is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NvHandle(u32);

impl NvHandle {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(NvHandle(raw))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Name interner shared by every record of one configuration.
#[derive(Debug, Default)]
pub struct NvRegistry {
    names: Vec<String>,
    by_name: HashMap<String, NvHandle>,
}

impl NvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `name`, interning it on first use.
    pub fn intern(&mut self, name: &str) -> NvHandle {
        if let Some(handle) = self.by_name.get(name) {
            return *handle;
        }
        self.names.push(name.to_owned());
        let handle = NvHandle(u32::try_from(self.names.len()).expect("registry overflow"));
        self.by_name.insert(name.to_owned(), handle);
        handle
    }

    pub fn lookup(&self, name: &str) -> Option<NvHandle> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, handle: NvHandle) -> Option<&str> {
        self.names.get(handle.0 as usize - 1).map(String::as_str)
    }
}

/// How an entry stores its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvValue {
    Direct(Bytes),
    /// A byte range of another entry's direct value.
    Indirect {
        ref_handle: NvHandle,
        offset: u32,
        len: u32,
        kind: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEntry {
    pub handle: NvHandle,
    pub name: String,
    pub value: NvValue,
}

/// Ordered collection of name-value entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    entries: Vec<PayloadEntry>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `name`, replacing any previous entry for the
    /// same handle.  Returns the handle the value lives under.
    pub fn set_direct(&mut self, registry: &mut NvRegistry, name: &str, value: Bytes) -> NvHandle {
        let handle = registry.intern(name);
        self.put(PayloadEntry {
            handle,
            name: name.to_owned(),
            value: NvValue::Direct(value),
        });
        handle
    }

    /// Stores an indirect entry referencing `offset..offset + len` of the
    /// value held by `ref_handle`.
    pub fn set_indirect(
        &mut self,
        registry: &mut NvRegistry,
        name: &str,
        ref_handle: NvHandle,
        offset: u32,
        len: u32,
        kind: u8,
    ) -> NvHandle {
        let handle = registry.intern(name);
        self.put(PayloadEntry {
            handle,
            name: name.to_owned(),
            value: NvValue::Indirect {
                ref_handle,
                offset,
                len,
                kind,
            },
        });
        handle
    }

    fn put(&mut self, entry: PayloadEntry) {
        match self.entries.iter_mut().find(|e| e.handle == entry.handle) {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
    }

    pub(crate) fn push_unchecked(&mut self, entry: PayloadEntry) {
        self.entries.push(entry);
    }

    pub fn entry(&self, handle: NvHandle) -> Option<&PayloadEntry> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    pub fn contains(&self, handle: NvHandle) -> bool {
        self.entry(handle).is_some()
    }

    /// Resolves the bytes stored under `handle`, following one level of
    /// indirection.  Out-of-range indirect references resolve to the part
    /// of the range that exists.
    pub fn get(&self, handle: NvHandle) -> Option<&[u8]> {
        match &self.entry(handle)?.value {
            NvValue::Direct(bytes) => Some(&bytes[..]),
            NvValue::Indirect {
                ref_handle,
                offset,
                len,
                ..
            } => match &self.entry(*ref_handle)?.value {
                NvValue::Direct(bytes) => {
                    let start = (*offset as usize).min(bytes.len());
                    let end = (*offset as usize + *len as usize).min(bytes.len());
                    Some(&bytes[start..end])
                }
                NvValue::Indirect { .. } => None,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PayloadEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut registry = NvRegistry::new();
        let a = registry.intern("MESSAGE");
        let b = registry.intern("HOST");
        assert_ne!(a, b);
        assert_eq!(registry.intern("MESSAGE"), a);
        assert_eq!(registry.name(a), Some("MESSAGE"));
        assert_eq!(registry.lookup("HOST"), Some(b));
        assert_eq!(registry.lookup("PROGRAM"), None);
    }

    #[test]
    fn direct_set_replaces_in_place() {
        let mut registry = NvRegistry::new();
        let mut payload = Payload::new();
        let h = payload.set_direct(&mut registry, "MESSAGE", Bytes::from_static(b"first"));
        payload.set_direct(&mut registry, "MESSAGE", Bytes::from_static(b"second"));
        assert_eq!(payload.len(), 1);
        assert_eq!(payload.get(h), Some(&b"second"[..]));
    }

    #[test]
    fn indirect_resolves_a_slice_of_the_referenced_value() {
        let mut registry = NvRegistry::new();
        let mut payload = Payload::new();
        let msg = payload.set_direct(
            &mut registry,
            "MESSAGE",
            Bytes::from_static(b"user=alice action=login"),
        );
        let user = payload.set_indirect(&mut registry, ".sdata.user", msg, 5, 5, 0);
        assert_eq!(payload.get(user), Some(&b"alice"[..]));
    }

    #[test]
    fn indirect_range_is_clamped_to_the_referenced_value() {
        let mut registry = NvRegistry::new();
        let mut payload = Payload::new();
        let msg = payload.set_direct(&mut registry, "MESSAGE", Bytes::from_static(b"short"));
        let clamped = payload.set_indirect(&mut registry, ".sdata.tail", msg, 3, 100, 0);
        assert_eq!(payload.get(clamped), Some(&b"rt"[..]));
        let past_end = payload.set_indirect(&mut registry, ".sdata.gone", msg, 64, 4, 0);
        assert_eq!(payload.get(past_end), Some(&b""[..]));
    }
}
