//! Persistent key-value state shared across configuration generations.
//!
//! The store remembers which queue file belongs to which persist-name, so
//! the successor of a reloaded destination driver finds the file its
//! predecessor wrote.  Keys are strings, values are opaque strings; the
//! store is a single JSON file rewritten atomically through a rename.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum PersistError {
    #[snafu(display("state file I/O error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("state file could not be parsed: {}", source))]
    Malformed { source: serde_json::Error },
}

/// String-keyed persistent state backed by one file.
#[derive(Debug)]
pub struct PersistState {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl PersistState {
    /// Loads the store from `path`, starting empty when the file does not
    /// exist yet.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).context(MalformedSnafu)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).context(IoSnafu),
        };
        Ok(PersistState { path, entries })
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_owned(), value.to_owned());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Writes the store back to disk.  The contents go to a sibling file
    /// first and replace the old state through a rename.
    ///
    /// # Errors
    ///
    /// Propagates serialization and I/O failures; the previous state file
    /// is left untouched on error.
    pub fn save(&self) -> Result<(), PersistError> {
        let raw = serde_json::to_vec_pretty(&self.entries).context(MalformedSnafu)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, raw).context(IoSnafu)?;
        fs::rename(&tmp, &self.path).context(IoSnafu)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
