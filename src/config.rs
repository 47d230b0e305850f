//! Options of a disk-buffer block.
//!
//! The options deserialize from the embedding daemon's configuration and
//! go through [`DiskQueueOptions::validate`], which clamps out-of-range
//! values with a warning instead of failing the load, the way the rest of
//! the configuration surface behaves.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Smallest accepted queue file capacity, unless disabled outright.
pub const MIN_DISK_BUF_SIZE: u64 = 1024 * 1024;

/// Smallest accepted output queue length.
pub const MIN_QOUT_SIZE: usize = 64;

const fn default_mem_buf_length() -> usize {
    10_000
}

const fn default_qout_size() -> usize {
    MIN_QOUT_SIZE
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Recognized options of a disk-buffer block.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiskQueueOptions {
    /// Capacity of the queue file in bytes.  Zero disables disk
    /// buffering for the destination.
    pub disk_buf_size: u64,

    /// Selects the reliable variant, where every record is durable on
    /// disk before the producer is acknowledged.
    #[serde(default)]
    pub reliable: bool,

    /// Reliable variant: bytes of free space under which pushed records
    /// are also kept resident until the backlog drains.
    #[serde(default)]
    pub mem_buf_size: u64,

    /// Non-reliable variant: bound on the overflow queue, in records.
    #[serde(default = "default_mem_buf_length")]
    pub mem_buf_length: usize,

    /// Non-reliable variant: bound on the output queue, in records.
    #[serde(default = "default_qout_size")]
    pub qout_size: usize,

    /// Directory queue files are created in.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Opens the queue file for draining only; pushes are refused.
    #[serde(default)]
    pub read_only: bool,
}

impl DiskQueueOptions {
    pub fn new(disk_buf_size: u64, dir: impl Into<PathBuf>) -> Self {
        DiskQueueOptions {
            disk_buf_size,
            reliable: false,
            mem_buf_size: 0,
            mem_buf_length: default_mem_buf_length(),
            qout_size: default_qout_size(),
            dir: dir.into(),
            read_only: false,
        }
    }

    /// Whether a disk queue should be created at all.
    pub fn is_enabled(&self) -> bool {
        self.disk_buf_size != 0
    }

    /// Clamps out-of-range values and warns about options that do not
    /// apply to the selected variant.
    pub fn validate(&mut self) {
        if self.disk_buf_size == 0 {
            warn!("The configured disk buffer size is zero. No disk queue file will be created.");
        } else if self.disk_buf_size < MIN_DISK_BUF_SIZE {
            warn!(
                configured = self.disk_buf_size,
                minimum = MIN_DISK_BUF_SIZE,
                "The configured disk buffer size is smaller than the minimum allowed, clamping."
            );
            self.disk_buf_size = MIN_DISK_BUF_SIZE;
        }

        if self.qout_size < MIN_QOUT_SIZE {
            warn!(
                configured = self.qout_size,
                minimum = MIN_QOUT_SIZE,
                "The configured qout size is smaller than the minimum allowed, clamping."
            );
            self.qout_size = MIN_QOUT_SIZE;
        }

        if self.reliable {
            if self.mem_buf_length != default_mem_buf_length() {
                warn!("Reliable queue: the mem-buf-length option is ignored.");
            }
        } else if self.mem_buf_size > 0 {
            warn!("Non-reliable queue: the mem-buf-size option is ignored.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_disk_buf_size_is_clamped() {
        let mut options = DiskQueueOptions::new(1000, "/tmp/q");
        options.validate();
        assert_eq!(options.disk_buf_size, MIN_DISK_BUF_SIZE);
    }

    #[test]
    fn zero_disk_buf_size_disables_the_queue() {
        let mut options = DiskQueueOptions::new(0, "/tmp/q");
        options.validate();
        assert_eq!(options.disk_buf_size, 0);
        assert!(!options.is_enabled());
    }

    #[test]
    fn small_qout_size_is_clamped() {
        let mut options = DiskQueueOptions::new(MIN_DISK_BUF_SIZE, "/tmp/q");
        options.qout_size = 10;
        options.validate();
        assert_eq!(options.qout_size, MIN_QOUT_SIZE);
    }

    #[test]
    fn in_range_options_are_untouched() {
        let mut options = DiskQueueOptions::new(8 * MIN_DISK_BUF_SIZE, "/tmp/q");
        options.qout_size = 1000;
        options.mem_buf_length = 5000;
        let before = options.clone();
        options.validate();
        assert_eq!(options, before);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: DiskQueueOptions =
            serde_json::from_str(r#"{"disk_buf_size": 2097152, "reliable": true}"#).unwrap();
        assert_eq!(options.disk_buf_size, 2 * 1024 * 1024);
        assert!(options.reliable);
        assert_eq!(options.qout_size, MIN_QOUT_SIZE);
        assert_eq!(options.mem_buf_length, 10_000);
        assert_eq!(options.dir, PathBuf::from("."));
        assert!(!options.read_only);
    }
}
