//! Queue hand-off between configuration generations.
//!
//! A destination driver acquires its queue on init and releases it on
//! deinit.  During a reload the released queue is parked here under its
//! persist-name; the successor driver fetches it back instead of starting
//! a new file.  A successor whose reliability setting disagrees with the
//! parked queue gets a fresh queue, since the two variants cannot share a
//! file.

use std::{collections::HashMap, fs, sync::Arc};

use parking_lot::Mutex;
use snafu::Snafu;

use crate::{
    config::DiskQueueOptions,
    payload::NvRegistry,
    persist::PersistState,
    queue::{DiskQueue, QueueError},
};

#[derive(Debug, Snafu)]
pub enum RegistryError {
    /// `disk_buf_size` is zero; the destination runs without a disk
    /// queue.
    #[snafu(display("disk buffering is disabled for this destination"))]
    Disabled,

    /// Neither the recorded queue file nor a fresh one could be opened.
    #[snafu(display("could not initialize the disk queue: {}", source))]
    Initialize { source: QueueError },
}

/// Parking registry for queues surviving a configuration reload, owned by
/// the embedding configuration.
#[derive(Default)]
pub struct QueueRegistry {
    parked: Mutex<HashMap<String, Arc<DiskQueue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches the parked queue for `persist_name`, or creates one, and
    /// attaches it to its file.  The file path recorded in `state` is
    /// tried first; when loading it fails the file is renamed aside and a
    /// fresh one is started, so a damaged file never blocks the
    /// destination.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::Disabled`] when `options` turn disk
    /// buffering off, and with [`RegistryError::Initialize`] when no
    /// queue file could be opened at all.
    pub fn acquire(
        &self,
        persist_name: &str,
        options: &DiskQueueOptions,
        nv_registry: &Arc<Mutex<NvRegistry>>,
        state: &mut PersistState,
    ) -> Result<Arc<DiskQueue>, RegistryError> {
        if !options.is_enabled() {
            return Err(RegistryError::Disabled);
        }

        let parked = self.parked.lock().remove(persist_name);
        let queue = match parked {
            Some(queue) if queue.is_reliable() == options.reliable => queue,
            Some(queue) => {
                warn!(
                    persist_name,
                    parked_reliable = queue.is_reliable(),
                    configured_reliable = options.reliable,
                    "Parked queue is incompatible with the new configuration, starting fresh."
                );
                drop(queue);
                Arc::new(DiskQueue::new(options, Arc::clone(nv_registry), Some(persist_name)))
            }
            None => Arc::new(DiskQueue::new(
                options,
                Arc::clone(nv_registry),
                Some(persist_name),
            )),
        };

        let recorded = state.lookup(persist_name).map(std::path::PathBuf::from);
        let loaded = queue.load_queue(recorded.as_deref());
        if let Err(error) = loaded {
            match recorded {
                Some(old_path) => {
                    error!(
                        %error,
                        path = %old_path.display(),
                        "Error opening disk-queue file, a new one is started."
                    );
                    let mut renamed = old_path.clone().into_os_string();
                    renamed.push(".corrupted");
                    if let Err(rename_error) = fs::rename(&old_path, renamed) {
                        debug!(%rename_error, "Could not rename the unreadable queue file.");
                    }
                    queue
                        .load_queue(None)
                        .map_err(|source| RegistryError::Initialize { source })?;
                }
                None => return Err(RegistryError::Initialize { source: error }),
            }
        }

        if let Some(path) = queue.filename() {
            state.set(persist_name, &path.to_string_lossy());
            if let Err(error) = state.save() {
                error!(%error, "Failed to record the queue file path in persistent state.");
            }
        }
        Ok(queue)
    }

    /// Saves the queue's state and parks it for the next configuration
    /// generation.  Queues without a persist-name are simply dropped.
    pub fn release(&self, queue: Arc<DiskQueue>) {
        if let Err(error) = queue.save_queue() {
            error!(%error, "Failed to save queue state on release.");
        }
        if let Some(name) = queue.persist_name().map(str::to_owned) {
            self.parked.lock().insert(name, queue);
        }
    }

    /// Permanently drops the parked queue under `persist_name`, removing
    /// its file and forgetting its recorded path.
    pub fn discard(&self, persist_name: &str, state: &mut PersistState) {
        if let Some(queue) = self.parked.lock().remove(persist_name) {
            if let Some(path) = queue.filename() {
                drop(queue);
                if let Err(error) = fs::remove_file(&path) {
                    debug!(%error, path = %path.display(), "Could not remove dropped queue file.");
                }
            }
        }
        if state.remove(persist_name).is_some() {
            if let Err(error) = state.save() {
                error!(%error, "Failed to update persistent state after dropping a queue.");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn parked_len(&self) -> usize {
        self.parked.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use temp_dir::TempDir;

    use super::*;
    use crate::queue::PathOptions;
    use crate::record::LogRecord;

    fn options(dir: &std::path::Path, reliable: bool) -> DiskQueueOptions {
        let mut options = DiskQueueOptions::new(crate::config::MIN_DISK_BUF_SIZE, dir);
        options.reliable = reliable;
        options
    }

    fn harness(dir: &TempDir) -> (QueueRegistry, Arc<Mutex<NvRegistry>>, PersistState) {
        let registry = QueueRegistry::new();
        let nv_registry = Arc::new(Mutex::new(NvRegistry::new()));
        let state = PersistState::load(dir.path().join("state.json")).unwrap();
        (registry, nv_registry, state)
    }

    #[test]
    fn acquire_records_the_file_path() {
        let dir = TempDir::new().unwrap();
        let (registry, nv_registry, mut state) = harness(&dir);

        let queue = registry
            .acquire("dest#0", &options(dir.path(), true), &nv_registry, &mut state)
            .unwrap();
        let path = queue.filename().unwrap();
        assert!(path.exists());
        assert_eq!(state.lookup("dest#0"), Some(&*path.to_string_lossy()));
    }

    #[test]
    fn release_then_acquire_reuses_the_same_file() {
        let dir = TempDir::new().unwrap();
        let (registry, nv_registry, mut state) = harness(&dir);
        let opts = options(dir.path(), true);

        let queue = registry
            .acquire("dest#0", &opts, &nv_registry, &mut state)
            .unwrap();
        let record = Arc::new(LogRecord::new());
        assert!(queue.push_tail(record, PathOptions::default()));
        let path = queue.filename().unwrap();

        registry.release(queue);
        assert_eq!(registry.parked_len(), 1);

        let successor = registry
            .acquire("dest#0", &opts, &nv_registry, &mut state)
            .unwrap();
        assert_eq!(successor.filename().unwrap(), path);
        assert_eq!(successor.len(), 1);
        assert_eq!(registry.parked_len(), 0);
    }

    #[test]
    fn incompatible_successor_gets_a_fresh_queue() {
        let dir = TempDir::new().unwrap();
        let (registry, nv_registry, mut state) = harness(&dir);

        let queue = registry
            .acquire("dest#0", &options(dir.path(), true), &nv_registry, &mut state)
            .unwrap();
        let reliable_path = queue.filename().unwrap();
        registry.release(queue);

        let successor = registry
            .acquire(
                "dest#0",
                &options(dir.path(), false),
                &nv_registry,
                &mut state,
            )
            .unwrap();
        assert!(!successor.is_reliable());
        assert_ne!(successor.filename().unwrap(), reliable_path);
    }

    #[test]
    fn unreadable_recorded_file_falls_back_to_a_fresh_one() {
        let dir = TempDir::new().unwrap();
        let (registry, nv_registry, mut state) = harness(&dir);
        let opts = options(dir.path(), false);

        let bogus = dir.path().join("mangled.qf");
        std::fs::write(&bogus, b"not a queue file, but longer than a header").unwrap();
        // Pad it past the reserved prefix so validation, not file size,
        // rejects it.
        let raw = vec![0u8; 8192];
        std::fs::write(&bogus, raw).unwrap();
        state.set("dest#0", &bogus.to_string_lossy());

        let queue = registry
            .acquire("dest#0", &opts, &nv_registry, &mut state)
            .unwrap();
        let fresh = queue.filename().unwrap();
        assert_ne!(fresh, bogus);
        assert!(!bogus.exists());
        assert!(bogus.with_extension("qf.corrupted").exists());
        assert_eq!(state.lookup("dest#0"), Some(&*fresh.to_string_lossy()));
    }

    #[test]
    fn disabled_options_refuse_to_acquire() {
        let dir = TempDir::new().unwrap();
        let (registry, nv_registry, mut state) = harness(&dir);
        let opts = DiskQueueOptions::new(0, dir.path());
        assert!(matches!(
            registry.acquire("dest#0", &opts, &nv_registry, &mut state),
            Err(RegistryError::Disabled)
        ));
    }

    #[test]
    fn discard_removes_the_file_and_the_state_entry() {
        let dir = TempDir::new().unwrap();
        let (registry, nv_registry, mut state) = harness(&dir);
        let opts = options(dir.path(), false);

        let queue = registry
            .acquire("dest#0", &opts, &nv_registry, &mut state)
            .unwrap();
        let path = queue.filename().unwrap();
        registry.release(queue);

        registry.discard("dest#0", &mut state);
        assert!(!path.exists());
        assert_eq!(state.lookup("dest#0"), None);
        assert_eq!(registry.parked_len(), 0);
    }
}
