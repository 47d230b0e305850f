//! Durable message queue core of a log-processing daemon.
//!
//! This library implements the disk-backed FIFO that sits between the
//! ingest path and a destination worker: a circular queue file with
//! crash-safe pointers, a reliable variant where every record hits disk
//! before the producer is acknowledged, a non-reliable variant with an
//! in-memory fast path and disk spillover, and the fixed wire codec for
//! the structured log records flowing through it.  Queues survive process
//! restarts and configuration reloads through a persist-name registry.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

#[macro_use]
extern crate tracing;

pub mod codec;
pub mod config;
mod internal_events;
pub mod payload;
pub mod persist;
pub mod qdisk;
pub mod queue;
pub mod record;
pub mod registry;

pub use codec::CodecError;
pub use config::DiskQueueOptions;
pub use payload::{NvHandle, NvRegistry, Payload};
pub use persist::PersistState;
pub use qdisk::{QDisk, QDiskError};
pub use queue::{DiskQueue, PathOptions, QueueError};
pub use record::{LogRecord, SockAddr, Timestamp};
pub use registry::{QueueRegistry, RegistryError};
