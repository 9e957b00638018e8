//! # localmachine storage
//!
//! Low-level durable primitives for the localmachine agent and central service.
//!
//! Backends are **opaque byte stores**: they know nothing about events, acks
//! or error records. On top of them sits the [`Journal`], an append-only
//! sequence of checksummed frames that the agent's local database replays on
//! open. [`NamedLocks`] provides the process-wide mutual exclusion used to keep
//! sync cycles and master-data resyncs from overlapping.
//!
//! ## Example
//!
//! ```rust
//! use localmachine_storage::{InMemoryBackend, Journal};
//!
//! let mut journal = Journal::open(Box::new(InMemoryBackend::new())).unwrap();
//! journal.append_frame(b"first mutation batch").unwrap();
//!
//! let frames = journal.read_frames().unwrap();
//! assert_eq!(frames, vec![b"first mutation batch".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod journal;
mod lock;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::{compute_crc32, Journal, FRAME_HEADER_SIZE, FRAME_MAGIC};
pub use lock::{NamedLockGuard, NamedLocks};
pub use memory::InMemoryBackend;
