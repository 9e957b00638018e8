//! # localmachine server
//!
//! Reference central web service for localmachine agents.
//!
//! This crate provides:
//! - A deduplicated central event log routing events to their receivers
//! - Peering pages packed to a byte capacity, with a resumable cursor
//! - Ack exchange between senders and receivers
//! - Business-version compatibility rules for outgoing events
//! - Online export of pending events as a zip of packed files
//! - Master-data snapshots, deltas, per-facility offsets and cleanup
//! - Master-data files for facilities without network access
//!
//! Snapshot archives go through a pluggable [`SnapshotStore`]. The event
//! log, master-data records and offsets are held in memory only: this is a
//! reference service for tests and small deployments, and a restart starts
//! from empty state.
//!
//! # Architecture
//!
//! [`WebServer`] is transport-agnostic. It routes a path and a CBOR body to
//! [`RequestHandler`], which works against shared state in
//! [`HandlerContext`]. Any HTTP front end, or an in-process loopback in
//! tests, can sit in front of it.
//!
//! ## Key Invariants
//!
//! - An event id is stored once; pushing it again is accepted as a duplicate
//! - An event is served to its receiver until the receiver acks it
//! - Acks are served to the sender until the sender confirms them
//! - A facility's master-data offset never moves backwards

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod compat;
mod config;
mod error;
mod event_log;
mod export;
mod handler;
mod master_data;
mod server;
mod snapshot_store;

pub use compat::CompatibilityGate;
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use event_log::{AppendOutcome, CentralEventLog, LoggedEvent};
pub use export::OnlineExportService;
pub use handler::{HandlerContext, RequestHandler};
pub use master_data::{
    CleanupReport, InMemoryMasterDataSource, MasterDataOffset, MasterDataService,
    MasterDataSource,
};
pub use server::{ServerResponse, WebServer};
pub use snapshot_store::{DirectorySnapshotStore, InMemorySnapshotStore, SnapshotStore};
