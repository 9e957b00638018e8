//! # localmachine engine
//!
//! Agent side of the localmachine offline-first event sync.
//!
//! This crate provides:
//! - A journaled local database with transactions ([`LocalDatabase`])
//! - The event log and ack bookkeeping ([`EventStore`])
//! - Durable failure records in their own transactions ([`ErrorRecorder`])
//! - The transport abstraction ([`OnlineWebClient`]) with HTTP, loopback and
//!   mock implementations
//! - Idempotent replay of received events ([`EventImporter`])
//! - The push → pull → ack exchange → replay cycle ([`SyncService`]) and
//!   its ticker ([`SyncScheduler`])
//! - File-based export and import for facilities without a network path
//! - Master-data snapshot resync and delta catch-up ([`MasterDataSyncer`])
//!
//! ## Key Invariants
//!
//! - Events are never deleted; their sync flags only go from false to true
//! - An event is marked synced only after the web service accepted it
//! - Replay runs at most once per event id
//! - Error records survive rollback of the operation that failed
//! - Every cycle re-reads its state from the database

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod database;
mod error;
mod error_recorder;
mod event_store;
mod facility;
mod file_transfer;
mod http;
mod importer;
mod lock;
mod master_data;
mod records;
mod scheduler;
mod state;
mod transport;

pub use config::{AgentConfig, MASTER_DATA_LOCK, REPLAY_GROUP_LOCK};
pub use database::{LocalDatabase, Tables, Transaction};
pub use error::{SyncError, SyncResult};
pub use error_recorder::ErrorRecorder;
pub use event_store::{EventStore, SyncStatus};
pub use facility::{Facility, FacilityDirectory, StaticFacilityDirectory};
pub use file_transfer::{ExportArchive, LocalExportService, LocalImportService};
#[cfg(feature = "reqwest-client")]
pub use http::ReqwestClient;
pub use http::{HttpClient, HttpResponse, HttpWebClient, LoopbackClient, LoopbackServer};
pub use importer::{EventImporter, EventReplayer, ImportSummary, ReplayContext, ReplayDispatch};
pub use lock::{LockGuard, LockProvider};
pub use master_data::{InMemoryMasterData, MasterDataApplier, MasterDataReport, MasterDataSyncer};
pub use records::{
    ErrorPayload, ErrorRecord, ErrorType, LastSyncReplayRecord, LAST_SYNC_REPLAY_RECORD_ID,
};
pub use scheduler::SyncScheduler;
pub use state::{CycleOutcome, CycleReport, PhaseOutcome, SyncService, SyncState, SyncStats};
pub use transport::{MockWebClient, OnlineWebClient};
