//! Server configuration.

use localmachine_protocol::{EXPORT_CAPACITY, NETWORK_CAPACITY};
use std::time::Duration;

/// Configuration for the central service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public base URL prefixed to snapshot download links. Empty yields
    /// relative links.
    pub public_url: String,
    /// Capacity of one peering page.
    pub peering_capacity: usize,
    /// Maximum events in one peering page.
    pub max_peering_events: usize,
    /// Capacity of one packed file in an online export.
    pub export_capacity: usize,
    /// Maximum master-data deltas per page, whatever the caller asks for.
    pub max_delta_page: u32,
    /// Master-data schema version reported on resync.
    pub schema_version: u32,
    /// How long a resync waits for its facility group's lock.
    pub resync_lock_wait: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            public_url: String::new(),
            peering_capacity: NETWORK_CAPACITY,
            max_peering_events: 10_000,
            export_capacity: EXPORT_CAPACITY,
            max_delta_page: 1_000,
            schema_version: 1,
            resync_lock_wait: Duration::from_secs(5 * 60),
        }
    }

    /// Sets the public base URL.
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the peering page capacity in bytes.
    pub fn with_peering_capacity(mut self, bytes: usize) -> Self {
        self.peering_capacity = bytes;
        self
    }

    /// Sets the maximum events per peering page.
    pub fn with_max_peering_events(mut self, max: usize) -> Self {
        self.max_peering_events = max;
        self
    }

    /// Sets the online export file capacity.
    pub fn with_export_capacity(mut self, bytes: usize) -> Self {
        self.export_capacity = bytes;
        self
    }

    /// Sets the maximum delta page size.
    pub fn with_max_delta_page(mut self, max: u32) -> Self {
        self.max_delta_page = max;
        self
    }

    /// Sets the schema version.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Sets the resync lock wait.
    pub fn with_resync_lock_wait(mut self, wait: Duration) -> Self {
        self.resync_lock_wait = wait;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
