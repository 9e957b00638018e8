//! Configuration for an agent.

use localmachine_protocol::{BusinessVersion, FacilityId, EXPORT_CAPACITY, NETWORK_CAPACITY};
use std::time::Duration;

/// Name of the default sync lock.
pub const REPLAY_GROUP_LOCK: &str = "replay group";

/// Name of the agent's master-data lock.
pub const MASTER_DATA_LOCK: &str = "master data resync";

/// Configuration for a facility-local agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Facility this agent runs for.
    pub home_facility: FacilityId,
    /// Base URL of the central web service.
    pub server_url: String,
    /// Business version of this agent, sent with every request.
    pub agent_version: BusinessVersion,
    /// Capacity of one packed block on the network path.
    pub network_capacity: usize,
    /// Capacity of one packed file on the export path.
    pub export_capacity: usize,
    /// Lock held for the duration of a sync cycle.
    pub sync_lock_name: String,
    /// How long a cycle waits for the sync lock before skipping.
    pub sync_lock_wait: Duration,
    /// Lock held during a master-data resync.
    pub resync_lock_name: String,
    /// How long a resync waits for its lock before failing.
    pub resync_lock_wait: Duration,
    /// Interval between scheduled cycles.
    pub sync_interval: Duration,
    /// Timeout for a single transport call.
    pub request_timeout: Duration,
    /// Maximum master-data deltas fetched per request.
    pub delta_page_limit: u32,
    /// How old the last-synced time may grow before a cycle that moved
    /// nothing records it again.
    pub idle_sync_refresh: Duration,
}

impl AgentConfig {
    /// Creates a configuration for `home_facility` talking to `server_url`.
    pub fn new(home_facility: FacilityId, server_url: impl Into<String>) -> Self {
        Self {
            home_facility,
            server_url: server_url.into(),
            agent_version: BusinessVersion::new(1, 0, 0),
            network_capacity: NETWORK_CAPACITY,
            export_capacity: EXPORT_CAPACITY,
            sync_lock_name: REPLAY_GROUP_LOCK.to_string(),
            sync_lock_wait: Duration::from_secs(5),
            resync_lock_name: MASTER_DATA_LOCK.to_string(),
            resync_lock_wait: Duration::from_secs(5 * 60),
            sync_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            delta_page_limit: 500,
            idle_sync_refresh: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the agent business version.
    pub fn with_agent_version(mut self, version: BusinessVersion) -> Self {
        self.agent_version = version;
        self
    }

    /// Sets the network block capacity.
    pub fn with_network_capacity(mut self, bytes: usize) -> Self {
        self.network_capacity = bytes;
        self
    }

    /// Sets the export file capacity.
    pub fn with_export_capacity(mut self, bytes: usize) -> Self {
        self.export_capacity = bytes;
        self
    }

    /// Sets the sync lock name and wait.
    pub fn with_sync_lock(mut self, name: impl Into<String>, wait: Duration) -> Self {
        self.sync_lock_name = name.into();
        self.sync_lock_wait = wait;
        self
    }

    /// Sets the resync lock wait.
    pub fn with_resync_lock_wait(mut self, wait: Duration) -> Self {
        self.resync_lock_wait = wait;
        self
    }

    /// Sets the interval between scheduled cycles.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how often idle cycles refresh the last-synced time.
    pub fn with_idle_sync_refresh(mut self, refresh: Duration) -> Self {
        self.idle_sync_refresh = refresh;
        self
    }

    /// Sets the master-data delta page size.
    pub fn with_delta_page_limit(mut self, limit: u32) -> Self {
        self.delta_page_limit = limit;
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(FacilityId::from_uuid(uuid::Uuid::nil()), "")
    }
}
