//! Test fixtures: agents on temporary journals, recording replay handlers,
//! and an in-process central service.

use localmachine_engine::{
    AgentConfig, EventReplayer, EventStore, HttpResponse, HttpWebClient, LocalDatabase,
    LoopbackClient, LoopbackServer, OnlineWebClient, ReplayContext, ReplayDispatch, SyncService,
    SyncStatus,
};
use localmachine_protocol::{Event, EventId, EventPayload, FacilityId};
use localmachine_server::{ServerConfig, WebServer};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Base URL agents use to reach the in-process service.
pub const CENTRAL_URL: &str = "http://central";

/// Replay handler that remembers what it saw.
///
/// Cloning shares the record. Categories marked failing return an error
/// from [`replay`](EventReplayer::replay) without recording the event.
#[derive(Clone, Default)]
pub struct RecordingReplayer {
    replayed: Arc<Mutex<Vec<(EventId, ReplayContext)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingReplayer {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes replays of `category` fail until [`recover`](Self::recover).
    pub fn fail_category(&self, category: impl Into<String>) {
        self.failing.lock().insert(category.into());
    }

    /// Lets `category` replay again.
    pub fn recover(&self, category: &str) {
        self.failing.lock().remove(category);
    }

    /// Replayed event ids, in replay order.
    pub fn replayed(&self) -> Vec<EventId> {
        self.replayed.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Contexts passed with each replay.
    pub fn contexts(&self) -> Vec<ReplayContext> {
        self.replayed.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    /// Number of replays of `id`.
    pub fn count_of(&self, id: &EventId) -> usize {
        self.replayed.lock().iter().filter(|(e, _)| e == id).count()
    }

    /// Dispatch table routing each of `categories` to this recorder.
    pub fn dispatch_for(&self, categories: &[&str]) -> ReplayDispatch {
        let mut dispatch = ReplayDispatch::new();
        for category in categories {
            dispatch.register(*category, Arc::new(self.clone()));
        }
        dispatch
    }
}

impl EventReplayer for RecordingReplayer {
    fn replay(&self, event: &Event, context: &ReplayContext) -> Result<(), String> {
        if self.failing.lock().contains(&event.category) {
            return Err(format!("handler for {} is failing", event.category));
        }
        self.replayed.lock().push((event.id, context.clone()));
        Ok(())
    }
}

/// Categories routed to the recorder of every [`TestAgent`].
pub const TEST_CATEGORIES: &[&str] = &["ORDER", "SHIPMENT", "STOCK_MOVED"];

/// An agent with automatic cleanup.
pub struct TestAgent<C: OnlineWebClient> {
    /// The sync service.
    pub service: Arc<SyncService<C>>,
    /// Replay recorder registered for [`TEST_CATEGORIES`].
    pub replays: RecordingReplayer,
    db: Arc<LocalDatabase>,
    temp_dir: Option<TempDir>,
}

impl<C: OnlineWebClient> TestAgent<C> {
    /// Creates an agent on an in-memory journal.
    pub fn memory(config: AgentConfig, client: C) -> Self {
        let db = LocalDatabase::open_in_memory().expect("Failed to open in-memory database");
        Self::build(config, client, Arc::new(db), None)
    }

    /// Creates an agent on a journal in a temporary directory.
    pub fn file(config: AgentConfig, client: C) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = LocalDatabase::open(temp_dir.path().join("agent.journal"))
            .expect("Failed to open file database");
        Self::build(config, client, Arc::new(db), Some(temp_dir))
    }

    fn build(
        config: AgentConfig,
        client: C,
        db: Arc<LocalDatabase>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let replays = RecordingReplayer::new();
        let dispatch = replays.dispatch_for(TEST_CATEGORIES);
        let service = SyncService::new(config, Arc::clone(&db), client, dispatch);
        Self {
            service: Arc::new(service),
            replays,
            db,
            temp_dir,
        }
    }

    /// Home facility.
    pub fn home(&self) -> FacilityId {
        self.service.config().home_facility
    }

    /// The agent's database.
    pub fn database(&self) -> &Arc<LocalDatabase> {
        &self.db
    }

    /// The agent's event store.
    pub fn store(&self) -> &EventStore {
        self.service.store()
    }

    /// Journal path if file-based, None if in-memory.
    pub fn journal_path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("agent.journal"))
    }

    /// Emits an event for `receiver` with a payload of `size` bytes.
    pub fn emit(&self, receiver: FacilityId, category: &str, size: usize) -> Event {
        let store = self.store();
        store
            .transaction(|txn| {
                Ok(store.emit(
                    txn,
                    "test-group",
                    category,
                    EventPayload::new(1, vec![0x5a; size]),
                    receiver,
                ))
            })
            .expect("Failed to emit event")
    }

    /// Outstanding work.
    pub fn status(&self) -> SyncStatus {
        self.store().status()
    }
}

/// Serves a [`WebServer`] to loopback clients.
#[derive(Clone)]
pub struct ServerLoopback {
    server: Arc<WebServer>,
}

impl ServerLoopback {
    /// Wraps a shared server.
    pub fn new(server: Arc<WebServer>) -> Self {
        Self { server }
    }

    /// The wrapped server.
    pub fn server(&self) -> &Arc<WebServer> {
        &self.server
    }
}

impl LoopbackServer for ServerLoopback {
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse {
        let response = self.server.route_post(path, body);
        HttpResponse {
            status: response.status,
            body: response.body,
        }
    }

    fn handle_get(&self, path: &str) -> HttpResponse {
        let response = self.server.route_get(path);
        HttpResponse {
            status: response.status,
            body: response.body,
        }
    }
}

/// Web client type of agents wired to an in-process service.
pub type LoopbackWebClient = HttpWebClient<LoopbackClient<ServerLoopback>>;

/// One central service shared by several in-process agents.
pub struct TestNetwork {
    /// The central service.
    pub server: Arc<WebServer>,
}

impl TestNetwork {
    /// Creates a network around a service with default configuration.
    pub fn new() -> Self {
        Self::with_server(WebServer::new(
            ServerConfig::new().with_public_url(CENTRAL_URL),
        ))
    }

    /// Creates a network around `server`.
    pub fn with_server(server: WebServer) -> Self {
        Self {
            server: Arc::new(server),
        }
    }

    /// A client reaching the service.
    pub fn client(&self) -> LoopbackWebClient {
        HttpWebClient::new(
            CENTRAL_URL,
            LoopbackClient::new(ServerLoopback::new(Arc::clone(&self.server))),
        )
    }

    /// Adds an in-memory agent for a new facility.
    pub fn agent(&self) -> TestAgent<LoopbackWebClient> {
        self.agent_with(|config| config)
    }

    /// Adds an in-memory agent for a new facility, adjusting its
    /// configuration.
    pub fn agent_with(
        &self,
        configure: impl FnOnce(AgentConfig) -> AgentConfig,
    ) -> TestAgent<LoopbackWebClient> {
        let config = configure(AgentConfig::new(FacilityId::new(), CENTRAL_URL));
        TestAgent::memory(config, self.client())
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localmachine_engine::{CycleOutcome, MockWebClient};

    #[test]
    fn recorder_records_and_fails() {
        let replays = RecordingReplayer::new();
        let event = Event::new(
            "g",
            "ORDER",
            EventPayload::new(1, vec![]),
            FacilityId::new(),
            FacilityId::new(),
        );
        let context = ReplayContext::new(event.receiver_id);

        replays.replay(&event, &context).unwrap();
        replays.fail_category("ORDER");
        assert!(replays.replay(&event, &context).is_err());
        replays.recover("ORDER");
        replays.replay(&event, &context).unwrap();

        assert_eq!(replays.count_of(&event.id), 2);
    }

    #[test]
    fn file_agent_has_journal() {
        let agent = TestAgent::file(
            AgentConfig::new(FacilityId::new(), CENTRAL_URL),
            MockWebClient::new(),
        );
        agent.emit(FacilityId::new(), "ORDER", 10);
        assert!(agent.journal_path().unwrap().exists());
        assert_eq!(agent.status().pending_push, 1);
    }

    #[test]
    fn agents_share_a_network() {
        let network = TestNetwork::new();
        let (a, b) = (network.agent(), network.agent());
        let event = a.emit(b.home(), "ORDER", 10);

        assert!(matches!(a.service.sync_cycle().unwrap(), CycleOutcome::Completed(_)));
        b.service.sync_cycle().unwrap();

        assert_eq!(b.replays.replayed(), vec![event.id]);
    }
}
