//! The central web service.

use crate::compat::CompatibilityGate;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::event_log::CentralEventLog;
use crate::export::OnlineExportService;
use crate::handler::{HandlerContext, RequestHandler};
use crate::master_data::{InMemoryMasterDataSource, MasterDataService, MasterDataSource};
use crate::snapshot_store::{InMemorySnapshotStore, SnapshotStore};
use localmachine_protocol::{
    endpoints, AckExchangeRequest, ConfirmAcksRequest, ConfirmOffsetRequest,
    MasterDataDeltasRequest, MasterDataResyncRequest, PeeringEventsRequest, PushEventsRequest,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Status and body of a routed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    /// HTTP status code.
    pub status: u16,
    /// CBOR-encoded response, error payload, or raw archive bytes.
    pub body: Vec<u8>,
}

impl ServerResponse {
    fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The central web service.
///
/// Transport-agnostic: an HTTP front end (or an in-process loopback) hands
/// each request's path and body to [`route_post`](Self::route_post) or
/// [`route_get`](Self::route_get) and writes back the returned status and
/// body. Failures are answered with a CBOR
/// [`ErrorResponse`](localmachine_protocol::ErrorResponse).
///
/// # Example
///
/// ```
/// use localmachine_server::{ServerConfig, WebServer};
///
/// let server = WebServer::new(ServerConfig::default());
/// let response = server.route_get("/nowhere");
/// assert_eq!(response.status, 404);
/// ```
pub struct WebServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
    export: OnlineExportService,
}

impl WebServer {
    /// Creates a service with in-memory master data and snapshots.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(CompatibilityGate::new()),
            Arc::new(InMemoryMasterDataSource::new()),
            Arc::new(InMemorySnapshotStore::new()),
        )
    }

    /// Creates a service from its parts.
    pub fn with_parts(
        config: ServerConfig,
        gate: Arc<CompatibilityGate>,
        source: Arc<dyn MasterDataSource>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        let log = Arc::new(CentralEventLog::new());
        let master_data = Arc::new(MasterDataService::new(config.clone(), source, snapshots));
        let export = OnlineExportService::new(
            Arc::clone(&log),
            Arc::clone(&gate),
            config.export_capacity,
        );
        let context = Arc::new(HandlerContext::new(config, log, gate, master_data));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self {
            handler,
            context,
            export,
        }
    }

    /// Routes a POST request.
    pub fn route_post(&self, path: &str, body: &[u8]) -> ServerResponse {
        respond(path, self.dispatch_post(path, body))
    }

    /// Routes a GET request: snapshot downloads and master-data files.
    pub fn route_get(&self, path: &str) -> ServerResponse {
        let result = if let Some(version) = path.strip_prefix(endpoints::SNAPSHOTS) {
            self.handler.handle_snapshot(version)
        } else if let Some(facility) = path.strip_prefix(endpoints::MASTER_DATA_EXPORT) {
            self.handler.handle_master_data_export(facility)
        } else {
            Err(ServerError::UnknownEndpoint(path.to_string()))
        };
        respond(path, result)
    }

    fn dispatch_post(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        let h = &self.handler;
        let encoded = match path {
            endpoints::PUSH_EVENTS => h.handle_push(PushEventsRequest::decode(body)?)?.encode(),
            endpoints::PEERING_EVENTS => {
                h.handle_peering(PeeringEventsRequest::decode(body)?)?.encode()
            }
            endpoints::ACK_EXCHANGE => {
                h.handle_ack_exchange(AckExchangeRequest::decode(body)?)?.encode()
            }
            endpoints::CONFIRM_ACKS => {
                h.handle_confirm_acks(ConfirmAcksRequest::decode(body)?)?;
                Ok(Vec::new())
            }
            endpoints::MASTER_DATA_RESYNC => {
                h.handle_resync(MasterDataResyncRequest::decode(body)?)?.encode()
            }
            endpoints::MASTER_DATA_DELTAS => {
                h.handle_deltas(MasterDataDeltasRequest::decode(body)?)?.encode()
            }
            endpoints::MASTER_DATA_OFFSET => {
                h.handle_confirm_offset(ConfirmOffsetRequest::decode(body)?)?.encode()
            }
            _ => return Err(ServerError::UnknownEndpoint(path.to_string())),
        };
        Ok(encoded?)
    }

    /// Returns the request handler.
    pub fn handler(&self) -> &RequestHandler {
        &self.handler
    }

    /// Returns the central event log.
    pub fn log(&self) -> &Arc<CentralEventLog> {
        &self.context.log
    }

    /// Returns the master-data subsystem.
    pub fn master_data(&self) -> &Arc<MasterDataService> {
        &self.context.master_data
    }

    /// Returns the online export service.
    pub fn export(&self) -> &OnlineExportService {
        &self.export
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }
}

fn respond(path: &str, result: ServerResult<Vec<u8>>) -> ServerResponse {
    match result {
        Ok(body) => {
            debug!(path, bytes = body.len(), "request served");
            ServerResponse::ok(body)
        }
        Err(e) => {
            let response = e.to_response();
            if e.is_server_error() {
                warn!(path, error = %e, "request failed");
            } else {
                debug!(path, error = %e, "request rejected");
            }
            // An error payload that cannot be encoded still carries its status.
            let body = response.encode().unwrap_or_default();
            ServerResponse {
                status: response.status,
                body,
            }
        }
    }
}
