//! Request handlers for sync endpoints.

use crate::compat::CompatibilityGate;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::event_log::CentralEventLog;
use crate::master_data::MasterDataService;
use chrono::Utc;
use localmachine_protocol::{
    AckExchangeRequest, AckExchangeResponse, ConfirmAcksRequest, ConfirmOffsetRequest,
    ConfirmOffsetResponse, EventFile, EventResourcePacker, FacilityId,
    MasterDataDeltasRequest, MasterDataDeltasResponse, MasterDataResyncRequest,
    MasterDataResyncResponse, PeeringEventsRequest, PeeringEventsResponse, ProtocolError,
    PushEventsRequest, PushEventsResponse,
};
use std::sync::Arc;
use tracing::debug;

/// Shared state behind the handlers.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Central event log.
    pub log: Arc<CentralEventLog>,
    /// Compatibility rules for outgoing events.
    pub gate: Arc<CompatibilityGate>,
    /// Master-data subsystem.
    pub master_data: Arc<MasterDataService>,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(
        config: ServerConfig,
        log: Arc<CentralEventLog>,
        gate: Arc<CompatibilityGate>,
        master_data: Arc<MasterDataService>,
    ) -> Self {
        Self {
            config,
            log,
            gate,
            master_data,
        }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Stores one pushed block.
    ///
    /// A block that fails its checksum is refused as a whole.
    pub fn handle_push(&self, request: PushEventsRequest) -> ServerResult<PushEventsResponse> {
        let events = EventFile::decode(&request.file)?;
        let outcome = self.context.log.append(request.facility_id, events);
        Ok(PushEventsResponse {
            accepted: outcome.accepted,
            duplicates: outcome.duplicates,
        })
    }

    /// Serves one page of events addressed to the caller.
    ///
    /// A page holds as many events as fit into one packed block of the
    /// configured peering capacity; an oversized event travels alone.
    pub fn handle_peering(&self, request: PeeringEventsRequest) -> ServerResult<PeeringEventsResponse> {
        let config = &self.context.config;
        let candidates =
            self.context
                .log
                .pending_for(request.facility_id, request.cursor, config.max_peering_events);

        let mut packer = EventResourcePacker::new(config.peering_capacity);
        let mut next_cursor = request.cursor;

        for logged in candidates {
            let Some(event) = self.context.gate.admit(request.agent_version, logged.event) else {
                next_cursor = logged.position;
                continue;
            };
            match packer.write_event_and_get_remaining_capacity(&event) {
                Ok(remaining) => {
                    next_cursor = logged.position;
                    if remaining <= 0 {
                        break;
                    }
                }
                Err(ProtocolError::CapacityExceeded { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }

        let has_more = !self
            .context
            .log
            .pending_for(request.facility_id, next_cursor, 1)
            .is_empty();
        let file = (!packer.is_empty()).then(|| packer.finish().into_bytes());
        debug!(
            facility = %request.facility_id,
            cursor = request.cursor,
            next_cursor,
            has_more,
            "served peering page"
        );

        Ok(PeeringEventsResponse {
            file,
            next_cursor,
            has_more,
        })
    }

    /// Applies the caller's acks and returns the acks waiting for it.
    pub fn handle_ack_exchange(&self, request: AckExchangeRequest) -> ServerResult<AckExchangeResponse> {
        self.context
            .log
            .receive_acks(request.facility_id, &request.acks);
        Ok(AckExchangeResponse {
            acks: self.context.log.acks_for(request.facility_id),
        })
    }

    /// Drops acks the caller has applied.
    pub fn handle_confirm_acks(&self, request: ConfirmAcksRequest) -> ServerResult<()> {
        let dropped = self
            .context
            .log
            .confirm_acks(request.facility_id, &request.event_ids);
        debug!(facility = %request.facility_id, dropped, "confirmed acks");
        Ok(())
    }

    /// Points the caller at the latest master-data snapshot.
    pub fn handle_resync(&self, request: MasterDataResyncRequest) -> ServerResult<MasterDataResyncResponse> {
        self.context
            .master_data
            .resync(request.facility_id, Utc::now())
    }

    /// Serves the caller's next page of master-data deltas.
    pub fn handle_deltas(&self, request: MasterDataDeltasRequest) -> ServerResult<MasterDataDeltasResponse> {
        self.context
            .master_data
            .deltas_for(request.facility_id, request.limit)
    }

    /// Advances the caller's master-data offset.
    pub fn handle_confirm_offset(&self, request: ConfirmOffsetRequest) -> ServerResult<ConfirmOffsetResponse> {
        self.context.master_data.confirm_offset(
            request.facility_id,
            request.record_offset,
            &request.snapshot_version,
        )
    }

    /// Serves a snapshot archive.
    pub fn handle_snapshot(&self, version: &str) -> ServerResult<Vec<u8>> {
        if version.is_empty() {
            return Err(ServerError::InvalidRequest("missing snapshot version".into()));
        }
        self.context.master_data.snapshot_archive(version)
    }

    /// Builds a master-data file for the facility named by `facility`.
    pub fn handle_master_data_export(&self, facility: &str) -> ServerResult<Vec<u8>> {
        let facility: FacilityId = facility
            .parse()
            .map_err(|e| ServerError::InvalidRequest(format!("bad facility id {facility}: {e}")))?;
        self.context.master_data.export_file(facility, Utc::now())
    }
}
