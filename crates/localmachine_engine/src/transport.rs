//! Transport abstraction for talking to the central web service.

use crate::error::{SyncError, SyncResult};
use localmachine_protocol::{
    AckExchangeRequest, AckExchangeResponse, ConfirmAcksRequest, ConfirmOffsetRequest,
    ConfirmOffsetResponse, EventFile, MasterDataDeltasRequest, MasterDataDeltasResponse,
    MasterDataResyncRequest, MasterDataResyncResponse, PeeringEventsRequest,
    PeeringEventsResponse, PushEventsRequest, PushEventsResponse,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Calls the agent makes against the web service.
///
/// Every call blocks until the service answers or the request timeout
/// expires. Implementations map timeouts to [`SyncError::Timeout`] and
/// server-side failures to retryable errors.
pub trait OnlineWebClient: Send + Sync {
    /// Uploads one packed block of events.
    fn push_events(&self, request: &PushEventsRequest) -> SyncResult<PushEventsResponse>;

    /// Fetches one page of events addressed to the caller.
    fn peering_events(&self, request: &PeeringEventsRequest) -> SyncResult<PeeringEventsResponse>;

    /// Sends local acks and receives acks for events the caller sent.
    fn exchange_acks(&self, request: &AckExchangeRequest) -> SyncResult<AckExchangeResponse>;

    /// Confirms acks received in an exchange.
    fn confirm_acks(&self, request: &ConfirmAcksRequest) -> SyncResult<()>;

    /// Asks for a master-data resync.
    fn master_data_resync(
        &self,
        request: &MasterDataResyncRequest,
    ) -> SyncResult<MasterDataResyncResponse>;

    /// Fetches master-data deltas past the caller's offset.
    fn master_data_deltas(
        &self,
        request: &MasterDataDeltasRequest,
    ) -> SyncResult<MasterDataDeltasResponse>;

    /// Advances the caller's master-data offset.
    fn confirm_offset(&self, request: &ConfirmOffsetRequest) -> SyncResult<ConfirmOffsetResponse>;

    /// Downloads a snapshot archive.
    fn download_snapshot(&self, url: &str) -> SyncResult<Vec<u8>>;
}

impl<T: OnlineWebClient + ?Sized> OnlineWebClient for Arc<T> {
    fn push_events(&self, request: &PushEventsRequest) -> SyncResult<PushEventsResponse> {
        (**self).push_events(request)
    }

    fn peering_events(&self, request: &PeeringEventsRequest) -> SyncResult<PeeringEventsResponse> {
        (**self).peering_events(request)
    }

    fn exchange_acks(&self, request: &AckExchangeRequest) -> SyncResult<AckExchangeResponse> {
        (**self).exchange_acks(request)
    }

    fn confirm_acks(&self, request: &ConfirmAcksRequest) -> SyncResult<()> {
        (**self).confirm_acks(request)
    }

    fn master_data_resync(
        &self,
        request: &MasterDataResyncRequest,
    ) -> SyncResult<MasterDataResyncResponse> {
        (**self).master_data_resync(request)
    }

    fn master_data_deltas(
        &self,
        request: &MasterDataDeltasRequest,
    ) -> SyncResult<MasterDataDeltasResponse> {
        (**self).master_data_deltas(request)
    }

    fn confirm_offset(&self, request: &ConfirmOffsetRequest) -> SyncResult<ConfirmOffsetResponse> {
        (**self).confirm_offset(request)
    }

    fn download_snapshot(&self, url: &str) -> SyncResult<Vec<u8>> {
        (**self).download_snapshot(url)
    }
}

/// A scripted client for testing.
///
/// Queued results are returned in order. When a queue is empty the mock
/// behaves like a healthy service with nothing to say: pushes are accepted
/// in full, pages and exchanges are empty.
#[derive(Default)]
pub struct MockWebClient {
    push_results: Mutex<VecDeque<SyncResult<PushEventsResponse>>>,
    peering_results: Mutex<VecDeque<SyncResult<PeeringEventsResponse>>>,
    exchange_results: Mutex<VecDeque<SyncResult<AckExchangeResponse>>>,
    resync_results: Mutex<VecDeque<SyncResult<MasterDataResyncResponse>>>,
    delta_results: Mutex<VecDeque<SyncResult<MasterDataDeltasResponse>>>,
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    pushed: Mutex<Vec<PushEventsRequest>>,
    exchanged: Mutex<Vec<AckExchangeRequest>>,
    confirmed_acks: Mutex<Vec<ConfirmAcksRequest>>,
    confirmed_offsets: Mutex<Vec<ConfirmOffsetRequest>>,
}

impl MockWebClient {
    /// Creates a mock with empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the result of the next push.
    pub fn queue_push(&self, result: SyncResult<PushEventsResponse>) {
        self.push_results.lock().push_back(result);
    }

    /// Queues the result of the next peering request.
    pub fn queue_peering(&self, result: SyncResult<PeeringEventsResponse>) {
        self.peering_results.lock().push_back(result);
    }

    /// Queues the result of the next ack exchange.
    pub fn queue_exchange(&self, result: SyncResult<AckExchangeResponse>) {
        self.exchange_results.lock().push_back(result);
    }

    /// Queues the result of the next resync request.
    pub fn queue_resync(&self, result: SyncResult<MasterDataResyncResponse>) {
        self.resync_results.lock().push_back(result);
    }

    /// Queues the result of the next delta request.
    pub fn queue_deltas(&self, result: SyncResult<MasterDataDeltasResponse>) {
        self.delta_results.lock().push_back(result);
    }

    /// Makes a snapshot downloadable at `url`.
    pub fn put_snapshot(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.snapshots.lock().insert(url.into(), bytes);
    }

    /// Push requests received so far, including failed ones.
    pub fn pushed_requests(&self) -> Vec<PushEventsRequest> {
        self.pushed.lock().clone()
    }

    /// Ack exchange requests received so far.
    pub fn exchange_requests(&self) -> Vec<AckExchangeRequest> {
        self.exchanged.lock().clone()
    }

    /// Ack confirmations received so far.
    pub fn confirmed_acks(&self) -> Vec<ConfirmAcksRequest> {
        self.confirmed_acks.lock().clone()
    }

    /// Offset confirmations received so far.
    pub fn confirmed_offsets(&self) -> Vec<ConfirmOffsetRequest> {
        self.confirmed_offsets.lock().clone()
    }
}

impl OnlineWebClient for MockWebClient {
    fn push_events(&self, request: &PushEventsRequest) -> SyncResult<PushEventsResponse> {
        self.pushed.lock().push(request.clone());
        match self.push_results.lock().pop_front() {
            Some(result) => result,
            None => {
                let events = EventFile::decode(&request.file)?;
                Ok(PushEventsResponse {
                    accepted: events.iter().map(|e| e.id).collect(),
                    duplicates: 0,
                })
            }
        }
    }

    fn peering_events(&self, request: &PeeringEventsRequest) -> SyncResult<PeeringEventsResponse> {
        self.peering_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(PeeringEventsResponse {
                file: None,
                next_cursor: request.cursor,
                has_more: false,
            }))
    }

    fn exchange_acks(&self, request: &AckExchangeRequest) -> SyncResult<AckExchangeResponse> {
        self.exchanged.lock().push(request.clone());
        self.exchange_results
            .lock()
            .pop_front()
            .unwrap_or(Ok(AckExchangeResponse { acks: Vec::new() }))
    }

    fn confirm_acks(&self, request: &ConfirmAcksRequest) -> SyncResult<()> {
        self.confirmed_acks.lock().push(request.clone());
        Ok(())
    }

    fn master_data_resync(
        &self,
        _request: &MasterDataResyncRequest,
    ) -> SyncResult<MasterDataResyncResponse> {
        self.resync_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no mock resync response set")))
    }

    fn master_data_deltas(
        &self,
        _request: &MasterDataDeltasRequest,
    ) -> SyncResult<MasterDataDeltasResponse> {
        self.delta_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no mock delta response set")))
    }

    fn confirm_offset(&self, request: &ConfirmOffsetRequest) -> SyncResult<ConfirmOffsetResponse> {
        self.confirmed_offsets.lock().push(request.clone());
        Ok(ConfirmOffsetResponse {
            record_offset: request.record_offset,
        })
    }

    fn download_snapshot(&self, url: &str) -> SyncResult<Vec<u8>> {
        self.snapshots
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::Server {
                status: 404,
                kind: "NotFound".into(),
                message: format!("no snapshot at {url}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localmachine_protocol::{
        pack_events, BusinessVersion, Event, EventPayload, FacilityId,
    };

    #[test]
    fn mock_accepts_pushes_by_default() {
        let mock = MockWebClient::new();
        let event = Event::new(
            "g",
            "C",
            EventPayload::new(1, vec![]),
            FacilityId::new(),
            FacilityId::new(),
        );
        let file = pack_events([&event], 1024).unwrap().remove(0);

        let response = mock
            .push_events(&PushEventsRequest {
                facility_id: event.sender_id,
                agent_version: BusinessVersion::new(1, 0, 0),
                file: file.into_bytes(),
            })
            .unwrap();

        assert_eq!(response.accepted, vec![event.id]);
        assert_eq!(mock.pushed_requests().len(), 1);
    }

    #[test]
    fn queued_failures_come_first() {
        let mock = MockWebClient::new();
        mock.queue_exchange(Err(SyncError::Timeout));

        let request = AckExchangeRequest {
            facility_id: FacilityId::new(),
            agent_version: BusinessVersion::default(),
            acks: vec![],
        };
        assert!(matches!(
            mock.exchange_acks(&request),
            Err(SyncError::Timeout)
        ));
        assert!(mock.exchange_acks(&request).unwrap().acks.is_empty());
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let mock = MockWebClient::new();
        assert!(matches!(
            mock.download_snapshot("http://x/none"),
            Err(SyncError::Server { status: 404, .. })
        ));
    }
}
