//! HTTP transport implementation.
//!
//! The actual HTTP library is abstracted behind [`HttpClient`] so the
//! transport can run over reqwest, an in-process loopback, or a test double.
//! Request and response bodies are CBOR.

use crate::error::{SyncError, SyncResult};
use crate::transport::OnlineWebClient;
use localmachine_protocol::{
    endpoints, AckExchangeRequest, AckExchangeResponse, ConfirmAcksRequest, ConfirmOffsetRequest,
    ConfirmOffsetResponse, ErrorResponse, MasterDataDeltasRequest, MasterDataDeltasResponse,
    MasterDataResyncRequest, MasterDataResyncResponse, PeeringEventsRequest,
    PeeringEventsResponse, ProtocolResult, PushEventsRequest, PushEventsResponse,
};
use parking_lot::RwLock;
use tracing::trace;

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A `200 OK` response.
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Connection failures are reported as [`SyncError::Transport`], timeouts as
/// [`SyncError::Timeout`]. Any response that arrived, whatever its status,
/// is returned as `Ok`.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request.
    fn post(&self, url: &str, body: Vec<u8>) -> SyncResult<HttpResponse>;

    /// Sends a GET request.
    fn get(&self, url: &str) -> SyncResult<HttpResponse>;
}

/// [`OnlineWebClient`] over HTTP.
pub struct HttpWebClient<C: HttpClient> {
    base_url: String,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpWebClient<C> {
    /// Creates a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn track<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        match &result {
            Ok(_) => *self.last_error.write() = None,
            Err(e) => *self.last_error.write() = Some(e.to_string()),
        }
        result
    }

    fn post_cbor<Res>(
        &self,
        endpoint: &str,
        body: ProtocolResult<Vec<u8>>,
        decode: fn(&[u8]) -> ProtocolResult<Res>,
    ) -> SyncResult<Res> {
        let url = format!("{}{}", self.base_url, endpoint);
        let result = body
            .map_err(SyncError::from)
            .and_then(|body| {
                trace!(url = %url, bytes = body.len(), "POST");
                self.client.post(&url, body)
            })
            .and_then(into_body)
            .and_then(|bytes| decode(&bytes).map_err(SyncError::from));
        self.track(result)
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.base_url, url)
        }
    }
}

/// Maps a non-2xx response to a [`SyncError::Server`].
fn into_body(response: HttpResponse) -> SyncResult<Vec<u8>> {
    if response.is_success() {
        return Ok(response.body);
    }
    let error = ErrorResponse::decode(&response.body).unwrap_or_else(|_| {
        ErrorResponse::new(
            response.status,
            "Http",
            String::from_utf8_lossy(&response.body).into_owned(),
        )
    });
    Err(SyncError::Server {
        status: response.status,
        kind: error.kind,
        message: error.message,
    })
}

impl<C: HttpClient> OnlineWebClient for HttpWebClient<C> {
    fn push_events(&self, request: &PushEventsRequest) -> SyncResult<PushEventsResponse> {
        self.post_cbor(endpoints::PUSH_EVENTS, request.encode(), PushEventsResponse::decode)
    }

    fn peering_events(&self, request: &PeeringEventsRequest) -> SyncResult<PeeringEventsResponse> {
        self.post_cbor(
            endpoints::PEERING_EVENTS,
            request.encode(),
            PeeringEventsResponse::decode,
        )
    }

    fn exchange_acks(&self, request: &AckExchangeRequest) -> SyncResult<AckExchangeResponse> {
        self.post_cbor(
            endpoints::ACK_EXCHANGE,
            request.encode(),
            AckExchangeResponse::decode,
        )
    }

    fn confirm_acks(&self, request: &ConfirmAcksRequest) -> SyncResult<()> {
        self.post_cbor(endpoints::CONFIRM_ACKS, request.encode(), |_| Ok(()))
    }

    fn master_data_resync(
        &self,
        request: &MasterDataResyncRequest,
    ) -> SyncResult<MasterDataResyncResponse> {
        self.post_cbor(
            endpoints::MASTER_DATA_RESYNC,
            request.encode(),
            MasterDataResyncResponse::decode,
        )
    }

    fn master_data_deltas(
        &self,
        request: &MasterDataDeltasRequest,
    ) -> SyncResult<MasterDataDeltasResponse> {
        self.post_cbor(
            endpoints::MASTER_DATA_DELTAS,
            request.encode(),
            MasterDataDeltasResponse::decode,
        )
    }

    fn confirm_offset(&self, request: &ConfirmOffsetRequest) -> SyncResult<ConfirmOffsetResponse> {
        self.post_cbor(
            endpoints::MASTER_DATA_OFFSET,
            request.encode(),
            ConfirmOffsetResponse::decode,
        )
    }

    fn download_snapshot(&self, url: &str) -> SyncResult<Vec<u8>> {
        let url = self.resolve(url);
        trace!(url = %url, "GET");
        let result = self.client.get(&url).and_then(into_body);
        self.track(result)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request.
    fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse;

    /// Handles a GET request.
    fn handle_get(&self, path: &str) -> HttpResponse;
}

/// A loopback HTTP client that routes requests directly to a server in the
/// same process.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

/// Strips scheme and authority from `url`.
fn path_of(url: &str) -> &str {
    match url.find("://") {
        Some(i) => {
            let rest = &url[i + 3..];
            rest.find('/').map(|j| &rest[j..]).unwrap_or("/")
        }
        None => url,
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>) -> SyncResult<HttpResponse> {
        Ok(self.server.handle_post(path_of(url), &body))
    }

    fn get(&self, url: &str) -> SyncResult<HttpResponse> {
        Ok(self.server.handle_get(path_of(url)))
    }
}

/// Blocking reqwest implementation of [`HttpClient`].
#[cfg(feature = "reqwest-client")]
pub struct ReqwestClient {
    inner: reqwest::blocking::Client,
}

#[cfg(feature = "reqwest-client")]
impl ReqwestClient {
    /// Creates a client whose requests time out after `timeout`.
    pub fn new(timeout: std::time::Duration) -> SyncResult<Self> {
        let inner = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self { inner })
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> SyncResult<HttpResponse> {
        let response = request.send().map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(map_reqwest_error)?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

#[cfg(feature = "reqwest-client")]
fn map_reqwest_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
        SyncError::Timeout
    } else if error.is_builder() {
        SyncError::transport_fatal(error.to_string())
    } else {
        SyncError::transport_retryable(error.to_string())
    }
}

#[cfg(feature = "reqwest-client")]
impl HttpClient for ReqwestClient {
    fn post(&self, url: &str, body: Vec<u8>) -> SyncResult<HttpResponse> {
        self.send(
            self.inner
                .post(url)
                .header("content-type", "application/cbor")
                .body(body),
        )
    }

    fn get(&self, url: &str) -> SyncResult<HttpResponse> {
        self.send(self.inner.get(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localmachine_protocol::{BusinessVersion, FacilityId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct TestClient {
        response: Mutex<Option<SyncResult<HttpResponse>>>,
        urls: Mutex<Vec<String>>,
    }

    impl TestClient {
        fn respond(&self, response: SyncResult<HttpResponse>) {
            *self.response.lock() = Some(response);
        }

        fn next(&self, url: &str) -> SyncResult<HttpResponse> {
            self.urls.lock().push(url.to_string());
            self.response
                .lock()
                .take()
                .unwrap_or_else(|| Err(SyncError::transport_retryable("no response set")))
        }
    }

    impl HttpClient for TestClient {
        fn post(&self, url: &str, _body: Vec<u8>) -> SyncResult<HttpResponse> {
            self.next(url)
        }

        fn get(&self, url: &str) -> SyncResult<HttpResponse> {
            self.next(url)
        }
    }

    fn exchange_request() -> AckExchangeRequest {
        AckExchangeRequest {
            facility_id: FacilityId::new(),
            agent_version: BusinessVersion::new(1, 0, 0),
            acks: vec![],
        }
    }

    #[test]
    fn posts_to_endpoint_path() {
        let client = HttpWebClient::new("https://central.example.org/", TestClient::default());
        client.client.respond(Ok(HttpResponse::ok(
            AckExchangeResponse { acks: vec![] }.encode().unwrap(),
        )));

        client.exchange_acks(&exchange_request()).unwrap();
        assert_eq!(
            client.client.urls.lock().as_slice(),
            ["https://central.example.org/acks/exchange"]
        );
        assert!(client.last_error().is_none());
    }

    #[test]
    fn server_error_body_is_mapped() {
        let client = HttpWebClient::new("http://c", TestClient::default());
        client.client.respond(Ok(HttpResponse {
            status: 503,
            body: ErrorResponse::new(503, "Unavailable", "maintenance")
                .encode()
                .unwrap(),
        }));

        let err = client.exchange_acks(&exchange_request()).unwrap_err();
        assert!(matches!(
            &err,
            SyncError::Server { status: 503, kind, .. } if kind == "Unavailable"
        ));
        assert!(err.is_retryable());
        assert!(client.last_error().is_some());
    }

    #[test]
    fn plain_text_error_body() {
        let client = HttpWebClient::new("http://c", TestClient::default());
        client.client.respond(Ok(HttpResponse {
            status: 400,
            body: b"bad request".to_vec(),
        }));

        let err = client.exchange_acks(&exchange_request()).unwrap_err();
        assert!(matches!(err, SyncError::Server { status: 400, ref message, .. } if message == "bad request"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn transport_failure_propagates() {
        let client = HttpWebClient::new("http://c", TestClient::default());
        let err = client.exchange_acks(&exchange_request()).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn relative_snapshot_urls_use_base() {
        let client = HttpWebClient::new("http://c", TestClient::default());
        client.client.respond(Ok(HttpResponse::ok(vec![1, 2])));

        assert_eq!(
            client.download_snapshot("/masterData/snapshots/v1").unwrap(),
            vec![1, 2]
        );
        assert_eq!(
            client.client.urls.lock().as_slice(),
            ["http://c/masterData/snapshots/v1"]
        );
    }

    #[test]
    fn loopback_path_extraction() {
        assert_eq!(path_of("http://host:8080/events"), "/events");
        assert_eq!(path_of("https://host"), "/");
        assert_eq!(path_of("/ack"), "/ack");
    }
}
