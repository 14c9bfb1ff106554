//! The HTTP fetch pipeline: a retrying, streaming, checksum-validated
//! client with bounded concurrency and user-actionable errors.
//!
//! All policy lives here; the wire itself is abstracted behind
//! [`Transport`] so tests can inject a stub.

use std::collections::HashSet;
use std::env;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use data_encoding::BASE64;
use rand::Rng;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};
use url::Url;

use crate::core::checksum::Crc32c;
use crate::core::errors::{
    FetchError, FetchErrorKind, FetchErrorWithResponse, VersionMismatchError,
};
use crate::{CI_ENV, PUB_ENVIRONMENT_ENV, PUB_MAX_HTTP_RETRIES_ENV};

mod transport;

pub use transport::{ByteStream, ReqwestTransport, Transport, TransportRequest, TransportResponse};

#[cfg(test)]
pub(crate) use transport::testing;

pub const PUB_API_ACCEPT: &str = "application/vnd.pub.v2+json";

const DEFAULT_MAX_RETRIES: usize = 8;
const FETCH_GATE_PERMITS: usize = 16;
const HEADERS_TIMEOUT: Duration = Duration::from_secs(30);
const STALL_TICK: Duration = Duration::from_secs(60);
const STALL_LIMIT: Duration = Duration::from_secs(3 * 60 * 60);
const RETRY_AFTER_LIMIT: Duration = Duration::from_secs(30);

tokio::task_local! {
    static DEPENDENCY_TYPE: String;
}

/// Runs `future` with the ambient dependency-type tag set; the metadata
/// header builder picks it up for requests to the hosted origin.
pub async fn with_dependency_type<F: Future>(kind: &str, future: F) -> F::Output {
    DEPENDENCY_TYPE.scope(kind.to_string(), future).await
}

fn dependency_type() -> Option<String> {
    DEPENDENCY_TYPE.try_with(|value| value.clone()).ok()
}

/// Static configuration of the fetch pipeline. Environment-driven defaults
/// come from [`HttpConfig::from_env`]; tests construct values directly.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub max_retries: usize,
    /// The default hosted origin; metadata headers are only attached to
    /// requests going there.
    pub hosted_url: Url,
    /// Metadata headers are suppressed on CI machines.
    pub is_ci: bool,
    pub environment: Option<String>,
    pub session_id: String,
    pub command: Option<String>,
}

impl HttpConfig {
    pub fn from_env(hosted_url: Url) -> Self {
        let max_retries = env::var(PUB_MAX_HTTP_RETRIES_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let is_ci = env::var(CI_ENV)
            .is_ok_and(|value| !value.is_empty() && value != "0" && value != "false");
        let environment = env::var(PUB_ENVIRONMENT_ENV).ok();
        let session_id = {
            let mut rng = rand::thread_rng();
            (0..32)
                .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap())
                .collect()
        };
        Self {
            max_retries,
            hosted_url,
            is_ci,
            environment,
            session_id,
            command: None,
        }
    }
}

/// A handle that aborts in-flight fetch attempts, wired to SIGINT by the
/// caller. Cancellation is observed at attempt boundaries and between body
/// chunks.
#[derive(Clone, Debug, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

type BodyProducer = Box<dyn Fn() -> Vec<u8> + Send + Sync>;
type DecodeErrorHook = Box<dyn Fn(StatusCode, &[u8]) -> anyhow::Error + Send + Sync>;

/// One logical fetch. The `body` producer is invoked afresh for every
/// attempt, so uploads stay idempotent across retries.
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<BodyProducer>,
    pub max_bytes: Option<u64>,
    pub follow_redirects: bool,
    pub decode_error: Option<DecodeErrorHook>,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
            max_bytes: None,
            follow_redirects: true,
            decode_error: None,
        }
    }

    /// Asks for the versioned pub API media type; servers answer 406 when
    /// they no longer speak our version.
    pub fn pub_api(mut self) -> Self {
        self.headers
            .insert(ACCEPT, HeaderValue::from_static(PUB_API_ACCEPT));
        self
    }

    pub fn max_bytes(mut self, limit: u64) -> Self {
        self.max_bytes = Some(limit);
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    pub fn body_producer(mut self, producer: impl Fn() -> Vec<u8> + Send + Sync + 'static) -> Self {
        self.body = Some(Box::new(producer));
        self
    }

    pub fn decode_error(
        mut self,
        hook: impl Fn(StatusCode, &[u8]) -> anyhow::Error + Send + Sync + 'static,
    ) -> Self {
        self.decode_error = Some(Box::new(hook));
        self
    }

    fn wants_pub_api(&self) -> bool {
        self.headers
            .get(ACCEPT)
            .is_some_and(|value| value.as_bytes() == PUB_API_ACCEPT.as_bytes())
    }
}

pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

type TokenLookup = Box<dyn Fn(&Url) -> Option<String> + Send + Sync>;

/// The retrying fetch client. One instance is shared per process; all
/// requests are serialized through its 16-permit gate.
pub struct HttpClient {
    config: HttpConfig,
    transport: Box<dyn Transport>,
    gate: Semaphore,
    hosts_warned: Mutex<HashSet<String>>,
    cancellation: CancellationHandle,
    token_lookup: TokenLookup,
}

impl HttpClient {
    pub fn new(config: HttpConfig, transport: impl Transport + 'static) -> Self {
        Self {
            config,
            transport: Box::new(transport),
            gate: Semaphore::new(FETCH_GATE_PERMITS),
            hosts_warned: Mutex::new(HashSet::new()),
            cancellation: CancellationHandle::default(),
            token_lookup: Box::new(|_| None),
        }
    }

    pub fn with_token_lookup(
        mut self,
        lookup: impl Fn(&Url) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.token_lookup = Box::new(lookup);
        self
    }

    pub fn cancellation(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Performs a fetch, retrying transient failures.
    ///
    /// `decode` consumes the validated body stream and must read it to the
    /// end; it runs once per attempt, and the result of a later attempt
    /// replaces any partial work of an earlier one.
    pub async fn fetch<T, F, Fut>(&self, request: FetchRequest, mut decode: F) -> Result<T>
    where
        F: FnMut(ResponseHead, Body) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: usize = 0;
        loop {
            let result = {
                let _permit = self.gate.acquire().await.expect("fetch gate never closes");
                self.attempt(&request, &mut decode).await
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let (retryable, retry_after) = match err.downcast_ref::<FetchError>() {
                Some(fetch_err) => (fetch_err.retryable, fetch_err.retry_after),
                None => (false, None),
            };
            if !retryable || attempt >= self.config.max_retries {
                return Err(err);
            }
            if self.cancellation.is_cancelled() {
                return Err(FetchError::new(request.url.clone(), FetchErrorKind::Cancelled).into());
            }

            if attempt == 3 {
                self.warn_host_down(&request.url);
            }

            let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));
            debug!(
                url = %request.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying failed fetch: {err}",
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Fetches a JSON document. An unparsable body counts as a transient
    /// failure and is retried.
    pub async fn get_json<T: DeserializeOwned>(&self, request: FetchRequest) -> Result<T> {
        let url = request.url.clone();
        self.fetch(request, move |_head, mut body| {
            let url = url.clone();
            async move {
                let bytes = body.bytes().await?;
                serde_json::from_slice(&bytes).map_err(|err| {
                    FetchError::new(url, FetchErrorKind::InvalidBody)
                        .with_cause(err.into())
                        .into()
                })
            }
        })
        .await
    }

    async fn attempt<T, F, Fut>(&self, request: &FetchRequest, decode: &mut F) -> Result<T>
    where
        F: FnMut(ResponseHead, Body) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let url = request.url.clone();
        if self.cancellation.is_cancelled() {
            return Err(FetchError::new(url, FetchErrorKind::Cancelled).into());
        }

        let transport_request = TransportRequest {
            method: request.method.clone(),
            url: url.clone(),
            headers: self.build_headers(request),
            body: request.body.as_ref().map(|producer| producer()),
            follow_redirects: request.follow_redirects,
        };

        let response = match timeout(HEADERS_TIMEOUT, self.transport.execute(transport_request))
            .await
        {
            Err(_) => return Err(FetchError::new(url, FetchErrorKind::Timeout).into()),
            Ok(Err(err)) => {
                return Err(FetchError::new(url, FetchErrorKind::Connection)
                    .with_cause(err)
                    .into());
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status;
        let headers = response.headers.clone();

        if status.is_success() {
            let content_length = response.content_length();
            if let (Some(max), Some(length)) = (request.max_bytes, content_length) {
                if length > max {
                    return Err(FetchError::new(url, FetchErrorKind::TooLarge).into());
                }
            }
            let body = Body::new(
                url,
                response.body,
                parse_crc32c(&headers),
                request.max_bytes,
                content_length,
                self.cancellation.clone(),
            );
            let head = ResponseHead { status, headers };
            return decode(head, body).await;
        }

        // Error responses are small; read them whole for diagnostics.
        let raw = read_raw_body(response.body).await;

        if status == StatusCode::NOT_ACCEPTABLE && request.wants_pub_api() {
            return Err(VersionMismatchError { url }.into());
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return match parse_retry_after(&headers) {
                Some(delay) if delay > RETRY_AFTER_LIMIT => Err(FetchErrorWithResponse {
                    url,
                    status: status.as_u16(),
                    message: extract_error_message(&raw),
                }
                .into()),
                Some(delay) => Err(FetchError::new(url, FetchErrorKind::Status(429))
                    .with_retry_after(delay)
                    .into()),
                None => Err(FetchError::new(url, FetchErrorKind::Status(429)).into()),
            };
        }

        if status.is_client_error() {
            if let Some(hook) = &request.decode_error {
                return Err(hook(status, &raw));
            }
            return Err(FetchErrorWithResponse {
                url,
                status: status.as_u16(),
                message: extract_error_message(&raw),
            }
            .into());
        }

        Err(FetchError::new(url, FetchErrorKind::Status(status.as_u16())).into())
    }

    fn build_headers(&self, request: &FetchRequest) -> HeaderMap {
        let mut headers = request.headers.clone();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("quay/{}", env!("CARGO_PKG_VERSION")))
                .expect("user agent is a valid header value"),
        );

        if let Some(token) = (self.token_lookup)(&request.url) {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        let to_hosted = request.url.origin() == self.config.hosted_url.origin();
        if to_hosted && !self.config.is_ci {
            let mut insert = |name: &'static str, value: &str| {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.insert(name, value);
                }
            };
            insert("x-pub-os", env::consts::OS);
            insert("x-pub-session-id", &self.config.session_id);
            if let Some(command) = &self.config.command {
                insert("x-pub-command", command);
            }
            if let Some(kind) = dependency_type() {
                insert("x-pub-reason", &kind);
            }
            if let Some(environment) = &self.config.environment {
                insert("x-pub-environment", environment);
            }
        }

        headers
    }

    fn warn_host_down(&self, url: &Url) {
        let Some(host) = url.host_str() else { return };
        let mut warned = self.hosts_warned.lock().unwrap();
        if warned.insert(host.to_string()) {
            warn!(
                "the server at {host} does not seem to respond; \
                 it may be down, or your network may be misconfigured"
            );
        }
    }
}

/// The validated response body stream handed to decoders. Checksum, size
/// cap, stall detection and cancellation all surface here as errors.
pub struct Body {
    url: Url,
    stream: ByteStream,
    crc: Option<(Crc32c, u32)>,
    max_bytes: Option<u64>,
    content_length: Option<u64>,
    received: u64,
    tick_started: Instant,
    bytes_since_tick: u64,
    stalled: bool,
    finished: bool,
    cancellation: CancellationHandle,
}

impl Body {
    fn new(
        url: Url,
        stream: ByteStream,
        crc32c: Option<u32>,
        max_bytes: Option<u64>,
        content_length: Option<u64>,
        cancellation: CancellationHandle,
    ) -> Self {
        Self {
            url,
            stream,
            crc: crc32c.map(|expected| (Crc32c::new(), expected)),
            max_bytes,
            content_length,
            received: 0,
            tick_started: Instant::now(),
            bytes_since_tick: 0,
            stalled: false,
            finished: false,
            cancellation,
        }
    }

    fn error(&self, kind: FetchErrorKind) -> anyhow::Error {
        FetchError::new(self.url.clone(), kind).into()
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        use futures::StreamExt;

        if self.finished {
            return Ok(None);
        }
        if self.cancellation.is_cancelled() {
            return Err(self.error(FetchErrorKind::Cancelled));
        }
        if self.stalled {
            return Err(self.error(FetchErrorKind::Stall));
        }

        match self.stream.next().await {
            None => {
                self.finished = true;
                if let Some((crc, expected)) = &self.crc {
                    if crc.finish() != *expected {
                        return Err(self.error(FetchErrorKind::ChecksumMismatch));
                    }
                }
                Ok(None)
            }
            Some(Err(err)) => Err(FetchError::new(self.url.clone(), FetchErrorKind::Connection)
                .with_cause(err.into())
                .into()),
            Some(Ok(chunk)) => {
                self.received += chunk.len() as u64;
                if let Some(max) = self.max_bytes {
                    if self.received > max {
                        return Err(self.error(FetchErrorKind::TooLarge));
                    }
                }
                if let Some((crc, _)) = &mut self.crc {
                    crc.update(&chunk);
                }

                self.bytes_since_tick += chunk.len() as u64;
                let elapsed = self.tick_started.elapsed();
                if elapsed >= STALL_TICK {
                    if let Some(total) = self.content_length {
                        let remaining = total.saturating_sub(self.received) as f64;
                        let rate = self.bytes_since_tick as f64 / elapsed.as_secs_f64();
                        let projected = if rate > 0.0 {
                            remaining / rate
                        } else {
                            f64::INFINITY
                        };
                        // The stall is reported at the next yielded chunk.
                        if projected > STALL_LIMIT.as_secs_f64() {
                            self.stalled = true;
                        }
                    }
                    self.tick_started = Instant::now();
                    self.bytes_since_tick = 0;
                }

                Ok(Some(chunk))
            }
        }
    }

    /// Drains the stream, returning the whole body.
    pub async fn bytes(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

fn backoff_delay(attempt: usize) -> Duration {
    if attempt < 3 {
        let base = 500.0 * 1.5f64.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0..500);
        Duration::from_millis(base as u64 + jitter)
    } else {
        Duration::from_secs(30)
    }
}

fn parse_crc32c(headers: &HeaderMap) -> Option<u32> {
    for value in headers.get_all("x-goog-hash") {
        let Ok(text) = value.to_str() else { continue };
        for part in text.split(',') {
            if let Some(encoded) = part.trim().strip_prefix("crc32c=") {
                let Ok(bytes) = BASE64.decode(encoded.as_bytes()) else {
                    continue;
                };
                if let Ok(bytes) = <[u8; 4]>::try_from(bytes.as_slice()) {
                    return Some(u32::from_be_bytes(bytes));
                }
            }
        }
    }
    None
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

fn extract_error_message(raw: &[u8]) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: ErrorDetails,
    }
    #[derive(serde::Deserialize)]
    struct ErrorDetails {
        message: String,
    }
    serde_json::from_slice::<ErrorBody>(raw)
        .ok()
        .map(|body| body.error.message)
}

async fn read_raw_body(stream: ByteStream) -> Vec<u8> {
    use futures::StreamExt;
    let mut stream = stream;
    let mut out = Vec::new();
    while let Some(Ok(chunk)) = stream.next().await {
        out.extend_from_slice(&chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use url::Url;

    use super::transport::testing::{StubResponse, StubTransport};
    use super::*;
    use crate::core::errors::{FetchError, FetchErrorKind, FetchErrorWithResponse};

    fn test_config() -> HttpConfig {
        HttpConfig {
            max_retries: DEFAULT_MAX_RETRIES,
            hosted_url: Url::parse("https://pub.dev").unwrap(),
            is_ci: false,
            environment: None,
            session_id: "0123456789abcdef0123456789abcdef".into(),
            command: Some("get".into()),
        }
    }

    fn client(responses: Vec<StubResponse>) -> HttpClient {
        HttpClient::new(test_config(), StubTransport::new(responses))
    }

    fn url() -> Url {
        Url::parse("https://pub.dev/api/packages/foo").unwrap()
    }

    async fn fetch_text(client: &HttpClient, request: FetchRequest) -> Result<String> {
        client
            .fetch(request, |_head, mut body| async move {
                let bytes = body.bytes().await?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            })
            .await
    }

    fn crc32c_header_for(payload: &[u8]) -> String {
        let crc = crate::core::checksum::Crc32c::new().update(payload).finish();
        format!("crc32c={}", BASE64.encode(&crc.to_be_bytes()))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_5xx_with_backoff_curve() {
        let client = client(vec![
            StubResponse::with_status(StatusCode::SERVICE_UNAVAILABLE, b""),
            StubResponse::with_status(StatusCode::SERVICE_UNAVAILABLE, b""),
            StubResponse::ok(b"hello"),
        ]);

        let started = Instant::now();
        let body = fetch_text(&client, FetchRequest::get(url())).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(body, "hello");
        // Two retries: 500ms + 750ms base, each with up to 500ms jitter.
        assert!(elapsed >= Duration::from_millis(1250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2250), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_count_is_bounded() {
        let responses = (0..4)
            .map(|_| StubResponse::with_status(StatusCode::SERVICE_UNAVAILABLE, b""))
            .collect();
        let mut config = test_config();
        config.max_retries = 3;
        let transport = StubTransport::new(responses);
        let client = HttpClient::new(config, transport);

        let err = fetch_text(&client, FetchRequest::get(url()))
            .await
            .unwrap_err();
        let fetch_err = err.downcast_ref::<FetchError>().unwrap();
        assert_eq!(fetch_err.kind, FetchErrorKind::Status(503));
    }

    #[tokio::test(start_paused = true)]
    async fn checksum_mismatch_is_retried_once_fixed() {
        let payload = b"archive bytes";
        let client = client(vec![
            StubResponse::ok(payload).header("x-goog-hash", "crc32c=AAAAAA=="),
            StubResponse::ok(payload).header("x-goog-hash", &crc32c_header_for(payload)),
        ]);

        let body = fetch_text(&client, FetchRequest::get(url())).await.unwrap();
        assert_eq!(body.as_bytes(), payload);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_errors_are_retried() {
        let client = client(vec![
            StubResponse::connection_error(),
            StubResponse::ok(b"ok"),
        ]);
        let body = fetch_text(&client, FetchRequest::get(url())).await.unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn short_retry_after_is_honored() {
        let client = client(vec![
            StubResponse::with_status(StatusCode::TOO_MANY_REQUESTS, b"")
                .header("retry-after", "5"),
            StubResponse::ok(b"ok"),
        ]);

        let started = Instant::now();
        let body = fetch_text(&client, FetchRequest::get(url())).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(body, "ok");
        assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_fails_without_retrying() {
        let client = client(vec![
            StubResponse::with_status(StatusCode::TOO_MANY_REQUESTS, b"")
                .header("retry-after", "600"),
        ]);
        let err = fetch_text(&client, FetchRequest::get(url()))
            .await
            .unwrap_err();
        let with_response = err.downcast_ref::<FetchErrorWithResponse>().unwrap();
        assert_eq!(with_response.status, 429);
    }

    #[tokio::test(start_paused = true)]
    async fn pub_api_406_is_a_version_mismatch() {
        let client = client(vec![StubResponse::with_status(
            StatusCode::NOT_ACCEPTABLE,
            b"",
        )]);
        let err = fetch_text(&client, FetchRequest::get(url()).pub_api())
            .await
            .unwrap_err();
        assert!(err.is::<VersionMismatchError>());
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_surfaces_decoded_message() {
        let client = client(vec![StubResponse::with_status(
            StatusCode::FORBIDDEN,
            br#"{"error": {"message": "package foo is retracted"}}"#,
        )]);
        let err = fetch_text(&client, FetchRequest::get(url()))
            .await
            .unwrap_err();
        let with_response = err.downcast_ref::<FetchErrorWithResponse>().unwrap();
        assert_eq!(with_response.status, 403);
        assert_eq!(
            with_response.message.as_deref(),
            Some("package foo is retracted")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_json_body_is_retried() {
        let client = client(vec![
            StubResponse::ok(b"{ not json"),
            StubResponse::ok(br#"{"answer": 42}"#),
        ]);

        #[derive(serde::Deserialize)]
        struct Answer {
            answer: u32,
        }
        let answer: Answer = client.get_json(FetchRequest::get(url())).await.unwrap();
        assert_eq!(answer.answer, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn declared_content_length_over_limit_fails_without_streaming() {
        let client = client(vec![
            StubResponse::ok(b"0123456789").header("content-length", "10"),
        ]);
        let err = fetch_text(&client, FetchRequest::get(url()).max_bytes(5))
            .await
            .unwrap_err();
        let fetch_err = err.downcast_ref::<FetchError>().unwrap();
        assert_eq!(fetch_err.kind, FetchErrorKind::TooLarge);
        assert!(!fetch_err.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transfer_fails_at_next_chunk() {
        let mut response = StubResponse::ok(b"").header("content-length", "10000000000");
        response.chunks = vec![
            (Duration::ZERO, vec![0u8; 16]),
            (Duration::from_secs(61), vec![0u8; 16]),
            (Duration::ZERO, vec![0u8; 16]),
        ];
        let mut config = test_config();
        config.max_retries = 0;
        let client = HttpClient::new(config, StubTransport::new(vec![response]));

        let err = fetch_text(&client, FetchRequest::get(url()))
            .await
            .unwrap_err();
        let fetch_err = err.downcast_ref::<FetchError>().unwrap();
        assert_eq!(fetch_err.kind, FetchErrorKind::Stall);
        assert!(fetch_err.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_before_retrying() {
        let client = client(vec![StubResponse::ok(b"never read")]);
        client.cancellation().cancel();
        let err = fetch_text(&client, FetchRequest::get(url()))
            .await
            .unwrap_err();
        let fetch_err = err.downcast_ref::<FetchError>().unwrap();
        assert_eq!(fetch_err.kind, FetchErrorKind::Cancelled);
    }

    /// A [`Transport`] wrapper that lets tests keep a handle to the stub
    /// after the client takes ownership.
    struct Shared(std::sync::Arc<StubTransport>);

    #[async_trait::async_trait(?Send)]
    impl Transport for Shared {
        async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
            self.0.execute(request).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_headers_reach_the_hosted_origin() {
        let recorded = std::sync::Arc::new(StubTransport::new(vec![StubResponse::ok(b"ok")]));
        let client = HttpClient::new(test_config(), Shared(recorded.clone()));

        with_dependency_type("direct", async {
            fetch_text(&client, FetchRequest::get(url())).await.unwrap();
        })
        .await;

        let requests = recorded.requests.lock().unwrap();
        let (_, _, headers) = &requests[0];
        assert_eq!(headers.get("x-pub-os").unwrap(), std::env::consts::OS);
        assert_eq!(
            headers.get("x-pub-session-id").unwrap(),
            "0123456789abcdef0123456789abcdef"
        );
        assert_eq!(headers.get("x-pub-command").unwrap(), "get");
        assert_eq!(headers.get("x-pub-reason").unwrap(), "direct");
        assert!(headers.get(USER_AGENT).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_headers_are_suppressed_under_ci() {
        let recorded = std::sync::Arc::new(StubTransport::new(vec![StubResponse::ok(b"ok")]));
        let mut config = test_config();
        config.is_ci = true;
        let client = HttpClient::new(config, Shared(recorded.clone()));
        fetch_text(&client, FetchRequest::get(url())).await.unwrap();

        let requests = recorded.requests.lock().unwrap();
        let (_, _, headers) = &requests[0];
        assert!(headers.get("x-pub-session-id").is_none());
        assert!(headers.get(USER_AGENT).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_headers_are_suppressed_for_foreign_origins() {
        let recorded = std::sync::Arc::new(StubTransport::new(vec![StubResponse::ok(b"ok")]));
        let client = HttpClient::new(test_config(), Shared(recorded.clone()));

        let foreign = Url::parse("https://mirror.example.com/api/packages/foo").unwrap();
        fetch_text(&client, FetchRequest::get(foreign)).await.unwrap();

        let requests = recorded.requests.lock().unwrap();
        let (_, _, headers) = &requests[0];
        assert!(headers.get("x-pub-session-id").is_none());
        assert!(headers.get("x-pub-os").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bearer_token_is_attached_when_the_store_knows_the_origin() {
        let recorded = std::sync::Arc::new(StubTransport::new(vec![StubResponse::ok(b"ok")]));
        let client = HttpClient::new(test_config(), Shared(recorded.clone()))
            .with_token_lookup(|url| {
                (url.host_str() == Some("pub.dev")).then(|| "s3cret".to_string())
            });

        fetch_text(&client, FetchRequest::get(url())).await.unwrap();

        let requests = recorded.requests.lock().unwrap();
        let (_, _, headers) = &requests[0];
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer s3cret");
    }
}
