//! The wire abstraction under the fetch pipeline. Production code talks to
//! the network through [`ReqwestTransport`]; tests inject an in-memory
//! stub.

use std::pin::Pin;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use once_cell::sync::OnceCell;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use url::Url;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Vec<u8>>> + Send>>;

pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub follow_redirects: bool,
}

pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(reqwest::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }
}

/// A single HTTP exchange. Implementations do not retry and do not inspect
/// payloads; policy lives in the fetch pipeline.
#[async_trait(?Send)]
pub trait Transport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// The production [`Transport`], backed by a shared [`reqwest::Client`].
#[derive(Default)]
pub struct ReqwestTransport {
    following: OnceCell<reqwest::Client>,
    not_following: OnceCell<reqwest::Client>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, follow_redirects: bool) -> Result<&reqwest::Client> {
        let (cell, policy) = if follow_redirects {
            (&self.following, reqwest::redirect::Policy::default())
        } else {
            (&self.not_following, reqwest::redirect::Policy::none())
        };
        cell.get_or_try_init(|| {
            reqwest::Client::builder()
                .redirect(policy)
                .build()
                .context("failed to initialize the HTTP client")
        })
    }
}

#[async_trait(?Send)]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
        let mut builder = self
            .client(request.follow_redirects)?
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await?;
        Ok(TransportResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: response
                .bytes_stream()
                .map_ok(|chunk| chunk.to_vec())
                .map_err(std::io::Error::other)
                .boxed(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory [`Transport`] scripted with one response per attempt.

    use std::sync::Mutex;
    use std::time::Duration;

    use futures::stream;

    use super::*;

    pub struct StubResponse {
        pub status: StatusCode,
        pub headers: HeaderMap,
        /// Body chunks, each optionally preceded by a delay. Delays rely on
        /// paused tokio time in tests.
        pub chunks: Vec<(Duration, Vec<u8>)>,
        /// Simulate a connection failure instead of producing a response.
        pub connection_error: bool,
    }

    impl StubResponse {
        pub fn ok(body: &[u8]) -> Self {
            Self::with_status(StatusCode::OK, body)
        }

        pub fn with_status(status: StatusCode, body: &[u8]) -> Self {
            Self {
                status,
                headers: HeaderMap::new(),
                chunks: vec![(Duration::ZERO, body.to_vec())],
                connection_error: false,
            }
        }

        pub fn connection_error() -> Self {
            Self {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                chunks: Vec::new(),
                connection_error: true,
            }
        }

        pub fn header(mut self, name: &'static str, value: &str) -> Self {
            self.headers.insert(name, value.parse().unwrap());
            self
        }
    }

    /// Replays a scripted list of responses and records every request it
    /// saw.
    #[derive(Default)]
    pub struct StubTransport {
        responses: Mutex<Vec<StubResponse>>,
        pub requests: Mutex<Vec<(Method, Url, HeaderMap)>>,
    }

    impl StubTransport {
        pub fn new(responses: Vec<StubResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait(?Send)]
    impl Transport for StubTransport {
        async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
            self.requests.lock().unwrap().push((
                request.method.clone(),
                request.url.clone(),
                request.headers.clone(),
            ));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(anyhow!("stub transport ran out of scripted responses"));
            }
            let response = responses.remove(0);
            drop(responses);

            if response.connection_error {
                return Err(anyhow!("connection refused"));
            }

            let body = stream::iter(response.chunks)
                .then(|(delay, chunk)| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(chunk)
                })
                .boxed();

            Ok(TransportResponse {
                status: response.status,
                headers: response.headers,
                body,
            })
        }
    }
}
