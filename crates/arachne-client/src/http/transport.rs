use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arachne_core::error::AppError;
use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::{HttpRequest, HttpResponse, HttpResult, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// `http://`, `https://` or `socks5://` proxy for every request.
    pub proxy: Option<String>,
    /// Accept invalid TLS certificates. Many content sites need it.
    pub accept_invalid_certs: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            proxy: None,
            accept_invalid_certs: false,
        }
    }
}

/// Transport backed by reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout_ms: u64,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, AppError> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_ms: u64::try_from(config.timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }

    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AppError::HttpError(format!("Invalid header name '{name}'")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| AppError::HttpError(format!("Invalid value for header '{name}'")))?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_ms)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_ms)
            } else {
                AppError::HttpError(format!("Failed to read response body: {e}"))
            }
        })?;

        Ok(HttpResponse {
            status,
            url,
            headers,
            body: body.to_vec(),
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, HttpResult> {
        Box::pin(self.execute(request))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A canned reply for [`FixtureTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureReply {
    Response { status: u16, body: Vec<u8> },
    ConnectError,
    Timeout,
}

impl FixtureReply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        FixtureReply::Response {
            status,
            body: body.into(),
        }
    }
}

#[derive(Default)]
struct FixtureState {
    routes: HashMap<String, VecDeque<FixtureReply>>,
    requests: Vec<HttpRequest>,
}

/// Offline transport serving canned replies by exact URL.
///
/// A route with several replies serves them in order and then keeps
/// repeating the last one. Unknown URLs get a 404.
#[derive(Clone, Default)]
pub struct FixtureTransport {
    state: Arc<Mutex<FixtureState>>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FixtureState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, url: &str, reply: FixtureReply) {
        self.insert_sequence(url, vec![reply]);
    }

    pub fn insert_sequence(&self, url: &str, replies: Vec<FixtureReply>) {
        self.lock()
            .routes
            .insert(url.to_string(), replies.into_iter().collect());
    }

    /// Every request that reached the transport, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }

    fn reply(&self, request: HttpRequest) -> HttpResult {
        let mut state = self.lock();
        let url = request.url.to_string();
        let reply = match state.routes.get_mut(&url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        state.requests.push(request);

        match reply {
            Some(FixtureReply::Response { status, body }) => Ok(HttpResponse {
                status,
                url,
                headers: BTreeMap::new(),
                body,
            }),
            Some(FixtureReply::ConnectError) => Err(AppError::NetworkError(format!(
                "Connection failed: {url}"
            ))),
            Some(FixtureReply::Timeout) => Err(AppError::Timeout(0)),
            None => Ok(HttpResponse {
                status: 404,
                url,
                headers: BTreeMap::new(),
                body: b"not found".to_vec(),
            }),
        }
    }
}

impl Transport for FixtureTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, HttpResult> {
        let outcome = self.reply(request);
        Box::pin(async move { outcome })
    }
}
