use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arachne_core::retry::RetryPolicy;
use futures::future::BoxFuture;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{HttpRequest, HttpResult, Interceptor, Next, interceptor_error};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

/// Redirects requests for mapped hosts, keeping the original `Host` header.
///
/// Keys are exact host names or `*.suffix` wildcards; values are `host` or
/// `host:port`.
#[derive(Debug, Clone, Default)]
pub struct HostsInterceptor {
    hosts: HashMap<String, String>,
}

impl HostsInterceptor {
    pub fn new(hosts: HashMap<String, String>) -> Self {
        Self { hosts }
    }

    fn target_for(&self, host: &str) -> Option<&str> {
        if let Some(target) = self.hosts.get(host) {
            return Some(target);
        }
        self.hosts.iter().find_map(|(pattern, target)| {
            let suffix = pattern.strip_prefix("*.")?;
            host.strip_suffix(suffix)
                .is_some_and(|prefix| prefix.ends_with('.'))
                .then_some(target.as_str())
        })
    }

    fn rewrite(&self, request: &mut HttpRequest) -> Result<(), String> {
        let Some(host) = request.host().map(str::to_string) else {
            return Ok(());
        };
        let Some(target) = self.target_for(&host) else {
            return Ok(());
        };

        let original = match request.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let (new_host, new_port) = match target.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in hosts entry '{target}'"))?;
                (h, Some(port))
            }
            None => (target, None),
        };

        request
            .url
            .set_host(Some(new_host))
            .map_err(|e| format!("cannot redirect {host} to '{target}': {e}"))?;
        if let Some(port) = new_port {
            request
                .url
                .set_port(Some(port))
                .map_err(|_| format!("cannot set port {port} on {}", request.url))?;
        }
        request.set_header_if_absent("host", original);
        tracing::debug!(from = %host, to = %target, "Host redirected");
        Ok(())
    }
}

impl Interceptor for HostsInterceptor {
    fn name(&self) -> &'static str {
        "hosts"
    }

    fn intercept<'a>(&'a self, mut request: HttpRequest, next: Next<'a>) -> BoxFuture<'a, HttpResult> {
        Box::pin(async move {
            self.rewrite(&mut request)
                .map_err(|message| interceptor_error(self.name(), message))?;
            next.run(request).await
        })
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Adds default headers plus per-host extras. Never overrides a header the
/// request already carries.
#[derive(Debug, Clone)]
pub struct HeaderInterceptor {
    defaults: BTreeMap<String, String>,
    per_host: HashMap<String, BTreeMap<String, String>>,
}

impl Default for HeaderInterceptor {
    fn default() -> Self {
        let defaults = [
            ("user-agent", DEFAULT_USER_AGENT),
            ("accept", "*/*"),
            ("accept-language", "zh-CN,zh;q=0.9,en;q=0.8"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            defaults,
            per_host: HashMap::new(),
        }
    }
}

impl HeaderInterceptor {
    pub fn with_default(mut self, name: &str, value: impl Into<String>) -> Self {
        self.defaults.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_host_headers(mut self, host: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        self.per_host.insert(host.into(), headers);
        self
    }
}

impl Interceptor for HeaderInterceptor {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn intercept<'a>(&'a self, mut request: HttpRequest, next: Next<'a>) -> BoxFuture<'a, HttpResult> {
        Box::pin(async move {
            if let Some(extra) = request.host().and_then(|h| self.per_host.get(h)) {
                for (name, value) in extra {
                    request.set_header_if_absent(name, value.clone());
                }
            }
            for (name, value) in &self.defaults {
                request.set_header_if_absent(name, value.clone());
            }
            next.run(request).await
        })
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    Bearer { token: String },
    Header { name: String, value: String },
}

/// Attaches per-host credentials.
#[derive(Debug, Clone, Default)]
pub struct AuthInterceptor {
    credentials: HashMap<String, Credential>,
}

impl AuthInterceptor {
    pub fn new(credentials: HashMap<String, Credential>) -> Self {
        Self { credentials }
    }

    fn apply(&self, request: &mut HttpRequest) -> Result<(), String> {
        let Some(credential) = request.host().and_then(|h| self.credentials.get(h)) else {
            return Ok(());
        };
        let (name, value) = match credential {
            Credential::Bearer { token } => ("authorization".to_string(), format!("Bearer {token}")),
            Credential::Header { name, value } => (name.clone(), value.clone()),
        };
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("invalid credential header name '{name}'"))?;
        HeaderValue::from_str(&value)
            .map_err(|_| format!("invalid credential value for header '{name}'"))?;
        request.set_header_if_absent(&name, value);
        Ok(())
    }
}

impl Interceptor for AuthInterceptor {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn intercept<'a>(&'a self, mut request: HttpRequest, next: Next<'a>) -> BoxFuture<'a, HttpResult> {
        Box::pin(async move {
            self.apply(&mut request)
                .map_err(|message| interceptor_error(self.name(), message))?;
            next.run(request).await
        })
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Snapshot of network counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub requests: u64,
    pub responses: u64,
    pub failures: u64,
    /// Responses with a status of 400 or above.
    pub http_errors: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    responses: AtomicU64,
    failures: AtomicU64,
    http_errors: AtomicU64,
    bytes_received: AtomicU64,
}

/// Counts logical requests. Sits before retry, so a retried request
/// counts once.
#[derive(Debug, Clone, Default)]
pub struct StatsInterceptor {
    counters: Arc<Counters>,
}

impl StatsInterceptor {
    pub fn snapshot(&self) -> NetworkStats {
        let c = &self.counters;
        NetworkStats {
            requests: c.requests.load(Ordering::Relaxed),
            responses: c.responses.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            http_errors: c.http_errors.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl Interceptor for StatsInterceptor {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn intercept<'a>(&'a self, request: HttpRequest, next: Next<'a>) -> BoxFuture<'a, HttpResult> {
        Box::pin(async move {
            let c = &self.counters;
            c.requests.fetch_add(1, Ordering::Relaxed);
            let outcome = next.run(request).await;
            match &outcome {
                Ok(response) => {
                    c.responses.fetch_add(1, Ordering::Relaxed);
                    c.bytes_received
                        .fetch_add(response.body.len() as u64, Ordering::Relaxed);
                    if response.status >= 400 {
                        c.http_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(_) => {
                    c.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            outcome
        })
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Retries transient failures with linear backoff: connection errors,
/// timeouts, and HTTP 408, 429 and 5xx.
#[derive(Debug, Clone, Default)]
pub struct RetryInterceptor {
    policy: RetryPolicy,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl Interceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn intercept<'a>(&'a self, request: HttpRequest, next: Next<'a>) -> BoxFuture<'a, HttpResult> {
        Box::pin(async move {
            let mut attempt = 1;
            loop {
                let outcome = next.run(request.clone()).await;
                let transient = match &outcome {
                    Ok(response) => is_transient_status(response.status),
                    Err(e) => e.is_retryable(),
                };
                if !transient || attempt > self.policy.max_retries {
                    return outcome;
                }
                let delay = self.policy.delay_for_attempt(attempt);
                tracing::debug!(url = %request.url, attempt, delay_ms = delay.as_millis() as u64, "Retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use arachne_core::error::AppError;

    use super::*;
    use crate::http::{FixtureReply, FixtureTransport, Transport};

    async fn run(chain: Vec<Arc<dyn Interceptor>>, transport: &FixtureTransport, request: HttpRequest) -> HttpResult {
        let transport: &dyn Transport = transport;
        Next::new(&chain, transport).run(request).await
    }

    #[tokio::test]
    async fn test_hosts_rewrites_and_preserves_host_header() {
        let transport = FixtureTransport::new();
        transport.insert("http://10.0.0.5:8080/list", FixtureReply::ok("ok"));
        let hosts = HostsInterceptor::new(HashMap::from([(
            "*.cdn.example".to_string(),
            "10.0.0.5:8080".to_string(),
        )]));

        let response = run(
            vec![Arc::new(hosts)],
            &transport,
            HttpRequest::get("http://img.cdn.example/list").unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(response.status, 200);
        let sent = transport.requests();
        assert_eq!(sent[0].url.as_str(), "http://10.0.0.5:8080/list");
        assert_eq!(sent[0].header("Host"), Some("img.cdn.example"));
    }

    #[test]
    fn test_hosts_wildcard_needs_label_boundary() {
        let hosts = HostsInterceptor::new(HashMap::from([(
            "*.example.com".to_string(),
            "127.0.0.1".to_string(),
        )]));
        assert_eq!(hosts.target_for("a.example.com"), Some("127.0.0.1"));
        assert_eq!(hosts.target_for("badexample.com"), None);
    }

    #[tokio::test]
    async fn test_invalid_hosts_entry_aborts_chain() {
        let transport = FixtureTransport::new();
        let hosts = HostsInterceptor::new(HashMap::from([(
            "a.example".to_string(),
            "b.example:notaport".to_string(),
        )]));

        let err = run(
            vec![Arc::new(hosts)],
            &transport,
            HttpRequest::get("http://a.example/").unwrap(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InterceptorError { ref name, .. } if name == "hosts"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_headers_never_override_existing() {
        let transport = FixtureTransport::new();
        transport.insert("http://site.example/", FixtureReply::ok(""));
        let headers = HeaderInterceptor::default().with_host_headers(
            "site.example",
            BTreeMap::from([("referer".to_string(), "http://site.example/".to_string())]),
        );

        let request = HttpRequest::get("http://site.example/")
            .unwrap()
            .with_header("User-Agent", "custom/1.0");
        run(vec![Arc::new(headers)], &transport, request).await.unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.header("user-agent"), Some("custom/1.0"));
        assert_eq!(sent.header("accept"), Some("*/*"));
        assert_eq!(sent.header("referer"), Some("http://site.example/"));
    }

    #[tokio::test]
    async fn test_auth_applies_per_host() {
        let transport = FixtureTransport::new();
        transport.insert("http://api.example/x", FixtureReply::ok(""));
        transport.insert("http://other.example/x", FixtureReply::ok(""));
        let auth = AuthInterceptor::new(HashMap::from([(
            "api.example".to_string(),
            Credential::Bearer {
                token: "s3cret".into(),
            },
        )]));
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(auth)];

        run(chain.clone(), &transport, HttpRequest::get("http://api.example/x").unwrap())
            .await
            .unwrap();
        run(chain, &transport, HttpRequest::get("http://other.example/x").unwrap())
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].header("authorization"), Some("Bearer s3cret"));
        assert_eq!(sent[1].header("authorization"), None);
    }

    #[tokio::test]
    async fn test_invalid_credential_is_interceptor_error() {
        let transport = FixtureTransport::new();
        let auth = AuthInterceptor::new(HashMap::from([(
            "api.example".to_string(),
            Credential::Header {
                name: "bad header".into(),
                value: "v".into(),
            },
        )]));
        let err = run(vec![Arc::new(auth)], &transport, HttpRequest::get("http://api.example/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InterceptorError { ref name, .. } if name == "auth"));
    }

    #[tokio::test]
    async fn test_retry_transient_status_then_success() {
        let transport = FixtureTransport::new();
        transport.insert_sequence(
            "http://flaky.example/",
            vec![
                FixtureReply::status(503, "busy"),
                FixtureReply::ConnectError,
                FixtureReply::ok("finally"),
            ],
        );
        let stats = StatsInterceptor::default();
        let retry = RetryInterceptor::new(RetryPolicy::new(3, Duration::from_millis(5)));

        let response = run(
            vec![Arc::new(stats.clone()), Arc::new(retry)],
            &transport,
            HttpRequest::get("http://flaky.example/").unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(response.text(), "finally");
        assert_eq!(transport.requests().len(), 3);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.responses, 1);
        assert_eq!(snapshot.bytes_received, 7);
    }

    #[tokio::test]
    async fn test_retry_surfaces_permanent_errors_immediately() {
        let transport = FixtureTransport::new();
        transport.insert("http://gone.example/", FixtureReply::status(404, "missing"));
        let stats = StatsInterceptor::default();
        let retry = RetryInterceptor::new(RetryPolicy::new(3, Duration::from_millis(5)));

        let response = run(
            vec![Arc::new(stats.clone()), Arc::new(retry)],
            &transport,
            HttpRequest::get("http://gone.example/").unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(stats.snapshot().http_errors, 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let transport = FixtureTransport::new();
        transport.insert("http://down.example/", FixtureReply::ConnectError);
        let stats = StatsInterceptor::default();
        let retry = RetryInterceptor::new(RetryPolicy::new(2, Duration::from_millis(5)));

        let err = run(
            vec![Arc::new(stats.clone()), Arc::new(retry)],
            &transport,
            HttpRequest::get("http://down.example/").unwrap(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NetworkError(_)));
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(stats.snapshot().failures, 1);
    }
}
