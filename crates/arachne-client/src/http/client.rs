use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arachne_core::error::AppError;
use arachne_core::retry::RetryPolicy;
use arachne_core::traits::Fetcher;

use super::interceptors::{
    AuthInterceptor, Credential, HeaderInterceptor, HostsInterceptor, NetworkStats,
    RetryInterceptor, StatsInterceptor,
};
use super::transport::{ReqwestTransport, TransportConfig};
use super::{HttpRequest, HttpResponse, Interceptor, Next, Transport};

/// HTTP client running every request through the interceptor chain.
///
/// Cheap to clone; clones share the chain, the transport and the counters.
#[derive(Clone)]
pub struct HttpClient {
    chain: Arc<[Arc<dyn Interceptor>]>,
    transport: Arc<dyn Transport>,
    stats: StatsInterceptor,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// A client with default headers and retry over reqwest.
    pub fn new() -> Result<Self, AppError> {
        Self::builder().build()
    }

    /// Run a request through the chain. Non-2xx statuses are returned as
    /// responses, not errors.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, AppError> {
        Next::new(&self.chain, self.transport.as_ref())
            .run(request)
            .await
    }

    /// GET `url`, failing on a non-2xx status.
    pub async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, AppError> {
        let mut request = HttpRequest::get(url)?;
        for (name, value) in headers {
            request.set_header(name, value.clone());
        }
        let response = self.execute(request).await?;
        if !response.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                response.status, url
            )));
        }
        Ok(response)
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.snapshot()
    }

    /// Names of the interceptors, in execution order.
    pub fn chain_names(&self) -> Vec<&'static str> {
        self.chain.iter().map(|i| i.name()).collect()
    }
}

impl Fetcher for HttpClient {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.fetch_with_headers(url, &BTreeMap::new()).await
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, AppError> {
        Ok(self.get(url, &BTreeMap::new()).await?.body)
    }

    async fn fetch_with_headers(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<String, AppError> {
        Ok(self.get(url, headers).await?.text())
    }
}

/// Assembles an [`HttpClient`]. The interceptor order is fixed:
/// hosts, headers, auth, stats, retry.
#[derive(Default)]
pub struct HttpClientBuilder {
    hosts: HashMap<String, String>,
    headers: HeaderInterceptor,
    credentials: HashMap<String, Credential>,
    retry: Option<RetryPolicy>,
    transport_config: TransportConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl HttpClientBuilder {
    /// Redirect `from` (exact host or `*.suffix`) to `to` (`host[:port]`).
    pub fn host(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.hosts.insert(from.into(), to.into());
        self
    }

    pub fn hosts(mut self, hosts: HashMap<String, String>) -> Self {
        self.hosts.extend(hosts);
        self
    }

    pub fn default_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers = self.headers.with_default(name, value);
        self
    }

    pub fn host_headers(mut self, host: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        self.headers = self.headers.with_host_headers(host, headers);
        self
    }

    pub fn credential(mut self, host: impl Into<String>, credential: Credential) -> Self {
        self.credentials.insert(host.into(), credential);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Use a custom transport instead of reqwest.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn build(self) -> Result<HttpClient, AppError> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.transport_config)?),
        };
        let stats = StatsInterceptor::default();
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(HostsInterceptor::new(self.hosts)),
            Arc::new(self.headers),
            Arc::new(AuthInterceptor::new(self.credentials)),
            Arc::new(stats.clone()),
            Arc::new(RetryInterceptor::new(self.retry.unwrap_or_default())),
        ];

        Ok(HttpClient {
            chain: chain.into(),
            transport,
            stats,
        })
    }
}
