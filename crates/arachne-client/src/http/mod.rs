//! HTTP client with an explicit interceptor chain.
//!
//! Every request runs through the same fixed order:
//! hosts, headers, auth, stats, retry, then the transport. Each
//! [`Interceptor`] receives the request and a [`Next`] continuation and
//! decides whether (and how often) to call through.

mod client;
mod interceptors;
mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;

use arachne_core::error::AppError;
use futures::future::BoxFuture;
use reqwest::Method;
use url::Url;

pub use client::{HttpClient, HttpClientBuilder};
pub use interceptors::{
    AuthInterceptor, Credential, HeaderInterceptor, HostsInterceptor, NetworkStats,
    RetryInterceptor, StatsInterceptor,
};
pub use transport::{FixtureReply, FixtureTransport, ReqwestTransport, TransportConfig};

/// An outgoing request. Header names are stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: &str) -> Result<Self, AppError> {
        let url = Url::parse(url)
            .map_err(|e| AppError::HttpError(format!("Invalid URL '{url}': {e}")))?;
        Ok(Self {
            method,
            url,
            headers: BTreeMap::new(),
            body: None,
        })
    }

    pub fn get(url: &str) -> Result<Self, AppError> {
        Self::new(Method::GET, url)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Set a header only if the request does not carry it yet.
    pub fn set_header_if_absent(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| value.into());
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub type HttpResult = Result<HttpResponse, AppError>;

/// One link of the hook chain.
///
/// Implementations must call `next.run(..)` to reach the transport. An
/// error raised by the interceptor's own logic is reported as
/// [`AppError::InterceptorError`] and aborts the request.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept<'a>(&'a self, request: HttpRequest, next: Next<'a>) -> BoxFuture<'a, HttpResult>;
}

/// Sends a fully prepared request.
pub trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, HttpResult>;
}

/// The rest of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    transport: &'a dyn Transport,
}

impl<'a> Next<'a> {
    pub(crate) fn new(interceptors: &'a [Arc<dyn Interceptor>], transport: &'a dyn Transport) -> Self {
        Self {
            interceptors,
            transport,
        }
    }

    /// Pass the request to the next interceptor, or to the transport.
    pub fn run(self, request: HttpRequest) -> BoxFuture<'a, HttpResult> {
        match self.interceptors.split_first() {
            Some((first, rest)) => first.intercept(request, Next::new(rest, self.transport)),
            None => self.transport.send(request),
        }
    }
}

pub(crate) fn interceptor_error(name: &str, message: impl Into<String>) -> AppError {
    AppError::InterceptorError {
        name: name.to_string(),
        message: message.into(),
    }
}
