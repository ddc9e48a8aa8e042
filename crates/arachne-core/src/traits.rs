use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{AppError, LoadError};
use crate::models::{ResolverCall, ResolverOutput};
use crate::plugin::{LinkedPackage, PackageManifest};

/// Fetches remote content on behalf of resolvers.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;

    fn fetch_bytes(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;

    /// Fetch with request headers. Headers given here win over any defaults
    /// the fetcher would otherwise apply.
    fn fetch_with_headers(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<String, AppError>> + Send {
        let _ = headers;
        self.fetch(url)
    }
}

/// Reads raw package bytes from an addressable URI.
pub trait PackageSource: Send + Sync + 'static {
    fn read(&self, uri: &str) -> impl Future<Output = Result<Vec<u8>, LoadError>> + Send;
}

/// Validates package bytes and links them into an executable program.
///
/// This is the seam for dynamic code loading: the registry never
/// interprets package contents itself.
pub trait PluginLinker: Send + Sync + 'static {
    type Program: Send + Sync + 'static;

    /// Read manifest metadata without linking.
    fn inspect(&self, bytes: &[u8]) -> Result<PackageManifest, LoadError>;

    fn validate_and_link(&self, bytes: &[u8]) -> Result<LinkedPackage<Self::Program>, LoadError>;
}

/// A reusable execution context able to run one resolver at a time.
pub trait Engine: Send + 'static {
    type Program: Send + Sync + 'static;

    /// Bind the engine to a resolver program and its configuration.
    fn init(
        &mut self,
        key: &str,
        program: Arc<Self::Program>,
        config: &serde_json::Value,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn execute(
        &mut self,
        call: ResolverCall,
    ) -> impl Future<Output = Result<ResolverOutput, AppError>> + Send;

    /// Clear per-call state. An error makes the pool destroy the engine.
    fn reset(&mut self) -> Result<(), AppError>;

    /// Drop the resolver binding and release everything the engine holds.
    fn shutdown(&mut self);
}

/// Creates engines for the pool. Creation is considered expensive.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: Engine;

    fn create(&self) -> Result<Self::Engine, AppError>;
}

/// Notified by the registry when a plugin is removed.
pub trait RegistryListener: Send + Sync {
    fn on_unloaded(&self, key: &str);
}
