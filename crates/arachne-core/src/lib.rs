pub mod cache;
pub mod config;
pub mod error;
pub mod hub;
pub mod invoker;
pub mod models;
pub mod plugin;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod scan;
pub mod search;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use cache::{CacheConfig, CacheStats, TierPolicy, TieredCache};
pub use config::ArachneConfig;
pub use error::{AppError, LoadError, UpdateError};
pub use hub::{ProbeReport, ResolverHub};
pub use models::{
    Capability, Category, DetailRecord, Listing, PlayableSource, ResolverCall, ResolverOutput,
    VodItem, compute_bytes_hash, compute_hash,
};
pub use plugin::{ChecksumRef, PackageSpec, PluginDescriptor, PluginState, SafetyClassification};
pub use pool::{EnginePool, PoolConfig, PoolStatus};
pub use registry::{PluginRegistry, RegistryConfig};
pub use search::{
    SearchHandle, SearchOrchestrator, SearchProgress, SearchRequest, SearchResult, SearchSummary,
    SearchUpdate,
};
pub use traits::{Engine, EngineFactory, Fetcher, PackageSource, PluginLinker};
