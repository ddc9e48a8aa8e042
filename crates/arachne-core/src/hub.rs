//! The resolver service: registry, pool, cache and search behind one
//! explicitly constructed instance.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStats, SweepReport, TierPolicy, TieredCache};
use crate::config::ArachneConfig;
use crate::error::{AppError, LoadError};
use crate::invoker::ResolverInvoker;
use crate::models::{
    Capability, DetailRecord, Listing, PlayableSource, ResolverCall, ResolverOutput, compute_hash,
};
use crate::plugin::{PackageSpec, PluginDescriptor, RegistryStatus, UpdateInfo};
use crate::pool::{EnginePool, PoolStatus};
use crate::registry::PluginRegistry;
use crate::retry::RetryPolicy;
use crate::search::{SearchHandle, SearchOrchestrator, SearchReporter, SearchRequest};
use crate::traits::{Engine, EngineFactory, PackageSource, PluginLinker};

/// Outcome of probing one capability of a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCheck {
    pub capability: Capability,
    pub success: bool,
    pub items: usize,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub key: String,
    pub checks: Vec<ProbeCheck>,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.success)
    }
}

pub struct ResolverHub<L, S, F>
where
    L: PluginLinker,
    S: PackageSource,
    F: EngineFactory,
{
    config: ArachneConfig,
    registry: Arc<PluginRegistry<L, S>>,
    pool: EnginePool<F>,
    cache: Arc<TieredCache>,
    invoker: ResolverInvoker<L, S, F>,
    search: SearchOrchestrator<L, S, F>,
    maintenance: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<L, S, F> ResolverHub<L, S, F>
where
    L: PluginLinker,
    S: PackageSource,
    F: EngineFactory,
    F::Engine: Engine<Program = L::Program>,
{
    /// Build every component and start background maintenance.
    ///
    /// Fails only on configuration problems: an unusable data directory or
    /// invalid pool sizing.
    pub async fn init(
        config: ArachneConfig,
        linker: L,
        source: S,
        factory: F,
    ) -> Result<Self, AppError> {
        let cache = Arc::new(TieredCache::open(config.cache_config()).await?);
        let plugin_dir = config.plugin_dir();
        tokio::fs::create_dir_all(&plugin_dir).await.map_err(|e| {
            AppError::ConfigError(format!(
                "Cannot create plugin directory {}: {e}",
                plugin_dir.display()
            ))
        })?;

        let pool = EnginePool::new(factory, config.pool_config())?;
        let registry = Arc::new(PluginRegistry::new(linker, source, config.registry_config()));
        registry.subscribe(Arc::new(pool.clone()));

        let invoker = ResolverInvoker::new(Arc::clone(&registry), pool.clone(), config.acquire_timeout);
        let search = SearchOrchestrator::new(invoker.clone(), Arc::clone(&cache), config.search_config());

        let maintenance = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(config.sweep_interval, maintenance.child_token());
        let trimmer = spawn_trimmer(
            pool.clone(),
            config.engine_idle_timeout,
            maintenance.child_token(),
        );

        tracing::info!(data_dir = %config.data_dir.display(), "Resolver hub initialized");
        Ok(Self {
            config,
            registry,
            pool,
            cache,
            invoker,
            search,
            maintenance,
            tasks: Mutex::new(vec![sweeper, trimmer]),
        })
    }

    /// Replace the reporter used for search events.
    pub fn with_search_reporter(mut self, reporter: Arc<dyn SearchReporter>) -> Self {
        self.search = self.search.with_reporter(reporter);
        self
    }

    /// Stop maintenance and shut the engine pool down. Later resolver calls
    /// fail with `PoolShutdown`.
    pub async fn shutdown(&self) {
        self.maintenance.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        let destroyed = self.pool.shutdown();
        tracing::info!(engines_destroyed = destroyed, "Resolver hub shut down");
    }

    pub fn config(&self) -> &ArachneConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry<L, S>> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    // -----------------------------------------------------------------------
    // Resolver calls
    // -----------------------------------------------------------------------

    pub fn search(&self, request: SearchRequest) -> SearchHandle {
        self.search.search(request)
    }

    pub async fn home(&self, key: &str, refresh: bool) -> Result<Listing, AppError> {
        let cache_key = self.listing_key("home", key, "")?;
        self.cached_call(key, ResolverCall::Home { refresh }, &cache_key, refresh, |o, k| {
            o.into_listing(k)
        })
        .await
    }

    pub async fn category(
        &self,
        key: &str,
        type_id: &str,
        page: u32,
        filters: BTreeMap<String, String>,
        refresh: bool,
    ) -> Result<Listing, AppError> {
        let discriminator = format!("{type_id}\n{page}\n{}", serde_json::to_string(&filters)?);
        let cache_key = self.listing_key("category", key, &discriminator)?;
        let call = ResolverCall::Category {
            type_id: type_id.to_string(),
            page,
            refresh,
            filters,
        };
        self.cached_call(key, call, &cache_key, refresh, |o, k| o.into_listing(k))
            .await
    }

    pub async fn detail(&self, key: &str, ids: Vec<String>) -> Result<Vec<DetailRecord>, AppError> {
        let cache_key = self.listing_key("detail", key, &ids.join("\n"))?;
        self.cached_call(key, ResolverCall::Detail { ids }, &cache_key, false, |o, k| {
            o.into_details(k)
        })
        .await
    }

    /// Resolve a playable source. Never cached: play URLs are short-lived.
    pub async fn player(
        &self,
        key: &str,
        flag: &str,
        id: &str,
        extra: Vec<String>,
    ) -> Result<PlayableSource, AppError> {
        let call = ResolverCall::Player {
            flag: flag.to_string(),
            id: id.to_string(),
            extra,
        };
        self.call(key, call).await?.into_playable(key)
    }

    /// Run home and a keyword search against one resolver, bypassing the
    /// cache, and report each outcome.
    pub async fn probe(&self, key: &str, keyword: &str) -> Result<ProbeReport, AppError> {
        let descriptor = self
            .registry
            .get(key)
            .ok_or_else(|| AppError::PluginNotLoaded(key.to_string()))?;

        let mut checks = Vec::new();
        let calls = [
            (Capability::Home, ResolverCall::Home { refresh: true }),
            (
                Capability::Search,
                ResolverCall::Search {
                    keyword: keyword.to_string(),
                    quick: false,
                },
            ),
        ];
        for (capability, call) in calls {
            if !descriptor.supports(capability) {
                continue;
            }
            let started = Instant::now();
            let outcome = self
                .invoker
                .invoke(key, call, self.config.call_timeout)
                .await
                .and_then(|o| o.into_listing(key));
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            checks.push(match outcome {
                Ok(listing) => ProbeCheck {
                    capability,
                    success: true,
                    items: listing.items.len() + listing.categories.len(),
                    elapsed_ms,
                    error: None,
                },
                Err(e) => ProbeCheck {
                    capability,
                    success: false,
                    items: 0,
                    elapsed_ms,
                    error: Some(e.to_string()),
                },
            });
        }
        tracing::info!(key, checks = checks.len(), "Resolver probed");
        Ok(ProbeReport {
            key: key.to_string(),
            checks,
        })
    }

    async fn call(&self, key: &str, call: ResolverCall) -> Result<ResolverOutput, AppError> {
        let policy = RetryPolicy::new(self.config.retry_count, self.config.retry_base_delay);
        let (outcome, _attempts) = self
            .invoker
            .invoke_with_retry(key, call, self.config.call_timeout, &policy, |attempt, error| {
                tracing::debug!(key, attempt, %error, "Retrying resolver call");
            })
            .await;
        outcome
    }

    async fn cached_call<T, X>(
        &self,
        key: &str,
        call: ResolverCall,
        cache_key: &str,
        refresh: bool,
        extract: X,
    ) -> Result<T, AppError>
    where
        T: Serialize + DeserializeOwned,
        X: FnOnce(ResolverOutput, &str) -> Result<T, AppError>,
    {
        if !refresh && let Some(hit) = self.cache.get::<T>(cache_key).await {
            return Ok(hit);
        }
        let value = extract(self.call(key, call).await?, key)?;
        if let Err(e) = self
            .cache
            .put(cache_key, &value, self.config.listing_ttl, TierPolicy::MemoryFirst)
            .await
        {
            tracing::warn!(key, error = %e, "Failed to cache resolver output");
        }
        Ok(value)
    }

    /// Cache key scoped to the installed package, so an update never serves
    /// output of the previous version.
    fn listing_key(&self, kind: &str, key: &str, discriminator: &str) -> Result<String, AppError> {
        let descriptor = self
            .registry
            .get(key)
            .ok_or_else(|| AppError::PluginNotLoaded(key.to_string()))?;
        Ok(format!(
            "{kind}:{key}:{}:{}",
            descriptor.cache_scope(),
            compute_hash(discriminator)
        ))
    }

    // -----------------------------------------------------------------------
    // Plugin management
    // -----------------------------------------------------------------------

    pub async fn load_plugin(&self, spec: PackageSpec) -> Result<PluginDescriptor, AppError> {
        Ok(self.registry.load(spec).await?)
    }

    /// Load several packages. A failure only affects its own package.
    pub async fn load_plugins(
        &self,
        specs: Vec<PackageSpec>,
    ) -> Vec<(String, Result<PluginDescriptor, LoadError>)> {
        let mut outcomes = Vec::with_capacity(specs.len());
        for spec in specs {
            let key = spec.key.clone();
            outcomes.push((key, self.registry.load(spec).await));
        }
        outcomes
    }

    pub async fn unload_plugin(&self, key: &str) -> bool {
        self.registry.unload(key).await
    }

    pub async fn check_for_update(&self, key: &str) -> Result<UpdateInfo, AppError> {
        Ok(self.registry.check_for_update(key).await?)
    }

    pub async fn apply_update(&self, key: &str) -> Result<PluginDescriptor, AppError> {
        Ok(self.registry.apply_update(key).await?)
    }

    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.registry.descriptors()
    }

    // -----------------------------------------------------------------------
    // Stats and maintenance
    // -----------------------------------------------------------------------

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn registry_status(&self) -> RegistryStatus {
        self.registry.status()
    }

    pub async fn sweep_cache(&self) -> Result<SweepReport, AppError> {
        self.cache.sweep().await
    }

    pub async fn clear_cache(&self) -> Result<(), AppError> {
        self.cache.clear().await
    }
}

/// Periodically destroy idle engines above the core size.
fn spawn_trimmer<F: EngineFactory>(
    pool: EnginePool<F>,
    max_idle: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tokio::time::sleep(max_idle) => {}
                () = cancel.cancelled() => break,
            }
            let trimmed = pool.trim_idle(max_idle);
            if trimmed > 0 {
                tracing::debug!(trimmed, "Trimmed idle engines");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        MockBehavior, MockEngineFactory, MockLinker, MockPackageSource, mock_package,
    };

    type TestHub = ResolverHub<MockLinker, MockPackageSource, MockEngineFactory>;

    const ALL: &[Capability] = &[
        Capability::Home,
        Capability::Category,
        Capability::Detail,
        Capability::Search,
        Capability::Player,
    ];

    async fn hub(dir: &tempfile::TempDir) -> (TestHub, MockPackageSource, MockEngineFactory) {
        let source = MockPackageSource::new();
        let factory = MockEngineFactory::new();
        let config = ArachneConfig {
            data_dir: dir.path().to_path_buf(),
            retry_count: 0,
            ..ArachneConfig::default()
        };
        let hub = ResolverHub::init(config, MockLinker, source.clone(), factory.clone())
            .await
            .unwrap();
        (hub, source, factory)
    }

    async fn with_plugin(hub: &TestHub, source: &MockPackageSource, key: &str, version: &str) {
        let uri = format!("mem://{key}");
        source.insert(&uri, mock_package(key, version, ALL, MockBehavior::default()));
        hub.load_plugin(PackageSpec::new(key, uri)).await.unwrap();
    }

    #[tokio::test]
    async fn test_home_is_cached_until_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, source, factory) = hub(&dir).await;
        with_plugin(&hub, &source, "alpha", "1").await;

        let first = hub.home("alpha", false).await.unwrap();
        let second = hub.home("alpha", false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(factory.executions(), 1);

        hub.home("alpha", true).await.unwrap();
        assert_eq!(factory.executions(), 2);
        assert!(hub.cache_stats().await.hits >= 1);
    }

    #[tokio::test]
    async fn test_update_invalidates_listing_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, source, factory) = hub(&dir).await;
        with_plugin(&hub, &source, "alpha", "1").await;
        hub.home("alpha", false).await.unwrap();

        source.insert("mem://alpha", mock_package("alpha", "2", ALL, MockBehavior::default()));
        hub.apply_update("alpha").await.unwrap();
        hub.home("alpha", false).await.unwrap();
        assert_eq!(factory.executions(), 2);
    }

    #[tokio::test]
    async fn test_detail_category_and_player() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, source, _) = hub(&dir).await;
        with_plugin(&hub, &source, "alpha", "1").await;

        let details = hub
            .detail("alpha", vec!["v1".into(), "v2".into()])
            .await
            .unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].id, "v1");
        assert_eq!(details[1].playlists[0].episodes[0].id, "v2/1");

        let listing = hub
            .category("alpha", "movies", 2, BTreeMap::new(), false)
            .await
            .unwrap();
        assert_eq!(listing.items.len(), 1);

        let playable = hub.player("alpha", "main", "v1/1", vec![]).await.unwrap();
        assert_eq!(playable.url, "https://media.example/v1/1.m3u8");
        assert_eq!(playable.flag, "main");
    }

    #[tokio::test]
    async fn test_unknown_resolver() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, _, _) = hub(&dir).await;
        assert!(matches!(
            hub.home("ghost", false).await,
            Err(AppError::PluginNotLoaded(_))
        ));
        assert!(matches!(
            hub.player("ghost", "f", "i", vec![]).await,
            Err(AppError::PluginNotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_search_through_hub() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, source, _) = hub(&dir).await;
        with_plugin(&hub, &source, "alpha", "1").await;
        with_plugin(&hub, &source, "beta", "1").await;

        let summary = hub.search(SearchRequest::new("moon")).finish().await;
        assert_eq!(summary.progress.succeeded, 2);
        assert_eq!(summary.task.target_resolver_keys, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_probe_reports_each_capability() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, source, _) = hub(&dir).await;
        with_plugin(&hub, &source, "alpha", "1").await;
        source.insert(
            "mem://broken",
            mock_package(
                "broken",
                "1",
                &[Capability::Search],
                MockBehavior {
                    fail: true,
                    ..MockBehavior::default()
                },
            ),
        );
        hub.load_plugin(PackageSpec::new("broken", "mem://broken"))
            .await
            .unwrap();

        let healthy = hub.probe("alpha", "moon").await.unwrap();
        assert_eq!(healthy.checks.len(), 2);
        assert!(healthy.is_healthy());

        let broken = hub.probe("broken", "moon").await.unwrap();
        assert_eq!(broken.checks.len(), 1);
        assert_eq!(broken.checks[0].capability, Capability::Search);
        assert!(!broken.is_healthy());
    }

    #[tokio::test]
    async fn test_unload_unbinds_pool_engines() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, source, factory) = hub(&dir).await;
        with_plugin(&hub, &source, "alpha", "1").await;
        hub.home("alpha", true).await.unwrap();

        assert!(hub.unload_plugin("alpha").await);
        assert_eq!(factory.shutdowns(), 1);
        assert!(hub.plugins().is_empty());
        assert_eq!(hub.registry_status().loaded, 0);
    }

    #[tokio::test]
    async fn test_load_plugins_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, source, _) = hub(&dir).await;
        source.insert("mem://good", mock_package("good", "1", ALL, MockBehavior::default()));

        let outcomes = hub
            .load_plugins(vec![
                PackageSpec::new("good", "mem://good"),
                PackageSpec::new("bad", "mem://missing"),
            ])
            .await;
        assert!(outcomes[0].1.is_ok());
        assert!(matches!(outcomes[1].1, Err(LoadError::SourceUnavailable(_))));
        assert_eq!(hub.plugins().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, source, _) = hub(&dir).await;
        with_plugin(&hub, &source, "alpha", "1").await;

        hub.shutdown().await;
        assert!(hub.pool_status().shut_down);
        assert!(matches!(
            hub.home("alpha", true).await,
            Err(AppError::PoolShutdown)
        ));
    }

    #[tokio::test]
    async fn test_init_fails_on_unusable_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let config = ArachneConfig {
            data_dir: blocker,
            ..ArachneConfig::default()
        };

        let result = ResolverHub::init(
            config,
            MockLinker,
            MockPackageSource::new(),
            MockEngineFactory::new(),
        )
        .await;
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
