//! Federated search: one keyword fanned out to many resolvers.
//!
//! Each resolver becomes a unit on a `JoinSet`, gated by a per-search
//! semaphore. Results stream back in completion order over a bounded
//! channel, progress is published on a `watch` channel, and the whole
//! search can be cancelled through its [`SearchHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{TierPolicy, TieredCache};
use crate::error::AppError;
use crate::invoker::ResolverInvoker;
use crate::models::{Capability, ResolverCall, VodItem, compute_hash};
use crate::retry::RetryPolicy;
use crate::traits::{Engine, EngineFactory, PackageSource, PluginLinker};

// ---------------------------------------------------------------------------
// Configuration and request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchConfig {
    pub max_concurrency: usize,
    pub per_call_timeout: Duration,
    pub retry_count: u32,
    pub retry_base_delay: Duration,
    pub result_ttl: Duration,
    /// Capacity of the result channel; a slow consumer pauses the search.
    pub channel_capacity: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            per_call_timeout: Duration::from_secs(15),
            retry_count: 1,
            retry_base_delay: Duration::from_millis(500),
            result_ttl: Duration::from_secs(10 * 60),
            channel_capacity: 16,
        }
    }
}

/// A federated search. Unset limits fall back to [`SearchConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    pub keyword: String,
    /// Resolvers to query. Empty means every loaded resolver that can search.
    pub resolver_keys: Vec<String>,
    pub max_concurrency: Option<usize>,
    pub per_call_timeout: Option<Duration>,
    pub retry_count: Option<u32>,
    pub quick: bool,
}

impl SearchRequest {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            ..Self::default()
        }
    }

    pub fn with_resolvers<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.resolver_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_timeout(mut self, per_call_timeout: Duration) -> Self {
        self.per_call_timeout = Some(per_call_timeout);
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn quick(mut self, quick: bool) -> Self {
        self.quick = quick;
        self
    }
}

// ---------------------------------------------------------------------------
// Results and progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTask {
    pub query_id: Uuid,
    pub keyword: String,
    pub target_resolver_keys: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub resolver_key: String,
    pub success: bool,
    pub items: Vec<VodItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub attempts: u32,
    pub cached: bool,
}

impl SearchResult {
    fn failed(resolver_key: &str, error: &AppError, elapsed_ms: u64, attempts: u32) -> Self {
        Self {
            resolver_key: resolver_key.to_string(),
            success: false,
            items: Vec::new(),
            error: Some(error.to_string()),
            elapsed_ms,
            attempts,
            cached: false,
        }
    }
}

/// Derived view over the results seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchProgress {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

impl SearchProgress {
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    fn record(&mut self, result: &SearchResult, started: Instant) {
        self.completed += 1;
        if result.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.elapsed_ms = elapsed_ms(started);
    }
}

/// One streamed result with the progress after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchUpdate {
    pub result: SearchResult,
    pub progress: SearchProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSummary {
    pub task: SearchTask,
    pub results: Vec<SearchResult>,
    pub progress: SearchProgress,
    pub cancelled: bool,
    pub from_cache: bool,
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SearchEvent<'a> {
    Started {
        query_id: Uuid,
        keyword: &'a str,
        resolvers: usize,
    },
    AggregateHit {
        query_id: Uuid,
        results: usize,
    },
    Skipped {
        query_id: Uuid,
        resolver_key: &'a str,
        reason: &'a str,
    },
    Retrying {
        query_id: Uuid,
        resolver_key: &'a str,
        attempt: u32,
        error: &'a str,
    },
    ResolverFinished {
        query_id: Uuid,
        result: &'a SearchResult,
    },
    Cancelled {
        query_id: Uuid,
        progress: &'a SearchProgress,
    },
    Finished {
        query_id: Uuid,
        progress: &'a SearchProgress,
    },
}

/// Trait for receiving search events (decoupled logging).
pub trait SearchReporter: Send + Sync {
    fn report(&self, event: SearchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSearchReporter;

impl SearchReporter for TracingSearchReporter {
    fn report(&self, event: SearchEvent<'_>) {
        match event {
            SearchEvent::Started {
                query_id,
                keyword,
                resolvers,
            } => {
                tracing::info!(%query_id, %keyword, %resolvers, "Search started");
            }
            SearchEvent::AggregateHit { query_id, results } => {
                tracing::info!(%query_id, %results, "Search served from cache");
            }
            SearchEvent::Skipped {
                query_id,
                resolver_key,
                reason,
            } => {
                tracing::debug!(%query_id, %resolver_key, %reason, "Resolver skipped");
            }
            SearchEvent::Retrying {
                query_id,
                resolver_key,
                attempt,
                error,
            } => {
                tracing::debug!(%query_id, %resolver_key, %attempt, %error, "Retrying resolver");
            }
            SearchEvent::ResolverFinished { query_id, result } => {
                if result.success {
                    tracing::debug!(
                        %query_id,
                        resolver_key = %result.resolver_key,
                        items = result.items.len(),
                        elapsed_ms = result.elapsed_ms,
                        cached = result.cached,
                        "Resolver finished"
                    );
                } else {
                    tracing::warn!(
                        %query_id,
                        resolver_key = %result.resolver_key,
                        error = result.error.as_deref().unwrap_or_default(),
                        attempts = result.attempts,
                        "Resolver failed"
                    );
                }
            }
            SearchEvent::Cancelled { query_id, progress } => {
                tracing::info!(%query_id, completed = progress.completed, total = progress.total, "Search cancelled");
            }
            SearchEvent::Finished { query_id, progress } => {
                tracing::info!(
                    %query_id,
                    succeeded = progress.succeeded,
                    failed = progress.failed,
                    elapsed_ms = progress.elapsed_ms,
                    "Search finished"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct Outcome {
    cancelled: bool,
    from_cache: bool,
}

/// Caller's side of a running search. Dropping it cancels the search.
pub struct SearchHandle {
    task: SearchTask,
    updates: mpsc::Receiver<SearchUpdate>,
    progress: watch::Receiver<SearchProgress>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<Outcome>>,
    seen: Vec<SearchResult>,
}

impl SearchHandle {
    pub fn task(&self) -> &SearchTask {
        &self.task
    }

    /// Next result in completion order; `None` once the search has ended.
    pub async fn next(&mut self) -> Option<SearchUpdate> {
        let update = self.updates.recv().await?;
        self.seen.push(update.result.clone());
        Some(update)
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> SearchProgress {
        *self.progress.borrow()
    }

    /// A receiver that observes every progress change.
    pub fn watch_progress(&self) -> watch::Receiver<SearchProgress> {
        self.progress.clone()
    }

    /// Abort all in-flight resolver calls. Results already delivered stay
    /// valid.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drain the remaining results and wait for the search to end.
    pub async fn finish(mut self) -> SearchSummary {
        while self.next().await.is_some() {}
        let outcome = match self.driver.take() {
            Some(driver) => driver.await.unwrap_or(Outcome {
                cancelled: true,
                from_cache: false,
            }),
            None => Outcome::default(),
        };
        SearchSummary {
            task: self.task.clone(),
            results: std::mem::take(&mut self.seen),
            progress: *self.progress.borrow(),
            cancelled: outcome.cancelled,
            from_cache: outcome.from_cache,
        }
    }
}

impl Drop for SearchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Cache key of the combined results of a search.
///
/// `scoped_keys` holds one `key@scope` entry per target, where the scope is
/// the descriptor's [`cache_scope`](crate::plugin::PluginDescriptor::cache_scope),
/// so an unload or update changes the key.
pub fn aggregate_cache_key(keyword: &str, quick: bool, scoped_keys: &[String]) -> String {
    let mut keys = scoped_keys.to_vec();
    keys.sort();
    format!(
        "search:agg:{}",
        compute_hash(&format!("{keyword}\n{quick}\n{}", keys.join(",")))
    )
}

/// Cache key of one resolver version's results for a keyword.
pub fn resolver_cache_key(resolver_key: &str, scope: &str, keyword: &str, quick: bool) -> String {
    format!(
        "search:{resolver_key}:{scope}:{}",
        compute_hash(&format!("{keyword}\n{quick}"))
    )
}

pub struct SearchOrchestrator<L, S, F>
where
    L: PluginLinker,
    S: PackageSource,
    F: EngineFactory,
{
    invoker: ResolverInvoker<L, S, F>,
    cache: Arc<TieredCache>,
    config: SearchConfig,
    reporter: Arc<dyn SearchReporter>,
}

impl<L, S, F> Clone for SearchOrchestrator<L, S, F>
where
    L: PluginLinker,
    S: PackageSource,
    F: EngineFactory,
{
    fn clone(&self) -> Self {
        Self {
            invoker: self.invoker.clone(),
            cache: Arc::clone(&self.cache),
            config: self.config,
            reporter: Arc::clone(&self.reporter),
        }
    }
}

/// Limits resolved for one search.
#[derive(Debug, Clone, Copy)]
struct Limits {
    concurrency: usize,
    timeout: Duration,
    retry: RetryPolicy,
}

impl<L, S, F> SearchOrchestrator<L, S, F>
where
    L: PluginLinker,
    S: PackageSource,
    F: EngineFactory,
    F::Engine: Engine<Program = L::Program>,
{
    pub fn new(
        invoker: ResolverInvoker<L, S, F>,
        cache: Arc<TieredCache>,
        config: SearchConfig,
    ) -> Self {
        Self {
            invoker,
            cache,
            config,
            reporter: Arc::new(TracingSearchReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SearchReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Start a search. Must be called within a tokio runtime.
    pub fn search(&self, request: SearchRequest) -> SearchHandle {
        let query_id = Uuid::new_v4();
        let targets = self.targets(query_id, &request);
        let task = SearchTask {
            query_id,
            keyword: request.keyword.clone(),
            target_resolver_keys: targets,
            started_at: Utc::now(),
        };
        let limits = Limits {
            concurrency: request
                .max_concurrency
                .unwrap_or(self.config.max_concurrency)
                .max(1),
            timeout: request.per_call_timeout.unwrap_or(self.config.per_call_timeout),
            retry: RetryPolicy::new(
                request.retry_count.unwrap_or(self.config.retry_count),
                self.config.retry_base_delay,
            ),
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (progress_tx, progress_rx) = watch::channel(SearchProgress {
            total: task.target_resolver_keys.len(),
            ..SearchProgress::default()
        });
        let cancel = CancellationToken::new();

        let driver = tokio::spawn(self.clone().drive(
            task.clone(),
            request.quick,
            limits,
            tx,
            progress_tx,
            cancel.clone(),
        ));

        SearchHandle {
            task,
            updates: rx,
            progress: progress_rx,
            cancel,
            driver: Some(driver),
            seen: Vec::new(),
        }
    }

    /// Resolve the resolvers a request targets, dropping the ones whose
    /// site flags exclude them.
    fn targets(&self, query_id: Uuid, request: &SearchRequest) -> Vec<String> {
        let registry = self.invoker.registry();
        let requested: Vec<String> = if request.resolver_keys.is_empty() {
            registry
                .descriptors()
                .into_iter()
                .filter(|d| d.supports(Capability::Search))
                .map(|d| d.key)
                .collect()
        } else {
            request.resolver_keys.clone()
        };

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(requested.len());
        for key in requested {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(descriptor) = registry.get(&key) {
                let reason = if !descriptor.searchable {
                    Some("not searchable")
                } else if request.quick && !descriptor.quick_search {
                    Some("quick search disabled")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    self.reporter.report(SearchEvent::Skipped {
                        query_id,
                        resolver_key: &key,
                        reason,
                    });
                    continue;
                }
            }
            targets.push(key);
        }
        targets
    }

    /// Aggregate key for the targets' current versions. `None` when a target
    /// has no descriptor: such a search is never served from or written to
    /// the aggregate cache.
    fn aggregate_key(&self, task: &SearchTask, quick: bool) -> Option<String> {
        if task.target_resolver_keys.is_empty() {
            return None;
        }
        let registry = self.invoker.registry();
        let scoped = task
            .target_resolver_keys
            .iter()
            .map(|key| {
                registry
                    .get(key)
                    .map(|d| format!("{key}@{}", d.cache_scope()))
            })
            .collect::<Option<Vec<_>>>()?;
        Some(aggregate_cache_key(&task.keyword, quick, &scoped))
    }

    async fn drive(
        self,
        task: SearchTask,
        quick: bool,
        limits: Limits,
        tx: mpsc::Sender<SearchUpdate>,
        progress_tx: watch::Sender<SearchProgress>,
        cancel: CancellationToken,
    ) -> Outcome {
        let started = Instant::now();
        let query_id = task.query_id;
        let mut progress = *progress_tx.borrow();
        self.reporter.report(SearchEvent::Started {
            query_id,
            keyword: &task.keyword,
            resolvers: progress.total,
        });

        let aggregate_key = self.aggregate_key(&task, quick);
        if let Some(aggregate_key) = &aggregate_key
            && let Some(results) = self.cache.get::<Vec<SearchResult>>(aggregate_key).await
        {
            self.reporter.report(SearchEvent::AggregateHit {
                query_id,
                results: results.len(),
            });
            progress.total = results.len();
            for mut result in results {
                result.cached = true;
                result.elapsed_ms = 0;
                progress.record(&result, started);
                progress_tx.send_replace(progress);
                let update = SearchUpdate { result, progress };
                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = tx.send(update) => sent.is_ok(),
                };
                if !sent {
                    return Outcome {
                        cancelled: true,
                        from_cache: true,
                    };
                }
            }
            self.reporter.report(SearchEvent::Finished {
                query_id,
                progress: &progress,
            });
            return Outcome {
                cancelled: false,
                from_cache: true,
            };
        }

        let permits = Arc::new(Semaphore::new(limits.concurrency));
        let mut units = JoinSet::new();
        let mut unit_keys = HashMap::new();
        for key in &task.target_resolver_keys {
            let unit = self.clone().run_unit(
                query_id,
                key.clone(),
                task.keyword.clone(),
                quick,
                limits,
                Arc::clone(&permits),
            );
            let handle = units.spawn(unit);
            unit_keys.insert(handle.id(), key.clone());
        }

        let mut results = Vec::with_capacity(progress.total);
        let mut cancelled = false;
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                joined = units.join_next_with_id() => joined,
            };
            let result = match joined {
                None => break,
                Some(Ok((_, result))) => result,
                Some(Err(e)) => {
                    let key = unit_keys.get(&e.id()).cloned().unwrap_or_default();
                    let error = AppError::Generic(format!("search unit aborted: {e}"));
                    SearchResult::failed(&key, &error, 0, 0)
                }
            };

            progress.record(&result, started);
            progress_tx.send_replace(progress);
            self.reporter.report(SearchEvent::ResolverFinished {
                query_id,
                result: &result,
            });
            results.push(result.clone());

            let update = SearchUpdate { result, progress };
            let sent = tokio::select! {
                _ = cancel.cancelled() => false,
                sent = tx.send(update) => sent.is_ok(),
            };
            if !sent {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            units.abort_all();
            while units.join_next().await.is_some() {}
            progress.elapsed_ms = elapsed_ms(started);
            progress_tx.send_replace(progress);
            self.reporter.report(SearchEvent::Cancelled {
                query_id,
                progress: &progress,
            });
            return Outcome {
                cancelled: true,
                from_cache: false,
            };
        }

        if let Some(aggregate_key) = &aggregate_key
            && !results.is_empty()
            && results.iter().all(|r| r.success)
            && let Err(e) = self
                .cache
                .put(aggregate_key, &results, self.config.result_ttl, TierPolicy::MemoryFirst)
                .await
        {
            tracing::warn!(%query_id, error = %e, "Failed to cache search aggregate");
        }

        self.reporter.report(SearchEvent::Finished {
            query_id,
            progress: &progress,
        });
        Outcome::default()
    }

    /// Search one resolver: per-resolver cache first, then a leased engine.
    /// A key with no descriptor fails without touching the cache.
    async fn run_unit(
        self,
        query_id: Uuid,
        key: String,
        keyword: String,
        quick: bool,
        limits: Limits,
        permits: Arc<Semaphore>,
    ) -> SearchResult {
        let Ok(_permit) = permits.acquire_owned().await else {
            let error = AppError::Generic("search concurrency limiter closed".into());
            return SearchResult::failed(&key, &error, 0, 0);
        };
        let started = Instant::now();

        let Some(descriptor) = self.invoker.registry().get(&key) else {
            let error = AppError::PluginNotLoaded(key.clone());
            return SearchResult::failed(&key, &error, elapsed_ms(started), 0);
        };
        let cache_key = resolver_cache_key(&key, descriptor.cache_scope(), &keyword, quick);
        if let Some(items) = self.cache.get::<Vec<VodItem>>(&cache_key).await {
            return SearchResult {
                resolver_key: key,
                success: true,
                items,
                error: None,
                elapsed_ms: elapsed_ms(started),
                attempts: 0,
                cached: true,
            };
        }

        let call = ResolverCall::Search { keyword, quick };
        let reporter = Arc::clone(&self.reporter);
        let (outcome, attempts) = self
            .invoker
            .invoke_with_retry(&key, call, limits.timeout, &limits.retry, |attempt, error| {
                reporter.report(SearchEvent::Retrying {
                    query_id,
                    resolver_key: &key,
                    attempt,
                    error: &error.to_string(),
                });
            })
            .await;

        let listing = outcome.and_then(|output| output.into_listing(&key));
        match listing {
            Ok(listing) => {
                if !listing.items.is_empty()
                    && let Err(e) = self
                        .cache
                        .put(&cache_key, &listing.items, self.config.result_ttl, TierPolicy::MemoryFirst)
                        .await
                {
                    tracing::warn!(resolver_key = %key, error = %e, "Failed to cache search results");
                }
                SearchResult {
                    resolver_key: key,
                    success: true,
                    items: listing.items,
                    error: None,
                    elapsed_ms: elapsed_ms(started),
                    attempts,
                    cached: false,
                }
            }
            Err(e) => SearchResult::failed(&key, &e, elapsed_ms(started), attempts),
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
