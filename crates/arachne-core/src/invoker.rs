//! One resolver call: registry lookup, engine lease, timed execution.

use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{ResolverCall, ResolverOutput};
use crate::pool::EnginePool;
use crate::registry::PluginRegistry;
use crate::retry::RetryPolicy;
use crate::traits::{Engine, EngineFactory, PackageSource, PluginLinker};

/// Runs resolver calls against the registry and the engine pool.
pub struct ResolverInvoker<L, S, F>
where
    L: PluginLinker,
    S: PackageSource,
    F: EngineFactory,
{
    registry: Arc<PluginRegistry<L, S>>,
    pool: EnginePool<F>,
    acquire_timeout: Duration,
}

impl<L, S, F> Clone for ResolverInvoker<L, S, F>
where
    L: PluginLinker,
    S: PackageSource,
    F: EngineFactory,
{
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            pool: self.pool.clone(),
            acquire_timeout: self.acquire_timeout,
        }
    }
}

impl<L, S, F> ResolverInvoker<L, S, F>
where
    L: PluginLinker,
    S: PackageSource,
    F: EngineFactory,
    F::Engine: Engine<Program = L::Program>,
{
    pub fn new(
        registry: Arc<PluginRegistry<L, S>>,
        pool: EnginePool<F>,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            acquire_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry<L, S>> {
        &self.registry
    }

    pub fn pool(&self) -> &EnginePool<F> {
        &self.pool
    }

    /// Execute `call` on resolver `key` once.
    ///
    /// The pool wait is bounded by the acquire timeout; binding and
    /// execution together are bounded by `timeout`. The lease is returned
    /// to the pool however this future ends.
    pub async fn invoke(
        &self,
        key: &str,
        call: ResolverCall,
        timeout: Duration,
    ) -> Result<ResolverOutput, AppError> {
        let plugin = self
            .registry
            .resolve(key)
            .ok_or_else(|| AppError::PluginNotLoaded(key.to_string()))?;
        let capability = call.capability();
        if !plugin.descriptor.supports(capability) {
            return Err(AppError::UnsupportedCapability {
                key: key.to_string(),
                capability: capability.to_string(),
            });
        }

        let Some(mut lease) = self.pool.acquire(key, self.acquire_timeout).await? else {
            return Err(AppError::EngineUnavailable(key.to_string()));
        };

        let run = async {
            lease.bind(&plugin).await?;
            lease.execute(call).await
        };
        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_elapsed) => Err(AppError::ResolverCallTimeout {
                key: key.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Like [`invoke`](Self::invoke), retrying transient failures with
    /// linear backoff. Returns the final outcome and the number of attempts.
    ///
    /// `on_retry` is called with the upcoming attempt number and the error
    /// that caused it.
    pub async fn invoke_with_retry(
        &self,
        key: &str,
        call: ResolverCall,
        timeout: Duration,
        policy: &RetryPolicy,
        on_retry: impl Fn(u32, &AppError),
    ) -> (Result<ResolverOutput, AppError>, u32) {
        let mut attempt = 1;
        loop {
            match self.invoke(key, call.clone(), timeout).await {
                Ok(output) => return (Ok(output), attempt),
                Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                    on_retry(attempt + 1, &e);
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Capability;
    use crate::plugin::PackageSpec;
    use crate::pool::PoolConfig;
    use crate::registry::RegistryConfig;
    use crate::testutil::{
        MockBehavior, MockEngineFactory, MockLinker, MockPackageSource, mock_package,
    };

    type TestInvoker = ResolverInvoker<MockLinker, MockPackageSource, MockEngineFactory>;

    async fn invoker(
        dir: &tempfile::TempDir,
        behavior: MockBehavior,
        caps: &[Capability],
    ) -> (TestInvoker, MockEngineFactory) {
        let source = MockPackageSource::new();
        source.insert("mem://alpha", mock_package("alpha", "1", caps, behavior));
        let registry = Arc::new(PluginRegistry::new(
            MockLinker,
            source,
            RegistryConfig::new(dir.path()),
        ));
        registry
            .load(PackageSpec::new("alpha", "mem://alpha"))
            .await
            .unwrap();
        let factory = MockEngineFactory::new();
        let pool = EnginePool::new(
            factory.clone(),
            PoolConfig {
                core_size: 1,
                max_size: 1,
            },
        )
        .unwrap();
        (
            ResolverInvoker::new(registry, pool, Duration::from_millis(200)),
            factory,
        )
    }

    fn search() -> ResolverCall {
        ResolverCall::Search {
            keyword: "moon".into(),
            quick: false,
        }
    }

    #[tokio::test]
    async fn test_invoke_returns_output_and_releases_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (invoker, _) = invoker(&dir, MockBehavior::default(), &[Capability::Search]).await;

        let listing = invoker
            .invoke("alpha", search(), Duration::from_secs(1))
            .await
            .unwrap()
            .into_listing("alpha")
            .unwrap();
        assert_eq!(listing.items[0].name, "moon @ alpha");
        assert_eq!(invoker.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_invoke_unknown_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let (invoker, factory) =
            invoker(&dir, MockBehavior::default(), &[Capability::Search]).await;

        assert!(matches!(
            invoker.invoke("ghost", search(), Duration::from_secs(1)).await,
            Err(AppError::PluginNotLoaded(_))
        ));
        assert!(matches!(
            invoker
                .invoke("alpha", ResolverCall::Home { refresh: false }, Duration::from_secs(1))
                .await,
            Err(AppError::UnsupportedCapability { .. })
        ));
        assert_eq!(factory.executions(), 0);
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let behavior = MockBehavior {
            delay_ms: 5_000,
            ..MockBehavior::default()
        };
        let (invoker, _) = invoker(&dir, behavior, &[Capability::Search]).await;

        let err = invoker
            .invoke("alpha", search(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ResolverCallTimeout { timeout_ms: 50, .. }
        ));
        assert_eq!(invoker.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let behavior = MockBehavior {
            fail_first: 1,
            ..MockBehavior::default()
        };
        let (invoker, factory) = invoker(&dir, behavior, &[Capability::Search]).await;
        let retries = std::sync::Mutex::new(Vec::new());

        let (result, attempts) = invoker
            .invoke_with_retry(
                "alpha",
                search(),
                Duration::from_secs(1),
                &RetryPolicy::new(2, Duration::from_millis(10)),
                |attempt, _| retries.lock().unwrap().push(attempt),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts, 2);
        assert_eq!(*retries.lock().unwrap(), vec![2]);
        assert_eq!(factory.executions(), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_and_skips_permanent_errors() {
        let dir = tempfile::tempdir().unwrap();
        let behavior = MockBehavior {
            fail: true,
            ..MockBehavior::default()
        };
        let (invoker, factory) = invoker(&dir, behavior, &[Capability::Search]).await;
        let policy = RetryPolicy::new(2, Duration::from_millis(5));

        let (result, attempts) = invoker
            .invoke_with_retry("alpha", search(), Duration::from_secs(1), &policy, |_, _| {})
            .await;
        assert!(matches!(result, Err(AppError::ResolverCallFailure { .. })));
        assert_eq!(attempts, 3);
        assert_eq!(factory.executions(), 3);

        let (result, attempts) = invoker
            .invoke_with_retry("ghost", search(), Duration::from_secs(1), &policy, |_, _| {})
            .await;
        assert!(matches!(result, Err(AppError::PluginNotLoaded(_))));
        assert_eq!(attempts, 1);
    }
}
