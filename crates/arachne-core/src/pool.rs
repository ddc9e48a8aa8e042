//! Bounded pool of reusable resolver engines.
//!
//! Engines are expensive to create, so a core set is pre-warmed and reused
//! across calls. Callers hold an [`EngineLease`]; dropping the lease always
//! returns (or destroys) the engine, whichever way the caller exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;
use crate::models::{ResolverCall, ResolverOutput};
use crate::plugin::LoadedPlugin;
use crate::traits::{Engine, EngineFactory, RegistryListener};

type ProgramOf<F> = <<F as EngineFactory>::Engine as Engine>::Program;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Engines created at startup and kept through normal operation.
    pub core_size: usize,
    /// Hard cap on live engines, idle and leased together.
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 2,
            max_size: 5,
        }
    }
}

/// An engine plus the pool's bookkeeping about it.
#[derive(Debug)]
pub struct EngineHandle<E> {
    pub id: u64,
    pub bound_key: Option<String>,
    pub bound_checksum: Option<String>,
    pub initialized: bool,
    pub last_used_at: DateTime<Utc>,
    engine: E,
}

impl<E: Engine> EngineHandle<E> {
    fn new(id: u64, engine: E) -> Self {
        Self {
            id,
            bound_key: None,
            bound_checksum: None,
            initialized: false,
            last_used_at: Utc::now(),
            engine,
        }
    }

    fn is_bound_to(&self, key: &str) -> bool {
        self.initialized && self.bound_key.as_deref() == Some(key)
    }

    fn clear_binding(&mut self) {
        self.bound_key = None;
        self.bound_checksum = None;
        self.initialized = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub core_size: usize,
    pub max_size: usize,
    pub created: u64,
    pub destroyed: u64,
    pub shut_down: bool,
}

struct PoolInner<F: EngineFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<EngineHandle<F::Engine>>>,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    next_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    shut_down: AtomicBool,
}

impl<F: EngineFactory> PoolInner<F> {
    /// Acquires the idle-set lock, recovering from poison if necessary.
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<EngineHandle<F::Engine>>> {
        self.idle.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned engine pool mutex");
            poisoned.into_inner()
        })
    }

    fn create(&self) -> Result<EngineHandle<F::Engine>, AppError> {
        let engine = self.factory.create()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(engine_id = id, "Created engine");
        Ok(EngineHandle::new(id, engine))
    }

    fn destroy(&self, mut handle: EngineHandle<F::Engine>) {
        handle.engine.shutdown();
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(engine_id = handle.id, "Destroyed engine");
    }

    fn live(&self) -> usize {
        self.lock_idle().len() + self.active.load(Ordering::Acquire)
    }

    /// Pick the best idle engine for `key`: one already bound to it, then an
    /// unbound one, then the least recently used.
    fn take_idle(&self, key: &str) -> Option<EngineHandle<F::Engine>> {
        let mut idle = self.lock_idle();
        let position = idle
            .iter()
            .position(|h| h.is_bound_to(key))
            .or_else(|| idle.iter().position(|h| h.bound_key.is_none()))
            .or_else(|| {
                idle.iter()
                    .enumerate()
                    .min_by_key(|(_, h)| h.last_used_at)
                    .map(|(i, _)| i)
            })?;
        idle.remove(position)
    }

    fn release(&self, mut handle: EngineHandle<F::Engine>) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        if self.shut_down.load(Ordering::Acquire) {
            self.destroy(handle);
            return;
        }

        match handle.engine.reset() {
            Ok(()) => {
                handle.last_used_at = Utc::now();
                self.lock_idle().push_back(handle);
            }
            Err(e) => {
                tracing::warn!(engine_id = handle.id, error = %e, "Engine reset failed, destroying");
                self.destroy(handle);
                self.replenish();
            }
        }
    }

    /// Top the pool back up to its core size.
    fn replenish(&self) {
        while !self.shut_down.load(Ordering::Acquire) && self.live() < self.config.core_size {
            match self.create() {
                Ok(handle) => self.lock_idle().push_back(handle),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to replenish engine pool");
                    break;
                }
            }
        }
    }
}

/// Pool of engines produced by `F`.
pub struct EnginePool<F: EngineFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: EngineFactory> Clone for EnginePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: EngineFactory> EnginePool<F> {
    /// Create the pool and pre-warm `core_size` engines.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, AppError> {
        if config.max_size == 0 || config.core_size > config.max_size {
            return Err(AppError::ConfigError(format!(
                "Invalid pool sizing: core {} / max {}",
                config.core_size, config.max_size
            )));
        }

        let inner = Arc::new(PoolInner {
            factory,
            config,
            idle: Mutex::new(VecDeque::with_capacity(config.max_size)),
            permits: Arc::new(Semaphore::new(config.max_size)),
            active: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });

        for _ in 0..config.core_size {
            let handle = inner.create()?;
            inner.lock_idle().push_back(handle);
        }
        tracing::info!(
            core = config.core_size,
            max = config.max_size,
            "Engine pool warmed"
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Lease an engine for `resolver_key`.
    ///
    /// Waits up to `timeout` when every engine is busy and the pool is at
    /// its maximum; `Ok(None)` means none became free in time.
    pub async fn acquire(
        &self,
        resolver_key: &str,
        timeout: Duration,
    ) -> Result<Option<EngineLease<F>>, AppError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(AppError::PoolShutdown);
        }

        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(AppError::PoolShutdown),
            Err(_elapsed) => {
                tracing::debug!(key = resolver_key, "Engine acquire timed out");
                return Ok(None);
            }
        };

        let handle = match self.inner.take_idle(resolver_key) {
            Some(handle) => handle,
            None => self.inner.create()?,
        };
        self.inner.active.fetch_add(1, Ordering::AcqRel);

        Ok(Some(EngineLease {
            handle: Some(handle),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }))
    }

    /// Unbind idle engines from a removed plugin. Returns how many were
    /// unbound. Leased engines are rebound on their next `bind`.
    pub fn unbind(&self, key: &str) -> usize {
        let mut idle = self.inner.lock_idle();
        let mut unbound = 0;
        for handle in idle.iter_mut().filter(|h| h.bound_key.as_deref() == Some(key)) {
            handle.engine.shutdown();
            handle.clear_binding();
            unbound += 1;
        }
        if unbound > 0 {
            tracing::debug!(key, unbound, "Unbound idle engines");
        }
        unbound
    }

    /// Destroy idle engines beyond the core size that have not been used
    /// for `max_idle`.
    pub fn trim_idle(&self, max_idle: Duration) -> usize {
        let cutoff = Utc::now() - chrono::TimeDelta::from_std(max_idle).unwrap_or(chrono::TimeDelta::MAX);
        let mut removed = Vec::new();
        {
            let mut idle = self.inner.lock_idle();
            let live = idle.len() + self.inner.active.load(Ordering::Acquire);
            let mut excess = live.saturating_sub(self.inner.config.core_size);
            let mut i = 0;
            while excess > 0 && i < idle.len() {
                if idle[i].last_used_at < cutoff {
                    if let Some(handle) = idle.remove(i) {
                        removed.push(handle);
                    }
                    excess -= 1;
                } else {
                    i += 1;
                }
            }
        }
        let count = removed.len();
        for handle in removed {
            self.inner.destroy(handle);
        }
        count
    }

    /// Reject future acquisitions and destroy idle engines. Leased engines
    /// are destroyed when their lease is dropped. Returns the number of idle
    /// engines destroyed.
    pub fn shutdown(&self) -> usize {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.inner.permits.close();
        let drained: Vec<_> = self.inner.lock_idle().drain(..).collect();
        let count = drained.len();
        for handle in drained {
            self.inner.destroy(handle);
        }
        tracing::info!(destroyed = count, "Engine pool shut down");
        count
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self.inner.lock_idle().len();
        let active = self.inner.active.load(Ordering::Acquire);
        PoolStatus {
            total: idle + active,
            active,
            idle,
            core_size: self.inner.config.core_size,
            max_size: self.inner.config.max_size,
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            shut_down: self.inner.shut_down.load(Ordering::Acquire),
        }
    }
}

impl<F: EngineFactory> RegistryListener for EnginePool<F> {
    fn on_unloaded(&self, key: &str) {
        self.unbind(key);
    }
}

/// Exclusive use of one pooled engine. Returned to the pool on drop.
pub struct EngineLease<F: EngineFactory> {
    handle: Option<EngineHandle<F::Engine>>,
    pool: Arc<PoolInner<F>>,
    _permit: OwnedSemaphorePermit,
}

impl<F: EngineFactory> EngineLease<F> {
    fn handle(&mut self) -> Result<&mut EngineHandle<F::Engine>, AppError> {
        // Only `Drop` takes the handle out.
        self.handle
            .as_mut()
            .ok_or_else(|| AppError::Generic("engine lease used after release".into()))
    }

    pub fn engine_id(&self) -> u64 {
        self.handle.as_ref().map_or(0, |h| h.id)
    }

    pub fn bound_key(&self) -> Option<&str> {
        self.handle.as_ref().and_then(|h| h.bound_key.as_deref())
    }

    /// Bind the engine to `plugin`, skipping `init` when it already runs
    /// the same checksum of the same resolver.
    pub async fn bind(&mut self, plugin: &LoadedPlugin<ProgramOf<F>>) -> Result<(), AppError> {
        let descriptor = &plugin.descriptor;
        let handle = self.handle()?;
        if handle.is_bound_to(&descriptor.key)
            && handle.bound_checksum.as_deref() == Some(descriptor.checksum.as_str())
        {
            return Ok(());
        }

        handle.clear_binding();
        handle
            .engine
            .init(&descriptor.key, Arc::clone(&plugin.program), &plugin.config)
            .await?;
        handle.bound_key = Some(descriptor.key.clone());
        handle.bound_checksum = Some(descriptor.checksum.clone());
        handle.initialized = true;
        tracing::debug!(engine_id = handle.id, key = %descriptor.key, "Engine bound");
        Ok(())
    }

    pub async fn execute(&mut self, call: ResolverCall) -> Result<ResolverOutput, AppError> {
        let handle = self.handle()?;
        if !handle.initialized {
            return Err(AppError::Generic(format!(
                "engine {} executed before bind",
                handle.id
            )));
        }
        let result = handle.engine.execute(call).await;
        handle.last_used_at = Utc::now();
        result
    }
}

impl<F: EngineFactory> Drop for EngineLease<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Capability;
    use crate::testutil::{MockEngineFactory, mock_loaded_plugin};

    fn pool(core: usize, max: usize) -> (EnginePool<MockEngineFactory>, MockEngineFactory) {
        let factory = MockEngineFactory::new();
        let pool = EnginePool::new(
            factory.clone(),
            PoolConfig {
                core_size: core,
                max_size: max,
            },
        )
        .unwrap();
        (pool, factory)
    }

    #[test]
    fn test_pool_prewarms_core() {
        let (pool, factory) = pool(2, 4);
        let status = pool.status();
        assert_eq!(status.idle, 2);
        assert_eq!(status.active, 0);
        assert_eq!(factory.created(), 2);
    }

    #[test]
    fn test_invalid_sizing_rejected() {
        let result = EnginePool::new(
            MockEngineFactory::new(),
            PoolConfig {
                core_size: 3,
                max_size: 2,
            },
        );
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_then_grows() {
        let (pool, factory) = pool(1, 3);
        let a = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        let b = pool.acquire("b", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.status().active, 2);

        drop(a);
        drop(b);
        let status = pool.status();
        assert_eq!(status.idle, 2);
        assert_eq!(status.active, 0);
        assert_eq!(status.total, 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_saturated() {
        let (pool, _) = pool(1, 1);
        let _held = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        let second = pool.acquire("b", Duration::from_millis(50)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_engine() {
        let (pool, factory) = pool(1, 1);
        let held = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        let id = held.engine_id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("b", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let lease = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(lease.engine_id(), id);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_bind_is_skipped_for_same_checksum() {
        let (pool, factory) = pool(1, 1);
        let plugin = mock_loaded_plugin("a", &[Capability::Search]);

        let mut lease = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        lease.bind(&plugin).await.unwrap();
        drop(lease);

        let mut lease = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(lease.bound_key(), Some("a"));
        lease.bind(&plugin).await.unwrap();
        assert_eq!(factory.inits(), 1);
    }

    #[tokio::test]
    async fn test_prefers_engine_bound_to_key() {
        let (pool, _) = pool(2, 2);
        let a_plugin = mock_loaded_plugin("a", &[Capability::Search]);
        let b_plugin = mock_loaded_plugin("b", &[Capability::Search]);

        let mut first = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        let mut second = pool.acquire("b", Duration::from_millis(50)).await.unwrap().unwrap();
        first.bind(&a_plugin).await.unwrap();
        second.bind(&b_plugin).await.unwrap();
        let b_id = second.engine_id();
        drop(second);
        drop(first);

        let lease = pool.acquire("b", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(lease.engine_id(), b_id);
    }

    #[tokio::test]
    async fn test_failed_reset_destroys_and_replenishes() {
        let (pool, factory) = pool(1, 2);
        let lease = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        let id = lease.engine_id();
        factory.fail_next_reset();
        drop(lease);

        let status = pool.status();
        assert_eq!(status.destroyed, 1);
        assert_eq!(status.idle, 1);
        let lease = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_ne!(lease.engine_id(), id);
    }

    #[tokio::test]
    async fn test_unbind_clears_idle_bindings() {
        let (pool, _) = pool(1, 1);
        let plugin = mock_loaded_plugin("a", &[Capability::Search]);
        let mut lease = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        lease.bind(&plugin).await.unwrap();
        drop(lease);

        assert_eq!(pool.unbind("a"), 1);
        let lease = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(lease.bound_key(), None);
    }

    #[tokio::test]
    async fn test_trim_idle_keeps_core() {
        let (pool, _) = pool(1, 3);
        let a = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();
        let b = pool.acquire("b", Duration::from_millis(50)).await.unwrap().unwrap();
        let c = pool.acquire("c", Duration::from_millis(50)).await.unwrap().unwrap();
        drop((a, b, c));
        assert_eq!(pool.status().idle, 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.trim_idle(Duration::from_millis(10)), 2);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_and_destroys() {
        let (pool, _) = pool(2, 3);
        let lease = pool.acquire("a", Duration::from_millis(50)).await.unwrap().unwrap();

        assert_eq!(pool.shutdown(), 1);
        assert!(matches!(
            pool.acquire("a", Duration::from_millis(50)).await,
            Err(AppError::PoolShutdown)
        ));

        drop(lease);
        let status = pool.status();
        assert_eq!(status.total, 0);
        assert_eq!(status.destroyed, 2);
        assert!(status.shut_down);
    }
}
