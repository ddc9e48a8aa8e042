//! Two-tier cache: a size-bounded in-process LRU in front of JSON files.
//!
//! The memory tier is a moka cache weighted by serialized size with LRU
//! eviction and per-entry expiry. The disk tier stores one envelope per key
//! (see [`disk`]). Reads fall through memory to disk and promote disk hits.

pub mod disk;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use disk::{DiskEnvelope, DiskRead, DiskTier};

/// Which tiers a `put` writes, and in which order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierPolicy {
    MemoryOnly,
    DiskOnly,
    MemoryFirst,
    DiskFirst,
}

impl TierPolicy {
    fn writes_memory(&self) -> bool {
        !matches!(self, TierPolicy::DiskOnly)
    }

    fn writes_disk(&self) -> bool {
        !matches!(self, TierPolicy::MemoryOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Memory,
    Disk,
}

/// A cached value with its bookkeeping, as returned by [`TieredCache::get_entry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl: Duration,
    pub size_bytes: u64,
    /// The tier the read was served from.
    pub tier: Tier,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub memory_budget_bytes: u64,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memory_budget_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Snapshot of cache state. All counters are monotonic; `memory` and
/// `disk` reflect current contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory: TierStats,
    pub disk: TierStats,
    pub memory_budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removes: u64,
    pub errors: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub disk_reads: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
}

impl CacheStats {
    /// Entries summed across tiers. A key held in both tiers counts twice.
    pub fn entries(&self) -> u64 {
        self.memory.entries + self.disk.entries
    }

    pub fn bytes_used(&self) -> u64 {
        self.memory.bytes + self.disk.bytes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub memory_purged: u64,
    pub disk_purged: u64,
    pub corrupted: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.memory_purged + self.disk_purged + self.corrupted
    }
}

// ---------------------------------------------------------------------------
// Memory tier internals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Arc<serde_json::Value>,
    created_at: DateTime<Utc>,
    ttl: Duration,
    size_bytes: u64,
    last_accessed_ms: Arc<AtomicI64>,
}

impl MemoryEntry {
    fn remaining(&self, now: DateTime<Utc>) -> Duration {
        expires_at(self.created_at, self.ttl)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.last_accessed_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn last_accessed(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_accessed_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }
}

struct EntryExpiry;

impl Expiry<String, MemoryEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.remaining(Utc::now()))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.remaining(Utc::now()))
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    disk_reads: AtomicU64,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn expires_at(created_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn is_expired(created_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    now > expires_at(created_at, ttl)
}

// ---------------------------------------------------------------------------
// TieredCache
// ---------------------------------------------------------------------------

pub struct TieredCache {
    memory: Cache<String, MemoryEntry>,
    disk: DiskTier,
    config: CacheConfig,
    counters: Arc<Counters>,
}

impl TieredCache {
    /// Open the cache, creating the directory if needed.
    ///
    /// An unwritable directory is a configuration error.
    pub async fn open(config: CacheConfig) -> Result<Self, AppError> {
        let disk = DiskTier::new(&config.dir);
        disk.ensure_writable().await?;

        let counters = Arc::new(Counters::default());
        let listener_counters = counters.clone();
        let memory = Cache::builder()
            .max_capacity(config.memory_budget_bytes)
            .weigher(|_key: &String, entry: &MemoryEntry| -> u32 {
                u32::try_from(entry.size_bytes).unwrap_or(u32::MAX)
            })
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(EntryExpiry)
            .eviction_listener(move |key: Arc<String>, _entry: MemoryEntry, cause| match cause {
                RemovalCause::Size => {
                    bump(&listener_counters.evictions);
                    tracing::debug!(key = %key, "Evicted from memory tier");
                }
                RemovalCause::Expired => bump(&listener_counters.expirations),
                RemovalCause::Explicit | RemovalCause::Replaced => {}
            })
            .build();

        tracing::debug!(
            dir = %config.dir.display(),
            budget = config.memory_budget_bytes,
            "Opened tiered cache"
        );

        Ok(Self {
            memory,
            disk,
            config,
            counters,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store `value` under `key` for `ttl` in the tiers selected by `policy`.
    ///
    /// A value whose serialized size exceeds the whole memory budget is
    /// never admitted to memory. Any copy in a tier the policy does not
    /// write is dropped so the next read observes this value.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        policy: TierPolicy,
    ) -> Result<(), AppError> {
        if ttl.is_zero() {
            return Err(AppError::CacheError("TTL must be positive".into()));
        }
        let value = serde_json::to_value(value)?;
        let size_bytes = serde_json::to_vec(&value)?.len() as u64;
        let now = Utc::now();
        bump(&self.counters.puts);

        let admit_memory = policy.writes_memory() && size_bytes <= self.config.memory_budget_bytes;
        if policy.writes_memory() && !admit_memory {
            tracing::debug!(key, size_bytes, "Entry larger than memory budget, skipping memory tier");
        }

        let envelope = DiskEnvelope {
            key: key.to_string(),
            created_at: now,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            size_bytes,
            value,
        };

        match policy {
            TierPolicy::DiskFirst => {
                self.write_disk(&envelope).await?;
                self.write_memory(&envelope, admit_memory).await;
            }
            _ => {
                self.write_memory(&envelope, admit_memory).await;
                if policy.writes_disk() {
                    self.write_disk(&envelope).await?;
                } else {
                    self.disk.remove(key).await;
                }
            }
        }
        Ok(())
    }

    async fn write_memory(&self, envelope: &DiskEnvelope, admit: bool) {
        if admit {
            let entry = memory_entry(envelope, Utc::now());
            self.memory.insert(envelope.key.clone(), entry).await;
        } else {
            self.memory.invalidate(&envelope.key).await;
        }
        self.memory.run_pending_tasks().await;
    }

    async fn write_disk(&self, envelope: &DiskEnvelope) -> Result<(), AppError> {
        self.disk.write(envelope).await.inspect_err(|e| {
            bump(&self.counters.errors);
            tracing::warn!(key = %envelope.key, error = %e, "Disk cache write failed");
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// Read through memory then disk. Disk hits are promoted into memory.
    ///
    /// Expired, corrupt or undeserializable entries are purged and reported
    /// as a miss.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = Utc::now();

        if let Some(entry) = self.memory.get(key).await {
            if is_expired(entry.created_at, entry.ttl, now) {
                self.memory.invalidate(key).await;
                bump(&self.counters.expirations);
            } else {
                match serde_json::from_value::<T>((*entry.value).clone()) {
                    Ok(value) => {
                        entry.touch(now);
                        bump(&self.counters.hits);
                        bump(&self.counters.memory_hits);
                        return Some(CacheEntry {
                            key: key.to_string(),
                            value,
                            created_at: entry.created_at,
                            last_accessed_at: entry.last_accessed(),
                            ttl: entry.ttl,
                            size_bytes: entry.size_bytes,
                            tier: Tier::Memory,
                        });
                    }
                    Err(e) => {
                        bump(&self.counters.errors);
                        tracing::warn!(key, error = %e, "Cached value has unexpected shape");
                        self.memory.invalidate(key).await;
                    }
                }
            }
        }

        bump(&self.counters.disk_reads);
        let envelope = match self.disk.read(key).await {
            DiskRead::Found(envelope) => envelope,
            DiskRead::Missing | DiskRead::KeyMismatch(_) => {
                bump(&self.counters.misses);
                return None;
            }
            DiskRead::Corrupt(reason) => {
                bump(&self.counters.errors);
                bump(&self.counters.misses);
                tracing::warn!(key, %reason, "Removed corrupt cache file");
                return None;
            }
        };

        if envelope.is_expired(now) {
            self.disk.remove(key).await;
            bump(&self.counters.expirations);
            bump(&self.counters.misses);
            return None;
        }

        let value = match serde_json::from_value::<T>(envelope.value.clone()) {
            Ok(value) => value,
            Err(e) => {
                self.disk.remove(key).await;
                bump(&self.counters.errors);
                bump(&self.counters.misses);
                tracing::warn!(key, error = %e, "Removed undeserializable cache file");
                return None;
            }
        };

        if envelope.size_bytes <= self.config.memory_budget_bytes {
            self.write_memory(&envelope, true).await;
        }
        bump(&self.counters.hits);
        bump(&self.counters.disk_hits);

        Some(CacheEntry {
            key: key.to_string(),
            value,
            created_at: envelope.created_at,
            last_accessed_at: now,
            ttl: envelope.ttl(),
            size_bytes: envelope.size_bytes,
            tier: Tier::Disk,
        })
    }

    /// Remove `key` from both tiers. Returns true if either tier held it.
    pub async fn remove(&self, key: &str) -> bool {
        let in_memory = self.memory.remove(key).await.is_some();
        self.memory.run_pending_tasks().await;
        let on_disk = self.disk.remove(key).await;
        if in_memory || on_disk {
            bump(&self.counters.removes);
        }
        in_memory || on_disk
    }

    /// Empty both tiers.
    pub async fn clear(&self) -> Result<(), AppError> {
        let keys: Vec<Arc<String>> = self.memory.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.memory.invalidate(key.as_str()).await;
        }
        self.memory.invalidate_all();
        self.memory.run_pending_tasks().await;
        let removed = self.disk.clear().await?;
        tracing::info!(disk_removed = removed, "Cache cleared");
        Ok(())
    }

    pub fn contains_in_memory(&self, key: &str) -> bool {
        self.memory.contains_key(key)
    }

    /// Purge expired entries from both tiers and corrupt files from disk.
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let now = Utc::now();
        let before = self.counters.expirations.load(Ordering::Relaxed);
        self.memory.run_pending_tasks().await;

        let expired: Vec<Arc<String>> = self
            .memory
            .iter()
            .filter(|(_, entry)| is_expired(entry.created_at, entry.ttl, now))
            .map(|(key, _)| key)
            .collect();
        let stragglers = expired.len() as u64;
        for key in expired {
            self.memory.invalidate(key.as_str()).await;
        }
        self.memory.run_pending_tasks().await;
        // Entries moka expired itself were counted by the eviction listener.
        let memory_purged =
            self.counters.expirations.load(Ordering::Relaxed) - before + stragglers;
        self.counters
            .expirations
            .fetch_add(stragglers, Ordering::Relaxed);

        let (disk_purged, corrupted) = self.disk.purge(now).await?;
        self.counters
            .expirations
            .fetch_add(disk_purged, Ordering::Relaxed);
        self.counters
            .errors
            .fetch_add(corrupted, Ordering::Relaxed);

        Ok(SweepReport {
            memory_purged,
            disk_purged,
            corrupted,
        })
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
                match cache.sweep().await {
                    Ok(report) => tracing::info!(
                        memory_purged = report.memory_purged,
                        disk_purged = report.disk_purged,
                        corrupted = report.corrupted,
                        "Cache sweep finished"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Cache sweep failed"),
                }
            }
            tracing::debug!("Cache sweeper stopped");
        })
    }

    pub async fn stats(&self) -> CacheStats {
        self.memory.run_pending_tasks().await;
        let (disk_entries, disk_bytes) = self.disk.usage().await;
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            memory: TierStats {
                entries: self.memory.entry_count(),
                bytes: self.memory.weighted_size(),
            },
            disk: TierStats {
                entries: disk_entries,
                bytes: disk_bytes,
            },
            memory_budget_bytes: self.config.memory_budget_bytes,
            hits: load(&c.hits),
            misses: load(&c.misses),
            puts: load(&c.puts),
            removes: load(&c.removes),
            errors: load(&c.errors),
            evictions: load(&c.evictions),
            expirations: load(&c.expirations),
            disk_reads: load(&c.disk_reads),
            memory_hits: load(&c.memory_hits),
            disk_hits: load(&c.disk_hits),
        }
    }
}

fn memory_entry(envelope: &DiskEnvelope, now: DateTime<Utc>) -> MemoryEntry {
    MemoryEntry {
        value: Arc::new(envelope.value.clone()),
        created_at: envelope.created_at,
        ttl: envelope.ttl(),
        size_bytes: envelope.size_bytes,
        last_accessed_ms: Arc::new(AtomicI64::new(now.timestamp_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(dir: &tempfile::TempDir, budget: u64) -> TieredCache {
        TieredCache::open(CacheConfig::new(dir.path()).with_memory_budget(budget))
            .await
            .unwrap()
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_put_then_get_returns_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, 1024 * 1024).await;

        cache
            .put("k", &vec![1, 2, 3], MINUTE, TierPolicy::MemoryFirst)
            .await
            .unwrap();
        assert_eq!(cache.get::<Vec<i32>>("k").await, Some(vec![1, 2, 3]));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.memory.entries, 1);
        assert_eq!(stats.disk.entries, 1);
    }

    #[tokio::test]
    async fn test_put_overwrites_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, 1024 * 1024).await;

        cache.put("k", &"old", MINUTE, TierPolicy::MemoryFirst).await.unwrap();
        cache.put("k", &"new", MINUTE, TierPolicy::DiskOnly).await.unwrap();
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, 1024 * 1024).await;

        cache
            .put("k", &"v", Duration::from_millis(80), TierPolicy::MemoryFirst)
            .await
            .unwrap();
        assert!(cache.get::<String>("k").await.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get::<String>("k").await, None);
        // The disk copy was purged too, so the value never comes back.
        assert_eq!(cache.get::<String>("k").await, None);
        assert!(!cache.disk.path_for("k").exists());

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        // "value-N" serializes to 9 bytes; the budget holds exactly three.
        let cache = open(&dir, 27).await;

        for i in 1..=3 {
            cache
                .put(&format!("k{i}"), &format!("value-{i}"), MINUTE, TierPolicy::MemoryOnly)
                .await
                .unwrap();
        }
        assert!(cache.get::<String>("k1").await.is_some());

        cache
            .put("k4", &"value-4", MINUTE, TierPolicy::MemoryOnly)
            .await
            .unwrap();

        assert!(cache.contains_in_memory("k1"));
        assert!(!cache.contains_in_memory("k2"));
        assert!(cache.contains_in_memory("k3"));
        assert!(cache.contains_in_memory("k4"));

        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 1);
        assert!(stats.memory.bytes <= 27);
    }

    #[tokio::test]
    async fn test_oversized_entry_bypasses_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, 16).await;

        let big = "x".repeat(64);
        cache.put("big", &big, MINUTE, TierPolicy::MemoryFirst).await.unwrap();
        assert!(!cache.contains_in_memory("big"));
        assert_eq!(cache.get::<String>("big").await, Some(big));
        assert!(!cache.contains_in_memory("big"));
    }

    #[tokio::test]
    async fn test_disk_hit_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, 1024 * 1024).await;

        cache.put("k", &42u32, MINUTE, TierPolicy::DiskOnly).await.unwrap();
        assert!(!cache.contains_in_memory("k"));

        let first = cache.get_entry::<u32>("k").await.unwrap();
        assert_eq!(first.tier, Tier::Disk);
        assert_eq!(cache.stats().await.disk_reads, 1);

        let second = cache.get_entry::<u32>("k").await.unwrap();
        assert_eq!(second.tier, Tier::Memory);
        assert_eq!(second.created_at, first.created_at);

        let stats = cache.stats().await;
        assert_eq!(stats.disk_reads, 1);
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_hits, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_deleted_and_missed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, 1024 * 1024).await;

        let path = cache.disk.path_for("k");
        std::fs::write(&path, b"{not json").unwrap();

        assert_eq!(cache.get::<String>("k").await, None);
        assert!(!path.exists());

        let stats = cache.stats().await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear_reset_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, 1024 * 1024).await;

        for i in 0..5 {
            cache
                .put(&format!("k{i}"), &i, MINUTE, TierPolicy::MemoryFirst)
                .await
                .unwrap();
        }
        assert!(cache.remove("k0").await);
        assert!(!cache.remove("k0").await);
        assert_eq!(cache.get::<i32>("k0").await, None);

        cache.clear().await.unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.entries(), 0);
        assert_eq!(stats.bytes_used(), 0);
        assert_eq!(stats.removes, 1);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(&dir, 1024 * 1024).await;

        cache
            .put("short", &1, Duration::from_millis(50), TierPolicy::DiskOnly)
            .await
            .unwrap();
        cache.put("long", &2, MINUTE, TierPolicy::DiskOnly).await.unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"???").unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let report = cache.sweep().await.unwrap();
        assert_eq!(report.disk_purged, 1);
        assert_eq!(report.corrupted, 1);
        assert_eq!(cache.get::<i32>("long").await, Some(2));
    }

    #[tokio::test]
    async fn test_open_fails_on_unwritable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();

        let result = TieredCache::open(CacheConfig::new(file.join("cache"))).await;
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
