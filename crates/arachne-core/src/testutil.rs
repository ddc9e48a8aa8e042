//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` or atomics for interior mutability,
//! allowing test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, LoadError};
use crate::models::{
    Capability, DetailRecord, Episode, Listing, PlayableSource, Playlist, ResolverCall,
    ResolverOutput, VodItem,
};
use crate::plugin::{
    LinkedPackage, LoadedPlugin, PackageManifest, PluginDescriptor, SafetyClassification,
};
use crate::traits::{Engine, EngineFactory, PackageSource, PluginLinker, RegistryListener};

// ---------------------------------------------------------------------------
// Mock packages
// ---------------------------------------------------------------------------

/// How a mock resolver behaves when executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockBehavior {
    /// Sleep this long inside every call.
    #[serde(default)]
    pub delay_ms: u64,
    /// Fail every call.
    #[serde(default)]
    pub fail: bool,
    /// Fail only the first N calls made against this program.
    #[serde(default)]
    pub fail_first: u32,
    /// Return no items from search.
    #[serde(default)]
    pub empty: bool,
}

/// JSON body of a mock package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockPackage {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub version: String,
    pub entry_points: Vec<Capability>,
    #[serde(default = "yes")]
    pub searchable: bool,
    #[serde(default = "yes")]
    pub quick_search: bool,
    #[serde(default)]
    pub behavior: MockBehavior,
}

fn yes() -> bool {
    true
}

/// Serialize a mock package with the given behavior.
pub fn mock_package(
    key: &str,
    version: &str,
    entry_points: &[Capability],
    behavior: MockBehavior,
) -> Vec<u8> {
    let package = MockPackage {
        key: key.to_string(),
        name: format!("Mock {key}"),
        version: version.to_string(),
        entry_points: entry_points.to_vec(),
        searchable: true,
        quick_search: true,
        behavior,
    };
    serde_json::to_vec(&package).unwrap()
}

/// The linked form of a [`MockPackage`].
#[derive(Debug)]
pub struct MockProgram {
    pub key: String,
    pub behavior: MockBehavior,
    failures_left: AtomicU32,
}

impl MockProgram {
    pub fn new(key: &str, behavior: MockBehavior) -> Self {
        Self {
            key: key.to_string(),
            failures_left: AtomicU32::new(behavior.fail_first),
            behavior,
        }
    }
}

/// A loaded mock plugin, as the registry would hand it out.
pub fn mock_loaded_plugin(key: &str, entry_points: &[Capability]) -> LoadedPlugin<MockProgram> {
    LoadedPlugin {
        descriptor: PluginDescriptor {
            key: key.to_string(),
            display_name: format!("Mock {key}"),
            version: "1.0.0".to_string(),
            source_uri: format!("mock://{key}"),
            local_path: String::new(),
            size_bytes: 0,
            checksum: crate::models::compute_hash(key),
            entry_points: entry_points.to_vec(),
            loaded_at: Utc::now(),
            safety: SafetyClassification::Safe,
            searchable: true,
            quick_search: true,
        },
        program: Arc::new(MockProgram::new(key, MockBehavior::default())),
        config: serde_json::Value::Null,
    }
}

// ---------------------------------------------------------------------------
// MockLinker
// ---------------------------------------------------------------------------

/// Links [`MockPackage`] JSON.
#[derive(Debug, Clone, Default)]
pub struct MockLinker;

impl MockLinker {
    fn parse(bytes: &[u8]) -> Result<MockPackage, LoadError> {
        serde_json::from_slice(bytes).map_err(|e| LoadError::InvalidPackage(e.to_string()))
    }
}

impl PluginLinker for MockLinker {
    type Program = MockProgram;

    fn inspect(&self, bytes: &[u8]) -> Result<PackageManifest, LoadError> {
        let package = Self::parse(bytes)?;
        Ok(PackageManifest {
            display_name: package.name,
            key: package.key,
            version: package.version,
            entry_points: package.entry_points,
            searchable: package.searchable,
            quick_search: package.quick_search,
        })
    }

    fn validate_and_link(&self, bytes: &[u8]) -> Result<LinkedPackage<MockProgram>, LoadError> {
        let manifest = self.inspect(bytes)?;
        if manifest.entry_points.is_empty() {
            return Err(LoadError::EntryPointNotFound(manifest.key));
        }
        let package = Self::parse(bytes)?;
        Ok(LinkedPackage {
            program: MockProgram::new(&package.key, package.behavior),
            manifest,
        })
    }
}

// ---------------------------------------------------------------------------
// MockPackageSource
// ---------------------------------------------------------------------------

/// In-memory package source keyed by URI.
#[derive(Clone, Default)]
pub struct MockPackageSource {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    reads: Arc<AtomicUsize>,
    delay_ms: Arc<AtomicU64>,
}

impl MockPackageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: &str, bytes: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .unwrap()
            .insert(uri.to_string(), bytes.into());
    }

    pub fn remove(&self, uri: &str) {
        self.files.lock().unwrap().remove(uri);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Sleep this long before answering every read.
    pub fn set_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(ms, Ordering::SeqCst);
    }
}

impl PackageSource for MockPackageSource {
    async fn read(&self, uri: &str) -> Result<Vec<u8>, LoadError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        self.files
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| LoadError::SourceUnavailable(format!("no such package: {uri}")))
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyTracker
// ---------------------------------------------------------------------------

/// Records how many resolver calls run at once.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyTracker {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyTracker {
    pub fn enter(&self) -> InFlight {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self.current.clone())
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the tracker when the call ends, including on cancellation.
pub struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockEngine / MockEngineFactory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FactoryState {
    created: AtomicUsize,
    inits: AtomicUsize,
    executions: AtomicUsize,
    shutdowns: AtomicUsize,
    fail_next_reset: AtomicBool,
}

/// Factory for [`MockEngine`]s sharing one tracker and call counters.
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    state: Arc<FactoryState>,
    tracker: ConcurrencyTracker,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> ConcurrencyTracker {
        self.tracker.clone()
    }

    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.state.inits.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.state.executions.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    /// Make the next `reset` on any engine fail.
    pub fn fail_next_reset(&self) {
        self.state.fail_next_reset.store(true, Ordering::SeqCst);
    }
}

impl EngineFactory for MockEngineFactory {
    type Engine = MockEngine;

    fn create(&self) -> Result<MockEngine, AppError> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockEngine {
            key: None,
            program: None,
            state: self.state.clone(),
            tracker: self.tracker.clone(),
        })
    }
}

pub struct MockEngine {
    key: Option<String>,
    program: Option<Arc<MockProgram>>,
    state: Arc<FactoryState>,
    tracker: ConcurrencyTracker,
}

impl Engine for MockEngine {
    type Program = MockProgram;

    async fn init(
        &mut self,
        key: &str,
        program: Arc<MockProgram>,
        _config: &serde_json::Value,
    ) -> Result<(), AppError> {
        self.state.inits.fetch_add(1, Ordering::SeqCst);
        self.key = Some(key.to_string());
        self.program = Some(program);
        Ok(())
    }

    async fn execute(&mut self, call: ResolverCall) -> Result<ResolverOutput, AppError> {
        let (Some(key), Some(program)) = (self.key.clone(), self.program.clone()) else {
            return Err(AppError::Generic("mock engine not initialized".into()));
        };
        let _in_flight = self.tracker.enter();
        self.state.executions.fetch_add(1, Ordering::SeqCst);

        if program.behavior.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(program.behavior.delay_ms)).await;
        }

        let scheduled_failure = program
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if program.behavior.fail || scheduled_failure {
            return Err(AppError::ResolverCallFailure {
                key,
                message: "mock failure".into(),
            });
        }

        let item = |name: String| VodItem {
            id: format!("{key}-1"),
            name,
            pic: String::new(),
            remark: key.clone(),
        };
        let output = match call {
            ResolverCall::Home { .. } | ResolverCall::Category { .. } => {
                ResolverOutput::Listing(Listing {
                    items: vec![item(format!("{key} home"))],
                    ..Listing::default()
                })
            }
            ResolverCall::Search { keyword, .. } => {
                let items = if program.behavior.empty {
                    vec![]
                } else {
                    vec![item(format!("{keyword} @ {key}"))]
                };
                ResolverOutput::Listing(Listing {
                    items,
                    ..Listing::default()
                })
            }
            ResolverCall::Detail { ids } => ResolverOutput::Details(
                ids.into_iter()
                    .map(|id| DetailRecord {
                        name: format!("{key} {id}"),
                        playlists: vec![Playlist {
                            flag: "main".into(),
                            episodes: vec![Episode {
                                name: "1".into(),
                                id: format!("{id}/1"),
                            }],
                        }],
                        id,
                        ..DetailRecord::default()
                    })
                    .collect(),
            ),
            ResolverCall::Player { flag, id, .. } => ResolverOutput::Playable(PlayableSource {
                url: format!("https://media.example/{id}.m3u8"),
                parse: false,
                flag,
                headers: Default::default(),
            }),
        };
        Ok(output)
    }

    fn reset(&mut self) -> Result<(), AppError> {
        if self.state.fail_next_reset.swap(false, Ordering::SeqCst) {
            return Err(AppError::Generic("mock reset failure".into()));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.key = None;
        self.program = None;
    }
}

// ---------------------------------------------------------------------------
// RecordingListener
// ---------------------------------------------------------------------------

/// Registry listener that records unloaded keys.
#[derive(Clone, Default)]
pub struct RecordingListener {
    pub unloaded: Arc<Mutex<Vec<String>>>,
}

impl RegistryListener for RecordingListener {
    fn on_unloaded(&self, key: &str) {
        self.unloaded.lock().unwrap().push(key.to_string());
    }
}
