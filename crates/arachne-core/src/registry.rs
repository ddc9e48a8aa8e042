//! Plugin loader and registry.
//!
//! Packages are read through a [`PackageSource`], staged on disk, verified
//! (size, SHA-256, static scan) and linked by a [`PluginLinker`]. Only a
//! fully validated package ever becomes visible; a failed update leaves the
//! previous descriptor active.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use crate::error::{LoadError, UpdateError};
use crate::models::{Capability, compute_bytes_hash};
use crate::plugin::{
    ChecksumRef, LinkedPackage, LoadedPlugin, PackageSpec, PluginDescriptor, PluginState,
    PluginSummary, RegistryStatus, SafetyClassification, UpdateInfo, normalize_checksum,
};
use crate::scan::{self, ScanRules};
use crate::traits::{PackageSource, PluginLinker, RegistryListener};

const STAGING_DIR: &str = ".staging";
const PACKAGE_EXT: &str = "pkg";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Validated packages live under `<plugin_dir>/<key>/<checksum>.pkg`.
    pub plugin_dir: PathBuf,
    pub max_package_bytes: u64,
    pub scan_rules: ScanRules,
    /// Refuse packages the scan classifies as `Warning`.
    pub reject_warnings: bool,
    /// Accept updates that expose fewer capabilities than the installed one.
    pub allow_capability_regression: bool,
}

impl RegistryConfig {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            max_package_bytes: 16 * 1024 * 1024,
            scan_rules: ScanRules::default(),
            reject_warnings: false,
            allow_capability_regression: false,
        }
    }
}

/// A package that passed every check, waiting to be committed.
struct Verified<P> {
    staged: PathBuf,
    size_bytes: u64,
    checksum: String,
    safety: SafetyClassification,
    linked: LinkedPackage<P>,
}

pub struct PluginRegistry<L: PluginLinker, S: PackageSource> {
    linker: L,
    source: S,
    config: RegistryConfig,
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin<L::Program>>>>,
    specs: RwLock<HashMap<String, PackageSpec>>,
    states: Mutex<HashMap<String, PluginState>>,
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
}

impl<L: PluginLinker, S: PackageSource> PluginRegistry<L, S> {
    pub fn new(linker: L, source: S, config: RegistryConfig) -> Self {
        Self {
            linker,
            source,
            config,
            plugins: RwLock::new(HashMap::new()),
            specs: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a listener for unload notifications.
    pub fn subscribe(&self, listener: Arc<dyn RegistryListener>) {
        write(&self.listeners).push(listener);
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Pure lookup; never triggers loading.
    pub fn get(&self, key: &str) -> Option<PluginDescriptor> {
        read(&self.plugins).get(key).map(|p| p.descriptor.clone())
    }

    pub fn resolve(&self, key: &str) -> Option<Arc<LoadedPlugin<L::Program>>> {
        read(&self.plugins).get(key).cloned()
    }

    pub fn state(&self, key: &str) -> PluginState {
        self.lock_states()
            .get(key)
            .copied()
            .unwrap_or(PluginState::Unloaded)
    }

    /// Descriptors of every loaded plugin, ordered by key.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        let mut all: Vec<_> = read(&self.plugins)
            .values()
            .map(|p| p.descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn status(&self) -> RegistryStatus {
        let states = self.lock_states().clone();
        let plugins: Vec<PluginSummary> = self
            .descriptors()
            .into_iter()
            .map(|d| PluginSummary {
                state: states.get(&d.key).copied().unwrap_or(PluginState::Loaded),
                key: d.key,
                display_name: d.display_name,
                version: d.version,
                safety: d.safety,
                entry_points: d.entry_points,
                searchable: d.searchable,
                quick_search: d.quick_search,
                loaded_at: d.loaded_at,
            })
            .collect();
        RegistryStatus {
            loaded: plugins.len(),
            in_flight: states.values().filter(|s| s.is_in_flight()).count(),
            plugins,
        }
    }

    // -----------------------------------------------------------------------
    // Load / unload
    // -----------------------------------------------------------------------

    /// Load and register a package. Loading an already-loaded key returns
    /// the current descriptor unchanged.
    pub async fn load(&self, spec: PackageSpec) -> Result<PluginDescriptor, LoadError> {
        let key = spec.key.clone();
        {
            let mut states = self.lock_states();
            let current = states.get(&key).copied().unwrap_or(PluginState::Unloaded);
            match current {
                PluginState::Loaded => {
                    drop(states);
                    if let Some(descriptor) = self.get(&key) {
                        return Ok(descriptor);
                    }
                    return Err(LoadError::Busy(key));
                }
                PluginState::Validating | PluginState::Updating => {
                    return Err(LoadError::Busy(key));
                }
                PluginState::Unloaded => {
                    states.insert(key.clone(), PluginState::Validating);
                }
            }
        }
        let mut guard = InFlightGuard::new(&self.states, &key, PluginState::Unloaded);

        let outcome = match self.fetch_and_stage(&spec).await {
            Ok(staged) => {
                guard.track(&staged.path);
                self.verify(&spec, staged).await
            }
            Err(e) => Err(e),
        };

        let committed = match outcome {
            Ok(verified) => self.commit(&spec, verified).await,
            Err(e) => Err(e),
        };
        match committed {
            Ok(plugin) => {
                let descriptor = plugin.descriptor.clone();
                write(&self.plugins).insert(key.clone(), plugin);
                write(&self.specs).insert(key.clone(), spec);
                guard.settle(PluginState::Loaded);
                tracing::info!(
                    %key,
                    version = %descriptor.version,
                    safety = %descriptor.safety,
                    "Plugin loaded"
                );
                Ok(descriptor)
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Plugin load failed");
                Err(e)
            }
        }
    }

    /// Remove a loaded plugin and notify listeners. Idempotent; returns
    /// false when nothing was loaded or a load/update is still in flight.
    pub async fn unload(&self, key: &str) -> bool {
        {
            let mut states = self.lock_states();
            let current = states.get(key).copied().unwrap_or(PluginState::Unloaded);
            match current {
                PluginState::Loaded => {
                    states.remove(key);
                }
                PluginState::Unloaded => return false,
                state => {
                    tracing::warn!(key, %state, "Cannot unload plugin while it is in flight");
                    return false;
                }
            }
        }

        let removed = write(&self.plugins).remove(key);
        write(&self.specs).remove(key);
        if let Some(plugin) = &removed {
            let _ = tokio::fs::remove_file(&plugin.descriptor.local_path).await;
        }

        let listeners = read(&self.listeners).clone();
        for listener in listeners {
            listener.on_unloaded(key);
        }
        tracing::info!(key, "Plugin unloaded");
        removed.is_some()
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Compare the installed package with its source. Never applies anything.
    pub async fn check_for_update(&self, key: &str) -> Result<UpdateInfo, UpdateError> {
        let current = self
            .get(key)
            .ok_or_else(|| UpdateError::NotLoaded(key.to_string()))?;
        let spec = read(&self.specs)
            .get(key)
            .cloned()
            .ok_or_else(|| UpdateError::NotLoaded(key.to_string()))?;

        let bytes = self.source.read(&spec.uri).await?;
        let latest_checksum = compute_bytes_hash(&bytes);
        let manifest = self.linker.inspect(&bytes)?;

        Ok(UpdateInfo {
            key: key.to_string(),
            update_available: latest_checksum != current.checksum,
            current_version: current.version,
            latest_version: manifest.version,
            current_checksum: current.checksum,
            latest_checksum,
            checked_at: Utc::now(),
        })
    }

    /// Fetch, stage and validate the latest package, then swap it in.
    ///
    /// On any failure the previous descriptor stays active and the staged
    /// file is removed.
    pub async fn apply_update(&self, key: &str) -> Result<PluginDescriptor, UpdateError> {
        self.transition(key, PluginState::Updating)?;
        let mut guard = InFlightGuard::new(&self.states, key, PluginState::Loaded);

        let current = self.resolve(key);
        let spec = read(&self.specs).get(key).cloned();
        let (Some(current), Some(spec)) = (current, spec) else {
            return Err(UpdateError::NotLoaded(key.to_string()));
        };

        let staged = match self.fetch_and_stage(&spec).await {
            Ok(staged) => staged,
            Err(e) => {
                tracing::warn!(key, error = %e, "Update source unavailable");
                return Err(e.into());
            }
        };
        guard.track(&staged.path);
        self.transition(key, PluginState::Validating)?;

        match self.verify_update(&spec, &current.descriptor, staged).await {
            Ok(Some(verified)) => {
                let plugin = self.commit(&spec, verified).await?;
                let descriptor = plugin.descriptor.clone();
                write(&self.plugins).insert(key.to_string(), plugin);
                guard.settle(PluginState::Loaded);

                if descriptor.local_path != current.descriptor.local_path {
                    let _ = tokio::fs::remove_file(&current.descriptor.local_path).await;
                }
                tracing::info!(
                    key,
                    from = %current.descriptor.version,
                    to = %descriptor.version,
                    "Plugin updated"
                );
                Ok(descriptor)
            }
            Ok(None) => {
                guard.settle(PluginState::Loaded);
                tracing::debug!(key, "Plugin already up to date");
                Ok(current.descriptor.clone())
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Update rejected, keeping current version");
                Err(e)
            }
        }
    }

    /// `Ok(None)` when the source still serves the installed checksum.
    async fn verify_update(
        &self,
        spec: &PackageSpec,
        current: &PluginDescriptor,
        staged: Staged,
    ) -> Result<Option<Verified<L::Program>>, UpdateError> {
        if staged.checksum == current.checksum {
            remove_quietly(&staged.path).await;
            return Ok(None);
        }

        let verified = self.verify(spec, staged).await?;
        let next: BTreeSet<Capability> =
            verified.linked.manifest.entry_points.iter().copied().collect();
        let lost: Vec<String> = current
            .entry_points
            .iter()
            .filter(|cap| !next.contains(cap))
            .map(|cap| cap.to_string())
            .collect();
        if !lost.is_empty() && !self.config.allow_capability_regression {
            remove_quietly(&verified.staged).await;
            return Err(UpdateError::CapabilityRegression { lost });
        }
        Ok(Some(verified))
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    /// Read the package and write it to the staging directory.
    async fn fetch_and_stage(&self, spec: &PackageSpec) -> Result<Staged, LoadError> {
        let bytes = self.source.read(&spec.uri).await?;
        let size_bytes = bytes.len() as u64;
        if size_bytes > self.config.max_package_bytes {
            return Err(LoadError::SizeLimitExceeded {
                size: size_bytes,
                limit: self.config.max_package_bytes,
            });
        }

        let staging = self.config.plugin_dir.join(STAGING_DIR);
        let path = staging.join(format!(
            "{}-{}.{PACKAGE_EXT}",
            sanitize(&spec.key),
            uuid::Uuid::new_v4()
        ));
        let io_err =
            |e: std::io::Error| LoadError::SourceUnavailable(format!("cannot stage package: {e}"));
        tokio::fs::create_dir_all(&staging).await.map_err(io_err)?;
        tokio::fs::write(&path, &bytes).await.map_err(io_err)?;

        Ok(Staged {
            checksum: compute_bytes_hash(&bytes),
            path,
            bytes,
        })
    }

    /// Checksum, scan and link a staged package. Removes the staged file on
    /// failure.
    async fn verify(
        &self,
        spec: &PackageSpec,
        staged: Staged,
    ) -> Result<Verified<L::Program>, LoadError> {
        match self.check(spec, &staged).await {
            Ok((safety, linked)) => Ok(Verified {
                size_bytes: staged.bytes.len() as u64,
                checksum: staged.checksum,
                staged: staged.path,
                safety,
                linked,
            }),
            Err(e) => {
                remove_quietly(&staged.path).await;
                Err(e)
            }
        }
    }

    async fn check(
        &self,
        spec: &PackageSpec,
        staged: &Staged,
    ) -> Result<(SafetyClassification, LinkedPackage<L::Program>), LoadError> {
        if let Some(reference) = &spec.checksum {
            let expected = self.expected_checksum(reference).await?;
            if expected != staged.checksum {
                return Err(LoadError::ChecksumMismatch {
                    expected,
                    actual: staged.checksum.clone(),
                });
            }
        }

        let report = scan::scan(&staged.bytes, &self.config.scan_rules);
        let safety = scan::classify(&report);
        match safety {
            SafetyClassification::Dangerous => {
                return Err(LoadError::UnsafeContentDetected {
                    findings: report.dangerous,
                });
            }
            SafetyClassification::Warning if self.config.reject_warnings => {
                return Err(LoadError::UnsafeContentDetected {
                    findings: report.warnings,
                });
            }
            SafetyClassification::Warning => {
                tracing::warn!(key = %spec.key, findings = ?report.warnings, "Package flagged by scan");
            }
            SafetyClassification::Unknown => {
                tracing::info!(key = %spec.key, "Package content could not be scanned");
            }
            SafetyClassification::Safe => {}
        }

        let linked = self.linker.validate_and_link(&staged.bytes)?;
        if linked.manifest.entry_points.is_empty() {
            return Err(LoadError::EntryPointNotFound(spec.key.clone()));
        }
        Ok((safety, linked))
    }

    async fn expected_checksum(&self, reference: &ChecksumRef) -> Result<String, LoadError> {
        match reference {
            ChecksumRef::Inline(hex) => Ok(hex.clone()),
            ChecksumRef::Remote(url) => {
                let body = self.source.read(url).await?;
                let text = String::from_utf8_lossy(&body);
                let token = text.split_whitespace().next().unwrap_or_default();
                normalize_checksum(token)
            }
        }
    }

    /// Move a verified package to its final path and build the plugin.
    async fn commit(
        &self,
        spec: &PackageSpec,
        verified: Verified<L::Program>,
    ) -> Result<Arc<LoadedPlugin<L::Program>>, LoadError> {
        let dir = self.config.plugin_dir.join(sanitize(&spec.key));
        let path = dir.join(format!("{}.{PACKAGE_EXT}", verified.checksum));
        let io_err =
            |e: std::io::Error| LoadError::SourceUnavailable(format!("cannot store package: {e}"));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            remove_quietly(&verified.staged).await;
            return Err(io_err(e));
        }
        if let Err(e) = tokio::fs::rename(&verified.staged, &path).await {
            remove_quietly(&verified.staged).await;
            return Err(io_err(e));
        }

        let manifest = verified.linked.manifest;
        let mut entry_points = manifest.entry_points;
        entry_points.sort();
        entry_points.dedup();

        let descriptor = PluginDescriptor {
            key: spec.key.clone(),
            display_name: spec.name.clone().unwrap_or(manifest.display_name),
            version: manifest.version,
            source_uri: spec.uri.clone(),
            local_path: path.display().to_string(),
            size_bytes: verified.size_bytes,
            checksum: verified.checksum,
            entry_points,
            loaded_at: Utc::now(),
            safety: verified.safety,
            searchable: spec.searchable.unwrap_or(manifest.searchable),
            quick_search: spec.quick_search.unwrap_or(manifest.quick_search),
        };

        Ok(Arc::new(LoadedPlugin {
            descriptor,
            program: Arc::new(verified.linked.program),
            config: spec.config.clone(),
        }))
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    fn lock_states(&self) -> MutexGuard<'_, HashMap<String, PluginState>> {
        self.states.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned registry state mutex");
            poisoned.into_inner()
        })
    }

    fn transition(&self, key: &str, next: PluginState) -> Result<(), UpdateError> {
        let mut states = self.lock_states();
        let current = states.get(key).copied().unwrap_or(PluginState::Unloaded);
        if current == PluginState::Unloaded && next == PluginState::Updating {
            return Err(UpdateError::NotLoaded(key.to_string()));
        }
        if !current.can_transition_to(next) {
            return Err(UpdateError::InvalidState {
                key: key.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        states.insert(key.to_string(), next);
        Ok(())
    }
}

/// Holds a key in flight during a load or update. Unless settled, dropping
/// it restores the state the key falls back to and removes the staged file,
/// so an abandoned call (for example a dropped future) never leaves the key
/// stuck.
struct InFlightGuard<'a> {
    states: &'a Mutex<HashMap<String, PluginState>>,
    key: String,
    fallback: PluginState,
    staged: Option<PathBuf>,
    settled: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(
        states: &'a Mutex<HashMap<String, PluginState>>,
        key: &str,
        fallback: PluginState,
    ) -> Self {
        Self {
            states,
            key: key.to_string(),
            fallback,
            staged: None,
            settled: false,
        }
    }

    fn track(&mut self, staged: &Path) {
        self.staged = Some(staged.to_path_buf());
    }

    fn settle(&mut self, state: PluginState) {
        self.set(state);
        self.settled = true;
    }

    fn set(&self, state: PluginState) {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state == PluginState::Unloaded {
            states.remove(&self.key);
        } else {
            states.insert(self.key.clone(), state);
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(path) = self.staged.take()
            && let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged package");
        }
        if !self.settled {
            self.set(self.fallback);
            tracing::debug!(key = %self.key, state = %self.fallback, "Restored plugin state");
        }
    }
}

struct Staged {
    path: PathBuf,
    bytes: Vec<u8>,
    checksum: String,
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged package");
    }
}

/// Keys become directory names; keep them to a safe character set.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
