//! Plugin package types: descriptors, package specs, lifecycle states.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::LoadError;
use crate::models::Capability;

/// Outcome of the best-effort static scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyClassification {
    Safe,
    Warning,
    Dangerous,
    Unknown,
}

impl SafetyClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyClassification::Safe => "safe",
            SafetyClassification::Warning => "warning",
            SafetyClassification::Dangerous => "dangerous",
            SafetyClassification::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SafetyClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable record of a validated, loaded plugin.
///
/// Replaced as a whole on update, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub key: String,
    pub display_name: String,
    pub version: String,
    pub source_uri: String,
    pub local_path: String,
    pub size_bytes: u64,
    /// SHA-256 of the package bytes, lowercase hex.
    pub checksum: String,
    pub entry_points: Vec<Capability>,
    pub loaded_at: DateTime<Utc>,
    pub safety: SafetyClassification,
    pub searchable: bool,
    pub quick_search: bool,
}

impl PluginDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.entry_points.contains(&capability)
    }

    /// Short checksum prefix scoping cache keys to this package version.
    pub fn cache_scope(&self) -> &str {
        self.checksum.get(..12).unwrap_or(&self.checksum)
    }
}

/// Lifecycle state of a plugin key in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Validating,
    Loaded,
    Updating,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Validating => "validating",
            PluginState::Loaded => "loaded",
            PluginState::Updating => "updating",
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `Validating -> Loaded` also covers a failed update falling back to
    /// the previous descriptor; `Updating -> Loaded` covers an update whose
    /// source could not be read at all.
    pub fn can_transition_to(&self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Unloaded, Validating)
                | (Validating, Loaded)
                | (Validating, Unloaded)
                | (Loaded, Updating)
                | (Loaded, Unloaded)
                | (Updating, Validating)
                | (Updating, Loaded)
        )
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, PluginState::Validating | PluginState::Updating)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PluginState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unloaded" => Ok(PluginState::Unloaded),
            "validating" => Ok(PluginState::Validating),
            "loaded" => Ok(PluginState::Loaded),
            "updating" => Ok(PluginState::Updating),
            _ => Err(format!("Unknown plugin state: {}", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Package sources
// ---------------------------------------------------------------------------

/// Where the expected checksum of a package comes from.
///
/// Serialized as a plain string: either 64 hex characters or an http(s) URL
/// whose body is the checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChecksumRef {
    Inline(String),
    Remote(String),
}

impl TryFrom<String> for ChecksumRef {
    type Error = LoadError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let raw = raw.trim();
        if let Ok(url) = Url::parse(raw)
            && matches!(url.scheme(), "http" | "https")
        {
            return Ok(ChecksumRef::Remote(url.to_string()));
        }
        normalize_checksum(raw).map(ChecksumRef::Inline)
    }
}

impl From<ChecksumRef> for String {
    fn from(value: ChecksumRef) -> Self {
        match value {
            ChecksumRef::Inline(hex) | ChecksumRef::Remote(hex) => hex,
        }
    }
}

/// Validate a SHA-256 hex digest and lowercase it.
pub fn normalize_checksum(raw: &str) -> Result<String, LoadError> {
    let hex = raw.trim().to_lowercase();
    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(hex)
    } else {
        Err(LoadError::InvalidPackage(format!(
            "'{raw}' is not a SHA-256 checksum"
        )))
    }
}

/// Everything needed to fetch, verify and configure one plugin package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<ChecksumRef>,
    /// Resolver-specific configuration handed to `Engine::init`.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Overrides the package's own `searchable` flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searchable: Option<bool>,
    /// Overrides the package's own `quick_search` flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_search: Option<bool>,
}

impl PackageSpec {
    pub fn new(key: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            uri: uri.into(),
            checksum: None,
            config: serde_json::Value::Null,
            searchable: None,
            quick_search: None,
        }
    }

    pub fn with_checksum(mut self, checksum: ChecksumRef) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Parse the compact `"<uri>;sha256;<hex-or-url>"` source form.
    ///
    /// A bare `"<uri>"` yields a spec without a pinned checksum.
    pub fn parse(key: impl Into<String>, source: &str) -> Result<Self, LoadError> {
        let parts: Vec<&str> = source.split(';').map(str::trim).collect();
        let spec = match parts.as_slice() {
            [uri] if !uri.is_empty() => Self::new(key, *uri),
            [uri, algorithm, checksum] if !uri.is_empty() => {
                if !algorithm.eq_ignore_ascii_case("sha256") {
                    return Err(LoadError::InvalidPackage(format!(
                        "unsupported checksum algorithm '{algorithm}'"
                    )));
                }
                let checksum = ChecksumRef::try_from(checksum.to_string())?;
                Self::new(key, *uri).with_checksum(checksum)
            }
            _ => {
                return Err(LoadError::InvalidPackage(format!(
                    "malformed package source '{source}'"
                )));
            }
        };
        Ok(spec)
    }
}

/// Metadata a linker reads out of a package without linking it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub key: String,
    pub display_name: String,
    pub version: String,
    pub entry_points: Vec<Capability>,
    pub searchable: bool,
    pub quick_search: bool,
}

/// A validated package together with its executable program.
#[derive(Debug)]
pub struct LinkedPackage<P> {
    pub manifest: PackageManifest,
    pub program: P,
}

/// A plugin as held by the registry: descriptor, shared program and config.
#[derive(Debug)]
pub struct LoadedPlugin<P> {
    pub descriptor: PluginDescriptor,
    pub program: Arc<P>,
    pub config: serde_json::Value,
}

/// Result of comparing an installed plugin with its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub key: String,
    pub current_version: String,
    pub latest_version: String,
    pub current_checksum: String,
    pub latest_checksum: String,
    pub update_available: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSummary {
    pub key: String,
    pub display_name: String,
    pub version: String,
    pub state: PluginState,
    pub safety: SafetyClassification,
    pub entry_points: Vec<Capability>,
    pub searchable: bool,
    pub quick_search: bool,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub loaded: usize,
    pub in_flight: usize,
    pub plugins: Vec<PluginSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_state_transitions() {
        use PluginState::*;
        assert!(Unloaded.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Loaded));
        assert!(Validating.can_transition_to(Unloaded));
        assert!(Loaded.can_transition_to(Updating));
        assert!(Updating.can_transition_to(Validating));
        assert!(!Unloaded.can_transition_to(Loaded));
        assert!(!Loaded.can_transition_to(Validating));
        assert!(!Updating.can_transition_to(Unloaded));
        assert!(!Updating.can_transition_to(Updating));
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!("LOADED".parse::<PluginState>().unwrap(), PluginState::Loaded);
        assert!("broken".parse::<PluginState>().is_err());
    }

    #[test]
    fn test_parse_bare_uri() {
        let spec = PackageSpec::parse("demo", "https://example.com/demo.json").unwrap();
        assert_eq!(spec.uri, "https://example.com/demo.json");
        assert!(spec.checksum.is_none());
    }

    #[test]
    fn test_parse_inline_checksum() {
        let source = format!("./packs/demo.json;sha256;{}", HEX.to_uppercase());
        let spec = PackageSpec::parse("demo", &source).unwrap();
        assert_eq!(spec.checksum, Some(ChecksumRef::Inline(HEX.to_string())));
    }

    #[test]
    fn test_parse_remote_checksum() {
        let spec = PackageSpec::parse(
            "demo",
            "https://example.com/demo.json;sha256;https://example.com/demo.sha256",
        )
        .unwrap();
        assert_eq!(
            spec.checksum,
            Some(ChecksumRef::Remote(
                "https://example.com/demo.sha256".to_string()
            ))
        );
    }

    #[test]
    fn test_parse_rejects_bad_sources() {
        assert!(PackageSpec::parse("demo", "").is_err());
        assert!(PackageSpec::parse("demo", "a.json;md5;abc").is_err());
        assert!(PackageSpec::parse("demo", "a.json;sha256;nothex").is_err());
        assert!(PackageSpec::parse("demo", "a.json;sha256").is_err());
    }

    #[test]
    fn test_checksum_ref_serializes_as_string() {
        let spec = PackageSpec::new("demo", "a.json").with_checksum(ChecksumRef::Inline(HEX.into()));
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["checksum"], HEX);

        let back: PackageSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
