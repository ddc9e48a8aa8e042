//! Rule-pack resolvers: JSON packages of URL templates and CSS selectors.
//!
//! [`RuleLinker`] parses and compiles a pack into [`CompiledRules`];
//! [`RuleEngine`] executes the compiled rules, fetching pages through a
//! [`Fetcher`](arachne_core::traits::Fetcher).

mod engine;
pub mod extract;

use std::collections::BTreeMap;

use arachne_core::error::LoadError;
use arachne_core::models::{Capability, Category};
use arachne_core::plugin::{LinkedPackage, PackageManifest};
use arachne_core::traits::PluginLinker;
use serde::{Deserialize, Serialize};
use url::Url;

pub use engine::{RuleEngine, RuleEngineFactory};
use extract::{DetailSelectors, Field, ListSelectors, PlaylistSelectors, selector};

// ---------------------------------------------------------------------------
// Package format
// ---------------------------------------------------------------------------

fn default_version() -> String {
    "1".to_string()
}

fn default_true() -> bool {
    true
}

/// A rule pack as stored in the package file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePack {
    pub key: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Base URL, available to templates as `{site}`. A resolver's `site`
    /// config value overrides it.
    pub site: String,
    /// Headers sent with every page fetch of this resolver.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub searchable: bool,
    #[serde(default = "default_true")]
    pub quick_search: bool,
    /// Fixed category list returned by `home`.
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<ListRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ListRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<ListRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<DetailRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRule {
    pub url: String,
    pub list: String,
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailRule {
    /// Template with `{id}`; an absolute id URL is fetched as is.
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub director: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<PlaylistRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistRule {
    /// Selector for the line names, paired by position with `groups`.
    pub flags: String,
    pub groups: String,
    pub episode: String,
    #[serde(default)]
    pub episode_name: String,
    #[serde(default = "default_episode_id")]
    pub episode_id: String,
}

fn default_episode_id() -> String {
    "@href".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRule {
    /// Play page template with `{id}` and `{flag}`. Without it the episode
    /// id itself is the play URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Field locating the stream URL on the play page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Whether the returned URL still needs sniffing by the consumer.
    #[serde(default)]
    pub parse: bool,
}

impl RulePack {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        let pack: RulePack = serde_json::from_slice(bytes)
            .map_err(|e| LoadError::InvalidPackage(format!("rule pack is not valid JSON: {e}")))?;
        if pack.key.trim().is_empty() {
            return Err(LoadError::InvalidPackage("rule pack has an empty key".into()));
        }
        Url::parse(&pack.site).map_err(|e| {
            LoadError::InvalidPackage(format!("site '{}' is not a URL: {e}", pack.site))
        })?;
        Ok(pack)
    }

    /// Capabilities backed by a rule, in canonical order.
    pub fn entry_points(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.home.is_some() || !self.categories.is_empty() {
            caps.push(Capability::Home);
        }
        if self.category.is_some() {
            caps.push(Capability::Category);
        }
        if self.detail.is_some() {
            caps.push(Capability::Detail);
        }
        if self.search.is_some() {
            caps.push(Capability::Search);
        }
        if self.player.is_some() {
            caps.push(Capability::Player);
        }
        caps
    }

    pub fn manifest(&self) -> PackageManifest {
        PackageManifest {
            key: self.key.clone(),
            display_name: self.name.clone(),
            version: self.version.clone(),
            entry_points: self.entry_points(),
            searchable: self.searchable,
            quick_search: self.quick_search,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CompiledList {
    pub url: String,
    pub selectors: ListSelectors,
}

#[derive(Debug, Clone)]
pub struct CompiledDetail {
    pub url: String,
    pub selectors: DetailSelectors,
}

#[derive(Debug, Clone)]
pub struct CompiledPlayer {
    pub url: Option<String>,
    pub source: Option<Field>,
    pub parse: bool,
}

/// A rule pack with every selector parsed. Shared by all engines bound to
/// the same plugin.
#[derive(Debug, Clone)]
pub struct CompiledRules {
    pub key: String,
    pub site: String,
    pub headers: BTreeMap<String, String>,
    pub categories: Vec<Category>,
    pub home: Option<CompiledList>,
    pub category: Option<CompiledList>,
    pub search: Option<CompiledList>,
    pub detail: Option<CompiledDetail>,
    pub player: Option<CompiledPlayer>,
}

impl CompiledRules {
    pub fn compile(pack: &RulePack) -> Result<Self, LoadError> {
        let invalid = |what: &str, e: String| {
            LoadError::InvalidPackage(format!("{}: {what}: {e}", pack.key))
        };
        let list = |what: &str, rule: &Option<ListRule>| -> Result<Option<CompiledList>, LoadError> {
            rule.as_ref()
                .map(|r| compile_list(r).map_err(|e| invalid(what, e)))
                .transpose()
        };

        Ok(Self {
            key: pack.key.clone(),
            site: pack.site.clone(),
            headers: pack.headers.clone(),
            categories: pack.categories.clone(),
            home: list("home", &pack.home)?,
            category: list("category", &pack.category)?,
            search: list("search", &pack.search)?,
            detail: pack
                .detail
                .as_ref()
                .map(|r| compile_detail(r).map_err(|e| invalid("detail", e)))
                .transpose()?,
            player: pack
                .player
                .as_ref()
                .map(|r| compile_player(r).map_err(|e| invalid("player", e)))
                .transpose()?,
        })
    }
}

fn optional(raw: &Option<String>) -> Result<Option<Field>, String> {
    raw.as_deref().map(Field::parse).transpose()
}

fn compile_list(rule: &ListRule) -> Result<CompiledList, String> {
    Ok(CompiledList {
        url: rule.url.clone(),
        selectors: ListSelectors {
            list: selector(&rule.list)?,
            id: Field::parse(&rule.id)?,
            name: Field::parse(&rule.name)?,
            pic: optional(&rule.pic)?,
            remark: optional(&rule.remark)?,
        },
    })
}

fn compile_detail(rule: &DetailRule) -> Result<CompiledDetail, String> {
    let playlists = match &rule.playlist {
        Some(p) => Some(PlaylistSelectors {
            flags: selector(&p.flags)?,
            groups: selector(&p.groups)?,
            episode: selector(&p.episode)?,
            episode_name: Field::parse(&p.episode_name)?,
            episode_id: Field::parse(&p.episode_id)?,
        }),
        None => None,
    };
    Ok(CompiledDetail {
        url: rule.url.clone(),
        selectors: DetailSelectors {
            name: Field::parse(&rule.name)?,
            pic: optional(&rule.pic)?,
            description: optional(&rule.description)?,
            year: optional(&rule.year)?,
            area: optional(&rule.area)?,
            actors: optional(&rule.actors)?,
            director: optional(&rule.director)?,
            playlists,
        },
    })
}

fn compile_player(rule: &PlayerRule) -> Result<CompiledPlayer, String> {
    if rule.source.is_some() && rule.url.is_none() {
        return Err("'source' needs a page 'url'".into());
    }
    Ok(CompiledPlayer {
        url: rule.url.clone(),
        source: optional(&rule.source)?,
        parse: rule.parse,
    })
}

// ---------------------------------------------------------------------------
// Linker
// ---------------------------------------------------------------------------

/// Links JSON rule packs for the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleLinker;

impl PluginLinker for RuleLinker {
    type Program = CompiledRules;

    fn inspect(&self, bytes: &[u8]) -> Result<PackageManifest, LoadError> {
        RulePack::from_bytes(bytes).map(|pack| pack.manifest())
    }

    fn validate_and_link(&self, bytes: &[u8]) -> Result<LinkedPackage<CompiledRules>, LoadError> {
        let pack = RulePack::from_bytes(bytes)?;
        let manifest = pack.manifest();
        if manifest.entry_points.is_empty() {
            return Err(LoadError::EntryPointNotFound(pack.key));
        }
        Ok(LinkedPackage {
            program: CompiledRules::compile(&pack)?,
            manifest,
        })
    }
}
