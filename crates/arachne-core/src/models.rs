use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;

// ---------------------------------------------------------------------------
// Resolver payloads
// ---------------------------------------------------------------------------

/// One entry of a listing or search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VodItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub pic: String,
    #[serde(default)]
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub type_id: String,
    pub type_name: String,
}

/// Result of the home, category and search capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub items: Vec<VodItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub name: String,
    pub id: String,
}

/// A named group of episodes served from one line ("flag").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub flag: String,
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub pic: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub director: Option<String>,
    #[serde(default)]
    pub playlists: Vec<Playlist>,
}

/// Result of the player capability.
///
/// When `parse` is true the URL points at a page that still needs sniffing
/// by the consumer; otherwise it is directly playable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayableSource {
    pub url: String,
    #[serde(default)]
    pub parse: bool,
    #[serde(default)]
    pub flag: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Resolver contract
// ---------------------------------------------------------------------------

/// The closed set of operations a resolver can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Home,
    Category,
    Detail,
    Search,
    Player,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Home,
        Capability::Category,
        Capability::Detail,
        Capability::Search,
        Capability::Player,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Home => "home",
            Capability::Category => "category",
            Capability::Detail => "detail",
            Capability::Search => "search",
            Capability::Player => "player",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "home" => Ok(Capability::Home),
            "category" => Ok(Capability::Category),
            "detail" => Ok(Capability::Detail),
            "search" => Ok(Capability::Search),
            "player" => Ok(Capability::Player),
            _ => Err(format!("Unknown capability: {}", s)),
        }
    }
}

/// A single invocation of a resolver capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "lowercase")]
pub enum ResolverCall {
    Home {
        refresh: bool,
    },
    Category {
        type_id: String,
        page: u32,
        refresh: bool,
        #[serde(default)]
        filters: BTreeMap<String, String>,
    },
    Detail {
        ids: Vec<String>,
    },
    Search {
        keyword: String,
        quick: bool,
    },
    Player {
        flag: String,
        id: String,
        #[serde(default)]
        extra: Vec<String>,
    },
}

impl ResolverCall {
    pub fn capability(&self) -> Capability {
        match self {
            ResolverCall::Home { .. } => Capability::Home,
            ResolverCall::Category { .. } => Capability::Category,
            ResolverCall::Detail { .. } => Capability::Detail,
            ResolverCall::Search { .. } => Capability::Search,
            ResolverCall::Player { .. } => Capability::Player,
        }
    }
}

/// Serializable output of a resolver call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum ResolverOutput {
    Listing(Listing),
    Details(Vec<DetailRecord>),
    Playable(PlayableSource),
}

impl ResolverOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolverOutput::Listing(_) => "listing",
            ResolverOutput::Details(_) => "details",
            ResolverOutput::Playable(_) => "playable",
        }
    }

    pub fn into_listing(self, key: &str) -> Result<Listing, AppError> {
        match self {
            ResolverOutput::Listing(listing) => Ok(listing),
            other => Err(mismatch(key, "listing", &other)),
        }
    }

    pub fn into_details(self, key: &str) -> Result<Vec<DetailRecord>, AppError> {
        match self {
            ResolverOutput::Details(details) => Ok(details),
            other => Err(mismatch(key, "details", &other)),
        }
    }

    pub fn into_playable(self, key: &str) -> Result<PlayableSource, AppError> {
        match self {
            ResolverOutput::Playable(source) => Ok(source),
            other => Err(mismatch(key, "playable", &other)),
        }
    }
}

fn mismatch(key: &str, expected: &'static str, actual: &ResolverOutput) -> AppError {
    AppError::ResolverOutputMismatch {
        key: key.to_string(),
        expected,
        actual: actual.kind(),
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Compute SHA-256 hash of a string, returned as lowercase hex.
pub fn compute_hash(content: &str) -> String {
    compute_bytes_hash(content.as_bytes())
}

/// Compute SHA-256 hash of raw bytes, returned as lowercase hex.
pub fn compute_bytes_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
