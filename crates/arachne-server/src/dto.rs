use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use arachne_core::cache::{CacheStats, SweepReport};
use arachne_core::error::AppError;
use arachne_core::hub::{ProbeCheck, ProbeReport};
use arachne_core::models::{
    Category, DetailRecord, Episode, Listing, PlayableSource, Playlist, VodItem,
};
use arachne_core::plugin::{ChecksumRef, PackageSpec, PluginDescriptor, UpdateInfo};
use arachne_core::pool::PoolStatus;
use arachne_core::search::{SearchProgress, SearchResult, SearchSummary};

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct VodItemResponse {
    pub id: String,
    pub name: String,
    pub pic: String,
    pub remark: String,
}

impl From<VodItem> for VodItemResponse {
    fn from(item: VodItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            pic: item.pic,
            remark: item.remark,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CategoryResponse {
    pub type_id: String,
    pub type_name: String,
}

impl From<Category> for CategoryResponse {
    fn from(category: Category) -> Self {
        Self {
            type_id: category.type_id,
            type_name: category.type_name,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ListingResponse {
    pub categories: Vec<CategoryResponse>,
    pub items: Vec<VodItemResponse>,
    pub page: Option<u32>,
    pub page_count: Option<u32>,
}

impl From<Listing> for ListingResponse {
    fn from(listing: Listing) -> Self {
        Self {
            categories: listing.categories.into_iter().map(Into::into).collect(),
            items: listing.items.into_iter().map(Into::into).collect(),
            page: listing.page,
            page_count: listing.page_count,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct HomeQuery {
    /// Bypass the cache and ask the resolver again.
    pub refresh: Option<bool>,
}

// ---------------------------------------------------------------------------
// Details and playback
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EpisodeResponse {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PlaylistResponse {
    pub flag: String,
    pub episodes: Vec<EpisodeResponse>,
}

impl From<Playlist> for PlaylistResponse {
    fn from(playlist: Playlist) -> Self {
        Self {
            flag: playlist.flag,
            episodes: playlist
                .episodes
                .into_iter()
                .map(|Episode { name, id }| EpisodeResponse { name, id })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DetailResponse {
    pub id: String,
    pub name: String,
    pub pic: String,
    pub description: String,
    pub year: Option<String>,
    pub area: Option<String>,
    pub actors: Option<String>,
    pub director: Option<String>,
    pub playlists: Vec<PlaylistResponse>,
}

impl From<DetailRecord> for DetailResponse {
    fn from(record: DetailRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            pic: record.pic,
            description: record.description,
            year: record.year,
            area: record.area,
            actors: record.actors,
            director: record.director,
            playlists: record.playlists.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct DetailRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DetailListResponse {
    pub details: Vec<DetailResponse>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct PlayRequest {
    pub flag: String,
    pub id: String,
    pub extra: Option<Vec<String>>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PlayableResponse {
    pub url: String,
    /// The URL still needs sniffing before playback.
    pub parse: bool,
    pub flag: String,
    pub headers: BTreeMap<String, String>,
}

impl From<PlayableSource> for PlayableResponse {
    fn from(source: PlayableSource) -> Self {
        Self {
            url: source.url,
            parse: source.parse,
            flag: source.flag,
            headers: source.headers,
        }
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct SearchQuery {
    pub keyword: String,
    /// Comma-separated resolver keys; all searchable resolvers if absent.
    pub resolvers: Option<String>,
    pub quick: Option<bool>,
    pub concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
}

impl SearchQuery {
    pub fn resolver_keys(&self) -> Vec<String> {
        self.resolvers
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SearchResultResponse {
    pub resolver_key: String,
    pub success: bool,
    pub items: Vec<VodItemResponse>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub attempts: u32,
    pub cached: bool,
}

impl From<SearchResult> for SearchResultResponse {
    fn from(result: SearchResult) -> Self {
        Self {
            resolver_key: result.resolver_key,
            success: result.success,
            items: result.items.into_iter().map(Into::into).collect(),
            error: result.error,
            elapsed_ms: result.elapsed_ms,
            attempts: result.attempts,
            cached: result.cached,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SearchProgressResponse {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

impl From<SearchProgress> for SearchProgressResponse {
    fn from(p: SearchProgress) -> Self {
        Self {
            total: p.total,
            completed: p.completed,
            succeeded: p.succeeded,
            failed: p.failed,
            elapsed_ms: p.elapsed_ms,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SearchResponse {
    pub query_id: Uuid,
    pub keyword: String,
    pub resolvers: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub results: Vec<SearchResultResponse>,
    pub progress: SearchProgressResponse,
    pub cancelled: bool,
    pub from_cache: bool,
}

impl From<SearchSummary> for SearchResponse {
    fn from(summary: SearchSummary) -> Self {
        Self {
            query_id: summary.task.query_id,
            keyword: summary.task.keyword,
            resolvers: summary.task.target_resolver_keys,
            started_at: summary.task.started_at,
            results: summary.results.into_iter().map(Into::into).collect(),
            progress: summary.progress.into(),
            cancelled: summary.cancelled,
            from_cache: summary.from_cache,
        }
    }
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// A package to load: either `uri` (plus optional `checksum`) or the compact
/// `source` form `"<uri>;sha256;<checksum>"`.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct LoadPluginRequest {
    pub key: String,
    pub uri: Option<String>,
    pub source: Option<String>,
    /// SHA-256 hex, or an http(s) URL serving it.
    pub checksum: Option<String>,
    pub name: Option<String>,
    pub config: Option<serde_json::Value>,
    pub searchable: Option<bool>,
    pub quick_search: Option<bool>,
}

impl LoadPluginRequest {
    pub fn into_spec(self) -> Result<PackageSpec, AppError> {
        let mut spec = match (self.uri, self.source) {
            (Some(uri), None) => {
                let spec = PackageSpec::new(self.key, uri);
                match self.checksum {
                    Some(raw) => spec.with_checksum(ChecksumRef::try_from(raw)?),
                    None => spec,
                }
            }
            (None, Some(source)) => PackageSpec::parse(self.key, &source)?,
            _ => {
                return Err(AppError::Generic(
                    "exactly one of 'uri' or 'source' is required".to_string(),
                ));
            }
        };
        spec.name = self.name;
        spec.config = self.config.unwrap_or_default();
        spec.searchable = self.searchable;
        spec.quick_search = self.quick_search;
        Ok(spec)
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PluginResponse {
    pub key: String,
    pub display_name: String,
    pub version: String,
    pub source_uri: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub entry_points: Vec<String>,
    pub safety: String,
    pub searchable: bool,
    pub quick_search: bool,
    pub loaded_at: DateTime<Utc>,
}

impl From<PluginDescriptor> for PluginResponse {
    fn from(d: PluginDescriptor) -> Self {
        Self {
            key: d.key,
            display_name: d.display_name,
            version: d.version,
            source_uri: d.source_uri,
            checksum: d.checksum,
            size_bytes: d.size_bytes,
            entry_points: d.entry_points.iter().map(|c| c.to_string()).collect(),
            safety: d.safety.to_string(),
            searchable: d.searchable,
            quick_search: d.quick_search,
            loaded_at: d.loaded_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PluginListResponse {
    pub plugins: Vec<PluginResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct UpdateInfoResponse {
    pub key: String,
    pub current_version: String,
    pub latest_version: String,
    pub current_checksum: String,
    pub latest_checksum: String,
    pub update_available: bool,
    pub checked_at: DateTime<Utc>,
}

impl From<UpdateInfo> for UpdateInfoResponse {
    fn from(info: UpdateInfo) -> Self {
        Self {
            key: info.key,
            current_version: info.current_version,
            latest_version: info.latest_version,
            current_checksum: info.current_checksum,
            latest_checksum: info.latest_checksum,
            update_available: info.update_available,
            checked_at: info.checked_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ProbeQuery {
    /// Keyword for the search probe.
    pub keyword: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProbeCheckResponse {
    pub capability: String,
    pub success: bool,
    pub items: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProbeResponse {
    pub key: String,
    pub healthy: bool,
    pub checks: Vec<ProbeCheckResponse>,
}

impl From<ProbeReport> for ProbeResponse {
    fn from(report: ProbeReport) -> Self {
        Self {
            healthy: report.is_healthy(),
            key: report.key,
            checks: report
                .checks
                .into_iter()
                .map(|c: ProbeCheck| ProbeCheckResponse {
                    capability: c.capability.to_string(),
                    success: c.success,
                    items: c.items,
                    elapsed_ms: c.elapsed_ms,
                    error: c.error,
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PoolStatusResponse {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub core_size: usize,
    pub max_size: usize,
    pub created: u64,
    pub destroyed: u64,
    pub shut_down: bool,
}

impl From<PoolStatus> for PoolStatusResponse {
    fn from(s: PoolStatus) -> Self {
        Self {
            total: s.total,
            active: s.active,
            idle: s.idle,
            core_size: s.core_size,
            max_size: s.max_size,
            created: s.created,
            destroyed: s.destroyed,
            shut_down: s.shut_down,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CacheStatsResponse {
    pub memory_entries: u64,
    pub memory_bytes: u64,
    pub disk_entries: u64,
    pub disk_bytes: u64,
    pub memory_budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub disk_reads: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub errors: u64,
}

impl From<CacheStats> for CacheStatsResponse {
    fn from(s: CacheStats) -> Self {
        Self {
            memory_entries: s.memory.entries,
            memory_bytes: s.memory.bytes,
            disk_entries: s.disk.entries,
            disk_bytes: s.disk.bytes,
            memory_budget_bytes: s.memory_budget_bytes,
            hits: s.hits,
            misses: s.misses,
            memory_hits: s.memory_hits,
            disk_hits: s.disk_hits,
            disk_reads: s.disk_reads,
            evictions: s.evictions,
            expirations: s.expirations,
            errors: s.errors,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SweepResponse {
    pub memory_purged: u64,
    pub disk_purged: u64,
    pub corrupted: u64,
}

impl From<SweepReport> for SweepResponse {
    fn from(r: SweepReport) -> Self {
        Self {
            memory_purged: r.memory_purged,
            disk_purged: r.disk_purged,
            corrupted: r.corrupted,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatusResponse {
    pub loaded: usize,
    pub in_flight: usize,
    pub pool: PoolStatusResponse,
    pub cache: CacheStatsResponse,
}

// ---------------------------------------------------------------------------
// Health & errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub plugins: usize,
    pub engines: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
