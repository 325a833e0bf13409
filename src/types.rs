//! Configuration and shared data structures.

use std::time::Duration;

/// Canonical archive CDX endpoint.
pub const WAYBACK_CDX_URL: &str = "http://web.archive.org/cdx/search/cdx";

/// Canonical archive replay base.
pub const WAYBACK_REPLAY_URL: &str = "http://web.archive.org/web";

/// Listing of every Common Crawl index with its CDX endpoint.
pub const CC_INDEX_LIST_URL: &str = "https://index.commoncrawl.org/collinfo.json";

/// Object storage base for Common Crawl WARC files.
pub const CC_DATA_URL: &str = "https://commoncrawl.s3.amazonaws.com/";

/// Page size for sharded queries. Small pages make small queries much faster
/// (the server default is 5).
pub const CC_PAGE_SIZE: u32 = 1;

/// A raw row from either CDX backend, keyed by the backend's own field names.
pub type CaptureIndexRecord = serde_json::Map<String, serde_json::Value>;

/// Endpoints and behaviour for querying archives.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use webrefine::ArchiveConfig;
///
/// let config = ArchiveConfig {
///     page_size: 5,
///     catalog_ttl: Duration::from_secs(600),
///     ..ArchiveConfig::default()
/// };
/// assert_eq!(config.page_size, 5);
/// ```
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Wayback Machine CDX search endpoint.
    pub wayback_cdx_url: String,
    /// Wayback Machine replay base (e.g., `http://web.archive.org/web`).
    pub wayback_replay_url: String,
    /// Common Crawl index listing (`collinfo.json`).
    pub cc_index_list_url: String,
    /// Common Crawl object storage base, with trailing slash.
    pub cc_data_url: String,
    /// Page size used for sharded queries (default: 1).
    pub page_size: u32,
    /// How long a fetched shard listing stays valid (default: 24h).
    pub catalog_ttl: Duration,
    /// Request unmodified archived bytes from replay (`id_` marker).
    pub replay_original: bool,
    /// Check fetched payloads against recorded digests and warn on mismatch.
    pub verify_digests: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            wayback_cdx_url: WAYBACK_CDX_URL.to_string(),
            wayback_replay_url: WAYBACK_REPLAY_URL.to_string(),
            cc_index_list_url: CC_INDEX_LIST_URL.to_string(),
            cc_data_url: CC_DATA_URL.to_string(),
            page_size: CC_PAGE_SIZE,
            catalog_ttl: Duration::from_secs(24 * 60 * 60),
            replay_original: false,
            verify_digests: false,
        }
    }
}

/// Connection pool and retry settings for [`crate::ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum idle connections kept per host (default: 8).
    ///
    /// Size this to at least the number of concurrent fetches the caller
    /// runs, or requests will queue for connections.
    pub max_connections: usize,
    /// Retries after a server error or connection failure (default: 5).
    pub max_retries: usize,
    /// Backoff multiplier in milliseconds: retry n waits `factor * 2^n` ms.
    pub backoff_factor_ms: u64,
    /// Per-request timeout. `None` leaves requests unbounded.
    pub timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            max_retries: 5,
            backoff_factor_ms: 500,
            timeout: None,
        }
    }
}
