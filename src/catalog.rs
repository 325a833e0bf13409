//! Common Crawl shard listing and time-range shard selection.

use crate::error::ArchiveError;
use crate::timestamp::timestamp_bounds;
use crate::transport::{HttpRequest, Transport};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One crawl as described by `collinfo.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    /// Crawl identifier, e.g. `CC-MAIN-2021-43`.
    pub id: String,
    /// Human readable crawl name.
    #[serde(default)]
    pub name: String,
    /// CDX endpoint for this crawl.
    #[serde(rename = "cdx-api")]
    pub cdx_api: String,
}

fn year_week_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^CC-MAIN-(\d{4})-(\d{2})$").expect("valid regex"))
}

fn year_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^CC-MAIN-(?:\d{4}-)?(\d{4})").expect("valid regex"))
}

/// Representative date of a crawl, derived from its identifier.
///
/// `CC-MAIN-YYYY-WW` maps to the Sunday closing week `WW` of `YYYY` (weeks
/// start on Monday; week 1 begins on the year's first Monday).
/// `CC-MAIN-YYYY` and `CC-MAIN-YYYY-YYYY` map to December 1st of the last year.
pub fn parse_crawl_date(crawl_id: &str) -> Result<NaiveDate, ArchiveError> {
    let invalid = || ArchiveError::Validation(format!("unexpected crawl id: {}", crawl_id));

    if let Some(caps) = year_week_pattern().captures(crawl_id) {
        let year: i32 = caps[1].parse().map_err(|_| invalid())?;
        let week: i64 = caps[2].parse().map_err(|_| invalid())?;
        if week > 53 {
            return Err(invalid());
        }
        let jan1 = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(invalid)?;
        let jan1_weekday = jan1.weekday().num_days_from_monday() as i64;
        let sunday = if week == 0 {
            // Week 0 is the days before the first Monday; when the year
            // starts on a Monday it is empty and resolves to week 1's Sunday.
            jan1 + ChronoDuration::days(6 - jan1_weekday)
        } else {
            let first_monday = jan1 + ChronoDuration::days((7 - jan1_weekday) % 7);
            first_monday + ChronoDuration::days(7 * week - 1)
        };
        debug_assert_eq!(sunday.weekday(), Weekday::Sun);
        return Ok(sunday);
    }

    if let Some(caps) = year_pattern().captures(crawl_id) {
        let year: i32 = caps[1].parse().map_err(|_| invalid())?;
        return NaiveDate::from_ymd_opt(year, 12, 1).ok_or_else(invalid);
    }

    Err(invalid())
}

/// Selects the crawls that may hold captures between `start` and `end`.
///
/// Returns ids in the order given. See [`select_by_date`].
pub fn index_by_time(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    ids: &[String],
) -> Result<Vec<String>, ArchiveError> {
    let dated: Vec<(String, DateTime<Utc>)> = ids
        .iter()
        .map(|id| parse_crawl_date(id).map(|d| (id.clone(), d.and_time(NaiveTime::MIN).and_utc())))
        .collect::<Result<_, _>>()?;
    select_by_date(start, end, &dated)
}

/// Selects the shards whose representative date could overlap `[start, end]`.
///
/// A shard's date does not bound its contents precisely, so this errs toward
/// one extra shard on each side: the latest shard dated strictly before
/// `start` and the earliest dated strictly after `end` are included, with
/// everything in between. When no shard qualifies, or a bound is missing, the
/// oldest or newest shard is used instead.
pub fn select_by_date(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    dated: &[(String, DateTime<Utc>)],
) -> Result<Vec<String>, ArchiveError> {
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(ArchiveError::Validation(format!(
                "expected start <= end: start={}, end={}",
                start, end
            )));
        }
    }

    let dates = || dated.iter().map(|(_, d)| *d);
    let (Some(min), Some(max)) = (dates().min(), dates().max()) else {
        return Ok(Vec::new());
    };

    let previous = match start {
        Some(start) => dates().filter(|d| *d < start).max().unwrap_or(min),
        None => min,
    };
    let next = match end {
        Some(end) => dates().filter(|d| *d > end).min().unwrap_or(max),
        None => max,
    };

    Ok(dated
        .iter()
        .filter(|(_, d)| previous <= *d && *d <= next)
        .map(|(id, _)| id.clone())
        .collect())
}

/// Like [`index_by_time`], taking CDX timestamp prefixes.
///
/// `start` is widened to the earliest instant of its prefix and `end` to the
/// latest, so `end = "2020"` covers all of 2020.
pub fn index_by_timestamp_prefix(
    start: Option<&str>,
    end: Option<&str>,
    ids: &[String],
) -> Result<Vec<String>, ArchiveError> {
    let start = start.map(timestamp_bounds).transpose()?.map(|(lower, _)| lower);
    let end = end.map(timestamp_bounds).transpose()?.map(|(_, upper)| upper);
    index_by_time(start, end, ids)
}

struct CachedListing {
    fetched_at: Instant,
    shards: Arc<Vec<ShardDescriptor>>,
}

/// The Common Crawl shard listing, cached for a bounded time.
///
/// Concurrent callers share a single fetch; [`ShardCatalog::invalidate`]
/// forces the next call to refetch.
pub struct ShardCatalog<T> {
    transport: Arc<T>,
    listing_url: String,
    ttl: Duration,
    cache: Mutex<Option<CachedListing>>,
}

impl<T: Transport> ShardCatalog<T> {
    pub fn new(transport: Arc<T>, listing_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            transport,
            listing_url: listing_url.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Returns every known shard, in listing order (newest first upstream).
    pub async fn shards(&self) -> Result<Arc<Vec<ShardDescriptor>>, ArchiveError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&cached.shards));
            }
            debug!("Shard listing older than {:?}, refreshing", self.ttl);
        }

        info!("Retrieving shard listing from {}", self.listing_url);
        let response = self
            .transport
            .get(HttpRequest::get(&self.listing_url))
            .await?
            .error_for_status(&self.listing_url)?;
        let shards: Vec<ShardDescriptor> = response.json().map_err(|e| {
            ArchiveError::Protocol(format!(
                "Invalid shard listing from {}: {}\n\
                 Expected a JSON array of objects with fields: id, cdx-api",
                self.listing_url, e
            ))
        })?;

        let shards = Arc::new(shards);
        *cache = Some(CachedListing {
            fetched_at: Instant::now(),
            shards: Arc::clone(&shards),
        });
        Ok(shards)
    }

    /// Drops the cached listing.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Shard ids that may hold captures between the given timestamp prefixes.
    pub async fn resolve(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<String>, ArchiveError> {
        let shards = self.shards().await?;
        let ids: Vec<String> = shards.iter().map(|s| s.id.clone()).collect();
        index_by_timestamp_prefix(start, end, &ids)
    }
}
