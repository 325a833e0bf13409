//! Capture references: immutable metadata plus a locator for the payload.
//!
//! A reference never holds content. Fetching is a separate, explicit step
//! (see [`crate::ContentFetcher`]) so that missing captures and transport
//! failures show up in its return type.

use crate::digest::normalize_index_digest;
use crate::error::ArchiveError;
use crate::timestamp::{format_timestamp, parse_timestamp};
use crate::types::CaptureIndexRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Where a capture's payload bytes can be recovered from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    /// A record starting at `offset` in a local WARC file.
    LocalFile {
        /// WARC file path.
        path: PathBuf,
        /// Byte offset of the record (of its gzip member, if compressed).
        offset: u64,
    },
    /// Replayed through the Wayback Machine using the reference's own
    /// timestamp and URL.
    Replay,
    /// A byte range of a WARC file in Common Crawl object storage.
    Sharded {
        /// Object key relative to the data bucket.
        filename: String,
        /// First byte of the record.
        offset: u64,
        /// Record length in bytes.
        length: u64,
        /// Index the row came from (e.g. `CC-MAIN-2021-43`).
        shard: Option<String>,
    },
}

/// One archived capture of a URL.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CaptureReference {
    /// Captured URL.
    pub url: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// MIME type without parameters, when known.
    pub mime: Option<String>,
    /// HTTP status, `None` when the index did not record one.
    pub status: Option<u16>,
    /// Base32 SHA-1 of the payload, when known.
    pub digest: Option<String>,
    /// How to fetch the payload.
    pub locator: Locator,
}

impl CaptureReference {
    /// Capture time as a 14-digit timestamp.
    pub fn timestamp_str(&self) -> String {
        format_timestamp(&self.timestamp)
    }

    /// Builds a replay reference from a Wayback Machine CDX row.
    ///
    /// Expects `original`, `timestamp`, `mimetype` and `statuscode` fields;
    /// a `statuscode` of `-` means the status was not observed.
    pub fn from_wayback_row(row: &CaptureIndexRecord) -> Result<Self, ArchiveError> {
        let url = required_str(row, "original")?;
        let timestamp = parse_timestamp(&required_str(row, "timestamp")?)?;

        Ok(Self {
            url,
            timestamp,
            mime: optional_str(row, "mimetype"),
            status: parse_status(row.get("statuscode"))?,
            digest: match optional_str(row, "digest") {
                Some(d) => normalize_index_digest(&d)?,
                None => None,
            },
            locator: Locator::Replay,
        })
    }

    /// Builds a sharded-remote reference from a Common Crawl CDX row.
    ///
    /// `offset` and `length` arrive as decimal strings; numbers are accepted too.
    pub fn from_common_crawl_row(
        row: &CaptureIndexRecord,
        shard: Option<&str>,
    ) -> Result<Self, ArchiveError> {
        let url = required_str(row, "url")?;
        let timestamp = parse_timestamp(&required_str(row, "timestamp")?)?;

        Ok(Self {
            url,
            timestamp,
            mime: optional_str(row, "mime"),
            status: parse_status(row.get("status"))?,
            digest: match optional_str(row, "digest") {
                Some(d) => normalize_index_digest(&d)?,
                None => None,
            },
            locator: Locator::Sharded {
                filename: required_str(row, "filename")?,
                offset: required_u64(row, "offset")?,
                length: required_u64(row, "length")?,
                shard: shard.map(str::to_string),
            },
        })
    }
}

fn required_str(row: &CaptureIndexRecord, field: &str) -> Result<String, ArchiveError> {
    optional_str(row, field).ok_or_else(|| {
        ArchiveError::Protocol(format!(
            "CDX row is missing field '{}': {}",
            field,
            Value::Object(row.clone())
        ))
    })
}

fn optional_str(row: &CaptureIndexRecord, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_u64(row: &CaptureIndexRecord, field: &str) -> Result<u64, ArchiveError> {
    let raw = required_str(row, field)?;
    raw.trim().parse().map_err(|_| {
        ArchiveError::Protocol(format!("CDX field '{}' is not an integer: '{}'", field, raw))
    })
}

fn parse_status(value: Option<&Value>) -> Result<Option<u16>, ArchiveError> {
    let raw = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(ArchiveError::Protocol(format!(
                "unexpected status value: {}",
                other
            )))
        }
    };
    if raw == "-" {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| ArchiveError::Protocol(format!("unexpected status value: '{}'", raw)))
}
