//! Content retrieval for capture references.

use crate::digest::verify_payload;
use crate::error::ArchiveError;
use crate::record::{CaptureReference, Locator};
use crate::transport::{HttpRequest, Transport};
use crate::types::ArchiveConfig;
use crate::warc::{read_local_content, WarcReader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Marker placed after the replay timestamp to ask for the archived bytes
/// without link rewriting or the replay banner.
pub const REPLAY_ORIGINAL_MARKER: &str = "id_";

/// Fetches payloads for [`CaptureReference`]s.
///
/// Each call is independent, so one fetcher can serve many concurrent
/// callers; size the transport's connection pool to match.
pub struct ContentFetcher<T> {
    transport: Arc<T>,
    config: ArchiveConfig,
}

impl<T> Clone for ContentFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport> ContentFetcher<T> {
    pub fn new(transport: Arc<T>, config: ArchiveConfig) -> Self {
        Self { transport, config }
    }

    /// Fetches the payload a reference points at.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the Wayback Machine no longer has the capture (HTTP
    /// 404 from replay). Every other failure is an error.
    pub async fn fetch(&self, reference: &CaptureReference) -> Result<Option<Vec<u8>>, ArchiveError> {
        match &reference.locator {
            Locator::LocalFile { path, offset } => {
                let content = fetch_local(path.clone(), *offset).await?;
                self.check_digest(reference, &content);
                Ok(Some(content))
            }
            Locator::Replay => {
                self.fetch_replay(&reference.timestamp_str(), &reference.url)
                    .await
            }
            Locator::Sharded {
                filename,
                offset,
                length,
                ..
            } => {
                let content = self.fetch_range(filename, *offset, *length).await?;
                self.check_digest(reference, &content);
                Ok(Some(content))
            }
        }
    }

    /// Replay URL for a capture, honouring `replay_original`.
    pub fn replay_url(&self, timestamp: &str, url: &str) -> String {
        let marker = if self.config.replay_original {
            REPLAY_ORIGINAL_MARKER
        } else {
            ""
        };
        format!(
            "{}/{}{}/{}",
            self.config.wayback_replay_url.trim_end_matches('/'),
            timestamp,
            marker,
            url
        )
    }

    /// Fetches a capture through Wayback Machine replay.
    ///
    /// The Internet Archive sometimes deletes captures that are still
    /// indexed; a 404 here yields `Ok(None)`.
    pub async fn fetch_replay(
        &self,
        timestamp: &str,
        url: &str,
    ) -> Result<Option<Vec<u8>>, ArchiveError> {
        let replay_url = self.replay_url(timestamp, url);
        debug!("Fetching replay {}", replay_url);

        let response = self.transport.get(HttpRequest::get(&replay_url)).await?;
        if response.status == 404 {
            warn!("Missing {}", replay_url);
            return Ok(None);
        }
        let response = response.error_for_status(&replay_url)?;
        Ok(Some(response.body.to_vec()))
    }

    /// Fetches `length` bytes at `offset` of a Common Crawl WARC file and
    /// returns the payload of the single record they hold.
    pub async fn fetch_range(
        &self,
        filename: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, ArchiveError> {
        if length == 0 {
            return Err(ArchiveError::Validation(format!(
                "cannot fetch an empty range of {} at offset {}",
                filename, offset
            )));
        }
        let data_url = format!("{}{}", self.config.cc_data_url, filename);
        let end_byte = offset.checked_add(length - 1).ok_or_else(|| {
            ArchiveError::Validation(format!(
                "byte range of {} overflows: offset {} length {}",
                filename, offset, length
            ))
        })?;
        info!("Fetching bytes {}-{} of {}", offset, end_byte, data_url);

        let request =
            HttpRequest::get(&data_url).header("Range", format!("bytes={}-{}", offset, end_byte));
        let response = self
            .transport
            .get(request)
            .await?
            .error_for_status(&data_url)?;

        if response.body.len() as u64 != length {
            warn!(
                "Range of {} returned {} bytes, expected {}",
                data_url,
                response.body.len(),
                length
            );
        }

        extract_single_record(&response.body).map_err(|e| match e {
            ArchiveError::Protocol(msg) => ArchiveError::Protocol(format!(
                "{} (bytes {}-{} of {})",
                msg, offset, end_byte, data_url
            )),
            other => other,
        })
    }

    fn check_digest(&self, reference: &CaptureReference, content: &[u8]) {
        if !self.config.verify_digests {
            return;
        }
        if let Some(expected) = &reference.digest {
            verify_payload(&reference.url, expected, content);
        }
    }
}

/// Decodes a byte range that must hold exactly one WARC record and returns
/// its payload.
///
/// A second decodable record means the offset or length was wrong upstream
/// and is reported as a protocol error rather than silently dropped.
pub fn extract_single_record(data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let mut records = WarcReader::new(data);

    let (_, record) = records.next().ok_or_else(|| {
        ArchiveError::Protocol("byte range holds no WARC record".to_string())
    })??;

    match records.next() {
        None => {}
        Some(Ok((offset, extra))) => {
            return Err(ArchiveError::Protocol(format!(
                "expected 1 record in byte range, found another {} record at offset {}",
                extra.record_type().unwrap_or("untyped"),
                offset
            )));
        }
        Some(Err(e)) => debug!("Ignoring undecodable bytes after record: {}", e),
    }

    record.payload()
}

async fn fetch_local(path: PathBuf, offset: u64) -> Result<Vec<u8>, ArchiveError> {
    tokio::task::spawn_blocking(move || read_local_content(&path, offset))
        .await
        .map_err(|e| {
            ArchiveError::IoError(std::io::Error::other(format!("Task join error: {}", e)))
        })?
}
