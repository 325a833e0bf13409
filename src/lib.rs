//! webrefine - Find and fetch archived captures of a URL
//!
//! This library queries the Wayback Machine and Common Crawl CDX indexes for
//! captures of a URL and retrieves their content, from replay, from byte
//! ranges of remote WARC files, or from WARC files on local disk.
//!
//! # Features
//!
//! - **Unified CDX Queries**: One query contract for both archives
//! - **Shard Resolution**: Picks the Common Crawl indexes covering a time window
//! - **Lazy Pagination**: Streams Common Crawl results page by page
//! - **Local WARC Files**: Indexes plain and gzip WARC files, reads records by offset
//! - **Digest Verification**: Checks payloads against recorded SHA-1 digests
//! - **Automatic Retry**: Built-in retry logic for transient failures
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use webrefine::{ArchiveConfig, CdxQuery, CommonCrawlQuery, ReqwestTransport, TransportConfig, WebArchive};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(ReqwestTransport::new(TransportConfig::default())?);
//! let archive = WebArchive::new(transport, ArchiveConfig::default());
//!
//! let query = CdxQuery::new("example.com/")
//!     .between(Some("2021".to_string()), Some("2021".to_string()))
//!     .mime(["text/html"]);
//! let references = archive.common_crawl_all(&CommonCrawlQuery::new(query)).await?;
//! for reference in &references {
//!     let content = archive.fetch(reference).await?;
//!     println!("{} {:?}", reference.url, content.map(|c| c.len()));
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod cdx;
pub mod content;
pub mod digest;
pub mod error;
pub mod orchestrator;
pub mod record;
pub mod timestamp;
pub mod transport;
pub mod types;
pub mod warc;

pub use catalog::{ShardCatalog, ShardDescriptor};
pub use cdx::{CdxClient, CdxEndpoint, CdxQuery};
pub use content::ContentFetcher;
pub use error::ArchiveError;
pub use orchestrator::{CommonCrawlQuery, WebArchive};
pub use record::{CaptureReference, Locator};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use types::{ArchiveConfig, CaptureIndexRecord, TransportConfig};
pub use warc::{WarcFileQuery, WarcReader, WarcRecord};
