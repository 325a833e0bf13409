//! Query orchestration across the Wayback Machine and Common Crawl.

use crate::catalog::{index_by_timestamp_prefix, ShardCatalog, ShardDescriptor};
use crate::cdx::{CdxClient, CdxEndpoint, CdxQuery, Page};
use crate::content::ContentFetcher;
use crate::error::ArchiveError;
use crate::record::CaptureReference;
use crate::transport::Transport;
use crate::types::ArchiveConfig;
use futures_util::stream::{self, Stream};
use futures_util::TryStreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A Common Crawl search: a CDX query plus the crawls to run it against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonCrawlQuery {
    pub query: CdxQuery,
    /// Crawl ids to search. `None` picks them from the query's time window.
    pub shards: Option<Vec<String>>,
    /// Results per page. `None` uses [`ArchiveConfig::page_size`].
    pub page_size: Option<u32>,
}

impl CommonCrawlQuery {
    pub fn new(query: CdxQuery) -> Self {
        Self {
            query,
            shards: None,
            page_size: None,
        }
    }

    pub fn shards(mut self, shards: Option<Vec<String>>) -> Self {
        self.shards = shards;
        self
    }

    pub fn page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }
}

/// Pagination state for one crawl.
struct ShardCursor {
    endpoint: CdxEndpoint,
    next_page: u32,
    num_pages: u32,
}

/// Pagination state across crawls.
struct PageCursor {
    pending: Option<VecDeque<ShardDescriptor>>,
    current: Option<ShardCursor>,
    buffered: VecDeque<CaptureReference>,
}

/// Entry point bundling the CDX client, shard catalog and content fetcher
/// over one shared transport.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use webrefine::{ArchiveConfig, CdxQuery, ReqwestTransport, TransportConfig, WebArchive};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(ReqwestTransport::new(TransportConfig::default())?);
/// let archive = WebArchive::new(transport, ArchiveConfig::default());
///
/// let query = CdxQuery::new("example.com").between(Some("2020".into()), Some("2020".into()));
/// for reference in archive.wayback(&query).await? {
///     if let Some(content) = archive.fetch(&reference).await? {
///         println!("{} {} bytes", reference.timestamp_str(), content.len());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct WebArchive<T> {
    config: ArchiveConfig,
    cdx: CdxClient<T>,
    catalog: ShardCatalog<T>,
    content: ContentFetcher<T>,
}

impl<T: Transport> WebArchive<T> {
    pub fn new(transport: Arc<T>, config: ArchiveConfig) -> Self {
        Self {
            cdx: CdxClient::new(Arc::clone(&transport)),
            catalog: ShardCatalog::new(
                Arc::clone(&transport),
                config.cc_index_list_url.clone(),
                config.catalog_ttl,
            ),
            content: ContentFetcher::new(transport, config.clone()),
            config,
        }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn cdx(&self) -> &CdxClient<T> {
        &self.cdx
    }

    pub fn catalog(&self) -> &ShardCatalog<T> {
        &self.catalog
    }

    pub fn content(&self) -> &ContentFetcher<T> {
        &self.content
    }

    /// Queries the Wayback Machine CDX index.
    pub async fn wayback(&self, query: &CdxQuery) -> Result<Vec<CaptureReference>, ArchiveError> {
        let endpoint = CdxEndpoint::wayback(&self.config.wayback_cdx_url);
        let rows = self.cdx.query(&endpoint, query, None).await?;
        info!("Wayback Machine returned {} captures for {}", rows.len(), query.url);
        rows.iter().map(CaptureReference::from_wayback_row).collect()
    }

    /// The crawls a Common Crawl search will visit, in listing order.
    pub async fn select_shards(
        &self,
        query: &CommonCrawlQuery,
    ) -> Result<Vec<ShardDescriptor>, ArchiveError> {
        let listing = self.catalog.shards().await?;

        let wanted = match &query.shards {
            Some(ids) => {
                for id in ids {
                    if !listing.iter().any(|s| &s.id == id) {
                        warn!("Unknown Common Crawl index {}, skipping", id);
                    }
                }
                ids.clone()
            }
            None => {
                let ids: Vec<String> = listing.iter().map(|s| s.id.clone()).collect();
                index_by_timestamp_prefix(
                    query.query.start.as_deref(),
                    query.query.end.as_deref(),
                    &ids,
                )?
            }
        };

        Ok(listing
            .iter()
            .filter(|s| wanted.contains(&s.id))
            .cloned()
            .collect())
    }

    /// Searches Common Crawl, crawl by crawl and page by page.
    ///
    /// The stream is lazy: nothing is requested until it is polled, and each
    /// crawl's page count is fetched just before its first page. Pages within
    /// a crawl are fetched strictly in order. Any failure ends the stream
    /// with that error; no page is skipped silently.
    pub fn common_crawl<'a>(
        &'a self,
        query: &'a CommonCrawlQuery,
    ) -> impl Stream<Item = Result<CaptureReference, ArchiveError>> + 'a {
        let cursor = PageCursor {
            pending: None,
            current: None,
            buffered: VecDeque::new(),
        };
        let page_size = query.page_size.unwrap_or(self.config.page_size);

        stream::try_unfold(cursor, move |mut cursor| async move {
            loop {
                if let Some(reference) = cursor.buffered.pop_front() {
                    return Ok::<_, ArchiveError>(Some((reference, cursor)));
                }

                if cursor.pending.is_none() {
                    let shards = self.select_shards(query).await?;
                    info!(
                        "Searching {} Common Crawl index(es) for {}",
                        shards.len(),
                        query.query.url
                    );
                    cursor.pending = Some(shards.into());
                }

                if let Some(shard) = cursor.current.as_mut() {
                    if shard.next_page < shard.num_pages {
                        let page = Page {
                            index: shard.next_page,
                            size: page_size,
                        };
                        let rows = self.cdx.query(&shard.endpoint, &query.query, Some(page)).await?;
                        debug!(
                            "Page {}/{} of {} returned {} rows",
                            page.index + 1,
                            shard.num_pages,
                            shard.endpoint.api,
                            rows.len()
                        );
                        for row in &rows {
                            cursor.buffered.push_back(CaptureReference::from_common_crawl_row(
                                row,
                                shard.endpoint.shard_id(),
                            )?);
                        }
                        shard.next_page += 1;
                        continue;
                    }
                    cursor.current = None;
                }

                let Some(next) = cursor.pending.as_mut().and_then(VecDeque::pop_front) else {
                    return Ok(None);
                };
                let endpoint = CdxEndpoint::common_crawl(next.id, next.cdx_api);
                if !endpoint.supports_filters()
                    && (query.query.status_ok || !query.query.mime.is_empty())
                {
                    warn!(
                        "Index {} has unreliable filters; status and MIME filters are not applied",
                        endpoint.shard_id().unwrap_or_default()
                    );
                }
                let num_pages = self
                    .cdx
                    .num_pages(&endpoint, &query.query.url, page_size)
                    .await?;
                info!("Index {} has {} page(s)", endpoint.api, num_pages);
                cursor.current = Some(ShardCursor {
                    endpoint,
                    next_page: 0,
                    num_pages,
                });
            }
        })
    }

    /// Collects a whole Common Crawl search.
    pub async fn common_crawl_all(
        &self,
        query: &CommonCrawlQuery,
    ) -> Result<Vec<CaptureReference>, ArchiveError> {
        self.common_crawl(query).try_collect().await
    }

    /// Fetches the payload a reference points at. See [`ContentFetcher::fetch`].
    pub async fn fetch(&self, reference: &CaptureReference) -> Result<Option<Vec<u8>>, ArchiveError> {
        self.content.fetch(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Locator;
    use crate::transport::stub::StubTransport;
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;

    const LISTING_URL: &str = "https://index.commoncrawl.org/collinfo.json";
    const API_2021: &str = "https://index.commoncrawl.org/CC-MAIN-2021-43-index";
    const API_2015: &str = "https://index.commoncrawl.org/CC-MAIN-2015-11-index";

    const LISTING: &str = r#"[
        {"id": "CC-MAIN-2021-43", "name": "October 2021 Index", "cdx-api": "https://index.commoncrawl.org/CC-MAIN-2021-43-index"},
        {"id": "CC-MAIN-2015-11", "name": "March 2015 Index", "cdx-api": "https://index.commoncrawl.org/CC-MAIN-2015-11-index"}
    ]"#;

    fn row(url: &str, offset: u64) -> String {
        format!(
            "{{\"url\": \"{}\", \"timestamp\": \"20211020095231\", \"mime\": \"text/html\", \"status\": \"200\", \"filename\": \"crawl-data/a.warc.gz\", \"offset\": \"{}\", \"length\": \"100\"}}\n",
            url, offset
        )
    }

    fn archive(stub: &Arc<StubTransport>) -> WebArchive<StubTransport> {
        stub.respond(LISTING_URL, 200, LISTING);
        WebArchive::new(Arc::clone(stub), ArchiveConfig::default())
    }

    fn offsets(references: &[CaptureReference]) -> Vec<u64> {
        references
            .iter()
            .map(|r| match &r.locator {
                Locator::Sharded { offset, .. } => *offset,
                other => panic!("unexpected locator {:?}", other),
            })
            .collect()
    }

    fn page_calls(stub: &StubTransport, api: &str) -> (usize, Vec<String>) {
        let requests = stub.requests_to(api);
        let counts = requests
            .iter()
            .filter(|r| r.query_value("showNumPages").is_some())
            .count();
        let pages = requests
            .iter()
            .filter_map(|r| r.query_value("page").map(str::to_string))
            .collect();
        (counts, pages)
    }

    #[tokio::test]
    async fn test_paginates_in_page_order() {
        let stub = StubTransport::new();
        let archive = archive(&stub);
        stub.respond_when(API_2021, &[("showNumPages", "true")], 200, r#"{"pages": 3}"#);
        stub.respond_when(API_2021, &[("page", "0")], 200, row("http://example.com/", 0));
        stub.respond_when(API_2021, &[("page", "1")], 200, row("http://example.com/", 1));
        stub.respond_when(API_2021, &[("page", "2")], 200, row("http://example.com/", 2));

        let query = CommonCrawlQuery::new(CdxQuery::new("example.com"))
            .shards(Some(vec!["CC-MAIN-2021-43".to_string()]));
        let references = archive.common_crawl_all(&query).await.unwrap();

        assert_eq!(offsets(&references), vec![0, 1, 2]);
        assert_eq!(
            references[0].locator,
            Locator::Sharded {
                filename: "crawl-data/a.warc.gz".to_string(),
                offset: 0,
                length: 100,
                shard: Some("CC-MAIN-2021-43".to_string()),
            }
        );
        let (counts, pages) = page_calls(&stub, API_2021);
        assert_eq!(counts, 1);
        assert_eq!(pages, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_blacklisted_shard_omits_filters() {
        let stub = StubTransport::new();
        let archive = archive(&stub);
        stub.respond_when(API_2015, &[("showNumPages", "true")], 200, r#"{"pages": 1}"#);
        stub.respond_when(API_2015, &[("page", "0")], 200, row("http://example.com/", 7));

        let query = CommonCrawlQuery::new(
            CdxQuery::new("example.com")
                .status_ok(true)
                .mime(["text/*"]),
        )
        .shards(Some(vec!["CC-MAIN-2015-11".to_string()]));
        let references = archive.common_crawl_all(&query).await.unwrap();
        assert_eq!(offsets(&references), vec![7]);

        for request in stub.requests_to(API_2015) {
            assert!(request.query_values("filter").is_empty(), "{:?}", request);
        }
    }

    #[tokio::test]
    async fn test_shards_visited_in_listing_order() {
        let stub = StubTransport::new();
        let archive = archive(&stub);
        stub.respond_when(API_2021, &[("showNumPages", "true")], 200, r#"{"pages": 1}"#);
        stub.respond_when(API_2021, &[("page", "0")], 200, row("http://example.com/", 21));
        stub.respond_when(API_2015, &[("showNumPages", "true")], 200, r#"{"pages": 1}"#);
        stub.respond_when(API_2015, &[("page", "0")], 200, row("http://example.com/", 15));

        // Requested out of listing order; results still follow the listing.
        let query = CommonCrawlQuery::new(CdxQuery::new("example.com")).shards(Some(vec![
            "CC-MAIN-2015-11".to_string(),
            "CC-MAIN-2021-43".to_string(),
            "CC-MAIN-1999-01".to_string(),
        ]));
        let references = archive.common_crawl_all(&query).await.unwrap();
        assert_eq!(offsets(&references), vec![21, 15]);

        let filters: Vec<Vec<String>> = stub
            .requests_to(API_2021)
            .iter()
            .filter(|r| r.query_value("page").is_some())
            .map(|r| r.query_values("filter").iter().map(|s| s.to_string()).collect())
            .collect();
        assert_eq!(filters, vec![vec!["=status:200".to_string()]]);
    }

    #[tokio::test]
    async fn test_time_window_selects_shards() {
        let stub = StubTransport::new();
        let archive = archive(&stub);
        let query = CommonCrawlQuery::new(
            CdxQuery::new("example.com").between(Some("2021".to_string()), None),
        );
        let shards = archive.select_shards(&query).await.unwrap();
        let ids: Vec<&str> = shards.iter().map(|s| s.id.as_str()).collect();
        // The 2015 crawl is the nearest before the window, so it is kept.
        assert_eq!(ids, vec!["CC-MAIN-2021-43", "CC-MAIN-2015-11"]);
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let stub = StubTransport::new();
        let archive = archive(&stub);
        let query = CommonCrawlQuery::new(CdxQuery::new("example.com"));
        let stream = archive.common_crawl(&query);
        assert!(stub.requests().is_empty());
        drop(stream);
    }

    #[tokio::test]
    async fn test_failed_page_ends_stream_with_error() {
        let stub = StubTransport::new();
        let archive = archive(&stub);
        stub.respond_when(API_2021, &[("showNumPages", "true")], 200, r#"{"pages": 2}"#);
        stub.respond_when(API_2021, &[("page", "0")], 200, row("http://example.com/", 0));
        stub.respond_when(API_2021, &[("page", "1")], 500, "boom");

        let query = CommonCrawlQuery::new(CdxQuery::new("example.com"))
            .shards(Some(vec!["CC-MAIN-2021-43".to_string()]));
        let results: Vec<_> = archive.common_crawl(&query).collect().await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(ArchiveError::Http { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_inverted_window_is_validation_error() {
        let stub = StubTransport::new();
        let archive = archive(&stub);
        let query = CommonCrawlQuery::new(
            CdxQuery::new("example.com").between(Some("2021".to_string()), Some("2020".to_string())),
        );
        let err = archive.common_crawl_all(&query).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Validation(_)));
    }

    #[tokio::test]
    async fn test_wayback_references() {
        let stub = StubTransport::new();
        stub.respond(
            "http://web.archive.org/cdx/search/cdx",
            200,
            r#"[["urlkey","timestamp","original","mimetype","statuscode","digest","length"],
                ["com,example)/","20200115123000","http://example.com/","text/html","200","3I42H3S6NNFQ2MSVX7XZKYAYSCX5QBYJ","512"]]"#,
        );
        let archive = WebArchive::new(Arc::clone(&stub), ArchiveConfig::default());
        let references = archive.wayback(&CdxQuery::new("example.com")).await.unwrap();
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].locator, Locator::Replay);
        assert_eq!(references[0].timestamp_str(), "20200115123000");
    }
}
