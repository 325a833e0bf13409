//! Unified CDX client.
//!
//! The Wayback Machine and Common Crawl both serve a CDX index, but with a
//! different endpoint layout, filter syntax and response encoding:
//!
//! | | Wayback Machine | Common Crawl |
//! |---|---|---|
//! | Endpoints | one | one per crawl (shard) |
//! | Status filter | `statuscode:200` | `=status:200` |
//! | MIME filter | `mimetype:(a)\|(b)` | `~mime:(a)\|(b)` |
//! | Response | JSON array of arrays, header first | one JSON object per line |
//! | Paging | `limit`/`offset` | `showNumPages` then `page` |
//!
//! [`CdxEndpoint`] captures those differences so [`CdxClient`] can run one
//! query contract against either.

use crate::error::ArchiveError;
use crate::transport::{HttpRequest, Transport};
use crate::types::CaptureIndexRecord;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Crawls whose server-side status and MIME filtering is unreliable.
///
/// Queries against them are sent without filters; callers get every row for
/// the URL and must filter themselves.
pub const CC_API_FILTER_BLACKLIST: [&str; 2] = ["CC-MAIN-2015-11", "CC-MAIN-2015-06"];

/// Which CDX dialect an endpoint speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdxBackend {
    /// The Wayback Machine's single index.
    Wayback,
    /// One Common Crawl crawl index.
    CommonCrawl {
        /// Crawl identifier, e.g. `CC-MAIN-2021-43`.
        shard_id: String,
    },
}

/// A CDX endpoint and the dialect it speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdxEndpoint {
    pub api: String,
    pub backend: CdxBackend,
}

impl CdxEndpoint {
    pub fn wayback(api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            backend: CdxBackend::Wayback,
        }
    }

    pub fn common_crawl(shard_id: impl Into<String>, api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            backend: CdxBackend::CommonCrawl {
                shard_id: shard_id.into(),
            },
        }
    }

    /// Crawl identifier for Common Crawl endpoints.
    pub fn shard_id(&self) -> Option<&str> {
        match &self.backend {
            CdxBackend::Wayback => None,
            CdxBackend::CommonCrawl { shard_id } => Some(shard_id),
        }
    }

    /// Whether server-side filters can be trusted on this endpoint.
    pub fn supports_filters(&self) -> bool {
        match self.shard_id() {
            Some(id) => !CC_API_FILTER_BLACKLIST.contains(&id),
            None => true,
        }
    }

    fn status_filter(&self) -> &'static str {
        match self.backend {
            CdxBackend::Wayback => "statuscode:200",
            CdxBackend::CommonCrawl { .. } => "=status:200",
        }
    }

    fn mime_prefix(&self) -> &'static str {
        match self.backend {
            CdxBackend::Wayback => "mimetype:",
            CdxBackend::CommonCrawl { .. } => "~mime:",
        }
    }

    /// The `filter` parameters to send for a query.
    ///
    /// Empty for blacklisted crawls, whatever the query asks for.
    pub fn filters(&self, query: &CdxQuery) -> Vec<String> {
        if !self.supports_filters() {
            return Vec::new();
        }
        let mut filters = Vec::new();
        if query.status_ok {
            filters.push(self.status_filter().to_string());
        }
        if !query.mime.is_empty() {
            filters.push(mimetypes_to_regex(&query.mime, self.mime_prefix()));
        }
        filters
    }
}

/// Turns MIME wildcard patterns into a CDX regex filter.
///
/// `*` becomes `.*`; nothing is escaped, the server interprets the result.
///
/// ```
/// use webrefine::cdx::mimetypes_to_regex;
///
/// let mime = vec!["image/*".to_string(), "text/html".to_string()];
/// assert_eq!(mimetypes_to_regex(&mime, "mimetype:"), "mimetype:(image/.*)|(text/html)");
/// ```
pub fn mimetypes_to_regex(mime: &[String], prefix: &str) -> String {
    let alternatives: Vec<String> = mime
        .iter()
        .map(|m| format!("({})", m.replace('*', ".*")))
        .collect();
    format!("{}{}", prefix, alternatives.join("|"))
}

/// What to look up in a CDX index.
///
/// `start` and `end` are inclusive timestamp prefixes in `YYYYMMDDHHMMSS`
/// form, so `start = end = "202001"` covers all of January 2020.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdxQuery {
    pub url: String,
    pub start: Option<String>,
    pub end: Option<String>,
    /// Only return captures with HTTP status 200.
    pub status_ok: bool,
    /// MIME wildcard patterns, e.g. `image/*`. Empty means any.
    pub mime: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl CdxQuery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            start: None,
            end: None,
            status_ok: true,
            mime: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn between(mut self, start: Option<String>, end: Option<String>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn status_ok(mut self, status_ok: bool) -> Self {
        self.status_ok = status_ok;
        self
    }

    pub fn mime<S: Into<String>>(mut self, mime: impl IntoIterator<Item = S>) -> Self {
        self.mime = mime.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: Option<u64>) -> Self {
        self.offset = offset;
        self
    }
}

/// A page of a paginated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub index: u32,
    pub size: u32,
}

/// Runs CDX queries over a [`Transport`].
pub struct CdxClient<T> {
    transport: Arc<T>,
}

impl<T> Clone for CdxClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> CdxClient<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Builds the request for one query (and page, for paginated endpoints).
    pub fn build_request(
        &self,
        endpoint: &CdxEndpoint,
        query: &CdxQuery,
        page: Option<Page>,
    ) -> HttpRequest {
        let mut request = HttpRequest::get(&endpoint.api).query("url", &query.url);
        if let Some(page) = page {
            request = request.query("page", page.index);
        }
        request = request.query("output", "json");
        if let Some(start) = &query.start {
            request = request.query("from", start);
        }
        if let Some(end) = &query.end {
            request = request.query("to", end);
        }
        if let Some(page) = page {
            request = request.query("pageSize", page.size);
        }
        if let Some(limit) = query.limit {
            request = request.query("limit", limit);
        }
        if let Some(offset) = query.offset {
            request = request.query("offset", offset);
        }
        for filter in endpoint.filters(query) {
            request = request.query("filter", filter);
        }
        request
    }

    /// Runs one query and decodes the rows.
    ///
    /// For Common Crawl endpoints `page` selects the page to fetch; the
    /// Wayback Machine ignores it.
    pub async fn query(
        &self,
        endpoint: &CdxEndpoint,
        query: &CdxQuery,
        page: Option<Page>,
    ) -> Result<Vec<CaptureIndexRecord>, ArchiveError> {
        let page = match endpoint.backend {
            CdxBackend::Wayback => None,
            CdxBackend::CommonCrawl { .. } => page,
        };
        let request = self.build_request(endpoint, query, page);
        match page {
            Some(p) => debug!("Querying {} for {} (page {})", endpoint.api, query.url, p.index),
            None => info!("Querying {} for {}", endpoint.api, query.url),
        }

        let response = self
            .transport
            .get(request)
            .await?
            .error_for_status(&endpoint.api)?;

        match endpoint.backend {
            CdxBackend::Wayback => {
                let rows: Vec<Vec<Value>> = response.json()?;
                header_and_rows_to_records(rows)
            }
            CdxBackend::CommonCrawl { .. } => jsonl_to_records(&response.body),
        }
    }

    /// Asks a paginated endpoint how many pages a URL's results span.
    pub async fn num_pages(
        &self,
        endpoint: &CdxEndpoint,
        url: &str,
        page_size: u32,
    ) -> Result<u32, ArchiveError> {
        let request = HttpRequest::get(&endpoint.api)
            .query("url", url)
            .query("output", "json")
            .query("showNumPages", "true")
            .query("pageSize", page_size);

        let response = self
            .transport
            .get(request)
            .await?
            .error_for_status(&endpoint.api)?;
        let value: Value = response.json()?;

        let pages = match &value {
            Value::Number(n) => n.as_u64(),
            Value::Object(map) => map.get("pages").and_then(Value::as_u64),
            _ => None,
        };
        let pages = pages.ok_or_else(|| {
            ArchiveError::Protocol(format!(
                "unexpected page count response from {}: {}",
                endpoint.api, value
            ))
        })?;
        u32::try_from(pages).map_err(|_| {
            ArchiveError::Protocol(format!("page count {} from {} is too large", pages, endpoint.api))
        })
    }
}

/// Zips a header row against every following row.
///
/// Every row must be exactly as long as the header.
pub fn header_and_rows_to_records(
    rows: Vec<Vec<Value>>,
) -> Result<Vec<CaptureIndexRecord>, ArchiveError> {
    let mut rows = rows.into_iter();
    let header: Vec<String> = match rows.next() {
        Some(header) => header
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        None => return Ok(Vec::new()),
    };

    rows.enumerate()
        .map(|(i, row)| {
            if row.len() != header.len() {
                return Err(ArchiveError::Protocol(format!(
                    "row {} has {} fields but header has {}: {:?}",
                    i + 1,
                    row.len(),
                    header.len(),
                    row
                )));
            }
            Ok::<CaptureIndexRecord, ArchiveError>(header.iter().cloned().zip(row).collect())
        })
        .collect()
}

/// Decodes newline-delimited JSON objects, skipping blank lines.
pub fn jsonl_to_records(body: &[u8]) -> Result<Vec<CaptureIndexRecord>, ArchiveError> {
    body.split(|&b| b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| serde_json::from_slice::<CaptureIndexRecord>(line).map_err(ArchiveError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stub::StubTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const WAYBACK: &str = "http://web.archive.org/cdx/search/cdx";
    const CC_API: &str = "https://index.commoncrawl.org/CC-MAIN-2021-43-index";

    fn mime(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mimetypes_to_regex() {
        assert_eq!(
            mimetypes_to_regex(&mime(&["image/*", "text/html"]), "mimetype:"),
            "mimetype:(image/.*)|(text/html)"
        );
        assert_eq!(
            mimetypes_to_regex(&mime(&["text/*"]), "~mime:"),
            "~mime:(text/.*)"
        );
    }

    #[test]
    fn test_filter_dialects() {
        let query = CdxQuery::new("example.com").mime(["image/*"]);

        let wayback = CdxEndpoint::wayback(WAYBACK);
        assert_eq!(
            wayback.filters(&query),
            vec!["statuscode:200", "mimetype:(image/.*)"]
        );

        let cc = CdxEndpoint::common_crawl("CC-MAIN-2021-43", CC_API);
        assert_eq!(cc.filters(&query), vec!["=status:200", "~mime:(image/.*)"]);

        let no_filters = CdxQuery::new("example.com").status_ok(false);
        assert!(cc.filters(&no_filters).is_empty());
    }

    #[test]
    fn test_blacklisted_shard_drops_filters() {
        let endpoint = CdxEndpoint::common_crawl(
            "CC-MAIN-2015-11",
            "https://index.commoncrawl.org/CC-MAIN-2015-11-index",
        );
        assert!(!endpoint.supports_filters());
        let query = CdxQuery::new("example.com").mime(["text/html"]);
        assert!(endpoint.filters(&query).is_empty());
    }

    #[test]
    fn test_header_and_rows() {
        let rows = vec![
            vec![json!("timestamp"), json!("original")],
            vec![json!("20200101000000"), json!("http://a/")],
            vec![json!("20200102000000"), json!("http://b/")],
        ];
        let records = header_and_rows_to_records(rows).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["original"], "http://b/");
        assert!(header_and_rows_to_records(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_row_length_mismatch_is_protocol_error() {
        let rows = vec![
            vec![json!("timestamp"), json!("original")],
            vec![json!("20200101000000")],
        ];
        let err = header_and_rows_to_records(rows).unwrap_err();
        assert!(matches!(err, ArchiveError::Protocol(_)));
        assert!(err.to_string().contains("20200101000000"));
    }

    #[test]
    fn test_jsonl() {
        let body = b"{\"url\": \"a\"}\n{\"url\": \"b\"}\n\n";
        let records = jsonl_to_records(body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["url"], "a");
        assert!(jsonl_to_records(b"{not json}\n").is_err());
    }

    #[tokio::test]
    async fn test_wayback_query_request_and_decoding() {
        let stub = StubTransport::new();
        stub.respond(
            WAYBACK,
            200,
            r#"[["urlkey","timestamp","original"],["com,example)/","20200101000000","http://example.com/"]]"#,
        );
        let client = CdxClient::new(stub.clone());
        let query = CdxQuery::new("example.com")
            .between(Some("2020".to_string()), None)
            .mime(["image/*", "text/html"])
            .limit(Some(10));

        let rows = client
            .query(&CdxEndpoint::wayback(WAYBACK), &query, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["timestamp"], "20200101000000");

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.query_value("url"), Some("example.com"));
        assert_eq!(request.query_value("output"), Some("json"));
        assert_eq!(request.query_value("from"), Some("2020"));
        assert_eq!(request.query_value("to"), None);
        assert_eq!(request.query_value("limit"), Some("10"));
        assert_eq!(request.query_value("page"), None);
        assert_eq!(
            request.query_values("filter"),
            vec!["statuscode:200", "mimetype:(image/.*)|(text/html)"]
        );
    }

    #[tokio::test]
    async fn test_common_crawl_page_request() {
        let stub = StubTransport::new();
        stub.respond(
            CC_API,
            200,
            "{\"url\": \"http://example.com/\", \"timestamp\": \"20211020095231\"}\n",
        );
        let client = CdxClient::new(stub.clone());
        let endpoint = CdxEndpoint::common_crawl("CC-MAIN-2021-43", CC_API);
        let query = CdxQuery::new("example.com");

        let rows = client
            .query(&endpoint, &query, Some(Page { index: 2, size: 1 }))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let request = &stub.requests()[0];
        assert_eq!(request.query_value("page"), Some("2"));
        assert_eq!(request.query_value("pageSize"), Some("1"));
        assert_eq!(request.query_values("filter"), vec!["=status:200"]);
    }

    #[tokio::test]
    async fn test_num_pages() {
        let stub = StubTransport::new();
        stub.respond(CC_API, 200, r#"{"pages": 3, "pageSize": 1, "blocks": 3}"#);
        let client = CdxClient::new(stub.clone());
        let endpoint = CdxEndpoint::common_crawl("CC-MAIN-2021-43", CC_API);

        assert_eq!(client.num_pages(&endpoint, "example.com", 1).await.unwrap(), 3);
        let request = &stub.requests()[0];
        assert_eq!(request.query_value("showNumPages"), Some("true"));
        assert_eq!(request.query_value("pageSize"), Some("1"));
    }

    #[tokio::test]
    async fn test_http_error_is_surfaced() {
        let stub = StubTransport::new();
        stub.respond(WAYBACK, 403, "forbidden");
        let client = CdxClient::new(stub);
        let err = client
            .query(&CdxEndpoint::wayback(WAYBACK), &CdxQuery::new("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Http { status: 403, .. }));
    }
}
