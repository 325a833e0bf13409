//! WARC container decoding.
//!
//! Reads records from plain WARC files and from files where each record is
//! its own gzip member (the usual `.warc.gz` layout). Each record is reported
//! with the byte offset it starts at, so it can be read again later by
//! seeking straight to it.

use crate::digest::parse_payload_digest;
use crate::error::ArchiveError;
use crate::record::{CaptureReference, Locator};
use chrono::{DateTime, Utc};
use flate2::bufread::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One decoded WARC record.
#[derive(Debug, Clone)]
pub struct WarcRecord {
    headers: Vec<(String, String)>,
    /// Raw record block (`Content-Length` bytes).
    pub block: Vec<u8>,
}

impl WarcRecord {
    /// Looks up a named header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// `WARC-Type` (e.g. `response`, `request`, `warcinfo`).
    pub fn record_type(&self) -> Option<&str> {
        self.header("WARC-Type")
    }

    /// `WARC-Target-URI`, without the angle brackets some writers add.
    pub fn target_uri(&self) -> Option<&str> {
        self.header("WARC-Target-URI")
            .map(|uri| uri.trim_start_matches('<').trim_end_matches('>'))
    }

    /// `WARC-Date` as a UTC instant.
    pub fn date(&self) -> Result<DateTime<Utc>, ArchiveError> {
        let raw = self
            .header("WARC-Date")
            .ok_or_else(|| ArchiveError::Protocol("WARC record has no WARC-Date".to_string()))?;
        DateTime::parse_from_rfc3339(raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|_| ArchiveError::Validation(format!("unparseable WARC-Date '{}'", raw)))
    }

    /// Parses the block as an HTTP message (for `response`/`request` records).
    pub fn http(&self) -> Result<HttpMessage, ArchiveError> {
        HttpMessage::parse(&self.block)
    }

    /// The record payload: the HTTP body for HTTP records, the whole block
    /// otherwise.
    pub fn payload(&self) -> Result<Vec<u8>, ArchiveError> {
        let is_http = self
            .header("Content-Type")
            .map(|ct| ct.starts_with("application/http"))
            .unwrap_or(false)
            || (matches!(self.record_type(), Some("response") | Some("request"))
                && self.block.starts_with(b"HTTP/"));
        if is_http {
            Ok(self.http()?.body)
        } else {
            Ok(self.block.clone())
        }
    }
}

/// An HTTP message stored in a record block.
#[derive(Debug, Clone)]
pub struct HttpMessage {
    /// Status code from the status line.
    pub status: u16,
    headers: Vec<(String, String)>,
    /// Entity body with chunked transfer coding and gzip or deflate
    /// content coding removed.
    pub body: Vec<u8>,
}

impl HttpMessage {
    fn parse(block: &[u8]) -> Result<Self, ArchiveError> {
        let (head_len, sep_len) = match find_subslice(block, b"\r\n\r\n") {
            Some(i) => (i, 4),
            None => match find_subslice(block, b"\n\n") {
                Some(i) => (i, 2),
                None => (block.len(), 0),
            },
        };
        let head = String::from_utf8_lossy(&block[..head_len]);
        let mut lines = head.lines();

        let status_line = lines.next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| {
                ArchiveError::Protocol(format!("invalid HTTP status line '{}'", status_line))
            })?;

        let headers = parse_header_lines(lines);
        let raw_body = &block[(head_len + sep_len).min(block.len())..];

        let chunked = find_header(&headers, "Transfer-Encoding")
            .map(|te| te.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let body = if chunked {
            dechunk(raw_body)?
        } else {
            raw_body.to_vec()
        };
        let body = match find_header(&headers, "Content-Encoding") {
            Some(encoding) => decode_content(encoding, body),
            None => body,
        };

        Ok(Self {
            status,
            headers,
            body,
        })
    }

    /// Looks up a named header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// `Content-Type` with any parameters stripped.
    pub fn mime(&self) -> Option<String> {
        self.header("Content-Type")
            .map(|ct| ct.split(';').next().unwrap_or_default().trim().to_string())
    }
}

/// A [`BufRead`] wrapper that tracks how many bytes were consumed.
struct CountingReader<R> {
    inner: R,
    position: u64,
}

impl<R: BufRead> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.position += amt as u64;
        self.inner.consume(amt);
    }
}

/// Iterates `(offset, record)` pairs from a WARC stream, in file order.
///
/// `base_offset` is added to every reported offset, for readers that start
/// partway through a file.
pub struct WarcReader<R> {
    reader: CountingReader<R>,
    base_offset: u64,
    done: bool,
}

impl<R: BufRead> WarcReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_offset(reader, 0)
    }

    pub fn with_offset(reader: R, base_offset: u64) -> Self {
        Self {
            reader: CountingReader {
                inner: reader,
                position: 0,
            },
            base_offset,
            done: false,
        }
    }

    fn read_next(&mut self) -> Result<Option<(u64, WarcRecord)>, ArchiveError> {
        // Records are separated by CRLF pairs; skip them.
        loop {
            let next = self.reader.fill_buf()?.first().copied();
            match next {
                None => return Ok(None),
                Some(b'\r') | Some(b'\n') => self.reader.consume(1),
                Some(_) => break,
            }
        }

        let offset = self.base_offset + self.reader.position;
        let is_gzip = self.reader.fill_buf()?.starts_with(&GZIP_MAGIC);

        let record = if is_gzip {
            // One gzip member per record; draining the member leaves the
            // underlying reader exactly at the next member.
            let mut member = BufReader::new(GzDecoder::new(&mut self.reader));
            let record = read_record(&mut member)?;
            if record.is_some() {
                if let Some(extra) = read_record(&mut member)? {
                    return Err(ArchiveError::Protocol(format!(
                        "gzip member at offset {} holds more than one record (next is {})",
                        offset,
                        extra.record_type().unwrap_or("untyped")
                    )));
                }
            }
            io::copy(&mut member, &mut io::sink())?;
            record
        } else {
            read_record(&mut self.reader)?
        };

        match record {
            Some(record) => Ok(Some((offset, record))),
            None => Ok(None),
        }
    }
}

impl<R: BufRead> Iterator for WarcReader<R> {
    type Item = Result<(u64, WarcRecord), ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads one uncompressed record, or `None` at end of input.
fn read_record<R: BufRead>(reader: &mut R) -> Result<Option<WarcRecord>, ArchiveError> {
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }
        if !text.starts_with("WARC/") {
            let preview: String = text.chars().take(40).collect();
            return Err(ArchiveError::Protocol(format!(
                "expected a WARC version line, got '{}'",
                preview
            )));
        }
        break;
    }

    let mut header_lines = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Err(ArchiveError::Protocol(
                "truncated WARC headers".to_string(),
            ));
        }
        let text = String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string();
        if text.is_empty() {
            break;
        }
        header_lines.push(text);
    }
    let headers = parse_header_lines(header_lines.iter().map(String::as_str));

    let length_raw = find_header(&headers, "Content-Length").ok_or_else(|| {
        ArchiveError::Protocol("WARC record has no Content-Length".to_string())
    })?;
    let length: u64 = length_raw.trim().parse().map_err(|_| {
        ArchiveError::Protocol(format!("invalid WARC Content-Length '{}'", length_raw))
    })?;

    // Grow with the data actually present; the header is untrusted.
    let mut block = Vec::new();
    reader.by_ref().take(length).read_to_end(&mut block)?;
    if (block.len() as u64) < length {
        return Err(ArchiveError::Protocol(format!(
            "WARC block of {} bytes is shorter than Content-Length {}",
            block.len(),
            length
        )));
    }

    Ok(Some(WarcRecord { headers, block }))
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.starts_with([' ', '\t']) {
            // Folded continuation of the previous header.
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn dechunk(mut data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let mut body = Vec::with_capacity(data.len());
    loop {
        let line_end = find_subslice(data, b"\r\n").ok_or_else(|| {
            ArchiveError::Protocol("chunked body is missing a chunk size line".to_string())
        })?;
        let size_line = String::from_utf8_lossy(&data[..line_end]);
        let size_field = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16).map_err(|_| {
            ArchiveError::Protocol(format!("invalid chunk size '{}'", size_field))
        })?;
        data = &data[line_end + 2..];
        if size == 0 {
            return Ok(body);
        }
        if data.len() < size {
            return Err(ArchiveError::Protocol(format!(
                "chunk of {} bytes truncated to {}",
                size,
                data.len()
            )));
        }
        body.extend_from_slice(&data[..size]);
        data = data[size..].strip_prefix(b"\r\n").unwrap_or(&data[size..]);
    }
}

/// Removes gzip or deflate content coding. Bodies that fail to decode, or
/// use another coding, are returned as stored.
fn decode_content(encoding: &str, body: Vec<u8>) -> Vec<u8> {
    let encoding = encoding.trim().to_ascii_lowercase();
    let mut decoded = Vec::new();
    let result = match encoding.as_str() {
        "gzip" | "x-gzip" => GzDecoder::new(&body[..]).read_to_end(&mut decoded),
        // "deflate" is meant to be zlib-wrapped, but raw streams are common.
        "deflate" => ZlibDecoder::new(&body[..])
            .read_to_end(&mut decoded)
            .or_else(|_| {
                decoded.clear();
                DeflateDecoder::new(&body[..]).read_to_end(&mut decoded)
            }),
        _ => return body,
    };
    match result {
        Ok(_) => decoded,
        Err(e) => {
            warn!("Could not decode {} content, keeping stored bytes: {}", encoding, e);
            body
        }
    }
}

/// Builds a local-file reference from a `response` record.
///
/// The payload digest must use the `sha1:` scheme.
pub fn reference_from_record(
    path: &Path,
    offset: u64,
    record: &WarcRecord,
) -> Result<CaptureReference, ArchiveError> {
    let url = record
        .target_uri()
        .ok_or_else(|| {
            ArchiveError::Protocol(format!(
                "response record at {}:{} has no WARC-Target-URI",
                path.display(),
                offset
            ))
        })?
        .to_string();
    let digest_raw = record.header("WARC-Payload-Digest").ok_or_else(|| {
        ArchiveError::Validation(format!(
            "response record for {} has no WARC-Payload-Digest",
            url
        ))
    })?;
    let http = record.http()?;

    Ok(CaptureReference {
        timestamp: record.date()?,
        mime: http.mime(),
        status: Some(http.status),
        digest: Some(parse_payload_digest(digest_raw)?),
        locator: Locator::LocalFile {
            path: path.to_path_buf(),
            offset,
        },
        url,
    })
}

/// Lists the HTTP responses captured in a local WARC file.
///
/// Every call re-reads the file, so the query can be repeated.
#[derive(Debug, Clone)]
pub struct WarcFileQuery {
    path: PathBuf,
}

impl WarcFileQuery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns a reference for each `response` record, in file order.
    pub fn query(&self) -> Result<Vec<CaptureReference>, ArchiveError> {
        info!("Reading WARC records from {}", self.path.display());
        let file = File::open(&self.path)?;
        let reader = WarcReader::new(BufReader::with_capacity(1024 * 1024, file));

        let mut references = Vec::new();
        for item in reader {
            let (offset, record) = item?;
            if record.record_type() != Some("response") {
                continue;
            }
            references.push(reference_from_record(&self.path, offset, &record)?);
        }
        debug!(
            "Found {} responses in {}",
            references.len(),
            self.path.display()
        );
        Ok(references)
    }
}

/// Reads the single record starting at `offset` in a local WARC file.
pub fn read_record_at(path: &Path, offset: u64) -> Result<WarcRecord, ArchiveError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = WarcReader::with_offset(BufReader::new(file), offset);
    match reader.next() {
        Some(item) => item.map(|(_, record)| record),
        None => Err(ArchiveError::Protocol(format!(
            "no WARC record at {}:{}",
            path.display(),
            offset
        ))),
    }
}

/// Reads the payload of the record starting at `offset` in a local WARC file.
pub fn read_local_content(path: &Path, offset: u64) -> Result<Vec<u8>, ArchiveError> {
    read_record_at(path, offset)?.payload()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::digest::sha1_base32;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Serializes a `response` record with the given HTTP body.
    pub fn response_record(url: &str, date: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut http = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            content_type,
            body.len()
        )
        .into_bytes();
        http.extend_from_slice(body);
        let digest = format!("sha1:{}", sha1_base32(body));
        raw_record(
            &[
                ("WARC-Type", "response"),
                ("WARC-Target-URI", url),
                ("WARC-Date", date),
                ("WARC-Payload-Digest", digest.as_str()),
                ("Content-Type", "application/http; msgtype=response"),
            ],
            &http,
        )
    }

    /// Serializes a `request` record.
    pub fn request_record(url: &str, date: &str) -> Vec<u8> {
        let http = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", url).into_bytes();
        raw_record(
            &[
                ("WARC-Type", "request"),
                ("WARC-Target-URI", url),
                ("WARC-Date", date),
                ("Content-Type", "application/http; msgtype=request"),
            ],
            &http,
        )
    }

    pub fn raw_record(headers: &[(&str, &str)], block: &[u8]) -> Vec<u8> {
        let mut out = b"WARC/1.0\r\n".to_vec();
        for (name, value) in headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", block.len()).as_bytes());
        out.extend_from_slice(block);
        out.extend_from_slice(b"\r\n\r\n");
        out
    }

    pub fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }
}
