use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use percent_encoding::percent_decode_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderValue, CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH, RANGE};
use reqwest::{Client, ClientBuilder, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::bandwidth::TransferStats;
use crate::types::{Checksum, FileKind, RemotePermissions};

const METADATA_TIMEOUT: Duration = Duration::from_secs(60);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const HDR_FILE_ID: &str = "OC-FileId";
pub const HDR_ETAG: &str = "OC-ETag";
pub const HDR_MTIME: &str = "X-OC-Mtime";
pub const HDR_CHECKSUM: &str = "OC-Checksum";
pub const HDR_TOTAL_LENGTH: &str = "OC-Total-Length";
pub const HDR_UPLOAD_OFFSET: &str = "Upload-Offset";

/// Typed HTTP failure so callers can branch on the status code
/// (412 precondition, 423 locked, 507 insufficient storage).
#[derive(Debug)]
pub struct DavError {
    pub status: StatusCode,
    pub message: String,
}

impl std::fmt::Display for DavError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl std::error::Error for DavError {}

pub fn dav_status(err: &anyhow::Error) -> Option<StatusCode> {
    err.downcast_ref::<DavError>().map(|e| e.status)
}

/// Signs outgoing requests and reports invalidation. Acquisition of the
/// credential itself (OAuth, keychain) is an external collaborator.
pub trait CredentialProvider: Send + Sync {
    fn apply(&self, req: RequestBuilder) -> RequestBuilder;
    fn invalidate(&self);
    fn is_invalidated(&self) -> bool;
}

pub struct BasicCredentials {
    username: String,
    password: String,
    invalidated: AtomicBool,
}

impl BasicCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            invalidated: AtomicBool::new(false),
        }
    }
}

impl CredentialProvider for BasicCredentials {
    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        req.basic_auth(&self.username, Some(&self.password))
    }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingNg {
    pub enabled: bool,
    pub min_chunk_size: i64,
    pub max_chunk_size: i64,
    pub target_chunk_upload_duration: u64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChecksumCaps {
    pub supported_types: Vec<String>,
}

/// Server capabilities document, queried once per session.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Capabilities {
    pub chunking_ng: ChunkingNg,
    pub bigfilechunking: bool,
    pub resumable_upload: bool,
    pub checksums: ChecksumCaps,
    pub remote_poll_interval: Option<u64>,
    pub private_links: bool,
    #[serde(skip)]
    pub http2: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDialect {
    FixedChunks,
    ServerOffsets,
    ResumableToken,
}

impl Capabilities {
    /// Dialect preference: the token dialect resumes cheapest, the offset
    /// dialect next; numbered fixed chunks are the legacy fallback.
    pub fn preferred_dialect(&self) -> Option<ChunkDialect> {
        if self.resumable_upload {
            Some(ChunkDialect::ResumableToken)
        } else if self.chunking_ng.enabled {
            Some(ChunkDialect::ServerOffsets)
        } else if self.bigfilechunking {
            Some(ChunkDialect::FixedChunks)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Relative to the sync root, forward slashes.
    pub path: String,
    pub kind: FileKind,
    pub size: i64,
    pub mtime: i64,
    pub etag: String,
    pub file_id: String,
    pub perms: RemotePermissions,
    pub is_shared_mount: bool,
    pub checksum: Option<Checksum>,
    /// Recursively enumerated size, directories only.
    pub dir_size: i64,
}

#[derive(Debug, Clone)]
pub struct DirListing {
    pub etag: String,
    pub entries: Vec<RemoteEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct PutResult {
    pub etag: String,
    pub file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenUpload {
    pub token: String,
    pub offset: i64,
}

/// WebDAV subset client for one sync root. Metadata requests run with a
/// 60 s timeout, data transfers with 5 min; each chunk of a chunked upload
/// is its own request, so ongoing uploads keep resetting the clock.
pub struct DavClient {
    meta_http: Client,
    data_http: Client,
    base: Url,
    remote_root: String,
    creds: Arc<dyn CredentialProvider>,
    stats: Arc<TransferStats>,
}

impl DavClient {
    pub fn new(
        server_url: &str,
        remote_root: &str,
        creds: Arc<dyn CredentialProvider>,
        stats: Arc<TransferStats>,
    ) -> Result<Self> {
        let base = Url::parse(server_url)
            .with_context(|| format!("invalid server url {server_url}"))?;
        let meta_http = ClientBuilder::new()
            .timeout(METADATA_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("davsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let data_http = ClientBuilder::new()
            .timeout(TRANSFER_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("davsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            meta_http,
            data_http,
            base,
            remote_root: remote_root.trim_matches('/').to_string(),
            creds,
            stats,
        })
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        self.creds.clone()
    }

    fn files_url(&self, rel: &str) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("server url cannot be a base"))?;
            segments.push("dav").push("files");
            for seg in self.remote_root.split('/').filter(|s| !s.is_empty()) {
                segments.push(seg);
            }
            for seg in rel.split('/').filter(|s| !s.is_empty()) {
                segments.push(seg);
            }
        }
        Ok(url)
    }

    fn uploads_url(&self, segs: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("server url cannot be a base"))?;
            segments.push("dav").push("uploads");
            for seg in segs.iter().filter(|s| !s.is_empty()) {
                segments.push(seg);
            }
        }
        Ok(url)
    }

    async fn send(&self, req: RequestBuilder, op: &str) -> Result<Response> {
        let req = self.creds.apply(req);
        let resp = req.send().await.with_context(|| format!("{op} request"))?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.creds.invalidate();
        }
        Ok(resp)
    }

    async fn expect_success(&self, resp: Response, op: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        let err = DavError {
            status,
            message: format!("{op}: {message}"),
        };
        self.stats.set_last_error(err.to_string());
        Err(anyhow::Error::new(err))
    }

    // -- capabilities ------------------------------------------------------

    pub async fn capabilities(&self) -> Result<Capabilities> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("server url cannot be a base"))?
            .push("capabilities");
        let resp = self.send(self.meta_http.get(url), "capabilities").await?;
        let http2 = resp.version() == reqwest::Version::HTTP_2;
        let resp = self.expect_success(resp, "capabilities").await?;
        let mut caps: Capabilities = resp.json().await.context("parse capabilities")?;
        caps.http2 = http2;
        Ok(caps)
    }

    // -- propfind ----------------------------------------------------------

    pub async fn stat(&self, rel: &str) -> Result<Option<RemoteEntry>> {
        let responses = match self.propfind(rel, "0").await {
            Ok(r) => r,
            Err(err) if dav_status(&err) == Some(StatusCode::NOT_FOUND) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(responses
            .into_iter()
            .next()
            .and_then(|r| self.to_entry(r)))
    }

    pub async fn root_etag(&self) -> Result<String> {
        let responses = self.propfind("", "0").await?;
        Ok(responses
            .into_iter()
            .next()
            .map(|r| normalize_etag(&r.etag))
            .unwrap_or_default())
    }

    /// Depth-one listing of a collection.
    pub async fn list(&self, rel: &str) -> Result<DirListing> {
        let responses = self.propfind(rel, "1").await?;
        let mut etag = String::new();
        let mut entries = Vec::new();
        for resp in responses {
            let Some(entry) = self.to_entry(resp) else {
                continue;
            };
            if entry.path == rel || (rel.is_empty() && entry.path.is_empty()) {
                etag = entry.etag.clone();
                continue;
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(DirListing { etag, entries })
    }

    async fn propfind(&self, rel: &str, depth: &str) -> Result<Vec<DavResponse>> {
        let url = self.files_url(rel)?;
        let req = self
            .meta_http
            .request(Method::from_bytes(b"PROPFIND")?, url)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let resp = self.send(req, "propfind").await?;
        let resp = self.expect_success(resp, "propfind").await?;
        let body = resp.text().await.context("read propfind body")?;
        parse_multistatus(&body)
    }

    fn to_entry(&self, resp: DavResponse) -> Option<RemoteEntry> {
        let rel = self.rel_from_href(&resp.href)?;
        let perms = RemotePermissions::from_dav_string(&resp.permissions);
        Some(RemoteEntry {
            path: rel,
            kind: if resp.is_collection {
                FileKind::Directory
            } else {
                FileKind::File
            },
            size: resp.content_length,
            mtime: resp.mtime,
            etag: normalize_etag(&resp.etag),
            file_id: resp.file_id,
            is_shared_mount: perms.has(RemotePermissions::MOUNTED),
            perms,
            checksum: Checksum::parse(&resp.checksum),
            dir_size: resp.dir_size,
        })
    }

    fn rel_from_href(&self, href: &str) -> Option<String> {
        let decoded = percent_decode_str(href).decode_utf8_lossy().to_string();
        let idx = decoded.find("/dav/files")?;
        let mut rest = &decoded[idx + "/dav/files".len()..];
        rest = rest.trim_matches('/');
        if !self.remote_root.is_empty() {
            rest = rest.strip_prefix(self.remote_root.as_str())?;
            rest = rest.trim_matches('/');
        }
        Some(rest.to_string())
    }

    // -- plain transfers ---------------------------------------------------

    /// Begin a download, optionally resuming a partial temp file.
    pub async fn download(&self, rel: &str, resume_offset: u64) -> Result<Response> {
        let mut req = self.data_http.get(self.files_url(rel)?);
        if resume_offset > 0 {
            req = req.header(RANGE, format!("bytes={resume_offset}-"));
        }
        let resp = self.send(req, "download").await?;
        self.expect_success(resp, "download").await
    }

    pub async fn put(
        &self,
        rel: &str,
        body: reqwest::Body,
        base_etag: Option<&str>,
        checksum: Option<&Checksum>,
        mtime: i64,
    ) -> Result<PutResult> {
        let mut req = self
            .data_http
            .put(self.files_url(rel)?)
            .header(HDR_MTIME, mtime.to_string())
            .body(body);
        req = with_precondition(req, base_etag);
        if let Some(sum) = checksum {
            req = req.header(HDR_CHECKSUM, sum.header_value());
        }
        let resp = self.send(req, "put").await?;
        let resp = self.expect_success(resp, "put").await?;
        Ok(put_result_from_headers(&resp))
    }

    pub async fn mkcol(&self, rel: &str) -> Result<PutResult> {
        let req = self
            .meta_http
            .request(Method::from_bytes(b"MKCOL")?, self.files_url(rel)?);
        let resp = self.send(req, "mkcol").await?;
        let resp = self.expect_success(resp, "mkcol").await?;
        Ok(put_result_from_headers(&resp))
    }

    pub async fn delete(&self, rel: &str) -> Result<()> {
        let req = self.meta_http.delete(self.files_url(rel)?);
        let resp = self.send(req, "delete").await?;
        self.expect_success(resp, "delete").await?;
        Ok(())
    }

    pub async fn mv(&self, from_rel: &str, to_rel: &str) -> Result<PutResult> {
        let req = self
            .meta_http
            .request(Method::from_bytes(b"MOVE")?, self.files_url(from_rel)?)
            .header("Destination", self.files_url(to_rel)?.to_string())
            .header("Overwrite", "F");
        let resp = self.send(req, "move").await?;
        let resp = self.expect_success(resp, "move").await?;
        Ok(put_result_from_headers(&resp))
    }

    // -- chunked upload, legacy fixed-chunk dialect ------------------------

    /// `PUT <name>-chunking-<transfer>-<total>-<index>`. The server
    /// assembles after the last chunk and answers it with etag and file id;
    /// only that final chunk carries the destination precondition.
    pub async fn put_chunk_fixed(
        &self,
        rel: &str,
        transfer_id: &str,
        index: i64,
        total: i64,
        body: reqwest::Body,
        base_etag: Option<&str>,
        mtime: i64,
    ) -> Result<PutResult> {
        let chunk_rel = match rel.rsplit_once('/') {
            Some((dir, name)) => {
                format!("{dir}/{name}-chunking-{transfer_id}-{total}-{index}")
            }
            None => format!("{rel}-chunking-{transfer_id}-{total}-{index}"),
        };
        let mut req = self
            .data_http
            .put(self.files_url(&chunk_rel)?)
            .header(HDR_MTIME, mtime.to_string())
            .body(body);
        if index == total - 1 {
            req = with_precondition(req, base_etag);
        }
        let resp = self.send(req, "chunk put").await?;
        let resp = self.expect_success(resp, "chunk put").await?;
        Ok(put_result_from_headers(&resp))
    }

    // -- chunked upload, server-offsets (chunking-NG) dialect --------------

    pub async fn ng_create_session(&self, transfer_id: &str) -> Result<()> {
        let req = self
            .meta_http
            .request(Method::from_bytes(b"MKCOL")?, self.uploads_url(&[transfer_id])?);
        let resp = self.send(req, "ng session create").await?;
        self.expect_success(resp, "ng session create").await?;
        Ok(())
    }

    pub async fn ng_put_chunk(
        &self,
        transfer_id: &str,
        offset: i64,
        body: reqwest::Body,
    ) -> Result<()> {
        let name = format!("{offset:016}");
        let req = self
            .data_http
            .put(self.uploads_url(&[transfer_id, &name])?)
            .body(body);
        let resp = self.send(req, "ng chunk put").await?;
        self.expect_success(resp, "ng chunk put").await?;
        Ok(())
    }

    /// Final `MOVE` of the session's assembly file onto the destination.
    pub async fn ng_assemble(
        &self,
        transfer_id: &str,
        dest_rel: &str,
        base_etag: Option<&str>,
        total_length: i64,
        mtime: i64,
    ) -> Result<PutResult> {
        let mut req = self
            .data_http
            .request(
                Method::from_bytes(b"MOVE")?,
                self.uploads_url(&[transfer_id, ".file"])?,
            )
            .header("Destination", self.files_url(dest_rel)?.to_string())
            .header(HDR_TOTAL_LENGTH, total_length.to_string())
            .header(HDR_MTIME, mtime.to_string());
        req = with_precondition(req, base_etag);
        let resp = self.send(req, "ng assemble").await?;
        let resp = self.expect_success(resp, "ng assemble").await?;
        Ok(put_result_from_headers(&resp))
    }

    pub async fn ng_abort_session(&self, transfer_id: &str) -> Result<()> {
        let req = self.meta_http.delete(self.uploads_url(&[transfer_id])?);
        let resp = self.send(req, "ng session abort").await?;
        self.expect_success(resp, "ng session abort").await?;
        Ok(())
    }

    // -- chunked upload, resumable-token dialect ---------------------------

    pub async fn token_start(&self, dest_rel: &str, size: i64) -> Result<TokenUpload> {
        let req = self
            .meta_http
            .post(self.uploads_url(&[])?)
            .query(&[("path", dest_rel), ("size", &size.to_string())]);
        let resp = self.send(req, "token start").await?;
        let resp = self.expect_success(resp, "token start").await?;
        resp.json().await.context("parse token upload response")
    }

    /// Probe the server's current offset for a token (crash resume).
    pub async fn token_probe(&self, token: &str) -> Result<i64> {
        let req = self.meta_http.head(self.uploads_url(&[token])?);
        let resp = self.send(req, "token probe").await?;
        let resp = self.expect_success(resp, "token probe").await?;
        Ok(header_i64(&resp, HDR_UPLOAD_OFFSET).unwrap_or(0))
    }

    /// Append one chunk at `offset`; the server answers with its new offset.
    pub async fn token_put_chunk(
        &self,
        token: &str,
        offset: i64,
        body: reqwest::Body,
    ) -> Result<i64> {
        let req = self
            .data_http
            .put(self.uploads_url(&[token])?)
            .header(HDR_UPLOAD_OFFSET, offset.to_string())
            .body(body);
        let resp = self.send(req, "token chunk put").await?;
        let resp = self.expect_success(resp, "token chunk put").await?;
        Ok(header_i64(&resp, HDR_UPLOAD_OFFSET).unwrap_or(offset))
    }

    pub async fn token_finalize(
        &self,
        token: &str,
        dest_rel: &str,
        base_etag: Option<&str>,
        mtime: i64,
    ) -> Result<PutResult> {
        let mut req = self
            .meta_http
            .post(self.uploads_url(&[token, "finalize"])?)
            .query(&[("path", dest_rel), ("mtime", &mtime.to_string())]);
        req = with_precondition(req, base_etag);
        let resp = self.send(req, "token finalize").await?;
        let resp = self.expect_success(resp, "token finalize").await?;
        Ok(put_result_from_headers(&resp))
    }

    pub async fn token_abort(&self, token: &str) -> Result<()> {
        let req = self.meta_http.delete(self.uploads_url(&[token])?);
        let resp = self.send(req, "token abort").await?;
        self.expect_success(resp, "token abort").await?;
        Ok(())
    }
}

pub fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

fn quote_etag(etag: &str) -> String {
    format!("\"{}\"", normalize_etag(etag))
}

/// Lost-update guard: updates assert the known etag with `If-Match`,
/// creates assert absence with `If-None-Match: *`. Either way a 412 means
/// the server moved first.
fn with_precondition(req: RequestBuilder, base_etag: Option<&str>) -> RequestBuilder {
    match base_etag {
        Some(etag) => req.header(IF_MATCH, quote_etag(etag)),
        None => req.header(IF_NONE_MATCH, "*"),
    }
}

fn put_result_from_headers(resp: &Response) -> PutResult {
    let etag = resp
        .headers()
        .get(HDR_ETAG)
        .or_else(|| resp.headers().get(ETAG))
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(normalize_etag)
        .unwrap_or_default();
    let file_id = resp
        .headers()
        .get(HDR_FILE_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    PutResult { etag, file_id }
}

fn header_i64(resp: &Response, name: &str) -> Option<i64> {
    resp.headers()
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:prop>
    <d:getetag/>
    <d:getlastmodified/>
    <d:getcontentlength/>
    <d:resourcetype/>
    <oc:id/>
    <oc:permissions/>
    <oc:checksums/>
    <oc:size/>
  </d:prop>
</d:propfind>
"#;

#[derive(Debug, Default, Clone)]
struct DavResponse {
    href: String,
    is_collection: bool,
    etag: String,
    mtime: i64,
    content_length: i64,
    file_id: String,
    permissions: String,
    checksum: String,
    dir_size: i64,
}

/// Tolerant multistatus parser: matches on local element names so any
/// namespace prefix the server picks works.
fn parse_multistatus(xml: &str) -> Result<Vec<DavResponse>> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut element_stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name_of(e.local_name().as_ref());
                if name == "response" {
                    current = Some(DavResponse::default());
                }
                if name == "collection" {
                    if let Some(cur) = current.as_mut() {
                        cur.is_collection = true;
                    }
                }
                element_stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name_of(e.local_name().as_ref());
                if name == "collection" {
                    if let Some(cur) = current.as_mut() {
                        cur.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().context("decode xml text")?.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                let Some(cur) = current.as_mut() else {
                    continue;
                };
                match element_stack.last().map(|s| s.as_str()) {
                    Some("href") => cur.href = text,
                    Some("getetag") => cur.etag = text,
                    Some("getlastmodified") => {
                        cur.mtime = chrono::DateTime::parse_from_rfc2822(&text)
                            .map(|t| t.timestamp())
                            .unwrap_or(0);
                    }
                    Some("getcontentlength") => {
                        cur.content_length = text.parse().unwrap_or(0);
                    }
                    Some("id") | Some("fileid") => cur.file_id = text,
                    Some("permissions") => cur.permissions = text,
                    Some("checksum") | Some("checksums") => {
                        if cur.checksum.is_empty() {
                            cur.checksum = text;
                        }
                    }
                    Some("size") => cur.dir_size = text.parse().unwrap_or(0),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let name = local_name_of(e.local_name().as_ref());
                if name == "response" {
                    if let Some(done) = current.take() {
                        out.push(done);
                    }
                }
                element_stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => anyhow::bail!("malformed multistatus response: {err}"),
        }
    }
    Ok(out)
}

fn local_name_of(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}
