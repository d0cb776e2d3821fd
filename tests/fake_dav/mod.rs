//! In-process WebDAV server used by the end-to-end sync tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use percent_encoding::percent_decode_str;

#[derive(Debug, Clone)]
pub enum Node {
    Dir,
    File {
        data: Vec<u8>,
        mtime: i64,
        checksum: Option<String>,
    },
}

#[derive(Debug, Clone)]
enum Upload {
    NgSession { chunks: BTreeMap<i64, Vec<u8>> },
    Token { dest: String, data: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct Counters {
    pub file_puts: usize,
    pub chunk_puts: usize,
    pub upload_bytes: usize,
    pub moves: Vec<(String, String)>,
    pub deletes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FailurePlan {
    /// Allow this many chunk PUTs, then fail the rest with 500.
    pub fail_chunk_puts_after: Option<usize>,
    /// Fail whole-file PUTs with (status, remaining count).
    pub fail_file_puts: Option<(u16, usize)>,
}

pub struct ServerState {
    pub nodes: BTreeMap<String, (Node, String, String)>, // path -> (node, etag, file_id)
    dir_versions: HashMap<String, u64>,
    uploads: HashMap<String, Upload>,
    pub perms: HashMap<String, String>,
    pub counters: Counters,
    pub fail: FailurePlan,
    next_id: u64,
    next_etag: u64,
    capabilities: serde_json::Value,
}

pub struct FakeDav {
    pub state: Mutex<ServerState>,
}

pub const DEFAULT_PERMS: &str = "WDNVCKR";

impl FakeDav {
    pub fn new(capabilities: serde_json::Value) -> Arc<Self> {
        Arc::new(FakeDav {
            state: Mutex::new(ServerState {
                nodes: BTreeMap::new(),
                dir_versions: HashMap::new(),
                uploads: HashMap::new(),
                perms: HashMap::new(),
                counters: Counters::default(),
                fail: FailurePlan::default(),
                next_id: 1,
                next_etag: 1,
                capabilities,
            }),
        })
    }

    pub fn default_capabilities() -> serde_json::Value {
        serde_json::json!({
            "chunking_ng": {
                "enabled": false,
                "min_chunk_size": 0,
                "max_chunk_size": 0,
                "target_chunk_upload_duration": 60
            },
            "bigfilechunking": false,
            "resumable_upload": false,
            "checksums": {"supported_types": ["MD5"]},
            "remote_poll_interval": 1
        })
    }

    /// Seed a file, creating parent collections as needed.
    pub fn put_file(&self, path: &str, data: &[u8], mtime: i64) -> String {
        let mut state = self.state.lock().unwrap();
        state.ensure_parents(path);
        state.write_file(path, data.to_vec(), mtime, None)
    }

    pub fn delete_path(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        state.remove_subtree(path);
        state.bump_ancestors(path);
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        match state.nodes.get(path) {
            Some((Node::File { data, .. }, _, _)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn file_etag(&self, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.nodes.get(path).map(|(_, etag, _)| etag.clone())
    }
}

impl ServerState {
    fn fresh_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("e{}", self.next_etag)
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("id{}", self.next_id)
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut prefix = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            let current = if prefix.is_empty() {
                seg.to_string()
            } else {
                format!("{prefix}/{seg}")
            };
            if current != path && !self.nodes.contains_key(&current) {
                let etag = self.fresh_etag();
                let id = self.fresh_id();
                self.nodes.insert(current.clone(), (Node::Dir, etag, id));
            }
            prefix = current;
        }
    }

    fn write_file(
        &mut self,
        path: &str,
        data: Vec<u8>,
        mtime: i64,
        checksum: Option<String>,
    ) -> String {
        let etag = self.fresh_etag();
        let id = match self.nodes.get(path) {
            Some((_, _, id)) => id.clone(),
            None => self.fresh_id(),
        };
        self.nodes.insert(
            path.to_string(),
            (
                Node::File {
                    data,
                    mtime,
                    checksum,
                },
                etag.clone(),
                id,
            ),
        );
        self.bump_ancestors(path);
        etag
    }

    fn remove_subtree(&mut self, path: &str) {
        let under: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| *k == path || k.starts_with(&format!("{path}/")))
            .cloned()
            .collect();
        for key in under {
            self.nodes.remove(&key);
        }
    }

    fn bump_ancestors(&mut self, path: &str) {
        let mut current = path.to_string();
        loop {
            match current.rsplit_once('/') {
                Some((parent, _)) => {
                    *self.dir_versions.entry(parent.to_string()).or_insert(0) += 1;
                    current = parent.to_string();
                }
                None => {
                    *self.dir_versions.entry(String::new()).or_insert(0) += 1;
                    break;
                }
            }
        }
    }

    fn dir_etag(&self, rel: &str) -> String {
        format!("dir-{}-{}", rel, self.dir_versions.get(rel).copied().unwrap_or(0))
    }

    fn dir_size(&self, rel: &str) -> i64 {
        self.nodes
            .iter()
            .filter(|(k, _)| k.starts_with(&format!("{rel}/")) || rel.is_empty())
            .map(|(_, (node, _, _))| match node {
                Node::File { data, .. } => data.len() as i64,
                Node::Dir => 0,
            })
            .sum()
    }

    fn children(&self, rel: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|k| {
                let parent = match k.rsplit_once('/') {
                    Some((p, _)) => p,
                    None => "",
                };
                parent == rel
            })
            .cloned()
            .collect()
    }

    fn perms_for(&self, rel: &str) -> String {
        self.perms
            .get(rel)
            .cloned()
            .unwrap_or_else(|| DEFAULT_PERMS.to_string())
    }
}

pub async fn spawn(server: Arc<FakeDav>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(handler).with_state(server);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn response(status: u16, headers: &[(&str, String)], body: Vec<u8>) -> Response {
    let mut builder = Response::builder().status(status);
    for (k, v) in headers {
        builder = builder.header(*k, v);
    }
    builder.body(Body::from(body)).unwrap()
}

fn decode_path(uri_path: &str) -> String {
    percent_decode_str(uri_path).decode_utf8_lossy().to_string()
}

async fn handler(State(server): State<Arc<FakeDav>>, req: Request) -> Response {
    let method = req.method().as_str().to_string();
    let uri = req.uri().clone();
    let path = decode_path(uri.path());
    let headers = req.headers().clone();
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default()
        .to_vec();

    if path == "/capabilities" && method == "GET" {
        let caps = server.state.lock().unwrap().capabilities.clone();
        return response(
            200,
            &[("Content-Type", "application/json".to_string())],
            serde_json::to_vec(&caps).unwrap(),
        );
    }

    if let Some(rest) = path.strip_prefix("/dav/files") {
        let rel = rest.trim_matches('/').to_string();
        return files_endpoint(&server, &method, &rel, &headers, body, &uri).await;
    }
    if let Some(rest) = path.strip_prefix("/dav/uploads") {
        let rel = rest.trim_matches('/').to_string();
        return uploads_endpoint(&server, &method, &rel, &headers, body, &uri).await;
    }

    response(404, &[], b"not found".to_vec())
}

async fn files_endpoint(
    server: &Arc<FakeDav>,
    method: &str,
    rel: &str,
    headers: &axum::http::HeaderMap,
    body: Vec<u8>,
    _uri: &axum::http::Uri,
) -> Response {
    match method {
        "PROPFIND" => {
            let depth = headers
                .get("Depth")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("1");
            let state = server.state.lock().unwrap();
            propfind_response(&state, rel, depth)
        }
        "GET" => {
            let state = server.state.lock().unwrap();
            match state.nodes.get(rel) {
                Some((Node::File { data, .. }, _, _)) => {
                    if let Some(range) = headers.get("Range").and_then(|v| v.to_str().ok()) {
                        if let Some(offset) = parse_range(range) {
                            let offset = offset.min(data.len());
                            return response(206, &[], data[offset..].to_vec());
                        }
                    }
                    response(200, &[], data.clone())
                }
                _ => response(404, &[], b"no such file".to_vec()),
            }
        }
        "PUT" => {
            let mut state = server.state.lock().unwrap();
            if let Some((status, remaining)) = state.fail.fail_file_puts {
                if remaining > 0 {
                    state.fail.fail_file_puts = Some((status, remaining - 1));
                    state.counters.file_puts += 1;
                    return response(status, &[], b"injected failure".to_vec());
                }
            }
            // Legacy fixed-chunk uploads target `<name>-chunking-<id>-<n>-<i>`.
            if let Some((base, transfer, total, index)) = parse_fixed_chunk(rel) {
                state.counters.chunk_puts += 1;
                state.counters.upload_bytes += body.len();
                let key = format!("fixed:{transfer}");
                let assembled: Option<Vec<u8>> = {
                    let upload = state
                        .uploads
                        .entry(key.clone())
                        .or_insert(Upload::NgSession {
                            chunks: BTreeMap::new(),
                        });
                    match upload {
                        Upload::NgSession { chunks } => {
                            chunks.insert(index, body);
                            if chunks.len() as i64 == total {
                                let mut data = Vec::new();
                                for chunk in chunks.values() {
                                    data.extend_from_slice(chunk);
                                }
                                Some(data)
                            } else {
                                None
                            }
                        }
                        _ => None,
                    }
                };
                if let Some(data) = assembled {
                    state.uploads.remove(&key);
                    if !precondition_ok(&state, &base, headers) {
                        return response(412, &[], b"precondition failed".to_vec());
                    }
                    state.ensure_parents(&base);
                    let mtime = header_i64(headers, "X-OC-Mtime").unwrap_or(0);
                    let etag = state.write_file(&base, data, mtime, None);
                    let id = state.nodes.get(&base).unwrap().2.clone();
                    return response(201, &[("OC-ETag", etag), ("OC-FileId", id)], Vec::new());
                }
                return response(201, &[], Vec::new());
            }

            if !precondition_ok(&state, rel, headers) {
                return response(412, &[], b"precondition failed".to_vec());
            }
            state.counters.file_puts += 1;
            state.counters.upload_bytes += body.len();
            state.ensure_parents(rel);
            let mtime = header_i64(headers, "X-OC-Mtime").unwrap_or(0);
            let checksum = headers
                .get("OC-Checksum")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let etag = state.write_file(rel, body, mtime, checksum);
            let id = state.nodes.get(rel).unwrap().2.clone();
            response(201, &[("OC-ETag", etag), ("OC-FileId", id)], Vec::new())
        }
        "MKCOL" => {
            let mut state = server.state.lock().unwrap();
            if state.nodes.contains_key(rel) {
                return response(405, &[], b"already exists".to_vec());
            }
            state.ensure_parents(rel);
            let etag = state.fresh_etag();
            let id = state.fresh_id();
            state
                .nodes
                .insert(rel.to_string(), (Node::Dir, etag, id.clone()));
            state.bump_ancestors(rel);
            response(201, &[("OC-FileId", id)], Vec::new())
        }
        "DELETE" => {
            let mut state = server.state.lock().unwrap();
            if !state.nodes.contains_key(rel) {
                return response(404, &[], b"no such path".to_vec());
            }
            state.remove_subtree(rel);
            state.bump_ancestors(rel);
            state.counters.deletes.push(rel.to_string());
            response(204, &[], Vec::new())
        }
        "MOVE" => {
            let Some(dest) = destination_rel(headers) else {
                return response(400, &[], b"missing destination".to_vec());
            };
            let mut state = server.state.lock().unwrap();
            if !state.nodes.contains_key(rel) {
                return response(404, &[], b"no such path".to_vec());
            }
            let moved: Vec<(String, (Node, String, String))> = {
                let keys: Vec<String> = state
                    .nodes
                    .keys()
                    .filter(|k| *k == rel || k.starts_with(&format!("{rel}/")))
                    .cloned()
                    .collect();
                keys.into_iter()
                    .map(|k| {
                        let v = state.nodes.remove(&k).unwrap();
                        let new_key = if k == rel {
                            dest.clone()
                        } else {
                            format!("{dest}{}", &k[rel.len()..])
                        };
                        (new_key, v)
                    })
                    .collect()
            };
            for (k, v) in moved {
                state.nodes.insert(k, v);
            }
            state.ensure_parents(&dest);
            // A move bumps the entry's version like any other change.
            let etag = state.fresh_etag();
            if let Some(entry) = state.nodes.get_mut(&dest) {
                entry.1 = etag.clone();
            }
            state.bump_ancestors(rel);
            state.bump_ancestors(&dest);
            state.counters.moves.push((rel.to_string(), dest.clone()));
            let id = state.nodes.get(&dest).unwrap().2.clone();
            response(201, &[("OC-ETag", etag), ("OC-FileId", id)], Vec::new())
        }
        _ => response(405, &[], b"unsupported".to_vec()),
    }
}

async fn uploads_endpoint(
    server: &Arc<FakeDav>,
    method: &str,
    rel: &str,
    headers: &axum::http::HeaderMap,
    body: Vec<u8>,
    uri: &axum::http::Uri,
) -> Response {
    let mut state = server.state.lock().unwrap();
    let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        // Resumable-token dialect: create an upload.
        ("POST", []) => {
            let query = query_map(uri);
            let dest = query.get("path").cloned().unwrap_or_default();
            let token = format!("tok{}", state.next_id);
            state.next_id += 1;
            state.uploads.insert(
                token.clone(),
                Upload::Token {
                    dest,
                    data: Vec::new(),
                },
            );
            response(
                200,
                &[("Content-Type", "application/json".to_string())],
                serde_json::to_vec(&serde_json::json!({"token": token, "offset": 0})).unwrap(),
            )
        }
        ("HEAD", [token]) => match state.uploads.get(*token) {
            Some(Upload::Token { data, .. }) => response(
                200,
                &[("Upload-Offset", data.len().to_string())],
                Vec::new(),
            ),
            _ => response(404, &[], Vec::new()),
        },
        ("PUT", [id]) => {
            if let Some(allow) = state.fail.fail_chunk_puts_after {
                if state.counters.chunk_puts >= allow {
                    state.counters.chunk_puts += 1;
                    return response(500, &[], b"injected chunk failure".to_vec());
                }
            }
            state.counters.chunk_puts += 1;
            state.counters.upload_bytes += body.len();
            let id = id.to_string();
            match state.uploads.get_mut(&id) {
                Some(Upload::Token { data, .. }) => {
                    let offset = header_i64(headers, "Upload-Offset").unwrap_or(0) as usize;
                    data.truncate(offset);
                    data.extend_from_slice(&body);
                    let new_offset = data.len().to_string();
                    response(200, &[("Upload-Offset", new_offset)], Vec::new())
                }
                _ => response(404, &[], b"unknown upload".to_vec()),
            }
        }
        ("PUT", [session, chunk_name]) => {
            if let Some(allow) = state.fail.fail_chunk_puts_after {
                if state.counters.chunk_puts >= allow {
                    state.counters.chunk_puts += 1;
                    return response(500, &[], b"injected chunk failure".to_vec());
                }
            }
            state.counters.chunk_puts += 1;
            state.counters.upload_bytes += body.len();
            let offset: i64 = chunk_name.parse().unwrap_or(0);
            let session = session.to_string();
            match state.uploads.get_mut(&session) {
                Some(Upload::NgSession { chunks }) => {
                    chunks.insert(offset, body);
                    response(201, &[], Vec::new())
                }
                _ => response(404, &[], b"unknown session".to_vec()),
            }
        }
        ("MKCOL", [session]) => {
            state.uploads.insert(
                session.to_string(),
                Upload::NgSession {
                    chunks: BTreeMap::new(),
                },
            );
            response(201, &[], Vec::new())
        }
        ("MOVE", [session, file]) if *file == ".file" => {
            let Some(dest) = destination_rel(headers) else {
                return response(400, &[], b"missing destination".to_vec());
            };
            let session = session.to_string();
            let Some(Upload::NgSession { chunks }) = state.uploads.remove(&session) else {
                return response(404, &[], b"unknown session".to_vec());
            };
            if !precondition_ok(&state, &dest, headers) {
                return response(412, &[], b"precondition failed".to_vec());
            }
            let mut data = Vec::new();
            for chunk in chunks.values() {
                data.extend_from_slice(chunk);
            }
            state.ensure_parents(&dest);
            let mtime = header_i64(headers, "X-OC-Mtime").unwrap_or(0);
            let etag = state.write_file(&dest, data, mtime, None);
            let id = state.nodes.get(&dest).unwrap().2.clone();
            response(201, &[("OC-ETag", etag), ("OC-FileId", id)], Vec::new())
        }
        ("POST", [token, action]) if *action == "finalize" => {
            let token = token.to_string();
            let Some(Upload::Token { data, .. }) = state.uploads.remove(&token) else {
                return response(404, &[], b"unknown upload".to_vec());
            };
            let query = query_map(uri);
            let dest = query.get("path").cloned().unwrap_or_default();
            if !precondition_ok(&state, &dest, headers) {
                return response(412, &[], b"precondition failed".to_vec());
            }
            let mtime = query
                .get("mtime")
                .and_then(|m| m.parse().ok())
                .unwrap_or(0);
            state.ensure_parents(&dest);
            let etag = state.write_file(&dest, data, mtime, None);
            let id = state.nodes.get(&dest).unwrap().2.clone();
            response(201, &[("OC-ETag", etag), ("OC-FileId", id)], Vec::new())
        }
        ("DELETE", [id]) => {
            state.uploads.remove(*id);
            response(204, &[], Vec::new())
        }
        _ => response(405, &[], b"unsupported".to_vec()),
    }
}

fn propfind_response(state: &ServerState, rel: &str, depth: &str) -> Response {
    let exists = rel.is_empty() || state.nodes.contains_key(rel);
    if !exists {
        return response(404, &[], b"no such path".to_vec());
    }

    let mut xml = String::from(
        "<?xml version=\"1.0\"?>\n<d:multistatus xmlns:d=\"DAV:\" xmlns:oc=\"http://owncloud.org/ns\">\n",
    );
    xml.push_str(&entry_xml(state, rel));
    if depth != "0" {
        for child in state.children(rel) {
            xml.push_str(&entry_xml(state, &child));
        }
    }
    xml.push_str("</d:multistatus>\n");
    response(
        207,
        &[("Content-Type", "application/xml".to_string())],
        xml.into_bytes(),
    )
}

fn entry_xml(state: &ServerState, rel: &str) -> String {
    let href = if rel.is_empty() {
        "/dav/files/".to_string()
    } else {
        format!("/dav/files/{rel}")
    };
    let (is_dir, etag, id, length, mtime, checksum) = if rel.is_empty() {
        (true, state.dir_etag(""), "root".to_string(), 0, 0, None)
    } else {
        match state.nodes.get(rel).unwrap() {
            (Node::Dir, _, id) => (true, state.dir_etag(rel), id.clone(), 0, 0, None),
            (
                Node::File {
                    data,
                    mtime,
                    checksum,
                },
                etag,
                id,
            ) => (
                false,
                etag.clone(),
                id.clone(),
                data.len() as i64,
                *mtime,
                checksum.clone(),
            ),
        }
    };

    let mut props = String::new();
    props.push_str(&format!("<d:getetag>\"{etag}\"</d:getetag>"));
    props.push_str(&format!("<oc:id>{id}</oc:id>"));
    props.push_str(&format!("<oc:permissions>{}</oc:permissions>", state.perms_for(rel)));
    if is_dir {
        props.push_str("<d:resourcetype><d:collection/></d:resourcetype>");
        props.push_str(&format!("<oc:size>{}</oc:size>", state.dir_size(rel)));
    } else {
        props.push_str("<d:resourcetype/>");
        props.push_str(&format!("<d:getcontentlength>{length}</d:getcontentlength>"));
        let stamp = chrono::DateTime::from_timestamp(mtime, 0)
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc2822();
        props.push_str(&format!("<d:getlastmodified>{stamp}</d:getlastmodified>"));
        if let Some(sum) = checksum {
            props.push_str(&format!(
                "<oc:checksums><oc:checksum>{sum}</oc:checksum></oc:checksums>"
            ));
        }
    }

    format!(
        "<d:response><d:href>{href}</d:href><d:propstat><d:prop>{props}</d:prop>\
         <d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>\n"
    )
}

fn precondition_ok(state: &ServerState, rel: &str, headers: &axum::http::HeaderMap) -> bool {
    if let Some(expected) = headers
        .get("If-Match")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().trim_matches('"').to_string())
    {
        return match state.nodes.get(rel) {
            Some((_, etag, _)) => *etag == expected,
            None => false,
        };
    }
    if let Some(raw) = headers.get("If-None-Match").and_then(|v| v.to_str().ok()) {
        if raw.trim() == "*" {
            return !state.nodes.contains_key(rel);
        }
    }
    true
}

fn destination_rel(headers: &axum::http::HeaderMap) -> Option<String> {
    let raw = headers.get("Destination")?.to_str().ok()?;
    let url = url::Url::parse(raw).ok()?;
    let path = decode_path(url.path());
    let rest = path.strip_prefix("/dav/files")?;
    Some(rest.trim_matches('/').to_string())
}

fn parse_range(raw: &str) -> Option<usize> {
    let spec = raw.trim().strip_prefix("bytes=")?;
    let (start, _) = spec.split_once('-')?;
    start.parse().ok()
}

fn parse_fixed_chunk(rel: &str) -> Option<(String, String, i64, i64)> {
    let idx = rel.find("-chunking-")?;
    let base = rel[..idx].to_string();
    let rest = &rel[idx + "-chunking-".len()..];
    let parts: Vec<&str> = rest.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    let transfer = parts[0].to_string();
    let total: i64 = parts[1].parse().ok()?;
    let index: i64 = parts[2].parse().ok()?;
    Some((base, transfer, total, index))
}

fn header_i64(headers: &axum::http::HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn query_map(uri: &axum::http::Uri) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(query) = uri.query() {
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                out.insert(
                    decode_path(k).to_string(),
                    decode_path(&v.replace('+', " ")).to_string(),
                );
            }
        }
    }
    out
}
