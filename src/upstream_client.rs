use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{CoreError, Result, UpstreamErrorBody};
use crate::model::{TorrentFile, TorrentId, TorrentInfo, TorrentStatus, TorrentSummary};
use crate::rate_gate::RateGate;
use crate::token_ring::TokenRing;
use crate::workers::BufferPool;
use futures_util::StreamExt;

const BASE_URL: &str = "https://api.example-debrid.com/rest/1.0";
/// A share link longer than this is truncated before being used as a cache key or
/// sent upstream (spec.md §3 "Ownership and lifecycle", §4.3 "Unrestrict").
const SHARE_LINK_TRUNCATE_LEN: usize = 39;
const SHARE_PREFIX: &str = "https://example-debrid.com/d/";
/// `/torrents/instantAvailability` batches hashes in groups of this size (spec.md §6).
const INSTANT_AVAILABILITY_BATCH: usize = 200;
/// Hard safety cap on listing pagination so a misbehaving upstream can't loop forever
/// (spec.md §4.3 "Torrents listing").
const MAX_LISTING_PAGES: u32 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub premium: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficDetails {
    #[serde(default)]
    pub bytes_used: u64,
    #[serde(default)]
    pub bytes_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnrestrictResponse {
    pub download: String,
    #[serde(default)]
    pub filesize: u64,
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddMagnetResponse {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTorrent {
    id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    added: Option<chrono::DateTime<Utc>>,
    ended: Option<chrono::DateTime<Utc>>,
}

impl From<RawTorrent> for TorrentSummary {
    fn from(r: RawTorrent) -> Self {
        TorrentSummary {
            id: TorrentId(r.id),
            display_name: r.filename,
            size_bytes: r.bytes,
            file_count: 0,
            status: TorrentStatus::parse(&r.status),
            added_at: r.added.unwrap_or_else(Utc::now),
            ended_at: r.ended,
            hash: r.hash,
            modified_unix: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawTorrentFile {
    id: u32,
    path: String,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    selected: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTorrentInfo {
    id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    added: Option<chrono::DateTime<Utc>>,
    ended: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    files: Vec<RawTorrentFile>,
    #[serde(default)]
    links: Vec<String>,
}

impl From<RawTorrentInfo> for TorrentInfo {
    fn from(r: RawTorrentInfo) -> Self {
        TorrentInfo {
            id: TorrentId(r.id),
            display_name: r.filename,
            size_bytes: r.bytes,
            file_count: r.files.len() as u32,
            status: TorrentStatus::parse(&r.status),
            added_at: r.added.unwrap_or_else(Utc::now),
            ended_at: r.ended,
            hash: r.hash,
            modified_unix: Utc::now().timestamp(),
            progress: r.progress.clamp(0.0, 100.0) as u8,
            files: r
                .files
                .into_iter()
                .map(|f| TorrentFile { file_id: f.id, path: f.path, size_bytes: f.bytes, selected: f.selected == 1 })
                .collect(),
            links: r.links,
            original_id: None,
        }
    }
}

/// Normalize a restricted link per spec.md §4.3: share-prefixed links longer than 39
/// characters are truncated to 39 before being used as a cache key or sent upstream.
pub fn normalize_link(link: &str) -> String {
    if link.starts_with(SHARE_PREFIX) && link.len() > SHARE_LINK_TRUNCATE_LEN {
        link[..SHARE_LINK_TRUNCATE_LEN].to_string()
    } else {
        link.to_string()
    }
}

/// Typed surface over the upstream provider's HTTP API (spec.md §4.3). Object-safe so
/// Resolver/Repair/Scheduler can be driven by a test double instead of real HTTP, per
/// the Design Note in spec.md §9 about avoiding hidden globals in tests.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn user_info(&self) -> Result<UserInfo>;
    async fn test_connection(&self) -> Result<()>;
    async fn traffic_details(&self) -> Result<TrafficDetails>;
    async fn torrents(&self, limit: u32, offset: u32) -> Result<Vec<TorrentSummary>>;
    async fn torrents_page(&self, page: u32, limit: u32) -> Result<Vec<TorrentSummary>>;
    async fn get_all_torrents(&self) -> Result<Vec<TorrentSummary>>;
    async fn torrent_info(&self, id: &TorrentId) -> Result<TorrentInfo>;
    async fn add_magnet(&self, magnet: &str) -> Result<TorrentId>;
    async fn select_files(&self, id: &TorrentId, file_ids: &[u32]) -> Result<()>;
    async fn delete_torrent(&self, id: &TorrentId) -> Result<()>;
    async fn unrestrict(&self, link: &str, filename_hint: Option<&str>) -> Result<UnrestrictResponse>;
    async fn check_link(&self, link: &str) -> Result<()>;
    async fn instant_availability(&self, hashes: &[String]) -> Result<serde_json::Value>;
}

pub struct UpstreamClient {
    client: reqwest::Client,
    gate: RateGate,
    tokens: Arc<TokenRing>,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(tokens: Arc<TokenRing>, gate: RateGate) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("debridcache/0.1.0")
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(CoreError::Transient)?;
        Ok(Self { client, gate, tokens, base_url: BASE_URL.to_string() })
    }

    #[cfg(test)]
    pub fn with_base_url(tokens: Arc<TokenRing>, gate: RateGate, base_url: String) -> Result<Self> {
        let mut me = Self::new(tokens, gate)?;
        me.base_url = base_url;
        Ok(me)
    }

    fn auth_headers(&self) -> Result<(HeaderMap, String)> {
        let token = self.tokens.current()?;
        let mut headers = HeaderMap::new();
        let mut val = HeaderValue::from_str(&format!("Bearer {}", token.value))
            .map_err(|e| CoreError::Config(e.to_string()))?;
        val.set_sensitive(true);
        headers.insert(AUTHORIZATION, val);
        Ok((headers, token.value))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn user_info(&self) -> Result<UserInfo> {
        let (headers, _token) = self.auth_headers()?;
        let url = self.url("/user");
        self.gate.do_request(None, || self.client.get(&url).headers(headers.clone())).await
    }

    async fn test_connection(&self) -> Result<()> {
        self.user_info().await.map(|_| ())
    }

    async fn traffic_details(&self) -> Result<TrafficDetails> {
        let (headers, _) = self.auth_headers()?;
        let url = self.url("/traffic/details");
        self.gate.do_request(None, || self.client.get(&url).headers(headers.clone())).await
    }

    async fn torrents(&self, limit: u32, offset: u32) -> Result<Vec<TorrentSummary>> {
        let (headers, _) = self.auth_headers()?;
        let url = format!("{}?limit={}&offset={}", self.url("/torrents"), limit, offset);
        let raw: Vec<RawTorrent> = self.gate.do_request(None, || self.client.get(&url).headers(headers.clone())).await?;
        Ok(raw.into_iter().map(Into::into).collect())
    }

    async fn torrents_page(&self, page: u32, limit: u32) -> Result<Vec<TorrentSummary>> {
        let (headers, _) = self.auth_headers()?;
        let url = format!("{}?page={}&limit={}", self.url("/torrents"), page, limit);
        let raw: Vec<RawTorrent> = self.gate.do_request(None, || self.client.get(&url).headers(headers.clone())).await?;
        Ok(raw.into_iter().map(Into::into).collect())
    }

    /// Tries limit/offset pagination first, then falls back to page=N, deduplicating by
    /// id and stopping on a short/empty page (spec.md §4.3 "Torrents listing").
    async fn get_all_torrents(&self) -> Result<Vec<TorrentSummary>> {
        const PAGE_SIZE: u32 = 50;
        let mut all: Vec<TorrentSummary> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut offset = 0u32;
        let mut offset_worked = false;
        for _ in 0..MAX_LISTING_PAGES {
            match self.torrents(PAGE_SIZE, offset).await {
                Ok(batch) if !batch.is_empty() => {
                    offset_worked = true;
                    let got = batch.len() as u32;
                    for t in batch {
                        if seen.insert(t.id.clone()) {
                            all.push(t);
                        }
                    }
                    if got < PAGE_SIZE {
                        break;
                    }
                    offset += PAGE_SIZE;
                }
                _ => break,
            }
        }

        if !offset_worked {
            let mut page = 1u32;
            for _ in 0..MAX_LISTING_PAGES {
                let batch = self.torrents_page(page, PAGE_SIZE).await?;
                if batch.is_empty() {
                    break;
                }
                let mut new_ids = 0;
                for t in batch.iter() {
                    if seen.insert(t.id.clone()) {
                        new_ids += 1;
                    }
                }
                all.extend(batch);
                if new_ids == 0 || (all.len() as u32) < page * PAGE_SIZE {
                    break;
                }
                page += 1;
            }
        }
        info!(count = all.len(), "fetched torrent listing");
        Ok(all)
    }

    async fn torrent_info(&self, id: &TorrentId) -> Result<TorrentInfo> {
        let (headers, _) = self.auth_headers()?;
        let url = self.url(&format!("/torrents/info/{}", id.0));
        let raw: Option<RawTorrentInfo> =
            self.gate.do_request_opt(None, || self.client.get(&url).headers(headers.clone())).await?;
        match raw {
            Some(raw) => Ok(raw.into()),
            // spec.md §4.3: "status 204" is one of the two not-found signals (the other
            // is error_code 7, handled by `CoreError::from_body` for non-2xx responses).
            None => Err(CoreError::TorrentNotFound(id.0.clone())),
        }
    }

    async fn add_magnet(&self, magnet: &str) -> Result<TorrentId> {
        let (headers, _) = self.auth_headers()?;
        let url = self.url("/torrents/addMagnet");
        let magnet = magnet.to_string();
        let resp: AddMagnetResponse = self
            .gate
            .do_request(None, || self.client.post(&url).headers(headers.clone()).form(&[("magnet", magnet.as_str())]))
            .await?;
        Ok(TorrentId(resp.id))
    }

    async fn select_files(&self, id: &TorrentId, file_ids: &[u32]) -> Result<()> {
        let (headers, _) = self.auth_headers()?;
        let url = self.url(&format!("/torrents/selectFiles/{}", id.0));
        let csv = file_ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        self.gate
            .do_request::<serde_json::Value, _>(None, || {
                self.client.post(&url).headers(headers.clone()).form(&[("files", csv.as_str())])
            })
            .await?;
        Ok(())
    }

    async fn delete_torrent(&self, id: &TorrentId) -> Result<()> {
        let (headers, _) = self.auth_headers()?;
        let url = self.url(&format!("/torrents/delete/{}", id.0));
        self.gate.do_request::<serde_json::Value, _>(None, || self.client.delete(&url).headers(headers.clone())).await?;
        Ok(())
    }

    async fn unrestrict(&self, link: &str, filename_hint: Option<&str>) -> Result<UnrestrictResponse> {
        let (headers, _) = self.auth_headers()?;
        let url = self.url("/unrestrict/link");
        let link = normalize_link(link);
        self.gate
            .do_request(filename_hint, || self.client.post(&url).headers(headers.clone()).form(&[("link", link.as_str())]))
            .await
    }

    async fn check_link(&self, link: &str) -> Result<()> {
        let (headers, _) = self.auth_headers()?;
        let url = self.url("/unrestrict/check");
        let link = link.to_string();
        self.gate
            .do_request::<serde_json::Value, _>(None, || {
                self.client.post(&url).headers(headers.clone()).form(&[("link", link.as_str())])
            })
            .await?;
        Ok(())
    }

    async fn instant_availability(&self, hashes: &[String]) -> Result<serde_json::Value> {
        let (headers, _) = self.auth_headers()?;
        let mut merged = serde_json::Map::new();
        for batch in hashes.chunks(INSTANT_AVAILABILITY_BATCH) {
            let joined = batch.join("/");
            let url = self.url(&format!("/torrents/instantAvailability/{}", joined));
            let part: serde_json::Value =
                self.gate.do_request(None, || self.client.get(&url).headers(headers.clone())).await?;
            if let serde_json::Value::Object(map) = part {
                merged.extend(map);
            }
        }
        Ok(serde_json::Value::Object(merged))
    }
}

impl UpstreamClient {
    /// Streams a download through the given URL, using `token` explicitly (spec.md
    /// §4.3 "DownloadFile"). A `bytes_limit_reached` signal on the response marks the
    /// token expired with reason "bandwidth" so the caller can retry with another.
    pub async fn download_file(&self, url: &str, token: &str) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await
            .map_err(CoreError::Transient)?;

        if resp.status().as_u16() >= 400 {
            if let Some(err_header) = resp.headers().get("X-Error").and_then(|v| v.to_str().ok()) {
                let message = err_header.to_string();
                if message.contains("bytes_limit_reached") {
                    self.tokens.mark_expired(token, "bandwidth");
                    warn!("download hit bandwidth limit, token marked expired");
                }
                return Err(CoreError::Upstream { message, code: None });
            }
            return Err(CoreError::Upstream { message: format!("status {}", resp.status()), code: None });
        }
        Ok(resp)
    }

    /// Buffers a download fully into a pooled byte vector instead of handing back the
    /// raw streaming `Response` (spec.md §5 "Buffer pool"). The size class is picked
    /// from `Content-Length` up front, falling back to the small class when absent;
    /// `download_file` remains the streaming path callers should prefer for large
    /// transfers, this is for callers that want an owned buffer back.
    pub async fn download_buffered(&self, url: &str, token: &str, pool: &BufferPool) -> Result<bytes::Bytes> {
        let resp = self.download_file(url, token).await?;
        let class = BufferPool::class_for(resp.content_length().unwrap_or(0));
        let mut buf = pool.checkout(class);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(CoreError::Transient)?);
        }
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_truncates_share_links_over_39_chars() {
        let long = format!("{}{}", SHARE_PREFIX, "x".repeat(50));
        let normalized = normalize_link(&long);
        assert_eq!(normalized.len(), SHARE_LINK_TRUNCATE_LEN);
        assert!(long.starts_with(&normalized));
    }

    #[test]
    fn normalize_leaves_non_share_links_untouched() {
        let link = "https://hoster.example/some/very/long/path/that/is/not/truncated";
        assert_eq!(normalize_link(link), link);
    }

    #[test]
    fn raw_torrent_deserializes_known_statuses() {
        let json = r#"{"id":"T1","filename":"x.mkv","hash":"abc","bytes":123,"status":"downloaded"}"#;
        let raw: RawTorrent = serde_json::from_str(json).unwrap();
        let summary: TorrentSummary = raw.into();
        assert_eq!(summary.id.0, "T1");
        assert_eq!(summary.status, TorrentStatus::Downloaded);
    }

    #[test]
    fn torrent_not_found_code_is_distinct_from_generic_upstream_error() {
        let body = UpstreamErrorBody { error: "unknown_resource".into(), error_code: Some(7) };
        let err = CoreError::from_body(reqwest::StatusCode::NOT_FOUND, &body);
        assert!(err.is_not_found());
    }

    #[test]
    fn raw_torrent_info_maps_file_selection_flag() {
        let json = r#"{
            "id": "T7", "filename": "X.mkv", "hash": "H", "bytes": 100,
            "status": "downloaded", "progress": 100,
            "files": [{"id":1, "path":"/X.mkv", "bytes":100, "selected":1}],
            "links": ["l0"]
        }"#;
        let raw: RawTorrentInfo = serde_json::from_str(json).unwrap();
        let info: TorrentInfo = raw.into();
        assert_eq!(info.files.len(), 1);
        assert!(info.files[0].selected);
        assert_eq!(info.link_for_file(1), Some("l0"));
    }
}
