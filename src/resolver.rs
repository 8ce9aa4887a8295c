use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::caches::{file_cache_key, LinkCaches};
use crate::catalog::Catalog;
use crate::error::{CoreError, Result};
use crate::model::{TorrentId, TorrentInfo, UnrestrictedLink};
use crate::repair::{IdMapping, RepairQueue};
use crate::singleflight::SingleFlight;
use crate::store::Store;
use crate::upstream_client::{normalize_link, UpstreamApi};

/// Resolved download target (spec.md §4.6 `Resolve`'s `(downloadURL, sizeBytes)`).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLink {
    pub download_url: String,
    pub size_bytes: u64,
}

/// One flat entry returned by `List` (spec.md §6 "Resolver ↔ handlers").
#[derive(Debug, Clone, PartialEq)]
pub struct FileNode {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub torrent_id: TorrentId,
    pub file_id: u32,
    pub mod_time: DateTime<Utc>,
}

/// Implements `Resolve`/`List` (spec.md §4.6). Holds references to every component it
/// needs to satisfy a lookup without calling upstream when caches already answer it.
pub struct Resolver {
    catalog: Arc<Catalog>,
    caches: Arc<LinkCaches>,
    store: Arc<Store>,
    upstream: Arc<dyn UpstreamApi>,
    repair_queue: Arc<RepairQueue>,
    id_mapping: Arc<IdMapping>,
    inflight: SingleFlight<String, ResolvedLink>,
}

impl Resolver {
    pub fn new(
        catalog: Arc<Catalog>,
        caches: Arc<LinkCaches>,
        store: Arc<Store>,
        upstream: Arc<dyn UpstreamApi>,
        repair_queue: Arc<RepairQueue>,
        id_mapping: Arc<IdMapping>,
    ) -> Self {
        Self { catalog, caches, store, upstream, repair_queue, id_mapping, inflight: SingleFlight::new() }
    }

    /// Accepts either an opaque torrent id or a sanitized display name, per spec.md
    /// §4.6's `Resolve(torrentId|name, fileName)`.
    fn target_id(&self, torrent_id_or_name: &str) -> Result<TorrentId> {
        let candidate = TorrentId(torrent_id_or_name.to_string());
        if self.catalog.find_by_id(&candidate).is_some() {
            return Ok(candidate);
        }
        self.catalog
            .find_by_name(torrent_id_or_name)
            .map(|s| s.id)
            .ok_or_else(|| CoreError::TorrentNotFound(torrent_id_or_name.to_string()))
    }

    pub async fn resolve(&self, torrent_id_or_name: &str, file_name: &str) -> Result<ResolvedLink> {
        // Step 1: follow any id rewritten by a previous repair.
        let id = self.id_mapping.resolve(self.target_id(torrent_id_or_name)?);

        // Step 2.
        let key = file_cache_key(&id.0, file_name);

        // Step 3: fast path entirely from Store + success cache, no upstream call.
        if let Some(info) = self.store.get_info(&id).await? {
            if let Some(file) = info.find_file_by_name(file_name) {
                if let Some(link) = info.link_for_file(file.file_id) {
                    let normalized = normalize_link(link);
                    if let Some(cached) = self.caches.get_success(&normalized) {
                        return Ok(ResolvedLink { download_url: cached.download_url, size_bytes: cached.filesize });
                    }
                }
            }
        }

        // Step 4: per-file URL cache and per-file negative cache.
        if let Some(cached) = self.caches.get_per_file(&key) {
            return Ok(ResolvedLink { download_url: cached.download_url, size_bytes: cached.filesize });
        }
        if let Some(failure) = self.caches.get_negative(&key) {
            return Err(CoreError::Cacheable { code: failure.error_code, message: failure.error_message });
        }

        // Step 5/6: singleflight the actual upstream round-trip.
        let file_name = file_name.to_string();
        let id_for_flight = id.clone();
        self.inflight
            .run(key.clone(), || async move { self.resolve_uncached(&id_for_flight, &file_name, &key).await })
            .await
    }

    async fn resolve_uncached(&self, id: &TorrentId, file_name: &str, key: &str) -> Result<ResolvedLink> {
        let mut info = match self.store.get_info(id).await? {
            Some(info) if !info.links.is_empty() => info,
            _ => self.refresh_info(id).await?,
        };
        if info.links.is_empty() {
            info = self.refresh_info(id).await?;
        }

        let file = info
            .find_file_by_name(file_name)
            .ok_or_else(|| CoreError::FileNotFound(file_name.to_string()))?;
        let link = info.link_for_file(file.file_id).ok_or_else(|| CoreError::NoLinks(id.0.clone()))?;
        if link.is_empty() {
            return Err(CoreError::EmptyDownloadLink(id.0.clone()));
        }
        let normalized = normalize_link(link);

        match self.upstream.unrestrict(link, Some(file_name)).await {
            Ok(resp) => {
                let resolved = UnrestrictedLink {
                    download_url: resp.download.clone(),
                    filesize: resp.filesize,
                    host: resp.host,
                    generated_at: Utc::now(),
                };
                self.caches.put_success(&normalized, resolved.clone());
                self.caches.put_per_file(key, resolved.clone());
                Ok(ResolvedLink { download_url: resolved.download_url, size_bytes: resolved.filesize })
            }
            Err(err) => {
                if err.is_broken_link() {
                    warn!(torrent = %id, file = %file_name, "broken link detected, enqueueing repair");
                    self.repair_queue.enqueue(id.clone());
                }
                let failure = crate::model::FailedUnrestrict {
                    error_message: err.to_string(),
                    error_code: err.code().unwrap_or(0),
                    timestamp: Utc::now(),
                };
                self.caches.put_negative(&normalized, failure.clone());
                self.caches.put_negative(key, failure);
                Err(err)
            }
        }
    }

    async fn refresh_info(&self, id: &TorrentId) -> Result<TorrentInfo> {
        let info = self.upstream.torrent_info(id).await?;
        self.store.upsert_info(&info).await?;
        Ok(info)
    }

    /// Warms the success cache for a newly-seen torrent's first selected file (spec.md
    /// §4.8 "prefetch unrestricted links for new items in parallel"). Best-effort: a
    /// failure here just means the first real `Resolve` pays the upstream round-trip
    /// instead, so errors are logged and swallowed rather than propagated.
    pub async fn prefetch(&self, id: &TorrentId) {
        let info = match self.refresh_info(id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(torrent = %id, error = %e, "prefetch: could not load torrent info");
                return;
            }
        };
        let Some(file) = info.files.iter().find(|f| f.selected) else { return };
        if let Err(e) = self.resolve(&id.0, file.name()).await {
            warn!(torrent = %id, error = %e, "prefetch: could not warm unrestricted link");
        }
    }

    /// One flat level of selected files (spec.md §4.6 `List`). Duplicate base names
    /// disambiguate by appending ` (fileId)` before the extension.
    pub async fn list(&self, torrent_id_or_name: &str) -> Result<Vec<FileNode>> {
        let id = self.id_mapping.resolve(self.target_id(torrent_id_or_name)?);
        let info = match self.store.get_info(&id).await? {
            Some(info) => info,
            None => self.refresh_info(&id).await?,
        };

        let mod_time = info.ended_at.unwrap_or(info.added_at);
        let mut seen = std::collections::HashMap::<String, u32>::new();
        for file in info.files.iter().filter(|f| f.selected) {
            *seen.entry(file.name().to_string()).or_insert(0) += 1;
        }

        let mut nodes = Vec::new();
        for file in info.files.iter().filter(|f| f.selected) {
            let base = file.name();
            let name = if seen.get(base).copied().unwrap_or(0) > 1 {
                disambiguate(base, file.file_id)
            } else {
                base.to_string()
            };
            nodes.push(FileNode {
                name,
                is_dir: false,
                size: file.size_bytes,
                torrent_id: id.clone(),
                file_id: file.file_id,
                mod_time,
            });
        }
        info!(torrent = %id, count = nodes.len(), "listed torrent files");
        Ok(nodes)
    }
}

fn disambiguate(base: &str, file_id: u32) -> String {
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, file_id, ext),
        _ => format!("{} ({})", base, file_id),
    }
}
