use std::sync::Arc;

use tracing::{info, warn};

use crate::caches::LinkCaches;
use crate::catalog::{Catalog, CatalogStats};
use crate::config::Config;
use crate::error::Result;
use crate::model::{TorrentId, TorrentSummary};
use crate::rate_gate::RateGate;
use crate::repair::{IdMapping, Repair, RepairQueue, RepairQueueStatus, RepairState};
use crate::resolver::{FileNode, ResolvedLink, Resolver};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::token_ring::TokenRing;
use crate::upstream_client::{UpstreamApi, UpstreamClient};

/// Snapshot returned by [`Core::stats`] (spec.md §4.9 `Stats`).
#[derive(Debug, Clone)]
pub struct Stats {
    pub catalog: CatalogStats,
    pub expired_tokens: usize,
    pub total_tokens: usize,
    pub success_cache_len: usize,
    pub negative_cache_len: usize,
    pub repair_queue: RepairQueueStatus,
}

/// The crate's single composition root (spec.md §4.9): owns every component and
/// exposes the handler-facing surface (`Resolve`, `List`, `Stats`, `EnqueueRepair`,
/// `OnCatalogChange`) without any hidden process-global state, so tests can construct
/// as many independent instances as they need (spec.md §9 "Design Note").
pub struct Core {
    catalog: Arc<Catalog>,
    caches: Arc<LinkCaches>,
    store: Arc<Store>,
    tokens: Arc<TokenRing>,
    upstream: Arc<dyn UpstreamApi>,
    resolver: Arc<Resolver>,
    repair: Arc<Repair>,
    repair_queue: Arc<RepairQueue>,
    scheduler: Option<Scheduler>,
}

impl Core {
    /// Assembles every component from `config`, wiring a real `UpstreamClient` against
    /// the upstream's HTTP API. Use [`Core::with_upstream`] in tests to substitute a
    /// fake (spec.md §9 "Design Note": object-safe traits at every seam precisely so
    /// tests don't need a live upstream).
    pub fn new(config: Config) -> Result<Self> {
        let tokens = Arc::new(TokenRing::new(config.api_key.clone(), config.additional_api_keys.clone()));
        let gate = RateGate::new(config.rate_limit.clone());
        let upstream: Arc<dyn UpstreamApi> = Arc::new(UpstreamClient::new(tokens.clone(), gate)?);
        Self::with_upstream(config, tokens, upstream)
    }

    pub fn with_upstream(config: Config, tokens: Arc<TokenRing>, upstream: Arc<dyn UpstreamApi>) -> Result<Self> {
        let catalog = Arc::new(Catalog::new(config.retain_folder_extension));
        let caches = Arc::new(LinkCaches::new());
        let store = Arc::new(Store::open(&config.store_path)?);
        let repair_queue = Arc::new(RepairQueue::new());
        let id_mapping = Arc::new(IdMapping::new());

        let resolver = Arc::new(Resolver::new(
            catalog.clone(),
            caches.clone(),
            store.clone(),
            upstream.clone(),
            repair_queue.clone(),
            id_mapping.clone(),
        ));

        let repair = Arc::new(Repair::new(
            repair_queue.clone(),
            catalog.clone(),
            store.clone(),
            upstream.clone(),
            resolver.clone(),
            id_mapping,
            config.repair.clone(),
        ));

        Ok(Self { catalog, caches, store, tokens, upstream, resolver, repair, repair_queue, scheduler: None })
    }

    /// Warm start (spec.md §4.5 `Seed`, §4.4 `Sync`): loads every persisted summary
    /// into the catalog and seeds each one's `lastChecked` bookkeeping. Call once
    /// before serving traffic.
    pub async fn load_from_store(&self) -> Result<()> {
        let ids = self.store.all_summary_ids().await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(summary) = self.store.get_summary(id).await? {
                summaries.push(summary);
            }
        }
        let count = summaries.len();
        self.catalog.seed(summaries);
        info!(count, "catalog loaded from store");
        Ok(())
    }

    /// `Resolve(torrentId|name, fileName) -> (downloadURL, sizeBytes)` (spec.md §4.6).
    pub async fn resolve(&self, torrent_id_or_name: &str, file_name: &str) -> Result<ResolvedLink> {
        self.resolver.resolve(torrent_id_or_name, file_name).await
    }

    /// `List(torrentId|name) -> [FileNode]` (spec.md §4.6).
    pub async fn list(&self, torrent_id_or_name: &str) -> Result<Vec<FileNode>> {
        self.resolver.list(torrent_id_or_name).await
    }

    /// `Stats` (spec.md §4.9): a point-in-time snapshot across every component that
    /// keeps counters, assembled without blocking any of the hot paths.
    pub fn stats(&self) -> Stats {
        Stats {
            catalog: self.catalog.stats(),
            expired_tokens: self.tokens.expired_count(),
            total_tokens: self.tokens.len(),
            success_cache_len: self.caches.success_len(),
            negative_cache_len: self.caches.negative_len(),
            repair_queue: self.repair_queue.status(),
        }
    }

    /// `EnqueueRepair(torrentId)` (spec.md §4.9).
    pub fn enqueue_repair(&self, id: TorrentId) {
        self.repair.enqueue(id);
    }

    pub fn repair_state(&self, id: &TorrentId) -> RepairState {
        self.repair.state_of(id)
    }

    /// Halts the in-progress repair drain between torrents (spec.md §4.9 `StopRepair`).
    pub fn stop_repair(&self) {
        self.repair.stop();
    }

    /// Runs one repair scan-and-drain cycle synchronously, useful for an on-demand
    /// `EnqueueRepair` trigger outside the scheduler's own periodic cadence.
    pub async fn run_repair_scan(&self) -> usize {
        let flagged = self.repair.scan().await;
        self.repair.drain().await;
        flagged
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn find_by_name_or_id(&self, torrent_id_or_name: &str) -> Option<TorrentSummary> {
        let candidate = TorrentId(torrent_id_or_name.to_string());
        self.catalog.find_by_id(&candidate).or_else(|| self.catalog.find_by_name(torrent_id_or_name))
    }

    /// Starts the six background tasks spec.md §4.8 describes. Idempotent only in the
    /// sense that calling it twice leaks the first scheduler's tasks — callers are
    /// expected to call this once at startup. `mount_ready` is invoked exactly once,
    /// the first time the catalog becomes non-empty (spec.md §4.8 "Pending mount").
    pub fn start_scheduler<F>(&mut self, config: &Config, base_url: String, mount_ready: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut scheduler = Scheduler::new();

        let catalog_for_refresh = self.catalog.clone();
        scheduler.spawn_library_refresh(
            config.refresh.effective_interval(),
            catalog_for_refresh,
            self.upstream.clone(),
            self.resolver.clone(),
            |added, removed| {
                info!(added = added.len(), removed = removed.len(), "catalog change observed");
            },
        );

        scheduler.spawn_bandwidth_reset(self.tokens.clone());
        scheduler.spawn_token_recovery(self.tokens.clone(), self.caches.clone(), base_url);
        scheduler.spawn_catalog_sync(config.refresh.effective_interval(), self.catalog.clone(), self.store.clone());
        scheduler.spawn_repair_scan(config, self.repair.clone());
        scheduler.spawn_pending_mount(self.catalog.clone(), mount_ready);

        self.scheduler = Some(scheduler);
    }

    /// Cancels every background task, waits for each to finish (spec.md §5 "On
    /// graceful shutdown, the scheduler cancels all tasks"), then gives the store its
    /// final checkpoint and optimize run (spec.md §4.4).
    pub async fn shutdown(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
        // Resolver and Repair each hold their own clone of the store's Arc; drop them
        // first so the unwrap below sees the sole remaining reference.
        drop(self.resolver);
        drop(self.repair);
        match Arc::try_unwrap(self.store) {
            Ok(store) => {
                if let Err(e) = store.close() {
                    warn!(error = %e, "store close failed");
                }
            }
            Err(_) => warn!("store still has outstanding references at shutdown, skipping final checkpoint"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TorrentStatus, TorrentSummary};
    use crate::upstream_client::{TrafficDetails, UnrestrictResponse, UserInfo};
    use async_trait::async_trait;

    struct EmptyUpstream;

    #[async_trait]
    impl UpstreamApi for EmptyUpstream {
        async fn user_info(&self) -> Result<UserInfo> {
            unimplemented!()
        }
        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }
        async fn traffic_details(&self) -> Result<TrafficDetails> {
            unimplemented!()
        }
        async fn torrents(&self, _limit: u32, _offset: u32) -> Result<Vec<TorrentSummary>> {
            Ok(vec![])
        }
        async fn torrents_page(&self, _page: u32, _limit: u32) -> Result<Vec<TorrentSummary>> {
            Ok(vec![])
        }
        async fn get_all_torrents(&self) -> Result<Vec<TorrentSummary>> {
            Ok(vec![])
        }
        async fn torrent_info(&self, id: &TorrentId) -> Result<crate::model::TorrentInfo> {
            Err(crate::error::CoreError::TorrentNotFound(id.0.clone()))
        }
        async fn add_magnet(&self, _magnet: &str) -> Result<TorrentId> {
            unimplemented!()
        }
        async fn select_files(&self, _id: &TorrentId, _file_ids: &[u32]) -> Result<()> {
            unimplemented!()
        }
        async fn delete_torrent(&self, _id: &TorrentId) -> Result<()> {
            Ok(())
        }
        async fn unrestrict(&self, _link: &str, _filename_hint: Option<&str>) -> Result<UnrestrictResponse> {
            unimplemented!()
        }
        async fn check_link(&self, _link: &str) -> Result<()> {
            Ok(())
        }
        async fn instant_availability(&self, _hashes: &[String]) -> Result<serde_json::Value> {
            unimplemented!()
        }
    }

    fn test_core() -> Core {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store_path = dir.path().join("core_test.redb").to_str().unwrap().to_string();
        std::mem::forget(dir);
        let tokens = Arc::new(TokenRing::new("test-token".into(), vec![]));
        Core::with_upstream(config, tokens, Arc::new(EmptyUpstream)).unwrap()
    }

    fn summary(id: &str) -> TorrentSummary {
        TorrentSummary {
            id: id.into(),
            display_name: id.to_string(),
            size_bytes: 1,
            file_count: 1,
            status: TorrentStatus::Downloaded,
            added_at: chrono::Utc::now(),
            ended_at: None,
            hash: Some("HASH".into()),
            modified_unix: 0,
        }
    }

    #[tokio::test]
    async fn stats_reflects_seeded_catalog() {
        let core = test_core();
        core.catalog.seed(vec![summary("T1"), summary("T2")]);
        let stats = core.stats();
        assert_eq!(stats.catalog.total_count, 2);
        assert_eq!(stats.total_tokens, 1);
        assert_eq!(stats.expired_tokens, 0);
    }

    #[tokio::test]
    async fn enqueue_repair_is_visible_in_repair_queue_status() {
        let core = test_core();
        core.catalog.seed(vec![summary("T1")]);
        core.enqueue_repair("T1".into());
        assert_eq!(core.stats().repair_queue.pending, vec![TorrentId::from("T1")]);
    }

    #[tokio::test]
    async fn resolve_unknown_id_surfaces_torrent_not_found() {
        let core = test_core();
        let err = core.resolve("missing", "file.mkv").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn find_by_name_or_id_accepts_either() {
        let core = test_core();
        core.catalog.seed(vec![summary("T1")]);
        assert!(core.find_by_name_or_id("T1").is_some());
        assert!(core.find_by_name_or_id("nope").is_none());
    }

    #[tokio::test]
    async fn shutdown_reclaims_and_closes_the_store() {
        let core = test_core();
        core.catalog.seed(vec![summary("T1")]);
        core.shutdown().await;
    }
}
