use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::catalog::{is_video_file, Catalog};
use crate::config::{RepairConfig, RepairStrategy};
use crate::error::{CoreError, Result, CODE_INFRINGING_FILE};
use crate::model::{RepairEntry, TorrentId, TorrentStatus};
use crate::resolver::Resolver;
use crate::store::Store;
use crate::upstream_client::UpstreamApi;
use crate::workers::IO_WORKER_POOL_SIZE;

/// Per-torrent state during repair (spec.md §4.7): `idle → queued → running →
/// {reinserted, unrepairable, cancelled}`. Distinct from `TorrentStatus`, which
/// describes the upstream provider's own lifecycle, not this pipeline's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairState {
    Idle,
    Queued,
    Running,
    Reinserted,
    Unrepairable,
    Cancelled,
}

/// Translates a hash + display name into a magnet link (spec.md §4.7.C step 2).
pub fn build_magnet(hash: &str, display_name: &str) -> String {
    format!("magnet:?xt=urn:btih:{}&dn={}", hash, urlencoding::encode(display_name))
}

/// Maps `oldId → newId` after a reinsertion (spec.md §4.7.C step 7). Consulted at
/// resolve time only; never written outside the reinsertion pipeline. Follows a chain
/// in case a torrent is reinserted more than once over its lifetime.
pub struct IdMapping {
    map: DashMap<TorrentId, TorrentId>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn set(&self, old: TorrentId, new: TorrentId) {
        self.map.insert(old, new);
    }

    pub fn resolve(&self, id: TorrentId) -> TorrentId {
        let mut current = id;
        let mut seen = HashSet::new();
        while let Some(next) = self.map.get(&current) {
            if !seen.insert(current.clone()) {
                break;
            }
            let next = next.value().clone();
            if next == current {
                break;
            }
            current = next;
        }
        current
    }
}

impl Default for IdMapping {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepairQueueStatus {
    pub pending: Vec<TorrentId>,
    pub running: Option<TorrentId>,
}

struct QueueState {
    queue: VecDeque<TorrentId>,
    members: HashSet<TorrentId>,
    running: Option<TorrentId>,
}

/// FIFO with a membership set (spec.md §4.7.B). `Enqueue` is idempotent; the currently
/// running id is protected from removal.
pub struct RepairQueue {
    state: Mutex<QueueState>,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self { state: Mutex::new(QueueState { queue: VecDeque::new(), members: HashSet::new(), running: None }) }
    }

    /// Returns `true` if this call actually added the id (it wasn't already pending or
    /// running).
    pub fn enqueue(&self, id: TorrentId) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.members.contains(&id) || state.running.as_ref() == Some(&id) {
            return false;
        }
        state.members.insert(id.clone());
        state.queue.push_back(id);
        true
    }

    pub fn dequeue(&self) -> Option<TorrentId> {
        let mut state = self.state.lock().unwrap();
        let id = state.queue.pop_front()?;
        state.members.remove(&id);
        state.running = Some(id.clone());
        Some(id)
    }

    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = None;
    }

    /// Removes `ids` from the pending portion; the currently running id is untouched
    /// (spec.md §4.7.B: "Removing ids from the pending portion is allowed; the
    /// currently running id is protected").
    pub fn remove(&self, ids: &[TorrentId]) {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if state.running.as_ref() != Some(id) {
                state.members.remove(id);
                state.queue.retain(|q| q != id);
            }
        }
    }

    pub fn status(&self) -> RepairQueueStatus {
        let state = self.state.lock().unwrap();
        RepairQueueStatus { pending: state.queue.iter().cloned().collect(), running: state.running.clone() }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RepairQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an error surfacing from the reinsertion pipeline to the literal reason string
/// spec.md §6 mandates for `RepairEntry.reason`, falling back to the error's own
/// Display text for reasons the spec leaves free-form.
fn repair_reason_for(err: &CoreError) -> String {
    if err.code() == Some(CODE_INFRINGING_FILE) {
        "infringing_file".into()
    } else {
        err.to_string()
    }
}

const PER_TORRENT_BUDGET: std::time::Duration = std::time::Duration::from_secs(30);
/// Upper bound on reinsertion polling iterations while waiting for file selection to
/// resolve to a terminal status, guarding against an upstream stuck mid-transition.
const MAX_POLL_ITERATIONS: u32 = 30;
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Detects and remediates broken torrents (spec.md §4.7): detection, the FIFO queue,
/// reinsertion, and post-reinsertion verification/cleanup.
pub struct Repair {
    queue: Arc<RepairQueue>,
    states: DashMap<TorrentId, RepairState>,
    catalog: Arc<Catalog>,
    store: Arc<Store>,
    upstream: Arc<dyn UpstreamApi>,
    resolver: Arc<Resolver>,
    id_mapping: Arc<IdMapping>,
    config: RepairConfig,
    inflight: DashMap<TorrentId, Arc<Notify>>,
    failed_to_reinsert: DashMap<TorrentId, String>,
    deleted_old: DashMap<TorrentId, ()>,
    stop_flag: Arc<AtomicBool>,
}

impl Repair {
    pub fn new(
        queue: Arc<RepairQueue>,
        catalog: Arc<Catalog>,
        store: Arc<Store>,
        upstream: Arc<dyn UpstreamApi>,
        resolver: Arc<Resolver>,
        id_mapping: Arc<IdMapping>,
        config: RepairConfig,
    ) -> Self {
        Self {
            queue,
            states: DashMap::new(),
            catalog,
            store,
            upstream,
            resolver,
            id_mapping,
            config,
            inflight: DashMap::new(),
            failed_to_reinsert: DashMap::new(),
            deleted_old: DashMap::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn enqueue(&self, id: TorrentId) {
        if self.queue.enqueue(id.clone()) {
            self.states.insert(id, RepairState::Queued);
        }
    }

    /// Halts `drain` between torrents and cancels everything still pending (spec.md
    /// §4.7 state machine's `cancelled` terminal state). The torrent `drain` is
    /// currently processing, if any, keeps running its budgeted attempt and reaches its
    /// own terminal state; only ids that haven't started yet are cancelled outright.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let pending = self.queue.status().pending;
        self.queue.remove(&pending);
        for id in pending {
            self.states.insert(id, RepairState::Cancelled);
        }
    }

    pub fn status(&self) -> RepairQueueStatus {
        self.queue.status()
    }

    pub fn state_of(&self, id: &TorrentId) -> RepairState {
        self.states.get(id).map(|s| *s.value()).unwrap_or(RepairState::Idle)
    }

    /// Drains the queue, processing one torrent at a time with a 30s outer budget
    /// each; respects a global stop flag checked between torrents (spec.md §4.7
    /// "repair-scan respects a global stop flag that halts between torrents").
    pub async fn drain(&self) {
        while !self.stop_flag.load(Ordering::SeqCst) {
            let Some(id) = self.queue.dequeue() else { break };
            self.states.insert(id.clone(), RepairState::Running);

            match tokio::time::timeout(PER_TORRENT_BUDGET, self.process_one(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(torrent = %id, error = %e, "repair failed");
                    let reason = repair_reason_for(&e);
                    self.persist_failure(&id, &reason).await;
                    self.states.insert(id.clone(), RepairState::Unrepairable);
                }
                Err(_) => {
                    warn!(torrent = %id, "repair timed out");
                    self.persist_failure(&id, "repair_timeout").await;
                    self.states.insert(id.clone(), RepairState::Unrepairable);
                }
            }
            self.queue.finish();
        }
    }

    async fn persist_failure(&self, id: &TorrentId, reason: &str) {
        self.failed_to_reinsert.insert(id.clone(), reason.to_string());
        if let Some(summary) = self.catalog.find_by_id(id) {
            let entry = RepairEntry {
                torrent_id: id.clone(),
                display_name: summary.display_name,
                hash: summary.hash,
                status: summary.status,
                progress: 0,
                reason: reason.to_string(),
                updated_at: chrono::Utc::now(),
            };
            let _ = self.store.upsert_repair_entry(&entry).await;
        }
    }

    /// Reinsertion (C) followed by verification/cleanup (D) for a single torrent.
    /// Deduplicates concurrent requests for the same id via an in-flight map; only the
    /// first caller actually runs the pipeline, the rest wait on its completion.
    async fn process_one(&self, old_id: &TorrentId) -> Result<()> {
        if self.failed_to_reinsert.contains_key(old_id) {
            return Err(CoreError::RepairFailed { torrent_id: old_id.0.clone(), reason: "previously unrepairable".into() });
        }

        let notify = {
            if let Some(existing) = self.inflight.get(old_id) {
                Some(existing.value().clone())
            } else {
                self.inflight.insert(old_id.clone(), Arc::new(Notify::new()));
                None
            }
        };
        if let Some(notify) = notify {
            // Waiters don't get the leader's exact Result back (CoreError isn't Clone,
            // unlike the generic SingleFlight): the durable outcome is `self.states`,
            // queryable via `state_of`. In practice this path is rarely contended —
            // `drain` is the only caller and processes the queue one id at a time.
            notify.notified().await;
            return Ok(());
        }

        let result = self.reinsert_and_verify(old_id).await;
        if let Some((_, notify)) = self.inflight.remove(old_id) {
            notify.notify_waiters();
        }
        result
    }

    async fn reinsert_and_verify(&self, old_id: &TorrentId) -> Result<()> {
        let old_info = self
            .store
            .get_info(old_id)
            .await?
            .ok_or_else(|| CoreError::TorrentNotFound(old_id.0.clone()))?;
        let hash = old_info.hash.clone().ok_or_else(|| CoreError::RepairFailed {
            torrent_id: old_id.0.clone(),
            reason: "missing_hash".into(),
        })?;

        let magnet = build_magnet(&hash, &old_info.display_name);

        let new_id = self.upstream.add_magnet(&magnet).await?;
        let new_info = match self.drive_to_downloaded(&new_id).await {
            Ok(info) => info,
            Err(e) => {
                let _ = self.upstream.delete_torrent(&new_id).await;
                return Err(e);
            }
        };

        if new_info.links.is_empty() {
            let _ = self.upstream.delete_torrent(&new_id).await;
            return Err(CoreError::RepairFailed { torrent_id: old_id.0.clone(), reason: "no_links_after_reinsert".into() });
        }

        let mut enriched = new_info;
        if enriched.hash.is_none() {
            enriched.hash = old_info.hash.clone();
        }
        if enriched.size_bytes == 0 {
            enriched.size_bytes = old_info.size_bytes;
        }
        if enriched.display_name.is_empty() {
            enriched.display_name = old_info.display_name.clone();
        }
        if enriched.files.is_empty() {
            enriched.files = old_info.files.clone();
        }
        enriched.original_id = Some(old_id.clone());

        self.id_mapping.set(old_id.clone(), enriched.id.clone());
        self.catalog.upsert(enriched.summary());
        self.store.upsert_info(&enriched).await?;

        let mut total = 0usize;
        let mut failed = 0usize;
        for file in enriched.files.iter().filter(|f| f.selected && is_video_file(&f.path)) {
            total += 1;
            if self.resolver.resolve(&enriched.id.0, file.name()).await.is_err() {
                failed += 1;
            }
        }
        let all_ok = failed == 0;

        if all_ok {
            if self.deleted_old.insert(old_id.clone(), ()).is_none() {
                if let Err(e) = self.upstream.delete_torrent(old_id).await {
                    warn!(torrent = %old_id, error = %e, "failed to delete stale torrent after reinsertion");
                } else {
                    self.catalog.delete_by_id(old_id);
                    self.store.delete_info(old_id).await?;
                    self.store.delete_summary(old_id).await?;
                }
            }
            self.states.insert(old_id.clone(), RepairState::Reinserted);
            info!(old = %old_id, new = %enriched.id, "reinsertion verified, stale torrent removed");
            Ok(())
        } else {
            warn!(old = %old_id, new = %enriched.id, failed, total, "reinsertion left some files unresolved, keeping both ids");
            let reason = format!("link_validation_failed_per_file_{}_of_{}", failed, total);
            self.persist_failure(old_id, &reason).await;
            self.states.insert(old_id.clone(), RepairState::Unrepairable);
            Ok(())
        }
    }

    async fn drive_to_downloaded(&self, id: &TorrentId) -> Result<crate::model::TorrentInfo> {
        for _ in 0..MAX_POLL_ITERATIONS {
            let info = self.upstream.torrent_info(id).await?;
            match info.status {
                TorrentStatus::WaitingFilesSelection => {
                    let video_ids: Vec<u32> =
                        info.files.iter().filter(|f| is_video_file(&f.path)).map(|f| f.file_id).collect();
                    let ids = if video_ids.is_empty() { vec![1] } else { video_ids };
                    self.upstream.select_files(id, &ids).await?;
                }
                TorrentStatus::Downloading | TorrentStatus::Queued => {
                    return Err(CoreError::RepairFailed { torrent_id: id.0.clone(), reason: "not_cached".into() });
                }
                TorrentStatus::MagnetError | TorrentStatus::Error | TorrentStatus::Dead | TorrentStatus::Virus => {
                    return Err(CoreError::RepairFailed { torrent_id: id.0.clone(), reason: format!("terminal_{}", info.status) });
                }
                TorrentStatus::Downloaded => return Ok(info),
                TorrentStatus::Unknown => {}
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(CoreError::RepairFailed { torrent_id: id.0.clone(), reason: "repair_timeout".into() })
    }

    /// Periodic detection scan (spec.md §4.7.A): re-validates every cached torrent
    /// whose status is a repair candidate. Per-file strategy brands the torrent broken
    /// on any single link failure; per-torrent short-circuits on the first failure.
    pub async fn scan(&self) -> usize {
        let mut flagged = 0;
        for summary in self.catalog.all() {
            if !summary.status.is_repair_scan_candidate() {
                continue;
            }
            let Ok(Some(info)) = self.store.get_info(&summary.id).await else { continue };
            let broken = match self.config.strategy {
                RepairStrategy::PerFile => {
                    // Any single failure brands the torrent broken (spec.md §4.7.A);
                    // checks run concurrently bounded by the I/O worker pool (spec.md
                    // §5) since there's no short-circuit requirement for this strategy.
                    let results: Vec<bool> = futures_util::stream::iter(info.links.iter())
                        .map(|link| async move { self.upstream.check_link(link).await.is_err() })
                        .buffer_unordered(IO_WORKER_POOL_SIZE)
                        .collect()
                        .await;
                    results.into_iter().any(|broken| broken)
                }
                RepairStrategy::PerTorrent => {
                    let mut broken = false;
                    for link in &info.links {
                        if self.upstream.check_link(link).await.is_err() {
                            broken = true;
                            break;
                        }
                    }
                    broken
                }
            };
            if broken || info.is_broken() {
                flagged += 1;
                self.enqueue(summary.id);
            }
        }
        flagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepairConfig;
    use crate::store::Store;

    struct NullUpstream;

    #[async_trait::async_trait]
    impl UpstreamApi for NullUpstream {
        async fn user_info(&self) -> Result<crate::upstream_client::UserInfo> {
            unimplemented!()
        }
        async fn test_connection(&self) -> Result<()> {
            unimplemented!()
        }
        async fn traffic_details(&self) -> Result<crate::upstream_client::TrafficDetails> {
            unimplemented!()
        }
        async fn torrents(&self, _limit: u32, _offset: u32) -> Result<Vec<crate::model::TorrentSummary>> {
            unimplemented!()
        }
        async fn torrents_page(&self, _page: u32, _limit: u32) -> Result<Vec<crate::model::TorrentSummary>> {
            unimplemented!()
        }
        async fn get_all_torrents(&self) -> Result<Vec<crate::model::TorrentSummary>> {
            unimplemented!()
        }
        async fn torrent_info(&self, _id: &TorrentId) -> Result<crate::model::TorrentInfo> {
            unimplemented!()
        }
        async fn add_magnet(&self, _magnet: &str) -> Result<TorrentId> {
            unimplemented!()
        }
        async fn select_files(&self, _id: &TorrentId, _file_ids: &[u32]) -> Result<()> {
            unimplemented!()
        }
        async fn delete_torrent(&self, _id: &TorrentId) -> Result<()> {
            unimplemented!()
        }
        async fn unrestrict(
            &self,
            _link: &str,
            _filename_hint: Option<&str>,
        ) -> Result<crate::upstream_client::UnrestrictResponse> {
            unimplemented!()
        }
        async fn check_link(&self, _link: &str) -> Result<()> {
            unimplemented!()
        }
        async fn instant_availability(&self, _hashes: &[String]) -> Result<serde_json::Value> {
            unimplemented!()
        }
    }

    fn test_repair(dir: &tempfile::TempDir) -> Repair {
        let store = Arc::new(Store::open(dir.path().join("t.redb").to_str().unwrap()).unwrap());
        let catalog = Arc::new(Catalog::new(false));
        let upstream: Arc<dyn UpstreamApi> = Arc::new(NullUpstream);
        let id_mapping = Arc::new(IdMapping::new());
        let caches = Arc::new(crate::caches::LinkCaches::new());
        let resolver = Arc::new(Resolver::new(
            catalog.clone(),
            caches,
            store.clone(),
            upstream.clone(),
            Arc::new(RepairQueue::new()),
            id_mapping.clone(),
        ));
        Repair::new(Arc::new(RepairQueue::new()), catalog, store, upstream, resolver, id_mapping, RepairConfig::default())
    }

    #[test]
    fn repair_reason_for_maps_infringing_file_code() {
        let err = CoreError::Upstream { message: "nope".into(), code: Some(CODE_INFRINGING_FILE) };
        assert_eq!(repair_reason_for(&err), "infringing_file");

        let other = CoreError::Upstream { message: "nope".into(), code: Some(7) };
        assert_eq!(repair_reason_for(&other), other.to_string());
    }

    #[test]
    fn stop_cancels_every_pending_id_and_protects_the_running_one() {
        let dir = tempfile::tempdir().unwrap();
        let repair = test_repair(&dir);

        repair.enqueue("T1".into());
        repair.enqueue("T2".into());
        let running = repair.queue.dequeue().unwrap();
        assert_eq!(running, TorrentId::from("T1"));
        repair.states.insert(running.clone(), RepairState::Running);

        repair.stop();

        assert_eq!(repair.state_of(&TorrentId::from("T2")), RepairState::Cancelled);
        assert_eq!(repair.state_of(&TorrentId::from("T1")), RepairState::Running);
        assert!(repair.queue.status().pending.is_empty());
    }

    #[test]
    fn enqueue_is_idempotent() {
        let q = RepairQueue::new();
        assert!(q.enqueue("T1".into()));
        assert!(!q.enqueue("T1".into()));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn running_id_is_protected_from_remove() {
        let q = RepairQueue::new();
        q.enqueue("T1".into());
        let running = q.dequeue().unwrap();
        assert_eq!(running, TorrentId::from("T1"));
        q.remove(&[TorrentId::from("T1")]);
        assert_eq!(q.status().running, Some(TorrentId::from("T1")));
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = RepairQueue::new();
        q.enqueue("T1".into());
        q.enqueue("T2".into());
        assert_eq!(q.dequeue().unwrap(), TorrentId::from("T1"));
        q.finish();
        assert_eq!(q.dequeue().unwrap(), TorrentId::from("T2"));
    }

    #[test]
    fn id_mapping_resolves_and_breaks_cycles() {
        let m = IdMapping::new();
        m.set("T1".into(), "T2".into());
        m.set("T2".into(), "T3".into());
        assert_eq!(m.resolve("T1".into()), TorrentId::from("T3"));

        m.set("T3".into(), "T1".into());
        let resolved = m.resolve("T1".into());
        assert!(["T1", "T2", "T3"].contains(&resolved.0.as_str()));
    }

    #[test]
    fn build_magnet_url_encodes_display_name() {
        let magnet = build_magnet("HASH123", "Movie Name (2020).mkv");
        assert!(magnet.starts_with("magnet:?xt=urn:btih:HASH123&dn="));
        assert!(magnet.contains("Movie%20Name"));
    }
}
