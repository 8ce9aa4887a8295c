use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use futures_util::StreamExt;

use crate::caches::LinkCaches;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::model::{TorrentId, TorrentSummary};
use crate::repair::Repair;
use crate::resolver::Resolver;
use crate::store::Store;
use crate::token_ring::TokenRing;
use crate::upstream_client::UpstreamApi;
use crate::workers::API_WORKER_POOL_SIZE;

/// Size of the lightweight listing page `spawn_library_refresh` fetches every cycle
/// instead of the full, paginated `get_all_torrents` (spec.md §4.8 "Library refresh").
const FIRST_PAGE_LIMIT: u32 = 50;

/// CET with no DST handling beyond the documented fallback (spec.md §4.8 "Bandwidth
/// reset": "00:05 CET (fallback fixed +01:00 zone)").
fn cet_offset() -> FixedOffset {
    FixedOffset::east_opt(3600).expect("fixed +01:00 offset is always valid")
}

fn duration_until_next_0005_cet() -> Duration {
    let now = Utc::now().with_timezone(&cet_offset());
    let mut target = now.date_naive().and_hms_opt(0, 5, 0).unwrap().and_local_timezone(cet_offset()).unwrap();
    if target <= now {
        target += chrono::Duration::days(1);
    }
    (target - now).to_std().unwrap_or(Duration::from_secs(60))
}

/// Pairs a cancel signal with a done signal (spec.md §9 "Background-task lifecycle").
struct TaskHandle {
    cancel: Arc<AtomicBool>,
    done: Arc<Notify>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    async fn shutdown(self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
        let _ = self.join.await;
    }
}

/// Spawns `body` under panic-and-restart supervision: if the task panics it is
/// respawned after a short delay, until `cancel` is set (spec.md §7 "Panics in
/// background tasks... are caught by a task-level recovery that logs and restarts the
/// task after a delay").
fn supervise<F, Fut>(name: &'static str, cancel: Arc<AtomicBool>, done: Arc<Notify>, mut body: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let handle = tokio::spawn(body());
            match handle.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(task = name, "background task panicked, restarting in 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(_) => break,
            }
        }
        done.notify_waiters();
    })
}

/// Drives the six cooperative background tasks (spec.md §4.8). Each task owns a
/// `(cancel, done)` pair; `shutdown` cancels all of them and waits for each to finish.
pub struct Scheduler {
    tasks: Vec<TaskHandle>,
    probe_client: reqwest::Client,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { tasks: Vec::new(), probe_client: reqwest::Client::new() }
    }

    /// Library refresh (spec.md §4.8 "Library refresh"): fetches the lightweight first
    /// page instead of the full paginated listing every cycle, compares it against the
    /// catalog's fingerprint, and only escalates to `get_all_torrents` when the evidence
    /// points at a removal; otherwise it merges whatever new ids the page surfaces with
    /// the cached tail. Only a changed catalog invokes `on_change`.
    pub fn spawn_library_refresh<OnChange>(
        &mut self,
        interval: Duration,
        catalog: Arc<Catalog>,
        upstream: Arc<dyn UpstreamApi>,
        resolver: Arc<Resolver>,
        on_change: OnChange,
    ) where
        OnChange: Fn(Vec<TorrentId>, Vec<TorrentId>) + Send + Sync + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Notify::new());
        let on_change = Arc::new(on_change);
        let cancel_body = cancel.clone();
        let join = supervise("library_refresh", cancel.clone(), done.clone(), move || {
            let catalog = catalog.clone();
            let upstream = upstream.clone();
            let resolver = resolver.clone();
            let on_change = on_change.clone();
            let cancel = cancel_body.clone();
            async move {
                while !cancel.load(Ordering::SeqCst) {
                    let before = catalog.fingerprint();
                    match tokio::time::timeout(Duration::from_secs(10), upstream.torrents(FIRST_PAGE_LIMIT, 0)).await {
                        Ok(Ok(first_page)) => {
                            let page_total = first_page.len() as u64;
                            let page_is_complete = page_total < FIRST_PAGE_LIMIT as u64;
                            let unchanged = page_is_complete
                                && page_total == before.total_count
                                && first_page.iter().map(|t| t.id.clone()).min() == before.first_torrent_id;

                            if unchanged {
                                // fingerprint confirms nothing changed; skip the rest of the cycle.
                            } else if page_is_complete {
                                // the lightweight page already holds the entire library: reconcile
                                // from it directly, covering both additions and removals without a
                                // second, full-paginated call.
                                info!(old = before.total_count, new = page_total, "library state changed, reconciling catalog");
                                reconcile_and_notify(&catalog, &resolver, &on_change, first_page).await;
                            } else {
                                merge_or_escalate(&catalog, &upstream, &resolver, &on_change, before.total_count, first_page)
                                    .await;
                            }
                        }
                        Ok(Err(e)) => warn!(error = %e, "library refresh fetch failed"),
                        Err(_) => warn!("library refresh timed out after 10s"),
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        });
        self.tasks.push(TaskHandle { cancel, done, join });
    }

    /// Bandwidth reset (spec.md §4.8): wakes at 00:05 CET (falling back to the fixed
    /// +01:00 offset) and calls `TokenRing::reset_all`.
    pub fn spawn_bandwidth_reset(&mut self, tokens: Arc<TokenRing>) {
        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Notify::new());
        let cancel_body = cancel.clone();
        let join = supervise("bandwidth_reset", cancel.clone(), done.clone(), move || {
            let tokens = tokens.clone();
            let cancel = cancel_body.clone();
            async move {
                while !cancel.load(Ordering::SeqCst) {
                    let wait = duration_until_next_0005_cet();
                    tokio::time::sleep(wait).await;
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    tokens.reset_all();
                }
            }
        });
        self.tasks.push(TaskHandle { cancel, done, join });
    }

    /// Token recovery (spec.md §4.8): every minute, probes each expired token directly
    /// against `/user`; a 200 (or any response unrelated to bandwidth) marks it
    /// recovered and forces re-resolution by dropping the success/per-file caches.
    pub fn spawn_token_recovery(&mut self, tokens: Arc<TokenRing>, caches: Arc<LinkCaches>, base_url: String) {
        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Notify::new());
        let cancel_body = cancel.clone();
        let client = self.probe_client.clone();
        let join = supervise("token_recovery", cancel.clone(), done.clone(), move || {
            let tokens = tokens.clone();
            let caches = caches.clone();
            let cancel = cancel_body.clone();
            let client = client.clone();
            let base_url = base_url.clone();
            async move {
                while !cancel.load(Ordering::SeqCst) {
                    for token in tokens.expired_tokens() {
                        let url = format!("{}/user", base_url);
                        let resp = client.get(&url).bearer_auth(&token.value).send().await;
                        let recovered = match resp {
                            Ok(r) if r.status().is_success() => true,
                            Ok(r) => r.status() != reqwest::StatusCode::FORBIDDEN,
                            Err(_) => false,
                        };
                        if recovered {
                            tokens.mark_recovered(&token.value);
                            caches.clear_all_success();
                        }
                    }
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }
        });
        self.tasks.push(TaskHandle { cancel, done, join });
    }

    /// Catalog sync (spec.md §4.8): every `interval` (≥10s), reconciles Store rows
    /// against the Catalog's live id set.
    pub fn spawn_catalog_sync(&mut self, interval: Duration, catalog: Arc<Catalog>, store: Arc<Store>) {
        let interval = interval.max(Duration::from_secs(10));
        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Notify::new());
        let cancel_body = cancel.clone();
        let join = supervise("catalog_sync", cancel.clone(), done.clone(), move || {
            let catalog = catalog.clone();
            let store = store.clone();
            let cancel = cancel_body.clone();
            async move {
                while !cancel.load(Ordering::SeqCst) {
                    if let Err(e) = sync_once(&catalog, &store).await {
                        warn!(error = %e, "catalog sync failed");
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        });
        self.tasks.push(TaskHandle { cancel, done, join });
    }

    /// Repair scan (spec.md §4.8): first run after 5 minutes, then every
    /// `config.repair.scan_interval_hours`.
    pub fn spawn_repair_scan(&mut self, config: &Config, repair: Arc<Repair>) {
        if !config.repair.enabled || !config.repair.auto_start {
            return;
        }
        let interval = Duration::from_secs(config.repair.scan_interval_hours.max(1) * 3600);
        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Notify::new());
        let cancel_body = cancel.clone();
        let join = supervise("repair_scan", cancel.clone(), done.clone(), move || {
            let repair = repair.clone();
            let cancel = cancel_body.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5 * 60)).await;
                while !cancel.load(Ordering::SeqCst) {
                    let flagged = repair.scan().await;
                    if flagged > 0 {
                        info!(flagged, "repair scan enqueued torrents");
                    }
                    repair.drain().await;
                    tokio::time::sleep(interval).await;
                }
            }
        });
        self.tasks.push(TaskHandle { cancel, done, join });
    }

    /// Pending mount (spec.md §4.8): invokes `mount_ready` exactly once, the first
    /// time the catalog becomes non-empty.
    pub fn spawn_pending_mount<F>(&mut self, catalog: Arc<Catalog>, mount_ready: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Notify::new());
        let cancel_body = cancel.clone();
        let mount_ready = Arc::new(mount_ready);
        let join = supervise("pending_mount", cancel.clone(), done.clone(), move || {
            let catalog = catalog.clone();
            let cancel = cancel_body.clone();
            let mount_ready = mount_ready.clone();
            async move {
                while !cancel.load(Ordering::SeqCst) {
                    if !catalog.is_empty() {
                        mount_ready();
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        });
        self.tasks.push(TaskHandle { cancel, done, join });
    }

    /// Cancels every task and waits for each to finish (spec.md §5 "On graceful
    /// shutdown, the scheduler cancels all tasks").
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.shutdown().await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces the catalog's contents with `fresh`, prefetches every added torrent
/// (spec.md §4.8), and invokes `on_change` if anything actually moved.
async fn reconcile_and_notify<OnChange>(
    catalog: &Catalog,
    resolver: &Arc<Resolver>,
    on_change: &OnChange,
    fresh: Vec<TorrentSummary>,
) where
    OnChange: Fn(Vec<TorrentId>, Vec<TorrentId>) + Send + Sync,
{
    let (added, removed) = catalog.reconcile(fresh);
    if !added.is_empty() {
        let prefetch_ids = added.clone();
        futures_util::stream::iter(prefetch_ids)
            .for_each_concurrent(API_WORKER_POOL_SIZE, |id| {
                let resolver = resolver.clone();
                async move { resolver.prefetch(&id).await }
            })
            .await;
    }
    if !added.is_empty() || !removed.is_empty() {
        on_change(added, removed);
    }
}

/// Handles a saturated first page (the library holds at least `FIRST_PAGE_LIMIT`
/// torrents, so the page alone can't prove the old total shrank). Compares the page
/// against the catalog's most-recently-added window: if a torrent the catalog expects
/// to still be near the front is missing from the fresh page, something was removed
/// and this escalates to the full paginated listing to compute exactly what (spec.md
/// §4.8: "if newTotal < oldTotal, fetch all torrents to compute removals"). Otherwise
/// it merges the new ids the page surfaces with the cached tail, the cheap path for a
/// library that's only grown.
async fn merge_or_escalate<OnChange>(
    catalog: &Catalog,
    upstream: &Arc<dyn UpstreamApi>,
    resolver: &Arc<Resolver>,
    on_change: &OnChange,
    old_total: u64,
    first_page: Vec<TorrentSummary>,
) where
    OnChange: Fn(Vec<TorrentId>, Vec<TorrentId>) + Send + Sync,
{
    let mut known = catalog.all();
    known.sort_by(|a, b| b.added_at.cmp(&a.added_at));
    let expected_recent: std::collections::HashSet<TorrentId> =
        known.into_iter().take(FIRST_PAGE_LIMIT as usize).map(|t| t.id).collect();
    let fresh_ids: std::collections::HashSet<TorrentId> = first_page.iter().map(|t| t.id.clone()).collect();
    let removal_suspected = expected_recent.difference(&fresh_ids).next().is_some();

    if removal_suspected {
        match tokio::time::timeout(Duration::from_secs(10), upstream.get_all_torrents()).await {
            Ok(Ok(fresh)) => {
                info!(old = old_total, "library shrink suspected, reconciling from full listing");
                reconcile_and_notify(catalog, resolver, on_change, fresh).await;
            }
            Ok(Err(e)) => warn!(error = %e, "library refresh full fetch failed"),
            Err(_) => warn!("library refresh full fetch timed out after 10s"),
        }
        return;
    }

    let added: Vec<TorrentSummary> = first_page.into_iter().filter(|t| catalog.find_by_id(&t.id).is_none()).collect();
    if added.is_empty() {
        return;
    }
    let added_ids: Vec<TorrentId> = added.iter().map(|t| t.id.clone()).collect();
    for item in added {
        catalog.upsert(item);
    }
    let prefetch_ids = added_ids.clone();
    futures_util::stream::iter(prefetch_ids)
        .for_each_concurrent(API_WORKER_POOL_SIZE, |id| {
            let resolver = resolver.clone();
            async move { resolver.prefetch(&id).await }
        })
        .await;
    on_change(added_ids, Vec::new());
}

async fn sync_once(catalog: &Catalog, store: &Store) -> crate::error::Result<()> {
    let live: std::collections::HashSet<_> = catalog.ids().into_iter().collect();
    let stored = store.all_summary_ids().await?;

    for id in &stored {
        if !live.contains(id) {
            store.delete_summary(id).await?;
            store.delete_info(id).await?;
        }
    }
    for id in &live {
        if let Some(summary) = catalog.find_by_id(id) {
            if store.needs_update(&summary).await? {
                store.upsert_summary(&summary).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_0005_cet_is_always_in_the_future() {
        let wait = duration_until_next_0005_cet();
        assert!(wait <= Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn catalog_sync_removes_stale_store_rows() {
        use crate::model::{TorrentStatus, TorrentSummary};
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.redb").to_str().unwrap()).unwrap();
        let catalog = Catalog::new(false);

        let stale = TorrentSummary {
            id: "Stale".into(),
            display_name: "stale".into(),
            size_bytes: 0,
            file_count: 0,
            status: TorrentStatus::Downloaded,
            added_at: chrono::Utc::now(),
            ended_at: None,
            hash: None,
            modified_unix: 0,
        };
        store.upsert_summary(&stale).await.unwrap();

        sync_once(&catalog, &store).await.unwrap();
        assert!(store.get_summary(&"Stale".into()).await.unwrap().is_none());
    }
}
