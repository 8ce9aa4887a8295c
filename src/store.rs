use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::model::{RepairEntry, TorrentId, TorrentInfo, TorrentSummary};

const SUMMARIES: TableDefinition<&str, &[u8]> = TableDefinition::new("summaries");
const INFO: TableDefinition<&str, &[u8]> = TableDefinition::new("info");
const REPAIR: TableDefinition<&str, &[u8]> = TableDefinition::new("repair");
const LAST_CHECKED: TableDefinition<&str, i64> = TableDefinition::new("last_checked");

const BUSY_MAX_ATTEMPTS: usize = 8;
const BUSY_MAX_BACKOFF_MS: u64 = 250;

fn busy_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(8))
        .with_max_delay(Duration::from_millis(BUSY_MAX_BACKOFF_MS))
        .with_max_times(BUSY_MAX_ATTEMPTS - 1)
}

/// Retries `op` with exponential backoff capped at 250ms over 8 attempts, the policy
/// spec.md §4.4 calls for on transient "busy" errors, via `backon`. redb doesn't
/// distinguish a dedicated busy variant the way sqlite does, so any `redb::Error` is
/// treated as potentially transient here and retried; a persistent failure still
/// surfaces after the last attempt.
async fn with_busy_retry<T, F>(mut op: F) -> redb::Result<T>
where
    F: FnMut() -> redb::Result<T>,
{
    (|| async { op() })
        .retry(busy_backoff())
        .notify(|err: &redb::Error, dur: Duration| {
            warn!(%err, ?dur, "store operation failed, retrying");
        })
        .await
}

/// Persistent key/value store over `redb` (spec.md §4.4): three logical tables
/// (summaries, info, repair) and a secondary last-checked table. Never the source of
/// truth for resolution — the Catalog's in-memory map is authoritative; this is for
/// warm-start and enrichment.
pub struct Store {
    db: Database,
}

impl Store {
    /// Opens (creating if absent) the database at `path`, compacting any write-ahead
    /// log left from a previous run (spec.md §4.4 "On open, a checkpoint compacts...").
    pub fn open(path: &str) -> Result<Self> {
        let mut db = Database::create(path).map_err(|e| CoreError::Config(e.to_string()))?;
        if let Err(e) = db.compact() {
            warn!(%e, "store compaction on open failed, continuing with uncompacted database");
        }
        {
            let txn = db.begin_write().map_err(CoreError::Store)?;
            txn.open_table(SUMMARIES).map_err(CoreError::Store)?;
            txn.open_table(INFO).map_err(CoreError::Store)?;
            txn.open_table(REPAIR).map_err(CoreError::Store)?;
            txn.open_table(LAST_CHECKED).map_err(CoreError::Store)?;
            txn.commit().map_err(CoreError::Store)?;
        }
        info!(%path, "store opened");
        Ok(Self { db })
    }

    /// Final checkpoint and optimize run on shutdown (spec.md §4.4).
    pub fn close(mut self) -> Result<()> {
        self.db.compact().map_err(CoreError::Store)?;
        Ok(())
    }

    fn key_for(summary: &TorrentSummary) -> String {
        summary.id.0.clone()
    }

    pub async fn upsert_summary(&self, summary: &TorrentSummary) -> Result<()> {
        let bytes = serde_json::to_vec(summary).map_err(CoreError::Serde)?;
        let key = Self::key_for(summary);
        with_busy_retry(|| {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(SUMMARIES)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(CoreError::Store)
    }

    /// `BulkUpsertSummaries`: a single transaction for the whole batch; partial
    /// failure rolls back (spec.md §4.4). `on_progress(done, total)` is invoked after
    /// each row is staged, before the commit.
    pub async fn bulk_upsert_summaries<P>(&self, items: &[TorrentSummary], mut on_progress: P) -> Result<()>
    where
        P: FnMut(usize, usize),
    {
        let total = items.len();
        let encoded: Vec<(String, Vec<u8>)> = items
            .iter()
            .map(|s| Ok((Self::key_for(s), serde_json::to_vec(s).map_err(CoreError::Serde)?)))
            .collect::<Result<Vec<_>>>()?;

        with_busy_retry(|| {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(SUMMARIES)?;
                for (i, (key, bytes)) in encoded.iter().enumerate() {
                    table.insert(key.as_str(), bytes.as_slice())?;
                    on_progress(i + 1, total);
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(CoreError::Store)
    }

    pub async fn get_summary(&self, id: &TorrentId) -> Result<Option<TorrentSummary>> {
        let id = id.0.clone();
        let bytes: Option<Vec<u8>> = with_busy_retry(|| {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(SUMMARIES)?;
            Ok(table.get(id.as_str())?.map(|v| v.value().to_vec()))
        })
        .await
        .map_err(CoreError::Store)?;
        bytes.map(|b| serde_json::from_slice(&b).map_err(CoreError::Serde)).transpose()
    }

    pub async fn delete_summary(&self, id: &TorrentId) -> Result<()> {
        let id = id.0.clone();
        with_busy_retry(|| {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(SUMMARIES)?;
                table.remove(id.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(CoreError::Store)
    }

    /// True when the stored row is missing, lacks a hash, or differs in
    /// `{displayName, sizeBytes, status, fileCount}` (spec.md §4.4 `NeedsUpdate`).
    pub async fn needs_update(&self, summary: &TorrentSummary) -> Result<bool> {
        match self.get_summary(&summary.id).await? {
            None => Ok(true),
            Some(stored) => Ok(stored.hash.is_none()
                || stored.display_name != summary.display_name
                || stored.size_bytes != summary.size_bytes
                || stored.status != summary.status
                || stored.file_count != summary.file_count),
        }
    }

    pub async fn upsert_info(&self, info: &TorrentInfo) -> Result<()> {
        let bytes = serde_json::to_vec(info).map_err(CoreError::Serde)?;
        let key = info.id.0.clone();
        with_busy_retry(|| {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(INFO)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(CoreError::Store)
    }

    pub async fn get_info(&self, id: &TorrentId) -> Result<Option<TorrentInfo>> {
        let id = id.0.clone();
        let bytes: Option<Vec<u8>> = with_busy_retry(|| {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(INFO)?;
            Ok(table.get(id.as_str())?.map(|v| v.value().to_vec()))
        })
        .await
        .map_err(CoreError::Store)?;
        bytes.map(|b| serde_json::from_slice(&b).map_err(CoreError::Serde)).transpose()
    }

    pub async fn delete_info(&self, id: &TorrentId) -> Result<()> {
        let id = id.0.clone();
        with_busy_retry(|| {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(INFO)?;
                table.remove(id.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(CoreError::Store)
    }

    pub async fn upsert_repair_entry(&self, entry: &RepairEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry).map_err(CoreError::Serde)?;
        let key = entry.torrent_id.0.clone();
        with_busy_retry(|| {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(REPAIR)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(CoreError::Store)
    }

    pub async fn delete_repair_entry(&self, id: &TorrentId) -> Result<()> {
        let id = id.0.clone();
        with_busy_retry(|| {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(REPAIR)?;
                table.remove(id.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(CoreError::Store)
    }

    pub async fn list_repair_entries(&self) -> Result<Vec<RepairEntry>> {
        let rows: Vec<Vec<u8>> = with_busy_retry(|| {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(REPAIR)?;
            let mut out = Vec::new();
            for row in table.iter()? {
                let (_, v) = row?;
                out.push(v.value().to_vec());
            }
            Ok(out)
        })
        .await
        .map_err(CoreError::Store)?;
        rows.into_iter().map(|b| serde_json::from_slice(&b).map_err(CoreError::Serde)).collect()
    }

    /// Every id currently present in the summaries table (used by the catalog-sync
    /// scheduler task to reconcile against the live id set, spec.md §4.8).
    pub async fn all_summary_ids(&self) -> Result<Vec<TorrentId>> {
        with_busy_retry(|| {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(SUMMARIES)?;
            let mut out = Vec::new();
            for row in table.iter()? {
                let (k, _) = row?;
                out.push(TorrentId(k.value().to_string()));
            }
            Ok(out)
        })
        .await
        .map_err(CoreError::Store)
    }

    pub async fn set_last_checked(&self, id: &TorrentId, unix_ts: i64) -> Result<()> {
        let id = id.0.clone();
        with_busy_retry(|| {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(LAST_CHECKED)?;
                table.insert(id.as_str(), unix_ts)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
        .map_err(CoreError::Store)
    }

    pub async fn get_last_checked(&self, id: &TorrentId) -> Result<Option<i64>> {
        let id = id.0.clone();
        with_busy_retry(|| {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(LAST_CHECKED)?;
            Ok(table.get(id.as_str())?.map(|v| v.value()))
        })
        .await
        .map_err(CoreError::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TorrentStatus;
    use chrono::Utc;

    fn summary(id: &str, name: &str) -> TorrentSummary {
        TorrentSummary {
            id: id.into(),
            display_name: name.to_string(),
            size_bytes: 10,
            file_count: 1,
            status: TorrentStatus::Downloaded,
            added_at: Utc::now(),
            ended_at: None,
            hash: Some("h".into()),
            modified_unix: 0,
        }
    }

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_then_get_summary_round_trips() {
        let (store, _dir) = temp_store();
        store.upsert_summary(&summary("T1", "a")).await.unwrap();
        let got = store.get_summary(&"T1".into()).await.unwrap().unwrap();
        assert_eq!(got.display_name, "a");
    }

    #[tokio::test]
    async fn needs_update_true_when_missing_or_changed() {
        let (store, _dir) = temp_store();
        assert!(store.needs_update(&summary("T1", "a")).await.unwrap());
        store.upsert_summary(&summary("T1", "a")).await.unwrap();
        assert!(!store.needs_update(&summary("T1", "a")).await.unwrap());
        assert!(store.needs_update(&summary("T1", "b")).await.unwrap());
    }

    #[tokio::test]
    async fn bulk_upsert_writes_all_rows_in_one_transaction() {
        let (store, _dir) = temp_store();
        let items = vec![summary("T1", "a"), summary("T2", "b")];
        let mut progressed = 0;
        store.bulk_upsert_summaries(&items, |done, _total| progressed = done).await.unwrap();
        assert_eq!(progressed, 2);
        assert!(store.get_summary(&"T1".into()).await.unwrap().is_some());
        assert!(store.get_summary(&"T2".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_summary_removes_row() {
        let (store, _dir) = temp_store();
        store.upsert_summary(&summary("T1", "a")).await.unwrap();
        store.delete_summary(&"T1".into()).await.unwrap();
        assert!(store.get_summary(&"T1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repair_entries_round_trip_and_list() {
        let (store, _dir) = temp_store();
        let entry = RepairEntry {
            torrent_id: "T1".into(),
            display_name: "a".into(),
            hash: Some("h".into()),
            status: TorrentStatus::Error,
            progress: 0,
            reason: "broken".into(),
            updated_at: Utc::now(),
        };
        store.upsert_repair_entry(&entry).await.unwrap();
        let rows = store.list_repair_entries().await.unwrap();
        assert_eq!(rows.len(), 1);
        store.delete_repair_entry(&"T1".into()).await.unwrap();
        assert!(store.list_repair_entries().await.unwrap().is_empty());
    }
}
