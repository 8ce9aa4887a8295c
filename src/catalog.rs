use dashmap::DashMap;
use tracing::info;

use crate::model::{LibraryState, TorrentId, TorrentStatus, TorrentSummary};

const SANITIZE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

pub const VIDEO_EXTENSIONS: &[&str] =
    &["mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "3gp", "ogv", "ts", "m2ts", "mts"];
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "aac", "ogg", "wav", "m4a", "wma", "opus"];
pub const BOOK_EXTENSIONS: &[&str] = &["epub", "mobi", "azw3", "pdf", "cbz", "cbr"];
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2"];
pub const OTHER_EXTENSIONS: &[&str] = &["nfo", "srt", "sub", "idx"];

/// Closed, configurable superset of extensions directory-name stripping recognizes
/// (spec.md §4.5, §9 Open Question 3). Callers who need a different set can build a
/// custom `Catalog` variant; this crate ships the enumerated union.
fn is_recognized_extension(ext: &str) -> bool {
    let ext = ext.to_ascii_lowercase();
    VIDEO_EXTENSIONS.contains(&ext.as_str())
        || AUDIO_EXTENSIONS.contains(&ext.as_str())
        || BOOK_EXTENSIONS.contains(&ext.as_str())
        || ARCHIVE_EXTENSIONS.contains(&ext.as_str())
        || OTHER_EXTENSIONS.contains(&ext.as_str())
}

pub fn is_video_file(path: &str) -> bool {
    match path.rsplit('.').next() {
        Some(ext) if ext.len() < path.len() => VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        _ => false,
    }
}

/// Replaces `/ \ : * ? " < > |` with `_` (spec.md §4.5).
pub fn sanitize_filename(name: &str) -> String {
    name.chars().map(|c| if SANITIZE_CHARS.contains(&c) { '_' } else { c }).collect()
}

/// `GetDirectoryName`: sanitize, then strip a trailing recognized extension unless
/// `retain_extension` is set (spec.md §4.5, property in §8: `GetDirectoryName(Sanitize(x))
/// == GetDirectoryName(x)` for every x in the sanitization character class).
pub fn directory_name(name: &str, retain_extension: bool) -> String {
    let sanitized = sanitize_filename(name);
    if retain_extension {
        return sanitized;
    }
    match sanitized.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && is_recognized_extension(ext) => stem.to_string(),
        _ => sanitized,
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusHistogram {
    pub downloading: u64,
    pub queued: u64,
    pub magnet_error: u64,
    pub waiting_files_selection: u64,
    pub downloaded: u64,
    pub error: u64,
    pub dead: u64,
    pub virus: u64,
    pub unknown: u64,
}

impl StatusHistogram {
    fn record(&mut self, status: TorrentStatus) {
        match status {
            TorrentStatus::Downloading => self.downloading += 1,
            TorrentStatus::Queued => self.queued += 1,
            TorrentStatus::MagnetError => self.magnet_error += 1,
            TorrentStatus::WaitingFilesSelection => self.waiting_files_selection += 1,
            TorrentStatus::Downloaded => self.downloaded += 1,
            TorrentStatus::Error => self.error += 1,
            TorrentStatus::Dead => self.dead += 1,
            TorrentStatus::Virus => self.virus += 1,
            TorrentStatus::Unknown => self.unknown += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogStats {
    pub histogram: StatusHistogram,
    pub total_bytes: u64,
    pub total_count: u64,
}

/// In-memory directory map keyed by sanitized torrent name, plus an id index
/// (spec.md §4.5). The store's in-memory map is authoritative for resolution; this is
/// it. Both maps use `dashmap` for lock-free-ish concurrent reads and per-shard write
/// locking, the closest fit in the retrieved pack for this shape (teacher never needed
/// a concurrent map since it was single-threaded per request).
pub struct Catalog {
    by_name: DashMap<String, TorrentSummary>,
    by_id: DashMap<TorrentId, TorrentSummary>,
    retain_folder_extension: bool,
}

impl Catalog {
    pub fn new(retain_folder_extension: bool) -> Self {
        Self { by_name: DashMap::new(), by_id: DashMap::new(), retain_folder_extension }
    }

    pub fn directory_name_for(&self, display_name: &str) -> String {
        directory_name(display_name, self.retain_folder_extension)
    }

    /// Warm start: replace the whole map with `items` (spec.md §4.5 `Seed`).
    pub fn seed(&self, items: Vec<TorrentSummary>) {
        self.by_name.clear();
        self.by_id.clear();
        for item in items {
            self.insert(item);
        }
    }

    fn insert(&self, item: TorrentSummary) {
        let key = self.directory_name_for(&item.display_name);
        self.by_id.insert(item.id.clone(), item.clone());
        self.by_name.insert(key, item);
    }

    pub fn upsert(&self, item: TorrentSummary) {
        self.insert(item);
    }

    /// Removes `id` from both maps, returning the removed summary if present. Also
    /// removes the stale `byName` entry if its id still matches (spec.md §8 property 3:
    /// a TorrentNotFound id disappears from Catalog atomically).
    pub fn delete_by_id(&self, id: &TorrentId) -> Option<TorrentSummary> {
        let removed = self.by_id.remove(id).map(|(_, v)| v);
        if let Some(summary) = &removed {
            let key = self.directory_name_for(&summary.display_name);
            self.by_name.remove_if(&key, |_, v| &v.id == id);
        }
        removed
    }

    pub fn find_by_name(&self, name: &str) -> Option<TorrentSummary> {
        let key = self.directory_name_for(name);
        self.by_name.get(&key).map(|e| e.value().clone())
    }

    pub fn find_by_id(&self, id: &TorrentId) -> Option<TorrentSummary> {
        self.by_id.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of every id currently held, taken before any range operation so
    /// iteration never observes a half-applied refresh beyond a single key's swap
    /// (spec.md §4.5, §8 property 7).
    pub fn ids(&self) -> Vec<TorrentId> {
        self.by_id.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<TorrentSummary> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// `total_count` + the first id in insertion-independent, stable order: the
    /// smallest id, so two catalogs holding the same set fingerprint identically
    /// regardless of refresh ordering (spec.md §4.5 `Fingerprint`).
    pub fn fingerprint(&self) -> LibraryState {
        let mut ids: Vec<TorrentId> = self.ids();
        ids.sort();
        LibraryState {
            total_count: ids.len() as u64,
            first_torrent_id: ids.into_iter().next(),
            last_updated: chrono::Utc::now(),
        }
    }

    pub fn stats(&self) -> CatalogStats {
        let mut histogram = StatusHistogram::default();
        let mut total_bytes = 0u64;
        let mut total_count = 0u64;
        for entry in self.by_id.iter() {
            histogram.record(entry.value().status);
            total_bytes += entry.value().size_bytes;
            total_count += 1;
        }
        CatalogStats { histogram, total_bytes, total_count }
    }

    /// Replaces the whole catalog with `fresh`, logging the ids that disappeared
    /// (spec.md §8 property 5, example 5: "a log line names the first three
    /// removals"). Returns `(added, removed)` ids for callers driving
    /// `OnCatalogChange`.
    pub fn reconcile(&self, fresh: Vec<TorrentSummary>) -> (Vec<TorrentId>, Vec<TorrentId>) {
        let fresh_ids: std::collections::HashSet<TorrentId> = fresh.iter().map(|s| s.id.clone()).collect();
        let previous_ids: std::collections::HashSet<TorrentId> = self.ids().into_iter().collect();

        let removed: Vec<TorrentId> = previous_ids.difference(&fresh_ids).cloned().collect();
        let added: Vec<TorrentId> = fresh_ids.difference(&previous_ids).cloned().collect();

        if !removed.is_empty() {
            let sample: Vec<String> = removed.iter().take(3).map(|i| i.0.clone()).collect();
            info!(count = removed.len(), sample = ?sample, "catalog shrink: removing stale torrents");
        }

        for id in &removed {
            self.delete_by_id(id);
        }
        for item in fresh {
            self.upsert(item);
        }
        (added, removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn summary(id: &str, name: &str) -> TorrentSummary {
        TorrentSummary {
            id: id.into(),
            display_name: name.to_string(),
            size_bytes: 100,
            file_count: 1,
            status: TorrentStatus::Downloaded,
            added_at: Utc::now(),
            ended_at: None,
            hash: None,
            modified_unix: 0,
        }
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename(r#"a/b\c:d*e?f"g<h>i|j"#), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn directory_name_strips_recognized_extension_unless_retained() {
        assert_eq!(directory_name("Movie.2020.1080p.mkv", false), "Movie.2020.1080p");
        assert_eq!(directory_name("Movie.2020.1080p.mkv", true), "Movie.2020.1080p.mkv");
        assert_eq!(directory_name("Some.Folder.Name", false), "Some.Folder.Name");
    }

    #[test]
    fn directory_name_is_stable_under_sanitization() {
        let x = r#"Weird:Name/With*Bad?Chars.mkv"#;
        let sanitized_then = directory_name(&sanitize_filename(x), false);
        let direct = directory_name(x, false);
        assert_eq!(sanitized_then, direct);
    }

    #[test]
    fn is_video_file_matches_known_extensions() {
        assert!(is_video_file("/a/b/Movie.mkv"));
        assert!(!is_video_file("/a/b/readme.txt"));
        assert!(!is_video_file("noextension"));
    }

    #[test]
    fn seed_then_find_by_name_and_id_round_trip() {
        let cat = Catalog::new(false);
        cat.seed(vec![summary("T1", "Show.S01E01.mkv")]);
        assert!(cat.find_by_name("Show.S01E01").is_some());
        assert!(cat.find_by_id(&"T1".into()).is_some());
    }

    #[test]
    fn delete_by_id_removes_from_both_maps() {
        let cat = Catalog::new(false);
        cat.seed(vec![summary("T1", "Show.S01E01.mkv")]);
        cat.delete_by_id(&"T1".into());
        assert!(cat.find_by_name("Show.S01E01").is_none());
        assert!(cat.find_by_id(&"T1".into()).is_none());
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let a = Catalog::new(false);
        a.seed(vec![summary("T2", "b"), summary("T1", "a")]);
        let b = Catalog::new(false);
        b.seed(vec![summary("T1", "a"), summary("T2", "b")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn reconcile_reports_and_applies_added_and_removed() {
        let cat = Catalog::new(false);
        cat.seed(vec![summary("T1", "a"), summary("T2", "b")]);
        let (added, removed) = cat.reconcile(vec![summary("T2", "b"), summary("T3", "c")]);
        assert_eq!(added, vec!["T3".into()]);
        assert_eq!(removed, vec!["T1".into()]);
        assert_eq!(cat.len(), 2);
    }

    #[test]
    fn stats_aggregates_bytes_and_status_histogram() {
        let cat = Catalog::new(false);
        cat.seed(vec![summary("T1", "a"), summary("T2", "b")]);
        let stats = cat.stats();
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.total_bytes, 200);
        assert_eq!(stats.histogram.downloaded, 2);
    }
}
