use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque upstream-assigned torrent id (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TorrentId(pub String);

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TorrentId {
    fn from(s: String) -> Self {
        TorrentId(s)
    }
}

impl From<&str> for TorrentId {
    fn from(s: &str) -> Self {
        TorrentId(s.to_string())
    }
}

impl AsRef<str> for TorrentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Status values a torrent can be in (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentStatus {
    Downloading,
    Queued,
    MagnetError,
    WaitingFilesSelection,
    Downloaded,
    Error,
    Dead,
    Virus,
    /// Catch-all for statuses the provider adds later; never silently dropped.
    Unknown,
}

impl TorrentStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "downloading" => TorrentStatus::Downloading,
            "queued" => TorrentStatus::Queued,
            "magnet_error" => TorrentStatus::MagnetError,
            "waiting_files_selection" => TorrentStatus::WaitingFilesSelection,
            "downloaded" => TorrentStatus::Downloaded,
            "error" => TorrentStatus::Error,
            "dead" => TorrentStatus::Dead,
            "virus" => TorrentStatus::Virus,
            _ => TorrentStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TorrentStatus::Downloading => "downloading",
            TorrentStatus::Queued => "queued",
            TorrentStatus::MagnetError => "magnet_error",
            TorrentStatus::WaitingFilesSelection => "waiting_files_selection",
            TorrentStatus::Downloaded => "downloaded",
            TorrentStatus::Error => "error",
            TorrentStatus::Dead => "dead",
            TorrentStatus::Virus => "virus",
            TorrentStatus::Unknown => "unknown",
        }
    }

    /// Statuses that repair scans re-validate (spec.md §4.7.A).
    pub fn is_repair_scan_candidate(&self) -> bool {
        matches!(
            self,
            TorrentStatus::Downloaded | TorrentStatus::Error | TorrentStatus::Virus | TorrentStatus::Dead
        )
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, TorrentStatus::Error | TorrentStatus::Dead | TorrentStatus::Virus | TorrentStatus::MagnetError)
    }
}

impl fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lightweight listing row (spec.md §3 "TorrentSummary").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentSummary {
    pub id: TorrentId,
    pub display_name: String,
    pub size_bytes: u64,
    pub file_count: u32,
    pub status: TorrentStatus,
    pub added_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hash: Option<String>,
    pub modified_unix: i64,
}

/// A single file inside a torrent (spec.md §3 "File").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentFile {
    /// 1-based (spec.md §3).
    pub file_id: u32,
    pub path: String,
    pub size_bytes: u64,
    pub selected: bool,
}

impl TorrentFile {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Full torrent detail, loaded on demand (spec.md §3 "TorrentInfo").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentInfo {
    pub id: TorrentId,
    pub display_name: String,
    pub size_bytes: u64,
    pub file_count: u32,
    pub status: TorrentStatus,
    pub added_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hash: Option<String>,
    pub modified_unix: i64,
    pub progress: u8,
    pub files: Vec<TorrentFile>,
    pub links: Vec<String>,
    /// Set during reinsertion (spec.md §3).
    pub original_id: Option<TorrentId>,
}

impl TorrentInfo {
    pub fn summary(&self) -> TorrentSummary {
        TorrentSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            size_bytes: self.size_bytes,
            file_count: self.file_count,
            status: self.status,
            added_at: self.added_at,
            ended_at: self.ended_at,
            hash: self.hash.clone(),
            modified_unix: self.modified_unix,
        }
    }

    /// True when the invariant "status=downloaded, progress=100 implies links non-empty
    /// or marked broken" is violated, i.e. this torrent needs repair (spec.md §3).
    pub fn is_broken(&self) -> bool {
        self.status == TorrentStatus::Downloaded && self.progress == 100 && self.links.is_empty()
    }

    /// Resolve the restricted link for a selected file, falling back to `links[0]`
    /// when the file's index is out of range (spec.md §3 "File").
    pub fn link_for_file(&self, file_id: u32) -> Option<&str> {
        let idx = (file_id as usize).checked_sub(1)?;
        self.links.get(idx).or_else(|| self.links.first()).map(|s| s.as_str())
    }

    pub fn find_file_by_name(&self, name: &str) -> Option<&TorrentFile> {
        self.files.iter().find(|f| f.selected && f.name() == name)
    }

    pub fn selected_video_files(&self) -> impl Iterator<Item = &TorrentFile> {
        self.files.iter().filter(|f| f.selected && crate::catalog::is_video_file(&f.path))
    }
}

/// A direct download URL record (spec.md §3 "UnrestrictedLink"). TTL = 24h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnrestrictedLink {
    pub download_url: String,
    pub filesize: u64,
    pub host: String,
    pub generated_at: DateTime<Utc>,
}

impl UnrestrictedLink {
    pub const TTL: chrono::Duration = chrono::Duration::hours(24);

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.generated_at) >= Self::TTL
    }
}

/// A negative-cache entry (spec.md §3 "FailedUnrestrict").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUnrestrict {
    pub error_message: String,
    pub error_code: i64,
    pub timestamp: DateTime<Utc>,
}

impl FailedUnrestrict {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match crate::error::negative_cache_ttl(self.error_code) {
            Some(ttl) => now.signed_duration_since(self.timestamp) >= chrono::Duration::from_std(ttl).unwrap(),
            None => true,
        }
    }
}

/// Persisted "needs work" entry (spec.md §3 "RepairEntry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairEntry {
    pub torrent_id: TorrentId,
    pub display_name: String,
    pub hash: Option<String>,
    pub status: TorrentStatus,
    pub progress: u8,
    pub reason: String,
    pub updated_at: DateTime<Utc>,
}

/// Fingerprint used to decide whether a full refresh is needed (spec.md §3
/// "LibraryState"). Two states are equal iff `total_count` and `first_torrent_id`
/// match — `last_updated` never participates (spec.md §8 property 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryState {
    pub total_count: u64,
    pub first_torrent_id: Option<TorrentId>,
    pub last_updated: DateTime<Utc>,
}

impl PartialEq for LibraryState {
    fn eq(&self, other: &Self) -> bool {
        self.total_count == other.total_count && self.first_torrent_id == other.first_torrent_id
    }
}
impl Eq for LibraryState {}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(links: Vec<&str>, progress: u8, status: TorrentStatus) -> TorrentInfo {
        TorrentInfo {
            id: "T1".into(),
            display_name: "X".into(),
            size_bytes: 0,
            file_count: 1,
            status,
            added_at: Utc::now(),
            ended_at: None,
            hash: Some("H".into()),
            modified_unix: 0,
            progress,
            files: vec![],
            links: links.into_iter().map(String::from).collect(),
            original_id: None,
        }
    }

    #[test]
    fn broken_invariant_requires_complete_and_empty_links() {
        assert!(info(vec![], 100, TorrentStatus::Downloaded).is_broken());
        assert!(!info(vec!["l"], 100, TorrentStatus::Downloaded).is_broken());
        assert!(!info(vec![], 50, TorrentStatus::Downloading).is_broken());
    }

    #[test]
    fn link_for_file_falls_back_to_first_link() {
        let i = info(vec!["l0", "l1"], 100, TorrentStatus::Downloaded);
        assert_eq!(i.link_for_file(1), Some("l0"));
        assert_eq!(i.link_for_file(2), Some("l1"));
        // out of range -> fallback to links[0]
        assert_eq!(i.link_for_file(99), Some("l0"));
    }

    #[test]
    fn library_state_equality_ignores_last_updated() {
        let a = LibraryState { total_count: 5, first_torrent_id: Some("a".into()), last_updated: Utc::now() };
        let b = LibraryState {
            total_count: 5,
            first_torrent_id: Some("a".into()),
            last_updated: Utc::now() - chrono::Duration::days(1),
        };
        assert_eq!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn unrestricted_link_ttl_is_24h() {
        let link = UnrestrictedLink {
            download_url: "u".into(),
            filesize: 1,
            host: "h".into(),
            generated_at: Utc::now() - chrono::Duration::hours(23),
        };
        assert!(!link.is_expired(Utc::now()));
        let link = UnrestrictedLink { generated_at: Utc::now() - chrono::Duration::hours(25), ..link };
        assert!(link.is_expired(Utc::now()));
    }
}
