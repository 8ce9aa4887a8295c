use thiserror::Error;

/// Error codes the upstream provider is known to return (spec.md §6).
pub const CODE_SLOW_DOWN: i64 = 5;
pub const CODE_UNKNOWN_RESOURCE: i64 = 7;
pub const CODE_HOSTER_UNAVAILABLE: i64 = 19;
pub const CODE_UNAVAILABLE_FILE: i64 = 21;
pub const CODE_TRAFFIC_EXHAUSTED: i64 = 23;
pub const CODE_PERMISSION_DENIED: i64 = 27;
pub const CODE_HOSTER_NOT_SUPPORTED: i64 = 28;
pub const CODE_TOO_MANY_REQUESTS: i64 = 34;
pub const CODE_INFRINGING_FILE: i64 = 35;
pub const CODE_FAIR_USAGE: i64 = 36;
pub const CODE_TOO_MANY_ACTIVE_DOWNLOADS: i64 = 509;

/// Codes RateGate retries with jittered backoff rather than handing to the caller.
/// Union of the narrow {34, 36} and broad {5, 34, 36} retry sets spec.md §9's Open
/// Questions describe — see DESIGN.md for why the union was chosen as authoritative.
pub const RATE_GATE_RETRY_CODES: [i64; 3] = [CODE_SLOW_DOWN, CODE_TOO_MANY_REQUESTS, CODE_FAIR_USAGE];

/// TTL for a code-dependent negative-cache entry, or `None` if the code isn't cacheable.
pub fn negative_cache_ttl(code: i64) -> Option<std::time::Duration> {
    use std::time::Duration;
    match code {
        CODE_HOSTER_UNAVAILABLE => Some(Duration::from_secs(15 * 60)),
        CODE_UNAVAILABLE_FILE => Some(Duration::from_secs(60 * 60)),
        CODE_TRAFFIC_EXHAUSTED => Some(Duration::from_secs(30 * 60)),
        CODE_PERMISSION_DENIED => Some(Duration::from_secs(60 * 60)),
        CODE_HOSTER_NOT_SUPPORTED => Some(Duration::from_secs(60 * 60)),
        CODE_TOO_MANY_REQUESTS => Some(Duration::from_secs(10 * 60)),
        _ => None,
    }
}

/// True if the code/message combination signals a broken restricted link (spec.md §4.6).
pub fn is_broken_link_signal(code: Option<i64>, message: &str) -> bool {
    if matches!(
        code,
        Some(CODE_HOSTER_UNAVAILABLE) | Some(CODE_UNAVAILABLE_FILE) | Some(CODE_HOSTER_NOT_SUPPORTED)
    ) {
        return true;
    }
    let lower = message.to_lowercase();
    const SIGNALS: [&str; 7] = [
        "no links available",
        "empty download link",
        "unavailable_file",
        "hoster_unavailable",
        "hoster_not_supported",
        "link expired",
        "file removed",
    ];
    SIGNALS.iter().any(|s| lower.contains(s))
}

/// The `{error, error_code}` body the upstream returns on non-2xx responses.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(rename = "error_code", default)]
    pub error_code: Option<i64>,
}

/// Sum-typed error surface (spec.md §7, §9 "Polymorphism"): callers pattern-match on
/// this instead of string-matching upstream messages.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("upstream rejected request: {message} (code {code:?})")]
    Upstream { message: String, code: Option<i64> },

    #[error("torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("no links available for torrent {0}")]
    NoLinks(String),

    #[error("empty download link for torrent {0}")]
    EmptyDownloadLink(String),

    #[error("broken link: {0}")]
    BrokenLink(Box<CoreError>),

    #[error("cacheable failure (code {code}): {message}")]
    Cacheable { code: i64, message: String },

    #[error("all API tokens are expired")]
    AllTokensExpired,

    #[error("transient network error: {0}")]
    Transient(#[from] reqwest::Error),

    #[error("maintenance page returned by upstream")]
    MaintenancePage,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("repair failed for {torrent_id}: {reason}")]
    RepairFailed { torrent_id: String, reason: String },

    #[error("storage error: {0}")]
    Store(#[from] redb::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn code(&self) -> Option<i64> {
        match self {
            CoreError::Upstream { code, .. } => *code,
            CoreError::Cacheable { code, .. } => Some(*code),
            CoreError::BrokenLink(inner) => inner.code(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::TorrentNotFound(_)) || self.code() == Some(CODE_UNKNOWN_RESOURCE)
    }

    pub fn is_broken_link(&self) -> bool {
        matches!(self, CoreError::BrokenLink(_))
            || matches!(self, CoreError::NoLinks(_) | CoreError::EmptyDownloadLink(_))
            || is_broken_link_signal(self.code(), &self.to_string())
    }

    /// Classify an upstream error body, wrapping it in `BrokenLink`/`Cacheable`/`Upstream`
    /// per spec.md §4.3's Unrestrict semantics and §4.6's broken-link classification.
    pub fn from_body(status: reqwest::StatusCode, body: &UpstreamErrorBody) -> CoreError {
        if status == reqwest::StatusCode::NO_CONTENT || body.error_code == Some(CODE_UNKNOWN_RESOURCE) {
            return CoreError::TorrentNotFound(body.error.clone());
        }
        let base = if let Some(code) = body.error_code {
            if negative_cache_ttl(code).is_some() {
                CoreError::Cacheable { code, message: body.error.clone() }
            } else {
                CoreError::Upstream { message: body.error.clone(), code: body.error_code }
            }
        } else {
            CoreError::Upstream { message: body.error.clone(), code: None }
        };
        if is_broken_link_signal(body.error_code, &body.error) {
            CoreError::BrokenLink(Box::new(base))
        } else {
            base
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
