use chrono::Utc;
use dashmap::DashMap;

use crate::model::{FailedUnrestrict, UnrestrictedLink};

/// Key for the per-file resolved-URL cache: `torrentId:fileName` (spec.md §4.6 step 2).
pub fn file_cache_key(torrent_id: &str, file_name: &str) -> String {
    format!("{}:{}", torrent_id, file_name)
}

/// Multi-tier cache (spec.md §4.3 "LinkCaches"): a success cache of unrestricted URLs
/// keyed by the normalized restricted link, a negative cache of failed unrestrict
/// attempts keyed the same way, and a per-file cache keyed by `fileCacheKey`. All three
/// are concurrent maps; negative entries are immutable once set, the success cache is
/// compare-and-set on TTL expiry (spec.md §5).
pub struct LinkCaches {
    success: DashMap<String, UnrestrictedLink>,
    negative: DashMap<String, FailedUnrestrict>,
    per_file: DashMap<String, UnrestrictedLink>,
}

impl LinkCaches {
    pub fn new() -> Self {
        Self { success: DashMap::new(), negative: DashMap::new(), per_file: DashMap::new() }
    }

    /// Returns the cached link for `restricted_link` if present and not yet expired.
    pub fn get_success(&self, restricted_link: &str) -> Option<UnrestrictedLink> {
        match self.success.get(restricted_link) {
            Some(entry) if !entry.is_expired(Utc::now()) => Some(entry.value().clone()),
            _ => None,
        }
    }

    /// Compare-and-set on TTL expiry: only replaces an existing entry once it has
    /// expired, so a fresher concurrent writer doesn't get clobbered by a slower one
    /// that started first (spec.md §5).
    pub fn put_success(&self, restricted_link: &str, link: UnrestrictedLink) {
        let now = Utc::now();
        self.success
            .entry(restricted_link.to_string())
            .and_modify(|existing| {
                if existing.is_expired(now) {
                    *existing = link.clone();
                }
            })
            .or_insert(link);
    }

    pub fn get_negative(&self, restricted_link: &str) -> Option<FailedUnrestrict> {
        match self.negative.get(restricted_link) {
            Some(entry) if !entry.is_expired(Utc::now()) => Some(entry.value().clone()),
            _ => None,
        }
    }

    /// Negative entries are immutable once set (spec.md §5): a second failure for the
    /// same key before expiry is dropped rather than overwriting the recorded reason.
    pub fn put_negative(&self, restricted_link: &str, failure: FailedUnrestrict) {
        self.negative.entry(restricted_link.to_string()).or_insert(failure);
    }

    pub fn get_per_file(&self, key: &str) -> Option<UnrestrictedLink> {
        match self.per_file.get(key) {
            Some(entry) if !entry.is_expired(Utc::now()) => Some(entry.value().clone()),
            _ => None,
        }
    }

    pub fn put_per_file(&self, key: &str, link: UnrestrictedLink) {
        self.per_file.insert(key.to_string(), link);
    }

    /// Clears every entry for a given torrent id's per-file cache, used after id
    /// rewrites during repair and after token recovery (spec.md §4.8 "Token recovery":
    /// "clear the unrestrict cache (force re-resolution using the healed token)").
    pub fn clear_for_torrent(&self, torrent_id: &str) {
        let prefix = format!("{}:", torrent_id);
        self.per_file.retain(|k, _| !k.starts_with(&prefix));
    }

    /// Drops every success and per-file entry, forcing full re-resolution. Used by the
    /// token-recovery scheduler task once a previously expired token comes back.
    pub fn clear_all_success(&self) {
        self.success.clear();
        self.per_file.clear();
    }

    pub fn remove_negative(&self, restricted_link: &str) {
        self.negative.remove(restricted_link);
    }

    pub fn success_len(&self) -> usize {
        self.success.len()
    }

    pub fn negative_len(&self) -> usize {
        self.negative.len()
    }
}

impl Default for LinkCaches {
    fn default() -> Self {
        Self::new()
    }
}
