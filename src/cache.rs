//! Bounded caches that keep repeated lookups off the expensive paths: the
//! safebrowsing verdict cache (size-capped, oldest-inserted eviction) and the
//! trusted-document cache (TTL-based). Neither cache performs I/O; payloads
//! are (de)serialized to JSON for an external key-value storage collaborator,
//! and a corrupt payload resets the cache instead of propagating an error.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::utils::fast_hash;

const DEFAULT_CACHE_SIZE: usize = 1000;
/// `cleanup` runs opportunistically every this many writes, so no background
/// timer is needed.
const CLEANUP_WRITE_INTERVAL: u32 = 20;

/// How long a user's "proceed anyway" decision suppresses re-blocking.
pub const TRUSTED_DOCUMENT_TTL: Duration = Duration::from_secs(40 * 60);

/// Verdict value marking a host as known-clean.
pub const SB_WHITELIST: &str = "whitelist";

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    value: String,
    /// Seconds since the unix epoch; `None` never expires within a session.
    expires: Option<u64>,
}

/// A string cache bounded both by entry count and, optionally, by entry age.
/// Eviction drops expired entries first, then the oldest-inserted entries
/// until the cache is back at half capacity.
#[derive(Debug, Serialize, Deserialize)]
pub struct BoundedCache {
    entries: HashMap<String, CacheEntry>,
    insertion_order: VecDeque<String>,
    max_size: usize,
    #[serde(skip)]
    writes: u32,
}

impl BoundedCache {
    pub fn new(max_size: usize) -> BoundedCache {
        BoundedCache {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_size,
            writes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_at(key, now_secs())
    }

    fn get_at(&self, key: &str, now: u64) -> Option<&str> {
        let entry = self.entries.get(key)?;
        if let Some(expires) = entry.expires {
            if now >= expires {
                return None;
            }
        }
        Some(&entry.value)
    }

    pub fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.set_at(key, value, ttl, now_secs());
    }

    fn set_at(&mut self, key: &str, value: &str, ttl: Option<Duration>, now: u64) {
        if self.entries.len() > self.max_size {
            self.cleanup_at(now);
        }

        let expires = ttl.map(|ttl| now + ttl.as_secs());
        if self
            .entries
            .insert(
                key.to_string(),
                CacheEntry {
                    value: value.to_string(),
                    expires,
                },
            )
            .is_none()
        {
            self.insertion_order.push_back(key.to_string());
        }

        self.writes += 1;
        if self.writes % CLEANUP_WRITE_INTERVAL == 0 {
            self.cleanup_at(now);
        }
    }

    /// Removes expired entries, then evicts oldest-inserted entries until
    /// the cache holds at most half its capacity. Cheap to call often.
    pub fn cleanup(&mut self) {
        self.cleanup_at(now_secs());
    }

    fn cleanup_at(&mut self, now: u64) {
        self.entries.retain(|_, entry| match entry.expires {
            Some(expires) => now < expires,
            None => true,
        });

        while self.entries.len() > self.max_size / 2 {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.insertion_order.retain(|key| self.entries.contains_key(key));
    }

    /// Serializes the cache for the storage collaborator.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::warn!("failed to serialize cache: {}", e);
            String::from("{}")
        })
    }

    /// Restores a cache from a persisted payload. A corrupt payload yields
    /// an empty cache rather than an error.
    pub fn from_json(payload: &str, max_size: usize) -> BoundedCache {
        match serde_json::from_str::<BoundedCache>(payload) {
            Ok(cache) => cache,
            Err(e) => {
                log::warn!("corrupt cache payload, resetting: {}", e);
                BoundedCache::new(max_size)
            }
        }
    }
}

/// Short uppercase-hex hash prefix of a candidate host, the key format of
/// the safebrowsing cache.
pub fn hash_prefix(host: &str) -> String {
    let digest = format!("{:016X}", fast_hash(host));
    digest[..8].to_string()
}

/// All lookup candidates for one host: the host itself plus every suffix
/// with at least two labels. IP addresses are returned unsplit.
pub fn extract_hosts(host: &str) -> Vec<String> {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return vec![host.to_string()];
    }

    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() <= 2 {
        return vec![host.to_string()];
    }
    (0..=parts.len() - 2)
        .map(|i| parts[i..].join("."))
        .collect()
}

/// Caches resolved safebrowsing verdicts by host-hash prefix, so repeated
/// navigations to the same host do not re-trigger remote hash lookups.
/// Entries never expire within a session; memory stays bounded through the
/// size cap with oldest-inserted eviction.
pub struct SafebrowsingCache {
    cache: BoundedCache,
}

impl Default for SafebrowsingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SafebrowsingCache {
    pub fn new() -> SafebrowsingCache {
        SafebrowsingCache::with_max_size(DEFAULT_CACHE_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> SafebrowsingCache {
        SafebrowsingCache {
            cache: BoundedCache::new(max_size),
        }
    }

    /// Records the resolved verdict for a host. Use [`SB_WHITELIST`] for
    /// known-clean hosts so the absence of a verdict stays distinguishable
    /// from a clean one.
    pub fn save_verdict(&mut self, host: &str, list_name: &str) {
        self.cache.set(&hash_prefix(host), list_name, None);
    }

    /// The cached verdict for a host or any of its parent hosts. `None`
    /// means no verdict yet: the caller may start an asynchronous lookup,
    /// never block. A whitelisted host reports `None` through
    /// [`SafebrowsingCache::lookup`]'s companion [`SafebrowsingCache::blocked_list`].
    pub fn lookup(&self, host: &str) -> Option<&str> {
        for candidate in extract_hosts(host) {
            if let Some(verdict) = self.cache.get(&hash_prefix(&candidate)) {
                return Some(verdict);
            }
        }
        None
    }

    /// The blocklist name a host should be blocked under, if any. Collapses
    /// the whitelist sentinel to `None`.
    pub fn blocked_list(&self, host: &str) -> Option<&str> {
        match self.lookup(host) {
            Some(SB_WHITELIST) => None,
            verdict => verdict,
        }
    }

    pub fn cleanup(&mut self) {
        self.cache.cleanup();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn to_json(&self) -> String {
        self.cache.to_json()
    }

    pub fn from_json(payload: &str) -> SafebrowsingCache {
        SafebrowsingCache {
            cache: BoundedCache::from_json(payload, DEFAULT_CACHE_SIZE),
        }
    }
}

/// Remembers the hosts a user chose to proceed to despite a block page, so
/// the override holds for a bounded time window without being persisted
/// forever.
pub struct TrustedDocumentCache {
    cache: BoundedCache,
    ttl: Duration,
}

impl Default for TrustedDocumentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustedDocumentCache {
    pub fn new() -> TrustedDocumentCache {
        TrustedDocumentCache::with_ttl(TRUSTED_DOCUMENT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> TrustedDocumentCache {
        TrustedDocumentCache {
            cache: BoundedCache::new(DEFAULT_CACHE_SIZE),
            ttl,
        }
    }

    pub fn trust(&mut self, host: &str) {
        self.cache.set(host, "1", Some(self.ttl));
    }

    /// Whether the host is still within its trust window; expired entries
    /// count as absent.
    pub fn is_trusted(&self, host: &str) -> bool {
        self.cache.get(host).is_some()
    }

    pub fn cleanup(&mut self) {
        self.cache.cleanup();
    }

    pub fn to_json(&self) -> String {
        self.cache.to_json()
    }

    pub fn from_json(payload: &str) -> TrustedDocumentCache {
        TrustedDocumentCache {
            cache: BoundedCache::from_json(payload, DEFAULT_CACHE_SIZE),
            ttl: TRUSTED_DOCUMENT_TTL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_roundtrip() {
        let mut cache = BoundedCache::new(10);
        cache.set("key", "value", None);
        assert_eq!(cache.get("key"), Some("value"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn expired_entries_are_absent() {
        let mut cache = BoundedCache::new(10);
        cache.set_at("key", "value", Some(Duration::from_secs(60)), 1000);
        assert_eq!(cache.get_at("key", 1030), Some("value"));
        assert_eq!(cache.get_at("key", 1060), None);
        assert_eq!(cache.get_at("key", 2000), None);
    }

    #[test]
    fn cleanup_never_leaves_more_than_cap() {
        let mut cache = BoundedCache::new(10);
        for i in 0..50 {
            cache.set_at(&format!("key{}", i), "v", None, 1000);
        }
        cache.cleanup_at(1000);
        assert!(cache.len() <= 10);
    }

    #[test]
    fn eviction_is_oldest_inserted_first() {
        let mut cache = BoundedCache::new(4);
        for i in 0..5 {
            cache.set_at(&format!("key{}", i), "v", None, 1000);
        }
        cache.cleanup_at(1000);
        // the newest entries survive
        assert_eq!(cache.get_at("key4", 1000), Some("v"));
        assert_eq!(cache.get_at("key0", 1000), None);
    }

    #[test]
    fn cleanup_purges_expired_before_evicting() {
        let mut cache = BoundedCache::new(10);
        cache.set_at("stale", "v", Some(Duration::from_secs(1)), 1000);
        cache.set_at("fresh", "v", None, 1000);
        cache.cleanup_at(2000);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at("fresh", 2000), Some("v"));
    }

    #[test]
    fn corrupt_payload_resets_to_empty() {
        let cache = BoundedCache::from_json("{not json", 10);
        assert!(cache.is_empty());
    }

    #[test]
    fn serialization_roundtrip() {
        let mut cache = BoundedCache::new(10);
        cache.set("key", "value", None);
        let restored = BoundedCache::from_json(&cache.to_json(), 10);
        assert_eq!(restored.get("key"), Some("value"));
    }

    #[test]
    fn extract_hosts_returns_suffixes() {
        assert_eq!(
            extract_hosts("a.b.example.com"),
            vec!["a.b.example.com", "b.example.com", "example.com"]
        );
        assert_eq!(extract_hosts("example.com"), vec!["example.com"]);
        assert_eq!(extract_hosts("127.0.0.1"), vec!["127.0.0.1"]);
    }

    #[test]
    fn safebrowsing_verdicts_cover_subdomains() {
        let mut cache = SafebrowsingCache::new();
        cache.save_verdict("malware.example.com", "malware-shavar");
        assert_eq!(
            cache.blocked_list("sub.malware.example.com"),
            Some("malware-shavar")
        );
        assert_eq!(cache.blocked_list("other.org"), None);
    }

    #[test]
    fn safebrowsing_whitelist_collapses_to_clean() {
        let mut cache = SafebrowsingCache::new();
        cache.save_verdict("clean.example.com", SB_WHITELIST);
        assert_eq!(cache.lookup("clean.example.com"), Some(SB_WHITELIST));
        assert_eq!(cache.blocked_list("clean.example.com"), None);
    }

    #[test]
    fn safebrowsing_cache_is_bounded() {
        let mut cache = SafebrowsingCache::with_max_size(8);
        for i in 0..100 {
            cache.save_verdict(&format!("host{}.example.com", i), SB_WHITELIST);
        }
        cache.cleanup();
        assert!(cache.len() <= 8);
    }

    #[test]
    fn trusted_document_expires_after_window() {
        let mut cache = TrustedDocumentCache::with_ttl(Duration::from_secs(60));
        cache.cache.set_at("example.com", "1", Some(Duration::from_secs(60)), 1000);
        assert!(cache.cache.get_at("example.com", 1030).is_some());
        assert!(cache.cache.get_at("example.com", 1061).is_none());
    }

    #[test]
    fn trusted_document_basic_flow() {
        let mut cache = TrustedDocumentCache::new();
        assert!(!cache.is_trusted("example.com"));
        cache.trust("example.com");
        assert!(cache.is_trusted("example.com"));
    }
}
