//! Token-indexed storage for network filters. Given a request, only a small
//! candidate set of rules needs full evaluation instead of scanning the whole
//! corpus: rules are bucketed under one of their pattern tokens, requests
//! probe the buckets of their own tokens. Rules with no usable token live in
//! the fallback bucket, which every lookup scans.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::filters::network::NetworkFilter;
use crate::request::Request;
use crate::utils::{fast_hash, Hash};

/// Key of the bucket holding rules with no usable token.
const FALLBACK_BUCKET: Hash = 0;

/// Tokens that appear in nearly every URL; only picked as a bucket key when a
/// rule has nothing rarer to offer.
static COMMON_TOKENS: Lazy<Vec<Hash>> = Lazy::new(|| {
    let mut tokens: Vec<Hash> = ["http", "https", "www", "com"]
        .iter()
        .map(|t| fast_hash(t))
        .collect();
    tokens.sort_unstable();
    tokens
});

const COMMON_TOKEN_PENALTY: u32 = 1 << 30;

#[derive(Clone)]
pub(crate) struct StoredFilter {
    /// Monotonic insertion sequence; results are returned in this order so
    /// that downstream precedence resolution is deterministic.
    pub order: usize,
    pub filter: Arc<NetworkFilter>,
}

/// An incremental token-bucketed index over network filters.
pub struct NetworkFilterList {
    filter_map: HashMap<Hash, Vec<StoredFilter>>,
    /// How many rules were bucketed under each token so far. Kept
    /// approximate: counts are not decremented on removal.
    histogram: HashMap<Hash, u32>,
    next_order: usize,
    len: usize,
}

impl Default for NetworkFilterList {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkFilterList {
    pub fn new() -> NetworkFilterList {
        NetworkFilterList {
            filter_map: HashMap::new(),
            histogram: HashMap::new(),
            next_order: 0,
            len: 0,
        }
    }

    pub fn from_filters(filters: impl IntoIterator<Item = Arc<NetworkFilter>>) -> NetworkFilterList {
        let mut list = NetworkFilterList::new();
        for filter in filters {
            list.add(filter);
        }
        list
    }

    /// Number of rules in the index.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds one rule. The rule is bucketed under its least-crowded candidate
    /// token; a rule whose pattern has no usable token is dispatched under
    /// its `$domain=` values instead, or into the fallback bucket.
    pub fn add(&mut self, filter: Arc<NetworkFilter>) {
        let order = self.next_order;
        self.next_order += 1;
        self.len += 1;

        for token_group in filter.get_tokens() {
            let best_token = self.pick_best_token(&token_group);
            *self.histogram.entry(best_token).or_insert(0) += 1;
            self.filter_map
                .entry(best_token)
                .or_insert_with(Vec::new)
                .push(StoredFilter {
                    order,
                    filter: Arc::clone(&filter),
                });
        }
    }

    /// Removes the rule with the same id (rule text), if present.
    /// Returns true when something was removed.
    pub fn remove(&mut self, filter: &NetworkFilter) -> bool {
        let mut removed = false;
        for token_group in filter.get_tokens() {
            let mut candidates = token_group;
            candidates.push(FALLBACK_BUCKET);
            for token in candidates {
                if let Entry::Occupied(mut entry) = self.filter_map.entry(token) {
                    let bucket = entry.get_mut();
                    let before = bucket.len();
                    bucket.retain(|stored| stored.filter.id != filter.id);
                    if bucket.len() != before {
                        removed = true;
                    }
                    if bucket.is_empty() {
                        entry.remove();
                    }
                }
            }
        }
        if removed {
            self.len = self.len.saturating_sub(1);
        }
        removed
    }

    fn pick_best_token(&self, tokens: &[Hash]) -> Hash {
        let mut best_token = FALLBACK_BUCKET;
        let mut min_count = u32::MAX;
        for token in tokens {
            let mut count = self.histogram.get(token).copied().unwrap_or(0);
            if COMMON_TOKENS.binary_search(token).is_ok() {
                count = count.saturating_add(COMMON_TOKEN_PENALTY);
            }
            if count < min_count {
                min_count = count;
                best_token = *token;
            }
        }
        best_token
    }

    /// First matching rule in probe order, or `None`. Suitable when any
    /// match decides the outcome.
    pub fn find(
        &self,
        request: &Request,
        exclusions: Option<&HashSet<Hash>>,
    ) -> Option<&Arc<NetworkFilter>> {
        for token in request.lookup_tokens() {
            if let Some(bucket) = self.filter_map.get(token) {
                for stored in bucket {
                    if exclusions
                        .map(|ids| ids.contains(&stored.filter.id))
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    if stored.filter.matches(request) {
                        return Some(&stored.filter);
                    }
                }
            }
        }
        None
    }

    /// Every matching rule, deduplicated and in insertion order.
    pub(crate) fn find_all(
        &self,
        request: &Request,
        exclusions: Option<&HashSet<Hash>>,
    ) -> Vec<StoredFilter> {
        let mut matched: Vec<StoredFilter> = vec![];
        for token in request.lookup_tokens() {
            if let Some(bucket) = self.filter_map.get(token) {
                for stored in bucket {
                    if exclusions
                        .map(|ids| ids.contains(&stored.filter.id))
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    if stored.filter.matches(request) {
                        matched.push(stored.clone());
                    }
                }
            }
        }
        matched.sort_by_key(|stored| stored.order);
        matched.dedup_by_key(|stored| stored.order);
        matched
    }

    /// All rules in the index, in insertion order.
    pub fn rules(&self) -> Vec<Arc<NetworkFilter>> {
        let mut stored: Vec<&StoredFilter> = self.filter_map.values().flatten().collect();
        stored.sort_by_key(|s| s.order);
        stored.dedup_by_key(|s| s.order);
        stored.iter().map(|s| Arc::clone(&s.filter)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(line: &str) -> Arc<NetworkFilter> {
        Arc::new(NetworkFilter::parse(line, 0).unwrap())
    }

    fn request(url: &str, source: &str) -> Request {
        Request::new(url, source, "image").unwrap()
    }

    #[test]
    fn finds_rule_through_token_bucket() {
        let mut list = NetworkFilterList::new();
        list.add(filter("||foo.com^"));
        assert!(list
            .find(&request("https://foo.com/img.png", "https://foo.com"), None)
            .is_some());
        assert!(list
            .find(&request("https://bar.com/img.png", "https://bar.com"), None)
            .is_none());
    }

    #[test]
    fn rule_without_usable_token_lands_in_fallback_bucket() {
        let mut list = NetworkFilterList::new();
        // "ad" is below the token length floor, so only the fallback bucket
        // can hold this rule
        list.add(filter("-ad-."));
        assert_eq!(list.filter_map.len(), 1);
        assert!(list.filter_map.contains_key(&FALLBACK_BUCKET));
        assert!(list
            .find(&request("http://site.com/img-ad-banner.png", "http://site.com"), None)
            .is_some());
    }

    #[test]
    fn chooses_least_crowded_token() {
        let mut list = NetworkFilterList::new();
        list.add(filter("||foo.com^"));
        list.add(filter("||bar.com/foo"));
        // "foo" is already taken by the first rule, so the second should
        // prefer "bar"
        assert_eq!(list.filter_map.get(&fast_hash("foo")).unwrap().len(), 1);
        assert_eq!(list.filter_map.get(&fast_hash("bar")).unwrap().len(), 1);
    }

    #[test]
    fn avoids_common_tokens() {
        let mut list = NetworkFilterList::new();
        list.add(filter("||com.tracker.com/assets^"));
        assert!(!list.filter_map.contains_key(&fast_hash("com")));
    }

    #[test]
    fn domain_option_dispatches_to_multiple_buckets() {
        let mut list = NetworkFilterList::new();
        list.add(filter("foo*$domain=bar.com|baz.com"));
        assert!(list.filter_map.contains_key(&fast_hash("bar.com")));
        assert!(list.filter_map.contains_key(&fast_hash("baz.com")));
        // reachable from either domain, reported once
        let matches = list.find_all(
            &request("https://x.net/foo.js", "https://bar.com"),
            None,
        );
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn remove_works_and_empties_buckets() {
        let mut list = NetworkFilterList::new();
        let f = filter("||foo.com^");
        list.add(Arc::clone(&f));
        assert_eq!(list.len(), 1);
        assert!(list.remove(&f));
        assert_eq!(list.len(), 0);
        assert!(list.filter_map.is_empty());
        assert!(!list.remove(&f));
    }

    #[test]
    fn find_all_returns_insertion_order() {
        let mut list = NetworkFilterList::new();
        list.add(filter("banner"));
        list.add(filter("||site.com/banner"));
        list.add(filter("banner.png"));
        let matches = list.find_all(
            &request("https://site.com/banner.png", "https://site.com"),
            None,
        );
        let orders: Vec<usize> = matches.iter().map(|m| m.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn exclusions_are_skipped() {
        let mut list = NetworkFilterList::new();
        let f = filter("||foo.com^");
        list.add(Arc::clone(&f));
        let mut excluded = HashSet::new();
        excluded.insert(f.id);
        assert!(list
            .find(&request("https://foo.com/x.png", "https://foo.com"), Some(&excluded))
            .is_none());
    }
}
