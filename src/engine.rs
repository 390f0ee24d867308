//! The top-level handle tying everything together: it owns the mutable
//! per-list rule containers and an immutable [`Blocker`] snapshot built from
//! them. Every mutation rebuilds the snapshot off the hot path and swaps it
//! in atomically, so lookups in flight keep the aggregate they started with.

use std::sync::Arc;

use crate::blocker::{Blocker, BlockerOptions, BlockerResult};
use crate::container::{AddedRules, FilterListContainer};
use crate::cosmetic_filter_cache::CosmeticResources;
use crate::filters::content::ContentFilter;
use crate::filters::network::NetworkFilter;
use crate::lists::FilterListId;
use crate::request::Request;

pub struct Engine {
    containers: Vec<FilterListContainer>,
    blocker: Arc<Blocker>,
    options: BlockerOptions,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine::with_options(BlockerOptions::default())
    }

    pub fn with_options(options: BlockerOptions) -> Engine {
        let blocker = Arc::new(Blocker::from_containers(std::iter::empty(), &options));
        Engine {
            containers: vec![],
            blocker,
            options,
        }
    }

    /// Convenience constructor: one anonymous list holding all `rules`.
    pub fn from_rules(rules: &str) -> Engine {
        let mut engine = Engine::new();
        engine.use_filter_list(0, rules);
        engine
    }

    /// Loads or replaces the filter list registered under `list_id` and
    /// rebuilds the aggregate. Returns the per-line parse report.
    pub fn use_filter_list(&mut self, list_id: FilterListId, list: &str) -> AddedRules {
        let (container, report) = FilterListContainer::from_list(list_id, list);
        match self
            .containers
            .iter()
            .position(|container| container.list_id == list_id)
        {
            Some(i) => self.containers[i] = container,
            None => self.containers.push(container),
        }
        self.rebuild();
        report
    }

    /// Drops the filter list registered under `list_id`, if present.
    pub fn remove_filter_list(&mut self, list_id: FilterListId) -> bool {
        let before = self.containers.len();
        self.containers.retain(|container| container.list_id != list_id);
        let removed = self.containers.len() != before;
        if removed {
            self.rebuild();
        }
        removed
    }

    /// Adds one rule to an already-registered list. Creates the list when it
    /// does not exist yet. Returns false for duplicates and parse failures.
    pub fn add_rule(&mut self, list_id: FilterListId, rule: &str) -> bool {
        if !self
            .containers
            .iter()
            .any(|container| container.list_id == list_id)
        {
            self.containers.push(FilterListContainer::new(list_id));
        }
        let container = match self
            .containers
            .iter_mut()
            .find(|container| container.list_id == list_id)
        {
            Some(container) => container,
            None => return false,
        };
        match container.add_rule(rule) {
            Ok(true) => {
                self.rebuild();
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::warn!("could not add rule {:?}: {}", rule, e);
                false
            }
        }
    }

    /// Removes one rule (by exact text) from a registered list.
    pub fn remove_rule(&mut self, list_id: FilterListId, rule: &str) -> bool {
        let removed = self
            .containers
            .iter_mut()
            .find(|container| container.list_id == list_id)
            .map(|container| container.remove_rule(rule))
            .unwrap_or(false);
        if removed {
            self.rebuild();
        }
        removed
    }

    /// Whether a rule with exactly this text is registered in any list.
    pub fn rule_exists(&self, rule: &str) -> bool {
        self.containers
            .iter()
            .any(|container| container.rule_exists(rule))
    }

    /// Rebuilds the immutable aggregate from the current containers and
    /// swaps it in. In-flight lookups holding the previous snapshot are
    /// unaffected.
    fn rebuild(&mut self) {
        self.blocker = Arc::new(Blocker::from_containers(
            self.containers.iter(),
            &self.options,
        ));
    }

    /// The current aggregate. Callers doing several related lookups should
    /// hold one snapshot for all of them.
    pub fn snapshot(&self) -> Arc<Blocker> {
        Arc::clone(&self.blocker)
    }

    /// Decide the verdict for a network request given as raw URLs. An
    /// unparseable request yields the empty (allow) verdict; filtering
    /// failures degrade to not-blocked, they never propagate.
    pub fn check_network_request(
        &self,
        url: &str,
        source_url: &str,
        request_type: &str,
    ) -> BlockerResult {
        match Request::new(url, source_url, request_type) {
            Ok(request) => self.blocker.check(&request),
            Err(e) => {
                log::warn!("error parsing request {:?}: {}, returning no match", url, e);
                BlockerResult::default()
            }
        }
    }

    /// Decide the verdict for an already-constructed request.
    pub fn check(&self, request: &Request) -> BlockerResult {
        self.blocker.check(request)
    }

    /// Cosmetic filtering output for a document.
    pub fn cosmetic_resources(&self, document_url: &str) -> CosmeticResources {
        self.blocker.cosmetic_resources(document_url)
    }

    /// Content (markup) rules applicable to a document.
    pub fn content_rules_for(&self, document_url: &str) -> Vec<Arc<ContentFilter>> {
        self.blocker.content_rules_for(document_url)
    }

    /// Document-level exception rule for a main-frame URL, if any.
    pub fn document_rule_for(&self, document_url: &str) -> Option<Arc<NetworkFilter>> {
        self.blocker.document_rule_for(document_url)
    }

    /// Total number of rules across all registered lists.
    pub fn rule_count(&self) -> usize {
        self.containers
            .iter()
            .map(|container| container.rule_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rules_blocks_matching_requests() {
        let engine = Engine::from_rules("||ads.example^\n##.banner");
        let result =
            engine.check_network_request("https://ads.example/a.png", "https://site.com", "image");
        assert!(result.matched);
        assert_eq!(engine.rule_count(), 2);
    }

    #[test]
    fn invalid_request_fails_open() {
        let engine = Engine::from_rules("||ads.example^");
        let result = engine.check_network_request("not a url", "https://site.com", "image");
        assert!(!result.matched);
    }

    #[test]
    fn list_replacement_swaps_rules() {
        let mut engine = Engine::new();
        engine.use_filter_list(1, "||ads.example^");
        assert!(engine
            .check_network_request("https://ads.example/a.png", "https://site.com", "image")
            .matched);

        engine.use_filter_list(1, "||tracker.example^");
        assert!(!engine
            .check_network_request("https://ads.example/a.png", "https://site.com", "image")
            .matched);
        assert!(engine
            .check_network_request("https://tracker.example/a.png", "https://site.com", "image")
            .matched);
    }

    #[test]
    fn list_removal_drops_rules() {
        let mut engine = Engine::new();
        engine.use_filter_list(1, "||ads.example^");
        assert!(engine.remove_filter_list(1));
        assert!(!engine.remove_filter_list(1));
        assert!(!engine
            .check_network_request("https://ads.example/a.png", "https://site.com", "image")
            .matched);
    }

    #[test]
    fn user_rules_are_editable_incrementally() {
        let mut engine = Engine::new();
        assert!(engine.add_rule(99, "||ads.example^"));
        assert!(!engine.add_rule(99, "||ads.example^"));
        assert!(engine.rule_exists("||ads.example^"));
        assert!(engine
            .check_network_request("https://ads.example/a.png", "https://site.com", "image")
            .matched);

        assert!(engine.remove_rule(99, "||ads.example^"));
        assert!(!engine
            .check_network_request("https://ads.example/a.png", "https://site.com", "image")
            .matched);
    }

    #[test]
    fn snapshots_survive_rebuilds() {
        let mut engine = Engine::new();
        engine.use_filter_list(1, "||ads.example^");
        let snapshot = engine.snapshot();

        engine.use_filter_list(1, "");
        // the old snapshot still sees the rules it was built from
        let request =
            Request::new("https://ads.example/a.png", "https://site.com", "image").unwrap();
        assert!(snapshot.check(&request).matched);
        assert!(!engine.check(&request).matched);
    }

    #[test]
    fn exception_across_lists() {
        let mut engine = Engine::new();
        engine.use_filter_list(1, "||ads.example^");
        engine.use_filter_list(2, "@@||ads.example^$domain=trusted.com");

        assert!(!engine
            .check_network_request("https://ads.example/a.png", "https://trusted.com", "image")
            .matched);
        assert!(engine
            .check_network_request("https://ads.example/a.png", "https://other.com", "image")
            .matched);
    }
}
