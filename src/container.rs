//! A named collection of rules backing one filter list (a subscription or the
//! user's own rules). Containers are edited incrementally as the list updates
//! and are aggregated into an immutable [`crate::blocker::Blocker`] snapshot
//! one level up.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::filters::content::ContentFilter;
use crate::filters::cosmetic::CosmeticFilter;
use crate::filters::network::NetworkFilter;
use crate::lists::{self, FilterListId, FilterParseError, LineError, ParsedFilter};
use crate::network_filter_list::NetworkFilterList;
use crate::request::Request;
use crate::utils::{fast_hash, Hash};

/// A stored rule of any variant, shared with the aggregate.
#[derive(Debug, Clone)]
pub enum StoredRule {
    Network(Arc<NetworkFilter>),
    Cosmetic(Arc<CosmeticFilter>),
    Content(Arc<ContentFilter>),
}

impl StoredRule {
    pub fn raw_line(&self) -> &str {
        match self {
            StoredRule::Network(f) => &f.raw_line,
            StoredRule::Cosmetic(f) => &f.raw_line,
            StoredRule::Content(f) => &f.raw_line,
        }
    }
}

/// Outcome of a batch rule addition.
#[derive(Debug, Default)]
pub struct AddedRules {
    pub added: usize,
    pub duplicates: usize,
    pub errors: Vec<LineError>,
}

/// The live rule set of one filter list, with incremental add/remove keyed by
/// verbatim rule text and an indexed network lookup.
pub struct FilterListContainer {
    pub list_id: FilterListId,
    rules: HashMap<Hash, StoredRule>,
    rule_order: Vec<Hash>,
    network: NetworkFilterList,
}

impl FilterListContainer {
    pub fn new(list_id: FilterListId) -> FilterListContainer {
        FilterListContainer {
            list_id,
            rules: HashMap::new(),
            rule_order: vec![],
            network: NetworkFilterList::new(),
        }
    }

    /// Parses a whole list text and adds every valid rule.
    pub fn from_list(list_id: FilterListId, list: &str) -> (FilterListContainer, AddedRules) {
        let mut container = FilterListContainer::new(list_id);
        let report = container.add_rules(list);
        (container, report)
    }

    /// Number of rules in the container.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Adds one rule line. Re-adding the same rule text is a no-op reported
    /// as `Ok(false)`.
    pub fn add_rule(&mut self, line: &str) -> Result<bool, FilterParseError> {
        let trimmed = line.trim();
        let key = fast_hash(trimmed);
        if self.rules.contains_key(&key) {
            return Ok(false);
        }

        let rule = match lists::parse_filter(trimmed, self.list_id)? {
            ParsedFilter::Network(f) => {
                let f = Arc::new(f);
                self.network.add(Arc::clone(&f));
                StoredRule::Network(f)
            }
            ParsedFilter::Cosmetic(f) => StoredRule::Cosmetic(Arc::new(f)),
            ParsedFilter::Content(f) => StoredRule::Content(Arc::new(f)),
        };
        self.rules.insert(key, rule);
        self.rule_order.push(key);
        Ok(true)
    }

    /// Adds every line of `list`. Parse failures are collected per line and
    /// never abort the batch; blank lines and comments are skipped silently.
    pub fn add_rules(&mut self, list: &str) -> AddedRules {
        let mut report = AddedRules::default();
        for (i, line) in list.lines().enumerate() {
            match self.add_rule(line) {
                Ok(true) => report.added += 1,
                Ok(false) => report.duplicates += 1,
                Err(FilterParseError::Empty) | Err(FilterParseError::NotSupported) => {}
                Err(error) => {
                    log::debug!("skipping rule {:?}: {}", line.trim(), error);
                    report.errors.push(LineError {
                        line_number: i + 1,
                        line: line.trim().to_string(),
                        error,
                    });
                }
            }
        }
        report
    }

    /// Removes the rule with exactly this text. Returns true if it existed.
    pub fn remove_rule(&mut self, line: &str) -> bool {
        let key = fast_hash(line.trim());
        match self.rules.entry(key) {
            Entry::Occupied(entry) => {
                if let StoredRule::Network(f) = entry.get() {
                    let f = Arc::clone(f);
                    entry.remove();
                    self.network.remove(&f);
                } else {
                    entry.remove();
                }
                self.rule_order.retain(|k| k != &key);
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// All rules of the container, in the order they were added.
    pub fn rules(&self) -> impl Iterator<Item = &StoredRule> {
        self.rule_order.iter().filter_map(move |key| self.rules.get(key))
    }

    /// Network rules only, in insertion order.
    pub fn network_rules(&self) -> impl Iterator<Item = &Arc<NetworkFilter>> {
        self.rules().filter_map(|rule| match rule {
            StoredRule::Network(f) => Some(f),
            _ => None,
        })
    }

    /// Cosmetic rules only, in insertion order.
    pub fn cosmetic_rules(&self) -> impl Iterator<Item = &Arc<CosmeticFilter>> {
        self.rules().filter_map(|rule| match rule {
            StoredRule::Cosmetic(f) => Some(f),
            _ => None,
        })
    }

    /// Content rules only, in insertion order.
    pub fn content_rules(&self) -> impl Iterator<Item = &Arc<ContentFilter>> {
        self.rules().filter_map(|rule| match rule {
            StoredRule::Content(f) => Some(f),
            _ => None,
        })
    }

    /// First network rule of this container matching the request, if any.
    pub fn find_network_rule(
        &self,
        request: &Request,
        exclusions: Option<&HashSet<Hash>>,
    ) -> Option<&Arc<NetworkFilter>> {
        self.network.find(request, exclusions)
    }

    /// Whether a rule with exactly this text is present.
    pub fn rule_exists(&self, line: &str) -> bool {
        self.rules.contains_key(&fast_hash(line.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let mut container = FilterListContainer::new(0);
        assert_eq!(container.add_rule("||ads.example^"), Ok(true));
        assert_eq!(container.add_rule("||ads.example^"), Ok(false));
        assert_eq!(container.rule_count(), 1);

        let request = Request::new("https://ads.example/x.png", "https://site.com", "image").unwrap();
        assert!(container.find_network_rule(&request, None).is_some());
    }

    #[test]
    fn batch_add_reports_outcome() {
        let mut container = FilterListContainer::new(0);
        let report = container.add_rules(
            "! header\n||ads.example^\n||ads.example^\n##.banner\nbroken$unknownopt\n",
        );
        assert_eq!(report.added, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(container.rule_count(), 2);
    }

    #[test]
    fn remove_rule_by_text() {
        let mut container = FilterListContainer::new(0);
        container.add_rule("||ads.example^").unwrap();
        container.add_rule("##.banner").unwrap();
        assert!(container.remove_rule("||ads.example^"));
        assert!(!container.remove_rule("||ads.example^"));
        assert_eq!(container.rule_count(), 1);

        let request = Request::new("https://ads.example/x.png", "https://site.com", "image").unwrap();
        assert!(container.find_network_rule(&request, None).is_none());
    }

    #[test]
    fn rules_keep_insertion_order() {
        let mut container = FilterListContainer::new(0);
        container.add_rule("||a.example^").unwrap();
        container.add_rule("##.banner").unwrap();
        container.add_rule("||b.example^").unwrap();
        let lines: Vec<&str> = container.rules().map(|r| r.raw_line()).collect();
        assert_eq!(lines, vec!["||a.example^", "##.banner", "||b.example^"]);
    }

    #[test]
    fn rule_text_is_preserved_verbatim() {
        let mut container = FilterListContainer::new(7);
        container.add_rule("||ads.example^$third-party").unwrap();
        assert!(container.rule_exists("||ads.example^$third-party"));
        let rule = container.network_rules().next().unwrap();
        assert_eq!(rule.raw_line, "||ads.example^$third-party");
        assert_eq!(rule.filter_list_id, 7);
    }
}
