//! Provides behavior related to cosmetic filtering - that is, modifying a
//! page's contents after it's been loaded into a browser. This is used to
//! hide or clean up unwanted page elements that are served inline with the
//! rest of the first-party content from a page, to restyle them, or to
//! inject script payloads intercepting page behavior.
//!
//! The `CosmeticFilterCache` struct stores all cosmetic rules of an engine
//! and resolves, per document, the set of hide selectors, injected styles and
//! injected scripts that apply to it.

use std::collections::HashSet;
use std::sync::Arc;

use itertools::Itertools;

use crate::filters::cosmetic::CosmeticFilter;
use crate::url_parser;

/// Cosmetic filtering output for one document: what to hide, what styles to
/// add and what scripts to run.
#[derive(Debug, Default, PartialEq)]
pub struct CosmeticResources {
    /// CSS selectors of elements to hide, i.e. to style as
    /// `{ display: none !important; }`.
    pub hide_selectors: Vec<String>,
    /// Full CSS blocks from `:style(...)` rules, e.g. `.banner { opacity: 0 }`.
    pub injected_css: Vec<String>,
    /// Script payloads to inject into the page.
    pub injected_scripts: Vec<String>,
}

impl CosmeticResources {
    pub fn is_empty(&self) -> bool {
        self.hide_selectors.is_empty()
            && self.injected_css.is_empty()
            && self.injected_scripts.is_empty()
    }

    /// Renders the hide selectors as one stylesheet string.
    pub fn hide_stylesheet(&self) -> String {
        if self.hide_selectors.is_empty() {
            return String::new();
        }
        let mut stylesheet = self.hide_selectors.iter().join(",");
        stylesheet += "{display:none !important;}";
        stylesheet
    }
}

/// Stores cosmetic filters split by scope, for efficient per-document
/// queries: generic rules apply everywhere unless suppressed, specific rules
/// are matched against the document's hostname.
pub(crate) struct CosmeticFilterCache {
    generic_rules: Vec<Arc<CosmeticFilter>>,
    generic_script_rules: Vec<Arc<CosmeticFilter>>,
    /// Selector texts cancelled everywhere by generic `#@#` exceptions.
    generic_exceptions: HashSet<String>,
    /// Script texts cancelled everywhere by generic script exceptions.
    generic_script_exceptions: HashSet<String>,

    specific_rules: Vec<Arc<CosmeticFilter>>,
}

impl CosmeticFilterCache {
    pub fn new(rules: impl IntoIterator<Item = Arc<CosmeticFilter>>) -> Self {
        let mut self_ = Self {
            generic_rules: vec![],
            generic_script_rules: vec![],
            generic_exceptions: HashSet::new(),
            generic_script_exceptions: HashSet::new(),
            specific_rules: vec![],
        };
        for rule in rules {
            self_.add_filter(rule);
        }
        self_
    }

    fn add_filter(&mut self, rule: Arc<CosmeticFilter>) {
        if rule.has_hostname_constraint() {
            self.specific_rules.push(rule);
        } else if rule.is_unhide() {
            if rule.is_script_inject() {
                self.generic_script_exceptions.insert(rule.selector.clone());
            } else {
                self.generic_exceptions.insert(rule.selector.clone());
            }
        } else if rule.is_script_inject() {
            self.generic_script_rules.push(rule);
        } else {
            self.generic_rules.push(rule);
        }
    }

    /// Resolves the cosmetic output for a document. `generichide` drops the
    /// unscoped rules, `elemhide` drops all CSS-based output; both flags come
    /// from matching network exception rules.
    pub fn resources_for_document<'a>(
        &'a self,
        hostname: &str,
        domain: &str,
        generichide: bool,
        elemhide: bool,
    ) -> CosmeticResources {
        let request_entities = url_parser::get_entity_hashes_from_labels(hostname, domain);
        let request_hostnames = url_parser::get_hostname_hashes_from_labels(hostname, domain);

        let applicable: Vec<&Arc<CosmeticFilter>> = self
            .specific_rules
            .iter()
            .filter(|rule| rule.matches(&request_entities, &request_hostnames))
            .collect();

        // Hostname-scoped `#@#` exceptions cancel rules sharing the same
        // selector text, not all cosmetic rules.
        let mut excepted_selectors: HashSet<&str> = HashSet::new();
        let mut excepted_scripts: HashSet<&str> = HashSet::new();
        for rule in applicable.iter().filter(|rule| rule.is_unhide()) {
            if rule.is_script_inject() {
                excepted_scripts.insert(rule.selector.as_str());
            } else {
                excepted_selectors.insert(rule.selector.as_str());
            }
        }

        let mut resources = CosmeticResources::default();
        let mut seen_selectors: HashSet<&'a str> = HashSet::new();
        let mut seen_scripts: HashSet<&'a str> = HashSet::new();

        {
            let mut add_css_rule = |rule: &'a Arc<CosmeticFilter>| {
                if elemhide
                    || excepted_selectors.contains(rule.selector.as_str())
                    || self.generic_exceptions.contains(rule.selector.as_str())
                {
                    return;
                }
                if !seen_selectors.insert(rule.selector.as_str()) {
                    return;
                }
                match rule.style.as_ref() {
                    Some(style) => resources
                        .injected_css
                        .push(format!("{} {{{}}}", rule.selector, style)),
                    None => resources.hide_selectors.push(rule.selector.clone()),
                }
            };

            for rule in applicable.iter().copied().filter(|rule| !rule.is_unhide()) {
                if rule.is_script_inject() {
                    continue;
                }
                add_css_rule(rule);
            }

            if !generichide {
                for rule in self.generic_rules.iter() {
                    add_css_rule(rule);
                }
            }
        }

        // Script injections are suppressed by their own exceptions only.
        let mut add_script_rule = |rule: &'a Arc<CosmeticFilter>| {
            if excepted_scripts.contains(rule.selector.as_str())
                || self.generic_script_exceptions.contains(rule.selector.as_str())
            {
                return;
            }
            if seen_scripts.insert(rule.selector.as_str()) {
                resources.injected_scripts.push(rule.selector.clone());
            }
        };

        for rule in applicable.iter().copied().filter(|rule| !rule.is_unhide()) {
            if rule.is_script_inject() {
                add_script_rule(rule);
            }
        }
        if !generichide {
            for rule in self.generic_script_rules.iter() {
                add_script_rule(rule);
            }
        }

        resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::cosmetic::CosmeticFilter;

    fn cache(rules: &[&str]) -> CosmeticFilterCache {
        CosmeticFilterCache::new(
            rules
                .iter()
                .map(|r| Arc::new(CosmeticFilter::parse(r, 0).unwrap())),
        )
    }

    fn query(cache: &CosmeticFilterCache, hostname: &str) -> CosmeticResources {
        let domain = crate::url_parser::host_domain(hostname);
        cache.resources_for_document(hostname, domain, false, false)
    }

    #[test]
    fn generic_rules_apply_everywhere() {
        let cache = cache(&["##.banner", "##.ad-box"]);
        let resources = query(&cache, "example.com");
        assert_eq!(resources.hide_selectors, vec![".banner", ".ad-box"]);
    }

    #[test]
    fn specific_rules_apply_to_their_hostnames() {
        let cache = cache(&["site.com##.promo"]);
        assert_eq!(query(&cache, "site.com").hide_selectors, vec![".promo"]);
        assert_eq!(query(&cache, "sub.site.com").hide_selectors, vec![".promo"]);
        assert!(query(&cache, "other.org").is_empty());
    }

    #[test]
    fn unhide_cancels_same_selector_only() {
        let cache = cache(&["##.banner", "##.ad-box", "site.com#@#.banner"]);
        let resources = query(&cache, "site.com");
        assert_eq!(resources.hide_selectors, vec![".ad-box"]);
        // unaffected elsewhere
        let resources = query(&cache, "other.org");
        assert_eq!(resources.hide_selectors, vec![".banner", ".ad-box"]);
    }

    #[test]
    fn generichide_drops_generic_rules_only() {
        let cache = cache(&["##.banner", "site.com##.promo"]);
        let resources = cache.resources_for_document("site.com", "site.com", true, false);
        assert_eq!(resources.hide_selectors, vec![".promo"]);
    }

    #[test]
    fn elemhide_drops_all_css() {
        let cache = cache(&["##.banner", "site.com##.promo"]);
        let resources = cache.resources_for_document("site.com", "site.com", false, true);
        assert!(resources.hide_selectors.is_empty());
        assert!(resources.injected_css.is_empty());
    }

    #[test]
    fn style_rules_become_injected_css() {
        let cache = cache(&["site.com##.banner:style(opacity: 0)"]);
        let resources = query(&cache, "site.com");
        assert!(resources.hide_selectors.is_empty());
        assert_eq!(resources.injected_css, vec![".banner {opacity: 0}"]);
    }

    #[test]
    fn script_rules_are_injected_separately() {
        let cache = cache(&["site.com##+js(nowebrtc)"]);
        let resources = query(&cache, "site.com");
        assert_eq!(resources.injected_scripts, vec!["nowebrtc"]);
    }

    #[test]
    fn duplicate_selectors_are_deduplicated() {
        let cache = cache(&["##.banner", "site.com##.banner"]);
        let resources = query(&cache, "site.com");
        assert_eq!(resources.hide_selectors, vec![".banner"]);
    }

    #[test]
    fn hide_stylesheet_renders_all_selectors() {
        let cache = cache(&["##.banner", "##.ad-box"]);
        let resources = query(&cache, "example.com");
        assert_eq!(
            resources.hide_stylesheet(),
            ".banner,.ad-box{display:none !important;}"
        );
    }
}
