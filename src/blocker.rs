//! The read-mostly aggregate over every loaded filter list, and the
//! precedence-sensitive resolution of verdicts: per-request blocking with
//! exception handling, per-document cosmetic and content queries, and the
//! modifier ($csp/$cookie/$replace) rule sets.
//!
//! A `Blocker` is immutable once built. When the underlying rule sets change
//! it is rebuilt off the hot path and swapped in atomically, so in-flight
//! lookups never observe a half-updated index.

use std::collections::HashSet;
use std::sync::Arc;

use crate::container::FilterListContainer;
use crate::cosmetic_filter_cache::{CosmeticFilterCache, CosmeticResources};
use crate::filters::content::ContentFilter;
use crate::filters::network::NetworkFilter;
use crate::network_filter_list::NetworkFilterList;
use crate::request::Request;
use crate::url_parser;
use crate::utils::Hash;

/// Construction toggles, mirroring which rule classes the host wants loaded.
pub struct BlockerOptions {
    pub load_network_filters: bool,
    pub load_cosmetic_filters: bool,
}

impl Default for BlockerOptions {
    fn default() -> Self {
        BlockerOptions {
            load_network_filters: true,
            load_cosmetic_filters: true,
        }
    }
}

/// A transform instruction carried by an allowed request's verdict. The
/// engine never rewrites traffic itself; the descriptor is handed to the
/// collaborator responsible for response/header mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformDescriptor {
    Csp { directive: String },
    Cookie {
        name_pattern: String,
        max_age: Option<u64>,
        same_site: Option<String>,
    },
    Replace { pattern: String, replacement: String },
}

/// Verdict for one network request.
#[derive(Debug, Default)]
pub struct BlockerResult {
    pub matched: bool,
    /// Set when the match came from an `$important` rule, which exceptions
    /// cannot override.
    pub important: bool,
    /// Text of the matched blocking rule, if any.
    pub filter: Option<String>,
    /// Text of the exception rule that allowed the request, if any.
    pub exception: Option<String>,
    /// Transform instruction for the collaborator, present only on allowed
    /// requests matching a modifier rule.
    pub transform: Option<TransformDescriptor>,
}

impl BlockerResult {
    fn allow() -> BlockerResult {
        BlockerResult::default()
    }
}

/// The immutable aggregate: blocking, exception and modifier rule indexes
/// plus the cosmetic and content rule stores.
pub struct Blocker {
    importants: NetworkFilterList,
    filters: NetworkFilterList,
    exceptions: NetworkFilterList,
    csp: NetworkFilterList,
    cookie: NetworkFilterList,
    replace: NetworkFilterList,
    /// Ids of rules disabled by `$badfilter`.
    bad_filters: HashSet<Hash>,

    cosmetic: CosmeticFilterCache,
    content_rules: Vec<Arc<ContentFilter>>,

    load_network_filters: bool,
    load_cosmetic_filters: bool,
}

impl Blocker {
    /// Builds the aggregate from every container, in registration order.
    /// Rules of later containers take precedence in specificity ties.
    pub fn from_containers<'a>(
        containers: impl IntoIterator<Item = &'a FilterListContainer>,
        options: &BlockerOptions,
    ) -> Blocker {
        let mut importants = NetworkFilterList::new();
        let mut filters = NetworkFilterList::new();
        let mut exceptions = NetworkFilterList::new();
        let mut csp = NetworkFilterList::new();
        let mut cookie = NetworkFilterList::new();
        let mut replace = NetworkFilterList::new();
        let mut bad_filters = HashSet::new();

        let mut cosmetic_rules = vec![];
        let mut content_rules = vec![];

        for container in containers {
            if options.load_network_filters {
                for filter in container.network_rules() {
                    if filter.is_badfilter() {
                        if let Some(target) = filter.badfilter_target {
                            bad_filters.insert(target);
                        }
                        continue;
                    }
                    let filter = Arc::clone(filter);
                    if filter.is_csp() {
                        csp.add(filter);
                    } else if filter.is_cookie() {
                        cookie.add(filter);
                    } else if filter.is_replace() {
                        replace.add(filter);
                    } else if filter.is_exception() {
                        exceptions.add(filter);
                    } else if filter.is_important() {
                        importants.add(filter);
                    } else {
                        filters.add(filter);
                    }
                }
            }
            if options.load_cosmetic_filters {
                cosmetic_rules.extend(container.cosmetic_rules().cloned());
                content_rules.extend(container.content_rules().cloned());
            }
        }

        Blocker {
            importants,
            filters,
            exceptions,
            csp,
            cookie,
            replace,
            bad_filters,
            cosmetic: CosmeticFilterCache::new(cosmetic_rules),
            content_rules,
            load_network_filters: options.load_network_filters,
            load_cosmetic_filters: options.load_cosmetic_filters,
        }
    }

    fn exclusions(&self) -> Option<&HashSet<Hash>> {
        if self.bad_filters.is_empty() {
            None
        } else {
            Some(&self.bad_filters)
        }
    }

    /// Decide if a network request should be blocked or allowed.
    pub fn check(&self, request: &Request) -> BlockerResult {
        self.check_with_document_rule(request, None)
    }

    /// Same as [`Blocker::check`], with a previously resolved document-level
    /// exception rule applied: `$urlblock` disables URL blocking for the
    /// page's requests, `$genericblock` disables blocking by generic rules.
    pub fn check_with_document_rule(
        &self,
        request: &Request,
        document_rule: Option<&NetworkFilter>,
    ) -> BlockerResult {
        if !self.load_network_filters || !request.is_supported {
            return BlockerResult::allow();
        }

        let exclusions = self.exclusions();

        // $important rules are not subject to exceptions
        if let Some(important) = self.importants.find(request, exclusions) {
            return BlockerResult {
                matched: true,
                important: true,
                filter: Some(important.raw_line.clone()),
                exception: None,
                transform: None,
            };
        }

        let generic_rules_allowed = document_rule
            .map(|rule| !rule.is_generic_block())
            .unwrap_or(true);
        let url_rules_allowed = document_rule
            .map(|rule| !rule.is_url_block())
            .unwrap_or(true);

        if !url_rules_allowed {
            return BlockerResult {
                matched: false,
                important: false,
                filter: None,
                exception: document_rule.map(|rule| rule.raw_line.clone()),
                transform: self.transform_for(request),
            };
        }

        // The highest-specificity blocking rule wins: a rule scoped with
        // `$domain=` beats an unscoped one, and remaining ties go to the
        // most recently added rule.
        let winner = self
            .filters
            .find_all(request, exclusions)
            .into_iter()
            .filter(|stored| generic_rules_allowed || stored.filter.is_domain_specific())
            .max_by_key(|stored| (stored.filter.is_domain_specific(), stored.order));

        let winner = match winner {
            Some(stored) => stored.filter,
            None => {
                return BlockerResult {
                    transform: self.transform_for(request),
                    ..BlockerResult::allow()
                }
            }
        };

        let exception = self
            .exceptions
            .find_all(request, exclusions)
            .into_iter()
            .map(|stored| stored.filter)
            .find(|exception| !exception.is_document_level());

        let transform = if exception.is_some() {
            self.transform_for(request)
        } else {
            None
        };
        BlockerResult {
            matched: exception.is_none(),
            important: false,
            filter: Some(winner.raw_line.clone()),
            exception: exception.map(|exception| exception.raw_line.clone()),
            transform,
        }
    }

    /// First applicable transform for an allowed request, if any. Replace
    /// rules are reported before cookie rules, cookie rules before CSP.
    fn transform_for(&self, request: &Request) -> Option<TransformDescriptor> {
        if let Some(rule) = self.replace_rules_for(request).first() {
            if let Some(replace) = rule.replace.as_ref() {
                return Some(TransformDescriptor::Replace {
                    pattern: replace.pattern.clone(),
                    replacement: replace.replacement.clone(),
                });
            }
        }
        if let Some(rule) = self.cookie_rules_for(request).first() {
            if let Some(cookie) = rule.cookie.as_ref() {
                return Some(TransformDescriptor::Cookie {
                    name_pattern: cookie.name_pattern(),
                    max_age: cookie.max_age,
                    same_site: cookie.same_site.clone(),
                });
            }
        }
        if let Some(directive) = self.csp_directives_for(request).first() {
            return Some(TransformDescriptor::Csp {
                directive: directive.clone(),
            });
        }
        None
    }

    /// Effective `$cookie` rules for a request, with exception rules already
    /// applied: an exception with no cookie value cancels every cookie rule,
    /// one with a value cancels rules carrying exactly that option text.
    pub fn cookie_rules_for(&self, request: &Request) -> Vec<Arc<NetworkFilter>> {
        self.modifier_rules_for(&self.cookie, request)
    }

    /// Effective `$replace` rules for a request. Exceptions follow the same
    /// empty-cancels-all / exact-text rules as cookies.
    pub fn replace_rules_for(&self, request: &Request) -> Vec<Arc<NetworkFilter>> {
        self.modifier_rules_for(&self.replace, request)
    }

    /// Effective CSP directives to inject for a document/subdocument request.
    pub fn csp_directives_for(&self, request: &Request) -> Vec<String> {
        let mut directives = vec![];
        for stored in self.modifier_rules_for(&self.csp, request) {
            if let Some(directive) = stored.modifier_option.as_ref() {
                if !directives.contains(directive) {
                    directives.push(directive.clone());
                }
            }
        }
        directives
    }

    fn modifier_rules_for(
        &self,
        list: &NetworkFilterList,
        request: &Request,
    ) -> Vec<Arc<NetworkFilter>> {
        let matched = list.find_all(request, self.exclusions());
        if matched.is_empty() {
            return vec![];
        }

        let mut cancel_all = false;
        let mut cancelled_options: HashSet<String> = HashSet::new();

        for stored in matched.iter() {
            if stored.filter.is_exception() {
                match stored.filter.modifier_option.as_deref() {
                    None | Some("") => cancel_all = true,
                    Some(option) => {
                        cancelled_options.insert(option.to_string());
                    }
                }
            }
        }
        if cancel_all {
            return vec![];
        }

        let mut blocking = vec![];
        for stored in matched.into_iter() {
            if stored.filter.is_exception() {
                continue;
            }
            let cancelled = stored
                .filter
                .modifier_option
                .as_deref()
                .map(|option| cancelled_options.contains(option))
                .unwrap_or(false);
            if !cancelled {
                blocking.push(stored.filter);
            }
        }
        blocking
    }

    /// Looks up the document-level exception rule for a main-frame URL, to be
    /// passed back into [`Blocker::check_with_document_rule`] for the page's
    /// requests.
    pub fn document_rule_for(&self, document_url: &str) -> Option<Arc<NetworkFilter>> {
        let request = Request::new(document_url, document_url, "document").ok()?;
        self.exceptions
            .find_all(&request, self.exclusions())
            .into_iter()
            .map(|stored| stored.filter)
            .find(|filter| filter.is_url_block() || filter.is_generic_block())
    }

    /// Resolves the cosmetic filtering output for a document URL, honouring
    /// `$generichide` and `$elemhide` exception rules matching it.
    pub fn cosmetic_resources(&self, document_url: &str) -> CosmeticResources {
        if !self.load_cosmetic_filters {
            return CosmeticResources::default();
        }
        let request = match Request::new(document_url, document_url, "document") {
            Ok(request) => request,
            Err(_) => return CosmeticResources::default(),
        };

        let mut generichide = false;
        let mut elemhide = false;
        for stored in self.exceptions.find_all(&request, self.exclusions()) {
            generichide |= stored.filter.is_generic_hide();
            elemhide |= stored.filter.is_elem_hide();
        }

        let domain = url_parser::host_domain(&request.hostname);
        self.cosmetic
            .resources_for_document(&request.hostname, domain, generichide, elemhide)
    }

    /// Content rules applicable to a document, with `$@$` exceptions and
    /// `$content` document exceptions already applied. Element matching is
    /// performed by the caller against these rules.
    pub fn content_rules_for(&self, document_url: &str) -> Vec<Arc<ContentFilter>> {
        if !self.load_cosmetic_filters || self.content_rules.is_empty() {
            return vec![];
        }
        let request = match Request::new(document_url, document_url, "document") {
            Ok(request) => request,
            Err(_) => return vec![],
        };

        // a matching `$content` exception rule disables markup filtering
        if self
            .exceptions
            .find_all(&request, self.exclusions())
            .iter()
            .any(|stored| stored.filter.is_content_exception())
        {
            return vec![];
        }

        let domain = url_parser::host_domain(&request.hostname);
        let entities = url_parser::get_entity_hashes_from_labels(&request.hostname, domain);
        let hostnames = url_parser::get_hostname_hashes_from_labels(&request.hostname, domain);

        let applicable: Vec<&Arc<ContentFilter>> = self
            .content_rules
            .iter()
            .filter(|rule| rule.matches_domains(&entities, &hostnames))
            .collect();

        let excepted: HashSet<&str> = applicable
            .iter()
            .filter(|rule| rule.whitelist)
            .map(|rule| rule.elements_filter.as_str())
            .collect();

        applicable
            .into_iter()
            .filter(|rule| !rule.whitelist && !excepted.contains(rule.elements_filter.as_str()))
            .cloned()
            .collect()
    }

    /// Total number of network rules in the aggregate.
    pub fn network_rule_count(&self) -> usize {
        self.importants.len()
            + self.filters.len()
            + self.exceptions.len()
            + self.csp.len()
            + self.cookie.len()
            + self.replace.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FilterListContainer;

    fn blocker(lists: &[&str]) -> Blocker {
        let containers: Vec<FilterListContainer> = lists
            .iter()
            .enumerate()
            .map(|(i, list)| FilterListContainer::from_list(i as u32, list).0)
            .collect();
        Blocker::from_containers(containers.iter(), &BlockerOptions::default())
    }

    fn check(blocker: &Blocker, url: &str, source: &str, request_type: &str) -> BlockerResult {
        let request = Request::new(url, source, request_type).unwrap();
        blocker.check(&request)
    }

    #[test]
    fn no_match_allows() {
        let blocker = blocker(&["||ads.example^"]);
        let result = check(&blocker, "https://site.com/img.png", "https://site.com", "image");
        assert!(!result.matched);
        assert!(result.filter.is_none());
    }

    #[test]
    fn blocking_rule_blocks() {
        let blocker = blocker(&["||ads.example^"]);
        let result = check(&blocker, "https://ads.example/img.png", "https://site.com", "image");
        assert!(result.matched);
        assert_eq!(result.filter.as_deref(), Some("||ads.example^"));
    }

    #[test]
    fn exception_precedence_with_domain_scope() {
        let blocker = blocker(&["||ads.example^\n@@||ads.example^$domain=trusted.com"]);
        let blocked = check(&blocker, "https://ads.example/a.js", "https://untrusted.com", "script");
        assert!(blocked.matched);

        let allowed = check(&blocker, "https://ads.example/a.js", "https://trusted.com", "script");
        assert!(!allowed.matched);
        assert_eq!(
            allowed.exception.as_deref(),
            Some("@@||ads.example^$domain=trusted.com")
        );
        assert_eq!(allowed.filter.as_deref(), Some("||ads.example^"));
    }

    #[test]
    fn important_rule_beats_exception() {
        let blocker = blocker(&["||ads.example^$important\n@@||ads.example^"]);
        let result = check(&blocker, "https://ads.example/a.js", "https://site.com", "script");
        assert!(result.matched);
        assert!(result.important);
    }

    #[test]
    fn domain_specific_rule_wins_specificity_tie() {
        let blocker = blocker(&["||ads.example^$domain=site.com\n||ads.example^"]);
        let result = check(&blocker, "https://ads.example/a.png", "https://site.com", "image");
        assert!(result.matched);
        assert_eq!(result.filter.as_deref(), Some("||ads.example^$domain=site.com"));
    }

    #[test]
    fn later_list_wins_remaining_tie() {
        let blocker = blocker(&["||ads.example^$image", "||ads.example^$~script"]);
        let result = check(&blocker, "https://ads.example/a.png", "https://site.com", "image");
        assert!(result.matched);
        assert_eq!(result.filter.as_deref(), Some("||ads.example^$~script"));
    }

    #[test]
    fn badfilter_disables_blocking_rule() {
        let blocker = blocker(&["||ads.example^$image\n||ads.example^$image,badfilter"]);
        let result = check(&blocker, "https://ads.example/a.png", "https://site.com", "image");
        assert!(!result.matched);
    }

    #[test]
    fn badfilter_disables_exception_rule() {
        let blocker = blocker(&["||ads.example^\n@@||ads.example^\n@@||ads.example^$badfilter"]);
        let result = check(&blocker, "https://ads.example/a.png", "https://site.com", "image");
        assert!(result.matched);
    }

    #[test]
    fn plain_and_third_party_rules_scenario() {
        let blocker = blocker(&["-ad-.\n||tracker.io^$third-party"]);

        let result = check(&blocker, "http://site.com/img-ad-banner.png", "http://site.com", "image");
        assert!(result.matched, "expected match by plain rule");
        assert_eq!(result.filter.as_deref(), Some("-ad-."));

        let result = check(&blocker, "http://tracker.io/pixel", "http://site.com", "image");
        assert!(result.matched, "expected match for third-party request");

        let result = check(&blocker, "http://tracker.io/pixel", "http://tracker.io", "image");
        assert!(!result.matched, "expected no match for first-party request");
    }

    #[test]
    fn unsupported_scheme_allows() {
        let blocker = blocker(&["||ads.example^"]);
        let request = Request::new("ftp://ads.example/x", "https://site.com", "other").unwrap();
        assert!(!blocker.check(&request).matched);
    }

    #[test]
    fn cookie_rules_and_exceptions() {
        let blocker = blocker(&[
            "||site.com^$cookie=tracker_id\n||site.com^$cookie=analytics\n@@||site.com^$cookie=analytics",
        ]);
        let request = Request::new("https://site.com/page", "https://site.com", "document").unwrap();
        let rules = blocker.cookie_rules_for(&request);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].raw_line, "||site.com^$cookie=tracker_id");
    }

    #[test]
    fn empty_cookie_exception_cancels_all() {
        let blocker = blocker(&["||site.com^$cookie=tracker_id\n@@||site.com^$cookie"]);
        let request = Request::new("https://site.com/page", "https://site.com", "document").unwrap();
        assert!(blocker.cookie_rules_for(&request).is_empty());
    }

    #[test]
    fn allowed_request_carries_cookie_transform() {
        let blocker = blocker(&["||site.com^$cookie=tracker_id;maxAge=3600"]);
        let result = check(&blocker, "https://site.com/page", "https://site.com", "document");
        assert!(!result.matched);
        assert_eq!(
            result.transform,
            Some(TransformDescriptor::Cookie {
                name_pattern: "tracker_id".to_string(),
                max_age: Some(3600),
                same_site: None,
            })
        );
    }

    #[test]
    fn csp_directives_with_exceptions() {
        let blocker = blocker(&[
            "||site.com^$csp=script-src 'none'\n||site.com^$csp=connect-src 'none'\n@@||site.com^$csp=connect-src 'none'",
        ]);
        let request = Request::new("https://site.com/", "https://site.com", "document").unwrap();
        assert_eq!(blocker.csp_directives_for(&request), vec!["script-src 'none'"]);
    }

    #[test]
    fn replace_rules_resolved_for_request() {
        let blocker = blocker(&[r"||site.com^$replace=/ads/clean/"]);
        let request = Request::new("https://site.com/page", "https://site.com", "document").unwrap();
        let rules = blocker.replace_rules_for(&request);
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].replace.as_ref().unwrap().apply("has ads inside").as_deref(),
            Some("has clean inside")
        );
    }

    #[test]
    fn generichide_suppresses_generic_cosmetics() {
        let blocker = blocker(&["##.banner\nsite.com##.promo\n@@||site.com^$generichide"]);
        let resources = blocker.cosmetic_resources("https://site.com/page");
        assert_eq!(resources.hide_selectors, vec![".promo"]);

        let resources = blocker.cosmetic_resources("https://other.org/");
        assert_eq!(resources.hide_selectors, vec![".banner"]);
    }

    #[test]
    fn elemhide_suppresses_all_cosmetics() {
        let blocker = blocker(&["##.banner\nsite.com##.promo\n@@||site.com^$elemhide"]);
        let resources = blocker.cosmetic_resources("https://site.com/page");
        assert!(resources.hide_selectors.is_empty());
    }

    #[test]
    fn urlblock_document_rule_allows_page_requests() {
        let blocker = blocker(&["||ads.example^\n@@||trusted.com^$urlblock"]);
        let document_rule = blocker.document_rule_for("https://trusted.com/").unwrap();
        let request =
            Request::new("https://ads.example/a.png", "https://trusted.com", "image").unwrap();
        let result = blocker.check_with_document_rule(&request, Some(&document_rule));
        assert!(!result.matched);
        assert_eq!(result.exception.as_deref(), Some("@@||trusted.com^$urlblock"));
    }

    #[test]
    fn genericblock_document_rule_keeps_specific_rules() {
        let blocker = blocker(&[
            "||ads.example^\n||tracker.example^$domain=trusted.com\n@@||trusted.com^$genericblock",
        ]);
        let document_rule = blocker.document_rule_for("https://trusted.com/").unwrap();

        let generic_request =
            Request::new("https://ads.example/a.png", "https://trusted.com", "image").unwrap();
        assert!(!blocker
            .check_with_document_rule(&generic_request, Some(&document_rule))
            .matched);

        let specific_request =
            Request::new("https://tracker.example/a.png", "https://trusted.com", "image").unwrap();
        assert!(blocker
            .check_with_document_rule(&specific_request, Some(&document_rule))
            .matched);
    }

    #[test]
    fn content_rules_for_document() {
        let blocker = blocker(&[
            "example.org$$div[id=\"ad_text\"]\nexample.org$$table[class=\"sponsored\"]\nexample.org$@$table[class=\"sponsored\"]",
        ]);
        let rules = blocker.content_rules_for("https://example.org/");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].raw_line, "example.org$$div[id=\"ad_text\"]");
        assert!(blocker.content_rules_for("https://other.net/").is_empty());
    }
}
