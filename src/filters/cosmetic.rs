//! Tools for blocking at a page-content level: CSS selector-based element
//! hiding, style injection and script injection.

use thiserror::Error;

use crate::lists::FilterListId;
use crate::url_parser;
use crate::utils::{self, Hash};

#[derive(Debug, Error, PartialEq, Clone)]
pub enum CosmeticFilterError {
    #[error("failed to parse filter")]
    FilterParseError,
    #[error("unsupported cosmetic syntax")]
    UnsupportedSyntax,
    #[error("punycode error")]
    PunycodeError,
    #[error("empty selector")]
    EmptySelector,
}

bitflags::bitflags! {
    /// Boolean flags for cosmetic filter rules.
    pub struct CosmeticFilterMask: u8 {
        const UNHIDE = 1 << 0;
        const SCRIPT_INJECT = 1 << 1;
        const IS_UNICODE = 1 << 2;

        // Careful with checking for NONE - will always match
        const NONE = 0;
    }
}

/// A parsed cosmetic rule: a CSS selector, optionally with an inline style or
/// an injected script body, scoped to hostnames and entities.
#[derive(Debug, Clone)]
pub struct CosmeticFilter {
    pub entities: Option<Vec<Hash>>,
    pub hostnames: Option<Vec<Hash>>,
    pub not_entities: Option<Vec<Hash>>,
    pub not_hostnames: Option<Vec<Hash>>,
    pub mask: CosmeticFilterMask,
    pub selector: String,
    pub style: Option<String>,

    pub raw_line: String,
    pub filter_list_id: FilterListId,
    pub id: Hash,
}

impl CosmeticFilter {
    /// Parse the rule in `line` into a `CosmeticFilter`.
    pub fn parse(line: &str, filter_list_id: FilterListId) -> Result<CosmeticFilter, CosmeticFilterError> {
        let mut mask = CosmeticFilterMask::NONE;
        let sharp_index = match line.find('#') {
            Some(i) => i,
            None => return Err(CosmeticFilterError::FilterParseError),
        };

        let after_sharp_index = sharp_index + 1;
        let mut suffix_start_index = after_sharp_index + 1;

        // AdGuard-specific extended syntax is out of scope here
        for unsupported in ["@$#", "@%#", "%#", "$#", "?#", "@?#"].iter() {
            if line[after_sharp_index..].starts_with(unsupported) {
                return Err(CosmeticFilterError::UnsupportedSyntax);
            }
        }

        if line[after_sharp_index..].starts_with('@') {
            if !line[after_sharp_index + 1..].starts_with('#') {
                return Err(CosmeticFilterError::FilterParseError);
            }
            mask |= CosmeticFilterMask::UNHIDE;
            suffix_start_index += 1;
        } else if !line[after_sharp_index..].starts_with('#') {
            return Err(CosmeticFilterError::FilterParseError);
        }
        if suffix_start_index >= line.len() {
            return Err(CosmeticFilterError::EmptySelector);
        }

        let (entities, not_entities, hostnames, not_hostnames) = if sharp_index > 0 {
            let mut entities_vec = vec![];
            let mut not_entities_vec = vec![];
            let mut hostnames_vec = vec![];
            let mut not_hostnames_vec = vec![];

            for part in line[0..sharp_index].split(',') {
                let hostname = if part.is_ascii() {
                    part.to_string()
                } else {
                    mask |= CosmeticFilterMask::IS_UNICODE;
                    let negated = part.strip_prefix('~');
                    let to_encode = negated.unwrap_or(part);
                    let encoded = url_parser::to_ascii_hostname(to_encode)
                        .ok_or(CosmeticFilterError::PunycodeError)?;
                    match negated {
                        Some(_) => format!("~{}", encoded),
                        None => encoded,
                    }
                };
                let negation = hostname.starts_with('~');
                // entity scopes keep their `.*` suffix as part of the key, to
                // line up with the entity forms computed for a document host
                let entity = hostname.ends_with(".*");
                let key = &hostname[usize::from(negation)..];
                if key.is_empty() || key == ".*" {
                    continue;
                }
                let hash = utils::fast_hash(key);
                match (negation, entity) {
                    (true, true) => not_entities_vec.push(hash),
                    (true, false) => not_hostnames_vec.push(hash),
                    (false, true) => entities_vec.push(hash),
                    (false, false) => hostnames_vec.push(hash),
                }
            }

            let collect = |mut v: Vec<Hash>| {
                if v.is_empty() {
                    None
                } else {
                    v.sort_unstable();
                    Some(v)
                }
            };

            (
                collect(entities_vec),
                collect(not_entities_vec),
                collect(hostnames_vec),
                collect(not_hostnames_vec),
            )
        } else {
            (None, None, None, None)
        };

        let mut selector = &line[suffix_start_index..];
        let mut style = None;
        if selector.len() > 7 && selector.starts_with("script:") {
            // script:inject(...)
            let script_method_index = 7;
            let mut script_selector_index_start = script_method_index;
            let script_selector_index_end = selector.len() - 1;

            if selector[script_method_index..].starts_with("inject(") {
                mask |= CosmeticFilterMask::SCRIPT_INJECT;
                script_selector_index_start += 7;
            } else {
                return Err(CosmeticFilterError::UnsupportedSyntax);
            }

            selector = &selector[script_selector_index_start..script_selector_index_end];
        } else if selector.len() > 4 && selector.starts_with("+js(") {
            mask |= CosmeticFilterMask::SCRIPT_INJECT;
            selector = &selector[4..selector.len() - 1];
        } else if let Some(style_index) = find_style_suffix(selector) {
            if !selector.ends_with(')') {
                return Err(CosmeticFilterError::FilterParseError);
            }
            style = Some(selector[style_index + 7..selector.len() - 1].to_string());
            selector = &selector[..style_index];
        }

        if selector.is_empty() {
            return Err(CosmeticFilterError::EmptySelector);
        }
        if !selector.is_ascii() {
            mask |= CosmeticFilterMask::IS_UNICODE;
        }

        Ok(CosmeticFilter {
            entities,
            hostnames,
            not_entities,
            not_hostnames,
            mask,
            selector: String::from(selector),
            style,
            raw_line: String::from(line),
            filter_list_id,
            id: utils::fast_hash(line),
        })
    }

    pub fn is_unhide(&self) -> bool {
        self.mask.contains(CosmeticFilterMask::UNHIDE)
    }

    pub fn is_script_inject(&self) -> bool {
        self.mask.contains(CosmeticFilterMask::SCRIPT_INJECT)
    }

    /// Whether the rule is scoped to particular hostnames or entities.
    /// Unscoped ("generic") rules apply to every page unless suppressed.
    pub fn has_hostname_constraint(&self) -> bool {
        self.hostnames.is_some()
            || self.entities.is_some()
            || self.not_hostnames.is_some()
            || self.not_entities.is_some()
    }

    pub fn is_generic(&self) -> bool {
        self.hostnames.is_none() && self.entities.is_none()
    }

    /// Checks the rule's hostname constraints against the pre-hashed entity
    /// and hostname-suffix forms of a document's hostname. Restrictions win
    /// over permissions.
    pub fn matches(&self, request_entities: &[Hash], request_hostnames: &[Hash]) -> bool {
        let has_hostname_constraint = self.has_hostname_constraint();
        if !has_hostname_constraint {
            return true;
        }
        if request_entities.is_empty()
            && request_hostnames.is_empty()
            && has_hostname_constraint
        {
            return false;
        }

        if let Some(not_entities) = self.not_entities.as_ref() {
            if request_entities
                .iter()
                .any(|entity| utils::bin_lookup(not_entities, *entity))
            {
                return false;
            }
        }
        if let Some(not_hostnames) = self.not_hostnames.as_ref() {
            if request_hostnames
                .iter()
                .any(|hostname| utils::bin_lookup(not_hostnames, *hostname))
            {
                return false;
            }
        }

        if self.entities.is_none() && self.hostnames.is_none() {
            // only negations, applies everywhere else
            return true;
        }

        if let Some(entities) = self.entities.as_ref() {
            if request_entities
                .iter()
                .any(|entity| utils::bin_lookup(entities, *entity))
            {
                return true;
            }
        }
        if let Some(hostnames) = self.hostnames.as_ref() {
            if request_hostnames
                .iter()
                .any(|hostname| utils::bin_lookup(hostnames, *hostname))
            {
                return true;
            }
        }

        false
    }
}

/// Finds the start of a trailing `:style(` qualifier, if any.
fn find_style_suffix(selector: &str) -> Option<usize> {
    let mut index_after_colon = 0;
    while let Some(colon_index) = selector[index_after_colon..].find(':') {
        let colon_index = index_after_colon + colon_index;
        index_after_colon = colon_index + 1;
        if selector[index_after_colon..].starts_with("style(") {
            return Some(colon_index);
        }
    }
    None
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use crate::utils::fast_hash;

    fn parse(line: &str) -> CosmeticFilter {
        CosmeticFilter::parse(line, 0).unwrap_or_else(|e| panic!("{}: {:?}", line, e))
    }

    #[test]
    fn generic_selector() {
        let rule = parse("##.banner");
        assert_eq!(rule.selector, ".banner");
        assert!(rule.is_generic());
        assert!(!rule.is_unhide());
        assert_eq!(rule.raw_line, "##.banner");
    }

    #[test]
    fn hostname_scoped_selector() {
        let rule = parse("example.com,~sub.example.com###ad-container");
        assert_eq!(rule.selector, "#ad-container");
        assert!(!rule.is_generic());
        assert_eq!(rule.hostnames.as_ref().unwrap(), &vec![fast_hash("example.com")]);
        assert_eq!(
            rule.not_hostnames.as_ref().unwrap(),
            &vec![fast_hash("sub.example.com")]
        );
    }

    #[test]
    fn entity_scoped_selector() {
        let rule = parse("google.*##.ads");
        assert_eq!(rule.entities.as_ref().unwrap(), &vec![fast_hash("google.*")]);
    }

    #[test]
    fn unhide_marker() {
        let rule = parse("site.com#@#.banner");
        assert!(rule.is_unhide());
        assert_eq!(rule.selector, ".banner");
    }

    #[test]
    fn style_qualifier() {
        let rule = parse("site.com##.banner:style(visibility: hidden)");
        assert_eq!(rule.selector, ".banner");
        assert_eq!(rule.style.as_deref(), Some("visibility: hidden"));
    }

    #[test]
    fn script_inject() {
        let rule = parse("site.com##script:inject(acis.js)");
        assert!(rule.is_script_inject());
        assert_eq!(rule.selector, "acis.js");

        let rule = parse("site.com##+js(nowebrtc)");
        assert!(rule.is_script_inject());
        assert_eq!(rule.selector, "nowebrtc");
    }

    #[test]
    fn rejects_extended_syntax() {
        assert_eq!(
            CosmeticFilter::parse("site.com#?#.banner:-abp-has(div)", 0).err(),
            Some(CosmeticFilterError::UnsupportedSyntax)
        );
        assert_eq!(
            CosmeticFilter::parse("site.com#$#body { overflow: hidden }", 0).err(),
            Some(CosmeticFilterError::UnsupportedSyntax)
        );
    }

    #[test]
    fn rejects_empty_selector() {
        assert_eq!(
            CosmeticFilter::parse("##", 0).err(),
            Some(CosmeticFilterError::EmptySelector)
        );
    }
}
