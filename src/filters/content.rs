//! Markup-level filtering rules for elements that CSS selectors cannot
//! express: matching on tag content, content length and wildcard body text.
//! Matching runs against parsed element snapshots handed in by the caller,
//! not against a live DOM.

use once_cell::sync::OnceCell;
use regex::Regex;
use thiserror::Error;

use crate::lists::FilterListId;
use crate::url_parser;
use crate::utils::{self, Hash};

const ATTRIBUTE_START_MARK: char = '[';
const ATTRIBUTE_END_MARK: char = ']';
const QUOTES: char = '"';
const TAG_CONTENT_MASK: &str = "tag-content";
const WILDCARD_MASK: &str = "wildcard";
const TAG_CONTENT_MAX_LENGTH: &str = "max-length";
const TAG_CONTENT_MIN_LENGTH: &str = "min-length";
const PARENT_ELEMENTS: &str = "parent-elements";
const PARENT_SEARCH_LEVEL: &str = "parent-search-level";
const DEFAULT_PARENT_SEARCH_LEVEL: usize = 3;
const DEFAULT_MAX_LENGTH: usize = 8192;

pub const MASK_CONTENT_RULE: &str = "$$";
pub const MASK_CONTENT_EXCEPTION_RULE: &str = "$@$";

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ContentFilterError {
    #[error("failed to parse filter")]
    FilterParseError,
    #[error("content rule must have at least one permitted domain")]
    MissingDomains,
    #[error("invalid attribute syntax")]
    InvalidAttribute,
    #[error("invalid numeric attribute")]
    InvalidNumericAttribute,
    #[error("punycode error")]
    PunycodeError,
}

/// A `wildcard="..."` body matcher: `*` matches any run of characters, `?`
/// any single character. A literal shortcut is checked before the compiled
/// expression.
#[derive(Debug, Clone)]
pub struct Wildcard {
    pub pattern: String,
    shortcut: String,
    compiled: OnceCell<Option<Regex>>,
}

impl Wildcard {
    fn new(pattern: &str) -> Wildcard {
        Wildcard {
            pattern: pattern.to_string(),
            shortcut: extract_wildcard_shortcut(pattern),
            compiled: OnceCell::new(),
        }
    }

    pub fn matches(&self, input: &str) -> bool {
        if input.is_empty() {
            return false;
        }
        if !self.shortcut.is_empty() && !input.to_lowercase().contains(&self.shortcut) {
            return false;
        }
        self.compiled
            .get_or_init(|| {
                let source = wildcard_to_regex(&self.pattern);
                match regex::RegexBuilder::new(&source).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        log::warn!("unusable wildcard pattern {}: {}", self.pattern, e);
                        None
                    }
                }
            })
            .as_ref()
            .map(|re| re.is_match(input))
            .unwrap_or(false)
    }
}

/// Converts a wildcard to an equivalent anchored regular expression.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str("[\\s\\S]*"),
            '?' => source.push('.'),
            c if "\\+|{}[]()^$.#".contains(c) => {
                source.push('\\');
                source.push(c);
            }
            c => source.push(c),
        }
    }
    source.push('$');
    source
}

/// Longest literal stretch of a wildcard pattern, lowercased.
fn extract_wildcard_shortcut(pattern: &str) -> String {
    pattern
        .split(|c| c == '*' || c == '?')
        .max_by_key(|part| part.len())
        .unwrap_or("")
        .to_lowercase()
}

/// A snapshot of a markup element to check content rules against.
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub tag_name: String,
    pub attributes: Vec<(String, String)>,
    pub content: String,
}

impl Element {
    pub fn new(tag_name: &str) -> Element {
        Element {
            tag_name: tag_name.to_lowercase(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Element {
        self.attributes.push((name.to_lowercase(), value.to_string()));
        self
    }

    pub fn with_content(mut self, content: &str) -> Element {
        self.content = content.to_string();
        self
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A markup-filtering rule: tag name, attribute constraints and tag-content
/// matchers, scoped to permitted domains.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    pub tag_name: String,
    /// Attribute constraints; an element matches when each named attribute's
    /// value contains the given substring.
    pub attributes: Vec<(String, String)>,
    pub tag_content: Option<String>,
    pub wildcard: Option<Wildcard>,
    pub min_length: Option<usize>,
    pub max_length: usize,
    /// Tag names to search for upwards of a matched element, and how far.
    /// Walking the tree is the collaborator's job.
    pub parent_elements: Option<Vec<String>>,
    pub parent_search_level: usize,

    pub entities: Option<Vec<Hash>>,
    pub hostnames: Option<Vec<Hash>>,
    pub not_entities: Option<Vec<Hash>>,
    pub not_hostnames: Option<Vec<Hash>>,

    pub whitelist: bool,
    /// The element matcher text after the rule marker; exception rules cancel
    /// rules with identical matcher text.
    pub elements_filter: String,

    pub raw_line: String,
    pub filter_list_id: FilterListId,
    pub id: Hash,
}

impl ContentFilter {
    pub fn parse(line: &str, filter_list_id: FilterListId) -> Result<ContentFilter, ContentFilterError> {
        let (whitelist, mask) = match line.find(MASK_CONTENT_EXCEPTION_RULE) {
            Some(_) => (true, MASK_CONTENT_EXCEPTION_RULE),
            None => (false, MASK_CONTENT_RULE),
        };
        let index_of_mask = line.find(mask).ok_or(ContentFilterError::FilterParseError)?;

        let elements_filter = line[index_of_mask + mask.len()..].to_string();
        if elements_filter.is_empty() {
            return Err(ContentFilterError::FilterParseError);
        }

        let rule_start_index = elements_filter.find(ATTRIBUTE_START_MARK);
        let tag_name = match rule_start_index {
            Some(i) => elements_filter[..i].to_string(),
            None => elements_filter.clone(),
        };
        if tag_name.is_empty() {
            return Err(ContentFilterError::FilterParseError);
        }

        let (entities, not_entities, hostnames, not_hostnames) = if index_of_mask > 0 {
            parse_domains(&line[..index_of_mask])?
        } else {
            (None, None, None, None)
        };

        let mut filter = ContentFilter {
            tag_name: tag_name.to_lowercase(),
            attributes: vec![],
            tag_content: None,
            wildcard: None,
            min_length: None,
            max_length: DEFAULT_MAX_LENGTH,
            parent_elements: None,
            parent_search_level: DEFAULT_PARENT_SEARCH_LEVEL,
            entities,
            hostnames,
            not_entities,
            not_hostnames,
            whitelist,
            elements_filter,
            raw_line: String::from(line),
            filter_list_id,
            id: utils::fast_hash(line),
        };

        if !filter.whitelist && filter.hostnames.is_none() && filter.entities.is_none() {
            return Err(ContentFilterError::MissingDomains);
        }

        // Loading the attribute constraints
        let attributes_text = filter.elements_filter.clone();
        let attributes_text = attributes_text.as_str();
        let mut rule_start_index = rule_start_index;
        while let Some(start) = rule_start_index {
            let equality_index = attributes_text[start + 1..]
                .find('=')
                .map(|i| start + 1 + i)
                .ok_or(ContentFilterError::InvalidAttribute)?;
            let quote_start_index = attributes_text[equality_index + 1..]
                .find(QUOTES)
                .map(|i| equality_index + 1 + i)
                .ok_or(ContentFilterError::InvalidAttribute)?;
            let quote_end_index = get_quote_index(attributes_text, quote_start_index + 1)
                .ok_or(ContentFilterError::InvalidAttribute)?;
            let rule_end_index = attributes_text[quote_end_index + 1..]
                .find(ATTRIBUTE_END_MARK)
                .map(|i| quote_end_index + 1 + i)
                .ok_or(ContentFilterError::InvalidAttribute)?;

            let attribute_name = &attributes_text[start + 1..equality_index];
            let attribute_value =
                attributes_text[quote_start_index + 1..quote_end_index].replace("\"\"", "\"");

            match attribute_name {
                TAG_CONTENT_MASK => filter.tag_content = Some(attribute_value),
                WILDCARD_MASK => filter.wildcard = Some(Wildcard::new(&attribute_value)),
                TAG_CONTENT_MAX_LENGTH => {
                    filter.max_length = attribute_value
                        .parse()
                        .map_err(|_| ContentFilterError::InvalidNumericAttribute)?
                }
                TAG_CONTENT_MIN_LENGTH => {
                    filter.min_length = Some(
                        attribute_value
                            .parse()
                            .map_err(|_| ContentFilterError::InvalidNumericAttribute)?,
                    )
                }
                PARENT_ELEMENTS => {
                    filter.parent_elements =
                        Some(attribute_value.split(',').map(|s| s.to_lowercase()).collect())
                }
                PARENT_SEARCH_LEVEL => {
                    filter.parent_search_level = attribute_value
                        .parse()
                        .map_err(|_| ContentFilterError::InvalidNumericAttribute)?
                }
                name => filter
                    .attributes
                    .push((name.to_lowercase(), attribute_value)),
            }

            rule_start_index = attributes_text[rule_end_index + 1..]
                .find(ATTRIBUTE_START_MARK)
                .map(|i| rule_end_index + 1 + i);
        }

        Ok(filter)
    }

    /// Checks the rule's domain constraints the same way cosmetic rules do.
    pub fn matches_domains(&self, request_entities: &[Hash], request_hostnames: &[Hash]) -> bool {
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

    /// Checks whether the given element snapshot satisfies every structural
    /// constraint of this rule.
    pub fn matches_element(&self, element: &Element) -> bool {
        if element.tag_name != self.tag_name {
            return false;
        }

        for (name, value) in self.attributes.iter() {
            match element.attribute(name) {
                Some(element_value) if element_value.contains(value.as_str()) => {}
                _ => return false,
            }
        }

        if self.tag_content.is_some()
            || self.wildcard.is_some()
            || self.min_length.is_some()
            || self.max_length != DEFAULT_MAX_LENGTH
        {
            let content = &element.content;
            if content.len() > self.max_length {
                return false;
            }
            if let Some(min_length) = self.min_length {
                if content.len() < min_length {
                    return false;
                }
            }
            if let Some(tag_content) = self.tag_content.as_ref() {
                if !content.contains(tag_content.as_str()) {
                    return false;
                }
            }
            if let Some(wildcard) = self.wildcard.as_ref() {
                if !wildcard.matches(content) {
                    return false;
                }
            }
        }

        true
    }
}

/// Domain prefixes of content rules use the same grammar as `$domain=`
/// values: `,`- or `|`-separated, `~` negation, `.*` entities.
#[allow(clippy::type_complexity)]
fn parse_domains(
    domains: &str,
) -> Result<
    (
        Option<Vec<Hash>>,
        Option<Vec<Hash>>,
        Option<Vec<Hash>>,
        Option<Vec<Hash>>,
    ),
    ContentFilterError,
> {
    let mut entities_vec = vec![];
    let mut not_entities_vec = vec![];
    let mut hostnames_vec = vec![];
    let mut not_hostnames_vec = vec![];

    for part in domains.split(|c| c == ',' || c == '|') {
        let negation = part.starts_with('~');
        let name = &part[usize::from(negation)..];
        if name.is_empty() {
            continue;
        }
        let ascii = url_parser::to_ascii_hostname(&name.to_lowercase())
            .ok_or(ContentFilterError::PunycodeError)?;
        let entity = ascii.ends_with(".*");
        let hash = utils::fast_hash(&ascii);
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
    Ok((
        collect(entities_vec),
        collect(not_entities_vec),
        collect(hostnames_vec),
        collect(not_hostnames_vec),
    ))
}

/// Index of the closing quote, skipping `""` escape sequences.
fn get_quote_index(text: &str, start_index: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = start_index;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url_parser::{get_entity_hashes_from_labels, get_hostname_hashes_from_labels};

    fn parse(line: &str) -> ContentFilter {
        ContentFilter::parse(line, 0).unwrap_or_else(|e| panic!("{}: {:?}", line, e))
    }

    #[test]
    fn parses_tag_and_attributes() {
        let rule = parse("example.org$$div[id=\"ad_text\"][class=\"sponsored\"]");
        assert_eq!(rule.tag_name, "div");
        assert_eq!(
            rule.attributes,
            vec![
                ("id".to_string(), "ad_text".to_string()),
                ("class".to_string(), "sponsored".to_string())
            ]
        );
        assert!(!rule.whitelist);
    }

    #[test]
    fn parses_special_attributes() {
        let rule = parse(
            "example.org$$div[tag-content=\"teas\"][max-length=\"500\"][min-length=\"5\"][parent-elements=\"td,table\"][parent-search-level=\"10\"]",
        );
        assert_eq!(rule.tag_content.as_deref(), Some("teas"));
        assert_eq!(rule.max_length, 500);
        assert_eq!(rule.min_length, Some(5));
        assert_eq!(
            rule.parent_elements.as_ref().unwrap(),
            &vec!["td".to_string(), "table".to_string()]
        );
        assert_eq!(rule.parent_search_level, 10);
    }

    #[test]
    fn quote_escaping_in_attribute_values() {
        let rule = parse("example.org$$div[title=\"quoted \"\"text\"\"\"]");
        assert_eq!(
            rule.attributes,
            vec![("title".to_string(), "quoted \"text\"".to_string())]
        );
    }

    #[test]
    fn exception_marker_detected() {
        let rule = parse("example.org$@$div[id=\"ad_text\"]");
        assert!(rule.whitelist);
        assert_eq!(rule.elements_filter, "div[id=\"ad_text\"]");
    }

    #[test]
    fn generic_blocking_rule_rejected() {
        assert_eq!(
            ContentFilter::parse("$$div[id=\"ad\"]", 0).err(),
            Some(ContentFilterError::MissingDomains)
        );
        // exceptions may be generic
        assert!(ContentFilter::parse("$@$div[id=\"ad\"]", 0).is_ok());
    }

    #[test]
    fn element_matching() {
        let rule = parse("example.org$$div[id=\"ad_text\"][tag-content=\"sponsored\"]");
        let matching = Element::new("div")
            .with_attribute("id", "ad_text_1")
            .with_content("some sponsored content");
        assert!(rule.matches_element(&matching));

        let wrong_tag = Element::new("span")
            .with_attribute("id", "ad_text_1")
            .with_content("some sponsored content");
        assert!(!rule.matches_element(&wrong_tag));

        let wrong_content = Element::new("div")
            .with_attribute("id", "ad_text_1")
            .with_content("plain content");
        assert!(!rule.matches_element(&wrong_content));

        let missing_attribute = Element::new("div").with_content("some sponsored content");
        assert!(!rule.matches_element(&missing_attribute));
    }

    #[test]
    fn content_length_constraints() {
        let rule = parse("example.org$$div[min-length=\"10\"][max-length=\"20\"]");
        assert!(!rule.matches_element(&Element::new("div").with_content("short")));
        assert!(rule.matches_element(&Element::new("div").with_content("just about right")));
        assert!(!rule.matches_element(
            &Element::new("div").with_content("much much much too long to possibly match")
        ));
    }

    #[test]
    fn wildcard_matching() {
        let rule = parse("example.org$$div[wildcard=\"*banner*ads*\"]");
        assert!(rule
            .matches_element(&Element::new("div").with_content("big banner with ads inside")));
        assert!(!rule.matches_element(&Element::new("div").with_content("ads before banner")));
    }

    #[test]
    fn domain_scoping() {
        let rule = parse("example.org$$div[id=\"ad\"]");
        let entities = get_entity_hashes_from_labels("sub.example.org", "example.org");
        let hostnames = get_hostname_hashes_from_labels("sub.example.org", "example.org");
        assert!(rule.matches_domains(&entities, &hostnames));

        let entities = get_entity_hashes_from_labels("other.net", "other.net");
        let hostnames = get_hostname_hashes_from_labels("other.net", "other.net");
        assert!(!rule.matches_domains(&entities, &hostnames));
    }
}
