//! Turns raw filter-list text into typed rules: line classification, per-line
//! parsing and error reporting. A malformed line never aborts the rest of the
//! list.

use thiserror::Error;

use crate::filters::content::{ContentFilter, ContentFilterError};
use crate::filters::cosmetic::{CosmeticFilter, CosmeticFilterError};
use crate::filters::network::{NetworkFilter, NetworkFilterError};

/// Identifier of the filter list a rule came from, assigned at registration.
pub type FilterListId = u32;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum FilterType {
    Network,
    Cosmetic,
    Content,
    NotSupported,
}

#[derive(Debug, Error, PartialEq, Clone)]
pub enum FilterParseError {
    #[error("empty line")]
    Empty,
    #[error("comment or unsupported syntax")]
    NotSupported,
    #[error(transparent)]
    Network(#[from] NetworkFilterError),
    #[error(transparent)]
    Cosmetic(#[from] CosmeticFilterError),
    #[error(transparent)]
    Content(#[from] ContentFilterError),
}

/// A successfully parsed rule of any variant.
#[derive(Debug, Clone)]
pub enum ParsedFilter {
    Network(NetworkFilter),
    Cosmetic(CosmeticFilter),
    Content(ContentFilter),
}

impl ParsedFilter {
    /// The verbatim source line of the rule.
    pub fn raw_line(&self) -> &str {
        match self {
            ParsedFilter::Network(f) => &f.raw_line,
            ParsedFilter::Cosmetic(f) => &f.raw_line,
            ParsedFilter::Content(f) => &f.raw_line,
        }
    }
}

/// Given a single line, checks if this would likely be a cosmetic filter, a
/// content filter, a network filter or something that is not supported. This
/// check is performed before calling a more specific parser to create an
/// instance of `NetworkFilter`, `CosmeticFilter` or `ContentFilter`.
pub fn detect_filter_type(filter: &str) -> FilterType {
    // Ignore comments and list headers
    if filter.len() == 1
        || filter.starts_with('!')
        || (filter.starts_with('#') && filter[1..].starts_with(char::is_whitespace))
        || filter.starts_with("[Adblock")
    {
        return FilterType::NotSupported;
    }

    if filter.starts_with('|') || filter.starts_with("@@|") {
        return FilterType::Network;
    }

    // Content rules `$$` / `$@$`, distinguished from `$` option delimiters by
    // the marker appearing before any `#`
    if let Some(dollar_index) = filter.find("$$").or_else(|| filter.find("$@$")) {
        if filter.find('#').map(|i| i > dollar_index).unwrap_or(true) {
            return FilterType::Content;
        }
    }

    // Check if filter is cosmetics
    if let Some(sharp_index) = filter.find('#') {
        let after_sharp_index = sharp_index + 1;

        // Scriptlet and extended-CSS syntax is not supported:
        // `#$#` `#@$#` `#%#` `#@%#` `#?#` `#@?#`
        if filter[after_sharp_index..].starts_with("@$#")
            || filter[after_sharp_index..].starts_with("@%#")
            || filter[after_sharp_index..].starts_with("@?#")
            || filter[after_sharp_index..].starts_with("%#")
            || filter[after_sharp_index..].starts_with("$#")
            || filter[after_sharp_index..].starts_with("?#")
        {
            return FilterType::NotSupported;
        } else if filter[after_sharp_index..].starts_with('#')
            || filter[after_sharp_index..].starts_with("@#")
        {
            // Supported cosmetic filters: `##` `#@#`
            return FilterType::Cosmetic;
        }
    }

    // Everything else is a network filter
    FilterType::Network
}

/// Parses one line into a typed rule. Blank lines and comments are rejected
/// with dedicated error values that callers may count silently.
pub fn parse_filter(
    line: &str,
    filter_list_id: FilterListId,
) -> Result<ParsedFilter, FilterParseError> {
    let filter = line.trim();
    if filter.is_empty() {
        return Err(FilterParseError::Empty);
    }
    match detect_filter_type(filter) {
        FilterType::Network => NetworkFilter::parse(filter, filter_list_id)
            .map(ParsedFilter::Network)
            .map_err(FilterParseError::from),
        FilterType::Cosmetic => CosmeticFilter::parse(filter, filter_list_id)
            .map(ParsedFilter::Cosmetic)
            .map_err(FilterParseError::from),
        FilterType::Content => ContentFilter::parse(filter, filter_list_id)
            .map(ParsedFilter::Content)
            .map_err(FilterParseError::from),
        FilterType::NotSupported => Err(FilterParseError::NotSupported),
    }
}

/// One skipped line of a parsed list.
#[derive(Debug, Clone, PartialEq)]
pub struct LineError {
    /// 1-based line number within the list text.
    pub line_number: usize,
    pub line: String,
    pub error: FilterParseError,
}

/// Outcome of parsing a whole list: the typed rules plus every line that was
/// skipped with a real error. Blank lines and comments are not reported.
#[derive(Debug, Default)]
pub struct ParsedFilterList {
    pub network_filters: Vec<NetworkFilter>,
    pub cosmetic_filters: Vec<CosmeticFilter>,
    pub content_filters: Vec<ContentFilter>,
    pub errors: Vec<LineError>,
}

impl ParsedFilterList {
    pub fn rule_count(&self) -> usize {
        self.network_filters.len() + self.cosmetic_filters.len() + self.content_filters.len()
    }
}

/// Parses every line of `list`. Failures are collected, never propagated.
pub fn parse_filters(list: &str, filter_list_id: FilterListId) -> ParsedFilterList {
    let mut parsed = ParsedFilterList::default();

    for (i, line) in list.lines().enumerate() {
        match parse_filter(line, filter_list_id) {
            Ok(ParsedFilter::Network(f)) => parsed.network_filters.push(f),
            Ok(ParsedFilter::Cosmetic(f)) => parsed.cosmetic_filters.push(f),
            Ok(ParsedFilter::Content(f)) => parsed.content_filters.push(f),
            Err(FilterParseError::Empty) | Err(FilterParseError::NotSupported) => {}
            Err(error) => {
                log::debug!("skipping rule {:?}: {}", line, error);
                parsed.errors.push(LineError {
                    line_number: i + 1,
                    line: line.trim().to_string(),
                    error,
                });
            }
        }
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_filter_types() {
        assert_eq!(detect_filter_type("! comment"), FilterType::NotSupported);
        assert_eq!(detect_filter_type("[Adblock Plus 2.0]"), FilterType::NotSupported);
        assert_eq!(detect_filter_type("||example.com^"), FilterType::Network);
        assert_eq!(detect_filter_type("@@||example.com^"), FilterType::Network);
        assert_eq!(detect_filter_type("-ad-banner."), FilterType::Network);
        assert_eq!(detect_filter_type("##.banner"), FilterType::Cosmetic);
        assert_eq!(detect_filter_type("site.com#@#.banner"), FilterType::Cosmetic);
        assert_eq!(
            detect_filter_type("site.com$$div[id=\"ad\"]"),
            FilterType::Content
        );
        assert_eq!(
            detect_filter_type("site.com#?#.banner:-abp-has(div)"),
            FilterType::NotSupported
        );
    }

    #[test]
    fn network_option_dollar_is_not_a_content_marker() {
        assert_eq!(
            detect_filter_type("||example.com^$third-party"),
            FilterType::Network
        );
    }

    #[test]
    fn parse_preserves_rule_text() {
        let parsed = parse_filter("||example.com^$third-party", 3).unwrap();
        assert_eq!(parsed.raw_line(), "||example.com^$third-party");
        match parsed {
            ParsedFilter::Network(f) => assert_eq!(f.filter_list_id, 3),
            _ => panic!("expected a network filter"),
        }
    }

    #[test]
    fn malformed_lines_do_not_abort_parsing() {
        let list = "\
! a comment

||good.example^
||bad.example^$unknownoption
##.banner
site.com$$div[id=\"ad\"]
";
        let parsed = parse_filters(list, 0);
        assert_eq!(parsed.network_filters.len(), 1);
        assert_eq!(parsed.cosmetic_filters.len(), 1);
        assert_eq!(parsed.content_filters.len(), 1);
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].line_number, 4);
        assert_eq!(parsed.rule_count(), 3);
    }
}
