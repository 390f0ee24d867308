//! Filters that take effect at the network request level, including blocking,
//! exception and response/header modification rules.

use memchr::{memchr as find_char, memmem, memrchr as find_char_reverse};
use once_cell::sync::{Lazy, OnceCell};
use regex::{
    bytes::Regex as BytesRegex, bytes::RegexBuilder as BytesRegexBuilder, Regex,
};
use thiserror::Error;

use std::fmt;

use crate::lists::FilterListId;
use crate::request::{self, Request};
use crate::utils::{self, Hash};

#[derive(Debug, Error, PartialEq, Clone)]
pub enum NetworkFilterError {
    #[error("failed to parse filter")]
    FilterParseError,
    #[error("negated badfilter option")]
    NegatedBadFilter,
    #[error("negated important")]
    NegatedImportant,
    #[error("negated match-case")]
    NegatedOptionMatchCase,
    #[error("negated generichide")]
    NegatedGenericHide,
    #[error("negated document")]
    NegatedDocument,
    #[error("generichide without exception")]
    GenericHideWithoutException,
    #[error("elemhide without exception")]
    ElemHideWithoutException,
    #[error("urlblock without exception")]
    UrlBlockWithoutException,
    #[error("genericblock without exception")]
    GenericBlockWithoutException,
    #[error("content modifier without exception")]
    ContentWithoutException,
    #[error("replace with exception")]
    ReplaceWithException,
    #[error("empty csp directive")]
    EmptyCspDirective,
    #[error("forbidden csp directive")]
    ForbiddenCspDirective,
    #[error("invalid replace modifier")]
    InvalidReplaceModifier,
    #[error("invalid cookie modifier")]
    InvalidCookieModifier,
    #[error("multiple modifier options")]
    MultipleModifierOptions,
    #[error("csp with content type")]
    CspWithContentType,
    #[error("unrecognised option")]
    UnrecognisedOption,
    #[error("punycode error")]
    PunycodeError,
    #[error("no supported domains")]
    NoSupportedDomains,
}

bitflags::bitflags! {
    pub struct NetworkFilterMask: u64 {
        const FROM_IMAGE = 1; // 1 << 0;
        const FROM_MEDIA = 1 << 1;
        const FROM_OBJECT = 1 << 2;
        const FROM_OTHER = 1 << 3;
        const FROM_PING = 1 << 4;
        const FROM_SCRIPT = 1 << 5;
        const FROM_STYLESHEET = 1 << 6;
        const FROM_SUBDOCUMENT = 1 << 7;
        const FROM_WEBSOCKET = 1 << 8;
        const FROM_XMLHTTPREQUEST = 1 << 9;
        const FROM_FONT = 1 << 10;
        const FROM_HTTP = 1 << 11;
        const FROM_HTTPS = 1 << 12;

        // Full document rules are not implied by negated types.
        const FROM_DOCUMENT = 1 << 13;

        const THIRD_PARTY = 1 << 14;
        const FIRST_PARTY = 1 << 15;

        const IS_IMPORTANT = 1 << 16;
        const MATCH_CASE = 1 << 17;
        const BAD_FILTER = 1 << 18;
        const IS_EXCEPTION = 1 << 19;

        // Document-level options, meaningful on exception rules only.
        const GENERIC_HIDE = 1 << 20;
        const ELEM_HIDE = 1 << 21;
        const GENERIC_BLOCK = 1 << 22;
        const URL_BLOCK = 1 << 23;
        const CONTENT = 1 << 24;

        // Modifier options; at most one per rule.
        const IS_CSP = 1 << 25;
        const IS_COOKIE = 1 << 26;
        const IS_REPLACE = 1 << 27;

        // Kind of pattern
        const IS_REGEX = 1 << 28;
        const IS_LEFT_ANCHOR = 1 << 29;
        const IS_RIGHT_ANCHOR = 1 << 30;
        const IS_HOSTNAME_ANCHOR = 1 << 31;
        const IS_COMPLETE_REGEX = 1 << 32;
        const IS_HOSTNAME_REGEX = 1 << 33;

        // Includes all request types that are implied by any negated types.
        const FROM_NETWORK_TYPES = Self::FROM_FONT.bits |
            Self::FROM_IMAGE.bits |
            Self::FROM_MEDIA.bits |
            Self::FROM_OBJECT.bits |
            Self::FROM_OTHER.bits |
            Self::FROM_PING.bits |
            Self::FROM_SCRIPT.bits |
            Self::FROM_STYLESHEET.bits |
            Self::FROM_SUBDOCUMENT.bits |
            Self::FROM_WEBSOCKET.bits |
            Self::FROM_XMLHTTPREQUEST.bits;

        const FROM_ALL_TYPES = Self::FROM_NETWORK_TYPES.bits |
            Self::FROM_DOCUMENT.bits;

        // Unless the filter specifies otherwise, all of these are set by default.
        const DEFAULT_OPTIONS = Self::FROM_NETWORK_TYPES.bits |
            Self::FROM_HTTP.bits |
            Self::FROM_HTTPS.bits |
            Self::THIRD_PARTY.bits |
            Self::FIRST_PARTY.bits;

        // Careful with checking for NONE - will always match
        const NONE = 0;
    }
}

impl fmt::Display for NetworkFilterMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:b}", &self)
    }
}

impl From<request::RequestType> for NetworkFilterMask {
    fn from(request_type: request::RequestType) -> NetworkFilterMask {
        match request_type {
            request::RequestType::Beacon => NetworkFilterMask::FROM_PING,
            request::RequestType::Csp => NetworkFilterMask::FROM_OTHER,
            request::RequestType::Document => NetworkFilterMask::FROM_DOCUMENT,
            request::RequestType::Font => NetworkFilterMask::FROM_FONT,
            request::RequestType::Image => NetworkFilterMask::FROM_IMAGE,
            request::RequestType::Media => NetworkFilterMask::FROM_MEDIA,
            request::RequestType::Object => NetworkFilterMask::FROM_OBJECT,
            request::RequestType::Other => NetworkFilterMask::FROM_OTHER,
            request::RequestType::Ping => NetworkFilterMask::FROM_PING,
            request::RequestType::Script => NetworkFilterMask::FROM_SCRIPT,
            request::RequestType::Stylesheet => NetworkFilterMask::FROM_STYLESHEET,
            request::RequestType::Subdocument => NetworkFilterMask::FROM_SUBDOCUMENT,
            request::RequestType::Websocket => NetworkFilterMask::FROM_WEBSOCKET,
            request::RequestType::Xmlhttprequest => NetworkFilterMask::FROM_XMLHTTPREQUEST,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompiledRegex {
    Compiled(BytesRegex),
    MatchAll,
    RegexParsingError(regex::Error),
}

impl CompiledRegex {
    pub fn is_match(&self, pattern: &str) -> bool {
        match &self {
            // simple case for matching everything, e.g. for an empty filter
            CompiledRegex::MatchAll => true,
            // no match if the regex didn't even compile
            CompiledRegex::RegexParsingError(_e) => false,
            CompiledRegex::Compiled(r) => r.is_match(pattern.as_bytes()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterPart {
    Empty,
    Simple(String),
}

impl FilterPart {
    pub fn string_view(&self) -> Option<&str> {
        match &self {
            FilterPart::Empty => None,
            FilterPart::Simple(s) => Some(s),
        }
    }
}

/// A `$cookie=` modifier value: which cookie names the rule applies to, and
/// optional lifetime constraints for the matched cookie instead of outright
/// removal.
#[derive(Debug, Clone)]
pub struct CookieOption {
    matcher: CookieMatcher,
    pub max_age: Option<u64>,
    pub same_site: Option<String>,
}

#[derive(Debug, Clone)]
enum CookieMatcher {
    /// `$cookie` with no value applies to every cookie.
    Any,
    Name(String),
    Pattern(String, OnceCell<Option<Regex>>),
}

impl CookieOption {
    fn parse(value: &str) -> Result<CookieOption, NetworkFilterError> {
        let mut matcher = CookieMatcher::Any;
        let mut max_age = None;
        let mut same_site = None;

        for (i, part) in value.split(';').enumerate() {
            if i == 0 {
                if part.is_empty() {
                    continue;
                }
                matcher = if part.len() > 1 && part.starts_with('/') && part.ends_with('/') {
                    CookieMatcher::Pattern(
                        part[1..part.len() - 1].to_string(),
                        OnceCell::new(),
                    )
                } else {
                    CookieMatcher::Name(part.to_string())
                };
            } else if let Some(age) = part.strip_prefix("maxAge=") {
                max_age =
                    Some(age.parse().map_err(|_| NetworkFilterError::InvalidCookieModifier)?);
            } else if let Some(v) = part.strip_prefix("sameSite=") {
                same_site = Some(v.to_string());
            } else {
                return Err(NetworkFilterError::InvalidCookieModifier);
            }
        }

        Ok(CookieOption {
            matcher,
            max_age,
            same_site,
        })
    }

    /// Checks the given cookie name against the matcher.
    pub fn matches(&self, cookie_name: &str) -> bool {
        match &self.matcher {
            CookieMatcher::Any => true,
            CookieMatcher::Name(name) => name == cookie_name,
            CookieMatcher::Pattern(source, compiled) => compiled
                .get_or_init(|| match Regex::new(source) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        log::warn!("invalid cookie name regex /{}/: {}", source, e);
                        None
                    }
                })
                .as_ref()
                .map(|re| re.is_match(cookie_name))
                .unwrap_or(false),
        }
    }

    /// True when the rule alters the cookie lifetime instead of removing it.
    pub fn is_modifying(&self) -> bool {
        self.same_site.is_some() || self.max_age.map(|age| age > 0).unwrap_or(false)
    }

    pub fn name_pattern(&self) -> String {
        match &self.matcher {
            CookieMatcher::Any => String::new(),
            CookieMatcher::Name(name) => name.clone(),
            CookieMatcher::Pattern(source, _) => format!("/{}/", source),
        }
    }
}

/// A `$replace=/pattern/replacement/flags` modifier: a substitution applied
/// to the response body of matching requests by the response-rewriting
/// collaborator.
#[derive(Debug, Clone)]
pub struct ReplaceOption {
    pub pattern: String,
    pub replacement: String,
    case_insensitive: bool,
    compiled: OnceCell<Option<Regex>>,
}

impl ReplaceOption {
    fn parse(value: &str) -> Result<ReplaceOption, NetworkFilterError> {
        let parts = split_with_escape(value, '/');
        if parts.len() < 2 || parts.len() > 3 {
            return Err(NetworkFilterError::InvalidReplaceModifier);
        }
        let flags = parts.get(2).map(|f| f.as_str()).unwrap_or("");
        if flags.chars().any(|c| c != 'i' && c != 'g') {
            return Err(NetworkFilterError::InvalidReplaceModifier);
        }

        Ok(ReplaceOption {
            pattern: parts[0].clone(),
            replacement: parts[1].clone(),
            case_insensitive: flags.contains('i'),
            compiled: OnceCell::new(),
        })
    }

    /// Applies the substitution to `body`, returning `None` when nothing
    /// changed or the pattern failed to compile.
    pub fn apply(&self, body: &str) -> Option<String> {
        let re = self
            .compiled
            .get_or_init(|| {
                match regex::RegexBuilder::new(&self.pattern)
                    .case_insensitive(self.case_insensitive)
                    .build()
                {
                    Ok(re) => Some(re),
                    Err(e) => {
                        log::warn!("invalid replace pattern /{}/: {}", self.pattern, e);
                        None
                    }
                }
            })
            .as_ref()?;

        let replaced = re.replace_all(body, self.replacement.as_str());
        match replaced {
            std::borrow::Cow::Borrowed(_) => None,
            std::borrow::Cow::Owned(s) => Some(s),
        }
    }
}

/// Splits on `delimiter`, honouring `\`-escaped occurrences. An escaped
/// delimiter is unescaped in the output. A leading delimiter yields no empty
/// first element.
fn split_with_escape(value: &str, delimiter: char) -> Vec<String> {
    let mut parts = vec![];
    let mut current = String::new();
    let mut escaped = false;
    for c in value.chars() {
        if escaped {
            if c != delimiter {
                current.push('\\');
            }
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == delimiter {
            if !current.is_empty() || !parts.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    if !current.is_empty() {
        parts.push(current);
    }
    // a leading delimiter produces one spurious empty element
    if parts.first().map(|p| p.is_empty()).unwrap_or(false) {
        parts.remove(0);
    }
    parts
}

#[derive(Clone, Copy)]
enum NetworkFilterLeftAnchor {
    /// A `||` token, which represents a match to the start of a domain or subdomain segment.
    DoublePipe,
    /// A `|` token, which represents a match to the exact start of the URL.
    SinglePipe,
}

/// Any option that appears on the right side of a network filter as initiated
/// by a `$` character. All `bool` arguments below are `true` if the option
/// stands alone, or `false` if the option is negated using a prepended `~`.
#[derive(Clone)]
enum NetworkFilterOption {
    Domain(Vec<(bool, String)>),
    Badfilter,
    Important,
    MatchCase,
    ThirdParty(bool),
    FirstParty(bool),
    Csp(Option<String>),
    Cookie(String),
    Replace(String),
    Generichide,
    Elemhide,
    Genericblock,
    Urlblock,
    Content,
    Document,
    Image(bool),
    Media(bool),
    Object(bool),
    Other(bool),
    Ping(bool),
    Script(bool),
    Stylesheet(bool),
    Subdocument(bool),
    XmlHttpRequest(bool),
    Websocket(bool),
    Font(bool),
}

impl NetworkFilterOption {
    pub fn is_content_type(&self) -> bool {
        matches!(
            self,
            Self::Document
                | Self::Image(..)
                | Self::Media(..)
                | Self::Object(..)
                | Self::Other(..)
                | Self::Ping(..)
                | Self::Script(..)
                | Self::Stylesheet(..)
                | Self::Subdocument(..)
                | Self::XmlHttpRequest(..)
                | Self::Websocket(..)
                | Self::Font(..)
        )
    }

    pub fn is_modifier(&self) -> bool {
        matches!(self, Self::Csp(..) | Self::Cookie(..) | Self::Replace(..))
    }
}

/// Abstract syntax representation of a network filter. This allows separation
/// of concerns between parsing and interpretation.
struct AbstractNetworkFilter {
    exception: bool,
    left_anchor: Option<NetworkFilterLeftAnchor>,
    right_anchor: bool,
    pattern: String,
    options: Option<Vec<NetworkFilterOption>>,
}

impl AbstractNetworkFilter {
    fn parse(line: &str) -> Result<Self, NetworkFilterError> {
        let mut filter_index_start: usize = 0;
        let mut filter_index_end: usize = line.len();

        let mut exception = false;
        if line.starts_with("@@") {
            filter_index_start += 2;
            exception = true;
        }

        let mut options = None;
        if let Some(options_index) = find_options_delimiter(line, filter_index_start) {
            filter_index_end = options_index;

            // slicing here is safe; the first byte after '$' will be a character boundary
            let raw_options = &line[filter_index_end + 1..];
            options = Some(parse_filter_options(raw_options)?);
        }

        let left_anchor = if line[filter_index_start..].starts_with("||") {
            filter_index_start += 2;
            Some(NetworkFilterLeftAnchor::DoublePipe)
        } else if line[filter_index_start..].starts_with('|') {
            filter_index_start += 1;
            Some(NetworkFilterLeftAnchor::SinglePipe)
        } else {
            None
        };

        let mut right_anchor = false;
        if filter_index_end > filter_index_start && line[..filter_index_end].ends_with('|') {
            filter_index_end -= 1;
            right_anchor = true;
        }

        Ok(AbstractNetworkFilter {
            exception,
            left_anchor,
            right_anchor,
            pattern: line[filter_index_start..filter_index_end].to_string(),
            options,
        })
    }
}

/// Locates the `$` that separates the pattern from its options, ignoring a
/// regex-rule body (`/.../`) that may itself contain dollar signs and
/// `\$`-escaped delimiters.
fn find_options_delimiter(line: &str, start: usize) -> Option<usize> {
    let pattern = &line[start..];
    // a fully-regex rule without options has no delimiter to find
    if pattern.len() > 1
        && pattern.starts_with('/')
        && pattern.ends_with('/')
        && !pattern.contains("replace=")
    {
        return None;
    }

    let mut search_end = line.len();
    loop {
        let candidate = find_char_reverse(b'$', line[..search_end].as_bytes())?;
        if candidate < start {
            return None;
        }
        if candidate > 0 && line.as_bytes().get(candidate - 1) == Some(&b'\\') {
            search_end = candidate;
            continue;
        }
        // ignore a trailing dollar sign; it belongs to the pattern
        if candidate == line.len() - 1 {
            search_end = candidate;
            continue;
        }
        return Some(candidate);
    }
}

fn parse_filter_options(raw_options: &str) -> Result<Vec<NetworkFilterOption>, NetworkFilterError> {
    let mut result = vec![];

    for raw_option in raw_options.split(',') {
        // Check for negation: ~option
        let negation = raw_option.starts_with('~');
        let maybe_negated_option = raw_option.trim_start_matches('~');

        // Check for options: option=value1|value2
        let mut option_and_values = maybe_negated_option.splitn(2, '=');
        let (option, value) = (
            option_and_values.next().unwrap(),
            option_and_values.next().unwrap_or_default(),
        );

        result.push(match (option, negation) {
            ("domain", _) | ("from", _) => {
                let mut domains: Vec<(bool, String)> = vec![];
                for domain in value.split('|') {
                    let (enabled, domain) = match domain.strip_prefix('~') {
                        Some(negated_domain) => (false, negated_domain),
                        None => (true, domain),
                    };
                    // regex-valued domains are not supported
                    if domain.is_empty() || (domain.starts_with('/') && domain.ends_with('/')) {
                        continue;
                    }
                    let ascii = crate::url_parser::to_ascii_hostname(&domain.to_lowercase())
                        .ok_or(NetworkFilterError::PunycodeError)?;
                    domains.push((enabled, ascii));
                }
                if domains.is_empty() {
                    return Err(NetworkFilterError::NoSupportedDomains);
                }
                NetworkFilterOption::Domain(domains)
            }
            ("badfilter", true) => return Err(NetworkFilterError::NegatedBadFilter),
            ("badfilter", false) => NetworkFilterOption::Badfilter,
            ("important", true) => return Err(NetworkFilterError::NegatedImportant),
            ("important", false) => NetworkFilterOption::Important,
            ("match-case", true) => return Err(NetworkFilterError::NegatedOptionMatchCase),
            ("match-case", false) => NetworkFilterOption::MatchCase,
            ("third-party", negated) | ("3p", negated) => NetworkFilterOption::ThirdParty(!negated),
            ("first-party", negated) | ("1p", negated) => NetworkFilterOption::FirstParty(!negated),
            ("csp", _) => NetworkFilterOption::Csp(if !value.is_empty() {
                Some(String::from(value))
            } else {
                None
            }),
            ("cookie", _) => NetworkFilterOption::Cookie(String::from(value)),
            ("replace", _) => NetworkFilterOption::Replace(String::from(value)),
            ("generichide", true) | ("ghide", true) => {
                return Err(NetworkFilterError::NegatedGenericHide)
            }
            ("generichide", false) | ("ghide", false) => NetworkFilterOption::Generichide,
            ("elemhide", _) | ("ehide", _) => NetworkFilterOption::Elemhide,
            ("genericblock", _) => NetworkFilterOption::Genericblock,
            ("urlblock", _) => NetworkFilterOption::Urlblock,
            ("content", _) => NetworkFilterOption::Content,
            ("document", true) | ("doc", true) => return Err(NetworkFilterError::NegatedDocument),
            ("document", false) | ("doc", false) => NetworkFilterOption::Document,
            ("image", negated) => NetworkFilterOption::Image(!negated),
            ("media", negated) => NetworkFilterOption::Media(!negated),
            ("object", negated) | ("object-subrequest", negated) => {
                NetworkFilterOption::Object(!negated)
            }
            ("other", negated) => NetworkFilterOption::Other(!negated),
            ("ping", negated) | ("beacon", negated) => NetworkFilterOption::Ping(!negated),
            ("script", negated) => NetworkFilterOption::Script(!negated),
            ("stylesheet", negated) | ("css", negated) => NetworkFilterOption::Stylesheet(!negated),
            ("subdocument", negated) | ("frame", negated) => {
                NetworkFilterOption::Subdocument(!negated)
            }
            ("xmlhttprequest", negated) | ("xhr", negated) => {
                NetworkFilterOption::XmlHttpRequest(!negated)
            }
            ("websocket", negated) => NetworkFilterOption::Websocket(!negated),
            ("font", negated) => NetworkFilterOption::Font(!negated),
            (_, _) => return Err(NetworkFilterError::UnrecognisedOption),
        });
    }
    Ok(result)
}

/// Ensure that no invalid option combinations were provided for a filter.
fn validate_options(
    options: &[NetworkFilterOption],
    exception: bool,
) -> Result<(), NetworkFilterError> {
    let mut has_csp = false;
    let mut has_content_type = false;
    let mut modifier_options = 0;
    for option in options {
        if option.is_modifier() {
            modifier_options += 1;
            if matches!(option, NetworkFilterOption::Csp(..)) {
                has_csp = true;
            }
        } else if option.is_content_type() {
            has_content_type = true;
        }
        match option {
            NetworkFilterOption::Csp(None) if !exception => {
                return Err(NetworkFilterError::EmptyCspDirective)
            }
            NetworkFilterOption::Csp(Some(directive)) => {
                let directive = directive.to_lowercase();
                if directive.contains("report-uri") || directive.contains("report-to") {
                    return Err(NetworkFilterError::ForbiddenCspDirective);
                }
            }
            NetworkFilterOption::Replace(..) if exception => {
                return Err(NetworkFilterError::ReplaceWithException)
            }
            NetworkFilterOption::Generichide if !exception => {
                return Err(NetworkFilterError::GenericHideWithoutException)
            }
            NetworkFilterOption::Elemhide if !exception => {
                return Err(NetworkFilterError::ElemHideWithoutException)
            }
            NetworkFilterOption::Urlblock if !exception => {
                return Err(NetworkFilterError::UrlBlockWithoutException)
            }
            NetworkFilterOption::Genericblock if !exception => {
                return Err(NetworkFilterError::GenericBlockWithoutException)
            }
            NetworkFilterOption::Content if !exception => {
                return Err(NetworkFilterError::ContentWithoutException)
            }
            _ => {}
        }
    }
    if has_csp && has_content_type {
        return Err(NetworkFilterError::CspWithContentType);
    }
    if modifier_options > 1 {
        return Err(NetworkFilterError::MultipleModifierOptions);
    }

    Ok(())
}

/// A parsed network rule: URL pattern, request-type and party constraints,
/// domain scoping and at most one modifier option.
#[derive(Debug, Clone)]
pub struct NetworkFilter {
    pub mask: NetworkFilterMask,
    pub filter: FilterPart,
    pub hostname: Option<String>,
    pub opt_domains: Option<Vec<Hash>>,
    pub opt_not_domains: Option<Vec<Hash>>,
    /// Raw value of the `$csp`, `$cookie` or `$replace` option.
    pub modifier_option: Option<String>,
    pub cookie: Option<CookieOption>,
    pub replace: Option<ReplaceOption>,

    /// The longest literal run of the pattern; an indexing hint only,
    /// correctness never depends on it.
    pub shortcut: Option<String>,

    /// The verbatim rule line; rule identity for add/remove and reporting.
    pub raw_line: String,
    pub filter_list_id: FilterListId,
    pub id: Hash,

    /// For a `$badfilter` rule, the id of the rule it disables.
    pub(crate) badfilter_target: Option<Hash>,

    regex: OnceCell<CompiledRegex>,
}

impl PartialEq for NetworkFilter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for NetworkFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{}", self.raw_line)
    }
}

impl NetworkFilter {
    pub fn parse(line: &str, filter_list_id: FilterListId) -> Result<Self, NetworkFilterError> {
        let parsed = AbstractNetworkFilter::parse(line)?;

        // Represent options as a bitmask
        let mut mask: NetworkFilterMask = NetworkFilterMask::THIRD_PARTY
            | NetworkFilterMask::FIRST_PARTY
            | NetworkFilterMask::FROM_HTTPS
            | NetworkFilterMask::FROM_HTTP;

        // Temporary masks for positive (e.g.: $script) and negative
        // (e.g.: $~script) content type options.
        let mut cpt_mask_positive: NetworkFilterMask = NetworkFilterMask::NONE;
        let mut cpt_mask_negative: NetworkFilterMask = NetworkFilterMask::NONE;

        let mut hostname: Option<String> = None;

        let mut opt_domains: Option<Vec<Hash>> = None;
        let mut opt_not_domains: Option<Vec<Hash>> = None;

        let mut modifier_option: Option<String> = None;
        let mut cookie: Option<CookieOption> = None;
        let mut replace: Option<ReplaceOption> = None;

        if parsed.exception {
            mask.set(NetworkFilterMask::IS_EXCEPTION, true);
        }

        if let Some(options) = parsed.options {
            validate_options(&options, parsed.exception)?;

            macro_rules! apply_content_type {
                ($content_type:ident, $enabled:ident) => {
                    if $enabled {
                        cpt_mask_positive.set(NetworkFilterMask::$content_type, true);
                    } else {
                        cpt_mask_negative.set(NetworkFilterMask::$content_type, true);
                    }
                };
            }

            for option in options {
                match option {
                    NetworkFilterOption::Domain(mut domains) => {
                        // Some rules have duplicate domain options - avoid
                        // including duplicates.
                        domains.sort_unstable();
                        domains.dedup();
                        // A domain both permitted and restricted collapses to
                        // restricted: the explicit restriction wins.
                        let restricted: Vec<&String> = domains
                            .iter()
                            .filter(|(enabled, _)| !enabled)
                            .map(|(_, d)| d)
                            .collect();
                        let mut opt_domains_array: Vec<Hash> = vec![];
                        let mut opt_not_domains_array: Vec<Hash> = vec![];

                        for (enabled, domain) in domains.iter() {
                            let domain_hash = utils::fast_hash(domain);
                            if !enabled {
                                opt_not_domains_array.push(domain_hash);
                            } else if !restricted.contains(&domain) {
                                opt_domains_array.push(domain_hash);
                            }
                        }

                        if !opt_domains_array.is_empty() {
                            opt_domains_array.sort_unstable();
                            opt_domains = Some(opt_domains_array);
                        }
                        if !opt_not_domains_array.is_empty() {
                            opt_not_domains_array.sort_unstable();
                            opt_not_domains = Some(opt_not_domains_array);
                        }
                    }
                    NetworkFilterOption::Badfilter => mask.set(NetworkFilterMask::BAD_FILTER, true),
                    NetworkFilterOption::Important => {
                        mask.set(NetworkFilterMask::IS_IMPORTANT, true)
                    }
                    NetworkFilterOption::MatchCase => mask.set(NetworkFilterMask::MATCH_CASE, true),
                    NetworkFilterOption::ThirdParty(false)
                    | NetworkFilterOption::FirstParty(true) => {
                        mask.set(NetworkFilterMask::THIRD_PARTY, false)
                    }
                    NetworkFilterOption::ThirdParty(true)
                    | NetworkFilterOption::FirstParty(false) => {
                        mask.set(NetworkFilterMask::FIRST_PARTY, false)
                    }
                    NetworkFilterOption::Csp(value) => {
                        mask.set(NetworkFilterMask::IS_CSP, true);
                        // CSP rules apply to documents and subdocuments only.
                        mask.set(NetworkFilterMask::FROM_DOCUMENT, true);
                        cpt_mask_positive.set(NetworkFilterMask::FROM_DOCUMENT, true);
                        cpt_mask_positive.set(NetworkFilterMask::FROM_SUBDOCUMENT, true);
                        modifier_option = value;
                    }
                    NetworkFilterOption::Cookie(value) => {
                        mask.set(NetworkFilterMask::IS_COOKIE, true);
                        // cookies ride on document navigations as well
                        mask.set(NetworkFilterMask::FROM_DOCUMENT, true);
                        cookie = Some(CookieOption::parse(&value)?);
                        modifier_option = Some(value);
                    }
                    NetworkFilterOption::Replace(value) => {
                        mask.set(NetworkFilterMask::IS_REPLACE, true);
                        // response bodies of document loads are rewritable too
                        mask.set(NetworkFilterMask::FROM_DOCUMENT, true);
                        replace = Some(ReplaceOption::parse(&value)?);
                        modifier_option = Some(value);
                    }
                    NetworkFilterOption::Generichide => {
                        mask.set(NetworkFilterMask::GENERIC_HIDE, true);
                        cpt_mask_positive.set(NetworkFilterMask::FROM_DOCUMENT, true);
                    }
                    NetworkFilterOption::Elemhide => {
                        mask.set(NetworkFilterMask::ELEM_HIDE, true);
                        cpt_mask_positive.set(NetworkFilterMask::FROM_DOCUMENT, true);
                    }
                    NetworkFilterOption::Genericblock => {
                        mask.set(NetworkFilterMask::GENERIC_BLOCK, true);
                        cpt_mask_positive.set(NetworkFilterMask::FROM_DOCUMENT, true);
                    }
                    NetworkFilterOption::Urlblock => {
                        mask.set(NetworkFilterMask::URL_BLOCK, true);
                        cpt_mask_positive.set(NetworkFilterMask::FROM_DOCUMENT, true);
                    }
                    NetworkFilterOption::Content => {
                        mask.set(NetworkFilterMask::CONTENT, true);
                        cpt_mask_positive.set(NetworkFilterMask::FROM_DOCUMENT, true);
                    }
                    NetworkFilterOption::Document => {
                        cpt_mask_positive.set(NetworkFilterMask::FROM_DOCUMENT, true);
                        if parsed.exception {
                            // a document exception whitelists the page wholesale
                            mask.set(NetworkFilterMask::URL_BLOCK, true);
                            mask.set(NetworkFilterMask::ELEM_HIDE, true);
                            mask.set(NetworkFilterMask::CONTENT, true);
                        }
                    }
                    NetworkFilterOption::Image(enabled) => apply_content_type!(FROM_IMAGE, enabled),
                    NetworkFilterOption::Media(enabled) => apply_content_type!(FROM_MEDIA, enabled),
                    NetworkFilterOption::Object(enabled) => {
                        apply_content_type!(FROM_OBJECT, enabled)
                    }
                    NetworkFilterOption::Other(enabled) => apply_content_type!(FROM_OTHER, enabled),
                    NetworkFilterOption::Ping(enabled) => apply_content_type!(FROM_PING, enabled),
                    NetworkFilterOption::Script(enabled) => {
                        apply_content_type!(FROM_SCRIPT, enabled)
                    }
                    NetworkFilterOption::Stylesheet(enabled) => {
                        apply_content_type!(FROM_STYLESHEET, enabled)
                    }
                    NetworkFilterOption::Subdocument(enabled) => {
                        apply_content_type!(FROM_SUBDOCUMENT, enabled)
                    }
                    NetworkFilterOption::XmlHttpRequest(enabled) => {
                        apply_content_type!(FROM_XMLHTTPREQUEST, enabled)
                    }
                    NetworkFilterOption::Websocket(enabled) => {
                        apply_content_type!(FROM_WEBSOCKET, enabled)
                    }
                    NetworkFilterOption::Font(enabled) => apply_content_type!(FROM_FONT, enabled),
                }
            }
        }

        mask |= cpt_mask_positive;

        // If any negated "network" types were set, then implicitly enable all
        // network types. The negated types are removed again below.
        if (cpt_mask_negative & NetworkFilterMask::FROM_NETWORK_TYPES) != NetworkFilterMask::NONE {
            mask |= NetworkFilterMask::FROM_NETWORK_TYPES;
        }
        // If no positive types were set, the filter applies to all network types.
        if (cpt_mask_positive & NetworkFilterMask::FROM_ALL_TYPES).is_empty() {
            mask |= NetworkFilterMask::FROM_NETWORK_TYPES;
        }

        match parsed.left_anchor {
            Some(NetworkFilterLeftAnchor::DoublePipe) => {
                mask.set(NetworkFilterMask::IS_HOSTNAME_ANCHOR, true)
            }
            Some(NetworkFilterLeftAnchor::SinglePipe) => {
                mask.set(NetworkFilterMask::IS_LEFT_ANCHOR, true)
            }
            None => (),
        }

        let mut end_url_anchor = false;
        if parsed.right_anchor {
            mask.set(NetworkFilterMask::IS_RIGHT_ANCHOR, true);
            end_url_anchor = true;
        }

        let pattern = &parsed.pattern;

        if pattern.len() > 1 && pattern.starts_with('/') && pattern.ends_with('/') {
            mask.set(NetworkFilterMask::IS_COMPLETE_REGEX, true);
        }

        let (mut filter_index_start, mut filter_index_end) = (0, pattern.len());

        if mask.contains(NetworkFilterMask::IS_HOSTNAME_ANCHOR) {
            // Split the hostname from the rest of the pattern at the first
            // '/', '^' or '*' character.
            let first_separator = pattern
                .as_bytes()
                .iter()
                .position(|&b| b == b'/' || b == b'^' || b == b'*');
            match first_separator {
                None => {
                    hostname = Some(pattern.clone());
                    filter_index_start = filter_index_end;
                }
                Some(first_separator_start) => {
                    if pattern[first_separator_start..].starts_with('*') {
                        // the hostname boundary itself is a wildcard
                        mask.set(NetworkFilterMask::IS_HOSTNAME_REGEX, true);
                    }

                    hostname = Some(String::from(&pattern[..first_separator_start]));
                    filter_index_start = first_separator_start;

                    if filter_index_end - filter_index_start == 1
                        && pattern[filter_index_start..].starts_with('^')
                    {
                        // `||hostname^` - the separator pins the hostname to a
                        // full label; any path is accepted.
                        filter_index_start = filter_index_end;
                        mask.set(NetworkFilterMask::IS_RIGHT_ANCHOR, true);
                    } else {
                        mask.set(NetworkFilterMask::IS_LEFT_ANCHOR, true);
                    }
                }
            }
        }

        // Remove trailing '*'
        if filter_index_end > filter_index_start && pattern[..filter_index_end].ends_with('*') {
            filter_index_end -= 1;
            mask.set(NetworkFilterMask::IS_RIGHT_ANCHOR, false);
        }

        // Remove leading '*' if the filter is not hostname anchored.
        if filter_index_end > filter_index_start && pattern[filter_index_start..].starts_with('*') {
            mask.set(NetworkFilterMask::IS_LEFT_ANCHOR, false);
            filter_index_start += 1;
        }

        // Transform filters on protocol (http, https, ws)
        if mask.contains(NetworkFilterMask::IS_LEFT_ANCHOR)
            && !mask.contains(NetworkFilterMask::IS_HOSTNAME_ANCHOR)
        {
            if filter_index_end == filter_index_start + 5
                && pattern[filter_index_start..].starts_with("ws://")
            {
                mask.set(NetworkFilterMask::FROM_WEBSOCKET, true);
                mask.set(NetworkFilterMask::FROM_HTTP, false);
                mask.set(NetworkFilterMask::FROM_HTTPS, false);
                mask.set(NetworkFilterMask::IS_LEFT_ANCHOR, false);
                filter_index_start = filter_index_end;
            } else if filter_index_end == filter_index_start + 7
                && pattern[filter_index_start..].starts_with("http://")
            {
                mask.set(NetworkFilterMask::FROM_HTTP, true);
                mask.set(NetworkFilterMask::FROM_HTTPS, false);
                mask.set(NetworkFilterMask::IS_LEFT_ANCHOR, false);
                filter_index_start = filter_index_end;
            } else if filter_index_end == filter_index_start + 8
                && pattern[filter_index_start..].starts_with("https://")
            {
                mask.set(NetworkFilterMask::FROM_HTTPS, true);
                mask.set(NetworkFilterMask::FROM_HTTP, false);
                mask.set(NetworkFilterMask::IS_LEFT_ANCHOR, false);
                filter_index_start = filter_index_end;
            }
        }

        let filter_str = &pattern[filter_index_start..filter_index_end];
        if !mask.contains(NetworkFilterMask::IS_COMPLETE_REGEX) {
            mask.set(NetworkFilterMask::IS_REGEX, check_is_regex(filter_str));
        }

        let filter: Option<String> = if !filter_str.is_empty() {
            if mask.contains(NetworkFilterMask::MATCH_CASE)
                || mask.contains(NetworkFilterMask::IS_COMPLETE_REGEX)
            {
                // a regex body must be preserved verbatim; case folding is
                // handled at compile time instead
                Some(String::from(filter_str))
            } else {
                Some(filter_str.to_ascii_lowercase())
            }
        } else {
            None
        };

        let hostname_decoded = hostname
            .map(|host| {
                let hostname_normalised = if mask.contains(NetworkFilterMask::IS_HOSTNAME_ANCHOR) {
                    host.trim_start_matches("www.")
                } else {
                    &host
                };

                let lowercase = hostname_normalised.to_lowercase();
                if lowercase.is_ascii() {
                    Ok(lowercase)
                } else {
                    idna::domain_to_ascii(&lowercase)
                        .map_err(|_| NetworkFilterError::PunycodeError)
                }
            })
            .transpose()?;

        // `||example.com^` with no explicit types also blocks document
        // navigations to the host.
        if (cpt_mask_positive & NetworkFilterMask::FROM_ALL_TYPES).is_empty()
            && (cpt_mask_negative & NetworkFilterMask::FROM_ALL_TYPES).is_empty()
            && mask.contains(NetworkFilterMask::IS_HOSTNAME_ANCHOR)
            && mask.contains(NetworkFilterMask::IS_RIGHT_ANCHOR)
            && !end_url_anchor
        {
            mask |= NetworkFilterMask::FROM_ALL_TYPES;
        }
        // Finally, apply any explicitly negated request types
        mask &= !cpt_mask_negative;

        let badfilter_target = if mask.contains(NetworkFilterMask::BAD_FILTER) {
            Some(utils::fast_hash(&strip_badfilter_option(line)))
        } else {
            None
        };

        let shortcut = compute_shortcut(&mask, filter.as_deref(), hostname_decoded.as_deref());

        Ok(NetworkFilter {
            mask,
            filter: match filter {
                Some(simple_filter) => FilterPart::Simple(simple_filter),
                None => FilterPart::Empty,
            },
            hostname: hostname_decoded,
            opt_domains,
            opt_not_domains,
            modifier_option,
            cookie,
            replace,
            shortcut,
            raw_line: String::from(line),
            filter_list_id,
            id: utils::fast_hash(line),
            badfilter_target,
            regex: OnceCell::new(),
        })
    }

    /// Candidate index tokens of this rule. The outer `Vec` allows a rule
    /// with no usable pattern token to be dispatched into one bucket per
    /// `$domain=` value instead of the fallback bucket.
    pub fn get_tokens(&self) -> Vec<Vec<Hash>> {
        let mut tokens: Vec<Hash> = Vec::with_capacity(utils::TOKENS_BUFFER_SIZE);

        // Get tokens from the filter pattern
        if let FilterPart::Simple(f) = &self.filter {
            if !self.is_complete_regex() {
                let skip_last_token = !self.is_right_anchor();
                let skip_first_token =
                    !self.is_left_anchor() && !self.mask.contains(NetworkFilterMask::IS_HOSTNAME_ANCHOR);

                let lowercased;
                let f = if self.match_case() {
                    lowercased = f.to_ascii_lowercase();
                    &lowercased
                } else {
                    f
                };
                let mut filter_tokens = utils::tokenize_filter(f, skip_first_token, skip_last_token);
                tokens.append(&mut filter_tokens);
            }
        }

        // Append tokens from the hostname, if any
        if !self.mask.contains(NetworkFilterMask::IS_HOSTNAME_REGEX) {
            if let Some(hostname) = self.hostname.as_ref() {
                let mut hostname_tokens = utils::tokenize(hostname);
                tokens.append(&mut hostname_tokens);
            }
        }

        // If we got no tokens for the filter/hostname part, then we will
        // dispatch this filter in multiple buckets based on the domains option.
        if tokens.is_empty() && self.opt_domains.is_some() && self.opt_not_domains.is_none() {
            self.opt_domains
                .as_ref()
                .map(|domains| domains.iter().map(|&d| vec![d]).collect())
                .unwrap_or_default()
        } else {
            // Add an optional token for protocol-restricted filters
            if self.for_http() && !self.for_https() {
                tokens.push(utils::fast_hash("http"));
            } else if self.for_https() && !self.for_http() {
                tokens.push(utils::fast_hash("https"));
            }
            tokens.shrink_to_fit();
            vec![tokens]
        }
    }

    pub fn is_exception(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_EXCEPTION)
    }

    pub fn is_hostname_anchor(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_HOSTNAME_ANCHOR)
    }

    pub fn is_right_anchor(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_RIGHT_ANCHOR)
    }

    pub fn is_left_anchor(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_LEFT_ANCHOR)
    }

    fn match_case(&self) -> bool {
        self.mask.contains(NetworkFilterMask::MATCH_CASE)
    }

    pub fn is_important(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_IMPORTANT)
    }

    pub fn is_badfilter(&self) -> bool {
        self.mask.contains(NetworkFilterMask::BAD_FILTER)
    }

    pub fn is_generic_hide(&self) -> bool {
        self.mask.contains(NetworkFilterMask::GENERIC_HIDE)
    }

    pub fn is_elem_hide(&self) -> bool {
        self.mask.contains(NetworkFilterMask::ELEM_HIDE)
    }

    pub fn is_generic_block(&self) -> bool {
        self.mask.contains(NetworkFilterMask::GENERIC_BLOCK)
    }

    pub fn is_url_block(&self) -> bool {
        self.mask.contains(NetworkFilterMask::URL_BLOCK)
    }

    pub fn is_content_exception(&self) -> bool {
        self.mask.contains(NetworkFilterMask::CONTENT)
    }

    /// True for exception rules that disable some class of per-document
    /// filtering rather than matching individual requests.
    pub fn is_document_level(&self) -> bool {
        self.mask.intersects(
            NetworkFilterMask::GENERIC_HIDE
                | NetworkFilterMask::ELEM_HIDE
                | NetworkFilterMask::GENERIC_BLOCK
                | NetworkFilterMask::URL_BLOCK
                | NetworkFilterMask::CONTENT,
        )
    }

    pub fn is_regex(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_REGEX)
    }

    pub fn is_complete_regex(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_COMPLETE_REGEX)
    }

    pub fn is_csp(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_CSP)
    }

    pub fn is_cookie(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_COOKIE)
    }

    pub fn is_replace(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_REPLACE)
    }

    pub fn is_modifier(&self) -> bool {
        self.is_csp() || self.is_cookie() || self.is_replace()
    }

    /// True when the rule carries a non-empty `$domain=` scoping option.
    pub fn is_domain_specific(&self) -> bool {
        self.opt_domains.is_some()
    }

    fn third_party(&self) -> bool {
        self.mask.contains(NetworkFilterMask::THIRD_PARTY)
    }

    fn first_party(&self) -> bool {
        self.mask.contains(NetworkFilterMask::FIRST_PARTY)
    }

    fn for_http(&self) -> bool {
        self.mask.contains(NetworkFilterMask::FROM_HTTP)
    }

    fn for_https(&self) -> bool {
        self.mask.contains(NetworkFilterMask::FROM_HTTPS)
    }

    fn check_cpt_allowed(&self, cpt: request::RequestType) -> bool {
        match NetworkFilterMask::from(cpt) {
            // Exception rules without an explicit `$document` option still
            // apply to document requests.
            NetworkFilterMask::FROM_DOCUMENT => {
                self.mask.contains(NetworkFilterMask::FROM_DOCUMENT) || self.is_exception()
            }
            mask => self.mask.contains(mask),
        }
    }

    fn regex(&self) -> &CompiledRegex {
        self.regex.get_or_init(|| {
            let compiled = compile_regex(
                &self.filter,
                self.is_right_anchor(),
                self.is_left_anchor(),
                self.is_complete_regex(),
                // regex bodies keep their original case but are matched
                // against the lowercased URL
                self.is_complete_regex() && !self.match_case(),
            );
            if let CompiledRegex::RegexParsingError(e) = &compiled {
                log::warn!("rule {} has an unusable pattern: {}", self.raw_line, e);
            }
            compiled
        })
    }

    /// Checks whether this rule matches the request: domain scoping first,
    /// then request type, party and scheme flags, then the URL pattern.
    pub fn matches(&self, request: &Request) -> bool {
        check_options(self, request) && check_pattern(self, request)
    }
}

/// Rebuilds a `$badfilter` rule's text without the badfilter option, to
/// identify the rule it disables.
fn strip_badfilter_option(line: &str) -> String {
    line.replace("$badfilter,", "$")
        .replace(",badfilter", "")
        .replace("$badfilter", "")
}

fn compute_shortcut(
    mask: &NetworkFilterMask,
    filter: Option<&str>,
    hostname: Option<&str>,
) -> Option<String> {
    let mut shortcut: Option<String> = None;
    if let Some(f) = filter {
        if !mask.contains(NetworkFilterMask::IS_COMPLETE_REGEX) {
            let skip_last_token = !mask.contains(NetworkFilterMask::IS_RIGHT_ANCHOR);
            let skip_first_token = !mask.contains(NetworkFilterMask::IS_LEFT_ANCHOR)
                && !mask.contains(NetworkFilterMask::IS_HOSTNAME_ANCHOR);
            shortcut = utils::longest_token(f, skip_first_token, skip_last_token);
        }
    }
    if !mask.contains(NetworkFilterMask::IS_HOSTNAME_REGEX) {
        if let Some(h) = hostname {
            if let Some(host_token) = utils::longest_token(h, false, false) {
                if shortcut.as_ref().map(|s| s.len()).unwrap_or(0) < host_token.len() {
                    shortcut = Some(host_token);
                }
            }
        }
    }
    shortcut
}

/// Compiles a filter pattern to a regex. This is only performed *lazily* for
/// filters containing at least a * or ^ symbol.
pub(crate) fn compile_regex(
    filter: &FilterPart,
    is_right_anchor: bool,
    is_left_anchor: bool,
    is_complete_regex: bool,
    case_insensitive: bool,
) -> CompiledRegex {
    // Escape special regex characters: |.$+?{}()[]\
    static SPECIAL_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"([\|\.\$\+\?\{\}\(\)\[\]\\])").unwrap());
    // * can match anything
    static WILDCARD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*").unwrap());
    // ^ can match any separator or the end of the pattern
    static ANCHOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\^(.)").unwrap());
    static ANCHOR_RE_EOL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\^$").unwrap());

    let filter_str = match filter {
        FilterPart::Empty => return CompiledRegex::MatchAll,
        FilterPart::Simple(s) if s.is_empty() => return CompiledRegex::MatchAll,
        FilterPart::Simple(s) => s,
    };

    let pattern = if is_complete_regex {
        // unescape unrecognised escaping sequences, otherwise a normal regex
        filter_str[1..filter_str.len() - 1]
            .replace("\\/", "/")
            .replace("\\:", ":")
    } else {
        let repl = SPECIAL_RE.replace_all(filter_str, "\\$1");
        let repl = WILDCARD_RE.replace_all(&repl, ".*");
        // in adblock rules, '^' is a separator: anything but a letter, a
        // digit, or one of `_ - . %`
        let repl = ANCHOR_RE.replace_all(&repl, "(?:[^\\w\\d\\._%-])$1");
        let repl = ANCHOR_RE_EOL.replace_all(&repl, "(?:[^\\w\\d\\._%-]|$)");

        let left_anchor = if is_left_anchor { "^" } else { "" };
        let right_anchor = if is_right_anchor { "$" } else { "" };
        format!("{}{}{}", left_anchor, repl, right_anchor)
    };

    match BytesRegexBuilder::new(&pattern)
        .unicode(false)
        .case_insensitive(case_insensitive)
        .build()
    {
        Ok(compiled) => CompiledRegex::Compiled(compiled),
        Err(e) => CompiledRegex::RegexParsingError(e),
    }
}

/// Check if the pattern between the two indices is a regex filter (it
/// contains a '*' or '^' char).
fn check_is_regex(filter: &str) -> bool {
    let start_index = find_char(b'*', filter.as_bytes());
    let separator_index = find_char(b'^', filter.as_bytes());
    start_index.is_some() || separator_index.is_some()
}

/// Handle hostname anchored filters, given 'hostname' from ||hostname and
/// request's hostname, check if there is a match. This is tricky because
/// filter authors rely on different assumptions. We can have prefix or suffix
/// matches of the anchor.
fn is_anchored_by_hostname(
    filter_hostname: &str,
    hostname: &str,
    wildcard_filter_hostname: bool,
) -> bool {
    let filter_hostname_len = filter_hostname.len();
    // Corner-case, if `filterHostname` is empty, then it's a match
    if filter_hostname_len == 0 {
        return true;
    }
    let hostname_len = hostname.len();

    if filter_hostname_len > hostname_len {
        // `filterHostname` cannot be longer than the actual hostname
        false
    } else if filter_hostname_len == hostname_len {
        // If they have the same len(), they should be equal
        filter_hostname == hostname
    } else if let Some(match_index) = memmem::find(hostname.as_bytes(), filter_hostname.as_bytes())
    {
        if match_index == 0 {
            // `filter_hostname` is a prefix of `hostname` and needs to match a
            // full label, e.g. (foo, foo.com) or (sub.foo, sub.foo.com).
            wildcard_filter_hostname
                || filter_hostname.ends_with('.')
                || hostname[filter_hostname_len..].starts_with('.')
        } else if match_index == hostname_len - filter_hostname_len {
            // `filter_hostname` is a suffix of `hostname`, e.g.
            // (foo.com, sub.foo.com) or (com, foo.com).
            filter_hostname.starts_with('.') || hostname[match_index - 1..].starts_with('.')
        } else {
            // `filter_hostname` is infix of `hostname` and needs to match full labels
            (wildcard_filter_hostname
                || filter_hostname.ends_with('.')
                || hostname[filter_hostname_len..].starts_with('.'))
                && (filter_hostname.starts_with('.')
                    || hostname[match_index - 1..].starts_with('.'))
        }
    } else {
        // No match
        false
    }
}

fn get_url_after_hostname<'a>(url: &'a str, hostname: &str) -> &'a str {
    let start =
        memmem::find(url.as_bytes(), hostname.as_bytes()).unwrap_or(url.len() - hostname.len());
    &url[start + hostname.len()..]
}

// ---------------------------------------------------------------------------
// Filter matching
// ---------------------------------------------------------------------------

// pattern
fn check_pattern_plain_filter_filter(filter: &NetworkFilter, request: &Request) -> bool {
    let request_url = request.get_url(filter.match_case());
    match &filter.filter {
        FilterPart::Empty => true,
        FilterPart::Simple(f) => memmem::find(request_url.as_bytes(), f.as_bytes()).is_some(),
    }
}

// pattern|
fn check_pattern_right_anchor_filter(filter: &NetworkFilter, request: &Request) -> bool {
    let request_url = request.get_url(filter.match_case());
    match &filter.filter {
        FilterPart::Empty => true,
        FilterPart::Simple(f) => request_url.ends_with(f),
    }
}

// |pattern
fn check_pattern_left_anchor_filter(filter: &NetworkFilter, request: &Request) -> bool {
    let request_url = request.get_url(filter.match_case());
    match &filter.filter {
        FilterPart::Empty => true,
        FilterPart::Simple(f) => request_url.starts_with(f),
    }
}

// |pattern|
fn check_pattern_left_right_anchor_filter(filter: &NetworkFilter, request: &Request) -> bool {
    let request_url = request.get_url(filter.match_case());
    match &filter.filter {
        FilterPart::Empty => true,
        FilterPart::Simple(f) => request_url.as_ref() == f.as_str(),
    }
}

// pattern*^
fn check_pattern_regex_filter_at(filter: &NetworkFilter, request: &Request, start_from: usize) -> bool {
    let request_url = request.get_url(filter.match_case());
    filter.regex().is_match(&request_url[start_from..])
}

fn check_pattern_regex_filter(filter: &NetworkFilter, request: &Request) -> bool {
    check_pattern_regex_filter_at(filter, request, 0)
}

// ||pattern*^
fn check_pattern_hostname_anchor_regex_filter(filter: &NetworkFilter, request: &Request) -> bool {
    let request_url = request.get_url(filter.match_case());
    match filter.hostname.as_ref() {
        Some(hostname) => {
            if is_anchored_by_hostname(
                hostname,
                &request.hostname,
                filter.mask.contains(NetworkFilterMask::IS_HOSTNAME_REGEX),
            ) {
                check_pattern_regex_filter_at(
                    filter,
                    request,
                    memmem::find(request_url.as_bytes(), hostname.as_bytes()).unwrap_or_default()
                        + hostname.len(),
                )
            } else {
                false
            }
        }
        None => false,
    }
}

// ||pattern|
fn check_pattern_hostname_right_anchor_filter(filter: &NetworkFilter, request: &Request) -> bool {
    match filter.hostname.as_ref() {
        Some(hostname) => {
            if is_anchored_by_hostname(
                hostname,
                &request.hostname,
                filter.mask.contains(NetworkFilterMask::IS_HOSTNAME_REGEX),
            ) {
                match &filter.filter {
                    // In this specific case the specified hostname must match
                    // at the end of the hostname of the request. This prevents
                    // a false positive like ||foo.bar matching
                    // https://foo.bar.baz where ||foo.bar^ would not.
                    FilterPart::Empty => {
                        request.hostname.len() == hostname.len()
                            || request.hostname.ends_with(hostname)
                    }
                    _ => check_pattern_right_anchor_filter(filter, request),
                }
            } else {
                false
            }
        }
        None => false,
    }
}

// ||pattern + left-anchor => the pattern must appear exactly after the
// hostname, with nothing in between.
fn check_pattern_hostname_left_anchor_filter(filter: &NetworkFilter, request: &Request) -> bool {
    match filter.hostname.as_ref() {
        Some(hostname) => {
            if is_anchored_by_hostname(
                hostname,
                &request.hostname,
                filter.mask.contains(NetworkFilterMask::IS_HOSTNAME_REGEX),
            ) {
                let request_url = request.get_url(filter.match_case());
                match &filter.filter {
                    FilterPart::Empty => true,
                    FilterPart::Simple(f) => {
                        get_url_after_hostname(&request_url, hostname).starts_with(f)
                    }
                }
            } else {
                false
            }
        }
        None => false,
    }
}

// ||pattern
fn check_pattern_hostname_anchor_filter(filter: &NetworkFilter, request: &Request) -> bool {
    match filter.hostname.as_ref() {
        Some(hostname) => {
            if is_anchored_by_hostname(
                hostname,
                &request.hostname,
                filter.mask.contains(NetworkFilterMask::IS_HOSTNAME_REGEX),
            ) {
                let request_url = request.get_url(filter.match_case());
                match &filter.filter {
                    FilterPart::Empty => true,
                    FilterPart::Simple(f) => {
                        get_url_after_hostname(&request_url, hostname).contains(f)
                    }
                }
            } else {
                false
            }
        }
        None => false,
    }
}

/// Efficiently checks if a certain network filter matches against a network
/// request's URL.
fn check_pattern(filter: &NetworkFilter, request: &Request) -> bool {
    if filter.is_hostname_anchor() {
        if filter.is_regex() {
            check_pattern_hostname_anchor_regex_filter(filter, request)
        } else if filter.is_right_anchor() && filter.is_left_anchor() {
            // must match the entire remainder; reuse the left-anchor path
            // with the right anchor enforced through the compiled regex
            check_pattern_hostname_anchor_regex_filter(filter, request)
        } else if filter.is_right_anchor() {
            check_pattern_hostname_right_anchor_filter(filter, request)
        } else if filter.is_left_anchor() {
            check_pattern_hostname_left_anchor_filter(filter, request)
        } else {
            check_pattern_hostname_anchor_filter(filter, request)
        }
    } else if filter.is_regex() || filter.is_complete_regex() {
        check_pattern_regex_filter(filter, request)
    } else if filter.is_left_anchor() && filter.is_right_anchor() {
        check_pattern_left_right_anchor_filter(filter, request)
    } else if filter.is_left_anchor() {
        check_pattern_left_anchor_filter(filter, request)
    } else if filter.is_right_anchor() {
        check_pattern_right_anchor_filter(filter, request)
    } else {
        check_pattern_plain_filter_filter(filter, request)
    }
}

fn check_options(filter: &NetworkFilter, request: &Request) -> bool {
    // Request origin must be among the permitted domains, and not among the
    // restricted ones; a restriction always wins over a permission. Checked
    // first because a mismatch short-circuits everything else.
    if let Some(excluded_domains) = filter.opt_not_domains.as_ref() {
        if request
            .source_hostname_hashes
            .iter()
            .chain(request.source_entity_hashes.iter())
            .any(|h| utils::bin_lookup(excluded_domains, *h))
        {
            return false;
        }
    }

    if let Some(included_domains) = filter.opt_domains.as_ref() {
        if request
            .source_hostname_hashes
            .iter()
            .chain(request.source_entity_hashes.iter())
            .all(|h| !utils::bin_lookup(included_domains, *h))
        {
            return false;
        }
    }

    // Discard requests based on type, protocol and party.
    if !filter.check_cpt_allowed(request.request_type)
        || (request.is_https && !filter.for_https())
        || (request.is_http && !filter.for_http())
        || (!filter.first_party() && !request.is_third_party)
        || (!filter.third_party() && request.is_third_party)
    {
        return false;
    }

    true
}
