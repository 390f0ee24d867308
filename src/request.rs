//! Contains structures needed to describe network requests.

use std::borrow::Cow;

use thiserror::Error;

use crate::url_parser;
use crate::utils::{self, Hash};

/// The type of resource requested from the URL endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestType {
    Beacon,
    Csp,
    Document,
    Font,
    Image,
    Media,
    Object,
    Other,
    Ping,
    Script,
    Stylesheet,
    Subdocument,
    Websocket,
    Xmlhttprequest,
}

/// Possible failure reasons when creating a [`Request`].
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("hostname parsing failed")]
    HostnameParseError,
    #[error("invalid Unicode provided")]
    UnicodeDecodingError,
}

fn cpt_match_type(cpt: &str) -> RequestType {
    match cpt {
        "beacon" | "ping" => RequestType::Ping,
        "csp_report" => RequestType::Csp,
        "document" | "main_frame" => RequestType::Document,
        "font" => RequestType::Font,
        "image" | "imageset" => RequestType::Image,
        "media" => RequestType::Media,
        "object" | "object_subrequest" => RequestType::Object,
        "script" => RequestType::Script,
        "stylesheet" => RequestType::Stylesheet,
        "sub_frame" | "subdocument" => RequestType::Subdocument,
        "websocket" => RequestType::Websocket,
        "xhr" | "xmlhttprequest" => RequestType::Xmlhttprequest,
        _ => RequestType::Other,
    }
}

/// A network request as seen by the engine: the URL to check plus the
/// document context it originates from, pre-tokenized for index lookups.
#[derive(Clone, Debug)]
pub struct Request {
    pub request_type: RequestType,

    pub is_http: bool,
    pub is_https: bool,
    pub is_supported: bool,
    pub is_third_party: bool,
    pub url: String,
    pub url_lower_cased: String,
    pub hostname: String,
    pub source_hostname: String,

    pub(crate) tokens: Vec<Hash>,
    pub(crate) source_hostname_hashes: Vec<Hash>,
    pub(crate) source_entity_hashes: Vec<Hash>,
}

impl Request {
    pub(crate) fn get_url(&self, case_sensitive: bool) -> Cow<str> {
        if case_sensitive {
            Cow::Borrowed(&self.url)
        } else {
            Cow::Borrowed(&self.url_lower_cased)
        }
    }

    /// All index keys this request can hit: source hostname hashes first
    /// (for rules bucketed by their single `$domain=` value), then URL
    /// tokens, then the fallback bucket key.
    pub(crate) fn lookup_tokens(&self) -> impl Iterator<Item = &Hash> {
        self.source_hostname_hashes.iter().chain(self.tokens.iter())
    }

    #[allow(clippy::too_many_arguments)]
    fn from_detailed_parameters(
        raw_type: &str,
        url: &str,
        schema: &str,
        hostname: &str,
        source_hostname: &str,
        source_domain: &str,
        third_party: bool,
    ) -> Request {
        let is_http = schema == "http";
        let is_https = !is_http && schema == "https";
        let is_websocket = !is_http && !is_https && (schema == "ws" || schema == "wss");
        let is_supported = is_http || is_https || is_websocket;

        let request_type = if is_websocket {
            RequestType::Websocket
        } else {
            cpt_match_type(raw_type)
        };

        let url_lower_cased = url.to_ascii_lowercase();
        let mut tokens = utils::tokenize(&url_lower_cased);
        // zero token is the fallback bucket, always scanned
        tokens.push(0);

        let (source_hostname_hashes, source_entity_hashes) = if !source_hostname.is_empty() {
            (
                url_parser::get_hostname_hashes_from_labels(source_hostname, source_domain),
                url_parser::get_entity_hashes_from_labels(source_hostname, source_domain),
            )
        } else {
            (vec![], vec![])
        };

        Request {
            request_type,
            url: url.to_owned(),
            url_lower_cased,
            hostname: hostname.to_owned(),
            source_hostname: source_hostname.to_owned(),
            tokens,
            source_hostname_hashes,
            source_entity_hashes,
            is_third_party: third_party,
            is_http,
            is_https,
            is_supported,
        }
    }

    /// Construct a new [`Request`] from raw URLs. Third-partiness is derived
    /// by comparing the registrable domains of the two hosts; a request with
    /// no parseable source is considered third-party.
    pub fn new(url: &str, source_url: &str, request_type: &str) -> Result<Request, RequestError> {
        let parsed_url =
            url_parser::parse_url(url).ok_or(RequestError::HostnameParseError)?;

        match url_parser::parse_url(source_url) {
            Some(parsed_source) => {
                let third_party = parsed_source.domain() != parsed_url.domain();
                Ok(Request::from_detailed_parameters(
                    request_type,
                    &parsed_url.url,
                    parsed_url.schema(),
                    parsed_url.hostname(),
                    parsed_source.hostname(),
                    parsed_source.domain(),
                    third_party,
                ))
            }
            None => Ok(Request::from_detailed_parameters(
                request_type,
                &parsed_url.url,
                parsed_url.schema(),
                parsed_url.hostname(),
                "",
                "",
                true,
            )),
        }
    }

    /// Constructor for callers that already hold parsed hostnames and the
    /// third-party flag, avoiding a second URL parse and suffix lookup.
    pub fn preparsed(
        url: &str,
        hostname: &str,
        source_hostname: &str,
        request_type: &str,
        third_party: bool,
    ) -> Request {
        let splitter = memchr::memchr(b':', url.as_bytes()).unwrap_or(0);
        let schema = &url[..splitter];
        let source_domain = url_parser::host_domain(source_hostname);

        Request::from_detailed_parameters(
            request_type,
            url,
            schema,
            hostname,
            source_hostname,
            source_domain,
            third_party,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fast_hash;

    #[test]
    fn third_partiness_compares_registrable_domains() {
        let request =
            Request::new("https://cdn.example.com/a.js", "https://www.example.com", "script")
                .unwrap();
        assert!(!request.is_third_party);

        let request =
            Request::new("https://tracker.io/pixel", "https://www.example.com", "image").unwrap();
        assert!(request.is_third_party);
    }

    #[test]
    fn missing_source_is_third_party() {
        let request = Request::new("https://tracker.io/pixel", "", "image").unwrap();
        assert!(request.is_third_party);
        assert!(request.source_hostname_hashes.is_empty());
    }

    #[test]
    fn request_types_map_from_webrequest_names() {
        let request = Request::new("https://example.com/", "https://example.com", "main_frame")
            .unwrap();
        assert_eq!(request.request_type, RequestType::Document);
        let request = Request::new("https://example.com/x", "https://example.com", "xhr").unwrap();
        assert_eq!(request.request_type, RequestType::Xmlhttprequest);
    }

    #[test]
    fn websocket_detected_from_scheme() {
        let request = Request::new("wss://example.com/socket", "https://example.com", "other")
            .unwrap();
        assert_eq!(request.request_type, RequestType::Websocket);
        assert!(request.is_supported);
    }

    #[test]
    fn unsupported_scheme_flagged() {
        let request = Request::new("ftp://example.com/f", "https://example.com", "other").unwrap();
        assert!(!request.is_supported);
    }

    #[test]
    fn tokens_include_fallback_bucket() {
        let request =
            Request::new("https://sub.example.com/img-ad-banner.png", "https://sub.example.com", "image")
                .unwrap();
        assert_eq!(request.tokens.last(), Some(&0));
        assert!(request.tokens.contains(&fast_hash("banner")));
        // short runs like "ad" never become index keys
        assert!(!request.tokens.contains(&fast_hash("ad")));
    }
}
