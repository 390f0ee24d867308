//! URL decomposition for the matching engine: scheme, hostname and
//! registrable domain, with punycode normalization of unicode hostnames.

use crate::utils::{self, Hash};

/// A parsed request URL, normalized for matching: lowercased, with a
/// punycode-encoded ASCII hostname.
pub struct RequestUrl {
    pub url: String,
    schema_end: usize,
    hostname_pos: (usize, usize),
    domain: (usize, usize),
}

impl RequestUrl {
    pub fn schema(&self) -> &str {
        &self.url[..self.schema_end]
    }
    pub fn hostname(&self) -> &str {
        &self.url[self.hostname_pos.0..self.hostname_pos.1]
    }
    /// The registrable part of the hostname, e.g. `example.co.uk` for
    /// `sub.example.co.uk`. Falls back to the full hostname for IP
    /// addresses and unlisted suffixes.
    pub fn domain(&self) -> &str {
        &self.url[self.hostname_pos.0 + self.domain.0..self.hostname_pos.0 + self.domain.1]
    }
}

/// Parses a URL, returning `None` for anything the engine cannot match
/// against (no host, unsupported scheme syntax, invalid unicode).
pub fn parse_url(url: &str) -> Option<RequestUrl> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;

    // `url` already lowercases and punycode-encodes the host; the rest of
    // the URL is lowercased later by the caller where case-insensitive
    // matching requires it.
    let url_str = parsed.as_str().to_string();
    let schema_end = parsed.scheme().len();
    let host_start = memchr::memmem::find(url_str.as_bytes(), host.as_bytes())?;
    let host_end = host_start + host.len();
    let domain = get_host_domain(&url_str[host_start..host_end]);

    Some(RequestUrl {
        url: url_str,
        schema_end,
        hostname_pos: (host_start, host_end),
        domain,
    })
}

/// Byte range of the registrable domain within `host`.
pub fn get_host_domain(host: &str) -> (usize, usize) {
    if host.is_empty() {
        return (0, 0);
    }
    match psl::domain_str(host) {
        Some(domain) => (host.len() - domain.len(), host.len()),
        None => (0, host.len()),
    }
}

/// The registrable domain of `host`, as a string slice of it.
pub fn host_domain(host: &str) -> &str {
    let (start, end) = get_host_domain(host);
    &host[start..end]
}

/// Converts a hostname taken from filter text to its ASCII form. Already
/// ASCII hostnames are returned unchanged.
pub fn to_ascii_hostname(hostname: &str) -> Option<String> {
    if hostname.is_ascii() {
        return Some(hostname.to_string());
    }
    idna::domain_to_ascii(hostname).ok()
}

/// Hashes of the hostname and of every dot-separated suffix of it, down to
/// and including the registrable domain. Used for `$domain=` option checks
/// and for hostname-scoped cosmetic rules: a rule domain matches when its
/// hash equals any suffix hash.
pub fn get_hostname_hashes_from_labels(hostname: &str, domain: &str) -> Vec<Hash> {
    let mut hashes = vec![];
    if domain.is_empty() || hostname.len() < domain.len() {
        return hashes;
    }

    let start = hostname.len() - domain.len();
    hashes.push(utils::fast_hash(hostname));
    for (i, c) in hostname[..start].char_indices() {
        if c == '.' {
            hashes.push(utils::fast_hash(&hostname[i + 1..]));
        }
    }
    hashes
}

/// Hashes of the "entity" forms of the hostname: each label chain with the
/// public suffix replaced by `*`, e.g. `example.*` and `sub.example.*` for
/// `sub.example.co.uk`. Matches `$domain=example.*`-style wildcard scoping.
pub fn get_entity_hashes_from_labels(hostname: &str, domain: &str) -> Vec<Hash> {
    let mut hashes = vec![];
    if domain.is_empty() || hostname.len() < domain.len() {
        return hashes;
    }

    // The public suffix is everything after the first label of the domain.
    let suffix_len = match memchr::memchr(b'.', domain.as_bytes()) {
        Some(dot) => domain.len() - dot - 1,
        None => return hashes,
    };
    if suffix_len >= hostname.len() {
        return hashes;
    }

    let labels_end = hostname.len() - suffix_len - 1; // without the trailing '.'
    let labels = &hostname[..labels_end];

    let mut entity = String::with_capacity(labels.len() + 2);
    entity.push_str(labels);
    entity.push_str(".*");
    hashes.push(utils::fast_hash(&entity));

    for (i, c) in labels.char_indices() {
        if c == '.' {
            let mut sub_entity = String::with_capacity(labels.len() - i + 2);
            sub_entity.push_str(&labels[i + 1..]);
            sub_entity.push_str(".*");
            hashes.push(utils::fast_hash(&sub_entity));
        }
    }
    hashes
}
