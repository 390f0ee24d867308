//! Small shared helpers: hashing, URL/pattern tokenization and binary search.

use seahash::hash;

pub type Hash = u64;

#[inline]
pub fn fast_hash(input: &str) -> Hash {
    hash(input.as_bytes()) as Hash
}

/// Tokens shorter than this are too common to be useful as index keys.
pub const MIN_TOKEN_LEN: usize = 3;

pub const TOKENS_BUFFER_SIZE: usize = 128;
const TOKENS_MAX: usize = TOKENS_BUFFER_SIZE - 1;

fn is_allowed_filter(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '%'
}

/// Cuts `pattern` into maximal alphanumeric runs and pushes the hash of each
/// run of sufficient length into `tokens_buffer`.
///
/// A run adjacent to a `*` wildcard is skipped: the wildcard may swallow part
/// of the corresponding run in a matching URL, so the run is not guaranteed
/// to appear verbatim. For the same reason `skip_first_token` /
/// `skip_last_token` drop the runs touching the unanchored ends of a filter
/// pattern.
fn fast_tokenizer_no_regex(
    pattern: &str,
    is_allowed_code: &dyn Fn(char) -> bool,
    skip_first_token: bool,
    skip_last_token: bool,
    tokens_buffer: &mut Vec<Hash>,
) {
    let mut inside = false;
    let mut start = 0;
    let mut preceding_ch: Option<char> = None;

    for (i, c) in pattern.char_indices() {
        if tokens_buffer.len() >= TOKENS_MAX {
            return;
        }
        if is_allowed_code(c) {
            if !inside {
                inside = true;
                start = i;
            }
        } else if inside {
            inside = false;
            if (start != 0 || !skip_first_token)
                && i - start >= MIN_TOKEN_LEN
                && c != '*'
                && preceding_ch != Some('*')
            {
                tokens_buffer.push(fast_hash(&pattern[start..i]));
            }
            preceding_ch = Some(c);
        } else {
            preceding_ch = Some(c);
        }
    }

    if !skip_last_token
        && inside
        && pattern.len() - start >= MIN_TOKEN_LEN
        && preceding_ch != Some('*')
    {
        tokens_buffer.push(fast_hash(&pattern[start..]));
    }
}

/// Tokenizes a request URL. The URL is expected to be lowercased already.
pub fn tokenize(pattern: &str) -> Vec<Hash> {
    let mut tokens_buffer: Vec<Hash> = Vec::with_capacity(TOKENS_BUFFER_SIZE);
    fast_tokenizer_no_regex(pattern, &is_allowed_filter, false, false, &mut tokens_buffer);
    tokens_buffer
}

/// Tokenizes a filter pattern, dropping runs that touch an unanchored end.
pub fn tokenize_filter(pattern: &str, skip_first_token: bool, skip_last_token: bool) -> Vec<Hash> {
    let mut tokens_buffer: Vec<Hash> = Vec::with_capacity(TOKENS_BUFFER_SIZE);
    fast_tokenizer_no_regex(
        pattern,
        &is_allowed_filter,
        skip_first_token,
        skip_last_token,
        &mut tokens_buffer,
    );
    tokens_buffer
}

/// The longest literal alphanumeric run of a filter pattern, kept on the rule
/// as its indexing hint. Runs adjacent to wildcards are skipped the same way
/// `tokenize_filter` skips them.
pub fn longest_token(
    pattern: &str,
    skip_first_token: bool,
    skip_last_token: bool,
) -> Option<String> {
    let mut longest: Option<&str> = None;
    let mut inside = false;
    let mut start = 0;
    let mut preceding_ch: Option<char> = None;

    for (i, c) in pattern.char_indices() {
        if is_allowed_filter(c) {
            if !inside {
                inside = true;
                start = i;
            }
        } else if inside {
            inside = false;
            if (start != 0 || !skip_first_token)
                && i - start >= MIN_TOKEN_LEN
                && c != '*'
                && preceding_ch != Some('*')
                && longest.map(|l| l.len()).unwrap_or(0) < i - start
            {
                longest = Some(&pattern[start..i]);
            }
            preceding_ch = Some(c);
        } else {
            preceding_ch = Some(c);
        }
    }
    if !skip_last_token
        && inside
        && pattern.len() - start >= MIN_TOKEN_LEN
        && preceding_ch != Some('*')
        && longest.map(|l| l.len()).unwrap_or(0) < pattern.len() - start
    {
        longest = Some(&pattern[start..]);
    }

    longest.map(|l| l.to_ascii_lowercase())
}

pub fn bin_lookup<T: Ord>(arr: &[T], elt: T) -> bool {
    arr.binary_search(&elt).is_ok()
}

pub fn has_unicode(pattern: &str) -> bool {
    pattern.chars().any(|c| !c.is_ascii())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(tokens: &[&str]) -> Vec<Hash> {
        tokens.iter().map(|t| fast_hash(t)).collect()
    }

    #[test]
    fn tokenize_works() {
        assert_eq!(tokenize("").as_slice(), t(&[]).as_slice());
        assert_eq!(tokenize("foo").as_slice(), t(&["foo"]).as_slice());
        assert_eq!(tokenize("foo/bar").as_slice(), t(&["foo", "bar"]).as_slice());
        assert_eq!(tokenize("foo-bar").as_slice(), t(&["foo", "bar"]).as_slice());
        // too-short runs are not usable keys
        assert_eq!(tokenize("foo.io").as_slice(), t(&["foo"]).as_slice());
        // tokens cannot be surrounded by *
        assert_eq!(tokenize("foo.bar*").as_slice(), t(&["foo"]).as_slice());
        assert_eq!(tokenize("*foo.bar").as_slice(), t(&["bar"]).as_slice());
        assert_eq!(tokenize("*foo.bar*").as_slice(), t(&[]).as_slice());
    }

    #[test]
    fn tokenize_filter_works() {
        assert_eq!(
            tokenize_filter("foo/bar/baz", false, false).as_slice(),
            t(&["foo", "bar", "baz"]).as_slice()
        );
        assert_eq!(
            tokenize_filter("foo/bar/baz", true, false).as_slice(),
            t(&["bar", "baz"]).as_slice()
        );
        assert_eq!(
            tokenize_filter("foo/bar/baz", true, true).as_slice(),
            t(&["bar"]).as_slice()
        );
        assert_eq!(
            tokenize_filter("foo////bar/baz", false, true).as_slice(),
            t(&["foo", "bar"]).as_slice()
        );
    }

    #[test]
    fn longest_token_works() {
        assert_eq!(
            longest_token("/banner/img.png", false, false).as_deref(),
            Some("banner")
        );
        // "ad" is below the length floor
        assert_eq!(longest_token("-ad-.", false, false), None);
        assert_eq!(longest_token("*longrun*", false, false), None);
        assert_eq!(
            longest_token("Tracker.IO/Pixel", false, true).as_deref(),
            Some("tracker")
        );
    }

    #[test]
    fn bin_lookup_works() {
        assert!(!bin_lookup(&[], 42));
        assert!(bin_lookup(&[42], 42));
        assert!(bin_lookup(&[1, 2, 3, 4, 42], 3));
        assert!(!bin_lookup(&[1, 2, 3, 4, 42], 43));
    }

    #[test]
    fn has_unicode_works() {
        assert!(!has_unicode("plain-ascii/url?q=1"));
        assert!(has_unicode("fırstrowsports"));
    }
}
