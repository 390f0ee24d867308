//! Content-filtering engine core: parses Adblock Plus/AdGuard-syntax filter
//! lists into typed rules, indexes them for fast candidate lookup, and
//! resolves per-request and per-document verdicts with exact exception
//! precedence. Consumed as a library by a surrounding browser/extension
//! runtime; it performs no I/O of its own.

pub mod blocker;
pub mod cache;
pub mod container;
pub mod cosmetic_filter_cache;
pub mod engine;
pub mod filters;
pub mod lists;
pub mod network_filter_list;
pub mod request;
pub mod url_parser;
#[doc(hidden)]
pub mod utils;

pub use blocker::{Blocker, BlockerOptions, BlockerResult, TransformDescriptor};
pub use engine::Engine;
pub use request::Request;
