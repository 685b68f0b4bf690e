#![deny(clippy::all, warnings)]
#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

//! Shared vocabulary for the hoard content store.
//!
//! The only type that matters here is [`ContentHash`]: an opaque fixed-width
//! key with a canonical string encoding that is safe to embed in filenames.
//! The store never interprets hash bytes; it compares them and uses the
//! encoding as a path fragment.

pub mod hash;

pub use hash::{ContentHash, HashParseError, CONTENT_HASH_LEN};
