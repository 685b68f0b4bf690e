#![deny(clippy::all, warnings)]

//! Content-addressed filesystem store.
//!
//! Maps opaque content hashes to directory subtrees and coordinates
//! concurrent construction of those subtrees across threads and cooperating
//! processes sharing one POSIX filesystem. Every key is in exactly one of
//! three states, encoded purely with filesystem primitives so it survives
//! process restarts:
//!
//! - `Missing`: nothing on disk for the key;
//! - `Pending`: `pending-<hash>/` exists and one producer is assembling the
//!   result inside it;
//! - `Complete`: `complete-<hash>` is a relative symlink to a read-only
//!   `item-<output_hash>/` directory.
//!
//! Byte-identical outputs collapse to a single item regardless of how many
//! input keys produced them, and completed items are sealed by recursively
//! clearing write permissions. Waiters on a pending key receive one-shot
//! [`Subscription`] handles resolved through a filesystem watch with a
//! periodic polling fallback.

pub mod store;

pub use store::{
    BuildOutcome, Construct, ConstructOrWait, ContentStore, Item, KeyStatus, Lookup, LookupOrWait,
    StoreError, StoreListing, Subscription,
};
