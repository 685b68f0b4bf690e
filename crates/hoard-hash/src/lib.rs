#![deny(clippy::all, warnings)]

//! Deterministic directory-tree hashing.
//!
//! The store consumes tree hashing through the [`TreeHasher`] trait and never
//! assumes a particular digest; [`CanonicalTreeHasher`] is the default
//! implementation used when the caller does not supply one.

mod tree;

pub use tree::{CanonicalTreeHasher, TreeHasher};
