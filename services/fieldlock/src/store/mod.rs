//! Polymorphic persistence capabilities.
//!
//! Each store is a capability trait so a cache-backed implementation can be
//! swapped in later, as long as it preserves the atomicity and expiry
//! semantics the Postgres implementations provide.

pub mod fail_count;
pub mod rate;
pub mod session;
