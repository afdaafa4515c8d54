//! # Fieldlock (Lock-Fleet Access Authority)
//!
//! `fieldlock` is the server-side authority for a fleet of field-deployed
//! electromechanical locks. The locks are offline to the server; an
//! operator's handset couriers a one-shot challenge–response MAC that proves
//! the operator is authorized for that lock right now.
//!
//! ## Trust path
//!
//! - **Credentialing** — phone + password login (Argon2id, timing-equalized
//!   failure) mints a bearer token bound to a server-side session.
//! - **Key custody** — per-device AES-128 keys are stored envelope-encrypted
//!   under a process-wide master key and decrypted only for the lifetime of a
//!   single challenge.
//! - **Unlock protocol** — freshness-checked challenges, permission-window
//!   enforcement, and an HMAC-SHA-256-derived device MAC the lock recomputes.
//! - **Abuse containment** — per-identity rate gates with an IP block table,
//!   and per-device consecutive-failure counting that quarantines a lock and
//!   opens an operator alert after three failed unlocks.
//! - **Audit durability** — authenticated actions are published to a durable
//!   queue and batch-inserted by a background consumer, at-least-once.

pub mod api;
pub mod cli;
pub mod domain;
pub mod kms;
pub mod mq;
pub mod password;
pub mod store;
pub mod token;
