//! Apiguard - API protection over a pluggable atomic store
//!
//! This crate implements rate limiting (fixed window, sliding window, token
//! bucket, leaky bucket), execute-once idempotency and duplicate-submission
//! suppression. State lives in a [`store::ProtectionStore`], either in-process
//! ([`store::LocalStore`]) or shared through Redis ([`store::DistributedStore`]),
//! behind a [`failure::FailurePolicy`] that decides what happens when the
//! store is unavailable.
//!
//! [`guard::Protection`] wires everything together from a
//! [`config::ProtectionConfig`].

pub mod clock;
pub mod config;
pub mod context;
pub mod duplicate;
pub mod error;
pub mod failure;
pub mod guard;
pub mod idempotency;
pub mod key;
pub mod policy;
pub mod ratelimit;
pub mod store;

pub use error::{ProtectionError, Result};
pub use guard::Protection;
