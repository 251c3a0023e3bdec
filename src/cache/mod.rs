//! Tiered response cache and the resolution engine in front of it.
//!
//! This module provides:
//! - A persistent store partitioned into Static, ApiData and Fallback tiers
//! - Request identities hashed into stable storage keys
//! - Per-class resolution strategies with explicit staleness on every response

mod layer;
mod storage;
mod types;

pub use layer::Resolver;
pub(crate) use layer::STATIC_STALE_AFTER_DAYS;
pub use storage::{CacheStorage, SqliteStorage};
pub use types::{CacheEntry, CacheTier, NegotiationHint, RequestIdentity, Response, Staleness};
