//! Lease-based mutual exclusion over a shared store.
//!
//! A lease is a time-bounded, exclusively held named lock. Holders keep it
//! alive by renewing well inside the granted duration; a crashed holder simply
//! stops renewing and its exclusivity lapses when the lease expires.

mod handle;
mod manager;
mod memory_store;
mod sqlite_store;

pub use handle::Lease;
pub use manager::{LeaseManager, LeaseOptions, RENEW_FRACTION_RANGE};
pub use memory_store::InMemoryLeaseStore;
pub use sqlite_store::{SqliteLeaseStore, LEASE_VERSIONED_SCHEMAS};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fencing value proving which acquisition episode a renew/release call
/// belongs to. Strictly increasing per lease id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FencingToken(pub u64);

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One successful acquisition episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTicket {
    pub lease_id: String,
    pub token: FencingToken,
    pub expires: DateTime<Utc>,
}

/// Last-known store metadata for a lease id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseState {
    /// Expiry of the live ticket, if any.
    pub expires: Option<DateTime<Utc>>,
    pub last_acquired_at: Option<DateTime<Utc>>,
    pub last_released_at: Option<DateTime<Utc>>,
}

impl LeaseState {
    /// Best-effort guess of when the current or last holder finished: the
    /// more recent of the live expiry and the last release.
    pub fn completion_estimate(&self) -> Option<DateTime<Utc>> {
        match (self.expires, self.last_released_at) {
            (Some(expires), Some(released)) => Some(expires.max(released)),
            (expires, released) => expires.or(released),
        }
    }
}

/// Outcome of an acquire or renew call. Exactly one shape at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquireResult {
    Acquired {
        ticket: LeaseTicket,
        state: LeaseState,
    },
    /// Someone else holds the lease (or the ticket was lost). `state.expires`
    /// is the current holder's expiry, useful for retry pacing.
    NotAcquired { state: LeaseState },
}

impl LeaseAcquireResult {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseAcquireResult::Acquired { .. })
    }

    pub fn state(&self) -> &LeaseState {
        match self {
            LeaseAcquireResult::Acquired { state, .. } => state,
            LeaseAcquireResult::NotAcquired { state } => state,
        }
    }
}

#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("lease store unavailable: {0}")]
    Unavailable(String),

    #[error("lease store schema is not initialized")]
    NotInitialized,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt lease record for {lease_id}: {reason}")]
    Corrupt { lease_id: String, reason: String },
}

/// Durable atomic lock primitive, linearizable per lease id.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquires `lease_id` if no live ticket exists. Success stamps
    /// `expires = now + duration` and issues a fresh fencing token.
    async fn try_acquire(
        &self,
        lease_id: &str,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseStoreError>;

    /// Extends the ticket. Fails (NotAcquired) when the token no longer matches
    /// the store's current token.
    async fn try_renew(
        &self,
        ticket: &LeaseTicket,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseStoreError>;

    /// Releases the ticket. Returns the release timestamp when the token still
    /// matched, `None` otherwise. Repeated calls are no-ops.
    async fn release(
        &self,
        ticket: &LeaseTicket,
    ) -> Result<Option<DateTime<Utc>>, LeaseStoreError>;

    /// Reads metadata without side effects. `None` if the id was never used.
    async fn describe(&self, lease_id: &str) -> Result<Option<LeaseState>, LeaseStoreError>;
}
