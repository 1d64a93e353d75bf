use super::{FencingToken, LeaseAcquireResult, LeaseState, LeaseStore, LeaseStoreError, LeaseTicket};
use crate::clock::{to_chrono, SharedClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct LeaseRecord {
    token: u64,
    holder_expires: Option<DateTime<Utc>>,
    last_acquired_at: Option<DateTime<Utc>>,
    last_released_at: Option<DateTime<Utc>>,
}

impl LeaseRecord {
    fn state(&self) -> LeaseState {
        LeaseState {
            expires: self.holder_expires,
            last_acquired_at: self.last_acquired_at,
            last_released_at: self.last_released_at,
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.holder_expires.is_some_and(|expires| expires > now)
    }
}

/// Lease store kept in process memory.
///
/// Shared between scheduler instances through an `Arc`, it stands in for the
/// external store in tests. `set_available(false)` simulates an outage.
pub struct InMemoryLeaseStore {
    clock: SharedClock,
    records: Mutex<HashMap<String, LeaseRecord>>,
    available: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Invalidates the current holder as if another process had taken over.
    pub fn revoke(&self, lease_id: &str) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(lease_id) {
            record.token += 1;
            record.holder_expires = None;
        }
    }

    fn check_available(&self) -> Result<(), LeaseStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LeaseStoreError::Unavailable(
                "in-memory store switched off".to_string(),
            ))
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        lease_id: &str,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseStoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(lease_id.to_string()).or_default();

        if record.is_live(now) {
            return Ok(LeaseAcquireResult::NotAcquired {
                state: record.state(),
            });
        }

        let expires = now + to_chrono(duration);
        record.token += 1;
        record.holder_expires = Some(expires);
        record.last_acquired_at = Some(now);

        Ok(LeaseAcquireResult::Acquired {
            ticket: LeaseTicket {
                lease_id: lease_id.to_string(),
                token: FencingToken(record.token),
                expires,
            },
            state: record.state(),
        })
    }

    async fn try_renew(
        &self,
        ticket: &LeaseTicket,
        duration: Duration,
    ) -> Result<LeaseAcquireResult, LeaseStoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = records.get_mut(&ticket.lease_id) else {
            return Ok(LeaseAcquireResult::NotAcquired {
                state: LeaseState::default(),
            });
        };

        if record.token != ticket.token.0 || record.holder_expires.is_none() {
            return Ok(LeaseAcquireResult::NotAcquired {
                state: record.state(),
            });
        }

        let expires = now + to_chrono(duration);
        record.holder_expires = Some(expires);

        Ok(LeaseAcquireResult::Acquired {
            ticket: LeaseTicket {
                expires,
                ..ticket.clone()
            },
            state: record.state(),
        })
    }

    async fn release(
        &self,
        ticket: &LeaseTicket,
    ) -> Result<Option<DateTime<Utc>>, LeaseStoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(&ticket.lease_id) {
            Some(record) if record.token == ticket.token.0 && record.holder_expires.is_some() => {
                record.holder_expires = None;
                record.last_released_at = Some(now);
                Ok(Some(now))
            }
            _ => Ok(None),
        }
    }

    async fn describe(&self, lease_id: &str) -> Result<Option<LeaseState>, LeaseStoreError> {
        self.check_available()?;
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(lease_id).map(LeaseRecord::state))
    }
}
