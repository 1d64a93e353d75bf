use super::{Lease, LeaseAcquireResult, LeaseState, LeaseStore, LeaseStoreError, LeaseTicket};
use crate::server::metrics;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long leases are granted for and how often holders renew them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaseOptions {
    pub duration: Duration,
    pub renew_every: Duration,
}

/// Accepted range for the renewal fraction of a lease duration.
pub const RENEW_FRACTION_RANGE: RangeInclusive<f64> = 0.1..=0.9;

impl LeaseOptions {
    /// Renews every `duration * renew_fraction`. Fractions outside
    /// [`RENEW_FRACTION_RANGE`] are clamped into it, with a warning.
    pub fn new(duration: Duration, renew_fraction: f64) -> Self {
        let fraction =
            renew_fraction.clamp(*RENEW_FRACTION_RANGE.start(), *RENEW_FRACTION_RANGE.end());
        if fraction != renew_fraction {
            warn!(
                "Lease renew fraction {} is outside {:?}, using {}",
                renew_fraction, RENEW_FRACTION_RANGE, fraction
            );
        }
        Self {
            duration,
            renew_every: duration.mul_f64(fraction),
        }
    }
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 1.0 / 3.0)
    }
}

/// Releases a ticket that was never wrapped into a [`Lease`]. Runs on its own
/// task so it completes even if the caller is dropped meanwhile.
fn release_unwrapped(store: Arc<dyn LeaseStore>, ticket: LeaseTicket) -> JoinHandle<()> {
    tokio::spawn(async move {
        match store.release(&ticket).await {
            Ok(_) => debug!(
                "Released unwrapped lease {} (token {})",
                ticket.lease_id, ticket.token
            ),
            Err(e) => warn!(
                "Failed to release unwrapped lease {}, it will lapse at {}: {}",
                ticket.lease_id, ticket.expires, e
            ),
        }
    })
}

/// Acquires leases from a store and wraps them into self-renewing handles.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    options: LeaseOptions,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, options: LeaseOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> LeaseOptions {
        self.options
    }

    /// Attempts to acquire `lease_id`.
    ///
    /// Always returns a handle: an acquired one linked to `cancel` (cancelling
    /// it releases the lease), or an unacquired one exposing the observed
    /// holder expiry for pacing. Store failures count as "not acquired".
    pub async fn acquire(&self, lease_id: &str, cancel: &CancellationToken) -> Lease {
        if cancel.is_cancelled() {
            return Lease::unacquired(lease_id, LeaseState::default(), Arc::clone(&self.store));
        }

        let result = match self.try_acquire_detached(lease_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Lease store error acquiring {}: {}", lease_id, e);
                metrics::record_lease_acquisition(lease_id, "error");
                return Lease::unacquired(lease_id, LeaseState::default(), Arc::clone(&self.store));
            }
        };

        match result {
            LeaseAcquireResult::Acquired { ticket, state } => {
                if cancel.is_cancelled() {
                    let _ = release_unwrapped(Arc::clone(&self.store), ticket).await;
                    metrics::record_lease_acquisition(lease_id, "cancelled");
                    return Lease::unacquired(lease_id, state, Arc::clone(&self.store));
                }

                debug!(
                    "Acquired lease {} (token {}, expires {})",
                    lease_id, ticket.token, ticket.expires
                );
                metrics::record_lease_acquisition(lease_id, "acquired");
                Lease::acquired(
                    ticket,
                    state,
                    Arc::clone(&self.store),
                    cancel,
                    self.options.duration,
                    self.options.renew_every,
                )
            }
            LeaseAcquireResult::NotAcquired { state } => {
                debug!(
                    "Lease {} held elsewhere (expires {:?})",
                    lease_id, state.expires
                );
                metrics::record_lease_acquisition(lease_id, "contended");
                Lease::unacquired(lease_id, state, Arc::clone(&self.store))
            }
        }
    }

    /// Runs the store call on its own task. If the caller stops waiting for
    /// it, a ticket granted afterwards is released instead of leaking until
    /// it expires.
    async fn try_acquire_detached(
        &self,
        lease_id: &str,
    ) -> Result<LeaseAcquireResult, LeaseStoreError> {
        let (tx, rx) = oneshot::channel();
        let store = Arc::clone(&self.store);
        let lease_id = lease_id.to_string();
        let duration = self.options.duration;

        tokio::spawn(async move {
            let result = store.try_acquire(&lease_id, duration).await;
            if let Err(Ok(LeaseAcquireResult::Acquired { ticket, .. })) = tx.send(result) {
                debug!("Acquisition of lease {} was abandoned", ticket.lease_id);
                let _ = release_unwrapped(store, ticket).await;
            }
        });

        rx.await.unwrap_or_else(|_| {
            Err(LeaseStoreError::Unavailable(
                "acquisition task ended without a result".to_string(),
            ))
        })
    }

    /// Like [`LeaseManager::acquire`], but first reads the lease metadata and
    /// asks `predicate` whether an attempt is worthwhile. Returns `None`
    /// without touching the lock when the predicate declines or the metadata
    /// cannot be read.
    pub async fn acquire_when<F>(
        &self,
        lease_id: &str,
        predicate: F,
        cancel: &CancellationToken,
    ) -> Option<Lease>
    where
        F: FnOnce(&LeaseState) -> bool,
    {
        let state = match self.store.describe(lease_id).await {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                warn!("Lease store error describing {}: {}", lease_id, e);
                metrics::record_lease_acquisition(lease_id, "error");
                return None;
            }
        };

        if !predicate(&state) {
            metrics::record_lease_acquisition(lease_id, "skipped");
            return None;
        }

        Some(self.acquire(lease_id, cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::lease::InMemoryLeaseStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    fn make_manager(options: LeaseOptions) -> (LeaseManager, Arc<InMemoryLeaseStore>) {
        let clock = TokioClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let store = Arc::new(InMemoryLeaseStore::new(Arc::new(clock)));
        (LeaseManager::new(store.clone(), options), store)
    }

    fn short_options() -> LeaseOptions {
        LeaseOptions::new(Duration::from_secs(9), 1.0 / 3.0)
    }

    #[test]
    fn test_renew_fraction_is_clamped() {
        let options = LeaseOptions::new(Duration::from_secs(60), 5.0);
        assert_eq!(options.renew_every, Duration::from_secs(54));
        let options = LeaseOptions::new(Duration::from_secs(60), 0.5);
        assert_eq!(options.renew_every, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_competing_holders_never_both_succeed() {
        let (manager, _store) = make_manager(short_options());
        let token = CancellationToken::new();

        let a = manager.acquire("L", &token).await;
        let b = manager.acquire("L", &token).await;

        assert!(a.is_acquired());
        assert!(!a.validity().is_cancelled());
        assert!(!b.is_acquired());
        assert!(b.validity().is_cancelled());
        assert_eq!(b.expires(), a.expires());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_past_its_duration() {
        let (manager, _store) = make_manager(short_options());
        let token = CancellationToken::new();

        let lease = manager.acquire("L", &token).await;
        let first_expiry = lease.expires().unwrap();

        // Three times the lease duration
        tokio::time::sleep(Duration::from_secs(27)).await;

        assert!(lease.is_held());
        assert!(!lease.validity().is_cancelled());
        assert!(lease.expires().unwrap() > first_expiry);
        assert!(!manager.acquire("L", &token).await.is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_fires_validity() {
        let (manager, store) = make_manager(short_options());
        let token = CancellationToken::new();

        let lease = manager.acquire("L", &token).await;
        let validity = lease.validity();
        store.revoke("L");

        // The next renewal (every 3s) notices the loss without any polling
        tokio::time::timeout(Duration::from_secs(4), validity.cancelled())
            .await
            .expect("validity should fire after renewal failure");

        assert!(lease.is_lost());
        assert!(!lease.is_held());
        assert!(!lease.release().await);
        assert!(!lease.release().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_idempotent() {
        let (manager, store) = make_manager(short_options());
        let token = CancellationToken::new();

        let lease = manager.acquire("L", &token).await;
        assert!(lease.release().await);
        assert!(lease.validity().is_cancelled());
        assert!(!lease.release().await);
        assert!(lease.last_released_at().is_some());

        let state = store.describe("L").await.unwrap().unwrap();
        assert_eq!(state.expires, None);
        assert!(manager.acquire("L", &token).await.is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancellation_releases_lease() {
        let (manager, store) = make_manager(short_options());
        let token = CancellationToken::new();

        let lease = manager.acquire("L", &token).await;
        token.cancel();
        assert!(lease.validity().is_cancelled());

        // Let the renewal task run its release
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = store.describe("L").await.unwrap().unwrap();
        assert_eq!(state.expires, None);
        assert!(state.last_released_at.is_some());
        assert!(!lease.release().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_lease_releases_it() {
        let (manager, store) = make_manager(short_options());
        let token = CancellationToken::new();

        drop(manager.acquire("L", &token).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = store.describe("L").await.unwrap().unwrap();
        assert_eq!(state.expires, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_gets_unacquired_lease() {
        let (manager, store) = make_manager(short_options());
        let token = CancellationToken::new();
        token.cancel();

        let lease = manager.acquire("L", &token).await;
        assert!(!lease.is_acquired());
        assert!(store.describe("L").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_reads_as_not_acquired() {
        let (manager, store) = make_manager(short_options());
        let token = CancellationToken::new();
        store.set_available(false);

        let lease = manager.acquire("L", &token).await;
        assert!(!lease.is_acquired());
        assert!(manager.acquire_when("L", |_| true, &token).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_short_circuits_acquisition() {
        let (manager, store) = make_manager(short_options());
        let token = CancellationToken::new();

        let mut seen = None;
        let lease = manager
            .acquire_when(
                "L",
                |state| {
                    seen = Some(state.clone());
                    false
                },
                &token,
            )
            .await;
        assert!(lease.is_none());
        assert_eq!(seen, Some(LeaseState::default()));
        assert!(store.describe("L").await.unwrap().is_none());

        let lease = manager.acquire_when("L", |_| true, &token).await.unwrap();
        assert!(lease.is_acquired());
    }

    /// Grants leases immediately but takes a second to answer.
    struct SlowAnswerStore {
        inner: InMemoryLeaseStore,
    }

    #[async_trait]
    impl LeaseStore for SlowAnswerStore {
        async fn try_acquire(
            &self,
            lease_id: &str,
            duration: Duration,
        ) -> Result<LeaseAcquireResult, LeaseStoreError> {
            let result = self.inner.try_acquire(lease_id, duration).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            result
        }

        async fn try_renew(
            &self,
            ticket: &LeaseTicket,
            duration: Duration,
        ) -> Result<LeaseAcquireResult, LeaseStoreError> {
            self.inner.try_renew(ticket, duration).await
        }

        async fn release(
            &self,
            ticket: &LeaseTicket,
        ) -> Result<Option<DateTime<Utc>>, LeaseStoreError> {
            self.inner.release(ticket).await
        }

        async fn describe(&self, lease_id: &str) -> Result<Option<LeaseState>, LeaseStoreError> {
            self.inner.describe(lease_id).await
        }
    }

    fn make_slow_manager() -> (LeaseManager, Arc<SlowAnswerStore>) {
        let clock = TokioClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let store = Arc::new(SlowAnswerStore {
            inner: InMemoryLeaseStore::new(Arc::new(clock)),
        });
        (LeaseManager::new(store.clone(), short_options()), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_acquisition_releases_granted_ticket() {
        let (manager, store) = make_slow_manager();
        let token = CancellationToken::new();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), manager.acquire("L", &token)).await;
        assert!(abandoned.is_err());

        // The store granted the ticket while nobody was waiting any more
        tokio::time::sleep(Duration::from_secs(2)).await;
        let state = store.describe("L").await.unwrap().unwrap();
        assert_eq!(state.expires, None);
        assert!(state.last_released_at.is_some());
        assert!(manager.acquire("L", &token).await.is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_acquisition_releases_ticket() {
        let (manager, store) = make_slow_manager();
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            })
        };

        let lease = manager.acquire("L", &token).await;
        canceller.await.unwrap();

        assert!(!lease.is_acquired());
        assert!(lease.validity().is_cancelled());
        let state = store.describe("L").await.unwrap().unwrap();
        assert_eq!(state.expires, None);
        assert!(state.last_released_at.is_some());
    }
}
