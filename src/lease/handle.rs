use super::{LeaseAcquireResult, LeaseState, LeaseStore, LeaseTicket};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State shared between a lease handle and its renewal task.
struct LeaseShared {
    lease_id: String,
    store: Arc<dyn LeaseStore>,
    /// `None` once released or lost. Taking it out is what makes release
    /// happen at most once.
    ticket: Mutex<Option<LeaseTicket>>,
    state: Mutex<LeaseState>,
    validity: CancellationToken,
    lost: AtomicBool,
}

impl LeaseShared {
    fn current_ticket(&self) -> Option<LeaseTicket> {
        self.ticket.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn take_ticket(&self) -> Option<LeaseTicket> {
        self.ticket.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn update_state(&self, f: impl FnOnce(&mut LeaseState)) {
        f(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()));
    }

    /// Releases the ticket if we still hold it. Fires the validity signal
    /// either way.
    async fn release_once(&self) -> bool {
        let ticket = self.take_ticket();
        self.validity.cancel();

        let Some(ticket) = ticket else {
            return false;
        };

        match self.store.release(&ticket).await {
            Ok(Some(released_at)) => {
                self.update_state(|state| {
                    state.expires = None;
                    state.last_released_at = Some(released_at);
                });
                debug!("Released lease {} (token {})", self.lease_id, ticket.token);
                true
            }
            Ok(None) => {
                debug!(
                    "Lease {} (token {}) was already gone at release",
                    self.lease_id, ticket.token
                );
                false
            }
            Err(e) => {
                warn!("Failed to release lease {}: {}", self.lease_id, e);
                false
            }
        }
    }

    /// Keeps the ticket alive until the validity token fires. A failed renewal
    /// marks the lease lost.
    async fn renew_loop(self: Arc<Self>, duration: Duration, renew_every: Duration) {
        loop {
            tokio::select! {
                _ = self.validity.cancelled() => break,
                _ = tokio::time::sleep(renew_every) => {}
            }

            let Some(ticket) = self.current_ticket() else {
                break;
            };

            match self.store.try_renew(&ticket, duration).await {
                Ok(LeaseAcquireResult::Acquired { ticket: renewed, state }) => {
                    let still_held = {
                        let mut current = self.ticket.lock().unwrap_or_else(|e| e.into_inner());
                        // Released while the renewal was in flight
                        if current.is_some() {
                            *current = Some(renewed);
                        }
                        current.is_some()
                    };
                    if !still_held {
                        break;
                    }
                    self.update_state(|s| *s = state);
                }
                Ok(LeaseAcquireResult::NotAcquired { state }) => {
                    warn!(
                        "Lease {} lost (token {} no longer current)",
                        self.lease_id, ticket.token
                    );
                    self.mark_lost(state);
                    return;
                }
                Err(e) => {
                    warn!("Lease {} lost, renewal failed: {}", self.lease_id, e);
                    self.mark_lost(LeaseState {
                        expires: None,
                        ..self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
                    });
                    return;
                }
            }
        }

        // External cancellation or drop of the handle
        self.release_once().await;
    }

    fn mark_lost(&self, state: LeaseState) {
        if self.take_ticket().is_some() {
            self.lost.store(true, Ordering::SeqCst);
        }
        self.update_state(|s| *s = state);
        self.validity.cancel();
    }
}

/// Handle over one acquisition attempt.
///
/// An acquired lease renews itself in the background until it is released,
/// dropped, lost, or the token it was linked to is cancelled. Its
/// [`validity`](Lease::validity) token fires the moment any of those happens,
/// so work protected by the lease can observe the loss cooperatively.
///
/// An unacquired lease owns nothing; its validity token is already cancelled
/// and it only carries the store state observed during the attempt.
pub struct Lease {
    shared: Arc<LeaseShared>,
    acquired: bool,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl Lease {
    pub(super) fn acquired(
        ticket: LeaseTicket,
        state: LeaseState,
        store: Arc<dyn LeaseStore>,
        parent: &CancellationToken,
        duration: Duration,
        renew_every: Duration,
    ) -> Self {
        let shared = Arc::new(LeaseShared {
            lease_id: ticket.lease_id.clone(),
            store,
            ticket: Mutex::new(Some(ticket)),
            state: Mutex::new(state),
            validity: parent.child_token(),
            lost: AtomicBool::new(false),
        });

        let renewal = tokio::spawn(Arc::clone(&shared).renew_loop(duration, renew_every));

        Self {
            shared,
            acquired: true,
            renewal: Mutex::new(Some(renewal)),
        }
    }

    pub(super) fn unacquired(
        lease_id: &str,
        state: LeaseState,
        store: Arc<dyn LeaseStore>,
    ) -> Self {
        let validity = CancellationToken::new();
        validity.cancel();

        Self {
            shared: Arc::new(LeaseShared {
                lease_id: lease_id.to_string(),
                store,
                ticket: Mutex::new(None),
                state: Mutex::new(state),
                validity,
                lost: AtomicBool::new(false),
            }),
            acquired: false,
            renewal: Mutex::new(None),
        }
    }

    pub fn lease_id(&self) -> &str {
        &self.shared.lease_id
    }

    /// Whether this attempt obtained the lease. Stays true after release or
    /// loss; use [`Lease::is_held`] for the live view.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Whether the ticket is still held (not released, not lost).
    pub fn is_held(&self) -> bool {
        self.shared.current_ticket().is_some()
    }

    /// Whether a renewal found the lease reassigned or unreachable.
    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::SeqCst)
    }

    /// Cancelled as soon as the lease is no longer known to be held.
    pub fn validity(&self) -> CancellationToken {
        self.shared.validity.clone()
    }

    pub fn ticket(&self) -> Option<LeaseTicket> {
        self.shared.current_ticket()
    }

    /// Store state as last observed, renewals included.
    pub fn state(&self) -> LeaseState {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.state().expires
    }

    pub fn last_acquired_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_acquired_at
    }

    pub fn last_released_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_released_at
    }

    /// Releases the lease and waits for the renewal task to wind down.
    ///
    /// Returns true only for the call that actually released a held ticket;
    /// later calls, calls after loss, and calls on an unacquired lease return
    /// false.
    pub async fn release(&self) -> bool {
        let released = self.shared.release_once().await;
        let renewal = self
            .renewal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(renewal) = renewal {
            let _ = renewal.await;
        }
        released
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // The renewal task sees the cancellation and releases the ticket.
        self.shared.validity.cancel();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("lease_id", &self.shared.lease_id)
            .field("acquired", &self.acquired)
            .field("held", &self.is_held())
            .field("lost", &self.is_lost())
            .finish()
    }
}
