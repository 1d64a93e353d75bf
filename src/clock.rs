//! Wall-clock abstraction shared by the lease stores and the scheduler.
//!
//! Lease timestamps are wall-clock values because they are compared across
//! processes. The scheduler sleeps with `tokio::time`, so tests pair a paused
//! tokio runtime with [`TokioClock`] to keep both views of time in lockstep.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Provides the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock derived from `tokio::time::Instant`.
///
/// Under `#[tokio::test(start_paused = true)]` it only moves when tokio time
/// advances, which makes every sleep in the scheduler land on an exact
/// timestamp.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_wall: DateTime<Utc>,
    origin_instant: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(origin_wall: DateTime<Utc>) -> Self {
        Self {
            origin_wall,
            origin_instant: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.origin_instant);
        self.origin_wall + to_chrono(elapsed)
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Converts a std duration into a chrono one, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Time left until `target`, zero if it already passed.
pub fn until(now: DateTime<Utc>, target: DateTime<Utc>) -> Duration {
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = TokioClock::new(origin);
        assert_eq!(clock.now(), origin);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.now(), origin + chrono::Duration::seconds(30));
    }

    #[test]
    fn test_until_clamps_at_zero() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(until(now, now - chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(
            until(now, now + chrono::Duration::seconds(5)),
            Duration::from_secs(5)
        );
    }
}
