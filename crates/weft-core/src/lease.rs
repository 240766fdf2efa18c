//! Lease - time-bound ownership of a dequeued task.
//!
//! Built by the processor from the expiration time the broker returned on dequeue.
//! Every broker write for the task is gated on [`Lease::is_valid`]: once the lease is
//! gone the task belongs to the recovery sweep, not to this process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::ports::Clock;

pub struct Lease {
    expire_at: Mutex<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
    fired: AtomicBool,
    notify: Notify,
}

impl Lease {
    pub fn new(expire_at: DateTime<Utc>, clock: Arc<dyn Clock>) -> Self {
        Self {
            expire_at: Mutex::new(expire_at),
            clock,
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        *self.expire_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `expire_at >= now`
    pub fn is_valid(&self) -> bool {
        self.deadline() >= self.clock.now()
    }

    /// Move the expiration. Returns false (and changes nothing) if the lease has already expired.
    pub fn reset(&self, expire_at: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        let mut guard = self.expire_at.lock().unwrap_or_else(|e| e.into_inner());
        if *guard < now {
            return false;
        }
        *guard = expire_at;
        true
    }

    /// Wake everyone waiting on [`Lease::done`] if the lease has expired.
    ///
    /// Returns false while the lease is still valid. Safe to call any number of times;
    /// waiters are woken once.
    pub fn notify_expiration(&self) -> bool {
        if self.is_valid() {
            return false;
        }
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
        true
    }

    pub fn is_expiration_notified(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Resolves once [`Lease::notify_expiration`] has fired.
    pub async fn done(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_expiration_notified() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep until the deadline and fire the notification, following resets.
    ///
    /// Also returns early if someone else fires the notification first.
    pub async fn expired(&self) {
        loop {
            if self.is_expiration_notified() {
                return;
            }
            let remaining = (self.deadline() - self.clock.now())
                .to_std()
                .unwrap_or_default();
            tokio::select! {
                _ = self.done() => return,
                _ = tokio::time::sleep(remaining) => {}
            }
            // Sleep granularity is coarser than the clock; nudge past the boundary.
            if !self.notify_expiration() && remaining.is_zero() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("expire_at", &self.deadline())
            .field("fired", &self.is_expiration_notified())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;

    fn fixed() -> (FixedClock, DateTime<Utc>) {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (FixedClock::new(t0), t0)
    }

    #[test]
    fn valid_until_and_including_expiration() {
        let (clock, t0) = fixed();
        let lease = Lease::new(t0 + Duration::seconds(10), Arc::new(clock.clone()));

        assert!(lease.is_valid());
        clock.advance(Duration::seconds(10));
        assert!(lease.is_valid());
        clock.advance(Duration::seconds(1));
        assert!(!lease.is_valid());
    }

    #[test]
    fn reset_extends_a_valid_lease_only() {
        let (clock, t0) = fixed();
        let lease = Lease::new(t0 + Duration::seconds(10), Arc::new(clock.clone()));

        assert!(lease.reset(t0 + Duration::seconds(60)));
        assert_eq!(lease.deadline(), t0 + Duration::seconds(60));

        clock.advance(Duration::seconds(61));
        assert!(!lease.reset(t0 + Duration::seconds(120)));
        assert_eq!(lease.deadline(), t0 + Duration::seconds(60));
    }

    #[test]
    fn notify_expiration_is_refused_while_valid() {
        let (clock, t0) = fixed();
        let lease = Lease::new(t0 + Duration::seconds(10), Arc::new(clock.clone()));

        assert!(!lease.notify_expiration());
        assert!(!lease.is_expiration_notified());

        clock.advance(Duration::seconds(11));
        assert!(lease.notify_expiration());
        // 二回目も安全
        assert!(lease.notify_expiration());
        assert!(lease.is_expiration_notified());
    }

    #[tokio::test]
    async fn done_wakes_every_waiter_once_fired() {
        let (clock, t0) = fixed();
        let lease = Arc::new(Lease::new(t0, Arc::new(clock.clone())));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let l = Arc::clone(&lease);
                tokio::spawn(async move { l.done().await })
            })
            .collect();
        tokio::task::yield_now().await;

        clock.advance(Duration::seconds(1));
        assert!(lease.notify_expiration());

        for w in waiters {
            tokio::time::timeout(StdDuration::from_secs(1), w)
                .await
                .expect("waiter woke")
                .unwrap();
        }
        // 発火済みなら即座に返る
        lease.done().await;
    }

    #[tokio::test]
    async fn expired_fires_after_the_deadline() {
        let lease = Lease::new(Utc::now() + Duration::milliseconds(50), Arc::new(SystemClock));

        tokio::time::timeout(StdDuration::from_secs(2), lease.expired())
            .await
            .expect("lease expired in time");
        assert!(!lease.is_valid());
        assert!(lease.is_expiration_notified());
    }
}
