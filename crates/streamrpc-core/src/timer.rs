use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// A resettable deadline shared by everything working on one call.
///
/// Every observed message pushes the deadline out by `delay` through
/// [`refresh`](Self::refresh). Once [`cancel`](Self::cancel) has been called
/// the timer is released: it never fires and further refreshes are ignored.
#[derive(Clone)]
pub struct DeadlineTimer {
    shared: Arc<Shared>,
}

struct Shared {
    delay: Mutex<Option<Duration>>,
    deadline: watch::Sender<Option<Instant>>,
    released: AtomicBool,
}

impl DeadlineTimer {
    /// A timer that fires `delay` from now unless refreshed.
    pub fn new(delay: Duration) -> Self {
        Self::build(Some(delay))
    }

    /// A timer with no deadline. It only ends through [`cancel`](Self::cancel).
    pub fn unbounded() -> Self {
        Self::build(None)
    }

    fn build(delay: Option<Duration>) -> Self {
        let (deadline, _) = watch::channel(delay.map(|d| Instant::now() + d));
        Self {
            shared: Arc::new(Shared {
                delay: Mutex::new(delay),
                deadline,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Push the deadline out to `now + delay`.
    pub fn refresh(&self) {
        if self.is_released() {
            return;
        }
        let delay = *self.lock_delay();
        if let Some(delay) = delay {
            self.shared.deadline.send_replace(Some(Instant::now() + delay));
        }
    }

    /// Replace the delay and restart the countdown from now.
    pub fn reset(&self, delay: Duration) {
        if self.is_released() {
            return;
        }
        *self.lock_delay() = Some(delay);
        self.shared.deadline.send_replace(Some(Instant::now() + delay));
    }

    pub fn delay(&self) -> Option<Duration> {
        *self.lock_delay()
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.shared.deadline.borrow()
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline().is_some_and(|at| at <= Instant::now())
    }

    /// Release the timer. Returns `true` only for the first call.
    pub fn cancel(&self) -> bool {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.deadline.send_replace(None);
        true
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Resolves when the current deadline passes without a refresh.
    ///
    /// Never resolves for an unbounded or released timer.
    pub async fn expired(&self) {
        let mut rx = self.shared.deadline.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = sleep_until(at) => {
                            if self.deadline() == Some(at) {
                                return;
                            }
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return std::future::pending().await;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        return std::future::pending().await;
                    }
                }
            }
        }
    }

    /// Resolves once the timer has been released through
    /// [`cancel`](Self::cancel).
    pub async fn released(&self) {
        let mut rx = self.shared.deadline.subscribe();
        while !self.is_released() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn lock_delay(&self) -> std::sync::MutexGuard<'_, Option<Duration>> {
        self.shared
            .delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DeadlineTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineTimer")
            .field("delay", &self.delay())
            .field("remaining", &self.remaining())
            .field("released", &self.is_released())
            .finish()
    }
}
