//! Pausable, resumable, cancelable deadline.
//!
//! A [`Timer`] moves through `stopped → running ⇄ paused → finished` and
//! invokes its callback at most once, on natural expiry. Every illegal
//! transition returns [`TimerError::InvalidTransition`] instead of being
//! silently ignored, so caller bookkeeping bugs surface immediately.
//!
//! The wakeup is a spawned `tokio` sleep task. Each arm/disarm bumps a
//! generation counter under the state lock; a wakeup whose generation is
//! stale does nothing. This is what makes [`Timer::cancel`] win even when
//! the deadline already elapsed and the wakeup task is queued but has not
//! run yet.
//!
//! Dropping a timer that has not finished cancels it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Callback invoked once when the timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Observable timer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// Created, not yet started.
    Stopped,
    /// Started, currently suspended.
    Paused,
    /// Counting down.
    Running,
    /// Fired or canceled. Terminal.
    Finished,
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Timer errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimerError {
    /// Duration was NaN or negative.
    #[error("invalid timer duration: {0}ms")]
    InvalidDuration(f64),

    /// The operation is not valid in the current state.
    #[error("cannot {op} a {status} timer")]
    InvalidTransition {
        /// Attempted operation.
        op: &'static str,
        /// State the timer was in.
        status: TimerStatus,
    },

    /// A finite timer was started outside a tokio runtime.
    #[error("timer requires a tokio runtime")]
    NoRuntime,
}

/// `None` means "never fires".
type Remaining = Option<Duration>;

enum State {
    Stopped {
        remaining: Remaining,
    },
    Paused {
        remaining: Remaining,
        callback: TimerCallback,
    },
    Running {
        remaining: Remaining,
        callback: TimerCallback,
        started_at: Instant,
        wakeup: Option<JoinHandle<()>>,
    },
    Finished,
}

impl State {
    fn status(&self) -> TimerStatus {
        match self {
            Self::Stopped { .. } => TimerStatus::Stopped,
            Self::Paused { .. } => TimerStatus::Paused,
            Self::Running { .. } => TimerStatus::Running,
            Self::Finished => TimerStatus::Finished,
        }
    }
}

struct Inner {
    state: State,
    generation: u64,
}

/// A pausable, resumable, cancelable countdown with one terminal callback.
pub struct Timer {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("status", &self.status())
            .field("remaining", &self.remaining())
            .finish()
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Timer {
    /// Create a timer from a millisecond duration.
    ///
    /// `f64::INFINITY` creates a timer that never fires.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::InvalidDuration`] for NaN, negative, or
    /// unrepresentably large finite values.
    pub fn new(duration_ms: f64) -> Result<Self, TimerError> {
        if duration_ms.is_nan() || duration_ms < 0.0 {
            return Err(TimerError::InvalidDuration(duration_ms));
        }
        let remaining = if duration_ms.is_infinite() {
            None
        } else {
            Some(
                Duration::try_from_secs_f64(duration_ms / 1000.0)
                    .map_err(|_| TimerError::InvalidDuration(duration_ms))?,
            )
        };
        Ok(Self::with_remaining(remaining))
    }

    /// Create a timer from a [`Duration`].
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        Self::with_remaining(Some(duration))
    }

    /// Create a timer that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::with_remaining(None)
    }

    fn with_remaining(remaining: Remaining) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Stopped { remaining },
                generation: 0,
            })),
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TimerStatus {
        lock(&self.inner).state.status()
    }

    /// Time left before expiry. `None` for a never-firing timer, zero once
    /// finished.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        let guard = lock(&self.inner);
        match &guard.state {
            State::Stopped { remaining } | State::Paused { remaining, .. } => *remaining,
            State::Running {
                remaining,
                started_at,
                ..
            } => remaining.map(|r| r.saturating_sub(started_at.elapsed())),
            State::Finished => Some(Duration::ZERO),
        }
    }

    /// Start the countdown.
    ///
    /// # Errors
    ///
    /// Fails unless the timer is stopped, or if a finite timer is started
    /// outside a tokio runtime.
    pub fn start<F>(&self, callback: F) -> Result<(), TimerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = lock(&self.inner);
        let State::Stopped { remaining } = guard.state else {
            return Err(TimerError::InvalidTransition {
                op: "start",
                status: guard.state.status(),
            });
        };
        if remaining.is_some() && tokio::runtime::Handle::try_current().is_err() {
            return Err(TimerError::NoRuntime);
        }
        guard.state = State::Paused {
            remaining,
            callback: Box::new(callback),
        };
        self.arm(&mut guard);
        Ok(())
    }

    /// Suspend the countdown, keeping the time already elapsed.
    ///
    /// # Errors
    ///
    /// Fails unless the timer is running.
    pub fn pause(&self) -> Result<(), TimerError> {
        let mut guard = lock(&self.inner);
        if guard.state.status() != TimerStatus::Running {
            return Err(TimerError::InvalidTransition {
                op: "pause",
                status: guard.state.status(),
            });
        }
        guard.generation = guard.generation.wrapping_add(1);
        let State::Running {
            remaining,
            callback,
            started_at,
            wakeup,
        } = std::mem::replace(&mut guard.state, State::Finished)
        else {
            return Err(TimerError::InvalidTransition {
                op: "pause",
                status: TimerStatus::Finished,
            });
        };
        if let Some(handle) = wakeup {
            handle.abort();
        }
        let remaining = remaining.map(|r| r.saturating_sub(started_at.elapsed()));
        trace!(?remaining, "timer paused");
        guard.state = State::Paused {
            remaining,
            callback,
        };
        Ok(())
    }

    /// Resume a paused countdown from a fresh "now".
    ///
    /// # Errors
    ///
    /// Fails unless the timer is paused.
    pub fn resume(&self) -> Result<(), TimerError> {
        let mut guard = lock(&self.inner);
        if guard.state.status() != TimerStatus::Paused {
            return Err(TimerError::InvalidTransition {
                op: "resume",
                status: guard.state.status(),
            });
        }
        self.arm(&mut guard);
        Ok(())
    }

    /// Stop the timer without invoking the callback.
    ///
    /// # Errors
    ///
    /// Fails unless the timer is running or paused.
    pub fn cancel(&self) -> Result<(), TimerError> {
        let mut guard = lock(&self.inner);
        match guard.state.status() {
            TimerStatus::Running | TimerStatus::Paused => {},
            status => {
                return Err(TimerError::InvalidTransition {
                    op: "cancel",
                    status,
                });
            },
        }
        Self::disarm(&mut guard);
        Ok(())
    }

    /// Move a paused timer to running and schedule its wakeup.
    fn arm(&self, guard: &mut MutexGuard<'_, Inner>) {
        let State::Paused {
            remaining,
            callback,
        } = std::mem::replace(&mut guard.state, State::Finished)
        else {
            return;
        };
        guard.generation = guard.generation.wrapping_add(1);
        let generation = guard.generation;

        let wakeup = remaining.map(|delay| {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                fire(&inner, generation);
            })
        });

        guard.state = State::Running {
            remaining,
            callback,
            started_at: Instant::now(),
            wakeup,
        };
    }

    fn disarm(guard: &mut MutexGuard<'_, Inner>) {
        guard.generation = guard.generation.wrapping_add(1);
        if let State::Running {
            wakeup: Some(handle),
            ..
        } = std::mem::replace(&mut guard.state, State::Finished)
        {
            handle.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut guard = lock(&self.inner);
        if matches!(
            guard.state.status(),
            TimerStatus::Running | TimerStatus::Paused
        ) {
            Self::disarm(&mut guard);
        }
    }
}

/// Wakeup path. Runs the callback only if `generation` is still current.
fn fire(inner: &Mutex<Inner>, generation: u64) {
    let callback = {
        let mut guard = lock(inner);
        if guard.generation != generation {
            return;
        }
        match std::mem::replace(&mut guard.state, State::Finished) {
            State::Running { callback, .. } => callback,
            other => {
                guard.state = other;
                return;
            },
        }
    };
    trace!("timer expired");
    callback();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn rejects_nan_and_negative_durations() {
        assert!(matches!(
            Timer::new(f64::NAN),
            Err(TimerError::InvalidDuration(_))
        ));
        assert!(matches!(
            Timer::new(-1.0),
            Err(TimerError::InvalidDuration(_))
        ));
        assert!(Timer::new(0.0).is_ok());
        assert!(Timer::new(f64::INFINITY).is_ok());
        assert_eq!(Timer::new(f64::INFINITY).unwrap().remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once_after_duration() {
        let timer = Timer::new(1000.0).unwrap();
        let (count, cb) = counter();
        timer.start(cb).unwrap();
        assert_eq!(timer.status(), TimerStatus::Running);

        tokio::time::sleep(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timer.status(), TimerStatus::Finished);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_fires_immediately() {
        let timer = Timer::new(0.0).unwrap();
        let (count, cb) = counter();
        timer.start(cb).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_timer_never_fires() {
        let timer = Timer::never();
        let (count, cb) = counter();
        timer.start(cb).unwrap();
        assert_eq!(timer.status(), TimerStatus::Running);

        tokio::time::sleep(Duration::from_secs(60 * 60 * 24 * 365)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.status(), TimerStatus::Running);

        timer.pause().unwrap();
        timer.resume().unwrap();
        timer.cancel().unwrap();
        assert_eq!(timer.status(), TimerStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_preserve_elapsed_budget() {
        let timer = Timer::new(1000.0).unwrap();
        let (count, cb) = counter();
        timer.start(cb).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        timer.pause().unwrap();
        assert_eq!(timer.remaining(), Some(Duration::from_millis(600)));

        // Time spent paused is not charged.
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.status(), TimerStatus::Paused);

        timer.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(599)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_callback() {
        let timer = Timer::new(100.0).unwrap();
        let (count, cb) = counter();
        timer.start(cb).unwrap();
        timer.cancel().unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.status(), TimerStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_beats_an_already_elapsed_wakeup() {
        let timer = Timer::new(10.0).unwrap();
        let (count, cb) = counter();
        timer.start(cb).unwrap();
        let stale_generation = lock(&timer.inner).generation;

        timer.cancel().unwrap();
        // Simulate the wakeup task being dispatched after the cancel.
        fire(&timer.inner, stale_generation);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.status(), TimerStatus::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn illegal_transitions_fail_loudly() {
        let timer = Timer::new(100.0).unwrap();
        assert!(timer.pause().is_err());
        assert!(timer.resume().is_err());
        assert!(timer.cancel().is_err());

        timer.start(|| {}).unwrap();
        assert!(timer.start(|| {}).is_err());
        assert!(timer.resume().is_err());

        timer.pause().unwrap();
        assert_eq!(
            timer.pause(),
            Err(TimerError::InvalidTransition {
                op: "pause",
                status: TimerStatus::Paused
            })
        );

        timer.cancel().unwrap();
        assert!(timer.cancel().is_err());
        assert!(timer.resume().is_err());
        assert!(timer.start(|| {}).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels_pending_timer() {
        let (count, cb) = counter();
        {
            let timer = Timer::new(50.0).unwrap();
            timer.start(cb).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn finite_timer_needs_runtime() {
        let timer = Timer::new(10.0).unwrap();
        assert_eq!(timer.start(|| {}), Err(TimerError::NoRuntime));
        assert_eq!(timer.status(), TimerStatus::Stopped);
    }
}
