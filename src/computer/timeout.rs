//! Per-computer execution budget.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Message used when a computer is stopped for running too long.
pub const ABORT_MESSAGE: &str = "Too long without yielding";

/// Result of polling a [`TimeoutState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    /// Within budget.
    Continue,
    /// Past the soft limit. The machine should yield as soon as possible.
    SoftLimit,
    /// Past the hard limit. The machine must stop.
    HardLimit,
}

#[derive(Debug)]
struct Timer {
    /// When the current step started, `None` while no worker owns the computer.
    started: Option<Instant>,
    /// Budget remaining when the step started.
    budget: Duration,
    /// Elapsed time after which the step may be paused.
    pause_after: Duration,
    /// Budget left over from the last step.
    remaining: Duration,
}

/// Tracks how long a computer has been running within the current step.
///
/// The clock only runs between [`TimeoutState::start_tick`] and
/// [`TimeoutState::reset`], which the scheduler calls around each step, so time
/// spent queued is never charged.
#[derive(Debug)]
pub struct TimeoutState {
    timeout: Duration,
    abort_timeout: Duration,
    pending_work: Arc<AtomicUsize>,
    paused: AtomicBool,
    soft_abort: AtomicBool,
    hard_abort: AtomicBool,
    timer: Mutex<Timer>,
    abort: watch::Sender<bool>,
}

impl TimeoutState {
    /// Create a state with a soft limit of `timeout` and a hard limit of
    /// `timeout + abort_timeout`.
    ///
    /// `pending_work` is the scheduler's ready-queue length, used to decide
    /// whether pausing would let another computer run.
    pub fn new(timeout: Duration, abort_timeout: Duration, pending_work: Arc<AtomicUsize>) -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            timeout,
            abort_timeout,
            pending_work,
            paused: AtomicBool::new(false),
            soft_abort: AtomicBool::new(false),
            hard_abort: AtomicBool::new(false),
            timer: Mutex::new(Timer {
                started: None,
                budget: timeout,
                pause_after: timeout,
                remaining: timeout,
            }),
            abort,
        }
    }

    fn timer(&self) -> std::sync::MutexGuard<'_, Timer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The full budget of a step.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extra time after the soft limit before a step is aborted.
    pub fn abort_timeout(&self) -> Duration {
        self.abort_timeout
    }

    /// Start the clock for a new step, clearing every flag.
    ///
    /// The step may be paused once it has run for `pause_after`.
    pub fn start_tick(&self, pause_after: Duration) {
        let mut timer = self.timer();
        timer.started = Some(Instant::now());
        timer.budget = self.timeout;
        timer.pause_after = pause_after;

        self.paused.store(false, Ordering::Release);
        self.soft_abort.store(false, Ordering::Release);
        self.hard_abort.store(false, Ordering::Release);
        self.abort.send_replace(false);
    }

    /// Set the budget for the current step, restarting its clock.
    pub fn set_remaining(&self, remaining: Duration) {
        let mut timer = self.timer();
        timer.budget = remaining;
        timer.remaining = remaining;
        if timer.started.is_some() {
            timer.started = Some(Instant::now());
        }
    }

    /// Budget left before the soft limit.
    pub fn remaining(&self) -> Duration {
        let timer = self.timer();
        match timer.started {
            Some(started) => timer.budget.saturating_sub(started.elapsed()),
            None => timer.remaining,
        }
    }

    /// How far the current step has run past the soft limit.
    pub fn overrun(&self) -> Duration {
        let timer = self.timer();
        match timer.started {
            Some(started) => started.elapsed().saturating_sub(timer.budget),
            None => Duration::ZERO,
        }
    }

    /// Time spent in the current step so far.
    pub fn elapsed(&self) -> Duration {
        self.timer()
            .started
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Recompute the pause and limit flags from the clock.
    pub fn tick(&self) -> TimeoutStatus {
        {
            let timer = self.timer();
            if let Some(started) = timer.started {
                let elapsed = started.elapsed();
                if elapsed >= timer.pause_after && self.pending_work.load(Ordering::Acquire) > 0 {
                    self.paused.store(true, Ordering::Release);
                }
                if elapsed >= timer.budget {
                    self.soft_abort.store(true, Ordering::Release);
                }
                if elapsed >= timer.budget + self.abort_timeout {
                    drop(timer);
                    self.hard_abort();
                }
            }
        }

        if self.is_hard_limit_exceeded() {
            TimeoutStatus::HardLimit
        } else if self.is_soft_limit_exceeded() {
            TimeoutStatus::SoftLimit
        } else {
            TimeoutStatus::Continue
        }
    }

    /// Whether the step has run past the soft limit.
    pub fn is_soft_limit_exceeded(&self) -> bool {
        self.soft_abort.load(Ordering::Acquire)
    }

    /// Whether the step has been hard-aborted.
    pub fn is_hard_limit_exceeded(&self) -> bool {
        self.hard_abort.load(Ordering::Acquire)
    }

    /// Whether the machine should pause to let other computers run.
    pub fn should_pause(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Force the hard limit and fire the abort signal.
    pub fn hard_abort(&self) {
        self.soft_abort.store(true, Ordering::Release);
        if !self.hard_abort.swap(true, Ordering::AcqRel) {
            self.abort.send_replace(true);
        }
    }

    /// Stop the clock, keeping whatever budget is left for a paused step.
    pub fn reset(&self) {
        let mut timer = self.timer();
        if let Some(started) = timer.started.take() {
            timer.remaining = timer.budget.saturating_sub(started.elapsed());
        }
    }

    /// A receiver which becomes `true` once the current step is hard-aborted.
    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn state(timeout_ms: u64, abort_ms: u64) -> TimeoutState {
        TimeoutState::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(abort_ms),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    #[test]
    fn test_fresh_state_continues() {
        let timeout = state(1000, 500);
        timeout.start_tick(Duration::from_millis(50));
        assert_eq!(timeout.tick(), TimeoutStatus::Continue);
        assert!(!timeout.should_pause());
    }

    #[test]
    fn test_soft_then_hard_limit() {
        let timeout = state(10, 20);
        timeout.start_tick(Duration::from_secs(1));

        thread::sleep(Duration::from_millis(15));
        assert_eq!(timeout.tick(), TimeoutStatus::SoftLimit);
        assert!(timeout.is_soft_limit_exceeded());
        assert!(!timeout.is_hard_limit_exceeded());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(timeout.tick(), TimeoutStatus::HardLimit);
        assert!(*timeout.abort_signal().borrow());
    }

    #[test]
    fn test_pause_requires_pending_work() {
        let pending = Arc::new(AtomicUsize::new(0));
        let timeout = TimeoutState::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Arc::clone(&pending),
        );
        timeout.start_tick(Duration::from_millis(1));
        thread::sleep(Duration::from_millis(5));

        timeout.tick();
        assert!(!timeout.should_pause());

        pending.store(1, Ordering::Release);
        timeout.tick();
        assert!(timeout.should_pause());
    }

    #[test]
    fn test_start_tick_clears_flags() {
        let timeout = state(1000, 1000);
        timeout.start_tick(Duration::from_secs(1));
        timeout.hard_abort();
        assert_eq!(timeout.tick(), TimeoutStatus::HardLimit);

        timeout.start_tick(Duration::from_secs(1));
        assert_eq!(timeout.tick(), TimeoutStatus::Continue);
        assert!(!*timeout.abort_signal().borrow());
    }

    #[test]
    fn test_reset_keeps_remaining_budget() {
        let timeout = state(1000, 1000);
        timeout.start_tick(Duration::from_secs(1));
        timeout.set_remaining(Duration::from_millis(200));
        thread::sleep(Duration::from_millis(20));
        timeout.reset();

        let remaining = timeout.remaining();
        assert!(remaining <= Duration::from_millis(180));
        assert!(remaining > Duration::ZERO);

        // The clock is stopped, so the budget no longer shrinks.
        thread::sleep(Duration::from_millis(10));
        assert_eq!(timeout.remaining(), remaining);
        assert_eq!(timeout.overrun(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_abort_signal_wakes_waiters() {
        let timeout = Arc::new(state(1000, 1000));
        timeout.start_tick(Duration::from_secs(1));
        let mut signal = timeout.abort_signal();

        let aborter = Arc::clone(&timeout);
        tokio::spawn(async move { aborter.hard_abort() });

        signal.wait_for(|aborted| *aborted).await.unwrap();
        assert!(timeout.is_hard_limit_exceeded());
    }
}
