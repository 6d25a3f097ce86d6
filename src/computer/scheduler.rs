//! Worker pool which runs computers.
//!
//! Computers are run by a fixed number of worker threads, taking ready
//! computers from a FIFO queue and running one step of each. A computer with
//! more work after its step goes to the back of the queue, so a busy computer
//! never starves the others.
//!
//! A monitor thread watches the running steps. It refreshes each step's
//! [`TimeoutState`] so machines know when to pause or yield, and aborts steps
//! which run past the hard limit. A worker which is still stuck long after the
//! abort is abandoned and replaced.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use super::timeout::TimeoutState;
use crate::config::SchedulerConfig;

/// Minimum time between two timeout reports from the same worker.
const REPORT_DEBOUNCE: Duration = Duration::from_secs(1);

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const CLOSED: u8 = 2;

/// The scheduler-facing side of a computer.
pub trait Worker: Send + Sync {
    /// Run one step. Call [`Executor::submit`] from here to run again.
    fn work(&self);

    /// ID used in log messages.
    fn computer_id(&self) -> u32;

    /// Append debugging information for timeout reports.
    fn write_state(&self, out: &mut String);

    /// The running step passed the hard limit.
    fn abort_with_timeout(&self);

    /// The running step failed with an internal error.
    fn abort_with_error(&self);

    /// Shut down and never run again. Called while the scheduler stops.
    fn unload(&self);
}

/// Whether an executor is queued or running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorState {
    /// Not queued and not running.
    Idle = 0,
    /// Waiting in the ready queue.
    OnQueue = 1,
    /// A worker is running it.
    Running = 2,
    /// Running, and must be queued again once the step finishes.
    Repeat = 3,
}

impl ExecutorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutorState::Idle,
            1 => ExecutorState::OnQueue,
            2 => ExecutorState::Running,
            _ => ExecutorState::Repeat,
        }
    }

    fn enqueue(self) -> Self {
        match self {
            ExecutorState::Idle | ExecutorState::OnQueue => ExecutorState::OnQueue,
            ExecutorState::Running | ExecutorState::Repeat => ExecutorState::Repeat,
        }
    }

    fn requeue(self) -> Self {
        match self {
            ExecutorState::Idle | ExecutorState::OnQueue => {
                error!(state = ?self, "Impossible executor state after running");
                ExecutorState::OnQueue
            }
            ExecutorState::Running => ExecutorState::Idle,
            ExecutorState::Repeat => ExecutorState::OnQueue,
        }
    }
}

/// A computer's slot in the scheduler.
pub struct Executor {
    worker: Weak<dyn Worker>,
    state: AtomicU8,
    timeout: Arc<TimeoutState>,
    scheduler: Weak<Shared>,
}

impl Executor {
    /// Mark the computer as having work. Idempotent while already queued.
    pub fn submit(self: &Arc<Self>) {
        let previous = self.update_state(ExecutorState::enqueue);
        if previous != ExecutorState::Idle {
            return;
        }

        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.queue(Arc::clone(self)),
            None => self.set_state(ExecutorState::Idle),
        }
    }

    /// The computer's execution budget.
    pub fn timeout(&self) -> &Arc<TimeoutState> {
        &self.timeout
    }

    pub fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ExecutorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn update_state(&self, f: impl Fn(ExecutorState) -> ExecutorState) -> ExecutorState {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(f(ExecutorState::from_u8(current)) as u8)
            })
            .unwrap_or_else(|current| current);
        ExecutorState::from_u8(previous)
    }

    fn computer_id(&self) -> Option<u32> {
        self.worker.upgrade().map(|worker| worker.computer_id())
    }

    /// Stop the clock and work out whether to queue again.
    fn after_work(&self) -> bool {
        self.timeout.reset();
        self.update_state(ExecutorState::requeue) == ExecutorState::Repeat
    }
}

struct WorkerThread {
    index: usize,
    name: String,
    running: AtomicBool,
    current: Mutex<Option<Arc<Executor>>>,
    last_report: Mutex<Option<Instant>>,
}

impl WorkerThread {
    fn current(&self) -> MutexGuard<'_, Option<Arc<Executor>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_timeout(&self, executor: &Executor, overrun: Duration) {
        {
            let now = Instant::now();
            let mut last = self.last_report.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|then| now.duration_since(then) < REPORT_DEBOUNCE) {
                return;
            }
            *last = Some(now);
        }

        let Some(worker) = executor.worker.upgrade() else {
            return;
        };

        let mut report = String::new();
        let _ = writeln!(
            report,
            "Terminating computer #{} due to timeout (ran over by {:.3} seconds). \
             This is NOT a bug, but may mean a computer is misbehaving.",
            worker.computer_id(),
            overrun.as_secs_f64()
        );
        let _ = writeln!(report, "Thread {} is still running", self.name);
        worker.write_state(&mut report);

        warn!(computer_id = worker.computer_id(), "{}", report.trim_end());
    }
}

struct Threads {
    workers: Vec<Option<Arc<WorkerThread>>>,
    count: usize,
    monitor: Option<JoinHandle<()>>,
    spawned: usize,
}

struct Shared {
    latency: Duration,
    min_period: Duration,
    monitor_interval: Duration,
    timeout: Duration,
    abort_timeout: Duration,

    state: AtomicU8,

    queue: Mutex<VecDeque<Arc<Executor>>>,
    queue_len: Arc<AtomicUsize>,
    worker_wakeup: Condvar,
    monitor_wakeup: Condvar,
    idle_workers: AtomicUsize,

    threads: Mutex<Threads>,
    shutdown: Condvar,
}

impl Shared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn advance_state(&self, new_state: u8) {
        self.state.fetch_max(new_state, Ordering::AcqRel);
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Arc<Executor>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_threads(&self) -> MutexGuard<'_, Threads> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_size(&self) -> usize {
        self.queue_len.load(Ordering::Acquire)
    }

    fn is_busy(&self) -> bool {
        self.queue_size() > self.idle_workers.load(Ordering::Acquire)
    }

    /// Time slice for the next step, shrinking as more computers wait.
    fn scaled_period(&self) -> Duration {
        // +1 for the computer about to run.
        let count = 1 + self.queue_size() as u32;
        let max_tasks = (self.latency.as_nanos() / self.min_period.as_nanos().max(1)) as u32;
        if count < max_tasks {
            self.latency / count
        } else {
            self.min_period
        }
    }

    fn queue(self: &Arc<Self>, executor: Arc<Executor>) {
        let mut queue = self.lock_queue();
        if self.state() != RUNNING {
            warn!(
                computer_id = executor.computer_id(),
                "Scheduler is no longer running, dropping work"
            );
            executor.set_state(ExecutorState::Idle);
            return;
        }

        self.ensure_running();

        let was_busy = self.is_busy();
        queue.push_back(executor);
        self.queue_len.store(queue.len(), Ordering::Release);
        self.worker_wakeup.notify_one();

        // Switch the monitor to the shorter busy interval.
        if !was_busy && self.is_busy() {
            self.monitor_wakeup.notify_one();
        }
    }

    /// Spawn the monitor, and a worker if none is idle and the pool is not full.
    fn ensure_running(self: &Arc<Self>) {
        let mut threads = self.lock_threads();

        if threads.monitor.as_ref().map_or(true, JoinHandle::is_finished) {
            let shared = Arc::clone(self);
            match thread::Builder::new()
                .name("Computer-Monitor".to_string())
                .spawn(move || shared.run_monitor())
            {
                Ok(handle) => threads.monitor = Some(handle),
                Err(e) => error!("Failed to spawn monitor thread: {}", e),
            }
        }

        if self.idle_workers.load(Ordering::Acquire) == 0 || threads.count < threads.workers.len() {
            if let Some(index) = threads.workers.iter().position(Option::is_none) {
                self.add_worker(&mut threads, index);
            }
        }
    }

    fn add_worker(self: &Arc<Self>, threads: &mut Threads, index: usize) {
        threads.spawned += 1;
        let worker = Arc::new(WorkerThread {
            index,
            name: format!("Computer-Worker-{}", threads.spawned),
            running: AtomicBool::new(true),
            current: Mutex::new(None),
            last_report: Mutex::new(None),
        });

        trace!(index, name = %worker.name, "Spawning worker");
        let shared = Arc::clone(self);
        let runner = Arc::clone(&worker);
        match thread::Builder::new()
            .name(worker.name.clone())
            .spawn(move || shared.run_worker(runner))
        {
            Ok(_) => {
                threads.workers[index] = Some(worker);
                threads.count += 1;
            }
            Err(e) => error!("Failed to spawn worker thread: {}", e),
        }
    }

    fn run_worker(self: Arc<Self>, me: Arc<WorkerThread>) {
        self.worker_loop(&me);
        self.worker_finished(&me);
    }

    fn worker_loop(&self, me: &WorkerThread) {
        while me.running.load(Ordering::Acquire) {
            let executor = {
                let mut queue = self.lock_queue();
                self.idle_workers.fetch_add(1, Ordering::AcqRel);
                let executor = loop {
                    if let Some(executor) = queue.pop_front() {
                        self.queue_len.store(queue.len(), Ordering::Release);
                        break Some(executor);
                    }
                    if self.state() >= STOPPING {
                        break None;
                    }
                    queue = self
                        .worker_wakeup
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                };
                self.idle_workers.fetch_sub(1, Ordering::AcqRel);
                executor
            };

            let Some(executor) = executor else {
                return;
            };

            if executor.update_state(|_| ExecutorState::Running) != ExecutorState::OnQueue {
                error!(
                    computer_id = executor.computer_id(),
                    thread = %me.name,
                    "Running a computer which was not queued"
                );
            }

            let Some(worker) = executor.worker.upgrade() else {
                // The computer was dropped while queued.
                executor.set_state(ExecutorState::Idle);
                continue;
            };

            // While stopping, the only thing left to do is shut down.
            if self.state() >= STOPPING {
                worker.unload();
            }

            executor.timeout.start_tick(self.scaled_period());
            *me.current() = Some(Arc::clone(&executor));

            let result = panic::catch_unwind(AssertUnwindSafe(|| worker.work()));
            if let Err(payload) = result {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    computer_id = worker.computer_id(),
                    "Error running task on computer: {}", message
                );
                worker.abort_with_error();
            }

            // The monitor takes the executor when it abandons this thread.
            let current = me.current().take();
            if current.is_some() {
                self.after_work(&executor);
            }
        }
    }

    fn after_work(&self, executor: &Arc<Executor>) {
        let mut queue = self.lock_queue();
        if !executor.after_work() || self.state() != RUNNING {
            return;
        }

        queue.push_back(Arc::clone(executor));
        self.queue_len.store(queue.len(), Ordering::Release);
        self.worker_wakeup.notify_one();
    }

    fn worker_finished(self: &Arc<Self>, worker: &Arc<WorkerThread>) {
        // Only once, even if an abandoned worker later finishes normally.
        if !worker.running.swap(false, Ordering::AcqRel) {
            return;
        }

        trace!(index = worker.index, name = %worker.name, "Worker finished");

        let current = worker.current().take();
        if let Some(executor) = current {
            self.after_work(&executor);
        }

        let mut threads = self.lock_threads();
        threads.count -= 1;

        let is_slot_owner = threads.workers[worker.index]
            .as_ref()
            .is_some_and(|w| Arc::ptr_eq(w, worker));
        if !is_slot_owner {
            error!(index = worker.index, "Worker closed, but a new runner has been spawned");
        } else if self.state() == RUNNING || (self.state() == STOPPING && self.queue_size() > 0) {
            threads.workers[worker.index] = None;
            self.add_worker(&mut threads, worker.index);
        } else {
            threads.workers[worker.index] = None;
        }

        self.shutdown.notify_all();
    }

    fn run_monitor(self: Arc<Self>) {
        trace!("Monitor starting");
        while self.state() < CLOSED {
            {
                let queue = self.lock_queue();
                // Busy means a step will need pausing soon, so check at that
                // granularity. Otherwise only the timeouts need refreshing.
                let wait = if self.is_busy() {
                    self.scaled_period()
                } else {
                    self.monitor_interval
                };
                let _ = self
                    .monitor_wakeup
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            self.check_runners();
        }
        trace!(state = self.state(), "Monitor shutting down");
    }

    fn check_runners(self: &Arc<Self>) {
        let workers: Vec<Arc<WorkerThread>> =
            self.lock_threads().workers.iter().flatten().cloned().collect();

        for runner in workers {
            let Some(executor) = runner.current().clone() else {
                continue;
            };

            executor.timeout.tick();

            // Past the soft limit by `overrun`; past the hard limit by `after_hard`.
            let overrun = executor.timeout.overrun();
            let Some(after_hard) = overrun.checked_sub(self.abort_timeout) else {
                continue;
            };

            executor.timeout.hard_abort();
            if let Some(worker) = executor.worker.upgrade() {
                worker.abort_with_timeout();
            }

            if after_hard >= self.abort_timeout * 2 {
                runner.report_timeout(&executor, overrun);
                warn!(thread = %runner.name, "Abandoning stuck worker thread");
                self.worker_finished(&runner);
            } else if after_hard >= self.abort_timeout {
                runner.report_timeout(&executor, overrun);
            }
        }
    }

    fn wake_all(&self) {
        let _queue = self.lock_queue();
        self.worker_wakeup.notify_all();
        self.monitor_wakeup.notify_all();
    }
}

/// Pool of worker threads running computers, plus a monitor thread.
///
/// Threads are spawned lazily, when work is first submitted.
pub struct ComputerScheduler {
    shared: Arc<Shared>,
}

impl ComputerScheduler {
    /// Create a scheduler. Latency and minimum period are scaled by
    /// `1 + floor(log2(worker_threads))`, as more threads can afford longer
    /// slices.
    pub fn new(config: &SchedulerConfig) -> Self {
        let threads = config.worker_threads.max(1);
        let factor = usize::BITS - threads.leading_zeros();

        info!(
            worker_threads = threads,
            timeout_ms = config.timeout_ms,
            abort_timeout_ms = config.abort_timeout_ms,
            "Creating computer scheduler"
        );

        Self {
            shared: Arc::new(Shared {
                latency: Duration::from_millis(config.latency_ms) * factor,
                min_period: Duration::from_millis(config.min_period_ms) * factor,
                monitor_interval: Duration::from_millis(config.monitor_interval_ms),
                timeout: config.timeout(),
                abort_timeout: config.abort_timeout(),
                state: AtomicU8::new(RUNNING),
                queue: Mutex::new(VecDeque::new()),
                queue_len: Arc::new(AtomicUsize::new(0)),
                worker_wakeup: Condvar::new(),
                monitor_wakeup: Condvar::new(),
                idle_workers: AtomicUsize::new(0),
                threads: Mutex::new(Threads {
                    workers: (0..threads).map(|_| None).collect(),
                    count: 0,
                    monitor: None,
                    spawned: 0,
                }),
                shutdown: Condvar::new(),
            }),
        }
    }

    /// Register a computer with the scheduler.
    pub fn create_executor(&self, worker: Weak<dyn Worker>) -> Arc<Executor> {
        Arc::new(Executor {
            worker,
            state: AtomicU8::new(ExecutorState::Idle as u8),
            timeout: Arc::new(TimeoutState::new(
                self.shared.timeout,
                self.shared.abort_timeout,
                Arc::clone(&self.shared.queue_len),
            )),
            scheduler: Arc::downgrade(&self.shared),
        })
    }

    /// Queue a computer for a step.
    pub fn submit(&self, executor: &Arc<Executor>) {
        executor.submit();
    }

    /// Whether computers are waiting for a worker.
    pub fn has_pending_work(&self) -> bool {
        self.shared.queue_size() > 0
    }

    /// Time slice the next step would get.
    pub fn scaled_period(&self) -> Duration {
        self.shared.scaled_period()
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.lock_threads().count
    }

    /// Whether new work is still accepted.
    pub fn is_running(&self) -> bool {
        self.shared.state() == RUNNING
    }

    /// Stop the scheduler.
    ///
    /// Running steps are hard-aborted and every queued computer is unloaded.
    /// Returns `false` if workers were still busy after `timeout`, in which
    /// case outstanding work is dropped.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        shared.advance_state(STOPPING);
        info!("Stopping computer scheduler");

        for worker in shared.lock_threads().workers.iter().flatten() {
            if let Some(executor) = worker.current().as_ref() {
                executor.timeout.hard_abort();
            }
        }

        shared.wake_all();

        let deadline = Instant::now() + timeout;
        {
            let mut threads = shared.lock_threads();
            while threads.count > 0 {
                let now = Instant::now();
                if now >= deadline {
                    let remaining = threads.count;
                    drop(threads);

                    let dropped = {
                        let mut queue = shared.lock_queue();
                        let dropped = queue.len();
                        for executor in queue.drain(..) {
                            executor.set_state(ExecutorState::Idle);
                        }
                        shared.queue_len.store(0, Ordering::Release);
                        dropped
                    };
                    warn!(
                        workers = remaining,
                        dropped, "Computer scheduler did not stop in time"
                    );
                    shared.advance_state(CLOSED);
                    shared.wake_all();
                    return false;
                }
                threads = shared
                    .shutdown
                    .wait_timeout(threads, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        shared.advance_state(CLOSED);
        shared.wake_all();
        debug!("Computer scheduler stopped");
        true
    }
}

impl Drop for ComputerScheduler {
    fn drop(&mut self) {
        if self.shared.state() != CLOSED {
            self.shared.advance_state(CLOSED);
            self.shared.wake_all();
        }
    }
}
