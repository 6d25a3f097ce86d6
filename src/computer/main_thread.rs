//! Work that must run on the host thread, inside a server tick.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use super::event::Value;
use super::ComputerHandle;

/// Event delivered when a main-thread task finishes.
pub const TASK_COMPLETE: &str = "task_complete";

/// Values returned by a task, or an error message.
pub type TaskResult = std::result::Result<Vec<Value>, String>;

/// A unit of main-thread work.
pub type MainThreadTask = Box<dyn FnOnce() -> TaskResult + Send>;

struct QueuedTask {
    computer: ComputerHandle,
    id: u64,
    task: MainThreadTask,
}

/// Queue of main-thread tasks with a per-tick time budget.
pub struct MainThread {
    queue: Mutex<VecDeque<QueuedTask>>,
    budget: Duration,
}

impl MainThread {
    /// Create a queue which runs tasks for at most `budget` per tick.
    ///
    /// At least one task runs every tick, whatever its cost.
    pub fn new(budget: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            budget,
        }
    }

    pub(crate) fn enqueue(&self, computer: ComputerHandle, id: u64, task: MainThreadTask) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(QueuedTask { computer, id, task });
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run queued tasks until the budget for this tick is spent.
    ///
    /// Returns how many tasks ran.
    pub fn run_tasks(&self) -> usize {
        let start = Instant::now();
        let mut ran = 0;

        loop {
            if ran > 0 && start.elapsed() >= self.budget {
                break;
            }

            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(QueuedTask { computer, id, task }) = next else {
                break;
            };

            let result = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|_| {
                error!(computer_id = computer.id(), task_id = id, "Main thread task panicked");
                Err("An internal error occurred".to_string())
            });

            let mut args = vec![Value::from(id as f64)];
            match result {
                Ok(values) => {
                    args.push(Value::Bool(true));
                    args.extend(values);
                }
                Err(message) => {
                    args.push(Value::Bool(false));
                    args.push(Value::String(message));
                }
            }
            computer.queue_event(TASK_COMPLETE, args);
            ran += 1;
        }

        if ran > 0 {
            trace!(ran, elapsed = ?start.elapsed(), "Ran main thread tasks");
        }
        ran
    }
}

impl Default for MainThread {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_runs_at_least_one_task() {
        let main_thread = MainThread::new(Duration::ZERO);
        for id in 0..3 {
            main_thread.enqueue(ComputerHandle::detached(1), id, Box::new(|| Ok(vec![])));
        }

        assert_eq!(main_thread.run_tasks(), 1);
        assert_eq!(main_thread.pending(), 2);
    }

    #[test]
    fn test_budget_defers_remaining_tasks() {
        let main_thread = MainThread::new(Duration::from_millis(5));
        for id in 0..4 {
            main_thread.enqueue(
                ComputerHandle::detached(1),
                id,
                Box::new(|| {
                    thread::sleep(Duration::from_millis(10));
                    Ok(vec![])
                }),
            );
        }

        assert_eq!(main_thread.run_tasks(), 1);
        assert_eq!(main_thread.run_tasks(), 1);
        assert_eq!(main_thread.pending(), 2);
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let main_thread = MainThread::default();
        main_thread.enqueue(ComputerHandle::detached(1), 1, Box::new(|| panic!("boom")));
        main_thread.enqueue(ComputerHandle::detached(1), 2, Box::new(|| Ok(vec![])));

        assert_eq!(main_thread.run_tasks(), 2);
        assert_eq!(main_thread.pending(), 0);
    }
}
