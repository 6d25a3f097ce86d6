//! Computers and the machinery that runs them.

mod api;
mod environment;
mod event;
mod executor;
mod machine;
mod main_thread;
mod scheduler;
mod timeout;

pub use api::{Api, ApiFactory, ApiRegistry};
pub use environment::{ComputerSide, Environment, Peripheral};
pub use event::{Continuation, Event, EventQueue, HostObject, Value, TERMINATE};
pub use machine::{Machine, MachineEnvironment, MachineFactory, MachineResult};
pub use main_thread::{MainThread, MainThreadTask, TaskResult, TASK_COMPLETE};
pub use scheduler::{ComputerScheduler, Executor, ExecutorState, Worker};
pub use timeout::{TimeoutState, TimeoutStatus, ABORT_MESSAGE};

pub(crate) use executor::ComputerExecutor;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::config::SoftLimitPolicy;
use crate::{CoreError, Result};

/// Lifecycle state of a computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputerState {
    Off,
    /// Turned on, the machine has not finished its first step.
    Starting,
    On,
    ShuttingDown,
    /// Stopped by an error or timeout. Turn on again to restart.
    Crashed,
}

impl ComputerState {
    /// Whether the computer accepts events.
    pub fn is_running(self) -> bool {
        matches!(self, ComputerState::Starting | ComputerState::On)
    }
}

impl fmt::Display for ComputerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComputerState::Off => "off",
            ComputerState::Starting => "starting",
            ComputerState::On => "on",
            ComputerState::ShuttingDown => "shutting down",
            ComputerState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Services shared by every computer of a context.
pub(crate) struct ComputerServices {
    pub machine_factory: Arc<dyn MachineFactory>,
    pub api_factories: RwLock<Vec<Arc<dyn ApiFactory>>>,
    pub main_thread: Arc<MainThread>,
    pub soft_limit_policy: SoftLimitPolicy,
    pub event_queue_limit: usize,
}

impl ComputerServices {
    pub fn api_factories(&self) -> Vec<Arc<dyn ApiFactory>> {
        self.api_factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A cheap, cloneable reference to a computer, given to machines and APIs.
///
/// Holds the computer weakly; once it is gone every call is a no-op.
#[derive(Clone)]
pub struct ComputerHandle {
    id: u32,
    executor: Weak<ComputerExecutor>,
}

impl ComputerHandle {
    pub(crate) fn new(id: u32, executor: Weak<ComputerExecutor>) -> Self {
        Self { id, executor }
    }

    /// A handle not attached to any computer.
    pub fn detached(id: u32) -> Self {
        Self {
            id,
            executor: Weak::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn label(&self) -> Option<String> {
        self.executor.upgrade().and_then(|e| e.label())
    }

    pub fn set_label(&self, label: Option<String>) {
        if let Some(executor) = self.executor.upgrade() {
            executor.set_label(label);
        }
    }

    /// Whether the computer is starting or on.
    pub fn is_on(&self) -> bool {
        self.executor
            .upgrade()
            .is_some_and(|e| e.state().is_running())
    }

    /// Queue an event. See [`Computer::queue_event`].
    pub fn queue_event(&self, name: &str, args: Vec<Value>) -> bool {
        self.executor
            .upgrade()
            .is_some_and(|e| e.queue_event(name, args))
    }

    pub fn shutdown(&self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.queue_stop(false, false);
        }
    }

    pub fn reboot(&self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.queue_stop(true, false);
        }
    }

    /// Fires once the step running now is hard-aborted.
    ///
    /// `None` for a detached handle or an unloaded computer.
    pub fn abort_signal(&self) -> Option<tokio::sync::watch::Receiver<bool>> {
        self.executor.upgrade().map(|e| e.abort_signal())
    }

    /// The computer's I/O sides.
    pub fn environment(&self) -> Option<Arc<Environment>> {
        self.executor.upgrade().map(|e| Arc::clone(e.environment()))
    }

    /// Run `task` on the host thread during a later server tick.
    ///
    /// Returns the task ID. The result arrives as a `task_complete` event.
    pub fn issue_main_thread_task(&self, task: MainThreadTask) -> Result<u64> {
        match self.executor.upgrade() {
            Some(executor) => executor.issue_main_thread_task(task),
            None => Err(CoreError::Closed(format!("computer #{}", self.id))),
        }
    }
}

impl fmt::Debug for ComputerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputerHandle").field("id", &self.id).finish()
    }
}

/// A computer owned by the host.
///
/// Dropping it unloads the computer.
pub struct Computer {
    executor: Arc<ComputerExecutor>,
}

impl Computer {
    pub(crate) fn new(executor: Arc<ComputerExecutor>) -> Self {
        Self { executor }
    }

    pub fn id(&self) -> u32 {
        self.executor.id()
    }

    pub fn label(&self) -> Option<String> {
        self.executor.label()
    }

    pub fn set_label(&self, label: Option<String>) {
        self.executor.set_label(label);
    }

    pub fn state(&self) -> ComputerState {
        self.executor.state()
    }

    /// Whether the computer is starting or on.
    pub fn is_on(&self) -> bool {
        self.state().is_running()
    }

    /// Whether a turn on, shutdown or reboot is waiting to be applied.
    pub fn has_pending_command(&self) -> bool {
        self.executor.has_pending_command()
    }

    /// Message of the error that last crashed the computer.
    pub fn last_error(&self) -> Option<String> {
        self.executor.last_error()
    }

    /// Turn the computer on. No-op unless it is off or crashed.
    pub fn turn_on(&self) {
        self.executor.queue_start();
    }

    /// Shut the computer down. No-op unless it is starting or on.
    pub fn shutdown(&self) {
        self.executor.queue_stop(false, false);
    }

    /// Shut down and start again.
    pub fn reboot(&self) {
        self.executor.queue_stop(true, false);
    }

    /// Shut down for good. No further commands or events are accepted.
    pub fn unload(&self) {
        self.executor.queue_stop(false, true);
    }

    /// Queue an event for the machine.
    ///
    /// Returns `false` if the event was dropped: the computer is not on, a
    /// lifecycle change is pending, or the queue is full.
    pub fn queue_event(&self, name: &str, args: Vec<Value>) -> bool {
        self.executor.queue_event(name, args)
    }

    pub fn environment(&self) -> &Arc<Environment> {
        self.executor.environment()
    }

    /// A handle which can be given to other threads.
    pub fn handle(&self) -> ComputerHandle {
        self.executor.handle()
    }
}

impl fmt::Debug for Computer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computer")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Computer {
    fn drop(&mut self) {
        self.executor.queue_stop(false, true);
    }
}
