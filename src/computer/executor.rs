//! The lifecycle and event loop of a single computer.
//!
//! A computer has two queues. The command slot holds at most one pending
//! lifecycle transition (turn on, shut down, reboot, abort). The event queue
//! holds events for the running machine. Host threads only touch these under a
//! short lock and then submit the computer to the scheduler; all real work
//! happens in [`ComputerExecutor::work`] on a worker thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::api::ApiRegistry;
use super::environment::{Environment, EnvironmentChange};
use super::event::{Continuation, Event, EventQueue, Value};
use super::machine::{Machine, MachineEnvironment, MachineResult};
use super::main_thread::MainThreadTask;
use super::scheduler::{ComputerScheduler, Executor, Worker};
use super::timeout::{TimeoutState, ABORT_MESSAGE};
use super::{ComputerHandle, ComputerServices, ComputerState};
use crate::{CoreError, Result};

/// Message recorded when a step panicked.
const INTERNAL_ERROR: &str = "An internal error occurred, see logs.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateCommand {
    TurnOn,
    Shutdown,
    Reboot,
    AbortWithTimeout,
    AbortWithError,
}

struct Pending {
    command: Option<StateCommand>,
    events: EventQueue,
    continuation: Continuation,
    state: ComputerState,
    closed: bool,
    last_error: Option<String>,
}

/// State only touched by the worker running this computer.
struct Core {
    machine: Option<Box<dyn Machine>>,
    was_paused: bool,
    remaining: Duration,
}

pub(crate) struct ComputerExecutor {
    id: u32,
    this: Weak<ComputerExecutor>,
    label: Mutex<Option<String>>,
    pending: Mutex<Pending>,
    core: Mutex<Core>,
    /// Held while APIs start or stop; `tick` skips updates while it is taken.
    apis: Mutex<Option<Arc<ApiRegistry>>>,
    slot: Arc<Executor>,
    environment: Arc<Environment>,
    services: Arc<ComputerServices>,
    next_task_id: AtomicU64,
}

impl ComputerExecutor {
    pub(crate) fn new(
        id: u32,
        label: Option<String>,
        scheduler: &ComputerScheduler,
        services: Arc<ComputerServices>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ComputerExecutor>| {
            let worker: Weak<dyn Worker> = this.clone();
            let slot = scheduler.create_executor(worker);
            Self {
                id,
                this: this.clone(),
                label: Mutex::new(label),
                pending: Mutex::new(Pending {
                    command: None,
                    events: EventQueue::new(services.event_queue_limit),
                    continuation: Continuation::default(),
                    state: ComputerState::Off,
                    closed: false,
                    last_error: None,
                }),
                core: Mutex::new(Core {
                    machine: None,
                    was_paused: false,
                    remaining: slot.timeout().timeout(),
                }),
                apis: Mutex::new(None),
                slot,
                environment: Arc::new(Environment::default()),
                services,
                next_task_id: AtomicU64::new(0),
            }
        })
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeout(&self) -> &Arc<TimeoutState> {
        self.slot.timeout()
    }

    pub(crate) fn abort_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.timeout().abort_signal()
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn handle(&self) -> ComputerHandle {
        ComputerHandle::new(self.id, self.this.clone())
    }

    pub(crate) fn label(&self) -> Option<String> {
        self.label.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_label(&self, label: Option<String>) {
        *self.label.lock().unwrap_or_else(PoisonError::into_inner) = label;
    }

    pub(crate) fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub(crate) fn state(&self) -> ComputerState {
        self.pending().state
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.pending().last_error.clone()
    }

    pub(crate) fn has_pending_command(&self) -> bool {
        self.pending().command.is_some()
    }

    /// Closed, off and with nothing left to run.
    pub(crate) fn is_finished(&self) -> bool {
        let pending = self.pending();
        pending.closed
            && matches!(pending.state, ComputerState::Off | ComputerState::Crashed)
            && !matches!(
                pending.command,
                Some(StateCommand::TurnOn | StateCommand::Reboot)
            )
    }

    /// Queue a start if the computer is off.
    pub(crate) fn queue_start(&self) {
        {
            let mut pending = self.pending();
            if pending.closed
                || pending.command.is_some()
                || !matches!(pending.state, ComputerState::Off | ComputerState::Crashed)
            {
                return;
            }
            pending.command = Some(StateCommand::TurnOn);
        }
        self.slot.submit();
    }

    /// Queue a shutdown or reboot if the computer is on.
    ///
    /// With `close`, the computer never accepts commands or events again.
    pub(crate) fn queue_stop(&self, reboot: bool, close: bool) {
        {
            let mut pending = self.pending();
            if pending.closed {
                return;
            }
            pending.closed = close;

            let command = if reboot {
                StateCommand::Reboot
            } else {
                StateCommand::Shutdown
            };

            if !pending.state.is_running() || pending.command.is_some() {
                if close {
                    pending.command = Some(command);
                }
                return;
            }

            pending.command = Some(command);
        }
        self.slot.submit();
    }

    fn immediate_fail(&self, command: StateCommand, message: &str) {
        {
            let mut pending = self.pending();
            if pending.closed && pending.command.is_none() && !pending.state.is_running() {
                return;
            }
            if pending.command == Some(command) {
                return;
            }

            pending.command = Some(command);
            if pending.state.is_running() {
                pending.state = ComputerState::Crashed;
                pending.last_error = Some(message.to_string());
                pending.events.drain_discard();
            }
        }
        self.slot.submit();
    }

    /// Queue an event for the machine.
    ///
    /// Returns `false` if the computer is not on, is about to change state,
    /// or already has a full queue.
    pub(crate) fn queue_event(&self, name: &str, args: Vec<Value>) -> bool {
        let ready = {
            let mut pending = self.pending();
            if pending.closed || pending.command.is_some() || !pending.state.is_running() {
                return false;
            }

            let event = Event::new(name, args);
            let ready = pending.continuation.accepts(&event);
            if !pending.events.push(event) {
                debug!(computer_id = self.id, event = name, "Event queue full, dropping event");
                return false;
            }
            ready
        };

        if ready {
            self.slot.submit();
        }
        true
    }

    pub(crate) fn issue_main_thread_task(&self, task: MainThreadTask) -> Result<u64> {
        if !self.state().is_running() {
            return Err(CoreError::Closed(format!("computer #{}", self.id)));
        }
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.services.main_thread.enqueue(self.handle(), id, task);
        Ok(id)
    }

    /// Host tick: advance APIs and turn environment changes into events.
    pub(crate) fn tick(&self) {
        for change in self.environment.take_changes() {
            match change {
                EnvironmentChange::Redstone => {
                    self.queue_event("redstone", vec![]);
                }
                EnvironmentChange::PeripheralAttached(side) => {
                    self.queue_event("peripheral", vec![Value::from(side.name())]);
                }
                EnvironmentChange::PeripheralDetached(side) => {
                    self.queue_event("peripheral_detach", vec![Value::from(side.name())]);
                }
            }
        }

        // A missed update at the start or end of a computer's life is harmless.
        if let Ok(apis) = self.apis.try_lock() {
            if let Some(apis) = apis.as_ref() {
                apis.update();
            }
        }
    }

    fn work_impl(&self, core: &mut Core) {
        let (command, event) = {
            let mut pending = self.pending();
            let command = pending.command.take();
            let mut event = None;

            // Observers never see a start that was taken but not yet applied.
            if command == Some(StateCommand::TurnOn) && core.machine.is_none() {
                pending.state = ComputerState::Starting;
            }

            if command.is_none() && !core.was_paused {
                if !pending.state.is_running() {
                    pending.events.drain_discard();
                    return;
                }

                let filter = pending.continuation.filter.clone();
                event = pending.events.pull(filter.as_deref());
                if event.is_none() {
                    return;
                }
            }
            (command, event)
        };

        if let Some(command) = command {
            core.was_paused = false;
            match command {
                StateCommand::TurnOn => {
                    if core.machine.is_none() {
                        self.turn_on(core);
                    }
                }
                StateCommand::Shutdown => {
                    if core.machine.is_some() {
                        self.shutdown(core, ComputerState::Off, None);
                    }
                }
                StateCommand::Reboot => {
                    if core.machine.is_some() {
                        if self.pending().closed {
                            self.shutdown(core, ComputerState::Off, None);
                        } else {
                            self.shutdown(core, ComputerState::Starting, None);
                            self.turn_on(core);
                        }
                    }
                }
                StateCommand::AbortWithTimeout => {
                    if core.machine.is_some() {
                        error!(
                            computer_id = self.id,
                            "Error running computer: {}",
                            ABORT_MESSAGE
                        );
                        self.shutdown(
                            core,
                            ComputerState::Crashed,
                            Some(ABORT_MESSAGE.to_string()),
                        );
                    }
                }
                StateCommand::AbortWithError => {
                    if core.machine.is_some() {
                        self.shutdown(
                            core,
                            ComputerState::Crashed,
                            Some(INTERNAL_ERROR.to_string()),
                        );
                    }
                }
            }
        } else if core.was_paused {
            self.timeout().set_remaining(core.remaining);
            self.resume(core, None);
        } else if let Some(event) = event {
            self.timeout().set_remaining(self.timeout().timeout());
            self.resume(core, Some(&event));
        }
    }

    fn turn_on(&self, core: &mut Core) {
        {
            let mut pending = self.pending();
            pending.events.drain_discard();
            pending.continuation = Continuation::default();
            pending.state = ComputerState::Starting;
            pending.last_error = None;
        }

        let handle = self.handle();
        let apis = {
            let mut slot = self.apis.lock().unwrap_or_else(PoisonError::into_inner);
            let factories = self.services.api_factories();
            let apis = Arc::new(ApiRegistry::build(&factories, &handle));
            apis.startup();
            *slot = Some(Arc::clone(&apis));
            apis
        };

        let env = MachineEnvironment {
            computer: handle,
            timeout: Arc::clone(self.timeout()),
            apis,
            soft_limit_policy: self.services.soft_limit_policy,
        };

        match self.services.machine_factory.create(env) {
            Ok(machine) => core.machine = Some(machine),
            Err(e) => {
                error!(computer_id = self.id, "Failed to create machine: {}", e);
                self.shutdown(core, ComputerState::Crashed, Some(e.to_string()));
                return;
            }
        }

        // Boot on the next step, without an event.
        core.was_paused = true;
        core.remaining = self.timeout().timeout();
        info!(computer_id = self.id, "Computer starting");
    }

    fn shutdown(&self, core: &mut Core, final_state: ComputerState, error: Option<String>) {
        {
            let mut pending = self.pending();
            if pending.state.is_running() {
                pending.state = ComputerState::ShuttingDown;
            }
            pending.events.drain_discard();
            pending.continuation = Continuation::default();
        }

        core.was_paused = false;
        if let Some(mut machine) = core.machine.take() {
            machine.close();
        }

        {
            let mut apis = self.apis.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(apis) = apis.take() {
                apis.shutdown();
            }
        }
        self.environment.reset_output();

        let mut pending = self.pending();
        pending.state = final_state;
        if error.is_some() {
            pending.last_error = error;
        }
        info!(computer_id = self.id, state = %final_state, "Computer stopped");
    }

    fn resume(&self, core: &mut Core, event: Option<&Event>) {
        let Some(machine) = core.machine.as_mut() else {
            return;
        };

        let result = machine.handle_event(event);
        let result = if self.timeout().is_hard_limit_exceeded() {
            MachineResult::Error(ABORT_MESSAGE.to_string())
        } else {
            result
        };

        match result {
            MachineResult::Yield { filter } => {
                core.was_paused = false;
                self.mark_on(Some(Continuation::new(filter)));
            }
            MachineResult::Pause => {
                core.was_paused = true;
                core.remaining = self.timeout().remaining();
                self.mark_on(None);
            }
            MachineResult::Completed => {
                self.shutdown(core, ComputerState::Off, None);
            }
            MachineResult::Error(message) => {
                error!(computer_id = self.id, "Error running computer: {}", message);
                self.shutdown(core, ComputerState::Crashed, Some(message));
            }
        }
    }

    fn mark_on(&self, continuation: Option<Continuation>) {
        let mut pending = self.pending();
        if pending.state == ComputerState::Starting {
            pending.state = ComputerState::On;
        }
        if let Some(continuation) = continuation {
            pending.continuation = continuation;
        }
    }
}

impl Worker for ComputerExecutor {
    fn work(&self) {
        let mut core = match self.core.try_lock() {
            Ok(core) => core,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                // An abandoned worker still owns the machine. It requeues the
                // computer once it returns.
                warn!(computer_id = self.id, "Previous step still running, skipping");
                return;
            }
        };

        self.work_impl(&mut core);

        let requeue = {
            let pending = self.pending();
            core.was_paused
                || pending.command.is_some()
                || (pending.state.is_running()
                    && pending
                        .events
                        .has_match(pending.continuation.filter.as_deref()))
        };
        drop(core);

        if requeue {
            self.slot.submit();
        }
    }

    fn computer_id(&self) -> u32 {
        self.id
    }

    fn write_state(&self, out: &mut String) {
        {
            let pending = self.pending();
            out.push_str(&format!("Enqueued command: {:?}\n", pending.command));
            out.push_str(&format!("Enqueued events: {}\n", pending.events.len()));
        }
        match self.core.try_lock() {
            Ok(core) => {
                if let Some(machine) = core.machine.as_ref() {
                    machine.describe_state(out);
                }
            }
            Err(_) => out.push_str("Machine is busy\n"),
        }
    }

    fn abort_with_timeout(&self) {
        self.immediate_fail(StateCommand::AbortWithTimeout, ABORT_MESSAGE);
    }

    fn abort_with_error(&self) {
        self.immediate_fail(StateCommand::AbortWithError, INTERNAL_ERROR);
    }

    fn unload(&self) {
        self.queue_stop(false, true);
    }
}
