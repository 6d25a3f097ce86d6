//! Test helpers for integration tests.
//!
//! Provides callback machines, an event recorder and helpers that drive a
//! context until a condition holds.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ccore::config::Config;
use ccore::{ComputerContext, Event, Machine, MachineEnvironment, MachineFactory, MachineResult};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One step of a callback machine.
pub type Step = Box<dyn FnMut(Option<&Event>, &MachineEnvironment) -> MachineResult + Send>;

/// Box a closure as a [`Step`], fixing its signature.
pub fn step<F>(f: F) -> Step
where
    F: FnMut(Option<&Event>, &MachineEnvironment) -> MachineResult + Send + 'static,
{
    Box::new(f)
}

/// A machine driven by a Rust closure.
pub struct CallbackMachine {
    env: MachineEnvironment,
    step: Step,
}

impl Machine for CallbackMachine {
    fn handle_event(&mut self, event: Option<&Event>) -> MachineResult {
        (self.step)(event, &self.env)
    }

    fn close(&mut self) {}
}

/// A factory creating a [`CallbackMachine`] from `make` on every boot.
pub fn callback_factory<F>(make: F) -> Arc<dyn MachineFactory>
where
    F: Fn() -> Step + Send + Sync + 'static,
{
    Arc::new(
        move |env: MachineEnvironment| -> ccore::Result<Box<dyn Machine>> {
            Ok(Box::new(CallbackMachine { env, step: make() }))
        },
    )
}

/// Events received by machines, in order.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(u32, Event)>>>,
}

impl Recorder {
    pub fn record(&self, computer: u32, event: &Event) {
        self.events.lock().unwrap().push((computer, event.clone()));
    }

    pub fn events(&self) -> Vec<(u32, Event)> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|(_, e)| e.name).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// The first recorded event with this name.
    pub fn find(&self, name: &str) -> Option<Event> {
        self.events()
            .into_iter()
            .map(|(_, e)| e)
            .find(|e| e.name == name)
    }
}

/// A machine that records every event and always yields without a filter.
pub fn recording_factory(recorder: Recorder) -> Arc<dyn MachineFactory> {
    callback_factory(move || {
        let recorder = recorder.clone();
        step(move |event, env| {
            if let Some(event) = event {
                recorder.record(env.computer.id(), event);
            }
            MachineResult::Yield { filter: None }
        })
    })
}

/// Configuration with HTTP off and a single worker.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.http.enabled = false;
    config.scheduler.worker_threads = 1;
    config.scheduler.monitor_interval_ms = 10;
    config
}

/// Configuration with short timeouts, for tests that run out of time.
pub fn short_timeout_config() -> Config {
    let mut config = test_config();
    config.scheduler.timeout_ms = 200;
    config.scheduler.abort_timeout_ms = 100;
    config
}

/// Tick the context until `condition` holds. Returns whether it did.
pub fn wait_until<F>(context: &ComputerContext, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    while Instant::now() < deadline {
        context.on_server_tick();
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Tick the context for `duration` regardless of state.
pub fn run_for(context: &ComputerContext, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        context.on_server_tick();
        thread::sleep(Duration::from_millis(5));
    }
}
