//! The pluggable execution engine behind a computer.

use std::sync::Arc;

use super::api::ApiRegistry;
use super::event::Event;
use super::timeout::TimeoutState;
use super::ComputerHandle;
use crate::config::SoftLimitPolicy;
use crate::Result;

/// Outcome of one machine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineResult {
    /// Suspended, waiting for an event. `None` accepts any event.
    Yield { filter: Option<String> },
    /// Ran out of its time slice. Resumed later without an event.
    Pause,
    /// The program finished. The computer turns off.
    Completed,
    /// A fatal error. The computer crashes.
    Error(String),
}

/// Everything a machine gets from its computer.
#[derive(Clone)]
pub struct MachineEnvironment {
    /// The owning computer.
    pub computer: ComputerHandle,
    /// Budget of the running step; machines should poll it.
    pub timeout: Arc<TimeoutState>,
    /// APIs registered for this computer.
    pub apis: Arc<ApiRegistry>,
    /// What to do when the soft limit passes.
    pub soft_limit_policy: SoftLimitPolicy,
}

/// A resumable program.
///
/// Each call to [`Machine::handle_event`] runs one step. The scheduler
/// guarantees no two steps of the same machine overlap.
pub trait Machine: Send {
    /// Resume with an event, or with `None` to boot or continue after a pause.
    fn handle_event(&mut self, event: Option<&Event>) -> MachineResult;

    /// Release all resources. No further steps follow.
    fn close(&mut self);

    /// Append debugging information, used when reporting a stuck computer.
    fn describe_state(&self, out: &mut String) {
        let _ = out;
    }
}

/// Creates a fresh machine every time a computer turns on.
pub trait MachineFactory: Send + Sync {
    fn create(&self, env: MachineEnvironment) -> Result<Box<dyn Machine>>;
}

impl<F> MachineFactory for F
where
    F: Fn(MachineEnvironment) -> Result<Box<dyn Machine>> + Send + Sync,
{
    fn create(&self, env: MachineEnvironment) -> Result<Box<dyn Machine>> {
        self(env)
    }
}
