//! ccore - an execution core for emulated computers.
//!
//! Runs many sandboxed computers on a small pool of worker threads, each
//! driven by events, with time-sliced execution, hard timeouts and
//! firewall-checked network access.

pub mod computer;
pub mod config;
pub mod context;
pub mod error;
pub mod firewall;
pub mod http;
pub mod logging;
#[cfg(feature = "lua")]
pub mod lua;

pub use computer::{
    Api, ApiFactory, ApiRegistry, Computer, ComputerHandle, ComputerScheduler, ComputerSide,
    ComputerState, Environment, Event, EventQueue, HostObject, Machine, MachineEnvironment,
    MachineFactory, MachineResult, TimeoutState, Value,
};
pub use config::Config;
pub use context::ComputerContext;
pub use error::{CoreError, Result};
pub use firewall::{Action, AddressRule, Firewall, Options, RuleSet};
pub use http::{HttpApi, HttpRequest, HttpService};
#[cfg(feature = "lua")]
pub use lua::{LuaMachine, LuaMachineFactory};
