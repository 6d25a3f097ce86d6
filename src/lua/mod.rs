//! A [`Machine`] running a sandboxed Lua 5.4 bios.
//!
//! The bios runs as a coroutine. Each yield suspends the computer with the
//! yielded value as the event filter, and the next event resumes it with the
//! event name followed by its arguments. An instruction hook polls the
//! computer's [`TimeoutState`] so runaway code is stopped at the hard limit.
//! `pcall` and friends re-raise that error, so bios code cannot swallow it.

mod convert;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mlua::{
    Function, HookTriggers, Lua, MultiValue, Table, Thread, ThreadStatus, Value as LuaValue,
    VmState,
};
use tracing::{debug, warn};

use crate::computer::{
    ApiRegistry, Event, Machine, MachineEnvironment, MachineFactory, MachineResult, TimeoutState,
    ABORT_MESSAGE,
};
use crate::config::SoftLimitPolicy;
use crate::http::{HttpApi, HttpRequest, API_NAME as HTTP_API, MAX_TIMEOUT};
use crate::{CoreError, Result};

/// Default memory limit of one Lua state.
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Instructions between two timeout checks.
const HOOK_INTERVAL: u32 = 1_000;

/// Helpers layered over `coroutine.yield` once the host tables exist.
const PRELUDE: &str = r#"
local yield = coroutine.yield

function computer.pull_event_raw(filter)
    return yield(filter)
end

function computer.pull_event(filter)
    local event = table.pack(yield(filter))
    if event[1] == "terminate" then
        error("Terminated", 0)
    end
    return table.unpack(event, 1, event.n)
end
"#;

/// Wrappers which pass every protected call's results through `check`.
///
/// Kept in Lua so yields still cross `pcall`.
const GUARDS: &str = r#"
local check = ...
local raw_pcall, raw_xpcall = pcall, xpcall
local raw_resume, raw_wrap = coroutine.resume, coroutine.wrap

pcall = function(...) return check(raw_pcall(...)) end
xpcall = function(...) return check(raw_xpcall(...)) end
coroutine.resume = function(...) return check(raw_resume(...)) end
coroutine.wrap = function(f)
    local resume = raw_wrap(f)
    return function(...) return check(resume(...)) end
end
"#;

type LoadArgs = (LuaValue, Option<String>, Option<String>, Option<Table>);
type RequestArgs = (LuaValue, Option<mlua::String>, Option<Table>);

/// Creates a [`LuaMachine`] running the same bios on every boot.
pub struct LuaMachineFactory {
    bios: Arc<str>,
    name: String,
    memory_limit: usize,
}

impl LuaMachineFactory {
    pub fn new(bios: impl Into<String>) -> Self {
        Self {
            bios: Arc::from(bios.into()),
            name: "bios.lua".to_string(),
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }

    /// Load the bios from a file. The chunk is named after the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bios.lua".to_string());
        Ok(Self {
            name,
            ..Self::new(source)
        })
    }

    /// Set the memory limit in bytes. 0 disables it.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = limit;
        self
    }
}

impl MachineFactory for LuaMachineFactory {
    fn create(&self, env: MachineEnvironment) -> Result<Box<dyn Machine>> {
        let machine = LuaMachine::new(&self.bios, &self.name, self.memory_limit, env)?;
        Ok(Box::new(machine))
    }
}

/// A Lua state with the bios coroutine.
pub struct LuaMachine {
    lua: Lua,
    main: Option<Thread>,
    timeout: Arc<TimeoutState>,
    warned: Arc<AtomicBool>,
    computer_id: u32,
}

impl LuaMachine {
    fn new(bios: &str, name: &str, memory_limit: usize, env: MachineEnvironment) -> Result<Self> {
        let lua = Lua::new();
        let computer_id = env.computer.id();

        if memory_limit > 0 {
            lua.set_memory_limit(memory_limit)
                .map_err(|e| machine_error("failed to set memory limit", e))?;
        }

        register_computer(&lua, &env)
            .map_err(|e| machine_error("failed to register computer", e))?;
        if env.apis.get::<HttpApi>(HTTP_API).is_some() {
            register_http(&lua, &env.apis)
                .map_err(|e| machine_error("failed to register http", e))?;
        }
        lua.load(PRELUDE)
            .set_name("prelude")
            .exec()
            .map_err(|e| machine_error("failed to run prelude", e))?;
        apply_sandbox(&lua, computer_id)
            .map_err(|e| machine_error("failed to apply sandbox", e))?;
        install_guards(&lua, &env.timeout)
            .map_err(|e| machine_error("failed to install guards", e))?;

        let warned = Arc::new(AtomicBool::new(false));
        install_hook(&lua, &env, Arc::clone(&warned));

        // Threads inherit the hook of the state they are created from.
        let function: Function = lua
            .load(bios)
            .set_name(name)
            .into_function()
            .map_err(|e| CoreError::Machine(format!("bios failed to compile: {}", e)))?;
        let main = lua
            .create_thread(function)
            .map_err(|e| machine_error("failed to create bios thread", e))?;

        debug!(computer_id, "Lua machine created");
        Ok(Self {
            lua,
            main: Some(main),
            timeout: env.timeout,
            warned,
            computer_id,
        })
    }

    fn event_args(&self, event: Option<&Event>) -> mlua::Result<MultiValue> {
        let mut args = MultiValue::new();
        if let Some(event) = event {
            args.push_back(LuaValue::String(self.lua.create_string(&event.name)?));
            for arg in &event.args {
                args.push_back(convert::to_lua(&self.lua, arg)?);
            }
        }
        Ok(args)
    }
}

impl Machine for LuaMachine {
    fn handle_event(&mut self, event: Option<&Event>) -> MachineResult {
        let Some(main) = &self.main else {
            return MachineResult::Error("machine is closed".to_string());
        };
        self.warned.store(false, Ordering::Relaxed);

        let args = match self.event_args(event) {
            Ok(args) => args,
            Err(e) => return MachineResult::Error(e.to_string()),
        };

        match main.resume::<MultiValue>(args) {
            Ok(values) => match main.status() {
                ThreadStatus::Resumable => {
                    let filter = match values.front() {
                        Some(LuaValue::String(s)) => Some(s.to_string_lossy()),
                        _ => None,
                    };
                    MachineResult::Yield { filter }
                }
                _ => MachineResult::Completed,
            },
            Err(_) if self.timeout.is_hard_limit_exceeded() => {
                MachineResult::Error(ABORT_MESSAGE.to_string())
            }
            Err(e) => MachineResult::Error(error_message(&e)),
        }
    }

    fn close(&mut self) {
        self.main = None;
        let _ = self.lua.remove_hook();
        debug!(computer_id = self.computer_id, "Lua machine closed");
    }

    fn describe_state(&self, out: &mut String) {
        let status = match &self.main {
            Some(main) => format!("{:?}", main.status()),
            None => "closed".to_string(),
        };
        out.push_str(&format!(
            "Lua machine, bios {}, memory {} bytes",
            status,
            self.lua.used_memory()
        ));
    }
}

fn machine_error(context: &str, error: mlua::Error) -> CoreError {
    CoreError::Machine(format!("{}: {}", context, error))
}

/// Message of a Lua error without the callback wrapping mlua adds.
fn error_message(error: &mlua::Error) -> String {
    match error {
        mlua::Error::CallbackError { cause, .. } => error_message(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Remove globals that reach outside the computer.
fn apply_sandbox(lua: &Lua, computer_id: u32) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in [
        "os",
        "io",
        "loadfile",
        "dofile",
        "require",
        "package",
        "debug",
        "collectgarbage",
    ] {
        globals.set(name, LuaValue::Nil)?;
    }

    // `load` stays, restricted to text chunks.
    let load: Function = globals.get("load")?;
    let text_only = lua.create_function(move |_, (chunk, name, _mode, env): LoadArgs| {
        match env {
            Some(env) => load.call::<MultiValue>((chunk, name, "t", env)),
            None => load.call::<MultiValue>((chunk, name, "t")),
        }
    })?;
    globals.set("load", text_only)?;

    // `print` goes to the log rather than the host's stdout.
    let print = lua.create_function(move |_, args: MultiValue| {
        let line = args
            .iter()
            .map(|value| value.to_string())
            .collect::<mlua::Result<Vec<_>>>()?
            .join("\t");
        debug!(computer_id, output = %line, "Lua print");
        Ok(())
    })?;
    globals.set("print", print)?;
    Ok(())
}

fn install_guards(lua: &Lua, timeout: &Arc<TimeoutState>) -> mlua::Result<()> {
    let timeout = Arc::clone(timeout);
    let check = lua.create_function(move |_, results: MultiValue| {
        if timeout.is_hard_limit_exceeded() {
            return Err(mlua::Error::RuntimeError(ABORT_MESSAGE.to_string()));
        }
        Ok(results)
    })?;
    lua.load(GUARDS).set_name("guards").call::<()>(check)
}

fn install_hook(lua: &Lua, env: &MachineEnvironment, warned: Arc<AtomicBool>) {
    let timeout = Arc::clone(&env.timeout);
    let policy = env.soft_limit_policy;
    let computer_id = env.computer.id();

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            timeout.tick();
            if timeout.is_hard_limit_exceeded() {
                return Err(mlua::Error::RuntimeError(ABORT_MESSAGE.to_string()));
            }
            if timeout.is_soft_limit_exceeded() {
                match policy {
                    SoftLimitPolicy::Error => {
                        return Err(mlua::Error::RuntimeError(ABORT_MESSAGE.to_string()));
                    }
                    SoftLimitPolicy::Warn => {
                        if !warned.swap(true, Ordering::Relaxed) {
                            warn!(computer_id, "Computer is running past its time slice");
                        }
                    }
                }
            }
            Ok(VmState::Continue)
        },
    );
}

/// The `computer` table.
fn register_computer(lua: &Lua, env: &MachineEnvironment) -> mlua::Result<()> {
    let computer = lua.create_table()?;
    let handle = env.computer.clone();

    let id = handle.id();
    computer.set("id", lua.create_function(move |_, ()| Ok(id))?)?;

    let h = handle.clone();
    computer.set("label", lua.create_function(move |_, ()| Ok(h.label()))?)?;

    let h = handle.clone();
    computer.set(
        "set_label",
        lua.create_function(move |_, label: Option<String>| {
            h.set_label(label);
            Ok(())
        })?,
    )?;

    let h = handle.clone();
    computer.set(
        "queue_event",
        lua.create_function(move |_, (name, args): (String, MultiValue)| {
            let args = args
                .iter()
                .map(convert::from_lua)
                .collect::<mlua::Result<Vec<_>>>()?;
            Ok(h.queue_event(&name, args))
        })?,
    )?;

    let h = handle.clone();
    computer.set(
        "shutdown",
        lua.create_function(move |_, ()| {
            h.shutdown();
            Ok(())
        })?,
    )?;

    let h = handle;
    computer.set(
        "reboot",
        lua.create_function(move |_, ()| {
            h.reboot();
            Ok(())
        })?,
    )?;

    let names: Vec<String> = env.apis.names().map(str::to_string).collect();
    computer.set("apis", lua.create_function(move |_, ()| Ok(names.clone()))?)?;

    let timeout = Arc::clone(&env.timeout);
    computer.set(
        "is_time_slice_exceeded",
        lua.create_function(move |_, ()| {
            Ok(timeout.should_pause() || timeout.is_soft_limit_exceeded())
        })?,
    )?;

    lua.globals().set("computer", computer)?;
    Ok(())
}

/// The `http` table, present when the computer has the HTTP API.
fn register_http(lua: &Lua, apis: &Arc<ApiRegistry>) -> mlua::Result<()> {
    let http = lua.create_table()?;

    let registry = Arc::clone(apis);
    http.set(
        "request",
        lua.create_function(move |_, (target, body, headers): RequestArgs| {
            let request = match target {
                LuaValue::Table(options) => request_from_table(&options)?,
                LuaValue::String(url) => {
                    let mut request = HttpRequest::get(url.to_str()?.to_string());
                    request.body = body.map(|b| b.as_bytes().to_vec());
                    request.headers = headers_from_table(headers.as_ref())?;
                    request
                }
                other => {
                    return Err(mlua::Error::RuntimeError(format!(
                        "bad argument #1 (string or table expected, got {})",
                        other.type_name()
                    )))
                }
            };
            Ok(outcome(http_api(&registry)?.request(request)))
        })?,
    )?;

    let registry = Arc::clone(apis);
    http.set(
        "check_url",
        lua.create_function(move |_, url: String| {
            Ok(outcome(http_api(&registry)?.check_url(&url)))
        })?,
    )?;

    let registry = Arc::clone(apis);
    http.set(
        "websocket",
        lua.create_function(move |_, (url, headers): (String, Option<Table>)| {
            let headers = headers_from_table(headers.as_ref())?;
            Ok(outcome(http_api(&registry)?.websocket(&url, headers)))
        })?,
    )?;

    lua.globals().set("http", http)?;
    Ok(())
}

fn http_api(apis: &ApiRegistry) -> mlua::Result<&HttpApi> {
    apis.get::<HttpApi>(HTTP_API)
        .ok_or_else(|| mlua::Error::RuntimeError("HTTP is not available".to_string()))
}

fn outcome(result: std::result::Result<(), String>) -> (bool, Option<String>) {
    match result {
        Ok(()) => (true, None),
        Err(message) => (false, Some(message)),
    }
}

fn request_from_table(options: &Table) -> mlua::Result<HttpRequest> {
    let url: String = options.get("url")?;
    let body: Option<mlua::String> = options.get("body")?;
    let headers: Option<Table> = options.get("headers")?;
    let method: Option<String> = options.get("method")?;
    let redirect: Option<bool> = options.get("redirect")?;
    let timeout: Option<f64> = options.get("timeout")?;

    Ok(HttpRequest {
        url,
        method,
        headers: headers_from_table(headers.as_ref())?,
        body: body.map(|b| b.as_bytes().to_vec()),
        redirect: redirect.unwrap_or(true),
        timeout: timeout.map(request_timeout).transpose()?,
    })
}

/// A timeout in seconds, as given to `http.request`.
fn request_timeout(seconds: f64) -> mlua::Result<Duration> {
    if !(0.0..=MAX_TIMEOUT.as_secs_f64()).contains(&seconds) {
        return Err(mlua::Error::RuntimeError(format!(
            "timeout out of range ({})",
            seconds
        )));
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn headers_from_table(headers: Option<&Table>) -> mlua::Result<Vec<(String, String)>> {
    let Some(headers) = headers else {
        return Ok(Vec::new());
    };
    headers
        .clone()
        .pairs::<String, String>()
        .collect::<mlua::Result<Vec<_>>>()
}
