use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use ccore::{ComputerContext, Config, LuaMachineFactory};

/// Host ticks per second.
const TICK_RATE: u32 = 20;

fn main() {
    let Some(bios) = std::env::args().nth(1) else {
        eprintln!("Usage: ccore <bios.lua>");
        std::process::exit(2);
    };

    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = ccore::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        ccore::logging::init_console_only(&config.logging.level);
    }

    info!("ccore {}", env!("CARGO_PKG_VERSION"));

    let factory = match LuaMachineFactory::from_file(&bios) {
        Ok(factory) => factory,
        Err(e) => {
            error!(path = %bios, error = %e, "Failed to read bios");
            std::process::exit(1);
        }
    };

    let context = match ComputerContext::new(config, Arc::new(factory)) {
        Ok(context) => context,
        Err(e) => {
            error!(error = %e, "Failed to create computer context");
            std::process::exit(1);
        }
    };

    let computer = context.create_computer(0, None);
    computer.turn_on();
    info!(computer_id = computer.id(), bios = %bios, "Computer booting");

    let tick = Duration::from_secs(1) / TICK_RATE;
    loop {
        let start = Instant::now();
        context.on_server_tick();

        if !computer.is_on() && !computer.has_pending_command() {
            break;
        }

        if let Some(rest) = tick.checked_sub(start.elapsed()) {
            thread::sleep(rest);
        }
    }

    match computer.last_error() {
        Some(message) => error!(computer_id = computer.id(), "Computer crashed: {}", message),
        None => info!(computer_id = computer.id(), "Computer turned off"),
    }

    drop(computer);
    if !context.shutdown(Duration::from_secs(5)) {
        error!("Workers did not stop in time");
    }
}
