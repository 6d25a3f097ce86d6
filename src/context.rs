//! The host-facing entry point: one context owns everything computers share.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::computer::{
    ApiFactory, Computer, ComputerExecutor, ComputerScheduler, ComputerServices, MachineFactory,
    MainThread,
};
use crate::config::{AddressRuleConfig, Config};
use crate::firewall::{Firewall, RuleSet};
use crate::http::HttpService;
use crate::Result;

/// Shared services for a group of computers.
///
/// The host drives it by calling [`ComputerContext::on_server_tick`] from
/// its main loop.
pub struct ComputerContext {
    config: Config,
    scheduler: ComputerScheduler,
    main_thread: Arc<MainThread>,
    firewall: Arc<Firewall>,
    http: Option<HttpService>,
    services: Arc<ComputerServices>,
    computers: Mutex<Vec<Arc<ComputerExecutor>>>,
}

impl ComputerContext {
    /// Create a context. The configuration is validated first.
    pub fn new(config: Config, machine_factory: Arc<dyn MachineFactory>) -> Result<Self> {
        config.validate()?;

        let firewall = Arc::new(Firewall::from_config(&config.http.rules)?);
        let main_thread = Arc::new(MainThread::new(Duration::from_millis(
            config.scheduler.max_main_thread_time_ms,
        )));

        let mut api_factories: Vec<Arc<dyn ApiFactory>> = Vec::new();
        let http = if config.http.enabled {
            let service = HttpService::new(&config.http, Arc::clone(&firewall))?;
            api_factories.push(Arc::new(service.api_factory()));
            Some(service)
        } else {
            info!("HTTP API disabled");
            None
        };

        let services = Arc::new(ComputerServices {
            machine_factory,
            api_factories: RwLock::new(api_factories),
            main_thread: Arc::clone(&main_thread),
            soft_limit_policy: config.scheduler.soft_limit_policy,
            event_queue_limit: config.scheduler.event_queue_limit,
        });

        let scheduler = ComputerScheduler::new(&config.scheduler);

        info!(
            workers = config.scheduler.worker_threads,
            http = config.http.enabled,
            rules = firewall.snapshot().len(),
            "Computer context created"
        );

        Ok(Self {
            config,
            scheduler,
            main_thread,
            firewall,
            http,
            services,
            computers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &ComputerScheduler {
        &self.scheduler
    }

    pub fn main_thread(&self) -> &Arc<MainThread> {
        &self.main_thread
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    /// The network service, if HTTP is enabled.
    pub fn http(&self) -> Option<&HttpService> {
        self.http.as_ref()
    }

    /// Register an API offered to every computer from its next boot on.
    pub fn add_api_factory(&self, factory: Arc<dyn ApiFactory>) {
        self.services
            .api_factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(factory);
    }

    /// Create a computer. It starts off; call [`Computer::turn_on`].
    pub fn create_computer(&self, id: u32, label: Option<String>) -> Computer {
        let executor =
            ComputerExecutor::new(id, label, &self.scheduler, Arc::clone(&self.services));
        self.computers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&executor));
        debug!(computer_id = id, "Computer created");
        Computer::new(executor)
    }

    /// Number of computers not yet unloaded.
    pub fn computer_count(&self) -> usize {
        self.computers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run one host tick.
    ///
    /// Runs pending main-thread tasks within their budget, delivers
    /// environment changes, updates APIs, and forgets unloaded computers.
    pub fn on_server_tick(&self) {
        self.main_thread.run_tasks();

        let computers = {
            let mut computers = self.computers.lock().unwrap_or_else(PoisonError::into_inner);
            computers.retain(|computer| !computer.is_finished());
            computers.clone()
        };
        for computer in computers {
            computer.tick();
        }
    }

    /// Replace the firewall rules. Requests already running keep the old rules.
    pub fn reload_rules(&self, rules: &[AddressRuleConfig]) -> Result<()> {
        let rules = RuleSet::from_config(rules)?;
        self.firewall.reload(rules);
        Ok(())
    }

    /// Unload every computer and stop the scheduler.
    ///
    /// Returns `false` if workers were still busy when `timeout` ran out.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let computers: Vec<_> = self
            .computers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        info!(computers = computers.len(), "Shutting down computer context");

        for computer in &computers {
            computer.queue_stop(false, true);
        }

        let clean = self.scheduler.shutdown(timeout);
        if clean {
            info!(elapsed = ?start.elapsed(), "Computer context stopped");
        } else {
            warn!(elapsed = ?start.elapsed(), "Computer context did not stop in time");
        }
        clean
    }
}
