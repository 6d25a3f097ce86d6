//! Configuration module for the computer core.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::firewall::{Action, PartialOptions, RuleSet};
use crate::{CoreError, Result};

/// What the Lua machine does once a step passes the soft limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SoftLimitPolicy {
    /// Log a warning once per step and keep running until the hard limit.
    #[default]
    Warn,
    /// Raise a catchable "Too long without yielding" error inside the script.
    Error,
}

/// Scheduler and timeout configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads executing computers.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Soft limit for a single step, in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Additional time after the soft limit before a step is aborted.
    #[serde(default = "default_abort_timeout")]
    pub abort_timeout_ms: u64,
    /// Target time for every queued computer to get one step.
    #[serde(default = "default_latency")]
    pub latency_ms: u64,
    /// Lower bound for a computer's time slice.
    #[serde(default = "default_min_period")]
    pub min_period_ms: u64,
    /// How often the monitor checks running computers while idle.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    /// Maximum number of pending events per computer.
    #[serde(default = "default_event_queue_limit")]
    pub event_queue_limit: usize,
    /// Behaviour once the soft limit is exceeded.
    #[serde(default)]
    pub soft_limit_policy: SoftLimitPolicy,
    /// Time budget for main-thread tasks in each server tick.
    #[serde(default = "default_max_main_thread_time")]
    pub max_main_thread_time_ms: u64,
}

fn default_worker_threads() -> usize {
    1
}

fn default_timeout() -> u64 {
    7000
}

fn default_abort_timeout() -> u64 {
    1500
}

fn default_latency() -> u64 {
    50
}

fn default_min_period() -> u64 {
    5
}

fn default_monitor_interval() -> u64 {
    100
}

fn default_event_queue_limit() -> usize {
    256
}

fn default_max_main_thread_time() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            timeout_ms: default_timeout(),
            abort_timeout_ms: default_abort_timeout(),
            latency_ms: default_latency(),
            min_period_ms: default_min_period(),
            monitor_interval_ms: default_monitor_interval(),
            event_queue_limit: default_event_queue_limit(),
            soft_limit_policy: SoftLimitPolicy::default(),
            max_main_thread_time_ms: default_max_main_thread_time(),
        }
    }
}

impl SchedulerConfig {
    /// Soft limit as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Grace period after the soft limit.
    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }
}

/// A single `[[http.rules]]` entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AddressRuleConfig {
    /// Host glob, IP address, CIDR block or `$private`.
    pub host: String,
    /// Allow or deny. Omit to only contribute limits.
    #[serde(default)]
    pub action: Option<Action>,
    /// Only match connections to this port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Request timeout in milliseconds, 0 for unlimited.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Maximum request size in bytes.
    #[serde(default)]
    pub max_upload: Option<u64>,
    /// Maximum response size in bytes.
    #[serde(default)]
    pub max_download: Option<u64>,
    /// Maximum websocket message size in bytes.
    #[serde(default)]
    pub max_websocket_message: Option<usize>,
}

impl AddressRuleConfig {
    /// A rule carrying only a host and an action.
    pub fn new(host: impl Into<String>, action: Action) -> Self {
        Self {
            host: host.into(),
            action: Some(action),
            port: None,
            timeout: None,
            max_upload: None,
            max_download: None,
            max_websocket_message: None,
        }
    }

    /// The options this rule contributes when it matches.
    pub fn partial_options(&self) -> PartialOptions {
        PartialOptions {
            action: self.action,
            max_upload: self.max_upload,
            max_download: self.max_download,
            timeout_ms: self.timeout,
            max_websocket_message: self.max_websocket_message,
        }
    }
}

/// HTTP and WebSocket configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Whether the `http` API is offered to computers.
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    /// Maximum concurrent HTTP requests per computer.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    /// Maximum open websockets per computer.
    #[serde(default = "default_max_websockets")]
    pub max_websockets: usize,
    /// Worker threads of the network runtime.
    #[serde(default = "default_network_threads")]
    pub network_threads: usize,
    /// Ordered address rules.
    #[serde(default = "default_rules")]
    pub rules: Vec<AddressRuleConfig>,
}

fn default_http_enabled() -> bool {
    true
}

fn default_max_requests() -> usize {
    16
}

fn default_max_websockets() -> usize {
    4
}

fn default_network_threads() -> usize {
    4
}

fn default_rules() -> Vec<AddressRuleConfig> {
    vec![
        AddressRuleConfig::new("$private", Action::Deny),
        AddressRuleConfig {
            max_download: Some(16 * 1024 * 1024),
            max_upload: Some(4 * 1024 * 1024),
            timeout: Some(30_000),
            max_websocket_message: Some(128 * 1024),
            ..AddressRuleConfig::new("*", Action::Allow)
        },
    ]
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            max_requests: default_max_requests(),
            max_websockets: default_max_websockets(),
            network_threads: default_network_threads(),
            rules: default_rules(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path. Empty logs to the console only.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/ccore.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// HTTP configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(CoreError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CoreError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `CCORE_LOG_LEVEL`: Override the log level
    /// - `CCORE_HTTP_ENABLED`: `true`/`false`, `1`/`0`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("CCORE_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }

        if let Ok(enabled) = std::env::var("CCORE_HTTP_ENABLED") {
            match enabled.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.http.enabled = true,
                "0" | "false" | "no" => self.http.enabled = false,
                _ => {}
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - there are no worker threads
    /// - the scaling periods are zero or inverted
    /// - any address rule is malformed
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.worker_threads == 0 {
            return Err(CoreError::Config(
                "scheduler.worker_threads must be at least 1".to_string(),
            ));
        }
        if scheduler.min_period_ms == 0 || scheduler.latency_ms < scheduler.min_period_ms {
            return Err(CoreError::Config(
                "scheduler.latency_ms must be at least scheduler.min_period_ms, which must be positive"
                    .to_string(),
            ));
        }
        if scheduler.monitor_interval_ms == 0 {
            return Err(CoreError::Config(
                "scheduler.monitor_interval_ms must be positive".to_string(),
            ));
        }
        if scheduler.event_queue_limit == 0 {
            return Err(CoreError::Config(
                "scheduler.event_queue_limit must be positive".to_string(),
            ));
        }
        if self.http.network_threads == 0 {
            return Err(CoreError::Config(
                "http.network_threads must be at least 1".to_string(),
            ));
        }

        RuleSet::from_config(&self.http.rules)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.scheduler.worker_threads, 1);
        assert_eq!(config.scheduler.timeout_ms, 7000);
        assert_eq!(config.scheduler.abort_timeout_ms, 1500);
        assert_eq!(config.scheduler.latency_ms, 50);
        assert_eq!(config.scheduler.min_period_ms, 5);
        assert_eq!(config.scheduler.monitor_interval_ms, 100);
        assert_eq!(config.scheduler.event_queue_limit, 256);
        assert_eq!(config.scheduler.soft_limit_policy, SoftLimitPolicy::Warn);

        assert!(config.http.enabled);
        assert_eq!(config.http.max_requests, 16);
        assert_eq!(config.http.max_websockets, 4);
        assert_eq!(config.http.rules.len(), 2);
        assert_eq!(config.http.rules[0].host, "$private");
        assert_eq!(config.http.rules[0].action, Some(Action::Deny));
        assert_eq!(config.http.rules[1].host, "*");

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/ccore.log");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[scheduler]
worker_threads = 4
timeout_ms = 2000
abort_timeout_ms = 500
latency_ms = 40
min_period_ms = 4
monitor_interval_ms = 50
event_queue_limit = 64
soft_limit_policy = "error"
max_main_thread_time_ms = 5

[http]
enabled = false
max_requests = 2
max_websockets = 1
network_threads = 2

[[http.rules]]
host = "*.example.com"
max_download = 1024

[[http.rules]]
host = "10.0.0.0/8"
port = 8080
action = "allow"

[[http.rules]]
host = "*"
action = "deny"

[logging]
level = "debug"
file = "custom/logs/core.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.scheduler.worker_threads, 4);
        assert_eq!(config.scheduler.timeout(), Duration::from_secs(2));
        assert_eq!(config.scheduler.abort_timeout(), Duration::from_millis(500));
        assert_eq!(config.scheduler.latency_ms, 40);
        assert_eq!(config.scheduler.min_period_ms, 4);
        assert_eq!(config.scheduler.monitor_interval_ms, 50);
        assert_eq!(config.scheduler.event_queue_limit, 64);
        assert_eq!(config.scheduler.soft_limit_policy, SoftLimitPolicy::Error);
        assert_eq!(config.scheduler.max_main_thread_time_ms, 5);

        assert!(!config.http.enabled);
        assert_eq!(config.http.max_requests, 2);
        assert_eq!(config.http.max_websockets, 1);
        assert_eq!(config.http.network_threads, 2);
        assert_eq!(config.http.rules.len(), 3);
        assert_eq!(config.http.rules[0].action, None);
        assert_eq!(config.http.rules[0].max_download, Some(1024));
        assert_eq!(config.http.rules[1].port, Some(8080));
        assert_eq!(config.http.rules[2].action, Some(Action::Deny));

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, "custom/logs/core.log");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[scheduler]
worker_threads = 2
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.scheduler.worker_threads, 2);
        assert_eq!(config.scheduler.timeout_ms, 7000);
        assert_eq!(config.http.rules.len(), 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.scheduler.worker_threads, 1);
        assert!(config.http.enabled);
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("this is not valid toml [[[");
        assert!(matches!(result, Err(CoreError::Config(_))));

        let result = Config::parse("[scheduler]\nsoft_limit_policy = \"explode\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(CoreError::Io(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"trace\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.scheduler.worker_threads = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_periods() {
        let mut config = Config::default();
        config.scheduler.latency_ms = 2;
        config.scheduler.min_period_ms = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_rule() {
        let toml = r#"
[[http.rules]]
host = "192.168.0.0/abc"
action = "deny"
"#;
        let config = Config::parse(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_apply_env_overrides_http_enabled() {
        let original = std::env::var("CCORE_HTTP_ENABLED").ok();

        std::env::set_var("CCORE_HTTP_ENABLED", "false");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert!(!config.http.enabled);

        std::env::set_var("CCORE_HTTP_ENABLED", "maybe");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert!(config.http.enabled);

        match original {
            Some(val) => std::env::set_var("CCORE_HTTP_ENABLED", val),
            None => std::env::remove_var("CCORE_HTTP_ENABLED"),
        }
    }

    #[test]
    fn test_apply_env_overrides_log_level() {
        let original = std::env::var("CCORE_LOG_LEVEL").ok();

        std::env::set_var("CCORE_LOG_LEVEL", "warn");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "warn");

        std::env::set_var("CCORE_LOG_LEVEL", "");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "info");

        match original {
            Some(val) => std::env::set_var("CCORE_LOG_LEVEL", val),
            None => std::env::remove_var("CCORE_LOG_LEVEL"),
        }
    }

    #[test]
    fn test_demo_config_is_valid() {
        let config = Config::parse(include_str!("../demos/config.toml")).unwrap();
        assert_eq!(config.scheduler.worker_threads, 2);
        assert_eq!(config.http.rules.len(), 2);
        assert_eq!(config.http.rules[1].max_websocket_message, Some(131072));
        assert!(config.validate().is_ok());
    }
}
