//! Controller configuration: YAML file, `RELAY_*` environment overrides, validation.

use budget::{ModeThresholds, MonitorConfig, DEFAULT_FALLBACK_RATIO};
use policy::PolicyConfig;
use relay_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Everything the controller needs at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// gRPC listen address for `serve`.
    pub listen_addr: String,
    /// Monthly spending ceiling, in the cost source's currency.
    pub budget_limit: f64,
    pub thresholds: ModeThresholds,
    pub policy: PolicyConfig,
    pub poll_interval_secs: u64,
    pub reap_interval_secs: u64,
    pub source_timeout_secs: u64,
    /// Ratio assumed while the cost source is failing.
    pub fallback_ratio: f64,
    /// Sessions without a heartbeat for this long are reaped; `None` disables idle cleanup.
    pub idle_timeout_secs: Option<u64>,
    pub terminate_on_shutdown: bool,
    /// JSON file read by the built-in cost source.
    pub cost_source_path: Option<PathBuf>,
    /// JSONL audit log; `None` disables auditing.
    pub audit_log_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50061".into(),
            budget_limit: 1_000.0,
            thresholds: ModeThresholds::default(),
            policy: PolicyConfig::default(),
            poll_interval_secs: 300,
            reap_interval_secs: 30,
            source_timeout_secs: 10,
            fallback_ratio: DEFAULT_FALLBACK_RATIO,
            idle_timeout_secs: Some(120),
            terminate_on_shutdown: true,
            cost_source_path: None,
            audit_log_path: None,
        }
    }
}

impl ControllerConfig {
    pub fn load_from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let display = path.as_ref().display().to_string();
        let f = File::open(&path).map_err(|e| ConfigError::Io { path: display.clone(), source: e })?;
        serde_yaml::from_reader(BufReader::new(f))
            .map_err(|e| ConfigError::Parse { path: display, message: e.to_string() })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::Parse { path: "<inline>".into(), message: e.to_string() })
    }

    /// Load `path` if given (defaults otherwise), apply process env overrides and validate.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::load_from_yaml_path(p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `RELAY_*` overrides read through `lookup`. Empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("RELAY_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = get("RELAY_BUDGET_LIMIT") {
            self.budget_limit = parse_env("RELAY_BUDGET_LIMIT", &v)?;
        }
        if let Some(v) = get("RELAY_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_env("RELAY_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("RELAY_REAP_INTERVAL_SECS") {
            self.reap_interval_secs = parse_env("RELAY_REAP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("RELAY_FALLBACK_RATIO") {
            self.fallback_ratio = parse_env("RELAY_FALLBACK_RATIO", &v)?;
        }
        if let Some(v) = get("RELAY_COST_SOURCE_PATH") {
            self.cost_source_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("RELAY_AUDIT_LOG_PATH") {
            self.audit_log_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitor_config().validate()?;
        self.thresholds.validate()?;
        self.policy.validate()?;
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::invalid("reap_interval_secs must be non-zero"));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(ConfigError::invalid("idle_timeout_secs must be non-zero when set"));
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid(format!(
                "listen_addr {:?} is not a socket address",
                self.listen_addr
            )));
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            budget_limit: self.budget_limit,
            poll_interval: self.poll_interval(),
            source_timeout: Duration::from_secs(self.source_timeout_secs),
            fallback_ratio: self.fallback_ratio,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::invalid(format!("{key}={raw:?} is not valid: {e}")))
}
