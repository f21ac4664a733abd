//! Configuration for the orchestration daemon.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::placement::Strategy;
use crate::supervisor::SupervisorConfig;

/// Engine configuration, read from `SFW_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory receiving per-instance log files.
    pub log_dir: PathBuf,

    /// Heartbeat checker tick in seconds. Instances silent for three ticks
    /// are marked as errored.
    pub heartbeat_interval_secs: u64,

    /// Process monitor tick in seconds.
    pub monitor_interval_secs: u64,

    /// Graceful stop timeout before escalating to SIGKILL.
    pub stop_timeout_secs: u64,

    /// Delay after spawn before the immediate-exit check.
    pub launch_grace_ms: u64,

    pub placement_strategy: Strategy,

    /// Optional JSON file holding an array of service definitions.
    pub definitions_path: Option<PathBuf>,

    /// Services started once the daemon is up.
    pub autostart: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            heartbeat_interval_secs: 30,
            monitor_interval_secs: 5,
            stop_timeout_secs: 10,
            launch_grace_ms: 500,
            placement_strategy: Strategy::Random,
            definitions_path: None,
            autostart: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let log_dir = lookup("SFW_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir);

        let heartbeat_interval_secs = lookup("SFW_HEARTBEAT_INTERVAL")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(defaults.heartbeat_interval_secs);

        let monitor_interval_secs = lookup("SFW_MONITOR_INTERVAL")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(defaults.monitor_interval_secs);

        let stop_timeout_secs = lookup("SFW_STOP_TIMEOUT")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.stop_timeout_secs);

        let launch_grace_ms = lookup("SFW_LAUNCH_GRACE_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.launch_grace_ms);

        // An unknown strategy is a startup error rather than a silent default.
        let placement_strategy = match lookup("SFW_PLACEMENT_STRATEGY") {
            Some(raw) => raw
                .parse::<Strategy>()
                .with_context(|| format!("SFW_PLACEMENT_STRATEGY={raw}"))?,
            None => defaults.placement_strategy,
        };

        let definitions_path = lookup("SFW_DEFINITIONS")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let autostart = lookup("SFW_AUTOSTART")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let log_level = lookup("SFW_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            log_dir,
            heartbeat_interval_secs,
            monitor_interval_secs,
            stop_timeout_secs,
            launch_grace_ms,
            placement_strategy,
            definitions_path,
            autostart,
            log_level,
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            log_dir: self.log_dir.clone(),
            launch_grace: Duration::from_millis(self.launch_grace_ms),
            monitor_interval: Duration::from_secs(self.monitor_interval_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("./logs"));
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.monitor_interval_secs, 5);
        assert_eq!(config.stop_timeout_secs, 10);
        assert_eq!(config.launch_grace_ms, 500);
        assert_eq!(config.placement_strategy, Strategy::Random);
        assert!(config.definitions_path.is_none());
        assert!(config.autostart.is_empty());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            ("SFW_LOG_DIR", "/tmp/sfw"),
            ("SFW_HEARTBEAT_INTERVAL", "2"),
            ("SFW_PLACEMENT_STRATEGY", "least_loaded"),
            ("SFW_AUTOSTART", "web-1, worker ,,"),
        ]))
        .unwrap();

        assert_eq!(config.log_dir, PathBuf::from("/tmp/sfw"));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.placement_strategy, Strategy::LeastLoaded);
        assert_eq!(config.autostart, vec!["web-1", "worker"]);
    }

    #[test]
    fn test_unparsable_numbers_fall_back() {
        let config = Config::from_lookup(lookup_from(&[
            ("SFW_HEARTBEAT_INTERVAL", "soon"),
            ("SFW_MONITOR_INTERVAL", "0"),
        ]))
        .unwrap();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.monitor_interval_secs, 5);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("SFW_PLACEMENT_STRATEGY", "fastest")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_supervisor_config_uses_units() {
        let config = Config::from_lookup(lookup_from(&[("SFW_LAUNCH_GRACE_MS", "50")])).unwrap();
        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.launch_grace, Duration::from_millis(50));
        assert_eq!(supervisor.stop_timeout, Duration::from_secs(10));
    }
}
