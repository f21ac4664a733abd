//! Service instance records and their lifecycle state machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sfw_id::InstanceId;

use crate::definition::ConfigMap;

/// Lifecycle status of an instance.
///
/// ```text
/// created -> starting -> running -> stopping -> stopped
///    \__________________/   \  \________________/
///                            \-> error <---------/
/// ```
///
/// `stopped` and `error` are terminal; a restart creates a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Stopped | InstanceStatus::Error)
    }

    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (*self, next),
            (Created, Starting)
                | (Created, Running)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime record of one attempt to run a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub name: String,
    /// Effective config after defaults were merged in.
    pub config: ConfigMap,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub endpoint: Option<String>,
    pub node_id: Option<String>,
    pub service_type: String,
    pub log_file: Option<PathBuf>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub metadata: ConfigMap,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, config: ConfigMap) -> Self {
        Self {
            id: InstanceId::new(),
            name: name.into(),
            config,
            status: InstanceStatus::Created,
            pid: None,
            endpoint: None,
            node_id: None,
            service_type: "process".to_string(),
            log_file: None,
            start_time: None,
            stop_time: None,
            exit_code: None,
            metadata: ConfigMap::new(),
        }
    }

    /// The configured `port`, if it is an integer.
    pub fn port(&self) -> Option<u16> {
        self.config
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
    }

    /// Time spent running as of `now`.
    ///
    /// Terminal instances report up to their stop time. Instances that never
    /// reached `running` report nothing.
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let start = self.start_time?;
        match (self.status, self.stop_time) {
            (status, Some(stop)) if status.is_terminal() => Some(stop - start),
            (InstanceStatus::Running, _) => Some(now - start),
            _ => None,
        }
    }

    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id,
            name: self.name.clone(),
            pid: self.pid,
            endpoint: self.endpoint.clone(),
            status: self.status,
            start_time: self.start_time,
            stop_time: self.stop_time,
            uptime: self.uptime(Utc::now()).map(seconds),
            node_id: self.node_id.clone(),
            service_type: self.service_type.clone(),
            config: self.config.clone(),
            log_file: self.log_file.clone(),
            metadata: self.metadata.clone(),
            exit_code: self.exit_code,
        }
    }

    pub(crate) fn to_entry(&self, now: DateTime<Utc>) -> InstanceEntry {
        InstanceEntry {
            id: self.id,
            status: self.status,
            pid: self.pid,
            endpoint: self.endpoint.clone(),
            uptime: self.uptime(now).map(seconds),
            node_id: self.node_id.clone(),
        }
    }
}

fn seconds(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

/// Serializable snapshot of an instance for management output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub name: String,
    pub pid: Option<u32>,
    pub endpoint: Option<String>,
    pub status: InstanceStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    /// Seconds.
    pub uptime: Option<f64>,
    pub node_id: Option<String>,
    pub service_type: String,
    pub config: ConfigMap,
    pub log_file: Option<PathBuf>,
    pub metadata: ConfigMap,
    pub exit_code: Option<i32>,
}

/// Field changes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub status: Option<InstanceStatus>,
    pub pid: Option<u32>,
    pub endpoint: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl StatusUpdate {
    pub fn to(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn stopped_at(mut self, at: DateTime<Utc>) -> Self {
        self.stop_time = Some(at);
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

/// One line of a [`StatusSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub pid: Option<u32>,
    pub endpoint: Option<String>,
    pub uptime: Option<f64>,
    pub node_id: Option<String>,
}

/// Instance counts by status, for one service or the whole registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    pub total_instances: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub instances: Vec<InstanceEntry>,
}

impl StatusSummary {
    pub(crate) fn collect<'a>(
        service_name: Option<String>,
        instances: impl IntoIterator<Item = &'a ServiceInstance>,
    ) -> Self {
        let now = Utc::now();
        let mut summary = Self {
            service_name,
            ..Self::default()
        };
        for instance in instances {
            summary.total_instances += 1;
            match instance.status {
                InstanceStatus::Running => summary.running += 1,
                InstanceStatus::Stopped => summary.stopped += 1,
                InstanceStatus::Error => summary.error += 1,
                _ => {}
            }
            summary.instances.push(instance.to_entry(now));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            InstanceStatus::Created,
            InstanceStatus::Starting,
            InstanceStatus::Running,
            InstanceStatus::Stopping,
            InstanceStatus::Stopped,
            InstanceStatus::Error,
        ];
        for terminal in [InstanceStatus::Stopped, InstanceStatus::Error] {
            for next in all {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_running_exits() {
        let running = InstanceStatus::Running;
        assert!(running.can_transition_to(InstanceStatus::Stopping));
        assert!(running.can_transition_to(InstanceStatus::Stopped));
        assert!(running.can_transition_to(InstanceStatus::Error));
        assert!(!running.can_transition_to(InstanceStatus::Starting));
        assert!(!running.can_transition_to(InstanceStatus::Running));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&InstanceStatus::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
    }

    #[test]
    fn test_uptime_by_status() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let now = start + chrono::Duration::seconds(90);

        let mut instance = ServiceInstance::new("web-1", ConfigMap::new());
        assert_eq!(instance.uptime(now), None);

        instance.start_time = Some(start);
        instance.status = InstanceStatus::Running;
        assert_eq!(instance.uptime(now), Some(chrono::Duration::seconds(90)));

        instance.status = InstanceStatus::Stopped;
        instance.stop_time = Some(start + chrono::Duration::seconds(30));
        assert_eq!(instance.uptime(now), Some(chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_summary_counts() {
        let mut a = ServiceInstance::new("web-1", ConfigMap::new());
        a.status = InstanceStatus::Running;
        let mut b = ServiceInstance::new("web-1", ConfigMap::new());
        b.status = InstanceStatus::Error;
        let c = ServiceInstance::new("web-1", ConfigMap::new());

        let summary = StatusSummary::collect(Some("web-1".into()), [&a, &b, &c]);
        assert_eq!(summary.total_instances, 3);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.stopped, 0);
        assert_eq!(summary.instances.len(), 3);
    }

    #[test]
    fn test_port_reads_integer_only() {
        let mut config = ConfigMap::new();
        config.insert("port".into(), 8123.into());
        assert_eq!(ServiceInstance::new("web-1", config).port(), Some(8123));

        let mut config = ConfigMap::new();
        config.insert("port".into(), "8123".into());
        assert_eq!(ServiceInstance::new("web-1", config).port(), None);
    }
}
