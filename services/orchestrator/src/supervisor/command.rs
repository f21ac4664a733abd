//! Command lines, log files and exit codes for supervised processes.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde_json::Value;
use sfw_id::InstanceId;

use crate::definition::{ConfigMap, EntryPoint};

/// Environment variable carrying the instance id into the process.
pub const INSTANCE_ID_ENV: &str = "SERVICE_INSTANCE_ID";

/// Characters of captured output attached to a start failure.
pub const LOG_TAIL_CHARS: usize = 1000;

/// Entry point argv, then one flag per config entry in key order, then
/// `--instance-id <id>`.
///
/// `true` becomes a bare `--key`; `false` and `null` are left out. Strings are
/// passed verbatim, other scalars in their JSON form, arrays and objects as
/// compact JSON.
pub fn build_argv(entry_point: &EntryPoint, config: &ConfigMap, instance_id: &InstanceId) -> Vec<String> {
    let mut argv = entry_point.argv();
    for (key, value) in config {
        match value {
            Value::Bool(true) => argv.push(format!("--{key}")),
            Value::Bool(false) | Value::Null => {}
            Value::String(s) => {
                argv.push(format!("--{key}"));
                argv.push(s.clone());
            }
            other => {
                argv.push(format!("--{key}"));
                argv.push(other.to_string());
            }
        }
    }
    argv.push("--instance-id".to_string());
    argv.push(instance_id.to_string());
    argv
}

/// `<log_dir>/<name>_<id>.log`
pub fn log_path(log_dir: &Path, service_name: &str, instance_id: &InstanceId) -> PathBuf {
    log_dir.join(format!("{service_name}_{instance_id}.log"))
}

/// Last `max_chars` characters of a log file, empty when unreadable.
pub fn log_tail(path: &Path, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let start = text
        .char_indices()
        .rev()
        .nth(max_chars - 1)
        .map_or(0, |(i, _)| i);
    text[start..].to_string()
}

/// Exit code, or 128 + signal number for a process killed by a signal.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    128
}
