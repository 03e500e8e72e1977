//! Persistent registry of in-flight remote operations
//!
//! Remote commands and long-running in-VM processes outlive a single
//! reconciler invocation. Every started operation is recorded here before
//! the invocation returns, so the next invocation can pick up its result.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Key for a pending entry: `<step>/<check>`
pub fn command_key(step: &str, check: &str) -> String {
    format!("{}/{}", step, check)
}

/// A fire-and-forget remote command awaiting its result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommand {
    /// Remote exec backend command id
    pub command_id: String,

    pub instance_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,

    pub started_at: DateTime<Utc>,

    pub purpose: String,

    pub timeout_secs: u64,

    pub step_name: String,

    pub check_name: String,
}

impl PendingCommand {
    /// Deadline enforcement across invocations
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.started_at)
            > ChronoDuration::seconds(self.timeout_secs as i64)
    }
}

/// A long in-VM task tracked via pidfile and logfile
///
/// Each invocation fires a short probe command that reports either that the
/// pid is still alive or, once it has exited, the contents of the log file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundProcess {
    pub instance_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,

    pub pid_file: String,

    pub log_file: String,

    pub started_at: DateTime<Utc>,

    pub purpose: String,

    pub timeout_secs: u64,

    pub step_name: String,

    pub check_name: String,

    /// Probe command currently in flight, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_command_id: Option<String>,
}

impl BackgroundProcess {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.started_at)
            > ChronoDuration::seconds(self.timeout_secs as i64)
    }
}

/// Entry moved aside when the resource enters the delete path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedOperation {
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<PendingCommand>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<BackgroundProcess>,

    pub archived_at: DateTime<Utc>,
}

/// All outstanding operations for one cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperations {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, PendingCommand>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub background_processes: BTreeMap<String, BackgroundProcess>,
}

impl PendingOperations {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.background_processes.is_empty()
    }

    /// Register a command result to be collected by a later invocation
    #[allow(clippy::too_many_arguments)]
    pub fn add_command(
        &mut self,
        command_id: impl Into<String>,
        instance_name: impl Into<String>,
        instance_id: impl Into<String>,
        purpose: impl Into<String>,
        timeout: Duration,
        step_name: &str,
        check_name: &str,
        now: DateTime<Utc>,
    ) {
        let key = command_key(step_name, check_name);
        self.commands.insert(
            key,
            PendingCommand {
                command_id: command_id.into(),
                instance_name: instance_name.into(),
                instance_id: instance_id.into(),
                started_at: now,
                purpose: purpose.into(),
                timeout_secs: timeout.as_secs(),
                step_name: step_name.to_string(),
                check_name: check_name.to_string(),
            },
        );
    }

    /// Register a pidfile/logfile tracked background task
    #[allow(clippy::too_many_arguments)]
    pub fn add_background_process(
        &mut self,
        instance_name: impl Into<String>,
        instance_id: impl Into<String>,
        pid_file: impl Into<String>,
        log_file: impl Into<String>,
        purpose: impl Into<String>,
        timeout: Duration,
        step_name: &str,
        check_name: &str,
        now: DateTime<Utc>,
    ) {
        let key = command_key(step_name, check_name);
        self.background_processes.insert(
            key,
            BackgroundProcess {
                instance_name: instance_name.into(),
                instance_id: instance_id.into(),
                pid_file: pid_file.into(),
                log_file: log_file.into(),
                started_at: now,
                purpose: purpose.into(),
                timeout_secs: timeout.as_secs(),
                step_name: step_name.to_string(),
                check_name: check_name.to_string(),
                probe_command_id: None,
            },
        );
    }

    pub fn command_for(&self, step: &str, check: &str) -> Option<&PendingCommand> {
        self.commands.get(&command_key(step, check))
    }

    pub fn has_entry(&self, step: &str, check: &str) -> bool {
        let key = command_key(step, check);
        self.commands.contains_key(&key) || self.background_processes.contains_key(&key)
    }

    /// Drain every entry into the archive, preserving it for inspection
    pub fn archive_all(&mut self, now: DateTime<Utc>) -> Vec<ArchivedOperation> {
        let mut archived = Vec::new();
        for (key, command) in std::mem::take(&mut self.commands) {
            archived.push(ArchivedOperation {
                key,
                command: Some(command),
                process: None,
                archived_at: now,
            });
        }
        for (key, process) in std::mem::take(&mut self.background_processes) {
            archived.push(ArchivedOperation {
                key,
                command: None,
                process: Some(process),
                archived_at: now,
            });
        }
        archived
    }
}
