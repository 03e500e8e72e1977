//! Step and check progress tracking
//!
//! Each cluster carries an ordered list of named steps; each step owns named
//! checks. Checks record failure counts and retry deadlines so that repeated
//! short invocations can resume exactly where the previous one stopped.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

use crate::config::{Timings, MAX_CHECK_FAILURES};

pub const STEP_PROVISIONING: &str = "Provisioning";
pub const STEP_INSTALLING: &str = "Installing";
pub const STEP_CONFIGURING: &str = "Configuring";

/// Status shared by steps and checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

/// One unit of verifiable work inside a step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub name: String,

    #[serde(default)]
    pub status: StepStatus,

    #[serde(default)]
    pub failure_count: u32,

    /// Earliest next attempt after a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Check {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A check that failed `MAX_CHECK_FAILURES` times stays failed
    pub fn permanently_failed(&self) -> bool {
        self.status == StepStatus::Failed && self.failure_count >= MAX_CHECK_FAILURES
    }

    /// Whether the check may execute now
    ///
    /// An `InProgress` check is re-eligible once `in_progress_timeout` has
    /// elapsed since it started (its tracking record was lost or expired); a
    /// failed check only once its retry deadline passed.
    pub fn eligible(&self, now: DateTime<Utc>, in_progress_timeout: Duration) -> bool {
        match self.status {
            StepStatus::Pending => true,
            StepStatus::Done | StepStatus::Skipped => false,
            StepStatus::InProgress => match self.start_time {
                Some(start) => {
                    now.signed_duration_since(start)
                        >= ChronoDuration::from_std(in_progress_timeout)
                            .unwrap_or(ChronoDuration::zero())
                }
                None => true,
            },
            StepStatus::Failed => {
                if self.permanently_failed() {
                    return false;
                }
                match self.retry_after {
                    Some(at) => now >= at,
                    None => true,
                }
            }
        }
    }

    /// Mark the check as started
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::InProgress;
        self.start_time = Some(now);
        self.end_time = None;
    }

    /// Mark the check as successfully completed
    pub fn succeed(&mut self, now: DateTime<Utc>, details: Option<String>) {
        self.status = StepStatus::Done;
        self.end_time = Some(now);
        self.retry_after = None;
        self.error_message = None;
        if details.is_some() {
            self.details = details;
        }
    }

    /// Record a failure and schedule the next attempt
    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.failure_count += 1;
        self.status = StepStatus::Failed;
        self.end_time = Some(now);
        self.error_message = Some(error.into());
        self.retry_after = if self.failure_count >= MAX_CHECK_FAILURES {
            None
        } else {
            let backoff = Timings::check_backoff(self.failure_count);
            Some(now + ChronoDuration::from_std(backoff).unwrap_or(ChronoDuration::zero()))
        };
    }
}

/// An ordered group of checks with a derived status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,

    #[serde(default)]
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<Check>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn check(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Find or append a check with the given name
    pub fn ensure_check(&mut self, name: &str) -> &mut Check {
        if let Some(idx) = self.checks.iter().position(|c| c.name == name) {
            return &mut self.checks[idx];
        }
        self.checks.push(Check::new(name));
        self.checks.last_mut().unwrap()
    }

    /// Recompute the step status from its checks
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if self.checks.iter().any(|c| c.permanently_failed()) {
            self.status = StepStatus::Failed;
            self.end_time.get_or_insert(now);
            return;
        }
        if self.status == StepStatus::Skipped {
            return;
        }
        if !self.checks.is_empty()
            && self
                .checks
                .iter()
                .all(|c| matches!(c.status, StepStatus::Done | StepStatus::Skipped))
        {
            self.status = StepStatus::Done;
            self.end_time.get_or_insert(now);
            return;
        }
        if self
            .checks
            .iter()
            .any(|c| c.status != StepStatus::Pending)
        {
            self.status = StepStatus::InProgress;
            self.start_time.get_or_insert(now);
            self.end_time = None;
        }
    }

    /// Force-complete the step without running its checks
    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Done;
        self.end_time.get_or_insert(now);
        for check in &mut self.checks {
            if check.status != StepStatus::Done {
                check.status = StepStatus::Skipped;
            }
        }
    }
}

/// Per-cluster progress: the operation name and its ordered steps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMetrics {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl ProgressMetrics {
    /// Initialize the creation steps exactly once, in order
    pub fn ensure_creation_steps(&mut self) {
        if !self.steps.is_empty() {
            return;
        }
        self.operation = "create".to_string();
        for name in [STEP_PROVISIONING, STEP_INSTALLING, STEP_CONFIGURING] {
            self.steps.push(Step::new(name));
        }
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> &mut Step {
        if let Some(idx) = self.steps.iter().position(|s| s.name == name) {
            return &mut self.steps[idx];
        }
        self.steps.push(Step::new(name));
        self.steps.last_mut().unwrap()
    }

    /// Synthetically complete every step before `name` in the fixed order
    ///
    /// Used when a cluster enters a later phase without having executed the
    /// earlier steps in this process (adopted resources, restarts).
    pub fn mark_done_before(&mut self, name: &str, now: DateTime<Utc>) {
        let order = [STEP_PROVISIONING, STEP_INSTALLING, STEP_CONFIGURING];
        let Some(limit) = order.iter().position(|n| *n == name) else {
            return;
        };
        for step_name in &order[..limit] {
            let step = self.step_mut(step_name);
            if step.status != StepStatus::Done {
                step.mark_done(now);
            }
        }
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Done | StepStatus::Skipped))
            .count()
    }

    /// Human-readable progress view
    pub fn render(&self, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} ({}/{} steps completed)",
            if self.operation.is_empty() {
                "reconcile"
            } else {
                &self.operation
            },
            self.completed_steps(),
            self.steps.len()
        );
        for step in &self.steps {
            let _ = writeln!(out, "  [{:?}] {}", step.status, step.name);
            for check in &step.checks {
                let mut line = format!("    [{:?}] {}", check.status, check.name);
                if check.failure_count > 0 {
                    let _ = write!(line, " (failures: {})", check.failure_count);
                }
                if check.permanently_failed() {
                    line.push_str(" PERMANENTLY FAILED");
                } else if let Some(retry) = check.retry_after {
                    let wait = retry.signed_duration_since(now).num_seconds();
                    if wait > 0 {
                        let _ = write!(line, " (retry in {}s)", wait);
                    }
                }
                if let Some(err) = &check.error_message {
                    let _ = write!(line, ": {}", err);
                }
                let _ = writeln!(out, "{}", line);
            }
        }
        out
    }
}
