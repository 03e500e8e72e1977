//! Centralized timeout and requeue configuration
//!
//! This module defines all timing-related constants used by the reconciler:
//! lock lease durations, per-phase requeue intervals, remote command timeouts
//! and the check retry ladder.

use std::time::Duration;

/// Maximum attempts for a progress check before it fails permanently
pub const MAX_CHECK_FAILURES: u32 = 3;

/// Retries for a conditional status write that lost a race
pub const STATUS_WRITE_RETRIES: u32 = 3;

/// Timing configuration for one reconciler invocation
#[derive(Debug, Clone)]
pub struct Timings {
    /// How long to wait for the per-cluster lock before giving up
    pub lock_wait: Duration,

    /// Lock lease for cheap health passes (Running, Stopped)
    pub lock_ttl_health: Duration,

    /// Lock lease while mutating compute (Provisioning, Updating, power transitions)
    pub lock_ttl_provision: Duration,

    /// Lock lease while installing or configuring k3s
    pub lock_ttl_install: Duration,

    /// Lock lease for destructive paths (Deleting)
    pub lock_ttl_destroy: Duration,

    /// Requeue after initial admission (Pending)
    pub requeue_pending: Duration,

    /// Requeue while VMs are being created or changing state
    pub requeue_provisioning: Duration,

    /// Requeue while install commands are in flight
    pub requeue_installing: Duration,

    /// Requeue while the control plane is forming
    pub requeue_configuring: Duration,

    /// Requeue for steady-state health passes
    pub requeue_running: Duration,

    /// Requeue during rolling updates and power transitions
    pub requeue_transition: Duration,

    /// Requeue after demoting an unhealthy cluster back to Configuring
    pub requeue_unhealthy: Duration,

    /// Requeue while tearing down
    pub requeue_deleting: Duration,

    /// Requeue when the lock was held by another invocation
    pub requeue_lock_busy: Duration,

    /// Requeue after a corrupted document load
    pub requeue_corrupted: Duration,

    /// Timeout for the remote-exec readiness probe (`echo Ready`)
    pub cmd_readiness: Duration,

    /// Timeout for the k3s version probe
    pub cmd_version: Duration,

    /// Timeout for the k3s install script
    pub cmd_install: Duration,

    /// Timeout for first-master init and replica joins
    pub cmd_server: Duration,

    /// Timeout for short synchronous reads (token, kubeconfig, health probe)
    pub cmd_probe: Duration,

    /// Timeout for the node-readiness background process
    pub verify_background: Duration,

    /// Interval between steady-state k3s service probes
    pub health_probe_interval: Duration,

    /// Grace window before a down k3s service demotes Running
    pub service_down_grace: Duration,

    /// Overall wall-clock budget for one invocation
    pub invocation_budget: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(30),
            lock_ttl_health: Duration::from_secs(30),
            lock_ttl_provision: Duration::from_secs(120),
            lock_ttl_install: Duration::from_secs(180),
            lock_ttl_destroy: Duration::from_secs(300),

            requeue_pending: Duration::from_secs(5),
            requeue_provisioning: Duration::from_secs(10),
            requeue_installing: Duration::from_secs(30),
            requeue_configuring: Duration::from_secs(30),
            requeue_running: Duration::from_secs(60),
            requeue_transition: Duration::from_secs(15),
            requeue_unhealthy: Duration::from_secs(20),
            requeue_deleting: Duration::from_secs(5),
            requeue_lock_busy: Duration::from_secs(5),
            requeue_corrupted: Duration::from_secs(60),

            cmd_readiness: Duration::from_secs(30),
            cmd_version: Duration::from_secs(30),
            cmd_install: Duration::from_secs(300),
            cmd_server: Duration::from_secs(300),
            cmd_probe: Duration::from_secs(30),
            verify_background: Duration::from_secs(600),

            health_probe_interval: Duration::from_secs(60),
            service_down_grace: Duration::from_secs(90),
            invocation_budget: Duration::from_secs(600),
        }
    }
}

impl Timings {
    /// Backoff before the next attempt of a failed check: 1s, 2s, 4s
    pub fn check_backoff(failure_count: u32) -> Duration {
        let exp = failure_count.saturating_sub(1).min(2);
        Duration::from_secs(1 << exp)
    }

    /// Create a Timings with near-zero durations for testing
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            lock_wait: Duration::from_millis(50),
            lock_ttl_health: Duration::from_millis(500),
            lock_ttl_provision: Duration::from_secs(2),
            lock_ttl_install: Duration::from_secs(2),
            lock_ttl_destroy: Duration::from_secs(2),

            requeue_pending: Duration::from_millis(10),
            requeue_provisioning: Duration::from_millis(10),
            requeue_installing: Duration::from_millis(10),
            requeue_configuring: Duration::from_millis(10),
            requeue_running: Duration::from_millis(10),
            requeue_transition: Duration::from_millis(10),
            requeue_unhealthy: Duration::from_millis(10),
            requeue_deleting: Duration::from_millis(10),
            requeue_lock_busy: Duration::from_millis(10),
            requeue_corrupted: Duration::from_millis(10),

            cmd_readiness: Duration::from_secs(1),
            cmd_version: Duration::from_secs(1),
            cmd_install: Duration::from_secs(5),
            cmd_server: Duration::from_secs(5),
            cmd_probe: Duration::from_secs(1),
            verify_background: Duration::from_secs(5),

            health_probe_interval: Duration::from_millis(300),
            service_down_grace: Duration::from_millis(100),
            invocation_budget: Duration::from_secs(10),
        }
    }
}
