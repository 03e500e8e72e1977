//! Cluster resource model
//!
//! A cluster is described by two independently stored documents:
//! - `config` ({ metadata, spec }) written only by the CLI/editor
//! - `status` ({ metadata, status }) written only by the reconciler
//!
//! Unknown document keys are captured in spill maps so editor round-trips
//! are lossless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::pending::{ArchivedOperation, PendingOperations};
use super::progress::ProgressMetrics;

/// Unknown keys preserved across load/save cycles
pub type Spill = BTreeMap<String, serde_yml::Value>;

/// Object identity shared by both documents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    #[serde(default)]
    pub generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set by the collaborator to request teardown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub spill: Spill,
}

/// Cluster topology mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Dev,
    Ha,
}

impl Mode {
    /// Number of control-plane nodes implied by the mode
    pub fn master_count(self) -> u32 {
        match self {
            Mode::Dev => 1,
            Mode::Ha => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Dev => "dev",
            Mode::Ha => "ha",
        }
    }
}

/// Desired run state of the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Running,
    Stopped,
}

/// Network CIDR configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Pod network CIDR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_cidr: String,

    /// Service network CIDR
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_cidr: String,

    #[serde(flatten)]
    pub spill: Spill,
}

/// A pool of identically shaped worker nodes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub name: String,

    #[serde(default)]
    pub count: u32,

    /// Instance type for the pool; empty inherits the cluster type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<String>,

    #[serde(flatten)]
    pub spill: Spill,
}

/// Desired cluster shape, owned by the user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,

    pub instance_type: String,

    #[serde(default)]
    pub mode: Mode,

    /// Derived from mode when absent; immutable after first status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_count: Option<u32>,

    #[serde(default = "default_k3s_version")]
    pub k3s_version: String,

    #[serde(default)]
    pub network: NetworkSpec,

    #[serde(default)]
    pub desired_state: DesiredState,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_pools: Vec<NodePool>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(flatten)]
    pub spill: Spill,
}

fn default_k3s_version() -> String {
    "v1.33.4+k3s1".to_string()
}

/// One master/worker instance expected by the spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedInstance {
    pub name: String,
    pub role: InstanceRole,
    pub pool: Option<String>,
    pub instance_type: String,
}

impl ClusterSpec {
    /// Control-plane size, derived from mode when not set explicitly
    pub fn expected_masters(&self) -> u32 {
        self.master_count.unwrap_or_else(|| self.mode.master_count())
    }

    /// Full ordered VM set implied by the spec: masters first, then pools
    pub fn expected_instances(&self) -> Vec<ExpectedInstance> {
        let mut expected = Vec::new();
        for i in 0..self.expected_masters() {
            expected.push(ExpectedInstance {
                name: format!("master-{}", i),
                role: InstanceRole::Master,
                pool: None,
                instance_type: self.instance_type.clone(),
            });
        }
        for pool in &self.node_pools {
            let instance_type = if pool.instance_type.is_empty() {
                self.instance_type.clone()
            } else {
                pool.instance_type.clone()
            };
            for i in 0..pool.count {
                expected.push(ExpectedInstance {
                    name: format!("{}-{}", pool.name, i),
                    role: InstanceRole::Worker,
                    pool: Some(pool.name.clone()),
                    instance_type: instance_type.clone(),
                });
            }
        }
        expected
    }

    /// Total VM count the spec allows (masters plus all pool nodes)
    pub fn expected_total(&self) -> u32 {
        self.expected_masters() + self.node_pools.iter().map(|p| p.count).sum::<u32>()
    }
}

/// Coarse lifecycle label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Provisioning,
    Installing,
    Configuring,
    Running,
    Updating,
    Stopping,
    Stopped,
    Starting,
    Deleting,
    Failed,
}

impl ClusterPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Provisioning => "Provisioning",
            ClusterPhase::Installing => "Installing",
            ClusterPhase::Configuring => "Configuring",
            ClusterPhase::Running => "Running",
            ClusterPhase::Updating => "Updating",
            ClusterPhase::Stopping => "Stopping",
            ClusterPhase::Stopped => "Stopped",
            ClusterPhase::Starting => "Starting",
            ClusterPhase::Deleting => "Deleting",
            ClusterPhase::Failed => "Failed",
        }
    }
}

/// Instance role within the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    #[default]
    Master,
    Worker,
}

/// Observed VM state, mirroring the compute backend's lifecycle names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    #[default]
    Unknown,
}

impl VmState {
    /// True for states the compute backend will never leave
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Terminated)
    }
}

/// One tracked VM
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Compute backend id; `None` while the entry is a placeholder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub role: InstanceRole,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,

    #[serde(default)]
    pub state: VmState,

    pub instance_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub k3s_installed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s_install_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub k3s_running: bool,

    /// First time the k3s service was observed down while Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_down_since: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(flatten)]
    pub spill: Spill,
}

impl Instance {
    /// New tracked entry with no backend id yet
    pub fn placeholder(expected: &ExpectedInstance) -> Self {
        Self {
            id: None,
            name: expected.name.clone(),
            role: expected.role,
            pool: expected.pool.clone(),
            state: VmState::Unknown,
            instance_type: expected.instance_type.clone(),
            ..Default::default()
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == InstanceRole::Master
    }

    /// Stable ordering index parsed from `master-N`
    pub fn master_index(&self) -> Option<u32> {
        self.name.strip_prefix("master-")?.parse().ok()
    }
}

/// Observed cluster state, owned by the reconciler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Mode recorded at the first status write; guards immutability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,

    /// Master count recorded at the first status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s_server_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_token: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<Instance>,

    #[serde(default)]
    pub progress_metrics: ProgressMetrics,

    #[serde(default)]
    pub pending_operations: PendingOperations,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archived_operations: Vec<ArchivedOperation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(flatten)]
    pub spill: Spill,
}

impl ClusterStatus {
    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.name == name)
    }

    /// Masters in stable `master-0` order
    pub fn masters(&self) -> Vec<&Instance> {
        let mut masters: Vec<&Instance> =
            self.instances.iter().filter(|i| i.is_master()).collect();
        masters.sort_by_key(|i| i.master_index().unwrap_or(u32::MAX));
        masters
    }

    pub fn workers(&self) -> Vec<&Instance> {
        self.instances.iter().filter(|i| !i.is_master()).collect()
    }

    /// Record a short operator-facing explanation of the current state
    pub fn set_condition(&mut self, reason: &str, message: impl Into<String>) {
        self.reason = Some(reason.to_string());
        self.message = Some(message.into());
    }
}

/// The `config` document as stored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDoc {
    pub metadata: Metadata,
    pub spec: ClusterSpec,

    #[serde(flatten)]
    pub spill: Spill,
}

/// The `status` document as stored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusDoc {
    pub metadata: Metadata,
    pub status: ClusterStatus,

    #[serde(flatten)]
    pub spill: Spill,
}

/// A fully loaded cluster: config identity plus observed state
///
/// `Clone` is the deep-copy used for checkpoint-before-mutate: handlers work
/// on a copy and the codec persists only the status half.
#[derive(Debug, Clone, Default)]
pub struct ClusterResource {
    pub metadata: Metadata,
    pub spec: ClusterSpec,
    pub status: ClusterStatus,
}

impl ClusterResource {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// True once a deletion has been requested
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True when the spec generation has not been observed yet
    pub fn generation_pending(&self) -> bool {
        self.status.observed_generation < self.metadata.generation
    }
}
