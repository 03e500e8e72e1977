//! Cloud backend seams
//!
//! Every network dependency of the reconciler sits behind one of these
//! traits: durable object storage, the per-cluster lock lease, compute,
//! remote command execution and delayed requeue messages. Production
//! implementations wrap the AWS SDK; tests use the in-memory fakes.

mod ec2;
mod lock;
mod s3;
mod sqs;
mod ssm;

#[cfg(test)]
pub mod memory;

pub use ec2::Ec2Compute;
pub use lock::S3LockService;
pub use s3::S3ObjectStore;
pub use sqs::SqsRequeueQueue;
pub use ssm::SsmExec;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::resource::VmState;

/// Object store write failures that carry meaning beyond "try later"
#[derive(Debug, Error)]
pub enum StoreError {
    /// The conditional write lost a race; reload and retry
    #[error("precondition failed for '{key}'")]
    PreconditionFailed { key: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A fetched object together with its version tag
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub etag: String,
}

impl StoredObject {
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Precondition for a conditional put
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    None,
    /// Create only; fail if the key exists
    IfAbsent,
    /// Replace only the observed version
    IfMatch(String),
}

/// Durable key/value blob store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>>;

    /// Write an object, honoring the precondition; returns the new version tag
    async fn put(
        &self,
        key: &str,
        body: &[u8],
        precondition: WritePrecondition,
    ) -> Result<String, StoreError>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Successful lock acquisition
#[derive(Debug, Clone)]
pub struct LockAcquisition {
    /// Monotonic per-resource token; stale holders carry older values
    pub fencing_token: u64,
}

/// Observed lock state
#[derive(Debug, Clone, Default)]
pub struct LockState {
    pub locked: bool,
    pub owner: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Per-resource exclusive lease with TTL and fencing
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lease, waiting up to `wait`; `None` means unavailable
    async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockAcquisition>>;

    /// Release the lease; a non-owner release is a no-op
    async fn release(&self, resource: &str, owner: &str) -> Result<()>;

    async fn is_locked(&self, resource: &str) -> Result<LockState>;
}

/// VM description as reported by the compute backend
#[derive(Debug, Clone)]
pub struct VmDescription {
    pub id: String,
    pub name: String,
    pub state: VmState,
    pub instance_type: String,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub vpc_id: Option<String>,
    pub subnet_id: Option<String>,
    pub security_groups: Vec<String>,
    pub launch_time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

/// Parameters for a VM launch
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub name: String,
    pub instance_type: String,
    pub image_id: String,
    /// Empty uses the account default subnet
    pub subnet_id: String,
    pub security_groups: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

/// Load the shared AWS SDK configuration for the given region
pub async fn load_aws_config(region: &str) -> aws_config::SdkConfig {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_sdk_s3::config::Region::new(region.to_string()))
        .load()
        .await
}

/// Launch / query / power-manage virtual machines
#[async_trait]
pub trait Compute: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<VmDescription>;

    async fn describe(&self, id: &str) -> Result<Option<VmDescription>>;

    async fn list_by_tag(&self, key: &str, value: &str) -> Result<Vec<VmDescription>>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn terminate(&self, id: &str) -> Result<()>;
}

/// Result of a remote command, polled by id
#[derive(Debug, Clone)]
pub enum ExecStatus {
    InProgress,
    Success {
        stdout: String,
    },
    Failed {
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    },
}

/// Start shell commands on a VM and poll their results later
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Fire a command; the returned id is polled on later invocations
    async fn send_command(
        &self,
        instance_id: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<String>;

    async fn get_result(&self, command_id: &str) -> Result<ExecStatus>;
}

/// Schedule a delayed reconcile trigger
#[async_trait]
pub trait RequeueQueue: Send + Sync {
    async fn schedule(&self, cluster: &str, delay: Duration) -> Result<()>;
}
