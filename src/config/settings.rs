//! Process-wide settings
//!
//! Every invocation builds a fresh `Settings` from the environment at handler
//! start. Nothing here is cached across invocations: the bucket, region and
//! queue wiring belong to the deployment, not to the process.

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Settings resolved from the environment at handler start
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bucket holding all cluster documents and lock records
    pub bucket: String,

    /// AWS region the controller operates in
    pub region: String,

    /// Queue URL for delayed requeue messages (empty disables scheduling)
    pub requeue_queue_url: String,

    /// Tag key marking instances as owned by a cluster
    pub cluster_tag_key: String,

    /// Tag key carrying the instance role (master / worker)
    pub role_tag_key: String,

    /// AMI used for every launched instance (provisioned by bootstrap)
    pub ami_id: String,

    /// Subnet for launched instances; empty uses the account default
    pub subnet_id: String,

    /// Security group for launched instances; empty uses the default group
    pub security_group_id: String,

    /// Default pod network CIDR when the spec leaves it empty
    pub default_cluster_cidr: String,

    /// Default service network CIDR when the spec leaves it empty
    pub default_service_cidr: String,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Enable file logging in addition to stdout
    #[serde(default)]
    pub file_enabled: bool,

    /// Log file path (used only when `file_enabled`)
    #[serde(default = "default_log_file")]
    pub file: String,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file_enabled: false,
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

fn default_log_file() -> String {
    "/tmp/k3man.log".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cluster_tag_key() -> String {
    "k3man:cluster".to_string()
}

fn default_role_tag_key() -> String {
    "k3man:role".to_string()
}

fn default_cluster_cidr() -> String {
    "10.42.0.0/16".to_string()
}

fn default_service_cidr() -> String {
    "10.43.0.0/16".to_string()
}

impl Settings {
    /// Build settings from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    ///
    /// # Arguments
    /// * `lookup` - Returns the value for an environment key, if set
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bucket = lookup("K3MAN_BUCKET")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("K3MAN_BUCKET is not set"))?;

        let region = lookup("K3MAN_REGION")
            .or_else(|| lookup("AWS_REGION"))
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("neither K3MAN_REGION nor AWS_REGION is set"))?;

        let logging = LoggingSettings {
            file_enabled: lookup("K3MAN_LOG_FILE").is_some(),
            file: lookup("K3MAN_LOG_FILE").unwrap_or_else(default_log_file),
            level: lookup("K3MAN_LOG_LEVEL").unwrap_or_else(default_log_level),
        };

        Ok(Self {
            bucket,
            region,
            requeue_queue_url: lookup("K3MAN_REQUEUE_QUEUE_URL").unwrap_or_default(),
            cluster_tag_key: lookup("K3MAN_CLUSTER_TAG_KEY")
                .unwrap_or_else(default_cluster_tag_key),
            role_tag_key: lookup("K3MAN_ROLE_TAG_KEY").unwrap_or_else(default_role_tag_key),
            ami_id: lookup("K3MAN_AMI_ID").unwrap_or_default(),
            subnet_id: lookup("K3MAN_SUBNET_ID").unwrap_or_default(),
            security_group_id: lookup("K3MAN_SECURITY_GROUP_ID").unwrap_or_default(),
            default_cluster_cidr: lookup("K3MAN_CLUSTER_CIDR")
                .unwrap_or_else(default_cluster_cidr),
            default_service_cidr: lookup("K3MAN_SERVICE_CIDR")
                .unwrap_or_else(default_service_cidr),
            logging,
        })
    }
}
