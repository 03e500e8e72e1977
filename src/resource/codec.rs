//! Document codec and store access
//!
//! Loads `config` and `status` documents, applies derived defaults,
//! validates, and writes `status` back with conditional puts. The config
//! document is never written by this side.

use anyhow::{anyhow, Context};
use std::sync::Arc;
use thiserror::Error;

use super::types::{ClusterResource, ConfigDoc, StatusDoc};
use super::validate;
use crate::backend::{ObjectStore, StoreError, WritePrecondition};
use crate::config::{Settings, STATUS_WRITE_RETRIES};

pub fn cluster_prefix(name: &str) -> String {
    format!("clusters/{}/", name)
}

pub fn config_key(name: &str) -> String {
    format!("clusters/{}/config", name)
}

pub fn status_key(name: &str) -> String {
    format!("clusters/{}/status", name)
}

pub fn kubeconfig_key(name: &str) -> String {
    format!("clusters/{}/kubeconfig", name)
}

pub fn token_key(name: &str) -> String {
    format!("clusters/{}/k3s-server-token", name)
}

/// Codec failures, split so the handler can pick requeue behavior
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("document '{key}' is corrupted: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("status write for '{0}' kept conflicting")]
    WriteConflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A loaded resource plus the status version it was read at
#[derive(Debug, Clone)]
pub struct LoadedResource {
    pub resource: ClusterResource,
    pub status_etag: Option<String>,
    /// Set when the config violates model invariants; the resource still
    /// loads so the handler can park it in `Failed`
    pub validation_error: Option<String>,
}

/// Reads and writes cluster documents in the object store
pub struct ResourceCodec {
    store: Arc<dyn ObjectStore>,
    default_region: String,
    default_cluster_cidr: String,
    default_service_cidr: String,
}

impl ResourceCodec {
    pub fn new(store: Arc<dyn ObjectStore>, settings: &Settings) -> Self {
        Self {
            store,
            default_region: settings.region.clone(),
            default_cluster_cidr: settings.default_cluster_cidr.clone(),
            default_service_cidr: settings.default_service_cidr.clone(),
        }
    }

    /// Load both documents; `None` when no config exists
    pub async fn load(&self, name: &str) -> Result<Option<LoadedResource>, CodecError> {
        let config_key = config_key(name);
        let Some(config_obj) = self.store.get(&config_key).await? else {
            return Ok(None);
        };

        let config: ConfigDoc =
            serde_yml::from_str(&config_obj.text()).map_err(|e| CodecError::Corrupted {
                key: config_key.clone(),
                reason: e.to_string(),
            })?;

        let status_key = status_key(name);
        let (status, status_etag) = match self.store.get(&status_key).await? {
            Some(obj) => {
                let doc: StatusDoc =
                    serde_yml::from_str(&obj.text()).map_err(|e| CodecError::Corrupted {
                        key: status_key.clone(),
                        reason: e.to_string(),
                    })?;
                (doc.status, Some(obj.etag))
            }
            None => (Default::default(), None),
        };

        let mut resource = ClusterResource {
            metadata: config.metadata,
            spec: config.spec,
            status,
        };
        self.apply_defaults(&mut resource);

        let validation_error = validate::validate(&resource)
            .err()
            .map(|errors| validate::describe(&errors));

        Ok(Some(LoadedResource {
            resource,
            status_etag,
            validation_error,
        }))
    }

    /// Fill derived defaults on the in-memory copy only
    fn apply_defaults(&self, resource: &mut ClusterResource) {
        let spec = &mut resource.spec;
        if spec.provider.is_empty() {
            spec.provider = "aws".to_string();
        }
        if spec.region.is_empty() {
            spec.region = self.default_region.clone();
        }
        if spec.master_count.is_none() {
            spec.master_count = Some(spec.mode.master_count());
        }
        if spec.network.cluster_cidr.is_empty() {
            spec.network.cluster_cidr = self.default_cluster_cidr.clone();
        }
        if spec.network.service_cidr.is_empty() {
            spec.network.service_cidr = self.default_service_cidr.clone();
        }
    }

    /// Persist the status document with a conditional read-modify-write
    ///
    /// On a lost race the current version is reloaded and the write retried
    /// up to `STATUS_WRITE_RETRIES` times. The observed generation never
    /// regresses.
    pub async fn save_status(
        &self,
        resource: &ClusterResource,
        status_etag: &mut Option<String>,
    ) -> Result<(), CodecError> {
        if resource.status.observed_generation > resource.metadata.generation {
            return Err(CodecError::Invalid(format!(
                "observedGeneration {} exceeds generation {}",
                resource.status.observed_generation, resource.metadata.generation
            )));
        }

        let key = status_key(resource.name());
        let doc = StatusDoc {
            metadata: resource.metadata.clone(),
            status: resource.status.clone(),
            spill: Default::default(),
        };
        let body = serde_yml::to_string(&doc)
            .with_context(|| format!("failed to encode '{}'", key))?;

        for attempt in 1..=STATUS_WRITE_RETRIES {
            let precondition = match status_etag {
                Some(etag) => WritePrecondition::IfMatch(etag.clone()),
                None => WritePrecondition::IfAbsent,
            };
            match self.store.put(&key, body.as_bytes(), precondition).await {
                Ok(etag) => {
                    *status_etag = Some(etag);
                    return Ok(());
                }
                Err(StoreError::PreconditionFailed { .. }) => {
                    tracing::debug!(
                        key = %key,
                        attempt,
                        "status write conflicted, reloading current version"
                    );
                    match self.store.get(&key).await? {
                        Some(obj) => {
                            let stored: StatusDoc = serde_yml::from_str(&obj.text())
                                .map_err(|e| CodecError::Corrupted {
                                    key: key.clone(),
                                    reason: e.to_string(),
                                })?;
                            if stored.status.observed_generation
                                > resource.status.observed_generation
                            {
                                return Err(CodecError::Invalid(format!(
                                    "stored observedGeneration {} is ahead of ours ({})",
                                    stored.status.observed_generation,
                                    resource.status.observed_generation
                                )));
                            }
                            *status_etag = Some(obj.etag);
                        }
                        None => {
                            *status_etag = None;
                        }
                    }
                }
                Err(StoreError::Other(e)) => return Err(CodecError::Backend(e)),
            }
        }

        Err(CodecError::WriteConflict(key))
    }

    /// Remove every object under the cluster prefix; config and status last
    pub async fn delete_all(&self, name: &str) -> Result<(), CodecError> {
        let config = config_key(name);
        let status = status_key(name);

        let keys = self.store.list(&cluster_prefix(name)).await?;
        for key in keys.iter().filter(|k| **k != config && **k != status) {
            self.store
                .delete(key)
                .await
                .with_context(|| format!("failed to delete '{}'", key))?;
        }
        self.store
            .delete(&status)
            .await
            .with_context(|| format!("failed to delete '{}'", status))?;
        self.store
            .delete(&config)
            .await
            .with_context(|| format!("failed to delete '{}'", config))?;
        Ok(())
    }

    /// Write a derived object (kubeconfig, token) without preconditions
    pub async fn put_object(&self, key: &str, body: &str) -> Result<(), CodecError> {
        self.store
            .put(key, body.as_bytes(), WritePrecondition::None)
            .await
            .map_err(|e| CodecError::Backend(anyhow!(e)))?;
        Ok(())
    }

    /// Read a derived object as text
    pub async fn get_object(&self, key: &str) -> Result<Option<String>, CodecError> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|obj| obj.text().into_owned()))
    }
}
