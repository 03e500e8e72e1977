//! The reconciliation engine
//!
//! One invocation handles one trigger: resolve the cluster, take its lock,
//! load the documents, run the phase handler, persist status, release the
//! lock, schedule the next trigger. Everything resumable lives in the
//! status document; nothing survives in process memory.

mod configure;
mod delete;
mod error;
mod health;
mod install;
mod pendingops;
mod phases;
mod provision;

#[cfg(test)]
mod scenarios;

pub use error::ReconcileError;

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{Compute, LockService, ObjectStore, RemoteExec, RequeueQueue};
use crate::config::{Settings, Timings};
use crate::events::{cluster_name_from_key, TriggerEvent};
use crate::resource::{
    status_key, ClusterPhase, ClusterResource, CodecError, ResourceCodec, StatusDoc,
};

/// The backends one reconciler invocation talks to
pub struct Backends {
    pub store: Arc<dyn ObjectStore>,
    pub lock: Arc<dyn LockService>,
    pub compute: Arc<dyn Compute>,
    pub exec: Arc<dyn RemoteExec>,
    /// Absent in direct CLI runs; requeues are then reported, not scheduled
    pub queue: Option<Arc<dyn RequeueQueue>>,
}

/// What the entry point should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Duration,
}

impl ReconcileResult {
    pub fn after(duration: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: duration,
        }
    }

    pub fn done() -> Self {
        Self {
            requeue: false,
            requeue_after: Duration::ZERO,
        }
    }
}

/// A loaded resource being mutated under the lock
pub(crate) struct Session {
    pub resource: ClusterResource,
    pub status_etag: Option<String>,
}

impl Session {
    pub(crate) async fn save(&mut self, codec: &ResourceCodec) -> Result<(), CodecError> {
        codec.save_status(&self.resource, &mut self.status_etag).await
    }
}

/// Drives one cluster one step per trigger
pub struct Reconciler {
    pub(crate) backends: Backends,
    pub(crate) settings: Settings,
    pub(crate) timings: Timings,
    pub(crate) codec: ResourceCodec,
}

impl Reconciler {
    pub fn new(backends: Backends, settings: Settings, timings: Timings) -> Self {
        let codec = ResourceCodec::new(backends.store.clone(), &settings);
        Self {
            backends,
            settings,
            timings,
            codec,
        }
    }

    /// Entry point: decode the trigger into a cluster and reconcile it
    ///
    /// Errors are folded into the result per the taxonomy; only triggers
    /// that name no cluster resolve to `done`.
    pub async fn handle(&self, trigger: &TriggerEvent) -> ReconcileResult {
        let Some(name) = self.resolve_cluster(trigger).await else {
            return ReconcileResult::done();
        };

        match self.reconcile_cluster(&name).await {
            Ok(result) => result,
            Err(ReconcileError::LockUnavailable(_)) => {
                tracing::info!(cluster = %name, "lock busy, requeueing");
                self.schedule(&name, self.timings.requeue_lock_busy).await;
                ReconcileResult::after(self.timings.requeue_lock_busy)
            }
            Err(ReconcileError::LoadCorrupted(reason)) => {
                tracing::error!(cluster = %name, %reason, "document corrupted");
                self.schedule(&name, self.timings.requeue_corrupted).await;
                ReconcileResult::after(self.timings.requeue_corrupted)
            }
            Err(ReconcileError::BackendTransient(e)) => {
                tracing::warn!(cluster = %name, error = %format!("{:#}", e), "transient backend failure");
                self.schedule(&name, self.timings.requeue_transition).await;
                ReconcileResult::after(self.timings.requeue_transition)
            }
        }
    }

    /// Map a trigger to the cluster it concerns
    async fn resolve_cluster(&self, trigger: &TriggerEvent) -> Option<String> {
        match trigger {
            TriggerEvent::ObjectStoreChange { bucket, key } => {
                if !self.settings.bucket.is_empty() && bucket != &self.settings.bucket {
                    tracing::debug!(%bucket, "change event for foreign bucket, ignoring");
                    return None;
                }
                // Only user-authored config writes trigger reconciliation;
                // status/kubeconfig/token writes are our own.
                if !key.ends_with("/config") {
                    return None;
                }
                cluster_name_from_key(key).map(str::to_string)
            }
            TriggerEvent::ComputeStateChange { instance_id, .. } => {
                let vm = match self.backends.compute.describe(instance_id).await {
                    Ok(vm) => vm,
                    Err(e) => {
                        tracing::warn!(%instance_id, error = %e, "instance lookup failed");
                        return None;
                    }
                };
                vm.and_then(|vm| vm.tags.get(&self.settings.cluster_tag_key).cloned())
            }
            TriggerEvent::Requeue { cluster_name, .. }
            | TriggerEvent::Direct { cluster_name } => Some(cluster_name.clone()),
        }
    }

    /// Reconcile one cluster: lock, load, dispatch, persist, unlock
    pub async fn reconcile_cluster(&self, name: &str) -> Result<ReconcileResult, ReconcileError> {
        let owner = format!("k3man-{}", Uuid::new_v4());
        let ttl = self.lock_ttl_for(name).await;

        let acquired = self
            .backends
            .lock
            .acquire(name, &owner, ttl, self.timings.lock_wait)
            .await
            .map_err(ReconcileError::BackendTransient)?;
        if acquired.is_none() {
            return Err(ReconcileError::LockUnavailable(name.to_string()));
        }

        let cancel = CancellationToken::new();
        let budget_guard = cancel.clone();
        let budget = self.timings.invocation_budget;
        let budget_task = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            budget_guard.cancel();
        });

        let result = self.locked_reconcile(name, &cancel).await;

        budget_task.abort();
        if let Err(e) = self.backends.lock.release(name, &owner).await {
            tracing::warn!(cluster = %name, error = %e, "lock release failed");
        }

        if let Ok(outcome) = &result {
            if outcome.requeue {
                self.schedule(name, outcome.requeue_after).await;
            }
        }
        result
    }

    /// The critical section: everything between acquire and release
    async fn locked_reconcile(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileResult, ReconcileError> {
        let loaded = match self.codec.load(name).await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                // Config gone: clear any orphaned derived objects and stop.
                tracing::info!(cluster = %name, "no config document, clearing orphans");
                self.codec
                    .delete_all(name)
                    .await
                    .map_err(|e| ReconcileError::BackendTransient(e.into()))?;
                return Ok(ReconcileResult::done());
            }
            Err(CodecError::Corrupted { key, reason }) => {
                return Err(ReconcileError::LoadCorrupted(format!("{}: {}", key, reason)));
            }
            Err(e) => return Err(ReconcileError::BackendTransient(e.into())),
        };

        let mut session = Session {
            resource: loaded.resource,
            status_etag: loaded.status_etag,
        };
        let phase_before = session.resource.status.phase;

        // Deletion precedes everything, including config validity.
        let outcome = if session.resource.deletion_requested() {
            delete::run(self, &mut session).await
        } else if let Some(message) = loaded.validation_error {
            // Config-invalid: park in Failed until the config changes again.
            tracing::warn!(cluster = %name, %message, "config rejected");
            let status = &mut session.resource.status;
            status.phase = ClusterPhase::Failed;
            status.set_condition("Invalid", message);
            Ok(ReconcileResult::done())
        } else {
            phases::dispatch(self, &mut session, cancel).await
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                // Handler errors still persist whatever progress was made.
                let message = format!("{:#}", e);
                tracing::error!(cluster = %name, error = %message, "phase handler failed");
                session
                    .resource
                    .status
                    .set_condition("Error", message);
                ReconcileResult::after(self.timings.requeue_transition)
            }
        };

        let status = &mut session.resource.status;
        status.last_reconcile_time = Some(Utc::now());
        status.observed_generation = status
            .observed_generation
            .max(session.resource.metadata.generation);
        // Record the applied topology once, from the first valid status.
        if status.mode.is_none() && status.phase != ClusterPhase::Failed {
            status.mode = Some(session.resource.spec.mode);
            status.master_count = Some(session.resource.spec.expected_masters());
        }

        if phase_before != session.resource.status.phase {
            tracing::info!(
                cluster = %name,
                from = phase_before.as_str(),
                to = session.resource.status.phase.as_str(),
                "phase transition"
            );
        }

        // A finished delete removed the documents; writing status back would
        // resurrect them.
        let torn_down = session.resource.status.phase == ClusterPhase::Deleting && !result.requeue;
        if !torn_down {
            match session.save(&self.codec).await {
                Ok(()) => {}
                Err(CodecError::Corrupted { key, reason }) => {
                    return Err(ReconcileError::LoadCorrupted(format!("{}: {}", key, reason)));
                }
                Err(e) => return Err(ReconcileError::BackendTransient(e.into())),
            }
        }

        Ok(result)
    }

    /// Choose the lock TTL from the phase the cluster is believed to be in
    async fn lock_ttl_for(&self, name: &str) -> Duration {
        let deletion_pending = match self
            .backends
            .store
            .get(&crate::resource::config_key(name))
            .await
        {
            Ok(Some(obj)) => serde_yml::from_str::<crate::resource::ConfigDoc>(&obj.text())
                .map(|doc| doc.metadata.deletion_timestamp.is_some())
                .unwrap_or(false),
            _ => false,
        };
        if deletion_pending {
            return self.timings.lock_ttl_destroy;
        }

        let phase = match self.backends.store.get(&status_key(name)).await {
            Ok(Some(obj)) => serde_yml::from_str::<StatusDoc>(&obj.text())
                .map(|doc| doc.status.phase)
                .unwrap_or_default(),
            _ => ClusterPhase::Pending,
        };
        match phase {
            ClusterPhase::Running | ClusterPhase::Stopped | ClusterPhase::Failed => {
                self.timings.lock_ttl_health
            }
            ClusterPhase::Installing | ClusterPhase::Configuring => self.timings.lock_ttl_install,
            ClusterPhase::Deleting => self.timings.lock_ttl_destroy,
            _ => self.timings.lock_ttl_provision,
        }
    }

    async fn schedule(&self, name: &str, delay: Duration) {
        if let Some(queue) = &self.backends.queue {
            if let Err(e) = queue.schedule(name, delay).await {
                tracing::warn!(cluster = %name, error = %e, "requeue scheduling failed");
            }
        }
    }

    /// Render the progress view for one cluster (read-only)
    pub async fn progress_view(&self, name: &str) -> Result<Option<String>> {
        match self.codec.load(name).await {
            Ok(Some(loaded)) => {
                let status = &loaded.resource.status;
                let mut view = format!(
                    "cluster: {}\nphase: {}\n",
                    name,
                    status.phase.as_str()
                );
                if let Some(message) = &status.message {
                    view.push_str(&format!("message: {}\n", message));
                }
                view.push_str(&status.progress_metrics.render(Utc::now()));
                Ok(Some(view))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
