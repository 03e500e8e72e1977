//! Delete path
//!
//! Idempotent teardown: archive outstanding operations, terminate every
//! tagged instance, then remove the object-store prefix with config and
//! status last. Partial prior deletions are tolerated; any failing step is
//! simply retried on the next trigger.

use anyhow::Result;
use chrono::Utc;

use super::{ReconcileResult, Reconciler, Session};
use crate::resource::{ClusterPhase, VmState};

pub(crate) async fn run(r: &Reconciler, session: &mut Session) -> Result<ReconcileResult> {
    let cluster = session.resource.name().to_string();
    let status = &mut session.resource.status;

    if status.phase != ClusterPhase::Deleting {
        // In-flight commands are abandoned, not awaited: their records move
        // to the archive for post-hoc inspection and their instances are
        // terminated regardless.
        let now = Utc::now();
        let archived = status.pending_operations.archive_all(now);
        if !archived.is_empty() {
            tracing::info!(
                cluster = %cluster,
                count = archived.len(),
                "archiving outstanding operations before teardown"
            );
            status.archived_operations.extend(archived);
        }
        status.phase = ClusterPhase::Deleting;
        status.set_condition("Deleting", "tearing down cluster resources");
        return Ok(ReconcileResult::after(r.timings.requeue_deleting));
    }

    // Terminate whatever still exists, both tracked and merely tagged.
    let found = r
        .backends
        .compute
        .list_by_tag(&r.settings.cluster_tag_key, &cluster)
        .await?;
    let mut remaining = false;
    for vm in &found {
        match vm.state {
            VmState::Terminated => {}
            VmState::ShuttingDown => remaining = true,
            _ => {
                tracing::info!(cluster = %cluster, id = %vm.id, "terminating instance");
                r.backends.compute.terminate(&vm.id).await?;
                remaining = true;
            }
        }
    }

    for instance in &mut session.resource.status.instances {
        if instance.state != VmState::Terminated {
            instance.state = if found.iter().any(|vm| Some(&vm.id) == instance.id.as_ref()) {
                VmState::ShuttingDown
            } else {
                VmState::Terminated
            };
        }
    }

    if remaining {
        return Ok(ReconcileResult::after(r.timings.requeue_deleting));
    }

    tracing::info!(cluster = %cluster, "compute gone, removing documents");
    self::remove_documents(r, &cluster).await?;
    Ok(ReconcileResult::done())
}

async fn remove_documents(r: &Reconciler, cluster: &str) -> Result<()> {
    r.codec.delete_all(cluster).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::resource::ClusterPhase;

    fn mark_deleted(store: &crate::backend::memory::MemoryObjectStore, name: &str) {
        store.seed(
            &format!("clusters/{}/config", name),
            &format!(
                "metadata:\n  name: {}\n  generation: 2\n  deletionTimestamp: 2026-08-01T00:00:00Z\nspec:\n  instanceType: t3.medium\n  mode: dev\n",
                name
            ),
        );
    }

    #[tokio::test]
    async fn test_delete_terminates_and_removes_documents() {
        let h = harness();
        seed_config(&h.store, "demo", "dev");
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        assert_eq!(h.compute.launch_count(), 1);

        mark_deleted(&h.store, "demo");

        // Enter Deleting, then tear down, then observe empty compute.
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        assert_eq!(phase_of(&h.reconciler, "demo").await, ClusterPhase::Deleting);
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        let result = h.reconciler.reconcile_cluster("demo").await.unwrap();

        assert!(!result.requeue);
        assert!(h
            .store
            .keys()
            .iter()
            .all(|k| !k.starts_with("clusters/demo/")));
        assert!(h
            .compute
            .states()
            .iter()
            .all(|(_, s)| *s == crate::resource::VmState::Terminated));
    }

    #[tokio::test]
    async fn test_delete_archives_pending_operations() {
        let h = harness();
        seed_config(&h.store, "demo", "dev");
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        // Installing: readiness command fired and left pending
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();

        mark_deleted(&h.store, "demo");
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();

        let loaded = h.reconciler.codec.load("demo").await.unwrap().unwrap();
        let status = &loaded.resource.status;
        assert_eq!(status.phase, ClusterPhase::Deleting);
        assert!(status.pending_operations.is_empty());
        assert!(!status.archived_operations.is_empty());
    }

    #[tokio::test]
    async fn test_delete_tolerates_already_gone_resources() {
        let h = harness();
        seed_config(&h.store, "demo", "dev");
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();

        // Someone already terminated the VM out of band
        for id in h.compute.instance_ids() {
            h.compute.set_state(&id, crate::resource::VmState::Terminated);
        }

        mark_deleted(&h.store, "demo");
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        let result = h.reconciler.reconcile_cluster("demo").await.unwrap();

        assert!(!result.requeue);
        assert!(h
            .store
            .keys()
            .iter()
            .all(|k| !k.starts_with("clusters/demo/")));
    }
}
