//! K3s installer
//!
//! Per instance, three sequential fire-and-forget checks: a readiness probe
//! to prove the exec channel works, a version probe to decide whether an
//! install is needed, and the pinned install itself. The phase advances
//! once every master reports the binary present; workers follow the same
//! ladder but never gate.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::pendingops::{
    self, check_done, check_eligible, fire_command, PURPOSE_INSTALL, PURPOSE_READINESS,
    PURPOSE_VERSION,
};
use super::{phases, ReconcileResult, Reconciler, Session};
use crate::resource::{ClusterPhase, InstanceRole, StepStatus, STEP_INSTALLING};

fn readiness_check(name: &str) -> String {
    format!("readiness/{}", name)
}

fn version_check(name: &str) -> String {
    format!("version/{}", name)
}

fn install_check(name: &str) -> String {
    format!("install/{}", name)
}

/// The pinned install command for one instance
fn install_script(version: &str, role: InstanceRole, instance: &str) -> String {
    let exec = match role {
        InstanceRole::Master => "server",
        InstanceRole::Worker => "agent",
    };
    format!(
        "# k3man install-k3s for {instance}\n\
         curl -sfL https://get.k3s.io -o /tmp/k3s-install.sh && \
         INSTALL_K3S_VERSION='{version}' INSTALL_K3S_EXEC='{exec}' \
         INSTALL_K3S_SKIP_START=true INSTALL_K3S_SKIP_ENABLE=true \
         sh /tmp/k3s-install.sh"
    )
}

/// One instance to advance through the ladder
pub(crate) struct LadderTarget {
    pub name: String,
    pub id: String,
    pub role: InstanceRole,
    pub installed: bool,
}

/// Masters in stable order, then workers
pub(crate) fn all_targets(session: &Session) -> Vec<LadderTarget> {
    let mut targets = master_targets(session);
    targets.extend(worker_targets(session));
    targets
}

pub(crate) fn master_targets(session: &Session) -> Vec<LadderTarget> {
    session
        .resource
        .status
        .masters()
        .iter()
        .filter_map(|m| {
            Some(LadderTarget {
                name: m.name.clone(),
                id: m.id.clone()?,
                role: InstanceRole::Master,
                installed: m.k3s_installed,
            })
        })
        .collect()
}

pub(crate) fn worker_targets(session: &Session) -> Vec<LadderTarget> {
    session
        .resource
        .status
        .workers()
        .iter()
        .filter_map(|w| {
            Some(LadderTarget {
                name: w.name.clone(),
                id: w.id.clone()?,
                role: InstanceRole::Worker,
                installed: w.k3s_installed,
            })
        })
        .collect()
}

pub(crate) async fn run(
    r: &Reconciler,
    session: &mut Session,
    cancel: &CancellationToken,
) -> Result<ReconcileResult> {
    pendingops::poll(r, session, &[STEP_INSTALLING]).await?;

    let targets = all_targets(session);
    advance_ladder(r, session, targets, cancel).await?;

    let masters_installed = {
        let masters = session.resource.status.masters();
        !masters.is_empty() && masters.iter().all(|m| m.k3s_installed)
    };
    if masters_installed {
        phases::transition(
            session,
            ClusterPhase::Configuring,
            "Installed",
            "k3s binary present on all masters, forming control plane",
        );
        return Ok(ReconcileResult::after(r.timings.requeue_transition));
    }

    Ok(ReconcileResult::after(r.timings.requeue_installing))
}

/// Advance every target one check along the readiness/version/install ladder
pub(crate) async fn advance_ladder(
    r: &Reconciler,
    session: &mut Session,
    targets: Vec<LadderTarget>,
    cancel: &CancellationToken,
) -> Result<()> {
    let version = session.resource.spec.k3s_version.clone();
    for LadderTarget {
        name,
        id,
        role,
        installed,
    } in targets
    {
        if cancel.is_cancelled() {
            break;
        }
        if installed {
            continue;
        }

        let readiness = readiness_check(&name);
        if !check_done(session, STEP_INSTALLING, &readiness) {
            if check_eligible(session, STEP_INSTALLING, &readiness, r.timings.cmd_readiness) {
                let script = format!("# k3man readiness-probe for {}\necho Ready", name);
                fire_command(
                    r,
                    session,
                    &name,
                    &id,
                    &script,
                    PURPOSE_READINESS,
                    r.timings.cmd_readiness,
                    STEP_INSTALLING,
                    &readiness,
                )
                .await?;
            }
            continue;
        }

        let version_probe = version_check(&name);
        if !check_done(session, STEP_INSTALLING, &version_probe) {
            if check_eligible(session, STEP_INSTALLING, &version_probe, r.timings.cmd_version) {
                let script = format!(
                    "# k3man version-probe for {}\nk3s --version 2>/dev/null || echo NOT_INSTALLED",
                    name
                );
                fire_command(
                    r,
                    session,
                    &name,
                    &id,
                    &script,
                    PURPOSE_VERSION,
                    r.timings.cmd_version,
                    STEP_INSTALLING,
                    &version_probe,
                )
                .await?;
            }
            continue;
        }

        let install = install_check(&name);
        let skipped = session
            .resource
            .status
            .progress_metrics
            .step(STEP_INSTALLING)
            .and_then(|s| s.check(&install))
            .is_some_and(|c| c.status == StepStatus::Skipped);
        if !skipped
            && !check_done(session, STEP_INSTALLING, &install)
            && check_eligible(session, STEP_INSTALLING, &install, r.timings.cmd_install)
        {
            fire_command(
                r,
                session,
                &name,
                &id,
                &install_script(&version, role, &name),
                PURPOSE_INSTALL,
                r.timings.cmd_install,
                STEP_INSTALLING,
                &install,
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::backend::memory::success;
    use crate::resource::ClusterPhase;

    async fn provisioned(h: &Harness, mode: &str) {
        seed_config(&h.store, "demo", mode);
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        assert_eq!(phase_of(&h.reconciler, "demo").await, ClusterPhase::Installing);
    }

    #[tokio::test]
    async fn test_three_check_ladder_installs_k3s() {
        let h = harness();
        h.exec.respond("version-probe", success("NOT_INSTALLED"));
        provisioned(&h, "dev").await;

        // readiness fired
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        // readiness collected, version fired
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        // version collected, install fired
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        // install collected; masters installed -> Configuring
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();

        assert_eq!(phase_of(&h.reconciler, "demo").await, ClusterPhase::Configuring);

        let scripts: Vec<String> = h.exec.sent().iter().map(|c| c.script.clone()).collect();
        assert!(scripts.iter().any(|s| s.contains("echo Ready")));
        assert!(scripts.iter().any(|s| s.contains("NOT_INSTALLED")));
        assert!(scripts
            .iter()
            .any(|s| s.contains("INSTALL_K3S_VERSION='v1.33.4+k3s1'")));

        let loaded = h.reconciler.codec.load("demo").await.unwrap().unwrap();
        let instance = &loaded.resource.status.instances[0];
        assert!(instance.k3s_installed);
        assert!(instance.k3s_install_time.is_some());
    }

    #[tokio::test]
    async fn test_existing_install_skips_the_installer() {
        let h = harness();
        h.exec
            .respond("version-probe", success("k3s version v1.33.4+k3s1 (abc)"));
        provisioned(&h, "dev").await;

        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();

        assert_eq!(phase_of(&h.reconciler, "demo").await, ClusterPhase::Configuring);
        assert!(!h
            .exec
            .sent()
            .iter()
            .any(|c| c.script.contains("get.k3s.io")));
    }

    #[tokio::test]
    async fn test_ha_requires_every_master_installed() {
        let h = harness();
        h.exec.respond("version-probe", success("NOT_INSTALLED"));
        // master-2's install never succeeds in this test
        h.exec.respond(
            "install-k3s for master-2",
            crate::backend::memory::failure("no network"),
        );
        provisioned(&h, "ha").await;

        for _ in 0..6 {
            let _ = h.reconciler.reconcile_cluster("demo").await.unwrap();
        }

        assert_eq!(phase_of(&h.reconciler, "demo").await, ClusterPhase::Installing);
        let loaded = h.reconciler.codec.load("demo").await.unwrap().unwrap();
        let installed: Vec<bool> = loaded
            .resource
            .status
            .masters()
            .iter()
            .map(|m| m.k3s_installed)
            .collect();
        assert_eq!(installed, vec![true, true, false]);
    }
}
