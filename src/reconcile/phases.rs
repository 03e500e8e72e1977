//! Phase state machine
//!
//! Routes a loaded resource to its phase handler. Deletion short-circuits
//! everything and is handled before dispatch; within a phase, masters are
//! always processed in stable `master-0` order.

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{configure, health, install, provision, ReconcileResult, Reconciler, Session};
use crate::resource::{ClusterPhase, DesiredState};

pub(crate) async fn dispatch(
    r: &Reconciler,
    session: &mut Session,
    cancel: &CancellationToken,
) -> Result<ReconcileResult> {
    match session.resource.status.phase {
        ClusterPhase::Pending => run_pending(r, session),
        ClusterPhase::Provisioning => provision::run(r, session, cancel).await,
        ClusterPhase::Installing => install::run(r, session, cancel).await,
        ClusterPhase::Configuring => configure::run(r, session, cancel).await,
        ClusterPhase::Running => health::run_running(r, session, cancel).await,
        ClusterPhase::Updating => provision::run_updating(r, session, cancel).await,
        ClusterPhase::Stopping => provision::run_stopping(r, session).await,
        ClusterPhase::Stopped => health::run_stopped(r, session).await,
        ClusterPhase::Starting => provision::run_starting(r, session).await,
        // Deletion is routed before dispatch; reaching here means the
        // deletion timestamp was cleared, which we treat as a fresh admit.
        ClusterPhase::Deleting => run_pending(r, session),
        ClusterPhase::Failed => run_failed(r, session),
    }
}

/// Admission: initialize progress and move into Provisioning
fn run_pending(r: &Reconciler, session: &mut Session) -> Result<ReconcileResult> {
    let resource = &mut session.resource;
    let status = &mut resource.status;

    status.progress_metrics.ensure_creation_steps();

    if resource.spec.desired_state == DesiredState::Stopped {
        // Nothing to run yet; wait for the desired state to flip.
        status.set_condition("DesiredStopped", "cluster is configured to stay stopped");
        return Ok(ReconcileResult::after(r.timings.requeue_running));
    }

    status.phase = ClusterPhase::Provisioning;
    status.set_condition("Admitted", "provisioning instances");
    Ok(ReconcileResult::after(r.timings.requeue_pending))
}

/// Failed is sticky until the user edits the config
fn run_failed(r: &Reconciler, session: &mut Session) -> Result<ReconcileResult> {
    let resource = &mut session.resource;
    if resource.generation_pending() {
        tracing::info!(cluster = %resource.metadata.name, "config changed, re-admitting failed cluster");
        let status = &mut resource.status;
        status.phase = ClusterPhase::Pending;
        status.set_condition("Readmitted", "configuration changed after failure");
        // Clear permanent failures so checks may run again.
        for step in &mut status.progress_metrics.steps {
            for check in &mut step.checks {
                if check.permanently_failed() {
                    check.status = crate::resource::StepStatus::Pending;
                    check.failure_count = 0;
                    check.retry_after = None;
                    check.error_message = None;
                }
            }
            step.status = match step.status {
                crate::resource::StepStatus::Failed => crate::resource::StepStatus::Pending,
                other => other,
            };
            step.end_time = None;
        }
        return Ok(ReconcileResult::after(r.timings.requeue_pending));
    }
    Ok(ReconcileResult::done())
}

/// Mark the moment a cluster leaves one phase for another
pub(crate) fn transition(
    session: &mut Session,
    to: ClusterPhase,
    reason: &str,
    message: impl Into<String>,
) {
    let status = &mut session.resource.status;
    status.phase = to;
    status.set_condition(reason, message);
    let now = Utc::now();
    match to {
        ClusterPhase::Installing => {
            status.progress_metrics.mark_done_before(crate::resource::STEP_INSTALLING, now);
        }
        ClusterPhase::Configuring => {
            status.progress_metrics.mark_done_before(crate::resource::STEP_CONFIGURING, now);
        }
        _ => {}
    }
}
