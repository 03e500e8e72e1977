//! Provisioner: drives the VM set toward the spec
//!
//! Owns the Provisioning phase plus the power transitions (Stopping,
//! Starting) and the rolling instance-type update. Placeholders are always
//! persisted before the create call so a crashed invocation never
//! duplicates instances.

use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use super::{phases, ReconcileResult, Reconciler, Session};
use crate::backend::{LaunchRequest, VmDescription};
use crate::resource::{
    ClusterPhase, ExpectedInstance, Instance, InstanceRole, StepStatus, VmState,
    STEP_PROVISIONING,
};

/// The Name tag carried by every VM of a cluster
fn vm_name(cluster: &str, instance: &str) -> String {
    format!("{}-{}", cluster, instance)
}

fn launch_request(r: &Reconciler, session: &Session, expected: &ExpectedInstance) -> LaunchRequest {
    let cluster = session.resource.name();
    let mut tags: BTreeMap<String, String> = session.resource.spec.tags.clone();
    tags.insert(r.settings.cluster_tag_key.clone(), cluster.to_string());
    tags.insert(
        r.settings.role_tag_key.clone(),
        match expected.role {
            InstanceRole::Master => "master".to_string(),
            InstanceRole::Worker => "worker".to_string(),
        },
    );

    LaunchRequest {
        name: vm_name(cluster, &expected.name),
        instance_type: expected.instance_type.clone(),
        image_id: r.settings.ami_id.clone(),
        subnet_id: r.settings.subnet_id.clone(),
        security_groups: if r.settings.security_group_id.is_empty() {
            Vec::new()
        } else {
            vec![r.settings.security_group_id.clone()]
        },
        tags,
    }
}

/// Record the network the cluster landed in, from any described VM
fn capture_network(session: &mut Session, vm: &VmDescription) {
    let status = &mut session.resource.status;
    if status.vpc_id.is_none() {
        status.vpc_id = vm.vpc_id.clone();
    }
    if let Some(subnet) = &vm.subnet_id {
        if !status.subnet_ids.contains(subnet) {
            status.subnet_ids.push(subnet.clone());
        }
    }
    for group in &vm.security_groups {
        if !status.security_groups.contains(group) {
            status.security_groups.push(group.clone());
        }
    }
}

fn apply_description(instance: &mut Instance, vm: &VmDescription) {
    instance.id = Some(vm.id.clone());
    instance.state = vm.state;
    instance.instance_type = vm.instance_type.clone();
    if vm.private_ip.is_some() {
        instance.private_ip = vm.private_ip.clone();
    }
    if vm.public_ip.is_some() {
        instance.public_ip = vm.public_ip.clone();
    }
    if vm.launch_time.is_some() {
        instance.launch_time = vm.launch_time;
    }
}

/// Reconcile the tracked instance list against the spec and the cloud
///
/// Adopts tagged VMs that are not tracked, re-creates placeholders for
/// tracked VMs that vanished, and drops tracked instances the spec no
/// longer wants. Returns whether any new placeholder appeared.
async fn observe_instances(r: &Reconciler, session: &mut Session) -> Result<bool> {
    let cluster = session.resource.name().to_string();
    let found = r
        .backends
        .compute
        .list_by_tag(&r.settings.cluster_tag_key, &cluster)
        .await?;
    if let Some(vm) = found.first() {
        capture_network(session, vm);
    }
    let by_tag_name: BTreeMap<String, &VmDescription> =
        found.iter().map(|vm| (vm.name.clone(), vm)).collect();
    let by_id: BTreeMap<&str, &VmDescription> =
        found.iter().map(|vm| (vm.id.as_str(), vm)).collect();

    let expected = session.resource.spec.expected_instances();
    let mut placeholders_added = false;
    let mut replaced: Vec<String> = Vec::new();

    for exp in &expected {
        match session.resource.status.instance_mut(&exp.name) {
            Some(entry) => match &entry.id {
                Some(id) => {
                    if let Some(vm) = by_id.get(id.as_str()) {
                        apply_description(entry, vm);
                    } else {
                        // Tracked VM is gone; start over with a placeholder.
                        tracing::warn!(
                            cluster = %cluster,
                            instance = %exp.name,
                            vanished = %id,
                            "tracked instance no longer exists"
                        );
                        *entry = Instance::placeholder(exp);
                        placeholders_added = true;
                        replaced.push(exp.name.clone());
                    }
                }
                None => {
                    if let Some(vm) = by_tag_name.get(&vm_name(&cluster, &exp.name)) {
                        // A previous invocation created it but crashed
                        // before recording the id.
                        tracing::info!(
                            cluster = %cluster,
                            instance = %exp.name,
                            id = %vm.id,
                            "adopting existing instance"
                        );
                        apply_description(entry, vm);
                    }
                }
            },
            None => {
                let mut instance = Instance::placeholder(exp);
                if let Some(vm) = by_tag_name.get(&vm_name(&cluster, &exp.name)) {
                    apply_description(&mut instance, vm);
                } else {
                    placeholders_added = true;
                }
                session.resource.status.instances.push(instance);
            }
        }
    }

    // Anything tracked that the spec no longer expects is torn down.
    let expected_names: Vec<&str> = expected.iter().map(|e| e.name.as_str()).collect();
    let mut removed = Vec::new();
    session.resource.status.instances.retain(|i| {
        if expected_names.contains(&i.name.as_str()) {
            true
        } else {
            removed.push(i.clone());
            false
        }
    });
    for instance in removed {
        if let Some(id) = &instance.id {
            tracing::info!(cluster = %cluster, instance = %instance.name, "terminating unwanted instance");
            r.backends.compute.terminate(id).await?;
        }
    }

    for name in replaced {
        super::configure::reset_for_replacement(session, &name);
    }

    Ok(placeholders_added)
}

/// Create every placeholder, persisting ids as they appear
async fn create_placeholders(
    r: &Reconciler,
    session: &mut Session,
    cancel: &CancellationToken,
) -> Result<()> {
    let expected = session.resource.spec.expected_instances();
    let now = Utc::now();

    for exp in &expected {
        if cancel.is_cancelled() {
            tracing::warn!("invocation budget reached during provisioning");
            break;
        }
        let needs_create = session
            .resource
            .status
            .instance(&exp.name)
            .is_some_and(|i| i.id.is_none());
        if !needs_create {
            continue;
        }

        let request = launch_request(r, session, exp);
        let vm = r.backends.compute.launch(&request).await?;
        if let Some(entry) = session.resource.status.instance_mut(&exp.name) {
            apply_description(entry, &vm);
        }
        capture_network(session, &vm);
        {
            let step = session
                .resource
                .status
                .progress_metrics
                .step_mut(STEP_PROVISIONING);
            step.ensure_check(&format!("create/{}", exp.name))
                .succeed(now, Some(vm.id.clone()));
            step.refresh(now);
        }
        // The id must be durable before the next create.
        session.save(&r.codec).await?;
    }
    Ok(())
}

/// Record master-0 endpoints once its addresses are known
pub(crate) fn capture_endpoints(session: &mut Session) {
    let (public_ip, private_ip) = {
        let masters = session.resource.status.masters();
        let Some(m0) = masters.first() else {
            return;
        };
        (m0.public_ip.clone(), m0.private_ip.clone())
    };
    let status = &mut session.resource.status;
    if let Some(ip) = public_ip {
        status.api_endpoint = Some(format!("https://{}:6443", ip));
    }
    if let Some(ip) = private_ip {
        status.k3s_server_url = Some(format!("https://{}:6443", ip));
    }
}

/// Provisioning: make the VM set exist and reach `running`
pub(crate) async fn run(
    r: &Reconciler,
    session: &mut Session,
    cancel: &CancellationToken,
) -> Result<ReconcileResult> {
    let placeholders_added = observe_instances(r, session).await?;
    if placeholders_added {
        // Invariant: placeholders are durable before any create call.
        session.save(&r.codec).await?;
    }
    create_placeholders(r, session, cancel).await?;

    let now = Utc::now();
    let mut all_running = true;
    let mut failure: Option<String> = None;
    for instance in &session.resource.status.instances {
        match instance.state {
            VmState::Running => {}
            state if state.is_terminal() => {
                failure = Some(format!(
                    "instance {} entered terminal state {:?}",
                    instance.name, state
                ));
                all_running = false;
            }
            _ => all_running = false,
        }
    }

    {
        let instances = session.resource.status.instances.clone();
        let step = session
            .resource
            .status
            .progress_metrics
            .step_mut(STEP_PROVISIONING);
        for instance in &instances {
            let check = step.ensure_check(&format!("running/{}", instance.name));
            if instance.state == VmState::Running && check.status != StepStatus::Done {
                check.succeed(now, instance.private_ip.clone());
            }
        }
        step.refresh(now);
    }

    if let Some(message) = failure {
        tracing::error!(cluster = %session.resource.name(), %message);
        phases::transition(session, ClusterPhase::Failed, "ProvisionFailed", message);
        return Ok(ReconcileResult::after(r.timings.requeue_installing));
    }

    capture_endpoints(session);

    if all_running && !session.resource.status.instances.is_empty() {
        phases::transition(
            session,
            ClusterPhase::Installing,
            "Provisioned",
            "all instances running, installing k3s",
        );
        return Ok(ReconcileResult::after(r.timings.requeue_provisioning));
    }

    Ok(ReconcileResult::after(r.timings.requeue_provisioning))
}

/// Updating: replace mismatched instances one at a time
///
/// Exactly one instance is advanced per pass; in HA mode this guarantees
/// no two masters are ever replaced concurrently. After a replacement the
/// cluster re-runs Installing/Configuring for the fresh node.
pub(crate) async fn run_updating(
    r: &Reconciler,
    session: &mut Session,
    cancel: &CancellationToken,
) -> Result<ReconcileResult> {
    observe_instances(r, session).await?;

    let expected = session.resource.spec.expected_instances();
    for exp in &expected {
        if cancel.is_cancelled() {
            break;
        }
        let Some(instance) = session.resource.status.instance(&exp.name) else {
            continue;
        };

        let Some(id) = instance.id.clone() else {
            // The stopped half was torn down earlier; finish the swap.
            create_placeholders(r, session, cancel).await?;
            return Ok(ReconcileResult::after(r.timings.requeue_transition));
        };

        if instance.instance_type != exp.instance_type {
            match instance.state {
                VmState::Running | VmState::Pending => {
                    tracing::info!(
                        cluster = %session.resource.name(),
                        instance = %exp.name,
                        from = %instance.instance_type,
                        to = %exp.instance_type,
                        "stopping instance for type change"
                    );
                    r.backends.compute.stop(&id).await?;
                    if let Some(entry) = session.resource.status.instance_mut(&exp.name) {
                        entry.state = VmState::Stopping;
                        entry.k3s_running = false;
                    }
                }
                VmState::Stopped => {
                    r.backends.compute.terminate(&id).await?;
                    if let Some(entry) = session.resource.status.instance_mut(&exp.name) {
                        *entry = Instance::placeholder(exp);
                    }
                    super::configure::reset_for_replacement(session, &exp.name);
                    // Placeholder durable before the replacement create.
                    session.save(&r.codec).await?;
                    create_placeholders(r, session, cancel).await?;
                }
                _ => {}
            }
            return Ok(ReconcileResult::after(r.timings.requeue_transition));
        }

        if instance.state != VmState::Running {
            // Replacement still booting; wait before touching the next one.
            return Ok(ReconcileResult::after(r.timings.requeue_transition));
        }
    }

    // Types converged. Fresh nodes still need the k3s ladder.
    let needs_install = session
        .resource
        .status
        .instances
        .iter()
        .any(|i| !i.k3s_installed);
    if needs_install {
        phases::transition(
            session,
            ClusterPhase::Installing,
            "Updated",
            "instance types converged, reinstalling replaced nodes",
        );
    } else {
        phases::transition(
            session,
            ClusterPhase::Running,
            "Updated",
            "instance types converged",
        );
    }
    Ok(ReconcileResult::after(r.timings.requeue_transition))
}

/// Stopping: power everything down, workers first, master-0 last
pub(crate) async fn run_stopping(r: &Reconciler, session: &mut Session) -> Result<ReconcileResult> {
    observe_instances(r, session).await?;

    let mut order: Vec<String> = session
        .resource
        .spec
        .expected_instances()
        .iter()
        .map(|e| e.name.clone())
        .collect();
    order.reverse();

    let mut all_stopped = true;
    for name in order {
        let Some(instance) = session.resource.status.instance(&name) else {
            continue;
        };
        let Some(id) = instance.id.clone() else {
            continue;
        };
        match instance.state {
            VmState::Stopped => {}
            VmState::Stopping => all_stopped = false,
            _ => {
                r.backends.compute.stop(&id).await?;
                if let Some(entry) = session.resource.status.instance_mut(&name) {
                    entry.state = VmState::Stopping;
                    entry.k3s_running = false;
                }
                all_stopped = false;
            }
        }
    }

    if all_stopped {
        phases::transition(
            session,
            ClusterPhase::Stopped,
            "Stopped",
            "all instances stopped",
        );
        return Ok(ReconcileResult::after(r.timings.requeue_running));
    }
    Ok(ReconcileResult::after(r.timings.requeue_transition))
}

/// Starting: power up masters first, then verify the control plane
pub(crate) async fn run_starting(r: &Reconciler, session: &mut Session) -> Result<ReconcileResult> {
    observe_instances(r, session).await?;
    let now = Utc::now();

    let order: Vec<String> = session
        .resource
        .spec
        .expected_instances()
        .iter()
        .map(|e| e.name.clone())
        .collect();

    let mut all_running = true;
    for name in order {
        let Some(instance) = session.resource.status.instance(&name) else {
            continue;
        };
        let Some(id) = instance.id.clone() else {
            all_running = false;
            continue;
        };
        match instance.state {
            VmState::Running => {}
            VmState::Stopped => {
                r.backends.compute.start(&id).await?;
                if let Some(entry) = session.resource.status.instance_mut(&name) {
                    entry.state = VmState::Pending;
                    entry.k3s_running = false;
                    entry.last_start_time = Some(now);
                }
                all_running = false;
            }
            _ => all_running = false,
        }
    }

    if all_running {
        // The service state must be re-verified after a cold start.
        super::configure::reset_runtime_checks(session);
        phases::transition(
            session,
            ClusterPhase::Configuring,
            "Started",
            "instances running, verifying control plane",
        );
    }
    Ok(ReconcileResult::after(r.timings.requeue_transition))
}
