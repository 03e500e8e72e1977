//! K3s configurator: forms the control plane
//!
//! Ordered frontier over persistent checks: init master-0, publish the join
//! token, join the remaining masters in parallel, verify node readiness via
//! a background process, extract the kubeconfig. Every invocation is a pure
//! re-entry that inspects current state and advances at most one frontier
//! per check.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::pendingops::{
    self, check_done, check_eligible, fire_background, fire_command, PURPOSE_AGENT_JOIN,
    PURPOSE_JOIN, PURPOSE_KUBECONFIG, PURPOSE_SERVER_INIT, PURPOSE_TOKEN_READ, PURPOSE_VERIFY,
};
use super::{phases, provision, ReconcileResult, Reconciler, Session};
use crate::resource::{ClusterPhase, NodePool, StepStatus, STEP_CONFIGURING};

pub(crate) const CHECK_SERVER_INIT: &str = "server-init";
pub(crate) const CHECK_TOKEN: &str = "token-publish";
pub(crate) const CHECK_VERIFY: &str = "verify-nodes";
pub(crate) const CHECK_KUBECONFIG: &str = "kubeconfig";

const VERIFY_PID_FILE: &str = "/tmp/k3man-verify.pid";
const VERIFY_LOG_FILE: &str = "/tmp/k3man-verify.log";
const NODE_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";
const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

fn join_check(name: &str) -> String {
    format!("join/{}", name)
}

fn agent_check(name: &str) -> String {
    format!("agent-join/{}", name)
}

fn start_check(name: &str) -> String {
    format!("service-start/{}", name)
}

/// First-master init: graceful purge, config file, start
///
/// The purge is TERM first, KILL only after a grace sleep. A kill-first
/// purge can leave etcd with a torn write-ahead log.
fn server_init_script(
    ha: bool,
    public_ip: &str,
    private_ip: &str,
    cluster_cidr: &str,
    service_cidr: &str,
) -> String {
    let cluster_init = if ha { "cluster-init: true\n" } else { "" };
    format!(
        "# k3man server-init for master-0\n\
         set -e\n\
         systemctl stop k3s 2>/dev/null || true\n\
         pkill -TERM -x k3s 2>/dev/null || true\n\
         sleep 5\n\
         pkill -KILL -x k3s 2>/dev/null || true\n\
         rm -rf /var/lib/rancher/k3s/server/db\n\
         mkdir -p /etc/rancher/k3s\n\
         cat > /etc/rancher/k3s/config.yaml <<EOF\n\
         {cluster_init}\
         tls-san:\n\
         \x20 - {public_ip}\n\
         \x20 - {private_ip}\n\
         node-ip: {private_ip}\n\
         cluster-cidr: {cluster_cidr}\n\
         service-cidr: {service_cidr}\n\
         EOF\n\
         systemctl enable k3s 2>/dev/null || true\n\
         systemctl start k3s\n\
         systemctl is-active k3s"
    )
}

/// Replica join: download the token, point at master-0, start
fn join_script(name: &str, bucket: &str, cluster: &str, server_url: &str) -> String {
    format!(
        "# k3man join-server for {name}\n\
         set -e\n\
         TOKEN=\"$(aws s3 cp s3://{bucket}/clusters/{cluster}/k3s-server-token -)\"\n\
         test -n \"$TOKEN\"\n\
         mkdir -p /etc/rancher/k3s\n\
         cat > /etc/rancher/k3s/config.yaml <<EOF\n\
         server: {server_url}\n\
         token: $TOKEN\n\
         EOF\n\
         systemctl enable k3s 2>/dev/null || true\n\
         systemctl start k3s\n\
         systemctl is-active k3s"
    )
}

/// Worker agent join with pool labels and taints
fn agent_script(
    name: &str,
    bucket: &str,
    cluster: &str,
    server_url: &str,
    pool: Option<&NodePool>,
) -> String {
    let mut extras = String::new();
    if let Some(pool) = pool {
        extras.push_str("node-label:\n");
        extras.push_str(&format!("  - pool={}\n", pool.name));
        for (key, value) in &pool.labels {
            extras.push_str(&format!("  - {}={}\n", key, value));
        }
        if !pool.taints.is_empty() {
            extras.push_str("node-taint:\n");
            for taint in &pool.taints {
                extras.push_str(&format!("  - {}\n", taint));
            }
        }
    }
    format!(
        "# k3man join-agent for {name}\n\
         set -e\n\
         TOKEN=\"$(aws s3 cp s3://{bucket}/clusters/{cluster}/k3s-server-token -)\"\n\
         test -n \"$TOKEN\"\n\
         mkdir -p /etc/rancher/k3s\n\
         cat > /etc/rancher/k3s/config.yaml <<EOF\n\
         server: {server_url}\n\
         token: $TOKEN\n\
         {extras}\
         EOF\n\
         systemctl enable k3s-agent 2>/dev/null || true\n\
         systemctl start k3s-agent\n\
         systemctl is-active k3s-agent"
    )
}

/// Restart a previously configured service after a power cycle or outage
fn service_start_script(name: &str, is_master: bool) -> String {
    let unit = if is_master { "k3s" } else { "k3s-agent" };
    format!(
        "# k3man service-start for {name}\n\
         systemctl start {unit} && systemctl is-active {unit}"
    )
}

/// Launch the node-readiness watcher as a background process
fn verify_launcher_script(expected: usize) -> String {
    format!(
        "# k3man verify-nodes for master-0\n\
         nohup sh -c 'for i in $(seq 1 60); do \
         ready=$(k3s kubectl get nodes --no-headers 2>/dev/null | grep -c \" Ready\"); \
         if [ \"$ready\" -ge {expected} ]; then break; fi; sleep 10; done; \
         k3s kubectl get nodes --no-headers > {log} 2>&1' >/dev/null 2>&1 &\n\
         echo $! > {pid}",
        expected = expected,
        log = VERIFY_LOG_FILE,
        pid = VERIFY_PID_FILE,
    )
}

/// Count Ready nodes in `kubectl get nodes --no-headers` output
pub(crate) fn count_ready_nodes(output: &str) -> usize {
    output
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .nth(1)
                .is_some_and(|status| status.starts_with("Ready"))
        })
        .count()
}

/// Substitute the in-VM loopback endpoint with the public one
pub(crate) fn rewrite_kubeconfig(kubeconfig: &str, endpoint: Option<&str>) -> String {
    match endpoint {
        Some(endpoint) => kubeconfig.replace("https://127.0.0.1:6443", endpoint),
        None => kubeconfig.to_string(),
    }
}

/// Forget everything proven about a replaced instance
///
/// A fresh VM behind an old name must redo its whole ladder: readiness,
/// install, join, service state. For a single-master cluster the control
/// plane itself is gone, so the init and token checks reset too.
pub(crate) fn reset_for_replacement(session: &mut Session, name: &str) {
    let suffix = format!("/{}", name);
    for step in &mut session.resource.status.progress_metrics.steps {
        let mut touched = false;
        for check in &mut step.checks {
            if check.name.ends_with(&suffix) {
                *check = crate::resource::Check::new(check.name.clone());
                touched = true;
            }
        }
        if touched && step.status == StepStatus::Done {
            step.status = StepStatus::InProgress;
            step.end_time = None;
        }
    }

    if name == "master-0" && session.resource.spec.expected_masters() == 1 {
        let step = session
            .resource
            .status
            .progress_metrics
            .step_mut(STEP_CONFIGURING);
        for check_name in [CHECK_SERVER_INIT, CHECK_TOKEN] {
            if let Some(check) = step.checks.iter_mut().find(|c| c.name == check_name) {
                *check = crate::resource::Check::new(check_name);
            }
        }
        if step.status == StepStatus::Done {
            step.status = StepStatus::InProgress;
            step.end_time = None;
        }
        session.resource.status.join_token = None;
    }

    reset_runtime_checks(session);
}

/// Reset checks that describe runtime state rather than completed setup
///
/// Called when instances were power-cycled or the service dropped: node
/// readiness, the kubeconfig endpoint and any service restarts must be
/// proven again.
pub(crate) fn reset_runtime_checks(session: &mut Session) {
    let step = session
        .resource
        .status
        .progress_metrics
        .step_mut(STEP_CONFIGURING);
    for check in &mut step.checks {
        if check.name == CHECK_VERIFY
            || check.name == CHECK_KUBECONFIG
            || check.name.starts_with("service-start/")
        {
            check.status = StepStatus::Pending;
            check.failure_count = 0;
            check.retry_after = None;
            check.start_time = None;
            check.end_time = None;
            check.error_message = None;
        }
    }
    if step.status == StepStatus::Done {
        step.status = StepStatus::InProgress;
    }
    step.end_time = None;
}

struct MasterView {
    name: String,
    id: String,
    installed: bool,
    running: bool,
}

pub(crate) async fn run(
    r: &Reconciler,
    session: &mut Session,
    cancel: &CancellationToken,
) -> Result<ReconcileResult> {
    // Straggling worker installs from the previous phase are still ours.
    pendingops::poll(
        r,
        session,
        &[STEP_CONFIGURING, crate::resource::STEP_INSTALLING],
    )
    .await?;
    provision::capture_endpoints(session);

    let masters: Vec<MasterView> = session
        .resource
        .status
        .masters()
        .iter()
        .filter_map(|m| {
            Some(MasterView {
                name: m.name.clone(),
                id: m.id.clone()?,
                installed: m.k3s_installed,
                running: m.k3s_running,
            })
        })
        .collect();
    let has_workers = !session.resource.status.workers().is_empty();

    if masters.is_empty() {
        phases::transition(
            session,
            ClusterPhase::Provisioning,
            "MastersMissing",
            "no master instances tracked, reprovisioning",
        );
        return Ok(ReconcileResult::after(r.timings.requeue_provisioning));
    }

    let expected_masters = session.resource.spec.expected_masters() as usize;
    let ha = expected_masters > 1;
    let bucket = r.settings.bucket.clone();
    let cluster = session.resource.name().to_string();
    let server_url = session
        .resource
        .status
        .k3s_server_url
        .clone()
        .unwrap_or_default();

    // A permanently failed first-master init is fatal for the cluster.
    let init_permanent = session
        .resource
        .status
        .progress_metrics
        .step(STEP_CONFIGURING)
        .and_then(|s| s.check(CHECK_SERVER_INIT))
        .is_some_and(|c| c.permanently_failed());
    if init_permanent {
        phases::transition(
            session,
            ClusterPhase::Failed,
            "InitFailed",
            "first master initialization failed permanently",
        );
        return Ok(ReconcileResult::done());
    }

    let init_done = check_done(session, STEP_CONFIGURING, CHECK_SERVER_INIT);
    if !init_done {
        if masters[0].installed
            && !cancel.is_cancelled()
            && check_eligible(session, STEP_CONFIGURING, CHECK_SERVER_INIT, r.timings.cmd_server)
        {
            let (public_ip, private_ip, cluster_cidr, service_cidr) = {
                let resource = &session.resource;
                let m0 = resource.status.instance(&masters[0].name);
                (
                    m0.and_then(|m| m.public_ip.clone()).unwrap_or_default(),
                    m0.and_then(|m| m.private_ip.clone()).unwrap_or_default(),
                    resource.spec.network.cluster_cidr.clone(),
                    resource.spec.network.service_cidr.clone(),
                )
            };
            let script =
                server_init_script(ha, &public_ip, &private_ip, &cluster_cidr, &service_cidr);
            fire_command(
                r,
                session,
                &masters[0].name,
                &masters[0].id,
                &script,
                PURPOSE_SERVER_INIT,
                r.timings.cmd_server,
                STEP_CONFIGURING,
                CHECK_SERVER_INIT,
            )
            .await?;
        }
        return Ok(ReconcileResult::after(r.timings.requeue_configuring));
    }

    // Restart path: configured instances whose service is down get a plain
    // service start, never a re-init (a re-init would purge server state).
    for (index, master) in masters.iter().enumerate() {
        let configured = if index == 0 {
            true
        } else {
            check_done(session, STEP_CONFIGURING, &join_check(&master.name))
        };
        if !configured || master.running {
            continue;
        }
        let check = start_check(&master.name);
        if check_done(session, STEP_CONFIGURING, &check) {
            // The last start is stale; the service dropped again.
            reset_single_check(session, &check);
        }
        if check_eligible(session, STEP_CONFIGURING, &check, r.timings.cmd_server) {
            fire_command(
                r,
                session,
                &master.name,
                &master.id,
                &service_start_script(&master.name, true),
                PURPOSE_SERVER_INIT,
                r.timings.cmd_server,
                STEP_CONFIGURING,
                &check,
            )
            .await?;
        }
    }

    // Token publication gates every join.
    let token_needed = ha || has_workers;
    let token_done = check_done(session, STEP_CONFIGURING, CHECK_TOKEN);
    if token_needed && !token_done {
        if masters[0].running
            && check_eligible(session, STEP_CONFIGURING, CHECK_TOKEN, r.timings.cmd_probe)
        {
            let script = format!(
                "# k3man token-read for master-0\ncat {}",
                NODE_TOKEN_PATH
            );
            fire_command(
                r,
                session,
                &masters[0].name,
                &masters[0].id,
                &script,
                PURPOSE_TOKEN_READ,
                r.timings.cmd_probe,
                STEP_CONFIGURING,
                CHECK_TOKEN,
            )
            .await?;
        }
        return Ok(ReconcileResult::after(r.timings.requeue_configuring));
    }

    // Remaining masters join in parallel; each check is independent.
    if ha {
        for master in masters.iter().skip(1) {
            if cancel.is_cancelled() {
                break;
            }
            let check = join_check(&master.name);
            if master.installed
                && !check_done(session, STEP_CONFIGURING, &check)
                && check_eligible(session, STEP_CONFIGURING, &check, r.timings.cmd_server)
            {
                let script = join_script(&master.name, &bucket, &cluster, &server_url);
                fire_command(
                    r,
                    session,
                    &master.name,
                    &master.id,
                    &script,
                    PURPOSE_JOIN,
                    r.timings.cmd_server,
                    STEP_CONFIGURING,
                    &check,
                )
                .await?;
            }
        }
    }

    // Workers install and join as agents; they never gate the cluster.
    let worker_targets = super::install::worker_targets(session);
    super::install::advance_ladder(r, session, worker_targets, cancel).await?;
    advance_worker_joins(r, session).await?;

    let masters_running = masters.iter().all(|m| m.running);
    let joins_done = !ha
        || masters
            .iter()
            .skip(1)
            .all(|m| check_done(session, STEP_CONFIGURING, &join_check(&m.name)));

    // Node readiness runs on master-0 as a background process.
    let verify_done = check_done(session, STEP_CONFIGURING, CHECK_VERIFY);
    if masters_running && joins_done && !verify_done {
        if check_eligible(
            session,
            STEP_CONFIGURING,
            CHECK_VERIFY,
            r.timings.verify_background,
        ) {
            fire_background(
                r,
                session,
                &masters[0].name,
                &masters[0].id,
                &verify_launcher_script(expected_masters),
                VERIFY_PID_FILE,
                VERIFY_LOG_FILE,
                PURPOSE_VERIFY,
                r.timings.verify_background,
                STEP_CONFIGURING,
                CHECK_VERIFY,
            )
            .await?;
        }
        return Ok(ReconcileResult::after(r.timings.requeue_configuring));
    }

    let kubeconfig_done = check_done(session, STEP_CONFIGURING, CHECK_KUBECONFIG);
    if verify_done && !kubeconfig_done {
        if check_eligible(
            session,
            STEP_CONFIGURING,
            CHECK_KUBECONFIG,
            r.timings.cmd_probe,
        ) {
            let script = format!(
                "# k3man kubeconfig-read for master-0\ncat {}",
                KUBECONFIG_PATH
            );
            fire_command(
                r,
                session,
                &masters[0].name,
                &masters[0].id,
                &script,
                PURPOSE_KUBECONFIG,
                r.timings.cmd_probe,
                STEP_CONFIGURING,
                CHECK_KUBECONFIG,
            )
            .await?;
        }
        return Ok(ReconcileResult::after(r.timings.requeue_configuring));
    }

    if init_done && masters_running && joins_done && verify_done && kubeconfig_done {
        // The init/join commands just proved every service healthy; start
        // the steady-state probe cadence from now.
        let now = chrono::Utc::now();
        {
            let step = session
                .resource
                .status
                .progress_metrics
                .step_mut(super::health::STEP_HEALTH);
            for master in &masters {
                step.ensure_check(&format!("health/{}", master.name))
                    .succeed(now, Some("active".to_string()));
            }
            step.refresh(now);
        }
        phases::transition(
            session,
            ClusterPhase::Running,
            "Ready",
            format!("{} masters ready, kubeconfig published", masters.len()),
        );
        return Ok(ReconcileResult::after(r.timings.requeue_running));
    }

    Ok(ReconcileResult::after(r.timings.requeue_configuring))
}

/// Fire agent joins for installed workers whose join is still outstanding
///
/// Shared by Configuring and the steady-state Running pass, so lagging
/// workers keep converging after the cluster is serving.
pub(crate) async fn advance_worker_joins(r: &Reconciler, session: &mut Session) -> Result<()> {
    if !check_done(session, STEP_CONFIGURING, CHECK_TOKEN) {
        return Ok(());
    }

    let bucket = r.settings.bucket.clone();
    let cluster = session.resource.name().to_string();
    let server_url = session
        .resource
        .status
        .k3s_server_url
        .clone()
        .unwrap_or_default();

    let workers: Vec<(String, String, Option<String>)> = session
        .resource
        .status
        .workers()
        .iter()
        .filter(|w| w.k3s_installed)
        .filter_map(|w| Some((w.name.clone(), w.id.clone()?, w.pool.clone())))
        .collect();

    for (name, id, pool_name) in workers {
        let check = agent_check(&name);
        if !check_done(session, STEP_CONFIGURING, &check)
            && check_eligible(session, STEP_CONFIGURING, &check, r.timings.cmd_server)
        {
            let pool = session
                .resource
                .spec
                .node_pools
                .iter()
                .find(|p| Some(&p.name) == pool_name.as_ref())
                .cloned();
            let script = agent_script(&name, &bucket, &cluster, &server_url, pool.as_ref());
            fire_command(
                r,
                session,
                &name,
                &id,
                &script,
                PURPOSE_AGENT_JOIN,
                r.timings.cmd_server,
                STEP_CONFIGURING,
                &check,
            )
            .await?;
        }
    }
    Ok(())
}

fn reset_single_check(session: &mut Session, check_name: &str) {
    let step = session
        .resource
        .status
        .progress_metrics
        .step_mut(STEP_CONFIGURING);
    if let Some(check) = step.checks.iter_mut().find(|c| c.name == check_name) {
        check.status = StepStatus::Pending;
        check.retry_after = None;
        check.start_time = None;
        check.end_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_ready_nodes() {
        let output = "\
master-0   Ready      control-plane,etcd   5m    v1.33.4+k3s1
master-1   Ready      control-plane,etcd   3m    v1.33.4+k3s1
master-2   NotReady   control-plane,etcd   1m    v1.33.4+k3s1
workers-0  Ready,SchedulingDisabled   <none>   1m   v1.33.4+k3s1";
        assert_eq!(count_ready_nodes(output), 3);
        assert_eq!(count_ready_nodes(""), 0);
    }

    #[test]
    fn test_rewrite_kubeconfig_substitutes_endpoint() {
        let kubeconfig = "clusters:\n- cluster:\n    server: https://127.0.0.1:6443\n";
        let rewritten = rewrite_kubeconfig(kubeconfig, Some("https://54.0.0.1:6443"));
        assert!(rewritten.contains("https://54.0.0.1:6443"));
        assert!(!rewritten.contains("127.0.0.1"));

        // Without a known endpoint the document passes through untouched
        assert_eq!(rewrite_kubeconfig(kubeconfig, None), kubeconfig);
    }

    #[test]
    fn test_server_init_script_purges_gracefully() {
        let script = server_init_script(true, "54.0.0.1", "10.0.0.1", "10.42.0.0/16", "10.43.0.0/16");
        assert!(script.contains("cluster-init: true"));

        // TERM must come before KILL
        let term = script.find("pkill -TERM").unwrap();
        let kill = script.find("pkill -KILL").unwrap();
        assert!(term < kill);

        let dev = server_init_script(false, "54.0.0.1", "10.0.0.1", "10.42.0.0/16", "10.43.0.0/16");
        assert!(!dev.contains("cluster-init"));
    }

    #[test]
    fn test_join_script_downloads_token_from_store() {
        let script = join_script("master-1", "k3man-bucket", "demo", "https://10.0.0.1:6443");
        assert!(script.contains("s3://k3man-bucket/clusters/demo/k3s-server-token"));
        assert!(script.contains("server: https://10.0.0.1:6443"));
    }

    #[test]
    fn test_agent_script_carries_pool_labels_and_taints() {
        let pool = NodePool {
            name: "batch".to_string(),
            count: 2,
            labels: [("tier".to_string(), "spot".to_string())].into(),
            taints: vec!["dedicated=batch:NoSchedule".to_string()],
            ..Default::default()
        };
        let script = agent_script("batch-0", "b", "demo", "https://10.0.0.1:6443", Some(&pool));
        assert!(script.contains("pool=batch"));
        assert!(script.contains("tier=spot"));
        assert!(script.contains("dedicated=batch:NoSchedule"));
        assert!(script.contains("k3s-agent"));
    }
}
