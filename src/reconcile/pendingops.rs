//! Pending operation polling
//!
//! Collects the results of fire-and-forget commands and background
//! processes started by earlier invocations. No invocation ever blocks on
//! a remote command: it is fired, registered, and observed later.

use anyhow::Result;
use chrono::Utc;
use std::time::Duration;

use super::{configure, Reconciler, Session};
use crate::backend::ExecStatus;
use crate::resource::{command_key, BackgroundProcess, PendingCommand};

pub(crate) const PURPOSE_READINESS: &str = "readiness-probe";
pub(crate) const PURPOSE_VERSION: &str = "version-probe";
pub(crate) const PURPOSE_INSTALL: &str = "install-k3s";
pub(crate) const PURPOSE_SERVER_INIT: &str = "server-init";
pub(crate) const PURPOSE_TOKEN_READ: &str = "token-read";
pub(crate) const PURPOSE_JOIN: &str = "join-server";
pub(crate) const PURPOSE_AGENT_JOIN: &str = "join-agent";
pub(crate) const PURPOSE_VERIFY: &str = "verify-nodes";
pub(crate) const PURPOSE_KUBECONFIG: &str = "kubeconfig-read";
pub(crate) const PURPOSE_HEALTH: &str = "health-probe";

/// Poll every pending entry belonging to the given steps
pub(crate) async fn poll(r: &Reconciler, session: &mut Session, steps: &[&str]) -> Result<()> {
    poll_commands(r, session, steps).await?;
    poll_background(r, session, steps).await?;
    Ok(())
}

async fn poll_commands(r: &Reconciler, session: &mut Session, steps: &[&str]) -> Result<()> {
    let now = Utc::now();
    let keys: Vec<String> = session
        .resource
        .status
        .pending_operations
        .commands
        .iter()
        .filter(|(_, cmd)| steps.contains(&cmd.step_name.as_str()))
        .map(|(key, _)| key.clone())
        .collect();

    for key in keys {
        let Some(cmd) = session
            .resource
            .status
            .pending_operations
            .commands
            .get(&key)
            .cloned()
        else {
            continue;
        };

        let status = match r.backends.exec.get_result(&cmd.command_id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    command = %cmd.command_id,
                    error = %e,
                    "result query failed, will retry"
                );
                continue;
            }
        };

        match status {
            ExecStatus::InProgress => {
                if cmd.expired(now) {
                    tracing::warn!(
                        command = %cmd.command_id,
                        purpose = %cmd.purpose,
                        "command exceeded its deadline"
                    );
                    session.resource.status.pending_operations.commands.remove(&key);
                    fail_check(session, &cmd.step_name, &cmd.check_name, "command timed out");
                }
            }
            ExecStatus::Success { stdout } => {
                session.resource.status.pending_operations.commands.remove(&key);
                on_command_success(r, session, &cmd, &stdout).await?;
            }
            ExecStatus::Failed {
                stdout,
                stderr,
                exit_code,
            } => {
                session.resource.status.pending_operations.commands.remove(&key);
                let detail = if stderr.is_empty() { stdout } else { stderr };
                let message = match exit_code {
                    Some(code) => format!("exit {}: {}", code, truncate(&detail)),
                    None => truncate(&detail).to_string(),
                };
                tracing::warn!(
                    command = %cmd.command_id,
                    purpose = %cmd.purpose,
                    %message,
                    "command failed"
                );
                fail_check(session, &cmd.step_name, &cmd.check_name, message);
            }
        }
    }
    Ok(())
}

async fn poll_background(r: &Reconciler, session: &mut Session, steps: &[&str]) -> Result<()> {
    let now = Utc::now();
    let keys: Vec<String> = session
        .resource
        .status
        .pending_operations
        .background_processes
        .iter()
        .filter(|(_, bg)| steps.contains(&bg.step_name.as_str()))
        .map(|(key, _)| key.clone())
        .collect();

    for key in keys {
        let Some(bg) = session
            .resource
            .status
            .pending_operations
            .background_processes
            .get(&key)
            .cloned()
        else {
            continue;
        };

        match &bg.probe_command_id {
            None => {
                // Probe: either the pid is alive, or the log is the outcome.
                let script = format!(
                    "if kill -0 \"$(cat {} 2>/dev/null)\" 2>/dev/null; then echo RUNNING; else cat {}; fi",
                    bg.pid_file, bg.log_file
                );
                let command_id = r
                    .backends
                    .exec
                    .send_command(&bg.instance_id, &script, r.timings.cmd_probe)
                    .await?;
                if let Some(entry) = session
                    .resource
                    .status
                    .pending_operations
                    .background_processes
                    .get_mut(&key)
                {
                    entry.probe_command_id = Some(command_id);
                }
            }
            Some(probe_id) => match r.backends.exec.get_result(probe_id).await {
                Err(e) => {
                    tracing::warn!(probe = %probe_id, error = %e, "probe query failed");
                }
                Ok(ExecStatus::InProgress) => {}
                Ok(ExecStatus::Success { stdout }) => {
                    if stdout.trim() == "RUNNING" {
                        if bg.expired(now) {
                            session
                                .resource
                                .status
                                .pending_operations
                                .background_processes
                                .remove(&key);
                            fail_check(
                                session,
                                &bg.step_name,
                                &bg.check_name,
                                "background process exceeded its deadline",
                            );
                        } else if let Some(entry) = session
                            .resource
                            .status
                            .pending_operations
                            .background_processes
                            .get_mut(&key)
                        {
                            entry.probe_command_id = None;
                        }
                    } else {
                        session
                            .resource
                            .status
                            .pending_operations
                            .background_processes
                            .remove(&key);
                        on_background_complete(session, &bg, &stdout);
                    }
                }
                Ok(ExecStatus::Failed { stderr, .. }) => {
                    session
                        .resource
                        .status
                        .pending_operations
                        .background_processes
                        .remove(&key);
                    fail_check(
                        session,
                        &bg.step_name,
                        &bg.check_name,
                        format!("probe failed: {}", truncate(&stderr)),
                    );
                }
            },
        }
    }
    Ok(())
}

/// Fire a remote command and register both the check and the pending entry
#[allow(clippy::too_many_arguments)]
pub(crate) async fn fire_command(
    r: &Reconciler,
    session: &mut Session,
    instance_name: &str,
    instance_id: &str,
    script: &str,
    purpose: &str,
    timeout: Duration,
    step_name: &str,
    check_name: &str,
) -> Result<()> {
    let now = Utc::now();
    let command_id = r
        .backends
        .exec
        .send_command(instance_id, script, timeout)
        .await?;
    tracing::debug!(
        instance = instance_name,
        %purpose,
        command = %command_id,
        "command fired"
    );

    let status = &mut session.resource.status;
    status
        .progress_metrics
        .step_mut(step_name)
        .ensure_check(check_name)
        .begin(now);
    status.progress_metrics.step_mut(step_name).refresh(now);
    status.pending_operations.add_command(
        command_id,
        instance_name,
        instance_id,
        purpose,
        timeout,
        step_name,
        check_name,
        now,
    );
    Ok(())
}

/// Start a background process and register its tracking entry
#[allow(clippy::too_many_arguments)]
pub(crate) async fn fire_background(
    r: &Reconciler,
    session: &mut Session,
    instance_name: &str,
    instance_id: &str,
    script: &str,
    pid_file: &str,
    log_file: &str,
    purpose: &str,
    timeout: Duration,
    step_name: &str,
    check_name: &str,
) -> Result<()> {
    let now = Utc::now();
    // The launcher itself is quick; it backgrounds the real work.
    r.backends
        .exec
        .send_command(instance_id, script, r.timings.cmd_probe)
        .await?;

    let status = &mut session.resource.status;
    status
        .progress_metrics
        .step_mut(step_name)
        .ensure_check(check_name)
        .begin(now);
    status.progress_metrics.step_mut(step_name).refresh(now);
    status.pending_operations.add_background_process(
        instance_name,
        instance_id,
        pid_file,
        log_file,
        purpose,
        timeout,
        step_name,
        check_name,
        now,
    );
    Ok(())
}

/// Whether the (step, check) pair may fire a new command now
pub(crate) fn check_eligible(
    session: &Session,
    step_name: &str,
    check_name: &str,
    in_progress_timeout: Duration,
) -> bool {
    let status = &session.resource.status;
    if status
        .pending_operations
        .commands
        .contains_key(&command_key(step_name, check_name))
        || status
            .pending_operations
            .background_processes
            .contains_key(&command_key(step_name, check_name))
    {
        return false;
    }
    match status
        .progress_metrics
        .step(step_name)
        .and_then(|s| s.check(check_name))
    {
        Some(check) => check.eligible(Utc::now(), in_progress_timeout),
        None => true,
    }
}

pub(crate) fn check_done(session: &Session, step_name: &str, check_name: &str) -> bool {
    session
        .resource
        .status
        .progress_metrics
        .step(step_name)
        .and_then(|s| s.check(check_name))
        .map(|c| c.status == crate::resource::StepStatus::Done)
        .unwrap_or(false)
}

async fn on_command_success(
    r: &Reconciler,
    session: &mut Session,
    cmd: &PendingCommand,
    stdout: &str,
) -> Result<()> {
    let now = Utc::now();
    match cmd.purpose.as_str() {
        PURPOSE_VERSION => {
            if stdout.contains("NOT_INSTALLED") {
                succeed_check(session, cmd, Some("k3s not installed".to_string()));
            } else {
                let version = stdout.lines().next().unwrap_or_default().trim().to_string();
                if let Some(instance) = session.resource.status.instance_mut(&cmd.instance_name) {
                    instance.k3s_installed = true;
                    instance.k3s_version = Some(version.clone());
                }
                succeed_check(session, cmd, Some(format!("already installed: {}", version)));
                // No install needed for this instance.
                let install_check = format!("install/{}", cmd.instance_name);
                let step = session
                    .resource
                    .status
                    .progress_metrics
                    .step_mut(&cmd.step_name);
                let check = step.ensure_check(&install_check);
                if check.status == crate::resource::StepStatus::Pending {
                    check.status = crate::resource::StepStatus::Skipped;
                }
                step.refresh(now);
            }
        }
        PURPOSE_INSTALL => {
            let version = session.resource.spec.k3s_version.clone();
            if let Some(instance) = session.resource.status.instance_mut(&cmd.instance_name) {
                instance.k3s_installed = true;
                instance.k3s_version = Some(version);
                instance.k3s_install_time = Some(now);
                instance.last_error = None;
            }
            succeed_check(session, cmd, None);
        }
        PURPOSE_SERVER_INIT | PURPOSE_JOIN | PURPOSE_AGENT_JOIN => {
            if let Some(instance) = session.resource.status.instance_mut(&cmd.instance_name) {
                instance.k3s_running = true;
                instance.service_down_since = None;
                instance.last_error = None;
            }
            succeed_check(session, cmd, None);
        }
        PURPOSE_TOKEN_READ => {
            let token = stdout.trim().to_string();
            if token.is_empty() {
                // The server may still be writing the token file; retry.
                fail_check(session, &cmd.step_name, &cmd.check_name, "token not available yet");
            } else {
                let key = crate::resource::token_key(session.resource.name());
                r.codec.put_object(&key, &token).await?;
                session.resource.status.join_token = Some(token);
                succeed_check(session, cmd, None);
            }
        }
        PURPOSE_KUBECONFIG => {
            let endpoint = session.resource.status.api_endpoint.clone();
            let kubeconfig = configure::rewrite_kubeconfig(stdout, endpoint.as_deref());
            let key = crate::resource::kubeconfig_key(session.resource.name());
            r.codec.put_object(&key, &kubeconfig).await?;
            session.resource.status.kube_config = Some(kubeconfig);
            succeed_check(session, cmd, None);
        }
        PURPOSE_HEALTH => {
            let active = stdout.trim() == "active";
            if let Some(instance) = session.resource.status.instance_mut(&cmd.instance_name) {
                if active {
                    instance.k3s_running = true;
                    instance.service_down_since = None;
                } else {
                    instance.k3s_running = false;
                    instance.service_down_since.get_or_insert(now);
                }
            }
            succeed_check(
                session,
                cmd,
                Some(if active { "active" } else { "inactive" }.to_string()),
            );
        }
        // Readiness and anything unrecognized: success is success.
        _ => succeed_check(session, cmd, None),
    }
    Ok(())
}

fn on_background_complete(session: &mut Session, bg: &BackgroundProcess, log: &str) {
    if bg.purpose == PURPOSE_VERIFY {
        let expected = session.resource.spec.expected_masters() as usize;
        let ready = configure::count_ready_nodes(log);
        if ready >= expected {
            let now = Utc::now();
            let step = session
                .resource
                .status
                .progress_metrics
                .step_mut(&bg.step_name);
            step.ensure_check(&bg.check_name)
                .succeed(now, Some(format!("{} nodes ready", ready)));
            step.refresh(now);
        } else {
            fail_check(
                session,
                &bg.step_name,
                &bg.check_name,
                format!("only {}/{} nodes ready", ready, expected),
            );
        }
    }
}

fn succeed_check(session: &mut Session, cmd: &PendingCommand, details: Option<String>) {
    let now = Utc::now();
    let step = session
        .resource
        .status
        .progress_metrics
        .step_mut(&cmd.step_name);
    step.ensure_check(&cmd.check_name).succeed(now, details);
    step.refresh(now);
}

pub(crate) fn fail_check(
    session: &mut Session,
    step_name: &str,
    check_name: &str,
    message: impl Into<String>,
) {
    let now = Utc::now();
    let message = message.into();
    let step = session.resource.status.progress_metrics.step_mut(step_name);
    let check = step.ensure_check(check_name);
    check.fail(now, message);

    // Token reads and replica joins never fail permanently: the token may
    // simply not exist yet, and a lagging replica must not sink the cluster.
    let retry_forever = check_name == configure::CHECK_TOKEN
        || check_name.starts_with("join/")
        || check_name.starts_with("agent-join/");
    if retry_forever && check.permanently_failed() {
        check.failure_count = crate::config::MAX_CHECK_FAILURES - 1;
        check.retry_after = Some(
            now + chrono::Duration::from_std(crate::config::Timings::check_backoff(
                check.failure_count,
            ))
            .unwrap_or_else(|_| chrono::Duration::seconds(4)),
        );
    }
    step.refresh(now);
}

fn truncate(text: &str) -> &str {
    let text = text.trim();
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
