//! SSM remote exec backend
//!
//! Commands run through the `AWS-RunShellScript` document. A command is
//! fired in one invocation and its result collected by id in a later one.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_ssm::types::CommandInvocationStatus;
use aws_sdk_ssm::Client as SsmClient;
use std::time::Duration;

use super::{ExecStatus, RemoteExec};

/// Remote exec over SSM Run Command
pub struct SsmExec {
    client: SsmClient,
}

impl SsmExec {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: SsmClient::new(config),
        }
    }
}

#[async_trait]
impl RemoteExec for SsmExec {
    async fn send_command(
        &self,
        instance_id: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<String> {
        let response = self
            .client
            .send_command()
            .instance_ids(instance_id)
            .document_name("AWS-RunShellScript")
            .parameters("commands", vec![script.to_string()])
            .parameters(
                "executionTimeout",
                vec![timeout.as_secs().max(1).to_string()],
            )
            .send()
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to send command to '{}'", instance_id))?;

        response
            .command()
            .and_then(|c| c.command_id())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("send-command returned no command id"))
    }

    async fn get_result(&self, command_id: &str) -> Result<ExecStatus> {
        let response = self
            .client
            .list_command_invocations()
            .command_id(command_id)
            .details(true)
            .send()
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to query command '{}'", command_id))?;

        let Some(invocation) = response.command_invocations().first() else {
            // The invocation record may lag the send; treat as still running
            return Ok(ExecStatus::InProgress);
        };

        let output = invocation
            .command_plugins()
            .iter()
            .filter_map(|p| p.output())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(match invocation.status() {
            Some(CommandInvocationStatus::Success) => ExecStatus::Success { stdout: output },
            Some(
                CommandInvocationStatus::Pending
                | CommandInvocationStatus::InProgress
                | CommandInvocationStatus::Delayed,
            )
            | None => ExecStatus::InProgress,
            Some(status) => ExecStatus::Failed {
                stdout: output.clone(),
                stderr: format!("command ended with status {:?}", status),
                exit_code: invocation
                    .command_plugins()
                    .iter()
                    .map(|p| p.response_code())
                    .find(|c| *c != 0),
            },
        })
    }
}
