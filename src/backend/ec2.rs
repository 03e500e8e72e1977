//! EC2 compute backend

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    Filter, Instance as Ec2Instance, InstanceStateName, InstanceType, ResourceType, Tag,
    TagSpecification,
};
use aws_sdk_ec2::Client as Ec2Client;

use super::{Compute, LaunchRequest, VmDescription};
use crate::resource::VmState;

/// Compute backend over EC2
pub struct Ec2Compute {
    client: Ec2Client,
}

impl Ec2Compute {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Ec2Client::new(config),
        }
    }
}

fn map_state(state: Option<&InstanceStateName>) -> VmState {
    match state {
        Some(InstanceStateName::Pending) => VmState::Pending,
        Some(InstanceStateName::Running) => VmState::Running,
        Some(InstanceStateName::Stopping) => VmState::Stopping,
        Some(InstanceStateName::Stopped) => VmState::Stopped,
        Some(InstanceStateName::ShuttingDown) => VmState::ShuttingDown,
        Some(InstanceStateName::Terminated) => VmState::Terminated,
        _ => VmState::Unknown,
    }
}

fn map_instance(instance: &Ec2Instance) -> VmDescription {
    let tags: std::collections::BTreeMap<String, String> = instance
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
        .collect();

    VmDescription {
        id: instance.instance_id().unwrap_or_default().to_string(),
        name: tags.get("Name").cloned().unwrap_or_default(),
        state: map_state(instance.state().and_then(|s| s.name())),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        private_ip: instance.private_ip_address().map(str::to_string),
        public_ip: instance.public_ip_address().map(str::to_string),
        vpc_id: instance.vpc_id().map(str::to_string),
        subnet_id: instance.subnet_id().map(str::to_string),
        security_groups: instance
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id().map(str::to_string))
            .collect(),
        launch_time: instance
            .launch_time()
            .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
        tags,
    }
}

#[async_trait]
impl Compute for Ec2Compute {
    async fn launch(&self, request: &LaunchRequest) -> Result<VmDescription> {
        let mut tag_spec = TagSpecification::builder()
            .resource_type(ResourceType::Instance)
            .tags(Tag::builder().key("Name").value(&request.name).build());
        for (key, value) in &request.tags {
            tag_spec = tag_spec.tags(Tag::builder().key(key).value(value).build());
        }

        let mut run = self
            .client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .tag_specifications(tag_spec.build());
        if !request.subnet_id.is_empty() {
            run = run.subnet_id(&request.subnet_id);
        }
        for group in &request.security_groups {
            run = run.security_group_ids(group);
        }

        let response = run
            .send()
            .await
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to launch instance '{}'", request.name))?;

        let instance = response
            .instances()
            .first()
            .ok_or_else(|| anyhow!("run-instances returned no instance for '{}'", request.name))?;
        Ok(map_instance(instance))
    }

    async fn describe(&self, id: &str) -> Result<Option<VmDescription>> {
        let response = self
            .client
            .describe_instances()
            .instance_ids(id)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                if err.code() == Some("InvalidInstanceID.NotFound") {
                    return Ok(None);
                }
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("failed to describe instance '{}'", id));
            }
        };

        Ok(response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .map(map_instance))
    }

    async fn list_by_tag(&self, key: &str, value: &str) -> Result<Vec<VmDescription>> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self.client.describe_instances().filters(
                Filter::builder()
                    .name(format!("tag:{}", key))
                    .values(value)
                    .build(),
            );
            if let Some(token) = next_token.take() {
                request = request.next_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(anyhow::Error::new)
                .with_context(|| format!("failed to list instances by tag '{}'", key))?;

            instances.extend(
                response
                    .reservations()
                    .iter()
                    .flat_map(|r| r.instances())
                    .filter(|i| {
                        !matches!(
                            map_state(i.state().and_then(|s| s.name())),
                            VmState::Terminated
                        )
                    })
                    .map(map_instance),
            );

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(instances)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.client
            .start_instances()
            .instance_ids(id)
            .send()
            .await
            .map(|_| ())
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to start instance '{}'", id))
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.client
            .stop_instances()
            .instance_ids(id)
            .send()
            .await
            .map(|_| ())
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to stop instance '{}'", id))
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(id)
            .send()
            .await
            .map(|_| ())
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to terminate instance '{}'", id))
    }
}
