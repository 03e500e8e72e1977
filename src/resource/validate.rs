//! Cluster config validation
//!
//! Hard errors only: a config that fails validation parks the resource in
//! `Failed` with reason `Invalid` until the collaborator edits it.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use super::types::ClusterResource;

/// DNS-label style cluster and pool names, max 40 chars
static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,38}[a-z0-9])?$").expect("invalid NAME_REGEX"));

/// IPv4 CIDR, e.g. 10.42.0.0/16
static CIDR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})/(\d{1,2})$")
        .expect("invalid CIDR_REGEX")
});

/// Hard validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidName {
        name: String,
    },
    MissingField {
        field: &'static str,
    },
    UnsupportedProvider {
        provider: String,
    },
    MasterCountMismatch {
        mode: String,
        master_count: u32,
    },
    InvalidCidr {
        field: &'static str,
        value: String,
    },
    DuplicateNodePool {
        name: String,
    },
    ImmutableFieldChanged {
        field: &'static str,
        from: String,
        to: String,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidName { name } => {
                write!(f, "invalid cluster name '{}'", name)
            }
            ValidationError::MissingField { field } => {
                write!(f, "missing required field '{}'", field)
            }
            ValidationError::UnsupportedProvider { provider } => {
                write!(f, "unsupported provider '{}'", provider)
            }
            ValidationError::MasterCountMismatch { mode, master_count } => {
                write!(
                    f,
                    "masterCount {} does not match mode '{}'",
                    master_count, mode
                )
            }
            ValidationError::InvalidCidr { field, value } => {
                write!(f, "invalid CIDR for '{}': '{}'", field, value)
            }
            ValidationError::DuplicateNodePool { name } => {
                write!(f, "duplicate node pool name '{}'", name)
            }
            ValidationError::ImmutableFieldChanged { field, from, to } => {
                write!(
                    f,
                    "field '{}' is immutable (was '{}', now '{}')",
                    field, from, to
                )
            }
        }
    }
}

/// Validate a loaded resource against the model invariants
pub fn validate(resource: &ClusterResource) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_name(resource, &mut errors);
    check_spec_fields(resource, &mut errors);
    check_master_count(resource, &mut errors);
    check_cidrs(resource, &mut errors);
    check_node_pools(resource, &mut errors);
    check_immutable_fields(resource, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Join validation errors into one operator-facing message
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn check_name(resource: &ClusterResource, errors: &mut Vec<ValidationError>) {
    let name = &resource.metadata.name;
    if name.is_empty() {
        errors.push(ValidationError::MissingField {
            field: "metadata.name",
        });
    } else if !NAME_REGEX.is_match(name) {
        errors.push(ValidationError::InvalidName { name: name.clone() });
    }
}

fn check_spec_fields(resource: &ClusterResource, errors: &mut Vec<ValidationError>) {
    let spec = &resource.spec;
    if !spec.provider.is_empty() && spec.provider != "aws" {
        errors.push(ValidationError::UnsupportedProvider {
            provider: spec.provider.clone(),
        });
    }
    if spec.instance_type.is_empty() {
        errors.push(ValidationError::MissingField {
            field: "spec.instanceType",
        });
    }
    if spec.region.is_empty() {
        errors.push(ValidationError::MissingField {
            field: "spec.region",
        });
    }
}

fn check_master_count(resource: &ClusterResource, errors: &mut Vec<ValidationError>) {
    if let Some(count) = resource.spec.master_count {
        if count != resource.spec.mode.master_count() {
            errors.push(ValidationError::MasterCountMismatch {
                mode: resource.spec.mode.as_str().to_string(),
                master_count: count,
            });
        }
    }
}

fn check_cidrs(resource: &ClusterResource, errors: &mut Vec<ValidationError>) {
    let network = &resource.spec.network;
    for (field, value) in [
        ("spec.network.clusterCidr", &network.cluster_cidr),
        ("spec.network.serviceCidr", &network.service_cidr),
    ] {
        if !value.is_empty() && !valid_cidr(value) {
            errors.push(ValidationError::InvalidCidr {
                field,
                value: value.clone(),
            });
        }
    }
}

fn check_node_pools(resource: &ClusterResource, errors: &mut Vec<ValidationError>) {
    let mut seen: HashSet<&str> = HashSet::new();
    for pool in &resource.spec.node_pools {
        if pool.name.is_empty() || !NAME_REGEX.is_match(&pool.name) || pool.name == "master" {
            errors.push(ValidationError::InvalidName {
                name: pool.name.clone(),
            });
            continue;
        }
        if !seen.insert(pool.name.as_str()) {
            errors.push(ValidationError::DuplicateNodePool {
                name: pool.name.clone(),
            });
        }
    }
}

/// Mode and master count never change once the first status was written
fn check_immutable_fields(resource: &ClusterResource, errors: &mut Vec<ValidationError>) {
    if let Some(applied) = resource.status.mode {
        if applied != resource.spec.mode {
            errors.push(ValidationError::ImmutableFieldChanged {
                field: "spec.mode",
                from: applied.as_str().to_string(),
                to: resource.spec.mode.as_str().to_string(),
            });
        }
    }
    if let Some(applied) = resource.status.master_count {
        if applied != resource.spec.expected_masters() {
            errors.push(ValidationError::ImmutableFieldChanged {
                field: "spec.masterCount",
                from: applied.to_string(),
                to: resource.spec.expected_masters().to_string(),
            });
        }
    }
}

fn valid_cidr(value: &str) -> bool {
    let Some(caps) = CIDR_REGEX.captures(value) else {
        return false;
    };
    for i in 1..=4 {
        let octet: u32 = caps[i].parse().unwrap_or(256);
        if octet > 255 {
            return false;
        }
    }
    let prefix: u32 = caps[5].parse().unwrap_or(33);
    prefix <= 32
}
