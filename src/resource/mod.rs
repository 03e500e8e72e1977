mod codec;
mod pending;
mod progress;
mod types;
mod validate;

pub use codec::{
    cluster_prefix, config_key, kubeconfig_key, status_key, token_key, CodecError,
    LoadedResource, ResourceCodec,
};
pub use pending::{
    command_key, ArchivedOperation, BackgroundProcess, PendingCommand, PendingOperations,
};
pub use progress::{
    Check, ProgressMetrics, Step, StepStatus, STEP_CONFIGURING, STEP_INSTALLING,
    STEP_PROVISIONING,
};
pub use types::{
    ClusterPhase, ClusterResource, ClusterSpec, ClusterStatus, ConfigDoc, DesiredState,
    ExpectedInstance, Instance, InstanceRole, Metadata, Mode, NetworkSpec, NodePool, Spill,
    StatusDoc, VmState,
};
pub use validate::{describe as describe_validation_errors, validate, ValidationError};
