//! CF-000: Error types shared by the compiler, placement and orchestration layers.

use crate::provider::ApiError;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure clusterforge can surface.
///
/// Variants carry the resource, stack, output, zone or instance type that
/// caused them so a message is actionable without a debug re-run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // -- build-time contract errors --
    /// A logical name was added twice to one template
    #[error("resource {name:?} already exists in this template")]
    DuplicateResource { name: String },

    /// A Ref/GetAtt/Sub/DependsOn target that no resource in the template defines
    #[error("resource {resource:?} references unknown resource {target:?}")]
    UnknownReference { resource: String, target: String },

    /// DependsOn edges form a cycle
    #[error("dependency cycle detected involving: {}", .names.join(", "))]
    DependencyCycle { names: Vec<String> },

    /// Output declared twice
    #[error("output {name:?} already defined")]
    DuplicateOutput { name: String },

    /// Configuration is structurally invalid
    #[error("invalid cluster config: {0}")]
    InvalidConfig(String),

    /// A selected feature needs a field the config does not set
    #[error("{field} must be set when {feature}")]
    MissingField { field: String, feature: String },

    /// CIDR parse or partition error
    #[error("cidr error: {0}")]
    Cidr(String),

    // -- placement errors --
    /// Explicit subnet belongs to another VPC
    #[error("subnet with ID {subnet:?} is not in the attached VPC with ID {vpc:?}")]
    SubnetNotInVpc { subnet: String, vpc: String },

    /// No subnet could be found for the requested zones
    #[error("could not find {network} subnets for zones {zones:?} of node pool {pool:?}: {reason}")]
    NoSubnetsForZones {
        pool: String,
        network: String,
        zones: Vec<String>,
        reason: String,
    },

    /// A zone does not offer every requested instance type
    #[error("cannot create node pool {pool} in availability zone {zone} as it does not support all required instance types ({})", .instance_types.join(", "))]
    ZoneLacksInstanceType {
        pool: String,
        zone: String,
        instance_types: Vec<String>,
    },

    /// Managed pools cannot run in local zones
    #[error("managed node pools cannot be launched in local zones: pool {pool:?}, zone {zone:?}")]
    LocalZoneWithManagedPool { pool: String, zone: String },

    /// Subnet and control plane/pool Outposts placement disagree
    #[error("subnet {subnet:?} {reason}")]
    OutpostMismatch { subnet: String, reason: String },

    /// A private subnet was requested by a public pool
    #[error("subnet {subnet} is specified as private in the cluster config, thus must only be used when `privateNetworking` is enabled")]
    PrivateSubnetMisuse { subnet: String },

    /// Instance type cannot be used for the requested feature
    #[error("instance type {instance_type} {reason}")]
    UnsupportedInstance {
        instance_type: String,
        reason: String,
    },

    // -- remote API errors --
    /// Error returned by the provisioning API
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A stack reached a failure status
    #[error("stack {stack:?} reached status {status}: {reason}")]
    StackFailed {
        stack: String,
        status: String,
        reason: String,
    },

    /// Stack does not exist
    #[error("stack {stack:?} not found")]
    StackNotFound { stack: String },

    /// Stack exists but does not carry this cluster's ownership tags
    #[error("cannot delete stack {stack:?} as it doesn't bear the {tag:?} tag")]
    ForeignStack { stack: String, tag: String },

    /// The retry policy gave up
    #[error("{operation}: gave up after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    // -- cancellation --
    /// An external cancellation signal stopped the operation
    #[error("{operation}: cancelled")]
    Cancelled { operation: String },

    /// The deadline passed before the operation finished
    #[error("{operation}: timed out after {after:?}")]
    DeadlineExceeded { operation: String, after: Duration },

    // -- output collection --
    /// A required output was absent from the live stack
    #[error("stack {stack:?} has no output {output:?}")]
    MissingOutput { stack: String, output: String },

    /// A collector rejected the value it was given
    #[error("collecting output {output:?}: {message}")]
    Collect { output: String, message: String },

    // -- orchestration --
    /// A spawned task panicked
    #[error("task {task:?} panicked")]
    TaskPanicked { task: String },

    /// Aggregated errors from a task tree
    #[error("{} task(s) failed: {}", .0.len(), join_errors(.0))]
    Tasks(Vec<Error>),

    /// A wrapped error with the step it happened in
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    // -- wrappers --
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create an invalid-config error with the given message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a CIDR error with the given message
    pub fn cidr(msg: impl Into<String>) -> Self {
        Self::Cidr(msg.into())
    }

    /// Create a missing-field error
    pub fn missing_field(field: impl Into<String>, feature: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
            feature: feature.into(),
        }
    }

    /// Create a collector error for an output
    pub fn collect(output: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collect {
            output: output.into(),
            message: message.into(),
        }
    }

    /// Wrap this error with the step it happened in.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether retrying the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api(e) => e.transient,
            Self::Context { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether this error came from cancellation or a deadline rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled { .. } | Self::DeadlineExceeded { .. } => true,
            Self::Context { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}
