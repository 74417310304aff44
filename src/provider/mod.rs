//! CF-012: Provisioning API capability interfaces.
//!
//! The orchestration code only talks to the remote API through these
//! traits. `memory::MemoryProvider` implements both for tests and
//! `--simulate` runs.

pub mod memory;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Error returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
    /// Throttling or eventual-consistency lag; safe to retry
    pub transient: bool,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            transient,
        }
    }

    pub fn throttling(message: impl Into<String>) -> Self {
        Self::new("Throttling", message, true)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("ValidationError", message, false)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NotFound", message, false)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new("AlreadyExistsException", message, false)
    }

    /// Update rejected because the template did not change.
    pub fn is_no_op_update(&self) -> bool {
        self.code == "ValidationError" && self.message.contains("No updates are to be performed")
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Lifecycle status reported for a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    DeleteInProgress,
    DeleteComplete,
    DeleteFailed,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateRollbackInProgress,
    UpdateRollbackComplete,
    UpdateRollbackFailed,
}

impl StackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::CreateFailed => "CREATE_FAILED",
            Self::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            Self::RollbackComplete => "ROLLBACK_COMPLETE",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            Self::UpdateComplete => "UPDATE_COMPLETE",
            Self::UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            Self::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
            Self::UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
        }
    }

    /// No further transition will happen without a new request.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Self::CreateInProgress
                | Self::RollbackInProgress
                | Self::DeleteInProgress
                | Self::UpdateInProgress
                | Self::UpdateCompleteCleanupInProgress
                | Self::UpdateRollbackInProgress
        )
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StackStatus {
    type Err = ApiError;

    fn from_str(s: &str) -> ApiResult<Self> {
        let all = [
            Self::CreateInProgress,
            Self::CreateComplete,
            Self::CreateFailed,
            Self::RollbackInProgress,
            Self::RollbackComplete,
            Self::RollbackFailed,
            Self::DeleteInProgress,
            Self::DeleteComplete,
            Self::DeleteFailed,
            Self::UpdateInProgress,
            Self::UpdateCompleteCleanupInProgress,
            Self::UpdateComplete,
            Self::UpdateRollbackInProgress,
            Self::UpdateRollbackComplete,
            Self::UpdateRollbackFailed,
        ];
        all.into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| ApiError::validation(format!("unknown stack status {:?}", s)))
    }
}

/// A live stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Stack {
    pub name: String,
    pub id: String,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    pub outputs: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

/// One entry of a stack's event history.
#[derive(Debug, Clone, PartialEq)]
pub struct StackEvent {
    pub logical_id: String,
    pub resource_type: String,
    pub status: String,
    pub reason: Option<String>,
}

/// Create or update request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackRequest {
    pub name: String,
    pub template: Vec<u8>,
    pub tags: BTreeMap<String, String>,
    pub capabilities: Vec<String>,
    pub role_arn: Option<String>,
    pub disable_rollback: bool,
}

/// Stack CRUD and polling.
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Start creating a stack; returns its ID.
    async fn create_stack(&self, request: &StackRequest) -> ApiResult<String>;

    async fn update_stack(&self, request: &StackRequest) -> ApiResult<()>;

    async fn delete_stack(&self, name: &str) -> ApiResult<()>;

    /// `None` when the stack does not exist (or finished deleting).
    async fn describe_stack(&self, name: &str) -> ApiResult<Option<Stack>>;

    /// Stacks whose name starts with `prefix`.
    async fn list_stacks(&self, prefix: &str) -> ApiResult<Vec<Stack>>;

    async fn describe_stack_events(&self, name: &str) -> ApiResult<Vec<StackEvent>>;
}

/// A subnet as described by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub vpc_id: String,
    pub availability_zone: String,
    pub outpost_arn: Option<String>,
    pub cidr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneType {
    AvailabilityZone,
    LocalZone,
    WavelengthZone,
}

/// Capabilities of one instance type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTypeInfo {
    pub instance_type: String,
    pub max_network_cards: u32,
    pub efa_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Interface,
    Gateway,
}

/// A VPC endpoint service offering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointService {
    pub service_name: String,
    pub endpoint_type: EndpointType,
    pub availability_zones: Vec<String>,
}

/// Fetched contents of an existing launch template version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchTemplateData {
    pub instance_type: Option<String>,
    pub image_id: Option<String>,
    pub user_data: Option<String>,
    pub key_name: Option<String>,
    pub security_group_ids: Vec<String>,
    pub iam_instance_profile: Option<String>,
    pub ebs_optimized: Option<bool>,
    /// Resource type → tags
    pub tag_specifications: BTreeMap<String, BTreeMap<String, String>>,
}

/// Read-only network and compute metadata.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn describe_subnets(&self, ids: &[String]) -> ApiResult<Vec<Subnet>>;

    /// Zone name → zone type for a region.
    async fn zone_types(&self, region: &str) -> ApiResult<BTreeMap<String, ZoneType>>;

    /// Zone → instance types offered there, limited to the ones asked for.
    async fn instance_type_offerings(
        &self,
        instance_types: &[String],
        zones: &[String],
    ) -> ApiResult<BTreeMap<String, BTreeSet<String>>>;

    async fn instance_types(&self, instance_types: &[String]) -> ApiResult<Vec<InstanceTypeInfo>>;

    async fn endpoint_services(&self, service_names: &[String]) -> ApiResult<Vec<EndpointService>>;

    async fn launch_template(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> ApiResult<LaunchTemplateData>;

    /// Subnet ID → route table ID of its association.
    async fn route_tables(&self, subnet_ids: &[String]) -> ApiResult<BTreeMap<String, String>>;
}
