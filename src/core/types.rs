//! CF-001: Cluster configuration schema.
//!
//! Defines the YAML schema for a cluster: metadata, VPC topology, IAM
//! options, node pools and access entries. All types derive
//! Serialize/Deserialize for YAML roundtripping and JsonSchema for `schema`.
//! `status` and the IAM ARNs of node pools are written back by output
//! collectors once stacks are live.

use super::cidr::Ipv4Cidr;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Top-level cluster.yaml
// ============================================================================

/// Root configuration: the desired cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Name, region, version and shared tags
    pub metadata: ClusterMeta,

    /// Control-plane and OIDC IAM options
    #[serde(default)]
    pub iam: ClusterIam,

    /// Network topology
    #[serde(default)]
    pub vpc: ClusterVpc,

    /// IP family of pods and services
    #[serde(default)]
    pub kubernetes_network_config: KubernetesNetworkConfig,

    /// Availability zones used for subnets (defaulted when empty)
    #[serde(default)]
    pub availability_zones: Vec<String>,

    /// Local zones that get their own subnets
    #[serde(default)]
    pub local_zones: Vec<String>,

    /// Fully-private cluster settings
    #[serde(default)]
    pub private_cluster: PrivateCluster,

    /// Control plane on Outposts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outpost: Option<Outpost>,

    /// Control-plane logging
    #[serde(default)]
    pub cloud_watch: CloudWatch,

    /// Unmanaged (self-managed auto-scaling) node pools
    #[serde(default)]
    pub node_groups: Vec<NodeGroup>,

    /// Managed node pools
    #[serde(default)]
    pub managed_node_groups: Vec<ManagedNodeGroup>,

    /// Access entries for cluster principals
    #[serde(default)]
    pub access_entries: Vec<AccessEntry>,

    /// Live values collected from the cluster stack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

/// Cluster identity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMeta {
    /// Cluster name
    pub name: String,

    /// Region the cluster lives in
    pub region: String,

    /// Kubernetes version
    #[serde(default = "default_version")]
    pub version: String,

    /// Tags applied to every stack
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_version() -> String {
    "1.31".to_string()
}

/// Control-plane IAM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIam {
    /// Pre-existing control-plane service role
    #[serde(default, rename = "serviceRoleARN")]
    pub service_role_arn: Option<String>,

    /// Permissions boundary for the created service role
    #[serde(default)]
    pub service_role_permissions_boundary: Option<String>,

    /// Whether an OIDC provider is used (CNI policy moves to IRSA)
    #[serde(default)]
    pub with_oidc: bool,
}

// ============================================================================
// Networking
// ============================================================================

/// VPC settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVpc {
    /// Existing VPC ID (no network resources are created)
    #[serde(default)]
    pub id: Option<String>,

    /// VPC IPv4 block
    #[serde(default)]
    pub cidr: Option<Ipv4Cidr>,

    /// Auto-allocate an IPv6 block for an IPv4 cluster
    #[serde(default)]
    pub auto_allocate_ipv6: bool,

    /// BYO IPv6 pool (IPv6 clusters)
    #[serde(default)]
    pub ipv6_pool: Option<String>,

    /// BYO IPv6 block (IPv6 clusters)
    #[serde(default)]
    pub ipv6_cidr: Option<String>,

    /// NAT gateway mode
    #[serde(default)]
    pub nat: Nat,

    /// Subnets in availability zones
    #[serde(default)]
    pub subnets: ClusterSubnets,

    /// Subnets in local zones
    #[serde(default)]
    pub local_zone_subnets: ClusterSubnets,

    /// Existing control-plane security group
    #[serde(default)]
    pub security_group: Option<String>,

    /// Extra control-plane security groups
    #[serde(default)]
    pub control_plane_security_group_ids: Vec<String>,

    /// Existing shared node security group
    #[serde(default)]
    pub shared_node_security_group: Option<String>,

    /// Add rules between the shared and the default cluster security group
    #[serde(default = "default_true")]
    pub manage_shared_node_security_group_rules: bool,

    /// Extra CIDRs allowed to reach the API endpoint over 443
    #[serde(default)]
    pub extra_cidrs: Vec<String>,

    /// Extra IPv6 CIDRs allowed to reach the API endpoint over 443
    #[serde(default)]
    pub extra_ipv6_cidrs: Vec<String>,

    /// Endpoint access
    #[serde(default)]
    pub cluster_endpoints: ClusterEndpoints,

    /// CIDRs allowed to reach the public endpoint
    #[serde(default)]
    pub public_access_cidrs: Vec<String>,
}

impl Default for ClusterVpc {
    fn default() -> Self {
        Self {
            id: None,
            cidr: None,
            auto_allocate_ipv6: false,
            ipv6_pool: None,
            ipv6_cidr: None,
            nat: Nat::default(),
            subnets: ClusterSubnets::default(),
            local_zone_subnets: ClusterSubnets::default(),
            security_group: None,
            control_plane_security_group_ids: Vec::new(),
            shared_node_security_group: None,
            manage_shared_node_security_group_rules: true,
            extra_cidrs: Vec::new(),
            extra_ipv6_cidrs: Vec::new(),
            cluster_endpoints: ClusterEndpoints::default(),
            public_access_cidrs: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// NAT gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Nat {
    #[serde(default)]
    pub gateway: NatMode,
}

/// NAT gateway mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub enum NatMode {
    /// One NAT gateway per availability zone
    HighlyAvailable,
    /// One NAT gateway shared by every zone
    #[default]
    Single,
    /// No NAT gateway
    Disable,
}

impl TryFrom<String> for NatMode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "HighlyAvailable" => Ok(Self::HighlyAvailable),
            "Single" => Ok(Self::Single),
            "Disable" => Ok(Self::Disable),
            _ => Err(format!("{} is not a valid NAT gateway mode", s)),
        }
    }
}

impl From<NatMode> for String {
    fn from(mode: NatMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for NatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighlyAvailable => write!(f, "HighlyAvailable"),
            Self::Single => write!(f, "Single"),
            Self::Disable => write!(f, "Disable"),
        }
    }
}

/// Public and private subnet mappings, keyed by alias (order-preserving).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSubnets {
    #[serde(default)]
    pub private: IndexMap<String, SubnetSpec>,

    #[serde(default)]
    pub public: IndexMap<String, SubnetSpec>,
}

impl ClusterSubnets {
    pub fn is_empty(&self) -> bool {
        self.private.is_empty() && self.public.is_empty()
    }

    /// Mapping for one topology.
    pub fn for_topology(&self, topology: SubnetTopology) -> &IndexMap<String, SubnetSpec> {
        match topology {
            SubnetTopology::Private => &self.private,
            SubnetTopology::Public => &self.public,
        }
    }
}

/// One subnet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Subnet ID (set for existing subnets or after collection)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Availability or local zone; defaults to the alias
    #[serde(default)]
    pub az: String,

    /// IPv4 block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<Ipv4Cidr>,

    /// Index into the VPC partition scheme
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_index: Option<u32>,

    /// Outpost the subnet lives on
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "outpostARN")]
    pub outpost_arn: Option<String>,
}

/// Subnet topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubnetTopology {
    Private,
    Public,
}

impl fmt::Display for SubnetTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "Private"),
            Self::Public => write!(f, "Public"),
        }
    }
}

/// API endpoint access.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEndpoints {
    #[serde(default = "default_true")]
    pub public_access: bool,

    #[serde(default)]
    pub private_access: bool,
}

impl Default for ClusterEndpoints {
    fn default() -> Self {
        Self {
            public_access: true,
            private_access: false,
        }
    }
}

/// Pod/service IP family.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesNetworkConfig {
    #[serde(default)]
    pub ip_family: IpFamily,

    #[serde(default)]
    pub service_ipv4_cidr: Option<String>,
}

/// IP family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum IpFamily {
    #[default]
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Fully-private cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrivateCluster {
    #[serde(default)]
    pub enabled: bool,

    /// Endpoints are managed outside the cluster stack
    #[serde(default)]
    pub skip_endpoint_creation: bool,

    /// Extra endpoint services (cloudformation, autoscaling, logs)
    #[serde(default)]
    pub additional_endpoint_services: Vec<String>,
}

/// Control plane on Outposts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Outpost {
    #[serde(rename = "controlPlaneOutpostARN")]
    pub control_plane_outpost_arn: String,

    #[serde(default)]
    pub control_plane_instance_type: Option<String>,
}

/// Control-plane log types.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudWatch {
    #[serde(default)]
    pub cluster_logging: ClusterLogging,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterLogging {
    #[serde(default)]
    pub enable_types: Vec<String>,
}

/// Values collected back from the cluster stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// PEM bundle, base64-decoded from the stack output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_security_group_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
}

// ============================================================================
// Node pools
// ============================================================================

/// Fields shared by managed and unmanaged pools.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupBase {
    /// Pool name, unique within the cluster
    pub name: String,

    /// Image family (AmazonLinux2023, AmazonLinux2, Bottlerocket, Windows*, Ubuntu*)
    #[serde(default = "default_ami_family")]
    pub ami_family: String,

    /// Custom image ID
    #[serde(default)]
    pub ami: Option<String>,

    /// Single instance type
    #[serde(default)]
    pub instance_type: Option<String>,

    #[serde(default)]
    pub availability_zones: Vec<String>,

    #[serde(default)]
    pub local_zones: Vec<String>,

    /// Subnet aliases or IDs
    #[serde(default)]
    pub subnets: Vec<String>,

    #[serde(default)]
    pub private_networking: bool,

    /// Elastic Fabric Adapter networking
    #[serde(default)]
    pub efa_enabled: bool,

    #[serde(default)]
    pub desired_capacity: Option<u32>,

    #[serde(default)]
    pub min_size: Option<u32>,

    #[serde(default)]
    pub max_size: Option<u32>,

    /// Root volume size in GiB
    #[serde(default)]
    pub volume_size: Option<u32>,

    #[serde(default)]
    pub volume_type: Option<VolumeType>,

    #[serde(default)]
    pub volume_iops: Option<u32>,

    #[serde(default)]
    pub volume_throughput: Option<u32>,

    #[serde(default)]
    pub volume_encrypted: Option<bool>,

    #[serde(default)]
    pub volume_kms_key_id: Option<String>,

    #[serde(default)]
    pub volume_name: Option<String>,

    #[serde(default)]
    pub ebs_optimized: Option<bool>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub ssh: Ssh,

    #[serde(default)]
    pub iam: NodeGroupIam,

    #[serde(default)]
    pub security_groups: NodeGroupSecurityGroups,

    #[serde(default, rename = "disableIMDSv1")]
    pub disable_imdsv1: bool,

    #[serde(default)]
    pub disable_pod_imds: bool,

    #[serde(default)]
    pub placement: Option<Placement>,

    #[serde(default, rename = "outpostARN")]
    pub outpost_arn: Option<String>,

    #[serde(default)]
    pub capacity_reservation: Option<CapacityReservation>,

    /// Commands run before the node joins
    #[serde(default)]
    pub pre_bootstrap_commands: Vec<String>,
}

fn default_ami_family() -> String {
    AMI_FAMILY_AL2023.to_string()
}

/// Amazon Linux 2023 image family.
pub const AMI_FAMILY_AL2023: &str = "AmazonLinux2023";
/// Amazon Linux 2 image family.
pub const AMI_FAMILY_AL2: &str = "AmazonLinux2";
/// Bottlerocket image family.
pub const AMI_FAMILY_BOTTLEROCKET: &str = "Bottlerocket";

/// EBS volume type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Gp2,
    Gp3,
    Io1,
    Io2,
    Sc1,
    St1,
}

impl VolumeType {
    /// Whether provisioned IOPS may be set.
    pub fn supports_iops(self) -> bool {
        matches!(self, Self::Gp3 | Self::Io1 | Self::Io2)
    }

    /// Whether provisioned throughput may be set.
    pub fn supports_throughput(self) -> bool {
        matches!(self, Self::Gp3)
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gp2 => write!(f, "gp2"),
            Self::Gp3 => write!(f, "gp3"),
            Self::Io1 => write!(f, "io1"),
            Self::Io2 => write!(f, "io2"),
            Self::Sc1 => write!(f, "sc1"),
            Self::St1 => write!(f, "st1"),
        }
    }
}

/// SSH access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ssh {
    #[serde(default)]
    pub allow: bool,

    #[serde(default)]
    pub public_key_name: Option<String>,

    #[serde(default)]
    pub source_security_group_ids: Vec<String>,
}

/// Node IAM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupIam {
    #[serde(default, rename = "attachPolicyARNs")]
    pub attach_policy_arns: Vec<String>,

    /// Inline policy document
    #[serde(default)]
    pub attach_policy: Option<serde_json::Value>,

    /// Existing instance profile (no IAM resources are created)
    #[serde(default, rename = "instanceProfileARN")]
    pub instance_profile_arn: Option<String>,

    /// Existing role (only the profile is created)
    #[serde(default, rename = "instanceRoleARN")]
    pub instance_role_arn: Option<String>,

    #[serde(default)]
    pub instance_role_name: Option<String>,

    #[serde(default)]
    pub instance_role_permissions_boundary: Option<String>,

    #[serde(default)]
    pub with_addon_policies: AddonPolicies,
}

/// Optional add-on permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonPolicies {
    #[serde(default)]
    pub image_builder: bool,
    #[serde(default)]
    pub auto_scaler: bool,
    #[serde(default, rename = "externalDNS")]
    pub external_dns: bool,
    #[serde(default)]
    pub cert_manager: bool,
    #[serde(default)]
    pub app_mesh: bool,
    #[serde(default)]
    pub app_mesh_preview: bool,
    #[serde(default)]
    pub ebs: bool,
    #[serde(default)]
    pub fsx: bool,
    #[serde(default)]
    pub efs: bool,
    #[serde(default, rename = "awsLoadBalancerController")]
    pub aws_load_balancer_controller: bool,
    #[serde(default)]
    pub xray: bool,
    #[serde(default)]
    pub cloud_watch: bool,
}

/// Security groups attached to nodes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSecurityGroups {
    #[serde(default)]
    pub attach_ids: Vec<String>,

    /// Attach the cluster's shared node security group
    #[serde(default = "default_true")]
    pub with_shared: bool,

    /// Create a pool-local security group
    #[serde(default = "default_true")]
    pub with_local: bool,
}

impl Default for NodeGroupSecurityGroups {
    fn default() -> Self {
        Self {
            attach_ids: Vec::new(),
            with_shared: true,
            with_local: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub group_name: String,
}

/// Capacity reservation targeting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReservation {
    /// "open" or "none"
    #[serde(default)]
    pub preference: Option<String>,

    #[serde(default)]
    pub target: Option<CapacityReservationTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReservationTarget {
    #[serde(default, rename = "capacityReservationID")]
    pub capacity_reservation_id: Option<String>,

    #[serde(default, rename = "capacityReservationResourceGroupARN")]
    pub capacity_reservation_resource_group_arn: Option<String>,
}

/// Unmanaged pool backed by an auto-scaling group.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroup {
    #[serde(flatten)]
    pub base: NodeGroupBase,

    /// Mixed instances (spot/on-demand)
    #[serde(default)]
    pub instances_distribution: Option<InstancesDistribution>,

    /// Tag the auto-scaling group for cluster-autoscaler discovery
    #[serde(default)]
    pub autoscaler_tags: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstancesDistribution {
    #[serde(default)]
    pub instance_types: Vec<String>,

    #[serde(default)]
    pub max_price: Option<f64>,

    #[serde(default)]
    pub on_demand_base_capacity: Option<u32>,

    #[serde(default)]
    pub on_demand_percentage_above_base_capacity: Option<u32>,

    #[serde(default)]
    pub spot_instance_pools: Option<u32>,

    #[serde(default)]
    pub spot_allocation_strategy: Option<String>,

    #[serde(default)]
    pub capacity_rebalance: bool,
}

/// Managed pool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedNodeGroup {
    #[serde(flatten)]
    pub base: NodeGroupBase,

    #[serde(default)]
    pub instance_types: Vec<String>,

    #[serde(default)]
    pub spot: bool,

    #[serde(default)]
    pub release_version: Option<String>,

    #[serde(default)]
    pub taints: Vec<Taint>,

    #[serde(default)]
    pub update_config: Option<UpdateConfig>,

    /// External launch template to merge with
    #[serde(default)]
    pub launch_template: Option<LaunchTemplateRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfig {
    #[serde(default)]
    pub max_unavailable: Option<u32>,
    #[serde(default)]
    pub max_unavailable_percentage: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplateRef {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// A node pool of either kind, as seen by placement and security-group code.
#[derive(Debug, Clone, Copy)]
pub enum NodePool<'a> {
    Unmanaged(&'a NodeGroup),
    Managed(&'a ManagedNodeGroup),
}

impl<'a> NodePool<'a> {
    pub fn base(&self) -> &'a NodeGroupBase {
        match self {
            Self::Unmanaged(ng) => &ng.base,
            Self::Managed(ng) => &ng.base,
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Managed(_))
    }

    pub fn name(&self) -> &'a str {
        &self.base().name
    }

    /// Every instance type the pool may launch.
    pub fn instance_types(&self) -> Vec<String> {
        match self {
            Self::Unmanaged(ng) => match &ng.instances_distribution {
                Some(dist) if !dist.instance_types.is_empty() => dist.instance_types.clone(),
                _ => ng.base.instance_type.iter().cloned().collect(),
            },
            Self::Managed(ng) => {
                if ng.instance_types.is_empty() {
                    ng.base.instance_type.iter().cloned().collect()
                } else {
                    ng.instance_types.clone()
                }
            }
        }
    }
}

// ============================================================================
// Access entries
// ============================================================================

/// Grants a principal access to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntry {
    #[serde(rename = "principalARN")]
    pub principal_arn: String,

    #[serde(default)]
    pub kubernetes_groups: Vec<String>,

    #[serde(default)]
    pub kubernetes_username: Option<String>,

    /// STANDARD, EC2_LINUX, EC2_WINDOWS, FARGATE_LINUX
    #[serde(default, rename = "type")]
    pub entry_type: Option<String>,

    #[serde(default)]
    pub access_policies: Vec<AccessPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    #[serde(rename = "policyARN")]
    pub policy_arn: String,
    pub access_scope: AccessScope,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessScope {
    /// "cluster" or "namespace"
    #[serde(rename = "type")]
    pub scope_type: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

// ============================================================================
// Helpers
// ============================================================================

impl ClusterConfig {
    pub fn is_fully_private(&self) -> bool {
        self.private_cluster.enabled
    }

    pub fn is_control_plane_on_outposts(&self) -> bool {
        self.outpost.is_some()
    }

    pub fn ip_family(&self) -> IpFamily {
        self.kubernetes_network_config.ip_family
    }

    pub fn has_cluster_cloudwatch_logging(&self) -> bool {
        !self.cloud_watch.cluster_logging.enable_types.is_empty()
    }

    /// Whether another tool owns the VPC.
    pub fn uses_existing_vpc(&self) -> bool {
        self.vpc.id.is_some() && !self.vpc.subnets.is_empty()
            && self
                .vpc
                .subnets
                .private
                .values()
                .chain(self.vpc.subnets.public.values())
                .all(|s| s.id.is_some())
    }

    pub fn node_pools(&self) -> impl Iterator<Item = NodePool<'_>> {
        self.node_groups
            .iter()
            .map(NodePool::Unmanaged)
            .chain(self.managed_node_groups.iter().map(NodePool::Managed))
    }

    pub fn node_group_mut(&mut self, name: &str) -> Option<&mut NodeGroup> {
        self.node_groups.iter_mut().find(|ng| ng.base.name == name)
    }

    pub fn managed_node_group_mut(&mut self, name: &str) -> Option<&mut ManagedNodeGroup> {
        self.managed_node_groups
            .iter_mut()
            .find(|ng| ng.base.name == name)
    }

    /// Base of the pool with `name`, of either kind.
    pub fn node_pool_base_mut(&mut self, name: &str) -> Option<&mut NodeGroupBase> {
        if self.node_groups.iter().any(|ng| ng.base.name == name) {
            return self.node_group_mut(name).map(|ng| &mut ng.base);
        }
        self.managed_node_group_mut(name).map(|ng| &mut ng.base)
    }

    pub fn status_mut(&mut self) -> &mut ClusterStatus {
        self.status.get_or_insert_with(ClusterStatus::default)
    }
}
