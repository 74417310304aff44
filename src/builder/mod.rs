//! CF-018: Template builders.
//!
//! Each builder adds one concern's resources to a `ResourceSet` and returns
//! the `Value` references later builders need. Builders never look at each
//! other's resources except through those references.

pub mod access_entry;
pub mod cluster;
pub mod iam;
pub mod launch_template;
pub mod managed_nodegroup;
pub mod nodegroup;
pub mod security_group;
pub mod statement;
pub mod vpc;
pub mod vpc_endpoint;
pub mod vpc_existing;
pub mod vpc_ipv6;

use crate::core::intrinsic::{Value, PARTITION};
use crate::core::template::ResourceSet;
use crate::core::types::{ClusterConfig, SubnetSpec};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// Suffix on every template description.
pub const TEMPLATE_DESCRIPTION_SUFFIX: &str = "[created by clusterforge]";

// Logical names shared between builders
pub const VPC_RESOURCE: &str = "VPC";
pub const CONTROL_PLANE_SG_RESOURCE: &str = "ControlPlaneSecurityGroup";
pub const SHARED_NODE_SG_RESOURCE: &str = "ClusterSharedNodeSecurityGroup";
pub const INGRESS_CLUSTER_TO_NODE_SG_RESOURCE: &str = "IngressDefaultClusterToNodeSG";
pub const CONTROL_PLANE_RESOURCE: &str = "ControlPlane";
pub const SERVICE_ROLE_RESOURCE: &str = "ServiceRole";

// Output names read back by collectors or imported by other stacks
pub mod outputs {
    pub const CLUSTER_VPC: &str = "VPC";
    pub const CLUSTER_SECURITY_GROUP: &str = "SecurityGroup";
    pub const CLUSTER_SHARED_NODE_SECURITY_GROUP: &str = "SharedNodeSecurityGroup";
    pub const CLUSTER_DEFAULT_SECURITY_GROUP: &str = "ClusterSecurityGroupId";
    pub const CLUSTER_SUBNETS_PRIVATE: &str = "SubnetsPrivate";
    pub const CLUSTER_SUBNETS_PUBLIC: &str = "SubnetsPublic";
    pub const CLUSTER_SUBNETS_LOCAL_ZONE_PRIVATE: &str = "SubnetsLocalZonePrivate";
    pub const CLUSTER_SUBNETS_LOCAL_ZONE_PUBLIC: &str = "SubnetsLocalZonePublic";
    pub const CLUSTER_FEATURE_NAT_MODE: &str = "FeatureNATMode";
    pub const CLUSTER_FULLY_PRIVATE: &str = "ClusterFullyPrivate";
    pub const CLUSTER_ENDPOINT: &str = "Endpoint";
    pub const CLUSTER_ARN: &str = "ARN";
    pub const CLUSTER_CERTIFICATE_AUTHORITY_DATA: &str = "CertificateAuthorityData";
    pub const CLUSTER_STACK_NAME: &str = "ClusterStackName";
    pub const CLUSTER_SERVICE_ROLE_ARN: &str = "ServiceRoleARN";
    pub const NODE_GROUP_INSTANCE_ROLE_ARN: &str = "InstanceRoleARN";
    pub const NODE_GROUP_INSTANCE_PROFILE_ARN: &str = "InstanceProfileARN";
    pub const NODE_GROUP_FEATURE_PRIVATE_NETWORKING: &str = "FeaturePrivateNetworking";
    pub const NODE_GROUP_FEATURE_SHARED_SECURITY_GROUP: &str = "FeatureSharedSecurityGroup";
    pub const NODE_GROUP_FEATURE_LOCAL_SECURITY_GROUP: &str = "FeatureLocalSecurityGroup";
}

// Security group rule constants
pub const SG_PROTO_TCP: &str = "tcp";
pub const SG_PROTO_ALL: &str = "-1";
pub const SG_SOURCE_ANYWHERE_IPV4: &str = "0.0.0.0/0";
pub const SG_SOURCE_ANYWHERE_IPV6: &str = "::/0";
pub const SG_PORT_ZERO: i64 = 0;
pub const SG_MIN_NODE_PORT: i64 = 1025;
pub const SG_MAX_NODE_PORT: i64 = 65535;
pub const SG_PORT_HTTPS: i64 = 443;
pub const SG_PORT_SSH: i64 = 22;

pub const INTERNET_CIDR: &str = "0.0.0.0/0";
pub const INTERNET_IPV6_CIDR: &str = "::/0";

const SERVICE_PRINCIPAL_MAP: &str = "ServicePrincipalPartitionMap";

/// Resource-name form of a zone: upper-cased, dashes dropped.
pub fn az_resource_name(zone: &str) -> String {
    zone.to_uppercase().replace('-', "")
}

/// `${AWS::StackName}-<suffix>`.
pub fn make_name(suffix: &str) -> Value {
    Value::sub(format!("${{AWS::StackName}}-{}", suffix))
}

/// ARN of an AWS managed policy in the current partition.
pub fn policy_arn(name: &str) -> Value {
    Value::partition_arn(&format!("iam::aws:policy/{}", name))
}

/// Service principal for `service` (EC2, EKS) looked up per partition.
pub fn service_principal(service: &str) -> Value {
    Value::find_in_map(
        SERVICE_PRINCIPAL_MAP,
        Value::reference(PARTITION),
        Value::string(service),
    )
}

/// Register the partition → service principal mapping `service_principal` reads.
pub fn add_service_principal_mapping(rs: &mut ResourceSet) {
    let partitions = [
        ("aws", "amazonaws.com"),
        ("aws-cn", "amazonaws.com.cn"),
        ("aws-us-gov", "amazonaws.com"),
        ("aws-iso", "c2s.ic.gov"),
        ("aws-iso-b", "sc2s.sgov.gov"),
    ];
    let entries: BTreeMap<String, BTreeMap<String, Value>> = partitions
        .iter()
        .map(|(partition, suffix)| {
            let services = [("EC2", "ec2"), ("EKS", "eks")]
                .iter()
                .map(|(key, host)| (key.to_string(), Value::string(format!("{}.{}", host, suffix))))
                .collect();
            (partition.to_string(), services)
        })
        .collect();
    rs.add_mapping(SERVICE_PRINCIPAL_MAP, entries);
}

/// Trust policy letting `services` assume a role.
pub fn assume_role_policy(services: &[&str], actions: &[&str]) -> Value {
    let principals = Value::list(services.iter().map(|s| service_principal(s)).collect());
    Value::object([
        ("Version", Value::from("2012-10-17")),
        (
            "Statement",
            Value::list(vec![Value::object([
                ("Effect", Value::from("Allow")),
                ("Principal", Value::object([("Service", principals)])),
                ("Action", Value::strings(actions.iter().copied())),
            ])]),
        ),
    ])
}

/// A subnet produced or imported by a network builder.
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetResource {
    pub subnet: Value,
    pub availability_zone: String,
    /// Route table the subnet is associated with, when known
    pub route_table: Option<Value>,
}

/// Subnets of the cluster network, in declared order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubnetDetails {
    pub public: Vec<SubnetResource>,
    pub private: Vec<SubnetResource>,
    pub public_local_zone: Vec<SubnetResource>,
    pub private_local_zone: Vec<SubnetResource>,
    pub control_plane_on_outposts: bool,
}

impl SubnetDetails {
    pub fn public_refs(&self) -> Vec<Value> {
        self.public.iter().map(|s| s.subnet.clone()).collect()
    }

    pub fn private_refs(&self) -> Vec<Value> {
        self.private.iter().map(|s| s.subnet.clone()).collect()
    }

    /// Subnets the control plane is attached to. Outposts control planes use private subnets only.
    pub fn control_plane_subnet_refs(&self) -> Vec<Value> {
        if self.control_plane_on_outposts {
            return self.private_refs();
        }
        let mut refs = self.public_refs();
        refs.extend(self.private_refs());
        refs
    }
}

/// What a network builder hands to the rest of the cluster stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    pub vpc: Value,
    pub subnets: SubnetDetails,
}

/// Cluster-stack exports a node-pool stack imports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterImports {
    pub cluster_stack: String,
}

impl ClusterImports {
    pub fn new(cluster_stack: impl Into<String>) -> Self {
        Self {
            cluster_stack: cluster_stack.into(),
        }
    }

    pub fn vpc(&self) -> Value {
        Value::import_output(&self.cluster_stack, outputs::CLUSTER_VPC)
    }

    pub fn control_plane_security_group(&self) -> Value {
        Value::import_output(&self.cluster_stack, outputs::CLUSTER_SECURITY_GROUP)
    }

    pub fn shared_node_security_group(&self) -> Value {
        Value::import_output(&self.cluster_stack, outputs::CLUSTER_SHARED_NODE_SECURITY_GROUP)
    }

    pub fn default_security_group(&self) -> Value {
        Value::import_output(&self.cluster_stack, outputs::CLUSTER_DEFAULT_SECURITY_GROUP)
    }
}

/// Which subnet mapping a joined subnet output writes back into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetMapping {
    Private,
    Public,
    LocalZonePrivate,
    LocalZonePublic,
}

impl SubnetMapping {
    fn mapping_mut(self, cfg: &mut ClusterConfig) -> &mut IndexMap<String, SubnetSpec> {
        match self {
            Self::Private => &mut cfg.vpc.subnets.private,
            Self::Public => &mut cfg.vpc.subnets.public,
            Self::LocalZonePrivate => &mut cfg.vpc.local_zone_subnets.private,
            Self::LocalZonePublic => &mut cfg.vpc.local_zone_subnets.public,
        }
    }
}

/// Store collected subnet IDs on the mapping, in declared order.
///
/// A mapping with fewer entries than IDs (existing VPCs declared without
/// aliases) gets new entries keyed by ID.
pub fn import_subnet_ids(
    output: &str,
    mapping: SubnetMapping,
    ids: Vec<String>,
    cfg: &mut ClusterConfig,
) -> Result<()> {
    let entries = mapping.mapping_mut(cfg);
    if entries.len() > ids.len() {
        return Err(Error::collect(
            output,
            format!("expected {} subnet IDs, got {}", entries.len(), ids.len()),
        ));
    }
    let mut ids = ids.into_iter();
    for spec in entries.values_mut() {
        spec.id = ids.next();
    }
    for id in ids {
        entries.insert(
            id.clone(),
            SubnetSpec {
                id: Some(id),
                ..SubnetSpec::default()
            },
        );
    }
    Ok(())
}

/// Declare one joined subnet output whose collector writes IDs back.
pub fn define_subnet_output(
    rs: &mut ResourceSet,
    name: &'static str,
    refs: Vec<Value>,
    mapping: SubnetMapping,
) -> Result<()> {
    rs.define_joined_output(name, refs, true, move |ids, cfg| {
        import_subnet_ids(name, mapping, ids, cfg)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        serde_yaml_ng::from_str(
            r#"
metadata:
  name: demo
  region: us-west-2
vpc:
  subnets:
    private:
      us-west-2a: {}
      us-west-2b: {}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_cf018_az_resource_name() {
        assert_eq!(az_resource_name("us-west-2a"), "USWEST2A");
        assert_eq!(az_resource_name("us-west-2-lax-1a"), "USWEST2LAX1A");
    }

    #[test]
    fn test_cf018_policy_arn_is_partition_aware() {
        let v = policy_arn("AmazonEKSWorkerNodePolicy").to_json();
        assert_eq!(
            v["Fn::Sub"],
            "arn:${AWS::Partition}:iam::aws:policy/AmazonEKSWorkerNodePolicy"
        );
    }

    #[test]
    fn test_cf018_subnet_ids_assigned_in_order() {
        let mut cfg = config();
        import_subnet_ids(
            "SubnetsPrivate",
            SubnetMapping::Private,
            vec!["subnet-1".into(), "subnet-2".into()],
            &mut cfg,
        )
        .unwrap();
        assert_eq!(cfg.vpc.subnets.private["us-west-2a"].id.as_deref(), Some("subnet-1"));
        assert_eq!(cfg.vpc.subnets.private["us-west-2b"].id.as_deref(), Some("subnet-2"));
    }

    #[test]
    fn test_cf018_too_few_subnet_ids_rejected() {
        let mut cfg = config();
        let err = import_subnet_ids(
            "SubnetsPrivate",
            SubnetMapping::Private,
            vec!["subnet-1".into()],
            &mut cfg,
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected 2 subnet IDs, got 1"));
    }

    #[test]
    fn test_cf018_control_plane_subnets_on_outposts() {
        let sr = |id: &str| SubnetResource {
            subnet: Value::from(id),
            availability_zone: "us-west-2a".into(),
            route_table: None,
        };
        let mut details = SubnetDetails {
            public: vec![sr("pub")],
            private: vec![sr("priv")],
            ..SubnetDetails::default()
        };
        assert_eq!(details.control_plane_subnet_refs().len(), 2);
        details.control_plane_on_outposts = true;
        assert_eq!(details.control_plane_subnet_refs(), vec![Value::from("priv")]);
    }
}
