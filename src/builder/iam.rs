//! CF-022: IAM roles for the control plane and node pools.
//!
//! The node role's managed-policy list is the default set merged with the
//! user's ARNs; every add-on contributes its own named `AWS::IAM::Policy`
//! resource attached to the role rather than one merged document.

use super::statement::{self, policy_document};
use super::{
    assume_role_policy, make_name, outputs, policy_arn, SERVICE_ROLE_RESOURCE,
};
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet};
use crate::core::types::{ClusterConfig, ClusterIam, NodeGroupBase, NodeGroupIam};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::debug;

pub const POLICY_EKS_CLUSTER: &str = "AmazonEKSClusterPolicy";
pub const POLICY_EKS_VPC_RESOURCE_CONTROLLER: &str = "AmazonEKSVPCResourceController";
pub const POLICY_EKS_LOCAL_OUTPOST_CLUSTER: &str = "AmazonEKSLocalOutpostClusterPolicy";
pub const POLICY_EKS_WORKER_NODE: &str = "AmazonEKSWorkerNodePolicy";
pub const POLICY_EKS_CNI: &str = "AmazonEKS_CNI_Policy";
pub const POLICY_ECR_READ_ONLY: &str = "AmazonEC2ContainerRegistryReadOnly";
pub const POLICY_ECR_POWER_USER: &str = "AmazonEC2ContainerRegistryPowerUser";
pub const POLICY_SSM_MANAGED_INSTANCE_CORE: &str = "AmazonSSMManagedInstanceCore";
pub const POLICY_CLOUDWATCH_AGENT_SERVER: &str = "CloudWatchAgentServerPolicy";

pub const INSTANCE_ROLE_RESOURCE: &str = "NodeInstanceRole";
pub const INSTANCE_PROFILE_RESOURCE: &str = "NodeInstanceProfile";

/// Control-plane service role, unless an existing one is configured.
pub fn add_service_role(rs: &mut ResourceSet, cfg: &ClusterConfig) -> Result<Value> {
    if let Some(arn) = cfg.iam.service_role_arn.as_deref().filter(|a| !a.is_empty()) {
        rs.define_output_without_collector(
            outputs::CLUSTER_SERVICE_ROLE_ARN,
            Value::from(arn),
            true,
        )?;
        return Ok(Value::from(arn));
    }

    let mut role = if cfg.is_control_plane_on_outposts() {
        Resource::new(ResourceKind::IamRole)
            .with("AssumeRolePolicyDocument", assume_role_policy(&["EC2"], &["sts:AssumeRole"]))
            .with(
                "ManagedPolicyArns",
                Value::list(vec![policy_arn(POLICY_EKS_LOCAL_OUTPOST_CLUSTER)]),
            )
    } else {
        Resource::new(ResourceKind::IamRole)
            .with(
                "AssumeRolePolicyDocument",
                assume_role_policy(&["EKS"], &["sts:AssumeRole", "sts:TagSession"]),
            )
            .with(
                "ManagedPolicyArns",
                Value::list(vec![
                    policy_arn(POLICY_EKS_CLUSTER),
                    policy_arn(POLICY_EKS_VPC_RESOURCE_CONTROLLER),
                ]),
            )
    };
    if let Some(boundary) = cfg.iam.service_role_permissions_boundary.as_deref() {
        role = role.with("PermissionsBoundary", boundary);
    }
    rs.add_resource(SERVICE_ROLE_RESOURCE, role)?;
    rs.define_output_from_att(
        outputs::CLUSTER_SERVICE_ROLE_ARN,
        SERVICE_ROLE_RESOURCE,
        "Arn",
        true,
        |v, cfg| {
            cfg.iam.service_role_arn = Some(v.to_string());
            Ok(())
        },
    )?;
    Ok(Value::get_att(SERVICE_ROLE_RESOURCE, "Arn"))
}

/// References a node pool stack uses for its instances.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIam {
    /// Instance profile ARN for launch templates
    pub instance_profile_arn: Value,
    /// Role ARN for managed node pools
    pub instance_role_arn: Value,
}

/// Instance role and profile of a node pool.
///
/// An existing profile skips every IAM resource; an existing role only gets
/// a profile created around it.
pub fn add_node_iam(
    rs: &mut ResourceSet,
    cluster_iam: &ClusterIam,
    pool: &NodeGroupBase,
    managed: bool,
) -> Result<NodeIam> {
    let iam = &pool.iam;
    let pool_name = pool.name.clone();

    if let Some(profile) = iam.instance_profile_arn.as_deref() {
        debug!(pool = %pool.name, "using existing instance profile");
        rs.define_output_without_collector(
            outputs::NODE_GROUP_INSTANCE_PROFILE_ARN,
            Value::from(profile),
            true,
        )?;
        let role = match iam.instance_role_arn.as_deref() {
            Some(role) => {
                rs.define_output_without_collector(
                    outputs::NODE_GROUP_INSTANCE_ROLE_ARN,
                    Value::from(role),
                    true,
                )?;
                Value::from(role)
            }
            None => Value::from(profile),
        };
        return Ok(NodeIam {
            instance_profile_arn: Value::from(profile),
            instance_role_arn: role,
        });
    }

    if let Some(role_arn) = iam.instance_role_arn.as_deref() {
        let role_arn = normalize_arn(role_arn);
        rs.add_resource(
            INSTANCE_PROFILE_RESOURCE,
            Resource::new(ResourceKind::IamInstanceProfile)
                .with("Path", "/")
                .with("Roles", Value::strings([role_name_from_arn(&role_arn)])),
        )?;
        rs.define_output_from_att(
            outputs::NODE_GROUP_INSTANCE_PROFILE_ARN,
            INSTANCE_PROFILE_RESOURCE,
            "Arn",
            true,
            move |v, cfg| {
                set_pool_iam(cfg, &pool_name, |iam| iam.instance_profile_arn = Some(v.to_string()))
            },
        )?;
        rs.define_output_without_collector(
            outputs::NODE_GROUP_INSTANCE_ROLE_ARN,
            Value::from(role_arn.as_str()),
            true,
        )?;
        return Ok(NodeIam {
            instance_profile_arn: Value::get_att(INSTANCE_PROFILE_RESOURCE, "Arn"),
            instance_role_arn: Value::from(role_arn),
        });
    }

    add_instance_role(rs, cluster_iam, iam, managed)?;
    rs.add_resource(
        INSTANCE_PROFILE_RESOURCE,
        Resource::new(ResourceKind::IamInstanceProfile)
            .with("Path", "/")
            .with("Roles", Value::list(vec![Value::reference(INSTANCE_ROLE_RESOURCE)])),
    )?;

    let profile_pool = pool_name.clone();
    rs.define_output_from_att(
        outputs::NODE_GROUP_INSTANCE_PROFILE_ARN,
        INSTANCE_PROFILE_RESOURCE,
        "Arn",
        true,
        move |v, cfg| {
            set_pool_iam(cfg, &profile_pool, |iam| iam.instance_profile_arn = Some(v.to_string()))
        },
    )?;
    rs.define_output_from_att(
        outputs::NODE_GROUP_INSTANCE_ROLE_ARN,
        INSTANCE_ROLE_RESOURCE,
        "Arn",
        true,
        move |v, cfg| {
            set_pool_iam(cfg, &pool_name, |iam| iam.instance_role_arn = Some(v.to_string()))
        },
    )?;
    Ok(NodeIam {
        instance_profile_arn: Value::get_att(INSTANCE_PROFILE_RESOURCE, "Arn"),
        instance_role_arn: Value::get_att(INSTANCE_ROLE_RESOURCE, "Arn"),
    })
}

fn set_pool_iam(
    cfg: &mut ClusterConfig,
    pool: &str,
    set: impl FnOnce(&mut NodeGroupIam),
) -> Result<()> {
    let base = cfg
        .node_pool_base_mut(pool)
        .ok_or_else(|| Error::collect(pool, "node pool no longer in config"))?;
    set(&mut base.iam);
    Ok(())
}

fn add_instance_role(
    rs: &mut ResourceSet,
    cluster_iam: &ClusterIam,
    iam: &NodeGroupIam,
    managed: bool,
) -> Result<()> {
    let role = Resource::new(ResourceKind::IamRole)
        .with("Path", "/")
        .with("AssumeRolePolicyDocument", assume_role_policy(&["EC2"], &["sts:AssumeRole"]))
        .with("ManagedPolicyArns", managed_policy_arns(cluster_iam, iam, managed)?)
        .with_opt("RoleName", iam.instance_role_name.clone())
        .with_opt("PermissionsBoundary", iam.instance_role_permissions_boundary.clone());
    let role_ref = rs.add_resource(INSTANCE_ROLE_RESOURCE, role)?;

    if let Some(doc) = &iam.attach_policy {
        rs.add_resource(
            "Policy1",
            Resource::new(ResourceKind::IamPolicy)
                .with("PolicyName", make_name("Policy1"))
                .with("Roles", Value::list(vec![role_ref.clone()]))
                .with("PolicyDocument", Value::from_json(doc)),
        )?;
    }

    let addons = &iam.with_addon_policies;
    let mut attach = |name: &str, statements: Vec<Value>| -> Result<()> {
        rs.add_resource(
            name,
            Resource::new(ResourceKind::IamPolicy)
                .with("PolicyName", make_name(name))
                .with("Roles", Value::list(vec![role_ref.clone()]))
                .with("PolicyDocument", policy_document(statements)),
        )?;
        Ok(())
    };
    if addons.auto_scaler {
        attach("PolicyAutoScaling", statement::auto_scaler_statements())?;
    }
    if addons.cert_manager {
        attach("PolicyCertManagerChangeSet", statement::change_set_statements())?;
        attach("PolicyCertManagerHostedZones", statement::cert_manager_hosted_zones_statements())?;
        attach("PolicyCertManagerGetChange", statement::cert_manager_get_change_statements())?;
    }
    if addons.external_dns {
        attach("PolicyExternalDNSChangeSet", statement::change_set_statements())?;
        attach("PolicyExternalDNSHostedZones", statement::external_dns_hosted_zones_statements())?;
    }
    if addons.app_mesh {
        attach("PolicyAppMesh", statement::app_mesh_statements("appmesh:*"))?;
    }
    if addons.app_mesh_preview {
        attach("PolicyAppMeshPreview", statement::app_mesh_statements("appmesh-preview:*"))?;
    }
    if addons.ebs {
        attach("PolicyEBS", statement::ebs_statements())?;
    }
    if addons.fsx {
        attach("PolicyFSX", statement::fsx_statements())?;
        attach("PolicyServiceLinkRole", statement::service_link_role_statements())?;
    }
    if addons.efs {
        attach("PolicyEFS", statement::efs_statements())?;
        attach("PolicyEFSEC2", statement::efs_ec2_statements())?;
    }
    if addons.aws_load_balancer_controller {
        attach(
            "PolicyAWSLoadBalancerController",
            statement::load_balancer_controller_statements(),
        )?;
    }
    if addons.xray {
        attach("PolicyXRay", statement::xray_statements())?;
    }
    Ok(())
}

/// Managed policies of a node role: user ARNs first, then the remaining
/// defaults as sorted partition-aware ARNs.
///
/// A user ARN whose resource name matches a default replaces it.
pub fn managed_policy_arns(
    cluster_iam: &ClusterIam,
    iam: &NodeGroupIam,
    managed: bool,
) -> Result<Value> {
    let addons = &iam.with_addon_policies;
    let mut names: BTreeSet<&str> = BTreeSet::new();
    if iam.attach_policy_arns.is_empty() {
        names.insert(POLICY_EKS_WORKER_NODE);
        if !cluster_iam.with_oidc {
            names.insert(POLICY_EKS_CNI);
        }
        if managed {
            // the managed node pool service insists on the read-only policy
            names.insert(POLICY_ECR_READ_ONLY);
        }
        names.insert(POLICY_SSM_MANAGED_INSTANCE_CORE);
    }
    if addons.image_builder {
        names.insert(POLICY_ECR_POWER_USER);
    } else if !managed {
        names.insert(POLICY_ECR_READ_ONLY);
    }
    if addons.cloud_watch {
        names.insert(POLICY_CLOUDWATCH_AGENT_SERVER);
    }

    for arn in &iam.attach_policy_arns {
        let resource_name = arn_resource_name(arn)?;
        names.remove(resource_name);
    }

    let mut arns: Vec<Value> = iam
        .attach_policy_arns
        .iter()
        .map(|a| Value::from(a.as_str()))
        .collect();
    arns.extend(names.into_iter().map(policy_arn));
    Ok(Value::list(arns))
}

/// `policy/path/Name` of `arn:partition:service:region:account:policy/path/Name` → `path/Name`.
fn arn_resource_name(arn: &str) -> Result<&str> {
    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() != 6 || parts[0] != "arn" {
        return Err(Error::invalid_config(format!("{:?} is not a valid ARN", arn)));
    }
    let resource = parts[5];
    match resource.find('/') {
        Some(start) if start + 1 < resource.len() => Ok(&resource[start + 1..]),
        _ => Err(Error::invalid_config(format!(
            "failed to find ARN resource name: {}",
            resource
        ))),
    }
}

/// Keep only the first and last path segments of an ARN.
///
/// Role ARNs with a path are not recognised by the node authenticator.
pub fn normalize_arn(arn: &str) -> String {
    let parts: Vec<&str> = arn.split('/').collect();
    if parts.len() <= 1 {
        return arn.to_string();
    }
    format!("{}/{}", parts[0], parts[parts.len() - 1])
}

/// Role name at the end of a role ARN.
pub fn role_name_from_arn(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_string()
}
