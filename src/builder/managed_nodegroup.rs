//! CF-026: Managed node pool stack.
//!
//! The node-pool service owns the instances; the stack only carries the
//! `AWS::EKS::Nodegroup`, its role and a launch template. An external launch
//! template is fetched and merged under the locally computed fields.

use super::iam::add_node_iam;
use super::launch_template::{
    add_launch_template, efa_network_cards, is_arm, is_arm_gpu, is_gpu, is_neuron, is_nvidia,
    managed_launch_template_data, validate_launch_template, TemplateData,
    MANAGED_LAUNCH_TEMPLATE_RESOURCE,
};
use super::nodegroup::merged_tags;
use super::{add_service_principal_mapping, ClusterImports, TEMPLATE_DESCRIPTION_SUFFIX};
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet};
use crate::core::types::{
    ClusterConfig, ManagedNodeGroup, NodePool, Taint, AMI_FAMILY_AL2, AMI_FAMILY_AL2023,
    AMI_FAMILY_BOTTLEROCKET,
};
use crate::error::{Error, Result};
use crate::provider::Ec2Api;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const MANAGED_NODE_GROUP_RESOURCE: &str = "ManagedNodeGroup";

/// Representative instance type used for image selection.
pub const DEFAULT_INSTANCE_TYPE: &str = "m5.large";

pub const AMI_TYPE_CUSTOM: &str = "CUSTOM";

/// Wire form of a taint effect.
pub fn taint_effect(effect: &str) -> Result<&'static str> {
    match effect {
        "NoSchedule" => Ok("NO_SCHEDULE"),
        "PreferNoSchedule" => Ok("PREFER_NO_SCHEDULE"),
        "NoExecute" => Ok("NO_EXECUTE"),
        other => Err(Error::invalid_config(format!(
            "invalid taint effect {:?}, expected one of NoSchedule, PreferNoSchedule, NoExecute",
            other
        ))),
    }
}

fn taints(taints: &[Taint]) -> Result<Value> {
    let values = taints
        .iter()
        .map(|t| {
            Ok(Value::object([
                ("Key", Value::from(t.key.as_str())),
                ("Value", Value::from(t.value.as_str())),
                ("Effect", Value::from(taint_effect(&t.effect)?)),
            ]))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::list(values))
}

/// A GPU type if the pool has one, else its first type.
pub fn select_managed_instance_type(mng: &ManagedNodeGroup) -> String {
    let types = NodePool::Managed(mng).instance_types();
    types
        .iter()
        .find(|t| is_gpu(t))
        .or_else(|| types.first())
        .cloned()
        .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.to_string())
}

/// Image type for an image family and instance type.
pub fn ami_type(ami_family: &str, instance_type: &str) -> &'static str {
    match ami_family {
        AMI_FAMILY_AL2023 => {
            if is_arm(instance_type) {
                "AL2023_ARM_64_STANDARD"
            } else if is_nvidia(instance_type) {
                "AL2023_x86_64_NVIDIA"
            } else if is_neuron(instance_type) {
                "AL2023_x86_64_NEURON"
            } else {
                "AL2023_x86_64_STANDARD"
            }
        }
        AMI_FAMILY_AL2 => {
            if is_arm(instance_type) {
                "AL2_ARM_64"
            } else if is_gpu(instance_type) {
                "AL2_x86_64_GPU"
            } else {
                "AL2_x86_64"
            }
        }
        AMI_FAMILY_BOTTLEROCKET => {
            if is_arm_gpu(instance_type) {
                "BOTTLEROCKET_ARM_64_NVIDIA"
            } else if is_arm(instance_type) {
                "BOTTLEROCKET_ARM_64"
            } else if is_nvidia(instance_type) {
                "BOTTLEROCKET_x86_64_NVIDIA"
            } else {
                "BOTTLEROCKET_x86_64"
            }
        }
        "WindowsServer2019FullContainer" => "WINDOWS_FULL_2019_x86_64",
        "WindowsServer2019CoreContainer" => "WINDOWS_CORE_2019_x86_64",
        "WindowsServer2022FullContainer" => "WINDOWS_FULL_2022_x86_64",
        "WindowsServer2022CoreContainer" => "WINDOWS_CORE_2022_x86_64",
        _ => AMI_TYPE_CUSTOM,
    }
}

fn scaling_config(mng: &ManagedNodeGroup) -> Value {
    let mut scaling = BTreeMap::new();
    let base = &mng.base;
    for (key, value) in [
        ("MinSize", base.min_size),
        ("MaxSize", base.max_size),
        ("DesiredSize", base.desired_capacity),
    ] {
        if let Some(v) = value {
            scaling.insert(key.to_string(), Value::int(i64::from(v)));
        }
    }
    Value::Object(scaling)
}

fn update_config(mng: &ManagedNodeGroup) -> Option<Value> {
    let update = mng.update_config.as_ref()?;
    let mut fields = BTreeMap::new();
    if let Some(n) = update.max_unavailable {
        fields.insert("MaxUnavailable".to_string(), Value::int(i64::from(n)));
    }
    if let Some(pct) = update.max_unavailable_percentage {
        fields.insert("MaxUnavailablePercentage".to_string(), Value::int(i64::from(pct)));
    }
    Some(Value::Object(fields))
}

/// Resources of one managed pool's stack.
pub async fn build_managed_nodegroup_stack(
    cfg: &ClusterConfig,
    mng: &ManagedNodeGroup,
    imports: &ClusterImports,
    subnets: &[String],
    ec2: &dyn Ec2Api,
) -> Result<ResourceSet> {
    let pool = &mng.base;
    let mut rs = ResourceSet::new(format!(
        "EKS Managed Nodes (SSH access: {}) {}",
        pool.ssh.allow, TEMPLATE_DESCRIPTION_SUFFIX
    ));

    let iam = add_node_iam(&mut rs, &cfg.iam, pool, true)?;

    let efa_cards = if pool.efa_enabled {
        Some(efa_network_cards(ec2, &NodePool::Managed(mng).instance_types()).await?)
    } else {
        None
    };

    let local = managed_launch_template_data(&mut rs, cfg, mng, imports, efa_cards)?;
    let data = match &mng.launch_template {
        Some(lt) => {
            let fetched = ec2.launch_template(&lt.id, lt.version.as_deref()).await?;
            validate_launch_template(&fetched, mng)?;
            debug!(pool = %pool.name, id = %lt.id, "merging external launch template");
            TemplateData::from_fetched(&fetched).merge(local)
        }
        None => local,
    };
    let has_image = data.contains("ImageId");
    let has_instance_type = data.contains("InstanceType");
    let template = add_launch_template(&mut rs, MANAGED_LAUNCH_TEMPLATE_RESOURCE, data)?;

    let mut ng = Resource::new(ResourceKind::EksNodegroup)
        .with("ClusterName", cfg.metadata.name.as_str())
        .with("NodegroupName", pool.name.as_str())
        .with("ScalingConfig", scaling_config(mng))
        .with("Subnets", Value::strings(subnets.iter().cloned()))
        .with("NodeRole", iam.instance_role_arn)
        .with(
            "LaunchTemplate",
            Value::object([
                ("Id", template),
                (
                    "Version",
                    Value::get_att(MANAGED_LAUNCH_TEMPLATE_RESOURCE, "LatestVersionNumber"),
                ),
            ]),
        )
        .with_opt("UpdateConfig", update_config(mng))
        .with_opt("ReleaseVersion", mng.release_version.clone());

    if !pool.labels.is_empty() {
        ng = ng.with(
            "Labels",
            Value::object(pool.labels.iter().map(|(k, v)| (k.clone(), Value::from(v.as_str())))),
        );
    }
    let tags = merged_tags(cfg, pool);
    if !tags.is_empty() {
        ng = ng.with("Tags", Value::object(tags.into_iter().map(|(k, v)| (k, Value::from(v)))));
    }
    if !mng.taints.is_empty() {
        ng = ng.with("Taints", taints(&mng.taints)?);
    }
    if mng.spot {
        ng = ng.with("CapacityType", "SPOT");
    }
    if !has_image {
        let ami = ami_type(&pool.ami_family, &select_managed_instance_type(mng));
        if ami == AMI_TYPE_CUSTOM {
            return Err(Error::missing_field(
                "ami",
                format!("amiFamily is {} on managed node group {}", pool.ami_family, pool.name),
            ));
        }
        ng = ng.with("AmiType", ami);
    }
    if !has_instance_type {
        let types = NodePool::Managed(mng).instance_types();
        if !types.is_empty() {
            ng = ng.with("InstanceTypes", Value::strings(types));
        }
    }
    rs.add_resource(MANAGED_NODE_GROUP_RESOURCE, ng)?;
    add_service_principal_mapping(&mut rs);

    info!(pool = %pool.name, subnets = subnets.len(), spot = mng.spot, "built managed node pool");
    Ok(rs)
}
