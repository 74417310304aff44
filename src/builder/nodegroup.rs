//! CF-025: Unmanaged node pool stack.
//!
//! An auto-scaling group launched from a local launch template. The stack
//! imports the VPC and security groups exported by the cluster stack.

use super::iam::add_node_iam;
use super::launch_template::{
    add_launch_template, efa_network_cards, unmanaged_launch_template_data,
    UNMANAGED_LAUNCH_TEMPLATE_RESOURCE,
};
use super::security_group::add_node_security_groups;
use super::{add_service_principal_mapping, outputs, ClusterImports, TEMPLATE_DESCRIPTION_SUFFIX};
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet};
use crate::core::types::{ClusterConfig, IpFamily, NodeGroup, NodeGroupBase, NodePool};
use crate::error::{Error, Result};
use crate::provider::Ec2Api;
use std::collections::BTreeMap;
use tracing::info;

pub const NODE_GROUP_RESOURCE: &str = "NodeGroup";

/// Pool tags layered over the cluster's shared tags.
pub fn merged_tags(cfg: &ClusterConfig, pool: &NodeGroupBase) -> BTreeMap<String, String> {
    let mut tags = cfg.metadata.tags.clone();
    tags.extend(pool.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    tags
}

fn asg_tag(key: impl Into<String>, value: impl Into<Value>) -> Value {
    Value::object([
        ("Key", Value::from(key.into())),
        ("Value", value.into()),
        ("PropagateAtLaunch", Value::from("true")),
    ])
}

/// Tags of the auto-scaling group, every one propagated to instances.
pub fn asg_tags(cfg: &ClusterConfig, ng: &NodeGroup) -> Vec<Value> {
    let cluster = &cfg.metadata.name;
    let mut tags = vec![
        asg_tag("Name", format!("{}-{}-Node", cluster, ng.base.name)),
        asg_tag(format!("kubernetes.io/cluster/{}", cluster), "owned"),
    ];
    if ng.base.iam.with_addon_policies.auto_scaler {
        tags.push(asg_tag("k8s.io/cluster-autoscaler/enabled", "true"));
        tags.push(asg_tag(format!("k8s.io/cluster-autoscaler/{}", cluster), "owned"));
    }
    if ng.autoscaler_tags {
        for (k, v) in &ng.base.labels {
            tags.push(asg_tag(
                format!("k8s.io/cluster-autoscaler/node-template/label/{}", k),
                v.as_str(),
            ));
        }
    }
    for (k, v) in merged_tags(cfg, &ng.base) {
        tags.push(asg_tag(k, v));
    }
    tags
}

fn launch_template_spec() -> Value {
    Value::object([
        ("LaunchTemplateName", Value::sub("${AWS::StackName}")),
        (
            "Version",
            Value::get_att(UNMANAGED_LAUNCH_TEMPLATE_RESOURCE, "LatestVersionNumber"),
        ),
    ])
}

/// Mixed-instances policy when the pool spreads over several types.
fn mixed_instances_policy(ng: &NodeGroup) -> Option<Value> {
    let dist = ng.instances_distribution.as_ref()?;
    if dist.instance_types.is_empty() {
        return None;
    }
    let overrides = dist
        .instance_types
        .iter()
        .map(|t| Value::object([("InstanceType", Value::from(t.as_str()))]))
        .collect();

    let mut distribution = BTreeMap::new();
    if let Some(price) = dist.max_price {
        distribution.insert("SpotMaxPrice".to_string(), Value::from(format!("{:.6}", price)));
    }
    if let Some(base) = dist.on_demand_base_capacity {
        distribution.insert("OnDemandBaseCapacity".to_string(), Value::int(i64::from(base)));
    }
    if let Some(pct) = dist.on_demand_percentage_above_base_capacity {
        distribution.insert(
            "OnDemandPercentageAboveBaseCapacity".to_string(),
            Value::int(i64::from(pct)),
        );
    }
    if let Some(pools) = dist.spot_instance_pools {
        distribution.insert("SpotInstancePools".to_string(), Value::int(i64::from(pools)));
    }
    if let Some(strategy) = &dist.spot_allocation_strategy {
        distribution.insert("SpotAllocationStrategy".to_string(), Value::from(strategy.as_str()));
    }

    Some(Value::object([
        (
            "LaunchTemplate",
            Value::object([
                ("LaunchTemplateSpecification", launch_template_spec()),
                ("Overrides", Value::list(overrides)),
            ]),
        ),
        ("InstancesDistribution", Value::Object(distribution)),
    ]))
}

/// Resources and outputs of one unmanaged pool's stack.
///
/// `subnets` are the IDs placement selected for the pool.
pub async fn build_nodegroup_stack(
    cfg: &ClusterConfig,
    ng: &NodeGroup,
    imports: &ClusterImports,
    subnets: &[String],
    ec2: &dyn Ec2Api,
) -> Result<ResourceSet> {
    let pool = &ng.base;
    if cfg.ip_family() == IpFamily::Ipv6 {
        return Err(Error::invalid_config(
            "unmanaged nodegroups are not supported with IPv6 clusters",
        ));
    }
    if subnets.is_empty() {
        return Err(Error::NoSubnetsForZones {
            pool: pool.name.clone(),
            network: if pool.private_networking { "private" } else { "public" }.to_string(),
            zones: pool.availability_zones.clone(),
            reason: "placement returned no subnets".to_string(),
        });
    }

    let mut rs = ResourceSet::new(format!(
        "EKS nodes (AMI family: {}, SSH access: {}, private networking: {}) {}",
        pool.ami_family, pool.ssh.allow, pool.private_networking, TEMPLATE_DESCRIPTION_SUFFIX
    ));

    rs.define_output_without_collector(
        outputs::NODE_GROUP_FEATURE_PRIVATE_NETWORKING,
        Value::bool(pool.private_networking),
        false,
    )?;
    rs.define_output_without_collector(
        outputs::NODE_GROUP_FEATURE_SHARED_SECURITY_GROUP,
        Value::bool(pool.security_groups.with_shared),
        false,
    )?;
    rs.define_output_without_collector(
        outputs::NODE_GROUP_FEATURE_LOCAL_SECURITY_GROUP,
        Value::bool(pool.security_groups.with_local),
        false,
    )?;

    let iam = add_node_iam(&mut rs, &cfg.iam, pool, false)?;
    let groups = add_node_security_groups(&mut rs, cfg, pool, imports)?;

    let efa_cards = if pool.efa_enabled {
        Some(efa_network_cards(ec2, &NodePool::Unmanaged(ng).instance_types()).await?)
    } else {
        None
    };

    let data = unmanaged_launch_template_data(
        &mut rs,
        cfg,
        ng,
        iam.instance_profile_arn,
        &groups,
        efa_cards,
    )?;
    add_launch_template(&mut rs, UNMANAGED_LAUNCH_TEMPLATE_RESOURCE, data)?;

    let size = |v: Option<u32>| Value::from(v.unwrap_or_default().to_string());
    let mut asg = Resource::new(ResourceKind::AutoScalingGroup)
        .with("VPCZoneIdentifier", Value::strings(subnets.iter().cloned()))
        .with("MinSize", size(pool.min_size))
        .with("MaxSize", size(pool.max_size))
        .with("DesiredCapacity", size(pool.desired_capacity))
        .with("Tags", Value::list(asg_tags(cfg, ng)))
        .update_policy(Value::object([(
            "AutoScalingRollingUpdate",
            Value::Object(BTreeMap::new()),
        )]));
    if let Some(dist) = &ng.instances_distribution {
        if dist.capacity_rebalance {
            asg = asg.with("CapacityRebalance", true);
        }
    }
    asg = match mixed_instances_policy(ng) {
        Some(policy) => asg.with("MixedInstancesPolicy", policy),
        None => asg.with("LaunchTemplate", launch_template_spec()),
    };
    rs.add_resource(NODE_GROUP_RESOURCE, asg)?;
    add_service_principal_mapping(&mut rs);

    info!(
        pool = %pool.name,
        subnets = subnets.len(),
        efa = pool.efa_enabled,
        "built unmanaged node pool"
    );
    Ok(rs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::{apply_defaults, parse_config};
    use crate::provider::memory::MemoryProvider;

    fn config(extra: &str) -> ClusterConfig {
        let yaml = format!(
            "metadata:\n  name: demo\n  region: us-west-2\n  tags: {{team: infra, env: dev}}\n{}",
            extra
        );
        let mut cfg = parse_config(&yaml).unwrap();
        apply_defaults(&mut cfg).unwrap();
        cfg
    }

    async fn build(cfg: &ClusterConfig) -> Result<serde_json::Value> {
        let ec2 = MemoryProvider::new("us-west-2");
        let rs = build_nodegroup_stack(
            cfg,
            &cfg.node_groups[0],
            &ClusterImports::new("clusterforge-demo-cluster"),
            &["subnet-1".to_string(), "subnet-2".to_string()],
            &ec2,
        )
        .await?;
        rs.finish()?.to_json()
    }

    #[tokio::test]
    async fn test_cf025_asg_uses_launch_template() {
        let cfg = config(
            "nodeGroups:\n  - name: ng-1\n    instanceType: m5.large\n    minSize: 1\n    maxSize: 3\n",
        );
        let json = build(&cfg).await.unwrap();
        let asg = &json["Resources"]["NodeGroup"];
        assert_eq!(asg["Type"], "AWS::AutoScaling::AutoScalingGroup");
        let props = &asg["Properties"];
        assert_eq!(props["MinSize"], "1");
        assert_eq!(props["MaxSize"], "3");
        // desired capacity falls back to minSize
        assert_eq!(props["DesiredCapacity"], "1");
        assert_eq!(props["VPCZoneIdentifier"], serde_json::json!(["subnet-1", "subnet-2"]));
        assert_eq!(
            props["LaunchTemplate"]["Version"]["Fn::GetAtt"],
            serde_json::json!(["NodeGroupLaunchTemplate", "LatestVersionNumber"])
        );
        assert!(asg["UpdatePolicy"]["AutoScalingRollingUpdate"].is_object());
        assert!(json["Resources"]["NodeGroupLaunchTemplate"].is_object());
        assert!(json["Resources"]["NodeInstanceRole"].is_object());
        assert_eq!(json["Outputs"]["FeaturePrivateNetworking"]["Value"], false);
    }

    #[tokio::test]
    async fn test_cf025_mixed_instances() {
        let cfg = config(
            "nodeGroups:\n  - name: ng-1\n    instancesDistribution:\n      instanceTypes: [m5.large, m6i.large]\n      maxPrice: 0.5\n      onDemandBaseCapacity: 1\n      spotAllocationStrategy: capacity-optimized\n",
        );
        let json = build(&cfg).await.unwrap();
        let props = &json["Resources"]["NodeGroup"]["Properties"];
        assert!(props.get("LaunchTemplate").is_none());
        let policy = &props["MixedInstancesPolicy"];
        assert_eq!(policy["LaunchTemplate"]["Overrides"][1]["InstanceType"], "m6i.large");
        assert_eq!(policy["InstancesDistribution"]["SpotMaxPrice"], "0.500000");
        assert_eq!(policy["InstancesDistribution"]["OnDemandBaseCapacity"], 1);
        let lt = &json["Resources"]["NodeGroupLaunchTemplate"]["Properties"]["LaunchTemplateData"];
        assert_eq!(lt["InstanceType"], "m5.large");
    }

    #[tokio::test]
    async fn test_cf025_autoscaler_and_cluster_tags() {
        let cfg = config(
            "nodeGroups:\n  - name: ng-1\n    instanceType: m5.large\n    autoscalerTags: true\n    labels: {role: worker}\n    tags: {env: prod}\n    iam:\n      withAddonPolicies: {autoScaler: true}\n",
        );
        let json = build(&cfg).await.unwrap();
        let tags = json["Resources"]["NodeGroup"]["Properties"]["Tags"].as_array().unwrap().clone();
        let value = |key: &str| {
            tags.iter()
                .find(|t| t["Key"] == key)
                .map(|t| t["Value"].clone())
        };
        assert_eq!(value("Name").unwrap(), "demo-ng-1-Node");
        assert_eq!(value("kubernetes.io/cluster/demo").unwrap(), "owned");
        assert_eq!(value("k8s.io/cluster-autoscaler/enabled").unwrap(), "true");
        assert_eq!(value("k8s.io/cluster-autoscaler/node-template/label/role").unwrap(), "worker");
        assert_eq!(value("env").unwrap(), "prod");
        assert_eq!(value("team").unwrap(), "infra");
        assert!(tags.iter().all(|t| t["PropagateAtLaunch"] == "true"));
        assert!(json["Resources"]["PolicyAutoScaling"].is_object());
    }

    #[tokio::test]
    async fn test_cf025_efa_pool() {
        let cfg = config(
            "nodeGroups:\n  - name: ng-1\n    instanceType: p4d.24xlarge\n    efaEnabled: true\n",
        );
        let json = build(&cfg).await.unwrap();
        let lt = &json["Resources"]["NodeGroupLaunchTemplate"]["Properties"]["LaunchTemplateData"];
        assert_eq!(lt["NetworkInterfaces"].as_array().unwrap().len(), 4);
        assert!(json["Resources"]["NodeGroupPlacementGroup"].is_object());
        assert!(json["Resources"]["EFASG"].is_object());
    }

    #[tokio::test]
    async fn test_cf025_ipv6_rejected() {
        let mut cfg = config("nodeGroups:\n  - name: ng-1\n    instanceType: m5.large\n");
        cfg.kubernetes_network_config.ip_family = IpFamily::Ipv6;
        let err = build(&cfg).await.unwrap_err();
        assert!(err.to_string().contains("not supported with IPv6"));
    }
}
