//! CF-023: Security groups of the cluster and of node pools.
//!
//! Rules between the control plane and a pool come in pairs: egress on the
//! control-plane group, ingress on the pool group.

use super::{
    az_resource_name, outputs, ClusterImports, CONTROL_PLANE_RESOURCE, CONTROL_PLANE_SG_RESOURCE,
    INGRESS_CLUSTER_TO_NODE_SG_RESOURCE, SG_MAX_NODE_PORT, SG_MIN_NODE_PORT, SG_PORT_HTTPS,
    SG_PORT_SSH, SG_PORT_ZERO, SG_PROTO_ALL, SG_PROTO_TCP, SG_SOURCE_ANYWHERE_IPV4,
    SG_SOURCE_ANYWHERE_IPV6, SHARED_NODE_SG_RESOURCE,
};
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet, Taggable};
use crate::core::types::{ClusterConfig, NodeGroupBase};
use crate::error::{Error, Result};

pub const NODE_SG_RESOURCE: &str = "SG";
pub const EFA_SG_RESOURCE: &str = "EFASG";

/// Security groups the control plane and later builders use.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSecurityGroups {
    pub control_plane: Value,
    /// Every group attached to the control plane
    pub control_plane_ids: Vec<Value>,
    pub shared_node: Value,
}

fn ingress(group: Value, protocol: &str, from: i64, to: i64, description: String) -> Resource {
    Resource::new(ResourceKind::SecurityGroupIngress)
        .with("GroupId", group)
        .with("IpProtocol", protocol)
        .with("FromPort", from)
        .with("ToPort", to)
        .with("Description", description)
}

fn egress(
    group: Value,
    destination: Value,
    protocol: &str,
    from: i64,
    to: i64,
    description: String,
) -> Resource {
    Resource::new(ResourceKind::SecurityGroupEgress)
        .with("GroupId", group)
        .with("DestinationSecurityGroupId", destination)
        .with("IpProtocol", protocol)
        .with("FromPort", from)
        .with("ToPort", to)
        .with("Description", description)
}

fn owned_tag(resource: &mut Resource, cluster: &str) {
    if let Some(mut tagged) = resource.taggable() {
        tagged.set_tag(&format!("kubernetes.io/cluster/{}", cluster), Value::from("owned"));
    }
}

/// Control-plane and shared node groups, created unless existing IDs are configured.
pub fn add_cluster_security_groups(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    vpc: &Value,
) -> Result<ClusterSecurityGroups> {
    let (control_plane, control_plane_ids) = if let Some(sg) = cfg.vpc.security_group.as_deref() {
        (Value::from(sg), vec![Value::from(sg)])
    } else if let Some(first) = cfg.vpc.control_plane_security_group_ids.first() {
        (
            Value::from(first.as_str()),
            cfg.vpc
                .control_plane_security_group_ids
                .iter()
                .map(|id| Value::from(id.as_str()))
                .collect(),
        )
    } else {
        let sg = rs.add_resource(
            CONTROL_PLANE_SG_RESOURCE,
            Resource::new(ResourceKind::SecurityGroup)
                .with(
                    "GroupDescription",
                    "Communication between the control plane and worker nodegroups",
                )
                .with("VpcId", vpc.clone()),
        )?;
        for (i, cidr) in cfg.vpc.extra_cidrs.iter().enumerate() {
            rs.add_resource(
                &format!("IngressControlPlaneExtraCIDR{}", i),
                ingress(
                    sg.clone(),
                    SG_PROTO_TCP,
                    SG_PORT_HTTPS,
                    SG_PORT_HTTPS,
                    format!("Allow Extra CIDR {} ({}) to communicate to controlplane", i, cidr),
                )
                .with("CidrIp", cidr.as_str()),
            )?;
        }
        for (i, cidr) in cfg.vpc.extra_ipv6_cidrs.iter().enumerate() {
            rs.add_resource(
                &format!("IngressControlPlaneExtraIPv6CIDR{}", i),
                ingress(
                    sg.clone(),
                    SG_PROTO_TCP,
                    SG_PORT_HTTPS,
                    SG_PORT_HTTPS,
                    format!(
                        "Allow Extra IPv6 CIDR {} ({}) to communicate to controlplane",
                        i,
                        cidr
                    ),
                )
                .with("CidrIpv6", cidr.as_str()),
            )?;
        }
        (sg.clone(), vec![sg])
    };

    let shared_node = match cfg.vpc.shared_node_security_group.as_deref() {
        Some(sg) => Value::from(sg),
        None => {
            let sg = rs.add_resource(
                SHARED_NODE_SG_RESOURCE,
                Resource::new(ResourceKind::SecurityGroup)
                    .with("GroupDescription", "Communication between all nodes in the cluster")
                    .with("VpcId", vpc.clone()),
            )?;
            rs.add_resource(
                "IngressInterNodeGroupSG",
                ingress(
                    sg.clone(),
                    SG_PROTO_ALL,
                    SG_PORT_ZERO,
                    SG_MAX_NODE_PORT,
                    "Allow nodes to communicate with each other (all ports)".to_string(),
                )
                .with("SourceSecurityGroupId", sg.clone()),
            )?;
            sg
        }
    };

    if cfg.vpc.manage_shared_node_security_group_rules {
        let default_sg =
            Value::get_att(CONTROL_PLANE_RESOURCE, outputs::CLUSTER_DEFAULT_SECURITY_GROUP);
        rs.add_resource(
            INGRESS_CLUSTER_TO_NODE_SG_RESOURCE,
            ingress(
                shared_node.clone(),
                SG_PROTO_ALL,
                SG_PORT_ZERO,
                SG_MAX_NODE_PORT,
                "Allow managed and unmanaged nodes to communicate with each other (all ports)".to_string(),
            )
            .with("SourceSecurityGroupId", default_sg.clone()),
        )?;
        if cfg.is_control_plane_on_outposts() && cfg.is_fully_private() {
            for (alias, subnet) in &cfg.vpc.subnets.private {
                let Some(cidr) = subnet.cidr else { continue };
                let zone = if subnet.az.is_empty() { alias } else { &subnet.az };
                rs.add_resource(
                    &format!("IngressPrivateSubnet{}", az_resource_name(zone)),
                    ingress(
                        shared_node.clone(),
                        SG_PROTO_TCP,
                        SG_PORT_HTTPS,
                        SG_PORT_HTTPS,
                        "Allow private subnets to communicate with VPC endpoints".to_string(),
                    )
                    .with("CidrIp", cidr.to_string()),
                )?;
            }
        }
        rs.add_resource(
            "IngressNodeToDefaultClusterSG",
            ingress(
                default_sg,
                SG_PROTO_ALL,
                SG_PORT_ZERO,
                SG_MAX_NODE_PORT,
                "Allow unmanaged nodes to communicate with control plane (all ports)".to_string(),
            )
            .with("SourceSecurityGroupId", shared_node.clone()),
        )?;
    }

    rs.define_output(outputs::CLUSTER_SECURITY_GROUP, control_plane.clone(), true, |v, cfg| {
        cfg.vpc.security_group = Some(v.to_string());
        Ok(())
    })?;
    rs.define_output(
        outputs::CLUSTER_SHARED_NODE_SECURITY_GROUP,
        shared_node.clone(),
        true,
        |v, cfg| {
            cfg.vpc.shared_node_security_group = Some(v.to_string());
            Ok(())
        },
    )?;

    Ok(ClusterSecurityGroups {
        control_plane,
        control_plane_ids,
        shared_node,
    })
}

/// Security groups of one node pool: attached IDs, the shared group, then
/// the pool-local group and its EFA companion.
pub fn add_node_security_groups(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    pool: &NodeGroupBase,
    imports: &ClusterImports,
) -> Result<Vec<Value>> {
    let mut groups: Vec<Value> = pool
        .security_groups
        .attach_ids
        .iter()
        .map(|id| Value::from(id.as_str()))
        .collect();
    if pool.security_groups.with_shared {
        groups.push(imports.shared_node_security_group());
    }
    if !pool.security_groups.with_local {
        return Ok(groups);
    }

    let desc = format!("worker nodes in group {}", pool.name);
    let vpc = imports.vpc();
    let control_plane = imports.control_plane_security_group();

    let mut sg = Resource::new(ResourceKind::SecurityGroup)
        .with("VpcId", vpc.clone())
        .with("GroupDescription", format!("Communication between the control plane and {}", desc))
        .with(
            "SecurityGroupIngress",
            Value::list(node_ingress_rules(cfg, pool, &control_plane, &desc)?),
        );
    owned_tag(&mut sg, &cfg.metadata.name);
    let local = rs.add_resource(NODE_SG_RESOURCE, sg)?;
    groups.push(local.clone());

    if pool.efa_enabled {
        groups.push(add_efa_security_group(rs, vpc, &cfg.metadata.name, &desc)?);
    }

    rs.add_resource(
        "EgressInterCluster",
        egress(
            control_plane.clone(),
            local.clone(),
            SG_PROTO_TCP,
            SG_MIN_NODE_PORT,
            SG_MAX_NODE_PORT,
            format!(
                "Allow control plane to communicate with {} (kubelet and workload TCP ports)",
                desc
            ),
        ),
    )?;
    rs.add_resource(
        "EgressInterClusterAPI",
        egress(
            control_plane.clone(),
            local.clone(),
            SG_PROTO_TCP,
            SG_PORT_HTTPS,
            SG_PORT_HTTPS,
            format!(
                "Allow control plane to communicate with {} (workloads using HTTPS port, commonly used with extension API servers)",
                desc
            ),
        ),
    )?;
    rs.add_resource(
        "IngressInterClusterCP",
        ingress(
            control_plane,
            SG_PROTO_TCP,
            SG_PORT_HTTPS,
            SG_PORT_HTTPS,
            format!("Allow control plane to receive API requests from {}", desc),
        )
        .with("SourceSecurityGroupId", local),
    )?;
    Ok(groups)
}

fn inline_rule(
    protocol: &str,
    from: i64,
    to: i64,
    description: String,
    source: (&str, Value),
) -> Value {
    Value::object([
        (source.0, source.1),
        ("Description", Value::from(description)),
        ("IpProtocol", Value::from(protocol)),
        ("FromPort", Value::from(from)),
        ("ToPort", Value::from(to)),
    ])
}

fn node_ingress_rules(
    cfg: &ClusterConfig,
    pool: &NodeGroupBase,
    control_plane: &Value,
    desc: &str,
) -> Result<Vec<Value>> {
    let mut rules = vec![
        inline_rule(
            SG_PROTO_TCP,
            SG_MIN_NODE_PORT,
            SG_MAX_NODE_PORT,
            format!(
                "[IngressInterCluster] Allow {} to communicate with control plane (kubelet and workload TCP ports)",
                desc
            ),
            ("SourceSecurityGroupId", control_plane.clone()),
        ),
        inline_rule(
            SG_PROTO_TCP,
            SG_PORT_HTTPS,
            SG_PORT_HTTPS,
            format!(
                "[IngressInterClusterAPI] Allow {} to communicate with control plane (workloads using HTTPS port, commonly used with extension API servers)",
                desc
            ),
            ("SourceSecurityGroupId", control_plane.clone()),
        ),
    ];
    rules.extend(ssh_ingress_rules(cfg, pool, desc)?);
    Ok(rules)
}

/// SSH rules: explicit source groups, else the VPC block for private
/// pools, else anywhere over IPv4 and IPv6.
pub fn ssh_ingress_rules(
    cfg: &ClusterConfig,
    pool: &NodeGroupBase,
    desc: &str,
) -> Result<Vec<Value>> {
    if !pool.ssh.allow {
        return Ok(Vec::new());
    }
    if !pool.ssh.source_security_group_ids.is_empty() {
        return Ok(pool
            .ssh
            .source_security_group_ids
            .iter()
            .map(|id| {
                inline_rule(
                    SG_PROTO_TCP,
                    SG_PORT_SSH,
                    SG_PORT_SSH,
                    format!("[IngressSSHSourceSG] Allow SSH access to {} from {}", desc, id),
                    ("SourceSecurityGroupId", Value::from(id.as_str())),
                )
            })
            .collect());
    }
    if pool.private_networking {
        let cidr = cfg
            .vpc
            .cidr
            .ok_or_else(|| Error::missing_field("vpc.cidr", "SSH access to private nodes"))?;
        return Ok(vec![inline_rule(
            SG_PROTO_TCP,
            SG_PORT_SSH,
            SG_PORT_SSH,
            format!("[IngressAllSSH] Allow SSH access to {} (private, only inside VPC)", desc),
            ("CidrIp", Value::from(cidr.to_string())),
        )]);
    }
    Ok(vec![
        inline_rule(
            SG_PROTO_TCP,
            SG_PORT_SSH,
            SG_PORT_SSH,
            format!("[IngressAllSSH] Allow SSH access to {}", desc),
            ("CidrIp", Value::from(SG_SOURCE_ANYWHERE_IPV4)),
        ),
        inline_rule(
            SG_PROTO_TCP,
            SG_PORT_SSH,
            SG_PORT_SSH,
            format!("[IngressAllSSHIPv6] Allow SSH access to {}", desc),
            ("CidrIpv6", Value::from(SG_SOURCE_ANYWHERE_IPV6)),
        ),
    ])
}

/// Self-referencing allow-all group EFA traffic needs.
pub fn add_efa_security_group(
    rs: &mut ResourceSet,
    vpc: Value,
    cluster: &str,
    desc: &str,
) -> Result<Value> {
    let mut sg = Resource::new(ResourceKind::SecurityGroup)
        .with("VpcId", vpc)
        .with("GroupDescription", format!("EFA-enabled security group for {}", desc));
    owned_tag(&mut sg, cluster);
    let efa = rs.add_resource(EFA_SG_RESOURCE, sg)?;
    rs.add_resource(
        "EFAIngressSelf",
        ingress(
            efa.clone(),
            SG_PROTO_ALL,
            SG_PORT_ZERO,
            SG_MAX_NODE_PORT,
            format!("Allow {} to communicate to itself (EFA-enabled)", desc),
        )
        .with("SourceSecurityGroupId", efa.clone()),
    )?;
    rs.add_resource(
        "EFAEgressSelf",
        egress(
            efa.clone(),
            efa.clone(),
            SG_PROTO_ALL,
            SG_PORT_ZERO,
            SG_MAX_NODE_PORT,
            format!("Allow {} to communicate to itself (EFA-enabled)", desc),
        ),
    )?;
    Ok(efa)
}
