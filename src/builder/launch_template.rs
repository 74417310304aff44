//! CF-024: Launch template data for node pools.
//!
//! Launch template data is assembled as a flat field map so that a fetched
//! external template can be layered under locally computed overrides.

use super::security_group::{add_efa_security_group, ssh_ingress_rules};
use super::{outputs, ClusterImports};
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet};
use crate::core::types::{
    ClusterConfig, ManagedNodeGroup, NodeGroup, NodeGroupBase, AMI_FAMILY_AL2, AMI_FAMILY_AL2023,
    AMI_FAMILY_BOTTLEROCKET,
};
use crate::error::{Error, Result};
use crate::provider::{Ec2Api, LaunchTemplateData};
use base64::Engine;
use std::collections::BTreeMap;
use tracing::debug;

pub const UNMANAGED_LAUNCH_TEMPLATE_RESOURCE: &str = "NodeGroupLaunchTemplate";
pub const MANAGED_LAUNCH_TEMPLATE_RESOURCE: &str = "LaunchTemplate";
pub const PLACEMENT_GROUP_RESOURCE: &str = "NodeGroupPlacementGroup";
pub const SSH_SG_RESOURCE: &str = "SSH";
pub const DEFAULT_DEVICE_NAME: &str = "/dev/xvda";

const USER_DATA_BOUNDARY: &str = "//";

// ============================================================================
// Instance type classes
// ============================================================================

fn family(instance_type: &str) -> &str {
    instance_type.split('.').next().unwrap_or(instance_type)
}

/// Graviton families: `a1` and any family with a `g` after the generation digit.
pub fn is_arm(instance_type: &str) -> bool {
    let family = family(instance_type);
    if family == "a1" {
        return true;
    }
    let Some(digit) = family.find(|c: char| c.is_ascii_digit()) else {
        return false;
    };
    family[digit..]
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .contains('g')
}

pub fn is_arm_gpu(instance_type: &str) -> bool {
    family(instance_type) == "g5g"
}

pub fn is_nvidia(instance_type: &str) -> bool {
    matches!(
        family(instance_type),
        "p2"
            | "p3"
            | "p3dn"
            | "p4d"
            | "p4de"
            | "p5"
            | "p5e"
            | "g3"
            | "g3s"
            | "g4dn"
            | "g5"
            | "g5g"
            | "g6"
            | "g6e"
            | "gr6"
    )
}

pub fn is_neuron(instance_type: &str) -> bool {
    matches!(family(instance_type), "inf1" | "inf2" | "trn1" | "trn1n" | "trn2")
}

pub fn is_gpu(instance_type: &str) -> bool {
    is_nvidia(instance_type) || is_neuron(instance_type)
}

// ============================================================================
// Launch template data
// ============================================================================

/// Field map of `LaunchTemplateData`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateData {
    fields: BTreeMap<String, Value>,
}

impl TemplateData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn set_opt<V: Into<Value>>(&mut self, key: &str, value: Option<V>) {
        if let Some(v) = value {
            self.set(key, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Data of a fetched external launch template.
    pub fn from_fetched(fetched: &LaunchTemplateData) -> Self {
        let mut data = Self::new();
        data.set_opt("InstanceType", fetched.instance_type.clone());
        data.set_opt("ImageId", fetched.image_id.clone());
        data.set_opt("UserData", fetched.user_data.clone());
        data.set_opt("KeyName", fetched.key_name.clone());
        data.set_opt("EbsOptimized", fetched.ebs_optimized);
        if !fetched.security_group_ids.is_empty() {
            data.set(
                "SecurityGroupIds",
                Value::strings(fetched.security_group_ids.iter().cloned()),
            );
        }
        if !fetched.tag_specifications.is_empty() {
            let specs = fetched
                .tag_specifications
                .iter()
                .map(|(resource_type, tags)| {
                    let tags = tags.iter().map(|(k, v)| (k.clone(), v.clone()));
                    tag_specification(resource_type, tags)
                })
                .collect();
            data.set("TagSpecifications", Value::list(specs));
        }
        data
    }

    /// Layer `overrides` on top. Security groups of both sides are kept,
    /// fetched ones first; every other field set locally wins.
    pub fn merge(mut self, overrides: TemplateData) -> Self {
        for (key, value) in overrides.fields {
            if key == "SecurityGroupIds" {
                if let (Some(Value::List(existing)), Value::List(extra)) = (
                    self.fields.get_mut(&key),
                    &value,
                ) {
                    for sg in extra {
                        if !existing.contains(sg) {
                            existing.push(sg.clone());
                        }
                    }
                    continue;
                }
            }
            self.fields.insert(key, value);
        }
        self
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// `<cluster>-<pool>-Node`, the instance `Name` tag.
pub fn node_name(cfg: &ClusterConfig, pool: &NodeGroupBase) -> String {
    format!("{}-{}-Node", cfg.metadata.name, pool.name)
}

fn tag_specification(resource_type: &str, tags: impl Iterator<Item = (String, String)>) -> Value {
    let tags = tags
        .map(|(k, v)| Value::object([("Key", Value::from(k)), ("Value", Value::from(v))]))
        .collect();
    Value::object([
        ("ResourceType", Value::from(resource_type)),
        ("Tags", Value::list(tags)),
    ])
}

/// Instance tags: the node name first, then the pool's tags.
pub fn tag_specifications(cfg: &ClusterConfig, pool: &NodeGroupBase) -> Value {
    let tags = std::iter::once(("Name".to_string(), node_name(cfg, pool)))
        .chain(pool.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    Value::list(vec![tag_specification("instance", tags)])
}

/// IMDS options. Tokens are required once IMDSv1 or pod access is disabled;
/// disabling pod access also drops the hop limit to one.
pub fn metadata_options(pool: &NodeGroupBase) -> Value {
    let tokens = if pool.disable_imdsv1 || pool.disable_pod_imds {
        "required"
    } else {
        "optional"
    };
    let hop_limit = if pool.disable_pod_imds { 1 } else { 2 };
    Value::object([
        ("HttpPutResponseHopLimit", Value::int(hop_limit)),
        ("HttpTokens", Value::from(tokens)),
    ])
}

/// Root volume mapping. IOPS only for io1/io2/gp3, throughput only for gp3.
pub fn block_device_mappings(pool: &NodeGroupBase) -> Option<Value> {
    let size = pool.volume_size.filter(|s| *s > 0)?;
    let mut ebs = BTreeMap::new();
    ebs.insert("VolumeSize".to_string(), Value::int(i64::from(size)));
    if let Some(vt) = pool.volume_type {
        ebs.insert("VolumeType".to_string(), Value::from(vt.to_string()));
        if let (true, Some(iops)) = (vt.supports_iops(), pool.volume_iops) {
            ebs.insert("Iops".to_string(), Value::int(i64::from(iops)));
        }
        if let (true, Some(throughput)) = (vt.supports_throughput(), pool.volume_throughput) {
            ebs.insert("Throughput".to_string(), Value::int(i64::from(throughput)));
        }
    }
    if let Some(encrypted) = pool.volume_encrypted {
        ebs.insert("Encrypted".to_string(), Value::bool(encrypted));
    }
    if let Some(key) = &pool.volume_kms_key_id {
        ebs.insert("KmsKeyId".to_string(), Value::from(key.as_str()));
    }
    let device = pool.volume_name.as_deref().unwrap_or(DEFAULT_DEVICE_NAME);
    Some(Value::list(vec![Value::object([
        ("DeviceName", Value::from(device)),
        ("Ebs", Value::Object(ebs)),
    ])]))
}

pub fn capacity_reservation(pool: &NodeGroupBase) -> Option<Value> {
    let reservation = pool.capacity_reservation.as_ref()?;
    let mut spec = BTreeMap::new();
    if let Some(pref) = &reservation.preference {
        spec.insert("CapacityReservationPreference".to_string(), Value::from(pref.as_str()));
    }
    if let Some(target) = &reservation.target {
        let mut t = BTreeMap::new();
        if let Some(id) = &target.capacity_reservation_id {
            t.insert("CapacityReservationId".to_string(), Value::from(id.as_str()));
        }
        if let Some(arn) = &target.capacity_reservation_resource_group_arn {
            t.insert("CapacityReservationResourceGroupArn".to_string(), Value::from(arn.as_str()));
        }
        spec.insert("CapacityReservationTarget".to_string(), Value::Object(t));
    }
    Some(Value::Object(spec))
}

/// Base64 MIME multipart user data with one shell part per script.
/// `None` when there is nothing to run.
pub fn user_data(scripts: &[String]) -> Option<String> {
    if scripts.is_empty() {
        return None;
    }
    let mut body = String::new();
    body.push_str("MIME-Version: 1.0\r\n");
    body.push_str(&format!(
        "Content-Type: multipart/mixed; boundary={}\r\n\r\n",
        USER_DATA_BOUNDARY
    ));
    for script in scripts {
        body.push_str(&format!("--{}\r\n", USER_DATA_BOUNDARY));
        body.push_str("Content-Type: text/x-shellscript; charset=\"us-ascii\"\r\n\r\n");
        body.push_str(script);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{}--\r\n", USER_DATA_BOUNDARY));
    Some(base64::engine::general_purpose::STANDARD.encode(body))
}

/// Image for a pool: the configured AMI, else the family's SSM alias.
pub fn image_id(cfg: &ClusterConfig, pool: &NodeGroupBase, instance_type: &str) -> Result<Value> {
    if let Some(ami) = &pool.ami {
        return Ok(Value::from(ami.as_str()));
    }
    let version = &cfg.metadata.version;
    let arch = if is_arm(instance_type) { "arm64" } else { "x86_64" };
    let parameter = match pool.ami_family.as_str() {
        AMI_FAMILY_AL2023 => {
            let flavour = if is_nvidia(instance_type) {
                "nvidia"
            } else if is_neuron(instance_type) {
                "neuron"
            } else {
                "standard"
            };
            format!(
                "/aws/service/eks/optimized-ami/{}/amazon-linux-2023/{}/{}/recommended/image_id",
                version, arch, flavour
            )
        }
        AMI_FAMILY_AL2 => {
            let suffix = if is_gpu(instance_type) {
                "-gpu"
            } else if arch == "arm64" {
                "-arm64"
            } else {
                ""
            };
            format!(
                "/aws/service/eks/optimized-ami/{}/amazon-linux-2{}/recommended/image_id",
                version,
                suffix
            )
        }
        AMI_FAMILY_BOTTLEROCKET => {
            let variant = if is_nvidia(instance_type) { "-nvidia" } else { "" };
            format!(
                "/aws/service/bottlerocket/aws-k8s-{}{}/{}/latest/image_id",
                version,
                variant,
                arch
            )
        }
        other => {
            return Err(Error::missing_field(
                "ami",
                format!("image family {} without a resolvable image", other),
            ))
        }
    };
    Ok(Value::from(format!("resolve:ssm:{}", parameter)))
}

/// Network cards an EFA pool can use: the minimum across its instance types.
pub async fn efa_network_cards(ec2: &dyn Ec2Api, instance_types: &[String]) -> Result<u32> {
    let infos = ec2.instance_types(instance_types).await?;
    let mut cards = u32::MAX;
    for info in &infos {
        if !info.efa_supported {
            return Err(Error::UnsupportedInstance {
                instance_type: info.instance_type.clone(),
                reason: "does not support EFA".to_string(),
            });
        }
        cards = cards.min(info.max_network_cards);
    }
    if infos.is_empty() {
        return Err(Error::missing_field("instanceType", "EFA networking"));
    }
    Ok(cards.max(1))
}

fn network_interface(groups: &[Value], device: i64, card: Option<i64>, efa: bool) -> Value {
    let mut ni = BTreeMap::new();
    ni.insert("DeviceIndex".to_string(), Value::int(device));
    ni.insert("Groups".to_string(), Value::list(groups.to_vec()));
    if let Some(card) = card {
        ni.insert("NetworkCardIndex".to_string(), Value::int(card));
    }
    if efa {
        ni.insert("InterfaceType".to_string(), Value::from("efa"));
    }
    Value::Object(ni)
}

/// One interface carrying the groups, or one EFA interface per network card.
pub fn network_interfaces(groups: &[Value], efa_cards: Option<u32>) -> Value {
    match efa_cards {
        None => Value::list(vec![network_interface(groups, 0, None, false)]),
        Some(cards) => {
            let mut nis = vec![network_interface(groups, 0, None, true)];
            // only the first card sits on device index 0
            for i in 1..i64::from(cards) {
                nis.push(network_interface(groups, i, Some(i), true));
            }
            Value::list(nis)
        }
    }
}

fn placement(rs: &mut ResourceSet, pool: &NodeGroupBase) -> Result<Option<Value>> {
    if let Some(p) = &pool.placement {
        return Ok(Some(Value::object([("GroupName", Value::from(p.group_name.as_str()))])));
    }
    if pool.efa_enabled {
        let group = rs.add_resource(
            PLACEMENT_GROUP_RESOURCE,
            Resource::new(ResourceKind::PlacementGroup).with("Strategy", "cluster"),
        )?;
        return Ok(Some(Value::object([("GroupName", group)])));
    }
    Ok(None)
}

/// Register the launch template resource and return its reference.
pub fn add_launch_template(rs: &mut ResourceSet, name: &str, data: TemplateData) -> Result<Value> {
    rs.add_resource(
        name,
        Resource::new(ResourceKind::LaunchTemplate)
            .with("LaunchTemplateName", Value::sub("${AWS::StackName}"))
            .with("LaunchTemplateData", data.into_value()),
    )
}

/// Data for an unmanaged pool's template.
pub fn unmanaged_launch_template_data(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    ng: &NodeGroup,
    instance_profile: Value,
    security_groups: &[Value],
    efa_cards: Option<u32>,
) -> Result<TemplateData> {
    let pool = &ng.base;
    let instance_type = ng
        .instances_distribution
        .as_ref()
        .and_then(|d| d.instance_types.first())
        .or(pool.instance_type.as_ref())
        .ok_or_else(|| Error::missing_field("instanceType", format!("node group {}", pool.name)))?;

    let mut scripts = pool.pre_bootstrap_commands.clone();
    if pool.ami_family == AMI_FAMILY_AL2 {
        scripts.push(format!("#!/bin/bash\n/etc/eks/bootstrap.sh {}", cfg.metadata.name));
    }

    let mut data = TemplateData::new();
    data.set("IamInstanceProfile", Value::object([("Arn", instance_profile)]));
    data.set("ImageId", image_id(cfg, pool, instance_type)?);
    data.set_opt("UserData", user_data(&scripts));
    data.set("MetadataOptions", metadata_options(pool));
    data.set("TagSpecifications", tag_specifications(cfg, pool));
    data.set_opt("CapacityReservationSpecification", capacity_reservation(pool));
    data.set("NetworkInterfaces", network_interfaces(security_groups, efa_cards));
    data.set_opt("Placement", placement(rs, pool)?);
    data.set("InstanceType", instance_type.as_str());
    data.set_opt("EbsOptimized", pool.ebs_optimized);
    data.set_opt("KeyName", pool.ssh.public_key_name.clone());
    data.set_opt("BlockDeviceMappings", block_device_mappings(pool));
    Ok(data)
}

/// Data for a managed pool's template. The managed service supplies the
/// instance profile and, without a custom AMI, the image and bootstrap.
pub fn managed_launch_template_data(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    mng: &ManagedNodeGroup,
    imports: &ClusterImports,
    efa_cards: Option<u32>,
) -> Result<TemplateData> {
    let pool = &mng.base;
    let mut data = TemplateData::new();
    data.set("TagSpecifications", tag_specifications(cfg, pool));
    data.set("MetadataOptions", metadata_options(pool));
    data.set_opt("UserData", user_data(&pool.pre_bootstrap_commands));

    let mut groups = vec![Value::import_output(
        &imports.cluster_stack,
        outputs::CLUSTER_DEFAULT_SECURITY_GROUP,
    )];
    groups.extend(pool.security_groups.attach_ids.iter().map(|id| Value::from(id.as_str())));

    data.set_opt("ImageId", pool.ami.clone());

    if let Some(key) = &pool.ssh.public_key_name {
        data.set("KeyName", key.as_str());
        if pool.ssh.allow {
            let desc = format!("worker nodes in group {}", pool.name);
            let ssh = rs.add_resource(
                SSH_SG_RESOURCE,
                Resource::new(ResourceKind::SecurityGroup)
                    .with("GroupName", Value::sub("${AWS::StackName}-remoteAccess"))
                    .with("VpcId", imports.vpc())
                    .with("GroupDescription", "Allow SSH access")
                    .with(
                        "SecurityGroupIngress",
                        Value::list(ssh_ingress_rules(cfg, pool, &desc)?),
                    ),
            )?;
            groups.push(ssh);
        }
    }

    if efa_cards.is_some() {
        let desc = format!("managed node group {}", pool.name);
        groups.push(add_efa_security_group(rs, imports.vpc(), &cfg.metadata.name, &desc)?);
        data.set("NetworkInterfaces", network_interfaces(&groups, efa_cards));
    } else {
        data.set("SecurityGroupIds", Value::list(groups));
    }
    data.set_opt("EbsOptimized", pool.ebs_optimized);
    data.set_opt("BlockDeviceMappings", block_device_mappings(pool));
    data.set_opt("CapacityReservationSpecification", capacity_reservation(pool));
    data.set_opt("Placement", placement(rs, pool)?);
    debug!(pool = %pool.name, fields = data.fields.len(), "managed launch template data");
    Ok(data)
}

/// Rules an external launch template must satisfy for a managed pool.
pub fn validate_launch_template(
    fetched: &LaunchTemplateData,
    mng: &ManagedNodeGroup,
) -> Result<()> {
    match &fetched.instance_type {
        None if mng.instance_types.is_empty() => {
            return Err(Error::invalid_config(
                "instance type must be set in the launch template if managedNodeGroup.instanceTypes is not specified",
            ))
        }
        Some(_) if !mng.instance_types.is_empty() => {
            return Err(Error::invalid_config(
                "instance type must not be set in the launch template if managedNodeGroup.instanceTypes is specified",
            ))
        }
        _ => {}
    }
    if fetched.image_id.is_some() {
        if fetched.user_data.is_none() {
            return Err(Error::invalid_config(
                "node bootstrapping script (UserData) must be set when using a custom AMI",
            ));
        }
        if mng.base.ami.is_some() {
            return Err(Error::invalid_config(
                "cannot set managedNodeGroup.ami when launchTemplate.ImageId is set",
            ));
        }
        if mng.release_version.is_some() {
            return Err(Error::invalid_config(
                "cannot set managedNodeGroup.releaseVersion when launchTemplate.ImageId is set",
            ));
        }
    }
    if fetched.iam_instance_profile.is_some() {
        return Err(Error::invalid_config(
            "IAM instance profile must not be set in the launch template",
        ));
    }
    Ok(())
}
