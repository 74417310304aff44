//! CF-002: YAML parsing, validation and defaulting.
//!
//! Parses cluster.yaml and checks structural constraints:
//! - cluster name format and region
//! - VPC CIDR prefix between /16 and /24, subnet blocks inside the VPC
//! - unique node pool names and sane scaling bounds
//! - feature prerequisites (IPv6, EFA, fully-private clusters)

use super::types::*;
use crate::error::{Error, Result};
use crate::placement::split;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn err(errors: &mut Vec<ValidationError>, message: String) {
    errors.push(ValidationError { message });
}

/// Default node pool size when none is given.
pub const DEFAULT_DESIRED_CAPACITY: u32 = 2;
/// Default root volume size in GiB.
pub const DEFAULT_VOLUME_SIZE: u32 = 80;

/// Parse a cluster.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<ClusterConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::invalid_config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Parse a cluster.yaml from a string. Keys the schema does not know are
/// rejected rather than silently dropped.
pub fn parse_config(yaml: &str) -> Result<ClusterConfig> {
    let config: ClusterConfig = serde_yaml_ng::from_str(yaml)?;
    let document: JsonValue = serde_yaml_ng::from_str(yaml)?;
    let unknown = unknown_fields(&document);
    if !unknown.is_empty() {
        return Err(Error::invalid_config(format!(
            "unknown field(s) in cluster config: {}",
            unknown.join(", ")
        )));
    }
    Ok(config)
}

fn config_schema() -> Option<&'static JsonValue> {
    static SCHEMA: OnceLock<Option<JsonValue>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| serde_json::to_value(schemars::schema_for!(ClusterConfig)).ok())
        .as_ref()
}

/// Dotted paths of every key in `document` that the config schema does not
/// declare. Map-typed fields accept any key.
pub fn unknown_fields(document: &JsonValue) -> Vec<String> {
    let mut unknown = Vec::new();
    if let Some(root) = config_schema() {
        check_keys(root, document, root, "", &mut unknown);
    }
    unknown
}

/// Keys accepted by an object schema, merged across `allOf`/`anyOf`/`oneOf`.
#[derive(Default)]
struct Shape<'s> {
    properties: BTreeMap<&'s str, &'s JsonValue>,
    additional: Option<&'s JsonValue>,
    declared: bool,
    open: bool,
}

fn resolve<'s>(root: &'s JsonValue, schema: &'s JsonValue) -> &'s JsonValue {
    schema
        .get("$ref")
        .and_then(JsonValue::as_str)
        .and_then(|r| r.strip_prefix("#/definitions/"))
        .and_then(|name| root.get("definitions")?.get(name))
        .unwrap_or(schema)
}

fn subschemas<'s>(schema: &'s JsonValue) -> impl Iterator<Item = &'s JsonValue> {
    ["allOf", "anyOf", "oneOf"]
        .into_iter()
        .filter_map(move |key| schema.get(key).and_then(JsonValue::as_array))
        .flatten()
}

fn shape<'s>(root: &'s JsonValue, schema: &'s JsonValue, out: &mut Shape<'s>) {
    let schema = resolve(root, schema);
    if let Some(properties) = schema.get("properties").and_then(JsonValue::as_object) {
        out.declared = true;
        for (key, sub) in properties {
            out.properties.entry(key.as_str()).or_insert(sub);
        }
    }
    match schema.get("additionalProperties") {
        Some(JsonValue::Bool(true)) => out.open = true,
        Some(sub @ JsonValue::Object(_)) => out.additional = Some(sub),
        _ => {}
    }
    for sub in subschemas(schema) {
        shape(root, sub, out);
    }
}

fn items_schema<'s>(root: &'s JsonValue, schema: &'s JsonValue) -> Option<&'s JsonValue> {
    let schema = resolve(root, schema);
    match schema.get("items") {
        Some(items @ JsonValue::Object(_)) => Some(items),
        _ => subschemas(schema).find_map(|sub| items_schema(root, sub)),
    }
}

fn check_keys(
    root: &JsonValue,
    value: &JsonValue,
    schema: &JsonValue,
    path: &str,
    unknown: &mut Vec<String>,
) {
    match value {
        JsonValue::Object(map) => {
            let mut accepted = Shape::default();
            shape(root, schema, &mut accepted);
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                if let Some(sub) = accepted.properties.get(key.as_str()) {
                    check_keys(root, child, sub, &child_path, unknown);
                } else if let Some(sub) = accepted.additional {
                    check_keys(root, child, sub, &child_path, unknown);
                } else if accepted.declared && !accepted.open {
                    unknown.push(child_path);
                }
            }
        }
        JsonValue::Array(items) => {
            if let Some(sub) = items_schema(root, schema) {
                for (i, item) in items.iter().enumerate() {
                    check_keys(root, item, sub, &format!("{}[{}]", path, i), unknown);
                }
            }
        }
        _ => {}
    }
}

/// Parse, validate and default in one go. Validation errors are joined.
pub fn load_config(path: &Path) -> Result<ClusterConfig> {
    let mut config = parse_config_file(path)?;
    let errors = validate_config(&config);
    if !errors.is_empty() {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(Error::invalid_config(msgs.join("; ")));
    }
    apply_defaults(&mut config)?;
    Ok(config)
}

fn is_valid_name(name: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z][-a-zA-Z0-9]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &ClusterConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let meta = &config.metadata;

    if !is_valid_name(&meta.name) {
        err(
            &mut errors,
            format!(
                "metadata.name {:?} must start with a letter and contain only letters, digits and hyphens",
                meta.name
            ),
        );
    }
    if meta.region.is_empty() {
        err(&mut errors, "metadata.region must be set".to_string());
    }

    if let Some(cidr) = &config.vpc.cidr {
        if !(16..=24).contains(&cidr.prefix()) {
            err(
                &mut errors,
                format!("vpc.cidr {}: VPC CIDR prefix must be between /16 and /24", cidr),
            );
        }
        let mappings = [&config.vpc.subnets, &config.vpc.local_zone_subnets];
        for (alias, spec) in mappings
            .iter()
            .flat_map(|m| m.public.iter().chain(m.private.iter()))
        {
            if let Some(block) = &spec.cidr {
                if !cidr.contains(block) {
                    err(
                        &mut errors,
                        format!(
                            "subnet {:?} block {} is not inside the VPC block {}",
                            alias,
                            block,
                            cidr
                        ),
                    );
                }
            }
        }
    }

    let public_ids: BTreeSet<&str> = config
        .vpc
        .subnets
        .public
        .values()
        .filter_map(|s| s.id.as_deref())
        .collect();
    for id in config.vpc.subnets.private.values().filter_map(|s| s.id.as_deref()) {
        if public_ids.contains(id) {
            err(&mut errors, format!("subnet {} is listed as both public and private", id));
        }
    }

    let ipv6 = config.ip_family() == IpFamily::Ipv6;
    if ipv6 && !config.iam.with_oidc {
        err(&mut errors, "iam.withOIDC must be enabled for IPv6 clusters".to_string());
    }
    if ipv6 && !config.node_groups.is_empty() {
        err(
            &mut errors,
            "unmanaged nodeGroups are not supported with IPv6 clusters, use managedNodeGroups".to_string(),
        );
    }

    let mut names = BTreeSet::new();
    for pool in config.node_pools() {
        let base = pool.base();
        let name = &base.name;
        if !names.insert(name.as_str()) {
            err(&mut errors, format!("node pool {:?} is defined more than once", name));
        }
        if !is_valid_name(name) {
            err(&mut errors, format!("node pool name {:?} is invalid", name));
        }
        validate_scaling(&mut errors, name, base);

        if base.efa_enabled && pool.instance_types().is_empty() {
            err(&mut errors, format!("node pool {:?}: efaEnabled requires an instance type", name));
        }
        if config.is_fully_private() && !base.private_networking {
            err(
                &mut errors,
                format!(
                    "node pool {:?}: privateNetworking must be enabled for fully-private clusters",
                    name
                ),
            );
        }
        if !base.subnets.is_empty() && !base.availability_zones.is_empty() {
            err(
                &mut errors,
                format!(
                    "node pool {:?}: subnets and availabilityZones cannot be set at the same time",
                    name
                ),
            );
        }
        if let Some(vt) = base.volume_type {
            if base.volume_iops.is_some() && !vt.supports_iops() {
                err(
                    &mut errors,
                    format!(
                        "node pool {:?}: volumeIops is not supported for {:?} volumes",
                        name, vt
                    ),
                );
            }
            if base.volume_throughput.is_some() && !vt.supports_throughput() {
                err(
                    &mut errors,
                    format!(
                        "node pool {:?}: volumeThroughput is only supported for gp3 volumes",
                        name
                    ),
                );
            }
        }
        if let NodePool::Managed(mng) = pool {
            if base.instance_type.is_some() && !mng.instance_types.is_empty() {
                err(
                    &mut errors,
                    format!(
                        "managed node pool {:?}: instanceType and instanceTypes cannot both be set",
                        name
                    ),
                );
            }
            for taint in &mng.taints {
                if !matches!(
                    taint.effect.as_str(),
                    "NoSchedule" | "PreferNoSchedule" | "NoExecute"
                ) {
                    err(
                        &mut errors,
                        format!(
                            "managed node pool {:?}: invalid taint effect {:?}",
                            name,
                            taint.effect
                        ),
                    );
                }
            }
        }
    }

    for (i, entry) in config.access_entries.iter().enumerate() {
        if !entry.principal_arn.starts_with("arn:") {
            err(
                &mut errors,
                format!(
                    "accessEntries[{}].principalARN {:?} is not an ARN",
                    i,
                    entry.principal_arn
                ),
            );
        }
    }

    errors
}

fn validate_scaling(errors: &mut Vec<ValidationError>, name: &str, base: &NodeGroupBase) {
    if let (Some(min), Some(max)) = (base.min_size, base.max_size) {
        if min > max {
            err(
                errors,
                format!("node pool {:?}: minSize {} is greater than maxSize {}", name, min, max),
            );
        }
    }
    if let (Some(desired), Some(min)) = (base.desired_capacity, base.min_size) {
        if desired < min {
            err(
                errors,
                format!(
                    "node pool {:?}: desiredCapacity {} is less than minSize {}",
                    name, desired, min
                ),
            );
        }
    }
    if let (Some(desired), Some(max)) = (base.desired_capacity, base.max_size) {
        if desired > max {
            err(
                errors,
                format!(
                    "node pool {:?}: desiredCapacity {} is greater than maxSize {}",
                    name, desired, max
                ),
            );
        }
    }
}

/// Fill in defaults: zones, VPC block, subnet layout, pool sizes and volumes.
pub fn apply_defaults(config: &mut ClusterConfig) -> Result<()> {
    if config.availability_zones.is_empty() && config.vpc.subnets.is_empty() {
        let region = config.metadata.region.clone();
        config.availability_zones =
            ["a", "b", "c"].iter().map(|s| format!("{}{}", region, s)).collect();
    }

    for mapping in [&mut config.vpc.subnets, &mut config.vpc.local_zone_subnets] {
        for (alias, spec) in mapping.public.iter_mut().chain(mapping.private.iter_mut()) {
            if spec.az.is_empty() {
                spec.az = alias.clone();
            }
        }
    }

    if config.vpc.id.is_none() && config.vpc.subnets.is_empty() {
        split::set_subnets(config)?;
    } else if config.vpc.cidr.is_none() && config.vpc.id.is_none() {
        config.vpc.cidr = Some(crate::core::cidr::DEFAULT_VPC_CIDR);
    }

    // a dedicated VPC of an Outposts control plane puts every subnet on it
    if let (Some(outpost), None) = (&config.outpost, &config.vpc.id) {
        let arn = &outpost.control_plane_outpost_arn;
        let subnets = &mut config.vpc.subnets;
        for spec in subnets.public.values_mut().chain(subnets.private.values_mut()) {
            spec.outpost_arn = Some(arn.clone());
        }
    }

    let bases = config
        .node_groups
        .iter_mut()
        .map(|ng| &mut ng.base)
        .chain(config.managed_node_groups.iter_mut().map(|ng| &mut ng.base));
    for base in bases {
        default_pool(base);
    }
    Ok(())
}

fn default_pool(base: &mut NodeGroupBase) {
    let desired = base
        .desired_capacity
        .or(base.min_size)
        .unwrap_or(DEFAULT_DESIRED_CAPACITY);
    base.desired_capacity.get_or_insert(desired);
    base.min_size.get_or_insert(desired);
    let min = base.min_size.unwrap_or(desired);
    base.max_size.get_or_insert(desired.max(min));
    base.volume_size.get_or_insert(DEFAULT_VOLUME_SIZE);
    base.volume_type.get_or_insert(VolumeType::Gp3);
    if base.ami_family.is_empty() {
        base.ami_family = AMI_FAMILY_AL2023.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
metadata:
  name: demo
  region: us-west-2
nodeGroups:
  - name: ng-1
    instanceType: m5.large
managedNodeGroups:
  - name: mng-1
    instanceTypes: [m5.large, m6i.large]
    minSize: 1
    maxSize: 4
"#;

    #[test]
    fn test_cf002_parse_valid() {
        let config = parse_config(VALID).unwrap();
        assert_eq!(config.metadata.name, "demo");
        assert_eq!(config.node_groups.len(), 1);
        assert_eq!(config.managed_node_groups[0].instance_types.len(), 2);
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_cf002_parse_error() {
        assert!(matches!(parse_config("metadata: [").unwrap_err(), Error::Yaml(_)));
    }

    #[test]
    fn test_cf002_invalid_name_and_region() {
        let config = parse_config("metadata:\n  name: 1bad_name\n  region: \"\"\n").unwrap();
        let errors = validate_config(&config);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("must start with a letter"));
        assert!(errors[1].message.contains("region"));
    }

    #[test]
    fn test_cf002_cidr_prefix_and_subnet_containment() {
        let yaml = r#"
metadata: {name: demo, region: us-west-2}
vpc:
  cidr: 10.0.0.0/26
"#;
        let errors = validate_config(&parse_config(yaml).unwrap());
        assert!(errors[0].message.contains("between /16 and /24"));

        let yaml = r#"
metadata: {name: demo, region: us-west-2}
vpc:
  cidr: 10.0.0.0/16
  subnets:
    public:
      us-west-2a: {cidr: 10.1.0.0/19}
"#;
        let errors = validate_config(&parse_config(yaml).unwrap());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("not inside the VPC block"));
    }

    #[test]
    fn test_cf002_duplicate_pool_names_across_kinds() {
        let yaml = r#"
metadata: {name: demo, region: us-west-2}
nodeGroups: [{name: workers}]
managedNodeGroups: [{name: workers}]
"#;
        let errors = validate_config(&parse_config(yaml).unwrap());
        assert!(errors.iter().any(|e| e.message.contains("defined more than once")));
    }

    #[test]
    fn test_cf002_scaling_bounds() {
        let yaml = r#"
metadata: {name: demo, region: us-west-2}
nodeGroups: [{name: ng, minSize: 3, maxSize: 2, desiredCapacity: 5}]
"#;
        let errors = validate_config(&parse_config(yaml).unwrap());
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("minSize 3 is greater than maxSize 2"));
        assert!(errors[1].message.contains("greater than maxSize"));
    }

    #[test]
    fn test_cf002_ipv6_rules() {
        let yaml = r#"
metadata: {name: demo, region: us-west-2}
kubernetesNetworkConfig: {ipFamily: IPv6}
nodeGroups: [{name: ng}]
"#;
        let errors = validate_config(&parse_config(yaml).unwrap());
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("withOIDC"));
        assert!(errors[1].message.contains("not supported with IPv6"));
    }

    #[test]
    fn test_cf002_feature_prerequisites() {
        let yaml = r#"
metadata: {name: demo, region: us-west-2}
privateCluster: {enabled: true}
managedNodeGroups:
  - name: mng
    efaEnabled: true
    volumeType: gp2
    volumeThroughput: 200
    taints: [{key: a, value: b, effect: Sometimes}]
accessEntries:
  - principalARN: not-an-arn
"#;
        let msgs: Vec<String> = validate_config(&parse_config(yaml).unwrap())
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(msgs.iter().any(|m| m.contains("efaEnabled requires an instance type")));
        assert!(msgs.iter().any(|m| m.contains("privateNetworking must be enabled")));
        assert!(msgs.iter().any(|m| m.contains("volumeThroughput is only supported for gp3")));
        assert!(msgs.iter().any(|m| m.contains("invalid taint effect")));
        assert!(msgs.iter().any(|m| m.contains("is not an ARN")));
    }

    #[test]
    fn test_cf002_defaults_layout_and_sizes() {
        let mut config = parse_config(VALID).unwrap();
        apply_defaults(&mut config).unwrap();
        assert_eq!(config.availability_zones, vec!["us-west-2a", "us-west-2b", "us-west-2c"]);
        assert_eq!(config.vpc.cidr.unwrap().to_string(), "192.168.0.0/16");
        assert_eq!(config.vpc.subnets.public.len(), 3);
        assert_eq!(
            config.vpc.subnets.private["us-west-2c"].cidr.unwrap().to_string(),
            "192.168.160.0/19"
        );

        let ng = &config.node_groups[0].base;
        assert_eq!((ng.desired_capacity, ng.min_size, ng.max_size), (Some(2), Some(2), Some(2)));
        assert_eq!(ng.volume_size, Some(80));
        assert_eq!(ng.volume_type, Some(VolumeType::Gp3));

        let mng = &config.managed_node_groups[0].base;
        assert_eq!((mng.desired_capacity, mng.min_size, mng.max_size), (Some(1), Some(1), Some(4)));
    }

    #[test]
    fn test_cf002_defaults_keep_existing_subnets() {
        let yaml = r#"
metadata: {name: demo, region: us-west-2}
vpc:
  id: vpc-1
  subnets:
    private:
      private-one: {id: subnet-1, az: us-west-2b}
      us-west-2a: {id: subnet-2}
"#;
        let mut config = parse_config(yaml).unwrap();
        apply_defaults(&mut config).unwrap();
        assert!(config.availability_zones.is_empty());
        assert_eq!(config.vpc.subnets.private["private-one"].az, "us-west-2b");
        assert_eq!(config.vpc.subnets.private["us-west-2a"].az, "us-west-2a");
        assert!(config.vpc.cidr.is_none());
    }

    #[test]
    fn test_cf002_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.yaml");
        std::fs::write(&path, VALID).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.vpc.subnets.private.len(), 3);

        std::fs::write(&path, "metadata: {name: -x, region: r}\n").unwrap();
        assert!(load_config(&path).unwrap_err().to_string().contains("invalid cluster config"));
    }

    #[test]
    fn test_cf002_arn_keys() {
        let yaml = r#"
metadata: {name: demo, region: us-west-2}
iam:
  serviceRoleARN: arn:aws:iam::1:role/eks
outpost:
  controlPlaneOutpostARN: arn:aws:outposts:us-west-2:1:outpost/op-1
vpc:
  subnets:
    private:
      us-west-2a: {id: subnet-a, outpostARN: arn:aws:outposts:us-west-2:1:outpost/op-1}
nodeGroups:
  - name: ng
    outpostARN: arn:aws:outposts:us-west-2:1:outpost/op-1
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.iam.service_role_arn.as_deref(), Some("arn:aws:iam::1:role/eks"));
        let outpost = config.outpost.as_ref().unwrap();
        assert!(outpost.control_plane_outpost_arn.ends_with("op-1"));
        assert!(config.vpc.subnets.private["us-west-2a"].outpost_arn.is_some());
        assert!(config.node_groups[0].base.outpost_arn.is_some());
    }

    #[test]
    fn test_cf002_unknown_fields_rejected() {
        let yaml = r#"
metadata: {name: demo, region: us-west-2}
iam:
  serviceRoleArn: arn:aws:iam::1:role/eks
managedNodeGroups:
  - name: mng
    instanceTypes: [m5.large]
    labels: {team: infra}
    desiredCapasity: 3
"#;
        let err = parse_config(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("iam.serviceRoleArn"), "{message}");
        assert!(message.contains("managedNodeGroups[0].desiredCapasity"), "{message}");
        assert!(!message.contains("team"), "{message}");

        let yaml = "metadata: {name: demo, region: us-west-2}\nvpc:\n  subnets:\n    public:\n      us-west-2a: {id: subnet-a, zone: x}\n";
        let message = parse_config(yaml).unwrap_err().to_string();
        assert!(message.contains("vpc.subnets.public.us-west-2a.zone"), "{message}");
    }
}
