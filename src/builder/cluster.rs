//! CF-027: Cluster stack.
//!
//! Network, cluster security groups, endpoints for fully-private clusters,
//! the service role and the control plane, in that order. Node-pool stacks
//! import what this stack exports.

use super::iam::add_service_role;
use super::security_group::add_cluster_security_groups;
use super::vpc::add_vpc_resources;
use super::vpc_endpoint::add_vpc_endpoints;
use super::vpc_existing::add_existing_vpc_resources;
use super::vpc_ipv6::add_ipv6_vpc_resources;
use super::{
    add_service_principal_mapping, outputs, Network, CONTROL_PLANE_RESOURCE,
    TEMPLATE_DESCRIPTION_SUFFIX,
};
use crate::core::intrinsic::{Value, STACK_NAME};
use crate::core::template::{Resource, ResourceKind, ResourceSet, Taggable};
use crate::core::types::{ClusterConfig, IpFamily};
use crate::error::{Error, Result};
use crate::provider::Ec2Api;
use base64::Engine;
use std::collections::BTreeMap;
use tracing::info;

pub const AUTHENTICATION_MODE: &str = "API_AND_CONFIG_MAP";
pub const DEFAULT_OUTPOST_INSTANCE_TYPE: &str = "m5d.large";

fn resources_vpc_config(
    cfg: &ClusterConfig,
    network: &Network,
    security_groups: Vec<Value>,
) -> Value {
    let endpoints = &cfg.vpc.cluster_endpoints;
    let mut fields = BTreeMap::new();
    fields.insert(
        "SubnetIds".to_string(),
        Value::list(network.subnets.control_plane_subnet_refs()),
    );
    fields.insert("SecurityGroupIds".to_string(), Value::list(security_groups));
    fields.insert(
        "EndpointPublicAccess".to_string(),
        Value::bool(endpoints.public_access && !cfg.is_fully_private()),
    );
    fields.insert(
        "EndpointPrivateAccess".to_string(),
        Value::bool(endpoints.private_access || cfg.is_fully_private()),
    );
    if !cfg.vpc.public_access_cidrs.is_empty() {
        fields.insert(
            "PublicAccessCidrs".to_string(),
            Value::strings(cfg.vpc.public_access_cidrs.iter().cloned()),
        );
    }
    Value::Object(fields)
}

fn kubernetes_network_config(cfg: &ClusterConfig) -> Value {
    let knc = &cfg.kubernetes_network_config;
    let mut fields = BTreeMap::new();
    fields.insert("IpFamily".to_string(), Value::from(knc.ip_family.to_string()));
    if let Some(cidr) = &knc.service_ipv4_cidr {
        fields.insert("ServiceIpv4Cidr".to_string(), Value::from(cidr.as_str()));
    }
    Value::Object(fields)
}

fn logging(cfg: &ClusterConfig) -> Option<Value> {
    if !cfg.has_cluster_cloudwatch_logging() {
        return None;
    }
    let types = cfg
        .cloud_watch
        .cluster_logging
        .enable_types
        .iter()
        .map(|t| Value::object([("Type", Value::from(t.as_str()))]))
        .collect();
    Some(Value::object([(
        "ClusterLogging",
        Value::object([("EnabledTypes", Value::list(types))]),
    )]))
}

fn outpost_config(cfg: &ClusterConfig) -> Option<Value> {
    let outpost = cfg.outpost.as_ref()?;
    let instance_type = outpost
        .control_plane_instance_type
        .as_deref()
        .unwrap_or(DEFAULT_OUTPOST_INSTANCE_TYPE);
    Some(Value::object([
        (
            "OutpostArns",
            Value::strings([outpost.control_plane_outpost_arn.as_str()]),
        ),
        ("ControlPlaneInstanceType", Value::from(instance_type)),
    ]))
}

/// Decode the base64 CA bundle an output carries.
pub fn decode_certificate_authority(output: &str, value: &str) -> Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| {
            Error::collect(output, format!("decoding certificate authority data: {}", e))
        })?;
    String::from_utf8(bytes).map_err(|e| Error::collect(output, e.to_string()))
}

fn add_control_plane(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    network: &Network,
    security_groups: Vec<Value>,
    service_role: Value,
) -> Result<()> {
    let mut control_plane = Resource::new(ResourceKind::EksCluster)
        .with("Name", cfg.metadata.name.as_str())
        .with("RoleArn", service_role)
        .with("Version", cfg.metadata.version.as_str())
        .with("ResourcesVpcConfig", resources_vpc_config(cfg, network, security_groups))
        .with("KubernetesNetworkConfig", kubernetes_network_config(cfg))
        .with("BootstrapSelfManagedAddons", false)
        .with(
            "AccessConfig",
            Value::object([
                ("AuthenticationMode", Value::from(AUTHENTICATION_MODE)),
                ("BootstrapClusterCreatorAdminPermissions", Value::bool(true)),
            ]),
        )
        .with_opt("Logging", logging(cfg))
        .with_opt("OutpostConfig", outpost_config(cfg));
    if let Some(mut tagged) = control_plane.taggable() {
        for (k, v) in &cfg.metadata.tags {
            tagged.set_tag(k, Value::from(v.as_str()));
        }
    }
    rs.add_resource(CONTROL_PLANE_RESOURCE, control_plane)?;

    rs.define_optional_output(
        outputs::CLUSTER_CERTIFICATE_AUTHORITY_DATA,
        Value::get_att(CONTROL_PLANE_RESOURCE, "CertificateAuthorityData"),
        false,
        |v, cfg| {
            let pem = decode_certificate_authority(outputs::CLUSTER_CERTIFICATE_AUTHORITY_DATA, v)?;
            cfg.status_mut().certificate_authority_data = Some(pem);
            Ok(())
        },
    )?;
    rs.define_output_from_att(
        outputs::CLUSTER_ENDPOINT,
        CONTROL_PLANE_RESOURCE,
        "Endpoint",
        true,
        |v, cfg| {
            cfg.status_mut().endpoint = Some(v.to_string());
            Ok(())
        },
    )?;
    rs.define_output_from_att(outputs::CLUSTER_ARN, CONTROL_PLANE_RESOURCE, "Arn", true, |v, cfg| {
        cfg.status_mut().arn = Some(v.to_string());
        Ok(())
    })?;
    rs.define_output_from_att(
        outputs::CLUSTER_DEFAULT_SECURITY_GROUP,
        CONTROL_PLANE_RESOURCE,
        "ClusterSecurityGroupId",
        true,
        |v, cfg| {
            cfg.status_mut().cluster_security_group_id = Some(v.to_string());
            Ok(())
        },
    )
}

/// Resources and outputs of the cluster stack.
pub async fn build_cluster_stack(cfg: &ClusterConfig, ec2: &dyn Ec2Api) -> Result<ResourceSet> {
    let dedicated_vpc = cfg.vpc.id.is_none();
    let dedicated_iam = cfg.iam.service_role_arn.is_none();
    let mut rs = ResourceSet::new(format!(
        "EKS cluster (dedicated VPC: {}, dedicated IAM: {}) {}",
        dedicated_vpc, dedicated_iam, TEMPLATE_DESCRIPTION_SUFFIX
    ));

    let network = if !dedicated_vpc {
        add_existing_vpc_resources(&mut rs, cfg, ec2).await?
    } else if cfg.ip_family() == IpFamily::Ipv6 {
        add_ipv6_vpc_resources(&mut rs, cfg)?
    } else {
        add_vpc_resources(&mut rs, cfg)?
    };

    let security_groups = add_cluster_security_groups(&mut rs, cfg, &network.vpc)?;

    if cfg.is_fully_private() && !cfg.private_cluster.skip_endpoint_creation {
        add_vpc_endpoints(&mut rs, cfg, &network, &security_groups.shared_node, ec2).await?;
    }

    let service_role = add_service_role(&mut rs, cfg)?;
    add_control_plane(
        &mut rs,
        cfg,
        &network,
        security_groups.control_plane_ids,
        service_role,
    )?;

    rs.define_output(
        outputs::CLUSTER_STACK_NAME,
        Value::reference(STACK_NAME),
        false,
        |v, cfg| {
            cfg.status_mut().stack_name = Some(v.to_string());
            Ok(())
        },
    )?;
    add_service_principal_mapping(&mut rs);

    info!(
        cluster = %cfg.metadata.name,
        dedicated_vpc,
        dedicated_iam,
        ip_family = %cfg.ip_family(),
        "built cluster stack"
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
            "metadata:\n  name: demo\n  region: us-west-2\n  tags: {{owner: infra}}\n{}",
            extra
        );
        let mut cfg = parse_config(&yaml).unwrap();
        apply_defaults(&mut cfg).unwrap();
        cfg
    }

    async fn render(cfg: &ClusterConfig) -> serde_json::Value {
        let ec2 = MemoryProvider::new("us-west-2");
        build_cluster_stack(cfg, &ec2)
            .await
            .unwrap()
            .finish()
            .unwrap()
            .to_json()
            .unwrap()
    }

    #[tokio::test]
    async fn test_cf027_control_plane() {
        let json = render(&config("")).await;
        assert_eq!(
            json["Description"],
            "EKS cluster (dedicated VPC: true, dedicated IAM: true) [created by clusterforge]"
        );
        let cp = &json["Resources"]["ControlPlane"];
        assert_eq!(cp["Type"], "AWS::EKS::Cluster");
        let p = &cp["Properties"];
        assert_eq!(p["Name"], "demo");
        assert_eq!(p["RoleArn"]["Fn::GetAtt"], serde_json::json!(["ServiceRole", "Arn"]));
        assert_eq!(p["KubernetesNetworkConfig"]["IpFamily"], "ipv4");
        assert_eq!(p["AccessConfig"]["AuthenticationMode"], "API_AND_CONFIG_MAP");
        assert_eq!(p["ResourcesVpcConfig"]["SubnetIds"].as_array().unwrap().len(), 6);
        assert_eq!(p["ResourcesVpcConfig"]["EndpointPublicAccess"], true);
        assert_eq!(
            p["ResourcesVpcConfig"]["SecurityGroupIds"],
            serde_json::json!([{"Ref": "ControlPlaneSecurityGroup"}])
        );
        let tags = p["Tags"].as_array().unwrap();
        assert!(tags.iter().any(|t| t["Key"] == "owner" && t["Value"] == "infra"));
        assert!(p.get("Logging").is_none());

        let outputs = &json["Outputs"];
        for name in [
            "Endpoint",
            "ARN",
            "ClusterSecurityGroupId",
            "VPC",
            "SecurityGroup",
            "SharedNodeSecurityGroup",
        ] {
            assert!(outputs[name]["Export"].is_object(), "{} should be exported", name);
        }
        assert!(outputs["CertificateAuthorityData"]["Export"].is_null());
        assert_eq!(outputs["ClusterStackName"]["Value"]["Ref"], "AWS::StackName");
        assert!(json["Mappings"]["ServicePrincipalPartitionMap"].is_object());
    }

    #[tokio::test]
    async fn test_cf027_existing_vpc_and_role() {
        let cfg = config(
            "iam:\n  serviceRoleARN: arn:aws:iam::123:role/eks\nvpc:\n  id: vpc-1\n  subnets:\n    private:\n      us-west-2a: {id: subnet-a}\n",
        );
        let json = render(&cfg).await;
        assert_eq!(
            json["Description"],
            "EKS cluster (dedicated VPC: false, dedicated IAM: false) [created by clusterforge]"
        );
        assert!(json["Resources"].get("VPC").is_none());
        assert!(json["Resources"].get("ServiceRole").is_none());
        let p = &json["Resources"]["ControlPlane"]["Properties"];
        assert_eq!(p["RoleArn"], "arn:aws:iam::123:role/eks");
        assert_eq!(p["ResourcesVpcConfig"]["SubnetIds"], serde_json::json!(["subnet-a"]));
    }

    #[tokio::test]
    async fn test_cf027_fully_private_gets_endpoints() {
        let json = render(&config("privateCluster:\n  enabled: true\n")).await;
        let res = json["Resources"].as_object().unwrap();
        assert!(res.contains_key("VPCEndpointS3"));
        assert!(!res.contains_key("InternetGateway"));
        let vpc_config = &json["Resources"]["ControlPlane"]["Properties"]["ResourcesVpcConfig"];
        assert_eq!(vpc_config["EndpointPublicAccess"], false);
        assert_eq!(vpc_config["EndpointPrivateAccess"], true);

        let cfg = config("privateCluster:\n  enabled: true\n  skipEndpointCreation: true\n");
        let skipped = render(&cfg).await;
        assert!(!skipped["Resources"].as_object().unwrap().contains_key("VPCEndpointS3"));
    }

    #[tokio::test]
    async fn test_cf027_logging_and_ipv6() {
        let cfg = config(
            "cloudWatch:\n  clusterLogging:\n    enableTypes: [api, audit]\nkubernetesNetworkConfig:\n  ipFamily: IPv6\n",
        );
        let json = render(&cfg).await;
        let p = &json["Resources"]["ControlPlane"]["Properties"];
        assert_eq!(p["KubernetesNetworkConfig"]["IpFamily"], "ipv6");
        assert_eq!(p["Logging"]["ClusterLogging"]["EnabledTypes"][1]["Type"], "audit");
    }

    #[test]
    fn test_cf027_certificate_authority_decoded() {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode("-----BEGIN CERTIFICATE-----");
        assert_eq!(
            decode_certificate_authority("CertificateAuthorityData", &encoded).unwrap(),
            "-----BEGIN CERTIFICATE-----"
        );
        let err = decode_certificate_authority("CertificateAuthorityData", "%%%").unwrap_err();
        assert!(matches!(err, Error::Collect { .. }));
    }

    #[tokio::test]
    async fn test_cf027_collectors_fill_status() {
        let cfg = config("");
        let ec2 = MemoryProvider::new("us-west-2");
        let rendered = build_cluster_stack(&cfg, &ec2).await.unwrap().finish().unwrap();
        let live: BTreeMap<String, String> = [
            ("VPC", "vpc-9"),
            ("SecurityGroup", "sg-cp"),
            ("SharedNodeSecurityGroup", "sg-shared"),
            ("ClusterSecurityGroupId", "sg-default"),
            ("Endpoint", "https://example.eks"),
            ("ARN", "arn:aws:eks:us-west-2:1:cluster/demo"),
            ("ServiceRoleARN", "arn:aws:iam::1:role/svc"),
            ("ClusterStackName", "clusterforge-demo-cluster"),
            ("SubnetsPrivate", "subnet-1,subnet-2,subnet-3"),
            ("SubnetsPublic", "subnet-4,subnet-5,subnet-6"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let mut updated = cfg.clone();
        rendered
            .outputs
            .collect("clusterforge-demo-cluster", &live, &mut updated)
            .unwrap();
        let status = updated.status.unwrap();
        assert_eq!(status.endpoint.as_deref(), Some("https://example.eks"));
        assert_eq!(status.cluster_security_group_id.as_deref(), Some("sg-default"));
        assert_eq!(status.stack_name.as_deref(), Some("clusterforge-demo-cluster"));
        assert!(status.certificate_authority_data.is_none());
        assert_eq!(updated.vpc.id.as_deref(), Some("vpc-9"));
        assert_eq!(
            updated.vpc.subnets.private.values().next().unwrap().id.as_deref(),
            Some("subnet-1")
        );
    }
}
