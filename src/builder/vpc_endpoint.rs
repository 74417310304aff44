//! CF-029: VPC endpoints for fully-private clusters.
//!
//! Nodes without internet egress reach the registry, EC2, STS and S3 through
//! endpoints. Gateway endpoints attach to the private route tables; interface
//! endpoints land in the private subnets of the zones the service offers.

use super::Network;
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet};
use crate::core::types::ClusterConfig;
use crate::error::{Error, Result};
use crate::provider::{Ec2Api, EndpointType};
use tracing::{debug, info};

/// Services every fully-private cluster needs.
pub const REQUIRED_ENDPOINT_SERVICES: [&str; 5] = ["ec2", "ecr.api", "ecr.dkr", "s3", "sts"];

/// Services a config may add.
pub const OPTIONAL_ENDPOINT_SERVICES: [&str; 3] = ["cloudformation", "autoscaling", "logs"];

const LOGS_SERVICE: &str = "logs";

/// Short service names to create endpoints for, required ones first.
pub fn endpoint_services(cfg: &ClusterConfig) -> Result<Vec<String>> {
    let mut services: Vec<String> =
        REQUIRED_ENDPOINT_SERVICES.iter().map(|s| s.to_string()).collect();
    for extra in &cfg.private_cluster.additional_endpoint_services {
        if !OPTIONAL_ENDPOINT_SERVICES.contains(&extra.as_str()) {
            return Err(Error::invalid_config(format!(
                "unsupported endpoint service {:?}, supported services: {}",
                extra,
                OPTIONAL_ENDPOINT_SERVICES.join(", ")
            )));
        }
        if !services.contains(extra) {
            services.push(extra.clone());
        }
    }
    if cfg.has_cluster_cloudwatch_logging() && !services.iter().any(|s| s == LOGS_SERVICE) {
        services.push(LOGS_SERVICE.to_string());
    }
    Ok(services)
}

/// Fully qualified service name in the cluster's region.
pub fn service_name(region: &str, service: &str) -> String {
    let prefix = if region.starts_with("cn-") {
        "cn.com.amazonaws"
    } else {
        "com.amazonaws"
    };
    format!("{}.{}.{}", prefix, region, service)
}

/// `VPCEndpoint` + upper-cased service name without dots.
pub fn endpoint_resource_name(service: &str) -> String {
    format!("VPCEndpoint{}", service.to_uppercase().replace('.', ""))
}

/// Add one endpoint per service.
pub async fn add_vpc_endpoints(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    network: &Network,
    shared_node_security_group: &Value,
    ec2: &dyn Ec2Api,
) -> Result<()> {
    let services = endpoint_services(cfg)?;
    let region = &cfg.metadata.region;
    let full_names: Vec<String> = services.iter().map(|s| service_name(region, s)).collect();
    let offered = ec2.endpoint_services(&full_names).await?;

    for (service, full_name) in services.iter().zip(&full_names) {
        let details = offered
            .iter()
            .find(|o| &o.service_name == full_name)
            .ok_or_else(|| {
                Error::invalid_config(format!(
                    "endpoint service {} is not available in {}",
                    full_name, region
                ))
            })?;

        let endpoint = Resource::new(ResourceKind::VpcEndpoint)
            .with("ServiceName", full_name.as_str())
            .with("VpcId", network.vpc.clone());
        let endpoint = match details.endpoint_type {
            EndpointType::Gateway => {
                let mut tables: Vec<Value> = Vec::new();
                for rt in network.subnets.private.iter().filter_map(|s| s.route_table.clone()) {
                    if !tables.contains(&rt) {
                        tables.push(rt);
                    }
                }
                endpoint
                    .with("VpcEndpointType", "Gateway")
                    .with("RouteTableIds", Value::list(tables))
            }
            EndpointType::Interface => {
                let subnets: Vec<Value> = network
                    .subnets
                    .private
                    .iter()
                    .filter(|s| details.availability_zones.contains(&s.availability_zone))
                    .map(|s| s.subnet.clone())
                    .collect();
                if subnets.is_empty() {
                    return Err(Error::invalid_config(format!(
                        "endpoint service {} is not offered in any zone of the cluster's private subnets",
                        full_name
                    )));
                }
                endpoint
                    .with("VpcEndpointType", "Interface")
                    .with("SubnetIds", Value::list(subnets))
                    .with("PrivateDnsEnabled", true)
                    .with("SecurityGroupIds", Value::list(vec![shared_node_security_group.clone()]))
            }
        };
        rs.add_resource(&endpoint_resource_name(service), endpoint)?;
        debug!(service = %full_name, "added VPC endpoint");
    }
    info!(count = services.len(), "VPC endpoints for fully-private cluster");
    Ok(())
}
