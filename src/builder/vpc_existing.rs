//! CF-030: Existing VPC.
//!
//! No network resources are created. The known IDs flow into the cluster
//! stack's outputs so node-pool stacks import them like a dedicated VPC.

use super::vpc::add_network_outputs;
use super::{Network, SubnetDetails, SubnetResource};
use crate::core::intrinsic::Value;
use crate::core::template::ResourceSet;
use crate::core::types::{ClusterConfig, SubnetSpec};
use crate::error::{Error, Result};
use crate::provider::Ec2Api;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use tracing::debug;

fn subnet_resources(
    mapping: &IndexMap<String, SubnetSpec>,
    route_tables: &BTreeMap<String, String>,
) -> Result<Vec<SubnetResource>> {
    mapping
        .iter()
        .map(|(alias, spec)| {
            let id = spec.id.as_deref().ok_or_else(|| {
                Error::missing_field(format!("vpc.subnets.{}.id", alias), "an existing VPC is used")
            })?;
            let zone = if spec.az.is_empty() { alias } else { &spec.az };
            Ok(SubnetResource {
                subnet: Value::from(id),
                availability_zone: zone.clone(),
                route_table: route_tables.get(id).map(|rt| Value::from(rt.as_str())),
            })
        })
        .collect()
}

/// Reference the configured VPC and subnets and declare the network outputs.
///
/// Route tables of private subnets are looked up only for fully-private
/// clusters, where gateway endpoints need them.
pub async fn add_existing_vpc_resources(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    ec2: &dyn Ec2Api,
) -> Result<Network> {
    let vpc_id = cfg
        .vpc
        .id
        .as_deref()
        .ok_or_else(|| Error::missing_field("vpc.id", "an existing VPC is used"))?;

    let route_tables = if cfg.is_fully_private() {
        let ids: Vec<String> = cfg
            .vpc
            .subnets
            .private
            .values()
            .filter_map(|s| s.id.clone())
            .collect();
        ec2.route_tables(&ids).await?
    } else {
        BTreeMap::new()
    };

    let subnets = SubnetDetails {
        public: subnet_resources(&cfg.vpc.subnets.public, &route_tables)?,
        private: subnet_resources(&cfg.vpc.subnets.private, &route_tables)?,
        public_local_zone: subnet_resources(&cfg.vpc.local_zone_subnets.public, &route_tables)?,
        private_local_zone: subnet_resources(&cfg.vpc.local_zone_subnets.private, &route_tables)?,
        control_plane_on_outposts: cfg.is_control_plane_on_outposts(),
    };
    if subnets.private.is_empty() && subnets.public.is_empty() {
        return Err(Error::invalid_config(format!(
            "existing VPC {} needs at least one public or private subnet",
            vpc_id
        )));
    }

    let network = Network {
        vpc: Value::from(vpc_id),
        subnets,
    };
    debug!(
        vpc = %vpc_id,
        public = network.subnets.public.len(),
        private = network.subnets.private.len(),
        "using existing VPC"
    );
    add_network_outputs(rs, cfg, &network)?;
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::{apply_defaults, parse_config};
    use crate::provider::memory::MemoryProvider;

    const EXISTING: &str = r#"
metadata:
  name: demo
  region: us-west-2
vpc:
  id: vpc-123
  subnets:
    private:
      us-west-2a: {id: subnet-a}
      us-west-2b: {id: subnet-b}
    public:
      pub-a: {id: subnet-pa, az: us-west-2a}
"#;

    fn config(yaml: &str) -> ClusterConfig {
        let mut cfg = parse_config(yaml).unwrap();
        apply_defaults(&mut cfg).unwrap();
        cfg
    }

    #[tokio::test]
    async fn test_cf030_no_resources_only_outputs() {
        let cfg = config(EXISTING);
        let ec2 = MemoryProvider::new("us-west-2");
        let mut rs = ResourceSet::new("test");
        let network = add_existing_vpc_resources(&mut rs, &cfg, &ec2).await.unwrap();
        assert_eq!(network.vpc, Value::from("vpc-123"));
        assert_eq!(network.subnets.public[0].availability_zone, "us-west-2a");
        assert!(rs.template().resources.is_empty());

        let json = serde_json::to_value(rs.template()).unwrap();
        assert_eq!(json["Outputs"]["VPC"]["Value"], "vpc-123");
        assert_eq!(
            json["Outputs"]["SubnetsPrivate"]["Value"]["Fn::Join"],
            serde_json::json!([",", ["subnet-a", "subnet-b"]])
        );
        assert_eq!(ec2.calls("route_tables"), 0);
    }

    #[tokio::test]
    async fn test_cf030_route_tables_for_fully_private() {
        let mut cfg = config(EXISTING);
        cfg.private_cluster.enabled = true;
        let ec2 = MemoryProvider::new("us-west-2")
            .with_route_table("subnet-a", "rtb-a")
            .with_route_table("subnet-b", "rtb-b");
        let mut rs = ResourceSet::new("test");
        let network = add_existing_vpc_resources(&mut rs, &cfg, &ec2).await.unwrap();
        assert_eq!(network.subnets.private[1].route_table, Some(Value::from("rtb-b")));
    }

    #[tokio::test]
    async fn test_cf030_subnet_without_id_rejected() {
        let mut cfg = config(EXISTING);
        cfg.vpc.subnets.private.insert("us-west-2c".into(), SubnetSpec::default());
        let ec2 = MemoryProvider::new("us-west-2");
        let mut rs = ResourceSet::new("test");
        let err = add_existing_vpc_resources(&mut rs, &cfg, &ec2).await.unwrap_err();
        assert!(err.to_string().contains("vpc.subnets.us-west-2c.id"));
    }
}
