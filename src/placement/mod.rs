//! CF-013: Node pool subnet placement.
//!
//! Resolution order for one pool:
//! 1. explicit `subnets` (aliases, IDs of the cluster mapping, or foreign IDs)
//! 2. the pool's own zone list (`localZones` for unmanaged pools)
//! 3. the outpost subnets of the cluster mapping, for an Outposts pool
//!    under a cloud control plane
//! 4. every subnet of the cluster mapping
//!
//! Zones that do not offer every requested instance type are dropped for
//! unmanaged pools and rejected for managed ones. EFA pools end up with one
//! subnet.

pub mod split;

use crate::core::types::{ClusterConfig, ClusterSubnets, NodePool, SubnetSpec, SubnetTopology};
use crate::error::{Error, Result};
use crate::provider::{Ec2Api, ZoneType};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Where a resolved subnet lives.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placed {
    id: String,
    zone: String,
    outpost_arn: Option<String>,
}

struct Selector<'a> {
    ec2: &'a dyn Ec2Api,
    cfg: &'a ClusterConfig,
    pool: NodePool<'a>,
    topology: SubnetTopology,
    instance_types: Vec<String>,
    zone_types: BTreeMap<String, ZoneType>,
}

/// Subnet IDs a node pool launches into.
pub async fn select_subnets(
    ec2: &dyn Ec2Api,
    cfg: &ClusterConfig,
    pool: NodePool<'_>,
) -> Result<Vec<String>> {
    let base = pool.base();
    let selector = Selector {
        ec2,
        cfg,
        pool,
        topology: if base.private_networking {
            SubnetTopology::Private
        } else {
            SubnetTopology::Public
        },
        instance_types: pool.instance_types(),
        zone_types: ec2.zone_types(&cfg.metadata.region).await?,
    };

    let mut ids = if !base.subnets.is_empty() {
        selector.explicit(&base.subnets).await?
    } else if !base.availability_zones.is_empty() || !base.local_zones.is_empty() {
        selector.from_pool_zones().await?
    } else if let (Some(arn), false) = (&base.outpost_arn, cfg.is_control_plane_on_outposts()) {
        selector.outpost_subnets(arn)?
    } else {
        selector.cluster_default().await?
    };

    if base.efa_enabled && ids.len() > 1 {
        info!(pool = %base.name, subnet = %ids[0], "EFA pools use a single subnet");
        ids.truncate(1);
    }
    debug!(pool = %base.name, subnets = ?ids, "selected subnets");
    Ok(ids)
}

fn zone_of<'s>(alias: &'s str, spec: &'s SubnetSpec) -> &'s str {
    if spec.az.is_empty() {
        alias
    } else {
        &spec.az
    }
}

fn find<'m>(
    subnets: &'m ClusterSubnets,
    topology: SubnetTopology,
    name: &str,
) -> Option<(&'m str, &'m SubnetSpec)> {
    let mapping = subnets.for_topology(topology);
    mapping
        .get_key_value(name)
        .or_else(|| mapping.iter().find(|(_, s)| s.id.as_deref() == Some(name)))
        .map(|(alias, spec)| (alias.as_str(), spec))
}

impl Selector<'_> {
    fn pool_name(&self) -> &str {
        self.pool.name()
    }

    fn network(&self) -> String {
        self.topology.to_string().to_lowercase()
    }

    fn no_subnets(&self, zones: Vec<String>, reason: impl Into<String>) -> Error {
        Error::NoSubnetsForZones {
            pool: self.pool_name().to_string(),
            network: self.network(),
            zones,
            reason: reason.into(),
        }
    }

    fn subnet_id(&self, alias: &str, spec: &SubnetSpec) -> Result<String> {
        spec.id.clone().ok_or_else(|| {
            Error::missing_field(
                format!("vpc.subnets.{}.{}.id", self.network(), alias),
                format!("placing node pool {:?}", self.pool_name()),
            )
        })
    }

    /// ID of a subnet from the cluster mapping, checked against the
    /// expected Outpost.
    fn mapped_subnet(&self, alias: &str, spec: &SubnetSpec) -> Result<String> {
        let placed = Placed {
            id: self.subnet_id(alias, spec)?,
            zone: zone_of(alias, spec).to_string(),
            outpost_arn: spec.outpost_arn.clone(),
        };
        self.check_outpost(&placed)?;
        Ok(placed.id)
    }

    fn is_local_zone(&self, zone: &str) -> bool {
        self.cfg.local_zones.iter().any(|z| z == zone)
            || matches!(
                self.zone_types.get(zone),
                Some(ZoneType::LocalZone | ZoneType::WavelengthZone)
            )
    }

    fn reject_local_zone(&self, zone: &str) -> Result<()> {
        if self.pool.is_managed() && self.is_local_zone(zone) {
            return Err(Error::LocalZoneWithManagedPool {
                pool: self.pool_name().to_string(),
                zone: zone.to_string(),
            });
        }
        Ok(())
    }

    /// Whether `zone` offers every requested instance type. Only
    /// availability zones are checked.
    async fn supports_instance_types(&self, zone: &str) -> Result<bool> {
        if self.instance_types.is_empty() || self.is_local_zone(zone) {
            return Ok(true);
        }
        let offerings = self
            .ec2
            .instance_type_offerings(&self.instance_types, &[zone.to_string()])
            .await?;
        let offered = offerings.get(zone);
        Ok(self
            .instance_types
            .iter()
            .all(|t| offered.is_some_and(|set| set.contains(t))))
    }

    fn lacks_instance_types(&self, zone: &str) -> Error {
        Error::ZoneLacksInstanceType {
            pool: self.pool_name().to_string(),
            zone: zone.to_string(),
            instance_types: self.instance_types.clone(),
        }
    }

    /// Ok(false): zone dropped (unmanaged); Err: rejected (managed).
    async fn admit_zone(&self, zone: &str) -> Result<bool> {
        self.reject_local_zone(zone)?;
        if self.supports_instance_types(zone).await? {
            return Ok(true);
        }
        if self.pool.is_managed() {
            return Err(self.lacks_instance_types(zone));
        }
        warn!(
            pool = %self.pool_name(),
            zone = %zone,
            instance_types = ?self.instance_types,
            "zone does not offer every instance type, skipping"
        );
        Ok(false)
    }

    async fn from_pool_zones(&self) -> Result<Vec<String>> {
        let base = self.pool.base();
        let (zones, mapping) = if !base.local_zones.is_empty() {
            if self.pool.is_managed() {
                return Err(Error::LocalZoneWithManagedPool {
                    pool: self.pool_name().to_string(),
                    zone: base.local_zones[0].clone(),
                });
            }
            (&base.local_zones, &self.cfg.vpc.local_zone_subnets)
        } else {
            (&base.availability_zones, &self.cfg.vpc.subnets)
        };
        let subnets = mapping.for_topology(self.topology);

        let mut ids = Vec::new();
        for zone in zones {
            if !self.admit_zone(zone).await? {
                continue;
            }
            let matched: Vec<_> = subnets
                .iter()
                .filter(|(alias, spec)| zone_of(alias, spec) == zone)
                .collect();
            if matched.is_empty() {
                return Err(self.no_subnets(
                    zones.clone(),
                    format!("mapping does not have subnet with zone {:?}", zone),
                ));
            }
            for (alias, spec) in matched {
                ids.push(self.mapped_subnet(alias, spec)?);
            }
        }
        if ids.is_empty() {
            return Err(
                self.no_subnets(zones.clone(), "no zone offers every requested instance type")
            );
        }
        Ok(ids)
    }

    async fn cluster_default(&self) -> Result<Vec<String>> {
        let subnets = self.cfg.vpc.subnets.for_topology(self.topology);
        let zones: Vec<String> = subnets
            .iter()
            .map(|(alias, spec)| zone_of(alias, spec).to_string())
            .collect();
        if subnets.is_empty() {
            return Err(self.no_subnets(
                self.cfg.availability_zones.clone(),
                format!("no {} subnets are defined for the cluster", self.network()),
            ));
        }

        let mut ids = Vec::new();
        for (alias, spec) in subnets {
            if !self.admit_zone(zone_of(alias, spec)).await? {
                continue;
            }
            ids.push(self.mapped_subnet(alias, spec)?);
        }
        if ids.is_empty() {
            return Err(self.no_subnets(zones, "no zone offers every requested instance type"));
        }
        Ok(ids)
    }

    fn outpost_subnets(&self, arn: &str) -> Result<Vec<String>> {
        let ids = self
            .cfg
            .vpc
            .subnets
            .for_topology(self.topology)
            .iter()
            .filter(|(_, spec)| spec.outpost_arn.as_deref() == Some(arn))
            .map(|(alias, spec)| self.subnet_id(alias, spec))
            .collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Err(self.no_subnets(
                Vec::new(),
                format!("no {} subnets exist in Outpost {}", self.network(), arn),
            ));
        }
        Ok(ids)
    }

    /// Resolve one explicit name against the cluster mapping.
    fn lookup(&self, name: &str) -> Result<Option<Placed>> {
        let subnets = &self.cfg.vpc.subnets;
        let found = match self.topology {
            SubnetTopology::Private => find(subnets, SubnetTopology::Private, name).or_else(|| {
                let public = find(subnets, SubnetTopology::Public, name);
                if public.is_some() {
                    warn!(
                        pool = %self.pool_name(),
                        subnet = %name,
                        "public subnet used by a pool with private networking"
                    );
                }
                public
            }),
            SubnetTopology::Public => match find(subnets, SubnetTopology::Public, name) {
                Some(hit) => Some(hit),
                None if find(subnets, SubnetTopology::Private, name).is_some() => {
                    return Err(Error::PrivateSubnetMisuse {
                        subnet: name.to_string(),
                    })
                }
                None => None,
            },
        };
        found
            .map(|(alias, spec)| {
                Ok(Placed {
                    id: self.subnet_id(alias, spec)?,
                    zone: zone_of(alias, spec).to_string(),
                    outpost_arn: spec.outpost_arn.clone(),
                })
            })
            .transpose()
    }

    async fn explicit(&self, names: &[String]) -> Result<Vec<String>> {
        let mut resolved: Vec<Option<Placed>> = Vec::with_capacity(names.len());
        let mut unknown = Vec::new();
        for name in names {
            let placed = self.lookup(name)?;
            if placed.is_none() {
                unknown.push(name.clone());
            }
            resolved.push(placed);
        }

        let mut described: BTreeMap<String, Placed> = BTreeMap::new();
        if !unknown.is_empty() {
            // an unset VPC ID (not collected yet) matches no subnet
            let vpc = self.cfg.vpc.id.as_deref().unwrap_or_default();
            for subnet in self.ec2.describe_subnets(&unknown).await? {
                if subnet.vpc_id != vpc {
                    return Err(Error::SubnetNotInVpc {
                        subnet: subnet.id,
                        vpc: vpc.to_string(),
                    });
                }
                described.insert(
                    subnet.id.clone(),
                    Placed {
                        id: subnet.id,
                        zone: subnet.availability_zone,
                        outpost_arn: subnet.outpost_arn,
                    },
                );
            }
        }

        let mut ids = Vec::with_capacity(names.len());
        for (name, placed) in names.iter().zip(resolved) {
            let placed = match placed {
                Some(p) => p,
                None => described.remove(name).ok_or_else(|| {
                    self.no_subnets(Vec::new(), format!("subnet {:?} was not found", name))
                })?,
            };
            self.reject_local_zone(&placed.zone)?;
            if !self.supports_instance_types(&placed.zone).await? {
                return Err(self.lacks_instance_types(&placed.zone));
            }
            self.check_outpost(&placed)?;
            ids.push(placed.id);
        }
        Ok(ids)
    }

    fn check_outpost(&self, placed: &Placed) -> Result<()> {
        let expected = self
            .cfg
            .outpost
            .as_ref()
            .map(|o| o.control_plane_outpost_arn.as_str())
            .or(self.pool.base().outpost_arn.as_deref());
        let mismatch = |reason: String| Error::OutpostMismatch {
            subnet: placed.id.clone(),
            reason,
        };
        match (expected, placed.outpost_arn.as_deref()) {
            (Some(_), None) => Err(mismatch("is not on Outposts".to_string())),
            (Some(want), Some(got)) if want != got => Err(mismatch(format!(
                "is in a different Outpost ARN ({:?}) than the control plane or nodegroup Outpost ({:?})",
                got, want
            ))),
            (None, Some(got)) => Err(mismatch(format!(
                "is on Outpost {:?} but neither the control plane nor the node pool is",
                got
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::Subnet;

    const CLUSTER: &str = r#"
metadata:
  name: demo
  region: us-west-2
availabilityZones: [us-west-2a, us-west-2b, us-west-2c]
vpc:
  id: vpc-1
  subnets:
    public:
      us-west-2a: {id: subnet-pub-a}
      us-west-2b: {id: subnet-pub-b}
      us-west-2c: {id: subnet-pub-c}
    private:
      us-west-2a: {id: subnet-priv-a}
      us-west-2b: {id: subnet-priv-b}
      us-west-2c: {id: subnet-priv-c}
"#;

    fn cluster(extra: &str) -> ClusterConfig {
        serde_yaml_ng::from_str(&format!("{CLUSTER}{extra}")).unwrap()
    }

    fn subnet(id: &str, vpc: &str, zone: &str) -> Subnet {
        Subnet {
            id: id.to_string(),
            vpc_id: vpc.to_string(),
            availability_zone: zone.to_string(),
            outpost_arn: None,
            cidr: None,
        }
    }

    async fn select(ec2: &MemoryProvider, cfg: &ClusterConfig) -> Result<Vec<String>> {
        let pool = cfg.node_pools().next().unwrap();
        select_subnets(ec2, cfg, pool).await
    }

    #[tokio::test]
    async fn test_cf013_explicit_ids_round_trip() {
        let ec2 = MemoryProvider::new("us-west-2")
            .with_subnet(subnet("subnet-x", "vpc-1", "us-west-2b"))
            .with_subnet(subnet("subnet-y", "vpc-1", "us-west-2a"));
        let cfg = cluster(
            "nodeGroups:\n  - name: ng\n    instanceType: m5.large\n    subnets: [subnet-x, us-west-2c, subnet-y]\n",
        );
        let ids = select(&ec2, &cfg).await.unwrap();
        assert_eq!(ids, vec!["subnet-x", "subnet-pub-c", "subnet-y"]);
        assert_eq!(ec2.calls("describe_subnets"), 1);
    }

    #[tokio::test]
    async fn test_cf013_subnet_not_in_vpc() {
        let ec2 = MemoryProvider::new("us-west-2")
            .with_subnet(subnet("subnet-x", "vpc-other", "us-west-2a"));
        let cfg = cluster("nodeGroups:\n  - name: ng\n    subnets: [subnet-x]\n");
        match select(&ec2, &cfg).await.unwrap_err() {
            Error::SubnetNotInVpc { subnet, vpc } => {
                assert_eq!(subnet, "subnet-x");
                assert_eq!(vpc, "vpc-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cf013_private_subnet_on_public_pool() {
        let ec2 = MemoryProvider::new("us-west-2");
        let cfg = cluster("nodeGroups:\n  - name: ng\n    subnets: [subnet-priv-a]\n");
        assert!(matches!(
            select(&ec2, &cfg).await.unwrap_err(),
            Error::PrivateSubnetMisuse { .. }
        ));
    }

    #[tokio::test]
    async fn test_cf013_managed_pool_local_zone_direct() {
        let ec2 =
            MemoryProvider::new("us-west-2").with_zone("us-west-2-lax-1a", ZoneType::LocalZone);
        let cfg =
            cluster("managedNodeGroups:\n  - name: mng\n    localZones: [us-west-2-lax-1a]\n");
        match select(&ec2, &cfg).await.unwrap_err() {
            Error::LocalZoneWithManagedPool { pool, zone } => {
                assert_eq!(pool, "mng");
                assert_eq!(zone, "us-west-2-lax-1a");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cf013_managed_pool_local_zone_via_cluster_default() {
        let ec2 =
            MemoryProvider::new("us-west-2").with_zone("us-west-2-lax-1a", ZoneType::LocalZone);
        let cfg: ClusterConfig = serde_yaml_ng::from_str(
            r#"
metadata: {name: demo, region: us-west-2}
availabilityZones: [us-west-2a, us-west-2-lax-1a]
vpc:
  id: vpc-1
  subnets:
    public:
      us-west-2a: {id: subnet-a}
      us-west-2-lax-1a: {id: subnet-lax}
managedNodeGroups:
  - name: mng
"#,
        )
        .unwrap();
        assert!(matches!(
            select(&ec2, &cfg).await.unwrap_err(),
            Error::LocalZoneWithManagedPool { zone, .. } if zone == "us-west-2-lax-1a"
        ));
    }

    #[tokio::test]
    async fn test_cf013_unmanaged_local_zones_use_local_mapping() {
        let ec2 =
            MemoryProvider::new("us-west-2").with_zone("us-west-2-lax-1a", ZoneType::LocalZone);
        let cfg = cluster(
            "  localZoneSubnets:\n    public:\n      us-west-2-lax-1a: {id: subnet-lax}\nlocalZones: [us-west-2-lax-1a]\nnodeGroups:\n  - name: ng\n    localZones: [us-west-2-lax-1a]\n",
        );
        assert_eq!(select(&ec2, &cfg).await.unwrap(), vec!["subnet-lax"]);
    }

    #[tokio::test]
    async fn test_cf013_efa_picks_first_subnet() {
        let ec2 = MemoryProvider::new("us-west-2")
            .with_subnet(subnet("s1", "vpc-1", "us-west-2a"))
            .with_subnet(subnet("s2", "vpc-1", "us-west-2a"))
            .with_subnet(subnet("s3", "vpc-1", "us-west-2a"));
        let cfg = cluster(
            "nodeGroups:\n  - name: efa\n    instanceType: c5n.18xlarge\n    efaEnabled: true\n    subnets: [s1, s2, s3]\n",
        );
        assert_eq!(select(&ec2, &cfg).await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_cf013_unmanaged_drops_unsupported_zone() {
        let ec2 = MemoryProvider::new("us-west-2")
            .with_offerings("us-west-2a", &["p4d.24xlarge"])
            .with_offerings("us-west-2c", &["p4d.24xlarge"]);
        let cfg = cluster("nodeGroups:\n  - name: gpu\n    instanceType: p4d.24xlarge\n");
        assert_eq!(
            select(&ec2, &cfg).await.unwrap(),
            vec!["subnet-pub-a", "subnet-pub-c"]
        );
    }

    #[tokio::test]
    async fn test_cf013_managed_rejects_unsupported_zone() {
        let ec2 = MemoryProvider::new("us-west-2")
            .with_offerings("us-west-2a", &["p4d.24xlarge"])
            .with_offerings("us-west-2c", &["p4d.24xlarge"]);
        let cfg = cluster(
            "managedNodeGroups:\n  - name: gpu\n    instanceType: p4d.24xlarge\n    privateNetworking: true\n",
        );
        match select(&ec2, &cfg).await.unwrap_err() {
            Error::ZoneLacksInstanceType { zone, instance_types, .. } => {
                assert_eq!(zone, "us-west-2b");
                assert_eq!(instance_types, vec!["p4d.24xlarge"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cf013_no_zone_offers_types() {
        let ec2 = MemoryProvider::new("us-west-2").with_offerings("us-west-2a", &["m5.large"]);
        let cfg = cluster(
            "nodeGroups:\n  - name: gpu\n    instanceType: p5.48xlarge\n    availabilityZones: [us-west-2a, us-west-2b]\n",
        );
        assert!(matches!(
            select(&ec2, &cfg).await.unwrap_err(),
            Error::NoSubnetsForZones { zones, .. } if zones == vec!["us-west-2a", "us-west-2b"]
        ));
    }

    #[tokio::test]
    async fn test_cf013_pool_zones_select_private() {
        let ec2 = MemoryProvider::new("us-west-2");
        let cfg = cluster(
            "nodeGroups:\n  - name: ng\n    privateNetworking: true\n    availabilityZones: [us-west-2b]\n",
        );
        assert_eq!(select(&ec2, &cfg).await.unwrap(), vec!["subnet-priv-b"]);
    }

    #[tokio::test]
    async fn test_cf013_outpost_mismatch() {
        let arn = "arn:aws:outposts:us-west-2:1:outpost/op-1";
        let mut on_outpost = subnet("subnet-op", "vpc-1", "us-west-2a");
        on_outpost.outpost_arn = Some("arn:aws:outposts:us-west-2:1:outpost/op-2".to_string());
        let ec2 = MemoryProvider::new("us-west-2")
            .with_subnet(on_outpost)
            .with_subnet(subnet("subnet-cloud", "vpc-1", "us-west-2a"));

        let cfg = cluster(&format!(
            "outpost:\n  controlPlaneOutpostARN: {arn}\nnodeGroups:\n  - name: ng\n    subnets: [subnet-op]\n"
        ));
        let err = select(&ec2, &cfg).await.unwrap_err();
        assert!(err.to_string().contains("different Outpost ARN"), "{err}");

        let cfg = cluster(&format!(
            "outpost:\n  controlPlaneOutpostARN: {arn}\nnodeGroups:\n  - name: ng\n    subnets: [subnet-cloud]\n"
        ));
        let err = select(&ec2, &cfg).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OutpostMismatch { ref reason, .. } if reason == "is not on Outposts"
        ));
    }

    #[tokio::test]
    async fn test_cf013_outpost_pool_uses_outpost_subnets() {
        let arn = "arn:aws:outposts:us-west-2:1:outpost/op-1";
        let cfg = cluster(&format!(
            "nodeGroups:\n  - name: ng\n    outpostARN: {arn}\n"
        ));
        let ec2 = MemoryProvider::new("us-west-2");
        let err = select(&ec2, &cfg).await.unwrap_err();
        assert!(err.to_string().contains("no public subnets exist in Outpost"));

        let mut cfg = cfg;
        cfg.vpc.subnets.public["us-west-2b"].outpost_arn = Some(arn.to_string());
        assert_eq!(select(&ec2, &cfg).await.unwrap(), vec!["subnet-pub-b"]);
    }

    #[tokio::test]
    async fn test_cf013_subnet_rejected_before_vpc_is_known() {
        let ec2 = MemoryProvider::new("us-west-2")
            .with_subnet(subnet("subnet-x", "vpc-other", "us-west-2a"));
        let cfg: ClusterConfig = serde_yaml_ng::from_str(
            "metadata: {name: demo, region: us-west-2}\nnodeGroups:\n  - name: ng\n    subnets: [subnet-x]\n",
        )
        .unwrap();
        match select(&ec2, &cfg).await.unwrap_err() {
            Error::SubnetNotInVpc { subnet, vpc } => {
                assert_eq!(subnet, "subnet-x");
                assert!(vpc.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cf013_outpost_checked_on_zone_and_default_paths() {
        let arn = "arn:aws:outposts:us-west-2:1:outpost/op-1";
        let ec2 = MemoryProvider::new("us-west-2");

        let cfg = cluster(&format!(
            "outpost:\n  controlPlaneOutpostARN: {arn}\n\
             managedNodeGroups:\n  - name: mng\n    availabilityZones: [us-west-2a]\n"
        ));
        let err = select(&ec2, &cfg).await.unwrap_err();
        assert!(
            matches!(err, Error::OutpostMismatch { ref subnet, .. } if subnet == "subnet-pub-a"),
            "{err}"
        );

        let mut cfg = cluster(&format!(
            "outpost:\n  controlPlaneOutpostARN: {arn}\nmanagedNodeGroups:\n  - name: mng\n"
        ));
        assert!(matches!(
            select(&ec2, &cfg).await.unwrap_err(),
            Error::OutpostMismatch { .. }
        ));

        for spec in cfg.vpc.subnets.public.values_mut() {
            spec.outpost_arn = Some(arn.to_string());
        }
        assert_eq!(
            select(&ec2, &cfg).await.unwrap(),
            vec!["subnet-pub-a", "subnet-pub-b", "subnet-pub-c"]
        );
    }
}
