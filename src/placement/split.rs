//! Default subnet CIDR layout for a cluster-owned VPC.
//!
//! Every zone gets one public and one private subnet. Availability zones
//! take the first indices into the split, local zones follow; privates start
//! after all publics.

use crate::core::cidr::{Ipv4Cidr, DEFAULT_VPC_CIDR};
use crate::core::types::{ClusterConfig, ClusterSubnets, SubnetSpec};
use crate::error::{Error, Result};
use tracing::debug;

/// Number of blocks to split the VPC into and their prefix length.
pub fn subnet_network_size(subnets_total: usize, vpc_prefix: u8) -> Result<(usize, u8)> {
    match subnets_total {
        0..=2 => Ok((2, vpc_prefix + 3)),
        3..=8 => Ok((8, vpc_prefix + 3)),
        9..=16 => Ok((16, vpc_prefix + 4)),
        n => Err(Error::invalid_config(format!(
            "cannot create more than 16 subnets, {} requested",
            n
        ))),
    }
}

/// Lay out public and private subnets for every zone of the cluster.
pub fn set_subnets(cfg: &mut ClusterConfig) -> Result<()> {
    let vpc_cidr = *cfg.vpc.cidr.get_or_insert(DEFAULT_VPC_CIDR);
    if !(16..=24).contains(&vpc_cidr.prefix()) {
        return Err(Error::cidr("VPC CIDR prefix must be between /16 and /24"));
    }

    let zones_total = cfg.availability_zones.len() + cfg.local_zones.len();
    let (size, network_length) = subnet_network_size(2 * zones_total, vpc_cidr.prefix())?;
    let blocks = vpc_cidr.split_into(size, network_length)?;
    debug!(
        cidr = %vpc_cidr,
        zones = zones_total,
        blocks = size,
        prefix = network_length,
        "laying out subnets"
    );

    let azs = cfg.availability_zones.clone();
    let local = cfg.local_zones.clone();
    assign(&mut cfg.vpc.subnets, &azs, 0, zones_total, &blocks)?;
    assign(&mut cfg.vpc.local_zone_subnets, &local, azs.len(), zones_total, &blocks)?;
    Ok(())
}

fn assign(
    subnets: &mut ClusterSubnets,
    zones: &[String],
    start: usize,
    zones_total: usize,
    blocks: &[Ipv4Cidr],
) -> Result<()> {
    let block = |index: usize| {
        blocks
            .get(index)
            .copied()
            .ok_or_else(|| Error::cidr(format!("no CIDR block at index {}", index)))
    };
    for (i, zone) in zones.iter().enumerate() {
        let public = start + i;
        let private = public + zones_total;
        subnets.public.insert(zone.clone(), spec(zone, block(public)?, public));
        subnets.private.insert(zone.clone(), spec(zone, block(private)?, private));
    }
    Ok(())
}

fn spec(zone: &str, cidr: Ipv4Cidr, index: usize) -> SubnetSpec {
    SubnetSpec {
        az: zone.to_string(),
        cidr: Some(cidr),
        cidr_index: u32::try_from(index).ok(),
        ..SubnetSpec::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(azs: &[&str], local: &[&str]) -> ClusterConfig {
        let mut cfg: ClusterConfig =
            serde_yaml_ng::from_str("metadata:\n  name: demo\n  region: us-west-2\n").unwrap();
        cfg.availability_zones = azs.iter().map(|s| s.to_string()).collect();
        cfg.local_zones = local.iter().map(|s| s.to_string()).collect();
        cfg
    }

    #[test]
    fn test_cf013_network_size_buckets() {
        assert_eq!(subnet_network_size(2, 16).unwrap(), (2, 19));
        assert_eq!(subnet_network_size(6, 16).unwrap(), (8, 19));
        assert_eq!(subnet_network_size(10, 16).unwrap(), (16, 20));
        let err = subnet_network_size(18, 16).unwrap_err();
        assert!(err.to_string().contains("cannot create more than 16 subnets, 18 requested"));
    }

    #[test]
    fn test_cf013_three_azs_default_cidr() {
        let mut cfg = config(&["us-west-2a", "us-west-2b", "us-west-2c"], &[]);
        set_subnets(&mut cfg).unwrap();
        let public: Vec<String> = cfg
            .vpc
            .subnets
            .public
            .values()
            .map(|s| s.cidr.unwrap().to_string())
            .collect();
        let private: Vec<String> = cfg
            .vpc
            .subnets
            .private
            .values()
            .map(|s| s.cidr.unwrap().to_string())
            .collect();
        assert_eq!(public, vec!["192.168.0.0/19", "192.168.32.0/19", "192.168.64.0/19"]);
        assert_eq!(private, vec!["192.168.96.0/19", "192.168.128.0/19", "192.168.160.0/19"]);
        assert_eq!(cfg.vpc.subnets.private["us-west-2a"].cidr_index, Some(3));
    }

    #[test]
    fn test_cf013_local_zones_follow_azs() {
        let mut cfg = config(&["us-west-2a", "us-west-2b"], &["us-west-2-lax-1a"]);
        set_subnets(&mut cfg).unwrap();
        let lz = &cfg.vpc.local_zone_subnets;
        assert_eq!(lz.public["us-west-2-lax-1a"].cidr_index, Some(2));
        assert_eq!(lz.private["us-west-2-lax-1a"].cidr_index, Some(5));
        assert_eq!(lz.public["us-west-2-lax-1a"].cidr.unwrap().to_string(), "192.168.64.0/19");
    }

    #[test]
    fn test_cf013_prefix_out_of_range() {
        let mut cfg = config(&["us-west-2a"], &[]);
        cfg.vpc.cidr = Some("10.0.0.0/25".parse().unwrap());
        let err = set_subnets(&mut cfg).unwrap_err();
        assert!(err.to_string().contains("between /16 and /24"));
    }
}
