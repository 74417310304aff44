//! CF-020: Dedicated dual-stack VPC for IPv6 clusters.
//!
//! Subnet blocks are carved out at deploy time with `Fn::Cidr`: the IPv4 VPC
//! block and the VPC's IPv6 block are both split into `2*AZs + 2` slots.
//! Public subnets take slot `i`, private subnets slot `i + AZs`. Private
//! IPv6 egress goes through an egress-only gateway, private IPv4 egress
//! through a single NAT gateway.

use super::vpc::{add_network_outputs, subnet_role_tag};
use super::{
    az_resource_name, Network, SubnetDetails, SubnetResource, INTERNET_CIDR, INTERNET_IPV6_CIDR,
    VPC_RESOURCE,
};
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet, Taggable};
use crate::core::types::{ClusterConfig, SubnetTopology};
use crate::error::{Error, Result};

const IPV6_CIDR_BLOCK: &str = "IPv6CidrBlock";
const INTERNET_GATEWAY: &str = "InternetGateway";
const GATEWAY_ATTACHMENT: &str = "VPCGatewayAttachment";
const EGRESS_ONLY_GATEWAY: &str = "EgressOnlyInternetGateway";
const NAT_GATEWAY: &str = "NATGateway";
const NAT_IP: &str = "NATIP";
const PUBLIC_ROUTE_TABLE: &str = "PublicRouteTable";

/// Host bits of the IPv4 slots when `prefix` is split into `partitions`.
pub fn ipv4_host_bits(prefix: u8, partitions: u32) -> Result<u32> {
    let extra = partitions.max(1).next_power_of_two().trailing_zeros();
    32u32
        .checked_sub(u32::from(prefix) + extra)
        .filter(|bits| *bits > 0)
        .ok_or_else(|| {
            Error::cidr(format!("/{} cannot be split into {} subnets", prefix, partitions))
        })
}

fn zones(cfg: &ClusterConfig) -> Vec<String> {
    if !cfg.availability_zones.is_empty() {
        return cfg.availability_zones.clone();
    }
    cfg.vpc
        .subnets
        .private
        .iter()
        .map(|(alias, spec)| if spec.az.is_empty() { alias.clone() } else { spec.az.clone() })
        .collect()
}

pub fn add_ipv6_vpc_resources(rs: &mut ResourceSet, cfg: &ClusterConfig) -> Result<Network> {
    let cidr = cfg
        .vpc
        .cidr
        .ok_or_else(|| Error::missing_field("vpc.cidr", "a dedicated VPC is created"))?;
    let zones = zones(cfg);
    if zones.is_empty() {
        return Err(Error::invalid_config("an IPv6 VPC needs at least one availability zone"));
    }
    let az_count =
        u32::try_from(zones.len()).map_err(|_| Error::cidr("too many availability zones"))?;
    let partitions = 2 * az_count + 2;
    let host_bits = ipv4_host_bits(cidr.prefix(), partitions)?;

    let vpc = rs.add_resource(
        VPC_RESOURCE,
        Resource::new(ResourceKind::Vpc)
            .with("CidrBlock", cidr.to_string())
            .with("EnableDnsSupport", true)
            .with("EnableDnsHostnames", true),
    )?;

    let mut block = Resource::new(ResourceKind::VpcCidrBlock).with("VpcId", vpc.clone());
    match (&cfg.vpc.ipv6_cidr, &cfg.vpc.ipv6_pool) {
        (Some(ipv6_cidr), Some(pool)) => {
            block = block
                .with("Ipv6CidrBlock", ipv6_cidr.as_str())
                .with("Ipv6Pool", pool.as_str());
        }
        (None, None) => block = block.with("AmazonProvidedIpv6CidrBlock", true),
        _ => {
            return Err(Error::invalid_config(
                "vpc.ipv6Cidr and vpc.ipv6Pool must be set together",
            ))
        }
    }
    rs.add_resource(IPV6_CIDR_BLOCK, block)?;

    let layout = SubnetLayout {
        vpc: vpc.clone(),
        ipv4_block: Value::string(cidr.to_string()),
        partitions,
        host_bits,
    };

    let mut details = SubnetDetails {
        control_plane_on_outposts: cfg.is_control_plane_on_outposts(),
        ..SubnetDetails::default()
    };

    for (i, zone) in zones.iter().enumerate() {
        let index = az_count + u32::try_from(i).unwrap_or(0);
        let suffix = az_resource_name(zone);
        let rt = rs.add_resource(
            &format!("PrivateRouteTable{}", suffix),
            Resource::new(ResourceKind::RouteTable).with("VpcId", vpc.clone()),
        )?;
        let subnet = layout.add_subnet(rs, SubnetTopology::Private, zone, index)?;
        rs.add_resource(
            &format!("RouteTableAssociationPrivate{}", suffix),
            Resource::new(ResourceKind::SubnetRouteTableAssociation)
                .with("RouteTableId", rt.clone())
                .with("SubnetId", subnet.clone()),
        )?;
        details.private.push(SubnetResource {
            subnet,
            availability_zone: zone.clone(),
            route_table: Some(rt),
        });
    }

    if cfg.is_fully_private() {
        let network = Network { vpc, subnets: details };
        add_network_outputs(rs, cfg, &network)?;
        return Ok(network);
    }

    let igw = rs.add_resource(INTERNET_GATEWAY, Resource::new(ResourceKind::InternetGateway))?;
    rs.add_resource(
        GATEWAY_ATTACHMENT,
        Resource::new(ResourceKind::VpcGatewayAttachment)
            .with("InternetGatewayId", igw.clone())
            .with("VpcId", vpc.clone()),
    )?;

    let first_public = format!("SubnetPublic{}", az_resource_name(&zones[0]));
    rs.add_resource(
        NAT_IP,
        Resource::new(ResourceKind::Eip)
            .with("Domain", "vpc")
            .depends_on(GATEWAY_ATTACHMENT),
    )?;
    let nat = rs.add_resource(
        NAT_GATEWAY,
        Resource::new(ResourceKind::NatGateway)
            .with("AllocationId", Value::get_att(NAT_IP, "AllocationId"))
            .with("SubnetId", Value::reference(first_public.clone()))
            .depends_on(NAT_IP)
            .depends_on(first_public)
            .depends_on(GATEWAY_ATTACHMENT),
    )?;

    let public_rt = rs.add_resource(
        PUBLIC_ROUTE_TABLE,
        Resource::new(ResourceKind::RouteTable).with("VpcId", vpc.clone()),
    )?;
    rs.add_resource(
        "PublicSubnetRoute",
        Resource::new(ResourceKind::Route)
            .with("RouteTableId", public_rt.clone())
            .with("DestinationCidrBlock", INTERNET_CIDR)
            .with("GatewayId", igw.clone())
            .depends_on(GATEWAY_ATTACHMENT),
    )?;
    rs.add_resource(
        "PublicSubnetIPv6DefaultRoute",
        Resource::new(ResourceKind::Route)
            .with("RouteTableId", public_rt.clone())
            .with("DestinationIpv6CidrBlock", INTERNET_IPV6_CIDR)
            .with("GatewayId", igw)
            .depends_on(GATEWAY_ATTACHMENT),
    )?;
    let egress_only = rs.add_resource(
        EGRESS_ONLY_GATEWAY,
        Resource::new(ResourceKind::EgressOnlyInternetGateway).with("VpcId", vpc.clone()),
    )?;

    for (i, zone) in zones.iter().enumerate() {
        let suffix = az_resource_name(zone);
        let subnet = layout.add_subnet(
            rs,
            SubnetTopology::Public,
            zone,
            u32::try_from(i).unwrap_or(0),
        )?;
        rs.add_resource(
            &format!("RouteTableAssociationPublic{}", suffix),
            Resource::new(ResourceKind::SubnetRouteTableAssociation)
                .with("RouteTableId", public_rt.clone())
                .with("SubnetId", subnet.clone()),
        )?;
        let private_rt = Value::reference(format!("PrivateRouteTable{}", suffix));
        rs.add_resource(
            &format!("PrivateSubnetIpv6DefaultRoute{}", suffix),
            Resource::new(ResourceKind::Route)
                .with("RouteTableId", private_rt.clone())
                .with("DestinationIpv6CidrBlock", INTERNET_IPV6_CIDR)
                .with("EgressOnlyInternetGatewayId", egress_only.clone()),
        )?;
        rs.add_resource(
            &format!("PrivateSubnetDefaultRoute{}", suffix),
            Resource::new(ResourceKind::Route)
                .with("RouteTableId", private_rt)
                .with("DestinationCidrBlock", INTERNET_CIDR)
                .with("NatGatewayId", nat.clone())
                .depends_on(NAT_GATEWAY)
                .depends_on(GATEWAY_ATTACHMENT),
        )?;
        details.public.push(SubnetResource {
            subnet,
            availability_zone: zone.clone(),
            route_table: Some(public_rt.clone()),
        });
    }

    let network = Network { vpc, subnets: details };
    add_network_outputs(rs, cfg, &network)?;
    Ok(network)
}

struct SubnetLayout {
    vpc: Value,
    ipv4_block: Value,
    partitions: u32,
    host_bits: u32,
}

impl SubnetLayout {
    fn add_subnet(
        &self,
        rs: &mut ResourceSet,
        topology: SubnetTopology,
        zone: &str,
        index: u32,
    ) -> Result<Value> {
        let ipv6_block = Value::select(0, Value::get_att(VPC_RESOURCE, "Ipv6CidrBlocks"));
        let mut subnet = Resource::new(ResourceKind::Subnet)
            .with("AvailabilityZone", zone)
            .with(
                "CidrBlock",
                Value::select(
                    index,
                    Value::cidr(self.ipv4_block.clone(), self.partitions, self.host_bits),
                ),
            )
            .with(
                "Ipv6CidrBlock",
                Value::select(index, Value::cidr(ipv6_block, self.partitions, 64)),
            )
            .with("AssignIpv6AddressOnCreation", true)
            .with("VpcId", self.vpc.clone())
            .depends_on(IPV6_CIDR_BLOCK);
        if topology == SubnetTopology::Public {
            subnet = subnet.with("MapPublicIpOnLaunch", true);
        }
        if let Some(mut tagged) = subnet.taggable() {
            tagged.set_tag(subnet_role_tag(topology), Value::from("1"));
        }
        rs.add_resource(
            &format!("Subnet{}{}", topology, az_resource_name(zone)),
            subnet,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::{apply_defaults, parse_config};

    fn config(extra: &str) -> ClusterConfig {
        let yaml = format!(
            "metadata:\n  name: demo\n  region: us-west-2\navailabilityZones: [us-west-2a, us-west-2b, us-west-2c]\nkubernetesNetworkConfig:\n  ipFamily: IPv6\n{}",
            extra
        );
        let mut cfg = parse_config(&yaml).unwrap();
        apply_defaults(&mut cfg).unwrap();
        cfg
    }

    fn render(cfg: &ClusterConfig) -> serde_json::Value {
        let mut rs = ResourceSet::new("test");
        add_ipv6_vpc_resources(&mut rs, cfg).unwrap();
        rs.finish().unwrap().to_json().unwrap()
    }

    #[test]
    fn test_cf020_host_bits() {
        // 8 partitions of a /16 are /19s
        assert_eq!(ipv4_host_bits(16, 8).unwrap(), 13);
        // 6 partitions round up to 8
        assert_eq!(ipv4_host_bits(16, 6).unwrap(), 13);
        assert_eq!(ipv4_host_bits(24, 2).unwrap(), 7);
        assert!(ipv4_host_bits(31, 4).is_err());
    }

    #[test]
    fn test_cf020_subnet_indices() {
        let json = render(&config(""));
        let public_b = &json["Resources"]["SubnetPublicUSWEST2B"]["Properties"];
        assert_eq!(public_b["CidrBlock"]["Fn::Select"][0], 1);
        assert_eq!(public_b["CidrBlock"]["Fn::Select"][1]["Fn::Cidr"][1], 8);
        assert_eq!(public_b["CidrBlock"]["Fn::Select"][1]["Fn::Cidr"][2], 13);
        assert_eq!(public_b["Ipv6CidrBlock"]["Fn::Select"][1]["Fn::Cidr"][2], 64);
        assert_eq!(public_b["AssignIpv6AddressOnCreation"], true);

        let private_b = &json["Resources"]["SubnetPrivateUSWEST2B"]["Properties"];
        assert_eq!(private_b["CidrBlock"]["Fn::Select"][0], 4);
        assert_eq!(private_b["Ipv6CidrBlock"]["Fn::Select"][0], 4);
        assert_eq!(
            json["Resources"]["SubnetPrivateUSWEST2B"]["DependsOn"][0],
            "IPv6CidrBlock"
        );
    }

    #[test]
    fn test_cf020_egress_routes() {
        let json = render(&config(""));
        let res = &json["Resources"];
        assert_eq!(
            res["IPv6CidrBlock"]["Properties"]["AmazonProvidedIpv6CidrBlock"],
            true
        );
        let route = &res["PrivateSubnetIpv6DefaultRouteUSWEST2A"]["Properties"];
        assert_eq!(route["EgressOnlyInternetGatewayId"]["Ref"], "EgressOnlyInternetGateway");
        assert_eq!(
            res["PrivateSubnetDefaultRouteUSWEST2C"]["Properties"]["NatGatewayId"]["Ref"],
            "NATGateway"
        );
        assert_eq!(res["NATGateway"]["Properties"]["SubnetId"]["Ref"], "SubnetPublicUSWEST2A");
    }

    #[test]
    fn test_cf020_byo_ipv6_pool() {
        let json = render(&config(
            "vpc:\n  ipv6Cidr: 2001:db8::/56\n  ipv6Pool: ipv6pool-ec2-1\n",
        ));
        let block = &json["Resources"]["IPv6CidrBlock"]["Properties"];
        assert_eq!(block["Ipv6Pool"], "ipv6pool-ec2-1");
        assert!(block.get("AmazonProvidedIpv6CidrBlock").is_none());
    }

    #[test]
    fn test_cf020_pool_without_cidr_rejected() {
        let cfg = config("vpc:\n  ipv6Pool: ipv6pool-ec2-1\n");
        let mut rs = ResourceSet::new("test");
        assert!(add_ipv6_vpc_resources(&mut rs, &cfg).is_err());
    }

    #[test]
    fn test_cf020_fully_private() {
        let json = render(&config("privateCluster:\n  enabled: true\n"));
        assert!(json["Resources"].get("EgressOnlyInternetGateway").is_none());
        assert!(json["Resources"].get("SubnetPublicUSWEST2A").is_none());
        assert!(json["Outputs"].get("SubnetsPrivate").is_some());
    }
}
