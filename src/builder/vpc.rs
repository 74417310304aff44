//! CF-019: Dedicated IPv4 VPC.
//!
//! Public subnets share one route table with a default route to the
//! internet gateway. Private subnets get a route table per zone whose
//! default route goes to a NAT gateway chosen by the NAT mode. A
//! fully-private cluster gets no internet gateway, no NAT and no public
//! subnets.

use super::{
    az_resource_name, define_subnet_output, outputs, Network, SubnetDetails, SubnetMapping,
    SubnetResource, INTERNET_CIDR, INTERNET_IPV6_CIDR, VPC_RESOURCE,
};
use crate::core::intrinsic::Value;
use crate::core::template::{Resource, ResourceKind, ResourceSet, Taggable};
use crate::core::types::{ClusterConfig, NatMode, SubnetSpec, SubnetTopology};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use tracing::debug;

const AUTO_ALLOCATED_CIDR_V6: &str = "AutoAllocatedCIDRv6";
const INTERNET_GATEWAY: &str = "InternetGateway";
const GATEWAY_ATTACHMENT: &str = "VPCGatewayAttachment";
const PUBLIC_ROUTE_TABLE: &str = "PublicRouteTable";

/// Role tag load balancer controllers use to pick subnets.
pub fn subnet_role_tag(topology: SubnetTopology) -> &'static str {
    match topology {
        SubnetTopology::Public => "kubernetes.io/role/elb",
        SubnetTopology::Private => "kubernetes.io/role/internal-elb",
    }
}

fn subnet_resource_name(topology: SubnetTopology, local_zone: bool, zone: &str) -> String {
    let lz = if local_zone { "LocalZone" } else { "" };
    format!("Subnet{}{}{}", lz, topology, az_resource_name(zone))
}

fn private_route_table_name(zone: &str) -> String {
    format!("PrivateRouteTable{}", az_resource_name(zone))
}

/// Subnets of an Outposts control plane all live on its Outpost.
fn subnet_outpost_arn(cfg: &ClusterConfig, spec: &SubnetSpec) -> Option<String> {
    cfg.outpost
        .as_ref()
        .map(|o| o.control_plane_outpost_arn.clone())
        .or_else(|| spec.outpost_arn.clone())
}

/// Add the VPC and its subnets; returns references for the rest of the stack.
pub fn add_vpc_resources(rs: &mut ResourceSet, cfg: &ClusterConfig) -> Result<Network> {
    let cidr = cfg
        .vpc
        .cidr
        .ok_or_else(|| Error::missing_field("vpc.cidr", "a dedicated VPC is created"))?;
    let vpc = rs.add_resource(
        VPC_RESOURCE,
        Resource::new(ResourceKind::Vpc)
            .with("CidrBlock", cidr.to_string())
            .with("EnableDnsSupport", true)
            .with("EnableDnsHostnames", true),
    )?;

    if cfg.vpc.auto_allocate_ipv6 {
        rs.add_resource(
            AUTO_ALLOCATED_CIDR_V6,
            Resource::new(ResourceKind::VpcCidrBlock)
                .with("AmazonProvidedIpv6CidrBlock", true)
                .with("VpcId", vpc.clone()),
        )?;
    }

    let mut details = SubnetDetails {
        control_plane_on_outposts: cfg.is_control_plane_on_outposts(),
        ..SubnetDetails::default()
    };

    if cfg.is_fully_private() {
        debug!(
            cluster = %cfg.metadata.name,
            "fully-private VPC, skipping internet gateway and NAT"
        );
        private_route_tables(rs, cfg, &vpc)?;
        details.private = add_subnets(
            rs,
            cfg,
            &vpc,
            SubnetTopology::Private,
            false,
            &cfg.vpc.subnets.private,
        )?;
        details.private_local_zone = add_subnets(
            rs,
            cfg,
            &vpc,
            SubnetTopology::Private,
            true,
            &cfg.vpc.local_zone_subnets.private,
        )?;
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
    if cfg.vpc.auto_allocate_ipv6 {
        rs.add_resource(
            "PublicSubnetIPv6DefaultRoute",
            Resource::new(ResourceKind::Route)
                .with("RouteTableId", public_rt)
                .with("DestinationIpv6CidrBlock", INTERNET_IPV6_CIDR)
                .with("GatewayId", igw)
                .depends_on(GATEWAY_ATTACHMENT),
        )?;
    }

    details.public = add_subnets(
        rs,
        cfg,
        &vpc,
        SubnetTopology::Public,
        false,
        &cfg.vpc.subnets.public,
    )?;
    details.public_local_zone = add_subnets(
        rs,
        cfg,
        &vpc,
        SubnetTopology::Public,
        true,
        &cfg.vpc.local_zone_subnets.public,
    )?;
    add_nat_gateways(rs, cfg, &vpc, &details.public)?;
    details.private = add_subnets(
        rs,
        cfg,
        &vpc,
        SubnetTopology::Private,
        false,
        &cfg.vpc.subnets.private,
    )?;
    details.private_local_zone = add_subnets(
        rs,
        cfg,
        &vpc,
        SubnetTopology::Private,
        true,
        &cfg.vpc.local_zone_subnets.private,
    )?;

    let network = Network { vpc, subnets: details };
    add_network_outputs(rs, cfg, &network)?;
    Ok(network)
}

fn add_subnets(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    vpc: &Value,
    topology: SubnetTopology,
    local_zone: bool,
    subnets: &IndexMap<String, SubnetSpec>,
) -> Result<Vec<SubnetResource>> {
    let mut out = Vec::with_capacity(subnets.len());
    for (index, (alias, spec)) in subnets.iter().enumerate() {
        let zone = if spec.az.is_empty() { alias.as_str() } else { spec.az.as_str() };
        let cidr = spec.cidr.ok_or_else(|| {
            Error::missing_field(
                format!("vpc.subnets.{}.cidr", alias),
                "a dedicated VPC is created",
            )
        })?;
        let name = subnet_resource_name(topology, local_zone, zone);

        let mut subnet = Resource::new(ResourceKind::Subnet)
            .with("AvailabilityZone", zone)
            .with("CidrBlock", cidr.to_string())
            .with("VpcId", vpc.clone())
            .with_opt("OutpostArn", subnet_outpost_arn(cfg, spec));
        if topology == SubnetTopology::Public {
            subnet = subnet.with("MapPublicIpOnLaunch", true);
        }
        if let Some(mut tagged) = subnet.taggable() {
            tagged.set_tag(subnet_role_tag(topology), Value::from("1"));
        }
        let subnet_ref = rs.add_resource(&name, subnet)?;

        if cfg.vpc.auto_allocate_ipv6 {
            // Auto-allocated blocks are /56; every subnet takes a /64 slot
            rs.add_resource(
                &format!("{}CIDRv6", name),
                Resource::new(ResourceKind::SubnetCidrBlock)
                    .with("SubnetId", subnet_ref.clone())
                    .with(
                        "Ipv6CidrBlock",
                        Value::select(
                            subnet_ipv6_index(topology, local_zone, index, cfg),
                            Value::cidr(
                                Value::select(0, Value::get_att(VPC_RESOURCE, "Ipv6CidrBlocks")),
                                subnet_ipv6_count(cfg),
                                64,
                            ),
                        ),
                    )
                    .depends_on(AUTO_ALLOCATED_CIDR_V6),
            )?;
        }

        let route_table = match topology {
            SubnetTopology::Public => Value::reference(PUBLIC_ROUTE_TABLE),
            SubnetTopology::Private => Value::reference(private_route_table_name(zone)),
        };
        let lz = if local_zone { "LocalZone" } else { "" };
        rs.add_resource(
            &format!("RouteTableAssociation{}{}{}", lz, topology, az_resource_name(zone)),
            Resource::new(ResourceKind::SubnetRouteTableAssociation)
                .with("RouteTableId", route_table.clone())
                .with("SubnetId", subnet_ref.clone()),
        )?;

        out.push(SubnetResource {
            subnet: subnet_ref,
            availability_zone: zone.to_string(),
            route_table: Some(route_table),
        });
    }
    Ok(out)
}

// Publics take the first slots, privates follow; local zones come after
// the availability zones of the same topology
fn subnet_ipv6_index(
    topology: SubnetTopology,
    local_zone: bool,
    index: usize,
    cfg: &ClusterConfig,
) -> u32 {
    let (azs, lzs) = (&cfg.vpc.subnets, &cfg.vpc.local_zone_subnets);
    let mut offset = match topology {
        SubnetTopology::Public => 0,
        SubnetTopology::Private => azs.public.len() + lzs.public.len(),
    };
    if local_zone {
        offset += azs.for_topology(topology).len();
    }
    u32::try_from(offset + index).unwrap_or(u32::MAX)
}

/// `Fn::Cidr` count for subnet /64 slots: two per availability zone plus
/// two spare, never fewer than the subnets that select from it.
fn subnet_ipv6_count(cfg: &ClusterConfig) -> u32 {
    let (azs, lzs) = (&cfg.vpc.subnets, &cfg.vpc.local_zone_subnets);
    let total = azs.public.len() + azs.private.len() + lzs.public.len() + lzs.private.len();
    let zones = if cfg.availability_zones.is_empty() {
        azs.public.len().max(azs.private.len())
    } else {
        cfg.availability_zones.len()
    };
    u32::try_from((2 * zones + 2).max(total)).unwrap_or(u32::MAX)
}

/// Zones whose private subnets need a route table, in declared order.
fn private_zones(cfg: &ClusterConfig) -> Vec<String> {
    let mut zones: Vec<String> = Vec::new();
    for (alias, spec) in cfg
        .vpc
        .subnets
        .private
        .iter()
        .chain(cfg.vpc.local_zone_subnets.private.iter())
    {
        let zone = if spec.az.is_empty() { alias } else { &spec.az };
        if !zones.contains(zone) {
            zones.push(zone.clone());
        }
    }
    zones
}

fn private_route_tables(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    vpc: &Value,
) -> Result<Vec<(String, Value)>> {
    private_zones(cfg)
        .into_iter()
        .map(|zone| {
            let rt = rs.add_resource(
                &private_route_table_name(&zone),
                Resource::new(ResourceKind::RouteTable).with("VpcId", vpc.clone()),
            )?;
            Ok((zone, rt))
        })
        .collect()
}

fn add_nat_gateways(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    vpc: &Value,
    public: &[SubnetResource],
) -> Result<()> {
    let route_tables = private_route_tables(rs, cfg, vpc)?;
    match cfg.vpc.nat.gateway {
        NatMode::Disable => Ok(()),
        NatMode::Single => {
            let first = public
                .first()
                .ok_or_else(|| {
                    Error::invalid_config("a NAT gateway needs at least one public subnet")
                })?;
            let nat = add_nat_gateway(rs, "", &first.subnet)?;
            for (zone, rt) in route_tables {
                add_nat_route(rs, &zone, rt, nat.clone())?;
            }
            Ok(())
        }
        NatMode::HighlyAvailable => {
            let mut gateways: Vec<(String, Value)> = Vec::with_capacity(public.len());
            for subnet in public {
                let suffix = az_resource_name(&subnet.availability_zone);
                let nat = add_nat_gateway(rs, &suffix, &subnet.subnet)?;
                gateways.push((subnet.availability_zone.clone(), nat));
            }
            for (zone, rt) in route_tables {
                // zones without a public subnet (local zones) use the first gateway
                let nat = gateways
                    .iter()
                    .find(|(z, _)| *z == zone)
                    .or_else(|| gateways.first())
                    .map(|(_, nat)| nat.clone())
                    .ok_or_else(|| {
                        Error::invalid_config("a NAT gateway needs at least one public subnet")
                    })?;
                add_nat_route(rs, &zone, rt, nat)?;
            }
            Ok(())
        }
    }
}

fn add_nat_gateway(rs: &mut ResourceSet, suffix: &str, subnet: &Value) -> Result<Value> {
    let eip_name = format!("NATIP{}", suffix);
    rs.add_resource(
        &eip_name,
        Resource::new(ResourceKind::Eip)
            .with("Domain", "vpc")
            .depends_on(GATEWAY_ATTACHMENT),
    )?;
    rs.add_resource(
        &format!("NATGateway{}", suffix),
        Resource::new(ResourceKind::NatGateway)
            .with("AllocationId", Value::get_att(&eip_name, "AllocationId"))
            .with("SubnetId", subnet.clone()),
    )
}

fn add_nat_route(
    rs: &mut ResourceSet,
    zone: &str,
    route_table: Value,
    nat: Value,
) -> Result<Value> {
    rs.add_resource(
        &format!("NATPrivateSubnetRoute{}", az_resource_name(zone)),
        Resource::new(ResourceKind::Route)
            .with("RouteTableId", route_table)
            .with("DestinationCidrBlock", INTERNET_CIDR)
            .with("NatGatewayId", nat),
    )
}

/// Outputs shared by every network builder.
pub fn add_network_outputs(
    rs: &mut ResourceSet,
    cfg: &ClusterConfig,
    network: &Network,
) -> Result<()> {
    rs.define_output(outputs::CLUSTER_VPC, network.vpc.clone(), true, |v, cfg| {
        cfg.vpc.id = Some(v.to_string());
        Ok(())
    })?;
    let subnets = &network.subnets;
    let joined = [
        (outputs::CLUSTER_SUBNETS_PRIVATE, subnets.private_refs(), SubnetMapping::Private),
        (outputs::CLUSTER_SUBNETS_PUBLIC, subnets.public_refs(), SubnetMapping::Public),
        (
            outputs::CLUSTER_SUBNETS_LOCAL_ZONE_PRIVATE,
            subnets.private_local_zone.iter().map(|s| s.subnet.clone()).collect(),
            SubnetMapping::LocalZonePrivate,
        ),
        (
            outputs::CLUSTER_SUBNETS_LOCAL_ZONE_PUBLIC,
            subnets.public_local_zone.iter().map(|s| s.subnet.clone()).collect(),
            SubnetMapping::LocalZonePublic,
        ),
    ];
    for (name, refs, mapping) in joined {
        if !refs.is_empty() {
            define_subnet_output(rs, name, refs, mapping)?;
        }
    }
    rs.define_output_without_collector(
        outputs::CLUSTER_FEATURE_NAT_MODE,
        Value::string(cfg.vpc.nat.gateway.to_string()),
        false,
    )?;
    rs.define_output_without_collector(
        outputs::CLUSTER_FULLY_PRIVATE,
        Value::bool(cfg.is_fully_private()),
        false,
    )
}
