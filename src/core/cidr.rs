//! CF-003: CIDR blocks and the partition arithmetic behind `Fn::Cidr`.
//!
//! `partition` reproduces the provisioning API's own `Fn::Cidr` function:
//! block `i` of `count` blocks with `host_bits` host bits starts at
//! `network + (i << host_bits)` and has prefix `width - host_bits`.
//! `split_into` is the VPC subnet layout used when no subnets are declared.

use crate::error::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Largest `count` the provisioning API accepts for `Fn::Cidr`.
pub const MAX_PARTITIONS: u32 = 256;

/// VPC block used when a config names none: 192.168.0.0/16.
pub const DEFAULT_VPC_CIDR: Ipv4Cidr = Ipv4Cidr {
    network: 0xC0A8_0000,
    prefix: 16,
};

/// An IPv4 network block, always stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Build a block; host bits of `addr` are masked off.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::cidr(format!("invalid IPv4 prefix /{}", prefix)));
        }
        Ok(Self {
            network: u32::from(addr) & mask_v4(prefix),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Whether `other` lies entirely inside this block.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && (other.network & mask_v4(self.prefix)) == self.network
    }

    /// Closed-form `Fn::Cidr`: the first `count` sub-blocks with `host_bits` host bits.
    pub fn partition(&self, count: u32, host_bits: u32) -> Result<Vec<Ipv4Cidr>> {
        check_partition(32, u32::from(self.prefix), count, host_bits)?;
        let new_prefix = (32 - host_bits) as u8;
        let mut blocks = Vec::with_capacity(count as usize);
        for i in 0..count {
            let offset = u64::from(i) << host_bits;
            blocks.push(Ipv4Cidr {
                network: (u64::from(self.network) + offset) as u32,
                prefix: new_prefix,
            });
        }
        Ok(blocks)
    }

    /// The `i`-th block of a `partition` without materializing the others.
    pub fn nth_partition(&self, index: u32, count: u32, host_bits: u32) -> Result<Ipv4Cidr> {
        check_partition(32, u32::from(self.prefix), count, host_bits)?;
        if index >= count {
            return Err(Error::cidr(format!(
                "index {} out of range for {} partitions",
                index, count
            )));
        }
        Ok(Ipv4Cidr {
            network: (u64::from(self.network) + (u64::from(index) << host_bits)) as u32,
            prefix: (32 - host_bits) as u8,
        })
    }

    /// Split into `size` blocks of `/network_length`, counting from the block start.
    pub fn split_into(&self, size: usize, network_length: u8) -> Result<Vec<Ipv4Cidr>> {
        if !(16..=28).contains(&network_length) {
            return Err(Error::cidr(
                "CIDR block size must be between a /16 netmask and /28 netmask",
            ));
        }
        let step = 32 - u32::from(network_length);
        let mut subnets = Vec::with_capacity(size);
        for i in 0..size {
            let n = u64::from(self.network) + ((i as u64) << step);
            if n > u64::from(u32::MAX) {
                return Err(Error::cidr(format!(
                    "{} cannot hold {} subnets of /{}",
                    self, size, network_length
                )));
            }
            subnets.push(Ipv4Cidr {
                network: n as u32,
                prefix: network_length,
            });
        }
        Ok(subnets)
    }
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn check_partition(width: u32, prefix: u32, count: u32, host_bits: u32) -> Result<()> {
    if count == 0 || count > MAX_PARTITIONS {
        return Err(Error::cidr(format!(
            "partition count must be between 1 and {}, got {}",
            MAX_PARTITIONS, count
        )));
    }
    if host_bits == 0 || host_bits >= width || host_bits > width - prefix {
        return Err(Error::cidr(format!(
            "{} host bits do not fit in a /{} block",
            host_bits, prefix
        )));
    }
    let available_bits = width - prefix - host_bits;
    if available_bits < 32 && u64::from(count) > (1u64 << available_bits) {
        return Err(Error::cidr(format!(
            "a /{} block holds at most {} blocks of /{}, {} requested",
            prefix,
            1u64 << available_bits,
            width - host_bits,
            count
        )));
    }
    Ok(())
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::cidr(format!("invalid CIDR {:?}: missing prefix", s)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| Error::cidr(format!("invalid CIDR {:?}: {}", s, e)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| Error::cidr(format!("invalid CIDR {:?}: {}", s, e)))?;
        Self::new(addr, prefix)
    }
}

impl Serialize for Ipv4Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for Ipv4Cidr {
    fn schema_name() -> String {
        "Ipv4Cidr".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// An IPv6 network block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv6Cidr {
    network: u128,
    prefix: u8,
}

impl Ipv6Cidr {
    pub fn new(addr: Ipv6Addr, prefix: u8) -> Result<Self> {
        if prefix > 128 {
            return Err(Error::cidr(format!("invalid IPv6 prefix /{}", prefix)));
        }
        let mask = if prefix == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(prefix))
        };
        Ok(Self {
            network: u128::from(addr) & mask,
            prefix,
        })
    }

    pub fn network(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.network)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Closed-form `Fn::Cidr` over an IPv6 block.
    pub fn partition(&self, count: u32, host_bits: u32) -> Result<Vec<Ipv6Cidr>> {
        check_partition(128, u32::from(self.prefix), count, host_bits)?;
        let new_prefix = (128 - host_bits) as u8;
        Ok((0..count)
            .map(|i| Ipv6Cidr {
                network: self.network + (u128::from(i) << host_bits),
                prefix: new_prefix,
            })
            .collect())
    }
}

impl fmt::Display for Ipv6Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for Ipv6Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::cidr(format!("invalid CIDR {:?}: missing prefix", s)))?;
        let addr: Ipv6Addr = addr
            .parse()
            .map_err(|e| Error::cidr(format!("invalid CIDR {:?}: {}", s, e)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| Error::cidr(format!("invalid CIDR {:?}: {}", s, e)))?;
        Self::new(addr, prefix)
    }
}
