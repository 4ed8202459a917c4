//! Network placement: create a new VPC or reuse an existing one.

use super::Error;
use crate::{
    config::DeploymentConfig,
    template::{get_azs, reference, select, Parameter, Resource, Template},
};
use serde_json::{json, Value};
use std::{fmt, net::Ipv4Addr, str::FromStr};

/// Logical id of a newly created VPC
pub const VPC_ID: &str = "Vpc";

/// Parameter carrying the public subnets of an existing VPC
pub const PUBLIC_SUBNETS_PARAMETER: &str = "PublicSubnetIds";

/// Smallest subnet AWS accepts
const MAX_SUBNET_PREFIX: u8 = 28;

/// An IPv4 address block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    base: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(base: Ipv4Addr, prefix: u8) -> Result<Self, Error> {
        if prefix > 32 {
            return Err(Error::InvalidCidr(format!("{base}/{prefix}")));
        }
        let cidr = Self { base, prefix };
        if u32::from(base) & !cidr.mask() != 0 {
            return Err(Error::InvalidCidr(format!(
                "{base}/{prefix} has host bits set"
            )));
        }
        Ok(cidr)
    }

    fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - p),
        }
    }

    fn size(&self) -> u64 {
        1u64 << (32 - self.prefix)
    }

    /// Carves the first `count` consecutive blocks of length `prefix` out of this block.
    pub fn subdivide(&self, prefix: u8, count: usize) -> Result<Vec<Ipv4Cidr>, Error> {
        if prefix < self.prefix || prefix > 32 {
            return Err(Error::InvalidSubnetLayout(format!(
                "/{prefix} cannot be carved from {self}"
            )));
        }
        let block = 1u64 << (32 - prefix);
        if block * count as u64 > self.size() {
            return Err(Error::InvalidSubnetLayout(format!(
                "{count} x /{prefix} do not fit in {self}"
            )));
        }
        let start = u64::from(u32::from(self.base));
        (0..count as u64)
            .map(|i| Ipv4Cidr::new(Ipv4Addr::from((start + i * block) as u32), prefix))
            .collect()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidCidr(s.to_string());
        let (base, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let base = base.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
        Ipv4Cidr::new(base, prefix)
    }
}

/// How a new VPC is partitioned into public subnets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetLayout {
    pub vpc_cidr: String,
    /// Number of availability zones (one public subnet each)
    pub max_azs: usize,
    /// Prefix length of each public subnet
    pub cidr_mask: u8,
}

impl Default for SubnetLayout {
    fn default() -> Self {
        Self {
            vpc_cidr: "10.0.0.0/16".to_string(),
            max_azs: 2,
            cidr_mask: 23,
        }
    }
}

/// Where the deployment is placed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkRef {
    CreateNew(SubnetLayout),
    UseExisting(String),
}

impl NetworkRef {
    /// Reuses the configured VPC, or creates one with the default layout.
    pub fn from_config(config: &DeploymentConfig) -> Self {
        match &config.network_id {
            Some(id) => NetworkRef::UseExisting(id.clone()),
            None => NetworkRef::CreateNew(SubnetLayout::default()),
        }
    }
}

/// A public subnet in a new VPC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub cidr: Ipv4Cidr,
    pub az_index: usize,
}

impl Subnet {
    fn route_table_id(&self) -> String {
        format!("{}RouteTable", self.id)
    }
}

/// A VPC declared by this deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vpc {
    pub cidr: Ipv4Cidr,
    pub subnets: Vec<Subnet>,
}

/// The network a deployment lives in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Network {
    Created(Vpc),
    /// An existing VPC whose public subnets are supplied at submission.
    Imported { vpc_id: String },
}

impl Network {
    pub fn build(network: &NetworkRef) -> Result<Self, Error> {
        match network {
            NetworkRef::UseExisting(vpc_id) => Ok(Network::Imported {
                vpc_id: vpc_id.clone(),
            }),
            NetworkRef::CreateNew(layout) => {
                if layout.max_azs == 0 {
                    return Err(Error::InvalidSubnetLayout(
                        "at least one availability zone is required".into(),
                    ));
                }
                if layout.cidr_mask > MAX_SUBNET_PREFIX {
                    return Err(Error::InvalidSubnetLayout(format!(
                        "/{} is smaller than /{MAX_SUBNET_PREFIX}",
                        layout.cidr_mask
                    )));
                }
                let cidr: Ipv4Cidr = layout.vpc_cidr.parse()?;
                let subnets = cidr
                    .subdivide(layout.cidr_mask, layout.max_azs)?
                    .into_iter()
                    .enumerate()
                    .map(|(i, cidr)| Subnet {
                        id: format!("{VPC_ID}PublicSubnet{}Subnet", i + 1),
                        cidr,
                        az_index: i,
                    })
                    .collect();
                Ok(Network::Created(Vpc { cidr, subnets }))
            }
        }
    }

    /// The VPC id as a template value.
    pub fn vpc_id(&self) -> Value {
        match self {
            Network::Created(_) => reference(VPC_ID),
            Network::Imported { vpc_id } => json!(vpc_id),
        }
    }

    /// The public subnet ids as a template list.
    pub fn public_subnet_ids(&self) -> Value {
        match self {
            Network::Created(vpc) => {
                Value::Array(vpc.subnets.iter().map(|s| reference(&s.id)).collect())
            }
            Network::Imported { .. } => reference(PUBLIC_SUBNETS_PARAMETER),
        }
    }

    pub fn synthesize(&self, template: &mut Template, tags: &Value) {
        let vpc = match self {
            Network::Imported { vpc_id } => {
                template.add_parameter(
                    PUBLIC_SUBNETS_PARAMETER,
                    Parameter::new("List<AWS::EC2::Subnet::Id>")
                        .with_description(format!("Public subnets of {vpc_id}")),
                );
                return;
            }
            Network::Created(vpc) => vpc,
        };

        let igw = format!("{VPC_ID}Igw");
        let attachment = format!("{VPC_ID}GatewayAttachment");
        template.add_resource(
            VPC_ID,
            Resource::new(
                "AWS::EC2::VPC",
                json!({
                    "CidrBlock": vpc.cidr.to_string(),
                    "EnableDnsHostnames": true,
                    "EnableDnsSupport": true,
                    "InstanceTenancy": "default",
                    "Tags": tags,
                }),
            ),
        );
        template.add_resource(
            &igw,
            Resource::new("AWS::EC2::InternetGateway", json!({ "Tags": tags })),
        );
        template.add_resource(
            &attachment,
            Resource::new(
                "AWS::EC2::VPCGatewayAttachment",
                json!({
                    "VpcId": reference(VPC_ID),
                    "InternetGatewayId": reference(&igw),
                }),
            ),
        );

        for subnet in &vpc.subnets {
            let route_table = subnet.route_table_id();
            template.add_resource(
                &subnet.id,
                Resource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": reference(VPC_ID),
                        "AvailabilityZone": select(subnet.az_index, get_azs()),
                        "CidrBlock": subnet.cidr.to_string(),
                        "MapPublicIpOnLaunch": true,
                        "Tags": tags,
                    }),
                ),
            );
            template.add_resource(
                &route_table,
                Resource::new(
                    "AWS::EC2::RouteTable",
                    json!({ "VpcId": reference(VPC_ID), "Tags": tags }),
                ),
            );
            template.add_resource(
                format!("{route_table}Association"),
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "RouteTableId": reference(&route_table),
                        "SubnetId": reference(&subnet.id),
                    }),
                ),
            );
            template.add_resource(
                format!("{}DefaultRoute", subnet.id),
                Resource::new(
                    "AWS::EC2::Route",
                    json!({
                        "RouteTableId": reference(&route_table),
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "GatewayId": reference(&igw),
                    }),
                )
                .depends_on(&attachment),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_subnets() {
        let Network::Created(vpc) = Network::build(&NetworkRef::CreateNew(SubnetLayout::default()))
            .unwrap()
        else {
            panic!("expected a new VPC");
        };
        assert_eq!(vpc.cidr.to_string(), "10.0.0.0/16");
        let cidrs: Vec<_> = vpc.subnets.iter().map(|s| s.cidr.to_string()).collect();
        assert_eq!(cidrs, ["10.0.0.0/23", "10.0.2.0/23"]);
        let azs: Vec<_> = vpc.subnets.iter().map(|s| s.az_index).collect();
        assert_eq!(azs, [0, 1]);
    }

    #[test]
    fn test_layout_does_not_fit() {
        let layout = SubnetLayout {
            vpc_cidr: "10.0.0.0/24".into(),
            max_azs: 2,
            cidr_mask: 24,
        };
        assert!(matches!(
            Network::build(&NetworkRef::CreateNew(layout)),
            Err(Error::InvalidSubnetLayout(_))
        ));
    }

    #[test]
    fn test_layout_requires_zone() {
        let layout = SubnetLayout {
            max_azs: 0,
            ..Default::default()
        };
        assert!(matches!(
            Network::build(&NetworkRef::CreateNew(layout)),
            Err(Error::InvalidSubnetLayout(_))
        ));
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!(
            "10.1.0.0/16".parse::<Ipv4Cidr>().unwrap().to_string(),
            "10.1.0.0/16"
        );
        assert!("10.1.0.1/16".parse::<Ipv4Cidr>().is_err());
        assert!("10.1.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.1.0.0".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_existing_network_is_parameterized() {
        let network = Network::build(&NetworkRef::UseExisting("vpc-0abc".into())).unwrap();
        assert_eq!(network.vpc_id(), json!("vpc-0abc"));
        assert_eq!(network.public_subnet_ids(), reference(PUBLIC_SUBNETS_PARAMETER));

        let mut template = Template::new("test");
        network.synthesize(&mut template, &json!([]));
        assert!(template.resources.is_empty());
        assert!(template.parameters.contains_key(PUBLIC_SUBNETS_PARAMETER));
    }
}
