//! Resolve an existing VPC and its public subnets.

use crate::aws::Error;
use aws_sdk_ec2::{error::ProvideErrorMetadata, types::Filter, Client as Ec2Client};
use tracing::info;

/// A subnet of the VPC being resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetInfo {
    pub id: String,
    pub availability_zone: String,
}

/// The parts of a route table that decide whether its subnets are public.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteTableInfo {
    /// Whether this is the VPC's main route table
    pub main: bool,
    /// Subnets explicitly associated with the table
    pub subnet_ids: Vec<String>,
    /// Whether any route targets an internet gateway
    pub routes_to_igw: bool,
}

/// Returns the subnets whose effective route table routes to an internet gateway, ordered by
/// availability zone.
///
/// Subnets without an explicit association use the main route table.
pub fn select_public(subnets: &[SubnetInfo], tables: &[RouteTableInfo]) -> Vec<String> {
    let main_is_public = tables.iter().any(|t| t.main && t.routes_to_igw);
    let mut public: Vec<&SubnetInfo> = subnets
        .iter()
        .filter(|subnet| {
            match tables
                .iter()
                .find(|t| t.subnet_ids.iter().any(|id| *id == subnet.id))
            {
                Some(table) => table.routes_to_igw,
                None => main_is_public,
            }
        })
        .collect();
    public.sort_by(|a, b| {
        (a.availability_zone.as_str(), a.id.as_str())
            .cmp(&(b.availability_zone.as_str(), b.id.as_str()))
    });
    public.into_iter().map(|s| s.id.clone()).collect()
}

fn vpc_filter(vpc_id: &str) -> Filter {
    Filter::builder().name("vpc-id").values(vpc_id).build()
}

/// Looks up the public subnets of the VPC `vpc_id`.
pub async fn public_subnets(client: &Ec2Client, vpc_id: &str) -> Result<Vec<String>, Error> {
    match client.describe_vpcs().vpc_ids(vpc_id).send().await {
        Ok(output) if !output.vpcs().is_empty() => {}
        Ok(_) => return Err(Error::VpcNotFound(vpc_id.to_string())),
        Err(err) => {
            let service_err = err.into_service_error();
            if service_err.code() == Some("InvalidVpcID.NotFound") {
                return Err(Error::VpcNotFound(vpc_id.to_string()));
            }
            return Err(aws_sdk_ec2::Error::from(service_err).into());
        }
    }

    let subnets: Vec<SubnetInfo> = client
        .describe_subnets()
        .filters(vpc_filter(vpc_id))
        .send()
        .await
        .map_err(|e| aws_sdk_ec2::Error::from(e.into_service_error()))?
        .subnets()
        .iter()
        .filter_map(|subnet| {
            Some(SubnetInfo {
                id: subnet.subnet_id()?.to_string(),
                availability_zone: subnet.availability_zone().unwrap_or_default().to_string(),
            })
        })
        .collect();
    let tables: Vec<RouteTableInfo> = client
        .describe_route_tables()
        .filters(vpc_filter(vpc_id))
        .send()
        .await
        .map_err(|e| aws_sdk_ec2::Error::from(e.into_service_error()))?
        .route_tables()
        .iter()
        .map(|table| RouteTableInfo {
            main: table
                .associations()
                .iter()
                .any(|a| a.main().unwrap_or(false)),
            subnet_ids: table
                .associations()
                .iter()
                .filter_map(|a| a.subnet_id().map(str::to_string))
                .collect(),
            routes_to_igw: table
                .routes()
                .iter()
                .any(|r| r.gateway_id().is_some_and(|g| g.starts_with("igw-"))),
        })
        .collect();

    let public = select_public(&subnets, &tables);
    if public.is_empty() {
        return Err(Error::NoPublicSubnets(vpc_id.to_string()));
    }
    info!(vpc = vpc_id, subnets = ?public, "resolved public subnets");
    Ok(public)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(id: &str, az: &str) -> SubnetInfo {
        SubnetInfo {
            id: id.into(),
            availability_zone: az.into(),
        }
    }

    #[test]
    fn test_explicit_association_wins() {
        let subnets = [subnet("subnet-b", "us-east-1b"), subnet("subnet-a", "us-east-1a")];
        let tables = [
            RouteTableInfo {
                main: true,
                subnet_ids: vec![],
                routes_to_igw: false,
            },
            RouteTableInfo {
                main: false,
                subnet_ids: vec!["subnet-a".into(), "subnet-b".into()],
                routes_to_igw: true,
            },
        ];
        assert_eq!(select_public(&subnets, &tables), ["subnet-a", "subnet-b"]);
    }

    #[test]
    fn test_private_subnets_excluded() {
        let subnets = [subnet("subnet-pub", "us-east-1a"), subnet("subnet-priv", "us-east-1a")];
        let tables = [
            RouteTableInfo {
                main: true,
                subnet_ids: vec![],
                routes_to_igw: true,
            },
            RouteTableInfo {
                main: false,
                subnet_ids: vec!["subnet-priv".into()],
                routes_to_igw: false,
            },
        ];
        assert_eq!(select_public(&subnets, &tables), ["subnet-pub"]);
    }

    #[test]
    fn test_no_gateway_no_public() {
        let subnets = [subnet("subnet-a", "us-east-1a")];
        let tables = [RouteTableInfo {
            main: true,
            ..Default::default()
        }];
        assert!(select_public(&subnets, &tables).is_empty());
    }
}
