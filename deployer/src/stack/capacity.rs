//! ECS cluster and the EC2 capacity it schedules onto.

use super::{iam::Role, network::Network, Error};
use crate::template::{base64, get_att, join, reference, Parameter, Resource, Template};
use serde_json::{json, Value};

/// Public SSM parameter holding the recommended ECS-optimized Amazon Linux 2 image
pub const ECS_OPTIMIZED_AMI_PATH: &str =
    "/aws/service/ecs/optimized-ami/amazon-linux-2/recommended/image_id";

/// Template parameter resolving [ECS_OPTIMIZED_AMI_PATH]
pub const ECS_OPTIMIZED_AMI_PARAMETER: &str = "EcsOptimizedAmi";

/// Address every ingress rule is opened to
pub const ANY_IPV4: &str = "0.0.0.0/0";

/// An ECS cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cluster {
    pub id: String,
}

impl Cluster {
    pub fn synthesize(&self, template: &mut Template, tags: &Value) {
        template.add_resource(
            &self.id,
            Resource::new("AWS::ECS::Cluster", json!({ "Tags": tags })),
        );
    }
}

/// Inbound access to the capacity group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConfig {
    pub protocol: String,
    pub port: u16,
    pub cidr: String,
}

impl PortConfig {
    pub fn tcp_from_any(port: u16) -> Self {
        Self {
            protocol: "tcp".to_string(),
            port,
            cidr: ANY_IPV4.to_string(),
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "CidrIp": self.cidr,
            "Description": format!("from {}:{}", self.cidr, self.port),
            "FromPort": self.port,
            "IpProtocol": self.protocol,
            "ToPort": self.port,
        })
    }
}

/// Commands run once on every instance at launch, in order.
///
/// Nothing checks that they succeed; a failure only shows up later when a container cannot
/// use the mount.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapScript {
    pub commands: Vec<String>,
}

impl BootstrapScript {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    /// Renders instance user data: join `cluster`, keep containers off the instance metadata
    /// endpoint, then run the script.
    pub fn render(&self, cluster: &Cluster) -> Value {
        let mut parts = vec![
            json!("#!/bin/bash\necho ECS_CLUSTER="),
            reference(&cluster.id),
            json!(" >> /etc/ecs/ecs.config\n"),
            json!("sudo iptables --insert FORWARD 1 --in-interface docker+ --destination 169.254.169.254/32 --jump DROP\n"),
            json!("sudo service iptables save\n"),
            json!("echo ECS_AWSVPC_BLOCK_IMDS=true >> /etc/ecs/ecs.config\n"),
        ];
        parts.extend(self.commands.iter().map(|command| json!(format!("{command}\n"))));
        base64(join("", parts))
    }
}

/// An auto-scaled group of EC2 instances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapacityGroup {
    pub id: String,
    pub instance_type: String,
    pub min_capacity: u32,
    pub max_capacity: u32,
    /// Execution identity of the instances
    pub role: Role,
    pub ingress: Vec<PortConfig>,
}

impl CapacityGroup {
    fn security_group_id(&self) -> String {
        format!("{}InstanceSecurityGroup", self.id)
    }

    fn instance_profile_id(&self) -> String {
        format!("{}InstanceProfile", self.id)
    }

    fn launch_template_id(&self) -> String {
        format!("{}LaunchTemplate", self.id)
    }

    /// Opens `port` to every IPv4 address.
    pub fn allow_from_any_ipv4(&mut self, port: u16) {
        self.ingress.push(PortConfig::tcp_from_any(port));
    }
}

/// Binds a [CapacityGroup] to a [Cluster] with managed scaling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapacityProvider {
    pub id: String,
    pub group: CapacityGroup,
    /// Target utilization percentage for managed scaling
    pub target_capacity: u8,
    pub managed_termination_protection: bool,
}

impl CapacityProvider {
    pub fn validate(&self) -> Result<(), Error> {
        let group = &self.group;
        if group.min_capacity > group.max_capacity || group.max_capacity == 0 {
            return Err(Error::InvalidCapacity {
                min: group.min_capacity,
                max: group.max_capacity,
            });
        }
        Ok(())
    }

    pub fn synthesize(
        &self,
        template: &mut Template,
        cluster: &Cluster,
        network: &Network,
        script: &BootstrapScript,
        tags: &Value,
    ) {
        let group = &self.group;
        template.add_parameter(
            ECS_OPTIMIZED_AMI_PARAMETER,
            Parameter::new("AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>")
                .with_default(ECS_OPTIMIZED_AMI_PATH),
        );

        group.role.synthesize(template, tags);
        template.add_resource(
            group.instance_profile_id(),
            Resource::new(
                "AWS::IAM::InstanceProfile",
                json!({ "Roles": [reference(&group.role.id)] }),
            ),
        );
        template.add_resource(
            group.security_group_id(),
            Resource::new(
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": format!("{} instances", group.id),
                    "VpcId": network.vpc_id(),
                    "SecurityGroupEgress": [{
                        "CidrIp": ANY_IPV4,
                        "Description": "Allow all outbound traffic by default",
                        "IpProtocol": "-1",
                    }],
                    "SecurityGroupIngress": group.ingress.iter().map(PortConfig::to_value).collect::<Vec<_>>(),
                    "Tags": tags,
                }),
            ),
        );

        let mut launch_template = Resource::new(
            "AWS::EC2::LaunchTemplate",
            json!({
                "LaunchTemplateData": {
                    "IamInstanceProfile": { "Arn": get_att(&group.instance_profile_id(), "Arn") },
                    "ImageId": reference(ECS_OPTIMIZED_AMI_PARAMETER),
                    "InstanceType": group.instance_type,
                    "SecurityGroupIds": [get_att(&group.security_group_id(), "GroupId")],
                    "UserData": script.render(cluster),
                },
            }),
        );
        if let Some(policy) = group.role.default_policy_id() {
            launch_template = launch_template.depends_on(policy);
        }
        template.add_resource(group.launch_template_id(), launch_template);

        let propagated: Vec<Value> = tags
            .as_array()
            .into_iter()
            .flatten()
            .map(|tag| {
                let mut tag = tag.clone();
                tag["PropagateAtLaunch"] = json!(true);
                tag
            })
            .collect();
        template.add_resource(
            &group.id,
            Resource::new(
                "AWS::AutoScaling::AutoScalingGroup",
                json!({
                    "MinSize": group.min_capacity.to_string(),
                    "MaxSize": group.max_capacity.to_string(),
                    "LaunchTemplate": {
                        "LaunchTemplateId": reference(&group.launch_template_id()),
                        "Version": get_att(&group.launch_template_id(), "LatestVersionNumber"),
                    },
                    "NewInstancesProtectedFromScaleIn": self.managed_termination_protection,
                    "VPCZoneIdentifier": network.public_subnet_ids(),
                    "Tags": propagated,
                }),
            ),
        );

        let enabled = |on: bool| if on { "ENABLED" } else { "DISABLED" };
        template.add_resource(
            &self.id,
            Resource::new(
                "AWS::ECS::CapacityProvider",
                json!({
                    "AutoScalingGroupProvider": {
                        "AutoScalingGroupArn": reference(&group.id),
                        "ManagedScaling": {
                            "Status": "ENABLED",
                            "TargetCapacity": self.target_capacity,
                        },
                        "ManagedTerminationProtection": enabled(self.managed_termination_protection),
                    },
                    "Tags": tags,
                }),
            ),
        );
        template.add_resource(
            association_id(cluster),
            Resource::new(
                "AWS::ECS::ClusterCapacityProviderAssociations",
                json!({
                    "Cluster": reference(&cluster.id),
                    "CapacityProviders": [reference(&self.id)],
                    "DefaultCapacityProviderStrategy": [],
                }),
            ),
        );
    }
}

/// Logical id of the resource registering capacity providers with `cluster`.
pub fn association_id(cluster: &Cluster) -> String {
    format!("{}CapacityProviderAssociations", cluster.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered_lines(script: &BootstrapScript) -> Vec<String> {
        let cluster = Cluster {
            id: "Cluster".into(),
        };
        let value = script.render(&cluster);
        value["Fn::Base64"]["Fn::Join"][1]
            .as_array()
            .unwrap()
            .iter()
            .map(|part| match part.as_str() {
                Some(text) => text.to_string(),
                None => format!("<{}>", part["Ref"].as_str().unwrap()),
            })
            .collect::<String>()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_bootstrap_joins_cluster_before_script() {
        let script = BootstrapScript::new(["first", "second"]);
        let lines = rendered_lines(&script);
        assert_eq!(lines[0], "#!/bin/bash");
        assert_eq!(lines[1], "echo ECS_CLUSTER=<Cluster> >> /etc/ecs/ecs.config");
        assert_eq!(&lines[lines.len() - 2..], ["first", "second"]);
    }

    #[test]
    fn test_port_config_open_to_any() {
        let rule = PortConfig::tcp_from_any(443).to_value();
        assert_eq!(rule["CidrIp"], ANY_IPV4);
        assert_eq!(rule["FromPort"], 443);
        assert_eq!(rule["ToPort"], 443);
        assert_eq!(rule["IpProtocol"], "tcp");
    }
}
