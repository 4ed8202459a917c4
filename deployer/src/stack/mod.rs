//! Assemble the desired resource graph of an Arbitrum node deployment.
//!
//! [assemble] is a pure function of its inputs: the same [DeploymentConfig] and [NetworkRef]
//! always produce structurally identical graphs, and [ResourceGraph::synthesize] renders them to
//! identical templates. Nothing here talks to AWS.

use crate::{
    config::DeploymentConfig,
    template::{get_att, reference, Output, Template},
};
use serde_json::{json, Value};
use std::{collections::BTreeMap, path::PathBuf};
use thiserror::Error;
use tracing::debug;

pub mod capacity;
pub use capacity::{BootstrapScript, CapacityGroup, CapacityProvider, Cluster, PortConfig};
pub mod iam;
pub use iam::{Arn, PolicyStatement, Role};
pub mod network;
pub use network::{Network, NetworkRef, SubnetLayout};
pub mod task;
pub use task::{
    ContainerDefinition, ContainerImage, Link, LogDriver, LogMode, LogSink, MountPoint,
    NetworkMode, PortMapping, Service, TaskDefinition, Volume,
};

/// Name of the CloudFormation stack
pub const STACK_NAME: &str = "ArbitrumNodeApp";

/// Tag applied to every taggable resource
pub const APP_TAG: (&str, &str) = ("app", "Arbitrum Node");

/// Instance type of the capacity group (local NVMe storage)
pub const INSTANCE_TYPE: &str = "i3en.xlarge";

/// Public image of the node
pub const NODE_IMAGE: &str = "offchainlabs/arb-node:v1.4.0-f4bbe91";

/// Build context of the proxy image
pub const PROXY_BUILD_CONTEXT: &str = "docker/caddy";

/// Template parameter carrying the pushed proxy image
pub const PROXY_IMAGE_PARAMETER: &str = "CaddyImageUri";

/// Registry repository proxy images are pushed to
pub const ASSET_REPOSITORY: &str = "arbitrum-node-assets";

pub const NODE_CONTAINER: &str = "arbitrum";
pub const PROXY_CONTAINER: &str = "caddy";

/// Node JSON-RPC port
pub const RPC_PORT: u16 = 8547;

/// Node WebSocket port
pub const WS_PORT: u16 = 8548;

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

pub const MEMORY_RESERVATION_MIB: u32 = 1024;
pub const LOG_RETENTION_DAYS: u32 = 7;

/// Instance NVMe device holding chain data
pub const NVME_DEVICE: &str = "/dev/nvme1n1";

/// Where [NVME_DEVICE] is mounted on the instance
pub const NVME_MOUNT: &str = "/mnt/nvm";

/// Name of the task volume holding chain data
pub const DATA_VOLUME: &str = "nodedata";

/// Host directory backing [DATA_VOLUME]
pub const HOST_DATA_PATH: &str = "/mnt/nvm/nodedata";

/// Where the node expects its data directory
pub const NODE_DATA_PATH: &str = "/home/user/.arbitrum/mainnet";

/// Flags passed to the node after the L1 endpoint
pub const NODE_FLAGS: &[&str] = &[
    "--core.checkpoint-gas-frequency",
    "156250000",
    "--node.cache.allow-slow-lookup",
    "--node.rpc.tracing.enable",
];

/// Environment variable names the proxy reads its credentials from
pub const PROXY_USERNAME_VAR: &str = "BASICAUTH_USERNAME";
pub const PROXY_PASSWORD_HASH_VAR: &str = "BASICAUTH_HASHED_PASSWORD";

/// Record management the proxy needs to answer DNS challenges
pub const DNS_RECORD_ACTIONS: &[&str] = &[
    "route53:ListResourceRecordSets",
    "route53:GetChange",
    "route53:ChangeResourceRecordSets",
];
pub const DNS_RECORD_RESOURCES: &[&str] = &[
    "arn:aws:route53:::hostedzone/*",
    "arn:aws:route53:::change/*",
];
pub const DNS_LIST_ACTIONS: &[&str] = &["route53:ListHostedZonesByName", "route53:ListHostedZones"];

/// Managed policy granting remote administration through Systems Manager
pub const SSM_MANAGED_POLICY: &str = "AmazonSSMManagedInstanceCore";

const CLUSTER_ID: &str = "ArbitrumNodeCluster";
const ASG_ID: &str = "ArbitrumNodeAsg";
const CAPACITY_PROVIDER_ID: &str = "ArbitrumNodeAsgCapacityProvider";
const LOG_GROUP_ID: &str = "LogGroup";
const TASK_DEFINITION_ID: &str = "ArbitrumNodeTaskDefinition";
const SERVICE_ID: &str = "ArbitrumNodeService";

/// Errors that can occur while assembling a [ResourceGraph].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid cidr: {0}")]
    InvalidCidr(String),
    #[error("invalid subnet layout: {0}")]
    InvalidSubnetLayout(String),
    #[error("invalid image reference: {0}")]
    InvalidImage(String),
    #[error("policy statement on {0} has no actions or no resources")]
    EmptyStatement(String),
    #[error("invalid capacity: min {min} max {max}")]
    InvalidCapacity { min: u32, max: u32 },
    #[error("{from} references unknown {to}")]
    DanglingReference { from: String, to: String },
}

/// A container image that must be built and pushed before the template is submitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Asset {
    pub container: String,
    pub directory: PathBuf,
    pub parameter: String,
}

/// The complete desired state of a deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceGraph {
    pub stack_name: String,
    pub tags: BTreeMap<String, String>,
    pub network: Network,
    pub cluster: Cluster,
    pub capacity_provider: CapacityProvider,
    pub bootstrap_script: BootstrapScript,
    pub log_sink: LogSink,
    pub task_definition: TaskDefinition,
    pub service: Service,
}

/// Builds the resource graph for `config` placed in `network`.
pub fn assemble(config: &DeploymentConfig, network: &NetworkRef) -> Result<ResourceGraph, Error> {
    let network = Network::build(network)?;
    let cluster = Cluster {
        id: CLUSTER_ID.to_string(),
    };

    // Capacity
    let mut instance_role = Role::new(format!("{ASG_ID}InstanceRole"), "ec2.amazonaws.com");
    instance_role.add_managed_policy(SSM_MANAGED_POLICY);
    instance_role.add_to_policy(PolicyStatement::new(
        [
            "ecs:DeregisterContainerInstance",
            "ecs:RegisterContainerInstance",
            "ecs:Submit*",
        ],
        [Arn::attribute(CLUSTER_ID, "Arn")],
    ))?;
    instance_role.add_to_policy(PolicyStatement::new(
        ["ecs:Poll", "ecs:StartTelemetrySession"],
        [Arn::literal("*")],
    ))?;
    instance_role.add_to_policy(PolicyStatement::new(
        [
            "ecs:DiscoverPollEndpoint",
            "ecr:GetAuthorizationToken",
            "logs:CreateLogStream",
            "logs:PutLogEvents",
        ],
        [Arn::literal("*")],
    ))?;
    let mut group = CapacityGroup {
        id: ASG_ID.to_string(),
        instance_type: INSTANCE_TYPE.to_string(),
        min_capacity: 1,
        max_capacity: 1,
        role: instance_role,
        ingress: Vec::new(),
    };
    group.allow_from_any_ipv4(HTTP_PORT);
    group.allow_from_any_ipv4(HTTPS_PORT);
    let capacity_provider = CapacityProvider {
        id: CAPACITY_PROVIDER_ID.to_string(),
        group,
        target_capacity: 100,
        managed_termination_protection: true,
    };
    capacity_provider.validate()?;

    let bootstrap_script = BootstrapScript::new([
        format!("sudo mkdir {NVME_MOUNT}/"),
        format!("sudo mkfs -t ext4 {NVME_DEVICE}"),
        format!("sudo mount -t ext4 {NVME_DEVICE} {NVME_MOUNT}"),
        format!("sudo mkdir -p {HOST_DATA_PATH}"),
        format!("sudo chown ec2-user:ec2-user {HOST_DATA_PATH}"),
    ]);

    let log_sink = LogSink {
        id: LOG_GROUP_ID.to_string(),
        retention_days: LOG_RETENTION_DAYS,
    };
    let logging = |prefix: &str| LogDriver {
        log_sink: log_sink.id.clone(),
        stream_prefix: prefix.to_string(),
        mode: LogMode::NonBlocking,
    };

    // Containers
    let mut command = vec!["--l1.url".to_string(), config.upstream_rpc_url.clone()];
    command.extend(NODE_FLAGS.iter().map(|flag| flag.to_string()));
    let node = ContainerDefinition {
        name: NODE_CONTAINER.to_string(),
        image: ContainerImage::Registry(NODE_IMAGE.to_string()),
        memory_reservation_mib: MEMORY_RESERVATION_MIB,
        logging: logging(NODE_CONTAINER),
        command,
        environment: BTreeMap::new(),
        port_mappings: vec![PortMapping::container(RPC_PORT), PortMapping::container(WS_PORT)],
        mount_points: vec![MountPoint {
            source_volume: DATA_VOLUME.to_string(),
            container_path: NODE_DATA_PATH.to_string(),
            read_only: false,
        }],
        links: Vec::new(),
    };
    let proxy = ContainerDefinition {
        name: PROXY_CONTAINER.to_string(),
        image: ContainerImage::Asset {
            directory: PathBuf::from(PROXY_BUILD_CONTEXT),
            parameter: PROXY_IMAGE_PARAMETER.to_string(),
        },
        memory_reservation_mib: MEMORY_RESERVATION_MIB,
        logging: logging(PROXY_CONTAINER),
        command: Vec::new(),
        environment: BTreeMap::from([
            (PROXY_USERNAME_VAR.to_string(), config.proxy_username.clone()),
            (
                PROXY_PASSWORD_HASH_VAR.to_string(),
                config.proxy_password_hash.clone(),
            ),
        ]),
        port_mappings: vec![PortMapping::host(HTTP_PORT), PortMapping::host(HTTPS_PORT)],
        mount_points: Vec::new(),
        links: vec![Link {
            container: NODE_CONTAINER.to_string(),
            alias: NODE_CONTAINER.to_string(),
        }],
    };

    // Roles
    let mut task_role = Role::new(
        format!("{TASK_DEFINITION_ID}TaskRole"),
        "ecs-tasks.amazonaws.com",
    );
    task_role.add_to_policy(PolicyStatement::new(
        DNS_RECORD_ACTIONS.iter().copied(),
        DNS_RECORD_RESOURCES.iter().map(|arn| Arn::literal(*arn)),
    ))?;
    task_role.add_to_policy(PolicyStatement::new(
        DNS_LIST_ACTIONS.iter().copied(),
        [Arn::literal("*")],
    ))?;
    let mut execution_role = Role::new(
        format!("{TASK_DEFINITION_ID}ExecutionRole"),
        "ecs-tasks.amazonaws.com",
    );
    execution_role.add_to_policy(PolicyStatement::new(
        [
            "ecr:BatchCheckLayerAvailability",
            "ecr:GetDownloadUrlForLayer",
            "ecr:BatchGetImage",
        ],
        [Arn::Sub(format!(
            "arn:${{AWS::Partition}}:ecr:${{AWS::Region}}:${{AWS::AccountId}}:repository/{ASSET_REPOSITORY}"
        ))],
    ))?;
    execution_role.add_to_policy(PolicyStatement::new(
        ["ecr:GetAuthorizationToken"],
        [Arn::literal("*")],
    ))?;
    execution_role.add_to_policy(PolicyStatement::new(
        ["logs:CreateLogStream", "logs:PutLogEvents"],
        [Arn::attribute(&log_sink.id, "Arn")],
    ))?;

    let task_definition = TaskDefinition {
        id: TASK_DEFINITION_ID.to_string(),
        network_mode: NetworkMode::Bridge,
        volumes: vec![Volume {
            name: DATA_VOLUME.to_string(),
            host_path: HOST_DATA_PATH.to_string(),
        }],
        containers: vec![node, proxy],
        task_role,
        execution_role,
    };
    task_definition.validate(&[&log_sink])?;

    let service = Service {
        id: SERVICE_ID.to_string(),
        cluster: cluster.id.clone(),
        task_definition: task_definition.id.clone(),
        desired_count: None,
    };

    let graph = ResourceGraph {
        stack_name: STACK_NAME.to_string(),
        tags: BTreeMap::from([(APP_TAG.0.to_string(), APP_TAG.1.to_string())]),
        network,
        cluster,
        capacity_provider,
        bootstrap_script,
        log_sink,
        task_definition,
        service,
    };
    debug!(
        containers = graph.task_definition.containers.len(),
        new_network = matches!(graph.network, Network::Created(_)),
        "assembled resource graph"
    );
    Ok(graph)
}

impl ResourceGraph {
    pub fn containers(&self) -> &[ContainerDefinition] {
        &self.task_definition.containers
    }

    /// Statements granted to the identity the containers run as.
    pub fn task_policy(&self) -> &[PolicyStatement] {
        &self.task_definition.task_role.statements
    }

    /// Images that must be published before submission.
    pub fn assets(&self) -> Vec<Asset> {
        self.containers()
            .iter()
            .filter_map(|container| match &container.image {
                ContainerImage::Asset {
                    directory,
                    parameter,
                } => Some(Asset {
                    container: container.name.clone(),
                    directory: directory.clone(),
                    parameter: parameter.clone(),
                }),
                ContainerImage::Registry(_) => None,
            })
            .collect()
    }

    /// Renders the graph as a CloudFormation template.
    pub fn synthesize(&self) -> Template {
        let tags = tag_list(&self.tags);
        let mut template = Template::new(format!(
            "Arbitrum full node behind an authenticating proxy ({})",
            self.stack_name
        ));

        self.network.synthesize(&mut template, &tags);
        self.cluster.synthesize(&mut template, &tags);
        self.capacity_provider.synthesize(
            &mut template,
            &self.cluster,
            &self.network,
            &self.bootstrap_script,
            &tags,
        );
        self.log_sink.synthesize(&mut template, &tags);
        self.task_definition.synthesize(
            &mut template,
            &format!("{}{}", self.stack_name, self.task_definition.id),
            &tags,
        );
        self.service
            .synthesize(&mut template, &self.cluster, &self.task_definition, &tags);

        template.add_output(
            "ClusterName",
            Output::new(reference(&self.cluster.id), "ECS cluster running the node"),
        );
        template.add_output(
            "ServiceName",
            Output::new(get_att(&self.service.id, "Name"), "ECS service of the node"),
        );
        template.add_output(
            "VpcId",
            Output::new(self.network.vpc_id(), "VPC the deployment runs in"),
        );
        template
    }
}

/// Tags in the `[{Key, Value}]` form most resources accept.
fn tag_list(tags: &BTreeMap<String, String>) -> Value {
    tags.iter()
        .map(|(key, value)| json!({ "Key": key, "Value": value }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(network_id: Option<&str>) -> DeploymentConfig {
        DeploymentConfig {
            network_id: network_id.map(str::to_string),
            provider_api_key: "k".into(),
            proxy_username: "admin".into(),
            proxy_password_hash: "h123".into(),
            upstream_rpc_url: "https://l1.example".into(),
        }
    }

    fn graph(network_id: Option<&str>) -> ResourceGraph {
        let config = config(network_id);
        assemble(&config, &NetworkRef::from_config(&config)).unwrap()
    }

    #[test]
    fn test_new_network_scenario() {
        let graph = graph(None);

        let Network::Created(vpc) = &graph.network else {
            panic!("expected a new VPC");
        };
        assert_eq!(vpc.subnets.len(), 2);
        assert_eq!(graph.capacity_provider.group.instance_type, "i3en.xlarge");
        assert_eq!(graph.service.cluster, graph.cluster.id);
        assert_eq!(graph.service.task_definition, graph.task_definition.id);
        assert_eq!(graph.service.desired_count, None);

        let names: Vec<_> = graph.containers().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["arbitrum", "caddy"]);
    }

    #[test]
    fn test_existing_network_is_referenced() {
        let graph = graph(Some("vpc-0abc"));
        assert_eq!(
            graph.network,
            Network::Imported {
                vpc_id: "vpc-0abc".into()
            }
        );
    }

    #[test]
    fn test_node_command_carries_rpc_url() {
        let graph = graph(None);
        let node = graph.task_definition.container(NODE_CONTAINER).unwrap();
        assert_eq!(
            node.command,
            [
                "--l1.url",
                "https://l1.example",
                "--core.checkpoint-gas-frequency",
                "156250000",
                "--node.cache.allow-slow-lookup",
                "--node.rpc.tracing.enable",
            ]
        );
        assert_eq!(node.image, ContainerImage::Registry(NODE_IMAGE.into()));
        assert_eq!(
            node.port_mappings,
            [PortMapping::container(8547), PortMapping::container(8548)]
        );
        assert_eq!(node.mount_points[0].container_path, NODE_DATA_PATH);
        assert_eq!(node.logging.mode, LogMode::NonBlocking);
    }

    #[test]
    fn test_proxy_receives_credentials_and_link() {
        let graph = graph(None);
        let proxy = graph.task_definition.container(PROXY_CONTAINER).unwrap();
        assert_eq!(proxy.environment["BASICAUTH_USERNAME"], "admin");
        assert_eq!(proxy.environment["BASICAUTH_HASHED_PASSWORD"], "h123");
        assert_eq!(
            proxy.links,
            [Link {
                container: "arbitrum".into(),
                alias: "arbitrum".into()
            }]
        );
        assert_eq!(
            proxy.port_mappings,
            [PortMapping::host(80), PortMapping::host(443)]
        );
        assert_eq!(proxy.logging.log_sink, graph.log_sink.id);
    }

    #[test]
    fn test_task_policy_statements() {
        let graph = graph(None);
        let statements = graph.task_policy();
        assert_eq!(statements.len(), 2);

        let scoped: Vec<_> = statements[0].literal_resources().collect();
        assert_eq!(
            scoped,
            ["arn:aws:route53:::hostedzone/*", "arn:aws:route53:::change/*"]
        );
        assert_eq!(statements[0].actions, DNS_RECORD_ACTIONS);

        let unscoped: Vec<_> = statements[1].literal_resources().collect();
        assert_eq!(unscoped, ["*"]);
        assert!(statements[1]
            .actions
            .iter()
            .all(|action| action.starts_with("route53:List")));
    }

    #[test]
    fn test_capacity_group() {
        let graph = graph(None);
        let group = &graph.capacity_provider.group;
        assert_eq!(group.role.managed_policies, [SSM_MANAGED_POLICY]);
        let ports: Vec<_> = group.ingress.iter().map(|rule| rule.port).collect();
        assert_eq!(ports, [80, 443]);
        assert!(group.ingress.iter().all(|rule| rule.cidr == "0.0.0.0/0"));
        assert_eq!(graph.bootstrap_script.commands.len(), 5);
        assert_eq!(graph.log_sink.retention_days, 7);
    }

    #[test]
    fn test_bootstrap_prepares_data_volume_after_joining_cluster() {
        let graph = graph(None);
        let expected = [
            "sudo mkdir /mnt/nvm/",
            "sudo mkfs -t ext4 /dev/nvme1n1",
            "sudo mount -t ext4 /dev/nvme1n1 /mnt/nvm",
            "sudo mkdir -p /mnt/nvm/nodedata",
            "sudo chown ec2-user:ec2-user /mnt/nvm/nodedata",
        ];
        assert_eq!(graph.bootstrap_script.commands, expected);

        let user_data = graph.bootstrap_script.render(&graph.cluster);
        let text: String = user_data["Fn::Base64"]["Fn::Join"][1]
            .as_array()
            .unwrap()
            .iter()
            .map(|part| match part.as_str() {
                Some(text) => text.to_string(),
                None => format!("<{}>", part["Ref"].as_str().unwrap()),
            })
            .collect();
        let lines: Vec<_> = text.lines().collect();
        let join_line = "echo ECS_CLUSTER=<ArbitrumNodeCluster> >> /etc/ecs/ecs.config";
        let join = lines.iter().position(|line| *line == join_line).unwrap();
        assert_eq!(&lines[lines.len() - expected.len()..], expected);
        assert!(join < lines.len() - expected.len());
    }

    #[test]
    fn test_assemble_is_deterministic() {
        for network_id in [None, Some("vpc-0abc")] {
            let first = graph(network_id);
            let second = graph(network_id);
            assert_eq!(first, second);
            assert_eq!(first.synthesize(), second.synthesize());
        }
    }

    #[test]
    fn test_assets() {
        let assets = graph(None).assets();
        assert_eq!(
            assets,
            [Asset {
                container: "caddy".into(),
                directory: PathBuf::from("docker/caddy"),
                parameter: "CaddyImageUri".into(),
            }]
        );
    }

    #[test]
    fn test_invalid_layout_aborts() {
        let layout = SubnetLayout {
            cidr_mask: 12,
            ..Default::default()
        };
        let err = assemble(&config(None), &NetworkRef::CreateNew(layout)).unwrap_err();
        assert!(matches!(err, Error::InvalidSubnetLayout(_)));
    }
}
