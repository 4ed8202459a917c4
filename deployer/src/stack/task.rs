//! Task definition, its containers, and the service that keeps it running.

use super::{capacity::Cluster, iam::Role, Error};
use crate::template::{get_att, reference, DeletionPolicy, Parameter, Resource, Template, REGION};
use serde_json::{json, Map, Value};
use std::{collections::BTreeMap, path::PathBuf};

/// Longest tag a container registry accepts
const MAX_TAG_LEN: usize = 128;

/// A log group shared by every container of the task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSink {
    pub id: String,
    pub retention_days: u32,
}

impl LogSink {
    pub fn synthesize(&self, template: &mut Template, tags: &Value) {
        template.add_resource(
            &self.id,
            Resource::new(
                "AWS::Logs::LogGroup",
                json!({ "RetentionInDays": self.retention_days, "Tags": tags }),
            )
            .retain_with(DeletionPolicy::Retain),
        );
    }
}

/// Where a container image comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerImage {
    /// A public registry reference (`repository[:tag]`)
    Registry(String),
    /// Built from a local context and pushed before submission. The pushed URI is passed in
    /// through `parameter`.
    Asset {
        directory: PathBuf,
        parameter: String,
    },
}

impl ContainerImage {
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            ContainerImage::Registry(reference) => validate_reference(reference),
            ContainerImage::Asset {
                directory,
                parameter,
            } => {
                if directory.as_os_str().is_empty() {
                    return Err(Error::InvalidImage("empty build context".into()));
                }
                if parameter.is_empty() || !parameter.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(Error::InvalidImage(format!(
                        "invalid parameter name {parameter:?}"
                    )));
                }
                Ok(())
            }
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ContainerImage::Registry(reference) => json!(reference),
            ContainerImage::Asset { parameter, .. } => reference(parameter),
        }
    }
}

fn validate_reference(reference: &str) -> Result<(), Error> {
    let invalid = |reason: &str| Err(Error::InvalidImage(format!("{reference:?}: {reason}")));
    if reference.is_empty() {
        return invalid("empty");
    }
    let (repository, tag) = match reference.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, Some(tag)),
        _ => (reference, None),
    };
    if repository.is_empty()
        || repository.starts_with('/')
        || repository.ends_with('/')
        || repository.contains("//")
    {
        return invalid("malformed repository");
    }
    let repository_char =
        |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/:".contains(c);
    if !repository.chars().all(repository_char) {
        return invalid("repository must be lowercase alphanumeric");
    }
    if let Some(tag) = tag {
        let tag_char = |c: char| c.is_ascii_alphanumeric() || "_.-".contains(c);
        if tag.is_empty() || tag.len() > MAX_TAG_LEN || !tag.chars().all(tag_char) {
            return invalid("malformed tag");
        }
    }
    Ok(())
}

/// A port published by a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    /// `None` lets the agent pick an ephemeral host port
    pub host_port: Option<u16>,
}

impl PortMapping {
    pub fn container(port: u16) -> Self {
        Self {
            container_port: port,
            host_port: None,
        }
    }

    pub fn host(port: u16) -> Self {
        Self {
            container_port: port,
            host_port: Some(port),
        }
    }

    fn to_value(self) -> Value {
        let mut value = json!({ "ContainerPort": self.container_port, "Protocol": "tcp" });
        if let Some(host_port) = self.host_port {
            value["HostPort"] = json!(host_port);
        }
        value
    }
}

/// A task volume mounted into a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountPoint {
    pub source_volume: String,
    pub container_path: String,
    pub read_only: bool,
}

/// How the log driver delivers a container's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogMode {
    NonBlocking,
}

impl LogMode {
    fn as_str(&self) -> &'static str {
        match self {
            LogMode::NonBlocking => "non-blocking",
        }
    }
}

/// Ships a container's output to a [LogSink].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogDriver {
    pub log_sink: String,
    pub stream_prefix: String,
    pub mode: LogMode,
}

/// Makes another container of the task reachable under `alias`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub container: String,
    pub alias: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: ContainerImage,
    pub memory_reservation_mib: u32,
    pub logging: LogDriver,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub port_mappings: Vec<PortMapping>,
    pub mount_points: Vec<MountPoint>,
    pub links: Vec<Link>,
}

impl ContainerDefinition {
    fn to_value(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("Name".into(), json!(self.name));
        fields.insert("Image".into(), self.image.to_value());
        fields.insert("Essential".into(), json!(true));
        fields.insert(
            "MemoryReservation".into(),
            json!(self.memory_reservation_mib),
        );
        fields.insert(
            "LogConfiguration".into(),
            json!({
                "LogDriver": "awslogs",
                "Options": {
                    "awslogs-group": reference(&self.logging.log_sink),
                    "awslogs-stream-prefix": self.logging.stream_prefix,
                    "awslogs-region": reference(REGION),
                    "mode": self.logging.mode.as_str(),
                },
            }),
        );
        fields.insert(
            "PortMappings".into(),
            self.port_mappings.iter().map(|p| p.to_value()).collect(),
        );
        if !self.command.is_empty() {
            fields.insert("Command".into(), json!(self.command));
        }
        if !self.environment.is_empty() {
            let environment = self
                .environment
                .iter()
                .map(|(name, value)| json!({ "Name": name, "Value": value }))
                .collect();
            fields.insert("Environment".into(), environment);
        }
        if !self.mount_points.is_empty() {
            let mounts = self
                .mount_points
                .iter()
                .map(|m| {
                    json!({
                        "ContainerPath": m.container_path,
                        "ReadOnly": m.read_only,
                        "SourceVolume": m.source_volume,
                    })
                })
                .collect();
            fields.insert("MountPoints".into(), mounts);
        }
        if !self.links.is_empty() {
            let links = self
                .links
                .iter()
                .map(|l| json!(format!("{}:{}", l.container, l.alias)))
                .collect();
            fields.insert("Links".into(), links);
        }
        Value::Object(fields)
    }
}

/// Container networking of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkMode {
    Bridge,
}

impl NetworkMode {
    fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Bridge => "bridge",
        }
    }
}

/// A named volume backed by a path on the instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub host_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskDefinition {
    pub id: String,
    pub network_mode: NetworkMode,
    pub volumes: Vec<Volume>,
    pub containers: Vec<ContainerDefinition>,
    /// Identity the containers run as
    pub task_role: Role,
    /// Identity the agent uses to pull images and ship logs
    pub execution_role: Role,
}

impl TaskDefinition {
    pub fn container(&self, name: &str) -> Option<&ContainerDefinition> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Checks images and that every link, mount, and log sink names something that exists.
    pub fn validate(&self, log_sinks: &[&LogSink]) -> Result<(), Error> {
        for container in &self.containers {
            container.image.validate()?;
            for link in &container.links {
                if link.container == container.name || self.container(&link.container).is_none()
                {
                    return Err(Error::DanglingReference {
                        from: container.name.clone(),
                        to: link.container.clone(),
                    });
                }
            }
            for mount in &container.mount_points {
                if !self.volumes.iter().any(|v| v.name == mount.source_volume) {
                    return Err(Error::DanglingReference {
                        from: container.name.clone(),
                        to: mount.source_volume.clone(),
                    });
                }
            }
            if !log_sinks.iter().any(|s| s.id == container.logging.log_sink) {
                return Err(Error::DanglingReference {
                    from: container.name.clone(),
                    to: container.logging.log_sink.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn synthesize(&self, template: &mut Template, family: &str, tags: &Value) {
        self.task_role.synthesize(template, tags);
        self.execution_role.synthesize(template, tags);

        for container in &self.containers {
            if let ContainerImage::Asset {
                directory,
                parameter,
            } = &container.image
            {
                template.add_parameter(
                    parameter,
                    Parameter::new("String").with_description(format!(
                        "Image built from {} for container {}",
                        directory.display(),
                        container.name
                    )),
                );
            }
        }

        let volumes: Vec<Value> = self
            .volumes
            .iter()
            .map(|v| json!({ "Name": v.name, "Host": { "SourcePath": v.host_path } }))
            .collect();
        let mut resource = Resource::new(
            "AWS::ECS::TaskDefinition",
            json!({
                "Family": family,
                "NetworkMode": self.network_mode.as_str(),
                "RequiresCompatibilities": ["EC2"],
                "TaskRoleArn": get_att(&self.task_role.id, "Arn"),
                "ExecutionRoleArn": get_att(&self.execution_role.id, "Arn"),
                "Volumes": volumes,
                "ContainerDefinitions": self.containers.iter().map(ContainerDefinition::to_value).collect::<Vec<_>>(),
                "Tags": tags,
            }),
        );
        if let Some(policy) = self.execution_role.default_policy_id() {
            resource = resource.depends_on(policy);
        }
        template.add_resource(&self.id, resource);
    }
}

/// Keeps a task definition running on a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub id: String,
    pub cluster: String,
    pub task_definition: String,
    /// `None` leaves the count to the provider default
    pub desired_count: Option<u32>,
}

impl Service {
    pub fn synthesize(
        &self,
        template: &mut Template,
        cluster: &Cluster,
        task_definition: &TaskDefinition,
        tags: &Value,
    ) {
        let mut properties = Map::new();
        properties.insert("Cluster".into(), reference(&self.cluster));
        properties.insert("TaskDefinition".into(), reference(&self.task_definition));
        properties.insert("LaunchType".into(), json!("EC2"));
        properties.insert("SchedulingStrategy".into(), json!("REPLICA"));
        properties.insert(
            "DeploymentConfiguration".into(),
            json!({ "MaximumPercent": 200, "MinimumHealthyPercent": 50 }),
        );
        properties.insert("EnableECSManagedTags".into(), json!(false));
        properties.insert("Tags".into(), tags.clone());
        if let Some(count) = self.desired_count {
            properties.insert("DesiredCount".into(), json!(count));
        }

        let mut resource = Resource::new("AWS::ECS::Service", Value::Object(properties))
            .depends_on(super::capacity::association_id(cluster));
        if let Some(policy) = task_definition.task_role.default_policy_id() {
            resource = resource.depends_on(policy);
        }
        template.add_resource(&self.id, resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("offchainlabs/arb-node:v1.4.0-f4bbe91"; "tagged")]
    #[test_case("caddy"; "bare")]
    #[test_case("localhost:5000/caddy:2"; "registry with port")]
    #[test_case("public.ecr.aws/docker/library/caddy:2.7.6-alpine"; "nested")]
    fn test_valid_references(reference: &str) {
        assert!(validate_reference(reference).is_ok());
    }

    #[test_case(""; "empty")]
    #[test_case("Offchainlabs/arb-node"; "uppercase")]
    #[test_case("offchainlabs/arb-node:"; "empty tag")]
    #[test_case("offchainlabs//arb-node"; "empty path segment")]
    #[test_case("offchainlabs/arb node"; "whitespace")]
    fn test_invalid_references(reference: &str) {
        assert!(matches!(
            validate_reference(reference),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_port_mapping_host_port() {
        assert_eq!(
            PortMapping::container(8547).to_value(),
            json!({ "ContainerPort": 8547, "Protocol": "tcp" })
        );
        assert_eq!(
            PortMapping::host(443).to_value(),
            json!({ "ContainerPort": 443, "HostPort": 443, "Protocol": "tcp" })
        );
    }
}
