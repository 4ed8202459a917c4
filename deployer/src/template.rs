//! CloudFormation template documents and intrinsic functions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Template format version understood by CloudFormation
pub const FORMAT_VERSION: &str = "2010-09-09";

/// Errors that can occur when rendering a [Template].
#[derive(Error, Debug)]
pub enum Error {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Output encoding of a rendered template.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Json,
    Yaml,
}

/// A CloudFormation template.
///
/// Maps are ordered so that rendering the same template always yields the same bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,
    pub resources: BTreeMap<String, Resource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Template {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            description: description.into(),
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn add_parameter(&mut self, id: impl Into<String>, parameter: Parameter) {
        self.parameters.insert(id.into(), parameter);
    }

    pub fn add_resource(&mut self, id: impl Into<String>, resource: Resource) {
        self.resources.insert(id.into(), resource);
    }

    pub fn add_output(&mut self, id: impl Into<String>, output: Output) {
        self.outputs.insert(id.into(), output);
    }

    /// Returns the logical ids of all resources of type `kind`.
    pub fn resources_of_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.resources
            .iter()
            .filter(move |(_, resource)| resource.kind == kind)
            .map(|(id, _)| id.as_str())
    }

    pub fn render(&self, format: Format) -> Result<String, Error> {
        Ok(match format {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Yaml => serde_yaml::to_string(self)?,
        })
    }
}

/// An input supplied when the template is submitted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Parameter {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            default: None,
            description: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// What CloudFormation does with a resource when it leaves the template.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionPolicy {
    Retain,
}

/// A single resource declaration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: String,
    pub properties: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<DeletionPolicy>,
}

impl Resource {
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        Self {
            kind: kind.into(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Applies `policy` on both deletion and replacement.
    pub fn retain_with(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self.update_replace_policy = Some(policy);
        self
    }

    /// Returns the property at `pointer` (RFC 6901), if present.
    pub fn property(&self, pointer: &str) -> Option<&Value> {
        self.properties.pointer(pointer)
    }
}

/// A value exported once the stack converges.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Output {
    pub fn new(value: Value, description: impl Into<String>) -> Self {
        Self {
            value,
            description: Some(description.into()),
        }
    }
}

/// Pseudo parameter resolving to the partition of the stack's region.
pub const PARTITION: &str = "AWS::Partition";

/// Pseudo parameter resolving to the stack's region.
pub const REGION: &str = "AWS::Region";

/// `{"Ref": id}`
pub fn reference(id: &str) -> Value {
    json!({ "Ref": id })
}

/// `{"Fn::GetAtt": [id, attribute]}`
pub fn get_att(id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [id, attribute] })
}

/// `{"Fn::Join": [delimiter, parts]}`
pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

/// `{"Fn::Sub": template}`
pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

/// `{"Fn::Select": [index, list]}`
pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index, list] })
}

/// Availability zones of the stack's region.
pub fn get_azs() -> Value {
    json!({ "Fn::GetAZs": "" })
}

/// `{"Fn::Base64": value}`
pub fn base64(value: Value) -> Value {
    json!({ "Fn::Base64": value })
}

/// An IAM policy document.
pub fn policy_document(statements: Vec<Value>) -> Value {
    json!({ "Version": "2012-10-17", "Statement": statements })
}

/// A trust policy letting `service` assume a role.
pub fn assume_role_policy(service: &str) -> Value {
    policy_document(vec![json!({
        "Action": "sts:AssumeRole",
        "Effect": "Allow",
        "Principal": { "Service": service },
    })])
}

/// ARN of the AWS managed policy `name` in the stack's partition.
pub fn managed_policy_arn(name: &str) -> Value {
    join(
        "",
        vec![
            json!("arn:"),
            reference(PARTITION),
            json!(format!(":iam::aws:policy/{name}")),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_serializes_pascal_case() {
        let resource = Resource::new("AWS::Logs::LogGroup", json!({ "RetentionInDays": 7 }))
            .depends_on("Other")
            .retain_with(DeletionPolicy::Retain);
        let value = serde_json::to_value(&resource).unwrap();
        assert_eq!(
            value,
            json!({
                "Type": "AWS::Logs::LogGroup",
                "Properties": { "RetentionInDays": 7 },
                "DependsOn": ["Other"],
                "DeletionPolicy": "Retain",
                "UpdateReplacePolicy": "Retain",
            })
        );
    }

    #[test]
    fn test_template_omits_empty_sections() {
        let mut template = Template::new("test");
        template.add_resource("Cluster", Resource::new("AWS::ECS::Cluster", json!({})));
        let value = serde_json::to_value(&template).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object["AWSTemplateFormatVersion"], FORMAT_VERSION);
        assert!(!object.contains_key("Parameters"));
        assert!(!object.contains_key("Outputs"));
        assert_eq!(object["Resources"]["Cluster"]["Type"], "AWS::ECS::Cluster");
    }

    #[test]
    fn test_intrinsics() {
        assert_eq!(reference("Vpc"), json!({ "Ref": "Vpc" }));
        assert_eq!(
            get_att("Role", "Arn"),
            json!({ "Fn::GetAtt": ["Role", "Arn"] })
        );
        assert_eq!(
            select(1, get_azs()),
            json!({ "Fn::Select": [1, { "Fn::GetAZs": "" }] })
        );
        assert_eq!(
            managed_policy_arn("AmazonSSMManagedInstanceCore"),
            json!({ "Fn::Join": ["", [
                "arn:",
                { "Ref": "AWS::Partition" },
                ":iam::aws:policy/AmazonSSMManagedInstanceCore",
            ]] })
        );
    }

    #[test]
    fn test_render_formats() {
        let mut template = Template::new("test");
        template.add_parameter("Image", Parameter::new("String").with_default("x"));
        template.add_resource("Cluster", Resource::new("AWS::ECS::Cluster", json!({})));

        let rendered = template.render(Format::Json).unwrap();
        let parsed: Template = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, template);

        let rendered = template.render(Format::Yaml).unwrap();
        assert!(rendered.contains("AWSTemplateFormatVersion"));
        assert!(rendered.contains("AWS::ECS::Cluster"));
    }
}
