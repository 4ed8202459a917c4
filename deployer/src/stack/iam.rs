//! IAM roles and the policy statements granted to them.

use super::Error;
use crate::template::{
    assume_role_policy, get_att, managed_policy_arn, policy_document, reference, sub, Resource,
    Template,
};
use serde_json::{json, Value};

/// A resource an IAM statement applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arn {
    /// A fixed ARN or pattern (e.g. `*`)
    Literal(String),
    /// An attribute of a resource in the same stack
    Attribute { id: String, attribute: String },
    /// A pattern with pseudo-parameter substitution
    Sub(String),
}

impl Arn {
    pub fn literal(arn: impl Into<String>) -> Self {
        Arn::Literal(arn.into())
    }

    pub fn attribute(id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Arn::Attribute {
            id: id.into(),
            attribute: attribute.into(),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Arn::Literal(arn) => json!(arn),
            Arn::Attribute { id, attribute } => get_att(id, attribute),
            Arn::Sub(pattern) => sub(pattern),
        }
    }
}

/// An `Allow` statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<Arn>,
}

impl PolicyStatement {
    pub fn new<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator<Item = Arn>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().collect(),
        }
    }

    /// Returns the literal resources of this statement.
    pub fn literal_resources(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().filter_map(|arn| match arn {
            Arn::Literal(arn) => Some(arn.as_str()),
            _ => None,
        })
    }

    fn validate(&self, role: &str) -> Result<(), Error> {
        if self.actions.is_empty() || self.resources.is_empty() {
            return Err(Error::EmptyStatement(role.to_string()));
        }
        Ok(())
    }

    fn to_value(&self) -> Value {
        json!({
            "Action": self.actions,
            "Effect": "Allow",
            "Resource": self.resources.iter().map(Arn::to_value).collect::<Vec<_>>(),
        })
    }
}

/// A role assumed by an AWS service principal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub id: String,
    /// Service principal allowed to assume the role
    pub service: String,
    /// Names of AWS managed policies attached to the role
    pub managed_policies: Vec<String>,
    /// Inline grants, rendered as the role's default policy
    pub statements: Vec<PolicyStatement>,
}

impl Role {
    pub fn new(id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            managed_policies: Vec::new(),
            statements: Vec::new(),
        }
    }

    pub fn add_managed_policy(&mut self, name: impl Into<String>) {
        self.managed_policies.push(name.into());
    }

    pub fn add_to_policy(&mut self, statement: PolicyStatement) -> Result<(), Error> {
        statement.validate(&self.id)?;
        self.statements.push(statement);
        Ok(())
    }

    /// Logical id of the inline policy, if the role has any statements.
    pub fn default_policy_id(&self) -> Option<String> {
        (!self.statements.is_empty()).then(|| format!("{}DefaultPolicy", self.id))
    }

    pub fn synthesize(&self, template: &mut Template, tags: &Value) {
        let mut properties = json!({
            "AssumeRolePolicyDocument": assume_role_policy(&self.service),
            "Tags": tags,
        });
        if !self.managed_policies.is_empty() {
            properties["ManagedPolicyArns"] = Value::Array(
                self.managed_policies
                    .iter()
                    .map(|name| managed_policy_arn(name))
                    .collect(),
            );
        }
        template.add_resource(&self.id, Resource::new("AWS::IAM::Role", properties));

        if let Some(policy_id) = self.default_policy_id() {
            template.add_resource(
                &policy_id,
                Resource::new(
                    "AWS::IAM::Policy",
                    json!({
                        "PolicyDocument": policy_document(
                            self.statements.iter().map(PolicyStatement::to_value).collect(),
                        ),
                        "PolicyName": policy_id,
                        "Roles": [reference(&self.id)],
                    }),
                ),
            );
        }
    }
}
