//! AWS CloudFormation SDK function wrappers for submitting the stack

use crate::aws::Error;
use aws_sdk_cloudformation::{
    error::ProvideErrorMetadata,
    types::{Capability, Parameter, Stack},
    Client as CloudFormationClient,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval between stack status polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Longest a single create, update, or delete is awaited
pub const STACK_TIMEOUT: Duration = Duration::from_secs(90 * 60);

/// Most failure events reported when a stack does not converge
const MAX_FAILURE_EVENTS: usize = 5;

/// Where a stack is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackState {
    InProgress,
    Succeeded,
    Failed,
}

impl StackState {
    /// Classifies a CloudFormation stack status.
    pub fn classify(status: &str) -> Self {
        if status.ends_with("_IN_PROGRESS") {
            StackState::InProgress
        } else if status.contains("ROLLBACK") || status.ends_with("_FAILED") {
            StackState::Failed
        } else if status.ends_with("_COMPLETE") {
            StackState::Succeeded
        } else {
            StackState::Failed
        }
    }
}

/// How a submission changed the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Created,
    Updated,
    Unchanged,
}

fn status(stack: &Stack) -> &str {
    stack.stack_status().map(|s| s.as_str()).unwrap_or("UNKNOWN")
}

/// Returns the stack named `name`, if it exists.
pub async fn describe(client: &CloudFormationClient, name: &str) -> Result<Option<Stack>, Error> {
    match client.describe_stacks().stack_name(name).send().await {
        Ok(output) => Ok(output.stacks().first().cloned()),
        Err(err) => {
            let service_err = err.into_service_error();
            if service_err.code() == Some("ValidationError")
                && service_err
                    .message()
                    .is_some_and(|m| m.contains("does not exist"))
            {
                return Ok(None);
            }
            Err(aws_sdk_cloudformation::Error::from(service_err).into())
        }
    }
}

/// Creates or updates the stack `name` from `body` and waits for it to converge.
pub async fn submit(
    client: &CloudFormationClient,
    name: &str,
    body: &str,
    parameters: &[(String, String)],
) -> Result<(Submission, Stack), Error> {
    let parameters: Vec<Parameter> = parameters
        .iter()
        .map(|(key, value)| {
            Parameter::builder()
                .parameter_key(key)
                .parameter_value(value)
                .build()
        })
        .collect();
    let token = format!("deployer-{}", uuid::Uuid::new_v4());

    let mut existing = describe(client, name).await?;
    if let Some(stack) = &existing {
        let current = status(stack);
        if StackState::classify(current) == StackState::InProgress {
            return Err(Error::StackBusy {
                stack: name.to_string(),
                status: current.to_string(),
            });
        }
        // A stack that failed its first creation can only be deleted
        if current == "ROLLBACK_COMPLETE" {
            warn!(stack = name, "removing stack left by a failed creation");
            delete(client, name).await?;
            existing = None;
        }
    }

    let submission = match existing {
        None => {
            client
                .create_stack()
                .stack_name(name)
                .template_body(body)
                .set_parameters(Some(parameters))
                .capabilities(Capability::CapabilityIam)
                .client_request_token(&token)
                .send()
                .await
                .map_err(|e| aws_sdk_cloudformation::Error::from(e.into_service_error()))?;
            info!(stack = name, "creating stack");
            Submission::Created
        }
        Some(_) => {
            let result = client
                .update_stack()
                .stack_name(name)
                .template_body(body)
                .set_parameters(Some(parameters))
                .capabilities(Capability::CapabilityIam)
                .client_request_token(&token)
                .send()
                .await;
            match result {
                Ok(_) => {
                    info!(stack = name, "updating stack");
                    Submission::Updated
                }
                Err(err) => {
                    let service_err = err.into_service_error();
                    if service_err
                        .message()
                        .is_some_and(|m| m.contains("No updates are to be performed"))
                    {
                        info!(stack = name, "stack already up to date");
                        Submission::Unchanged
                    } else {
                        return Err(aws_sdk_cloudformation::Error::from(service_err).into());
                    }
                }
            }
        }
    };

    let stack = match submission {
        Submission::Unchanged => describe(client, name).await?,
        _ => wait(client, name, &token).await?,
    };
    let stack = stack.ok_or_else(|| Error::StackFailed {
        stack: name.to_string(),
        status: "DELETED".to_string(),
        reason: "stack disappeared while converging".to_string(),
    })?;
    Ok((submission, stack))
}

/// Deletes the stack `name` and waits until it is gone.
pub async fn delete(client: &CloudFormationClient, name: &str) -> Result<(), Error> {
    let token = format!("deployer-{}", uuid::Uuid::new_v4());
    client
        .delete_stack()
        .stack_name(name)
        .client_request_token(&token)
        .send()
        .await
        .map_err(|e| aws_sdk_cloudformation::Error::from(e.into_service_error()))?;
    info!(stack = name, "deleting stack");
    match wait(client, name, &token).await? {
        None => Ok(()),
        Some(stack) if status(&stack) == "DELETE_COMPLETE" => Ok(()),
        Some(stack) => Err(Error::StackFailed {
            stack: name.to_string(),
            status: status(&stack).to_string(),
            reason: stack.stack_status_reason().unwrap_or_default().to_string(),
        }),
    }
}

/// Polls the stack until it leaves progress, returning `None` once it no longer exists.
///
/// Failure reasons are collected from the events caused by the request tagged `token`.
pub async fn wait(
    client: &CloudFormationClient,
    name: &str,
    token: &str,
) -> Result<Option<Stack>, Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > STACK_TIMEOUT {
            return Err(Error::StackTimeout(name.to_string()));
        }

        let Some(stack) = describe(client, name).await? else {
            return Ok(None);
        };
        let current = status(&stack);
        debug!(
            stack = name,
            status = current,
            elapsed_secs = start.elapsed().as_secs(),
            "stack status"
        );
        match StackState::classify(current) {
            StackState::InProgress => continue,
            StackState::Succeeded => {
                info!(
                    stack = name,
                    status = current,
                    elapsed_secs = start.elapsed().as_secs(),
                    "stack converged"
                );
                return Ok(Some(stack));
            }
            StackState::Failed => {
                let reason = failure_reasons(client, name, token).await?;
                return Err(Error::StackFailed {
                    stack: name.to_string(),
                    status: current.to_string(),
                    reason,
                });
            }
        }
    }
}

/// Summarizes the resources that failed during the request tagged `token`.
async fn failure_reasons(
    client: &CloudFormationClient,
    name: &str,
    token: &str,
) -> Result<String, Error> {
    let output = client
        .describe_stack_events()
        .stack_name(name)
        .send()
        .await
        .map_err(|e| aws_sdk_cloudformation::Error::from(e.into_service_error()))?;
    let reasons: Vec<String> = output
        .stack_events()
        .iter()
        .filter(|event| event.client_request_token() == Some(token))
        .filter(|event| {
            event
                .resource_status()
                .is_some_and(|s| s.as_str().ends_with("_FAILED"))
        })
        .take(MAX_FAILURE_EVENTS)
        .map(|event| {
            format!(
                "{}: {}",
                event.logical_resource_id().unwrap_or("?"),
                event.resource_status_reason().unwrap_or("no reason given")
            )
        })
        .collect();
    for reason in &reasons {
        warn!(stack = name, reason = reason.as_str(), "resource failed");
    }
    if reasons.is_empty() {
        return Ok("no failed resources reported".to_string());
    }
    Ok(reasons.join("; "))
}
