//! Publish images and submit a deployment to CloudFormation.

use crate::config::Target;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_cloudformation::config::retry::ReconnectMode;
use std::{process::ExitStatus, time::Duration};
use thiserror::Error;

pub mod asset;
pub mod cloudformation;
pub mod lookup;
mod deploy;
pub use deploy::deploy;
mod destroy;
pub use destroy::destroy;

pub const DEPLOY_CMD: &str = "deploy";
pub const SYNTH_CMD: &str = "synth";
pub const DESTROY_CMD: &str = "destroy";

/// Attempts the SDK makes per API call before surfacing an error
const MAX_API_ATTEMPTS: u32 = 10;

/// Errors that can occur while deploying.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::Error),
    #[error("assembly error: {0}")]
    Stack(#[from] crate::stack::Error),
    #[error("template error: {0}")]
    Template(#[from] crate::template::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cloudformation error: {0}")]
    CloudFormation(#[from] aws_sdk_cloudformation::Error),
    #[error("ec2 error: {0}")]
    Ec2(#[from] aws_sdk_ec2::Error),
    #[error("ecr error: {0}")]
    Ecr(#[from] aws_sdk_ecr::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("no region configured")]
    MissingRegion,
    #[error("VPC not found: {0}")]
    VpcNotFound(String),
    #[error("VPC {0} has no public subnets")]
    NoPublicSubnets(String),
    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: ExitStatus },
    #[error("registry returned no authorization data")]
    MissingAuthorization,
    #[error("malformed registry authorization token")]
    MalformedAuthorization,
    #[error("registry did not report a repository URI for {0}")]
    MissingRepositoryUri(String),
    #[error("credentials resolve to account {actual} but {expected} was requested")]
    AccountMismatch { expected: String, actual: String },
    #[error("stack {stack} is busy ({status})")]
    StackBusy { stack: String, status: String },
    #[error("stack {stack} ended in {status}: {reason}")]
    StackFailed {
        stack: String,
        status: String,
        reason: String,
    },
    #[error("timed out waiting for stack {0}")]
    StackTimeout(String),
}

/// Loads shared SDK configuration for `target`, deferring to the ambient default region when
/// none is set.
pub async fn load_config(target: &Target) -> SdkConfig {
    let retry = aws_config::retry::RetryConfig::adaptive()
        .with_max_attempts(MAX_API_ATTEMPTS)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30))
        .with_reconnect_mode(ReconnectMode::ReconnectOnTransientError);
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).retry_config(retry);
    if let Some(region) = &target.region {
        loader = loader.region(Region::new(region.clone()));
    }
    loader.load().await
}
