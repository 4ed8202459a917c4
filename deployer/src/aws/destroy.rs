//! `destroy` subcommand

use crate::{
    aws::{cloudformation, load_config, Error},
    config::Target,
    stack::STACK_NAME,
};
use tracing::info;

/// Deletes the deployment's stack in `target`.
///
/// The log group is retained.
pub async fn destroy(target: &Target) -> Result<(), Error> {
    let sdk_config = load_config(target).await;
    let client = aws_sdk_cloudformation::Client::new(&sdk_config);
    if cloudformation::describe(&client, STACK_NAME).await?.is_none() {
        info!(stack = STACK_NAME, "stack does not exist, nothing to destroy");
        return Ok(());
    }
    cloudformation::delete(&client, STACK_NAME).await?;
    info!(stack = STACK_NAME, "destroyed deployment");
    Ok(())
}
