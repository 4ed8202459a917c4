//! `deploy` subcommand

use crate::{
    aws::{
        asset,
        cloudformation::{self, Submission},
        load_config, lookup, Error,
    },
    config::{DeploymentConfig, Target},
    stack::{self, network::PUBLIC_SUBNETS_PARAMETER, Network, NetworkRef, ASSET_REPOSITORY},
    template::Format,
};
use futures::future::try_join_all;
use tracing::info;

/// Assembles the deployment for `config`, publishes its images, and submits it to CloudFormation
/// in `target`.
pub async fn deploy(config: &DeploymentConfig, target: &Target) -> Result<(), Error> {
    // Build the desired state before touching AWS
    let network = NetworkRef::from_config(config);
    let graph = stack::assemble(config, &network)?;
    let template = graph.synthesize();
    let body = template.render(Format::Json)?;
    info!(
        stack = graph.stack_name.as_str(),
        resources = template.resources.len(),
        "synthesized template"
    );

    let sdk_config = load_config(target).await;
    let region = sdk_config.region().ok_or(Error::MissingRegion)?;
    info!(region = %region, "loaded AWS configuration");

    // Confirm the credentials belong to the requested account before any lookup or mutation
    let ecr_client = aws_sdk_ecr::Client::new(&sdk_config);
    let account = asset::caller_account(&ecr_client).await?;
    asset::verify_account(target.account.as_deref(), &account)?;
    info!(account = account.as_str(), "resolved caller account");

    // Resolve submission-time parameters
    let mut parameters = Vec::new();
    if let Network::Imported { vpc_id } = &graph.network {
        let ec2_client = aws_sdk_ec2::Client::new(&sdk_config);
        let subnets = lookup::public_subnets(&ec2_client, vpc_id).await?;
        parameters.push((PUBLIC_SUBNETS_PARAMETER.to_string(), subnets.join(",")));
    }
    let assets = graph.assets();
    let images = try_join_all(
        assets
            .iter()
            .map(|a| asset::publish(&ecr_client, ASSET_REPOSITORY, a)),
    )
    .await?;
    parameters.extend(assets.iter().map(|a| a.parameter.clone()).zip(images));

    // Hand the template to CloudFormation
    let cfn_client = aws_sdk_cloudformation::Client::new(&sdk_config);
    let (submission, stack) =
        cloudformation::submit(&cfn_client, &graph.stack_name, &body, &parameters).await?;
    for output in stack.outputs() {
        info!(
            key = output.output_key().unwrap_or_default(),
            value = output.output_value().unwrap_or_default(),
            "stack output"
        );
    }
    match submission {
        Submission::Created => info!(stack = graph.stack_name.as_str(), "deployment created"),
        Submission::Updated => info!(stack = graph.stack_name.as_str(), "deployment updated"),
        Submission::Unchanged => info!(stack = graph.stack_name.as_str(), "deployment unchanged"),
    }
    Ok(())
}
