//! Arbitrum Node Deployer CLI

use arbitrum_node_deployer::{
    aws,
    config::{DeploymentConfig, Target},
    stack::{self, NetworkRef},
    template::Format,
};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Renders the template for the current environment without contacting AWS.
fn synth(matches: &ArgMatches) -> Result<(), aws::Error> {
    let config = DeploymentConfig::from_env()?;
    let graph = stack::assemble(&config, &NetworkRef::from_config(&config))?;
    let format = match matches.get_one::<String>("format").map(String::as_str) {
        Some("yaml") => Format::Yaml,
        _ => Format::Json,
    };
    let rendered = graph.synthesize().render(format)?;
    match matches.get_one::<PathBuf>("output") {
        Some(path) => {
            std::fs::write(path, rendered)?;
            info!(path = ?path, "wrote template");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

/// Entrypoint for the Arbitrum Node Deployer CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("deployer")
        .version(crate_version())
        .about("Deploy an Arbitrum full node and an authenticating proxy to AWS ECS. Runs `deploy` when no subcommand is given.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(aws::DEPLOY_CMD)
                .about("Publish the proxy image and create or update the stack from the environment."),
        )
        .subcommand(
            Command::new(aws::SYNTH_CMD)
                .about("Render the CloudFormation template for the environment without deploying.")
                .arg(
                    Arg::new("output")
                        .long("output")
                        .help("Write the template to this path instead of stdout")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("format")
                        .long("format")
                        .default_value("json")
                        .help("Template encoding")
                        .value_parser(["json", "yaml"]),
                ),
        )
        .subcommand(
            Command::new(aws::DESTROY_CMD)
                .about("Delete the stack (the log group is retained)."),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    let target = Target::from_env();
    match matches.subcommand() {
        None | Some((aws::DEPLOY_CMD, _)) => {
            // Resolve configuration before anything is built or submitted
            let config = match DeploymentConfig::from_env() {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %e, "invalid configuration");
                    return std::process::ExitCode::FAILURE;
                }
            };
            if let Err(e) = aws::deploy(&config, &target).await {
                error!(error = %e, "failed to deploy");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((aws::SYNTH_CMD, matches)) => {
            if let Err(e) = synth(matches) {
                error!(error = %e, "failed to synthesize template");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((aws::DESTROY_CMD, _)) => {
            if let Err(e) = aws::destroy(&target).await {
                error!(error = %e, "failed to destroy deployment");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
    }
    std::process::ExitCode::FAILURE
}
