//! Deploy an Arbitrum full node, fronted by an authenticating Caddy proxy, to AWS ECS.
//!
//! # Overview
//!
//! A deployment is a single pass:
//!
//! 1. [config] resolves and validates the operator's environment.
//! 2. [stack] assembles the desired [stack::ResourceGraph] (VPC, ECS cluster backed by an
//!    auto-scaled EC2 capacity group, log group, task definition, service, and IAM grants).
//! 3. [template] renders the graph as a CloudFormation template.
//! 4. `aws` (behind the `aws` feature) publishes the proxy image, submits the template once,
//!    and reports the status CloudFormation converges to.
//!
//! Everything before submission is a pure function of [config::DeploymentConfig], so the same
//! environment always yields the same template.

pub mod config;
pub mod stack;
pub mod template;

cfg_if::cfg_if! {
    if #[cfg(feature = "aws")] {
        pub mod aws;
    }
}
