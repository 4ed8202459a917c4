//! Resolve deployment configuration from the process environment.
//!
//! All ambient reads happen here. Everything downstream consumes a validated [DeploymentConfig].

use thiserror::Error;

/// Identifier of an existing VPC to deploy into (optional)
pub const VPC_ID: &str = "VPC_ID";

/// API key for the DNS provider
pub const CLOUDFLARE_KEY: &str = "CLOUDFLARE_KEY";

/// Username the proxy requires for basic authentication
pub const BASICAUTH_USERNAME: &str = "BASICAUTH_USERNAME";

/// Hashed password the proxy requires for basic authentication
pub const BASICAUTH_HASHED_PASSWORD: &str = "BASICAUTH_HASHED_PASSWORD";

/// URL of the L1 RPC endpoint the node follows
pub const L1_NODE_URL: &str = "L1_NODE_URL";

/// Account to deploy into (optional)
pub const DEPLOY_ACCOUNT: &str = "DEPLOY_ACCOUNT";

/// Region to deploy into (optional)
pub const DEPLOY_REGION: &str = "DEPLOY_REGION";

/// Errors that can occur while resolving configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("{0} environment variable is empty")]
    Empty(&'static str),
}

/// Validated deployment inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentConfig {
    /// Existing VPC to reuse. `None` creates a new one.
    pub network_id: Option<String>,
    pub provider_api_key: String,
    pub proxy_username: String,
    pub proxy_password_hash: String,
    pub upstream_rpc_url: String,
}

impl DeploymentConfig {
    /// Resolves configuration from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    /// Resolves configuration from `lookup`, failing on the first required value that is
    /// absent or empty.
    pub fn resolve<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| match lookup(name) {
            None => Err(Error::Missing(name)),
            Some(value) if value.trim().is_empty() => Err(Error::Empty(name)),
            Some(value) => Ok(value),
        };

        let network_id = lookup(VPC_ID).filter(|id| !id.trim().is_empty());
        let provider_api_key = required(CLOUDFLARE_KEY)?;
        let proxy_username = required(BASICAUTH_USERNAME)?;
        let proxy_password_hash = required(BASICAUTH_HASHED_PASSWORD)?;
        let upstream_rpc_url = required(L1_NODE_URL)?;

        Ok(Self {
            network_id,
            provider_api_key,
            proxy_username,
            proxy_password_hash,
            upstream_rpc_url,
        })
    }
}

/// Account and region to deploy into. `None` defers to the ambient AWS defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Target {
    pub account: Option<String>,
    pub region: Option<String>,
}

impl Target {
    /// Reads the target from the process environment.
    pub fn from_env() -> Self {
        Self::resolve(|name| std::env::var(name).ok())
    }

    pub fn resolve<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            account: optional(DEPLOY_ACCOUNT),
            region: optional(DEPLOY_REGION),
        }
    }
}
