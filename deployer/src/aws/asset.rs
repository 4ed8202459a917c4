//! Build locally defined container images and push them to ECR.

use crate::{aws::Error, stack::Asset};
use aws_sdk_ecr::{types::ImageIdentifier, Client as EcrClient};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info};

/// Computes a content hash of the build context at `directory`.
///
/// Covers every file's relative path and contents, so renaming or editing anything in the context
/// yields a new tag.
pub fn fingerprint(directory: &Path) -> Result<String, std::io::Error> {
    let mut files = Vec::new();
    collect_files(directory, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        let relative = file.strip_prefix(directory).unwrap_or(&file);
        // Links are hashed by target, never followed
        let contents = if fs::symlink_metadata(&file)?.file_type().is_symlink() {
            fs::read_link(&file)?
                .to_string_lossy()
                .into_owned()
                .into_bytes()
        } else {
            fs::read(&file)?
        };
        let path = relative.to_string_lossy();
        hasher.update((path.len() as u64).to_be_bytes());
        hasher.update(path.as_bytes());
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(&contents);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_files(directory: &Path, files: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Returns the account owning a registry URI (`<account>.dkr.ecr.<region>.amazonaws.com/...`).
pub fn registry_account(uri: &str) -> Option<&str> {
    let host = uri
        .trim_start_matches("https://")
        .split('/')
        .next()?;
    let (account, rest) = host.split_once('.')?;
    (rest.starts_with("dkr.ecr.") && account.chars().all(|c| c.is_ascii_digit()))
        .then_some(account)
}

/// Ensures the repository `name` exists, returning its URI.
pub async fn ensure_repository(client: &EcrClient, name: &str) -> Result<String, Error> {
    match client.describe_repositories().repository_names(name).send().await {
        Ok(output) => {
            if let Some(uri) = output.repositories().first().and_then(|r| r.repository_uri()) {
                debug!(repository = name, "repository already exists");
                return Ok(uri.to_string());
            }
        }
        Err(err) => {
            let service_err = err.into_service_error();
            if !service_err.is_repository_not_found_exception() {
                return Err(aws_sdk_ecr::Error::from(service_err).into());
            }
        }
    }

    let output = client
        .create_repository()
        .repository_name(name)
        .send()
        .await
        .map_err(|e| aws_sdk_ecr::Error::from(e.into_service_error()))?;
    let uri = output
        .repository()
        .and_then(|r| r.repository_uri())
        .ok_or_else(|| Error::MissingRepositoryUri(name.to_string()))?;
    info!(repository = name, uri = uri, "created repository");
    Ok(uri.to_string())
}

async fn image_exists(client: &EcrClient, repository: &str, tag: &str) -> Result<bool, Error> {
    let result = client
        .describe_images()
        .repository_name(repository)
        .image_ids(ImageIdentifier::builder().image_tag(tag).build())
        .send()
        .await;
    match result {
        Ok(output) => Ok(!output.image_details().is_empty()),
        Err(err) => {
            let service_err = err.into_service_error();
            if service_err.is_image_not_found_exception() {
                return Ok(false);
            }
            Err(aws_sdk_ecr::Error::from(service_err).into())
        }
    }
}

/// Runs `docker` with `args`, feeding `stdin` if provided.
async fn docker(args: &[&str], stdin: Option<&str>) -> Result<(), Error> {
    debug!(?args, "running docker");
    let mut command = Command::new("docker");
    command.args(args);
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    }
    let mut child = command.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
    }
    let status = child.wait().await?;
    if !status.success() {
        return Err(Error::CommandFailed {
            command: format!("docker {}", args.first().unwrap_or(&"")),
            status,
        });
    }
    Ok(())
}

/// Registry credentials issued to the caller.
struct Authorization {
    endpoint: String,
    username: String,
    password: String,
}

async fn authorization(client: &EcrClient) -> Result<Authorization, Error> {
    let output = client
        .get_authorization_token()
        .send()
        .await
        .map_err(|e| aws_sdk_ecr::Error::from(e.into_service_error()))?;
    let data = output
        .authorization_data()
        .first()
        .ok_or(Error::MissingAuthorization)?;
    let token = data.authorization_token().ok_or(Error::MissingAuthorization)?;
    let endpoint = data.proxy_endpoint().ok_or(Error::MissingAuthorization)?;
    let decoded = String::from_utf8(BASE64.decode(token)?)
        .map_err(|_| Error::MalformedAuthorization)?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or(Error::MalformedAuthorization)?;
    Ok(Authorization {
        endpoint: endpoint.to_string(),
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Returns the account the ambient credentials resolve to, read from the caller's registry
/// endpoint. Makes no changes.
pub async fn caller_account(client: &EcrClient) -> Result<String, Error> {
    let authorization = authorization(client).await?;
    registry_account(&authorization.endpoint)
        .map(str::to_string)
        .ok_or(Error::MalformedAuthorization)
}

/// Fails if `expected` is set and differs from `actual`.
pub fn verify_account(expected: Option<&str>, actual: &str) -> Result<(), Error> {
    match expected {
        Some(expected) if expected != actual => Err(Error::AccountMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Logs docker into the registry of the caller's account.
async fn login(client: &EcrClient) -> Result<(), Error> {
    let authorization = authorization(client).await?;
    docker(
        &[
            "login",
            "--username",
            authorization.username.as_str(),
            "--password-stdin",
            authorization.endpoint.as_str(),
        ],
        Some(authorization.password.as_str()),
    )
    .await
}

/// Builds `asset` and pushes it to `repository`, returning the pushed image URI.
///
/// Images are tagged by [fingerprint], so an unchanged context is not rebuilt.
pub async fn publish(
    client: &EcrClient,
    repository: &str,
    asset: &Asset,
) -> Result<String, Error> {
    let tag = fingerprint(&asset.directory)?;
    let uri = ensure_repository(client, repository).await?;

    let image = format!("{uri}:{tag}");
    if image_exists(client, repository, &tag).await? {
        info!(
            container = asset.container.as_str(),
            image = image.as_str(),
            "image already published"
        );
        return Ok(image);
    }

    let context = asset.directory.to_string_lossy();
    info!(
        container = asset.container.as_str(),
        context = &*context,
        "building image"
    );
    docker(&["build", "--tag", image.as_str(), &*context], None).await?;
    login(client).await?;
    docker(&["push", image.as_str()], None).await?;
    info!(
        container = asset.container.as_str(),
        image = image.as_str(),
        "published image"
    );
    Ok(image)
}
