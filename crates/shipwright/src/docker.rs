//! Container image build and push via the `docker` CLI.
//!
//! Image builds run after packaging (they may copy dist artifacts into the
//! build context); pushes happen in the publish stage, between the release
//! host and the upload publishers. Registry auth comes from
//! `DOCKER_USERNAME` / `DOCKER_PASSWORD` when both are present.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::context::TemplateContext;
use crate::error::ReleaseError;
use crate::git::require_tool;
use crate::process;
use crate::registry::ArtifactRegistry;
use crate::types::{Artifact, ArtifactKind};

/// Build every configured image. One DockerImage artifact is registered per
/// rendered tag; errors are collected per spec.
pub fn run_docker_builds(
    config: &Config,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for spec in &config.dockers {
        if spec.image_templates.is_empty() {
            continue;
        }
        if let Err(e) = build_spec_images(config, spec, tctx, registry, token) {
            errors.push(e.context(format!("docker image {}", spec.id)));
        }
    }
    errors
}

fn build_spec_images(
    _config: &Config,
    spec: &crate::config::DockerSpec,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Result<()> {
    token.checkpoint()?;
    require_tool("docker")?;

    let mut tags = Vec::with_capacity(spec.image_templates.len());
    for template in &spec.image_templates {
        tags.push(tctx.apply(template)?);
    }

    let mut args = vec!["build".to_string(), "-f".to_string(), spec.dockerfile.clone()];
    for tag in &tags {
        args.push("-t".to_string());
        args.push(tag.clone());
    }
    for flag in &spec.build_flags {
        args.push(tctx.apply(flag)?);
    }
    args.push(".".to_string());

    let out = process::run_command("docker", &args, None, &BTreeMap::new(), None, token)?;
    if !out.success() {
        anyhow::bail!(
            "docker build exited with {}: {}",
            out.exit_code,
            process::tail(&out.stderr, 20)
        );
    }

    for tag in tags {
        registry.add(
            Artifact::new(&tag, &tag, ArtifactKind::DockerImage)
                .with_extra("id", serde_json::Value::String(spec.id.clone()))
                .with_extra(
                    "skip_push",
                    serde_json::Value::Bool(spec.skip_push),
                ),
        );
    }
    Ok(())
}

/// Push every built image that is not marked skip-push. A failure aborts the
/// publish stage.
pub fn push_images(registry: &ArtifactRegistry, token: &CancelToken) -> Result<()> {
    let images: Vec<Artifact> = registry
        .by_kind(ArtifactKind::DockerImage)
        .into_iter()
        .filter(|image| {
            !image
                .extra
                .get("skip_push")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        })
        .collect();
    if images.is_empty() {
        return Ok(());
    }

    require_tool("docker").map_err(|e| ReleaseError::Publish(e.to_string()))?;
    login_if_configured(token)?;

    for image in images {
        token.checkpoint()?;
        let args = vec!["push".to_string(), image.name.clone()];
        let out = process::run_command("docker", &args, None, &BTreeMap::new(), None, token)?;
        if !out.success() {
            anyhow::bail!(ReleaseError::Publish(format!(
                "docker push {} exited with {}: {}",
                image.name,
                out.exit_code,
                process::tail(&out.stderr, 10)
            )));
        }
    }
    Ok(())
}

fn login_if_configured(token: &CancelToken) -> Result<()> {
    let (Ok(username), Ok(password)) = (
        std::env::var("DOCKER_USERNAME"),
        std::env::var("DOCKER_PASSWORD"),
    ) else {
        return Ok(());
    };

    let args = vec![
        "login".to_string(),
        "-u".to_string(),
        username,
        "--password-stdin".to_string(),
    ];
    let out = process::run_command(
        "docker",
        &args,
        None,
        &BTreeMap::new(),
        Some(&password),
        token,
    )
    .context("docker login failed to execute")?;
    if !out.success() {
        anyhow::bail!(ReleaseError::Publish(format!(
            "docker login exited with {}",
            out.exit_code
        )));
    }
    Ok(())
}
