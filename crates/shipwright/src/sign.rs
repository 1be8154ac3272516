//! Signing stage.
//!
//! Each sign spec filters the registry by its artifact selector and ids
//! allow-list, then drives a signer capability per artifact. The default
//! capability runs a gpg-style command with templated argv; a failure for
//! any artifact fails that spec with context, but later specs still run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::cancel::CancelToken;
use crate::config::{Config, SignSpec, SignTargets};
use crate::context::TemplateContext;
use crate::process;
use crate::registry::ArtifactRegistry;
use crate::types::{Artifact, ArtifactKind};

/// Signing capability: produce `signature_path` for `artifact_path`.
pub trait Signer: Send + Sync {
    fn sign(
        &self,
        token: &CancelToken,
        artifact_path: &Path,
        signature_path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        stdin: Option<&str>,
    ) -> Result<()>;
}

/// Default signer: runs an external command (gpg by convention).
pub struct CommandSigner {
    cmd: String,
}

impl CommandSigner {
    pub fn new(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
        }
    }
}

impl Signer for CommandSigner {
    fn sign(
        &self,
        token: &CancelToken,
        _artifact_path: &Path,
        signature_path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        stdin: Option<&str>,
    ) -> Result<()> {
        let out = process::run_command(&self.cmd, args, None, env, stdin, token)?;
        if !out.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.cmd,
                out.exit_code,
                process::tail(&out.stderr, 20)
            );
        }
        if !signature_path.exists() {
            anyhow::bail!(
                "{} did not produce signature {}",
                self.cmd,
                signature_path.display()
            );
        }
        Ok(())
    }
}

/// Run every sign spec. Per-spec failures are collected; other specs
/// continue.
pub fn run_signs(
    config: &Config,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for spec in &config.signs {
        if let Err(e) = sign_spec(spec, tctx, registry, token) {
            errors.push(e.context(format!("sign spec {}", spec.id)));
        }
    }
    errors
}

fn sign_spec(
    spec: &SignSpec,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Result<()> {
    let selected = select_artifacts(spec, registry);
    let signer = CommandSigner::new(&spec.cmd);

    for artifact in &selected {
        token.checkpoint()?;
        sign_artifact(spec, &signer, artifact, tctx, registry, token)
            .with_context(|| format!("failed to sign {}", artifact.name))?;
    }
    Ok(())
}

fn select_artifacts(spec: &SignSpec, registry: &ArtifactRegistry) -> Vec<Artifact> {
    registry.filter(|a| {
        let kind_ok = match spec.artifacts {
            SignTargets::All => !matches!(a.kind, ArtifactKind::Signature),
            SignTargets::Archive => a.kind == ArtifactKind::Archive,
            SignTargets::Binary => a.kind == ArtifactKind::Binary,
            SignTargets::Package => matches!(
                a.kind,
                ArtifactKind::LinuxPackage | ArtifactKind::PlatformPackage
            ),
            SignTargets::Checksum => a.kind == ArtifactKind::Checksum,
            SignTargets::Source => a.kind == ArtifactKind::Source,
            SignTargets::None => false,
        };
        if !kind_ok {
            return false;
        }
        if spec.ids.is_empty() {
            return true;
        }
        a.extra
            .get("id")
            .and_then(|v| v.as_str())
            .or(a.build_id.as_deref())
            .map(|id| spec.ids.iter().any(|allowed| allowed == id))
            .unwrap_or(false)
    })
}

fn sign_artifact(
    spec: &SignSpec,
    signer: &dyn Signer,
    artifact: &Artifact,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Result<()> {
    let sctx = tctx
        .with_var("Artifact", &artifact.path.display().to_string())
        .with_var("ArtifactName", &artifact.name);
    let signature_path = std::path::PathBuf::from(sctx.apply(&spec.signature)?);
    let sctx = sctx.with_var("Signature", &signature_path.display().to_string());

    let mut args = Vec::with_capacity(spec.args.len());
    for arg in &spec.args {
        args.push(sctx.apply(arg)?);
    }

    let mut env = BTreeMap::new();
    for pair in &spec.env {
        let rendered = sctx.apply(pair)?;
        if let Some((key, value)) = rendered.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }

    let stdin = spec
        .stdin
        .as_deref()
        .map(|t| sctx.apply(t))
        .transpose()?;

    signer.sign(
        token,
        &artifact.path,
        &signature_path,
        &args,
        &env,
        stdin.as_deref(),
    )?;

    let signature_name = signature_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.sig", artifact.name));
    registry.add(
        Artifact::new(&signature_name, &signature_path, ArtifactKind::Signature).with_extra(
            "signed_artifact",
            serde_json::Value::String(artifact.name.clone()),
        ),
    );
    Ok(())
}
