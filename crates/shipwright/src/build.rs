//! Build stage: per-target compilation through builder capabilities.
//!
//! A builder produces one binary at the output path it is handed; selection
//! is a table lookup on `build.builder`. Per-target work fans out on scoped
//! threads under the bounded semaphore, and the content-addressed cache can
//! satisfy a target without invoking any builder at all.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};

use crate::cache::BuildCache;
use crate::cancel::{CancelToken, Semaphore};
use crate::config::{BuildSpec, Config};
use crate::context::TemplateContext;
use crate::error::{ReleaseError, TargetFailure};
use crate::pipeline::Reporter;
use crate::plan::{self, PlannedBuild};
use crate::process;
use crate::registry::ArtifactRegistry;
use crate::types::{Artifact, ArtifactKind, PipelineOptions, Target};

/// Per-target compilation capability.
pub trait Builder: Send + Sync {
    /// Produce a single binary file at `out_path`.
    fn build(
        &self,
        token: &CancelToken,
        spec: &BuildSpec,
        target: &Target,
        out_path: &Path,
        tctx: &TemplateContext,
    ) -> Result<()>;
}

/// Immutable name → builder table, fixed at pipeline construction.
#[derive(Clone)]
pub struct BuilderSet {
    table: BTreeMap<String, Arc<dyn Builder>>,
}

impl BuilderSet {
    pub fn defaults() -> Self {
        let mut table: BTreeMap<String, Arc<dyn Builder>> = BTreeMap::new();
        table.insert("default".to_string(), Arc::new(CommandBuilder));
        table.insert("prebuilt".to_string(), Arc::new(PrebuiltBuilder));
        Self { table }
    }

    /// Register (or replace) a builder under `name`.
    pub fn with(mut self, name: &str, builder: Arc<dyn Builder>) -> Self {
        self.table.insert(name.to_string(), builder);
        self
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn Builder>> {
        self.table.get(name)
    }
}

impl std::fmt::Debug for BuilderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderSet")
            .field("names", &self.table.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Runs the configured tool, which must write the binary to `$OUTPUT`.
pub struct CommandBuilder;

impl Builder for CommandBuilder {
    fn build(
        &self,
        token: &CancelToken,
        spec: &BuildSpec,
        target: &Target,
        out_path: &Path,
        tctx: &TemplateContext,
    ) -> Result<()> {
        let mut envs = BTreeMap::new();
        envs.insert("OUTPUT".to_string(), out_path.display().to_string());
        envs.insert("TARGET".to_string(), target.to_string());
        envs.insert("TARGET_OS".to_string(), target.os.clone());
        envs.insert("TARGET_ARCH".to_string(), target.arch.clone());
        if let Some(arm) = &target.arm {
            envs.insert("TARGET_ARM".to_string(), arm.clone());
        }
        if let Some(amd64) = &target.amd64 {
            envs.insert("TARGET_AMD64".to_string(), amd64.clone());
        }
        for pair in &spec.env {
            let rendered = tctx.apply(pair)?;
            if let Some((key, value)) = rendered.split_once('=') {
                envs.insert(key.to_string(), value.to_string());
            }
        }

        let mut args = Vec::with_capacity(spec.args.len());
        for arg in &spec.args {
            args.push(tctx.apply(arg)?);
        }

        let out = process::run_command(&spec.command, &args, None, &envs, None, token)?;
        if !out.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                spec.command,
                out.exit_code,
                process::tail(&out.stderr, 20)
            );
        }
        if !out_path.exists() {
            anyhow::bail!(
                "builder command {} did not produce {}",
                spec.command,
                out_path.display()
            );
        }
        Ok(())
    }
}

/// Copies a pre-built binary from a templated source path.
pub struct PrebuiltBuilder;

impl Builder for PrebuiltBuilder {
    fn build(
        &self,
        token: &CancelToken,
        spec: &BuildSpec,
        _target: &Target,
        out_path: &Path,
        tctx: &TemplateContext,
    ) -> Result<()> {
        token.checkpoint()?;
        let template = spec.prebuilt.as_deref().ok_or_else(|| {
            ReleaseError::Config(format!("build {:?} uses the prebuilt builder but sets no prebuilt path", spec.id))
        })?;
        let source = PathBuf::from(tctx.apply(template)?);
        fs::copy(&source, out_path).with_context(|| {
            format!(
                "failed to copy prebuilt {} to {}",
                source.display(),
                out_path.display()
            )
        })?;
        Ok(())
    }
}

/// Run the build stage. Returns the per-target failures for aggregation; a
/// tripped cancellation token surfaces as `Err(Cancelled)` instead.
#[allow(clippy::too_many_arguments)]
pub fn run_builds(
    config: &Config,
    root: &Path,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    cache: Option<&BuildCache>,
    builders: &BuilderSet,
    opts: &PipelineOptions,
    token: &CancelToken,
    reporter: &Arc<Mutex<dyn Reporter + Send>>,
) -> Result<Vec<TargetFailure>> {
    let planned = plan::plan_targets(&config.builds, opts.single_target.as_deref())?;
    if planned.is_empty() {
        return Ok(Vec::new());
    }

    let semaphore = Semaphore::new(opts.parallelism);
    let failures: Mutex<Vec<TargetFailure>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for unit in &planned {
            let semaphore = &semaphore;
            let failures = &failures;
            let reporter = Arc::clone(reporter);
            scope.spawn(move || {
                let permit = match semaphore.acquire(token) {
                    Ok(permit) => permit,
                    // Cancellation while queued: the run-level error covers it.
                    Err(_) => return,
                };
                let _permit = permit;

                let build_token = token.child(opts.build_timeout);
                match build_target(config, root, tctx, cache, builders, unit, &build_token) {
                    Ok(artifact) => {
                        if build_token.is_cancelled() {
                            return;
                        }
                        reporter.lock().unwrap().info(&format!(
                            "{} {}: built{}",
                            unit.spec.id,
                            unit.target,
                            if artifact.is_cached() { " (cache hit)" } else { "" }
                        ));
                        registry.add(artifact);
                    }
                    Err(e) => {
                        reporter
                            .lock()
                            .unwrap()
                            .error(&format!("{} {}: {e:#}", unit.spec.id, unit.target));
                        failures.lock().unwrap().push(TargetFailure {
                            target: unit.target.to_string(),
                            message: format!("{e:#}"),
                        });
                    }
                }
            });
        }
    });

    token.checkpoint()?;
    Ok(failures.into_inner().expect("failures lock poisoned"))
}

fn build_target(
    config: &Config,
    root: &Path,
    tctx: &TemplateContext,
    cache: Option<&BuildCache>,
    builders: &BuilderSet,
    unit: &PlannedBuild,
    token: &CancelToken,
) -> Result<Artifact> {
    let spec = &unit.spec;
    let target = &unit.target;
    token.checkpoint()?;

    let binary_base = tctx.with_artifact("", target).apply(&spec.binary)?;
    let binary_name = format!("{}{}", binary_base, target.exe_suffix());
    let bctx = tctx.with_artifact(&binary_base, target);

    let out_dir = config.dist.join(format!("{}_{}", spec.id, target));
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create output dir {}", out_dir.display()))?;
    let out_path = out_dir.join(&binary_name);

    let artifact = Artifact::new(&binary_name, &out_path, ArtifactKind::Binary)
        .with_target(target.clone())
        .with_build_id(&spec.id)
        .with_extra("binary", serde_json::Value::String(binary_base.clone()));

    // Cache key failures are ordinary misses; the cache never fails a build.
    let cache_key = cache.and_then(|_| {
        BuildCache::build_key(root, &target.os, &target.arch, &binary_base, &config.cache.sources)
            .ok()
    });

    if let (Some(cache), Some(key)) = (cache, cache_key.as_deref())
        && let Some(entry) = cache.get(key)
    {
        fs::copy(&entry.path, &out_path).with_context(|| {
            format!(
                "failed to restore cached binary {} to {}",
                entry.path.display(),
                out_path.display()
            )
        })?;
        return Ok(artifact.with_extra("cached", serde_json::Value::Bool(true)));
    }

    let builder = builders.get(&spec.builder).ok_or_else(|| {
        ReleaseError::Config(format!(
            "build {:?} names unknown builder {:?}",
            spec.id, spec.builder
        ))
    })?;
    builder.build(token, spec, target, &out_path, &bctx)?;
    token.checkpoint()?;

    if let (Some(cache), Some(key)) = (cache, cache_key.as_deref()) {
        let mut metadata = BTreeMap::new();
        metadata.insert("os".to_string(), target.os.clone());
        metadata.insert("arch".to_string(), target.arch.clone());
        // Best effort; an overflowing or failed put is just a future miss.
        let _ = cache.put(key, &out_path, config.cache.ttl, metadata);
    }

    Ok(artifact)
}
