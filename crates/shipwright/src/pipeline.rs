//! Pipeline orchestrator.
//!
//! Drives the fixed stage order (hooks, build, archive, package, checksum,
//! sign, docker, state/publish/announce) against the shared artifact
//! registry, aggregating recoverable errors and honoring the run and
//! per-build timeouts through the cancellation token.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::announce;
use crate::archive;
use crate::build::{self, BuilderSet};
use crate::cache::BuildCache;
use crate::cancel::CancelToken;
use crate::checksum;
use crate::config::Config;
use crate::context::TemplateContext;
use crate::docker;
use crate::error::ReleaseError;
use crate::git;
use crate::package;
use crate::publish;
use crate::registry::ArtifactRegistry;
use crate::sign;
use crate::state::{self, RunState};
use crate::types::{GitInfo, PipelineOptions};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// One configured release run. Config and git info are immutable once the
/// pipeline is constructed; the registry grows monotonically while it runs.
pub struct Pipeline {
    config: Config,
    git: GitInfo,
    version: String,
    ctx: TemplateContext,
    registry: Arc<ArtifactRegistry>,
    cache: Option<BuildCache>,
    builders: BuilderSet,
    opts: PipelineOptions,
    root: PathBuf,
}

impl Pipeline {
    pub fn new(config: Config, git: GitInfo, opts: PipelineOptions) -> Result<Self> {
        // Embedders can hand over a config that never went through
        // `Config::load`; a bad template must still stop the run here.
        config.validate_templates()?;
        let version = git::effective_version(&git, opts.snapshot, opts.nightly)?;
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let ctx = TemplateContext::new(&config.project_name, &git, &version, env);

        let cache = if config.cache.enabled {
            match BuildCache::open(
                config.cache.resolved_dir(),
                config.cache.max_size,
                config.cache.overflow,
            ) {
                Ok(cache) => Some(cache),
                // A broken cache never blocks a release.
                Err(_) => None,
            }
        } else {
            None
        };

        Ok(Self {
            config,
            git,
            version,
            ctx,
            registry: Arc::new(ArtifactRegistry::new()),
            cache,
            builders: BuilderSet::defaults(),
            opts,
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        })
    }

    /// Replace the builder table (tests, embedders).
    pub fn with_builders(mut self, builders: BuilderSet) -> Self {
        self.builders = builders;
        self
    }

    /// Set the repository root used for cache source hashing.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Attach release notes; they feed `{{ Changelog }}` and the release
    /// body.
    pub fn with_changelog(mut self, changelog: &str) -> Self {
        self.ctx = self.ctx.with_var("Changelog", changelog);
        self
    }

    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The full run sequence. Build and packaging failures accumulate into
    /// one composite error; hooks, dist preparation, state serialization,
    /// publish, and announce short-circuit.
    ///
    /// The reporter is shared with build-stage worker threads, hence the
    /// mutex.
    pub fn run(&self, reporter: &Arc<Mutex<dyn Reporter + Send>>) -> Result<()> {
        let token = match self.opts.timeout {
            Some(timeout) => CancelToken::with_timeout(timeout),
            None => CancelToken::new(),
        };
        self.run_with_token(&token, reporter)
    }

    pub fn run_with_token(
        &self,
        token: &CancelToken,
        reporter: &Arc<Mutex<dyn Reporter + Send>>,
    ) -> Result<()> {
        self.run_stages(token, reporter)
    }

    fn run_stages(
        &self,
        token: &CancelToken,
        reporter: &Arc<Mutex<dyn Reporter + Send>>,
    ) -> Result<()> {
        let hook_env: BTreeMap<String, String> = std::env::vars().collect();

        // 1. Before hooks, fail fast.
        reporter.lock().unwrap().info("running before hooks");
        crate::hooks::run_hooks(&self.config.hooks.before, &self.ctx, &hook_env, token)
            .context("before hook failed")?;

        // 2-3. Dist preparation.
        if self.opts.clean_dist && self.config.dist.exists() {
            fs::remove_dir_all(&self.config.dist).with_context(|| {
                format!("failed to clean dist dir {}", self.config.dist.display())
            })?;
        }
        fs::create_dir_all(&self.config.dist).with_context(|| {
            format!("failed to create dist dir {}", self.config.dist.display())
        })?;

        // 4. Build stage.
        token.checkpoint()?;
        reporter.lock().unwrap().info(&format!(
            "building version {} ({} max parallel)",
            self.version, self.opts.parallelism
        ));
        let build_failures = build::run_builds(
            &self.config,
            &self.root,
            &self.ctx,
            &self.registry,
            self.cache.as_ref(),
            &self.builders,
            &self.opts,
            token,
            reporter,
        )?;
        let mut failures = build_failures;
        if self.opts.silent && !failures.is_empty() {
            for failure in failures.drain(..) {
                reporter
                    .lock()
                    .unwrap()
                    .warn(&format!("build failure tolerated: {failure}"));
            }
        }

        // 5. Packagers, each recoverable.
        token.checkpoint()?;
        let mut packaging_errors: Vec<String> = Vec::new();
        let mut collect = |errors: Vec<anyhow::Error>| {
            for e in errors {
                if let Some(ReleaseError::Cancelled(_)) = e.downcast_ref::<ReleaseError>() {
                    continue; // The final checkpoint reports cancellation.
                }
                packaging_errors.push(format!("{e:#}"));
            }
        };
        collect(archive::run_archives(
            &self.config,
            &self.ctx,
            &self.registry,
            token,
        ));
        collect(package::run_linux_packages(
            &self.config,
            &self.ctx,
            &self.registry,
            token,
        ));
        collect(package::run_platform_packages(
            &self.config,
            &self.ctx,
            &self.registry,
            token,
        ));
        token.checkpoint()?;
        match checksum::run_checksums(&self.config, &self.ctx, &self.registry, token) {
            Ok(_) => {}
            Err(e) => collect(vec![e]),
        }

        // 6. Signing.
        if !self.opts.skip_sign && !self.config.signs.is_empty() {
            token.checkpoint()?;
            reporter.lock().unwrap().info("signing artifacts");
            collect(sign::run_signs(&self.config, &self.ctx, &self.registry, token));
        }

        // 7. Docker builds.
        if !self.opts.skip_docker && self.config.docker_enabled() {
            token.checkpoint()?;
            reporter.lock().unwrap().info("building container images");
            collect(docker::run_docker_builds(
                &self.config,
                &self.ctx,
                &self.registry,
                token,
            ));
        }

        token.checkpoint()?;
        if !failures.is_empty() || !packaging_errors.is_empty() {
            return Err(self.composite_error(failures, packaging_errors));
        }

        // 8. Prepare stops after serializing state.
        if self.opts.prepare {
            let state = RunState::new(
                self.version.clone(),
                self.git.tag.clone().unwrap_or_default(),
                self.registry.list(),
            );
            state::save_state(&self.config.dist, &state)?;
            reporter.lock().unwrap().info(&format!(
                "prepared release state with {} artifact(s)",
                state.artifacts.len()
            ));
            return Ok(());
        }

        // 9. Publish then announce.
        if !self.opts.skip_publish {
            token.checkpoint()?;
            reporter.lock().unwrap().info("publishing artifacts");
            publish::run_publishers(&self.config, &self.ctx, &self.registry, token)?;
        }
        if !self.opts.skip_announce {
            token.checkpoint()?;
            announce::run_announcers(&self.config, &self.ctx, token, reporter)?;
        }

        // 10. After hooks.
        crate::hooks::run_hooks(&self.config.hooks.after, &self.ctx, &hook_env, token)
            .context("after hook failed")?;
        Ok(())
    }

    /// Restore a prepared run's registry, then run publish and/or announce
    /// only. Backing store for the `publish`, `announce`, and `continue`
    /// commands.
    pub fn resume(
        &self,
        run_publish: bool,
        run_announce: bool,
        reporter: &Arc<Mutex<dyn Reporter + Send>>,
    ) -> Result<()> {
        let token = match self.opts.timeout {
            Some(timeout) => CancelToken::with_timeout(timeout),
            None => CancelToken::new(),
        };

        let state = state::load_state(&self.config.dist)?.ok_or_else(|| {
            ReleaseError::Config(format!(
                "no run state at {}; run `release --prepare` first",
                state::state_path(&self.config.dist).display()
            ))
        })?;
        state.restore(&self.registry);
        reporter.lock().unwrap().info(&format!(
            "loaded {} artifact(s) prepared for {}",
            state.artifacts.len(),
            state.version
        ));

        if run_publish {
            token.checkpoint()?;
            publish::run_publishers(&self.config, &self.ctx, &self.registry, &token)?;
            reporter.lock().unwrap().info("published prepared artifacts");
        }
        if run_announce {
            token.checkpoint()?;
            announce::run_announcers(&self.config, &self.ctx, &token, reporter)?;
        }
        Ok(())
    }

    fn composite_error(
        &self,
        failures: Vec<crate::error::TargetFailure>,
        packaging_errors: Vec<String>,
    ) -> anyhow::Error {
        if !failures.is_empty() {
            let mut errors = packaging_errors;
            let build_err = ReleaseError::Build { failures };
            if errors.is_empty() {
                return anyhow::Error::new(build_err);
            }
            errors.insert(0, build_err.to_string());
            return anyhow::Error::new(ReleaseError::Packaging { errors });
        }
        anyhow::Error::new(ReleaseError::Packaging {
            errors: packaging_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Builder;
    use crate::config::BuildSpec;
    use crate::types::{ArtifactKind, Target};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    use super::testing::CollectingReporter;

    struct WritingBuilder;

    impl Builder for WritingBuilder {
        fn build(
            &self,
            token: &CancelToken,
            _spec: &BuildSpec,
            target: &Target,
            out_path: &Path,
            _tctx: &TemplateContext,
        ) -> Result<()> {
            token.checkpoint()?;
            fs::write(out_path, format!("binary for {target}"))?;
            Ok(())
        }
    }

    struct FailingBuilder;

    impl Builder for FailingBuilder {
        fn build(
            &self,
            _token: &CancelToken,
            _spec: &BuildSpec,
            _target: &Target,
            _out_path: &Path,
            _tctx: &TemplateContext,
        ) -> Result<()> {
            anyhow::bail!("toolchain exploded")
        }
    }

    struct SlowBuilder;

    impl Builder for SlowBuilder {
        fn build(
            &self,
            token: &CancelToken,
            _spec: &BuildSpec,
            _target: &Target,
            out_path: &Path,
            _tctx: &TemplateContext,
        ) -> Result<()> {
            for _ in 0..200 {
                token.checkpoint()?;
                std::thread::sleep(Duration::from_millis(10));
            }
            fs::write(out_path, b"too late")?;
            Ok(())
        }
    }

    fn snapshot_config(dist: &Path) -> Config {
        let mut config = Config {
            project_name: "widget".to_string(),
            dist: dist.to_path_buf(),
            ..Config::default()
        };
        config.builds.push(BuildSpec::default());
        config.builds[0].goos = vec!["linux".to_string(), "darwin".to_string()];
        config.builds[0].goarch = vec!["amd64".to_string()];
        config.builds[0].builder = "test".to_string();
        config.finalize().expect("finalize");
        config
    }

    fn snapshot_opts() -> PipelineOptions {
        PipelineOptions {
            snapshot: true,
            skip_publish: true,
            skip_announce: true,
            ..PipelineOptions::default()
        }
    }

    fn pipeline(config: Config, opts: PipelineOptions, builder: Arc<dyn Builder>) -> Pipeline {
        Pipeline::new(config, GitInfo::synthetic(), opts)
            .expect("pipeline")
            .with_builders(BuilderSet::defaults().with("test", builder))
    }

    fn collecting() -> (Arc<Mutex<CollectingReporter>>, Arc<Mutex<dyn Reporter + Send>>) {
        let concrete = Arc::new(Mutex::new(CollectingReporter::default()));
        let shared: Arc<Mutex<dyn Reporter + Send>> = concrete.clone();
        (concrete, shared)
    }

    #[test]
    fn snapshot_build_produces_the_documented_artifact_set() {
        let dir = tempdir().expect("tempdir");
        let config = snapshot_config(&dir.path().join("dist"));
        let dist = config.dist.clone();
        let mut opts = snapshot_opts();
        opts.clean_dist = true;
        let p = pipeline(config, opts, Arc::new(WritingBuilder));

        let (_log, reporter) = collecting();
        p.run(&reporter).expect("run");

        let registry = p.registry();
        assert_eq!(registry.by_kind(ArtifactKind::Binary).len(), 2);
        assert_eq!(registry.by_kind(ArtifactKind::Archive).len(), 2);
        assert_eq!(registry.by_kind(ArtifactKind::Checksum).len(), 1);
        assert_eq!(registry.by_kind(ArtifactKind::Signature).len(), 0);

        // Dist: two target dirs with binaries, two archives, one checksum
        // file.
        let top_level_files: Vec<String> = fs::read_dir(&dist)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| dist.join(name).is_file())
            .collect();
        assert_eq!(top_level_files.len(), 3, "{top_level_files:?}");
        assert!(top_level_files.iter().any(|n| n.ends_with("checksums.txt")));
    }

    #[test]
    fn single_target_restricts_every_stage() {
        let dir = tempdir().expect("tempdir");
        let config = snapshot_config(&dir.path().join("dist"));
        let dist = config.dist.clone();
        let mut opts = snapshot_opts();
        opts.single_target = Some("linux_amd64".to_string());
        let p = pipeline(config, opts, Arc::new(WritingBuilder));

        let (_log, reporter) = collecting();
        p.run(&reporter).expect("run");

        let registry = p.registry();
        assert_eq!(registry.by_kind(ArtifactKind::Binary).len(), 1);
        assert_eq!(registry.by_kind(ArtifactKind::Archive).len(), 1);
        assert_eq!(registry.by_kind(ArtifactKind::Checksum).len(), 1);
        for artifact in registry.list() {
            if let Some(target) = &artifact.target {
                assert_eq!(target.to_string(), "linux_amd64");
            }
        }
        let darwin_files: Vec<_> = fs::read_dir(&dist)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("darwin"))
            .collect();
        assert!(darwin_files.is_empty(), "{darwin_files:?}");
    }

    #[test]
    fn partial_failure_keeps_good_artifacts_and_reports_the_target() {
        let dir = tempdir().expect("tempdir");
        let mut config = snapshot_config(&dir.path().join("dist"));
        config.builds[0].goos = vec!["linux".to_string()];
        let mut broken = config.builds[0].clone();
        broken.id = "broken".to_string();
        broken.builder = "failing".to_string();
        config.builds.push(broken);

        let p = Pipeline::new(config, GitInfo::synthetic(), snapshot_opts())
            .expect("pipeline")
            .with_builders(
                BuilderSet::defaults()
                    .with("test", Arc::new(WritingBuilder))
                    .with("failing", Arc::new(FailingBuilder)),
            );

        let (_log, reporter) = collecting();
        let err = p.run(&reporter).expect_err("composite failure");
        let release = err.downcast_ref::<ReleaseError>().expect("typed");
        assert!(release.to_string().contains("linux_amd64"));

        // The good build's binary and its downstream archive survive.
        let registry = p.registry();
        assert_eq!(registry.by_kind(ArtifactKind::Binary).len(), 1);
        assert_eq!(registry.by_kind(ArtifactKind::Archive).len(), 1);

        // No state file on a failed run.
        assert!(state::load_state(&p.config.dist).unwrap().is_none());
    }

    #[test]
    fn silent_mode_downgrades_build_failures() {
        let dir = tempdir().expect("tempdir");
        let mut config = snapshot_config(&dir.path().join("dist"));
        config.builds[0].goos = vec!["linux".to_string()];
        config.builds[0].builder = "failing".to_string();
        let mut opts = snapshot_opts();
        opts.silent = true;

        let p = Pipeline::new(config, GitInfo::synthetic(), opts)
            .expect("pipeline")
            .with_builders(BuilderSet::defaults().with("failing", Arc::new(FailingBuilder)));

        let (log, reporter) = collecting();
        p.run(&reporter).expect("silent run succeeds");
        assert!(log
            .lock()
            .unwrap()
            .warns
            .iter()
            .any(|w| w.contains("build failure tolerated")));
    }

    #[test]
    fn cancellation_ends_the_run_quickly_with_no_partial_archives() {
        let dir = tempdir().expect("tempdir");
        let config = snapshot_config(&dir.path().join("dist"));
        let dist = config.dist.clone();
        let mut opts = snapshot_opts();
        opts.timeout = Some(Duration::from_millis(100));
        let p = pipeline(config, opts, Arc::new(SlowBuilder));

        let started = std::time::Instant::now();
        let (_log, reporter) = collecting();
        let err = p.run(&reporter).expect_err("cancelled");
        assert!(started.elapsed() < Duration::from_secs(2));

        let release = err.downcast_ref::<ReleaseError>().expect("typed");
        assert!(matches!(release, ReleaseError::Cancelled(_)));

        let partials: Vec<_> = fs::read_dir(&dist)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".partial") || n.ends_with(".tar.gz"))
            .collect();
        assert!(partials.is_empty(), "{partials:?}");
    }

    #[test]
    fn prepare_writes_state_and_resume_restores_it() {
        let dir = tempdir().expect("tempdir");
        let config = snapshot_config(&dir.path().join("dist"));
        let mut opts = snapshot_opts();
        opts.prepare = true;
        let p = pipeline(config.clone(), opts, Arc::new(WritingBuilder));

        let (_log, reporter) = collecting();
        p.run(&reporter).expect("prepare run");

        let state = state::load_state(&config.dist)
            .expect("load")
            .expect("state present");
        assert!(state.artifacts.len() >= 3, "{}", state.artifacts.len());

        // A fresh pipeline resumes from the state file with an equal
        // artifact set.
        let fresh = pipeline(config, snapshot_opts(), Arc::new(WritingBuilder));
        fresh
            .resume(false, false, &reporter)
            .expect("resume loads state");
        assert_eq!(fresh.registry().count(), state.artifacts.len());
    }

    #[test]
    fn resume_without_state_is_a_config_error() {
        let dir = tempdir().expect("tempdir");
        let config = snapshot_config(&dir.path().join("dist"));
        let p = pipeline(config, snapshot_opts(), Arc::new(WritingBuilder));

        let (_log, reporter) = collecting();
        let err = p.resume(true, true, &reporter).expect_err("no state");
        let release = err.downcast_ref::<ReleaseError>().expect("typed");
        assert!(matches!(release, ReleaseError::Config(_)));
    }

    #[cfg(unix)]
    #[test]
    fn before_hook_failure_stops_before_any_build() {
        let dir = tempdir().expect("tempdir");
        let mut config = snapshot_config(&dir.path().join("dist"));
        config.hooks.before.push(crate::config::Hook::Command("exit 9".to_string()));
        let p = pipeline(config, snapshot_opts(), Arc::new(WritingBuilder));

        let (_log, reporter) = collecting();
        let err = p.run(&reporter).expect_err("hook failure");
        assert!(format!("{err:#}").contains("before hook"));
        assert_eq!(p.registry().count(), 0);
    }

    #[test]
    fn archives_only_derive_from_registered_binaries() {
        // Every archive's target has a matching registered binary.
        let dir = tempdir().expect("tempdir");
        let config = snapshot_config(&dir.path().join("dist"));
        let p = pipeline(config, snapshot_opts(), Arc::new(WritingBuilder));
        let (_log, reporter) = collecting();
        p.run(&reporter).expect("run");

        let registry = p.registry();
        for archive in registry.by_kind(ArtifactKind::Archive) {
            let target = archive.target.expect("archive has a target");
            assert!(
                !registry
                    .filter(|a| a.kind == ArtifactKind::Binary
                        && a.target.as_ref() == Some(&target))
                    .is_empty(),
                "archive {} has no source binary",
                archive.name
            );
        }
    }
}
