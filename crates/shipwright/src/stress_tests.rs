//! Stress tests: the parallelism bound under load and the registry under
//! concurrent writers.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;

use crate::build::{Builder, BuilderSet, run_builds};
use crate::cancel::CancelToken;
use crate::config::{BuildSpec, Config};
use crate::context::TemplateContext;
use crate::pipeline::Reporter;
use crate::pipeline::testing::CollectingReporter;
use crate::registry::ArtifactRegistry;
use crate::types::{Artifact, ArtifactKind, GitInfo, PipelineOptions, Target};

/// Builder tracking the number of concurrently-running invocations.
struct GaugeBuilder {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugeBuilder {
    fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl Builder for GaugeBuilder {
    fn build(
        &self,
        token: &CancelToken,
        _spec: &BuildSpec,
        _target: &Target,
        out_path: &Path,
        _tctx: &TemplateContext,
    ) -> Result<()> {
        token.checkpoint()?;
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(25));
        self.current.fetch_sub(1, Ordering::SeqCst);
        std::fs::write(out_path, b"gauge")?;
        Ok(())
    }
}

#[test]
fn concurrent_builders_never_exceed_the_parallelism_bound() {
    let dir = tempdir().expect("tempdir");
    let mut config = Config {
        project_name: "widget".to_string(),
        dist: dir.path().join("dist"),
        ..Config::default()
    };
    // 12 targets across three builds, capped at 2 concurrent builders.
    for i in 0..3 {
        let spec = BuildSpec {
            id: format!("build-{i}"),
            builder: "gauge".to_string(),
            goos: vec!["linux".to_string(), "darwin".to_string()],
            goarch: vec!["amd64".to_string(), "arm64".to_string()],
            ..BuildSpec::default()
        };
        config.builds.push(spec);
    }
    config.finalize().expect("finalize");

    let gauge = Arc::new(GaugeBuilder::new());
    let builders = BuilderSet::defaults().with("gauge", Arc::clone(&gauge) as Arc<dyn Builder>);
    let registry = ArtifactRegistry::new();
    let ctx = TemplateContext::new("widget", &GitInfo::synthetic(), "1.0.0", BTreeMap::new());
    let opts = PipelineOptions {
        parallelism: 2,
        ..PipelineOptions::default()
    };
    let reporter: Arc<Mutex<dyn Reporter + Send>> =
        Arc::new(Mutex::new(CollectingReporter::default()));

    let failures = run_builds(
        &config,
        dir.path(),
        &ctx,
        &registry,
        None,
        &builders,
        &opts,
        &CancelToken::new(),
        &reporter,
    )
    .expect("run");

    assert!(failures.is_empty(), "{failures:?}");
    assert_eq!(registry.by_kind(ArtifactKind::Binary).len(), 12);
    assert!(
        gauge.peak.load(Ordering::SeqCst) <= 2,
        "peak concurrency {} exceeded the bound",
        gauge.peak.load(Ordering::SeqCst)
    );
}

#[test]
fn registry_snapshot_is_consistent_under_concurrent_adds() {
    let registry = Arc::new(ArtifactRegistry::new());

    thread::scope(|scope| {
        for worker in 0..4 {
            let registry = Arc::clone(&registry);
            scope.spawn(move || {
                for i in 0..100 {
                    registry.add(
                        Artifact::new(
                            format!("bin-{worker}-{i}"),
                            format!("/dist/{worker}/{i}"),
                            ArtifactKind::Binary,
                        )
                        .with_target(Target::new("linux", "amd64")),
                    );
                }
            });
        }
        // Reader thread: every snapshot must contain only complete values.
        let registry = Arc::clone(&registry);
        scope.spawn(move || {
            for _ in 0..50 {
                for artifact in registry.list() {
                    assert!(!artifact.name.is_empty());
                    assert!(artifact.target.is_some());
                }
                thread::yield_now();
            }
        });
    });

    assert_eq!(registry.count(), 400);
}
