//! Target planning: expand configured builds into `(build, target)` pairs.
//!
//! Each non-skipped build is crossed with its os/arch lists (falling back to
//! the default matrix), sub-architecture flavors are expanded, ignores are
//! subtracted, and the optional single-target filter is applied last.

use anyhow::Result;

use crate::config::BuildSpec;
use crate::error::ReleaseError;
use crate::types::Target;

/// The default cross-product when a build does not restrict goos/goarch.
pub fn default_goos() -> Vec<String> {
    vec!["linux".to_string(), "darwin".to_string(), "windows".to_string()]
}

pub fn default_goarch() -> Vec<String> {
    vec!["amd64".to_string(), "arm64".to_string()]
}

/// One unit of build work.
#[derive(Debug, Clone)]
pub struct PlannedBuild {
    pub spec: BuildSpec,
    pub target: Target,
}

/// Expand every build into its target list. With a single-target filter an
/// empty result is a configuration error.
pub fn plan_targets(
    builds: &[BuildSpec],
    single_target: Option<&str>,
) -> Result<Vec<PlannedBuild>> {
    let mut planned = Vec::new();

    for spec in builds {
        if spec.skip {
            continue;
        }
        for target in expand_targets(spec) {
            if ignored(spec, &target) {
                continue;
            }
            if let Some(filter) = single_target
                && target.to_string() != filter
            {
                continue;
            }
            planned.push(PlannedBuild {
                spec: spec.clone(),
                target,
            });
        }
    }

    if let Some(filter) = single_target
        && planned.is_empty()
    {
        anyhow::bail!(ReleaseError::Config(format!(
            "no configured build matches target {filter:?}"
        )));
    }

    Ok(planned)
}

fn expand_targets(spec: &BuildSpec) -> Vec<Target> {
    let oses = if spec.goos.is_empty() {
        default_goos()
    } else {
        spec.goos.clone()
    };
    let arches = if spec.goarch.is_empty() {
        default_goarch()
    } else {
        spec.goarch.clone()
    };

    let mut targets = Vec::new();
    for os in &oses {
        for arch in &arches {
            match arch.as_str() {
                // GOARM-style levels only apply to 32-bit arm.
                "arm" => {
                    let levels = if spec.goarm.is_empty() {
                        vec!["6".to_string()]
                    } else {
                        spec.goarm.clone()
                    };
                    for level in levels {
                        targets.push(Target::new(os, arch).with_arm(level));
                    }
                }
                "amd64" if !spec.goamd64.is_empty() => {
                    for level in &spec.goamd64 {
                        targets.push(Target::new(os, arch).with_amd64(level));
                    }
                }
                _ => targets.push(Target::new(os, arch)),
            }
        }
    }
    targets
}

fn ignored(spec: &BuildSpec, target: &Target) -> bool {
    spec.ignore.iter().any(|ig| {
        ig.goos == target.os
            && ig.goarch == target.arch
            && ig
                .goarm
                .as_deref()
                .is_none_or(|level| Some(level) == target.arm.as_deref())
    })
}
