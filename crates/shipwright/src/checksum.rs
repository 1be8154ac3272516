//! Checksum stage.
//!
//! One file, lines `<digest>  <name>`, over the selected artifacts (default:
//! archives and binaries). Entries are ordered by sorted artifact name so
//! identical inputs always produce byte-identical checksum files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::context::TemplateContext;
use crate::hash;
use crate::registry::ArtifactRegistry;
use crate::types::{Artifact, ArtifactKind};

/// Compute and register the checksum artifact. `Ok(None)` when disabled or
/// nothing is selected.
pub fn run_checksums(
    config: &Config,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Result<Option<Artifact>> {
    let spec = &config.checksum;
    if spec.disable {
        return Ok(None);
    }
    token.checkpoint()?;

    let mut selected = registry.filter(|a| {
        let kind_ok = matches!(
            a.kind,
            ArtifactKind::Archive
                | ArtifactKind::Binary
                | ArtifactKind::LinuxPackage
                | ArtifactKind::PlatformPackage
        );
        if !kind_ok {
            return false;
        }
        if spec.ids.is_empty() {
            // Default selection: archives and binaries.
            return matches!(a.kind, ArtifactKind::Archive | ArtifactKind::Binary);
        }
        artifact_id(a)
            .map(|id| spec.ids.iter().any(|allowed| allowed == id))
            .unwrap_or(false)
    });
    if selected.is_empty() {
        return Ok(None);
    }
    selected.sort_by(|a, b| a.name.cmp(&b.name));

    let mut lines = String::new();
    for artifact in &selected {
        token.checkpoint()?;
        let digest = hash::hash_file(&artifact.path, spec.algorithm)
            .with_context(|| format!("failed to checksum {}", artifact.name))?;
        lines.push_str(&format!("{digest}  {}\n", artifact.name));
    }

    let name = tctx.apply(&spec.name_template)?;
    let out_path = config.dist.join(&name);
    write_renamed(&out_path, lines.as_bytes())?;

    let artifact = Artifact::new(&name, &out_path, ArtifactKind::Checksum).with_extra(
        "algorithm",
        serde_json::Value::String(spec.algorithm.name().to_string()),
    );
    registry.add(artifact.clone());
    Ok(Some(artifact))
}

fn artifact_id(artifact: &Artifact) -> Option<&str> {
    artifact
        .extra
        .get("id")
        .and_then(|v| v.as_str())
        .or(artifact.build_id.as_deref())
}

fn write_renamed(out_path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = out_path.with_extension("partial");
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, out_path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GitInfo, Target};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn ctx() -> TemplateContext {
        TemplateContext::new("widget", &GitInfo::synthetic(), "1.0.0", BTreeMap::new())
    }

    fn test_config(dist: &Path) -> Config {
        let mut config = Config {
            project_name: "widget".to_string(),
            dist: dist.to_path_buf(),
            ..Config::default()
        };
        config.finalize().expect("finalize");
        config
    }

    fn seed(registry: &ArtifactRegistry, dist: &Path, name: &str, kind: ArtifactKind, contents: &[u8]) -> PathBuf {
        let path = dist.join(name);
        fs::write(&path, contents).expect("write");
        registry.add(
            Artifact::new(name, &path, kind)
                .with_target(Target::new("linux", "amd64"))
                .with_extra("id", serde_json::Value::String("default".into())),
        );
        path
    }

    #[test]
    fn checksum_file_lists_sorted_names_with_digests() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let registry = ArtifactRegistry::new();
        seed(&registry, dir.path(), "zz.tar.gz", ArtifactKind::Archive, b"zz");
        seed(&registry, dir.path(), "aa.tar.gz", ArtifactKind::Archive, b"aa");

        let artifact = run_checksums(&config, &ctx(), &registry, &CancelToken::new())
            .expect("run")
            .expect("artifact");

        let contents = fs::read_to_string(&artifact.path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("  aa.tar.gz"));
        assert!(lines[1].ends_with("  zz.tar.gz"));
        let digest = lines[0].split_whitespace().next().unwrap();
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn reruns_over_identical_inputs_are_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let registry = ArtifactRegistry::new();
        seed(&registry, dir.path(), "app.tar.gz", ArtifactKind::Archive, b"fixed bytes");

        let first = run_checksums(&config, &ctx(), &registry, &CancelToken::new())
            .expect("run")
            .expect("artifact");
        let first_bytes = fs::read(&first.path).unwrap();

        let second = run_checksums(&config, &ctx(), &registry, &CancelToken::new())
            .expect("run")
            .expect("artifact");
        assert_eq!(first_bytes, fs::read(&second.path).unwrap());
    }

    #[test]
    fn default_selection_is_archives_and_binaries() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let registry = ArtifactRegistry::new();
        seed(&registry, dir.path(), "app.tar.gz", ArtifactKind::Archive, b"a");
        seed(&registry, dir.path(), "app", ArtifactKind::Binary, b"b");
        seed(&registry, dir.path(), "app.deb", ArtifactKind::LinuxPackage, b"c");

        let artifact = run_checksums(&config, &ctx(), &registry, &CancelToken::new())
            .expect("run")
            .expect("artifact");
        let contents = fs::read_to_string(&artifact.path).unwrap();
        assert!(contents.contains("app.tar.gz"));
        assert!(contents.contains("  app\n"));
        assert!(!contents.contains("app.deb"));
    }

    #[test]
    fn ids_filter_widens_to_matching_packages() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.checksum.ids = vec!["default".to_string()];
        let registry = ArtifactRegistry::new();
        seed(&registry, dir.path(), "app.deb", ArtifactKind::LinuxPackage, b"c");

        let artifact = run_checksums(&config, &ctx(), &registry, &CancelToken::new())
            .expect("run")
            .expect("artifact");
        assert!(fs::read_to_string(&artifact.path).unwrap().contains("app.deb"));
    }

    #[test]
    fn disabled_spec_produces_nothing() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.checksum.disable = true;
        let registry = ArtifactRegistry::new();
        seed(&registry, dir.path(), "app.tar.gz", ArtifactKind::Archive, b"a");

        let result = run_checksums(&config, &ctx(), &registry, &CancelToken::new()).expect("run");
        assert!(result.is_none());
        assert!(registry.by_kind(ArtifactKind::Checksum).is_empty());
    }

    #[test]
    fn checksum_name_template_is_rendered() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let registry = ArtifactRegistry::new();
        seed(&registry, dir.path(), "app.tar.gz", ArtifactKind::Archive, b"a");

        let artifact = run_checksums(&config, &ctx(), &registry, &CancelToken::new())
            .expect("run")
            .expect("artifact");
        assert_eq!(artifact.name, "widget_1.0.0_checksums.txt");
    }
}
