//! System and platform package stages.
//!
//! Linux packages (deb/rpm/apk) are produced by a `PackageWriter`
//! capability; the default writer drives an external nfpm-style tool with a
//! generated manifest. Platform-specific installers (dmg, msi, appimage, …)
//! are each a command capability gated on config presence. Both stages are
//! recoverable: errors are collected and later packagers still run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::archive::ArchiveEntry;
use crate::cancel::CancelToken;
use crate::config::{Config, PackageSpec, PlatformPackageSpec};
use crate::context::TemplateContext;
use crate::process;
use crate::registry::ArtifactRegistry;
use crate::types::{Artifact, ArtifactKind, Target};

/// System-package encoder capability.
pub trait PackageWriter: Send + Sync {
    /// Write one package of `format` containing `entries` to `out_path`.
    fn write(
        &self,
        token: &CancelToken,
        format: &str,
        spec: &PackageSpec,
        entries: &[ArchiveEntry],
        out_path: &Path,
    ) -> Result<()>;
}

/// Manifest handed to the external packaging tool.
#[derive(Debug, Serialize)]
struct ToolManifest<'a> {
    name: &'a str,
    arch: &'a str,
    version: &'a str,
    maintainer: &'a str,
    vendor: &'a str,
    homepage: &'a str,
    license: &'a str,
    description: &'a str,
    contents: Vec<ToolManifestEntry>,
}

#[derive(Debug, Serialize)]
struct ToolManifestEntry {
    src: String,
    dst: String,
    mode: u32,
}

/// Default writer: generates a manifest and invokes the configured
/// nfpm-style tool (`<tool> package -f <manifest> -p <format> -t <out>`).
pub struct ToolPackageWriter {
    name: String,
    version: String,
    arch: String,
}

impl ToolPackageWriter {
    pub fn new(name: &str, version: &str, arch: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
        }
    }
}

impl PackageWriter for ToolPackageWriter {
    fn write(
        &self,
        token: &CancelToken,
        format: &str,
        spec: &PackageSpec,
        entries: &[ArchiveEntry],
        out_path: &Path,
    ) -> Result<()> {
        let manifest = ToolManifest {
            name: &self.name,
            arch: &self.arch,
            version: &self.version,
            maintainer: &spec.maintainer,
            vendor: &spec.vendor,
            homepage: &spec.homepage,
            license: &spec.license,
            description: &spec.description,
            contents: entries
                .iter()
                .map(|e| ToolManifestEntry {
                    src: e.source.display().to_string(),
                    dst: e.dest.clone(),
                    mode: e.mode,
                })
                .collect(),
        };

        let manifest_path = out_path.with_extension("manifest.yaml");
        fs::write(
            &manifest_path,
            serde_yaml::to_string(&manifest).context("failed to serialize package manifest")?,
        )
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;

        let args = vec![
            "package".to_string(),
            "-f".to_string(),
            manifest_path.display().to_string(),
            "-p".to_string(),
            format.to_string(),
            "-t".to_string(),
            out_path.display().to_string(),
        ];
        let out = process::run_command(&spec.tool, &args, None, &BTreeMap::new(), None, token);
        let _ = fs::remove_file(&manifest_path);

        let out = out?;
        if !out.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                spec.tool,
                out.exit_code,
                process::tail(&out.stderr, 20)
            );
        }
        if !out_path.exists() {
            anyhow::bail!("{} did not produce {}", spec.tool, out_path.display());
        }
        Ok(())
    }
}

/// Linux package stage: each spec × format × linux target in the registry.
pub fn run_linux_packages(
    config: &Config,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for spec in &config.packages {
        for (target, binaries) in registry.binaries_by_target() {
            if target.os != "linux" {
                continue;
            }
            let selected: Vec<Artifact> = binaries
                .into_iter()
                .filter(|b| {
                    spec.builds.is_empty()
                        || b.build_id
                            .as_deref()
                            .map(|id| spec.builds.iter().any(|allowed| allowed == id))
                            .unwrap_or(false)
                })
                .collect();
            if selected.is_empty() {
                continue;
            }
            for format in &spec.formats {
                if let Err(e) =
                    package_one(config, spec, format, tctx, registry, &target, &selected, token)
                {
                    errors.push(e.context(format!(
                        "package {} ({format}) for {target}",
                        spec.id
                    )));
                }
            }
        }
    }
    errors
}

#[allow(clippy::too_many_arguments)]
fn package_one(
    config: &Config,
    spec: &PackageSpec,
    format: &str,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    target: &Target,
    binaries: &[Artifact],
    token: &CancelToken,
) -> Result<()> {
    token.checkpoint()?;

    let first_binary = binaries[0]
        .extra
        .get("binary")
        .and_then(|v| v.as_str())
        .unwrap_or(&binaries[0].name)
        .to_string();
    let pctx = tctx.with_artifact(&first_binary, target);
    let package_name = pctx.apply(&spec.package_name)?;
    let version = tctx.get("Version").unwrap_or_default();

    let mtime = tctx
        .get("Timestamp")
        .and_then(|t| t.parse::<u64>().ok())
        .unwrap_or_default();

    let mut entries = Vec::new();
    for binary in binaries {
        entries.push(ArchiveEntry::new(
            &binary.path,
            format!("/usr/bin/{}", binary.name),
            0o755,
            mtime,
        ));
    }
    for pattern in &spec.files {
        let rendered = pctx.apply(pattern)?;
        for path in glob::glob(&rendered)
            .with_context(|| format!("bad files glob {rendered:?}"))?
            .flatten()
        {
            if path.is_file() {
                entries.push(ArchiveEntry::new(
                    &path,
                    format!("/usr/share/{package_name}/{}", path.display()),
                    0o644,
                    mtime,
                ));
            }
        }
    }

    let file_name = format!("{package_name}_{version}_{target}.{format}");
    let out_path = config.dist.join(&file_name);
    let writer = ToolPackageWriter::new(&package_name, &version, &target.arch);
    writer.write(token, format, spec, &entries, &out_path)?;

    registry.add(
        Artifact::new(&file_name, &out_path, ArtifactKind::LinuxPackage)
            .with_target(target.clone())
            .with_extra("id", serde_json::Value::String(spec.id.clone()))
            .with_extra("format", serde_json::Value::String(format.to_string())),
    );
    Ok(())
}

/// Platform-package stage: each configured spec runs its command capability
/// against matching targets. The command receives `BINARY` and `OUTPUT` in
/// its environment and must produce `OUTPUT`.
pub fn run_platform_packages(
    config: &Config,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for spec in &config.platform_packages {
        for (target, binaries) in registry.binaries_by_target() {
            if target.os != spec.kind.target_os() {
                continue;
            }
            if let Err(e) = platform_package_one(config, spec, tctx, registry, &target, &binaries, token)
            {
                errors.push(e.context(format!(
                    "platform package {} ({:?}) for {target}",
                    spec.id, spec.kind
                )));
            }
        }
    }
    errors
}

fn platform_package_one(
    config: &Config,
    spec: &PlatformPackageSpec,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    target: &Target,
    binaries: &[Artifact],
    token: &CancelToken,
) -> Result<()> {
    token.checkpoint()?;

    let first_binary = binaries[0]
        .extra
        .get("binary")
        .and_then(|v| v.as_str())
        .unwrap_or(&binaries[0].name)
        .to_string();
    let pctx = tctx.with_artifact(&first_binary, target);
    let name = pctx.apply(&spec.name_template)?;
    let file_name = format!("{name}.{}", spec.kind.extension());
    let out_path = config.dist.join(&file_name);

    let mut envs = BTreeMap::new();
    envs.insert("BINARY".to_string(), binaries[0].path.display().to_string());
    envs.insert("OUTPUT".to_string(), out_path.display().to_string());

    let mut args = Vec::with_capacity(spec.args.len());
    for arg in &spec.args {
        args.push(pctx.apply(arg)?);
    }

    let out = process::run_command(&spec.cmd, &args, None, &envs, None, token)?;
    if !out.success() {
        anyhow::bail!(
            "{} exited with {}: {}",
            spec.cmd,
            out.exit_code,
            process::tail(&out.stderr, 20)
        );
    }
    if !out_path.exists() {
        anyhow::bail!("{} did not produce {}", spec.cmd, out_path.display());
    }

    registry.add(
        Artifact::new(&file_name, &out_path, ArtifactKind::PlatformPackage)
            .with_target(target.clone())
            .with_extra("id", serde_json::Value::String(spec.id.clone())),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformPackageKind;
    use crate::types::GitInfo;
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

    fn seed_binary(dist: &Path, registry: &ArtifactRegistry, target: Target) {
        let out_dir = dist.join(format!("default_{target}"));
        fs::create_dir_all(&out_dir).expect("mkdir");
        let path = out_dir.join("widget");
        fs::write(&path, b"#!binary").expect("write");
        registry.add(
            Artifact::new("widget", &path, ArtifactKind::Binary)
                .with_target(target)
                .with_build_id("default")
                .with_extra("binary", serde_json::Value::String("widget".into())),
        );
    }

    #[test]
    fn no_package_specs_is_a_quiet_no_op() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(&dir.path().join("dist"));
        let registry = ArtifactRegistry::new();
        let errors = run_linux_packages(&config, &ctx(), &registry, &CancelToken::new());
        assert!(errors.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn tool_writer_invokes_the_configured_tool() {
        // The fake tool copies the manifest to the target so the stage sees
        // a produced package without nfpm installed.
        let dir = tempdir().expect("tempdir");
        let tool = dir.path().join("fake-nfpm");
        fs::write(
            &tool,
            "#!/bin/sh\n# args: package -f <manifest> -p <fmt> -t <out>\ncp \"$3\" \"$7\"\n",
        )
        .expect("write tool");
        let mut perms = fs::metadata(&tool).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(&tool, perms).unwrap();

        let mut config = test_config(&dir.path().join("dist"));
        fs::create_dir_all(&config.dist).expect("mkdir");
        config.packages.push(PackageSpec {
            tool: tool.display().to_string(),
            maintainer: "Acme <rel@acme.dev>".to_string(),
            ..PackageSpec::default()
        });

        let registry = ArtifactRegistry::new();
        seed_binary(&config.dist, &registry, Target::new("linux", "amd64"));

        let errors = run_linux_packages(&config, &ctx(), &registry, &CancelToken::new());
        assert!(errors.is_empty(), "{errors:?}");

        let packages = registry.by_kind(ArtifactKind::LinuxPackage);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "widget_1.0.0_linux_amd64.deb");
        assert!(packages[0].path.exists());

        // The manifest the tool received carried the spec metadata.
        let produced = fs::read_to_string(&packages[0].path).unwrap();
        assert!(produced.contains("maintainer: Acme <rel@acme.dev>"));
        assert!(produced.contains("/usr/bin/widget"));
    }

    #[test]
    fn linux_packages_skip_non_linux_targets() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(&dir.path().join("dist"));
        config.packages.push(PackageSpec {
            tool: "this-tool-does-not-exist".to_string(),
            ..PackageSpec::default()
        });
        let registry = ArtifactRegistry::new();
        seed_binary(&config.dist, &registry, Target::new("darwin", "arm64"));

        let errors = run_linux_packages(&config, &ctx(), &registry, &CancelToken::new());
        assert!(errors.is_empty(), "non-linux target should not be packaged");
    }

    #[test]
    fn failing_tool_is_collected_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let mut config = test_config(&dir.path().join("dist"));
        config.packages.push(PackageSpec {
            tool: "definitely-not-a-real-packaging-tool".to_string(),
            ..PackageSpec::default()
        });
        let registry = ArtifactRegistry::new();
        seed_binary(&config.dist, &registry, Target::new("linux", "amd64"));

        let errors = run_linux_packages(&config, &ctx(), &registry, &CancelToken::new());
        assert_eq!(errors.len(), 1);
        assert!(registry.by_kind(ArtifactKind::LinuxPackage).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn platform_packager_runs_its_command_capability() {
        let dir = tempdir().expect("tempdir");
        let tool = dir.path().join("fake-appimage");
        fs::write(&tool, "#!/bin/sh\ncp \"$BINARY\" \"$OUTPUT\"\n").expect("write tool");
        let mut perms = fs::metadata(&tool).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        fs::set_permissions(&tool, perms).unwrap();

        let mut config = test_config(&dir.path().join("dist"));
        fs::create_dir_all(&config.dist).expect("mkdir");
        config.platform_packages.push(PlatformPackageSpec {
            id: "appimage".to_string(),
            kind: PlatformPackageKind::Appimage,
            name_template: "{{ ProjectName }}_{{ Version }}_{{ Os }}_{{ Arch }}".to_string(),
            cmd: tool.display().to_string(),
            args: vec![],
        });

        let registry = ArtifactRegistry::new();
        seed_binary(&config.dist, &registry, Target::new("linux", "amd64"));
        seed_binary(&config.dist, &registry, Target::new("darwin", "arm64"));

        let errors = run_platform_packages(&config, &ctx(), &registry, &CancelToken::new());
        assert!(errors.is_empty(), "{errors:?}");

        let packages = registry.by_kind(ArtifactKind::PlatformPackage);
        assert_eq!(packages.len(), 1, "only the linux target applies");
        assert_eq!(packages[0].name, "widget_1.0.0_linux_amd64.AppImage");
        assert!(packages[0].path.exists());
    }
}
