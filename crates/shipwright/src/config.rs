//! Configuration file support (`.shipwright.yaml`).
//!
//! The whole pipeline is driven by one declarative document. Everything here
//! deserializes with serde defaults so a minimal file works, then
//! `Config::finalize` fills derived defaults (implicit build/archive specs,
//! unique ids) and validates what can be validated before a run starts.
//! The loaded `Config` is immutable for the rest of the run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::TemplateContext;
use crate::error::ReleaseError;
use crate::hash::HashAlgorithm;
use crate::types::{GitInfo, Target, deserialize_duration, serialize_duration};

pub const CONFIG_FILE: &str = ".shipwright.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Project name; feeds the `ProjectName` template variable.
    pub project_name: String,

    /// Output directory for every artifact and the run-state file.
    pub dist: PathBuf,

    pub hooks: HooksConfig,
    pub builds: Vec<BuildSpec>,
    pub archives: Vec<ArchiveSpec>,
    pub packages: Vec<PackageSpec>,
    pub platform_packages: Vec<PlatformPackageSpec>,
    pub checksum: ChecksumSpec,
    pub signs: Vec<SignSpec>,
    pub dockers: Vec<DockerSpec>,
    pub release: Option<ReleaseHostSpec>,
    pub uploads: Vec<UploadSpec>,
    pub announce: AnnounceSpec,
    pub cache: CacheConfig,
}

/// A shell-level command plus optional working directory; both strings pass
/// through template rendering before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Hook {
    /// Bare string form: `- go generate ./...`
    Command(String),
    /// Full form with a working directory.
    Detailed {
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<String>,
    },
}

impl Hook {
    pub fn cmd(&self) -> &str {
        match self {
            Hook::Command(cmd) => cmd,
            Hook::Detailed { cmd, .. } => cmd,
        }
    }

    pub fn dir(&self) -> Option<&str> {
        match self {
            Hook::Command(_) => None,
            Hook::Detailed { dir, .. } => dir.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HooksConfig {
    pub before: Vec<Hook>,
    pub after: Vec<Hook>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSpec {
    pub id: String,

    /// Binary name template; platform suffix is appended per target.
    pub binary: String,

    /// Builder backend: `default` (tool invocation) or `prebuilt` (copy).
    pub builder: String,

    pub skip: bool,

    /// Tool the default builder runs. The tool must write the binary to the
    /// path handed to it in `$OUTPUT`.
    pub command: String,

    /// Templated argv appended to `command`.
    pub args: Vec<String>,

    /// Extra `KEY=value` environment entries; values are templated.
    pub env: Vec<String>,

    pub goos: Vec<String>,
    pub goarch: Vec<String>,
    pub goarm: Vec<String>,
    pub goamd64: Vec<String>,
    pub ignore: Vec<IgnoreSpec>,

    /// Templated source path for the `prebuilt` builder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prebuilt: Option<String>,
}

impl Default for BuildSpec {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            binary: "{{ ProjectName }}".to_string(),
            builder: "default".to_string(),
            skip: false,
            command: "cargo".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            goos: Vec::new(),
            goarch: Vec::new(),
            goarm: Vec::new(),
            goamd64: Vec::new(),
            ignore: Vec::new(),
            prebuilt: None,
        }
    }
}

/// One excluded `(os, arch[, arm])` combination.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IgnoreSpec {
    pub goos: String,
    pub goarch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goarm: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSpec {
    pub id: String,
    pub name_template: String,
    /// Default format; `tar.gz` or `zip`.
    pub format: String,
    pub format_overrides: Vec<FormatOverride>,
    /// Extra files, glob-expanded relative to the repo root.
    pub files: Vec<String>,
    /// Prefix every entry with the archive name as a directory.
    pub wrap_in_directory: bool,
    /// Restrict to binaries from these build ids; empty means all.
    pub builds: Vec<String>,
}

impl Default for ArchiveSpec {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            name_template: "{{ ProjectName }}_{{ Version }}_{{ Os }}_{{ Arch }}".to_string(),
            format: "tar.gz".to_string(),
            format_overrides: Vec::new(),
            files: Vec::new(),
            wrap_in_directory: false,
            builds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FormatOverride {
    pub goos: String,
    pub format: String,
}

/// A Linux system package (deb/rpm/apk) via an external nfpm-style tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSpec {
    pub id: String,
    /// Package name template; defaults to the project name.
    pub package_name: String,
    pub formats: Vec<String>,
    pub vendor: String,
    pub homepage: String,
    pub maintainer: String,
    pub description: String,
    pub license: String,
    /// Extra files, glob-expanded, installed under /usr/share/<project>.
    pub files: Vec<String>,
    /// Packaging tool to invoke.
    pub tool: String,
    /// Restrict to binaries from these build ids; empty means all.
    pub builds: Vec<String>,
}

impl Default for PackageSpec {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            package_name: "{{ ProjectName }}".to_string(),
            formats: vec!["deb".to_string()],
            vendor: String::new(),
            homepage: String::new(),
            maintainer: String::new(),
            description: String::new(),
            license: String::new(),
            files: Vec::new(),
            tool: "nfpm".to_string(),
            builds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformPackageKind {
    Dmg,
    Pkg,
    Msi,
    Nsis,
    Appimage,
    Snap,
    Flatpak,
}

impl PlatformPackageKind {
    /// The target OS this packager applies to.
    pub fn target_os(&self) -> &'static str {
        match self {
            PlatformPackageKind::Dmg | PlatformPackageKind::Pkg => "darwin",
            PlatformPackageKind::Msi | PlatformPackageKind::Nsis => "windows",
            PlatformPackageKind::Appimage
            | PlatformPackageKind::Snap
            | PlatformPackageKind::Flatpak => "linux",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PlatformPackageKind::Dmg => "dmg",
            PlatformPackageKind::Pkg => "pkg",
            PlatformPackageKind::Msi => "msi",
            PlatformPackageKind::Nsis => "exe",
            PlatformPackageKind::Appimage => "AppImage",
            PlatformPackageKind::Snap => "snap",
            PlatformPackageKind::Flatpak => "flatpak",
        }
    }
}

/// A platform-specific installer built by an external command capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformPackageSpec {
    #[serde(default = "default_id")]
    pub id: String,
    pub kind: PlatformPackageKind,
    #[serde(default = "PlatformPackageSpec::default_name_template")]
    pub name_template: String,
    /// Command capability. Receives `BINARY` and `OUTPUT` in its env.
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PlatformPackageSpec {
    fn default_name_template() -> String {
        "{{ ProjectName }}_{{ Version }}_{{ Os }}_{{ Arch }}".to_string()
    }
}

fn default_id() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumSpec {
    pub name_template: String,
    pub algorithm: HashAlgorithm,
    /// Restrict to artifacts from these build/archive ids; empty means the
    /// default selection (archives and binaries).
    pub ids: Vec<String>,
    pub disable: bool,
}

impl Default for ChecksumSpec {
    fn default() -> Self {
        Self {
            name_template: "{{ ProjectName }}_{{ Version }}_checksums.txt".to_string(),
            algorithm: HashAlgorithm::Sha256,
            ids: Vec::new(),
            disable: false,
        }
    }
}

/// Which artifact subset a sign spec applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignTargets {
    All,
    Archive,
    Binary,
    Package,
    #[default]
    Checksum,
    Source,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignSpec {
    pub id: String,
    pub artifacts: SignTargets,
    /// Further restrict by build/archive ids.
    pub ids: Vec<String>,
    pub cmd: String,
    /// Templated argv; `{{ Artifact }}` and `{{ Signature }}` are in scope.
    pub args: Vec<String>,
    /// Signature path template.
    pub signature: String,
    /// Extra `KEY=value` env entries; values are templated.
    pub env: Vec<String>,
    /// Templated string piped to the signer's stdin (passphrases).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl Default for SignSpec {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            artifacts: SignTargets::Checksum,
            ids: Vec::new(),
            cmd: "gpg".to_string(),
            args: vec![
                "--batch".to_string(),
                "--yes".to_string(),
                "--output".to_string(),
                "{{ Signature }}".to_string(),
                "--detach-sign".to_string(),
                "{{ Artifact }}".to_string(),
            ],
            signature: "{{ Artifact }}.sig".to_string(),
            env: Vec::new(),
            stdin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSpec {
    pub id: String,
    pub dockerfile: String,
    /// Templated image references; one artifact is registered per tag.
    pub image_templates: Vec<String>,
    /// Extra templated flags for `docker build`.
    pub build_flags: Vec<String>,
    pub skip_push: bool,
}

impl Default for DockerSpec {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            dockerfile: "Dockerfile".to_string(),
            image_templates: Vec::new(),
            build_flags: Vec::new(),
            skip_push: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseHost {
    #[default]
    Github,
    Gitea,
}

impl ReleaseHost {
    /// Env var holding the API token for this host.
    pub fn token_env(&self) -> &'static str {
        match self {
            ReleaseHost::Github => "GITHUB_TOKEN",
            ReleaseHost::Gitea => "GITEA_TOKEN",
        }
    }

    pub fn default_api_url(&self) -> &'static str {
        match self {
            ReleaseHost::Github => "https://api.github.com",
            ReleaseHost::Gitea => "https://gitea.com/api/v1",
        }
    }
}

/// Release-host publisher; its presence in config enables the publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseHostSpec {
    pub host: ReleaseHost,
    pub owner: String,
    pub name: String,
    /// Override for self-hosted instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub name_template: String,
    pub draft: bool,
    pub prerelease: bool,
}

impl Default for ReleaseHostSpec {
    fn default() -> Self {
        Self {
            host: ReleaseHost::Github,
            owner: String::new(),
            name: String::new(),
            api_url: None,
            name_template: "{{ Tag }}".to_string(),
            draft: false,
            prerelease: false,
        }
    }
}

/// Generic artifact upload publisher (package-manager style endpoints).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSpec {
    pub id: String,
    /// Templated destination URL; `{{ ArtifactName }}` is in scope.
    pub target: String,
    pub username: String,
    /// Restrict to artifacts from these build/archive ids; empty means
    /// archives, packages, and checksums.
    pub ids: Vec<String>,
}

impl Default for UploadSpec {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            target: String::new(),
            username: String::new(),
            ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnnounceSpec {
    pub skip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookAnnounceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandAnnounceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookAnnounceSpec {
    pub url: String,
    pub message_template: String,
    pub content_type: String,
    /// Env var holding the HMAC secret; empty disables signing.
    pub secret_env: String,
    pub headers: BTreeMap<String, String>,
}

impl Default for WebhookAnnounceSpec {
    fn default() -> Self {
        Self {
            url: String::new(),
            message_template: "{{ ProjectName }} {{ Tag }} is out!".to_string(),
            content_type: "application/json".to_string(),
            secret_env: String::new(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CommandAnnounceSpec {
    pub cmd: String,
    pub args: Vec<String>,
}

/// What `Put` does when it would exceed the cache size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOverflow {
    /// Accept the overrun; the caller logs a warning.
    #[default]
    WarnAccept,
    /// Reject the put (treated as an ordinary cache miss downstream).
    Refuse,
    /// Evict oldest entries until the new blob fits.
    EvictOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Cache directory; defaults to `<user cache dir>/shipwright`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Size cap for stored blobs, in bytes.
    pub max_size: u64,
    /// Blob time-to-live.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub ttl: Duration,
    pub overflow: CacheOverflow,
    /// Stable source patterns feeding the cache key (glob, repo-relative).
    pub sources: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            max_size: 5 * 1024 * 1024 * 1024,
            ttl: Duration::from_secs(24 * 60 * 60),
            overflow: CacheOverflow::WarnAccept,
            sources: vec!["Cargo.toml".to_string(), "src/**/*".to_string()],
        }
    }
}

impl CacheConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("shipwright")
        })
    }
}

impl Config {
    /// Load, finalize, and template-check a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ReleaseError::Config(format!("{}: {e}", path.display())))?;
        config.finalize()?;
        config.validate_templates()?;
        Ok(config)
    }

    /// Fill derived defaults and validate. Also used by tests that build
    /// configs in code.
    pub fn finalize(&mut self) -> Result<()> {
        if self.project_name.is_empty() {
            anyhow::bail!(ReleaseError::Config("project_name is required".into()));
        }
        if self.dist.as_os_str().is_empty() {
            self.dist = PathBuf::from("dist");
        }
        if self.builds.is_empty() {
            self.builds.push(BuildSpec::default());
        }
        if self.archives.is_empty() {
            self.archives.push(ArchiveSpec::default());
        }

        ensure_unique_ids("builds", self.builds.iter().map(|b| b.id.as_str()))?;
        ensure_unique_ids("archives", self.archives.iter().map(|a| a.id.as_str()))?;
        ensure_unique_ids("signs", self.signs.iter().map(|s| s.id.as_str()))?;
        ensure_unique_ids("packages", self.packages.iter().map(|p| p.id.as_str()))?;
        ensure_unique_ids("uploads", self.uploads.iter().map(|u| u.id.as_str()))?;

        for archive in &self.archives {
            validate_format(&archive.format)?;
            for over in &archive.format_overrides {
                validate_format(&over.format)?;
            }
        }
        for package in &self.packages {
            for format in &package.formats {
                if !matches!(format.as_str(), "deb" | "rpm" | "apk") {
                    anyhow::bail!(ReleaseError::Config(format!(
                        "unknown package format {format:?} (expected deb, rpm, or apk)"
                    )));
                }
            }
        }
        if let Some(release) = &self.release
            && (release.owner.is_empty() || release.name.is_empty())
        {
            anyhow::bail!(ReleaseError::Config(
                "release requires both owner and name".into()
            ));
        }
        for upload in &self.uploads {
            if upload.target.is_empty() {
                anyhow::bail!(ReleaseError::Config(format!(
                    "upload {:?} requires a target URL",
                    upload.id
                )));
            }
        }
        if let Some(webhook) = &self.announce.webhook
            && webhook.url.is_empty()
        {
            anyhow::bail!(ReleaseError::Config(
                "announce.webhook requires a url".into()
            ));
        }
        Ok(())
    }

    /// True when any docker spec has image templates configured.
    pub fn docker_enabled(&self) -> bool {
        self.dockers.iter().any(|d| !d.image_templates.is_empty())
    }

    /// Render every configured template against a fully-populated scope so
    /// an unknown identifier stops the run at load time instead of
    /// surfacing mid-pipeline as some stage's own error.
    ///
    /// The scope carries placeholder values for the run-derived variables
    /// (git, version, artifact, signature); `Env` is the real process
    /// environment, matching what a later render would see.
    pub fn validate_templates(&self) -> Result<()> {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let ctx = TemplateContext::new(&self.project_name, &GitInfo::synthetic(), "0.0.0", env)
            .with_artifact(&self.project_name, &Target::new("linux", "amd64"))
            .with_var("Artifact", "artifact")
            .with_var("ArtifactName", "artifact")
            .with_var("Signature", "artifact.sig");

        let check = |section: &str, template: &str| -> Result<()> {
            ctx.apply(template).map(|_| ()).map_err(|e| {
                anyhow::Error::new(ReleaseError::Config(format!("{section}: {e}")))
            })
        };

        for hook in self.hooks.before.iter().chain(&self.hooks.after) {
            check("hooks", hook.cmd())?;
            if let Some(dir) = hook.dir() {
                check("hooks", dir)?;
            }
        }
        for build in &self.builds {
            check(&format!("builds.{}", build.id), &build.binary)?;
            for template in build.args.iter().chain(&build.env) {
                check(&format!("builds.{}", build.id), template)?;
            }
            if let Some(prebuilt) = &build.prebuilt {
                check(&format!("builds.{}", build.id), prebuilt)?;
            }
        }
        for archive in &self.archives {
            check(&format!("archives.{}", archive.id), &archive.name_template)?;
            for file in &archive.files {
                check(&format!("archives.{}", archive.id), file)?;
            }
        }
        for package in &self.packages {
            check(&format!("packages.{}", package.id), &package.package_name)?;
            for file in &package.files {
                check(&format!("packages.{}", package.id), file)?;
            }
        }
        for platform in &self.platform_packages {
            check(
                &format!("platform_packages.{}", platform.id),
                &platform.name_template,
            )?;
            for arg in &platform.args {
                check(&format!("platform_packages.{}", platform.id), arg)?;
            }
        }
        check("checksum", &self.checksum.name_template)?;
        for sign in &self.signs {
            check(&format!("signs.{}", sign.id), &sign.signature)?;
            for template in sign.args.iter().chain(&sign.env) {
                check(&format!("signs.{}", sign.id), template)?;
            }
            if let Some(stdin) = &sign.stdin {
                check(&format!("signs.{}", sign.id), stdin)?;
            }
        }
        for docker in &self.dockers {
            for template in docker.image_templates.iter().chain(&docker.build_flags) {
                check(&format!("dockers.{}", docker.id), template)?;
            }
        }
        if let Some(release) = &self.release {
            check("release", &release.name_template)?;
        }
        for upload in &self.uploads {
            check(&format!("uploads.{}", upload.id), &upload.target)?;
        }
        if let Some(webhook) = &self.announce.webhook {
            check("announce.webhook", &webhook.message_template)?;
        }
        if let Some(command) = &self.announce.command {
            for arg in &command.args {
                check("announce.command", arg)?;
            }
        }
        Ok(())
    }
}

fn validate_format(format: &str) -> Result<()> {
    if !matches!(format, "tar.gz" | "tgz" | "zip") {
        anyhow::bail!(ReleaseError::Config(format!(
            "unknown archive format {format:?} (expected tar.gz or zip)"
        )));
    }
    Ok(())
}

fn ensure_unique_ids<'a>(section: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            anyhow::bail!(ReleaseError::Config(format!(
                "duplicate id {id:?} in {section}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "project_name: widget\n"
    }

    #[test]
    fn minimal_config_gains_default_build_and_archive() {
        let mut config: Config = serde_yaml::from_str(minimal_yaml()).expect("parse");
        config.finalize().expect("finalize");
        assert_eq!(config.builds.len(), 1);
        assert_eq!(config.builds[0].id, "default");
        assert_eq!(config.archives.len(), 1);
        assert_eq!(config.archives[0].format, "tar.gz");
        assert_eq!(config.dist, PathBuf::from("dist"));
    }

    #[test]
    fn missing_project_name_is_a_config_error() {
        let mut config = Config::default();
        let err = config.finalize().unwrap_err();
        let release = err.downcast_ref::<ReleaseError>().expect("typed error");
        assert!(matches!(release, ReleaseError::Config(_)));
    }

    #[test]
    fn duplicate_build_ids_are_rejected() {
        let yaml = r#"
project_name: widget
builds:
  - id: app
  - id: app
"#;
        let mut config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(config.finalize().is_err());
    }

    #[test]
    fn unknown_archive_format_is_rejected() {
        let yaml = r#"
project_name: widget
archives:
  - id: default
    format: rar
"#;
        let mut config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(config.finalize().is_err());
    }

    #[test]
    fn hooks_accept_bare_strings_and_detailed_form() {
        let yaml = r#"
project_name: widget
hooks:
  before:
    - cargo fetch
    - cmd: cargo generate-lockfile
      dir: subdir
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.hooks.before.len(), 2);
        assert_eq!(config.hooks.before[0].cmd(), "cargo fetch");
        assert_eq!(config.hooks.before[1].dir(), Some("subdir"));
    }

    #[test]
    fn release_without_owner_is_rejected() {
        let yaml = r#"
project_name: widget
release:
  name: widget
"#;
        let mut config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert!(config.finalize().is_err());
    }

    #[test]
    fn cache_defaults_are_sensible() {
        let cache = CacheConfig::default();
        assert!(!cache.enabled);
        assert_eq!(cache.ttl, Duration::from_secs(86_400));
        assert_eq!(cache.overflow, CacheOverflow::WarnAccept);
        assert!(cache.max_size > 0);
    }

    #[test]
    fn cache_ttl_accepts_humantime_strings() {
        let yaml = r#"
project_name: widget
cache:
  enabled: true
  ttl: 12h
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.cache.ttl, Duration::from_secs(12 * 3600));
    }

    #[test]
    fn full_config_roundtrips_through_yaml() {
        let yaml = r#"
project_name: widget
builds:
  - id: app
    binary: "{{ ProjectName }}"
    goos: [linux, darwin]
    goarch: [amd64]
archives:
  - id: app
    format: tar.gz
    format_overrides:
      - goos: windows
        format: zip
checksum:
  algorithm: sha256
signs:
  - id: default
    artifacts: checksum
release:
  owner: acme
  name: widget
"#;
        let mut config: Config = serde_yaml::from_str(yaml).expect("parse");
        config.finalize().expect("finalize");
        assert_eq!(config.builds[0].goos, vec!["linux", "darwin"]);
        assert_eq!(config.archives[0].format_overrides[0].format, "zip");
        assert_eq!(config.signs[0].artifacts, SignTargets::Checksum);
        assert_eq!(config.release.as_ref().unwrap().owner, "acme");
    }

    #[test]
    fn unknown_template_identifier_is_caught_at_load_time() {
        let mut config = Config {
            project_name: "widget".to_string(),
            ..Config::default()
        };
        config.finalize().expect("finalize");
        config.archives[0].name_template = "{{ Vesion }}".to_string();

        let err = config.validate_templates().unwrap_err();
        let release = err.downcast_ref::<ReleaseError>().expect("typed error");
        assert!(matches!(release, ReleaseError::Config(_)));
        let msg = err.to_string();
        assert!(msg.contains("archives.default"), "{msg}");
        assert!(msg.contains("Vesion"), "{msg}");
    }

    #[test]
    fn typoed_sign_args_fail_template_validation() {
        let mut config = Config {
            project_name: "widget".to_string(),
            ..Config::default()
        };
        config.finalize().expect("finalize");
        config.signs.push(SignSpec {
            args: vec!["--detach-sign".to_string(), "{{ Artifcat }}".to_string()],
            ..SignSpec::default()
        });

        let err = config.validate_templates().unwrap_err();
        assert!(err.to_string().contains("signs.default"), "{err:#}");
    }

    #[test]
    fn artifact_scope_identifiers_pass_template_validation() {
        let mut config = Config {
            project_name: "widget".to_string(),
            ..Config::default()
        };
        config.finalize().expect("finalize");
        config.archives[0].name_template =
            "{{ ProjectName }}_{{ Version }}_{{ Os }}_{{ Arch }}_{{ Binary }}".to_string();
        config.signs.push(SignSpec::default());
        config.uploads.push(UploadSpec {
            target: "https://pkg.example.com/{{ ArtifactName }}".to_string(),
            ..UploadSpec::default()
        });

        config.validate_templates().expect("all identifiers are in scope");
    }

    #[test]
    fn docker_enabled_requires_image_templates() {
        let mut config = Config {
            project_name: "widget".into(),
            ..Config::default()
        };
        config.dockers.push(DockerSpec::default());
        assert!(!config.docker_enabled());
        config.dockers[0]
            .image_templates
            .push("ghcr.io/acme/widget:{{ Tag }}".into());
        assert!(config.docker_enabled());
    }
}
