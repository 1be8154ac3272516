use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// A compile target: operating system, architecture, and the optional
/// sub-architecture flavor carried by `arm` (GOARM-style level) or `amd64`
/// (microarchitecture level). Compared by value.
///
/// The serde field names (`goos`, `goarch`, `goarm`, `goamd64`) match the
/// persisted run-state schema, so a `Target` flattened into an [`Artifact`]
/// serializes straight into the state file layout.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "goos")]
    pub os: String,
    #[serde(rename = "goarch")]
    pub arch: String,
    #[serde(rename = "goarm", default, skip_serializing_if = "Option::is_none")]
    pub arm: Option<String>,
    #[serde(rename = "goamd64", default, skip_serializing_if = "Option::is_none")]
    pub amd64: Option<String>,
}

impl Target {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            arm: None,
            amd64: None,
        }
    }

    pub fn with_arm(mut self, arm: impl Into<String>) -> Self {
        self.arm = Some(arm.into());
        self
    }

    pub fn with_amd64(mut self, amd64: impl Into<String>) -> Self {
        self.amd64 = Some(amd64.into());
        self
    }

    /// The sub-architecture flavor, whichever axis carries it.
    pub fn variant(&self) -> Option<&str> {
        self.arm.as_deref().or(self.amd64.as_deref())
    }

    /// Binary filename suffix for this target (`.exe` on windows).
    pub fn exe_suffix(&self) -> &'static str {
        if self.os == "windows" { ".exe" } else { "" }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os, self.arch)?;
        if let Some(v) = self.variant() {
            write!(f, "_{}", v)?;
        }
        Ok(())
    }
}

/// What kind of output an artifact is. Drives downstream stage selection
/// (archives pick up binaries, checksums pick up archives, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Binary,
    Archive,
    LinuxPackage,
    PlatformPackage,
    Checksum,
    Signature,
    Sbom,
    DockerImage,
    Source,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactKind::Binary => "binary",
            ArtifactKind::Archive => "archive",
            ArtifactKind::LinuxPackage => "linux_package",
            ArtifactKind::PlatformPackage => "platform_package",
            ArtifactKind::Checksum => "checksum",
            ArtifactKind::Signature => "signature",
            ArtifactKind::Sbom => "sbom",
            ArtifactKind::DockerImage => "docker_image",
            ArtifactKind::Source => "source",
        };
        f.write_str(s)
    }
}

/// A named, typed output produced by a stage and retained for downstream
/// stages and publishing. Identity is `(kind, path)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    #[serde(flatten)]
    pub target: Option<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
            target: None,
            build_id: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_build_id(mut self, id: impl Into<String>) -> Self {
        self.build_id = Some(id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Two artifacts with the same identity are the same artifact.
    pub fn identity(&self) -> (ArtifactKind, &Path) {
        (self.kind, self.path.as_path())
    }

    /// True when the build stage satisfied this artifact from the cache.
    pub fn is_cached(&self) -> bool {
        self.extra
            .get("cached")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Snapshot of repository state, created once per run and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitInfo {
    pub tag: Option<String>,
    pub previous_tag: Option<String>,
    pub commit: String,
    pub short_commit: String,
    pub branch: Option<String>,
    pub dirty: bool,
    pub commit_timestamp: DateTime<Utc>,
    pub remote_url: Option<String>,
    /// Semver parse of the current tag (leading `v` stripped). Absent when
    /// there is no tag or it is not a semantic version.
    pub semver: Option<semver::Version>,
}

impl GitInfo {
    /// A synthetic snapshot for runs without a usable repository.
    pub fn synthetic() -> Self {
        Self {
            tag: None,
            previous_tag: None,
            commit: "none".to_string(),
            short_commit: "none".to_string(),
            branch: None,
            dirty: false,
            commit_timestamp: Utc::now(),
            remote_url: None,
            semver: None,
        }
    }
}

/// Runtime knobs for one pipeline run. Mirrors the CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Stop after serializing run state so `publish`/`announce`/`continue`
    /// can pick the release up later.
    pub prepare: bool,
    /// Tolerate absent/dirty git state and derive a synthetic version.
    pub snapshot: bool,
    /// Derive a nightly version from the current tag.
    pub nightly: bool,
    /// Restrict the run to one target (stable string form).
    pub single_target: Option<String>,
    pub skip_publish: bool,
    pub skip_sign: bool,
    pub skip_docker: bool,
    pub skip_announce: bool,
    /// Remove the dist directory before running.
    pub clean_dist: bool,
    /// Max concurrently-running builders.
    pub parallelism: usize,
    /// Overall run timeout.
    pub timeout: Option<Duration>,
    /// Per-target build timeout.
    pub build_timeout: Option<Duration>,
    /// Downgrade per-target build failures to warnings.
    pub silent: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            prepare: false,
            snapshot: false,
            nightly: false,
            single_target: None,
            skip_publish: false,
            skip_sign: false,
            skip_docker: false,
            skip_announce: false,
            clean_dist: false,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            timeout: None,
            build_timeout: None,
            silent: false,
        }
    }
}
