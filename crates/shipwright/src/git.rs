//! Git repository probing and version derivation.
//!
//! The pipeline consumes a pre-resolved [`GitInfo`] snapshot; this module
//! produces it by shelling out to `git`, the same way it runs every other
//! external tool. Snapshot and nightly modes synthesize a version when the
//! tag is absent or the tree is dirty.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::cancel::CancelToken;
use crate::error::ReleaseError;
use crate::process;
use crate::types::GitInfo;

pub struct GitProbe {
    repo_root: PathBuf,
}

impl GitProbe {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Capture a repository snapshot. Fails when the directory is not a git
    /// repository; individual fields degrade to `None` when git cannot
    /// answer (no tag yet, detached head, no remote).
    pub fn info(&self, token: &CancelToken) -> Result<GitInfo> {
        let commit = self
            .git(&["rev-parse", "HEAD"], token)?
            .context("not a git repository or no commits yet")?;
        let short_commit = self
            .git(&["rev-parse", "--short", "HEAD"], token)?
            .unwrap_or_else(|| commit.chars().take(7).collect());

        let branch = self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"], token)?
            .filter(|b| b != "HEAD");

        let tag = self.git(&["describe", "--tags", "--exact-match", "HEAD"], token)?;
        let previous_tag = match &tag {
            Some(t) => self.git(
                &["describe", "--tags", "--abbrev=0", &format!("{t}^")],
                token,
            )?,
            None => self.git(&["describe", "--tags", "--abbrev=0", "HEAD"], token)?,
        };

        let dirty = self
            .git(&["status", "--porcelain"], token)?
            .map(|s| !s.is_empty())
            .unwrap_or(false);

        let commit_timestamp = self
            .git(&["log", "-1", "--format=%cI"], token)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let remote_url = self.git(&["remote", "get-url", "origin"], token)?;

        let semver = tag
            .as_deref()
            .map(strip_v)
            .and_then(|v| semver::Version::parse(v).ok());

        Ok(GitInfo {
            tag,
            previous_tag,
            commit,
            short_commit,
            branch,
            dirty,
            commit_timestamp,
            remote_url,
            semver,
        })
    }

    /// Commit subjects between `from` (exclusive) and `to`, newest first.
    /// With no `from`, the whole history up to `to` is listed.
    pub fn changelog(
        &self,
        from: Option<&str>,
        to: &str,
        token: &CancelToken,
    ) -> Result<Vec<String>> {
        let range = match from {
            Some(f) => format!("{f}..{to}"),
            None => to.to_string(),
        };
        let out = self.git(&["log", "--pretty=format:%h %s", &range], token)?;
        Ok(out
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default())
    }

    /// Run one git subcommand; `Ok(None)` when git exits non-zero.
    fn git(&self, args: &[&str], token: &CancelToken) -> Result<Option<String>> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let out = process::run_command(
            "git",
            &args,
            Some(&self.repo_root),
            &BTreeMap::new(),
            None,
            token,
        )?;
        if out.success() {
            Ok(Some(out.stdout.trim().to_string()).filter(|s| !s.is_empty()))
        } else {
            Ok(None)
        }
    }
}

fn strip_v(tag: &str) -> &str {
    tag.strip_prefix('v').unwrap_or(tag)
}

/// Derive the release version string for this run.
///
/// - Tagged, clean tree: the tag with its leading `v` stripped.
/// - Snapshot mode: `<base>-SNAPSHOT-<short-commit>`, where base is the tag
///   (if any) or `0.0.0`. Dirty trees and missing tags are tolerated.
/// - Nightly mode: `<base>-nightly.<yyyymmdd>` derived from the commit date.
/// - Otherwise a missing tag or dirty tree is a precondition failure.
pub fn effective_version(
    git: &GitInfo,
    snapshot: bool,
    nightly: bool,
) -> Result<String, ReleaseError> {
    let base = git
        .tag
        .as_deref()
        .map(strip_v)
        .unwrap_or("0.0.0")
        .to_string();

    if snapshot {
        return Ok(format!("{}-SNAPSHOT-{}", base, git.short_commit));
    }
    if nightly {
        let date = git.commit_timestamp.format("%Y%m%d");
        return Ok(format!("{base}-nightly.{date}"));
    }
    if git.tag.is_none() {
        return Err(ReleaseError::Precondition(
            "no tag on HEAD; tag the release or run with --snapshot".to_string(),
        ));
    }
    if git.dirty {
        return Err(ReleaseError::Precondition(
            "working tree is dirty; commit or run with --snapshot".to_string(),
        ));
    }
    Ok(base)
}

/// Fail unless the required external tool is on PATH.
pub fn require_tool(name: &str) -> Result<PathBuf, ReleaseError> {
    which::which(name)
        .map_err(|_| ReleaseError::Precondition(format!("required tool not found on PATH: {name}")))
}

/// True when `dir` is inside a git work tree.
pub fn is_repository(dir: &Path) -> bool {
    dir.join(".git").exists()
        || process::run_command(
            "git",
            &["rev-parse".to_string(), "--git-dir".to_string()],
            Some(dir),
            &BTreeMap::new(),
            None,
            &CancelToken::new(),
        )
        .map(|o| o.success())
        .unwrap_or(false)
}
