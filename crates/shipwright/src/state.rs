//! Run-state persistence for resumable releases.
//!
//! `prepare` serializes the registry plus the version identity into
//! `<dist>/.releaser-state.json`; `publish`, `announce`, and `continue`
//! restore it into a fresh registry and run only their stages. A missing
//! state file is not an error for `load`; it just means no prior prepare.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::ArtifactRegistry;
use crate::types::Artifact;

/// Current state schema version.
pub const CURRENT_STATE_SCHEMA: &str = "shipwright.state.v1";

pub const STATE_FILE: &str = ".releaser-state.json";

/// Serializable snapshot of one prepared release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "default_schema")]
    pub schema_version: String,
    pub version: String,
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub artifacts: Vec<Artifact>,
}

fn default_schema() -> String {
    CURRENT_STATE_SCHEMA.to_string()
}

impl RunState {
    pub fn new(version: impl Into<String>, tag: impl Into<String>, mut artifacts: Vec<Artifact>) -> Self {
        // Registry insertion order depends on thread scheduling; a sorted
        // list keeps repeated prepares byte-identical up to the timestamp.
        artifacts.sort_by(|a, b| (a.kind, &a.name, &a.path).cmp(&(b.kind, &b.name, &b.path)));
        Self {
            schema_version: CURRENT_STATE_SCHEMA.to_string(),
            version: version.into(),
            tag: tag.into(),
            timestamp: Utc::now(),
            artifacts,
        }
    }

    /// Restore this snapshot's artifacts into `registry`.
    pub fn restore(&self, registry: &ArtifactRegistry) {
        for artifact in &self.artifacts {
            registry.add(artifact.clone());
        }
    }
}

pub fn state_path(dist: &Path) -> PathBuf {
    dist.join(STATE_FILE)
}

pub fn save_state(dist: &Path, state: &RunState) -> Result<()> {
    fs::create_dir_all(dist)
        .with_context(|| format!("failed to create dist dir {}", dist.display()))?;
    write_json_atomic(&state_path(dist), state)
}

pub fn load_state(dist: &Path) -> Result<Option<RunState>> {
    let path = state_path(dist);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    let state: RunState = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse state JSON {}", path.display()))?;
    if state.schema_version != CURRENT_STATE_SCHEMA {
        anyhow::bail!(
            "unsupported state schema {} in {} (expected {})",
            state.schema_version,
            path.display(),
            CURRENT_STATE_SCHEMA
        );
    }
    Ok(Some(state))
}

/// Crash-safe JSON write: stream the document into a staged sibling file,
/// flush it, and swap it into place with a rename. Readers never observe a
/// torn document. After the swap the containing directory is synced as well
/// so the rename itself survives a crash; platforms that refuse a directory
/// handle just skip that step.
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let staged = path.with_extension("tmp");

    let file = fs::File::create(&staged)
        .with_context(|| format!("failed to stage {}", staged.display()))?;
    serde_json::to_writer_pretty(&file, value)
        .with_context(|| format!("failed to serialize JSON into {}", staged.display()))?;
    file.sync_all().ok();
    drop(file);

    fs::rename(&staged, path).with_context(|| {
        format!(
            "failed to swap {} into place as {}",
            staged.display(),
            path.display()
        )
    })?;

    if let Some(dir) = path.parent()
        && let Ok(handle) = fs::File::open(dir)
    {
        let _ = handle.sync_all();
    }
    Ok(())
}
