//! Thread-safe artifact registry.
//!
//! The registry is the only channel between stages: builders append
//! binaries, packagers read them back and append archives and packages,
//! checksums and signatures extend the set, publishers and announcers read
//! the final snapshot. Downstream stages never hold pointers into earlier
//! stages, only query results.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::types::{Artifact, ArtifactKind, Target};

/// Append-mostly collection of artifacts keyed by `(kind, path)` identity.
/// Writers are serialized by the mutex; readers get consistent snapshots of
/// fully-constructed values.
#[derive(Debug, Default)]
pub struct ArtifactRegistry {
    inner: Mutex<Vec<Artifact>>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert if the identity is new; re-inserting the same identity is a
    /// no-op. Returns whether the artifact was inserted.
    pub fn add(&self, artifact: Artifact) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.iter().any(|a| a.identity() == artifact.identity()) {
            return false;
        }
        inner.push(artifact);
        true
    }

    /// Snapshot copy; safe to iterate while other threads add.
    pub fn list(&self) -> Vec<Artifact> {
        self.inner.lock().expect("registry lock poisoned").clone()
    }

    /// Linear scan over a snapshot.
    pub fn filter(&self, predicate: impl Fn(&Artifact) -> bool) -> Vec<Artifact> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .filter(|a| predicate(a))
            .cloned()
            .collect()
    }

    pub fn by_kind(&self, kind: ArtifactKind) -> Vec<Artifact> {
        self.filter(|a| a.kind == kind)
    }

    pub fn by_build_id(&self, build_id: &str) -> Vec<Artifact> {
        self.filter(|a| a.build_id.as_deref() == Some(build_id))
    }

    pub fn by_target(&self, target: &Target) -> Vec<Artifact> {
        self.filter(|a| a.target.as_ref() == Some(target))
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    /// Binaries grouped by target, targets in sorted order. The backbone of
    /// per-target packaging stages.
    pub fn binaries_by_target(&self) -> BTreeMap<Target, Vec<Artifact>> {
        let mut groups: BTreeMap<Target, Vec<Artifact>> = BTreeMap::new();
        for artifact in self.by_kind(ArtifactKind::Binary) {
            if let Some(target) = artifact.target.clone() {
                groups.entry(target).or_default().push(artifact);
            }
        }
        groups
    }
}
