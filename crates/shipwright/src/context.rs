//! Template context: `{{ … }}` expansion over a merged variable scope.
//!
//! Configuration strings (archive names, hook commands, signer args, image
//! tags, announce messages) are rendered against a named scope built from
//! the project, git snapshot, target, and process environment. Rendering is
//! strict: an unknown identifier is an error, not an empty string.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use minijinja::value::Value;
use minijinja::{Environment, UndefinedBehavior};
use thiserror::Error;

use crate::types::{GitInfo, Target};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template {template:?}: {message}")]
    Render { template: String, message: String },
}

/// An immutable variable scope. `apply` is a pure function of the template
/// string and this scope; clones (`with_artifact`, `with_var`) produce
/// independent scopes so concurrent per-target renders never race.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    vars: BTreeMap<String, Value>,
}

impl TemplateContext {
    /// Build the run-level scope from project, git snapshot, effective
    /// version, and an explicit environment map.
    pub fn new(
        project_name: &str,
        git: &GitInfo,
        version: &str,
        env: BTreeMap<String, String>,
    ) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("ProjectName".to_string(), Value::from(project_name));
        vars.insert("Version".to_string(), Value::from(version));
        vars.insert(
            "Tag".to_string(),
            Value::from(git.tag.clone().unwrap_or_default()),
        );
        vars.insert(
            "PreviousTag".to_string(),
            Value::from(git.previous_tag.clone().unwrap_or_default()),
        );
        vars.insert("Commit".to_string(), Value::from(git.commit.clone()));
        vars.insert(
            "ShortCommit".to_string(),
            Value::from(git.short_commit.clone()),
        );
        vars.insert(
            "Branch".to_string(),
            Value::from(git.branch.clone().unwrap_or_default()),
        );
        vars.insert("Date".to_string(), Value::from(rfc3339(git.commit_timestamp)));
        vars.insert(
            "Timestamp".to_string(),
            Value::from(git.commit_timestamp.timestamp()),
        );

        let (major, minor, patch, prerelease) = match &git.semver {
            Some(v) => (
                v.major,
                v.minor,
                v.patch,
                v.pre.as_str().to_string(),
            ),
            None => (0, 0, 0, String::new()),
        };
        vars.insert("Major".to_string(), Value::from(major));
        vars.insert("Minor".to_string(), Value::from(minor));
        vars.insert("Patch".to_string(), Value::from(patch));
        vars.insert("Prerelease".to_string(), Value::from(prerelease));

        vars.insert("Env".to_string(), Value::from_serialize(&env));
        vars.insert("Changelog".to_string(), Value::from(""));

        Self { vars }
    }

    /// Render `template` against this scope. Pure; fails on any unknown
    /// identifier.
    pub fn apply(&self, template: &str) -> Result<String, TemplateError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.render_str(template, Value::from_serialize(&self.vars))
            .map_err(|e| TemplateError::Render {
                template: template.to_string(),
                message: e.to_string(),
            })
    }

    /// An artifact-aware sub-scope: the parent plus `Binary`, `Os`, `Arch`,
    /// `Arm`, `Amd64`. Does not mutate the parent.
    pub fn with_artifact(&self, binary: &str, target: &Target) -> Self {
        let mut vars = self.vars.clone();
        vars.insert("Binary".to_string(), Value::from(binary));
        vars.insert("Os".to_string(), Value::from(target.os.clone()));
        vars.insert("Arch".to_string(), Value::from(target.arch.clone()));
        vars.insert(
            "Arm".to_string(),
            Value::from(target.arm.clone().unwrap_or_default()),
        );
        vars.insert(
            "Amd64".to_string(),
            Value::from(target.amd64.clone().unwrap_or_default()),
        );
        Self { vars }
    }

    /// The parent scope plus one extra variable.
    pub fn with_var(&self, name: &str, value: &str) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(name.to_string(), Value::from(value));
        Self { vars }
    }

    /// Look up a variable's rendered string form (used by publishers that
    /// need raw values rather than a template).
    pub fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).map(|v| v.to_string())
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
