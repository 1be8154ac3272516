use std::fmt;

use thiserror::Error;

/// One failed `(build, target)` pair, kept for the composite build error.
#[derive(Debug, Clone)]
pub struct TargetFailure {
    pub target: String,
    pub message: String,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.message)
    }
}

/// The error taxonomy of the pipeline. Variants map onto process exit codes
/// so the CLI can report a meaningful status to CI.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// Malformed or invalid configuration, including a template referencing
    /// an unknown identifier.
    #[error("config: {0}")]
    Config(String),

    /// Missing git info outside snapshot mode, missing required tool.
    #[error("precondition: {0}")]
    Precondition(String),

    /// Composite failure of one or more `(build, target)` pairs.
    #[error("build failed for {} target(s): {}", .failures.len(), format_failures(.failures))]
    Build { failures: Vec<TargetFailure> },

    /// Composite failure accumulated across packager stages.
    #[error("packaging failed ({} error(s)): {}", .errors.len(), .errors.join("; "))]
    Packaging { errors: Vec<String> },

    #[error("sign: {0}")]
    Sign(String),

    #[error("publish: {0}")]
    Publish(String),

    /// Announce failures are logged per channel; this variant only exists so
    /// channels have a typed error to hand back.
    #[error("announce: {0}")]
    Announce(String),

    /// Cancellation or timeout. Propagates through every stage.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

fn format_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReleaseError {
    /// Process exit code for this error class: 1 user/config, 2 build/stage,
    /// 3 publisher, 4 cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReleaseError::Config(_) | ReleaseError::Precondition(_) => 1,
            ReleaseError::Build { .. }
            | ReleaseError::Packaging { .. }
            | ReleaseError::Sign(_)
            | ReleaseError::Announce(_) => 2,
            ReleaseError::Publish(_) => 3,
            ReleaseError::Cancelled(_) => 4,
        }
    }
}
