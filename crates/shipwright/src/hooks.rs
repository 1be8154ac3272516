//! Hook execution.
//!
//! Hooks are shell-level commands run before and after the pipeline; both
//! the command string and the optional working directory pass through
//! template rendering first. The runner picks the platform shell at call
//! time and callers hand it the env map explicitly.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::cancel::CancelToken;
use crate::config::Hook;
use crate::context::TemplateContext;
use crate::process;

/// Run `hooks` in order, failing fast on the first error.
pub fn run_hooks(
    hooks: &[Hook],
    tctx: &TemplateContext,
    env: &BTreeMap<String, String>,
    token: &CancelToken,
) -> Result<()> {
    for hook in hooks {
        token.checkpoint()?;
        let cmd = tctx.apply(hook.cmd())?;
        let dir = hook
            .dir()
            .map(|d| tctx.apply(d))
            .transpose()?
            .map(PathBuf::from);

        let out = process::run_shell(&cmd, dir.as_deref(), env, token)
            .with_context(|| format!("hook {cmd:?} failed to execute"))?;
        if !out.success() {
            anyhow::bail!(
                "hook {cmd:?} exited with {}: {}",
                out.exit_code,
                process::tail(&out.stderr, 20)
            );
        }
    }
    Ok(())
}
