//! Child-process execution with cooperative cancellation.
//!
//! Every external invocation in the pipeline (builders, package tools,
//! signers, docker, hooks) funnels through [`run_command`]; the poll loop
//! kills the child as soon as the cancellation token trips.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::cancel::CancelToken;

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) exit_code: i32,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) duration: Duration,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub(crate) fn run_command(
    program: &str,
    args: &[String],
    working_dir: Option<&Path>,
    envs: &BTreeMap<String, String>,
    stdin: Option<&str>,
    token: &CancelToken,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }
    for (key, value) in envs {
        command.env(key, value);
    }
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(input.as_bytes())
            .with_context(|| format!("failed to write stdin of {}", program))?;
        // Dropping the pipe closes it so the child sees EOF.
    }

    let exit_code = loop {
        match child.try_wait().context("failed to poll child process")? {
            Some(status) => break status.code().unwrap_or(-1),
            None => {
                if token.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    anyhow::bail!(crate::error::ReleaseError::Cancelled(token.cause()));
                }
                std::thread::sleep(WAIT_POLL);
            }
        }
    };

    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        duration: start.elapsed(),
    })
}

/// Execute a command string through the platform shell: POSIX `sh -lc` on
/// unix, `powershell -Command` on windows. Shell choice is made at call
/// time; callers pass the env map explicitly.
pub(crate) fn run_shell(
    script: &str,
    working_dir: Option<&Path>,
    envs: &BTreeMap<String, String>,
    token: &CancelToken,
) -> Result<CommandOutput> {
    let (program, args) = shell_invocation(script);
    run_command(program, &args, working_dir, envs, None, token)
}

#[cfg(unix)]
fn shell_invocation(script: &str) -> (&'static str, Vec<String>) {
    ("sh", vec!["-lc".to_string(), script.to_string()])
}

#[cfg(windows)]
fn shell_invocation(script: &str) -> (&'static str, Vec<String>) {
    ("powershell", vec!["-Command".to_string(), script.to_string()])
}

/// Tail of a possibly-large output, for error context.
pub(crate) fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
