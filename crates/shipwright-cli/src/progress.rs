//! Progress reporting with TTY detection.
//!
//! In a terminal, engine messages render above an indicatif spinner; in CI
//! or a pipe they fall back to plain prefixed stderr lines.

use std::io::{IsTerminal, stderr};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use shipwright::pipeline::Reporter;

pub fn is_tty() -> bool {
    stderr().is_terminal()
}

/// Reporter that shows a live spinner in TTY mode and plain text otherwise.
pub struct ProgressReporter {
    bar: Option<ProgressBar>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = if is_tty() {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };
        Self { bar }
    }

    /// A reporter that never draws a bar, regardless of TTY.
    pub fn plain() -> Self {
        Self { bar: None }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }

    fn line(&mut self, prefix: &str, msg: &str) {
        match &self.bar {
            Some(bar) => {
                bar.set_message(msg.to_string());
                bar.println(format!("{prefix} {msg}"));
            }
            None => eprintln!("{prefix} {msg}"),
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ProgressReporter {
    fn info(&mut self, msg: &str) {
        self.line("[info]", msg);
    }

    fn warn(&mut self, msg: &str) {
        self.line("[warn]", msg);
    }

    fn error(&mut self, msg: &str) {
        self.line("[error]", msg);
    }
}
