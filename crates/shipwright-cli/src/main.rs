//! Shipwright CLI: declarative release pipeline runner.

mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use shipwright::cancel::CancelToken;
use shipwright::config::{CONFIG_FILE, Config};
use shipwright::error::ReleaseError;
use shipwright::git::{self, GitProbe};
use shipwright::pipeline::{Pipeline, Reporter};
use shipwright::types::{GitInfo, PipelineOptions};

use progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "shipwright", version)]
#[command(about = "Build, package, sign, publish, and announce releases from one config file")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args, Debug, Default, Clone)]
struct RunFlags {
    /// Stop after serializing run state for a later publish/announce.
    #[arg(long)]
    prepare: bool,

    /// Tolerate missing/dirty git state and derive a synthetic version.
    #[arg(long)]
    snapshot: bool,

    /// Derive a nightly version from the current tag.
    #[arg(long)]
    nightly: bool,

    /// Restrict the run to one target, e.g. linux_amd64.
    #[arg(long, value_name = "TARGET")]
    single_target: Option<String>,

    #[arg(long)]
    skip_publish: bool,

    #[arg(long)]
    skip_sign: bool,

    #[arg(long)]
    skip_docker: bool,

    #[arg(long)]
    skip_announce: bool,

    /// Remove the dist directory before running.
    #[arg(long)]
    clean: bool,

    /// Max concurrent builds (default: available hardware parallelism).
    #[arg(long, value_name = "N")]
    parallelism: Option<usize>,

    /// Overall run timeout (e.g. 30m, 2h).
    #[arg(long, value_name = "D")]
    timeout: Option<String>,

    /// Per-target build timeout (e.g. 10m).
    #[arg(long, value_name = "D")]
    build_timeout: Option<String>,

    /// Downgrade per-target build failures to warnings.
    #[arg(long)]
    silent: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Full pipeline run: build, package, sign, publish, announce.
    Release(RunFlags),
    /// Build, archive, and checksum only (implies every skip flag).
    Build(RunFlags),
    /// Load prepared state and run the publisher stage only.
    Publish {
        /// Overall timeout (e.g. 30m).
        #[arg(long, value_name = "D")]
        timeout: Option<String>,
    },
    /// Load prepared state and run the announcer stage only.
    Announce {
        #[arg(long, value_name = "D")]
        timeout: Option<String>,
    },
    /// Load prepared state and run publisher plus announcer.
    Continue {
        #[arg(long, value_name = "D")]
        timeout: Option<String>,
    },
    /// Print the commit log between the previous tag and HEAD.
    Changelog,
    /// Validate the configuration file.
    Check,
    /// Write a starter configuration file.
    Init,
    /// Print version information.
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[error] {e:#}");
            ExitCode::from(exit_code(&e) as u8)
        }
    }
}

/// Map the error taxonomy onto the documented exit codes; untyped errors
/// count as user/config problems.
fn exit_code(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<ReleaseError>()
        .map(ReleaseError::exit_code)
        .unwrap_or(1)
}

fn run(cli: Cli) -> Result<()> {
    match cli.cmd {
        Commands::Release(flags) => run_pipeline(&cli.config, flags, false),
        Commands::Build(flags) => run_pipeline(&cli.config, flags, true),
        Commands::Publish { timeout } => resume(&cli.config, timeout, true, false),
        Commands::Announce { timeout } => resume(&cli.config, timeout, false, true),
        Commands::Continue { timeout } => resume(&cli.config, timeout, true, true),
        Commands::Changelog => changelog(&cli.config),
        Commands::Check => check(&cli.config),
        Commands::Init => init(&cli.config),
        Commands::Version => {
            println!("shipwright {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_pipeline(config_path: &PathBuf, flags: RunFlags, build_only: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let git = probe_git(flags.snapshot)?;

    let opts = PipelineOptions {
        prepare: flags.prepare && !build_only,
        snapshot: flags.snapshot,
        nightly: flags.nightly,
        single_target: flags.single_target.clone(),
        skip_publish: flags.skip_publish || build_only,
        skip_sign: flags.skip_sign || build_only,
        skip_docker: flags.skip_docker || build_only,
        skip_announce: flags.skip_announce || build_only,
        clean_dist: flags.clean,
        parallelism: flags
            .parallelism
            .unwrap_or_else(|| PipelineOptions::default().parallelism),
        timeout: parse_duration_flag(flags.timeout.as_deref())?,
        build_timeout: parse_duration_flag(flags.build_timeout.as_deref())?,
        silent: flags.silent,
    };

    let notes = release_notes(&git);
    let pipeline = Pipeline::new(config, git, opts)?.with_changelog(&notes);

    let reporter = Arc::new(Mutex::new(ProgressReporter::new()));
    let shared: Arc<Mutex<dyn Reporter + Send>> = reporter.clone();
    let result = pipeline.run(&shared);
    reporter.lock().unwrap().finish();
    result
}

fn resume(
    config_path: &PathBuf,
    timeout: Option<String>,
    run_publish: bool,
    run_announce: bool,
) -> Result<()> {
    let config = Config::load(config_path)?;
    // Resumed runs tolerate whatever the work tree looks like now; the
    // prepared state carries the release identity.
    let git = probe_git(true)?;
    let opts = PipelineOptions {
        snapshot: git.tag.is_none() || git.dirty,
        timeout: parse_duration_flag(timeout.as_deref())?,
        ..PipelineOptions::default()
    };

    let notes = release_notes(&git);
    let pipeline = Pipeline::new(config, git, opts)?.with_changelog(&notes);

    let reporter = Arc::new(Mutex::new(ProgressReporter::new()));
    let shared: Arc<Mutex<dyn Reporter + Send>> = reporter.clone();
    let result = pipeline.resume(run_publish, run_announce, &shared);
    reporter.lock().unwrap().finish();
    result
}

fn changelog(config_path: &PathBuf) -> Result<()> {
    // The config is loaded for its side effect: failing early on a broken
    // file, matching every other subcommand.
    Config::load(config_path)?;
    let probe = GitProbe::new(std::env::current_dir()?);
    let token = CancelToken::new();
    let info = probe.info(&token)?;

    let to = info.tag.clone().unwrap_or_else(|| "HEAD".to_string());
    let lines = probe.changelog(info.previous_tag.as_deref(), &to, &token)?;
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn check(config_path: &PathBuf) -> Result<()> {
    let config = Config::load(config_path)?;
    // Load already template-checks; repeated here so `check` stays a
    // complete validation pass even if load's behavior changes.
    config.validate_templates()?;
    println!(
        "{} ok: {} build(s), {} archive(s), {} sign spec(s)",
        config_path.display(),
        config.builds.len(),
        config.archives.len(),
        config.signs.len()
    );
    Ok(())
}

fn init(config_path: &PathBuf) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!(ReleaseError::Config(format!(
            "{} already exists",
            config_path.display()
        )));
    }
    std::fs::write(config_path, SAMPLE_CONFIG)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    println!("wrote {}", config_path.display());
    Ok(())
}

fn probe_git(snapshot: bool) -> Result<GitInfo> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    if git::is_repository(&cwd) {
        let probe = GitProbe::new(cwd);
        match probe.info(&CancelToken::new()) {
            Ok(info) => return Ok(info),
            Err(e) if !snapshot => return Err(e),
            Err(_) => {}
        }
    } else if !snapshot {
        anyhow::bail!(ReleaseError::Precondition(
            "not a git repository; run with --snapshot to release anyway".to_string()
        ));
    }
    Ok(GitInfo::synthetic())
}

fn release_notes(git: &GitInfo) -> String {
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(_) => return String::new(),
    };
    if !git::is_repository(&cwd) {
        return String::new();
    }
    let probe = GitProbe::new(cwd);
    let to = git.tag.clone().unwrap_or_else(|| "HEAD".to_string());
    probe
        .changelog(git.previous_tag.as_deref(), &to, &CancelToken::new())
        .map(|lines| lines.join("\n"))
        .unwrap_or_default()
}

fn parse_duration_flag(raw: Option<&str>) -> Result<Option<Duration>> {
    raw.map(|s| {
        humantime::parse_duration(s)
            .map_err(|e| anyhow::Error::new(ReleaseError::Config(format!("invalid duration {s:?}: {e}"))))
    })
    .transpose()
}

const SAMPLE_CONFIG: &str = r#"# Shipwright release configuration.
project_name: my-project

builds:
  - id: default
    binary: "{{ ProjectName }}"
    # The default builder runs this tool; it must write the binary to the
    # path handed to it in $OUTPUT.
    command: cargo
    args: ["run", "--quiet", "--bin", "xtask", "--", "dist", "{{ Os }}", "{{ Arch }}"]
    goos: [linux, darwin]
    goarch: [amd64, arm64]

archives:
  - id: default
    format: tar.gz
    format_overrides:
      - goos: windows
        format: zip

checksum:
  algorithm: sha256

# release:
#   host: github
#   owner: my-org
#   name: my-project

# announce:
#   webhook:
#     url: https://hooks.example.com/releases
"#;
