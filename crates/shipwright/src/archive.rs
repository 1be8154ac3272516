//! Archive packaging: tar.gz and zip writers plus the archive stage.
//!
//! The stage reads a registry snapshot grouped by target, resolves the
//! templated archive name and per-os format, and hands a flat entry list to
//! the format writer. Writers emit to a temporary name and rename on
//! success, so a cancelled run never leaves a half-written archive behind.
//! Entry timestamps come from the commit, keeping archive bytes reproducible
//! across reruns of identical inputs.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::cancel::CancelToken;
use crate::config::{ArchiveSpec, Config};
use crate::context::TemplateContext;
use crate::registry::ArtifactRegistry;
use crate::types::{Artifact, ArtifactKind, Target};

/// One file headed into an archive or package.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    /// Path inside the archive.
    pub dest: String,
    pub mode: u32,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Entry timestamp, seconds since the epoch.
    pub mtime: u64,
}

impl ArchiveEntry {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<String>, mode: u32, mtime: u64) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            mode,
            owner: None,
            group: None,
            mtime,
        }
    }
}

/// Format-specific encoder capability.
pub trait ArchiveWriter: Send + Sync {
    fn write(&self, token: &CancelToken, entries: &[ArchiveEntry], out_path: &Path) -> Result<()>;
}

pub struct TarGzWriter;

impl ArchiveWriter for TarGzWriter {
    fn write(&self, token: &CancelToken, entries: &[ArchiveEntry], out_path: &Path) -> Result<()> {
        write_renamed(out_path, |tmp| {
            let file = File::create(tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);

            for entry in entries {
                token.checkpoint()?;
                let mut source = File::open(&entry.source)
                    .with_context(|| format!("failed to open {}", entry.source.display()))?;
                let size = source
                    .metadata()
                    .with_context(|| format!("failed to stat {}", entry.source.display()))?
                    .len();

                let mut header = tar::Header::new_gnu();
                header.set_size(size);
                header.set_mode(entry.mode);
                header.set_mtime(entry.mtime);
                if let Some(owner) = &entry.owner {
                    header.set_username(owner).ok();
                }
                if let Some(group) = &entry.group {
                    header.set_groupname(group).ok();
                }
                header.set_cksum();
                builder
                    .append_data(&mut header, &entry.dest, &mut source)
                    .with_context(|| format!("failed to append {}", entry.dest))?;
            }

            let encoder = builder.into_inner().context("failed to finish tar")?;
            encoder.finish().context("failed to finish gzip")?;
            Ok(())
        })
    }
}

pub struct ZipWriter;

impl ArchiveWriter for ZipWriter {
    fn write(&self, token: &CancelToken, entries: &[ArchiveEntry], out_path: &Path) -> Result<()> {
        write_renamed(out_path, |tmp| {
            let file = File::create(tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            let mut writer = zip::ZipWriter::new(file);

            for entry in entries {
                token.checkpoint()?;
                let options: zip::write::SimpleFileOptions =
                    zip::write::SimpleFileOptions::default()
                        .unix_permissions(entry.mode)
                        // A fixed timestamp keeps the zip bytes reproducible.
                        .last_modified_time(zip::DateTime::default());
                writer
                    .start_file(entry.dest.as_str(), options)
                    .with_context(|| format!("failed to start zip entry {}", entry.dest))?;
                let mut source = File::open(&entry.source)
                    .with_context(|| format!("failed to open {}", entry.source.display()))?;
                io::copy(&mut source, &mut writer)
                    .with_context(|| format!("failed to write zip entry {}", entry.dest))?;
            }

            writer.finish().context("failed to finish zip")?.flush().ok();
            Ok(())
        })
    }
}

/// Run `write` against a temporary sibling path, renaming into place only on
/// success. The temp file is removed on failure or cancellation.
fn write_renamed(out_path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let tmp = out_path.with_extension("partial");
    match write(&tmp) {
        Ok(()) => {
            fs::rename(&tmp, out_path).with_context(|| {
                format!("failed to move {} to {}", tmp.display(), out_path.display())
            })?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Look up a writer by format name.
pub fn writer_for(format: &str) -> Result<Box<dyn ArchiveWriter>> {
    match format {
        "tar.gz" | "tgz" => Ok(Box::new(TarGzWriter)),
        "zip" => Ok(Box::new(ZipWriter)),
        other => anyhow::bail!("unknown archive format {other:?}"),
    }
}

/// The archive stage. One archive per spec per target present in the
/// registry; recoverable failures are collected and returned.
pub fn run_archives(
    config: &Config,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    token: &CancelToken,
) -> Vec<anyhow::Error> {
    let mut errors = Vec::new();
    for spec in &config.archives {
        for (target, binaries) in registry.binaries_by_target() {
            let selected: Vec<Artifact> = binaries
                .into_iter()
                .filter(|b| {
                    spec.builds.is_empty()
                        || b.build_id
                            .as_deref()
                            .map(|id| spec.builds.iter().any(|allowed| allowed == id))
                            .unwrap_or(false)
                })
                .collect();
            if selected.is_empty() {
                continue;
            }
            if let Err(e) = archive_one(config, spec, tctx, registry, &target, &selected, token) {
                errors.push(e.context(format!("archive {} for {}", spec.id, target)));
            }
        }
    }
    errors
}

fn archive_one(
    config: &Config,
    spec: &ArchiveSpec,
    tctx: &TemplateContext,
    registry: &ArtifactRegistry,
    target: &Target,
    binaries: &[Artifact],
    token: &CancelToken,
) -> Result<()> {
    token.checkpoint()?;

    let first_binary = binaries[0]
        .extra
        .get("binary")
        .and_then(|v| v.as_str())
        .unwrap_or(&binaries[0].name)
        .to_string();
    let actx = tctx.with_artifact(&first_binary, target);
    let name = actx.apply(&spec.name_template)?;

    let format = spec
        .format_overrides
        .iter()
        .find(|over| over.goos == target.os)
        .map(|over| over.format.as_str())
        .unwrap_or(spec.format.as_str());
    let writer = writer_for(format)?;

    let mtime = u64::try_from(
        tctx.get("Timestamp")
            .and_then(|t| t.parse::<i64>().ok())
            .unwrap_or_default(),
    )
    .unwrap_or_default();

    let prefix = if spec.wrap_in_directory {
        format!("{name}/")
    } else {
        String::new()
    };

    let mut entries = Vec::new();
    for binary in binaries {
        entries.push(ArchiveEntry::new(
            &binary.path,
            format!("{prefix}{}", binary.name),
            0o755,
            mtime,
        ));
    }
    for pattern in &spec.files {
        let rendered = actx.apply(pattern)?;
        for path in glob::glob(&rendered)
            .with_context(|| format!("bad files glob {rendered:?}"))?
            .flatten()
        {
            if path.is_file() {
                entries.push(ArchiveEntry::new(
                    &path,
                    format!("{prefix}{}", path.display()),
                    0o644,
                    mtime,
                ));
            }
        }
    }

    let out_path = config.dist.join(format!("{name}.{format}"));
    writer.write(token, &entries, &out_path)?;

    registry.add(
        Artifact::new(
            format!("{name}.{format}"),
            &out_path,
            ArtifactKind::Archive,
        )
        .with_target(target.clone())
        .with_extra("id", serde_json::Value::String(spec.id.clone()))
        .with_extra("format", serde_json::Value::String(format.to_string())),
    );
    Ok(())
}
