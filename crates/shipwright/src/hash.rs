//! Content hashing free functions.
//!
//! Hashing is deliberately not a method on any type: the cache, the checksum
//! stage, and the publishers all call the same streaming digests, which
//! handle files larger than memory.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

const BUF_SIZE: usize = 64 * 1024;

/// Digest algorithm selectable in the checksum spec. sha256 is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Hex digest of everything `reader` yields.
pub fn hash_stream(reader: &mut dyn Read, algorithm: HashAlgorithm) -> Result<String> {
    match algorithm {
        HashAlgorithm::Sha256 => digest_stream::<Sha256>(reader),
        HashAlgorithm::Sha512 => digest_stream::<Sha512>(reader),
    }
}

fn digest_stream<D: Digest>(reader: &mut dyn Read) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).context("failed to read stream")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex digest of a file's contents.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    hash_stream(&mut file, algorithm)
        .with_context(|| format!("failed to hash {}", path.display()))
}

/// Hex digest of every file under `dir` matching one of `patterns`
/// (glob syntax, relative to `dir`), in sorted path order. Both the relative
/// path and the content feed the digest, so renames change the result.
pub fn hash_dir_tree(dir: &Path, patterns: &[String], algorithm: HashAlgorithm) -> Result<String> {
    let mut matched: Vec<std::path::PathBuf> = Vec::new();
    for pattern in patterns {
        let full = dir.join(pattern);
        let full = full.to_string_lossy().into_owned();
        for entry in glob::glob(&full).with_context(|| format!("bad glob pattern {pattern}"))? {
            let path = entry.context("failed to expand glob")?;
            if path.is_file() {
                matched.push(path);
            }
        }
    }
    matched.sort();
    matched.dedup();

    let mut per_file: Vec<String> = Vec::with_capacity(matched.len());
    for path in &matched {
        let rel = path.strip_prefix(dir).unwrap_or(path);
        let content = hash_file(path, algorithm)?;
        per_file.push(format!("{}:{}", rel.display(), content));
    }
    let mut joined = per_file.join("\n");
    hash_stream(&mut joined.as_bytes(), algorithm)
}
