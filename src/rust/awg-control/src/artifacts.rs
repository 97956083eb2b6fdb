// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Content addressed storage of sequencer sources and compiled binaries.
//!
//! Layout below the AWG module directory:
//!
//! ```text
//! {directory}/awg/
//! ├── src/    <sha512 hex>.seqc
//! ├── elf/    <sha512 hex>.elf
//! └── waves/
//! ```
//!
//! The file names are shared with every other tool working on the same
//! directory and must not change.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha512};

use crate::{Error, Result};

pub const SOURCE_EXTENSION: &str = "seqc";
pub const BINARY_EXTENSION: &str = "elf";

const HASH_HEX_LEN: usize = 128;

static HASHED_ARTIFACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{128}\.(seqc|elf)$").expect("Internal error: invalid artifact pattern")
});

/// SHA-512 of a sequencer source, as 128 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceHash(String);

impl SourceHash {
    pub fn from_source(source: &str) -> Self {
        SourceHash(hex::encode(Sha512::digest(source.as_bytes())))
    }

    /// Create from an existing hash string (validates format).
    pub fn from_str_checked(s: &str) -> Result<Self> {
        if s.len() != HASH_HEX_LEN {
            return Err(Error::configuration(format!(
                "Invalid source hash length: expected {HASH_HEX_LEN} hex chars, got {}",
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::configuration("Invalid hex character in source hash"));
        }
        Ok(SourceHash(s.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn source_file_name(&self) -> String {
        format!("{}.{SOURCE_EXTENSION}", self.0)
    }

    pub fn binary_file_name(&self) -> String {
        format!("{}.{BINARY_EXTENSION}", self.0)
    }
}

impl fmt::Display for SourceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_str_checked(s)
    }
}

impl AsRef<str> for SourceHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Artifact folders of one AWG module directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    pub fn new(module_directory: impl Into<PathBuf>) -> Self {
        Self {
            base: module_directory.into().join("awg"),
        }
    }

    pub fn src_dir(&self) -> PathBuf {
        self.base.join("src")
    }

    pub fn elf_dir(&self) -> PathBuf {
        self.base.join("elf")
    }

    pub fn waves_dir(&self) -> PathBuf {
        self.base.join("waves")
    }

    /// Create the artifact folders if they don't exist.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.src_dir(), self.elf_dir(), self.waves_dir()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn source_path(&self, hash: &SourceHash) -> PathBuf {
        self.src_dir().join(hash.source_file_name())
    }

    pub fn binary_path(&self, hash: &SourceHash) -> PathBuf {
        self.elf_dir().join(hash.binary_file_name())
    }

    /// A present binary is trusted without further verification.
    pub fn has_binary(&self, hash: &SourceHash) -> bool {
        self.binary_path(hash).is_file()
    }

    /// Persist `source` under its hash.
    ///
    /// An existing file is left alone. Returns whether the file was written.
    pub fn store_source(&self, hash: &SourceHash, source: &str) -> Result<bool> {
        let path = self.source_path(hash);
        if path.is_file() {
            return Ok(false);
        }
        fs::write(&path, source)?;
        Ok(true)
    }

    /// Delete all hash named sources and binaries. Returns the number of deleted files.
    pub fn clear(&self) -> Result<usize> {
        let mut deleted = 0;
        for dir in [self.src_dir(), self.elf_dir()] {
            deleted += remove_hashed_files(&dir)?;
        }
        Ok(deleted)
    }
}

fn remove_hashed_files(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut deleted = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| HASHED_ARTIFACT.is_match(name));
        if matches && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            deleted += 1;
        }
    }
    Ok(deleted)
}
