// src/packages/traits.rs

//! Common traits for package metadata extractors

use crate::error::Result;
use crate::packages::control::ControlFields;
use std::collections::BTreeSet;
use std::path::Path;

/// Type of an archive member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Symlink,
    HardLink,
    Socket,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
    Other,
}

impl FileType {
    /// Classify from the `S_IFMT` bits of a mode
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o140000 => FileType::Socket,
            0o120000 => FileType::Symlink,
            0o100000 => FileType::Regular,
            0o060000 => FileType::BlockDevice,
            0o040000 => FileType::Directory,
            0o020000 => FileType::CharDevice,
            0o010000 => FileType::Fifo,
            _ => FileType::Other,
        }
    }
}

/// Metadata about a file within a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFile {
    /// Member path as stored in the archive, e.g. `./usr/bin/foo`
    pub path: String,
    pub size: i64,
    pub ftype: FileType,
    /// Mode bits; only the permission bits are kept in the catalog
    pub mode: u32,
    pub uid: i64,
    pub gid: i64,
    pub uname: String,
    pub gname: String,
}

/// Everything an extractor reads out of one package archive
#[derive(Debug, Clone)]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub control: ControlFields,
    /// SHA-256 of the whole archive, lowercase hex
    pub sha256: String,
    pub size: u64,
    /// Build timestamp in seconds
    pub build_time: i64,
    /// Installed size in KiB, 0 if the control stanza has none
    pub installed_size: i64,
    pub files: Vec<PackageFile>,
    pub so_provides: BTreeSet<String>,
    pub so_depends: BTreeSet<String>,
}

impl PackageMetadata {
    /// Build metadata around a parsed control stanza
    ///
    /// Fails if any of `Package`, `Version` or `Architecture` is missing.
    pub fn from_control(control: ControlFields) -> std::result::Result<Self, String> {
        let field = |name: &str| {
            control
                .get(name)
                .map(str::to_string)
                .ok_or_else(|| format!("{} field not found in control file", name))
        };
        let name = field("Package")?;
        let version = field("Version")?;
        let architecture = field("Architecture")?;
        let installed_size = control
            .get("Installed-Size")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        Ok(Self {
            name,
            version,
            architecture,
            control,
            sha256: String::new(),
            size: 0,
            build_time: 0,
            installed_size,
            files: Vec::new(),
            so_provides: BTreeSet::new(),
            so_depends: BTreeSet::new(),
        })
    }
}

/// Reads package metadata out of an archive on disk
///
/// Implementations must be shareable across the extraction worker pool.
/// Errors other than `CorruptedArchive` and `ExtractorUnavailable` are treated
/// as corruption of that one file.
pub trait Extractor: Send + Sync {
    /// Extract metadata from the package at `path`
    fn extract(&self, path: &Path) -> Result<PackageMetadata>;
}
