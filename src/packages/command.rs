// src/packages/command.rs

//! External extractor speaking the `pkgscan_cli` JSON contract
//!
//! The command is run as `<program> <path>` with a null stdin and prints one
//! JSON document on stdout. Exit status 1 or 2 means the archive is corrupted.

use crate::error::{Error, Result};
use crate::packages::control::ControlFields;
use crate::packages::traits::{Extractor, FileType, PackageFile, PackageMetadata};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Extractor that shells out to an external scanner
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ScanOutput {
    size: u64,
    hash_value: Vec<u8>,
    control: String,
    time: i64,
    #[serde(default)]
    so_provides: Vec<String>,
    #[serde(default)]
    so_depends: Vec<String>,
    #[serde(default)]
    files: Vec<ScanFile>,
}

#[derive(Debug, Deserialize)]
struct ScanFile {
    path: String,
    size: i64,
    #[serde(rename = "type")]
    kind: u32,
    perm: u32,
    uid: i64,
    gid: i64,
    #[serde(default)]
    uname: String,
    #[serde(default)]
    gname: String,
}

impl CommandExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Turn the scanner's JSON document into package metadata
    fn parse_output(path: &Path, stdout: &[u8]) -> Result<PackageMetadata> {
        let corrupt = |reason: String| Error::corrupted(path.display().to_string(), reason);

        let output: ScanOutput = serde_json::from_slice(stdout)
            .map_err(|e| corrupt(format!("Invalid extractor output: {}", e)))?;

        let control = ControlFields::parse(&output.control)
            .map_err(|e| corrupt(format!("Malformed control file: {}", e)))?;
        let mut meta = PackageMetadata::from_control(control).map_err(corrupt)?;

        meta.size = output.size;
        meta.sha256 = output
            .hash_value
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        meta.build_time = output.time;
        meta.so_provides = output.so_provides.into_iter().collect();
        meta.so_depends = output.so_depends.into_iter().collect();
        meta.files = output
            .files
            .into_iter()
            .map(|f| PackageFile {
                path: f.path,
                size: f.size,
                ftype: FileType::from_mode(f.kind),
                mode: f.perm,
                uid: f.uid,
                gid: f.gid,
                uname: f.uname,
                gname: f.gname,
            })
            .collect();

        Ok(meta)
    }
}

impl Extractor for CommandExtractor {
    fn extract(&self, path: &Path) -> Result<PackageMetadata> {
        debug!(
            "Running {} on {}",
            self.program.display(),
            path.display()
        );

        let output = Command::new(&self.program)
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| {
                Error::ExtractorUnavailable(format!(
                    "Failed to run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        match output.status.code() {
            Some(0) => Self::parse_output(path, &output.stdout),
            Some(code @ (1 | 2)) => Err(Error::corrupted(
                path.display().to_string(),
                format!("extractor exited with status {}", code),
            )),
            Some(code) => Err(Error::ExtractorUnavailable(format!(
                "{} exited with status {}",
                self.program.display(),
                code
            ))),
            None => Err(Error::ExtractorUnavailable(format!(
                "{} was killed by a signal",
                self.program.display()
            ))),
        }
    }
}
