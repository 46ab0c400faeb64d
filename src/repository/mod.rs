// src/repository/mod.rs

//! Repository tree management
//!
//! This module provides functionality for:
//! - Enumerating the `pool/{branch}/{component}` scopes of a repository tree
//! - Assigning testing ranks to branches
//! - Reconciling the catalog against the pool (see [`scan`])
//! - Garbage-collecting repos whose pool directory is gone
//! - Looking up every recorded version of a package

pub mod scan;

use crate::db::models::{OwnedRows, PackageRecord, RecordKind, RepoDescriptor};
use crate::error::{Error, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub use scan::{ExtractOutcome, ScanContext, ScanOptions, ScanSummary, reconcile, scan_all};

/// Directory under the repository root holding every package file
pub const POOL_DIR: &str = "pool";

/// One `(branch, component)` slice of the pool
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Scope {
    pub branch: String,
    pub component: String,
}

impl Scope {
    pub fn new(branch: &str, component: &str) -> Self {
        Self {
            branch: branch.to_string(),
            component: component.to_string(),
        }
    }

    /// Filename prefix of every package in this scope, e.g. `pool/stable/main/`
    pub fn pool_prefix(&self) -> String {
        format!("{}/{}/{}/", POOL_DIR, self.branch, self.component)
    }

    /// Directory of this scope under `root`
    pub fn pool_dir(&self, root: &Path) -> PathBuf {
        root.join(POOL_DIR).join(&self.branch).join(&self.component)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.branch, self.component)
    }
}

/// List every `pool/{branch}/{component}` directory under `root`, sorted
pub fn list_scopes(root: &Path) -> Result<Vec<Scope>> {
    let pool = root.join(POOL_DIR);
    if !pool.is_dir() {
        return Err(Error::InitError(format!(
            "No pool directory under {}",
            root.display()
        )));
    }

    let mut scopes = Vec::new();
    for entry in WalkDir::new(&pool)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let component = entry.file_name().to_string_lossy().to_string();
        let branch = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        scopes.push(Scope { branch, component });
    }

    debug!("Found {} scopes under {}", scopes.len(), pool.display());
    Ok(scopes)
}

/// Testing rank per branch
///
/// Lower ranks are more stable. A repo may only depend on repos whose rank is
/// not higher than its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRanks {
    ranks: BTreeMap<String, i64>,
}

impl Default for BranchRanks {
    fn default() -> Self {
        let ranks = [("stable", 0), ("testing", 1), ("explosive", 2)]
            .into_iter()
            .map(|(branch, rank)| (branch.to_string(), rank))
            .collect();
        Self { ranks }
    }
}

impl BranchRanks {
    /// Set the rank of a branch
    pub fn set(&mut self, branch: &str, rank: i64) {
        self.ranks.insert(branch.to_string(), rank);
    }

    /// Rank of a branch; unknown branches rank above every known one
    pub fn rank(&self, branch: &str) -> i64 {
        match self.ranks.get(branch) {
            Some(rank) => *rank,
            None => self.ranks.values().max().map_or(0, |max| max + 1),
        }
    }

    /// Parse a `branch=N` override
    pub fn parse_override(s: &str) -> Result<(String, i64)> {
        let (branch, rank) = s
            .split_once('=')
            .ok_or_else(|| Error::ParseError(format!("Expected branch=N, got {:?}", s)))?;
        let branch = branch.trim();
        if branch.is_empty() {
            return Err(Error::ParseError(format!("Empty branch name in {:?}", s)));
        }
        let rank = rank
            .trim()
            .parse()
            .map_err(|e| Error::ParseError(format!("Invalid rank in {:?}: {}", s, e)))?;
        Ok((branch.to_string(), rank))
    }
}

/// Outcome of a garbage-collection run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    /// Pool subpaths (`{branch}/{component}`) that no longer exist
    pub paths: Vec<String>,
    /// Repo keys removed
    pub repos: Vec<String>,
    pub packages: usize,
    pub duplicates: usize,
    pub dry_run: bool,
}

/// Remove repos whose pool directory no longer exists
///
/// Every Package and Duplicate record of those repos goes with them, along
/// with their owned rows. With `dry_run` nothing is written.
pub fn gc(conn: &mut Connection, root: &Path, dry_run: bool) -> Result<GcSummary> {
    let pool = root.join(POOL_DIR);
    let mut summary = GcSummary {
        dry_run,
        ..Default::default()
    };

    let mut gone_paths = BTreeSet::new();
    for repo in RepoDescriptor::list_all(conn)? {
        if !pool.join(&repo.path).is_dir() {
            if gone_paths.insert(repo.path.clone()) {
                info!("Branch {} to be removed from the database", repo.path);
            }
            summary.repos.push(repo.name);
        }
    }
    summary.paths = gone_paths.into_iter().collect();

    for name in &summary.repos {
        summary.packages += PackageRecord::find_by_repo(conn, RecordKind::Current, name)?.len();
        summary.duplicates += PackageRecord::find_by_repo(conn, RecordKind::Duplicate, name)?.len();
    }

    if dry_run {
        info!("DRY RUN - database is unmodified");
        return Ok(summary);
    }

    crate::db::transaction(conn, |tx| {
        for name in &summary.repos {
            for kind in [RecordKind::Current, RecordKind::Duplicate] {
                for record in PackageRecord::find_by_repo(tx, kind, name)? {
                    PackageRecord::delete(tx, kind, &record.filename)?;
                    OwnedRows::delete(tx, &record.key())?;
                }
            }
            info!("REMOVING repo {} from database", name);
            RepoDescriptor::delete(tx, name)?;
        }
        Ok(())
    })?;

    Ok(summary)
}

/// Every recorded version of a package
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub current: Vec<PackageRecord>,
    pub duplicates: Vec<PackageRecord>,
}

/// Find every current and duplicate record of `package`
///
/// Records are ordered by repo, then newest version first.
pub fn query(conn: &Connection, package: &str) -> Result<QueryResult> {
    Ok(QueryResult {
        current: PackageRecord::find_by_name(conn, RecordKind::Current, package)?,
        duplicates: PackageRecord::find_by_name(conn, RecordKind::Duplicate, package)?,
    })
}
