// src/db/models.rs

//! Data models for catalog database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::Result;
use crate::packages::{FileType, PackageMetadata};
use crate::version::Version;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// One architecture slice of a branch/component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoDescriptor {
    /// Repo key, e.g. `amd64/stable` or `bsp-sunxi-armel/testing`
    pub name: String,
    /// Group key shared by every branch of the same slice
    pub realname: String,
    /// Pool subpath, `{branch}/{component}`
    pub path: String,
    /// Testing rank of the branch
    pub testing: i64,
    pub branch: String,
    pub component: String,
    /// Raw architecture from the control stanza (`all` stays `all`)
    pub architecture: String,
}

impl RepoDescriptor {
    /// Derive the descriptor for an architecture within a branch/component
    pub fn derive(branch: &str, component: &str, architecture: &str, testing: i64) -> Self {
        let realname = Self::group_key(component, architecture);
        Self {
            name: format!("{}/{}", realname, branch),
            realname,
            path: format!("{}/{}", branch, component),
            testing,
            branch: branch.to_string(),
            component: component.to_string(),
            architecture: architecture.to_string(),
        }
    }

    /// Repo key for a package of `architecture` in a branch/component
    pub fn key_for(architecture: &str, branch: &str, component: &str) -> String {
        format!("{}/{}", Self::group_key(component, architecture), branch)
    }

    fn group_key(component: &str, architecture: &str) -> String {
        let arch = if architecture == "all" { "noarch" } else { architecture };
        if component == "main" {
            arch.to_string()
        } else {
            format!("{}-{}", component, arch)
        }
    }

    /// Insert this descriptor, refreshing the rank if it already exists
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO repos (name, realname, path, testing, branch, component, architecture)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET testing = excluded.testing",
            params![
                &self.name,
                &self.realname,
                &self.path,
                &self.testing,
                &self.branch,
                &self.component,
                &self.architecture,
            ],
        )?;
        Ok(())
    }

    /// Find a descriptor by repo key
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT name, realname, path, testing, branch, component, architecture
             FROM repos WHERE name = ?1",
        )?;

        let repo = stmt.query_row([name], Self::from_row).optional()?;

        Ok(repo)
    }

    /// List all descriptors
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT name, realname, path, testing, branch, component, architecture
             FROM repos ORDER BY name",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// Delete a descriptor by repo key
    pub fn delete(conn: &Connection, name: &str) -> Result<()> {
        conn.execute("DELETE FROM repos WHERE name = ?1", [name])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            realname: row.get(1)?,
            path: row.get(2)?,
            testing: row.get(3)?,
            branch: row.get(4)?,
            component: row.get(5)?,
            architecture: row.get(6)?,
        })
    }
}

/// Composite identity of a package record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PackageKey {
    pub package: String,
    pub version: String,
    pub repo: String,
}

impl PackageKey {
    pub fn new(package: &str, version: &str, repo: &str) -> Self {
        Self {
            package: package.to_string(),
            version: version.to_string(),
            repo: repo.to_string(),
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) [{}]", self.package, self.version, self.repo)
    }
}

/// Which table a package record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// The current record for its (package, repo)
    Current,
    /// A record that lost a same-key collision, keyed by filename
    Duplicate,
}

impl RecordKind {
    fn table(&self) -> &'static str {
        match self {
            RecordKind::Current => "packages",
            RecordKind::Duplicate => "package_duplicate",
        }
    }
}

const PACKAGE_COLUMNS: &str = "package, version, repo, architecture, filename, size, sha256, \
     mtime, debtime, section, installed_size, maintainer, description, control, _vercomp";

/// A package record, current or duplicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecord {
    pub package: String,
    pub version: String,
    pub repo: String,
    pub architecture: String,
    /// Path relative to the repository root, e.g. `pool/stable/main/f/foo_1.0_amd64.deb`
    pub filename: String,
    pub size: i64,
    pub sha256: String,
    /// File mtime in whole seconds
    pub mtime: i64,
    /// Build timestamp (mtime of the control member)
    pub debtime: i64,
    pub section: Option<String>,
    /// Installed size in KiB
    pub installed_size: i64,
    pub maintainer: Option<String>,
    pub description: Option<String>,
    /// Control stanza as a JSON object
    pub control: String,
    /// Sortable version key
    pub vercomp: String,
}

impl PackageRecord {
    /// Assemble a record from extractor output plus the derived fields
    ///
    /// Fails with `MalformedVersion` if the package version cannot be parsed.
    pub fn from_metadata(
        meta: &PackageMetadata,
        filename: &str,
        size: i64,
        mtime: i64,
        branch: &str,
        component: &str,
    ) -> Result<Self> {
        let version = Version::parse(&meta.version)?;

        Ok(Self {
            package: meta.name.clone(),
            version: meta.version.clone(),
            repo: RepoDescriptor::key_for(&meta.architecture, branch, component),
            architecture: meta.architecture.clone(),
            filename: filename.to_string(),
            size,
            sha256: meta.sha256.clone(),
            mtime,
            debtime: meta.build_time,
            section: meta.control.get("Section").map(str::to_string),
            installed_size: meta.installed_size,
            maintainer: meta.control.get("Maintainer").map(str::to_string),
            description: meta.control.get("Description").map(str::to_string),
            control: meta.control.to_json(),
            vercomp: version.sortable_key(),
        })
    }

    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.package, &self.version, &self.repo)
    }

    /// Insert this record into the given table
    pub fn insert(&self, conn: &Connection, kind: RecordKind) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                kind.table(),
                PACKAGE_COLUMNS
            ),
            params![
                &self.package,
                &self.version,
                &self.repo,
                &self.architecture,
                &self.filename,
                &self.size,
                &self.sha256,
                &self.mtime,
                &self.debtime,
                &self.section,
                &self.installed_size,
                &self.maintainer,
                &self.description,
                &self.control,
                &self.vercomp,
            ],
        )?;
        Ok(())
    }

    /// Find a record by its file
    pub fn find_by_filename(
        conn: &Connection,
        kind: RecordKind,
        filename: &str,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE filename = ?1",
            PACKAGE_COLUMNS,
            kind.table()
        ))?;

        let record = stmt.query_row([filename], Self::from_row).optional()?;

        Ok(record)
    }

    /// All records whose file lies under `prefix` (e.g. `pool/stable/main/`)
    pub fn find_under_prefix(
        conn: &Connection,
        kind: RecordKind,
        prefix: &str,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE substr(filename, 1, ?2) = ?1 ORDER BY filename",
            PACKAGE_COLUMNS,
            kind.table()
        ))?;

        let records = stmt
            .query_map(params![prefix, prefix.chars().count() as i64], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// All versions of a package in a repo, newest first
    ///
    /// Equal versions come back in filename order.
    pub fn find_versions(
        conn: &Connection,
        kind: RecordKind,
        package: &str,
        repo: &str,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE package = ?1 AND repo = ?2 ORDER BY _vercomp DESC, filename",
            PACKAGE_COLUMNS,
            kind.table()
        ))?;

        let records = stmt
            .query_map([package, repo], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Find records by package name, ordered by repo then newest first
    pub fn find_by_name(conn: &Connection, kind: RecordKind, package: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE package = ?1 ORDER BY repo, _vercomp DESC",
            PACKAGE_COLUMNS,
            kind.table()
        ))?;

        let records = stmt
            .query_map([package], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// All records of a repo
    pub fn find_by_repo(conn: &Connection, kind: RecordKind, repo: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE repo = ?1 ORDER BY filename",
            PACKAGE_COLUMNS,
            kind.table()
        ))?;

        let records = stmt
            .query_map([repo], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Delete a record by its file
    pub fn delete(conn: &Connection, kind: RecordKind, filename: &str) -> Result<()> {
        conn.execute(
            &format!("DELETE FROM {} WHERE filename = ?1", kind.table()),
            [filename],
        )?;
        Ok(())
    }

    /// Whether any current or duplicate record still carries this key
    pub fn key_in_use(conn: &Connection, key: &PackageKey) -> Result<bool> {
        let in_use = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM packages WHERE package = ?1 AND version = ?2 AND repo = ?3)
                 OR EXISTS (SELECT 1 FROM package_duplicate WHERE package = ?1 AND version = ?2 AND repo = ?3)",
            params![&key.package, &key.version, &key.repo],
            |row| row.get(0),
        )?;
        Ok(in_use)
    }

    /// Convert a database row to a PackageRecord
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            package: row.get(0)?,
            version: row.get(1)?,
            repo: row.get(2)?,
            architecture: row.get(3)?,
            filename: row.get(4)?,
            size: row.get(5)?,
            sha256: row.get(6)?,
            mtime: row.get(7)?,
            debtime: row.get(8)?,
            section: row.get(9)?,
            installed_size: row.get(10)?,
            maintainer: row.get(11)?,
            description: row.get(12)?,
            control: row.get(13)?,
            vercomp: row.get(14)?,
        })
    }
}

/// Kind of relationship clause in a control stanza
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Relationship {
    Depends,
    PreDepends,
    Recommends,
    Suggests,
    Enhances,
    Breaks,
    Conflicts,
}

impl Relationship {
    pub const ALL: [Relationship; 7] = [
        Relationship::Depends,
        Relationship::PreDepends,
        Relationship::Recommends,
        Relationship::Suggests,
        Relationship::Enhances,
        Relationship::Breaks,
        Relationship::Conflicts,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Relationship::Depends => "depends",
            Relationship::PreDepends => "pre_depends",
            Relationship::Recommends => "recommends",
            Relationship::Suggests => "suggests",
            Relationship::Enhances => "enhances",
            Relationship::Breaks => "breaks",
            Relationship::Conflicts => "conflicts",
        }
    }

    /// Control stanza field carrying this relationship
    pub fn control_field(&self) -> &str {
        match self {
            Relationship::Depends => "Depends",
            Relationship::PreDepends => "Pre-Depends",
            Relationship::Recommends => "Recommends",
            Relationship::Suggests => "Suggests",
            Relationship::Enhances => "Enhances",
            Relationship::Breaks => "Breaks",
            Relationship::Conflicts => "Conflicts",
        }
    }
}

impl FromStr for Relationship {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Relationship::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("Invalid relationship: {}", s))
    }
}

/// Raw relationship clause text of one kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyClause {
    pub relationship: Relationship,
    pub value: String,
}

/// Direction of a shared-object link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SoDirection {
    Provides,
    Depends,
}

impl SoDirection {
    fn as_i64(&self) -> i64 {
        match self {
            SoDirection::Provides => 0,
            SoDirection::Depends => 1,
        }
    }

    fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(SoDirection::Provides),
            1 => Some(SoDirection::Depends),
            _ => None,
        }
    }
}

/// A shared-object provide or depend
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SoLink {
    pub direction: SoDirection,
    /// Library name up to and including `.so`
    pub soname: String,
    /// Everything after the last `.so`, possibly empty (e.g. `.6`)
    pub soversion: String,
}

impl SoLink {
    /// Split a shared-object string at its last `.so`
    pub fn parse(direction: SoDirection, s: &str) -> Self {
        let (soname, soversion) = match s.rfind(".so") {
            Some(idx) => (&s[..idx + 3], &s[idx + 3..]),
            None => (s, ""),
        };
        Self {
            direction,
            soname: soname.to_string(),
            soversion: soversion.to_string(),
        }
    }

    /// Links of every current package, joined with their owner
    ///
    /// Duplicate records are excluded: only what is published counts.
    pub fn find_current(conn: &Connection) -> Result<Vec<(PackageKey, SoLink)>> {
        let mut stmt = conn.prepare(
            "SELECT s.package, s.version, s.repo, s.depends, s.name, s.ver
             FROM package_sodep s
             INNER JOIN packages p
                 ON p.package = s.package AND p.version = s.version AND p.repo = s.repo
             ORDER BY s.repo, s.package, s.version",
        )?;

        let links = stmt
            .query_map([], |row| {
                let direction: i64 = row.get(3)?;
                let direction = SoDirection::from_i64(direction).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Integer,
                        format!("Invalid sodep direction: {}", direction).into(),
                    )
                })?;
                Ok((
                    PackageKey {
                        package: row.get(0)?,
                        version: row.get(1)?,
                        repo: row.get(2)?,
                    },
                    SoLink {
                        direction,
                        soname: row.get(4)?,
                        soversion: row.get(5)?,
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(links)
    }
}

/// A file shipped in a package archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    /// Directory without leading slash
    pub path: String,
    pub name: String,
    pub size: i64,
    pub ftype: String,
    pub perm: i64,
    pub uid: i64,
    pub gid: i64,
    pub uname: String,
    pub gname: String,
}

/// Rows owned by one package record, always replaced together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnedRows {
    pub dependencies: Vec<DependencyClause>,
    pub sodeps: Vec<SoLink>,
    pub files: Vec<ContentEntry>,
}

impl OwnedRows {
    /// Build the owned rows for extractor output
    pub fn from_metadata(meta: &PackageMetadata) -> Self {
        let dependencies = Relationship::ALL
            .into_iter()
            .filter_map(|relationship| {
                meta.control
                    .get(relationship.control_field())
                    .map(|value| DependencyClause {
                        relationship,
                        value: value.to_string(),
                    })
            })
            .collect();

        let sodeps = meta
            .so_provides
            .iter()
            .map(|s| SoLink::parse(SoDirection::Provides, s))
            .chain(
                meta.so_depends
                    .iter()
                    .map(|s| SoLink::parse(SoDirection::Depends, s)),
            )
            .collect();

        let files = meta
            .files
            .iter()
            .map(|file| {
                let (path, name) = split_entry_path(&file.path);
                ContentEntry {
                    path,
                    name,
                    size: file.size,
                    ftype: file.ftype.as_str().to_string(),
                    perm: i64::from(file.mode & 0o7777),
                    uid: file.uid,
                    gid: file.gid,
                    uname: file.uname.clone(),
                    gname: file.gname.clone(),
                }
            })
            .collect();

        Self {
            dependencies,
            sodeps,
            files,
        }
    }

    /// Replace every owned row of `key` with these rows
    pub fn replace(&self, conn: &Connection, key: &PackageKey) -> Result<()> {
        Self::delete(conn, key)?;
        self.insert(conn, key)
    }

    fn insert(&self, conn: &Connection, key: &PackageKey) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO package_dependencies (package, version, repo, relationship, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for dep in &self.dependencies {
            stmt.execute(params![
                &key.package,
                &key.version,
                &key.repo,
                dep.relationship.as_str(),
                &dep.value,
            ])?;
        }

        let mut stmt = conn.prepare(
            "INSERT INTO package_sodep (package, version, repo, depends, name, ver)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for link in &self.sodeps {
            stmt.execute(params![
                &key.package,
                &key.version,
                &key.repo,
                link.direction.as_i64(),
                &link.soname,
                &link.soversion,
            ])?;
        }

        let mut stmt = conn.prepare(
            "INSERT INTO package_files (package, version, repo, path, name, size, ftype,
                 perm, uid, gid, uname, gname)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        for file in &self.files {
            stmt.execute(params![
                &key.package,
                &key.version,
                &key.repo,
                &file.path,
                &file.name,
                &file.size,
                &file.ftype,
                &file.perm,
                &file.uid,
                &file.gid,
                &file.uname,
                &file.gname,
            ])?;
        }

        Ok(())
    }

    /// Delete every owned row of `key`
    pub fn delete(conn: &Connection, key: &PackageKey) -> Result<()> {
        for table in ["package_dependencies", "package_sodep", "package_files"] {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE package = ?1 AND version = ?2 AND repo = ?3",
                    table
                ),
                params![&key.package, &key.version, &key.repo],
            )?;
        }
        Ok(())
    }

    /// Load the owned rows of `key`
    pub fn load(conn: &Connection, key: &PackageKey) -> Result<Self> {
        let key_params = params![&key.package, &key.version, &key.repo];

        let mut stmt = conn.prepare(
            "SELECT relationship, value FROM package_dependencies
             WHERE package = ?1 AND version = ?2 AND repo = ?3 ORDER BY relationship",
        )?;
        let dependencies = stmt
            .query_map(key_params, |row| {
                let relationship: String = row.get(0)?;
                let relationship = relationship.parse::<Relationship>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                    )
                })?;
                Ok(DependencyClause {
                    relationship,
                    value: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT depends, name, ver FROM package_sodep
             WHERE package = ?1 AND version = ?2 AND repo = ?3 ORDER BY depends, name, ver",
        )?;
        let sodeps = stmt
            .query_map(key_params, |row| {
                let direction: i64 = row.get(0)?;
                Ok(SoLink {
                    direction: SoDirection::from_i64(direction).unwrap_or(SoDirection::Depends),
                    soname: row.get(1)?,
                    soversion: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT path, name, size, ftype, perm, uid, gid, uname, gname FROM package_files
             WHERE package = ?1 AND version = ?2 AND repo = ?3 ORDER BY path, name",
        )?;
        let files = stmt
            .query_map(key_params, |row| {
                Ok(ContentEntry {
                    path: row.get(0)?,
                    name: row.get(1)?,
                    size: row.get(2)?,
                    ftype: row.get(3)?,
                    perm: row.get(4)?,
                    uid: row.get(5)?,
                    gid: row.get(6)?,
                    uname: row.get(7)?,
                    gname: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            dependencies,
            sodeps,
            files,
        })
    }
}

/// Normalize an archive member path and split it into (dir, name)
///
/// `./usr/lib/libfoo.so.1` becomes `("usr/lib", "libfoo.so.1")`.
fn split_entry_path(raw: &str) -> (String, String) {
    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    let name = parts.pop().unwrap_or_default();
    (parts.join("/"), name.to_string())
}

impl FileType {
    /// Name stored in the catalog
    pub fn as_str(&self) -> &str {
        match self {
            FileType::Regular => "reg",
            FileType::Symlink => "lnk",
            FileType::HardLink => "hardlink",
            FileType::Socket => "sock",
            FileType::CharDevice => "chr",
            FileType::BlockDevice => "blk",
            FileType::Directory => "dir",
            FileType::Fifo => "fifo",
            FileType::Other => "other",
        }
    }
}
