// src/db/schema.rs

//! Database schema definitions and migrations for the package catalog
//!
//! This module defines the SQLite schema for all catalog tables and provides
//! a migration system to evolve the schema over time.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("Schema is up to date");
        return Ok(());
    }

    // Apply migrations in order
    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => panic!("Unknown migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// Creates the catalog tables:
/// - repos: one row per architecture slice of a branch/component
/// - packages: current package records
/// - package_duplicate: records that lost a same-key collision
/// - package_dependencies: relationship clauses from the control stanza
/// - package_sodep: shared-object provides/depends
/// - package_files: archive contents
///
/// Owned rows are keyed by (package, version, repo) without a foreign key:
/// a superseded record moves to package_duplicate and keeps its rows.
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        -- Repos: architecture slices of a branch/component
        CREATE TABLE repos (
            name TEXT PRIMARY KEY,          -- bsp-sunxi-armel/testing
            realname TEXT NOT NULL,         -- bsp-sunxi-armel
            path TEXT NOT NULL,             -- testing/bsp-sunxi
            testing INTEGER NOT NULL,       -- 0, 1, 2
            branch TEXT NOT NULL,
            component TEXT NOT NULL,
            architecture TEXT NOT NULL
        );

        CREATE INDEX idx_repos_path ON repos(path, architecture);
        CREATE INDEX idx_repos_architecture ON repos(architecture, testing);

        -- Packages: the current record for each (package, repo)
        CREATE TABLE packages (
            package TEXT NOT NULL,
            version TEXT NOT NULL,
            repo TEXT NOT NULL,
            architecture TEXT NOT NULL,
            filename TEXT NOT NULL UNIQUE,
            size INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            debtime INTEGER NOT NULL,
            section TEXT,
            installed_size INTEGER NOT NULL,
            maintainer TEXT,
            description TEXT,
            control TEXT NOT NULL,
            _vercomp TEXT NOT NULL,
            PRIMARY KEY (package, version, repo)
        );

        CREATE INDEX idx_packages_repo ON packages(repo);

        -- Duplicates: losers of a same-key collision, keyed by file
        CREATE TABLE package_duplicate (
            filename TEXT PRIMARY KEY,
            package TEXT NOT NULL,
            version TEXT NOT NULL,
            repo TEXT NOT NULL,
            architecture TEXT NOT NULL,
            size INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            debtime INTEGER NOT NULL,
            section TEXT,
            installed_size INTEGER NOT NULL,
            maintainer TEXT,
            description TEXT,
            control TEXT NOT NULL,
            _vercomp TEXT NOT NULL
        );

        CREATE INDEX idx_package_duplicate_package
            ON package_duplicate(package, version, repo);

        -- Relationship clauses, one row per kind
        CREATE TABLE package_dependencies (
            package TEXT NOT NULL,
            version TEXT NOT NULL,
            repo TEXT NOT NULL,
            relationship TEXT NOT NULL CHECK(relationship IN (
                'depends', 'pre_depends', 'recommends', 'suggests',
                'enhances', 'breaks', 'conflicts')),
            value TEXT NOT NULL,
            PRIMARY KEY (package, version, repo, relationship)
        );

        -- Shared-object links: depends = 0 provides, 1 depends
        CREATE TABLE package_sodep (
            package TEXT NOT NULL,
            version TEXT NOT NULL,
            repo TEXT NOT NULL,
            depends INTEGER NOT NULL CHECK(depends IN (0, 1)),
            name TEXT NOT NULL,
            ver TEXT NOT NULL
        );

        -- Archive contents
        CREATE TABLE package_files (
            package TEXT NOT NULL,
            version TEXT NOT NULL,
            repo TEXT NOT NULL,
            path TEXT NOT NULL,
            name TEXT NOT NULL,
            size INTEGER NOT NULL,
            ftype TEXT NOT NULL,
            perm INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            gid INTEGER NOT NULL,
            uname TEXT NOT NULL,
            gname TEXT NOT NULL
        );
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: Query indices
///
/// Adds the indices used by version lookups and the consistency checker.
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE INDEX idx_packages_vercomp ON packages(repo, package, _vercomp);
        CREATE INDEX idx_package_sodep_package ON package_sodep(package, version, repo);
        CREATE INDEX idx_package_sodep_name ON package_sodep(name, repo) WHERE depends = 0;
        CREATE INDEX idx_package_files_package ON package_files(package, version, repo);
        CREATE INDEX idx_package_files_path_name ON package_files(path, name);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}
