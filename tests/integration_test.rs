// tests/integration_test.rs

//! Integration tests for pvector
//!
//! These tests build real .deb archives in a temporary pool and verify
//! end-to-end functionality across modules.

use flate2::Compression;
use flate2::write::GzEncoder;
use pvector::db::{self, models::*};
use pvector::notify::{ChangeMethod, CollectingNotifier, JsonLinesNotifier};
use pvector::packages::DebExtractor;
use pvector::repository::{self, ScanContext, ScanOptions, Scope};
use pvector::resolver::{self, CheckScope};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

/// Minimal little-endian ELF64 object with a dynamic section
fn elf64(soname: Option<&str>, needed: &[&str]) -> Vec<u8> {
    let mut strtab = vec![0u8];
    let mut dynamic: Vec<(u64, u64)> = Vec::new();
    if let Some(soname) = soname {
        dynamic.push((14, strtab.len() as u64));
        strtab.extend_from_slice(soname.as_bytes());
        strtab.push(0);
    }
    for lib in needed {
        dynamic.push((1, strtab.len() as u64));
        strtab.extend_from_slice(lib.as_bytes());
        strtab.push(0);
    }
    dynamic.push((0, 0));

    let strtab_off = 64;
    let dynamic_off = (strtab_off + strtab.len()).next_multiple_of(8);
    let shoff = dynamic_off + dynamic.len() * 16;
    let mut buf = vec![0u8; shoff + 3 * 64];

    buf[..4].copy_from_slice(b"\x7fELF");
    buf[4] = 2; // ELFCLASS64
    buf[5] = 1; // little endian
    buf[6] = 1;
    buf[0x28..0x30].copy_from_slice(&(shoff as u64).to_le_bytes());
    buf[0x3A..0x3C].copy_from_slice(&64u16.to_le_bytes());
    buf[0x3C..0x3E].copy_from_slice(&3u16.to_le_bytes());

    buf[strtab_off..strtab_off + strtab.len()].copy_from_slice(&strtab);
    for (i, (tag, value)) in dynamic.iter().enumerate() {
        let at = dynamic_off + i * 16;
        buf[at..at + 8].copy_from_slice(&tag.to_le_bytes());
        buf[at + 8..at + 16].copy_from_slice(&value.to_le_bytes());
    }

    let sh1 = shoff + 64;
    buf[sh1 + 4..sh1 + 8].copy_from_slice(&3u32.to_le_bytes());
    buf[sh1 + 0x18..sh1 + 0x20].copy_from_slice(&(strtab_off as u64).to_le_bytes());
    buf[sh1 + 0x20..sh1 + 0x28].copy_from_slice(&(strtab.len() as u64).to_le_bytes());
    let sh2 = shoff + 128;
    buf[sh2 + 4..sh2 + 8].copy_from_slice(&6u32.to_le_bytes());
    buf[sh2 + 0x18..sh2 + 0x20].copy_from_slice(&(dynamic_off as u64).to_le_bytes());
    buf[sh2 + 0x20..sh2 + 0x28].copy_from_slice(&((dynamic.len() * 16) as u64).to_le_bytes());
    buf[sh2 + 0x28..sh2 + 0x2C].copy_from_slice(&1u32.to_le_bytes());
    buf
}

fn tar_gz(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        header.set_mtime(1_700_000_000);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, path, &content[..]).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// A package to place in the pool
struct Deb<'a> {
    name: &'a str,
    version: &'a str,
    arch: &'a str,
    depends: Option<&'a str>,
    files: Vec<(&'a str, Vec<u8>)>,
}

impl<'a> Deb<'a> {
    fn new(name: &'a str, version: &'a str) -> Self {
        Self {
            name,
            version,
            arch: "amd64",
            depends: None,
            files: vec![("./usr/share/doc/README", b"readme".to_vec())],
        }
    }

    fn build(&self) -> Vec<u8> {
        let mut control = format!(
            "Package: {}\nVersion: {}\nArchitecture: {}\nInstalled-Size: 4\nSection: libs\n",
            self.name, self.version, self.arch
        );
        if let Some(depends) = self.depends {
            control.push_str(&format!("Depends: {}\n", depends));
        }

        let mut builder = ar::Builder::new(Vec::new());
        for (member, content) in [
            ("debian-binary", b"2.0\n".to_vec()),
            ("control.tar.gz", tar_gz(&[("./control", control.into_bytes())])),
            ("data.tar.gz", tar_gz(&self.files)),
        ] {
            let header = ar::Header::new(member.as_bytes().to_vec(), content.len() as u64);
            builder.append(&header, &content[..]).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn write(&self, root: &Path, branch: &str, component: &str) -> PathBuf {
        let dir = root
            .join("pool")
            .join(branch)
            .join(component)
            .join(&self.name[..1]);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}_{}_{}.deb", self.name, self.version, self.arch));
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

struct Repo {
    root: TempDir,
    _db_dir: TempDir,
    conn: Connection,
    notifier: Arc<CollectingNotifier>,
    ctx: ScanContext,
}

impl Repo {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("pool")).unwrap();
        let db_dir = TempDir::new().unwrap();
        let db_path = db_dir.path().join("pvector.db");
        db::init(db_path.to_str().unwrap()).unwrap();
        let conn = db::open(db_path.to_str().unwrap()).unwrap();
        let notifier = Arc::new(CollectingNotifier::new());
        let ctx = ScanContext::new(
            Arc::new(DebExtractor::new()),
            notifier.clone(),
            ScanOptions::default(),
        )
        .unwrap();
        Self {
            root,
            _db_dir: db_dir,
            conn,
            notifier,
            ctx,
        }
    }

    fn scan(&mut self) -> Vec<repository::ScanSummary> {
        repository::scan_all(&mut self.conn, self.root.path(), &self.ctx).unwrap()
    }

    /// Every row of every catalog table, in a stable order
    fn dump(&self) -> Vec<String> {
        let mut rows = Vec::new();
        for table in [
            "repos",
            "packages",
            "package_duplicate",
            "package_dependencies",
            "package_sodep",
            "package_files",
        ] {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT * FROM {} ORDER BY 1, 2, 3, 4, 5", table))
                .unwrap();
            let columns = stmt.column_count();
            let mut query = stmt.query([]).unwrap();
            while let Some(row) = query.next().unwrap() {
                let values: Vec<String> = (0..columns)
                    .map(|i| format!("{:?}", row.get::<_, rusqlite::types::Value>(i).unwrap()))
                    .collect();
                rows.push(format!("{}: {}", table, values.join("|")));
            }
        }
        rows
    }
}

#[test]
fn test_database_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();

    // Remove the temp file so init can create it
    drop(temp_file);

    assert!(db::init(&db_path).is_ok(), "Database initialization should succeed");
    assert!(Path::new(&db_path).exists());

    let conn = db::open(&db_path).unwrap();
    let result: Result<i32, _> = conn.query_row("SELECT 1", [], |row| row.get(0));
    assert_eq!(result.unwrap(), 1, "Should be able to execute queries");
}

#[test]
fn test_database_init_creates_parent_directories() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir
        .path()
        .join("nested/path/to/pvector.db")
        .to_str()
        .unwrap()
        .to_string();

    assert!(db::init(&db_path).is_ok(), "Should create parent directories");
    assert!(Path::new(&db_path).exists());
}

#[test]
fn test_upgrade_then_purge_duplicate() {
    let mut repo = Repo::new();
    let root = repo.root.path().to_path_buf();

    let old = Deb::new("foo", "1.0").write(&root, "stable", "main");
    let summaries = repo.scan();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].new, 1);
    let events = repo.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].method, ChangeMethod::New);
    assert_eq!(events[0].package, "foo");

    Deb::new("foo", "1.1").write(&root, "stable", "main");
    repo.scan();
    let events = repo.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].method, ChangeMethod::Upgrade);
    assert_eq!((events[0].from_version.as_str(), events[0].to_version.as_str()), ("1.0", "1.1"));

    let result = repository::query(&repo.conn, "foo").unwrap();
    assert_eq!(result.current.len(), 1);
    assert_eq!(result.current[0].version, "1.1");
    assert_eq!(result.duplicates.len(), 1);
    assert_eq!(result.duplicates[0].version, "1.0");
    assert_eq!(result.duplicates[0].filename, "pool/stable/main/f/foo_1.0_amd64.deb");

    std::fs::remove_file(old).unwrap();
    let summaries = repo.scan();
    assert_eq!(summaries[0].purged_duplicates, 1);
    assert!(repo.notifier.take().is_empty());

    let result = repository::query(&repo.conn, "foo").unwrap();
    assert_eq!(result.current.len(), 1);
    assert!(result.duplicates.is_empty());
}

#[test]
fn test_removing_newest_file_restores_previous_version() {
    let mut repo = Repo::new();
    let root = repo.root.path().to_path_buf();

    let mut old = Deb::new("libx1", "1.0-1");
    old.files = vec![("./usr/lib/libx.so.1.0", elf64(Some("libx.so.1"), &[]))];
    old.write(&root, "stable", "main");
    let mut app = Deb::new("app", "1.0");
    app.files = vec![("./usr/bin/app", elf64(None, &["libx.so.1"]))];
    app.write(&root, "stable", "main");
    repo.scan();

    let mut new = Deb::new("libx1", "1.0-2");
    new.files = old.files.clone();
    let newest = new.write(&root, "stable", "main");
    repo.scan();
    repo.notifier.take();

    std::fs::remove_file(newest).unwrap();
    let summaries = repo.scan();
    assert_eq!(summaries[0].restored, 1);
    assert_eq!(summaries[0].deleted, 0);
    let events = repo.notifier.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].method, ChangeMethod::Upgrade);
    assert_eq!((events[0].from_version.as_str(), events[0].to_version.as_str()), ("1.0-2", "1.0-1"));

    let result = repository::query(&repo.conn, "libx1").unwrap();
    assert_eq!(result.current.len(), 1);
    assert_eq!(result.current[0].version, "1.0-1");
    assert!(result.duplicates.is_empty());

    // The restored provider still satisfies its dependents
    let report = resolver::check(&repo.conn, &CheckScope::all()).unwrap();
    assert!(report.is_empty(), "{}", report);
}

#[test]
fn test_rescan_is_idempotent() {
    let mut repo = Repo::new();
    let root = repo.root.path().to_path_buf();

    Deb::new("foo", "1.0").write(&root, "stable", "main");
    Deb::new("foo", "1.1").write(&root, "stable", "main");
    Deb::new("bar", "2.0").write(&root, "testing", "main");
    let mut doc = Deb::new("bar-doc", "2.0");
    doc.arch = "all";
    doc.write(&root, "testing", "main");

    repo.scan();
    repo.notifier.take();
    let before = repo.dump();

    let summaries = repo.scan();
    assert!(repo.notifier.take().is_empty());
    assert_eq!(repo.dump(), before);
    let unchanged: usize = summaries.iter().map(|s| s.unchanged).sum();
    assert_eq!(unchanged, 4);
}

#[test]
fn test_owned_rows_are_recorded() {
    let mut repo = Repo::new();
    let root = repo.root.path().to_path_buf();

    let mut lib = Deb::new("libx1", "1.0-1");
    lib.depends = Some("libc6 (>= 2.34)");
    lib.files = vec![
        ("./usr/lib/libx.so.1.0", elf64(Some("libx.so.1"), &["libc.so.6"])),
        ("./usr/share/doc/libx1/copyright", b"MIT".to_vec()),
    ];
    lib.write(&root, "stable", "main");
    repo.scan();

    let key = PackageKey::new("libx1", "1.0-1", "amd64/stable");
    let rows = OwnedRows::load(&repo.conn, &key).unwrap();

    assert_eq!(rows.dependencies.len(), 1);
    assert_eq!(rows.dependencies[0].relationship, Relationship::Depends);
    assert_eq!(rows.dependencies[0].value, "libc6 (>= 2.34)");

    assert_eq!(
        rows.sodeps,
        vec![
            SoLink::parse(SoDirection::Provides, "libx.so.1"),
            SoLink::parse(SoDirection::Depends, "libc.so.6"),
        ]
    );

    let files: Vec<(String, String)> = rows.files.iter().map(|f| (f.path.clone(), f.name.clone())).collect();
    assert_eq!(
        files,
        vec![
            ("usr/lib".to_string(), "libx.so.1.0".to_string()),
            ("usr/share/doc/libx1".to_string(), "copyright".to_string()),
        ]
    );
    assert_eq!(rows.files[0].ftype, "reg");
    assert_eq!(rows.files[0].perm, 0o644);

    let record = PackageRecord::find_by_filename(
        &repo.conn,
        RecordKind::Current,
        "pool/stable/main/l/libx1_1.0-1_amd64.deb",
    )
    .unwrap()
    .unwrap();
    assert_eq!(record.debtime, 1_700_000_000);
    assert_eq!(record.installed_size, 4);
    assert_eq!(record.section.as_deref(), Some("libs"));
    let control: serde_json::Value = serde_json::from_str(&record.control).unwrap();
    assert_eq!(control["Package"], "libx1");
}

#[test]
fn test_corrupted_archive_is_retried() {
    let mut repo = Repo::new();
    let root = repo.root.path().to_path_buf();

    let dir = root.join("pool/stable/main/f");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("foo_1.0_amd64.deb");
    std::fs::write(&path, b"!<arch>\ntruncated").unwrap();

    let summaries = repo.scan();
    assert_eq!(summaries[0].skipped_corrupt, 1);
    assert!(repository::query(&repo.conn, "foo").unwrap().current.is_empty());

    // A fixed file is picked up by the next pass
    std::fs::write(&path, Deb::new("foo", "1.0").build()).unwrap();
    let summaries = repo.scan();
    assert_eq!(summaries[0].skipped_corrupt, 0);
    assert_eq!(summaries[0].new, 1);
}

#[test]
fn test_check_after_scan() {
    let mut repo = Repo::new();
    let root = repo.root.path().to_path_buf();

    let mut lib = Deb::new("libx2", "2.0");
    lib.files = vec![("./usr/lib/libx.so.2.0", elf64(Some("libx.so.2.0"), &[]))];
    lib.write(&root, "stable", "main");

    let mut app = Deb::new("app", "1.0");
    app.files = vec![("./usr/bin/app", elf64(None, &["libx.so.2", "libz.so.1"]))];
    app.write(&root, "stable", "main");

    let mut old_app = Deb::new("oldapp", "1.0");
    old_app.files = vec![("./usr/bin/oldapp", elf64(None, &["libx.so.1"]))];
    old_app.write(&root, "stable", "main");

    repo.scan();
    let report = resolver::check(&repo.conn, &CheckScope::all()).unwrap();

    // libx.so.2 is satisfied by libx.so.2.0
    assert_eq!(report.missing_soname.len(), 1);
    assert_eq!(report.missing_soname[0].package.package, "app");
    assert_eq!(report.missing_soname[0].missing, vec!["libz.so.1"]);

    assert_eq!(report.not_sure.len(), 1);
    let entry = &report.not_sure[0];
    assert_eq!(entry.package.package, "oldapp");
    assert_eq!(entry.missing, vec!["libx.so.1"]);
    assert_eq!(entry.hints.len(), 1);
    assert_eq!(entry.hints[0].provider.package, "libx2");
    assert_eq!(entry.hints[0].provides, vec!["libx.so.2.0"]);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["not_sure"][0]["package"]["package"], "oldapp");
}

#[test]
fn test_gc_removes_vanished_branch() {
    let mut repo = Repo::new();
    let root = repo.root.path().to_path_buf();

    Deb::new("foo", "1.0").write(&root, "stable", "main");
    Deb::new("foo", "1.1").write(&root, "testing", "main");
    repo.scan();

    std::fs::remove_dir_all(root.join("pool/testing")).unwrap();

    let summary = repository::gc(&mut repo.conn, &root, true).unwrap();
    assert_eq!(summary.paths, vec!["testing/main"]);
    assert_eq!(summary.repos, vec!["amd64/testing"]);
    assert_eq!(summary.packages, 1);
    assert!(RepoDescriptor::find_by_name(&repo.conn, "amd64/testing").unwrap().is_some());

    repository::gc(&mut repo.conn, &root, false).unwrap();
    assert!(RepoDescriptor::find_by_name(&repo.conn, "amd64/testing").unwrap().is_none());
    let result = repository::query(&repo.conn, "foo").unwrap();
    assert_eq!(result.current.len(), 1);
    assert_eq!(result.current[0].repo, "amd64/stable");
}

#[test]
fn test_events_written_as_json_lines() {
    let root = TempDir::new().unwrap();
    let db_dir = TempDir::new().unwrap();
    let db_path = db_dir.path().join("pvector.db");
    db::init(db_path.to_str().unwrap()).unwrap();
    let mut conn = db::open(db_path.to_str().unwrap()).unwrap();

    Deb::new("foo", "1.0").write(root.path(), "stable", "main");

    let notifier = Arc::new(JsonLinesNotifier::new(Vec::new()));
    let ctx = ScanContext::new(Arc::new(DebExtractor::new()), notifier.clone(), ScanOptions::default())
        .unwrap();
    repository::reconcile(&mut conn, root.path(), &Scope::new("stable", "main"), &ctx).unwrap();
    drop(ctx);

    let notifier = Arc::try_unwrap(notifier).ok().unwrap();
    let output = String::from_utf8(notifier.into_inner()).unwrap();
    let event: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
    assert_eq!(event["method"], "new");
    assert_eq!(event["branch"], "stable");
    assert_eq!(event["component"], "main");
    assert_eq!(event["to_version"], "1.0");
}
