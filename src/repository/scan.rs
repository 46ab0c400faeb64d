// src/repository/scan.rs

//! Catalog reconciler
//!
//! A reconcile pass walks one `pool/{branch}/{component}` directory, diffs it
//! against the catalog and applies the resulting transitions:
//!
//! - vanished files drop their records (`CLEAN`); when a current record goes,
//!   the newest surviving duplicate of its package takes its place (`RESTORE`)
//! - rewritten files are re-read and replace their record in place (`UPDATE`)
//! - new files become current (`NEW`), supersede an older current record
//!   (`NEWER`), or are kept as duplicates when they lose (`OLD`, `DUP`)
//!
//! Extraction runs on a bounded worker pool; every catalog write happens in
//! one transaction afterwards, in path order. Change events are published only
//! once that transaction has committed.

use crate::db::models::{OwnedRows, PackageRecord, RecordKind, RepoDescriptor};
use crate::error::{Error, Result};
use crate::notify::{CancelToken, ChangeEvent, ChangeMethod, ChangeNotifier};
use crate::packages::{Extractor, PackageMetadata};
use crate::repository::{BranchRanks, Scope, list_scopes};
use rayon::prelude::*;
use rusqlite::Connection;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Default number of extraction workers
pub fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()) + 1
}

/// Tunables of a reconcile pass
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Extraction workers
    pub jobs: usize,
    pub ranks: BranchRanks,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            ranks: BranchRanks::default(),
        }
    }
}

/// Everything a reconcile pass needs besides the catalog
pub struct ScanContext {
    extractor: Arc<dyn Extractor>,
    notifier: Arc<dyn ChangeNotifier>,
    cancel: CancelToken,
    ranks: BranchRanks,
    pool: rayon::ThreadPool,
}

impl ScanContext {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        notifier: Arc<dyn ChangeNotifier>,
        options: ScanOptions,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.jobs.max(1))
            .thread_name(|i| format!("pvector-extract-{}", i))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create worker pool: {}", e)))?;

        Ok(Self {
            extractor,
            notifier,
            cancel: CancelToken::new(),
            ranks: options.ranks,
            pool,
        })
    }

    /// Share an existing cancellation token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

/// Counts of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub branch: String,
    pub component: String,
    pub new: usize,
    pub upgraded: usize,
    pub overwritten: usize,
    /// Same version as the current record
    pub duplicate: usize,
    /// Older than the current record
    pub old: usize,
    pub deleted: usize,
    /// Duplicate records whose file vanished
    pub purged_duplicates: usize,
    /// Duplicate records made current again after their current record vanished
    pub restored: usize,
    pub skipped_corrupt: usize,
    pub skipped_malformed: usize,
    pub unchanged: usize,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}: {} new, {} upgraded, {} overwritten, {} duplicate, {} old, {} deleted, \
             {} purged, {} restored, {} corrupt, {} malformed, {} unchanged",
            self.branch,
            self.component,
            self.new,
            self.upgraded,
            self.overwritten,
            self.duplicate,
            self.old,
            self.deleted,
            self.purged_duplicates,
            self.restored,
            self.skipped_corrupt,
            self.skipped_malformed,
            self.unchanged
        )
    }
}

/// Result of extracting one candidate file
#[derive(Debug)]
pub enum ExtractOutcome {
    Extracted(Box<PackageMetadata>),
    /// The file is unreadable; skipped this pass and retried on the next
    Corrupted(String),
    /// The pass cannot continue
    Fatal(Error),
    /// Not attempted because the pass was cancelled or aborted
    Cancelled,
}

/// What the catalog knew about a candidate file
#[derive(Debug)]
enum Origin {
    New,
    RescanCurrent(PackageRecord),
    RescanDuplicate(PackageRecord),
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    filename: String,
    size: i64,
    mtime: i64,
    origin: Origin,
}

/// Size and whole-second mtime of a regular file, `None` if it is gone
fn file_stat(path: &Path) -> Result<Option<(i64, i64)>> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Ok(None);
    }
    let mtime = match metadata.modified()?.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    Ok(Some((metadata.len() as i64, mtime)))
}

/// Reconcile the catalog with every scope under `root`
///
/// Scopes are reconciled one after another, each in its own transaction. A
/// failed scope does not stop the others; the first failure is returned once
/// every scope has run. Cancellation stops the scan at once.
pub fn scan_all(conn: &mut Connection, root: &Path, ctx: &ScanContext) -> Result<Vec<ScanSummary>> {
    let mut summaries = Vec::new();
    let mut failure = None;
    for scope in list_scopes(root)? {
        info!("==== {} ====", scope);
        match reconcile(conn, root, &scope, ctx) {
            Ok(summary) => summaries.push(summary),
            Err(e @ Error::Cancelled(_)) => return Err(e),
            Err(e) => {
                error!("{}: pass failed: {}", scope, e);
                failure.get_or_insert(e);
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}

/// Reconcile the catalog with one `pool/{branch}/{component}` directory
///
/// Per-file failures (corrupted archives, malformed versions) are logged and
/// counted. Pass-level failures leave the catalog exactly as it was.
pub fn reconcile(
    conn: &mut Connection,
    root: &Path,
    scope: &Scope,
    ctx: &ScanContext,
) -> Result<ScanSummary> {
    let mut summary = ScanSummary {
        branch: scope.branch.clone(),
        component: scope.component.clone(),
        ..Default::default()
    };
    let prefix = scope.pool_prefix();

    // Classify what the catalog already knows
    let mut vanished: Vec<(RecordKind, PackageRecord)> = Vec::new();
    let mut unchanged: HashSet<String> = HashSet::new();
    let mut rescans: HashMap<String, Origin> = HashMap::new();

    for kind in [RecordKind::Current, RecordKind::Duplicate] {
        for record in PackageRecord::find_under_prefix(conn, kind, &prefix)? {
            match file_stat(&root.join(&record.filename))? {
                None => vanished.push((kind, record)),
                Some((size, mtime)) if size == record.size && mtime == record.mtime => {
                    unchanged.insert(record.filename);
                }
                Some(_) => {
                    let filename = record.filename.clone();
                    let origin = match kind {
                        RecordKind::Current => Origin::RescanCurrent(record),
                        RecordKind::Duplicate => Origin::RescanDuplicate(record),
                    };
                    rescans.insert(filename, origin);
                }
            }
        }
    }
    summary.unchanged = unchanged.len();

    // Discover candidates
    let mut candidates = Vec::new();
    let search_path = scope.pool_dir(root);
    if search_path.is_dir() {
        for entry in WalkDir::new(&search_path).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file()
                || entry.path().extension().is_none_or(|ext| ext != "deb")
            {
                continue;
            }

            let filename = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::InitError(format!("Pool file outside root: {}", e)))?
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            if unchanged.contains(&filename) {
                continue;
            }
            let Some((size, mtime)) = file_stat(entry.path())? else {
                continue;
            };

            let origin = rescans.remove(&filename).unwrap_or(Origin::New);
            candidates.push(Candidate {
                path: entry.path().to_path_buf(),
                filename,
                size,
                mtime,
                origin,
            });
        }
    }

    // Changed records whose file the walk did not turn up are gone too
    for (_, origin) in rescans.drain() {
        match origin {
            Origin::RescanCurrent(record) => vanished.push((RecordKind::Current, record)),
            Origin::RescanDuplicate(record) => vanished.push((RecordKind::Duplicate, record)),
            Origin::New => {}
        }
    }
    vanished.sort_by(|a, b| a.1.filename.cmp(&b.1.filename));

    debug!(
        "{}: {} vanished, {} unchanged, {} candidates",
        scope,
        vanished.len(),
        summary.unchanged,
        candidates.len()
    );

    let mut outcomes = extract_all(ctx, &candidates);

    if let Some(slot) = outcomes
        .iter_mut()
        .find(|o| matches!(o, ExtractOutcome::Fatal(_)))
        && let ExtractOutcome::Fatal(e) = std::mem::replace(slot, ExtractOutcome::Cancelled)
    {
        error!("{}: aborting pass: {}", scope, e);
        return Err(e);
    }
    if ctx.cancel.is_cancelled() || outcomes.iter().any(|o| matches!(o, ExtractOutcome::Cancelled)) {
        warn!("{}: pass cancelled, catalog unchanged", scope);
        return Err(Error::Cancelled(scope.to_string()));
    }

    let mut pass = Pass {
        scope,
        ranks: &ctx.ranks,
        summary,
        events: Vec::new(),
        repos: BTreeMap::new(),
        pending: candidates
            .iter()
            .filter(|c| matches!(c.origin, Origin::RescanDuplicate(_)))
            .map(|c| c.filename.clone())
            .collect(),
    };

    let pass = crate::db::transaction(conn, move |tx| {
        // Vanished duplicates go first so none of them is restored
        for kind in [RecordKind::Duplicate, RecordKind::Current] {
            for (_, record) in vanished.iter().filter(|(k, _)| *k == kind) {
                pass.remove_vanished(tx, kind, record)?;
            }
        }
        for (candidate, outcome) in candidates.into_iter().zip(outcomes) {
            pass.apply(tx, candidate, outcome)?;
        }
        for repo in pass.repos.values() {
            repo.upsert(tx)?;
        }
        Ok(pass)
    })?;

    for event in &pass.events {
        ctx.notifier.publish(event);
    }

    info!("{}", pass.summary);
    Ok(pass.summary)
}

/// Run the extractor over every candidate on the worker pool
///
/// Outcomes come back in candidate order.
fn extract_all(ctx: &ScanContext, candidates: &[Candidate]) -> Vec<ExtractOutcome> {
    let aborted = AtomicBool::new(false);

    ctx.pool.install(|| {
        candidates
            .par_iter()
            .map(|candidate| {
                if ctx.cancel.is_cancelled() || aborted.load(Ordering::SeqCst) {
                    return ExtractOutcome::Cancelled;
                }
                match ctx.extractor.extract(&candidate.path) {
                    Ok(meta) => ExtractOutcome::Extracted(Box::new(meta)),
                    Err(Error::CorruptedArchive { reason, .. }) => ExtractOutcome::Corrupted(reason),
                    Err(e @ Error::ExtractorUnavailable(_)) => {
                        aborted.store(true, Ordering::SeqCst);
                        ExtractOutcome::Fatal(e)
                    }
                    Err(e) => ExtractOutcome::Corrupted(e.to_string()),
                }
            })
            .collect()
    })
}

/// Write-side state of one pass
struct Pass<'a> {
    scope: &'a Scope,
    ranks: &'a BranchRanks,
    summary: ScanSummary,
    events: Vec<ChangeEvent>,
    repos: BTreeMap<String, RepoDescriptor>,
    /// Rewritten duplicates not applied yet; their stale records are never restored
    pending: HashSet<String>,
}

impl Pass<'_> {
    fn event(&mut self, record: &PackageRecord, method: ChangeMethod, from: &str, to: &str) {
        self.events.push(ChangeEvent {
            branch: self.scope.branch.clone(),
            component: self.scope.component.clone(),
            package: record.package.clone(),
            architecture: record.architecture.clone(),
            method,
            from_version: from.to_string(),
            to_version: to.to_string(),
        });
    }

    /// Drop a record and, unless another record shares its key, its owned rows
    fn drop_record(conn: &Connection, kind: RecordKind, record: &PackageRecord) -> Result<()> {
        PackageRecord::delete(conn, kind, &record.filename)?;
        if !PackageRecord::key_in_use(conn, &record.key())? {
            OwnedRows::delete(conn, &record.key())?;
        }
        Ok(())
    }

    fn remove_vanished(&mut self, conn: &Connection, kind: RecordKind, record: &PackageRecord) -> Result<()> {
        Self::drop_record(conn, kind, record)?;
        match kind {
            RecordKind::Current => {
                info!("CLEAN  {}", record.filename);
                self.vacate(conn, record)?;
            }
            RecordKind::Duplicate => {
                debug!("CLEAN  {} (duplicate)", record.filename);
                self.summary.purged_duplicates += 1;
            }
        }
        Ok(())
    }

    /// Fill the slot a removed current record left behind
    ///
    /// The newest duplicate of the same (package, repo) whose file is still in
    /// place becomes current, keeping the owned rows stored under its key.
    /// Without one the package is gone and a delete is emitted.
    fn vacate(&mut self, conn: &Connection, gone: &PackageRecord) -> Result<()> {
        let survivor = PackageRecord::find_versions(conn, RecordKind::Duplicate, &gone.package, &gone.repo)?
            .into_iter()
            .find(|r| !self.pending.contains(&r.filename));

        let Some(survivor) = survivor else {
            self.event(gone, ChangeMethod::Delete, &gone.version, "");
            self.summary.deleted += 1;
            return Ok(());
        };

        PackageRecord::delete(conn, RecordKind::Duplicate, &survivor.filename)?;
        survivor.insert(conn, RecordKind::Current)?;
        info!(
            "RESTORE {} {} {} << {}",
            survivor.architecture, survivor.package, survivor.version, gone.version
        );
        let method = if survivor.version == gone.version {
            ChangeMethod::Overwrite
        } else {
            ChangeMethod::Upgrade
        };
        self.event(&survivor, method, &gone.version, &survivor.version);
        self.summary.restored += 1;
        Ok(())
    }

    fn apply(&mut self, conn: &Connection, candidate: Candidate, outcome: ExtractOutcome) -> Result<()> {
        let meta = match outcome {
            ExtractOutcome::Extracted(meta) => meta,
            // A rewritten file that fails to read keeps its old record, which
            // is read again on every pass until the file is fixed or removed
            ExtractOutcome::Corrupted(reason) => {
                error!("{} is corrupted: {}", candidate.filename, reason);
                self.summary.skipped_corrupt += 1;
                return Ok(());
            }
            ExtractOutcome::Fatal(e) => return Err(e),
            ExtractOutcome::Cancelled => return Err(Error::Cancelled(self.scope.to_string())),
        };

        let record = match PackageRecord::from_metadata(
            &meta,
            &candidate.filename,
            candidate.size,
            candidate.mtime,
            &self.scope.branch,
            &self.scope.component,
        ) {
            Ok(record) => record,
            Err(e @ Error::MalformedVersion(_)) => {
                warn!("Skipping {}: {}", candidate.filename, e);
                self.summary.skipped_malformed += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let rows = OwnedRows::from_metadata(&meta);

        let scope = self.scope;
        let rank = self.ranks.rank(&scope.branch);
        self.repos.entry(record.repo.clone()).or_insert_with(|| {
            RepoDescriptor::derive(&scope.branch, &scope.component, &record.architecture, rank)
        });

        match candidate.origin {
            Origin::RescanCurrent(old) => {
                Self::drop_record(conn, RecordKind::Current, &old)?;
                if old.package == record.package && old.repo == record.repo {
                    record.insert(conn, RecordKind::Current)?;
                    rows.replace(conn, &record.key())?;
                    info!("UPDATE {}", record.filename);
                    self.event(&record, ChangeMethod::Overwrite, &record.version, &record.version);
                    self.summary.overwritten += 1;
                    return Ok(());
                }
                // The file now holds a different package
                info!("CLEAN  {} ({} replaced)", old.filename, old.package);
                self.vacate(conn, &old)?;
            }
            Origin::RescanDuplicate(old) => {
                Self::drop_record(conn, RecordKind::Duplicate, &old)?;
                self.pending.remove(&old.filename);
            }
            Origin::New => {}
        }

        self.decide(conn, record, rows)
    }

    /// Place a freshly read record against the current one for its (package, repo)
    fn decide(&mut self, conn: &Connection, record: PackageRecord, rows: OwnedRows) -> Result<()> {
        let existing = PackageRecord::find_versions(conn, RecordKind::Current, &record.package, &record.repo)?
            .into_iter()
            .next();

        let Some(existing) = existing else {
            record.insert(conn, RecordKind::Current)?;
            rows.replace(conn, &record.key())?;
            info!("NEW    {} {} {}", record.architecture, record.package, record.version);
            self.event(&record, ChangeMethod::New, "", &record.version);
            self.summary.new += 1;
            return Ok(());
        };

        // Sortable keys order exactly like version comparison
        match existing.vercomp.cmp(&record.vercomp) {
            CmpOrdering::Less => {
                PackageRecord::delete(conn, RecordKind::Current, &existing.filename)?;
                existing.insert(conn, RecordKind::Duplicate)?;
                record.insert(conn, RecordKind::Current)?;
                rows.replace(conn, &record.key())?;
                info!(
                    "NEWER  {} {} {} >> {}",
                    record.architecture, record.package, record.version, existing.version
                );
                self.event(&record, ChangeMethod::Upgrade, &existing.version, &record.version);
                self.summary.upgraded += 1;
            }
            CmpOrdering::Greater => {
                // Kept so the record can be restored with its rows later
                if !PackageRecord::key_in_use(conn, &record.key())? {
                    rows.replace(conn, &record.key())?;
                }
                record.insert(conn, RecordKind::Duplicate)?;
                warn!("OLD    {} {} {}", record.architecture, record.package, record.version);
                self.summary.old += 1;
            }
            CmpOrdering::Equal => {
                record.insert(conn, RecordKind::Duplicate)?;
                error!("DUP    {} == {}", existing.filename, record.filename);
                self.summary.duplicate += 1;
            }
        }
        Ok(())
    }
}
