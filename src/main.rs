// src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use pvector::db::models::PackageRecord;
use pvector::notify::{ChangeNotifier, JsonLinesNotifier, LogNotifier};
use pvector::packages::{CommandExtractor, DebExtractor, Extractor};
use pvector::repository::{self, BranchRanks, ScanContext, ScanOptions, Scope};
use pvector::resolver::{self, CheckScope};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pvector")]
#[command(author, version, about = "Binary package catalog reconciler and soname consistency checker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the catalog database
    Init {
        /// Database path (default: /var/lib/pvector/pvector.db)
        #[arg(short, long, default_value = "/var/lib/pvector/pvector.db")]
        db_path: String,
    },
    /// Reconcile the catalog with the package pool
    Scan {
        /// Repository root (the directory containing pool/)
        #[arg(short, long)]
        root: PathBuf,
        /// Only scan this branch
        #[arg(short, long)]
        branch: Option<String>,
        /// Only scan this component (requires --branch)
        #[arg(short, long, requires = "branch")]
        component: Option<String>,
        /// Extraction workers (default: available parallelism + 1)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// External extractor command speaking the pkgscan_cli JSON format
        #[arg(long)]
        extractor: Option<PathBuf>,
        /// Append change events as JSON lines to this file
        #[arg(long)]
        events: Option<PathBuf>,
        /// Testing rank override for a branch
        #[arg(long = "rank", value_name = "BRANCH=N", value_parser = parse_rank)]
        ranks: Vec<(String, i64)>,
        /// Database path (default: /var/lib/pvector/pvector.db)
        #[arg(short, long, default_value = "/var/lib/pvector/pvector.db")]
        db_path: String,
    },
    /// Report shared-object dependencies nothing published satisfies
    Check {
        /// Only check repos of this branch
        #[arg(short, long)]
        branch: Option<String>,
        /// Only check repos of this component
        #[arg(short, long)]
        component: Option<String>,
        /// Only check repos of this architecture
        #[arg(short, long)]
        architecture: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Database path (default: /var/lib/pvector/pvector.db)
        #[arg(short, long, default_value = "/var/lib/pvector/pvector.db")]
        db_path: String,
    },
    /// Remove repos whose pool directory no longer exists
    Gc {
        /// Repository root (the directory containing pool/)
        #[arg(short, long)]
        root: PathBuf,
        /// Report what would be removed without writing
        #[arg(long)]
        dry_run: bool,
        /// Database path (default: /var/lib/pvector/pvector.db)
        #[arg(short, long, default_value = "/var/lib/pvector/pvector.db")]
        db_path: String,
    },
    /// Show every recorded version of a package
    Query {
        /// Package name
        package: String,
        /// Database path (default: /var/lib/pvector/pvector.db)
        #[arg(short, long, default_value = "/var/lib/pvector/pvector.db")]
        db_path: String,
    },
}

fn parse_rank(s: &str) -> std::result::Result<(String, i64), String> {
    BranchRanks::parse_override(s).map_err(|e| e.to_string())
}

fn format_time(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_record(record: &PackageRecord) {
    println!("  {} {} [{}]", record.package, record.version, record.repo);
    println!("    File: {}", record.filename);
    println!("    Size: {} bytes, installed {} KiB", record.size, record.installed_size);
    println!("    SHA-256: {}", record.sha256);
    println!("    Built: {}", format_time(record.debtime));
    if let Some(section) = &record.section {
        println!("    Section: {}", section);
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { db_path }) => {
            info!("Initializing catalog database at: {}", db_path);
            pvector::db::init(&db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::Scan {
            root,
            branch,
            component,
            jobs,
            extractor,
            events,
            ranks,
            db_path,
        }) => {
            let mut conn = pvector::db::open(&db_path)?;

            let extractor: Arc<dyn Extractor> = match extractor {
                Some(program) => {
                    info!("Using external extractor: {}", program.display());
                    Arc::new(CommandExtractor::new(program))
                }
                None => Arc::new(DebExtractor::new()),
            };
            let notifier: Arc<dyn ChangeNotifier> = match events {
                Some(path) => {
                    let file = OpenOptions::new().create(true).append(true).open(&path)?;
                    Arc::new(JsonLinesNotifier::new(file))
                }
                None => Arc::new(LogNotifier),
            };

            let mut options = ScanOptions::default();
            if let Some(jobs) = jobs {
                options.jobs = jobs;
            }
            for (branch, rank) in ranks {
                options.ranks.set(&branch, rank);
            }
            let ctx = ScanContext::new(extractor, notifier, options)?;

            // Stop starting extractions; the open pass rolls back
            let cancel = ctx.cancel_token();
            ctrlc::set_handler(move || {
                warn!("Interrupted, cancelling scan");
                cancel.cancel();
            })?;

            let summaries = match (branch, component) {
                (Some(branch), Some(component)) => {
                    vec![repository::reconcile(&mut conn, &root, &Scope::new(&branch, &component), &ctx)?]
                }
                (Some(branch), None) => {
                    let mut summaries = Vec::new();
                    for scope in repository::list_scopes(&root)?
                        .into_iter()
                        .filter(|s| s.branch == branch)
                    {
                        summaries.push(repository::reconcile(&mut conn, &root, &scope, &ctx)?);
                    }
                    summaries
                }
                _ => repository::scan_all(&mut conn, &root, &ctx)?,
            };

            for summary in &summaries {
                println!("{}", summary);
            }
            Ok(())
        }
        Some(Commands::Check {
            branch,
            component,
            architecture,
            json,
            db_path,
        }) => {
            let conn = pvector::db::open(&db_path)?;
            let scope = CheckScope {
                branch,
                component,
                architecture,
            };
            let report = resolver::check(&conn, &scope)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }

            if !report.is_empty() {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Commands::Gc {
            root,
            dry_run,
            db_path,
        }) => {
            let mut conn = pvector::db::open(&db_path)?;
            let summary = repository::gc(&mut conn, &root, dry_run)?;

            if summary.repos.is_empty() {
                println!("Nothing to remove.");
                return Ok(());
            }
            for path in &summary.paths {
                println!("Branch {} is gone", path);
            }
            println!(
                "{} {} repo(s), {} package(s), {} duplicate(s)",
                if dry_run { "Would remove" } else { "Removed" },
                summary.repos.len(),
                summary.packages,
                summary.duplicates
            );
            Ok(())
        }
        Some(Commands::Query { package, db_path }) => {
            let conn = pvector::db::open(&db_path)?;
            let result = repository::query(&conn, &package)?;

            if result.current.is_empty() && result.duplicates.is_empty() {
                println!("No records for {}.", package);
                return Ok(());
            }
            if !result.current.is_empty() {
                println!("Current:");
                result.current.iter().for_each(print_record);
            }
            if !result.duplicates.is_empty() {
                println!("Duplicates:");
                result.duplicates.iter().for_each(print_record);
            }
            Ok(())
        }
        None => {
            println!("pvector - binary package catalog reconciler");
            println!("Run 'pvector --help' for usage information");
            Ok(())
        }
    }
}
