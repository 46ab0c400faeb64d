// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn db_path_arg() -> Arg {
    Arg::new("db_path")
        .short('d')
        .long("db-path")
        .value_name("PATH")
        .default_value("/var/lib/pvector/pvector.db")
        .help("Database path")
}

fn root_arg() -> Arg {
    Arg::new("root")
        .short('r')
        .long("root")
        .value_name("DIR")
        .required(true)
        .help("Repository root (the directory containing pool/)")
}

fn build_cli() -> Command {
    Command::new("pvector")
        .version(env!("CARGO_PKG_VERSION"))
        .author("pvector Contributors")
        .about("Binary package catalog reconciler and soname consistency checker")
        .subcommand_required(false)
        .subcommand(
            Command::new("init")
                .about("Initialize the catalog database")
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("scan")
                .about("Reconcile the catalog with the package pool")
                .arg(root_arg())
                .arg(Arg::new("branch").short('b').long("branch").help("Only scan this branch"))
                .arg(
                    Arg::new("component")
                        .short('c')
                        .long("component")
                        .requires("branch")
                        .help("Only scan this component (requires --branch)"),
                )
                .arg(
                    Arg::new("jobs")
                        .short('j')
                        .long("jobs")
                        .help("Extraction workers (default: available parallelism + 1)"),
                )
                .arg(
                    Arg::new("extractor")
                        .long("extractor")
                        .value_name("CMD")
                        .help("External extractor command speaking the pkgscan_cli JSON format"),
                )
                .arg(
                    Arg::new("events")
                        .long("events")
                        .value_name("FILE")
                        .help("Append change events as JSON lines to this file"),
                )
                .arg(
                    Arg::new("rank")
                        .long("rank")
                        .value_name("BRANCH=N")
                        .action(clap::ArgAction::Append)
                        .help("Testing rank override for a branch"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("check")
                .about("Report shared-object dependencies nothing published satisfies")
                .arg(Arg::new("branch").short('b').long("branch").help("Only check repos of this branch"))
                .arg(
                    Arg::new("component")
                        .short('c')
                        .long("component")
                        .help("Only check repos of this component"),
                )
                .arg(
                    Arg::new("architecture")
                        .short('a')
                        .long("architecture")
                        .help("Only check repos of this architecture"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(clap::ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("gc")
                .about("Remove repos whose pool directory no longer exists")
                .arg(root_arg())
                .arg(
                    Arg::new("dry_run")
                        .long("dry-run")
                        .action(clap::ArgAction::SetTrue)
                        .help("Report what would be removed without writing"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("query")
                .about("Show every recorded version of a package")
                .arg(Arg::new("package").required(true).help("Package name"))
                .arg(db_path_arg()),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("pvector.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
