// src/lib.rs

//! pvector - binary package catalog reconciler
//!
//! Keeps the catalog of a Debian-style package repository in step with the
//! package files in its pool, and checks that the shared-library dependencies
//! of everything published can be satisfied.
//!
//! # Architecture
//!
//! - Database-first: all state in SQLite, no config files
//! - Reconciler: diffs `pool/{branch}/{component}` against the catalog and
//!   commits each pass in one transaction
//! - Versions: Debian ordering, stored as a sortable key
//! - Checker: pure reader over provides/depends, reports missing sonames and
//!   version mismatches with hints

pub mod db;
mod error;
pub mod notify;
pub mod packages;
pub mod repository;
pub mod resolver;
pub mod version;

pub use error::{Error, Result};
