// src/packages/mod.rs

//! Package metadata extraction
//!
//! This module provides extractors that read the catalog metadata out of
//! binary package archives. Each implements the `Extractor` trait.

pub mod command;
pub mod control;
pub mod deb;
pub mod elf;
pub mod traits;

pub use command::CommandExtractor;
pub use control::ControlFields;
pub use deb::DebExtractor;
pub use traits::{Extractor, FileType, PackageFile, PackageMetadata};
