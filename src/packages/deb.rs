// src/packages/deb.rs

//! Debian package metadata extractor
//!
//! Reads .deb packages, which are AR archives containing control and data tarballs

use crate::error::{Error, Result};
use crate::packages::control::ControlFields;
use crate::packages::elf;
use crate::packages::traits::{Extractor, FileType, PackageFile, PackageMetadata};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tar::{Archive, EntryType};
use tracing::debug;
use xz2::read::XzDecoder;

/// Shared objects are only counted as provided when installed here
const PROVIDES_PREFIX: &str = "usr/lib";

/// Built-in extractor for `.deb` archives
#[derive(Debug, Clone, Copy, Default)]
pub struct DebExtractor;

impl DebExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Pull the control and data members out of the AR container
    fn read_members(path: &Path, data: &[u8]) -> Result<(Member, Member)> {
        let mut archive = ar::Archive::new(data);
        let mut control = None;
        let mut payload = None;

        while let Some(entry) = archive.next_entry() {
            let mut entry =
                entry.map_err(|e| Error::corrupted(path.display().to_string(), format!("Failed to read AR entry: {}", e)))?;

            let entry_name = String::from_utf8_lossy(entry.header().identifier())
                .trim_end_matches('/')
                .to_string();

            let slot = if entry_name.starts_with("control.tar") {
                &mut control
            } else if entry_name.starts_with("data.tar") {
                &mut payload
            } else {
                continue;
            };

            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| Error::corrupted(path.display().to_string(), format!("Failed to read AR member {}: {}", entry_name, e)))?;
            *slot = Some(Member {
                name: entry_name,
                content,
            });
        }

        let control = control.ok_or_else(|| {
            Error::corrupted(path.display().to_string(), "control.tar not found in DEB archive")
        })?;
        let payload = payload.ok_or_else(|| {
            Error::corrupted(path.display().to_string(), "data.tar not found in DEB archive")
        })?;
        Ok((control, payload))
    }

    /// Parse `./control` out of control.tar.*, returning it with its mtime
    fn read_control(path: &Path, member: &Member) -> Result<(ControlFields, i64)> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            Error::corrupted(path.display().to_string(), format!("{} in {}: {}", what, member.name, e))
        };

        let mut archive = Archive::new(member.reader()?);

        for entry in archive.entries().map_err(|e| corrupt("Failed to read archive", &e))? {
            let mut entry = entry.map_err(|e| corrupt("Failed to read entry", &e))?;

            let entry_path = entry
                .path()
                .map_err(|e| corrupt("Failed to get entry path", &e))?
                .to_string_lossy()
                .to_string();

            if entry_path == "./control" || entry_path == "control" {
                let mtime = entry
                    .header()
                    .mtime()
                    .map_err(|e| corrupt("Failed to get control mtime", &e))?;
                let mut content = String::new();
                entry
                    .read_to_string(&mut content)
                    .map_err(|e| corrupt("Failed to read control file", &e))?;
                let control = ControlFields::parse(&content)
                    .map_err(|e| corrupt("Malformed control file", &e))?;
                return Ok((control, mtime as i64));
            }
        }

        Err(Error::corrupted(
            path.display().to_string(),
            "control file not found in control.tar",
        ))
    }

    /// List data.tar.* members and scan ELF objects for shared-object links
    fn read_data(path: &Path, member: &Member, meta: &mut PackageMetadata) -> Result<()> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            Error::corrupted(path.display().to_string(), format!("{} in {}: {}", what, member.name, e))
        };

        let mut archive = Archive::new(member.reader()?);

        for entry in archive.entries().map_err(|e| corrupt("Failed to read archive", &e))? {
            let mut entry = entry.map_err(|e| corrupt("Failed to read entry", &e))?;

            let entry_path = entry
                .path()
                .map_err(|e| corrupt("Failed to get entry path", &e))?
                .to_string_lossy()
                .to_string();

            let header = entry.header();
            let ftype = match header.entry_type() {
                EntryType::Regular | EntryType::Continuous => FileType::Regular,
                EntryType::Link => FileType::HardLink,
                EntryType::Symlink => FileType::Symlink,
                EntryType::Char => FileType::CharDevice,
                EntryType::Block => FileType::BlockDevice,
                EntryType::Directory => FileType::Directory,
                EntryType::Fifo => FileType::Fifo,
                _ => FileType::Other,
            };
            let size = header.size().map_err(|e| corrupt("Failed to get file size", &e))?;
            let mode = header.mode().map_err(|e| corrupt("Failed to get file mode", &e))?;
            let uid = header.uid().map_err(|e| corrupt("Failed to get uid", &e))?;
            let gid = header.gid().map_err(|e| corrupt("Failed to get gid", &e))?;
            let uname = header.username().ok().flatten().unwrap_or_default().to_string();
            let gname = header.groupname().ok().flatten().unwrap_or_default().to_string();

            if ftype == FileType::Regular {
                let mut magic = Vec::with_capacity(4);
                (&mut entry)
                    .take(4)
                    .read_to_end(&mut magic)
                    .map_err(|e| corrupt("Failed to read file content", &e))?;

                if elf::is_elf(&magic) {
                    let mut content = magic;
                    entry
                        .read_to_end(&mut content)
                        .map_err(|e| corrupt("Failed to read file content", &e))?;

                    if let Some(links) = elf::scan(&content) {
                        let normalized = entry_path.trim_start_matches("./").trim_start_matches('/');
                        if let Some(soname) = links.soname
                            && normalized.starts_with(PROVIDES_PREFIX)
                        {
                            meta.so_provides.insert(soname);
                        }
                        meta.so_depends.extend(links.needed);
                    }
                }
            }

            meta.files.push(PackageFile {
                path: entry_path,
                size: size as i64,
                ftype,
                mode,
                uid: uid as i64,
                gid: gid as i64,
                uname,
                gname,
            });
        }

        Ok(())
    }
}

/// One member of the AR container
struct Member {
    name: String,
    content: Vec<u8>,
}

impl Member {
    /// Decompress based on extension
    fn reader(&self) -> Result<Box<dyn Read + '_>> {
        let data = &self.content[..];
        let reader: Box<dyn Read + '_> = if self.name.ends_with(".gz") {
            Box::new(GzDecoder::new(data))
        } else if self.name.ends_with(".xz") {
            Box::new(XzDecoder::new(data))
        } else if self.name.ends_with(".zst") {
            Box::new(zstd::Decoder::new(data).map_err(|e| {
                Error::InitError(format!("Failed to create zstd decoder: {}", e))
            })?)
        } else if self.name.ends_with(".tar") {
            Box::new(data)
        } else {
            return Err(Error::ParseError(format!(
                "Unsupported member compression: {}",
                self.name
            )));
        };
        Ok(reader)
    }
}

impl Extractor for DebExtractor {
    fn extract(&self, path: &Path) -> Result<PackageMetadata> {
        debug!("Extracting Debian package: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            Error::corrupted(path.display().to_string(), format!("Failed to open DEB file: {}", e))
        })?;

        let (control_member, data_member) = Self::read_members(path, &data)?;
        let (control, build_time) = Self::read_control(path, &control_member)
            .map_err(|e| into_corrupted(path, e))?;

        let mut meta = PackageMetadata::from_control(control)
            .map_err(|reason| Error::corrupted(path.display().to_string(), reason))?;
        meta.build_time = build_time;
        meta.size = data.len() as u64;
        meta.sha256 = format!("{:x}", Sha256::digest(&data));

        Self::read_data(path, &data_member, &mut meta).map_err(|e| into_corrupted(path, e))?;

        debug!(
            "Extracted DEB package: {} version {} ({} files, {} provides, {} depends)",
            meta.name,
            meta.version,
            meta.files.len(),
            meta.so_provides.len(),
            meta.so_depends.len()
        );

        Ok(meta)
    }
}

/// Any failure while reading the archive means the file is unusable
fn into_corrupted(path: &Path, err: Error) -> Error {
    match err {
        Error::CorruptedArchive { .. } => err,
        other => Error::corrupted(path.display().to_string(), other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::elf::tests::build_elf;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_gz(entries: &[(&str, EntryType, &[u8])], mtime: u64) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, kind, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*kind);
            header.set_mode(if *kind == EntryType::Directory { 0o755 } else { 0o644 });
            header.set_size(content.len() as u64);
            header.set_mtime(mtime);
            header.set_uid(0);
            header.set_gid(0);
            header.set_username("root").unwrap();
            header.set_groupname("root").unwrap();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn build_deb(control: &str, data: &[(&str, EntryType, &[u8])]) -> Vec<u8> {
        let control_tar = tar_gz(&[("./control", EntryType::Regular, control.as_bytes())], 1_700_000_000);
        let data_tar = tar_gz(data, 1_700_000_100);

        let mut builder = ar::Builder::new(Vec::new());
        for (name, content) in [
            ("debian-binary", b"2.0\n".to_vec()),
            ("control.tar.gz", control_tar),
            ("data.tar.gz", data_tar),
        ] {
            let header = ar::Header::new(name.as_bytes().to_vec(), content.len() as u64);
            builder.append(&header, &content[..]).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn write_deb(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_extract_deb() {
        let lib = build_elf(true, false, Some("libfoo.so.1"), &["libc.so.6"]);
        let bin = build_elf(true, false, Some("libnotprovided.so.2"), &["libfoo.so.1"]);
        let bytes = build_deb(
            "Package: foo\nVersion: 1.0-1\nArchitecture: amd64\nInstalled-Size: 20\nDepends: libc6\n",
            &[
                ("./usr/", EntryType::Directory, b""),
                ("./usr/lib/libfoo.so.1", EntryType::Regular, &lib),
                ("./usr/bin/foo", EntryType::Regular, &bin),
                ("./usr/share/doc/foo/README", EntryType::Regular, b"hi"),
            ],
        );

        let dir = TempDir::new().unwrap();
        let path = write_deb(&dir, "foo_1.0-1_amd64.deb", &bytes);
        let meta = DebExtractor::new().extract(&path).unwrap();

        assert_eq!(meta.name, "foo");
        assert_eq!(meta.version, "1.0-1");
        assert_eq!(meta.architecture, "amd64");
        assert_eq!(meta.installed_size, 20);
        assert_eq!(meta.build_time, 1_700_000_000);
        assert_eq!(meta.size, bytes.len() as u64);
        assert_eq!(meta.sha256, format!("{:x}", Sha256::digest(&bytes)));
        assert_eq!(meta.files.len(), 4);
        assert_eq!(meta.files[0].ftype, FileType::Directory);
        assert_eq!(meta.files[3].size, 2);
        assert_eq!(meta.files[3].uname, "root");

        // Provides only count under usr/lib
        assert_eq!(meta.so_provides.iter().collect::<Vec<_>>(), vec!["libfoo.so.1"]);
        assert_eq!(
            meta.so_depends.iter().collect::<Vec<_>>(),
            vec!["libc.so.6", "libfoo.so.1"]
        );
    }

    #[test]
    fn test_missing_control_field_is_corrupted() {
        let bytes = build_deb("Package: foo\nVersion: 1.0\n", &[]);
        let dir = TempDir::new().unwrap();
        let path = write_deb(&dir, "foo.deb", &bytes);

        let err = DebExtractor::new().extract(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptedArchive { .. }));
    }

    #[test]
    fn test_garbage_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = write_deb(&dir, "junk.deb", b"this is not an ar archive");

        let err = DebExtractor::new().extract(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptedArchive { .. }));

        let err = DebExtractor::new()
            .extract(&dir.path().join("missing.deb"))
            .unwrap_err();
        assert!(matches!(err, Error::CorruptedArchive { .. }));
    }
}
