//! Tar and tar+gzip extraction for image tarballs and layer blobs.
//!
//! Entries are handled in one pass, except hard links: a link can appear
//! before its target in the same archive, so links are collected and
//! created after everything else is on disk. Existing files are never
//! overwritten, so re-extracting into a populated directory is a no-op
//! for the paths that already exist.

use std::fs;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::warn;

/// Extract `archive` into `target`, optionally through a gzip decoder.
pub fn extract(archive: &Path, target: &Path, gzipped: bool) -> Result<()> {
    let file = fs::File::open(archive)
        .with_context(|| format!("unable to open archive {}", archive.display()))?;
    if gzipped {
        unpack(tar::Archive::new(GzDecoder::new(file)), target)
    } else {
        unpack(tar::Archive::new(file), target)
    }
    .with_context(|| format!("unable to extract {}", archive.display()))
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, target: &Path) -> Result<()> {
    // (destination, link target) pairs deferred to a second pass.
    let mut hard_links: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let dest = sanitized_path(target, &entry.path()?);
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("unable to create {}", dest.display()))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Regular => {
                // symlink_metadata so a dangling symlink still counts as
                // occupied and is left alone.
                if dest.symlink_metadata().is_ok() {
                    continue;
                }
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("unable to create {}", parent.display()))?;
                }
                let mut out = fs::File::create(&dest)
                    .with_context(|| format!("unable to create {}", dest.display()))?;
                std::io::copy(&mut entry, &mut out)
                    .with_context(|| format!("unable to write {}", dest.display()))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Symlink => {
                let Some(link_target) = entry.header().link_name()? else {
                    warn!("Symlink entry {} has no target, skipping", dest.display());
                    continue;
                };
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                match std::os::unix::fs::symlink(&link_target, &dest) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("unable to symlink {}", dest.display()));
                    }
                }
            }
            EntryType::Link => {
                if let Some(link_target) = entry.header().link_name()? {
                    hard_links.push((dest, sanitized_path(target, &link_target)));
                }
            }
            other => {
                warn!(
                    "File type {:?} unhandled for {}, skipping",
                    other,
                    dest.display()
                );
            }
        }
    }

    // Hard link targets must exist, so these run last. A target that never
    // materialized as a regular entry means the link is skipped entirely.
    for (dest, src) in hard_links {
        if dest.symlink_metadata().is_ok() || src.symlink_metadata().is_err() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::hard_link(&src, &dest).with_context(|| {
            format!(
                "unable to hard link {} -> {}",
                src.display(),
                dest.display()
            )
        })?;
    }

    Ok(())
}

/// Join an entry path onto `target` keeping only its normal components,
/// so absolute or `..`-laden names cannot escape the extraction root.
fn sanitized_path(target: &Path, raw: &Path) -> PathBuf {
    let mut out = target.to_path_buf();
    for component in raw.components() {
        if let Component::Normal(c) = component {
            out.push(c);
        }
    }
    out
}

// ─── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tar::{Builder, Header};

    fn append_file(tar: &mut Builder<impl Write>, path: &str, data: &[u8], mode: u32) {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        tar.append_data(&mut header, path, data).unwrap();
    }

    fn append_dir(tar: &mut Builder<impl Write>, path: &str, mode: u32) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(mode);
        tar.append_data(&mut header, path, &[][..]).unwrap();
    }

    fn append_link(tar: &mut Builder<impl Write>, kind: EntryType, path: &str, target: &str) {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_link_name(target).unwrap();
        header.set_size(0);
        tar.append_data(&mut header, path, &[][..]).unwrap();
    }

    fn write_tar(dir: &Path, name: &str, build: impl FnOnce(&mut Builder<std::fs::File>)) -> PathBuf {
        let path = dir.join(name);
        let mut tar = Builder::new(std::fs::File::create(&path).unwrap());
        build(&mut tar);
        tar.finish().unwrap();
        path
    }

    #[test]
    fn test_extract_files_and_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = write_tar(tmp.path(), "a.tar", |tar| {
            append_dir(tar, "etc", 0o755);
            append_file(tar, "etc/hostname", b"box\n", 0o644);
            append_file(tar, "bin/sh", b"#!/bin/true\n", 0o755);
        });

        let out = tmp.path().join("fs");
        extract(&tarball, &out, false).unwrap();

        assert_eq!(std::fs::read(out.join("etc/hostname")).unwrap(), b"box\n");
        let mode = std::fs::metadata(out.join("bin/sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_extract_gzipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("layer.tar.gz");
        let enc = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
        let mut tar = Builder::new(enc);
        append_file(&mut tar, "usr/share/motd", b"hello", 0o644);
        tar.into_inner().unwrap().finish().unwrap();

        let out = tmp.path().join("fs");
        extract(&path, &out, true).unwrap();
        assert_eq!(std::fs::read(out.join("usr/share/motd")).unwrap(), b"hello");
    }

    #[test]
    fn test_existing_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = write_tar(tmp.path(), "a.tar", |tar| {
            append_file(tar, "etc/hosts", b"from-archive", 0o644);
        });

        let out = tmp.path().join("fs");
        std::fs::create_dir_all(out.join("etc")).unwrap();
        std::fs::write(out.join("etc/hosts"), b"pre-existing").unwrap();

        extract(&tarball, &out, false).unwrap();
        assert_eq!(std::fs::read(out.join("etc/hosts")).unwrap(), b"pre-existing");
    }

    #[test]
    fn test_extract_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = write_tar(tmp.path(), "a.tar", |tar| {
            append_dir(tar, "var", 0o755);
            append_file(tar, "var/data", b"x", 0o600);
            append_link(tar, EntryType::Symlink, "var/link", "data");
        });

        let out = tmp.path().join("fs");
        extract(&tarball, &out, false).unwrap();
        extract(&tarball, &out, false).unwrap();
        assert!(out.join("var/data").exists());
        assert!(out.join("var/link").symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_hard_link_before_target() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = write_tar(tmp.path(), "a.tar", |tar| {
            // Link first: real layer tarballs do this.
            append_link(tar, EntryType::Link, "usr/bin/perl", "usr/bin/perl5.40.1");
            append_file(tar, "usr/bin/perl5.40.1", b"perl-binary", 0o755);
        });

        let out = tmp.path().join("fs");
        extract(&tarball, &out, false).unwrap();

        use std::os::unix::fs::MetadataExt;
        let a = std::fs::metadata(out.join("usr/bin/perl")).unwrap();
        let b = std::fs::metadata(out.join("usr/bin/perl5.40.1")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn test_dangling_hard_link_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = write_tar(tmp.path(), "a.tar", |tar| {
            append_link(tar, EntryType::Link, "bin/gone", "bin/never-written");
        });

        let out = tmp.path().join("fs");
        extract(&tarball, &out, false).unwrap();
        assert!(out.join("bin/gone").symlink_metadata().is_err());
    }

    #[test]
    fn test_path_components_are_sanitized() {
        let target = Path::new("/fs");
        // `..` and `/` components are dropped, not resolved.
        assert_eq!(
            sanitized_path(target, Path::new("../../etc/passwd")),
            Path::new("/fs/etc/passwd")
        );
        assert_eq!(
            sanitized_path(target, Path::new("/absolute/name")),
            Path::new("/fs/absolute/name")
        );
        assert_eq!(
            sanitized_path(target, Path::new("./a/../b")),
            Path::new("/fs/a/b")
        );
    }
}
