//! Archives built in-process, plus the checksum manifest.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::fsutil::sha256_file;
use crate::process::Cmd;

/// Name of the checksum manifest written next to the artifacts.
pub const CHECKSUMS_FILENAME: &str = "SHA256SUMS";

/// Two spaces between hash and name, as `sha256sum -c` expects.
const CHECKSUM_SEPARATOR: &str = "  ";

/// Pack `parent/<top>` into a gzip-compressed tarball at `out`.
pub fn create_tar_gz(parent: &Path, top: &str, out: &Path) -> Result<()> {
    let file = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    append_tree(&mut builder, parent, top)?;
    let encoder = builder
        .into_inner()
        .context("Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

/// Pack `parent/<top>` into a zstd-compressed tarball at `out`.
pub fn create_tar_zst(parent: &Path, top: &str, out: &Path) -> Result<()> {
    let file = File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let encoder = zstd::stream::Encoder::new(file, 19)?;
    let mut builder = tar::Builder::new(encoder);
    append_tree(&mut builder, parent, top)?;
    let encoder = builder
        .into_inner()
        .context("Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

/// Zip `parent/<top>` with the host `zip` tool.
pub fn create_zip(parent: &Path, top: &str, out: &Path) -> Result<()> {
    Cmd::new("zip")
        .args(["-r", "-q", "-y"])
        .arg_path(out)
        .arg(top)
        .current_dir(parent)
        .error_msg("zip failed")
        .run()?;
    Ok(())
}

/// Entries are added in sorted order with zeroed owners and mtimes, so the
/// same tree always yields the same archive.
fn append_tree<W: Write>(builder: &mut tar::Builder<W>, parent: &Path, top: &str) -> Result<()> {
    let root = parent.join(top);
    let mut entries = Vec::new();
    for entry in WalkDir::new(&root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        entries.push(entry.into_path());
    }
    entries.sort();

    for path in entries {
        let rel = path
            .strip_prefix(parent)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let md = fs::symlink_metadata(&path)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(mode_of(&md));

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&path)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder
                .append_data(&mut header, rel, &mut f)
                .with_context(|| format!("archiving '{}'", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn mode_of(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(md: &fs::Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Write `SHA256SUMS` in `dir` covering `artifacts`, sorted by file name.
pub fn write_checksums(dir: &Path, artifacts: &[PathBuf]) -> Result<PathBuf> {
    let mut lines = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let name = artifact
            .file_name()
            .with_context(|| format!("artifact '{}' has no file name", artifact.display()))?
            .to_string_lossy()
            .into_owned();
        lines.push((name, sha256_file(artifact)?));
    }
    lines.sort();

    let content: String = lines
        .iter()
        .map(|(name, hash)| format!("{hash}{CHECKSUM_SEPARATOR}{name}\n"))
        .collect();
    let path = dir.join(CHECKSUMS_FILENAME);
    fs::write(&path, content).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn staged(temp: &TempDir) -> PathBuf {
        let parent = temp.path().join("staging");
        let top = parent.join("app-1.0-linux-x86_64");
        fs::create_dir_all(top.join("bin")).unwrap();
        fs::write(top.join("bin/app"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(top.join("bin/app"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(top.join("README"), "hi").unwrap();
        std::os::unix::fs::symlink("bin/app", top.join("run")).unwrap();
        parent
    }

    #[test]
    fn test_missing_tree_fails_instead_of_empty_archive() {
        let temp = TempDir::new().unwrap();
        let parent = staged(&temp);
        let out = temp.path().join("app.tar.gz");

        let err = create_tar_gz(&parent, "not-staged", &out).unwrap_err();
        assert!(format!("{err:#}").contains("walking"));
    }

    #[test]
    fn test_tar_gz_keeps_top_level_and_modes() {
        let temp = TempDir::new().unwrap();
        let parent = staged(&temp);
        let out = temp.path().join("app.tar.gz");
        create_tar_gz(&parent, "app-1.0-linux-x86_64", &out).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&out).unwrap()));
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            if path.ends_with("bin/app") {
                assert_eq!(entry.header().mode().unwrap() & 0o777, 0o755);
            }
            if path.ends_with("/run") {
                assert_eq!(
                    entry.link_name().unwrap().unwrap().to_string_lossy(),
                    "bin/app"
                );
            }
            seen.push(path);
        }
        assert!(seen.iter().all(|p| p.starts_with("app-1.0-linux-x86_64")));
        assert!(seen.iter().any(|p| p.ends_with("README")));
    }

    #[test]
    fn test_archives_are_reproducible() {
        let temp = TempDir::new().unwrap();
        let parent = staged(&temp);
        let a = temp.path().join("a.tar.zst");
        let b = temp.path().join("b.tar.zst");
        create_tar_zst(&parent, "app-1.0-linux-x86_64", &a).unwrap();
        create_tar_zst(&parent, "app-1.0-linux-x86_64", &b).unwrap();
        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[test]
    fn test_checksum_manifest_format() {
        let temp = TempDir::new().unwrap();
        let b = temp.path().join("b.deb");
        let a = temp.path().join("a.tar.gz");
        fs::write(&b, "abc").unwrap();
        fs::write(&a, "").unwrap();

        let path = write_checksums(temp.path(), &[b, a]).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(
            text,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855  a.tar.gz\n\
             ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  b.deb\n"
        );
    }
}
