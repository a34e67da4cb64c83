//! Filesystem helpers shared by the patch applier and the packager.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively copy a directory, preserving symlinks.
///
/// Unlike `fs::copy`, this handles nested directories and keeps symbolic
/// links as links. Existing files at the destination are overwritten, which
/// is what replacement trees rely on.
///
/// # Arguments
///
/// * `src` - Directory to copy from
/// * `dst` - Destination directory (created if it doesn't exist)
///
/// # Example
///
/// ```rust,ignore
/// use forkbuild::fsutil::copy_dir_recursive;
/// use std::path::Path;
///
/// copy_dir_recursive(
///     Path::new("patches/branding/qt__aqt__data"),
///     Path::new("work/source/qt/aqt/data"),
/// )?;
/// ```
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in
        fs::read_dir(src).with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }

    Ok(())
}

/// Move a directory by renaming, with fallback to copy+delete across
/// filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_recursive(src, dst).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), dst.display())
            })?;
            fs::remove_dir_all(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// SHA-256 of a single file, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

/// Digest over every path, file type, file content and symlink target under
/// `root`. Two trees with the same digest are byte-identical.
pub fn tree_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            hasher.update(b"L");
            let target = fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"D");
        } else {
            hasher.update(b"F");
            let bytes = fs::read(entry.path())
                .with_context(|| format!("reading '{}'", entry.path().display()))?;
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        hasher.update([0u8]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
