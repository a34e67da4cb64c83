//! Upstream source fetcher.
//!
//! Produces a fresh copy of the upstream tree at a tag, either by a shallow
//! git clone (with submodules) or by downloading the forge's source tarball.
//! Any previous copy at the destination is removed first.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{info, warn};

use crate::config::FetchMethod;
use crate::forge::ReleaseApi;
use crate::process::Cmd;

pub const GITHUB_URL: &str = "https://github.com";

#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub repository: &'a str,
    pub tag: &'a str,
    pub method: FetchMethod,
    pub dest: &'a Path,
    /// Files expected in a healthy checkout, relative to the tree root.
    pub markers: &'a [PathBuf],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
    pub dir: PathBuf,
    pub commit: Option<String>,
    pub missing_markers: Vec<PathBuf>,
}

/// What was fetched, kept in the work directory for the later stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStamp {
    pub upstream_tag: String,
    pub upstream_version: String,
    #[serde(default)]
    pub commit: Option<String>,
}

impl SourceStamp {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing source stamp")?;
        fs::write(path, json).with_context(|| format!("writing '{}'", path.display()))
    }

    /// `None` when nothing has been fetched yet.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
        let stamp = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing '{}'", path.display()))?;
        Ok(Some(stamp))
    }
}

/// Upstream tag for a version, adding the tag prefix unless already there.
pub fn tag_for_version(version: &str, prefix: &str) -> String {
    let version = version.trim();
    if version.starts_with(prefix) {
        version.to_string()
    } else {
        format!("{prefix}{version}")
    }
}

pub fn fetch_source(api: &dyn ReleaseApi, request: &FetchRequest<'_>) -> Result<FetchedSource> {
    if request.tag.trim().is_empty() {
        bail!("no upstream version to fetch; set UPSTREAM_VERSION or run 'check' first");
    }
    remove_existing(request.dest)?;
    if let Some(parent) = request.dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }

    let commit = match request.method {
        FetchMethod::Git => {
            let url = format!("{GITHUB_URL}/{}.git", request.repository);
            info!("cloning {} at {}", url, request.tag);
            Some(clone_at_tag(&url, request.tag, request.dest)?)
        }
        FetchMethod::Tarball => {
            let url = tarball_url(request.repository, request.tag);
            let archive = request.dest.with_extension("tar.gz");
            info!("downloading {}", url);
            download(&url, &archive)?;
            let embedded = extract_tarball(&archive, request.dest)?;
            fs::remove_file(&archive)
                .with_context(|| format!("removing '{}'", archive.display()))?;
            match embedded {
                Some(commit) => Some(commit),
                None => match api.commit_for_tag(request.repository, request.tag) {
                    Ok(commit) => Some(commit),
                    Err(e) => {
                        warn!("could not resolve commit for {}: {}", request.tag, e);
                        None
                    }
                },
            }
        }
    };

    let missing_markers = check_markers(request.dest, request.markers);
    if let Some(commit) = &commit {
        info!("upstream source at {} ({})", request.dest.display(), commit);
    }

    Ok(FetchedSource {
        dir: request.dest.to_path_buf(),
        commit,
        missing_markers,
    })
}

pub fn tarball_url(repository: &str, tag: &str) -> String {
    format!("{GITHUB_URL}/{repository}/archive/refs/tags/{tag}.tar.gz")
}

fn remove_existing(dest: &Path) -> Result<()> {
    if dest.exists() {
        info!("removing previous source tree {}", dest.display());
        fs::remove_dir_all(dest)
            .with_context(|| format!("removing existing source tree '{}'", dest.display()))?;
    }
    Ok(())
}

fn clone_at_tag(url: &str, tag: &str, dest: &Path) -> Result<String> {
    Cmd::new("git")
        .args(["clone", "--depth", "1", "--branch", tag])
        .args(["--recurse-submodules", "--shallow-submodules"])
        .arg(url)
        .arg_path(dest)
        .error_msg(format!("git clone of {url} at {tag} failed"))
        .run()?;

    let head = Cmd::new("git")
        .arg("-C")
        .arg_path(dest)
        .args(["rev-parse", "HEAD"])
        .error_msg("git rev-parse HEAD failed")
        .run()?;
    Ok(head.stdout.trim().to_string())
}

fn download(url: &str, target: &Path) -> Result<()> {
    let mut response = reqwest::blocking::Client::builder()
        .user_agent(concat!("forkbuild/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("creating HTTP client")?
        .get(url)
        .send()
        .with_context(|| format!("downloading {url}"))?;
    if !response.status().is_success() {
        bail!("downloading {} returned HTTP {}", url, response.status());
    }
    let mut file =
        File::create(target).with_context(|| format!("creating '{}'", target.display()))?;
    response
        .copy_to(&mut file)
        .with_context(|| format!("writing '{}'", target.display()))?;
    Ok(())
}

/// Unpack a gzip tarball into `dest`, dropping the archive's top-level
/// directory. Returns the commit id recorded in a pax global header, if any.
///
/// Entries with `..` or absolute paths, and entries that would land inside
/// a symlink unpacked earlier, are refused.
pub fn extract_tarball(archive_path: &Path, dest: &Path) -> Result<Option<String>> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening '{}'", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    fs::create_dir_all(dest).with_context(|| format!("creating '{}'", dest.display()))?;

    let mut commit = None;
    for entry in archive
        .entries()
        .with_context(|| format!("reading '{}'", archive_path.display()))?
    {
        let mut entry = entry?;
        if entry.header().entry_type() == EntryType::XGlobalHeader {
            let mut data = String::new();
            entry.read_to_string(&mut data)?;
            commit = parse_pax_comment(&data);
            continue;
        }

        let path = entry.path()?.into_owned();
        let Some(relative) = strip_first_component(&path)? else {
            continue;
        };
        let target = guard_target(dest, &relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("extracting '{}'", relative.display()))?;
    }
    Ok(commit)
}

fn strip_first_component(path: &Path) -> Result<Option<PathBuf>> {
    let mut components = path.components();
    components.next();
    let rest: PathBuf = components.collect();
    for component in rest.components() {
        if !matches!(component, Component::Normal(_) | Component::CurDir) {
            bail!("refusing archive entry outside the tree: '{}'", path.display());
        }
    }
    if rest.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(rest))
}

/// Join `relative` onto `dest`, refusing to pass through any symlink the
/// archive created earlier. An existing symlink at the target itself is
/// removed so the entry replaces it instead of writing through it.
fn guard_target(dest: &Path, relative: &Path) -> Result<PathBuf> {
    let mut current = dest.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        current.push(component);
        let Ok(meta) = fs::symlink_metadata(&current) else {
            continue;
        };
        if !meta.file_type().is_symlink() {
            continue;
        }
        if components.peek().is_some() {
            bail!(
                "refusing archive entry through symlink: '{}'",
                relative.display()
            );
        }
        fs::remove_file(&current)
            .with_context(|| format!("replacing symlink '{}'", current.display()))?;
    }
    Ok(current)
}

/// GitHub stores the tagged commit as `comment=<sha>` in the pax header.
fn parse_pax_comment(data: &str) -> Option<String> {
    data.lines()
        .filter_map(|line| line.split_once(' ').map(|(_, record)| record))
        .find_map(|record| record.strip_prefix("comment="))
        .map(|sha| sha.trim().to_string())
        .filter(|sha| !sha.is_empty())
}

/// Warn about expected files missing from a fetched tree.
pub fn check_markers(root: &Path, markers: &[PathBuf]) -> Vec<PathBuf> {
    let missing: Vec<PathBuf> = markers
        .iter()
        .filter(|marker| !root.join(marker).exists())
        .cloned()
        .collect();
    for marker in &missing {
        warn!(
            "expected file '{}' not found in {}",
            marker.display(),
            root.display()
        );
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::testing::FakeForge;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn append_file(builder: &mut Builder<GzEncoder<File>>, path: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn sample_tarball(path: &Path) {
        let file = File::create(path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

        let pax = b"52 comment=0123456789abcdef0123456789abcdef01234567\n";
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::XGlobalHeader);
        header.set_size(pax.len() as u64);
        header.set_path("pax_global_header").unwrap();
        header.set_cksum();
        builder.append(&header, &pax[..]).unwrap();

        append_file(&mut builder, "anki-23.12.1/tools/build", b"#!/bin/sh\n");
        append_file(&mut builder, "anki-23.12.1/qt/aqt/__init__.py", b"version = 1\n");
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_extract_strips_top_level_and_reads_commit() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("src.tar.gz");
        sample_tarball(&archive);

        let dest = temp.path().join("source");
        let commit = extract_tarball(&archive, &dest).unwrap();

        assert_eq!(
            commit.as_deref(),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
        assert!(dest.join("tools/build").is_file());
        assert_eq!(
            fs::read_to_string(dest.join("qt/aqt/__init__.py")).unwrap(),
            "version = 1\n"
        );
    }

    #[test]
    fn test_extract_refuses_writes_through_archive_symlink() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();

        let archive = temp.path().join("evil.tar.gz");
        let file = File::create(&archive).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder
            .append_link(&mut header, "top/link", &outside)
            .unwrap();
        append_file(&mut builder, "top/link/evil.txt", b"gotcha\n");
        builder.into_inner().unwrap().finish().unwrap();

        let dest = temp.path().join("source");
        let err = extract_tarball(&archive, &dest).unwrap_err();

        assert!(format!("{err:#}").contains("through symlink"));
        assert!(!outside.join("evil.txt").exists());
    }

    #[test]
    fn test_check_markers_reports_missing_only() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("tools")).unwrap();
        fs::write(temp.path().join("tools/build"), "").unwrap();

        let markers = vec![PathBuf::from("tools/build"), PathBuf::from("qt/aqt")];
        let missing = check_markers(temp.path(), &markers);
        assert_eq!(missing, vec![PathBuf::from("qt/aqt")]);
    }

    #[test]
    fn test_parse_pax_comment() {
        assert_eq!(
            parse_pax_comment("17 comment=abc\n20 mtime=12345\n").as_deref(),
            Some("abc")
        );
        assert_eq!(parse_pax_comment("20 mtime=12345\n"), None);
    }

    #[test]
    fn test_strip_first_component_rejects_traversal() {
        assert!(strip_first_component(Path::new("top/../../etc/passwd")).is_err());
        assert_eq!(strip_first_component(Path::new("top")).unwrap(), None);
        assert_eq!(
            strip_first_component(Path::new("top/a/b")).unwrap(),
            Some(PathBuf::from("a/b"))
        );
    }

    #[test]
    fn test_empty_tag_is_rejected_before_touching_dest() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("source");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("keep"), "x").unwrap();

        let request = FetchRequest {
            repository: "ankitects/anki",
            tag: "",
            method: FetchMethod::Git,
            dest: &dest,
            markers: &[],
        };
        assert!(fetch_source(&FakeForge::default(), &request).is_err());
        assert!(dest.join("keep").exists());
    }

    #[test]
    fn test_tag_for_version() {
        assert_eq!(tag_for_version("23.12.1", "v"), "v23.12.1");
        assert_eq!(tag_for_version("v23.12.1", "v"), "v23.12.1");
        assert_eq!(tag_for_version("23.12.1", ""), "23.12.1");
    }

    #[test]
    fn test_source_stamp_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("source-stamp.json");
        assert_eq!(SourceStamp::load(&path).unwrap(), None);

        let stamp = SourceStamp {
            upstream_tag: "23.12.1".to_string(),
            upstream_version: "23.12.1".to_string(),
            commit: Some("1a2b3c".to_string()),
        };
        stamp.save(&path).unwrap();
        assert_eq!(SourceStamp::load(&path).unwrap(), Some(stamp));
    }

    #[test]
    fn test_tarball_url() {
        assert_eq!(
            tarball_url("ankitects/anki", "23.12.1"),
            "https://github.com/ankitects/anki/archive/refs/tags/23.12.1.tar.gz"
        );
    }
}
