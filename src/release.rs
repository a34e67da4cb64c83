//! Publishing fork releases and reconciling the mapping table with them.
//!
//! A release is tagged `v<derived version>`. Its notes carry
//! `Upstream version:` and `Upstream commit:` lines, which is what
//! [`import_from_remote`] reads back when the local mapping table has to be
//! rebuilt from the forge.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::forge::{NewRelease, Release, ReleaseApi};
use crate::version::{VersionMapping, VersionRecord};
use crate::version::mapping::MappingLock;

/// Prefix of fork release tags.
pub const FORK_TAG_PREFIX: &str = "v";

const UPSTREAM_VERSION_LABEL: &str = "Upstream version:";
const UPSTREAM_COMMIT_LABEL: &str = "Upstream commit:";
const BUILD_DATE_LABEL: &str = "Build date:";
const PATCHES_HEADING: &str = "### Applied patches";
const NO_COMMIT: &str = "unknown";

pub fn release_tag(derived_version: &str) -> String {
    format!("{FORK_TAG_PREFIX}{derived_version}")
}

/// MIME type for an asset, from its file name.
pub fn content_type_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    let ends = |suffix: &str| lower.ends_with(suffix);
    if ends(".tar.gz") || ends(".tgz") {
        "application/gzip"
    } else if ends(".tar.zst") || ends(".zst") {
        "application/zstd"
    } else if ends(".zip") || ends(".whl") {
        "application/zip"
    } else if ends(".deb") {
        "application/vnd.debian.binary-package"
    } else if ends(".appimage") {
        "application/vnd.appimage"
    } else if ends(".dmg") {
        "application/x-apple-diskimage"
    } else if ends(".exe") {
        "application/vnd.microsoft.portable-executable"
    } else if ends(".json") {
        "application/json"
    } else if lower == "sha256sums" || ends(".txt") || ends(".sha256") {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

#[derive(Debug, Clone)]
pub struct ReleaseInfo<'a> {
    pub app_name: &'a str,
    pub derived_version: &'a str,
    pub upstream_repo: &'a str,
    pub upstream_version: &'a str,
    pub upstream_commit: Option<&'a str>,
    pub patches_applied: &'a [String],
    pub build_date: &'a str,
    pub changes_url: &'a str,
}

pub fn release_notes(info: &ReleaseInfo<'_>) -> String {
    let mut notes = format!(
        "## {} {}\n\nBuilt from {} {}.\n\n",
        info.app_name, info.derived_version, info.upstream_repo, info.upstream_version
    );
    notes.push_str(&format!("{UPSTREAM_VERSION_LABEL} {}\n", info.upstream_version));
    notes.push_str(&format!(
        "{UPSTREAM_COMMIT_LABEL} {}\n",
        info.upstream_commit.unwrap_or(NO_COMMIT)
    ));
    notes.push_str(&format!("{BUILD_DATE_LABEL} {}\n\n", info.build_date));

    notes.push_str(PATCHES_HEADING);
    notes.push('\n');
    if info.patches_applied.is_empty() {
        notes.push_str("- none\n");
    }
    for patch in info.patches_applied {
        notes.push_str(&format!("- {patch}\n"));
    }

    if !info.changes_url.is_empty() {
        notes.push_str(&format!("\n### Upstream changes\n{}\n", info.changes_url));
    }
    notes
}

/// Fields recovered from release notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedNotes {
    pub upstream_version: Option<String>,
    pub upstream_commit: Option<String>,
    pub build_date: Option<String>,
    pub patches_applied: Vec<String>,
}

pub fn parse_release_notes(body: &str) -> ParsedNotes {
    let mut parsed = ParsedNotes::default();
    let mut in_patches = false;
    for line in body.lines().map(str::trim) {
        let value = |label: &str| {
            line.strip_prefix(label)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        if let Some(v) = value(UPSTREAM_VERSION_LABEL) {
            parsed.upstream_version = Some(v);
        } else if let Some(v) = value(UPSTREAM_COMMIT_LABEL) {
            parsed.upstream_commit = Some(v).filter(|c| c != NO_COMMIT);
        } else if let Some(v) = value(BUILD_DATE_LABEL) {
            parsed.build_date = Some(v);
        } else if line == PATCHES_HEADING {
            in_patches = true;
        } else if in_patches {
            match line.strip_prefix("- ") {
                Some("none") => {}
                Some(patch) => parsed.patches_applied.push(patch.to_string()),
                None if line.is_empty() => {}
                None => in_patches = false,
            }
        }
    }
    parsed
}

#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    /// Fork repository, `owner/name`.
    pub repo: &'a str,
    pub info: ReleaseInfo<'a>,
    pub artifacts: &'a [PathBuf],
    pub mapping_file: &'a Path,
}

#[derive(Debug, Clone)]
pub struct PublishReport {
    pub release: Release,
    /// The tag already had a release; nothing was created or uploaded.
    pub skipped_existing: bool,
    pub uploaded: Vec<String>,
    /// `(asset name, error)` for every upload that failed.
    pub failed: Vec<(String, String)>,
    /// Set when the release went out but the mapping could not be updated.
    pub mapping_error: Option<String>,
}

/// Create the release, upload the artifacts and record the mapping.
///
/// An existing release for the tag is left alone. Failing to create the
/// release is fatal; a failed upload is logged and the rest still go up.
/// Once the release exists, a mapping write failure is reported in
/// [`PublishReport::mapping_error`] rather than returned.
pub fn publish(api: &dyn ReleaseApi, request: &PublishRequest<'_>) -> Result<PublishReport> {
    if request.artifacts.is_empty() {
        bail!("no artifacts to publish; run 'package' first");
    }
    let info = &request.info;
    let tag = release_tag(info.derived_version);

    let existing = api
        .release_by_tag(request.repo, &tag)
        .with_context(|| format!("looking up release {} in {}", tag, request.repo))?;
    if let Some(release) = existing {
        info!("release {} already exists ({}); skipping", tag, release.html_url);
        return Ok(PublishReport {
            release,
            skipped_existing: true,
            uploaded: Vec::new(),
            failed: Vec::new(),
            mapping_error: None,
        });
    }

    let notes = release_notes(info);
    let new_release = NewRelease {
        tag_name: tag.clone(),
        target_commitish: None,
        name: format!("{} {}", info.app_name, info.derived_version),
        body: notes.clone(),
        draft: false,
        prerelease: false,
    };
    let release = api
        .create_release(request.repo, &new_release)
        .with_context(|| format!("creating release {} in {}", tag, request.repo))?;
    info!("created release {} ({})", tag, release.html_url);

    let mut uploaded = Vec::new();
    let mut failed = Vec::new();
    for artifact in request.artifacts {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact.display().to_string());
        let data = match fs::read(artifact) {
            Ok(data) => data,
            Err(e) => {
                warn!("skipping {}: {}", artifact.display(), e);
                failed.push((name, e.to_string()));
                continue;
            }
        };
        let content_type = content_type_for(&name);
        debug!("uploading {} ({}, {} bytes)", name, content_type, data.len());
        match api.upload_asset(&release, &name, content_type, data) {
            Ok(asset) => {
                info!("uploaded {}", asset.name);
                uploaded.push(name);
            }
            Err(e) => {
                warn!("failed to upload {}: {}", name, e);
                failed.push((name, e.to_string()));
            }
        }
    }
    if !failed.is_empty() {
        warn!(
            "{} of {} assets failed to upload",
            failed.len(),
            request.artifacts.len()
        );
    }

    let mapping_error = VersionMapping::append_record(
        request.mapping_file,
        VersionRecord {
            derived_version: info.derived_version.to_string(),
            upstream_version: info.upstream_version.to_string(),
            upstream_commit: info.upstream_commit.map(str::to_string),
            build_date: info.build_date.to_string(),
            patches_applied: info.patches_applied.to_vec(),
            release_notes: notes,
        },
    )
    .with_context(|| format!("recording {} in the version mapping", info.derived_version))
    .err()
    .map(|e| {
        warn!("release {} is published but {:#}", tag, e);
        format!("{e:#}")
    });

    Ok(PublishReport {
        release,
        skipped_existing: false,
        uploaded,
        failed,
        mapping_error,
    })
}

/// Current time as an RFC 3339 build date.
pub fn build_date_now() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting build date")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Derived versions added or rewritten locally.
    pub updated: Vec<String>,
    /// Tags whose notes carry no upstream version.
    pub skipped: Vec<String>,
}

/// Rebuild mapping records from the fork's published releases.
///
/// Remote state wins: a local record that differs from what the release
/// notes say is overwritten. Drafts are ignored.
pub fn import_from_remote(
    api: &dyn ReleaseApi,
    repo: &str,
    mapping_file: &Path,
) -> Result<ImportReport> {
    let releases = api
        .list_releases(repo)
        .with_context(|| format!("listing releases of {repo}"))?;

    let _lock = MappingLock::acquire(mapping_file)?;
    let mut mapping = VersionMapping::load(mapping_file)?;
    let mut report = ImportReport::default();

    for release in releases.iter().filter(|r| !r.draft) {
        let derived = release
            .tag_name
            .strip_prefix(FORK_TAG_PREFIX)
            .unwrap_or(&release.tag_name);
        let body = release.body.clone().unwrap_or_default();
        let parsed = parse_release_notes(&body);
        let Some(upstream_version) = parsed.upstream_version else {
            debug!("release {} has no upstream version line", release.tag_name);
            report.skipped.push(release.tag_name.clone());
            continue;
        };

        let record = VersionRecord {
            derived_version: derived.to_string(),
            upstream_version,
            upstream_commit: parsed.upstream_commit,
            build_date: parsed
                .build_date
                .or_else(|| release.published_at.clone())
                .unwrap_or_default(),
            patches_applied: parsed.patches_applied,
            release_notes: body,
        };
        if mapping.reconcile(record) {
            info!("reconciled {} from {}", derived, release.tag_name);
            report.updated.push(derived.to_string());
        }
    }

    if !report.updated.is_empty() {
        mapping.save(mapping_file)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::testing::FakeForge;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn patches() -> Vec<String> {
        vec![
            "branding/0001-name.patch".to_string(),
            "addon/qt__aqt__addons__blur_theme".to_string(),
        ]
    }

    fn info(patches: &[String]) -> ReleaseInfo<'_> {
        ReleaseInfo {
            app_name: "AnkiBlur",
            derived_version: "23.12.1.1",
            upstream_repo: "ankitects/anki",
            upstream_version: "23.12.1",
            upstream_commit: Some("1a2b3c4d"),
            patches_applied: patches,
            build_date: "2026-10-16T08:00:00Z",
            changes_url: "https://github.com/ankitects/anki/releases/tag/23.12.1",
        }
    }

    fn artifacts(temp: &TempDir, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = temp.path().join(name);
                fs::write(&path, name.as_bytes()).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("a-1.0-linux-x86_64.tar.gz"), "application/gzip");
        assert_eq!(content_type_for("a-1.0-linux-x86_64.tar.zst"), "application/zstd");
        assert_eq!(content_type_for("a_1.0_amd64.deb"), "application/vnd.debian.binary-package");
        assert_eq!(content_type_for("AnkiBlur-1.0-x86_64.AppImage"), "application/vnd.appimage");
        assert_eq!(content_type_for("a.dmg"), "application/x-apple-diskimage");
        assert_eq!(content_type_for("aqt-1.0-py3-none-any.whl"), "application/zip");
        assert_eq!(content_type_for("SHA256SUMS"), "text/plain");
        assert_eq!(content_type_for("blob.bin"), "application/octet-stream");
    }

    #[test]
    fn test_notes_round_trip_through_parser() {
        let patches = patches();
        let notes = release_notes(&info(&patches));
        assert!(notes.contains("Upstream version: 23.12.1\n"));
        assert!(notes.contains("Upstream commit: 1a2b3c4d\n"));

        let parsed = parse_release_notes(&notes);
        assert_eq!(parsed.upstream_version.as_deref(), Some("23.12.1"));
        assert_eq!(parsed.upstream_commit.as_deref(), Some("1a2b3c4d"));
        assert_eq!(parsed.build_date.as_deref(), Some("2026-10-16T08:00:00Z"));
        assert_eq!(parsed.patches_applied, patches);

        let mut bare = info(&[]);
        bare.upstream_commit = None;
        let parsed = parse_release_notes(&release_notes(&bare));
        assert_eq!(parsed.upstream_commit, None);
        assert!(parsed.patches_applied.is_empty());
    }

    #[test]
    fn test_existing_tag_skips_create_and_uploads() {
        let temp = TempDir::new().unwrap();
        let forge = FakeForge::default();
        forge
            .releases
            .borrow_mut()
            .push(FakeForge::release(7, "v23.12.1.1", "old notes"));
        let files = artifacts(&temp, &["a.tar.gz"]);
        let mapping_file = temp.path().join("mapping.json");
        let patches = patches();

        let report = publish(
            &forge,
            &PublishRequest {
                repo: "ankiblur/ankiblur",
                info: info(&patches),
                artifacts: &files,
                mapping_file: &mapping_file,
            },
        )
        .unwrap();

        assert!(report.skipped_existing);
        assert_eq!(report.release.id, 7);
        assert_eq!(*forge.create_calls.borrow(), 0);
        assert!(forge.uploaded.borrow().is_empty());
        assert_eq!(*forge.lookups.borrow(), vec!["v23.12.1.1".to_string()]);
        assert!(!mapping_file.exists());
    }

    #[test]
    fn test_one_failed_upload_still_publishes() {
        let temp = TempDir::new().unwrap();
        let forge = FakeForge {
            failing_assets: HashSet::from(["b.deb".to_string()]),
            ..Default::default()
        };
        let files = artifacts(&temp, &["a.tar.gz", "b.deb", "SHA256SUMS"]);
        let mapping_file = temp.path().join("mapping.json");
        let patches = patches();

        let report = publish(
            &forge,
            &PublishRequest {
                repo: "ankiblur/ankiblur",
                info: info(&patches),
                artifacts: &files,
                mapping_file: &mapping_file,
            },
        )
        .unwrap();

        assert!(!report.skipped_existing);
        assert_eq!(*forge.create_calls.borrow(), 1);
        assert_eq!(report.uploaded, vec!["a.tar.gz", "SHA256SUMS"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b.deb");
        assert_eq!(
            *forge.uploaded.borrow(),
            vec![
                ("a.tar.gz".to_string(), "application/gzip".to_string(), 8),
                ("SHA256SUMS".to_string(), "text/plain".to_string(), 10),
            ]
        );

        let mapping = VersionMapping::load(&mapping_file).unwrap();
        let record = mapping.get("23.12.1.1").unwrap();
        assert_eq!(record.upstream_version, "23.12.1");
        assert_eq!(record.upstream_commit.as_deref(), Some("1a2b3c4d"));
        assert_eq!(record.patches_applied, patches);
        assert!(report.mapping_error.is_none());
    }

    #[test]
    fn test_mapping_conflict_still_reports_published() {
        let temp = TempDir::new().unwrap();
        let forge = FakeForge::default();
        let files = artifacts(&temp, &["a.tar.gz"]);
        let mapping_file = temp.path().join("mapping.json");
        VersionMapping::append_record(
            &mapping_file,
            VersionRecord {
                derived_version: "23.12.1.1".to_string(),
                upstream_version: "23.12.1".to_string(),
                upstream_commit: None,
                build_date: "2024-01-01T00:00:00Z".to_string(),
                patches_applied: Vec::new(),
                release_notes: String::new(),
            },
        )
        .unwrap();
        let patches = patches();

        let report = publish(
            &forge,
            &PublishRequest {
                repo: "ankiblur/ankiblur",
                info: info(&patches),
                artifacts: &files,
                mapping_file: &mapping_file,
            },
        )
        .unwrap();

        assert!(!report.skipped_existing);
        assert_eq!(*forge.create_calls.borrow(), 1);
        assert_eq!(report.uploaded, vec!["a.tar.gz"]);
        let error = report.mapping_error.unwrap();
        assert!(error.contains("23.12.1.1"), "{error}");

        let mapping = VersionMapping::load(&mapping_file).unwrap();
        assert_eq!(mapping.get("23.12.1.1").unwrap().build_date, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_create_failure_is_fatal() {
        let temp = TempDir::new().unwrap();
        let forge = FakeForge {
            fail_create: true,
            ..Default::default()
        };
        let files = artifacts(&temp, &["a.tar.gz"]);
        let mapping_file = temp.path().join("mapping.json");
        let patches = patches();

        let err = publish(
            &forge,
            &PublishRequest {
                repo: "ankiblur/ankiblur",
                info: info(&patches),
                artifacts: &files,
                mapping_file: &mapping_file,
            },
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("422"));
        assert!(forge.uploaded.borrow().is_empty());
        assert!(!mapping_file.exists());
    }

    #[test]
    fn test_import_reconciles_from_release_notes() {
        let temp = TempDir::new().unwrap();
        let mapping_file = temp.path().join("mapping.json");
        let patches = patches();
        let good_notes = release_notes(&info(&patches));

        let mut local = VersionMapping::default();
        local
            .insert(VersionRecord {
                derived_version: "23.12.1.1".to_string(),
                upstream_version: "23.10".to_string(),
                upstream_commit: None,
                build_date: "2026-01-01T00:00:00Z".to_string(),
                patches_applied: vec![],
                release_notes: String::new(),
            })
            .unwrap();
        local.save(&mapping_file).unwrap();

        let forge = FakeForge::default();
        {
            let mut releases = forge.releases.borrow_mut();
            releases.push(FakeForge::release(1, "v23.12.1.1", &good_notes));
            releases.push(FakeForge::release(
                2,
                "v24.04.1",
                "Upstream version: 24.04\nUpstream commit: unknown\n",
            ));
            releases.push(FakeForge::release(3, "v0.1", "hand-written notes"));
            let mut draft = FakeForge::release(4, "v25.1", "Upstream version: 25");
            draft.draft = true;
            releases.push(draft);
        }

        let report = import_from_remote(&forge, "ankiblur/ankiblur", &mapping_file).unwrap();
        assert_eq!(report.updated, vec!["23.12.1.1", "24.04.1"]);
        assert_eq!(report.skipped, vec!["v0.1"]);

        let mapping = VersionMapping::load(&mapping_file).unwrap();
        assert_eq!(mapping.len(), 2);
        let record = mapping.get("23.12.1.1").unwrap();
        assert_eq!(record.upstream_version, "23.12.1");
        assert_eq!(record.patches_applied, patches);
        assert_eq!(mapping.get("24.04.1").unwrap().upstream_commit, None);

        // A second import finds nothing to change.
        let again = import_from_remote(&forge, "ankiblur/ankiblur", &mapping_file).unwrap();
        assert!(again.updated.is_empty());
    }
}
