//! Upstream release check and derived-version computation.
//!
//! A derived version is the upstream version with its tag prefix removed and
//! a patch counter appended: the first fork build of `v23.12.1` is
//! `23.12.1.1`, the next `23.12.1.2`. The counter is one past the highest
//! counter already recorded for the same upstream version.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use super::mapping::VersionMapping;
use crate::fetch::tag_for_version;
use crate::forge::{Release, ReleaseApi};
use crate::outputs::StepOutputs;

/// Checks closer together than this are skipped unless forced.
pub const RECHECK_WINDOW: Duration = Duration::hours(2);

#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    pub upstream_repo: &'a str,
    pub tag_prefix: &'a str,
    /// Pin the upstream tag instead of asking for the latest release.
    pub upstream_override: Option<&'a str>,
    /// Use this derived version verbatim.
    pub derived_override: Option<&'a str>,
    pub force: bool,
}

/// Outcome of a version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub upstream_tag: String,
    /// Tag with the prefix stripped.
    pub upstream_version: String,
    pub derived_version: String,
    pub already_built: bool,
    pub build_needed: bool,
    pub deploy_needed: bool,
    /// Release was held back for a human to look at.
    pub needs_review: bool,
    pub changes_url: String,
}

impl Decision {
    pub fn to_outputs(&self) -> StepOutputs {
        let mut outputs = StepOutputs::new();
        outputs.set("new_release", self.build_needed);
        outputs.set("build_needed", self.build_needed);
        outputs.set("deploy_needed", self.deploy_needed);
        outputs.set("needs_review", self.needs_review);
        outputs.set("upstream_version", &self.upstream_version);
        outputs.set("upstream_tag", &self.upstream_tag);
        outputs.set("derived_version", &self.derived_version);
        outputs.set("changes_url", &self.changes_url);
        outputs
    }
}

pub fn strip_tag_prefix<'a>(tag: &'a str, prefix: &str) -> &'a str {
    let tag = tag.trim();
    if prefix.is_empty() {
        return tag;
    }
    tag.strip_prefix(prefix).unwrap_or(tag)
}

/// Next derived version for a base upstream version.
pub fn next_derived_version(mapping: &VersionMapping, base: &str) -> String {
    let counter = mapping.highest_counter(base).unwrap_or(0) + 1;
    format!("{base}.{counter}")
}

/// Pre-releases and four-component hotfix tags are not built automatically.
pub fn is_significant(release: &Release) -> bool {
    if release.prerelease {
        return false;
    }
    release.tag_name.matches('.').count() <= 2
}

/// Decide whether the latest upstream release should be built.
///
/// # Arguments
///
/// * `api` - Forge queried for the latest release; untouched when the
///   request pins an upstream version
/// * `mapping` - Versions already published, used for the already-built
///   rule and the next counter
/// * `request` - Upstream repository, tag prefix, overrides and `force`
///
/// A pinned version is normalised to a tag with the configured prefix, so
/// the decision names the same tag `fetch` would.
///
/// # Errors
///
/// Fails when the forge cannot be reached or returns an empty tag.
pub fn resolve(
    api: &dyn ReleaseApi,
    mapping: &VersionMapping,
    request: &ResolveRequest<'_>,
) -> Result<Decision> {
    let (tag, significant, changes_url) = match request.upstream_override {
        Some(tag) => {
            info!("using pinned upstream version {}", tag);
            (tag_for_version(tag, request.tag_prefix), true, String::new())
        }
        None => {
            let release = api
                .latest_release(request.upstream_repo)
                .with_context(|| {
                    format!(
                        "querying latest release of '{}'",
                        request.upstream_repo
                    )
                })?;
            info!("latest upstream release: {}", release.tag_name);
            (
                release.tag_name.trim().to_string(),
                is_significant(&release),
                release.html_url.clone(),
            )
        }
    };

    if tag.is_empty() {
        bail!(
            "upstream '{}' returned a release without a tag",
            request.upstream_repo
        );
    }
    let base = strip_tag_prefix(&tag, request.tag_prefix).to_string();
    if base.is_empty() {
        bail!("upstream tag '{}' is only the prefix '{}'", tag, request.tag_prefix);
    }

    let already_built = mapping.contains_upstream(&base);
    let existing = mapping
        .latest_for_upstream(&base)
        .map(|r| r.derived_version.clone());

    let (derived, build_needed, needs_review) = if already_built && !request.force {
        info!("upstream {} already built; nothing to do", base);
        (existing.unwrap_or_else(|| next_derived_version(mapping, &base)), false, false)
    } else if !significant && !request.force {
        info!("upstream {} looks minor; holding for review", tag);
        (next_derived_version(mapping, &base), false, true)
    } else {
        if already_built {
            info!("upstream {} already built; rebuilding (forced)", base);
        }
        (next_derived_version(mapping, &base), true, false)
    };

    let derived_version = match request.derived_override {
        Some(version) => version.trim().to_string(),
        None => derived,
    };
    debug!("derived version {}", derived_version);

    Ok(Decision {
        upstream_tag: tag,
        upstream_version: base,
        derived_version,
        already_built,
        build_needed,
        deploy_needed: build_needed,
        needs_review,
        changes_url,
    })
}

/// Timestamp file recording when the last check completed.
#[derive(Debug, Clone)]
pub struct CheckMarker {
    path: PathBuf,
}

impl CheckMarker {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Unreadable or malformed markers count as "not checked".
    pub fn last_check(&self) -> Option<OffsetDateTime> {
        let text = fs::read_to_string(&self.path).ok()?;
        OffsetDateTime::parse(text.trim(), &Rfc3339).ok()
    }

    pub fn checked_within(&self, now: OffsetDateTime, window: Duration) -> bool {
        match self.last_check() {
            Some(last) => now - last < window && last <= now,
            None => false,
        }
    }

    pub fn mark(&self, now: OffsetDateTime) -> Result<()> {
        let stamp = now.format(&Rfc3339).context("formatting check timestamp")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
        fs::write(&self.path, stamp)
            .with_context(|| format!("writing check marker '{}'", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::testing::FakeForge;
    use crate::version::mapping::VersionRecord;
    use tempfile::TempDir;

    fn request(force: bool) -> ResolveRequest<'static> {
        ResolveRequest {
            upstream_repo: "ankitects/anki",
            tag_prefix: "v",
            upstream_override: None,
            derived_override: None,
            force,
        }
    }

    fn forge_with_latest(tag: &str) -> FakeForge {
        let forge = FakeForge::default();
        *forge.latest.borrow_mut() = Some(FakeForge::release(1, tag, "notes"));
        forge
    }

    fn record(derived: &str, upstream: &str) -> VersionRecord {
        VersionRecord {
            derived_version: derived.to_string(),
            upstream_version: upstream.to_string(),
            upstream_commit: None,
            build_date: "2024-01-01T00:00:00Z".to_string(),
            patches_applied: Vec::new(),
            release_notes: String::new(),
        }
    }

    #[test]
    fn test_first_build_gets_counter_one() {
        let forge = forge_with_latest("v23.12.1");
        let decision = resolve(&forge, &VersionMapping::default(), &request(false)).unwrap();
        assert_eq!(decision.upstream_version, "23.12.1");
        assert_eq!(decision.derived_version, "23.12.1.1");
        assert!(decision.build_needed);
        assert!(decision.deploy_needed);
        assert!(!decision.needs_review);
    }

    #[test]
    fn test_forced_rebuild_increments_counter() {
        let forge = forge_with_latest("v23.12.1");
        let mut mapping = VersionMapping::default();
        mapping.insert(record("23.12.1.1", "23.12.1")).unwrap();

        let decision = resolve(&forge, &mapping, &request(true)).unwrap();
        assert_eq!(decision.derived_version, "23.12.1.2");
        assert!(decision.build_needed);
        assert!(decision.already_built);
    }

    #[test]
    fn test_rerun_without_force_does_not_increment() {
        let forge = forge_with_latest("v23.12.1");
        let mut mapping = VersionMapping::default();
        mapping.insert(record("23.12.1.1", "23.12.1")).unwrap();

        let first = resolve(&forge, &mapping, &request(false)).unwrap();
        let second = resolve(&forge, &mapping, &request(false)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.derived_version, "23.12.1.1");
        assert!(!first.build_needed);
        assert!(!first.deploy_needed);
    }

    #[test]
    fn test_prerelease_and_hotfix_tags_need_review() {
        let forge = FakeForge::default();
        let mut pre = FakeForge::release(1, "v24.06.0b1", "");
        pre.prerelease = true;
        *forge.latest.borrow_mut() = Some(pre);
        let decision = resolve(&forge, &VersionMapping::default(), &request(false)).unwrap();
        assert!(decision.needs_review);
        assert!(!decision.build_needed);

        let forge = forge_with_latest("2.1.66.1");
        let decision = resolve(&forge, &VersionMapping::default(), &request(false)).unwrap();
        assert!(decision.needs_review);

        let decision = resolve(&forge, &VersionMapping::default(), &request(true)).unwrap();
        assert!(decision.build_needed);
        assert!(!decision.needs_review);
    }

    #[test]
    fn test_override_skips_api_and_honours_derived() {
        let forge = FakeForge::default();
        let req = ResolveRequest {
            upstream_override: Some("v24.04"),
            derived_override: Some("24.04.9"),
            ..request(false)
        };
        let decision = resolve(&forge, &VersionMapping::default(), &req).unwrap();
        assert_eq!(decision.upstream_version, "24.04");
        assert_eq!(decision.derived_version, "24.04.9");
    }

    #[test]
    fn test_pinned_version_gets_the_tag_prefix() {
        let forge = FakeForge::default();
        let req = ResolveRequest {
            upstream_override: Some("23.12.1"),
            ..request(false)
        };
        let decision = resolve(&forge, &VersionMapping::default(), &req).unwrap();
        assert_eq!(decision.upstream_tag, "v23.12.1");
        assert_eq!(decision.upstream_version, "23.12.1");
        assert_eq!(
            decision.upstream_tag,
            tag_for_version("23.12.1", req.tag_prefix)
        );
    }

    #[test]
    fn test_unreachable_api_fails() {
        let forge = FakeForge::default();
        assert!(resolve(&forge, &VersionMapping::default(), &request(false)).is_err());
    }

    #[test]
    fn test_empty_tag_fails() {
        let forge = forge_with_latest("   ");
        assert!(resolve(&forge, &VersionMapping::default(), &request(false)).is_err());
    }

    #[test]
    fn test_outputs_reflect_decision() {
        let forge = forge_with_latest("v23.12.1");
        let decision = resolve(&forge, &VersionMapping::default(), &request(false)).unwrap();
        let outputs = decision.to_outputs();
        assert_eq!(outputs.get("build_needed"), Some("true"));
        assert_eq!(outputs.get("derived_version"), Some("23.12.1.1"));
        assert_eq!(
            outputs.get("changes_url"),
            Some("https://example.test/releases/v23.12.1")
        );
    }

    #[test]
    fn test_check_marker_window() {
        let temp = TempDir::new().unwrap();
        let marker = CheckMarker::new(&temp.path().join(".last-check"));
        let now = OffsetDateTime::now_utc();

        assert!(!marker.checked_within(now, RECHECK_WINDOW));
        marker.mark(now - Duration::minutes(30)).unwrap();
        assert!(marker.checked_within(now, RECHECK_WINDOW));
        marker.mark(now - Duration::hours(3)).unwrap();
        assert!(!marker.checked_within(now, RECHECK_WINDOW));

        fs::write(temp.path().join(".last-check"), "garbage").unwrap();
        assert!(!marker.checked_within(now, RECHECK_WINDOW));
    }
}
