use anyhow::{Context as _, Result};
use time::OffsetDateTime;
use tracing::{info, warn};

use forkbuild::builder::{run_build, BuildOutput, BuildRequest};
use forkbuild::fetch::{fetch_source, tag_for_version, FetchRequest, SourceStamp, GITHUB_URL};
use forkbuild::outputs::StepOutputs;
use forkbuild::package::archive::CHECKSUMS_FILENAME;
use forkbuild::package::{list_artifacts, package, PackageReport, PackageRequest};
use forkbuild::patch::{GnuPatch, PatchApplier, PatchContext, PatchReport};
use forkbuild::preflight::{check_required_tools, PATCH_TOOLS};
use forkbuild::release::{
    build_date_now, publish, release_tag, PublishReport, PublishRequest, ReleaseInfo,
};
use forkbuild::version::resolver::{strip_tag_prefix, RECHECK_WINDOW};
use forkbuild::version::{resolve, CheckMarker, Decision, ResolveRequest, VersionMapping};

use super::context::{Context, Versions};

/// Decide whether a new fork release is due and report it as step outputs.
///
/// Returns `None` when the recent-check marker says to skip this run.
pub(crate) fn check(ctx: &Context, force: bool) -> Result<Option<Decision>> {
    let settings = &ctx.settings;
    let force = force || ctx.env.force_rebuild;
    let marker = CheckMarker::new(&settings.check_marker);
    let now = OffsetDateTime::now_utc();

    if !force && marker.checked_within(now, RECHECK_WINDOW) {
        info!("checked upstream within the last {}; skipping", RECHECK_WINDOW);
        let mut outputs = StepOutputs::new();
        outputs.set("new_release", false);
        outputs.set("needs_review", false);
        outputs.emit(ctx.env.github_output.as_deref())?;
        return Ok(None);
    }

    let decision = resolve_decision(ctx, force)?;
    decision.to_outputs().emit(ctx.env.github_output.as_deref())?;
    marker.mark(now)?;
    Ok(Some(decision))
}

fn resolve_decision(ctx: &Context, force: bool) -> Result<Decision> {
    let settings = &ctx.settings;
    let client = ctx.client()?;
    let mapping = VersionMapping::load(&settings.mapping_file)?;
    resolve(
        &client,
        &mapping,
        &ResolveRequest {
            upstream_repo: &settings.upstream.repository,
            tag_prefix: &settings.upstream.tag_prefix,
            upstream_override: ctx.env.upstream_version.as_deref(),
            derived_override: ctx.env.derived_version.as_deref(),
            force,
        },
    )
}

fn fetch(ctx: &Context, tag: &str) -> Result<SourceStamp> {
    let settings = &ctx.settings;
    let client = ctx.client()?;
    let fetched = fetch_source(
        &client,
        &FetchRequest {
            repository: &settings.upstream.repository,
            tag,
            method: settings.upstream.fetch,
            dest: &settings.paths.source,
            markers: &settings.upstream.markers,
        },
    )?;

    let stamp = SourceStamp {
        upstream_tag: tag.to_string(),
        upstream_version: strip_tag_prefix(tag, &settings.upstream.tag_prefix).to_string(),
        commit: fetched.commit,
    };
    stamp.save(&settings.paths.source_stamp)?;

    let mut outputs = StepOutputs::new();
    outputs.set("upstream_tag", &stamp.upstream_tag);
    outputs.set("upstream_commit", stamp.commit.as_deref().unwrap_or(""));
    outputs.emit(ctx.env.github_output.as_deref())?;
    Ok(stamp)
}

pub(crate) fn fetch_cmd(ctx: &Context, tag: Option<&str>) -> Result<()> {
    let tag = match (tag, &ctx.env.upstream_version) {
        (Some(tag), _) => tag.to_string(),
        (None, Some(version)) => tag_for_version(version, &ctx.settings.upstream.tag_prefix),
        (None, None) => {
            anyhow::bail!("no upstream tag; pass --tag, set UPSTREAM_VERSION or run 'check'")
        }
    };
    fetch(ctx, &tag).map(|_| ())
}

fn patch(ctx: &Context, versions: &Versions) -> Result<PatchReport> {
    let settings = &ctx.settings;
    if ctx.env.skip_patches {
        warn!("SKIP_PATCHES set; building the unmodified upstream tree");
        let report = PatchReport::default();
        report.save(&settings.paths.patch_report)?;
        return Ok(report);
    }

    check_required_tools(PATCH_TOOLS)?;
    let patch_ctx = PatchContext {
        app_name: settings.fork.app_name.clone(),
        derived_version: versions.derived_version.clone(),
        upstream_version: versions.upstream_version.clone(),
        upstream_commit: versions.upstream_commit.clone().unwrap_or_default(),
    };
    let tool = GnuPatch;
    let mut applier = PatchApplier::new(&tool, &settings.patches);
    let report = applier.run(&settings.paths.source, &settings.paths.backup, &patch_ctx)?;
    report.save(&settings.paths.patch_report)?;
    Ok(report)
}

pub(crate) fn patch_cmd(ctx: &Context) -> Result<()> {
    patch(ctx, &ctx.versions()?).map(|_| ())
}

fn build(ctx: &Context, versions: &Versions) -> Result<BuildOutput> {
    let settings = &ctx.settings;
    let build_config = ctx.build_config()?;
    let platform = ctx.env.platform();
    let platform_config = build_config.platform(platform);
    run_build(&BuildRequest {
        source: &settings.paths.source,
        build_root: &settings.paths.build_root,
        output_dir: &settings.paths.build_output,
        command: &settings.build.command,
        output_subdir: &settings.build.output_subdir,
        platform,
        arch: ctx.env.arch(),
        derived_version: &versions.derived_version,
        upstream_version: &versions.upstream_version,
        extra_tools: &platform_config.build_tools,
    })
}

pub(crate) fn build_cmd(ctx: &Context) -> Result<()> {
    build(ctx, &ctx.versions()?).map(|_| ())
}

fn package_stage(ctx: &Context, versions: &Versions) -> Result<PackageReport> {
    let settings = &ctx.settings;
    let build_config = ctx.build_config()?;
    let platform = ctx.env.platform();
    let platform_config = build_config.platform(platform);
    let report = package(&PackageRequest {
        app: &build_config.app,
        platform_config: &platform_config,
        platform,
        arch: ctx.env.arch(),
        version: &versions.derived_version,
        payload: &settings.paths.build_output,
        dist: &settings.paths.dist,
    })?;

    for artifact in &report.artifacts {
        println!("  {}", artifact.display());
    }
    if !report.degraded.is_empty() {
        let skipped: Vec<String> = report.degraded.iter().map(|f| f.to_string()).collect();
        warn!("not produced: {}", skipped.join(", "));
    }
    Ok(report)
}

pub(crate) fn package_cmd(ctx: &Context) -> Result<()> {
    package_stage(ctx, &ctx.versions()?).map(|_| ())
}

fn publish_stage(ctx: &Context, versions: &Versions) -> Result<PublishReport> {
    let settings = &ctx.settings;
    let repo = ctx.fork_repository()?;
    let client = ctx.client()?;
    if !client.has_token() {
        warn!("GITHUB_TOKEN is not set; creating a release will be refused");
    }

    let mut artifacts = list_artifacts(&settings.paths.dist)?;
    let checksums = settings.paths.dist.join(CHECKSUMS_FILENAME);
    if checksums.is_file() {
        artifacts.push(checksums);
    }
    let patches = PatchReport::load(&settings.paths.patch_report)?.applied;
    let build_date = build_date_now()?;
    let changes_url = format!(
        "{GITHUB_URL}/{}/releases/tag/{}",
        settings.upstream.repository, versions.upstream_tag
    );

    let report = publish(
        &client,
        &PublishRequest {
            repo: &repo,
            info: ReleaseInfo {
                app_name: &settings.fork.app_name,
                derived_version: &versions.derived_version,
                upstream_repo: &settings.upstream.repository,
                upstream_version: &versions.upstream_version,
                upstream_commit: versions.upstream_commit.as_deref(),
                patches_applied: &patches,
                build_date: &build_date,
                changes_url: &changes_url,
            },
            artifacts: &artifacts,
            mapping_file: &settings.mapping_file,
        },
    )?;

    let mut outputs = StepOutputs::new();
    outputs.set("release_url", &report.release.html_url);
    outputs.set("release_skipped", report.skipped_existing);
    outputs.set("failed_uploads", report.failed.len());
    let recorded = !report.skipped_existing && report.mapping_error.is_none();
    outputs.set("mapping_recorded", recorded);
    outputs.emit(ctx.env.github_output.as_deref())?;
    Ok(report)
}

pub(crate) fn publish_cmd(ctx: &Context) -> Result<()> {
    publish_stage(ctx, &ctx.versions()?).map(|_| ())
}

/// Every stage in one process, strictly in order.
pub(crate) fn run_all(ctx: &Context, force: bool) -> Result<()> {
    let decision = resolve_decision(ctx, force || ctx.env.force_rebuild)?;
    decision.to_outputs().emit(ctx.env.github_output.as_deref())?;
    if !decision.build_needed {
        if decision.needs_review {
            info!(
                "upstream {} needs review before building; rerun with --force to build it",
                decision.upstream_tag
            );
        } else {
            info!("nothing to build");
        }
        return Ok(());
    }

    let stamp = fetch(ctx, &decision.upstream_tag).context("fetch stage")?;
    let versions = Versions {
        upstream_tag: stamp.upstream_tag,
        upstream_version: stamp.upstream_version,
        derived_version: decision.derived_version,
        upstream_commit: ctx.env.upstream_commit.clone().or(stamp.commit),
    };

    patch(ctx, &versions).context("patch stage")?;
    build(ctx, &versions).context("build stage")?;
    package_stage(ctx, &versions).context("package stage")?;
    let report = publish_stage(ctx, &versions).context("publish stage")?;

    if report.skipped_existing {
        println!(
            "Release {} already existed; nothing uploaded",
            release_tag(&versions.derived_version)
        );
    } else {
        println!(
            "Published {} {} ({} assets, {} failed)",
            ctx.settings.fork.app_name,
            versions.derived_version,
            report.uploaded.len(),
            report.failed.len()
        );
        if report.mapping_error.is_some() {
            println!("Version mapping not updated; run 'mapping import' to resync");
        }
    }
    Ok(())
}
