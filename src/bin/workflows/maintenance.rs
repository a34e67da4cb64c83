use anyhow::{bail, Result};

use forkbuild::builder::check_prerequisites;
use forkbuild::config::FetchMethod;
use forkbuild::package::{plan_formats, required_tool};
use forkbuild::preflight::{check_required_tools, command_exists, FETCH_TOOLS, PATCH_TOOLS};
use forkbuild::release::import_from_remote;
use forkbuild::version::VersionMapping;

use super::context::Context;

/// Check the host for every stage and report all problems at once.
pub(crate) fn preflight(ctx: &Context) -> Result<()> {
    let platform = ctx.env.platform();
    let build_config = ctx.build_config()?;
    let platform_config = build_config.platform(platform);
    println!("Preflight for {}-{}", platform, ctx.env.arch());

    let mut failures = Vec::new();
    let mut report = |stage: &str, result: Result<()>| match result {
        Ok(()) => println!("  [ok]   {stage}"),
        Err(e) => {
            println!("  [FAIL] {stage}");
            failures.push(format!("{stage}: {e:#}"));
        }
    };

    if ctx.settings.upstream.fetch == FetchMethod::Git {
        report("fetch", check_required_tools(FETCH_TOOLS));
    } else {
        report("fetch", Ok(()));
    }
    report("patch", check_required_tools(PATCH_TOOLS));
    report(
        "build",
        check_prerequisites(platform, &platform_config.build_tools),
    );

    let (planned, degraded) =
        plan_formats(platform, &platform_config.package_formats, &command_exists);
    for format in &planned {
        println!("  [ok]   package {format}");
    }
    for format in &degraded {
        let tool = required_tool(*format).unwrap_or("-");
        println!("  [warn] package {format} (needs '{tool}'; tar.gz used instead)");
    }

    if !failures.is_empty() {
        bail!("preflight failed:\n{}", failures.join("\n"));
    }
    println!("All required host tools present.");
    Ok(())
}

pub(crate) fn mapping_list(ctx: &Context) -> Result<()> {
    let mapping = VersionMapping::load(&ctx.settings.mapping_file)?;
    if mapping.is_empty() {
        println!("No versions recorded in {}", ctx.settings.mapping_file.display());
        return Ok(());
    }

    println!("{:<16} {:<12} {:<12} {}", "DERIVED", "UPSTREAM", "COMMIT", "BUILT");
    for record in mapping.records() {
        let commit = record.upstream_commit.as_deref().unwrap_or("-");
        let short = commit.get(..10).unwrap_or(commit);
        println!(
            "{:<16} {:<12} {:<12} {}",
            record.derived_version, record.upstream_version, short, record.build_date
        );
    }
    Ok(())
}

pub(crate) fn mapping_import(ctx: &Context) -> Result<()> {
    let repo = ctx.fork_repository()?;
    let client = ctx.client()?;
    let report = import_from_remote(&client, &repo, &ctx.settings.mapping_file)?;

    for derived in &report.updated {
        println!("  updated {derived}");
    }
    for tag in &report.skipped {
        println!("  skipped {tag} (no upstream version in notes)");
    }
    println!(
        "Imported {} records from {} into {}",
        report.updated.len(),
        repo,
        ctx.settings.mapping_file.display()
    );
    Ok(())
}
