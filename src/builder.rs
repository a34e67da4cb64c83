//! Drives the upstream project's own build entry point.
//!
//! This module contains no build logic of its own. It picks the host
//! prerequisites for the target platform, runs the configured command inside
//! the patched tree, and collects whatever the upstream build produced.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use walkdir::WalkDir;

use crate::platform::{Arch, Platform};
use crate::preflight::check_required_tools;
use crate::process::Cmd;

/// Lines shown from each log file when a build fails.
const LOG_TAIL_LINES: usize = 40;

#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub source: &'a Path,
    pub build_root: &'a Path,
    pub output_dir: &'a Path,
    pub command: &'a [String],
    /// Where the upstream build leaves its artifacts, relative to `source`.
    pub output_subdir: &'a Path,
    pub platform: Platform,
    pub arch: Arch,
    pub derived_version: &'a str,
    pub upstream_version: &'a str,
    /// Extra host tools from the build configuration.
    pub extra_tools: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub artifacts: Vec<PathBuf>,
}

/// Toolchain each platform's upstream build assumes, as (command, package).
pub fn platform_prerequisites(platform: Platform) -> &'static [(&'static str, &'static str)] {
    match platform {
        Platform::Linux => &[("cargo", "rustup"), ("python3", "python3"), ("git", "git")],
        Platform::Macos => &[
            ("cargo", "rustup"),
            ("python3", "python3"),
            ("xcrun", "Xcode command line tools"),
        ],
        Platform::Windows => &[("cargo", "rustup"), ("python", "python.org installer")],
    }
}

pub fn check_prerequisites(platform: Platform, extra_tools: &[String]) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = platform_prerequisites(platform).to_vec();
    for tool in extra_tools {
        if !tools.iter().any(|(t, _)| t == tool) {
            tools.push((tool.as_str(), tool.as_str()));
        }
    }
    check_required_tools(&tools)
        .with_context(|| format!("checking {platform} build prerequisites"))
}

/// Relative programs like `./tools/build` resolve against the source tree.
fn resolve_program(source: &Path, program: &str) -> String {
    let path = Path::new(program);
    if path.is_relative() && program.contains('/') {
        source.join(path).display().to_string()
    } else {
        program.to_string()
    }
}

/// Run the upstream build and collect what it produced.
///
/// The build and output directories are cleared first. On failure the tail
/// of every `*.log` under the build root is printed before the error is
/// returned. Artifacts come from `output_dir` when the build wrote there,
/// otherwise from `<source>/<output_subdir>`.
pub fn run_build(request: &BuildRequest<'_>) -> Result<BuildOutput> {
    if !request.source.is_dir() {
        bail!(
            "source tree '{}' not found; run 'fetch' and 'patch' first",
            request.source.display()
        );
    }
    let Some((program, args)) = request.command.split_first() else {
        bail!("no build command configured");
    };
    check_prerequisites(request.platform, request.extra_tools)?;

    for dir in [request.build_root, request.output_dir] {
        if dir.exists() {
            fs::remove_dir_all(dir).with_context(|| format!("cleaning '{}'", dir.display()))?;
        }
        fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
    }

    info!(
        "building {} for {}-{} with {}",
        request.derived_version,
        request.platform,
        request.arch,
        request.command.join(" ")
    );
    let result = Cmd::new(resolve_program(request.source, program))
        .args(args)
        .current_dir(request.source)
        .env("FORKBUILD_PLATFORM", request.platform.as_str())
        .env("FORKBUILD_ARCH", request.arch.as_str())
        .env("BUILD_ROOT", request.build_root)
        .env("FORKBUILD_OUTPUT", request.output_dir)
        .env("DERIVED_VERSION", request.derived_version)
        .env("UPSTREAM_VERSION", request.upstream_version)
        .env("RELEASE", "1")
        .error_msg("upstream build failed")
        .run_interactive();

    if let Err(e) = result {
        dump_logs(&[request.build_root, &request.source.join("out")]);
        return Err(e);
    }

    let artifacts = collect_artifacts(
        &request.source.join(request.output_subdir),
        request.output_dir,
    )?;
    if artifacts.is_empty() {
        bail!(
            "build finished but produced no artifacts in '{}' or '{}'",
            request.output_dir.display(),
            request.source.join(request.output_subdir).display()
        );
    }
    for artifact in &artifacts {
        info!("built {}", artifact.display());
    }
    Ok(BuildOutput { artifacts })
}

/// Files already in `output_dir`, or else files copied there from `harvest_dir`.
fn collect_artifacts(harvest_dir: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut existing = list_files(output_dir)?;
    if !existing.is_empty() {
        existing.sort();
        return Ok(existing);
    }

    let mut artifacts = Vec::new();
    for file in list_files(harvest_dir)? {
        let Some(name) = file.file_name() else {
            continue;
        };
        let target = output_dir.join(name);
        fs::copy(&file, &target)
            .with_context(|| format!("copying '{}' to '{}'", file.display(), target.display()))?;
        artifacts.push(target);
    }
    artifacts.sort();
    Ok(artifacts)
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// Last lines of every `*.log` under the given directories.
pub fn log_tails(dirs: &[&Path], lines: usize) -> Vec<(PathBuf, String)> {
    let mut tails = Vec::new();
    for dir in dirs {
        let logs = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"));
        for log in logs {
            let Ok(file) = fs::File::open(log.path()) else {
                continue;
            };
            let mut tail = VecDeque::with_capacity(lines);
            for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
                if tail.len() == lines {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tails.push((log.path().to_path_buf(), Vec::from(tail).join("\n")));
        }
    }
    tails
}

fn dump_logs(dirs: &[&Path]) {
    for (path, tail) in log_tails(dirs, LOG_TAIL_LINES) {
        error!("---- {} (last {} lines) ----\n{}", path.display(), LOG_TAIL_LINES, tail);
    }
}
