//! Turns build output into distributable artifacts.
//!
//! Each platform first gets a staging tree with the platform's layout
//! (`linux`, `macos`, `windows`). The requested formats are then produced
//! from that tree. `tar.gz` is built in-process and is always available;
//! every other format shells out to its packaging tool. A format whose tool
//! is missing, or which makes no sense for the platform, degrades to the
//! plain tarball with a warning.
//!
//! All artifacts land in the dist directory together with a `SHA256SUMS`
//! manifest.

pub mod archive;
pub mod linux;
pub mod macos;
pub mod windows;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::build_config::{AppInfo, PackageFormat, PlatformConfig};
use crate::fsutil::copy_dir_recursive;
use crate::platform::{Arch, Platform};
use crate::preflight::command_exists;

/// Scratch directory inside dist; removed once packaging finishes.
const STAGING_DIRNAME: &str = ".staging";

#[derive(Debug, Clone)]
pub struct PackageRequest<'a> {
    pub app: &'a AppInfo,
    pub platform_config: &'a PlatformConfig,
    pub platform: Platform,
    pub arch: Arch,
    pub version: &'a str,
    /// Build output to ship.
    pub payload: &'a Path,
    pub dist: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    pub artifacts: Vec<PathBuf>,
    pub checksums: PathBuf,
    /// Formats that were requested but could not be produced.
    pub degraded: Vec<PackageFormat>,
}

/// `<binary>-<version>-<platform>-<arch>`, the top-level directory name of
/// every archive.
pub fn stage_name(app: &AppInfo, version: &str, platform: Platform, arch: Arch) -> String {
    format!("{}-{}-{}-{}", app.binary, version, platform, arch)
}

/// External tool a format needs, if any.
pub fn required_tool(format: PackageFormat) -> Option<&'static str> {
    match format {
        PackageFormat::TarGz | PackageFormat::TarZst => None,
        PackageFormat::Zip => Some("zip"),
        PackageFormat::Deb => Some("dpkg-deb"),
        PackageFormat::AppImage => Some("appimagetool"),
        PackageFormat::Dmg => Some("hdiutil"),
        PackageFormat::Exe => Some("makensis"),
    }
}

pub fn supports(platform: Platform, format: PackageFormat) -> bool {
    match format {
        PackageFormat::TarGz | PackageFormat::TarZst | PackageFormat::Zip => true,
        PackageFormat::Deb | PackageFormat::AppImage => platform == Platform::Linux,
        PackageFormat::Dmg => platform == Platform::Macos,
        PackageFormat::Exe => platform == Platform::Windows,
    }
}

/// Decide which formats to produce.
///
/// Returns the formats to build and the requested ones that were dropped.
/// The list to build is never empty: any drop, or an empty request, adds
/// `tar.gz`.
pub fn plan_formats(
    platform: Platform,
    requested: &[PackageFormat],
    tool_available: &dyn Fn(&str) -> bool,
) -> (Vec<PackageFormat>, Vec<PackageFormat>) {
    let mut planned = Vec::new();
    let mut degraded = Vec::new();

    for &format in requested {
        if planned.contains(&format) || degraded.contains(&format) {
            continue;
        }
        if !supports(platform, format) {
            warn!("{format} packages cannot be built for {platform}; falling back to tar.gz");
            degraded.push(format);
            continue;
        }
        if let Some(tool) = required_tool(format) {
            if !tool_available(tool) {
                warn!("'{tool}' not found; {format} package skipped, falling back to tar.gz");
                degraded.push(format);
                continue;
            }
        }
        planned.push(format);
    }

    if (planned.is_empty() || !degraded.is_empty()) && !planned.contains(&PackageFormat::TarGz) {
        planned.insert(0, PackageFormat::TarGz);
    }
    (planned, degraded)
}

pub fn package(request: &PackageRequest<'_>) -> Result<PackageReport> {
    package_with(request, &command_exists)
}

/// [`package`] with an injectable host tool lookup.
pub fn package_with(
    request: &PackageRequest<'_>,
    tool_available: &dyn Fn(&str) -> bool,
) -> Result<PackageReport> {
    let payload = request.payload;
    let has_payload = payload.is_dir()
        && fs::read_dir(payload)
            .with_context(|| format!("reading '{}'", payload.display()))?
            .next()
            .is_some();
    if !has_payload {
        bail!(
            "build output '{}' is missing or empty; run 'build' first",
            payload.display()
        );
    }

    let (formats, degraded) = plan_formats(
        request.platform,
        &request.platform_config.package_formats,
        tool_available,
    );

    if request.dist.exists() {
        fs::remove_dir_all(request.dist)
            .with_context(|| format!("cleaning '{}'", request.dist.display()))?;
    }
    let staging = request.dist.join(STAGING_DIRNAME);
    fs::create_dir_all(&staging)
        .with_context(|| format!("creating '{}'", staging.display()))?;

    let app = request.app;
    let name = stage_name(app, request.version, request.platform, request.arch);
    let stage_root = staging.join(&name);
    info!("staging {} layout in {}", request.platform, stage_root.display());
    match request.platform {
        Platform::Linux => linux::stage(app, payload, &stage_root, request.version)?,
        Platform::Macos => macos::stage(app, payload, &stage_root, request.version)?,
        Platform::Windows => windows::stage(app, payload, &stage_root)?,
    }

    let mut artifacts = Vec::with_capacity(formats.len());
    for format in formats {
        let out = match format {
            PackageFormat::TarGz => {
                let out = request.dist.join(format!("{name}.tar.gz"));
                archive::create_tar_gz(&staging, &name, &out)?;
                out
            }
            PackageFormat::TarZst => {
                let out = request.dist.join(format!("{name}.tar.zst"));
                archive::create_tar_zst(&staging, &name, &out)?;
                out
            }
            PackageFormat::Zip => {
                let out = request.dist.join(format!("{name}.zip"));
                archive::create_zip(&staging, &name, &out)?;
                out
            }
            PackageFormat::Deb => linux::build_deb(
                app,
                &request.platform_config.dependencies,
                request.arch,
                request.version,
                &stage_root,
                &staging,
                request.dist,
            )?,
            PackageFormat::AppImage => linux::build_appimage(
                app,
                request.arch,
                request.version,
                &stage_root,
                &staging,
                request.dist,
            )?,
            PackageFormat::Dmg => macos::build_dmg(app, &name, &stage_root, request.dist)?,
            PackageFormat::Exe => {
                windows::build_installer(app, request.version, &name, &staging, request.dist)?
            }
        };
        info!("packaged {}", out.display());
        artifacts.push(out);
    }

    fs::remove_dir_all(&staging)
        .with_context(|| format!("removing staging dir '{}'", staging.display()))?;
    let checksums = archive::write_checksums(request.dist, &artifacts)?;

    Ok(PackageReport {
        artifacts,
        checksums,
        degraded,
    })
}

/// Release artifacts in `dist`: every regular file except the checksum
/// manifest and hidden files, sorted by name.
pub fn list_artifacts(dist: &Path) -> Result<Vec<PathBuf>> {
    if !dist.is_dir() {
        bail!("dist directory '{}' not found; run 'package' first", dist.display());
    }
    let mut artifacts = Vec::new();
    for entry in fs::read_dir(dist).with_context(|| format!("reading '{}'", dist.display()))? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if path.is_file() && !name.starts_with('.') && name != archive::CHECKSUMS_FILENAME {
            artifacts.push(path);
        }
    }
    artifacts.sort();
    Ok(artifacts)
}

/// Copy the build output into `dest`.
fn copy_payload(payload: &Path, dest: &Path) -> Result<()> {
    copy_dir_recursive(payload, dest)
        .with_context(|| format!("copying build output into '{}'", dest.display()))
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Icon from the build output, if the app declares one and it exists.
fn find_icon(app: &AppInfo, payload: &Path) -> Option<PathBuf> {
    let icon = payload.join(app.icon.as_deref()?);
    if icon.is_file() {
        Some(icon)
    } else {
        warn!("icon '{}' not found in build output", icon.display());
        None
    }
}

/// POSIX launcher. Runs a native binary from the payload when there is one,
/// otherwise installs the payload's wheels into a per-version venv.
fn launcher_script(app: &AppInfo, version: &str, payload_rel: &str) -> String {
    let binary = &app.binary;
    format!(
        r#"#!/bin/sh
# {name} {version}
set -e
SELF="$(readlink -f "$0" 2>/dev/null || echo "$0")"
HERE="$(cd "$(dirname "$SELF")" && pwd)"
PAYLOAD="$HERE/{payload_rel}"
if [ -x "$PAYLOAD/{binary}" ]; then
    exec "$PAYLOAD/{binary}" "$@"
fi
DATA="${{XDG_DATA_HOME:-$HOME/.local/share}}/{binary}/{version}"
if [ ! -x "$DATA/venv/bin/{binary}" ]; then
    python3 -m venv "$DATA/venv"
    "$DATA/venv/bin/pip" install --quiet --no-index "$PAYLOAD"/*.whl
fi
exec "$DATA/venv/bin/{binary}" "$@"
"#,
        name = app.name,
    )
}
