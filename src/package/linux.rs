//! Linux layout, `.deb` and AppImage.
//!
//! Staging tree:
//!
//! ```text
//! <binary>-<ver>-linux-<arch>/
//!   bin/<binary>                               launcher
//!   lib/                                       build output
//!   share/applications/<id>.desktop
//!   share/icons/hicolor/256x256/apps/<id>.png  when an icon is set
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{copy_payload, find_icon, launcher_script, write_executable};
use crate::build_config::AppInfo;
use crate::fsutil::copy_dir_recursive;
use crate::platform::Arch;
use crate::process::Cmd;

const ICON_DIR: &str = "share/icons/hicolor/256x256/apps";

pub fn stage(app: &AppInfo, payload: &Path, root: &Path, version: &str) -> Result<()> {
    copy_payload(payload, &root.join("lib"))?;
    write_executable(
        &root.join("bin").join(&app.binary),
        &launcher_script(app, version, "../lib"),
    )?;

    let applications = root.join("share/applications");
    fs::create_dir_all(&applications)?;
    fs::write(
        applications.join(format!("{}.desktop", app.id)),
        desktop_entry(app, &app.binary),
    )?;

    if let Some(icon) = find_icon(app, payload) {
        let icons = root.join(ICON_DIR);
        fs::create_dir_all(&icons)?;
        fs::copy(&icon, icons.join(format!("{}.png", app.id)))
            .with_context(|| format!("copying icon '{}'", icon.display()))?;
    }
    Ok(())
}

/// freedesktop.org desktop entry launching `exec`.
pub fn desktop_entry(app: &AppInfo, exec: &str) -> String {
    let comment = if app.description.is_empty() {
        &app.name
    } else {
        &app.description
    };
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={name}\n\
         Comment={comment}\n\
         Exec={exec} %f\n\
         Icon={id}\n\
         Terminal=false\n\
         Categories=Education;Languages;KDE;Qt;\n\
         StartupWMClass={binary}\n",
        name = app.name,
        id = app.id,
        binary = app.binary,
    )
}

/// Debian package name derived from the binary name.
fn deb_package_name(app: &AppInfo) -> String {
    app.binary.to_ascii_lowercase().replace('_', "-")
}

pub fn control_file(
    app: &AppInfo,
    dependencies: &[String],
    arch: Arch,
    version: &str,
    installed_size_kib: u64,
) -> String {
    let mut control = format!(
        "Package: {}\nVersion: {}\nSection: education\nPriority: optional\nArchitecture: {}\n",
        deb_package_name(app),
        version,
        arch.deb_name()
    );
    let maintainer = if app.maintainer.is_empty() {
        format!("{} maintainers", app.name)
    } else {
        app.maintainer.clone()
    };
    control.push_str(&format!("Maintainer: {maintainer}\n"));
    control.push_str(&format!("Installed-Size: {installed_size_kib}\n"));
    if !dependencies.is_empty() {
        control.push_str(&format!("Depends: {}\n", dependencies.join(", ")));
    }
    if !app.homepage.is_empty() {
        control.push_str(&format!("Homepage: {}\n", app.homepage));
    }
    let description = if app.description.is_empty() {
        &app.name
    } else {
        &app.description
    };
    control.push_str(&format!("Description: {description}\n"));
    control
}

fn tree_size_kib(root: &Path) -> Result<u64> {
    let mut bytes = 0u64;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        if entry.file_type().is_file() {
            bytes += entry
                .metadata()
                .with_context(|| format!("reading '{}'", entry.path().display()))?
                .len();
        }
    }
    Ok(bytes.div_ceil(1024))
}

/// Build `<package>_<version>_<debarch>.deb` with `dpkg-deb`.
///
/// The staged tree is installed under `/opt/<binary>` with a
/// `/usr/bin/<binary>` symlink and a system desktop entry.
pub fn build_deb(
    app: &AppInfo,
    dependencies: &[String],
    arch: Arch,
    version: &str,
    stage_root: &Path,
    staging: &Path,
    dist: &Path,
) -> Result<PathBuf> {
    let deb_root = staging.join("deb-root");
    let opt = deb_root.join("opt").join(&app.binary);
    copy_dir_recursive(stage_root, &opt)?;

    let usr_bin = deb_root.join("usr/bin");
    fs::create_dir_all(&usr_bin)?;
    #[cfg(unix)]
    std::os::unix::fs::symlink(
        format!("/opt/{0}/bin/{0}", app.binary),
        usr_bin.join(&app.binary),
    )
    .context("creating /usr/bin symlink")?;

    let applications = deb_root.join("usr/share/applications");
    fs::create_dir_all(&applications)?;
    fs::write(
        applications.join(format!("{}.desktop", app.id)),
        desktop_entry(app, &format!("/usr/bin/{}", app.binary)),
    )?;
    let staged_icon = stage_root.join(ICON_DIR).join(format!("{}.png", app.id));
    if staged_icon.is_file() {
        let icons = deb_root.join("usr").join(ICON_DIR);
        fs::create_dir_all(&icons)?;
        fs::copy(&staged_icon, icons.join(format!("{}.png", app.id)))?;
    }

    let debian = deb_root.join("DEBIAN");
    fs::create_dir_all(&debian)?;
    let size = tree_size_kib(&deb_root)?;
    fs::write(
        debian.join("control"),
        control_file(app, dependencies, arch, version, size),
    )?;

    let out = dist.join(format!(
        "{}_{}_{}.deb",
        deb_package_name(app),
        version,
        arch.deb_name()
    ));
    Cmd::new("dpkg-deb")
        .args(["--build", "--root-owner-group"])
        .arg_path(&deb_root)
        .arg_path(&out)
        .error_msg("dpkg-deb failed")
        .run()?;
    Ok(out)
}

/// Build `<Name>-<version>-<arch>.AppImage` with `appimagetool`.
pub fn build_appimage(
    app: &AppInfo,
    arch: Arch,
    version: &str,
    stage_root: &Path,
    staging: &Path,
    dist: &Path,
) -> Result<PathBuf> {
    let staged_icon = stage_root.join(ICON_DIR).join(format!("{}.png", app.id));
    if !staged_icon.is_file() {
        bail!("AppImage needs an icon; set app.icon in the build configuration");
    }

    let appdir = staging.join(format!("{}.AppDir", app.binary));
    copy_dir_recursive(stage_root, &appdir)?;
    write_executable(
        &appdir.join("AppRun"),
        &format!(
            "#!/bin/sh\nHERE=\"$(dirname \"$(readlink -f \"$0\")\")\"\nexec \"$HERE/bin/{}\" \"$@\"\n",
            app.binary
        ),
    )?;
    fs::write(
        appdir.join(format!("{}.desktop", app.id)),
        desktop_entry(app, &app.binary),
    )?;
    fs::copy(&staged_icon, appdir.join(format!("{}.png", app.id)))?;

    let out = dist.join(format!("{}-{}-{}.AppImage", app.name, version, arch));
    Cmd::new("appimagetool")
        .arg("--no-appstream")
        .arg_path(&appdir)
        .arg_path(&out)
        .env("ARCH", arch.as_str())
        .error_msg("appimagetool failed")
        .run()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::tests::{app, payload};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_installed_size_rounds_up_and_reports_walk_errors() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("opt/app")).unwrap();
        fs::write(temp.path().join("opt/app/a"), vec![0u8; 1500]).unwrap();
        fs::write(temp.path().join("opt/app/b"), vec![0u8; 600]).unwrap();
        assert_eq!(tree_size_kib(temp.path()).unwrap(), 3);

        assert!(tree_size_kib(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_stage_layout() {
        let temp = TempDir::new().unwrap();
        let payload = payload(&temp);
        let root = temp.path().join("stage");
        stage(&app(), &payload, &root, "23.12.1.1").unwrap();

        let launcher = root.join("bin/ankiblur");
        assert_eq!(
            fs::metadata(&launcher).unwrap().permissions().mode() & 0o777,
            0o755
        );
        assert!(root.join("lib/aqt-23.12.1-py3-none-any.whl").is_file());
        assert!(root
            .join("share/icons/hicolor/256x256/apps/net.ankiblur.AnkiBlur.png")
            .is_file());
        let desktop =
            fs::read_to_string(root.join("share/applications/net.ankiblur.AnkiBlur.desktop"))
                .unwrap();
        assert!(desktop.contains("Exec=ankiblur %f\n"));
        assert!(desktop.contains("Icon=net.ankiblur.AnkiBlur\n"));
    }

    #[test]
    fn test_control_file_fields() {
        let deps = vec!["libxcb-cursor0".to_string(), "libnss3".to_string()];
        let control = control_file(&app(), &deps, Arch::Aarch64, "23.12.1.2", 2048);
        assert!(control.starts_with("Package: ankiblur\nVersion: 23.12.1.2\n"));
        assert!(control.contains("Architecture: arm64\n"));
        assert!(control.contains("Depends: libxcb-cursor0, libnss3\n"));
        assert!(control.contains("Installed-Size: 2048\n"));
        assert!(control.ends_with("Description: Anki with a translucent background\n"));

        let mut bare = app();
        bare.maintainer.clear();
        bare.homepage.clear();
        let control = control_file(&bare, &[], Arch::X86_64, "1.0.1", 1);
        assert!(control.contains("Maintainer: AnkiBlur maintainers\n"));
        assert!(!control.contains("Depends:"));
        assert!(!control.contains("Homepage:"));
    }

    #[test]
    fn test_appimage_requires_icon() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("stage");
        fs::create_dir_all(&root).unwrap();
        let err = build_appimage(&app(), Arch::X86_64, "1.0.1", &root, temp.path(), temp.path())
            .unwrap_err();
        assert!(err.to_string().contains("icon"));
    }
}
