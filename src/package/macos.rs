//! macOS application bundle and disk image.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::{copy_payload, find_icon, launcher_script, write_executable};
use crate::build_config::AppInfo;
use crate::process::Cmd;

/// Lay out `<root>/<Name>.app/Contents/{MacOS,Resources,Info.plist}`.
///
/// The build output goes to `Resources/`; `MacOS/<binary>` is the launcher.
pub fn stage(app: &AppInfo, payload: &Path, root: &Path, version: &str) -> Result<()> {
    let contents = root.join(format!("{}.app", app.name)).join("Contents");
    let resources = contents.join("Resources");
    copy_payload(payload, &resources)?;
    write_executable(
        &contents.join("MacOS").join(&app.binary),
        &launcher_script(app, version, "../Resources"),
    )?;

    let icon_file = match find_icon(app, payload) {
        Some(icon) => {
            let name = format!("{}.icns", app.binary);
            fs::copy(&icon, resources.join(&name))
                .with_context(|| format!("copying icon '{}'", icon.display()))?;
            Some(name)
        }
        None => None,
    };
    fs::write(
        contents.join("Info.plist"),
        info_plist(app, version, icon_file.as_deref()),
    )
    .context("writing Info.plist")?;
    Ok(())
}

pub fn info_plist(app: &AppInfo, version: &str, icon_file: Option<&str>) -> String {
    let mut keys = vec![
        ("CFBundleName", app.name.clone()),
        ("CFBundleDisplayName", app.name.clone()),
        ("CFBundleIdentifier", app.id.clone()),
        ("CFBundleExecutable", app.binary.clone()),
        ("CFBundlePackageType", "APPL".to_string()),
        ("CFBundleVersion", version.to_string()),
        ("CFBundleShortVersionString", version.to_string()),
        ("LSMinimumSystemVersion", "11.0".to_string()),
        ("NSHighResolutionCapable", String::new()),
    ];
    if let Some(icon) = icon_file {
        keys.push(("CFBundleIconFile", icon.to_string()));
    }

    let mut plist = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
         \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
         <plist version=\"1.0\">\n<dict>\n",
    );
    for (key, value) in keys {
        plist.push_str(&format!("    <key>{key}</key>\n"));
        if key == "NSHighResolutionCapable" {
            plist.push_str("    <true/>\n");
        } else {
            plist.push_str(&format!("    <string>{}</string>\n", xml_escape(&value)));
        }
    }
    plist.push_str("</dict>\n</plist>\n");
    plist
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build `<stage_name>.dmg` with `hdiutil`.
pub fn build_dmg(app: &AppInfo, stage_name: &str, stage_root: &Path, dist: &Path) -> Result<PathBuf> {
    let out = dist.join(format!("{stage_name}.dmg"));
    Cmd::new("hdiutil")
        .args(["create", "-volname"])
        .arg(&app.name)
        .arg("-srcfolder")
        .arg_path(stage_root)
        .args(["-ov", "-format", "UDZO"])
        .arg_path(&out)
        .error_msg("hdiutil failed")
        .run()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::tests::{app, payload};
    use tempfile::TempDir;

    #[test]
    fn test_bundle_layout() {
        let temp = TempDir::new().unwrap();
        let payload = payload(&temp);
        let root = temp.path().join("stage");
        stage(&app(), &payload, &root, "23.12.1.1").unwrap();

        let contents = root.join("AnkiBlur.app/Contents");
        assert!(contents.join("MacOS/ankiblur").is_file());
        assert!(contents.join("Resources/aqt-23.12.1-py3-none-any.whl").is_file());
        assert!(contents.join("Resources/ankiblur.icns").is_file());

        let plist = fs::read_to_string(contents.join("Info.plist")).unwrap();
        assert!(plist.contains("<key>CFBundleIdentifier</key>\n    <string>net.ankiblur.AnkiBlur</string>"));
        assert!(plist.contains("<key>CFBundleIconFile</key>\n    <string>ankiblur.icns</string>"));
        assert!(plist.contains("<key>NSHighResolutionCapable</key>\n    <true/>"));
    }

    #[test]
    fn test_plist_escapes_values() {
        let mut app = app();
        app.name = "Blur & Co".to_string();
        let plist = info_plist(&app, "1.0.1", None);
        assert!(plist.contains("<string>Blur &amp; Co</string>"));
        assert!(!plist.contains("CFBundleIconFile"));
    }
}
