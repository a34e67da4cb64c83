//! Windows layout and NSIS installer.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::copy_payload;
use crate::build_config::AppInfo;
use crate::process::Cmd;

/// Build output goes straight into the staging root.
pub fn stage(_app: &AppInfo, payload: &Path, root: &Path) -> Result<()> {
    copy_payload(payload, root)
}

/// NSIS script installing `source_dir` under Program Files.
pub fn nsis_script(app: &AppInfo, version: &str, source_dir: &str, out_file: &Path) -> String {
    let name = &app.name;
    let exe = format!("{}.exe", app.binary);
    let uninstall_key = format!(
        "Software\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\{}",
        app.id
    );
    format!(
        r#"Unicode true
RequestExecutionLevel admin
SetCompressor /SOLID lzma

Name "{name} {version}"
OutFile "{out}"
InstallDir "$PROGRAMFILES64\{name}"
InstallDirRegKey HKLM "Software\{name}" "InstallDir"

Page directory
Page instfiles
UninstPage uninstConfirm
UninstPage instfiles

Section "Install"
    SetOutPath "$INSTDIR"
    File /r "{source_dir}\*.*"
    WriteRegStr HKLM "Software\{name}" "InstallDir" "$INSTDIR"
    WriteRegStr HKLM "{uninstall_key}" "DisplayName" "{name}"
    WriteRegStr HKLM "{uninstall_key}" "DisplayVersion" "{version}"
    WriteRegStr HKLM "{uninstall_key}" "Publisher" "{publisher}"
    WriteRegStr HKLM "{uninstall_key}" "UninstallString" "$INSTDIR\uninstall.exe"
    CreateShortCut "$SMPROGRAMS\{name}.lnk" "$INSTDIR\{exe}"
    WriteUninstaller "$INSTDIR\uninstall.exe"
SectionEnd

Section "Uninstall"
    Delete "$SMPROGRAMS\{name}.lnk"
    RMDir /r "$INSTDIR"
    DeleteRegKey HKLM "{uninstall_key}"
    DeleteRegKey HKLM "Software\{name}"
SectionEnd
"#,
        out = out_file.display(),
        publisher = if app.maintainer.is_empty() {
            name.as_str()
        } else {
            app.maintainer.as_str()
        },
    )
}

/// Write `installer.nsi` next to the staged tree and compile it with
/// `makensis` into `<stage_name>-setup.exe`.
pub fn build_installer(
    app: &AppInfo,
    version: &str,
    stage_name: &str,
    staging: &Path,
    dist: &Path,
) -> Result<PathBuf> {
    let out = dist.join(format!("{stage_name}-setup.exe"));
    let script = staging.join("installer.nsi");
    fs::write(&script, nsis_script(app, version, stage_name, &out))
        .with_context(|| format!("writing '{}'", script.display()))?;

    Cmd::new("makensis")
        .arg("-V2")
        .arg_path(&script)
        .current_dir(staging)
        .error_msg("makensis failed")
        .run()?;
    Ok(out)
}
