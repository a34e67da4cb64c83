//! Static per-platform build configuration (JSON, read-only).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::platform::Platform;

/// Distributable formats the packager can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum PackageFormat {
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "tar.zst")]
    TarZst,
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "deb")]
    Deb,
    #[serde(rename = "appimage")]
    AppImage,
    #[serde(rename = "dmg")]
    Dmg,
    #[serde(rename = "exe")]
    Exe,
}

impl fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageFormat::TarGz => "tar.gz",
            PackageFormat::TarZst => "tar.zst",
            PackageFormat::Zip => "zip",
            PackageFormat::Deb => "deb",
            PackageFormat::AppImage => "appimage",
            PackageFormat::Dmg => "dmg",
            PackageFormat::Exe => "exe",
        };
        f.write_str(name)
    }
}

/// Identity of the forked application.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppInfo {
    pub name: String,
    /// Reverse-DNS identifier, used for the macOS bundle and desktop entry.
    pub id: String,
    /// Executable name inside the payload.
    pub binary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub maintainer: String,
    #[serde(default)]
    pub homepage: String,
    /// Icon file relative to the build output, if any.
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    #[serde(default)]
    pub package_formats: Vec<PackageFormat>,
    /// Runtime package dependencies (e.g. deb `Depends:`).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Host tools the upstream build expects on this platform.
    #[serde(default)]
    pub build_tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    pub app: AppInfo,
    #[serde(default)]
    pub platforms: BTreeMap<Platform, PlatformConfig>,
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading build configuration '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing build configuration '{}'", path.display()))
    }

    /// Settings for a platform; an absent entry means a plain archive only.
    pub fn platform(&self, platform: Platform) -> PlatformConfig {
        self.platforms.get(&platform).cloned().unwrap_or_else(|| PlatformConfig {
            package_formats: vec![PackageFormat::TarGz],
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
  "app": {
    "name": "AnkiBlur",
    "id": "net.ankiblur.AnkiBlur",
    "binary": "ankiblur",
    "description": "Anki with a translucent background"
  },
  "platforms": {
    "linux": {
      "package_formats": ["tar.gz", "deb", "appimage"],
      "dependencies": ["libxcb-cursor0"],
      "build_tools": ["cargo", "python3"]
    },
    "macos": { "package_formats": ["dmg"] }
  }
}"#;

    #[test]
    fn test_load_build_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build-config.json");
        fs::write(&path, SAMPLE).unwrap();

        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.app.binary, "ankiblur");
        let linux = config.platform(Platform::Linux);
        assert_eq!(
            linux.package_formats,
            vec![PackageFormat::TarGz, PackageFormat::Deb, PackageFormat::AppImage]
        );
        assert_eq!(linux.build_tools, vec!["cargo", "python3"]);
        assert!(config.platform(Platform::Macos).dependencies.is_empty());
    }

    #[test]
    fn test_missing_platform_defaults_to_tarball() {
        let config: BuildConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(
            config.platform(Platform::Windows).package_formats,
            vec![PackageFormat::TarGz]
        );
    }

    #[test]
    fn test_unknown_format_rejected() {
        let text = SAMPLE.replace("\"dmg\"", "\"pkg\"");
        assert!(serde_json::from_str::<BuildConfig>(&text).is_err());
    }
}
