//! Pipeline settings (`forkbuild.toml`) and environment overrides.
//!
//! Settings are read once per invocation. Relative paths are resolved
//! against the directory holding the settings file, so the tool behaves the
//! same no matter where it is started from.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::platform::{Arch, Platform};

/// Default settings file name looked up in the current directory.
pub const SETTINGS_FILENAME: &str = "forkbuild.toml";

/// How the upstream tree is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMethod {
    Git,
    Tarball,
}

/// What to do when the post-patch verification pass fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyFailurePolicy {
    /// Restore the pre-patch snapshot, same as a failed patch.
    Rollback,
    /// Leave the patched tree in place for inspection.
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Substitution {
    pub file: PathBuf,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCheck {
    pub file: PathBuf,
    pub contains: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub repository: String,
    pub tag_prefix: String,
    pub fetch: FetchMethod,
    pub markers: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ForkSettings {
    pub repository: Option<String>,
    pub app_name: String,
}

#[derive(Debug, Clone)]
pub struct PatchSettings {
    pub branding: PathBuf,
    pub core: PathBuf,
    pub addon: PathBuf,
    pub substitutions: Vec<Substitution>,
    pub verify: Vec<VerifyCheck>,
    pub on_verify_failure: VerifyFailurePolicy,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub command: Vec<String>,
    /// Directory inside the source tree the upstream build drops artifacts in.
    pub output_subdir: PathBuf,
}

/// Working directories for one pipeline run.
#[derive(Debug, Clone)]
pub struct WorkPaths {
    pub work_dir: PathBuf,
    pub source: PathBuf,
    pub backup: PathBuf,
    pub build_root: PathBuf,
    pub build_output: PathBuf,
    pub dist: PathBuf,
    /// What `fetch` fetched.
    pub source_stamp: PathBuf,
    /// What `patch` applied.
    pub patch_report: PathBuf,
}

impl WorkPaths {
    pub fn under(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            source: work_dir.join("source"),
            backup: work_dir.join("source.backup"),
            build_root: work_dir.join("build"),
            build_output: work_dir.join("out"),
            dist: work_dir.join("dist"),
            source_stamp: work_dir.join("source-stamp.json"),
            patch_report: work_dir.join("patch-report.json"),
        }
    }
}

/// Fully resolved pipeline settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub repo_root: PathBuf,
    pub upstream: UpstreamSettings,
    pub fork: ForkSettings,
    pub patches: PatchSettings,
    pub build: BuildSettings,
    pub paths: WorkPaths,
    pub mapping_file: PathBuf,
    pub build_config: PathBuf,
    pub check_marker: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    #[serde(default)]
    upstream: UpstreamToml,
    #[serde(default)]
    fork: ForkToml,
    #[serde(default)]
    paths: PathsToml,
    #[serde(default)]
    patches: PatchesToml,
    #[serde(default)]
    build: BuildToml,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpstreamToml {
    repository: Option<String>,
    tag_prefix: Option<String>,
    fetch: Option<FetchMethod>,
    markers: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForkToml {
    repository: Option<String>,
    app_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsToml {
    work_dir: Option<String>,
    mapping_file: Option<String>,
    build_config: Option<String>,
    check_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchesToml {
    branding: Option<String>,
    core: Option<String>,
    addon: Option<String>,
    on_verify_failure: Option<VerifyFailurePolicy>,
    #[serde(default)]
    substitutions: Vec<Substitution>,
    #[serde(default)]
    verify: Vec<VerifyCheck>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    command: Option<Vec<String>>,
    output_subdir: Option<String>,
}

/// Resolve a path from the settings file against the repository root.
pub fn resolve_repo_path(repo_root: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        repo_root.join(candidate)
    }
}

impl Settings {
    /// Locate and load settings.
    ///
    /// Lookup order: the explicit path, `./forkbuild.toml`, then
    /// `<config_dir>/forkbuild/config.toml`. With none present, built-in
    /// defaults rooted at the current directory are used.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let cwd = std::env::current_dir().context("resolving current directory")?;
        let local = cwd.join(SETTINGS_FILENAME);
        if local.is_file() {
            return Self::load(&local);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("forkbuild").join("config.toml");
            if user.is_file() {
                return Self::load(&user);
            }
        }

        tracing::debug!("no settings file found, using defaults");
        Self::from_toml_str("", &cwd)
    }

    /// Load settings from `path`.
    ///
    /// Relative paths in the file resolve against the file's directory,
    /// made absolute against the current directory.
    pub fn load(path: &Path) -> Result<Self> {
        let cwd = std::env::current_dir().context("resolving current directory")?;
        Self::load_from(&cwd, path)
    }

    fn load_from(cwd: &Path, path: &Path) -> Result<Self> {
        let path = cwd.join(path);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading settings '{}'", path.display()))?;
        let repo_root = path.parent().unwrap_or(cwd);
        Self::from_toml_str(&text, repo_root)
            .with_context(|| format!("parsing settings '{}'", path.display()))
    }

    pub fn from_toml_str(text: &str, repo_root: &Path) -> Result<Self> {
        let parsed: SettingsToml = toml::from_str(text)?;
        let resolve = |raw: &str| resolve_repo_path(repo_root, raw);

        let repository = parsed
            .upstream
            .repository
            .unwrap_or_else(|| "ankitects/anki".to_string());
        validate_repository(&repository)?;
        if let Some(fork_repo) = &parsed.fork.repository {
            validate_repository(fork_repo)?;
        }

        let command = parsed
            .build
            .command
            .unwrap_or_else(|| vec!["./tools/build".to_string()]);
        if command.is_empty() {
            bail!("build.command must name at least the program to run");
        }

        let work_dir = resolve(parsed.paths.work_dir.as_deref().unwrap_or("work"));

        Ok(Settings {
            repo_root: repo_root.to_path_buf(),
            upstream: UpstreamSettings {
                repository,
                tag_prefix: parsed.upstream.tag_prefix.unwrap_or_default(),
                fetch: parsed.upstream.fetch.unwrap_or(FetchMethod::Git),
                markers: parsed
                    .upstream
                    .markers
                    .unwrap_or_default()
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
            },
            fork: ForkSettings {
                repository: parsed.fork.repository,
                app_name: parsed.fork.app_name.unwrap_or_else(|| "AnkiBlur".to_string()),
            },
            patches: PatchSettings {
                branding: resolve(parsed.patches.branding.as_deref().unwrap_or("patches/branding")),
                core: resolve(parsed.patches.core.as_deref().unwrap_or("patches/core")),
                addon: resolve(parsed.patches.addon.as_deref().unwrap_or("patches/addon")),
                substitutions: parsed.patches.substitutions,
                verify: parsed.patches.verify,
                on_verify_failure: parsed
                    .patches
                    .on_verify_failure
                    .unwrap_or(VerifyFailurePolicy::Rollback),
            },
            build: BuildSettings {
                command,
                output_subdir: PathBuf::from(
                    parsed.build.output_subdir.as_deref().unwrap_or("out/wheels"),
                ),
            },
            paths: WorkPaths::under(&work_dir),
            mapping_file: resolve(
                parsed
                    .paths
                    .mapping_file
                    .as_deref()
                    .unwrap_or("configs/version-mapping.json"),
            ),
            build_config: resolve(
                parsed
                    .paths
                    .build_config
                    .as_deref()
                    .unwrap_or("configs/build-config.json"),
            ),
            check_marker: resolve(parsed.paths.check_marker.as_deref().unwrap_or(".last-check")),
        })
    }

    /// Fork repository: `GITHUB_REPOSITORY` wins over the settings file.
    pub fn fork_repository(&self, env: &PipelineEnv) -> Option<String> {
        env.repository
            .clone()
            .or_else(|| self.fork.repository.clone())
    }
}

fn validate_repository(repo: &str) -> Result<()> {
    let mut parts = repo.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => Ok(()),
        _ => bail!("invalid repository '{}': expected 'owner/name'", repo),
    }
}

/// Values the CI environment passes between stages.
#[derive(Debug, Clone, Default)]
pub struct PipelineEnv {
    pub upstream_version: Option<String>,
    pub derived_version: Option<String>,
    pub upstream_commit: Option<String>,
    pub platform: Option<Platform>,
    pub arch: Option<Arch>,
    pub repository: Option<String>,
    pub token: Option<String>,
    pub force_rebuild: bool,
    pub skip_patches: bool,
    pub github_output: Option<PathBuf>,
}

impl PipelineEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let platform = get("FORKBUILD_PLATFORM")
            .map(|v| v.parse::<Platform>())
            .transpose()
            .context("parsing FORKBUILD_PLATFORM")?;
        let arch = get("FORKBUILD_ARCH")
            .map(|v| v.parse::<Arch>())
            .transpose()
            .context("parsing FORKBUILD_ARCH")?;

        Ok(Self {
            upstream_version: get("UPSTREAM_VERSION"),
            derived_version: get("DERIVED_VERSION"),
            upstream_commit: get("UPSTREAM_COMMIT"),
            platform,
            arch,
            repository: get("GITHUB_REPOSITORY"),
            token: get("GITHUB_TOKEN"),
            force_rebuild: get("FORCE_REBUILD").is_some_and(|v| parse_flag(&v)),
            skip_patches: get("SKIP_PATCHES").is_some_and(|v| parse_flag(&v)),
            github_output: get("GITHUB_OUTPUT").map(PathBuf::from),
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform.unwrap_or_else(Platform::host)
    }

    pub fn arch(&self) -> Arch {
        self.arch.unwrap_or_else(Arch::host)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_resolve_under_repo_root() {
        let settings = Settings::from_toml_str("", Path::new("/repo")).unwrap();
        assert_eq!(settings.upstream.repository, "ankitects/anki");
        assert_eq!(settings.upstream.tag_prefix, "");
        assert_eq!(settings.upstream.fetch, FetchMethod::Git);
        assert_eq!(settings.patches.branding, Path::new("/repo/patches/branding"));
        assert_eq!(settings.paths.source, Path::new("/repo/work/source"));
        assert_eq!(
            settings.mapping_file,
            Path::new("/repo/configs/version-mapping.json")
        );
        assert_eq!(
            settings.patches.on_verify_failure,
            VerifyFailurePolicy::Rollback
        );
    }

    #[test]
    fn test_relative_settings_path_gives_absolute_paths() {
        let temp = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("ci")).unwrap();
        fs::write(
            temp.path().join("ci").join(SETTINGS_FILENAME),
            "[paths]\nwork_dir = \"work\"\n",
        )
        .unwrap();

        let relative = Path::new("ci").join(SETTINGS_FILENAME);
        let settings = Settings::load_from(temp.path(), &relative).unwrap();

        assert!(settings.repo_root.is_absolute());
        assert_eq!(settings.repo_root, temp.path().join("ci"));
        assert_eq!(settings.patches.core, temp.path().join("ci/patches/core"));
        assert!(settings.paths.source.is_absolute());
        assert!(settings.paths.dist.is_absolute());
    }

    #[test]
    fn test_full_settings_file() {
        let text = r#"
[upstream]
repository = "example/app"
tag_prefix = "release-"
fetch = "tarball"
markers = ["tools/build"]

[fork]
repository = "me/app-fork"
app_name = "AppFork"

[paths]
work_dir = "/tmp/forkwork"

[patches]
on_verify_failure = "keep"

[[patches.substitutions]]
file = "qt/about.py"
from = "App"
to = "{app_name}"

[[patches.verify]]
file = "qt/about.py"
contains = ["AppFork"]

[build]
command = ["./ninja", "wheels"]
"#;
        let settings = Settings::from_toml_str(text, Path::new("/repo")).unwrap();
        assert_eq!(settings.upstream.fetch, FetchMethod::Tarball);
        assert_eq!(settings.upstream.tag_prefix, "release-");
        assert_eq!(settings.fork.app_name, "AppFork");
        assert_eq!(settings.paths.backup, Path::new("/tmp/forkwork/source.backup"));
        assert_eq!(settings.patches.substitutions.len(), 1);
        assert_eq!(settings.patches.verify[0].contains, vec!["AppFork"]);
        assert_eq!(settings.patches.on_verify_failure, VerifyFailurePolicy::Keep);
        assert_eq!(settings.build.command, vec!["./ninja", "wheels"]);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = Settings::from_toml_str("[upstream]\nrepo = \"x/y\"\n", Path::new("/repo"));
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_repository_rejected() {
        let err = Settings::from_toml_str("[upstream]\nrepository = \"noslash\"\n", Path::new("/r"));
        assert!(err.is_err());
    }

    #[test]
    fn test_env_lookup_and_flags() {
        let vars: HashMap<&str, &str> = [
            ("UPSTREAM_VERSION", "v23.12.1"),
            ("FORCE_REBUILD", "True"),
            ("SKIP_PATCHES", "0"),
            ("FORKBUILD_PLATFORM", "darwin"),
            ("GITHUB_TOKEN", "  "),
        ]
        .into_iter()
        .collect();
        let env = PipelineEnv::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(env.upstream_version.as_deref(), Some("v23.12.1"));
        assert!(env.force_rebuild);
        assert!(!env.skip_patches);
        assert_eq!(env.platform, Some(Platform::Macos));
        assert!(env.token.is_none());
    }

    #[test]
    fn test_env_repository_overrides_settings() {
        let settings =
            Settings::from_toml_str("[fork]\nrepository = \"a/b\"\n", Path::new("/r")).unwrap();
        let env = PipelineEnv {
            repository: Some("c/d".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.fork_repository(&env).as_deref(), Some("c/d"));
        assert_eq!(
            settings.fork_repository(&PipelineEnv::default()).as_deref(),
            Some("a/b")
        );
    }
}
