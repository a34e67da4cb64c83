//! Patch applier.
//!
//! Applies three patch directories to the upstream tree in a fixed order:
//! branding, core, addon. Each directory may hold:
//!
//! - unified diffs (`*.patch`, `*.diff`), applied with one leading path
//!   component stripped, in lexical file-name order;
//! - replacement trees: subdirectories whose name is a destination path
//!   with [`PATH_SENTINEL`] in place of `/`, copied over the source tree;
//! - shell scripts (`*.sh`), run from the source root.
//!
//! Every diff in a directory is dry-run checked before any diff of that
//! directory is applied. A failed check, a failed apply, a failed copy or a
//! failed script restores the backup taken before the run started. File
//! names containing [`PLACEHOLDER_MARKER`] are never checked or applied.
//!
//! ```text
//! Unpatched ──> Validating(stage) ──> Patching(stage) ──> ... ──> Patched
//!                    │                     │
//!                    └──────> Failed <─────┘   (backup restored)
//! ```

pub mod snapshot;
pub mod substitute;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{PatchSettings, VerifyFailurePolicy};
use crate::fsutil::copy_dir_recursive;
use crate::process::Cmd;

pub use snapshot::BackupSnapshot;
pub use substitute::PatchContext;

/// Stands in for `/` in replacement tree directory names.
pub const PATH_SENTINEL: &str = "__";

/// A file name containing this is an unexpanded glob, not a real patch.
pub const PLACEHOLDER_MARKER: char = '*';

const PATCH_EXTENSIONS: &[&str] = &["patch", "diff"];
const SCRIPT_EXTENSION: &str = "sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatchStage {
    Branding,
    Core,
    Addon,
}

impl PatchStage {
    pub const ORDER: [PatchStage; 3] = [PatchStage::Branding, PatchStage::Core, PatchStage::Addon];

    pub fn dir<'a>(&self, settings: &'a PatchSettings) -> &'a Path {
        match self {
            PatchStage::Branding => &settings.branding,
            PatchStage::Core => &settings.core,
            PatchStage::Addon => &settings.addon,
        }
    }
}

impl fmt::Display for PatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchStage::Branding => "branding",
            PatchStage::Core => "core",
            PatchStage::Addon => "addon",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Unpatched,
    Validating(PatchStage),
    Patching(PatchStage),
    Patched,
    Failed,
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{stage}: {count} patch(es) failed dry-run validation:\n{details}")]
    Validation {
        stage: PatchStage,
        count: usize,
        details: String,
    },

    #[error("{stage}: applying '{patch}' failed: {message}")]
    Application {
        stage: PatchStage,
        patch: String,
        message: String,
    },

    #[error("{stage}: replacement tree '{tree}' failed: {message}")]
    Replacement {
        stage: PatchStage,
        tree: String,
        message: String,
    },

    #[error("{stage}: script '{script}' failed: {message}")]
    Script {
        stage: PatchStage,
        script: String,
        message: String,
    },

    #[error("post-patch substitution failed: {0}")]
    Substitution(String),

    #[error("post-patch verification failed:\n  {}", .0.join("\n  "))]
    Verification(Vec<String>),
}

/// Tool that checks and applies a single unified diff.
pub trait PatchTool {
    /// Dry run: succeed only if `patch` would apply cleanly to `source`.
    fn check(&self, source: &Path, patch: &Path) -> Result<()>;

    fn apply(&self, source: &Path, patch: &Path) -> Result<()>;
}

/// GNU `patch -p1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GnuPatch;

impl GnuPatch {
    fn command(source: &Path, patch: &Path) -> Cmd {
        Cmd::new("patch")
            .args(["-p1", "--forward", "--batch", "--no-backup-if-mismatch", "-i"])
            .arg_path(patch)
            .current_dir(source)
    }
}

impl PatchTool for GnuPatch {
    fn check(&self, source: &Path, patch: &Path) -> Result<()> {
        Self::command(source, patch)
            .arg("--dry-run")
            .error_msg(format!("dry run of {} failed", patch.display()))
            .run()
            .map(|_| ())
    }

    fn apply(&self, source: &Path, patch: &Path) -> Result<()> {
        Self::command(source, patch)
            .error_msg(format!("applying {} failed", patch.display()))
            .run()
            .map(|_| ())
    }
}

/// Contents of one stage directory, each list in lexical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchDirectory {
    pub patches: Vec<PathBuf>,
    pub placeholders: Vec<PathBuf>,
    pub trees: Vec<PathBuf>,
    pub scripts: Vec<PathBuf>,
}

pub fn is_placeholder(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().contains(PLACEHOLDER_MARKER))
        .unwrap_or(false)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.contains(&e))
}

impl PatchDirectory {
    /// List a stage directory. A missing directory is empty.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut listing = Self::default();
        if !dir.is_dir() {
            return Ok(listing);
        }

        let mut entries = fs::read_dir(dir)
            .with_context(|| format!("reading patch directory '{}'", dir.display()))?
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("reading patch directory '{}'", dir.display()))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if is_placeholder(&path) {
                listing.placeholders.push(path);
            } else if path.is_dir() {
                listing.trees.push(path);
            } else if has_extension(&path, PATCH_EXTENSIONS) {
                listing.patches.push(path);
            } else if has_extension(&path, &[SCRIPT_EXTENSION]) {
                listing.scripts.push(path);
            } else {
                debug!("ignoring {}", path.display());
            }
        }
        Ok(listing)
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.trees.is_empty() && self.scripts.is_empty()
    }
}

/// Destination path encoded in a replacement tree's directory name.
pub fn decode_tree_destination(name: &str) -> Result<PathBuf> {
    let mut dest = PathBuf::new();
    for part in name.split(PATH_SENTINEL) {
        let component = Path::new(part);
        let valid = !part.is_empty()
            && component.components().count() == 1
            && matches!(component.components().next(), Some(Component::Normal(_)));
        if !valid {
            bail!("replacement tree name '{}' does not encode a relative path", name);
        }
        dest.push(part);
    }
    Ok(dest)
}

/// Result of one dry-run check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub patch: String,
    pub passed: bool,
    pub message: String,
}

/// Dry-run every patch in order, recording each result.
pub fn validate_patches(tool: &dyn PatchTool, source: &Path, patches: &[PathBuf]) -> Vec<CheckOutcome> {
    patches
        .iter()
        .map(|patch| {
            let name = file_name(patch);
            match tool.check(source, patch) {
                Ok(()) => {
                    debug!("dry run ok: {}", name);
                    CheckOutcome {
                        patch: name,
                        passed: true,
                        message: String::new(),
                    }
                }
                Err(e) => CheckOutcome {
                    patch: name,
                    passed: false,
                    message: format!("{e:#}"),
                },
            }
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// What a successful run did.
///
/// Saved next to the source tree so the publish step can list the applied
/// patches in the release notes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReport {
    /// `<stage>/<name>` for every patch, tree and script, in application order.
    pub applied: Vec<String>,
    #[serde(default)]
    pub skipped_placeholders: Vec<String>,
    #[serde(default)]
    pub substitutions: usize,
}

impl PatchReport {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing patch report")?;
        fs::write(path, json).with_context(|| format!("writing '{}'", path.display()))
    }

    /// A missing report means no patches were applied.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing '{}'", path.display()))
    }
}

pub struct PatchApplier<'a> {
    tool: &'a dyn PatchTool,
    settings: &'a PatchSettings,
    state: PatchState,
}

impl<'a> PatchApplier<'a> {
    pub fn new(tool: &'a dyn PatchTool, settings: &'a PatchSettings) -> Self {
        Self {
            tool,
            settings,
            state: PatchState::Unpatched,
        }
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    fn transition(&mut self, next: PatchState) {
        debug!("patch state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run all three stages, then the substitution and verification passes.
    pub fn run(&mut self, source: &Path, backup: &Path, ctx: &PatchContext) -> Result<PatchReport> {
        if !source.is_dir() {
            bail!(
                "source tree '{}' not found; run 'fetch' first",
                source.display()
            );
        }

        let snapshot = BackupSnapshot::create(source, backup)?;
        let mut report = PatchReport::default();

        if let Err(e) = self.apply_stages(source, ctx, &mut report) {
            self.transition(PatchState::Failed);
            error!("{}", e);
            snapshot
                .restore()
                .context("restoring source tree after failed patch run")?;
            return Err(e.into());
        }

        if let Err(e) = self.post_patch(source, ctx, &mut report) {
            self.transition(PatchState::Failed);
            error!("{}", e);
            match self.settings.on_verify_failure {
                VerifyFailurePolicy::Rollback => snapshot
                    .restore()
                    .context("restoring source tree after failed verification")?,
                VerifyFailurePolicy::Keep => {
                    warn!("leaving patched tree in place for inspection");
                    snapshot.discard()?;
                }
            }
            return Err(e.into());
        }

        snapshot.discard()?;
        self.transition(PatchState::Patched);
        info!(
            "applied {} item(s), skipped {} placeholder(s)",
            report.applied.len(),
            report.skipped_placeholders.len()
        );
        Ok(report)
    }

    fn apply_stages(
        &mut self,
        source: &Path,
        ctx: &PatchContext,
        report: &mut PatchReport,
    ) -> std::result::Result<(), PatchError> {
        for stage in PatchStage::ORDER {
            let dir = stage.dir(self.settings);
            let listing = PatchDirectory::scan(dir).map_err(|e| PatchError::Application {
                stage,
                patch: dir.display().to_string(),
                message: format!("{e:#}"),
            })?;
            if listing.is_empty() && listing.placeholders.is_empty() {
                warn!("{}: no patches in {}", stage, dir.display());
                continue;
            }
            for placeholder in &listing.placeholders {
                info!("{}: skipping placeholder {}", stage, placeholder.display());
                report
                    .skipped_placeholders
                    .push(format!("{stage}/{}", file_name(placeholder)));
            }

            self.transition(PatchState::Validating(stage));
            let outcomes = validate_patches(self.tool, source, &listing.patches);
            let failed: Vec<&CheckOutcome> = outcomes.iter().filter(|o| !o.passed).collect();
            if !failed.is_empty() {
                let details = failed
                    .iter()
                    .map(|o| format!("  {}: {}", o.patch, o.message))
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(PatchError::Validation {
                    stage,
                    count: failed.len(),
                    details,
                });
            }

            self.transition(PatchState::Patching(stage));
            for patch in &listing.patches {
                let name = file_name(patch);
                info!("{}: applying {}", stage, name);
                self.tool
                    .apply(source, patch)
                    .map_err(|e| PatchError::Application {
                        stage,
                        patch: name.clone(),
                        message: format!("{e:#}"),
                    })?;
                report.applied.push(format!("{stage}/{name}"));
            }

            for tree in &listing.trees {
                let name = file_name(tree);
                let replace = || -> Result<PathBuf> {
                    let dest = decode_tree_destination(&name)?;
                    copy_dir_recursive(tree, &source.join(&dest))?;
                    Ok(dest)
                };
                let dest = replace().map_err(|e| PatchError::Replacement {
                    stage,
                    tree: name.clone(),
                    message: format!("{e:#}"),
                })?;
                info!("{}: copied {} -> {}", stage, name, dest.display());
                report.applied.push(format!("{stage}/{name}"));
            }

            for script in &listing.scripts {
                let name = file_name(script);
                info!("{}: running {}", stage, name);
                run_script(script, source, dir, ctx).map_err(|e| PatchError::Script {
                    stage,
                    script: name.clone(),
                    message: format!("{e:#}"),
                })?;
                report.applied.push(format!("{stage}/{name}"));
            }
        }
        Ok(())
    }

    fn post_patch(
        &mut self,
        source: &Path,
        ctx: &PatchContext,
        report: &mut PatchReport,
    ) -> std::result::Result<(), PatchError> {
        let counts = substitute::apply_substitutions(source, &self.settings.substitutions, ctx)
            .map_err(|e| PatchError::Substitution(format!("{e:#}")))?;
        report.substitutions = counts.iter().sum();

        let failures = substitute::verify(source, &self.settings.verify, ctx);
        if !failures.is_empty() {
            return Err(PatchError::Verification(failures));
        }
        Ok(())
    }
}

fn run_script(script: &Path, source: &Path, patch_dir: &Path, ctx: &PatchContext) -> Result<()> {
    let output = Cmd::new("sh")
        .arg_path(script)
        .current_dir(source)
        .env("SOURCE_DIR", source)
        .env("PATCH_DIR", patch_dir)
        .env("FORKBUILD_APP_NAME", &ctx.app_name)
        .env("DERIVED_VERSION", &ctx.derived_version)
        .env("UPSTREAM_VERSION", &ctx.upstream_version)
        .env("UPSTREAM_COMMIT", &ctx.upstream_commit)
        .error_msg(format!("{} exited with an error", script.display()))
        .run()?;
    let combined = output.combined();
    if !combined.is_empty() {
        debug!("{}", combined);
    }
    Ok(())
}
