//! Host tool checks run before a stage starts.
//!
//! Validates that the host has the tools a stage shells out to. Missing
//! tools are reported together, with the package that usually provides them.
//!
//! # Example
//!
//! ```rust,ignore
//! use forkbuild::preflight::{check_required_tools, PATCH_TOOLS};
//!
//! check_required_tools(PATCH_TOOLS)?;
//! check_required_tools(&[("dpkg-deb", "dpkg")])?;
//! ```

use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools needed to fetch upstream sources with git.
pub const FETCH_TOOLS: &[(&str, &str)] = &[("git", "git")];

/// Tools needed to apply patch directories.
pub const PATCH_TOOLS: &[(&str, &str)] = &[("patch", "patch"), ("sh", "coreutils")];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - `(command_name, package_name)` pairs. The package name only
///   feeds the install hint in the error.
///
/// Every missing tool is listed in one error rather than failing on the
/// first.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}
