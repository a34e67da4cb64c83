//! Thin builder over `std::process::Command`.
//!
//! Every external tool the pipeline drives (git, patch, dpkg-deb, hdiutil,
//! makensis, ...) goes through [`Cmd`] so failures carry the tool's output
//! and a human-readable hint instead of a bare exit status.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Captured result of a successful command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// stdout and stderr joined, trimmed.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr).trim().to_string()
    }
}

/// External command under construction.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, OsString)>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.envs.push((key.into(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Message prepended to the error when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Rendered command line, for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }

    /// Run to completion, capturing output. Non-zero exit is an error.
    pub fn run(self) -> Result<CmdOutput> {
        tracing::debug!("running: {}", self.display());
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning '{}'", self.program))?;

        let result = CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            bail!("{} (status {}): {}", msg, output.status, result.combined());
        }

        Ok(result)
    }

    /// Run with inherited stdio so long-running tools stream to the console.
    pub fn run_interactive(self) -> Result<()> {
        tracing::debug!("running: {}", self.display());
        let status = self
            .command()
            .status()
            .with_context(|| format!("spawning '{}'", self.program))?;

        if !status.success() {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            bail!("{} (status {})", msg, status);
        }
        Ok(())
    }
}
