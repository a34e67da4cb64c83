//! Step outputs handed to the CI workflow (`$GITHUB_OUTPUT`).

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutputs {
    entries: Vec<(String, String)>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Log every output and append them to `target` when set.
    pub fn emit(&self, target: Option<&Path>) -> Result<()> {
        for (key, value) in &self.entries {
            info!("output {}={}", key, value);
        }

        let Some(path) = target else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening step output file '{}'", path.display()))?;
        for (key, value) in &self.entries {
            // Values never legitimately span lines; keep the file parseable.
            let value = value.replace(['\r', '\n'], " ");
            writeln!(file, "{key}={value}")
                .with_context(|| format!("writing step output file '{}'", path.display()))?;
        }
        Ok(())
    }
}
