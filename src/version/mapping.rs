//! Derived-version → upstream-version table.
//!
//! Stored as a JSON object keyed by derived version. The table is
//! append-only: [`VersionMapping::insert`] refuses existing keys, and only
//! [`VersionMapping::reconcile`] (import from remote releases) may rewrite a
//! record. Every write happens under an advisory lock on `<file>.lock` and
//! lands via temp file + rename.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(default)]
    pub derived_version: String,
    pub upstream_version: String,
    #[serde(default)]
    pub upstream_commit: Option<String>,
    pub build_date: String,
    #[serde(default)]
    pub patches_applied: Vec<String>,
    #[serde(default)]
    pub release_notes: String,
}

#[derive(Debug, Clone, Default)]
pub struct VersionMapping {
    records: BTreeMap<String, VersionRecord>,
}

/// Held for the duration of a read-modify-write of the mapping file.
pub struct MappingLock {
    _file: File,
}

impl MappingLock {
    pub fn acquire(mapping_path: &Path) -> Result<Self> {
        let lock_path = lock_path_for(mapping_path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening lock file '{}'", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking '{}'", lock_path.display()))?;
        Ok(Self { _file: file })
    }
}

fn lock_path_for(mapping_path: &Path) -> PathBuf {
    let mut name = mapping_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    mapping_path.with_file_name(name)
}

/// `true` when a record's upstream version names the given base version.
fn upstream_matches(record: &VersionRecord, base: &str) -> bool {
    record.upstream_version == base || record.upstream_version.strip_prefix('v') == Some(base)
}

/// Patch counter of a derived version (`23.12.1.4` → 4 for base `23.12.1`).
pub fn derived_counter(derived: &str, base: &str) -> Option<u32> {
    derived
        .strip_prefix(base)?
        .strip_prefix('.')?
        .parse()
        .ok()
}

impl VersionMapping {
    /// Load the table; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path)
            .with_context(|| format!("reading version mapping '{}'", path.display()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let mut records: BTreeMap<String, VersionRecord> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing version mapping '{}'", path.display()))?;
        for (key, record) in records.iter_mut() {
            if record.derived_version.is_empty() {
                record.derived_version = key.clone();
            }
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, derived: &str) -> Option<&VersionRecord> {
        self.records.get(derived)
    }

    pub fn records(&self) -> impl Iterator<Item = &VersionRecord> {
        self.records.values()
    }

    pub fn contains_upstream(&self, base: &str) -> bool {
        self.records.values().any(|r| upstream_matches(r, base))
    }

    /// Highest patch counter recorded for a base upstream version.
    pub fn highest_counter(&self, base: &str) -> Option<u32> {
        self.records
            .values()
            .filter(|r| upstream_matches(r, base))
            .filter_map(|r| derived_counter(&r.derived_version, base))
            .max()
    }

    /// Record with the highest patch counter for a base upstream version.
    pub fn latest_for_upstream(&self, base: &str) -> Option<&VersionRecord> {
        self.records
            .values()
            .filter(|r| upstream_matches(r, base))
            .max_by_key(|r| derived_counter(&r.derived_version, base).unwrap_or(0))
    }

    pub fn insert(&mut self, record: VersionRecord) -> Result<()> {
        if record.derived_version.trim().is_empty() {
            bail!("version record has an empty derived version");
        }
        if self.records.contains_key(&record.derived_version) {
            bail!(
                "version mapping already has an entry for '{}'; records are append-only",
                record.derived_version
            );
        }
        self.records.insert(record.derived_version.clone(), record);
        Ok(())
    }

    /// Insert or overwrite a record from remote state. Returns `true` when
    /// the table changed.
    pub fn reconcile(&mut self, record: VersionRecord) -> bool {
        match self.records.get(&record.derived_version) {
            Some(existing) if *existing == record => false,
            _ => {
                self.records.insert(record.derived_version.clone(), record);
                true
            }
        }
    }

    /// Write the table. Callers hold a [`MappingLock`].
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
        let mut json = serde_json::to_string_pretty(&self.records)
            .context("serializing version mapping")?;
        json.push('\n');

        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        fs::write(&tmp, json).with_context(|| format!("writing '{}'", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming '{}' -> '{}'", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Lock, reload, insert and save in one step.
    pub fn append_record(path: &Path, record: VersionRecord) -> Result<()> {
        let _lock = MappingLock::acquire(path)?;
        let mut mapping = Self::load(path)?;
        mapping.insert(record)?;
        mapping.save(path)
    }
}
