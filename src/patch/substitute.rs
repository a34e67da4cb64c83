//! Literal substitution and verification passes run after patching.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::{Substitution, VerifyCheck};

/// Values available to `{placeholder}` expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchContext {
    pub app_name: String,
    pub derived_version: String,
    pub upstream_version: String,
    pub upstream_commit: String,
}

impl PatchContext {
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{app_name}", &self.app_name)
            .replace("{derived_version}", &self.derived_version)
            .replace("{upstream_version}", &self.upstream_version)
            .replace("{upstream_commit}", &self.upstream_commit)
    }
}

/// Replace every occurrence of `from` with `to` in each configured file.
///
/// Returns the number of replacements per substitution. A missing file is an
/// error; a pattern that no longer occurs is only a warning, since a later
/// upstream release may have changed the text.
pub fn apply_substitutions(
    source: &Path,
    substitutions: &[Substitution],
    ctx: &PatchContext,
) -> Result<Vec<usize>> {
    let mut counts = Vec::with_capacity(substitutions.len());
    for sub in substitutions {
        let path = source.join(&sub.file);
        if !path.is_file() {
            bail!("substitution target '{}' does not exist", sub.file.display());
        }
        let from = ctx.render(&sub.from);
        let to = ctx.render(&sub.to);
        if from.is_empty() {
            bail!("substitution for '{}' has an empty pattern", sub.file.display());
        }

        let text =
            fs::read_to_string(&path).with_context(|| format!("reading '{}'", path.display()))?;
        let count = text.matches(from.as_str()).count();
        if count == 0 {
            warn!("'{}' not found in {}", from, sub.file.display());
        } else {
            fs::write(&path, text.replace(from.as_str(), &to))
                .with_context(|| format!("writing '{}'", path.display()))?;
            info!("{}: {} x '{}' -> '{}'", sub.file.display(), count, from, to);
        }
        counts.push(count);
    }
    Ok(counts)
}

/// Check that each configured file contains each expected string.
///
/// Returns one message per failed expectation; empty means verified.
pub fn verify(source: &Path, checks: &[VerifyCheck], ctx: &PatchContext) -> Vec<String> {
    let mut failures = Vec::new();
    for check in checks {
        let path = source.join(&check.file);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                failures.push(format!("{}: unreadable ({})", check.file.display(), e));
                continue;
            }
        };
        for expected in &check.contains {
            let expected = ctx.render(expected);
            if !text.contains(&expected) {
                failures.push(format!(
                    "{}: missing '{}'",
                    check.file.display(),
                    expected
                ));
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn ctx() -> PatchContext {
        PatchContext {
            app_name: "AnkiBlur".to_string(),
            derived_version: "23.12.1.2".to_string(),
            upstream_version: "23.12.1".to_string(),
            upstream_commit: "abc".to_string(),
        }
    }

    #[test]
    fn test_render_placeholders() {
        assert_eq!(
            ctx().render("{app_name} {derived_version} (based on {upstream_version}@{upstream_commit})"),
            "AnkiBlur 23.12.1.2 (based on 23.12.1@abc)"
        );
    }

    #[test]
    fn test_substitutions_and_verification() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("qt/aqt")).unwrap();
        fs::write(
            temp.path().join("qt/aqt/about.py"),
            "title = 'Anki'\nversion = '23.12.1'\n",
        )
        .unwrap();

        let subs = vec![
            Substitution {
                file: PathBuf::from("qt/aqt/about.py"),
                from: "'Anki'".to_string(),
                to: "'{app_name}'".to_string(),
            },
            Substitution {
                file: PathBuf::from("qt/aqt/about.py"),
                from: "'{upstream_version}'".to_string(),
                to: "'{derived_version}'".to_string(),
            },
            Substitution {
                file: PathBuf::from("qt/aqt/about.py"),
                from: "nothing-here".to_string(),
                to: "x".to_string(),
            },
        ];
        let counts = apply_substitutions(temp.path(), &subs, &ctx()).unwrap();
        assert_eq!(counts, vec![1, 1, 0]);

        let checks = vec![VerifyCheck {
            file: PathBuf::from("qt/aqt/about.py"),
            contains: vec!["'{app_name}'".to_string(), "'{derived_version}'".to_string()],
        }];
        assert!(verify(temp.path(), &checks, &ctx()).is_empty());
    }

    #[test]
    fn test_verify_reports_each_failure() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "hello").unwrap();
        let checks = vec![
            VerifyCheck {
                file: PathBuf::from("a.txt"),
                contains: vec!["hello".to_string(), "{app_name}".to_string()],
            },
            VerifyCheck {
                file: PathBuf::from("missing.txt"),
                contains: vec!["x".to_string()],
            },
        ];
        let failures = verify(temp.path(), &checks, &ctx());
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("AnkiBlur"));
        assert!(failures[1].starts_with("missing.txt"));
    }

    #[test]
    fn test_missing_substitution_target_fails() {
        let temp = TempDir::new().unwrap();
        let subs = vec![Substitution {
            file: PathBuf::from("nope.py"),
            from: "a".to_string(),
            to: "b".to_string(),
        }];
        assert!(apply_substitutions(temp.path(), &subs, &ctx()).is_err());
    }
}
