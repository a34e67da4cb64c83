use anyhow::{bail, Context as _, Result};
use std::path::Path;

use forkbuild::fetch::SourceStamp;
use forkbuild::{BuildConfig, GitHubClient, PipelineEnv, Settings};

/// Settings and environment for one invocation.
pub(crate) struct Context {
    pub settings: Settings,
    pub env: PipelineEnv,
}

/// Versions every stage after `fetch` works with.
#[derive(Debug, Clone)]
pub(crate) struct Versions {
    pub upstream_tag: String,
    pub upstream_version: String,
    pub derived_version: String,
    pub upstream_commit: Option<String>,
}

impl Context {
    pub fn load(config: Option<&Path>) -> Result<Self> {
        let settings = Settings::discover(config)?;
        let env = PipelineEnv::from_env()?;
        Ok(Self { settings, env })
    }

    pub fn client(&self) -> Result<GitHubClient> {
        GitHubClient::new(self.env.token.clone()).context("creating GitHub client")
    }

    pub fn fork_repository(&self) -> Result<String> {
        match self.settings.fork_repository(&self.env) {
            Some(repo) => Ok(repo),
            None => bail!("no fork repository; set GITHUB_REPOSITORY or fork.repository"),
        }
    }

    pub fn build_config(&self) -> Result<BuildConfig> {
        BuildConfig::load(&self.settings.build_config)
    }

    /// Versions for a stage run on its own: the environment first, then
    /// whatever `fetch` recorded in the work directory.
    pub fn versions(&self) -> Result<Versions> {
        let stamp = SourceStamp::load(&self.settings.paths.source_stamp)?;
        let prefix = &self.settings.upstream.tag_prefix;

        let (upstream_tag, upstream_version) = match (&self.env.upstream_version, &stamp) {
            (Some(version), _) => {
                let tag = forkbuild::fetch::tag_for_version(version, prefix);
                let base = forkbuild::version::resolver::strip_tag_prefix(&tag, prefix);
                (tag.clone(), base.to_string())
            }
            (None, Some(stamp)) => (stamp.upstream_tag.clone(), stamp.upstream_version.clone()),
            (None, None) => {
                bail!("upstream version unknown; set UPSTREAM_VERSION or run 'fetch' first")
            }
        };
        let Some(derived_version) = self.env.derived_version.clone() else {
            bail!("DERIVED_VERSION is not set; run 'check' first");
        };
        let upstream_commit = self
            .env
            .upstream_commit
            .clone()
            .or_else(|| stamp.and_then(|s| s.commit));

        Ok(Versions {
            upstream_tag,
            upstream_version,
            derived_version,
            upstream_commit,
        })
    }
}

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: libc::c_int) {
    const MESSAGE: &[u8] = b"\nforkbuild: interrupted\n";
    // SAFETY: write(2) and _exit(2) are async-signal-safe, and MESSAGE is a
    // static buffer valid for its full length.
    unsafe {
        libc::write(libc::STDERR_FILENO, MESSAGE.as_ptr().cast(), MESSAGE.len());
        libc::_exit(130);
    }
}

/// Ctrl-C prints a message and exits with status 130.
pub(crate) fn install_interrupt_handler() {
    #[cfg(unix)]
    {
        let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only makes async-signal-safe calls.
        unsafe { libc::signal(libc::SIGINT, handler) };
    }
}
