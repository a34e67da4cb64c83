//! Hosted git-forge release API.
//!
//! The pipeline only needs six calls: list releases, get release by tag,
//! create release, upload an asset, get the latest release and resolve a tag
//! to a commit. [`ReleaseApi`] is that surface; [`github::GitHubClient`] is
//! the production implementation.

pub mod github;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use github::GitHubClient;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned {status}: {message}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        message: String,
    },

    #[error("release '{0}' has no upload URL")]
    NoUploadUrl(String),

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ForgeError>;

/// A release entry as returned by the forge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: u64,
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub upload_url: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub browser_download_url: String,
}

/// Body of a "create release" call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRelease {
    pub tag_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_commitish: Option<String>,
    pub name: String,
    pub body: String,
    pub draft: bool,
    pub prerelease: bool,
}

/// Release operations used by the resolver, fetcher and publisher.
pub trait ReleaseApi {
    fn list_releases(&self, repo: &str) -> Result<Vec<Release>>;

    /// `Ok(None)` when no release carries the tag.
    fn release_by_tag(&self, repo: &str, tag: &str) -> Result<Option<Release>>;

    fn create_release(&self, repo: &str, release: &NewRelease) -> Result<Release>;

    fn upload_asset(
        &self,
        release: &Release,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<ReleaseAsset>;

    fn latest_release(&self, repo: &str) -> Result<Release>;

    fn commit_for_tag(&self, repo: &str, tag: &str) -> Result<String>;
}
