//! GitHub REST implementation of [`ReleaseApi`].

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{ForgeError, NewRelease, Release, ReleaseApi, ReleaseAsset, Result};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Asset uploads can be large installers.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

const PAGE_SIZE: usize = 100;

/// Upper bound on release pages fetched by [`GitHubClient::list_releases`].
const MAX_PAGES: usize = 10;

pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct CommitBody {
    sha: String,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        Self::with_api_url(DEFAULT_API_URL, token)
    }

    pub fn with_api_url(api_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("forkbuild/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    fn get(&self, url: &str) -> Result<Response> {
        debug!("GET {}", url);
        Ok(self.authorize(self.client.get(url)).send()?)
    }

    fn expect_json<T: DeserializeOwned>(
        method: &'static str,
        url: &str,
        response: Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(method, url, status, response));
        }
        Ok(response.json()?)
    }
}

fn status_error(method: &'static str, url: &str, status: StatusCode, response: Response) -> ForgeError {
    let text = response.text().unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    ForgeError::Status {
        method,
        url: url.to_string(),
        status: status.as_u16(),
        message,
    }
}

/// `https://uploads.github.com/.../assets{?name,label}` → the URL without the template.
pub fn upload_base(upload_url: &str) -> &str {
    upload_url
        .split_once('{')
        .map(|(base, _)| base)
        .unwrap_or(upload_url)
}

impl ReleaseApi for GitHubClient {
    fn list_releases(&self, repo: &str) -> Result<Vec<Release>> {
        let mut releases = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = self.url(&format!(
                "repos/{repo}/releases?per_page={PAGE_SIZE}&page={page}"
            ));
            let batch: Vec<Release> = Self::expect_json("GET", &url, self.get(&url)?)?;
            let done = batch.len() < PAGE_SIZE;
            releases.extend(batch);
            if done {
                break;
            }
        }
        Ok(releases)
    }

    fn release_by_tag(&self, repo: &str, tag: &str) -> Result<Option<Release>> {
        let url = self.url(&format!("repos/{repo}/releases/tags/{tag}"));
        let response = self.get(&url)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::expect_json("GET", &url, response).map(Some)
    }

    fn create_release(&self, repo: &str, release: &NewRelease) -> Result<Release> {
        let url = self.url(&format!("repos/{repo}/releases"));
        debug!("POST {}", url);
        let response = self
            .authorize(self.client.post(&url))
            .json(release)
            .send()?;
        Self::expect_json("POST", &url, response)
    }

    fn upload_asset(
        &self,
        release: &Release,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<ReleaseAsset> {
        if release.upload_url.is_empty() {
            return Err(ForgeError::NoUploadUrl(release.tag_name.clone()));
        }
        let url = upload_base(&release.upload_url).to_string();
        debug!("POST {} ({} bytes)", url, data.len());
        let response = self
            .authorize(self.client.post(&url))
            .query(&[("name", name)])
            .header(CONTENT_TYPE, content_type)
            .timeout(UPLOAD_TIMEOUT)
            .body(data)
            .send()?;
        Self::expect_json("POST", &url, response)
    }

    fn latest_release(&self, repo: &str) -> Result<Release> {
        let url = self.url(&format!("repos/{repo}/releases/latest"));
        Self::expect_json("GET", &url, self.get(&url)?)
    }

    fn commit_for_tag(&self, repo: &str, tag: &str) -> Result<String> {
        let url = self.url(&format!("repos/{repo}/commits/{tag}"));
        let commit: CommitBody = Self::expect_json("GET", &url, self.get(&url)?)?;
        if commit.sha.is_empty() {
            return Err(ForgeError::Invalid(format!("no commit for tag '{tag}' in {repo}")));
        }
        Ok(commit.sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_base_strips_uri_template() {
        assert_eq!(
            upload_base("https://uploads.github.com/repos/o/r/releases/7/assets{?name,label}"),
            "https://uploads.github.com/repos/o/r/releases/7/assets"
        );
        assert_eq!(upload_base("https://x/assets"), "https://x/assets");
    }

    #[test]
    fn test_url_joining() {
        let client = GitHubClient::with_api_url("https://ghe.example.com/api/v3/", None).unwrap();
        assert_eq!(
            client.url("/repos/a/b/releases"),
            "https://ghe.example.com/api/v3/repos/a/b/releases"
        );
        assert!(!client.has_token());
    }

    #[test]
    fn test_release_deserializes_from_api_shape() {
        let json = r#"{
            "id": 42,
            "tag_name": "v23.12.1",
            "name": "Anki 23.12.1",
            "body": null,
            "prerelease": false,
            "html_url": "https://github.com/ankitects/anki/releases/tag/23.12.1",
            "upload_url": "https://uploads.github.com/repos/ankitects/anki/releases/42/assets{?name,label}",
            "assets": [{"id": 1, "name": "anki.tar.zst", "size": 10, "browser_download_url": "https://x"}],
            "author": {"login": "dae"}
        }"#;
        let release: Release = serde_json::from_str(json).unwrap();
        assert_eq!(release.tag_name, "v23.12.1");
        assert!(release.body.is_none());
        assert_eq!(release.assets.len(), 1);
    }
}
