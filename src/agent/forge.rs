//! Forge API access: repository listing and pull-request creation.
//!
//! The pipeline talks to the forge through the [`Forge`] trait so tests can
//! substitute a recording mock; the one real implementation targets the
//! GitHub REST API with a personal access token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::protocol::Repository;

const GITHUB_API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("pocketclaw/", env!("CARGO_PKG_VERSION"));

/// A created pull request, as surfaced to the mobile in `task_done`.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub url: String,
    pub title: String,
}

/// Forge operations required by the task pipeline.
#[async_trait]
pub trait Forge: Send + Sync {
    /// Repositories accessible to the configured credential, most recently
    /// updated first, capped at 100.
    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    /// Open a pull request from `head` into `base` on `repo`.
    async fn create_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;
}

/// GitHub implementation of [`Forge`].
pub struct GitHubForge {
    token: String,
    api_base: String,
    client: reqwest::Client,
}

impl GitHubForge {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(token, "https://api.github.com")
    }

    /// Construct against an explicit API base URL (enterprise hosts, tests).
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: api_base.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), endpoint)
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(endpoint))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .bearer_auth(&self.token)
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(Error::Forge(format!("GitHub {}: {}", status, message)));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl Forge for GitHubForge {
    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let response = self
            .request(
                reqwest::Method::GET,
                "/user/repos?sort=updated&per_page=100",
            )
            .send()
            .await?;
        let payload: Vec<GithubRepo> = Self::parse(response).await?;
        Ok(payload.into_iter().map(GithubRepo::into_repository).collect())
    }

    async fn create_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        let endpoint = format!("/repos/{}/pulls", repo);
        let response = self
            .request(reqwest::Method::POST, &endpoint)
            .json(&json!({
                "title": title,
                "body": body,
                "head": head,
                "base": base,
            }))
            .send()
            .await?;
        let payload: GithubCreatedPr = Self::parse(response).await?;
        Ok(PullRequest {
            url: payload.html_url,
            title: payload.title,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GithubRepo {
    id: u64,
    full_name: String,
    description: Option<String>,
    default_branch: String,
    language: Option<String>,
    private: bool,
    updated_at: DateTime<Utc>,
}

impl GithubRepo {
    fn into_repository(self) -> Repository {
        Repository {
            id: self.id,
            full_name: self.full_name,
            description: self.description,
            default_branch: self.default_branch,
            language: self.language,
            private: self.private,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GithubCreatedPr {
    html_url: String,
    title: String,
}
