use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{ChangedFile, CommitState, GhPull, IssueComment, ScmError, SourceControl};
use crate::config::GitHubConfig;

const PER_PAGE: usize = 100;

/// GitHub REST v3 client scoped to one repository owner.
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    owner: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig, timeout: Duration) -> Result<Self, ScmError> {
        let http = reqwest::Client::builder()
            .user_agent("pr-buildbot")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            token: config.token.clone(),
        })
    }

    fn repo_url(&self, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, self.owner, repo, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ScmError> {
        let response = self
            .authorize(self.http.get(url))
            .header("Accept", "application/vnd.github+json")
            .query(query)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ScmError::NotFound(url.to_string()));
        }
        Ok(response.error_for_status()?.json::<T>().await?)
    }

    /// Follow page numbers until a short page comes back.
    async fn get_paged<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ScmError> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let mut params = query.to_vec();
            params.push(("per_page", PER_PAGE.to_string()));
            params.push(("page", page.to_string()));
            let batch: Vec<T> = self.get_json(url, &params).await?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                return Ok(items);
            }
            page += 1;
        }
    }

    async fn post_json(&self, url: &str, body: serde_json::Value) -> Result<(), ScmError> {
        self.authorize(self.http.post(url))
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl SourceControl for GitHubClient {
    #[instrument(skip(self))]
    async fn list_open_pulls(&self, repo: &str) -> Result<Vec<GhPull>, ScmError> {
        let pulls: Vec<GhPull> = self
            .get_paged(&self.repo_url(repo, "pulls"), &[("state", "open".to_string())])
            .await?;
        debug!(count = pulls.len(), "listed open pulls");
        Ok(pulls)
    }

    #[instrument(skip(self))]
    async fn get_pull(&self, repo: &str, number: u64) -> Result<GhPull, ScmError> {
        self.get_json(&self.repo_url(repo, &format!("pulls/{number}")), &[])
            .await
    }

    #[instrument(skip(self))]
    async fn get_files(&self, repo: &str, number: u64) -> Result<Vec<ChangedFile>, ScmError> {
        let files: Vec<ChangedFile> = self
            .get_paged(&self.repo_url(repo, &format!("pulls/{number}/files")), &[])
            .await?;
        debug!(count = files.len(), "listed pull files");
        Ok(files)
    }

    #[instrument(skip(self))]
    async fn get_issue_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<IssueComment>, ScmError> {
        self.get_paged(&self.repo_url(repo, &format!("issues/{number}/comments")), &[])
            .await
    }

    #[instrument(skip(self, body))]
    async fn create_comment(&self, repo: &str, number: u64, body: &str) -> Result<(), ScmError> {
        self.post_json(
            &self.repo_url(repo, &format!("issues/{number}/comments")),
            json!({ "body": body }),
        )
        .await
    }

    #[instrument(skip(self, body))]
    async fn create_inline_comment(
        &self,
        repo: &str,
        number: u64,
        sha: &str,
        file: &str,
        position: u64,
        body: &str,
    ) -> Result<(), ScmError> {
        self.post_json(
            &self.repo_url(repo, &format!("pulls/{number}/comments")),
            json!({
                "body": body,
                "commit_id": sha,
                "path": file,
                "position": position,
            }),
        )
        .await
    }

    #[instrument(skip(self, target_url, description))]
    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        target_url: &str,
        description: &str,
    ) -> Result<(), ScmError> {
        self.post_json(
            &self.repo_url(repo, &format!("statuses/{sha}")),
            json!({
                "state": state.as_str(),
                "target_url": target_url,
                "description": description,
                "context": "pr-buildbot",
            }),
        )
        .await
    }
}
