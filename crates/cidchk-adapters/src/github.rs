//! Issue tracker reads (issues, comments) and the optional report comment write.

use std::sync::Arc;

use cidchk_storage::{FetchError, HttpClient, RetryPolicy};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

const PER_PAGE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAuthor {
    pub login: String,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    pub user: CommentAuthor,
}

impl IssueComment {
    pub fn text(&self) -> &str {
        self.body.as_deref().unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct GithubClient {
    http: Arc<HttpClient>,
    api_base: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl GithubClient {
    pub fn new(http: Arc<HttpClient>, api_base: impl Into<String>, token: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
            retry,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .http
            .request(method, &format!("{}{}", self.api_base, path))
            .header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// `repository` is `owner/name`.
    pub async fn get_issue(&self, repository: &str, number: u64) -> Result<Issue, FetchError> {
        let path = format!("/repos/{repository}/issues/{number}");
        self.retry
            .run("get_issue", || self.http.execute_json(self.request(Method::GET, &path)))
            .await
    }

    /// Every comment on the issue, oldest first, following pagination.
    pub async fn list_comments(&self, repository: &str, number: u64) -> Result<Vec<IssueComment>, FetchError> {
        let mut comments = Vec::new();
        for page in 1.. {
            let path = format!("/repos/{repository}/issues/{number}/comments?per_page={PER_PAGE}&page={page}");
            let batch: Vec<IssueComment> = self
                .retry
                .run("list_comments", || self.http.execute_json(self.request(Method::GET, &path)))
                .await?;
            let done = batch.len() < PER_PAGE;
            comments.extend(batch);
            if done {
                break;
            }
        }
        debug!(repository, number, count = comments.len(), "listed issue comments");
        Ok(comments)
    }

    /// Posts a comment once; writes are not retried.
    pub async fn create_comment(&self, repository: &str, number: u64, body: &str) -> Result<String, FetchError> {
        #[derive(Deserialize)]
        struct Created {
            html_url: String,
        }
        let path = format!("/repos/{repository}/issues/{number}/comments");
        let created: Created = self
            .http
            .execute_json(self.request(Method::POST, &path).json(&json!({ "body": body })))
            .await?;
        info!(repository, number, url = %created.html_url, "posted report comment");
        Ok(created.html_url)
    }
}
