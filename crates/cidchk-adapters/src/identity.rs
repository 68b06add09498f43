//! Identity Resolver: verified-client registry lookups plus approval history
//! and allocation rounds read from the application issue's comments.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cidchk_core::ApplicationInfo;
use cidchk_storage::{FetchError, HttpClient, MemoCache, RetryPolicy};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use crate::github::{GithubClient, IssueComment};

/// Registry calls get a longer attempt budget than the other collaborators.
pub const REGISTRY_MAX_ATTEMPTS: usize = 6;

const APPROVAL_PREFIXES: [&str; 2] = ["Request Approved", "Request Proposed"];

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("verified-client registry: {0}")]
    Registry(#[source] FetchError),
    #[error("issue comments for {repository}#{number}: {source}")]
    Comments {
        repository: String,
        number: u64,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AllocationBot {
    /// Numeric actor id of the bot that posts allocation requests.
    pub user_id: u64,
    /// Text that marks an allocation-request comment.
    pub marker: String,
}

#[derive(Debug, Deserialize)]
struct RegistryPage {
    #[serde(default)]
    data: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryEntry {
    #[serde(default)]
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    org_name: Option<String>,
    #[serde(default)]
    initial_allowance: JsonValue,
    #[serde(default)]
    audit_trail: Option<String>,
    #[serde(default)]
    verifier_name: Option<String>,
}

impl RegistryEntry {
    fn allowance(&self) -> u128 {
        match &self.initial_allowance {
            JsonValue::Number(n) => n.as_u64().map(u128::from).unwrap_or(0),
            JsonValue::String(s) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn into_info(self) -> ApplicationInfo {
        let organization_name = format!(
            "{}{}",
            self.name.unwrap_or_default(),
            self.org_name.unwrap_or_default()
        )
        .trim()
        .to_string();
        let trail = self.audit_trail.filter(|t| !t.trim().is_empty());
        let (issue_repository, issue_number) = trail
            .as_deref()
            .map(parse_audit_trail)
            .unwrap_or((None, None));
        ApplicationInfo {
            client_address: self.address,
            organization_name,
            url: trail,
            verifier_name: self.verifier_name.filter(|v| !v.is_empty()),
            issue_repository,
            issue_number,
        }
    }
}

/// Repository and issue number from `https://github.com/{owner}/{repo}/issues/{n}`.
/// The number is the trailing path segment; the repository only when the URL
/// has the issue-tracker shape. Query strings and fragments are ignored.
pub fn parse_audit_trail(url: &str) -> (Option<String>, Option<u64>) {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return (None, None);
    };
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let number = segments.last().and_then(|last| last.parse().ok());
    let repository = match segments.as_slice() {
        [owner, repo, "issues" | "pull", _] => Some(format!("{owner}/{repo}")),
        _ => None,
    };
    (repository, number)
}

/// Largest allowance wins; ties fall back to the lexicographically smallest
/// audit trail so repeated lookups agree.
fn pick_authoritative(entries: Vec<RegistryEntry>) -> Option<RegistryEntry> {
    entries.into_iter().min_by(|a, b| match b.allowance().cmp(&a.allowance()) {
        Ordering::Equal => a.audit_trail.cmp(&b.audit_trail),
        other => other,
    })
}

/// Tally approval comments per author, sorted by author login.
pub fn tally_approvers(comments: &[IssueComment]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for comment in comments {
        let body = comment.text().trim_start_matches(|c: char| c == '#' || c.is_whitespace());
        if APPROVAL_PREFIXES.iter().any(|prefix| body.starts_with(prefix)) {
            *counts.entry(comment.user.login.as_str()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|(login, count)| (login.to_string(), count))
        .collect()
}

pub fn count_allocation_requests(comments: &[IssueComment], bot: &AllocationBot) -> u32 {
    comments
        .iter()
        .filter(|c| c.user.id == bot.user_id && c.text().contains(&bot.marker))
        .count() as u32
}

/// Registry and approval-history surface used by the orchestrator.
#[async_trait]
pub trait ApplicationDirectory: Send + Sync {
    async fn find_application_info(&self, client_address: &str) -> Result<Option<ApplicationInfo>, IdentityError>;

    async fn approvers(&self, repository: &str, number: u64) -> Result<Vec<(String, usize)>, IdentityError>;

    async fn allocation_round(&self, repository: &str, number: u64) -> Result<u32, IdentityError>;
}

pub struct IdentityResolver {
    http: Arc<HttpClient>,
    github: Arc<GithubClient>,
    registry: RegistryConfig,
    bot: AllocationBot,
    retry: RetryPolicy,
    applications: MemoCache<String, Option<ApplicationInfo>>,
    comments: MemoCache<(String, u64), Arc<Vec<IssueComment>>>,
}

impl IdentityResolver {
    pub fn new(
        http: Arc<HttpClient>,
        github: Arc<GithubClient>,
        registry: RegistryConfig,
        bot: AllocationBot,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            github,
            registry,
            bot,
            retry: retry.with_max_attempts(REGISTRY_MAX_ATTEMPTS),
            applications: MemoCache::new(),
            comments: MemoCache::new(),
        }
    }

    /// Registry view of a client address. Cached for the life of the
    /// resolver, including the not-found case.
    pub async fn find_application_info(&self, client_address: &str) -> Result<Option<ApplicationInfo>, IdentityError> {
        self.applications
            .get_or_try_insert_with(client_address.to_string(), || self.fetch_application_info(client_address))
            .await
    }

    async fn fetch_application_info(&self, client_address: &str) -> Result<Option<ApplicationInfo>, IdentityError> {
        let url = format!(
            "{}/public/api/getVerifiedClients",
            self.registry.base_url.trim_end_matches('/')
        );
        let page: RegistryPage = self
            .retry
            .run("get_verified_clients", || {
                let mut request = self
                    .http
                    .request(Method::GET, &url)
                    .query(&[("filter", client_address)]);
                if let Some(key) = &self.registry.api_key {
                    request = request.header("X-API-KEY", key);
                }
                self.http.execute_json(request)
            })
            .await
            .map_err(IdentityError::Registry)?;

        let matching: Vec<RegistryEntry> = page
            .data
            .into_iter()
            .filter(|entry| entry.address == client_address)
            .collect();
        debug!(client_address, candidates = matching.len(), "registry lookup");
        let info = pick_authoritative(matching).map(RegistryEntry::into_info);
        if info.is_none() {
            info!(client_address, "client not found in verified-client registry");
        }
        Ok(info)
    }

    /// Every comment on an issue; fetched once per `(repository, number)`.
    pub async fn comments(&self, repository: &str, number: u64) -> Result<Arc<Vec<IssueComment>>, IdentityError> {
        self.comments
            .get_or_try_insert_with((repository.to_string(), number), || async {
                self.github
                    .list_comments(repository, number)
                    .await
                    .map(Arc::new)
                    .map_err(|source| IdentityError::Comments {
                        repository: repository.to_string(),
                        number,
                        source,
                    })
            })
            .await
    }

    pub async fn approvers(&self, repository: &str, number: u64) -> Result<Vec<(String, usize)>, IdentityError> {
        Ok(tally_approvers(&self.comments(repository, number).await?))
    }

    /// Number of allocation requests the bot has posted on the issue.
    pub async fn allocation_round(&self, repository: &str, number: u64) -> Result<u32, IdentityError> {
        Ok(count_allocation_requests(
            &self.comments(repository, number).await?,
            &self.bot,
        ))
    }
}

#[async_trait]
impl ApplicationDirectory for IdentityResolver {
    async fn find_application_info(&self, client_address: &str) -> Result<Option<ApplicationInfo>, IdentityError> {
        IdentityResolver::find_application_info(self, client_address).await
    }

    async fn approvers(&self, repository: &str, number: u64) -> Result<Vec<(String, usize)>, IdentityError> {
        IdentityResolver::approvers(self, repository, number).await
    }

    async fn allocation_round(&self, repository: &str, number: u64) -> Result<u32, IdentityError> {
        IdentityResolver::allocation_round(self, repository, number).await
    }
}
