//! Retry policy, HTTP plumbing, memo caches and artifact upload for the checker.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cidchk-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry with capped exponential backoff, shared by every external call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts || err.disposition() == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    warn!(operation, attempt, error = %err, "call failed, retrying");
                    tokio::time::sleep(self.delay_for_attempt(attempt - 1)).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("cidchk/{}", env!("CARGO_PKG_VERSION"))),
            global_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client is shutting down")]
    Shutdown,
}

impl Retryable for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } | FetchError::Shutdown => RetryDisposition::NonRetryable,
        }
    }
}

/// Thin reqwest wrapper with a global in-flight limit. Each `execute` is a
/// single attempt; callers wrap it in a [`RetryPolicy`].
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    pub async fn execute(&self, request: RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(url = %final_url, status = status.as_u16(), bytes = body.len(), "http response");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, FetchError> {
        self.execute(request).await?.json()
    }
}

/// Process-lifetime memoization keyed by an immutable key. No eviction, no TTL:
/// entries are only dropped by [`MemoCache::clear`] or process exit.
#[derive(Debug)]
pub struct MemoCache<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for MemoCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> MemoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Return the cached value or compute, store and return it. Failed
    /// computations are not cached. Two concurrent first lookups of the same
    /// key may both compute; the first stored value wins.
    pub async fn get_or_try_insert_with<E, F, Fut>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = init().await?;
        let mut entries = self.entries.lock().await;
        Ok(entries.entry(key).or_insert(value).clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("upload of {path} returned status {status}, expected 201")]
    UnexpectedStatus { path: String, status: u16 },
    #[error("upload of {path} returned no download url")]
    MissingDownloadUrl { path: String },
    #[error("local artifact store: {0:#}")]
    Local(#[from] anyhow::Error),
}

/// Persists a generated artifact and returns where it can be retrieved.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8], message: &str) -> Result<String, UploadError>;
}

/// `{repository}/issues/{issue}/{uuid}.{ext}`
pub fn artifact_path(repository: &str, issue_number: u64, extension: &str) -> String {
    let ext = extension.trim_start_matches('.');
    format!("{repository}/issues/{issue_number}/{}.{ext}", Uuid::new_v4())
}

#[derive(Debug, Clone)]
pub struct GithubUploadConfig {
    pub api_base: String,
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub committer_name: String,
    pub committer_email: String,
}

#[derive(Debug, Serialize)]
struct ContentsPut<'a> {
    message: &'a str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
    committer: Committer<'a>,
}

#[derive(Debug, Serialize)]
struct Committer<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Debug, Deserialize)]
struct ContentsPutResponse {
    content: Option<ContentsPutFile>,
}

#[derive(Debug, Deserialize)]
struct ContentsPutFile {
    download_url: Option<String>,
}

/// Uses a repository's contents API as the artifact store. Writes overwrite by path.
#[derive(Debug, Clone)]
pub struct GithubContentsUploader {
    http: Arc<HttpClient>,
    config: GithubUploadConfig,
}

impl GithubContentsUploader {
    pub fn new(http: Arc<HttpClient>, config: GithubUploadConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ArtifactUploader for GithubContentsUploader {
    async fn upload(&self, path: &str, bytes: &[u8], message: &str) -> Result<String, UploadError> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            path.trim_start_matches('/')
        );
        let body = ContentsPut {
            message,
            content: STANDARD.encode(bytes),
            branch: self.config.branch.as_deref(),
            committer: Committer {
                name: &self.config.committer_name,
                email: &self.config.committer_email,
            },
        };
        let request = self
            .http
            .request(Method::PUT, &url)
            .bearer_auth(&self.config.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .json(&body);
        let response = self.http.execute(request).await?;
        if response.status != StatusCode::CREATED {
            return Err(UploadError::UnexpectedStatus {
                path: path.to_string(),
                status: response.status.as_u16(),
            });
        }
        let parsed: ContentsPutResponse = response.json()?;
        let download_url = parsed
            .content
            .and_then(|c| c.download_url)
            .ok_or_else(|| UploadError::MissingDownloadUrl {
                path: path.to_string(),
            })?;
        info!(path, bytes = bytes.len(), "uploaded artifact");
        Ok(download_url)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Filesystem artifact store for dry runs. Files are addressed by content hash
/// inside the logical directory of the requested path.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(&self, logical_path: &str, content_hash: &str) -> PathBuf {
        let logical = Path::new(logical_path.trim_start_matches('/'));
        let ext = logical
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or("bin");
        logical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(&self, logical_path: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(logical_path, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[async_trait]
impl ArtifactUploader for LocalArtifactStore {
    async fn upload(&self, path: &str, bytes: &[u8], message: &str) -> Result<String, UploadError> {
        let stored = self.store_bytes(path, bytes).await?;
        info!(path, message, stored = %stored.absolute_path.display(), "stored artifact locally");
        Ok(stored.absolute_path.display().to_string())
    }
}
