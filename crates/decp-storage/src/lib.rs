//! Raw source retrieval: HTTP download with retry/backoff and a per-date file cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "decp-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Sources whose url does not start with `http` are read from disk.
pub fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Downloads allowed in flight at once across all sources.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("download limiter closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
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
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            let last_attempt = attempt >= self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            attempts: attempt + 1,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable || last_attempt {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    warn!(%status, attempt, "retryable http status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || last_attempt
                    {
                        return Err(FetchError::Request(err));
                    }
                    warn!(error = %err, attempt, "retryable request error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// A raw source file available on disk for one run date.
#[derive(Debug, Clone, Serialize)]
pub struct CachedSource {
    pub file_name: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
    /// True when the bytes were downloaded during this call.
    pub downloaded: bool,
}

/// Per-date cache of raw source documents under `<root>/<file_name>_<date>.json`.
#[derive(Debug, Clone)]
pub struct SourceCache {
    root: PathBuf,
}

impl SourceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_path(&self, file_name: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(format!("{file_name}_{}.json", date.format("%Y-%m-%d")))
    }

    /// Load the cached copy for `date`, downloading it first when absent.
    /// Local paths are read in place and never copied into the cache.
    pub async fn fetch_or_load(
        &self,
        fetcher: &HttpFetcher,
        file_name: &str,
        url: &str,
        date: NaiveDate,
    ) -> anyhow::Result<CachedSource> {
        let span = info_span!("fetch_source", file_name, url);
        async {
            if !is_remote(url) {
                let path = PathBuf::from(url);
                return self.describe(file_name, path, false).await;
            }

            let path = self.cache_path(file_name, date);
            if fs::try_exists(&path)
                .await
                .with_context(|| format!("checking cache path {}", path.display()))?
            {
                debug!(path = %path.display(), "reusing cached source");
                return self.describe(file_name, path, false).await;
            }

            let response = fetcher
                .fetch_bytes(url)
                .await
                .with_context(|| format!("downloading {url}"))?;
            write_atomic(&path, &response.body).await?;
            info!(
                bytes = response.body.len(),
                attempts = response.attempts,
                path = %path.display(),
                "downloaded source"
            );
            Ok(CachedSource {
                file_name: file_name.to_string(),
                sha256: sha256_hex(&response.body),
                byte_size: response.body.len(),
                path,
                downloaded: true,
            })
        }
        .instrument(span)
        .await
    }

    async fn describe(
        &self,
        file_name: &str,
        path: PathBuf,
        downloaded: bool,
    ) -> anyhow::Result<CachedSource> {
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(CachedSource {
            file_name: file_name.to_string(),
            sha256: sha256_hex(&bytes),
            byte_size: bytes.len(),
            path,
            downloaded,
        })
    }
}

/// Write through a sibling temp file and rename, so readers never see a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).expect("date")
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn retry_delay_doubles_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };

        let delays: Vec<_> = (0..5).map(|i| policy.delay_for_attempt(i)).collect();
        assert_eq!(
            delays,
            [500, 1000, 2000, 3000, 3000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(3));
    }

    #[test]
    fn only_server_errors_and_throttling_are_retried() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn cache_path_is_dated() {
        let cache = SourceCache::new("/data");
        assert_eq!(
            cache.cache_path("decp-2019", date()),
            PathBuf::from("/data/decp-2019_2024-03-15.json")
        );
        assert!(is_remote("https://www.data.gouv.fr/fr/datasets/r/abc"));
        assert!(!is_remote("fixtures/decp-2019/sample.json"));
    }

    #[tokio::test]
    async fn local_sources_are_read_in_place() {
        let dir = tempdir().expect("tempdir");
        let local = dir.path().join("sample.json");
        std::fs::write(&local, br#"{"marches": []}"#).expect("write");

        let cache = SourceCache::new(dir.path().join("cache"));
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let cached = cache
            .fetch_or_load(&fetcher, "sample", local.to_str().expect("utf8"), date())
            .await
            .expect("load");

        assert_eq!(cached.path, local);
        assert!(!cached.downloaded);
        assert_eq!(cached.byte_size, 15);
        assert!(!cache.root().exists());
    }

    #[tokio::test]
    async fn existing_dated_file_is_reused_without_download() {
        let dir = tempdir().expect("tempdir");
        let cache = SourceCache::new(dir.path());
        let path = cache.cache_path("decp", date());
        write_atomic(&path, b"[]").await.expect("seed");

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        // Unroutable url: any network access would fail the test.
        let cached = cache
            .fetch_or_load(&fetcher, "decp", "http://127.0.0.1:9/decp.json", date())
            .await
            .expect("cached");
        assert!(!cached.downloaded);
        assert_eq!(cached.sha256, sha256_hex(b"[]"));
    }

    #[tokio::test]
    async fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.json");
        write_atomic(&path, b"first").await.expect("first");
        write_atomic(&path, b"second").await.expect("second");

        assert_eq!(std::fs::read(&path).expect("read"), b"second");
        let leftovers = std::fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1);
    }
}
