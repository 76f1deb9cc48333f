//! On-disk response cache + HTTP fetch utilities for Poolside.
//!
//! The cache and the fetcher are separate capabilities composed behind
//! [`CachedFetcher`], so policy (TTL, retry) can be layered in later
//! without touching call sites.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "poolside-storage";

/// The upstream rejects default client identifiers, so pose as a browser.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/112.0";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response for {url} is not valid JSON: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed response for {url}: {detail}")]
    Malformed { url: String, detail: String },
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The fetch seam: anything that can turn a URL into a JSON value.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: BROWSER_USER_AGENT.to_string(),
            timeout: Some(Duration::from_secs(20)),
        }
    }
}

/// Plain reqwest-backed fetcher. No retry: a failed fetch propagates and
/// aborts the ingest run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(config.user_agent);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Value, FetchError> {
        debug!(url, "http fetch");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Json {
            url: url.to_string(),
            source,
        })
    }
}

/// Content-addressed response cache: one file per URL, named by the
/// SHA-256 of the URL string, holding the JSON body as text. Entries never
/// expire; only manual deletion of the directory invalidates them.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sha256_hex(input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::sha256_hex(url)))
    }

    /// Cached body for `url`, or `None` on miss. A corrupt entry counts as
    /// a miss and the stale file is removed.
    pub async fn get(&self, url: &str) -> Result<Option<Value>, FetchError> {
        let path = self.path_for(url);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                warn!(path = %path.display(), %err, "unreadable cache entry, refetching");
                let _ = fs::remove_file(&path).await;
                return Ok(None);
            }
        };
        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt cache entry, refetching");
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Persist `value` under the key for `url`. Creates the cache
    /// directory lazily.
    pub async fn put(&self, url: &str, value: &Value) -> Result<(), FetchError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(url);
        let text = serde_json::to_string(value).map_err(|source| FetchError::Json {
            url: url.to_string(),
            source,
        })?;
        fs::write(&path, text).await?;
        Ok(())
    }
}

/// `get_or_fetch(url)`: cache hit returns the stored body without touching
/// the network; miss delegates to the inner fetcher and persists the
/// result. Concurrent misses for one URL may both fetch; both write the
/// same content.
pub struct CachedFetcher {
    cache: ResponseCache,
    inner: Box<dyn Fetch>,
}

impl CachedFetcher {
    pub fn new(cache: ResponseCache, inner: Box<dyn Fetch>) -> Self {
        Self { cache, inner }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub async fn get_or_fetch(&self, url: &str) -> Result<Value, FetchError> {
        if let Some(hit) = self.cache.get(url).await? {
            debug!(url, "cache hit");
            return Ok(hit);
        }
        let value = self.inner.fetch(url).await?;
        if let Err(err) = self.cache.put(url, &value).await {
            warn!(url, %err, "cache write failed");
        }
        Ok(value)
    }
}
