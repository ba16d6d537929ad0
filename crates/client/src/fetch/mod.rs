//! HTTP transport for conditional GETs.
//!
//! ### Conditional requests
//! - `If-None-Match` is sent when the cached entry has an ETag
//! - `If-Modified-Since` is sent when it has a Last-Modified value
//! - `304 Not Modified` maps to [`TransportResponse::NotModified`]
//!
//! ### Failure mapping
//! - connect / DNS / timeout / body read errors: `Error::Network`
//! - any status other than 2xx or 304: `Error::HttpError`
//! - bodies above `max_bytes`: `Error::FetchTooLarge`
//!
//! The fetcher absorbs every one of these; nothing here retries.

#[cfg(test)]
pub(crate) mod testing;

use bytes::Bytes;
use reqwest::{Client, StatusCode, header};
use std::time::{Duration, Instant};
use url::Url;

use scrapekit_core::{AppConfig, CacheEntry, Error};

/// Transport settings, usually derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,

    /// Bodies larger than this are rejected, not truncated.
    pub max_bytes: usize,

    /// Whole-request deadline, connect through last body byte.
    pub timeout: Duration,

    /// Redirect hops before giving up.
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
            timeout: config.timeout(),
            max_redirects: config.max_redirects,
        }
    }
}

/// Revalidation tokens carried over from a previous response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self { etag: entry.etag.clone(), last_modified: entry.last_modified.clone() }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// ETag as it should be echoed back.
    ///
    /// Apache's mod_deflate appends `-gzip` to the ETag it sends but never
    /// matches that form in `If-None-Match`, so the suffix is stripped.
    fn if_none_match(&self) -> Option<String> {
        self.etag.as_deref().map(|etag| match etag.strip_suffix("-gzip\"") {
            Some(head) => format!("{head}\""),
            None => etag.to_string(),
        })
    }
}

/// What the remote said about a target.
#[derive(Debug, Clone)]
pub enum TransportResponse {
    /// New content (2xx).
    Modified {
        body: Bytes,
        etag: Option<String>,
        last_modified: Option<String>,
        content_type: Option<String>,
        final_url: Url,
    },
    /// The validators still match (304).
    NotModified,
}

/// Issues GET requests on behalf of the fetcher.
///
/// Implementations report every problem as an `Err`; deciding what is fatal
/// is the fetcher's job.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// GET `url`, conditionally if `validators` are non-empty.
    async fn get(&self, url: &Url, validators: &Validators) -> Result<TransportResponse, Error>;
}

/// reqwest-backed transport.
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
}

impl FetchClient {
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

fn header_string(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

fn network_error(url: &Url, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Network(format!("timeout fetching {url}"))
    } else {
        Error::Network(format!("{url}: {err}"))
    }
}

#[async_trait::async_trait]
impl Transport for FetchClient {
    async fn get(&self, url: &Url, validators: &Validators) -> Result<TransportResponse, Error> {
        let start = Instant::now();

        let mut request = self.http.get(url.as_str());
        if let Some(etag) = validators.if_none_match() {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await.map_err(|e| network_error(url, &e))?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            tracing::debug!("{} not modified ({}ms)", url, start.elapsed().as_millis());
            return Ok(TransportResponse::NotModified);
        }

        if !status.is_success() {
            return Err(Error::HttpError(format!("{url}: status {}", status.as_u16())));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::FetchTooLarge(format!("{len} bytes exceeds {}", self.config.max_bytes)));
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();

        let body = response.bytes().await.map_err(|e| network_error(url, &e))?;

        if body.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", body.len(), self.config.max_bytes)));
        }

        tracing::debug!(
            "fetched {} -> {} in {}ms ({} bytes)",
            url,
            final_url,
            start.elapsed().as_millis(),
            body.len()
        );

        Ok(TransportResponse::Modified {
            body,
            etag: header_string(&headers, header::ETAG),
            last_modified: header_string(&headers, header::LAST_MODIFIED),
            content_type: header_string(&headers, header::CONTENT_TYPE),
            final_url,
        })
    }
}
