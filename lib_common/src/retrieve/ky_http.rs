//! # HTTP Retrieval Utilities
//!
//! This module provides an asynchronous API client wrapper around `reqwest`.
//! It includes middleware support for exponential backoff retries, a bounded
//! request timeout and standardized JSON response handling.

use std::time::Duration;

use reqwest::{header::HeaderMap, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

use crate::error::RetrieveError;

/// A standardized container for API responses.
///
/// This struct wraps the deserialized data along with metadata about the
/// HTTP transaction, such as status codes and headers.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ApiClientOptions {
    /// Hard limit for a whole request, connect to last body byte.
    pub timeout: Duration,
    /// Transient-failure retries. Zero disables the retry middleware's effect.
    pub max_retries: u32,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 0,
        }
    }
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs, a bounded
/// timeout and automatic retries.
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
}

impl ApiClient {
    /// Creates a new `ApiClient`.
    ///
    /// A missing trailing slash on `base_url` is added so that relative paths
    /// join under it instead of replacing its last segment.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the TLS backend cannot initialize.
    pub fn new(base_url: &str, options: ApiClientOptions) -> Result<Self, RetrieveError> {
        let mut url = Url::parse(base_url)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
        let http = reqwest::Client::builder().timeout(options.timeout).build()?;
        let client = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
        })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Joins `path` under the base URL and appends `query` pairs (percent-encoded).
    pub fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, RetrieveError> {
        let mut url = self.base_url.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }

    /// Performs a request and decodes a JSON body on success.
    ///
    /// Non-2xx responses are not errors: they come back with `success == false`
    /// and the raw body in `error_body`.
    ///
    /// # Errors
    /// [`RetrieveError::Timeout`] when the time budget runs out, otherwise
    /// transport or body decoding failures.
    pub async fn request<T>(
        &self,
        method: Method,
        url: Url,
        headers: Option<HeaderMap>,
    ) -> Result<ApiResponse<T>, RetrieveError>
    where
        T: DeserializeOwned,
    {
        let mut req = self.inner.request(method, url);
        if let Some(h) = headers {
            req = req.headers(h);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }
}
