// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, USER_AGENT};

/// Browser-like user agent; some podcast hosts reject unknown clients
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// A streaming response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// HTTP response with status, content length, and body stream
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Length header value, if present
    pub content_length: Option<u64>,
    /// Content-Type header value, if present
    pub content_type: Option<String>,
    /// Response body as a stream of bytes
    pub body: ByteStream,
}

/// Headers learned from a metadata-only (HEAD) request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Timeouts and identity used for outgoing requests
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Upper bound for a HEAD probe
    pub probe_timeout: Duration,
    /// Maximum wait for the response head and for each body chunk
    pub stream_idle_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// HTTP client abstraction for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetch the entire response body as bytes
    async fn get_bytes(&self, url: &str) -> Result<HttpBytes, reqwest::Error>;

    /// Issue a HEAD request to learn size and type without a body
    async fn probe(&self, url: &str) -> Result<ProbeResponse, reqwest::Error>;

    /// Get a streaming response for large downloads
    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error>;
}

/// Fully buffered response, used for feed documents
pub struct HttpBytes {
    pub status: u16,
    pub body: Bytes,
}

/// Default HTTP client implementation using reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    config: HttpConfig,
}

impl ReqwestClient {
    /// Create a new ReqwestClient with default settings
    pub fn new() -> Self {
        Self::with_config(HttpConfig::default())
    }

    /// Create a new ReqwestClient using the given timeouts and user agent
    pub fn with_config(config: HttpConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Create a new ReqwestClient with a custom reqwest::Client
    pub fn with_client(client: reqwest::Client, config: HttpConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_bytes(&self, url: &str) -> Result<HttpBytes, reqwest::Error> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, self.config.user_agent.as_str())
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(HttpBytes { status, body })
    }

    async fn probe(&self, url: &str) -> Result<ProbeResponse, reqwest::Error> {
        let response = self
            .client
            .head(url)
            .header(ACCEPT, "*/*")
            .header(USER_AGENT, self.config.user_agent.as_str())
            .timeout(self.config.probe_timeout)
            .send()
            .await?;

        // A HEAD body is always empty, so the length must come from the header itself
        let headers = response.headers();
        Ok(ProbeResponse {
            status: response.status().as_u16(),
            content_length: header_str(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            content_type: header_str(headers, CONTENT_TYPE),
        })
    }

    async fn get_stream(&self, url: &str) -> Result<HttpResponse, reqwest::Error> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, self.config.user_agent.as_str())
            .send()
            .await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let content_type = header_str(response.headers(), CONTENT_TYPE);

        let body: ByteStream = Box::pin(response.bytes_stream());

        Ok(HttpResponse {
            status,
            content_length,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reqwest_client_can_be_created() {
        let _client = ReqwestClient::new();
        let _client_default = ReqwestClient::default();
    }

    #[test]
    fn reqwest_client_can_be_cloned() {
        let client = ReqwestClient::new();
        let _cloned = client.clone();
    }

    #[test]
    fn default_config_uses_browser_user_agent() {
        let client = ReqwestClient::new();
        assert_eq!(client.config().user_agent, DEFAULT_USER_AGENT);
        assert_eq!(client.config().probe_timeout, Duration::from_secs(30));
    }

    #[test]
    fn header_str_skips_blank_values() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "  ".parse().unwrap());
        assert_eq!(header_str(&headers, CONTENT_TYPE), None);

        headers.insert(CONTENT_TYPE, "audio/mpeg".parse().unwrap());
        assert_eq!(
            header_str(&headers, CONTENT_TYPE),
            Some("audio/mpeg".to_string())
        );
    }
}
