//! Fetches the dataset from the publisher's HTTP endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Client, Url,
    header::{self, HeaderName, HeaderValue},
};
use secrecy::{ExposeSecret, SecretString};
use shared_utils::env::get_env_var;
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::source::{
    ApiKeySnafu, ClientBuildSnafu, DataSource, InvalidHeaderSnafu, InvalidUrlSnafu, RequestSnafu,
    SourceInitError, StatusSnafu, TransportError,
};

/// Default header carrying the API key.
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";

/// Error bodies are cut to this many bytes before they end up in logs.
const MAX_ERROR_BODY: usize = 512;

/// Settings for [`HttpSource`].
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Absolute URL of the published dataset.
    pub url: String,
    /// Optional API key, sent in `api_key_header`.
    pub api_key: Option<SecretString>,
    /// Header name for the API key.
    pub api_key_header: String,
    /// Whole-request timeout, including reading the body.
    pub timeout: Duration,
}

impl HttpSourceConfig {
    /// Config for `url` with no API key and a 30 second timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Reads the API key from the environment variable `name`.
    pub fn with_api_key_env(mut self, name: &str) -> Result<Self, SourceInitError> {
        let key = get_env_var(name).context(ApiKeySnafu)?;
        self.api_key = Some(SecretString::new(key.into()));
        Ok(self)
    }
}

/// [`DataSource`] backed by a single HTTP GET.
pub struct HttpSource {
    client: Client,
    url: Url,
}

impl HttpSource {
    /// Builds the HTTP client. The API key, if any, is installed as a
    /// sensitive default header so it never shows up in debug output.
    pub fn new(config: HttpSourceConfig) -> Result<Self, SourceInitError> {
        let url = Url::parse(&config.url).map_err(|e| {
            InvalidUrlSnafu {
                url: config.url.clone(),
                message: e.to_string(),
            }
            .build()
        })?;
        ensure!(
            matches!(url.scheme(), "http" | "https"),
            InvalidUrlSnafu {
                url: config.url.clone(),
                message: format!("unsupported scheme {}", url.scheme()),
            }
        );

        let mut headers = header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            let name = HeaderName::from_bytes(config.api_key_header.as_bytes()).map_err(|e| {
                InvalidHeaderSnafu {
                    message: format!("{}: {e}", config.api_key_header),
                }
                .build()
            })?;
            let mut value = HeaderValue::from_str(key.expose_secret()).map_err(|_| {
                InvalidHeaderSnafu {
                    message: "API key contains characters not allowed in a header".to_string(),
                }
                .build()
            })?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .user_agent(concat!("epi-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(ClientBuildSnafu)?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl DataSource for HttpSource {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn fetch(&self) -> Result<Vec<u8>, TransportError> {
        let url = self.url.as_str();
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .context(RequestSnafu { url })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            truncate_at_char_boundary(&mut body, MAX_ERROR_BODY);
            return StatusSnafu {
                url,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        let bytes = response.bytes().await.context(RequestSnafu { url })?;
        debug!(url, bytes = bytes.len(), "fetched dataset");
        Ok(bytes.to_vec())
    }
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        let err = HttpSource::new(HttpSourceConfig::new("ftp://example.org/data.json"))
            .err()
            .expect("ftp is rejected");
        assert!(matches!(err, SourceInitError::InvalidUrl { .. }));

        let err = HttpSource::new(HttpSourceConfig::new("not a url"))
            .err()
            .expect("garbage is rejected");
        assert!(matches!(err, SourceInitError::InvalidUrl { .. }));
    }

    #[test]
    fn rejects_bad_header_name() {
        let mut cfg = HttpSourceConfig::new("https://example.org/data.json");
        cfg.api_key = Some(SecretString::new("k".into()));
        cfg.api_key_header = "bad header".into();
        let err = HttpSource::new(cfg).err().expect("space in header name");
        assert!(matches!(err, SourceInitError::InvalidHeader { .. }));
    }

    #[test]
    fn truncation_respects_utf8() {
        let mut s = "ééééé".to_string(); // 2 bytes each
        truncate_at_char_boundary(&mut s, 3);
        assert_eq!(s, "é");
    }

    #[test]
    fn missing_api_key_env_is_an_init_error() {
        let err = HttpSourceConfig::new("https://example.org")
            .with_api_key_env("EPI_SOURCE_TEST_KEY_SURELY_UNSET_7C1")
            .unwrap_err();
        assert!(matches!(err, SourceInitError::ApiKey { .. }));
    }
}
