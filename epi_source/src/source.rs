//! The upstream contract and its error types.

use async_trait::async_trait;
use shared_utils::env::EnvVarError;
use snafu::{Backtrace, Snafu};

/// Fetches the raw published dataset.
///
/// Implementations must not interpret the payload: parsing belongs to the
/// normalizer so that a malformed upstream document is reported as a parse
/// failure, not a transport one. Every [`TransportError`] is considered
/// retryable by callers.
///
/// Dropping the returned future must abort the fetch; schedulers rely on that
/// for prompt shutdown.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short human-readable description used in logs (URL or path).
    fn describe(&self) -> String;

    /// Fetches the complete current payload.
    async fn fetch(&self) -> Result<Vec<u8>, TransportError>;
}

/// Errors that can occur while building a source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceInitError {
    /// The API key variable named in the settings is missing or blank.
    #[snafu(display("API key unavailable: {source}"))]
    ApiKey {
        source: EnvVarError,
        backtrace: Backtrace,
    },

    /// failed to init reqwest client
    #[snafu(display("Failed to build HTTP client: {source}"))]
    ClientBuild {
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    /// API key or header name contains invalid characters.
    #[snafu(display("Invalid API key header: {message}"))]
    InvalidHeader {
        message: String,
        backtrace: Backtrace,
    },

    /// The endpoint is not an absolute http(s) URL.
    #[snafu(display("Invalid source URL {url}: {message}"))]
    InvalidUrl {
        url: String,
        message: String,
        backtrace: Backtrace,
    },
}

/// Failures while talking to the upstream publisher.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// Network failure, TLS failure, timeout, or body read error.
    #[snafu(display("request to {url} failed: {source}"))]
    Request {
        url: String,
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    /// The publisher answered with a non-success status.
    #[snafu(display("{url} answered {status}: {body}"))]
    Status {
        url: String,
        status: u16,
        body: String,
        backtrace: Backtrace,
    },

    /// The local payload file could not be read.
    #[snafu(display("failed to read {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// The source is temporarily unable to serve a payload.
    #[snafu(display("source unavailable: {message}"))]
    Unavailable {
        message: String,
        backtrace: Backtrace,
    },
}
