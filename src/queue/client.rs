//! Remote-write delivery client and terminal-error classification.

use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::queue::batch::SignalBatch;

/// A delivery failure as reported by the remote endpoint.
#[derive(Debug, Clone)]
pub struct RemoteWriteError {
    pub message: String,
}

impl std::fmt::Display for RemoteWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteWriteError {}

/// Submits encoded batches to the remote endpoint. Mockable so writer
/// behavior is testable without a network.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn send(&self, batch: &SignalBatch) -> Result<(), RemoteWriteError>;

    fn endpoint(&self) -> String;
}

/// Decides whether a remote error is terminal for its batch.
///
/// The remote reports terminal data errors (out-of-order samples, rejected
/// samples) as message text; matching is by substring and the descriptor
/// list is configuration, not code.
#[derive(Debug, Clone)]
pub struct TerminalErrorClassifier {
    descriptors: Vec<String>,
}

pub fn default_terminal_errors() -> Vec<String> {
    vec![
        "out of order".to_string(),
        "the sample has been rejected".to_string(),
    ]
}

impl Default for TerminalErrorClassifier {
    fn default() -> Self {
        Self::new(default_terminal_errors())
    }
}

impl TerminalErrorClassifier {
    pub fn new(descriptors: Vec<String>) -> Self {
        Self { descriptors }
    }

    pub fn is_terminal(&self, message: &str) -> bool {
        self.descriptors.iter().any(|d| message.contains(d))
    }
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Remote endpoint configuration, the `endpoint { .. }` block of the queue
/// component.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub headers: FxHashMap<String, String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(
        default = "default_remote_timeout",
        with = "crate::utils::duration"
    )]
    pub remote_timeout: Duration,
}

/// HTTPS POST of the protobuf-encoded batch.
pub struct HttpRemoteClient {
    client: reqwest::Client,
    config: EndpointConfig,
}

impl HttpRemoteClient {
    pub fn new(config: EndpointConfig) -> Result<Self, RemoteWriteError> {
        let client = reqwest::Client::builder()
            .timeout(config.remote_timeout)
            .build()
            .map_err(|err| RemoteWriteError {
                message: format!("building client: {err}"),
            })?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn send(&self, batch: &SignalBatch) -> Result<(), RemoteWriteError> {
        let body = batch.encode_to_bytes();
        let mut request = self
            .client
            .post(&self.config.url)
            .header("content-type", "application/x-protobuf")
            .body(body);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        if let Some(auth) = &self.config.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let response = request.send().await.map_err(|err| RemoteWriteError {
            message: err.to_string(),
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteWriteError {
            message: format!("remote returned {status}: {body}"),
        })
    }

    fn endpoint(&self) -> String {
        self.config.url.clone()
    }
}
