//! HTTP import source: periodic GET of a module endpoint.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::controller::health::Health;
use crate::import::{
    default_poll_frequency, ImportError, ImportSource, SourceOptions, SourceState,
};

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpArguments {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: FxHashMap<String, String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout", with = "crate::utils::duration")]
    pub timeout: Duration,
    #[serde(
        default = "default_poll_frequency",
        with = "crate::utils::duration"
    )]
    pub poll_frequency: Duration,
}

pub struct HttpSource {
    opts: SourceOptions,
    args: RwLock<Option<HttpArguments>>,
    client: RwLock<Option<reqwest::Client>>,
    last_content: Mutex<Option<String>>,
    health: RwLock<Health>,
    state: RwLock<SourceState>,
    args_changed: tokio::sync::Notify,
}

impl HttpSource {
    pub fn new(opts: SourceOptions) -> Self {
        Self {
            opts,
            args: RwLock::new(None),
            client: RwLock::new(None),
            last_content: Mutex::new(None),
            health: RwLock::new(Health::unknown("source created")),
            state: RwLock::new(SourceState::Uninitialized),
            args_changed: tokio::sync::Notify::new(),
        }
    }

    async fn poll_once(&self) -> Result<Option<String>, ImportError> {
        let (args, client) = {
            let args = self.args.read();
            let client = self.client.read();
            match (args.as_ref(), client.as_ref()) {
                (Some(args), Some(client)) => (args.clone(), client.clone()),
                _ => return Ok(None),
            }
        };

        let result = self.fetch(&args, &client).await;
        match result {
            Ok(content) => {
                *self.state.write() = SourceState::Polling;
                *self.health.write() = Health::healthy("module content fetched");
                let mut last = self.last_content.lock();
                if last.as_deref() != Some(content.as_str()) {
                    *last = Some(content.clone());
                    Ok(Some(content))
                } else {
                    Ok(None)
                }
            }
            Err(err) => {
                *self.state.write() = SourceState::Failed;
                *self.health.write() = Health::unhealthy(err.to_string());
                Err(err)
            }
        }
    }

    async fn fetch(
        &self,
        args: &HttpArguments,
        client: &reqwest::Client,
    ) -> Result<String, ImportError> {
        let method = reqwest::Method::from_bytes(args.method.as_bytes()).map_err(|_| {
            ImportError::Invalid(format!("invalid HTTP method {:?}", args.method))
        })?;
        let mut request = client.request(method, &args.url);
        for (name, value) in &args.headers {
            request = request.header(name, value);
        }
        if let Some(auth) = &args.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(token) = &args.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|source| ImportError::Http {
            url: args.url.clone(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::HttpStatus {
                url: args.url.clone(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(|source| ImportError::Http {
            url: args.url.clone(),
            source,
        })?;
        // Trailing whitespace is not meaningful module content.
        Ok(body.trim_end().to_string())
    }

    fn poll_frequency(&self) -> Duration {
        self.args
            .read()
            .as_ref()
            .map(|a| a.poll_frequency)
            .unwrap_or_else(default_poll_frequency)
    }
}

#[async_trait]
impl ImportSource for HttpSource {
    async fn evaluate(&self, args: serde_json::Value) -> Result<Option<String>, ImportError> {
        let new_args: HttpArguments = serde_json::from_value(args)?;
        {
            let mut current = self.args.write();
            if current.as_ref() == Some(&new_args) {
                return Ok(None);
            }
            let client = reqwest::Client::builder()
                .timeout(new_args.timeout)
                .build()
                .map_err(|source| ImportError::Http {
                    url: new_args.url.clone(),
                    source,
                })?;
            *self.client.write() = Some(client);
            *current = Some(new_args);
            let mut state = self.state.write();
            if *state == SourceState::Uninitialized {
                *state = SourceState::Configured;
            }
        }
        self.args_changed.notify_one();
        self.poll_once().await
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        content_tx: flume::Sender<String>,
    ) -> Result<(), ImportError> {
        loop {
            let frequency = self.poll_frequency();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.args_changed.notified() => continue,
                _ = tokio::time::sleep(frequency) => {
                    match self.poll_once().await {
                        Ok(Some(content)) => {
                            debug!(component = %self.opts.global_id, "module endpoint changed");
                            if content_tx.send(content).is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(component = %self.opts.global_id, %err, "failed to fetch module endpoint");
                        }
                    }
                }
            }
        }
    }

    fn current_health(&self) -> Health {
        self.health.read().clone()
    }

    fn state(&self) -> SourceState {
        *self.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_default_as_documented() {
        let args: HttpArguments =
            serde_json::from_value(json!({"url": "https://example.com/module"})).unwrap();
        assert_eq!(args.method, "GET");
        assert_eq!(args.timeout, Duration::from_secs(30));
        assert_eq!(args.poll_frequency, Duration::from_secs(60));
        assert!(args.headers.is_empty());
        assert!(args.basic_auth.is_none());
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        let err = serde_json::from_value::<HttpArguments>(
            json!({"url": "https://example.com", "follow_redirects": true}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("follow_redirects"));
    }

    #[tokio::test]
    async fn invalid_method_is_an_evaluate_error() {
        let source = HttpSource::new(SourceOptions {
            global_id: "import.http.test".into(),
            data_path: std::env::temp_dir(),
        });
        let err = source
            .evaluate(json!({"url": "http://127.0.0.1:1/module", "method": "NOT A METHOD"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid HTTP method"));
    }
}
