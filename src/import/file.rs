//! Local-file import source: stat+read polling of a path.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::controller::health::Health;
use crate::import::{
    default_poll_frequency, ImportError, ImportSource, SourceOptions, SourceState,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileArguments {
    pub filename: PathBuf,
    #[serde(
        default = "default_poll_frequency",
        with = "crate::utils::duration"
    )]
    pub poll_frequency: Duration,
}

pub struct FileSource {
    opts: SourceOptions,
    args: RwLock<Option<FileArguments>>,
    last_content: Mutex<Option<String>>,
    health: RwLock<Health>,
    state: RwLock<SourceState>,
    args_changed: tokio::sync::Notify,
}

impl FileSource {
    pub fn new(opts: SourceOptions) -> Self {
        Self {
            opts,
            args: RwLock::new(None),
            last_content: Mutex::new(None),
            health: RwLock::new(Health::unknown("source created")),
            state: RwLock::new(SourceState::Uninitialized),
            args_changed: tokio::sync::Notify::new(),
        }
    }

    /// Read the configured file once. Returns `Some(content)` on change.
    fn poll_once(&self) -> Result<Option<String>, ImportError> {
        let Some(filename) = self.args.read().as_ref().map(|a| a.filename.clone()) else {
            return Ok(None);
        };
        match std::fs::read_to_string(&filename) {
            Ok(content) => {
                *self.state.write() = SourceState::Polling;
                *self.health.write() = Health::healthy("module content read");
                let mut last = self.last_content.lock();
                if last.as_deref() != Some(content.as_str()) {
                    *last = Some(content.clone());
                    Ok(Some(content))
                } else {
                    Ok(None)
                }
            }
            Err(source) => {
                // The cached content stays valid; report the failure and let
                // the next tick retry.
                *self.state.write() = SourceState::Failed;
                let err = ImportError::Io {
                    path: filename,
                    source,
                };
                *self.health.write() = Health::unhealthy(err.to_string());
                Err(err)
            }
        }
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
impl ImportSource for FileSource {
    async fn evaluate(&self, args: serde_json::Value) -> Result<Option<String>, ImportError> {
        let new_args: FileArguments = serde_json::from_value(args)?;
        {
            let mut current = self.args.write();
            if current.as_ref() == Some(&new_args) {
                return Ok(None);
            }
            *current = Some(new_args);
            let mut state = self.state.write();
            if *state == SourceState::Uninitialized {
                *state = SourceState::Configured;
            }
        }
        self.args_changed.notify_one();
        self.poll_once()
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
                    match self.poll_once() {
                        Ok(Some(content)) => {
                            debug!(component = %self.opts.global_id, "module file changed");
                            if content_tx.send(content).is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(component = %self.opts.global_id, %err, "failed to poll module file");
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
