//! Git import source: a local working copy kept in sync with a remote
//! repository, reading one file at a pinned revision.
//!
//! The working copy lives at `<data_path>/repo`. Changing the repository,
//! revision, or auth settings discards it and clones fresh. A transient
//! fetch failure keeps the cached copy and the last content; the next tick
//! retries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controller::health::Health;
use crate::import::http::BasicAuth;
use crate::import::{
    default_poll_frequency, ImportError, ImportSource, SourceOptions, SourceState,
};

fn default_revision() -> String {
    "HEAD".to_string()
}

fn default_ssh_username() -> String {
    "git".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshKey {
    #[serde(default = "default_ssh_username")]
    pub username: String,
    pub key_file: PathBuf,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// GitHub App installation credentials. Decoded for surface compatibility;
/// minting installation tokens is a credential-provider concern, so
/// evaluation rejects this auth mode with a pointed error.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GithubApp {
    pub app_id: String,
    pub installation_id: String,
    pub private_key_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitArguments {
    pub repository: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    pub path: PathBuf,
    #[serde(
        default = "default_poll_frequency",
        with = "crate::utils::duration"
    )]
    pub pull_frequency: Duration,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default)]
    pub ssh_key: Option<SshKey>,
    #[serde(default)]
    pub github_app: Option<GithubApp>,
}

impl GitArguments {
    /// The parts of the arguments that invalidate an existing working copy.
    fn clone_key(&self) -> (String, String, Option<BasicAuth>, Option<SshKey>) {
        (
            self.repository.clone(),
            self.revision.clone(),
            self.basic_auth.clone(),
            self.ssh_key.clone(),
        )
    }
}

pub struct GitSource {
    opts: SourceOptions,
    args: RwLock<Option<GitArguments>>,
    repo: Mutex<Option<Repository>>,
    last_content: Mutex<Option<String>>,
    health: RwLock<Health>,
    state: RwLock<SourceState>,
    args_changed: tokio::sync::Notify,
}

impl GitSource {
    pub fn new(opts: SourceOptions) -> Self {
        Self {
            opts,
            args: RwLock::new(None),
            repo: Mutex::new(None),
            last_content: Mutex::new(None),
            health: RwLock::new(Health::unknown("source created")),
            state: RwLock::new(SourceState::Uninitialized),
            args_changed: tokio::sync::Notify::new(),
        }
    }

    fn workdir(&self) -> PathBuf {
        self.opts.data_path.join("repo")
    }

    fn fetch_options(args: &GitArguments) -> FetchOptions<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let basic = args.basic_auth.clone();
        let ssh = args.ssh_key.clone();
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            if let Some(auth) = &basic {
                return Cred::userpass_plaintext(&auth.username, &auth.password);
            }
            if let Some(key) = &ssh {
                let username = username_from_url.unwrap_or(&key.username);
                return Cred::ssh_key(
                    username,
                    None,
                    &key.key_file,
                    key.passphrase.as_deref(),
                );
            }
            Cred::default()
        });
        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options
    }

    /// Clone the repository into a fresh working copy, discarding any
    /// previous one.
    fn clone_repo(&self, args: &GitArguments) -> Result<Repository, ImportError> {
        let workdir = self.workdir();
        if workdir.exists() {
            std::fs::remove_dir_all(&workdir).map_err(|source| ImportError::Io {
                path: workdir.clone(),
                source,
            })?;
        }
        if let Some(parent) = workdir.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ImportError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        info!(
            component = %self.opts.global_id,
            repository = %args.repository,
            "cloning repository"
        );
        let repo = RepoBuilder::new()
            .fetch_options(Self::fetch_options(args))
            .clone(&args.repository, &workdir)?;
        Ok(repo)
    }

    /// Fetch origin and read `args.path` at the resolved revision. Must be
    /// called with the repository already cloned.
    fn fetch_and_read(&self, args: &GitArguments) -> Result<String, ImportError> {
        let guard = self.repo.lock();
        let repo = guard
            .as_ref()
            .ok_or_else(|| ImportError::Invalid("repository not cloned".to_string()))?;

        let mut remote = repo.find_remote("origin")?;
        remote.fetch(
            &[
                "+refs/heads/*:refs/remotes/origin/*",
                "+refs/tags/*:refs/tags/*",
            ],
            Some(&mut Self::fetch_options(args)),
            None,
        )?;

        let object = Self::resolve_revision(repo, &args.revision)?;
        let commit = object.peel_to_commit()?;
        let tree = commit.tree()?;
        let entry = tree.get_path(&args.path)?;
        let blob = entry.to_object(repo)?.peel_to_blob()?;
        String::from_utf8(blob.content().to_vec())
            .map_err(|_| ImportError::Invalid(format!("{} is not UTF-8", args.path.display())))
    }

    /// Resolve a revision preferring the remote-tracking view, so branch
    /// names and `HEAD` follow origin rather than the stale local checkout.
    fn resolve_revision<'r>(
        repo: &'r Repository,
        revision: &str,
    ) -> Result<git2::Object<'r>, git2::Error> {
        if revision == "HEAD" {
            return repo
                .revparse_single("refs/remotes/origin/HEAD")
                .or_else(|_| repo.revparse_single("FETCH_HEAD"))
                .or_else(|_| repo.revparse_single("HEAD"));
        }
        repo.revparse_single(&format!("refs/remotes/origin/{revision}"))
            .or_else(|_| repo.revparse_single(revision))
    }

    fn poll_once(&self) -> Result<Option<String>, ImportError> {
        let Some(args) = self.args.read().clone() else {
            return Ok(None);
        };
        match self.fetch_and_read(&args) {
            Ok(content) => {
                *self.state.write() = SourceState::Polling;
                *self.health.write() = Health::healthy("repository synced");
                let mut last = self.last_content.lock();
                if last.as_deref() != Some(content.as_str()) {
                    *last = Some(content.clone());
                    Ok(Some(content))
                } else {
                    Ok(None)
                }
            }
            Err(err) => {
                // Keep the cached working copy and content; retry next tick.
                *self.state.write() = SourceState::Failed;
                *self.health.write() = Health::unhealthy(err.to_string());
                Err(err)
            }
        }
    }

    fn pull_frequency(&self) -> Duration {
        self.args
            .read()
            .as_ref()
            .map(|a| a.pull_frequency)
            .unwrap_or_else(default_poll_frequency)
    }
}

#[async_trait]
impl ImportSource for GitSource {
    async fn evaluate(&self, args: serde_json::Value) -> Result<Option<String>, ImportError> {
        let new_args: GitArguments = serde_json::from_value(args)?;
        if new_args.github_app.is_some() {
            return Err(ImportError::Invalid(
                "github_app auth requires a credential provider to mint installation \
                 tokens; use basic_auth with an access token instead"
                    .to_string(),
            ));
        }
        let needs_clone = {
            let current = self.args.read();
            match current.as_ref() {
                Some(existing) if existing == &new_args => return Ok(None),
                Some(existing) => existing.clone_key() != new_args.clone_key(),
                None => true,
            }
        };

        if needs_clone {
            let repo = self.clone_repo(&new_args)?;
            *self.repo.lock() = Some(repo);
        }
        {
            let mut current = self.args.write();
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
            let frequency = self.pull_frequency();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.args_changed.notified() => continue,
                _ = tokio::time::sleep(frequency) => {
                    match self.poll_once() {
                        Ok(Some(content)) => {
                            debug!(component = %self.opts.global_id, "repository content changed");
                            if content_tx.send(content).is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(component = %self.opts.global_id, %err, "failed to update repository");
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
        let args: GitArguments = serde_json::from_value(json!({
            "repository": "https://example.com/repo.git",
            "path": "module",
        }))
        .unwrap();
        assert_eq!(args.revision, "HEAD");
        assert_eq!(args.pull_frequency, Duration::from_secs(60));
        assert!(args.basic_auth.is_none());
        assert!(args.ssh_key.is_none());
    }

    #[tokio::test]
    async fn github_app_auth_is_rejected_with_guidance() {
        let raw = json!({
            "repository": "https://github.com/example/repo.git",
            "path": "module",
            "github_app": {
                "app_id": "12345",
                "installation_id": "67890",
                "private_key_file": "/etc/agent/app.pem",
            },
        });
        let args: GitArguments = serde_json::from_value(raw.clone()).unwrap();
        assert!(args.github_app.is_some());

        let source = GitSource::new(SourceOptions {
            global_id: "import.git.app".into(),
            data_path: std::env::temp_dir(),
        });
        let err = source.evaluate(raw).await.unwrap_err();
        assert!(
            err.to_string().contains("use basic_auth with an access token"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn clone_key_ignores_path_and_frequency() {
        let a: GitArguments = serde_json::from_value(json!({
            "repository": "r", "path": "a", "pull_frequency": "1m",
        }))
        .unwrap();
        let b: GitArguments = serde_json::from_value(json!({
            "repository": "r", "path": "b", "pull_frequency": "5m",
        }))
        .unwrap();
        assert_eq!(a.clone_key(), b.clone_key());

        let c: GitArguments = serde_json::from_value(json!({
            "repository": "r", "path": "a", "revision": "v1.0.0",
        }))
        .unwrap();
        assert_ne!(a.clone_key(), c.clone_key());
    }
}
