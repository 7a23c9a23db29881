//! Git import source against a local fixture repository: revision pinning
//! and following HEAD.

mod common;

use std::path::Path;
use std::time::Duration;

use common::testing::init_tracing;
use git2::Repository;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tributary::import::{GitSource, ImportSource, SourceOptions, SourceState};

fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) {
    let workdir = repo.workdir().expect("fixture repo has a workdir");
    std::fs::write(workdir.join(name), content).unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new(name)).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();

    let signature = git2::Signature::now("fixture", "fixture@example.com").unwrap();
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pinned_revision_ignores_new_commits_until_repointed() {
    init_tracing();
    let upstream_dir = tempfile::tempdir().unwrap();
    let upstream = Repository::init(upstream_dir.path()).unwrap();
    commit_file(&upstream, "module.txt", "content v1", "first");
    let tagged = upstream.revparse_single("HEAD").unwrap();
    upstream.tag_lightweight("v1.0.0", &tagged, false).unwrap();
    commit_file(&upstream, "module.txt", "content v2", "second");

    let data_dir = tempfile::tempdir().unwrap();
    let source = std::sync::Arc::new(GitSource::new(SourceOptions {
        global_id: "import.git.pin".into(),
        data_path: data_dir.path().to_path_buf(),
    }));

    // Pinned to the tag: the initial fetch reads the tagged content, not
    // the branch tip.
    let repository = upstream_dir.path().to_string_lossy().to_string();
    let content = source
        .evaluate(json!({
            "repository": repository,
            "revision": "v1.0.0",
            "path": "module.txt",
            "pull_frequency": "30ms",
        }))
        .await
        .unwrap();
    assert_eq!(content.as_deref(), Some("content v1"));
    assert_eq!(source.state(), SourceState::Polling);

    // New commits land on HEAD while the poll loop runs; the pin must hold.
    commit_file(&upstream, "module.txt", "content v3", "third");
    let (tx, rx) = flume::unbounded();
    let cancel = CancellationToken::new();
    let poll_task = tokio::spawn({
        let source = source.clone();
        let cancel = cancel.clone();
        async move { source.run(cancel, tx).await }
    });
    let pinned = tokio::time::timeout(Duration::from_millis(300), rx.recv_async()).await;
    assert!(pinned.is_err(), "pinned revision must not follow new commits");
    cancel.cancel();
    poll_task.await.unwrap().unwrap();

    // Repointing to HEAD re-clones and reads the branch tip.
    let content = source
        .evaluate(json!({
            "repository": repository,
            "revision": "HEAD",
            "path": "module.txt",
            "pull_frequency": "30ms",
        }))
        .await
        .unwrap();
    assert_eq!(content.as_deref(), Some("content v3"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_path_is_unhealthy_but_recoverable() {
    init_tracing();
    let upstream_dir = tempfile::tempdir().unwrap();
    let upstream = Repository::init(upstream_dir.path()).unwrap();
    commit_file(&upstream, "module.txt", "content v1", "first");

    let data_dir = tempfile::tempdir().unwrap();
    let source = GitSource::new(SourceOptions {
        global_id: "import.git.missing".into(),
        data_path: data_dir.path().to_path_buf(),
    });

    let repository = upstream_dir.path().to_string_lossy().to_string();
    let err = source
        .evaluate(json!({
            "repository": repository,
            "revision": "HEAD",
            "path": "other.txt",
            "pull_frequency": "1h",
        }))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("git"), "unexpected error: {err}");
    assert_eq!(source.state(), SourceState::Failed);

    // The path appearing upstream heals the source on the next poll.
    commit_file(&upstream, "other.txt", "late content", "second");
    let content = source
        .evaluate(json!({
            "repository": repository,
            "revision": "HEAD",
            "path": "other.txt",
            "pull_frequency": "30ms",
        }))
        .await
        .unwrap();
    assert_eq!(content.as_deref(), Some("late content"));
    assert_eq!(source.state(), SourceState::Polling);
}
