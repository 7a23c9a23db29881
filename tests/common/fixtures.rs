#![allow(dead_code)]

//! Controller fixtures shared by integration tests.

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tributary::{ControllerOptions, FlowController};

use super::components::test_registry;

/// A root controller over a temp data directory, plus the handles tests
/// need to drive and stop it.
pub struct ControllerFixture {
    pub controller: Arc<FlowController>,
    pub cancel: CancellationToken,
    pub data_dir: TempDir,
    run_task: Option<tokio::task::JoinHandle<()>>,
}

impl ControllerFixture {
    pub fn new() -> Self {
        let data_dir = tempfile::tempdir().expect("temp data dir");
        let controller = Arc::new(FlowController::new(ControllerOptions::new(
            test_registry(),
            data_dir.path(),
        )));
        Self {
            controller,
            cancel: CancellationToken::new(),
            data_dir,
            run_task: None,
        }
    }

    /// Start the controller's run loop on its own task.
    pub fn start(&mut self) {
        let controller = self.controller.clone();
        let cancel = self.cancel.clone();
        self.run_task = Some(tokio::spawn(async move {
            controller.run(cancel).await;
        }));
    }

    /// Cancel and wait for the run loop to stop.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.run_task.take() {
            let _ = task.await;
        }
    }

    /// A named integer field out of a node's exports, when present.
    pub fn export_i64(&self, node_id: &str, field: &str) -> Option<i64> {
        self.controller
            .get_exports(node_id)?
            .get(field)?
            .as_i64()
    }
}
