//! Controller behavior: load validation, cycle rejection, the export
//! stability gate, evaluation ordering, and shutdown bounds.

mod common;

use std::time::Duration;

use common::*;
use tributary::LoadError;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_rejects_unrecognized_component_names() {
    init_tracing();
    let fixture = ControllerFixture::new();
    let err = fixture
        .controller
        .load_source("nonsense.thing \"x\" { }")
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("unrecognized component name \"nonsense.thing\""),
        "unexpected error: {err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_rejects_duplicate_node_ids() {
    init_tracing();
    let fixture = ControllerFixture::new();
    let err = fixture
        .controller
        .load_source(
            r#"
            testkit.pulse "p" { frequency = "1h" }
            testkit.pulse "p" { frequency = "1h" }
            "#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already present"), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn export_blocks_are_rejected_at_the_root() {
    init_tracing();
    let fixture = ControllerFixture::new();
    let err = fixture
        .controller
        .load_source("export \"output\" { value = 1 }")
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::ForbiddenBlock { .. }), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycles_are_rejected_and_the_prior_graph_is_retained() {
    init_tracing();
    let fixture = ControllerFixture::new();
    fixture
        .controller
        .load_source("testkit.pulse \"keep\" { frequency = \"1h\" }")
        .await
        .unwrap();
    assert_eq!(fixture.export_i64("testkit.pulse.keep", "value"), Some(42));

    let err = fixture
        .controller
        .load_source(
            r#"
            testkit.passthrough "a" { input = testkit.passthrough.b.output }
            testkit.passthrough "b" { input = testkit.passthrough.a.output }
            "#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cycle detected"), "unexpected error: {err}");

    // The failed load must not have touched the running graph.
    assert_eq!(fixture.controller.node_ids(), vec!["testkit.pulse.keep"]);
    assert_eq!(fixture.export_i64("testkit.pulse.keep", "value"), Some(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_exports_do_not_wake_dependents() {
    init_tracing();
    let mut fixture = ControllerFixture::new();
    fixture
        .controller
        .load_source(
            r#"
            testkit.pulse "gate" { frequency = "5ms" }
            testkit.probe "gate_dep" { input = testkit.pulse.gate.value }
            "#,
        )
        .await
        .unwrap();
    fixture.start();

    // The pulse republishes an identical value every 5ms; the dependent
    // must only ever see its initial configuration.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(probe_updates("testkit.probe.gate_dep"), 1);

    fixture.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_evaluation_follows_topological_order() {
    init_tracing();
    let fixture = ControllerFixture::new();
    fixture
        .controller
        .load_source(
            r#"
            testkit.count "ord_src" { frequency = "1h" max = 1 }
            testkit.probe "ord_c" { input = testkit.probe.ord_b.output }
            testkit.probe "ord_a" { input = testkit.count.ord_src.count }
            testkit.probe "ord_b" { input = testkit.probe.ord_a.output }
            "#,
        )
        .await
        .unwrap();

    let order: Vec<String> = probe_update_order()
        .into_iter()
        .filter(|id| id.contains("ord_"))
        .collect();
    assert_eq!(
        order,
        vec![
            "testkit.probe.ord_a".to_string(),
            "testkit.probe.ord_b".to_string(),
            "testkit.probe.ord_c".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_every_node_within_a_second() {
    init_tracing();
    let mut fixture = ControllerFixture::new();
    fixture
        .controller
        .load_source(
            r#"
            testkit.count "inc" { frequency = "10ms" max = 1000000 }
            testkit.pulse "p" { frequency = "10ms" }
            testkit.summation "sum" { input = testkit.count.inc.count }
            "#,
        )
        .await
        .unwrap();
    fixture.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = tokio::time::Instant::now();
    fixture.stop().await;
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "shutdown took {:?}",
        started.elapsed()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_component_loads_through_the_registry() {
    init_tracing();
    let mut fixture = ControllerFixture::new();
    fixture
        .controller
        .load_source(
            r#"
            metrics.remote_queue "default" {
                endpoint {
                    url = "http://127.0.0.1:9/api/v1/write"
                }
                ttl = "1h"
            }
            "#,
        )
        .await
        .unwrap();

    let exports = fixture
        .controller
        .get_exports("metrics.remote_queue.default")
        .expect("queue exports");
    let path = exports["queue_path"].as_str().expect("queue_path export");
    assert!(path.ends_with("wal"));

    fixture.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    fixture.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eval_errors_keep_other_nodes_loaded() {
    init_tracing();
    let fixture = ControllerFixture::new();
    let err = fixture
        .controller
        .load_source(
            r#"
            testkit.pulse "ok" { frequency = "1h" }
            testkit.probe "broken" { input = missing.node.field }
            "#,
        )
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("could not resolve reference"),
        "unexpected error: {err}"
    );

    // The graph is installed; the healthy node evaluated and exported.
    assert_eq!(fixture.export_i64("testkit.pulse.ok", "value"), Some(42));
    let health = fixture
        .controller
        .node_health("testkit.probe.broken")
        .expect("node present");
    assert_eq!(health.status, tributary::HealthStatus::Unhealthy);
}
