//! End-to-end capture sessions against scripted connectors

#![allow(clippy::unwrap_used, clippy::expect_used)]

use capflow_common::RetryPolicy;
use capflow_runtime::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore, Cursor};
use capflow_runtime::protocol::{
    CheckpointMessage, ConnectorError, ReadMessage, ReadRequest, SyncMode,
};
use capflow_runtime::{
    Binding, CaptureCatalog, CaptureOrchestrator, CaptureSpec, ConnectorRegistry, ErrorKind,
    JsonlSink, MemoryCheckpointStore, MemoryConnector, MemorySink, RuntimeError, SessionOptions,
    SessionStatus, SqliteCheckpointStore,
};
use capflow_runtime::state::BindingPhase;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const IMAGE: &str = "ghcr.io/capflow/source-test:dev";
const CAPTURE: &str = "acmeCo/source-test";

fn endpoint_schema() -> Value {
    json!({
        "type": "object",
        "required": ["api_key"],
        "properties": {
            "api_key": {"type": "string", "secret": true},
            "start_date": {"type": "string", "format": "date-time"},
            "page_size": {"type": "integer", "minimum": 1, "default": 100}
        }
    })
}

fn capture_with(config: Value, bindings: Vec<Binding>) -> CaptureSpec {
    CaptureSpec {
        name: CAPTURE.to_string(),
        image: IMAGE.to_string(),
        config,
        bindings,
        interval: None,
    }
}

fn capture(bindings: Vec<Binding>) -> CaptureSpec {
    capture_with(json!({"api_key": "secret-key"}), bindings)
}

fn incremental(stream: &str) -> Binding {
    Binding::new(stream, SyncMode::Incremental, format!("acmeCo/{}", stream))
}

fn key(stream: &str) -> CheckpointKey {
    CheckpointKey::new(CAPTURE, stream)
}

fn options() -> SessionOptions {
    SessionOptions {
        max_concurrency: 4,
        retry: RetryPolicy::new(3, Duration::ZERO, Duration::ZERO).unwrap(),
    }
}

struct Harness {
    connector: Arc<MemoryConnector>,
    store: Arc<MemoryCheckpointStore>,
    sink: Arc<MemorySink>,
    orchestrator: CaptureOrchestrator,
}

impl Harness {
    fn new(connector: MemoryConnector) -> Self {
        Self::with_store(connector, Arc::new(MemoryCheckpointStore::new()))
    }

    fn with_store(connector: MemoryConnector, store: Arc<MemoryCheckpointStore>) -> Self {
        let connector = Arc::new(connector);
        let mut registry = ConnectorRegistry::new();
        registry.register(IMAGE, connector.clone());
        let sink = Arc::new(MemorySink::new());
        let orchestrator = CaptureOrchestrator::new(registry, store.clone(), sink.clone(), options());
        Self {
            connector,
            store,
            sink,
            orchestrator,
        }
    }
}

fn connector() -> MemoryConnector {
    MemoryConnector::new(endpoint_schema())
        .with_stream(MemoryConnector::stream("clients", &[SyncMode::Incremental, SyncMode::FullRefresh]))
        .with_stream(MemoryConnector::stream("invoices", &[SyncMode::Incremental]))
}

fn record(stream: &str, id: i64) -> ReadMessage {
    ReadMessage::record(stream, json!({"id": id}))
}

fn checkpoint(page: i64, cursor: Cursor) -> ReadMessage {
    ReadMessage::checkpoint(json!({"page": page}), Some(cursor))
}

#[tokio::test]
async fn test_full_refresh_ignores_stale_checkpoint() {
    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .persist(&key("clients"), &Checkpoint::new(json!({"page": 9}), Some(Cursor::Int(9)), 90))
        .await
        .unwrap();

    let harness = Harness::with_store(
        connector().with_messages(
            "clients",
            vec![record("clients", 1), checkpoint(1, Cursor::Int(1)), record("clients", 2)],
        ),
        store,
    );
    let capture = capture(vec![Binding::new("clients", SyncMode::FullRefresh, "acmeCo/clients")]);

    let report = harness.orchestrator.run(&capture, CancellationToken::new()).await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);

    let requests = harness.connector.read_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].state, None);
    assert_eq!(requests[0].start_cursor, None);

    // Full refresh never leaves a checkpoint behind
    assert!(harness.store.load(&key("clients")).await.unwrap().is_none());
    assert_eq!(harness.sink.documents("acmeCo/clients").len(), 2);
}

#[tokio::test]
async fn test_checkpoint_cursor_never_regresses_across_runs() {
    let store = Arc::new(MemoryCheckpointStore::new());

    let first = Harness::with_store(
        connector().with_messages(
            "clients",
            vec![record("clients", 1), checkpoint(1, Cursor::Int(10))],
        ),
        store.clone(),
    );
    let capture = capture(vec![incremental("clients")]);
    first.orchestrator.run(&capture, CancellationToken::new()).await.unwrap();

    let second = Harness::with_store(
        connector().with_messages(
            "clients",
            vec![record("clients", 2), checkpoint(2, Cursor::Int(7))],
        ),
        store.clone(),
    );
    let report = second.orchestrator.run(&capture, CancellationToken::new()).await.unwrap();

    let binding = report.binding("clients").unwrap();
    assert_eq!(binding.regressions, 1);
    // Records of a regressing checkpoint are still delivered
    assert_eq!(second.sink.documents("acmeCo/clients"), vec![json!({"id": 2})]);

    let cp = store.load(&key("clients")).await.unwrap().unwrap();
    assert_eq!(cp.cursor, Some(Cursor::Int(10)));
    assert_eq!(cp.state, json!({"page": 1}));
}

#[tokio::test]
async fn test_resumes_from_persisted_checkpoint() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = Harness::with_store(connector().with_reader("clients", paged), store.clone());
    let capture = capture(vec![incremental("clients")]);
    first.orchestrator.run(&capture, CancellationToken::new()).await.unwrap();
    let persisted = store.load(&key("clients")).await.unwrap().unwrap();

    let second = Harness::with_store(connector().with_reader("clients", paged), store.clone());
    let report = second.orchestrator.run(&capture, CancellationToken::new()).await.unwrap();

    let request = &second.connector.read_requests()[0];
    assert_eq!(request.state.as_ref(), Some(&persisted.state));
    assert_eq!(request.start_cursor, persisted.cursor);

    assert_eq!(second.sink.documents("acmeCo/clients"), vec![json!({"id": 2})]);
    let resumed = report.binding("clients").unwrap().resume_checkpoint.clone().unwrap();
    assert_eq!(resumed.cursor, Some(Cursor::Int(2)));
    assert_eq!(resumed.records, 2);
}

fn paged(request: &ReadRequest) -> Vec<Result<ReadMessage, ConnectorError>> {
    let page = request
        .state
        .as_ref()
        .and_then(|s| s.get("page"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    vec![
        Ok(record("clients", page + 1)),
        Ok(checkpoint(page + 1, Cursor::Int(page + 1))),
    ]
}

#[tokio::test]
async fn test_backfill_starts_from_fresh_checkpoint() {
    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .persist(&key("clients"), &Checkpoint::new(json!({"page": 41}), Some(Cursor::Int(41)), 41))
        .await
        .unwrap();

    let harness = Harness::with_store(connector().with_reader("clients", paged), store.clone());
    let mut binding = incremental("clients");
    binding.backfill = 1;
    let report = harness
        .orchestrator
        .run(&capture(vec![binding]), CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());

    let request = &harness.connector.read_requests()[0];
    assert_eq!(request.state, None);
    assert_eq!(request.start_cursor, None);

    let bumped = key("clients").with_backfill(1);
    let cp = store.load(&bumped).await.unwrap().unwrap();
    assert_eq!(cp.cursor, Some(Cursor::Int(1)));
    // The checkpoint of the earlier backfill is gone
    assert!(store.load(&key("clients")).await.unwrap().is_none());
    assert_eq!(harness.store.persist_log(), vec![key("clients"), bumped]);
}

#[tokio::test]
async fn test_interval_reruns_from_last_checkpoint() {
    let harness = Harness::new(connector().with_reader("clients", paged));
    let mut capture = capture(vec![incremental("clients")]);
    capture.interval = Some(Duration::from_millis(10));

    let cancel = CancellationToken::new();
    let mut sessions = 0;
    let last = harness
        .orchestrator
        .run_on_interval(&capture, cancel.clone(), |report| {
            assert!(report.is_success());
            sessions += 1;
            if sessions == 3 {
                cancel.cancel();
            }
        })
        .await
        .unwrap();

    assert_eq!(sessions, 3);
    assert_eq!(last.status, SessionStatus::Completed);
    let states: Vec<Option<Value>> =
        harness.connector.read_requests().into_iter().map(|r| r.state).collect();
    assert_eq!(states, vec![None, Some(json!({"page": 1})), Some(json!({"page": 2}))]);
    let ids: Vec<i64> = harness
        .sink
        .documents("acmeCo/clients")
        .iter()
        .map(|d| d["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_interval_stops_after_failed_session() {
    let harness = Harness::new(connector().with_reader("clients", |_| {
        vec![Err(ConnectorError::failed("bad credentials"))]
    }));
    let mut capture = capture(vec![incremental("clients")]);
    capture.interval = Some(Duration::from_millis(10));

    let mut sessions = 0;
    let last = harness
        .orchestrator
        .run_on_interval(&capture, CancellationToken::new(), |_| sessions += 1)
        .await
        .unwrap();
    assert_eq!(sessions, 1);
    assert_eq!(last.status, SessionStatus::Failed);

    // Without an interval a single session runs
    let once = Harness::new(connector().with_reader("clients", paged));
    let mut sessions = 0;
    once.orchestrator
        .run_on_interval(
            &capture_with(json!({"api_key": "k"}), vec![incremental("clients")]),
            CancellationToken::new(),
            |_| sessions += 1,
        )
        .await
        .unwrap();
    assert_eq!(sessions, 1);
}

#[tokio::test]
async fn test_start_date_bounds_first_read() {
    let harness = Harness::new(connector().with_messages(
        "clients",
        vec![
            record("clients", 1),
            checkpoint(1, Cursor::Text("2023-06-01T00:00:00Z".to_string())),
            record("clients", 2),
            checkpoint(2, Cursor::Text("2024-02-01T00:00:00+01:00".to_string())),
        ],
    ));
    let capture = capture_with(
        json!({"api_key": "k", "start_date": "2024-01-01T00:00:00Z"}),
        vec![incremental("clients")],
    );

    let report = harness.orchestrator.run(&capture, CancellationToken::new()).await.unwrap();
    assert!(report.is_success());

    let request = &harness.connector.read_requests()[0];
    assert_eq!(request.start_cursor, Some(Cursor::Text("2024-01-01T00:00:00Z".to_string())));
    assert_eq!(request.state, None);
    // Defaults are filled in before the connector sees the config
    assert_eq!(request.config["page_size"], json!(100));

    assert_eq!(report.binding("clients").unwrap().regressions, 1);
    let cp = harness.store.load(&key("clients")).await.unwrap().unwrap();
    assert_eq!(cp.cursor, Some(Cursor::Text("2024-02-01T00:00:00+01:00".to_string())));
    assert_eq!(harness.store.persist_log().len(), 1);
}

#[tokio::test]
async fn test_incompatible_targets_rejected_before_reading() {
    let mut invoices = MemoryConnector::stream("invoices", &[SyncMode::Incremental]);
    invoices.json_schema = json!({"type": "object", "required": ["amount"]});
    let harness = Harness::new(
        MemoryConnector::new(endpoint_schema())
            .with_stream(MemoryConnector::stream("clients", &[SyncMode::Incremental]))
            .with_stream(invoices),
    );
    let capture = capture(vec![
        Binding::new("clients", SyncMode::Incremental, "acmeCo/everything"),
        Binding::new("invoices", SyncMode::Incremental, "acmeCo/everything"),
    ]);

    let err = harness
        .orchestrator
        .run(&capture, CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::BindingResolution);
    assert!(harness.connector.read_requests().is_empty());
    assert!(harness.connector.validate_requests().is_empty());
}

#[tokio::test]
async fn test_protocol_error_keeps_prior_checkpoint() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let prior = Checkpoint::new(json!({"page": 5}), Some(Cursor::Int(5)), 5);
    store.persist(&key("clients"), &prior).await.unwrap();

    let harness = Harness::with_store(
        connector().with_messages(
            "clients",
            vec![
                record("clients", 6),
                // An integer bound cannot be compared with a text cursor
                checkpoint(6, Cursor::Text("six".to_string())),
            ],
        ),
        store.clone(),
    );
    let report = harness
        .orchestrator
        .run(&capture(vec![incremental("clients")]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Failed);
    let (_, kind, _) = report.failures().next().unwrap();
    assert_eq!(kind, ErrorKind::ConnectorProtocol);

    assert_eq!(store.load(&key("clients")).await.unwrap(), Some(prior));
    assert!(harness.sink.documents("acmeCo/clients").is_empty());
}

#[tokio::test]
async fn test_failed_checkpoint_persist_fails_binding() {
    let harness = Harness::new(connector().with_messages(
        "clients",
        vec![record("clients", 1), checkpoint(1, Cursor::Int(1))],
    ));
    harness.store.fail_persists(true);

    let report = harness
        .orchestrator
        .run(&capture(vec![incremental("clients")]), CancellationToken::new())
        .await
        .unwrap();

    let (_, kind, _) = report.failures().next().unwrap();
    assert_eq!(kind, ErrorKind::CheckpointPersistence);
    assert!(harness.store.load(&key("clients")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreadable_checkpoint_fails_binding_before_reading() {
    let harness = Harness::new(connector().with_messages("clients", vec![record("clients", 1)]));
    harness.store.fail_loads(true);

    let report = harness
        .orchestrator
        .run(&capture(vec![incremental("clients")]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, SessionStatus::Failed);
    let (binding, kind, _) = report.failures().next().unwrap();
    assert_eq!(kind, ErrorKind::CheckpointPersistence);
    assert_eq!(binding.phase, BindingPhase::Failed);
    assert_eq!(binding.attempts, 0);
    assert!(harness.connector.read_requests().is_empty());
    assert!(harness.sink.documents("acmeCo/clients").is_empty());
}

#[tokio::test]
async fn test_transient_error_resumes_from_last_checkpoint() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let harness = Harness::new(connector().with_reader("clients", move |_| {
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 => vec![
                Ok(record("clients", 1)),
                Ok(checkpoint(1, Cursor::Int(1))),
                Ok(record("clients", 2)),
                Err(ConnectorError::transient("connection reset")),
            ],
            _ => vec![
                Ok(record("clients", 2)),
                Ok(record("clients", 3)),
                Ok(checkpoint(3, Cursor::Int(3))),
            ],
        }
    }));

    let report = harness
        .orchestrator
        .run(&capture(vec![incremental("clients")]), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    let binding = report.binding("clients").unwrap();
    assert_eq!(binding.attempts, 2);
    assert_eq!(binding.records_forwarded, 3);

    // The uncommitted record of the failed attempt is not delivered twice
    let ids: Vec<i64> = harness
        .sink
        .documents("acmeCo/clients")
        .iter()
        .map(|d| d["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    let retried = &harness.connector.read_requests()[1];
    assert_eq!(retried.state, Some(json!({"page": 1})));
    assert_eq!(retried.start_cursor, Some(Cursor::Int(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_transient_errors_exhaust_retries() {
    let harness = Harness::new(connector().with_reader("clients", |_| {
        vec![Err(ConnectorError::transient("rate limited"))]
    }));

    let report = harness
        .orchestrator
        .run(&capture(vec![incremental("clients")]), CancellationToken::new())
        .await
        .unwrap();

    let (binding, kind, _) = report.failures().next().unwrap();
    assert_eq!(kind, ErrorKind::TransientIo);
    assert_eq!(binding.attempts, 3);
}

#[tokio::test]
async fn test_cancellation_keeps_only_committed_checkpoints() {
    let harness = Harness::new(
        connector()
            .with_messages(
                "clients",
                vec![
                    record("clients", 1),
                    checkpoint(1, Cursor::Int(1)),
                    record("clients", 2),
                ],
            )
            .stall_after_script("clients"),
    );
    let capture = capture(vec![incremental("clients")]);
    let cancel = CancellationToken::new();

    let stopper = async {
        while harness.store.persist_log().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
    };
    let (report, ()) = tokio::join!(harness.orchestrator.run(&capture, cancel.clone()), stopper);
    let report = report.unwrap();

    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_eq!(harness.sink.documents("acmeCo/clients"), vec![json!({"id": 1})]);
    let cp = harness.store.load(&key("clients")).await.unwrap().unwrap();
    assert_eq!(cp.cursor, Some(Cursor::Int(1)));
    assert_eq!(cp.records, 1);
}

#[tokio::test]
async fn test_failing_binding_cancels_siblings() {
    let harness = Harness::new(
        connector()
            .with_messages("clients", vec![record("clients", 1)])
            .stall_after_script("clients")
            .with_reader("invoices", |_| vec![Err(ConnectorError::failed("bad credentials"))]),
    );
    let capture = capture(vec![incremental("clients"), incremental("invoices")]);

    let report = harness.orchestrator.run(&capture, CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, SessionStatus::Failed);
    let (failed, kind, message) = report.failures().next().unwrap();
    assert_eq!(failed.stream, "invoices");
    assert_eq!(kind, ErrorKind::ConnectorFailed);
    assert!(message.contains("bad credentials"));
    assert!(matches!(
        report.binding("clients").unwrap().outcome,
        capflow_runtime::BindingOutcome::Cancelled
    ));
}

#[tokio::test]
async fn test_records_delivered_in_connector_order() {
    let mut messages: Vec<ReadMessage> = (0..50).map(|i| record("clients", i)).collect();
    messages.push(checkpoint(1, Cursor::Int(50)));
    messages.extend((50..75).map(|i| record("clients", i)));
    let harness = Harness::new(connector().with_messages("clients", messages));

    harness
        .orchestrator
        .run(&capture(vec![incremental("clients")]), CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<i64> = harness
        .sink
        .documents("acmeCo/clients")
        .iter()
        .map(|d| d["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, (0..75).collect::<Vec<_>>());
    assert_eq!(harness.sink.batches(), vec![
        ("acmeCo/clients".to_string(), 50),
        ("acmeCo/clients".to_string(), 25),
    ]);
}

#[tokio::test]
async fn test_merge_patch_checkpoints() {
    let harness = Harness::new(connector().with_messages(
        "clients",
        vec![
            ReadMessage::checkpoint(json!({"cursor": {"a": 1, "b": 1}}), Some(Cursor::Int(1))),
            ReadMessage::Checkpoint(CheckpointMessage {
                stream: Some("clients".to_string()),
                state: json!({"cursor": {"b": 2, "a": null}}),
                cursor: Some(Cursor::Int(2)),
                merge: true,
            }),
        ],
    ));

    harness
        .orchestrator
        .run(&capture(vec![incremental("clients")]), CancellationToken::new())
        .await
        .unwrap();

    let cp = harness.store.load(&key("clients")).await.unwrap().unwrap();
    assert_eq!(cp.state, json!({"cursor": {"b": 2}}));
}

#[tokio::test]
async fn test_every_config_violation_is_reported() {
    let harness = Harness::new(connector().with_messages("clients", vec![]));
    let capture = capture_with(
        json!({"start_date": "last tuesday", "page_size": 0}),
        vec![incremental("clients")],
    );

    match harness.orchestrator.run(&capture, CancellationToken::new()).await {
        Err(RuntimeError::ConfigValidation(err)) => {
            assert_eq!(err.violations.len(), 3);
            assert!(err.has_violation("api_key"));
            assert!(err.has_violation("start_date"));
            assert!(err.has_violation("page_size"));
        },
        other => panic!("expected a config validation error, got {:?}", other.err()),
    }
    assert!(harness.connector.read_requests().is_empty());
}

#[tokio::test]
async fn test_catalog_to_jsonl_with_sqlite_checkpoints() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "api_key: from-file\n").unwrap();
    let yaml = r#"
captures:
  acmeCo/source-test:
    endpoint:
      connector:
        image: ghcr.io/capflow/source-test:dev
      config: config.yaml
    bindings:
      - resource:
          stream: clients
          syncMode: incremental
        target: acmeCo/clients
      - resource:
          stream: invoices
          syncMode: incremental
        target: acmeCo/invoices
        disable: true
"#;
    let catalog = CaptureCatalog::from_yaml(yaml, dir.path()).unwrap();
    let capture = catalog.get(CAPTURE).unwrap();
    assert_eq!(capture.config, json!({"api_key": "from-file"}));

    let connector = Arc::new(connector().with_messages(
        "clients",
        vec![record("clients", 1), record("clients", 2), checkpoint(1, Cursor::Int(2))],
    ));
    let mut registry = ConnectorRegistry::new();
    registry.register(IMAGE, connector);
    let db = dir.path().join("state").join("checkpoints.db");
    let store = Arc::new(SqliteCheckpointStore::open(&db).unwrap());
    let orchestrator = CaptureOrchestrator::new(
        registry,
        store.clone(),
        Arc::new(JsonlSink::new(dir.path().join("collections"))),
        options(),
    );

    let report = orchestrator.run(capture, CancellationToken::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.disabled, vec!["invoices".to_string()]);

    let written =
        std::fs::read_to_string(dir.path().join("collections/acmeCo/clients.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 2);

    // Reopen to make sure the checkpoint survived
    drop(store);
    let reopened = SqliteCheckpointStore::open(&db).unwrap();
    let cp = reopened.load(&key("clients")).await.unwrap().unwrap();
    assert_eq!(cp.cursor, Some(Cursor::Int(2)));
    assert_eq!(cp.records, 2);
}
