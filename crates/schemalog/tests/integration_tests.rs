//! Integration tests for schemalog
//!
//! These tests run one or more registry nodes against a shared log and
//! verify the registry end-to-end.

use async_trait::async_trait;
use bytes::Bytes;
use schemalog::{
    ChangeKind, CommitLog, CompatibilityLevel, LeadershipConfig, LeaseCoordinator,
    LocalForwarder, LogConfig, LogReader, LogRecord, MemoryLeaseStore, MemoryLog, Mode,
    RegistryConfig, SchemaError, SchemaId, SchemaReference, SchemaRegistry, SchemaResult,
    SchemaType, SchemaVersion, StaticCoordinator, Subject, TimeoutConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NODE_A: &str = "http://node-a:8081";
const NODE_B: &str = "http://node-b:8081";

const MSG_V1: &str = "syntax = \"proto3\";\nmessage Msg { string name = 1; }\n";
const MSG_INT: &str = "syntax = \"proto3\";\nmessage Msg { int32 name = 1; }\n";

const USER_V1: &str =
    r#"{"type": "record", "name": "User", "fields": [{"name": "id", "type": "long"}]}"#;
const USER_V2: &str = r#"{"type": "record", "name": "User", "fields": [{"name": "id", "type": "long"}, {"name": "name", "type": ["null", "string"], "default": null}]}"#;

fn container(field_type: &str) -> String {
    format!(
        "syntax = \"proto3\";\npackage container;\nmessage H {{ {} s = 1; }}\n",
        field_type
    )
}

const USES_CONTAINER: &str =
    "syntax = \"proto3\";\nimport \"container.proto\";\nmessage Outer { .container.H h = 1; }\n";

fn short_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        ready_ms: 500,
        append_ms: 2000,
        ack_ms: 2000,
        forward_ms: 2000,
    }
}

/// Two nodes on one log: A is primary, B forwards to it
struct Cluster {
    log: Arc<MemoryLog>,
    a: Arc<SchemaRegistry>,
    b: Arc<SchemaRegistry>,
    a_role: Arc<StaticCoordinator>,
    b_role: Arc<StaticCoordinator>,
    forwarder: Arc<LocalForwarder>,
}

async fn cluster() -> Cluster {
    let log = Arc::new(MemoryLog::default());
    let forwarder = Arc::new(LocalForwarder::new());
    let a_role = Arc::new(StaticCoordinator::primary(Some(NODE_A.to_string())));
    let b_role = Arc::new(StaticCoordinator::follower(NODE_A));

    let a = SchemaRegistry::builder(RegistryConfig::memory().with_node("a", NODE_A))
        .log(log.clone())
        .leadership(a_role.clone())
        .forwarder(forwarder.clone())
        .start()
        .await
        .unwrap();
    let b = SchemaRegistry::builder(RegistryConfig::memory().with_node("b", NODE_B))
        .log(log.clone())
        .leadership(b_role.clone())
        .forwarder(forwarder.clone())
        .start()
        .await
        .unwrap();
    forwarder.add(NODE_A, &a);
    forwarder.add(NODE_B, &b);

    Cluster {
        log,
        a,
        b,
        a_role,
        b_role,
        forwarder,
    }
}

/// Fresh reader over `log`, replayed to the end
async fn replay(log: Arc<dyn CommitLog>) -> schemalog::RegistryState {
    let reader = Arc::new(LogReader::new(log, LogConfig::default()));
    reader.start();
    reader
        .wait_until_ready(Duration::from_secs(5))
        .await
        .unwrap();
    let state = reader.snapshot();
    reader.shutdown();
    state
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

/// Protobuf field type change under BACKWARD
#[tokio::test]
async fn test_protobuf_type_change_is_incompatible() {
    let registry = SchemaRegistry::new(RegistryConfig::memory()).await.unwrap();
    registry
        .register("s1", SchemaType::Protobuf, MSG_V1, vec![])
        .await
        .unwrap();

    let err = registry
        .register("s1", SchemaType::Protobuf, MSG_INT, vec![])
        .await
        .unwrap_err();
    match err {
        SchemaError::Incompatible(records) => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].kind, ChangeKind::FieldTypeChanged);
            assert_eq!(records[0].path, "Msg.name");
        }
        other => panic!("expected incompatibility, got {:?}", other),
    }
    assert_eq!(registry.list_versions("s1", false).await.unwrap(), vec![1]);
}

/// A change inside a referenced schema breaks its dependents
#[tokio::test]
async fn test_change_in_reference_is_incompatible() {
    let registry = SchemaRegistry::new(RegistryConfig::memory()).await.unwrap();
    registry
        .register("container", SchemaType::Protobuf, &container("string"), vec![])
        .await
        .unwrap();
    registry
        .register(
            "s2",
            SchemaType::Protobuf,
            USES_CONTAINER,
            vec![SchemaReference::new("container.proto", "container", 1u32)],
        )
        .await
        .unwrap();

    registry
        .set_config(Some(Subject::new("container")), CompatibilityLevel::None)
        .await
        .unwrap();
    let evolved = registry
        .register("container", SchemaType::Protobuf, &container("int32"), vec![])
        .await
        .unwrap();
    assert_eq!(evolved.version, 2);

    let results = registry
        .check_compatibility(
            "s2",
            SchemaVersion::latest(),
            SchemaType::Protobuf,
            USES_CONTAINER,
            vec![SchemaReference::new("container.proto", "container", 2u32)],
        )
        .await
        .unwrap();
    assert!(!results.iter().all(|r| r.is_compatible()));
    let record = results
        .iter()
        .flat_map(|r| r.incompatibilities())
        .next()
        .unwrap();
    assert_eq!(record.kind, ChangeKind::FieldTypeChanged);
    assert_eq!(record.path, "Outer.h.s");
}

/// A follower forwards a write and then observes it locally
#[tokio::test]
async fn test_follower_forwards_registration() {
    let cluster = cluster().await;

    let registration = cluster
        .b
        .register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap();
    assert!(registration.created);
    assert_eq!(cluster.log.len(), 1);

    // B has already applied the record
    let on_b = cluster
        .b
        .get_version("users-value", SchemaVersion::latest())
        .await
        .unwrap();
    assert_eq!(on_b.id, registration.id);
    assert_eq!(cluster.a.state_snapshot(), cluster.b.state_snapshot());

    // the record names the primary as producer
    let record = schemalog::MutationRecord::decode(0, &cluster.log.records()[0].value).unwrap();
    assert_eq!(record.producer.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_forwarded_errors_keep_their_kind() {
    let cluster = cluster().await;
    cluster
        .b
        .register("s1", SchemaType::Protobuf, MSG_V1, vec![])
        .await
        .unwrap();

    let err = cluster
        .b
        .register("s1", SchemaType::Protobuf, MSG_INT, vec![])
        .await
        .unwrap_err();
    match err {
        SchemaError::Incompatible(records) => {
            assert_eq!(records[0].kind, ChangeKind::FieldTypeChanged)
        }
        other => panic!("expected incompatibility, got {:?}", other),
    }

    let err = cluster
        .b
        .delete_version("ghost", SchemaVersion::new(1), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::SubjectNotFound(_)));
}

#[tokio::test]
async fn test_forwarded_config_and_deletes() {
    let cluster = cluster().await;
    let subject = Subject::new("users-value");
    cluster
        .b
        .set_config(Some(subject.clone()), CompatibilityLevel::Full)
        .await
        .unwrap();
    assert_eq!(
        cluster.b.get_config(Some(&subject)).await.unwrap(),
        CompatibilityLevel::Full
    );

    cluster
        .b
        .register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap();
    assert_eq!(cluster.b.delete_subject("users-value", false).await.unwrap(), vec![1]);
    assert_eq!(cluster.b.delete_subject("users-value", true).await.unwrap(), vec![1]);
    assert_eq!(
        cluster.b.delete_config("users-value").await.unwrap(),
        Some(CompatibilityLevel::Full)
    );
    cluster.b.set_mode(None, Mode::Readonly).await.unwrap();
    assert_eq!(cluster.a.get_mode(None).await.unwrap(), Mode::Readonly);
    assert_eq!(cluster.a.state_snapshot(), cluster.b.state_snapshot());
}

// ============================================================================
// Leadership and forwarding failures
// ============================================================================

#[tokio::test]
async fn test_unknown_primary() {
    let log = Arc::new(MemoryLog::default());
    let registry = SchemaRegistry::builder(RegistryConfig::memory())
        .log(log)
        .leadership(Arc::new(StaticCoordinator::new(false, None)))
        .forwarder(Arc::new(LocalForwarder::new()))
        .start()
        .await
        .unwrap();

    let err = registry
        .register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::PrimaryUnknown));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn test_unreachable_primary() {
    let cluster = cluster().await;
    cluster.forwarder.remove(NODE_A);

    let err = cluster
        .b
        .register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::PrimaryUnreachable { .. }));
    assert!(cluster.log.is_empty());
}

#[tokio::test]
async fn test_stale_primary_does_not_append() {
    let cluster = cluster().await;
    // failover: B takes over, A has not heard yet that it lost the role
    cluster.b_role.set_primary(true, Some(NODE_B.to_string()));
    cluster.a_role.set_primary(false, Some(NODE_B.to_string()));

    let err = cluster
        .a
        .execute_forwarded(schemalog::ForwardRequest::SetMode {
            subject: None,
            mode: Mode::Import,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::NotPrimary { primary: Some(ref p) } if p == NODE_B));

    // writes sent to A now reach B
    cluster.a.set_mode(None, Mode::Import).await.unwrap();
    assert_eq!(cluster.b.get_mode(None).await.unwrap(), Mode::Import);
}

/// Log whose appends hang while `stalled` is set
struct StallingLog {
    inner: MemoryLog,
    stalled: AtomicBool,
}

#[async_trait]
impl CommitLog for StallingLog {
    fn topic(&self) -> &str {
        self.inner.topic()
    }

    async fn append(&self, key: Option<Bytes>, value: Bytes) -> SchemaResult<u64> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.append(key, value).await
    }

    async fn read(&self, from: u64, max_records: usize, max_wait: Duration) -> SchemaResult<Vec<LogRecord>> {
        self.inner.read(from, max_records, max_wait).await
    }

    async fn high_watermark(&self) -> SchemaResult<u64> {
        self.inner.high_watermark().await
    }
}

#[tokio::test]
async fn test_leadership_loss_fails_in_flight_write() {
    let log = Arc::new(StallingLog {
        inner: MemoryLog::default(),
        stalled: AtomicBool::new(true),
    });
    let role = Arc::new(StaticCoordinator::primary(Some(NODE_A.to_string())));
    let registry = SchemaRegistry::builder(RegistryConfig::memory())
        .log(log.clone())
        .leadership(role.clone())
        .start()
        .await
        .unwrap();

    let write = tokio::spawn({
        let registry = registry.clone();
        async move {
            registry
                .register("users-value", SchemaType::Avro, USER_V1, vec![])
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    role.set_primary(false, Some(NODE_B.to_string()));

    let err = write.await.unwrap().unwrap_err();
    assert!(matches!(err, SchemaError::NotPrimary { .. }));
    assert!(log.inner.is_empty());
}

#[tokio::test]
async fn test_lease_failover() {
    let log = Arc::new(MemoryLog::default());
    let store = Arc::new(MemoryLeaseStore::new());
    let forwarder = Arc::new(LocalForwarder::new());
    let ttl = Duration::from_secs(30);
    let a_lease = Arc::new(LeaseCoordinator::new("a", Some(NODE_A.to_string()), ttl, true, store.clone()));
    let b_lease = Arc::new(LeaseCoordinator::new("b", Some(NODE_B.to_string()), ttl, true, store.clone()));

    let a = SchemaRegistry::builder(RegistryConfig::memory().with_node("a", NODE_A))
        .log(log.clone())
        .leadership(a_lease.clone())
        .forwarder(forwarder.clone())
        .start()
        .await
        .unwrap();
    let b = SchemaRegistry::builder(RegistryConfig::memory().with_node("b", NODE_B))
        .log(log.clone())
        .leadership(b_lease.clone())
        .forwarder(forwarder.clone())
        .start()
        .await
        .unwrap();
    forwarder.add(NODE_A, &a);
    forwarder.add(NODE_B, &b);

    a_lease.tick().await;
    b_lease.tick().await;
    assert!(a.is_primary());
    assert_eq!(b.primary_location().as_deref(), Some(NODE_A));
    b.register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap();

    a_lease.shutdown().await.unwrap();
    b_lease.tick().await;
    assert!(b.is_primary());
    let registration = b
        .register("users-value", SchemaType::Avro, USER_V2, vec![])
        .await
        .unwrap();
    assert_eq!(registration.version, 2);
    assert_eq!(log.len(), 2);
}

#[tokio::test]
async fn test_config_lease_nodes_elect_one_primary() {
    let log = Arc::new(MemoryLog::default());
    let store = Arc::new(MemoryLeaseStore::new());
    let forwarder = Arc::new(LocalForwarder::new());
    let leadership = LeadershipConfig::lease(Duration::from_millis(300), true);

    let mut nodes = Vec::new();
    for (id, url) in [("a", NODE_A), ("b", NODE_B)] {
        let config = RegistryConfig::memory()
            .with_node(id, url)
            .with_leadership(leadership.clone())
            .with_timeouts(short_timeouts());
        let node = SchemaRegistry::builder(config)
            .log(log.clone())
            .lease_store(store.clone())
            .forwarder(forwarder.clone())
            .start()
            .await
            .unwrap();
        forwarder.add(url, &node);
        nodes.push(node);
    }

    // both nodes have run an election round
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !nodes.iter().all(|n| n.is_primary() || n.primary_location().is_some()) {
        assert!(tokio::time::Instant::now() < deadline, "no primary elected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(nodes.iter().filter(|n| n.is_primary()).count(), 1);

    let (primary, follower) = if nodes[0].is_primary() {
        (&nodes[0], &nodes[1])
    } else {
        (&nodes[1], &nodes[0])
    };
    assert_eq!(
        follower.primary_location(),
        primary.config().advertised_url.clone()
    );

    let registration = follower
        .register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap();
    assert_eq!(registration.version, 1);
    assert_eq!(log.len(), 1);
    let schema = primary.get_schema_by_id(registration.id).await.unwrap();
    assert_eq!(schema.id, registration.id);

    for node in &nodes {
        node.shutdown().await.unwrap();
    }
}

// ============================================================================
// Dedup and replay
// ============================================================================

#[tokio::test]
async fn test_comment_only_change_is_a_duplicate() {
    let registry = SchemaRegistry::new(RegistryConfig::memory()).await.unwrap();
    let first = registry
        .register("s1", SchemaType::Protobuf, MSG_V1, vec![])
        .await
        .unwrap();

    let commented = "// user facing message\nsyntax = \"proto3\";\n\nmessage Msg {\n  // display name\n  string name = 1;\n}\n";
    let found = registry
        .lookup("s1", SchemaType::Protobuf, commented, vec![])
        .await
        .unwrap();
    assert_eq!(found.version, 1);
    assert_eq!(found.id, first.id);

    let again = registry
        .register("s1", SchemaType::Protobuf, commented, vec![])
        .await
        .unwrap();
    assert!(!again.created);
    assert_eq!(again.id, first.id);

    let err = registry
        .lookup("s1", SchemaType::Protobuf, MSG_INT, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::NotFound(_)));
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let log = Arc::new(MemoryLog::default());
    let registry = SchemaRegistry::builder(RegistryConfig::memory())
        .log(log.clone())
        .start()
        .await
        .unwrap();

    registry
        .register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap();
    registry
        .register("users-value", SchemaType::Avro, USER_V2, vec![])
        .await
        .unwrap();
    registry
        .register("s1", SchemaType::Protobuf, MSG_V1, vec![])
        .await
        .unwrap();
    registry
        .set_config(Some(Subject::new("s1")), CompatibilityLevel::FullTransitive)
        .await
        .unwrap();
    registry
        .delete_version("users-value", SchemaVersion::new(1), false)
        .await
        .unwrap();
    registry.set_mode(None, Mode::Import).await.unwrap();

    let first = replay(log.clone()).await;
    let second = replay(log).await;
    assert_eq!(first, second);
    assert_eq!(first, registry.state_snapshot());
}

#[tokio::test]
async fn test_file_log_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = RegistryConfig::memory().with_file_log(dir.path().join("_schemas.log"));

    let registration = {
        let registry = SchemaRegistry::new(config.clone()).await.unwrap();
        let registration = registry
            .register("users-value", SchemaType::Avro, USER_V1, vec![])
            .await
            .unwrap();
        registry.shutdown().await.unwrap();
        registration
    };

    let registry = SchemaRegistry::new(config).await.unwrap();
    let schema = registry.get_schema_by_id(registration.id).await.unwrap();
    assert_eq!(schema.schema_type, SchemaType::Avro);

    let next = registry
        .register("users-value", SchemaType::Avro, USER_V2, vec![])
        .await
        .unwrap();
    assert_eq!(next.id, SchemaId(2));
    assert_eq!(next.version, 2);
}

// ============================================================================
// References
// ============================================================================

#[tokio::test]
async fn test_referenced_version_cannot_be_deleted() {
    let registry = SchemaRegistry::new(RegistryConfig::memory()).await.unwrap();
    registry
        .register("container", SchemaType::Protobuf, &container("string"), vec![])
        .await
        .unwrap();
    let user = registry
        .register(
            "s2",
            SchemaType::Protobuf,
            USES_CONTAINER,
            vec![SchemaReference::new("container.proto", "container", 1u32)],
        )
        .await
        .unwrap();

    assert_eq!(
        registry
            .referenced_by("container", SchemaVersion::new(1))
            .await
            .unwrap(),
        vec![user.id]
    );
    let err = registry
        .delete_version("container", SchemaVersion::new(1), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::ReferenceExists { version: 1, .. }));
    let err = registry.delete_subject("container", false).await.unwrap_err();
    assert!(matches!(err, SchemaError::ReferenceExists { .. }));

    // once the referrer is gone the version can go too
    registry.delete_subject("s2", false).await.unwrap();
    registry
        .delete_version("container", SchemaVersion::new(1), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_latest_reference_follows_new_versions() {
    let registry = SchemaRegistry::new(RegistryConfig::memory()).await.unwrap();
    registry
        .register("container", SchemaType::Protobuf, &container("string"), vec![])
        .await
        .unwrap();
    let latest = vec![SchemaReference::latest("container.proto", "container")];
    let user = registry
        .register("s2", SchemaType::Protobuf, USES_CONTAINER, latest.clone())
        .await
        .unwrap();

    // the stored reference keeps the sentinel
    let stored = registry.get_schema_by_id(user.id).await.unwrap();
    assert!(stored.references[0].version.is_latest());
    assert_eq!(
        registry
            .referenced_by("container", SchemaVersion::latest())
            .await
            .unwrap(),
        vec![user.id]
    );

    registry
        .set_config(Some(Subject::new("container")), CompatibilityLevel::None)
        .await
        .unwrap();
    registry
        .register("container", SchemaType::Protobuf, &container("int32"), vec![])
        .await
        .unwrap();

    // resolved now against container v2
    let results = registry
        .check_compatibility("s2", SchemaVersion::latest(), SchemaType::Protobuf, USES_CONTAINER, latest)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.is_compatible()));
}

#[tokio::test]
async fn test_latest_self_reference_is_a_cycle() {
    let registry = SchemaRegistry::new(RegistryConfig::memory()).await.unwrap();
    let err = registry
        .register(
            "container",
            SchemaType::Protobuf,
            USES_CONTAINER,
            vec![SchemaReference::latest("container.proto", "container")],
        )
        .await
        .unwrap_err();
    match err {
        SchemaError::ReferenceCycle { chain } => {
            assert_eq!(chain.last().map(String::as_str), Some("container:latest"))
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_reference() {
    let registry = SchemaRegistry::new(RegistryConfig::memory()).await.unwrap();
    let err = registry
        .register(
            "s2",
            SchemaType::Protobuf,
            USES_CONTAINER,
            vec![SchemaReference::new("container.proto", "container", 3u32)],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaError::ReferenceNotFound { .. }));
}

// ============================================================================
// Reader failures
// ============================================================================

#[tokio::test]
async fn test_corrupt_log_stops_serving() {
    let log = Arc::new(MemoryLog::default());
    log.append(None, Bytes::from_static(b"not a mutation record"))
        .await
        .unwrap();

    let registry = SchemaRegistry::builder(RegistryConfig::memory().with_timeouts(short_timeouts()))
        .log(log)
        .start()
        .await
        .unwrap();

    let err = registry.list_subjects(false).await.unwrap_err();
    assert!(err.is_fatal(), "unexpected error {:?}", err);
    let err = registry
        .register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        registry.reader_status(),
        schemalog::ReaderState::Failed { offset: 0, .. }
    ));
}

#[tokio::test]
async fn test_follower_forwards_id_lookup_while_catching_up() {
    let cluster = cluster().await;
    let registration = cluster
        .a
        .register("users-value", SchemaType::Avro, USER_V1, vec![])
        .await
        .unwrap();

    // a third node that cannot read the log yet
    cluster.log.fail_next_reads(u32::MAX);
    let c = SchemaRegistry::builder(RegistryConfig::memory().with_timeouts(short_timeouts()))
        .log(cluster.log.clone())
        .leadership(Arc::new(StaticCoordinator::follower(NODE_A)))
        .forwarder(cluster.forwarder.clone())
        .start()
        .await
        .unwrap();

    let schema = c.get_schema_by_id(registration.id).await.unwrap();
    assert_eq!(schema.id, registration.id);

    let err = c.list_subjects(false).await.unwrap_err();
    assert!(matches!(err, SchemaError::NotReady(_)));
    cluster.log.fail_next_reads(0);
}
