//! Integration tests for the store ↔ replicated log mirror.
//!
//! Each peer owns a `RecordStore`, a `ReplicatedLog`, and a live
//! `SyncBridge`. Peers exchange yrs state-vector diffs directly, standing in
//! for the network transport.

use std::sync::{Arc, Mutex};

use logos_store::{
    ChangeSource, Disposer, ListenFilter, Record, RecordId, RecordScope, RecordStore, RecordType,
    StoreChange, StoreSchema,
};
use logos_sync::{
    run_initial_sync, GateDecision, LogChange, LogOrigin, ReconcileMode, ReplicatedLog,
    SchemaGate, SyncBridge, SyncError,
};
use serde_json::json;
use tokio::sync::mpsc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn schema_v1() -> StoreSchema {
    StoreSchema::new()
        .with_type(RecordType::new("shape", RecordScope::Document))
        .with_type(RecordType::new("page", RecordScope::Document))
        .with_type(RecordType::new("instance", RecordScope::Session))
}

/// Same types, but shapes gained a `w` prop.
fn schema_v2() -> StoreSchema {
    StoreSchema::new()
        .with_type(RecordType::new("shape", RecordScope::Document).migration(|record| {
            record.props["w"] = json!(10);
            Ok(())
        }))
        .with_type(RecordType::new("page", RecordScope::Document))
        .with_type(RecordType::new("instance", RecordScope::Session))
}

fn shape(key: &str, x: i64) -> Record {
    Record::with_key("shape", key, json!({ "x": x }))
}

struct Peer {
    store: RecordStore,
    log: ReplicatedLog,
    fatal: mpsc::UnboundedReceiver<SyncError>,
    _watch: Disposer,
    _bridge: SyncBridge,
}

impl Peer {
    /// Reconcile against `log` and start mirroring.
    fn join(store: RecordStore, log: ReplicatedLog) -> Self {
        run_initial_sync(&store, &log).unwrap();
        let (tx, fatal) = mpsc::unbounded_channel();
        let watch = SchemaGate::watch_schema_marker(store.schema(), &log, tx.clone());
        let bridge = SyncBridge::activate(&store, &log, tx);
        Self { store, log, fatal, _watch: watch, _bridge: bridge }
    }

    fn document(&self) -> Vec<Record> {
        self.store.records_in_scope(RecordScope::Document)
    }
}

fn relay(from: &ReplicatedLog, to: &ReplicatedLog) {
    let diff = from.encode_diff(&to.encode_state_vector()).unwrap();
    to.apply_update(&diff).unwrap();
}

fn exchange(a: &Peer, b: &Peer) {
    relay(&a.log, &b.log);
    relay(&b.log, &a.log);
}

fn record_store_changes(store: &RecordStore) -> (Arc<Mutex<Vec<StoreChange>>>, Disposer) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let d = store.listen(move |c| sink.lock().unwrap().push(c.clone()), ListenFilter::all());
    (seen, d)
}

fn record_log_changes(log: &ReplicatedLog) -> (Arc<Mutex<Vec<LogChange>>>, Disposer) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let d = log.on_change(move |c| sink.lock().unwrap().push(c.clone()));
    (seen, d)
}

// ───────────────────────────────────────────────────────────────────
// Reconciliation
// ───────────────────────────────────────────────────────────────────

#[test]
fn test_seeding_scenario() {
    init_logging();
    let store = RecordStore::new(schema_v1());
    store.put([shape("r1", 1), shape("r2", 2)]).unwrap();
    let log = ReplicatedLog::new();

    let report = run_initial_sync(&store, &log).unwrap();

    assert_eq!(report.mode, ReconcileMode::Seeded);
    assert_eq!(log.records(), vec![shape("r1", 1), shape("r2", 2)]);
    assert_eq!(log.len(), 2);
    assert_eq!(log.schema_marker().unwrap(), Some(store.schema().serialize()));
}

#[test]
fn test_second_peer_adopts_log() {
    init_logging();
    let a_store = RecordStore::new(schema_v1());
    a_store.put([shape("r1", 1)]).unwrap();
    let a = Peer::join(a_store, ReplicatedLog::new());

    let b_log = ReplicatedLog::new();
    relay(&a.log, &b_log);
    let b_store = RecordStore::new(schema_v1());
    b_store.put([shape("stale-local", 5)]).unwrap();
    let b = Peer::join(b_store, b_log);

    assert_eq!(b.document(), a.document());
    assert_eq!(b.log.records(), a.log.records());
}

#[test]
fn test_idempotent_reconciliation() {
    init_logging();
    let store = RecordStore::new(schema_v1());
    store.put([shape("a", 1), shape("b", 2)]).unwrap();
    let log = ReplicatedLog::new();
    run_initial_sync(&store, &log).unwrap();

    let (log_changes, _d) = record_log_changes(&log);
    let before = log.encode_state();
    let report = run_initial_sync(&store, &log).unwrap();

    assert!(report.is_noop());
    assert_eq!(log.encode_state(), before);
    assert!(log_changes.lock().unwrap().is_empty());
}

#[test]
fn test_migration_forward() {
    init_logging();
    let old_store = RecordStore::new(schema_v1());
    old_store.put([shape("a", 1)]).unwrap();
    let old = Peer::join(old_store, ReplicatedLog::new());

    let new_log = ReplicatedLog::new();
    relay(&old.log, &new_log);
    let new_store = RecordStore::new(schema_v2());
    let report = run_initial_sync(&new_store, &new_log).unwrap();

    assert_eq!(report.mode, ReconcileMode::Migrated);
    assert_eq!(report.written, 1);
    assert!(report.marker_updated);
    let migrated = new_store.get(&RecordId::new("shape", "a")).unwrap();
    assert_eq!(migrated.props, json!({ "x": 1, "w": 10 }));
    assert_eq!(new_log.get(&migrated.id), Some(migrated));
    assert_eq!(new_log.schema_marker().unwrap(), Some(schema_v2().serialize()));
}

#[test]
fn test_stale_client_refused() {
    init_logging();
    let new_store = RecordStore::new(schema_v2());
    new_store.put([shape("a", 1)]).unwrap();
    let new_log = ReplicatedLog::new();
    run_initial_sync(&new_store, &new_log).unwrap();

    let old_log = ReplicatedLog::new();
    relay(&new_log, &old_log);
    let old_store = RecordStore::new(schema_v1());
    old_store.put([shape("mine", 1)]).unwrap();

    assert!(matches!(
        run_initial_sync(&old_store, &old_log),
        Err(SyncError::IncompatibleSchema(_))
    ));
    // Nothing loaded, nothing written
    assert_eq!(old_store.len(), 1);
    assert_eq!(old_log.records(), new_log.records());
}

#[test]
fn test_live_marker_upgrade_is_fatal_for_old_peer() {
    init_logging();
    let old_store = RecordStore::new(schema_v1());
    old_store.put([shape("a", 1)]).unwrap();
    let mut old = Peer::join(old_store, ReplicatedLog::new());

    let new_log = ReplicatedLog::new();
    relay(&old.log, &new_log);
    run_initial_sync(&RecordStore::new(schema_v2()), &new_log).unwrap();
    relay(&new_log, &old.log);

    assert!(matches!(old.fatal.try_recv(), Ok(SyncError::IncompatibleSchema(_))));
}

#[test]
fn test_gate_determinism() {
    let schema = schema_v2();
    let markers = [schema_v1().serialize(), schema_v2().serialize()];
    for marker in &markers {
        let first = SchemaGate::evaluate(&schema, false, Some(marker));
        for _ in 0..5 {
            assert_eq!(SchemaGate::evaluate(&schema, false, Some(marker)), first);
        }
    }
    assert!(matches!(
        SchemaGate::evaluate(&schema, false, Some(&markers[0])),
        Ok(GateDecision::Migrate { pending }) if pending.len() == 1
    ));
}

// ───────────────────────────────────────────────────────────────────
// Live mirroring
// ───────────────────────────────────────────────────────────────────

#[test]
fn test_mirror_equivalence() {
    init_logging();
    let a = Peer::join(RecordStore::new(schema_v1()), ReplicatedLog::new());
    let b_log = ReplicatedLog::new();
    relay(&a.log, &b_log);
    let b = Peer::join(RecordStore::new(schema_v1()), b_log);

    a.store.put([shape("s1", 1), shape("s2", 2)]).unwrap();
    b.store.put([Record::with_key("page", "p1", json!({ "name": "One" }))]).unwrap();
    a.store.transact(|s| {
        s.put([shape("s1", 10)]).unwrap();
        s.remove([RecordId::new("shape", "s2")]);
    });
    b.store.put([Record::with_key("instance", "current", json!({}))]).unwrap();

    // Each side mirrors its own edits immediately
    assert_eq!(a.log.records(), a.document());
    assert_eq!(b.log.records(), b.document());

    exchange(&a, &b);

    assert_eq!(a.log.records(), a.document());
    assert_eq!(b.log.records(), b.document());
    assert_eq!(a.document(), b.document());
    assert_eq!(a.document().len(), 2);
    // Session records never leave their store
    assert!(!a.store.contains(&RecordId::new("instance", "current")));
}

#[test]
fn test_echo_suppression() {
    init_logging();
    let a = Peer::join(RecordStore::new(schema_v1()), ReplicatedLog::new());
    let (store_changes, _d1) = record_store_changes(&a.store);
    let (log_changes, _d2) = record_log_changes(&a.log);

    for i in 0..5 {
        a.store.put([shape(&format!("s{i}"), i)]).unwrap();
    }

    let log_changes = log_changes.lock().unwrap();
    assert_eq!(log_changes.len(), 5);
    assert!(log_changes.iter().all(|c| c.origin == LogOrigin::Local));

    let store_changes = store_changes.lock().unwrap();
    assert_eq!(store_changes.len(), 5);
    assert!(store_changes.iter().all(|c| c.source == ChangeSource::User));
}

#[test]
fn test_remote_merge_not_rebroadcast() {
    init_logging();
    let a = Peer::join(RecordStore::new(schema_v1()), ReplicatedLog::new());
    let b_log = ReplicatedLog::new();
    relay(&a.log, &b_log);
    let b = Peer::join(RecordStore::new(schema_v1()), b_log);

    let (b_log_changes, _d) = record_log_changes(&b.log);
    a.store.put([shape("x", 1)]).unwrap();
    relay(&a.log, &b.log);

    // One remote transaction in, no local transaction out
    let b_log_changes = b_log_changes.lock().unwrap();
    assert_eq!(b_log_changes.len(), 1);
    assert_eq!(b_log_changes[0].origin, LogOrigin::Remote);
    assert!(b.store.contains(&RecordId::new("shape", "x")));
}

#[test]
fn test_reactive_edit_during_remote_merge() {
    init_logging();
    let a = Peer::join(RecordStore::new(schema_v1()), ReplicatedLog::new());
    let b_log = ReplicatedLog::new();
    relay(&a.log, &b_log);
    let b = Peer::join(RecordStore::new(schema_v1()), b_log);

    // B answers every remote shape:x with a user edit of its own
    let editor = b.store.clone();
    let _react = b.store.listen(
        move |c: &StoreChange| {
            if c.source == ChangeSource::Remote
                && c.changes.added.iter().any(|r| r.id.key() == "x")
            {
                editor.put([shape("reaction", 1)]).unwrap();
            }
        },
        ListenFilter::all(),
    );

    a.store.put([shape("x", 1)]).unwrap();
    let (from, to) = (a.log.clone(), b.log.clone());
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        relay(&from, &to);
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(std::time::Duration::from_secs(3))
        .expect("relay did not finish");

    assert!(b.store.contains(&RecordId::new("shape", "reaction")));
    relay(&b.log, &a.log);
    assert!(a.store.contains(&RecordId::new("shape", "reaction")));
    assert_eq!(a.document(), b.document());
}

#[test]
fn test_atomic_batch_visibility() {
    init_logging();
    let a_store = RecordStore::new(schema_v1());
    a_store.put([shape("old1", 0), shape("old2", 0)]).unwrap();
    let a = Peer::join(a_store, ReplicatedLog::new());
    let b_log = ReplicatedLog::new();
    relay(&a.log, &b_log);
    let b = Peer::join(RecordStore::new(schema_v1()), b_log);

    let (remote_store_changes, _d1) = record_store_changes(&b.store);
    let (remote_log_changes, _d2) = record_log_changes(&b.log);

    a.store.transact(|s| {
        s.put([shape("n1", 1), shape("n2", 2), shape("n3", 3)]).unwrap();
        s.remove([RecordId::new("shape", "old1"), RecordId::new("shape", "old2")]);
    });
    relay(&a.log, &b.log);

    let log_changes = remote_log_changes.lock().unwrap();
    assert_eq!(log_changes.len(), 1);
    assert_eq!(log_changes[0].keys.len(), 5);

    let store_changes = remote_store_changes.lock().unwrap();
    assert_eq!(store_changes.len(), 1);
    assert_eq!(store_changes[0].source, ChangeSource::Remote);
    assert_eq!(store_changes[0].changes.added.len(), 3);
    assert_eq!(store_changes[0].changes.removed.len(), 2);
}

#[test]
fn test_concurrent_edits_converge() {
    init_logging();
    let a = Peer::join(RecordStore::new(schema_v1()), ReplicatedLog::with_client_id(1));
    let b_log = ReplicatedLog::with_client_id(2);
    relay(&a.log, &b_log);
    let b = Peer::join(RecordStore::new(schema_v1()), b_log);

    a.store.put([shape("same", 1)]).unwrap();
    b.store.put([shape("same", 2)]).unwrap();
    exchange(&a, &b);

    assert_eq!(a.log.records(), b.log.records());
    assert_eq!(a.document(), b.document());
    assert_eq!(a.document(), a.log.records());
}
