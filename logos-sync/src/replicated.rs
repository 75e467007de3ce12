//! Replicated log: the CRDT side of the bridge.
//!
//! A thin adapter over a `yrs::Doc` with two root maps:
//!
//! ```text
//! ┌──────────────────────── yrs::Doc ────────────────────────┐
//! │  "records"  id ──► JSON-encoded Record                    │
//! │  "meta"     "schema" ──► JSON-encoded SerializedSchema    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write goes through [`ReplicatedLog::transact`], which tags the yrs
//! transaction with this participant's origin. Observers receive one
//! [`LogChange`] per committed transaction, marked [`LogOrigin::Local`] when
//! the origin is ours and [`LogOrigin::Remote`] otherwise (updates applied
//! from the network carry no origin).
//!
//! yrs runs its observers while the transaction still holds the document.
//! The observers here only capture the change and queue it; callbacks run
//! once the transaction is released, so a callback may write to the log
//! again (directly or through a store listener).
//!
//! Merge semantics are entirely yrs'.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use logos_store::{ChangeSet, Disposer, Record, RecordId, SerializedSchema};
use uuid::Uuid;
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapRef, Observable, Origin, Out, ReadTxn, StateVector, Transact,
    TransactionMut, Update,
};

use crate::error::LogError;

pub const RECORDS_MAP: &str = "records";
pub const META_MAP: &str = "meta";
pub const SCHEMA_KEY: &str = "schema";

/// Whether a committed transaction was produced by this participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Add,
    Update,
    Delete,
}

/// One changed key of the records map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: String,
    pub action: LogAction,
    /// Current JSON value, fetched at commit time. `None` for deletes and
    /// for entries that are missing or not strings.
    pub value: Option<String>,
}

/// Coalesced notification for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChange {
    pub origin: LogOrigin,
    /// Sorted by key.
    pub keys: Vec<KeyChange>,
}

/// Remote or local change of the shared schema marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerChange {
    pub origin: LogOrigin,
    pub raw: Option<String>,
}

/// Decoded view of the records map.
#[derive(Debug, Clone, Default)]
pub struct LogSnapshot {
    /// Records that decoded cleanly and whose id matches their key.
    pub records: Vec<Record>,
    /// Raw JSON per key, for every string entry.
    pub raw: BTreeMap<String, String>,
    /// Keys whose value could not be turned into a record.
    pub malformed: Vec<String>,
}

impl LogSnapshot {
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.raw
            .keys()
            .chain(self.malformed.iter().filter(|k| !self.raw.contains_key(*k)))
    }
}

fn out_to_string(value: Out) -> Option<String> {
    match value {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

type Notification = Box<dyn FnOnce() + Send>;

/// Observer callbacks waiting for the current transaction to end.
#[derive(Clone, Default)]
struct Pending {
    queue: Arc<Mutex<VecDeque<Notification>>>,
}

impl Pending {
    fn push(&self, notification: Notification) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(notification);
    }

    /// Run queued callbacks in commit order. Callbacks that write to the
    /// log queue more work, which this loop picks up too.
    fn drain(&self) {
        loop {
            let next = self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            match next {
                Some(notify) => notify(),
                None => break,
            }
        }
    }
}

/// Handle to the shared, conflict-free record log.
///
/// Cloning yields another handle to the same document and origin.
#[derive(Clone)]
pub struct ReplicatedLog {
    doc: Doc,
    records: MapRef,
    meta: MapRef,
    origin: Origin,
    pending: Pending,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create with an explicit yrs client id (for deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    pub fn from_doc(doc: Doc) -> Self {
        let records = doc.get_or_insert_map(RECORDS_MAP);
        let meta = doc.get_or_insert_map(META_MAP);
        let label = format!("logos-sync:{}", Uuid::new_v4());
        Self {
            doc,
            records,
            meta,
            origin: Origin::from(label.as_str()),
            pending: Pending::default(),
        }
    }

    /// The underlying document. Transactions opened on it directly bypass
    /// change delivery until the next transaction made through this handle.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Run `f` inside one local transaction.
    ///
    /// Observers fire once, after `f` returns and the transaction commits.
    /// yrs has no rollback, so `f` should validate before it writes.
    pub fn transact<R>(
        &self,
        f: impl FnOnce(&mut LogTxn<'_>) -> Result<R, LogError>,
    ) -> Result<R, LogError> {
        let result = {
            let mut txn = LogTxn {
                txn: self.doc.transact_mut_with(self.origin.clone()),
                records: &self.records,
                meta: &self.meta,
                writes: 0,
            };
            f(&mut txn)
        };
        self.pending.drain();
        result
    }

    /// Mirror one store change set as a single transaction.
    ///
    /// Returns the number of keys written or deleted.
    pub fn apply_change_set(&self, changes: &ChangeSet) -> Result<usize, LogError> {
        let mut puts = Vec::with_capacity(changes.added.len() + changes.updated.len());
        for record in changes.added.iter().chain(changes.updated.iter().map(|(_, new)| new)) {
            let json = record
                .to_json()
                .map_err(|e| LogError::EncodeError(e.to_string()))?;
            puts.push((record.id.as_str(), json));
        }

        self.transact(|txn| {
            for (key, json) in puts {
                txn.set_raw(key, json);
            }
            for id in &changes.removed {
                txn.delete(id);
            }
            Ok(txn.writes())
        })
    }

    /// Apply an update received from another participant.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), LogError> {
        let update =
            Update::decode_v1(update).map_err(|e| LogError::DecodeError(e.to_string()))?;
        let result = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| LogError::UpdateError(e.to_string()))
        };
        self.pending.drain();
        result
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.records.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.records.get(&txn, key).and_then(out_to_string)
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.get_raw(id.as_str())
            .and_then(|json| Record::from_json(&json).ok())
    }

    /// Decode the whole records map, setting aside anything malformed.
    pub fn snapshot(&self) -> LogSnapshot {
        let txn = self.doc.transact();
        let mut snapshot = LogSnapshot::default();
        for (key, value) in self.records.iter(&txn) {
            let Some(json) = out_to_string(value) else {
                snapshot.malformed.push(key.to_string());
                continue;
            };
            match Record::from_json(&json) {
                Ok(record) if record.id.as_str() == key => snapshot.records.push(record),
                _ => snapshot.malformed.push(key.to_string()),
            }
            snapshot.raw.insert(key.to_string(), json);
        }
        snapshot.records.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot.malformed.sort();
        snapshot
    }

    /// Well-formed records only.
    pub fn records(&self) -> Vec<Record> {
        self.snapshot().records
    }

    pub fn schema_marker_raw(&self) -> Option<String> {
        let txn = self.doc.transact();
        self.meta.get(&txn, SCHEMA_KEY).and_then(out_to_string)
    }

    pub fn schema_marker(&self) -> Result<Option<SerializedSchema>, LogError> {
        self.schema_marker_raw()
            .map(|json| {
                SerializedSchema::from_json(&json).map_err(|e| LogError::DecodeError(e.to_string()))
            })
            .transpose()
    }

    // ── Replication ──────────────────────────────────────────────

    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this log has that a peer with `remote_state_vector` lacks.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, LogError> {
        let remote_sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| LogError::DecodeError(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    // ── Observers ────────────────────────────────────────────────

    /// Observe committed changes to the records map.
    ///
    /// `callback` runs after the transaction is released.
    pub fn on_change<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&LogChange) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let origin = self.origin.clone();
        let records = self.records.clone();
        let pending = self.pending.clone();
        let subscription = self.records.observe(move |txn, event| {
            let mut keys: Vec<KeyChange> = event
                .keys(txn)
                .iter()
                .map(|(key, change)| {
                    let action = match change {
                        EntryChange::Inserted(_) => LogAction::Add,
                        EntryChange::Updated(_, _) => LogAction::Update,
                        EntryChange::Removed(_) => LogAction::Delete,
                    };
                    let value = match action {
                        LogAction::Delete => None,
                        _ => records.get(txn, key.as_ref()).and_then(out_to_string),
                    };
                    KeyChange { key: key.to_string(), action, value }
                })
                .collect();
            keys.sort_by(|a, b| a.key.cmp(&b.key));

            let change = LogChange { origin: origin_of(txn, &origin), keys };
            let callback = callback.clone();
            pending.push(Box::new(move || callback(&change)));
        });
        Disposer::new(move || drop(subscription))
    }

    /// Observe writes to the schema marker slot.
    pub fn observe_meta<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&MarkerChange) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let origin = self.origin.clone();
        let meta = self.meta.clone();
        let pending = self.pending.clone();
        let subscription = self.meta.observe(move |txn, event| {
            if !event.keys(txn).contains_key(SCHEMA_KEY) {
                return;
            }
            let change = MarkerChange {
                origin: origin_of(txn, &origin),
                raw: meta.get(txn, SCHEMA_KEY).and_then(out_to_string),
            };
            let callback = callback.clone();
            pending.push(Box::new(move || callback(&change)));
        });
        Disposer::new(move || drop(subscription))
    }
}

impl Default for ReplicatedLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicatedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedLog")
            .field("client_id", &self.client_id())
            .field("records", &self.len())
            .finish()
    }
}

fn origin_of(txn: &TransactionMut, ours: &Origin) -> LogOrigin {
    if txn.origin() == Some(ours) {
        LogOrigin::Local
    } else {
        LogOrigin::Remote
    }
}

/// Write access inside [`ReplicatedLog::transact`].
pub struct LogTxn<'doc> {
    txn: TransactionMut<'doc>,
    records: &'doc MapRef,
    meta: &'doc MapRef,
    writes: usize,
}

impl LogTxn<'_> {
    pub fn set(&mut self, record: &Record) -> Result<(), LogError> {
        let json = record
            .to_json()
            .map_err(|e| LogError::EncodeError(e.to_string()))?;
        self.set_raw(record.id.as_str(), json);
        Ok(())
    }

    pub fn set_raw(&mut self, key: &str, json: String) {
        self.records.insert(&mut self.txn, key, json);
        self.writes += 1;
    }

    /// Returns whether the key existed.
    pub fn delete(&mut self, id: &RecordId) -> bool {
        self.delete_key(id.as_str())
    }

    pub fn delete_key(&mut self, key: &str) -> bool {
        let existed = self.records.remove(&mut self.txn, key).is_some();
        if existed {
            self.writes += 1;
        }
        existed
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.records.get(&self.txn, key).and_then(out_to_string)
    }

    pub fn schema_marker_raw(&self) -> Option<String> {
        self.meta.get(&self.txn, SCHEMA_KEY).and_then(out_to_string)
    }

    pub fn set_schema_marker(&mut self, marker: &SerializedSchema) -> Result<(), LogError> {
        let json = marker
            .to_json()
            .map_err(|e| LogError::EncodeError(e.to_string()))?;
        self.meta.insert(&mut self.txn, SCHEMA_KEY, json);
        self.writes += 1;
        Ok(())
    }

    /// Keys written or deleted so far in this transaction.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn shape(key: &str, x: i64) -> Record {
        Record::with_key("shape", key, json!({ "x": x }))
    }

    fn sync(from: &ReplicatedLog, to: &ReplicatedLog) {
        let diff = from.encode_diff(&to.encode_state_vector()).unwrap();
        to.apply_update(&diff).unwrap();
    }

    fn recorder(log: &ReplicatedLog) -> (Arc<Mutex<Vec<LogChange>>>, Disposer) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let disposer = log.on_change(move |c| sink.lock().unwrap().push(c.clone()));
        (seen, disposer)
    }

    #[test]
    fn test_set_and_get() {
        let log = ReplicatedLog::new();
        log.transact(|txn| txn.set(&shape("a", 1))).unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(log.get(&RecordId::new("shape", "a")), Some(shape("a", 1)));
    }

    #[test]
    fn test_transaction_emits_one_local_change() {
        let log = ReplicatedLog::new();
        let (seen, _d) = recorder(&log);

        log.transact(|txn| {
            txn.set(&shape("a", 1))?;
            txn.set(&shape("b", 2))?;
            Ok(())
        })
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, LogOrigin::Local);
        let keys: Vec<&str> = seen[0].keys.iter().map(|k| k.key.as_str()).collect();
        assert_eq!(keys, vec!["shape:a", "shape:b"]);
        assert!(seen[0].keys.iter().all(|k| k.action == LogAction::Add));
    }

    #[test]
    fn test_applied_update_is_remote() {
        let a = ReplicatedLog::new();
        let b = ReplicatedLog::new();
        let (seen, _d) = recorder(&b);

        a.transact(|txn| txn.set(&shape("a", 1))).unwrap();
        sync(&a, &b);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, LogOrigin::Remote);
        assert_eq!(seen[0].keys[0].action, LogAction::Add);
        assert_eq!(seen[0].keys[0].value, Some(shape("a", 1).to_json().unwrap()));
    }

    #[test]
    fn test_callback_may_write_to_log() {
        let a = ReplicatedLog::new();
        let b = ReplicatedLog::new();
        let (seen, _d) = recorder(&b);
        let writer = b.clone();
        let _react = b.on_change(move |change| {
            if change.origin == LogOrigin::Remote {
                writer.transact(|txn| txn.set(&shape("reaction", 1))).unwrap();
            }
        });

        a.transact(|txn| txn.set(&shape("a", 1))).unwrap();
        sync(&a, &b);

        assert_eq!(b.get(&RecordId::new("shape", "reaction")), Some(shape("reaction", 1)));
        let origins: Vec<LogOrigin> = seen.lock().unwrap().iter().map(|c| c.origin).collect();
        assert_eq!(origins, vec![LogOrigin::Remote, LogOrigin::Local]);
    }

    #[test]
    fn test_update_and_delete_actions() {
        let a = ReplicatedLog::new();
        let b = ReplicatedLog::new();
        a.transact(|txn| {
            txn.set(&shape("a", 1))?;
            txn.set(&shape("b", 1))
        })
        .unwrap();
        sync(&a, &b);

        let (seen, _d) = recorder(&b);
        a.transact(|txn| {
            txn.set(&shape("a", 2))?;
            txn.delete(&RecordId::new("shape", "b"));
            Ok(())
        })
        .unwrap();
        sync(&a, &b);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].keys[0].action, LogAction::Update);
        assert_eq!(seen[0].keys[1].action, LogAction::Delete);
        assert_eq!(seen[0].keys[1].value, None);
        assert_eq!(b.get(&RecordId::new("shape", "a")), Some(shape("a", 2)));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_apply_change_set() {
        let log = ReplicatedLog::new();
        log.transact(|txn| txn.set(&shape("gone", 0))).unwrap();

        let changes = ChangeSet {
            added: vec![shape("a", 1)],
            updated: vec![(shape("b", 1), shape("b", 2))],
            removed: vec![RecordId::new("shape", "gone")],
        };
        let writes = log.apply_change_set(&changes).unwrap();

        assert_eq!(writes, 3);
        assert_eq!(log.len(), 2);
        assert_eq!(log.get(&RecordId::new("shape", "b")), Some(shape("b", 2)));
    }

    #[test]
    fn test_delete_missing_key() {
        let log = ReplicatedLog::new();
        let existed = log
            .transact(|txn| Ok(txn.delete(&RecordId::new("shape", "nope"))))
            .unwrap();
        assert!(!existed);
    }

    #[test]
    fn test_schema_marker_roundtrip() {
        let log = ReplicatedLog::new();
        assert_eq!(log.schema_marker().unwrap(), None);

        let marker = SerializedSchema {
            schema_version: 1,
            record_versions: [("shape".to_string(), 2)].into_iter().collect(),
        };
        log.transact(|txn| txn.set_schema_marker(&marker)).unwrap();
        assert_eq!(log.schema_marker().unwrap(), Some(marker));
        // Marker lives outside the records map
        assert!(log.is_empty());
    }

    #[test]
    fn test_snapshot_sets_aside_malformed() {
        let log = ReplicatedLog::new();
        log.transact(|txn| {
            txn.set(&shape("ok", 1))?;
            txn.set_raw("shape:garbage", "{not json".into());
            // Key and embedded id disagree
            txn.set_raw("shape:other", shape("elsewhere", 1).to_json().unwrap());
            Ok(())
        })
        .unwrap();

        let snapshot = log.snapshot();
        assert_eq!(snapshot.records, vec![shape("ok", 1)]);
        assert_eq!(snapshot.malformed, vec!["shape:garbage", "shape:other"]);
        assert_eq!(snapshot.keys().count(), 3);
    }

    #[test]
    fn test_marker_observer() {
        let a = ReplicatedLog::new();
        let b = ReplicatedLog::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _d = b.observe_meta(move |c| sink.lock().unwrap().push(c.clone()));

        let marker = SerializedSchema { schema_version: 1, record_versions: Default::default() };
        a.transact(|txn| txn.set_schema_marker(&marker)).unwrap();
        sync(&a, &b);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, LogOrigin::Remote);
        assert_eq!(seen[0].raw, Some(marker.to_json().unwrap()));
    }

    #[test]
    fn test_disposed_observer_is_silent() {
        let log = ReplicatedLog::new();
        let (seen, mut disposer) = recorder(&log);
        disposer.dispose();

        log.transact(|txn| txn.set(&shape("a", 1))).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writes_converge() {
        let a = ReplicatedLog::with_client_id(1);
        let b = ReplicatedLog::with_client_id(2);

        a.transact(|txn| txn.set(&shape("x", 1))).unwrap();
        b.transact(|txn| txn.set(&shape("x", 2))).unwrap();
        sync(&a, &b);
        sync(&b, &a);

        assert_eq!(a.get_raw("shape:x"), b.get_raw("shape:x"));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_decode_invalid_update() {
        let log = ReplicatedLog::new();
        assert!(matches!(
            log.apply_update(&[0xFF, 0xFE, 0xFD]),
            Err(LogError::DecodeError(_)) | Err(LogError::UpdateError(_))
        ));
    }
}
