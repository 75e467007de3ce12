//! In-memory record store with batched, origin-tagged change notifications.
//!
//! ```text
//!  put / remove ──┐
//!                 ▼
//!          ┌─────────────┐  commit   ┌──────────────┐
//!  batch ─►│ pending diff│ ────────► │ ChangeSet    │──► listeners
//!          └─────────────┘           │ (squashed)   │    (filtered by
//!                                    └──────────────┘     source + scope)
//! ```
//!
//! A batch is opened by [`RecordStore::transact`] (user edits) or
//! [`RecordStore::merge_remote_changes`] (changes that arrived from
//! elsewhere). Listeners only ever see whole batches, after commit, and
//! never while a store lock is held, so a listener may read or write the
//! store again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::dispose::Disposer;
use crate::record::{Record, RecordId, RecordScope};
use crate::schema::StoreSchema;

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Local edits made through the editing surface.
    User,
    /// Changes merged in from the replicated log or presence channel.
    Remote,
}

/// Which changes a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListenFilter {
    /// `None` means any source.
    pub source: Option<ChangeSource>,
    /// `None` means any scope.
    pub scope: Option<RecordScope>,
}

impl ListenFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// User-originated edits to persistent document records.
    pub fn user_document() -> Self {
        Self {
            source: Some(ChangeSource::User),
            scope: Some(RecordScope::Document),
        }
    }

    pub fn scope(scope: RecordScope) -> Self {
        Self { source: None, scope: Some(scope) }
    }

    fn accepts_source(&self, source: ChangeSource) -> bool {
        self.source.map_or(true, |s| s == source)
    }
}

/// One atomic batch of record changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<Record>,
    /// `(old, new)` pairs.
    pub updated: Vec<(Record, Record)>,
    pub removed: Vec<RecordId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Total number of record-level changes.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// Keep only the changes whose record type satisfies `keep`.
    fn retain_types(&self, keep: impl Fn(&str) -> bool) -> ChangeSet {
        ChangeSet {
            added: self.added.iter().filter(|r| keep(&r.type_name)).cloned().collect(),
            updated: self
                .updated
                .iter()
                .filter(|(_, new)| keep(&new.type_name))
                .cloned()
                .collect(),
            removed: self.removed.iter().filter(|id| keep(id.type_name())).cloned().collect(),
        }
    }
}

/// A committed change as delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub source: ChangeSource,
    pub changes: ChangeSet,
}

type Listener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    filter: ListenFilter,
    callback: Listener,
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: Vec<ListenerEntry>,
}

/// `(before, after)` for every record touched in the open batch.
struct Batch {
    source: ChangeSource,
    depth: u32,
    touched: BTreeMap<RecordId, (Option<Record>, Option<Record>)>,
}

impl Batch {
    fn new(source: ChangeSource) -> Self {
        Self { source, depth: 1, touched: BTreeMap::new() }
    }

    fn record(&mut self, id: RecordId, before: Option<Record>, after: Option<Record>) {
        self.touched
            .entry(id)
            .and_modify(|(_, latest)| *latest = after.clone())
            .or_insert((before, after));
    }

    fn into_change_set(self) -> ChangeSet {
        let mut set = ChangeSet::default();
        for (id, (before, after)) in self.touched {
            match (before, after) {
                (None, Some(new)) => set.added.push(new),
                (Some(old), Some(new)) if old != new => set.updated.push((old, new)),
                (Some(_), None) => set.removed.push(id),
                _ => {}
            }
        }
        set
    }
}

#[derive(Default)]
struct StoreState {
    records: BTreeMap<RecordId, Record>,
    batch: Option<Batch>,
}

struct StoreShared {
    schema: StoreSchema,
    state: Mutex<StoreState>,
    listeners: Mutex<ListenerTable>,
}

/// Authoritative in-memory document state.
///
/// Cloning is cheap and yields another handle to the same store.
#[derive(Clone)]
pub struct RecordStore {
    shared: Arc<StoreShared>,
}

impl RecordStore {
    pub fn new(schema: StoreSchema) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                schema,
                state: Mutex::new(StoreState::default()),
                listeners: Mutex::new(ListenerTable::default()),
            }),
        }
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.shared.schema
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.state().records.get(id).cloned()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.state().records.contains_key(id)
    }

    pub fn all_records(&self) -> Vec<Record> {
        self.state().records.values().cloned().collect()
    }

    pub fn records_in_scope(&self, scope: RecordScope) -> Vec<Record> {
        let schema = &self.shared.schema;
        self.state()
            .records
            .values()
            .filter(|r| schema.scope_of(&r.type_name) == Some(scope))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Insert or replace records.
    ///
    /// Every record is validated before any is written.
    pub fn put(&self, records: impl IntoIterator<Item = Record>) -> Result<(), StoreError> {
        let records: Vec<Record> = records.into_iter().collect();
        self.validate_all(&records)?;
        self.in_batch(ChangeSource::User, |current, batch| {
            for record in records {
                let before = current.insert(record.id.clone(), record.clone());
                batch.record(record.id.clone(), before, Some(record));
            }
        });
        Ok(())
    }

    /// Remove records by id. Unknown ids are ignored.
    pub fn remove(&self, ids: impl IntoIterator<Item = RecordId>) {
        let ids: Vec<RecordId> = ids.into_iter().collect();
        self.in_batch(ChangeSource::User, |current, batch| {
            for id in ids {
                if let Some(before) = current.remove(&id) {
                    batch.record(id, Some(before), None);
                }
            }
        });
    }

    /// Run `f` as one atomic user edit.
    pub fn transact<R>(&self, f: impl FnOnce(&RecordStore) -> R) -> R {
        self.batched(ChangeSource::User, f)
    }

    /// Run `f` as one atomic merge of changes that did not originate here.
    ///
    /// Listeners see the result tagged [`ChangeSource::Remote`], which keeps
    /// the sync bridge from sending it back out.
    pub fn merge_remote_changes<R>(&self, f: impl FnOnce(&RecordStore) -> R) -> R {
        self.batched(ChangeSource::Remote, f)
    }

    /// Replace every document-scope record with `records`.
    ///
    /// Session and presence records are kept. Emitted as a remote change.
    pub fn load_snapshot(&self, records: impl IntoIterator<Item = Record>) -> Result<(), StoreError> {
        let records: Vec<Record> = records.into_iter().collect();
        self.validate_all(&records)?;
        let keep: std::collections::BTreeSet<&RecordId> = records.iter().map(|r| &r.id).collect();
        let stale: Vec<RecordId> = self
            .records_in_scope(RecordScope::Document)
            .into_iter()
            .map(|r| r.id)
            .filter(|id| !keep.contains(id))
            .collect();

        let count = records.len();
        self.merge_remote_changes(|store| {
            store.remove(stale);
            store.put(records)
        })?;
        log::debug!("Loaded snapshot of {count} document records");
        Ok(())
    }

    /// Check `records` against the schema without writing anything.
    ///
    /// [`put`](Self::put) and [`load_snapshot`](Self::load_snapshot) fail
    /// exactly when this does.
    pub fn validate_all(&self, records: &[Record]) -> Result<(), StoreError> {
        records.iter().try_for_each(|record| self.validate(record))
    }

    // ── Listeners ────────────────────────────────────────────────

    /// Subscribe to committed changes matching `filter`.
    pub fn listen<F>(&self, callback: F, filter: ListenFilter) -> Disposer
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let id = {
            let mut table = self.listeners();
            table.next_id += 1;
            let id = table.next_id;
            table.entries.push(ListenerEntry {
                id,
                filter,
                callback: Arc::new(callback),
            });
            id
        };

        let weak: Weak<StoreShared> = Arc::downgrade(&self.shared);
        Disposer::new(move || {
            if let Some(shared) = weak.upgrade() {
                let mut table = shared.listeners.lock().unwrap_or_else(|e| e.into_inner());
                table.entries.retain(|e| e.id != id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().entries.len()
    }

    // ── Internals ────────────────────────────────────────────────

    fn validate(&self, record: &Record) -> Result<(), StoreError> {
        if self.shared.schema.record_type(&record.type_name).is_none() {
            return Err(StoreError::UnknownRecordType(record.type_name.clone()));
        }
        if record.id.type_name() != record.type_name {
            return Err(StoreError::MismatchedId {
                id: record.id.clone(),
                type_name: record.type_name.clone(),
            });
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerTable> {
        self.shared.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside an open batch; commits if this call opened it.
    fn in_batch(
        &self,
        source: ChangeSource,
        f: impl FnOnce(&mut BTreeMap<RecordId, Record>, &mut Batch),
    ) {
        self.batched(source, |store| {
            let mut state = store.state();
            let StoreState { records, batch } = &mut *state;
            if let Some(batch) = batch.as_mut() {
                f(records, batch);
            }
        });
    }

    fn batched<R>(&self, source: ChangeSource, f: impl FnOnce(&RecordStore) -> R) -> R {
        {
            let mut state = self.state();
            match state.batch.as_mut() {
                // Nested batches join the outermost one and take its source
                Some(batch) => batch.depth += 1,
                None => state.batch = Some(Batch::new(source)),
            }
        }

        let result = f(self);

        let committed = {
            let mut state = self.state();
            let done = match state.batch.as_mut() {
                Some(batch) => {
                    batch.depth -= 1;
                    batch.depth == 0
                }
                None => false,
            };
            if done {
                state.batch.take()
            } else {
                None
            }
        };

        if let Some(batch) = committed {
            let source = batch.source;
            let changes = batch.into_change_set();
            if !changes.is_empty() {
                self.emit(StoreChange { source, changes });
            }
        }
        result
    }

    fn emit(&self, change: StoreChange) {
        let targets: Vec<(ListenFilter, Listener)> = self
            .listeners()
            .entries
            .iter()
            .filter(|e| e.filter.accepts_source(change.source))
            .map(|e| (e.filter, e.callback.clone()))
            .collect();

        let schema = &self.shared.schema;
        for (filter, callback) in targets {
            match filter.scope {
                None => callback(&change),
                Some(scope) => {
                    let changes = change
                        .changes
                        .retain_types(|t| schema.scope_of(t) == Some(scope));
                    if !changes.is_empty() {
                        callback(&StoreChange { source: change.source, changes });
                    }
                }
            }
        }
    }
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("records", &self.len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    UnknownRecordType(String),
    MismatchedId { id: RecordId, type_name: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRecordType(t) => write!(f, "Unknown record type: {t}"),
            Self::MismatchedId { id, type_name } => {
                write!(f, "Record id {id} does not belong to type {type_name}")
            }
        }
    }
}

impl std::error::Error for StoreError {}
