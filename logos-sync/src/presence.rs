//! Presence channel: who is here and what they are looking at.
//!
//! ## Architecture
//!
//! ```text
//!  UserPreferences ──┐                      (dirty flag)
//!                    ├──► PresenceChannel ─────────────► flush() once per frame
//!  instance:current ─┘          │                              │
//!                               │                              ▼
//!                               │               Awareness["presence"] ──► peers
//!                               ▼
//!  peers ──► Awareness::apply_update ──► AwarenessChange ──► merge_remote_changes
//!                                                            (instance_presence:<id>)
//! ```
//!
//! Presence records live in [`RecordScope::Presence`] and are never written
//! to the replicated log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use logos_store::{
    DisposerList, ListenFilter, Record, RecordId, RecordScope, RecordStore, RecordType,
    StoreSchema,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::awareness::{Awareness, AwarenessChange, ParticipantId};
use crate::replicated::LogOrigin;
use crate::session::{SessionContext, UserIdentity};

pub const PRESENCE_TYPE: &str = "instance_presence";
pub const INSTANCE_TYPE: &str = "instance";
pub const INSTANCE_KEY: &str = "current";

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// 2D position in document (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Local live state that presence is derived from.
///
/// Stored in the session-scope `instance:current` record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceState {
    pub cursor: Vec2,
    pub selected_ids: Vec<String>,
    pub current_page_id: Option<String>,
}

impl InstanceState {
    pub fn record_id() -> RecordId {
        RecordId::new(INSTANCE_TYPE, INSTANCE_KEY)
    }

    /// Read from the store; a missing or malformed record yields the default.
    pub fn load(store: &RecordStore) -> Self {
        store
            .get(&Self::record_id())
            .and_then(|record| serde_json::from_value(record.props).ok())
            .unwrap_or_default()
    }

    pub fn to_record(&self) -> Record {
        Record::new(Self::record_id(), instance_props(self))
    }
}

fn instance_props(state: &InstanceState) -> Value {
    serde_json::json!({
        "cursor": { "x": state.cursor.x, "y": state.cursor.y },
        "selectedIds": state.selected_ids,
        "currentPageId": state.current_page_id,
    })
}

/// What one participant publishes about itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceState {
    pub user_id: String,
    pub user_name: String,
    pub color: String,
    pub cursor: Vec2,
    pub selected_ids: Vec<String>,
    pub current_page_id: Option<String>,
}

impl PresenceState {
    /// `presence = f(identity, live state)`.
    pub fn derive(identity: &UserIdentity, instance: &InstanceState) -> Self {
        Self {
            user_id: identity.id.clone(),
            user_name: identity.name.clone(),
            color: identity.color.clone(),
            cursor: instance.cursor,
            selected_ids: instance.selected_ids.clone(),
            current_page_id: instance.current_page_id.clone(),
        }
    }

    pub fn to_record(&self) -> Record {
        let props = serde_json::json!({
            "userId": self.user_id,
            "userName": self.user_name,
            "color": self.color,
            "cursor": { "x": self.cursor.x, "y": self.cursor.y },
            "selectedIds": self.selected_ids,
            "currentPageId": self.current_page_id,
        });
        Record::new(presence_record_id(&ParticipantId::new(self.user_id.as_str())), props)
    }

    pub fn from_record(record: &Record) -> Option<Self> {
        if record.type_name != PRESENCE_TYPE {
            return None;
        }
        serde_json::from_value(record.props.clone()).ok()
    }
}

pub fn presence_record_id(participant: &ParticipantId) -> RecordId {
    RecordId::new(PRESENCE_TYPE, participant.as_str())
}

/// Record types the presence channel reads and writes.
pub fn presence_record_types() -> [RecordType; 2] {
    [
        RecordType::new(INSTANCE_TYPE, RecordScope::Session),
        RecordType::new(PRESENCE_TYPE, RecordScope::Presence),
    ]
}

pub fn with_presence_types(schema: StoreSchema) -> StoreSchema {
    presence_record_types()
        .into_iter()
        .fold(schema, |schema, record_type| schema.with_type(record_type))
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

/// Publishes local presence and mirrors remote presence into the store.
pub struct PresenceChannel {
    session: SessionContext,
    store: RecordStore,
    awareness: Awareness,
    field: String,
    dirty: Arc<AtomicBool>,
    publishes: u64,
    disposers: DisposerList,
    active: bool,
}

impl PresenceChannel {
    /// Start tracking identity and live state, and mirroring peers.
    ///
    /// Peers already known to `awareness` are mirrored right away. The
    /// first [`flush`](Self::flush) publishes the initial presence.
    pub fn activate(
        session: SessionContext,
        store: &RecordStore,
        awareness: &Awareness,
        field: &str,
    ) -> Self {
        let dirty = Arc::new(AtomicBool::new(true));
        let mut disposers = DisposerList::new();

        let flag = dirty.clone();
        disposers.push(session.preferences().subscribe(move |_| {
            flag.store(true, Ordering::Release);
        }));

        let flag = dirty.clone();
        disposers.push(store.listen(
            move |_| flag.store(true, Ordering::Release),
            ListenFilter::scope(RecordScope::Session),
        ));

        {
            let store = store.clone();
            let peers = awareness.clone();
            let local_id = session.participant_id().clone();
            let field = field.to_string();
            disposers.push(awareness.on_update(move |change| {
                if change.origin == LogOrigin::Remote {
                    mirror_remote(&store, &peers, &local_id, &field, change);
                }
            }));
        }

        let known: Vec<ParticipantId> = awareness
            .get_states()
            .into_keys()
            .filter(|id| id != session.participant_id())
            .collect();
        if !known.is_empty() {
            let change = AwarenessChange {
                added: known,
                updated: Vec::new(),
                removed: Vec::new(),
                origin: LogOrigin::Remote,
            };
            mirror_remote(store, awareness, session.participant_id(), field, &change);
        }

        log::info!("Presence active for participant {}", session.participant_id());

        Self {
            session,
            store: store.clone(),
            awareness: awareness.clone(),
            field: field.to_string(),
            dirty,
            publishes: 0,
            disposers,
            active: true,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Current presence value, derived on demand.
    pub fn derive(&self) -> PresenceState {
        PresenceState::derive(&self.session.identity(), &InstanceState::load(&self.store))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Publish presence if anything it depends on changed since the last
    /// flush. Returns whether a publish happened.
    pub fn flush(&mut self) -> bool {
        if !self.active || !self.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }
        let record = self.derive().to_record();
        self.awareness.set_local_state_field(&self.field, record_value(&record));
        self.publishes += 1;
        log::trace!("Published presence #{}", self.publishes);
        true
    }

    pub fn publish_count(&self) -> u64 {
        self.publishes
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stop publishing and mirroring. Idempotent.
    ///
    /// Clears the local awareness state so peers drop this participant, and
    /// removes mirrored peer presence from the local store.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.disposers.dispose_all();
        self.awareness.clear_local_state();

        let stale: Vec<RecordId> = self
            .store
            .records_in_scope(RecordScope::Presence)
            .into_iter()
            .map(|r| r.id)
            .collect();
        if !stale.is_empty() {
            self.store.merge_remote_changes(|s| s.remove(stale));
        }
        log::info!("Presence stopped for participant {}", self.session.participant_id());
    }
}

impl Drop for PresenceChannel {
    fn drop(&mut self) {
        self.deactivate();
    }
}

fn record_value(record: &Record) -> Value {
    serde_json::json!({
        "id": record.id.as_str(),
        "typeName": record.type_name,
        "props": record.props,
    })
}

/// Decode the presence record a peer published under `field`.
fn read_presence(state: &Value, field: &str, participant: &ParticipantId) -> Option<Record> {
    let record: Record = serde_json::from_value(state.get(field)?.clone()).ok()?;
    (record.id == presence_record_id(participant)).then_some(record)
}

fn mirror_remote(
    store: &RecordStore,
    awareness: &Awareness,
    local_id: &ParticipantId,
    field: &str,
    change: &AwarenessChange,
) {
    let mut puts = Vec::new();
    for participant in change.added.iter().chain(&change.updated) {
        if participant == local_id {
            continue;
        }
        let record = awareness
            .get_state(participant)
            .and_then(|state| read_presence(&state, field, participant));
        match record {
            Some(record) => puts.push(record),
            None => log::warn!("Skipping malformed presence from participant {participant}"),
        }
    }
    let removals: Vec<RecordId> = change
        .removed
        .iter()
        .filter(|id| *id != local_id)
        .map(presence_record_id)
        .collect();

    if puts.is_empty() && removals.is_empty() {
        return;
    }

    store.merge_remote_changes(|s| {
        for record in puts {
            let id = record.id.clone();
            if let Err(e) = s.put([record]) {
                log::warn!("Skipping presence record {id}: {e}");
            }
        }
        s.remove(removals);
    });
}
