//! Shared ephemeral per-participant state.
//!
//! Every participant owns one JSON object of fields (presence, for now) and
//! a clock that grows with every local change. Peers exchange
//! [`AwarenessUpdate`]s; an entry wins when its clock is newer than what the
//! receiver has seen. A missing state means the participant left.
//!
//! ```text
//!  set_local_state_field ──► clock+1 ──► encode_update ──► transport
//!                                                             │
//!  on_update ◄── AwarenessChange{added,updated,removed} ◄── apply_update
//! ```
//!
//! Nothing here is persisted or written to the replicated log.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use logos_store::Disposer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::listeners::Listeners;
use crate::replicated::LogOrigin;

/// Participant identifier, derived from the transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_connection(connection_id: u64) -> Self {
        Self(connection_id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Participants touched by one local change or one applied update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ParticipantId>,
    pub updated: Vec<ParticipantId>,
    pub removed: Vec<ParticipantId>,
    pub origin: LogOrigin,
}

impl AwarenessChange {
    fn new(origin: LogOrigin) -> Self {
        Self { added: Vec::new(), updated: Vec::new(), removed: Vec::new(), origin }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ── Wire format ─────────────────────────────────────────────────

/// One participant's state as sent over the wire.
///
/// The state travels as a JSON string: bincode cannot carry
/// `serde_json::Value` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub participant: ParticipantId,
    pub clock: u64,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<WireEntry>,
}

impl AwarenessUpdate {
    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, AwarenessError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AwarenessError::EncodeError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| AwarenessError::DecodeError(e.to_string()))?;
        Ok(update)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessError {
    EncodeError(String),
    DecodeError(String),
}

impl fmt::Display for AwarenessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError(e) => write!(f, "Awareness encode error: {e}"),
            Self::DecodeError(e) => write!(f, "Awareness decode error: {e}"),
        }
    }
}

impl std::error::Error for AwarenessError {}

// ── State ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    clock: u64,
    state: Option<Map<String, Value>>,
}

struct Inner {
    local_id: ParticipantId,
    entries: BTreeMap<ParticipantId, Entry>,
}

/// Handle to this participant's view of everyone's ephemeral state.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct Awareness {
    inner: Arc<Mutex<Inner>>,
    listeners: Listeners<AwarenessChange>,
}

impl Awareness {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { local_id, entries: BTreeMap::new() })),
            listeners: Listeners::new(),
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.lock().local_id.clone()
    }

    /// Every participant that currently has a state, self included.
    pub fn get_states(&self) -> BTreeMap<ParticipantId, Value> {
        self.lock()
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                entry.state.as_ref().map(|s| (id.clone(), Value::Object(s.clone())))
            })
            .collect()
    }

    pub fn get_state(&self, id: &ParticipantId) -> Option<Value> {
        self.lock()
            .entries
            .get(id)
            .and_then(|e| e.state.clone())
            .map(Value::Object)
    }

    pub fn clock_of(&self, id: &ParticipantId) -> Option<u64> {
        self.lock().entries.get(id).map(|e| e.clock)
    }

    /// Set one field of the local state and bump the local clock.
    pub fn set_local_state_field(&self, key: &str, value: Value) {
        let change = {
            let mut inner = self.lock();
            let local_id = inner.local_id.clone();
            let entry = inner
                .entries
                .entry(local_id.clone())
                .or_insert(Entry { clock: 0, state: None });

            let mut change = AwarenessChange::new(LogOrigin::Local);
            if entry.state.is_some() {
                change.updated.push(local_id);
            } else {
                change.added.push(local_id);
            }
            entry.clock += 1;
            entry.state.get_or_insert_with(Map::new).insert(key.to_string(), value);
            change
        };
        self.listeners.emit(&change);
    }

    /// Drop the local state. Peers see this participant as removed.
    pub fn clear_local_state(&self) {
        let change = {
            let mut inner = self.lock();
            let local_id = inner.local_id.clone();
            match inner.entries.get_mut(&local_id) {
                Some(entry) if entry.state.is_some() => {
                    entry.clock += 1;
                    entry.state = None;
                    let mut change = AwarenessChange::new(LogOrigin::Local);
                    change.removed.push(local_id);
                    Some(change)
                }
                _ => None,
            }
        };
        if let Some(change) = change {
            self.listeners.emit(&change);
        }
    }

    // ── Replication ──────────────────────────────────────────────

    /// Encode the entries of `ids` that this participant knows about,
    /// including tombstones.
    pub fn encode_update(&self, ids: &[ParticipantId]) -> Result<Vec<u8>, AwarenessError> {
        let entries = {
            let inner = self.lock();
            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(entry) = inner.entries.get(id) else {
                    continue;
                };
                let state = entry
                    .state
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|e| AwarenessError::EncodeError(e.to_string()))?;
                entries.push(WireEntry { participant: id.clone(), clock: entry.clock, state });
            }
            entries
        };
        AwarenessUpdate { entries }.encode()
    }

    /// Encode this participant's own entry.
    pub fn encode_local(&self) -> Result<Vec<u8>, AwarenessError> {
        let local_id = self.local_id();
        self.encode_update(&[local_id])
    }

    /// Apply an update from a peer.
    ///
    /// Entries about this participant are ignored; so are entries whose
    /// clock is not newer than the one already seen. The update is fully
    /// decoded before anything is applied.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<AwarenessChange, AwarenessError> {
        let update = AwarenessUpdate::decode(bytes)?;
        let mut decoded = Vec::with_capacity(update.entries.len());
        for wire in update.entries {
            let state = match wire.state {
                Some(json) => match serde_json::from_str::<Value>(&json) {
                    Ok(Value::Object(map)) => Some(map),
                    Ok(_) => {
                        return Err(AwarenessError::DecodeError(format!(
                            "state of {} is not an object",
                            wire.participant
                        )))
                    }
                    Err(e) => return Err(AwarenessError::DecodeError(e.to_string())),
                },
                None => None,
            };
            decoded.push((wire.participant, wire.clock, state));
        }

        let change = {
            let mut inner = self.lock();
            let mut change = AwarenessChange::new(LogOrigin::Remote);
            for (participant, clock, state) in decoded {
                if participant == inner.local_id {
                    continue;
                }
                let had_state = match inner.entries.get(&participant) {
                    Some(current) => {
                        // Equal clocks only matter for a removal
                        let newer = clock > current.clock
                            || (clock == current.clock && state.is_none() && current.state.is_some());
                        if !newer {
                            continue;
                        }
                        current.state.is_some()
                    }
                    None => false,
                };

                match (had_state, state.is_some()) {
                    (false, true) => change.added.push(participant.clone()),
                    (true, true) => change.updated.push(participant.clone()),
                    (true, false) => change.removed.push(participant.clone()),
                    (false, false) => {}
                }
                inner.entries.insert(participant, Entry { clock, state });
            }
            change
        };

        if !change.is_empty() {
            self.listeners.emit(&change);
        }
        Ok(change)
    }

    /// Drop the state of peers the transport reports as gone.
    ///
    /// The last seen clock stays behind as a tombstone, so a delayed or
    /// replayed update from before the removal cannot bring the peer back.
    pub fn remove_participants(&self, ids: &[ParticipantId]) -> AwarenessChange {
        let change = {
            let mut inner = self.lock();
            let mut change = AwarenessChange::new(LogOrigin::Remote);
            for id in ids {
                if *id == inner.local_id {
                    continue;
                }
                if let Some(entry) = inner.entries.get_mut(id) {
                    if entry.state.take().is_some() {
                        change.removed.push(id.clone());
                    }
                }
            }
            change
        };
        if !change.is_empty() {
            self.listeners.emit(&change);
        }
        change
    }

    // ── Observers ────────────────────────────────────────────────

    pub fn on_update<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.listeners.add(callback)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Awareness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Awareness")
            .field("local_id", &inner.local_id)
            .field("participants", &inner.entries.len())
            .finish()
    }
}
