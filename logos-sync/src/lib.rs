//! # logos-sync — Bidirectional store ↔ CRDT sync for Logos
//!
//! Keeps a local [`RecordStore`](logos_store::RecordStore) consistent with a
//! network-replicated yrs document, propagates ephemeral presence, and
//! refuses to run against an incompatible shared schema.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   user edits    ┌───────────────┐    yrs updates    ┌──────────┐
//! │ RecordStore │ ──────────────► │  SyncBridge   │ ◄───────────────► │ peers    │
//! │  (local)    │ ◄────────────── │               │                   │          │
//! └──────┬──────┘  remote merges  └───────┬───────┘                   └────┬─────┘
//!        │                                │ ReplicatedLog                  │
//!        │ session scope                  ▼                                │
//!        ▼                        ┌───────────────┐   awareness updates    │
//! ┌─────────────────┐             │  SchemaGate   │                        │
//! │ PresenceChannel │ ◄───────────┴───────────────┴──────────────────────► │
//! └─────────────────┘
//!
//!               SyncController: Loading → SyncedRemote{Online|Offline} | Error
//! ```
//!
//! ## Modules
//!
//! - [`replicated`] — `ReplicatedLog`, a yrs-backed record map plus schema marker slot
//! - [`gate`] — schema compatibility decisions
//! - [`reconcile`] — one-time seeding or forward migration of the shared log
//! - [`bridge`] — the live two-way mirror with echo suppression
//! - [`awareness`] — shared ephemeral per-participant state
//! - [`session`] / [`presence`] — user identity and presence records
//! - [`controller`] — connection lifecycle and observable status
//! - [`transport`] — the boundary to the network layer

pub mod awareness;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod error;
pub mod gate;
pub mod listeners;
pub mod presence;
pub mod reconcile;
pub mod replicated;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    Awareness, AwarenessChange, AwarenessError, AwarenessUpdate, ParticipantId, WireEntry,
};
pub use bridge::{apply_remote_change, MergeReport, SyncBridge};
pub use config::SyncConfig;
pub use controller::{ConnectionStatus, SyncController, SyncStatus};
pub use error::{FatalSink, LogError, SyncError};
pub use gate::{GateDecision, SchemaGate};
pub use listeners::Listeners;
pub use replicated::{
    KeyChange, LogAction, LogChange, LogOrigin, LogSnapshot, LogTxn, MarkerChange, ReplicatedLog,
};
pub use presence::{
    presence_record_id, presence_record_types, with_presence_types, InstanceState,
    PresenceChannel, PresenceState, Vec2, INSTANCE_TYPE, PRESENCE_TYPE,
};
pub use reconcile::{reconcile, run_initial_sync, ReconcileMode, ReconcileReport};
pub use session::{default_color, SessionContext, UserIdentity, UserPreferences};
pub use transport::{Transport, TransportEvent, TransportStatus};
