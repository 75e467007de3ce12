//! Schema compatibility gate.
//!
//! Decides, from the local schema and the shared marker, whether this
//! participant seeds the log, migrates the log's snapshot forward, or must
//! stop. Pure and deterministic: the same `(schema, marker)` pair always
//! yields the same decision.
//!
//! ```text
//!  log empty ─────────────────────────────► Seed
//!  marker absent ─────────────────────────► MissingSchemaMarker
//!  marker newer / unknown types ──────────► IncompatibleSchema (stale client)
//!  otherwise ─────────────────────────────► Migrate { pending }
//! ```
//!
//! After reconciliation, and whenever a peer rewrites the marker, the
//! stricter [`SchemaGate::check_live`] applies: any pending migration means
//! the two sides no longer agree and the session is torn down.

use logos_store::{Disposer, MigrationId, SerializedSchema, StoreSchema};

use crate::error::{report_fatal, FatalSink, SyncError};
use crate::replicated::{LogOrigin, ReplicatedLog};

/// Outcome of a successful gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The log is empty; the local store is authoritative.
    Seed,
    /// The log is authoritative; its snapshot needs these migrations.
    Migrate { pending: Vec<MigrationId> },
}

pub struct SchemaGate;

impl SchemaGate {
    pub fn evaluate(
        schema: &StoreSchema,
        log_is_empty: bool,
        marker: Option<&SerializedSchema>,
    ) -> Result<GateDecision, SyncError> {
        if log_is_empty {
            return Ok(GateDecision::Seed);
        }
        let marker = marker.ok_or(SyncError::MissingSchemaMarker)?;
        let pending = schema.get_migrations_since(marker)?;
        Ok(GateDecision::Migrate { pending })
    }

    /// Evaluate against the current contents of `log`.
    pub fn evaluate_log(
        schema: &StoreSchema,
        log: &ReplicatedLog,
    ) -> Result<GateDecision, SyncError> {
        let marker = log
            .schema_marker()
            .map_err(|e| SyncError::IncompatibleSchema(e.to_string()))?;
        Self::evaluate(schema, log.is_empty(), marker.as_ref())
    }

    /// Require the shared marker to match the local schema exactly.
    pub fn check_live(
        schema: &StoreSchema,
        marker: Option<&SerializedSchema>,
    ) -> Result<(), SyncError> {
        let marker = marker.ok_or(SyncError::MissingSchemaMarker)?;
        let pending = schema.get_migrations_since(marker)?;
        if !pending.is_empty() {
            let names: Vec<String> = pending.iter().map(ToString::to_string).collect();
            return Err(SyncError::IncompatibleSchema(format!(
                "shared schema is behind by {}",
                names.join(", ")
            )));
        }
        Ok(())
    }

    /// Same as [`check_live`](Self::check_live) for a raw marker slot value.
    pub fn check_live_raw(schema: &StoreSchema, raw: Option<&str>) -> Result<(), SyncError> {
        let marker = raw
            .map(SerializedSchema::from_json)
            .transpose()
            .map_err(|e| SyncError::IncompatibleSchema(e.to_string()))?;
        Self::check_live(schema, marker.as_ref())
    }

    /// Watch the shared marker and report any incompatible remote rewrite.
    pub fn watch_schema_marker(
        schema: &StoreSchema,
        log: &ReplicatedLog,
        fatal: FatalSink,
    ) -> Disposer {
        let schema = schema.clone();
        log.observe_meta(move |change| {
            if change.origin == LogOrigin::Local {
                return;
            }
            match Self::check_live_raw(&schema, change.raw.as_deref()) {
                Ok(()) => log::debug!("Remote schema marker still compatible"),
                Err(e) => report_fatal(&fatal, e),
            }
        })
    }
}
