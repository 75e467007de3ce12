//! Initial reconciliation: establish mirror equivalence once per session.
//!
//! ```text
//!  Seed     store ──(all document records + marker)──► log
//!  Migrate  log ──decode──► migrate_snapshot(marker) ──┬──► log   (diff only)
//!                                                      └──► store (load_snapshot)
//! ```
//!
//! Writes are diffed against the log's current contents, so running
//! reconciliation again against an unchanged log writes nothing.

use std::collections::BTreeSet;

use logos_store::{RecordScope, RecordStore, SerializedSchema};

use crate::error::{LogError, SyncError};
use crate::gate::{GateDecision, SchemaGate};
use crate::replicated::{LogTxn, ReplicatedLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Seeded,
    Migrated,
}

/// What one reconciliation changed in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mode: ReconcileMode,
    pub written: usize,
    pub deleted: usize,
    pub marker_updated: bool,
}

impl ReconcileReport {
    /// Whether the log was left untouched.
    pub fn is_noop(&self) -> bool {
        self.written == 0 && self.deleted == 0 && !self.marker_updated
    }
}

/// Gate, reconcile, then require the marker to match the local schema.
pub fn run_initial_sync(
    store: &RecordStore,
    log: &ReplicatedLog,
) -> Result<ReconcileReport, SyncError> {
    let decision = SchemaGate::evaluate_log(store.schema(), log)?;
    let report = reconcile(store, log, &decision)?;
    let marker = log.schema_marker()?;
    SchemaGate::check_live(store.schema(), marker.as_ref())?;
    log::info!(
        "Initial sync done ({:?}): {} written, {} deleted, marker updated: {}",
        report.mode,
        report.written,
        report.deleted,
        report.marker_updated
    );
    Ok(report)
}

/// Carry out a gate decision.
pub fn reconcile(
    store: &RecordStore,
    log: &ReplicatedLog,
    decision: &GateDecision,
) -> Result<ReconcileReport, SyncError> {
    match decision {
        GateDecision::Seed => seed(store, log),
        GateDecision::Migrate { pending } => {
            if !pending.is_empty() {
                log::info!("Migrating shared snapshot through {} migrations", pending.len());
            }
            migrate(store, log)
        }
    }
}

fn seed(store: &RecordStore, log: &ReplicatedLog) -> Result<ReconcileReport, SyncError> {
    let records = store.records_in_scope(RecordScope::Document);
    let marker = store.schema().serialize();
    if let Ok(Some(existing)) = log.schema_marker() {
        if store.schema().get_migrations_since(&existing).is_err() {
            log::warn!(
                "Seeding an empty log over a newer schema marker {:?}; replacing it with {:?}",
                existing.record_versions,
                marker.record_versions
            );
        }
    }
    let encoded = records
        .iter()
        .map(|r| Ok((r.id.to_string(), r.to_json()?)))
        .collect::<Result<Vec<_>, serde_json::Error>>()
        .map_err(|e| LogError::EncodeError(e.to_string()))?;

    let (written, marker_updated) = log.transact(|txn| {
        let written = write_changed(txn, encoded);
        let marker_updated = set_marker_if_changed(txn, &marker)?;
        Ok((written, marker_updated))
    })?;

    log::info!("Seeded replicated log with {written} records");
    Ok(ReconcileReport {
        mode: ReconcileMode::Seeded,
        written,
        deleted: 0,
        marker_updated,
    })
}

fn migrate(store: &RecordStore, log: &ReplicatedLog) -> Result<ReconcileReport, SyncError> {
    let marker = log.schema_marker()?.ok_or(SyncError::MissingSchemaMarker)?;
    let snapshot = log.snapshot();
    for key in &snapshot.malformed {
        log::warn!("Dropping malformed log entry {key}");
    }

    let migrated = store
        .schema()
        .migrate_snapshot(&marker, snapshot.records)?
        .into_values()
        .filter(|r| store.schema().scope_of(&r.type_name) == Some(RecordScope::Document))
        .collect::<Vec<_>>();
    // The log cannot be rolled back, so the store must accept the result first
    store
        .validate_all(&migrated)
        .map_err(|e| SyncError::MigrationFailed(e.to_string()))?;

    let encoded = migrated
        .iter()
        .map(|r| Ok((r.id.to_string(), r.to_json()?)))
        .collect::<Result<Vec<_>, serde_json::Error>>()
        .map_err(|e| LogError::EncodeError(e.to_string()))?;
    let keep: BTreeSet<&str> = encoded.iter().map(|(k, _)| k.as_str()).collect();
    let doomed: Vec<String> = snapshot
        .raw
        .keys()
        .chain(&snapshot.malformed)
        .filter(|k| !keep.contains(k.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let local_marker = store.schema().serialize();

    let (written, deleted, marker_updated) = log.transact(|txn| {
        let deleted = doomed.iter().filter(|key| txn.delete_key(key)).count();
        let written = write_changed(txn, encoded);
        let marker_updated = set_marker_if_changed(txn, &local_marker)?;
        Ok((written, deleted, marker_updated))
    })?;

    store.load_snapshot(migrated)?;
    Ok(ReconcileReport {
        mode: ReconcileMode::Migrated,
        written,
        deleted,
        marker_updated,
    })
}

fn write_changed(txn: &mut LogTxn<'_>, encoded: Vec<(String, String)>) -> usize {
    let mut written = 0;
    for (key, json) in encoded {
        if txn.get_raw(&key).as_deref() != Some(json.as_str()) {
            txn.set_raw(&key, json);
            written += 1;
        }
    }
    written
}

fn set_marker_if_changed(
    txn: &mut LogTxn<'_>,
    marker: &SerializedSchema,
) -> Result<bool, LogError> {
    let current = txn
        .schema_marker_raw()
        .and_then(|raw| SerializedSchema::from_json(&raw).ok());
    if current.as_ref() == Some(marker) {
        return Ok(false);
    }
    txn.set_schema_marker(marker)?;
    Ok(true)
}
