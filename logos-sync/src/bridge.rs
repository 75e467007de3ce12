//! Sync bridge: the bidirectional translator between the local store and
//! the replicated log.
//!
//! ```text
//!            ┌────────── user, document scope ──────────┐
//!            │                                          ▼
//!  ┌──────────────┐                           ┌──────────────────┐
//!  │ RecordStore  │                           │  ReplicatedLog   │
//!  └──────────────┘                           └──────────────────┘
//!            ▲                                          │
//!            └──── merge_remote_changes ◄── remote ─────┘
//!                                          (own origin dropped)
//! ```
//!
//! Echo suppression works on both edges: the store listener only sees
//! user-originated edits, so merged remote changes are never sent back; the
//! log observer drops transactions carrying this participant's origin, so
//! our own writes are never merged back in.

use logos_store::{DisposerList, ListenFilter, Record, RecordId, RecordScope, RecordStore};

use crate::error::{report_fatal, FatalSink, SyncError};
use crate::replicated::{LogAction, LogChange, LogOrigin, ReplicatedLog};

/// Outcome of merging one remote log transaction into the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub put: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Apply one remote log change to `store` as a single atomic merge.
///
/// Only document-scope records cross the log; session and presence state
/// stays local. Entries outside that scope, entries that cannot be decoded,
/// entries whose value vanished, and entries the store rejects are skipped
/// with a warning; the rest of the batch still applies.
pub fn apply_remote_change(store: &RecordStore, change: &LogChange) -> MergeReport {
    let mut report = MergeReport::default();
    let mut puts = Vec::new();
    let mut removals = Vec::new();
    let schema = store.schema();

    for key in &change.keys {
        let id = RecordId::from_raw(key.key.as_str());
        if schema.scope_of(id.type_name()) != Some(RecordScope::Document) {
            log::warn!("Skipping {}: not a document record", key.key);
            report.skipped += 1;
            continue;
        }
        match key.action {
            LogAction::Add | LogAction::Update => {
                let Some(json) = key.value.as_deref() else {
                    log::warn!("Skipping {}: value missing at fetch time", key.key);
                    report.skipped += 1;
                    continue;
                };
                match Record::from_json(json) {
                    Ok(record) if record.id.as_str() == key.key => puts.push(record),
                    Ok(record) => {
                        log::warn!("Skipping {}: entry carries id {}", key.key, record.id);
                        report.skipped += 1;
                    }
                    Err(e) => {
                        log::warn!("Skipping {}: {e}", key.key);
                        report.skipped += 1;
                    }
                }
            }
            LogAction::Delete => removals.push(id),
        }
    }

    store.merge_remote_changes(|s| {
        for record in puts {
            let id = record.id.clone();
            match s.put([record]) {
                Ok(()) => report.put += 1,
                Err(e) => {
                    log::warn!("Skipping {id}: {e}");
                    report.skipped += 1;
                }
            }
        }
        report.removed = removals.iter().filter(|id| s.contains(id)).count();
        s.remove(removals);
    });

    report
}

/// Live two-way mirror between one store and one log.
///
/// Dropping the bridge or calling [`dispose`](Self::dispose) releases both
/// subscriptions.
pub struct SyncBridge {
    disposers: DisposerList,
}

impl SyncBridge {
    pub fn activate(store: &RecordStore, log: &ReplicatedLog, fatal: FatalSink) -> Self {
        let mut disposers = DisposerList::new();

        // Local → remote
        {
            let log = log.clone();
            disposers.push(store.listen(
                move |change| match log.apply_change_set(&change.changes) {
                    Ok(writes) => log::trace!("Mirrored {writes} local changes"),
                    Err(e) => report_fatal(&fatal, SyncError::Log(e)),
                },
                ListenFilter::user_document(),
            ));
        }

        // Remote → local
        {
            let store = store.clone();
            disposers.push(log.on_change(move |change| {
                if change.origin == LogOrigin::Local {
                    return;
                }
                let report = apply_remote_change(&store, change);
                log::trace!("Merged remote transaction: {report:?}");
            }));
        }

        log::info!("Sync bridge active");
        Self { disposers }
    }

    /// Release both subscriptions. Idempotent.
    pub fn dispose(&mut self) {
        if !self.disposers.is_empty() {
            self.disposers.dispose_all();
            log::info!("Sync bridge disposed");
        }
    }

    pub fn is_active(&self) -> bool {
        !self.disposers.is_empty()
    }
}
