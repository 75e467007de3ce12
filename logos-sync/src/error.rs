//! Session-level error taxonomy.
//!
//! Everything in [`SyncError`] is fatal for the current session: the
//! controller surfaces a blocking "reload required" notice and tears down
//! the replicated connection. Transport disconnects are not errors; they
//! only flip the connection status to offline.

use logos_store::{MigrationError, SchemaError, StoreError};
use tokio::sync::mpsc;

/// Replicated log failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    EncodeError(String),
    DecodeError(String),
    UpdateError(String),
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EncodeError(e) => write!(f, "Encode error: {e}"),
            Self::DecodeError(e) => write!(f, "Decode error: {e}"),
            Self::UpdateError(e) => write!(f, "Update error: {e}"),
        }
    }
}

impl std::error::Error for LogError {}

/// Fatal synchronization errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The log holds records but no schema marker.
    MissingSchemaMarker,
    /// This client cannot work with the shared schema (stale client).
    IncompatibleSchema(String),
    /// The shared snapshot could not be migrated to the local schema.
    MigrationFailed(String),
    Log(LogError),
    Store(StoreError),
}

impl SyncError {
    /// Text for the blocking notice shown to the user.
    pub fn user_notice(&self) -> &'static str {
        match self {
            Self::IncompatibleSchema(_) | Self::MigrationFailed(_) => {
                "This document was changed by a newer version of the app. Please reload the page."
            }
            Self::MissingSchemaMarker => {
                "This document is missing its schema information. Please reload the page."
            }
            Self::Log(_) | Self::Store(_) => {
                "Synchronization stopped because of an internal error. Please reload the page."
            }
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSchemaMarker => write!(f, "Shared schema marker is missing"),
            Self::IncompatibleSchema(e) => write!(f, "Incompatible schema: {e}"),
            Self::MigrationFailed(e) => write!(f, "Snapshot migration failed: {e}"),
            Self::Log(e) => write!(f, "Replicated log error: {e}"),
            Self::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<LogError> for SyncError {
    fn from(e: LogError) -> Self {
        SyncError::Log(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<SchemaError> for SyncError {
    fn from(e: SchemaError) -> Self {
        SyncError::IncompatibleSchema(e.to_string())
    }
}

impl From<MigrationError> for SyncError {
    fn from(e: MigrationError) -> Self {
        match e {
            MigrationError::Incompatible(inner) => SyncError::IncompatibleSchema(inner.to_string()),
            other => SyncError::MigrationFailed(other.to_string()),
        }
    }
}

/// Channel on which callbacks report fatal errors to the controller.
pub type FatalSink = mpsc::UnboundedSender<SyncError>;

/// Log and forward a fatal error. A closed sink means the session is
/// already gone.
pub(crate) fn report_fatal(sink: &FatalSink, error: SyncError) {
    log::error!("{error}");
    let _ = sink.send(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_store::{MigrationId, RecordId};

    #[test]
    fn test_schema_error_maps_to_incompatible() {
        let err: SyncError = SchemaError::UnknownRecordType("arrow".into()).into();
        assert!(matches!(err, SyncError::IncompatibleSchema(_)));
    }

    #[test]
    fn test_migration_error_mapping() {
        let incompatible: SyncError =
            MigrationError::Incompatible(SchemaError::UnknownRecordType("x".into())).into();
        assert!(matches!(incompatible, SyncError::IncompatibleSchema(_)));

        let failed: SyncError = MigrationError::Failed {
            migration: MigrationId { record_type: "shape".into(), version: 2 },
            record: RecordId::new("shape", "a"),
            reason: "bad".into(),
        }
        .into();
        assert!(matches!(failed, SyncError::MigrationFailed(_)));
        assert!(failed.to_string().contains("shape/2"));
    }

    #[test]
    fn test_user_notice_mentions_reload() {
        for err in [
            SyncError::MissingSchemaMarker,
            SyncError::IncompatibleSchema("x".into()),
            SyncError::MigrationFailed("x".into()),
            SyncError::Log(LogError::DecodeError("x".into())),
        ] {
            assert!(err.user_notice().contains("reload"));
        }
    }

    #[test]
    fn test_report_fatal_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        report_fatal(&tx, SyncError::MissingSchemaMarker);
        assert_eq!(rx.try_recv().unwrap(), SyncError::MissingSchemaMarker);
    }

    #[test]
    fn test_report_fatal_closed_sink_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        report_fatal(&tx, SyncError::MissingSchemaMarker);
    }
}
