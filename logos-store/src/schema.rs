//! Record schema, versioning and forward migrations.
//!
//! Each record type carries an ordered list of migrations; the type's
//! current version is the number of migrations it has. A participant
//! advertises its versions through a [`SerializedSchema`] (the "schema
//! marker"), and data written under an older marker is brought forward with
//! [`StoreSchema::migrate_snapshot`].
//!
//! ```text
//!  marker { shape: 1 }         local schema { shape: 3 }
//!         │                            │
//!         └──── get_migrations_since ──┘
//!                      │
//!                      ▼
//!            [shape/2, shape/3]   (pending, applied in order)
//! ```
//!
//! There are no downgrades: a marker newer than the local schema is an
//! error, never a migration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::record::{Record, RecordId, RecordScope};

/// Layout version of [`SerializedSchema`] itself.
pub const SCHEMA_FORMAT_VERSION: u32 = 1;

/// Serialized description of the migration level a participant knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedSchema {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "recordVersions")]
    pub record_versions: BTreeMap<String, u32>,
}

impl SerializedSchema {
    /// Version recorded for `record_type`; absent types count as 0.
    pub fn version_of(&self, record_type: &str) -> u32 {
        self.record_versions.get(record_type).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Identifies a single migration step: "bring `record_type` to `version`".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationId {
    pub record_type: String,
    pub version: u32,
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.version)
    }
}

type MigrateFn = Arc<dyn Fn(&mut Record) -> Result<(), String> + Send + Sync>;

/// One forward migration of a record type.
#[derive(Clone)]
pub struct Migration {
    pub id: MigrationId,
    up: MigrateFn,
}

impl Migration {
    pub fn apply(&self, record: &mut Record) -> Result<(), String> {
        (self.up)(record)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration").field("id", &self.id).finish()
    }
}

/// A record type known to the store.
#[derive(Debug, Clone)]
pub struct RecordType {
    name: String,
    scope: RecordScope,
    migrations: Vec<Migration>,
}

impl RecordType {
    pub fn new(name: impl Into<String>, scope: RecordScope) -> Self {
        Self {
            name: name.into(),
            scope,
            migrations: Vec::new(),
        }
    }

    /// Append the next migration; it becomes version `version() + 1`.
    pub fn migration<F>(mut self, up: F) -> Self
    where
        F: Fn(&mut Record) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = MigrationId {
            record_type: self.name.clone(),
            version: self.migrations.len() as u32 + 1,
        };
        self.migrations.push(Migration { id, up: Arc::new(up) });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> RecordScope {
        self.scope
    }

    pub fn version(&self) -> u32 {
        self.migrations.len() as u32
    }

    fn migrations_after(&self, version: u32) -> impl Iterator<Item = &Migration> {
        self.migrations.iter().filter(move |m| m.id.version > version)
    }
}

/// The full set of record types a store accepts.
#[derive(Debug, Clone, Default)]
pub struct StoreSchema {
    types: BTreeMap<String, RecordType>,
}

impl StoreSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, record_type: RecordType) -> Self {
        self.types.insert(record_type.name.clone(), record_type);
        self
    }

    pub fn record_type(&self, name: &str) -> Option<&RecordType> {
        self.types.get(name)
    }

    pub fn scope_of(&self, type_name: &str) -> Option<RecordScope> {
        self.types.get(type_name).map(|t| t.scope)
    }

    pub fn record_types(&self) -> impl Iterator<Item = &RecordType> {
        self.types.values()
    }

    /// The marker this participant advertises.
    pub fn serialize(&self) -> SerializedSchema {
        SerializedSchema {
            schema_version: SCHEMA_FORMAT_VERSION,
            record_versions: self
                .types
                .values()
                .map(|t| (t.name.clone(), t.version()))
                .collect(),
        }
    }

    /// Local migrations newer than `marker`, in application order.
    ///
    /// Fails when the marker cannot be reached from this schema: newer
    /// format, unknown record types, or versions ahead of ours.
    pub fn get_migrations_since(
        &self,
        marker: &SerializedSchema,
    ) -> Result<Vec<MigrationId>, SchemaError> {
        if marker.schema_version > SCHEMA_FORMAT_VERSION {
            return Err(SchemaError::UnsupportedFormat {
                found: marker.schema_version,
                supported: SCHEMA_FORMAT_VERSION,
            });
        }

        for (type_name, &remote) in &marker.record_versions {
            let Some(local) = self.types.get(type_name) else {
                return Err(SchemaError::UnknownRecordType(type_name.clone()));
            };
            if remote > local.version() {
                return Err(SchemaError::NewerVersion {
                    record_type: type_name.clone(),
                    remote,
                    local: local.version(),
                });
            }
        }

        Ok(self
            .types
            .values()
            .flat_map(|t| t.migrations_after(marker.version_of(&t.name)))
            .map(|m| m.id.clone())
            .collect())
    }

    /// Bring a single record written under `marker` up to this schema.
    pub fn migrate_record(
        &self,
        marker: &SerializedSchema,
        mut record: Record,
    ) -> Result<Record, MigrationError> {
        let Some(record_type) = self.types.get(&record.type_name) else {
            return Err(MigrationError::UnknownRecordType(record.type_name));
        };
        for migration in record_type.migrations_after(marker.version_of(&record.type_name)) {
            migration
                .apply(&mut record)
                .map_err(|reason| MigrationError::Failed {
                    migration: migration.id.clone(),
                    record: record.id.clone(),
                    reason,
                })?;
        }
        Ok(record)
    }

    /// Migrate a whole snapshot written under `marker`.
    ///
    /// All-or-nothing: the first failing record fails the snapshot.
    pub fn migrate_snapshot(
        &self,
        marker: &SerializedSchema,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<BTreeMap<RecordId, Record>, MigrationError> {
        self.get_migrations_since(marker)?;

        let mut migrated = BTreeMap::new();
        for record in records {
            let record = self.migrate_record(marker, record)?;
            migrated.insert(record.id.clone(), record);
        }
        Ok(migrated)
    }
}

/// Marker/schema incompatibilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    UnsupportedFormat { found: u32, supported: u32 },
    UnknownRecordType(String),
    NewerVersion { record_type: String, remote: u32, local: u32 },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFormat { found, supported } => {
                write!(f, "Schema format {found} is newer than supported format {supported}")
            }
            Self::UnknownRecordType(t) => write!(f, "Unknown record type: {t}"),
            Self::NewerVersion { record_type, remote, local } => write!(
                f,
                "Record type {record_type} is at version {remote} remotely but {local} locally"
            ),
        }
    }
}

impl std::error::Error for SchemaError {}

/// Snapshot migration failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    Incompatible(SchemaError),
    UnknownRecordType(String),
    Failed {
        migration: MigrationId,
        record: RecordId,
        reason: String,
    },
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(e) => write!(f, "Incompatible schema: {e}"),
            Self::UnknownRecordType(t) => write!(f, "Cannot migrate unknown record type: {t}"),
            Self::Failed { migration, record, reason } => {
                write!(f, "Migration {migration} failed on {record}: {reason}")
            }
        }
    }
}

impl std::error::Error for MigrationError {}

impl From<SchemaError> for MigrationError {
    fn from(e: SchemaError) -> Self {
        MigrationError::Incompatible(e)
    }
}
