//! # logos-store — Local record store for Logos documents
//!
//! The authoritative in-memory document state that the editing surface
//! mutates and the sync layer mirrors.
//!
//! ## Modules
//!
//! - [`record`] — `Record`, `RecordId`, `RecordScope`
//! - [`schema`] — record types, schema markers, forward migrations
//! - [`store`] — `RecordStore` with batched, origin-tagged change events
//! - [`dispose`] — RAII subscription handles
//!
//! ## Change flow
//!
//! ```text
//!  editor ──put/remove──► RecordStore ──ChangeSet{User}──► sync bridge
//!  sync   ──merge_remote_changes──► RecordStore ──ChangeSet{Remote}──► UI
//! ```

pub mod dispose;
pub mod record;
pub mod schema;
pub mod store;

pub use dispose::{Disposer, DisposerList};
pub use record::{Record, RecordId, RecordScope};
pub use schema::{
    Migration, MigrationError, MigrationId, RecordType, SchemaError, SerializedSchema,
    StoreSchema, SCHEMA_FORMAT_VERSION,
};
pub use store::{
    ChangeSet, ChangeSource, ListenFilter, RecordStore, StoreChange, StoreError,
};
