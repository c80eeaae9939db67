//! Snapshot export and restore engine for the crewdesk roster/HR store.
//!
//! A snapshot is one versioned JSON envelope holding every known table. Restoring
//! re-injects it into a possibly different target store: reference entities are
//! reconciled against live rows by natural key, identifiers are relabeled across
//! the whole payload, and tables are upserted in dependency order.

pub mod catalog;
pub mod context;
pub mod envelope;
pub mod export;
pub mod normalize;
pub mod plan;
pub mod reconcile;
pub mod relabel;
pub mod restore;
pub mod sanitize;
pub mod store;

pub use catalog::{FieldRef, LegacyShape, TableDescriptor, TableName, TableRole};
pub use context::{LogEntry, LogLevel, RestoreContext};
pub use envelope::{
    backup_file_name, DecodedSnapshot, Envelope, SnapshotError, FORMAT_VERSION, PRODUCT_NAME,
};
pub use export::{export_all, ExportError};
pub use plan::{Actor, Phase};
pub use reconcile::{
    reconcile, Collision, CollisionKind, CollisionPolicy, IdSubstitution, ReconcileReport,
    RelabelScan,
};
pub use relabel::{relabel, relabel_in_place, IdMap};
pub use restore::{
    restore, RestoreError, RestoreOptions, RestoreReport, TableOutcome, TableRestore,
    DEFAULT_CHUNK_SIZE,
};
pub use sanitize::{is_strict_date, is_strict_uuid, sanitize, SanitizeOutcome};
pub use store::{MemoryStore, StoreError, StoreFailure, TableStore, UpsertCall};

/// One persisted entity: an untyped field map.
pub type Record = serde_json::Map<String, serde_json::Value>;
