//! scramjet core: staged synchronization of external documents into a canonical
//! Postgres-backed resource store.

pub mod bulk;
pub mod config;
pub mod context;
pub mod diff;
pub mod error;
pub mod filter;
pub mod models;
pub mod pipeline;
pub mod resources;
pub mod schema;
pub mod staging;
pub mod transactions;

#[cfg(test)]
mod test_support;

pub use bulk::{BulkStage, ChunkReport};
pub use config::{EngineConfig, PostgresConfig};
pub use context::StoreContext;
pub use diff::{DiffRefusal, difference, flag_deletes};
pub use error::{Error, Result};
pub use filter::{Comparator, Filter, FilterTarget, FilterValue, SubFilter};
pub use models::{
    Identifiable, Identifier, JsonObjectValidator, Packet, ResourceRecord, StagingRecord,
    Storeable, Stub, Validator, Validity,
};
pub use pipeline::{
    FullSync, IdSource, IngestReport, IntakePage, IntakePlan, IntakeSource, PurgeReport,
    ReconcileReport, SyncEngine, SyncReport, TransferReport,
};
pub use resources::{ResourceStore, UpsertOutcome, UpsertSummary, content_hash};
pub use staging::{StageSummary, StagingStore, ValidationReport};
pub use transactions::{RunRecord, TransactionLog};
