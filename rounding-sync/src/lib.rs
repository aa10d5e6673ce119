//! Offline-tolerant sync core for the clinical rounding list
//!
//! Provides:
//! - Remote list store adapter with retry on throttling
//! - Best-effort local cache (SQLite or in-memory)
//! - Sync engine switching between connected and local modes
//! - Three-pass rounding spreadsheet import
//! - Backfeed lookup of a patient's previous visit
//! - Role checks, billing masking and audit entries

pub mod access;
pub mod actor;
pub mod audit;
pub mod backfeed;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod import;
pub mod model;
pub mod schema;
pub mod store;

pub use actor::{SyncHandle, SyncSnapshot};
pub use audit::{AuditActionType, AuditEntry, AuditSink, TracingAuditSink};
pub use backfeed::BackfeedVisit;
pub use cache::{CacheCollection, LocalCache, MemoryCacheBackend, SqliteCacheBackend};
pub use config::RoundingConfig;
pub use engine::{ListenerId, SyncEngine, SyncEvent, SyncListener, SyncMode};
pub use error::{RoundingError, RoundingResult};
pub use export::{ExportOutcome, Exporter, GraphDriveTarget};
pub use import::{ImportBatch, ImportReport};
pub use model::{
    ComplianceMode, Credentials, Findings, GlobalSettings, OnCallShift, PatientVisit, Principal, ProcedureStatus,
    VisitKey,
};
pub use store::{GraphListBackend, ListStoreAdapter, MemoryListBackend, RemoteStore, RetryPolicy};
