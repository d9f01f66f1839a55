//! # logos-persistence: Durable local persistence for Logos documents
//!
//! Keeps a yrs document's update log in RocksDB so edits survive restarts,
//! and collapses the log once it grows past a threshold.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   local edits    ┌─────────────────────┐
//! │ Yrs Doc      │ ───────────────► │ PersistenceProvider │
//! │ (session A)  │ ◄─────────────── │ (debounce, compact) │
//! └──────────────┘   load / fetch   └──────────┬──────────┘
//!                                              │ append / replace_prefix
//!                                              ▼
//! ┌──────────────┐                  ┌─────────────────────┐
//! │ Provider B   │ ───────────────► │ DocumentStore       │
//! │ (session B)  │   read_since     │ updates │ meta      │
//! └──────────────┘                  └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: RocksDB update log, registry and meta namespace
//! - [`engine`]: yrs apply / encode / merge / observe glue
//! - [`policy`]: Compaction threshold
//! - [`cursor`]: Per-session sync watermark
//! - [`provider`]: Load, debounced flush, compaction and lifecycle

pub mod cursor;
pub mod engine;
pub mod error;
pub mod policy;
pub mod provider;
pub mod storage;

// Re-exports for convenience
pub use cursor::SyncCursor;
pub use error::{PersistenceError, Result};
pub use policy::{CompactionPlan, CompactionPolicy, PREFERRED_TRIM_SIZE};
pub use provider::{
    clear_document, fetch_updates, PersistenceProvider, Phase, ProviderEvent, ProviderOptions,
};
pub use storage::{
    AppendOutcome, DocumentHandle, DocumentRecord, DocumentStore, MetaKey, StoreConfig,
    StoreError, UpdateEntry,
};
