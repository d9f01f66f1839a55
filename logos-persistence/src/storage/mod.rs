//! Durable storage layer.
//!
//! - `rocks`: RocksDB-backed update log, registry and meta namespace
//! - `fragment`: LZ4 framing of stored update payloads

pub mod fragment;
pub mod rocks;

pub use rocks::{
    AppendOutcome, DocumentHandle, DocumentRecord, DocumentStore, MetaKey, StoreConfig,
    StoreError, UpdateEntry,
};
