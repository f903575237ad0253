//! Durable stores backing the persistent state machine.
//!
//! Two capabilities, both injectable:
//! - `KvStore`: small-value map (progress keys, lock, pointers)
//! - `BlobStore`: named JSON documents (the digest accumulator)
//!
//! No in-process state is authoritative across a wake-up; everything the
//! engine needs to resume lives behind these traits.

pub mod accumulator;
pub mod blob;
pub mod kv;

pub use accumulator::{Accumulator, AccumulatorFile, ACCUMULATOR_FILE};
pub use blob::FileBlobStore;
pub use kv::SqliteKv;

use crate::error::StoreError;

/// Durable string map. Absent keys are legal everywhere; callers parse
/// defaults explicitly.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Write several keys atomically (a chunk boundary persists as a unit).
    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError>;
}

/// Opaque handle to a stored blob, valid until the blob is trashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle(pub String);

/// Durable named documents with atomic replace semantics: a torn write must
/// leave the previous content readable.
pub trait BlobStore: Send + Sync {
    /// Read the named blob, creating it with `init` if missing.
    fn read_or_init(&self, name: &str, init: &str) -> Result<(String, BlobHandle), StoreError>;
    fn write(&self, handle: &BlobHandle, content: &str) -> Result<(), StoreError>;
    fn trash(&self, name: &str) -> Result<(), StoreError>;
}
