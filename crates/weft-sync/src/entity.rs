//! Entity contracts implemented once per resource kind
//!
//! A [`StorageEntity`] is one desired record in the durable store; a
//! [`RuntimeEntity`] is the object materialized for it in the runtime. The two
//! represent the same logical job iff their IDs are equal within one kind.
//! [`Fingerprint`] equality of spec hashes is the only signal that a runtime
//! object reflects the latest desired spec.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use weft_common::{Error, Result};

/// Content fingerprint of a spec or status
///
/// SHA-256 over the canonical JSON form of a value. Object keys are sorted
/// before hashing, so field order in the source type does not matter.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint any serializable value
    ///
    /// Fails for values JSON cannot represent, such as maps with non-string keys.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        // Going through Value sorts object keys
        let canonical = serde_json::to_value(value)?;
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(Self(Sha256::digest(&bytes).into()))
    }

    /// Wrap a precomputed digest
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes are plenty to tell fingerprints apart in logs
        write!(f, "Fingerprint(")?;
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// One desired resource record held in storage
///
/// Entities are read-only snapshots: the worker lists fresh ones every tick
/// and never mutates them in place, so they can be handed between tasks.
#[async_trait]
pub trait StorageEntity: Send + Sync + 'static {
    /// ID, unique within one resource kind
    fn id(&self) -> &str;

    /// Fingerprint of the desired configuration
    fn spec_hash(&self) -> Result<Fingerprint>;

    /// Fingerprint of the last observed status
    fn status_hash(&self) -> Result<Fingerprint>;

    /// Soft-delete flag; once set it never reverts
    fn deletion_mark(&self) -> bool;

    /// True once the resource reached a terminal outcome
    fn finished(&self) -> bool;

    /// Materialize this record in the runtime
    async fn create_in_runtime(&self) -> Result<()>;

    /// Push this record's spec to its existing runtime object
    async fn update_in_runtime(&self) -> Result<()>;

    /// Delete this record's runtime object
    async fn delete_in_runtime(&self) -> Result<()>;

    /// Purge this record from storage
    async fn delete_in_storage(&self) -> Result<()>;
}

/// One materialized object in the runtime
#[async_trait]
pub trait RuntimeEntity: Send + Sync + 'static {
    /// ID, shared with the storage record it was created from
    fn id(&self) -> &str;

    /// Fingerprint of the spec this object was built from
    fn spec_hash(&self) -> Result<Fingerprint>;

    /// Fingerprint of the currently observed status
    fn status_hash(&self) -> Result<Fingerprint>;

    /// True while a deletion is already in progress
    fn is_deleting(&self) -> bool;

    /// Delete this object
    async fn delete(&self) -> Result<()>;

    /// Write the observed status back to storage
    ///
    /// May fail with [`Error::NotFound`] when the record is gone or
    /// [`Error::SpecWasTouched`] when its spec changed since this object was built.
    async fn report_status(&self) -> Result<()>;
}

/// Hash failures carry the entity ID so the caller can log and skip it
pub(crate) fn spec_hash_of(id: &str, hash: Result<Fingerprint>) -> Result<Fingerprint> {
    hash.map_err(|e| match e {
        Error::Hash { .. } => e,
        other => Error::hash(id, other.to_string()),
    })
}
