use bytes::Bytes;

use crate::error::StoreError;

pub mod disk;
pub mod object;

pub use disk::DiskStore;
pub use object::Id;

/// Content-addressable byte store keyed by [`Id`].
///
/// Entries are write-once: the coordinator only writes an id after seeing it
/// absent, under its single-flight guarantee.
pub trait Store: Send + Sync {
    /// True iff the entry is present and readable as a regular file; any
    /// error counts as absent.
    fn exists(&self, id: &Id) -> bool;
    fn read(&self, id: &Id) -> Result<Bytes, StoreError>;
    /// Durable on return: a following `exists`/`read` observes the entry.
    fn write(&self, id: &Id, data: &[u8]) -> Result<(), StoreError>;
}
