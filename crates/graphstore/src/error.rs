//! Error types for the storage engine.
//!
//! Every fallible operation returns [`Result<T>`], an alias for
//! `Result<T, StorageError>`. The variants are sentinels: callers match on
//! the variant, outer layers turn it into a message and an exit code.

use std::io;

use crate::driver::DriverError;
use crate::lockfile::LockError;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error values surfaced at the storage boundary.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No layer with the given id or name.
    #[error("layer not known")]
    LayerUnknown,

    /// No image with the given id or name.
    #[error("image not known")]
    ImageUnknown,

    /// No container with the given id or name.
    #[error("container not known")]
    ContainerUnknown,

    /// A create supplied an id that is already registered.
    #[error("that ID is already in use")]
    DuplicateId,

    /// A create or rename supplied a name held by a different entity.
    #[error("that name is already in use")]
    DuplicateName,

    /// Names must be non-empty.
    #[error("names of layers, images and containers must not be empty")]
    InvalidName,

    /// A create referenced a parent, top layer, or backing layer that does
    /// not exist.
    #[error("parent of layer not known")]
    ParentUnknown,

    /// The layer is the top layer of at least one image.
    #[error("layer is in use by an image")]
    LayerUsedByImage,

    /// The layer is the read-write layer of at least one container.
    #[error("layer is in use by a container")]
    LayerUsedByContainer,

    /// The layer is recorded as the parent of at least one other layer.
    #[error("layer is in use as the parent of another layer")]
    LayerHasChildren,

    /// The image is referenced by at least one container.
    #[error("image is in use by a container")]
    ImageUsedByContainer,

    /// A read-write layer was requested on top of a layer that backs an
    /// image; read-write layers are container-owned.
    #[error("parent layer is the top layer of an image")]
    ParentIsImage,

    /// The graph driver reported a failure.
    #[error("graph driver: {0}")]
    Driver(#[from] DriverError),

    /// I/O failure while loading or saving a registry file.
    #[error("reading or writing store metadata: {0}")]
    Persist(#[source] io::Error),

    /// Failure operating on a store's lock file.
    #[error("store lock: {0}")]
    Lock(#[from] LockError),

    /// A multi-store operation failed and the compensating cleanup failed
    /// too, leaving state that only a reload can reconcile.
    #[error("{original}; additionally, rolling back failed: {cleanup}")]
    Rollback {
        /// The failure that triggered the rollback.
        original: Box<StorageError>,
        /// The failure of the compensating action itself.
        cleanup: Box<StorageError>,
    },
}

impl StorageError {
    pub(crate) fn persist_json(err: serde_json::Error) -> Self {
        StorageError::Persist(io::Error::other(err))
    }
}
