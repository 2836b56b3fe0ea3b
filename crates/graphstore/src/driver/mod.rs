//! The graph driver contract.
//!
//! A graph driver owns the physical backing state of layers: it materializes
//! them on disk with whatever copy-on-write mechanism the backing filesystem
//! offers, activates them as mountable trees, and converts between trees and
//! tar change streams. The stores never touch layer contents directly; every
//! physical operation goes through a [`Driver`].
//!
//! Drivers are selected by name at initialization through [`DriverKind`] and
//! [`new_driver`]. Operations on distinct ids may run concurrently;
//! operations on one id are serialized by the calling store, which holds its
//! own lock for the duration.

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::archive::Change;

mod vfs;

pub use vfs::VfsDriver;

/// Error values reported by graph drivers.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A create collided with existing physical state.
    #[error("layer {0:?} already exists")]
    LayerExists(String),

    /// An operation referenced physical state that is not present.
    #[error("layer {0:?} does not exist")]
    LayerMissing(String),

    /// A release was requested for a layer that is not active.
    #[error("layer {0:?} is not mounted")]
    NotMounted(String),

    /// The requested driver name is not registered.
    #[error("unknown graph driver {0:?}")]
    UnknownDriver(String),

    /// An underlying filesystem or archive operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Physical layer management.
///
/// `parent` is `None` for base layers. `mount_label` is an opaque security
/// label (e.g. for mandatory access control) that drivers may apply when
/// activating a layer; drivers without label support ignore it.
pub trait Driver: Send {
    /// The name the driver was registered under.
    fn name(&self) -> &'static str;

    /// Materialize a new read-only layer whose initial contents equal the
    /// parent's, or are empty. Fails if `id` already exists.
    fn create(&self, id: &str, parent: Option<&str>, mount_label: &str) -> DriverResult<()>;

    /// Like [`Driver::create`], but the layer may be mutated afterwards.
    fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        mount_label: &str,
    ) -> DriverResult<()>;

    /// Release the physical state of a layer. Removing a layer that is
    /// already gone is a success.
    fn remove(&self, id: &str) -> DriverResult<()>;

    /// Activate a layer and return a path holding its materialized contents.
    /// Activations are reference-counted: every `get` needs a matching
    /// [`Driver::put`].
    fn get(&self, id: &str, mount_label: &str) -> DriverResult<PathBuf>;

    /// Release one reference obtained via [`Driver::get`].
    fn put(&self, id: &str) -> DriverResult<()>;

    /// Whether physical state for `id` is present.
    fn exists(&self, id: &str) -> bool;

    /// Introspection key/value pairs for status reporting.
    fn status(&self) -> Vec<(String, String)>;

    /// The changes that turn `parent` into `id`. `None` compares against an
    /// empty tree.
    fn changes(&self, id: &str, parent: Option<&str>) -> DriverResult<Vec<Change>>;

    /// A tar stream representing the changes from `parent` to `id`,
    /// consumed exactly once.
    fn diff(&self, id: &str, parent: Option<&str>) -> DriverResult<Box<dyn Read + Send>>;

    /// The size in bytes of the stream [`Driver::diff`] would produce.
    fn diff_size(&self, id: &str, parent: Option<&str>) -> DriverResult<u64>;

    /// Apply a tar change stream on top of `id`, which was created from
    /// `parent`. Returns the number of bytes consumed.
    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> DriverResult<u64>;

    /// Release transient resources (active mounts and the like) at shutdown.
    fn cleanup(&self) -> DriverResult<()>;
}

/// The registered driver implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Directory-copy reference driver; works on any filesystem.
    Vfs,
}

impl DriverKind {
    /// The name used for the driver's private directory under the graph
    /// root and in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Vfs => "vfs",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    fn from_str(s: &str) -> DriverResult<Self> {
        match s {
            "vfs" => Ok(DriverKind::Vfs),
            other => Err(DriverError::UnknownDriver(other.to_string())),
        }
    }
}

/// Instantiate the configured driver with its private tree rooted at `home`.
pub fn new_driver(
    kind: DriverKind,
    home: &Path,
    options: &[String],
) -> DriverResult<Box<dyn Driver>> {
    match kind {
        DriverKind::Vfs => Ok(Box::new(VfsDriver::new(home, options)?)),
    }
}
