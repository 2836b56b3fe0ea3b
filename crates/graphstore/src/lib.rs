//! Local, layered container storage.
//!
//! This crate manages stacks of filesystem layers, the copy-on-write
//! drivers that materialize them on disk, and the metadata registries that
//! track layers, images, and containers. Clients hold a single [`Mall`]
//! rooted at a graph directory and go through it for everything: creating
//! read-only layers from tar streams, stacking them into images,
//! instantiating read-write containers, and computing or applying diffs
//! between layers.
//!
//! # On-disk layout
//!
//! ```text
//! <graph root>/
//! +-- layers/
//! |   +-- layers.json          # layer records
//! |   +-- layers.lock
//! +-- images/
//! |   +-- images.json          # image records
//! |   +-- images.lock
//! +-- containers/
//! |   +-- containers.json      # container records
//! |   +-- containers.lock
//! +-- <driver>/                # the driver's private tree
//! ```
//!
//! Each registry is an array of JSON records, rewritten atomically under an
//! advisory file lock; multiple processes may operate on one graph root
//! concurrently and observe each other's writes on their next operation.
//!
//! # Example
//!
//! ```no_run
//! use graphstore::{Mall, StorageConfig};
//!
//! let mall = Mall::open(&StorageConfig::new("/var/lib/graphstore"))?;
//! let base = mall.create_layer(None, None, &["base".into()], "", false)?;
//! let image = mall.create_image(None, &["img".into()], &base.id, "")?;
//! let container = mall.create_container(None, &["c1".into()], &image.id, "")?;
//! # Ok::<(), graphstore::StorageError>(())
//! ```

pub mod archive;
pub mod config;
pub mod containers;
pub mod driver;
pub mod error;
pub mod images;
pub mod layers;
pub mod lockfile;
pub mod mall;
pub mod util;

pub use archive::{Change, ChangeKind};
pub use config::StorageConfig;
pub use containers::{Container, ContainerStore};
pub use driver::{Driver, DriverKind};
pub use error::{Result, StorageError};
pub use images::{Image, ImageStore};
pub use layers::{Layer, LayerStore};
pub use mall::Mall;

/// The persistence lifecycle shared by the registries.
///
/// Holders follow the pattern: `lock()`; reload via `load()` if
/// `modified()`; mutate; `save()` (which also calls `touch()` so other
/// holders notice); `unlock()`. The [`Mall`] drives this for every
/// operation; the trait keeps the contract explicit and lets it compose the
/// three stores uniformly.
pub trait Store {
    /// Acquire the store's exclusive cross-process lock, blocking until it
    /// is granted.
    fn lock(&self) -> Result<()>;

    /// Release the cross-process lock.
    fn unlock(&self);

    /// Mark the store as changed for other holders.
    fn touch(&self) -> Result<()>;

    /// Whether another holder changed the store since this holder last
    /// looked.
    fn modified(&self) -> Result<bool>;

    /// Replace the in-memory state with what is on disk.
    fn load(&mut self) -> Result<()>;

    /// Atomically persist the in-memory state and mark the store changed.
    fn save(&self) -> Result<()>;
}
