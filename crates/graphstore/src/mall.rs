//! The coordinator that clients hold.
//!
//! A [`Mall`] owns one layer store (which owns the graph driver), one image
//! store, and one container store, all rooted under a configured graph
//! directory. It is the consistency boundary: the referential checks before
//! deletes and the rollback of partial multi-store mutations happen here,
//! and nowhere else.
//!
//! # Locking
//!
//! Stores are locked in a fixed order (layers, then images, then
//! containers) and released in reverse; an operation only takes the subset
//! it needs, in that order. For each store the sequence is: in-process mutex, then the
//! cross-process file lock, then a reload if another process touched the
//! registry. Cross-process visibility follows from that reload: whatever a
//! writer persisted before unlocking is observed by the next locker.

use std::fs;
use std::io::Read;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::archive::Change;
use crate::config::StorageConfig;
use crate::containers::{Container, ContainerStore};
use crate::driver::{new_driver, DriverKind};
use crate::error::{Result, StorageError};
use crate::images::{Image, ImageStore};
use crate::layers::{Layer, LayerStore};
use crate::Store;

const POISONED: &str = "store mutex poisoned";

/// Holds a store's file lock, refreshed from disk, until dropped.
struct StoreLock<'a, S: Store>(&'a mut S);

impl<'a, S: Store> StoreLock<'a, S> {
    fn acquire(store: &'a mut S) -> Result<Self> {
        store.lock()?;
        let modified = match store.modified() {
            Ok(modified) => modified,
            Err(err) => {
                store.unlock();
                return Err(err);
            }
        };
        if modified {
            if let Err(err) = store.load() {
                store.unlock();
                return Err(err);
            }
        }
        Ok(StoreLock(store))
    }
}

impl<S: Store> Drop for StoreLock<'_, S> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

impl<S: Store> Deref for StoreLock<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.0
    }
}

impl<S: Store> DerefMut for StoreLock<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.0
    }
}

/// The top-level storage coordinator.
///
/// A `Mall` may be shared freely between threads, and any number of
/// instances, in this process or others, may operate on the same graph
/// root concurrently.
pub struct Mall {
    graph_root: PathBuf,
    driver_name: String,
    layers: Mutex<LayerStore>,
    images: Mutex<ImageStore>,
    containers: Mutex<ContainerStore>,
}

impl Mall {
    /// Open (creating on first use) the storage under `config.root`.
    pub fn open(config: &StorageConfig) -> Result<Mall> {
        fs::create_dir_all(&config.root).map_err(StorageError::Persist)?;
        let kind: DriverKind = config.driver.parse()?;
        let driver = new_driver(
            kind,
            &config.root.join(kind.as_str()),
            &config.driver_options,
        )?;
        let layers = LayerStore::new(&config.root.join("layers"), driver)?;
        let images = ImageStore::new(&config.root.join("images"))?;
        let containers = ContainerStore::new(&config.root.join("containers"))?;
        Ok(Mall {
            graph_root: config.root.clone(),
            driver_name: kind.as_str().to_string(),
            layers: Mutex::new(layers),
            images: Mutex::new(images),
            containers: Mutex::new(containers),
        })
    }

    /// The configured graph root.
    pub fn graph_root(&self) -> &Path {
        &self.graph_root
    }

    /// The name of the graph driver in use.
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    // ========== Layers ==========

    /// Create a layer on top of `parent` (none for a base layer).
    ///
    /// Read-write layers are container-owned: requesting `writeable` with a
    /// parent that is some image's top layer fails with
    /// [`StorageError::ParentIsImage`].
    pub fn create_layer(
        &self,
        id: Option<&str>,
        parent: Option<&str>,
        names: &[String],
        mount_label: &str,
        writeable: bool,
    ) -> Result<Layer> {
        let mut lguard = self.layers.lock().expect(POISONED);
        if writeable {
            let mut iguard = self.images.lock().expect(POISONED);
            let mut layers = StoreLock::acquire(&mut *lguard)?;
            let images = StoreLock::acquire(&mut *iguard)?;
            if let Some(parent) = parent.filter(|p| !p.is_empty()) {
                let parent_layer = layers.get(parent).map_err(|_| StorageError::ParentUnknown)?;
                if images.images().iter().any(|i| i.top_layer == parent_layer.id) {
                    return Err(StorageError::ParentIsImage);
                }
            }
            layers.create(id, parent, names, mount_label, true)
        } else {
            let mut layers = StoreLock::acquire(&mut *lguard)?;
            layers.create(id, parent, names, mount_label, false)
        }
    }

    /// Delete a layer that nothing references.
    pub fn delete_layer(&self, id: &str) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut iguard = self.images.lock().expect(POISONED);
        let mut cguard = self.containers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        let images = StoreLock::acquire(&mut *iguard)?;
        let containers = StoreLock::acquire(&mut *cguard)?;

        let Ok(layer) = layers.get(id) else {
            // Unknown ids delete successfully, as in the store itself.
            return Ok(());
        };
        if images.images().iter().any(|i| i.top_layer == layer.id) {
            return Err(StorageError::LayerUsedByImage);
        }
        if containers.containers().iter().any(|c| c.layer == layer.id) {
            return Err(StorageError::LayerUsedByContainer);
        }
        if layers.layers().iter().any(|l| l.parent == layer.id) {
            return Err(StorageError::LayerHasChildren);
        }
        layers.delete(&layer.id)
    }

    /// Look up a layer by id or name.
    pub fn layer(&self, id: &str) -> Result<Layer> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        layers.get(id)
    }

    /// Whether a layer with the given id or name exists.
    pub fn layer_exists(&self, id: &str) -> Result<bool> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        Ok(layers.exists(id))
    }

    /// Translate a layer name to an id.
    pub fn lookup_layer(&self, name: &str) -> Result<String> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        layers.lookup(name)
    }

    /// All layers.
    pub fn layers(&self) -> Result<Vec<Layer>> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        Ok(layers.layers())
    }

    /// Replace a layer's metadata.
    pub fn set_layer_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        layers.set_metadata(id, metadata)
    }

    /// Replace a layer's names.
    pub fn set_layer_names(&self, id: &str, names: &[String]) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        layers.set_names(id, names)
    }

    /// Delete every layer, ignoring cross-store references.
    pub fn wipe_layers(&self) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        layers.wipe()
    }

    // ========== Images ==========

    /// Create an image whose top layer is `top_layer`.
    pub fn create_image(
        &self,
        id: Option<&str>,
        names: &[String],
        top_layer: &str,
        metadata: &str,
    ) -> Result<Image> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut iguard = self.images.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        let mut images = StoreLock::acquire(&mut *iguard)?;

        let top = layers
            .get(top_layer)
            .map_err(|_| StorageError::ParentUnknown)?;
        images.create(id, names, &top.id, metadata)
    }

    /// Delete an image, and with `with_containers`, every container built
    /// from it along with their read-write layers.
    pub fn delete_image(&self, id: &str, with_containers: bool) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut iguard = self.images.lock().expect(POISONED);
        let mut cguard = self.containers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        let mut images = StoreLock::acquire(&mut *iguard)?;
        let mut containers = StoreLock::acquire(&mut *cguard)?;

        let Ok(image) = images.get(id) else {
            return Ok(());
        };
        let dependents: Vec<Container> = containers
            .containers()
            .into_iter()
            .filter(|c| c.image == image.id)
            .collect();
        if !dependents.is_empty() && !with_containers {
            return Err(StorageError::ImageUsedByContainer);
        }
        for container in dependents {
            containers.delete(&container.id)?;
            layers.delete(&container.layer)?;
        }
        images.delete(&image.id)
    }

    /// Look up an image by id or name.
    pub fn image(&self, id: &str) -> Result<Image> {
        let mut iguard = self.images.lock().expect(POISONED);
        let images = StoreLock::acquire(&mut *iguard)?;
        images.get(id)
    }

    /// Whether an image with the given id or name exists.
    pub fn image_exists(&self, id: &str) -> Result<bool> {
        let mut iguard = self.images.lock().expect(POISONED);
        let images = StoreLock::acquire(&mut *iguard)?;
        Ok(images.exists(id))
    }

    /// Translate an image name to an id.
    pub fn lookup_image(&self, name: &str) -> Result<String> {
        let mut iguard = self.images.lock().expect(POISONED);
        let images = StoreLock::acquire(&mut *iguard)?;
        images.lookup(name)
    }

    /// All images.
    pub fn images(&self) -> Result<Vec<Image>> {
        let mut iguard = self.images.lock().expect(POISONED);
        let images = StoreLock::acquire(&mut *iguard)?;
        Ok(images.images())
    }

    /// Replace an image's metadata.
    pub fn set_image_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        let mut iguard = self.images.lock().expect(POISONED);
        let mut images = StoreLock::acquire(&mut *iguard)?;
        images.set_metadata(id, metadata)
    }

    /// Replace an image's names.
    pub fn set_image_names(&self, id: &str, names: &[String]) -> Result<()> {
        let mut iguard = self.images.lock().expect(POISONED);
        let mut images = StoreLock::acquire(&mut *iguard)?;
        images.set_names(id, names)
    }

    /// Delete every image, ignoring containers that reference them.
    pub fn wipe_images(&self) -> Result<()> {
        let mut iguard = self.images.lock().expect(POISONED);
        let mut images = StoreLock::acquire(&mut *iguard)?;
        images.wipe()
    }

    // ========== Containers ==========

    /// Create a container from `image` (empty for an image-less container).
    ///
    /// A fresh read-write layer is created on top of the image's top layer;
    /// if recording the container then fails, the layer is deleted again and
    /// the original error propagates.
    pub fn create_container(
        &self,
        id: Option<&str>,
        names: &[String],
        image: &str,
        metadata: &str,
    ) -> Result<Container> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut iguard = self.images.lock().expect(POISONED);
        let mut cguard = self.containers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        let images = StoreLock::acquire(&mut *iguard)?;
        let mut containers = StoreLock::acquire(&mut *cguard)?;

        let (image_id, parent) = if image.is_empty() {
            (String::new(), None)
        } else {
            let image = images.get(image)?;
            if !layers.exists(&image.top_layer) {
                return Err(StorageError::ParentUnknown);
            }
            (image.id, Some(image.top_layer))
        };

        let rw_layer = layers.create(None, parent.as_deref(), &[], "", true)?;
        match containers.create(id, names, &image_id, &rw_layer.id, metadata) {
            Ok(container) => Ok(container),
            Err(original) => match layers.delete(&rw_layer.id) {
                Ok(()) => Err(original),
                Err(cleanup) => {
                    log::error!(
                        "creating container failed ({original}); deleting its read-write \
                         layer {} failed too ({cleanup}), leaving it orphaned",
                        rw_layer.id
                    );
                    Err(StorageError::Rollback {
                        original: Box::new(original),
                        cleanup: Box::new(cleanup),
                    })
                }
            },
        }
    }

    /// Delete a container and its read-write layer.
    pub fn delete_container(&self, id: &str) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut cguard = self.containers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        let mut containers = StoreLock::acquire(&mut *cguard)?;

        let Ok(container) = containers.get(id) else {
            return Ok(());
        };
        containers.delete(&container.id)?;
        // By invariant nothing else references the read-write layer.
        layers.delete(&container.layer)
    }

    /// Look up a container by id or name.
    pub fn container(&self, id: &str) -> Result<Container> {
        let mut cguard = self.containers.lock().expect(POISONED);
        let containers = StoreLock::acquire(&mut *cguard)?;
        containers.get(id)
    }

    /// Whether a container with the given id or name exists.
    pub fn container_exists(&self, id: &str) -> Result<bool> {
        let mut cguard = self.containers.lock().expect(POISONED);
        let containers = StoreLock::acquire(&mut *cguard)?;
        Ok(containers.exists(id))
    }

    /// Translate a container name to an id.
    pub fn lookup_container(&self, name: &str) -> Result<String> {
        let mut cguard = self.containers.lock().expect(POISONED);
        let containers = StoreLock::acquire(&mut *cguard)?;
        containers.lookup(name)
    }

    /// All containers.
    pub fn containers(&self) -> Result<Vec<Container>> {
        let mut cguard = self.containers.lock().expect(POISONED);
        let containers = StoreLock::acquire(&mut *cguard)?;
        Ok(containers.containers())
    }

    /// Replace a container's metadata.
    pub fn set_container_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        let mut cguard = self.containers.lock().expect(POISONED);
        let mut containers = StoreLock::acquire(&mut *cguard)?;
        containers.set_metadata(id, metadata)
    }

    /// Replace a container's names.
    pub fn set_container_names(&self, id: &str, names: &[String]) -> Result<()> {
        let mut cguard = self.containers.lock().expect(POISONED);
        let mut containers = StoreLock::acquire(&mut *cguard)?;
        containers.set_names(id, names)
    }

    /// Delete every container record, leaving their layers behind.
    pub fn wipe_containers(&self) -> Result<()> {
        let mut cguard = self.containers.lock().expect(POISONED);
        let mut containers = StoreLock::acquire(&mut *cguard)?;
        containers.wipe()
    }

    // ========== Diffs and mounts ==========

    /// The changes that turn `from` into `to`. An empty `from` means the
    /// layer's own parent.
    pub fn changes(&self, to: &str, from: &str) -> Result<Vec<Change>> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        layers.changes(to, (!from.is_empty()).then_some(from))
    }

    /// A tar stream turning `from` into `to`. The stream is materialized
    /// before the layer lock is released and may be consumed at leisure.
    pub fn diff(&self, to: &str, from: &str) -> Result<Box<dyn Read + Send>> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        layers.diff(to, (!from.is_empty()).then_some(from))
    }

    /// The size of the stream [`Mall::diff`] would produce.
    pub fn diff_size(&self, to: &str, from: &str) -> Result<u64> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        layers.diff_size(to, (!from.is_empty()).then_some(from))
    }

    /// Apply a tar change stream on top of the layer `to`.
    pub fn apply_diff(&self, to: &str, diff: &mut dyn Read) -> Result<u64> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        layers.apply_diff(to, diff)
    }

    /// Activate a layer and return the path of its materialized contents.
    /// Activations are reference-counted; pair with [`Mall::unmount`].
    pub fn mount(&self, id: &str, mount_label: &str) -> Result<PathBuf> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        layers.mount(id, mount_label)
    }

    /// Release one activation of a layer.
    pub fn unmount(&self, id: &str) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        layers.unmount(id)
    }

    // ========== Maintenance ==========

    /// Introspection key/value pairs: the graph root, the driver, and the
    /// driver's own report.
    pub fn status(&self) -> Result<Vec<(String, String)>> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        let mut status = vec![
            (
                "Graph Root".to_string(),
                self.graph_root.display().to_string(),
            ),
            ("Graph Driver".to_string(), self.driver_name.clone()),
        ];
        status.extend(layers.status());
        Ok(status)
    }

    /// Delete everything: containers, then images, then layers.
    ///
    /// Later stores are still attempted when an earlier one fails; the
    /// first error is reported.
    pub fn wipe(&self) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let mut iguard = self.images.lock().expect(POISONED);
        let mut cguard = self.containers.lock().expect(POISONED);
        let mut layers = StoreLock::acquire(&mut *lguard)?;
        let mut images = StoreLock::acquire(&mut *iguard)?;
        let mut containers = StoreLock::acquire(&mut *cguard)?;

        let mut first_err = None;
        for result in [containers.wipe(), images.wipe(), layers.wipe()] {
            if let Err(err) = result {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    log::warn!("wiping storage: {err}");
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release the driver's transient resources before shutdown.
    pub fn shutdown(&self) -> Result<()> {
        let mut lguard = self.layers.lock().expect(POISONED);
        let layers = StoreLock::acquire(&mut *lguard)?;
        layers.cleanup()
    }
}
