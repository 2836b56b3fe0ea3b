//! The container registry.
//!
//! A container pairs an image with a private read-write layer parented to
//! the image's top layer. The store keeps its records in `containers.json`;
//! the coordinator checks that the referenced image and layer exist and that
//! the layer is not claimed by another container.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::lockfile::LockFile;
use crate::util;
use crate::Store;

/// A reference to a read-write layer and the image it was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Unique identifier, 64 hex characters.
    pub id: String,

    /// User-defined names, unique across all containers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// ID of the image the container was created from; empty for image-less
    /// containers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// ID of the container's read-write layer.
    pub layer: String,

    /// Opaque caller-managed metadata.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

/// Bookkeeping for containers, persisted as `containers.json`.
pub struct ContainerStore {
    lockfile: LockFile,
    dir: PathBuf,
    containers: Vec<Container>,
    byid: HashMap<String, usize>,
    byname: HashMap<String, usize>,
}

impl ContainerStore {
    /// Open the container store in `dir`, creating it if necessary.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(StorageError::Persist)?;
        let lockfile = LockFile::open(dir.join("containers.lock"))?;
        let mut store = Self {
            lockfile,
            dir: dir.to_path_buf(),
            containers: Vec::new(),
            byid: HashMap::new(),
            byname: HashMap::new(),
        };
        store.lock()?;
        let loaded = store.load();
        store.unlock();
        loaded?;
        Ok(store)
    }

    fn registry_path(&self) -> PathBuf {
        self.dir.join("containers.json")
    }

    fn reindex(&mut self) {
        self.byid.clear();
        self.byname.clear();
        for (n, container) in self.containers.iter().enumerate() {
            self.byid.insert(container.id.clone(), n);
            for name in &container.names {
                self.byname.insert(name.clone(), n);
            }
        }
    }

    fn index_of(&self, id_or_name: &str) -> Option<usize> {
        self.byname
            .get(id_or_name)
            .or_else(|| self.byid.get(id_or_name))
            .copied()
    }

    fn check_names_free(&self, names: &[String], owner: Option<usize>) -> Result<()> {
        for name in names {
            if name.is_empty() {
                return Err(StorageError::InvalidName);
            }
            if let Some(&holder) = self.byname.get(name) {
                if Some(holder) != owner {
                    return Err(StorageError::DuplicateName);
                }
            }
        }
        Ok(())
    }

    /// All registered containers.
    pub fn containers(&self) -> Vec<Container> {
        self.containers.clone()
    }

    /// Record a new container over the given image and read-write layer.
    ///
    /// The caller has already checked both references. A missing `id` is
    /// generated.
    pub fn create(
        &mut self,
        id: Option<&str>,
        names: &[String],
        image: &str,
        layer: &str,
        metadata: &str,
    ) -> Result<Container> {
        let id = match id {
            Some(id) => {
                if self.byid.contains_key(id) {
                    return Err(StorageError::DuplicateId);
                }
                id.to_string()
            }
            None => util::generate_random_id(),
        };
        self.check_names_free(names, None)?;

        let container = Container {
            id,
            names: names.to_vec(),
            image: image.to_string(),
            layer: layer.to_string(),
            metadata: metadata.to_string(),
        };
        self.containers.push(container.clone());
        self.reindex();
        if let Err(err) = self.save() {
            self.containers.pop();
            self.reindex();
            return Err(err);
        }
        Ok(container)
    }

    /// Look up a container by id or name.
    pub fn get(&self, id_or_name: &str) -> Result<Container> {
        self.index_of(id_or_name)
            .map(|n| self.containers[n].clone())
            .ok_or(StorageError::ContainerUnknown)
    }

    /// Whether a container with the given id or name exists.
    pub fn exists(&self, id_or_name: &str) -> bool {
        self.index_of(id_or_name).is_some()
    }

    /// Translate a name to an id.
    pub fn lookup(&self, name: &str) -> Result<String> {
        self.byname
            .get(name)
            .map(|&n| self.containers[n].id.clone())
            .ok_or(StorageError::ContainerUnknown)
    }

    /// Replace a container's metadata and persist.
    pub fn set_metadata(&mut self, id_or_name: &str, metadata: &str) -> Result<()> {
        let n = self
            .index_of(id_or_name)
            .ok_or(StorageError::ContainerUnknown)?;
        self.containers[n].metadata = metadata.to_string();
        self.save()
    }

    /// Replace a container's names and persist.
    ///
    /// Fails without any mutation if one of the new names belongs to a
    /// different container.
    pub fn set_names(&mut self, id_or_name: &str, names: &[String]) -> Result<()> {
        let n = self
            .index_of(id_or_name)
            .ok_or(StorageError::ContainerUnknown)?;
        self.check_names_free(names, Some(n))?;
        for name in &self.containers[n].names {
            self.byname.remove(name);
        }
        self.containers[n].names = names.to_vec();
        for name in names {
            self.byname.insert(name.clone(), n);
        }
        self.save()
    }

    /// Remove a container's record. Deleting an id that is not present is a
    /// success. The read-write layer is the coordinator's to clean up.
    pub fn delete(&mut self, id_or_name: &str) -> Result<()> {
        let Some(n) = self.index_of(id_or_name) else {
            return Ok(());
        };
        self.containers.remove(n);
        self.reindex();
        self.save()
    }

    /// Delete every container.
    pub fn wipe(&mut self) -> Result<()> {
        let ids: Vec<String> = self.containers.iter().map(|c| c.id.clone()).collect();
        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.delete(&id) {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    log::warn!("wiping container {id}: {err}");
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Store for ContainerStore {
    fn lock(&self) -> Result<()> {
        Ok(self.lockfile.lock()?)
    }

    fn unlock(&self) {
        self.lockfile.unlock()
    }

    fn touch(&self) -> Result<()> {
        Ok(self.lockfile.touch()?)
    }

    fn modified(&self) -> Result<bool> {
        Ok(self.lockfile.modified()?)
    }

    fn load(&mut self) -> Result<()> {
        self.containers = match fs::read(self.registry_path()) {
            Ok(data) if !data.is_empty() => {
                serde_json::from_slice(&data).map_err(StorageError::persist_json)?
            }
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::Persist(e)),
        };
        self.reindex();
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.containers).map_err(StorageError::persist_json)?;
        util::atomic_write_file(&self.registry_path(), &data, 0o600)
            .map_err(StorageError::Persist)?;
        self.touch()
    }
}
