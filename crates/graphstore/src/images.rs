//! The image registry.
//!
//! An image is a named, read-only reference to a top layer. The store keeps
//! its records in `images.json`; whether the referenced layer actually
//! exists is checked by the coordinator, which can see the layer store.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::lockfile::LockFile;
use crate::util;
use crate::Store;

/// A reference to a layer stack's top layer, with names and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Unique identifier, 64 hex characters.
    pub id: String,

    /// User-defined names, unique across all images.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// ID of the image's top layer.
    #[serde(rename = "layer")]
    pub top_layer: String,

    /// Opaque caller-managed metadata.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

/// Bookkeeping for images, persisted as `images.json`.
pub struct ImageStore {
    lockfile: LockFile,
    dir: PathBuf,
    images: Vec<Image>,
    byid: HashMap<String, usize>,
    byname: HashMap<String, usize>,
}

impl ImageStore {
    /// Open the image store in `dir`, creating it if necessary.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(StorageError::Persist)?;
        let lockfile = LockFile::open(dir.join("images.lock"))?;
        let mut store = Self {
            lockfile,
            dir: dir.to_path_buf(),
            images: Vec::new(),
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
        self.dir.join("images.json")
    }

    fn reindex(&mut self) {
        self.byid.clear();
        self.byname.clear();
        for (n, image) in self.images.iter().enumerate() {
            self.byid.insert(image.id.clone(), n);
            for name in &image.names {
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

    /// All registered images.
    pub fn images(&self) -> Vec<Image> {
        self.images.clone()
    }

    /// Record a new image referencing `top_layer`.
    ///
    /// The caller has already checked that the layer exists. A missing `id`
    /// is generated.
    pub fn create(
        &mut self,
        id: Option<&str>,
        names: &[String],
        top_layer: &str,
        metadata: &str,
    ) -> Result<Image> {
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

        let image = Image {
            id,
            names: names.to_vec(),
            top_layer: top_layer.to_string(),
            metadata: metadata.to_string(),
        };
        self.images.push(image.clone());
        self.reindex();
        if let Err(err) = self.save() {
            self.images.pop();
            self.reindex();
            return Err(err);
        }
        Ok(image)
    }

    /// Look up an image by id or name.
    pub fn get(&self, id_or_name: &str) -> Result<Image> {
        self.index_of(id_or_name)
            .map(|n| self.images[n].clone())
            .ok_or(StorageError::ImageUnknown)
    }

    /// Whether an image with the given id or name exists.
    pub fn exists(&self, id_or_name: &str) -> bool {
        self.index_of(id_or_name).is_some()
    }

    /// Translate a name to an id.
    pub fn lookup(&self, name: &str) -> Result<String> {
        self.byname
            .get(name)
            .map(|&n| self.images[n].id.clone())
            .ok_or(StorageError::ImageUnknown)
    }

    /// Replace an image's metadata and persist.
    pub fn set_metadata(&mut self, id_or_name: &str, metadata: &str) -> Result<()> {
        let n = self.index_of(id_or_name).ok_or(StorageError::ImageUnknown)?;
        self.images[n].metadata = metadata.to_string();
        self.save()
    }

    /// Replace an image's names and persist.
    ///
    /// Fails without any mutation if one of the new names belongs to a
    /// different image.
    pub fn set_names(&mut self, id_or_name: &str, names: &[String]) -> Result<()> {
        let n = self.index_of(id_or_name).ok_or(StorageError::ImageUnknown)?;
        self.check_names_free(names, Some(n))?;
        for name in &self.images[n].names {
            self.byname.remove(name);
        }
        self.images[n].names = names.to_vec();
        for name in names {
            self.byname.insert(name.clone(), n);
        }
        self.save()
    }

    /// Remove an image's record. Deleting an id that is not present is a
    /// success; referential checks against containers are the coordinator's
    /// job.
    pub fn delete(&mut self, id_or_name: &str) -> Result<()> {
        let Some(n) = self.index_of(id_or_name) else {
            return Ok(());
        };
        self.images.remove(n);
        self.reindex();
        self.save()
    }

    /// Delete every image.
    pub fn wipe(&mut self) -> Result<()> {
        let ids: Vec<String> = self.images.iter().map(|i| i.id.clone()).collect();
        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.delete(&id) {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    log::warn!("wiping image {id}: {err}");
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Store for ImageStore {
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
        self.images = match fs::read(self.registry_path()) {
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
        let data = serde_json::to_vec(&self.images).map_err(StorageError::persist_json)?;
        util::atomic_write_file(&self.registry_path(), &data, 0o600)
            .map_err(StorageError::Persist)?;
        self.touch()
    }
}
