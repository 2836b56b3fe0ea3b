//! The layer registry.
//!
//! Layers are filesystem trees, optionally parented to another layer, whose
//! physical state is owned by the graph driver. This store keeps their
//! bookkeeping in `layers.json` and orchestrates the driver calls that
//! accompany record changes.
//!
//! Callers hold the store's lock (see [`Store`]) around every operation; the
//! coordinator takes care of that, and of the cross-store referential checks
//! that must pass before a layer may be deleted.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archive::Change;
use crate::driver::Driver;
use crate::error::{Result, StorageError};
use crate::lockfile::LockFile;
use crate::util;
use crate::Store;

/// A filesystem tree registered in the layer store.
///
/// `id` is either caller-chosen or randomly generated at create time, and
/// immutable afterwards, as is `parent`. `names` are optional user-defined
/// handles, unique across layers. `metadata` is an opaque string for the
/// caller's use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Unique identifier, 64 hex characters.
    pub id: String,

    /// User-defined names, unique across all layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// ID of the parent layer; empty for base layers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,

    /// Opaque caller-managed metadata.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

/// Bookkeeping for layers, persisted as `layers.json`, plus the driver that
/// owns their physical state.
pub struct LayerStore {
    lockfile: LockFile,
    dir: PathBuf,
    driver: Box<dyn Driver>,
    layers: Vec<Layer>,
    byid: HashMap<String, usize>,
    byname: HashMap<String, usize>,
    /// Memoized diff sizes, keyed by (layer, reference-or-empty).
    diff_sizes: HashMap<(String, String), u64>,
}

impl LayerStore {
    /// Open the layer store in `dir`, creating it if necessary, taking
    /// ownership of `driver`.
    pub fn new(dir: &Path, driver: Box<dyn Driver>) -> Result<Self> {
        fs::create_dir_all(dir).map_err(StorageError::Persist)?;
        let lockfile = LockFile::open(dir.join("layers.lock"))?;
        let mut store = Self {
            lockfile,
            dir: dir.to_path_buf(),
            driver,
            layers: Vec::new(),
            byid: HashMap::new(),
            byname: HashMap::new(),
            diff_sizes: HashMap::new(),
        };
        store.lock()?;
        let loaded = store.load();
        store.unlock();
        loaded?;
        Ok(store)
    }

    fn registry_path(&self) -> PathBuf {
        self.dir.join("layers.json")
    }

    fn reindex(&mut self) {
        self.byid.clear();
        self.byname.clear();
        for (n, layer) in self.layers.iter().enumerate() {
            self.byid.insert(layer.id.clone(), n);
            for name in &layer.names {
                self.byname.insert(name.clone(), n);
            }
        }
    }

    /// Resolve a name or id to an index into the layer vector.
    fn index_of(&self, id_or_name: &str) -> Option<usize> {
        self.byname
            .get(id_or_name)
            .or_else(|| self.byid.get(id_or_name))
            .copied()
    }

    fn invalidate_diff_sizes(&mut self, id: &str) {
        self.diff_sizes
            .retain(|(to, from), _| to != id && from != id);
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

    /// All registered layers.
    pub fn layers(&self) -> Vec<Layer> {
        self.layers.clone()
    }

    /// Create a layer, physically via the driver and then as a record.
    ///
    /// A missing `id` is generated. `parent`, if given, must resolve to an
    /// existing layer. On driver failure no record is written; on a failure
    /// to persist the record, the driver's work is undone.
    pub fn create(
        &mut self,
        id: Option<&str>,
        parent: Option<&str>,
        names: &[String],
        mount_label: &str,
        writeable: bool,
    ) -> Result<Layer> {
        let id = match id {
            Some(id) => {
                if self.byid.contains_key(id) {
                    return Err(StorageError::DuplicateId);
                }
                id.to_string()
            }
            None => util::generate_random_id(),
        };
        let parent_id = match parent.filter(|p| !p.is_empty()) {
            Some(p) => {
                let n = self.index_of(p).ok_or(StorageError::ParentUnknown)?;
                self.layers[n].id.clone()
            }
            None => String::new(),
        };
        self.check_names_free(names, None)?;

        let parent_ref = (!parent_id.is_empty()).then_some(parent_id.as_str());
        if writeable {
            self.driver.create_read_write(&id, parent_ref, mount_label)?;
        } else {
            self.driver.create(&id, parent_ref, mount_label)?;
        }

        let layer = Layer {
            id: id.clone(),
            names: names.to_vec(),
            parent: parent_id,
            metadata: String::new(),
        };
        self.layers.push(layer.clone());
        self.reindex();
        if let Err(err) = self.save() {
            self.layers.pop();
            self.reindex();
            if let Err(cleanup) = self.driver.remove(&id) {
                log::warn!("removing layer {id} after a failed save: {cleanup}");
            }
            return Err(err);
        }
        Ok(layer)
    }

    /// Look up a layer by id or name.
    pub fn get(&self, id_or_name: &str) -> Result<Layer> {
        self.index_of(id_or_name)
            .map(|n| self.layers[n].clone())
            .ok_or(StorageError::LayerUnknown)
    }

    /// Whether a layer with the given id or name exists.
    pub fn exists(&self, id_or_name: &str) -> bool {
        self.index_of(id_or_name).is_some()
    }

    /// Translate a name to an id.
    pub fn lookup(&self, name: &str) -> Result<String> {
        self.byname
            .get(name)
            .map(|&n| self.layers[n].id.clone())
            .ok_or(StorageError::LayerUnknown)
    }

    /// Replace a layer's metadata and persist.
    pub fn set_metadata(&mut self, id_or_name: &str, metadata: &str) -> Result<()> {
        let n = self.index_of(id_or_name).ok_or(StorageError::LayerUnknown)?;
        self.layers[n].metadata = metadata.to_string();
        let id = self.layers[n].id.clone();
        self.invalidate_diff_sizes(&id);
        self.save()
    }

    /// Replace a layer's names and persist.
    ///
    /// Fails without any mutation if one of the new names belongs to a
    /// different layer.
    pub fn set_names(&mut self, id_or_name: &str, names: &[String]) -> Result<()> {
        let n = self.index_of(id_or_name).ok_or(StorageError::LayerUnknown)?;
        self.check_names_free(names, Some(n))?;
        for name in &self.layers[n].names {
            self.byname.remove(name);
        }
        self.layers[n].names = names.to_vec();
        for name in names {
            self.byname.insert(name.clone(), n);
        }
        let id = self.layers[n].id.clone();
        self.invalidate_diff_sizes(&id);
        self.save()
    }

    /// Remove a layer's record and its physical state.
    ///
    /// Deleting an id that is not present is a success, so retries converge;
    /// callers that care use [`LayerStore::exists`] first. Referential
    /// checks against images and containers are the coordinator's job.
    pub fn delete(&mut self, id_or_name: &str) -> Result<()> {
        let Some(n) = self.index_of(id_or_name) else {
            return Ok(());
        };
        let id = self.layers[n].id.clone();
        self.driver.remove(&id)?;
        self.layers.remove(n);
        self.reindex();
        self.invalidate_diff_sizes(&id);
        self.save()
    }

    /// Delete every layer.
    ///
    /// Keeps going past individual failures and reports the first one after
    /// every record has been attempted.
    pub fn wipe(&mut self) -> Result<()> {
        let ids: Vec<String> = self.layers.iter().map(|l| l.id.clone()).collect();
        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.delete(&id) {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    log::warn!("wiping layer {id}: {err}");
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Activate a layer and return the path of its materialized contents.
    pub fn mount(&self, id_or_name: &str, mount_label: &str) -> Result<PathBuf> {
        let n = self.index_of(id_or_name).ok_or(StorageError::LayerUnknown)?;
        Ok(self.driver.get(&self.layers[n].id, mount_label)?)
    }

    /// Release one activation of a layer.
    pub fn unmount(&self, id_or_name: &str) -> Result<()> {
        let n = self.index_of(id_or_name).ok_or(StorageError::LayerUnknown)?;
        Ok(self.driver.put(&self.layers[n].id)?)
    }

    /// Resolve the `(layer, reference)` pair shared by the diff operations:
    /// an absent reference means the layer's own parent.
    fn diff_pair(&self, to: &str, from: Option<&str>) -> Result<(String, Option<String>)> {
        let n = self.index_of(to).ok_or(StorageError::LayerUnknown)?;
        let layer = &self.layers[n];
        let from_id = match from.filter(|f| !f.is_empty()) {
            Some(f) => {
                let m = self.index_of(f).ok_or(StorageError::LayerUnknown)?;
                Some(self.layers[m].id.clone())
            }
            None => (!layer.parent.is_empty()).then(|| layer.parent.clone()),
        };
        Ok((layer.id.clone(), from_id))
    }

    /// The changes that turn `from` (or the layer's parent) into `to`.
    pub fn changes(&self, to: &str, from: Option<&str>) -> Result<Vec<Change>> {
        let (to_id, from_id) = self.diff_pair(to, from)?;
        Ok(self.driver.changes(&to_id, from_id.as_deref())?)
    }

    /// A tar stream turning `from` (or the layer's parent) into `to`.
    pub fn diff(&self, to: &str, from: Option<&str>) -> Result<Box<dyn Read + Send>> {
        let (to_id, from_id) = self.diff_pair(to, from)?;
        Ok(self.driver.diff(&to_id, from_id.as_deref())?)
    }

    /// The size of the stream [`LayerStore::diff`] would produce.
    pub fn diff_size(&mut self, to: &str, from: Option<&str>) -> Result<u64> {
        let (to_id, from_id) = self.diff_pair(to, from)?;
        let key = (to_id.clone(), from_id.clone().unwrap_or_default());
        if let Some(&size) = self.diff_sizes.get(&key) {
            return Ok(size);
        }
        let size = self.driver.diff_size(&to_id, from_id.as_deref())?;
        self.diff_sizes.insert(key, size);
        Ok(size)
    }

    /// Apply a tar change stream on top of a layer.
    pub fn apply_diff(&mut self, to: &str, diff: &mut dyn Read) -> Result<u64> {
        let n = self.index_of(to).ok_or(StorageError::LayerUnknown)?;
        let (id, parent) = (self.layers[n].id.clone(), self.layers[n].parent.clone());
        let parent_ref = (!parent.is_empty()).then_some(parent.as_str());
        let size = self.driver.apply_diff(&id, parent_ref, diff)?;
        self.invalidate_diff_sizes(&id);
        // The record is unchanged but the contents are not; prod other
        // holders into reloading so their caches drop too.
        self.touch()?;
        Ok(size)
    }

    /// The driver's status report.
    pub fn status(&self) -> Vec<(String, String)> {
        self.driver.status()
    }

    /// Release the driver's transient resources.
    pub fn cleanup(&self) -> Result<()> {
        Ok(self.driver.cleanup()?)
    }
}

impl Store for LayerStore {
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
        self.layers = match fs::read(self.registry_path()) {
            Ok(data) if !data.is_empty() => {
                serde_json::from_slice(&data).map_err(StorageError::persist_json)?
            }
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::Persist(e)),
        };
        self.reindex();
        self.diff_sizes.clear();
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.layers).map_err(StorageError::persist_json)?;
        util::atomic_write_file(&self.registry_path(), &data, 0o600)
            .map_err(StorageError::Persist)?;
        self.touch()
    }
}
