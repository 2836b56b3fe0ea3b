//! The vfs reference driver.
//!
//! vfs emulates copy-on-write with full directory copies, which makes it
//! slow and space-hungry but dependent on nothing beyond a POSIX
//! filesystem. Each layer is a plain directory under `<home>/dir/<id>`;
//! "mounting" a layer is just handing out that directory's path.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::archive::{self, Change};

use super::{Driver, DriverError, DriverResult};

/// Graph driver backed by plain directory copies.
#[derive(Debug)]
pub struct VfsDriver {
    home: PathBuf,
    /// Reference counts for layers activated via `get`.
    active: Mutex<HashMap<String, u64>>,
}

impl VfsDriver {
    /// Set up the driver's private tree under `home`.
    ///
    /// vfs has no tunables; any option is rejected.
    pub fn new(home: &Path, options: &[String]) -> DriverResult<Self> {
        if let Some(option) = options.first() {
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("vfs driver takes no options, got {option:?}"),
            )));
        }
        fs::create_dir_all(home.join("dir"))?;
        Ok(Self {
            home: home.to_path_buf(),
            active: Mutex::new(HashMap::new()),
        })
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.home.join("dir").join(id)
    }

    fn require(&self, id: &str) -> DriverResult<PathBuf> {
        let dir = self.layer_dir(id);
        if !dir.is_dir() {
            return Err(DriverError::LayerMissing(id.to_string()));
        }
        Ok(dir)
    }

    fn create_common(&self, id: &str, parent: Option<&str>) -> DriverResult<()> {
        let dir = self.layer_dir(id);
        if dir.exists() {
            return Err(DriverError::LayerExists(id.to_string()));
        }
        match parent {
            Some(parent) => {
                let src = self.require(parent)?;
                archive::copy_tree(&src, &dir)?;
            }
            None => fs::create_dir(&dir)?,
        }
        Ok(())
    }

    fn diff_bytes(&self, id: &str, parent: Option<&str>) -> DriverResult<Vec<u8>> {
        let layer = self.require(id)?;
        let parent_dir = parent.map(|p| self.require(p)).transpose()?;
        let changes = archive::changes(parent_dir.as_deref(), &layer)?;
        Ok(archive::export(&layer, &changes)?)
    }
}

impl Driver for VfsDriver {
    fn name(&self) -> &'static str {
        "vfs"
    }

    fn create(&self, id: &str, parent: Option<&str>, _mount_label: &str) -> DriverResult<()> {
        self.create_common(id, parent)
    }

    // vfs layers are always plain directories; there is no page sharing to
    // withhold from read-write layers.
    fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        _mount_label: &str,
    ) -> DriverResult<()> {
        self.create_common(id, parent)
    }

    fn remove(&self, id: &str) -> DriverResult<()> {
        self.active
            .lock()
            .expect("vfs reference counts poisoned")
            .remove(id);
        match fs::remove_dir_all(self.layer_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &str, _mount_label: &str) -> DriverResult<PathBuf> {
        let dir = self.require(id)?;
        let mut active = self.active.lock().expect("vfs reference counts poisoned");
        *active.entry(id.to_string()).or_insert(0) += 1;
        Ok(dir)
    }

    fn put(&self, id: &str) -> DriverResult<()> {
        let mut active = self.active.lock().expect("vfs reference counts poisoned");
        match active.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                active.remove(id);
                Ok(())
            }
            None => Err(DriverError::NotMounted(id.to_string())),
        }
    }

    fn exists(&self, id: &str) -> bool {
        self.layer_dir(id).is_dir()
    }

    fn status(&self) -> Vec<(String, String)> {
        vec![
            (
                "Backing Directory".to_string(),
                self.home.display().to_string(),
            ),
            ("Copy-On-Write".to_string(), "emulated".to_string()),
        ]
    }

    fn changes(&self, id: &str, parent: Option<&str>) -> DriverResult<Vec<Change>> {
        let layer = self.require(id)?;
        let parent_dir = parent.map(|p| self.require(p)).transpose()?;
        Ok(archive::changes(parent_dir.as_deref(), &layer)?)
    }

    fn diff(&self, id: &str, parent: Option<&str>) -> DriverResult<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.diff_bytes(id, parent)?)))
    }

    fn diff_size(&self, id: &str, parent: Option<&str>) -> DriverResult<u64> {
        Ok(self.diff_bytes(id, parent)?.len() as u64)
    }

    fn apply_diff(
        &self,
        id: &str,
        _parent: Option<&str>,
        diff: &mut dyn Read,
    ) -> DriverResult<u64> {
        let dir = self.require(id)?;
        Ok(archive::apply(&dir, diff)?)
    }

    fn cleanup(&self) -> DriverResult<()> {
        // Nothing is mounted, so there is nothing to undo; forget any
        // outstanding references.
        self.active
            .lock()
            .expect("vfs reference counts poisoned")
            .clear();
        Ok(())
    }
}
