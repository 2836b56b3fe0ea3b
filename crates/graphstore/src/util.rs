//! Small filesystem and identifier helpers shared by the stores.

use std::fs::{self, Metadata, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;

use rand::rngs::OsRng;
use rand::TryRngCore;
use rustix::fs::{utimensat, AtFlags, Timespec, Timestamps, CWD};

/// Number of characters in a hex-encoded entity ID.
pub const ID_LENGTH: usize = 64;

/// Write `data` to `path`, atomically replacing any previous contents.
///
/// The payload lands in a `.tmp` sibling first, is synced, and is then
/// renamed over the target, so a failed save leaves the previous file
/// intact. `mode` applies when the temporary file is created.
pub fn atomic_write_file(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let mut name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
        .to_os_string();
    name.push(".tmp");
    let tmp = path.with_file_name(name);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}

/// Generate a random 256-bit identifier, hex-encoded to 64 characters.
///
/// Encodings consisting solely of decimal digits are re-rolled so an ID can
/// never be confused with a number by a front end.
pub fn generate_random_id() -> String {
    loop {
        let mut raw = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut raw)
            .expect("reading from the OS random source failed");
        let id = hex::encode(raw);
        if !id.bytes().all(|b| b.is_ascii_digit()) {
            return id;
        }
    }
}

/// Copy access and modification times from `meta` onto `path`.
///
/// The target is not followed if it is a symlink.
pub(crate) fn copy_file_times(meta: &Metadata, path: &Path) -> io::Result<()> {
    let times = Timestamps {
        last_access: Timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        last_modification: Timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    };
    utimensat(CWD, path, &times, AtFlags::SYMLINK_NOFOLLOW)?;
    Ok(())
}
