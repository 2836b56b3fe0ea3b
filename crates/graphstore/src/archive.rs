//! Tar-based change sets between layer trees.
//!
//! A diff between a parent layer and a child layer is an uncompressed POSIX
//! tar stream. Additions and modifications carry the entry itself; a
//! deletion of `D/X` is encoded as an empty file named `D/.wh.X` (a
//! "whiteout"), and a directory containing `.wh..wh..opq` hides everything
//! the parent had under that directory.
//!
//! [`changes`] computes the change list between two trees, [`export`] turns
//! a change list into a tar stream, and [`apply`] is the inverse of
//! `export`: applying `export(changes(parent, child))` onto a fresh copy of
//! `parent` reproduces `child`.
//!
//! Scope: regular files, directories, and symlinks. Hard links, devices and
//! fifos do not occur in the trees the reference driver manages.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::util;

/// Filename prefix marking a deleted sibling in a tar diff.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Filename marking a directory whose parent contents are hidden entirely.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// What happened to a path between a parent tree and a child tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    /// The path exists in the child but not the parent.
    Add,
    /// The path exists in both but differs.
    Modify,
    /// The path exists in the parent but not the child.
    Delete,
}

/// A single entry in a change list.
///
/// Paths are relative to the layer root, with no leading or trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    /// The kind of change.
    pub kind: ChangeKind,
    /// The affected path.
    pub path: PathBuf,
}

impl Change {
    fn new(kind: ChangeKind, path: PathBuf) -> Self {
        Change { kind, path }
    }
}

/// Compute the changes that turn `parent` into `layer`.
///
/// `None` for `parent` compares against an empty tree, so every entry of
/// `layer` is reported as an [`ChangeKind::Add`]. The list is ordered with
/// parents before children; a deleted subtree is reported once, at its root.
pub fn changes(parent: Option<&Path>, layer: &Path) -> io::Result<Vec<Change>> {
    let mut out = Vec::new();
    diff_dirs(parent, layer, Path::new(""), &mut out)?;
    Ok(out)
}

fn sorted_entries(dir: &Path) -> io::Result<BTreeMap<OsString, Metadata>> {
    let mut entries = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        entries.insert(entry.file_name(), entry.metadata()?);
    }
    Ok(entries)
}

/// Whether two directory entries of the same name differ.
///
/// Directories compare by type, mode and ownership only; their contents are
/// walked separately, and their timestamps shift whenever children change.
fn entries_differ(
    parent_meta: &Metadata,
    parent_path: &Path,
    layer_meta: &Metadata,
    layer_path: &Path,
) -> io::Result<bool> {
    let pt = parent_meta.file_type();
    let lt = layer_meta.file_type();
    if (pt.is_dir(), pt.is_file(), pt.is_symlink()) != (lt.is_dir(), lt.is_file(), lt.is_symlink())
    {
        return Ok(true);
    }
    if parent_meta.permissions().mode() != layer_meta.permissions().mode()
        || parent_meta.uid() != layer_meta.uid()
        || parent_meta.gid() != layer_meta.gid()
    {
        return Ok(true);
    }
    if lt.is_symlink() {
        return Ok(fs::read_link(parent_path)? != fs::read_link(layer_path)?);
    }
    if lt.is_dir() {
        return Ok(false);
    }
    Ok(parent_meta.len() != layer_meta.len() || parent_meta.mtime() != layer_meta.mtime())
}

fn diff_dirs(
    parent: Option<&Path>,
    layer: &Path,
    rel: &Path,
    out: &mut Vec<Change>,
) -> io::Result<()> {
    let layer_entries = sorted_entries(layer)?;
    let parent_entries = match parent {
        Some(dir) => sorted_entries(dir)?,
        None => BTreeMap::new(),
    };

    let names: BTreeSet<OsString> = layer_entries
        .keys()
        .chain(parent_entries.keys())
        .cloned()
        .collect();
    for name in &names {
        let child_rel = rel.join(name);
        match (parent_entries.get(name), layer_entries.get(name)) {
            (None, Some(meta)) => {
                out.push(Change::new(ChangeKind::Add, child_rel.clone()));
                if meta.is_dir() {
                    add_all(&layer.join(name), &child_rel, out)?;
                }
            }
            (Some(_), None) => {
                out.push(Change::new(ChangeKind::Delete, child_rel));
            }
            (Some(parent_meta), Some(layer_meta)) => {
                let parent_path = parent.expect("entry implies parent dir").join(name);
                let layer_path = layer.join(name);
                if entries_differ(parent_meta, &parent_path, layer_meta, &layer_path)? {
                    out.push(Change::new(ChangeKind::Modify, child_rel.clone()));
                }
                if layer_meta.is_dir() {
                    if parent_meta.is_dir() {
                        diff_dirs(Some(&parent_path), &layer_path, &child_rel, out)?;
                    } else {
                        add_all(&layer_path, &child_rel, out)?;
                    }
                }
            }
            (None, None) => unreachable!(),
        }
    }
    Ok(())
}

fn add_all(dir: &Path, rel: &Path, out: &mut Vec<Change>) -> io::Result<()> {
    for (name, meta) in sorted_entries(dir)? {
        let child_rel = rel.join(&name);
        out.push(Change::new(ChangeKind::Add, child_rel.clone()));
        if meta.is_dir() {
            add_all(&dir.join(&name), &child_rel, out)?;
        }
    }
    Ok(())
}

/// Serialize a change list against `layer` into an uncompressed tar stream.
pub fn export(layer: &Path, changes: &[Change]) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    for change in changes {
        match change.kind {
            ChangeKind::Delete => append_whiteout(&mut builder, &change.path)?,
            ChangeKind::Add | ChangeKind::Modify => {
                append_entry(&mut builder, layer, &change.path)?
            }
        }
    }
    builder.into_inner()
}

fn whiteout_name(path: &Path) -> PathBuf {
    let mut name = OsString::from(WHITEOUT_PREFIX);
    name.push(path.file_name().unwrap_or_default());
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    }
}

fn append_whiteout(builder: &mut tar::Builder<Vec<u8>>, path: &Path) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o600);
    header.set_size(0);
    header.set_mtime(0);
    builder.append_data(&mut header, whiteout_name(path), io::empty())
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, root: &Path, rel: &Path) -> io::Result<()> {
    let full = root.join(rel);
    let meta = fs::symlink_metadata(&full)?;

    let mut header = tar::Header::new_gnu();
    header.set_mode(meta.permissions().mode() & 0o7777);
    header.set_uid(meta.uid() as u64);
    header.set_gid(meta.gid() as u64);
    header.set_mtime(meta.mtime().max(0) as u64);

    let file_type = meta.file_type();
    if file_type.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, rel, io::empty())
    } else if file_type.is_symlink() {
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, rel, fs::read_link(&full)?)
    } else if file_type.is_file() {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(meta.len());
        builder.append_data(&mut header, rel, File::open(&full)?)
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot archive special file {}", full.display()),
        ))
    }
}

struct CountingReader<'a> {
    inner: &'a mut dyn Read,
    count: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Apply a tar change stream onto the tree at `root`.
///
/// The stream is staged into a temporary sibling directory in full before
/// the tree is touched, so a stream that errors mid-way leaves `root`
/// exactly as it was. Returns the number of bytes consumed from the stream.
pub fn apply(root: &Path, reader: &mut dyn Read) -> io::Result<u64> {
    let staging_parent = root.parent().unwrap_or(root);
    let staging = staging_parent.join(format!(".applying-{}", &util::generate_random_id()[..12]));
    fs::create_dir(&staging)?;

    let result = stage_then_merge(root, &staging, reader);
    let _ = fs::remove_dir_all(&staging);
    result
}

fn stage_then_merge(root: &Path, staging: &Path, reader: &mut dyn Read) -> io::Result<u64> {
    let mut counting = CountingReader {
        inner: reader,
        count: 0,
    };

    {
        let mut archive = tar::Archive::new(&mut counting);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.unpack_in(staging)? {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "archive entry path escapes the layer root",
                ));
            }
        }
    }
    // Account for the end-of-archive blocks too.
    io::copy(&mut counting, &mut io::sink())?;

    merge_tree(staging, root)?;
    Ok(counting.count)
}

/// Merge a fully staged change tree into `target`.
///
/// Within each directory: an opaque marker clears the target first, then
/// whiteouts remove their victims, then the remaining entries are moved into
/// place, replacing any target entry whose type changed.
fn merge_tree(staging: &Path, target: &Path) -> io::Result<()> {
    let mut names: Vec<OsString> = fs::read_dir(staging)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<_>>()?;
    names.sort();

    if names.iter().any(|n| n == OPAQUE_WHITEOUT) {
        clear_dir(target)?;
    }

    for name in &names {
        if name == OPAQUE_WHITEOUT {
            continue;
        }
        if let Some(victim) = name.as_bytes().strip_prefix(WHITEOUT_PREFIX.as_bytes()) {
            remove_any(&target.join(OsStr::from_bytes(victim)))?;
        }
    }

    for name in &names {
        if name == OPAQUE_WHITEOUT || name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes()) {
            continue;
        }
        let staged = staging.join(name);
        let dest = target.join(name);
        let staged_meta = fs::symlink_metadata(&staged)?;
        if staged_meta.is_dir() {
            match fs::symlink_metadata(&dest) {
                Ok(dest_meta) if dest_meta.is_dir() => {}
                Ok(_) => {
                    fs::remove_file(&dest)?;
                    fs::create_dir(&dest)?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&dest)?,
                Err(e) => return Err(e),
            }
            fs::set_permissions(&dest, staged_meta.permissions())?;
            merge_tree(&staged, &dest)?;
        } else {
            remove_any(&dest)?;
            // The staging directory is a sibling of the layer root, so this
            // rename never crosses a filesystem.
            fs::rename(&staged, &dest)?;
        }
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        remove_any(&entry?.path())?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recursively copy the tree at `src` to the new directory `dst`, preserving
/// modes and timestamps. Used by drivers that emulate copy-on-write with
/// full copies.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let src_meta = fs::symlink_metadata(src)?;
    fs::create_dir(dst)?;
    fs::set_permissions(dst, src_meta.permissions())?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if meta.is_dir() {
            copy_tree(&from, &to)?;
        } else if meta.file_type().is_symlink() {
            symlink(fs::read_link(&from)?, &to)?;
        } else {
            fs::copy(&from, &to)?;
            util::copy_file_times(&meta, &to)?;
        }
    }
    // After the children, so their creation does not bump it again.
    util::copy_file_times(&src_meta, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use similar_asserts::assert_eq;

    use super::*;

    fn write_file(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn change_list(changes: &[Change]) -> Vec<(ChangeKind, &str)> {
        changes
            .iter()
            .map(|c| (c.kind, c.path.to_str().unwrap()))
            .collect()
    }

    #[test]
    fn test_changes_against_empty_parent() {
        let layer = tempfile::tempdir().unwrap();
        write_file(layer.path(), "etc/hosts", b"localhost\n");
        write_file(layer.path(), "a", b"a");

        let changes = changes(None, layer.path()).unwrap();
        assert_eq!(
            change_list(&changes),
            vec![
                (ChangeKind::Add, "a"),
                (ChangeKind::Add, "etc"),
                (ChangeKind::Add, "etc/hosts"),
            ]
        );
    }

    #[test]
    fn test_changes_between_identical_trees_is_empty() {
        let parent = tempfile::tempdir().unwrap();
        write_file(parent.path(), "etc/hosts", b"localhost\n");
        let layer = tempfile::tempdir().unwrap();
        archive_copy_for_test(parent.path(), layer.path());

        assert!(changes(Some(parent.path()), layer.path())
            .unwrap()
            .is_empty());
    }

    // Copy via copy_tree into a fresh subdirectory, then move contents up,
    // because copy_tree wants to create its destination.
    fn archive_copy_for_test(src: &Path, dst: &Path) {
        let tmp = dst.join(".copy");
        copy_tree(src, &tmp).unwrap();
        for entry in fs::read_dir(&tmp).unwrap() {
            let entry = entry.unwrap();
            fs::rename(entry.path(), dst.join(entry.file_name())).unwrap();
        }
        fs::remove_dir(&tmp).unwrap();
    }

    #[test]
    fn test_changes_detects_all_kinds() {
        let parent = tempfile::tempdir().unwrap();
        write_file(parent.path(), "kept", b"same");
        write_file(parent.path(), "changed", b"old");
        write_file(parent.path(), "removed", b"bye");

        let layer = tempfile::tempdir().unwrap();
        archive_copy_for_test(parent.path(), layer.path());
        write_file(layer.path(), "changed", b"new and longer");
        write_file(layer.path(), "added", b"hi");
        fs::remove_file(layer.path().join("removed")).unwrap();

        let changes = changes(Some(parent.path()), layer.path()).unwrap();
        assert_eq!(
            change_list(&changes),
            vec![
                (ChangeKind::Add, "added"),
                (ChangeKind::Modify, "changed"),
                (ChangeKind::Delete, "removed"),
            ]
        );
    }

    #[test]
    fn test_deleted_subtree_reported_once() {
        let parent = tempfile::tempdir().unwrap();
        write_file(parent.path(), "doomed/inner/file", b"x");
        let layer = tempfile::tempdir().unwrap();

        let changes = changes(Some(parent.path()), layer.path()).unwrap();
        assert_eq!(change_list(&changes), vec![(ChangeKind::Delete, "doomed")]);
    }

    #[test]
    fn test_export_emits_whiteout_for_delete() {
        let layer = tempfile::tempdir().unwrap();
        let tar_bytes = export(
            layer.path(),
            &[Change::new(ChangeKind::Delete, PathBuf::from("etc/hosts"))],
        )
        .unwrap();

        let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
        let entries: Vec<PathBuf> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().into_owned())
            .collect();
        assert_eq!(entries, vec![PathBuf::from("etc/.wh.hosts")]);
    }

    #[test]
    fn test_apply_roundtrip_reproduces_layer() {
        let parent = tempfile::tempdir().unwrap();
        write_file(parent.path(), "etc/hosts", b"localhost\n");
        write_file(parent.path(), "etc/motd", b"hello\n");
        write_file(parent.path(), "bin/sh", b"#!/bin/true\n");

        let layer = tempfile::tempdir().unwrap();
        archive_copy_for_test(parent.path(), layer.path());
        write_file(layer.path(), "etc/hosts", b"localhost me\n");
        fs::remove_file(layer.path().join("etc/motd")).unwrap();
        write_file(layer.path(), "srv/data", b"fresh\n");
        symlink("hosts", layer.path().join("etc/hosts.link")).unwrap();

        let list = changes(Some(parent.path()), layer.path()).unwrap();
        let tar_bytes = export(layer.path(), &list).unwrap();

        let rebuilt = tempfile::tempdir().unwrap();
        let target = rebuilt.path().join("layer");
        copy_tree(parent.path(), &target).unwrap();
        let applied = apply(&target, &mut Cursor::new(&tar_bytes)).unwrap();
        assert_eq!(applied, tar_bytes.len() as u64);

        assert!(changes(Some(&target), layer.path()).unwrap().is_empty());
        assert!(changes(Some(layer.path()), &target).unwrap().is_empty());
    }

    #[test]
    fn test_apply_opaque_directory_clears_contents() {
        let root_dir = tempfile::tempdir().unwrap();
        let target = root_dir.path().join("layer");
        fs::create_dir(&target).unwrap();
        write_file(&target, "cfg/old", b"old");

        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o600);
            header.set_size(0);
            header.set_mtime(0);
            builder
                .append_data(&mut header, "cfg/.wh..wh..opq", io::empty())
                .unwrap();
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(3);
            header.set_mtime(0);
            builder
                .append_data(&mut header, "cfg/new", &b"new"[..])
                .unwrap();
            builder.finish().unwrap();
        }

        apply(&target, &mut Cursor::new(&tar_bytes)).unwrap();
        assert!(!target.join("cfg/old").exists());
        assert_eq!(fs::read(target.join("cfg/new")).unwrap(), b"new");
    }

    #[test]
    fn test_apply_truncated_stream_leaves_tree_untouched() {
        let root_dir = tempfile::tempdir().unwrap();
        let target = root_dir.path().join("layer");
        fs::create_dir(&target).unwrap();
        write_file(&target, "keep", b"keep");

        let layer = tempfile::tempdir().unwrap();
        write_file(layer.path(), "incoming", &vec![b'x'; 1000]);
        let list = changes(None, layer.path()).unwrap();
        let tar_bytes = export(layer.path(), &list).unwrap();

        // Cut the stream inside the file data.
        let truncated = &tar_bytes[..800];
        assert!(apply(&target, &mut Cursor::new(truncated)).is_err());

        assert!(!target.join("incoming").exists());
        assert_eq!(fs::read(target.join("keep")).unwrap(), b"keep");
        // No staging directory survives the failure.
        let leftovers: Vec<_> = fs::read_dir(root_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![OsString::from("layer")]);
    }

    #[test]
    fn test_type_change_file_to_directory() {
        let parent = tempfile::tempdir().unwrap();
        write_file(parent.path(), "thing", b"flat");

        let layer = tempfile::tempdir().unwrap();
        write_file(layer.path(), "thing/nested", b"deep");

        let list = changes(Some(parent.path()), layer.path()).unwrap();
        assert_eq!(
            change_list(&list),
            vec![
                (ChangeKind::Modify, "thing"),
                (ChangeKind::Add, "thing/nested"),
            ]
        );

        let rebuilt = tempfile::tempdir().unwrap();
        let target = rebuilt.path().join("layer");
        copy_tree(parent.path(), &target).unwrap();
        let tar_bytes = export(layer.path(), &list).unwrap();
        apply(&target, &mut Cursor::new(&tar_bytes)).unwrap();
        assert_eq!(fs::read(target.join("thing/nested")).unwrap(), b"deep");
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        /// Relative paths up to three components deep.
        fn rel_path() -> impl Strategy<Value = String> {
            proptest::string::string_regex("[a-z]{1,6}(/[a-z]{1,6}){0,2}").expect("valid regex")
        }

        fn tree() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
            prop::collection::btree_map(rel_path(), prop::collection::vec(any::<u8>(), 0..64), 0..8)
                .prop_filter("no file is another file's directory", |files| {
                    files.keys().all(|a| {
                        files
                            .keys()
                            .all(|b| a == b || !b.starts_with(&format!("{a}/")))
                    })
                })
        }

        fn build_tree(root: &Path, files: &BTreeMap<String, Vec<u8>>) {
            for (rel, contents) in files {
                write_file(root, rel, contents);
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_diff_apply_roundtrip(parent_files in tree(), layer_files in tree()) {
                let parent = tempfile::tempdir().unwrap();
                build_tree(parent.path(), &parent_files);
                let layer = tempfile::tempdir().unwrap();
                build_tree(layer.path(), &layer_files);

                let list = changes(Some(parent.path()), layer.path()).unwrap();
                let tar_bytes = export(layer.path(), &list).unwrap();

                let rebuilt = tempfile::tempdir().unwrap();
                let target = rebuilt.path().join("layer");
                copy_tree(parent.path(), &target).unwrap();
                let applied = apply(&target, &mut Cursor::new(&tar_bytes)).unwrap();

                prop_assert_eq!(applied, tar_bytes.len() as u64);
                prop_assert!(changes(Some(&target), layer.path()).unwrap().is_empty());
                prop_assert!(changes(Some(layer.path()), &target).unwrap().is_empty());
            }

            #[test]
            fn prop_changes_empty_iff_identical(files in tree()) {
                let parent = tempfile::tempdir().unwrap();
                build_tree(parent.path(), &files);
                let rebuilt = tempfile::tempdir().unwrap();
                let copy = rebuilt.path().join("copy");
                copy_tree(parent.path(), &copy).unwrap();

                prop_assert!(changes(Some(parent.path()), &copy).unwrap().is_empty());
            }
        }
    }
}
