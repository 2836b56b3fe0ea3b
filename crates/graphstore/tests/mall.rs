//! End-to-end scenarios driving a Mall against a scratch graph root.

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use similar_asserts::assert_eq;

use graphstore::{ChangeKind, Mall, StorageConfig, StorageError};

fn open_mall(root: &Path) -> Mall {
    Mall::open(&StorageConfig::new(root)).unwrap()
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// A tar archive containing a single regular file.
fn one_file_archive(path: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(1234567890);
    header.set_size(contents.len() as u64);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, path, contents).unwrap();
    builder.into_inner().unwrap()
}

#[test]
fn test_base_layer_has_hex_id_and_empty_diff() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    let base = mall
        .create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    assert_eq!(base.id.len(), 64);
    assert!(base.id.bytes().all(|b| b.is_ascii_hexdigit()));
    assert!(base.parent.is_empty());
    assert_eq!(mall.lookup_layer("base").unwrap(), base.id);

    assert!(mall.changes("base", "").unwrap().is_empty());
}

#[test]
fn test_applied_file_shows_up_in_changes_and_diff() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_layer(None, Some("base"), &names(&["v1"]), "", false)
        .unwrap();

    let archive = one_file_archive("a", b"contents of a\n");
    let applied = mall.apply_diff("v1", &mut Cursor::new(&archive)).unwrap();
    assert_eq!(applied, archive.len() as u64);

    let changes = mall.changes("v1", "base").unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::Add);
    assert_eq!(changes[0].path, Path::new("a"));
    // An empty reference compares against the parent, which is base.
    assert_eq!(mall.changes("v1", "").unwrap(), changes);

    let mut stream = mall.diff("v1", "base").unwrap();
    let mut diff = Vec::new();
    stream.read_to_end(&mut diff).unwrap();
    assert_eq!(mall.diff_size("v1", "base").unwrap(), diff.len() as u64);
}

#[test]
fn test_layer_backing_an_image_cannot_be_deleted() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    let v1 = mall
        .create_layer(None, Some("base"), &names(&["v1"]), "", false)
        .unwrap();
    let image = mall
        .create_image(None, &names(&["img"]), "v1", "")
        .unwrap();
    assert_eq!(image.top_layer, v1.id);

    let container = mall
        .create_container(None, &names(&["c1"]), "img", "")
        .unwrap();
    let rw_layer = mall.layer(&container.layer).unwrap();
    assert_eq!(rw_layer.parent, v1.id);

    let layers_before = mall.layers().unwrap();
    let err = mall.delete_layer("v1").unwrap_err();
    assert!(matches!(err, StorageError::LayerUsedByImage));
    assert_eq!(mall.layers().unwrap(), layers_before);
    assert_eq!(mall.images().unwrap().len(), 1);
    assert_eq!(mall.containers().unwrap().len(), 1);

    // The read-write layer is pinned by its container.
    let err = mall.delete_layer(&container.layer).unwrap_err();
    assert!(matches!(err, StorageError::LayerUsedByContainer));

    // An image with dependent containers is likewise pinned.
    let err = mall.delete_image("img", false).unwrap_err();
    assert!(matches!(err, StorageError::ImageUsedByContainer));
}

#[test]
fn test_delete_container_removes_its_layer() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_image(None, &names(&["img"]), "base", "")
        .unwrap();
    let container = mall
        .create_container(None, &names(&["c1"]), "img", "")
        .unwrap();

    mall.delete_container("c1").unwrap();
    assert!(!mall.container_exists("c1").unwrap());
    assert!(!mall.layer_exists(&container.layer).unwrap());
    assert!(mall.image_exists("img").unwrap());
    // Deleting again still succeeds.
    mall.delete_container("c1").unwrap();
}

#[test]
fn test_second_instance_observes_new_layer() {
    let root = tempfile::tempdir().unwrap();
    let writer = open_mall(root.path());
    let reader = open_mall(root.path());

    assert!(reader.layers().unwrap().is_empty());
    let layer = writer
        .create_layer(None, None, &names(&["x"]), "", false)
        .unwrap();
    drop(writer);

    let seen = reader.layers().unwrap();
    assert_eq!(seen, vec![layer]);
    assert_eq!(reader.lookup_layer("x").unwrap(), seen[0].id);
}

#[test]
fn test_driver_failure_leaves_no_container_record() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_image(None, &names(&["img"]), "base", "")
        .unwrap();
    let layers_before = mall.layers().unwrap();

    // Knock the driver's tree out from under it so the read-write layer
    // cannot be materialized.
    fs::remove_dir_all(root.path().join("vfs/dir")).unwrap();
    fs::write(root.path().join("vfs/dir"), b"").unwrap();

    let err = mall
        .create_container(None, &names(&["c1"]), "img", "")
        .unwrap_err();
    assert!(matches!(err, StorageError::Driver(_)));
    assert!(mall.containers().unwrap().is_empty());
    assert_eq!(mall.layers().unwrap(), layers_before);
}

#[test]
fn test_failed_container_record_rolls_back_its_layer() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_image(None, &names(&["img"]), "base", "")
        .unwrap();
    mall.create_container(None, &names(&["c1"]), "img", "")
        .unwrap();
    let layers_before = mall.layers().unwrap();

    // The duplicate name is only detected after the fresh read-write layer
    // exists; the rollback must delete it again.
    let err = mall
        .create_container(None, &names(&["c1"]), "img", "")
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateName));
    assert_eq!(mall.layers().unwrap(), layers_before);
    assert_eq!(mall.containers().unwrap().len(), 1);
}

#[test]
fn test_reload_reproduces_all_listings() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_layer(None, Some("base"), &names(&["v1"]), "", false)
        .unwrap();
    mall.create_image(None, &names(&["img"]), "v1", "meta")
        .unwrap();
    mall.create_container(None, &names(&["c1"]), "img", "")
        .unwrap();
    mall.set_image_metadata("img", "released").unwrap();

    let reopened = open_mall(root.path());
    assert_eq!(reopened.layers().unwrap(), mall.layers().unwrap());
    assert_eq!(reopened.images().unwrap(), mall.images().unwrap());
    assert_eq!(reopened.containers().unwrap(), mall.containers().unwrap());
}

#[test]
fn test_create_image_requires_existing_top_layer() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    let err = mall
        .create_image(None, &names(&["img"]), "missing", "")
        .unwrap_err();
    assert!(matches!(err, StorageError::ParentUnknown));
    assert!(mall.images().unwrap().is_empty());
}

#[test]
fn test_duplicate_layer_id_rejected_without_disturbance() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    let base = mall
        .create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    let err = mall
        .create_layer(Some(&base.id), None, &[], "", false)
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateId));
    assert_eq!(mall.layers().unwrap(), vec![base]);
}

#[test]
fn test_writable_layer_over_image_top_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_image(None, &names(&["img"]), "base", "")
        .unwrap();

    let err = mall
        .create_layer(None, Some("base"), &[], "", true)
        .unwrap_err();
    assert!(matches!(err, StorageError::ParentIsImage));
    // A read-only layer over the same parent is fine.
    mall.create_layer(None, Some("base"), &names(&["ro"]), "", false)
        .unwrap();
}

#[test]
fn test_parent_layer_cannot_be_deleted_under_its_children() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_layer(None, Some("base"), &names(&["v1"]), "", false)
        .unwrap();

    let err = mall.delete_layer("base").unwrap_err();
    assert!(matches!(err, StorageError::LayerHasChildren));

    mall.delete_layer("v1").unwrap();
    mall.delete_layer("base").unwrap();
    assert!(mall.layers().unwrap().is_empty());
}

#[test]
fn test_mount_exposes_layer_contents() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    let archive = one_file_archive("etc/hosts", b"localhost\n");
    mall.apply_diff("base", &mut Cursor::new(&archive)).unwrap();

    let mount = mall.mount("base", "").unwrap();
    assert_eq!(fs::read(mount.join("etc/hosts")).unwrap(), b"localhost\n");
    mall.unmount("base").unwrap();
    assert!(matches!(
        mall.unmount("base").unwrap_err(),
        StorageError::Driver(_)
    ));
}

#[test]
fn test_delete_image_cascades_when_asked() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_image(None, &names(&["img"]), "base", "")
        .unwrap();
    let c1 = mall
        .create_container(None, &names(&["c1"]), "img", "")
        .unwrap();
    let c2 = mall
        .create_container(None, &names(&["c2"]), "img", "")
        .unwrap();

    mall.delete_image("img", true).unwrap();
    assert!(mall.images().unwrap().is_empty());
    assert!(mall.containers().unwrap().is_empty());
    assert!(!mall.layer_exists(&c1.layer).unwrap());
    assert!(!mall.layer_exists(&c2.layer).unwrap());
    // The image's own top layer survives.
    assert!(mall.layer_exists("base").unwrap());
}

#[test]
fn test_wipe_clears_everything_and_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    mall.create_layer(None, None, &names(&["base"]), "", false)
        .unwrap();
    mall.create_image(None, &names(&["img"]), "base", "")
        .unwrap();
    mall.create_container(None, &names(&["c1"]), "img", "")
        .unwrap();

    mall.wipe().unwrap();
    assert!(mall.layers().unwrap().is_empty());
    assert!(mall.images().unwrap().is_empty());
    assert!(mall.containers().unwrap().is_empty());
    mall.wipe().unwrap();
}

#[test]
fn test_status_names_root_and_driver() {
    let root = tempfile::tempdir().unwrap();
    let mall = open_mall(root.path());

    let status = mall.status().unwrap();
    assert!(status
        .iter()
        .any(|(k, v)| k == "Graph Driver" && v == "vfs"));
    assert!(status.iter().any(|(k, _)| k == "Graph Root"));
    mall.shutdown().unwrap();
}
