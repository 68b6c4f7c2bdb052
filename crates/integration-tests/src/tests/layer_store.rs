//! Layers stored by a pull: tar reassembly, stacking and cleanup.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;

use crate::fixture::{ChunkedLayer, LayerTar, TestStore, pseudo_random, test_options};
use crate::integration_test;
use cstor_chunked::{LayerStore, LowerLayersBackfiller};

integration_test!(test_layer_tar_is_byte_identical, || {
    let tar = LayerTar::new()
        .dir("etc", 0o755)?
        .file("etc/os-release", 0o644, b"ID=test\n")?
        .file("etc/empty", 0o600, b"")?
        .file("blob", 0o644, &pseudo_random(40 * 1024, 31))?
        .symlink("etc/alias", "os-release")?
        .hardlink("etc/copy", "etc/os-release")?
        .file(&"n".repeat(140), 0o644, b"long name")?
        .finish()?;
    let layer = ChunkedLayer::new(tar)?;
    let store = TestStore::new()?;
    store.pull("layer1", &layer, &test_options())?;

    let mut rebuilt = Vec::new();
    let written = store.store().layer_tar("layer1", &mut rebuilt)?;
    assert_eq!(written, rebuilt.len() as u64);
    assert!(rebuilt == layer.tar, "reassembled tar differs from the input");
    assert_eq!(
        cstor_chunked::digest::sha256_digest(&rebuilt),
        layer.output.uncompressed_digest
    );

    Ok(())
});

integration_test!(test_layer_tar_detects_modified_checkout, || {
    let tar = LayerTar::new()
        .file("config", 0o644, b"original contents")?
        .finish()?;
    let layer = ChunkedLayer::new(tar)?;
    let store = TestStore::new()?;
    store.pull("layer1", &layer, &test_options())?;

    let path = store.diff_path("layer1").join("config");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
    std::fs::write(&path, b"tampered contents")?;
    let mut rebuilt = Vec::new();
    assert!(store.store().layer_tar("layer1", &mut rebuilt).is_err());

    Ok(())
});

integration_test!(test_missing_parents_are_backfilled, || {
    let base = LayerTar::new()
        .dir("opt", 0o750)?
        .file("opt/base", 0o644, b"base")?
        .finish()?;
    let child = LayerTar::new()
        .file("opt/app/bin", 0o755, b"#!/bin/sh\n")?
        .finish()?;
    let store = TestStore::new()?;
    store.pull("base", &ChunkedLayer::new(base)?, &test_options())?;

    let mut options = test_options();
    options.backfiller = Some(Arc::new(LowerLayersBackfiller::new(vec![
        store.store().open_layer_dir("base")?,
    ])));
    store.pull_onto("child", Some("base"), &ChunkedLayer::new(child)?, &options)?;

    let root = store.diff_path("child");
    assert_eq!(std::fs::metadata(root.join("opt"))?.mode() & 0o7777, 0o750);
    assert_eq!(std::fs::metadata(root.join("opt/app"))?.mode() & 0o7777, 0o755);
    assert_eq!(std::fs::read(root.join("opt/app/bin"))?, b"#!/bin/sh\n");
    assert!(!root.join("opt/base").exists());

    let record = store.store().get_layer("child")?;
    assert_eq!(record.parent.as_deref(), Some("base"));
    assert!(store.store().delete_layer("base").is_err());
    store.store().delete_layer("child")?;
    store.store().delete_layer("base")?;
    assert!(store.store().layer_ids()?.is_empty());

    Ok(())
});

integration_test!(test_failed_pull_leaves_no_complete_layer, || {
    let tar = LayerTar::new()
        .file("present", 0o644, b"x")?
        .hardlink("dangling", "missing")?
        .finish()?;
    let store = TestStore::new()?;
    assert!(
        store
            .pull("broken", &ChunkedLayer::new(tar)?, &test_options())
            .is_err()
    );

    // The record exists but carries no big data, so later pulls ignore it.
    assert!(
        store
            .store()
            .layer_big_data("broken", cstor_chunked::cache::TOC_KEY)?
            .is_none()
    );
    store.store().delete_layer("broken")?;
    assert!(store.store().list_layers()?.is_empty());

    Ok(())
});
