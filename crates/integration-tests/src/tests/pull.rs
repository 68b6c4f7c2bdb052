//! End-to-end pulls of freshly compressed layers.

use std::os::unix::fs::MetadataExt;

use crate::fixture::{ChunkedLayer, LayerTar, TestStore, pseudo_random, test_options};
use crate::integration_test;
use cstor_chunked::{ChunkedDiffer, CompressorOptions, EntryType, FileBlobSource};

fn sample_layer() -> color_eyre::Result<ChunkedLayer> {
    let mut sparse = vec![0u8; 16 * 1024];
    sparse.extend_from_slice(b"tail after a run of zeros");

    let tar = LayerTar::new()
        .dir("app", 0o755)?
        .file("app/big", 0o644, &pseudo_random(64 * 1024, 7))?
        .file("app/small", 0o600, b"hello world\n")?
        .file("app/empty", 0o644, b"")?
        .file("app/sparse", 0o644, &sparse)?
        .symlink("app/link", "small")?
        .hardlink("app/alias", "app/small")?
        .finish()?;
    ChunkedLayer::new(tar)
}

integration_test!(test_pull_reconstructs_files, || {
    let layer = sample_layer()?;
    let store = TestStore::new()?;
    let pulled = store.pull("layer1", &layer, &test_options())?;
    let root = store.diff_path("layer1");

    assert_eq!(
        std::fs::read(root.join("app/big"))?,
        pseudo_random(64 * 1024, 7)
    );
    assert_eq!(std::fs::read(root.join("app/small"))?, b"hello world\n");
    assert_eq!(std::fs::read(root.join("app/empty"))?, b"");
    let sparse = std::fs::read(root.join("app/sparse"))?;
    assert_eq!(sparse.len(), 16 * 1024 + 25);
    assert!(sparse[..16 * 1024].iter().all(|&b| b == 0));
    assert_eq!(
        std::fs::read_link(root.join("app/link"))?,
        std::path::Path::new("small")
    );
    assert_eq!(
        std::fs::metadata(root.join("app/alias"))?.ino(),
        std::fs::metadata(root.join("app/small"))?.ino()
    );

    let mode = std::fs::metadata(root.join("app/small"))?.mode();
    assert_eq!(mode & 0o7777, 0o600);

    let stats = pulled.output.stats;
    assert!(stats.remote_chunks >= 2);
    assert!(stats.holes >= 1);
    assert_eq!(stats.hardlinks, 1);
    assert!(stats.fetch.ranges >= 1);

    Ok(())
});

integration_test!(test_large_file_spans_chunks, || {
    let layer = sample_layer()?;
    let toc = &layer.output.toc;

    let big_chunks = toc
        .entries
        .iter()
        .filter(|e| e.name == "app/big")
        .filter(|e| matches!(e.entry_type, EntryType::Reg | EntryType::Chunk))
        .count();
    assert!(big_chunks >= 2, "expected several chunks, got {big_chunks}");

    // One TOC entry per tar entry, chunk continuations aside.
    let files = toc
        .entries
        .iter()
        .filter(|e| e.entry_type != EntryType::Chunk)
        .count();
    assert_eq!(files, 7);

    Ok(())
});

integration_test!(test_pull_records_big_data, || {
    let layer = sample_layer()?;
    let store = TestStore::new()?;
    let pulled = store.pull("layer1", &layer, &test_options())?;

    let record = store.store().get_layer("layer1")?;
    assert!(!record.is_incomplete());
    assert_eq!(
        record.compressed_diff_digest.as_deref(),
        Some(layer.blob_digest.as_str())
    );
    for key in pulled.output.big_data.keys() {
        assert!(
            record.big_data_names.contains(key),
            "{key} not recorded in {:?}",
            record.big_data_names
        );
    }
    assert_eq!(pulled.output.toc_digest, layer.output.toc_digest);

    Ok(())
});

integration_test!(test_single_range_request, || {
    let layer = sample_layer()?;
    let store = TestStore::new()?;
    let mut options = test_options();
    options.pull.max_missing_ranges = 1;
    options.pull.max_concurrent_streams = 1;
    let pulled = store.pull("layer1", &layer, &options)?;

    assert_eq!(pulled.output.stats.fetch.ranges, 1);
    assert_eq!(pulled.output.stats.fetch.requests, 1);
    assert_eq!(
        std::fs::read(store.diff_path("layer1").join("app/big"))?,
        pseudo_random(64 * 1024, 7)
    );

    Ok(())
});

integration_test!(test_pull_default_chunk_size, || {
    let content = pseudo_random(300 * 1024, 99);
    let tar = LayerTar::new().file("blob.bin", 0o644, &content)?.finish()?;
    let layer = ChunkedLayer::with_options(tar, &CompressorOptions::default())?;
    let store = TestStore::new()?;
    store.pull("layer1", &layer, &test_options())?;

    assert_eq!(
        std::fs::read(store.diff_path("layer1").join("blob.bin"))?,
        content
    );

    Ok(())
});

integration_test!(test_pull_from_file_source, || {
    let layer = sample_layer()?;
    let store = TestStore::new()?;
    let blob_path = store.scratch_path("layer.zst");
    std::fs::write(&blob_path, &layer.blob)?;

    let source = FileBlobSource::open(&blob_path)?;
    let differ = ChunkedDiffer::new(
        &source,
        &layer.blob_digest,
        source.size(),
        layer.annotations(),
    )?;
    let dest = store.scratch_path("checkout");
    differ.apply_diff(store.store(), &dest, &test_options())?;

    assert_eq!(
        std::fs::read(dest.join("app/big"))?,
        pseudo_random(64 * 1024, 7)
    );
    assert!(store.store().list_layers()?.is_empty());

    Ok(())
});
