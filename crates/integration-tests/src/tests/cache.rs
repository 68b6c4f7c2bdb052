//! Per-layer cache files as seen by later pulls.

use crate::fixture::{ChunkedLayer, LayerTar, TestStore, pseudo_random, test_options};
use crate::integration_test;
use cstor_chunked::cache::{CACHE_KEY, TOC_KEY};
use cstor_chunked::{CacheFile, LayerStore, LayersCache};

fn layer() -> color_eyre::Result<ChunkedLayer> {
    let tar = LayerTar::new()
        .file("data.bin", 0o644, &pseudo_random(24 * 1024, 21))?
        .file("notes.txt", 0o644, b"cached\n")?
        .finish()?;
    ChunkedLayer::new(tar)
}

integration_test!(test_cache_indexes_pulled_files, || {
    let layer = layer()?;
    let store = TestStore::new()?;
    store.pull("first", &layer, &test_options())?;

    let data = store
        .store()
        .layer_big_data("first", CACHE_KEY)?
        .ok_or_else(|| color_eyre::eyre::eyre!("no cache file stored"))?;
    let cache = CacheFile::from_bytes(&data)?;
    for entry in layer
        .output
        .toc
        .entries
        .iter()
        .filter(|e| !e.digest.is_empty())
    {
        let location = cache
            .lookup(&entry.digest)
            .ok_or_else(|| color_eyre::eyre::eyre!("{} not indexed", entry.name))?;
        assert_eq!(location.name, entry.name);
        assert_eq!(location.offset, 0);
        assert_eq!(location.size, entry.size);
    }
    assert!(cache.lookup("sha256:0000").is_none());

    Ok(())
});

integration_test!(test_corrupt_cache_is_skipped, || {
    let layer = layer()?;
    let store = TestStore::new()?;
    store.pull("first", &layer, &test_options())?;
    store
        .store()
        .set_layer_big_data("first", CACHE_KEY, b"definitely not a cache file")?;

    let caches = LayersCache::load(store.store(), None)?;
    assert_eq!(caches.layer_count(), 0);

    // The pull still succeeds; it just cannot reuse anything.
    let second = store.pull("second", &layer, &test_options())?;
    assert!(second.output.stats.fetch.ranges > 0);
    assert_eq!(second.output.stats.copied_files, 0);
    assert_eq!(
        std::fs::read(store.diff_path("second").join("notes.txt"))?,
        b"cached\n"
    );

    Ok(())
});

integration_test!(test_missing_cache_is_rebuilt_from_toc, || {
    let layer = layer()?;
    let store = TestStore::new()?;
    let pulled = store.pull("first", &layer, &test_options())?;

    store.store().create_layer(Some("manual"), None)?;
    store
        .store()
        .set_layer_big_data("manual", TOC_KEY, &pulled.output.manifest)?;
    assert!(store.store().layer_big_data("manual", CACHE_KEY)?.is_none());

    let caches = LayersCache::load(store.store(), Some("first"))?;
    assert_eq!(caches.layer_count(), 1);
    let rebuilt = store
        .store()
        .layer_big_data("manual", CACHE_KEY)?
        .ok_or_else(|| color_eyre::eyre::eyre!("cache was not written back"))?;
    assert_eq!(
        CacheFile::from_bytes(&rebuilt)?,
        CacheFile::build(&layer.output.toc)?
    );

    Ok(())
});

integration_test!(test_own_layer_is_excluded, || {
    let layer = layer()?;
    let store = TestStore::new()?;
    store.pull("first", &layer, &test_options())?;

    let caches = LayersCache::load(store.store(), Some("first"))?;
    assert_eq!(caches.layer_count(), 0);
    let caches = LayersCache::load(store.store(), None)?;
    assert_eq!(caches.layer_count(), 1);

    Ok(())
});
