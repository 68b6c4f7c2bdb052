//! Composefs output: object store layout and image description.

use std::collections::HashMap;

use crate::fixture::{ChunkedLayer, LayerTar, TestStore, pseudo_random, test_options};
use crate::integration_test;
use cstor_chunked::composefs::{
    COMPOSEFS_BLOB_NAME, COMPOSEFS_DATA_DIR, composefs_supported, generate_dump, object_path,
};
use cstor_chunked::{ChunkedError, OutputFormat};

fn layer() -> color_eyre::Result<ChunkedLayer> {
    let shared = pseudo_random(20 * 1024, 41);
    let tar = LayerTar::new()
        .dir("bin", 0o755)?
        .file("bin/tool", 0o755, &shared)?
        .file("bin/tool-copy", 0o755, &shared)?
        .file("bin/with space", 0o644, b"spaced")?
        .file("bin/empty", 0o644, b"")?
        .symlink("bin/alias", "tool")?
        .finish()?;
    ChunkedLayer::new(tar)
}

integration_test!(test_composefs_dump_of_layer, || {
    let layer = layer()?;
    let dump = generate_dump(&layer.output.toc, &HashMap::new())?;
    let lines: Vec<&str> = dump.lines().collect();

    assert!(lines[0].starts_with("/ "));
    let tool_digest = &layer
        .output
        .toc
        .entries
        .iter()
        .find(|e| e.name == "bin/tool")
        .ok_or_else(|| color_eyre::eyre::eyre!("bin/tool missing from TOC"))?
        .digest;
    let object = object_path(tool_digest)?;
    let tool_lines: Vec<&&str> = lines
        .iter()
        .filter(|l| l.split(' ').nth(8) == Some(object.as_str()))
        .collect();
    assert_eq!(tool_lines.len(), 2, "both copies share one object");
    assert!(lines.iter().any(|l| l.starts_with("/bin/with\\x20space 6 100644 ")));
    assert!(lines.iter().any(|l| l.starts_with("/bin/alias 4 120")));

    Ok(())
});

integration_test!(test_composefs_pull, || {
    let layer = layer()?;
    let store = TestStore::new()?;
    let mut options = test_options();
    options.format = OutputFormat::Composefs;

    if let Err(e) = composefs_supported() {
        let result = store.pull("layer1", &layer, &options);
        let err = result.err().ok_or_else(|| {
            color_eyre::eyre::eyre!("composefs pull succeeded without mkcomposefs")
        })?;
        assert!(
            matches!(
                err.downcast_ref::<ChunkedError>(),
                Some(ChunkedError::Unsupported(_))
            ),
            "unexpected error: {err}"
        );
        eprintln!("composefs unavailable ({e}), only checked the refusal");
        return Ok(());
    }

    let pulled = store.pull("layer1", &layer, &options)?;
    let root = store.diff_path("layer1");
    let blob = pulled
        .output
        .composefs_blob
        .ok_or_else(|| color_eyre::eyre::eyre!("no composefs blob produced"))?;
    assert_eq!(blob, root.join(COMPOSEFS_DATA_DIR).join(COMPOSEFS_BLOB_NAME));
    assert!(std::fs::metadata(&blob)?.len() > 0);

    let shared = pseudo_random(20 * 1024, 41);
    for entry in layer
        .output
        .toc
        .entries
        .iter()
        .filter(|e| e.size > 0)
    {
        let object = root.join(object_path(&entry.digest)?);
        let expected: &[u8] = match entry.name.as_str() {
            "bin/with space" => b"spaced",
            _ => &shared,
        };
        assert_eq!(std::fs::read(&object)?, expected);
    }
    assert!(!root.join("bin/tool").exists());
    assert_eq!(pulled.output.stats.remote_files, 2);

    Ok(())
});
