//! Hostile entry names and link targets must stay inside the checkout.

use std::os::unix::fs::MetadataExt;

use crate::fixture::{ChunkedLayer, LayerTar, TestStore, test_options};
use crate::integration_test;

integration_test!(test_hardlink_with_parent_components_stays_inside, || {
    let tar = LayerTar::new()
        .dir("etc", 0o755)?
        .file("etc/passwd", 0o644, b"root:x:0:0::/root:/bin/sh\n")?
        .hardlink("evil", "../../etc/passwd")?
        .finish()?;
    let store = TestStore::new()?;
    store.pull("layer1", &ChunkedLayer::new(tar)?, &test_options())?;

    let root = store.diff_path("layer1");
    assert_eq!(
        std::fs::metadata(root.join("evil"))?.ino(),
        std::fs::metadata(root.join("etc/passwd"))?.ino()
    );
    assert_ne!(
        std::fs::metadata(root.join("evil"))?.ino(),
        std::fs::metadata("/etc/passwd")?.ino()
    );

    Ok(())
});

integration_test!(test_hardlink_to_unknown_entry_is_rejected, || {
    let tar = LayerTar::new()
        .file("present", 0o644, b"x")?
        .hardlink("evil", "../../../etc/shadow")?
        .finish()?;
    let store = TestStore::new()?;
    let result = store.pull("layer1", &ChunkedLayer::new(tar)?, &test_options());
    assert!(result.is_err());
    assert!(!store.diff_path("layer1").join("evil").exists());

    Ok(())
});

integration_test!(test_symlink_is_not_followed_on_write, || {
    let store = TestStore::new()?;
    let outside = store.scratch_path("outside");
    std::fs::create_dir(&outside)?;
    let outside_str = outside
        .to_str()
        .ok_or_else(|| color_eyre::eyre::eyre!("non-UTF-8 temp path"))?;

    let tar = LayerTar::new()
        .symlink("escape", outside_str)?
        .file("escape/pwned", 0o644, b"owned")?
        .finish()?;
    // Either the write fails or it lands under the checkout; it never
    // reaches the real directory the symlink names.
    let _ = store.pull("layer1", &ChunkedLayer::new(tar)?, &test_options());
    assert!(!outside.join("pwned").exists());

    Ok(())
});

integration_test!(test_symlink_target_kept_verbatim, || {
    let tar = LayerTar::new()
        .symlink("passwd", "../../../../etc/passwd")?
        .finish()?;
    let store = TestStore::new()?;
    store.pull("layer1", &ChunkedLayer::new(tar)?, &test_options())?;

    let link = store.diff_path("layer1").join("passwd");
    assert_eq!(
        std::fs::read_link(&link)?,
        std::path::Path::new("../../../../etc/passwd")
    );
    assert!(std::fs::symlink_metadata(&link)?.file_type().is_symlink());

    Ok(())
});

integration_test!(test_parent_components_in_names_are_cleaned, || {
    let tar = LayerTar::new()
        .raw_file(b"../../../escaped", 0o644, b"contained")?
        .raw_file(b"./a/../b/./file", 0o644, b"cleaned")?
        .finish()?;
    let store = TestStore::new()?;
    store.pull("layer1", &ChunkedLayer::new(tar)?, &test_options())?;

    let root = store.diff_path("layer1");
    assert_eq!(std::fs::read(root.join("escaped"))?, b"contained");
    assert_eq!(std::fs::read(root.join("b/file"))?, b"cleaned");
    assert!(!store.root_path().join("escaped").exists());
    assert!(!store.scratch_path("escaped").exists());

    Ok(())
});
