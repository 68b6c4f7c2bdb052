//! Layer metadata store.
//!
//! The differ only needs a handful of things from the store that owns the
//! layers: their IDs, their big data blobs (manifest, tar-split, cache file)
//! and a directory handle on their checkout. Those are captured by the
//! [`LayerStore`] trait.
//!
//! [`DirLayerStore`] implements the trait on top of the on-disk layout used by
//! containers-storage with the overlay driver:
//!
//! ```text
//! <root>/
//! +-- overlay-layers/
//! |   +-- layers.json              # array of layer records
//! |   +-- <layer-id>/<key-name>    # big data
//! +-- overlay/
//!     +-- <layer-id>/diff/         # checkout
//! ```
//!
//! Big data key names made only of `[0-9a-z.]` are used as file names as is;
//! anything else is stored as `=` followed by the URL-safe base64 of the key.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::prelude::*;
use cap_std::ambient_authority;
use cap_std::fs::{Dir, Permissions, PermissionsExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::cache::TAR_SPLIT_KEY;
use crate::error::{ChunkedError, Result};
use crate::materialize::{LowerLayersBackfiller, open_file_under_root};

const LAYERS_DIR: &str = "overlay-layers";
const LAYERS_JSON: &str = "layers.json";
const OVERLAY_DIR: &str = "overlay";
const DIFF_DIR: &str = "diff";

/// Access to the layers already present in a store.
///
/// Implementations do their own locking; every method may be called from the
/// differ while other processes use the store.
pub trait LayerStore: Send + Sync {
    /// IDs of every complete layer, oldest first.
    fn layer_ids(&self) -> Result<Vec<String>>;

    /// Big data stored with a layer under `key`, if any.
    fn layer_big_data(&self, layer_id: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store big data with a layer, replacing any previous value.
    fn set_layer_big_data(&self, layer_id: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Open the checkout directory of a layer.
    fn open_layer_dir(&self, layer_id: &str) -> Result<Dir>;
}

/// A layer record in `layers.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct LayerRecord {
    /// Layer ID (64 hex characters).
    pub id: String,

    /// Parent layer ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Human readable names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,

    /// Creation timestamp (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    /// Digest of the compressed blob the layer was pulled from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_diff_digest: Option<String>,

    /// Size of the compressed blob.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,

    /// Digest of the uncompressed tar stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_digest: Option<String>,

    /// Keys of the big data stored with the layer.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub big_data_names: Vec<String>,

    /// Layer flags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<HashMap<String, serde_json::Value>>,
}

impl LayerRecord {
    /// Create a record for `id` with no other fields set.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Check if this layer is marked as incomplete.
    pub fn is_incomplete(&self) -> bool {
        self.flags
            .as_ref()
            .map(|f| f.contains_key("incomplete"))
            .unwrap_or(false)
    }

    /// Mark this layer as incomplete (used during creation).
    pub fn set_incomplete(&mut self, incomplete: bool) {
        if incomplete {
            let flags = self.flags.get_or_insert_with(Default::default);
            flags.insert("incomplete".to_string(), serde_json::Value::Bool(true));
        } else if let Some(flags) = &mut self.flags {
            flags.remove("incomplete");
            if flags.is_empty() {
                self.flags = None;
            }
        }
    }
}

/// File name used for the big data stored under `key`.
pub fn big_data_file_name(key: &str) -> String {
    let plain = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || b == b'.');
    if plain && key != "." && key != ".." {
        key.to_string()
    } else {
        format!("={}", BASE64_URL_SAFE.encode(key))
    }
}

/// Generate a random-looking 64-character hex ID.
pub fn generate_layer_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(now.as_nanos().to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hex::encode(hasher.finalize())
}

fn validate_layer_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if ok {
        Ok(())
    } else {
        Err(ChunkedError::unsafe_path(id, "invalid layer ID"))
    }
}

/// Write `data` to `name` in `dir` through a temporary file and a rename.
fn write_atomic(dir: &Dir, name: &str, data: &[u8]) -> Result<()> {
    let temp_name = format!(".{}.{}.tmp", name, generate_layer_id());
    dir.write(&temp_name, data)?;
    if let Err(e) = dir.rename(&temp_name, dir, name) {
        let _ = dir.remove_file(&temp_name);
        return Err(e.into());
    }
    Ok(())
}

/// A containers-storage style layer store rooted at a directory.
#[derive(Debug)]
pub struct DirLayerStore {
    root: Dir,
    root_path: PathBuf,
    /// Serializes read-modify-write cycles of `layers.json` in this process.
    records: Mutex<()>,
}

impl DirLayerStore {
    /// Open a store at `root`, creating the directory skeleton if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root_path = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_path)?;
        let root = Dir::open_ambient_dir(&root_path, ambient_authority())?;
        root.create_dir_all(LAYERS_DIR)?;
        root.create_dir_all(OVERLAY_DIR)?;
        Ok(Self {
            root,
            root_path,
            records: Mutex::new(()),
        })
    }

    /// Path of the store root.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Path of a layer's checkout directory.
    pub fn layer_diff_path(&self, id: &str) -> PathBuf {
        self.root_path.join(OVERLAY_DIR).join(id).join(DIFF_DIR)
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, ()> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_layers(&self) -> Result<Vec<LayerRecord>> {
        let layers_dir = self.root.open_dir(LAYERS_DIR)?;
        match layers_dir.read(LAYERS_JSON) {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ChunkedError::Io(e)),
        }
    }

    fn save_layers(&self, layers: &[LayerRecord]) -> Result<()> {
        let layers_dir = self.root.open_dir(LAYERS_DIR)?;
        let json = serde_json::to_vec_pretty(layers)?;
        write_atomic(&layers_dir, LAYERS_JSON, &json)
    }

    fn update_layer<F>(&self, id: &str, f: F) -> Result<LayerRecord>
    where
        F: FnOnce(&mut LayerRecord),
    {
        let _guard = self.lock_records();
        let mut layers = self.load_layers()?;
        let record = layers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| ChunkedError::LayerNotFound(id.to_string()))?;
        f(record);
        let updated = record.clone();
        self.save_layers(&layers)?;
        Ok(updated)
    }

    /// All layer records, including incomplete ones.
    pub fn list_layers(&self) -> Result<Vec<LayerRecord>> {
        self.load_layers()
    }

    /// Look up a layer record.
    pub fn get_layer(&self, id: &str) -> Result<LayerRecord> {
        self.load_layers()?
            .into_iter()
            .find(|l| l.id == id)
            .ok_or_else(|| ChunkedError::LayerNotFound(id.to_string()))
    }

    /// Create a new, empty layer.
    ///
    /// The record is first saved with the `incomplete` flag, then the
    /// directories are created and the flag is cleared. A crash in between
    /// leaves a record that [`cleanup_incomplete`](Self::cleanup_incomplete)
    /// removes.
    pub fn create_layer(&self, id: Option<&str>, parent: Option<&str>) -> Result<LayerRecord> {
        let layer_id = id.map(String::from).unwrap_or_else(generate_layer_id);
        validate_layer_id(&layer_id)?;

        let mut record = LayerRecord::new(layer_id.clone());
        record.parent = parent.map(String::from);
        record.created = Some(chrono::Utc::now().to_rfc3339());
        record.set_incomplete(true);

        {
            let _guard = self.lock_records();
            let mut layers = self.load_layers()?;
            if layers.iter().any(|l| l.id == layer_id) {
                return Err(ChunkedError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("layer {} already exists", layer_id),
                )));
            }
            if let Some(parent_id) = parent
                && !layers.iter().any(|l| l.id == parent_id)
            {
                return Err(ChunkedError::LayerNotFound(parent_id.to_string()));
            }
            layers.push(record.clone());
            self.save_layers(&layers)?;
        }

        let overlay_dir = self.root.open_dir(OVERLAY_DIR)?;
        overlay_dir.create_dir_all(&layer_id)?;
        let layer_dir = overlay_dir.open_dir(&layer_id)?;
        layer_dir.create_dir_all(DIFF_DIR)?;
        layer_dir.set_permissions(DIFF_DIR, Permissions::from_mode(0o755))?;
        self.root.open_dir(LAYERS_DIR)?.create_dir_all(&layer_id)?;

        tracing::debug!("created layer {}", layer_id);
        self.update_layer(&layer_id, |r| r.set_incomplete(false))
    }

    /// Record the digests of a layer once its content is in place.
    pub fn set_layer_digests(
        &self,
        id: &str,
        compressed_diff_digest: Option<&str>,
        compressed_size: Option<u64>,
        diff_digest: Option<&str>,
    ) -> Result<LayerRecord> {
        self.update_layer(id, |r| {
            r.compressed_diff_digest = compressed_diff_digest.map(String::from);
            r.compressed_size = compressed_size;
            r.diff_digest = diff_digest.map(String::from);
        })
    }

    /// Delete a layer, its checkout and its big data.
    pub fn delete_layer(&self, id: &str) -> Result<()> {
        validate_layer_id(id)?;
        {
            let _guard = self.lock_records();
            let layers = self.load_layers()?;
            if !layers.iter().any(|l| l.id == id) {
                return Err(ChunkedError::LayerNotFound(id.to_string()));
            }
            if let Some(child) = layers.iter().find(|l| l.parent.as_deref() == Some(id)) {
                return Err(ChunkedError::Io(std::io::Error::other(format!(
                    "cannot delete layer {}: layer {} depends on it",
                    id, child.id
                ))));
            }
            let layers: Vec<LayerRecord> = layers.into_iter().filter(|l| l.id != id).collect();
            self.save_layers(&layers)?;
        }

        let overlay_dir = self.root.open_dir(OVERLAY_DIR)?;
        match overlay_dir.remove_dir_all(id) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        let layers_dir = self.root.open_dir(LAYERS_DIR)?;
        match layers_dir.remove_dir_all(id) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        tracing::debug!("deleted layer {}", id);
        Ok(())
    }

    /// Remove layers left behind with the `incomplete` flag.
    pub fn cleanup_incomplete(&self) -> Result<Vec<String>> {
        let incomplete: Vec<String> = self
            .load_layers()?
            .into_iter()
            .filter(|l| l.is_incomplete())
            .map(|l| l.id)
            .collect();
        for id in &incomplete {
            if let Err(e) = self.delete_layer(id) {
                tracing::warn!("removing incomplete layer {}: {}", id, e);
            }
        }
        Ok(incomplete)
    }

    /// Checkouts of `id`'s ancestors, nearest first.
    pub fn lower_dirs(&self, id: &str) -> Result<Vec<Dir>> {
        let layers = self.load_layers()?;
        let by_id: HashMap<&str, &LayerRecord> =
            layers.iter().map(|l| (l.id.as_str(), l)).collect();
        let mut parent = by_id
            .get(id)
            .ok_or_else(|| ChunkedError::LayerNotFound(id.to_string()))?
            .parent
            .clone();
        let mut dirs = Vec::new();
        while let Some(p) = parent {
            if dirs.len() > layers.len() {
                return Err(ChunkedError::format("cycle in layer parents"));
            }
            dirs.push(self.open_layer_dir(&p)?);
            parent = by_id.get(p.as_str()).and_then(|r| r.parent.clone());
        }
        Ok(dirs)
    }

    /// A backfiller answering from the ancestors of `id`.
    pub fn backfiller(&self, id: &str) -> Result<LowerLayersBackfiller> {
        Ok(LowerLayersBackfiller::new(self.lower_dirs(id)?))
    }

    /// Rebuild the original tar stream of a layer from its tar-split and
    /// checkout.
    pub fn layer_tar<W: std::io::Write>(&self, id: &str, out: &mut W) -> Result<u64> {
        let tar_split = self
            .layer_big_data(id, TAR_SPLIT_KEY)?
            .ok_or_else(|| ChunkedError::format(format!("layer {} has no tar-split", id)))?;
        let checkout = self.open_layer_dir(id)?;
        crate::tar_split::reassemble_tar(
            &tar_split,
            |name| -> Result<Box<dyn Read>> {
                let f = open_file_under_root(&checkout, name, rustix::fs::OFlags::RDONLY, 0)?;
                Ok(Box::new(f))
            },
            out,
        )
    }
}

impl LayerStore for DirLayerStore {
    fn layer_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .load_layers()?
            .into_iter()
            .filter(|l| !l.is_incomplete())
            .map(|l| l.id)
            .collect())
    }

    fn layer_big_data(&self, layer_id: &str, key: &str) -> Result<Option<Vec<u8>>> {
        validate_layer_id(layer_id)?;
        let layers_dir = self.root.open_dir(LAYERS_DIR)?;
        let dir = match layers_dir.open_dir(layer_id) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match dir.read(big_data_file_name(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_layer_big_data(&self, layer_id: &str, key: &str, data: &[u8]) -> Result<()> {
        validate_layer_id(layer_id)?;
        let layers_dir = self.root.open_dir(LAYERS_DIR)?;
        layers_dir.create_dir_all(layer_id)?;
        let dir = layers_dir.open_dir(layer_id)?;
        write_atomic(&dir, &big_data_file_name(key), data)?;
        self.update_layer(layer_id, |r| {
            if !r.big_data_names.iter().any(|k| k == key) {
                r.big_data_names.push(key.to_string());
            }
        })?;
        Ok(())
    }

    fn open_layer_dir(&self, layer_id: &str) -> Result<Dir> {
        validate_layer_id(layer_id)?;
        let overlay_dir = self.root.open_dir(OVERLAY_DIR)?;
        match overlay_dir.open_dir(format!("{}/{}", layer_id, DIFF_DIR)) {
            Ok(d) => Ok(d),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ChunkedError::LayerNotFound(layer_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_data_file_name() {
        assert_eq!(big_data_file_name("manifest.json"), "manifest.json");
        let encoded = big_data_file_name("zstd-chunked-manifest");
        assert!(encoded.starts_with('='));
        assert!(!encoded.contains('/'));
        let decoded = BASE64_URL_SAFE.decode(&encoded[1..]).unwrap();
        assert_eq!(decoded, b"zstd-chunked-manifest");
        assert!(big_data_file_name("..").starts_with('='));
        assert!(big_data_file_name("a/b").starts_with('='));
    }

    #[test]
    fn test_create_list_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirLayerStore::open(tmp.path()).unwrap();
        let base = store.create_layer(Some("base"), None).unwrap();
        assert!(!base.is_incomplete());
        assert!(base.created.is_some());
        let child = store.create_layer(None, Some("base")).unwrap();
        assert_eq!(child.id.len(), 64);

        assert_eq!(store.layer_ids().unwrap(), vec!["base".to_string(), child.id.clone()]);
        assert!(store.layer_diff_path("base").is_dir());
        assert!(matches!(
            store.create_layer(None, Some("missing")),
            Err(ChunkedError::LayerNotFound(_))
        ));
        assert!(store.delete_layer("base").is_err());

        store.delete_layer(&child.id).unwrap();
        store.delete_layer("base").unwrap();
        assert!(store.layer_ids().unwrap().is_empty());
        assert!(!store.layer_diff_path("base").exists());
    }

    #[test]
    fn test_big_data() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirLayerStore::open(tmp.path()).unwrap();
        store.create_layer(Some("l1"), None).unwrap();
        assert_eq!(store.layer_big_data("l1", "k").unwrap(), None);
        store.set_layer_big_data("l1", "zstd-chunked-manifest", b"one").unwrap();
        store.set_layer_big_data("l1", "zstd-chunked-manifest", b"two").unwrap();
        assert_eq!(
            store.layer_big_data("l1", "zstd-chunked-manifest").unwrap(),
            Some(b"two".to_vec())
        );
        let record = store.get_layer("l1").unwrap();
        assert_eq!(record.big_data_names, vec!["zstd-chunked-manifest".to_string()]);
        assert!(store.layer_big_data("../l1", "k").is_err());
        assert!(store.set_layer_big_data("nope", "k", b"x").is_err());
    }

    #[test]
    fn test_incomplete_layers_hidden_and_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirLayerStore::open(tmp.path()).unwrap();
        store.create_layer(Some("done"), None).unwrap();
        let mut stale = LayerRecord::new("stale");
        stale.set_incomplete(true);
        let mut layers = store.list_layers().unwrap();
        layers.push(stale);
        store.save_layers(&layers).unwrap();

        assert_eq!(store.layer_ids().unwrap(), vec!["done".to_string()]);
        assert_eq!(store.cleanup_incomplete().unwrap(), vec!["stale".to_string()]);
        assert_eq!(store.list_layers().unwrap().len(), 1);
    }

    #[test]
    fn test_lower_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirLayerStore::open(tmp.path()).unwrap();
        store.create_layer(Some("a"), None).unwrap();
        store.create_layer(Some("b"), Some("a")).unwrap();
        store.create_layer(Some("c"), Some("b")).unwrap();
        std::fs::write(store.layer_diff_path("a").join("marker"), b"a").unwrap();
        let lowers = store.lower_dirs("c").unwrap();
        assert_eq!(lowers.len(), 2);
        assert!(lowers[1].exists("marker"));
        assert!(!lowers[0].exists("marker"));
    }

    #[test]
    fn test_records_are_kebab_case() {
        let mut record = LayerRecord::new("x");
        record.compressed_diff_digest = Some("sha256:00".into());
        record.big_data_names = vec!["k".into()];
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"compressed-diff-digest\""));
        assert!(json.contains("\"big-data-names\""));
        assert!(!json.contains("parent"));
    }
}
