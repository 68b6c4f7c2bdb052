//! Configuration for partial pulls.
//!
//! Partial pulls are configured through the same `storage.conf` that
//! containers-storage reads. The chunked differ only cares about the
//! `[storage.options] pull_options` table, whose values are strings:
//!
//! ```toml
//! [storage]
//! driver = "overlay"
//! root = "/var/lib/containers/storage"
//! run_root = "/run/containers/storage"
//!
//! [storage.options]
//! pull_options = { enable_partial_images = "true", use_hard_links = "false" }
//! ```
//!
//! [`StorageConfig::pull_options`] turns that table into a typed
//! [`PullOptions`]. Unknown keys are ignored; malformed values fall back to
//! the default with a warning.
//!
//! # Usage Example
//!
//! ```no_run
//! use cstor_chunked::StorageConfig;
//!
//! # fn example() -> cstor_chunked::Result<()> {
//! let content = std::fs::read_to_string("/etc/containers/storage.conf")?;
//! let config = StorageConfig::from_toml(&content)?;
//! let pull = config.pull_options();
//! println!("partial pulls enabled: {}", pull.enable_partial_images);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Result;

/// Default zstd compression level used by the compressor.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default number of low rolling-checksum bits that must be zero to split.
pub const DEFAULT_ROLLSUM_BITS: u32 = 16;

/// Default rolling-checksum window in bytes.
pub const DEFAULT_WINDOW_SIZE: usize = 64;

/// Zero runs at least this long become holes.
pub const DEFAULT_HOLE_THRESHOLD: usize = 1024;

/// Wrapper matching the top level of storage.conf.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    storage: StorageConfig,
}

/// The `[storage]` table of storage.conf.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Storage driver name.
    #[serde(default)]
    pub driver: String,

    /// Primary storage root path.
    #[serde(default)]
    pub root: PathBuf,

    /// Runtime root for transient data.
    #[serde(default)]
    pub run_root: PathBuf,

    /// Additional read-only image stores.
    #[serde(default)]
    pub image_stores: Vec<PathBuf>,

    /// Driver independent options.
    #[serde(default)]
    pub options: StorageOptions,
}

/// The `[storage.options]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageOptions {
    /// Raw `pull_options` map, values are strings as written by c/storage.
    #[serde(default)]
    pub pull_options: HashMap<String, String>,
}

impl StorageConfig {
    /// Parse storage configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.storage)
    }

    /// Typed view of `pull_options`.
    pub fn pull_options(&self) -> PullOptions {
        PullOptions::from_map(&self.options.pull_options)
    }
}

/// Options controlling how chunked layers are pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOptions {
    /// Whether partial pulls are attempted at all.
    pub enable_partial_images: bool,
    /// Allow files to be hard linked from other layers.
    pub use_hard_links: bool,
    /// Tolerate EPERM/EINVAL from chown and mknod (rootless).
    pub ignore_chown_errors: bool,
    /// Mask applied to file and directory modes.
    pub force_mask: Option<u32>,
    /// Upper bound on concurrently open streams to the blob source.
    pub max_concurrent_streams: usize,
    /// Ranges handed to a single `get_blob_at` call.
    pub max_ranges_per_request: usize,
    /// Ranges kept after coalescing; smallest gaps are merged beyond this.
    pub max_missing_ranges: usize,
    /// Produce a composefs image instead of a directory tree.
    pub enable_composefs: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            enable_partial_images: true,
            use_hard_links: false,
            ignore_chown_errors: false,
            force_mask: None,
            max_concurrent_streams: 8,
            max_ranges_per_request: 64,
            max_missing_ranges: 1024,
            enable_composefs: false,
        }
    }
}

impl PullOptions {
    /// Build options from a `pull_options` string map.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut opts = Self::default();
        for (key, value) in map {
            let value = value.trim();
            match key.as_str() {
                "enable_partial_images" => set_bool(&mut opts.enable_partial_images, key, value),
                "use_hard_links" => set_bool(&mut opts.use_hard_links, key, value),
                "ignore_chown_errors" => set_bool(&mut opts.ignore_chown_errors, key, value),
                "convert_images" | "insecure_allow_unpredictable_image_contents" => {}
                "enable_composefs" => set_bool(&mut opts.enable_composefs, key, value),
                "force_mask" => match parse_force_mask(value) {
                    Some(mask) => opts.force_mask = mask,
                    None => tracing::warn!("ignoring invalid force_mask {:?}", value),
                },
                "max_concurrent_streams" => set_count(&mut opts.max_concurrent_streams, key, value),
                "max_ranges_per_request" => set_count(&mut opts.max_ranges_per_request, key, value),
                "max_missing_ranges" => set_count(&mut opts.max_missing_ranges, key, value),
                _ => tracing::debug!("unknown pull option {}", key),
            }
        }
        opts
    }
}

fn set_bool(slot: &mut bool, key: &str, value: &str) {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => *slot = true,
        "false" | "0" | "no" => *slot = false,
        _ => tracing::warn!("ignoring invalid boolean for {}: {:?}", key, value),
    }
}

fn set_count(slot: &mut usize, key: &str, value: &str) {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => *slot = n,
        _ => tracing::warn!("ignoring invalid count for {}: {:?}", key, value),
    }
}

/// `"private"` and `"shared"` are the named masks c/storage accepts.
fn parse_force_mask(value: &str) -> Option<Option<u32>> {
    match value {
        "" => Some(None),
        "private" => Some(Some(0o700)),
        "shared" => Some(Some(0o755)),
        v => u32::from_str_radix(v, 8).ok().map(Some),
    }
}

/// Tunables for the compressor.
///
/// The rolling checksum splits when the low `rollsum_bits` bits of its digest
/// are all zero, so the average chunk is roughly `2^rollsum_bits` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressorOptions {
    /// Number of low digest bits that must be zero to end a chunk.
    pub rollsum_bits: u32,
    /// Rolling checksum window; must be a power of two.
    pub window_size: usize,
    /// Zero runs at least this long are recorded as holes.
    pub hole_threshold: usize,
    /// zstd compression level.
    pub level: i32,
}

impl Default for CompressorOptions {
    fn default() -> Self {
        Self {
            rollsum_bits: DEFAULT_ROLLSUM_BITS,
            window_size: DEFAULT_WINDOW_SIZE,
            hole_threshold: DEFAULT_HOLE_THRESHOLD,
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pull_options() {
        let conf = r#"
[storage]
driver = "overlay"
root = "/var/lib/containers/storage"

[storage.options]
pull_options = { enable_partial_images = "true", use_hard_links = "TRUE", force_mask = "0755", max_concurrent_streams = "4" }
"#;
        let config = StorageConfig::from_toml(conf).unwrap();
        assert_eq!(config.driver, "overlay");
        let pull = config.pull_options();
        assert!(pull.enable_partial_images);
        assert!(pull.use_hard_links);
        assert_eq!(pull.force_mask, Some(0o755));
        assert_eq!(pull.max_concurrent_streams, 4);
        assert_eq!(pull.max_missing_ranges, 1024);
    }

    #[test]
    fn test_missing_storage_table() {
        let config = StorageConfig::from_toml("").unwrap();
        assert_eq!(config.pull_options(), PullOptions::default());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let mut map = HashMap::new();
        map.insert("use_hard_links".to_string(), "maybe".to_string());
        map.insert("max_concurrent_streams".to_string(), "0".to_string());
        map.insert("force_mask".to_string(), "rwx".to_string());
        let pull = PullOptions::from_map(&map);
        assert!(!pull.use_hard_links);
        assert_eq!(pull.max_concurrent_streams, 8);
        assert_eq!(pull.force_mask, None);
    }

    #[test]
    fn test_named_force_masks() {
        assert_eq!(parse_force_mask("private"), Some(Some(0o700)));
        assert_eq!(parse_force_mask("shared"), Some(Some(0o755)));
        assert_eq!(parse_force_mask(""), Some(None));
    }

    #[test]
    fn test_bad_toml() {
        assert!(StorageConfig::from_toml("[storage").is_err());
    }
}
