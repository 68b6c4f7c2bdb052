//! Test fixtures: isolated layer stores and zstd:chunked blobs built on the fly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::TempDir;

use cstor_chunked::source::BlobStreams;
use cstor_chunked::{
    BlobSource, ChunkedDiffer, CompressionOutput, CompressorOptions, DifferOptions, DifferOutput,
    DirLayerStore, ImageSourceChunk, MemoryBlobSource, PullOptions, compress,
};

/// An isolated layer store in a temporary directory.
///
/// The store and every checkout are removed when this is dropped.
pub struct TestStore {
    /// Root temporary directory containing the storage.
    temp_dir: TempDir,
    /// Path to the storage root.
    root_path: PathBuf,
    /// The opened store.
    store: DirLayerStore,
}

impl TestStore {
    /// Create a new empty store.
    pub fn new() -> color_eyre::Result<Self> {
        let temp_dir = TempDir::new()?;
        let root_path = temp_dir.path().join("storage");
        let store = DirLayerStore::open(&root_path)?;
        Ok(Self {
            temp_dir,
            root_path,
            store,
        })
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &DirLayerStore {
        &self.store
    }

    /// Get the root path of the test storage.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// A scratch path next to the storage root, outside every layer.
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Checkout directory of a layer.
    pub fn diff_path(&self, layer_id: &str) -> PathBuf {
        self.store.layer_diff_path(layer_id)
    }

    /// Pull `layer` into a new layer `layer_id` and commit its metadata.
    pub fn pull(
        &self,
        layer_id: &str,
        layer: &ChunkedLayer,
        options: &DifferOptions,
    ) -> color_eyre::Result<Pulled> {
        self.pull_onto(layer_id, None, layer, options)
    }

    /// Like [`Self::pull`], stacking the new layer on `parent`.
    pub fn pull_onto(
        &self,
        layer_id: &str,
        parent: Option<&str>,
        layer: &ChunkedLayer,
        options: &DifferOptions,
    ) -> color_eyre::Result<Pulled> {
        let source = CountingSource::new(layer.blob.clone());
        let differ = ChunkedDiffer::new(
            &source,
            &layer.blob_digest,
            source.size(),
            &layer.output.annotations,
        )?;
        self.store.create_layer(Some(layer_id), parent)?;
        let output = differ.apply_diff(&self.store, &self.diff_path(layer_id), options)?;
        output.commit(&self.store, layer_id)?;
        self.store.set_layer_digests(
            layer_id,
            Some(&layer.blob_digest),
            Some(source.size()),
            Some(&layer.output.uncompressed_digest),
        )?;
        Ok(Pulled {
            output,
            requests: source.requests(),
            bytes: source.bytes(),
        })
    }
}

/// Result of [`TestStore::pull`].
#[derive(Debug)]
pub struct Pulled {
    /// What the differ reported.
    pub output: DifferOutput,
    /// Ranges the blob source was asked for.
    pub requests: u64,
    /// Compressed bytes the blob source delivered.
    pub bytes: u64,
}

/// Differ options suitable for unprivileged test runs.
pub fn test_options() -> DifferOptions {
    DifferOptions::from_pull_options(PullOptions {
        ignore_chown_errors: true,
        ..Default::default()
    })
}

/// Deterministic incompressible content.
pub fn pseudo_random(len: usize, mut seed: u32) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 16) as u8
        })
        .collect()
}

/// Builder for small layer tarballs.
pub struct LayerTar {
    builder: tar::Builder<Vec<u8>>,
}

impl Default for LayerTar {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerTar {
    /// Start an empty tarball.
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_size(size);
        header.set_mtime(1_700_000_000);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    /// Add a directory.
    pub fn dir(mut self, name: &str, mode: u32) -> std::io::Result<Self> {
        let mut header = Self::header(tar::EntryType::Directory, mode, 0);
        self.builder.append_data(&mut header, name, std::io::empty())?;
        Ok(self)
    }

    /// Add a regular file.
    pub fn file(mut self, name: &str, mode: u32, data: &[u8]) -> std::io::Result<Self> {
        let mut header = Self::header(tar::EntryType::Regular, mode, data.len() as u64);
        self.builder.append_data(&mut header, name, data)?;
        Ok(self)
    }

    /// Add a symlink.
    pub fn symlink(mut self, name: &str, target: &str) -> std::io::Result<Self> {
        let mut header = Self::header(tar::EntryType::Symlink, 0o777, 0);
        self.builder.append_link(&mut header, name, target)?;
        Ok(self)
    }

    /// Add a hard link to an earlier entry.
    pub fn hardlink(mut self, name: &str, target: &str) -> std::io::Result<Self> {
        let mut header = Self::header(tar::EntryType::Link, 0o644, 0);
        self.builder.append_link(&mut header, name, target)?;
        Ok(self)
    }

    /// Add a regular file whose name is written into the header verbatim,
    /// bypassing the path checks of the tar crate.
    pub fn raw_file(mut self, name: &[u8], mode: u32, data: &[u8]) -> std::io::Result<Self> {
        let mut header = Self::header(tar::EntryType::Regular, mode, data.len() as u64);
        let field = &mut header.as_old_mut().name;
        if name.len() > field.len() {
            return Err(std::io::Error::other("raw name too long"));
        }
        field.fill(0);
        field[..name.len()].copy_from_slice(name);
        header.set_cksum();
        self.builder.append(&header, data)?;
        Ok(self)
    }

    /// Finish the archive.
    pub fn finish(self) -> std::io::Result<Vec<u8>> {
        self.builder.into_inner()
    }
}

/// A tarball compressed to zstd:chunked.
#[derive(Debug, Clone)]
pub struct ChunkedLayer {
    /// The uncompressed tar stream.
    pub tar: Vec<u8>,
    /// The compressed blob.
    pub blob: Arc<[u8]>,
    /// Digest of the compressed blob.
    pub blob_digest: String,
    /// What the compressor reported.
    pub output: CompressionOutput,
}

impl ChunkedLayer {
    /// Compress `tar` with small chunks so modest test files span several.
    pub fn new(tar: Vec<u8>) -> color_eyre::Result<Self> {
        let options = CompressorOptions {
            rollsum_bits: 10,
            ..Default::default()
        };
        Self::with_options(tar, &options)
    }

    /// Compress `tar` with explicit options.
    pub fn with_options(tar: Vec<u8>, options: &CompressorOptions) -> color_eyre::Result<Self> {
        let mut blob = Vec::new();
        let output = compress(&tar[..], &mut blob, options)?;
        let blob_digest = cstor_chunked::digest::sha256_digest(&blob);
        Ok(Self {
            tar,
            blob: blob.into(),
            blob_digest,
            output,
        })
    }

    /// Annotations to publish with the blob.
    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.output.annotations
    }
}

/// A [`BlobSource`] over an in-memory blob that counts what it serves.
#[derive(Debug)]
pub struct CountingSource {
    inner: MemoryBlobSource,
    size: u64,
    requests: AtomicU64,
    bytes: AtomicU64,
}

impl CountingSource {
    /// Serve `blob`.
    pub fn new(blob: Arc<[u8]>) -> Self {
        let size = blob.len() as u64;
        Self {
            inner: MemoryBlobSource::new(blob),
            size,
            requests: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Ranges requested so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Bytes requested so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl BlobSource for CountingSource {
    fn get_blob_at(&self, chunks: &[ImageSourceChunk]) -> cstor_chunked::Result<BlobStreams<'_>> {
        self.requests
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);
        self.bytes.fetch_add(
            chunks.iter().map(|c| c.length).sum::<u64>(),
            Ordering::Relaxed,
        );
        self.inner.get_blob_at(chunks)
    }
}
