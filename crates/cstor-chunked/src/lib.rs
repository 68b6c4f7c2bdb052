#![forbid(unsafe_code)]
//! Partial pulls of zstd:chunked layers into containers-storage.
//!
//! A zstd:chunked blob is an ordinary zstd-compressed tarball whose frames
//! are cut at file and chunk boundaries, followed by skippable frames holding
//! a table of contents (TOC) and the tar-split metadata needed to rebuild the
//! exact original tar stream. Since every chunk is its own frame, a puller can
//! fetch only the byte ranges it does not already have locally.
//!
//! # Overview
//!
//! - **Write path**: [`compress`] turns a tar stream into a zstd:chunked blob
//!   and returns the annotations to publish with it.
//! - **Read path**: [`ChunkedDiffer`] reads the manifest through a
//!   [`BlobSource`], finds reusable files and chunks in the layers of a
//!   [`LayerStore`], fetches the rest in parallel and materializes the layer,
//!   either as a directory tree or as a composefs image.
//! - **Safety**: every filesystem mutation goes through the root-relative
//!   primitives of [`materialize`], so entries of a malicious layer cannot
//!   reach outside the destination.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use cstor_chunked::{ChunkedDiffer, DifferOptions, DirLayerStore, FileBlobSource};
//!
//! # fn run(annotations: std::collections::HashMap<String, String>) -> cstor_chunked::Result<()> {
//! let store = DirLayerStore::open("/var/lib/containers/storage")?;
//! let source = FileBlobSource::open("/tmp/layer.zst")?;
//! let differ = ChunkedDiffer::new(&source, "sha256:...", source.size(), &annotations)?;
//!
//! let layer = store.create_layer(None, None)?;
//! let output = differ.apply_diff(
//!     &store,
//!     &store.layer_diff_path(&layer.id),
//!     &DifferOptions::default(),
//! )?;
//! output.commit(&store, &layer.id)?;
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod cache;
pub mod composefs;
pub mod compressor;
pub mod config;
pub mod differ;
pub mod digest;
pub mod error;
pub mod fetcher;
pub mod format;
pub mod layer_store;
pub mod materialize;
mod readatreader;
pub mod rollsum;
pub mod source;
pub mod tar_split;
pub mod tar_split_writer;
pub mod toc;

pub use cache::{CacheFile, LayersCache};
pub use compressor::{CompressionOutput, compress};
pub use config::{CompressorOptions, PullOptions, StorageConfig};
pub use differ::{ChunkedDiffer, DifferOptions, DifferOutput, DifferStats, OutputFormat};
pub use error::{ChunkedError, Result};
pub use fetcher::CancellationToken;
pub use format::{Footer, read_zstd_chunked_manifest};
pub use layer_store::{DirLayerStore, LayerRecord, LayerStore};
pub use materialize::{DirectoryBackfiller, LowerLayersBackfiller};
pub use source::{BlobSource, FileBlobSource, ImageSourceChunk, MemoryBlobSource};
pub use toc::{EntryType, FileMetadata, Toc, unmarshal_toc};
