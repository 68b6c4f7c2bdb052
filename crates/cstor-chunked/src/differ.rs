//! Applying a zstd:chunked layer.
//!
//! [`ChunkedDiffer`] reconstructs a layer from a blob it can only read by
//! range. After fetching and verifying the manifest it walks the TOC once,
//! deciding for every regular file where its bytes come from:
//!
//! 1. a file with the same content (and, for hard links, the same owner, mode
//!    and xattrs) in a layer that is already in the store,
//! 2. for each chunk: a hole, the same chunk in a stored layer, or the blob,
//!
//! and creating everything that needs no content right away. The chunks that
//! must come from the blob are then coalesced into ranges and fetched in
//! parallel; each stream is decompressed straight into the files waiting for
//! it. Files are verified against their digest before their attributes are
//! applied. Hard links and directory attributes come last.
//!
//! Nothing here is recorded as a layer: the caller owns the destination
//! directory and discards it on error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use oci_spec::image::Descriptor;
use rustix::fs::{Mode, OFlags};

use crate::cache::{CACHE_KEY, CacheFile, Candidate, LayersCache, TAR_SPLIT_KEY, TOC_KEY};
use crate::composefs::{
    COMPOSEFS_DATA_DIR, composefs_supported, enable_verity_recursive, generate_composefs_blob,
    object_path,
};
use crate::config::PullOptions;
use crate::digest::{Digester, verify_digest};
use crate::error::{ChunkedError, Result};
use crate::fetcher::{CancellationToken, FetchOptions, FetchStats, fetch_ranges};
use crate::format::{ChunkedManifest, read_zstd_chunked_manifest};
use crate::layer_store::LayerStore;
use crate::materialize::{
    AttrOptions, DirectoryBackfiller, append_hole, apply_file_attributes, apply_path_attributes,
    copy_file_content, copy_range, create_file_under_root, mkdir_parents, open_dir_under_root,
    open_file_under_root, safe_link, safe_mkdir, safe_mknod, safe_symlink,
};
use crate::readatreader::{ReadAtReader, WriteAtWriter};
use crate::source::{BlobSource, ImageSourceChunk};
use crate::toc::{EntryType, FileChunk, FileMetadata, MergedEntry, Toc, merge_toc_entries};

const DECODE_BUF_SIZE: usize = 128 * 1024;

/// What the differ produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// A directory tree ready to be used as an overlay layer.
    #[default]
    Dir,
    /// A flat object store plus a composefs image.
    Composefs,
}

/// Options for [`ChunkedDiffer::apply_diff`].
#[derive(Clone, Default)]
pub struct DifferOptions {
    /// Pull options from `storage.conf`.
    pub pull: PullOptions,
    /// Output format.
    pub format: OutputFormat,
    /// ID of the layer being created; it never serves as a dedup source.
    pub layer_id: Option<String>,
    /// Attributes for parent directories the TOC does not list.
    pub backfiller: Option<Arc<dyn DirectoryBackfiller + Send + Sync>>,
    /// Aborts the pull when cancelled.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for DifferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DifferOptions")
            .field("pull", &self.pull)
            .field("format", &self.format)
            .field("layer_id", &self.layer_id)
            .field("backfiller", &self.backfiller.is_some())
            .finish()
    }
}

impl DifferOptions {
    /// Options derived from `pull_options`; the format follows
    /// `enable_composefs`.
    pub fn from_pull_options(pull: PullOptions) -> Self {
        let format = if pull.enable_composefs {
            OutputFormat::Composefs
        } else {
            OutputFormat::Dir
        };
        Self {
            pull,
            format,
            ..Default::default()
        }
    }
}

/// Where the content of a layer came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DifferStats {
    /// Files hard linked from another layer.
    pub hardlinked_files: u64,
    /// Files reflinked or copied whole from another layer.
    pub copied_files: u64,
    /// Chunks copied from another layer.
    pub chunks_from_cache: u64,
    /// Chunks materialized as holes.
    pub holes: u64,
    /// Chunks read from the blob, counted per file.
    pub remote_chunks: u64,
    /// Files with at least one chunk read from the blob.
    pub remote_files: u64,
    /// Hard link entries created.
    pub hardlinks: u64,
    /// Device nodes and fifos skipped because mknod was not permitted.
    pub skipped_devices: u64,
    /// Counters of the range fetch.
    pub fetch: FetchStats,
}

/// Result of [`ChunkedDiffer::apply_diff`].
#[derive(Debug, Clone)]
pub struct DifferOutput {
    /// Digest of the compressed manifest.
    pub toc_digest: String,
    /// Digest of the compressed blob.
    pub compressed_digest: String,
    /// The uncompressed manifest.
    pub manifest: Vec<u8>,
    /// The compressed tar-split.
    pub tar_split: Vec<u8>,
    /// Big data to store with the new layer.
    pub big_data: HashMap<String, Vec<u8>>,
    /// Where the content came from.
    pub stats: DifferStats,
    /// Format of what was written.
    pub format: OutputFormat,
    /// Composefs image, when one was built.
    pub composefs_blob: Option<PathBuf>,
}

impl DifferOutput {
    /// Store the big data with `layer_id`.
    pub fn commit(&self, store: &dyn LayerStore, layer_id: &str) -> Result<()> {
        let mut keys: Vec<&String> = self.big_data.keys().collect();
        keys.sort();
        for key in keys {
            store.set_layer_big_data(layer_id, key, &self.big_data[key])?;
        }
        Ok(())
    }
}

/// A compressed range together with the chunk ranges it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MergedRange {
    pub(crate) range: ImageSourceChunk,
    pub(crate) parts: Vec<ImageSourceChunk>,
}

/// Merge sorted, non-overlapping ranges.
///
/// Touching ranges always merge. If more than `max_ranges` remain, the
/// smallest gaps are merged too, so the extra bytes read are kept low.
pub(crate) fn coalesce_ranges(ranges: &[ImageSourceChunk], max_ranges: usize) -> Vec<MergedRange> {
    let mut groups: Vec<MergedRange> = Vec::new();
    for r in ranges {
        match groups.last_mut() {
            Some(last) if last.range.end() == r.offset => {
                last.range.length += r.length;
                last.parts.push(*r);
            }
            _ => groups.push(MergedRange {
                range: *r,
                parts: vec![*r],
            }),
        }
    }
    let max_ranges = max_ranges.max(1);
    if groups.len() <= max_ranges {
        return groups;
    }

    let mut gaps: Vec<(u64, usize)> = groups
        .windows(2)
        .enumerate()
        .map(|(i, w)| (w[1].range.offset - w[0].range.end(), i))
        .collect();
    gaps.sort_unstable();
    let merge: HashSet<usize> = gaps
        .iter()
        .take(groups.len() - max_ranges)
        .map(|(_, i)| *i)
        .collect();

    let mut out: Vec<MergedRange> = Vec::with_capacity(max_ranges);
    for (i, group) in groups.into_iter().enumerate() {
        match out.last_mut() {
            Some(last) if merge.contains(&(i - 1)) => {
                last.range.length = group.range.end() - last.range.offset;
                last.parts.extend(group.parts);
            }
            _ => out.push(group),
        }
    }
    out
}

/// One file waiting for a chunk.
#[derive(Debug, Clone, Copy)]
struct RemoteTarget {
    file: usize,
    chunk_offset: u64,
    size: u64,
}

/// A regular file whose content is still arriving.
#[derive(Debug)]
struct PendingFile {
    meta: FileMetadata,
    file: File,
    /// Tree output applies the TOC attributes; objects only get a fixed mode.
    apply_attrs: bool,
}

fn map_decode_error(e: io::Error) -> ChunkedError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ChunkedError::RemoteFetch(format!("compressed chunk cut short: {}", e))
    } else {
        ChunkedError::format(format!("decompressing chunk: {}", e))
    }
}

/// Decompress one chunk into every file waiting for it.
fn decompress_chunk(
    compressed: &mut dyn Read,
    targets: &[RemoteTarget],
    pending: &[PendingFile],
) -> Result<()> {
    let expected = targets.first().map_or(0, |t| t.size);
    let mut writers: Vec<WriteAtWriter<'_>> = targets
        .iter()
        .map(|t| WriteAtWriter::new(&pending[t.file].file, t.chunk_offset))
        .collect();
    let mut decoder = zstd::stream::read::Decoder::new(compressed)?;
    let mut buf = vec![0u8; DECODE_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = decoder.read(&mut buf).map_err(map_decode_error)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if total > expected {
            return Err(ChunkedError::format(format!(
                "chunk decompresses to more than {} bytes",
                expected
            )));
        }
        for w in writers.iter_mut() {
            w.write_all(&buf[..n])?;
        }
    }
    if total != expected {
        return Err(ChunkedError::format(format!(
            "chunk decompressed to {} bytes, expected {}",
            total, expected
        )));
    }
    Ok(())
}

/// Split a delivered stream into its chunks.
fn consume_range(
    range: ImageSourceChunk,
    parts: &[ImageSourceChunk],
    stream: &mut dyn Read,
    remote: &BTreeMap<ImageSourceChunk, Vec<RemoteTarget>>,
    pending: &[PendingFile],
) -> Result<()> {
    let mut pos = range.offset;
    for part in parts {
        let gap = part.offset - pos;
        if gap > 0 {
            let skipped = io::copy(&mut (&mut *stream).take(gap), &mut io::sink())?;
            if skipped != gap {
                return Err(ChunkedError::RemoteFetch(format!(
                    "range {}+{} ended early",
                    range.offset, range.length
                )));
            }
        }
        let targets = remote.get(part).map(Vec::as_slice).unwrap_or_default();
        let mut limited = (&mut *stream).take(part.length);
        decompress_chunk(&mut limited, targets, pending)?;
        // Trailing bytes inside the range, e.g. skippable frames.
        io::copy(&mut limited, &mut io::sink())?;
        pos = part.end();
    }
    Ok(())
}

/// Per-invocation state while a layer is being applied.
struct ApplyState<'a> {
    store: &'a dyn LayerStore,
    root: &'a Dir,
    cache: &'a LayersCache,
    attrs: AttrOptions,
    use_hard_links: bool,
    backfiller: Option<&'a dyn DirectoryBackfiller>,
    cancel: &'a CancellationToken,
    layer_dirs: HashMap<String, Option<Dir>>,
    pending: Vec<PendingFile>,
    remote: BTreeMap<ImageSourceChunk, Vec<RemoteTarget>>,
    dirs: Vec<FileMetadata>,
    hardlinks: Vec<FileMetadata>,
    objects: HashSet<String>,
    stats: DifferStats,
}

impl<'a> ApplyState<'a> {
    fn open_candidate(&mut self, candidate: &Candidate, min_len: u64) -> Option<File> {
        let store = self.store;
        let dir = self
            .layer_dirs
            .entry(candidate.layer_id.clone())
            .or_insert_with(|| match store.open_layer_dir(&candidate.layer_id) {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::warn!("cannot open layer {}: {}", candidate.layer_id, e);
                    None
                }
            })
            .as_ref()?;
        let file = match open_file_under_root(
            dir,
            &candidate.location.name,
            OFlags::RDONLY | OFlags::NOFOLLOW,
            0,
        ) {
            Ok(f) => f,
            Err(e) => {
                tracing::trace!(
                    "cache candidate {:?} in layer {} unusable: {}",
                    candidate.location.name,
                    candidate.layer_id,
                    e
                );
                return None;
            }
        };
        match file.metadata() {
            Ok(m) if m.is_file() && m.len() >= min_len => Some(file),
            _ => None,
        }
    }

    /// Materialize `meta` from a whole file in another layer.
    ///
    /// Returns the new file and whether it is a hard link.
    fn try_whole_file(
        &mut self,
        meta: &FileMetadata,
        dest_name: &str,
        mode: u32,
        link_by_digest: bool,
    ) -> Result<Option<(File, bool)>> {
        let whole = |c: &Candidate| c.location.offset == 0 && c.location.size == meta.size;

        if self.use_hard_links {
            let candidates: Vec<Candidate> = if link_by_digest {
                self.cache.find(&meta.digest).filter(whole).collect()
            } else {
                self.cache
                    .find_by_fingerprint(meta)
                    .into_iter()
                    .filter(whole)
                    .collect()
            };
            for candidate in &candidates {
                let Some(src) = self.open_candidate(candidate, meta.size) else {
                    continue;
                };
                let (file, _) =
                    copy_file_content(&src, meta.size, self.root, dest_name, mode, true)?;
                let linked = rustix::fs::fstat(&src)?.st_ino == rustix::fs::fstat(&file)?.st_ino;
                tracing::trace!(
                    "{:?}: {} from layer {}",
                    dest_name,
                    if linked { "linked" } else { "copied" },
                    candidate.layer_id
                );
                return Ok(Some((file, linked)));
            }
        }

        let candidates: Vec<Candidate> = self.cache.find(&meta.digest).filter(whole).collect();
        for candidate in &candidates {
            let Some(src) = self.open_candidate(candidate, meta.size) else {
                continue;
            };
            let (file, _) = copy_file_content(&src, meta.size, self.root, dest_name, mode, false)?;
            tracing::trace!("{:?}: copied from layer {}", dest_name, candidate.layer_id);
            return Ok(Some((file, false)));
        }
        Ok(None)
    }

    /// Copy one chunk from another layer.
    fn copy_chunk_from_cache(&mut self, chunk: &FileChunk, dst: &File) -> Result<bool> {
        let candidates: Vec<Candidate> = self
            .cache
            .find(&chunk.digest)
            .filter(|c| c.location.size == chunk.size)
            .collect();
        for candidate in &candidates {
            let Some(src) = self.open_candidate(candidate, candidate.location.offset + chunk.size)
            else {
                continue;
            };
            match copy_range(&src, candidate.location.offset, dst, chunk.chunk_offset, chunk.size) {
                Ok(_) => return Ok(true),
                Err(e) => tracing::trace!(
                    "copying chunk {} from layer {}: {}",
                    chunk.digest,
                    candidate.layer_id,
                    e
                ),
            }
        }
        Ok(false)
    }

    fn plan_regular(
        &mut self,
        entry: &MergedEntry,
        dest_name: &str,
        mode: u32,
        apply_attrs: bool,
    ) -> Result<()> {
        let meta = &entry.meta;
        if meta.size == 0 {
            let file = create_file_under_root(self.root, dest_name, mode)?;
            return self.finish_file(&PendingFile {
                meta: meta.clone(),
                file,
                apply_attrs,
            });
        }

        if let Some((file, linked)) = self.try_whole_file(meta, dest_name, mode, !apply_attrs)? {
            if linked {
                self.stats.hardlinked_files += 1;
            } else {
                self.stats.copied_files += 1;
                if apply_attrs {
                    apply_file_attributes(&file, meta, &self.attrs)?;
                }
            }
            return Ok(());
        }

        let mut file = create_file_under_root(self.root, dest_name, mode)?;
        let index = self.pending.len();
        let mut needs_fetch = false;
        for chunk in &entry.chunks {
            if chunk.is_hole() {
                file.seek(SeekFrom::Start(chunk.chunk_offset))?;
                append_hole(&mut file, chunk.size)?;
                self.stats.holes += 1;
                continue;
            }
            if self.copy_chunk_from_cache(chunk, &file)? {
                self.stats.chunks_from_cache += 1;
                continue;
            }
            let range = ImageSourceChunk::new(chunk.offset, chunk.end_offset - chunk.offset);
            let targets = self.remote.entry(range).or_default();
            if targets.first().is_some_and(|t| t.size != chunk.size) {
                return Err(ChunkedError::format(format!(
                    "range {}+{} is used with different sizes",
                    range.offset, range.length
                )));
            }
            targets.push(RemoteTarget {
                file: index,
                chunk_offset: chunk.chunk_offset,
                size: chunk.size,
            });
            self.stats.remote_chunks += 1;
            needs_fetch = true;
        }

        let pending = PendingFile {
            meta: meta.clone(),
            file,
            apply_attrs,
        };
        if needs_fetch {
            tracing::trace!("{:?}: waiting for remote chunks", dest_name);
            self.stats.remote_files += 1;
            self.pending.push(pending);
            Ok(())
        } else {
            self.finish_file(&pending)
        }
    }

    /// Verify content that was not copied whole and apply attributes.
    fn finish_file(&self, pending: &PendingFile) -> Result<()> {
        let meta = &pending.meta;
        if pending.file.metadata()?.len() != meta.size {
            pending.file.set_len(meta.size)?;
        }
        if meta.size > 0 {
            let mut digester = Digester::new();
            let copied = io::copy(
                &mut ReadAtReader::with_range(&pending.file, 0, meta.size),
                &mut digester,
            )?;
            if copied != meta.size {
                return Err(ChunkedError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{:?}: read {} of {} bytes", meta.name, copied, meta.size),
                )));
            }
            verify_digest(&meta.digest, &digester.finish())?;
        }
        if pending.apply_attrs {
            apply_file_attributes(&pending.file, meta, &self.attrs)
        } else {
            Ok(rustix::fs::fchmod(&pending.file, Mode::from_raw_mode(0o644))?)
        }
    }

    fn plan_tree(&mut self, entries: &[MergedEntry]) -> Result<()> {
        for entry in entries {
            self.cancel.check()?;
            let meta = &entry.meta;
            if !meta.name.is_empty() {
                mkdir_parents(self.root, &meta.name, self.backfiller, &self.attrs)?;
            }
            match meta.entry_type {
                EntryType::Dir => {
                    if !meta.name.is_empty() {
                        safe_mkdir(self.root, &meta.name, 0o755)?;
                    }
                    self.dirs.push(meta.clone());
                }
                EntryType::Reg => self.plan_regular(entry, &meta.name, 0o600, true)?,
                EntryType::Symlink => {
                    safe_symlink(self.root, &meta.link_name, &meta.name)?;
                    apply_path_attributes(self.root, meta, &self.attrs)?;
                }
                EntryType::Char | EntryType::Block | EntryType::Fifo => {
                    match safe_mknod(self.root, meta) {
                        Ok(()) => apply_path_attributes(self.root, meta, &self.attrs)?,
                        Err(e)
                            if self.attrs.ignore_chown_errors
                                && e.raw_os_error() == Some(libc::EPERM) =>
                        {
                            tracing::warn!("skipping device {:?}: {}", meta.name, e);
                            self.stats.skipped_devices += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                EntryType::Hardlink => self.hardlinks.push(meta.clone()),
                EntryType::Chunk => {
                    return Err(ChunkedError::format(format!(
                        "stray chunk entry for {:?}",
                        meta.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn plan_objects(&mut self, entries: &[MergedEntry]) -> Result<()> {
        let object_attrs = AttrOptions::default();
        for entry in entries {
            self.cancel.check()?;
            let meta = &entry.meta;
            if meta.entry_type != EntryType::Reg || meta.size == 0 {
                continue;
            }
            let object = object_path(&meta.digest)?;
            if !self.objects.insert(object.clone()) {
                continue;
            }
            mkdir_parents(self.root, &object, None, &object_attrs)?;
            self.plan_regular(entry, &object, 0o644, false)?;
        }
        Ok(())
    }

    fn fetch(&mut self, source: &dyn BlobSource, pull: &PullOptions) -> Result<()> {
        if self.remote.is_empty() {
            return Ok(());
        }
        let ranges: Vec<ImageSourceChunk> = self.remote.keys().copied().collect();
        if let Some(w) = ranges.windows(2).find(|w| w[1].offset < w[0].end()) {
            return Err(ChunkedError::format(format!(
                "overlapping chunk ranges {}+{} and {}+{}",
                w[0].offset, w[0].length, w[1].offset, w[1].length
            )));
        }
        let merged = coalesce_ranges(&ranges, pull.max_missing_ranges);
        tracing::debug!(
            "{} chunks missing, fetching {} ranges",
            ranges.len(),
            merged.len()
        );
        let requests: Vec<ImageSourceChunk> = merged.iter().map(|m| m.range).collect();
        let parts: HashMap<ImageSourceChunk, Vec<ImageSourceChunk>> =
            merged.into_iter().map(|m| (m.range, m.parts)).collect();

        let options = FetchOptions {
            max_concurrent_streams: pull.max_concurrent_streams,
            max_ranges_per_request: pull.max_ranges_per_request,
        };
        let remote = &self.remote;
        let pending = &self.pending;
        let stats = fetch_ranges(source, &requests, &options, self.cancel, |range, stream| {
            let parts = parts.get(&range).ok_or_else(|| {
                ChunkedError::RemoteFetch(format!(
                    "unexpected range {}+{}",
                    range.offset, range.length
                ))
            })?;
            consume_range(range, parts, stream, remote, pending)
        })?;
        self.stats.fetch = stats;

        for pending in std::mem::take(&mut self.pending) {
            self.finish_file(&pending)?;
        }
        Ok(())
    }

    fn create_hardlinks(&mut self) -> Result<()> {
        for meta in std::mem::take(&mut self.hardlinks) {
            mkdir_parents(self.root, &meta.name, self.backfiller, &self.attrs)?;
            safe_link(self.root, &meta.link_name, &meta.name)?;
            self.stats.hardlinks += 1;
        }
        Ok(())
    }

    /// Apply directory attributes, children before parents, so the final
    /// timestamps are not touched by later creations.
    fn finish_dirs(&mut self) -> Result<()> {
        for meta in std::mem::take(&mut self.dirs).iter().rev() {
            let dir = open_dir_under_root(self.root, &meta.name)?;
            apply_file_attributes(&dir, meta, &self.attrs)?;
        }
        Ok(())
    }
}

/// Differ for one zstd:chunked blob.
pub struct ChunkedDiffer<'a> {
    source: &'a dyn BlobSource,
    blob_digest: String,
    blob_size: u64,
    manifest: ChunkedManifest,
}

impl std::fmt::Debug for ChunkedDiffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedDiffer")
            .field("blob_digest", &self.blob_digest)
            .field("blob_size", &self.blob_size)
            .field("toc_digest", &self.manifest.toc_digest)
            .finish()
    }
}

impl<'a> ChunkedDiffer<'a> {
    /// Fetch and verify the manifest of the blob.
    ///
    /// Fails with [`ChunkedError::Unsupported`] when the annotations do not
    /// describe a zstd:chunked blob.
    pub fn new(
        source: &'a dyn BlobSource,
        blob_digest: &str,
        blob_size: u64,
        annotations: &HashMap<String, String>,
    ) -> Result<Self> {
        let manifest = read_zstd_chunked_manifest(source, blob_size, annotations)?;
        Ok(Self {
            source,
            blob_digest: blob_digest.to_string(),
            blob_size,
            manifest,
        })
    }

    /// Differ for the layer described by an OCI descriptor.
    pub fn from_descriptor(source: &'a dyn BlobSource, descriptor: &Descriptor) -> Result<Self> {
        let annotations = descriptor.annotations().clone().unwrap_or_default();
        Self::new(
            source,
            &descriptor.digest().to_string(),
            descriptor.size() as u64,
            &annotations,
        )
    }

    /// The verified TOC.
    pub fn toc(&self) -> &Toc {
        &self.manifest.toc
    }

    /// Digest of the compressed manifest.
    pub fn toc_digest(&self) -> &str {
        &self.manifest.toc_digest
    }

    /// Materialize the layer under `dest`.
    ///
    /// `dest` is created if needed and should be empty. On error its content
    /// is unspecified and the caller must discard it.
    pub fn apply_diff(
        &self,
        store: &dyn LayerStore,
        dest: &Path,
        options: &DifferOptions,
    ) -> Result<DifferOutput> {
        if !options.pull.enable_partial_images {
            return Err(ChunkedError::Unsupported(
                "partial images are disabled".to_string(),
            ));
        }
        if options.format == OutputFormat::Composefs {
            composefs_supported()?;
        }
        options.cancel.check()?;

        let toc = &self.manifest.toc;
        let entries = merge_toc_entries(&toc.entries, self.blob_size)?;
        std::fs::create_dir_all(dest)?;
        let root = Dir::open_ambient_dir(dest, ambient_authority())?;
        let cache = LayersCache::load(store, options.layer_id.as_deref())?;
        tracing::debug!(
            "applying {} entries of {} with {} cached layers",
            entries.len(),
            self.blob_digest,
            cache.layer_count()
        );

        let mut state = ApplyState {
            store,
            root: &root,
            cache: &cache,
            attrs: AttrOptions {
                ignore_chown_errors: options.pull.ignore_chown_errors,
                force_mask: options.pull.force_mask,
            },
            use_hard_links: options.pull.use_hard_links,
            backfiller: options
                .backfiller
                .as_deref()
                .map(|b| b as &dyn DirectoryBackfiller),
            cancel: &options.cancel,
            layer_dirs: HashMap::new(),
            pending: Vec::new(),
            remote: BTreeMap::new(),
            dirs: Vec::new(),
            hardlinks: Vec::new(),
            objects: HashSet::new(),
            stats: DifferStats::default(),
        };

        let mut composefs_blob = None;
        match options.format {
            OutputFormat::Dir => {
                state.plan_tree(&entries)?;
                state.fetch(self.source, &options.pull)?;
                state.create_hardlinks()?;
                state.finish_dirs()?;
            }
            OutputFormat::Composefs => {
                state.plan_objects(&entries)?;
                state.fetch(self.source, &options.pull)?;
                let verity = match enable_verity_recursive(dest) {
                    Ok(digests) => digests,
                    Err(e) => {
                        tracing::warn!("continuing without fs-verity: {}", e);
                        HashMap::new()
                    }
                };
                composefs_blob = Some(generate_composefs_blob(
                    toc,
                    &verity,
                    &dest.join(COMPOSEFS_DATA_DIR),
                )?);
            }
        }
        let stats = state.stats;
        tracing::debug!("layer applied: {:?}", stats);

        let mut big_data = HashMap::new();
        big_data.insert(TOC_KEY.to_string(), self.manifest.manifest.clone());
        big_data.insert(CACHE_KEY.to_string(), CacheFile::build(toc)?.to_bytes()?);
        if !self.manifest.tar_split.is_empty() {
            big_data.insert(TAR_SPLIT_KEY.to_string(), self.manifest.tar_split.clone());
        }

        Ok(DifferOutput {
            toc_digest: self.manifest.toc_digest.clone(),
            compressed_digest: self.blob_digest.clone(),
            manifest: self.manifest.manifest.clone(),
            tar_split: self.manifest.tar_split.clone(),
            big_data,
            stats,
            format: options.format,
            composefs_blob,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::compress;
    use crate::config::CompressorOptions;
    use crate::layer_store::DirLayerStore;
    use crate::source::MemoryBlobSource;

    fn r(offset: u64, length: u64) -> ImageSourceChunk {
        ImageSourceChunk::new(offset, length)
    }

    #[test]
    fn test_truncated_chunk_is_a_fetch_error() {
        let short = map_decode_error(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert!(matches!(short, ChunkedError::RemoteFetch(_)), "{:?}", short);
        let garbage = map_decode_error(io::Error::new(io::ErrorKind::InvalidData, "bad"));
        assert!(matches!(garbage, ChunkedError::Format(_)), "{:?}", garbage);
    }

    #[test]
    fn test_coalesce_touching_ranges() {
        let merged = coalesce_ranges(&[r(0, 10), r(10, 5), r(20, 5)], 100);
        assert_eq!(
            merged,
            vec![
                MergedRange {
                    range: r(0, 15),
                    parts: vec![r(0, 10), r(10, 5)],
                },
                MergedRange {
                    range: r(20, 5),
                    parts: vec![r(20, 5)],
                },
            ]
        );
    }

    #[test]
    fn test_coalesce_merges_smallest_gaps() {
        let ranges = [r(0, 10), r(100, 10), r(112, 10), r(200, 10), r(205 + 10, 10)];
        let merged = coalesce_ranges(&ranges, 2);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].range, r(0, 10));
        assert_eq!(merged[1].range, r(100, 125));
        assert_eq!(merged[1].parts.len(), 4);
        let total: usize = merged.iter().map(|m| m.parts.len()).sum();
        assert_eq!(total, ranges.len());
    }

    fn pseudo_random(len: usize, mut seed: u32) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            })
            .collect()
    }

    fn build_blob(content: &[u8]) -> (Vec<u8>, crate::compressor::CompressionOutput) {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        builder.append_data(&mut dir, "app/", &b""[..]).unwrap();
        let mut h = tar::Header::new_gnu();
        h.set_mode(0o644);
        h.set_size(content.len() as u64);
        h.set_mtime(1_700_000_000);
        builder.append_data(&mut h, "app/data", content).unwrap();
        let tar = builder.into_inner().unwrap();

        let mut blob = Vec::new();
        let options = CompressorOptions {
            rollsum_bits: 8,
            ..Default::default()
        };
        let out = compress(&tar[..], &mut blob, &options).unwrap();
        (blob, out)
    }

    fn options() -> DifferOptions {
        DifferOptions {
            pull: PullOptions {
                ignore_chown_errors: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_from_blob() {
        let content = pseudo_random(20_000, 11);
        let (blob, out) = build_blob(&content);
        let source = MemoryBlobSource::new(blob);
        let tmp = tempfile::tempdir().unwrap();
        let store = DirLayerStore::open(tmp.path().join("store")).unwrap();

        let differ =
            ChunkedDiffer::new(&source, "sha256:blob", source.size(), &out.annotations).unwrap();
        assert_eq!(differ.toc_digest(), out.toc_digest);
        let dest = tmp.path().join("dest");
        let result = differ.apply_diff(&store, &dest, &options()).unwrap();

        assert_eq!(std::fs::read(dest.join("app/data")).unwrap(), content);
        assert!(result.stats.remote_chunks >= 2);
        assert_eq!(result.stats.remote_files, 1);
        assert!(result.stats.fetch.ranges >= 1);
        assert!(result.big_data.contains_key(TOC_KEY));
        assert!(result.big_data.contains_key(CACHE_KEY));
        assert!(result.big_data.contains_key(TAR_SPLIT_KEY));
    }

    #[test]
    fn test_from_descriptor() {
        let (blob, out) = build_blob(b"described");
        let blob_digest = crate::digest::sha256_digest(&blob);
        let descriptor: Descriptor = serde_json::from_value(serde_json::json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar+zstd",
            "digest": blob_digest,
            "size": blob.len(),
            "annotations": out.annotations,
        }))
        .unwrap();
        let source = MemoryBlobSource::new(blob);
        let differ = ChunkedDiffer::from_descriptor(&source, &descriptor).unwrap();
        assert_eq!(differ.toc_digest(), out.toc_digest);
        assert_eq!(differ.toc().entries.len(), out.toc.entries.len());
    }

    #[test]
    fn test_partial_images_disabled() {
        let (blob, out) = build_blob(b"abc");
        let source = MemoryBlobSource::new(blob);
        let tmp = tempfile::tempdir().unwrap();
        let store = DirLayerStore::open(tmp.path().join("store")).unwrap();
        let differ =
            ChunkedDiffer::new(&source, "sha256:blob", source.size(), &out.annotations).unwrap();
        let mut opts = options();
        opts.pull.enable_partial_images = false;
        assert!(matches!(
            differ.apply_diff(&store, &tmp.path().join("dest"), &opts),
            Err(ChunkedError::Unsupported(_))
        ));
    }

    #[test]
    fn test_cancelled_before_start() {
        let (blob, out) = build_blob(b"abc");
        let source = MemoryBlobSource::new(blob);
        let tmp = tempfile::tempdir().unwrap();
        let store = DirLayerStore::open(tmp.path().join("store")).unwrap();
        let differ =
            ChunkedDiffer::new(&source, "sha256:blob", source.size(), &out.annotations).unwrap();
        let opts = options();
        opts.cancel.cancel();
        assert!(matches!(
            differ.apply_diff(&store, &tmp.path().join("dest"), &opts),
            Err(ChunkedError::Cancelled)
        ));
    }

    #[test]
    fn test_chunks_reused_from_stored_layer() {
        let content = pseudo_random(20_000, 12);
        let (blob, out) = build_blob(&content);
        let tmp = tempfile::tempdir().unwrap();
        let store = DirLayerStore::open(tmp.path().join("store")).unwrap();

        // Store a first copy of the layer.
        let source = MemoryBlobSource::new(blob.clone());
        let differ =
            ChunkedDiffer::new(&source, "sha256:blob", source.size(), &out.annotations).unwrap();
        store.create_layer(Some("first"), None).unwrap();
        let first = differ
            .apply_diff(&store, &store.layer_diff_path("first"), &options())
            .unwrap();
        first.commit(&store, "first").unwrap();

        // Only the first chunk differs.
        let mut modified = content.clone();
        modified[0] ^= 0xff;
        let (blob2, out2) = build_blob(&modified);
        let source2 = MemoryBlobSource::new(blob2);
        let differ2 =
            ChunkedDiffer::new(&source2, "sha256:blob2", source2.size(), &out2.annotations)
                .unwrap();
        let dest = tmp.path().join("second");
        let second = differ2.apply_diff(&store, &dest, &options()).unwrap();
        assert_eq!(std::fs::read(dest.join("app/data")).unwrap(), modified);
        assert!(second.stats.chunks_from_cache >= 1);
        assert!(second.stats.fetch.bytes < first.stats.fetch.bytes);
    }
}
