//! Cross-layer content cache.
//!
//! For every layer already in the store the differ wants to know, quickly,
//! whether it holds a file or a chunk with a given digest. Each layer carries a
//! cache file in its big data (key [`CACHE_KEY`]) built from its TOC:
//!
//! ```text
//! u64 version | u64 tagLen | u64 digestLen
//! u64 bloomWords | u64 bloomHashes | bloomWords × u64
//! u64 tagsLen | u64 vdataLen | tags | vdata
//! ```
//!
//! All integers are little endian. `tags` is a table of fixed-width records
//! sorted by binary digest (see [`crate::digest`]), each pointing at a
//! location string in `vdata` of the form `<offset>:<size>:<name>`.
//!
//! Three kinds of digests are indexed: whole-file digests, chunk digests and
//! a hardlink fingerprint combining the file digest with its ownership, mode
//! and xattrs. A fingerprint hit means the file can be hard linked as is; a
//! digest hit only means the bytes can be copied.

use std::collections::HashSet;
use std::io::Write;

use sha2::{Digest as _, Sha256};

use crate::bloom::{BloomFilter, DEFAULT_HASHES};
use crate::digest::{
    BINARY_DIGEST_LEN, SHA256_PREFIX, append_tag, digest_to_binary, find_tag, tag_len,
};
use crate::error::{ChunkedError, Result};
use crate::layer_store::LayerStore;
use crate::toc::{EntryType, FileMetadata, Toc, merge_toc_entries, unmarshal_toc};

/// Version of the cache file layout.
pub const CACHE_VERSION: u64 = 3;

/// Big data key of the cache file.
pub const CACHE_KEY: &str = "chunked-manifest-cache";

/// Big data key of the layer's TOC.
pub const TOC_KEY: &str = "zstd-chunked-manifest";

/// Big data key of the layer's tar-split.
pub const TAR_SPLIT_KEY: &str = "zstd-chunked-tar-split";

/// Where a digest can be found inside a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    /// Offset inside the file.
    pub offset: u64,
    /// Number of bytes.
    pub size: u64,
    /// Cleaned path of the file inside the layer.
    pub name: String,
}

impl CacheLocation {
    fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let offset = parts.next()?.parse().ok()?;
        let size = parts.next()?.parse().ok()?;
        let name = parts.next()?.to_string();
        Some(Self { offset, size, name })
    }
}

/// Fingerprint used to find files that can be hard linked.
///
/// Two files with the same fingerprint have the same content, owner, mode and
/// extended attributes.
pub fn hardlink_fingerprint(meta: &FileMetadata) -> Option<String> {
    if meta.digest.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(meta.digest.as_bytes());
    hasher.update(format!("{}:{}:{:o}", meta.uid, meta.gid, meta.mode).as_bytes());
    // BTreeMap iteration is sorted by key
    for (k, v) in &meta.xattrs {
        hasher.update(k.as_bytes());
        hasher.update(v.as_bytes());
    }
    Some(format!("{}{}", SHA256_PREFIX, hex::encode(hasher.finalize())))
}

/// Decoded cache file of one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFile {
    digest_len: usize,
    bloom: BloomFilter,
    tags: Vec<u8>,
    vdata: Vec<u8>,
}

fn read_u64(data: &[u8], pos: &mut usize) -> Result<u64> {
    let end = pos
        .checked_add(8)
        .filter(|e| *e <= data.len())
        .ok_or_else(|| ChunkedError::CacheCorrupt("cache file is truncated".to_string()))?;
    let v = u64::from_le_bytes(data[*pos..end].try_into().map_err(|_| {
        ChunkedError::CacheCorrupt("cache file is truncated".to_string())
    })?);
    *pos = end;
    Ok(v)
}

fn read_slice<'a>(data: &'a [u8], pos: &mut usize, len: u64) -> Result<&'a [u8]> {
    let end = usize::try_from(len)
        .ok()
        .and_then(|l| pos.checked_add(l))
        .filter(|e| *e <= data.len())
        .ok_or_else(|| ChunkedError::CacheCorrupt("cache file is truncated".to_string()))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

impl CacheFile {
    /// Index the entries of a TOC.
    pub fn build(toc: &Toc) -> Result<Self> {
        let merged = merge_toc_entries(&toc.entries, u64::MAX)?;

        let mut records: Vec<(Vec<u8>, String)> = Vec::new();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut push = |digest: &str, location: String| -> Result<()> {
            let bin = digest_to_binary(digest)?;
            if seen.insert(bin.clone()) {
                records.push((bin, location));
            }
            Ok(())
        };

        for entry in &merged {
            let meta = &entry.meta;
            if meta.entry_type != EntryType::Reg || meta.size == 0 {
                continue;
            }
            let whole = format!("0:{}:{}", meta.size, meta.name);
            push(&meta.digest, whole.clone())?;
            if let Some(fp) = hardlink_fingerprint(meta) {
                push(&fp, whole)?;
            }
            for chunk in entry.chunks.iter().filter(|c| !c.is_hole()) {
                push(
                    &chunk.digest,
                    format!("{}:{}:{}", chunk.chunk_offset, chunk.size, meta.name),
                )?;
            }
        }

        records.sort_by(|a, b| a.0.cmp(&b.0));

        let mut bloom = BloomFilter::new(records.len(), DEFAULT_HASHES);
        let mut tags = Vec::with_capacity(records.len() * tag_len(BINARY_DIGEST_LEN));
        let mut vdata = Vec::new();
        for (bin, location) in &records {
            bloom.add(bin);
            append_tag(&mut tags, bin, vdata.len() as u64, location.len() as u64);
            vdata.extend_from_slice(location.as_bytes());
        }

        Ok(Self {
            digest_len: BINARY_DIGEST_LEN,
            bloom,
            tags,
            vdata,
        })
    }

    /// Number of indexed digests.
    pub fn len(&self) -> usize {
        self.tags.len() / tag_len(self.digest_len)
    }

    /// Whether nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Serialize the cache file.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&CACHE_VERSION.to_le_bytes())?;
        w.write_all(&(tag_len(self.digest_len) as u64).to_le_bytes())?;
        w.write_all(&(self.digest_len as u64).to_le_bytes())?;

        w.write_all(&(self.bloom.words().len() as u64).to_le_bytes())?;
        w.write_all(&u64::from(self.bloom.hashes()).to_le_bytes())?;
        for word in self.bloom.words() {
            w.write_all(&word.to_le_bytes())?;
        }

        w.write_all(&(self.tags.len() as u64).to_le_bytes())?;
        w.write_all(&(self.vdata.len() as u64).to_le_bytes())?;
        w.write_all(&self.tags)?;
        w.write_all(&self.vdata)?;
        Ok(())
    }

    /// Serialize into a new buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Decode a cache file, failing with [`ChunkedError::CacheCorrupt`].
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| ChunkedError::CacheCorrupt(msg.to_string());
        let mut pos = 0usize;

        let version = read_u64(data, &mut pos)?;
        if version != CACHE_VERSION {
            return Err(ChunkedError::CacheCorrupt(format!(
                "unsupported cache version {}",
                version
            )));
        }
        let tag_len_field = read_u64(data, &mut pos)?;
        let digest_len = read_u64(data, &mut pos)?;
        if digest_len == 0 || digest_len > 1024 || tag_len_field != digest_len + 16 {
            return Err(corrupt("invalid tag layout"));
        }
        let digest_len = digest_len as usize;

        let words = read_u64(data, &mut pos)?;
        let hashes = read_u64(data, &mut pos)?;
        if hashes == 0 || hashes > 64 {
            return Err(corrupt("invalid bloom filter hash count"));
        }
        let raw = read_slice(data, &mut pos, words.saturating_mul(8))?;
        let bits: Vec<u64> = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        let bloom = BloomFilter::from_words(bits, hashes as u32)?;

        let tags_len = read_u64(data, &mut pos)?;
        let vdata_len = read_u64(data, &mut pos)?;
        let tags = read_slice(data, &mut pos, tags_len)?.to_vec();
        let vdata = read_slice(data, &mut pos, vdata_len)?.to_vec();
        if pos != data.len() {
            return Err(corrupt("trailing data after cache file"));
        }

        let tag_len = tag_len_field as usize;
        if tags.len() % tag_len != 0 {
            return Err(corrupt("tag table has a partial record"));
        }
        let sorted = tags
            .chunks_exact(tag_len)
            .zip(tags.chunks_exact(tag_len).skip(1))
            .all(|(a, b)| a[..digest_len] < b[..digest_len]);
        if !sorted {
            return Err(corrupt("tag table is not sorted"));
        }

        Ok(Self {
            digest_len,
            bloom,
            tags,
            vdata,
        })
    }

    /// Look up a `sha256:` digest.
    pub fn lookup(&self, digest: &str) -> Option<CacheLocation> {
        let bin = digest_to_binary(digest).ok()?;
        if !self.bloom.maybe_contains(&bin) {
            return None;
        }
        let (off, len) = find_tag(&bin, &self.tags, self.digest_len)?;
        let start = usize::try_from(off).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        let raw = self.vdata.get(start..end)?;
        CacheLocation::parse(std::str::from_utf8(raw).ok()?)
    }
}

/// A possible source for some content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Layer holding the content.
    pub layer_id: String,
    /// Where inside that layer.
    pub location: CacheLocation,
}

#[derive(Debug)]
struct LayerCache {
    layer_id: String,
    cache: CacheFile,
}

/// Snapshot of the caches of every layer in the store.
///
/// Built once per differ invocation and never modified afterwards.
#[derive(Debug, Default)]
pub struct LayersCache {
    layers: Vec<LayerCache>,
}

impl LayersCache {
    /// Load the cache of every layer in `store` except `exclude`.
    ///
    /// A layer without a cache file gets one built from its TOC and written
    /// back. Layers whose cache cannot be read are skipped with a warning.
    pub fn load(store: &dyn LayerStore, exclude: Option<&str>) -> Result<Self> {
        let mut layers = Vec::new();
        for layer_id in store.layer_ids()? {
            if Some(layer_id.as_str()) == exclude {
                continue;
            }
            match load_layer_cache(store, &layer_id) {
                Ok(Some(cache)) => layers.push(LayerCache { layer_id, cache }),
                Ok(None) => {}
                Err(e) => tracing::warn!("skipping cache of layer {}: {}", layer_id, e),
            }
        }
        tracing::debug!("loaded caches of {} layers", layers.len());
        Ok(Self { layers })
    }

    /// Build a snapshot from already decoded caches.
    pub fn from_caches(caches: impl IntoIterator<Item = (String, CacheFile)>) -> Self {
        Self {
            layers: caches
                .into_iter()
                .map(|(layer_id, cache)| LayerCache { layer_id, cache })
                .collect(),
        }
    }

    /// Number of layers contributing candidates.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// All layers holding `digest`, in store order.
    pub fn find<'a>(&'a self, digest: &'a str) -> impl Iterator<Item = Candidate> + 'a {
        self.layers.iter().filter_map(move |l| {
            l.cache.lookup(digest).map(|location| Candidate {
                layer_id: l.layer_id.clone(),
                location,
            })
        })
    }

    /// Candidates for hard linking `meta`: same content and same attributes.
    pub fn find_by_fingerprint(&self, meta: &FileMetadata) -> Vec<Candidate> {
        match hardlink_fingerprint(meta) {
            Some(fp) => self.find(&fp).collect(),
            None => Vec::new(),
        }
    }
}

fn load_layer_cache(store: &dyn LayerStore, layer_id: &str) -> Result<Option<CacheFile>> {
    if let Some(data) = store.layer_big_data(layer_id, CACHE_KEY)? {
        return CacheFile::from_bytes(&data).map(Some);
    }
    let Some(manifest) = store.layer_big_data(layer_id, TOC_KEY)? else {
        return Ok(None);
    };
    let toc = unmarshal_toc(&manifest)?;
    let cache = CacheFile::build(&toc)?;
    if let Err(e) = store.set_layer_big_data(layer_id, CACHE_KEY, &cache.to_bytes()?) {
        tracing::warn!("writing cache file for layer {}: {}", layer_id, e);
    }
    Ok(Some(cache))
}
