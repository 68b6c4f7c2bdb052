//! The zstd:chunked container.
//!
//! A zstd:chunked blob is an ordinary zstd stream that decompresses to the
//! layer tarball. Metadata rides along in zstd skippable frames, which every
//! decoder ignores:
//!
//! ```text
//! [zstd frames: tar stream]
//! [skippable frame: zstd(TOC JSON)]
//! [skippable frame: zstd(tar-split NDJSON)]
//! [skippable frame: footer]
//! ```
//!
//! Each skippable frame starts with the 4-byte magic `50 2A 4D 18` and a u32
//! little-endian payload length. The footer payload is 64 bytes of
//! little-endian u64 fields: manifest offset, compressed length, uncompressed
//! length, manifest type, tar-split offset, compressed length, uncompressed
//! length, and finally the magic `GNUlInUx`. Offsets point at frame payloads,
//! past the 8-byte frame header.
//!
//! The same locations are published as image annotations so that a reader can
//! fetch the manifest with a single ranged request.

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::digest::{Digester, parse_sha256, sha256_digest, verify_digest};
use crate::error::{ChunkedError, Result};
use crate::source::{BlobSource, ImageSourceChunk};
use crate::toc::{Toc, unmarshal_toc};

/// Magic of a zstd skippable frame (0x184D2A50, little endian).
pub const SKIPPABLE_FRAME_MAGIC: [u8; 4] = [0x50, 0x2a, 0x4d, 0x18];

/// Size of a skippable frame header.
pub const SKIPPABLE_FRAME_HEADER_LEN: u64 = 8;

/// Magic closing the footer payload.
pub const CHUNKED_MAGIC: [u8; 8] = *b"GNUlInUx";

/// Size of the footer payload.
pub const FOOTER_LEN: usize = 64;

/// Size of the footer including its frame header.
pub const FOOTER_FRAME_LEN: u64 = FOOTER_LEN as u64 + SKIPPABLE_FRAME_HEADER_LEN;

/// Manifest type of a TOC (CRFS-style) manifest.
pub const MANIFEST_TYPE_CRFS: u64 = 1;

/// Annotation carrying the digest of the compressed manifest.
pub const MANIFEST_CHECKSUM_KEY: &str = "io.github.containers.zstd-chunked.manifest-checksum";

/// Annotation carrying `offset:length:lengthUncompressed:type` of the manifest.
pub const MANIFEST_POSITION_KEY: &str = "io.github.containers.zstd-chunked.manifest-position";

/// Annotation carrying `offset:length:lengthUncompressed` of the tar-split.
pub const TAR_SPLIT_POSITION_KEY: &str = "io.github.containers.zstd-chunked.tarsplit-position";

/// Upper bound on a decompressed manifest or tar-split.
pub const MAX_METADATA_SIZE: u64 = 256 * 1024 * 1024;

/// Location of one metadata frame payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLocation {
    /// Offset of the payload in the blob.
    pub offset: u64,
    /// Compressed length.
    pub length: u64,
    /// Decompressed length.
    pub length_uncompressed: u64,
}

impl FrameLocation {
    fn chunk(&self) -> ImageSourceChunk {
        ImageSourceChunk::new(self.offset, self.length)
    }
}

/// Decoded footer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footer {
    /// Where the TOC lives.
    pub manifest: FrameLocation,
    /// Kind of manifest; only [`MANIFEST_TYPE_CRFS`] is understood.
    pub manifest_type: u64,
    /// Where the tar-split lives.
    pub tar_split: FrameLocation,
}

impl Footer {
    /// Encode the 64-byte footer payload.
    pub fn to_bytes(&self) -> [u8; FOOTER_LEN] {
        let fields = [
            self.manifest.offset,
            self.manifest.length,
            self.manifest.length_uncompressed,
            self.manifest_type,
            self.tar_split.offset,
            self.tar_split.length,
            self.tar_split.length_uncompressed,
        ];
        let mut out = [0u8; FOOTER_LEN];
        for (i, f) in fields.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&f.to_le_bytes());
        }
        out[56..].copy_from_slice(&CHUNKED_MAGIC);
        out
    }

    /// Decode a footer payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_LEN {
            return Err(ChunkedError::format(format!(
                "footer has {} bytes, expected {}",
                data.len(),
                FOOTER_LEN
            )));
        }
        if data[56..] != CHUNKED_MAGIC {
            return Err(ChunkedError::format("footer magic mismatch"));
        }
        let field = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };
        Ok(Footer {
            manifest: FrameLocation {
                offset: field(0),
                length: field(1),
                length_uncompressed: field(2),
            },
            manifest_type: field(3),
            tar_split: FrameLocation {
                offset: field(4),
                length: field(5),
                length_uncompressed: field(6),
            },
        })
    }

    /// Decode a complete footer frame, including the skippable frame header.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        if frame.len() as u64 != FOOTER_FRAME_LEN || !is_skippable_frame(frame) {
            return Err(ChunkedError::format("blob does not end with a chunked footer"));
        }
        let len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if len as usize != FOOTER_LEN {
            return Err(ChunkedError::format(format!(
                "footer frame has {} bytes, expected {}",
                len, FOOTER_LEN
            )));
        }
        Self::from_bytes(&frame[SKIPPABLE_FRAME_HEADER_LEN as usize..])
    }

    /// Annotations describing this footer.
    pub fn annotations(&self, manifest_digest: &str) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert(MANIFEST_CHECKSUM_KEY.to_string(), manifest_digest.to_string());
        out.insert(
            MANIFEST_POSITION_KEY.to_string(),
            format!(
                "{}:{}:{}:{}",
                self.manifest.offset,
                self.manifest.length,
                self.manifest.length_uncompressed,
                self.manifest_type
            ),
        );
        out.insert(
            TAR_SPLIT_POSITION_KEY.to_string(),
            format!(
                "{}:{}:{}",
                self.tar_split.offset, self.tar_split.length, self.tar_split.length_uncompressed
            ),
        );
        out
    }

    /// Read the locations back from annotations.
    ///
    /// Returns `Ok(None)` when the manifest position annotation is absent.
    pub fn from_annotations(annotations: &HashMap<String, String>) -> Result<Option<Self>> {
        let Some(position) = annotations.get(MANIFEST_POSITION_KEY) else {
            return Ok(None);
        };
        let fields = parse_position(MANIFEST_POSITION_KEY, position, 4)?;
        let mut footer = Footer {
            manifest: FrameLocation {
                offset: fields[0],
                length: fields[1],
                length_uncompressed: fields[2],
            },
            manifest_type: fields[3],
            tar_split: FrameLocation::default(),
        };
        if let Some(ts) = annotations.get(TAR_SPLIT_POSITION_KEY) {
            let fields = parse_position(TAR_SPLIT_POSITION_KEY, ts, 3)?;
            footer.tar_split = FrameLocation {
                offset: fields[0],
                length: fields[1],
                length_uncompressed: fields[2],
            };
        }
        Ok(Some(footer))
    }
}

fn parse_position(key: &str, value: &str, count: usize) -> Result<Vec<u64>> {
    let fields: Vec<u64> = value
        .split(':')
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| ChunkedError::format(format!("invalid {} annotation {:?}", key, value)))?;
    if fields.len() != count {
        return Err(ChunkedError::format(format!(
            "invalid {} annotation {:?}",
            key, value
        )));
    }
    Ok(fields)
}

/// Whether `data` starts with a skippable frame header.
pub fn is_skippable_frame(data: &[u8]) -> bool {
    data.len() >= SKIPPABLE_FRAME_HEADER_LEN as usize && data[..4] == SKIPPABLE_FRAME_MAGIC
}

/// Write `data` as one skippable frame.
pub fn write_skippable_frame<W: Write>(w: &mut W, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| ChunkedError::format("skippable frame payload exceeds 4 GiB"))?;
    w.write_all(&SKIPPABLE_FRAME_MAGIC)?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(data)?;
    Ok(())
}

/// Result of appending the metadata frames.
#[derive(Debug, Clone)]
pub struct WrittenManifest {
    /// Digest of the compressed manifest.
    pub manifest_digest: String,
    /// Frame locations.
    pub footer: Footer,
    /// Bytes written, frame headers included.
    pub written: u64,
}

/// Append manifest, tar-split and footer frames.
///
/// `offset` is the position in the blob where writing starts. `toc` gets its
/// tar-split digest filled in before it is serialized.
pub fn write_zstd_chunked_manifest<W: Write>(
    w: &mut W,
    offset: u64,
    toc: &mut Toc,
    tar_split: &[u8],
    tar_split_uncompressed_len: u64,
    level: i32,
) -> Result<WrittenManifest> {
    toc.tar_split_digest = sha256_digest(tar_split);
    let manifest = serde_json::to_vec(toc)?;
    let compressed = zstd::bulk::compress(&manifest, level)?;
    let manifest_digest = sha256_digest(&compressed);

    let manifest_loc = FrameLocation {
        offset: offset + SKIPPABLE_FRAME_HEADER_LEN,
        length: compressed.len() as u64,
        length_uncompressed: manifest.len() as u64,
    };
    write_skippable_frame(w, &compressed)?;

    let tar_split_loc = FrameLocation {
        offset: manifest_loc.offset + manifest_loc.length + SKIPPABLE_FRAME_HEADER_LEN,
        length: tar_split.len() as u64,
        length_uncompressed: tar_split_uncompressed_len,
    };
    write_skippable_frame(w, tar_split)?;

    let footer = Footer {
        manifest: manifest_loc,
        manifest_type: MANIFEST_TYPE_CRFS,
        tar_split: tar_split_loc,
    };
    write_skippable_frame(w, &footer.to_bytes())?;

    let written = tar_split_loc.offset + tar_split_loc.length + FOOTER_FRAME_LEN - offset;
    Ok(WrittenManifest {
        manifest_digest,
        footer,
        written,
    })
}

/// Manifest and tar-split read from a blob, already verified.
#[derive(Debug, Clone)]
pub struct ChunkedManifest {
    /// Parsed TOC.
    pub toc: Toc,
    /// The uncompressed TOC bytes as found in the blob.
    pub manifest: Vec<u8>,
    /// The tar-split frame, still compressed.
    pub tar_split: Vec<u8>,
    /// Digest of the compressed manifest.
    pub toc_digest: String,
    /// Frame locations used.
    pub footer: Footer,
}

fn check_frame(what: &str, loc: &FrameLocation, blob_size: u64) -> Result<()> {
    let end = loc.offset.checked_add(loc.length);
    if loc.length == 0 || end.is_none_or(|e| e > blob_size) {
        return Err(ChunkedError::format(format!(
            "{} range {}+{} is outside the blob",
            what, loc.offset, loc.length
        )));
    }
    if loc.length_uncompressed > MAX_METADATA_SIZE {
        return Err(ChunkedError::format(format!(
            "{} is too large: {} bytes",
            what, loc.length_uncompressed
        )));
    }
    Ok(())
}

fn fetch_exact(source: &dyn BlobSource, chunks: &[ImageSourceChunk]) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::with_capacity(chunks.len());
    let mut streams = source.get_blob_at(chunks)?;
    for chunk in chunks {
        let mut stream = streams.next().ok_or_else(|| {
            ChunkedError::RemoteFetch("blob source returned fewer streams than requested".into())
        })??;
        let mut buf = Vec::with_capacity(chunk.length as usize);
        (&mut stream).take(chunk.length + 1).read_to_end(&mut buf)?;
        if buf.len() as u64 != chunk.length {
            return Err(ChunkedError::RemoteFetch(format!(
                "range {}+{} delivered {} bytes",
                chunk.offset,
                chunk.length,
                buf.len()
            )));
        }
        out.push(buf);
    }
    Ok(out)
}

fn decompress(what: &str, data: &[u8], expected_len: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len as usize);
    zstd::stream::read::Decoder::new(data)?
        .take(expected_len + 1)
        .read_to_end(&mut out)
        .map_err(|e| ChunkedError::format(format!("decompressing {}: {}", what, e)))?;
    if out.len() as u64 != expected_len {
        return Err(ChunkedError::format(format!(
            "{} decompressed to {} bytes, expected {}",
            what,
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}

/// Locate, fetch and verify the manifest of a zstd:chunked blob.
///
/// The frame locations come from the annotations when present, otherwise
/// from the footer at the end of the blob. The compressed manifest must match
/// the manifest-checksum annotation before anything in it is trusted.
pub fn read_zstd_chunked_manifest(
    source: &dyn BlobSource,
    blob_size: u64,
    annotations: &HashMap<String, String>,
) -> Result<ChunkedManifest> {
    let expected_digest = annotations.get(MANIFEST_CHECKSUM_KEY).ok_or_else(|| {
        ChunkedError::Unsupported("blob has no zstd:chunked manifest checksum".to_string())
    })?;
    parse_sha256(expected_digest)?;

    let footer = match Footer::from_annotations(annotations)? {
        Some(f) => f,
        None => {
            if blob_size < FOOTER_FRAME_LEN {
                return Err(ChunkedError::format("blob is too small for a footer"));
            }
            let frame = fetch_exact(
                source,
                &[ImageSourceChunk::new(blob_size - FOOTER_FRAME_LEN, FOOTER_FRAME_LEN)],
            )?;
            Footer::from_frame(&frame[0])?
        }
    };
    if footer.manifest_type != MANIFEST_TYPE_CRFS {
        return Err(ChunkedError::format(format!(
            "unsupported manifest type {}",
            footer.manifest_type
        )));
    }
    check_frame("manifest", &footer.manifest, blob_size)?;
    let has_tar_split = footer.tar_split.length > 0;
    if has_tar_split {
        check_frame("tar-split", &footer.tar_split, blob_size)?;
    }

    let mut chunks = vec![footer.manifest.chunk()];
    if has_tar_split {
        chunks.push(footer.tar_split.chunk());
    }
    let mut fetched = fetch_exact(source, &chunks)?.into_iter();
    let compressed_manifest = fetched.next().unwrap_or_default();
    let tar_split = fetched.next().unwrap_or_default();

    let mut digester = Digester::new();
    digester.write_all(&compressed_manifest)?;
    verify_digest(expected_digest, &digester.finish())?;

    let manifest = decompress(
        "manifest",
        &compressed_manifest,
        footer.manifest.length_uncompressed,
    )?;
    let toc = unmarshal_toc(&manifest)?;

    if has_tar_split {
        if toc.tar_split_digest.is_empty() {
            return Err(ChunkedError::format("TOC does not record the tar-split digest"));
        }
        verify_digest(&toc.tar_split_digest, &sha256_digest(&tar_split))?;
    }

    tracing::debug!(
        "read manifest with {} entries ({} bytes)",
        toc.entries.len(),
        manifest.len()
    );
    Ok(ChunkedManifest {
        toc,
        manifest,
        tar_split,
        toc_digest: expected_digest.clone(),
        footer,
    })
}

/// Decompress a tar-split frame read by [`read_zstd_chunked_manifest`].
pub fn decompress_tar_split(data: &[u8], footer: &Footer) -> Result<Vec<u8>> {
    decompress("tar-split", data, footer.tar_split.length_uncompressed)
}
