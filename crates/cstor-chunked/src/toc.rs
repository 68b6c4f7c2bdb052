//! Table of Contents (TOC) of a zstd:chunked layer.
//!
//! The TOC is a JSON document embedded in the compressed blob. It lists every
//! entry of the layer in tar order, and for regular files it records where the
//! compressed payload lives inside the blob so that a reader can fetch single
//! files, or single chunks of large files, with ranged requests.
//!
//! ```json
//! {
//!   "version": 1,
//!   "entries": [
//!     {"type": "dir", "name": "etc/", "mode": 493, "modtime": "2024-01-15T12:40:45Z"},
//!     {"type": "reg", "name": "etc/hosts", "mode": 420, "size": 158,
//!      "digest": "sha256:...", "offset": 1024, "endOffset": 1180,
//!      "chunkSize": 158, "chunkDigest": "sha256:..."}
//!   ],
//!   "tarsplit-digest": "sha256:..."
//! }
//! ```
//!
//! A large file is split into several chunks. The first chunk is described by
//! the file's own entry; every further chunk follows as an entry of type
//! `chunk` with the same name. [`merge_toc_entries`] folds those continuation
//! entries back into their file and validates the result.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChunkedError, Result};
use crate::tar_split::TarHeader;

/// Current TOC version.
pub const TOC_VERSION: i32 = 1;

/// Type of a TOC entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Regular file
    #[default]
    Reg,
    /// Directory
    Dir,
    /// Symbolic link
    Symlink,
    /// Hard link
    Hardlink,
    /// Character device
    Char,
    /// Block device
    Block,
    /// FIFO (named pipe)
    Fifo,
    /// Continuation chunk of the preceding regular file
    Chunk,
}

impl EntryType {
    /// Convert from tar typeflag byte.
    pub fn from_typeflag(typeflag: u8) -> Option<Self> {
        match typeflag {
            b'0' | b'\0' | b'7' => Some(EntryType::Reg),
            b'1' => Some(EntryType::Hardlink),
            b'2' => Some(EntryType::Symlink),
            b'3' => Some(EntryType::Char),
            b'4' => Some(EntryType::Block),
            b'5' => Some(EntryType::Dir),
            b'6' => Some(EntryType::Fifo),
            _ => None,
        }
    }
}

/// Content of a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkType {
    /// Literal data stored in the blob.
    #[default]
    #[serde(rename = "")]
    Data,
    /// A run of zero bytes; nothing is stored and the reader punches a hole.
    #[serde(rename = "zeros")]
    Zeros,
}

impl ChunkType {
    fn is_data(&self) -> bool {
        *self == ChunkType::Data
    }
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// A single entry of the TOC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Type of this entry.
    #[serde(rename = "type")]
    pub entry_type: EntryType,

    /// Path inside the layer, as written by the producer.
    pub name: String,

    /// Target of symlinks and hard links.
    #[serde(rename = "linkName", default, skip_serializing_if = "String::is_empty")]
    pub link_name: String,

    /// Permission bits.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub mode: u32,

    /// Uncompressed size of regular files.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,

    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub uid: u32,

    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub gid: u32,

    #[serde(rename = "userName", default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,

    #[serde(rename = "groupName", default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modtime: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accesstime: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changetime: Option<DateTime<Utc>>,

    #[serde(rename = "devMajor", default, skip_serializing_if = "is_zero_u32")]
    pub dev_major: u32,

    #[serde(rename = "devMinor", default, skip_serializing_if = "is_zero_u32")]
    pub dev_minor: u32,

    /// Extended attributes, values base64 encoded.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, String>,

    /// Digest of the whole file content (sha256:...).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,

    /// Start of the compressed payload inside the blob.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub offset: u64,

    /// End (exclusive) of the compressed payload inside the blob.
    #[serde(rename = "endOffset", default, skip_serializing_if = "is_zero_u64")]
    pub end_offset: u64,

    /// Uncompressed size of this chunk.
    #[serde(rename = "chunkSize", default, skip_serializing_if = "is_zero_u64")]
    pub chunk_size: u64,

    /// Offset of this chunk inside the uncompressed file.
    #[serde(rename = "chunkOffset", default, skip_serializing_if = "is_zero_u64")]
    pub chunk_offset: u64,

    /// Digest of the uncompressed chunk.
    #[serde(rename = "chunkDigest", default, skip_serializing_if = "String::is_empty")]
    pub chunk_digest: String,

    #[serde(rename = "chunkType", default, skip_serializing_if = "ChunkType::is_data")]
    pub chunk_type: ChunkType,
}

/// Build a UTC timestamp from seconds and nanoseconds.
pub fn unix_time(secs: i64, nanos: u32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, nanos)
}

impl FileMetadata {
    /// Create a FileMetadata from a tar header.
    ///
    /// Returns `None` for header types that have no TOC representation.
    pub fn from_tar_header(header: &TarHeader) -> Option<Self> {
        use base64::prelude::*;

        let entry_type = EntryType::from_typeflag(header.typeflag)?;

        let link_name = match entry_type {
            EntryType::Symlink => header.linkname.clone(),
            EntryType::Hardlink => header
                .linkname
                .strip_prefix("./")
                .unwrap_or(&header.linkname)
                .to_string(),
            _ => String::new(),
        };

        let (dev_major, dev_minor) = match entry_type {
            EntryType::Char | EntryType::Block => (header.devmajor, header.devminor),
            _ => (0, 0),
        };

        Some(FileMetadata {
            entry_type,
            name: header.normalized_name().to_string(),
            link_name,
            mode: header.mode & 0o7777,
            size: if entry_type == EntryType::Reg {
                header.size
            } else {
                0
            },
            uid: header.uid,
            gid: header.gid,
            user_name: header.uname.clone(),
            group_name: header.gname.clone(),
            modtime: unix_time(header.mtime, header.mtime_nsec),
            accesstime: header.atime.and_then(|(s, ns)| unix_time(s, ns)),
            changetime: header.ctime.and_then(|(s, ns)| unix_time(s, ns)),
            dev_major,
            dev_minor,
            xattrs: header
                .xattrs
                .iter()
                .map(|(k, v)| (k.clone(), BASE64_STANDARD.encode(v)))
                .collect(),
            ..Default::default()
        })
    }

    /// Decode the xattr values.
    pub fn decoded_xattrs(&self) -> Result<Vec<(String, Vec<u8>)>> {
        use base64::prelude::*;

        self.xattrs
            .iter()
            .map(|(k, v)| {
                BASE64_STANDARD
                    .decode(v)
                    .map(|value| (k.clone(), value))
                    .map_err(|e| ChunkedError::format(format!("invalid xattr {:?}: {}", k, e)))
            })
            .collect()
    }
}

/// Table of contents of a chunked layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    /// Format version.
    pub version: i32,

    /// All entries in tar order.
    #[serde(default)]
    pub entries: Vec<FileMetadata>,

    /// Digest of the compressed tar-split frame.
    #[serde(rename = "tarsplit-digest", default, skip_serializing_if = "String::is_empty")]
    pub tar_split_digest: String,
}

impl Default for Toc {
    fn default() -> Self {
        Self {
            version: TOC_VERSION,
            entries: Vec::new(),
            tar_split_digest: String::new(),
        }
    }
}

/// Parse a TOC document.
///
/// Exactly one JSON object is accepted, optionally surrounded by whitespace.
/// Anything else, including a valid object followed by another value, is a
/// [`ChunkedError::Format`] error.
pub fn unmarshal_toc(data: &[u8]) -> Result<Toc> {
    match data.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') => {}
        _ => return Err(ChunkedError::format("TOC is not a JSON object")),
    }
    serde_json::from_slice(data).map_err(|e| ChunkedError::format(format!("invalid TOC: {}", e)))
}

/// Lexically clean an entry name relative to the layer root.
///
/// The result never starts with `/` and never contains `.` or `..`
/// components: `..` at the root stays at the root. The empty string denotes
/// the root itself.
pub fn clean_name(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in name.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    parts.join("/")
}

/// One chunk of a regular file, resolved against its neighbours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Offset inside the uncompressed file.
    pub chunk_offset: u64,
    /// Uncompressed length.
    pub size: u64,
    /// Digest of the uncompressed bytes; may be empty for holes.
    pub digest: String,
    /// Data or hole.
    pub chunk_type: ChunkType,
    /// Compressed range inside the blob.
    pub offset: u64,
    pub end_offset: u64,
}

impl FileChunk {
    /// Whether this chunk is a hole.
    pub fn is_hole(&self) -> bool {
        self.chunk_type == ChunkType::Zeros
    }
}

/// A filesystem object with its chunks folded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry {
    /// The entry as found in the TOC, with `name` (and for hard links
    /// `link_name`) cleaned.
    pub meta: FileMetadata,
    /// Chunks of a regular file in file order; empty for everything else and
    /// for empty files.
    pub chunks: Vec<FileChunk>,
}

fn chunk_from(meta: &FileMetadata) -> FileChunk {
    FileChunk {
        chunk_offset: meta.chunk_offset,
        size: meta.chunk_size,
        digest: meta.chunk_digest.clone(),
        chunk_type: meta.chunk_type,
        offset: meta.offset,
        end_offset: meta.end_offset,
    }
}

/// Group chunk entries with their file and validate the TOC.
///
/// `blob_size` bounds every compressed range. Rules enforced:
/// - a `chunk` entry follows its file (or a previous chunk) with the same name,
/// - chunk offsets strictly increase, chunks cover the file exactly,
/// - data chunks have a non-empty range inside the blob,
/// - regular files with content carry a digest,
/// - hard links name an earlier entry that is not a directory,
/// - only directories may name the root.
pub fn merge_toc_entries(entries: &[FileMetadata], blob_size: u64) -> Result<Vec<MergedEntry>> {
    let mut merged: Vec<MergedEntry> = Vec::with_capacity(entries.len());
    let mut seen_files: HashSet<String> = HashSet::new();
    let mut seen_dirs: HashSet<String> = HashSet::new();

    for entry in entries {
        let name = clean_name(&entry.name);

        if entry.entry_type == EntryType::Chunk {
            let owner = merged
                .last_mut()
                .filter(|m| m.meta.entry_type == EntryType::Reg && m.meta.name == name)
                .ok_or_else(|| {
                    ChunkedError::format(format!("chunk for {:?} does not follow its file", name))
                })?;
            owner.chunks.push(chunk_from(entry));
            continue;
        }

        if name.is_empty() && entry.entry_type != EntryType::Dir {
            return Err(ChunkedError::format(format!(
                "entry {:?} of type {:?} names the root",
                entry.name, entry.entry_type
            )));
        }

        let mut meta = entry.clone();
        meta.name = name.clone();
        let mut chunks = Vec::new();

        match entry.entry_type {
            EntryType::Reg if entry.size > 0 => {
                if entry.digest.is_empty() {
                    return Err(ChunkedError::format(format!("{:?} has no digest", name)));
                }
                let mut first = chunk_from(entry);
                first.chunk_offset = 0;
                if first.digest.is_empty() && entry.chunk_size == 0 {
                    first.digest = entry.digest.clone();
                }
                chunks.push(first);
            }
            EntryType::Hardlink => {
                let target = clean_name(&entry.link_name);
                if seen_dirs.contains(&target) || !seen_files.contains(&target) {
                    return Err(ChunkedError::format(format!(
                        "hard link {:?} points to unknown entry {:?}",
                        name, entry.link_name
                    )));
                }
                meta.link_name = target;
            }
            _ => {}
        }

        if entry.entry_type == EntryType::Dir {
            seen_dirs.insert(name.clone());
            seen_files.remove(&name);
        } else {
            seen_dirs.remove(&name);
            seen_files.insert(name);
        }
        merged.push(MergedEntry { meta, chunks });
    }

    for entry in merged.iter_mut() {
        if entry.meta.entry_type == EntryType::Reg && !entry.chunks.is_empty() {
            fix_chunk_sizes(&entry.meta, &mut entry.chunks, blob_size)?;
        }
    }
    Ok(merged)
}

/// Fill in missing chunk sizes and check coverage and ranges.
fn fix_chunk_sizes(meta: &FileMetadata, chunks: &mut [FileChunk], blob_size: u64) -> Result<()> {
    let bad = |msg: &str| ChunkedError::format(format!("{:?}: {}", meta.name, msg));
    let file_size = meta.size;
    let n = chunks.len();

    for i in 0..n {
        let next_offset = if i + 1 < n {
            chunks[i + 1].chunk_offset
        } else {
            file_size
        };
        let c = &mut chunks[i];
        if next_offset <= c.chunk_offset {
            return Err(bad("chunk offsets are not increasing"));
        }
        let expected = next_offset - c.chunk_offset;
        if c.size == 0 {
            c.size = expected;
        }
        if c.size != expected {
            return Err(bad("chunks do not cover the file"));
        }
        if !c.is_hole() {
            if c.end_offset <= c.offset || c.end_offset > blob_size {
                return Err(bad("chunk range is outside the blob"));
            }
            if c.digest.is_empty() {
                return Err(bad("chunk has no digest"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(name: &str, entry_type: EntryType) -> FileMetadata {
        FileMetadata {
            entry_type,
            name: name.to_string(),
            mode: 0o644,
            ..Default::default()
        }
    }

    fn reg(name: &str, size: u64, offset: u64, end: u64) -> FileMetadata {
        FileMetadata {
            size,
            digest: format!("sha256:{}", "a".repeat(64)),
            chunk_digest: format!("sha256:{}", "b".repeat(64)),
            offset,
            end_offset: end,
            ..make_entry(name, EntryType::Reg)
        }
    }

    #[test]
    fn test_entry_type_from_typeflag() {
        assert_eq!(EntryType::from_typeflag(b'0'), Some(EntryType::Reg));
        assert_eq!(EntryType::from_typeflag(b'\0'), Some(EntryType::Reg));
        assert_eq!(EntryType::from_typeflag(b'1'), Some(EntryType::Hardlink));
        assert_eq!(EntryType::from_typeflag(b'5'), Some(EntryType::Dir));
        assert_eq!(EntryType::from_typeflag(b'L'), None);
    }

    #[test]
    fn test_unmarshal_accepts_trailing_whitespace() {
        let toc = unmarshal_toc(b"  {\"version\":1,\"entries\":[]} \n\t").unwrap();
        assert_eq!(toc.version, 1);
        assert!(toc.entries.is_empty());
    }

    #[test]
    fn test_unmarshal_rejects_trailing_values() {
        let doc = r#"{"version":1,"entries":[]}"#;
        for trailer in ["{}", "[]", "1", "\"x\"", "null", "garbage", " }"] {
            let data = format!("{}{}", doc, trailer);
            assert!(unmarshal_toc(data.as_bytes()).is_err(), "accepted {:?}", data);
        }
    }

    #[test]
    fn test_unmarshal_rejects_non_objects() {
        for doc in ["[]", "1", "null", "", "   ", "\"{}\""] {
            assert!(unmarshal_toc(doc.as_bytes()).is_err(), "accepted {:?}", doc);
        }
    }

    #[test]
    fn test_escaped_names_roundtrip() {
        let doc = r#"{"version":1,"entries":[
            {"type":"reg","name":"usr/lib/systemd/system/system-systemd\\x2dcryptsetup.slice","mode":420},
            {"type":"hardlink","name":"link","linkName":"usr/lib/systemd/system/system-systemd\\x2dcryptsetup.slice"}
        ]}"#;
        let toc = unmarshal_toc(doc.as_bytes()).unwrap();
        let name = "usr/lib/systemd/system/system-systemd\\x2dcryptsetup.slice";
        assert_eq!(toc.entries[0].name, name);
        assert_eq!(toc.entries[1].link_name, name);

        let reencoded = serde_json::to_vec(&toc).unwrap();
        let again = unmarshal_toc(&reencoded).unwrap();
        assert_eq!(again, toc);
        assert!(
            String::from_utf8(reencoded)
                .unwrap()
                .contains(r#"system-systemd\\x2dcryptsetup.slice"#)
        );
    }

    #[test]
    fn test_chunk_type_serialization() {
        let mut e = make_entry("a", EntryType::Chunk);
        e.chunk_type = ChunkType::Zeros;
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains(r#""chunkType":"zeros""#));
        e.chunk_type = ChunkType::Data;
        assert!(!serde_json::to_string(&e).unwrap().contains("chunkType"));
        let parsed: FileMetadata =
            serde_json::from_str(r#"{"type":"chunk","name":"a","chunkType":""}"#).unwrap();
        assert_eq!(parsed.chunk_type, ChunkType::Data);
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("./etc/hosts"), "etc/hosts");
        assert_eq!(clean_name("/etc//hosts/"), "etc/hosts");
        assert_eq!(clean_name("../../etc/passwd"), "etc/passwd");
        assert_eq!(clean_name("a/b/../../../c"), "c");
        assert_eq!(clean_name("./"), "");
    }

    #[test]
    fn test_merge_groups_chunks() {
        let mut file = reg("big", 300, 10, 20);
        file.chunk_size = 100;
        let mut c1 = make_entry("big", EntryType::Chunk);
        c1.chunk_offset = 100;
        c1.chunk_size = 150;
        c1.chunk_type = ChunkType::Zeros;
        let mut c2 = make_entry("big", EntryType::Chunk);
        c2.chunk_offset = 250;
        c2.offset = 20;
        c2.end_offset = 30;
        c2.chunk_digest = format!("sha256:{}", "c".repeat(64));

        let merged = merge_toc_entries(
            &[make_entry("./", EntryType::Dir), file, c1, c2],
            100,
        )
        .unwrap();
        assert_eq!(merged.len(), 2);
        let chunks = &merged[1].chunks;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].size, 50);
        assert!(chunks[1].is_hole());
        assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), 300);
    }

    #[test]
    fn test_merge_single_chunk_defaults() {
        let mut file = reg("small", 5, 10, 20);
        file.chunk_digest.clear();
        let merged = merge_toc_entries(&[file.clone()], 100).unwrap();
        assert_eq!(merged[0].chunks.len(), 1);
        assert_eq!(merged[0].chunks[0].size, 5);
        assert_eq!(merged[0].chunks[0].digest, file.digest);
    }

    #[test]
    fn test_merge_rejects_orphan_chunk() {
        let chunk = make_entry("x", EntryType::Chunk);
        assert!(merge_toc_entries(&[chunk], 100).is_err());

        let mut other = make_entry("y", EntryType::Chunk);
        other.chunk_offset = 1;
        assert!(merge_toc_entries(&[reg("x", 5, 0, 5), other], 100).is_err());
    }

    #[test]
    fn test_merge_rejects_ranges_outside_blob() {
        assert!(merge_toc_entries(&[reg("x", 5, 90, 120)], 100).is_err());
        assert!(merge_toc_entries(&[reg("x", 5, 20, 20)], 100).is_err());
    }

    #[test]
    fn test_merge_rejects_missing_digest() {
        let mut file = reg("x", 5, 0, 5);
        file.digest.clear();
        assert!(merge_toc_entries(&[file], 100).is_err());
    }

    #[test]
    fn test_merge_hardlink_targets() {
        let mut link = make_entry("l", EntryType::Hardlink);
        link.link_name = "./x".to_string();
        let merged = merge_toc_entries(&[reg("x", 5, 0, 5), link.clone()], 100).unwrap();
        assert_eq!(merged[1].meta.link_name, "x");

        assert!(merge_toc_entries(&[link.clone()], 100).is_err());

        link.link_name = "d".to_string();
        assert!(merge_toc_entries(&[make_entry("d", EntryType::Dir), link], 100).is_err());
    }

    #[test]
    fn test_merge_rejects_root_file() {
        assert!(merge_toc_entries(&[make_entry("/", EntryType::Symlink)], 100).is_err());
    }

    #[test]
    fn test_from_tar_header() {
        let header = TarHeader {
            name: "./usr/bin/tool".to_string(),
            mode: 0o100755,
            size: 42,
            mtime: 1_705_322_445,
            typeflag: b'0',
            ..Default::default()
        };
        let meta = FileMetadata::from_tar_header(&header).unwrap();
        assert_eq!(meta.name, "usr/bin/tool");
        assert_eq!(meta.mode, 0o755);
        assert_eq!(meta.size, 42);
        assert_eq!(
            meta.modtime.unwrap().to_rfc3339(),
            "2024-01-15T12:40:45+00:00"
        );

        let gnu_long = TarHeader {
            typeflag: b'L',
            ..Default::default()
        };
        assert!(FileMetadata::from_tar_header(&gnu_long).is_none());
    }
}
