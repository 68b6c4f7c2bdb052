//! Tar-split metadata generation.
//!
//! This is the inverse of [`read_tar_split`](crate::tar_split::read_tar_split).
//! While the compressor walks a tar stream it records every byte that is not
//! file payload as a segment, and every payload as a file reference with its
//! size and CRC-64/GO-ISO checksum. Replaying the records against the
//! extracted files reproduces the original tarball bit for bit.
//!
//! # Format
//!
//! NDJSON, zstd-compressed:
//! ```json
//! {"type":2,"payload":"<base64 raw header bytes>"}
//! {"type":1,"name":"./etc/hosts","size":123,"crc64":"<base64 checksum>"}
//! {"type":2,"payload":"<base64 padding and end-of-archive blocks>"}
//! ```

use std::io::Write;

use base64::prelude::*;
use serde::Serialize;

use crate::error::Result;

/// A tar-split entry for serialization.
#[derive(Debug, Serialize)]
struct TarSplitRecord<'a> {
    /// Entry type: 1 for File, 2 for Segment.
    #[serde(rename = "type")]
    type_id: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,

    /// CRC64-ISO checksum, base64 of the big-endian bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    crc64: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

/// Streaming writer for tar-split records.
pub struct TarSplitWriter {
    encoder: zstd::stream::write::Encoder<'static, Vec<u8>>,
    uncompressed: u64,
    entries: usize,
}

impl std::fmt::Debug for TarSplitWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarSplitWriter")
            .field("uncompressed", &self.uncompressed)
            .field("entries", &self.entries)
            .finish()
    }
}

impl TarSplitWriter {
    /// Create a writer compressing at `level`.
    pub fn new(level: i32) -> Result<Self> {
        Ok(Self {
            encoder: zstd::stream::write::Encoder::new(Vec::new(), level)?,
            uncompressed: 0,
            entries: 0,
        })
    }

    fn push(&mut self, record: &TarSplitRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.encoder.write_all(&line)?;
        self.uncompressed += line.len() as u64;
        self.entries += 1;
        Ok(())
    }

    /// Record raw bytes that are copied verbatim on reassembly.
    ///
    /// Empty segments are dropped.
    pub fn add_segment(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.push(&TarSplitRecord {
            type_id: 2,
            name: None,
            size: None,
            crc64: None,
            payload: Some(BASE64_STANDARD.encode(bytes)),
        })
    }

    /// Record a file payload.
    pub fn add_file(&mut self, name: &str, size: u64, crc64: u64) -> Result<()> {
        self.push(&TarSplitRecord {
            type_id: 1,
            name: Some(name),
            size: Some(size),
            crc64: Some(BASE64_STANDARD.encode(crc64.to_be_bytes())),
            payload: None,
        })
    }

    /// Number of records written so far.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Finish the stream, returning the compressed bytes and the NDJSON length.
    pub fn finish(self) -> Result<(Vec<u8>, u64)> {
        let compressed = self.encoder.finish()?;
        Ok((compressed, self.uncompressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar_split::{CRC64_ISO, TarSplitEntry, read_tar_split};

    #[test]
    fn test_records_roundtrip() {
        let mut w = TarSplitWriter::new(3).unwrap();
        w.add_segment(&[1u8; 512]).unwrap();
        w.add_segment(&[]).unwrap();
        let crc = CRC64_ISO.checksum(b"hello");
        w.add_file("./hello.txt", 5, crc).unwrap();
        assert_eq!(w.entry_count(), 2);

        let (compressed, ulen) = w.finish().unwrap();
        let raw = zstd::stream::decode_all(&compressed[..]).unwrap();
        assert_eq!(raw.len() as u64, ulen);
        assert!(raw.ends_with(b"\n"));

        let entries = read_tar_split(&compressed).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], TarSplitEntry::Segment(vec![1u8; 512]));
        assert_eq!(
            entries[1],
            TarSplitEntry::File {
                name: "./hello.txt".to_string(),
                size: 5,
                crc64: Some(crc),
            }
        );
    }
}
