//! zstd:chunked compressor.
//!
//! Converts a tar stream into a zstd:chunked blob. The blob decompresses to
//! the exact input bytes; on top of that every file payload starts a fresh
//! zstd frame, and large payloads are cut into content-defined chunks with a
//! frame each, so a reader can fetch and decompress any single chunk on its
//! own.
//!
//! Runs of zero bytes at least [`CompressorOptions::hole_threshold`] long get
//! their own `zeros` chunk. They are still written to the stream, but a reader
//! never needs to fetch them.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::cache::CacheFile;
use crate::config::CompressorOptions;
use crate::digest::Digester;
use crate::error::{ChunkedError, Result};
use crate::format::write_zstd_chunked_manifest;
use crate::rollsum::RollSum;
use crate::tar_split::{CRC64_ISO, TarItem, TarStreamReader};
use crate::tar_split_writer::TarSplitWriter;
use crate::toc::{ChunkType, EntryType, FileMetadata, Toc};

const READ_BUF_SIZE: usize = 128 * 1024;

/// Everything produced by [`compress`].
#[derive(Debug, Clone)]
pub struct CompressionOutput {
    /// Annotations to publish with the layer descriptor.
    pub annotations: HashMap<String, String>,
    /// Digest of the compressed manifest.
    pub toc_digest: String,
    /// The manifest as written.
    pub toc: Toc,
    /// Cache file built from the manifest, ready to store with the layer.
    /// Empty when the manifest does not validate.
    pub cache: Vec<u8>,
    /// The compressed tar-split frame.
    pub tar_split: Vec<u8>,
    /// Digest of the uncompressed tar stream.
    pub uncompressed_digest: String,
    /// Total blob size.
    pub written: u64,
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A zstd stream that can be cut into independent frames.
struct FrameWriter<W: Write> {
    encoder: Option<zstd::stream::write::Encoder<'static, CountingWriter<W>>>,
    level: i32,
    dirty: bool,
}

impl<W: Write> FrameWriter<W> {
    fn new(inner: W, level: i32) -> Result<Self> {
        let counting = CountingWriter { inner, count: 0 };
        Ok(Self {
            encoder: Some(zstd::stream::write::Encoder::new(counting, level)?),
            level,
            dirty: false,
        })
    }

    fn encoder(&mut self) -> Result<&mut zstd::stream::write::Encoder<'static, CountingWriter<W>>> {
        self.encoder
            .as_mut()
            .ok_or_else(|| ChunkedError::format("compressor used after finish"))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.encoder()?.write_all(data)?;
        self.dirty = true;
        Ok(())
    }

    /// Close the current frame and start a new one; returns the blob offset
    /// where the next frame begins.
    fn restart(&mut self) -> Result<u64> {
        if !self.dirty {
            return Ok(self.encoder()?.get_ref().count);
        }
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| ChunkedError::format("compressor used after finish"))?;
        let counting = encoder.finish()?;
        let offset = counting.count;
        self.encoder = Some(zstd::stream::write::Encoder::new(counting, self.level)?);
        self.dirty = false;
        Ok(offset)
    }

    fn finish(mut self) -> Result<CountingWriter<W>> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| ChunkedError::format("compressor used after finish"))?;
        Ok(encoder.finish()?)
    }
}

/// One finished chunk of the current file.
#[derive(Debug)]
struct ChunkRecord {
    chunk_offset: u64,
    size: u64,
    digest: String,
    chunk_type: ChunkType,
    offset: u64,
    end_offset: u64,
}

/// Splits one file payload into chunks while it is streamed through.
struct PayloadChunker<'a, W: Write> {
    frames: &'a mut FrameWriter<W>,
    options: &'a CompressorOptions,
    rollsum: RollSum,
    chunks: Vec<ChunkRecord>,
    file_digest: Digester,
    crc: crc::Digest<'static, u64>,
    // current data chunk
    start_compressed: u64,
    start_file: u64,
    chunk_digest: Digester,
    chunk_len: u64,
    buffer: Vec<u8>,
    pending_zeros: u64,
    position: u64,
}

impl<'a, W: Write> PayloadChunker<'a, W> {
    fn new(frames: &'a mut FrameWriter<W>, options: &'a CompressorOptions) -> Result<Self> {
        let start_compressed = frames.restart()?;
        Ok(Self {
            frames,
            options,
            rollsum: RollSum::new(options.window_size, options.rollsum_bits),
            chunks: Vec::new(),
            file_digest: Digester::new(),
            crc: CRC64_ISO.digest(),
            start_compressed,
            start_file: 0,
            chunk_digest: Digester::new(),
            chunk_len: 0,
            buffer: Vec::with_capacity(READ_BUF_SIZE),
            pending_zeros: 0,
            position: 0,
        })
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.frames.write_all(&self.buffer)?;
            self.chunk_digest.update(&self.buffer);
            self.buffer.clear();
        }
        Ok(())
    }

    fn push_data_byte(&mut self, b: u8) -> Result<()> {
        self.buffer.push(b);
        self.chunk_len += 1;
        self.position += 1;
        self.rollsum.roll(b);
        if self.rollsum.on_split() {
            self.close_data_chunk()?;
        } else if self.buffer.len() >= READ_BUF_SIZE {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn close_data_chunk(&mut self) -> Result<()> {
        if self.chunk_len == 0 {
            return Ok(());
        }
        self.flush_buffer()?;
        let end_offset = self.frames.restart()?;
        let digest = std::mem::take(&mut self.chunk_digest).finish();
        self.chunks.push(ChunkRecord {
            chunk_offset: self.start_file,
            size: self.chunk_len,
            digest,
            chunk_type: ChunkType::Data,
            offset: self.start_compressed,
            end_offset,
        });
        self.start_compressed = end_offset;
        self.start_file = self.position;
        self.chunk_len = 0;
        Ok(())
    }

    /// Resolve the zero run seen so far, either as a hole or as data.
    fn settle_zeros(&mut self) -> Result<()> {
        let zeros = std::mem::take(&mut self.pending_zeros);
        if zeros == 0 {
            return Ok(());
        }
        if zeros < self.options.hole_threshold as u64 {
            for _ in 0..zeros {
                self.push_data_byte(0)?;
            }
            return Ok(());
        }

        self.close_data_chunk()?;
        let block = [0u8; 64 * 1024];
        let mut left = zeros;
        while left > 0 {
            let n = left.min(block.len() as u64) as usize;
            self.frames.write_all(&block[..n])?;
            left -= n as u64;
        }
        let end_offset = self.frames.restart()?;
        self.chunks.push(ChunkRecord {
            chunk_offset: self.position,
            size: zeros,
            digest: String::new(),
            chunk_type: ChunkType::Zeros,
            offset: self.start_compressed,
            end_offset,
        });
        self.position += zeros;
        self.start_compressed = end_offset;
        self.start_file = self.position;
        Ok(())
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.file_digest.update(data);
        self.crc.update(data);
        for &b in data {
            if b == 0 {
                self.pending_zeros += 1;
            } else {
                self.settle_zeros()?;
                self.push_data_byte(b)?;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(Vec<ChunkRecord>, String, u64)> {
        self.settle_zeros()?;
        self.close_data_chunk()?;
        Ok((self.chunks, self.file_digest.finish(), self.crc.finalize()))
    }
}

fn add_chunk_fields(meta: &mut FileMetadata, chunk: &ChunkRecord) {
    meta.chunk_offset = chunk.chunk_offset;
    meta.chunk_size = chunk.size;
    meta.chunk_digest = chunk.digest.clone();
    meta.chunk_type = chunk.chunk_type;
    meta.offset = chunk.offset;
    meta.end_offset = chunk.end_offset;
}

/// Compress the tar stream read from `input` into `output`.
///
/// On error the output holds a partial blob without any manifest and must be
/// discarded.
pub fn compress<R: Read, W: Write>(
    input: R,
    output: W,
    options: &CompressorOptions,
) -> Result<CompressionOutput> {
    if !options.window_size.is_power_of_two() {
        return Err(ChunkedError::format(format!(
            "rolling checksum window {} is not a power of two",
            options.window_size
        )));
    }

    let mut input_digest = Digester::new();
    let mut reader = TarStreamReader::new(TeeReader {
        inner: input,
        digest: &mut input_digest,
    });
    let mut frames = FrameWriter::new(output, options.level)?;
    let mut tar_split = TarSplitWriter::new(options.level)?;
    let mut toc = Toc::default();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    while let Some(item) = reader.next_item()? {
        let entry = match item {
            TarItem::Trailer(raw) => {
                frames.write_all(&raw)?;
                tar_split.add_segment(&raw)?;
                break;
            }
            TarItem::Entry(entry) => entry,
        };
        frames.write_all(&entry.raw)?;
        tar_split.add_segment(&entry.raw)?;

        let meta = FileMetadata::from_tar_header(&entry.header);
        let header = &entry.header;

        match meta {
            Some(mut meta) if meta.entry_type == EntryType::Reg => {
                let mut chunker = PayloadChunker::new(&mut frames, options)?;
                loop {
                    let n = reader.read_payload(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    chunker.feed(&buf[..n])?;
                }
                let (chunks, digest, crc) = chunker.finish()?;
                tar_split.add_file(&header.name, header.size, crc)?;

                if header.size > 0 {
                    meta.digest = digest;
                }
                let mut chunks = chunks.into_iter();
                if let Some(first) = chunks.next() {
                    add_chunk_fields(&mut meta, &first);
                }
                let name = meta.name.clone();
                toc.entries.push(meta);
                for chunk in chunks {
                    let mut cont = FileMetadata {
                        entry_type: EntryType::Chunk,
                        name: name.clone(),
                        ..Default::default()
                    };
                    add_chunk_fields(&mut cont, &chunk);
                    toc.entries.push(cont);
                }
            }
            meta => {
                if let Some(meta) = meta {
                    toc.entries.push(meta);
                } else {
                    tracing::debug!(
                        "no manifest entry for {:?} (type {:?})",
                        header.name,
                        header.typeflag as char
                    );
                }
                // Payload of entry types the manifest does not describe.
                loop {
                    let n = reader.read_payload(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    frames.write_all(&buf[..n])?;
                    tar_split.add_segment(&buf[..n])?;
                }
            }
        }
    }
    drop(reader);

    let counting = frames.finish()?;
    let offset = counting.count;
    let mut out = counting.inner;

    let (tar_split_bytes, tar_split_len) = tar_split.finish()?;
    let manifest = write_zstd_chunked_manifest(
        &mut out,
        offset,
        &mut toc,
        &tar_split_bytes,
        tar_split_len,
        options.level,
    )?;
    out.flush()?;

    // The blob is still valid when the input cannot be indexed, e.g. a hard
    // link to an entry the tarball does not contain; readers reject it.
    let cache = match CacheFile::build(&toc) {
        Ok(cache) => cache.to_bytes()?,
        Err(e) => {
            tracing::warn!("not building cache file: {}", e);
            Vec::new()
        }
    };
    tracing::debug!(
        "compressed layer: {} manifest entries, {} bytes",
        toc.entries.len(),
        offset + manifest.written
    );

    Ok(CompressionOutput {
        annotations: manifest.footer.annotations(&manifest.manifest_digest),
        toc_digest: manifest.manifest_digest,
        toc,
        cache,
        tar_split: tar_split_bytes,
        uncompressed_digest: input_digest.finish(),
        written: offset + manifest.written,
    })
}

struct TeeReader<'a, R> {
    inner: R,
    digest: &'a mut Digester,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::read_zstd_chunked_manifest;
    use crate::source::MemoryBlobSource;
    use crate::tar_split::reassemble_tar;
    use crate::toc::merge_toc_entries;

    fn pseudo_random(len: usize, mut seed: u32) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (seed >> 16) as u8
            })
            .collect()
    }

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        dir.set_mtime(1_700_000_000);
        builder.append_data(&mut dir, "data/", &b""[..]).unwrap();
        for (name, content) in files {
            let mut h = tar::Header::new_gnu();
            h.set_mode(0o644);
            h.set_size(content.len() as u64);
            h.set_mtime(1_700_000_000);
            builder.append_data(&mut h, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn small_chunks() -> CompressorOptions {
        CompressorOptions {
            rollsum_bits: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_blob_decompresses_to_input() {
        let tar = build_tar(&[("data/a", b"hello"), ("data/empty", b"")]);
        let mut blob = Vec::new();
        let out = compress(&tar[..], &mut blob, &CompressorOptions::default()).unwrap();
        assert_eq!(out.written, blob.len() as u64);
        assert_eq!(zstd::stream::decode_all(&blob[..]).unwrap(), tar);
        assert_eq!(out.uncompressed_digest, crate::digest::sha256_digest(&tar));
    }

    #[test]
    fn test_manifest_entries() {
        let tar = build_tar(&[("data/a", b"hello"), ("data/empty", b"")]);
        let mut blob = Vec::new();
        let out = compress(&tar[..], &mut blob, &CompressorOptions::default()).unwrap();
        let names: Vec<_> = out.toc.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["data/", "data/a", "data/empty"]);

        let a = &out.toc.entries[1];
        assert_eq!(a.digest, crate::digest::sha256_digest(b"hello"));
        assert_eq!(a.chunk_digest, a.digest);
        assert!(a.end_offset > a.offset);

        let frame = &blob[a.offset as usize..a.end_offset as usize];
        assert_eq!(zstd::stream::decode_all(frame).unwrap(), b"hello");

        let empty = &out.toc.entries[2];
        assert!(empty.digest.is_empty());
        assert_eq!(empty.offset, 0);
    }

    #[test]
    fn test_large_file_is_chunked() {
        let content = pseudo_random(64 * 1024, 1);
        let tar = build_tar(&[("data/big", &content)]);
        let mut blob = Vec::new();
        let out = compress(&tar[..], &mut blob, &small_chunks()).unwrap();

        let merged = merge_toc_entries(&out.toc.entries, blob.len() as u64).unwrap();
        let big = &merged[1];
        assert!(big.chunks.len() >= 2);
        let mut rebuilt = Vec::new();
        for chunk in &big.chunks {
            let frame = &blob[chunk.offset as usize..chunk.end_offset as usize];
            let data = zstd::stream::decode_all(frame).unwrap();
            assert_eq!(data.len() as u64, chunk.size);
            assert_eq!(crate::digest::sha256_digest(&data), chunk.digest);
            rebuilt.extend_from_slice(&data);
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_zero_runs_become_holes() {
        let mut content = pseudo_random(3000, 5);
        content[2999] = 1;
        content.extend(std::iter::repeat_n(0u8, 8192));
        let mut tail = pseudo_random(3000, 6);
        tail[0] = 1;
        content.extend(tail);
        content.extend(std::iter::repeat_n(0u8, 100));
        let tar = build_tar(&[("data/sparse", &content)]);
        let mut blob = Vec::new();
        let out = compress(&tar[..], &mut blob, &CompressorOptions::default()).unwrap();

        let merged = merge_toc_entries(&out.toc.entries, blob.len() as u64).unwrap();
        let chunks = &merged[1].chunks;
        let holes: Vec<_> = chunks.iter().filter(|c| c.is_hole()).collect();
        assert_eq!(holes.len(), 1);
        assert_eq!(holes[0].chunk_offset, 3000);
        assert_eq!(holes[0].size, 8192);
        assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), content.len() as u64);
        assert_eq!(merged[1].meta.digest, crate::digest::sha256_digest(&content));
        assert_eq!(zstd::stream::decode_all(&blob[..]).unwrap(), tar);
    }

    #[test]
    fn test_metadata_roundtrip_and_reassembly() {
        let content = pseudo_random(10_000, 9);
        let tar = build_tar(&[("data/x", &content), ("data/y", b"why")]);
        let mut blob = Vec::new();
        let out = compress(&tar[..], &mut blob, &small_chunks()).unwrap();

        let source = MemoryBlobSource::new(blob.clone());
        let read = read_zstd_chunked_manifest(&source, blob.len() as u64, &out.annotations).unwrap();
        assert_eq!(read.toc, out.toc);
        assert_eq!(read.tar_split, out.tar_split);

        let mut rebuilt = Vec::new();
        reassemble_tar(
            &out.tar_split,
            |name| match name {
                "data/x" => Ok(&content[..]),
                "data/y" => Ok(&b"why"[..]),
                other => Err(ChunkedError::format(format!("unexpected {}", other))),
            },
            &mut rebuilt,
        )
        .unwrap();
        assert_eq!(rebuilt, tar);

        let cache = CacheFile::from_bytes(&out.cache).unwrap();
        assert!(cache.lookup(&crate::digest::sha256_digest(b"why")).is_some());
    }

    #[test]
    fn test_rejects_bad_window() {
        let options = CompressorOptions {
            window_size: 60,
            ..Default::default()
        };
        assert!(compress(&b""[..], Vec::new(), &options).is_err());
    }

    #[test]
    fn test_truncated_tar_fails() {
        let tar = build_tar(&[("data/a", &[7u8; 4000])]);
        let mut blob = Vec::new();
        assert!(compress(&tar[..1500], &mut blob, &CompressorOptions::default()).is_err());
    }
}
