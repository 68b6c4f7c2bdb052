//! Raw tar parsing and tar-split decoding.
//!
//! The compressor must reproduce its input byte for byte, so it cannot use a
//! tar library that re-synthesizes headers. [`TarStreamReader`] walks the
//! stream block by block and hands back every header together with the exact
//! bytes it was built from, including GNU long name records, PAX extended
//! headers and the padding of the previous payload.
//!
//! The second half of this module reads tar-split metadata: NDJSON records,
//! zstd-compressed, where type 2 segments carry raw header bytes and type 1
//! records reference file payloads by name and CRC-64/GO-ISO. Together with the
//! files of a checkout that is enough to rebuild the original tar stream (see
//! [`reassemble_tar`]).

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};

use base64::prelude::*;
use crc::{CRC_64_GO_ISO, Crc};
use serde::Deserialize;

use crate::error::{ChunkedError, Result};

/// CRC64-ISO implementation for file checksums.
pub(crate) static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Size of a tar block.
pub const BLOCK_SIZE: u64 = 512;

/// Bytes of zero padding needed after a payload of `size` bytes.
pub fn tar_padding(size: u64) -> u64 {
    (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE
}

/// Tar header information, after applying GNU and PAX extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TarHeader {
    /// File path in the tar archive (e.g., "./etc/hosts")
    pub name: String,

    /// File mode (permissions and type information)
    pub mode: u32,

    /// User ID of the file owner
    pub uid: u32,

    /// Group ID of the file owner
    pub gid: u32,

    /// File size in bytes
    pub size: u64,

    /// Modification time (Unix timestamp)
    pub mtime: i64,

    /// Sub-second part of the modification time, from PAX records.
    pub mtime_nsec: u32,

    /// Access time from PAX or GNU headers.
    pub atime: Option<(i64, u32)>,

    /// Change time from PAX or GNU headers.
    pub ctime: Option<(i64, u32)>,

    /// Tar entry type flag:
    /// - b'0' or b'\0': Regular file
    /// - b'1': Hard link
    /// - b'2': Symbolic link
    /// - b'3': Character device
    /// - b'4': Block device
    /// - b'5': Directory
    /// - b'6': FIFO
    pub typeflag: u8,

    /// Link target for symbolic links and hard links
    pub linkname: String,

    /// User name of the file owner
    pub uname: String,

    /// Group name of the file owner
    pub gname: String,

    /// Major device number (for device files)
    pub devmajor: u32,

    /// Minor device number (for device files)
    pub devminor: u32,

    /// Extended attributes from `SCHILY.xattr.*` PAX records.
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

/// Extract a NUL-terminated string from a header field.
fn field_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Parse an octal or base-256 numeric field.
fn parse_numeric(bytes: &[u8]) -> Result<u64> {
    if let Some(&first) = bytes.first()
        && first & 0x80 != 0
    {
        if first == 0xff {
            return Err(ChunkedError::format("negative base-256 value in tar header"));
        }
        let mut value = u64::from(first & 0x7f);
        for &b in &bytes[1..] {
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(u64::from(b)))
                .ok_or_else(|| ChunkedError::format("base-256 value overflows"))?;
        }
        return Ok(value);
    }
    let s = field_string(bytes);
    let trimmed = s.trim_matches(|c: char| c == ' ' || c == '\0');
    if trimmed.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(trimmed, 8)
        .map_err(|e| ChunkedError::format(format!("failed to parse octal '{}': {}", trimmed, e)))
}

impl TarHeader {
    /// Parse a TarHeader from a 512-byte TAR header block.
    ///
    /// The TAR header format (ustar):
    /// - 0-99: name
    /// - 100-107: mode (octal)
    /// - 108-115: uid (octal)
    /// - 116-123: gid (octal)
    /// - 124-135: size (octal)
    /// - 136-147: mtime (octal)
    /// - 148-155: checksum (octal)
    /// - 156: typeflag
    /// - 157-256: linkname
    /// - 257-262: magic ("ustar\0", or "ustar " for GNU)
    /// - 263-264: version
    /// - 265-296: uname
    /// - 297-328: gname
    /// - 329-336: devmajor (octal)
    /// - 337-344: devminor (octal)
    /// - 345-500: prefix (ustar) or atime/ctime (GNU)
    pub fn from_bytes(header: &[u8]) -> Result<Self> {
        if header.len() < BLOCK_SIZE as usize {
            return Err(ChunkedError::format(format!(
                "TAR header too short: {} bytes",
                header.len()
            )));
        }

        // The checksum is computed with the checksum field treated as spaces
        let stored_checksum = {
            let checksum_bytes = &header[148..156];
            let null_pos = checksum_bytes
                .iter()
                .position(|&b| b == 0 || b == b' ')
                .unwrap_or(checksum_bytes.len());
            let s = std::str::from_utf8(&checksum_bytes[..null_pos])
                .map_err(|_| ChunkedError::format("invalid checksum field"))?
                .trim();
            if s.is_empty() {
                return Err(ChunkedError::format("empty checksum field"));
            }
            u32::from_str_radix(s, 8)
                .map_err(|e| ChunkedError::format(format!("invalid checksum '{}': {}", s, e)))?
        };

        let computed_checksum: u32 = header[..148]
            .iter()
            .chain(std::iter::repeat_n(&b' ', 8))
            .chain(header[156..512].iter())
            .map(|&b| b as u32)
            .sum();

        if stored_checksum != computed_checksum {
            return Err(ChunkedError::format(format!(
                "checksum mismatch: stored {} != computed {}",
                stored_checksum, computed_checksum
            )));
        }

        let magic = &header[257..263];
        let is_ustar = magic == b"ustar\0";
        let is_gnu = magic == b"ustar ";

        let mut name = field_string(&header[0..100]);
        if is_ustar {
            let prefix = field_string(&header[345..500]);
            if !prefix.is_empty() {
                name = format!("{}/{}", prefix, name);
            }
        }

        let (atime, ctime) = if is_gnu {
            let a = parse_numeric(&header[345..357])? as i64;
            let c = parse_numeric(&header[357..369])? as i64;
            ((a != 0).then_some((a, 0)), (c != 0).then_some((c, 0)))
        } else {
            (None, None)
        };

        Ok(TarHeader {
            name,
            mode: parse_numeric(&header[100..108])? as u32,
            uid: parse_numeric(&header[108..116])? as u32,
            gid: parse_numeric(&header[116..124])? as u32,
            size: parse_numeric(&header[124..136])?,
            mtime: parse_numeric(&header[136..148])? as i64,
            mtime_nsec: 0,
            atime,
            ctime,
            typeflag: header[156],
            linkname: field_string(&header[157..257]),
            uname: field_string(&header[265..297]),
            gname: field_string(&header[297..329]),
            devmajor: parse_numeric(&header[329..337])? as u32,
            devminor: parse_numeric(&header[337..345])? as u32,
            xattrs: BTreeMap::new(),
        })
    }

    /// Check if this header represents a regular file.
    pub fn is_regular_file(&self) -> bool {
        self.typeflag == b'0' || self.typeflag == b'\0' || self.typeflag == b'7'
    }

    /// Check if this header represents a directory.
    pub fn is_directory(&self) -> bool {
        self.typeflag == b'5'
    }

    /// Check if this header represents a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.typeflag == b'2'
    }

    /// Check if this header represents a hard link.
    pub fn is_hardlink(&self) -> bool {
        self.typeflag == b'1'
    }

    /// Whether the entry has payload bytes following its header.
    pub fn has_payload(&self) -> bool {
        !matches!(self.typeflag, b'1' | b'2' | b'3' | b'4' | b'5' | b'6')
    }

    /// Normalize the path by stripping leading "./"
    pub fn normalized_name(&self) -> &str {
        self.name.strip_prefix("./").unwrap_or(&self.name)
    }

    fn apply_pax(&mut self, records: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        for (key, value) in records {
            let text = || String::from_utf8_lossy(value).into_owned();
            let number = |what: &str| -> Result<u64> {
                text().parse().map_err(|_| {
                    ChunkedError::format(format!("invalid PAX {} record {:?}", what, text()))
                })
            };
            match key.as_str() {
                "path" => self.name = text(),
                "linkpath" => self.linkname = text(),
                "size" => self.size = number("size")?,
                "uid" => self.uid = number("uid")? as u32,
                "gid" => self.gid = number("gid")? as u32,
                "uname" => self.uname = text(),
                "gname" => self.gname = text(),
                "mtime" => {
                    let (s, ns) = parse_pax_time(&text())?;
                    self.mtime = s;
                    self.mtime_nsec = ns;
                }
                "atime" => self.atime = Some(parse_pax_time(&text())?),
                "ctime" => self.ctime = Some(parse_pax_time(&text())?),
                k => {
                    if let Some(xattr) = k.strip_prefix("SCHILY.xattr.") {
                        self.xattrs.insert(xattr.to_string(), value.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parse a PAX timestamp like `1700000000.123456789`.
fn parse_pax_time(s: &str) -> Result<(i64, u32)> {
    let invalid = || ChunkedError::format(format!("invalid PAX time {:?}", s));
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs: i64 = secs.parse().map_err(|_| invalid())?;
    let mut nanos = 0u32;
    for (i, c) in frac.chars().take(9).enumerate() {
        let d = c.to_digit(10).ok_or_else(invalid)?;
        nanos += d * 10u32.pow(8 - i as u32);
    }
    Ok((secs, nanos))
}

/// Parse the records of a PAX extended header payload.
fn parse_pax_records(mut data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut records = BTreeMap::new();
    while !data.is_empty() {
        let space = data
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| ChunkedError::format("malformed PAX record"))?;
        let len: usize = std::str::from_utf8(&data[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ChunkedError::format("malformed PAX record length"))?;
        if len <= space + 1 || len > data.len() || data[len - 1] != b'\n' {
            return Err(ChunkedError::format("malformed PAX record"));
        }
        let record = &data[space + 1..len - 1];
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| ChunkedError::format("PAX record without '='"))?;
        let key = String::from_utf8_lossy(&record[..eq]).into_owned();
        records.insert(key, record[eq + 1..].to_vec());
        data = &data[len..];
    }
    Ok(records)
}

/// One filesystem entry of a tar stream.
#[derive(Debug, Clone)]
pub struct TarEntry {
    /// Effective header after extensions.
    pub header: TarHeader,
    /// Every byte consumed since the previous payload: its padding, extension
    /// headers with their payloads, and the entry's own header block.
    pub raw: Vec<u8>,
}

/// Item produced by [`TarStreamReader::next_item`].
#[derive(Debug)]
pub enum TarItem {
    /// A filesystem entry; its payload must be read before the next call.
    Entry(TarEntry),
    /// Bytes after the last entry: padding, end-of-archive blocks and any
    /// trailing data.
    Trailer(Vec<u8>),
}

/// Block-level tar reader that preserves the raw bytes of the stream.
#[derive(Debug)]
pub struct TarStreamReader<R> {
    inner: R,
    remaining: u64,
    padding: u64,
    global: BTreeMap<String, Vec<u8>>,
    finished: bool,
}

impl<R: Read> TarStreamReader<R> {
    /// Wrap a tar stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
            global: BTreeMap::new(),
            finished: false,
        }
    }

    /// Read exactly one block; `Ok(false)` on clean end of input.
    fn read_block(&mut self, block: &mut [u8; 512]) -> Result<bool> {
        let mut filled = 0;
        while filled < block.len() {
            let n = self.inner.read(&mut block[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(ChunkedError::format("truncated tar header"));
            }
            filled += n;
        }
        Ok(true)
    }

    fn read_extension(&mut self, size: u64, raw: &mut Vec<u8>) -> Result<Vec<u8>> {
        let total = size + tar_padding(size);
        let start = raw.len();
        (&mut self.inner).take(total).read_to_end(raw)?;
        if (raw.len() - start) as u64 != total {
            return Err(ChunkedError::format("truncated tar extension header"));
        }
        Ok(raw[start..start + size as usize].to_vec())
    }

    /// Advance to the next entry.
    ///
    /// Fails if the payload of the previous entry was not fully consumed.
    pub fn next_item(&mut self) -> Result<Option<TarItem>> {
        if self.finished {
            return Ok(None);
        }
        if self.remaining != 0 {
            return Err(ChunkedError::format("tar payload was not consumed"));
        }

        let mut raw = Vec::new();
        (&mut self.inner).take(self.padding).read_to_end(&mut raw)?;
        if raw.len() as u64 != self.padding {
            return Err(ChunkedError::format("truncated tar padding"));
        }
        self.padding = 0;

        let mut long_name: Option<String> = None;
        let mut long_link: Option<String> = None;
        let mut pax: Option<BTreeMap<String, Vec<u8>>> = None;

        loop {
            let mut block = [0u8; 512];
            if !self.read_block(&mut block)? {
                if long_name.is_some() || long_link.is_some() || pax.is_some() {
                    return Err(ChunkedError::format("tar stream ends inside an entry"));
                }
                self.finished = true;
                return Ok(Some(TarItem::Trailer(raw)));
            }
            raw.extend_from_slice(&block);

            if block.iter().all(|&b| b == 0) {
                self.inner.read_to_end(&mut raw)?;
                self.finished = true;
                return Ok(Some(TarItem::Trailer(raw)));
            }

            let mut header = TarHeader::from_bytes(&block)?;
            match header.typeflag {
                b'L' => {
                    let data = self.read_extension(header.size, &mut raw)?;
                    long_name = Some(field_string(&data));
                }
                b'K' => {
                    let data = self.read_extension(header.size, &mut raw)?;
                    long_link = Some(field_string(&data));
                }
                b'x' | b'X' => {
                    let data = self.read_extension(header.size, &mut raw)?;
                    pax = Some(parse_pax_records(&data)?);
                }
                b'g' => {
                    let data = self.read_extension(header.size, &mut raw)?;
                    self.global.extend(parse_pax_records(&data)?);
                }
                _ => {
                    if let Some(name) = long_name.take() {
                        header.name = name;
                    }
                    if let Some(link) = long_link.take() {
                        header.linkname = link;
                    }
                    header.apply_pax(&self.global)?;
                    if let Some(records) = pax.take() {
                        header.apply_pax(&records)?;
                    }
                    if header.has_payload() {
                        self.remaining = header.size;
                        self.padding = tar_padding(header.size);
                    }
                    return Ok(Some(TarItem::Entry(TarEntry { header, raw })));
                }
            }
        }
    }

    /// Read payload bytes of the current entry.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(ChunkedError::format("truncated tar payload"));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Raw tar-split entry from NDJSON format before validation.
#[derive(Debug, Deserialize)]
struct TarSplitEntryRaw {
    /// Entry type discriminant: 1 for File, 2 for Segment.
    #[serde(rename = "type")]
    type_id: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    crc64: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

/// A decoded tar-split record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TarSplitEntry {
    /// Reference to a file payload.
    File {
        /// Name as written in the tar header.
        name: String,
        /// Payload size.
        size: u64,
        /// CRC-64/GO-ISO of the payload, when recorded.
        crc64: Option<u64>,
    },
    /// Raw bytes to copy verbatim.
    Segment(Vec<u8>),
}

impl TarSplitEntry {
    fn from_raw(raw: TarSplitEntryRaw) -> Result<Self> {
        match raw.type_id {
            1 => {
                let crc64 = match raw.crc64 {
                    Some(b64) => {
                        let bytes = BASE64_STANDARD.decode(b64).map_err(|e| {
                            ChunkedError::format(format!("invalid tar-split crc64: {}", e))
                        })?;
                        let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
                            ChunkedError::format("tar-split crc64 is not 8 bytes")
                        })?;
                        Some(u64::from_be_bytes(bytes))
                    }
                    None => None,
                };
                Ok(TarSplitEntry::File {
                    name: raw.name.unwrap_or_default(),
                    size: raw.size.unwrap_or(0),
                    crc64,
                })
            }
            2 => {
                let payload = match raw.payload {
                    Some(b64) => BASE64_STANDARD.decode(b64).map_err(|e| {
                        ChunkedError::format(format!("invalid tar-split payload: {}", e))
                    })?,
                    None => Vec::new(),
                };
                Ok(TarSplitEntry::Segment(payload))
            }
            other => Err(ChunkedError::format(format!(
                "invalid tar-split entry type: {}",
                other
            ))),
        }
    }
}

/// Decode a zstd-compressed tar-split stream.
pub fn read_tar_split(compressed: &[u8]) -> Result<Vec<TarSplitEntry>> {
    let decoder = zstd::stream::read::Decoder::new(compressed)?;
    let mut entries = Vec::new();
    for line in BufReader::new(decoder).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: TarSplitEntryRaw = serde_json::from_str(&line)?;
        entries.push(TarSplitEntry::from_raw(raw)?);
    }
    Ok(entries)
}

/// Rebuild a tar stream from tar-split metadata.
///
/// `open` is called with the normalized name of every file with payload and
/// must return a reader over its contents. Payload sizes and CRCs are checked.
pub fn reassemble_tar<F, R, W>(compressed: &[u8], mut open: F, out: &mut W) -> Result<u64>
where
    F: FnMut(&str) -> Result<R>,
    R: Read,
    W: Write,
{
    let mut written = 0u64;
    for entry in read_tar_split(compressed)? {
        match entry {
            TarSplitEntry::Segment(bytes) => {
                out.write_all(&bytes)?;
                written += bytes.len() as u64;
            }
            TarSplitEntry::File { name, size, crc64 } => {
                if size == 0 {
                    continue;
                }
                let normalized = name.strip_prefix("./").unwrap_or(&name);
                let mut reader = open(normalized)?.take(size);
                let mut digest = CRC64_ISO.digest();
                let mut buf = vec![0u8; 64 * 1024];
                let mut copied = 0u64;
                loop {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    digest.update(&buf[..n]);
                    out.write_all(&buf[..n])?;
                    copied += n as u64;
                }
                if copied != size {
                    return Err(ChunkedError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{}: expected {} bytes, read {}", name, size, copied),
                    )));
                }
                if let Some(expected) = crc64 {
                    let computed = digest.finalize();
                    if computed != expected {
                        return Err(ChunkedError::format(format!(
                            "CRC64 mismatch for {}: expected {:016x}, got {:016x}",
                            name, expected, computed
                        )));
                    }
                }
                written += size;
            }
        }
    }
    Ok(written)
}
