//! Content digests and the fixed-width tag records of the cache index.
//!
//! Digests travel through the manifest as `sha256:<hex>` strings. Inside a
//! cache file they are stored in binary form: the algorithm prefix followed by
//! the raw hash bytes, so every binary digest in a file has the same length.
//!
//! A tag binds a binary digest to a location in the cache's variable data:
//!
//! ```text
//! +----------------------+-----------------+-----------------+
//! | binary digest        | offset (u64 LE) | length (u64 LE) |
//! +----------------------+-----------------+-----------------+
//! ```

use std::cmp::Ordering;
use std::io::{self, Write};

use oci_spec::image::{Digest, DigestAlgorithm};
use sha2::{Digest as _, Sha256};

use crate::error::{ChunkedError, Result};

/// Algorithm prefix of every digest this crate produces.
pub const SHA256_PREFIX: &str = "sha256:";

/// Length of a binary sha256 digest: prefix plus 32 hash bytes.
pub const BINARY_DIGEST_LEN: usize = SHA256_PREFIX.len() + 32;

/// Bytes used for the offset and length that follow the digest in a tag.
pub const TAG_LOCATION_LEN: usize = 16;

/// Streaming sha256 hasher producing `sha256:<hex>` strings.
#[derive(Debug, Clone, Default)]
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    /// Create a new, empty digester.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish hashing and format the digest.
    pub fn finish(self) -> String {
        format!("{}{}", SHA256_PREFIX, hex::encode(self.hasher.finalize()))
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Digest a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut d = Digester::new();
    d.update(data);
    d.finish()
}

/// Parse and validate a sha256 digest string.
pub fn parse_sha256(digest: &str) -> Result<Digest> {
    let parsed: Digest = digest
        .parse()
        .map_err(|e| ChunkedError::format(format!("invalid digest {:?}: {}", digest, e)))?;
    if !matches!(parsed.algorithm(), DigestAlgorithm::Sha256) {
        return Err(ChunkedError::format(format!(
            "unsupported digest algorithm in {:?}",
            digest
        )));
    }
    Ok(parsed)
}

/// Fail with [`ChunkedError::DigestMismatch`] unless the digests are equal.
pub fn verify_digest(expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(ChunkedError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Encode a `sha256:<hex>` digest in its fixed-width binary form.
pub fn digest_to_binary(digest: &str) -> Result<Vec<u8>> {
    let parsed = parse_sha256(digest)?;
    let raw = hex::decode(parsed.digest())
        .map_err(|e| ChunkedError::format(format!("invalid digest {:?}: {}", digest, e)))?;
    if raw.len() != BINARY_DIGEST_LEN - SHA256_PREFIX.len() {
        return Err(ChunkedError::format(format!(
            "invalid digest length in {:?}",
            digest
        )));
    }
    let mut out = Vec::with_capacity(BINARY_DIGEST_LEN);
    out.extend_from_slice(SHA256_PREFIX.as_bytes());
    out.extend_from_slice(&raw);
    Ok(out)
}

/// Length of one tag record for digests of `digest_len` bytes.
pub fn tag_len(digest_len: usize) -> usize {
    digest_len + TAG_LOCATION_LEN
}

/// Append a tag record to `out`.
pub fn append_tag(out: &mut Vec<u8>, binary_digest: &[u8], offset: u64, len: u64) {
    out.extend_from_slice(binary_digest);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
}

/// Binary search a sorted tag table.
///
/// Returns the `(offset, length)` location stored with `binary_digest`, or
/// `None` when the digest is absent or has the wrong width for this table.
pub fn find_tag(binary_digest: &[u8], tags: &[u8], digest_len: usize) -> Option<(u64, u64)> {
    let tag_len = tag_len(digest_len);
    if binary_digest.len() != digest_len || tag_len == 0 || tags.len() % tag_len != 0 {
        return None;
    }
    let record = |i: usize| &tags[i * tag_len..(i + 1) * tag_len];

    let (mut lo, mut hi) = (0usize, tags.len() / tag_len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let rec = record(mid);
        match rec[..digest_len].cmp(binary_digest) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => {
                let off = u64::from_le_bytes(rec[digest_len..digest_len + 8].try_into().ok()?);
                let len = u64::from_le_bytes(rec[digest_len + 8..].try_into().ok()?);
                return Some((off, len));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest_empty() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_digester_matches_oneshot() {
        let mut d = Digester::new();
        d.write_all(b"hello ").unwrap();
        d.update(b"world");
        assert_eq!(d.finish(), sha256_digest(b"hello world"));
    }

    #[test]
    fn test_digest_to_binary() {
        let digest = sha256_digest(b"abc");
        let bin = digest_to_binary(&digest).unwrap();
        assert_eq!(bin.len(), BINARY_DIGEST_LEN);
        assert!(bin.starts_with(b"sha256:"));
        assert_eq!(hex::encode(&bin[7..]), &digest[7..]);
    }

    #[test]
    fn test_digest_to_binary_rejects_garbage() {
        assert!(digest_to_binary("sha256:zz").is_err());
        assert!(digest_to_binary("notadigest").is_err());
        assert!(digest_to_binary("sha512:abcd").is_err());
    }

    #[test]
    fn test_verify_digest() {
        assert!(verify_digest("sha256:aa", "sha256:aa").is_ok());
        let err = verify_digest("sha256:aa", "sha256:bb").unwrap_err();
        assert!(matches!(err, ChunkedError::DigestMismatch { .. }));
    }

    #[test]
    fn test_find_tag() {
        let mut digests: Vec<Vec<u8>> = (0..50u32)
            .map(|i| digest_to_binary(&sha256_digest(&i.to_le_bytes())).unwrap())
            .collect();
        digests.sort();

        let mut tags = Vec::new();
        for (i, d) in digests.iter().enumerate() {
            append_tag(&mut tags, d, i as u64 * 10, i as u64 + 1);
        }

        for (i, d) in digests.iter().enumerate() {
            assert_eq!(
                find_tag(d, &tags, BINARY_DIGEST_LEN),
                Some((i as u64 * 10, i as u64 + 1))
            );
        }

        let missing = digest_to_binary(&sha256_digest(b"missing")).unwrap();
        assert_eq!(find_tag(&missing, &tags, BINARY_DIGEST_LEN), None);
        assert_eq!(find_tag(&missing[..10], &tags, BINARY_DIGEST_LEN), None);
        assert_eq!(find_tag(&missing, &[], BINARY_DIGEST_LEN), None);
    }
}
