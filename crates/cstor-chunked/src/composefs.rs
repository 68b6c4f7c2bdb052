//! Composefs output.
//!
//! Instead of a writable tree, a layer can be stored as a flat object store
//! of regular file contents (`xx/<rest of the sha256>`) plus a read-only EROFS
//! image describing the tree, which composefs mounts on top of the objects.
//!
//! The image is produced by the external `mkcomposefs` tool from a dumpfile
//! rendered here; fs-verity is enabled with the `fsverity` tool and the image
//! is mounted with `mount`. Availability of the tools is probed once per
//! process.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{ChunkedError, Result};
use crate::toc::{EntryType, FileMetadata, Toc, clean_name};

/// Directory inside the layer holding the composefs image.
pub const COMPOSEFS_DATA_DIR: &str = "composefs-data";

/// File name of the composefs image.
pub const COMPOSEFS_BLOB_NAME: &str = "composefs.blob";

const MKCOMPOSEFS: &str = "mkcomposefs";
const FSVERITY: &str = "fsverity";

fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| {
            use std::os::unix::fs::PermissionsExt;
            candidate
                .metadata()
                .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        })
}

#[cfg(target_os = "linux")]
fn mkcomposefs_path() -> Option<&'static Path> {
    use std::sync::OnceLock;

    static MKCOMPOSEFS_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();
    MKCOMPOSEFS_PATH
        .get_or_init(|| find_in_path(MKCOMPOSEFS))
        .as_deref()
}

/// Check that composefs images can be produced on this host.
#[cfg(target_os = "linux")]
pub fn composefs_supported() -> Result<()> {
    match mkcomposefs_path() {
        Some(_) => Ok(()),
        None => Err(ChunkedError::Unsupported(format!(
            "composefs: {} not found in PATH",
            MKCOMPOSEFS
        ))),
    }
}

/// Check that composefs images can be produced on this host.
#[cfg(not(target_os = "linux"))]
pub fn composefs_supported() -> Result<()> {
    Err(ChunkedError::Unsupported(
        "composefs is only available on Linux".to_string(),
    ))
}

/// Path of the object holding content with `digest`, relative to the
/// object store.
pub fn object_path(digest: &str) -> Result<String> {
    let hex = crate::digest::parse_sha256(digest)
        .map(|_| &digest[crate::digest::SHA256_PREFIX.len()..])?;
    Ok(format!("{}/{}", &hex[..2], &hex[2..]))
}

/// Escape a dumpfile field.
///
/// Backslash, `=`, spaces and bytes outside printable ASCII become `\xHH`;
/// a field consisting of a single `-` is escaped so it is not read as empty.
fn escape(out: &mut String, s: &[u8], escape_equal: bool) {
    if s.is_empty() || s == b"-" {
        out.push_str(if s.is_empty() { "-" } else { "\\x2d" });
        return;
    }
    for &b in s {
        if b == b'\\' || (escape_equal && b == b'=') || !(0x21..0x7f).contains(&b) {
            let _ = write!(out, "\\x{:02x}", b);
        } else {
            out.push(b as char);
        }
    }
}

fn timestamp(meta: &FileMetadata) -> String {
    match meta.modtime {
        Some(t) => format!("{}.{}", t.timestamp(), t.timestamp_subsec_nanos()),
        None => "0.0".to_string(),
    }
}

fn type_bits(entry_type: EntryType) -> u32 {
    match entry_type {
        EntryType::Dir => 0o040000,
        EntryType::Symlink => 0o120000,
        EntryType::Char => 0o020000,
        EntryType::Block => 0o060000,
        EntryType::Fifo => 0o010000,
        _ => 0o100000,
    }
}

fn dump_path(out: &mut String, name: &str) {
    let mut path = String::with_capacity(name.len() + 1);
    path.push('/');
    path.push_str(name);
    escape(out, path.as_bytes(), false);
}

fn dump_implicit_dir(out: &mut String, name: &str) {
    dump_path(out, name);
    out.push_str(" 0 40755 2 0 0 0 0.0 - - -\n");
}

fn dump_entry(
    out: &mut String,
    meta: &FileMetadata,
    verity: &HashMap<String, String>,
) -> Result<()> {
    dump_path(out, &meta.name);
    if meta.entry_type == EntryType::Hardlink {
        out.push_str(" 0 @120000 - - - - 0.0 ");
        let mut target = String::from("/");
        target.push_str(&meta.link_name);
        escape(out, target.as_bytes(), false);
        out.push_str(" - -\n");
        return Ok(());
    }

    let nlink = if meta.entry_type == EntryType::Dir { 2 } else { 1 };
    let rdev = match meta.entry_type {
        EntryType::Char | EntryType::Block => {
            rustix::fs::makedev(meta.dev_major, meta.dev_minor)
        }
        _ => 0,
    };
    let size = if meta.entry_type == EntryType::Symlink {
        meta.link_name.len() as u64
    } else {
        meta.size
    };
    let _ = write!(
        out,
        " {} {:o} {} {} {} {} {} ",
        size,
        type_bits(meta.entry_type) | (meta.mode & 0o7777),
        nlink,
        meta.uid,
        meta.gid,
        rdev,
        timestamp(meta)
    );

    match meta.entry_type {
        EntryType::Symlink => escape(out, meta.link_name.as_bytes(), false),
        EntryType::Reg if meta.size > 0 => escape(out, object_path(&meta.digest)?.as_bytes(), false),
        _ => out.push('-'),
    }
    // Content is never inlined.
    out.push_str(" - ");
    let digest = match meta.entry_type {
        EntryType::Reg if meta.size > 0 => object_path(&meta.digest)
            .ok()
            .and_then(|p| verity.get(&p).cloned()),
        _ => None,
    };
    out.push_str(digest.as_deref().unwrap_or("-"));

    for (key, value) in meta.decoded_xattrs()? {
        out.push(' ');
        escape(out, key.as_bytes(), true);
        out.push('=');
        escape(out, &value, true);
    }
    out.push('\n');
    Ok(())
}

/// Render a TOC as a composefs dumpfile.
///
/// `verity_digests` maps object paths (see [`object_path`]) to their
/// fs-verity digests; objects without an entry are written without one.
/// Directories implied by entry names but absent from the TOC are emitted
/// with default attributes before their first child.
pub fn generate_dump(toc: &Toc, verity_digests: &HashMap<String, String>) -> Result<String> {
    let mut out = String::new();
    let mut dirs: HashSet<String> = HashSet::new();
    let mut emitted: HashSet<String> = HashSet::new();

    let root = toc
        .entries
        .iter()
        .find(|e| e.entry_type == EntryType::Dir && clean_name(&e.name).is_empty());
    match root {
        Some(meta) => {
            let mut meta = meta.clone();
            meta.name = String::new();
            dump_entry(&mut out, &meta, verity_digests)?;
        }
        None => dump_implicit_dir(&mut out, ""),
    }
    dirs.insert(String::new());

    for entry in &toc.entries {
        if entry.entry_type == EntryType::Chunk {
            continue;
        }
        let mut meta = entry.clone();
        meta.name = clean_name(&entry.name);
        if meta.name.is_empty() || !emitted.insert(meta.name.clone()) {
            continue;
        }
        if meta.entry_type == EntryType::Hardlink {
            meta.link_name = clean_name(&meta.link_name);
        }

        let mut prefix = String::new();
        let components: Vec<&str> = meta.name.split('/').collect();
        for component in &components[..components.len() - 1] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            if dirs.insert(prefix.clone()) {
                emitted.insert(prefix.clone());
                dump_implicit_dir(&mut out, &prefix);
            }
        }
        if meta.entry_type == EntryType::Dir {
            dirs.insert(meta.name.clone());
        }
        dump_entry(&mut out, &meta, verity_digests)?;
    }
    Ok(out)
}

/// Build the composefs image for `toc` into `composefs_dir`.
///
/// Returns the path of the written image.
#[cfg(target_os = "linux")]
pub fn generate_composefs_blob(
    toc: &Toc,
    verity_digests: &HashMap<String, String>,
    composefs_dir: &Path,
) -> Result<PathBuf> {
    use std::io::{Read, Write};
    use std::process::{Command, Stdio};

    composefs_supported()?;
    let mkcomposefs = mkcomposefs_path().unwrap_or(Path::new(MKCOMPOSEFS));
    let dump = generate_dump(toc, verity_digests)?;

    std::fs::create_dir_all(composefs_dir)?;
    let blob_path = composefs_dir.join(COMPOSEFS_BLOB_NAME);
    let tmp_path = composefs_dir.join(format!(".{}.tmp", COMPOSEFS_BLOB_NAME));
    let mut tmp = std::fs::File::create(&tmp_path)?;

    let mut child = Command::new(mkcomposefs)
        .args(["--from-file", "-", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| ChunkedError::Io(std::io::Error::other("mkcomposefs stdin missing")))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ChunkedError::Io(std::io::Error::other("mkcomposefs stdout missing")))?;

    let copied = std::thread::scope(|scope| {
        let writer = scope.spawn(move || -> std::io::Result<()> {
            stdin.write_all(dump.as_bytes())?;
            drop(stdin);
            Ok(())
        });
        let copied = std::io::copy(&mut stdout, &mut tmp);
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("dump writer panicked")));
        written.and(copied)
    });

    let mut stderr = String::new();
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }
    let status = child.wait()?;
    if !status.success() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(ChunkedError::Io(std::io::Error::other(format!(
            "{} failed ({}): {}",
            MKCOMPOSEFS,
            status,
            stderr.trim()
        ))));
    }
    let size = copied?;
    tmp.sync_all()?;
    std::fs::rename(&tmp_path, &blob_path)?;
    tracing::debug!("wrote composefs image {:?} ({} bytes)", blob_path, size);
    Ok(blob_path)
}

/// Build the composefs image for `toc` into `composefs_dir`.
#[cfg(not(target_os = "linux"))]
pub fn generate_composefs_blob(
    _toc: &Toc,
    _verity_digests: &HashMap<String, String>,
    _composefs_dir: &Path,
) -> Result<PathBuf> {
    composefs_supported().map(|_| PathBuf::new())
}

/// Parse the output of `fsverity measure`: `sha256:<hex> <path>`.
fn parse_measure_output(output: &str) -> Option<String> {
    let digest = output.split_whitespace().next()?;
    let (algo, hex) = digest.split_once(':')?;
    if algo != "sha256" || hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(hex.to_ascii_lowercase())
}

/// Enable fs-verity on every regular file under `root`.
///
/// Returns the measured digest of each file, keyed by its path relative to
/// `root`. Files that already have fs-verity enabled are only measured.
#[cfg(target_os = "linux")]
pub fn enable_verity_recursive(root: &Path) -> Result<HashMap<String, String>> {
    use std::process::Command;

    let fsverity = find_in_path(FSVERITY).ok_or_else(|| {
        ChunkedError::Unsupported(format!("fs-verity: {} not found in PATH", FSVERITY))
    })?;
    let mut digests = HashMap::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| ChunkedError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let enable = Command::new(&fsverity).arg("enable").arg(path).output()?;
        if !enable.status.success() {
            tracing::trace!(
                "fsverity enable {:?}: {}",
                path,
                String::from_utf8_lossy(&enable.stderr).trim()
            );
        }
        let measure = Command::new(&fsverity).arg("measure").arg(path).output()?;
        let digest = measure
            .status
            .success()
            .then(|| parse_measure_output(&String::from_utf8_lossy(&measure.stdout)))
            .flatten()
            .ok_or_else(|| {
                ChunkedError::Unsupported(format!(
                    "fs-verity is not available for {:?}: {}",
                    path,
                    String::from_utf8_lossy(&measure.stderr).trim()
                ))
            })?;
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        digests.insert(rel, digest);
    }
    tracing::debug!("enabled fs-verity on {} files", digests.len());
    Ok(digests)
}

/// Enable fs-verity on every regular file under `root`.
#[cfg(not(target_os = "linux"))]
pub fn enable_verity_recursive(_root: &Path) -> Result<HashMap<String, String>> {
    Err(ChunkedError::Unsupported(
        "fs-verity is only available on Linux".to_string(),
    ))
}

/// Mount a composefs EROFS image read-only through a loop device.
#[cfg(target_os = "linux")]
pub fn mount_erofs_blob(blob: &Path, mount_point: &Path) -> Result<()> {
    let output = std::process::Command::new("mount")
        .args(["-t", "erofs", "-o", "ro,loop"])
        .arg(blob)
        .arg(mount_point)
        .output()?;
    if !output.status.success() {
        return Err(ChunkedError::Io(std::io::Error::other(format!(
            "mounting {:?} on {:?}: {}",
            blob,
            mount_point,
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }
    Ok(())
}

/// Mount a composefs EROFS image read-only through a loop device.
#[cfg(not(target_os = "linux"))]
pub fn mount_erofs_blob(_blob: &Path, _mount_point: &Path) -> Result<()> {
    Err(ChunkedError::Unsupported(
        "composefs is only available on Linux".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;

    fn entry(entry_type: EntryType, name: &str) -> FileMetadata {
        FileMetadata {
            entry_type,
            name: name.to_string(),
            mode: 0o755,
            ..Default::default()
        }
    }

    #[test]
    fn test_object_path() {
        let digest = sha256_digest(b"hello");
        let path = object_path(&digest).unwrap();
        assert_eq!(path.len(), 65);
        assert_eq!(&path[2..3], "/");
        assert!(digest.ends_with(&path[3..]));
        assert!(object_path("md5:abc").is_err());
    }

    #[test]
    fn test_escape() {
        let mut out = String::new();
        escape(&mut out, b"a b\\c\n=", true);
        assert_eq!(out, "a\\x20b\\x5cc\\x0a\\x3d");
        out.clear();
        escape(&mut out, b"-", false);
        assert_eq!(out, "\\x2d");
        out.clear();
        escape(&mut out, b"", false);
        assert_eq!(out, "-");
    }

    #[test]
    fn test_dump() {
        let content_digest = sha256_digest(b"data");
        let mut file = entry(EntryType::Reg, "usr/bin/my tool");
        file.mode = 0o644;
        file.size = 4;
        file.digest = content_digest.clone();
        file.modtime = crate::toc::unix_time(1_700_000_000, 5);
        let mut link = entry(EntryType::Symlink, "usr/bin/alias");
        link.link_name = "my tool".into();
        let mut hard = entry(EntryType::Hardlink, "usr/bin/other");
        hard.link_name = "./usr/bin/my tool".into();
        let toc = Toc {
            entries: vec![entry(EntryType::Dir, "usr"), file, link, hard],
            ..Default::default()
        };
        let obj = object_path(&content_digest).unwrap();
        let verity = HashMap::from([(obj.clone(), "ab".repeat(32))]);

        let dump = generate_dump(&toc, &verity).unwrap();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "/ 0 40755 2 0 0 0 0.0 - - -");
        assert!(lines[1].starts_with("/usr 0 40755 2 "));
        assert_eq!(lines[2], "/usr/bin 0 40755 2 0 0 0 0.0 - - -");
        assert_eq!(
            lines[3],
            format!(
                "/usr/bin/my\\x20tool 4 100644 1 0 0 0 1700000000.5 {} - {}",
                obj,
                "ab".repeat(32)
            )
        );
        assert_eq!(
            lines[4],
            "/usr/bin/alias 7 120755 1 0 0 0 0.0 my\\x20tool - -"
        );
        assert_eq!(
            lines[5],
            "/usr/bin/other 0 @120000 - - - - 0.0 /usr/bin/my\\x20tool - -"
        );
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_parse_measure_output() {
        let hex = "0f".repeat(32);
        assert_eq!(
            parse_measure_output(&format!("sha256:{} /tmp/x\n", hex)),
            Some(hex)
        );
        assert_eq!(parse_measure_output("sha512:00 /tmp/x"), None);
        assert_eq!(parse_measure_output(""), None);
    }
}
