//! Root-relative filesystem primitives.
//!
//! Every mutation performed while applying a layer goes through this module.
//! Paths are never joined onto the host filesystem: each operation opens the
//! parent directory relative to a root [`Dir`] and then acts on a single
//! final component with a `*at` syscall.
//!
//! Parent directories are opened with `openat2(RESOLVE_IN_ROOT)`, so `..` and
//! absolute symlinks met along the way are resolved as if the root were `/`.
//! On kernels without `openat2` the lookup falls back to cap-std, which
//! refuses paths that would leave the root instead of clamping them. Final
//! components are created with `O_NOFOLLOW`/`O_EXCL` after unlinking whatever
//! was there, so an earlier symlink can never redirect a write.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};

use cap_std::fs::Dir;
use rustix::fs::{AtFlags, FileType, Mode, OFlags, Timespec, Timestamps, XattrFlags};
use rustix::fs::{Gid, Uid};

use crate::error::{ChunkedError, Result};
use crate::readatreader::{ReadAtReader, WriteAtWriter};
use crate::toc::{EntryType, FileMetadata, clean_name};

/// Xattr recording the original owner and mode when a force mask is applied.
pub const OVERRIDE_STAT_XATTR: &str = "user.containers.override_stat";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Check if an error indicates reflink is not supported on this filesystem.
fn is_reflink_unavailable(errno: i32) -> bool {
    errno == rustix::io::Errno::OPNOTSUPP.raw_os_error()
        || errno == rustix::io::Errno::XDEV.raw_os_error()
        || errno == rustix::io::Errno::INVAL.raw_os_error()
        || errno == rustix::io::Errno::NOTTY.raw_os_error()
}

/// Check if an error indicates hardlink is not supported/allowed.
fn is_hardlink_unavailable(errno: i32) -> bool {
    errno == rustix::io::Errno::XDEV.raw_os_error()
        || errno == rustix::io::Errno::PERM.raw_os_error()
        || errno == rustix::io::Errno::OPNOTSUPP.raw_os_error()
        || errno == rustix::io::Errno::MLINK.raw_os_error()
}

fn is_copy_range_unavailable(errno: i32) -> bool {
    errno == rustix::io::Errno::XDEV.raw_os_error()
        || errno == rustix::io::Errno::NOSYS.raw_os_error()
        || errno == rustix::io::Errno::INVAL.raw_os_error()
        || errno == rustix::io::Errno::OPNOTSUPP.raw_os_error()
}

/// Split a cleaned name into parent and final component.
fn split_name(name: &str) -> Result<(String, String)> {
    let cleaned = clean_name(name);
    if cleaned.is_empty() {
        return Err(ChunkedError::unsafe_path(name, "refers to the root itself"));
    }
    Ok(match cleaned.rsplit_once('/') {
        Some((parent, base)) => (parent.to_string(), base.to_string()),
        None => (String::new(), cleaned),
    })
}

fn temp_name(base: &str) -> String {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let prefix: String = base.chars().take(32).collect();
    format!(".{}.cstor-tmp-{}-{}", prefix, std::process::id(), n)
}

#[cfg(target_os = "linux")]
fn open_in_root(root: &Dir, path: &str, flags: OFlags, mode: u32) -> Result<Option<File>> {
    use rustix::fs::ResolveFlags;

    let path = if path.is_empty() { "." } else { path };
    for _ in 0..16 {
        match rustix::fs::openat2(
            root,
            path,
            flags | OFlags::CLOEXEC,
            Mode::from_raw_mode(mode),
            ResolveFlags::IN_ROOT | ResolveFlags::NO_MAGICLINKS,
        ) {
            Ok(fd) => return Ok(Some(File::from(fd))),
            // Raced with a rename somewhere in the tree.
            Err(rustix::io::Errno::AGAIN) => continue,
            Err(rustix::io::Errno::NOSYS) | Err(rustix::io::Errno::PERM) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Err(ChunkedError::Io(io::Error::other(format!(
        "openat2 kept failing with EAGAIN for {:?}",
        path
    ))))
}

#[cfg(not(target_os = "linux"))]
fn open_in_root(_root: &Dir, _path: &str, _flags: OFlags, _mode: u32) -> Result<Option<File>> {
    Ok(None)
}

fn open_with_cap_std(root: &Dir, path: &str, flags: OFlags, mode: u32) -> Result<File> {
    use cap_std::fs::OpenOptionsExt;

    let path = if path.is_empty() { "." } else { path };
    if flags.contains(OFlags::DIRECTORY) {
        return Ok(root.open_dir(path)?.into_std_file());
    }
    let write = flags.contains(OFlags::WRONLY) || flags.contains(OFlags::RDWR);
    let mut opts = cap_std::fs::OpenOptions::new();
    opts.read(!flags.contains(OFlags::WRONLY))
        .write(write)
        .truncate(flags.contains(OFlags::TRUNC));
    if flags.contains(OFlags::CREATE) {
        if flags.contains(OFlags::EXCL) {
            opts.create_new(true);
        } else {
            opts.create(true);
        }
    }
    opts.mode(mode);
    Ok(root.open_with(path, &opts)?.into_std())
}

/// Open `name` relative to `root` without ever leaving it.
///
/// Symlinks and `..` are resolved inside the root.
pub fn open_file_under_root(root: &Dir, name: &str, flags: OFlags, mode: u32) -> Result<File> {
    let cleaned = clean_name(name);
    if let Some(file) = open_in_root(root, &cleaned, flags, mode)? {
        return Ok(file);
    }
    open_with_cap_std(root, &cleaned, flags, mode)
}

/// Open a directory relative to `root`; the empty name opens the root.
pub fn open_dir_under_root(root: &Dir, name: &str) -> Result<File> {
    open_file_under_root(root, name, OFlags::RDONLY | OFlags::DIRECTORY, 0)
}

fn stat_nofollow(dir: &impl AsFd, base: &str) -> Result<Option<rustix::fs::Stat>> {
    match rustix::fs::statat(dir, base, AtFlags::SYMLINK_NOFOLLOW) {
        Ok(st) => Ok(Some(st)),
        Err(rustix::io::Errno::NOENT) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_dir_stat(st: &rustix::fs::Stat) -> bool {
    FileType::from_raw_mode(st.st_mode as _) == FileType::Directory
}

/// Remove a non-directory at `base` if present.
fn remove_existing(parent: &impl AsFd, base: &str) -> Result<()> {
    match stat_nofollow(parent, base)? {
        None => Ok(()),
        Some(st) if is_dir_stat(&st) => Err(ChunkedError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{:?} exists and is a directory", base),
        ))),
        Some(_) => Ok(rustix::fs::unlinkat(parent, base, AtFlags::empty())?),
    }
}

/// Create one directory. An existing directory is kept; any other existing
/// entry is replaced.
pub fn safe_mkdir(root: &Dir, name: &str, mode: u32) -> Result<()> {
    let (parent, base) = split_name(name)?;
    let parent = open_dir_under_root(root, &parent)?;
    match rustix::fs::mkdirat(&parent, base.as_str(), Mode::from_raw_mode(mode)) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::EXIST) => {
            if stat_nofollow(&parent, &base)?.is_some_and(|st| is_dir_stat(&st)) {
                return Ok(());
            }
            rustix::fs::unlinkat(&parent, base.as_str(), AtFlags::empty())?;
            Ok(rustix::fs::mkdirat(&parent, base.as_str(), Mode::from_raw_mode(mode))?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Supplies attributes for directories implied by an entry's path but absent
/// from the manifest.
pub trait DirectoryBackfiller {
    /// Attributes for `name`, or `None` to use defaults.
    fn backfill(&self, name: &str) -> Result<Option<FileMetadata>>;
}

/// Backfiller that copies attributes from the lower layers, topmost first.
#[derive(Debug, Default)]
pub struct LowerLayersBackfiller {
    lowers: Vec<Dir>,
}

impl LowerLayersBackfiller {
    /// Use these layer roots, topmost first.
    pub fn new(lowers: Vec<Dir>) -> Self {
        Self { lowers }
    }
}

impl DirectoryBackfiller for LowerLayersBackfiller {
    fn backfill(&self, name: &str) -> Result<Option<FileMetadata>> {
        for lower in &self.lowers {
            let dir = match open_file_under_root(
                lower,
                name,
                OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW,
                0,
            ) {
                Ok(d) => d,
                Err(e) => {
                    tracing::trace!("backfill: {:?} not usable in lower layer: {}", name, e);
                    continue;
                }
            };
            let st = rustix::fs::fstat(&dir)?;
            return Ok(Some(FileMetadata {
                entry_type: EntryType::Dir,
                name: clean_name(name),
                mode: st.st_mode as u32 & 0o7777,
                uid: st.st_uid,
                gid: st.st_gid,
                modtime: crate::toc::unix_time(st.st_mtime as i64, st.st_mtime_nsec as u32),
                ..Default::default()
            }));
        }
        Ok(None)
    }
}

/// Create every missing directory leading to `name` (exclusive).
///
/// Missing directories take their attributes from `backfiller` when it knows
/// them, otherwise they are created `0755` and owned by the caller.
pub fn mkdir_parents(
    root: &Dir,
    name: &str,
    backfiller: Option<&dyn DirectoryBackfiller>,
    attrs: &AttrOptions,
) -> Result<()> {
    let cleaned = clean_name(name);
    let Some((parent, _)) = cleaned.rsplit_once('/') else {
        return Ok(());
    };
    let mut prefix = String::new();
    for component in parent.split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(component);

        let (dir_parent, base) = split_name(&prefix)?;
        let dir_parent = open_dir_under_root(root, &dir_parent)?;
        if stat_nofollow(&dir_parent, &base)?.is_some() {
            continue;
        }
        let meta = match backfiller {
            Some(b) => b.backfill(&prefix)?,
            None => None,
        };
        let mode = meta.as_ref().map_or(0o755, |m| m.mode);
        tracing::trace!("creating implicit directory {:?} mode {:o}", prefix, mode);
        safe_mkdir(root, &prefix, mode)?;
        if let Some(meta) = meta {
            let dir = open_dir_under_root(root, &prefix)?;
            apply_file_attributes(&dir, &meta, attrs)?;
        }
    }
    Ok(())
}

/// Create a regular file, replacing any non-directory already at `name`.
///
/// The final component is never followed.
pub fn create_file_under_root(root: &Dir, name: &str, mode: u32) -> Result<File> {
    let (parent, base) = split_name(name)?;
    let parent = open_dir_under_root(root, &parent)?;
    remove_existing(&parent, &base)?;
    let fd = rustix::fs::openat(
        &parent,
        base.as_str(),
        OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::from_raw_mode(mode),
    )?;
    Ok(File::from(fd))
}

fn link_fd_at(src: &impl AsFd, parent: &impl AsFd, base: &str) -> rustix::io::Result<()> {
    match rustix::fs::linkat(src, "", parent, base, AtFlags::EMPTY_PATH) {
        Ok(()) => Ok(()),
        // AT_EMPTY_PATH needs CAP_DAC_READ_SEARCH; go through /proc instead.
        Err(rustix::io::Errno::NOENT) | Err(rustix::io::Errno::PERM) => {
            let proc_fd_path = format!("/proc/self/fd/{}", src.as_fd().as_raw_fd());
            rustix::fs::linkat(
                rustix::fs::CWD,
                proc_fd_path.as_str(),
                parent,
                base,
                AtFlags::SYMLINK_FOLLOW,
            )
        }
        Err(e) => Err(e),
    }
}

/// Create `base` in `parent` with `create`, atomically replacing whatever
/// was there.
fn replace_atomically<F>(parent: &File, base: &str, create: F) -> Result<()>
where
    F: FnOnce(&str) -> rustix::io::Result<()>,
{
    let tmp = temp_name(base);
    create(&tmp)?;
    if let Err(e) = rustix::fs::renameat(parent, tmp.as_str(), parent, base) {
        let _ = rustix::fs::unlinkat(parent, tmp.as_str(), AtFlags::empty());
        return Err(e.into());
    }
    Ok(())
}

/// Hard link `link_name` to the existing entry `target`, both relative to
/// `root`.
///
/// The target is opened inside the root first, so a link can only ever point
/// at an inode that is reachable from the root. An existing entry at
/// `link_name` is replaced atomically.
pub fn safe_link(root: &Dir, target: &str, link_name: &str) -> Result<()> {
    let target_clean = clean_name(target);
    if target_clean.is_empty() {
        return Err(ChunkedError::unsafe_path(target, "hard link to the root"));
    }
    let src = open_link_source(root, &target_clean)?;
    if rustix::fs::fstat(&src).is_ok_and(|st| is_dir_stat(&st)) {
        return Err(ChunkedError::unsafe_path(target, "hard link to a directory"));
    }
    let (parent, base) = split_name(link_name)?;
    let parent = open_dir_under_root(root, &parent)?;
    replace_atomically(&parent, &base, |tmp| link_fd_at(&src, &parent, tmp))
}

/// Open the inode a hard link should point to, not following a final symlink.
fn open_link_source(root: &Dir, target: &str) -> Result<OwnedFd> {
    if let Some(file) = open_in_root(root, target, OFlags::PATH | OFlags::NOFOLLOW, 0)? {
        return Ok(file.into());
    }
    let (parent, base) = split_name(target)?;
    let parent = open_dir_under_root(root, &parent)?;
    Ok(rustix::fs::openat(
        &parent,
        base.as_str(),
        OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )?)
}

/// Create a symlink at `link_name` whose content is `target`.
///
/// The target is stored verbatim and never resolved, so it may point
/// anywhere; later lookups through it stay inside the root.
pub fn safe_symlink(root: &Dir, target: &str, link_name: &str) -> Result<()> {
    let (parent, base) = split_name(link_name)?;
    let parent = open_dir_under_root(root, &parent)?;
    match rustix::fs::symlinkat(target, &parent, base.as_str()) {
        Ok(()) => Ok(()),
        Err(rustix::io::Errno::EXIST) => {
            if stat_nofollow(&parent, &base)?.is_some_and(|st| is_dir_stat(&st)) {
                return Err(ChunkedError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{:?} exists and is a directory", link_name),
                )));
            }
            replace_atomically(&parent, &base, |tmp| {
                rustix::fs::symlinkat(target, &parent, tmp)
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Create a device node or fifo.
pub fn safe_mknod(root: &Dir, meta: &FileMetadata) -> Result<()> {
    let file_type = match meta.entry_type {
        EntryType::Char => FileType::CharacterDevice,
        EntryType::Block => FileType::BlockDevice,
        EntryType::Fifo => FileType::Fifo,
        other => {
            return Err(ChunkedError::format(format!(
                "{:?} is not a device entry ({:?})",
                meta.name, other
            )));
        }
    };
    let (parent, base) = split_name(&meta.name)?;
    let parent = open_dir_under_root(root, &parent)?;
    remove_existing(&parent, &base)?;
    rustix::fs::mknodat(
        &parent,
        base.as_str(),
        file_type,
        Mode::from_raw_mode(meta.mode & 0o7777),
        rustix::fs::makedev(meta.dev_major, meta.dev_minor),
    )?;
    Ok(())
}

/// How ownership and mode are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrOptions {
    /// Ignore `EPERM`/`EINVAL` from chown, as needed when running rootless.
    pub ignore_chown_errors: bool,
    /// Restrict permission bits and record the original ones in
    /// [`OVERRIDE_STAT_XATTR`].
    pub force_mask: Option<u32>,
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

fn chown_result(res: rustix::io::Result<()>, name: &str, attrs: &AttrOptions) -> Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(e @ (rustix::io::Errno::PERM | rustix::io::Errno::INVAL))
            if attrs.ignore_chown_errors =>
        {
            tracing::trace!("ignoring chown failure on {:?}: {}", name, e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn timestamps(meta: &FileMetadata) -> Option<Timestamps> {
    let mtime = meta.modtime?;
    let atime = meta.accesstime.unwrap_or(mtime);
    let spec = |t: chrono::DateTime<chrono::Utc>| Timespec {
        tv_sec: t.timestamp(),
        tv_nsec: t.timestamp_subsec_nanos() as _,
    };
    Some(Timestamps {
        last_access: spec(atime),
        last_modification: spec(mtime),
    })
}

/// Apply owner, mode, timestamps and xattrs to an open file or directory,
/// in that order.
pub fn apply_file_attributes(file: &File, meta: &FileMetadata, attrs: &AttrOptions) -> Result<()> {
    chown_result(
        rustix::fs::fchown(file, Some(Uid::from_raw(meta.uid)), Some(Gid::from_raw(meta.gid))),
        &meta.name,
        attrs,
    )?;

    let mode = match attrs.force_mask {
        Some(mask) => meta.mode & mask,
        None => meta.mode,
    };
    rustix::fs::fchmod(file, Mode::from_raw_mode(mode & 0o7777))?;

    if let Some(ts) = timestamps(meta) {
        rustix::fs::futimens(file, &ts)?;
    }

    for (key, value) in meta.decoded_xattrs()? {
        rustix::fs::fsetxattr(file, key.as_str(), &value, XattrFlags::empty())?;
    }
    if attrs.force_mask.is_some() {
        let value = format!(
            "{}:{}:0{:o}",
            meta.uid,
            meta.gid,
            type_bits(meta.entry_type) | (meta.mode & 0o7777)
        );
        rustix::fs::fsetxattr(file, OVERRIDE_STAT_XATTR, value.as_bytes(), XattrFlags::empty())?;
    }
    Ok(())
}

/// Apply owner and timestamps to a symlink or device node without following
/// it. Mode and xattrs are left alone.
pub fn apply_path_attributes(root: &Dir, meta: &FileMetadata, attrs: &AttrOptions) -> Result<()> {
    let (parent, base) = split_name(&meta.name)?;
    let parent = open_dir_under_root(root, &parent)?;
    chown_result(
        rustix::fs::chownat(
            &parent,
            base.as_str(),
            Some(Uid::from_raw(meta.uid)),
            Some(Gid::from_raw(meta.gid)),
            AtFlags::SYMLINK_NOFOLLOW,
        ),
        &meta.name,
        attrs,
    )?;
    if meta.entry_type != EntryType::Symlink {
        rustix::fs::chmodat(
            &parent,
            base.as_str(),
            Mode::from_raw_mode(meta.mode & 0o7777),
            AtFlags::empty(),
        )?;
    }
    if let Some(ts) = timestamps(meta) {
        rustix::fs::utimensat(&parent, base.as_str(), &ts, AtFlags::SYMLINK_NOFOLLOW)?;
    }
    Ok(())
}

/// Extend `file` by `size` bytes from its current position without writing
/// data, leaving a hole.
pub fn append_hole(file: &mut File, size: u64) -> Result<()> {
    let delta = i64::try_from(size)
        .map_err(|_| ChunkedError::format(format!("hole of {} bytes is too large", size)))?;
    let end = file.seek(SeekFrom::Current(delta))?;
    if file.metadata()?.len() < end {
        rustix::fs::ftruncate(&*file, end)?;
    }
    Ok(())
}

/// Copy `len` bytes between positions of two files.
///
/// Uses `copy_file_range`, which lets the filesystem share extents, and falls
/// back to a plain read/write loop across filesystems.
pub fn copy_range(src: &File, src_offset: u64, dst: &File, dst_offset: u64, len: u64) -> Result<u64> {
    let (mut off_in, mut off_out) = (src_offset, dst_offset);
    let mut left = len;
    while left > 0 {
        let want = usize::try_from(left).unwrap_or(usize::MAX).min(1 << 30);
        match rustix::fs::copy_file_range(src, Some(&mut off_in), dst, Some(&mut off_out), want) {
            Ok(0) => {
                return Err(ChunkedError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended with {} bytes left to copy", left),
                )));
            }
            Ok(n) => left -= n as u64,
            Err(e) if left == len && is_copy_range_unavailable(e.raw_os_error()) => {
                tracing::trace!("copy_file_range unavailable ({}), copying by hand", e);
                let mut reader = ReadAtReader::with_range(src, src_offset, len);
                let copied = io::copy(&mut reader, &mut WriteAtWriter::new(dst, dst_offset))?;
                if copied != len {
                    return Err(ChunkedError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("copied {} of {} bytes", copied, len),
                    )));
                }
                return Ok(len);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(len)
}

/// Materialize `name` with the full content of `src`.
///
/// With `allow_hardlink` the new entry is a hard link to `src` when the
/// filesystem permits; otherwise the content is reflinked or copied into a
/// new file created with `mode`. Returns the new file and the number of bytes
/// copied (zero for links and reflinks).
pub fn copy_file_content(
    src: &File,
    size: u64,
    dest_root: &Dir,
    name: &str,
    mode: u32,
    allow_hardlink: bool,
) -> Result<(File, u64)> {
    if allow_hardlink {
        let (parent, base) = split_name(name)?;
        let parent_dir = open_dir_under_root(dest_root, &parent)?;
        match replace_atomically(&parent_dir, &base, |tmp| link_fd_at(src, &parent_dir, tmp)) {
            Ok(()) => {
                let fd = rustix::fs::openat(
                    &parent_dir,
                    base.as_str(),
                    OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                    Mode::empty(),
                )?;
                return Ok((File::from(fd), 0));
            }
            Err(e) if e.raw_os_error().is_some_and(is_hardlink_unavailable) => {
                tracing::debug!("hardlink not available ({}), copying {:?}", e, name);
            }
            Err(e) => return Err(e),
        }
    }

    let dst = create_file_under_root(dest_root, name, mode)?;
    match rustix::fs::ioctl_ficlone(&dst, src) {
        Ok(()) => return Ok((dst, 0)),
        Err(e) if is_reflink_unavailable(e.raw_os_error()) => {}
        Err(e) => {
            return Err(ChunkedError::Io(io::Error::other(format!(
                "reflink failed for {:?}: {}",
                name, e
            ))));
        }
    }
    let copied = copy_range(src, 0, &dst, 0, size)?;
    Ok((dst, copied))
}
