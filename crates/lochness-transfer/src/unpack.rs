//! Blob extraction on the receiving side.
//!
//! Every entry is checked before anything touches the destination: a blob
//! containing an absolute path, a `..` component, a link or a device node is
//! rejected as a whole. Files are then written to a temporary sibling and
//! renamed over the target, so unpacking the same blob twice leaves the same
//! tree behind.

use crate::archive::CompressionAlgo;
use crate::error::ArchiveError;
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Outcome of unpacking one blob.
#[derive(Debug, Clone, Default)]
pub struct UnpackReport {
    /// The blob that was unpacked.
    pub blob: PathBuf,
    /// Files written, relative to the destination root.
    pub written: Vec<PathBuf>,
    /// Entries that could not be written, with the reason.
    pub failed: Vec<(PathBuf, String)>,
    /// Payload bytes written.
    pub bytes_written: u64,
}

impl UnpackReport {
    /// True when every file entry landed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Extract `blob` into `destination_root`.
///
/// Returns [`ArchiveError::MalformedArchive`] without writing anything when
/// the stream is corrupt or any entry would land outside the root. Per-file
/// write failures do not stop the remaining entries; they are listed in
/// [`UnpackReport::failed`].
pub fn unpack(blob: &Path, destination_root: &Path) -> Result<UnpackReport, ArchiveError> {
    let planned = validate(blob)?;
    debug!(blob = %blob.display(), entries = planned, "archive validated");

    std::fs::create_dir_all(destination_root)?;
    let mut report = UnpackReport {
        blob: blob.to_path_buf(),
        ..UnpackReport::default()
    };

    let mut archive = tar::Archive::new(open_stream(blob)?);
    for entry in archive.entries().map_err(stream_error)? {
        let mut entry = entry.map_err(stream_error)?;
        let Some(kind) = accepted_kind(&entry)? else {
            continue;
        };
        let relative = checked_path(&entry)?;
        let target = destination_root.join(&relative);

        if kind == Kind::Directory {
            if let Err(e) = std::fs::create_dir_all(&target) {
                report.failed.push((relative, e.to_string()));
            }
            continue;
        }

        match write_entry(&mut entry, &target) {
            Ok(bytes) => {
                report.bytes_written += bytes;
                report.written.push(relative);
            }
            Err(e) => {
                warn!(path = %target.display(), error = %e, "failed to write entry");
                report.failed.push((relative, e.to_string()));
            }
        }
    }

    info!(
        blob = %blob.display(),
        written = report.written.len(),
        failed = report.failed.len(),
        bytes = report.bytes_written,
        "blob unpacked"
    );
    Ok(report)
}

/// Paths of the file entries in `blob`, in archive order.
pub fn list_entries(blob: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut archive = tar::Archive::new(open_stream(blob)?);
    let mut paths = Vec::new();
    for entry in archive.entries().map_err(stream_error)? {
        let entry = entry.map_err(stream_error)?;
        if accepted_kind(&entry)? == Some(Kind::File) {
            paths.push(checked_path(&entry)?);
        }
    }
    Ok(paths)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    File,
    Directory,
}

/// First pass: read the whole stream and check every entry.
fn validate(blob: &Path) -> Result<usize, ArchiveError> {
    let mut archive = tar::Archive::new(open_stream(blob)?);
    let mut count = 0;
    for entry in archive.entries().map_err(stream_error)? {
        let entry = entry.map_err(stream_error)?;
        if accepted_kind(&entry)?.is_some() {
            checked_path(&entry)?;
            count += 1;
        }
    }
    Ok(count)
}

fn open_stream(blob: &Path) -> Result<Box<dyn Read>, ArchiveError> {
    let mut file = File::open(blob)?;
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    Ok(match CompressionAlgo::detect(&magic[..filled]) {
        CompressionAlgo::None => Box::new(reader),
        CompressionAlgo::Zstd => Box::new(zstd::Decoder::with_buffer(reader)?),
        CompressionAlgo::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
    })
}

fn stream_error(e: io::Error) -> ArchiveError {
    ArchiveError::malformed("<stream>", e.to_string())
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> String {
    String::from_utf8_lossy(&entry.path_bytes()).into_owned()
}

/// `Some` for entries to extract, `None` for metadata entries to skip.
fn accepted_kind<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Option<Kind>, ArchiveError> {
    let kind = entry.header().entry_type();
    if kind.is_file() {
        Ok(Some(Kind::File))
    } else if kind.is_dir() {
        Ok(Some(Kind::Directory))
    } else if kind.is_pax_global_extensions() {
        Ok(None)
    } else {
        Err(ArchiveError::malformed(
            entry_name(entry),
            format!("unsupported entry type {kind:?}"),
        ))
    }
}

/// The entry path as a plain relative path that stays under the root.
fn checked_path<R: Read>(entry: &tar::Entry<'_, R>) -> Result<PathBuf, ArchiveError> {
    let name = entry_name(entry);
    let path: Cow<'_, Path> = entry
        .path()
        .map_err(|e| ArchiveError::malformed(name.clone(), e.to_string()))?;

    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ArchiveError::malformed(name, "path escapes the destination root"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::malformed(name, "absolute path"))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ArchiveError::malformed(name, "empty path"));
    }
    Ok(relative)
}

fn write_entry<R: Read>(entry: &mut tar::Entry<'_, R>, target: &Path) -> io::Result<u64> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::other("entry has no parent directory"))?;
    let file_name = target
        .file_name()
        .ok_or_else(|| io::Error::other("entry has no file name"))?;
    std::fs::create_dir_all(parent)?;

    let partial = parent.join(format!(".{}.lochness-partial", file_name.to_string_lossy()));
    match copy_entry(entry, &partial).and_then(|bytes| {
        std::fs::rename(&partial, target)?;
        Ok(bytes)
    }) {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn copy_entry<R: Read>(entry: &mut tar::Entry<'_, R>, partial: &Path) -> io::Result<u64> {
    let mut file = File::create(partial)?;
    let bytes = io::copy(entry, &mut file)?;
    let header = entry.header();
    if let Ok(mtime) = header.mtime() {
        file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))?;
    }
    if let Ok(mode) = header.mode() {
        set_mode(&file, mode)?;
    }
    file.sync_all()?;
    Ok(bytes)
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}
