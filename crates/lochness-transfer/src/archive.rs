//! Change-set archival: packs selected files into a single tar blob,
//! optionally compressed, ready for transport.
//!
//! Entries are written in path order with fixed ownership, so the same tree
//! and change-set always produce the same bytes. Compression is lossless
//! (zstd or LZ4 frame) and is detected by the receiver from the magic bytes.

use crate::error::ArchiveError;
use crate::scan::{ChangeSet, ChangeSetScanner};
use crate::window::{SyncWindow, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, Metadata};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

/// Compression applied to the tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgo {
    /// Plain tar.
    None,
    /// LZ4 frame format (fast, modest ratio).
    Lz4,
    /// Zstd (better ratio for WAN links).
    #[default]
    Zstd,
}

impl CompressionAlgo {
    /// Returns true if this algo actually compresses data.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// File extension used for blobs of this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "tar",
            Self::Lz4 => "tar.lz4",
            Self::Zstd => "tar.zst",
        }
    }

    /// Identify the codec from the first bytes of a blob.
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(&ZSTD_MAGIC) {
            Self::Zstd
        } else if prefix.starts_with(&LZ4_FRAME_MAGIC) {
            Self::Lz4
        } else {
            Self::None
        }
    }

    /// Whether `file_name` looks like a blob produced by the archiver.
    pub fn is_blob_name(file_name: &str) -> bool {
        [Self::None, Self::Lz4, Self::Zstd]
            .iter()
            .any(|algo| file_name.ends_with(&format!(".{}", algo.extension())))
    }
}

/// Archiver settings.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Codec for the tar stream.
    pub compression: CompressionAlgo,
    /// Zstd level (1-22). Ignored for other codecs.
    pub zstd_level: i32,
    /// Also write a listing of files that were not archived.
    pub miss_list: bool,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            compression: CompressionAlgo::Zstd,
            zstd_level: 3,
            miss_list: false,
        }
    }
}

/// A change-set file that was selected but could not be archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// Path relative to the scan root.
    pub relative_path: PathBuf,
    /// Why it was left out.
    pub reason: String,
}

/// A packed change-set on local disk.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveBlob {
    /// Locally unique file name.
    pub name: String,
    /// Location of the blob.
    pub path: PathBuf,
    /// Codec of the tar stream.
    pub compression: CompressionAlgo,
    /// Window the change-set was selected for.
    pub window: SyncWindow,
    /// Number of files archived.
    pub entry_count: usize,
    /// Size of the blob in bytes.
    pub bytes: u64,
    /// Hex SHA-256 of the blob.
    pub sha256: String,
    /// Selected files that could not be archived.
    pub skipped: Vec<SkippedEntry>,
    /// Miss list written next to the blob, if requested.
    pub miss_list: Option<PathBuf>,
}

impl ArchiveBlob {
    /// Delete the local blob. Missing files are not an error.
    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Locally unique blob name for a destination and window end.
pub fn blob_name(destination: &str, end: Timestamp, compression: CompressionAlgo) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{destination}-{}-{}.{}",
        end.as_micros(),
        &nonce[..8],
        compression.extension()
    )
}

/// Where the miss list of `blob_path` lives.
pub fn miss_list_path(blob_path: &Path) -> PathBuf {
    let mut name = blob_path.as_os_str().to_os_string();
    name.push(".missed.txt");
    PathBuf::from(name)
}

/// Packs change-sets into blobs.
#[derive(Debug, Clone, Default)]
pub struct Archiver {
    config: ArchiverConfig,
}

impl Archiver {
    /// Create a new archiver with the given config.
    pub fn new(config: ArchiverConfig) -> Self {
        Self { config }
    }

    /// Get the current config.
    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    /// Pack every entry of `change_set` (paths relative to `root`) into a blob
    /// at `output`.
    ///
    /// The blob is written under a temporary name and renamed into place once
    /// complete. An empty change-set yields a valid, header-only archive.
    /// Files that vanished or became unreadable since the scan are recorded in
    /// [`ArchiveBlob::skipped`]; a file that shrinks mid-copy aborts the pack
    /// with [`ArchiveError::SourceChanged`].
    pub fn pack(
        &self,
        root: &Path,
        change_set: &ChangeSet,
        output: &Path,
    ) -> Result<ArchiveBlob, ArchiveError> {
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::other(format!("invalid blob path {}", output.display())))?;
        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
        let partial = dir.join(format!(".{name}.partial"));

        let written = match self.write_archive(root, change_set, &partial) {
            Ok(written) => written,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };
        std::fs::rename(&partial, output)?;

        let mut blob = ArchiveBlob {
            name,
            path: output.to_path_buf(),
            compression: self.config.compression,
            window: change_set.window(),
            entry_count: written.entry_count,
            bytes: written.bytes,
            sha256: written.sha256,
            skipped: written.skipped,
            miss_list: None,
        };
        if self.config.miss_list {
            blob.miss_list = Some(self.write_miss_list(root, change_set, &blob)?);
        }

        info!(
            blob = %blob.name,
            window = %blob.window,
            entries = blob.entry_count,
            skipped = blob.skipped.len(),
            bytes = blob.bytes,
            sha256 = %blob.sha256,
            "change-set archived"
        );
        Ok(blob)
    }

    fn write_archive(
        &self,
        root: &Path,
        change_set: &ChangeSet,
        partial: &Path,
    ) -> Result<Written, ArchiveError> {
        let file = File::create(partial)?;
        let sink = HashingWriter::new(BufWriter::new(file));
        let encoder = Encoder::new(self.config.compression, self.config.zstd_level, sink)?;
        let mut builder = tar::Builder::new(encoder);

        let mut entry_count = 0;
        let mut skipped = Vec::new();
        for entry in change_set.entries() {
            let source = root.join(&entry.relative_path);
            let (file, meta) = match open_regular(&source) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(path = %source.display(), error = %e, "selected file not archived");
                    skipped.push(SkippedEntry {
                        relative_path: entry.relative_path.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let len = meta.len();
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(len);
            header.set_mode(file_mode(&meta));
            header.set_mtime(entry.mtime.as_secs());
            header.set_uid(0);
            header.set_gid(0);

            let mut reader = ExactReader::new(file, len);
            if let Err(e) = builder.append_data(&mut header, &entry.relative_path, &mut reader) {
                if e.kind() == ErrorKind::UnexpectedEof && reader.remaining > 0 {
                    return Err(ArchiveError::SourceChanged {
                        path: entry.relative_path.clone(),
                    });
                }
                return Err(e.into());
            }
            debug!(path = %entry.relative_path.display(), bytes = len, "archived");
            entry_count += 1;
        }

        let encoder = builder.into_inner()?;
        let sink = encoder.finish()?;
        let (writer, sha256, bytes) = sink.into_parts();
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(Written {
            entry_count,
            bytes,
            sha256,
            skipped,
        })
    }

    /// Write the plain-text listing of files under `root` that exist now but
    /// were not archived and are not covered by the watermark.
    fn write_miss_list(
        &self,
        root: &Path,
        change_set: &ChangeSet,
        blob: &ArchiveBlob,
    ) -> Result<PathBuf, ArchiveError> {
        let window = change_set.window();
        let mut scanner = ChangeSetScanner::new(root);
        for subtree in change_set.scope() {
            scanner = scanner.with_subtree(subtree.clone());
        }

        let mut missed: Vec<(PathBuf, String)> = Vec::new();
        let walked = scanner.walk(|file| {
            if change_set.contains(&file.relative_path) {
                return;
            }
            let reason = match file.mtime {
                None => "mtime unreadable".to_string(),
                Some(mtime) if mtime < window.start => return,
                Some(mtime) => format!("modified {mtime}, not before window end {}", window.end),
            };
            missed.push((file.relative_path, reason));
        });
        if let Err(e) = walked {
            warn!(error = %e, "miss list walk failed; listing skipped entries only");
        }
        for skipped in &blob.skipped {
            missed.push((
                skipped.relative_path.clone(),
                format!("skipped while packing: {}", skipped.reason),
            ));
        }
        missed.sort();

        let path = miss_list_path(&blob.path);
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "# files not archived in {}", blob.name)?;
        writeln!(out, "# window {window}")?;
        for (rel, reason) in &missed {
            writeln!(out, "{}\t{reason}", rel.display())?;
        }
        out.flush()?;
        debug!(path = %path.display(), missed = missed.len(), "miss list written");
        Ok(path)
    }
}

struct Written {
    entry_count: usize,
    bytes: u64,
    sha256: String,
    skipped: Vec<SkippedEntry>,
}

fn open_regular(path: &Path) -> io::Result<(File, Metadata)> {
    let file = File::open(path)?;
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(io::Error::other("no longer a regular file"));
    }
    Ok((file, meta))
}

#[cfg(unix)]
fn file_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &Metadata) -> u32 {
    0o644
}

/// Yields exactly `remaining` bytes, failing if the source ends early.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "file shrank while being archived",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Counts and hashes everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn into_parts(self) -> (W, String, u64) {
        let digest = self.hasher.finalize();
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect();
        (self.inner, hex, self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Encoder<W: Write> {
    Plain(W),
    Zstd(zstd::Encoder<'static, W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
}

impl<W: Write> Encoder<W> {
    fn new(algo: CompressionAlgo, zstd_level: i32, inner: W) -> io::Result<Self> {
        Ok(match algo {
            CompressionAlgo::None => Self::Plain(inner),
            CompressionAlgo::Zstd => Self::Zstd(zstd::Encoder::new(inner, zstd_level.clamp(1, 22))?),
            CompressionAlgo::Lz4 => Self::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Zstd(e) => e.finish(),
            Self::Lz4(e) => e.finish().map_err(io::Error::other),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Zstd(e) => e.write(buf),
            Self::Lz4(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Zstd(e) => e.flush(),
            Self::Lz4(e) => e.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::test_support::write_file_at;
    use crate::unpack::list_entries;
    use tempfile::TempDir;

    fn secs(s: u64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_file_at(dir.path(), "GENERAL/StudyA/1001/a.csv", b"alpha", secs(10));
        write_file_at(dir.path(), "GENERAL/StudyA/1001/b.csv", b"bravo", secs(20));
        write_file_at(dir.path(), "PROTECTED/StudyA/1001/c.bin", &[0u8, 1, 2, 255], secs(30));
        dir
    }

    fn pack_with(algo: CompressionAlgo, root: &Path, set: &ChangeSet, out: &Path) -> ArchiveBlob {
        let archiver = Archiver::new(ArchiverConfig {
            compression: algo,
            ..ArchiverConfig::default()
        });
        archiver.pack(root, set, out).unwrap()
    }

    mod codec {
        use super::*;

        #[test]
        fn test_extension_and_blob_names() {
            assert_eq!(CompressionAlgo::Zstd.extension(), "tar.zst");
            assert!(CompressionAlgo::is_blob_name("dpacc-35000000-abcd1234.tar.lz4"));
            assert!(!CompressionAlgo::is_blob_name(".dpacc.tar.zst.partial"));
            assert!(!CompressionAlgo::is_blob_name("notes.txt"));
        }

        #[test]
        fn test_detect_magic() {
            assert_eq!(CompressionAlgo::detect(&ZSTD_MAGIC), CompressionAlgo::Zstd);
            assert_eq!(CompressionAlgo::detect(&LZ4_FRAME_MAGIC), CompressionAlgo::Lz4);
            assert_eq!(CompressionAlgo::detect(b"GENE"), CompressionAlgo::None);
            assert_eq!(CompressionAlgo::detect(&[]), CompressionAlgo::None);
        }

        #[test]
        fn test_blob_names_are_unique() {
            let a = blob_name("dpacc", secs(35), CompressionAlgo::Zstd);
            let b = blob_name("dpacc", secs(35), CompressionAlgo::Zstd);
            assert_ne!(a, b);
            assert!(a.starts_with("dpacc-35000000-"));
        }
    }

    mod packing {
        use super::*;

        #[test]
        fn test_pack_all_codecs_lists_entries() {
            let root = tree();
            let out = TempDir::new().unwrap();
            let set = crate::scan::scan(root.path(), SyncWindow::new(secs(15), secs(35))).unwrap();
            for algo in [CompressionAlgo::None, CompressionAlgo::Lz4, CompressionAlgo::Zstd] {
                let path = out.path().join(format!("blob.{}", algo.extension()));
                let blob = pack_with(algo, root.path(), &set, &path);
                assert_eq!(blob.entry_count, 2);
                assert_eq!(blob.bytes, std::fs::metadata(&path).unwrap().len());
                assert_eq!(
                    list_entries(&path).unwrap(),
                    vec![
                        PathBuf::from("GENERAL/StudyA/1001/b.csv"),
                        PathBuf::from("PROTECTED/StudyA/1001/c.bin"),
                    ]
                );
            }
        }

        #[test]
        fn test_empty_change_set_is_valid_archive() {
            let root = tree();
            let out = TempDir::new().unwrap();
            let path = out.path().join("empty.tar.zst");
            let set = ChangeSet::empty(SyncWindow::new(secs(35), secs(35)));
            let blob = pack_with(CompressionAlgo::Zstd, root.path(), &set, &path);
            assert_eq!(blob.entry_count, 0);
            assert!(blob.bytes > 0);
            assert!(list_entries(&path).unwrap().is_empty());
        }

        #[test]
        fn test_pack_is_deterministic() {
            let root = tree();
            let out = TempDir::new().unwrap();
            let set = crate::scan::scan(root.path(), SyncWindow::new(secs(0), secs(100))).unwrap();
            let a = pack_with(CompressionAlgo::Zstd, root.path(), &set, &out.path().join("a.tar.zst"));
            let b = pack_with(CompressionAlgo::Zstd, root.path(), &set, &out.path().join("b.tar.zst"));
            assert_eq!(a.sha256, b.sha256);
            assert_eq!(a.sha256.len(), 64);
        }

        #[test]
        fn test_no_partial_left_behind() {
            let root = tree();
            let out = TempDir::new().unwrap();
            let set = crate::scan::scan(root.path(), SyncWindow::new(secs(0), secs(100))).unwrap();
            pack_with(CompressionAlgo::None, root.path(), &set, &out.path().join("x.tar"));
            let names: Vec<_> = std::fs::read_dir(out.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            assert_eq!(names, vec!["x.tar".to_string()]);
        }

        #[test]
        fn test_vanished_file_is_skipped() {
            let root = tree();
            let out = TempDir::new().unwrap();
            let set = crate::scan::scan(root.path(), SyncWindow::new(secs(0), secs(100))).unwrap();
            std::fs::remove_file(root.path().join("GENERAL/StudyA/1001/a.csv")).unwrap();

            let blob = pack_with(CompressionAlgo::Zstd, root.path(), &set, &out.path().join("x.tar.zst"));
            assert_eq!(blob.entry_count, 2);
            assert_eq!(blob.skipped.len(), 1);
            assert_eq!(
                blob.skipped[0].relative_path,
                PathBuf::from("GENERAL/StudyA/1001/a.csv")
            );
        }

        #[test]
        fn test_remove_is_idempotent() {
            let root = tree();
            let out = TempDir::new().unwrap();
            let set = ChangeSet::empty(SyncWindow::new(secs(1), secs(1)));
            let blob = pack_with(CompressionAlgo::None, root.path(), &set, &out.path().join("x.tar"));
            blob.remove().unwrap();
            blob.remove().unwrap();
            assert!(!blob.path.exists());
        }
    }

    mod miss_list {
        use super::*;

        #[test]
        fn test_miss_list_reports_files_after_window() {
            let root = tree();
            write_file_at(root.path(), "GENERAL/StudyA/1001/late.csv", b"late", secs(50));
            let out = TempDir::new().unwrap();
            let set = crate::scan::scan(root.path(), SyncWindow::new(secs(15), secs(35))).unwrap();

            let archiver = Archiver::new(ArchiverConfig {
                miss_list: true,
                ..ArchiverConfig::default()
            });
            let blob = archiver
                .pack(root.path(), &set, &out.path().join("x.tar.zst"))
                .unwrap();

            let listing_path = blob.miss_list.clone().unwrap();
            assert_eq!(listing_path, miss_list_path(&blob.path));
            let listing = std::fs::read_to_string(listing_path).unwrap();
            assert!(listing.contains("GENERAL/StudyA/1001/late.csv"));
            // a.csv is older than the watermark: already sent, not a miss.
            assert!(!listing.contains("a.csv"));
            assert!(!listing.contains("b.csv"));
        }

        #[test]
        fn test_miss_list_disabled_by_default() {
            let root = tree();
            let out = TempDir::new().unwrap();
            let set = crate::scan::scan(root.path(), SyncWindow::new(secs(15), secs(35))).unwrap();
            let blob = pack_with(CompressionAlgo::Zstd, root.path(), &set, &out.path().join("x.tar.zst"));
            assert!(blob.miss_list.is_none());
            assert!(!miss_list_path(&blob.path).exists());
        }
    }
}
