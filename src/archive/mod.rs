//! # Zip Archive Writer
//!
//! Streams a directory tree into a zip container. Entries are visited in a
//! single sorted traversal so that two runs over an unchanged tree produce the
//! same entry list. Progress is reported in the same `stat`-inclusive units as
//! [`crate::size::SizeWalker`], so on an unchanged tree the final
//! `processed_bytes` equals the sizing total.
//!
//! The writer is synchronous; the publisher runs it on a blocking task and
//! receives progress over a bounded channel.

use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Local, Timelike};
use clap::ValueEnum;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::common::{ArchiveProgressEvent, CancelFlag, DirectoryEntry, EntryKind};
use crate::error::{EntryError, PackError};

/// Read buffer size; one progress event is emitted per chunk.
const CHUNK_SIZE: usize = 1024 * 1024;
/// Output buffer in front of the destination file.
const OUTPUT_BUFFER: usize = 8 * 1024 * 1024;
/// Entries at or above this size need zip64 headers.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;
/// Extension of the in-progress destination file.
pub const PARTIAL_SUFFIX: &str = "part";

/// Compression method for archive entries.
#[derive(ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ArchiveMethod {
    /// Deflate, readable by every unzip tool.
    #[default]
    Deflate,
    /// No compression.
    Stored,
    /// Zstandard. Needs a zip reader with zstd support.
    Zstd,
}

impl From<ArchiveMethod> for CompressionMethod {
    fn from(method: ArchiveMethod) -> Self {
        match method {
            ArchiveMethod::Deflate => CompressionMethod::Deflated,
            ArchiveMethod::Stored => CompressionMethod::Stored,
            ArchiveMethod::Zstd => CompressionMethod::Zstd,
        }
    }
}

/// Receives cumulative progress from a running archive.
pub trait ProgressSink {
    /// Returns `false` once nobody is listening any more; the archive run then stops.
    fn emit(&mut self, event: ArchiveProgressEvent) -> bool;
}

/// Blocks until the receiver has room. Only use it off the async runtime,
/// e.g. from inside `spawn_blocking`; `blocking_send` panics on a runtime thread.
impl ProgressSink for mpsc::Sender<ArchiveProgressEvent> {
    fn emit(&mut self, event: ArchiveProgressEvent) -> bool {
        self.blocking_send(event).is_ok()
    }
}

impl ProgressSink for Vec<ArchiveProgressEvent> {
    fn emit(&mut self, event: ArchiveProgressEvent) -> bool {
        self.push(event);
        true
    }
}

/// Discards progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&mut self, _event: ArchiveProgressEvent) -> bool {
        true
    }
}

/// Result of a finalized archive.
#[derive(Debug, Default)]
pub struct ArchiveOutcome {
    /// Length of the finished container in bytes.
    pub final_size_bytes: u64,
    /// Source bytes accounted for, in sizing units.
    pub processed_bytes: u64,
    /// Number of zip entries written.
    pub entries: u64,
    /// Entries that disappeared between enumeration and read.
    pub vanished: Vec<EntryError>,
}

pub struct ArchiveWriter {
    method: ArchiveMethod,
    cancel: CancelFlag,
}

impl ArchiveWriter {
    pub fn new(method: ArchiveMethod) -> Self {
        Self {
            method,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Writes the archive of `root` to `destination`.
    ///
    /// Data goes to `<destination>.part` first and is renamed into place only
    /// after the trailer is written and the file synced. On failure the partial
    /// file is left where it is. Both files are left out of the walk when they
    /// fall inside `root`.
    pub fn write_to_file<P: ProgressSink>(
        &self,
        root: &Path,
        destination: &Path,
        progress: &mut P,
    ) -> Result<ArchiveOutcome, PackError> {
        let partial = partial_path(destination);
        let file = File::create(&partial).map_err(|e| PackError::archive_io(&partial, e))?;
        let writer = BufWriter::with_capacity(OUTPUT_BUFFER, file);

        let own_output: Vec<PathBuf> = [resolve(&partial), resolve(destination)]
            .into_iter()
            .flatten()
            .collect();
        let (writer, mut outcome) = self.stream(root, writer, &partial, progress, &own_output)?;

        let file = writer
            .into_inner()
            .map_err(|e| PackError::archive_io(&partial, e.into_error()))?;
        file.sync_all().map_err(|e| PackError::archive_io(&partial, e))?;
        outcome.final_size_bytes = file
            .metadata()
            .map_err(|e| PackError::archive_io(&partial, e))?
            .len();
        drop(file);

        fs::rename(&partial, destination).map_err(|e| PackError::archive_io(destination, e))?;
        Ok(outcome)
    }

    /// Streams `root` into `sink` and finalizes the container.
    ///
    /// `sink_path` only labels errors raised while writing. The sink is handed
    /// back after the trailer has been written.
    pub fn stream_archive<W: Write + Seek, P: ProgressSink>(
        &self,
        root: &Path,
        sink: W,
        sink_path: &Path,
        progress: &mut P,
    ) -> Result<(W, ArchiveOutcome), PackError> {
        self.stream(root, sink, sink_path, progress, &[])
    }

    /// `skip` holds canonical paths that are never visited.
    fn stream<W: Write + Seek, P: ProgressSink>(
        &self,
        root: &Path,
        sink: W,
        sink_path: &Path,
        progress: &mut P,
        skip: &[PathBuf],
    ) -> Result<(W, ArchiveOutcome), PackError> {
        let canonical_root = if skip.is_empty() { None } else { fs::canonicalize(root).ok() };
        let mut run = ArchiveRun {
            zip: ZipWriter::new(sink),
            sink_path,
            method: self.method,
            progress,
            event: ArchiveProgressEvent::default(),
            outcome: ArchiveOutcome::default(),
            buf: vec![0u8; CHUNK_SIZE],
        };

        let walk = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_skipped(canonical_root.as_deref(), root, entry.path(), skip));
        for item in walk {
            if self.cancel.is_cancelled() {
                return Err(PackError::Interrupted);
            }
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    run.walk_error(root, err)?;
                    continue;
                }
            };
            let metadata = match entry.metadata() {
                Ok(md) => md,
                Err(err) => {
                    run.walk_error(root, err)?;
                    continue;
                }
            };
            let name = entry_name(root, entry.path(), entry.depth());
            run.add_entry(&DirectoryEntry::from_metadata(entry.into_path(), &metadata), name, &metadata)?;
        }

        let mut sink = run
            .zip
            .finish()
            .map_err(|source| PackError::Zip { path: sink_path.to_path_buf(), source })?;
        let mut outcome = run.outcome;
        outcome.final_size_bytes = sink
            .stream_position()
            .map_err(|e| PackError::archive_io(sink_path, e))?;
        outcome.processed_bytes = run.event.processed_bytes;

        debug!(
            entries = outcome.entries,
            processed_bytes = outcome.processed_bytes,
            final_size_bytes = outcome.final_size_bytes,
            vanished = outcome.vanished.len(),
            "archive finalized"
        );
        Ok((sink, outcome))
    }
}

/// `<destination>.part`, next to the destination.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// `path` with its parent directory canonicalized. The file itself may not exist yet.
fn resolve(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Some(fs::canonicalize(parent).ok()?.join(name))
}

fn is_skipped(canonical_root: Option<&Path>, root: &Path, path: &Path, skip: &[PathBuf]) -> bool {
    let (Some(canonical_root), Ok(relative)) = (canonical_root, path.strip_prefix(root)) else {
        return false;
    };
    let candidate = canonical_root.join(relative);
    skip.iter().any(|s| *s == candidate)
}

/// Mutable state of one archive run.
struct ArchiveRun<'a, W: Write + Seek, P: ProgressSink> {
    zip: ZipWriter<W>,
    sink_path: &'a Path,
    method: ArchiveMethod,
    progress: &'a mut P,
    event: ArchiveProgressEvent,
    outcome: ArchiveOutcome,
    buf: Vec<u8>,
}

impl<'a, W: Write + Seek, P: ProgressSink> ArchiveRun<'a, W, P> {
    fn add_entry(&mut self, entry: &DirectoryEntry, name: String, metadata: &Metadata) -> Result<(), PackError> {
        match entry.kind {
            EntryKind::Dir => {
                // Directories only appear implicitly through the paths of their files.
                self.advance(entry.size, true)
            }
            EntryKind::File => self.add_file(&entry.path, name, metadata),
            EntryKind::Symlink => self.add_symlink(&entry.path, name, metadata),
            EntryKind::Other => {
                warn!(path = %entry.path.display(), "skipping special file");
                self.advance(entry.size, true)
            }
        }
    }

    fn add_file(&mut self, path: &Path, name: String, metadata: &Metadata) -> Result<(), PackError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.vanished(path, err);
                return Ok(());
            }
            Err(err) => return Err(PackError::archive_io(path, err)),
        };

        let options = entry_options(self.method, metadata);
        self.zip
            .start_file(name, options)
            .map_err(|source| PackError::Zip { path: self.sink_path.to_path_buf(), source })?;
        self.outcome.entries += 1;

        loop {
            let n = match file.read(&mut self.buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(PackError::archive_io(path, err)),
            };
            self.zip
                .write_all(&self.buf[..n])
                .map_err(|e| PackError::archive_io(self.sink_path, e))?;
            self.advance(n as u64, false)?;
        }
        self.advance(0, true)
    }

    fn add_symlink(&mut self, path: &Path, name: String, metadata: &Metadata) -> Result<(), PackError> {
        let target = match fs::read_link(path) {
            Ok(target) => target,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.vanished(path, err);
                return Ok(());
            }
            Err(err) => return Err(PackError::archive_io(path, err)),
        };
        let options = entry_options(self.method, metadata);
        self.zip
            .add_symlink(name, target.to_string_lossy(), options)
            .map_err(|source| PackError::Zip { path: self.sink_path.to_path_buf(), source })?;
        self.outcome.entries += 1;
        self.advance(metadata.len(), true)
    }

    fn advance(&mut self, bytes: u64, entry_done: bool) -> Result<(), PackError> {
        self.event.processed_bytes += bytes;
        if entry_done {
            self.event.entries_processed += 1;
        }
        if self.progress.emit(self.event) {
            Ok(())
        } else {
            Err(PackError::Interrupted)
        }
    }

    fn vanished(&mut self, path: &Path, err: io::Error) {
        warn!(path = %path.display(), "entry vanished before it could be archived");
        self.outcome.vanished.push(EntryError::new(path, err));
    }

    /// Vanished entries are skipped; every other traversal error is fatal.
    fn walk_error(&mut self, root: &Path, err: walkdir::Error) -> Result<(), PackError> {
        let path = err.path().unwrap_or(root).to_path_buf();
        let source = err
            .into_io_error()
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
        if source.kind() == io::ErrorKind::NotFound {
            self.vanished(&path, source);
            Ok(())
        } else {
            Err(PackError::ArchiveIo { path, source })
        }
    }
}

/// Relative, `/`-separated entry name. A file root is stored under its own name.
fn entry_name(root: &Path, path: &Path, depth: usize) -> String {
    let relative = if depth == 0 {
        Path::new(path.file_name().unwrap_or(path.as_os_str()))
    } else {
        path.strip_prefix(root).unwrap_or(path)
    };
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn entry_options(method: ArchiveMethod, metadata: &Metadata) -> FileOptions {
    let mut options = FileOptions::default()
        .compression_method(method.into())
        .large_file(metadata.len() >= ZIP64_THRESHOLD);
    if let Some(modified) = zip_timestamp(metadata) {
        options = options.last_modified_time(modified);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(metadata.permissions().mode());
    }
    options
}

/// Local mtime as a DOS timestamp. Dates zip cannot express fall back to the default.
fn zip_timestamp(metadata: &Metadata) -> Option<zip::DateTime> {
    let modified: chrono::DateTime<Local> = metadata.modified().ok()?.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(modified.year()).ok()?,
        modified.month() as u8,
        modified.day() as u8,
        modified.hour() as u8,
        modified.minute() as u8,
        modified.second() as u8,
    )
    .ok()
}
