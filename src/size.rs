//! Recursive, `stat`-inclusive directory sizing.
//!
//! The walker visits every entry below a root with `lstat` semantics: files
//! contribute their byte length, directories and symlinks their own metadata
//! size. Sibling directories are listed concurrently, bounded by the fan-out.
//! Only a failure on the root itself is fatal; anything below it is recorded
//! in [`SizeResult::errors`] and the walk carries on.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::common::CancelFlag;
use crate::error::{EntryError, PackError};

/// Outcome of one sizing walk.
#[derive(Debug, Default)]
pub struct SizeResult {
    /// Sum of the sizes of every entry that could be stat'd, the root included.
    pub total_bytes: u64,
    /// Number of entries counted in `total_bytes`, the root included.
    pub entries: u64,
    /// Entries skipped below the root, in no particular order.
    pub errors: Vec<EntryError>,
}

pub struct SizeWalker {
    fan_out: usize,
    cancel: CancelFlag,
}

impl SizeWalker {
    /// `fan_out` bounds how many directories are listed at once. `0` means one per CPU.
    pub fn new(fan_out: usize) -> Self {
        let fan_out = if fan_out == 0 { num_cpus::get() } else { fan_out };
        Self {
            fan_out: fan_out.max(1),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    pub async fn compute_size(&self, root: &Path) -> Result<SizeResult, PackError> {
        let metadata = fs::symlink_metadata(root)
            .await
            .map_err(|source| PackError::RootUnreadable { path: root.to_path_buf(), source })?;

        let mut result = SizeResult {
            total_bytes: metadata.len(),
            entries: 1,
            errors: Vec::new(),
        };
        if !metadata.is_dir() {
            return Ok(result);
        }

        let root_scan = scan_directory(root.to_path_buf()).await;
        if let Some(source) = root_scan.listing_error {
            return Err(PackError::RootUnreadable { path: root.to_path_buf(), source });
        }
        let mut pending = absorb(&mut result, root_scan);

        debug!(root = %root.display(), fan_out = self.fan_out, "sizing directory tree");

        let mut tasks = JoinSet::new();
        loop {
            while tasks.len() < self.fan_out {
                match pending.pop() {
                    Some(dir) => {
                        tasks.spawn(scan_directory(dir));
                    }
                    None => break,
                }
            }
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            if self.cancel.is_cancelled() {
                tasks.abort_all();
                return Err(PackError::Interrupted);
            }
            let mut scan = joined?;
            if let Some(cause) = scan.listing_error.take() {
                warn!(path = %scan.dir.display(), error = %cause, "skipping unreadable directory");
                result.errors.push(EntryError::new(scan.dir.clone(), cause));
            }
            pending.extend(absorb(&mut result, scan));
        }

        debug!(
            total_bytes = result.total_bytes,
            entries = result.entries,
            skipped = result.errors.len(),
            "sizing finished"
        );
        Ok(result)
    }
}

/// What one directory listing contributed.
struct DirScan {
    dir: PathBuf,
    bytes: u64,
    entries: u64,
    subdirs: Vec<PathBuf>,
    errors: Vec<EntryError>,
    listing_error: Option<std::io::Error>,
}

fn absorb(result: &mut SizeResult, scan: DirScan) -> Vec<PathBuf> {
    result.total_bytes += scan.bytes;
    result.entries += scan.entries;
    result.errors.extend(scan.errors);
    scan.subdirs
}

/// Lists `dir` and stats each child. The directory's own size belongs to its parent.
async fn scan_directory(dir: PathBuf) -> DirScan {
    let mut scan = DirScan {
        dir,
        bytes: 0,
        entries: 0,
        subdirs: Vec::new(),
        errors: Vec::new(),
        listing_error: None,
    };

    let mut reader = match fs::read_dir(&scan.dir).await {
        Ok(reader) => reader,
        Err(err) => {
            scan.listing_error = Some(err);
            return scan;
        }
    };

    loop {
        match reader.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                match fs::symlink_metadata(&path).await {
                    Ok(md) => {
                        scan.bytes += md.len();
                        scan.entries += 1;
                        if md.is_dir() {
                            scan.subdirs.push(path);
                        }
                    }
                    Err(cause) => {
                        warn!(path = %path.display(), error = %cause, "skipping entry");
                        scan.errors.push(EntryError::new(path, cause));
                    }
                }
            }
            Ok(None) => break,
            Err(cause) => {
                warn!(path = %scan.dir.display(), error = %cause, "directory listing cut short");
                scan.errors.push(EntryError::new(scan.dir.clone(), cause));
                break;
            }
        }
    }
    scan
}
