//! The publish run: name the archive, size and stream the source tree, then
//! advance the version counter.
//!
//! ```text
//! Idle -> SizingAndArchiving -> Finalizing -> Done
//!   \            \                   \
//!    `------------`-------------------`-----> Failed
//! ```
//!
//! Sizing runs as an async task and archiving on a blocking task. Progress
//! reaches the tracker over a bounded channel; the size total only sets the
//! bar's upper bound and never gates the archive, unless `sequential` is set.

use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::ValueEnum;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveMethod, ArchiveOutcome, ArchiveWriter};
use crate::common::{ArchiveProgressEvent, CancelFlag};
use crate::config::{package_file_name, Environment, NamingPlan, PackConfig};
use crate::error::PackError;
use crate::ledger::{CounterStore, VersionLedger};
use crate::manifest::Manifest;
use crate::progress::{bytes_to_size, ProgressCallback, ProgressTracker};
use crate::size::{SizeResult, SizeWalker};

/// Events buffered between the archive thread and the progress tracker.
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    SizingAndArchiving,
    Finalizing,
    Done,
    Failed,
}

/// How the archive file is named.
#[derive(ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum NamingScheme {
    /// `config.pack` naming with a per-environment version counter.
    #[default]
    Counter,
    /// `<name>@<version>.zip` from the manifest. The counter is left alone.
    Package,
}

/// Naming input, resolved from the manifest before the run.
#[derive(Debug, Clone)]
pub enum Naming {
    Counter(PackConfig),
    Package { name: String, version: String },
}

impl Naming {
    pub fn from_manifest(manifest: &Manifest, scheme: NamingScheme) -> Result<Self, PackError> {
        match scheme {
            NamingScheme::Counter => Ok(Naming::Counter(manifest.pack_config()?)),
            NamingScheme::Package => {
                let missing = |field: &str| PackError::ManifestShape {
                    path: manifest.path().to_path_buf(),
                    reason: format!("package naming needs a string `{field}`"),
                };
                Ok(Naming::Package {
                    name: manifest.package_name().ok_or_else(|| missing("name"))?.to_string(),
                    version: manifest.package_version().ok_or_else(|| missing("version"))?.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub environment: Environment,
    pub method: ArchiveMethod,
    /// Size walk fan-out, `0` for one per CPU.
    pub fan_out: usize,
    /// Finish sizing before archiving starts.
    pub sequential: bool,
    /// Date used for the default `date` naming segment.
    pub today: NaiveDate,
}

/// The unit of work for one invocation.
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub source_dir: PathBuf,
    pub destination_path: PathBuf,
    pub expected_total_size: Option<u64>,
    /// Counter value to commit; `None` for package naming.
    pub version: Option<u64>,
}

#[derive(Debug)]
pub struct PublishReport {
    pub destination: PathBuf,
    pub version: Option<u64>,
    pub total_bytes: u64,
    pub skipped: usize,
    pub outcome: ArchiveOutcome,
    pub ledger_committed: bool,
}

pub struct Publisher<S: CounterStore> {
    options: PublishOptions,
    naming: Naming,
    ledger: VersionLedger<S>,
    progress: Option<Box<ProgressCallback>>,
    cancel: CancelFlag,
    state: PublishState,
}

/// One step of the sizing/archiving select loop.
enum Step {
    Progress(ArchiveProgressEvent),
    Sized(Result<SizeResult, PackError>),
    Archived(Result<ArchiveOutcome, PackError>),
}

impl<S: CounterStore> Publisher<S> {
    pub fn new(options: PublishOptions, naming: Naming, ledger: VersionLedger<S>) -> Self {
        Self {
            options,
            naming,
            ledger,
            progress: None,
            cancel: CancelFlag::new(),
            state: PublishState::Idle,
        }
    }

    pub fn with_progress(mut self, callback: Box<ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    pub fn ledger(&self) -> &VersionLedger<S> {
        &self.ledger
    }

    /// Runs the job to `Done` or `Failed`. The counter is only committed on success.
    pub async fn run(&mut self) -> Result<PublishReport, PackError> {
        let result = self.execute().await;
        match &result {
            Ok(_) => self.transition(PublishState::Done),
            Err(err) => {
                if err.is_persist() {
                    error!(error = %err, "archive is complete but the version counter did not advance");
                }
                self.transition(PublishState::Failed);
            }
        }
        result
    }

    async fn execute(&mut self) -> Result<PublishReport, PackError> {
        let mut job = self.prepare().await?;
        info!(
            "Zipping {} to {}",
            job.source_dir.display(),
            job.destination_path.display()
        );

        self.transition(PublishState::SizingAndArchiving);
        let (size, outcome) = self.size_and_archive(&job).await?;
        job.expected_total_size = Some(size.total_bytes);

        if !size.errors.is_empty() {
            warn!(skipped = size.errors.len(), "some entries could not be sized");
        }
        if !outcome.vanished.is_empty() {
            warn!(vanished = outcome.vanished.len(), "some entries vanished while archiving");
        }
        info!("Archive wrote {}", bytes_to_size(outcome.final_size_bytes));

        self.transition(PublishState::Finalizing);
        let ledger_committed = match job.version {
            Some(version) => {
                self.ledger.commit(self.options.environment, version)?;
                true
            }
            None => false,
        };

        Ok(PublishReport {
            destination: job.destination_path,
            version: job.version,
            total_bytes: size.total_bytes,
            skipped: size.errors.len(),
            outcome,
            ledger_committed,
        })
    }

    /// Idle: check the source, pick the version and destination.
    async fn prepare(&self) -> Result<PublishJob, PackError> {
        let source_dir = self.options.source_dir.clone();
        let metadata = tokio::fs::metadata(&source_dir)
            .await
            .map_err(|source| PackError::RootUnreadable { path: source_dir.clone(), source })?;
        if !metadata.is_dir() {
            return Err(PackError::RootUnreadable {
                path: source_dir,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            });
        }
        // A root that stats but cannot be listed must fail here, before the writer creates its file.
        tokio::fs::read_dir(&source_dir)
            .await
            .map_err(|source| PackError::RootUnreadable { path: source_dir.clone(), source })?;

        let env = self.options.environment;
        let (file_name, version) = match &self.naming {
            Naming::Counter(config) => {
                let version = self.ledger.next_version(env)?;
                let plan = NamingPlan::resolve(config, env, self.options.today);
                (plan.file_name(version), Some(version))
            }
            Naming::Package { name, version } => (package_file_name(name, version), None),
        };
        let destination_path = self.options.output_dir.join(file_name);
        if inside(&destination_path, &source_dir) {
            info!(
                destination = %destination_path.display(),
                "destination lies inside the source directory and is left out of the archive"
            );
        }

        Ok(PublishJob {
            source_dir,
            destination_path,
            expected_total_size: None,
            version,
        })
    }

    async fn size_and_archive(
        &mut self,
        job: &PublishJob,
    ) -> Result<(SizeResult, ArchiveOutcome), PackError> {
        let mut tracker = ProgressTracker::new(self.progress.take());

        let walker = SizeWalker::new(self.options.fan_out).with_cancel(self.cancel.clone());
        let root = job.source_dir.clone();
        let mut sizing = tokio::spawn(async move { walker.compute_size(&root).await });
        let mut size_result = None;

        if self.options.sequential {
            let size = flatten((&mut sizing).await)?;
            tracker.set_totals(size.total_bytes, size.entries);
            size_result = Some(size);
        }

        let (tx, mut rx) = mpsc::channel::<ArchiveProgressEvent>(PROGRESS_CHANNEL_CAPACITY);
        let writer = ArchiveWriter::new(self.options.method).with_cancel(self.cancel.clone());
        let source = job.source_dir.clone();
        let destination = job.destination_path.clone();
        let mut archiving = tokio::task::spawn_blocking(move || {
            let mut tx = tx;
            writer.write_to_file(&source, &destination, &mut tx)
        });

        let outcome = loop {
            let step = tokio::select! {
                biased;
                Some(event) = rx.recv() => Step::Progress(event),
                joined = &mut sizing, if size_result.is_none() => Step::Sized(flatten(joined)),
                joined = &mut archiving => Step::Archived(flatten(joined)),
            };
            match step {
                Step::Progress(event) => tracker.update(event),
                Step::Sized(Ok(size)) => {
                    debug!(total_bytes = size.total_bytes, "progress bound known");
                    tracker.set_totals(size.total_bytes, size.entries);
                    size_result = Some(size);
                }
                Step::Sized(Err(err)) => {
                    // Stop the writer: it sees the flag or the closed channel.
                    self.cancel.cancel();
                    drop(rx);
                    let _ = archiving.await;
                    return Err(err);
                }
                Step::Archived(Ok(outcome)) => break outcome,
                Step::Archived(Err(err)) => {
                    if size_result.is_none() {
                        sizing.abort();
                    }
                    return Err(err);
                }
            }
        };

        let size = match size_result {
            Some(size) => size,
            None => flatten(sizing.await)?,
        };
        tracker.set_totals(size.total_bytes, size.entries);
        tracker.force_completion();
        Ok((size, outcome))
    }

    fn transition(&mut self, next: PublishState) {
        debug!(from = ?self.state, to = ?next, "publish state");
        self.state = next;
    }
}

fn flatten<T>(joined: Result<Result<T, PackError>, JoinError>) -> Result<T, PackError> {
    joined.map_err(PackError::from)?
}

fn inside(path: &Path, dir: &Path) -> bool {
    match (path.parent().map(std::fs::canonicalize), std::fs::canonicalize(dir)) {
        (Some(Ok(parent)), Ok(dir)) => parent.starts_with(dir),
        _ => false,
    }
}
