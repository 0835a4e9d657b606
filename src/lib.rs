//! # distpack Core Library
//!
//! Packages a build output directory into a versioned zip archive, reporting
//! byte-level progress, and records the version used so the next run
//! increments it.
//!
//! ## Key Modules
//!
//! - [`size`]: `stat`-inclusive directory sizing with bounded fan-out.
//! - [`archive`]: Streams a directory tree into a zip container.
//! - [`ledger`]: Per-environment version counters behind an injectable store.
//! - [`publish`]: Drives sizing, archiving, progress and the final commit.
//! - [`manifest`] / [`config`]: The `package.json` naming configuration.
//!
//! ## Examples
//!
//! ```no_run
//! use distpack::archive::ArchiveMethod;
//! use distpack::config::{Environment, PackConfig};
//! use distpack::ledger::{MemoryStore, VersionLedger};
//! use distpack::publish::{Naming, PublishOptions, Publisher};
//!
//! # async fn demo() -> Result<(), distpack::PackError> {
//! let options = PublishOptions {
//!     source_dir: "dist".into(),
//!     output_dir: ".".into(),
//!     environment: Environment::Test,
//!     method: ArchiveMethod::Deflate,
//!     fan_out: 0,
//!     sequential: false,
//!     today: chrono::Local::now().date_naive(),
//! };
//! let ledger = VersionLedger::new(MemoryStore::new());
//! let report = Publisher::new(options, Naming::Counter(PackConfig::default()), ledger)
//!     .run()
//!     .await?;
//! println!("{}", report.destination.display());
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cli;
pub mod common;
pub mod config;
pub mod error;
pub use error::PackError;
pub mod ledger;
pub mod logging;
pub mod manifest;
pub mod progress;
pub mod publish;
pub mod size;
