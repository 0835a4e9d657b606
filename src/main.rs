//! Main entry point for the distpack CLI app

use std::error::Error as _;
use std::process::ExitCode;

use distpack::cli::{self, Args};
use distpack::common::CancelFlag;
use distpack::ledger::{ManifestStore, VersionLedger};
use distpack::manifest::Manifest;
use distpack::progress::{bytes_to_size, cli_progress_callback};
use distpack::publish::{Naming, PublishOptions, Publisher};
use distpack::{logging, PackError};

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    logging::init(args.verbosity());

    if let Err(e) = run_app(args).await {
        eprintln!("Error: {}", e);
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_app(args: Args) -> Result<(), PackError> {
    let cwd = std::env::current_dir().map_err(|source| PackError::RootUnreadable {
        path: ".".into(),
        source,
    })?;
    let (_project, manifest_path, source_dir, output_dir) = args.paths(cwd);

    let manifest = Manifest::load(&manifest_path)?;
    let naming = Naming::from_manifest(&manifest, args.scheme)?;

    let options = PublishOptions {
        source_dir,
        output_dir,
        environment: args.environment(),
        method: args.method,
        fan_out: args.fan_out,
        sequential: args.sequential,
        today: chrono::Local::now().date_naive(),
    };

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next entry");
            on_interrupt.cancel();
        }
    });

    let mut publisher = Publisher::new(options, naming, VersionLedger::new(ManifestStore::new(&manifest_path)))
        .with_cancel(cancel);
    if !args.no_progress {
        publisher = publisher.with_progress(Box::new(cli_progress_callback("pack")));
    }

    let report = publisher.run().await?;
    match report.version {
        Some(version) => println!(
            "{} ({}, version {})",
            report.destination.display(),
            bytes_to_size(report.outcome.final_size_bytes),
            version
        ),
        None => println!(
            "{} ({})",
            report.destination.display(),
            bytes_to_size(report.outcome.final_size_bytes)
        ),
    }
    Ok(())
}
