use clap::Parser;
use std::path::PathBuf;

use crate::archive::ArchiveMethod;
use crate::config::Environment;
use crate::logging::Verbosity;
use crate::manifest::DEFAULT_MANIFEST;
use crate::publish::NamingScheme;

/// Package a build output directory into a versioned zip archive.
///
/// With no arguments, `./dist` is zipped next to `./package.json`, named from
/// its `config.pack` section, and the test or production counter is advanced.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Project root holding the manifest. Defaults to the current directory.
    #[arg(long)]
    pub project_dir: Option<PathBuf>,

    /// Directory to archive, relative to the project root.
    #[arg(long, default_value = "dist")]
    pub source: PathBuf,

    /// Where the archive is written. Defaults to the project root.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Manifest with the `config.pack` section and version counters.
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Deployment environment. `production` in NODE_ENV selects production; anything else is test.
    #[arg(long, value_enum)]
    pub env: Option<Environment>,

    /// Value of NODE_ENV, consulted when `--env` is not given.
    #[arg(long, env = "NODE_ENV", hide = true)]
    pub node_env: Option<String>,

    /// Compression method for archive entries.
    #[arg(long, value_enum, default_value_t = ArchiveMethod::Deflate)]
    pub method: ArchiveMethod,

    /// How the archive file is named.
    #[arg(long, value_enum, default_value_t = NamingScheme::Counter)]
    pub scheme: NamingScheme,

    /// Directories sized concurrently. [0 = one per CPU core]
    #[arg(long, default_value_t = 0)]
    pub fan_out: usize,

    /// Finish sizing the source before archiving starts.
    #[arg(long)]
    pub sequential: bool,

    /// Do not draw the progress bar.
    #[arg(long)]
    pub no_progress: bool,

    /// Log debug details.
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    pub fn environment(&self) -> Environment {
        self.env
            .unwrap_or_else(|| Environment::from_node_env(self.node_env.as_deref()))
    }

    pub fn verbosity(&self) -> Verbosity {
        if self.verbose {
            Verbosity::Verbose
        } else if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    /// Resolves (project dir, manifest, source dir, output dir) against `cwd`.
    pub fn paths(&self, cwd: PathBuf) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
        let project = match &self.project_dir {
            Some(dir) => cwd.join(dir),
            None => cwd,
        };
        let manifest = match &self.manifest {
            Some(path) => project.join(path),
            None => project.join(DEFAULT_MANIFEST),
        };
        let source = project.join(&self.source);
        let output = match &self.output_dir {
            Some(dir) => project.join(dir),
            None => project.clone(),
        };
        (project, manifest, source, output)
    }
}

/// Parses command-line arguments using `clap`.
pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_are_required() {
        let args = Args::try_parse_from(["distpack"]).unwrap();
        assert_eq!(args.source, PathBuf::from("dist"));
        assert_eq!(args.method, ArchiveMethod::Deflate);
        assert_eq!(args.scheme, NamingScheme::Counter);
        assert_eq!(args.verbosity(), Verbosity::Normal);
    }

    #[test]
    fn explicit_env_beats_node_env() {
        let args = Args::try_parse_from(["distpack", "--env", "production", "--node-env", "development"]).unwrap();
        assert_eq!(args.environment(), Environment::Production);

        let args = Args::try_parse_from(["distpack", "--node-env", "production"]).unwrap();
        assert_eq!(args.environment(), Environment::Production);
    }

    #[test]
    fn paths_resolve_against_project_dir() {
        let args = Args::try_parse_from(["distpack", "--project-dir", "web", "-o", "/tmp/out"]).unwrap();
        let (project, manifest, source, output) = args.paths(PathBuf::from("/work"));
        assert_eq!(project, PathBuf::from("/work/web"));
        assert_eq!(manifest, PathBuf::from("/work/web/package.json"));
        assert_eq!(source, PathBuf::from("/work/web/dist"));
        assert_eq!(output, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["distpack", "-v", "-q"]).is_err());
    }
}
