//! Log output for the piecestream binary.
//!
//! Two sinks: stderr, whose verbosity the user picks with `-v` and `-q`, and
//! a per-run file that always records this workspace's crates at trace level.
//! Dependencies stay at `warn` on the console so piece-level chatter is not
//! buried under runtime noise.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the per-run trace log inside the logs directory.
pub const LOG_FILE_NAME: &str = "piecestream-last-run.log";

const OWN_TARGETS: [&str; 2] = ["piecestream_core", "piecestream"];

#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("Cannot create log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A global tracing subscriber is already installed")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Console verbosity chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
    Debug,
    Trace,
}

impl Verbosity {
    /// Maps `-q` and repeated `-v` flags. `-q` wins.
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        if quiet {
            return Verbosity::Quiet;
        }
        match verbose {
            0 => Verbosity::Normal,
            1 => Verbosity::Verbose,
            2 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }

    /// `EnvFilter` directives for the console sink.
    pub fn console_directives(self) -> String {
        let (dependencies, own) = match self {
            Verbosity::Quiet => ("error", "error"),
            Verbosity::Normal => ("warn", "warn"),
            Verbosity::Verbose => ("warn", "info"),
            Verbosity::Debug => ("warn", "debug"),
            Verbosity::Trace => ("info", "trace"),
        };
        scoped_directives(dependencies, own)
    }
}

fn scoped_directives(dependencies: &str, own: &str) -> String {
    std::iter::once(dependencies.to_string())
        .chain(OWN_TARGETS.iter().map(|target| format!("{target}={own}")))
        .collect::<Vec<_>>()
        .join(",")
}

/// Location of the per-run log; `logs_dir` defaults to `./logs`.
pub fn log_file_path(logs_dir: Option<&Path>) -> PathBuf {
    logs_dir
        .unwrap_or_else(|| Path::new("logs"))
        .join(LOG_FILE_NAME)
}

fn open_log_file(path: &Path) -> Result<File, TracingSetupError> {
    let log_file_error = |source| TracingSetupError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(log_file_error)?;
    }
    File::create(path).map_err(log_file_error)
}

/// Installs the global subscriber and returns the path of the run's log file,
/// which is truncated first. `RUST_LOG` replaces the console directives.
///
/// # Errors
///
/// - `TracingSetupError::LogFile` - If the log file cannot be created
/// - `TracingSetupError::AlreadyInstalled` - If called twice in one process
pub fn init_tracing(
    verbosity: Verbosity,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingSetupError> {
    let path = log_file_path(logs_dir);
    let log_file = open_log_file(&path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.console_directives()));
    let console_layer = fmt::layer()
        .compact()
        .with_target(verbosity >= Verbosity::Debug)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(scoped_directives("info", "trace")));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        "Logging to stderr at {:?}, full trace in {}",
        verbosity,
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_map_to_verbosity() {
        assert_eq!(Verbosity::from_flags(false, 0), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(false, 1), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, 2), Verbosity::Debug);
        assert_eq!(Verbosity::from_flags(false, 9), Verbosity::Trace);
        assert_eq!(Verbosity::from_flags(true, 3), Verbosity::Quiet);
    }

    #[test]
    fn test_console_keeps_dependencies_quiet() {
        assert_eq!(
            Verbosity::Verbose.console_directives(),
            "warn,piecestream_core=info,piecestream=info"
        );
        assert_eq!(
            Verbosity::Quiet.console_directives(),
            "error,piecestream_core=error,piecestream=error"
        );
    }

    #[test]
    fn test_log_file_lives_in_logs_dir() {
        assert_eq!(
            log_file_path(None),
            Path::new("logs").join("piecestream-last-run.log")
        );

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let path = log_file_path(Some(nested.as_path()));
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }
}
