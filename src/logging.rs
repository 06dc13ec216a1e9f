use std::path::Path;

use facegate_config::LoggingSettings;
use facegate_core::errors::{AppError, AppResult};
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Subscriber for one command invocation plus the writer guard of its file sink.
///
/// Keep the value alive for as long as events should reach the log file; dropping it flushes
/// pending lines.
pub struct Logging {
    pub dispatch: Dispatch,
    _file_guard: Option<WorkerGuard>,
}

impl Logging {
    /// Run `f` with this subscriber as the current dispatcher.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

/// Build the stderr layer (verbosity or `RUST_LOG`) and, when configured, the append-only file
/// layer filtered by `logging.level`.
pub fn build_logging(verbose: u8, settings: &LoggingSettings) -> AppResult<Logging> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let (file_layer, file_guard) = match settings.file.as_deref() {
        Some(path) => {
            let file_filter =
                EnvFilter::try_new(&settings.level).map_err(|err| AppError::LoggingSetup {
                    message: format!("invalid logging.level '{}': {err}", settings.level),
                })?;
            let appender = open_append_only(path)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer);

    Ok(Logging {
        dispatch: Dispatch::new(subscriber),
        _file_guard: file_guard,
    })
}

fn open_append_only(path: &Path) -> AppResult<RollingFileAppender> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| AppError::LoggingSetup {
            message: format!("log file path {} has no file name", path.display()),
        })?;

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
        .map_err(|err| AppError::LoggingSetup {
            message: format!("cannot open log file {}: {err}", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn settings(file: Option<std::path::PathBuf>, level: &str) -> LoggingSettings {
        LoggingSettings {
            file,
            level: level.into(),
        }
    }

    #[test]
    fn file_sink_appends_events() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys.log");
        fs::write(&path, "earlier line\n").unwrap();

        let logging = build_logging(0, &settings(Some(path.clone()), "debug")).unwrap();
        logging.scope(|| {
            tracing::info!(target: "audit", identity = "alice", "access authorized");
            tracing::trace!("too chatty for the file");
        });
        drop(logging);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("earlier line\n"));
        assert!(contents.contains("access authorized"));
        assert!(contents.contains("identity=\"alice\""));
        assert!(!contents.contains("too chatty"));
    }

    #[test]
    fn disabled_file_sink_builds() {
        let logging = build_logging(1, &settings(None, "not a level [")).unwrap();
        logging.scope(|| tracing::debug!("stderr only"));
    }

    #[test]
    fn invalid_level_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = build_logging(0, &settings(Some(tmp.path().join("sys.log")), "audit=loud"))
            .err()
            .unwrap();
        assert!(matches!(err, AppError::LoggingSetup { .. }));
    }
}
