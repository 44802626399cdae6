//! Tracing setup: stdout plus an optional rolling log file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;
use crate::error::ConfigError;

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins over the configured level. The returned guard must be
/// kept alive for the file writer to flush.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter());

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::InvalidValue {
            key: "LOG_LEVEL".into(),
            message: format!("failed to install subscriber: {e}"),
        })?;

    Ok(guard)
}

/// Daily-rolling non-blocking writer for `path`, creating its directory.
pub fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), ConfigError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    let file_name = path.file_name().ok_or_else(|| ConfigError::InvalidValue {
        key: "LOG_FILE".into(),
        message: format!("'{}' has no file name", path.display()),
    })?;

    std::fs::create_dir_all(&dir)?;
    let appender = tracing_appender::rolling::daily(&dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_writer_creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/nested/forwarder.log");
        let (_writer, _guard) = file_writer(&path).unwrap();
        assert!(tmp.path().join("logs/nested").is_dir());
    }

    #[test]
    fn file_writer_rejects_path_without_name() {
        let err = file_writer(Path::new("/")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LOG_FILE"));
    }
}
