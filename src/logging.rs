//! Log initialization (spec.md §6's `log.cmd.*`/`log.err.*`/`log.trace`
//! keys), backed by `flexi_logger` rather than the original's `PWLOGLIB`
//! wrapper over a process-wide mutex'd fd. `flexi_logger` already gives us
//! the two properties spec.md §4.11/§6 ask for: rotation by day or hour,
//! and a "latest" symlink, without hand-rolling either.

use std::path::Path;

use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

use crate::config::{LogConfig, Rotate};
use crate::error::{NetReactorError, Result};

fn criterion_for(rotate: Rotate) -> Criterion {
    match rotate {
        Rotate::Daily => Criterion::Age(flexi_logger::Age::Day),
        Rotate::Hourly => Criterion::Age(flexi_logger::Age::Hour),
    }
}

/// Initializes the process-wide logger from `[main]`'s `log.*` keys.
/// `cmd` carries everything at `info` and below; `err` (via `log.trace`)
/// additionally duplicates warnings and above to stderr, matching the
/// original's split between the command log and the trace-to-console
/// path used during interactive debugging.
pub fn init(cfg: &LogConfig) -> Result<LoggerHandle> {
    let (directory, basename) = split_path(&cfg.cmd_path);

    let mut logger = Logger::try_with_str("info")
        .map_err(|e| NetReactorError::Config(format!("logger spec: {e}")))?
        .log_to_file(FileSpec::default().directory(directory).basename(basename))
        .rotate(criterion_for(cfg.cmd_rotate), Naming::Timestamps, Cleanup::Never)
        .create_symlink(format!("{}.latest", cfg.cmd_path));

    if cfg.trace {
        logger = logger.duplicate_to_stderr(Duplicate::Trace);
    }

    logger
        .start()
        .map_err(|e| NetReactorError::Config(format!("starting logger: {e}")))
}

/// Splits `path` into the directory `flexi_logger` should write into and
/// the basename it should prefix rotated files with.
fn split_path(path: &str) -> (String, String) {
    let p = Path::new(path);
    let dir = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let base = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "netreactord".to_string());
    (dir.to_string_lossy().into_owned(), base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_separates_directory_and_basename() {
        assert_eq!(split_path("./log/cmd"), ("./log".to_string(), "cmd".to_string()));
        assert_eq!(split_path("cmd"), (".".to_string(), "cmd".to_string()));
    }
}
