use std::path::Path;

use flexi_logger::{
    opt_format, Cleanup, Criterion, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming,
};

/// Starts the global logger. `RUST_LOG` wins over `level` when set.
///
/// With a directory, logs go to rotating files there (10 MB each, one old
/// file kept); otherwise to stderr.
pub fn setup_logging(level: &str, log_dir: Option<&Path>) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(level)?.format(opt_format);
    match log_dir {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename("zero_chess"))
            .rotate(
                Criterion::Size(10 * 1024 * 1024),
                Naming::Numbers,
                Cleanup::KeepLogFiles(1),
            )
            .start(),
        None => logger.log_to_stderr().start(),
    }
}
