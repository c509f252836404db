use clap::ValueEnum;
use slog::{Drain, Level, LevelFilter, Logger};
use slog_async::Async;
use slog_term::{FullFormat, TermDecorator};

/// Minimum log level to emit, settable from the command line or environment.
///
/// Mirrors the `LogLevel` the teacher crates expose from
/// `maelstrom_util::config::common`, trimmed to what this service needs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
#[clap(rename_all = "lower")]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_slog_level(self) -> Level {
        match self {
            LogLevel::Error => Level::Error,
            LogLevel::Warning => Level::Warning,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
        }
    }
}

/// Builds the root logger: terminal-formatted, asynchronous, filtered to `level`.
///
/// Same drain stack `maelstrom-broker`'s `main` builds, so every long-lived
/// coderunner process logs the same way.
pub fn build_root_logger(level: LogLevel) -> Logger {
    let decorator = TermDecorator::new().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = Async::new(drain).build().fuse();
    let drain = LevelFilter::new(drain, level.as_slog_level()).fuse();
    Logger::root(drain, slog::o!())
}
