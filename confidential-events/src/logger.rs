//! Logging.
use once_cell::sync::OnceCell;
use slog::{o, Drain as _};

static ROOT: OnceCell<slog::Logger> = OnceCell::new();

fn build(level: slog::Level) -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, o!())
}

/// Initialize the root logger with the given level.
///
/// Has no effect if a logger was already handed out.
pub fn init(level: slog::Level) {
    let _ = ROOT.set(build(level));
}

/// Get a logger for the given module.
pub fn get_logger(module: &'static str) -> slog::Logger {
    ROOT.get_or_init(|| build(slog::Level::Info))
        .new(o!("module" => module))
}
