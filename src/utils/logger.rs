use std::sync::Once;

use log::{Level, LevelFilter, Metadata, Record};

/// Logger implementation for the kernel: one line per record on stderr.
struct KernelLogger;

impl log::Log for KernelLogger {
    /// Checks if the given log level is enabled.
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Logs the record by printing it to the host's stderr.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    /// Flushes the logger (no-op in this case).
    fn flush(&self) {}
}

/// The logger instance used for all kernel logging.
static LOGGER: KernelLogger = KernelLogger;

static INIT: Once = Once::new();

/// Initializes the logger. Idempotent, so repeated machine boots within
/// one host process share the first initialization.
///
/// The level defaults to Info and can be overridden with the TINYOS_LOG
/// environment variable (error, warn, info, debug, trace, off).
pub fn init() {
    INIT.call_once(|| {
        let filter = match std::env::var("TINYOS_LOG").as_deref() {
            Ok("off") => LevelFilter::Off,
            Ok("error") => LevelFilter::Error,
            Ok("warn") => LevelFilter::Warn,
            Ok("debug") => LevelFilter::Debug,
            Ok("trace") => LevelFilter::Trace,
            _ => LevelFilter::Info,
        };
        match log::set_logger(&LOGGER).map(|()| log::set_max_level(filter)) {
            Ok(()) => log::log!(Level::Debug, "logger initialized at {}", filter),
            Err(err) => eprintln!("logger initialization failed: {}", err),
        }
    });
}
