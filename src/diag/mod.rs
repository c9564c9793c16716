//! ZENEDGE diagnostic logging facade.
//!
//! The teacher's `log/mod.rs` re-exports a `Logger`/`LogLevel`/`Severity`
//! triple that forwards to VGA/serial; `ipc/mod.rs` elsewhere in the same
//! tree calls `log::info!`/`log::warn!` as if the `log` crate were already
//! wired in. ZENEDGE reconciles the two: this module *is* that `log::Log`
//! implementation, so the rest of the crate can use the ordinary
//! `log::{info, warn, error}` macros, and `Severity` survives as a thin
//! wrapper for call sites that want the teacher's naming.
//!
//! This is the one sanctioned global in the crate: `log::set_logger` is
//! inherently process-wide. The embedder calls [`init`] once at startup
//! with a concrete [`Platform`](crate::platform::Platform); nothing here
//! self-initializes lazily.

use crate::platform::Platform;
use core::fmt::Write as _;
use log::{Level, Log, Metadata, Record};
use spin::Mutex;

/// Severity alias kept for readability at call sites that prefer the
/// teacher's vocabulary over `log::Level` directly.
pub type Severity = Level;

struct ConsoleLogger {
    sink: Mutex<Option<&'static dyn Platform>>,
}

static LOGGER: ConsoleLogger = ConsoleLogger {
    sink: Mutex::new(None),
};

impl Log for ConsoleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if let Some(platform) = *self.sink.lock() {
            let mut line = arrayvec::ArrayString::<256>::new();
            let _ = write!(line, "[{}] {}\n", record.level(), record.args());
            platform.console_write(line.as_bytes());
        }
    }

    fn flush(&self) {}
}

/// Wire the diagnostic facade up to a concrete platform's console sink.
/// Idempotent: a later call just swaps the sink.
pub fn init(platform: &'static dyn Platform) {
    *LOGGER.sink.lock() = Some(platform);
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Trace);
}
