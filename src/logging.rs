//! ANSI-colored categorized logger (§6), extending
//! `hdds::logging::output`'s `Output` trait / level-filtered `write`
//! from four levels to the six categories this spec names, with a
//! `log::Log` sink so call sites stay ordinary `log::info!`/`log::warn!`
//! macros.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use chrono::Utc;
use log::{Level, Log, Metadata, Record};

/// The six categories named in §6. `Note` and `More` sit below `Info`
/// in the standard `log` level set, so they are carried as structured
/// fields on `Info`-level records (`category=note` / `category=more`)
/// rather than as extra `log::Level` variants `log` doesn't have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Info,
    Note,
    Warning,
    Error,
    Fatal,
    More,
}

impl Category {
    fn ansi_color(self) -> &'static str {
        match self {
            Self::Info => "\x1b[37m",    // white
            Self::Note => "\x1b[36m",    // cyan
            Self::Warning => "\x1b[33m", // yellow
            Self::Error => "\x1b[31m",   // red
            Self::Fatal => "\x1b[41m",   // red background
            Self::More => "\x1b[90m",    // bright black
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Note => "note",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::More => "more",
        }
    }

    fn from_level(level: Level) -> Self {
        match level {
            Level::Error => Self::Error,
            Level::Warn => Self::Warning,
            Level::Info => Self::Info,
            Level::Debug => Self::Note,
            Level::Trace => Self::More,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    /// Milliseconds since the Unix epoch.
    Absolute,
    /// Milliseconds since process start.
    Relative,
}

static PROCESS_START_MS: OnceLock<u64> = OnceLock::new();
static FILTER_LEVEL: AtomicU64 = AtomicU64::new(Level::Info as u64);

fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

pub struct AnsiLogger {
    mode: TimestampMode,
}

impl AnsiLogger {
    pub fn new(mode: TimestampMode) -> Self {
        PROCESS_START_MS.get_or_init(now_ms);
        Self { mode }
    }

    /// Installs this logger as the global `log` sink and sets the
    /// level filter. Intended to be called once from `main`.
    pub fn install(self, level: Level) -> Result<(), log::SetLoggerError> {
        FILTER_LEVEL.store(level as u64, Ordering::Relaxed);
        log::set_max_level(level.to_level_filter());
        log::set_boxed_logger(Box::new(self))
    }

    fn timestamp(&self) -> u64 {
        let now = now_ms();
        match self.mode {
            TimestampMode::Absolute => now,
            TimestampMode::Relative => now.saturating_sub(*PROCESS_START_MS.get().unwrap_or(&now)),
        }
    }
}

impl Log for AnsiLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        (metadata.level() as u64) <= FILTER_LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let category = Category::from_level(record.level());
        let ts = self.timestamp();
        let reset = "\x1b[0m";
        let mut stdout = std::io::stdout();
        let _ = writeln!(
            stdout,
            "{color}[{ts}] [{label}] {target}: {args}{reset}",
            color = category.ansi_color(),
            ts = ts,
            label = category.label(),
            target = record.target(),
            args = record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

/// `log::Level` has no `Fatal` variant, so a fatal diagnostic (always
/// followed by process exit) is written directly rather than through
/// the `log` facade.
pub fn fatal(target: &str, args: std::fmt::Arguments<'_>) {
    let category = Category::Fatal;
    let ts = now_ms();
    let mut stdout = std::io::stdout();
    let _ = writeln!(
        stdout,
        "{color}[{ts}] [{label}] {target}: {args}\x1b[0m",
        color = category.ansi_color(),
        label = category.label(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_labels_cover_all_six() {
        let labels: Vec<&str> = [
            Category::Info,
            Category::Note,
            Category::Warning,
            Category::Error,
            Category::Fatal,
            Category::More,
        ]
        .iter()
        .map(|c| c.label())
        .collect();
        assert_eq!(labels, ["info", "note", "warning", "error", "fatal", "more"]);
    }

    #[test]
    fn category_from_level_maps_debug_to_note() {
        assert_eq!(Category::from_level(Level::Debug), Category::Note);
        assert_eq!(Category::from_level(Level::Trace), Category::More);
    }
}
