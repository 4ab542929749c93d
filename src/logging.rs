// Run log: one file next to the output, console mirror for INFO and above

use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Status,
    Warning,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Status => "STATUS",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

struct Logger {
    file: Mutex<File>,
    path: PathBuf,
    debug: bool,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Derive the log path from the output path: the extension is replaced by
/// `.log`, so `clip.mkv` logs to `clip.log`.
pub fn log_path_for(output: &Path) -> PathBuf {
    output.with_extension("log")
}

/// Open the log file. Called once, before any stage runs; messages logged
/// earlier fall back to the console.
pub fn init(output: &Path, debug: bool) -> Result<PathBuf> {
    let path = log_path_for(output);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    let _ = LOGGER.set(Logger {
        file: Mutex::new(file),
        path: path.clone(),
        debug,
    });
    Ok(path)
}

pub fn log_file_path() -> Option<PathBuf> {
    LOGGER.get().map(|l| l.path.clone())
}

pub fn debug_enabled() -> bool {
    LOGGER.get().map(|l| l.debug).unwrap_or(false)
}

/// Write one line: `YYYY-MM-DD HH:MM:SS|LEVEL|[PID] loc|message`.
/// DEBUG goes to the file only; INFO and above also reach the console.
pub fn log(level: Level, loc: &str, message: &str) {
    let line = format!(
        "{}|{}|[{}] {}|{}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        level.tag(),
        std::process::id(),
        loc,
        message
    );

    if let Some(logger) = LOGGER.get() {
        if level > Level::Debug || logger.debug {
            if let Ok(mut file) = logger.file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    if level >= Level::Info {
        match level {
            Level::Warning | Level::Error => eprintln!("{message}"),
            _ => println!("{message}"),
        }
    }
}

/// Final log line of a run. On failure the console is pointed at the log.
pub fn finish(success: bool) {
    if success {
        log(Level::Status, "main", "Program finished");
    } else {
        log(Level::Error, "main", "Program FAILED!");
        if let Some(path) = log_file_path() {
            eprintln!("See {} for details", path.display());
        }
    }
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log(
            $crate::logging::Level::Debug,
            concat!(file!(), ":", line!()),
            &format!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log(
            $crate::logging::Level::Info,
            concat!(file!(), ":", line!()),
            &format!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! log_status {
    ($($arg:tt)*) => {
        $crate::logging::log(
            $crate::logging::Level::Status,
            concat!(file!(), ":", line!()),
            &format!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log(
            $crate::logging::Level::Warning,
            concat!(file!(), ":", line!()),
            &format!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log(
            $crate::logging::Level::Error,
            concat!(file!(), ":", line!()),
            &format!($($arg)*),
        )
    };
}
