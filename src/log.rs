//! File logger for specflow runs.
//!
//! Lines go to `<state dir>/specflow.log` (or `~/.specflow/specflow.log`)
//! and carry the active invocation scope, `<spec-set>@<run>`, once the
//! orchestrator has set one:
//!
//! ```text
//! [14:02:11.532] [INFO] [app@3f2a9c1e] spec core complete after 3 engine run(s)
//! ```
//!
//! The threshold is INFO by default, DEBUG with `--debug` or
//! `SPECFLOW_DEBUG=1`, and `SPECFLOW_LOG=<level>` pins it explicitly.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, RwLock};

static SINK: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static SCOPE: RwLock<Option<String>> = RwLock::new(None);

pub const LOG_FILE_NAME: &str = "specflow.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Threshold from the `--debug` flag and the environment.
pub fn resolve_level(debug: bool) -> LogLevel {
    if let Ok(Ok(level)) = std::env::var("SPECFLOW_LOG").map(|v| v.parse::<LogLevel>()) {
        return level;
    }
    if debug || env_flag("SPECFLOW_DEBUG") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Start logging into `dir`, truncating any previous log there.
///
/// Without `dir` the log lives in `~/.specflow`. Only the first call picks
/// the file; later calls just adjust the threshold.
pub fn init(debug: bool, dir: Option<&Path>) {
    set_level(resolve_level(debug));

    let dir = match dir {
        Some(dir) => Some(dir.to_path_buf()),
        None => dirs::home_dir().map(|h| h.join(".specflow")),
    };
    let Some(dir) = dir else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join(LOG_FILE_NAME);
    if SINK.get().is_none() && std::fs::write(&path, "").is_ok() {
        let _ = SINK.set(path);
    }
}

pub fn set_level(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(THRESHOLD.load(Ordering::Relaxed))
}

/// Tag subsequent lines with an invocation scope, or clear it.
pub fn set_scope(scope: Option<String>) {
    if let Ok(mut current) = SCOPE.write() {
        *current = scope;
    }
}

fn scope() -> Option<String> {
    SCOPE.read().ok().and_then(|s| s.clone())
}

pub fn format_line(timestamp: &str, level: LogLevel, scope: Option<&str>, msg: &str) -> String {
    match scope {
        Some(scope) => format!("[{}] [{}] [{}] {}", timestamp, level.as_str(), scope, msg),
        None => format!("[{}] [{}] {}", timestamp, level.as_str(), msg),
    }
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }
    let Some(path) = SINK.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
        let line = format_line(&timestamp, level, scope().as_deref(), msg);
        let _ = writeln!(file, "{}", line);
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// INFO line.
#[macro_export]
macro_rules! sflog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! sflog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! sflog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// DEBUG line; dropped unless debug logging is on.
#[macro_export]
macro_rules! sflog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// TRACE line, for prompts and raw collaborator output.
#[macro_export]
macro_rules! sflog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
