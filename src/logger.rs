use anyhow::{ Context, Result };
use chrono::Utc;
use std::{ fmt, fs::{ self, OpenOptions }, path::Path, str::FromStr, sync::Mutex };
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{ format::Writer, time::FormatTime },
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

//  order of log (Debug < Info < Warning < Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    fn as_str(&self) -> &str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other =>
                Err(format!("Invalid log level: {}. Valid options: debug, info, warning, error", other)),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// `[2025-01-31 12:00:00 UTC]`
struct UtcStamp;

impl FormatTime for UtcStamp {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "[{}]", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

/// Install the global subscriber: stderr plus an append-only file at `file_path`.
/// `RUST_LOG`, when set, takes precedence over `min_level`.
pub fn init(file_path: &Path, min_level: LogLevel) -> Result<()> {
    if let Some(dir) = file_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)
        .with_context(|| format!("opening log file {}", file_path.display()))?;

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(min_level).into())
        .from_env_lossy();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(UtcStamp);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_names(true)
        .with_timer(UtcStamp);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing log subscriber")?;

    tracing::info!("logging to {} at level {}", file_path.display(), min_level);
    Ok(())
}
