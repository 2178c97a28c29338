//! Logging bootstrap for fieldnode services
//!
//! Console output with bracketed levels and an optional daily-rolling file.

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use errors::{NodeError, NodeResult};
use parking_lot::Mutex;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Boot count: 1`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking file writer alive for the whole process
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix and the default debug target
    pub service_name: String,
    /// Directory for rolling log files
    pub log_dir: PathBuf,
    /// Filter used when `RUST_LOG` is unset; `None` means `info,<service>=debug`
    pub level: Option<String>,
    /// Write a daily-rolling log file in addition to the console
    pub enable_file: bool,
    /// JSON lines in the log file instead of the bracketed text format
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "fieldnode".to_string(),
            log_dir: PathBuf::from("logs"),
            level: None,
            enable_file: false,
            enable_json: false,
        }
    }
}

impl LogConfig {
    /// Filter string applied at startup
    ///
    /// Priority: `RUST_LOG` > configured level > `info,<service>=debug`
    pub fn filter_directive(&self) -> String {
        if let Ok(env_str) = std::env::var("RUST_LOG") {
            if !env_str.trim().is_empty() {
                return env_str;
            }
        }
        match &self.level {
            Some(level) if !level.trim().is_empty() => level.clone(),
            _ => format!("info,{}=debug", self.service_name.replace('-', "_")),
        }
    }
}

/// Initialize logging system with configuration
///
/// Fails if a global subscriber is already installed.
pub fn init_with_config(config: LogConfig) -> NodeResult<()> {
    let filter_str = config.filter_directive();
    let env_filter = EnvFilter::try_new(&filter_str)
        .map_err(|e| NodeError::Configuration(format!("Invalid log filter '{}': {}", filter_str, e)))?;

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(
            &config.log_dir,
            format!("{}.log", config.service_name),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        GUARDS
            .get_or_init(|| Mutex::new(Vec::new()))
            .lock()
            .push(guard);

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_level(true)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| NodeError::Configuration(format!("Logging already initialized: {}", e)))?;

    tracing::info!(
        "Logging: {} @ {:?}, filter {}",
        config.service_name,
        config.log_dir,
        filter_str
    );
    Ok(())
}
