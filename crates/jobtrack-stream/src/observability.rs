use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_JSON_LOG_FILE: &str = "jobtrack.logs.jsonl";

static INIT: OnceCell<()> = OnceCell::new();

/// Where log records go.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LogSink {
    /// Compact lines on stderr, keeping stdout free for streamed output.
    Stderr,
    /// JSONL records appended to one file.
    JsonFile { dir: PathBuf, file_name: String },
}

/// Logging settings resolved from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LogSettings {
    enabled: bool,
    filter: String,
    sink: LogSink,
}

impl LogSettings {
    fn resolve(var: impl Fn(&str) -> Option<String>, default_level: &str) -> Self {
        let enabled = var("JOBTRACK_OBSERVABILITY_ENABLED")
            .and_then(|value| parse_flag(&value))
            .unwrap_or(true);
        let filter = ["JOBTRACK_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(&var)
            .map(|raw| raw.trim().to_string())
            .find(|directive| !directive.is_empty() && EnvFilter::try_new(directive).is_ok())
            .unwrap_or_else(|| default_level.to_string());
        let sink = match var("JOBTRACK_JSON_LOG_PATH") {
            Some(raw) if !raw.trim().is_empty() => json_sink(Path::new(raw.trim())),
            _ => LogSink::Stderr,
        };
        Self {
            enabled,
            filter,
            sink,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn json_sink(path: &Path) -> LogSink {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_JSON_LOG_FILE)
        .to_string();
    LogSink::JsonFile { dir, file_name }
}

/// Installs the global tracing subscriber. Only the first call has an effect.
///
/// Environment variables:
/// - `JOBTRACK_OBSERVABILITY_ENABLED`: set to `0`/`false`/`off` to install nothing.
/// - `JOBTRACK_LOG_LEVEL`, then `RUST_LOG`: filter directives; the first one that
///   parses wins, otherwise `default_level` applies.
/// - `JOBTRACK_JSON_LOG_PATH`: write JSONL records to this file instead of stderr.
pub fn init_observability(default_level: &str) {
    INIT.get_or_init(|| {
        let settings = LogSettings::resolve(|key| std::env::var(key).ok(), default_level);
        if !settings.enabled {
            return;
        }
        let filter =
            EnvFilter::try_new(&settings.filter).unwrap_or_else(|_| EnvFilter::new("warn"));
        let installed = match &settings.sink {
            LogSink::Stderr => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogSink::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(dir);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .json()
                            .with_current_span(true)
                            .with_writer(tracing_appender::rolling::never(dir, file_name)),
                    )
                    .try_init()
            }
        };
        if installed.is_ok() {
            tracing::debug!(filter = %settings.filter, sink = ?settings.sink, "logging initialised");
        }
    });
}
