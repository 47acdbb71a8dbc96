use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "stockchat.logs.jsonl";
const DEFAULT_FILTER: &str = "info";

/// Where log lines go once observability is initialized.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LogSink {
    Disabled,
    /// Compact human-readable lines on stderr.
    Console,
    /// JSONL appended to `dir/file`.
    JsonFile { dir: PathBuf, file: String },
}

/// Logging setup read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LogSettings {
    sink: LogSink,
    /// Directive string for [`EnvFilter`]; falls back to `info` if it does not parse.
    filter: String,
}

impl LogSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let enabled = non_empty("STOCKCHAT_OBSERVABILITY_ENABLED")
            .or_else(|| non_empty("STOCKCHAT_OBSERVABILITY"))
            .and_then(|flag| flag_value(&flag))
            .unwrap_or(true);
        let sink = if !enabled {
            LogSink::Disabled
        } else if let Some(path) = non_empty("STOCKCHAT_JSON_LOG_PATH") {
            json_file(Path::new(path.trim()))
        } else {
            LogSink::Console
        };
        let filter = non_empty("STOCKCHAT_LOG_LEVEL")
            .or_else(|| non_empty("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        Self { sink, filter }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

fn flag_value(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn json_file(path: &Path) -> LogSink {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let file = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    LogSink::JsonFile { dir, file }
}

/// Initialize observability logging once per process.
///
/// Environment variables:
/// - `STOCKCHAT_OBSERVABILITY_ENABLED` / `STOCKCHAT_OBSERVABILITY`: enable/disable flag (default enabled).
/// - `STOCKCHAT_LOG_LEVEL`, then `RUST_LOG`: filter directives (default `info`).
/// - `STOCKCHAT_JSON_LOG_PATH`: JSONL log file. Without it, logs go to stderr
///   so stdout stays free for the streamed answer.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let settings = LogSettings::from_lookup(|key| std::env::var(key).ok());
        let (json, console) = match &settings.sink {
            LogSink::Disabled => return,
            LogSink::JsonFile { dir, file } => {
                let _ = std::fs::create_dir_all(dir);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(tracing_appender::rolling::never(dir, file));
                (Some(layer), None)
            }
            LogSink::Console => {
                let layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                (None, Some(layer))
            }
        };
        let _ = tracing_subscriber::registry()
            .with(settings.env_filter())
            .with(json)
            .with(console)
            .try_init();
    });
}
