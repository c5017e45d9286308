use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::Context as _;
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

// ========== OTEL-agnostic layer type (compiles with/without the feature) ==========
#[cfg(feature = "otel")]
pub type OtelLayer =
    tracing_opentelemetry::OpenTelemetryLayer<Registry, opentelemetry_sdk::trace::Tracer>;
#[cfg(not(feature = "otel"))]
pub type OtelLayer = ();

// Keep a guard for non-blocking console to avoid being dropped.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

// ================= options =================

/// Console/file record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "unknown log format '{other}', expected 'text' or 'json'"
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Everything [`init_logging`] needs to install the process subscriber.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Default level; `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
    /// Optional JSON file sink with size-based rotation.
    pub file: Option<PathBuf>,
    pub max_size_mb: u64,
    /// Keep at most this many rotated files; otherwise prune by age.
    pub max_backups: Option<usize>,
    pub max_age_days: u32,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            max_size_mb: 100,
            max_backups: None,
            max_age_days: 1,
        }
    }
}

// ================= level helpers =================

/// Parse a level name (`trace`..`error`, `off`/`none`).
pub fn parse_level(s: &str) -> Result<LevelFilter, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" | "none" => Ok(LevelFilter::OFF),
        other => Err(format!("unknown log level '{other}'")),
    }
}

// ================= rotating writer for files =================

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl<'a> fmt::MakeWriter<'a> for RotWriter {
    type Writer = RotWriterHandle;
    fn make_writer(&'a self) -> Self::Writer {
        RotWriterHandle(self.0.clone())
    }
}

struct RotWriterHandle(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl Write for RotWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

fn open_rotating_writer(
    log_path: &Path,
    max_bytes: usize,
    max_backups: Option<usize>,
    max_age_days: u32,
) -> std::io::Result<RotWriter> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Prefer MaxFiles if provided, else Age
    let limit = match max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(i64::from(max_age_days))),
    };

    let rot = FileRotate::new(
        log_path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );

    Ok(RotWriter(Arc::new(Mutex::new(rot))))
}

// ================= public init =================

/// Install the process-wide tracing subscriber.
///
/// Layers, in order: the OpenTelemetry layer (bound to `Registry`, so it goes
/// first), an `EnvFilter` (`RUST_LOG` or `opts.level`), the console layer on
/// non-blocking stderr, and the optional JSON file layer.
///
/// Returns `Ok(false)` when a global subscriber is already installed; the
/// existing one is left untouched.
pub fn init_logging(opts: &LoggingOptions, otel_layer: Option<OtelLayer>) -> anyhow::Result<bool> {
    let level = parse_level(&opts.level).map_err(anyhow::Error::msg)?;

    if tracing::dispatcher::has_been_set() {
        return Ok(false);
    }

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // Console writer (non-blocking stderr)
    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);
    let ansi = std::io::stderr().is_terminal();

    let console_text = (opts.format == LogFormat::Text).then(|| {
        fmt::layer()
            .with_writer(nb_stderr.clone())
            .with_ansi(ansi)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });
    let console_json = (opts.format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_writer(nb_stderr.clone())
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
    });

    let file_layer = match &opts.file {
        Some(path) => {
            let max_bytes = usize::try_from(opts.max_size_mb.saturating_mul(1024 * 1024))
                .unwrap_or(usize::MAX);
            let writer =
                open_rotating_writer(path, max_bytes, opts.max_backups, opts.max_age_days)
                    .with_context(|| format!("failed to open log file '{}'", path.display()))?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_writer(writer),
            )
        }
        None => None,
    };

    let subscriber = {
        let base = Registry::default();

        #[cfg(feature = "otel")]
        let base = base.with(otel_layer);
        #[cfg(not(feature = "otel"))]
        let base = {
            let _ = otel_layer;
            base
        };

        base.with(filter)
            .with(console_text)
            .with(console_json)
            .with(file_layer)
    };

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return Ok(false);
    }

    // Bridge `log` records from dependencies into tracing.
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!(error = %e, "log bridge already installed");
    }

    tracing::debug!(level = %level, format = %opts.format, "Logging initialized");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level("DEBUG").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level(" warning ").unwrap(), LevelFilter::WARN);
        assert_eq!(parse_level("none").unwrap(), LevelFilter::OFF);
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn parses_formats() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn rotating_writer_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("svc.log");

        let writer = open_rotating_writer(&path, 1024 * 1024, Some(2), 1).unwrap();
        let mut handle = writer.make_writer();
        handle.write_all(b"{\"msg\":\"hello\"}\n").unwrap();
        handle.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("hello"));
    }

    #[test]
    fn bad_level_is_rejected_before_install() {
        let opts = LoggingOptions {
            level: "loud".into(),
            ..Default::default()
        };
        let err = init_logging(&opts, None).unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn second_install_is_reported() {
        let opts = LoggingOptions::default();
        let _ = init_logging(&opts, None).unwrap();
        assert!(!init_logging(&opts, None).unwrap());
    }
}
