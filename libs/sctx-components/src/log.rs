//! Process logger as a component: installs the global tracing subscriber.
//!
//! Register it first so every later component logs through it. When built
//! with `with_tracing_from(key)` it must come after the tracing component
//! named by `key`, whose OpenTelemetry layer it attaches.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use sctx::{Component, Flag, FlagSet, ServiceContext};
use sctx_bootstrap::logging::{init_logging, parse_level, LogFormat, LoggingOptions, OtelLayer};
use tracing::level_filters::LevelFilter;

use crate::{flag_name, ComponentError};

#[derive(Debug)]
struct LoggerState {
    level: LevelFilter,
    format: LogFormat,
    installed: bool,
}

pub struct LogComponent {
    id: String,
    default_level: String,
    tracing_from: Option<String>,
    level: Flag<String>,
    format: Flag<String>,
    file: Flag<String>,
    file_max_size_mb: Flag<u64>,
    state: ArcSwapOption<LoggerState>,
}

impl LogComponent {
    /// Logger registered under the key `log`.
    pub fn new() -> Self {
        Self::with_id("log")
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            level: Flag::new(flag_name(&id, "level")),
            format: Flag::new(flag_name(&id, "format")),
            file: Flag::new(flag_name(&id, "file")),
            file_max_size_mb: Flag::new(flag_name(&id, "file-max-size-mb")),
            default_level: "debug".to_string(),
            tracing_from: None,
            state: ArcSwapOption::empty(),
            id,
        }
    }

    pub fn with_default_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = level.into();
        self
    }

    /// Attach the OpenTelemetry layer of the tracing component `key`.
    pub fn with_tracing_from(mut self, key: impl Into<String>) -> Self {
        self.tracing_from = Some(key.into());
        self
    }

    /// Effective level once activated.
    pub fn level(&self) -> Option<LevelFilter> {
        self.state.load().as_ref().map(|s| s.level)
    }

    pub fn format(&self) -> Option<LogFormat> {
        self.state.load().as_ref().map(|s| s.format)
    }

    /// Whether this component installed the global subscriber (`false` when
    /// another one was already in place).
    pub fn installed(&self) -> bool {
        self.state.load().as_ref().is_some_and(|s| s.installed)
    }

    #[cfg(feature = "otel")]
    fn otel_layer(&self, ctx: &ServiceContext) -> anyhow::Result<Option<OtelLayer>> {
        let Some(key) = &self.tracing_from else {
            return Ok(None);
        };
        let otel = ctx.lookup::<crate::OtelComponent>(key)?;
        Ok(otel.take_layer())
    }

    #[cfg(not(feature = "otel"))]
    fn otel_layer(&self, _ctx: &ServiceContext) -> anyhow::Result<Option<OtelLayer>> {
        if let Some(key) = &self.tracing_from {
            tracing::warn!(
                component = %self.id,
                tracer = %key,
                "Built without the `otel` feature; tracing layer not attached"
            );
        }
        Ok(None)
    }
}

impl Default for LogComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for LogComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn register_config(&mut self, flags: &mut FlagSet) {
        flags.register(
            &self.level,
            self.default_level.clone(),
            "log level: trace, debug, info, warn, error or off",
        );
        flags.register(&self.format, "text".to_string(), "log format: text or json");
        flags.register(&self.file, String::new(), "JSON log file path; empty disables the file sink");
        flags.register(&self.file_max_size_mb, 100, "rotate the log file after this many megabytes");
    }

    async fn activate(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let cfg = ctx.config();

        let level_name = cfg.get(&self.level)?;
        let level = parse_level(&level_name)
            .map_err(|reason| ComponentError::invalid(&self.level, reason))?;
        let format = cfg
            .get(&self.format)?
            .parse::<LogFormat>()
            .map_err(|reason| ComponentError::invalid(&self.format, reason))?;
        let file = cfg.get(&self.file)?;

        let opts = LoggingOptions {
            level: level_name,
            format,
            file: Some(file.trim())
                .filter(|f| !f.is_empty())
                .map(PathBuf::from),
            max_size_mb: cfg.get(&self.file_max_size_mb)?,
            ..Default::default()
        };

        let otel = self.otel_layer(ctx)?;
        let installed = init_logging(&opts, otel)?;
        if installed {
            tracing::info!(component = %self.id, %level, %format, "Logger installed");
        } else {
            tracing::warn!(component = %self.id, "A global subscriber is already installed; keeping it");
        }

        self.state.store(Some(Arc::new(LoggerState {
            level,
            format,
            installed,
        })));
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        // The global subscriber lives for the rest of the process.
        tracing::debug!(component = %self.id, "Logger shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declares_prefixed_flags() {
        let ctx = ServiceContext::builder()
            .with_name("svc")
            .with_component(LogComponent::new())
            .build()
            .unwrap();

        let rendered = ctx.env_template().render();
        assert_eq!(
            rendered.lines().collect::<Vec<_>>(),
            vec![
                "LOG_LEVEL=debug",
                "LOG_FORMAT=text",
                "LOG_FILE=",
                "LOG_FILE_MAX_SIZE_MB=100",
            ]
        );
    }

    #[test]
    fn custom_id_and_default_level() {
        let ctx = ServiceContext::builder()
            .with_component(LogComponent::with_id("audit").with_default_level("warn"))
            .build()
            .unwrap();
        let spec = ctx.config().lookup("audit-level").unwrap();
        assert_eq!(spec.default_value().to_string(), "warn");
    }

    #[tokio::test]
    async fn rejects_unknown_format() {
        let mut ctx = ServiceContext::builder()
            .with_name("svc")
            .with_component(LogComponent::with_id("logfmt"))
            .build()
            .unwrap();
        ctx.parse_from(["svc", "--logfmt-format", "xml"]).unwrap();

        let err = ctx.load().await.unwrap_err();
        assert!(matches!(err, sctx::ContextError::Activate { ref component, .. } if component == "logfmt"));
        assert_eq!(ctx.phase(), sctx::Phase::Failed);
    }

    #[tokio::test]
    async fn records_effective_level() {
        let mut ctx = ServiceContext::builder()
            .with_name("svc")
            .with_component(LogComponent::with_id("loglvl"))
            .build()
            .unwrap();
        ctx.parse_from(["svc", "--loglvl-level", "warn", "--loglvl-format", "json"])
            .unwrap();
        ctx.load().await.unwrap();

        let log = ctx.must_get::<LogComponent>("loglvl");
        assert_eq!(log.level(), Some(LevelFilter::WARN));
        assert_eq!(log.format(), Some(LogFormat::Json));

        ctx.stop().await.unwrap();
    }
}
