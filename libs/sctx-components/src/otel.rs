//! OpenTelemetry tracing and metrics as a component.
//!
//! Builds OTLP exporters feeding a batch `SdkTracerProvider` and a periodic
//! `SdkMeterProvider`, installs them (with the W3C trace-context propagator)
//! globally and keeps a `tracing` layer ready for a later
//! [`crate::LogComponent`] to attach. Each signal can be switched off, as can
//! the whole component.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{MetricExporter, Protocol, SpanExporter, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider, Tracer},
    Resource,
};
use parking_lot::Mutex;
use sctx::{Component, Flag, FlagSet, ServiceContext};
use sctx_bootstrap::logging::OtelLayer;

use crate::{flag_name, ComponentError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExporterKind {
    OtlpGrpc,
    OtlpHttp,
    None,
}

impl FromStr for ExporterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otlp_grpc" | "grpc" => Ok(ExporterKind::OtlpGrpc),
            "otlp_http" | "http" => Ok(ExporterKind::OtlpHttp),
            "none" | "" => Ok(ExporterKind::None),
            other => Err(format!(
                "unknown exporter '{other}', expected otlp_grpc, otlp_http or none"
            )),
        }
    }
}

fn parse_ratio(raw: &str) -> Result<f64, String> {
    let ratio: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("'{raw}' is not a number: {e}"))?;
    if !(0.0..=1.0).contains(&ratio) {
        return Err(format!("{ratio} is outside [0, 1]"));
    }
    Ok(ratio)
}

// OTEL_EXPORTER_OTLP_HEADERS (format: k=v,k2=v2)
fn headers_from_env() -> Option<HashMap<String, String>> {
    let raw = std::env::var("OTEL_EXPORTER_OTLP_HEADERS").ok()?;
    let out: HashMap<String, String> = raw
        .split(',')
        .map(str::trim)
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    (!out.is_empty()).then_some(out)
}

// Where and how every signal is exported.
struct ExportTarget {
    kind: ExporterKind,
    endpoint: String,
    timeout: Duration,
}

impl ExportTarget {
    // Choose transport inside each branch to satisfy the type-state builders.
    fn span_exporter(&self) -> anyhow::Result<SpanExporter> {
        if self.kind == ExporterKind::OtlpHttp {
            let mut b = SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_timeout(self.timeout);
            if !self.endpoint.is_empty() {
                b = b.with_endpoint(self.endpoint.clone());
            }
            if let Some(headers) = headers_from_env() {
                b = b.with_headers(headers);
            }
            b.build().context("failed to build OTLP HTTP span exporter")
        } else {
            let mut b = SpanExporter::builder().with_tonic().with_timeout(self.timeout);
            if !self.endpoint.is_empty() {
                b = b.with_endpoint(self.endpoint.clone());
            }
            b.build().context("failed to build OTLP gRPC span exporter")
        }
    }

    fn metric_exporter(&self) -> anyhow::Result<MetricExporter> {
        if self.kind == ExporterKind::OtlpHttp {
            let mut b = MetricExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_timeout(self.timeout);
            if !self.endpoint.is_empty() {
                b = b.with_endpoint(self.endpoint.clone());
            }
            if let Some(headers) = headers_from_env() {
                b = b.with_headers(headers);
            }
            b.build().context("failed to build OTLP HTTP metric exporter")
        } else {
            let mut b = MetricExporter::builder().with_tonic().with_timeout(self.timeout);
            if !self.endpoint.is_empty() {
                b = b.with_endpoint(self.endpoint.clone());
            }
            b.build().context("failed to build OTLP gRPC metric exporter")
        }
    }
}

pub struct OtelComponent {
    id: String,
    default_service_name: String,
    default_service_version: String,
    is_enabled: Flag<bool>,
    service_name: Flag<String>,
    service_version: Flag<String>,
    exporter: Flag<String>,
    endpoint: Flag<String>,
    timeout: Flag<Duration>,
    sample_ratio: Flag<String>,
    is_enabled_trace: Flag<bool>,
    is_enabled_metric: Flag<bool>,
    metric_interval: Flag<Duration>,
    tracer_provider: Mutex<Option<SdkTracerProvider>>,
    meter_provider: Mutex<Option<SdkMeterProvider>>,
    tracer: Mutex<Option<Tracer>>,
    layer: Mutex<Option<OtelLayer>>,
}

impl OtelComponent {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            default_service_name: String::new(),
            default_service_version: String::new(),
            is_enabled: Flag::new(flag_name(&id, "is-enabled")),
            service_name: Flag::new(flag_name(&id, "service-name")),
            service_version: Flag::new(flag_name(&id, "service-version")),
            exporter: Flag::new(flag_name(&id, "exporter")),
            endpoint: Flag::new(flag_name(&id, "endpoint")),
            timeout: Flag::new(flag_name(&id, "timeout")),
            sample_ratio: Flag::new(flag_name(&id, "sample-ratio")),
            is_enabled_trace: Flag::new(flag_name(&id, "is-enabled-trace")),
            is_enabled_metric: Flag::new(flag_name(&id, "is-enabled-metric")),
            metric_interval: Flag::new(flag_name(&id, "metric-interval")),
            tracer_provider: Mutex::new(None),
            meter_provider: Mutex::new(None),
            tracer: Mutex::new(None),
            layer: Mutex::new(None),
            id,
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.default_service_name = name.into();
        self
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.default_service_version = version.into();
        self
    }

    /// Tracer for manual spans; `None` when tracing is off.
    pub fn tracer(&self) -> Option<Tracer> {
        self.tracer.lock().clone()
    }

    /// Meter provider for instruments; `None` when metrics are off.
    pub fn meter_provider(&self) -> Option<SdkMeterProvider> {
        self.meter_provider.lock().clone()
    }

    /// Hand the `tracing` layer to the subscriber; only the first call gets it.
    pub fn take_layer(&self) -> Option<OtelLayer> {
        self.layer.lock().take()
    }

    fn install_traces(
        &self,
        target: &ExportTarget,
        resource: Resource,
        ratio: f64,
        service_name: &str,
    ) -> anyhow::Result<()> {
        let sampler = if ratio >= 1.0 {
            Sampler::ParentBased(Box::new(Sampler::AlwaysOn))
        } else {
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio)))
        };
        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(target.span_exporter()?)
            .with_sampler(sampler)
            .with_resource(resource)
            .build();
        global::set_tracer_provider(provider.clone());

        let tracer = provider.tracer(service_name.to_string());
        *self.layer.lock() = Some(tracing_opentelemetry::OpenTelemetryLayer::new(tracer.clone()));
        *self.tracer.lock() = Some(tracer);
        *self.tracer_provider.lock() = Some(provider);
        Ok(())
    }

    fn install_metrics(
        &self,
        target: &ExportTarget,
        resource: Resource,
        interval: Duration,
    ) -> anyhow::Result<()> {
        let reader = PeriodicReader::builder(target.metric_exporter()?)
            .with_interval(interval)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build();
        global::set_meter_provider(provider.clone());
        *self.meter_provider.lock() = Some(provider);
        Ok(())
    }
}

#[async_trait]
impl Component for OtelComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn register_config(&mut self, flags: &mut FlagSet) {
        flags.register(&self.is_enabled, true, "enable OpenTelemetry");
        flags.register(
            &self.service_name,
            self.default_service_name.clone(),
            "service.name resource attribute; required",
        );
        flags.register(
            &self.service_version,
            self.default_service_version.clone(),
            "service.version resource attribute, e.g. 1.0.0; required",
        );
        flags.register(
            &self.exporter,
            "otlp_grpc".to_string(),
            "exporter: otlp_grpc, otlp_http or none",
        );
        flags.register(&self.endpoint, String::new(), "collector endpoint; empty uses the exporter default");
        flags.register(&self.timeout, Duration::from_secs(10), "export timeout");
        flags.register(&self.sample_ratio, "1.0".to_string(), "fraction of root traces sampled");
        flags.register(&self.is_enabled_trace, true, "export traces");
        flags.register(&self.is_enabled_metric, true, "export metrics");
        flags.register(&self.metric_interval, Duration::from_secs(60), "metric export interval");
    }

    async fn activate(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let cfg = ctx.config();
        if !cfg.get(&self.is_enabled)? {
            tracing::info!(component = %self.id, "OpenTelemetry disabled");
            return Ok(());
        }

        let service_name = cfg.get(&self.service_name)?;
        if service_name.trim().is_empty() {
            return Err(ComponentError::invalid(&self.service_name, "service name is empty").into());
        }
        let service_version = cfg.get(&self.service_version)?;
        if service_version.trim().is_empty() {
            return Err(ComponentError::invalid(&self.service_version, "service version is empty").into());
        }
        let kind: ExporterKind = cfg
            .get(&self.exporter)?
            .parse()
            .map_err(|reason| ComponentError::invalid(&self.exporter, reason))?;
        let ratio = parse_ratio(&cfg.get(&self.sample_ratio)?)
            .map_err(|reason| ComponentError::invalid(&self.sample_ratio, reason))?;
        let interval = cfg.get(&self.metric_interval)?;
        if interval.is_zero() {
            return Err(ComponentError::invalid(&self.metric_interval, "must be positive").into());
        }
        let traces = cfg.get(&self.is_enabled_trace)?;
        let metrics = cfg.get(&self.is_enabled_metric)?;
        let target = ExportTarget {
            kind,
            endpoint: cfg.get(&self.endpoint)?,
            timeout: cfg.get(&self.timeout)?,
        };

        if kind == ExporterKind::None {
            tracing::info!(component = %self.id, "Telemetry export disabled");
            return Ok(());
        }

        global::set_text_map_propagator(TraceContextPropagator::new());
        let resource = Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", service_name.clone()),
                KeyValue::new("service.version", service_version.clone()),
            ])
            .build();

        if traces {
            self.install_traces(&target, resource.clone(), ratio, &service_name)?;
        }
        if metrics {
            self.install_metrics(&target, resource, interval)?;
        }

        tracing::info!(
            component = %self.id,
            service = %service_name,
            version = %service_version,
            exporter = ?kind,
            endpoint = %target.endpoint,
            traces,
            metrics,
            ratio,
            "Telemetry providers installed"
        );
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.layer.lock().take();
        self.tracer.lock().take();
        let tracer_provider = self.tracer_provider.lock().take();
        let meter_provider = self.meter_provider.lock().take();
        if tracer_provider.is_none() && meter_provider.is_none() {
            return Ok(());
        }

        // Flushes pending batches; blocks, so keep it off the async workers.
        let (traces, metrics) = tokio::task::spawn_blocking(move || {
            (
                tracer_provider.map(|p| p.shutdown()).transpose(),
                meter_provider.map(|p| p.shutdown()).transpose(),
            )
        })
        .await
        .context("telemetry shutdown task failed")?;
        traces.context("tracer provider shutdown failed")?;
        metrics.context("meter provider shutdown failed")?;
        tracing::info!(component = %self.id, "Telemetry providers shut down");
        Ok(())
    }
}
