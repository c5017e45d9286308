//! Inbound HTTP server: binds during activation, serves an axum router on
//! demand and drains gracefully on shutdown.
//!
//! The socket is bound in `activate` so a taken port fails the load (and rolls
//! back earlier components) instead of surfacing after startup. Routes are
//! handed over later through [`HttpServerComponent::serve`], typically once the
//! whole context is loaded and the handlers can capture their dependencies.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::Router;
use parking_lot::Mutex;
use sctx::{Component, Flag, FlagSet, ServiceContext};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{flag_name, non_negative, ComponentError};

#[derive(Default)]
struct ServerState {
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
    shutdown_timeout: Duration,
}

pub struct HttpServerComponent {
    id: String,
    host: Flag<String>,
    port: Flag<i64>,
    shutdown_timeout: Flag<Duration>,
    default_port: i64,
    state: Mutex<ServerState>,
}

impl HttpServerComponent {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            host: Flag::new(flag_name(&id, "host")),
            port: Flag::new(flag_name(&id, "port")),
            shutdown_timeout: Flag::new(flag_name(&id, "shutdown-timeout")),
            default_port: 3000,
            state: Mutex::new(ServerState::default()),
            id,
        }
    }

    /// Default for the `<id>-port` flag; `0` picks a free port.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = i64::from(port);
        self
    }

    /// Bound address once activated.
    pub fn local_addr(&self) -> Result<SocketAddr, ComponentError> {
        self.state
            .lock()
            .local_addr
            .ok_or_else(|| ComponentError::not_active(&self.id))
    }

    pub fn port(&self) -> Result<u16, ComponentError> {
        self.local_addr().map(|addr| addr.port())
    }

    pub fn is_serving(&self) -> bool {
        self.state
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start serving `router` on the bound socket in a background task.
    ///
    /// Must be called from within a Tokio runtime, at most once per activation.
    pub fn serve(&self, router: Router) -> Result<(), ComponentError> {
        let mut state = self.state.lock();
        if state.task.is_some() {
            return Err(ComponentError::AlreadyServing {
                component: self.id.clone(),
            });
        }
        let cancel = state
            .cancel
            .clone()
            .ok_or_else(|| ComponentError::not_active(&self.id))?;
        let listener = state
            .listener
            .take()
            .ok_or_else(|| ComponentError::not_active(&self.id))?;

        let id = self.id.clone();
        let shutdown = async move {
            cancel.cancelled().await;
            tracing::info!(component = %id, "HTTP server shutting down gracefully");
        };

        tracing::info!(component = %self.id, addr = ?state.local_addr, "HTTP server serving");
        state.task = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(anyhow::Error::from)
        }));
        Ok(())
    }
}

#[async_trait]
impl Component for HttpServerComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn register_config(&mut self, flags: &mut FlagSet) {
        flags.register(&self.host, "0.0.0.0".to_string(), "listen address");
        flags.register(&self.port, self.default_port, "listen port; 0 picks a free port");
        flags.register(
            &self.shutdown_timeout,
            Duration::from_secs(30),
            "how long in-flight requests may drain on shutdown",
        );
    }

    async fn activate(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let cfg = ctx.config();
        let host = cfg.get(&self.host)?;
        let port: u16 = non_negative(&self.port, cfg.get(&self.port)?)?;
        let shutdown_timeout = cfg.get(&self.shutdown_timeout)?;

        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .with_context(|| format!("failed to bind {host}:{port}"))?;
        let local_addr = listener.local_addr()?;
        tracing::info!(component = %self.id, %local_addr, "HTTP server bound");

        *self.state.lock() = ServerState {
            listener: Some(listener),
            local_addr: Some(local_addr),
            cancel: Some(CancellationToken::new()),
            task: None,
            shutdown_timeout,
        };
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let (cancel, task, timeout) = {
            let mut state = self.state.lock();
            state.listener = None;
            state.local_addr = None;
            (state.cancel.take(), state.task.take(), state.shutdown_timeout)
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let Some(task) = task else {
            return Ok(());
        };

        let abort = task.abort_handle();
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => {
                result.context("HTTP server terminated with an error")?;
                tracing::info!(component = %self.id, "HTTP server stopped");
                Ok(())
            }
            Ok(Err(join)) => Err(anyhow::Error::from(join).context("HTTP server task failed")),
            Err(_) => {
                abort.abort();
                anyhow::bail!("HTTP server did not drain within {timeout:?}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    async fn loaded(id: &str) -> ServiceContext {
        let mut ctx = ServiceContext::builder()
            .with_name("svc")
            .with_component(HttpServerComponent::new(id).with_default_port(0))
            .build()
            .unwrap();
        let host = format!("--{id}-host=127.0.0.1");
        ctx.parse_from(["svc", host.as_str()]).unwrap();
        ctx.load().await.unwrap();
        ctx
    }

    #[test]
    fn declares_listen_flags() {
        let ctx = ServiceContext::builder()
            .with_component(HttpServerComponent::new("web"))
            .build()
            .unwrap();
        assert_eq!(
            ctx.env_template().render(),
            "WEB_HOST=0.0.0.0\nWEB_PORT=3000\nWEB_SHUTDOWN_TIMEOUT=30s\n"
        );
    }

    #[tokio::test]
    async fn binds_ephemeral_port_during_activation() {
        let ctx = loaded("bindtest").await;
        let server = ctx.must_get::<HttpServerComponent>("bindtest");
        assert_ne!(server.port().unwrap(), 0);
        assert!(!server.is_serving());

        ctx.stop().await.unwrap();
        assert!(server.local_addr().is_err());
    }

    #[tokio::test]
    async fn serve_twice_is_rejected() {
        let ctx = loaded("twice").await;
        let server = ctx.must_get::<HttpServerComponent>("twice");

        server.serve(Router::new().route("/", get(|| async { "ok" }))).unwrap();
        assert!(matches!(
            server.serve(Router::new()),
            Err(ComponentError::AlreadyServing { .. })
        ));

        ctx.stop().await.unwrap();
        assert!(!server.is_serving());
        // Idempotent once drained.
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn serve_before_activation_fails() {
        let server = HttpServerComponent::new("idle");
        assert!(matches!(
            server.serve(Router::new()),
            Err(ComponentError::NotActive { .. })
        ));
    }
}
