//! Shared outbound HTTP client with pooled connections, plus request helpers
//! that read the whole response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use sctx::{Component, Flag, FlagSet, ServiceContext};
use serde::de::DeserializeOwned;

use crate::{flag_name, non_negative, ComponentError};

/// Per-request options for [`HttpClientComponent::make_request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub body: Option<Vec<u8>>,
    pub headers: HeaderMap,
    /// Replaces the client-wide timeout for this request.
    pub timeout: Option<Duration>,
}

/// A response whose body has been read in full.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone)]
struct ClientSettings {
    timeout: Duration,
    max_idle: usize,
    idle_timeout: Duration,
    user_agent: String,
}

impl ClientSettings {
    fn builder(&self) -> reqwest::ClientBuilder {
        let builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(self.max_idle)
            .pool_idle_timeout(self.idle_timeout);
        if self.user_agent.is_empty() {
            builder
        } else {
            builder.user_agent(self.user_agent.clone())
        }
    }
}

struct ClientState {
    client: reqwest::Client,
    settings: ClientSettings,
}

pub struct HttpClientComponent {
    id: String,
    timeout: Flag<Duration>,
    max_idle_conn: Flag<i64>,
    idle_conn_timeout: Flag<Duration>,
    user_agent: Flag<String>,
    state: ArcSwapOption<ClientState>,
}

impl HttpClientComponent {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            timeout: Flag::new(flag_name(&id, "timeout")),
            max_idle_conn: Flag::new(flag_name(&id, "max-idle-conn")),
            idle_conn_timeout: Flag::new(flag_name(&id, "idle-conn-timeout")),
            user_agent: Flag::new(flag_name(&id, "user-agent")),
            state: ArcSwapOption::empty(),
            id,
        }
    }

    fn state(&self) -> Result<Arc<ClientState>, ComponentError> {
        self.state
            .load_full()
            .ok_or_else(|| ComponentError::not_active(&self.id))
    }

    /// The pooled client; clones share the pool.
    pub fn client(&self) -> Result<reqwest::Client, ComponentError> {
        self.state().map(|s| s.client.clone())
    }

    /// Send one request through the pooled client and read the whole body.
    ///
    /// Non-success statuses are returned, not turned into errors.
    pub async fn make_request(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions,
    ) -> anyhow::Result<HttpResponse> {
        let client = self.client()?;
        self.send(&client, method, url, opts).await
    }

    /// Like [`HttpClientComponent::make_request`], through a proxy. Uses a
    /// one-off client with the same settings, so the shared pool stays direct.
    pub async fn make_request_with_proxy(
        &self,
        method: Method,
        url: &str,
        proxy: &str,
        opts: RequestOptions,
    ) -> anyhow::Result<HttpResponse> {
        let state = self.state()?;
        let proxy = reqwest::Proxy::all(proxy).with_context(|| format!("invalid proxy URL '{proxy}'"))?;
        let client = state
            .settings
            .builder()
            .proxy(proxy)
            .build()
            .context("failed to build proxied HTTP client")?;
        self.send(&client, method, url, opts).await
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        method: Method,
        url: &str,
        opts: RequestOptions,
    ) -> anyhow::Result<HttpResponse> {
        let started = Instant::now();
        let mut request = client.request(method.clone(), url).headers(opts.headers);
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = opts.body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("{method} {url} failed"))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading the body of {method} {url} failed"))?
            .to_vec();

        tracing::debug!(
            component = %self.id,
            %method,
            %url,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "HTTP request completed"
        );
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Component for HttpClientComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn register_config(&mut self, flags: &mut FlagSet) {
        flags.register(&self.timeout, Duration::from_secs(5), "total request timeout");
        flags.register(&self.max_idle_conn, 100, "idle connections kept per host");
        flags.register(
            &self.idle_conn_timeout,
            Duration::from_secs(90),
            "close idle connections after this long",
        );
        flags.register(&self.user_agent, String::new(), "User-Agent header; empty keeps the default");
    }

    async fn activate(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let cfg = ctx.config();
        let settings = ClientSettings {
            timeout: cfg.get(&self.timeout)?,
            max_idle: non_negative(&self.max_idle_conn, cfg.get(&self.max_idle_conn)?)?,
            idle_timeout: cfg.get(&self.idle_conn_timeout)?,
            user_agent: cfg.get(&self.user_agent)?,
        };
        let client = settings.builder().build().context("failed to build HTTP client")?;

        tracing::info!(
            component = %self.id,
            timeout = ?settings.timeout,
            max_idle = settings.max_idle,
            "HTTP client ready"
        );
        self.state.store(Some(Arc::new(ClientState { client, settings })));
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        if self.state.swap(None).is_some() {
            tracing::debug!(component = %self.id, "HTTP client released");
        }
        Ok(())
    }
}
