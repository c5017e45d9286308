use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use serde_json::{json, Value};
use sqlx::AnyPool;

use sctx::{ContextError, ServiceContext};
use std::sync::Arc;

use sctx_components::{
    HttpClientComponent, HttpServerComponent, LogComponent, RequestOptions, SqlComponent,
};

const SERVICE_NAME: &str = "sctx-demo";

/// Demo service composed from a service context
#[derive(Parser)]
#[command(name = "sctx-demo")]
#[command(about = "Demo service composed from a service context")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service
    App,
    /// Print every option as NAME=value lines and exit
    Outenv {
        /// Precede each line with its help text
        #[arg(long)]
        with_help: bool,
    },
}

fn new_service_ctx() -> Result<ServiceContext, ContextError> {
    let builder = ServiceContext::builder().with_name(SERVICE_NAME);

    #[cfg(feature = "otel")]
    let builder = builder.with_component(
        sctx_components::OtelComponent::new("otel")
            .with_service_name(SERVICE_NAME)
            .with_service_version(env!("CARGO_PKG_VERSION")),
    );
    #[cfg(feature = "otel")]
    let log = LogComponent::new().with_tracing_from("otel");
    #[cfg(not(feature = "otel"))]
    let log = LogComponent::new();

    builder
        .with_component(log)
        .with_component(SqlComponent::new("db").with_default_dsn("sqlite::memory:"))
        .with_component(HttpClientComponent::new("http-client"))
        .with_component(HttpServerComponent::new("http"))
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut ctx = new_service_ctx()?;

    // Component options are accepted by every subcommand.
    let cmd = Cli::command()
        .mut_subcommand("app", |c| ctx.augment_command(c))
        .mut_subcommand("outenv", |c| ctx.augment_command(c));
    let matches = cmd.get_matches();
    let cli = Cli::from_arg_matches(&matches)?;
    if let Some((_, sub_matches)) = matches.subcommand() {
        ctx.apply_matches(sub_matches)?;
    }

    match cli.command {
        Commands::App => run_app(ctx).await,
        Commands::Outenv { with_help } => {
            ctx.env_template()
                .with_help(with_help)
                .write_to(&mut std::io::stdout().lock())?;
            Ok(())
        }
    }
}

#[derive(Clone)]
struct AppState {
    pool: AnyPool,
    http_client: Arc<HttpClientComponent>,
    self_url: String,
}

async fn run_app(ctx: ServiceContext) -> Result<()> {
    if let Err(e) = ctx.load().await {
        tracing::error!(error = %e, "Failed to load service context");
        return Err(e.into());
    }

    let http = ctx.must_get::<HttpServerComponent>("http");
    let state = AppState {
        pool: ctx.must_get::<SqlComponent>("db").pool()?,
        http_client: ctx.must_get::<HttpClientComponent>("http-client"),
        self_url: format!("http://127.0.0.1:{}", http.port()?),
    };

    let router = Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/self-check", get(self_check))
        .with_state(state);
    http.serve(router)?;
    tracing::info!(addr = %http.local_addr()?, "Server started");

    let waited = sctx_bootstrap::wait_for_shutdown().await;
    let stopped = ctx.stop().await;
    waited?;
    stopped?;

    tracing::info!("Server exited");
    Ok(())
}

type ApiError = (StatusCode, Json<Value>);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ping(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let (one,): (i64,) = sqlx::query_as("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "message": "pong", "db": one })))
}

// Calls this service's own /health through the shared HTTP client.
async fn self_check(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let resp = state
        .http_client
        .make_request(
            reqwest::Method::GET,
            &format!("{}/health", state.self_url),
            RequestOptions::default(),
        )
        .await
        .map_err(internal)?;
    let body: Value = resp.json().map_err(internal)?;
    Ok(Json(json!({ "status": resp.status.as_u16(), "upstream": body })))
}
