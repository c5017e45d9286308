//! Components composed in one service context, end to end.

use axum::{routing::get, Router};
use sctx::{ContextError, Phase, ServiceContext};
use sctx_components::{HttpClientComponent, HttpServerComponent, RedisComponent, SqlComponent};

#[tokio::test]
async fn server_client_and_database_share_one_lifecycle() {
    let mut ctx = ServiceContext::builder()
        .with_name("stack")
        .with_component(SqlComponent::new("db").with_default_dsn("sqlite::memory:"))
        .with_component(HttpClientComponent::new("egress"))
        .with_component(HttpServerComponent::new("web").with_default_port(0))
        .build()
        .unwrap();
    ctx.parse_from(["stack", "--web-host=127.0.0.1", "--egress-user-agent=stack-test/1.0"])
        .unwrap();
    ctx.load().await.unwrap();

    let db = ctx.must_get::<SqlComponent>("db");
    let pool = db.pool().unwrap();
    let web = ctx.must_get::<HttpServerComponent>("web");
    web.serve(Router::new().route(
        "/ping",
        get(move || {
            let pool = pool.clone();
            async move {
                let row: (i64,) = sqlx::query_as("SELECT 7")
                    .fetch_one(&pool)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok::<_, String>(format!("pong {}", row.0))
            }
        }),
    ))
    .unwrap();

    let client = ctx.must_get::<HttpClientComponent>("egress").client().unwrap();
    let url = format!("http://{}/ping", web.local_addr().unwrap());
    let body = client.get(url).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "pong 7");

    ctx.stop().await.unwrap();
    assert_eq!(ctx.phase(), Phase::Stopped);
    assert!(!web.is_serving());
    assert!(db.pool().is_err());
}

#[tokio::test]
async fn unreachable_cache_rolls_back_database() {
    let mut ctx = ServiceContext::builder()
        .with_name("rollback")
        .with_component(SqlComponent::new("db").with_default_dsn("sqlite::memory:"))
        .with_component(RedisComponent::new("cache"))
        .with_component(HttpServerComponent::new("web").with_default_port(0))
        .build()
        .unwrap();
    ctx.parse_from([
        "rollback",
        "--cache-url=redis://127.0.0.1:1",
        "--cache-connect-timeout=1s",
    ])
    .unwrap();

    let err = ctx.load().await.unwrap_err();
    assert!(matches!(err, ContextError::Activate { ref component, .. } if component == "cache"));
    assert_eq!(ctx.phase(), Phase::Failed);
    assert!(ctx.get::<SqlComponent>("db").is_none());
}

#[test]
fn outenv_lists_every_component_option() {
    let ctx = ServiceContext::builder()
        .with_name("outenv")
        .with_component(SqlComponent::new("db"))
        .with_component(RedisComponent::new("cache"))
        .build()
        .unwrap();

    let mut out = Vec::new();
    ctx.write_env(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();
    let names: Vec<&str> = out
        .lines()
        .filter_map(|l| l.split_once('=').map(|(k, _)| k))
        .collect();
    assert_eq!(
        names,
        vec![
            "DB_DSN",
            "DB_MAX_OPEN_CONNS",
            "DB_MIN_CONNS",
            "DB_CONN_MAX_IDLE_TIME",
            "DB_CONNECT_TIMEOUT",
            "CACHE_URL",
            "CACHE_USERNAME",
            "CACHE_PASSWORD",
            "CACHE_IS_CLUSTER",
            "CACHE_CONNECT_TIMEOUT",
        ]
    );
    assert!(out.contains("DB_CONN_MAX_IDLE_TIME=1h\n"));
}
