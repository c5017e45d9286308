//! Redis connection as a component: a single node behind an auto-reconnecting
//! `ConnectionManager`, or a cluster through `cluster_async`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, IntoConnectionInfo, Pipeline, RedisFuture, Value};
use sctx::{Component, Flag, FlagSet, ServiceContext};

use crate::{flag_name, ComponentError};

/// A shared multiplexed connection; clones reuse it.
#[derive(Clone)]
pub enum RedisConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            RedisConnection::Single(c) => c.req_packed_command(cmd),
            RedisConnection::Cluster(c) => c.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            RedisConnection::Single(c) => c.req_packed_commands(cmd, offset, count),
            RedisConnection::Cluster(c) => c.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Single(c) => c.get_db(),
            RedisConnection::Cluster(c) => c.get_db(),
        }
    }
}

// Comma-separated seed nodes; bare host:port gets the redis:// scheme.
fn cluster_nodes(raw: &str) -> Result<Vec<String>, String> {
    let nodes: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| {
            if n.contains("://") {
                n.to_string()
            } else {
                format!("redis://{n}")
            }
        })
        .collect();
    if nodes.is_empty() {
        return Err("at least one cluster node is required".to_string());
    }
    Ok(nodes)
}

pub struct RedisComponent {
    id: String,
    url: Flag<String>,
    username: Flag<String>,
    password: Flag<String>,
    is_cluster: Flag<bool>,
    connect_timeout: Flag<Duration>,
    connection: ArcSwapOption<RedisConnection>,
}

impl RedisComponent {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            url: Flag::new(flag_name(&id, "url")),
            username: Flag::new(flag_name(&id, "username")),
            password: Flag::new(flag_name(&id, "password")),
            is_cluster: Flag::new(flag_name(&id, "is-cluster")),
            connect_timeout: Flag::new(flag_name(&id, "connect-timeout")),
            connection: ArcSwapOption::empty(),
            id,
        }
    }

    /// A handle to the shared multiplexed connection.
    pub fn connection(&self) -> Result<RedisConnection, ComponentError> {
        self.connection
            .load_full()
            .map(|c| (*c).clone())
            .ok_or_else(|| ComponentError::not_active(&self.id))
    }

    async fn connect_single(
        &self,
        url: &str,
        username: String,
        password: String,
    ) -> anyhow::Result<(RedisConnection, String)> {
        let mut info = url
            .into_connection_info()
            .map_err(|e| ComponentError::invalid(&self.url, e.to_string()))?;
        if !username.is_empty() {
            info.redis.username = Some(username);
        }
        if !password.is_empty() {
            info.redis.password = Some(password);
        }
        let addr = info.addr.to_string();
        let client = redis::Client::open(info)?;
        let manager = client
            .get_connection_manager()
            .await
            .with_context(|| format!("failed to connect to Redis at {addr}"))?;
        Ok((RedisConnection::Single(manager), addr))
    }

    async fn connect_cluster(
        &self,
        url: &str,
        username: String,
        password: String,
        connect_timeout: Duration,
    ) -> anyhow::Result<(RedisConnection, String)> {
        let nodes = cluster_nodes(url).map_err(|reason| ComponentError::invalid(&self.url, reason))?;
        let addr = nodes.join(",");
        let mut builder = ClusterClientBuilder::new(nodes).connection_timeout(connect_timeout);
        if !username.is_empty() {
            builder = builder.username(username);
        }
        if !password.is_empty() {
            builder = builder.password(password);
        }
        let client = builder
            .build()
            .map_err(|e| ComponentError::invalid(&self.url, e.to_string()))?;
        let connection = client
            .get_async_connection()
            .await
            .with_context(|| format!("failed to connect to Redis cluster at {addr}"))?;
        Ok((RedisConnection::Cluster(connection), addr))
    }
}

#[async_trait]
impl Component for RedisComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn register_config(&mut self, flags: &mut FlagSet) {
        flags.register(
            &self.url,
            "redis://127.0.0.1:6379".to_string(),
            "Redis URL; comma-separated seed nodes in cluster mode",
        );
        flags.register(&self.username, String::new(), "ACL username; overrides the URL");
        flags.register(&self.password, String::new(), "password; overrides the URL");
        flags.register(&self.is_cluster, false, "connect to a Redis cluster");
        flags.register(&self.connect_timeout, Duration::from_secs(5), "connect timeout");
    }

    async fn activate(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let cfg = ctx.config();
        let url = cfg.get(&self.url)?;
        let username = cfg.get(&self.username)?;
        let password = cfg.get(&self.password)?;
        let is_cluster = cfg.get(&self.is_cluster)?;
        let connect_timeout = cfg.get(&self.connect_timeout)?;

        let connect = async {
            if is_cluster {
                self.connect_cluster(&url, username, password, connect_timeout)
                    .await
            } else {
                self.connect_single(&url, username, password).await
            }
        };
        let (mut connection, addr) = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {connect_timeout:?}"))
            .and_then(|res| res)
            .context("Redis connection failed")?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .context("Redis PING failed")?;

        tracing::info!(
            component = %self.id,
            %addr,
            cluster = is_cluster,
            reply = %pong,
            "Redis connection ready"
        );
        self.connection.store(Some(Arc::new(connection)));
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        if self.connection.swap(None).is_some() {
            tracing::info!(component = %self.id, "Redis connection released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declares_connection_flags() {
        let ctx = ServiceContext::builder()
            .with_component(RedisComponent::new("cache"))
            .build()
            .unwrap();
        let names: Vec<&str> = ctx.config().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "cache-url",
                "cache-username",
                "cache-password",
                "cache-is-cluster",
                "cache-connect-timeout"
            ]
        );
    }

    #[test]
    fn cluster_nodes_get_a_scheme() {
        assert_eq!(
            cluster_nodes("redis-0:6379, redis-1:6379,,rediss://redis-2:6380").unwrap(),
            vec![
                "redis://redis-0:6379",
                "redis://redis-1:6379",
                "rediss://redis-2:6380"
            ]
        );
        assert!(cluster_nodes(" , ").is_err());
    }

    #[tokio::test]
    async fn malformed_url_fails_activation() {
        let mut ctx = ServiceContext::builder()
            .with_name("svc")
            .with_component(RedisComponent::new("rbad"))
            .build()
            .unwrap();
        ctx.parse_from(["svc", "--rbad-url", "not a url"]).unwrap();

        let err = ctx.load().await.unwrap_err();
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.contains("rbad-url"), "{chain}");
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_activation() {
        let mut ctx = ServiceContext::builder()
            .with_name("svc")
            .with_component(RedisComponent::new("rcl"))
            .build()
            .unwrap();
        ctx.parse_from([
            "svc",
            "--rcl-is-cluster",
            "--rcl-url=127.0.0.1:1,127.0.0.1:2",
            "--rcl-connect-timeout=500ms",
        ])
        .unwrap();

        let err = ctx.load().await.unwrap_err();
        assert!(matches!(err, sctx::ContextError::Activate { ref component, .. } if component == "rcl"));
        assert_eq!(ctx.phase(), sctx::Phase::Failed);
    }

    #[test]
    fn connection_requires_activation() {
        let cache = RedisComponent::new("cold");
        assert!(matches!(
            cache.connection(),
            Err(ComponentError::NotActive { .. })
        ));
    }
}
