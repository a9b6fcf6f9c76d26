use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::unprepared::Statement as CqlStatement;

use sink_api::{Consistency, Statement, StoreError, StoreSession};

// ═══════════════════════════════════════════════════════════════
//  CassandraConfig
// ═══════════════════════════════════════════════════════════════

/// Подключение к кластеру (`[cluster]` в конфиге).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CassandraConfig {
    /// Contact points: host names or IP addresses.
    pub hosts: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Driver tuning passed through to the session builder.
    /// Понимаются: `connection_timeout_ms`, `tcp_nodelay`, `tcp_keepalive_interval_ms`.
    #[serde(default)]
    pub cluster_options: BTreeMap<String, serde_json::Value>,
}

fn default_port() -> u16 {
    9042
}

/// Typed view of `cluster_options`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClusterOptions {
    pub connection_timeout: Option<Duration>,
    pub tcp_nodelay: Option<bool>,
    pub tcp_keepalive_interval: Option<Duration>,
}

impl CassandraConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(StoreError::config("cluster.hosts must contain at least one host"));
        }
        if self.port == 0 {
            return Err(StoreError::config("cluster.port must be > 0"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(StoreError::config("cluster.password requires cluster.username"));
        }
        self.options().map(|_| ())
    }

    /// `host:port` for every configured host. Hosts that already carry a port are kept as is.
    pub fn known_nodes(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .map(|h| {
                if h.parse::<std::net::SocketAddr>().is_ok() || has_port(h) {
                    h.to_string()
                } else {
                    format!("{h}:{}", self.port)
                }
            })
            .collect()
    }

    /// Parse `cluster_options`. Wrong value types are errors; unknown keys are logged and ignored.
    pub fn options(&self) -> Result<ClusterOptions, StoreError> {
        let mut opts = ClusterOptions::default();
        for (key, value) in &self.cluster_options {
            match key.as_str() {
                "connection_timeout_ms" => {
                    opts.connection_timeout = Some(Duration::from_millis(as_millis(key, value)?));
                }
                "tcp_nodelay" => {
                    opts.tcp_nodelay = Some(value.as_bool().ok_or_else(|| {
                        StoreError::config(format!("cluster_options.{key}: expected boolean"))
                    })?);
                }
                "tcp_keepalive_interval_ms" => {
                    opts.tcp_keepalive_interval = Some(Duration::from_millis(as_millis(key, value)?));
                }
                other => {
                    tracing::warn!(option = other, "unknown cluster option ignored");
                }
            }
        }
        Ok(opts)
    }
}

fn has_port(host: &str) -> bool {
    // "name:9042"; bare IPv6 addresses contain several colons and are not host:port
    match host.rsplit_once(':') {
        Some((name, port)) => !name.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn as_millis(key: &str, value: &serde_json::Value) -> Result<u64, StoreError> {
    value
        .as_u64()
        .ok_or_else(|| StoreError::config(format!("cluster_options.{key}: expected non-negative integer (ms)")))
}

// ═══════════════════════════════════════════════════════════════
//  CassandraSession
// ═══════════════════════════════════════════════════════════════

/// Native-protocol session over the scylla driver (works with Cassandra 3+/4+ and ScyllaDB).
pub struct CassandraSession {
    session: Session,
    closed: AtomicBool,
}

/// Open a session. With `keyspace` the session is bound to it (`USE ks`).
pub async fn connect(
    config: &CassandraConfig,
    keyspace: Option<&str>,
) -> Result<Arc<dyn StoreSession>, StoreError> {
    config.validate()?;
    let opts = config.options()?;
    let nodes = config.known_nodes();

    let mut builder = SessionBuilder::new().known_nodes(&nodes);
    if let Some(user) = &config.username {
        builder = builder.user(user, config.password.as_deref().unwrap_or_default());
    }
    if let Some(ks) = keyspace {
        builder = builder.use_keyspace(ks, false);
    }
    if let Some(timeout) = opts.connection_timeout {
        builder = builder.connection_timeout(timeout);
    }
    if let Some(nodelay) = opts.tcp_nodelay {
        builder = builder.tcp_nodelay(nodelay);
    }
    if let Some(interval) = opts.tcp_keepalive_interval {
        builder = builder.tcp_keepalive_interval(interval);
    }

    let session = builder
        .build()
        .await
        .map_err(|e| StoreError::io(format!("Cassandra connect {nodes:?}: {e}")))?;

    tracing::info!(hosts = ?nodes, keyspace = ?keyspace, "Cassandra session established");
    Ok(Arc::new(CassandraSession {
        session,
        closed: AtomicBool::new(false),
    }))
}

/// Map the wire-independent consistency onto the driver's.
pub fn driver_consistency(c: Consistency) -> scylla::statement::Consistency {
    use scylla::statement::Consistency as Driver;
    match c {
        Consistency::Any => Driver::Any,
        Consistency::One => Driver::One,
        Consistency::Two => Driver::Two,
        Consistency::Three => Driver::Three,
        Consistency::Quorum => Driver::Quorum,
        Consistency::All => Driver::All,
        Consistency::LocalQuorum => Driver::LocalQuorum,
        Consistency::EachQuorum => Driver::EachQuorum,
        Consistency::Serial => Driver::Serial,
        Consistency::LocalSerial => Driver::LocalSerial,
        Consistency::LocalOne => Driver::LocalOne,
    }
}

impl StoreSession for CassandraSession {
    fn execute(&self, statement: &Statement)
        -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>
    {
        let mut cql = CqlStatement::new(statement.cql.clone());
        cql.set_consistency(driver_consistency(statement.consistency));
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(StoreError::io("Cassandra session closed"));
            }
            self.session
                .query_unpaged(cql, ())
                .await
                .map(|_| ())
                .map_err(|e| StoreError::io(format!("Cassandra execute: {e}")))
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async {
            // Driver connections are released when the last Arc drops.
            if !self.closed.swap(true, Ordering::AcqRel) {
                tracing::debug!("Cassandra session marked closed");
            }
            Ok(())
        })
    }
}
