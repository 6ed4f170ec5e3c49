//! Configuration for coalescekv
//!
//! Centralized configuration with sensible defaults. A configuration is
//! either built with [`CacheConfig::builder`] or parsed from the JSON options
//! object a host process hands to the cache ([`CacheConfig::from_json`]).
//! Both paths run the same validation, which decides the [`Topology`] once,
//! at parse time.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, Result};

/// Port used when a single-node config omits one
pub const DEFAULT_PORT: u16 = 6379;

/// Default host for cluster nodes that only name a port
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Combined buffer size above which a flush runs synchronously
pub const DEFAULT_HIGH_WATER_MARK: usize = 5000;

/// Main configuration for a cache engine
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    // -------------------------------------------------------------------------
    // Connection Configuration
    // -------------------------------------------------------------------------
    /// Where and how to reach the backing store
    pub connection: ConnectionConfig,

    // -------------------------------------------------------------------------
    // Engine Configuration
    // -------------------------------------------------------------------------
    /// Expiry applied to every write, in seconds. `None` keeps records forever.
    pub ttl: Option<u64>,

    /// Max buffered operations before a flush is forced in the caller's context
    pub high_water_mark: usize,
}

/// Connection parameters, already validated
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Single node or cluster
    pub topology: Topology,

    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Delay before re-establishing a failed link (milliseconds)
    pub reconnect_delay_ms: u64,
}

impl ConnectionConfig {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            connect_timeout_ms: 5000,
            reconnect_delay_ms: 1000,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// The two mutually exclusive ways of reaching the store
#[derive(Debug, Clone, PartialEq)]
pub enum Topology {
    /// One server
    Single(NodeAddress),

    /// A cluster reached through seed nodes
    Cluster {
        nodes: Vec<ClusterNode>,
        /// Password for nodes that do not carry their own
        fallback_password: Option<String>,
    },
}

/// A single server endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u32,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            db: 0,
        }
    }

    /// `host:port` form for socket connects and logging
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One seed node of a cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterNode {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl ClusterNode {
    pub fn new(port: u16) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port,
            password: None,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl CacheConfig {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse the recognized options object:
    ///
    /// ```text
    /// { host, port, password?, db?, url?, ttl?,
    ///   nodes?: [{ host?, port, password? }], redisOptions?: { password? },
    ///   highWaterMark?, connectTimeoutMs?, reconnectDelayMs? }
    /// ```
    ///
    /// Unknown keys are ignored.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Err(CacheError::Config("Missing option 'host'".to_string()));
        }
        if !value.is_object() {
            return Err(CacheError::Config(
                "Options must be a JSON object".to_string(),
            ));
        }

        let mut raw: RawOptions = serde_json::from_value(value.clone())
            .map_err(|e| CacheError::Config(format!("Invalid options: {}", e)))?;

        let nodes = match raw.nodes.take() {
            Some(nodes) => Some(parse_nodes(nodes)?),
            None => None,
        };

        assemble(raw, nodes)
    }
}

// =============================================================================
// Raw options
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOptions {
    host: Option<String>,
    port: Option<PortValue>,
    password: Option<String>,
    db: Option<u32>,
    url: Option<String>,
    ttl: Option<u64>,
    nodes: Option<serde_json::Value>,
    redis_options: Option<FallbackOptions>,
    high_water_mark: Option<usize>,
    connect_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
}

/// Ports arrive as numbers or, from environment variables, as strings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    fn resolve(&self) -> Result<u16> {
        match self {
            PortValue::Number(port) => Ok(*port),
            PortValue::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| CacheError::Config(format!("Invalid port '{}'", text))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FallbackOptions {
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeDescriptor {
    host: Option<String>,
    port: PortValue,
    password: Option<String>,
}

fn parse_nodes(value: serde_json::Value) -> Result<Vec<ClusterNode>> {
    if !value.is_array() {
        return Err(CacheError::Config(
            "Option nodes must be an array of connection parameters for cluster".to_string(),
        ));
    }

    let descriptors: Vec<NodeDescriptor> = serde_json::from_value(value).map_err(|e| {
        CacheError::Config(format!("Malformed cluster node descriptor: {}", e))
    })?;

    descriptors
        .into_iter()
        .map(|node| {
            Ok(ClusterNode {
                host: node.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: node.port.resolve()?,
                password: node.password,
            })
        })
        .collect()
}

/// Shared validation for JSON and builder configs
fn assemble(raw: RawOptions, nodes: Option<Vec<ClusterNode>>) -> Result<CacheConfig> {
    let single_fields = raw.host.is_some() || raw.port.is_some() || raw.url.is_some() || raw.db.is_some();

    let topology = match nodes {
        Some(nodes) => {
            if single_fields {
                return Err(CacheError::Config(
                    "Options host/port/url/db and nodes are mutually exclusive".to_string(),
                ));
            }
            if nodes.is_empty() {
                return Err(CacheError::Config(
                    "Option nodes must list at least one cluster node".to_string(),
                ));
            }
            let fallback_password = raw
                .redis_options
                .and_then(|o| o.password)
                .or(raw.password);
            Topology::Cluster {
                nodes,
                fallback_password,
            }
        }
        None => {
            let mut address = match raw.url {
                Some(ref url) => parse_url(url)?,
                None => {
                    let host = raw.host.clone().ok_or_else(|| {
                        CacheError::Config("Missing option 'host'".to_string())
                    })?;
                    NodeAddress::new(host, DEFAULT_PORT)
                }
            };
            // Explicit fields win over the url
            if let Some(host) = raw.host {
                address.host = host;
            }
            if let Some(port) = raw.port {
                address.port = port.resolve()?;
            }
            if raw.password.is_some() {
                address.password = raw.password;
            }
            if let Some(db) = raw.db {
                address.db = db;
            }
            if address.host.is_empty() {
                return Err(CacheError::Config("Option 'host' is empty".to_string()));
            }
            Topology::Single(address)
        }
    };

    let mut connection = ConnectionConfig::new(topology);
    if let Some(ms) = raw.connect_timeout_ms {
        connection.connect_timeout_ms = ms;
    }
    if let Some(ms) = raw.reconnect_delay_ms {
        connection.reconnect_delay_ms = ms;
    }

    let high_water_mark = raw.high_water_mark.unwrap_or(DEFAULT_HIGH_WATER_MARK);
    if high_water_mark == 0 {
        return Err(CacheError::Config(
            "Option highWaterMark must be positive".to_string(),
        ));
    }

    Ok(CacheConfig {
        connection,
        // A zero ttl means "no expiry", as it always has for this option
        ttl: raw.ttl.filter(|ttl| *ttl > 0),
        high_water_mark,
    })
}

/// Parse `redis://[user][:password@]host[:port][/db]`
fn parse_url(url: &str) -> Result<NodeAddress> {
    let rest = url
        .strip_prefix("redis://")
        .ok_or_else(|| CacheError::Config(format!("Unsupported url scheme in '{}'", url)))?;

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, path),
        None => (rest, ""),
    };

    let (credentials, host_port) = match authority.rsplit_once('@') {
        Some((credentials, host_port)) => (Some(credentials), host_port),
        None => (None, authority),
    };

    let password = credentials
        .map(|c| match c.split_once(':') {
            Some((_user, password)) => password.to_string(),
            None => c.to_string(),
        })
        .filter(|p| !p.is_empty());

    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| CacheError::Config(format!("Invalid port in url '{}'", url)))?;
            (host, port)
        }
        None => (host_port, DEFAULT_PORT),
    };

    let db = if path.is_empty() {
        0
    } else {
        path.parse()
            .map_err(|_| CacheError::Config(format!("Invalid db in url '{}'", url)))?
    };

    Ok(NodeAddress {
        host: host.to_string(),
        port,
        password,
        db,
    })
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for CacheConfig
#[derive(Default)]
pub struct ConfigBuilder {
    options: RawOptions,
    nodes: Option<Vec<ClusterNode>>,
}

impl ConfigBuilder {
    /// Set the single-node host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.options.host = Some(host.into());
        self
    }

    /// Set the single-node port
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = Some(PortValue::Number(port));
        self
    }

    /// Set the password (single node, or cluster fallback)
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.options.password = Some(password.into());
        self
    }

    /// Set the database index (single node only)
    pub fn db(mut self, db: u32) -> Self {
        self.options.db = Some(db);
        self
    }

    /// Set host, port, password and db from a `redis://` url
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.options.url = Some(url.into());
        self
    }

    /// Add a cluster seed node (switches to cluster mode)
    pub fn node(mut self, node: ClusterNode) -> Self {
        self.nodes.get_or_insert_with(Vec::new).push(node);
        self
    }

    /// Set the record expiry in seconds
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.options.ttl = Some(seconds);
        self
    }

    /// Set the synchronous-flush threshold
    pub fn high_water_mark(mut self, ops: usize) -> Self {
        self.options.high_water_mark = Some(ops);
        self
    }

    /// Set the connect timeout (in milliseconds)
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.options.connect_timeout_ms = Some(ms);
        self
    }

    /// Set the reconnect delay (in milliseconds)
    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.options.reconnect_delay_ms = Some(ms);
        self
    }

    pub fn build(self) -> Result<CacheConfig> {
        assemble(self.options, self.nodes)
    }
}
