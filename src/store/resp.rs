//! RESP transport
//!
//! One TCP link to one server. A batch is written in a single buffer and the
//! replies are read back in order, so a batch costs one round trip no matter
//! how many commands it holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{ClusterStore, Connector, SlotRange, Store};
use crate::config::{ClusterNode, ConnectionConfig, NodeAddress, Topology};
use crate::error::{CacheError, Result};
use crate::protocol::{encode_command_into, read_reply, Command, Reply};

/// The socket plus bytes read but not yet decoded
struct Link {
    stream: TcpStream,
    buf: BytesMut,
    /// Set after an I/O or framing failure; the link is never reused
    broken: bool,
}

/// A connected single-node store
pub struct RespStore {
    addr: String,
    link: Mutex<Link>,
}

impl RespStore {
    /// Connect, authenticate and select the database
    pub async fn connect(address: &NodeAddress, timeout: Duration) -> Result<Self> {
        let addr = address.addr();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CacheError::Connection(format!("Timed out connecting to {}", addr)))??;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let store = Self {
            addr,
            link: Mutex::new(Link {
                stream,
                buf: BytesMut::with_capacity(16 * 1024),
                broken: false,
            }),
        };

        let mut setup = Vec::new();
        if let Some(password) = &address.password {
            setup.push(Command::Auth {
                password: password.clone(),
            });
        }
        if address.db != 0 {
            setup.push(Command::Select { db: address.db });
        }
        if !setup.is_empty() {
            for reply in store.round_trip(setup).await? {
                if let Reply::Error(message) = reply {
                    return Err(CacheError::Connection(format!(
                        "Failed to authenticate connection: {}",
                        message
                    )));
                }
            }
        }

        tracing::debug!("Connected to {}", store.addr);
        Ok(store)
    }

    /// Server address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Write all commands, then read one reply per command
    async fn round_trip(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        let mut link = self.link.lock().await;
        if link.broken {
            return Err(CacheError::Connection(format!(
                "Link to {} is no longer usable",
                self.addr
            )));
        }

        let mut out = BytesMut::new();
        for command in &commands {
            encode_command_into(command, &mut out);
        }

        let Link { stream, buf, .. } = &mut *link;
        let result: Result<Vec<Reply>> = async {
            stream.write_all(&out).await?;
            let mut replies = Vec::with_capacity(commands.len());
            for _ in 0..commands.len() {
                replies.push(read_reply(stream, buf).await?);
            }
            Ok::<_, CacheError>(replies)
        }
        .await;

        if let Err(ref err) = result {
            tracing::warn!("Link to {} failed: {}", self.addr, err);
            link.broken = true;
        }
        result
    }

    /// Slot layout as `(start, end, host, port)` of each master
    pub async fn cluster_slots(&self) -> Result<Vec<(u16, u16, String, u16)>> {
        let reply = self
            .round_trip(vec![Command::ClusterSlots])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CacheError::Protocol("Missing CLUSTER SLOTS reply".to_string()))?;

        let malformed = || CacheError::Protocol("Malformed CLUSTER SLOTS reply".to_string());

        let mut layout = Vec::new();
        for entry in reply.into_array()? {
            let mut fields = entry.into_array()?.into_iter();
            let start = fields.next().and_then(|f| f.as_integer()).ok_or_else(malformed)?;
            let end = fields.next().and_then(|f| f.as_integer()).ok_or_else(malformed)?;
            let mut master = fields.next().ok_or_else(malformed)?.into_array()?.into_iter();
            let host = master
                .next()
                .ok_or_else(malformed)?
                .into_bulk()?
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            let port = master.next().and_then(|f| f.as_integer()).ok_or_else(malformed)?;

            let narrow = |value: i64| u16::try_from(value).map_err(|_| malformed());
            layout.push((narrow(start)?, narrow(end)?, host, narrow(port)?));
        }
        Ok(layout)
    }
}

impl Store for RespStore {
    fn execute(&self, commands: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>>> {
        self.round_trip(commands).boxed()
    }

    fn quit(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut link = self.link.lock().await;
            if link.broken {
                return Ok(());
            }
            link.broken = true;

            let mut out = BytesMut::new();
            encode_command_into(&Command::Quit, &mut out);
            let Link { stream, buf, .. } = &mut *link;
            stream.write_all(&out).await?;
            // The server answers +OK and then closes its side
            let _ = read_reply(stream, buf).await;
            stream.shutdown().await?;
            Ok(())
        }
        .boxed()
    }

    fn closed(&self) -> BoxFuture<'_, CacheError> {
        async move {
            let mut link = self.link.lock().await;
            if link.broken {
                return CacheError::Connection(format!(
                    "Link to {} is no longer usable",
                    self.addr
                ));
            }

            // Nothing is owed to an idle link, so any read ends it.
            // `read_buf` is cancel safe: a batch arriving first loses no bytes.
            let Link { stream, buf, broken } = &mut *link;
            let err = match stream.read_buf(buf).await {
                Ok(0) => CacheError::Connection(format!(
                    "Connection closed by {}",
                    self.addr
                )),
                Ok(_) => CacheError::Protocol(format!(
                    "Unexpected data from {} on an idle link",
                    self.addr
                )),
                Err(err) => CacheError::from(err),
            };
            *broken = true;
            tracing::warn!("Link to {} lost while idle: {}", self.addr, err);
            err
        }
        .boxed()
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Builds RESP links for a single node or a cluster
#[derive(Debug, Clone)]
pub struct RespConnector {
    config: ConnectionConfig,
}

impl RespConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    async fn connect_single(&self, address: &NodeAddress) -> Result<Arc<dyn Store>> {
        let store = RespStore::connect(address, self.config.connect_timeout()).await?;
        Ok(Arc::new(store))
    }

    async fn connect_cluster(
        &self,
        nodes: &[ClusterNode],
        fallback_password: &Option<String>,
    ) -> Result<Arc<dyn Store>> {
        let timeout = self.config.connect_timeout();
        let address_of = |host: String, port: u16| NodeAddress {
            password: nodes
                .iter()
                .find(|n| n.port == port && n.host == host)
                .or_else(|| nodes.iter().find(|n| n.port == port))
                .and_then(|n| n.password.clone())
                .or_else(|| fallback_password.clone()),
            host,
            port,
            db: 0,
        };

        // First reachable seed reports the slot layout
        let mut seed = None;
        let mut last_error = None;
        for node in nodes {
            match RespStore::connect(&address_of(node.host.clone(), node.port), timeout).await {
                Ok(store) => {
                    seed = Some((node, store));
                    break;
                }
                Err(err) => {
                    tracing::warn!("Cluster seed {} unreachable: {}", node.addr(), err);
                    last_error = Some(err);
                }
            }
        }
        let (seed_node, seed) = match seed {
            Some(found) => found,
            None => {
                return Err(last_error.unwrap_or_else(|| {
                    CacheError::Connection("No cluster nodes configured".to_string())
                }))
            }
        };

        let layout = seed.cluster_slots().await?;
        let _ = seed.quit().await;

        let mut shards: Vec<Arc<dyn Store>> = Vec::new();
        let mut shard_by_addr: HashMap<String, usize> = HashMap::new();
        let mut ranges = Vec::with_capacity(layout.len());

        for (start, end, host, port) in layout {
            // An empty host means "the node you asked"
            let host = if host.is_empty() {
                seed_node.host.clone()
            } else {
                host
            };
            let addr = format!("{}:{}", host, port);
            let shard = match shard_by_addr.get(&addr) {
                Some(&shard) => shard,
                None => {
                    let store = RespStore::connect(&address_of(host, port), timeout).await?;
                    shards.push(Arc::new(store));
                    shard_by_addr.insert(addr, shards.len() - 1);
                    shards.len() - 1
                }
            };
            ranges.push(SlotRange { start, end, shard });
        }

        tracing::info!(
            "Cluster layout: {} ranges over {} masters",
            ranges.len(),
            shards.len()
        );
        Ok(Arc::new(ClusterStore::with_ranges(shards, ranges)?))
    }
}

impl Connector for RespConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Store>>> {
        async move {
            match &self.config.topology {
                Topology::Single(address) => self.connect_single(address).await,
                Topology::Cluster {
                    nodes,
                    fallback_password,
                } => self.connect_cluster(nodes, fallback_password).await,
            }
        }
        .boxed()
    }
}
