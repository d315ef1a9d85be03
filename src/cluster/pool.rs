//! fred-backed node pool implementing [`ClusterPipeline`].
//!
//! One centralized client per node, connected lazily and kept for the
//! lifetime of the run. Routing uses the tool's own slot map (parsed
//! from `CLUSTER NODES`) rather than a clustered client, because the
//! driver needs to see `MOVED`/`ASK` replies itself to rewind its batch
//! to the last acknowledged address. A standalone server rejects
//! `CLUSTER NODES`; the pool then routes every slot to the seed.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::{CustomCommand, Value};
use tracing::{debug, trace};

use super::command::{Command, Redirect, RedirectKind, Reply};
use super::nodes::ClusterMap;
use super::{BatchOutcome, ClusterError, ClusterPipeline};

/// Connection parameters for a [`NodePool`].
#[derive(Debug, Clone)]
pub struct NodePoolConfig {
    /// Seed node used for discovery and as the standalone fallback.
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl NodePoolConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Lazily-connected clients plus the current batch state.
pub struct NodePool {
    config: NodePoolConfig,
    clients: HashMap<(String, u16), Client>,
    topology: Option<ClusterMap>,
    /// The server every slot routes to when cluster support is disabled.
    standalone: bool,
    /// Slot owners learned from MOVED replies, consulted before the map.
    moved: HashMap<u16, (String, u16)>,
    /// One-shot target installed by `follow`, consumed by `begin`.
    forced: Option<((String, u16), bool)>,
    target: Option<(String, u16)>,
    asking: bool,
    queued: Vec<Command>,
}

impl NodePool {
    /// Connect to the seed node and discover the topology.
    pub async fn connect(config: NodePoolConfig) -> Result<Self, ClusterError> {
        let mut pool = Self {
            config,
            clients: HashMap::new(),
            topology: None,
            standalone: false,
            moved: HashMap::new(),
            forced: None,
            target: None,
            asking: false,
            queued: Vec::new(),
        };
        let seed = (pool.config.host.clone(), pool.config.port);
        pool.client_at(&seed).await?;
        pool.discover().await?;
        Ok(pool)
    }

    fn seed(&self) -> (String, u16) {
        (self.config.host.clone(), self.config.port)
    }

    /// Get or establish the client for one node.
    async fn client_at(&mut self, node: &(String, u16)) -> Result<Client, ClusterError> {
        if let Some(client) = self.clients.get(node) {
            return Ok(client.clone());
        }

        debug!(host = %node.0, port = node.1, "connecting to node");
        let mut redis_config = Config {
            server: ServerConfig::Centralized {
                server: Server::new(node.0.clone(), node.1),
            },
            ..Default::default()
        };
        redis_config.password = self.config.password.clone();

        let command_timeout = self.config.command_timeout;
        let connection_timeout = self.config.connect_timeout;
        let client = Builder::from_config(redis_config)
            .with_performance_config(|perf| {
                perf.default_command_timeout = command_timeout;
            })
            .with_connection_config(|conn| {
                conn.connection_timeout = connection_timeout;
            })
            .build()?;
        client.init().await?;

        self.clients.insert(node.clone(), client.clone());
        Ok(client)
    }

    /// Refresh the slot map from any reachable node. A server with
    /// cluster support disabled answers with an error reply; every slot
    /// then routes to the seed.
    async fn discover(&mut self) -> Result<(), ClusterError> {
        let node = self.seed();
        let client = self.client_at(&node).await?;
        let cmd = CustomCommand::new_static("CLUSTER", None, false);
        let result: Result<String, fred::error::Error> =
            client.custom(cmd, vec!["NODES".to_string()]).await;

        match result {
            Ok(output) => {
                let map = ClusterMap::parse(&output)?;
                debug!(nodes = map.nodes.len(), "discovered cluster topology");
                self.topology = Some(map);
                self.standalone = false;
                self.moved.clear();
            }
            Err(error) if is_transport_error(&error) => return Err(error.into()),
            Err(error) => {
                debug!(%error, "cluster support disabled, using standalone routing");
                self.standalone = true;
                self.topology = None;
            }
        }
        Ok(())
    }

    fn route(&self, slot: u16) -> Result<(String, u16), ClusterError> {
        if self.standalone {
            return Ok(self.seed());
        }
        if let Some(node) = self.moved.get(&slot) {
            return Ok(node.clone());
        }
        let owner = self
            .topology
            .as_ref()
            .and_then(|map| map.owner_of(slot))
            .ok_or(ClusterError::NoNode(slot))?;
        Ok((owner.host.clone(), owner.port))
    }
}

fn is_transport_error(error: &fred::error::Error) -> bool {
    matches!(
        error.kind(),
        fred::error::ErrorKind::IO | fred::error::ErrorKind::Timeout | fred::error::ErrorKind::Canceled
    )
}

fn command_args(command: &Command) -> Vec<Value> {
    command
        .args
        .iter()
        .map(|arg| Value::Bytes(bytes::Bytes::from(arg.clone())))
        .collect()
}

#[async_trait]
impl ClusterPipeline for NodePool {
    async fn begin(&mut self, key: &[u8]) -> Result<(), ClusterError> {
        self.queued.clear();
        if let Some((node, asking)) = self.forced.take() {
            self.asking = asking;
            self.target = Some(node);
            return Ok(());
        }
        self.asking = false;
        let slot = fred::util::redis_keyslot(key);
        let node = self.route(slot)?;
        trace!(slot, host = %node.0, port = node.1, "routing batch");
        self.target = Some(node);
        Ok(())
    }

    fn enqueue(&mut self, command: Command) {
        self.queued.push(command);
    }

    async fn commit(&mut self) -> Result<BatchOutcome, ClusterError> {
        let node = self
            .target
            .clone()
            .unwrap_or_else(|| self.seed());
        let asking = self.asking;
        let commands = std::mem::take(&mut self.queued);

        let client = match self.client_at(&node).await {
            Ok(client) => client,
            Err(ClusterError::Connection(error)) if is_transport_error(&error) => {
                debug!(%error, host = %node.0, "node unreachable, will retry");
                self.clients.remove(&node);
                return Ok(BatchOutcome::TryAgain(None));
            }
            Err(error) => return Err(error),
        };

        let pipeline = client.pipeline();
        if asking {
            let cmd = CustomCommand::new_static("ASKING", None, false);
            let _: () = pipeline.custom(cmd, Vec::<Value>::new()).await?;
        }
        for command in &commands {
            let cmd = CustomCommand::new_static(command.name, None, false);
            let _: () = pipeline.custom(cmd, command_args(command)).await?;
        }

        let mut results: Vec<Result<Value, fred::error::Error>> = pipeline.try_all().await;
        if asking && !results.is_empty() {
            // The ASKING reply is not part of the batch, but a failure
            // there invalidates everything after it.
            if let Err(error) = results.remove(0) {
                if let Some(redirect) = Redirect::parse(error.details()) {
                    debug!(
                        slot = redirect.slot,
                        host = %redirect.host,
                        port = redirect.port,
                        kind = ?redirect.kind,
                        "ASKING redirected, replaying batch"
                    );
                    return Ok(BatchOutcome::TryAgain(Some(redirect)));
                }
                debug!(%error, "ASKING failed, will retry");
                if is_transport_error(&error) {
                    self.clients.remove(&node);
                }
                return Ok(BatchOutcome::TryAgain(None));
            }
        }

        let mut replies = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(value) => replies.push(Reply::from(value)),
                Err(error) => {
                    if let Some(redirect) = Redirect::parse(error.details()) {
                        debug!(
                            slot = redirect.slot,
                            host = %redirect.host,
                            port = redirect.port,
                            kind = ?redirect.kind,
                            "slot redirect, replaying batch"
                        );
                        return Ok(BatchOutcome::TryAgain(Some(redirect)));
                    }
                    if is_transport_error(&error) {
                        debug!(%error, "connection dropped mid-batch, will retry");
                        self.clients.remove(&node);
                        return Ok(BatchOutcome::TryAgain(None));
                    }
                    replies.push(Reply::Error(error.details().to_string()));
                }
            }
        }
        Ok(BatchOutcome::Replies(replies))
    }

    async fn follow(&mut self, redirect: Option<&Redirect>) -> Result<(), ClusterError> {
        match redirect {
            Some(redirect) => {
                let node = (redirect.host.clone(), redirect.port);
                if redirect.kind == RedirectKind::Moved {
                    self.moved.insert(redirect.slot, node.clone());
                }
                self.forced = Some((node, redirect.kind == RedirectKind::Ask));
            }
            None => {
                self.discover().await?;
            }
        }
        Ok(())
    }
}
