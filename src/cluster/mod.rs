//! Cluster-aware command execution.
//!
//! The pipeline driver only depends on the [`ClusterPipeline`] trait:
//! point the pipeline at the node serving a key, queue commands, flush,
//! and either get every reply back or a try-again signal carrying the
//! server's redirect. [`pool::NodePool`] is the production
//! implementation; the functional tests substitute an in-memory one.

pub mod command;
pub mod nodes;
pub mod pool;

use async_trait::async_trait;
use thiserror::Error;

pub use command::{Command, Redirect, RedirectKind, Reply};
pub use nodes::{ClusterMap, ClusterNode, SlotRange, TopologyError};
pub use pool::{NodePool, NodePoolConfig};

/// Outcome of flushing one pipelined batch.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Every queued command produced a reply, in queue order.
    Replies(Vec<Reply>),
    /// The batch must be replayed: the server redirected mid-batch
    /// (`Some`) or the connection dropped (`None`).
    TryAgain(Option<Redirect>),
}

/// Errors from the cluster backend that the driver cannot recover from
/// by replaying a batch.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("connection error: {0}")]
    Connection(#[from] fred::error::Error),

    #[error("no reachable node serves hash slot {0}")]
    NoNode(u16),

    #[error("cluster topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("invalid server address: {0}")]
    InvalidServer(String),
}

/// A pipelined, slot-routed command channel to a Redis deployment.
///
/// The contract mirrors how the lease driver consumes it: `begin`
/// routes to the node serving the key's slot, `enqueue` buffers without
/// flushing, `commit` flushes and collects exactly one reply per queued
/// command, and `follow` re-points the route after a redirect (or
/// re-discovers the topology when the redirect carried no target).
#[async_trait]
pub trait ClusterPipeline {
    async fn begin(&mut self, key: &[u8]) -> Result<(), ClusterError>;

    fn enqueue(&mut self, command: Command);

    async fn commit(&mut self) -> Result<BatchOutcome, ClusterError>;

    async fn follow(&mut self, redirect: Option<&Redirect>) -> Result<(), ClusterError>;
}
