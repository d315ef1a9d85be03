//! redis-ippool-tool library crate
//!
//! Management operations for Redis-backed IP address lease pools:
//! range parsing, the pipelined cluster driver, and the per-action
//! command builders and reply processors.

pub mod actions;
pub mod cluster;
pub mod config;
pub mod keys;
pub mod pipeline;
pub mod range;
pub mod run;
pub mod wide;

pub use actions::{AddAction, Lease, LeaseAction, ReleaseAction, RemoveAction, ShowAction};
pub use cluster::{BatchOutcome, ClusterError, ClusterPipeline, NodePool, NodePoolConfig};
pub use pipeline::{MAX_PIPELINED, PoolError, run_lease_op};
pub use range::{IpPrefix, RangeError, parse_ip_range};
pub use run::{Action, Operation, run_operations};
