//! The pipelined batch driver.
//!
//! Walks an operation's address range in ascending order, queuing each
//! address's commands until the pipeline is full, flushing, and feeding
//! the replies back to the action's processor. On a slot redirect the
//! whole in-flight batch is discarded and replayed from the last
//! acknowledged address; the actions' idempotent designs make the
//! replay safe.

use tracing::debug;

use crate::actions::LeaseAction;
use crate::cluster::{BatchOutcome, ClusterError, ClusterPipeline};
use crate::keys;
use crate::range::{IpPrefix, step};
use crate::run::Operation;

use thiserror::Error;

/// Maximum replies owed on one connection before synchronising with the
/// server. Bounds per-batch memory regardless of range size.
pub const MAX_PIPELINED: usize = 1000;

/// Consecutive replays tolerated for a single batch before giving up.
const MAX_BATCH_RETRIES: u32 = 8;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("giving up on batch after {0} redirects")]
    RedirectLoop(u32),
}

/// Drive one operation: iterate `[start, end]` in allocation-prefix
/// steps, pipelining up to [`MAX_PIPELINED`] replies per batch.
///
/// The cursor is checkpointed before each batch; a try-again from the
/// backend rewinds to the checkpoint, re-routes, and replays. Replies
/// are demuxed positionally: every address owes exactly
/// `A::REPLY_COUNT` replies and its processor sees the last one.
pub async fn run_lease_op<A, C>(
    cluster: &mut C,
    op: &Operation,
    action: &A,
    out: &mut A::Output,
) -> Result<(), PoolError>
where
    A: LeaseAction,
    C: ClusterPipeline,
{
    let route_key = keys::pool_key(&op.pool);
    let mut cursor = op.start.addr;
    let mut more = true;

    while more {
        // Checkpoint before submitting; a redirect rewinds to here.
        let acked = cursor;
        let mut attempts = 0u32;

        let replies = loop {
            cluster.begin(&route_key).await?;

            let mut owed = 0usize;
            while owed < MAX_PIPELINED && more {
                let addr = IpPrefix::new(cursor, op.prefix);
                for command in action.commands(&op.pool, &addr) {
                    cluster.enqueue(command);
                    owed += 1;
                }
                match step(cursor, op.end.addr, op.prefix) {
                    Some(next) => cursor = next,
                    None => more = false,
                }
            }

            match cluster.commit().await? {
                BatchOutcome::Replies(replies) => break replies,
                BatchOutcome::TryAgain(redirect) => {
                    attempts += 1;
                    if attempts >= MAX_BATCH_RETRIES {
                        return Err(PoolError::RedirectLoop(attempts));
                    }
                    debug!(attempts, "batch redirected, rewinding to checkpoint");
                    // Anything the server applied before the redirect is
                    // replayed harmlessly; the scripts are idempotent.
                    cursor = acked;
                    more = true;
                    cluster.follow(redirect.as_ref()).await?;
                }
            }
        };

        // Replies line up with addresses in submission order; walk both
        // together from the checkpoint. A malformed reply skips its
        // address but never desynchronises the walk.
        let mut to_process = acked;
        for chunk in replies.chunks(A::REPLY_COUNT) {
            let addr = IpPrefix::new(to_process, op.prefix);
            if let Some(last) = chunk.last() {
                if let Err(error) = action.process(out, &addr, last) {
                    debug!(address = %addr, %error, "skipping malformed reply");
                }
            }
            match step(to_process, op.end.addr, op.prefix) {
                Some(next) => to_process = next,
                None => break,
            }
        }
    }

    Ok(())
}
