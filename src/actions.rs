//! Per-action command builders and reply processors.
//!
//! Each pool action is a [`LeaseAction`]: it knows the fixed command
//! sequence to queue for one address and how to fold that address's
//! reply into its typed accumulator. The fixed per-address reply count
//! is what lets the driver demux a pipelined batch positionally.
//!
//! REMOVE and RELEASE run as server-side Lua scripts so the ZSET entry,
//! the address hash and the device reverse key stay consistent even
//! when the tool races the live allocator. All three actions are
//! idempotent, which is what makes replaying a redirected batch safe:
//! `ZADD NX` skips existing members, a second removal removes nothing,
//! and `ZADD XX CH` reports no change the second time around.

use thiserror::Error;
use tracing::debug;

use crate::cluster::{Command, Reply};
use crate::keys;
use crate::range::IpPrefix;

/// Releasing a lease.
///
/// - `KEYS[1]` the pool id.
/// - `ARGV[1]` the address text to release.
///
/// Zeroes the expiry score and unlinks the device, without touching the
/// address hash or the ZSET membership. Does nothing if the address is
/// not in the pool.
///
/// Returns 1 if an address was released, 0 otherwise.
pub const RELEASE_SCRIPT: &str = r#"local ret = redis.call('ZADD', '{' .. KEYS[1] .. '}:pool', 'XX', 'CH', 0, ARGV[1])
if ret == 0 then
  return 0
end
local found = redis.call('HGET', '{' .. KEYS[1] .. '}:ip:' .. ARGV[1], 'device')
if not found then
  return ret
end
redis.call('DEL', '{' .. KEYS[1] .. '}:device:' .. found)
return 1
"#;

/// Removing a lease.
///
/// - `KEYS[1]` the pool id.
/// - `ARGV[1]` the address text to remove.
///
/// Removes the ZSET entry, the address hash, and the device reverse key
/// if one exists. Works with partially removed addresses (ZSET entry
/// already gone but the hash or device key left behind).
///
/// Returns 1 if the ZSET entry was removed, 0 otherwise.
pub const REMOVE_SCRIPT: &str = r#"local ret = redis.call('ZREM', '{' .. KEYS[1] .. '}:pool', ARGV[1])
local address_key = '{' .. KEYS[1] .. '}:ip:' .. ARGV[1]
local found = redis.call('HGET', address_key, 'device')
if found then
  redis.call('DEL', '{' .. KEYS[1] .. '}:device:' .. found)
end
redis.call('DEL', address_key)
return ret
"#;

/// A reply that did not have the shape the action expected. The batch
/// continues; the malformed address is skipped.
#[derive(Error, Debug)]
pub enum ReplyError {
    #[error("expected {expected} reply, got {got}")]
    UnexpectedType {
        expected: &'static str,
        got: &'static str,
    },

    #[error("expected at least {expected} elements, got {got}")]
    TooFewElements { expected: usize, got: usize },

    #[error("malformed lease score: {0}")]
    BadScore(String),
}

/// A lease record assembled from SHOW replies.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub ipaddr: IpPrefix,
    /// Expiry as seconds since the epoch; 0 means free or released.
    pub next_event: i64,
    pub range: Option<Vec<u8>>,
    pub device: Option<Vec<u8>>,
    pub gateway: Option<Vec<u8>>,
}

/// One pool action: the commands to queue per address and the fold over
/// that address's reply.
///
/// `REPLY_COUNT` is the exact number of replies the queued commands
/// produce; `process` receives the last of them (the `EXEC` array for
/// transactional actions, the script's integer otherwise).
pub trait LeaseAction {
    type Output;

    const REPLY_COUNT: usize;

    fn commands(&self, pool: &[u8], addr: &IpPrefix) -> Vec<Command>;

    fn process(
        &self,
        out: &mut Self::Output,
        addr: &IpPrefix,
        reply: &Reply,
    ) -> Result<(), ReplyError>;
}

/// ADD: insert addresses with a zero expiry, leaving existing members
/// untouched.
pub struct AddAction {
    range: Vec<u8>,
}

impl AddAction {
    /// `range` tags every added address with the range id it came from;
    /// an absent id stores an empty tag so the command sequence (and so
    /// the reply count) stays fixed.
    pub fn new(range: Option<Vec<u8>>) -> Self {
        Self {
            range: range.unwrap_or_default(),
        }
    }
}

impl LeaseAction for AddAction {
    type Output = u64;

    const REPLY_COUNT: usize = 4;

    fn commands(&self, pool: &[u8], addr: &IpPrefix) -> Vec<Command> {
        let text = addr.to_string();
        debug!(address = %text, pool = %String::from_utf8_lossy(pool), "adding to pool");
        vec![
            Command::new("MULTI"),
            Command::new("ZADD")
                .arg(keys::pool_key(pool))
                .arg("NX")
                .arg("0")
                .arg(text.clone()),
            Command::new("HSET")
                .arg(keys::address_key(pool, addr))
                .arg("range")
                .arg(self.range.clone()),
            Command::new("EXEC"),
        ]
    }

    fn process(
        &self,
        out: &mut Self::Output,
        _addr: &IpPrefix,
        reply: &Reply,
    ) -> Result<(), ReplyError> {
        // Only addresses actually inserted count; ZADD NX reports 0 for
        // members that already existed.
        let elements = reply.as_array().ok_or(ReplyError::UnexpectedType {
            expected: "array",
            got: reply.kind(),
        })?;
        if let Some(added) = elements.first().and_then(Reply::as_integer) {
            *out += added as u64;
        }
        Ok(())
    }
}

/// REMOVE: delete addresses and every piece of state attached to them.
pub struct RemoveAction;

impl LeaseAction for RemoveAction {
    type Output = u64;

    const REPLY_COUNT: usize = 1;

    fn commands(&self, pool: &[u8], addr: &IpPrefix) -> Vec<Command> {
        let text = addr.to_string();
        debug!(address = %text, pool = %String::from_utf8_lossy(pool), "removing from pool");
        vec![script_command(REMOVE_SCRIPT, pool, text)]
    }

    fn process(
        &self,
        out: &mut Self::Output,
        _addr: &IpPrefix,
        reply: &Reply,
    ) -> Result<(), ReplyError> {
        *out += integer_reply(reply)? as u64;
        Ok(())
    }
}

/// RELEASE: zero the expiry and unlink the holding device.
pub struct ReleaseAction;

impl LeaseAction for ReleaseAction {
    type Output = u64;

    const REPLY_COUNT: usize = 1;

    fn commands(&self, pool: &[u8], addr: &IpPrefix) -> Vec<Command> {
        let text = addr.to_string();
        debug!(address = %text, pool = %String::from_utf8_lossy(pool), "releasing");
        vec![script_command(RELEASE_SCRIPT, pool, text)]
    }

    fn process(
        &self,
        out: &mut Self::Output,
        _addr: &IpPrefix,
        reply: &Reply,
    ) -> Result<(), ReplyError> {
        // Leases that already had a zero score are not counted.
        *out += integer_reply(reply)? as u64;
        Ok(())
    }
}

/// SHOW: read the expiry score and the address hash fields.
pub struct ShowAction;

impl LeaseAction for ShowAction {
    type Output = Vec<Lease>;

    const REPLY_COUNT: usize = 6;

    fn commands(&self, pool: &[u8], addr: &IpPrefix) -> Vec<Command> {
        let text = addr.to_string();
        debug!(address = %text, pool = %String::from_utf8_lossy(pool), "retrieving lease info");
        let address_key = keys::address_key(pool, addr);
        vec![
            Command::new("MULTI"),
            Command::new("ZSCORE").arg(keys::pool_key(pool)).arg(text),
            Command::new("HGET").arg(address_key.clone()).arg("device"),
            Command::new("HGET").arg(address_key.clone()).arg("gateway"),
            Command::new("HGET").arg(address_key).arg("range"),
            Command::new("EXEC"),
        ]
    }

    fn process(
        &self,
        out: &mut Self::Output,
        addr: &IpPrefix,
        reply: &Reply,
    ) -> Result<(), ReplyError> {
        let elements = reply.as_array().ok_or(ReplyError::UnexpectedType {
            expected: "array",
            got: reply.kind(),
        })?;
        if elements.len() < 4 {
            return Err(ReplyError::TooFewElements {
                expected: 4,
                got: elements.len(),
            });
        }

        // An address that is not a pool member has a nil score; there is
        // no lease to report.
        let score = elements[0].as_bulk().ok_or(ReplyError::UnexpectedType {
            expected: "bulk string",
            got: elements[0].kind(),
        })?;
        let next_event = parse_score(score)?;

        out.push(Lease {
            ipaddr: *addr,
            next_event,
            device: elements[1].as_bulk().map(<[u8]>::to_vec),
            gateway: elements[2].as_bulk().map(<[u8]>::to_vec),
            range: elements[3].as_bulk().map(<[u8]>::to_vec),
        });
        Ok(())
    }
}

fn script_command(script: &'static str, pool: &[u8], addr_text: String) -> Command {
    Command::new("EVAL")
        .arg(script)
        .arg("1")
        .arg(pool.to_vec())
        .arg(addr_text)
}

fn integer_reply(reply: &Reply) -> Result<i64, ReplyError> {
    reply.as_integer().ok_or(ReplyError::UnexpectedType {
        expected: "integer",
        got: reply.kind(),
    })
}

/// ZSET scores come back as numeric strings; expiry times are whole
/// seconds but the server may render a float.
fn parse_score(score: &[u8]) -> Result<i64, ReplyError> {
    let text = std::str::from_utf8(score)
        .map_err(|_| ReplyError::BadScore(String::from_utf8_lossy(score).into_owned()))?;
    if let Ok(value) = text.parse::<i64>() {
        return Ok(value);
    }
    text.parse::<f64>()
        .map(|value| value as i64)
        .map_err(|_| ReplyError::BadScore(text.to_string()))
}
