//! Redis key construction for the lease pool schema.
//!
//! Every key for a pool embeds the pool id inside hash-tag braces so the
//! whole pool hashes to a single cluster slot. The braces enclose ONLY
//! the pool id: `{<pool>}:pool`, `{<pool>}:ip:<addr>` and
//! `{<pool>}:device:<devid>` must all land on the same node for the
//! MULTI blocks and Lua scripts to execute atomically.

use crate::range::IpPrefix;

/// Suffix of the ZSET holding the pool members and their expiry scores.
pub const POOL_SUFFIX: &str = "pool";
/// Suffix of the per-address hash (`device`, `gateway`, `range` fields).
pub const ADDRESS_SUFFIX: &str = "ip";
/// Suffix of the device-to-address reverse mapping.
pub const DEVICE_SUFFIX: &str = "device";

/// `{<pool>}:pool`
pub fn pool_key(pool: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(pool.len() + POOL_SUFFIX.len() + 3);
    key.push(b'{');
    key.extend_from_slice(pool);
    key.extend_from_slice(b"}:");
    key.extend_from_slice(POOL_SUFFIX.as_bytes());
    key
}

/// `{<pool>}:ip:<addr>` where `<addr>` is the canonical address text.
pub fn address_key(pool: &[u8], addr: &IpPrefix) -> Vec<u8> {
    let text = addr.to_string();
    let mut key = Vec::with_capacity(pool.len() + ADDRESS_SUFFIX.len() + text.len() + 4);
    key.push(b'{');
    key.extend_from_slice(pool);
    key.extend_from_slice(b"}:");
    key.extend_from_slice(ADDRESS_SUFFIX.as_bytes());
    key.push(b':');
    key.extend_from_slice(text.as_bytes());
    key
}

/// `{<pool>}:device:<devid>`
pub fn device_key(pool: &[u8], device: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(pool.len() + DEVICE_SUFFIX.len() + device.len() + 4);
    key.push(b'{');
    key.extend_from_slice(pool);
    key.extend_from_slice(b"}:");
    key.extend_from_slice(DEVICE_SUFFIX.as_bytes());
    key.push(b':');
    key.extend_from_slice(device);
    key
}
