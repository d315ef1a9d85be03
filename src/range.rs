//! Address range parsing and iteration.
//!
//! Operator-supplied ranges come in three shapes: an explicit range
//! `A-B`, a CIDR network `A/N`, or a single host `A`. All three expand
//! to a `(start, end, prefix)` triple where `prefix` is the length of
//! each allocation unit: the family width when allocating individual
//! hosts, shorter when allocating sub-prefixes to downstream routers.
//!
//! CIDR host bits select the start address (`10.0.0.200/24` spans
//! `10.0.0.200-10.0.0.254`), and when allocating full hosts the upper
//! broadcast address of the block is excluded.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::wide::Uint128;

/// Errors produced while parsing a range descriptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("failed parsing \"{0}\" as an address, range or subnet")]
    Malformed(String),

    #[error("start and end address must be of the same address family")]
    FamilyMismatch,

    #[error("end address must be greater than or equal to start address")]
    StartAfterEnd,

    #[error("prefix length must be between {min} and {max}, got {prefix}")]
    PrefixOutOfBounds { prefix: u8, min: u8, max: u8 },

    #[error("prefix length must be less than or equal to {0}")]
    PrefixSpanTooLarge(u8),
}

/// An address tagged with a prefix length.
///
/// Invariant: `prefix <= family_bits(addr)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub prefix: u8,
}

/// Bit width of the address family.
pub fn family_bits(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl IpPrefix {
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        debug_assert!(prefix <= family_bits(&addr));
        Self { addr, prefix }
    }

    /// A single host: prefix is the full family width.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            prefix: family_bits(&addr),
            addr,
        }
    }

    pub fn family_bits(&self) -> u8 {
        family_bits(&self.addr)
    }
}

/// The canonical text form: the address alone for host allocations,
/// `addr/prefix` for sub-prefix allocations. This is the exact string
/// stored as the pool ZSET member and embedded in address keys.
impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix == self.family_bits() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.prefix)
        }
    }
}

/// Parse a range descriptor into `(start, end, prefix)`.
///
/// `alloc_prefix` is the `-p` value; 0 means "use the family width".
/// For `A-B` both endpoints are masked down to the allocation prefix.
/// For `A/N` (and a bare `A`, which is `A/width`) the end address is the
/// top of the block, minus one when full hosts are being allocated so
/// the broadcast address stays out of the pool.
pub fn parse_ip_range(
    text: &str,
    alloc_prefix: u8,
) -> Result<(IpPrefix, IpPrefix, u8), RangeError> {
    if let Some((start_text, end_text)) = text.split_once('-') {
        return parse_explicit_range(text, start_text, end_text, alloc_prefix);
    }

    let (addr, net_prefix) = parse_network(text)?;
    let width = family_bits(&addr);
    let prefix = if alloc_prefix == 0 { width } else { alloc_prefix };

    if prefix < net_prefix || prefix > width {
        return Err(RangeError::PrefixOutOfBounds {
            prefix,
            min: net_prefix,
            max: width,
        });
    }
    if prefix - net_prefix > 64 {
        return Err(RangeError::PrefixSpanTooLarge(net_prefix + 64));
    }

    // The broadcast address only exists when allocating whole hosts;
    // sub-prefix allocations cover the full block.
    let ex_broadcast = prefix == width;

    let start = IpPrefix::new(addr, net_prefix);

    // A /31, /32, /127 or /128 with the broadcast excluded collapses to
    // a single address.
    if ex_broadcast && net_prefix >= width - 1 {
        return Ok((start, start, prefix));
    }

    let end_addr = match addr {
        IpAddr::V4(v4) => {
            let mut ip = u32::from(v4);
            ip |= mask_u32(prefix - net_prefix) << (32 - prefix);
            if ex_broadcast {
                ip -= 1;
            }
            IpAddr::V4(Ipv4Addr::from(ip))
        }
        IpAddr::V6(v6) => {
            let mut ip = Uint128::from_be_bytes(v6.octets());
            let block_top = Uint128::low_bits(prefix - net_prefix).shl(u32::from(128 - prefix));
            ip = ip | block_top;
            if ex_broadcast {
                ip = ip.wrapping_sub(Uint128::ONE);
            }
            IpAddr::V6(Ipv6Addr::from(ip.to_be_bytes()))
        }
    };

    Ok((start, IpPrefix::new(end_addr, net_prefix), prefix))
}

fn parse_explicit_range(
    text: &str,
    start_text: &str,
    end_text: &str,
    alloc_prefix: u8,
) -> Result<(IpPrefix, IpPrefix, u8), RangeError> {
    let start: IpAddr = start_text
        .trim()
        .parse()
        .map_err(|_| RangeError::Malformed(text.to_string()))?;
    let end: IpAddr = end_text
        .trim()
        .parse()
        .map_err(|_| RangeError::Malformed(text.to_string()))?;

    let width = family_bits(&start);
    if width != family_bits(&end) {
        return Err(RangeError::FamilyMismatch);
    }

    let prefix = if alloc_prefix == 0 { width } else { alloc_prefix };
    if prefix > width {
        return Err(RangeError::PrefixOutOfBounds {
            prefix,
            min: 0,
            max: width,
        });
    }

    match (start, end) {
        (IpAddr::V4(s), IpAddr::V4(e)) => {
            if u32::from(s) > u32::from(e) {
                return Err(RangeError::StartAfterEnd);
            }
        }
        (IpAddr::V6(s), IpAddr::V6(e)) => {
            if Uint128::from_be_bytes(s.octets()) > Uint128::from_be_bytes(e.octets()) {
                return Err(RangeError::StartAfterEnd);
            }
        }
        _ => unreachable!("family checked above"),
    }

    // Mask both endpoints so prefix ranges work too.
    Ok((
        IpPrefix::new(mask_addr(start, prefix), prefix),
        IpPrefix::new(mask_addr(end, prefix), prefix),
        prefix,
    ))
}

/// Parse `A` or `A/N` into the address and its network prefix. A bare
/// address is a network of the full family width. Host bits under the
/// mask are kept: they select where in the block iteration starts.
fn parse_network(text: &str) -> Result<(IpAddr, u8), RangeError> {
    let malformed = || RangeError::Malformed(text.to_string());

    match text.split_once('/') {
        None => {
            let addr: IpAddr = text.trim().parse().map_err(|_| malformed())?;
            Ok((addr, family_bits(&addr)))
        }
        Some((addr_text, prefix_text)) => {
            let addr: IpAddr = addr_text.trim().parse().map_err(|_| malformed())?;
            let prefix: u8 = prefix_text.trim().parse().map_err(|_| malformed())?;
            if prefix > family_bits(&addr) {
                return Err(malformed());
            }
            Ok((addr, prefix))
        }
    }
}

/// Keep the top `prefix` bits of an address.
pub fn mask_addr(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = if prefix == 0 {
                Uint128::ZERO
            } else {
                Uint128::low_bits(prefix).shl(u32::from(128 - prefix))
            };
            let masked = Uint128::from_be_bytes(v6.octets()) & mask;
            IpAddr::V6(Ipv6Addr::from(masked.to_be_bytes()))
        }
    }
}

/// A mask with `bits` low bits set, `bits` in [0, 32].
fn mask_u32(bits: u8) -> u32 {
    if bits >= 32 { !0 } else { (1u32 << bits) - 1 }
}

/// Step to the next allocation unit.
///
/// Returns `None` when `current` equals `end` (compared byte-wise over
/// the full address), otherwise the address `2^(width - prefix)` above
/// `current`. A drive loop that emits `current` before stepping yields
/// `end` as its final address.
pub fn step(current: IpAddr, end: IpAddr, prefix: u8) -> Option<IpAddr> {
    if current == end {
        return None;
    }
    match current {
        IpAddr::V4(v4) => {
            debug_assert!((1..=32).contains(&prefix));
            let next = u32::from(v4).wrapping_add(1 << (32 - prefix));
            Some(IpAddr::V4(Ipv4Addr::from(next)))
        }
        IpAddr::V6(v6) => {
            debug_assert!((1..=128).contains(&prefix));
            let cur = Uint128::from_be_bytes(v6.octets());
            let next = cur.wrapping_add(Uint128::ONE.shl(u32::from(128 - prefix)));
            Some(IpAddr::V6(Ipv6Addr::from(next.to_be_bytes())))
        }
    }
}
