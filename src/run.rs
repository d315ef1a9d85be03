//! Operation orchestration and operator-facing output.
//!
//! Each command-line action becomes an [`Operation`]; they run serially
//! in argument order. Mutating actions report an aggregate count;
//! SHOW prints one record per lease in iteration order.

use std::fmt;

use jiff::Timestamp;
use jiff::tz::TimeZone;

use crate::actions::{AddAction, Lease, ReleaseAction, RemoveAction, ShowAction};
use crate::cluster::ClusterPipeline;
use crate::pipeline::{PoolError, run_lease_op};
use crate::range::{IpPrefix, RangeError, parse_ip_range};

/// What to do to the leases described by a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
    Release,
    Show,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => write!(f, "add"),
            Action::Remove => write!(f, "remove"),
            Action::Release => write!(f, "release"),
            Action::Show => write!(f, "show"),
        }
    }
}

/// A single pool operation, parsed and validated.
#[derive(Debug, Clone)]
pub struct Operation {
    pub action: Action,
    /// The range text as the operator typed it.
    pub name: String,
    pub pool: Vec<u8>,
    pub range: Option<Vec<u8>>,
    pub start: IpPrefix,
    pub end: IpPrefix,
    /// Length of each allocation unit.
    pub prefix: u8,
}

impl Operation {
    /// Parse and validate one operation. `alloc_prefix` 0 means the
    /// family width (allocate individual hosts).
    pub fn parse(
        action: Action,
        text: &str,
        pool: Vec<u8>,
        range: Option<Vec<u8>>,
        alloc_prefix: u8,
    ) -> Result<Self, RangeError> {
        let (start, end, prefix) = parse_ip_range(text, alloc_prefix)?;
        Ok(Self {
            action,
            name: text.to_string(),
            pool,
            range,
            start,
            end,
            prefix,
        })
    }
}

/// Run every operation in order, printing results as they complete.
pub async fn run_operations<C>(cluster: &mut C, operations: &[Operation]) -> Result<(), PoolError>
where
    C: ClusterPipeline,
{
    for op in operations {
        match op.action {
            Action::Add => {
                let mut count = 0u64;
                run_lease_op(cluster, op, &AddAction::new(op.range.clone()), &mut count).await?;
                println!("Added {count} addresses/prefixes");
            }
            Action::Remove => {
                let mut count = 0u64;
                run_lease_op(cluster, op, &RemoveAction, &mut count).await?;
                println!("Removed {count} addresses/prefixes");
            }
            Action::Release => {
                let mut count = 0u64;
                run_lease_op(cluster, op, &ReleaseAction, &mut count).await?;
                println!("Released {count} addresses/prefixes");
            }
            Action::Show => {
                let mut leases = Vec::new();
                run_lease_op(cluster, op, &ShowAction, &mut leases).await?;
                print_leases(&leases, Timestamp::now().as_second());
            }
        }
    }
    Ok(())
}

/// Render SHOW results. Fields that are absent or empty are omitted;
/// the labels differ for active and expired leases.
pub fn print_leases(leases: &[Lease], now: i64) {
    println!("Retrieved information for {} addresses/prefixes", leases.len());
    for lease in leases {
        let active = now <= lease.next_event;
        let expiry = (lease.next_event != 0).then(|| format_expiry(lease.next_event));

        println!("--");
        if let Some(range) = present(&lease.range) {
            println!("range           : {}", String::from_utf8_lossy(range));
        }
        println!("address/prefix  : {}", lease.ipaddr);
        println!("active          : {}", if active { "yes" } else { "no" });
        if active {
            if let Some(expiry) = expiry {
                println!("lease expires   : {expiry}");
            }
            if let Some(device) = present(&lease.device) {
                println!("device id       : {}", String::from_utf8_lossy(device));
            }
            if let Some(gateway) = present(&lease.gateway) {
                println!("gateway id      : {}", String::from_utf8_lossy(gateway));
            }
        } else {
            if let Some(expiry) = expiry {
                println!("lease expired   : {expiry}");
            }
            if let Some(device) = present(&lease.device) {
                println!("last device id  : {}", String::from_utf8_lossy(device));
            }
            if let Some(gateway) = present(&lease.gateway) {
                println!("last gateway id : {}", String::from_utf8_lossy(gateway));
            }
        }
    }
}

fn present(field: &Option<Vec<u8>>) -> Option<&Vec<u8>> {
    field.as_ref().filter(|bytes| !bytes.is_empty())
}

/// `Jul 24 2016 09:47:19 BST`-style rendering in the local time zone.
fn format_expiry(next_event: i64) -> String {
    match Timestamp::from_second(next_event) {
        Ok(ts) => ts
            .to_zoned(TimeZone::system())
            .strftime("%b %e %Y %H:%M:%S %Z")
            .to_string(),
        Err(_) => next_event.to_string(),
    }
}
