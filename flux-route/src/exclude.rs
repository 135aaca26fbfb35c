//! Punch-hole route exclusion
//!
//! Given a covering block and one address that must stay outside the tunnel,
//! produce the disjoint blocks whose union is the covering block minus that
//! single address. All arithmetic is done on host-order `u32` values of the
//! network-order address bytes.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Result of excluding an address from a covering block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Nothing to exclude, or the address lies outside the block
    Unchanged(Ipv4Net),
    /// The block was split around the excluded address
    Punched(Vec<Ipv4Net>),
    /// The block holds at most two addresses, so no routes are produced
    Degenerate(Ipv4Net),
}

impl RouteOutcome {
    /// Flatten the outcome into the routes to install
    pub fn into_routes(self) -> Vec<Ipv4Net> {
        match self {
            RouteOutcome::Unchanged(net) => vec![net],
            RouteOutcome::Punched(routes) => routes,
            RouteOutcome::Degenerate(_) => Vec::new(),
        }
    }

    /// Check if the outcome is the degenerate "no routes" case
    pub fn is_degenerate(&self) -> bool {
        matches!(self, RouteOutcome::Degenerate(_))
    }
}

/// Netmask for a prefix length as a `u32`
///
/// A prefix of 0 yields an all-zero mask without shifting by 32.
pub fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn block(start: u32, prefix: u8) -> Result<Ipv4Net> {
    Ipv4Net::new(Ipv4Addr::from(start), prefix)
        .map_err(|e| Error::InvalidPrefix(format!("/{}: {}", prefix, e)))
}

/// Exclude a single address from a covering block
///
/// The covering block is truncated to its network address first, so
/// `10.1.2.3/8` is treated as `10.0.0.0/8`.
pub fn exclude_address(target: Ipv4Net, exclude: Option<Ipv4Addr>) -> Result<RouteOutcome> {
    let prefix = target.prefix_len();
    let mask = prefix_mask(prefix);
    let network_start = u32::from(target.addr()) & mask;
    let network_end = network_start | !mask;
    let target = block(network_start, prefix)?;

    let Some(exclude) = exclude else {
        return Ok(RouteOutcome::Unchanged(target));
    };
    let excluded = u32::from(exclude);

    if excluded < network_start || excluded > network_end {
        return Ok(RouteOutcome::Unchanged(target));
    }

    if prefix >= 31 {
        log::warn!(
            "{} is too small to exclude {}, producing no routes",
            target,
            exclude
        );
        return Ok(RouteOutcome::Degenerate(target));
    }

    let mut routes = Vec::with_capacity(usize::from(32 - prefix));
    let mut start = network_start;
    let mut current = prefix;

    // Bisect toward the excluded address, keeping the sibling half each step.
    // The final /32 is the excluded address itself and is dropped.
    while current < 32 {
        let child = current + 1;
        let half = 1u32 << (32 - u32::from(child));
        let upper = start + half;

        if excluded >= upper {
            routes.push(block(start, child)?);
            start = upper;
        } else {
            routes.push(block(upper, child)?);
        }
        current = child;
    }

    routes.sort_by_key(|net| u32::from(net.network()));
    Ok(RouteOutcome::Punched(routes))
}

/// Compute the routes covering `target` minus `exclude`
///
/// Returns `[target]` if `exclude` is `None` or lies outside `target`, and an
/// empty list if `target` is a /31 or /32.
pub fn compute_routes(target: Ipv4Net, exclude: Option<Ipv4Addr>) -> Result<Vec<Ipv4Net>> {
    exclude_address(target, exclude).map(RouteOutcome::into_routes)
}
