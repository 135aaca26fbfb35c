//! Route sets and bypass policies
//!
//! A [`RouteSet`] is the ordered list of blocks a session installs on its
//! tunnel interface. It is derived from a [`BypassPolicy`] and the proxy
//! endpoint, once per session start.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exclude::compute_routes;

/// Which traffic is kept out of the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BypassPolicy {
    /// Route everything except the proxy endpoint
    #[default]
    AutoExcludeProxy,
    /// Route exactly these subnets
    ExplicitSubnets(Vec<IpNet>),
}

impl BypassPolicy {
    /// Build a policy from caller-supplied subnet strings
    ///
    /// An empty list selects [`BypassPolicy::AutoExcludeProxy`]. Otherwise the
    /// entries are validated with [`parse_bypass_subnets`]; malformed ones are
    /// dropped.
    pub fn from_subnets<S: AsRef<str>>(subnets: &[S]) -> Self {
        if subnets.is_empty() {
            return BypassPolicy::AutoExcludeProxy;
        }

        let parsed = parse_bypass_subnets(subnets);
        if parsed.is_empty() {
            log::warn!(
                "None of the {} bypass subnets are valid, no routes will be installed",
                subnets.len()
            );
        }
        BypassPolicy::ExplicitSubnets(parsed)
    }

    /// Check if this policy punches the proxy endpoint out of the default route
    pub fn is_auto(&self) -> bool {
        matches!(self, BypassPolicy::AutoExcludeProxy)
    }
}

/// Parse a single `address/prefix` entry, normalized to its network address
pub fn parse_cidr(entry: &str) -> Result<IpNet> {
    let entry = entry.trim();
    if !entry.contains('/') {
        return Err(Error::InvalidCidr(entry.to_string()));
    }

    let net: IpNet = entry
        .parse()
        .map_err(|_| Error::InvalidCidr(entry.to_string()))?;

    let normalized = net.trunc();
    if normalized != net {
        log::debug!("Normalized bypass subnet {} to {}", net, normalized);
    }
    Ok(normalized)
}

/// Validate caller-supplied bypass subnets
///
/// Each entry must be `address/prefix`. Malformed entries are dropped with a
/// warning; the order of the valid ones is preserved.
pub fn parse_bypass_subnets<S: AsRef<str>>(subnets: &[S]) -> Vec<IpNet> {
    subnets
        .iter()
        .filter_map(|entry| match parse_cidr(entry.as_ref()) {
            Ok(net) => Some(net),
            Err(e) => {
                log::warn!("Dropping bypass subnet: {}", e);
                None
            }
        })
        .collect()
}

/// Ordered set of blocks to install as tunnel routes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteSet {
    routes: Vec<IpNet>,
}

impl RouteSet {
    /// Create an empty route set
    pub fn new() -> Self {
        Self::default()
    }

    /// Route set covering the whole IPv4 space
    pub fn default_v4() -> Self {
        Self {
            routes: vec![IpNet::V4(Ipv4Net::default())],
        }
    }

    /// Derive the route set for a policy and (optional) proxy endpoint
    ///
    /// - Explicit subnets are passed through as-is.
    /// - Auto exclusion punches `endpoint` out of `0.0.0.0/0` when an endpoint
    ///   address is known, otherwise routes `0.0.0.0/0` unchanged.
    pub fn for_policy(policy: &BypassPolicy, endpoint: Option<Ipv4Addr>) -> Result<Self> {
        match policy {
            BypassPolicy::ExplicitSubnets(subnets) => Ok(Self {
                routes: subnets.clone(),
            }),
            BypassPolicy::AutoExcludeProxy => {
                let routes = compute_routes(Ipv4Net::default(), endpoint)?;
                Ok(Self::from_v4(routes))
            }
        }
    }

    /// Wrap a list of IPv4 blocks
    pub fn from_v4(routes: Vec<Ipv4Net>) -> Self {
        Self {
            routes: routes.into_iter().map(IpNet::V4).collect(),
        }
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if there are no routes
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Iterate over the routes in install order
    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.routes.iter()
    }

    /// Borrow the routes as a slice
    pub fn as_slice(&self) -> &[IpNet] {
        &self.routes
    }

    /// Check if any route covers the address
    pub fn covers(&self, addr: Ipv4Addr) -> bool {
        self.routes.iter().any(|net| match net {
            IpNet::V4(v4) => v4.contains(&addr),
            IpNet::V6(_) => false,
        })
    }
}

impl<'a> IntoIterator for &'a RouteSet {
    type Item = &'a IpNet;
    type IntoIter = std::slice::Iter<'a, IpNet>;

    fn into_iter(self) -> Self::IntoIter {
        self.routes.iter()
    }
}

impl fmt::Display for RouteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, net) in self.routes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", net)?;
        }
        Ok(())
    }
}
