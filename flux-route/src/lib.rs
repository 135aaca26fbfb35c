//! Route computation for tunnel sessions
//!
//! This crate decides which IPv4/IPv6 ranges a tunnel session advertises as
//! routes. It has no platform code: the output is a [`RouteSet`] that a host
//! installs on its tunnel interface however it likes.
//!
//! # Features
//!
//! - **Punch-hole exclusion**: cover a CIDR block minus one address with the
//!   minimal set of disjoint blocks, so the proxy server's own address never
//!   loops back into the tunnel
//! - **Bypass subnets**: validate and normalize user-supplied `address/prefix`
//!   lists, dropping malformed entries
//! - **Policy selection**: pick between the two from a [`BypassPolicy`]
//!
//! # Example
//!
//! ```
//! use std::net::Ipv4Addr;
//! use flux_route::{BypassPolicy, RouteSet};
//!
//! let routes = RouteSet::for_policy(
//!     &BypassPolicy::AutoExcludeProxy,
//!     Some(Ipv4Addr::new(93, 184, 216, 34)),
//! ).unwrap();
//!
//! assert_eq!(routes.len(), 32);
//! ```

pub mod error;
pub mod exclude;
pub mod route;

pub use error::{Error, Result};
pub use exclude::{compute_routes, exclude_address, prefix_mask, RouteOutcome};
pub use route::{parse_bypass_subnets, BypassPolicy, RouteSet};

/// Covering block used when the whole IPv4 space is routed into the tunnel
pub const DEFAULT_ROUTE_V4: &str = "0.0.0.0/0";
