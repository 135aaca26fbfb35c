//! Coverage checks for punch-hole route exclusion
//!
//! These tests verify the route set as a whole rather than sampling
//! addresses: blocks are walked in order and their boundaries compared, so
//! any gap or overlap anywhere in the address space is caught.

use std::net::Ipv4Addr;

use flux_route::{compute_routes, exclude_address, RouteOutcome};
use ipnet::Ipv4Net;

fn bounds(net: &Ipv4Net) -> (u64, u64) {
    (
        u64::from(u32::from(net.network())),
        u64::from(u32::from(net.broadcast())),
    )
}

/// Walk sorted blocks and assert they tile `target` with exactly one hole at
/// `exclude`.
fn assert_exact_cover(target: Ipv4Net, exclude: Ipv4Addr, routes: &[Ipv4Net]) {
    let (target_start, target_end) = bounds(&target);
    let hole = u64::from(u32::from(exclude));

    let mut sorted = routes.to_vec();
    sorted.sort_by_key(|n| u32::from(n.network()));

    let mut cursor = target_start;
    let mut skipped_hole = false;

    for net in &sorted {
        let (start, end) = bounds(net);
        assert!(
            !(start..=end).contains(&hole),
            "{} contains excluded {}",
            net,
            exclude
        );

        if start != cursor {
            assert!(
                !skipped_hole && cursor == hole && start == hole + 1,
                "gap before {} (cursor {}, target {}, exclude {})",
                net,
                Ipv4Addr::from(cursor as u32),
                target,
                exclude
            );
            skipped_hole = true;
        }
        cursor = end + 1;
    }

    if cursor != target_end + 1 {
        assert!(
            !skipped_hole && cursor == hole && hole == target_end,
            "cover ends early at {} for {} minus {}",
            Ipv4Addr::from(cursor as u32),
            target,
            exclude
        );
        skipped_hole = true;
    }

    assert!(skipped_hole, "excluded address was never skipped");
}

/// Small deterministic generator so the sweep is reproducible
struct Lcg(u64);

impl Lcg {
    fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 32) as u32
    }
}

#[test]
fn test_default_route_minus_single_address() {
    let target: Ipv4Net = "0.0.0.0/0".parse().unwrap();
    let exclude = Ipv4Addr::new(93, 184, 216, 34);

    let routes = compute_routes(target, Some(exclude)).unwrap();

    assert_eq!(routes.len(), 32);
    assert_exact_cover(target, exclude, &routes);

    // One block of every prefix length from /1 to /32
    let mut prefixes: Vec<u8> = routes.iter().map(|n| n.prefix_len()).collect();
    prefixes.sort_unstable();
    assert_eq!(prefixes, (1..=32).collect::<Vec<u8>>());

    // The /32 neighbour of the excluded address is kept
    assert!(routes.contains(&"93.184.216.35/32".parse().unwrap()));
    assert!(routes.contains(&"0.0.0.0/2".parse().unwrap()));
    assert!(routes.contains(&"128.0.0.0/1".parse().unwrap()));
}

#[test]
fn test_cover_holds_across_prefixes() {
    let mut rng = Lcg(0x5eed);

    for prefix in 0u8..31 {
        for _ in 0..64 {
            let base = rng.next_u32();
            let target = Ipv4Net::new(Ipv4Addr::from(base), prefix).unwrap().trunc();
            let size_mask = if prefix == 0 {
                u32::MAX
            } else {
                !(u32::MAX << (32 - u32::from(prefix)))
            };
            let offset = rng.next_u32() & size_mask;
            let exclude = Ipv4Addr::from(u32::from(target.network()) | offset);

            let routes = compute_routes(target, Some(exclude)).unwrap();
            assert_eq!(routes.len(), usize::from(32 - prefix));
            assert_exact_cover(target, exclude, &routes);
        }
    }
}

#[test]
fn test_cover_at_block_edges() {
    for prefix in [0u8, 1, 8, 16, 24, 30] {
        let target = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), prefix).unwrap().trunc();
        for exclude in [target.network(), target.broadcast()] {
            let routes = compute_routes(target, Some(exclude)).unwrap();
            assert_exact_cover(target, exclude, &routes);
        }
    }
}

#[test]
fn test_exclude_outside_returns_target() {
    let target: Ipv4Net = "172.16.0.0/12".parse().unwrap();
    for exclude in [
        Ipv4Addr::new(172, 15, 255, 255),
        Ipv4Addr::new(172, 32, 0, 0),
        Ipv4Addr::new(8, 8, 8, 8),
    ] {
        let outcome = exclude_address(target, Some(exclude)).unwrap();
        assert_eq!(outcome, RouteOutcome::Unchanged(target));
    }
}

#[test]
fn test_tiny_targets_produce_no_routes() {
    for cidr in ["10.0.0.0/31", "10.0.0.1/32"] {
        let target: Ipv4Net = cidr.parse().unwrap();
        let routes = compute_routes(target, Some(target.network())).unwrap();
        assert!(routes.is_empty(), "{} should produce no routes", cidr);
    }
}

#[test]
fn test_routes_are_sorted_and_disjoint() {
    let target: Ipv4Net = "0.0.0.0/0".parse().unwrap();
    let routes = compute_routes(target, Some(Ipv4Addr::new(203, 0, 113, 9))).unwrap();

    for pair in routes.windows(2) {
        let (_, prev_end) = bounds(&pair[0]);
        let (next_start, _) = bounds(&pair[1]);
        assert!(prev_end < next_start, "{} overlaps {}", pair[0], pair[1]);
    }
}
