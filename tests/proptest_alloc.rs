use std::collections::HashSet;
use std::net::Ipv4Addr;

use proptest::prelude::*;

use dhcpallot::packet::{ClientMessage, HwAddr, MessageKind, RelayAgentInfo};
use dhcpallot::{ident, Allocator, AllocatorKind, IdentifierKind, Pool};

const POOL_BASE: u32 = u32::from_be_bytes([10, 0, 0, 0]);

fn pool_strategy() -> impl Strategy<Value = Vec<Pool>> {
    // up to three disjoint pools carved out of 10.0.0.0/16
    prop::collection::vec((0u32..1024, 1u32..64), 1..=3).prop_map(|specs| {
        let mut pools = Vec::new();
        let mut next_start = POOL_BASE;
        for (gap, size) in specs {
            let start = next_start + gap;
            let end = start + size - 1;
            pools.push(Pool::new(Ipv4Addr::from(start), Ipv4Addr::from(end)));
            next_start = end + 2;
        }
        pools
    })
}

fn exclusions(pools: &[Pool], seeds: &[u32]) -> HashSet<Ipv4Addr> {
    let all: Vec<Ipv4Addr> = pools
        .iter()
        .flat_map(|pool| {
            (u32::from(pool.start)..=u32::from(pool.end)).map(Ipv4Addr::from)
        })
        .collect();
    seeds
        .iter()
        .map(|seed| all[*seed as usize % all.len()])
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn allocator_never_leaves_the_pool_set(
        pools in pool_strategy(),
        random in any::<bool>(),
        rounds in 1usize..40,
    ) {
        let kind = if random { AllocatorKind::Random } else { AllocatorKind::Iterative };
        let allocator = Allocator::new(kind, pools);
        let exclude = HashSet::new();

        for _ in 0..rounds {
            if let Some(addr) = allocator.allocate(&exclude, None) {
                prop_assert!(allocator.pool_set().contains(addr));
            }
        }
    }

    #[test]
    fn allocator_never_returns_an_excluded_address(
        pools in pool_strategy(),
        random in any::<bool>(),
        seeds in prop::collection::vec(any::<u32>(), 0..32),
    ) {
        let kind = if random { AllocatorKind::Random } else { AllocatorKind::Iterative };
        let exclude = exclusions(&pools, &seeds);
        let allocator = Allocator::new(kind, pools);

        match allocator.allocate(&exclude, None) {
            Some(addr) => prop_assert!(!exclude.contains(&addr)),
            None => prop_assert!(exclude.len() as u64 >= allocator.pool_set().size()),
        }
    }

    #[test]
    fn accumulating_exclusions_exhausts_without_repeats(
        pools in pool_strategy(),
        random in any::<bool>(),
    ) {
        let kind = if random { AllocatorKind::Random } else { AllocatorKind::Iterative };
        let allocator = Allocator::new(kind, pools);
        let total = allocator.pool_set().size();

        // draining the pool one exclusion at a time must hand out every
        // address exactly once and then report exhaustion
        let mut seen = HashSet::new();
        while let Some(addr) = allocator.allocate(&seen, None) {
            prop_assert!(seen.insert(addr), "{} repeated", addr);
            prop_assert!(seen.len() as u64 <= total);
        }
        prop_assert_eq!(seen.len() as u64, total);
    }

    #[test]
    fn hint_is_honored_exactly_when_free_and_poolable(
        pools in pool_strategy(),
        random in any::<bool>(),
        hint_raw in any::<u32>(),
        seeds in prop::collection::vec(any::<u32>(), 0..8),
    ) {
        let kind = if random { AllocatorKind::Random } else { AllocatorKind::Iterative };
        let exclude = exclusions(&pools, &seeds);
        let allocator = Allocator::new(kind, pools);
        let hint = Ipv4Addr::from(POOL_BASE + hint_raw % 2048);

        let granted = allocator.allocate(&exclude, Some(hint));
        let eligible = allocator.pool_set().contains(hint) && !exclude.contains(&hint);
        if eligible {
            prop_assert_eq!(granted, Some(hint));
        } else if let Some(addr) = granted {
            prop_assert_ne!(addr, hint);
        }
    }

    #[test]
    fn identifier_resolution_is_a_subsequence_of_the_precedence(
        order in proptest::sample::subsequence(
            vec![
                IdentifierKind::HwAddress,
                IdentifierKind::Duid,
                IdentifierKind::CircuitId,
                IdentifierKind::ClientId,
                IdentifierKind::FlexId,
            ],
            1..=5,
        ),
        mac in any::<[u8; 6]>(),
        with_circuit in any::<bool>(),
        flex in prop::collection::vec(any::<u8>(), 0..8),
    ) {
        let mut msg = ClientMessage::new(MessageKind::Discover, 1);
        msg.hw_addr = Some(HwAddr::ethernet(mac));
        if with_circuit {
            msg.relay_info = Some(RelayAgentInfo::with_circuit_id(vec![7, 7]));
        }
        if !flex.is_empty() {
            msg.flex_id = Some(flex);
        }

        let resolved = ident::resolve(&msg, &order);

        // resolved kinds appear in precedence order with no duplicates
        let kinds: Vec<_> = resolved.iter().map(|id| id.kind).collect();
        let expected: Vec<_> = order
            .iter()
            .copied()
            .filter(|kind| kinds.contains(kind))
            .collect();
        prop_assert_eq!(kinds, expected);

        // nothing resolved is empty, and absent kinds never materialize
        for id in &resolved {
            prop_assert!(!id.value.is_empty());
        }
        if !with_circuit {
            prop_assert!(resolved.iter().all(|id| id.kind != IdentifierKind::CircuitId));
        }
    }
}
