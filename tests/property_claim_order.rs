//! Property tests for the deterministic claim order.

use std::cmp::Ordering;

use proptest::prelude::*;
use voidlux::domain::models::NodeId;
use voidlux::mesh::LamportClock;
use voidlux::services::compare_claims;

#[derive(Debug, Clone)]
struct Ticket {
    ts: u64,
    node: String,
}

fn ticket_strategy() -> impl Strategy<Value = Ticket> {
    (0u64..50, "[a-f0-9]{8}").prop_map(|(ts, node)| Ticket { ts, node })
}

fn winner(tickets: &[Ticket]) -> &Ticket {
    tickets
        .iter()
        .min_by(|a, b| {
            compare_claims(
                a.ts,
                &NodeId::from_string(a.node.clone()),
                b.ts,
                &NodeId::from_string(b.node.clone()),
            )
        })
        .expect("non-empty")
}

proptest! {
    /// The claim order is total and antisymmetric: for any two tickets,
    /// exactly one direction wins unless they are identical.
    #[test]
    fn claim_order_is_total(a in ticket_strategy(), b in ticket_strategy()) {
        let an = NodeId::from_string(a.node.clone());
        let bn = NodeId::from_string(b.node.clone());
        let forward = compare_claims(a.ts, &an, b.ts, &bn);
        let backward = compare_claims(b.ts, &bn, a.ts, &an);
        prop_assert_eq!(forward, backward.reverse());
        if a.ts == b.ts && a.node == b.node {
            prop_assert_eq!(forward, Ordering::Equal);
        } else {
            prop_assert_ne!(forward, Ordering::Equal);
        }
    }

    /// Every delivery order of the same claim multiset converges on the
    /// same winner: fold-apply in shuffled order always keeps the global
    /// minimum.
    #[test]
    fn winner_is_order_independent(
        mut tickets in proptest::collection::vec(ticket_strategy(), 1..8),
        seed in 0usize..1000,
    ) {
        let global = winner(&tickets).clone();

        // A cheap deterministic shuffle driven by the seed.
        let len = tickets.len();
        for i in 0..len {
            tickets.swap(i, (seed + i * 7) % len);
        }

        // Fold the way a replica applies arriving claims: keep the current
        // holder unless the incoming ticket outranks it.
        let mut held = tickets[0].clone();
        for incoming in &tickets[1..] {
            let cmp = compare_claims(
                incoming.ts,
                &NodeId::from_string(incoming.node.clone()),
                held.ts,
                &NodeId::from_string(held.node.clone()),
            );
            if cmp == Ordering::Less {
                held = incoming.clone();
            }
        }
        prop_assert_eq!(held.ts, global.ts);
        prop_assert_eq!(held.node, global.node);
    }

    /// The clock never moves backwards under any witness sequence.
    #[test]
    fn lamport_clock_is_monotonic(remotes in proptest::collection::vec(0u64..10_000, 0..50)) {
        let clock = LamportClock::new(0);
        let mut last = clock.current();
        for remote in remotes {
            let next = clock.witness(remote);
            prop_assert!(next > last);
            last = next;
            let ticked = clock.tick();
            prop_assert!(ticked > last || ticked == last + 1);
            last = ticked;
        }
    }
}
