#![cfg(test)]

// Property tests for the chain kept inside the crate so they can compare
// slot positions against a model directly.

use crate::context::{KindTag, ScopedContext};
use crate::handle::StoreHandle;
use crate::kinds::{IterationContext, QueryContext};
use crate::lock::LockState;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Acquire(KindTag),
    Reenter(usize),
    Release(usize),
}

enum Held {
    Query(ScopedContext<QueryContext>),
    Iteration(ScopedContext<IterationContext>),
}

impl Held {
    fn chain_index(&self) -> usize {
        match self {
            Held::Query(g) => g.chain_index(),
            Held::Iteration(g) => g.chain_index(),
        }
    }
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        3 => prop_oneof![Just(KindTag::Query), Just(KindTag::Iteration)].prop_map(Op::Acquire),
        1 => any::<usize>().prop_map(Op::Reenter),
        3 => any::<usize>().prop_map(Op::Release),
    ];
    proptest::collection::vec(op, 1..60)
}

// Model: one (kind, depth) pair per slot, in creation order.
fn model_acquire(slots: &mut Vec<(KindTag, usize)>, kind: KindTag) -> usize {
    if let Some(i) = slots.iter().position(|&(k, d)| k == kind && d == 0) {
        slots[i].1 = 1;
        return i;
    }
    slots.push((kind, 1));
    slots.len() - 1
}

// Property: State-machine equivalence against the slot model.
// Invariants exercised across random operation sequences:
// - An acquisition lands on the first idle slot of its kind, else a new slot.
// - Chain length never decreases and always equals the model's slot count.
// - The root lock is held exactly while some context is active, whatever
//   order guards are released in.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_chain_matches_model(ops in arb_ops()) {
        let store = StoreHandle::default();
        let mut held: Vec<Held> = Vec::new();
        let mut slots: Vec<(KindTag, usize)> = Vec::new();
        let mut last_len = 0usize;

        for op in ops {
            match op {
                Op::Acquire(kind) => {
                    let expected = model_acquire(&mut slots, kind);
                    let h = match kind {
                        KindTag::Query => Held::Query(store.query_context().unwrap()),
                        KindTag::Iteration => Held::Iteration(store.iteration_context().unwrap()),
                    };
                    prop_assert_eq!(h.chain_index(), expected);
                    held.push(h);
                }
                Op::Reenter(raw) => {
                    if held.is_empty() { continue; }
                    let i = raw % held.len();
                    let again = match &held[i] {
                        Held::Query(g) => Held::Query(g.reenter().unwrap()),
                        Held::Iteration(g) => Held::Iteration(g.reenter().unwrap()),
                    };
                    prop_assert_eq!(again.chain_index(), held[i].chain_index());
                    slots[again.chain_index()].1 += 1;
                    held.push(again);
                }
                Op::Release(raw) => {
                    if held.is_empty() { continue; }
                    let i = raw % held.len();
                    let h = held.swap_remove(i);
                    slots[h.chain_index()].1 -= 1;
                    drop(h);
                }
            }

            let len = store.thread_chain_len().unwrap_or(0);
            prop_assert!(len >= last_len, "chain must never shrink");
            prop_assert_eq!(len, slots.len());
            last_len = len;

            let any_active = slots.iter().any(|&(_, d)| d > 0);
            let expected_state = if any_active { LockState::LockedLocally } else { LockState::Unlocked };
            if len > 0 {
                prop_assert_eq!(store.thread_lock_state(), Some(expected_state));
            }
        }

        drop(held);
        prop_assert_eq!(store.thread_lock_state().unwrap_or(LockState::Unlocked), LockState::Unlocked);
        prop_assert!(store.close().is_ok());
    }
}
