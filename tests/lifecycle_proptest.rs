use context_chain::{
    ContextError, IterationContext, LockState, QueryContext, ScopedContext, StoreHandle,
    StoreState,
};
use proptest::prelude::*;

enum Held {
    Query(ScopedContext<QueryContext>),
    Iteration(ScopedContext<IterationContext>),
}

// Model the store lifecycle seen from a single thread: close succeeds only
// when nothing is held, fails fast otherwise, and once closed nothing can be
// acquired again.
proptest! {
    #[test]
    fn prop_close_interleavings(ops in proptest::collection::vec((0u8..=3u8, any::<usize>()), 1..80)) {
        let store = StoreHandle::default();
        let mut held: Vec<Held> = Vec::new();
        let mut closed = false;

        for (op, raw) in ops {
            match op {
                // Acquire a query context
                0 => match store.query_context() {
                    Ok(q) => {
                        prop_assert!(!closed);
                        held.push(Held::Query(q));
                    }
                    Err(e) => {
                        prop_assert!(closed);
                        prop_assert!(e.is_closed());
                    }
                },
                // Acquire an iteration context
                1 => match store.iteration_context() {
                    Ok(it) => {
                        prop_assert!(!closed);
                        held.push(Held::Iteration(it));
                    }
                    Err(e) => {
                        prop_assert!(closed);
                        prop_assert!(e.is_closed());
                    }
                },
                // Release one held context
                2 => {
                    if !held.is_empty() {
                        let i = raw % held.len();
                        drop(held.swap_remove(i));
                    }
                }
                // Close
                _ => {
                    let res = store.close();
                    if closed || held.is_empty() {
                        prop_assert!(res.is_ok());
                        closed = true;
                    } else {
                        prop_assert!(matches!(res, Err(ContextError::SameThreadClose)));
                        prop_assert_eq!(store.state(), StoreState::Open);
                    }
                }
            }

            let expected = if closed {
                StoreState::Closed
            } else {
                StoreState::Open
            };
            prop_assert_eq!(store.state(), expected);

            if let Some(state) = store.thread_lock_state() {
                let want = if closed {
                    LockState::Closed
                } else if held.is_empty() {
                    LockState::Unlocked
                } else {
                    LockState::LockedLocally
                };
                prop_assert_eq!(state, want);
            }
        }

        for h in held.drain(..) {
            match h {
                Held::Query(q) => q.release(),
                Held::Iteration(it) => it.release(),
            }
        }
        prop_assert!(store.close().is_ok());
        prop_assert_eq!(store.state(), StoreState::Closed);
    }
}
