//! Join readiness accounting
//!
//! Every incoming edge of a node (counted over reachable sources) resolves
//! exactly once, as satisfied or unsatisfied. A node fires when all incoming
//! edges have resolved and at least one was satisfied; it is dead when all
//! resolved unsatisfied. The task that completes the last resolution is the
//! unique enqueuer, so a join can never fire twice.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::plan::Plan;

/// What a resolution did to the target node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// All incoming edges resolved with at least one satisfied: run the node
    Fire,
    /// All incoming edges resolved unsatisfied: the node is unreachable
    Dead,
    /// Still waiting on other incoming edges
    Pending,
}

struct JoinState {
    expected: usize,
    satisfied: usize,
    resolved: usize,
    done: bool,
}

/// Per-run join counters
pub(crate) struct JoinTable {
    states: Mutex<HashMap<String, JoinState>>,
}

impl JoinTable {
    /// Seed counters from the plan's expected-incoming map. The start node is
    /// enqueued directly, so it is marked done up front.
    pub(crate) fn new(plan: &Plan) -> Self {
        let mut states = HashMap::with_capacity(plan.expected_incoming.len());
        for (node_id, &expected) in &plan.expected_incoming {
            states.insert(
                node_id.clone(),
                JoinState {
                    expected,
                    satisfied: 0,
                    resolved: 0,
                    done: node_id == &plan.start_node,
                },
            );
        }
        Self {
            states: Mutex::new(states),
        }
    }

    /// Resolve one incoming edge of `target`
    pub(crate) fn resolve(&self, target: &str, satisfied: bool) -> Resolution {
        let mut states = self.states.lock();
        let state = match states.get_mut(target) {
            Some(state) => state,
            None => return Resolution::Pending,
        };

        if state.done {
            return Resolution::Pending;
        }

        state.resolved += 1;
        if satisfied {
            state.satisfied += 1;
        }

        if state.resolved < state.expected {
            return Resolution::Pending;
        }

        state.done = true;
        if state.satisfied > 0 {
            Resolution::Fire
        } else {
            Resolution::Dead
        }
    }
}
