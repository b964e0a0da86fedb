// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Mutex;

use crate::Event;

/// A registered claim on the next matching `user:input` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub run_id: u64,
    pub step_id: String,
    /// When set, only input from this session matches; `None` matches any.
    pub session_filter: Option<String>,
}

#[derive(Default)]
struct State {
    pending: Vec<Claim>,
    consumed: HashSet<u64>,
}

/// Correlation registry shared between the workflow engine and the turn loop.
///
/// The engine registers a claim when it parks a run in `waiting_input` or
/// `waiting_approval`.  Its `user:input` handler runs before the turn loop's
/// (lifecycle subscribes the engine first), takes the matching claim, and
/// marks the event consumed; the turn loop then skips it.  Handlers are
/// serialized on the bus, so take-then-check is race-free.
#[derive(Default)]
pub struct InputClaims {
    state: Mutex<State>,
}

impl InputClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a claim.  First registered, first matched.
    pub fn register(&self, claim: Claim) {
        self.state.lock().unwrap().pending.push(claim);
    }

    /// Drop any claim belonging to `run_id` (run cancelled or failed).
    pub fn withdraw(&self, run_id: u64) {
        self.state
            .lock()
            .unwrap()
            .pending
            .retain(|c| c.run_id != run_id);
    }

    /// Take the first claim matching this event's session, marking the event
    /// consumed.  Called by the engine's `user:input` handler.
    pub fn take_for(&self, event: &Event) -> Option<Claim> {
        let mut state = self.state.lock().unwrap();
        let idx = state.pending.iter().position(|c| {
            c.session_filter
                .as_deref()
                .map(|s| s == event.session_id)
                .unwrap_or(true)
        })?;
        let claim = state.pending.remove(idx);
        state.consumed.insert(event.seq);
        Some(claim)
    }

    /// True when a claim already consumed this event; clears the marker.
    /// Called by the turn loop's `user:input` handler.
    pub fn is_consumed(&self, event: &Event) -> bool {
        self.state.lock().unwrap().consumed.remove(&event.seq)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::EventType;

    fn input(session: &str, seq: u64) -> Event {
        let mut e = Event::new(EventType::UserInput, json!({"text": "yes"}));
        e.session_id = session.into();
        e.seq = seq;
        e
    }

    fn claim(run_id: u64, session: Option<&str>) -> Claim {
        Claim {
            run_id,
            step_id: "confirm".into(),
            session_filter: session.map(str::to_string),
        }
    }

    #[test]
    fn unfiltered_claim_matches_any_session() {
        let claims = InputClaims::new();
        claims.register(claim(1, None));
        let e = input("c9", 7);
        assert_eq!(claims.take_for(&e).map(|c| c.run_id), Some(1));
        assert!(claims.is_consumed(&e));
    }

    #[test]
    fn filtered_claim_skips_other_sessions() {
        let claims = InputClaims::new();
        claims.register(claim(1, Some("c1")));
        let other = input("c2", 3);
        assert!(claims.take_for(&other).is_none());
        assert!(!claims.is_consumed(&other));

        let matching = input("c1", 4);
        assert!(claims.take_for(&matching).is_some());
    }

    #[test]
    fn consumed_marker_clears_after_check() {
        let claims = InputClaims::new();
        claims.register(claim(1, None));
        let e = input("c1", 9);
        claims.take_for(&e);
        assert!(claims.is_consumed(&e));
        assert!(!claims.is_consumed(&e), "marker is one-shot");
    }

    #[test]
    fn withdraw_removes_run_claims() {
        let claims = InputClaims::new();
        claims.register(claim(1, None));
        claims.register(claim(2, None));
        claims.withdraw(1);
        assert_eq!(claims.pending_count(), 1);
        let e = input("c1", 1);
        assert_eq!(claims.take_for(&e).map(|c| c.run_id), Some(2));
    }

    #[test]
    fn claims_match_in_registration_order() {
        let claims = InputClaims::new();
        claims.register(claim(1, None));
        claims.register(claim(2, None));
        let a = input("c1", 1);
        let b = input("c1", 2);
        assert_eq!(claims.take_for(&a).map(|c| c.run_id), Some(1));
        assert_eq!(claims.take_for(&b).map(|c| c.run_id), Some(2));
    }
}
