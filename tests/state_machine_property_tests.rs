//! Property-based tests for the request lifecycle state machine
//!
//! Sequences of arbitrary transitions are replayed from the initial state and
//! from arbitrary states. Every state the machine can produce has to stay in
//! the set the rest of the system understands, guards must not move the
//! state, and terminal states must stay terminal.

use barangay_konek::{
    machine::{RequestState, Transition},
    types::{PaymentStatus, RequestStatus},
};
use proptest::prelude::*;

fn transition_strategy() -> impl Strategy<Value = Transition> {
    prop::sample::select(Transition::ALL.to_vec())
}

fn state_strategy() -> impl Strategy<Value = RequestState> {
    let status = prop_oneof![
        Just(RequestStatus::Pending),
        Just(RequestStatus::ForConfirmation),
        Just(RequestStatus::Completed),
        Just(RequestStatus::Rejected),
    ];
    let payment = prop_oneof![
        Just(PaymentStatus::Unpaid),
        Just(PaymentStatus::Pending),
        Just(PaymentStatus::Paid),
    ];
    (status, payment).prop_map(|(s, p)| RequestState::new(s, p))
}

/// States reachable from a fresh request.
fn is_reachable_shape(state: &RequestState) -> bool {
    use PaymentStatus as P;
    use RequestStatus as S;
    match state.status {
        S::Pending | S::Rejected => true,
        // completion only ever starts from a paid request
        S::ForConfirmation | S::Completed => state.payment_status == P::Paid,
    }
}

proptest! {
    /// Replaying any transition sequence from INITIAL never leaves the set of
    /// reachable states, and a failed guard leaves the state untouched.
    #[test]
    fn replay_stays_in_reachable_states(
        transitions in prop::collection::vec(transition_strategy(), 0..=16)
    ) {
        let mut state = RequestState::INITIAL;
        for transition in transitions {
            match state.next(transition) {
                Ok(next) => state = next,
                Err(err) => {
                    prop_assert_eq!(err.from, state);
                    prop_assert_eq!(err.transition, transition);
                }
            }
            prop_assert!(is_reachable_shape(&state), "unreachable state {}", state);
        }
    }

    /// Once rejected or completed, only delete is accepted and it keeps the state.
    #[test]
    fn terminal_states_are_sticky(
        state in state_strategy(),
        transitions in prop::collection::vec(transition_strategy(), 1..=8)
    ) {
        prop_assume!(state.is_terminal());
        for transition in transitions {
            match state.next(transition) {
                Ok(next) => {
                    prop_assert_eq!(transition, Transition::Delete);
                    prop_assert_eq!(next, state);
                }
                Err(err) => prop_assert!(!err.violated.is_empty()),
            }
        }
    }

    /// Status never moves backwards along pending → for_confirmation → completed
    /// and a paid request never becomes unpaid.
    #[test]
    fn progress_is_monotonic(state in state_strategy(), transition in transition_strategy()) {
        fn rank(status: RequestStatus) -> u8 {
            match status {
                RequestStatus::Pending => 0,
                RequestStatus::ForConfirmation => 1,
                RequestStatus::Completed | RequestStatus::Rejected => 2,
            }
        }

        if let Ok(next) = state.next(transition) {
            prop_assert!(rank(next.status) >= rank(state.status));
            if state.payment_status == PaymentStatus::Paid {
                prop_assert_eq!(next.payment_status, PaymentStatus::Paid);
            }
        }
    }

    /// `available` agrees with `next` for every state.
    #[test]
    fn available_matches_next(state in state_strategy()) {
        let available = state.available();
        for transition in Transition::ALL {
            prop_assert_eq!(available.contains(&transition), state.next(transition).is_ok());
        }
        prop_assert!(available.contains(&Transition::Delete));
    }

    /// Completion is only possible once payment is verified.
    #[test]
    fn completion_requires_payment(state in state_strategy()) {
        if state.allows(Transition::FinishCompletion) || state.allows(Transition::BeginCompletion) {
            prop_assert_eq!(state.payment_status, PaymentStatus::Paid);
            prop_assert!(state.is_completable());
        }
    }
}
