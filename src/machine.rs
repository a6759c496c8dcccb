//! Request lifecycle state machine
//!
//! A request's lifecycle state is the pair `(status, payment_status)`. This
//! module defines which transitions are legal from which states and what the
//! state becomes afterwards. It performs no I/O; the service layer applies the
//! result with a conditional row update.
use super::error::InvalidTransition;
use super::types::{PaymentStatus, Request, RequestStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestState {
    pub status: RequestStatus,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    ReportPayment,
    MarkPaid,
    Reject,
    BeginCompletion,
    FinishCompletion,
    Delete,
}

impl Transition {
    pub const ALL: [Transition; 6] = [
        Transition::ReportPayment,
        Transition::MarkPaid,
        Transition::Reject,
        Transition::BeginCompletion,
        Transition::FinishCompletion,
        Transition::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::ReportPayment => "report_payment",
            Transition::MarkPaid => "mark_paid",
            Transition::Reject => "reject",
            Transition::BeginCompletion => "begin_completion",
            Transition::FinishCompletion => "finish_completion",
            Transition::Delete => "delete",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RequestState {
    /// State of a freshly created request.
    pub const INITIAL: RequestState = RequestState {
        status: RequestStatus::Pending,
        payment_status: PaymentStatus::Unpaid,
    };

    pub fn new(status: RequestStatus, payment_status: PaymentStatus) -> Self {
        Self {
            status,
            payment_status,
        }
    }

    pub fn of(request: &Request) -> Self {
        Self::new(request.status, request.payment_status)
    }

    /// Rejected and completed requests accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RequestStatus::Rejected | RequestStatus::Completed
        )
    }

    /// Paid and not yet completed: the completion workflow may run.
    pub fn is_completable(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
            && matches!(
                self.status,
                RequestStatus::Pending | RequestStatus::ForConfirmation
            )
    }

    /// Returns the state reached by `transition`, or the violated guard.
    pub fn next(&self, transition: Transition) -> Result<RequestState, InvalidTransition> {
        let fail = |violated: &'static str| InvalidTransition {
            transition,
            from: *self,
            violated,
        };

        match transition {
            Transition::ReportPayment => {
                if self.status != RequestStatus::Pending {
                    return Err(fail("request must be pending"));
                }
                if self.payment_status != PaymentStatus::Unpaid {
                    return Err(fail("payment is already reported"));
                }
                Ok(RequestState::new(
                    RequestStatus::Pending,
                    PaymentStatus::Pending,
                ))
            }
            Transition::MarkPaid => {
                if self.status != RequestStatus::Pending {
                    return Err(fail("request must be pending"));
                }
                if self.payment_status == PaymentStatus::Paid {
                    return Err(fail("payment is already paid"));
                }
                Ok(RequestState::new(RequestStatus::Pending, PaymentStatus::Paid))
            }
            Transition::Reject => {
                if self.status != RequestStatus::Pending {
                    return Err(fail("request must be pending"));
                }
                Ok(RequestState::new(RequestStatus::Rejected, self.payment_status))
            }
            Transition::BeginCompletion => {
                if self.status != RequestStatus::Pending {
                    return Err(fail("request must be pending"));
                }
                if self.payment_status != PaymentStatus::Paid {
                    return Err(fail("payment must be paid"));
                }
                Ok(RequestState::new(
                    RequestStatus::ForConfirmation,
                    PaymentStatus::Paid,
                ))
            }
            Transition::FinishCompletion => {
                if self.payment_status != PaymentStatus::Paid {
                    return Err(fail("payment must be paid"));
                }
                if !self.is_completable() {
                    return Err(fail("request must be pending or for_confirmation"));
                }
                Ok(RequestState::new(
                    RequestStatus::Completed,
                    PaymentStatus::Paid,
                ))
            }
            // soft delete only changes visibility
            Transition::Delete => Ok(*self),
        }
    }

    pub fn allows(&self, transition: Transition) -> bool {
        self.next(transition).is_ok()
    }

    /// Transitions an actor could take from here, for rendering action buttons.
    pub fn available(&self) -> Vec<Transition> {
        Transition::ALL
            .into_iter()
            .filter(|t| self.allows(*t))
            .collect()
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.status, self.payment_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PENDING_PAID: RequestState = RequestState {
        status: RequestStatus::Pending,
        payment_status: PaymentStatus::Paid,
    };

    #[test]
    fn happy_path_without_ledger() {
        let paid = RequestState::INITIAL.next(Transition::MarkPaid).unwrap();
        assert_eq!(paid, PENDING_PAID);

        let done = paid.next(Transition::FinishCompletion).unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert!(done.is_terminal());
    }

    #[test]
    fn happy_path_with_ledger() {
        let confirming = PENDING_PAID.next(Transition::BeginCompletion).unwrap();
        assert_eq!(confirming.status, RequestStatus::ForConfirmation);

        // a second begin is not allowed, the submission is already in flight
        assert!(confirming.next(Transition::BeginCompletion).is_err());

        let done = confirming.next(Transition::FinishCompletion).unwrap();
        assert_eq!(
            done,
            RequestState::new(RequestStatus::Completed, PaymentStatus::Paid)
        );
    }

    #[test]
    fn mark_paid_accepts_reported_payment() {
        let reported = RequestState::INITIAL.next(Transition::ReportPayment).unwrap();
        assert_eq!(reported.payment_status, PaymentStatus::Pending);
        assert!(reported.next(Transition::ReportPayment).is_err());
        assert_eq!(reported.next(Transition::MarkPaid).unwrap(), PENDING_PAID);
    }

    #[test]
    fn mark_paid_twice_is_already_satisfied() {
        let err = PENDING_PAID.next(Transition::MarkPaid).unwrap_err();
        assert_eq!(err.transition, Transition::MarkPaid);
        assert_eq!(err.from, PENDING_PAID);
        assert!(err.is_already_satisfied());
    }

    #[test]
    fn completion_requires_payment() {
        let err = RequestState::INITIAL
            .next(Transition::FinishCompletion)
            .unwrap_err();
        assert_eq!(err.violated, "payment must be paid");
        assert!(!err.is_already_satisfied());

        assert!(RequestState::INITIAL.next(Transition::BeginCompletion).is_err());
    }

    #[test]
    fn reject_keeps_payment_status() {
        let rejected = PENDING_PAID.next(Transition::Reject).unwrap();
        assert_eq!(
            rejected,
            RequestState::new(RequestStatus::Rejected, PaymentStatus::Paid)
        );
        assert!(rejected.available() == vec![Transition::Delete]);
    }

    #[test]
    fn delete_is_always_allowed() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::ForConfirmation,
            RequestStatus::Completed,
            RequestStatus::Rejected,
        ] {
            let state = RequestState::new(status, PaymentStatus::Paid);
            assert_eq!(state.next(Transition::Delete).unwrap(), state);
        }
    }

    #[test]
    fn error_message_names_transition_and_state() {
        let err = RequestState::new(RequestStatus::Completed, PaymentStatus::Paid)
            .next(Transition::Reject)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("reject"));
        assert!(message.contains("completed/paid"));
        assert!(message.contains("request must be pending"));
    }
}
