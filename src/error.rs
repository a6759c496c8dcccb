use super::machine::{RequestState, Transition};
use super::types::{CertificateId, RequestId, UserId};
use std::time::Duration;

/// A state machine guard rejected a transition.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot {transition} a request in state {from}: {violated}")]
pub struct InvalidTransition {
    pub transition: Transition,
    pub from: RequestState,
    pub violated: &'static str,
}

impl InvalidTransition {
    /// `mark_paid` on an already paid request. Callers treat this as done.
    pub fn is_already_satisfied(&self) -> bool {
        self.transition == Transition::MarkPaid
            && self.from.payment_status == crate::types::PaymentStatus::Paid
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("No live row {id} in {table}")]
    NotFound { table: &'static str, id: u64 },
    #[error("Row {id} in {table} changed since it was read")]
    ConcurrencyConflict { table: &'static str, id: u64 },
    #[error("Storage backend failed: {0}")]
    Backend(#[from] sled::Error),
    #[error("Failed to encode row: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("Failed to decode row: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

/// Failure of a blob store, ledger or notifier call.
#[derive(thiserror::Error, Debug)]
pub enum ExternalError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the actor-facing request, certificate and user operations.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("Request {request_id}: {source}")]
    InvalidTransition {
        request_id: RequestId,
        #[source]
        source: InvalidTransition,
    },
    #[error("Request {request_id} was modified concurrently, re-read and retry")]
    ConcurrencyConflict { request_id: RequestId },
    #[error("User {actor} is not allowed to {action}")]
    Unauthorized { actor: UserId, action: &'static str },
    #[error("User {0} has not been approved")]
    SignUpNotApproved(UserId),
    #[error("Certificate {certificate_id} is referenced by {live_requests} live requests")]
    CertificateInUse {
        certificate_id: CertificateId,
        live_requests: usize,
    },
    #[error("Sign-up for user {0} was already reviewed")]
    SignUpAlreadyReviewed(UserId),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RequestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict { table: "mRequest", id } => {
                RequestError::ConcurrencyConflict { request_id: id }
            }
            other => RequestError::Store(other),
        }
    }
}

impl RequestError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RequestError::Store(StoreError::NotFound { .. }))
    }
}

/// Errors from the completion workflow. Each variant tells the caller which
/// steps already ran.
#[derive(thiserror::Error, Debug)]
pub enum CompletionError {
    #[error("Request {request_id} cannot be completed: {reason}")]
    PreconditionFailed {
        request_id: RequestId,
        state: Option<RequestState>,
        reason: String,
    },
    #[error("Request {request_id}: storing the deliverable failed: {source}")]
    StorageFailed {
        request_id: RequestId,
        #[source]
        source: ExternalError,
    },
    #[error("Request {request_id}: ledger submission failed, request left for_confirmation: {source}")]
    LedgerFailed {
        request_id: RequestId,
        document_url: String,
        /// The in-flight marker could not be cleared. Retries conflict until
        /// an operator checks the chain.
        claim_held: bool,
        #[source]
        source: ExternalError,
    },
    #[error("Request {request_id}: deliverable at {document_url} is stored but the final update failed: {source}")]
    FinalizationFailed {
        request_id: RequestId,
        document_url: String,
        ledger_tx: Option<String>,
        notified: bool,
        #[source]
        source: StoreError,
    },
    #[error("Request {request_id} was modified by a concurrent attempt")]
    ConcurrencyConflict { request_id: RequestId },
    #[error("User {actor} is not allowed to complete requests")]
    Unauthorized { actor: UserId },
    #[error(transparent)]
    Store(StoreError),
}

impl CompletionError {
    pub fn request_error(request_id: RequestId, err: RequestError) -> Self {
        match err {
            RequestError::InvalidTransition { source, .. } => CompletionError::PreconditionFailed {
                request_id,
                state: Some(source.from),
                reason: source.to_string(),
            },
            RequestError::ConcurrencyConflict { request_id } => {
                CompletionError::ConcurrencyConflict { request_id }
            }
            RequestError::Unauthorized { actor, .. } => CompletionError::Unauthorized { actor },
            RequestError::Store(err @ StoreError::NotFound { .. }) => {
                CompletionError::PreconditionFailed {
                    request_id,
                    state: None,
                    reason: err.to_string(),
                }
            }
            RequestError::Store(err) => CompletionError::Store(err),
            other => CompletionError::PreconditionFailed {
                request_id,
                state: None,
                reason: other.to_string(),
            },
        }
    }
}
