//! Service layer API for certificate requests
//!
//! Every mutation reads the current row, asks the state machine for the next
//! state and commits it with a single conditional update against that read.
use super::error::{InvalidTransition, RequestError};
use super::machine::{RequestState, Transition};
use super::store::RowStore;
use super::types::{
    Actor, Certificate, CertificateId, NewCertificate, NewRequest, NewUser, Priority, Request,
    RequestId, RequestPatch, RequestStatus, Role, SignUpStatus, TimeStamp, User, UserId,
};
use std::sync::Arc;

/// Narrows [`RequestService::list_requests`]. Empty filter lists everything live.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub requester_id: Option<UserId>,
    pub status: Option<RequestStatus>,
}

impl RequestFilter {
    fn matches(&self, request: &Request) -> bool {
        self.requester_id.is_none_or(|id| request.requester_id == id)
            && self.status.is_none_or(|status| request.status == status)
    }
}

#[derive(Clone)]
pub struct RequestService {
    store: Arc<dyn RowStore>,
}

fn require_staff(actor: &Actor, action: &'static str) -> Result<(), RequestError> {
    if actor.role.is_staff() {
        Ok(())
    } else {
        Err(RequestError::Unauthorized {
            actor: actor.id,
            action,
        })
    }
}

impl RequestService {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// Register a new account. It cannot file requests until reviewed.
    pub async fn register_user(
        &self,
        email: &str,
        full_name: &str,
        role: Role,
    ) -> Result<User, RequestError> {
        let email = email.trim();
        if !crate::utils::looks_like_email(email) {
            return Err(RequestError::InvalidInput(format!(
                "'{email}' is not an email address"
            )));
        }
        if full_name.trim().is_empty() {
            return Err(RequestError::InvalidInput("full name is empty".into()));
        }

        let user = self
            .store
            .insert_user(NewUser {
                email: email.to_string(),
                full_name: full_name.trim().to_string(),
                role,
                sign_up_status: SignUpStatus::Pending,
            })
            .await?;
        tracing::info!(user_id = user.id, role = %role, "user registered");

        Ok(user)
    }

    /// Approve or reject a pending sign-up.
    pub async fn review_sign_up(
        &self,
        actor: &Actor,
        user_id: UserId,
        approve: bool,
    ) -> Result<User, RequestError> {
        require_staff(actor, "review sign-ups")?;

        let user = self.store.get_user(user_id).await?;
        if user.sign_up_status != SignUpStatus::Pending {
            return Err(RequestError::SignUpAlreadyReviewed(user_id));
        }

        let decision = if approve {
            SignUpStatus::Approved
        } else {
            SignUpStatus::Rejected
        };
        let user = self.store.update_user(&user, decision).await?;
        tracing::info!(user_id, reviewer = actor.id, decision = %decision, "sign-up reviewed");

        Ok(user)
    }

    pub async fn add_certificate(
        &self,
        actor: &Actor,
        draft: NewCertificate,
    ) -> Result<Certificate, RequestError> {
        require_staff(actor, "manage certificates")?;
        if draft.name.trim().is_empty() {
            return Err(RequestError::InvalidInput("certificate name is empty".into()));
        }

        let certificate = self.store.insert_certificate(draft).await?;
        tracing::info!(
            certificate_id = certificate.id,
            fee = certificate.fee,
            "certificate added"
        );
        Ok(certificate)
    }

    /// Soft-deletes a catalog entry. Blocked while live requests reference it.
    pub async fn delete_certificate(
        &self,
        actor: &Actor,
        certificate_id: CertificateId,
    ) -> Result<(), RequestError> {
        require_staff(actor, "manage certificates")?;

        let live_requests = self
            .store
            .list_requests()
            .await?
            .iter()
            .filter(|r| r.certificate_id == certificate_id)
            .count();
        if live_requests > 0 {
            return Err(RequestError::CertificateInUse {
                certificate_id,
                live_requests,
            });
        }

        self.store.soft_delete_certificate(certificate_id).await?;
        tracing::info!(certificate_id, "certificate deleted");
        Ok(())
    }

    /// File a new request. Only approved residents may do this.
    pub async fn create_request(
        &self,
        actor: &Actor,
        certificate_id: CertificateId,
        purpose: &str,
        document_type: &str,
        priority: Priority,
    ) -> Result<Request, RequestError> {
        if actor.role != Role::Resident {
            return Err(RequestError::Unauthorized {
                actor: actor.id,
                action: "create requests",
            });
        }
        let requester = self.store.get_user(actor.id).await?;
        if requester.sign_up_status != SignUpStatus::Approved {
            return Err(RequestError::SignUpNotApproved(actor.id));
        }
        let certificate = self.store.get_certificate(certificate_id).await?;

        let purpose = purpose.trim();
        if purpose.is_empty() {
            return Err(RequestError::InvalidInput("purpose is empty".into()));
        }
        // the label shown in lists falls back to the catalog name
        let document_type = match document_type.trim() {
            "" => certificate.name.clone(),
            label => label.to_string(),
        };

        let initial = RequestState::INITIAL;
        let request = self
            .store
            .insert_request(NewRequest {
                certificate_id,
                requester_id: actor.id,
                purpose: purpose.to_string(),
                document_type,
                priority,
                status: initial.status,
                payment_status: initial.payment_status,
            })
            .await?;
        tracing::info!(
            request_id = request.id,
            certificate_id,
            requester_id = actor.id,
            priority = %priority,
            "request created"
        );

        Ok(request)
    }

    pub async fn get_request(&self, request_id: RequestId) -> Result<Request, RequestError> {
        Ok(self.store.get_request(request_id).await?)
    }

    /// Live requests matching `filter`, oldest first.
    pub async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, RequestError> {
        let mut requests: Vec<Request> = self
            .store
            .list_requests()
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        requests.sort_by_key(|r| r.id);
        Ok(requests)
    }

    /// A resident reports paying at the hall. The office still has to verify
    /// it with [`RequestService::mark_paid`].
    pub async fn report_payment(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<Request, RequestError> {
        let current = self.store.get_request(request_id).await?;
        if current.requester_id != actor.id {
            return Err(RequestError::Unauthorized {
                actor: actor.id,
                action: "report payment for this request",
            });
        }
        self.apply(
            actor,
            &current,
            Transition::ReportPayment,
            RequestPatch::default(),
        )
        .await
    }

    /// Record that the fee was settled. Officials only.
    pub async fn mark_paid(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<Request, RequestError> {
        require_staff(actor, "mark requests paid")?;
        let current = self.store.get_request(request_id).await?;
        self.apply(actor, &current, Transition::MarkPaid, RequestPatch::default())
            .await
    }

    /// Decline a pending request. Terminal.
    pub async fn reject(&self, actor: &Actor, request_id: RequestId) -> Result<Request, RequestError> {
        require_staff(actor, "reject requests")?;
        let current = self.store.get_request(request_id).await?;
        self.apply(actor, &current, Transition::Reject, RequestPatch::default())
            .await
    }

    /// Mark a ledger submission as in flight.
    pub async fn begin_completion(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<Request, RequestError> {
        require_staff(actor, "complete requests")?;
        let current = self.store.get_request(request_id).await?;
        self.apply(
            actor,
            &current,
            Transition::BeginCompletion,
            RequestPatch::default(),
        )
        .await
    }

    /// Issue the deliverable. Sets `ledger_tx` only if it is not already set.
    pub async fn finish_completion(
        &self,
        actor: &Actor,
        request_id: RequestId,
        document_url: String,
        ledger_tx: Option<String>,
    ) -> Result<Request, RequestError> {
        require_staff(actor, "complete requests")?;
        if document_url.trim().is_empty() {
            return Err(RequestError::InvalidInput("document url is empty".into()));
        }
        let current = self.store.get_request(request_id).await?;
        self.apply(
            actor,
            &current,
            Transition::FinishCompletion,
            RequestPatch {
                document_url: Some(document_url),
                ledger_tx,
                ..Default::default()
            },
        )
        .await
    }

    /// Hide a request. Staff may delete any request, residents only their own.
    pub async fn delete_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<(), RequestError> {
        let current = self.store.get_request(request_id).await?;
        if !actor.role.is_staff() && current.requester_id != actor.id {
            return Err(RequestError::Unauthorized {
                actor: actor.id,
                action: "delete this request",
            });
        }
        self.check(&current, Transition::Delete)?;

        self.store.soft_delete_request(request_id).await?;
        tracing::info!(request_id, actor = actor.id, "request deleted");
        Ok(())
    }

    /// Paid requests stuck between storage and completion for longer than
    /// `older_than`: a ledger submission that never confirmed, or a final
    /// update that failed after the deliverable was stored.
    pub async fn stalled_completions(
        &self,
        older_than: chrono::Duration,
    ) -> Result<Vec<Request>, RequestError> {
        // a threshold reaching past the representable range means nothing is old enough
        let Some(cutoff) = TimeStamp::new()
            .to_datetime_utc()
            .checked_sub_signed(older_than)
        else {
            return Ok(Vec::new());
        };
        let mut stalled: Vec<Request> = self
            .store
            .list_requests()
            .await?
            .into_iter()
            .filter(|r| {
                RequestState::of(r).is_completable()
                    && (r.document_url.is_some() || r.status == RequestStatus::ForConfirmation)
                    && r.updated_at.to_datetime_utc() < cutoff
            })
            .collect();
        stalled.sort_by_key(|r| r.updated_at);
        Ok(stalled)
    }

    fn check(&self, current: &Request, transition: Transition) -> Result<RequestState, RequestError> {
        RequestState::of(current)
            .next(transition)
            .map_err(|source: InvalidTransition| RequestError::InvalidTransition {
                request_id: current.id,
                source,
            })
    }

    /// Takes `transition` from the state in `current`, committing it together
    /// with `extra` only if the row still matches `current`.
    pub(crate) async fn apply(
        &self,
        actor: &Actor,
        current: &Request,
        transition: Transition,
        extra: RequestPatch,
    ) -> Result<Request, RequestError> {
        let from = RequestState::of(current);
        let to = self.check(current, transition)?;

        let patch = RequestPatch {
            status: Some(to.status),
            payment_status: Some(to.payment_status),
            ..extra
        };
        let updated = self.store.update_request(current, patch).await?;
        tracing::info!(
            request_id = current.id,
            actor = actor.id,
            %transition,
            %from,
            %to,
            "request transitioned"
        );

        Ok(updated)
    }

    /// Records where the deliverable was stored. Only the first writer wins.
    pub(crate) async fn attach_document(
        &self,
        current: &Request,
        document_url: String,
    ) -> Result<Request, RequestError> {
        if current.document_url.is_some() {
            return Err(RequestError::ConcurrencyConflict {
                request_id: current.id,
            });
        }
        Ok(self
            .store
            .update_request(
                current,
                RequestPatch {
                    document_url: Some(document_url),
                    ..Default::default()
                },
            )
            .await?)
    }

    pub(crate) async fn record_ledger_tx(
        &self,
        current: &Request,
        ledger_tx: String,
    ) -> Result<Request, RequestError> {
        Ok(self
            .store
            .update_request(
                current,
                RequestPatch {
                    ledger_tx: Some(ledger_tx),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Claims the right to email the resident. A claimed row is never
    /// notified by another attempt, so a crash between claim and send means
    /// the resident is not emailed at all: delivery is at most once.
    pub(crate) async fn claim_notification(&self, current: &Request) -> Result<Request, RequestError> {
        if current.notified_at.is_some() {
            return Err(RequestError::ConcurrencyConflict {
                request_id: current.id,
            });
        }
        Ok(self
            .store
            .update_request(
                current,
                RequestPatch {
                    notified_at: Some(Some(TimeStamp::new())),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Marks a ledger submission as in flight. Only one attempt may submit
    /// a given request.
    pub(crate) async fn claim_ledger(&self, current: &Request) -> Result<Request, RequestError> {
        if current.ledger_submitted_at.is_some() || current.ledger_tx.is_some() {
            return Err(RequestError::ConcurrencyConflict {
                request_id: current.id,
            });
        }
        Ok(self
            .store
            .update_request(
                current,
                RequestPatch {
                    ledger_submitted_at: Some(Some(TimeStamp::new())),
                    ..Default::default()
                },
            )
            .await?)
    }

    pub(crate) async fn release_ledger(&self, current: &Request) -> Result<Request, RequestError> {
        Ok(self
            .store
            .update_request(
                current,
                RequestPatch {
                    ledger_submitted_at: Some(None),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Gives the claim back after a failed send so a retry can notify.
    pub(crate) async fn release_notification(
        &self,
        current: &Request,
    ) -> Result<Request, RequestError> {
        Ok(self
            .store
            .update_request(
                current,
                RequestPatch {
                    notified_at: Some(None),
                    ..Default::default()
                },
            )
            .await?)
    }
}
