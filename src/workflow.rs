//! Request completion workflow
//!
//! Drives a paid request to `completed` in a fixed order:
//! store deliverable → (optional) ledger → notify resident → finalize.
//!
//! Storage and ledger failures stop the workflow. A failed notification is
//! reported as a warning and the request is still completed. Every step is
//! recorded on the row, so calling [`CompletionWorkflow::complete_request`]
//! again for the same request resumes after the last step that committed.
use super::capability::{
    BlobStore, Ledger, LedgerIntent, Notification, Notifier, StoredBlob, bounded,
};
use super::error::{CompletionError, RequestError};
use super::machine::{RequestState, Transition};
use super::service::RequestService;
use super::types::{Actor, PaymentStatus, Request, RequestId, RequestPatch, RequestStatus};
use std::sync::Arc;
use std::time::Duration;

/// The finished document handed to the workflow.
#[derive(Debug, Clone)]
pub enum Deliverable {
    Upload { bytes: Vec<u8>, filename: String },
    /// Already in the blob store from an earlier attempt.
    Stored(StoredBlob),
}

#[derive(Debug, Clone)]
pub struct CompletionOrder {
    pub request_id: RequestId,
    pub deliverable: Deliverable,
    pub recipient_email: String,
    pub use_ledger: bool,
}

impl CompletionOrder {
    pub fn upload(
        request_id: RequestId,
        bytes: impl Into<Vec<u8>>,
        filename: impl Into<String>,
        recipient_email: impl Into<String>,
        use_ledger: bool,
    ) -> Self {
        Self {
            request_id,
            deliverable: Deliverable::Upload {
                bytes: bytes.into(),
                filename: filename.into(),
            },
            recipient_email: recipient_email.into(),
            use_ledger,
        }
    }
}

/// Non-fatal problems reported next to a successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionWarning {
    NotificationFailed { reason: String },
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub request: Request,
    pub warnings: Vec<CompletionWarning>,
    pub uploaded: bool, // false when an earlier attempt stored the document
    /// Whether this call emailed the resident. False on a resume after the
    /// notification was claimed, including a claim whose send never ran.
    pub notified: bool,
}

impl Completion {
    pub fn notification_failed(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, CompletionWarning::NotificationFailed { .. }))
    }
}

/// Per-call limits and presentation settings.
#[derive(Debug, Clone, Default)]
pub struct WorkflowConfig {
    pub blob_timeout: Option<Duration>,
    pub ledger_timeout: Option<Duration>,
    pub notify_timeout: Option<Duration>,
    /// Prefix for transaction links in the resident's email, e.g.
    /// `https://sepolia.etherscan.io/tx/`.
    pub explorer_tx_url: Option<String>,
}

#[derive(Clone)]
pub struct CompletionWorkflow {
    requests: RequestService,
    blobs: Arc<dyn BlobStore>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    config: WorkflowConfig,
}

impl From<&Request> for LedgerIntent {
    fn from(request: &Request) -> Self {
        LedgerIntent {
            certificate_id: request.certificate_id,
            requester_id: request.requester_id,
            document_type: request.document_type.clone(),
            purpose: request.purpose.clone(),
            priority: request.priority,
        }
    }
}

impl CompletionWorkflow {
    pub fn new(
        requests: RequestService,
        blobs: Arc<dyn BlobStore>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            requests,
            blobs,
            ledger,
            notifier,
            config,
        }
    }

    pub fn requests(&self) -> &RequestService {
        &self.requests
    }

    #[tracing::instrument(
        skip_all,
        fields(request_id = order.request_id, actor = actor.id, use_ledger = order.use_ledger)
    )]
    pub async fn complete_request(
        &self,
        actor: &Actor,
        order: CompletionOrder,
    ) -> Result<Completion, CompletionError> {
        let request_id = order.request_id;
        let fail = |err: RequestError| CompletionError::request_error(request_id, err);

        if !actor.role.is_staff() {
            return Err(CompletionError::Unauthorized { actor: actor.id });
        }

        // 1. preconditions, no side effects on failure
        let current = self
            .requests
            .store()
            .get_request(request_id)
            .await
            .map_err(|e| fail(e.into()))?;
        self.check_preconditions(&current, &order)?;

        // 2. deliverable
        let (mut current, document_url, uploaded) = match current.document_url.clone() {
            Some(url) => {
                tracing::info!(%url, "deliverable already stored, skipping upload");
                (current, url, false)
            }
            None => {
                let (blob, uploaded) = self.store_deliverable(request_id, order.deliverable).await?;
                let attached = self
                    .requests
                    .attach_document(&current, blob.url.clone())
                    .await
                    .map_err(|err| {
                        tracing::warn!(path = %blob.path, error = %err, "could not attach deliverable");
                        fail(err)
                    })?;
                (attached, blob.url, uploaded)
            }
        };

        // 3. ledger
        // a request that already entered for_confirmation owes a ledger record
        let use_ledger = order.use_ledger || current.status == RequestStatus::ForConfirmation;
        if use_ledger && !order.use_ledger {
            tracing::info!("request is awaiting its ledger record, submitting despite order");
        }
        let mut ledger_tx = current.ledger_tx.clone();
        if use_ledger && ledger_tx.is_none() {
            if current.status == RequestStatus::Pending {
                current = self
                    .requests
                    .apply(actor, &current, Transition::BeginCompletion, RequestPatch::default())
                    .await
                    .map_err(fail)?;
            }
            current = self
                .requests
                .claim_ledger(&current)
                .await
                .map_err(|err| {
                    tracing::warn!(error = %err, "ledger submission already in flight");
                    fail(err)
                })?;

            let intent = LedgerIntent::from(&current);
            let tx = match bounded(self.config.ledger_timeout, self.ledger.submit(&intent)).await {
                Ok(tx) => tx,
                Err(source) => {
                    tracing::warn!(error = %source, "ledger submission failed, request left for_confirmation");
                    let claim_held = match self.requests.release_ledger(&current).await {
                        Ok(_) => false,
                        Err(err) => {
                            tracing::error!(error = %err, "could not release ledger claim");
                            true
                        }
                    };
                    return Err(CompletionError::LedgerFailed {
                        request_id,
                        document_url,
                        claim_held,
                        source,
                    });
                }
            };

            match self.requests.record_ledger_tx(&current, tx.clone()).await {
                Ok(updated) => current = updated,
                Err(RequestError::ConcurrencyConflict { request_id }) => {
                    tracing::warn!(%tx, "request changed while the ledger confirmed");
                    return Err(CompletionError::ConcurrencyConflict { request_id });
                }
                // finalize carries the tx
                Err(err) => tracing::warn!(%tx, error = %err, "could not record ledger tx yet"),
            }
            ledger_tx = Some(tx);
        }

        // 4. notify
        let mut warnings = Vec::new();
        let mut notified = false;
        let mut clear_claim = false;
        if current.notified_at.is_none() {
            current = self
                .requests
                .claim_notification(&current)
                .await
                .map_err(fail)?;

            let mail = self.compose(
                &current,
                &order.recipient_email,
                &document_url,
                ledger_tx.as_deref(),
            );
            match bounded(self.config.notify_timeout, self.notifier.send(&mail)).await {
                Ok(()) => notified = true,
                Err(err) => {
                    tracing::warn!(error = %err, to = %mail.to, "notification failed, completing anyway");
                    warnings.push(CompletionWarning::NotificationFailed {
                        reason: err.to_string(),
                    });
                    match self.requests.release_notification(&current).await {
                        Ok(updated) => current = updated,
                        Err(err) => {
                            tracing::warn!(error = %err, "could not release notification claim, finalize clears it");
                            clear_claim = true;
                        }
                    }
                }
            }
        } else {
            tracing::debug!("resident already notified, skipping");
        }

        // 5. finalize
        let finished = self
            .requests
            .apply(
                actor,
                &current,
                Transition::FinishCompletion,
                RequestPatch {
                    document_url: Some(document_url.clone()),
                    ledger_tx: ledger_tx.clone(),
                    notified_at: clear_claim.then_some(None),
                    ..Default::default()
                },
            )
            .await;

        match finished {
            Ok(request) => Ok(Completion {
                request,
                warnings,
                uploaded,
                notified,
            }),
            Err(RequestError::Store(source)) => {
                tracing::error!(
                    %document_url,
                    ledger_tx = ledger_tx.as_deref().unwrap_or(""),
                    notified,
                    error = %source,
                    "finalization failed, row is behind the stored deliverable and needs reconciliation"
                );
                Err(CompletionError::FinalizationFailed {
                    request_id,
                    document_url,
                    ledger_tx,
                    notified,
                    source,
                })
            }
            Err(err) => Err(fail(err)),
        }
    }

    fn check_preconditions(
        &self,
        current: &Request,
        order: &CompletionOrder,
    ) -> Result<(), CompletionError> {
        let state = RequestState::of(current);
        let reason = if state.payment_status != PaymentStatus::Paid {
            Some(format!("payment is {}", state.payment_status))
        } else if !state.is_completable() {
            Some(format!("request is {}", state.status))
        } else if !crate::utils::looks_like_email(&order.recipient_email) {
            Some(format!(
                "'{}' is not an email address",
                order.recipient_email
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(CompletionError::PreconditionFailed {
                request_id: current.id,
                state: Some(state),
                reason,
            }),
            None => Ok(()),
        }
    }

    async fn store_deliverable(
        &self,
        request_id: RequestId,
        deliverable: Deliverable,
    ) -> Result<(StoredBlob, bool), CompletionError> {
        match deliverable {
            Deliverable::Stored(blob) => Ok((blob, false)),
            Deliverable::Upload { bytes, filename } => {
                let blob = bounded(self.config.blob_timeout, self.blobs.put(&bytes, &filename))
                    .await
                    .map_err(|source| {
                        tracing::warn!(error = %source, %filename, "deliverable upload failed");
                        CompletionError::StorageFailed { request_id, source }
                    })?;
                tracing::info!(url = %blob.url, "deliverable stored");
                Ok((blob, true))
            }
        }
    }

    fn compose(
        &self,
        request: &Request,
        to: &str,
        document_url: &str,
        ledger_tx: Option<&str>,
    ) -> Notification {
        let mut body = format!(
            "Good day!\n\nYour request #{} for {} ({}) has been processed.\n\
             You can download your document here: {}\n",
            request.id, request.document_type, request.purpose, document_url
        );
        if let Some(tx) = ledger_tx {
            body.push_str(&format!("\nBlockchain record: {tx}\n"));
            if let Some(explorer) = &self.config.explorer_tx_url {
                body.push_str(&format!("Verify it at {explorer}{tx}\n"));
            }
        }

        Notification {
            to: to.trim().to_string(),
            subject: format!("Your {} is ready", request.document_type),
            body,
            link: Some(document_url.to_string()),
        }
    }
}
