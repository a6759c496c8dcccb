//! External capabilities consumed by the completion workflow
use super::error::ExternalError;
use super::types::{CertificateId, Priority, UserId};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Where a deliverable landed.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StoredBlob {
    #[n(0)]
    pub path: String,
    #[n(1)]
    pub url: String, // durable, handed to the resident
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Notification {
    #[n(0)]
    pub to: String,
    #[n(1)]
    pub subject: String,
    #[n(2)]
    pub body: String,
    #[n(3)]
    pub link: Option<String>,
}

/// What gets written on-chain for a completed request.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerIntent {
    #[n(0)]
    pub certificate_id: CertificateId,
    #[n(1)]
    pub requester_id: UserId,
    #[n(2)]
    pub document_type: String,
    #[n(3)]
    pub purpose: String,
    #[n(4)]
    pub priority: Priority,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8], filename: &str) -> Result<StoredBlob, ExternalError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), ExternalError>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Returns the transaction id once the entry is confirmed.
    async fn submit(&self, intent: &LedgerIntent) -> Result<String, ExternalError>;
}

/// Awaits `call`, failing with [`ExternalError::Timeout`] once `limit` elapses.
pub async fn bounded<T, F>(limit: Option<Duration>, call: F) -> Result<T, ExternalError>
where
    F: Future<Output = Result<T, ExternalError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| ExternalError::Timeout(limit))?,
        None => call.await,
    }
}
