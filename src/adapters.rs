//! Local implementations of the blob store, ledger and notifier
//!
//! These let the service run without hosted object storage, an RPC node or an
//! SMTP server. Deliverables go to a directory, ledger entries into a
//! hash-linked sled tree, and emails into a sled outbox drained by a relay.
use super::capability::{BlobStore, LedgerIntent, Ledger, Notification, Notifier, StoredBlob};
use super::error::{ExternalError, StoreError};
use super::types::TimeStamp;
use super::utils;
use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::PathBuf;
use std::sync::Arc;

const LEDGER_ENTRIES: &str = "ledger_entries";
const LEDGER_META: &str = "ledger_meta";
const HEAD_KEY: &[u8] = b"head";
const OUTBOX: &str = "mOutbox";

/// Writes deliverables to `root/<key>/<filename>` and serves them from
/// `public_base_url/<key>/<filename>`.
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8], filename: &str) -> Result<StoredBlob, ExternalError> {
        if !utils::is_safe_filename(filename) {
            return Err(ExternalError::Rejected(format!(
                "unsafe filename '{filename}'"
            )));
        }
        // a fresh key per upload, so a retried upload never overwrites
        let key = utils::new_uuid_to_bech32("doc")
            .map_err(|e| ExternalError::Unavailable(e.to_string()))?;

        let dir = self.root.join(&key);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(filename), bytes).await?;

        let path = format!("{key}/{filename}");
        let url = format!("{}/{}", self.public_base_url.trim_end_matches('/'), path);
        tracing::debug!(%path, size = bytes.len(), "stored deliverable");

        Ok(StoredBlob { path, url })
    }
}

/// One confirmed ledger record. The transaction id is the hash of its CBOR
/// encoding, and each entry names the one before it.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerEntry {
    #[n(0)]
    pub intent: LedgerIntent,
    #[n(1)]
    pub prev_tx: Option<String>,
    #[n(2)]
    pub recorded_at: TimeStamp,
}

impl LedgerEntry {
    pub fn build(&self) -> Result<(String, Vec<u8>), StoreError> {
        let cbor = minicbor::to_vec(self)?;
        let hash = format!("0x{}", sha256::digest(&cbor));

        Ok((hash, cbor))
    }
}

/// Append-only, hash-linked ledger kept in sled.
#[derive(Clone)]
pub struct ChainedLedger {
    entries: Tree,
    meta: Tree,
}

impl ChainedLedger {
    pub fn new(instance: &Db) -> Result<Self, StoreError> {
        Ok(Self {
            entries: instance.open_tree(LEDGER_ENTRIES)?,
            meta: instance.open_tree(LEDGER_META)?,
        })
    }

    pub fn head(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .meta
            .get(HEAD_KEY)?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub fn entry(&self, tx: &str) -> Result<Option<LedgerEntry>, StoreError> {
        match self.entries.get(tx.as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn append(&self, intent: &LedgerIntent) -> Result<String, StoreError> {
        loop {
            let head = self.meta.get(HEAD_KEY)?;
            let entry = LedgerEntry {
                intent: intent.clone(),
                prev_tx: head
                    .as_ref()
                    .map(|raw| String::from_utf8_lossy(raw).into_owned()),
                recorded_at: TimeStamp::new(),
            };
            let (tx, cbor) = entry.build()?;

            self.entries.insert(tx.as_bytes(), cbor)?;
            match self
                .meta
                .compare_and_swap(HEAD_KEY, head, Some(tx.as_bytes()))?
            {
                Ok(()) => return Ok(tx),
                Err(_) => {
                    // another append moved the head, relink on top of it
                    self.entries.remove(tx.as_bytes())?;
                }
            }
        }
    }

    /// Walks the chain from the head, checking every entry against its id.
    /// Returns the chain length.
    pub fn verify(&self) -> Result<usize, ExternalError> {
        let mut cursor = self.head()?;
        let mut length = 0;

        while let Some(tx) = cursor {
            let entry = self
                .entry(&tx)?
                .ok_or_else(|| ExternalError::Rejected(format!("missing ledger entry {tx}")))?;
            let (hash, _) = entry.build()?;
            if hash != tx {
                return Err(ExternalError::Rejected(format!(
                    "ledger entry {tx} does not match its hash"
                )));
            }
            length += 1;
            cursor = entry.prev_tx;
        }

        Ok(length)
    }
}

#[async_trait]
impl Ledger for ChainedLedger {
    async fn submit(&self, intent: &LedgerIntent) -> Result<String, ExternalError> {
        let tx = self.append(intent)?;
        tracing::info!(%tx, certificate_id = intent.certificate_id, "ledger entry recorded");
        Ok(tx)
    }
}

/// Queues notifications for an SMTP relay.
#[derive(Clone)]
pub struct OutboxNotifier {
    instance: Arc<Db>,
    outbox: Tree,
}

impl OutboxNotifier {
    pub fn new(instance: Arc<Db>) -> Result<Self, StoreError> {
        Ok(Self {
            outbox: instance.open_tree(OUTBOX)?,
            instance,
        })
    }

    /// Queued notifications in the order they were sent.
    pub fn pending(&self) -> Result<Vec<(u64, Notification)>, StoreError> {
        let mut queued = Vec::new();
        for item in self.outbox.iter() {
            let (key, raw) = item?;
            let id = <[u8; 8]>::try_from(key.as_ref())
                .map(u64::from_be_bytes)
                .unwrap_or_default();
            queued.push((id, minicbor::decode(&raw)?));
        }
        Ok(queued)
    }

    /// Drops a notification the relay has delivered.
    pub fn acknowledge(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.outbox.remove(id.to_be_bytes())?.is_some())
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), ExternalError> {
        let id = self.instance.generate_id().map_err(StoreError::from)?;
        let cbor = minicbor::to_vec(notification).map_err(StoreError::from)?;
        self.outbox
            .insert(id.to_be_bytes(), cbor)
            .map_err(StoreError::from)?;
        tracing::debug!(to = %notification.to, outbox_id = id, "notification queued");
        Ok(())
    }
}
