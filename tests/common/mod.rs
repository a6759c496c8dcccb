//! Shared fixtures: a sled-backed service on a temp dir plus recording
//! doubles for the blob store, ledger and notifier.
#![allow(dead_code)]

use async_trait::async_trait;
use barangay_konek::{
    capability::{BlobStore, Ledger, LedgerIntent, Notification, Notifier, StoredBlob},
    error::{ExternalError, StoreError},
    service::RequestService,
    store::{RowStore, SledRowStore},
    types::{
        Actor, Certificate, CertificateId, NewCertificate, NewRequest, NewUser, Priority,
        Request, RequestId, RequestPatch, RequestStatus, Role, SignUpStatus, User, UserId,
    },
    workflow::{CompletionWorkflow, WorkflowConfig},
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

#[derive(Default)]
pub struct RecordingBlobStore {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl BlobStore for RecordingBlobStore {
    async fn put(&self, _bytes: &[u8], filename: &str) -> Result<StoredBlob, ExternalError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        // let a racing attempt run between upload and attach
        tokio::task::yield_now().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExternalError::Unavailable("bucket offline".into()));
        }
        let path = format!("requests/{n}/{filename}");
        Ok(StoredBlob {
            url: format!("https://storage.example.com/{path}"),
            path,
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ExternalError::Unavailable("smtp connection refused".into()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Ledger double that can fail, and that records the request's status as seen
/// in the row store while the submission is in flight.
///
/// With `park_first` set, the first submission signals `entered` and waits
/// for `release` before confirming.
pub struct RecordingLedger {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub observed: Mutex<Vec<RequestStatus>>,
    pub watch: Mutex<Option<(Arc<dyn RowStore>, RequestId)>>,
    pub park_first: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl Default for RecordingLedger {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            observed: Mutex::new(Vec::new()),
            watch: Mutex::new(None),
            park_first: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl Ledger for RecordingLedger {
    async fn submit(&self, intent: &LedgerIntent) -> Result<String, ExternalError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.park_first.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }

        let watch = self.watch.lock().unwrap().clone();
        if let Some((store, id)) = watch {
            let row = store.get_request(id).await?;
            self.observed.lock().unwrap().push(row.status);
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(ExternalError::Unavailable("rpc node unreachable".into()));
        }
        Ok(format!("0x{:064x}", intent.certificate_id * 1000 + n as u64))
    }
}

/// Wraps the sled store and fails selected request writes: the one that
/// completes a request, or the one that hands back a notification claim.
pub struct FlakyRowStore {
    pub inner: SledRowStore,
    pub fail_finalize: AtomicBool,
    pub fail_release: AtomicBool,
}

impl FlakyRowStore {
    pub fn new(inner: SledRowStore) -> Self {
        Self {
            inner,
            fail_finalize: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
        }
    }
}

fn read_only() -> StoreError {
    StoreError::Backend(sled::Error::Unsupported("database is read-only".into()))
}

#[async_trait]
impl RowStore for FlakyRowStore {
    async fn get_user(&self, id: UserId) -> Result<User, StoreError> {
        self.inner.get_user(id).await
    }
    async fn insert_user(&self, draft: NewUser) -> Result<User, StoreError> {
        self.inner.insert_user(draft).await
    }
    async fn update_user(
        &self,
        expected: &User,
        sign_up_status: SignUpStatus,
    ) -> Result<User, StoreError> {
        self.inner.update_user(expected, sign_up_status).await
    }
    async fn get_certificate(&self, id: CertificateId) -> Result<Certificate, StoreError> {
        self.inner.get_certificate(id).await
    }
    async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError> {
        self.inner.list_certificates().await
    }
    async fn insert_certificate(&self, draft: NewCertificate) -> Result<Certificate, StoreError> {
        self.inner.insert_certificate(draft).await
    }
    async fn soft_delete_certificate(&self, id: CertificateId) -> Result<(), StoreError> {
        self.inner.soft_delete_certificate(id).await
    }
    async fn get_request(&self, id: RequestId) -> Result<Request, StoreError> {
        self.inner.get_request(id).await
    }
    async fn list_requests(&self) -> Result<Vec<Request>, StoreError> {
        self.inner.list_requests().await
    }
    async fn insert_request(&self, draft: NewRequest) -> Result<Request, StoreError> {
        self.inner.insert_request(draft).await
    }
    async fn update_request(
        &self,
        expected: &Request,
        patch: RequestPatch,
    ) -> Result<Request, StoreError> {
        if patch.status == Some(RequestStatus::Completed)
            && self.fail_finalize.load(Ordering::SeqCst)
        {
            return Err(read_only());
        }
        if patch.status.is_none()
            && patch.notified_at == Some(None)
            && self.fail_release.load(Ordering::SeqCst)
        {
            return Err(read_only());
        }
        self.inner.update_request(expected, patch).await
    }
    async fn soft_delete_request(&self, id: RequestId) -> Result<Request, StoreError> {
        self.inner.soft_delete_request(id).await
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<dyn RowStore>,
    pub requests: RequestService,
    pub workflow: CompletionWorkflow,
    pub blobs: Arc<RecordingBlobStore>,
    pub ledger: Arc<RecordingLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub official: Actor,
    pub resident: User,
    pub certificate: Certificate,
}

pub fn open_sled(dir: &TempDir) -> SledRowStore {
    // one database per test, sled locks the directory
    let db = sled::open(dir.path().join("konek.db")).unwrap();
    SledRowStore::new(Arc::new(db)).unwrap()
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RowStore> = Arc::new(open_sled(&dir));
        Self::with_store(dir, store).await
    }

    pub async fn with_store(dir: TempDir, store: Arc<dyn RowStore>) -> Self {
        let requests = RequestService::new(store.clone());
        let blobs = Arc::new(RecordingBlobStore::default());
        let ledger = Arc::new(RecordingLedger::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let workflow = CompletionWorkflow::new(
            requests.clone(),
            blobs.clone(),
            ledger.clone(),
            notifier.clone(),
            WorkflowConfig {
                explorer_tx_url: Some("https://sepolia.etherscan.io/tx/".into()),
                ..Default::default()
            },
        );

        let official = requests
            .register_user("kagawad@example.com", "Kagawad Santos", Role::Official)
            .await
            .unwrap()
            .actor();
        let resident = requests
            .register_user("resident@example.com", "Maria Clara", Role::Resident)
            .await
            .unwrap();
        let resident = requests
            .review_sign_up(&official, resident.id, true)
            .await
            .unwrap();
        let certificate = requests
            .add_certificate(
                &official,
                NewCertificate {
                    name: "Barangay Clearance".into(),
                    fee: 5_000, // ₱50.00
                    requirements: "Valid ID, cedula".into(),
                    processing_time: "1-2 days".into(),
                },
            )
            .await
            .unwrap();

        Self {
            dir,
            store,
            requests,
            workflow,
            blobs,
            ledger,
            notifier,
            official,
            resident,
            certificate,
        }
    }

    pub async fn new_request(&self) -> Request {
        self.requests
            .create_request(
                &self.resident.actor(),
                self.certificate.id,
                "employment",
                "Barangay Clearance",
                Priority::Normal,
            )
            .await
            .unwrap()
    }

    pub async fn paid_request(&self) -> Request {
        let request = self.new_request().await;
        self.requests
            .mark_paid(&self.official, request.id)
            .await
            .unwrap()
    }

    pub async fn row(&self, id: RequestId) -> Request {
        self.store.get_request(id).await.unwrap()
    }

    pub fn watch_ledger(&self, id: RequestId) {
        *self.ledger.watch.lock().unwrap() = Some((self.store.clone(), id));
    }

    pub fn blob_calls(&self) -> usize {
        self.blobs.calls.load(Ordering::SeqCst)
    }
    pub fn ledger_calls(&self) -> usize {
        self.ledger.calls.load(Ordering::SeqCst)
    }
    pub fn notifier_calls(&self) -> usize {
        self.notifier.calls.load(Ordering::SeqCst)
    }
}
