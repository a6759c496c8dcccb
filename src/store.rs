//! Row store for the `mUsers`, `mCertificate` and `mRequest` tables
//!
//! Reads only ever return live rows (`del_flag = 0`). Every update is
//! conditional on the row still matching the snapshot the caller read, so two
//! writers racing on the same row cannot both commit.
use super::error::StoreError;
use super::types::{
    Certificate, CertificateId, DELETED, LIVE, NewCertificate, NewRequest, NewUser, Request,
    RequestId, RequestPatch, SignUpStatus, TimeStamp, User, UserId,
};
use async_trait::async_trait;
use sled::{Db, Tree};
use std::sync::Arc;

pub const USERS: &str = "mUsers";
pub const CERTIFICATES: &str = "mCertificate";
pub const REQUESTS: &str = "mRequest";
const COUNTERS: &str = "counters";

#[async_trait]
pub trait RowStore: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<User, StoreError>;
    async fn insert_user(&self, draft: NewUser) -> Result<User, StoreError>;
    /// Sets the sign-up status if the row still equals `expected`.
    async fn update_user(
        &self,
        expected: &User,
        sign_up_status: SignUpStatus,
    ) -> Result<User, StoreError>;

    async fn get_certificate(&self, id: CertificateId) -> Result<Certificate, StoreError>;
    async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError>;
    async fn insert_certificate(&self, draft: NewCertificate) -> Result<Certificate, StoreError>;
    async fn soft_delete_certificate(&self, id: CertificateId) -> Result<(), StoreError>;

    async fn get_request(&self, id: RequestId) -> Result<Request, StoreError>;
    async fn list_requests(&self) -> Result<Vec<Request>, StoreError>;
    async fn insert_request(&self, draft: NewRequest) -> Result<Request, StoreError>;
    /// Applies `patch` if the stored row still equals `expected`, bumping
    /// `updated_at`. Otherwise fails with [`StoreError::ConcurrencyConflict`].
    async fn update_request(
        &self,
        expected: &Request,
        patch: RequestPatch,
    ) -> Result<Request, StoreError>;
    async fn soft_delete_request(&self, id: RequestId) -> Result<Request, StoreError>;
}

/// Row store backed by one sled tree per table. Rows are CBOR encoded and
/// keyed by their big-endian id.
#[derive(Clone)]
pub struct SledRowStore {
    instance: Arc<Db>,
    users: Tree,
    certificates: Tree,
    requests: Tree,
    counters: Tree,
}

impl SledRowStore {
    pub fn new(instance: Arc<Db>) -> Result<Self, StoreError> {
        Ok(Self {
            users: instance.open_tree(USERS)?,
            certificates: instance.open_tree(CERTIFICATES)?,
            requests: instance.open_tree(REQUESTS)?,
            counters: instance.open_tree(COUNTERS)?,
            instance,
        })
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.instance
    }

    // ids start at 1 and are never reused
    fn next_id(&self, table: &str) -> Result<u64, StoreError> {
        let bumped = self.counters.update_and_fetch(table, |old| {
            let current = old
                .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            Some((current + 1).to_be_bytes().to_vec())
        })?;

        Ok(bumped
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_ref()).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(1))
    }

    fn load<T>(tree: &Tree, table: &'static str, id: u64) -> Result<(sled::IVec, T), StoreError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let raw = tree
            .get(id.to_be_bytes())?
            .ok_or(StoreError::NotFound { table, id })?;
        let row: T = minicbor::decode(&raw)?;
        Ok((raw, row))
    }

    /// Swaps `old` for `row`. Fails if anyone wrote the key in between.
    fn swap<T>(
        tree: &Tree,
        table: &'static str,
        id: u64,
        old: sled::IVec,
        row: &T,
    ) -> Result<(), StoreError>
    where
        T: minicbor::Encode<()>,
    {
        let encoded = minicbor::to_vec(row)?;
        tree.compare_and_swap(id.to_be_bytes(), Some(old), Some(encoded))?
            .map_err(|_| StoreError::ConcurrencyConflict { table, id })
    }

    fn scan<T>(tree: &Tree) -> Result<Vec<T>, StoreError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        tree.iter()
            .values()
            .map(|raw| -> Result<T, StoreError> {
                let raw = raw?;
                Ok(minicbor::decode(&raw)?)
            })
            .collect()
    }
}

#[async_trait]
impl RowStore for SledRowStore {
    async fn get_user(&self, id: UserId) -> Result<User, StoreError> {
        let (_, user): (_, User) = Self::load(&self.users, USERS, id)?;
        if user.del_flag != LIVE {
            return Err(StoreError::NotFound { table: USERS, id });
        }
        Ok(user)
    }

    async fn insert_user(&self, draft: NewUser) -> Result<User, StoreError> {
        let id = self.next_id(USERS)?;
        let now = TimeStamp::new();
        let user = User {
            id,
            email: draft.email,
            full_name: draft.full_name,
            role: draft.role,
            sign_up_status: draft.sign_up_status,
            del_flag: LIVE,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(id.to_be_bytes(), minicbor::to_vec(&user)?)?;
        Ok(user)
    }

    async fn update_user(
        &self,
        expected: &User,
        sign_up_status: SignUpStatus,
    ) -> Result<User, StoreError> {
        let id = expected.id;
        let (raw, current): (_, User) = Self::load(&self.users, USERS, id)?;
        if current != *expected {
            return Err(StoreError::ConcurrencyConflict { table: USERS, id });
        }

        let mut next = current;
        next.sign_up_status = sign_up_status;
        next.updated_at = TimeStamp::new();
        Self::swap(&self.users, USERS, id, raw, &next)?;
        Ok(next)
    }

    async fn get_certificate(&self, id: CertificateId) -> Result<Certificate, StoreError> {
        let (_, certificate): (_, Certificate) =
            Self::load(&self.certificates, CERTIFICATES, id)?;
        if certificate.del_flag != LIVE {
            return Err(StoreError::NotFound {
                table: CERTIFICATES,
                id,
            });
        }
        Ok(certificate)
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError> {
        let rows: Vec<Certificate> = Self::scan(&self.certificates)?;
        Ok(rows.into_iter().filter(|c| c.del_flag == LIVE).collect())
    }

    async fn insert_certificate(&self, draft: NewCertificate) -> Result<Certificate, StoreError> {
        let id = self.next_id(CERTIFICATES)?;
        let now = TimeStamp::new();
        let certificate = Certificate {
            id,
            name: draft.name,
            fee: draft.fee,
            requirements: draft.requirements,
            processing_time: draft.processing_time,
            del_flag: LIVE,
            created_at: now,
            updated_at: now,
        };
        self.certificates
            .insert(id.to_be_bytes(), minicbor::to_vec(&certificate)?)?;
        Ok(certificate)
    }

    async fn soft_delete_certificate(&self, id: CertificateId) -> Result<(), StoreError> {
        let (raw, mut certificate): (_, Certificate) =
            Self::load(&self.certificates, CERTIFICATES, id)?;
        if certificate.del_flag != LIVE {
            return Err(StoreError::NotFound {
                table: CERTIFICATES,
                id,
            });
        }
        certificate.del_flag = DELETED;
        certificate.updated_at = TimeStamp::new();
        Self::swap(&self.certificates, CERTIFICATES, id, raw, &certificate)
    }

    async fn get_request(&self, id: RequestId) -> Result<Request, StoreError> {
        let (_, request): (_, Request) = Self::load(&self.requests, REQUESTS, id)?;
        if !request.is_live() {
            return Err(StoreError::NotFound {
                table: REQUESTS,
                id,
            });
        }
        Ok(request)
    }

    async fn list_requests(&self) -> Result<Vec<Request>, StoreError> {
        let rows: Vec<Request> = Self::scan(&self.requests)?;
        Ok(rows.into_iter().filter(Request::is_live).collect())
    }

    async fn insert_request(&self, draft: NewRequest) -> Result<Request, StoreError> {
        let id = self.next_id(REQUESTS)?;
        let now = TimeStamp::new();
        let request = Request {
            id,
            certificate_id: draft.certificate_id,
            requester_id: draft.requester_id,
            purpose: draft.purpose,
            document_type: draft.document_type,
            priority: draft.priority,
            request_date: now,
            status: draft.status,
            payment_status: draft.payment_status,
            document_url: None,
            ledger_tx: None,
            notified_at: None,
            del_flag: LIVE,
            created_at: now,
            updated_at: now,
            ledger_submitted_at: None,
        };
        self.requests
            .insert(id.to_be_bytes(), minicbor::to_vec(&request)?)?;
        Ok(request)
    }

    async fn update_request(
        &self,
        expected: &Request,
        patch: RequestPatch,
    ) -> Result<Request, StoreError> {
        let id = expected.id;
        let (raw, current): (_, Request) = Self::load(&self.requests, REQUESTS, id)?;
        if !current.is_live() {
            return Err(StoreError::NotFound {
                table: REQUESTS,
                id,
            });
        }
        if current != *expected {
            return Err(StoreError::ConcurrencyConflict {
                table: REQUESTS,
                id,
            });
        }

        let mut next = current;
        patch.apply(&mut next);
        next.updated_at = TimeStamp::new();
        Self::swap(&self.requests, REQUESTS, id, raw, &next)?;
        Ok(next)
    }

    async fn soft_delete_request(&self, id: RequestId) -> Result<Request, StoreError> {
        // a delete has no expected state, so retry until the swap lands
        loop {
            let (raw, mut request): (_, Request) = Self::load(&self.requests, REQUESTS, id)?;
            if !request.is_live() {
                return Err(StoreError::NotFound {
                    table: REQUESTS,
                    id,
                });
            }
            request.del_flag = DELETED;
            request.updated_at = TimeStamp::new();
            match Self::swap(&self.requests, REQUESTS, id, raw, &request) {
                Err(StoreError::ConcurrencyConflict { .. }) => continue,
                other => return other.map(|_| request),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaymentStatus, Priority, RequestStatus, Role};
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> SledRowStore {
        let db = sled::open(dir.path().join("rows.db")).unwrap();
        SledRowStore::new(Arc::new(db)).unwrap()
    }

    fn draft() -> NewRequest {
        NewRequest {
            certificate_id: 1,
            requester_id: 1,
            purpose: "scholarship".into(),
            document_type: "Certificate of Indigency".into(),
            priority: Priority::Urgent,
            status: RequestStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
        }
    }

    #[tokio::test]
    async fn ids_are_sequential_per_table() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let a = store.insert_request(draft()).await.unwrap();
        let b = store.insert_request(draft()).await.unwrap();
        let user = store
            .insert_user(NewUser {
                email: "kap@example.com".into(),
                full_name: "Kapitan".into(),
                role: Role::Official,
                sign_up_status: SignUpStatus::Approved,
            })
            .await
            .unwrap();

        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(user.id, 1);
    }

    #[tokio::test]
    async fn stale_snapshot_is_a_conflict() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let snapshot = store.insert_request(draft()).await.unwrap();

        let paid = RequestPatch {
            payment_status: Some(PaymentStatus::Paid),
            ..Default::default()
        };
        let winner = store.update_request(&snapshot, paid.clone()).await.unwrap();
        assert_eq!(winner.payment_status, PaymentStatus::Paid);
        assert!(winner.updated_at >= snapshot.updated_at);

        let loser = store.update_request(&snapshot, paid).await;
        assert!(matches!(
            loser,
            Err(StoreError::ConcurrencyConflict { table: REQUESTS, .. })
        ));
        assert_eq!(store.get_request(snapshot.id).await.unwrap(), winner);
    }

    #[tokio::test]
    async fn deleted_rows_are_hidden() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let request = store.insert_request(draft()).await.unwrap();

        let deleted = store.soft_delete_request(request.id).await.unwrap();
        assert_eq!(deleted.del_flag, DELETED);
        assert_eq!(deleted.status, request.status);

        assert!(matches!(
            store.get_request(request.id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.list_requests().await.unwrap().is_empty());
        assert!(store.soft_delete_request(request.id).await.is_err());
    }
}
