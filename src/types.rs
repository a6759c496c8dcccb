//! Row types for users, certificates and requests
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type RequestId = u64;
pub type CertificateId = u64;
pub type UserId = u64;

/// Soft-delete marker for a live row.
pub const LIVE: u8 = 0;
/// Soft-delete marker for a removed row.
pub const DELETED: u8 = 1;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Generates `as_str`, `Display` and `FromStr` for the enums stored as strings
/// by the web layer. The strings are case sensitive.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    ForConfirmation,
    #[n(2)]
    Completed,
    #[n(3)]
    Rejected,
}

string_enum!(RequestStatus {
    Pending => "pending",
    ForConfirmation => "for_confirmation",
    Completed => "completed",
    Rejected => "rejected",
});

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[n(0)]
    Unpaid,
    #[n(1)]
    Pending, // resident reported a payment that is not yet verified
    #[n(2)]
    Paid,
}

string_enum!(PaymentStatus {
    Unpaid => "unpaid",
    Pending => "pending",
    Paid => "paid",
});

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    #[n(0)]
    Normal,
    #[n(1)]
    Urgent,
}

string_enum!(Priority {
    Normal => "normal",
    Urgent => "urgent",
});

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[n(0)]
    Resident,
    #[n(1)]
    Official,
    #[n(2)]
    Admin,
}

string_enum!(Role {
    Resident => "resident",
    Official => "official",
    Admin => "admin",
});

impl Role {
    /// Officials and admins may act on other residents' requests.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Official | Role::Admin)
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum SignUpStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

string_enum!(SignUpStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// The identity performing an operation. Passed explicitly into every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }
}

// mUsers
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    #[n(0)]
    pub id: UserId,
    #[n(1)]
    pub email: String,
    #[n(2)]
    pub full_name: String,
    #[n(3)]
    pub role: Role,
    #[n(4)]
    pub sign_up_status: SignUpStatus,
    #[n(5)]
    pub del_flag: u8,
    #[n(6)]
    pub created_at: TimeStamp,
    #[n(7)]
    pub updated_at: TimeStamp,
}

impl User {
    pub fn actor(&self) -> Actor {
        Actor::new(self.id, self.role)
    }
}

// mCertificate
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    #[n(0)]
    pub id: CertificateId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub fee: u64, // centavos
    #[n(3)]
    pub requirements: String,
    #[n(4)]
    pub processing_time: String,
    #[n(5)]
    pub del_flag: u8,
    #[n(6)]
    pub created_at: TimeStamp,
    #[n(7)]
    pub updated_at: TimeStamp,
}

// mRequest
#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    #[n(0)]
    pub id: RequestId,
    #[n(1)]
    pub certificate_id: CertificateId,
    #[n(2)]
    pub requester_id: UserId,
    #[n(3)]
    pub purpose: String,
    #[n(4)]
    pub document_type: String,
    #[n(5)]
    pub priority: Priority,
    #[n(6)]
    pub request_date: TimeStamp,
    #[n(7)]
    pub status: RequestStatus,
    #[n(8)]
    pub payment_status: PaymentStatus,
    #[n(9)]
    pub document_url: Option<String>,
    #[n(10)]
    pub ledger_tx: Option<String>, // set at most once
    #[n(11)]
    pub notified_at: Option<TimeStamp>,
    #[n(12)]
    pub del_flag: u8,
    #[n(13)]
    pub created_at: TimeStamp,
    #[n(14)]
    pub updated_at: TimeStamp,
    /// Held while a ledger submission is in flight. Cleared if it fails.
    #[n(15)]
    pub ledger_submitted_at: Option<TimeStamp>,
}

impl Request {
    pub fn is_live(&self) -> bool {
        self.del_flag == LIVE
    }
}

/// Fields supplied when inserting a user. The store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub sign_up_status: SignUpStatus,
}

#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub name: String,
    pub fee: u64,
    pub requirements: String,
    pub processing_time: String,
}

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub certificate_id: CertificateId,
    pub requester_id: UserId,
    pub purpose: String,
    pub document_type: String,
    pub priority: Priority,
    pub status: RequestStatus,
    pub payment_status: PaymentStatus,
}

/// A partial update to a request row. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestPatch {
    pub status: Option<RequestStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub document_url: Option<String>,
    pub ledger_tx: Option<String>,
    pub notified_at: Option<Option<TimeStamp>>,
    pub ledger_submitted_at: Option<Option<TimeStamp>>,
    pub del_flag: Option<u8>,
}

impl RequestPatch {
    /// Writes the patch into `row`. A ledger transaction already on the row is
    /// never replaced or cleared.
    pub fn apply(self, row: &mut Request) {
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(payment_status) = self.payment_status {
            row.payment_status = payment_status;
        }
        if let Some(url) = self.document_url {
            row.document_url = Some(url);
        }
        if let Some(tx) = self.ledger_tx {
            if row.ledger_tx.is_none() {
                row.ledger_tx = Some(tx);
            }
        }
        if let Some(notified_at) = self.notified_at {
            row.notified_at = notified_at;
        }
        if let Some(submitted_at) = self.ledger_submitted_at {
            row.ledger_submitted_at = submitted_at;
        }
        if let Some(flag) = self.del_flag {
            row.del_flag = flag;
        }
    }
}
