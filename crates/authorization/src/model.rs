//! Authorization records and the value types around them.
//!
//! An [`Authorization`] is created in [`AuthorizationStatus::Draft`] and only
//! changes status through [`apply_transition`](crate::transition::apply_transition).
//! Its fields are read through accessors; nothing outside this crate can
//! move a record between states.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Defines a transparent `i64` newtype with the usual conversions.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Opaque, immutable identifier of an authorization record.
    AuthorizationId
);

define_id!(
    /// Opaque reference to the insurance policy an authorization belongs to.
    PolicyId
);

/// Error returned when parsing an enumerated string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Category of care an authorization covers.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Inpatient admission.
    Inpatient,
    /// Outpatient procedure or visit.
    Outpatient,
    /// Surgical procedure.
    Surgery,
    /// Advanced imaging (MRI, CT, PET).
    Imaging,
    /// Specialty pharmacy.
    Pharmacy,
    /// Durable medical equipment.
    DurableMedicalEquipment,
    /// Behavioral or mental health services.
    BehavioralHealth,
    /// Home health care.
    HomeHealth,
    /// Physical, occupational or speech rehabilitation.
    Rehabilitation,
}

impl ServiceType {
    /// All service types, in declaration order.
    pub const ALL: [ServiceType; 9] = [
        Self::Inpatient,
        Self::Outpatient,
        Self::Surgery,
        Self::Imaging,
        Self::Pharmacy,
        Self::DurableMedicalEquipment,
        Self::BehavioralHealth,
        Self::HomeHealth,
        Self::Rehabilitation,
    ];

    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inpatient => "inpatient",
            Self::Outpatient => "outpatient",
            Self::Surgery => "surgery",
            Self::Imaging => "imaging",
            Self::Pharmacy => "pharmacy",
            Self::DurableMedicalEquipment => "durable_medical_equipment",
            Self::BehavioralHealth => "behavioral_health",
            Self::HomeHealth => "home_health",
            Self::Rehabilitation => "rehabilitation",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEnumError { kind: "service type", value: s.to_owned() })
    }
}

/// Lifecycle state of an authorization.
///
/// ```text
/// DRAFT ─► SUBMITTED ─► IN_REVIEW ─► APPROVED ─► EXPIRED
///              │          │   ▲  │       └─────► REVOKED
///              ▼          ▼   │  ▼
///          REJECTED   PENDING_INFO  DENIED
///                          └──────► DENIED
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorizationStatus {
    /// Created but not yet submitted. The only initial state.
    Draft,
    /// Submitted to the payer.
    Submitted,
    /// Under clinical review.
    InReview,
    /// Reviewer asked for more information.
    PendingInfo,
    /// Approved for the requested window.
    Approved,
    /// Denied after review. Terminal.
    Denied,
    /// Approval window lapsed. Terminal.
    Expired,
    /// Approval withdrawn. Terminal.
    Revoked,
    /// Rejected at intake. Terminal.
    Rejected,
}

impl AuthorizationStatus {
    /// All states, in declaration order.
    pub const ALL: [AuthorizationStatus; 9] = [
        Self::Draft,
        Self::Submitted,
        Self::InReview,
        Self::PendingInfo,
        Self::Approved,
        Self::Denied,
        Self::Expired,
        Self::Revoked,
        Self::Rejected,
    ];

    /// Returns `true` for states that admit no outgoing transition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Denied | Self::Expired | Self::Revoked | Self::Rejected)
    }

    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Submitted => "SUBMITTED",
            Self::InReview => "IN_REVIEW",
            Self::PendingInfo => "PENDING_INFO",
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
            Self::Expired => "EXPIRED",
            Self::Revoked => "REVOKED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthorizationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError { kind: "authorization status", value: s.to_owned() })
    }
}

/// Input to [`request_authorization`](crate::AuthorizationService::request_authorization).
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use priorauth_authorization::{AuthorizationRequest, PolicyId, ServiceType};
///
/// let request = AuthorizationRequest::builder()
///     .policy_id(PolicyId(42))
///     .service_type(ServiceType::Imaging)
///     .start_date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
///     .end_date(NaiveDate::from_ymd_opt(2024, 5, 31).unwrap())
///     .diagnosis_codes(["M54.5"])
///     .procedure_codes(["72148"])
///     .build();
/// assert_eq!(request.diagnosis_codes, vec!["M54.5".to_owned()]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct AuthorizationRequest {
    /// Policy the authorization is requested under.
    pub policy_id: PolicyId,
    /// Category of care.
    pub service_type: ServiceType,
    /// First covered day.
    pub start_date: NaiveDate,
    /// Last covered day; must not precede `start_date`.
    pub end_date: NaiveDate,
    /// Diagnosis codes, in clinical priority order. Must not be empty.
    #[builder(with = |codes: impl IntoIterator<Item = impl Into<String>>| {
        codes.into_iter().map(Into::into).collect()
    })]
    pub diagnosis_codes: Vec<String>,
    /// Procedure codes, in request order. Must not be empty.
    #[builder(with = |codes: impl IntoIterator<Item = impl Into<String>>| {
        codes.into_iter().map(Into::into).collect()
    })]
    pub procedure_codes: Vec<String>,
}

/// A prior-authorization record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    id: AuthorizationId,
    authorization_number: String,
    policy_id: PolicyId,
    service_type: ServiceType,
    start_date: NaiveDate,
    end_date: NaiveDate,
    diagnosis_codes: Vec<String>,
    procedure_codes: Vec<String>,
    status: AuthorizationStatus,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Authorization {
    /// Builds a fresh record in [`AuthorizationStatus::Draft`].
    ///
    /// The request is assumed to be validated already.
    pub(crate) fn draft(
        id: AuthorizationId,
        request: AuthorizationRequest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            authorization_number: authorization_number(id, now.date_naive()),
            policy_id: request.policy_id,
            service_type: request.service_type,
            start_date: request.start_date,
            end_date: request.end_date,
            diagnosis_codes: request.diagnosis_codes,
            procedure_codes: request.procedure_codes,
            status: AuthorizationStatus::Draft,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record identifier.
    #[must_use]
    pub fn id(&self) -> AuthorizationId {
        self.id
    }

    /// Human-readable, unique authorization number.
    #[must_use]
    pub fn authorization_number(&self) -> &str {
        &self.authorization_number
    }

    /// Policy the authorization belongs to.
    #[must_use]
    pub fn policy_id(&self) -> PolicyId {
        self.policy_id
    }

    /// Category of care.
    #[must_use]
    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// First covered day.
    #[must_use]
    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    /// Last covered day.
    #[must_use]
    pub fn end_date(&self) -> NaiveDate {
        self.end_date
    }

    /// Diagnosis codes in their original order.
    #[must_use]
    pub fn diagnosis_codes(&self) -> &[String] {
        &self.diagnosis_codes
    }

    /// Procedure codes in their original order.
    #[must_use]
    pub fn procedure_codes(&self) -> &[String] {
        &self.procedure_codes
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> AuthorizationStatus {
        self.status
    }

    /// Optimistic-concurrency version. Zero until first committed.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Timestamp of the last committed change.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns `true` if `date` falls inside the covered window.
    #[must_use]
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    /// Returns `true` if the record is approved and covers `date`.
    #[must_use]
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.status == AuthorizationStatus::Approved && self.covers(date)
    }

    /// Returns the record with its version replaced.
    ///
    /// Persistence implementations use this to stamp the committed version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Moves the record to `next`. Only the transition guard calls this.
    pub(crate) fn set_status(&mut self, next: AuthorizationStatus, now: DateTime<Utc>) {
        self.status = next;
        self.updated_at = self.updated_at.max(now);
    }
}

/// Formats `PA-{YYYYMMDD}-{id:08}`.
fn authorization_number(id: AuthorizationId, created_on: NaiveDate) -> String {
    format!("PA-{}-{:08}", created_on.format("%Y%m%d"), id.0)
}

/// Query criteria for [`check_authorization`](crate::AuthorizationService::check_authorization).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct CheckCriteria {
    /// Service types that must be covered. Empty means "any".
    #[builder(default, into)]
    #[serde(default)]
    pub service_types: Vec<ServiceType>,
    /// Day coverage is evaluated on. Defaults to today.
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
}

impl CheckCriteria {
    /// Sorts and deduplicates service types and pins the reference date.
    #[must_use]
    pub fn normalized(&self, today: NaiveDate) -> NormalizedCriteria {
        let mut service_types = self.service_types.clone();
        service_types.sort_unstable();
        service_types.dedup();
        NormalizedCriteria { service_types, reference_date: self.reference_date.unwrap_or(today) }
    }
}

/// Canonical form of [`CheckCriteria`]; equal queries normalize identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedCriteria {
    /// Sorted, deduplicated service types.
    pub service_types: Vec<ServiceType>,
    /// Day coverage is evaluated on.
    pub reference_date: NaiveDate,
}

impl NormalizedCriteria {
    /// Lowercase hex SHA-256 over the policy and every criterion.
    #[must_use]
    pub fn digest(&self, policy_id: PolicyId) -> String {
        let types: Vec<&str> = self.service_types.iter().map(|t| t.as_str()).collect();
        let canonical = format!("{policy_id}|{}|{}", types.join(","), self.reference_date);
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }
}

/// Answer to a coverage check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Policy that was checked.
    pub policy_id: PolicyId,
    /// Day coverage was evaluated on.
    pub reference_date: NaiveDate,
    /// `true` when every requested service type is covered (or, with no
    /// service types requested, when anything is covered).
    pub authorized: bool,
    /// Requested service types with an active approval.
    pub covered: Vec<ServiceType>,
    /// Requested service types without one.
    pub missing: Vec<ServiceType>,
    /// Active approvals that matched, in id order.
    pub authorizations: Vec<AuthorizationId>,
}

impl CheckResult {
    /// Evaluates `criteria` against every record of `policy_id`.
    #[must_use]
    pub fn evaluate(
        policy_id: PolicyId,
        criteria: &NormalizedCriteria,
        records: &[Authorization],
    ) -> Self {
        let date = criteria.reference_date;
        let mut active: Vec<&Authorization> = records
            .iter()
            .filter(|r| r.policy_id == policy_id && r.is_active_on(date))
            .filter(|r| {
                let wanted = &criteria.service_types;
                wanted.is_empty() || wanted.contains(&r.service_type)
            })
            .collect();
        active.sort_by_key(|r| r.id);

        let (covered, missing) = if criteria.service_types.is_empty() {
            let mut covered: Vec<ServiceType> = active.iter().map(|r| r.service_type).collect();
            covered.sort_unstable();
            covered.dedup();
            (covered, Vec::new())
        } else {
            criteria
                .service_types
                .iter()
                .copied()
                .partition(|t| active.iter().any(|r| r.service_type == *t))
        };

        let authorized = if criteria.service_types.is_empty() {
            !active.is_empty()
        } else {
            missing.is_empty()
        };

        Self {
            policy_id,
            reference_date: date,
            authorized,
            covered,
            missing,
            authorizations: active.iter().map(|r| r.id).collect(),
        }
    }
}
