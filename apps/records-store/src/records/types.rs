use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Timelike, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::records::error::RecordsError;

pub const RECORD_ID_MAX_CHARS: usize = 128;
pub const RECORD_NOTES_MAX_CHARS: usize = 4_000;
pub const RECORD_FIELD_MAX_CHARS: usize = 512;

pub const DEFAULT_MAX_RECORDS: usize = 5_000;
pub const DEFAULT_MAX_PATCH_OPERATIONS: usize = 500;

/// Closed set of fields a client ledger record may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordField {
    Id,
    CreatedAt,
    ClientName,
    ContactName,
    CompanyName,
    Email,
    Phone,
    Address,
    ClosedBy,
    AccountManager,
    ServiceType,
    PackageName,
    Status,
    ContractStart,
    ContractEnd,
    PaymentFrequency,
    PaymentMethod,
    ContractAmount,
    AmountPaid,
    BalanceDue,
    LastPaymentDate,
    NextPaymentDate,
    InvoiceNumber,
    QuickbooksCustomerId,
    GhlContactId,
    LeadSource,
    ReferredBy,
    Notes,
    Tags,
    UpdatedBy,
}

impl RecordField {
    pub const ALL: [Self; 30] = [
        Self::Id,
        Self::CreatedAt,
        Self::ClientName,
        Self::ContactName,
        Self::CompanyName,
        Self::Email,
        Self::Phone,
        Self::Address,
        Self::ClosedBy,
        Self::AccountManager,
        Self::ServiceType,
        Self::PackageName,
        Self::Status,
        Self::ContractStart,
        Self::ContractEnd,
        Self::PaymentFrequency,
        Self::PaymentMethod,
        Self::ContractAmount,
        Self::AmountPaid,
        Self::BalanceDue,
        Self::LastPaymentDate,
        Self::NextPaymentDate,
        Self::InvoiceNumber,
        Self::QuickbooksCustomerId,
        Self::GhlContactId,
        Self::LeadSource,
        Self::ReferredBy,
        Self::Notes,
        Self::Tags,
        Self::UpdatedBy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::CreatedAt => "createdAt",
            Self::ClientName => "clientName",
            Self::ContactName => "contactName",
            Self::CompanyName => "companyName",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Address => "address",
            Self::ClosedBy => "closedBy",
            Self::AccountManager => "accountManager",
            Self::ServiceType => "serviceType",
            Self::PackageName => "packageName",
            Self::Status => "status",
            Self::ContractStart => "contractStart",
            Self::ContractEnd => "contractEnd",
            Self::PaymentFrequency => "paymentFrequency",
            Self::PaymentMethod => "paymentMethod",
            Self::ContractAmount => "contractAmount",
            Self::AmountPaid => "amountPaid",
            Self::BalanceDue => "balanceDue",
            Self::LastPaymentDate => "lastPaymentDate",
            Self::NextPaymentDate => "nextPaymentDate",
            Self::InvoiceNumber => "invoiceNumber",
            Self::QuickbooksCustomerId => "quickbooksCustomerId",
            Self::GhlContactId => "ghlContactId",
            Self::LeadSource => "leadSource",
            Self::ReferredBy => "referredBy",
            Self::Notes => "notes",
            Self::Tags => "tags",
            Self::UpdatedBy => "updatedBy",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|field| field.as_str() == raw)
    }

    pub fn max_chars(self) -> usize {
        match self {
            Self::Id => RECORD_ID_MAX_CHARS,
            Self::Notes => RECORD_NOTES_MAX_CHARS,
            _ => RECORD_FIELD_MAX_CHARS,
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordValidationError {
    #[error("record must be a JSON object")]
    NotAnObject,
    #[error("unknown record field: {0}")]
    UnknownField(String),
    #[error("record field {field} must be a scalar value")]
    NotScalar { field: &'static str },
    #[error("record field {field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("record id is required")]
    MissingId,
    #[error("record id cannot be changed")]
    ImmutableId,
}

/// One client ledger record. `id` is always present and never changes once
/// the record exists; every other field is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    id: String,
    fields: BTreeMap<RecordField, String>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Result<Self, RecordValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RecordValidationError::MissingId);
        }
        check_length(RecordField::Id, &id)?;
        Ok(Self {
            id,
            fields: BTreeMap::new(),
        })
    }

    pub fn with(
        mut self,
        field: RecordField,
        value: impl Into<String>,
    ) -> Result<Self, RecordValidationError> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn set(
        &mut self,
        field: RecordField,
        value: impl Into<String>,
    ) -> Result<(), RecordValidationError> {
        if field == RecordField::Id {
            return Err(RecordValidationError::ImmutableId);
        }
        let value = value.into();
        check_length(field, &value)?;
        self.fields.insert(field, value);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, field: RecordField) -> Option<&str> {
        if field == RecordField::Id {
            return Some(&self.id);
        }
        self.fields.get(&field).map(String::as_str)
    }

    /// Field/value pairs including `id`, in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = (RecordField, &str)> {
        std::iter::once((RecordField::Id, self.id.as_str())).chain(
            self.fields
                .iter()
                .map(|(field, value)| (*field, value.as_str())),
        )
    }

    pub fn from_value(value: &Value) -> Result<Self, RecordValidationError> {
        let Value::Object(object) = value else {
            return Err(RecordValidationError::NotAnObject);
        };

        let mut id = None;
        let mut fields = BTreeMap::new();
        for (key, raw) in object {
            let field = RecordField::parse(key)
                .ok_or_else(|| RecordValidationError::UnknownField(key.clone()))?;
            let Some(text) = scalar_text(field, raw)? else {
                continue;
            };
            check_length(field, &text)?;
            if field == RecordField::Id {
                id = Some(text);
            } else {
                fields.insert(field, text);
            }
        }

        let id = id
            .filter(|value| !value.trim().is_empty())
            .ok_or(RecordValidationError::MissingId)?;
        Ok(Self { id, fields })
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries()
                .map(|(field, value)| (field.as_str().to_string(), Value::String(value.to_string())))
                .collect(),
        )
    }
}

fn scalar_text(field: RecordField, raw: &Value) -> Result<Option<String>, RecordValidationError> {
    match raw {
        Value::Null => Ok(None),
        Value::String(value) => Ok(Some(value.clone())),
        Value::Number(value) => Ok(Some(value.to_string())),
        Value::Bool(value) => Ok(Some(value.to_string())),
        Value::Array(_) | Value::Object(_) => Err(RecordValidationError::NotScalar {
            field: field.as_str(),
        }),
    }
}

fn check_length(field: RecordField, value: &str) -> Result<(), RecordValidationError> {
    let max = field.max_chars();
    if value.chars().count() > max {
        return Err(RecordValidationError::TooLong {
            field: field.as_str(),
            max,
        });
    }
    Ok(())
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        for (field, value) in self.entries() {
            map.serialize_entry(field.as_str(), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(de::Error::custom)
    }
}

pub fn find_duplicate_id(records: &[Record]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .map(Record::id)
        .find(|id| !seen.insert(*id))
}

/// Optimistic-concurrency handle of the singleton state row.
///
/// Tokens are UTC instants truncated to microseconds (the precision postgres
/// keeps) and rendered as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionToken(DateTime<Utc>);

impl RevisionToken {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let micros_only = at.nanosecond() / 1_000 * 1_000;
        Self(at.with_nanosecond(micros_only).unwrap_or(at))
    }

    pub fn parse(raw: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|parsed| Self::from_datetime(parsed.with_timezone(&Utc)))
    }

    /// Strictly greater than `previous`, so a token is never handed out twice.
    pub fn next_after(previous: Option<&Self>, now: DateTime<Utc>) -> Self {
        let candidate = Self::from_datetime(now);
        match previous {
            Some(previous) if candidate <= *previous => {
                Self(previous.0 + Duration::microseconds(1))
            }
            _ => candidate,
        }
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl Serialize for RevisionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevisionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

/// What a writer believes the current revision to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// The caller sent no `expectedUpdatedAt` at all.
    Missing,
    /// The caller sent `null`: it expects a store that has never been written.
    Absent,
    Token(RevisionToken),
}

impl ExpectedRevision {
    pub fn from_field(field: Option<&Value>) -> Result<Self, RecordsError> {
        match field {
            None => Ok(Self::Missing),
            Some(Value::Null) => Ok(Self::Absent),
            Some(Value::String(raw)) => RevisionToken::parse(raw)
                .map(Self::Token)
                .map_err(|error| RecordsError::InvalidExpectedToken(format!("{raw:?}: {error}"))),
            Some(other) => Err(RecordsError::InvalidExpectedToken(format!(
                "expected string or null, got {other}"
            ))),
        }
    }

    pub fn from_current(current: Option<RevisionToken>) -> Self {
        current.map_or(Self::Absent, Self::Token)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatchOperation {
    Upsert { id: String, record: Record },
    Delete { id: String },
}

impl PatchOperation {
    pub fn upsert(record: Record) -> Self {
        Self::Upsert {
            id: record.id().to_string(),
            record,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self::Delete { id: id.into() }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Upsert { id, .. } | Self::Delete { id } => id,
        }
    }

    fn from_value(index: usize, value: &Value) -> Result<Self, RecordsError> {
        let invalid = |message: String| RecordsError::InvalidRecords(format!("operations[{index}]: {message}"));
        let object = value
            .as_object()
            .ok_or_else(|| invalid("operation must be a JSON object".to_string()))?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid("id is required".to_string()))?;

        match object.get("type").and_then(Value::as_str) {
            Some("upsert") => {
                let record = object
                    .get("record")
                    .ok_or_else(|| invalid("record is required for upsert".to_string()))
                    .and_then(|raw| Record::from_value(raw).map_err(|error| invalid(error.to_string())))?;
                if record.id() != id {
                    return Err(invalid(format!(
                        "record.id {:?} does not match operation id {id:?}",
                        record.id()
                    )));
                }
                Ok(Self::Upsert {
                    id: id.to_string(),
                    record,
                })
            }
            Some("delete") => Ok(Self::Delete { id: id.to_string() }),
            Some(other) => Err(invalid(format!("unsupported operation type {other:?}"))),
            None => Err(invalid("type is required".to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordsLimits {
    pub max_records: usize,
    pub max_patch_operations: usize,
}

impl Default for RecordsLimits {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_patch_operations: DEFAULT_MAX_PATCH_OPERATIONS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub records: Vec<Record>,
    pub expected: ExpectedRevision,
}

impl PutRequest {
    /// Parses `{ "records": [...], "expectedUpdatedAt": ... }`.
    pub fn from_value(body: &Value) -> Result<Self, RecordsError> {
        let object = body.as_object().ok_or_else(|| {
            RecordsError::InvalidRecords("request body must be a JSON object".to_string())
        })?;
        let expected = ExpectedRevision::from_field(object.get("expectedUpdatedAt"))?;
        let records = object
            .get("records")
            .and_then(Value::as_array)
            .ok_or_else(|| RecordsError::InvalidRecords("records must be an array".to_string()))?
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                Record::from_value(raw).map_err(|error| {
                    RecordsError::InvalidRecords(format!("records[{index}]: {error}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { records, expected })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRequest {
    pub operations: Vec<PatchOperation>,
    pub expected: ExpectedRevision,
}

impl PatchRequest {
    /// Parses `{ "operations": [...], "expectedUpdatedAt": ... }`.
    pub fn from_value(body: &Value) -> Result<Self, RecordsError> {
        let object = body.as_object().ok_or_else(|| {
            RecordsError::InvalidRecords("request body must be a JSON object".to_string())
        })?;
        let expected = ExpectedRevision::from_field(object.get("expectedUpdatedAt"))?;
        let operations = object
            .get("operations")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                RecordsError::InvalidRecords("operations must be an array".to_string())
            })?
            .iter()
            .enumerate()
            .map(|(index, raw)| PatchOperation::from_value(index, raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            operations,
            expected,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Legacy,
    Mirror,
}

impl ReadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Mirror => "mirror",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsSnapshot {
    pub records: Vec<Record>,
    pub updated_at: Option<RevisionToken>,
    #[serde(skip)]
    pub source: ReadSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutResponse {
    pub updated_at: RevisionToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchResponse {
    pub updated_at: RevisionToken,
    pub applied_operations: usize,
}

/// Legacy singleton state as stored in the JSON blob column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacySnapshot {
    pub state_id: String,
    pub records: Vec<Record>,
    pub updated_at: Option<RevisionToken>,
    /// The token advanced past this blob while the mirror was authoritative.
    pub stale: bool,
}

impl LegacySnapshot {
    /// A state row that has never been written.
    pub fn empty(state_id: impl Into<String>) -> Self {
        Self {
            state_id: state_id.into(),
            records: Vec::new(),
            updated_at: None,
            stale: false,
        }
    }
}

/// Per-record relational copy of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRow {
    pub state_id: String,
    pub record_id: String,
    pub position: i64,
    pub record: Record,
    pub content_hash: String,
    pub primary_name: Option<String>,
    pub company_name: Option<String>,
    pub owner_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mirror rows (ordered by position) together with the state token observed
/// in the same database snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSnapshot {
    pub state_id: String,
    pub rows: Vec<MirrorRow>,
    pub updated_at: Option<RevisionToken>,
}

impl MirrorSnapshot {
    pub fn records(&self) -> Vec<Record> {
        self.rows.iter().map(|row| row.record.clone()).collect()
    }
}
