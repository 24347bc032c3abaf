use serde_json::{Value, json};

use crate::records::router::MigrationPhase;
use crate::records::types::RevisionToken;

#[derive(Debug, thiserror::Error)]
pub enum RecordsStoreError {
    #[error("db error: {0}")]
    Db(String),
    #[error("corrupt records state: {0}")]
    Corrupt(String),
}

/// Which representation was authoritative when a desync was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAuthority {
    Legacy,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesyncDetail {
    pub authority: WriteAuthority,
    pub expected_count: usize,
    pub mirror_count: Option<usize>,
    pub missing_ids: Vec<String>,
    pub extra_ids: Vec<String>,
    pub hash_mismatch_ids: Vec<String>,
    pub cause: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordsError {
    #[error("expectedUpdatedAt is required for records writes")]
    PreconditionRequired,
    #[error("records were modified concurrently")]
    Conflict { current: Option<RevisionToken> },
    #[error("invalid expectedUpdatedAt: {0}")]
    InvalidExpectedToken(String),
    #[error("invalid records payload: {0}")]
    InvalidRecords(String),
    #[error("records payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("not allowed in migration phase {phase}: {message}")]
    PhaseMismatch {
        phase: MigrationPhase,
        message: String,
    },
    #[error("records mirror desync: expected {} rows", .0.expected_count)]
    Desync(Box<DesyncDetail>),
    #[error(transparent)]
    Store(#[from] RecordsStoreError),
}

impl RecordsError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PreconditionRequired => "records_precondition_required",
            Self::Conflict { .. } => "records_conflict",
            Self::InvalidExpectedToken(_) => "invalid_expected_updated_at",
            Self::InvalidRecords(_) => "invalid_records",
            Self::PayloadTooLarge(_) => "records_payload_too_large",
            Self::PhaseMismatch { .. } => "records_phase_mismatch",
            Self::Desync(detail) => match detail.authority {
                WriteAuthority::Legacy => "records_v2_dual_write_desync",
                WriteAuthority::Mirror => "records_v2_write_desync",
            },
            Self::Store(_) => "records_store_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidExpectedToken(message)
            | Self::InvalidRecords(message)
            | Self::PayloadTooLarge(message) => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::PreconditionRequired => 428,
            Self::Conflict { .. } | Self::PhaseMismatch { .. } => 409,
            Self::InvalidExpectedToken(_) | Self::InvalidRecords(_) => 400,
            Self::PayloadTooLarge(_) => 413,
            Self::Desync(_) => 500,
            Self::Store(_) => 503,
        }
    }

    /// Conflicts are resolved by re-reading; store outages may clear on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Store(_))
    }

    pub fn current_updated_at(&self) -> Option<RevisionToken> {
        match self {
            Self::Conflict { current } => *current,
            _ => None,
        }
    }

    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "error": self.code(),
            "message": self.message(),
        });
        if let (Self::Conflict { current }, Some(object)) = (self, body.as_object_mut()) {
            object.insert(
                "currentUpdatedAt".to_string(),
                current.map_or(Value::Null, |token| Value::String(token.to_string())),
            );
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn conflict_body_carries_current_token() {
        let token = RevisionToken::from_datetime(Utc::now());
        let error = RecordsError::Conflict {
            current: Some(token),
        };
        assert_eq!(error.status_code(), 409);
        assert!(error.is_retryable());
        let body = error.to_body();
        assert_eq!(body["error"], "records_conflict");
        assert_eq!(body["currentUpdatedAt"], token.to_string());
    }

    #[test]
    fn desync_code_follows_authority() {
        let detail = DesyncDetail {
            authority: WriteAuthority::Legacy,
            expected_count: 2,
            mirror_count: Some(1),
            missing_ids: vec!["b".to_string()],
            extra_ids: Vec::new(),
            hash_mismatch_ids: Vec::new(),
            cause: None,
        };
        let legacy = RecordsError::Desync(Box::new(detail.clone()));
        assert_eq!(legacy.code(), "records_v2_dual_write_desync");
        assert_eq!(legacy.status_code(), 500);
        assert!(!legacy.is_retryable());

        let mirror = RecordsError::Desync(Box::new(DesyncDetail {
            authority: WriteAuthority::Mirror,
            ..detail
        }));
        assert_eq!(mirror.code(), "records_v2_write_desync");
    }

    #[test]
    fn precondition_and_token_errors_map_to_client_statuses() {
        assert_eq!(RecordsError::PreconditionRequired.status_code(), 428);
        assert_eq!(
            RecordsError::InvalidExpectedToken("bad".to_string()).status_code(),
            400
        );
        assert!(RecordsError::PreconditionRequired.to_body().get("currentUpdatedAt").is_none());
    }
}
