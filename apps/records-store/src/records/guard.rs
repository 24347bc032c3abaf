use crate::records::error::RecordsError;
use crate::records::types::{ExpectedRevision, RevisionToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Granted,
    Conflict { current: Option<RevisionToken> },
    PreconditionRequired,
}

impl GuardDecision {
    pub fn into_result(self) -> Result<(), RecordsError> {
        match self {
            Self::Granted => Ok(()),
            Self::Conflict { current } => Err(RecordsError::Conflict { current }),
            Self::PreconditionRequired => Err(RecordsError::PreconditionRequired),
        }
    }
}

/// Compares the caller's expected revision with the one read under the row
/// lock. An absent expectation only matches a store that was never written.
pub fn check_token(expected: &ExpectedRevision, current: Option<&RevisionToken>) -> GuardDecision {
    match (expected, current) {
        (ExpectedRevision::Missing, _) => GuardDecision::PreconditionRequired,
        (ExpectedRevision::Absent, None) => GuardDecision::Granted,
        (ExpectedRevision::Token(expected), Some(current)) if expected == current => {
            GuardDecision::Granted
        }
        (_, current) => GuardDecision::Conflict {
            current: current.copied(),
        },
    }
}
