use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::records::compare::MAX_SAMPLE_IDS;
use crate::records::error::{DesyncDetail, RecordsError, RecordsStoreError};
use crate::records::guard::{self, GuardDecision};
use crate::records::mirror::{self, ReconcileSummary};
use crate::records::patch;
use crate::records::router::{LegacyWrite, RoutePlan};
use crate::records::types::{
    ExpectedRevision, MirrorRow, PatchOperation, ReadSource, Record, RevisionToken,
    find_duplicate_id,
};

/// The singleton state row as read under its row lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedState {
    pub state_id: String,
    pub records: Vec<Record>,
    pub updated_at: Option<RevisionToken>,
    /// Set when a write advanced the token without rewriting the blob.
    pub legacy_stale: bool,
}

/// Result of a savepoint-scoped legacy write. A failure to create, release or
/// roll back the savepoint itself is an `Err` instead: the transaction is no
/// longer usable then.
#[derive(Debug)]
pub enum LegacyMirrorBack {
    Written,
    RolledBack(RecordsStoreError),
}

/// Storage steps of one write, all executed inside a single backend
/// transaction that the backend commits only if [`run`] returns `Ok`.
#[async_trait]
pub trait StateTransaction: Send {
    /// Creates the state row if needed, then locks and returns it.
    async fn lock_state(&mut self) -> Result<LockedState, RecordsStoreError>;

    /// Mirror rows of `state_id` ordered by position.
    async fn load_mirror_rows(&mut self, state_id: &str)
    -> Result<Vec<MirrorRow>, RecordsStoreError>;

    async fn insert_mirror_row(&mut self, row: &MirrorRow) -> Result<(), RecordsStoreError>;

    async fn update_mirror_row(&mut self, row: &MirrorRow) -> Result<(), RecordsStoreError>;

    async fn delete_mirror_rows(
        &mut self,
        state_id: &str,
        record_ids: &[String],
    ) -> Result<(), RecordsStoreError>;

    /// `(record_id, content_hash)` as currently visible inside the transaction.
    async fn mirror_row_hashes(
        &mut self,
        state_id: &str,
    ) -> Result<Vec<(String, String)>, RecordsStoreError>;

    async fn write_revision(
        &mut self,
        state_id: &str,
        token: &RevisionToken,
    ) -> Result<(), RecordsStoreError>;

    /// Rewrites the blob and clears the stale flag.
    async fn write_legacy_records(
        &mut self,
        state_id: &str,
        records: &[Record],
    ) -> Result<(), RecordsStoreError>;

    /// Like [`Self::write_legacy_records`] but scoped to a savepoint: a failed
    /// blob write only rolls back the savepoint and the transaction stays usable.
    async fn write_legacy_records_best_effort(
        &mut self,
        state_id: &str,
        records: &[Record],
    ) -> Result<LegacyMirrorBack, RecordsStoreError>;

    async fn mark_legacy_stale(&mut self, state_id: &str) -> Result<(), RecordsStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteChange {
    Replace(Vec<Record>),
    Patch(Vec<PatchOperation>),
    /// Rewrite the current set as-is; used to populate the mirror and to
    /// bring a stale legacy blob back in line.
    Resync,
}

impl WriteChange {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Replace(_) => "replace",
            Self::Patch(_) => "patch",
            Self::Resync => "resync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteJob {
    pub expected: ExpectedRevision,
    pub change: WriteChange,
    pub plan: RoutePlan,
    pub max_records: usize,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub updated_at: RevisionToken,
    pub previous: Option<RevisionToken>,
    pub record_count: usize,
    pub applied_operations: usize,
    pub mirror: Option<ReconcileSummary>,
    pub legacy_written: bool,
}

/// Executes one guarded write. Any `Err` leaves the transaction to be rolled
/// back in full by the backend.
pub async fn run<T>(tx: &mut T, job: &WriteJob) -> Result<WriteOutcome, RecordsError>
where
    T: StateTransaction + ?Sized,
{
    let locked = tx.lock_state().await?;
    let state_id = locked.state_id.as_str();

    let decision = guard::check_token(&job.expected, locked.updated_at.as_ref());
    if let GuardDecision::Conflict { current } = decision {
        info!(
            phase = %job.plan.phase,
            change = job.change.kind(),
            current_updated_at = ?current.map(|token| token.to_string()),
            "records write rejected by revision guard"
        );
    }
    decision.into_result()?;

    // A stale blob lags the mirror, which then holds the current set.
    let base_source = match job.plan.write_base {
        ReadSource::Legacy if locked.legacy_stale => {
            warn!(
                phase = %job.plan.phase,
                change = job.change.kind(),
                updated_at = ?locked.updated_at.map(|token| token.to_string()),
                "legacy records lag the mirror; applying write to mirror rows"
            );
            ReadSource::Mirror
        }
        source => source,
    };

    let needs_mirror_rows = job.plan.write_mirror || base_source == ReadSource::Mirror;
    let existing_rows = if needs_mirror_rows {
        tx.load_mirror_rows(state_id).await?
    } else {
        Vec::new()
    };

    let base = match base_source {
        ReadSource::Legacy => locked.records.clone(),
        ReadSource::Mirror => existing_rows.iter().map(|row| row.record.clone()).collect(),
    };
    let (next, applied_operations) = match &job.change {
        WriteChange::Replace(records) => (records.clone(), 0),
        WriteChange::Patch(operations) => (patch::apply(&base, operations), operations.len()),
        WriteChange::Resync => (base, 0),
    };
    if next.len() > job.max_records {
        return Err(RecordsError::PayloadTooLarge(format!(
            "write would leave {} records; limit is {}",
            next.len(),
            job.max_records
        )));
    }
    if let Some(id) = find_duplicate_id(&next) {
        return Err(RecordsError::InvalidRecords(format!(
            "duplicate record id {id:?}"
        )));
    }

    let token = RevisionToken::next_after(locked.updated_at.as_ref(), job.now);

    let mirror = if job.plan.write_mirror {
        let summary = match mirror::reconcile(tx, state_id, &existing_rows, &next, job.now).await
        {
            Ok(summary) => summary,
            Err(store_error) => {
                return Err(desync(
                    job,
                    DesyncDetail {
                        authority: job.plan.authority(),
                        expected_count: next.len(),
                        mirror_count: None,
                        missing_ids: Vec::new(),
                        extra_ids: Vec::new(),
                        hash_mismatch_ids: Vec::new(),
                        cause: Some(store_error.to_string()),
                    },
                ));
            }
        };

        let hashes = tx.mirror_row_hashes(state_id).await?;
        if let Err(divergence) = mirror::check_invariant(&next, &hashes, MAX_SAMPLE_IDS) {
            return Err(desync(
                job,
                DesyncDetail {
                    authority: job.plan.authority(),
                    expected_count: divergence.expected_count,
                    mirror_count: Some(divergence.mirror_count),
                    missing_ids: divergence.diff.missing_sample,
                    extra_ids: divergence.diff.extra_sample,
                    hash_mismatch_ids: divergence.diff.hash_mismatch_sample,
                    cause: None,
                },
            ));
        }
        Some(summary)
    } else {
        None
    };

    tx.write_revision(state_id, &token).await?;

    let legacy_written = match job.plan.legacy_write {
        LegacyWrite::Required => {
            tx.write_legacy_records(state_id, &next).await?;
            true
        }
        LegacyWrite::BestEffort => {
            match tx.write_legacy_records_best_effort(state_id, &next).await? {
                LegacyMirrorBack::Written => true,
                LegacyMirrorBack::RolledBack(error) => {
                    warn!(
                        phase = %job.plan.phase,
                        updated_at = %token,
                        reason = %error,
                        "legacy records mirror-back failed; savepoint rolled back"
                    );
                    tx.mark_legacy_stale(state_id).await?;
                    false
                }
            }
        }
        LegacyWrite::Skip => {
            if !locked.legacy_stale {
                tx.mark_legacy_stale(state_id).await?;
            }
            false
        }
    };

    Ok(WriteOutcome {
        updated_at: token,
        previous: locked.updated_at,
        record_count: next.len(),
        applied_operations,
        mirror,
        legacy_written,
    })
}

fn desync(job: &WriteJob, detail: DesyncDetail) -> RecordsError {
    error!(
        phase = %job.plan.phase,
        change = job.change.kind(),
        expected_count = detail.expected_count,
        mirror_count = ?detail.mirror_count,
        missing_ids = ?detail.missing_ids,
        extra_ids = ?detail.extra_ids,
        hash_mismatch_ids = ?detail.hash_mismatch_ids,
        cause = ?detail.cause,
        "records mirror desync; aborting write"
    );
    RecordsError::Desync(Box::new(detail))
}
