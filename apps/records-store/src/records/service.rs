use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::records::compare::{ComparatorStatsSnapshot, ComparisonOutcome, DualReadComparator};
use crate::records::coordinator::{WriteChange, WriteJob, WriteOutcome};
use crate::records::error::RecordsError;
use crate::records::router::{MigrationPhase, MigrationRouter, RoutePlan};
use crate::records::store::RecordsStore;
use crate::records::types::{
    ExpectedRevision, PatchRequest, PatchResponse, PutRequest, PutResponse, ReadSource,
    RecordsLimits, RecordsSnapshot, find_duplicate_id,
};

/// A read result plus the background comparison it scheduled, if any.
pub struct RecordsRead {
    pub snapshot: RecordsSnapshot,
    pub comparison: Option<JoinHandle<Option<ComparisonOutcome>>>,
}

#[derive(Clone)]
pub struct RecordsService {
    store: Arc<dyn RecordsStore>,
    router: MigrationRouter,
    comparator: DualReadComparator,
    limits: RecordsLimits,
}

impl RecordsService {
    pub fn new(
        store: Arc<dyn RecordsStore>,
        router: MigrationRouter,
        limits: RecordsLimits,
        compare_sample_limit: usize,
    ) -> Self {
        let comparator = DualReadComparator::new(store.clone(), compare_sample_limit);
        Self {
            store,
            router,
            comparator,
            limits,
        }
    }

    pub fn from_config(store: Arc<dyn RecordsStore>, config: &Config) -> Self {
        Self::new(
            store,
            MigrationRouter::new(config.migration_phase, config.dual_read_compare),
            config.limits,
            config.compare_sample_limit,
        )
    }

    pub fn phase(&self) -> MigrationPhase {
        self.router.phase()
    }

    pub fn plan(&self) -> RoutePlan {
        self.router.plan()
    }

    pub fn comparator_stats(&self) -> ComparatorStatsSnapshot {
        self.comparator.stats()
    }

    pub async fn get(&self) -> Result<RecordsSnapshot, RecordsError> {
        Ok(self.read().await?.snapshot)
    }

    /// Serves the read from the representation the current phase selects and,
    /// for legacy reads while the mirror is written, schedules a comparison
    /// after the snapshot is taken. A stale legacy blob is never served; the
    /// mirror answers until a legacy write catches it up.
    pub async fn read(&self) -> Result<RecordsRead, RecordsError> {
        let plan = self.router.plan();
        match plan.read_source {
            ReadSource::Legacy => {
                let legacy = self.store.read_legacy().await?;
                if legacy.stale {
                    warn!(
                        phase = %plan.phase,
                        updated_at = ?legacy.updated_at.map(|token| token.to_string()),
                        "legacy records lag the mirror; serving read from mirror rows"
                    );
                    return self.read_mirror().await;
                }
                let snapshot = RecordsSnapshot {
                    records: legacy.records.clone(),
                    updated_at: legacy.updated_at,
                    source: ReadSource::Legacy,
                };
                let comparison = plan
                    .compare_reads
                    .then(|| self.comparator.schedule(legacy));
                Ok(RecordsRead {
                    snapshot,
                    comparison,
                })
            }
            ReadSource::Mirror => self.read_mirror().await,
        }
    }

    async fn read_mirror(&self) -> Result<RecordsRead, RecordsError> {
        let mirror = self.store.read_mirror().await?;
        Ok(RecordsRead {
            snapshot: RecordsSnapshot {
                records: mirror.records(),
                updated_at: mirror.updated_at,
                source: ReadSource::Mirror,
            },
            comparison: None,
        })
    }

    pub async fn put(&self, request: PutRequest) -> Result<PutResponse, RecordsError> {
        require_expected(&request.expected)?;
        if request.records.len() > self.limits.max_records {
            return Err(RecordsError::PayloadTooLarge(format!(
                "{} records exceeds limit of {}",
                request.records.len(),
                self.limits.max_records
            )));
        }
        if let Some(id) = find_duplicate_id(&request.records) {
            return Err(RecordsError::InvalidRecords(format!(
                "duplicate record id {id:?}"
            )));
        }

        let outcome = self
            .write(request.expected, WriteChange::Replace(request.records))
            .await?;
        Ok(PutResponse {
            updated_at: outcome.updated_at,
        })
    }

    pub async fn patch(&self, request: PatchRequest) -> Result<PatchResponse, RecordsError> {
        require_expected(&request.expected)?;
        if request.operations.len() > self.limits.max_patch_operations {
            return Err(RecordsError::PayloadTooLarge(format!(
                "{} operations exceeds limit of {}",
                request.operations.len(),
                self.limits.max_patch_operations
            )));
        }

        let outcome = self
            .write(request.expected, WriteChange::Patch(request.operations))
            .await?;
        Ok(PatchResponse {
            updated_at: outcome.updated_at,
            applied_operations: outcome.applied_operations,
        })
    }

    /// Compares the legacy blob with the mirror right now and returns the
    /// report instead of only logging it.
    pub async fn verify(&self) -> Result<ComparisonOutcome, RecordsError> {
        let legacy = self.store.read_legacy().await?;
        let outcome = self.comparator.compare(&legacy).await?;
        info!(
            phase = %self.router.phase(),
            record_count = legacy.records.len(),
            matched = outcome.is_match(),
            "records verify completed"
        );
        Ok(outcome)
    }

    /// Rewrites the current set through the coordinator so the mirror holds
    /// every record, or so a stale legacy blob catches up with the mirror.
    /// Only meaningful while legacy is authoritative and the mirror is being
    /// written.
    pub async fn backfill_mirror(&self) -> Result<WriteOutcome, RecordsError> {
        let plan = self.router.plan();
        if !plan.write_mirror || plan.write_base != ReadSource::Legacy {
            return Err(RecordsError::PhaseMismatch {
                phase: plan.phase,
                message: "backfill requires dual_write or cutover_read".to_string(),
            });
        }
        let legacy = self.store.read_legacy().await?;
        let expected = ExpectedRevision::from_current(legacy.updated_at);
        self.write(expected, WriteChange::Resync).await
    }

    async fn write(
        &self,
        expected: ExpectedRevision,
        change: WriteChange,
    ) -> Result<WriteOutcome, RecordsError> {
        let plan = self.router.plan();
        let kind = change.kind();
        let job = WriteJob {
            expected,
            change,
            plan,
            max_records: self.limits.max_records,
            now: Utc::now(),
        };
        let outcome = self.store.write(job).await?;
        let mirror = outcome.mirror.unwrap_or_default();
        info!(
            phase = %plan.phase,
            change = kind,
            updated_at = %outcome.updated_at,
            record_count = outcome.record_count,
            applied_operations = outcome.applied_operations,
            mirror_written = outcome.mirror.is_some(),
            inserted = mirror.inserted,
            updated = mirror.updated,
            deleted = mirror.deleted,
            legacy_written = outcome.legacy_written,
            "records write committed"
        );
        Ok(outcome)
    }
}

fn require_expected(expected: &ExpectedRevision) -> Result<(), RecordsError> {
    if expected.is_missing() {
        return Err(RecordsError::PreconditionRequired);
    }
    Ok(())
}
