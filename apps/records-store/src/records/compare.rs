use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::records::error::RecordsStoreError;
use crate::records::hashing::{hashes_checksum, record_hashes};
use crate::records::store::RecordsStore;
use crate::records::types::{LegacySnapshot, Record, RevisionToken};

/// Upper bound on ids kept per divergence category.
pub const MAX_SAMPLE_IDS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HashDiff {
    pub missing_in_mirror: usize,
    pub extra_in_mirror: usize,
    pub hash_mismatched: usize,
    pub missing_sample: Vec<String>,
    pub extra_sample: Vec<String>,
    pub hash_mismatch_sample: Vec<String>,
}

impl HashDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_in_mirror == 0 && self.extra_in_mirror == 0 && self.hash_mismatched == 0
    }
}

/// Per-id comparison of `(id, hash)` lists. Only counts and at most
/// `sample_limit` ids per category are kept.
pub fn diff_hashes(
    legacy: &[(String, String)],
    mirror: &[(String, String)],
    sample_limit: usize,
) -> HashDiff {
    let limit = sample_limit.min(MAX_SAMPLE_IDS);
    let mirror_by_id = mirror
        .iter()
        .map(|(id, hash)| (id.as_str(), hash.as_str()))
        .collect::<HashMap<_, _>>();
    let legacy_ids = legacy
        .iter()
        .map(|(id, _)| id.as_str())
        .collect::<HashSet<_>>();

    let mut diff = HashDiff::default();
    for (id, hash) in legacy {
        match mirror_by_id.get(id.as_str()) {
            None => {
                diff.missing_in_mirror += 1;
                push_sample(&mut diff.missing_sample, id, limit);
            }
            Some(mirror_hash) if *mirror_hash != hash.as_str() => {
                diff.hash_mismatched += 1;
                push_sample(&mut diff.hash_mismatch_sample, id, limit);
            }
            Some(_) => {}
        }
    }
    for (id, _) in mirror {
        if !legacy_ids.contains(id.as_str()) {
            diff.extra_in_mirror += 1;
            push_sample(&mut diff.extra_sample, id, limit);
        }
    }
    diff
}

fn push_sample(sample: &mut Vec<String>, id: &str, limit: usize) {
    if sample.len() < limit {
        sample.push(id.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonReport {
    pub legacy_count: usize,
    pub mirror_count: usize,
    pub legacy_checksum: String,
    pub mirror_checksum: String,
    /// Same ids and hashes, different order.
    pub order_differs: bool,
    #[serde(flatten)]
    pub diff: HashDiff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ComparisonOutcome {
    Match {
        record_count: usize,
        checksum: String,
    },
    Mismatch(ComparisonReport),
    /// A write landed between the two reads; the snapshots are not comparable.
    Skipped {
        legacy_updated_at: Option<RevisionToken>,
        mirror_updated_at: Option<RevisionToken>,
    },
}

impl ComparisonOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }
}

pub fn compare_snapshots(
    legacy: &[Record],
    mirror: &[Record],
    sample_limit: usize,
) -> ComparisonOutcome {
    let legacy_hashes = record_hashes(legacy);
    let mirror_hashes = record_hashes(mirror);
    let legacy_checksum = hashes_checksum(&legacy_hashes);
    let mirror_checksum = hashes_checksum(&mirror_hashes);

    if legacy_checksum == mirror_checksum {
        return ComparisonOutcome::Match {
            record_count: legacy.len(),
            checksum: legacy_checksum,
        };
    }

    let diff = diff_hashes(&legacy_hashes, &mirror_hashes, sample_limit);
    ComparisonOutcome::Mismatch(ComparisonReport {
        legacy_count: legacy.len(),
        mirror_count: mirror.len(),
        legacy_checksum,
        mirror_checksum,
        order_differs: diff.is_empty(),
        diff,
    })
}

#[derive(Debug, Default)]
pub struct ComparatorStats {
    matches: AtomicU64,
    mismatches: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ComparatorStatsSnapshot {
    pub matches: u64,
    pub mismatches: u64,
    pub skipped: u64,
    pub failures: u64,
}

impl ComparatorStats {
    pub fn snapshot(&self) -> ComparatorStatsSnapshot {
        ComparatorStatsSnapshot {
            matches: self.matches.load(Ordering::Relaxed),
            mismatches: self.mismatches.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &ComparisonOutcome) {
        let counter = match outcome {
            ComparisonOutcome::Match { .. } => &self.matches,
            ComparisonOutcome::Mismatch(_) => &self.mismatches,
            ComparisonOutcome::Skipped { .. } => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read-only verifier that checks the mirror against a legacy snapshot that
/// was already served. It never writes and never fails the read it follows.
#[derive(Clone)]
pub struct DualReadComparator {
    store: Arc<dyn RecordsStore>,
    sample_limit: usize,
    stats: Arc<ComparatorStats>,
}

impl DualReadComparator {
    pub fn new(store: Arc<dyn RecordsStore>, sample_limit: usize) -> Self {
        Self {
            store,
            sample_limit: sample_limit.clamp(1, MAX_SAMPLE_IDS),
            stats: Arc::new(ComparatorStats::default()),
        }
    }

    pub fn stats(&self) -> ComparatorStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn compare(
        &self,
        legacy: &LegacySnapshot,
    ) -> Result<ComparisonOutcome, RecordsStoreError> {
        let mirror = self.store.read_mirror().await?;
        if mirror.updated_at != legacy.updated_at {
            return Ok(ComparisonOutcome::Skipped {
                legacy_updated_at: legacy.updated_at,
                mirror_updated_at: mirror.updated_at,
            });
        }
        Ok(compare_snapshots(
            &legacy.records,
            &mirror.records(),
            self.sample_limit,
        ))
    }

    /// Runs the comparison off the request path.
    pub fn schedule(&self, legacy: LegacySnapshot) -> JoinHandle<Option<ComparisonOutcome>> {
        let comparator = self.clone();
        tokio::spawn(async move { comparator.compare_and_log(&legacy).await })
    }

    pub async fn compare_and_log(&self, legacy: &LegacySnapshot) -> Option<ComparisonOutcome> {
        let comparison_id = Uuid::now_v7();
        match self.compare(legacy).await {
            Ok(outcome) => {
                self.stats.record(&outcome);
                log_outcome(comparison_id, &outcome);
                Some(outcome)
            }
            Err(error) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    comparison_id = %comparison_id,
                    reason = %error,
                    "records dual-read comparison failed"
                );
                None
            }
        }
    }
}

fn log_outcome(comparison_id: Uuid, outcome: &ComparisonOutcome) {
    match outcome {
        ComparisonOutcome::Match {
            record_count,
            checksum,
        } => debug!(
            comparison_id = %comparison_id,
            record_count,
            checksum = %checksum,
            "records dual-read match"
        ),
        ComparisonOutcome::Mismatch(report) => warn!(
            comparison_id = %comparison_id,
            legacy_count = report.legacy_count,
            mirror_count = report.mirror_count,
            legacy_checksum = %report.legacy_checksum,
            mirror_checksum = %report.mirror_checksum,
            missing_in_mirror = report.diff.missing_in_mirror,
            extra_in_mirror = report.diff.extra_in_mirror,
            hash_mismatched = report.diff.hash_mismatched,
            order_differs = report.order_differs,
            missing_sample = ?report.diff.missing_sample,
            extra_sample = ?report.diff.extra_sample,
            hash_mismatch_sample = ?report.diff.hash_mismatch_sample,
            "records dual-read mismatch"
        ),
        ComparisonOutcome::Skipped {
            legacy_updated_at,
            mirror_updated_at,
        } => info!(
            comparison_id = %comparison_id,
            legacy_updated_at = ?legacy_updated_at.map(|token| token.to_string()),
            mirror_updated_at = ?mirror_updated_at.map(|token| token.to_string()),
            "records dual-read comparison skipped; revision moved between reads"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::types::RecordField;

    fn record(id: &str, client: &str) -> Record {
        Record::new(id)
            .and_then(|record| record.with(RecordField::ClientName, client))
            .expect("record")
    }

    fn numbered(count: usize) -> Vec<Record> {
        (0..count)
            .map(|index| record(&format!("r{index:03}"), "Acme"))
            .collect()
    }

    #[test]
    fn identical_snapshots_match() {
        let legacy = vec![record("a", "Acme"), record("b", "Bolt")];
        let outcome = compare_snapshots(&legacy, &legacy.clone(), MAX_SAMPLE_IDS);
        assert!(outcome.is_match());
        assert!(matches!(
            outcome,
            ComparisonOutcome::Match {
                record_count: 2,
                ..
            }
        ));
    }

    #[test]
    fn single_hash_difference_is_isolated() {
        let legacy = vec![record("a", "Acme"), record("b", "Bolt")];
        let mirror = vec![record("a", "Acme"), record("b", "Bolt Renamed")];
        let ComparisonOutcome::Mismatch(report) =
            compare_snapshots(&legacy, &mirror, MAX_SAMPLE_IDS)
        else {
            panic!("expected mismatch");
        };
        assert_eq!(report.legacy_count, 2);
        assert_eq!(report.mirror_count, 2);
        assert_ne!(report.legacy_checksum, report.mirror_checksum);
        assert_eq!(report.diff.hash_mismatched, 1);
        assert_eq!(report.diff.hash_mismatch_sample, vec!["b".to_string()]);
        assert_eq!(report.diff.missing_in_mirror, 0);
        assert_eq!(report.diff.extra_in_mirror, 0);
        assert!(!report.order_differs);
    }

    #[test]
    fn reordering_alone_is_a_mismatch_without_id_differences() {
        let legacy = vec![record("a", "Acme"), record("b", "Bolt")];
        let mirror = vec![record("b", "Bolt"), record("a", "Acme")];
        let ComparisonOutcome::Mismatch(report) =
            compare_snapshots(&legacy, &mirror, MAX_SAMPLE_IDS)
        else {
            panic!("expected mismatch");
        };
        assert!(report.order_differs);
        assert!(report.diff.is_empty());
    }

    #[test]
    fn samples_are_bounded_but_counts_are_exact() {
        let legacy = numbered(50);
        let outcome = compare_snapshots(&legacy, &[], 500);
        let ComparisonOutcome::Mismatch(report) = outcome else {
            panic!("expected mismatch");
        };
        assert_eq!(report.diff.missing_in_mirror, 50);
        assert_eq!(report.diff.missing_sample.len(), MAX_SAMPLE_IDS);

        let diff = diff_hashes(&[], &record_hashes(&legacy), 5);
        assert_eq!(diff.extra_in_mirror, 50);
        assert_eq!(diff.extra_sample.len(), 5);
    }

    #[test]
    fn mismatch_report_serializes_flat() {
        let legacy = vec![record("a", "Acme")];
        let outcome = compare_snapshots(&legacy, &[], MAX_SAMPLE_IDS);
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["outcome"], "mismatch");
        assert_eq!(value["missingInMirror"], 1);
        assert_eq!(value["missingSample"][0], "a");
    }
}
