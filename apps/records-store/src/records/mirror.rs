use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::records::compare::{HashDiff, diff_hashes};
use crate::records::coordinator::StateTransaction;
use crate::records::error::RecordsStoreError;
use crate::records::hashing::{record_hash, record_hashes};
use crate::records::types::{MirrorRow, Record, RecordField};

/// Query-support columns derived from a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedIndex {
    pub primary_name: Option<String>,
    pub company_name: Option<String>,
    pub owner_name: Option<String>,
}

pub fn derive_index(record: &Record) -> DerivedIndex {
    let first_present = |fields: &[RecordField]| {
        fields
            .iter()
            .filter_map(|field| record.get(*field))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    };
    DerivedIndex {
        primary_name: first_present(&[RecordField::ClientName, RecordField::ContactName]),
        company_name: first_present(&[RecordField::CompanyName]),
        owner_name: first_present(&[RecordField::ClosedBy, RecordField::AccountManager]),
    }
}

impl MirrorRow {
    pub fn from_record(
        state_id: &str,
        position: i64,
        record: &Record,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self::with_hash(
            state_id,
            position,
            record,
            record_hash(record),
            created_at,
            updated_at,
        )
    }

    fn with_hash(
        state_id: &str,
        position: i64,
        record: &Record,
        content_hash: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let index = derive_index(record);
        Self {
            state_id: state_id.to_string(),
            record_id: record.id().to_string(),
            position,
            record: record.clone(),
            content_hash,
            primary_name: index.primary_name,
            company_name: index.company_name,
            owner_name: index.owner_name,
            created_at,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub inserts: Vec<MirrorRow>,
    pub updates: Vec<MirrorRow>,
    pub deletes: Vec<String>,
    pub unchanged: usize,
}

impl ReconcilePlan {
    pub fn summary(&self) -> ReconcileSummary {
        ReconcileSummary {
            inserted: self.inserts.len(),
            updated: self.updates.len(),
            unchanged: self.unchanged,
            deleted: self.deletes.len(),
        }
    }
}

/// Diffs the current mirror rows against `next`. A row is rewritten only when
/// its content hash or its position changed.
pub fn plan_reconcile(
    state_id: &str,
    existing: &[MirrorRow],
    next: &[Record],
    now: DateTime<Utc>,
) -> ReconcilePlan {
    let existing_by_id = existing
        .iter()
        .map(|row| (row.record_id.as_str(), row))
        .collect::<HashMap<_, _>>();
    let next_ids = next.iter().map(Record::id).collect::<HashSet<_>>();

    let mut plan = ReconcilePlan::default();
    for (position, record) in next.iter().enumerate() {
        let position = i64::try_from(position).unwrap_or(i64::MAX);
        let hash = record_hash(record);
        match existing_by_id.get(record.id()) {
            Some(row) if row.content_hash == hash && row.position == position => {
                plan.unchanged += 1;
            }
            Some(row) => plan.updates.push(MirrorRow::with_hash(
                state_id,
                position,
                record,
                hash,
                row.created_at,
                now,
            )),
            None => plan
                .inserts
                .push(MirrorRow::with_hash(state_id, position, record, hash, now, now)),
        }
    }
    plan.deletes = existing
        .iter()
        .filter(|row| !next_ids.contains(row.record_id.as_str()))
        .map(|row| row.record_id.clone())
        .collect();
    plan
}

/// Brings the mirror in line with `next` inside the caller's transaction.
pub async fn reconcile<T>(
    tx: &mut T,
    state_id: &str,
    existing: &[MirrorRow],
    next: &[Record],
    now: DateTime<Utc>,
) -> Result<ReconcileSummary, RecordsStoreError>
where
    T: StateTransaction + ?Sized,
{
    let plan = plan_reconcile(state_id, existing, next, now);
    if !plan.deletes.is_empty() {
        tx.delete_mirror_rows(state_id, &plan.deletes).await?;
    }
    for row in &plan.updates {
        tx.update_mirror_row(row).await?;
    }
    for row in &plan.inserts {
        tx.insert_mirror_row(row).await?;
    }
    Ok(plan.summary())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorDivergence {
    pub expected_count: usize,
    pub mirror_count: usize,
    pub diff: HashDiff,
}

/// Count and per-row hash of the mirror must equal the intended set exactly.
pub fn check_invariant(
    expected: &[Record],
    mirror_hashes: &[(String, String)],
    sample_limit: usize,
) -> Result<(), MirrorDivergence> {
    let expected_hashes = record_hashes(expected);
    let diff = diff_hashes(&expected_hashes, mirror_hashes, sample_limit);
    if expected.len() == mirror_hashes.len() && diff.is_empty() {
        return Ok(());
    }
    Err(MirrorDivergence {
        expected_count: expected.len(),
        mirror_count: mirror_hashes.len(),
        diff,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(id: &str, client: &str) -> Record {
        Record::new(id)
            .and_then(|record| record.with(RecordField::ClientName, client))
            .expect("record")
    }

    fn rows(records: &[Record], at: DateTime<Utc>) -> Vec<MirrorRow> {
        records
            .iter()
            .enumerate()
            .map(|(position, record)| {
                MirrorRow::from_record("records", position as i64, record, at, at)
            })
            .collect()
    }

    #[test]
    fn derived_index_prefers_client_then_contact_and_closer_then_manager() {
        let record = Record::new("a")
            .and_then(|record| record.with(RecordField::ContactName, "Dana"))
            .and_then(|record| record.with(RecordField::CompanyName, " Acme LLC "))
            .and_then(|record| record.with(RecordField::AccountManager, "Sam"))
            .expect("record");
        let index = derive_index(&record);
        assert_eq!(index.primary_name.as_deref(), Some("Dana"));
        assert_eq!(index.company_name.as_deref(), Some("Acme LLC"));
        assert_eq!(index.owner_name.as_deref(), Some("Sam"));

        let record = record
            .with(RecordField::ClientName, "Acme")
            .and_then(|record| record.with(RecordField::ClosedBy, "Riley"))
            .expect("record");
        let index = derive_index(&record);
        assert_eq!(index.primary_name.as_deref(), Some("Acme"));
        assert_eq!(index.owner_name.as_deref(), Some("Riley"));
    }

    #[test]
    fn plan_classifies_rows_by_hash_and_presence() {
        let created = Utc::now() - Duration::days(1);
        let now = Utc::now();
        let existing = rows(
            &[record("a", "Acme"), record("b", "Bolt"), record("c", "Cobalt")],
            created,
        );
        let next = vec![record("a", "Acme"), record("b", "Bolt Renamed"), record("c", "Cobalt"), record("d", "Dune")];
        let plan = plan_reconcile("records", &existing, &next, now);
        assert_eq!(
            plan.summary(),
            ReconcileSummary {
                inserted: 1,
                updated: 1,
                unchanged: 2,
                deleted: 0,
            }
        );
        assert_eq!(plan.updates[0].record_id, "b");
        assert_eq!(plan.updates[0].created_at, created);
        assert_eq!(plan.updates[0].updated_at, now);
        assert_eq!(plan.inserts[0].position, 3);
    }

    #[test]
    fn plan_deletes_missing_ids_and_rewrites_shifted_positions() {
        let at = Utc::now();
        let existing = rows(&[record("a", "Acme"), record("b", "Bolt")], at);
        let plan = plan_reconcile("records", &existing, &[record("b", "Bolt")], at);
        assert_eq!(plan.deletes, vec!["a".to_string()]);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].position, 0);
        assert_eq!(plan.unchanged, 0);
    }

    #[test]
    fn invariant_check_reports_each_divergence_kind() {
        let expected = vec![record("a", "Acme"), record("b", "Bolt")];
        let mut mirror = record_hashes(&expected);
        assert!(check_invariant(&expected, &mirror, 20).is_ok());

        mirror.pop();
        let divergence = check_invariant(&expected, &mirror, 20).expect_err("missing row");
        assert_eq!(divergence.expected_count, 2);
        assert_eq!(divergence.mirror_count, 1);
        assert_eq!(divergence.diff.missing_sample, vec!["b".to_string()]);

        let tampered = vec![
            ("a".to_string(), "sha256:bogus".to_string()),
            ("b".to_string(), record_hash(&expected[1])),
        ];
        let divergence = check_invariant(&expected, &tampered, 20).expect_err("hash mismatch");
        assert_eq!(divergence.diff.hash_mismatch_sample, vec!["a".to_string()]);
    }
}
