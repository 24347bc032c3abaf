use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_postgres::{IsolationLevel, Row, Transaction};
use tracing::warn;

use crate::db::RecordsDb;
use crate::records::coordinator::{
    self, LegacyMirrorBack, LockedState, StateTransaction, WriteJob, WriteOutcome,
};
use crate::records::error::{RecordsError, RecordsStoreError};
use crate::records::hashing::record_hash;
use crate::records::types::{LegacySnapshot, MirrorRow, MirrorSnapshot, Record, RevisionToken};

#[async_trait]
pub trait RecordsStore: Send + Sync {
    /// Snapshot read of the legacy singleton; never waits on the write lock.
    async fn read_legacy(&self) -> Result<LegacySnapshot, RecordsStoreError>;

    /// Mirror rows plus the state token from the same snapshot.
    async fn read_mirror(&self) -> Result<MirrorSnapshot, RecordsStoreError>;

    /// Runs `job` through the dual-write coordinator in one transaction.
    async fn write(&self, job: WriteJob) -> Result<WriteOutcome, RecordsError>;
}

pub fn memory(state_id: impl Into<String>) -> Arc<dyn RecordsStore> {
    Arc::new(MemoryRecordsStore::new(state_id))
}

pub fn postgres(db: Arc<RecordsDb>, state_id: impl Into<String>) -> Arc<dyn RecordsStore> {
    Arc::new(PostgresRecordsStore {
        db,
        state_id: state_id.into(),
    })
}

/// One-shot failure switches for the memory backend. Each switch fires on the
/// next matching step and then resets.
#[derive(Debug, Default)]
pub struct MemoryFaults {
    fail_mirror_insert: AtomicBool,
    drop_mirror_insert: AtomicBool,
    fail_legacy_write: AtomicBool,
    fail_savepoint: AtomicBool,
}

impl MemoryFaults {
    /// The next mirror insert returns an error.
    pub fn fail_next_mirror_insert(&self) {
        self.fail_mirror_insert.store(true, Ordering::SeqCst);
    }

    /// The next mirror insert reports success but writes nothing.
    pub fn drop_next_mirror_insert(&self) {
        self.drop_mirror_insert.store(true, Ordering::SeqCst);
    }

    /// The next legacy blob write (required or best-effort) returns an error.
    pub fn fail_next_legacy_write(&self) {
        self.fail_legacy_write.store(true, Ordering::SeqCst);
    }

    /// The next best-effort legacy write cannot establish its savepoint, which
    /// leaves the whole transaction unusable.
    pub fn fail_next_savepoint(&self) {
        self.fail_savepoint.store(true, Ordering::SeqCst);
    }

    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    records: Vec<Record>,
    updated_at: Option<RevisionToken>,
    legacy_stale: bool,
    mirror: BTreeMap<String, MirrorRow>,
}

pub struct MemoryRecordsStore {
    state_id: String,
    // Serialises writers; stands in for the row lock.
    writer: Mutex<()>,
    committed: RwLock<MemoryState>,
    faults: MemoryFaults,
}

impl MemoryRecordsStore {
    pub fn new(state_id: impl Into<String>) -> Self {
        Self {
            state_id: state_id.into(),
            writer: Mutex::new(()),
            committed: RwLock::new(MemoryState::default()),
            faults: MemoryFaults::default(),
        }
    }

    pub fn faults(&self) -> &MemoryFaults {
        &self.faults
    }

    /// Changes a mirror row behind the coordinator's back.
    pub async fn tamper_mirror_row(&self, record: Record) {
        let mut committed = self.committed.write().await;
        if let Some(row) = committed.mirror.get_mut(record.id()) {
            row.record = record;
        }
    }
}

#[async_trait]
impl RecordsStore for MemoryRecordsStore {
    async fn read_legacy(&self) -> Result<LegacySnapshot, RecordsStoreError> {
        let committed = self.committed.read().await;
        Ok(LegacySnapshot {
            state_id: self.state_id.clone(),
            records: committed.records.clone(),
            updated_at: committed.updated_at,
            stale: committed.legacy_stale,
        })
    }

    async fn read_mirror(&self) -> Result<MirrorSnapshot, RecordsStoreError> {
        let committed = self.committed.read().await;
        Ok(MirrorSnapshot {
            state_id: self.state_id.clone(),
            rows: ordered_rows(&committed.mirror),
            updated_at: committed.updated_at,
        })
    }

    async fn write(&self, job: WriteJob) -> Result<WriteOutcome, RecordsError> {
        let _writer = self.writer.lock().await;
        let staged = self.committed.read().await.clone();
        let mut tx = MemoryStateTx {
            state_id: &self.state_id,
            staged,
            faults: &self.faults,
        };
        let outcome = coordinator::run(&mut tx, &job).await?;
        *self.committed.write().await = tx.staged;
        Ok(outcome)
    }
}

fn ordered_rows(mirror: &BTreeMap<String, MirrorRow>) -> Vec<MirrorRow> {
    let mut rows = mirror.values().cloned().collect::<Vec<_>>();
    rows.sort_by(|left, right| {
        left.position
            .cmp(&right.position)
            .then_with(|| left.record_id.cmp(&right.record_id))
    });
    rows
}

struct MemoryStateTx<'a> {
    state_id: &'a str,
    staged: MemoryState,
    faults: &'a MemoryFaults,
}

#[async_trait]
impl StateTransaction for MemoryStateTx<'_> {
    async fn lock_state(&mut self) -> Result<LockedState, RecordsStoreError> {
        Ok(LockedState {
            state_id: self.state_id.to_string(),
            records: self.staged.records.clone(),
            updated_at: self.staged.updated_at,
            legacy_stale: self.staged.legacy_stale,
        })
    }

    async fn load_mirror_rows(
        &mut self,
        _state_id: &str,
    ) -> Result<Vec<MirrorRow>, RecordsStoreError> {
        Ok(ordered_rows(&self.staged.mirror))
    }

    async fn insert_mirror_row(&mut self, row: &MirrorRow) -> Result<(), RecordsStoreError> {
        if MemoryFaults::take(&self.faults.fail_mirror_insert) {
            return Err(RecordsStoreError::Db(format!(
                "mirror insert failed for record {}",
                row.record_id
            )));
        }
        if MemoryFaults::take(&self.faults.drop_mirror_insert) {
            return Ok(());
        }
        if self.staged.mirror.contains_key(&row.record_id) {
            return Err(RecordsStoreError::Db(format!(
                "duplicate mirror row {}",
                row.record_id
            )));
        }
        self.staged
            .mirror
            .insert(row.record_id.clone(), row.clone());
        Ok(())
    }

    async fn update_mirror_row(&mut self, row: &MirrorRow) -> Result<(), RecordsStoreError> {
        let Some(existing) = self.staged.mirror.get_mut(&row.record_id) else {
            return Err(RecordsStoreError::Db(format!(
                "mirror row {} vanished before update",
                row.record_id
            )));
        };
        *existing = row.clone();
        Ok(())
    }

    async fn delete_mirror_rows(
        &mut self,
        _state_id: &str,
        record_ids: &[String],
    ) -> Result<(), RecordsStoreError> {
        for record_id in record_ids {
            self.staged.mirror.remove(record_id);
        }
        Ok(())
    }

    async fn mirror_row_hashes(
        &mut self,
        _state_id: &str,
    ) -> Result<Vec<(String, String)>, RecordsStoreError> {
        Ok(ordered_rows(&self.staged.mirror)
            .into_iter()
            .map(|row| {
                let hash = record_hash(&row.record);
                (row.record_id, hash)
            })
            .collect())
    }

    async fn write_revision(
        &mut self,
        _state_id: &str,
        token: &RevisionToken,
    ) -> Result<(), RecordsStoreError> {
        self.staged.updated_at = Some(*token);
        Ok(())
    }

    async fn write_legacy_records(
        &mut self,
        _state_id: &str,
        records: &[Record],
    ) -> Result<(), RecordsStoreError> {
        if MemoryFaults::take(&self.faults.fail_legacy_write) {
            return Err(RecordsStoreError::Db("legacy records write failed".to_string()));
        }
        self.staged.records = records.to_vec();
        self.staged.legacy_stale = false;
        Ok(())
    }

    async fn write_legacy_records_best_effort(
        &mut self,
        state_id: &str,
        records: &[Record],
    ) -> Result<LegacyMirrorBack, RecordsStoreError> {
        if MemoryFaults::take(&self.faults.fail_savepoint) {
            return Err(RecordsStoreError::Db(
                "savepoint records_legacy_mirror_back could not be created".to_string(),
            ));
        }
        // A failed blob write changes nothing staged, so there is nothing to undo.
        match self.write_legacy_records(state_id, records).await {
            Ok(()) => Ok(LegacyMirrorBack::Written),
            Err(error) => Ok(LegacyMirrorBack::RolledBack(error)),
        }
    }

    async fn mark_legacy_stale(&mut self, _state_id: &str) -> Result<(), RecordsStoreError> {
        self.staged.legacy_stale = true;
        Ok(())
    }
}

struct PostgresRecordsStore {
    db: Arc<RecordsDb>,
    state_id: String,
}

#[async_trait]
impl RecordsStore for PostgresRecordsStore {
    async fn read_legacy(&self) -> Result<LegacySnapshot, RecordsStoreError> {
        let reader = self.db.reader();
        let reader = reader.lock().await;
        let row = reader
            .query_opt(SELECT_STATE_SQL, &[&self.state_id])
            .await
            .map_err(db_error)?;
        let Some(row) = row else {
            return Ok(LegacySnapshot::empty(self.state_id.clone()));
        };
        let state = map_state_row(&row)?;
        Ok(LegacySnapshot {
            state_id: state.state_id,
            records: state.records,
            updated_at: state.updated_at,
            stale: state.legacy_stale,
        })
    }

    async fn read_mirror(&self) -> Result<MirrorSnapshot, RecordsStoreError> {
        let reader = self.db.reader();
        let mut reader = reader.lock().await;
        let tx = reader
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await
            .map_err(db_error)?;
        let state = tx
            .query_opt(
                r#"
                SELECT updated_at
                  FROM records.state_revisions
                 WHERE state_id = $1
                "#,
                &[&self.state_id],
            )
            .await
            .map_err(db_error)?;
        let updated_at: Option<DateTime<Utc>> =
            state.and_then(|row| row.get::<_, Option<DateTime<Utc>>>("updated_at"));
        let rows = tx
            .query(SELECT_MIRROR_ROWS_SQL, &[&self.state_id])
            .await
            .map_err(db_error)?
            .iter()
            .map(map_mirror_row)
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit().await.map_err(db_error)?;

        Ok(MirrorSnapshot {
            state_id: self.state_id.clone(),
            rows,
            updated_at: updated_at.map(RevisionToken::from_datetime),
        })
    }

    async fn write(&self, job: WriteJob) -> Result<WriteOutcome, RecordsError> {
        let writer = self.db.writer();
        let mut writer = writer.lock().await;
        let tx = writer.transaction().await.map_err(db_error)?;
        let mut state_tx = PostgresStateTx {
            tx,
            state_id: &self.state_id,
        };

        match coordinator::run(&mut state_tx, &job).await {
            Ok(outcome) => {
                state_tx.tx.commit().await.map_err(db_error)?;
                Ok(outcome)
            }
            Err(error) => {
                if let Err(rollback_error) = state_tx.tx.rollback().await {
                    warn!(
                        reason = %rollback_error,
                        "records write rollback failed; connection will discard the transaction"
                    );
                }
                Err(error)
            }
        }
    }
}

const ENSURE_STATE_SQL: &str = r#"
    INSERT INTO records.state_revisions (state_id)
    VALUES ($1)
    ON CONFLICT (state_id) DO NOTHING
"#;

const SELECT_STATE_SQL: &str = r#"
    SELECT state_id, records_json, updated_at, legacy_stale
      FROM records.state_revisions
     WHERE state_id = $1
"#;

const SELECT_MIRROR_ROWS_SQL: &str = r#"
    SELECT state_id, record_id, position, payload, content_hash,
           primary_name, company_name, owner_name, created_at, updated_at
      FROM records.mirror_rows
     WHERE state_id = $1
     ORDER BY position, record_id
"#;

struct PostgresStateTx<'a> {
    tx: Transaction<'a>,
    state_id: &'a str,
}

#[async_trait]
impl StateTransaction for PostgresStateTx<'_> {
    async fn lock_state(&mut self) -> Result<LockedState, RecordsStoreError> {
        self.tx
            .execute(ENSURE_STATE_SQL, &[&self.state_id])
            .await
            .map_err(db_error)?;
        let row = self
            .tx
            .query_one(
                r#"
                SELECT state_id, records_json, updated_at, legacy_stale
                  FROM records.state_revisions
                 WHERE state_id = $1
                 FOR UPDATE
                "#,
                &[&self.state_id],
            )
            .await
            .map_err(db_error)?;
        map_state_row(&row)
    }

    async fn load_mirror_rows(
        &mut self,
        state_id: &str,
    ) -> Result<Vec<MirrorRow>, RecordsStoreError> {
        self.tx
            .query(SELECT_MIRROR_ROWS_SQL, &[&state_id])
            .await
            .map_err(db_error)?
            .iter()
            .map(map_mirror_row)
            .collect()
    }

    async fn insert_mirror_row(&mut self, row: &MirrorRow) -> Result<(), RecordsStoreError> {
        self.tx
            .execute(
                r#"
                INSERT INTO records.mirror_rows (
                    state_id, record_id, position, payload, content_hash,
                    primary_name, company_name, owner_name, created_at, updated_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10
                )
                "#,
                &[
                    &row.state_id,
                    &row.record_id,
                    &row.position,
                    &row.record.to_value(),
                    &row.content_hash,
                    &row.primary_name,
                    &row.company_name,
                    &row.owner_name,
                    &row.created_at,
                    &row.updated_at,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn update_mirror_row(&mut self, row: &MirrorRow) -> Result<(), RecordsStoreError> {
        let updated = self
            .tx
            .execute(
                r#"
                UPDATE records.mirror_rows
                   SET position = $3,
                       payload = $4,
                       content_hash = $5,
                       primary_name = $6,
                       company_name = $7,
                       owner_name = $8,
                       updated_at = $9
                 WHERE state_id = $1
                   AND record_id = $2
                "#,
                &[
                    &row.state_id,
                    &row.record_id,
                    &row.position,
                    &row.record.to_value(),
                    &row.content_hash,
                    &row.primary_name,
                    &row.company_name,
                    &row.owner_name,
                    &row.updated_at,
                ],
            )
            .await
            .map_err(db_error)?;
        if updated != 1 {
            return Err(RecordsStoreError::Db(format!(
                "mirror row {} vanished before update",
                row.record_id
            )));
        }
        Ok(())
    }

    async fn delete_mirror_rows(
        &mut self,
        state_id: &str,
        record_ids: &[String],
    ) -> Result<(), RecordsStoreError> {
        self.tx
            .execute(
                r#"
                DELETE FROM records.mirror_rows
                 WHERE state_id = $1
                   AND record_id = ANY($2)
                "#,
                &[&state_id, &record_ids],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn mirror_row_hashes(
        &mut self,
        state_id: &str,
    ) -> Result<Vec<(String, String)>, RecordsStoreError> {
        let rows = self
            .tx
            .query(
                r#"
                SELECT record_id, payload
                  FROM records.mirror_rows
                 WHERE state_id = $1
                 ORDER BY position, record_id
                "#,
                &[&state_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|row| payload_hash(row.get("record_id"), &row.get::<_, Value>("payload")))
            .collect()
    }

    async fn write_revision(
        &mut self,
        state_id: &str,
        token: &RevisionToken,
    ) -> Result<(), RecordsStoreError> {
        let updated_at = token.as_datetime();
        self.tx
            .execute(
                r#"
                UPDATE records.state_revisions
                   SET updated_at = $2
                 WHERE state_id = $1
                "#,
                &[&state_id, &updated_at],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn write_legacy_records(
        &mut self,
        state_id: &str,
        records: &[Record],
    ) -> Result<(), RecordsStoreError> {
        write_legacy_blob(&self.tx, state_id, records).await
    }

    async fn write_legacy_records_best_effort(
        &mut self,
        state_id: &str,
        records: &[Record],
    ) -> Result<LegacyMirrorBack, RecordsStoreError> {
        let savepoint = self
            .tx
            .savepoint("records_legacy_mirror_back")
            .await
            .map_err(db_error)?;
        match write_legacy_blob(&savepoint, state_id, records).await {
            Ok(()) => {
                savepoint.commit().await.map_err(db_error)?;
                Ok(LegacyMirrorBack::Written)
            }
            Err(error) => {
                savepoint.rollback().await.map_err(db_error)?;
                Ok(LegacyMirrorBack::RolledBack(error))
            }
        }
    }

    async fn mark_legacy_stale(&mut self, state_id: &str) -> Result<(), RecordsStoreError> {
        self.tx
            .execute(
                r#"
                UPDATE records.state_revisions
                   SET legacy_stale = true
                 WHERE state_id = $1
                "#,
                &[&state_id],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

async fn write_legacy_blob(
    tx: &Transaction<'_>,
    state_id: &str,
    records: &[Record],
) -> Result<(), RecordsStoreError> {
    let blob = Value::Array(records.iter().map(Record::to_value).collect());
    tx.execute(
        r#"
        UPDATE records.state_revisions
           SET records_json = $2,
               legacy_stale = false
         WHERE state_id = $1
        "#,
        &[&state_id, &blob],
    )
    .await
    .map_err(db_error)?;
    Ok(())
}

fn db_error(error: tokio_postgres::Error) -> RecordsStoreError {
    RecordsStoreError::Db(error.to_string())
}

fn map_state_row(row: &Row) -> Result<LockedState, RecordsStoreError> {
    let state_id: String = row.get("state_id");
    let records_json: Value = row.get("records_json");
    let updated_at: Option<DateTime<Utc>> = row.get("updated_at");
    let legacy_stale: bool = row.get("legacy_stale");
    let Value::Array(items) = records_json else {
        return Err(RecordsStoreError::Corrupt(format!(
            "state {state_id} records_json is not an array"
        )));
    };
    let records = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            Record::from_value(item).map_err(|error| {
                RecordsStoreError::Corrupt(format!("state {state_id} records[{index}]: {error}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LockedState {
        state_id,
        records,
        updated_at: updated_at.map(RevisionToken::from_datetime),
        legacy_stale,
    })
}

/// Hash of a stored mirror payload, recomputed rather than trusted from the
/// row's `content_hash` column.
fn payload_hash(record_id: String, payload: &Value) -> Result<(String, String), RecordsStoreError> {
    let record = Record::from_value(payload).map_err(|error| {
        RecordsStoreError::Corrupt(format!("mirror row {record_id}: {error}"))
    })?;
    let hash = record_hash(&record);
    Ok((record_id, hash))
}

fn map_mirror_row(row: &Row) -> Result<MirrorRow, RecordsStoreError> {
    let record_id: String = row.get("record_id");
    let payload: Value = row.get("payload");
    let record = Record::from_value(&payload).map_err(|error| {
        RecordsStoreError::Corrupt(format!("mirror row {record_id}: {error}"))
    })?;
    if record.id() != record_id {
        return Err(RecordsStoreError::Corrupt(format!(
            "mirror row {record_id} carries payload for {}",
            record.id()
        )));
    }
    Ok(MirrorRow {
        state_id: row.get("state_id"),
        record_id,
        position: row.get("position"),
        record,
        content_hash: row.get("content_hash"),
        primary_name: row.get("primary_name"),
        company_name: row.get("company_name"),
        owner_name: row.get("owner_name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
