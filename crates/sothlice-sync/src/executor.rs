//! Applies reconciliation decisions to a [`RecordStore`], one transaction per record.

use serde::{Deserialize, Serialize};
use sothlice_core::{RunContext, SkipReason, WriteOp, WriteOutcome};
use sothlice_storage::RecordStore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Terminal state of one record within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Inserted,
    InsertConflictSkipped,
    Updated,
    SkipUnchanged,
    SkipStale,
    UpdateLostRace,
    /// The write hit a fatal store error.
    Failed,
    /// Never reached because an earlier record aborted the batch.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub key: String,
    pub state: RecordState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_unchanged: usize,
    pub skipped_stale: usize,
    pub insert_conflicts: usize,
    pub lost_updates: usize,
    pub not_attempted: usize,
    pub partial: bool,
    pub fatal_error: Option<String>,
    pub outcomes: Vec<RecordOutcome>,
}

impl ExecutionReport {
    pub fn skipped(&self) -> usize {
        self.skipped_unchanged + self.skipped_stale
    }

    /// Duplicate-key inserts and lost updates that were absorbed.
    pub fn recovered_conflicts(&self) -> usize {
        self.insert_conflicts + self.lost_updates
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn state_of(&self, key: &str) -> Option<RecordState> {
        self.outcomes.iter().find(|o| o.key == key).map(|o| o.state)
    }

    fn record(&mut self, key: &str, state: RecordState) {
        match state {
            RecordState::Inserted => self.inserted += 1,
            RecordState::InsertConflictSkipped => self.insert_conflicts += 1,
            RecordState::Updated => self.updated += 1,
            RecordState::SkipUnchanged => self.skipped_unchanged += 1,
            RecordState::SkipStale => self.skipped_stale += 1,
            RecordState::UpdateLostRace => self.lost_updates += 1,
            RecordState::NotAttempted => self.not_attempted += 1,
            RecordState::Failed => {}
        }
        self.outcomes.push(RecordOutcome {
            key: key.to_string(),
            state,
        });
    }

    fn abort(&mut self, remaining: &[WriteOp], reason: String) {
        self.partial = true;
        self.fatal_error = Some(reason);
        for op in remaining {
            self.record(op.key(), RecordState::NotAttempted);
        }
    }
}

pub struct WriteExecutor<'a> {
    store: &'a dyn RecordStore,
}

impl<'a> WriteExecutor<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self { store }
    }

    pub async fn execute(&self, ctx: &RunContext, ops: &[WriteOp]) -> ExecutionReport {
        self.execute_until(ctx, ops, None).await
    }

    /// Like [`execute`](Self::execute), but stops before any record that would
    /// start after `deadline`, returning a partial report.
    pub async fn execute_until(
        &self,
        ctx: &RunContext,
        ops: &[WriteOp],
        deadline: Option<Instant>,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();

        for (index, op) in ops.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(run_id = %ctx.run_id, remaining = ops.len() - index, "run deadline reached; stopping writes");
                report.abort(&ops[index..], "run deadline exceeded".to_string());
                break;
            }

            let key = op.key();
            let applied = match op {
                WriteOp::Skip { reason, .. } => Ok(match reason {
                    SkipReason::Unchanged => RecordState::SkipUnchanged,
                    SkipReason::Stale => RecordState::SkipStale,
                }),
                WriteOp::Insert { record } => self.store.insert(record).await.map(|outcome| match outcome {
                    WriteOutcome::Applied => RecordState::Inserted,
                    WriteOutcome::Conflict(_) => RecordState::InsertConflictSkipped,
                }),
                WriteOp::Update { record } => self.store.update(record).await.map(|outcome| match outcome {
                    WriteOutcome::Applied => RecordState::Updated,
                    WriteOutcome::Conflict(_) => RecordState::UpdateLostRace,
                }),
            };

            match applied {
                Ok(RecordState::InsertConflictSkipped) => {
                    warn!(run_id = %ctx.run_id, key, "insert lost a race with another writer; skipping");
                    report.record(key, RecordState::InsertConflictSkipped);
                }
                Ok(RecordState::UpdateLostRace) => {
                    warn!(run_id = %ctx.run_id, key, "update matched no rows; record vanished since snapshot");
                    report.record(key, RecordState::UpdateLostRace);
                }
                Ok(state) => {
                    debug!(run_id = %ctx.run_id, key, ?state, "record done");
                    report.record(key, state);
                }
                Err(err) => {
                    error!(run_id = %ctx.run_id, key, error = %err, "fatal store error; aborting batch");
                    report.record(key, RecordState::Failed);
                    report.abort(&ops[index + 1..], format!("{key}: {err}"));
                    break;
                }
            }
        }

        info!(
            run_id = %ctx.run_id,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped(),
            conflicts = report.recovered_conflicts(),
            partial = report.partial,
            "executed write plan"
        );
        report
    }
}
