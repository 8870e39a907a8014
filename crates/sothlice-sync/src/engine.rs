//! Insert / update / skip decisions for a fetched batch against a snapshot.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sothlice_core::{RunContext, SkipReason, Snapshot, SyncMode, TicketRecord, WriteOp};
use tracing::{info, warn};

/// Decide the write for one record. Pure: no I/O, no snapshot mutation.
pub fn decide(record: TicketRecord, snapshot: &Snapshot, mode: SyncMode) -> WriteOp {
    let Some(stored) = snapshot.get(&record.key) else {
        return WriteOp::Insert { record };
    };

    match mode {
        SyncMode::InsertOnly => WriteOp::Skip {
            record,
            reason: SkipReason::Unchanged,
        },
        SyncMode::Upsert => match record.updated.cmp(stored) {
            Ordering::Greater => WriteOp::Update { record },
            Ordering::Equal => WriteOp::Skip {
                record,
                reason: SkipReason::Unchanged,
            },
            Ordering::Less => WriteOp::Skip {
                record,
                reason: SkipReason::Stale,
            },
        },
    }
}

/// One op per record, in input order. Duplicate input keys each resolve
/// against the same snapshot.
pub fn reconcile(records: Vec<TicketRecord>, snapshot: &Snapshot, mode: SyncMode) -> Vec<WriteOp> {
    records
        .into_iter()
        .map(|record| decide(record, snapshot, mode))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub inserts: usize,
    pub updates: usize,
    pub unchanged: usize,
    pub stale: usize,
}

impl PlanSummary {
    pub fn from_ops(ops: &[WriteOp]) -> Self {
        let mut summary = Self::default();
        for op in ops {
            match op {
                WriteOp::Insert { .. } => summary.inserts += 1,
                WriteOp::Update { .. } => summary.updates += 1,
                WriteOp::Skip {
                    reason: SkipReason::Unchanged,
                    ..
                } => summary.unchanged += 1,
                WriteOp::Skip {
                    reason: SkipReason::Stale,
                    ..
                } => summary.stale += 1,
            }
        }
        summary
    }

    pub fn writes(&self) -> usize {
        self.inserts + self.updates
    }
}

/// Mode-bound wrapper around [`reconcile`] that logs the plan.
#[derive(Debug, Clone, Copy)]
pub struct ReconciliationEngine {
    mode: SyncMode,
}

impl ReconciliationEngine {
    pub fn new(mode: SyncMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn reconcile(
        &self,
        ctx: &RunContext,
        records: Vec<TicketRecord>,
        snapshot: &Snapshot,
    ) -> (Vec<WriteOp>, PlanSummary) {
        let ops = reconcile(records, snapshot, self.mode);
        for op in &ops {
            if let WriteOp::Skip {
                record,
                reason: SkipReason::Stale,
            } = op
            {
                warn!(
                    run_id = %ctx.run_id,
                    key = %record.key,
                    remote_updated = %record.updated,
                    stored_updated = ?snapshot.get(&record.key),
                    "remote record is older than stored copy; not applying"
                );
            }
        }
        let summary = PlanSummary::from_ops(&ops);
        info!(
            run_id = %ctx.run_id,
            mode = %self.mode,
            inserts = summary.inserts,
            updates = summary.updates,
            unchanged = summary.unchanged,
            stale = summary.stale,
            "reconciled batch"
        );
        (ops, summary)
    }
}
