//! The per-scope Active/Inactive state machine.
//!
//! ```text
//! NotPresent ──seen──▶ Active ──absent──▶ Inactive
//!                        ▲  │seen            │
//!                        │  └──(refresh)     │seen
//!                        └───────────────────┘
//! ```
//!
//! [`plan`] is a pure diff of one scope's decoded batch against that scope's persisted records.
//! It produces the [`ForceEvent`]s that, applied together, move the store to the new state. The
//! store applies them in one transaction (see [`crate::db::DbConnection::reconcile_scope`]).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    event::{ForceEvent, ScopeSummary},
    properties::{DecodedRecord, ForceRecord, Scope},
};

/// A scope's decoded batch, taken as the complete set of bits forced on it right now, except
/// for the `unresolved` names whose metadata lookup failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeBatch {
    pub scope: Scope,
    pub department: String,
    pub records: Vec<DecodedRecord>,
    pub failed_chunks: usize,
    /// Bits present in the dump that could not be matched this pass. They keep their
    /// persisted state.
    #[serde(default)]
    pub unresolved: BTreeSet<String>,
}

impl ScopeBatch {
    pub fn new(scope: Scope, department: impl Into<String>) -> Self {
        ScopeBatch {
            scope,
            department: department.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub events: Vec<ForceEvent>,
    pub summary: ScopeSummary,
}

/// Diff `batch` against `current` (the persisted records of `batch.scope`) at time `now`.
///
/// Records in either input that belong to another scope are ignored, so a batch can never
/// deactivate bits of a sibling resource. Duplicate bits in the batch keep their last entry.
/// Bits listed in `batch.unresolved` are never deforced. The final event is always
/// [`ForceEvent::ScopeProcessed`].
pub fn plan(batch: &ScopeBatch, current: &[ForceRecord], now: i64) -> ReconcilePlan {
    let scope = &batch.scope;
    let mut summary = ScopeSummary {
        scope: scope.clone(),
        department: batch.department.clone(),
        processed_at: now,
        failed_chunks: batch.failed_chunks,
        ..Default::default()
    };

    let seen: BTreeMap<&str, &DecodedRecord> = batch
        .records
        .iter()
        .filter(|d| &d.metadata.scope == scope && !d.metadata.is_placeholder())
        .map(|d| (d.metadata.name_id.as_str(), d))
        .collect();
    let persisted: BTreeMap<&str, &ForceRecord> = current
        .iter()
        .filter(|r| &r.scope == scope)
        .map(|r| (r.bit_number.as_str(), r))
        .collect();

    summary.batch_size = seen.len();
    let mut events = Vec::with_capacity(seen.len() + 1);

    for (bit, decoded) in seen.iter() {
        if decoded.value.is_invalid() {
            summary.invalid += 1;
        }
        match persisted.get(bit) {
            None => {
                summary.forced += 1;
                events.push(ForceEvent::BitForced(ForceRecord::from_decoded(decoded, now)));
            }
            Some(existing) if existing.force_active => {
                summary.refreshed += 1;
                let mut record = (*existing).clone();
                record.refresh_from(decoded);
                events.push(ForceEvent::BitRefreshed(record));
            }
            Some(existing) => {
                summary.reforced += 1;
                let mut record = (*existing).clone();
                record.refresh_from(decoded);
                record.force_active = true;
                record.forced_at = now;
                record.reason = None;
                record.forced_by = None;
                record.ticket_ref = None;
                events.push(ForceEvent::BitReforced(record));
            }
        }
    }

    for (bit, existing) in persisted.iter() {
        let absent = !seen.contains_key(bit) && !batch.unresolved.contains(*bit);
        if existing.force_active && absent {
            summary.deforced += 1;
            events.push(ForceEvent::BitDeforced(scope.clone(), bit.to_string(), now));
        }
    }

    events.push(ForceEvent::ScopeProcessed(summary.clone()));
    ReconcilePlan { events, summary }
}
