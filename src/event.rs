use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::properties::{Annotation, ForceRecord, Scope};

/// Per-scope tallies of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSummary {
    pub scope: Scope,
    pub department: String,
    pub processed_at: i64,
    /// Distinct bits in the batch.
    pub batch_size: usize,
    pub forced: usize,
    pub refreshed: usize,
    pub reforced: usize,
    pub deforced: usize,
    /// Bits whose value did not decode.
    pub invalid: usize,
    /// Metadata lookup chunks that failed; non-zero means the batch was partial.
    pub failed_chunks: usize,
}

impl ScopeSummary {
    pub fn changed(&self) -> usize {
        self.forced + self.reforced + self.deforced
    }
}

/// A state change of the force store.
///
/// The reconciliation diff is expressed as a sequence of these, staged into a
/// [`crate::db::Transaction`] and written atomically. After commit the same events are forwarded
/// to any listener, so UI consumers react to changes instead of polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ForceEvent {
    /// NotPresent → Active. Creates the record and opens a history entry.
    BitForced(ForceRecord),
    /// Active → Active. Batch-owned fields only; annotations and history untouched.
    BitRefreshed(ForceRecord),
    /// Inactive → Active. Starts a new episode with cleared annotations.
    BitReforced(ForceRecord),
    /// Active → Inactive at the given time. Closes the open history entry.
    BitDeforced(Scope, String, i64),
    /// Operator context applied to a bit.
    Annotated(Scope, String, Annotation),
    ScopeRemoved(Scope),
    ControllerRemoved(String),
    ScopeProcessed(ScopeSummary),
}

impl ForceEvent {
    /// The scope this event touches, if it is scoped at all.
    pub fn scope(&self) -> Option<&Scope> {
        match self {
            ForceEvent::BitForced(record)
            | ForceEvent::BitRefreshed(record)
            | ForceEvent::BitReforced(record) => Some(&record.scope),
            ForceEvent::BitDeforced(scope, _, _)
            | ForceEvent::Annotated(scope, _, _)
            | ForceEvent::ScopeRemoved(scope) => Some(scope),
            ForceEvent::ScopeProcessed(summary) => Some(&summary.scope),
            ForceEvent::ControllerRemoved(_) => None,
        }
    }

    /// True for events that change which bits are active.
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            ForceEvent::BitForced(_) | ForceEvent::BitReforced(_) | ForceEvent::BitDeforced(..)
        )
    }
}

impl Display for ForceEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ForceEvent::BitForced(r) => write!(f, "BitForced({} {})", r.scope, r.bit_number),
            ForceEvent::BitRefreshed(r) => write!(f, "BitRefreshed({} {})", r.scope, r.bit_number),
            ForceEvent::BitReforced(r) => write!(f, "BitReforced({} {})", r.scope, r.bit_number),
            ForceEvent::BitDeforced(scope, bit, _) => write!(f, "BitDeforced({scope} {bit})"),
            ForceEvent::Annotated(scope, bit, _) => write!(f, "Annotated({scope} {bit})"),
            ForceEvent::ScopeRemoved(scope) => write!(f, "ScopeRemoved({scope})"),
            ForceEvent::ControllerRemoved(name) => write!(f, "ControllerRemoved({name})"),
            ForceEvent::ScopeProcessed(summary) => write!(
                f,
                "ScopeProcessed({} +{} ~{} -{})",
                summary.scope,
                summary.forced + summary.reforced,
                summary.refreshed,
                summary.deforced
            ),
        }
    }
}
