use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    db::DbConnection,
    error::ForceError,
    event::ForceEvent,
    properties::{Annotation, ForceRecord, HistoryEntry, Scope},
};

/// Command interface for record browsers and annotation front ends.
///
/// Front ends only read, and write operator context. Creating, deleting and (de)activating
/// records stays with the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// All records of one scope
    GetScope(Scope),
    /// All records of every scope of a controller
    GetController(String),
    /// Episodes of a single bit
    GetHistory(Scope, String),
    /// Set reason / forced-by / ticket on a bit. `None` fields are left alone.
    Annotate(Scope, String, Annotation),
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Op::GetScope(scope) => write!(f, "GetScope({scope})"),
            Op::GetController(name) => write!(f, "GetController({name})"),
            Op::GetHistory(scope, bit) => write!(f, "GetHistory({scope} {bit})"),
            Op::Annotate(scope, bit, _) => write!(f, "Annotate({scope} {bit})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    Records(Vec<ForceRecord>),
    History(Vec<HistoryEntry>),
    Event(ForceEvent),
}

impl Display for OpResult {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            OpResult::Records(records) => write!(
                f,
                "Records({} of which {} active)",
                records.len(),
                records.iter().filter(|r| r.force_active).count()
            ),
            OpResult::History(entries) => write!(f, "History({} episodes)", entries.len()),
            OpResult::Event(event) => write!(f, "Event({event})"),
        }
    }
}

pub async fn dispatch(db: &DbConnection, op: Op) -> Result<OpResult, ForceError> {
    tracing::debug!("Dispatching {}", op);
    match op {
        Op::GetScope(scope) => Ok(OpResult::Records(db.scope_records(&scope).await?)),
        Op::GetController(name) => Ok(OpResult::Records(db.controller_records(&name).await?)),
        Op::GetHistory(scope, bit) => Ok(OpResult::History(db.bit_history(&scope, &bit).await?)),
        Op::Annotate(scope, bit, annotation) => Ok(OpResult::Event(
            db.annotate(&scope, &bit, &annotation).await?,
        )),
    }
}
