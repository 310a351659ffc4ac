//! Core record types shared by the pipeline stages and the force store.
//!
//! - [`Scope`]: a `(controller, resource)` pair. One dump file, one reconciliation unit.
//! - [`DeclaredType`]: the variable type recorded for a signal in the reference store.
//! - [`MetadataRecord`]: a dump row enriched with reference metadata.
//! - [`DecodedRecord`]: a metadata record plus its decoded value, the reconciliation input.
//! - [`ForceRecord`] / [`HistoryEntry`]: the persisted state.

use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{codec::value::DecodedValue, error::ForceError};

/// Literal stored for absent naming hierarchies and blank comments.
pub const NONE_SENTINEL: &str = "None";

/// Extension of cached dump files.
pub const DUMP_EXTENSION: &str = "dat";

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub controller: String,
    pub resource: String,
}

impl Scope {
    pub fn new(controller: impl Into<String>, resource: impl Into<String>) -> Scope {
        Scope {
            controller: controller.into(),
            resource: resource.into(),
        }
    }

    /// Local cache file name, `{controller}_{resource}.dat`.
    pub fn dump_file_name(&self) -> String {
        format!("{}_{}.{DUMP_EXTENSION}", self.controller, self.resource)
    }

    /// Inverse of [`Scope::dump_file_name`]. The controller is everything before the first
    /// `_`, so resources may contain underscores but controllers may not.
    pub fn from_dump_file_name(file_name: &str) -> Option<Scope> {
        let stem = file_name.strip_suffix(&format!(".{DUMP_EXTENSION}"))?;
        let (controller, resource) = stem.split_once('_')?;
        if controller.is_empty() || resource.is_empty() {
            return None;
        }
        Some(Scope::new(controller, resource))
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.controller, self.resource)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeclaredType {
    Bool,
    Real,
    Lint,
    Double,
    /// Any type the value codec does not know how to decode. Keeps the raw name.
    Other(String),
}

impl DeclaredType {
    pub fn as_str(&self) -> &str {
        match self {
            DeclaredType::Bool => "BOOL",
            DeclaredType::Real => "REAL",
            DeclaredType::Lint => "LINT",
            DeclaredType::Double => "DOUBLE",
            DeclaredType::Other(name) => name,
        }
    }
}

impl From<&str> for DeclaredType {
    fn from(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_ascii_uppercase().as_str() {
            "BOOL" => DeclaredType::Bool,
            "REAL" => DeclaredType::Real,
            "LINT" => DeclaredType::Lint,
            "DOUBLE" => DeclaredType::Double,
            _ => DeclaredType::Other(raw.to_string()),
        }
    }
}

impl From<String> for DeclaredType {
    fn from(raw: String) -> Self {
        DeclaredType::from(raw.as_str())
    }
}

impl From<DeclaredType> for String {
    fn from(declared: DeclaredType) -> Self {
        declared.as_str().to_string()
    }
}

impl FromStr for DeclaredType {
    type Err = ForceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DeclaredType::from(s))
    }
}

impl Display for DeclaredType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub name_id: String,
    pub kks: String,
    pub comment: String,
    pub second_comment: String,
    pub declared_type: DeclaredType,
    pub raw_value_tokens: Vec<String>,
    pub scope: Scope,
    pub department: String,
}

impl MetadataRecord {
    /// Stand-in returned when a scope's dump produced no names at all, so the caller can still
    /// record that the scope ran and came back empty.
    pub fn placeholder(scope: Scope, department: impl Into<String>) -> MetadataRecord {
        MetadataRecord {
            name_id: String::new(),
            kks: NONE_SENTINEL.to_string(),
            comment: NONE_SENTINEL.to_string(),
            second_comment: NONE_SENTINEL.to_string(),
            declared_type: DeclaredType::Other(String::new()),
            raw_value_tokens: Vec::new(),
            scope,
            department: department.into(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.name_id.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub metadata: MetadataRecord,
    pub value: DecodedValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceRecord {
    pub scope: Scope,
    pub bit_number: String,
    pub kks: String,
    pub comment: String,
    pub second_comment: String,
    pub declared_type: DeclaredType,
    pub value: DecodedValue,
    pub force_active: bool,
    /// Unix seconds at which the current (or most recent) episode started.
    pub forced_at: i64,
    pub forced_by: Option<String>,
    pub ticket_ref: Option<String>,
    pub reason: Option<String>,
    pub department: String,
}

impl ForceRecord {
    /// A freshly forced bit as first seen in a batch.
    pub fn from_decoded(decoded: &DecodedRecord, forced_at: i64) -> ForceRecord {
        let meta = &decoded.metadata;
        ForceRecord {
            scope: meta.scope.clone(),
            bit_number: meta.name_id.clone(),
            kks: meta.kks.clone(),
            comment: meta.comment.clone(),
            second_comment: meta.second_comment.clone(),
            declared_type: meta.declared_type.clone(),
            value: decoded.value.clone(),
            force_active: true,
            forced_at,
            forced_by: None,
            ticket_ref: None,
            reason: None,
            department: meta.department.clone(),
        }
    }

    /// Copy the batch-owned fields of `decoded` onto this record, leaving the activity flag,
    /// episode start and operator annotations alone.
    pub fn refresh_from(&mut self, decoded: &DecodedRecord) {
        let meta = &decoded.metadata;
        self.kks = meta.kks.clone();
        self.comment = meta.comment.clone();
        self.second_comment = meta.second_comment.clone();
        self.declared_type = meta.declared_type.clone();
        self.value = decoded.value.clone();
        self.department = meta.department.clone();
    }
}

impl FromRow<'_, SqliteRow> for ForceRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let value_str: &str = row.try_get("value")?;
        let value = DecodedValue::from_stored(value_str)?;
        let declared_str: &str = row.try_get("declared_type")?;
        let active: i64 = row.try_get("force_active")?;

        Ok(ForceRecord {
            scope: Scope::new(
                row.try_get::<String, _>("controller")?,
                row.try_get::<String, _>("resource")?,
            ),
            bit_number: row.try_get("bit_number")?,
            kks: row.try_get("kks")?,
            comment: row.try_get("comment")?,
            second_comment: row.try_get("second_comment")?,
            declared_type: DeclaredType::from(declared_str),
            value,
            force_active: active != 0,
            forced_at: row.try_get("forced_at")?,
            forced_by: row.try_get("forced_by")?,
            ticket_ref: row.try_get("ticket_ref")?,
            reason: row.try_get("reason")?,
            department: row.try_get("department")?,
        })
    }
}

/// One continuous forced episode of a bit. Open while `deforced_at` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub scope: Scope,
    pub bit_number: String,
    pub reason: Option<String>,
    pub forced_by: Option<String>,
    pub ticket_ref: Option<String>,
    pub forced_at: i64,
    pub deforced_at: Option<i64>,
}

impl HistoryEntry {
    pub fn is_open(&self) -> bool {
        self.deforced_at.is_none()
    }
}

impl FromRow<'_, SqliteRow> for HistoryEntry {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(HistoryEntry {
            id: row.try_get("id")?,
            scope: Scope::new(
                row.try_get::<String, _>("controller")?,
                row.try_get::<String, _>("resource")?,
            ),
            bit_number: row.try_get("bit_number")?,
            reason: row.try_get("reason")?,
            forced_by: row.try_get("forced_by")?,
            ticket_ref: row.try_get("ticket_ref")?,
            forced_at: row.try_get("forced_at")?,
            deforced_at: row.try_get("deforced_at")?,
        })
    }
}

/// Operator-supplied context for a forced bit. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub reason: Option<String>,
    pub forced_by: Option<String>,
    pub ticket_ref: Option<String>,
}

impl Annotation {
    pub fn is_empty(&self) -> bool {
        self.reason.is_none() && self.forced_by.is_none() && self.ticket_ref.is_none()
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
