use std::{borrow::Cow, error::Error as StdError, fmt, io};

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use sqlx::{
    error::{DatabaseError, ErrorKind as DatabaseErrorKind},
    migrate::MigrateError,
    Error as SqlxError,
};
use thiserror::Error;
use tokio::{sync::mpsc::error::SendError as TokioSendError, task::JoinError};

use crate::event::ForceEvent;

/// Batch-level failures. Row-level problems (undecodable identifiers, invalid values, a
/// failed lookup chunk) never surface here; they are carried as data in the batch reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum ForceError {
    #[error("Force store error: {0}")]
    Store(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Reference metadata lookup error: {0}")]
    Lookup(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Batch abandoned before reconciliation")]
    Cancelled,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Dump transport error: {0}")]
    Transport(String),
}

impl From<toml::de::Error> for ForceError {
    fn from(src: toml::de::Error) -> ForceError {
        ForceError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for ForceError {
    fn from(src: toml::ser::Error) -> ForceError {
        ForceError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for ForceError {
    fn from(src: JsonError) -> ForceError {
        ForceError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for ForceError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => ForceError::NotFound(format!("{x}")),
            _ => ForceError::Io(format!("IOError: {} ({x})", x.kind())),
        }
    }
}

impl From<walkdir::Error> for ForceError {
    fn from(x: walkdir::Error) -> Self {
        match x.into_io_error() {
            Some(io_error) => ForceError::from(io_error),
            None => ForceError::Io("directory walk hit a filesystem loop".to_string()),
        }
    }
}

impl From<fmt::Error> for ForceError {
    fn from(x: fmt::Error) -> Self {
        ForceError::Custom(format!("{x}"))
    }
}

impl From<JoinError> for ForceError {
    fn from(x: JoinError) -> Self {
        if x.is_cancelled() {
            ForceError::Cancelled
        } else {
            ForceError::Custom(format!("scope task panicked: {x}"))
        }
    }
}

impl From<TokioSendError<ForceEvent>> for ForceError {
    fn from(x: TokioSendError<ForceEvent>) -> Self {
        ForceError::Io(format!(
            "Channel update send Error, could not transmit force event {}",
            x.0
        ))
    }
}

impl From<SqlxError> for ForceError {
    fn from(db_error: SqlxError) -> Self {
        ForceError::Store(format!("database error: {db_error:?}"))
    }
}

impl From<MigrateError> for ForceError {
    fn from(migrate_error: MigrateError) -> Self {
        ForceError::Store(format!("migration error: {migrate_error}"))
    }
}

impl DatabaseError for ForceError {
    fn message(&self) -> &str {
        "forcewatch FromRow parsing failure"
    }

    fn kind(&self) -> sqlx::error::ErrorKind {
        DatabaseErrorKind::Other
    }

    /// The extended result code.
    #[inline]
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }

    #[doc(hidden)]
    fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = ForceError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, ForceError::NotFound(_)));

        let err = ForceError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, ForceError::Io(_)));
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err: ForceError = toml::from_str::<toml::Table>("= nope").unwrap_err().into();
        assert!(matches!(err, ForceError::Config(_)));
    }
}
