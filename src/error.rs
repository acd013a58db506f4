use std::{fmt, io};

use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use sqlx::{migrate::MigrateError, Error as SqlxError};
use thiserror::Error;
use tokio::sync::mpsc::error::SendError as TokioSendError;

use crate::event::InvalidationEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum QueryDepsError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Deferred task queue error: {0}")]
    Queue(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for QueryDepsError {
    fn from(src: toml::de::Error) -> QueryDepsError {
        QueryDepsError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for QueryDepsError {
    fn from(src: toml::ser::Error) -> QueryDepsError {
        QueryDepsError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for QueryDepsError {
    fn from(src: JsonError) -> QueryDepsError {
        QueryDepsError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for QueryDepsError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => QueryDepsError::NotFound(format!("{x}")),
            _ => QueryDepsError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for QueryDepsError {
    fn from(x: fmt::Error) -> Self {
        QueryDepsError::Serialization(format!("{x}"))
    }
}

impl From<RegexError> for QueryDepsError {
    fn from(x: RegexError) -> Self {
        QueryDepsError::InvalidQuery(format!("Regex parse failed: {x}"))
    }
}

impl From<SqlxError> for QueryDepsError {
    fn from(db_error: SqlxError) -> Self {
        QueryDepsError::Database(format!("{db_error:?}"))
    }
}

impl From<MigrateError> for QueryDepsError {
    fn from(err: MigrateError) -> Self {
        QueryDepsError::Database(format!("migration failed: {err}"))
    }
}

impl From<TokioSendError<InvalidationEvent>> for QueryDepsError {
    fn from(x: TokioSendError<InvalidationEvent>) -> Self {
        QueryDepsError::Queue(format!(
            "Channel send error, could not transmit invalidation event {:?}",
            x.0
        ))
    }
}
