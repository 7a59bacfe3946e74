use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

use crate::models::SourceKind;

/// Errors raised while reading configuration from the environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Failure taxonomy of one pipeline run.
///
/// `Connection` and retryable `SourceUnavailable` failures are retried by
/// the adapters. Everything except `Notification` aborts the current run; the
/// scheduler logs it and waits for the next tick.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Source database unreachable, pool exhausted or query timed out
    #[error("database connection failed: {0}")]
    Connection(String),

    /// Source query failed or returned rows in an unexpected shape
    #[error("database query failed: {0}")]
    Query(String),

    /// HTTP provider failure. `retryable` is false for answers a retry
    /// cannot change (4xx other than 429, a payload of the wrong shape).
    #[error("{source_name} unavailable: {message}")]
    SourceUnavailable {
        source_name: &'static str,
        message: String,
        retryable: bool,
    },

    /// A stock date had no matching row under the `fail` gap policy
    #[error("no {missing} record for generation date {date}")]
    MergeGap { date: NaiveDate, missing: SourceKind },

    #[error("warehouse write failed: {0}")]
    Write(String),

    #[error("alert notification failed: {0}")]
    Notification(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EtlError {
    pub fn unavailable(source_name: &'static str, message: impl Into<String>) -> Self {
        EtlError::SourceUnavailable {
            source_name,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn rejected(source_name: &'static str, message: impl Into<String>) -> Self {
        EtlError::SourceUnavailable {
            source_name,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        EtlError::Connection(format!("query timed out after {:?}", after))
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::Connection(_) => true,
            EtlError::SourceUnavailable { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Classify a source-side sqlx error into connection vs query failure.
    pub fn from_source_db(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => EtlError::Connection(err.to_string()),
            // SQLITE_CANTOPEN
            sqlx::Error::Database(db) if db.code().as_deref() == Some("14") => {
                EtlError::Connection(err.to_string())
            }
            _ => EtlError::Query(err.to_string()),
        }
    }

    pub fn write(err: impl std::fmt::Display) -> Self {
        EtlError::Write(err.to_string())
    }

    /// Reading back from the warehouse.
    pub fn read(err: impl std::fmt::Display) -> Self {
        EtlError::Query(err.to_string())
    }
}
