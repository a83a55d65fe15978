//! Errors

use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = anyhow::Result<T, Error>;

/// Errors surfaced by the mapping engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Entity metadata is unusable for the requested operation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A key-based operation was given an entity whose key is null.
    #[error("key column `{column}` of `{entity}` is null")]
    NullKeyValue {
        /// Entity name.
        entity: &'static str,
        /// The null key column.
        column: &'static str,
    },

    /// A single-key operation was issued against an entity with several keys.
    #[error("`{entity}` must declare exactly one key column, found {found}")]
    NotOnlyOneKeyColumn {
        /// Entity name.
        entity: &'static str,
        /// Number of key columns declared.
        found: usize,
    },

    /// An optimistic-concurrency check failed.
    #[error("cas version mismatch, {affected} row(s) affected")]
    CasVersionMismatch {
        /// Rows that did match.
        affected: u64,
    },

    /// A declared column is missing from a result row.
    #[error("column `{column}` of `{entity}` not found in result row")]
    UnknownColumn {
        /// Entity name.
        entity: &'static str,
        /// The missing column.
        column: String,
    },

    /// A registered interceptor vetoed the operation.
    #[error("{operation} on `{entity}` rejected by interceptor")]
    InterceptorRejected {
        /// Name of the vetoed operation.
        operation: &'static str,
        /// Entity name.
        entity: &'static str,
    },

    /// Caller input was refused before any SQL ran.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A column value could not be converted to or from its field type.
    #[error("cannot map column `{column}`: {message}")]
    Mapping {
        /// Column being converted.
        column: String,
        /// Why the conversion failed.
        message: String,
    },

    /// The database collaborator failed.
    #[error(transparent)]
    Database(anyhow::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    pub(crate) fn mapping(column: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Mapping {
            column: column.into(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        // collaborator callbacks may hand our own error back wrapped in anyhow
        match err.downcast::<Self>() {
            Ok(inner) => inner,
            Err(err) => {
                tracing::debug!("database error: {err:#}");
                Self::Database(err)
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Mapping {
            column: "json".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Registry, fmt};

    use super::*;

    #[test]
    fn anyhow_keeps_engine_errors() {
        let _ = Registry::default().with(EnvFilter::new("debug")).with(fmt::layer()).try_init();

        let err: Error = anyhow::Error::new(Error::CasVersionMismatch { affected: 2 }).into();
        assert!(matches!(err, Error::CasVersionMismatch { affected: 2 }));

        let err: Error = anyhow!("connection reset").into();
        assert!(matches!(err, Error::Database(_)));
        assert_eq!(err.to_string(), "connection reset");
    }

    #[test]
    fn messages() {
        let err = Error::NotOnlyOneKeyColumn {
            entity: "Student",
            found: 2,
        };
        assert_eq!(err.to_string(), "`Student` must declare exactly one key column, found 2");

        let err = Error::invalid("delete filter is blank");
        assert_eq!(err.to_string(), "invalid parameter: delete filter is blank");
    }
}
