//! Error handling for the legacy bridge.

use std::time::Duration;

/// Specialized error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Configuration is incomplete or refuses the run before any row is read
    #[error("configuration error: {0}")]
    Config(String),

    /// A required column is absent under every known alias for a table.
    ///
    /// Fatal for the affected domain only; sibling domains in the same run
    /// are unaffected.
    #[error("schema drift: table '{table}' has none of the candidate columns [{}]", aliases.join(", "))]
    SchemaDrift {
        /// The table that was probed
        table: String,
        /// Every alias that was tried, in probe order
        aliases: Vec<String>,
    },

    /// A table is absent under every known alias
    #[error("schema drift: none of the candidate tables [{}] exist in the source", aliases.join(", "))]
    MissingTable {
        /// Every table alias that was tried, in probe order
        aliases: Vec<String>,
    },

    /// Error from the storage driver
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A transient storage error survived the whole retry budget.
    /// The original error text is preserved verbatim.
    #[error("retry budget exhausted after {attempts} attempts: {message}")]
    RetryExhausted {
        /// Number of attempts made, including the first
        attempts: u32,
        /// The original storage error text
        message: String,
    },

    /// Error serializing a payload or report
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid data that cannot be counted as an ordinary drop reason
    #[error("data error: {0}")]
    Data(String),
}

impl BridgeError {
    /// Build a configuration error naming every missing field individually
    #[must_use]
    pub fn missing_config(fields: &[&str]) -> Self {
        Self::Config(format!(
            "missing required connection parameter(s): {}",
            fields.join(", ")
        ))
    }

    /// Whether this error belongs to the transient lock/interrupt class
    /// that the extraction layer retries with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::OperationInterrupted
            ),
            _ => false,
        }
    }

    /// Describe a retry delay for logging
    #[must_use]
    pub fn retry_hint(delay: Duration, attempt: u32) -> String {
        format!("transient storage error, retrying in {delay:?} (attempt {attempt})")
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
