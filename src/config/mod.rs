//! Configuration for the migration engine.
//!
//! Loading configuration from files or the environment is a collaborator
//! concern; this module only defines the validated shapes the engine runs
//! with. Validation is fail-fast and names every missing field individually,
//! so an operator fixes one round of errors, not one error per run.

use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::{BridgeError, Result};

/// Connection parameters for the external legacy source.
///
/// The source is an embedded relational store, so the original
/// host/port/credential tuple collapses to a database path; the
/// enabled/read-only/timeout semantics are kept as-is.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Whether legacy import is enabled at all
    pub enabled: bool,
    /// Path to the legacy database file
    pub database: String,
    /// Must be `true`; the engine refuses a source not declared read-only
    pub read_only: bool,
    /// How long the driver waits on a locked source before reporting busy
    pub busy_timeout: Duration,
    /// Name recorded as the source system on every canonical record
    pub source_system: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database: String::new(),
            read_only: true,
            busy_timeout: Duration::from_millis(5_000),
            source_system: "legacy_pms".to_string(),
        }
    }
}

impl SourceConfig {
    /// Validate the configuration before any row is read.
    ///
    /// Every missing required field is named individually in one error.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Err(BridgeError::Config(
                "legacy import is disabled (enabled = false)".to_string(),
            ));
        }

        let mut missing = Vec::new();
        if self.database.trim().is_empty() {
            missing.push("database");
        }
        if self.source_system.trim().is_empty() {
            missing.push("source_system");
        }
        if !missing.is_empty() {
            return Err(BridgeError::missing_config(&missing));
        }

        if !self.read_only {
            return Err(BridgeError::Config(
                "legacy source is not configured read-only; refusing to connect".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for the transient lock/interrupt class of storage errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the retry following `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16).saturating_sub(1);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// A half-open business-date window: `from <= recorded_at < to`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateWindow {
    /// Inclusive lower bound
    pub from: NaiveDateTime,
    /// Exclusive upper bound
    pub to: NaiveDateTime,
}

impl DateWindow {
    /// Whether a timestamp falls inside the window
    #[must_use]
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        at >= self.from && at < self.to
    }
}

/// Tuning for one synchronization run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Rows fetched per source round-trip
    pub batch_size: usize,
    /// Patient codes per round-trip when an explicit code list is supplied
    pub code_chunk_size: usize,
    /// Canonical records committed per transaction (the flush point)
    pub flush_size: usize,
    /// Retry policy for transient source errors
    pub retry: RetryPolicy,
    /// Optional inclusive patient-code range bound
    pub code_range: Option<(i64, i64)>,
    /// Optional half-open business-date window
    pub window: Option<DateWindow>,
    /// Bootstrap unmapped patient codes during bulk import
    pub bootstrap: bool,
    /// How many most-recent rows per patient and domain a parity check
    /// compares
    pub parity_depth: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            code_chunk_size: 100,
            flush_size: 200,
            retry: RetryPolicy::default(),
            code_range: None,
            window: None,
            bootstrap: false,
            parity_depth: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_passes_for_complete_config() {
        let config = SourceConfig {
            database: "/var/lib/practice/legacy.db".to_string(),
            ..SourceConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_names_every_missing_field() {
        let config = SourceConfig {
            database: String::new(),
            source_system: "  ".to_string(),
            ..SourceConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("database"));
        assert!(err.contains("source_system"));
    }

    #[test]
    fn validate_refuses_disabled_import() {
        let config = SourceConfig {
            enabled: false,
            database: "legacy.db".to_string(),
            ..SourceConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("disabled"));
    }

    #[test]
    fn validate_refuses_writable_source() {
        let config = SourceConfig {
            database: "legacy.db".to_string(),
            read_only: false,
            ..SourceConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("read-only"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn window_is_half_open() {
        let window = DateWindow {
            from: NaiveDateTime::parse_from_str("2024-01-01T00:00:00", "%Y-%m-%dT%H:%M:%S").unwrap(),
            to: NaiveDateTime::parse_from_str("2024-02-01T00:00:00", "%Y-%m-%dT%H:%M:%S").unwrap(),
        };
        assert!(window.contains(window.from));
        assert!(!window.contains(window.to));
    }
}
