//! A migration and reconciliation engine for legacy dental practice
//! management data: schema-adaptive read-only extraction, patient identity
//! resolution, idempotent canonical unification, and parity checking.

pub mod canonical;
pub mod config;
pub mod error;
pub mod extract;
pub mod identity;
pub mod parity;
pub mod report;
pub mod source;

// Core types
pub use config::{DateWindow, RetryPolicy, RunConfig, SourceConfig};
pub use error::{BridgeError, Result};

// Extraction layer
pub use extract::{DomainExtractor, DropReason, ExtractionReport, probe_domain};
pub use source::{Cursor, ExtractBounds, LegacySource};

// Canonical unification
pub use canonical::{
    CanonicalRecord, CanonicalStore, Domain, DryRunReport, RecordFilter, SyncEngine, UpsertStats,
    synthetic_id,
};

// Identity resolution
pub use identity::{MatchRank, Resolver, ScoreOutcome, score_candidates};

// Reconciliation and reporting
pub use parity::{ParityChecker, ParityReport, ParityStatus};
pub use report::{RunStatus, RunSummary, summarize_run};
