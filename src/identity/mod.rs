//! Identity resolution: legacy patient codes to internal patient identities.
//!
//! The hot import path only consults persisted mappings (automatic first,
//! then manual overrides) and, during bulk bootstrap, find-or-creates an
//! internal patient for an unmapped code. The multi-signal scorer in
//! [`scoring`] is an offline curation tool; it proposes mappings but never
//! applies an ambiguous or unresolved outcome.

pub mod resolver;
pub mod scoring;

use chrono::NaiveDate;
use serde::Serialize;

pub use resolver::Resolver;
pub use scoring::{MatchRank, ScoreOutcome, score_candidates};

/// Actor recorded on mappings created by bulk bootstrap
pub const SYSTEM_ACTOR: &str = "system";

/// (legacy source, legacy patient code) -> internal patient id.
/// Exactly one per key; changing it is an administrative action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientMapping {
    /// Legacy source system name
    pub source: String,
    /// Legacy patient code
    pub code: i64,
    /// Internal patient id
    pub patient_id: i64,
    /// Who created the mapping ("system" for bootstrap)
    pub created_by: String,
}

/// Administrative override with the same key shape plus a note.
/// Consulted when no automatic mapping exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualMapping {
    /// Legacy source system name
    pub source: String,
    /// Legacy patient code
    pub code: i64,
    /// Internal patient id
    pub patient_id: i64,
    /// Free-text justification
    pub note: String,
}

/// An internal patient considered by the offline scorer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalCandidate {
    /// Internal patient id; ties break by this, ascending
    pub id: i64,
    /// Surname
    pub surname: String,
    /// First name, when recorded
    pub first_name: Option<String>,
    /// Date of birth, when recorded
    pub dob: Option<NaiveDate>,
    /// Postcode, when recorded
    pub postcode: Option<String>,
    /// Phone number, when recorded
    pub phone: Option<String>,
    /// Legacy id this patient is already known by, when recorded
    pub legacy_reference: Option<String>,
}
