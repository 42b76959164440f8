//! Mapping-backed resolution of legacy codes, with optional bootstrap.

use log::{debug, info};

use crate::canonical::CanonicalStore;
use crate::error::Result;
use crate::extract::PatientDirectory;
use crate::identity::SYSTEM_ACTOR;
use crate::source::LegacySource;

/// Resolves legacy patient codes against the persisted mapping tables.
///
/// Automatic mappings win; manual overrides fill the gaps. An unmapped code
/// resolves to `None` and the record is imported patient-unbound rather
/// than dropped.
pub struct Resolver<'a> {
    store: &'a CanonicalStore,
    source_system: String,
}

impl<'a> Resolver<'a> {
    /// Resolver over `store` for one legacy source
    pub fn new(store: &'a CanonicalStore, source_system: &str) -> Self {
        Self {
            store,
            source_system: source_system.to_string(),
        }
    }

    /// Resolve a legacy code to an internal patient id, if any mapping
    /// (automatic first, then manual) covers it.
    pub fn resolve(&self, code: i64) -> Result<Option<i64>> {
        if let Some(mapping) = self.store.automatic_mapping(&self.source_system, code)? {
            return Ok(Some(mapping.patient_id));
        }
        if let Some(mapping) = self.store.manual_mapping(&self.source_system, code)? {
            debug!("code {code} resolved through manual override");
            return Ok(Some(mapping.patient_id));
        }
        Ok(None)
    }

    /// Bulk-bootstrap resolution: as [`Resolver::resolve`], but an unmapped
    /// code is looked up in the legacy patient directory, matched or
    /// created by exact (surname, first name, DOB), and the new mapping is
    /// persisted under the system actor. A code absent from the directory
    /// still resolves to `None`.
    pub fn resolve_or_bootstrap(
        &self,
        src: &LegacySource,
        directory: &PatientDirectory,
        code: i64,
    ) -> Result<Option<i64>> {
        if let Some(patient_id) = self.resolve(code)? {
            return Ok(Some(patient_id));
        }
        let Some(legacy) = directory.fetch_by_code(src, code)? else {
            debug!("code {code} has no row in the legacy patient directory");
            return Ok(None);
        };
        let patient_id = self.store.find_or_create_patient(
            &legacy.surname,
            legacy.first_name.as_deref(),
            legacy.dob,
            Some(&code.to_string()),
        )?;
        self.store
            .insert_automatic_mapping(&self.source_system, code, patient_id, SYSTEM_ACTOR)?;
        info!("bootstrapped mapping {code} -> patient {patient_id}");
        Ok(Some(patient_id))
    }

    /// Score an unmapped legacy code against internal patients sharing its
    /// surname. Proposal only; nothing is written.
    pub fn propose(
        &self,
        src: &LegacySource,
        directory: &PatientDirectory,
        code: i64,
    ) -> Result<super::ScoreOutcome> {
        let Some(legacy) = directory.fetch_by_code(src, code)? else {
            return Ok(super::ScoreOutcome::Unresolved);
        };
        let candidates = self.store.candidates_by_surname(&legacy.surname)?;
        Ok(super::score_candidates(&legacy, &candidates))
    }
}
