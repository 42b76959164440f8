//! Orchestration of one migration pass: extract, resolve, upsert.
//!
//! Domains are synced independently: a schema-drift failure in one table
//! never blocks the others. Overlapping runs against the same store are not
//! coordinated here; the storage-level key constraint keeps them safe but
//! their created/updated counts may interleave.

use log::{info, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::canonical::{CanonicalRecord, CanonicalStore, Domain, UpsertStats};
use crate::config::RunConfig;
use crate::error::Result;
use crate::extract::{self, DropReason, ExtractionReport, PatientDirectory};
use crate::identity::Resolver;
use crate::source::{ExtractBounds, LegacySource};

/// Outcome of syncing one domain
#[derive(Debug, Clone, Serialize)]
pub struct DomainOutcome {
    /// Domain synced
    pub domain: Domain,
    /// Extraction drop accounting for the pass
    pub report: ExtractionReport,
    /// Store outcome counts for the pass
    pub stats: UpsertStats,
}

/// What one domain would do, computed without writing
#[derive(Debug, Clone, Serialize)]
pub struct DomainPreview {
    /// Domain previewed
    pub domain: Domain,
    /// Actual source table behind it in this deployment
    pub table: String,
    /// Extraction drop accounting for the pass
    pub report: ExtractionReport,
    /// Store outcome counts the real run would produce
    pub stats: UpsertStats,
    /// Rows whose record id had to be derived from a natural key
    pub synthetic_ids: u64,
    /// Failure message, when the domain failed before normalization; the
    /// counts above are all zero in that case
    pub error: Option<String>,
}

/// Read-only preview of a full migration pass
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    /// Per-domain previews, in domain order
    pub domains: Vec<DomainPreview>,
    /// Legacy codes seen in the extraction that no mapping covers, ascending
    pub unresolved_codes: Vec<i64>,
}

/// Drives extract-resolve-upsert passes over one legacy source
pub struct SyncEngine<'a> {
    src: &'a LegacySource,
    store: &'a CanonicalStore,
    config: &'a RunConfig,
    source_system: String,
}

impl<'a> SyncEngine<'a> {
    /// Engine over an open source and store
    pub fn new(
        src: &'a LegacySource,
        store: &'a CanonicalStore,
        config: &'a RunConfig,
        source_system: &str,
    ) -> Self {
        Self {
            src,
            store,
            config,
            source_system: source_system.to_string(),
        }
    }

    fn bounds(&self) -> ExtractBounds {
        ExtractBounds {
            code_range: self.config.code_range,
            window: self.config.window,
        }
    }

    /// Extract one domain and normalize its rows, patient bindings applied
    fn extract_domain(
        &self,
        domain: Domain,
        report: &mut ExtractionReport,
        bootstrap: bool,
    ) -> Result<Vec<CanonicalRecord>> {
        let extractor = extract::probe_domain(self.src, domain, &self.source_system)?;
        *report = ExtractionReport::for_table(extractor.table());
        let mut records =
            extractor.extract(self.src, &self.bounds(), self.config.batch_size, report)?;

        let resolver = Resolver::new(self.store, &self.source_system);
        let directory = if bootstrap {
            Some(PatientDirectory::probe(self.src)?)
        } else {
            None
        };

        // One resolution per distinct code per pass.
        let mut resolved: FxHashMap<i64, Option<i64>> = FxHashMap::default();
        for record in &mut records {
            let Some(code) = record.patient_code else {
                continue;
            };
            let patient_id = match resolved.get(&code) {
                Some(cached) => *cached,
                None => {
                    let id = match &directory {
                        Some(directory) => {
                            resolver.resolve_or_bootstrap(self.src, directory, code)?
                        }
                        None => resolver.resolve(code)?,
                    };
                    resolved.insert(code, id);
                    id
                }
            };
            record.patient_id = patient_id;
        }

        // A source occasionally hands back the same logical row twice in
        // one pass; the first occurrence stands and the rest are
        // reclassified from included to duplicates.
        let mut seen: FxHashSet<String> = FxHashSet::default();
        records.retain(|record| {
            if seen.insert(record.unique_key()) {
                true
            } else {
                report.included -= 1;
                report.tally(DropReason::DuplicateKey);
                false
            }
        });

        if !report.is_closed() {
            warn!(
                "{} accounting did not close: scanned {} included {} dropped {}",
                report.table,
                report.scanned,
                report.included,
                report.dropped()
            );
        }
        Ok(records)
    }

    /// Sync one domain end to end
    pub fn sync_domain(&self, domain: Domain) -> Result<DomainOutcome> {
        let mut report = ExtractionReport::default();
        let records = self.extract_domain(domain, &mut report, self.config.bootstrap)?;
        let stats = self.store.upsert_batch(&records, self.config.flush_size)?;
        info!(
            "{}: scanned {} included {} created {} updated {} skipped {}",
            domain.as_str(),
            report.scanned,
            report.included,
            stats.created,
            stats.updated,
            stats.skipped
        );
        Ok(DomainOutcome {
            domain,
            report,
            stats,
        })
    }

    /// Sync every domain, isolating failures: one domain's error is
    /// reported alongside the others' outcomes, never instead of them.
    pub fn sync_all(&self) -> Vec<(Domain, Result<DomainOutcome>)> {
        Domain::ALL
            .into_iter()
            .map(|domain| {
                let outcome = self.sync_domain(domain);
                if let Err(err) = &outcome {
                    warn!("{} sync failed: {err}", domain.as_str());
                }
                (domain, outcome)
            })
            .collect()
    }

    /// Preview a full pass without writing anything: what each domain would
    /// create, update, and skip, which rows would carry synthetic ids, and
    /// which legacy codes no mapping covers.
    pub fn dry_run(&self) -> Result<DryRunReport> {
        let mut domains = Vec::new();
        let mut unresolved: FxHashSet<i64> = FxHashSet::default();

        for domain in Domain::ALL {
            let mut report = ExtractionReport::default();
            let records = match self.extract_domain(domain, &mut report, false) {
                Ok(records) => records,
                Err(err) => {
                    warn!("{} dry run failed: {err}", domain.as_str());
                    domains.push(DomainPreview {
                        domain,
                        table: report.table.clone(),
                        report,
                        stats: UpsertStats::default(),
                        synthetic_ids: 0,
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };

            let mut keys = Vec::with_capacity(records.len() * 2);
            for record in &records {
                keys.push(record.unique_key());
                if let Some(key) = record.unresolved_key() {
                    keys.push(key);
                }
            }
            let existing = self.store.fetch_by_keys(&keys)?;

            let mut stats = UpsertStats::default();
            let mut synthetic_ids = 0;
            for record in &records {
                if record.synthetic_id {
                    synthetic_ids += 1;
                }
                if record.patient_id.is_none() {
                    if let Some(code) = record.patient_code {
                        unresolved.insert(code);
                    }
                }
                let stored = existing.get(&record.unique_key()).or_else(|| {
                    record
                        .unresolved_key()
                        .and_then(|key| existing.get(&key))
                });
                match stored {
                    None => stats.created += 1,
                    Some(stored) if stored.comparable_eq(record) => stats.skipped += 1,
                    Some(_) => stats.updated += 1,
                }
            }

            domains.push(DomainPreview {
                domain,
                table: report.table.clone(),
                report,
                stats,
                synthetic_ids,
                error: None,
            });
        }

        let mut unresolved_codes: Vec<i64> = unresolved.into_iter().collect();
        unresolved_codes.sort_unstable();
        Ok(DryRunReport {
            domains,
            unresolved_codes,
        })
    }
}
