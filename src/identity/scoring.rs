//! Offline candidate scoring for unmapped legacy patients.
//!
//! Candidates are internal patients sharing the legacy record's surname
//! (case-insensitive), ranked by strict precedence. The outcome is
//! deterministic for a fixed legacy record and candidate set regardless of
//! candidate storage order: ranks are total, and ties break by candidate id
//! ascending. Two or more equally strong candidates are ambiguous, which is
//! a human decision, never an automatic pick.

use serde::Serialize;

use crate::extract::LegacyPatient;
use crate::identity::InternalCandidate;

/// Match strength, weakest to strongest.
///
/// An exact legacy-id reference always outranks any combination of the
/// demographic signals below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRank {
    /// Surname plus last six digits of the phone number
    PhoneTail,
    /// Surname plus outward postcode
    OutwardPostcode,
    /// Surname plus full normalized postcode
    Postcode,
    /// Surname plus exact date of birth
    DateOfBirth,
    /// Candidate already references this exact legacy id
    LegacyIdRef,
}

/// Result of scoring one legacy patient against the candidate set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScoreOutcome {
    /// A single top candidate; safe to propose (not apply) automatically
    Proposed {
        /// The winning candidate
        candidate_id: i64,
        /// Its match strength
        rank: MatchRank,
    },
    /// Two or more equally strong candidates; requires a human decision
    Ambiguous {
        /// All tied candidates, id ascending
        candidate_ids: Vec<i64>,
        /// The tied strength
        rank: MatchRank,
    },
    /// No candidate matched above "no match"
    Unresolved,
}

/// Uppercase, non-alphanumerics stripped
fn normalize_postcode(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Outward code: the normalized postcode minus its three-character inward part
fn outward_postcode(raw: &str) -> Option<String> {
    let normalized = normalize_postcode(raw);
    (normalized.len() > 3).then(|| normalized[..normalized.len() - 3].to_string())
}

/// Last six digits of the phone number, when it has that many
fn phone_tail(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (digits.len() >= 6).then(|| digits[digits.len() - 6..].to_string())
}

fn rank_candidate(legacy: &LegacyPatient, candidate: &InternalCandidate) -> Option<MatchRank> {
    if !candidate.surname.eq_ignore_ascii_case(&legacy.surname) {
        return None;
    }
    if candidate.legacy_reference.as_deref() == Some(legacy.code.to_string().as_str()) {
        return Some(MatchRank::LegacyIdRef);
    }
    if let (Some(a), Some(b)) = (legacy.dob, candidate.dob) {
        if a == b {
            return Some(MatchRank::DateOfBirth);
        }
    }
    if let (Some(a), Some(b)) = (&legacy.postcode, &candidate.postcode) {
        let (a, b) = (normalize_postcode(a), normalize_postcode(b));
        if !a.is_empty() && a == b {
            return Some(MatchRank::Postcode);
        }
        if let (Some(a), Some(b)) = (
            legacy.postcode.as_deref().and_then(outward_postcode),
            candidate.postcode.as_deref().and_then(outward_postcode),
        ) {
            if a == b {
                return Some(MatchRank::OutwardPostcode);
            }
        }
    }
    if let (Some(a), Some(b)) = (
        legacy.phone.as_deref().and_then(phone_tail),
        candidate.phone.as_deref().and_then(phone_tail),
    ) {
        if a == b {
            return Some(MatchRank::PhoneTail);
        }
    }
    None
}

/// Score `legacy` against `candidates` and report the outcome.
///
/// Never writes a mapping; proposal and application are separate steps.
#[must_use]
pub fn score_candidates(
    legacy: &LegacyPatient,
    candidates: &[InternalCandidate],
) -> ScoreOutcome {
    let mut ranked: Vec<(MatchRank, i64)> = candidates
        .iter()
        .filter_map(|candidate| rank_candidate(legacy, candidate).map(|r| (r, candidate.id)))
        .collect();

    let Some(best) = ranked.iter().map(|(rank, _)| *rank).max() else {
        return ScoreOutcome::Unresolved;
    };
    ranked.retain(|(rank, _)| *rank == best);
    let mut ids: Vec<i64> = ranked.into_iter().map(|(_, id)| id).collect();
    ids.sort_unstable();
    ids.dedup();

    if ids.len() == 1 {
        ScoreOutcome::Proposed {
            candidate_id: ids[0],
            rank: best,
        }
    } else {
        ScoreOutcome::Ambiguous {
            candidate_ids: ids,
            rank: best,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn legacy() -> LegacyPatient {
        LegacyPatient {
            code: 1_000_035,
            surname: "Hargreaves".to_string(),
            first_name: Some("June".to_string()),
            dob: Some(NaiveDate::from_ymd_opt(1961, 4, 9).unwrap()),
            postcode: Some("LS8 2JP".to_string()),
            phone: Some("0113 274 9981".to_string()),
        }
    }

    fn candidate(id: i64) -> InternalCandidate {
        InternalCandidate {
            id,
            surname: "Hargreaves".to_string(),
            first_name: None,
            dob: None,
            postcode: None,
            phone: None,
            legacy_reference: None,
        }
    }

    #[test]
    fn legacy_reference_outranks_every_demographic_signal() {
        let mut by_dob = candidate(1);
        by_dob.dob = legacy().dob;
        by_dob.postcode = legacy().postcode.clone();
        let mut by_ref = candidate(2);
        by_ref.legacy_reference = Some("1000035".to_string());

        let outcome = score_candidates(&legacy(), &[by_dob, by_ref]);
        assert_eq!(
            outcome,
            ScoreOutcome::Proposed {
                candidate_id: 2,
                rank: MatchRank::LegacyIdRef
            }
        );
    }

    #[test]
    fn dob_beats_postcode_beats_outward_beats_phone() {
        let mut by_phone = candidate(1);
        by_phone.phone = Some("+44 113 274 9981".to_string());
        let mut by_outward = candidate(2);
        by_outward.postcode = Some("LS8 9XX".to_string());
        let mut by_postcode = candidate(3);
        by_postcode.postcode = Some("ls82jp".to_string());
        let mut by_dob = candidate(4);
        by_dob.dob = legacy().dob;

        let all = [by_phone, by_outward, by_postcode, by_dob];
        let outcome = score_candidates(&legacy(), &all);
        assert_eq!(
            outcome,
            ScoreOutcome::Proposed {
                candidate_id: 4,
                rank: MatchRank::DateOfBirth
            }
        );

        let outcome = score_candidates(&legacy(), &all[..3]);
        assert_eq!(
            outcome,
            ScoreOutcome::Proposed {
                candidate_id: 3,
                rank: MatchRank::Postcode
            }
        );

        let outcome = score_candidates(&legacy(), &all[..2]);
        assert_eq!(
            outcome,
            ScoreOutcome::Proposed {
                candidate_id: 2,
                rank: MatchRank::OutwardPostcode
            }
        );

        let outcome = score_candidates(&legacy(), &all[..1]);
        assert_eq!(
            outcome,
            ScoreOutcome::Proposed {
                candidate_id: 1,
                rank: MatchRank::PhoneTail
            }
        );
    }

    #[test]
    fn equal_outward_matches_are_ambiguous_not_picked() {
        let mut a = candidate(7);
        a.postcode = Some("LS8 4QQ".to_string());
        let mut b = candidate(3);
        b.postcode = Some("LS8 1AA".to_string());

        let outcome = score_candidates(&legacy(), &[a, b]);
        assert_eq!(
            outcome,
            ScoreOutcome::Ambiguous {
                candidate_ids: vec![3, 7],
                rank: MatchRank::OutwardPostcode
            }
        );
    }

    #[test]
    fn surname_alone_is_unresolved() {
        let outcome = score_candidates(&legacy(), &[candidate(1), candidate(2)]);
        assert_eq!(outcome, ScoreOutcome::Unresolved);
    }

    #[test]
    fn wrong_surname_is_never_a_candidate() {
        let mut other = candidate(1);
        other.surname = "Hartley".to_string();
        other.dob = legacy().dob;
        assert_eq!(score_candidates(&legacy(), &[other]), ScoreOutcome::Unresolved);
    }

    #[test]
    fn outcome_is_independent_of_candidate_order() {
        let mut a = candidate(5);
        a.dob = legacy().dob;
        let mut b = candidate(9);
        b.dob = legacy().dob;
        let c = candidate(12);

        let forwards = score_candidates(&legacy(), &[a.clone(), b.clone(), c.clone()]);
        let backwards = score_candidates(&legacy(), &[c, b, a]);
        assert_eq!(forwards, backwards);
        assert_eq!(
            forwards,
            ScoreOutcome::Ambiguous {
                candidate_ids: vec![5, 9],
                rank: MatchRank::DateOfBirth
            }
        );
    }
}
