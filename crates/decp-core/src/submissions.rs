//! Duplicate-submission reduction.
//!
//! Rows sharing `(buyer_id, root_id)` are re-submissions of one agreement at
//! different amendment counts. Exactly one survives per group.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{debug, warn};

use crate::identifier::{clean_identifier, uid, IdentityHeuristic, RootIdentifier};
use crate::ContractRecord;

/// A contract record with its identity resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedContract {
    pub uid: String,
    pub cleaned_id: String,
    pub root: RootIdentifier,
    pub input_position: usize,
    pub record: ContractRecord,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmissionConfig {
    /// Objects of two submissions in one group scoring below this are reported
    /// as a possible identifier collision.
    pub collision_similarity_threshold: f64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            collision_similarity_threshold: 0.80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollisionReport {
    pub uid: String,
    pub kept_id: String,
    pub dropped_id: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubmissionReport {
    pub input_rows: usize,
    pub cleaned_identifiers: usize,
    pub stripped_suffixes: usize,
    pub groups: usize,
    pub duplicates_removed: usize,
    /// Groups whose best candidates tied on rank but differ in content.
    pub ambiguous_ties: Vec<String>,
    pub suspected_collisions: Vec<CollisionReport>,
}

pub struct SubmissionResolver {
    config: SubmissionConfig,
    heuristic: Box<dyn IdentityHeuristic>,
}

impl SubmissionResolver {
    pub fn new(config: SubmissionConfig, heuristic: Box<dyn IdentityHeuristic>) -> Self {
        Self { config, heuristic }
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Clean each identifier and compute its root, row by row.
    pub fn normalize(
        &self,
        records: Vec<ContractRecord>,
        report: &mut SubmissionReport,
    ) -> Vec<NormalizedContract> {
        report.input_rows += records.len();
        records
            .into_iter()
            .enumerate()
            .map(|(input_position, record)| {
                let (cleaned_id, changed) = clean_identifier(&record.raw_id);
                if changed {
                    report.cleaned_identifiers += 1;
                }
                let root = self.heuristic.root_of(&cleaned_id, record.amendment_count());
                if root.suffix_stripped {
                    report.stripped_suffixes += 1;
                }
                NormalizedContract {
                    uid: uid(&record.buyer_id, &root.root_id),
                    cleaned_id,
                    root,
                    input_position,
                    record,
                }
            })
            .collect()
    }

    /// Keep one row per `(buyer_id, root_id)`, in order of first appearance.
    ///
    /// Ranking: longest amendment list, then a suffix that matched the
    /// amendment count, then earliest input position.
    pub fn reduce(
        &self,
        rows: Vec<NormalizedContract>,
        report: &mut SubmissionReport,
    ) -> Vec<NormalizedContract> {
        let mut order: Vec<Vec<NormalizedContract>> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for row in rows {
            let key = (row.record.buyer_id.clone(), row.root.root_id.clone());
            match index.get(&key) {
                Some(&slot) => order[slot].push(row),
                None => {
                    index.insert(key, order.len());
                    order.push(vec![row]);
                }
            }
        }

        report.groups += order.len();
        let mut kept = Vec::with_capacity(order.len());
        for group in order {
            if group.len() == 1 {
                kept.extend(group);
                continue;
            }
            let winner = self.reduce_group(group, report);
            kept.push(winner);
        }
        kept
    }

    fn reduce_group(
        &self,
        mut group: Vec<NormalizedContract>,
        report: &mut SubmissionReport,
    ) -> NormalizedContract {
        let rank = |row: &NormalizedContract| (row.record.amendment_count(), row.root.suffix_stripped);

        let mut best = 0usize;
        for (i, row) in group.iter().enumerate().skip(1) {
            // Strictly greater: equal ranks keep the earlier row.
            if rank(row) > rank(&group[best]) {
                best = i;
            }
        }

        let best_rank = rank(&group[best]);
        let tied_and_different = group.iter().enumerate().any(|(i, row)| {
            i != best && rank(row) == best_rank && row.record != group[best].record
        });
        if tied_and_different {
            warn!(uid = %group[best].uid, candidates = group.len(), "ambiguous duplicate submissions; keeping first");
            report.ambiguous_ties.push(group[best].uid.clone());
        }

        report.duplicates_removed += group.len() - 1;
        debug!(uid = %group[best].uid, dropped = group.len() - 1, "collapsed duplicate submissions");

        let winner = group.swap_remove(best);
        for dropped in &group {
            if let Some(collision) = self.detect_collision(&winner, dropped) {
                warn!(
                    uid = %collision.uid,
                    kept = %collision.kept_id,
                    dropped = %collision.dropped_id,
                    similarity = collision.similarity,
                    "submissions share a root identifier but describe different objects"
                );
                report.suspected_collisions.push(collision);
            }
        }
        winner
    }

    fn detect_collision(
        &self,
        kept: &NormalizedContract,
        dropped: &NormalizedContract,
    ) -> Option<CollisionReport> {
        let a = kept.record.descriptor.object.as_deref()?;
        let b = dropped.record.descriptor.object.as_deref()?;
        let similarity = jaro_winkler(
            &Self::normalize_key_fragment(a),
            &Self::normalize_key_fragment(b),
        );
        (similarity < self.config.collision_similarity_threshold).then(|| CollisionReport {
            uid: kept.uid.clone(),
            kept_id: kept.cleaned_id.clone(),
            dropped_id: dropped.cleaned_id.clone(),
            similarity,
        })
    }
}

impl Default for SubmissionResolver {
    fn default() -> Self {
        Self::new(
            SubmissionConfig::default(),
            Box::new(crate::identifier::SuffixStripping),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Amendment, ContractDescriptor, Declared};

    fn mk_record(buyer: &str, id: &str, amendments: usize, object: &str, amount: f64) -> ContractRecord {
        ContractRecord {
            raw_id: id.to_string(),
            buyer_id: buyer.to_string(),
            amount: Declared::Value(amount),
            amendments: (0..amendments)
                .map(|i| {
                    Some(Amendment {
                        sequence_number: Some(i as i64 + 1),
                        ..Default::default()
                    })
                })
                .collect(),
            descriptor: ContractDescriptor {
                object: Some(object.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn run(records: Vec<ContractRecord>) -> (Vec<NormalizedContract>, SubmissionReport) {
        let resolver = SubmissionResolver::default();
        let mut report = SubmissionReport::default();
        let rows = resolver.normalize(records, &mut report);
        let rows = resolver.reduce(rows, &mut report);
        (rows, report)
    }

    #[test]
    fn longest_amendment_list_wins() {
        let (rows, report) = run(vec![
            mk_record("B1", "C102", 2, "Travaux voirie", 100.0),
            mk_record("B1", "C103", 3, "Travaux voirie", 100.0),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.amendment_count(), 3);
        assert_eq!(rows[0].uid, "B1C1");
        assert_eq!(report.duplicates_removed, 1);
        assert!(report.suspected_collisions.is_empty());
    }

    #[test]
    fn suffixed_resubmission_supersedes_first_notification() {
        let (rows, report) = run(vec![
            mk_record("21850109600018", "2022AO1200", 0, "Nettoyage locaux", 10.0),
            mk_record("21850109600018", "2022AO1202", 2, "Nettoyage locaux", 12.0),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cleaned_id, "2022AO1202");
        assert_eq!(rows[0].root.root_id, "2022AO12");
        assert_eq!(report.stripped_suffixes, 2);
        assert_eq!(report.groups, 1);
    }

    #[test]
    fn different_buyers_never_merge() {
        let (rows, report) = run(vec![
            mk_record("B1", "C100", 0, "x", 1.0),
            mk_record("B2", "C100", 0, "x", 1.0),
        ]);
        assert_eq!(rows.len(), 2);
        assert_eq!(report.duplicates_removed, 0);
    }

    #[test]
    fn equal_rank_keeps_first_and_reports_differing_content() {
        let (rows, report) = run(vec![
            mk_record("B1", "C1", 1, "Fournitures", 1.0),
            mk_record("B1", "C1", 1, "Fournitures", 2.0),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input_position, 0);
        assert_eq!(report.ambiguous_ties, vec!["B1C1".to_string()]);
    }

    #[test]
    fn identical_duplicates_are_not_ambiguous() {
        let (rows, report) = run(vec![
            mk_record("B1", "C1", 1, "Fournitures", 1.0),
            mk_record("B1", "C1", 1, "Fournitures", 1.0),
        ]);
        assert_eq!(rows.len(), 1);
        assert!(report.ambiguous_ties.is_empty());
    }

    #[test]
    fn dissimilar_objects_are_reported_as_collisions() {
        let (rows, report) = run(vec![
            mk_record("B1", "2023-0100", 0, "Maintenance ascenseurs", 1.0),
            mk_record("B1", "2023-0101", 1, "Fourniture de repas scolaires", 1.0),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(report.suspected_collisions.len(), 1);
        assert_eq!(report.suspected_collisions[0].dropped_id, "2023-0100");
    }

    #[test]
    fn output_preserves_first_appearance_order() {
        let (rows, _) = run(vec![
            mk_record("B1", "A", 0, "a", 1.0),
            mk_record("B1", "B", 0, "b", 1.0),
            mk_record("B1", "A", 0, "a", 1.0),
        ]);
        let ids: Vec<_> = rows.iter().map(|r| r.cleaned_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }
}
