//! Awardee expansion and cross-source concatenation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::resolve::ResolvedRow;
use crate::source::ResolvedTable;
use crate::Awardee;

/// One contract state paired with one of its awardees.
#[derive(Debug, Clone, PartialEq)]
pub struct AwardeeRow {
    pub contract: Arc<ResolvedRow>,
    /// `None` for contract states without any awardee.
    pub awardee: Option<Awardee>,
}

type DedupKey = (String, Option<String>, Option<String>, u32);

impl AwardeeRow {
    pub fn awardee_id(&self) -> Option<&str> {
        self.awardee.as_ref().and_then(|a| a.id.as_deref())
    }

    pub fn awardee_id_type(&self) -> Option<&str> {
        self.awardee.as_ref().and_then(|a| a.id_type.as_deref())
    }

    fn dedup_key(&self) -> DedupKey {
        (
            self.contract.uid.clone(),
            self.awardee_id().map(str::to_string),
            self.awardee_id_type().map(str::to_string),
            self.contract.sequence_index,
        )
    }
}

pub fn explode_awardees(rows: Vec<ResolvedRow>) -> Vec<AwardeeRow> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let awardees = row.awardees.clone().unwrap_or_default();
        let contract = Arc::new(row);
        if awardees.is_empty() {
            out.push(AwardeeRow {
                contract,
                awardee: None,
            });
            continue;
        }
        for awardee in awardees {
            out.push(AwardeeRow {
                contract: Arc::clone(&contract),
                awardee: Some(awardee),
            });
        }
    }
    out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConcatReport {
    pub sources: usize,
    pub input_rows: usize,
    pub output_rows: usize,
    pub duplicates_removed: usize,
    /// Contract states whose current flag changed once sources were merged.
    #[serde(default)]
    pub current_flags_corrected: usize,
    pub columns: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergedTable {
    pub sources: Vec<String>,
    /// Union of the source columns; a column missing from one source is null there.
    pub columns: BTreeSet<String>,
    pub rows: Vec<AwardeeRow>,
}

/// Concatenate per-source tables and drop repeated
/// `(uid, awardee id, awardee id type, sequence index)` rows, keeping the first.
pub fn concat_and_dedup(tables: Vec<ResolvedTable>) -> (MergedTable, ConcatReport) {
    let mut merged = MergedTable::default();
    let mut seen: HashSet<DedupKey> = HashSet::new();
    let mut report = ConcatReport {
        sources: tables.len(),
        ..Default::default()
    };

    for table in tables {
        merged.sources.push(table.source);
        merged.columns.extend(table.columns);
        report.input_rows += table.rows.len();
        for row in table.rows {
            if seen.insert(row.dedup_key()) {
                merged.rows.push(row);
            }
        }
    }

    report.output_rows = merged.rows.len();
    report.duplicates_removed = report.input_rows - report.output_rows;
    report.current_flags_corrected = reassign_current(&mut merged.rows);
    report.columns = merged.columns.len();
    info!(
        duplicates_removed = report.duplicates_removed,
        current_flags_corrected = report.current_flags_corrected,
        rows = report.output_rows,
        "removed duplicate rows by uid + awardee + sequence index"
    );
    (merged, report)
}

/// Flag only the highest `sequence_index` of each uid as current.
///
/// Sources holding the same contract at different amendment counts each mark
/// their own last row current; after merging only the latest one may stay so.
fn reassign_current(rows: &mut [AwardeeRow]) -> usize {
    let mut latest: HashMap<String, u32> = HashMap::new();
    for row in rows.iter() {
        let seq = latest.entry(row.contract.uid.clone()).or_insert(0);
        *seq = (*seq).max(row.contract.sequence_index);
    }

    let mut replaced: HashMap<(String, u32), Arc<ResolvedRow>> = HashMap::new();
    for row in rows.iter_mut() {
        let current = latest.get(&row.contract.uid) == Some(&row.contract.sequence_index);
        if row.contract.is_current == current {
            continue;
        }
        let key = (row.contract.uid.clone(), row.contract.sequence_index);
        let fixed = replaced.entry(key).or_insert_with(|| {
            let mut contract = (*row.contract).clone();
            contract.is_current = current;
            Arc::new(contract)
        });
        row.contract = Arc::clone(fixed);
    }
    replaced.len()
}

/// Contract-level view: one row per `(uid, sequence_index)`, first occurrence wins.
pub fn contract_rows(rows: &[AwardeeRow]) -> Vec<Arc<ResolvedRow>> {
    let mut seen: HashSet<(&str, u32)> = HashSet::new();
    rows.iter()
        .filter(|row| seen.insert((row.contract.uid.as_str(), row.contract.sequence_index)))
        .map(|row| Arc::clone(&row.contract))
        .collect()
}
