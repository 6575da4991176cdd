//! Per-source resolution: identity, duplicate reduction, timelines, carry-forward.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::concat::{explode_awardees, AwardeeRow};
use crate::error::{ResolveError, Result};
use crate::resolve::{CarryForwardResolver, ResolveConfig, ResolveReport};
use crate::submissions::{SubmissionReport, SubmissionResolver};
use crate::timeline::build_timeline;
use crate::ContractRecord;

/// Columns without which a source cannot be resolved at all.
pub const REQUIRED_COLUMNS: [&str; 2] = ["id", "modifications"];

/// Flattened contract table for one raw extract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTable {
    pub source: String,
    /// Top-level keys observed on at least one record.
    pub columns: BTreeSet<String>,
    pub records: Vec<ContractRecord>,
}

impl SourceTable {
    /// An empty extract has nothing to check.
    pub fn check_required_columns(&self) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        for column in REQUIRED_COLUMNS {
            if !self.columns.contains(column) {
                return Err(ResolveError::MissingColumn {
                    source_name: self.source.clone(),
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedTable {
    pub source: String,
    pub columns: BTreeSet<String>,
    pub rows: Vec<AwardeeRow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceReport {
    pub source: String,
    pub submissions: SubmissionReport,
    pub resolution: ResolveReport,
    pub awardee_rows: usize,
}

impl SourceReport {
    pub fn warning_count(&self) -> usize {
        self.submissions.ambiguous_ties.len()
            + self.submissions.suspected_collisions.len()
            + self.resolution.ordering_ambiguous.len()
            + self.resolution.skipped_amendments
            + self.resolution.amendments_before_notification
    }
}

#[derive(Default)]
pub struct Engine {
    submissions: SubmissionResolver,
    carry_forward: CarryForwardResolver,
}

impl Engine {
    pub fn new(submissions: SubmissionResolver, config: ResolveConfig) -> Self {
        Self {
            submissions,
            carry_forward: CarryForwardResolver::new(config),
        }
    }

    pub fn resolve_source(&self, table: SourceTable) -> Result<(ResolvedTable, SourceReport)> {
        table.check_required_columns()?;

        let span = info_span!("resolve_source", source = %table.source);
        let _guard = span.enter();

        let SourceTable {
            source,
            columns,
            records,
        } = table;
        let mut report = SourceReport {
            source: source.clone(),
            ..Default::default()
        };

        let normalized = self.submissions.normalize(records, &mut report.submissions);
        let contracts = self.submissions.reduce(normalized, &mut report.submissions);

        let mut resolved = Vec::new();
        for contract in contracts {
            let timeline = build_timeline(contract);
            resolved.extend(self.carry_forward.resolve(timeline, &mut report.resolution));
        }

        let rows = explode_awardees(resolved);
        report.awardee_rows = rows.len();

        if report.warning_count() > 0 {
            warn!(
                ambiguous_ties = report.submissions.ambiguous_ties.len(),
                suspected_collisions = report.submissions.suspected_collisions.len(),
                ordering_ambiguous = report.resolution.ordering_ambiguous.len(),
                skipped_amendments = report.resolution.skipped_amendments,
                "source resolved with warnings"
            );
        }
        info!(
            contracts = report.resolution.contracts,
            duplicates_removed = report.submissions.duplicates_removed,
            rows = report.resolution.rows,
            awardee_rows = report.awardee_rows,
            "source resolved"
        );

        Ok((
            ResolvedTable {
                source,
                columns,
                rows,
            },
            report,
        ))
    }
}

/// Resolve one source with the default heuristics.
pub fn resolve_source(table: SourceTable) -> Result<(ResolvedTable, SourceReport)> {
    Engine::default().resolve_source(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Amendment, Declared};

    fn columns() -> BTreeSet<String> {
        ["id", "acheteur", "modifications"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn missing_amendments_column_is_fatal() {
        let table = SourceTable {
            source: "decp-2022".into(),
            columns: ["id".to_string()].into_iter().collect(),
            records: vec![ContractRecord::default()],
        };
        let err = resolve_source(table).unwrap_err();
        assert!(matches!(err, ResolveError::MissingColumn { ref column, .. } if column == "modifications"));
    }

    #[test]
    fn empty_source_resolves_to_nothing() {
        let (table, report) = resolve_source(SourceTable::default()).unwrap();
        assert!(table.rows.is_empty());
        assert_eq!(report.resolution.contracts, 0);
    }

    #[test]
    fn duplicate_submissions_collapse_before_expansion() {
        let first = ContractRecord {
            raw_id: "AO1200".into(),
            buyer_id: "B".into(),
            amount: Declared::Value(10.0),
            ..Default::default()
        };
        let second = ContractRecord {
            raw_id: "AO1202".into(),
            buyer_id: "B".into(),
            amount: Declared::Value(10.0),
            amendments: vec![
                Some(Amendment {
                    sequence_number: Some(1),
                    amount: Declared::Value(11.0),
                    ..Default::default()
                }),
                Some(Amendment {
                    sequence_number: Some(2),
                    amount: Declared::Value(12.0),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        };
        let table = SourceTable {
            source: "decp".into(),
            columns: columns(),
            records: vec![first, second],
        };
        let (table, report) = resolve_source(table).unwrap();
        assert_eq!(report.submissions.duplicates_removed, 1);
        assert_eq!(table.rows.len(), 3);
        assert!(table.rows.iter().all(|r| r.contract.uid == "BAO12"));
        let current: Vec<_> = table.rows.iter().filter(|r| r.contract.is_current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].contract.amount, Some(12.0));
    }
}
