//! Publication tables derived from the merged awardee-level rows.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use decp_core::{contract_rows, AwardeeRow, MergedTable, ResolvedRow};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompanyKey {
    pub id: String,
    pub id_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractAwardeeLink {
    pub uid: String,
    pub sequence_index: u32,
    pub awardee_id: String,
    pub awardee_id_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OutputTables {
    /// One row per contract state and awardee.
    pub awardees: Vec<AwardeeRow>,
    /// One row per `(uid, sequence_index)`, latest publication first.
    pub contracts: Vec<Arc<ResolvedRow>>,
    pub buyers: Vec<String>,
    pub companies: Vec<CompanyKey>,
    pub links: Vec<ContractAwardeeLink>,
    pub columns: BTreeSet<String>,
}

impl OutputTables {
    pub fn build(merged: MergedTable) -> Self {
        let mut contracts = contract_rows(&merged.rows);
        contracts.sort_by(|a, b| publication_desc(a, b));

        let buyers: BTreeSet<String> = contracts
            .iter()
            .map(|c| c.buyer_id.clone())
            .filter(|id| !id.is_empty())
            .collect();

        let mut companies = BTreeSet::new();
        let mut links = Vec::new();
        for row in &merged.rows {
            let Some(awardee_id) = row.awardee_id().filter(|id| !id.is_empty()) else {
                continue;
            };
            companies.insert(CompanyKey {
                id: awardee_id.to_string(),
                id_type: row.awardee_id_type().map(str::to_string),
            });
            links.push(ContractAwardeeLink {
                uid: row.contract.uid.clone(),
                sequence_index: row.contract.sequence_index,
                awardee_id: awardee_id.to_string(),
                awardee_id_type: row.awardee_id_type().map(str::to_string),
            });
        }

        Self {
            awardees: merged.rows,
            contracts,
            buyers: buyers.into_iter().collect(),
            companies: companies.into_iter().collect(),
            links,
            columns: merged.columns,
        }
    }
}

/// Latest publication first; undated rows last, then by uid and sequence.
fn publication_desc(a: &ResolvedRow, b: &ResolvedRow) -> Ordering {
    match (a.publication_date, b.publication_date) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.uid.cmp(&b.uid))
    .then_with(|| a.sequence_index.cmp(&b.sequence_index))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;
    use decp_core::{explode_awardees, Awardee, ContractDescriptor};

    pub(crate) fn mk_row(
        uid: &str,
        buyer: &str,
        seq: u32,
        published: Option<(i32, u32, u32)>,
        awardees: Option<Vec<Awardee>>,
    ) -> ResolvedRow {
        let date = published.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d));
        ResolvedRow {
            uid: uid.to_string(),
            buyer_id: buyer.to_string(),
            id: uid.to_string(),
            root_id: uid.to_string(),
            sequence_index: seq,
            is_current: true,
            amendment_id: None,
            amendment_object: None,
            notification_date: date,
            publication_date: date,
            amount: Some(100.0),
            duration_months: Some(12),
            awardees,
            ordering_ambiguous: false,
            descriptor: ContractDescriptor::default(),
        }
    }

    pub(crate) fn merged(rows: Vec<ResolvedRow>) -> MergedTable {
        MergedTable {
            sources: vec!["test".into()],
            columns: ["id", "modifications"].iter().map(|c| c.to_string()).collect(),
            rows: explode_awardees(rows),
        }
    }

    #[test]
    fn contracts_are_unique_and_sorted_by_publication_desc() {
        let tables = OutputTables::build(merged(vec![
            mk_row(
                "U1",
                "B1",
                0,
                Some((2023, 1, 1)),
                Some(vec![Awardee::new("1", "SIRET"), Awardee::new("2", "SIRET")]),
            ),
            mk_row("U2", "B2", 0, Some((2024, 1, 1)), None),
            mk_row("U3", "", 0, None, None),
        ]));
        assert_eq!(tables.awardees.len(), 4);
        let uids: Vec<_> = tables.contracts.iter().map(|c| c.uid.as_str()).collect();
        assert_eq!(uids, vec!["U2", "U1", "U3"]);
        assert_eq!(tables.buyers, vec!["B1".to_string(), "B2".to_string()]);
    }

    #[test]
    fn companies_are_keyed_by_id_and_type() {
        let tables = OutputTables::build(merged(vec![
            mk_row(
                "U1",
                "B1",
                0,
                None,
                Some(vec![Awardee::new("1", "SIRET"), Awardee::new("1", "TVA")]),
            ),
            mk_row("U1", "B1", 1, None, Some(vec![Awardee::new("1", "SIRET")])),
        ]));
        assert_eq!(tables.companies.len(), 2);
        assert_eq!(tables.links.len(), 3);
    }
}
