//! Run statistics over the published tables.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::tables::OutputTables;

pub const FIRST_STATS_YEAR: i32 = 2018;

pub fn implausible_before() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct YearStats {
    pub published: usize,
    pub notified: usize,
    pub notified_amount_sum: Option<f64>,
    pub notified_amount_median: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStatistics {
    pub rows: usize,
    pub columns: usize,
    pub contracts: usize,
    pub buyers: usize,
    pub awardees: usize,
    pub implausible_dates: usize,
    pub years: BTreeMap<i32, YearStats>,
}

/// Per-contract view: dates of the earliest row and the current amount.
struct ContractFacts {
    notified: Option<NaiveDate>,
    published: Option<NaiveDate>,
    amount: Option<f64>,
}

pub fn compute(tables: &OutputTables, run_date: NaiveDate) -> RunStatistics {
    let mut facts: HashMap<&str, ContractFacts> = HashMap::new();
    let mut implausible_dates = 0usize;
    for row in &tables.contracts {
        implausible_dates += [row.notification_date, row.publication_date]
            .into_iter()
            .flatten()
            .filter(|d| *d < implausible_before())
            .count();

        let entry = facts.entry(row.uid.as_str()).or_insert(ContractFacts {
            notified: None,
            published: None,
            amount: None,
        });
        if row.sequence_index == 0 {
            entry.notified = row.notification_date;
            entry.published = row.publication_date;
        }
        if row.is_current {
            entry.amount = row.amount;
        }
    }

    let mut years = BTreeMap::new();
    for year in FIRST_STATS_YEAR..=run_date.year() {
        let published = facts
            .values()
            .filter(|f| f.published.is_some_and(|d| d.year() == year))
            .count();
        let notified: Vec<&ContractFacts> = facts
            .values()
            .filter(|f| f.notified.is_some_and(|d| d.year() == year))
            .collect();
        let amounts: Vec<f64> = notified.iter().filter_map(|f| f.amount).collect();
        years.insert(
            year,
            YearStats {
                published,
                notified: notified.len(),
                notified_amount_sum: (!amounts.is_empty()).then(|| amounts.iter().sum()),
                notified_amount_median: median(amounts),
            },
        );
    }

    let awardees: HashSet<(&str, Option<&str>)> = tables
        .awardees
        .iter()
        .filter_map(|row| {
            row.awardee_id()
                .filter(|id| !id.is_empty())
                .map(|id| (id, row.awardee_id_type()))
        })
        .collect();

    RunStatistics {
        rows: tables.awardees.len(),
        columns: tables.columns.len(),
        contracts: facts.len(),
        buyers: tables.buyers.len(),
        awardees: awardees.len(),
        implausible_dates,
        years,
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::tests::{merged, mk_row};
    use decp_core::Awardee;

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(vec![4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }

    #[test]
    fn yearly_stats_use_original_dates_and_current_amounts() {
        let mut original = mk_row("U1", "B1", 0, Some((2022, 3, 1)), Some(vec![Awardee::new("1", "SIRET")]));
        original.is_current = false;
        let mut amended = mk_row("U1", "B1", 1, Some((2023, 5, 1)), Some(vec![Awardee::new("1", "SIRET")]));
        amended.amount = Some(300.0);
        let other = mk_row("U2", "B2", 0, Some((2022, 7, 1)), None);
        let ancient = mk_row("U3", "B2", 0, Some((2010, 1, 1)), None);

        let tables = OutputTables::build(merged(vec![original, amended, other, ancient]));
        let stats = compute(&tables, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        assert_eq!(stats.contracts, 3);
        assert_eq!(stats.buyers, 2);
        assert_eq!(stats.awardees, 1);
        assert_eq!(stats.implausible_dates, 2);
        assert_eq!(stats.years.len(), 7);
        let y2022 = &stats.years[&2022];
        assert_eq!(y2022.notified, 2);
        assert_eq!(y2022.published, 2);
        assert_eq!(y2022.notified_amount_sum, Some(400.0));
        assert_eq!(y2022.notified_amount_median, Some(200.0));
        assert_eq!(stats.years[&2023].notified, 0);
        assert_eq!(stats.years[&2023].notified_amount_sum, None);
    }
}
