//! Field carry-forward over a contract's ordered timeline.
//!
//! Each contract is resolved independently: its rows are put in
//! chronological order, then a single forward scan keeps the last declared
//! value of every mutable field and stamps it onto each row. The scan state
//! lives only for the duration of one contract.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::timeline::{ContractTimeline, TimelineEntry};
use crate::{Awardee, ContractDescriptor, Declared};

/// Direction of the declared amendment number when two amendments share a date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveConfig {
    pub same_day_order: SequenceOrder,
}

/// A contract's state at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRow {
    pub uid: String,
    pub buyer_id: String,
    pub id: String,
    pub root_id: String,
    /// Position in chronological order, 0 for the earliest row.
    pub sequence_index: u32,
    pub is_current: bool,
    pub amendment_id: Option<i64>,
    pub amendment_object: Option<String>,
    pub notification_date: Option<NaiveDate>,
    pub publication_date: Option<NaiveDate>,
    pub amount: Option<f64>,
    pub duration_months: Option<i32>,
    /// `None` when no row up to this one declared awardees.
    pub awardees: Option<Vec<Awardee>>,
    pub ordering_ambiguous: bool,
    pub descriptor: ContractDescriptor,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResolveReport {
    pub contracts: usize,
    pub rows: usize,
    pub skipped_amendments: usize,
    pub undated_rows: usize,
    pub ordering_ambiguous: Vec<String>,
    pub amendments_before_notification: usize,
    /// Contracts where no row ever declared amount, duration or awardees.
    pub valueless_contracts: usize,
}

#[derive(Debug, Default)]
struct Carry {
    amount: Option<f64>,
    duration_months: Option<i32>,
    awardees: Option<Vec<Awardee>>,
}

impl Carry {
    fn absorb(&mut self, entry: &TimelineEntry) {
        if let Declared::Value(amount) = &entry.amount {
            self.amount = Some(*amount);
        }
        if let Declared::Value(duration) = &entry.duration_months {
            self.duration_months = Some(*duration);
        }
        if let Declared::Value(awardees) = &entry.awardees {
            self.awardees = Some(awardees.clone());
        }
    }

    fn is_empty(&self) -> bool {
        self.amount.is_none() && self.duration_months.is_none() && self.awardees.is_none()
    }
}

#[derive(Debug, Default)]
pub struct CarryForwardResolver {
    config: ResolveConfig,
}

impl CarryForwardResolver {
    pub fn new(config: ResolveConfig) -> Self {
        Self { config }
    }

    pub fn resolve(&self, timeline: ContractTimeline, report: &mut ResolveReport) -> Vec<ResolvedRow> {
        let ContractTimeline {
            uid,
            buyer_id,
            cleaned_id,
            root_id,
            descriptor,
            entries,
            skipped_amendments,
        } = timeline;

        report.contracts += 1;
        report.skipped_amendments += skipped_amendments;
        report.undated_rows += entries
            .iter()
            .filter(|e| !e.notification_date.is_value())
            .count();
        report.amendments_before_notification += count_predating_amendments(&entries);

        let (order, ambiguous) = self.order(&entries);
        if ambiguous {
            warn!(%uid, rows = entries.len(), "amendment without usable date; ordering by input position");
            report.ordering_ambiguous.push(uid.clone());
        }

        let last = order.len().saturating_sub(1);
        let mut carry = Carry::default();
        let mut rows = Vec::with_capacity(order.len());
        for (sequence_index, &i) in order.iter().enumerate() {
            let entry = &entries[i];
            carry.absorb(entry);
            rows.push(ResolvedRow {
                uid: uid.clone(),
                buyer_id: buyer_id.clone(),
                id: cleaned_id.clone(),
                root_id: root_id.clone(),
                sequence_index: sequence_index as u32,
                is_current: sequence_index == last,
                amendment_id: entry.origin.sequence_number(),
                amendment_object: entry.object.clone(),
                notification_date: entry.notification_date.value().copied(),
                publication_date: entry.publication_date.value().copied(),
                amount: carry.amount,
                duration_months: carry.duration_months,
                awardees: carry.awardees.clone(),
                ordering_ambiguous: ambiguous,
                descriptor: descriptor.clone(),
            });
        }

        if carry.is_empty() {
            report.valueless_contracts += 1;
        }
        report.rows += rows.len();
        rows
    }

    /// Indices of `entries` in resolution order, and whether the order had to
    /// fall back on input position for an undated amendment.
    ///
    /// Every row is ordered by notification date; an undated notification
    /// stays first and undated amendments go last. On equal dates the
    /// notification precedes amendments, which follow their declared
    /// sequence number (missing last) and then input position.
    fn order(&self, entries: &[TimelineEntry]) -> (Vec<usize>, bool) {
        let ambiguous = entries
            .iter()
            .skip(1)
            .any(|e| !e.notification_date.is_value());

        let mut order: Vec<usize> = (0..entries.len()).collect();
        // Stable: equal keys keep input order.
        order.sort_by(|&a, &b| self.compare(&entries[a], &entries[b]));
        (order, ambiguous)
    }

    fn compare(&self, a: &TimelineEntry, b: &TimelineEntry) -> Ordering {
        date_bucket(a)
            .cmp(&date_bucket(b))
            .then_with(|| a.notification_date.value().cmp(&b.notification_date.value()))
            .then_with(|| a.origin.is_amendment().cmp(&b.origin.is_amendment()))
            .then_with(|| match date_bucket(a) {
                1 => self.compare_sequence(a, b),
                _ => Ordering::Equal,
            })
    }

    fn compare_sequence(&self, a: &TimelineEntry, b: &TimelineEntry) -> Ordering {
        match (a.origin.sequence_number(), b.origin.sequence_number()) {
            (Some(x), Some(y)) => match self.config.same_day_order {
                SequenceOrder::Ascending => x.cmp(&y),
                SequenceOrder::Descending => y.cmp(&x),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// 0 for an undated notification, 1 for dated rows, 2 for undated amendments.
fn date_bucket(entry: &TimelineEntry) -> u8 {
    match (entry.notification_date.is_value(), entry.origin.is_amendment()) {
        (false, false) => 0,
        (true, _) => 1,
        (false, true) => 2,
    }
}

fn count_predating_amendments(entries: &[TimelineEntry]) -> usize {
    let Some(notified) = entries.first().and_then(|e| e.notification_date.value()) else {
        return 0;
    };
    entries
        .iter()
        .skip(1)
        .filter(|e| e.notification_date.value().is_some_and(|d| d < notified))
        .count()
}
