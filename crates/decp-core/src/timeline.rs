//! Expansion of a contract into its notification row plus one row per amendment.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::submissions::NormalizedContract;
use crate::{Awardee, ContractDescriptor, Declared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOrigin {
    Notification,
    Amendment {
        sequence_number: Option<i64>,
        /// Position in the source amendment list, nulls included.
        position: usize,
    },
}

impl RowOrigin {
    pub fn is_amendment(&self) -> bool {
        matches!(self, RowOrigin::Amendment { .. })
    }

    pub fn sequence_number(&self) -> Option<i64> {
        match self {
            RowOrigin::Notification => None,
            RowOrigin::Amendment { sequence_number, .. } => *sequence_number,
        }
    }
}

/// One point in a contract's history, carrying only what that event declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub origin: RowOrigin,
    pub notification_date: Declared<NaiveDate>,
    pub publication_date: Declared<NaiveDate>,
    pub object: Option<String>,
    pub amount: Declared<f64>,
    pub duration_months: Declared<i32>,
    pub awardees: Declared<Vec<Awardee>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractTimeline {
    pub uid: String,
    pub buyer_id: String,
    pub cleaned_id: String,
    pub root_id: String,
    pub descriptor: ContractDescriptor,
    /// Notification first, then amendments in source order.
    pub entries: Vec<TimelineEntry>,
    pub skipped_amendments: usize,
}

pub fn build_timeline(contract: NormalizedContract) -> ContractTimeline {
    let NormalizedContract {
        uid,
        cleaned_id,
        root,
        record,
        ..
    } = contract;

    let mut entries = Vec::with_capacity(record.amendments.len() + 1);
    entries.push(TimelineEntry {
        origin: RowOrigin::Notification,
        notification_date: record.notification_date,
        publication_date: record.publication_date,
        object: None,
        amount: record.amount,
        duration_months: record.duration_months,
        awardees: record.awardees,
    });

    let mut skipped_amendments = 0usize;
    for (position, amendment) in record.amendments.into_iter().enumerate() {
        let Some(amendment) = amendment else {
            skipped_amendments += 1;
            continue;
        };
        entries.push(TimelineEntry {
            origin: RowOrigin::Amendment {
                sequence_number: amendment.sequence_number,
                position,
            },
            notification_date: amendment.notification_date,
            publication_date: amendment.publication_date,
            object: amendment.object,
            amount: amendment.amount,
            duration_months: amendment.duration_months,
            awardees: amendment.awardees,
        });
    }

    if skipped_amendments > 0 {
        debug!(%uid, skipped_amendments, "skipped null amendment entries");
    }

    ContractTimeline {
        uid,
        buyer_id: record.buyer_id,
        cleaned_id,
        root_id: root.root_id,
        descriptor: record.descriptor,
        entries,
        skipped_amendments,
    }
}
