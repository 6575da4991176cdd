//! Core contract model and amendment resolution engine for DECP ingestion.
//!
//! The engine runs in four pure stages per source table:
//! identifier normalization, duplicate-submission reduction, timeline
//! expansion and field carry-forward. A final stage concatenates the
//! per-source outputs and removes overlapping rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod concat;
pub mod error;
pub mod identifier;
pub mod resolve;
pub mod source;
pub mod submissions;
pub mod timeline;

pub use concat::{
    concat_and_dedup, contract_rows, explode_awardees, AwardeeRow, ConcatReport, MergedTable,
};
pub use error::{ResolveError, Result};
pub use identifier::{IdentityHeuristic, RootIdentifier, SuffixStripping};
pub use resolve::{CarryForwardResolver, ResolveConfig, ResolveReport, ResolvedRow, SequenceOrder};
pub use source::{resolve_source, Engine, ResolvedTable, SourceReport, SourceTable};
pub use submissions::{
    CollisionReport, NormalizedContract, SubmissionConfig, SubmissionReport, SubmissionResolver,
};
pub use timeline::{build_timeline, ContractTimeline, RowOrigin, TimelineEntry};

pub const CRATE_NAME: &str = "decp-core";

/// Tri-state slot for a field carried by a partial record.
///
/// `Absent` means the source did not mention the field at all, `Null` means
/// it was present but empty or unusable. Neither declares a value for
/// carry-forward purposes; they are kept apart for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Declared<T> {
    #[default]
    Absent,
    Null,
    Value(T),
}

impl<T> Declared<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Declared::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Declared::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Declared::Value(_))
    }

    /// Present-but-null when `None`.
    pub fn from_present(value: Option<T>) -> Self {
        match value {
            Some(value) => Declared::Value(value),
            None => Declared::Null,
        }
    }
}

/// An entity awarded (part of) a contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Awardee {
    pub id: Option<String>,
    pub id_type: Option<String>,
    pub name: Option<String>,
}

impl Awardee {
    pub fn new(id: impl Into<String>, id_type: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            id_type: Some(id_type.into()),
            name: None,
        }
    }
}

/// Descriptive fields fixed at notification time; never changed by amendments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContractDescriptor {
    pub buyer_name: Option<String>,
    pub nature: Option<String>,
    pub object: Option<String>,
    pub cpv_code: Option<String>,
    pub procedure: Option<String>,
    pub price_form: Option<String>,
    pub execution_place_code: Option<String>,
    pub execution_place_code_type: Option<String>,
    pub execution_place_name: Option<String>,
    pub framework_agreement_id: Option<String>,
    pub ccag: Option<String>,
    pub operator_grouping_type: Option<String>,
    pub offers_received: Option<i32>,
    pub innovative: Option<bool>,
    pub advance_granted: Option<bool>,
    pub subcontracting_declared: Option<bool>,
    pub advance_rate: Option<f64>,
    pub origin_eu: Option<f64>,
    pub origin_france: Option<f64>,
    pub source_open_data: Option<String>,
}

/// A partial update event on a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Amendment {
    pub sequence_number: Option<i64>,
    pub notification_date: Declared<NaiveDate>,
    pub publication_date: Declared<NaiveDate>,
    pub object: Option<String>,
    pub amount: Declared<f64>,
    pub duration_months: Declared<i32>,
    pub awardees: Declared<Vec<Awardee>>,
}

/// One procurement award as flattened from a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContractRecord {
    /// Identifier exactly as published, before any cleaning.
    pub raw_id: String,
    /// Empty when the source names no buyer.
    pub buyer_id: String,
    pub notification_date: Declared<NaiveDate>,
    pub publication_date: Declared<NaiveDate>,
    pub amount: Declared<f64>,
    pub duration_months: Declared<i32>,
    pub awardees: Declared<Vec<Awardee>>,
    /// `None` entries are null or malformed amendments kept for counting.
    pub amendments: Vec<Option<Amendment>>,
    pub descriptor: ContractDescriptor,
}

impl ContractRecord {
    /// Declared amendment-list length, null entries included.
    pub fn amendment_count(&self) -> usize {
        self.amendments.len()
    }
}
