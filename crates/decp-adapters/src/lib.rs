//! Source adapters: raw DECP JSON documents into flattened contract tables.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use decp_core::SourceTable;

pub mod clean;
mod parse;

pub use clean::CleaningReport;

use parse::RecordParser;

pub const CRATE_NAME: &str = "decp-adapters";

const CONCESSION_TYPE: &str = "Contrat de concession";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceSchema {
    #[serde(rename = "decp-2019")]
    Decp2019,
    #[serde(rename = "decp-2022")]
    Decp2022,
}

impl SourceSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSchema::Decp2019 => "decp-2019",
            SourceSchema::Decp2022 => "decp-2022",
        }
    }
}

impl fmt::Display for SourceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_name}: unexpected document root, expected {expected}")]
    UnexpectedRoot {
        source_name: String,
        expected: &'static str,
    },
    #[error("{source_name}: invalid json: {error}")]
    Json {
        source_name: String,
        #[source]
        error: serde_json::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Per-run inputs every adapter needs besides the document itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    /// Registry name of the source, without extension.
    pub file_name: String,
    /// Dates after this day are treated as invalid.
    pub run_date: NaiveDate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdapterReport {
    pub records: usize,
    pub non_object_records: usize,
    pub skipped_concessions: usize,
    pub cleaning: CleaningReport,
}

#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub table: SourceTable,
    pub report: AdapterReport,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn schema(&self) -> SourceSchema;

    /// Locate the list of contract records in a document.
    fn records<'a>(
        &self,
        ctx: &AdapterContext,
        document: &'a JsonValue,
    ) -> Result<&'a [JsonValue], AdapterError>;

    /// Whether a record is out of scope for this pipeline.
    fn skip_record(&self, _record: &JsonValue) -> bool {
        false
    }

    fn parse_document(
        &self,
        ctx: &AdapterContext,
        document: &JsonValue,
    ) -> Result<ParsedSource, AdapterError> {
        let raw_records = self.records(ctx, document)?;
        let parser = RecordParser {
            file_name: &ctx.file_name,
            run_date: ctx.run_date,
        };
        let mut report = AdapterReport::default();
        let mut columns = BTreeSet::new();
        let mut records = Vec::with_capacity(raw_records.len());

        for raw in raw_records {
            let mut raw = raw.clone();
            clean::null_nc_values(&mut raw, &mut report.cleaning);
            if self.skip_record(&raw) {
                report.skipped_concessions += 1;
                continue;
            }
            match parser.parse_record(&raw, &mut columns, &mut report.cleaning) {
                Some(record) => records.push(record),
                None => report.non_object_records += 1,
            }
        }
        report.records = records.len();

        if report.cleaning.invalid_amendment_awardees > 0 {
            warn!(
                source = %ctx.file_name,
                cleaned = report.cleaning.invalid_amendment_awardees,
                "amendment awardee lists without valid entries"
            );
        }
        info!(
            source = %ctx.file_name,
            schema = %self.schema(),
            records = report.records,
            skipped_concessions = report.skipped_concessions,
            nc_values_nulled = report.cleaning.nc_values_nulled,
            invalid_dates = report.cleaning.invalid_dates + report.cleaning.implausible_dates,
            "parsed source document"
        );

        Ok(ParsedSource {
            table: SourceTable {
                source: ctx.file_name.clone(),
                columns,
                records,
            },
            report,
        })
    }

    fn parse_bytes(&self, ctx: &AdapterContext, bytes: &[u8]) -> Result<ParsedSource, AdapterError> {
        let mut cleaning = CleaningReport::default();
        let document = clean::parse_lenient(bytes, &mut cleaning).map_err(|error| {
            AdapterError::Json {
                source_name: ctx.file_name.clone(),
                error,
            }
        })?;
        let mut parsed = self.parse_document(ctx, &document)?;
        parsed.report.cleaning.non_finite_numbers += cleaning.non_finite_numbers;
        Ok(parsed)
    }

    async fn parse_file(&self, ctx: &AdapterContext, path: &Path) -> Result<ParsedSource, AdapterError> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        self.parse_bytes(ctx, &bytes)
    }
}

fn nested_records(document: &JsonValue) -> Option<&[JsonValue]> {
    document
        .get("marches")?
        .get("marche")?
        .as_array()
        .map(Vec::as_slice)
}

/// 2022 format: `{"marches": {"marche": [...]}}` with wrapped awardees and amendments.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decp2022Adapter;

#[async_trait]
impl SourceAdapter for Decp2022Adapter {
    fn schema(&self) -> SourceSchema {
        SourceSchema::Decp2022
    }

    fn records<'a>(
        &self,
        ctx: &AdapterContext,
        document: &'a JsonValue,
    ) -> Result<&'a [JsonValue], AdapterError> {
        nested_records(document).ok_or_else(|| AdapterError::UnexpectedRoot {
            source_name: ctx.file_name.clone(),
            expected: "marches.marche[]",
        })
    }
}

/// 2019 format: `{"marches": [...]}` (or the nested form) with flat
/// awardees, unnumbered amendments and interleaved concession contracts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decp2019Adapter;

#[async_trait]
impl SourceAdapter for Decp2019Adapter {
    fn schema(&self) -> SourceSchema {
        SourceSchema::Decp2019
    }

    fn records<'a>(
        &self,
        ctx: &AdapterContext,
        document: &'a JsonValue,
    ) -> Result<&'a [JsonValue], AdapterError> {
        if let Some(records) = document.get("marches").and_then(JsonValue::as_array) {
            return Ok(records.as_slice());
        }
        nested_records(document).ok_or_else(|| AdapterError::UnexpectedRoot {
            source_name: ctx.file_name.clone(),
            expected: "marches[] or marches.marche[]",
        })
    }

    fn skip_record(&self, record: &JsonValue) -> bool {
        record.get("_type").and_then(JsonValue::as_str) == Some(CONCESSION_TYPE)
    }
}

pub fn adapter_for_schema(schema: SourceSchema) -> Box<dyn SourceAdapter> {
    match schema {
        SourceSchema::Decp2019 => Box::new(Decp2019Adapter),
        SourceSchema::Decp2022 => Box::new(Decp2022Adapter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(file_name: &str) -> AdapterContext {
        AdapterContext {
            file_name: file_name.to_string(),
            run_date: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        }
    }

    #[test]
    fn schema_names_round_trip_through_serde() {
        let schema: SourceSchema = serde_json::from_value(json!("decp-2019")).unwrap();
        assert_eq!(schema, SourceSchema::Decp2019);
        assert_eq!(adapter_for_schema(SourceSchema::Decp2022).schema().as_str(), "decp-2022");
    }

    #[test]
    fn decp_2022_requires_nested_root() {
        let err = Decp2022Adapter
            .parse_document(&ctx("decp-2022"), &json!({"marches": []}))
            .unwrap_err();
        assert!(matches!(err, AdapterError::UnexpectedRoot { .. }));
    }

    #[test]
    fn decp_2019_skips_concessions_and_nc_values() {
        let document = json!({"marches": [
            {"_type": "Marché", "id": "M1", "acheteur": {"id": "B"}, "montant": "NC", "modifications": []},
            {"_type": "Contrat de concession", "id": "K1", "modifications": []},
            "garbage"
        ]});
        let parsed = Decp2019Adapter
            .parse_document(&ctx("decp-2019"), &document)
            .unwrap();
        assert_eq!(parsed.table.records.len(), 1);
        assert_eq!(parsed.report.skipped_concessions, 1);
        assert_eq!(parsed.report.non_object_records, 1);
        assert_eq!(parsed.report.cleaning.nc_values_nulled, 1);
        assert_eq!(parsed.table.records[0].amount, decp_core::Declared::Null);
        assert!(parsed.table.columns.contains("_type"));
    }

    #[test]
    fn bytes_with_nan_tokens_still_parse() {
        let raw = br#"{"marches": {"marche": [{"id": "M1", "montant": NaN, "modifications": []}]}}"#;
        let parsed = Decp2022Adapter.parse_bytes(&ctx("decp-2022"), raw).unwrap();
        assert_eq!(parsed.report.cleaning.non_finite_numbers, 1);
        assert_eq!(parsed.table.records[0].amount, decp_core::Declared::Null);
    }

    #[test]
    fn invalid_json_is_reported_with_the_source_name() {
        let err = Decp2022Adapter.parse_bytes(&ctx("broken"), b"{").unwrap_err();
        assert!(err.to_string().starts_with("broken: invalid json"));
    }

    #[tokio::test]
    async fn parse_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decp.json");
        std::fs::write(&path, br#"{"marches": []}"#).unwrap();
        let parsed = Decp2019Adapter.parse_file(&ctx("decp"), &path).await.unwrap();
        assert!(parsed.table.records.is_empty());
        assert!(parsed.table.check_required_columns().is_ok());
    }
}
