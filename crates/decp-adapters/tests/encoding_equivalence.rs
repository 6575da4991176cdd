use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use decp_adapters::{adapter_for_schema, AdapterContext, SourceSchema};
use decp_core::{resolve_source, AwardeeRow, ResolvedRow, SourceReport};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_path(schema: SourceSchema) -> PathBuf {
    workspace_root()
        .join("fixtures")
        .join(schema.as_str())
        .join("sample.json")
}

fn ctx() -> AdapterContext {
    AdapterContext {
        file_name: "sample".to_string(),
        run_date: NaiveDate::from_ymd_opt(2024, 6, 30).expect("date"),
    }
}

async fn resolve_fixture(schema: SourceSchema) -> (Vec<AwardeeRow>, SourceReport) {
    let parsed = adapter_for_schema(schema)
        .parse_file(&ctx(), &fixture_path(schema))
        .await
        .expect("parse fixture");
    let (table, report) = resolve_source(parsed.table).expect("resolve fixture");
    (table.rows, report)
}

/// Drop the fields only one encoding carries.
fn comparable(rows: &[AwardeeRow]) -> Vec<(ResolvedRow, Option<(Option<String>, Option<String>)>)> {
    rows.iter()
        .map(|row| {
            let mut contract = (*row.contract).clone();
            contract.amendment_object = None;
            contract.descriptor.buyer_name = None;
            if let Some(awardees) = contract.awardees.as_mut() {
                awardees.iter_mut().for_each(|a| a.name = None);
            }
            let awardee = row
                .awardee
                .as_ref()
                .map(|a| (a.id.clone(), a.id_type.clone()));
            (contract, awardee)
        })
        .collect()
}

#[tokio::test]
async fn both_encodings_resolve_to_the_same_rows() {
    let (rows_2019, report_2019) = resolve_fixture(SourceSchema::Decp2019).await;
    let (rows_2022, report_2022) = resolve_fixture(SourceSchema::Decp2022).await;

    assert_eq!(comparable(&rows_2019), comparable(&rows_2022));
    assert_eq!(
        report_2019.submissions.duplicates_removed,
        report_2022.submissions.duplicates_removed
    );
    assert_eq!(report_2019.resolution.rows, report_2022.resolution.rows);
}

#[tokio::test]
async fn fixture_contracts_resolve_as_expected() {
    let (rows, report) = resolve_fixture(SourceSchema::Decp2022).await;

    assert_eq!(report.submissions.duplicates_removed, 1);
    assert_eq!(report.resolution.contracts, 3);
    assert_eq!(report.resolution.rows, 6);

    let contract: Vec<_> = rows
        .iter()
        .filter(|r| r.contract.uid == "217500016000192023AO01")
        .collect();
    // Two awardees on the notification, one after the first amendment.
    assert_eq!(contract.len(), 4);
    let amounts: Vec<_> = contract.iter().map(|r| r.contract.amount).collect();
    assert_eq!(amounts, vec![Some(1000.0), Some(1000.0), Some(1500.0), Some(1500.0)]);
    let current = contract
        .iter()
        .find(|r| r.contract.is_current)
        .expect("current row");
    assert_eq!(current.contract.duration_months, Some(18));
    assert_eq!(current.awardee_id(), Some("44306184100047"));

    let reduced: Vec<_> = rows
        .iter()
        .filter(|r| r.contract.uid == "213300635000172023MAPA07")
        .collect();
    assert_eq!(reduced.len(), 2);
    assert!(reduced.iter().all(|r| r.contract.id == "2023MAPA0701"));
    assert_eq!(reduced[1].contract.amount, Some(24000.0));
    // The amendment's awardee list was invalid, so the original awardee carries.
    assert_eq!(reduced[1].awardee_id(), Some("78012998700023"));

    let cleaned = rows
        .iter()
        .find(|r| r.contract.buyer_id == "20005584600014")
        .expect("cleaned contract");
    assert_eq!(cleaned.contract.id, "2022_15_3");
    assert_eq!(cleaned.contract.notification_date, NaiveDate::from_ymd_opt(2022, 4, 29));
    assert_eq!(cleaned.contract.duration_months, None);
    assert_eq!(cleaned.awardee_id(), Some("12345678901234"));
    assert_eq!(cleaned.awardee_id_type(), Some("SIRET"));
}

#[tokio::test]
async fn decp_2019_fixture_skips_the_concession() {
    let parsed = adapter_for_schema(SourceSchema::Decp2019)
        .parse_file(&ctx(), &fixture_path(SourceSchema::Decp2019))
        .await
        .expect("parse fixture");
    assert_eq!(parsed.report.skipped_concessions, 1);
    assert_eq!(parsed.table.records.len(), 4);
}
