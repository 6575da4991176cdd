//! Columnar and CSV export of the publication tables plus an integrity manifest.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int32Array, Int64Array, RecordBatch,
    StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

use decp_core::{AwardeeRow, ResolvedRow};
use decp_storage::sha256_hex;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

type Column = (ArrowField, ArrayRef);

fn date32(date: Option<NaiveDate>) -> Option<i32> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    date.and_then(|d| i32::try_from((d - epoch).num_days()).ok())
}

fn utf8<'a>(name: &str, values: impl Iterator<Item = Option<&'a str>>) -> Column {
    (
        ArrowField::new(name, DataType::Utf8, true),
        Arc::new(StringArray::from(values.collect::<Vec<_>>())),
    )
}

fn required_utf8<'a>(name: &str, values: impl Iterator<Item = &'a str>) -> Column {
    (
        ArrowField::new(name, DataType::Utf8, false),
        Arc::new(StringArray::from(values.collect::<Vec<_>>())),
    )
}

fn float64(name: &str, values: impl Iterator<Item = Option<f64>>) -> Column {
    (
        ArrowField::new(name, DataType::Float64, true),
        Arc::new(Float64Array::from(values.collect::<Vec<_>>())),
    )
}

fn int32(name: &str, values: impl Iterator<Item = Option<i32>>) -> Column {
    (
        ArrowField::new(name, DataType::Int32, true),
        Arc::new(Int32Array::from(values.collect::<Vec<_>>())),
    )
}

fn boolean(name: &str, values: impl Iterator<Item = Option<bool>>) -> Column {
    (
        ArrowField::new(name, DataType::Boolean, true),
        Arc::new(BooleanArray::from(values.collect::<Vec<_>>())),
    )
}

fn date(name: &str, values: impl Iterator<Item = Option<NaiveDate>>) -> Column {
    (
        ArrowField::new(name, DataType::Date32, true),
        Arc::new(Date32Array::from(values.map(date32).collect::<Vec<_>>())),
    )
}

/// Contract-state columns, in publication order.
fn contract_columns(rows: &[&ResolvedRow]) -> Vec<Column> {
    let it = || rows.iter().copied();
    vec![
        required_utf8("uid", it().map(|r| r.uid.as_str())),
        required_utf8("id", it().map(|r| r.id.as_str())),
        required_utf8("acheteur_id", it().map(|r| r.buyer_id.as_str())),
        utf8("acheteur_nom", it().map(|r| r.descriptor.buyer_name.as_deref())),
        utf8("nature", it().map(|r| r.descriptor.nature.as_deref())),
        utf8("objet", it().map(|r| r.descriptor.object.as_deref())),
        float64("montant", it().map(|r| r.amount)),
        utf8("codeCPV", it().map(|r| r.descriptor.cpv_code.as_deref())),
        utf8("procedure", it().map(|r| r.descriptor.procedure.as_deref())),
        int32("dureeMois", it().map(|r| r.duration_months)),
        date("dateNotification", it().map(|r| r.notification_date)),
        date("datePublicationDonnees", it().map(|r| r.publication_date)),
        utf8("formePrix", it().map(|r| r.descriptor.price_form.as_deref())),
        boolean("attributionAvance", it().map(|r| r.descriptor.advance_granted)),
        int32("offresRecues", it().map(|r| r.descriptor.offers_received)),
        boolean("marcheInnovant", it().map(|r| r.descriptor.innovative)),
        utf8("ccag", it().map(|r| r.descriptor.ccag.as_deref())),
        boolean(
            "sousTraitanceDeclaree",
            it().map(|r| r.descriptor.subcontracting_declared),
        ),
        utf8(
            "typeGroupementOperateurs",
            it().map(|r| r.descriptor.operator_grouping_type.as_deref()),
        ),
        float64("tauxAvance", it().map(|r| r.descriptor.advance_rate)),
        float64("origineUE", it().map(|r| r.descriptor.origin_eu)),
        float64("origineFrance", it().map(|r| r.descriptor.origin_france)),
        utf8(
            "lieuExecution_code",
            it().map(|r| r.descriptor.execution_place_code.as_deref()),
        ),
        utf8(
            "lieuExecution_typeCode",
            it().map(|r| r.descriptor.execution_place_code_type.as_deref()),
        ),
        utf8(
            "lieuExecution_nom",
            it().map(|r| r.descriptor.execution_place_name.as_deref()),
        ),
        utf8(
            "idAccordCadre",
            it().map(|r| r.descriptor.framework_agreement_id.as_deref()),
        ),
        utf8(
            "sourceOpenData",
            it().map(|r| r.descriptor.source_open_data.as_deref()),
        ),
        (
            ArrowField::new("modification_id", DataType::UInt32, false),
            Arc::new(UInt32Array::from(
                it().map(|r| r.sequence_index).collect::<Vec<_>>(),
            )),
        ),
        (
            ArrowField::new("modification_numero", DataType::Int64, true),
            Arc::new(Int64Array::from(
                it().map(|r| r.amendment_id).collect::<Vec<_>>(),
            )),
        ),
        utf8("objetModification", it().map(|r| r.amendment_object.as_deref())),
        (
            ArrowField::new("donneesActuelles", DataType::Boolean, false),
            Arc::new(BooleanArray::from(
                it().map(|r| r.is_current).collect::<Vec<_>>(),
            )),
        ),
        (
            ArrowField::new("ordreAmbigu", DataType::Boolean, false),
            Arc::new(BooleanArray::from(
                it().map(|r| r.ordering_ambiguous).collect::<Vec<_>>(),
            )),
        ),
    ]
}

fn batch(name: &str, columns: Vec<Column>) -> Result<RecordBatch> {
    let (fields, arrays): (Vec<_>, Vec<_>) = columns.into_iter().unzip();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .with_context(|| format!("building {name} record batch"))
}

pub fn contracts_batch(contracts: &[Arc<ResolvedRow>]) -> Result<RecordBatch> {
    let rows: Vec<&ResolvedRow> = contracts.iter().map(|c| c.as_ref()).collect();
    batch("marches", contract_columns(&rows))
}

pub fn awardees_batch(awardees: &[AwardeeRow]) -> Result<RecordBatch> {
    let rows: Vec<&ResolvedRow> = awardees.iter().map(|a| a.contract.as_ref()).collect();
    let mut columns = contract_columns(&rows);
    columns.insert(
        4,
        utf8("titulaire_id", awardees.iter().map(AwardeeRow::awardee_id)),
    );
    columns.insert(
        5,
        utf8(
            "titulaire_typeIdentifiant",
            awardees.iter().map(AwardeeRow::awardee_id_type),
        ),
    );
    columns.insert(
        6,
        utf8(
            "titulaire_nom",
            awardees
                .iter()
                .map(|a| a.awardee.as_ref().and_then(|w| w.name.as_deref())),
        ),
    );
    batch("decp", columns)
}

/// One `decp.csv` line; columns follow the awardee-level parquet file.
#[derive(Debug, Serialize)]
struct CsvRecord<'a> {
    uid: &'a str,
    id: &'a str,
    acheteur_id: &'a str,
    acheteur_nom: Option<&'a str>,
    titulaire_id: Option<&'a str>,
    #[serde(rename = "titulaire_typeIdentifiant")]
    titulaire_type_identifiant: Option<&'a str>,
    titulaire_nom: Option<&'a str>,
    nature: Option<&'a str>,
    objet: Option<&'a str>,
    montant: Option<f64>,
    #[serde(rename = "codeCPV")]
    code_cpv: Option<&'a str>,
    procedure: Option<&'a str>,
    #[serde(rename = "dureeMois")]
    duree_mois: Option<i32>,
    #[serde(rename = "dateNotification")]
    date_notification: Option<NaiveDate>,
    #[serde(rename = "datePublicationDonnees")]
    date_publication_donnees: Option<NaiveDate>,
    #[serde(rename = "formePrix")]
    forme_prix: Option<&'a str>,
    #[serde(rename = "attributionAvance")]
    attribution_avance: Option<bool>,
    #[serde(rename = "offresRecues")]
    offres_recues: Option<i32>,
    #[serde(rename = "marcheInnovant")]
    marche_innovant: Option<bool>,
    ccag: Option<&'a str>,
    #[serde(rename = "sousTraitanceDeclaree")]
    sous_traitance_declaree: Option<bool>,
    #[serde(rename = "typeGroupementOperateurs")]
    type_groupement_operateurs: Option<&'a str>,
    #[serde(rename = "tauxAvance")]
    taux_avance: Option<f64>,
    #[serde(rename = "origineUE")]
    origine_ue: Option<f64>,
    #[serde(rename = "origineFrance")]
    origine_france: Option<f64>,
    #[serde(rename = "lieuExecution_code")]
    lieu_execution_code: Option<&'a str>,
    #[serde(rename = "lieuExecution_typeCode")]
    lieu_execution_type_code: Option<&'a str>,
    #[serde(rename = "lieuExecution_nom")]
    lieu_execution_nom: Option<&'a str>,
    #[serde(rename = "idAccordCadre")]
    id_accord_cadre: Option<&'a str>,
    #[serde(rename = "sourceOpenData")]
    source_open_data: Option<&'a str>,
    modification_id: u32,
    modification_numero: Option<i64>,
    #[serde(rename = "objetModification")]
    objet_modification: Option<&'a str>,
    #[serde(rename = "donneesActuelles")]
    donnees_actuelles: bool,
    #[serde(rename = "ordreAmbigu")]
    ordre_ambigu: bool,
}

impl<'a> From<&'a AwardeeRow> for CsvRecord<'a> {
    fn from(row: &'a AwardeeRow) -> Self {
        let r = row.contract.as_ref();
        let d = &r.descriptor;
        Self {
            uid: &r.uid,
            id: &r.id,
            acheteur_id: &r.buyer_id,
            acheteur_nom: d.buyer_name.as_deref(),
            titulaire_id: row.awardee_id(),
            titulaire_type_identifiant: row.awardee_id_type(),
            titulaire_nom: row.awardee.as_ref().and_then(|w| w.name.as_deref()),
            nature: d.nature.as_deref(),
            objet: d.object.as_deref(),
            montant: r.amount,
            code_cpv: d.cpv_code.as_deref(),
            procedure: d.procedure.as_deref(),
            duree_mois: r.duration_months,
            date_notification: r.notification_date,
            date_publication_donnees: r.publication_date,
            forme_prix: d.price_form.as_deref(),
            attribution_avance: d.advance_granted,
            offres_recues: d.offers_received,
            marche_innovant: d.innovative,
            ccag: d.ccag.as_deref(),
            sous_traitance_declaree: d.subcontracting_declared,
            type_groupement_operateurs: d.operator_grouping_type.as_deref(),
            taux_avance: d.advance_rate,
            origine_ue: d.origin_eu,
            origine_france: d.origin_france,
            lieu_execution_code: d.execution_place_code.as_deref(),
            lieu_execution_type_code: d.execution_place_code_type.as_deref(),
            lieu_execution_nom: d.execution_place_name.as_deref(),
            id_accord_cadre: d.framework_agreement_id.as_deref(),
            source_open_data: d.source_open_data.as_deref(),
            modification_id: r.sequence_index,
            modification_numero: r.amendment_id,
            objet_modification: r.amendment_object.as_deref(),
            donnees_actuelles: r.is_current,
            ordre_ambigu: r.ordering_ambiguous,
        }
    }
}

/// Write the awardee-level table as comma-separated text with a header line.
pub fn write_csv(path: &Path, awardees: &[AwardeeRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    for row in awardees {
        writer
            .serialize(CsvRecord::from(row))
            .with_context(|| format!("writing {} #{} to {}", row.contract.uid, row.contract.sequence_index, path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

pub fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::tests::{merged, mk_row};
    use crate::tables::OutputTables;
    use decp_core::Awardee;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tempfile::tempdir;

    fn tables() -> OutputTables {
        OutputTables::build(merged(vec![
            mk_row(
                "U1",
                "B1",
                0,
                Some((2023, 1, 2)),
                Some(vec![Awardee::new("1", "SIRET"), Awardee::new("2", "SIRET")]),
            ),
            mk_row("U2", "B2", 0, None, None),
        ]))
    }

    #[test]
    fn dates_are_days_since_epoch() {
        assert_eq!(date32(NaiveDate::from_ymd_opt(1970, 1, 2)), Some(1));
        assert_eq!(date32(None), None);
    }

    #[test]
    fn awardee_batch_adds_awardee_columns() {
        let tables = tables();
        let batch = awardees_batch(&tables.awardees).unwrap();
        assert_eq!(batch.num_rows(), 3);
        let schema = batch.schema();
        assert_eq!(schema.field(4).name(), "titulaire_id");
        assert!(schema.index_of("donneesActuelles").is_ok());

        let contracts = contracts_batch(&tables.contracts).unwrap();
        assert_eq!(contracts.num_rows(), 2);
        assert!(contracts.schema().index_of("titulaire_id").is_err());
    }

    #[test]
    fn parquet_files_are_written_and_listed_in_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decp.parquet");
        let batch = awardees_batch(&tables().awardees).unwrap();
        write_parquet(&path, &batch).unwrap();

        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 3);

        let entry = manifest_entry("decp", dir.path(), &path, 3).unwrap();
        assert_eq!(entry.path, "decp.parquet");
        assert_eq!(entry.sha256.len(), 64);
        assert!(entry.bytes > 0);
    }

    #[test]
    fn csv_has_a_header_and_one_line_per_awardee() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decp.csv");
        write_csv(&path, &tables().awardees).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "uid");
        assert_eq!(&headers[4], "titulaire_id");
        assert!(headers.iter().any(|h| h == "donneesActuelles"));

        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        let awardee = headers.iter().position(|h| h == "titulaire_id").unwrap();
        let notified = headers.iter().position(|h| h == "dateNotification").unwrap();
        assert_eq!(&records[0][awardee], "1");
        assert_eq!(&records[0][notified], "2023-01-02");
        // Missing values are empty fields.
        assert_eq!(&records[2][awardee], "");
    }
}
