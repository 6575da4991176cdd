//! Record-level parsing shared by the DECP encodings.
//!
//! The 2022 encoding wraps awardees as `{"titulaire": {...}}` and amendments
//! as `{"modification": {...}}`; the 2019 encoding uses the inner objects
//! directly. Both shapes are accepted here so the adapters only differ in
//! how they locate the record list.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use tracing::debug;

use decp_core::{Amendment, Awardee, ContractDescriptor, ContractRecord, Declared};

use crate::clean::{
    awardee_from_object, declared_date, declared_f64, declared_i32, fix_nature, optional_bool,
    optional_f64, optional_i32, slot, text_at, text_at_path, CleaningReport,
};

pub(crate) const AWARDEE_WRAPPER: &str = "titulaire";
pub(crate) const AMENDMENT_WRAPPER: &str = "modification";

pub(crate) struct RecordParser<'a> {
    pub file_name: &'a str,
    pub run_date: NaiveDate,
}

impl RecordParser<'_> {
    pub fn source_open_data(&self) -> String {
        format!("data.gouv.fr {}.json", self.file_name)
    }

    pub fn parse_record(
        &self,
        record: &JsonValue,
        columns: &mut BTreeSet<String>,
        report: &mut CleaningReport,
    ) -> Option<ContractRecord> {
        let object = record.as_object()?;
        columns.extend(object.keys().cloned());

        let amendments = match record.get("modifications") {
            Some(JsonValue::Array(entries)) => entries
                .iter()
                .enumerate()
                .map(|(position, entry)| self.parse_amendment(entry, position, report))
                .collect(),
            _ => Vec::new(),
        };

        Some(ContractRecord {
            raw_id: text_at(record, "id").unwrap_or_default(),
            buyer_id: text_at_path(record, &["acheteur", "id"])
                .or_else(|| text_at(record, "acheteur_id"))
                .unwrap_or_default(),
            notification_date: declared_date(record, "dateNotification", self.run_date, report),
            publication_date: declared_date(record, "datePublicationDonnees", self.run_date, report),
            amount: declared_f64(record, "montant", report),
            duration_months: declared_i32(record, "dureeMois", report),
            awardees: self.contract_awardees(record, report),
            amendments,
            descriptor: self.descriptor(record, report),
        })
    }

    fn descriptor(&self, record: &JsonValue, report: &mut CleaningReport) -> ContractDescriptor {
        ContractDescriptor {
            buyer_name: text_at_path(record, &["acheteur", "nom"]),
            nature: text_at(record, "nature").map(|n| fix_nature(n, report)),
            object: text_at(record, "objet"),
            cpv_code: text_at(record, "codeCPV"),
            procedure: text_at(record, "procedure"),
            price_form: text_at(record, "formePrix"),
            execution_place_code: text_at_path(record, &["lieuExecution", "code"]),
            execution_place_code_type: text_at_path(record, &["lieuExecution", "typeCode"]),
            execution_place_name: text_at_path(record, &["lieuExecution", "nom"]),
            framework_agreement_id: text_at(record, "idAccordCadre"),
            ccag: text_at(record, "ccag"),
            operator_grouping_type: text_at(record, "typeGroupementOperateurs"),
            offers_received: optional_i32(record, "offresRecues", report),
            innovative: optional_bool(record, "marcheInnovant"),
            advance_granted: optional_bool(record, "attributionAvance"),
            subcontracting_declared: optional_bool(record, "sousTraitanceDeclaree"),
            advance_rate: optional_f64(record, "tauxAvance", report),
            origin_eu: optional_f64(record, "origineUE", report),
            origin_france: optional_f64(record, "origineFrance", report),
            source_open_data: Some(self.source_open_data()),
        }
    }

    /// Contract-level awardees: an empty list is a declared value.
    fn contract_awardees(
        &self,
        record: &JsonValue,
        report: &mut CleaningReport,
    ) -> Declared<Vec<Awardee>> {
        match slot(record, "titulaires") {
            Declared::Absent => Declared::Absent,
            Declared::Null => Declared::Null,
            Declared::Value(JsonValue::Array(entries)) => Declared::Value(
                entries
                    .iter()
                    .filter_map(|entry| unwrap_awardee(entry))
                    .filter_map(|entry| awardee_from_object(entry, report))
                    .collect(),
            ),
            Declared::Value(_) => Declared::Null,
        }
    }

    fn parse_amendment(
        &self,
        entry: &JsonValue,
        position: usize,
        report: &mut CleaningReport,
    ) -> Option<Amendment> {
        let inner = match entry.get(AMENDMENT_WRAPPER) {
            Some(inner) => inner,
            None => entry,
        };
        if !inner.is_object() {
            debug!(position, "dropping non-object amendment entry");
            return None;
        }

        let sequence_number = inner
            .get("id")
            .and_then(|id| id.as_i64().or_else(|| id.as_str()?.trim().parse().ok()))
            .or_else(|| i64::try_from(position + 1).ok());

        Some(Amendment {
            sequence_number,
            notification_date: declared_date(
                inner,
                "dateNotificationModification",
                self.run_date,
                report,
            ),
            publication_date: declared_date(
                inner,
                "datePublicationDonneesModification",
                self.run_date,
                report,
            ),
            object: text_at(inner, "objetModification"),
            amount: declared_f64(inner, "montant", report),
            duration_months: declared_i32(inner, "dureeMois", report),
            awardees: amendment_awardees(inner, report),
        })
    }
}

fn unwrap_awardee(entry: &JsonValue) -> Option<&JsonValue> {
    match entry.get(AWARDEE_WRAPPER) {
        Some(inner) if inner.is_object() => Some(inner),
        Some(_) => None,
        None if entry.is_object() => Some(entry),
        None => None,
    }
}

/// Amendment awardees keep only object-shaped entries. A present list with
/// no valid entry declares nothing and is counted.
fn amendment_awardees(amendment: &JsonValue, report: &mut CleaningReport) -> Declared<Vec<Awardee>> {
    let Some(raw) = amendment.get("titulaires") else {
        return Declared::Absent;
    };
    let valid: Vec<Awardee> = raw
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(unwrap_awardee)
                .filter_map(|entry| awardee_from_object(entry, report))
                .collect()
        })
        .unwrap_or_default();
    if valid.is_empty() {
        report.invalid_amendment_awardees += 1;
        Declared::Absent
    } else {
        Declared::Value(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> RecordParser<'static> {
        RecordParser {
            file_name: "decp-2022",
            run_date: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        }
    }

    fn parse(value: JsonValue) -> (ContractRecord, BTreeSet<String>, CleaningReport) {
        let mut columns = BTreeSet::new();
        let mut report = CleaningReport::default();
        let record = parser()
            .parse_record(&value, &mut columns, &mut report)
            .unwrap();
        (record, columns, report)
    }

    #[test]
    fn wrapped_and_flat_shapes_parse_the_same() {
        let wrapped = json!({
            "id": "C1",
            "acheteur": {"id": "B1"},
            "titulaires": [{"titulaire": {"typeIdentifiant": "SIRET", "id": "111"}}],
            "modifications": [{"modification": {
                "id": 1,
                "dateNotificationModification": "2023-02-01",
                "montant": 1500,
                "titulaires": [{"titulaire": {"typeIdentifiant": "SIRET", "id": "222"}}]
            }}]
        });
        let flat = json!({
            "id": "C1",
            "acheteur": {"id": "B1"},
            "titulaires": [{"typeIdentifiant": "SIRET", "id": "111"}],
            "modifications": [{
                "dateNotificationModification": "2023-02-01",
                "montant": "1500",
                "titulaires": [{"typeIdentifiant": "SIRET", "id": "222"}]
            }]
        });
        let (a, columns, _) = parse(wrapped);
        let (b, _, _) = parse(flat);
        assert_eq!(a, b);
        assert_eq!(a.buyer_id, "B1");
        assert_eq!(a.amendments[0].as_ref().unwrap().sequence_number, Some(1));
        assert!(columns.contains("modifications"));
    }

    #[test]
    fn amendment_without_valid_awardees_declares_none() {
        let (record, _, report) = parse(json!({
            "id": "C1",
            "modifications": [
                {"modification": {"id": 1, "titulaires": [{"titulaire": "bogus"}]}},
                {"modification": {"id": 2, "titulaires": []}},
                {"modification": {"id": 3}}
            ]
        }));
        for amendment in record.amendments.iter().flatten() {
            assert_eq!(amendment.awardees, Declared::Absent);
        }
        assert_eq!(report.invalid_amendment_awardees, 2);
    }

    #[test]
    fn null_amendment_entries_are_kept_as_placeholders() {
        let (record, _, _) = parse(json!({
            "id": "C1",
            "modifications": [null, {"modification": null}, {"montant": 3}]
        }));
        assert_eq!(record.amendment_count(), 3);
        assert!(record.amendments[0].is_none());
        assert!(record.amendments[1].is_none());
        assert_eq!(record.amendments[2].as_ref().unwrap().sequence_number, Some(3));
    }

    #[test]
    fn declared_null_is_distinct_from_missing() {
        let (record, _, _) = parse(json!({"id": "C1", "montant": null, "modifications": []}));
        assert_eq!(record.amount, Declared::Null);
        assert_eq!(record.duration_months, Declared::Absent);
        assert_eq!(record.awardees, Declared::Absent);
    }

    #[test]
    fn descriptor_is_tagged_with_its_source_file() {
        let (record, _, _) = parse(json!({
            "id": "C1",
            "nature": "Marche",
            "lieuExecution": {"code": "75", "typeCode": "Code département"},
            "marcheInnovant": "false",
            "offresRecues": "3",
            "modifications": []
        }));
        let d = record.descriptor;
        assert_eq!(d.nature.as_deref(), Some("Marché"));
        assert_eq!(d.execution_place_code.as_deref(), Some("75"));
        assert_eq!(d.innovative, Some(false));
        assert_eq!(d.offers_received, Some(3));
        assert_eq!(d.source_open_data.as_deref(), Some("data.gouv.fr decp-2022.json"));
    }
}
