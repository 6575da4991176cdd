//! Value-level cleaning shared by every DECP encoding.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use decp_core::{Awardee, Declared};

/// Known-bad date strings found in published extracts. An empty
/// replacement means the date is unrecoverable.
pub const DATE_REPLACEMENTS: &[(&str, &str)] = &[
    ("0002-11-30", ""),
    ("September, 16 2021 00:00:00", "2021-09-16"),
    ("16 2021 00:00:00", ""),
    ("0222-04-29", "2022-04-29"),
    ("0021-12-05", "2022-12-05"),
    ("0001-06-21", ""),
    ("0019-10-18", ""),
    ("5021-02-18", "2021-02-18"),
    ("2921-11-19", ""),
    ("0022-04-29", "2022-04-29"),
];

pub const NATURE_FIXES: &[(&str, &str)] = &[("Marche", "Marché"), ("subsequent", "subséquent")];

/// Dates before this are treated as data-entry errors.
pub fn earliest_plausible_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Counters for every value the cleaning rules altered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleaningReport {
    pub nc_values_nulled: usize,
    pub non_finite_numbers: usize,
    pub invalid_amendment_awardees: usize,
    pub date_replacements: usize,
    pub invalid_dates: usize,
    pub implausible_dates: usize,
    pub unparsed_numbers: usize,
    pub swapped_awardee_ids: usize,
    pub nature_fixes: usize,
}

/// Parse a raw document, accepting the bare `NaN`/`Infinity` tokens some
/// extracts contain by turning them into `null`.
pub fn parse_lenient(bytes: &[u8], report: &mut CleaningReport) -> serde_json::Result<JsonValue> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(strict_err) => {
            let (patched, replaced) = null_non_finite_tokens(bytes);
            if replaced == 0 {
                return Err(strict_err);
            }
            report.non_finite_numbers += replaced;
            serde_json::from_slice(&patched)
        }
    }
}

fn null_non_finite_tokens(bytes: &[u8]) -> (Vec<u8>, usize) {
    const TOKENS: [&[u8]; 3] = [b"-Infinity", b"Infinity", b"NaN"];
    let mut out = Vec::with_capacity(bytes.len());
    let mut replaced = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0usize;
    'scan: while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else {
            for token in TOKENS {
                if bytes[i..].starts_with(token) {
                    out.extend_from_slice(b"null");
                    replaced += 1;
                    i += token.len();
                    continue 'scan;
                }
            }
        }
        out.push(b);
        i += 1;
    }
    (out, replaced)
}

/// Replace `"NC"` strings with null, recursively.
pub fn null_nc_values(value: &mut JsonValue, report: &mut CleaningReport) {
    if matches!(value, JsonValue::String(s) if s == "NC") {
        *value = JsonValue::Null;
        report.nc_values_nulled += 1;
        return;
    }
    match value {
        JsonValue::Array(items) => items
            .iter_mut()
            .for_each(|item| null_nc_values(item, report)),
        JsonValue::Object(map) => map
            .values_mut()
            .for_each(|item| null_nc_values(item, report)),
        _ => {}
    }
}

/// Slot state of `key` on `object`.
pub fn slot<'a>(object: &'a JsonValue, key: &str) -> Declared<&'a JsonValue> {
    match object.get(key) {
        None => Declared::Absent,
        Some(JsonValue::Null) => Declared::Null,
        Some(value) => Declared::Value(value),
    }
}

pub fn text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn text_at(object: &JsonValue, key: &str) -> Option<String> {
    object.get(key).and_then(text)
}

/// Path lookup through nested objects, e.g. `["acheteur", "id"]`.
pub fn text_at_path(object: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = object;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    text(cur)
}

pub fn lenient_f64(value: &JsonValue, report: &mut CleaningReport) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let compact: String = s
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| if c == ',' { '.' } else { c })
                .collect();
            compact.parse::<f64>().ok()
        }
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Some(v),
        _ => {
            report.unparsed_numbers += 1;
            None
        }
    }
}

pub fn lenient_i32(value: &JsonValue, report: &mut CleaningReport) -> Option<i32> {
    if let Some(v) = value.as_i64() {
        return i32::try_from(v).ok().or_else(|| {
            report.unparsed_numbers += 1;
            None
        });
    }
    let v = lenient_f64(value, report)?;
    if v.fract() == 0.0 && v >= f64::from(i32::MIN) && v <= f64::from(i32::MAX) {
        Some(v as i32)
    } else {
        report.unparsed_numbers += 1;
        None
    }
}

/// Tri-state numeric slot: a present but non-numeric value becomes `Null`.
pub fn declared_f64(object: &JsonValue, key: &str, report: &mut CleaningReport) -> Declared<f64> {
    match slot(object, key) {
        Declared::Value(v) => Declared::from_present(lenient_f64(v, report)),
        Declared::Null => Declared::Null,
        Declared::Absent => Declared::Absent,
    }
}

pub fn declared_i32(object: &JsonValue, key: &str, report: &mut CleaningReport) -> Declared<i32> {
    match slot(object, key) {
        Declared::Value(v) => Declared::from_present(lenient_i32(v, report)),
        Declared::Null => Declared::Null,
        Declared::Absent => Declared::Absent,
    }
}

pub fn optional_f64(object: &JsonValue, key: &str, report: &mut CleaningReport) -> Option<f64> {
    declared_f64(object, key, report).into_value()
}

pub fn optional_i32(object: &JsonValue, key: &str, report: &mut CleaningReport) -> Option<i32> {
    declared_i32(object, key, report).into_value()
}

pub fn lenient_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        JsonValue::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(true),
            Some(v) if v == 0.0 => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn optional_bool(object: &JsonValue, key: &str) -> Option<bool> {
    object.get(key).and_then(lenient_bool)
}

/// Parse a publication or notification date as of `run_date`.
///
/// Accepts `YYYY-MM-DD` with any time or offset suffix. Unparseable values,
/// values before 1990 and values after `run_date` become `None`.
pub fn clean_date(raw: &str, run_date: NaiveDate, report: &mut CleaningReport) -> Option<NaiveDate> {
    let mut candidate = raw.trim();
    if let Some((_, replacement)) = DATE_REPLACEMENTS.iter().find(|(bad, _)| *bad == candidate) {
        report.date_replacements += 1;
        candidate = *replacement;
    }
    if candidate.is_empty() {
        report.invalid_dates += 1;
        return None;
    }

    let Some(date) = candidate
        .get(..10)
        .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
    else {
        report.invalid_dates += 1;
        return None;
    };

    if date < earliest_plausible_date() || date > run_date {
        report.implausible_dates += 1;
        return None;
    }
    Some(date)
}

pub fn declared_date(
    object: &JsonValue,
    key: &str,
    run_date: NaiveDate,
    report: &mut CleaningReport,
) -> Declared<NaiveDate> {
    match slot(object, key) {
        Declared::Absent => Declared::Absent,
        Declared::Null => Declared::Null,
        Declared::Value(value) => match text(value) {
            Some(raw) => Declared::from_present(clean_date(&raw, run_date, report)),
            None => {
                report.invalid_dates += 1;
                Declared::Null
            }
        },
    }
}

pub fn fix_nature(nature: String, report: &mut CleaningReport) -> String {
    let mut fixed = nature;
    for (bad, good) in NATURE_FIXES {
        if fixed.contains(bad) {
            fixed = fixed.replace(bad, good);
            report.nature_fixes += 1;
        }
    }
    fixed
}

/// Build an awardee from a flat `{typeIdentifiant, id, denominationSociale}`
/// object, swapping id and type back when the type holds digits.
pub fn awardee_from_object(object: &JsonValue, report: &mut CleaningReport) -> Option<Awardee> {
    if !object.is_object() {
        return None;
    }
    let mut id = text_at(object, "id");
    let mut id_type = text_at(object, "typeIdentifiant");
    if id_type
        .as_deref()
        .is_some_and(|t| t.chars().any(|c| c.is_ascii_digit()))
    {
        std::mem::swap(&mut id, &mut id_type);
        report.swapped_awardee_ids += 1;
    }
    Some(Awardee {
        id,
        id_type,
        name: text_at(object, "denominationSociale"),
    })
}
