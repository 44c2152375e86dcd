//! Core domain model for incremental time-series sync.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

mod date;
mod field_map;

pub use date::{DateEncoding, DateParser, ParsedDate};
pub use field_map::{FieldMap, FieldMapError};

pub const CRATE_NAME: &str = "tsync-core";

/// A single typed cell. Sources hand back loosely typed JSON; everything is
/// funnelled into this closed set before it reaches a chunk or an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => n.as_f64().map(FieldValue::Float).unwrap_or(FieldValue::Null),
            },
            JsonValue::String(s) => FieldValue::Text(s.clone()),
            other => FieldValue::Text(other.to_string()),
        }
    }

    /// Text rendering used when a column has to fall back to strings.
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Int(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

/// A fetched or staged record whose date has not been parsed yet.
///
/// The date lives in `fields` under the dataset's date column, in whatever
/// encoding the source used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Build a record from a JSON object, stamping the entity key on it.
    /// Non-object values produce a record with no fields.
    pub fn from_json_object(entity: impl Into<String>, value: &JsonValue) -> Self {
        let mut record = Record::new(entity);
        if let Some(map) = value.as_object() {
            for (name, v) in map {
                record.fields.insert(name.clone(), FieldValue::from_json(v));
            }
        }
        record
    }
}

/// A merged row: one observation of one entity on one date.
/// `(entity, date)` is the dedup key of a published dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub entity: String,
    pub date: NaiveDate,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Row {
    pub fn key(&self) -> (&str, NaiveDate) {
        (self.entity.as_str(), self.date)
    }

    /// Turn the row back into a record, re-inserting the typed date under `date_column`.
    pub fn into_record(self, date_column: &str) -> Record {
        let mut fields = self.fields;
        fields.insert(date_column.to_string(), FieldValue::Date(self.date));
        Record {
            entity: self.entity,
            fields,
        }
    }
}

/// Inclusive date range requested from a source for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl FetchWindow {
    /// Window for an entity given its watermark.
    ///
    /// With a watermark `w` the window is `(w, today]`; without one it is
    /// `[default_start, today]`. Returns `None` when there is nothing left to
    /// ask for, which includes a same-day rerun where `w >= today`.
    pub fn plan(
        watermark: Option<NaiveDate>,
        default_start: NaiveDate,
        today: NaiveDate,
    ) -> Option<Self> {
        let from = match watermark {
            Some(w) if w >= today => return None,
            Some(w) => w.succ_opt()?,
            None => default_start,
        };
        if from > today {
            return None;
        }
        Some(Self { from, to: today })
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Names of the two structural columns every dataset type carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    pub entity_column: String,
    pub date_column: String,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            entity_column: "ticker".to_string(),
            date_column: "date".to_string(),
        }
    }
}

/// Version date embedded in an artifact key's trailing `_<digits>` segment.
///
/// `YYYYMMDD` is the current naming; six-digit `DDMMYY` suffixes written by
/// earlier tooling are still recognised so retention can prune them.
pub fn parse_artifact_version(key: &str) -> Option<NaiveDate> {
    let file_name = key.rsplit('/').next()?;
    let stem = file_name.split_once('.').map_or(file_name, |(stem, _)| stem);
    let (_, suffix) = stem.rsplit_once('_')?;
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match suffix.len() {
        8 => NaiveDate::parse_from_str(suffix, "%Y%m%d").ok(),
        6 => NaiveDate::parse_from_str(suffix, "%d%m%y").ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn window_after_watermark_is_exclusive_of_watermark() {
        let window = FetchWindow::plan(Some(d(2024, 1, 10)), d(2023, 1, 1), d(2024, 1, 15)).unwrap();
        assert_eq!(window.from, d(2024, 1, 11));
        assert_eq!(window.to, d(2024, 1, 15));
    }

    #[test]
    fn window_is_skipped_for_same_day_rerun() {
        assert!(FetchWindow::plan(Some(d(2024, 1, 15)), d(2023, 1, 1), d(2024, 1, 15)).is_none());
        assert!(FetchWindow::plan(Some(d(2024, 1, 16)), d(2023, 1, 1), d(2024, 1, 15)).is_none());
    }

    #[test]
    fn window_without_watermark_starts_at_default() {
        let window = FetchWindow::plan(None, d(2023, 1, 1), d(2024, 1, 15)).unwrap();
        assert_eq!(window.from, d(2023, 1, 1));
        assert!(FetchWindow::plan(None, d(2025, 1, 1), d(2024, 1, 15)).is_none());
    }

    #[test]
    fn artifact_versions_parse_current_and_legacy_suffixes() {
        assert_eq!(
            parse_artifact_version("cafef/prices_20240115.parquet"),
            Some(d(2024, 1, 15))
        );
        assert_eq!(
            parse_artifact_version("cafef/order_stats_150124.parquet"),
            Some(d(2024, 1, 15))
        );
        assert_eq!(parse_artifact_version("cafef/prices_latest.parquet"), None);
        assert_eq!(parse_artifact_version("cafef/prices_20241399.parquet"), None);
        assert_eq!(parse_artifact_version("cafef/prices.parquet"), None);
    }

    #[test]
    fn json_numbers_keep_integer_precision() {
        let record = Record::from_json_object(
            "AAA",
            &json!({"Volume": 1200, "Price": 12.5, "Note": null, "Tags": ["a"]}),
        );
        assert_eq!(record.fields["Volume"], FieldValue::Int(1200));
        assert_eq!(record.fields["Price"], FieldValue::Float(12.5));
        assert!(record.fields["Note"].is_null());
        assert_eq!(record.fields["Tags"], FieldValue::Text("[\"a\"]".to_string()));
    }
}
