use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{info, warn};
use tsync_core::{ColumnLayout, DateParser, FieldMap, Record, Row};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    /// Deduplicated rows sorted by `(entity, date)`.
    pub rows: Vec<Row>,
    pub max_date: Option<NaiveDate>,
    /// Rows dropped for an unparseable date or an empty entity key.
    pub dropped: usize,
    /// Rows replaced by a later row with the same `(entity, date)`.
    pub superseded: usize,
}

/// Folds the master and the staged chunks into one deduplicated row set.
pub struct MergeEngine<'a> {
    pub layout: &'a ColumnLayout,
    pub field_map: &'a FieldMap,
    pub parser: &'a DateParser,
}

impl MergeEngine<'_> {
    /// Master rows go in first, then chunks in index order; for a repeated
    /// `(entity, date)` the last one in that order wins.
    pub fn merge(&self, master: Vec<Record>, mut chunks: Vec<(u32, Vec<Record>)>) -> MergeOutput {
        chunks.sort_by_key(|(index, _)| *index);
        let mut merged: BTreeMap<(String, NaiveDate), Row> = BTreeMap::new();
        let mut dropped = 0usize;
        let mut superseded = 0usize;

        let master_len = master.len();
        let ordered = master
            .into_iter()
            .chain(chunks.into_iter().flat_map(|(_, records)| records));
        for record in ordered {
            let Some(row) = self.to_row(record) else {
                dropped += 1;
                continue;
            };
            if merged.insert((row.entity.clone(), row.date), row).is_some() {
                superseded += 1;
            }
        }

        let max_date = merged.keys().map(|(_, date)| *date).max();
        let rows: Vec<Row> = merged.into_values().collect();
        info!(
            master_rows = master_len,
            merged_rows = rows.len(),
            dropped,
            superseded,
            "merged master and staged chunks"
        );
        MergeOutput {
            rows,
            max_date,
            dropped,
            superseded,
        }
    }

    fn to_row(&self, record: Record) -> Option<Row> {
        let mut record = self.field_map.normalize(record, self.layout);
        let entity = record.entity.trim().to_string();
        if entity.is_empty() {
            warn!("dropping row without an entity key");
            return None;
        }
        let raw = record.fields.remove(&self.layout.date_column).unwrap_or_default();
        match self.parser.parse(&raw).date() {
            Some(date) => Some(Row {
                entity,
                date,
                fields: record.fields,
            }),
            None => {
                warn!(%entity, value = %raw, "dropping row with unparseable date");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsync_core::FieldValue;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn rec(entity: &str, date: FieldValue, close: i64) -> Record {
        Record::new(entity)
            .with_field("Ngay", date)
            .with_field("close", FieldValue::Int(close))
    }

    fn merge(master: Vec<Record>, chunks: Vec<(u32, Vec<Record>)>) -> MergeOutput {
        let layout = ColumnLayout::default();
        let field_map = FieldMap::new([("ngay", "date")]).unwrap();
        let parser = DateParser::utc();
        MergeEngine {
            layout: &layout,
            field_map: &field_map,
            parser: &parser,
        }
        .merge(master, chunks)
    }

    #[test]
    fn chunk_rows_supersede_master_rows() {
        let master = vec![
            rec("AAA", FieldValue::Date(d(2024, 1, 10)), 1),
            rec("AAA", FieldValue::Date(d(2024, 1, 9)), 1),
        ];
        let chunks = vec![(1, vec![rec("AAA", FieldValue::Text("10/01/2024".into()), 2)])];
        let out = merge(master, chunks);

        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.superseded, 1);
        assert_eq!(out.rows[1].date, d(2024, 1, 10));
        assert_eq!(out.rows[1].fields["close"], FieldValue::Int(2));
        assert!(!out.rows[1].fields.contains_key("date"));
    }

    #[test]
    fn later_chunks_win_over_earlier_chunks() {
        let chunks = vec![
            (1, vec![rec("AAA", FieldValue::Text("/Date(1705276800000)/".into()), 1)]),
            (2, vec![rec("AAA", FieldValue::Text("2024-01-15".into()), 2)]),
        ];
        let out = merge(Vec::new(), chunks);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].fields["close"], FieldValue::Int(2));
        assert_eq!(out.max_date, Some(d(2024, 1, 15)));
    }

    #[test]
    fn unparseable_rows_are_dropped_not_fatal() {
        let chunks = vec![(
            1,
            vec![
                rec("AAA", FieldValue::Text("garbage".into()), 1),
                rec("AAA", FieldValue::Null, 1),
                rec("", FieldValue::Text("15/01/2024".into()), 1),
                rec("BBB", FieldValue::Text("20240112".into()), 1),
            ],
        )];
        let out = merge(Vec::new(), chunks);
        assert_eq!(out.dropped, 3);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].entity, "BBB");
    }

    #[test]
    fn output_is_sorted_by_entity_then_date() {
        let chunks = vec![(
            1,
            vec![
                rec("BBB", FieldValue::Text("2024-01-02".into()), 1),
                rec("AAA", FieldValue::Text("2024-01-03".into()), 1),
                rec("AAA", FieldValue::Text("2024-01-01".into()), 1),
            ],
        )];
        let out = merge(Vec::new(), chunks);
        let keys: Vec<_> = out.rows.iter().map(|r| (r.entity.as_str(), r.date)).collect();
        assert_eq!(
            keys,
            vec![
                ("AAA", d(2024, 1, 1)),
                ("AAA", d(2024, 1, 3)),
                ("BBB", d(2024, 1, 2)),
            ]
        );
    }
}
