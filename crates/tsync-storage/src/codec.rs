use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow_array::types::{
    ArrowPrimitiveType, Date32Type, Date64Type, Float32Type, Float64Type, Int16Type, Int32Type,
    Int64Type, Int8Type, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, LargeStringArray,
    PrimitiveArray, RecordBatch, StringArray,
};
use arrow_schema::{ArrowError, DataType, Field, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::errors::ParquetError;
use thiserror::Error;
use tracing::warn;
use tsync_core::{ColumnLayout, FieldValue, Record, Row};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing required column `{0}`")]
    MissingColumn(String),
    #[error("column `{column}` holds a null entity key")]
    NullEntity { column: String },
    #[error(transparent)]
    Arrow(#[from] ArrowError),
    #[error(transparent)]
    Parquet(#[from] ParquetError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Int,
    Float,
    Date,
    Text,
}

impl ColumnKind {
    fn of(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Null => None,
            FieldValue::Bool(_) => Some(ColumnKind::Bool),
            FieldValue::Int(_) => Some(ColumnKind::Int),
            FieldValue::Float(_) => Some(ColumnKind::Float),
            FieldValue::Date(_) => Some(ColumnKind::Date),
            FieldValue::Text(_) => Some(ColumnKind::Text),
        }
    }

    fn widen(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnKind::Int, ColumnKind::Float) | (ColumnKind::Float, ColumnKind::Int) => {
                ColumnKind::Float
            }
            _ => ColumnKind::Text,
        }
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Bool => DataType::Boolean,
            ColumnKind::Int => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Date => DataType::Date32,
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

/// Reads and writes record tables as Parquet bytes.
///
/// The entity column is always written first as non-null `Utf8`. Every other
/// column's type is inferred from its values: integers stay `Int64` unless a
/// float shows up, dates become `Date32`, and mixed columns fall back to text.
#[derive(Debug, Clone)]
pub struct TableCodec {
    layout: ColumnLayout,
}

impl TableCodec {
    pub fn new(layout: ColumnLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    /// Encode merged rows with a typed date column in second position.
    pub fn encode_rows(&self, rows: &[Row]) -> Result<Vec<u8>, CodecError> {
        let records: Vec<Record> = rows
            .iter()
            .cloned()
            .map(|row| row.into_record(&self.layout.date_column))
            .collect();
        self.encode_table(&records, true)
    }

    /// Encode raw records as-is; the date column keeps whatever encoding the source used.
    pub fn encode_records(&self, records: &[Record]) -> Result<Vec<u8>, CodecError> {
        self.encode_table(records, false)
    }

    fn encode_table(&self, records: &[Record], date_first: bool) -> Result<Vec<u8>, CodecError> {
        let mut names: BTreeSet<&str> = BTreeSet::new();
        for record in records {
            names.extend(record.fields.keys().map(String::as_str));
        }
        names.remove(self.layout.entity_column.as_str());

        let mut ordered: Vec<&str> = Vec::with_capacity(names.len());
        if date_first && names.remove(self.layout.date_column.as_str()) {
            ordered.push(self.layout.date_column.as_str());
        }
        ordered.extend(names);

        let mut fields = vec![Field::new(&self.layout.entity_column, DataType::Utf8, false)];
        let mut columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(
            records.iter().map(|r| r.entity.as_str()).collect::<Vec<_>>(),
        ))];

        for name in ordered {
            let cells: Vec<&FieldValue> = records
                .iter()
                .map(|r| r.fields.get(name).unwrap_or(&FieldValue::Null))
                .collect();
            let kind = cells
                .iter()
                .filter_map(|v| ColumnKind::of(v))
                .reduce(ColumnKind::widen)
                .unwrap_or(ColumnKind::Text);
            fields.push(Field::new(name, kind.data_type(), true));
            columns.push(build_column(kind, &cells));
        }

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
        let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)?;
        writer.write(&batch)?;
        Ok(writer.into_inner()?)
    }

    /// Decode a table into records. Columns of a type with no `FieldValue`
    /// counterpart are skipped with a warning.
    pub fn decode_records(&self, bytes: Vec<u8>) -> Result<Vec<Record>, CodecError> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?;
        let schema = builder.schema().clone();
        let entity_idx = schema
            .index_of(&self.layout.entity_column)
            .map_err(|_| CodecError::MissingColumn(self.layout.entity_column.clone()))?;

        let mut records = Vec::new();
        for batch in builder.build()? {
            let batch = batch?;
            let entities = column_cells(batch.column(entity_idx))
                .ok_or_else(|| CodecError::MissingColumn(self.layout.entity_column.clone()))?;
            let mut rows: Vec<BTreeMap<String, FieldValue>> =
                vec![BTreeMap::new(); batch.num_rows()];

            for (idx, field) in schema.fields().iter().enumerate() {
                if idx == entity_idx {
                    continue;
                }
                let Some(cells) = column_cells(batch.column(idx)) else {
                    warn!(
                        column = %field.name(),
                        data_type = %field.data_type(),
                        "skipping column with unsupported type"
                    );
                    continue;
                };
                for (row, cell) in rows.iter_mut().zip(cells) {
                    row.insert(field.name().clone(), cell);
                }
            }

            for (entity, fields) in entities.into_iter().zip(rows) {
                let entity = entity.as_text().ok_or_else(|| CodecError::NullEntity {
                    column: self.layout.entity_column.clone(),
                })?;
                records.push(Record { entity, fields });
            }
        }
        Ok(records)
    }

    /// Distinct entity keys in a table, reading only the entity column.
    pub fn read_entities(&self, bytes: Vec<u8>) -> Result<BTreeSet<String>, CodecError> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?;
        let entity_idx = builder
            .schema()
            .index_of(&self.layout.entity_column)
            .map_err(|_| CodecError::MissingColumn(self.layout.entity_column.clone()))?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [entity_idx]);

        let mut entities = BTreeSet::new();
        for batch in builder.with_projection(mask).build()? {
            let batch = batch?;
            let cells = column_cells(batch.column(0))
                .ok_or_else(|| CodecError::MissingColumn(self.layout.entity_column.clone()))?;
            entities.extend(cells.iter().filter_map(FieldValue::as_text));
        }
        Ok(entities)
    }
}

fn build_column(kind: ColumnKind, cells: &[&FieldValue]) -> ArrayRef {
    match kind {
        ColumnKind::Bool => Arc::new(BooleanArray::from(
            cells
                .iter()
                .map(|v| match v {
                    FieldValue::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Int => Arc::new(Int64Array::from(
            cells
                .iter()
                .map(|v| match v {
                    FieldValue::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Float => Arc::new(Float64Array::from(
            cells
                .iter()
                .map(|v| match v {
                    FieldValue::Int(i) => Some(*i as f64),
                    FieldValue::Float(f) => Some(*f),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Date => Arc::new(Date32Array::from(
            cells
                .iter()
                .map(|v| match v {
                    FieldValue::Date(d) => i32::try_from((*d - unix_epoch()).num_days()).ok(),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Text => Arc::new(cells.iter().map(|v| v.as_text()).collect::<StringArray>()),
    }
}

fn unix_epoch() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

fn primitive_cells<T, F>(array: &ArrayRef, convert: F) -> Option<Vec<FieldValue>>
where
    T: ArrowPrimitiveType,
    F: Fn(T::Native) -> Option<FieldValue>,
{
    let array = array.as_any().downcast_ref::<PrimitiveArray<T>>()?;
    Some(
        (0..array.len())
            .map(|i| {
                if array.is_null(i) {
                    FieldValue::Null
                } else {
                    convert(array.value(i)).unwrap_or(FieldValue::Null)
                }
            })
            .collect(),
    )
}

fn date_from_instant(instant: Option<DateTime<Utc>>) -> Option<FieldValue> {
    instant.map(|t| FieldValue::Date(t.date_naive()))
}

/// Convert one Arrow column to cells, or `None` for an unsupported type.
fn column_cells(array: &ArrayRef) -> Option<Vec<FieldValue>> {
    match array.data_type() {
        DataType::Null => Some(vec![FieldValue::Null; array.len()]),
        DataType::Utf8 => {
            let array = array.as_any().downcast_ref::<StringArray>()?;
            Some(
                array
                    .iter()
                    .map(|v| v.map_or(FieldValue::Null, |s| FieldValue::Text(s.to_string())))
                    .collect(),
            )
        }
        DataType::LargeUtf8 => {
            let array = array.as_any().downcast_ref::<LargeStringArray>()?;
            Some(
                array
                    .iter()
                    .map(|v| v.map_or(FieldValue::Null, |s| FieldValue::Text(s.to_string())))
                    .collect(),
            )
        }
        DataType::Boolean => {
            let array = array.as_any().downcast_ref::<BooleanArray>()?;
            Some(
                array
                    .iter()
                    .map(|v| v.map_or(FieldValue::Null, FieldValue::Bool))
                    .collect(),
            )
        }
        DataType::Int8 => primitive_cells::<Int8Type, _>(array, |v| Some(FieldValue::Int(v.into()))),
        DataType::Int16 => {
            primitive_cells::<Int16Type, _>(array, |v| Some(FieldValue::Int(v.into())))
        }
        DataType::Int32 => {
            primitive_cells::<Int32Type, _>(array, |v| Some(FieldValue::Int(v.into())))
        }
        DataType::Int64 => primitive_cells::<Int64Type, _>(array, |v| Some(FieldValue::Int(v))),
        DataType::UInt8 => {
            primitive_cells::<UInt8Type, _>(array, |v| Some(FieldValue::Int(v.into())))
        }
        DataType::UInt16 => {
            primitive_cells::<UInt16Type, _>(array, |v| Some(FieldValue::Int(v.into())))
        }
        DataType::UInt32 => {
            primitive_cells::<UInt32Type, _>(array, |v| Some(FieldValue::Int(v.into())))
        }
        DataType::UInt64 => primitive_cells::<UInt64Type, _>(array, |v| {
            Some(match i64::try_from(v) {
                Ok(i) => FieldValue::Int(i),
                Err(_) => FieldValue::Float(v as f64),
            })
        }),
        DataType::Float32 => {
            primitive_cells::<Float32Type, _>(array, |v| Some(FieldValue::Float(v.into())))
        }
        DataType::Float64 => {
            primitive_cells::<Float64Type, _>(array, |v| Some(FieldValue::Float(v)))
        }
        DataType::Date32 => primitive_cells::<Date32Type, _>(array, |days| {
            unix_epoch()
                .checked_add_signed(chrono::Duration::days(days.into()))
                .map(FieldValue::Date)
        }),
        DataType::Date64 => primitive_cells::<Date64Type, _>(array, |ms| {
            date_from_instant(DateTime::from_timestamp_millis(ms))
        }),
        DataType::Timestamp(TimeUnit::Second, _) => {
            primitive_cells::<TimestampSecondType, _>(array, |s| {
                date_from_instant(DateTime::from_timestamp(s, 0))
            })
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            primitive_cells::<TimestampMillisecondType, _>(array, |ms| {
                date_from_instant(DateTime::from_timestamp_millis(ms))
            })
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            primitive_cells::<TimestampMicrosecondType, _>(array, |us| {
                date_from_instant(DateTime::from_timestamp_micros(us))
            })
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            primitive_cells::<TimestampNanosecondType, _>(array, |ns| {
                date_from_instant(Some(DateTime::from_timestamp_nanos(ns)))
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::TimestampNanosecondArray;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn codec() -> TableCodec {
        TableCodec::new(ColumnLayout::default())
    }

    fn row(entity: &str, date: NaiveDate, close: FieldValue) -> Row {
        let mut fields = BTreeMap::new();
        fields.insert("close".to_string(), close);
        Row {
            entity: entity.to_string(),
            date,
            fields,
        }
    }

    #[test]
    fn rows_decode_with_typed_dates_and_widened_numbers() {
        let rows = vec![
            row("AAA", d(2024, 1, 10), FieldValue::Int(10)),
            row("AAA", d(2024, 1, 11), FieldValue::Float(10.5)),
            row("BBB", d(2024, 1, 11), FieldValue::Null),
        ];
        let bytes = codec().encode_rows(&rows).expect("encode");
        let records = codec().decode_records(bytes).expect("decode");

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].entity, "AAA");
        assert_eq!(records[0].fields["date"], FieldValue::Date(d(2024, 1, 10)));
        assert_eq!(records[0].fields["close"], FieldValue::Float(10.0));
        assert_eq!(records[1].fields["close"], FieldValue::Float(10.5));
        assert!(records[2].fields["close"].is_null());
    }

    #[test]
    fn records_keep_raw_date_text_and_missing_fields_become_null() {
        let records = vec![
            Record::new("AAA").with_field("ngay", FieldValue::Text("/Date(1705276800000)/".into())),
            Record::new("BBB").with_field("volume", FieldValue::Int(7)),
        ];
        let bytes = codec().encode_records(&records).expect("encode");
        let decoded = codec().decode_records(bytes).expect("decode");

        assert_eq!(
            decoded[0].fields["ngay"],
            FieldValue::Text("/Date(1705276800000)/".into())
        );
        assert!(decoded[0].fields["volume"].is_null());
        assert_eq!(decoded[1].fields["volume"], FieldValue::Int(7));
    }

    #[test]
    fn mixed_kinds_fall_back_to_text() {
        let records = vec![
            Record::new("AAA").with_field("flag", FieldValue::Bool(true)),
            Record::new("BBB").with_field("flag", FieldValue::Int(3)),
        ];
        let bytes = codec().encode_records(&records).expect("encode");
        let decoded = codec().decode_records(bytes).expect("decode");
        assert_eq!(decoded[0].fields["flag"], FieldValue::Text("true".into()));
        assert_eq!(decoded[1].fields["flag"], FieldValue::Text("3".into()));
    }

    #[test]
    fn timestamp_columns_read_as_dates() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("ticker", DataType::Utf8, false),
            Field::new("date", DataType::Timestamp(TimeUnit::Nanosecond, None), true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["AAA"])),
                Arc::new(TimestampNanosecondArray::from(vec![Some(1_705_276_800_000_000_000)])),
            ],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        let bytes = writer.into_inner().unwrap();

        let decoded = codec().decode_records(bytes).expect("decode");
        assert_eq!(decoded[0].fields["date"], FieldValue::Date(d(2024, 1, 15)));
    }

    #[test]
    fn entity_set_is_read_from_projection() {
        let records = vec![
            Record::new("BBB").with_field("x", FieldValue::Int(1)),
            Record::new("AAA").with_field("x", FieldValue::Int(2)),
            Record::new("BBB").with_field("x", FieldValue::Int(3)),
        ];
        let bytes = codec().encode_records(&records).expect("encode");
        let entities = codec().read_entities(bytes).expect("entities");
        assert_eq!(entities.into_iter().collect::<Vec<_>>(), vec!["AAA", "BBB"]);
    }

    #[test]
    fn missing_entity_column_and_garbage_are_errors() {
        let other = TableCodec::new(ColumnLayout {
            entity_column: "symbol".to_string(),
            date_column: "date".to_string(),
        });
        let bytes = codec()
            .encode_records(&[Record::new("AAA")])
            .expect("encode");
        assert!(matches!(
            other.decode_records(bytes),
            Err(CodecError::MissingColumn(column)) if column == "symbol"
        ));
        assert!(codec().decode_records(b"not parquet".to_vec()).is_err());
        assert!(codec().decode_records(Vec::new()).is_err());
    }
}
