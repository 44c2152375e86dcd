use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};

use crate::FieldValue;

/// The encodings a date cell may arrive in, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateEncoding {
    /// Already a typed date (published artifacts).
    Typed,
    /// `/Date(<epoch-millis>)/`, as emitted by ASP.NET JSON endpoints.
    EpochMillis,
    /// `YYYY-MM-DD`, optionally followed by a time part.
    Iso,
    /// `DD/MM/YYYY`, optionally followed by `HH:MM:SS`.
    DayFirst,
    /// `YYYYMMDD` as text or as an integer.
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedDate {
    Parsed {
        date: NaiveDate,
        encoding: DateEncoding,
    },
    Unparseable,
}

impl ParsedDate {
    pub fn date(self) -> Option<NaiveDate> {
        match self {
            ParsedDate::Parsed { date, .. } => Some(date),
            ParsedDate::Unparseable => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DateParser {
    offset: FixedOffset,
}

impl Default for DateParser {
    fn default() -> Self {
        Self::utc()
    }
}

impl DateParser {
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    /// Epoch timestamps are converted to a calendar date at this offset.
    pub fn with_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    /// Current calendar date at the parser's offset.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    pub fn parse(&self, value: &FieldValue) -> ParsedDate {
        match value {
            FieldValue::Date(date) => ParsedDate::Parsed {
                date: *date,
                encoding: DateEncoding::Typed,
            },
            FieldValue::Text(text) => self.parse_str(text),
            FieldValue::Int(i) if (10_000_000..=99_999_999).contains(i) => {
                parse_compact(&i.to_string())
            }
            _ => ParsedDate::Unparseable,
        }
    }

    pub fn parse_str(&self, raw: &str) -> ParsedDate {
        let text = raw.trim();
        if text.is_empty() {
            return ParsedDate::Unparseable;
        }

        if let Some(date) = self.parse_epoch_millis(text) {
            return ParsedDate::Parsed {
                date,
                encoding: DateEncoding::EpochMillis,
            };
        }
        if let Some(date) = parse_leading(text, "%Y-%m-%d", &['T', ' ']) {
            return ParsedDate::Parsed {
                date,
                encoding: DateEncoding::Iso,
            };
        }
        if let Some(date) = parse_leading(text, "%d/%m/%Y", &[' ']) {
            return ParsedDate::Parsed {
                date,
                encoding: DateEncoding::DayFirst,
            };
        }
        parse_compact(text)
    }

    fn parse_epoch_millis(&self, text: &str) -> Option<NaiveDate> {
        let inner = text.strip_prefix("/Date(")?.strip_suffix(")/")?;
        let digits_end = inner
            .char_indices()
            .find(|(idx, c)| !(c.is_ascii_digit() || (*idx == 0 && *c == '-')))
            .map(|(idx, _)| idx)
            .unwrap_or(inner.len());
        let millis: i64 = inner[..digits_end].parse().ok()?;
        let instant = DateTime::from_timestamp_millis(millis)?;
        Some(instant.with_timezone(&self.offset).date_naive())
    }
}

/// Parse `fmt` from the start of `text`, accepting either an exact match or a
/// match followed by one of `separators` and a time part that is ignored.
fn parse_leading(text: &str, fmt: &str, separators: &[char]) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
        return Some(date);
    }
    let (head, _) = text.split_once(|c| separators.contains(&c))?;
    NaiveDate::parse_from_str(head, fmt).ok()
}

fn parse_compact(text: &str) -> ParsedDate {
    if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return ParsedDate::Unparseable;
    }
    match NaiveDate::parse_from_str(text, "%Y%m%d") {
        Ok(date) => ParsedDate::Parsed {
            date,
            encoding: DateEncoding::Compact,
        },
        Err(_) => ParsedDate::Unparseable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn parsed(date: NaiveDate, encoding: DateEncoding) -> ParsedDate {
        ParsedDate::Parsed { date, encoding }
    }

    #[test]
    fn encodings_are_recognised() {
        let parser = DateParser::utc();
        assert_eq!(
            parser.parse_str("/Date(1705276800000)/"),
            parsed(d(2024, 1, 15), DateEncoding::EpochMillis)
        );
        assert_eq!(parser.parse_str("2024-01-15"), parsed(d(2024, 1, 15), DateEncoding::Iso));
        assert_eq!(
            parser.parse_str("2024-01-15T00:00:00"),
            parsed(d(2024, 1, 15), DateEncoding::Iso)
        );
        assert_eq!(parser.parse_str("15/01/2024"), parsed(d(2024, 1, 15), DateEncoding::DayFirst));
        assert_eq!(
            parser.parse_str("15/01/2024 14:30:00"),
            parsed(d(2024, 1, 15), DateEncoding::DayFirst)
        );
        assert_eq!(parser.parse_str("20240115"), parsed(d(2024, 1, 15), DateEncoding::Compact));
        assert_eq!(
            parser.parse(&FieldValue::Int(20240115)),
            parsed(d(2024, 1, 15), DateEncoding::Compact)
        );
        assert_eq!(
            parser.parse(&FieldValue::Date(d(2024, 1, 15))),
            parsed(d(2024, 1, 15), DateEncoding::Typed)
        );
    }

    #[test]
    fn epoch_millis_respects_offset() {
        // 2024-01-14T17:00:00Z is local midnight at UTC+7.
        let text = "/Date(1705251600000)/";
        assert_eq!(DateParser::utc().parse_str(text).date(), Some(d(2024, 1, 14)));
        let plus_seven = DateParser::with_offset_minutes(7 * 60).unwrap();
        assert_eq!(plus_seven.parse_str(text).date(), Some(d(2024, 1, 15)));
    }

    #[test]
    fn epoch_millis_ignores_trailing_zone_suffix() {
        let parser = DateParser::utc();
        assert_eq!(
            parser.parse_str("/Date(1705276800000+0700)/").date(),
            Some(d(2024, 1, 15))
        );
    }

    #[test]
    fn garbage_is_unparseable() {
        let parser = DateParser::utc();
        for text in ["", "  ", "yesterday", "/Date(abc)/", "32/01/2024", "2024-13-01", "2024011"] {
            assert_eq!(parser.parse_str(text), ParsedDate::Unparseable, "{text}");
        }
        assert_eq!(parser.parse(&FieldValue::Float(20240115.0)), ParsedDate::Unparseable);
        assert_eq!(parser.parse(&FieldValue::Null), ParsedDate::Unparseable);
        assert_eq!(parser.parse(&FieldValue::Int(42)), ParsedDate::Unparseable);
    }
}
