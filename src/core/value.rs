// Column datatypes and the typed values produced by casting raw cells.
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Serialize, Serializer};
use time::format_description::{self, BorrowedFormatItem};
use time::{Date, PrimitiveDateTime};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Datatype {
    String,
    Integer,
    Date,
    Float,
}

impl Datatype {
    pub fn as_str(self) -> &'static str {
        match self {
            Datatype::String => ":string",
            Datatype::Integer => ":integer",
            Datatype::Date => ":date",
            Datatype::Float => ":float",
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ":string" => Ok(Datatype::String),
            ":integer" => Ok(Datatype::Integer),
            ":date" => Ok(Datatype::Date),
            ":float" => Ok(Datatype::Float),
            other => Err(Error::new(ErrorKind::SchemaParse)
                .with_message(format!("unknown datatype: {other}"))
                .with_hint("Use one of :string, :integer, :date, :float.")),
        }
    }
}

/// A cell value after casting per its field's datatype.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Date(PrimitiveDateTime),
    String(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<PrimitiveDateTime> {
        match self {
            Value::Date(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Cast a raw cell to `datatype`. Empty cells are the caller's concern.
    pub(crate) fn cast(raw: &str, datatype: Datatype) -> Result<Self, Error> {
        match datatype {
            Datatype::Integer => raw.trim().parse::<i64>().map(Value::Integer).map_err(|err| {
                Error::new(ErrorKind::InvalidValue)
                    .with_message(format!("invalid integer: {raw:?}"))
                    .with_source(err)
            }),
            Datatype::Float => raw.trim().parse::<f64>().map(Value::Float).map_err(|err| {
                Error::new(ErrorKind::InvalidValue)
                    .with_message(format!("invalid float: {raw:?}"))
                    .with_source(err)
            }),
            Datatype::Date => Ok(match parse_datetime(raw) {
                Some(dt) => Value::Date(dt),
                None => Value::String(raw.to_string()),
            }),
            Datatype::String => Ok(Value::String(raw.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Date(dt) => match dt.format(display_format()) {
                Ok(text) => f.write_str(&text),
                Err(_) => Err(fmt::Error),
            },
            Value::String(s) => f.write_str(s),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::Date(_) => serializer.collect_str(self),
            Value::String(s) => serializer.serialize_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<PrimitiveDateTime> for Value {
    fn from(value: PrimitiveDateTime) -> Self {
        Value::Date(value)
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "[year]-[month padding:none]-[day padding:none] [hour padding:none]:[minute]:[second]",
    "[year]-[month padding:none]-[day padding:none]T[hour padding:none]:[minute]:[second]",
    "[year]-[month padding:none]-[day padding:none] [hour padding:none]:[minute]",
    "[day padding:none]-[month repr:short case_sensitive:false]-[year] [hour padding:none]:[minute]:[second]",
    "[day padding:none]-[month repr:short case_sensitive:false]-[year] [hour padding:none]:[minute]",
    "[day padding:none]-[month repr:short case_sensitive:false]-[year] ([hour padding:none]:[minute])",
];

const DATE_FORMATS: &[&str] = &[
    "[year]-[month padding:none]-[day padding:none]",
    "[day padding:none]-[month repr:short case_sensitive:false]-[year]",
    "[day padding:none].[month padding:none].[year]",
];

fn compiled(formats: &'static [&'static str]) -> Vec<Vec<BorrowedFormatItem<'static>>> {
    formats
        .iter()
        .filter_map(|text| format_description::parse_borrowed::<2>(text).ok())
        .collect()
}

fn datetime_formats() -> &'static [Vec<BorrowedFormatItem<'static>>] {
    static FORMATS: OnceLock<Vec<Vec<BorrowedFormatItem<'static>>>> = OnceLock::new();
    FORMATS.get_or_init(|| compiled(DATETIME_FORMATS))
}

fn date_formats() -> &'static [Vec<BorrowedFormatItem<'static>>] {
    static FORMATS: OnceLock<Vec<Vec<BorrowedFormatItem<'static>>>> = OnceLock::new();
    FORMATS.get_or_init(|| compiled(DATE_FORMATS))
}

fn display_format() -> &'static [BorrowedFormatItem<'static>] {
    static FORMAT: OnceLock<Vec<BorrowedFormatItem<'static>>> = OnceLock::new();
    FORMAT.get_or_init(|| {
        format_description::parse_borrowed::<2>("[year]-[month]-[day] [hour]:[minute]:[second]")
            .unwrap_or_default()
    })
}

/// Parse the date spellings found in profiles (`28-may-2006`,
/// `2006-05-28 14:03:00`, ...). Returns `None` when nothing matches.
pub fn parse_datetime(raw: &str) -> Option<PrimitiveDateTime> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    for format in datetime_formats() {
        if let Ok(dt) = PrimitiveDateTime::parse(text, format) {
            return Some(dt);
        }
    }
    for format in date_formats() {
        if let Ok(date) = Date::parse(text, format) {
            return Some(date.midnight());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{
        DATE_FORMATS, DATETIME_FORMATS, Datatype, Value, date_formats, datetime_formats,
        display_format, parse_datetime,
    };
    use crate::core::error::ErrorKind;
    use time::{Date, Month};

    #[test]
    fn datatypes_round_trip_through_text() {
        for datatype in [
            Datatype::String,
            Datatype::Integer,
            Datatype::Date,
            Datatype::Float,
        ] {
            assert_eq!(datatype.as_str().parse::<Datatype>().unwrap(), datatype);
        }
        let err = ":position".parse::<Datatype>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaParse);
    }

    #[test]
    fn tsdb_dates_parse() {
        let expected = Date::from_calendar_date(2006, Month::May, 28)
            .unwrap()
            .midnight();
        assert_eq!(parse_datetime("28-may-2006"), Some(expected));
        assert_eq!(parse_datetime("28-MAY-2006"), Some(expected));
        assert_eq!(parse_datetime("2006-05-28"), Some(expected));
        assert_eq!(parse_datetime("2006-05-28 00:00:00"), Some(expected));

        let with_time = parse_datetime("3-feb-2019 14:05").unwrap();
        assert_eq!(with_time.hour(), 14);
        assert_eq!(with_time.minute(), 5);
        assert_eq!(with_time.day(), 3);

        assert_eq!(parse_datetime("sometime last week"), None);
    }

    #[test]
    fn every_date_format_compiles() {
        assert_eq!(datetime_formats().len(), DATETIME_FORMATS.len());
        assert_eq!(date_formats().len(), DATE_FORMATS.len());
        assert!(!display_format().is_empty());

        let parenthesized = parse_datetime("3-feb-2019 (14:05)").unwrap();
        assert_eq!(parenthesized.hour(), 14);
        assert_eq!(parse_datetime("28.5.2006").unwrap().month(), Month::May);
    }

    #[test]
    fn date_cast_falls_back_to_raw_text() {
        let value = Value::cast("not a date", Datatype::Date).unwrap();
        assert_eq!(value, Value::String("not a date".to_string()));

        let value = Value::cast("28-may-2006", Datatype::Date).unwrap();
        assert_eq!(value.to_string(), "2006-05-28 00:00:00");
    }

    #[test]
    fn numeric_casts_reject_garbage() {
        assert_eq!(
            Value::cast("11", Datatype::Integer).unwrap(),
            Value::Integer(11)
        );
        assert_eq!(
            Value::cast("2.5", Datatype::Float).unwrap(),
            Value::Float(2.5)
        );
        let err = Value::cast("eleven", Datatype::Integer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn values_serialize_as_plain_json() {
        let values = vec![
            Value::Integer(3),
            Value::from("abc"),
            Value::cast("2006-05-28", Datatype::Date).unwrap(),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[3,"abc","2006-05-28 00:00:00"]"#);
    }
}
