//! Purpose: Relational operations over rows: projection, grouping, joins, data specifiers.
//! Exports: `SelectMode`, `Selected`, `select_rows`, `match_rows`, `JoinHow`, `join`,
//! `parse_data_specifier`, `split_columns`.
//! Role: Shared by `Table::select`, `TestSuite::select`/`join` and the CLI.
//! Invariants: Join pivots are sorted; pivot columns appear once, unprefixed, in the result.
//! Invariants: Projection never reads a column by position from a name-aware row.
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::Serialize;

use crate::core::codec::{FIELD_DELIMITER, encode_row};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::relations::Relation;
use crate::core::row::RowAccess;
use crate::core::table::Table;
use crate::core::value::Value;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SelectMode {
    #[default]
    List,
    Dict,
    Row,
}

impl SelectMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectMode::List => "list",
            SelectMode::Dict => "dict",
            SelectMode::Row => "row",
        }
    }
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "list" => Ok(SelectMode::List),
            "dict" => Ok(SelectMode::Dict),
            "row" => Ok(SelectMode::Row),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid mode for select operation: {s}"))
                .with_hint("Valid options include: list, dict, row.")),
        }
    }
}

/// One projected row.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Selected {
    List(Vec<Option<Value>>),
    Dict(IndexMap<String, Option<Value>>),
    Row(String),
}

impl fmt::Display for Selected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selected::Row(line) => f.write_str(line),
            other => match serde_json::to_string(other) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

/// Project one row onto `cols`.
pub fn project_row<R, S>(row: &R, cols: &[S], mode: SelectMode, cast: bool) -> Result<Selected, Error>
where
    R: RowAccess + ?Sized,
    S: AsRef<str>,
{
    let data = cols
        .iter()
        .enumerate()
        .map(|(position, col)| row.column(col.as_ref(), position, cast))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(match mode {
        SelectMode::List => Selected::List(data),
        SelectMode::Dict => Selected::Dict(
            cols.iter()
                .map(|col| col.as_ref().to_string())
                .zip(data)
                .collect(),
        ),
        SelectMode::Row => {
            let texts: Vec<String> = data
                .iter()
                .map(|value| value.as_ref().map(Value::to_string).unwrap_or_default())
                .collect();
            Selected::Row(encode_row(&texts))
        }
    })
}

/// Project every row onto `cols`, stopping at the first failed row.
pub fn select_rows<I, R, S>(cols: &[S], rows: I, mode: SelectMode, cast: bool) -> Result<Vec<Selected>, Error>
where
    I: IntoIterator<Item = Result<R, Error>>,
    R: RowAccess,
    S: AsRef<str>,
{
    rows.into_iter()
        .map(|row| project_row(&row?, cols, mode, cast))
        .collect()
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum SortKey {
    Number(i64),
    Text(String),
}

fn sort_key(value: &Value) -> SortKey {
    match value {
        Value::Integer(n) => SortKey::Number(*n),
        other => {
            let text = other.to_string();
            match text.trim().parse::<i64>() {
                Ok(n) => SortKey::Number(n),
                Err(_) => SortKey::Text(text),
            }
        }
    }
}

/// A group of rows from both sides sharing one `key` value.
pub type Matched = (Value, Vec<Record>, Vec<Record>);

/// Group two row sets by the cast value of column `key`.
///
/// Groups come in first-seen order, or sorted with numbers (in numeric
/// order) before other text when `sort_keys` is set.
pub fn match_rows<I1, I2>(rows1: I1, rows2: I2, key: &str, sort_keys: bool) -> Result<Vec<Matched>, Error>
where
    I1: IntoIterator<Item = Result<Record, Error>>,
    I2: IntoIterator<Item = Result<Record, Error>>,
{
    let mut groups: IndexMap<String, Matched> = IndexMap::new();
    let mut add = |record: Record, left: bool| -> Result<(), Error> {
        let value = record.get(key)?.ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!(
                "no column {key} in {} table",
                record.relation().name()
            ))
        })?;
        let group = groups
            .entry(value.to_string())
            .or_insert_with(|| (value, Vec::new(), Vec::new()));
        if left {
            group.1.push(record);
        } else {
            group.2.push(record);
        }
        Ok(())
    };
    for record in rows1 {
        add(record?, true)?;
    }
    for record in rows2 {
        add(record?, false)?;
    }

    let mut matched: Vec<Matched> = groups.into_values().collect();
    if sort_keys {
        matched.sort_by_key(|(value, _, _)| sort_key(value));
    }
    Ok(matched)
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum JoinHow {
    #[default]
    Inner,
    Left,
}

impl From<&str> for JoinHow {
    /// Anything but exactly `left` joins inner.
    fn from(how: &str) -> Self {
        if how == "left" {
            JoinHow::Left
        } else {
            JoinHow::Inner
        }
    }
}

impl fmt::Display for JoinHow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinHow::Inner => "inner",
            JoinHow::Left => "left",
        })
    }
}

/// Pivot columns for joining `left` with `right`, sorted.
fn join_pivot(on: Option<&[String]>, left: &Relation, right: &Relation) -> Result<Vec<String>, Error> {
    let mut pivots: Vec<String> = match on {
        Some(on) if !on.is_empty() => on.to_vec(),
        _ => {
            let right_keys = right.key_field_names();
            let shared: Vec<String> = left
                .key_field_names()
                .iter()
                .filter(|name| right_keys.contains(*name))
                .cloned()
                .collect();
            if shared.is_empty() {
                return Err(Error::new(ErrorKind::NoPath).with_message(format!(
                    "no shared key to join on in the {} and {} tables",
                    left.name(),
                    right.name()
                )));
            }
            shared
        }
    };
    pivots.sort();
    pivots.dedup();
    Ok(pivots)
}

fn pivot_values(record: &Record, pivots: &[String]) -> Result<Vec<String>, Error> {
    pivots
        .iter()
        .map(|pivot| {
            record
                .get(pivot)?
                .map(|value| value.to_string())
                .ok_or_else(|| {
                    Error::new(ErrorKind::NotFound).with_message(format!(
                        "join column {pivot} missing from {} table",
                        record.relation().name()
                    ))
                })
        })
        .collect()
}

/// Join two tables into a new detached table.
///
/// Without `on`, the pivots are the key fields both tables share.
/// Each left row is repeated once per matching right row; a left join
/// keeps unmatched left rows, padding the right columns with defaults.
pub fn join(left: &Table, right: &Table, on: Option<&[String]>, how: JoinHow) -> Result<Table, Error> {
    let pivots = join_pivot(on, left.relation(), right.relation())?;
    let relation = Rc::new(Relation::join(left.relation(), right.relation(), &pivots)?);

    let mut pivot_positions = Vec::with_capacity(pivots.len());
    for pivot in &pivots {
        let position = right.relation().index_of(pivot)?.ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!(
                "join column {pivot} missing from {} table",
                right.name()
            ))
        })?;
        pivot_positions.push(position);
    }

    let mut tails: HashMap<Vec<String>, Vec<Vec<String>>> = HashMap::new();
    for record in right.iter() {
        let record = record?;
        let key = pivot_values(&record, &pivots)?;
        let tail = record
            .into_raw()
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !pivot_positions.contains(i))
            .map(|(_, value)| value)
            .collect();
        tails.entry(key).or_default().push(tail);
    }

    let fill: Vec<String> = right
        .relation()
        .fields()
        .iter()
        .enumerate()
        .filter(|(i, _)| !pivot_positions.contains(i))
        .map(|(_, field)| field.default_value().to_string())
        .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in left.iter() {
        let record = record?;
        let key = pivot_values(&record, &pivots)?;
        let matches = match tails.get(&key) {
            Some(matches) => matches.as_slice(),
            None if how == JoinHow::Left => std::slice::from_ref(&fill),
            None => continue,
        };
        for tail in matches {
            let mut row = record.raw_values().to_vec();
            row.extend(tail.iter().cloned());
            rows.push(row);
        }
    }
    Table::with_rows(relation, rows)
}

/// Split a data specifier into its table and column parts.
///
/// `item` → `(Some("item"), None)`, `item:i-input@i-wf` →
/// `(Some("item"), Some([i-input, i-wf]))`, `:i-input` →
/// `(None, Some([i-input]))`. Input that fits none of these shapes is
/// `(None, None)`.
pub fn parse_data_specifier(spec: &str) -> (Option<String>, Option<Vec<String>>) {
    let Some((table, cols)) = spec.split_once(':') else {
        if spec.is_empty() {
            return (None, None);
        }
        return (Some(spec.trim().to_string()), None);
    };
    if cols.is_empty() {
        return (None, None);
    }
    let table = (!table.is_empty()).then(|| table.trim().to_string());
    (table, Some(split_columns(cols)))
}

/// Split an `@`-joined column list, trimming each column.
pub fn split_columns(cols: &str) -> Vec<String> {
    let cols = cols.trim_start_matches(':');
    if cols.is_empty() {
        return Vec::new();
    }
    cols.split(FIELD_DELIMITER)
        .map(|col| col.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        JoinHow, SelectMode, Selected, join, match_rows, parse_data_specifier, select_rows,
        split_columns,
    };
    use crate::core::error::ErrorKind;
    use crate::core::relations::{Field, Relation};
    use crate::core::table::Table;
    use crate::core::value::{Datatype, Value};
    use std::rc::Rc;

    fn table(name: &str, other: &str, rows: Vec<Vec<&str>>) -> Table {
        let relation = Relation::new(
            name,
            vec![
                Field::key("id", Datatype::Integer),
                Field::plain(other, Datatype::String),
            ],
        )
        .unwrap();
        Table::with_rows(Rc::new(relation), rows).unwrap()
    }

    fn left() -> Table {
        table("t1", "a", vec![vec!["1", "x"], vec!["2", "y"]])
    }

    fn right() -> Table {
        table("t2", "b", vec![vec!["1", "p"], vec!["1", "q"]])
    }

    #[test]
    fn inner_join_expands_and_drops() {
        let on = vec!["id".to_string()];
        let joined = join(&left(), &right(), Some(&on), JoinHow::Inner).unwrap();
        assert_eq!(joined.name(), "t1+t2");
        assert_eq!(joined.relation().field_names(), ["id", "t1:a", "t2:b"]);
        let rows: Vec<Vec<String>> = joined
            .records()
            .unwrap()
            .into_iter()
            .map(|record| record.into_raw())
            .collect();
        assert_eq!(rows, [["1", "x", "p"], ["1", "x", "q"]]);
    }

    #[test]
    fn left_join_pads_with_defaults() {
        let joined = join(&left(), &right(), None, JoinHow::from("left")).unwrap();
        assert_eq!(joined.len(), 3);
        let last = joined.get(-1).unwrap();
        assert_eq!(last.get("id").unwrap(), Some(Value::Integer(2)));
        assert_eq!(last.get("b").unwrap(), Some(Value::from("")));
        assert_eq!(last.get("t2:b").unwrap(), Some(Value::from("")));
    }

    #[test]
    fn unknown_join_method_joins_inner() {
        let joined = join(&left(), &right(), None, JoinHow::from("outer")).unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(JoinHow::from("LEFT"), JoinHow::Inner);
        assert_eq!(JoinHow::from("left"), JoinHow::Left);
    }

    #[test]
    fn default_pivots_are_shared_keys_only() {
        let relation = |name: &str| {
            Relation::new(
                name,
                vec![
                    Field::key("id", Datatype::Integer),
                    Field::plain("note", Datatype::String),
                ],
            )
            .unwrap()
        };
        let t1 = Table::with_rows(Rc::new(relation("t1")), vec![vec!["1", "same"]]).unwrap();
        let t2 = Table::with_rows(Rc::new(relation("t2")), vec![vec!["1", "other"]]).unwrap();
        let joined = join(&t1, &t2, None, JoinHow::Inner).unwrap();
        assert_eq!(joined.relation().field_names(), ["id", "t1:note", "t2:note"]);
        assert_eq!(joined.len(), 1);

        let unkeyed = Table::new(Rc::new(
            Relation::new("t3", vec![Field::plain("id", Datatype::Integer)]).unwrap(),
        ));
        assert_eq!(join(&t1, &unkeyed, None, JoinHow::Inner).unwrap_err().kind(), ErrorKind::NoPath);
    }

    #[test]
    fn join_requires_a_shared_column() {
        let a = Table::new(Rc::new(
            Relation::new("a", vec![Field::key("x", Datatype::Integer)]).unwrap(),
        ));
        let b = Table::new(Rc::new(
            Relation::new("b", vec![Field::key("y", Datatype::Integer)]).unwrap(),
        ));
        assert_eq!(join(&a, &b, None, JoinHow::Inner).unwrap_err().kind(), ErrorKind::NoPath);
        assert_eq!(join(&a, &a, None, JoinHow::Inner).unwrap_err().kind(), ErrorKind::Usage);
    }

    #[test]
    fn select_modes() {
        let t = left();
        let cols = ["a", "id"];
        let dict = select_rows(&cols, t.iter(), SelectMode::Dict, true).unwrap();
        assert_eq!(dict[1].to_string(), r#"{"a":"y","id":2}"#);
        let rows = select_rows(&cols, t.iter(), SelectMode::Row, true).unwrap();
        assert_eq!(rows[0], Selected::Row("x@1".into()));

        let plain = vec![Ok(vec!["10".to_string(), "1".to_string()])];
        let list = select_rows(&["i-id", "i-wf"], plain, SelectMode::List, true).unwrap();
        assert_eq!(list[0].to_string(), r#"["10","1"]"#);
        assert_eq!("DICT".parse::<SelectMode>().unwrap(), SelectMode::Dict);
        assert_eq!("table".parse::<SelectMode>().unwrap_err().kind(), ErrorKind::Usage);
    }

    #[test]
    fn match_rows_groups_by_value() {
        let l = table("t1", "a", vec![vec!["10", "x"], vec!["9", "y"], vec!["10", "z"]]);
        let r = table("t2", "b", vec![vec!["9", "p"], vec!["11", "q"]]);
        let matched = match_rows(l.iter(), r.iter(), "id", true).unwrap();
        let summary: Vec<(i64, usize, usize)> = matched
            .iter()
            .map(|(value, a, b)| (value.as_i64().unwrap(), a.len(), b.len()))
            .collect();
        assert_eq!(summary, [(9, 1, 1), (10, 2, 0), (11, 0, 1)]);

        let unsorted = match_rows(l.iter(), r.iter(), "id", false).unwrap();
        assert_eq!(unsorted[0].0, Value::Integer(10));
        assert!(match_rows(l.iter(), r.iter(), "nope", false).is_err());
    }

    #[test]
    fn data_specifiers() {
        let cols = |names: &[&str]| Some(names.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        assert_eq!(parse_data_specifier("item"), (Some("item".into()), None));
        assert_eq!(parse_data_specifier("item:i-input"), (Some("item".into()), cols(&["i-input"])));
        assert_eq!(
            parse_data_specifier("item:i-input@i-wf"),
            (Some("item".into()), cols(&["i-input", "i-wf"]))
        );
        assert_eq!(parse_data_specifier(":i-input"), (None, cols(&["i-input"])));
        assert_eq!(parse_data_specifier(" item : a @ b "), (Some("item".into()), cols(&["a", "b"])));
        assert_eq!(parse_data_specifier(""), (None, None));
        assert_eq!(parse_data_specifier("item:"), (None, None));
        assert_eq!(split_columns("::a@b"), ["a", "b"]);
        assert!(split_columns("").is_empty());
    }
}
