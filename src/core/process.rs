//! Purpose: Batch pipeline feeding selected rows through a processor into suite tables.
//! Exports: `Processor`, `FieldMapper`, `ProcessSource`, `ProcessOptions`, `ProcessOutcome`,
//! `DEFAULT_TASK_SELECTORS`.
//! Role: `TestSuite::process`; the processor and the field mapper are supplied by callers.
//! Invariants: Affected tables are emptied (and flushed on disk) before the first item.
//! Invariants: Mapped rows only keep the columns their table defines.
//! Invariants: Disk-backed suites write every affected table once more at the end.
use std::rc::Rc;

use tracing::{debug, info};

use crate::core::codec::encode_row;
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::relations::Relation;
use crate::core::row::RowMap;
use crate::core::select::{SelectMode, Selected, parse_data_specifier};
use crate::core::suite::TestSuite;
use crate::core::table::{Table, WriteOptions};
use crate::core::value::Value;

/// Input column used when no selector is given, by processor task.
pub const DEFAULT_TASK_SELECTORS: &[(&str, &str)] = &[
    ("parse", "item:i-input"),
    ("transfer", "result:mrs"),
    ("generate", "result:mrs"),
];

/// Something that turns one input datum into a response.
pub trait Processor {
    type Response;

    /// Task name used to look up a default selector (e.g. `parse`).
    fn task(&self) -> &str;

    /// Process `datum`; `keys` holds the key columns of its row.
    fn process_item(&mut self, datum: &Value, keys: &RowMap) -> Result<Self::Response, Error>;
}

/// Maps processor responses to rows of suite tables.
pub trait FieldMapper<R> {
    /// Tables this mapper may write to.
    fn affected_tables(&self) -> Vec<String>;

    /// `(table, row)` pairs for one response.
    fn map(&mut self, response: &R) -> Result<Vec<(String, RowMap)>, Error>;

    /// Rows still buffered after the last response.
    fn cleanup(&mut self) -> Result<Vec<(String, RowMap)>, Error>;
}

/// Where input rows come from.
#[derive(Default)]
pub enum ProcessSource<'a> {
    /// The suite being written to.
    #[default]
    Target,
    Suite(&'a mut TestSuite),
    Table(&'a Table),
}

#[derive(Clone, Debug)]
pub struct ProcessOptions {
    /// Data specifier naming one input column; see [`DEFAULT_TASK_SELECTORS`].
    pub selector: Option<String>,
    pub gzip: Option<bool>,
    /// Commit a table once it holds more unsynced rows than this;
    /// `None` keeps output in memory until the end.
    pub buffer_size: Option<usize>,
    pub task_selectors: Vec<(String, String)>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            selector: None,
            gzip: None,
            buffer_size: Some(1000),
            task_selectors: DEFAULT_TASK_SELECTORS
                .iter()
                .map(|(task, selector)| (task.to_string(), selector.to_string()))
                .collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProcessOutcome {
    /// Input rows passed to the processor.
    pub items: usize,
    /// Rows added to tables, cleanup included.
    pub rows: usize,
}

struct SourceRows {
    key_cols: Vec<String>,
    rows: Vec<Selected>,
}

impl TestSuite {
    /// Run `processor` over the selected input rows, storing what `mapper` makes of
    /// each response.
    pub fn process<P, M>(
        &mut self,
        processor: &mut P,
        mapper: &mut M,
        source: ProcessSource<'_>,
        options: &ProcessOptions,
    ) -> Result<ProcessOutcome, Error>
    where
        P: Processor,
        M: FieldMapper<P::Response>,
    {
        let selector = match &options.selector {
            Some(selector) => selector.clone(),
            None => options
                .task_selectors
                .iter()
                .find(|(task, _)| task == processor.task())
                .map(|(_, selector)| selector.clone())
                .ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("no default selector for task {}", processor.task()))
                        .with_hint("Pass a selector such as `item:i-input`.")
                })?,
        };
        let (table, column) = selector_parts(&selector)?;
        let buffer_size = if self.path().is_some() {
            options.buffer_size
        } else {
            None
        };

        let affected: Vec<String> = {
            let wanted = mapper.affected_tables();
            self.relations()
                .names()
                .filter(|name| wanted.iter().any(|table| table == *name))
                .map(str::to_string)
                .collect()
        };
        self.prepare_targets(&affected, buffer_size)?;

        let input = match source {
            ProcessSource::Target => read_suite_source(self, table, &column)?,
            ProcessSource::Suite(suite) => read_suite_source(suite, table, &column)?,
            ProcessSource::Table(table) => read_table_source(table, &column)?,
        };
        debug!(selector = %selector, items = input.rows.len(), "processing");

        let mut outcome = ProcessOutcome::default();
        for selected in input.rows {
            let Selected::List(mut values) = selected else {
                continue;
            };
            let datum = values.pop().flatten().unwrap_or_else(|| Value::String(String::new()));
            let keys: RowMap = input
                .key_cols
                .iter()
                .zip(&values)
                .filter_map(|(name, value)| value.clone().map(|value| (name.clone(), value)))
                .collect();
            let response = processor.process_item(&datum, &keys)?;
            let mapped = mapper.map(&response)?;
            let key_text: Vec<String> = values
                .iter()
                .map(|value| value.as_ref().map(Value::to_string).unwrap_or_default())
                .collect();
            info!(item = %encode_row(&key_text), rows = mapped.len(), "processed item");
            outcome.items += 1;
            for (table, row) in mapped {
                self.add_record(&table, row, buffer_size)?;
                outcome.rows += 1;
            }
        }

        for (table, row) in mapper.cleanup()? {
            self.add_record(&table, row, buffer_size)?;
            outcome.rows += 1;
        }

        if self.path().is_some() {
            let write = WriteOptions {
                gzip: options.gzip,
                ..WriteOptions::default()
            };
            for name in &affected {
                let table = self.table(name)?;
                if table.is_attached() {
                    table.write(&write)?;
                }
            }
        }
        Ok(outcome)
    }

    fn prepare_targets(&mut self, tables: &[String], buffer_size: Option<usize>) -> Result<(), Error> {
        for name in tables {
            let table = self.table(name)?;
            table.clear();
            if buffer_size.is_some() && table.is_attached() {
                table.write(&WriteOptions::default())?;
            }
        }
        Ok(())
    }

    fn add_record(&mut self, name: &str, mut row: RowMap, buffer_size: Option<usize>) -> Result<(), Error> {
        let table = self.table(name)?;
        let relation = Rc::clone(table.relation());
        row.retain(|column, _| relation.contains(column));
        table.append(Record::from_map(relation, row)?)?;
        if let Some(limit) = buffer_size {
            if table.is_attached() && table.unsynced_count() > limit {
                table.commit()?;
            }
        }
        Ok(())
    }
}

fn selector_parts(selector: &str) -> Result<(Option<String>, String), Error> {
    match parse_data_specifier(selector) {
        (table, Some(mut cols)) if cols.len() == 1 => Ok((table, cols.remove(0))),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("selector must specify exactly one data column: {selector}"))),
    }
}

fn source_columns(relation: &Relation, column: &str) -> Result<(Vec<String>, Vec<String>), Error> {
    if !relation.contains(column) {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("no column {column} in {} table", relation.name())));
    }
    let key_cols = relation.key_field_names().to_vec();
    let mut cols = key_cols.clone();
    cols.push(column.to_string());
    Ok((key_cols, cols))
}

fn read_suite_source(
    suite: &mut TestSuite,
    table: Option<String>,
    column: &str,
) -> Result<SourceRows, Error> {
    let name = match table {
        Some(table) => table,
        None => suite
            .relations()
            .find(column)
            .first()
            .map(|table| table.to_string())
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("no table defines column {column}"))
            })?,
    };
    let relation = suite.relation(&name)?;
    let (key_cols, cols) = source_columns(&relation, column)?;
    let rows = suite.table(&name)?.select(&cols, SelectMode::List)?;
    Ok(SourceRows { key_cols, rows })
}

fn read_table_source(table: &Table, column: &str) -> Result<SourceRows, Error> {
    let (key_cols, cols) = source_columns(table.relation(), column)?;
    let rows = table.select(&cols, SelectMode::List)?;
    Ok(SourceRows { key_cols, rows })
}

#[cfg(test)]
mod tests {
    use super::{FieldMapper, ProcessOptions, ProcessSource, Processor};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::relations::Relations;
    use crate::core::row::RowMap;
    use crate::core::suite::{SuiteWriteOptions, TablesToWrite, TestSuite};
    use crate::core::value::Value;
    use std::fs;

    const SCHEMA: &str = "\
item:
  i-id :integer :key
  i-input :string

parse:
  parse-id :integer :key
  i-id :integer :key
  readings :integer
";

    struct Counter {
        task: &'static str,
        seen: Vec<(String, Option<i64>)>,
    }

    impl Processor for Counter {
        type Response = (i64, usize);

        fn task(&self) -> &str {
            self.task
        }

        fn process_item(&mut self, datum: &Value, keys: &RowMap) -> Result<Self::Response, Error> {
            let id = keys.get("i-id").and_then(Value::as_i64);
            self.seen.push((datum.to_string(), id));
            let words = datum.to_string().split_whitespace().count();
            Ok((id.unwrap_or_default(), words))
        }
    }

    #[derive(Default)]
    struct ParseMapper {
        next: i64,
    }

    impl FieldMapper<(i64, usize)> for ParseMapper {
        fn affected_tables(&self) -> Vec<String> {
            vec!["parse".into(), "unknown".into()]
        }

        fn map(&mut self, response: &(i64, usize)) -> Result<Vec<(String, RowMap)>, Error> {
            self.next += 1;
            let mut row = RowMap::new();
            row.insert("parse-id".into(), Value::Integer(self.next));
            row.insert("i-id".into(), Value::Integer(response.0));
            row.insert("readings".into(), Value::Integer(response.1 as i64));
            row.insert("not-a-column".into(), Value::from("dropped"));
            Ok(vec![("parse".into(), row)])
        }

        fn cleanup(&mut self) -> Result<Vec<(String, RowMap)>, Error> {
            Ok(Vec::new())
        }
    }

    fn suite() -> TestSuite {
        let mut suite = TestSuite::in_memory(Relations::from_string(SCHEMA).unwrap());
        let item = suite.table("item").unwrap();
        item.append(vec!["1", "rain falls"]).unwrap();
        item.append(vec!["2", "the dog barks loudly"]).unwrap();
        item.append(vec!["3", "hi"]).unwrap();
        suite.table("parse").unwrap().append(vec!["99", "9", "0"]).unwrap();
        suite
    }

    fn counter() -> Counter {
        Counter {
            task: "parse",
            seen: Vec::new(),
        }
    }

    #[test]
    fn in_memory_processing_replaces_affected_tables() {
        let mut suite = suite();
        let mut cpu = counter();
        let outcome = suite
            .process(&mut cpu, &mut ParseMapper::default(), ProcessSource::Target, &ProcessOptions::default())
            .unwrap();
        assert_eq!(outcome.items, 3);
        assert_eq!(outcome.rows, 3);
        assert_eq!(cpu.seen[1], ("the dog barks loudly".to_string(), Some(2)));

        let parse = suite.table("parse").unwrap();
        assert_eq!(parse.len(), 3);
        assert!(!parse.is_attached());
        assert_eq!(parse.get(1).unwrap().raw_values(), ["2", "2", "4"]);
    }

    #[test]
    fn disk_processing_commits_in_batches_and_finalizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = SuiteWriteOptions {
            path: Some(dir.path().to_path_buf()),
            ..SuiteWriteOptions::default()
        };
        suite().write(TablesToWrite::All, &options).unwrap();

        let mut disk = TestSuite::open(dir.path()).unwrap();
        let process = ProcessOptions {
            buffer_size: Some(1),
            gzip: Some(true),
            ..ProcessOptions::default()
        };
        let outcome = disk
            .process(&mut counter(), &mut ParseMapper::default(), ProcessSource::Target, &process)
            .unwrap();
        assert_eq!(outcome.rows, 3);
        assert!(dir.path().join("parse.gz").is_file());
        assert!(!dir.path().join("parse").exists());

        let mut reopened = TestSuite::open(dir.path()).unwrap();
        let parse = reopened.table("parse").unwrap();
        assert_eq!(parse.len(), 3);
        assert_eq!(parse.get(0).unwrap().get("readings").unwrap(), Some(Value::Integer(2)));
        assert!(fs::read_to_string(dir.path().join("item")).unwrap().starts_with("1@rain falls"));
    }

    #[test]
    fn explicit_sources_and_selectors() {
        let mut source = suite();
        let mut target = TestSuite::in_memory(Relations::from_string(SCHEMA).unwrap());
        let options = ProcessOptions {
            selector: Some(":i-input".into()),
            ..ProcessOptions::default()
        };
        let mut cpu = Counter {
            task: "custom",
            seen: Vec::new(),
        };
        let outcome = target
            .process(&mut cpu, &mut ParseMapper::default(), ProcessSource::Suite(&mut source), &options)
            .unwrap();
        assert_eq!(outcome.items, 3);
        assert_eq!(target.table("parse").unwrap().len(), 3);
        assert_eq!(source.table("parse").unwrap().len(), 1);

        let item = source.table("item").unwrap();
        let from_table = target
            .process(&mut cpu, &mut ParseMapper::default(), ProcessSource::Table(item), &options)
            .unwrap();
        assert_eq!(from_table.items, 3);
    }

    #[test]
    fn selectors_must_resolve_to_one_column() {
        let mut suite = suite();
        let mut cpu = Counter {
            task: "custom",
            seen: Vec::new(),
        };
        let mut mapper = ParseMapper::default();
        let err = suite
            .process(&mut cpu, &mut mapper, ProcessSource::Target, &ProcessOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        let two = ProcessOptions {
            selector: Some("item:i-id@i-input".into()),
            ..ProcessOptions::default()
        };
        let err = suite
            .process(&mut cpu, &mut mapper, ProcessSource::Target, &two)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
