//! Purpose: A test suite: one relations catalog plus its lazily loaded tables.
//! Exports: `TestSuite`, `SuiteOptions`, `SuiteWriteOptions`, `TablesToWrite`, `TableData`.
//! Role: Entry point for callers working on a profile directory (or an in-memory suite).
//! Invariants: Every catalog table has a cache entry; `None` means "load on next access".
//! Invariants: Tables of a directory-backed suite are attached to `<dir>/<table>`.
//! Invariants: The catalog is fixed for the life of the suite.
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use crate::core::encoding::TextEncoding;
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::relations::{RELATIONS_FILENAME, Relation, Relations};
use crate::core::select::{JoinHow, SelectMode, Selected, join, parse_data_specifier};
use crate::core::table::{Table, WriteOptions};
use crate::core::table_file::{create_empty, resolve_table_path, table_size, write_text_atomic};

/// How to obtain the catalog and read the files of a suite directory.
#[derive(Clone, Debug, Default)]
pub struct SuiteOptions {
    /// Use this catalog instead of reading one.
    pub relations: Option<Relations>,
    /// Read the catalog from here instead of `<dir>/relations`.
    pub relations_path: Option<PathBuf>,
    pub encoding: TextEncoding,
}

#[derive(Clone, Debug, Default)]
pub struct SuiteWriteOptions {
    /// Destination directory; the suite's own directory when unset.
    pub path: Option<PathBuf>,
    /// Catalog to write and to shape rows with; the suite's when unset.
    pub relations: Option<Relations>,
    pub append: bool,
    pub gzip: Option<bool>,
}

/// Replacement data for one table in [`TestSuite::write`].
#[derive(Debug)]
pub enum TableData {
    Table(Table),
    Rows(Vec<Vec<String>>),
}

/// Which tables [`TestSuite::write`] writes.
#[derive(Debug, Default)]
pub enum TablesToWrite {
    #[default]
    All,
    Named(Vec<String>),
    Data(IndexMap<String, TableData>),
}

#[derive(Debug)]
pub struct TestSuite {
    path: Option<PathBuf>,
    relations: Relations,
    encoding: TextEncoding,
    tables: IndexMap<String, Option<Table>>,
}

impl TestSuite {
    /// Open the profile directory at `path` using its `relations` file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(path, SuiteOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: SuiteOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let relations = match (options.relations, options.relations_path) {
            (Some(relations), _) => relations,
            (None, Some(relations_path)) => Relations::from_file(relations_path)?,
            (None, None) => {
                let relations_path = path.join(RELATIONS_FILENAME);
                if !relations_path.is_file() {
                    return Err(Error::new(ErrorKind::NotFound)
                        .with_message("relations file not found")
                        .with_path(&relations_path)
                        .with_hint("Point at a profile directory or pass a relations file."));
                }
                Relations::from_file(relations_path)?
            }
        };
        debug!(path = %path.display(), tables = relations.len(), "opened test suite");
        Ok(Self::build(Some(path), relations, options.encoding))
    }

    /// A suite with no directory; tables start empty and detached.
    pub fn in_memory(relations: Relations) -> Self {
        Self::build(None, relations, TextEncoding::default())
    }

    fn build(path: Option<PathBuf>, relations: Relations, encoding: TextEncoding) -> Self {
        let tables = relations.names().map(|name| (name.to_string(), None)).collect();
        Self {
            path,
            relations,
            encoding,
            tables,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn relations(&self) -> &Relations {
        &self.relations
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// The table `name`, loading it first if needed.
    pub fn table(&mut self, name: &str) -> Result<&mut Table, Error> {
        let Some(entry) = self.tables.get(name) else {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("no such table: {name}")));
        };
        if entry.is_none() {
            let table = self.load_table(name)?;
            self.tables.insert(name.to_string(), Some(table));
        }
        match self.tables.get_mut(name) {
            Some(Some(table)) => Ok(table),
            _ => Err(Error::new(ErrorKind::Internal)
                .with_message(format!("table {name} missing after load"))),
        }
    }

    /// The table `name` if it is currently loaded.
    pub fn loaded(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).and_then(Option::as_ref)
    }

    /// Discard in-memory state and reattach every table to its file.
    pub fn reload(&mut self) -> Result<(), Error> {
        if self.path.is_none() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("cannot reload an in-memory test suite"));
        }
        let names: Vec<String> = self.tables.keys().cloned().collect();
        for name in names {
            let table = self.load_table(&name)?;
            self.tables.insert(name, Some(table));
        }
        Ok(())
    }

    fn load_table(&self, name: &str) -> Result<Table, Error> {
        let relation = Rc::clone(self.relations.relation(name)?);
        let Some(dir) = &self.path else {
            return Ok(Table::new(relation).with_encoding(self.encoding));
        };
        let path = dir.join(name);
        if resolve_table_path(&path).is_none() {
            create_empty(&path)?;
        }
        debug!(table = name, "loading table");
        Table::from_file(&path, Some(relation), self.encoding)
    }

    /// Select columns from a table.
    ///
    /// With `cols`, `spec` is a table name; otherwise it is a data
    /// specifier such as `item:i-id@i-input` or `:i-input`. Columns
    /// default to every field of the table.
    pub fn select(
        &mut self,
        spec: &str,
        cols: Option<&[String]>,
        mode: SelectMode,
    ) -> Result<Vec<Selected>, Error> {
        let (table, cols) = match cols {
            Some(cols) => (Some(spec.to_string()), Some(cols.to_vec())),
            None => parse_data_specifier(spec),
        };
        let name = match (table, &cols) {
            (Some(table), _) => table,
            (None, Some(cols)) => self.table_for_column(cols.first().map(String::as_str))?,
            (None, None) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid data specifier: {spec}"))
                    .with_hint("Use `table`, `table:col`, `table:col1@col2` or `:col`."));
            }
        };
        let cols = match cols {
            Some(cols) => cols,
            None => self.relations.relation(&name)?.field_names(),
        };
        self.table(&name)?.select(&cols, mode)
    }

    fn table_for_column(&self, column: Option<&str>) -> Result<String, Error> {
        let column = column.unwrap_or_default();
        self.relations
            .find(column)
            .first()
            .map(|table| table.to_string())
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("no table defines column {column}"))
            })
    }

    /// Join two tables of this suite; see [`join`].
    pub fn join(
        &mut self,
        left: &str,
        right: &str,
        on: Option<&[String]>,
        how: JoinHow,
    ) -> Result<Table, Error> {
        self.table(left)?;
        self.table(right)?;
        match (self.loaded(left), self.loaded(right)) {
            (Some(left), Some(right)) => join(left, right, on, how),
            _ => Err(Error::new(ErrorKind::Internal).with_message("join tables not loaded")),
        }
    }

    /// Write the catalog and the selected tables to a profile directory.
    ///
    /// The directory is created when missing. Returns its path.
    pub fn write(
        &mut self,
        tables: TablesToWrite,
        options: &SuiteWriteOptions,
    ) -> Result<PathBuf, Error> {
        let dest = match (&options.path, &self.path) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => path.clone(),
            (None, None) => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("no path given for in-memory test suite"));
            }
        };
        let relations = options
            .relations
            .clone()
            .unwrap_or_else(|| self.relations.clone());

        fs::create_dir_all(&dest)
            .map_err(|err| io_error(err, &dest).with_message("failed to create profile directory"))?;
        write_text_atomic(&dest.join(RELATIONS_FILENAME), &format!("{relations}\n"))?;

        let mut data: IndexMap<String, Option<TableData>> = match tables {
            TablesToWrite::All => {
                let names = self.tables.keys().cloned().collect::<Vec<_>>();
                names.into_iter().map(|name| (name, None)).collect()
            }
            TablesToWrite::Named(names) => {
                let mut selected = IndexMap::new();
                for name in names {
                    self.relations.relation(&name)?;
                    selected.insert(name, None);
                }
                selected
            }
            TablesToWrite::Data(data) => data
                .into_iter()
                .map(|(name, table)| (name, Some(table)))
                .collect(),
        };

        for (name, relation) in relations.iter() {
            let Some(entry) = data.shift_remove(name) else {
                continue;
            };
            let write = WriteOptions {
                path: Some(dest.join(name)),
                relation: Some(Rc::clone(relation)),
                append: options.append,
                gzip: options.gzip,
            };
            match entry {
                Some(TableData::Table(mut table)) => {
                    table.write(&write)?;
                }
                Some(TableData::Rows(rows)) => {
                    let mut table = Table::with_rows(Rc::clone(relation), rows)?
                        .with_encoding(self.encoding);
                    table.write(&write)?;
                }
                None => {
                    self.table(name)?.write(&write)?;
                }
            }
            debug!(table = name, path = %dest.display(), "wrote table");
        }
        Ok(dest)
    }

    /// Whether the suite directory (and `table`'s file, if given) exist.
    pub fn exists(&self, table: Option<&str>) -> bool {
        let Some(dir) = &self.path else {
            return false;
        };
        if !dir.is_dir() || !dir.join(RELATIONS_FILENAME).is_file() {
            return false;
        }
        match table {
            Some(table) => resolve_table_path(&dir.join(table)).is_some(),
            None => true,
        }
    }

    /// On-disk size in bytes of `table`, or of every table.
    pub fn size(&self, table: Option<&str>) -> Result<u64, Error> {
        let Some(dir) = &self.path else {
            return Ok(0);
        };
        match table {
            Some(table) => table_size(&dir.join(table)),
            None => self
                .relations
                .names()
                .map(|name| table_size(&dir.join(name)))
                .sum(),
        }
    }

    pub(crate) fn relation(&self, name: &str) -> Result<Rc<Relation>, Error> {
        self.relations.relation(name).cloned()
    }
}
