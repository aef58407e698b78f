//! Purpose: Ordered row storage with file-attached and in-memory modes.
//! Exports: `Table`, `Rows`, `WriteOptions`.
//! Role: Storage unit of a test suite; every read, edit and persist of rows goes through it.
//! Invariants: Attached slots are `OnDisk` until edited; edited slots are `Resident`.
//! Invariants: Detached tables hold every row resident and track no changes.
//! Invariants: Iterators hold their own handle on the slots; no borrow spans a yield.
use std::cell::RefCell;
use std::fs;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::core::codec::decode_row;
use crate::core::encoding::TextEncoding;
use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::record::Record;
use crate::core::relations::{RELATIONS_FILENAME, Relation, Relations};
use crate::core::row::{IntoRow, RowAccess};
use crate::core::select::{SelectMode, Selected, select_rows, split_columns};
use crate::core::table_file::{
    LineReader, RowWrite, base_path, count_lines, create_empty, is_gzip, resolve_table_path,
    write_rows,
};

/// One row position: resident text, or "read it from the bound file".
#[derive(Clone, Debug)]
pub(crate) enum Slot {
    Resident(Vec<String>),
    OnDisk,
}

/// Options for [`Table::write`] and [`Table::write_rows`].
///
/// `gzip: None` keeps the compression of the bound file when writing
/// back to it, and writes plain text anywhere else.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub path: Option<PathBuf>,
    pub relation: Option<Rc<Relation>>,
    pub append: bool,
    pub gzip: Option<bool>,
}

impl WriteOptions {
    pub fn to_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct Table {
    relation: Rc<Relation>,
    rows: Rc<RefCell<Vec<Slot>>>,
    path: Option<PathBuf>,
    encoding: TextEncoding,
    last_synced: Option<usize>,
    // rows were removed or shifted since the last sync; commit must rewrite
    reshaped: bool,
}

impl Table {
    /// An empty detached table.
    pub fn new(relation: Rc<Relation>) -> Self {
        Self {
            relation,
            rows: Rc::new(RefCell::new(Vec::new())),
            path: None,
            encoding: TextEncoding::default(),
            last_synced: None,
            reshaped: false,
        }
    }

    /// Text encoding used when this table is written.
    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_rows<I, R>(relation: Rc<Relation>, rows: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = R>,
        R: IntoRow,
    {
        let mut table = Self::new(relation);
        table.extend(rows)?;
        Ok(table)
    }

    /// Open the table file at `path` as an attached table.
    ///
    /// Without `relation`, the schema comes from the `relations` file
    /// next to the table file.
    pub fn from_file(
        path: impl AsRef<Path>,
        relation: Option<Rc<Relation>>,
        encoding: TextEncoding,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let resolved = resolve_table_path(path).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("table file not found")
                .with_path(path)
        })?;
        let relation = match relation {
            Some(relation) => relation,
            None => relation_for_table_path(&resolved)?,
        };
        let mut table = Self::new(relation);
        table.attach(&resolved, encoding)?;
        Ok(table)
    }

    pub fn name(&self) -> &str {
        self.relation.name()
    }

    pub fn relation(&self) -> &Rc<Relation> {
        &self.relation
    }

    /// The file in effect for an attached table.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn is_attached(&self) -> bool {
        self.path.is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }

    /// Rows past the last position known to be on disk.
    pub fn unsynced_count(&self) -> usize {
        let synced = self.last_synced.map_or(0, |index| index + 1);
        self.len().saturating_sub(synced)
    }

    /// Bind this table to the table file at `path`.
    ///
    /// A missing file is created empty. A populated table only attaches
    /// to an empty file, and then keeps its rows resident and unsynced.
    pub fn attach(&mut self, path: impl AsRef<Path>, encoding: TextEncoding) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(current) = &self.path {
            return Err(Error::new(ErrorKind::AttachConflict)
                .with_message("table is already attached")
                .with_path(current));
        }
        let resolved = match resolve_table_path(path) {
            Some(existing) => {
                let size = fs::metadata(&existing)
                    .map_err(|err| io_error(err, &existing))?
                    .len();
                if size > 0 && !self.is_empty() {
                    return Err(Error::new(ErrorKind::AttachConflict)
                        .with_message("cannot attach non-empty table to non-empty file")
                        .with_path(&existing)
                        .with_hint("Clear the table or the file, or attach to another file."));
                }
                existing
            }
            None => create_empty(path)?,
        };

        self.path = Some(resolved);
        self.encoding = encoding;
        if self.is_empty() {
            self.sync_with_file()?;
        }
        debug!(table = self.name(), rows = self.len(), "attached table");
        Ok(())
    }

    /// Load every on-disk row into memory and drop the file binding.
    ///
    /// Rows already resident keep their in-memory values.
    pub fn detach(&mut self) -> Result<(), Error> {
        if self.path.is_none() {
            return Err(Error::new(ErrorKind::Detached).with_message("table is already detached"));
        }
        self.load_on_disk(0)?;
        self.path = None;
        self.last_synced = None;
        self.reshaped = false;
        debug!(table = self.name(), rows = self.len(), "detached table");
        Ok(())
    }

    /// Forget in-memory rows and mirror the bound file's line count.
    fn sync_with_file(&mut self) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let count = count_lines(path, self.encoding)?;
        *self.rows.borrow_mut() = vec![Slot::OnDisk; count];
        self.last_synced = count.checked_sub(1);
        self.reshaped = false;
        debug!(table = self.name(), rows = count, "synced table with file");
        Ok(())
    }

    /// Make every `OnDisk` slot at or after `from` resident.
    ///
    /// An `OnDisk` slot at index `i` stands for line `i` of the bound
    /// file, so this must run before anything moves those slots.
    fn load_on_disk(&self, from: usize) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut rows = self.rows.borrow_mut();
        if !rows.iter().skip(from).any(|slot| matches!(slot, Slot::OnDisk)) {
            return Ok(());
        }
        for (index, line) in LineReader::open(path, self.encoding)?.enumerate().skip(from) {
            let line = line?;
            if let Some(slot @ Slot::OnDisk) = rows.get_mut(index) {
                *slot = Slot::Resident(decode_row(&line));
            }
        }
        if let Some(missing) = rows.iter().skip(from).position(|slot| matches!(slot, Slot::OnDisk)) {
            return Err(row_not_found(from + missing).with_path(path));
        }
        Ok(())
    }

    pub fn iter(&self) -> Rows {
        self.range(..)
    }

    /// Rows in `range`, clamped to the table length.
    pub fn range(&self, range: impl RangeBounds<usize>) -> Rows {
        let len = self.len();
        let start = match range.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => start.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(end) => end.saturating_add(1),
            Bound::Excluded(end) => *end,
            Bound::Unbounded => len,
        };
        let end = end.min(len);
        Rows {
            relation: Rc::clone(&self.relation),
            rows: Rc::clone(&self.rows),
            source: self.path.clone(),
            encoding: self.encoding,
            lines: None,
            line_pos: 0,
            next: start.min(end),
            end,
            done: false,
        }
    }

    pub fn records(&self) -> Result<Vec<Record>, Error> {
        self.iter().collect()
    }

    /// The row at `index`; negative indices count from the end.
    pub fn get(&self, index: isize) -> Result<Record, Error> {
        let index = self.resolve_index(index)?;
        self.range(index..=index)
            .next()
            .unwrap_or_else(|| Err(row_not_found(index)))
    }

    /// Replace the row at `index`; the slot becomes resident.
    pub fn set(&mut self, index: isize, row: impl IntoRow) -> Result<(), Error> {
        let index = self.resolve_index(index)?;
        let values = row.into_row(&self.relation).map_err(|err| err.with_row(index))?;
        self.rows.borrow_mut()[index] = Slot::Resident(values);
        Ok(())
    }

    /// Replace the rows in `range` (clamped to the table) with `rows`.
    pub fn splice<I, R>(&mut self, range: impl RangeBounds<usize>, rows: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = R>,
        R: IntoRow,
    {
        let replacement = self.convert_rows(rows)?;
        let len = self.len();
        let start = match range.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => start.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(end) => end.saturating_add(1),
            Bound::Excluded(end) => *end,
            Bound::Unbounded => len,
        }
        .clamp(start, len);
        if self.is_attached() && replacement.len() != end - start {
            self.load_on_disk(end)?;
            self.reshaped = true;
        }
        self.rows.borrow_mut().splice(start..end, replacement);
        Ok(())
    }

    /// Remove every row; an attached table rewrites its file on the next commit.
    pub fn clear(&mut self) {
        self.rows.borrow_mut().clear();
        if self.is_attached() {
            self.reshaped = true;
        }
    }

    pub fn append(&mut self, row: impl IntoRow) -> Result<(), Error> {
        self.extend(std::iter::once(row))
    }

    pub fn extend<I, R>(&mut self, rows: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = R>,
        R: IntoRow,
    {
        let rows = self.convert_rows(rows)?;
        self.rows.borrow_mut().extend(rows);
        Ok(())
    }

    fn convert_rows<I, R>(&self, rows: I) -> Result<Vec<Slot>, Error>
    where
        I: IntoIterator<Item = R>,
        R: IntoRow,
    {
        rows.into_iter()
            .enumerate()
            .map(|(i, row)| {
                row.into_row(&self.relation)
                    .map(Slot::Resident)
                    .map_err(|err| err.with_row(i))
            })
            .collect()
    }

    /// Resident rows of an attached table, with their positions.
    pub fn list_changes(&self) -> Result<Vec<(usize, Record)>, Error> {
        if !self.is_attached() {
            return Err(Error::new(ErrorKind::Detached)
                .with_message("changes are not tracked for detached tables"));
        }
        let rows = self.rows.borrow();
        rows.iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Resident(values) => Some((index, values.clone())),
                Slot::OnDisk => None,
            })
            .map(|(index, values)| {
                Record::bound(
                    Rc::clone(&self.relation),
                    values,
                    Rc::downgrade(&self.rows),
                    index,
                )
                .map(|record| (index, record))
            })
            .collect()
    }

    /// Persist pending changes of an attached table.
    ///
    /// Only-new rows are appended; anything else rewrites the file.
    pub fn commit(&mut self) -> Result<(), Error> {
        if !self.is_attached() {
            return Ok(());
        }
        if self.reshaped {
            debug!(table = self.name(), "committing removed rows by rewrite");
            self.write(&WriteOptions::default())?;
            return Ok(());
        }
        let changes = self.list_changes()?;
        let Some(first) = changes.first().map(|(index, _)| *index) else {
            return Ok(());
        };
        let appendable = self.last_synced.is_none_or(|synced| first > synced);
        if appendable {
            debug!(table = self.name(), rows = changes.len(), "committing by append");
            let records = changes.into_iter().map(|(_, record)| Ok(record));
            let options = WriteOptions {
                append: true,
                ..WriteOptions::default()
            };
            self.write_rows(records, &options)?;
        } else {
            debug!(table = self.name(), "committing by rewrite");
            self.write(&WriteOptions::default())?;
        }
        Ok(())
    }

    /// Write the table's rows; see [`WriteOptions`].
    pub fn write(&mut self, options: &WriteOptions) -> Result<PathBuf, Error> {
        let rows = self.iter();
        self.write_rows(rows, options)
    }

    /// Write `rows` instead of the table's own rows.
    ///
    /// Writing to the bound file rebinds the table to the file written
    /// and resyncs its slots; any other destination leaves it as is.
    pub fn write_rows<I, R>(&mut self, rows: I, options: &WriteOptions) -> Result<PathBuf, Error>
    where
        I: IntoIterator<Item = Result<R, Error>>,
        R: RowAccess,
    {
        let destination = match (&options.path, &self.path) {
            (Some(path), _) => base_path(path),
            (None, Some(bound)) => base_path(bound),
            (None, None) => {
                return Err(Error::new(ErrorKind::Detached)
                    .with_message("no path given for detached table"));
            }
        };
        let own_file = self
            .path
            .as_deref()
            .is_some_and(|bound| base_path(bound) == destination);
        let gzip = options.gzip.unwrap_or_else(|| {
            own_file && self.path.as_deref().is_some_and(is_gzip)
        });
        let Some(name) = destination.file_name().and_then(|name| name.to_str()) else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("invalid table path")
                .with_path(&destination));
        };
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let relation = options.relation.as_ref().unwrap_or(&self.relation);

        let written = write_rows(
            dir,
            name,
            rows,
            relation,
            RowWrite {
                append: options.append,
                gzip,
                encoding: self.encoding,
            },
        )?;

        if own_file {
            self.path = Some(written.clone());
            self.sync_with_file()?;
        }
        Ok(written)
    }

    /// Project the rows onto `cols`; all columns when `cols` is empty.
    pub fn select<S: AsRef<str>>(&self, cols: &[S], mode: SelectMode) -> Result<Vec<Selected>, Error> {
        if cols.is_empty() {
            let names = self.relation.field_names();
            return select_rows(&names, self.iter(), mode, true);
        }
        select_rows(cols, self.iter(), mode, true)
    }

    /// Like [`Table::select`] with an `@`-joined column list.
    pub fn select_spec(&self, cols: &str, mode: SelectMode) -> Result<Vec<Selected>, Error> {
        self.select(&split_columns(cols), mode)
    }

    fn resolve_index(&self, index: isize) -> Result<usize, Error> {
        let len = self.len();
        let resolved = if index < 0 {
            len.checked_sub(index.unsigned_abs())
        } else {
            usize::try_from(index).ok()
        };
        match resolved {
            Some(resolved) if resolved < len => Ok(resolved),
            _ => Err(Error::new(ErrorKind::RowNotFound)
                .with_message(format!("row index {index} out of range for {} rows", len))),
        }
    }
}

impl<'a> IntoIterator for &'a Table {
    type Item = Result<Record, Error>;
    type IntoIter = Rows;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn row_not_found(index: usize) -> Error {
    Error::new(ErrorKind::RowNotFound)
        .with_message("could not retrieve row in attached table")
        .with_row(index)
}

fn relation_for_table_path(path: &Path) -> Result<Rc<Relation>, Error> {
    let base = base_path(path);
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let relations = Relations::from_file(dir.join(RELATIONS_FILENAME))?;
    let name = base.file_name().and_then(|name| name.to_str()).unwrap_or_default();
    relations
        .relation(name)
        .cloned()
        .map_err(|err| err.with_path(&base))
}

/// Iterator over a table's rows, reading placeholders from the file.
///
/// Owns a handle to the slots, so the table stays usable while it runs.
/// The file is opened on the first placeholder and scanned forward.
pub struct Rows {
    relation: Rc<Relation>,
    rows: Rc<RefCell<Vec<Slot>>>,
    source: Option<PathBuf>,
    encoding: TextEncoding,
    lines: Option<LineReader>,
    line_pos: usize,
    next: usize,
    end: usize,
    done: bool,
}

impl Rows {
    fn read_line(&mut self, index: usize) -> Result<Vec<String>, Error> {
        let Some(path) = &self.source else {
            return Err(row_not_found(index));
        };
        let lines = match &mut self.lines {
            Some(lines) if self.line_pos <= index => lines,
            slot => {
                self.line_pos = 0;
                slot.insert(LineReader::open(path, self.encoding)?)
            }
        };
        while self.line_pos < index {
            if !lines.skip_line()? {
                return Err(row_not_found(index).with_path(path));
            }
            self.line_pos += 1;
        }
        match lines.next() {
            Some(line) => {
                self.line_pos += 1;
                Ok(decode_row(&line?))
            }
            None => Err(row_not_found(index).with_path(path)),
        }
    }
}

impl Iterator for Rows {
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next >= self.end {
            return None;
        }
        let index = self.next;
        self.next += 1;
        let slot = self.rows.borrow().get(index).cloned();
        let values = match slot {
            Some(Slot::Resident(values)) => values,
            Some(Slot::OnDisk) => match self.read_line(index) {
                Ok(values) => values,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            },
            // the table shrank underneath us
            None => {
                self.done = true;
                return None;
            }
        };
        let record = Record::bound(
            Rc::clone(&self.relation),
            values,
            Rc::downgrade(&self.rows),
            index,
        );
        if record.is_err() {
            self.done = true;
        }
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end.saturating_sub(self.next)))
    }
}
