//! Purpose: Typed view over one stored row.
//! Exports: `Record`.
//! Role: Returned by table reads; casts cells on access and writes edits back to the table.
//! Invariants: Values are held in stored (raw string) form; casting happens on read.
//! Invariants: The link to the owning table is weak; a dropped table turns edits local.
//! Invariants: Record width always equals its relation's width.
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::core::codec::encode_row;
use crate::core::error::{Error, ErrorKind};
use crate::core::relations::{Relation, column_part};
use crate::core::row::{IntoRow, RowMap};
use crate::core::table::Slot;
use crate::core::value::Value;

#[derive(Clone)]
struct Owner {
    rows: Weak<RefCell<Vec<Slot>>>,
    index: usize,
}

#[derive(Clone)]
pub struct Record {
    relation: Rc<Relation>,
    values: Vec<String>,
    owner: Option<Owner>,
}

impl Record {
    pub fn new(relation: Rc<Relation>, row: impl IntoRow) -> Result<Self, Error> {
        let values = row.into_row(&relation)?;
        Ok(Self {
            relation,
            values,
            owner: None,
        })
    }

    /// Build a record from named values; unnamed columns take defaults.
    pub fn from_map(relation: Rc<Relation>, map: RowMap) -> Result<Self, Error> {
        Self::new(relation, map)
    }

    pub(crate) fn bound(
        relation: Rc<Relation>,
        values: Vec<String>,
        rows: Weak<RefCell<Vec<Slot>>>,
        index: usize,
    ) -> Result<Self, Error> {
        let values = values.into_row(&relation).map_err(|err| err.with_row(index))?;
        Ok(Self {
            relation,
            values,
            owner: Some(Owner { rows, index }),
        })
    }

    pub fn relation(&self) -> &Rc<Relation> {
        &self.relation
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Row position in the owning table, if read from one.
    pub fn row_index(&self) -> Option<usize> {
        self.owner.as_ref().map(|owner| owner.index)
    }

    pub fn raw(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    pub fn raw_values(&self) -> &[String] {
        &self.values
    }

    pub fn into_raw(self) -> Vec<String> {
        self.values
    }

    /// The cast value at `index`.
    pub fn value(&self, index: usize) -> Result<Value, Error> {
        let field = self.relation.field(index).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("column index {index} out of range"))
        })?;
        field.cast(self.raw(index))
    }

    pub fn values(&self) -> Result<Vec<Value>, Error> {
        (0..self.values.len()).map(|i| self.value(i)).collect()
    }

    /// The cast value of column `name` (optionally `table:name`).
    ///
    /// Returns `Ok(None)` when the relation has no such column.
    pub fn get(&self, name: &str) -> Result<Option<Value>, Error> {
        match self.position(name)? {
            Some(index) => self.value(index).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`Record::get`] with `default` for absent columns.
    pub fn get_or(&self, name: &str, default: Value) -> Result<Value, Error> {
        Ok(self.get(name)?.unwrap_or(default))
    }

    /// The stored text of column `name`, without casting.
    pub fn get_raw(&self, name: &str) -> Result<Option<&str>, Error> {
        Ok(self.position(name)?.and_then(|index| self.raw(index)))
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        let index = self.position(name)?.ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!(
                "no column {name} in {} table",
                self.relation.name()
            ))
        })?;
        self.set_at(index, value)
    }

    /// Store `value` at `index` and write the row through to its table.
    pub fn set_at(&mut self, index: usize, value: impl Into<Value>) -> Result<(), Error> {
        let field = self.relation.field(index).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("column index {index} out of range"))
        })?;
        let raw = field.to_raw(Some(&value.into()))?;
        self.values[index] = raw;
        self.write_through();
        Ok(())
    }

    fn write_through(&self) {
        let Some(owner) = &self.owner else {
            return;
        };
        let Some(rows) = owner.rows.upgrade() else {
            return;
        };
        if let Some(slot) = rows.borrow_mut().get_mut(owner.index) {
            *slot = Slot::Resident(self.values.clone());
        }
    }

    fn position(&self, name: &str) -> Result<Option<usize>, Error> {
        if let Some((table, _)) = name.rsplit_once(':') {
            if !table.is_empty() && !self.relation.table_names().any(|t| t == table) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("column requested from wrong table: {table}")));
            }
        }
        if self.relation.is_joined() {
            self.relation.index_of(name)
        } else {
            self.relation.index_of(column_part(name))
        }
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        (0..self.values.len()).all(|i| match (self.value(i), other.value(i)) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.values[i] == other.values[i],
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_row(&self.values))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("table", &self.relation.name())
            .field("row", &self.row_index())
            .field("values", &self.values)
            .finish()
    }
}
