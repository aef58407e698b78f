// Row-shape traits shared by projection, encoding and table mutation.
use indexmap::IndexMap;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::relations::Relation;
use crate::core::value::Value;

/// Name→value mapping used for rows built by name (e.g. by field mappers).
pub type RowMap = IndexMap<String, Value>;

/// Read access to one column of a row.
///
/// Records resolve `name` against their relation and honor `cast`;
/// plain sequences ignore the name and answer by `position`.
pub trait RowAccess {
    fn column(&self, name: &str, position: usize, cast: bool) -> Result<Option<Value>, Error>;
}

impl RowAccess for Record {
    fn column(&self, name: &str, _position: usize, cast: bool) -> Result<Option<Value>, Error> {
        if cast {
            self.get(name)
        } else {
            Ok(self.get_raw(name)?.map(Value::from))
        }
    }
}

impl RowAccess for [String] {
    fn column(&self, _name: &str, position: usize, _cast: bool) -> Result<Option<Value>, Error> {
        Ok(self.get(position).map(|value| Value::from(value.as_str())))
    }
}

impl RowAccess for Vec<String> {
    fn column(&self, name: &str, position: usize, cast: bool) -> Result<Option<Value>, Error> {
        self.as_slice().column(name, position, cast)
    }
}

impl RowAccess for [Value] {
    fn column(&self, _name: &str, position: usize, _cast: bool) -> Result<Option<Value>, Error> {
        Ok(self.get(position).cloned())
    }
}

impl RowAccess for Vec<Value> {
    fn column(&self, name: &str, position: usize, cast: bool) -> Result<Option<Value>, Error> {
        self.as_slice().column(name, position, cast)
    }
}

impl RowAccess for RowMap {
    fn column(&self, name: &str, _position: usize, _cast: bool) -> Result<Option<Value>, Error> {
        Ok(self.get(name).cloned())
    }
}

impl<T: RowAccess + ?Sized> RowAccess for &T {
    fn column(&self, name: &str, position: usize, cast: bool) -> Result<Option<Value>, Error> {
        (**self).column(name, position, cast)
    }
}

/// Conversion into the stored (raw string) form of a row.
pub trait IntoRow {
    fn into_row(self, relation: &Relation) -> Result<Vec<String>, Error>;
}

fn check_width(relation: &Relation, width: usize) -> Result<(), Error> {
    if width != relation.len() {
        return Err(Error::new(ErrorKind::FieldCountMismatch).with_message(format!(
            "incorrect number of column values for {} table: {} != {}",
            relation.name(),
            width,
            relation.len()
        )));
    }
    Ok(())
}

impl IntoRow for Vec<String> {
    fn into_row(self, relation: &Relation) -> Result<Vec<String>, Error> {
        check_width(relation, self.len())?;
        Ok(self)
    }
}

impl IntoRow for Vec<&str> {
    fn into_row(self, relation: &Relation) -> Result<Vec<String>, Error> {
        check_width(relation, self.len())?;
        Ok(self.into_iter().map(str::to_string).collect())
    }
}

impl IntoRow for Vec<Option<Value>> {
    fn into_row(self, relation: &Relation) -> Result<Vec<String>, Error> {
        check_width(relation, self.len())?;
        self.iter()
            .zip(relation.fields())
            .map(|(value, field)| field.to_raw(value.as_ref()))
            .collect()
    }
}

impl IntoRow for Vec<Value> {
    fn into_row(self, relation: &Relation) -> Result<Vec<String>, Error> {
        self.into_iter().map(Some).collect::<Vec<_>>().into_row(relation)
    }
}

impl IntoRow for RowMap {
    fn into_row(self, relation: &Relation) -> Result<Vec<String>, Error> {
        let mut values: Vec<Option<Value>> = vec![None; relation.len()];
        for (name, value) in self {
            let Some(index) = relation.index_of(&name)? else {
                return Err(Error::new(ErrorKind::NotFound).with_message(format!(
                    "invalid field name for {} table: {name}",
                    relation.name()
                )));
            };
            values[index] = Some(value);
        }
        values.into_row(relation)
    }
}

impl IntoRow for Record {
    fn into_row(self, relation: &Relation) -> Result<Vec<String>, Error> {
        self.into_raw().into_row(relation)
    }
}

impl IntoRow for &Record {
    fn into_row(self, relation: &Relation) -> Result<Vec<String>, Error> {
        self.raw_values().to_vec().into_row(relation)
    }
}
