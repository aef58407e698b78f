//! Purpose: Model the relations schema of a test suite (fields, tables, the catalog).
//! Exports: `Field`, `Relation`, `Relations`, `RELATIONS_FILENAME`.
//! Role: Parsed once per suite; every table, record and join is typed through it.
//! Invariants: A partial key is always a key; field names are unique within a relation.
//! Invariants: Serializing a catalog and parsing it back yields an equal catalog.
//! Invariants: Joined relations resolve unqualified names only when unambiguous.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;

use indexmap::IndexMap;

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::value::{Datatype, Value};

pub const RELATIONS_FILENAME: &str = "relations";

/// Fields whose default is fixed by the standard schema rather than by datatype.
const CODED_DEFAULTS: &[(&str, i64)] = &[("i-wf", 1), ("i-difficulty", 1), ("polarity", -1)];

const INTEGER_DEFAULT: i64 = -1;

/// One column of a relation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    name: String,
    datatype: Datatype,
    key: bool,
    partial: bool,
    comment: Option<String>,
}

impl Field {
    pub fn new(
        name: impl Into<String>,
        datatype: Datatype,
        key: bool,
        partial: bool,
        comment: Option<String>,
    ) -> Result<Self, Error> {
        let name = name.into();
        if partial && !key {
            return Err(Error::new(ErrorKind::SchemaParse)
                .with_message(format!("field {name}: a partial key must also be a key")));
        }
        Ok(Self {
            name,
            datatype,
            key,
            partial,
            comment: comment.filter(|c| !c.is_empty()),
        })
    }

    /// Shorthand for a plain (non-key, uncommented) field.
    pub fn plain(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            key: false,
            partial: false,
            comment: None,
        }
    }

    /// Shorthand for a key field.
    pub fn key(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            key: true,
            ..Self::plain(name, datatype)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn is_key(&self) -> bool {
        self.key
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn default_value(&self) -> Value {
        if let Some((_, code)) = CODED_DEFAULTS.iter().find(|(name, _)| *name == self.name) {
            return Value::Integer(*code);
        }
        match self.datatype {
            Datatype::Integer => Value::Integer(INTEGER_DEFAULT),
            _ => Value::String(String::new()),
        }
    }

    /// Cast a stored cell; absent or empty cells take the default value.
    pub fn cast(&self, raw: Option<&str>) -> Result<Value, Error> {
        match raw {
            None | Some("") => Ok(self.default_value()),
            Some(raw) => Value::cast(raw, self.datatype)
                .map_err(|err| err.with_hint(format!("while reading column {}", self.name))),
        }
    }

    /// Render a value in its stored form; unset keys are an error.
    pub fn to_raw(&self, value: Option<&Value>) -> Result<String, Error> {
        match value {
            Some(value) => Ok(value.to_string()),
            None if self.key => Err(Error::new(ErrorKind::MissingKey)
                .with_message(format!("missing key: {}", self.name))),
            None => Ok(self.default_value().to_string()),
        }
    }

    fn renamed(&self, name: String) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![self.name.as_str(), self.datatype.as_str()];
        if self.key {
            parts.push(":key");
        }
        if self.partial {
            parts.push(":partial");
        }
        let line = format!("  {}", parts.join(" "));
        match &self.comment {
            Some(comment) => write!(f, "{line:<40}# {comment}"),
            None => f.write_str(&line),
        }
    }
}

/// The ordered field list of one table, or of a join of tables.
#[derive(Clone, Debug, PartialEq)]
pub struct Relation {
    name: String,
    fields: Vec<Field>,
    index: HashMap<String, usize>,
    keys: Vec<String>,
    joined: bool,
}

impl Relation {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Result<Self, Error> {
        let name = name.into();
        let index = build_index(&name, &fields)?;
        let keys = fields
            .iter()
            .filter(|field| field.key)
            .map(|field| field.name.clone())
            .collect();
        Ok(Self {
            name,
            fields,
            index,
            keys,
            joined: false,
        })
    }

    /// Combine two relations around the pivot columns in `on`.
    ///
    /// Pivot columns keep their bare name and appear once; every other
    /// column is renamed `table:column`. The result is named `left+right`.
    pub fn join(left: &Relation, right: &Relation, on: &[String]) -> Result<Self, Error> {
        let left_tables: HashSet<&str> = left.table_names().collect();
        if right.table_names().any(|table| left_tables.contains(table)) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "cannot join tables with the same name: {} and {}",
                    left.name, right.name
                ))
                .with_hint("Rename one of the tables before joining."));
        }

        let name = format!("{}+{}", left.name, right.name);
        let mut fields = prefixed_fields(left, on, false);
        fields.extend(prefixed_fields(right, on, true));
        let index = build_index(&name, &fields)?;

        let mut keys = left.keys.clone();
        for key in &right.keys {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        Ok(Self {
            name,
            fields,
            index,
            keys,
            joined: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source table names; more than one for joined relations.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.name.split('+')
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }

    pub fn key_field_names(&self) -> &[String] {
        &self.keys
    }

    pub fn contains(&self, name: &str) -> bool {
        !matches!(self.index_of(name), Ok(None))
    }

    /// Column position of `name`.
    ///
    /// On joined relations a bare name resolves to the single
    /// `table:name` column that carries it; several candidates are an
    /// [`ErrorKind::AmbiguousColumn`] error.
    pub fn index_of(&self, name: &str) -> Result<Option<usize>, Error> {
        if !self.joined {
            return Ok(self.index.get(name).copied());
        }
        if !name.contains(':') {
            let mut qualified = self
                .table_names()
                .map(|table| format!("{table}:{name}"))
                .filter(|candidate| self.index.contains_key(candidate));
            if let Some(first) = qualified.next() {
                if qualified.next().is_some() {
                    return Err(Error::new(ErrorKind::AmbiguousColumn)
                        .with_message(format!("ambiguous field name: {name}"))
                        .with_hint("Include the table name (e.g., 'item:i-id' instead of 'i-id')."));
                }
                return Ok(self.index.get(&first).copied());
            }
            return Ok(self.index.get(name).copied());
        }
        if let Some(index) = self.index.get(name) {
            return Ok(Some(*index));
        }
        // pivot columns are stored without a table prefix
        let bare = column_part(name);
        if self.keys.iter().any(|key| key == bare) {
            return Ok(self.index.get(bare).copied());
        }
        Ok(None)
    }
}

fn build_index(name: &str, fields: &[Field]) -> Result<HashMap<String, usize>, Error> {
    let mut index = HashMap::with_capacity(fields.len());
    for (i, field) in fields.iter().enumerate() {
        if index.insert(field.name.clone(), i).is_some() {
            return Err(Error::new(ErrorKind::SchemaParse)
                .with_message(format!("duplicate field {} in table {name}", field.name)));
        }
    }
    Ok(index)
}

fn prefixed_fields(relation: &Relation, on: &[String], drop_pivots: bool) -> Vec<Field> {
    let mut fields = Vec::with_capacity(relation.len());
    for field in &relation.fields {
        let (table, column) = match field.name.rsplit_once(':') {
            Some((table, column)) => (table, column),
            None => ("", field.name.as_str()),
        };
        let prefix = if relation.joined {
            if table.is_empty() {
                String::new()
            } else {
                format!("{table}:")
            }
        } else {
            format!("{}:", relation.name)
        };
        let is_pivot = on.iter().any(|pivot| pivot == column);
        if is_pivot && !drop_pivots {
            fields.push(field.renamed(column.to_string()));
        } else if !is_pivot {
            fields.push(field.renamed(format!("{prefix}{column}")));
        }
    }
    fields
}

/// The column part of a possibly table-qualified name.
pub(crate) fn column_part(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, column)| column)
}

/// The schema catalog: table name to relation, in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Relations {
    tables: IndexMap<String, Rc<Relation>>,
    field_map: HashMap<String, Vec<String>>,
}

impl Relations {
    pub fn new(relations: Vec<Relation>) -> Result<Self, Error> {
        let mut tables = IndexMap::with_capacity(relations.len());
        for relation in relations {
            let name = relation.name.clone();
            if tables.insert(name.clone(), Rc::new(relation)).is_some() {
                return Err(Error::new(ErrorKind::SchemaParse)
                    .with_message(format!("table {name} already defined")));
            }
        }
        let mut field_map: HashMap<String, Vec<String>> = HashMap::new();
        for relation in tables.values() {
            for field in &relation.fields {
                field_map
                    .entry(field.name.clone())
                    .or_default()
                    .push(relation.name.clone());
            }
        }
        Ok(Self { tables, field_map })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            io_error(err, path).with_message("failed to read relations file")
        })?;
        Self::from_string(&text).map_err(|err| err.with_path(path))
    }

    pub fn from_string(text: &str) -> Result<Self, Error> {
        let mut tables: Vec<(String, Vec<Field>)> = Vec::new();
        let mut seen = HashSet::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(table) = table_header(line) {
                if !seen.insert(table.to_string()) {
                    return Err(Error::new(ErrorKind::SchemaParse)
                        .with_message(format!("table {table} already defined"))
                        .with_line(lineno + 1));
                }
                tables.push((table.to_string(), Vec::new()));
                continue;
            }
            let Some((_, fields)) = tables.last_mut() else {
                return Err(invalid_line(line, lineno).with_hint("Field lines must follow a `table:` header."));
            };
            let field = parse_field(line).map_err(|err| match err.message() {
                Some(_) => err.with_line(lineno + 1),
                None => invalid_line(line, lineno),
            })?;
            fields.push(field);
        }

        let relations = tables
            .into_iter()
            .map(|(name, fields)| Relation::new(name, fields))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(relations)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn get(&self, table: &str) -> Option<&Rc<Relation>> {
        self.tables.get(table)
    }

    pub fn relation(&self, table: &str) -> Result<&Rc<Relation>, Error> {
        self.tables.get(table).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("no such table: {table}"))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rc<Relation>)> {
        self.tables.iter().map(|(name, rel)| (name.as_str(), rel))
    }

    /// Tables that define `field`; a `table:column` name narrows to that table.
    pub fn find(&self, field: &str) -> Vec<&str> {
        if let Some((table, column)) = field.rsplit_once(':') {
            if !table.is_empty() {
                let defines = self
                    .field_map
                    .get(column)
                    .is_some_and(|tables| tables.iter().any(|t| t == table));
                return if defines {
                    self.tables
                        .get_key_value(table)
                        .map(|(name, _)| vec![name.as_str()])
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
            }
        }
        self.field_map
            .get(field)
            .map(|tables| tables.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Breadth-first search for the key hops linking `source` to `target`.
    ///
    /// Both may be `+`-joined names. Each hop is `(table, key_field)`:
    /// the table reached and the shared key used to reach it.
    pub fn path(&self, source: &str, target: &str) -> Result<Vec<(String, String)>, Error> {
        let starts: Vec<&str> = source.split('+').collect();
        let mut visited: HashSet<&str> = starts.iter().copied().collect();
        let targets: HashSet<&str> = target
            .split('+')
            .filter(|table| !visited.contains(table))
            .collect();
        for table in visited.iter().chain(targets.iter()) {
            self.relation(table)?;
        }
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<Vec<(&str, &str)>> =
            starts.iter().map(|table| vec![(*table, "")]).collect();
        loop {
            let mut next = Vec::new();
            for path in &paths {
                let (last, _) = path[path.len() - 1];
                if targets.contains(last) {
                    return Ok(path[1..]
                        .iter()
                        .map(|(table, key)| (table.to_string(), key.to_string()))
                        .collect());
                }
                let relation = self.relation(last)?;
                for key in relation.key_field_names() {
                    for step in self.find(key) {
                        if visited.insert(step) {
                            let mut extended = path.clone();
                            extended.push((step, key.as_str()));
                            next.push(extended);
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            paths = next;
        }

        Err(Error::new(ErrorKind::NoPath)
            .with_message(format!("no relation path found from {source} to {target}")))
    }
}

impl fmt::Display for Relations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, relation)) in self.tables.iter().enumerate() {
            if i > 0 {
                f.write_str("\n\n")?;
            }
            write!(f, "{name}:")?;
            for field in &relation.fields {
                write!(f, "\n{field}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for Relations {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

fn table_header(line: &str) -> Option<&str> {
    let name = line.strip_suffix(':')?;
    let first = name.chars().next()?;
    if !(first.is_alphanumeric() || first == '_') {
        return None;
    }
    if name.chars().any(char::is_whitespace) {
        return None;
    }
    Some(name)
}

fn parse_field(line: &str) -> Result<Field, Error> {
    let (spec, comment) = match line.split_once('#') {
        Some((spec, comment)) => (spec, Some(comment.trim().to_string())),
        None => (line, None),
    };
    let mut tokens = spec.split_whitespace();
    let (Some(name), Some(datatype)) = (tokens.next(), tokens.next()) else {
        return Err(Error::new(ErrorKind::SchemaParse));
    };
    let datatype = datatype.parse::<Datatype>()?;
    let mut key = false;
    let mut partial = false;
    for attr in tokens {
        match attr {
            ":key" => key = true,
            ":partial" => partial = true,
            _ => {}
        }
    }
    Field::new(name, datatype, key, partial, comment)
}

fn invalid_line(line: &str, lineno: usize) -> Error {
    Error::new(ErrorKind::SchemaParse)
        .with_message(format!("invalid line: {line}"))
        .with_line(lineno + 1)
}
