//! Purpose: Encode and decode table rows in the `@`-delimited line format.
//! Exports: `FIELD_DELIMITER`, `escape`, `unescape`, `encode_row`, `decode_row`, `make_row`.
//! Role: The only place that knows the on-disk row syntax.
//! Invariants: `unescape(escape(s)) == s` for every string.
//! Invariants: Escaping order is backslash, newline, delimiter.
//! Invariants: Decoding never fails; unknown escape sequences are kept verbatim.

use crate::core::error::Error;
use crate::core::relations::Relation;
use crate::core::row::RowAccess;

pub const FIELD_DELIMITER: char = '@';

/// Replace reserved characters: `\` → `\\`, newline → `\n`, `@` → `\s`.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            FIELD_DELIMITER => out.push_str("\\s"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape`].
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('s') => out.push(FIELD_DELIMITER),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Escape and join column values into one line (no trailing newline).
pub fn encode_row<S: AsRef<str>>(values: &[S]) -> String {
    let mut line = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            line.push(FIELD_DELIMITER);
        }
        line.push_str(&escape(value.as_ref()));
    }
    line
}

/// Split a raw line into unescaped column values.
pub fn decode_row(line: &str) -> Vec<String> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.split(FIELD_DELIMITER).map(unescape).collect()
}

/// Encode `row` against `relation`, filling absent columns with defaults.
pub fn make_row<R: RowAccess + ?Sized>(row: &R, relation: &Relation) -> Result<String, Error> {
    let mut values = Vec::with_capacity(relation.len());
    for (position, field) in relation.fields().iter().enumerate() {
        let value = match row.column(field.name(), position, false)? {
            Some(value) => value.to_string(),
            None => field.default_value().to_string(),
        };
        values.push(value);
    }
    Ok(encode_row(&values))
}
