//! Purpose: Define the public Rust API boundary for itsdb.
//! Exports: Schema, record, table and suite types plus the relational operations.
//! Role: Public, additive-only surface; hides the file-level helpers.
//! Invariants: This module is the only public path to the storage types.
//! Invariants: Internal modules remain private and are not directly exposed.

pub use crate::core::codec::{FIELD_DELIMITER, decode_row, encode_row, escape, make_row, unescape};
pub use crate::core::encoding::TextEncoding;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::process::{
    DEFAULT_TASK_SELECTORS, FieldMapper, ProcessOptions, ProcessOutcome, ProcessSource, Processor,
};
pub use crate::core::record::Record;
pub use crate::core::relations::{Field, RELATIONS_FILENAME, Relation, Relations};
pub use crate::core::row::{IntoRow, RowAccess, RowMap};
pub use crate::core::select::{
    JoinHow, Matched, SelectMode, Selected, join, match_rows, parse_data_specifier, project_row,
    select_rows, split_columns,
};
pub use crate::core::suite::{
    SuiteOptions, SuiteWriteOptions, TableData, TablesToWrite, TestSuite,
};
pub use crate::core::table::{Rows, Table, WriteOptions};
pub use crate::core::table_file::{resolve_table_path, table_size};
pub use crate::core::value::{Datatype, Value, parse_datetime};
