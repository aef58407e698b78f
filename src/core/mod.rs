// Core modules implementing the schema, row codec, table storage and suite operations.
pub mod codec;
pub mod encoding;
pub mod error;
pub mod process;
pub mod record;
pub mod relations;
pub mod row;
pub mod select;
pub mod suite;
pub mod table;
pub mod table_file;
pub mod value;
