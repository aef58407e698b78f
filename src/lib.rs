//! Purpose: Library crate for [incr tsdb()] test-suite storage used by the `itsdb` CLI and tests.
//! Exports: `api` (schema, tables, suites, relational operations, errors).
//! Role: Public surface lives in `api`; `core` holds the implementation.
//! Invariants: Everything is single-threaded; tables share slots through `Rc`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
mod core;
