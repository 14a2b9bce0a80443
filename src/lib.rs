//! sheetsql - SQL over spreadsheet files
//!
//! A directory of workbooks is the database and each sheet is a table:
//! - `sql`: parser, predicate evaluator, executors, engine and sessions
//! - `storage`: workbook files, the xlsx/xls/csv codec and atomic writes
//! - `cache`: workbook, sheet and result caches tied to file stamps
//! - `index`: B+Tree column indexes persisted with bincode
//! - `config`: JSON configuration with defaults

pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod sql;
pub mod storage;
