//! SQL processing module
//!
//! This module provides:
//! - `parser`: SQL lexer, token parser and DDL patterns
//! - `types`: cell values and column data types
//! - `schema`: workbook, sheet, column and row definitions
//! - `executor`: query, mutation and DDL execution
//! - `engine`: engine, sessions and the worker pool

pub mod parser;
pub mod types;
pub mod schema;
pub mod executor;
pub mod engine;
