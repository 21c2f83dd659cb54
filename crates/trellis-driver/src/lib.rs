//! Trellis Driver - driver boundary implementations
//!
//! This crate provides implementations of the `trellis_core::Driver`
//! boundary. The in-memory driver replays scripted result sets and records
//! every statement, which is enough to exercise compilation, resolution and
//! the cardinality guard without a database.

#![allow(clippy::result_large_err)]

pub mod error;
pub mod memory;

pub use error::{DriverError, DriverResult};
pub use memory::{MemoryDriver, MemoryTransaction, Statement};
