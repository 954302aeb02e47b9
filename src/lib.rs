//! microsql: a tiny embedded SQL storage engine.
//!
//! Tables persist in a single file of fixed-size pages. Rows are keyed by
//! an internal row-id in a B+-tree whose leaves chain left to right;
//! primary keys get their own unique B-tree index; large text values spill
//! into overflow page chains; freed pages recycle through a free list
//! anchored in the page-0 header. The SQL text itself, the network
//! protocol and the CLI live with the embedding application; this crate
//! consumes inert [`statement::Statement`] records.

#[macro_use]
mod errors;

pub mod cancel;
pub mod config;
pub mod database;
pub mod statement;
pub mod storage;

pub use cancel::CancellationToken;
pub use config::EngineConfig;
pub use database::{Connection, Database, ExecResult};
pub use errors::Error;
pub use statement::{
    CompareOp, Condition, CreateTable, Delete, DropTable, Filter, Insert, Operand, Projection,
    Select, Statement, Update,
};
pub use storage::column::{Column, ColumnKind, Value};
pub use storage::row::Row;
