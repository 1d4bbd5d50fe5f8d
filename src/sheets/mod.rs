//! Spreadsheet-backed record storage.
//!
//! This module provides:
//! - Table schemas and the row codec between cells and typed records
//! - A retrying client over the remote tabular API (HTTP or in-memory)
//! - Record CRUD, batches, in-memory queries and aggregates
//! - Structure checks of live sheets against their schemas

pub mod types;
pub mod schema;
pub mod codec;
pub mod retry;
pub mod api;
pub mod http;
pub mod memory;
pub mod client;
pub mod validator;
pub mod query;
pub mod aggregate;
pub mod store;

// Re-export commonly used types and functions
pub use types::*;
pub use schema::{ColumnDef, ColumnType, SchemaRegistry, TableSchema};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use api::TabularApi;
pub use http::HttpSheetsApi;
pub use memory::{ApiOp, MemorySheetsApi};
pub use client::{HeaderStatus, SheetsClient};
pub use validator::{SchemaDiff, StructureReport, StructureStatus};
pub use query::{Filter, FilterOperator, Query, Sort, SortDirection};
pub use aggregate::{AggregateFunction, AggregateSummary};
pub use store::{BatchOperation, BatchReport, OperationOutcome, OperationStatus, SheetStore};
