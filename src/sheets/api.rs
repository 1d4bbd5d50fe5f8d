use async_trait::async_trait;

use super::types::{CellValue, SheetError};

/// The remote tabular API the store is built on.
///
/// Row indexes are 1-based sheet positions; row 1 holds the header. Every
/// method performs exactly one remote request, retries are layered on top by
/// the [`SheetsClient`](super::client::SheetsClient).
#[async_trait]
pub trait TabularApi: Send + Sync {
    /// Every row of the sheet, header included. Trailing blank cells may be
    /// omitted, so rows can be shorter than the header.
    async fn read_values(&self, sheet: &str) -> Result<Vec<Vec<CellValue>>, SheetError>;

    /// First row of the sheet. `NotFound` when the sheet does not exist.
    async fn read_header(&self, sheet: &str) -> Result<Vec<String>, SheetError>;

    /// Append rows after the last non-empty row in a single request and
    /// return the index assigned to the first of them.
    async fn append_rows(&self, sheet: &str, rows: &[Vec<CellValue>]) -> Result<u32, SheetError>;

    /// Overwrite the row at `row_index` with `cells`, starting at column A
    async fn write_row(&self, sheet: &str, row_index: u32, cells: &[CellValue]) -> Result<(), SheetError>;

    /// Blank every cell of the row at `row_index`. Other rows keep their
    /// positions.
    async fn clear_row(&self, sheet: &str, row_index: u32) -> Result<(), SheetError>;

    async fn sheet_names(&self) -> Result<Vec<String>, SheetError>;

    async fn add_sheet(&self, sheet: &str) -> Result<(), SheetError>;
}
