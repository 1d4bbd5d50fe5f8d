use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::api::TabularApi;
use super::http::HttpSheetsApi;
use super::retry::RetryPolicy;
use super::schema::TableSchema;
use super::types::{CellValue, Row, SheetData, SheetError, ID_COLUMN};
use super::validator::{diff_headers, SchemaDiff};
use crate::config::StoreConfig;

/// Outcome of provisioning a table's header row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "diffs", rename_all = "snake_case")]
pub enum HeaderStatus {
    /// The sheet did not exist and was created with its header
    Created,
    /// The sheet existed without a header; the header was written
    Written,
    /// The live header matches the schema
    Matched,
    /// The live header differs; it was left untouched
    Drifted(Vec<SchemaDiff>),
}

/// Shared handle to the remote tabular API.
///
/// Every call goes through the retry policy. Header rows are cached per
/// table once seen, since an established header never changes.
pub struct SheetsClient {
    api: Arc<dyn TabularApi>,
    retry: RetryPolicy,
    headers: RwLock<HashMap<String, Vec<String>>>,
}

impl SheetsClient {
    pub fn new(api: Arc<dyn TabularApi>, retry: RetryPolicy) -> Self {
        Self {
            api,
            retry,
            headers: RwLock::new(HashMap::new()),
        }
    }

    /// Client talking HTTP to the spreadsheet named in `config`
    pub fn from_config(config: &StoreConfig) -> Result<Self, SheetError> {
        let api = HttpSheetsApi::new(config)?;
        Ok(Self::new(Arc::new(api), config.retry.clone()))
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Full-sheet read. Data rows start at index 2; wholly blank rows are
    /// dropped so they never decode into records.
    pub async fn fetch_all(&self, table: &str) -> Result<SheetData, SheetError> {
        let values = self
            .retry
            .run("fetch_all", |_| self.api.read_values(table))
            .await?;

        let mut values = values.into_iter();
        let header: Vec<String> = values
            .next()
            .map(|row| row.iter().map(|c| c.as_text().trim().to_string()).collect())
            .unwrap_or_default();

        let rows = values
            .enumerate()
            .filter(|(_, cells)| !cells.iter().all(CellValue::is_blank))
            .map(|(i, cells)| Row {
                index: i as u32 + 2,
                cells,
            })
            .collect();

        if !header.is_empty() {
            self.remember_header(table, &header).await;
        }
        Ok(SheetData { header, rows })
    }

    /// Live header row, `None` when the sheet does not exist
    pub async fn read_header(&self, table: &str) -> Result<Option<Vec<String>>, SheetError> {
        match self.retry.run("read_header", |_| self.api.read_header(table)).await {
            Ok(header) => {
                let header: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
                if !header.is_empty() {
                    self.remember_header(table, &header).await;
                }
                Ok(Some(header))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Titles of every sheet in the spreadsheet
    pub async fn sheet_names(&self) -> Result<Vec<String>, SheetError> {
        self.retry.run("sheet_names", |_| self.api.sheet_names()).await
    }

    /// Header used to position cells, served from cache when possible
    pub async fn layout(&self, table: &str) -> Result<Vec<String>, SheetError> {
        if let Some(header) = self.headers.read().await.get(table) {
            return Ok(header.clone());
        }
        match self.read_header(table).await? {
            Some(header) if !header.is_empty() => Ok(header),
            _ => Err(SheetError::NotFound(format!(
                "sheet '{}' has no header row; run initialize first",
                table
            ))),
        }
    }

    async fn remember_header(&self, table: &str, header: &[String]) {
        self.headers
            .write()
            .await
            .insert(table.to_string(), header.to_vec());
    }

    /// Append rows in one request and return the index of the first.
    ///
    /// An append is not idempotent: a failure after the request left may
    /// still have added the rows. Before every retry the sheet is re-read and,
    /// when each of `ids` is present exactly once, the earlier attempt is
    /// taken as applied instead of appending a second copy.
    ///
    /// `ids` must be absent from the sheet before the call; otherwise a
    /// pre-existing row would be mistaken for the appended one.
    pub async fn append_rows(
        &self,
        table: &str,
        rows: &[Vec<CellValue>],
        ids: &[String],
    ) -> Result<u32, SheetError> {
        if rows.is_empty() {
            return Err(SheetError::Permanent("nothing to append".to_string()));
        }

        self.retry
            .run("append_rows", |attempt| async move {
                if attempt > 0 && !ids.is_empty() {
                    if let Some(index) = self.find_appended(table, ids).await? {
                        tracing::info!(table, index, "earlier append attempt was applied; not appending again");
                        return Ok(index);
                    }
                }
                self.api.append_rows(table, rows).await
            })
            .await
    }

    /// Index of the first row carrying one of `ids`, when every id is present.
    /// An id found on more than one row means an unexpected duplicate.
    async fn find_appended(&self, table: &str, ids: &[String]) -> Result<Option<u32>, SheetError> {
        let values = self.api.read_values(table).await?;
        let Some(id_pos) = values
            .first()
            .and_then(|h| h.iter().position(|c| c.as_text().trim() == ID_COLUMN))
        else {
            return Ok(None);
        };

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut found: HashMap<&str, usize> = HashMap::new();
        let mut first = None;

        for (i, row) in values.iter().enumerate().skip(1) {
            let id = row.get(id_pos).map(CellValue::as_text).unwrap_or_default();
            if let Some(id) = wanted.get(id.trim()) {
                *found.entry(*id).or_insert(0) += 1;
                first.get_or_insert(i as u32 + 1);
            }
        }

        if let Some((id, count)) = found.iter().find(|(_, count)| **count > 1) {
            return Err(SheetError::Permanent(format!(
                "id '{}' appears on {} rows of '{}'",
                id, count, table
            )));
        }

        if found.len() == wanted.len() {
            Ok(first)
        } else if found.is_empty() {
            Ok(None)
        } else {
            Err(SheetError::Permanent(format!(
                "append to '{}' partially applied ({} of {} rows present)",
                table,
                found.len(),
                wanted.len()
            )))
        }
    }

    /// Overwrite a data row. The caller has already merged unchanged columns.
    pub async fn write_row(&self, table: &str, row_index: u32, cells: &[CellValue]) -> Result<(), SheetError> {
        check_data_row(row_index)?;
        self.retry
            .run("write_row", |_| self.api.write_row(table, row_index, cells))
            .await
    }

    /// Blank a data row in place. The tombstone keeps every other row at its
    /// index and is dropped by [`fetch_all`](Self::fetch_all). Clearing twice
    /// is harmless, so the call is retried like any other.
    pub async fn clear_row(&self, table: &str, row_index: u32) -> Result<(), SheetError> {
        check_data_row(row_index)?;
        self.retry
            .run("clear_row", |_| self.api.clear_row(table, row_index))
            .await
    }

    /// Create the sheet and header if absent. An existing header is never
    /// overwritten; drift is reported instead.
    pub async fn ensure_header(&self, schema: &TableSchema) -> Result<HeaderStatus, SheetError> {
        let table = schema.name.as_str();
        let expected = schema.header();

        let status = match self.read_header(table).await? {
            None => {
                self.retry.run("add_sheet", |_| self.api.add_sheet(table)).await?;
                self.write_header(table, &expected).await?;
                HeaderStatus::Created
            }
            Some(live) if live.iter().all(|h| h.is_empty()) => {
                self.write_header(table, &expected).await?;
                HeaderStatus::Written
            }
            Some(live) => {
                let diffs = diff_headers(&expected, &live);
                if diffs.is_empty() {
                    HeaderStatus::Matched
                } else {
                    tracing::warn!(table, drift = diffs.len(), "live header differs from schema");
                    HeaderStatus::Drifted(diffs)
                }
            }
        };

        tracing::info!(table, ?status, "header checked");
        Ok(status)
    }

    async fn write_header(&self, table: &str, header: &[String]) -> Result<(), SheetError> {
        let cells: Vec<CellValue> = header.iter().map(|h| CellValue::String(h.clone())).collect();
        self.retry
            .run("write_header", |_| self.api.write_row(table, 1, &cells))
            .await?;
        self.remember_header(table, header).await;
        Ok(())
    }
}

fn check_data_row(row_index: u32) -> Result<(), SheetError> {
    if row_index < 2 {
        return Err(SheetError::Permanent(format!(
            "row {} is not a data row",
            row_index
        )));
    }
    Ok(())
}
