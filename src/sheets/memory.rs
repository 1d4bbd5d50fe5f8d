//! In-process tabular API used by tests and offline runs.
//!
//! Behaves like the remote API as far as the store can observe: rows are
//! stored without trailing blanks, appends land after the last non-empty
//! row, and cleared rows stay in place as empty rows. Failures can be scripted per
//! operation, including the ambiguous "append applied, response lost" case.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::api::TabularApi;
use super::types::{CellValue, SheetError};

/// Operation kinds that can be counted and scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOp {
    Read,
    ReadHeader,
    Append,
    Write,
    Clear,
    SheetNames,
    AddSheet,
}

#[derive(Debug, Clone)]
enum Fault {
    /// Fail before doing anything
    Fail(SheetError),
    /// Apply the change, then report the failure
    FailAfterApply(SheetError),
}

#[derive(Debug, Default)]
pub struct MemorySheetsApi {
    sheets: Mutex<BTreeMap<String, Vec<Vec<CellValue>>>>,
    faults: Mutex<HashMap<ApiOp, VecDeque<Fault>>>,
    calls: Mutex<HashMap<ApiOp, usize>>,
    latency: Option<Duration>,
}

impl MemorySheetsApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sheet with the given raw rows (header first)
    pub fn with_sheet(self, name: &str, rows: Vec<Vec<CellValue>>) -> Self {
        if let Ok(mut sheets) = self.sheets.lock() {
            sheets.insert(name.to_string(), rows.into_iter().map(trim_row).collect());
        }
        self
    }

    /// Delay every call by `latency`, so concurrent callers interleave
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next call of `op` fail with `error`
    pub fn fail_next(&self, op: ApiOp, error: SheetError) {
        self.push_fault(op, Fault::Fail(error));
    }

    /// Make the next call of `op` take effect and still report `error`
    pub fn fail_next_after_apply(&self, op: ApiOp, error: SheetError) {
        self.push_fault(op, Fault::FailAfterApply(error));
    }

    fn push_fault(&self, op: ApiOp, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.entry(op).or_default().push_back(fault);
        }
    }

    /// Number of calls made for `op`, failed ones included
    pub fn calls(&self, op: ApiOp) -> usize {
        self.calls
            .lock()
            .map(|c| c.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Raw rows of a sheet, header included
    pub fn rows(&self, sheet: &str) -> Option<Vec<Vec<CellValue>>> {
        self.sheets.lock().ok().and_then(|s| s.get(sheet).cloned())
    }

    /// Record the call and pop any scripted fault for it
    async fn enter(&self, op: ApiOp) -> Result<Option<SheetError>, SheetError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_insert(0) += 1;
        }
        let fault = self
            .faults
            .lock()
            .ok()
            .and_then(|mut f| f.get_mut(&op).and_then(VecDeque::pop_front));
        match fault {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::FailAfterApply(err)) => Ok(Some(err)),
            None => Ok(None),
        }
    }

    fn with_sheet_mut<T>(
        &self,
        sheet: &str,
        f: impl FnOnce(&mut Vec<Vec<CellValue>>) -> Result<T, SheetError>,
    ) -> Result<T, SheetError> {
        let mut sheets = self
            .sheets
            .lock()
            .map_err(|_| SheetError::Transient("memory sheet lock poisoned".to_string()))?;
        let rows = sheets
            .get_mut(sheet)
            .ok_or_else(|| SheetError::NotFound(format!("sheet '{}' does not exist", sheet)))?;
        f(rows)
    }
}

fn trim_row(mut row: Vec<CellValue>) -> Vec<CellValue> {
    while row.last().map(CellValue::is_blank).unwrap_or(false) {
        row.pop();
    }
    row
}

fn finish<T>(value: T, after: Option<SheetError>) -> Result<T, SheetError> {
    match after {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

fn check_index(rows: &[Vec<CellValue>], row_index: u32) -> Result<usize, SheetError> {
    if row_index < 1 {
        return Err(SheetError::Permanent(format!("invalid row index {}", row_index)));
    }
    let pos = (row_index - 1) as usize;
    if pos >= rows.len() {
        return Err(SheetError::Permanent(format!(
            "row {} is beyond the end of the sheet",
            row_index
        )));
    }
    Ok(pos)
}

#[async_trait]
impl TabularApi for MemorySheetsApi {
    async fn read_values(&self, sheet: &str) -> Result<Vec<Vec<CellValue>>, SheetError> {
        let after = self.enter(ApiOp::Read).await?;
        let rows = self.with_sheet_mut(sheet, |rows| Ok(rows.clone()))?;
        finish(rows, after)
    }

    async fn read_header(&self, sheet: &str) -> Result<Vec<String>, SheetError> {
        let after = self.enter(ApiOp::ReadHeader).await?;
        let header = self.with_sheet_mut(sheet, |rows| {
            Ok(rows
                .first()
                .map(|r| r.iter().map(CellValue::as_text).collect())
                .unwrap_or_default())
        })?;
        finish(header, after)
    }

    async fn append_rows(&self, sheet: &str, new_rows: &[Vec<CellValue>]) -> Result<u32, SheetError> {
        let after = self.enter(ApiOp::Append).await?;
        let first = self.with_sheet_mut(sheet, |rows| {
            while rows.last().map(|r| r.is_empty()).unwrap_or(false) {
                rows.pop();
            }
            let first = rows.len() as u32 + 1;
            rows.extend(new_rows.iter().cloned().map(trim_row));
            Ok(first)
        })?;
        finish(first, after)
    }

    async fn write_row(&self, sheet: &str, row_index: u32, cells: &[CellValue]) -> Result<(), SheetError> {
        let after = self.enter(ApiOp::Write).await?;
        self.with_sheet_mut(sheet, |rows| {
            if row_index < 1 {
                return Err(SheetError::Permanent(format!("invalid row index {}", row_index)));
            }
            let pos = (row_index - 1) as usize;
            if pos >= rows.len() {
                rows.resize(pos + 1, Vec::new());
            }
            rows[pos] = trim_row(cells.to_vec());
            Ok(())
        })?;
        finish((), after)
    }

    async fn clear_row(&self, sheet: &str, row_index: u32) -> Result<(), SheetError> {
        let after = self.enter(ApiOp::Clear).await?;
        self.with_sheet_mut(sheet, |rows| {
            let pos = check_index(rows, row_index)?;
            rows[pos].clear();
            Ok(())
        })?;
        finish((), after)
    }

    async fn sheet_names(&self) -> Result<Vec<String>, SheetError> {
        let after = self.enter(ApiOp::SheetNames).await?;
        let names = self
            .sheets
            .lock()
            .map(|s| s.keys().cloned().collect())
            .map_err(|_| SheetError::Transient("memory sheet lock poisoned".to_string()))?;
        finish(names, after)
    }

    async fn add_sheet(&self, sheet: &str) -> Result<(), SheetError> {
        let after = self.enter(ApiOp::AddSheet).await?;
        {
            let mut sheets = self
                .sheets
                .lock()
                .map_err(|_| SheetError::Transient("memory sheet lock poisoned".to_string()))?;
            if sheets.contains_key(sheet) {
                return Err(SheetError::Permanent(format!("sheet '{}' already exists", sheet)));
            }
            sheets.insert(sheet.to_string(), Vec::new());
        }
        finish((), after)
    }
}
