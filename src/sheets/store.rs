//! Record-level storage over the sheets client.
//!
//! Every mutation is a read-modify-write against the remote sheet with no
//! locking in between. Two callers updating the same record concurrently
//! both read the old row, and whichever write lands second wins; the other
//! change is lost without any error. A delete racing an update of the same
//! record can likewise resurrect it. Rows never move (a delete blanks its
//! row), so a stale row index still points at the record it was read for,
//! unless that record was deleted from the end of the sheet and a later
//! append took over the blank row. Batches are not atomic either: each operation's outcome is reported
//! individually.

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::aggregate::{self, AggregateSummary};
use super::client::{HeaderStatus, SheetsClient};
use super::codec::{decode_row, encode_onto, encode_record, unknown_fields};
use super::query::{self, Query};
use super::schema::{SchemaRegistry, TableSchema, CREATED_AT_COLUMN, UPDATED_AT_COLUMN};
use super::types::{FieldValue, Record, SheetData, SheetError, ValidationIssue, ID_COLUMN};
use super::validator::{self, StructureReport};
use crate::config::StoreConfig;

/// One instruction of a [`SheetStore::batch_update`] call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOperation {
    Create {
        table: String,
        record: Record,
    },
    Update {
        table: String,
        id: String,
        changes: Record,
    },
}

impl BatchOperation {
    pub fn table(&self) -> &str {
        match self {
            BatchOperation::Create { table, .. } | BatchOperation::Update { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Applied { id: String },
    /// Update target does not exist
    NotFound,
    /// Rejected before anything was sent
    Invalid { issues: Vec<ValidationIssue> },
    Failed { error: String },
    /// Not attempted because an earlier operation failed permanently
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub index: usize,
    pub table: String,
    pub status: OperationStatus,
}

/// Per-operation result of a batch, in submission order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<OperationOutcome>,
}

impl BatchReport {
    pub fn all_applied(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o.status, OperationStatus::Applied { .. }))
    }

    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, OperationStatus::Applied { .. }))
            .count()
    }
}

/// Typed record store backed by one spreadsheet
pub struct SheetStore {
    client: SheetsClient,
    registry: SchemaRegistry,
}

impl SheetStore {
    pub fn new(client: SheetsClient, registry: SchemaRegistry) -> Self {
        Self { client, registry }
    }

    /// Store over the HTTP API with the built-in tables
    pub fn from_config(config: &StoreConfig) -> Result<Self, SheetError> {
        Ok(Self::new(SheetsClient::from_config(config)?, SchemaRegistry::builtin()))
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn client(&self) -> &SheetsClient {
        &self.client
    }

    // ==================== Provisioning ====================

    /// Create every registered sheet and header that does not exist yet.
    /// Existing headers are compared, never rewritten.
    pub async fn initialize_sheets(&self) -> Result<Vec<(String, HeaderStatus)>, SheetError> {
        let mut statuses = Vec::new();
        for schema in self.registry.tables() {
            let status = self
                .client
                .ensure_header(schema)
                .await
                .map_err(|e| e.with_context(&schema.name, "initialize"))?;
            statuses.push((schema.name.clone(), status));
        }
        tracing::info!(tables = statuses.len(), "sheets initialized");
        Ok(statuses)
    }

    pub async fn validate_sheet_structure(&self, table: &str) -> Result<StructureReport, SheetError> {
        let check = async {
            let schema = self.registry.require(table)?;
            let live = self.client.read_header(table).await?;
            Ok::<_, SheetError>(validator::check_structure(schema, live.as_deref()))
        };
        check.await.map_err(|e| e.with_context(table, "validate_structure"))
    }

    /// Structure report for every registered table, checked concurrently.
    /// A table that cannot be read is reported as unreachable.
    pub async fn validate_all_sheets(&self) -> Vec<StructureReport> {
        let checks = self
            .registry
            .tables()
            .iter()
            .map(|schema| async move {
                match self.validate_sheet_structure(&schema.name).await {
                    Ok(report) => report,
                    Err(err) => StructureReport::unreachable(&schema.name, err.root().to_string()),
                }
            });
        join_all(checks).await
    }

    pub fn validate_record_data(&self, table: &str, record: &Record) -> Result<Vec<ValidationIssue>, SheetError> {
        let schema = self.registry.require(table)?;
        Ok(validator::validate_record_data(schema, record))
    }

    // ==================== Create ====================

    /// Validate and append one record, returning its id
    pub async fn create(&self, table: &str, record: Record) -> Result<String, SheetError> {
        let mut ids = self
            .insert(table, vec![record])
            .await
            .map_err(|e| e.with_context(table, "create"))?;
        ids.pop()
            .ok_or_else(|| SheetError::Permanent("append returned no id".to_string()).with_context(table, "create"))
    }

    /// Validate all records, then append them in a single request. Nothing is
    /// written when any record is invalid. Ids come back in input order.
    pub async fn batch_create(&self, table: &str, records: Vec<Record>) -> Result<Vec<String>, SheetError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.insert(table, records)
            .await
            .map_err(|e| e.with_context(table, "batch_create"))
    }

    async fn insert(&self, table: &str, records: Vec<Record>) -> Result<Vec<String>, SheetError> {
        let schema = self.registry.require(table)?;
        let now = timestamp();

        let mut issues = Vec::new();
        let mut prepared = Vec::with_capacity(records.len());
        let mut supplied: Vec<(usize, String)> = Vec::new();
        for (i, mut record) in records.into_iter().enumerate() {
            drop_unknown(schema, &mut record);
            match record.id() {
                Some(id) => supplied.push((i, id.trim().to_string())),
                None => record.set(ID_COLUMN, generate_id(&schema.entity)),
            }
            for column in [CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
                if schema.has_column(column) && record.get(column).map_or(true, FieldValue::is_empty) {
                    record.set(column, now.clone());
                }
            }
            issues.extend(
                validator::validate_record_data(schema, &record)
                    .into_iter()
                    .map(|issue| issue.at(i)),
            );
            prepared.push(record);
        }

        if !supplied.is_empty() {
            issues.extend(self.duplicate_ids(table, &supplied).await?);
        }

        if !issues.is_empty() {
            return Err(SheetError::Validation {
                table: table.to_string(),
                issues,
            });
        }

        let layout = self.client.layout(table).await?;
        let rows: Vec<_> = prepared
            .iter()
            .map(|record| encode_record(schema, &layout, record))
            .collect();
        let ids: Vec<String> = prepared
            .iter()
            .filter_map(|record| record.id().map(str::to_string))
            .collect();

        let first = self.client.append_rows(table, &rows, &ids).await?;
        tracing::debug!(table, first_row = first, count = ids.len(), "records appended");
        Ok(ids)
    }

    /// Caller-supplied ids that repeat within the batch or already exist.
    /// Generated ids are not checked, so the common create stays one append.
    async fn duplicate_ids(
        &self,
        table: &str,
        supplied: &[(usize, String)],
    ) -> Result<Vec<ValidationIssue>, SheetError> {
        let data = self.client.fetch_all(table).await?;
        let mut taken: HashSet<String> = match data.header.iter().position(|h| h == ID_COLUMN) {
            Some(pos) => data
                .rows
                .iter()
                .filter_map(|row| row.cells.get(pos))
                .map(|cell| cell.as_text().trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            None => HashSet::new(),
        };

        Ok(supplied
            .iter()
            .filter(|(_, id)| !taken.insert(id.clone()))
            .map(|(i, id)| ValidationIssue::new(ID_COLUMN, format!("'{}' is already in use", id)).at(*i))
            .collect())
    }

    // ==================== Read ====================

    /// All records of a table, or only the one with `id`. An unknown id is an
    /// empty result, not an error.
    pub async fn read(&self, table: &str, id: Option<&str>) -> Result<Vec<Record>, SheetError> {
        let records = self
            .fetch_records(table)
            .await
            .map_err(|e| e.with_context(table, "read"))?;
        Ok(match id {
            Some(id) => records.into_iter().filter(|r| r.id() == Some(id)).collect(),
            None => records,
        })
    }

    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, SheetError> {
        Ok(self.read(table, Some(id)).await?.into_iter().next())
    }

    /// Fetch the table and run `query` over it in memory
    pub async fn query(&self, table: &str, query: &Query) -> Result<Vec<Record>, SheetError> {
        let records = self
            .fetch_records(table)
            .await
            .map_err(|e| e.with_context(table, "query"))?;
        Ok(query::apply(records, query))
    }

    /// Number of records matching the filters of `query`, ignoring its page window
    pub async fn count(&self, table: &str, query: &Query) -> Result<usize, SheetError> {
        let unpaged = Query {
            filters: query.filters.clone(),
            ..Query::default()
        };
        Ok(self.query(table, &unpaged).await?.len())
    }

    pub async fn aggregate(&self, table: &str, query: &Query, field: &str) -> Result<AggregateSummary, SheetError> {
        let records = self.query(table, query).await?;
        Ok(aggregate::aggregate(&records, field))
    }

    pub async fn aggregate_by(
        &self,
        table: &str,
        query: &Query,
        group_field: &str,
        field: &str,
    ) -> Result<BTreeMap<String, AggregateSummary>, SheetError> {
        let records = self.query(table, query).await?;
        Ok(aggregate::aggregate_by(&records, group_field, field))
    }

    async fn fetch_records(&self, table: &str) -> Result<Vec<Record>, SheetError> {
        let schema = self.registry.require(table)?;
        let data = self.client.fetch_all(table).await?;
        let mut records = Vec::with_capacity(data.rows.len());
        for row in &data.rows {
            let record = decode_row(schema, &data.header, &row.cells);
            if record.id().is_none() {
                tracing::warn!(table, row = row.index, "skipping row without an id");
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }

    // ==================== Update / Delete ====================

    /// Merge `changes` over the stored record and rewrite its row.
    ///
    /// Returns `false` when no record has `id`. `true` only means the row was
    /// rewritten, not that any value differed.
    pub async fn update(&self, table: &str, id: &str, changes: Record) -> Result<bool, SheetError> {
        let run = async {
            let schema = self.registry.require(table)?;
            let mut data = self.client.fetch_all(table).await?;
            self.apply_update(schema, &mut data, id, changes).await
        };
        run.await.map_err(|e| e.with_context(table, "update"))
    }

    async fn apply_update(
        &self,
        schema: &TableSchema,
        data: &mut SheetData,
        id: &str,
        mut changes: Record,
    ) -> Result<bool, SheetError> {
        if let Some(new_id) = changes.remove(ID_COLUMN) {
            if new_id.to_string() != id {
                tracing::warn!(table = %schema.name, id, "ignoring attempt to change a record id");
            }
        }
        drop_unknown(schema, &mut changes);

        let Some(pos) = find_row(data, id) else {
            return Ok(false);
        };

        let mut merged = decode_row(schema, &data.header, &data.rows[pos].cells);
        for (field, value) in changes {
            merged.set(field, value);
        }
        if schema.has_column(UPDATED_AT_COLUMN) {
            merged.set(UPDATED_AT_COLUMN, timestamp());
        }

        let issues = validator::validate_record_data(schema, &merged);
        if !issues.is_empty() {
            return Err(SheetError::Validation {
                table: schema.name.clone(),
                issues,
            });
        }

        let index = data.rows[pos].index;
        let cells = encode_onto(schema, &data.header, &merged, &data.rows[pos].cells);
        self.client.write_row(&schema.name, index, &cells).await?;
        data.rows[pos].cells = cells;
        Ok(true)
    }

    /// Clear the record's row, leaving a blank tombstone so no other row
    /// moves. Returns `false` when no record has `id`.
    pub async fn delete(&self, table: &str, id: &str) -> Result<bool, SheetError> {
        let run = async {
            self.registry.require(table)?;
            let data = self.client.fetch_all(table).await?;
            let Some(pos) = find_row(&data, id) else {
                return Ok(false);
            };
            self.client.clear_row(table, data.rows[pos].index).await?;
            tracing::debug!(table, id, row = data.rows[pos].index, "record deleted");
            Ok::<_, SheetError>(true)
        };
        run.await.map_err(|e| e.with_context(table, "delete"))
    }

    // ==================== Batches ====================

    /// Apply operations in order and report each outcome.
    ///
    /// Not atomic: operations that were applied stay applied when a later one
    /// fails. The first non-retryable failure stops the batch and every
    /// remaining operation is reported `Skipped`. A failure that only ran out
    /// of retries is reported and the batch carries on. Each table is read at
    /// most once per batch for its updates.
    pub async fn batch_update(&self, operations: Vec<BatchOperation>) -> BatchReport {
        let mut snapshots: HashMap<String, SheetData> = HashMap::new();
        let mut report = BatchReport::default();
        let mut halted = false;

        for (index, operation) in operations.into_iter().enumerate() {
            let table = operation.table().to_string();
            let status = if halted {
                OperationStatus::Skipped
            } else {
                let result = match operation {
                    BatchOperation::Create { table, record } => {
                        // A later update on this table must see the new row
                        snapshots.remove(&table);
                        self.create(&table, record).await.map(Some)
                    }
                    BatchOperation::Update { table, id, changes } => {
                        match self.batch_update_one(&mut snapshots, &table, &id, changes).await {
                            Ok(true) => Ok(Some(id)),
                            Ok(false) => Ok(None),
                            Err(err) => Err(err.with_context(&table, "batch_update")),
                        }
                    }
                };

                match result {
                    Ok(Some(id)) => OperationStatus::Applied { id },
                    Ok(None) => OperationStatus::NotFound,
                    Err(err) => match err.issues() {
                        Some(issues) => OperationStatus::Invalid {
                            issues: issues.to_vec(),
                        },
                        None => {
                            if !err.class().is_retryable() {
                                tracing::warn!(index, error = %err, "batch stopped by permanent failure");
                                halted = true;
                            }
                            OperationStatus::Failed {
                                error: err.to_string(),
                            }
                        }
                    },
                }
            };
            report.outcomes.push(OperationOutcome { index, table, status });
        }

        report
    }

    async fn batch_update_one(
        &self,
        snapshots: &mut HashMap<String, SheetData>,
        table: &str,
        id: &str,
        changes: Record,
    ) -> Result<bool, SheetError> {
        let schema = self.registry.require(table)?;
        if !snapshots.contains_key(table) {
            let data = self.client.fetch_all(table).await?;
            snapshots.insert(table.to_string(), data);
        }
        let data = snapshots
            .get_mut(table)
            .ok_or_else(|| SheetError::Transient(format!("snapshot of '{}' missing", table)))?;
        self.apply_update(schema, data, id, changes).await
    }
}

fn find_row(data: &SheetData, id: &str) -> Option<usize> {
    let id_pos = data.header.iter().position(|h| h == ID_COLUMN)?;
    data.rows.iter().position(|row| {
        row.cells
            .get(id_pos)
            .map(|c| c.as_text().trim() == id)
            .unwrap_or(false)
    })
}

fn drop_unknown(schema: &TableSchema, record: &mut Record) {
    for field in unknown_fields(schema, record) {
        tracing::warn!(table = %schema.name, field = %field, "dropping field not in schema");
        record.remove(&field);
    }
}

fn timestamp() -> FieldValue {
    FieldValue::DateTime(Utc::now().fixed_offset())
}

/// `<entity>_<base36 millis><random base36 suffix>`. Unlikely to collide at
/// normal write rates but not guaranteed unique.
pub fn generate_id(entity: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| to_base36_digit(rng.random_range(0..36)))
        .collect();
    format!("{}_{}{}", entity, to_base36(millis), suffix)
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(to_base36_digit((n % 36) as u32));
        n /= 36;
    }
    digits.iter().rev().collect()
}

fn to_base36_digit(d: u32) -> char {
    std::char::from_digit(d, 36).unwrap_or('0')
}
