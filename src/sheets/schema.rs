use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::types::{SheetError, ID_COLUMN};

/// Column maintained on create
pub const CREATED_AT_COLUMN: &str = "created_at";
/// Column maintained on create and update
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Declared type of a column. Drives decoding and record validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    Boolean,
    Date,
    Json,
    /// No declared type: decoding falls back to value sniffing
    Any,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Json => "json",
            ColumnType::Any => "any",
        }
    }
}

/// Definition of a single column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub required: bool,
    pub allowed_values: Option<Vec<String>>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        ColumnDef {
            name: name.into(),
            column_type,
            required: false,
            allowed_values: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

/// Static definition of one table: sheet name, entity name and ordered columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Singular entity name, used as the id prefix
    pub entity: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, entity: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        TableSchema {
            name: name.into(),
            entity: entity.into(),
            columns,
        }
    }

    /// The expected header row
    pub fn header(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn check(&self) -> Result<(), SheetError> {
        if self.name.trim().is_empty() {
            return Err(SheetError::Permanent("table name must not be empty".to_string()));
        }
        if !self.has_column(ID_COLUMN) {
            return Err(SheetError::Permanent(format!(
                "table '{}' has no '{}' column",
                self.name, ID_COLUMN
            )));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SheetError::Permanent(format!(
                    "table '{}' declares column '{}' twice",
                    self.name, column.name
                )));
            }
        }
        Ok(())
    }
}

/// The set of tables the store knows about
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: Vec<TableSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the business tables: projects, tasks, clients, invoices
    pub fn builtin() -> Self {
        SchemaRegistry {
            tables: vec![projects(), tasks(), clients(), invoices()],
        }
    }

    /// Add a table. Replacing a registered table is not allowed since the
    /// header order of an established sheet must never change.
    pub fn register(&mut self, schema: TableSchema) -> Result<(), SheetError> {
        schema.check()?;
        if self.get(&schema.name).is_some() {
            return Err(SheetError::Permanent(format!(
                "table '{}' is already registered",
                schema.name
            )));
        }
        self.tables.push(schema);
        Ok(())
    }

    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == table)
    }

    /// Look up a table, failing with `NotFound` for unknown names
    pub fn require(&self, table: &str) -> Result<&TableSchema, SheetError> {
        self.get(table)
            .ok_or_else(|| SheetError::NotFound(format!("table '{}' is not registered", table)))
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }
}

fn timestamps() -> [ColumnDef; 2] {
    [
        ColumnDef::new(CREATED_AT_COLUMN, ColumnType::Date),
        ColumnDef::new(UPDATED_AT_COLUMN, ColumnType::Date),
    ]
}

fn projects() -> TableSchema {
    let mut columns = vec![
        ColumnDef::new("id", ColumnType::Text).required(),
        ColumnDef::new("name", ColumnType::Text).required(),
        ColumnDef::new("description", ColumnType::Text),
        ColumnDef::new("client_id", ColumnType::Text),
        ColumnDef::new("status", ColumnType::Text)
            .required()
            .one_of(&["planning", "active", "on_hold", "completed", "cancelled"]),
        ColumnDef::new("start_date", ColumnType::Date),
        ColumnDef::new("end_date", ColumnType::Date),
        ColumnDef::new("budget", ColumnType::Number),
        ColumnDef::new("tags", ColumnType::Json),
    ];
    columns.extend(timestamps());
    TableSchema::new("projects", "project", columns)
}

fn tasks() -> TableSchema {
    let mut columns = vec![
        ColumnDef::new("id", ColumnType::Text).required(),
        ColumnDef::new("project_id", ColumnType::Text).required(),
        ColumnDef::new("title", ColumnType::Text).required(),
        ColumnDef::new("description", ColumnType::Text),
        ColumnDef::new("status", ColumnType::Text)
            .required()
            .one_of(&["todo", "in_progress", "review", "completed"]),
        ColumnDef::new("priority", ColumnType::Text).one_of(&["low", "medium", "high", "urgent"]),
        ColumnDef::new("assignee", ColumnType::Text),
        ColumnDef::new("due_date", ColumnType::Date),
        ColumnDef::new("estimated_hours", ColumnType::Number),
        ColumnDef::new("actual_hours", ColumnType::Number),
    ];
    columns.extend(timestamps());
    TableSchema::new("tasks", "task", columns)
}

fn clients() -> TableSchema {
    let mut columns = vec![
        ColumnDef::new("id", ColumnType::Text).required(),
        ColumnDef::new("name", ColumnType::Text).required(),
        ColumnDef::new("email", ColumnType::Text),
        ColumnDef::new("phone", ColumnType::Text),
        ColumnDef::new("company", ColumnType::Text),
        ColumnDef::new("address", ColumnType::Json),
        ColumnDef::new("notes", ColumnType::Text),
    ];
    columns.extend(timestamps());
    TableSchema::new("clients", "client", columns)
}

fn invoices() -> TableSchema {
    let mut columns = vec![
        ColumnDef::new("id", ColumnType::Text).required(),
        ColumnDef::new("invoice_number", ColumnType::Text).required(),
        ColumnDef::new("client_id", ColumnType::Text).required(),
        ColumnDef::new("project_id", ColumnType::Text),
        ColumnDef::new("issue_date", ColumnType::Date).required(),
        ColumnDef::new("due_date", ColumnType::Date),
        ColumnDef::new("status", ColumnType::Text)
            .required()
            .one_of(&["draft", "sent", "paid", "overdue", "cancelled"]),
        ColumnDef::new("line_items", ColumnType::Json),
        ColumnDef::new("subtotal", ColumnType::Number),
        ColumnDef::new("tax", ColumnType::Number),
        ColumnDef::new("total", ColumnType::Number),
        ColumnDef::new("paid", ColumnType::Boolean),
    ];
    columns.extend(timestamps());
    TableSchema::new("invoices", "invoice", columns)
}
