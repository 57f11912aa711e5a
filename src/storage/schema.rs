//! Table definitions for the five stores, built from fixed columns plus the
//! configured field lists.

use crate::config::is_identifier;
use crate::error::{IngestError, Result};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    /// Attached database name the table lives in
    pub database: &'static str,
    pub table: &'static str,
    pub columns: Vec<Column>,
    pub primary_key: String,
}

impl TableSchema {
    pub fn qualified_name(&self) -> String {
        format!("{}.\"{}\"", self.database, self.table)
    }

    pub fn column_definition(column: &Column) -> String {
        format!("\"{}\" {}", column.name, column.ty.sql())
    }

    pub fn create_sql(&self) -> String {
        let mut defs: Vec<String> = self.columns.iter().map(Self::column_definition).collect();
        defs.push(format!("PRIMARY KEY (\"{}\")", self.primary_key));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified_name(),
            defs.join(", ")
        )
    }

    /// Insert-if-absent on the primary key.
    pub fn insert_sql(&self) -> String {
        let names: Vec<String> = self.columns.iter().map(|c| format!("\"{}\"", c.name)).collect();
        let placeholders: Vec<String> = (1..=self.columns.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            self.qualified_name(),
            names.join(", "),
            placeholders.join(", ")
        )
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Ordered column list with identifier and uniqueness checks.
///
/// SQLite column names are case-insensitive, so `Gender` and `GENDER` collide.
#[derive(Debug)]
pub struct TableSchemaBuilder {
    database: &'static str,
    table: &'static str,
    columns: Vec<Column>,
    seen: HashSet<String>,
    primary_key: Option<String>,
    error: Option<String>,
}

impl TableSchemaBuilder {
    pub fn new(database: &'static str, table: &'static str) -> Self {
        Self {
            database,
            table,
            columns: Vec::new(),
            seen: HashSet::new(),
            primary_key: None,
            error: None,
        }
    }

    pub fn column(mut self, name: &str, ty: ColumnType) -> Self {
        if self.error.is_some() {
            return self;
        }
        if !is_identifier(name) {
            self.error = Some(format!("'{}' is not a valid column name", name));
        } else if !self.seen.insert(name.to_ascii_lowercase()) {
            self.error = Some(format!("column '{}' defined twice in {}", name, self.table));
        } else {
            self.columns.push(Column {
                name: name.to_string(),
                ty,
            });
        }
        self
    }

    pub fn text_columns<S: AsRef<str>>(self, names: &[S]) -> Self {
        names
            .iter()
            .fold(self, |builder, name| builder.column(name.as_ref(), ColumnType::Text))
    }

    pub fn primary_key(mut self, name: &str) -> Self {
        self.primary_key = Some(name.to_string());
        self
    }

    pub fn build(self) -> Result<TableSchema> {
        if let Some(reason) = self.error {
            return Err(IngestError::Config(reason));
        }
        let primary_key = self.primary_key.ok_or_else(|| {
            IngestError::Config(format!("table {} has no primary key", self.table))
        })?;
        if !self.seen.contains(&primary_key.to_ascii_lowercase()) {
            return Err(IngestError::Config(format!(
                "primary key '{}' is not a column of {}",
                primary_key, self.table
            )));
        }
        Ok(TableSchema {
            database: self.database,
            table: self.table,
            columns: self.columns,
            primary_key,
        })
    }
}

pub fn decoder_schema(phi_fields: &[String]) -> Result<TableSchema> {
    TableSchemaBuilder::new("main", "Decoder")
        .column("EUID", ColumnType::Text)
        .column("PUID", ColumnType::Text)
        .column("BUID", ColumnType::Text)
        .column("ACQ_DATE", ColumnType::Text)
        .column("ACQ_TIME", ColumnType::Text)
        .text_columns(phi_fields)
        .primary_key("EUID")
        .build()
}

pub fn features_schema() -> Result<TableSchema> {
    TableSchemaBuilder::new("features", "Features")
        .column("FEATURE_ID", ColumnType::Text)
        .column("EUID", ColumnType::Text)
        .column("BUID", ColumnType::Text)
        .column("LEAD_INDEX", ColumnType::Integer)
        .column("LEAD", ColumnType::Text)
        .column("FLAT20", ColumnType::Integer)
        .column("CURVE_LENGTH", ColumnType::Real)
        .column("HIST_ENTROPY", ColumnType::Real)
        .column("AUTOCORR_SIMILARITY", ColumnType::Real)
        .primary_key("FEATURE_ID")
        .build()
}

pub fn measurements_schema(resting_fields: &[String]) -> Result<TableSchema> {
    TableSchemaBuilder::new("measurements", "Measurements")
        .column("EUID", ColumnType::Text)
        .column("BUID", ColumnType::Text)
        .column("SAMPLE_BASE", ColumnType::Integer)
        .column("SAMPLE_EXPONENT", ColumnType::Text)
        .column("HIGH_PASS_FILTER", ColumnType::Text)
        .column("LOW_PASS_FILTER", ColumnType::Text)
        .column("AC_FILTER", ColumnType::Text)
        .column("QRS_TIMES", ColumnType::Text)
        .column("GLOBAL_RR", ColumnType::Real)
        .column("QT_RR_RATIO", ColumnType::Real)
        .text_columns(resting_fields)
        .primary_key("EUID")
        .build()
}

pub fn statements_schema() -> Result<TableSchema> {
    TableSchemaBuilder::new("statements", "Statements")
        .column("EUID", ColumnType::Text)
        .column("BUID", ColumnType::Text)
        .column("DIAGNOSIS", ColumnType::Text)
        .column("ORIGINAL_DIAGNOSIS", ColumnType::Text)
        .column("EXTRA_QUESTIONS", ColumnType::Text)
        .column("REASON_FOR_TEST", ColumnType::Text)
        .primary_key("EUID")
        .build()
}

pub fn unparsable_schema() -> Result<TableSchema> {
    TableSchemaBuilder::new("unparsable", "Unparsable")
        .column("FILENAME", ColumnType::Text)
        .column("BUID", ColumnType::Text)
        .column("REASON", ColumnType::Text)
        .primary_key("FILENAME")
        .build()
}
