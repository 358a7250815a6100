use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::query_log::{interpolate_for_display, QueryLogEntry, QueryLogSink};
use crate::sql_generator::{Dialect, SqlStatement, TableRef};
use crate::value::Record;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutorError {
    message: String,
}

impl ExecutorError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryField {
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
}

impl QueryField {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub fields: Vec<QueryField>,
    pub rows: Vec<Record>,
    pub execution_time: Duration,
    pub affected_rows: Option<u64>,
}

impl QueryResult {
    #[must_use]
    pub fn scalar_u64(&self) -> Option<u64> {
        let value = self.rows.first()?.values().next()?;
        match value {
            Value::Number(number) => number
                .as_u64()
                .or_else(|| number.as_i64().map(|signed| signed.max(0).unsigned_abs()))
                .or_else(|| number.as_f64().map(float_to_count)),
            Value::String(text) => text.trim().parse::<u64>().ok(),
            _ => None,
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn float_to_count(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl ColumnMeta {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
            is_auto_increment: false,
            default_value: None,
        }
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyMeta {
    pub constraint_name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub referenced_schema: Option<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, statement: &SqlStatement) -> Result<QueryResult, ExecutorError>;
}

#[async_trait]
pub trait TableMetadata: Send + Sync {
    async fn estimate_count(&self, table: &TableRef) -> Result<u64, ExecutorError>;

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnMeta>, ExecutorError>;

    async fn foreign_keys(&self, table: &TableRef) -> Result<Vec<ForeignKeyMeta>, ExecutorError>;
}

pub async fn execute_logged<E>(
    executor: &E,
    log: &dyn QueryLogSink,
    dialect: Dialect,
    statement: &SqlStatement,
) -> Result<QueryResult, ExecutorError>
where
    E: QueryExecutor + ?Sized,
{
    let started_at = Instant::now();
    let outcome = executor.execute(statement).await;
    let elapsed = started_at.elapsed();
    let display_sql = interpolate_for_display(dialect, &statement.sql, &statement.params);

    let entry = match &outcome {
        Ok(result) => {
            let rows = result
                .affected_rows
                .unwrap_or_else(|| result.rows.len() as u64);
            QueryLogEntry::succeeded(display_sql, elapsed, rows)
        }
        Err(error) => QueryLogEntry::failed(display_sql, elapsed, error.message()),
    };
    log.record(entry);
    outcome
}
