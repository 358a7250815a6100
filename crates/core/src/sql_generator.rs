use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::filters::{append_where_clause, TableFilter};
use crate::pagination::page_offset;
use crate::value::Record;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SqlGenerationError {
    #[error("schema name cannot be empty")]
    EmptySchemaName,
    #[error("table name cannot be empty")]
    EmptyTableName,
    #[error("column name cannot be empty")]
    EmptyColumnName,
    #[error("update for {table} has no columns to set")]
    EmptyAssignments { table: String },
    #[error("update for {table} has no columns to identify the row")]
    MissingRowIdentity { table: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Mysql,
    Postgres,
}

impl Dialect {
    #[must_use]
    pub fn quote_identifier(self, identifier: &str) -> String {
        match self {
            Self::Mysql => format!("`{}`", identifier.replace('`', "``")),
            Self::Postgres => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    #[must_use]
    pub fn placeholder(self, position: usize) -> String {
        match self {
            Self::Mysql => "?".to_string(),
            Self::Postgres => format!("${position}"),
        }
    }

    #[must_use]
    pub fn supports_update_limit(self) -> bool {
        matches!(self, Self::Mysql)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, table: &str) -> Result<Self, SqlGenerationError> {
        if table.trim().is_empty() {
            return Err(SqlGenerationError::EmptyTableName);
        }
        if let Some(schema_name) = schema {
            if schema_name.trim().is_empty() {
                return Err(SqlGenerationError::EmptySchemaName);
            }
        }
        Ok(Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        })
    }

    pub fn parse(qualified: &str) -> Result<Self, SqlGenerationError> {
        match qualified.split_once('.') {
            Some((schema, table)) => Self::new(Some(schema), table),
            None => Self::new(None, qualified),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.table),
            None => f.write_str(&self.table),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlStatement {
    #[must_use]
    pub fn bare(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Bindings {
    dialect: Dialect,
    params: Vec<Value>,
}

impl Bindings {
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    #[must_use]
    pub fn into_params(self) -> Vec<Value> {
        self.params
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    pub column: String,
    pub direction: SortDirection,
}

impl SortOrder {
    #[must_use]
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionControl {
    Begin,
    Commit,
    Rollback,
}

impl TransactionControl {
    #[must_use]
    pub fn statement(self) -> SqlStatement {
        SqlStatement::bare(match self {
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub table: &'a TableRef,
    pub page: u64,
    pub page_size: u64,
    pub sort: Option<&'a SortOrder>,
    pub filters: &'a [TableFilter],
}

#[must_use]
pub fn qualified_table_sql(dialect: Dialect, table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!(
            "{}.{}",
            dialect.quote_identifier(schema),
            dialect.quote_identifier(&table.table)
        ),
        None => dialect.quote_identifier(&table.table),
    }
}

pub fn select_page_sql(
    dialect: Dialect,
    request: &PageRequest<'_>,
) -> Result<SqlStatement, SqlGenerationError> {
    let mut bindings = Bindings::new(dialect);
    let mut sql = format!(
        "SELECT * FROM {}",
        qualified_table_sql(dialect, request.table)
    );

    let where_sql = append_where_clause(&mut bindings, request.filters);
    if !where_sql.is_empty() {
        sql.push(' ');
        sql.push_str(&where_sql);
    }

    if let Some(sort) = request.sort {
        if sort.column.trim().is_empty() {
            return Err(SqlGenerationError::EmptyColumnName);
        }
        sql.push_str(&format!(
            " ORDER BY {} {}",
            dialect.quote_identifier(&sort.column),
            sort.direction.keyword()
        ));
    }

    let limit = bindings.bind(Value::from(request.page_size));
    let offset = bindings.bind(Value::from(page_offset(
        request.page,
        request.page_size,
    )));
    sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

    Ok(SqlStatement {
        sql,
        params: bindings.into_params(),
    })
}

#[must_use]
pub fn count_sql(dialect: Dialect, table: &TableRef, filters: &[TableFilter]) -> SqlStatement {
    let mut bindings = Bindings::new(dialect);
    let mut sql = format!(
        "SELECT COUNT(*) AS count FROM {}",
        qualified_table_sql(dialect, table)
    );
    let where_sql = append_where_clause(&mut bindings, filters);
    if !where_sql.is_empty() {
        sql.push(' ');
        sql.push_str(&where_sql);
    }
    SqlStatement {
        sql,
        params: bindings.into_params(),
    }
}

#[must_use]
pub fn estimate_count_sql(dialect: Dialect, table: &TableRef) -> SqlStatement {
    let mut bindings = Bindings::new(dialect);
    let sql = match dialect {
        Dialect::Mysql => {
            let schema_condition = match &table.schema {
                Some(schema) => bindings.bind(Value::from(schema.as_str())),
                None => "DATABASE()".to_string(),
            };
            let table_name = bindings.bind(Value::from(table.table.as_str()));
            format!(
                "SELECT TABLE_ROWS AS estimated_rows FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = {schema_condition} AND TABLE_NAME = {table_name}"
            )
        }
        Dialect::Postgres => {
            let table_name = bindings.bind(Value::from(table.table.as_str()));
            let schema_condition = match &table.schema {
                Some(schema) => bindings.bind(Value::from(schema.as_str())),
                None => "current_schema()".to_string(),
            };
            format!(
                "SELECT GREATEST(c.reltuples, 0)::bigint AS estimated_rows FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE c.relname = {table_name} AND n.nspname = {schema_condition}"
            )
        }
    };
    SqlStatement {
        sql,
        params: bindings.into_params(),
    }
}

/// `UPDATE` addressing one row by `identity`; null identity values match with `IS NULL`.
pub fn update_sql(
    dialect: Dialect,
    table: &TableRef,
    assignments: &[(&str, &Value)],
    identity: &Record,
) -> Result<SqlStatement, SqlGenerationError> {
    if assignments.is_empty() {
        return Err(SqlGenerationError::EmptyAssignments {
            table: table.to_string(),
        });
    }
    if identity.is_empty() {
        return Err(SqlGenerationError::MissingRowIdentity {
            table: table.to_string(),
        });
    }

    let mut bindings = Bindings::new(dialect);
    let mut set_clauses = Vec::with_capacity(assignments.len());
    for (column, value) in assignments {
        if column.trim().is_empty() {
            return Err(SqlGenerationError::EmptyColumnName);
        }
        let placeholder = bindings.bind((*value).clone());
        set_clauses.push(format!(
            "{} = {placeholder}",
            dialect.quote_identifier(column)
        ));
    }

    let mut conditions = Vec::with_capacity(identity.len());
    for (column, value) in identity {
        let quoted = dialect.quote_identifier(column);
        if value.is_null() {
            conditions.push(format!("{quoted} IS NULL"));
        } else {
            let placeholder = bindings.bind(value.clone());
            conditions.push(format!("{quoted} = {placeholder}"));
        }
    }

    let mut sql = format!(
        "UPDATE {} SET {} WHERE {}",
        qualified_table_sql(dialect, table),
        set_clauses.join(", "),
        conditions.join(" AND ")
    );
    if dialect.supports_update_limit() {
        sql.push_str(" LIMIT 1");
    }

    Ok(SqlStatement {
        sql,
        params: bindings.into_params(),
    })
}

pub fn insert_sql(
    dialect: Dialect,
    table: &TableRef,
    row: &Record,
) -> Result<SqlStatement, SqlGenerationError> {
    if row.is_empty() {
        let target = qualified_table_sql(dialect, table);
        let sql = match dialect {
            Dialect::Mysql => format!("INSERT INTO {target} () VALUES ()"),
            Dialect::Postgres => format!("INSERT INTO {target} DEFAULT VALUES"),
        };
        return Ok(SqlStatement::bare(sql));
    }

    let mut bindings = Bindings::new(dialect);
    let mut columns = Vec::with_capacity(row.len());
    let mut placeholders = Vec::with_capacity(row.len());
    for (column, value) in row {
        if column.trim().is_empty() {
            return Err(SqlGenerationError::EmptyColumnName);
        }
        columns.push(dialect.quote_identifier(column));
        placeholders.push(bindings.bind(value.clone()));
    }

    Ok(SqlStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified_table_sql(dialect, table),
            columns.join(", "),
            placeholders.join(", ")
        ),
        params: bindings.into_params(),
    })
}
