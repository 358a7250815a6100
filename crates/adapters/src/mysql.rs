use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Params, Row, Value as MysqlValue};
use rowdesk_core::backend::{
    ColumnMeta, ExecutorError, ForeignKeyMeta, QueryExecutor, QueryField, QueryResult,
    TableMetadata,
};
use rowdesk_core::settings::{ConnectionProfile, PasswordSource};
use rowdesk_core::sql_generator::{estimate_count_sql, Dialect, SqlStatement, TableRef};
use rowdesk_core::value::Record;
use serde_json::{Number, Value};
use tokio::sync::Mutex;

pub const PASSWORD_ENV_VAR: &str = "ROWDESK_DB_PASSWORD";

/// One MySQL connection shared by every statement of a table view.
///
/// A single connection is required so that `BEGIN`, the staged statements and
/// `COMMIT` land in the same server-side transaction.
#[derive(Debug)]
pub struct MysqlSession {
    conn: Mutex<Conn>,
}

impl MysqlSession {
    pub async fn connect(profile: &ConnectionProfile) -> Result<Self, ExecutorError> {
        if profile.dialect != Dialect::Mysql {
            return Err(ExecutorError::new(format!(
                "profile `{}` uses the {:?} dialect; only MySQL sessions are supported",
                profile.name, profile.dialect
            )));
        }

        let conn = Conn::new(opts_from_profile(profile))
            .await
            .map_err(to_executor_error)?;
        tracing::info!(
            profile = %profile.name,
            host = %profile.host,
            port = profile.port,
            "connected to mysql"
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn ping(&self) -> Result<(), ExecutorError> {
        self.conn
            .lock()
            .await
            .ping()
            .await
            .map_err(to_executor_error)
    }

    pub async fn disconnect(self) -> Result<(), ExecutorError> {
        self.conn
            .into_inner()
            .disconnect()
            .await
            .map_err(to_executor_error)
    }
}

#[async_trait]
impl QueryExecutor for MysqlSession {
    async fn execute(&self, statement: &SqlStatement) -> Result<QueryResult, ExecutorError> {
        let started_at = Instant::now();
        let mut conn = self.conn.lock().await;

        let rows: Vec<Row> = if statement.params.is_empty() {
            conn.query(statement.sql.as_str())
                .await
                .map_err(to_executor_error)?
        } else {
            let params = Params::Positional(statement.params.iter().map(json_to_mysql).collect());
            conn.exec(statement.sql.as_str(), params)
                .await
                .map_err(to_executor_error)?
        };

        let fields = rows.first().map(fields_of).unwrap_or_default();
        let affected_rows = fields.is_empty().then(|| conn.affected_rows());
        let rows = rows.into_iter().map(row_to_record).collect();

        Ok(QueryResult {
            fields,
            rows,
            execution_time: started_at.elapsed(),
            affected_rows,
        })
    }
}

#[async_trait]
impl TableMetadata for MysqlSession {
    async fn estimate_count(&self, table: &TableRef) -> Result<u64, ExecutorError> {
        let result = self
            .execute(&estimate_count_sql(Dialect::Mysql, table))
            .await?;
        // TABLE_ROWS is NULL for views.
        Ok(result.scalar_u64().unwrap_or_default())
    }

    async fn columns(&self, table: &TableRef) -> Result<Vec<ColumnMeta>, ExecutorError> {
        let (scope, params) = information_schema_scope(table);
        let sql = format!(
            "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, EXTRA, COLUMN_DEFAULT \
             FROM information_schema.COLUMNS \
             WHERE {scope} \
             ORDER BY ORDINAL_POSITION"
        );
        let mut conn = self.conn.lock().await;
        conn.exec_map(
            sql.as_str(),
            Params::Positional(params),
            |(name, data_type, nullable, key, extra, default_value): (
                String,
                String,
                String,
                String,
                String,
                Option<String>,
            )| ColumnMeta {
                name,
                data_type,
                nullable: nullable.eq_ignore_ascii_case("YES"),
                is_primary_key: key.eq_ignore_ascii_case("PRI"),
                is_auto_increment: extra.to_ascii_lowercase().contains("auto_increment"),
                default_value,
            },
        )
        .await
        .map_err(to_executor_error)
    }

    async fn foreign_keys(&self, table: &TableRef) -> Result<Vec<ForeignKeyMeta>, ExecutorError> {
        let (scope, params) = information_schema_scope(table);
        let sql = format!(
            "SELECT CONSTRAINT_NAME, COLUMN_NAME, REFERENCED_TABLE_SCHEMA, \
             REFERENCED_TABLE_NAME, REFERENCED_COLUMN_NAME \
             FROM information_schema.KEY_COLUMN_USAGE \
             WHERE {scope} \
               AND REFERENCED_TABLE_NAME IS NOT NULL \
             ORDER BY CONSTRAINT_NAME, ORDINAL_POSITION"
        );
        let mut conn = self.conn.lock().await;
        let key_columns = conn
            .exec_map(
                sql.as_str(),
                Params::Positional(params),
                |key_column: (String, String, String, String, String)| key_column,
            )
            .await
            .map_err(to_executor_error)?;

        Ok(group_foreign_keys(key_columns))
    }
}

fn information_schema_scope(table: &TableRef) -> (&'static str, Vec<MysqlValue>) {
    match &table.schema {
        Some(schema) => (
            "TABLE_SCHEMA = ? AND TABLE_NAME = ?",
            vec![text_value(schema), text_value(&table.table)],
        ),
        None => (
            "TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
            vec![text_value(&table.table)],
        ),
    }
}

fn text_value(text: &str) -> MysqlValue {
    MysqlValue::Bytes(text.as_bytes().to_vec())
}

fn group_foreign_keys(
    key_columns: Vec<(String, String, String, String, String)>,
) -> Vec<ForeignKeyMeta> {
    let mut by_constraint: BTreeMap<String, ForeignKeyMeta> = BTreeMap::new();
    for (constraint_name, column, referenced_schema, referenced_table, referenced_column) in
        key_columns
    {
        let entry = by_constraint
            .entry(constraint_name.clone())
            .or_insert_with(|| ForeignKeyMeta {
                constraint_name,
                columns: Vec::new(),
                referenced_schema: Some(referenced_schema),
                referenced_table,
                referenced_columns: Vec::new(),
            });
        entry.columns.push(column);
        entry.referenced_columns.push(referenced_column);
    }
    by_constraint.into_values().collect()
}

fn opts_from_profile(profile: &ConnectionProfile) -> OptsBuilder {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(profile.host.clone())
        .tcp_port(profile.port)
        .user(Some(profile.user.clone()));

    if let Some(password) = resolve_password(profile) {
        builder = builder.pass(Some(password));
    }

    if let Some(database) = non_empty(profile.database.as_deref()) {
        builder = builder.db_name(Some(database.to_string()));
    }

    builder
}

fn resolve_password(profile: &ConnectionProfile) -> Option<String> {
    let env_password = std::env::var(PASSWORD_ENV_VAR)
        .ok()
        .filter(|pw| !pw.is_empty());

    match profile.password_source {
        PasswordSource::EnvVar => env_password,
        PasswordSource::Keyring => {
            if let Some(password) = load_keyring_password(profile) {
                return Some(password);
            }

            if let Some(password) = env_password {
                store_keyring_password(profile, &password);
                return Some(password);
            }

            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn load_keyring_password(profile: &ConnectionProfile) -> Option<String> {
    let entry = keyring_entry(profile)?;
    entry.get_password().ok().filter(|pw| !pw.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn load_keyring_password(_profile: &ConnectionProfile) -> Option<String> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn store_keyring_password(profile: &ConnectionProfile, password: &str) {
    if password.is_empty() {
        return;
    }
    if let Some(entry) = keyring_entry(profile) {
        if let Err(error) = entry.set_password(password) {
            tracing::warn!(%error, profile = %profile.name, "failed to store password in keyring");
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn store_keyring_password(_profile: &ConnectionProfile, _password: &str) {}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn keyring_entry(profile: &ConnectionProfile) -> Option<keyring::Entry> {
    let service = non_empty(profile.keyring_service.as_deref()).unwrap_or("rowdesk");
    let account = non_empty(profile.keyring_account.as_deref()).unwrap_or(profile.name.as_str());
    keyring::Entry::new(service, account).ok()
}

fn fields_of(row: &Row) -> Vec<QueryField> {
    row.columns_ref()
        .iter()
        .map(|column| QueryField {
            name: column.name_str().into_owned(),
            data_type: Some(format!("{:?}", column.column_type())),
        })
        .collect()
}

fn row_to_record(row: Row) -> Record {
    let columns = row
        .columns_ref()
        .iter()
        .map(|column| (column.name_str().into_owned(), column.column_type()))
        .collect::<Vec<_>>();
    columns
        .into_iter()
        .zip(row.unwrap())
        .map(|((name, column_type), value)| (name, mysql_to_json(value, column_type)))
        .collect()
}

fn mysql_to_json(value: MysqlValue, column_type: ColumnType) -> Value {
    match value {
        MysqlValue::NULL => Value::Null,
        MysqlValue::Int(value) => Value::from(value),
        MysqlValue::UInt(value) => Value::from(value),
        MysqlValue::Float(value) => float_to_json(f64::from(value)),
        MysqlValue::Double(value) => float_to_json(value),
        MysqlValue::Bytes(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            match column_type {
                ColumnType::MYSQL_TYPE_TINY
                | ColumnType::MYSQL_TYPE_SHORT
                | ColumnType::MYSQL_TYPE_INT24
                | ColumnType::MYSQL_TYPE_LONG
                | ColumnType::MYSQL_TYPE_LONGLONG
                | ColumnType::MYSQL_TYPE_YEAR => text
                    .parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| text.parse::<u64>().map(Value::from))
                    .unwrap_or(Value::String(text)),
                ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text
                    .parse::<f64>()
                    .map_or(Value::String(text), float_to_json),
                _ => Value::String(text),
            }
        }
        MysqlValue::Date(year, month, day, hour, minute, second, micros) => {
            if matches!(column_type, ColumnType::MYSQL_TYPE_DATE) {
                Value::String(format!("{year:04}-{month:02}-{day:02}"))
            } else if micros == 0 {
                Value::String(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                ))
            } else {
                Value::String(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                ))
            }
        }
        MysqlValue::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if is_negative { "-" } else { "" };
            let hours = u32::from(hours) + days * 24;
            if micros == 0 {
                Value::String(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
            } else {
                Value::String(format!(
                    "{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
                ))
            }
        }
    }
}

fn float_to_json(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn json_to_mysql(value: &Value) -> MysqlValue {
    match value {
        Value::Null => MysqlValue::NULL,
        Value::Bool(flag) => MysqlValue::Int(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(signed) = number.as_i64() {
                MysqlValue::Int(signed)
            } else if let Some(unsigned) = number.as_u64() {
                MysqlValue::UInt(unsigned)
            } else {
                MysqlValue::Double(number.as_f64().unwrap_or_default())
            }
        }
        Value::String(text) => text_value(text),
        Value::Array(_) | Value::Object(_) => text_value(&value.to_string()),
    }
}

fn to_executor_error(error: mysql_async::Error) -> ExecutorError {
    ExecutorError::new(error.to_string())
}
