use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::sql_generator::Dialect;
use crate::value::display_literal;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryLogEntry {
    pub timestamp_unix_ms: u128,
    pub outcome: QueryOutcome,
    pub sql: String,
    pub elapsed_ms: u128,
    pub rows: Option<u64>,
    pub error: Option<String>,
}

impl QueryLogEntry {
    #[must_use]
    pub fn succeeded(sql: impl Into<String>, elapsed: Duration, rows: u64) -> Self {
        Self {
            timestamp_unix_ms: unix_timestamp_millis(),
            outcome: QueryOutcome::Succeeded,
            sql: sql.into(),
            elapsed_ms: elapsed.as_millis(),
            rows: Some(rows),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(sql: impl Into<String>, elapsed: Duration, error: impl Into<String>) -> Self {
        Self {
            timestamp_unix_ms: unix_timestamp_millis(),
            outcome: QueryOutcome::Failed,
            sql: sql.into(),
            elapsed_ms: elapsed.as_millis(),
            rows: None,
            error: Some(error.into()),
        }
    }
}

#[must_use]
pub fn unix_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Fire-and-forget destination for executed statements. Must not block or fail.
pub trait QueryLogSink: Send + Sync {
    fn record(&self, entry: QueryLogEntry);
}

#[derive(Debug, Error)]
pub enum QueryLogError {
    #[error("invalid query log path `{0}`")]
    InvalidPath(PathBuf),
    #[error("failed to create query log directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize query log entry: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append query log entry at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileQueryLog {
    path: PathBuf,
}

impl FileQueryLog {
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &QueryLogEntry) -> Result<(), QueryLogError> {
        let parent_dir = self
            .path
            .parent()
            .ok_or_else(|| QueryLogError::InvalidPath(self.path.clone()))?;
        fs::create_dir_all(parent_dir).map_err(|source| QueryLogError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;

        let rendered =
            serde_json::to_string(entry).map_err(|source| QueryLogError::Serialize { source })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| QueryLogError::Write {
                path: self.path.clone(),
                source,
            })?;
        writeln!(file, "{rendered}").map_err(|source| QueryLogError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl QueryLogSink for FileQueryLog {
    fn record(&self, entry: QueryLogEntry) {
        if let Err(error) = self.append(&entry) {
            tracing::warn!(%error, "query log write failed");
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueryLog {
    entries: Mutex<Vec<QueryLogEntry>>,
}

impl MemoryQueryLog {
    #[must_use]
    pub fn entries(&self) -> Vec<QueryLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.entries().into_iter().map(|entry| entry.sql).collect()
    }
}

impl QueryLogSink for MemoryQueryLog {
    fn record(&self, entry: QueryLogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

#[must_use]
pub fn interpolate_for_display(dialect: Dialect, sql: &str, params: &[Value]) -> String {
    let mut rendered = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    let mut next_positional = 0_usize;

    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            rendered.push(ch);
            if ch == open {
                quote = None;
            }
            continue;
        }

        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                rendered.push(ch);
            }
            '?' if dialect == Dialect::Mysql => {
                match params.get(next_positional) {
                    Some(value) => rendered.push_str(&display_literal(value)),
                    None => rendered.push('?'),
                }
                next_positional += 1;
            }
            '$' if dialect == Dialect::Postgres => {
                let mut digits = String::new();
                while let Some(digit) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(digit);
                    chars.next();
                }
                let value = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|position| position.checked_sub(1))
                    .and_then(|index| params.get(index));
                match value {
                    Some(value) => rendered.push_str(&display_literal(value)),
                    None => {
                        rendered.push('$');
                        rendered.push_str(&digits);
                    }
                }
            }
            _ => rendered.push(ch),
        }
    }

    rendered
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use super::{
        interpolate_for_display, unix_timestamp_millis, FileQueryLog, QueryLogEntry,
        QueryLogSink, QueryOutcome,
    };
    use crate::sql_generator::Dialect;

    #[test]
    fn appends_json_lines_to_file() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("logs").join("query-log.ndjson");
        let log = FileQueryLog::from_path(&path);

        let first = QueryLogEntry::succeeded("BEGIN", Duration::from_millis(2), 0);
        let second = QueryLogEntry::failed("COMMIT", Duration::from_millis(3), "lost connection");
        log.append(&first).expect("failed to append first entry");
        log.record(second.clone());

        let content = std::fs::read_to_string(path).expect("failed to read query log");
        let mut lines = content.lines();

        let first_loaded: QueryLogEntry =
            serde_json::from_str(lines.next().expect("missing first line"))
                .expect("failed to parse first line");
        assert_eq!(first_loaded, first);

        let second_loaded: QueryLogEntry =
            serde_json::from_str(lines.next().expect("missing second line"))
                .expect("failed to parse second line");
        assert_eq!(second_loaded.outcome, QueryOutcome::Failed);
        assert_eq!(second_loaded.error.as_deref(), Some("lost connection"));

        assert!(lines.next().is_none(), "unexpected extra lines in query log");
    }

    #[test]
    fn unwritable_path_is_swallowed_by_sink() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").expect("failed to write blocker");
        let log = FileQueryLog::from_path(blocker.join("query-log.ndjson"));

        assert!(log
            .append(&QueryLogEntry::succeeded("BEGIN", Duration::ZERO, 0))
            .is_err());
        log.record(QueryLogEntry::succeeded("BEGIN", Duration::ZERO, 0));
    }

    #[test]
    fn interpolates_positional_placeholders_outside_quotes() {
        let rendered = interpolate_for_display(
            Dialect::Mysql,
            "SELECT * FROM `a?b` WHERE `name` = ? AND note = '?' LIMIT ? OFFSET ?",
            &[json!("o'neil"), json!(200), json!(0)],
        );
        assert_eq!(
            rendered,
            "SELECT * FROM `a?b` WHERE `name` = 'o''neil' AND note = '?' LIMIT 200 OFFSET 0"
        );
    }

    #[test]
    fn interpolates_numbered_placeholders() {
        let rendered = interpolate_for_display(
            Dialect::Postgres,
            "UPDATE \"t\" SET \"a\" = $1, \"b\" = $2 WHERE \"id\" = $10",
            &[json!(null), json!(true)],
        );
        assert_eq!(
            rendered,
            "UPDATE \"t\" SET \"a\" = NULL, \"b\" = TRUE WHERE \"id\" = $10"
        );
    }

    #[test]
    fn timestamp_uses_unix_epoch_millis() {
        assert!(unix_timestamp_millis() > 0);
    }
}
