use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::backend::{execute_logged, ColumnMeta, ExecutorError, QueryExecutor};
use crate::query_log::QueryLogSink;
use crate::sql_generator::{
    insert_sql, update_sql, Dialect, SqlGenerationError, SqlStatement, TableRef,
    TransactionControl,
};
use crate::staged_changes::StagedChange;
use crate::value::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStage {
    Begin,
    Statement(usize),
    Commit,
}

impl fmt::Display for CommitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin => f.write_str("BEGIN"),
            Self::Statement(index) => write!(f, "statement {}", index + 1),
            Self::Commit => f.write_str("COMMIT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("no staged changes for {table}")]
    NothingToCommit { table: String },
    #[error("a save is already in progress")]
    AlreadySaving,
    #[error("profile `{0}` is read-only")]
    ReadOnly(String),
    #[error("failed to build commit statements: {0}")]
    Generation(#[from] SqlGenerationError),
    #[error("{stage} failed: {source}")]
    Statement {
        stage: CommitStage,
        sql: String,
        #[source]
        source: ExecutorError,
        rollback_error: Option<ExecutorError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub statements: usize,
    pub affected_rows: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SaveGuard {
    in_flight: Arc<AtomicBool>,
}

impl SaveGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn try_acquire(&self) -> Option<SavePermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SavePermit {
                in_flight: Arc::clone(&self.in_flight),
            })
    }
}

#[derive(Debug)]
pub struct SavePermit {
    in_flight: Arc<AtomicBool>,
}

impl Drop for SavePermit {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

struct RowAssignments<'a> {
    row_index: usize,
    identity: &'a Record,
    assignments: Vec<(&'a str, &'a Value)>,
}

/// One `UPDATE` per edited row, then one `INSERT` per staged row.
///
/// Every cell staged for a row goes into a single `SET`, matched by the identity
/// captured from the fetched row. Null auto-increment values are left out of
/// inserts so the server assigns them.
pub fn build_commit_statements<'a>(
    dialect: Dialect,
    table: &TableRef,
    changes: impl IntoIterator<Item = &'a StagedChange>,
    columns: &[ColumnMeta],
) -> Result<Vec<SqlStatement>, SqlGenerationError> {
    let mut rows: Vec<RowAssignments<'a>> = Vec::new();
    let mut inserts = Vec::new();

    for change in changes {
        match change {
            StagedChange::Update(update) => {
                let assignment = (update.column.as_str(), &update.new_value);
                match rows
                    .iter_mut()
                    .find(|row| row.row_index == update.row_index)
                {
                    Some(row) => row.assignments.push(assignment),
                    None => rows.push(RowAssignments {
                        row_index: update.row_index,
                        identity: &update.identity.values,
                        assignments: vec![assignment],
                    }),
                }
            }
            StagedChange::Insert(insert) => {
                let row = insert
                    .new_row
                    .iter()
                    .filter(|(name, value)| {
                        !(value.is_null()
                            && columns
                                .iter()
                                .any(|column| column.is_auto_increment && &column.name == *name))
                    })
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect::<Record>();
                inserts.push(insert_sql(dialect, table, &row)?);
            }
        }
    }

    let mut statements = rows
        .iter()
        .map(|row| update_sql(dialect, table, &row.assignments, row.identity))
        .collect::<Result<Vec<_>, _>>()?;
    statements.extend(inserts);
    Ok(statements)
}

pub struct TransactionCommitter<'a, E: QueryExecutor + ?Sized> {
    executor: &'a E,
    log: &'a dyn QueryLogSink,
    dialect: Dialect,
}

impl<'a, E: QueryExecutor + ?Sized> TransactionCommitter<'a, E> {
    #[must_use]
    pub fn new(executor: &'a E, log: &'a dyn QueryLogSink, dialect: Dialect) -> Self {
        Self {
            executor,
            log,
            dialect,
        }
    }

    pub async fn commit(&self, statements: &[SqlStatement]) -> Result<CommitSummary, CommitError> {
        let started_at = Instant::now();

        let begin = TransactionControl::Begin.statement();
        if let Err(source) = self.run(&begin).await {
            return Err(self.abort(CommitStage::Begin, &begin, source).await);
        }

        let mut affected_rows = 0_u64;
        for (index, statement) in statements.iter().enumerate() {
            match self.run(statement).await {
                Ok(rows) => affected_rows += rows,
                Err(source) => {
                    return Err(self
                        .abort(CommitStage::Statement(index), statement, source)
                        .await)
                }
            }
        }

        let commit = TransactionControl::Commit.statement();
        if let Err(source) = self.run(&commit).await {
            return Err(self.abort(CommitStage::Commit, &commit, source).await);
        }

        let summary = CommitSummary {
            statements: statements.len(),
            affected_rows,
            elapsed: started_at.elapsed(),
        };
        tracing::info!(
            statements = summary.statements,
            affected_rows = summary.affected_rows,
            elapsed_ms = summary.elapsed.as_millis(),
            "committed staged changes"
        );
        Ok(summary)
    }

    async fn run(&self, statement: &SqlStatement) -> Result<u64, ExecutorError> {
        let result = execute_logged(self.executor, self.log, self.dialect, statement).await?;
        Ok(result.affected_rows.unwrap_or_default())
    }

    async fn abort(
        &self,
        stage: CommitStage,
        statement: &SqlStatement,
        source: ExecutorError,
    ) -> CommitError {
        let rollback = TransactionControl::Rollback.statement();
        let rollback_error = self.run(&rollback).await.err();
        if let Some(error) = &rollback_error {
            tracing::warn!(%error, %stage, "rollback after failed statement also failed");
        }
        tracing::warn!(%source, %stage, "transaction rolled back");

        CommitError::Statement {
            stage,
            sql: statement.sql.clone(),
            source,
            rollback_error,
        }
    }
}
