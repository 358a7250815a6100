use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::backend::{
    execute_logged, ColumnMeta, ExecutorError, QueryExecutor, QueryResult, TableMetadata,
};
use crate::committer::{
    build_commit_statements, CommitError, CommitSummary, SaveGuard, TransactionCommitter,
};
use crate::fetch_guard::{fetch_key, FetchCheckpoint, FetchGuard, FetchTicket};
use crate::filters::{FilterDebouncer, TableFilter};
use crate::foreign_keys::ForeignKeyMap;
use crate::messages::{ConnectionBus, NavigationRequest, TableCommands, ViewCommand};
use crate::pagination::{choose_count_strategy, CountStrategy, PaginationState, RowCount};
use crate::query_log::QueryLogSink;
use crate::settings::{ConnectionProfile, EngineSettings};
use crate::sql_generator::{
    count_sql, select_page_sql, Dialect, PageRequest, SortOrder, SqlGenerationError, TableRef,
};
use crate::staged_changes::{EditContext, EditOutcome, StagedChangeStore};
use crate::value::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableViewConfig {
    pub connection_id: String,
    pub dialect: Dialect,
    pub page_size: u64,
    pub filter_debounce: Duration,
    pub exact_count_when_filtered: bool,
    pub read_only: bool,
}

impl TableViewConfig {
    #[must_use]
    pub fn new(connection_id: impl Into<String>, dialect: Dialect) -> Self {
        let engine = EngineSettings::default();
        Self {
            connection_id: connection_id.into(),
            dialect,
            page_size: engine.page_size,
            filter_debounce: engine.filter_debounce(),
            exact_count_when_filtered: engine.exact_count_when_filtered,
            read_only: false,
        }
    }

    #[must_use]
    pub fn from_settings(engine: &EngineSettings, profile: &ConnectionProfile) -> Self {
        Self {
            connection_id: profile.name.clone(),
            dialect: profile.dialect,
            page_size: engine.page_size.max(1),
            filter_debounce: engine.filter_debounce(),
            exact_count_when_filtered: engine.exact_count_when_filtered,
            read_only: profile.read_only,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error("failed to load rows: {0}")]
    Fetch(#[source] ExecutorError),
    #[error("failed to count rows: {0}")]
    Count(#[source] ExecutorError),
    #[error("failed to load table metadata: {0}")]
    Metadata(#[source] ExecutorError),
    #[error("failed to build query: {0}")]
    Generation(#[from] SqlGenerationError),
    #[error(transparent)]
    Commit(#[from] CommitError),
}

#[derive(Debug)]
enum FetchStatus {
    Superseded(FetchCheckpoint),
    Failed(ViewError),
    Loaded {
        result: QueryResult,
        count: Result<RowCount, ViewError>,
    },
}

#[derive(Debug)]
pub struct FetchOutcome {
    ticket: FetchTicket,
    key: String,
    status: FetchStatus,
}

impl FetchOutcome {
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.ticket.sequence()
    }

    #[must_use]
    pub fn superseded_at(&self) -> Option<FetchCheckpoint> {
        match self.status {
            FetchStatus::Superseded(checkpoint) => Some(checkpoint),
            _ => None,
        }
    }
}

pub struct PendingFetch<B> {
    ticket: FetchTicket,
    key: String,
    backend: Arc<B>,
    log: Arc<dyn QueryLogSink>,
    dialect: Dialect,
    table: TableRef,
    page: u64,
    page_size: u64,
    sort: Option<SortOrder>,
    filters: Vec<TableFilter>,
    count_strategy: CountStrategy,
}

impl<B> PendingFetch<B>
where
    B: QueryExecutor + TableMetadata,
{
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.ticket.sequence()
    }

    pub async fn run(self) -> FetchOutcome {
        let status = self.load().await;
        FetchOutcome {
            ticket: self.ticket,
            key: self.key,
            status,
        }
    }

    async fn load(&self) -> FetchStatus {
        if let Err(checkpoint) = self.ticket.checkpoint(FetchCheckpoint::BeforeQuery) {
            return FetchStatus::Superseded(checkpoint);
        }

        let request = PageRequest {
            table: &self.table,
            page: self.page,
            page_size: self.page_size,
            sort: self.sort.as_ref(),
            filters: &self.filters,
        };
        let statement = match select_page_sql(self.dialect, &request) {
            Ok(statement) => statement,
            Err(error) => return FetchStatus::Failed(error.into()),
        };
        tracing::debug!(sequence = self.ticket.sequence(), sql = %statement.sql, "fetching page");

        let queried = execute_logged(
            self.backend.as_ref(),
            self.log.as_ref(),
            self.dialect,
            &statement,
        )
        .await;
        if let Err(checkpoint) = self.ticket.checkpoint(FetchCheckpoint::AfterQuery) {
            return FetchStatus::Superseded(checkpoint);
        }
        let result = match queried {
            Ok(result) => result,
            Err(error) => return FetchStatus::Failed(ViewError::Fetch(error)),
        };

        if let Err(checkpoint) = self.ticket.checkpoint(FetchCheckpoint::BeforeCount) {
            return FetchStatus::Superseded(checkpoint);
        }
        let count = self.count().await;
        if let Err(checkpoint) = self.ticket.checkpoint(FetchCheckpoint::AfterCount) {
            return FetchStatus::Superseded(checkpoint);
        }

        FetchStatus::Loaded { result, count }
    }

    async fn count(&self) -> Result<RowCount, ViewError> {
        match self.count_strategy {
            CountStrategy::Exact => exact_count(
                self.backend.as_ref(),
                self.log.as_ref(),
                self.dialect,
                &self.table,
                &self.filters,
            )
            .await
            .map(RowCount::exact),
            CountStrategy::Estimate => self
                .backend
                .estimate_count(&self.table)
                .await
                .map(RowCount::estimate)
                .map_err(ViewError::Count),
        }
    }
}

async fn exact_count<E>(
    executor: &E,
    log: &dyn QueryLogSink,
    dialect: Dialect,
    table: &TableRef,
    filters: &[TableFilter],
) -> Result<u64, ViewError>
where
    E: QueryExecutor + ?Sized,
{
    let statement = count_sql(dialect, table, filters);
    let result = execute_logged(executor, log, dialect, &statement)
        .await
        .map_err(ViewError::Count)?;
    result
        .scalar_u64()
        .ok_or_else(|| ViewError::Count(ExecutorError::new("COUNT(*) returned no value")))
}

pub struct TableView<B> {
    backend: Arc<B>,
    log: Arc<dyn QueryLogSink>,
    config: TableViewConfig,
    table: TableRef,
    columns: Vec<ColumnMeta>,
    foreign_keys: ForeignKeyMap,
    result: Arc<QueryResult>,
    pagination: PaginationState,
    sort: Option<SortOrder>,
    filters: Vec<TableFilter>,
    debouncer: FilterDebouncer,
    guard: FetchGuard,
    staged: StagedChangeStore,
    save_guard: SaveGuard,
    loaded_key: Option<String>,
    banner: Option<ViewError>,
    bus: Option<ConnectionBus>,
}

impl<B> TableView<B>
where
    B: QueryExecutor + TableMetadata,
{
    #[must_use]
    pub fn new(
        backend: Arc<B>,
        log: Arc<dyn QueryLogSink>,
        config: TableViewConfig,
        table: TableRef,
    ) -> Self {
        let pagination = PaginationState::new(config.page_size);
        let debouncer = FilterDebouncer::new(config.filter_debounce);
        Self {
            backend,
            log,
            config,
            table,
            columns: Vec::new(),
            foreign_keys: ForeignKeyMap::default(),
            result: Arc::new(QueryResult::default()),
            pagination,
            sort: None,
            filters: Vec::new(),
            debouncer,
            guard: FetchGuard::new(),
            staged: StagedChangeStore::new(),
            save_guard: SaveGuard::new(),
            loaded_key: None,
            banner: None,
            bus: None,
        }
    }

    pub async fn open(
        backend: Arc<B>,
        log: Arc<dyn QueryLogSink>,
        config: TableViewConfig,
        table: TableRef,
    ) -> Result<Self, ViewError> {
        let mut view = Self::new(backend, log, config, table);
        view.load_metadata().await?;
        view.refresh().await?;
        Ok(view)
    }

    pub fn attach_bus(&mut self, bus: ConnectionBus) {
        self.bus = Some(bus);
    }

    #[must_use]
    pub fn subscribe_commands(&self) -> Option<TableCommands> {
        self.bus
            .as_ref()
            .map(|bus| bus.subscribe_table(self.table.clone()))
    }

    pub async fn load_metadata(&mut self) -> Result<(), ViewError> {
        let loaded = async {
            let columns = self.backend.columns(&self.table).await?;
            let foreign_keys = self.backend.foreign_keys(&self.table).await?;
            Ok::<_, ExecutorError>((columns, foreign_keys))
        }
        .await;

        match loaded {
            Ok((columns, foreign_keys)) => {
                self.foreign_keys =
                    ForeignKeyMap::from_metadata(&foreign_keys, self.table.schema.as_deref());
                self.columns = columns;
                tracing::debug!(
                    table = %self.table,
                    columns = self.columns.len(),
                    foreign_keys = self.foreign_keys.len(),
                    "loaded table metadata"
                );
                Ok(())
            }
            Err(error) => Err(self.raise(ViewError::Metadata(error))),
        }
    }

    fn current_key(&self) -> String {
        fetch_key(
            &self.table,
            self.pagination.page,
            self.pagination.page_size,
            self.sort.as_ref(),
            &self.filters,
        )
    }

    pub fn begin_fetch(&mut self) -> PendingFetch<B> {
        let ticket = self.guard.begin();
        let count_strategy =
            choose_count_strategy(&self.filters, self.config.exact_count_when_filtered);
        tracing::debug!(
            sequence = ticket.sequence(),
            table = %self.table,
            page = self.pagination.page,
            ?count_strategy,
            "starting fetch"
        );
        PendingFetch {
            ticket,
            key: self.current_key(),
            backend: Arc::clone(&self.backend),
            log: Arc::clone(&self.log),
            dialect: self.config.dialect,
            table: self.table.clone(),
            page: self.pagination.page,
            page_size: self.pagination.page_size,
            sort: self.sort.clone(),
            filters: self.filters.clone(),
            count_strategy,
        }
    }

    /// Applies a finished fetch. Returns `Ok(false)` when it was superseded.
    ///
    /// A failed data query keeps the rows already shown; a failed count keeps the
    /// new rows and falls back to the number of rows seen.
    pub fn complete_fetch(&mut self, outcome: FetchOutcome) -> Result<bool, ViewError> {
        let FetchOutcome {
            ticket,
            key,
            status,
        } = outcome;

        if !self.guard.is_current(&ticket) {
            tracing::debug!(
                sequence = ticket.sequence(),
                checkpoint = ?FetchCheckpoint::BeforeApply,
                "dropping superseded fetch"
            );
            return Ok(false);
        }
        self.guard.finish(&ticket);

        match status {
            FetchStatus::Superseded(_) => Ok(false),
            FetchStatus::Failed(error) => {
                tracing::warn!(%error, table = %self.table, "fetch failed");
                Err(self.raise(error))
            }
            FetchStatus::Loaded { result, count } => {
                let rows_on_page = result.rows.len() as u64;
                self.result = Arc::new(result);
                self.loaded_key = Some(key);
                match count {
                    Ok(count) => {
                        self.pagination.apply_count(count, rows_on_page);
                        self.banner = None;
                        tracing::info!(
                            table = %self.table,
                            rows = rows_on_page,
                            total_rows = self.pagination.total_rows,
                            estimated = self.pagination.is_estimated_count,
                            "page loaded"
                        );
                    }
                    Err(error) => {
                        tracing::warn!(%error, table = %self.table, "row count failed");
                        self.pagination
                            .apply_count(RowCount::estimate(0), rows_on_page);
                        self.banner = Some(error);
                    }
                }
                Ok(true)
            }
        }
    }

    pub async fn refresh(&mut self) -> Result<bool, ViewError> {
        let pending = self.begin_fetch();
        let outcome = pending.run().await;
        self.complete_fetch(outcome)
    }

    pub async fn refresh_if_needed(&mut self) -> Result<bool, ViewError> {
        if self.loaded_key.as_deref() == Some(self.current_key().as_str()) {
            return Ok(false);
        }
        self.refresh().await
    }

    fn invalidate_row_identity(&mut self) {
        let discarded = self.staged.discard_table(&self.table);
        if discarded > 0 {
            tracing::info!(table = %self.table, discarded, "discarded staged changes");
        }
    }

    pub async fn set_page(&mut self, page: u64) -> Result<bool, ViewError> {
        self.invalidate_row_identity();
        self.pagination.set_page(page);
        self.refresh().await
    }

    pub async fn set_page_size(&mut self, page_size: u64) -> Result<bool, ViewError> {
        self.invalidate_row_identity();
        self.pagination.set_page_size(page_size);
        self.refresh().await
    }

    pub async fn set_sort(&mut self, sort: Option<SortOrder>) -> Result<bool, ViewError> {
        self.invalidate_row_identity();
        self.sort = sort;
        self.refresh().await
    }

    pub fn set_filters(&mut self, filters: Vec<TableFilter>, now: Instant) {
        self.filters = filters;
        self.debouncer.arm(now);
    }

    #[must_use]
    pub fn filter_deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    pub async fn poll_filters(&mut self, now: Instant) -> Result<bool, ViewError> {
        if !self.debouncer.take_due(now) {
            return Ok(false);
        }
        self.apply_filters().await
    }

    pub async fn apply_filters_now(&mut self) -> Result<bool, ViewError> {
        self.debouncer.disarm();
        self.apply_filters().await
    }

    async fn apply_filters(&mut self) -> Result<bool, ViewError> {
        self.invalidate_row_identity();
        self.pagination.set_page(1);
        self.refresh().await
    }

    /// Replaces an estimated total with `COUNT(*)` without re-fetching rows.
    ///
    /// Returns `Ok(false)` when the loaded page no longer matches the current
    /// page/sort/filter context.
    pub async fn load_exact_count(&mut self) -> Result<bool, ViewError> {
        let key = self.current_key();
        if self.loaded_key.as_deref() != Some(key.as_str()) {
            return Ok(false);
        }

        let counted = exact_count(
            self.backend.as_ref(),
            self.log.as_ref(),
            self.config.dialect,
            &self.table,
            &self.filters,
        )
        .await;

        match counted {
            Ok(total) => {
                let rows_on_page = self.result.rows.len() as u64;
                self.pagination
                    .apply_count(RowCount::exact(total), rows_on_page);
                tracing::info!(table = %self.table, total, "exact count loaded");
                Ok(true)
            }
            Err(error) => Err(self.raise(error)),
        }
    }

    pub fn record_cell_edit(
        &mut self,
        row_index: usize,
        column: &str,
        old_value: Value,
        new_value: Value,
    ) -> EditOutcome {
        let context = EditContext {
            table: &self.table,
            rows: &self.result.rows,
            columns: &self.columns,
        };
        self.staged
            .record_cell_edit(&context, row_index, column, old_value, new_value)
    }

    pub fn insert_row(&mut self) -> String {
        self.staged.insert_row(&self.table, &self.columns)
    }

    pub fn duplicate_row(&mut self, row_index: usize) -> Option<String> {
        let row = self.display_rows().into_iter().nth(row_index)?;
        Some(self.staged.duplicate_row(&self.table, &row, &self.columns))
    }

    pub async fn save(&mut self) -> Result<CommitSummary, CommitError> {
        let Some(_permit) = self.save_guard.try_acquire() else {
            return Err(CommitError::AlreadySaving);
        };
        if self.config.read_only {
            return Err(CommitError::ReadOnly(self.config.connection_id.clone()));
        }
        if self.staged.count_for(&self.table) == 0 {
            return Err(CommitError::NothingToCommit {
                table: self.table.to_string(),
            });
        }

        let statements = match build_commit_statements(
            self.config.dialect,
            &self.table,
            self.staged.changes_for(&self.table),
            &self.columns,
        ) {
            Ok(statements) => statements,
            Err(error) => return Err(self.raise_commit(error.into())),
        };

        self.guard.cancel_outstanding();
        let committer = TransactionCommitter::new(
            self.backend.as_ref(),
            self.log.as_ref(),
            self.config.dialect,
        );
        let summary = match committer.commit(&statements).await {
            Ok(summary) => summary,
            Err(error) => return Err(self.raise_commit(error)),
        };

        self.staged.discard_table(&self.table);
        if let Err(error) = self.refresh().await {
            tracing::warn!(%error, table = %self.table, "refresh after commit failed");
        }
        Ok(summary)
    }

    pub async fn discard(&mut self) -> Result<usize, ViewError> {
        let discarded = self.staged.discard_table(&self.table);
        self.refresh().await?;
        Ok(discarded)
    }

    pub fn navigate(&self, table: TableRef, column: &str, value: Value) -> NavigationRequest {
        let request = NavigationRequest {
            connection_id: self.config.connection_id.clone(),
            table,
            filter_column: column.to_string(),
            filter_value: value,
        };
        self.publish(request)
    }

    pub fn navigate_from_cell(&self, row_index: usize, column: &str) -> Option<NavigationRequest> {
        let value = self
            .display_rows()
            .get(row_index)
            .and_then(|row| row.get(column).cloned())?;
        let request =
            self.foreign_keys
                .navigation_for(&self.config.connection_id, column, &value)?;
        Some(self.publish(request))
    }

    fn publish(&self, request: NavigationRequest) -> NavigationRequest {
        if let Some(bus) = &self.bus {
            bus.navigate(request.clone());
        }
        request
    }

    /// Dispatches a command received from the message bus.
    ///
    /// `SetFilter` replaces the filters and fetches at once; typing goes through
    /// [`TableView::set_filters`] instead.
    pub async fn handle_command(&mut self, command: ViewCommand) -> Result<(), ViewError> {
        tracing::debug!(table = %self.table, ?command, "handling view command");
        match command {
            ViewCommand::ApplyChanges => {
                self.save().await?;
            }
            ViewCommand::DiscardChanges => {
                self.discard().await?;
            }
            ViewCommand::RefreshData => {
                self.refresh().await?;
            }
            ViewCommand::InsertRow => {
                self.insert_row();
            }
            ViewCommand::SetFilter(filters) => {
                self.filters = filters;
                self.apply_filters_now().await?;
            }
        }
        Ok(())
    }

    pub async fn switch_table(&mut self, table: TableRef) -> Result<bool, ViewError> {
        self.close();
        self.table = table;
        self.columns.clear();
        self.foreign_keys = ForeignKeyMap::default();
        self.result = Arc::new(QueryResult::default());
        self.pagination = PaginationState::new(self.config.page_size);
        self.sort = None;
        self.filters.clear();
        self.loaded_key = None;
        self.banner = None;

        self.load_metadata().await?;
        self.refresh().await
    }

    pub fn close(&mut self) {
        self.guard.cancel_outstanding();
        self.debouncer.disarm();
        self.staged.discard_table(&self.table);
    }

    fn raise(&mut self, error: ViewError) -> ViewError {
        self.banner = Some(error.clone());
        error
    }

    fn raise_commit(&mut self, error: CommitError) -> CommitError {
        self.banner = Some(ViewError::Commit(error.clone()));
        error
    }

    #[must_use]
    pub fn config(&self) -> &TableViewConfig {
        &self.config
    }

    #[must_use]
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    #[must_use]
    pub fn foreign_keys(&self) -> &ForeignKeyMap {
        &self.foreign_keys
    }

    #[must_use]
    pub fn result(&self) -> Arc<QueryResult> {
        Arc::clone(&self.result)
    }

    #[must_use]
    pub fn pagination(&self) -> &PaginationState {
        &self.pagination
    }

    #[must_use]
    pub fn sort(&self) -> Option<&SortOrder> {
        self.sort.as_ref()
    }

    #[must_use]
    pub fn filters(&self) -> &[TableFilter] {
        &self.filters
    }

    #[must_use]
    pub fn staged(&self) -> &StagedChangeStore {
        &self.staged
    }

    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.staged.count_for(&self.table)
    }

    #[must_use]
    pub fn display_rows(&self) -> Vec<Record> {
        self.staged.overlay(&self.table, &self.result.rows)
    }

    #[must_use]
    pub fn is_cell_dirty(&self, row_index: usize, column: &str) -> bool {
        self.staged.is_cell_dirty(&self.table, row_index, column)
    }

    #[must_use]
    pub fn banner(&self) -> Option<&ViewError> {
        self.banner.as_ref()
    }

    pub fn dismiss_banner(&mut self) {
        self.banner = None;
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.save_guard.is_saving()
    }

    #[must_use]
    pub fn save_guard(&self) -> SaveGuard {
        self.save_guard.clone()
    }
}
