use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use rowdesk_adapters::mysql::{MysqlSession, PASSWORD_ENV_VAR};
use rowdesk_core::backend::ExecutorError;
use rowdesk_core::filters::{FilterOperator, TableFilter};
use rowdesk_core::messages::{MessageBus, ViewCommand, DEFAULT_BUS_CAPACITY};
use rowdesk_core::query_log::FileQueryLog;
use rowdesk_core::settings::{Settings, SettingsError};
use rowdesk_core::sql_generator::{SortDirection, SortOrder, SqlGenerationError, TableRef};
use rowdesk_core::table_view::{TableView, TableViewConfig, ViewError};
use rowdesk_core::value::Record;
use rowdesk_core::view_registry::ViewRegistry;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("no profile named `{0}` in settings")]
    UnknownProfile(String),
    #[error("invalid table `{table}`: {source}")]
    Table {
        table: String,
        #[source]
        source: SqlGenerationError,
    },
    #[error("failed to connect: {0}")]
    Connect(#[source] ExecutorError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error("failed to render row: {0}")]
    Render(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseOutcome {
    Run(RunConfig),
    HelpRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunConfig {
    profile: String,
    table: String,
    page: u64,
    sort: Option<SortOrder>,
    filters: Vec<TableFilter>,
    exact_count: bool,
    settings_path: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rowdesk=info,warn")),
        )
        .init();

    match parse_args_from(std::env::args().skip(1))? {
        ParseOutcome::HelpRequested => print_help(),
        ParseOutcome::Run(config) => run(config).await?,
    }
    Ok(())
}

async fn run(config: RunConfig) -> Result<(), AppError> {
    let settings = match &config.settings_path {
        Some(path) => Settings::load_from_path(path)?,
        None => Settings::load_default()?,
    };
    let profile = settings
        .profile(&config.profile)
        .cloned()
        .ok_or_else(|| AppError::UnknownProfile(config.profile.clone()))?;
    let table = TableRef::parse(&config.table).map_err(|source| AppError::Table {
        table: config.table.clone(),
        source,
    })?;

    let log = Arc::new(FileQueryLog::from_path(settings.query_log_path()));
    let session = Arc::new(
        MysqlSession::connect(&profile)
            .await
            .map_err(AppError::Connect)?,
    );

    let mut registry = ViewRegistry::new();
    let mut bus = MessageBus::new(DEFAULT_BUS_CAPACITY);
    let (view_id, _) = registry.open(&profile.name, &table);

    let mut view = TableView::new(
        session,
        log,
        TableViewConfig::from_settings(settings.engine(), &profile),
        table,
    );
    let connection = bus.connection(&profile.name);
    view.attach_bus(connection.clone());
    view.load_metadata().await?;

    if !config.filters.is_empty() {
        let mut commands = view
            .subscribe_commands()
            .ok_or_else(|| AppError::Usage("view has no message bus".to_string()))?;
        connection.send(view.table(), ViewCommand::SetFilter(config.filters));
        while let Some(command) = commands.try_recv() {
            view.handle_command(command).await?;
        }
    }
    if config.sort.is_some() {
        view.set_sort(config.sort).await?;
    }
    if config.page > 1 {
        view.set_page(config.page).await?;
    }
    view.refresh_if_needed().await?;
    if config.exact_count {
        view.load_exact_count().await?;
    }

    let pagination = view.pagination();
    tracing::info!(
        table = %view.table(),
        page = pagination.page,
        total_pages = pagination.total_pages(),
        total_rows = pagination.total_rows,
        estimated = pagination.is_estimated_count,
        "fetched page"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_rows(&mut out, &view.display_rows())?;

    view.close();
    registry.close(view_id);
    bus.close(&profile.name);
    Ok(())
}

fn write_rows(out: &mut impl Write, rows: &[Record]) -> Result<(), AppError> {
    for row in rows {
        let rendered = serde_json::to_string(row)?;
        writeln!(out, "{rendered}")?;
    }
    out.flush()?;
    Ok(())
}

fn parse_args_from(args: impl IntoIterator<Item = String>) -> Result<ParseOutcome, AppError> {
    let mut args = args.into_iter();
    let mut profile = None;
    let mut table = None;
    let mut page = 1_u64;
    let mut sort_column = None;
    let mut descending = false;
    let mut filters = Vec::new();
    let mut exact_count = false;
    let mut settings_path = None;

    while let Some(flag) = args.next() {
        match flag.as_str() {
            "-h" | "--help" => return Ok(ParseOutcome::HelpRequested),
            "--profile" => profile = Some(next_value(&mut args, "--profile")?),
            "--table" => table = Some(next_value(&mut args, "--table")?),
            "--page" => {
                page = next_value(&mut args, "--page")?
                    .parse::<u64>()
                    .map_err(|error| AppError::Usage(format!("invalid --page value: {error}")))?;
            }
            "--sort" => sort_column = Some(next_value(&mut args, "--sort")?),
            "--desc" => descending = true,
            "--filter" => {
                let raw = next_value(&mut args, "--filter")?;
                let id = filters.len() as u64 + 1;
                filters.push(parse_filter(id, &raw)?);
            }
            "--exact-count" => exact_count = true,
            "--settings" => {
                settings_path = Some(PathBuf::from(next_value(&mut args, "--settings")?));
            }
            _ => return Err(AppError::Usage(format!("unknown argument `{flag}`"))),
        }
    }

    let profile = profile.ok_or_else(|| AppError::Usage("missing --profile".to_string()))?;
    let table = table.ok_or_else(|| AppError::Usage("missing --table".to_string()))?;
    let direction = if descending {
        SortDirection::Desc
    } else {
        SortDirection::Asc
    };

    Ok(ParseOutcome::Run(RunConfig {
        profile,
        table,
        page: page.max(1),
        sort: sort_column.map(|column| SortOrder::new(column, direction)),
        filters,
        exact_count,
        settings_path,
    }))
}

/// `col=value`, `col!=value`, `col>=value`, `col<=value`, `col>value`, `col<value`,
/// `col~text` (contains), `col:null`, `col:notnull`.
fn parse_filter(id: u64, raw: &str) -> Result<TableFilter, AppError> {
    if let Some((column, suffix)) = raw.split_once(':') {
        let operator = match suffix.trim().to_ascii_lowercase().as_str() {
            "null" => FilterOperator::IsNull,
            "notnull" => FilterOperator::IsNotNull,
            other => {
                return Err(AppError::Usage(format!(
                    "unknown filter suffix `:{other}` in `{raw}`"
                )))
            }
        };
        return Ok(TableFilter::without_value(id, column.trim(), operator));
    }

    const OPERATORS: [(&str, FilterOperator); 7] = [
        ("!=", FilterOperator::NotEquals),
        (">=", FilterOperator::GreaterOrEqual),
        ("<=", FilterOperator::LessOrEqual),
        ("=", FilterOperator::Equals),
        (">", FilterOperator::GreaterThan),
        ("<", FilterOperator::LessThan),
        ("~", FilterOperator::Contains),
    ];
    for (symbol, operator) in OPERATORS {
        if let Some((column, value)) = raw.split_once(symbol) {
            if column.trim().is_empty() {
                break;
            }
            return Ok(TableFilter::new(id, column.trim(), operator, value));
        }
    }

    Err(AppError::Usage(format!("invalid filter `{raw}`")))
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, AppError> {
    args.next()
        .ok_or_else(|| AppError::Usage(format!("missing value for `{flag}`")))
}

fn print_help() {
    println!(
        "rowdesk headless page fetcher\n\n\
Usage:\n  rowdesk-app --profile <name> --table <[schema.]table> [OPTIONS]\n\n\
Options:\n  --page <n>            1-based page to fetch (default: 1)\n  --sort <column>       Sort column\n  --desc                Sort descending\n  --filter <expr>       col=value, col!=value, col>=value, col<=value, col>value,\n                        col<value, col~text, col:null, col:notnull (repeatable)\n  --exact-count         Replace the estimated total with COUNT(*)\n  --settings <path>     Settings file (default: <config dir>/rowdesk/settings.toml)\n\n\
Environment:\n  {PASSWORD_ENV_VAR} is used for authentication.\n  RUST_LOG overrides the log filter (default: rowdesk=info,warn).\n"
    );
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::{parse_args_from, parse_filter, run, write_rows, AppError, ParseOutcome};
    use rowdesk_core::filters::FilterOperator;
    use rowdesk_core::sql_generator::SortDirection;
    use rowdesk_core::value::Record;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| (*arg).to_string()).collect()
    }

    #[test]
    fn parse_args_reads_all_options() {
        let outcome = parse_args_from(args(&[
            "--profile",
            "local",
            "--table",
            "app.users",
            "--page",
            "3",
            "--sort",
            "email",
            "--desc",
            "--filter",
            "status=active",
            "--filter",
            "deleted_at:null",
            "--exact-count",
        ]))
        .expect("parse should succeed");

        let ParseOutcome::Run(config) = outcome else {
            panic!("expected run config");
        };
        assert_eq!(config.profile, "local");
        assert_eq!(config.table, "app.users");
        assert_eq!(config.page, 3);
        let sort = config.sort.expect("sort");
        assert_eq!(sort.column, "email");
        assert_eq!(sort.direction, SortDirection::Desc);
        assert_eq!(config.filters.len(), 2);
        assert_eq!(config.filters[0].id, 1);
        assert_eq!(config.filters[1].operator, FilterOperator::IsNull);
        assert!(config.exact_count);
    }

    #[test]
    fn parse_args_detects_help_and_errors() {
        assert_eq!(
            parse_args_from(args(&["--help"])).expect("help parse"),
            ParseOutcome::HelpRequested
        );
        assert!(matches!(
            parse_args_from(args(&["--bogus"])),
            Err(AppError::Usage(_))
        ));
        assert!(matches!(
            parse_args_from(args(&["--table", "users"])),
            Err(AppError::Usage(message)) if message == "missing --profile"
        ));
        assert!(matches!(
            parse_args_from(args(&["--profile"])),
            Err(AppError::Usage(_))
        ));
    }

    #[test]
    fn filters_parse_longest_operator_first() {
        let filter = parse_filter(1, "age>=18").expect("filter");
        assert_eq!(filter.column, "age");
        assert_eq!(filter.operator, FilterOperator::GreaterOrEqual);
        assert_eq!(filter.value.as_deref(), Some("18"));

        let filter = parse_filter(2, "status!=gone").expect("filter");
        assert_eq!(filter.operator, FilterOperator::NotEquals);

        let filter = parse_filter(3, "note=a=b").expect("filter");
        assert_eq!(filter.operator, FilterOperator::Equals);
        assert_eq!(filter.value.as_deref(), Some("a=b"));

        let filter = parse_filter(4, "name~ann").expect("filter");
        assert_eq!(filter.operator, FilterOperator::Contains);

        assert!(parse_filter(5, "=oops").is_err());
        assert!(parse_filter(6, "col:maybe").is_err());
        assert!(parse_filter(7, "plain").is_err());
    }

    #[test]
    fn rows_are_written_as_json_lines() {
        let mut first = Record::new();
        first.insert("id".to_string(), json!(1));
        first.insert("email".to_string(), json!("a@x.com"));
        let mut second = Record::new();
        second.insert("id".to_string(), json!(2));
        second.insert("email".to_string(), json!(null));

        let mut out = Vec::new();
        write_rows(&mut out, &[first, second]).expect("write rows");
        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "{\"id\":1,\"email\":\"a@x.com\"}\n{\"id\":2,\"email\":null}\n"
        );
    }

    #[tokio::test]
    async fn unknown_profile_fails_before_connecting() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let settings_path = temp_dir.path().join("settings.toml");
        let outcome = parse_args_from(args(&[
            "--profile",
            "missing",
            "--table",
            "users",
            "--settings",
            settings_path.to_str().expect("utf8 path"),
        ]))
        .expect("parse should succeed");
        let ParseOutcome::Run(config) = outcome else {
            panic!("expected run config");
        };

        let err = run(config).await.expect_err("profile lookup should fail");
        assert!(matches!(err, AppError::UnknownProfile(name) if name == "missing"));
    }
}
