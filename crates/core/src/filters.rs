use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sql_generator::{Bindings, Dialect};

pub const DEFAULT_FILTER_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Like,
    NotLike,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
    In,
}

impl FilterOperator {
    #[must_use]
    pub fn requires_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }

    fn comparison(self) -> Option<&'static str> {
        match self {
            Self::Equals => Some("="),
            Self::NotEquals => Some("!="),
            Self::GreaterThan => Some(">"),
            Self::GreaterOrEqual => Some(">="),
            Self::LessThan => Some("<"),
            Self::LessOrEqual => Some("<="),
            Self::Like | Self::Contains | Self::StartsWith | Self::EndsWith => Some("LIKE"),
            Self::NotLike => Some("NOT LIKE"),
            Self::IsNull | Self::IsNotNull | Self::In => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFilter {
    pub id: u64,
    pub enabled: bool,
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<String>,
}

impl TableFilter {
    #[must_use]
    pub fn new(
        id: u64,
        column: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id,
            enabled: true,
            column: column.into(),
            operator,
            value: Some(value.into()),
        }
    }

    #[must_use]
    pub fn without_value(id: u64, column: impl Into<String>, operator: FilterOperator) -> Self {
        Self {
            id,
            enabled: true,
            column: column.into(),
            operator,
            value: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        if !self.enabled || self.column.trim().is_empty() {
            return false;
        }
        match (self.operator, self.value.as_deref()) {
            (operator, _) if !operator.requires_value() => true,
            (FilterOperator::In, Some(raw)) => in_list_items(raw).next().is_some(),
            (_, value) => value.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WhereClause {
    pub sql: String,
    pub params: Vec<Value>,
}

impl WhereClause {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

#[must_use]
pub fn has_active_filters(filters: &[TableFilter]) -> bool {
    filters.iter().any(TableFilter::is_active)
}

#[must_use]
pub fn build_where_clause(dialect: Dialect, filters: &[TableFilter]) -> WhereClause {
    let mut bindings = Bindings::new(dialect);
    let sql = append_where_clause(&mut bindings, filters);
    WhereClause {
        sql,
        params: bindings.into_params(),
    }
}

pub fn append_where_clause(bindings: &mut Bindings, filters: &[TableFilter]) -> String {
    let conditions = filters
        .iter()
        .filter(|filter| filter.is_active())
        .filter_map(|filter| filter_condition(bindings, filter))
        .collect::<Vec<_>>();

    if conditions.is_empty() {
        return String::new();
    }
    format!("WHERE {}", conditions.join(" AND "))
}

fn filter_condition(bindings: &mut Bindings, filter: &TableFilter) -> Option<String> {
    let column = bindings.dialect().quote_identifier(&filter.column);
    let raw = filter.value.as_deref().unwrap_or_default();

    match filter.operator {
        FilterOperator::IsNull => Some(format!("{column} IS NULL")),
        FilterOperator::IsNotNull => Some(format!("{column} IS NOT NULL")),
        FilterOperator::In => {
            let items = in_list_items(raw).collect::<Vec<_>>();
            if items.is_empty() {
                return None;
            }
            let placeholders = items
                .into_iter()
                .map(|item| bindings.bind(Value::from(item)))
                .collect::<Vec<_>>();
            Some(format!("{column} IN ({})", placeholders.join(", ")))
        }
        operator => {
            let pattern = match operator {
                FilterOperator::Contains => format!("%{}%", escape_like(raw)),
                FilterOperator::StartsWith => format!("{}%", escape_like(raw)),
                FilterOperator::EndsWith => format!("%{}", escape_like(raw)),
                _ => raw.to_string(),
            };
            let comparison = operator.comparison()?;
            let placeholder = bindings.bind(Value::from(pattern));
            Some(format!("{column} {comparison} {placeholder}"))
        }
    }
}

fn in_list_items(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Collapses a burst of filter edits into one fetch, `window` after the last edit.
///
/// Holds only a deadline. The caller reads the filter list at fire time, so the
/// fetch always sees the newest predicates.
#[derive(Debug, Clone)]
pub struct FilterDebouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl FilterDebouncer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for FilterDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_FILTER_DEBOUNCE)
    }
}
