use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use serde_json::json;

use crate::filters::TableFilter;
use crate::sql_generator::{SortOrder, TableRef};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCheckpoint {
    BeforeQuery,
    AfterQuery,
    BeforeCount,
    AfterCount,
    BeforeApply,
}

#[derive(Debug, Clone)]
pub struct FetchTicket {
    sequence: u64,
    token: CancellationToken,
    current: Arc<AtomicU64>,
}

impl FetchTicket {
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Not cancelled and not overtaken by a newer fetch.
    ///
    /// Both checks are needed: a newer fetch started from another path does not
    /// necessarily cancel this ticket's token.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled() && self.current.load(Ordering::SeqCst) == self.sequence
    }

    pub fn checkpoint(&self, checkpoint: FetchCheckpoint) -> Result<(), FetchCheckpoint> {
        if self.is_live() {
            Ok(())
        } else {
            tracing::debug!(
                sequence = self.sequence,
                ?checkpoint,
                "dropping superseded fetch"
            );
            Err(checkpoint)
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchGuard {
    current: Arc<AtomicU64>,
    outstanding: Option<CancellationToken>,
}

impl FetchGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> FetchTicket {
        self.cancel_outstanding();
        let sequence = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        self.outstanding = Some(token.clone());
        FetchTicket {
            sequence,
            token,
            current: Arc::clone(&self.current),
        }
    }

    pub fn cancel_outstanding(&mut self) {
        if let Some(token) = self.outstanding.take() {
            token.cancel();
        }
    }

    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        Arc::ptr_eq(&self.current, &ticket.current) && ticket.is_live()
    }

    pub fn finish(&mut self, ticket: &FetchTicket) {
        if self.is_current(ticket) {
            self.outstanding = None;
        }
    }
}

#[must_use]
pub fn fetch_key(
    table: &TableRef,
    page: u64,
    page_size: u64,
    sort: Option<&SortOrder>,
    filters: &[TableFilter],
) -> String {
    let active = filters
        .iter()
        .filter(|filter| filter.is_active())
        .collect::<Vec<_>>();
    json!({
        "table": table.table,
        "schema": table.schema,
        "page": page,
        "page_size": page_size,
        "sort": sort.map(|order| order.column.as_str()),
        "sort_dir": sort.map(|order| order.direction.keyword()),
        "filters": active,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::{fetch_key, CancellationToken, FetchCheckpoint, FetchGuard};
    use crate::filters::{FilterOperator, TableFilter};
    use crate::sql_generator::{SortDirection, SortOrder, TableRef};

    #[test]
    fn token_cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn sequences_increase_and_cancel_previous_fetch() {
        let mut guard = FetchGuard::new();
        let first = guard.begin();
        let second = guard.begin();

        assert!(second.sequence() > first.sequence());
        assert!(first.token().is_cancelled());
        assert!(!first.is_live());
        assert!(second.is_live());
        assert!(guard.is_current(&second));
    }

    #[test]
    fn sequence_check_catches_uncancelled_stale_ticket() {
        let mut guard = FetchGuard::new();
        let first = guard.begin();
        guard.finish(&first);
        let second = guard.begin();

        assert!(!first.token().is_cancelled());
        assert_eq!(
            first.checkpoint(FetchCheckpoint::AfterQuery),
            Err(FetchCheckpoint::AfterQuery)
        );
        assert_eq!(second.checkpoint(FetchCheckpoint::AfterQuery), Ok(()));
    }

    #[test]
    fn cancel_outstanding_invalidates_live_ticket() {
        let mut guard = FetchGuard::new();
        let ticket = guard.begin();
        guard.cancel_outstanding();
        assert!(!ticket.is_live());
        assert_eq!(guard.current_sequence(), ticket.sequence());
    }

    #[test]
    fn tickets_from_another_guard_are_never_current() {
        let mut guard = FetchGuard::new();
        let mut other = FetchGuard::new();
        let _ = guard.begin();
        let foreign = other.begin();
        assert!(!guard.is_current(&foreign));
    }

    #[test]
    fn fetch_key_ignores_inactive_filters() {
        let table = TableRef::new(None, "users").expect("valid table");
        let sort = SortOrder::new("id", SortDirection::Desc);
        let mut disabled = TableFilter::new(1, "status", FilterOperator::Equals, "active");
        disabled.enabled = false;

        let plain = fetch_key(&table, 1, 200, Some(&sort), &[]);
        let with_disabled = fetch_key(&table, 1, 200, Some(&sort), &[disabled.clone()]);
        assert_eq!(plain, with_disabled);

        disabled.enabled = true;
        let with_enabled = fetch_key(&table, 1, 200, Some(&sort), &[disabled]);
        assert_ne!(plain, with_enabled);
        assert_ne!(plain, fetch_key(&table, 2, 200, Some(&sort), &[]));
    }
}
