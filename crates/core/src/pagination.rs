use crate::filters::{has_active_filters, TableFilter};

pub const DEFAULT_PAGE_SIZE: u64 = 200;

#[must_use]
pub fn page_offset(page: u64, page_size: u64) -> u64 {
    page.saturating_sub(1).saturating_mul(page_size)
}

#[must_use]
pub fn total_pages(total_rows: u64, page_size: u64) -> u64 {
    total_rows.div_ceil(page_size.max(1)).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountStrategy {
    Exact,
    Estimate,
}

#[must_use]
pub fn choose_count_strategy(filters: &[TableFilter], exact_when_filtered: bool) -> CountStrategy {
    if exact_when_filtered && has_active_filters(filters) {
        CountStrategy::Exact
    } else {
        CountStrategy::Estimate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCount {
    pub total: u64,
    pub is_estimate: bool,
}

impl RowCount {
    #[must_use]
    pub fn exact(total: u64) -> Self {
        Self {
            total,
            is_estimate: false,
        }
    }

    #[must_use]
    pub fn estimate(total: u64) -> Self {
        Self {
            total,
            is_estimate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationState {
    pub page: u64,
    pub page_size: u64,
    pub total_rows: u64,
    pub is_estimated_count: bool,
}

impl PaginationState {
    #[must_use]
    pub fn new(page_size: u64) -> Self {
        Self {
            page: 1,
            page_size: page_size.max(1),
            total_rows: 0,
            is_estimated_count: false,
        }
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        total_pages(self.total_rows, self.page_size)
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        page_offset(self.page, self.page_size)
    }

    #[must_use]
    pub fn can_page_next(&self) -> bool {
        self.page < self.total_pages()
    }

    #[must_use]
    pub fn can_page_previous(&self) -> bool {
        self.page > 1
    }

    pub fn set_page(&mut self, page: u64) {
        self.page = page.max(1);
    }

    pub fn set_page_size(&mut self, page_size: u64) {
        self.page_size = page_size.max(1);
        self.page = 1;
    }

    /// Applies a count for a page that returned `rows_on_page` rows.
    ///
    /// Statistics may lag behind the table, so an estimate never drops below the
    /// rows already seen up to this page.
    pub fn apply_count(&mut self, count: RowCount, rows_on_page: u64) {
        let seen = self.offset().saturating_add(rows_on_page);
        self.total_rows = if count.is_estimate {
            count.total.max(seen)
        } else {
            count.total
        };
        self.is_estimated_count = count.is_estimate;
    }
}

impl Default for PaginationState {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        choose_count_strategy, page_offset, total_pages, CountStrategy, PaginationState, RowCount,
    };
    use crate::filters::{FilterOperator, TableFilter};

    #[test]
    fn total_pages_is_ceiling_with_minimum_of_one() {
        let cases = [(0, 1), (1, 1), (199, 1), (200, 1), (201, 2), (10_000, 50)];
        for (total_rows, expected) in cases {
            assert_eq!(
                total_pages(total_rows, 200),
                expected,
                "total_rows={total_rows}"
            );
        }
    }

    #[test]
    fn offsets_are_one_based() {
        assert_eq!(page_offset(1, 200), 0);
        assert_eq!(page_offset(0, 200), 0);
        assert_eq!(page_offset(4, 25), 75);
    }

    #[test]
    fn filtered_views_use_exact_counts() {
        let filters = vec![TableFilter::new(1, "status", FilterOperator::Equals, "active")];
        assert_eq!(choose_count_strategy(&filters, true), CountStrategy::Exact);
        assert_eq!(choose_count_strategy(&[], true), CountStrategy::Estimate);
        let blank_list = vec![TableFilter::new(2, "id", FilterOperator::In, " , ")];
        assert_eq!(
            choose_count_strategy(&blank_list, true),
            CountStrategy::Estimate
        );
        assert_eq!(
            choose_count_strategy(&filters, false),
            CountStrategy::Estimate
        );
    }

    #[test]
    fn stale_estimate_is_raised_to_rows_seen() {
        let mut state = PaginationState::new(200);
        state.set_page(3);
        state.apply_count(RowCount::estimate(10), 150);
        assert_eq!(state.total_rows, 550);
        assert!(state.is_estimated_count);

        state.apply_count(RowCount::exact(10), 150);
        assert_eq!(state.total_rows, 10);
        assert!(!state.is_estimated_count);
    }

    #[test]
    fn page_size_change_resets_to_first_page() {
        let mut state = PaginationState::default();
        state.set_page(5);
        state.set_page_size(0);
        assert_eq!(state.page, 1);
        assert_eq!(state.page_size, 1);
    }

    #[test]
    fn paging_bounds_follow_total_pages() {
        let mut state = PaginationState::new(200);
        state.apply_count(RowCount::exact(201), 200);
        assert!(state.can_page_next());
        assert!(!state.can_page_previous());

        state.set_page(2);
        assert!(!state.can_page_next());
        assert!(state.can_page_previous());
    }
}
