use std::collections::BTreeMap;

use crate::sql_generator::TableRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(u64);

impl ViewId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct ViewRegistry {
    next_id: u64,
    views: BTreeMap<(String, TableRef), ViewId>,
}

impl ViewRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, connection_id: &str, table: &TableRef) -> (ViewId, bool) {
        let key = (connection_id.to_string(), table.clone());
        if let Some(existing) = self.views.get(&key) {
            return (*existing, false);
        }
        self.next_id += 1;
        let id = ViewId(self.next_id);
        self.views.insert(key, id);
        (id, true)
    }

    #[must_use]
    pub fn find(&self, connection_id: &str, table: &TableRef) -> Option<ViewId> {
        self.views
            .get(&(connection_id.to_string(), table.clone()))
            .copied()
    }

    pub fn close(&mut self, view: ViewId) -> bool {
        let before = self.views.len();
        self.views.retain(|_, id| *id != view);
        before != self.views.len()
    }

    pub fn close_connection(&mut self, connection_id: &str) -> usize {
        let before = self.views.len();
        self.views
            .retain(|(connection, _), _| connection.as_str() != connection_id);
        before - self.views.len()
    }

    #[must_use]
    pub fn tables_for(&self, connection_id: &str) -> Vec<&TableRef> {
        self.views
            .keys()
            .filter(|(connection, _)| connection == connection_id)
            .map(|(_, table)| table)
            .collect()
    }
}
