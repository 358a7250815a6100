use std::collections::HashMap;

use serde_json::Value;

use crate::backend::ColumnMeta;
use crate::sql_generator::TableRef;
use crate::value::{values_match, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    PrimaryKey,
    FullRow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowIdentity {
    pub kind: IdentityKind,
    pub values: Record,
}

/// Primary-key values of `row`, or the whole row when no key column is known.
#[must_use]
pub fn row_identity(row: &Record, columns: &[ColumnMeta]) -> RowIdentity {
    let key_values = columns
        .iter()
        .filter(|column| column.is_primary_key)
        .filter_map(|column| {
            row.get(&column.name)
                .map(|value| (column.name.clone(), value.clone()))
        })
        .collect::<Record>();

    if key_values.is_empty() {
        RowIdentity {
            kind: IdentityKind::FullRow,
            values: row.clone(),
        }
    } else {
        RowIdentity {
            kind: IdentityKind::PrimaryKey,
            values: key_values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedUpdate {
    pub id: String,
    pub table: TableRef,
    pub row_index: usize,
    pub identity: RowIdentity,
    pub column: String,
    pub old_value: Value,
    pub new_value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedInsert {
    pub id: String,
    pub table: TableRef,
    pub new_row: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StagedChange {
    Update(StagedUpdate),
    Insert(StagedInsert),
}

impl StagedChange {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Update(update) => &update.id,
            Self::Insert(insert) => &insert.id,
        }
    }

    #[must_use]
    pub fn table(&self) -> &TableRef {
        match self {
            Self::Update(update) => &update.table,
            Self::Insert(insert) => &insert.table,
        }
    }
}

#[must_use]
pub fn cell_edit_id(table: &TableRef, row_index: usize, column: &str) -> String {
    format!("edit-{table}-{row_index}-{column}")
}

#[derive(Debug, Clone, Copy)]
pub struct EditContext<'a> {
    pub table: &'a TableRef,
    pub rows: &'a [Record],
    pub columns: &'a [ColumnMeta],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    InsertUpdated { id: String },
    Staged { id: String },
    Reverted { id: String },
    OutOfRange,
}

#[derive(Debug, Clone)]
struct OriginalValue {
    table: TableRef,
    value: Value,
}

#[derive(Debug, Default)]
pub struct StagedChangeStore {
    changes: Vec<StagedChange>,
    originals: HashMap<String, OriginalValue>,
    next_insert: u64,
}

impl StagedChangeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StagedChange> {
        self.changes.iter()
    }

    pub fn changes_for<'a>(
        &'a self,
        table: &'a TableRef,
    ) -> impl Iterator<Item = &'a StagedChange> + 'a {
        self.changes
            .iter()
            .filter(move |change| change.table() == table)
    }

    #[must_use]
    pub fn count_for(&self, table: &TableRef) -> usize {
        self.changes_for(table).count()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&StagedChange> {
        self.changes.iter().find(|change| change.id() == id)
    }

    pub fn inserts_for<'a>(
        &'a self,
        table: &'a TableRef,
    ) -> impl Iterator<Item = &'a StagedInsert> + 'a {
        self.changes_for(table).filter_map(|change| match change {
            StagedChange::Insert(insert) => Some(insert),
            StagedChange::Update(_) => None,
        })
    }

    #[must_use]
    pub fn original_value(&self, id: &str) -> Option<&Value> {
        self.originals.get(id).map(|original| &original.value)
    }

    pub fn record_cell_edit(
        &mut self,
        context: &EditContext<'_>,
        row_index: usize,
        column: &str,
        old_value: Value,
        new_value: Value,
    ) -> EditOutcome {
        if row_index >= context.rows.len() {
            return self.edit_staged_insert(
                context.table,
                row_index - context.rows.len(),
                column,
                new_value,
            );
        }

        let id = cell_edit_id(context.table, row_index, column);
        let original = &self
            .originals
            .entry(id.clone())
            .or_insert_with(|| OriginalValue {
                table: context.table.clone(),
                value: old_value,
            })
            .value;

        if values_match(&new_value, original) {
            self.originals.remove(&id);
            self.changes.retain(|change| change.id() != id);
            tracing::debug!(%id, "cell edit reverted");
            return EditOutcome::Reverted { id };
        }

        let update = StagedUpdate {
            id: id.clone(),
            table: context.table.clone(),
            row_index,
            identity: row_identity(&context.rows[row_index], context.columns),
            column: column.to_string(),
            old_value: original.clone(),
            new_value,
        };
        self.upsert(StagedChange::Update(update));
        EditOutcome::Staged { id }
    }

    fn edit_staged_insert(
        &mut self,
        table: &TableRef,
        insert_index: usize,
        column: &str,
        new_value: Value,
    ) -> EditOutcome {
        let target = self
            .changes
            .iter_mut()
            .filter_map(|change| match change {
                StagedChange::Insert(insert) if &insert.table == table => Some(insert),
                _ => None,
            })
            .nth(insert_index);

        match target {
            Some(insert) => {
                insert.new_row.insert(column.to_string(), new_value);
                EditOutcome::InsertUpdated {
                    id: insert.id.clone(),
                }
            }
            None => EditOutcome::OutOfRange,
        }
    }

    fn upsert(&mut self, change: StagedChange) {
        if let Some(existing) = self
            .changes
            .iter_mut()
            .find(|existing| existing.id() == change.id())
        {
            *existing = change;
        } else {
            self.changes.push(change);
        }
    }

    pub fn insert_row(&mut self, table: &TableRef, columns: &[ColumnMeta]) -> String {
        let new_row = columns
            .iter()
            .map(|column| (column.name.clone(), Value::Null))
            .collect::<Record>();
        self.push_insert(table, new_row)
    }

    pub fn duplicate_row(
        &mut self,
        table: &TableRef,
        row: &Record,
        columns: &[ColumnMeta],
    ) -> String {
        let mut new_row = row.clone();
        for column in columns.iter().filter(|column| column.is_auto_increment) {
            if let Some(value) = new_row.get_mut(&column.name) {
                *value = Value::Null;
            }
        }
        self.push_insert(table, new_row)
    }

    fn push_insert(&mut self, table: &TableRef, new_row: Record) -> String {
        self.next_insert += 1;
        let id = format!("insert-{table}-{}", self.next_insert);
        self.changes.push(StagedChange::Insert(StagedInsert {
            id: id.clone(),
            table: table.clone(),
            new_row,
        }));
        id
    }

    pub fn discard_table(&mut self, table: &TableRef) -> usize {
        let before = self.changes.len();
        self.changes.retain(|change| change.table() != table);
        self.originals.retain(|_, original| &original.table != table);
        before - self.changes.len()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
        self.originals.clear();
    }

    #[must_use]
    pub fn is_cell_dirty(&self, table: &TableRef, row_index: usize, column: &str) -> bool {
        self.get(&cell_edit_id(table, row_index, column)).is_some()
    }

    #[must_use]
    pub fn overlay(&self, table: &TableRef, rows: &[Record]) -> Vec<Record> {
        let mut display = rows.to_vec();
        for change in self.changes_for(table) {
            match change {
                StagedChange::Update(update) => {
                    if let Some(row) = display.get_mut(update.row_index) {
                        row.insert(update.column.clone(), update.new_value.clone());
                    }
                }
                StagedChange::Insert(insert) => display.push(insert.new_row.clone()),
            }
        }
        display
    }
}
