use std::collections::BTreeMap;

use serde_json::Value;

use crate::backend::ForeignKeyMeta;
use crate::messages::NavigationRequest;
use crate::sql_generator::TableRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyTarget {
    pub referenced_table: TableRef,
    pub referenced_column: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignKeyMap {
    by_column: BTreeMap<String, ForeignKeyTarget>,
}

impl ForeignKeyMap {
    /// Composite keys map each local column to its positional counterpart.
    /// A referenced table without a schema inherits `default_schema`.
    #[must_use]
    pub fn from_metadata(foreign_keys: &[ForeignKeyMeta], default_schema: Option<&str>) -> Self {
        let mut by_column = BTreeMap::new();
        for foreign_key in foreign_keys {
            let schema = foreign_key
                .referenced_schema
                .clone()
                .or_else(|| default_schema.map(str::to_string));
            for (column, referenced_column) in foreign_key
                .columns
                .iter()
                .zip(foreign_key.referenced_columns.iter())
            {
                by_column
                    .entry(column.clone())
                    .or_insert_with(|| ForeignKeyTarget {
                        referenced_table: TableRef {
                            schema: schema.clone(),
                            table: foreign_key.referenced_table.clone(),
                        },
                        referenced_column: referenced_column.clone(),
                    });
            }
        }
        Self { by_column }
    }

    #[must_use]
    pub fn target(&self, column: &str) -> Option<&ForeignKeyTarget> {
        self.by_column.get(column)
    }

    #[must_use]
    pub fn is_foreign_key(&self, column: &str) -> bool {
        self.by_column.contains_key(column)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_column.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_column.is_empty()
    }

    #[must_use]
    pub fn navigation_for(
        &self,
        connection_id: &str,
        column: &str,
        value: &Value,
    ) -> Option<NavigationRequest> {
        if value.is_null() {
            return None;
        }
        let target = self.target(column)?;
        Some(NavigationRequest {
            connection_id: connection_id.to_string(),
            table: target.referenced_table.clone(),
            filter_column: target.referenced_column.clone(),
            filter_value: value.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ForeignKeyMap;
    use crate::backend::ForeignKeyMeta;

    fn metadata() -> Vec<ForeignKeyMeta> {
        vec![
            ForeignKeyMeta {
                constraint_name: "fk_orders_users".to_string(),
                columns: vec!["user_id".to_string()],
                referenced_schema: None,
                referenced_table: "users".to_string(),
                referenced_columns: vec!["id".to_string()],
            },
            ForeignKeyMeta {
                constraint_name: "fk_orders_skus".to_string(),
                columns: vec!["sku_vendor".to_string(), "sku_code".to_string()],
                referenced_schema: Some("catalog".to_string()),
                referenced_table: "skus".to_string(),
                referenced_columns: vec!["vendor".to_string(), "code".to_string()],
            },
        ]
    }

    #[test]
    fn maps_single_and_composite_keys_per_column() {
        let map = ForeignKeyMap::from_metadata(&metadata(), Some("app"));
        assert_eq!(map.len(), 3);

        let user = map.target("user_id").expect("user fk");
        assert_eq!(user.referenced_table.to_string(), "app.users");
        assert_eq!(user.referenced_column, "id");

        let code = map.target("sku_code").expect("sku fk");
        assert_eq!(code.referenced_table.to_string(), "catalog.skus");
        assert_eq!(code.referenced_column, "code");
        assert!(!map.is_foreign_key("total"));
    }

    #[test]
    fn navigation_requires_key_column_and_value() {
        let map = ForeignKeyMap::from_metadata(&metadata(), None);

        let request = map
            .navigation_for("local", "user_id", &json!(7))
            .expect("navigation");
        assert_eq!(request.connection_id, "local");
        assert_eq!(request.table.table, "users");
        assert_eq!(request.filter_column, "id");
        assert_eq!(request.filter_value, json!(7));

        assert!(map.navigation_for("local", "user_id", &json!(null)).is_none());
        assert!(map.navigation_for("local", "total", &json!(1)).is_none());
    }
}
