pub mod backend;
pub mod committer;
pub mod fetch_guard;
pub mod filters;
pub mod foreign_keys;
pub mod messages;
pub mod pagination;
pub mod query_log;
pub mod settings;
pub mod sql_generator;
pub mod staged_changes;
pub mod table_view;
pub mod value;
pub mod view_registry;
