use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};

use crate::filters::{FilterOperator, TableFilter};
use crate::sql_generator::TableRef;
use crate::value::coerce_to_string;

pub const DEFAULT_BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ViewCommand {
    ApplyChanges,
    DiscardChanges,
    RefreshData,
    InsertRow,
    SetFilter(Vec<TableFilter>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavigationRequest {
    pub connection_id: String,
    pub table: TableRef,
    pub filter_column: String,
    pub filter_value: Value,
}

impl NavigationRequest {
    #[must_use]
    pub fn as_filter(&self, id: u64) -> TableFilter {
        if self.filter_value.is_null() {
            return TableFilter::without_value(id, &self.filter_column, FilterOperator::IsNull);
        }
        TableFilter::new(
            id,
            &self.filter_column,
            FilterOperator::Equals,
            coerce_to_string(&self.filter_value),
        )
    }
}

#[derive(Debug, Clone)]
enum BusMessage {
    View {
        table: TableRef,
        command: ViewCommand,
    },
    Navigate(NavigationRequest),
}

#[derive(Debug, Clone)]
pub struct ConnectionBus {
    connection_id: String,
    sender: broadcast::Sender<BusMessage>,
}

impl ConnectionBus {
    #[must_use]
    pub fn new(connection_id: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            connection_id: connection_id.into(),
            sender,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn send(&self, table: &TableRef, command: ViewCommand) -> usize {
        self.sender
            .send(BusMessage::View {
                table: table.clone(),
                command,
            })
            .unwrap_or(0)
    }

    pub fn navigate(&self, request: NavigationRequest) -> usize {
        self.sender
            .send(BusMessage::Navigate(request))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe_table(&self, table: TableRef) -> TableCommands {
        TableCommands {
            table,
            receiver: self.sender.subscribe(),
        }
    }

    #[must_use]
    pub fn subscribe_navigation(&self) -> NavigationRequests {
        NavigationRequests {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Debug)]
pub struct TableCommands {
    table: TableRef,
    receiver: broadcast::Receiver<BusMessage>,
}

impl TableCommands {
    #[must_use]
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub async fn recv(&mut self) -> Option<ViewCommand> {
        loop {
            match self.receiver.recv().await {
                Ok(BusMessage::View { table, command }) if table == self.table => {
                    return Some(command)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, table = %self.table, "view command subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ViewCommand> {
        loop {
            match self.receiver.try_recv() {
                Ok(BusMessage::View { table, command }) if table == self.table => {
                    return Some(command)
                }
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug)]
pub struct NavigationRequests {
    receiver: broadcast::Receiver<BusMessage>,
}

impl NavigationRequests {
    pub async fn recv(&mut self) -> Option<NavigationRequest> {
        loop {
            match self.receiver.recv().await {
                Ok(BusMessage::Navigate(request)) => return Some(request),
                Ok(BusMessage::View { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "navigation subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<NavigationRequest> {
        loop {
            match self.receiver.try_recv() {
                Ok(BusMessage::Navigate(request)) => return Some(request),
                Ok(BusMessage::View { .. }) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug)]
pub struct MessageBus {
    capacity: usize,
    channels: HashMap<String, ConnectionBus>,
}

impl MessageBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: HashMap::new(),
        }
    }

    pub fn connection(&mut self, connection_id: &str) -> ConnectionBus {
        let capacity = self.capacity;
        self.channels
            .entry(connection_id.to_string())
            .or_insert_with(|| ConnectionBus::new(connection_id, capacity))
            .clone()
    }

    pub fn close(&mut self, connection_id: &str) -> bool {
        self.channels.remove(connection_id).is_some()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
