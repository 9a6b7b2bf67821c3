//! In-process [`RemoteService`].
//!
//! Backs tests and offline demos of the remote adapter: rows live in
//! per-table vectors, matching subscribers receive change notifications,
//! and the whole service can be switched offline to simulate outages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::remote::{RemoteService, Row, RowFilter};
use super::{ChangeKind, ChangeNotification, Table};
use crate::error::{Error, Result};

fn key_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::ProjectShares => &["project_id", "user_id"],
        Table::TaskTags => &["task_id", "tag_id"],
        _ => &["id"],
    }
}

fn same_key(table: Table, left: &Row, right: &Row) -> bool {
    key_columns(table)
        .iter()
        .all(|column| left.get(*column) == right.get(*column))
}

struct Subscriber {
    table: Table,
    filter: RowFilter,
    sender: mpsc::UnboundedSender<ChangeNotification>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<Table, Vec<Row>>,
    subscribers: Vec<Subscriber>,
}

impl MemoryState {
    fn notify(&mut self, table: Table, kind: ChangeKind, row: &Row) {
        self.subscribers.retain(|subscriber| {
            if subscriber.table != table || !subscriber.filter.matches(row) {
                return !subscriber.sender.is_closed();
            }
            subscriber
                .sender
                .send(ChangeNotification {
                    table,
                    kind,
                    row: Some(Value::Object(row.clone())),
                })
                .is_ok()
        });
    }
}

#[derive(Default)]
pub struct MemoryService {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`Error::Transient`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Live subscriptions, after pruning closed ones.
    pub fn subscriber_count(&self) -> usize {
        match self.state.lock() {
            Ok(mut state) => {
                state
                    .subscribers
                    .retain(|subscriber| !subscriber.sender.is_closed());
                state.subscribers.len()
            }
            Err(_) => 0,
        }
    }

    /// Raw rows of a table.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.state
            .lock()
            .map(|state| state.tables.get(&table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.is_offline() {
            return Err(Error::Transient("remote service unreachable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| Error::Transient("remote service state poisoned".to_string()))
    }
}

#[async_trait]
impl RemoteService for MemoryService {
    async fn select(&self, table: Table, filter: &RowFilter) -> Result<Vec<Row>> {
        let state = self.state()?;
        Ok(state
            .tables
            .get(&table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: Table, mut row: Row) -> Result<Row> {
        let mut state = self.state()?;
        if table.has_id() {
            let missing = row
                .get("id")
                .and_then(Value::as_str)
                .map_or(true, str::is_empty);
            if missing {
                row.insert("id".to_string(), Value::from(Uuid::new_v4().to_string()));
            }
        }
        let rows = state.tables.entry(table).or_default();
        if rows.iter().any(|existing| same_key(table, existing, &row)) {
            return Err(Error::Validation(format!(
                "duplicate key in {}",
                table.as_str()
            )));
        }
        rows.push(row.clone());
        state.notify(table, ChangeKind::Insert, &row);
        Ok(row)
    }

    async fn upsert(&self, table: Table, row: Row) -> Result<Row> {
        let mut state = self.state()?;
        let rows = state.tables.entry(table).or_default();
        let kind = match rows.iter_mut().find(|existing| same_key(table, existing, &row)) {
            Some(existing) => {
                *existing = row.clone();
                ChangeKind::Update
            }
            None => {
                rows.push(row.clone());
                ChangeKind::Insert
            }
        };
        state.notify(table, kind, &row);
        Ok(row)
    }

    async fn update(&self, table: Table, filter: &RowFilter, patch: Row) -> Result<Vec<Row>> {
        let mut state = self.state()?;
        let mut updated = Vec::new();
        if let Some(rows) = state.tables.get_mut(&table) {
            for row in rows.iter_mut().filter(|row| filter.matches(row)) {
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                updated.push(row.clone());
            }
        }
        for row in &updated {
            state.notify(table, ChangeKind::Update, row);
        }
        Ok(updated)
    }

    async fn delete(&self, table: Table, filter: &RowFilter) -> Result<usize> {
        let mut state = self.state()?;
        let mut removed = Vec::new();
        if let Some(rows) = state.tables.get_mut(&table) {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows.drain(..) {
                if filter.matches(&row) {
                    removed.push(row);
                } else {
                    kept.push(row);
                }
            }
            *rows = kept;
        }
        for row in &removed {
            state.notify(table, ChangeKind::Delete, row);
        }
        Ok(removed.len())
    }

    async fn subscribe(
        &self,
        table: Table,
        filter: RowFilter,
    ) -> Result<mpsc::UnboundedReceiver<ChangeNotification>> {
        let mut state = self.state()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            table,
            filter,
            sender,
        });
        Ok(receiver)
    }
}
