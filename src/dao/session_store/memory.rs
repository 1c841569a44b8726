//! Process-local session store backed by concurrent maps and a broadcast feed.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{future::BoxFuture, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tracing::{debug, warn};

use crate::dao::{
    models::{ChangeEvent, ChangeKind, Filter, OrderBy, Patch, Row, Table, row_id},
    session_store::SessionStore,
    storage::{StorageError, StorageResult},
};

const CHANGE_FEED_CAPACITY: usize = 1024;

/// In-memory [`SessionStore`] shared by cloning.
///
/// Writes to a table and the matching change events are serialised under the
/// table's lock, so subscribers observe changes in write order.
#[derive(Clone)]
pub struct InMemorySessionStore {
    inner: Arc<Inner>,
}

struct Inner {
    tables: DashMap<Table, Vec<Row>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _receiver) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tables: DashMap::new(),
                changes,
            }),
        }
    }

    fn emit(&self, table: Table, kind: ChangeKind, row: Row) {
        // No subscriber is not an error.
        let _ = self.inner.changes.send(ChangeEvent { table, kind, row });
    }

    fn insert_row(&self, table: Table, row: Row) -> StorageResult<()> {
        let Some(id) = row_id(&row).map(str::to_owned) else {
            return Err(StorageError::Rejected(format!(
                "rows inserted into `{table}` need a string `id` column"
            )));
        };
        if !row.is_object() {
            return Err(StorageError::Rejected(format!(
                "rows inserted into `{table}` must be objects"
            )));
        }

        let mut rows = self.inner.tables.entry(table).or_default();
        if rows.iter().any(|existing| row_id(existing) == Some(id.as_str())) {
            return Err(StorageError::Conflict { table, id });
        }
        rows.push(row.clone());
        self.emit(table, ChangeKind::Insert, row);
        debug!(%table, %id, "row inserted");
        Ok(())
    }

    fn update_rows(&self, table: Table, filter: &Filter, patch: &Patch) -> usize {
        let Some(mut rows) = self.inner.tables.get_mut(&table) else {
            return 0;
        };

        let mut affected = 0;
        for row in rows.iter_mut().filter(|row| filter.matches(row)) {
            if let Some(columns) = row.as_object_mut() {
                for (column, value) in patch.iter().filter(|(column, _)| *column != "id") {
                    columns.insert(column.clone(), value.clone());
                }
            }
            affected += 1;
            self.emit(table, ChangeKind::Update, row.clone());
        }
        affected
    }

    fn delete_rows(&self, table: Table, filter: &Filter) -> usize {
        let Some(mut rows) = self.inner.tables.get_mut(&table) else {
            return 0;
        };

        let (removed, kept): (Vec<Row>, Vec<Row>) =
            rows.drain(..).partition(|row| filter.matches(row));
        *rows = kept;
        for row in &removed {
            self.emit(table, ChangeKind::Delete, row.clone());
        }
        removed.len()
    }

    fn select_rows(&self, table: Table, filter: &Filter, order_by: Option<&OrderBy>) -> Vec<Row> {
        let mut selected: Vec<Row> = self
            .inner
            .tables
            .get(&table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = order_by {
            selected.sort_by(|left, right| order.compare(left, right));
        }
        selected
    }
}

impl SessionStore for InMemorySessionStore {
    fn insert(&self, table: Table, row: Row) -> BoxFuture<'static, StorageResult<()>> {
        let result = self.insert_row(table, row);
        Box::pin(async move { result })
    }

    fn update(
        &self,
        table: Table,
        filter: Filter,
        patch: Patch,
    ) -> BoxFuture<'static, StorageResult<usize>> {
        let affected = self.update_rows(table, &filter, &patch);
        Box::pin(async move { Ok(affected) })
    }

    fn select(
        &self,
        table: Table,
        filter: Filter,
        order_by: Option<OrderBy>,
    ) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        let rows = self.select_rows(table, &filter, order_by.as_ref());
        Box::pin(async move { Ok(rows) })
    }

    fn delete(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<usize>> {
        let removed = self.delete_rows(table, &filter);
        Box::pin(async move { Ok(removed) })
    }

    fn subscribe(
        &self,
        table: Table,
        filter: Filter,
    ) -> BoxFuture<'static, StorageResult<BoxStream<'static, ChangeEvent>>> {
        // Register eagerly so no change between the call and the first poll is lost.
        let receiver = self.inner.changes.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(change) if change.table == table && filter.matches(&change.row) => Some(change),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(%table, skipped, "change subscriber lagged; asking for a resync");
                Some(ChangeEvent {
                    table,
                    kind: ChangeKind::Resync,
                    row: Row::Null,
                })
            }
        });
        let stream: BoxStream<'static, ChangeEvent> = Box::pin(stream);
        Box::pin(async move { Ok(stream) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
