#[cfg(feature = "http-store")]
pub mod http;
pub mod memory;

use futures::{future::BoxFuture, stream::BoxStream};

use crate::dao::models::{ChangeEvent, Filter, OrderBy, Patch, Row, Table};
use crate::dao::storage::StorageResult;

pub use self::memory::InMemorySessionStore;

/// Abstraction over the shared store every participant reads from and writes to.
///
/// Subscriptions deliver at-least-once change events for rows matching the
/// filter; consumers must tolerate duplicates. A subscriber that fell behind
/// receives a [`ChangeKind::Resync`](crate::dao::models::ChangeKind::Resync)
/// event in place of the changes it missed.
pub trait SessionStore: Send + Sync {
    fn insert(&self, table: Table, row: Row) -> BoxFuture<'static, StorageResult<()>>;
    fn update(
        &self,
        table: Table,
        filter: Filter,
        patch: Patch,
    ) -> BoxFuture<'static, StorageResult<usize>>;
    fn select(
        &self,
        table: Table,
        filter: Filter,
        order_by: Option<OrderBy>,
    ) -> BoxFuture<'static, StorageResult<Vec<Row>>>;
    fn delete(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<usize>>;
    fn subscribe(
        &self,
        table: Table,
        filter: Filter,
    ) -> BoxFuture<'static, StorageResult<BoxStream<'static, ChangeEvent>>>;
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
