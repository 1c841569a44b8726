#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, future::BoxFuture, stream::BoxStream};
use quiz_arena::{
    config::default_questions,
    dao::{
        models::{ChangeEvent, Filter, OrderBy, Patch, Row, Table},
        session_store::{InMemorySessionStore, SessionStore},
        storage::{StorageError, StorageResult},
    },
    services::sync::{SessionSync, SyncBackend, SyncSettings},
    state::{
        session::Session,
        state_machine::{PlayerLimits, SessionPhase},
    },
};
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn settings() -> SyncSettings {
    SyncSettings {
        limits: PlayerLimits::default(),
        questions: default_questions(),
        transition_timeout: Some(Duration::from_secs(5)),
    }
}

/// Host plus `guests` joined players on `backend`.
pub async fn lobby(
    backend: &SyncBackend,
    guests: usize,
) -> (Arc<dyn SessionSync>, Vec<Arc<dyn SessionSync>>, String) {
    let host = backend.participant(settings());
    let code = host.create_session("Host").await.unwrap();
    let mut joined = Vec::new();
    for n in 0..guests {
        let guest = backend.participant(settings());
        guest
            .join_session(&code, &format!("Guest {n}"))
            .await
            .unwrap();
        joined.push(guest);
    }
    for guest in &joined {
        let guest_id = guest.local_player_id().unwrap();
        wait_until(&host, |session| session.players.contains_key(&guest_id)).await;
    }
    (host, joined, code)
}

/// Wait until the snapshot of `sync` satisfies `predicate`.
pub async fn wait_until(sync: &Arc<dyn SessionSync>, predicate: impl Fn(&Session) -> bool) {
    let mut feed = sync.subscribe();
    tokio::time::timeout(
        WAIT,
        feed.wait_for(|snapshot| snapshot.as_ref().is_some_and(&predicate)),
    )
    .await
    .expect("timed out waiting for the session")
    .expect("snapshot feed closed");
}

/// Wait until `sync` observes `phase`.
pub async fn wait_for_phase(sync: &Arc<dyn SessionSync>, phase: SessionPhase) {
    wait_until(sync, |session| session.phase == phase).await;
}

/// Wait until `sync` is detached.
pub async fn wait_detached(sync: &Arc<dyn SessionSync>) {
    let mut feed = sync.subscribe();
    tokio::time::timeout(WAIT, feed.wait_for(Option::is_none))
        .await
        .expect("timed out waiting for teardown")
        .expect("snapshot feed closed");
}

/// Store whose writes and change feeds can be made to misbehave.
#[derive(Clone)]
pub struct FlakyStore {
    inner: InMemorySessionStore,
    failing: Arc<AtomicBool>,
    refusing_subscriptions: Arc<AtomicBool>,
    held: Arc<watch::Sender<bool>>,
    cut: Arc<watch::Sender<u64>>,
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self {
            inner: InMemorySessionStore::new(),
            failing: Arc::default(),
            refusing_subscriptions: Arc::default(),
            held: Arc::new(watch::channel(false).0),
            cut: Arc::new(watch::channel(0).0),
        }
    }
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store every write eventually lands in.
    pub fn inner(&self) -> &InMemorySessionStore {
        &self.inner
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make new subscriptions fail.
    pub fn set_refusing_subscriptions(&self, refusing: bool) {
        self.refusing_subscriptions.store(refusing, Ordering::SeqCst);
    }

    /// Hold change events back from every subscriber until released.
    pub fn hold_feeds(&self, held: bool) {
        self.held.send_replace(held);
    }

    /// End every open change feed, as a dropped connection would.
    pub fn cut_feeds(&self) {
        self.cut.send_modify(|generation| *generation += 1);
    }

    fn down<T>(&self, table: Table) -> Option<BoxFuture<'static, StorageResult<T>>>
    where
        T: Send + 'static,
    {
        if !self.failing.load(Ordering::SeqCst) {
            return None;
        }
        Some(Box::pin(async move {
            Err(injected(format!("writes to `{table}` are failing")))
        }))
    }
}

fn injected(message: String) -> StorageError {
    StorageError::unavailable(message, std::io::Error::other("injected failure"))
}

impl SessionStore for FlakyStore {
    fn insert(&self, table: Table, row: Row) -> BoxFuture<'static, StorageResult<()>> {
        self.down(table).unwrap_or_else(|| self.inner.insert(table, row))
    }

    fn update(
        &self,
        table: Table,
        filter: Filter,
        patch: Patch,
    ) -> BoxFuture<'static, StorageResult<usize>> {
        self.down(table)
            .unwrap_or_else(|| self.inner.update(table, filter, patch))
    }

    fn select(
        &self,
        table: Table,
        filter: Filter,
        order_by: Option<OrderBy>,
    ) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        self.inner.select(table, filter, order_by)
    }

    fn delete(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<usize>> {
        self.down(table).unwrap_or_else(|| self.inner.delete(table, filter))
    }

    fn subscribe(
        &self,
        table: Table,
        filter: Filter,
    ) -> BoxFuture<'static, StorageResult<BoxStream<'static, ChangeEvent>>> {
        if self.refusing_subscriptions.load(Ordering::SeqCst) {
            return Box::pin(async move {
                Err(injected(format!("subscriptions to `{table}` are failing")))
            });
        }

        let changes = self.inner.subscribe(table, filter);
        let held = self.held.subscribe();
        let mut cut = self.cut.subscribe();
        Box::pin(async move {
            let changes = changes.await?;
            let cut = async move {
                let _ = cut.changed().await;
            };
            let stream = changes
                .then(move |change| {
                    let mut held = held.clone();
                    async move {
                        loop {
                            let waiting = *held.borrow();
                            if !waiting || held.changed().await.is_err() {
                                break;
                            }
                        }
                        change
                    }
                })
                .take_until(cut);
            Ok(stream.boxed())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        self.inner.health_check()
    }
}
