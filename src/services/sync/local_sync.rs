//! [`SessionSync`] for participants sharing one process.
//!
//! Every participant keeps its own [`LocalSync`] handle; the sessions live in
//! a [`LocalHub`] and are mutated under a lock with the same state machine and
//! scoring rules as the store-backed layer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{SyncError, SyncResult},
    services::sync::{
        MAX_CODE_ATTEMPTS, SessionSync, SyncSettings, generate_code, normalize_code,
        normalize_name,
    },
    state::{
        session::{AnswerOutcome, Player, PlayerId, Session, SessionCode},
        state_machine::{CloseReason, SessionEvent, SessionPhase, SessionStateMachine},
    },
};

/// Sessions hosted in this process, keyed by code.
#[derive(Default)]
pub struct LocalHub {
    sessions: DashMap<SessionCode, Arc<LocalSession>>,
}

impl LocalHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn get(&self, code: &str) -> Option<Arc<LocalSession>> {
        self.sessions.get(code).map(|entry| entry.value().clone())
    }
}

struct LocalSession {
    inner: Mutex<LocalInner>,
    snapshots: watch::Sender<Option<Session>>,
}

struct LocalInner {
    session: Session,
    machine: SessionStateMachine,
}

impl LocalSession {
    fn lock(&self) -> MutexGuard<'_, LocalInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the host tore the session down.
    fn is_closed(&self) -> bool {
        self.snapshots.borrow().is_none()
    }

    /// Run `f` on the session and publish the result to every participant.
    fn mutate<R>(&self, f: impl FnOnce(&mut LocalInner) -> SyncResult<R>) -> SyncResult<R> {
        let mut inner = self.lock();
        let result = f(&mut inner)?;
        self.snapshots.send_replace(Some(inner.session.clone()));
        Ok(result)
    }
}

impl LocalInner {
    /// Plan and apply `event` at once; there is no store work in between.
    fn transition(&mut self, event: SessionEvent) -> SyncResult<SessionPhase> {
        let plan = self.machine.plan(event)?;
        let next = self.machine.apply(plan.id)?;
        self.session.enter_phase(next);
        Ok(next)
    }
}

struct Membership {
    session: Arc<LocalSession>,
    player_id: PlayerId,
    forwarder: JoinHandle<()>,
}

/// One participant of a session living in a [`LocalHub`].
pub struct LocalSync {
    hub: Arc<LocalHub>,
    settings: SyncSettings,
    membership: Mutex<Option<Membership>>,
    snapshots: Arc<watch::Sender<Option<Session>>>,
}

impl LocalSync {
    /// Detached participant of `hub`.
    pub fn new(hub: Arc<LocalHub>, settings: SyncSettings) -> Self {
        let (snapshots, _rx) = watch::channel(None);
        Self {
            hub,
            settings,
            membership: Mutex::new(None),
            snapshots: Arc::new(snapshots),
        }
    }

    fn membership(&self) -> MutexGuard<'_, Option<Membership>> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> SyncResult<(Arc<LocalSession>, PlayerId)> {
        self.membership()
            .as_ref()
            .filter(|membership| !membership.session.is_closed())
            .map(|membership| (membership.session.clone(), membership.player_id.clone()))
            .ok_or(SyncError::NoSession)
    }

    fn host_session(&self, operation: &'static str) -> SyncResult<Arc<LocalSession>> {
        let (session, player_id) = self.current()?;
        if !session.lock().session.is_host(&player_id) {
            return Err(SyncError::NotHost(operation));
        }
        Ok(session)
    }

    fn ensure_detached(&self) -> SyncResult<()> {
        if self.current().is_ok() {
            return Err(SyncError::Precondition(
                "already attached to a session".into(),
            ));
        }
        Ok(())
    }

    /// Become a member and mirror the shared snapshots into our own feed.
    fn attach(&self, session: Arc<LocalSession>, player_id: PlayerId) {
        let mut shared = session.snapshots.subscribe();
        self.snapshots.send_replace(shared.borrow_and_update().clone());

        let own = self.snapshots.clone();
        let forwarder = tokio::spawn(async move {
            while shared.changed().await.is_ok() {
                let snapshot = shared.borrow_and_update().clone();
                let detached = snapshot.is_none();
                own.send_replace(snapshot);
                if detached {
                    break;
                }
            }
        });

        let previous = self.membership().replace(Membership {
            session,
            player_id,
            forwarder,
        });
        if let Some(previous) = previous {
            previous.forwarder.abort();
        }
    }

    fn detach(&self) {
        if let Some(membership) = self.membership().take() {
            membership.forwarder.abort();
        }
        self.snapshots.send_replace(None);
    }

    fn publish_own(&self, session: &LocalSession) {
        self.snapshots
            .send_replace(Some(session.lock().session.clone()));
    }

    fn create(&self, host_name: &str) -> SyncResult<SessionCode> {
        let host_name = normalize_name(host_name)?;
        self.ensure_detached()?;
        if self.settings.questions.is_empty() {
            return Err(SyncError::Precondition("the question bank is empty".into()));
        }

        let host_id = Uuid::new_v4().to_string();
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = generate_code();
            let Entry::Vacant(slot) = self.hub.sessions.entry(code.clone()) else {
                debug!(session = %code, attempt, "session code already taken; regenerating");
                continue;
            };

            let session = Session::new(
                code.clone(),
                Player::new(host_id.clone(), host_name.clone()),
                self.settings.questions.clone(),
            );
            let (snapshots, _rx) = watch::channel(Some(session.clone()));
            let local = Arc::new(LocalSession {
                inner: Mutex::new(LocalInner {
                    machine: SessionStateMachine::new(
                        session.questions.len(),
                        self.settings.limits,
                    ),
                    session,
                }),
                snapshots,
            });
            slot.insert(local.clone());
            self.attach(local, host_id.clone());

            info!(session = %code, player = %host_id, "local session created");
            return Ok(code);
        }

        Err(SyncError::Precondition(
            "no free session code could be generated".into(),
        ))
    }

    fn join(&self, code: &str, player_name: &str) -> SyncResult<()> {
        let code = normalize_code(code)?;
        let player_name = normalize_name(player_name)?;
        self.ensure_detached()?;

        let session = self
            .hub
            .get(&code)
            .ok_or_else(|| SyncError::NotFound(code.clone()))?;
        let player_id = Uuid::new_v4().to_string();
        let max_players = self.settings.limits.max;

        session.mutate(|inner| {
            if inner.session.phase != SessionPhase::Lobby {
                return Err(SyncError::AlreadyStarted(code.clone()));
            }
            if inner.session.players.len() >= max_players {
                return Err(SyncError::SessionFull(code.clone()));
            }
            inner
                .session
                .add_player(Player::new(player_id.clone(), player_name));
            Ok(())
        })?;
        self.attach(session, player_id.clone());

        info!(session = %code, player = %player_id, "joined local session");
        Ok(())
    }

    fn start(&self) -> SyncResult<SessionPhase> {
        let session = self.host_session("start the session")?;
        let next = session.mutate(|inner| {
            let players = inner.session.players.len();
            inner.transition(SessionEvent::StartSession { players })
        })?;
        self.publish_own(&session);
        Ok(next)
    }

    fn submit(&self, answer_index: usize, elapsed_seconds: f64) -> SyncResult<AnswerOutcome> {
        let (session, player_id) = self.current()?;
        let outcome = session.mutate(|inner| {
            Ok(inner
                .session
                .record_answer(&player_id, answer_index, elapsed_seconds)?)
        })?;
        self.publish_own(&session);
        Ok(outcome)
    }

    fn reveal(&self, reason: CloseReason) -> SyncResult<bool> {
        let session = self.host_session("reveal results")?;
        let closed = session.mutate(|inner| {
            if !inner.machine.phase().accepts_answers() {
                return Ok(false);
            }
            inner.transition(SessionEvent::CloseQuestion(reason))?;
            Ok(true)
        })?;
        self.publish_own(&session);
        Ok(closed)
    }

    fn advance(&self) -> SyncResult<SessionPhase> {
        let session = self.host_session("advance the session")?;
        let next = session.mutate(|inner| {
            let phase = inner.machine.phase();
            let event = inner.machine.advance_event().ok_or_else(|| {
                SyncError::Precondition(format!("nothing to advance to from {phase}"))
            })?;
            inner.transition(event)
        })?;
        self.publish_own(&session);
        Ok(next)
    }

    fn leave_session(&self) -> SyncResult<()> {
        let Ok((session, player_id)) = self.current() else {
            self.detach();
            return Ok(());
        };
        let (code, is_host) = {
            let inner = session.lock();
            (inner.session.id.clone(), inner.session.is_host(&player_id))
        };

        if is_host {
            self.hub.sessions.remove(&code);
            session.snapshots.send_replace(None);
            info!(session = %code, "local session torn down by host");
        }
        self.detach();
        Ok(())
    }
}

impl Drop for LocalSync {
    fn drop(&mut self) {
        if let Some(membership) = self.membership().take() {
            membership.forwarder.abort();
        }
    }
}

impl SessionSync for LocalSync {
    fn create_session<'a>(&'a self, host_name: &'a str) -> BoxFuture<'a, SyncResult<SessionCode>> {
        Box::pin(async move { self.create(host_name) })
    }

    fn join_session<'a>(
        &'a self,
        code: &'a str,
        player_name: &'a str,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(async move { self.join(code, player_name) })
    }

    fn start_session(&self) -> BoxFuture<'_, SyncResult<SessionPhase>> {
        Box::pin(async move { self.start() })
    }

    fn submit_answer(
        &self,
        answer_index: usize,
        elapsed_seconds: f64,
    ) -> BoxFuture<'_, SyncResult<AnswerOutcome>> {
        Box::pin(async move { self.submit(answer_index, elapsed_seconds) })
    }

    fn reveal_results(&self, reason: CloseReason) -> BoxFuture<'_, SyncResult<bool>> {
        Box::pin(async move { self.reveal(reason) })
    }

    fn advance_phase(&self) -> BoxFuture<'_, SyncResult<SessionPhase>> {
        Box::pin(async move { self.advance() })
    }

    fn leave(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move { self.leave_session() })
    }

    fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.snapshots.subscribe()
    }

    fn snapshot(&self) -> Option<Session> {
        self.current()
            .ok()
            .map(|(session, _)| session.lock().session.clone())
    }

    fn local_player_id(&self) -> Option<PlayerId> {
        self.current().ok().map(|(_, player_id)| player_id)
    }

    fn is_host(&self) -> bool {
        self.current()
            .is_ok_and(|(session, player_id)| session.lock().session.is_host(&player_id))
    }
}
