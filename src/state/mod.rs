pub mod session;
pub mod state_machine;

use std::{
    future::Future,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::warn;

use crate::{
    dao::{
        models::{GameRecord, PlayerRecord},
        session_store::InMemorySessionStore,
    },
    error::{SyncError, SyncResult},
    services::sync::merge,
    state::{
        session::{PlayerId, Question, Session},
        state_machine::{PlayerLimits, SessionEvent, SessionPhase, SessionStateMachine},
    },
};

pub use self::state_machine::{AbortError, ApplyError, Plan, PlanError, PlanId, Snapshot};

pub type SharedState = Arc<ServerState>;
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_secs(5);

/// State of the store server: the tables every participant shares.
pub struct ServerState {
    store: InMemorySessionStore,
}

impl ServerState {
    /// Construct a new [`ServerState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new() -> SharedState {
        Self::with_store(InMemorySessionStore::new())
    }

    /// Serve an existing store.
    pub fn with_store(store: InMemorySessionStore) -> SharedState {
        Arc::new(Self { store })
    }

    /// Store backing the routes.
    pub fn store(&self) -> &InMemorySessionStore {
        &self.store
    }
}

/// Last-known rows of the session a client is attached to.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Id of the local participant.
    pub player_id: PlayerId,
    /// Session record.
    pub game: GameRecord,
    /// Player rows in join order.
    pub players: Vec<PlayerRecord>,
    /// Question bank.
    pub questions: Vec<Question>,
}

impl Attachment {
    /// Session code.
    pub fn code(&self) -> &str {
        &self.game.id
    }

    /// Aggregate rebuilt from the rows.
    pub fn session(&self) -> Session {
        merge::reconcile(&self.game, &self.players, &self.questions)
    }

    /// Row of the local participant.
    pub fn own_player_mut(&mut self) -> Option<&mut PlayerRecord> {
        self.players
            .iter_mut()
            .find(|player| player.id == self.player_id)
    }
}

/// Client-side state of one participant of a store-backed session.
///
/// Holds the rows last read from the store, the state machine the host
/// authors transitions with, and the snapshot feed handed to the UI.
pub struct ClientState {
    attachment: RwLock<Option<Attachment>>,
    machine: RwLock<SessionStateMachine>,
    limits: PlayerLimits,
    snapshots: watch::Sender<Option<Session>>,
    transition_gate: Mutex<()>,
    answer_gate: Mutex<()>,
    transition_timeout: Option<Duration>,
}

impl ClientState {
    /// Detached client enforcing `limits` when starting.
    pub fn new(limits: PlayerLimits, transition_timeout: Option<Duration>) -> Self {
        let (snapshots, _rx) = watch::channel(None);
        Self {
            attachment: RwLock::new(None),
            machine: RwLock::new(SessionStateMachine::new(0, limits)),
            limits,
            snapshots,
            transition_gate: Mutex::new(()),
            answer_gate: Mutex::new(()),
            transition_timeout,
        }
    }

    fn attachment_read(&self) -> RwLockReadGuard<'_, Option<Attachment>> {
        self.attachment.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn attachment_write(&self) -> RwLockWriteGuard<'_, Option<Attachment>> {
        self.attachment.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn machine_read(&self) -> RwLockReadGuard<'_, SessionStateMachine> {
        self.machine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn machine_write(&self) -> RwLockWriteGuard<'_, SessionStateMachine> {
        self.machine.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach to a session and publish its first snapshot.
    pub fn attach(&self, attachment: Attachment) {
        let mut guard = self.attachment_write();
        let mut machine = SessionStateMachine::new(attachment.questions.len(), self.limits);
        machine.observe(merge::phase_of(&attachment.game));
        *self.machine_write() = machine;
        self.snapshots.send_replace(Some(attachment.session()));
        *guard = Some(attachment);
    }

    /// Drop the session and publish `None`.
    pub fn detach(&self) -> Option<Attachment> {
        let mut guard = self.attachment_write();
        let previous = guard.take();
        *self.machine_write() = SessionStateMachine::new(0, self.limits);
        self.snapshots.send_replace(None);
        previous
    }

    /// Whether a session is attached.
    pub fn is_attached(&self) -> bool {
        self.attachment_read().is_some()
    }

    /// Read the attachment, failing with [`SyncError::NoSession`] when detached.
    pub fn read<R>(&self, f: impl FnOnce(&Attachment) -> R) -> SyncResult<R> {
        self.attachment_read().as_ref().map(f).ok_or(SyncError::NoSession)
    }

    /// Mutate the attachment, then take in its phase and publish the new snapshot.
    ///
    /// Returns `false` when no session is attached.
    pub fn update(&self, f: impl FnOnce(&mut Attachment)) -> bool {
        let mut guard = self.attachment_write();
        let Some(attachment) = guard.as_mut() else {
            return false;
        };
        f(attachment);
        self.machine_write()
            .observe(merge::phase_of(&attachment.game));
        self.snapshots.send_replace(Some(attachment.session()));
        true
    }

    /// Subscribe to reconciled snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.snapshots.subscribe()
    }

    /// Latest reconciled snapshot.
    pub fn snapshot(&self) -> Option<Session> {
        self.snapshots.borrow().clone()
    }

    /// Id of the local participant.
    pub fn player_id(&self) -> Option<PlayerId> {
        self.attachment_read()
            .as_ref()
            .map(|attachment| attachment.player_id.clone())
    }

    /// Whether the local participant hosts the attached session.
    pub fn is_host(&self) -> bool {
        self.attachment_read().as_ref().is_some_and(|attachment| {
            merge::host_of(&attachment.game, &attachment.players) == attachment.player_id
        })
    }

    /// Player bounds enforced when starting.
    pub fn limits(&self) -> PlayerLimits {
        self.limits
    }

    /// Serialises answer submissions of this participant.
    pub fn answer_gate(&self) -> &Mutex<()> {
        &self.answer_gate
    }

    /// Current phase of the state machine.
    pub fn phase(&self) -> SessionPhase {
        self.machine_read().phase()
    }

    /// Event leaving the current results phase, if any.
    pub fn advance_event(&self) -> Option<SessionEvent> {
        self.machine_read().advance_event()
    }

    pub fn machine_snapshot(&self) -> Snapshot {
        self.machine_read().snapshot()
    }

    fn plan_transition(&self, event: SessionEvent) -> Result<Plan, PlanError> {
        self.machine_write().plan(event)
    }

    fn apply_planned_transition(&self, plan_id: PlanId) -> Result<SessionPhase, ApplyError> {
        self.machine_write().apply(plan_id)
    }

    fn abort_transition(&self, plan_id: PlanId) -> Result<(), AbortError> {
        self.machine_write().abort(plan_id)
    }

    /// Plan `event`, run the store `work`, then apply the plan on success or abort it.
    pub async fn run_transition<F, Fut, T>(
        &self,
        event: SessionEvent,
        work: F,
    ) -> SyncResult<(T, SessionPhase)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let gate = self.transition_gate.lock().await;
        let Plan { id: plan_id, .. } = self.plan_transition(event)?;

        let work_future = work();
        let outcome = if let Some(limit) = self.transition_timeout {
            match timeout(limit, work_future).await {
                Ok(result) => result,
                Err(_) => {
                    if let Err(abort_err) = self.abort_transition(plan_id) {
                        warn!(
                            event = ?event,
                            plan_id = %plan_id,
                            error = ?abort_err,
                            "failed to abort transition after timeout"
                        );
                    }
                    drop(gate);
                    return Err(SyncError::Timeout);
                }
            }
        } else {
            work_future.await
        };

        match outcome {
            Ok(value) => {
                let next = self.apply_planned_transition(plan_id)?;
                drop(gate);
                Ok((value, next))
            }
            Err(err) => {
                if let Err(abort_err) = self.abort_transition(plan_id) {
                    warn!(
                        event = ?event,
                        plan_id = %plan_id,
                        error = ?abort_err,
                        "failed to abort transition after work error"
                    );
                }
                drop(gate);
                Err(err)
            }
        }
    }
}
