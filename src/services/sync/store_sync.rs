//! [`SessionSync`] backed by a [`SessionStore`] shared with every participant.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::{StreamExt, future::BoxFuture, stream::BoxStream};
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{ChangeEvent, ChangeKind, GameRecord, PlayerRecord},
        repository::SessionRepository,
        session_store::SessionStore,
    },
    error::{SyncError, SyncResult},
    services::sync::{
        MAX_CODE_ATTEMPTS, SessionSync, SyncSettings, generate_code, merge, normalize_code,
        normalize_name,
    },
    state::{
        Attachment, ClientState,
        session::{AnswerOutcome, PlayerId, Session, SessionCode, SessionError},
        state_machine::{CloseReason, SessionEvent, SessionPhase},
    },
};

/// Participant talking to the other participants through the session store.
///
/// Writes touch only the rows they affect. A background listener follows the
/// session record and the player rows and rebuilds the snapshot on every
/// change.
pub struct StoreSync {
    repository: SessionRepository,
    settings: SyncSettings,
    state: Arc<ClientState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Pause before opening a change feed that ended.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(250);

struct ChangeFeeds {
    game: BoxStream<'static, ChangeEvent>,
    players: BoxStream<'static, ChangeEvent>,
}

async fn open_feeds(repository: &SessionRepository, code: &str) -> SyncResult<ChangeFeeds> {
    Ok(ChangeFeeds {
        game: repository.watch_game(code).await?,
        players: repository.watch_players(code).await?,
    })
}

impl StoreSync {
    /// Detached participant using `store`.
    pub fn new(store: Arc<dyn SessionStore>, settings: SyncSettings) -> Self {
        let state = Arc::new(ClientState::new(
            settings.limits,
            settings.transition_timeout,
        ));
        Self {
            repository: SessionRepository::new(store),
            settings,
            state,
            listener: Mutex::new(None),
        }
    }

    fn ensure_detached(&self) -> SyncResult<()> {
        if self.state.is_attached() {
            return Err(SyncError::Precondition(
                "already attached to a session".into(),
            ));
        }
        Ok(())
    }

    fn require_host(&self, operation: &'static str) -> SyncResult<SessionCode> {
        let code = self.state.read(|attachment| attachment.code().to_string())?;
        if !self.state.is_host() {
            return Err(SyncError::NotHost(operation));
        }
        Ok(code)
    }

    /// Subscribe, read the rows, attach, and start following changes.
    ///
    /// Feeds are opened before the initial read so no change falls in between.
    async fn attach(&self, player_id: PlayerId, code: &str) -> SyncResult<()> {
        let feeds = open_feeds(&self.repository, code).await?;
        let game = self
            .repository
            .find_game(code)
            .await?
            .ok_or_else(|| SyncError::NotFound(code.to_string()))?;
        let players = self.repository.list_players(code).await?;
        let questions: Vec<_> = self
            .repository
            .list_questions(code)
            .await?
            .into_iter()
            .map(merge::question_from)
            .collect();
        if questions.is_empty() {
            return Err(SyncError::Precondition(format!(
                "session `{code}` has no questions"
            )));
        }

        self.state.attach(Attachment {
            player_id,
            game,
            players,
            questions,
        });

        let handle = tokio::spawn(follow_changes(
            self.state.clone(),
            self.repository.clone(),
            code.to_string(),
            feeds,
        ));
        if let Some(previous) = self.listener_slot().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn listener_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_listener(&self) {
        if let Some(handle) = self.listener_slot().take() {
            handle.abort();
        }
    }

    /// Remove a half-created session; failures only get logged.
    async fn discard_session(&self, code: &str) {
        if let Err(err) = self.repository.delete_session(code).await {
            warn!(session = %code, error = %err, "failed to clean up partially created session");
        }
    }

    async fn discard_player(&self, code: &str, player_id: &str) {
        if let Err(err) = self.repository.delete_player(player_id).await {
            warn!(
                session = %code,
                player = %player_id,
                error = %err,
                "failed to clean up player row after a failed join"
            );
        }
    }

    async fn insert_fresh_game(&self, host_id: &str, host_name: &str) -> SyncResult<SessionCode> {
        let mut last_conflict = None;
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = generate_code();
            let game = GameRecord::new(code.clone(), host_id.to_string(), host_name.to_string());
            match self.repository.insert_game(&game).await {
                Ok(()) => return Ok(code),
                Err(err) if err.is_conflict() => {
                    debug!(session = %code, attempt, "session code already taken; regenerating");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }

        match last_conflict {
            Some(err) => Err(SyncError::Unavailable(err)),
            None => Err(SyncError::Precondition("no session code could be generated".into())),
        }
    }

    async fn create(&self, host_name: &str) -> SyncResult<SessionCode> {
        let host_name = normalize_name(host_name)?;
        self.ensure_detached()?;
        if self.settings.questions.is_empty() {
            return Err(SyncError::Precondition("the question bank is empty".into()));
        }

        let host_id = Uuid::new_v4().to_string();
        let code = self.insert_fresh_game(&host_id, &host_name).await?;

        let populate = async {
            let host = PlayerRecord::new(host_id.clone(), code.clone(), host_name.clone());
            self.repository.insert_player(&host).await?;
            let questions = merge::question_records(&code, &self.settings.questions);
            self.repository.insert_questions(&questions).await?;
            self.attach(host_id.clone(), &code).await
        };
        if let Err(err) = populate.await {
            self.discard_session(&code).await;
            return Err(err);
        }

        info!(session = %code, player = %host_id, "session created");
        Ok(code)
    }

    async fn join(&self, code: &str, player_name: &str) -> SyncResult<()> {
        let code = normalize_code(code)?;
        let player_name = normalize_name(player_name)?;
        self.ensure_detached()?;

        let game = self
            .repository
            .find_game(&code)
            .await?
            .ok_or_else(|| SyncError::NotFound(code.clone()))?;
        if game.is_started {
            return Err(SyncError::AlreadyStarted(code));
        }
        let players = self.repository.list_players(&code).await?;
        if players.len() >= self.settings.limits.max {
            return Err(SyncError::SessionFull(code));
        }

        let player_id = Uuid::new_v4().to_string();
        let player = PlayerRecord::new(player_id.clone(), code.clone(), player_name);
        self.repository.insert_player(&player).await?;

        let admitted = async {
            // The host may have started while the row was being written.
            match self.repository.find_game(&code).await? {
                None => return Err(SyncError::NotFound(code.clone())),
                Some(game) if game.is_started => {
                    return Err(SyncError::AlreadyStarted(code.clone()));
                }
                Some(_) => {}
            }
            self.attach(player_id.clone(), &code).await
        };
        if let Err(err) = admitted.await {
            self.discard_player(&code, &player_id).await;
            return Err(err);
        }

        info!(session = %code, player = %player_id, "joined session");
        Ok(())
    }

    async fn start(&self) -> SyncResult<SessionPhase> {
        let code = self.require_host("start the session")?;
        let players = self.repository.list_players(&code).await?;
        let count = players.len();
        self.state.update(|attachment| attachment.players = players);

        let (patch, next) = self
            .state
            .run_transition(SessionEvent::StartSession { players: count }, || async {
                Ok(self.repository.mark_started(&code).await?)
            })
            .await?;
        self.apply_game_patch(patch);

        info!(session = %code, players = count, "session started");
        Ok(next)
    }

    async fn submit(&self, answer_index: usize, elapsed_seconds: f64) -> SyncResult<AnswerOutcome> {
        let session = self.state.snapshot().ok_or(SyncError::NoSession)?;
        let player_id = self.state.player_id().ok_or(SyncError::NoSession)?;
        let Some(answer) = session.check_answer(&player_id, answer_index, elapsed_seconds)? else {
            return Ok(AnswerOutcome::AlreadyAnswered);
        };
        let question = session.current_question_index;

        let _gate = self.state.answer_gate().lock().await;

        // The snapshot may lag behind the host: the stored record decides
        // whether the question is still open.
        let game = self
            .repository
            .find_game(&session.id)
            .await?
            .ok_or_else(|| SyncError::NotFound(session.id.clone()))?;
        let live = merge::phase_of(&game);
        if live != (SessionPhase::Question { index: question }) {
            if let Ok(row) = serde_json::to_value(&game) {
                merge_game_row(&self.state, &session.id, &row);
            }
            return Err(SessionError::NotAcceptingAnswers(live).into());
        }

        // The row is the source of truth for duplicate submissions.
        let row = self
            .repository
            .find_player(&player_id)
            .await?
            .ok_or_else(|| SyncError::Precondition("player row is gone".into()))?;
        if merge::has_answered(&row, question) {
            self.replace_own_row(row);
            return Ok(AnswerOutcome::AlreadyAnswered);
        }

        let score = row.score.saturating_add(answer.points);
        self.repository
            .record_answer(&player_id, question, answer.index, answer.latency_seconds, score)
            .await?;

        self.replace_own_row(PlayerRecord {
            current_answer: Some(answer.index),
            time_to_answer: Some(answer.latency_seconds),
            answered_question: Some(question),
            score,
            ..row
        });
        debug!(
            session = %session.id,
            player = %player_id,
            question,
            points = answer.points,
            score,
            "answer recorded"
        );
        Ok(AnswerOutcome::Recorded {
            points: answer.points,
            score,
        })
    }

    async fn reveal(&self, reason: CloseReason) -> SyncResult<bool> {
        let code = self.require_host("reveal results")?;
        if !self.state.phase().accepts_answers() {
            return Ok(false);
        }

        let result = self
            .state
            .run_transition(SessionEvent::CloseQuestion(reason), || async {
                Ok(self.repository.show_results(&code).await?)
            })
            .await;

        match result {
            Ok((patch, next)) => {
                self.apply_game_patch(patch);
                info!(session = %code, phase = %next, ?reason, "question closed");
                Ok(true)
            }
            // Another caller closed the question first.
            Err(SyncError::Precondition(_)) if !self.state.phase().accepts_answers() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn advance(&self) -> SyncResult<SessionPhase> {
        let code = self.require_host("advance the session")?;
        let phase = self.state.phase();
        let event = self.state.advance_event().ok_or_else(|| {
            SyncError::Precondition(format!("nothing to advance to from {phase}"))
        })?;

        let (patch, next) = self
            .state
            .run_transition(event, || async {
                match (event, phase) {
                    (SessionEvent::NextQuestion, SessionPhase::Results { index }) => {
                        self.repository.clear_answers(&code).await?;
                        Ok(self.repository.advance_to(&code, index + 1).await?)
                    }
                    _ => Ok(self.repository.mark_finished(&code).await?),
                }
            })
            .await?;

        self.state.update(|attachment| {
            if event == SessionEvent::NextQuestion {
                clear_answers(&mut attachment.players);
            }
            merge_patch(&mut attachment.game, patch);
        });

        info!(session = %code, phase = %next, "session advanced");
        Ok(next)
    }

    async fn leave_session(&self) -> SyncResult<()> {
        let Ok((code, player_id)) = self.state.read(|attachment| {
            (attachment.code().to_string(), attachment.player_id.clone())
        }) else {
            self.stop_listener();
            return Ok(());
        };

        if self.state.is_host() {
            self.repository.delete_session(&code).await?;
            info!(session = %code, "session torn down by host");
        } else {
            info!(session = %code, player = %player_id, "left session");
        }

        self.stop_listener();
        self.state.detach();
        Ok(())
    }

    fn apply_game_patch(&self, patch: serde_json::Map<String, Value>) {
        self.state
            .update(|attachment| merge_patch(&mut attachment.game, patch));
    }

    fn replace_own_row(&self, row: PlayerRecord) {
        self.state.update(|attachment| {
            if let Some(own) = attachment.own_player_mut() {
                *own = row;
            }
        });
    }
}

impl Drop for StoreSync {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

fn merge_patch(game: &mut GameRecord, patch: serde_json::Map<String, Value>) {
    if let Err(err) = game.merge(&Value::Object(patch)) {
        warn!(session = %game.id, error = %err, "failed to merge own session write");
    }
}

fn clear_answers(players: &mut [PlayerRecord]) {
    for player in players {
        player.current_answer = None;
        player.time_to_answer = None;
        player.answered_question = None;
    }
}

/// Merge a `games` row into the attachment unless it is older than the last-known record.
///
/// Returns whether the row was taken in.
fn merge_game_row(state: &ClientState, code: &str, row: &Value) -> bool {
    let mut merged = false;
    state.update(|attachment| {
        if attachment.game.is_stale(row) {
            return;
        }
        let before = merge::phase_of(&attachment.game);
        if let Err(err) = attachment.game.merge(row) {
            warn!(session = %code, error = %err, "ignoring malformed session update");
            return;
        }
        merged = true;
        // Answers are cleared before the question advances.
        let after = merge::phase_of(&attachment.game);
        if after != before && matches!(after, SessionPhase::Question { .. }) {
            clear_answers(&mut attachment.players);
        }
    });
    merged
}

/// Why [`follow_feeds`] stopped.
enum FeedEnd {
    /// The session is gone and the participant detached.
    Detached,
    /// A change feed ended while the session may still exist.
    Closed(&'static str),
}

/// Follow the change feeds until the session goes away.
///
/// A feed that ends is opened again, then the rows are re-read to cover the
/// gap. When the feeds cannot be reopened the participant detaches.
async fn follow_changes(
    state: Arc<ClientState>,
    repository: SessionRepository,
    code: SessionCode,
    mut feeds: ChangeFeeds,
) {
    debug!(session = %code, "following session changes");

    loop {
        let FeedEnd::Closed(feed) = follow_feeds(&state, &repository, &code, &mut feeds).await
        else {
            return;
        };
        warn!(session = %code, feed, "change feed closed; resubscribing");
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;

        match open_feeds(&repository, &code).await {
            Ok(reopened) => feeds = reopened,
            Err(err) => {
                warn!(session = %code, error = %err, "lost the session change feeds; detaching");
                state.detach();
                return;
            }
        }
        if !resync(&state, &repository, &code).await {
            return;
        }
    }
}

async fn follow_feeds(
    state: &ClientState,
    repository: &SessionRepository,
    code: &str,
    feeds: &mut ChangeFeeds,
) -> FeedEnd {
    loop {
        let keep_going = tokio::select! {
            change = feeds.game.next() => match change {
                Some(change) => on_game_change(state, repository, code, change).await,
                None => return FeedEnd::Closed("games"),
            },
            change = feeds.players.next() => match change {
                Some(change) if change.kind == ChangeKind::Resync => {
                    resync(state, repository, code).await
                }
                Some(_) => {
                    refresh_players(state, repository, code).await;
                    true
                }
                None => return FeedEnd::Closed("players"),
            },
        };
        if !keep_going {
            return FeedEnd::Detached;
        }
    }
}

/// Apply one `games` change. Returns `false` once the session is gone.
async fn on_game_change(
    state: &ClientState,
    repository: &SessionRepository,
    code: &str,
    change: ChangeEvent,
) -> bool {
    match change.kind {
        ChangeKind::Delete => {
            info!(session = %code, "session deleted; detaching");
            state.detach();
            false
        }
        ChangeKind::Resync => resync(state, repository, code).await,
        ChangeKind::Insert | ChangeKind::Update => {
            if merge_game_row(state, code, &change.row) {
                refresh_players(state, repository, code).await;
            }
            true
        }
    }
}

/// Re-read the session record and the players after missed changes.
///
/// Returns `false` when the session no longer exists.
async fn resync(state: &ClientState, repository: &SessionRepository, code: &str) -> bool {
    match repository.find_game(code).await {
        Ok(Some(game)) => {
            match serde_json::to_value(&game) {
                Ok(row) => {
                    merge_game_row(state, code, &row);
                }
                Err(err) => warn!(session = %code, error = %err, "failed to encode session record"),
            }
            refresh_players(state, repository, code).await;
            debug!(session = %code, "session resynchronised");
            true
        }
        Ok(None) => {
            info!(session = %code, "session disappeared while resynchronising; detaching");
            state.detach();
            false
        }
        Err(err) => {
            warn!(session = %code, error = %err, "failed to resynchronise session");
            true
        }
    }
}

/// Refetch the player list; on failure the last-known list stays in place.
async fn refresh_players(state: &ClientState, repository: &SessionRepository, code: &str) {
    match repository.list_players(code).await {
        Ok(players) => {
            state.update(|attachment| attachment.players = players);
        }
        Err(err) => warn!(session = %code, error = %err, "failed to refresh players"),
    }
}

impl SessionSync for StoreSync {
    fn create_session<'a>(&'a self, host_name: &'a str) -> BoxFuture<'a, SyncResult<SessionCode>> {
        Box::pin(self.create(host_name))
    }

    fn join_session<'a>(
        &'a self,
        code: &'a str,
        player_name: &'a str,
    ) -> BoxFuture<'a, SyncResult<()>> {
        Box::pin(self.join(code, player_name))
    }

    fn start_session(&self) -> BoxFuture<'_, SyncResult<SessionPhase>> {
        Box::pin(self.start())
    }

    fn submit_answer(
        &self,
        answer_index: usize,
        elapsed_seconds: f64,
    ) -> BoxFuture<'_, SyncResult<AnswerOutcome>> {
        Box::pin(self.submit(answer_index, elapsed_seconds))
    }

    fn reveal_results(&self, reason: CloseReason) -> BoxFuture<'_, SyncResult<bool>> {
        Box::pin(self.reveal(reason))
    }

    fn advance_phase(&self) -> BoxFuture<'_, SyncResult<SessionPhase>> {
        Box::pin(self.advance())
    }

    fn leave(&self) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(self.leave_session())
    }

    fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    fn snapshot(&self) -> Option<Session> {
        self.state.snapshot()
    }

    fn local_player_id(&self) -> Option<PlayerId> {
        self.state.player_id()
    }

    fn is_host(&self) -> bool {
        self.state.is_host()
    }
}
