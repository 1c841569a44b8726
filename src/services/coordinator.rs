//! Host-side driver closing questions when everyone answered or time ran out.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    error::{SyncError, SyncResult},
    services::{countdown::CountdownTimer, sync::SessionSync},
    state::{
        session::Session,
        state_machine::{CloseReason, SessionPhase},
    },
};

/// Delay between the last answer coming in and the results being revealed.
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_secs(1);

/// Handle on a running coordinator. Dropping it stops the coordinator.
pub struct CoordinatorHandle {
    remaining: watch::Receiver<u32>,
    errors: mpsc::UnboundedReceiver<SyncError>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Seconds left on the live question.
    pub fn remaining(&self) -> watch::Receiver<u32> {
        self.remaining.clone()
    }

    /// Failures of the closes the coordinator attempted. They are not retried.
    pub fn errors(&mut self) -> &mut mpsc::UnboundedReceiver<SyncError> {
        &mut self.errors
    }

    /// Whether the coordinator stopped, either shut down or because the session ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop coordinating.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start coordinating the session `sync` hosts.
pub fn spawn(sync: Arc<dyn SessionSync>, grace_delay: Duration) -> SyncResult<CoordinatorHandle> {
    if sync.snapshot().is_none() {
        return Err(SyncError::NoSession);
    }
    if !sync.is_host() {
        return Err(SyncError::NotHost("coordinate turns"));
    }

    let timer = CountdownTimer::new();
    let remaining = timer.watch();
    let (errors_tx, errors) = mpsc::unbounded_channel();
    let snapshots = sync.subscribe();

    let coordinator = Coordinator {
        sync,
        grace_delay,
        timer,
        errors: errors_tx,
        armed: None,
        expired: false,
        grace_deadline: None,
        closing_attempted: false,
    };
    let task = tokio::spawn(coordinator.run(snapshots));

    Ok(CoordinatorHandle {
        remaining,
        errors,
        task,
    })
}

struct Coordinator {
    sync: Arc<dyn SessionSync>,
    grace_delay: Duration,
    timer: CountdownTimer,
    errors: mpsc::UnboundedSender<SyncError>,
    /// Question the countdown is running for.
    armed: Option<usize>,
    expired: bool,
    grace_deadline: Option<Instant>,
    /// Set once a close was tried for the current snapshot; cleared by the next change.
    closing_attempted: bool,
}

impl Coordinator {
    async fn run(mut self, mut snapshots: watch::Receiver<Option<Session>>) {
        let (expiry_tx, mut expiry_rx) = mpsc::unbounded_channel::<usize>();

        loop {
            let Some(session) = snapshots.borrow_and_update().clone() else {
                info!("session ended; coordinator stopping");
                break;
            };

            if let Some(reason) = self.observe(&session, &expiry_tx) {
                self.close(reason).await;
            }

            let grace_deadline = self.grace_deadline;
            let grace_elapsed = sleep_until(grace_deadline.unwrap_or_else(Instant::now));
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.closing_attempted = false;
                }
                Some(index) = expiry_rx.recv() => {
                    if self.armed == Some(index) {
                        debug!(question = index, "question timed out");
                        self.expired = true;
                    }
                }
                _ = grace_elapsed, if grace_deadline.is_some() => {
                    self.grace_deadline = None;
                    self.close(CloseReason::AllAnswered).await;
                }
            }
        }

        self.timer.stop();
    }

    /// Track the phase of `session`, returning the close that is now due.
    fn observe(
        &mut self,
        session: &Session,
        expiry_tx: &mpsc::UnboundedSender<usize>,
    ) -> Option<CloseReason> {
        let SessionPhase::Question { index } = session.phase else {
            if self.armed.take().is_some() {
                self.timer.stop();
            }
            self.expired = false;
            self.grace_deadline = None;
            return None;
        };

        if self.armed != Some(index) {
            let limit = session
                .questions
                .get(index)
                .map(|question| question.time_limit_seconds)
                .unwrap_or_default();
            let expiry_tx = expiry_tx.clone();
            self.timer.start(limit, move || {
                let _ = expiry_tx.send(index);
            });
            debug!(session = %session.id, question = index, limit, "countdown armed");
            self.armed = Some(index);
            self.expired = false;
            self.grace_deadline = None;
            self.closing_attempted = false;
        }

        if self.expired {
            return Some(CloseReason::Timeout);
        }
        if !session.all_answered() {
            self.grace_deadline = None;
        } else if self.grace_deadline.is_none() && !self.closing_attempted {
            self.grace_deadline = Some(Instant::now() + self.grace_delay);
        }
        None
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.closing_attempted {
            return;
        }
        self.closing_attempted = true;

        match self.sync.reveal_results(reason).await {
            Ok(true) => info!(?reason, "question closed"),
            Ok(false) => debug!(?reason, "question already closed"),
            Err(err) => {
                warn!(?reason, error = %err, "failed to close the question");
                let _ = self.errors.send(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::default_questions,
        services::sync::{LocalHub, LocalSync, SyncSettings},
        state::state_machine::PlayerLimits,
    };

    fn settings() -> SyncSettings {
        SyncSettings {
            limits: PlayerLimits::default(),
            questions: default_questions(),
            transition_timeout: None,
        }
    }

    async fn started_pair() -> (Arc<dyn SessionSync>, Arc<dyn SessionSync>) {
        let hub = Arc::new(LocalHub::new());
        let host: Arc<dyn SessionSync> = Arc::new(LocalSync::new(hub.clone(), settings()));
        let guest: Arc<dyn SessionSync> = Arc::new(LocalSync::new(hub, settings()));
        let code = host.create_session("Ada").await.unwrap();
        guest.join_session(&code, "Bob").await.unwrap();
        host.start_session().await.unwrap();
        (host, guest)
    }

    fn phase(sync: &Arc<dyn SessionSync>) -> SessionPhase {
        sync.snapshot().map(|session| session.phase).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn all_answered_closes_after_the_grace_delay() {
        let (host, guest) = started_pair().await;
        let _handle = spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap();

        host.submit_answer(2, 2.0).await.unwrap();
        guest.submit_answer(0, 3.0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(phase(&host), SessionPhase::Question { index: 0 });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(phase(&host), SessionPhase::Results { index: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_closes_with_unanswered_players_at_zero() {
        let (host, guest) = started_pair().await;
        let handle = spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap();
        let mut remaining = handle.remaining();

        guest.submit_answer(2, 5.0).await.unwrap();
        remaining.wait_for(|left| *left == 10).await.unwrap();
        assert_eq!(phase(&host), SessionPhase::Question { index: 0 });

        tokio::time::sleep(Duration::from_secs(11)).await;
        let session = host.snapshot().unwrap();
        assert_eq!(session.phase, SessionPhase::Results { index: 0 });
        assert_eq!(session.players[&guest.local_player_id().unwrap()].score, 1333);
        assert_eq!(session.players[&host.local_player_id().unwrap()].score, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn next_question_rearms_the_countdown() {
        let (host, _guest) = started_pair().await;
        let handle = spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(phase(&host), SessionPhase::Results { index: 0 });
        assert_eq!(*handle.remaining().borrow(), 0);

        host.advance_phase().await.unwrap();
        let mut remaining = handle.remaining();
        remaining.wait_for(|left| *left == 15).await.unwrap();
        assert_eq!(phase(&host), SessionPhase::Question { index: 1 });
    }

    #[tokio::test]
    async fn only_the_host_coordinates() {
        let (_host, guest) = started_pair().await;
        assert!(matches!(
            spawn(guest, DEFAULT_GRACE_DELAY),
            Err(SyncError::NotHost(_))
        ));

        let detached: Arc<dyn SessionSync> = Arc::new(LocalSync::new(
            Arc::new(LocalHub::new()),
            settings(),
        ));
        assert!(matches!(
            spawn(detached, DEFAULT_GRACE_DELAY),
            Err(SyncError::NoSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_stops_closing() {
        let (host, _guest) = started_pair().await;
        drop(spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(phase(&host), SessionPhase::Question { index: 0 });
    }
}
