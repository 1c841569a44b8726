mod common;

use std::{sync::Arc, time::Duration};

use quiz_arena::{
    dao::session_store::InMemorySessionStore,
    error::SyncError,
    services::{
        coordinator::{self, DEFAULT_GRACE_DELAY},
        sync::SyncBackend,
    },
    state::state_machine::{CloseReason, SessionPhase},
};

use common::{FlakyStore, lobby, wait_for_phase};

fn store_backend() -> SyncBackend {
    SyncBackend::Store(Arc::new(InMemorySessionStore::new()))
}

#[tokio::test(start_paused = true)]
async fn everyone_answering_reveals_after_the_grace_delay() {
    let (host, guests, _) = lobby(&store_backend(), 2).await;
    let _turns = coordinator::spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap();
    host.start_session().await.unwrap();

    host.submit_answer(2, 1.0).await.unwrap();
    for guest in &guests {
        wait_for_phase(guest, SessionPhase::Question { index: 0 }).await;
        guest.submit_answer(1, 2.0).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(host.snapshot().unwrap().phase, SessionPhase::Question { index: 0 });

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(host.snapshot().unwrap().phase, SessionPhase::Results { index: 0 });
    for guest in &guests {
        wait_for_phase(guest, SessionPhase::Results { index: 0 }).await;
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_reveals_with_silent_players_scoring_nothing() {
    let (host, guests, _) = lobby(&store_backend(), 2).await;
    let turns = coordinator::spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap();
    host.start_session().await.unwrap();

    let answering = &guests[0];
    wait_for_phase(answering, SessionPhase::Question { index: 0 }).await;
    answering.submit_answer(2, 5.0).await.unwrap();

    tokio::time::sleep(Duration::from_secs(14)).await;
    assert_eq!(host.snapshot().unwrap().phase, SessionPhase::Question { index: 0 });
    assert!(*turns.remaining().borrow() <= 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    wait_for_phase(&host, SessionPhase::Results { index: 0 }).await;
    let session = host.snapshot().unwrap();
    assert_eq!(session.players[&answering.local_player_id().unwrap()].score, 1333);
    assert_eq!(session.players[&guests[1].local_player_id().unwrap()].score, 0);
    assert_eq!(session.players[&host.local_player_id().unwrap()].score, 0);
}

#[tokio::test(start_paused = true)]
async fn manual_reveal_stops_the_countdown() {
    let (host, _guests, _) = lobby(&store_backend(), 1).await;
    let turns = coordinator::spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap();
    host.start_session().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(host.reveal_results(CloseReason::Manual).await.unwrap());
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert_eq!(host.snapshot().unwrap().phase, SessionPhase::Results { index: 0 });
    assert!(!turns.is_finished());
}

#[tokio::test(start_paused = true)]
async fn failed_close_is_reported_and_not_retried() {
    let store = FlakyStore::new();
    let backend = SyncBackend::Store(Arc::new(store.clone()));
    let (host, _guests, _) = lobby(&backend, 1).await;
    let mut turns = coordinator::spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap();
    host.start_session().await.unwrap();

    store.set_failing(true);
    tokio::time::sleep(Duration::from_secs(16)).await;

    let err = tokio::time::timeout(Duration::from_secs(1), turns.errors().recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(err, SyncError::Unavailable(_)));
    assert!(turns.errors().try_recv().is_err());
    assert_eq!(host.snapshot().unwrap().phase, SessionPhase::Question { index: 0 });
}

#[tokio::test(start_paused = true)]
async fn coordinator_stops_when_the_session_ends() {
    let (host, _guests, _) = lobby(&store_backend(), 1).await;
    let turns = coordinator::spawn(host.clone(), DEFAULT_GRACE_DELAY).unwrap();

    host.leave().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(turns.is_finished());
}
