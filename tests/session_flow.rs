mod common;

use std::sync::Arc;

use quiz_arena::{
    dao::{
        models::{PlayerRecord, Table},
        repository::SessionRepository,
        session_store::{InMemorySessionStore, SessionStore},
    },
    error::SyncError,
    services::sync::{LocalHub, SessionSync, SyncBackend},
    state::{
        session::AnswerOutcome,
        state_machine::{CloseReason, SessionPhase},
    },
};

use common::{FlakyStore, lobby, settings, wait_detached, wait_for_phase, wait_until};

fn backends() -> Vec<(&'static str, SyncBackend)> {
    vec![
        ("local", SyncBackend::Local(Arc::new(LocalHub::new()))),
        ("store", SyncBackend::Store(Arc::new(InMemorySessionStore::new()))),
    ]
}

/// Plays every question: the host answers instantly and right, the first
/// guest answers wrong, the second answers right at the buzzer.
async fn play_to_the_end(backend: SyncBackend) {
    let (host, guests, _code) = lobby(&backend, 2).await;
    let everyone: Vec<Arc<dyn SessionSync>> =
        std::iter::once(host.clone()).chain(guests.iter().cloned()).collect();

    assert_eq!(
        host.start_session().await.unwrap(),
        SessionPhase::Question { index: 0 }
    );

    let question_count = host.snapshot().unwrap().questions.len();
    let mut previous_scores = vec![0u32; everyone.len()];
    let mut cycles = 0;

    loop {
        let session = host.snapshot().unwrap();
        let SessionPhase::Question { index } = session.phase else {
            panic!("expected a live question, got {}", session.phase);
        };
        let question = session.questions[index].clone();
        for participant in &everyone {
            wait_for_phase(participant, SessionPhase::Question { index }).await;
            wait_until(participant, |session| {
                session.players.values().all(|player| player.current_answer.is_none())
            })
            .await;
        }

        let correct = question.correct_option_index;
        let wrong = (correct + 1) % question.options.len();
        let limit = f64::from(question.time_limit_seconds);
        host.submit_answer(correct, 0.0).await.unwrap();
        guests[0].submit_answer(wrong, 1.0).await.unwrap();
        guests[1].submit_answer(correct, limit).await.unwrap();

        wait_until(&host, |session| session.all_answered()).await;
        assert!(host.reveal_results(CloseReason::AllAnswered).await.unwrap());
        assert!(!host.reveal_results(CloseReason::Timeout).await.unwrap());
        for participant in &everyone {
            wait_for_phase(participant, SessionPhase::Results { index }).await;
        }

        let session = host.snapshot().unwrap();
        let scores: Vec<u32> = everyone
            .iter()
            .map(|participant| session.players[&participant.local_player_id().unwrap()].score)
            .collect();
        for (now, before) in scores.iter().zip(&previous_scores) {
            assert!(now >= before, "scores never decrease");
        }
        assert_eq!(session.answer_distribution().iter().sum::<usize>(), 3);
        previous_scores = scores;
        cycles += 1;

        match host.advance_phase().await.unwrap() {
            SessionPhase::Question { index: next } => assert_eq!(next, index + 1),
            SessionPhase::Finished => break,
            other => panic!("unexpected phase {other}"),
        }
    }

    assert_eq!(cycles, question_count);
    for participant in &everyone {
        wait_for_phase(participant, SessionPhase::Finished).await;
    }
    assert_eq!(previous_scores, vec![1500 * 5, 0, 1000 * 5]);

    let session = host.snapshot().unwrap();
    let ranking: Vec<&str> = session
        .leaderboard()
        .iter()
        .map(|player| player.display_name.as_str())
        .collect();
    assert_eq!(ranking, vec!["Host", "Guest 1", "Guest 0"]);

    assert!(matches!(
        host.advance_phase().await,
        Err(SyncError::Precondition(_))
    ));
}

#[tokio::test]
async fn sessions_play_through_every_question() {
    for (name, backend) in backends() {
        eprintln!("backend: {name}");
        play_to_the_end(backend).await;
    }
}

#[tokio::test]
async fn second_answer_is_ignored() {
    for (_, backend) in backends() {
        let (host, guests, _) = lobby(&backend, 1).await;
        host.start_session().await.unwrap();
        let guest = &guests[0];
        wait_for_phase(guest, SessionPhase::Question { index: 0 }).await;

        let first = guest.submit_answer(2, 5.0).await.unwrap();
        assert_eq!(first, AnswerOutcome::Recorded { points: 1333, score: 1333 });
        let second = guest.submit_answer(0, 1.0).await.unwrap();
        assert_eq!(second, AnswerOutcome::AlreadyAnswered);

        let guest_id = guest.local_player_id().unwrap();
        wait_until(&host, |session| session.players[&guest_id].current_answer.is_some()).await;
        let player = &host.snapshot().unwrap().players[&guest_id];
        assert_eq!(player.score, 1333);
        assert_eq!(player.current_answer, Some(2));
        assert_eq!(player.answer_latency_seconds, Some(5.0));
    }
}

#[tokio::test]
async fn joins_after_start_change_nothing() {
    let store = Arc::new(InMemorySessionStore::new());
    let backend = SyncBackend::Store(store.clone());
    let (host, _guests, code) = lobby(&backend, 1).await;
    host.start_session().await.unwrap();

    let late = backend.participant(settings());
    assert!(matches!(
        late.join_session(&code, "Late").await,
        Err(SyncError::AlreadyStarted(_))
    ));
    assert!(late.snapshot().is_none());

    let players = SessionRepository::new(store).list_players(&code).await.unwrap();
    assert_eq!(players.len(), 2);

    let hub = Arc::new(LocalHub::new());
    let backend = SyncBackend::Local(hub);
    let (host, _guests, code) = lobby(&backend, 1).await;
    host.start_session().await.unwrap();
    assert!(matches!(
        backend.participant(settings()).join_session(&code, "Late").await,
        Err(SyncError::AlreadyStarted(_))
    ));
    assert_eq!(host.snapshot().unwrap().players.len(), 2);
}

#[tokio::test]
async fn unknown_and_malformed_codes_are_rejected() {
    for (_, backend) in backends() {
        let participant = backend.participant(settings());
        assert!(matches!(
            participant.join_session("ZZZ999", "Ada").await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            participant.join_session("nope", "Ada").await,
            Err(SyncError::InvalidInput(_))
        ));
    }
}

#[tokio::test]
async fn guests_cannot_drive_the_session() {
    for (_, backend) in backends() {
        let (host, guests, _) = lobby(&backend, 1).await;
        let guest = &guests[0];
        assert!(!guest.is_host());
        assert!(matches!(guest.start_session().await, Err(SyncError::NotHost(_))));

        host.start_session().await.unwrap();
        wait_for_phase(guest, SessionPhase::Question { index: 0 }).await;
        assert!(matches!(
            guest.reveal_results(CloseReason::Manual).await,
            Err(SyncError::NotHost(_))
        ));
        assert!(matches!(guest.advance_phase().await, Err(SyncError::NotHost(_))));
    }
}

#[tokio::test]
async fn out_of_range_answers_are_rejected() {
    for (_, backend) in backends() {
        let (host, _guests, _) = lobby(&backend, 1).await;
        assert!(matches!(
            host.submit_answer(0, 1.0).await,
            Err(SyncError::Precondition(_))
        ));

        host.start_session().await.unwrap();
        assert!(matches!(
            host.submit_answer(9, 1.0).await,
            Err(SyncError::InvalidInput(_))
        ));
        assert!(matches!(
            host.submit_answer(0, f64::NAN).await,
            Err(SyncError::InvalidInput(_))
        ));
    }
}

#[tokio::test]
async fn host_leaving_ends_the_session_for_everyone() {
    for (name, backend) in backends() {
        let (host, guests, code) = lobby(&backend, 2).await;
        host.leave().await.unwrap();

        for guest in &guests {
            wait_detached(guest).await;
            assert!(guest.local_player_id().is_none(), "{name}");
        }
        assert!(matches!(
            backend.participant(settings()).join_session(&code, "Ada").await,
            Err(SyncError::NotFound(_))
        ));

        if let SyncBackend::Store(store) = backend {
            let repository = SessionRepository::new(store);
            assert!(repository.list_players(&code).await.unwrap().is_empty());
            assert!(repository.list_questions(&code).await.unwrap().is_empty());
        }
    }
}

#[tokio::test]
async fn guest_leaving_keeps_the_session() {
    for (_, backend) in backends() {
        let (host, guests, _) = lobby(&backend, 1).await;
        guests[0].leave().await.unwrap();
        assert!(guests[0].snapshot().is_none());
        assert!(host.snapshot().is_some());
        assert!(host.is_host());
    }
}

#[tokio::test]
async fn answers_are_frozen_once_results_show() {
    for (name, backend) in backends() {
        let (host, guests, _) = lobby(&backend, 1).await;
        host.start_session().await.unwrap();
        let guest = &guests[0];
        wait_for_phase(guest, SessionPhase::Question { index: 0 }).await;

        host.submit_answer(2, 1.0).await.unwrap();
        assert!(host.reveal_results(CloseReason::Manual).await.unwrap());
        wait_for_phase(guest, SessionPhase::Results { index: 0 }).await;

        assert!(
            matches!(guest.submit_answer(2, 5.0).await, Err(SyncError::Precondition(_))),
            "{name}"
        );
        let session = host.snapshot().unwrap();
        assert_eq!(session.answer_distribution().iter().sum::<usize>(), 1, "{name}");
        let guest_id = guest.local_player_id().unwrap();
        assert_eq!(session.players[&guest_id].current_answer, None, "{name}");
        assert_eq!(session.players[&guest_id].score, 0, "{name}");
    }
}

#[tokio::test]
async fn answer_from_a_lagging_snapshot_does_not_reach_the_next_question() {
    let store = FlakyStore::new();
    let backend = SyncBackend::Store(Arc::new(store.clone()));
    let (host, guests, _) = lobby(&backend, 1).await;
    let guest = &guests[0];
    let guest_id = guest.local_player_id().unwrap();
    host.start_session().await.unwrap();
    wait_for_phase(guest, SessionPhase::Question { index: 0 }).await;

    store.hold_feeds(true);
    assert!(host.reveal_results(CloseReason::Manual).await.unwrap());
    assert_eq!(guest.snapshot().unwrap().phase, SessionPhase::Question { index: 0 });

    // The stored record wins over the guest's stale view.
    assert!(matches!(
        guest.submit_answer(2, 5.0).await,
        Err(SyncError::Precondition(_))
    ));
    assert_eq!(guest.snapshot().unwrap().phase, SessionPhase::Results { index: 0 });

    assert_eq!(
        host.advance_phase().await.unwrap(),
        SessionPhase::Question { index: 1 }
    );
    // A write for question 0 that lands after the answers were cleared.
    SessionRepository::new(Arc::new(store.clone()))
        .record_answer(&guest_id, 0, 2, 5.0, 0)
        .await
        .unwrap();
    store.hold_feeds(false);

    wait_for_phase(guest, SessionPhase::Question { index: 1 }).await;
    wait_until(&host, |session| {
        session.phase == SessionPhase::Question { index: 1 }
            && session.players[&guest_id].current_answer.is_none()
    })
    .await;
    assert!(!host.snapshot().unwrap().all_answered());

    let question = guest.snapshot().unwrap().questions[1].clone();
    let outcome = guest
        .submit_answer(question.correct_option_index, 0.0)
        .await
        .unwrap();
    assert_eq!(outcome, AnswerOutcome::Recorded { points: 1500, score: 1500 });
    wait_until(&host, |session| {
        session.players[&guest_id].current_answer == Some(question.correct_option_index)
    })
    .await;
}

#[tokio::test]
async fn lagging_participant_catches_up_after_missed_changes() {
    let store = Arc::new(InMemorySessionStore::new());
    let backend = SyncBackend::Store(store.clone());
    let (host, guests, code) = lobby(&backend, 1).await;
    let guest = &guests[0];
    host.start_session().await.unwrap();
    wait_for_phase(guest, SessionPhase::Question { index: 0 }).await;

    assert!(host.reveal_results(CloseReason::Manual).await.unwrap());
    // Enough unrelated traffic to overflow every subscriber's buffer.
    for n in 0..1100 {
        let row = PlayerRecord::new(format!("noise-{n}"), "ZZZ999".into(), format!("Noise {n}"));
        store
            .insert(Table::Players, serde_json::to_value(&row).unwrap())
            .await
            .unwrap();
    }

    wait_for_phase(guest, SessionPhase::Results { index: 0 }).await;
    assert_eq!(host.advance_phase().await.unwrap(), SessionPhase::Question { index: 1 });
    wait_for_phase(guest, SessionPhase::Question { index: 1 }).await;

    let players = SessionRepository::new(store).list_players(&code).await.unwrap();
    assert_eq!(players.len(), 2);
}
